//! Group inheritance resolution and external group mapping.
//!
//! The group graph is walked depth-first with explicit in-progress / done
//! marks and an explicit frame stack, so a cycle is reported with the exact
//! back-edge path instead of overflowing the call stack. Inheritance is
//! additive: a group's effective permissions are the union of every parent's
//! effective permissions and its own.
//!
//! Flattened permissions for a combination of groups are cached in a
//! [`HotCache`] keyed by the sorted group ids; the cache is dropped whenever
//! the group configuration is reloaded.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hub_store::HotCache;
use tracing::{debug, info, instrument, warn};

use crate::error::{AccessError, Result};
use crate::group::{Group, GroupsDocument, Permissions};

/// Group every unmapped or unauthenticated principal falls back to.
pub const ANONYMOUS_GROUP: &str = "anonymous";

const PERMISSION_CACHE_CAPACITY: u64 = 1_024;
const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// A fully resolved group configuration.
///
/// Every group's `permissions` field holds its inheritance-flattened set.
#[derive(Debug, Clone, Default)]
pub struct ResolvedGroups {
    groups: BTreeMap<String, Group>,
    mapping_index: HashMap<String, Vec<String>>,
}

impl ResolvedGroups {
    pub fn get(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Internal group ids an external group name maps to.
    pub fn mapped(&self, external: &str) -> &[String] {
        self.mapping_index
            .get(external)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Flatten the inheritance graph of `doc`.
///
/// # Errors
///
/// Returns [`AccessError::ConfigurationCycle`] when a group reaches itself
/// through `inherits` (self-inheritance included) and
/// [`AccessError::UnknownParentGroup`] for a dangling parent reference.
pub fn resolve_inheritance(doc: &GroupsDocument) -> Result<ResolvedGroups> {
    let groups = &doc.groups;
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(groups.len());
    let mut flattened: HashMap<&str, Permissions> = HashMap::with_capacity(groups.len());

    for root in groups.keys() {
        if marks.contains_key(root.as_str()) {
            continue;
        }
        marks.insert(root, Mark::InProgress);
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];

        while let Some(frame) = stack.last_mut() {
            let id = frame.0;
            let group = &groups[id];

            if let Some(parent) = group.inherits.get(frame.1) {
                frame.1 += 1;
                let parent = parent.as_str();
                match marks.get(parent).copied() {
                    Some(Mark::Done) => {}
                    Some(Mark::InProgress) => {
                        let start = stack.iter().position(|(g, _)| *g == parent).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[start..].iter().map(|(g, _)| (*g).to_string()).collect();
                        path.push(parent.to_string());
                        warn!(cycle = %path.join(" -> "), "group inheritance cycle");
                        return Err(AccessError::ConfigurationCycle { path });
                    }
                    None => {
                        if !groups.contains_key(parent) {
                            return Err(AccessError::UnknownParentGroup {
                                group: id.to_string(),
                                parent: parent.to_string(),
                            });
                        }
                        marks.insert(parent, Mark::InProgress);
                        stack.push((parent, 0));
                    }
                }
                continue;
            }

            // Every parent is done: parents first, own grants on top.
            let mut perms = Permissions::default();
            for parent in &group.inherits {
                if let Some(inherited) = flattened.get(parent.as_str()) {
                    perms.merge(inherited);
                }
            }
            perms.merge(&group.permissions);
            flattened.insert(id, perms);
            marks.insert(id, Mark::Done);
            stack.pop();
        }
    }

    let mut resolved = ResolvedGroups::default();
    for (id, group) in groups {
        let mut group = group.clone();
        if group.id.is_empty() {
            group.id = id.clone();
        }
        if let Some(perms) = flattened.remove(id.as_str()) {
            group.permissions = perms;
        }
        for external in &group.mappings {
            resolved
                .mapping_index
                .entry(external.clone())
                .or_default()
                .push(id.clone());
        }
        resolved.groups.insert(id.clone(), group);
    }

    debug!(
        groups = resolved.groups.len(),
        mappings = resolved.mapping_index.len(),
        "group inheritance resolved"
    );
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Shared, reloadable view over the resolved group configuration.
pub struct GroupPermissionResolver {
    state: RwLock<Arc<ResolvedGroups>>,
    cache: HotCache<Permissions>,
}

impl GroupPermissionResolver {
    /// Resolve `doc` and build a resolver over it. Fails fast on a broken graph.
    pub fn new(doc: &GroupsDocument) -> Result<Self> {
        let resolved = resolve_inheritance(doc)?;
        info!(groups = resolved.len(), "group permission resolver ready");
        Ok(Self {
            state: RwLock::new(Arc::new(resolved)),
            cache: HotCache::new("permissions", PERMISSION_CACHE_CAPACITY, PERMISSION_CACHE_TTL),
        })
    }

    /// Swap in a new group configuration.
    ///
    /// On error the previous resolution stays active and the error is
    /// returned to the caller.
    pub fn reload(&self, doc: &GroupsDocument) -> Result<()> {
        let resolved = match resolve_inheritance(doc) {
            Ok(r) => r,
            Err(err) => {
                warn!(%err, "group reload rejected, keeping previous configuration");
                return Err(err);
            }
        };
        let count = resolved.len();
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(resolved);
        self.cache.invalidate_all();
        info!(groups = count, "group configuration reloaded");
        Ok(())
    }

    /// Current resolved configuration.
    pub fn snapshot(&self) -> Arc<ResolvedGroups> {
        Arc::clone(&self.state.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// A single resolved group.
    pub fn group(&self, id: &str) -> Option<Group> {
        self.snapshot().get(id).cloned()
    }

    /// Ids of every group whose resolved permissions grant admin access.
    pub fn admin_groups(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|g| g.permissions.admin_access)
            .map(|g| g.id.clone())
            .collect()
    }

    /// Map external identity-provider group names to internal group ids.
    ///
    /// Unmapped names are dropped. When nothing maps, the result is the
    /// single fallback group [`ANONYMOUS_GROUP`].
    pub fn map_external_groups<S: AsRef<str>>(&self, external: &[S]) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut mapped: BTreeSet<String> = BTreeSet::new();
        for name in external {
            let name = name.as_ref();
            let targets = snapshot.mapped(name);
            if targets.is_empty() {
                debug!(external_group = name, "no mapping for external group");
                continue;
            }
            mapped.extend(targets.iter().cloned());
        }

        if mapped.is_empty() {
            debug!(count = external.len(), "no external groups mapped, using anonymous");
            return vec![ANONYMOUS_GROUP.to_string()];
        }
        mapped.into_iter().collect()
    }

    /// Union of the resolved permissions of every listed group.
    ///
    /// Unknown group ids are skipped. A wildcard in any group turns that
    /// resource kind into wildcard-all.
    #[instrument(skip(self, groups), fields(groups = groups.len()))]
    pub async fn permissions_for_user<S: AsRef<str>>(&self, groups: &[S]) -> Permissions {
        let mut ids: Vec<&str> = groups.iter().map(AsRef::as_ref).collect();
        ids.sort_unstable();
        ids.dedup();
        let key = permission_cache_key(&ids);

        if let Some(hit) = self.cache.get(&key).await {
            return hit;
        }

        let snapshot = self.snapshot();
        let mut perms = Permissions::default();
        for id in &ids {
            match snapshot.get(id) {
                Some(group) => perms.merge(&group.permissions),
                None => debug!(group = *id, "skipping unknown group"),
            }
        }

        self.cache.insert(key, perms.clone()).await;
        perms
    }

    /// Whether any of `groups` grants admin access.
    pub async fn is_admin<S: AsRef<str>>(&self, groups: &[S]) -> bool {
        self.permissions_for_user(groups).await.admin_access
    }

    /// Hit/miss figures of the permission cache.
    pub fn cache_stats(&self) -> &hub_store::CacheStats {
        self.cache.stats()
    }
}

/// Length-prefixed so ids containing any separator cannot collide.
fn permission_cache_key(sorted_ids: &[&str]) -> String {
    sorted_ids
        .iter()
        .map(|id| format!("{}:{id}", id.len()))
        .collect()
}

impl std::fmt::Debug for GroupPermissionResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPermissionResolver")
            .field("groups", &self.snapshot().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json: &str) -> GroupsDocument {
        GroupsDocument::from_json(json).unwrap()
    }

    fn sample() -> GroupsDocument {
        doc(r#"{ "groups": {
            "anonymous":     { "permissions": { "apps": ["welcome"] } },
            "authenticated": { "inherits": ["anonymous"], "permissions": { "apps": ["chat"] } },
            "users":         { "inherits": ["authenticated"], "mappings": ["Hub-Users", "Staff"],
                               "permissions": { "models": ["gpt-4"] } },
            "admins":        { "inherits": ["users"], "mappings": ["Hub-Admins"],
                               "permissions": { "apps": ["*"], "adminAccess": true } },
            "staff":         { "mappings": ["Staff"], "permissions": { "prompts": ["faq"] } }
        } }"#)
    }

    #[test]
    fn child_unions_parent_permissions() {
        let d = doc(r#"{ "groups": {
            "A": { "permissions": { "apps": ["x"] } },
            "B": { "inherits": ["A"], "permissions": { "apps": ["y"] } }
        } }"#);
        let r = resolve_inheritance(&d).unwrap();
        let b = &r.get("B").unwrap().permissions;
        let apps: Vec<String> = b.apps.clone().into();
        assert_eq!(apps, vec!["x", "y"]);
    }

    #[test]
    fn wildcard_in_ancestor_wins() {
        let r = resolve_inheritance(&sample()).unwrap();
        let admins = &r.get("admins").unwrap().permissions;
        assert!(admins.apps.is_all());
        assert!(admins.can_access_model("gpt-4"));
        assert!(admins.admin_access);
        assert!(!r.get("users").unwrap().permissions.admin_access);
    }

    #[test]
    fn two_node_cycle_is_reported() {
        let d = doc(r#"{ "groups": {
            "A": { "inherits": ["B"] },
            "B": { "inherits": ["A"] }
        } }"#);
        match resolve_inheritance(&d) {
            Err(AccessError::ConfigurationCycle { path }) => {
                assert_eq!(path, vec!["A", "B", "A"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_inheritance_is_a_cycle() {
        let d = doc(r#"{ "groups": { "A": { "inherits": ["A"] } } }"#);
        assert!(matches!(
            resolve_inheritance(&d),
            Err(AccessError::ConfigurationCycle { .. })
        ));
    }

    #[test]
    fn cycle_below_acyclic_prefix() {
        let d = doc(r#"{ "groups": {
            "root": { "inherits": ["mid"] },
            "mid":  { "inherits": ["x"] },
            "x":    { "inherits": ["y"] },
            "y":    { "inherits": ["x"] }
        } }"#);
        match resolve_inheritance(&d) {
            Err(AccessError::ConfigurationCycle { path }) => assert_eq!(path, vec!["x", "y", "x"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let d = doc(r#"{ "groups": {
            "base":  { "permissions": { "apps": ["b"] } },
            "left":  { "inherits": ["base"] },
            "right": { "inherits": ["base"] },
            "top":   { "inherits": ["left", "right"] }
        } }"#);
        let r = resolve_inheritance(&d).unwrap();
        assert!(r.get("top").unwrap().permissions.can_access_app("b"));
    }

    #[test]
    fn unknown_parent_is_fatal() {
        let d = doc(r#"{ "groups": { "A": { "inherits": ["ghost"] } } }"#);
        let err = resolve_inheritance(&d).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, AccessError::UnknownParentGroup { ref parent, .. } if parent == "ghost"));
    }

    #[test]
    fn external_groups_map_many_to_many() {
        let resolver = GroupPermissionResolver::new(&sample()).unwrap();
        let mapped = resolver.map_external_groups(&["Staff", "Unknown"]);
        assert_eq!(mapped, vec!["staff", "users"]);
    }

    #[test]
    fn nothing_mapped_falls_back_to_anonymous() {
        let resolver = GroupPermissionResolver::new(&sample()).unwrap();
        assert_eq!(resolver.map_external_groups(&["Nope"]), vec![ANONYMOUS_GROUP]);
        let empty: [&str; 0] = [];
        assert_eq!(resolver.map_external_groups(&empty), vec![ANONYMOUS_GROUP]);
    }

    #[tokio::test]
    async fn user_permissions_union_and_skip_unknown() {
        let resolver = GroupPermissionResolver::new(&sample()).unwrap();
        let perms = resolver
            .permissions_for_user(&["users", "staff", "missing"])
            .await;
        assert!(perms.can_access_app("welcome"));
        assert!(perms.can_access_app("chat"));
        assert!(perms.can_access_prompt("faq"));
        assert!(!perms.can_access_workflow("anything"));
        assert!(!perms.admin_access);

        // Same set in another order hits the cache.
        resolver.permissions_for_user(&["staff", "users", "missing"]).await;
        assert_eq!(resolver.cache_stats().hits(), 1);
    }

    #[tokio::test]
    async fn group_ids_with_separators_do_not_share_cache_entries() {
        let d = doc(r#"{ "groups": {
            "a|b": { "permissions": { "apps": ["piped"] } },
            "a":   { "permissions": { "apps": ["first"] } },
            "b":   { "permissions": { "adminAccess": true } }
        } }"#);
        let resolver = GroupPermissionResolver::new(&d).unwrap();

        let pair = resolver.permissions_for_user(&["a", "b"]).await;
        assert!(pair.admin_access);
        let piped = resolver.permissions_for_user(&["a|b"]).await;
        assert!(!piped.admin_access);
        assert!(piped.can_access_app("piped"));
        assert!(!piped.can_access_app("first"));
        assert_eq!(resolver.cache_stats().hits(), 0);

        assert_ne!(permission_cache_key(&["a:b"]), permission_cache_key(&["a", "b"]));
        assert_ne!(permission_cache_key(&["1:a"]), permission_cache_key(&["a"]));
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_state() {
        let resolver = GroupPermissionResolver::new(&sample()).unwrap();
        let bad = doc(r#"{ "groups": { "A": { "inherits": ["A"] } } }"#);
        assert!(resolver.reload(&bad).is_err());
        assert!(resolver.group("admins").is_some());
        assert_eq!(resolver.admin_groups(), vec!["admins"]);
    }

    #[tokio::test]
    async fn reload_invalidates_cached_permissions() {
        let resolver = GroupPermissionResolver::new(&sample()).unwrap();
        assert!(!resolver.is_admin(&["users"]).await);

        let promoted = doc(r#"{ "groups": { "users": { "permissions": { "adminAccess": true } } } }"#);
        resolver.reload(&promoted).unwrap();
        assert!(resolver.is_admin(&["users"]).await);
    }
}
