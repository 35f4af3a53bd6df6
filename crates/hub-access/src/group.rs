//! Group and permission types as they appear in `groups.json`.
//!
//! ```json
//! { "groups": {
//!     "users":  { "inherits": ["authenticated"], "mappings": ["Hub-Users"],
//!                 "permissions": { "apps": ["chat"], "models": ["*"] } },
//!     "admins": { "inherits": ["users"], "permissions": { "adminAccess": true } } } }
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The wildcard entry granting every resource of a kind.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// ResourceSet
// ---------------------------------------------------------------------------

/// A set of resource ids, or every resource.
///
/// Serialised as a JSON list; a list containing `"*"` becomes [`ResourceSet::All`]
/// and absorbs every other member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub enum ResourceSet {
    All,
    Only(BTreeSet<String>),
}

impl Default for ResourceSet {
    fn default() -> Self {
        Self::Only(BTreeSet::new())
    }
}

impl From<Vec<String>> for ResourceSet {
    fn from(ids: Vec<String>) -> Self {
        if ids.iter().any(|id| id == WILDCARD) {
            Self::All
        } else {
            Self::Only(ids.into_iter().collect())
        }
    }
}

impl From<ResourceSet> for Vec<String> {
    fn from(set: ResourceSet) -> Self {
        match set {
            ResourceSet::All => vec![WILDCARD.to_string()],
            ResourceSet::Only(ids) => ids.into_iter().collect(),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for ResourceSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().map(Into::into).collect::<Vec<String>>().into()
    }
}

impl ResourceSet {
    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Only(ids) if ids.is_empty())
    }

    pub fn contains(&self, id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(ids) => ids.contains(id),
        }
    }

    /// Union `other` into `self`. Once either side is `All`, the result is `All`.
    pub fn union_with(&mut self, other: &ResourceSet) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (_, Self::All) => *self = Self::All,
            (Self::Only(mine), Self::Only(theirs)) => mine.extend(theirs.iter().cloned()),
        }
    }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Resource grants attached to a group, or the flattened result for a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Permissions {
    pub apps: ResourceSet,
    pub prompts: ResourceSet,
    pub models: ResourceSet,
    pub workflows: ResourceSet,
    pub admin_access: bool,
}

impl Permissions {
    /// Additive merge: nothing in `other` can remove a grant from `self`.
    pub fn merge(&mut self, other: &Permissions) {
        self.apps.union_with(&other.apps);
        self.prompts.union_with(&other.prompts);
        self.models.union_with(&other.models);
        self.workflows.union_with(&other.workflows);
        self.admin_access |= other.admin_access;
    }

    pub fn can_access_app(&self, id: &str) -> bool {
        self.apps.contains(id)
    }

    pub fn can_access_model(&self, id: &str) -> bool {
        self.models.contains(id)
    }

    pub fn can_access_prompt(&self, id: &str) -> bool {
        self.prompts.contains(id)
    }

    pub fn can_access_workflow(&self, id: &str) -> bool {
        self.workflows.contains(id)
    }
}

// ---------------------------------------------------------------------------
// Group configuration
// ---------------------------------------------------------------------------

/// One group as declared in configuration (before inheritance is applied).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    /// Filled from the map key when absent in the file.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Parent group ids whose permissions this group inherits.
    #[serde(default)]
    pub inherits: Vec<String>,
    /// External identity-provider group names that map onto this group.
    #[serde(default)]
    pub mappings: Vec<String>,
    #[serde(default)]
    pub permissions: Permissions,
}

/// The `groups.json` document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupsDocument {
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
}

impl GroupsDocument {
    /// Parse the document and fill missing ids from map keys.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        let mut doc: Self = serde_json::from_str(text)?;
        doc.normalize();
        Ok(doc)
    }

    pub fn normalize(&mut self) {
        for (key, group) in &mut self.groups {
            if group.id.is_empty() {
                group.id = key.clone();
            }
            if group.name.is_empty() {
                group.name = key.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_absorbs_members() {
        let set: ResourceSet = vec!["chat".to_string(), "*".to_string()].into();
        assert_eq!(set, ResourceSet::All);
        let out: Vec<String> = set.into();
        assert_eq!(out, vec!["*"]);
    }

    #[test]
    fn union_is_additive() {
        let mut a: ResourceSet = ["x"].into_iter().collect();
        a.union_with(&["y"].into_iter().collect());
        assert!(a.contains("x") && a.contains("y"));
        assert!(!a.contains("z"));

        a.union_with(&ResourceSet::All);
        assert!(a.is_all());
        a.union_with(&["q"].into_iter().collect());
        assert!(a.is_all());
    }

    #[test]
    fn permissions_parse_with_defaults() {
        let json = r#"{ "apps": ["chat"], "adminAccess": true }"#;
        let perms: Permissions = serde_json::from_str(json).unwrap();
        assert!(perms.can_access_app("chat"));
        assert!(perms.models.is_empty());
        assert!(perms.admin_access);
    }

    #[test]
    fn document_fills_ids_from_keys() {
        let json = r#"{ "groups": { "users": { "inherits": ["authenticated"] } } }"#;
        let doc = GroupsDocument::from_json(json).unwrap();
        let users = &doc.groups["users"];
        assert_eq!(users.id, "users");
        assert_eq!(users.name, "users");
        assert_eq!(users.inherits, vec!["authenticated"]);
    }
}
