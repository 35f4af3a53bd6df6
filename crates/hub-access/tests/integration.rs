//! Integration tests for the hub-access crate.
//!
//! These run the admin bootstrap and login path against a contents
//! directory and a user file in a temp directory.

use std::sync::Arc;

use hub_access::{
    AuthMethod, ConfigCache, ExternalUser, FileConfigCache, User, UserManager, UserStore,
};
use hub_store::system_clock;

const GROUPS: &str = r#"{ "groups": {
    "anonymous":     { "permissions": { "apps": ["welcome"] } },
    "authenticated": { "inherits": ["anonymous"], "permissions": { "apps": ["chat"] } },
    "users":         { "inherits": ["authenticated"], "permissions": { "models": ["gpt-4"] } },
    "admins":        { "inherits": ["users"], "permissions": { "apps": ["*"], "adminAccess": true } }
} }"#;

const PLATFORM: &str = r#"{
    "auth": { "mode": "local" },
    "localAuth": { "enabled": true, "allowSelfSignup": true, "defaultGroups": ["users"] }
}"#;

struct Fixture {
    _dir: tempfile::TempDir,
    config: Arc<FileConfigCache>,
    manager: UserManager,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let contents = dir.path().join("contents");
    std::fs::create_dir_all(&contents).unwrap();
    std::fs::write(contents.join("groups.json"), GROUPS).unwrap();
    std::fs::write(contents.join("platform.json"), PLATFORM).unwrap();

    let config = Arc::new(FileConfigCache::load(&contents).await.unwrap());
    let users = UserStore::new(dir.path().join("users.json"), system_clock());
    let shared: Arc<dyn ConfigCache> = config.clone();
    let manager = UserManager::new(users, config.resolver(), shared);
    Fixture {
        _dir: dir,
        config,
        manager,
    }
}

fn local(name: &str) -> ExternalUser {
    ExternalUser::new(AuthMethod::Local, name)
}

// ═══════════════════════════════════════════════════════════════════════
//  Admin bootstrap
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn first_user_becomes_admin_second_does_not() {
    let fx = fixture().await;
    let rescue = fx.manager.rescue();
    assert!(!rescue.has_any_admin().await.unwrap());

    let first = fx
        .manager
        .validate_and_persist_external_user(&local("first"))
        .await
        .unwrap();
    assert!(first.is_admin());
    assert!(rescue.has_any_admin().await.unwrap());

    let second = fx
        .manager
        .validate_and_persist_external_user(&local("second"))
        .await
        .unwrap();
    assert!(!second.is_admin());

    let stored = fx.manager.find_user_by_identifier("second").await.unwrap().unwrap();
    assert!(stored.internal_groups.is_empty());
}

#[tokio::test]
async fn last_admin_detection() {
    let fx = fixture().await;
    let users = fx.manager.users();
    let rescue = fx.manager.rescue();

    let mut a = User::new("a", users.now());
    a.internal_groups = vec!["admins".into()];
    let a = users.save(a).await.unwrap();
    assert!(rescue.is_last_admin(&a.id).await.unwrap());

    let mut b = User::new("b", users.now());
    b.internal_groups = vec!["admins".into()];
    let b = users.save(b).await.unwrap();
    assert!(!rescue.is_last_admin(&a.id).await.unwrap());
    assert!(!rescue.is_last_admin(&b.id).await.unwrap());

    users.update(&b.id, |u| u.active = false).await.unwrap();
    assert!(rescue.is_last_admin(&a.id).await.unwrap());
    assert!(!rescue.is_last_admin(&b.id).await.unwrap());
}

// ═══════════════════════════════════════════════════════════════════════
//  Permissions
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn session_permissions_follow_inheritance() {
    let fx = fixture().await;

    // Seed an admin so the login below is not promoted.
    let users = fx.manager.users();
    let mut admin = User::new("root", users.now());
    admin.internal_groups = vec!["admins".into()];
    users.save(admin).await.unwrap();

    let session = fx
        .manager
        .validate_and_persist_external_user(&local("member"))
        .await
        .unwrap();
    assert_eq!(session.groups, vec!["authenticated", "users"]);
    assert!(session.permissions.can_access_app("welcome"));
    assert!(session.permissions.can_access_app("chat"));
    assert!(!session.permissions.can_access_app("billing"));
    assert!(session.permissions.can_access_model("gpt-4"));
}

#[tokio::test]
async fn reload_picks_up_new_grants() {
    let fx = fixture().await;
    let resolver = fx.config.resolver();
    assert!(!resolver.permissions_for_user(&["users"]).await.can_access_workflow("etl"));

    let updated = GROUPS.replace(
        r#""models": ["gpt-4"]"#,
        r#""models": ["gpt-4"], "workflows": ["etl"]"#,
    );
    std::fs::write(fx.config.dir().join("groups.json"), updated).unwrap();
    fx.config.reload().await.unwrap();

    assert!(resolver.permissions_for_user(&["users"]).await.can_access_workflow("etl"));
}
