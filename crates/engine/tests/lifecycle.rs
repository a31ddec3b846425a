mod common;

use std::sync::atomic::Ordering;

use assert_matches::assert_matches;
use common::{TestEnv, OU_OTHER, OU_TEST};
use soon_core::error::CoreError;
use soon_core::types::GpoId;
use soon_core::version::GpoVersion;
use soon_directory::DirectoryStore;
use soon_sysvol::TemplateStore;

#[tokio::test]
async fn create_builds_both_stores_at_version_zero() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", None).await.unwrap();

    assert_eq!(gpo.display_name, "Test");
    assert_eq!(gpo.version, 0);
    assert!(gpo.links.is_empty());
    assert!(gpo.scripts.logon.is_empty());
    assert_eq!(gpo.template_path, env.root.path().join(gpo.id.to_string()));
    assert!(gpo.template_path.join("GPT.INI").is_file());
    assert!(gpo.file_sys_path.ends_with(&format!(r"\Policies\{}", gpo.id)));
    assert_eq!(env.assert_consistent(&gpo.id).await, GpoVersion::INITIAL);
}

#[tokio::test]
async fn create_with_container_links_it() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", Some(OU_TEST)).await.unwrap();
    assert_eq!(gpo.links, vec![OU_TEST.to_string()]);

    let links = env.directory.read_container_links(OU_TEST).await.unwrap();
    assert_eq!(links.entries(), vec![(gpo.id, true, false)]);
}

#[tokio::test]
async fn create_rejects_bad_container_before_creating_anything() {
    let env = TestEnv::new().await;

    assert_matches!(
        env.manager.create("Test", Some("OU=Missing,DC=example,DC=com")).await,
        Err(CoreError::NotFound { .. })
    );
    assert_matches!(
        env.manager.create("Test", Some("OU=Test;DC=example")).await,
        Err(CoreError::InvalidArgument(_))
    );
    assert!(env.directory.list_objects().await.unwrap().is_empty());
    assert_eq!(env.root_entries(), 0);
}

#[tokio::test]
async fn create_rejects_duplicate_and_empty_names() {
    let env = TestEnv::new().await;
    env.manager.create("Test", None).await.unwrap();
    assert_matches!(env.manager.create("TEST", None).await, Err(CoreError::Conflict(_)));
    assert_matches!(env.manager.create("  ", None).await, Err(CoreError::InvalidArgument(_)));
    assert_eq!(env.manager.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn create_rejects_display_name_with_line_break() {
    let env = TestEnv::new().await;

    assert_matches!(
        env.manager.create("Test\r\nVersion=99", None).await,
        Err(CoreError::InvalidArgument(_))
    );
    assert!(env.directory.list_objects().await.unwrap().is_empty());
    assert_eq!(env.root_entries(), 0);
}

#[tokio::test]
async fn failed_tree_creation_removes_directory_object() {
    let env = TestEnv::new().await;
    env.templates.fail_create_tree.store(true, Ordering::SeqCst);

    assert_matches!(
        env.manager.create("Test", None).await,
        Err(CoreError::StoreUnavailable(_))
    );
    assert!(env.directory.list_objects().await.unwrap().is_empty());
    assert_eq!(env.root_entries(), 0);
}

#[tokio::test]
async fn failed_initial_link_removes_everything() {
    let env = TestEnv::new().await;
    env.directory.fail_write_links.store(true, Ordering::SeqCst);

    assert_matches!(
        env.manager.create("Test", Some(OU_TEST)).await,
        Err(CoreError::StoreUnavailable(_))
    );
    assert!(env.directory.list_objects().await.unwrap().is_empty());
    assert_eq!(env.root_entries(), 0);
    assert!(env.directory.inner.raw_gplink(OU_TEST).await.unwrap().is_empty());
}

#[tokio::test]
async fn get_find_and_list() {
    let env = TestEnv::new().await;
    let b = env.manager.create("Beta", Some(OU_TEST)).await.unwrap();
    let a = env.manager.create("alpha", None).await.unwrap();

    assert_eq!(env.manager.get(&b.id).await.unwrap(), b);
    assert_eq!(env.manager.find_by_name("ALPHA").await.unwrap().map(|g| g.id), Some(a.id));
    assert!(env.manager.find_by_name("gamma").await.unwrap().is_none());

    let names: Vec<_> = env
        .manager
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.display_name)
        .collect();
    assert_eq!(names, ["alpha", "Beta"]);

    assert_matches!(
        env.manager.get(&GpoId::new_random()).await,
        Err(CoreError::NotFound { .. })
    );
}

#[tokio::test]
async fn delete_while_linked_conflicts_and_changes_nothing() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", Some(OU_TEST)).await.unwrap();
    env.manager.add_script(&gpo.id, "Logon", b"echo".to_vec(), "").await.unwrap();
    let before = env.manager.get(&gpo.id).await.unwrap();

    assert_matches!(env.manager.delete(&gpo.id).await, Err(CoreError::Conflict(_)));

    assert_eq!(env.manager.get(&gpo.id).await.unwrap(), before);
    assert!(before.template_path.is_dir());
    env.assert_consistent(&gpo.id).await;
}

#[tokio::test]
async fn delete_after_unlink_removes_both_stores() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", Some(OU_TEST)).await.unwrap();
    env.manager.link(&gpo.id, OU_OTHER).await.unwrap();

    let unlinked = env.manager.unlink_all(&gpo.id).await.unwrap();
    assert_eq!(unlinked.len(), 2);
    env.manager.delete(&gpo.id).await.unwrap();

    assert_matches!(env.manager.get(&gpo.id).await, Err(CoreError::NotFound { .. }));
    assert!(!gpo.template_path.exists());
    assert_eq!(env.root_entries(), 0);
    assert_matches!(env.manager.delete(&gpo.id).await, Err(CoreError::NotFound { .. }));
}

#[tokio::test]
async fn failed_directory_delete_restores_tree() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", None).await.unwrap();
    env.directory.fail_delete.store(true, Ordering::SeqCst);

    assert_matches!(
        env.manager.delete(&gpo.id).await,
        Err(CoreError::StoreUnavailable(_))
    );
    assert!(gpo.template_path.join("GPT.INI").is_file());
    assert_eq!(env.root_entries(), 1);
    env.assert_consistent(&gpo.id).await;

    env.directory.fail_delete.store(false, Ordering::SeqCst);
    env.manager.delete(&gpo.id).await.unwrap();
}

#[tokio::test]
async fn delete_tolerates_missing_tree() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", None).await.unwrap();
    std::fs::remove_dir_all(&gpo.template_path).unwrap();

    env.manager.delete(&gpo.id).await.unwrap();
    assert_matches!(env.manager.get(&gpo.id).await, Err(CoreError::NotFound { .. }));
}

#[tokio::test]
async fn verify_and_audit_report_drift() {
    let env = TestEnv::new().await;
    let good = env.manager.create("Good", None).await.unwrap();
    let drifted = env.manager.create("Drifted", None).await.unwrap();
    env.templates
        .inner
        .write_config(&drifted.id, GpoVersion { machine: 0, user: 7 })
        .await
        .unwrap();
    let orphan = GpoId::new_random();
    env.templates.inner.create_tree(&orphan, None).await.unwrap();

    assert!(env.manager.verify(&good.id).await.unwrap().consistent());
    let check = env.manager.verify(&drifted.id).await.unwrap();
    assert!(!check.consistent());
    assert_eq!(check.directory_version, 0);
    assert_eq!(check.template_version, Some(7));

    let report = env.manager.audit().await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.inconsistent.len(), 1);
    assert_eq!(report.inconsistent[0].id, drifted.id);
    assert_eq!(report.orphan_trees, vec![orphan]);
    assert!(!report.is_clean());

    // Mutations refuse to run on a drifted GPO.
    assert_matches!(
        env.manager.add_script(&drifted.id, "Logon", b"x".to_vec(), "").await,
        Err(CoreError::Inconsistent { .. })
    );
}

#[tokio::test]
async fn verify_reports_missing_tree() {
    let env = TestEnv::new().await;
    let gpo = env.manager.create("Test", None).await.unwrap();
    std::fs::remove_dir_all(&gpo.template_path).unwrap();

    let check = env.manager.verify(&gpo.id).await.unwrap();
    assert_eq!(check.template_version, None);
    assert!(check.error.is_some());
    assert!(!check.consistent());
}

#[tokio::test]
async fn missing_tree_is_inconsistent_and_left_out_of_list() {
    let env = TestEnv::new().await;
    let a = env.manager.create("A", None).await.unwrap();
    let b = env.manager.create("B", None).await.unwrap();
    std::fs::remove_dir_all(&a.template_path).unwrap();

    assert_matches!(env.manager.get(&a.id).await, Err(CoreError::Inconsistent { .. }));
    assert_matches!(env.manager.list_scripts(&a.id).await, Err(CoreError::Inconsistent { .. }));
    let ids: Vec<_> = env.manager.list().await.unwrap().into_iter().map(|g| g.id).collect();
    assert_eq!(ids, vec![b.id]);
}

#[tokio::test]
async fn health_check_reports_each_component() {
    let env = TestEnv::with_signer().await;
    let report = env.manager.health_check().await;
    assert!(report.healthy);
    assert!(report.signer.configured);

    env.directory.fail_ping.store(true, Ordering::SeqCst);
    env.signer.as_ref().unwrap().fail.store(true, Ordering::SeqCst);
    let report = env.manager.health_check().await;
    assert!(!report.healthy);
    assert!(!report.directory.healthy);
    assert!(report.templates.healthy);
    assert!(!report.signer.healthy);
    assert!(report.signer.error.as_deref().unwrap().contains("unreachable"));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["directory"]["healthy"], false);
    assert!(json["templates"].get("error").is_none());
}

#[tokio::test]
async fn health_check_without_signer() {
    let env = TestEnv::new().await;
    let report = env.manager.health_check().await;
    assert!(report.healthy);
    assert!(!report.signer.configured);
}
