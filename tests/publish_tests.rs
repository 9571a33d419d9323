//! Publish flow: record creation, version chains, eligibility checks, and
//! task dispatch.

mod common;

use std::os::unix::fs::MetadataExt;

use datapub::directory::DirectoryEntry;
use datapub::error::AppError;
use datapub::registry::FileStatus;

use common::*;

#[tokio::test]
async fn publish_creates_version_one_and_dispatches_task() {
    let env = default_env();
    let path = write_repo_file(&env.repo_root, "my_file_to_publish.txt", "hello world");

    let (id, version) = env
        .workflow
        .publish(&path, &user("root", false), None, None, None, &[])
        .await
        .unwrap();
    assert_eq!(version, 1);

    let record = env.registry.0.lock().get(&id).unwrap();
    assert_eq!(record.owner, "root");
    assert_eq!(record.size, "hello world".len() as u64);
    assert_eq!(record.status, FileStatus::Available);
    assert_eq!(record.downloads, 0);
    assert!(record.version_of.is_none());

    let tasks = env.dispatcher.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].0, "publish");
    assert_eq!(tasks[0].1["file_id"], serde_json::json!(id));
    assert_eq!(tasks[0].1["path"], serde_json::json!(path));
    assert_eq!(tasks[0].1["email"], serde_json::Value::Null);
}

#[tokio::test]
async fn publish_linked_joins_chain_with_next_version() {
    let env = default_env();
    let p1 = write_repo_file(&env.repo_root, "data_v1.txt", "one");
    let p2 = write_repo_file(&env.repo_root, "data_v2.txt", "two!");
    let p3 = write_repo_file(&env.repo_root, "data_v3.txt", "three");

    let acting = user("root", false);
    let (id1, v1) = env.workflow.publish(&p1, &acting, None, None, None, &[]).await.unwrap();
    let (id2, v2) = env
        .workflow
        .publish(&p2, &acting, None, None, Some(&id1.to_string()), &[])
        .await
        .unwrap();
    // Linking to a non-root member still lands on the same chain.
    let (id3, v3) = env
        .workflow
        .publish(&p3, &acting, None, None, Some(&id2.to_string()), &[])
        .await
        .unwrap();

    assert_eq!((v1, v2, v3), (1, 2, 3));

    let view2 = env.workflow.view(&id2.to_string()).unwrap();
    let mut sibling_ids: Vec<_> = view2.siblings.iter().map(|s| s.id).collect();
    sibling_ids.sort();
    let mut expected = vec![id1, id3];
    expected.sort();
    assert_eq!(sibling_ids, expected);

    let view1 = env.workflow.view(&id1.to_string()).unwrap();
    assert_eq!(view1.siblings.len(), 2);
    assert_eq!(view1.siblings.iter().map(|s| s.version).collect::<Vec<_>>(), vec![2, 3]);
}

#[tokio::test]
async fn publish_rejects_bad_link_targets() {
    let env = default_env();
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    let acting = user("root", false);

    let err = env
        .workflow
        .publish(&path, &acting, None, None, Some("not-a-uuid"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidArgument { .. }), "got {}", err);

    let err = env
        .workflow
        .publish(&path, &acting, None, None, Some("f2ecc13f-3038-4f78-8c84-ab881a0b567d"), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound { .. }), "got {}", err);
}

#[tokio::test]
async fn publish_rejects_missing_paths_directories_and_foreign_paths() {
    let env = default_env();
    let acting = user("root", false);

    let missing = env.repo_root.join("nope.txt");
    let err = env
        .workflow
        .publish(missing.to_str().unwrap(), &acting, None, None, None, &[])
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);

    let err = env
        .workflow
        .publish(env.repo_root.to_str().unwrap(), &acting, None, None, None, &[])
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 400);

    // A real file outside every configured root.
    let outside = env.repo_root.parent().unwrap().join("stray.txt");
    std::fs::write(&outside, "stray").unwrap();
    let err = env
        .workflow
        .publish(outside.to_str().unwrap(), &acting, None, None, None, &[])
        .await
        .unwrap_err();
    assert!(err.message().contains("not in any publishable repository"));
}

#[tokio::test]
async fn publish_refused_when_no_executor_reachable() {
    let env = build_env(EnvOptions { dispatcher: RecordingDispatcher::down(), ..Default::default() });
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    let err = env
        .workflow
        .publish(&path, &user("root", false), None, None, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unavailable { .. }), "got {}", err);
    assert!(env.dispatcher.tasks().is_empty());
}

#[tokio::test]
async fn publish_normalizes_email_and_rejects_bad_addresses() {
    let env = default_env();
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    let acting = user("root", false);

    let err = env
        .workflow
        .publish(&path, &acting, Some("not-an-address"), None, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation { .. }), "got {}", err);
    assert!(env.dispatcher.tasks().is_empty());

    env.workflow
        .publish(&path, &acting, Some("Someone@EXAMPLE.ORG"), None, None, &[])
        .await
        .unwrap();
    let tasks = env.dispatcher.tasks();
    assert_eq!(tasks[0].1["email"], serde_json::json!("Someone@example.org"));
}

#[tokio::test]
async fn publish_attaches_and_deduplicates_tags() {
    let env = default_env();
    let p1 = write_repo_file(&env.repo_root, "a.txt", "a");
    let p2 = write_repo_file(&env.repo_root, "b.txt", "b");
    let acting = user("root", false);

    let tags = vec!["genome".to_string(), "genome".to_string(), "draft".to_string()];
    let (id1, _) = env.workflow.publish(&p1, &acting, None, None, None, &tags).await.unwrap();
    let (id2, _) = env
        .workflow
        .publish(&p2, &acting, None, None, None, &["genome".to_string()])
        .await
        .unwrap();

    let reg = env.registry.0.lock();
    assert_eq!(reg.tag_count(), 2, "labels must be reused, not duplicated");
    let r1 = reg.get(&id1).unwrap();
    assert_eq!(reg.tag_labels(&r1.tags), vec!["genome", "draft"]);
    let r2 = reg.get(&id2).unwrap();
    assert_eq!(reg.tag_labels(&r2.tags), vec!["genome"]);
}

// --- restricted-mode eligibility ---

fn restricted_opts(repo_yaml_body: &str, entry: DirectoryEntry) -> EnvOptions {
    EnvOptions {
        repo_yaml_body: repo_yaml_body.to_string(),
        restricted: true,
        directory: StubDirectory::with_entry(entry),
        ..Default::default()
    }
}

#[tokio::test]
async fn restricted_denies_user_with_no_matching_acl() {
    let env = build_env(restricted_opts(
        "  allowed_users:\n    - alice\n  allowed_groups:\n    - staff",
        DirectoryEntry { group_ids: vec!["900".into()], group_names: vec!["guests".into()], numeric_id: 4242 },
    ));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    let err = env
        .workflow
        .publish(&path, &user("bob", false), None, None, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied { .. }), "got {}", err);
}

#[tokio::test]
async fn restricted_grants_on_group_name_or_id_intersection() {
    let entry = DirectoryEntry { group_ids: vec!["500".into()], group_names: vec!["staff".into()], numeric_id: 4242 };

    let env = build_env(restricted_opts("  allowed_groups:\n    - staff", entry.clone()));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    env.workflow.publish(&path, &user("bob", false), None, None, None, &[]).await.unwrap();

    let env = build_env(restricted_opts("  allowed_groups:\n    - \"500\"", entry));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    env.workflow.publish(&path, &user("bob", false), None, None, None, &[]).await.unwrap();
}

#[tokio::test]
async fn restricted_grants_allowed_user_by_name_or_numeric_id() {
    let entry = DirectoryEntry { group_ids: vec![], group_names: vec![], numeric_id: 4242 };

    let env = build_env(restricted_opts("  allowed_users:\n    - bob", entry.clone()));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    env.workflow.publish(&path, &user("bob", false), None, None, None, &[]).await.unwrap();

    let env = build_env(restricted_opts("  allowed_users:\n    - \"4242\"", entry));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    env.workflow.publish(&path, &user("bob", false), None, None, None, &[]).await.unwrap();
}

#[tokio::test]
async fn restricted_grants_admins_regardless_of_acl() {
    let entry = DirectoryEntry { group_ids: vec![], group_names: vec![], numeric_id: 1 };
    let env = build_env(restricted_opts("  allowed_users:\n    - alice", entry.clone()));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    // Token-level admin flag.
    env.workflow.publish(&path, &user("bob", true), None, None, None, &[]).await.unwrap();

    // Configured administrator list ("admin" is in the default options).
    let env = build_env(restricted_opts("  allowed_users:\n    - alice", entry));
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    env.workflow.publish(&path, &user("admin", false), None, None, None, &[]).await.unwrap();
}

#[tokio::test]
async fn owner_fallback_applies_only_when_both_acl_lists_are_empty() {
    let env = default_env();
    let path = write_repo_file(&env.repo_root, "owned.txt", "mine");
    let file_uid = std::fs::metadata(&path).unwrap().uid();

    // Both lists empty + matching uid: granted.
    let entry = DirectoryEntry { group_ids: vec![], group_names: vec![], numeric_id: file_uid };
    let env = build_env(restricted_opts("  has_baricadr: false", entry.clone()));
    let path = write_repo_file(&env.repo_root, "owned.txt", "mine");
    env.workflow.publish(&path, &user("bob", false), None, None, None, &[]).await.unwrap();

    // A non-empty allowed_users list disables the fallback even though the
    // uid matches and the list itself does not.
    let env = build_env(restricted_opts("  allowed_users:\n    - alice", entry.clone()));
    let path = write_repo_file(&env.repo_root, "owned.txt", "mine");
    let err = env
        .workflow
        .publish(&path, &user("bob", false), None, None, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied { .. }), "got {}", err);

    // Same for a non-empty allowed_groups list.
    let env = build_env(restricted_opts("  allowed_groups:\n    - staff", entry));
    let path = write_repo_file(&env.repo_root, "owned.txt", "mine");
    let err = env
        .workflow
        .publish(&path, &user("bob", false), None, None, None, &[])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied { .. }), "got {}", err);
}

#[tokio::test]
async fn restricted_surfaces_directory_lookup_failure() {
    let env = build_env(EnvOptions {
        restricted: true,
        directory: StubDirectory::failing(),
        ..Default::default()
    });
    let path = write_repo_file(&env.repo_root, "a.txt", "a");
    let err = env
        .workflow
        .publish(&path, &user("ghost", false), None, None, None, &[])
        .await
        .unwrap_err();
    assert!(err.message().contains("not found in directory"));
}
