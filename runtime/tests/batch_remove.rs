//! Batch removal over pulled images.

mod common;

use common::{arch, runtime, FixtureRegistry};
use stevedore_core::error::ImageError;
use stevedore_runtime::{ListOptions, PullOptions, PullPolicy, RemoveOptions};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_explicit_targets_with_unknown_name() {
    let tmp = TempDir::new().unwrap();
    let registry = FixtureRegistry::new();
    registry.publish("alpine", &["amd64"], 1);
    registry.publish("busybox", &["amd64"], 1);
    let runtime = runtime(&tmp, &registry);
    let ctx = CancellationToken::new();
    let alpine = runtime
        .pull(&ctx, "alpine", PullPolicy::Always, &arch("amd64"))
        .await
        .unwrap();
    let busybox = runtime
        .pull(&ctx, "busybox", PullPolicy::Always, &arch("amd64"))
        .await
        .unwrap();

    let targets = vec![
        "busybox".to_string(),
        "nginx".to_string(),
        "alpine".to_string(),
    ];
    let (reports, errors) = runtime
        .remove_images(&ctx, Some(&targets), &RemoveOptions::default())
        .await;
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].id, busybox[0].id);
    assert_eq!(reports[1].id, alpine[0].id);
    assert!(reports.iter().all(|r| r.removed));
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], ImageError::ImageNotFound(ref n) if n == "nginx"));
}

#[tokio::test]
async fn test_parent_removability_checked_at_delete_time() {
    let tmp = TempDir::new().unwrap();
    let registry = FixtureRegistry::new();
    registry.publish_layered("base", &["rootfs"]);
    registry.publish_layered("app", &["rootfs", "app"]);
    let runtime = runtime(&tmp, &registry);
    let ctx = CancellationToken::new();

    let base = runtime
        .pull(&ctx, "base", PullPolicy::Always, &PullOptions::default())
        .await
        .unwrap()
        .remove(0);
    let app = runtime
        .pull(&ctx, "app", PullPolicy::Always, &PullOptions::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(app.parent_id.as_deref(), Some(base.id.as_str()));

    runtime.untag_image(&base.id, "base").await.unwrap();
    let entries = runtime
        .list_images(
            &ctx,
            None,
            &ListOptions {
                set_list_data: true,
                filters: vec![],
            },
        )
        .await
        .unwrap();
    let base_entry = entries.iter().find(|e| e.image.id == base.id).unwrap();
    assert_eq!(base_entry.list_data.is_dangling, Some(false));
    assert_eq!(base_entry.list_data.children, Some(vec![app.id.clone()]));

    let (reports, errors) = runtime
        .remove_images(&ctx, None, &RemoveOptions::default())
        .await;
    assert!(errors.is_empty());
    assert_eq!(reports.len(), 2);
    let expected: Vec<&str> = entries.iter().map(|e| e.image.id.as_str()).collect();
    let ids: Vec<&str> = reports.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, expected);
    // Whichever ID sorts first, the parent goes once its child is gone
    assert!(reports.iter().all(|r| r.removed && r.error.is_none()));
    assert!(runtime.store().list().await.is_empty());
}

#[tokio::test]
async fn test_force_removes_referenced_parent() {
    let tmp = TempDir::new().unwrap();
    let registry = FixtureRegistry::new();
    registry.publish_layered("base", &["rootfs"]);
    registry.publish_layered("app", &["rootfs", "app"]);
    let runtime = runtime(&tmp, &registry);
    let ctx = CancellationToken::new();
    for name in ["base", "app"] {
        runtime
            .pull(&ctx, name, PullPolicy::Always, &PullOptions::default())
            .await
            .unwrap();
    }

    let targets = vec!["base".to_string()];
    let (reports, _) = runtime
        .remove_images(&ctx, Some(&targets), &RemoveOptions::default())
        .await;
    assert!(matches!(
        reports[0].error,
        Some(ImageError::StillReferenced { .. })
    ));

    let options = RemoveOptions {
        force: true,
        ..Default::default()
    };
    let (reports, errors) = runtime.remove_images(&ctx, Some(&targets), &options).await;
    assert!(errors.is_empty());
    assert!(reports[0].removed);
    assert_eq!(runtime.lookup_image("app").await.unwrap().parent_id, None);
}
