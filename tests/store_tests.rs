use chrono::Utc;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use watchpost::store::{
    self, DeliveryStatus, LogCreate, OperationKind, SourceCreate, SourceKind, SourcePatch,
    WatcherCreate, WatcherPatch, WebhookMethod,
};

fn unique_sqlite_path(prefix: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();

    let mut temp_path = std::env::temp_dir();
    temp_path.push(format!(
        "watchpost-{prefix}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ));
    temp_path
}

async fn spawn_store(prefix: &str) -> (store::ConfigStoreHandle, std::path::PathBuf) {
    let path = unique_sqlite_path(prefix);
    let database_url = format!("sqlite:{}", path.display());
    let handle = store::spawn(&database_url).await.expect("store spawn");
    (handle, path)
}

fn sample_source() -> SourceCreate {
    SourceCreate {
        name: "primary".to_string(),
        kind: SourceKind::MongoDb,
        connection_string: "mongodb://localhost:27017/appdb".to_string(),
        config: json!({}),
        enabled: true,
    }
}

fn sample_watcher(source_id: i64) -> WatcherCreate {
    WatcherCreate {
        name: "orders-hook".to_string(),
        source_id,
        collection: "orders".to_string(),
        namespace: None,
        operations: vec![OperationKind::Insert, OperationKind::Update],
        webhook_url: "http://localhost:9999/hook".to_string(),
        webhook_method: Some(WebhookMethod::Post),
        enabled: true,
        config: json!({}),
    }
}

#[tokio::test]
async fn watcher_crud_round_trip() {
    let (store, path) = spawn_store("watcher-crud").await;

    let source = store.create_source(sample_source()).await.expect("create source");
    let created = store
        .create_watcher(sample_watcher(source.id))
        .await
        .expect("create watcher");
    assert_eq!(created.name, "orders-hook");
    assert_eq!(created.trigger_count, 0);
    assert_eq!(
        created.operations,
        vec![OperationKind::Insert, OperationKind::Update]
    );

    let fetched = store
        .get_watcher(created.id)
        .await
        .expect("get watcher")
        .expect("watcher exists");
    assert_eq!(fetched, created);

    let listed = store.list_watchers().await.expect("list watchers");
    assert_eq!(listed.len(), 1);

    let by_source = store
        .list_watchers_by_source(source.id)
        .await
        .expect("list by source");
    assert_eq!(by_source.len(), 1);

    store.delete_watcher(created.id).await.expect("delete watcher");
    assert!(
        store
            .get_watcher(created.id)
            .await
            .expect("get after delete")
            .is_none()
    );

    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn watcher_patch_only_touches_provided_fields() {
    let (store, path) = spawn_store("watcher-patch").await;

    let source = store.create_source(sample_source()).await.expect("create source");
    let created = store
        .create_watcher(sample_watcher(source.id))
        .await
        .expect("create watcher");

    store
        .patch_watcher(
            created.id,
            WatcherPatch {
                webhook_url: Some("http://localhost:9999/v2".to_string()),
                enabled: Some(false),
                ..WatcherPatch::default()
            },
        )
        .await
        .expect("patch watcher");

    let patched = store
        .get_watcher(created.id)
        .await
        .expect("get watcher")
        .expect("watcher exists");
    assert_eq!(patched.webhook_url, "http://localhost:9999/v2");
    assert!(!patched.enabled);
    // Untouched fields survive the patch.
    assert_eq!(patched.name, created.name);
    assert_eq!(patched.collection, created.collection);
    assert_eq!(patched.operations, created.operations);

    let missing = store
        .patch_watcher(created.id + 100, WatcherPatch::default())
        .await;
    assert!(missing.is_err(), "patching a missing watcher must fail");

    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn trigger_count_increments_by_one() {
    let (store, path) = spawn_store("trigger-count").await;

    let source = store.create_source(sample_source()).await.expect("create source");
    let created = store
        .create_watcher(sample_watcher(source.id))
        .await
        .expect("create watcher");

    for _ in 0..3 {
        store
            .increment_trigger_count(created.id)
            .await
            .expect("increment");
    }
    let fetched = store
        .get_watcher(created.id)
        .await
        .expect("get watcher")
        .expect("watcher exists");
    assert_eq!(fetched.trigger_count, 3);

    // Incrementing a deleted watcher is a no-op, not an error.
    store.delete_watcher(created.id).await.expect("delete");
    store
        .increment_trigger_count(created.id)
        .await
        .expect("increment after delete");

    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn source_crud_and_patch() {
    let (store, path) = spawn_store("source-crud").await;

    let created = store.create_source(sample_source()).await.expect("create source");
    assert_eq!(created.kind, SourceKind::MongoDb);

    store
        .patch_source(
            created.id,
            SourcePatch {
                connection_string: Some("mongodb://replica:27017/appdb".to_string()),
                ..SourcePatch::default()
            },
        )
        .await
        .expect("patch source");

    let patched = store
        .get_source(created.id)
        .await
        .expect("get source")
        .expect("source exists");
    assert_eq!(patched.connection_string, "mongodb://replica:27017/appdb");
    assert_eq!(patched.name, created.name);

    store.delete_source(created.id).await.expect("delete source");
    assert!(store.list_sources().await.expect("list").is_empty());

    let _ = tokio::fs::remove_file(&path).await;
}

#[tokio::test]
async fn delivery_logs_list_stats_and_clear() {
    let (store, path) = spawn_store("delivery-logs").await;

    let source = store.create_source(sample_source()).await.expect("create source");
    let watcher = store
        .create_watcher(sample_watcher(source.id))
        .await
        .expect("create watcher");

    for i in 0..4 {
        let status = if i % 2 == 0 {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Failure
        };
        store
            .insert_log(LogCreate {
                watcher_id: watcher.id,
                operation: OperationKind::Insert,
                status,
                message: format!("attempt {i}"),
                response: Some(json!({ "status": 200 })),
                error: None,
                created_at: Utc::now(),
            })
            .await
            .expect("insert log");
    }

    let logs = store.list_logs(watcher.id, 100).await.expect("list logs");
    assert_eq!(logs.len(), 4);
    // Newest first.
    assert_eq!(logs[0].message, "attempt 3");

    let limited = store.list_logs(watcher.id, 2).await.expect("list limited");
    assert_eq!(limited.len(), 2);

    let stats = store.log_stats(watcher.id).await.expect("stats");
    assert_eq!(stats.total, 4);
    assert_eq!(stats.success, 2);
    assert_eq!(stats.failure, 2);
    assert!(stats.last_attempt.is_some());

    let deleted = store.clear_logs(watcher.id).await.expect("clear logs");
    assert_eq!(deleted, 4);
    let stats = store.log_stats(watcher.id).await.expect("stats after clear");
    assert_eq!(stats.total, 0);
    assert!(stats.last_attempt.is_none());

    let _ = tokio::fs::remove_file(&path).await;
}
