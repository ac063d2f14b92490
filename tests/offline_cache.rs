mod common;

use std::sync::Arc;

use common::{ctx, ids, msg, today, FakeFeed, RecordingDispatcher};
use message_sync::{FeedSync, FileKvStore, KeyValueStore, MessageId, SyncConfig};

/// Syncs and deletes through one engine, then reopens the store in a fresh
/// engine and checks that the feed and its deletions survived.
async fn survives_restart<S, O>(open: O)
where
    S: KeyValueStore + 'static,
    O: Fn() -> S,
{
    let c = ctx("branch-12");
    let feed = Arc::new(FakeFeed::new());
    feed.publish(
        "branch-12",
        [msg(5, "2024-01-20"), msg(6, "2024-01-21"), msg(7, "2024-01-22")],
    );

    {
        let engine = FeedSync::new(
            Arc::new(open()),
            feed.clone(),
            Arc::new(RecordingDispatcher::default()),
            SyncConfig::default(),
        )
        .unwrap();
        engine.sync_at(&c, today()).await.unwrap();
        engine.mark_read(&c, MessageId(5)).await.unwrap();
        engine.delete_message(&c, MessageId(7)).await.unwrap();
    }

    let engine = FeedSync::new(
        Arc::new(open()),
        feed.clone(),
        Arc::new(RecordingDispatcher::default()),
        SyncConfig::default(),
    )
    .unwrap();

    assert_eq!(engine.hydrate(&c).await.unwrap(), 2);
    let restored = engine.feed("branch-12").await;
    assert_eq!(ids(&restored), vec![6, 5]);
    assert!(restored[1].is_read());
    assert_eq!(engine.unread_count("branch-12").await, 1);

    // The cursor still accounts for the deleted newest message.
    let report = engine.sync_at(&c, today()).await.unwrap();
    assert_eq!(report.since, MessageId(7));
    assert_eq!(ids(&engine.feed("branch-12").await), vec![6, 5]);
}

#[tokio::test]
async fn file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("feed-cache");
    survives_restart(|| FileKvStore::open(&root).unwrap()).await;

    let names: Vec<String> = std::fs::read_dir(&root)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(names.iter().all(|name| name.ends_with(".json")));
    assert_eq!(names.len(), 3);
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feed.db");
    survives_restart(|| message_sync::SqliteKvStore::open(&path).unwrap()).await;
}

#[tokio::test]
async fn file_store_keeps_tenants_apart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileKvStore::open(dir.path()).unwrap());
    let feed = Arc::new(FakeFeed::new());
    feed.publish("north", [msg(1, "2024-01-20")]);
    feed.publish("south", [msg(2, "2024-01-20"), msg(3, "2024-01-21")]);

    let engine = FeedSync::new(
        store,
        feed,
        Arc::new(RecordingDispatcher::default()),
        SyncConfig::default(),
    )
    .unwrap();
    engine.sync_at(&ctx("north"), today()).await.unwrap();
    engine.sync_at(&ctx("south"), today()).await.unwrap();

    assert_eq!(ids(&engine.cache().load("north").await.unwrap()), vec![1]);
    assert_eq!(ids(&engine.cache().load("south").await.unwrap()), vec![3, 2]);
}
