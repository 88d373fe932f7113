//! Integration tests for the watcher -> queue -> indexer pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use docmirror::config::{Config, EmbeddingConfig};
use docmirror::embeddings::HashEmbedder;
use docmirror::indexer::IndexerProcess;
use docmirror::queue::{PersistentQueue, EVENT_QUEUE_TABLE};
use docmirror::storage::{init_storage, insert_root, Database, RootRecord, SearchOptions};
use docmirror::watcher::{FileEvent, FileEventKind, WatcherClient, WatcherProcess};
use tempfile::TempDir;

const DIMS: usize = 64;
const WAIT: Duration = Duration::from_secs(10);

fn fast_config(data_dir: &Path) -> Config {
    let mut config = Config {
        data_dir: data_dir.to_path_buf(),
        embedding: EmbeddingConfig::hash(DIMS),
        ..Config::default()
    };
    config.watcher.debounce_ms = 20;
    config.watcher.move_correlation_ms = 50;
    config.watcher.flush_interval_ms = 20;
    config.watcher.process_interval_ms = 20;
    config.indexer.process_interval_ms = 20;
    config.indexer.resync_on_start = false;
    config
}

/// Opens two handles on one database file, the way the binary does.
fn open_pair(config: &Config) -> (Database, Database) {
    std::fs::create_dir_all(&config.data_dir).unwrap();
    let indexer_db = Database::open(config.database_path()).unwrap();
    init_storage(&indexer_db).unwrap();
    let watcher_db = Database::open(config.database_path()).unwrap();
    (indexer_db, watcher_db)
}

async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn canonical(dir: &TempDir) -> PathBuf {
    dir.path().canonicalize().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edit_and_delete_are_mirrored() {
    let data = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let root = canonical(&docs);
    let file = root.join("a.txt");
    std::fs::write(&file, "hello").unwrap();

    let config = fast_config(data.path());
    let (indexer_db, watcher_db) = open_pair(&config);
    let watcher = WatcherProcess::new(watcher_db, config.watcher.clone()).unwrap();
    let indexer = IndexerProcess::new(indexer_db, &config, Arc::new(HashEmbedder::new(DIMS))).unwrap();

    watcher.start_async().unwrap();
    indexer.start_async().unwrap();
    assert!(indexer.add_root(&root).await.unwrap());
    indexer.wait_for_scans().await;

    let key = file.display().to_string();
    let hits = indexer.search("hello", SearchOptions::new(5)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.document_path, key);

    eventually("root to be watched", || watcher.roots().contains(&root)).await;
    // The observer starts just after the root is registered.
    tokio::time::sleep(Duration::from_millis(200)).await;

    std::fs::write(&file, "hello world").unwrap();
    eventually("edit to be indexed", || {
        indexer
            .chunks_for(&key)
            .map(|chunks| chunks.first().is_some_and(|c| c.content == "hello world"))
            .unwrap_or(false)
    })
    .await;

    std::fs::remove_file(&file).unwrap();
    eventually("delete to be mirrored", || {
        indexer.stats().map(|s| s.store.documents == 0).unwrap_or(false)
    })
    .await;
    let hits = indexer.search("hello", SearchOptions::new(5)).await.unwrap();
    assert!(hits.is_empty());

    indexer.stop().await.unwrap();
    watcher.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_is_a_single_move_event() {
    let data = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let root = canonical(&docs);
    let old = root.join("draft.txt");
    let new = root.join("final.txt");
    std::fs::write(&old, "quarterly numbers").unwrap();

    let config = fast_config(data.path());
    let (db, watcher_db) = open_pair(&config);
    db.with_conn(|conn| insert_root(conn, &RootRecord::new(root.display().to_string())))
        .unwrap();
    let watcher = WatcherProcess::new(watcher_db, config.watcher.clone()).unwrap();
    watcher.start_async().unwrap();
    eventually("root to be watched", || watcher.roots().contains(&root)).await;

    std::fs::rename(&old, &new).unwrap();

    let client = WatcherClient::open(db).unwrap();
    let mut events = Vec::new();
    eventually("move event", || {
        events.extend(client.next_events(16).unwrap());
        !events.is_empty()
    })
    .await;

    let moved = &events[0].payload;
    assert_eq!(moved.kind, FileEventKind::Move);
    assert_eq!(moved.path, new);
    assert_eq!(moved.old_path.as_deref(), Some(old.as_path()));
    assert_eq!(events.len(), 1);

    watcher.stop().await.unwrap();
}

#[test]
fn test_queue_survives_reopen() {
    let data = TempDir::new().unwrap();
    let db_path = data.path().join("queue.db");
    let root = PathBuf::from("/docs");

    {
        let db = Database::open(&db_path).unwrap();
        let queue: PersistentQueue<FileEvent> = PersistentQueue::open(db, EVENT_QUEUE_TABLE).unwrap();
        for i in 0..5 {
            queue.enqueue(&FileEvent::add(root.join(format!("{i}.txt")), &root)).unwrap();
        }
        let claimed = queue.dequeue(3).unwrap();
        assert_eq!(claimed.len(), 3);
        // Dropped without ack, as if the consumer crashed.
    }

    let db = Database::open(&db_path).unwrap();
    let queue: PersistentQueue<FileEvent> = PersistentQueue::open(db, EVENT_QUEUE_TABLE).unwrap();
    assert_eq!(queue.requeue_unacked().unwrap(), 3);

    let redelivered: Vec<PathBuf> = queue
        .dequeue(10)
        .unwrap()
        .into_iter()
        .map(|item| item.payload.path)
        .collect();
    let expected: Vec<PathBuf> = (0..5).map(|i| root.join(format!("{i}.txt"))).collect();
    assert_eq!(redelivered, expected);
}

#[tokio::test]
async fn test_remove_root_drops_documents_and_logs() {
    let data = TempDir::new().unwrap();
    let docs = TempDir::new().unwrap();
    let root = canonical(&docs);
    std::fs::write(root.join("one.txt"), "first document").unwrap();
    std::fs::write(root.join("two.md"), "# second document").unwrap();

    let config = fast_config(data.path());
    let (db, _watcher_db) = open_pair(&config);
    let indexer = IndexerProcess::new(db, &config, Arc::new(HashEmbedder::new(DIMS))).unwrap();
    indexer.add_root(&root).await.unwrap();
    indexer.wait_for_scans().await;
    assert_eq!(indexer.stats().unwrap().store.documents, 2);

    let removed = indexer.remove_root(&root).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(indexer.stats().unwrap().store.documents, 0);
    assert!(indexer.list_roots().unwrap().is_empty());

    let kinds: Vec<String> = indexer.activity(10).unwrap().into_iter().map(|a| a.kind).collect();
    assert_eq!(kinds[0], "root_removed");
    assert!(kinds.contains(&"root_added".to_string()));
}
