use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strongbox_engine::catalog::read_entry;
use strongbox_engine::events::{HookChain, HookDecision, HookPriority, LifecycleHook, OperationEvent};
use strongbox_engine::manager::{BackupRequest, OperationManager};
use strongbox_lib::config::Config;
use strongbox_lib::paths;
use strongbox_lib::types::{BackupEntry, OperationKind, OperationState};
use tempfile::{tempdir, TempDir};
use tokio::sync::broadcast;

fn server() -> (TempDir, Config) {
    let tmp = tempdir().unwrap();
    let world = tmp.path().join("world");
    fs::create_dir_all(world.join("region")).unwrap();
    fs::write(world.join("A"), vec![b'a'; 10]).unwrap();
    fs::write(world.join("region/B"), vec![b'b'; 20]).unwrap();
    fs::write(tmp.path().join("server.properties"), b"motd=hi").unwrap();
    let config = Config::with_base_dir(tmp.path().to_string_lossy());
    (tmp, config)
}

async fn next_event(events: &mut broadcast::Receiver<OperationEvent>) -> OperationEvent {
    tokio::time::timeout(Duration::from_secs(30), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

struct Recorder {
    deny_name: Option<String>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl LifecycleHook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn before_start(&self, event: &OperationEvent) -> HookDecision {
        self.seen.lock().unwrap().push(format!("start:{}", event.uid));
        if self.deny_name.as_deref() == Some(event.name.as_str()) {
            HookDecision::Deny("maintenance window".to_string())
        } else {
            HookDecision::Allow
        }
    }

    fn after_finish(&self, event: &OperationEvent, _next_offline: Option<bool>) {
        self.seen.lock().unwrap().push(format!("finish:{}", event.uid));
    }
}

#[tokio::test]
async fn test_backup_of_two_files_yields_catalog_entry() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());

    let uid = manager
        .submit_backup(BackupRequest::new("world", "world"))
        .await
        .unwrap();
    let snapshot = manager.wait_for(&uid).await.unwrap();

    assert_eq!(snapshot.state, OperationState::Done);
    assert_eq!(snapshot.status, "Done");
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(manager.progress(&uid).await, "100.00");
    assert_eq!(manager.total_size(&uid).await, Some(30));

    let catalog = manager.list_catalog().await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].uid, uid);
    assert_eq!(catalog[0].size, 30);
    assert!(catalog[0].location.starts_with(tmp.path().join("Backups")));

    let location = &catalog[0].location;
    assert!(paths::index_path(location).is_file());
    let stored = read_entry(location).unwrap().unwrap();
    assert_eq!(stored.name, "world");
    assert_eq!(stored.uid, uid);
    assert_eq!(stored.size, 30);
    assert_eq!(manager.backup_info(&uid).await, Some(catalog[0].clone()));
}

#[tokio::test]
async fn test_operations_run_one_at_a_time_in_fifo_order() {
    let _ = tracing_subscriber::fmt::try_init();
    let (_tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());
    let mut events = manager.subscribe();

    let mut uids = Vec::new();
    for i in 0..3 {
        let mut request = BackupRequest::new(format!("world{}", i), "world");
        request.destination = Some(PathBuf::from(format!("Backups/copy{}", i)));
        uids.push(manager.submit_backup(request).await.unwrap());
    }
    assert_eq!(manager.active_uid().await.as_deref(), Some(uids[0].as_str()));

    let mut sequence = Vec::new();
    while sequence.len() < 6 {
        let event = next_event(&mut events).await;
        let kind = if event.is_completion() { "done" } else { "pre" };
        sequence.push(format!("{}:{}", kind, event.uid));
    }

    let expected: Vec<String> = uids
        .iter()
        .flat_map(|uid| [format!("pre:{}", uid), format!("done:{}", uid)])
        .collect();
    assert_eq!(sequence, expected);
    assert!(manager.active_uid().await.is_none());
    assert!(!manager.has_operations_queued().await);
    assert_eq!(manager.list_catalog().await.len(), 3);

    let operations = manager.list_operations().await;
    assert_eq!(operations.len(), 3);
    assert!(operations
        .windows(2)
        .all(|pair| pair[0].start_time <= pair[1].start_time));
    assert!(operations.iter().all(|s| s.state == OperationState::Done));
}

#[tokio::test]
async fn test_denied_operation_is_canceled_and_queue_advances() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hooks = HookChain::new().with(
        HookPriority::Normal,
        Arc::new(Recorder {
            deny_name: Some("blocked".to_string()),
            seen: seen.clone(),
        }),
    );
    let manager = OperationManager::new(&config, hooks);

    let blocked = manager
        .submit_backup(BackupRequest::new("blocked", "world"))
        .await
        .unwrap();
    let allowed = manager
        .submit_backup(BackupRequest::new("allowed", "world"))
        .await
        .unwrap();

    let canceled = manager.wait_for(&blocked).await.unwrap();
    assert_eq!(canceled.state, OperationState::Canceled);
    assert!(canceled.error.contains("maintenance window"));
    assert_eq!(canceled.data_copied, 0);
    assert!(canceled.start_time.is_none());

    let done = manager.wait_for(&allowed).await.unwrap();
    assert_eq!(done.state, OperationState::Done);

    let catalog = manager.list_catalog().await;
    assert_eq!(catalog.len(), 1);
    assert_eq!(catalog[0].uid, allowed);
    assert!(!tmp.path().join("Backups").read_dir().unwrap().any(|e| e
        .unwrap()
        .file_name()
        .to_string_lossy()
        .starts_with("blocked")));

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            format!("start:{}", blocked),
            format!("finish:{}", blocked),
            format!("start:{}", allowed),
            format!("finish:{}", allowed),
        ]
    );
}

#[tokio::test]
async fn test_ignore_options_shape_the_backup() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());

    // Back up the whole base directory: the backup directory itself must be skipped.
    let first = manager
        .submit_backup(BackupRequest::new("seed", "world"))
        .await
        .unwrap();
    manager.wait_for(&first).await.unwrap();

    let mut request = BackupRequest::new("full", ".");
    request.ignore_root_files = true;
    request.ignore = vec![PathBuf::from("world/region")];
    request.destination = Some(PathBuf::from("Backups/full"));
    let uid = manager.submit_backup(request).await.unwrap();
    let snapshot = manager.wait_for(&uid).await.unwrap();

    assert_eq!(snapshot.state, OperationState::Done);
    assert_eq!(snapshot.data_size, 10);
    let dest = tmp.path().join("Backups/full");
    assert!(dest.join("world/A").is_file());
    assert!(!dest.join("world/region").exists());
    assert!(!dest.join("server.properties").exists());
    assert!(!dest.join("Backups").exists());
}

#[tokio::test]
async fn test_restore_with_clear_removes_stale_files() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());

    let uid = manager
        .submit_backup(BackupRequest::new("world", "world"))
        .await
        .unwrap();
    manager.wait_for(&uid).await.unwrap();

    let world = tmp.path().join("world");
    fs::write(world.join("A"), b"corrupted").unwrap();
    fs::write(world.join("region/stale.mca"), b"stale").unwrap();

    assert!(manager.submit_restore(&uid, None, true, false).await);
    let snapshot = manager.wait_for(&uid).await.unwrap();

    assert_eq!(snapshot.state, OperationState::Done);
    assert_eq!(snapshot.destination, tmp.path().join("."));
    assert_eq!(fs::read(world.join("A")).unwrap(), vec![b'a'; 10]);
    assert_eq!(fs::read(world.join("region/B")).unwrap(), vec![b'b'; 20]);
    assert!(!world.join("region/stale.mca").exists());
    assert!(!paths::info_path(tmp.path()).exists());

    let runs = manager.list_operations().await;
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|run| run.uid == uid));
    assert_eq!(runs[0].kind, OperationKind::Backup);
    assert_eq!(runs[1].kind, OperationKind::Restore);
}

#[tokio::test]
async fn test_unknown_inputs_are_rejected() {
    let (_tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());

    assert!(!manager.submit_restore("missing", None, false, false).await);
    let err = manager
        .submit_backup(BackupRequest::new("nope", "does/not/exist"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    assert_eq!(manager.progress("missing").await, "0.00");
    assert!(manager.operation_name("missing").await.is_none());
    assert!(!manager.is_running("missing").await);
    assert!(manager.wait_for("missing").await.is_none());
}

#[tokio::test]
async fn test_catalog_is_scanned_on_startup() {
    let (tmp, config) = server();
    {
        let manager = OperationManager::new(&config, HookChain::new());
        let uid = manager
            .submit_backup(BackupRequest::new("world", Path::new("world")))
            .await
            .unwrap();
        manager.wait_for(&uid).await.unwrap();
    }

    let manager = OperationManager::new(&config, HookChain::new());
    let catalog = manager.list_catalog().await;
    assert_eq!(catalog.len(), 1);
    let uid = &catalog[0].uid;
    assert_eq!(manager.operation_name(uid).await.as_deref(), Some("world"));
    assert_eq!(manager.total_size(uid).await, Some(30));
    assert!(manager
        .destination_name(uid)
        .await
        .unwrap()
        .starts_with(&*tmp.path().join("Backups").to_string_lossy()));
}

/// Tracks how many operations are between their pre-start and completion hooks.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl LifecycleHook for Gauge {
    fn name(&self) -> &str {
        "gauge"
    }

    fn before_start(&self, _event: &OperationEvent) -> HookDecision {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        HookDecision::Allow
    }

    fn after_finish(&self, _event: &OperationEvent, _next_offline: Option<bool>) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submits_copy_one_at_a_time() {
    let _ = tracing_subscriber::fmt::try_init();
    let (_tmp, config) = server();
    let gauge = Arc::new(Gauge::default());
    let manager = OperationManager::new(
        &config,
        HookChain::new().with(HookPriority::Monitor, gauge.clone()),
    );

    let watcher = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut peak = 0;
            for _ in 0..400 {
                let copying = manager
                    .list_operations()
                    .await
                    .iter()
                    .filter(|op| op.state == OperationState::Copying)
                    .count();
                peak = peak.max(copying);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            peak
        })
    };

    let submits: Vec<_> = (0..6)
        .map(|i| {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut request = BackupRequest::new(format!("world{}", i), "world");
                request.destination = Some(PathBuf::from(format!("Backups/parallel{}", i)));
                manager.submit_backup(request).await.unwrap()
            })
        })
        .collect();
    let mut uids = Vec::new();
    for submit in submits {
        uids.push(submit.await.unwrap());
    }

    for uid in &uids {
        let snapshot = tokio::time::timeout(Duration::from_secs(30), manager.wait_for(uid))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, OperationState::Done, "{}", snapshot.error);
    }

    assert!(watcher.await.unwrap() <= 1);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
    assert_eq!(manager.list_catalog().await.len(), 6);
    assert!(manager.active_uid().await.is_none());
}

#[tokio::test]
async fn test_ignore_that_empties_a_directory() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    fs::create_dir_all(tmp.path().join("world/logs")).unwrap();
    fs::write(tmp.path().join("world/logs/latest.log"), b"log").unwrap();
    let manager = OperationManager::new(&config, HookChain::new());

    let mut request = BackupRequest::new("world", "world");
    request.ignore = vec![PathBuf::from("world/logs/latest.log")];
    let uid = manager.submit_backup(request).await.unwrap();
    let snapshot = manager.wait_for(&uid).await.unwrap();

    assert_eq!(snapshot.state, OperationState::Done, "{}", snapshot.error);
    assert_eq!(snapshot.data_size, 30);
    let catalog = manager.list_catalog().await;
    assert_eq!(catalog.len(), 1);
    assert!(!catalog[0].location.join("world/logs").exists());
}

fn index_node(name: &str, size: u64, children: u32) -> Vec<u8> {
    let mut bytes = vec![strongbox_engine::index::FORMAT_VERSION];
    bytes.extend_from_slice(&(name.len() as u16).to_be_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes.extend_from_slice(&size.to_be_bytes());
    bytes.extend_from_slice(&children.to_be_bytes());
    bytes
}

#[tokio::test]
async fn test_inconsistent_index_fails_restore_and_queue_moves_on() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let broken = tmp.path().join("Backups/broken");
    fs::create_dir_all(&broken).unwrap();
    let entry = BackupEntry {
        uid: "badbad00".to_string(),
        name: "broken".to_string(),
        date: chrono::Utc::now(),
        size: 5,
        location: broken.clone(),
    };
    fs::write(paths::info_path(&broken), entry.render_info()).unwrap();
    let mut index = index_node("", 0, 1);
    index.extend(index_node("backup.index", 5, 0));
    fs::write(paths::index_path(&broken), index).unwrap();

    let manager = OperationManager::new(&config, HookChain::new());
    assert!(manager.submit_restore("badbad00", None, false, false).await);
    let failed = tokio::time::timeout(Duration::from_secs(10), manager.wait_for("badbad00"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.state, OperationState::Error);
    assert!(!failed.error.is_empty());
    assert!(failed.end_time.is_some());
    assert!(manager.active_uid().await.is_none());

    let uid = manager
        .submit_backup(BackupRequest::new("world", "world"))
        .await
        .unwrap();
    let done = tokio::time::timeout(Duration::from_secs(10), manager.wait_for(&uid))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.state, OperationState::Done);
}

#[tokio::test]
async fn test_deleted_backup_is_forgotten() {
    let _ = tracing_subscriber::fmt::try_init();
    let (_tmp, mut config) = server();
    config.global.catalog_refresh_seconds = 0;
    let manager = OperationManager::new(&config, HookChain::new());

    let uid = manager
        .submit_backup(BackupRequest::new("world", "world"))
        .await
        .unwrap();
    manager.wait_for(&uid).await.unwrap();
    let location = manager.backup_info(&uid).await.unwrap().location;

    fs::remove_dir_all(&location).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(manager.list_catalog().await.is_empty());
    assert!(!manager.submit_restore(&uid, None, false, false).await);
}

#[tokio::test]
async fn test_zip_archive_backup_and_restore() {
    let _ = tracing_subscriber::fmt::try_init();
    let (tmp, config) = server();
    let manager = OperationManager::new(&config, HookChain::new());

    let mut request = BackupRequest::new("world", "world");
    request.archive = true;
    let uid = manager.submit_backup(request).await.unwrap();
    let snapshot = manager.wait_for(&uid).await.unwrap();
    assert_eq!(snapshot.state, OperationState::Done, "{}", snapshot.error);

    let catalog = manager.list_catalog().await;
    assert_eq!(catalog.len(), 1);
    let archive = &catalog[0].location;
    assert!(archive.is_file());
    assert_eq!(archive.extension().and_then(|e| e.to_str()), Some("zip"));
    assert_eq!(catalog[0].size, 30);

    fs::remove_dir_all(tmp.path().join("world")).unwrap();
    assert!(manager.submit_restore(&uid, None, false, false).await);
    let restored = manager.wait_for(&uid).await.unwrap();

    assert_eq!(restored.state, OperationState::Done, "{}", restored.error);
    assert_eq!(restored.data_copied, 30);
    assert_eq!(fs::read(tmp.path().join("world/A")).unwrap(), vec![b'a'; 10]);
    assert_eq!(fs::read(tmp.path().join("world/region/B")).unwrap(), vec![b'b'; 20]);
    assert_eq!(manager.list_catalog().await.len(), 1);
}

/// Looks the finished uid up in the catalog from inside the post-finish hook.
#[derive(Default)]
struct CatalogCheck {
    manager: Mutex<Option<OperationManager>>,
    found: Mutex<Vec<bool>>,
}

impl LifecycleHook for CatalogCheck {
    fn name(&self) -> &str {
        "catalog-check"
    }

    fn after_finish(&self, event: &OperationEvent, _next_offline: Option<bool>) {
        let Some(manager) = self.manager.lock().unwrap().clone() else {
            return;
        };
        let entry = tokio::runtime::Handle::current().block_on(manager.backup_info(&event.uid));
        self.found.lock().unwrap().push(entry.is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_finish_hooks_see_the_new_catalog_entry() {
    let _ = tracing_subscriber::fmt::try_init();
    let (_tmp, config) = server();
    let check = Arc::new(CatalogCheck::default());
    let manager = OperationManager::new(
        &config,
        HookChain::new().with(HookPriority::Monitor, check.clone()),
    );
    *check.manager.lock().unwrap() = Some(manager.clone());

    let uid = manager
        .submit_backup(BackupRequest::new("world", "world"))
        .await
        .unwrap();
    let snapshot = manager.wait_for(&uid).await.unwrap();
    assert_eq!(snapshot.state, OperationState::Done);

    tokio::time::timeout(Duration::from_secs(10), async {
        while check.found.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*check.found.lock().unwrap(), vec![true]);
}
