//! Operation manager: catalog, registry, FIFO queue and event sequencing.
//!
//! At most one operation is active at a time. Submitting an operation while
//! nothing is active fires its pre-start event; every completion fires the
//! pre-start event of the next queued operation. All events are handled by a
//! single event loop, in order, and re-broadcast to subscribers once the
//! manager state reflects them.

use crate::catalog::Catalog;
use crate::events::{HookChain, HookDecision, OperationEvent};
use crate::isolated::IsolatedWorker;
use crate::worker::{Operation, OperationSpec, Worker};
use chrono::{DateTime, Local, Utc};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use strongbox_lib::config::{Config, LauncherConfig};
use strongbox_lib::error::{BackupError, Result};
use strongbox_lib::paths;
use strongbox_lib::types::{BackupEntry, OperationKind, OperationSnapshot};
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

/// Active copy operations system-wide.
const MAX_ACTIVE: usize = 1;

/// Settings the manager takes from the configuration.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub base_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub catalog_refresh: Duration,
    pub launcher: LauncherConfig,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            base_dir: config.global.base_path(),
            backup_dir: config.global.backup_path(),
            catalog_refresh: config.global.catalog_refresh(),
            launcher: config.launcher.clone(),
        }
    }
}

impl ManagerSettings {
    fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }
}

/// Parameters of a backup submission. Relative paths resolve against the base directory.
#[derive(Debug, Clone, Default)]
pub struct BackupRequest {
    pub name: String,
    /// Defaults to `<backup_dir>/<name>_<yyyy-MM-dd-HH-mm-ss>`, with a `.zip`
    /// extension when `archive` is set. A destination ending in `.zip` is
    /// written as a zip archive.
    pub destination: Option<PathBuf>,
    pub archive: bool,
    pub ignore: Vec<PathBuf>,
    /// Also ignore the plain files directly under the source root.
    pub ignore_root_files: bool,
    /// Hold the managed service and run in an isolated child process.
    pub offline: bool,
    pub source: PathBuf,
    pub additional_sources: Vec<PathBuf>,
}

impl BackupRequest {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            ..Default::default()
        }
    }
}

/// What the event loop does after an event has been applied to the state.
enum Action {
    /// Start the worker of the dequeued operation.
    Start(Arc<Operation>),
    /// The operation was refused; its completion event must follow.
    Cancel(Arc<Operation>),
    /// Fire the pre-start event of the new queue head.
    Announce(OperationEvent),
    Nothing,
}

struct ManagerState {
    catalog: Catalog,
    registry: HashMap<String, Arc<Operation>>,
    /// Finished operations replaced in the registry by a later run under the same uid.
    history: Vec<OperationSnapshot>,
    queue: VecDeque<String>,
    active: Option<String>,
}

impl ManagerState {
    fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            registry: HashMap::new(),
            history: Vec::new(),
            queue: VecDeque::new(),
            active: None,
        }
    }

    fn is_head(&self, uid: &str) -> bool {
        self.queue.front().map(String::as_str) == Some(uid)
    }

    fn pre_start_of(&self, uid: &str) -> Option<OperationEvent> {
        self.registry
            .get(uid)
            .map(|op| OperationEvent::pre_start(uid, &op.spec().name, op.spec().offline))
    }

    fn next_offline(&self) -> Option<bool> {
        self.queue
            .front()
            .and_then(|uid| self.registry.get(uid))
            .map(|op| op.spec().offline)
    }

    /// Registers and enqueues `op`. Returns its pre-start event when nothing was active.
    fn enqueue(&mut self, op: Arc<Operation>) -> Option<OperationEvent> {
        let uid = op.uid().to_string();
        if let Some(previous) = self.registry.insert(uid.clone(), op) {
            self.history.push(previous.snapshot());
        }
        self.queue.push_back(uid.clone());
        if self.active.is_some() {
            debug!("Queued operation {} behind {:?}", uid, self.active);
            return None;
        }
        self.active = Some(uid.clone());
        self.pre_start_of(&uid)
    }

    /// Applies one event, after the hook chain has decided on it.
    fn transition(&mut self, event: &OperationEvent, decision: &HookDecision) -> Action {
        if event.is_pre_start() {
            if !self.is_head(&event.uid) {
                debug!("Ignoring pre-start of {}: not at the head of the queue", event.uid);
                return Action::Nothing;
            }
            self.queue.pop_front();
            let Some(op) = self.registry.get(&event.uid).cloned() else {
                warn!("Pre-start for unregistered operation {}", event.uid);
                return Action::Nothing;
            };
            return match decision {
                HookDecision::Allow => Action::Start(op),
                HookDecision::Deny(reason) => {
                    info!("Operation {} canceled: {}", event.uid, reason);
                    op.cancel(reason);
                    Action::Cancel(op)
                }
            };
        }

        if let Some(entry) = self.registry.get(&event.uid).and_then(|op| op.entry()) {
            self.catalog.register(entry);
        }
        if self.active.as_deref() != Some(event.uid.as_str()) {
            warn!("Completion of {} which is not the active operation", event.uid);
            return Action::Nothing;
        }
        match self.queue.front().cloned() {
            Some(head) => {
                self.active = Some(head.clone());
                self.pre_start_of(&head)
                    .map_or(Action::Nothing, Action::Announce)
            }
            None => {
                self.active = None;
                Action::Nothing
            }
        }
    }
}

struct Shared {
    state: Mutex<ManagerState>,
    hooks: HookChain,
    slot: Arc<Semaphore>,
    event_tx: mpsc::UnboundedSender<OperationEvent>,
    broadcast_tx: broadcast::Sender<OperationEvent>,
    settings: ManagerSettings,
}

/// Handle to the operation manager. Clones share the same state.
#[derive(Clone)]
pub struct OperationManager {
    shared: Arc<Shared>,
}

impl OperationManager {
    /// Scans the backup directory and spawns the event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &Config, hooks: HookChain) -> Self {
        Self::with_settings(ManagerSettings::from(config), hooks)
    }

    pub fn with_settings(settings: ManagerSettings, hooks: HookChain) -> Self {
        let catalog = Catalog::open(&settings.backup_dir, settings.catalog_refresh);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(100);
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState::new(catalog)),
            hooks,
            slot: Arc::new(Semaphore::new(MAX_ACTIVE)),
            event_tx,
            broadcast_tx,
            settings,
        });
        tokio::spawn(Self::event_loop(shared.clone(), event_rx));
        Self { shared }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    /// Receives every handled event, after the manager state reflects it.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.shared.broadcast_tx.subscribe()
    }

    pub async fn submit_backup(&self, request: BackupRequest) -> Result<String> {
        let settings = &self.shared.settings;
        if request.name.trim().is_empty() {
            return Err(BackupError::Configuration("backup name cannot be empty".to_string()));
        }

        let source = settings.resolve(&request.source);
        if !source.exists() {
            return Err(BackupError::Configuration(format!(
                "source root {:?} does not exist",
                source
            )));
        }
        let mut additional_sources = Vec::with_capacity(request.additional_sources.len());
        for extra in &request.additional_sources {
            let extra = settings.resolve(extra);
            if !extra.exists() {
                return Err(BackupError::Configuration(format!(
                    "additional source {:?} does not exist",
                    extra
                )));
            }
            additional_sources.push(extra);
        }

        let destination = match request.destination {
            Some(ref dest) => settings.resolve(dest),
            None => {
                let mut file_name =
                    format!("{}_{}", request.name, Local::now().format("%Y-%m-%d-%H-%M-%S"));
                if request.archive {
                    file_name = format!("{}.{}", file_name, paths::ARCHIVE_EXTENSION);
                }
                settings.backup_dir.join(file_name)
            }
        };

        let mut ignore: Vec<PathBuf> = request.ignore.iter().map(|p| settings.resolve(p)).collect();
        ignore.push(settings.backup_dir.clone());
        if request.ignore_root_files && source.is_dir() {
            let entries = fs::read_dir(&source).map_err(|e| BackupError::io_at(&source, e))?;
            for entry in entries.flatten() {
                if entry.file_type().map(|t| !t.is_dir()).unwrap_or(false) {
                    ignore.push(entry.path());
                }
            }
        }

        let worker = if request.offline {
            Worker::Isolated(IsolatedWorker::from_config(&settings.launcher))
        } else {
            Worker::InProcess
        };

        let mut state = self.shared.state.lock().await;
        let uid = state
            .catalog
            .generate_uid(|candidate| state.registry.contains_key(candidate));
        let spec = OperationSpec {
            uid: uid.clone(),
            name: request.name,
            kind: OperationKind::Backup,
            base_dir: settings.base_dir.clone(),
            user_dir: settings.base_dir.clone(),
            source_root: source,
            additional_sources,
            dest_root: destination,
            ignore,
            clear_destination: false,
            offline: request.offline,
        };
        info!("Submitting backup {} of {:?}", uid, spec.source_root);
        let announce = state.enqueue(Arc::new(Operation::new(spec, worker)));
        drop(state);

        if let Some(event) = announce {
            self.fire(event);
        }
        Ok(uid)
    }

    /// Queues a restore of the catalog entry `uid` into `destination`
    /// (relative to the base directory, default the base directory itself).
    /// The restore runs under the backup's uid. Returns `false` when the uid is
    /// unknown or an operation with that uid is still pending.
    pub async fn submit_restore(
        &self,
        uid: &str,
        destination: Option<&Path>,
        clear_destination: bool,
        offline: bool,
    ) -> bool {
        let settings = &self.shared.settings;
        let mut state = self.shared.state.lock().await;
        state.catalog.refresh_if_stale();

        let Some(entry) = state.catalog.get(uid).cloned() else {
            warn!("Cannot restore unknown backup {}", uid);
            return false;
        };
        if let Some(existing) = state.registry.get(uid) {
            if !existing.state().is_terminal() {
                warn!("Backup {} already has a pending operation", uid);
                return false;
            }
        }

        let worker = if offline {
            Worker::Isolated(IsolatedWorker::from_config(&settings.launcher))
        } else {
            Worker::InProcess
        };
        let spec = OperationSpec {
            uid: entry.uid.clone(),
            name: entry.name.clone(),
            kind: OperationKind::Restore,
            base_dir: entry.location.clone(),
            user_dir: settings.base_dir.clone(),
            source_root: entry.location.clone(),
            additional_sources: vec![],
            dest_root: settings.resolve(destination.unwrap_or_else(|| Path::new("."))),
            ignore: vec![],
            clear_destination,
            offline,
        };
        info!("Submitting restore of {} into {:?}", uid, spec.dest_root);
        let announce = state.enqueue(Arc::new(Operation::new(spec, worker)));
        drop(state);

        if let Some(event) = announce {
            self.fire(event);
        }
        true
    }

    fn fire(&self, event: OperationEvent) {
        if self.shared.event_tx.send(event).is_err() {
            error!("Event loop is gone, operation will not start");
        }
    }

    async fn event_loop(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<OperationEvent>) {
        while let Some(event) = events.recv().await {
            if event.is_completion() {
                shared.handle_completion(&event).await;
            } else {
                shared.handle_pre_start(&event).await;
            }
            let _ = shared.broadcast_tx.send(event);
        }
    }

    async fn operation(&self, uid: &str) -> Option<Arc<Operation>> {
        self.shared.state.lock().await.registry.get(uid).cloned()
    }

    async fn catalog_entry(&self, uid: &str) -> Option<BackupEntry> {
        self.shared.state.lock().await.catalog.get(uid).cloned()
    }

    pub async fn operation_name(&self, uid: &str) -> Option<String> {
        match self.operation(uid).await {
            Some(op) => Some(op.spec().name.clone()),
            None => self.catalog_entry(uid).await.map(|e| e.name),
        }
    }

    pub async fn destination_name(&self, uid: &str) -> Option<String> {
        match self.operation(uid).await {
            Some(op) => Some(op.spec().dest_root.to_string_lossy().into_owned()),
            None => self
                .catalog_entry(uid)
                .await
                .map(|e| e.location.to_string_lossy().into_owned()),
        }
    }

    pub async fn start_time(&self, uid: &str) -> Option<DateTime<Utc>> {
        match self.operation(uid).await {
            Some(op) => op.start_time(),
            None => self.catalog_entry(uid).await.map(|e| e.date),
        }
    }

    pub async fn total_size(&self, uid: &str) -> Option<u64> {
        match self.operation(uid).await {
            Some(op) => Some(op.snapshot().data_size),
            None => self.catalog_entry(uid).await.map(|e| e.size),
        }
    }

    pub async fn bytes_copied(&self, uid: &str) -> Option<u64> {
        self.operation(uid).await.map(|op| op.snapshot().data_copied)
    }

    /// Progress as a percentage with two decimals, `"0.00"` when unknown.
    pub async fn progress(&self, uid: &str) -> String {
        let percent = match self.operation(uid).await {
            Some(op) => {
                let snapshot = op.snapshot();
                if snapshot.data_size == 0 {
                    0.0
                } else {
                    snapshot.progress * 100.0
                }
            }
            None => 0.0,
        };
        format!("{:.2}", percent)
    }

    pub async fn status(&self, uid: &str) -> Option<String> {
        self.operation(uid).await.map(|op| op.snapshot().status)
    }

    pub async fn error(&self, uid: &str) -> Option<String> {
        self.operation(uid).await.map(|op| op.snapshot().error)
    }

    pub async fn is_running(&self, uid: &str) -> bool {
        self.operation(uid)
            .await
            .map_or(false, |op| op.snapshot().running)
    }

    pub async fn snapshot(&self, uid: &str) -> Option<OperationSnapshot> {
        self.operation(uid).await.map(|op| op.snapshot())
    }

    pub async fn backup_info(&self, uid: &str) -> Option<BackupEntry> {
        let mut state = self.shared.state.lock().await;
        state.catalog.refresh_if_stale();
        state.catalog.get(uid).cloned()
    }

    /// Catalog entries, oldest first.
    pub async fn list_catalog(&self) -> Vec<BackupEntry> {
        let mut state = self.shared.state.lock().await;
        state.catalog.refresh_if_stale();
        state.catalog.list()
    }

    /// Every known operation, earlier runs under a reused uid included, by
    /// start time; operations that have not started come last.
    pub async fn list_operations(&self) -> Vec<OperationSnapshot> {
        let state = self.shared.state.lock().await;
        let mut list: Vec<OperationSnapshot> = state
            .history
            .iter()
            .cloned()
            .chain(state.registry.values().map(|op| op.snapshot()))
            .collect();
        list.sort_by(|a, b| match (a.start_time, b.start_time) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.uid.cmp(&b.uid)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.uid.cmp(&b.uid),
        });
        list
    }

    pub async fn active_uid(&self) -> Option<String> {
        self.shared.state.lock().await.active.clone()
    }

    /// Uids waiting for their turn, in execution order.
    pub async fn queued(&self) -> Vec<String> {
        self.shared.state.lock().await.queue.iter().cloned().collect()
    }

    pub async fn has_operations_queued(&self) -> bool {
        !self.shared.state.lock().await.queue.is_empty()
    }

    pub async fn next_operation_is_offline(&self) -> bool {
        self.shared.state.lock().await.next_offline().unwrap_or(false)
    }

    /// Waits until operation `uid` has completed and returns its final snapshot.
    /// Returns `None` for unknown uids.
    pub async fn wait_for(&self, uid: &str) -> Option<OperationSnapshot> {
        let mut events = self.subscribe();
        loop {
            let op = self.operation(uid).await?;
            let snapshot = op.snapshot();
            if snapshot.state.is_terminal() && snapshot.end_time.is_some() {
                // Settled; make sure the manager has seen the completion too.
                if self.active_uid().await.as_deref() != Some(uid) {
                    return Some(snapshot);
                }
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Some(op.snapshot()),
            }
        }
    }
}

impl Shared {
    async fn handle_pre_start(&self, event: &OperationEvent) {
        let is_head = self.state.lock().await.is_head(&event.uid);
        let decision = if is_head {
            let hooks = self.hooks.clone();
            let pending = event.clone();
            tokio::task::spawn_blocking(move || hooks.before_start(&pending))
                .await
                .unwrap_or_else(|e| HookDecision::Deny(format!("hook panicked: {}", e)))
        } else {
            HookDecision::Allow
        };

        let action = self.state.lock().await.transition(event, &decision);
        self.perform(action).await;
    }

    /// Registers the outcome, runs the post-finish hooks, then advances the queue.
    async fn handle_completion(&self, event: &OperationEvent) {
        info!("Operation {} completed", event.uid);
        let (action, next_offline) = {
            let mut state = self.state.lock().await;
            let action = state.transition(event, &HookDecision::Allow);
            (action, state.next_offline())
        };

        let hooks = self.hooks.clone();
        let finished = event.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || hooks.after_finish(&finished, next_offline)).await
        {
            error!("Post-finish hook panicked: {}", e);
        }
        self.perform(action).await;
    }

    async fn perform(&self, action: Action) {
        match action {
            Action::Start(op) => match self.slot.clone().acquire_owned().await {
                Ok(permit) => {
                    op.start(self.event_tx.clone(), permit);
                }
                Err(e) => error!("Cannot start operation {}: {}", op.uid(), e),
            },
            Action::Cancel(op) => {
                let _ = self.event_tx.send(op.completion_event());
            }
            Action::Announce(next) => {
                let _ = self.event_tx.send(next);
            }
            Action::Nothing => {}
        }
    }
}
