//! Operation records and the copy algorithm shared by both execution strategies.

use crate::archive::{ArchiveReader, ArchiveWriter};
use crate::events::OperationEvent;
use crate::index::FileTreeIndex;
use crate::isolated::IsolatedWorker;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use filetime::FileTime;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use strongbox_lib::paths::{self, INDEX_FILE, INFO_FILE};
use strongbox_lib::protocol::{LaunchArgs, ProgressRecord};
use strongbox_lib::types::{
    millis_to_datetime, BackupEntry, OperationKind, OperationSnapshot, OperationState,
};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Headroom applied to the total size so progress stays below 1.0 until the
/// operation is finalized.
const PROGRESS_HEADROOM: f64 = 1.15;

/// Immutable parameters of one backup or restore.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub uid: String,
    pub name: String,
    pub kind: OperationKind,
    /// Directory index paths are relative to.
    pub base_dir: PathBuf,
    /// Directory ignore paths are relative to.
    pub user_dir: PathBuf,
    pub source_root: PathBuf,
    pub additional_sources: Vec<PathBuf>,
    pub dest_root: PathBuf,
    pub ignore: Vec<PathBuf>,
    pub clear_destination: bool,
    pub offline: bool,
}

impl OperationSpec {
    pub fn launch_args(&self) -> LaunchArgs {
        LaunchArgs {
            backup_name: self.name.clone(),
            uid: self.uid.clone(),
            base_dir: self.base_dir.clone(),
            user_dir: self.user_dir.clone(),
            ignore_list: self.ignore.clone(),
            clear_dst: self.clear_destination,
            additional_sources: self.additional_sources.clone(),
            source_root: self.source_root.clone(),
            dest_root: self.dest_root.clone(),
        }
    }

    /// Rebuilds the operation parameters on the launcher side. A source root carrying an index
    /// is a previous backup, so the operation is a restore.
    pub fn from_launch_args(args: LaunchArgs) -> Self {
        let kind = if stores_backup(&args.source_root) {
            OperationKind::Restore
        } else {
            OperationKind::Backup
        };
        Self {
            uid: args.uid,
            name: args.backup_name,
            kind,
            base_dir: args.base_dir,
            user_dir: args.user_dir,
            source_root: args.source_root,
            additional_sources: args.additional_sources,
            dest_root: args.dest_root,
            ignore: args.ignore_list,
            clear_destination: args.clear_dst,
            offline: true,
        }
    }
}

#[derive(Debug, Clone)]
struct OperationRecord {
    state: OperationState,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    data_size: u64,
    data_copied: u64,
    progress: f32,
    current_file: Option<String>,
    error: String,
    running: bool,
    entry: Option<BackupEntry>,
}

impl Default for OperationRecord {
    fn default() -> Self {
        Self {
            state: OperationState::Idle,
            status: OperationState::Idle.to_string(),
            start_time: None,
            end_time: None,
            data_size: 0,
            data_copied: 0,
            progress: 0.0,
            current_file: None,
            error: String::new(),
            running: false,
            entry: None,
        }
    }
}

impl OperationRecord {
    fn append_error(&mut self, message: &str) {
        if !self.error.is_empty() {
            self.error.push('\n');
        }
        self.error.push_str(message);
    }

    fn refresh_status(&mut self) {
        self.status = match (self.state, &self.current_file) {
            (OperationState::Copying, Some(file)) => {
                let name = Path::new(file)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| file.clone());
                format!("Processing {}", name)
            }
            (state, _) => state.to_string(),
        };
    }
}

/// How an operation is executed.
#[derive(Debug, Clone)]
pub enum Worker {
    /// On a blocking thread of this process.
    InProcess,
    /// In a spawned `strongbox-launcher` child process.
    Isolated(IsolatedWorker),
}

/// A registered backup or restore: its parameters, its execution strategy
/// and the mutable record its worker updates.
pub struct Operation {
    spec: OperationSpec,
    worker: Worker,
    record: Mutex<OperationRecord>,
}

impl Operation {
    pub fn new(spec: OperationSpec, worker: Worker) -> Self {
        Self {
            spec,
            worker,
            record: Mutex::new(OperationRecord::default()),
        }
    }

    pub fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    pub fn uid(&self) -> &str {
        &self.spec.uid
    }

    fn record(&self) -> MutexGuard<'_, OperationRecord> {
        // A panicking worker must not make the operation unreadable.
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies one progress record to the operation.
    pub fn apply(&self, update: ProgressRecord) {
        let mut record = self.record();
        match update {
            ProgressRecord::StartTime(millis) => {
                record.start_time = millis_to_datetime(millis);
                record.running = true;
            }
            ProgressRecord::EndTime(millis) => {
                record.end_time = millis_to_datetime(millis);
                record.running = false;
            }
            ProgressRecord::Status(state) => {
                record.state = state;
                record.refresh_status();
            }
            ProgressRecord::Error(message) => record.append_error(&message),
            ProgressRecord::CurrentFile(file) => {
                record.current_file = Some(file);
                record.refresh_status();
            }
            ProgressRecord::DataSize(size) => record.data_size = size,
            ProgressRecord::DataCopied(copied) => record.data_copied = copied,
            ProgressRecord::Progress(progress) => record.progress = progress.clamp(0.0, 1.0),
            ProgressRecord::End => {}
        }
    }

    pub fn state(&self) -> OperationState {
        self.record().state
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.record().start_time
    }

    pub fn entry(&self) -> Option<BackupEntry> {
        self.record().entry.clone()
    }

    pub fn set_entry(&self, entry: BackupEntry) {
        self.record().entry = Some(entry);
    }

    /// Ends the operation in `Error` after its worker died without settling it.
    pub fn fail(&self, reason: &str) {
        let mut record = self.record();
        record.state = OperationState::Error;
        record.refresh_status();
        record.append_error(reason);
        record.end_time = Some(record.end_time.unwrap_or_else(Utc::now));
        record.running = false;
        record.entry = None;
    }

    /// Marks an operation that was never allowed to start.
    pub fn cancel(&self, reason: &str) {
        let mut record = self.record();
        record.state = OperationState::Canceled;
        record.refresh_status();
        record.append_error(reason);
        record.end_time = Some(Utc::now());
        record.running = false;
    }

    /// Settles the record after an isolated child has exited and returns
    /// whether the operation succeeded. `exit_error` describes an abnormal exit.
    pub fn settle_after_exit(&self, exit_error: Option<String>) -> bool {
        let mut record = self.record();
        if record.end_time.is_none() {
            record.end_time = Some(Utc::now());
        }
        record.running = false;

        if let Some(ref message) = exit_error {
            record.append_error(message);
            if record.state != OperationState::Error {
                record.state = OperationState::Error;
                record.refresh_status();
            }
        } else if !record.state.is_terminal() {
            record.append_error("launcher exited without reaching a terminal state");
            record.state = OperationState::Error;
            record.refresh_status();
        }

        let success = record.state == OperationState::Done && record.error.is_empty();
        if success && self.spec.kind == OperationKind::Backup && record.entry.is_none() {
            record.entry = Some(BackupEntry {
                uid: self.spec.uid.clone(),
                name: self.spec.name.clone(),
                date: record.start_time.unwrap_or_else(Utc::now),
                size: record.data_size,
                location: self.spec.dest_root.clone(),
            });
        }
        success
    }

    pub fn completion_event(&self) -> OperationEvent {
        let record = self.record();
        OperationEvent {
            uid: self.spec.uid.clone(),
            name: self.spec.name.clone(),
            offline: self.spec.offline,
            start_time: record.start_time,
            end_time: Some(record.end_time.unwrap_or_else(Utc::now)),
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let record = self.record();
        OperationSnapshot {
            uid: self.spec.uid.clone(),
            name: self.spec.name.clone(),
            kind: self.spec.kind,
            state: record.state,
            status: record.status.clone(),
            offline: self.spec.offline,
            destination: self.spec.dest_root.clone(),
            start_time: record.start_time,
            end_time: record.end_time,
            data_size: record.data_size,
            data_copied: record.data_copied,
            progress: record.progress,
            current_file: record.current_file.clone(),
            error: record.error.clone(),
            running: record.running,
        }
    }

    /// Starts the worker. The permit is released and the completion event sent
    /// exactly once when the operation terminates, even if the worker panics.
    pub fn start(
        self: Arc<Self>,
        events: mpsc::UnboundedSender<OperationEvent>,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        info!("Starting operation {} ({})", self.spec.uid, self.spec.name);
        let op = self.clone();
        let run = match self.worker.clone() {
            Worker::InProcess => tokio::task::spawn_blocking(move || {
                if let Some(entry) = execute(&op.spec, &mut |update| op.apply(update)) {
                    op.set_entry(entry);
                }
            }),
            Worker::Isolated(isolated) => tokio::spawn(async move {
                isolated.run(&op).await;
            }),
        };
        self.supervise(run, events, permit)
    }

    fn supervise(
        self: Arc<Self>,
        run: JoinHandle<()>,
        events: mpsc::UnboundedSender<OperationEvent>,
        permit: OwnedSemaphorePermit,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = run.await {
                error!("Worker of operation {} died: {}", self.spec.uid, e);
                self.fail(&format!("worker died: {}", e));
            }
            drop(permit);
            let _ = events.send(self.completion_event());
        })
    }
}

/// Whether `root` is a previous backup: a directory with an index or an
/// archive holding one.
fn stores_backup(root: &Path) -> bool {
    if paths::index_path(root).is_file() {
        return true;
    }
    root.is_file()
        && paths::is_archive(root)
        && ArchiveReader::open(root).map_or(false, |reader| reader.contains(INDEX_FILE))
}

/// Where an operation reads its files from.
enum Source {
    /// A directory; leaf paths resolve against it.
    Tree(PathBuf),
    Archive(ArchiveReader),
}

impl Source {
    /// Opens the source root and its index: a stored index when the root is a
    /// previous backup, otherwise a freshly built one. The flag tells which.
    fn open(spec: &OperationSpec) -> Result<(Self, FileTreeIndex, bool)> {
        let root = &spec.source_root;
        if root.is_file() && paths::is_archive(root) {
            let mut reader = ArchiveReader::open(root)
                .with_context(|| format!("Failed to open archive {:?}", root))?;
            if reader.contains(INDEX_FILE) {
                debug!("Reusing index of archive {:?}", root);
                let index = reader
                    .read_index()
                    .with_context(|| format!("Failed to load index of {:?}", root))?;
                return Ok((Self::Archive(reader), index, false));
            }
        }

        let stored = paths::index_path(root);
        if stored.is_file() {
            debug!("Reusing index at {:?}", stored);
            let index = FileTreeIndex::load(&stored)
                .with_context(|| format!("Failed to load index {:?}", stored))?;
            return Ok((Self::Tree(root.clone()), index, false));
        }

        let mut index = FileTreeIndex::build(root, &spec.base_dir)
            .with_context(|| format!("Failed to index {:?}", root))?;
        for extra in &spec.additional_sources {
            let more = FileTreeIndex::build(extra, &spec.base_dir)
                .with_context(|| format!("Failed to index {:?}", extra))?;
            index.merge(&more);
        }
        Ok((Self::Tree(spec.base_dir.clone()), index, true))
    }
}

/// Where an operation writes its files to.
enum Destination {
    Tree {
        root: PathBuf,
        /// Metadata record waiting to be moved into place on commit.
        pending_info: Option<PathBuf>,
    },
    Archive(ArchiveWriter),
}

impl Destination {
    fn open(root: &Path) -> Result<Self> {
        if paths::is_archive(root) {
            let writer = ArchiveWriter::create(root)
                .with_context(|| format!("Failed to create archive {:?}", root))?;
            return Ok(Self::Archive(writer));
        }
        Ok(Self::Tree {
            root: root.to_path_buf(),
            pending_info: None,
        })
    }

    /// Stores the index and the metadata record of a fresh backup.
    fn write_metadata(&mut self, index: &FileTreeIndex, entry: &BackupEntry) -> Result<()> {
        match self {
            Self::Tree { root, pending_info } => {
                fs::create_dir_all(&*root)
                    .with_context(|| format!("Failed to create {:?}", root))?;
                index.save(&paths::index_path(root))?;
                let pending = paths::pending_path(&paths::info_path(root));
                *pending_info = Some(pending.clone());
                fs::write(&pending, entry.render_info())
                    .with_context(|| format!("Failed to write {:?}", pending))?;
            }
            Self::Archive(writer) => {
                writer.add_bytes(INDEX_FILE, &index.to_bytes()?)?;
                writer.add_bytes(INFO_FILE, entry.render_info().as_bytes())?;
            }
        }
        Ok(())
    }

    /// Copies one leaf. Returns the number of bytes copied.
    fn copy(&mut self, source: &mut Source, leaf: &str) -> Result<u64> {
        let copied = match (source, self) {
            (Source::Tree(base), Self::Tree { root, .. }) => {
                return copy_leaf(&base.join(leaf), &root.join(leaf));
            }
            (Source::Tree(base), Self::Archive(writer)) => writer.add_file(leaf, &base.join(leaf)),
            (Source::Archive(reader), Self::Tree { root, .. }) => {
                reader.extract(leaf, &root.join(leaf))
            }
            (Source::Archive(reader), Self::Archive(writer)) => reader.copy_to(leaf, writer),
        };
        copied.with_context(|| format!("Failed to copy {:?}", leaf))
    }

    /// Moves the metadata record or the archive into place.
    fn commit(&mut self) -> Result<()> {
        match self {
            Self::Tree { root, pending_info } => {
                if let Some(pending) = pending_info.take() {
                    let info = paths::info_path(root);
                    if let Err(e) = fs::rename(&pending, &info) {
                        let _ = fs::remove_file(&pending);
                        return Err(e).with_context(|| format!("Failed to write {:?}", info));
                    }
                }
            }
            Self::Archive(writer) => writer
                .finish()
                .with_context(|| format!("Failed to finish archive {:?}", writer.target()))?,
        }
        Ok(())
    }
}

impl Drop for Destination {
    fn drop(&mut self) {
        if let Self::Tree {
            pending_info: Some(pending),
            ..
        } = self
        {
            debug!("Discarding metadata {:?}", pending);
            let _ = fs::remove_file(pending);
        }
    }
}

/// Runs one backup or restore to completion, reporting through `sink`.
///
/// Never fails: errors end the operation in [`OperationState::Error`]. Returns
/// the catalog entry when a fresh backup completed successfully.
pub fn execute(spec: &OperationSpec, sink: &mut dyn FnMut(ProgressRecord)) -> Option<BackupEntry> {
    let started = Utc::now();
    sink(ProgressRecord::StartTime(started.timestamp_millis()));
    sink(ProgressRecord::Status(OperationState::Initializing));

    let outcome = copy_tree(spec, started, sink);
    let entry = match outcome {
        Ok(entry) => {
            sink(ProgressRecord::Status(OperationState::Done));
            sink(ProgressRecord::Progress(1.0));
            info!("Operation {} finished", spec.uid);
            entry
        }
        Err(e) => {
            error!("Operation {} failed: {:#}", spec.uid, e);
            sink(ProgressRecord::Error(format!("{:#}", e)));
            sink(ProgressRecord::Status(OperationState::Error));
            None
        }
    };
    sink(ProgressRecord::EndTime(Utc::now().timestamp_millis()));
    entry
}

fn copy_tree(
    spec: &OperationSpec,
    started: DateTime<Utc>,
    sink: &mut dyn FnMut(ProgressRecord),
) -> Result<Option<BackupEntry>> {
    let (mut source, mut index, fresh) = Source::open(spec)?;

    for ignored in &spec.ignore {
        let relative = match ignored.strip_prefix(&spec.user_dir) {
            Ok(relative) => relative,
            Err(_) if ignored.is_relative() => ignored.as_path(),
            Err(_) => continue,
        };
        if index.remove(&relative.to_string_lossy()) {
            debug!("Ignoring {:?}", relative);
        }
    }
    index.remove_metadata_entries();

    let total = if matches!(source, Source::Tree(_)) && spec.source_root.is_file() {
        fs::metadata(&spec.source_root)
            .with_context(|| format!("Failed to size {:?}", spec.source_root))?
            .len()
    } else {
        index.size()
    };
    sink(ProgressRecord::DataSize(total));

    if spec.clear_destination {
        sink(ProgressRecord::Status(OperationState::ClearingDestination));
        clear_destination(&index, &spec.dest_root)?;
    }

    let mut destination = Destination::open(&spec.dest_root)?;
    let entry = if fresh {
        let entry = BackupEntry {
            uid: spec.uid.clone(),
            name: spec.name.clone(),
            date: started,
            size: total,
            location: spec.dest_root.clone(),
        };
        destination.write_metadata(&index, &entry)?;
        Some(entry)
    } else {
        None
    };

    sink(ProgressRecord::Status(OperationState::Copying));
    let mut copied: u64 = 0;
    for leaf in index.iter() {
        sink(ProgressRecord::CurrentFile(leaf.clone()));
        copied += destination.copy(&mut source, &leaf)?;
        sink(ProgressRecord::DataCopied(copied));
        if total > 0 {
            sink(ProgressRecord::Progress(
                (copied as f64 / (total as f64 * PROGRESS_HEADROOM)) as f32,
            ));
        }
    }

    sink(ProgressRecord::Status(OperationState::Finalizing));
    destination.commit()?;
    Ok(entry)
}

/// Deletes the destination files the copy would overwrite, along with every
/// other file next to them. Directories are preserved; an archive destination
/// is deleted outright.
fn clear_destination(index: &FileTreeIndex, dest_root: &Path) -> Result<()> {
    if dest_root.is_file() {
        return fs::remove_file(dest_root)
            .with_context(|| format!("Failed to delete {:?}", dest_root));
    }

    let dirs: BTreeSet<PathBuf> = index
        .iter()
        .filter_map(|leaf| index.parent_of(&leaf))
        .map(|parent| dest_root.join(parent))
        .collect();

    for dir in dirs {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
        };
        for entry in entries {
            let entry = entry.with_context(|| format!("Failed to list {:?}", dir))?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            debug!("Clearing {:?}", entry.path());
            fs::remove_file(entry.path())
                .with_context(|| format!("Failed to delete {:?}", entry.path()))?;
        }
    }
    Ok(())
}

/// Copies one file, preserving its modification time. Returns the source length.
fn copy_leaf(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let meta = fs::metadata(src).with_context(|| format!("Failed to read {:?}", src))?;
    fs::copy(src, dst).with_context(|| format!("Failed to copy {:?} to {:?}", src, dst))?;
    filetime::set_file_mtime(dst, FileTime::from_last_modification_time(&meta))
        .with_context(|| format!("Failed to set modification time of {:?}", dst))?;
    Ok(meta.len())
}
