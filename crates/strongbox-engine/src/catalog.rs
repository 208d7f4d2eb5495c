use crate::archive::ArchiveReader;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use strongbox_lib::error::{BackupError, Result};
use strongbox_lib::paths;
use strongbox_lib::types::BackupEntry;
use tracing::{debug, info, warn};

/// Length of generated backup uids.
const UID_LEN: usize = 8;

/// Registry of completed backups found in the backup directory.
pub struct Catalog {
    dir: PathBuf,
    entries: HashMap<String, BackupEntry>,
    last_loaded: Option<Instant>,
    refresh_after: Duration,
}

impl Catalog {
    /// Creates a catalog for `dir` and scans it immediately.
    pub fn open(dir: impl Into<PathBuf>, refresh_after: Duration) -> Self {
        let mut catalog = Self {
            dir: dir.into(),
            entries: HashMap::new(),
            last_loaded: None,
            refresh_after,
        };
        catalog.load();
        catalog
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rebuilds the catalog from the backup directory. Every directory or zip
    /// archive carrying a metadata record is an entry; unreadable or malformed
    /// ones are skipped. Registered entries stored elsewhere are kept while
    /// their location exists.
    pub fn load(&mut self) {
        self.last_loaded = Some(Instant::now());
        let mut entries = self.scan();
        let found = entries.len();

        for (uid, entry) in self.entries.drain() {
            if entries.contains_key(&uid) {
                continue;
            }
            if entry.location.starts_with(&self.dir) || !entry.location.exists() {
                debug!("Dropping backup {} at {:?}", uid, entry.location);
                continue;
            }
            entries.insert(uid, entry);
        }
        self.entries = entries;
        info!("Loaded {} backups from {:?}", found, self.dir);
    }

    fn scan(&self) -> HashMap<String, BackupEntry> {
        let mut entries = HashMap::new();
        let read_dir = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Backup directory {:?} does not exist yet", self.dir);
                return entries;
            }
            Err(e) => {
                warn!("Cannot scan backup directory {:?}: {}", self.dir, e);
                return entries;
            }
        };

        for entry in read_dir.flatten() {
            let location = entry.path();
            match read_entry(&location) {
                Ok(Some(backup)) => {
                    entries.insert(backup.uid.clone(), backup);
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping backup at {:?}: {}", location, e),
            }
        }
        entries
    }

    /// Rescans the backup directory if the last scan is older than the refresh threshold.
    pub fn refresh_if_stale(&mut self) {
        let stale = self
            .last_loaded
            .map_or(true, |at| at.elapsed() > self.refresh_after);
        if stale {
            self.load();
        }
    }

    pub fn register(&mut self, entry: BackupEntry) {
        debug!("Registering backup {} ({})", entry.uid, entry.name);
        self.entries.insert(entry.uid.clone(), entry);
    }

    pub fn get(&self, uid: &str) -> Option<&BackupEntry> {
        self.entries.get(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.entries.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first.
    pub fn list(&self) -> Vec<BackupEntry> {
        let mut list: Vec<BackupEntry> = self.entries.values().cloned().collect();
        list.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.uid.cmp(&b.uid)));
        list
    }

    /// Generates a uid not used by any catalog entry nor rejected by `taken`.
    pub fn generate_uid(&self, mut taken: impl FnMut(&str) -> bool) -> String {
        loop {
            let uid: String = uuid::Uuid::new_v4()
                .simple()
                .to_string()
                .chars()
                .take(UID_LEN)
                .collect();
            if !self.contains(&uid) && !taken(&uid) {
                return uid;
            }
        }
    }
}

/// Reads the metadata record of the backup stored at `location`, a directory
/// or a zip archive. Returns `Ok(None)` when there is no record.
pub fn read_entry(location: &Path) -> Result<Option<BackupEntry>> {
    if location.is_file() {
        if !paths::is_archive(location) {
            return Ok(None);
        }
        return ArchiveReader::open(location)?.read_entry();
    }
    let info = paths::info_path(location);
    if !info.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(&info).map_err(|e| BackupError::io_at(&info, e))?;
    BackupEntry::parse_info(&text, location.to_path_buf()).map(Some)
}
