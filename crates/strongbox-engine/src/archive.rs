//! Backups stored as a single zip archive.
//!
//! An archive holds the copied tree under the same relative paths a directory
//! backup uses, next to the `backup.index` and `backup.info` entries. Archives
//! are written to a pending file that [`ArchiveWriter::finish`] moves into
//! place; a writer dropped before that deletes its pending file.

use crate::index::FileTreeIndex;
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike};
use filetime::FileTime;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use strongbox_lib::error::{BackupError, Result};
use strongbox_lib::paths::{self, INDEX_FILE, INFO_FILE};
use strongbox_lib::types::BackupEntry;
use tracing::{debug, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub struct ArchiveWriter {
    target: PathBuf,
    pending: PathBuf,
    zip: Option<ZipWriter<File>>,
}

impl ArchiveWriter {
    /// Starts a new archive that will land at `target`.
    pub fn create(target: &Path) -> Result<Self> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io_at(parent, e))?;
        }
        let pending = paths::pending_path(target);
        let file = File::create(&pending).map_err(|e| BackupError::io_at(&pending, e))?;
        debug!("Writing archive {:?}", pending);
        Ok(Self {
            target: target.to_path_buf(),
            pending,
            zip: Some(ZipWriter::new(file)),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Stores `data` as the entry `name`.
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let modified = zip_time(SystemTime::now());
        self.add_reader(name, &mut &data[..], modified, data.len() as u64)?;
        Ok(())
    }

    /// Stores the file at `src` as the entry `name`, keeping its modification
    /// time. Returns the source length.
    pub fn add_file(&mut self, name: &str, src: &Path) -> Result<u64> {
        let meta = fs::metadata(src).map_err(|e| BackupError::io_at(src, e))?;
        let file = File::open(src).map_err(|e| BackupError::io_at(src, e))?;
        let modified = meta.modified().map(zip_time).unwrap_or_default();
        self.add_reader(name, &mut BufReader::new(file), modified, meta.len())?;
        Ok(meta.len())
    }

    fn add_reader(
        &mut self,
        name: &str,
        reader: &mut dyn Read,
        modified: zip::DateTime,
        len: u64,
    ) -> Result<u64> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(modified)
            .large_file(len > u64::from(u32::MAX));
        let pending = &self.pending;
        let zip = self
            .zip
            .as_mut()
            .ok_or_else(|| BackupError::archive(pending, "archive is already finished"))?;
        zip.start_file(name, options)
            .map_err(|e| BackupError::archive(pending, e))?;
        io::copy(reader, zip).map_err(|e| BackupError::io_at(pending, e))
    }

    /// Writes the central directory and moves the archive into place.
    pub fn finish(&mut self) -> Result<()> {
        let Some(mut zip) = self.zip.take() else {
            return Ok(());
        };
        let result = zip
            .finish()
            .map_err(|e| BackupError::archive(&self.pending, e))
            .and_then(|_| {
                fs::rename(&self.pending, &self.target)
                    .map_err(|e| BackupError::io_at(&self.target, e))
            });
        if result.is_err() {
            let _ = fs::remove_file(&self.pending);
        }
        result
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if let Some(zip) = self.zip.take() {
            drop(zip);
            debug!("Discarding unfinished archive {:?}", self.pending);
            if let Err(e) = fs::remove_file(&self.pending) {
                warn!("Failed to remove {:?}: {}", self.pending, e);
            }
        }
    }
}

pub struct ArchiveReader {
    path: PathBuf,
    zip: ZipArchive<BufReader<File>>,
}

impl ArchiveReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BackupError::io_at(path, e))?;
        let zip = ZipArchive::new(BufReader::new(file)).map_err(|e| BackupError::archive(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            zip,
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.zip.file_names().any(|n| n == name)
    }

    pub fn read_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .zip
            .by_name(name)
            .map_err(|e| BackupError::archive(&self.path, e))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| BackupError::io_at(&self.path, e))?;
        Ok(data)
    }

    /// Loads the index stored in the archive.
    pub fn read_index(&mut self) -> Result<FileTreeIndex> {
        FileTreeIndex::from_bytes(&self.read_bytes(INDEX_FILE)?)
    }

    /// Reads the metadata record, `Ok(None)` when the archive holds none.
    pub fn read_entry(&mut self) -> Result<Option<BackupEntry>> {
        if !self.contains(INFO_FILE) {
            return Ok(None);
        }
        let text = String::from_utf8(self.read_bytes(INFO_FILE)?).map_err(|_| {
            BackupError::Format(format!("{} in {:?} is not valid UTF-8", INFO_FILE, self.path))
        })?;
        BackupEntry::parse_info(&text, self.path.clone()).map(Some)
    }

    /// Extracts the entry `name` to `dst`, restoring its modification time.
    /// Returns the number of bytes written.
    pub fn extract(&mut self, name: &str, dst: &Path) -> Result<u64> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| BackupError::io_at(parent, e))?;
        }
        let mut entry = self
            .zip
            .by_name(name)
            .map_err(|e| BackupError::archive(&self.path, e))?;
        let modified = file_time(entry.last_modified());
        let mut out = File::create(dst).map_err(|e| BackupError::io_at(dst, e))?;
        let written = io::copy(&mut entry, &mut out).map_err(|e| BackupError::io_at(dst, e))?;
        drop(out);

        if let Some(time) = modified {
            filetime::set_file_mtime(dst, time).map_err(|e| BackupError::io_at(dst, e))?;
        }
        Ok(written)
    }

    /// Copies the entry `name` into `writer` under the same name.
    pub fn copy_to(&mut self, name: &str, writer: &mut ArchiveWriter) -> Result<u64> {
        let mut entry = self
            .zip
            .by_name(name)
            .map_err(|e| BackupError::archive(&self.path, e))?;
        let modified = entry.last_modified();
        let len = entry.size();
        writer.add_reader(name, &mut entry, modified, len)
    }
}

// Zip timestamps are local time with two-second resolution.
fn zip_time(modified: SystemTime) -> zip::DateTime {
    let local: DateTime<Local> = modified.into();
    zip::DateTime::from_date_and_time(
        local.year() as u16,
        local.month() as u8,
        local.day() as u8,
        local.hour() as u8,
        local.minute() as u8,
        local.second() as u8,
    )
    .unwrap_or_default()
}

fn file_time(stamp: zip::DateTime) -> Option<FileTime> {
    let naive = NaiveDate::from_ymd_opt(
        stamp.year().into(),
        stamp.month().into(),
        stamp.day().into(),
    )?
    .and_hms_opt(
        stamp.hour().into(),
        stamp.minute().into(),
        stamp.second().into(),
    )?;
    let local = Local.from_local_datetime(&naive).earliest()?;
    Some(FileTime::from_unix_time(local.timestamp(), 0))
}
