use crate::error::BackupError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Whether an operation creates a backup or restores one.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Backup,
    Restore,
}

/// Lifecycle state of a backup or restore operation.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Queued, waiting for its pre-start event.
    Idle,
    /// Loading or building the file-tree index.
    Initializing,
    /// Removing stale files from the destination.
    ClearingDestination,
    /// Copying leaves from source to destination.
    Copying,
    /// Flushing metadata after the last file.
    Finalizing,
    Done,
    Error,
    /// A pre-start hook refused to let the operation run.
    Canceled,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Initializing => "Initializing",
            Self::ClearingDestination => "ClearingDestination",
            Self::Copying => "Copying",
            Self::Finalizing => "Finalizing",
            Self::Done => "Done",
            Self::Error => "Error",
            Self::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationState {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(Self::Idle),
            "Initializing" => Ok(Self::Initializing),
            "ClearingDestination" => Ok(Self::ClearingDestination),
            "Copying" => Ok(Self::Copying),
            "Finalizing" => Ok(Self::Finalizing),
            "Done" => Ok(Self::Done),
            "Error" => Ok(Self::Error),
            "Canceled" => Ok(Self::Canceled),
            other => Err(BackupError::ProtocolParse(format!(
                "unknown operation state '{}'",
                other
            ))),
        }
    }
}

/// A completed backup as listed in the catalog.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackupEntry {
    /// Random identifier, unique within the catalog.
    pub uid: String,
    pub name: String,
    /// When the backup operation started.
    pub date: DateTime<Utc>,
    /// Total size of the backed up data in bytes.
    pub size: u64,
    /// Directory holding the backup.
    pub location: PathBuf,
}

impl BackupEntry {
    /// Renders the `backup.info` record: newline-delimited `key:value` pairs.
    pub fn render_info(&self) -> String {
        format!(
            "name:{}\nuid:{}\ndate:{}\nsize:{}\n",
            self.name,
            self.uid,
            self.date.timestamp_millis(),
            self.size
        )
    }

    /// Parses a `backup.info` record found at `location`.
    pub fn parse_info(text: &str, location: PathBuf) -> Result<Self, BackupError> {
        let mut name = None;
        let mut uid = None;
        let mut date = None;
        let mut size = None;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| BackupError::Format(format!("line without ':' separator: {}", line)))?;
            match key {
                "name" => name = Some(value.to_string()),
                "uid" => uid = Some(value.to_string()),
                "date" => {
                    let millis: i64 = value
                        .parse()
                        .map_err(|_| BackupError::Format(format!("invalid date '{}'", value)))?;
                    date = Some(millis_to_datetime(millis).ok_or_else(|| {
                        BackupError::Format(format!("date out of range '{}'", value))
                    })?);
                }
                "size" => {
                    size = Some(
                        value
                            .parse()
                            .map_err(|_| BackupError::Format(format!("invalid size '{}'", value)))?,
                    )
                }
                // Unknown keys are tolerated so newer writers stay readable.
                _ => {}
            }
        }

        Ok(Self {
            uid: uid.ok_or_else(|| BackupError::Format("missing uid".to_string()))?,
            name: name.ok_or_else(|| BackupError::Format("missing name".to_string()))?,
            date: date.ok_or_else(|| BackupError::Format("missing date".to_string()))?,
            size: size.ok_or_else(|| BackupError::Format("missing size".to_string()))?,
            location,
        })
    }
}

/// Point-in-time view of an operation, as returned by the query surface.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct OperationSnapshot {
    pub uid: String,
    pub name: String,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Human readable status, e.g. `Processing level.dat`.
    pub status: String,
    pub offline: bool,
    pub destination: PathBuf,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Total bytes to copy.
    pub data_size: u64,
    pub data_copied: u64,
    /// Fraction in `[0, 1]`.
    pub progress: f32,
    pub current_file: Option<String>,
    /// Accumulated error text, empty when the operation is healthy.
    pub error: String,
    pub running: bool,
}

pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
