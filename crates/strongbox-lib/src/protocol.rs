//! Launcher protocol shared by the engine and `strongbox-launcher`.
//!
//! The parent passes operation parameters as `key:=value` command-line
//! arguments ([`LaunchArgs`]). The child reports progress on stdout as
//! newline-delimited JSON [`ProgressRecord`]s and closes the stream with an
//! explicit [`ProgressRecord::End`] marker. Lines that do not parse as a record
//! are not part of the protocol and are dropped by the reader.

use crate::error::BackupError;
use crate::types::OperationState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Separator between key and value in launcher arguments.
pub const ARG_SEPARATOR: &str = ":=";
const LIST_SEPARATOR: &str = ",";

/// One progress update written by a child process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "key", content = "value", rename_all = "camelCase")]
pub enum ProgressRecord {
    /// Epoch milliseconds.
    StartTime(i64),
    /// Epoch milliseconds.
    EndTime(i64),
    Status(OperationState),
    /// Appended to the operation's error text.
    Error(String),
    CurrentFile(String),
    DataSize(u64),
    DataCopied(u64),
    Progress(f32),
    /// No records follow.
    End,
}

impl ProgressRecord {
    /// Encodes the record as a single JSON line, newline included.
    pub fn encode(&self) -> Result<String, BackupError> {
        let json = serde_json::to_string(self)
            .map_err(|e| BackupError::Format(format!("cannot encode record: {}", e)))?;
        Ok(json + "\n")
    }

    /// Decodes one line of child output.
    pub fn decode(line: &str) -> Result<Self, BackupError> {
        serde_json::from_str(line.trim_end())
            .map_err(|e| BackupError::ProtocolParse(format!("{}: {:?}", e, line)))
    }
}

/// Parameters of an isolated operation, as passed on the launcher command line.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchArgs {
    pub backup_name: String,
    pub uid: String,
    /// Directory the index paths are relative to.
    pub base_dir: PathBuf,
    /// Directory the ignore paths are relative to.
    pub user_dir: PathBuf,
    pub ignore_list: Vec<PathBuf>,
    pub clear_dst: bool,
    pub additional_sources: Vec<PathBuf>,
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
}

impl LaunchArgs {
    /// Renders the parameters as `key:=value` arguments. List values are
    /// comma-joined, so list entries must not contain commas.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            arg("backupName", &self.backup_name),
            arg("uid", &self.uid),
            arg("baseDir", &self.base_dir.to_string_lossy()),
            arg("userDir", &self.user_dir.to_string_lossy()),
            arg("ignoreList", &join_paths(&self.ignore_list)),
            arg("clearDst", &self.clear_dst.to_string()),
            arg("additionalSources", &join_paths(&self.additional_sources)),
            arg("sourceRoot", &self.source_root.to_string_lossy()),
            arg("destRoot", &self.dest_root.to_string_lossy()),
        ]
    }

    /// Parses launcher arguments. Unknown keys are ignored; arguments without
    /// a `:=` separator are treated as keys with an empty value.
    pub fn parse<I, S>(args: I) -> Result<Self, BackupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut settings: HashMap<String, String> = HashMap::new();
        for raw in args {
            let raw = raw.as_ref();
            match raw.split_once(ARG_SEPARATOR) {
                Some((key, value)) => settings.insert(key.to_string(), value.to_string()),
                None => settings.insert(raw.to_string(), String::new()),
            };
        }

        let required = |key: &str| -> Result<String, BackupError> {
            settings
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| BackupError::Configuration(format!("missing launcher argument '{}'", key)))
        };

        let base_dir = PathBuf::from(required("baseDir")?);
        let user_dir = settings
            .get("userDir")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| base_dir.clone());
        let clear_dst = match settings.get("clearDst").map(String::as_str) {
            None | Some("") => false,
            Some(v) => v.parse().map_err(|_| {
                BackupError::Configuration(format!("invalid clearDst value '{}'", v))
            })?,
        };

        Ok(Self {
            backup_name: required("backupName")?,
            uid: required("uid")?,
            base_dir,
            user_dir,
            ignore_list: split_paths(settings.get("ignoreList")),
            clear_dst,
            additional_sources: split_paths(settings.get("additionalSources")),
            source_root: PathBuf::from(required("sourceRoot")?),
            dest_root: PathBuf::from(required("destRoot")?),
        })
    }
}

fn arg(key: &str, value: &str) -> String {
    format!("{}{}{}", key, ARG_SEPARATOR, value)
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

fn split_paths(value: Option<&String>) -> Vec<PathBuf> {
    value
        .map(|v| {
            v.split(LIST_SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}
