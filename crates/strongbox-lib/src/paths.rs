use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Name of the serialized file-tree index stored in every backup.
pub const INDEX_FILE: &str = "backup.index";
/// Name of the `key:value` metadata record stored in every backup.
pub const INFO_FILE: &str = "backup.info";
/// Extension of backups stored as a single zip archive.
pub const ARCHIVE_EXTENSION: &str = "zip";
/// Suffix of files that are still being written.
pub const PENDING_SUFFIX: &str = "part";
/// File name of the isolated-operation launcher binary.
pub const LAUNCHER_BIN: &str = "strongbox-launcher";

/// Get the project directories for strongbox.
fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "strongbox")
}

/// Returns the configuration directory: `~/.config/strongbox/`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            // Fallback if ProjectDirs fails (unlikely on Linux)
            let mut path = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            path.push(".config");
            path.push("strongbox");
            path
        })
}

/// Returns the path to the config file: `~/.config/strongbox/config.toml`
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Returns the active configuration path, respecting `STRONGBOX_CONFIG` environment variable.
pub fn active_config_path() -> PathBuf {
    std::env::var("STRONGBOX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_path())
}

/// Returns the data directory: `~/.local/share/strongbox/`
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| {
            let mut path = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            path.push(".local");
            path.push("share");
            path.push("strongbox");
            path
        })
}

/// Returns the log file path: `~/.local/share/strongbox/strongbox.log`
pub fn log_path() -> PathBuf {
    data_dir().join("strongbox.log")
}

/// Location of the index inside a backup root.
pub fn index_path(root: &Path) -> PathBuf {
    root.join(INDEX_FILE)
}

/// Location of the metadata record inside a backup root.
pub fn info_path(root: &Path) -> PathBuf {
    root.join(INFO_FILE)
}

/// Whether `path` names a zip archive backup.
pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
}

/// Where `path` is written before it is moved into place.
pub fn pending_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(PENDING_SUFFIX);
    PathBuf::from(name)
}

/// Returns the launcher installed next to the running executable.
///
/// Test binaries live one directory below the build output (`target/debug/deps`),
/// so the parent directory is tried as well.
pub fn default_launcher_path() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let sibling = exe_dir.join(LAUNCHER_BIN);
    if sibling.exists() {
        return sibling;
    }
    if let Some(parent) = exe_dir.parent() {
        let candidate = parent.join(LAUNCHER_BIN);
        if candidate.exists() {
            return candidate;
        }
    }
    sibling
}
