//! File-tree index: relative paths and sizes of a directory hierarchy.
//!
//! Nodes live in an arena; each node keeps its children by name and a
//! non-owning index of its parent. Every node's size is the sum of the sizes
//! of the leaves beneath it. Directories never stay empty: a childless node
//! below the root is always a file.
//!
//! # Format
//!
//! The index is persisted depth first, one node after another:
//!
//! - version: 1 byte ([`FORMAT_VERSION`])
//! - name length: 2 bytes (big-endian u16), then the UTF-8 name
//! - size: 8 bytes (big-endian u64)
//! - child count: 4 bytes (big-endian u32), then the children

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use strongbox_lib::error::{BackupError, Result};
use strongbox_lib::paths::{INDEX_FILE, INFO_FILE};
use tracing::debug;
use walkdir::WalkDir;

pub const FORMAT_VERSION: u8 = 2;

type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
struct Node {
    name: String,
    size: u64,
    children: HashMap<String, NodeId>,
    parent: Option<NodeId>,
}

impl Node {
    fn new(name: String, size: u64, parent: Option<NodeId>) -> Self {
        Self {
            name,
            size,
            children: HashMap::new(),
            parent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTreeIndex {
    nodes: Vec<Node>,
}

impl Default for FileTreeIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|t| !t.is_empty()).collect()
}

impl FileTreeIndex {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(String::new(), 0, None)],
        }
    }

    /// Builds an index of every file under `root`, keyed by its path relative to `base`.
    ///
    /// A `root` that is a single file yields a one-leaf index; a missing `root`
    /// yields an empty one. Symlinks are resolved; links to directories and
    /// broken links are skipped.
    pub fn build(root: &Path, base: &Path) -> Result<Self> {
        let mut index = Self::new();
        if !root.exists() {
            return Ok(index);
        }

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                BackupError::io_at(path, e.into())
            })?;
            if entry.file_type().is_dir() {
                continue;
            }

            let size = if entry.path_is_symlink() {
                match fs::metadata(entry.path()) {
                    Ok(meta) if meta.is_dir() => continue,
                    Ok(meta) => meta.len(),
                    Err(_) => {
                        debug!("Skipping broken symlink {:?}", entry.path());
                        continue;
                    }
                }
            } else {
                entry
                    .metadata()
                    .map_err(|e| BackupError::io_at(entry.path(), e.into()))?
                    .len()
            };

            let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
            index.add(&relative.to_string_lossy(), size);
        }
        Ok(index)
    }

    /// Adds a file of `size` bytes at `path`, creating intermediate nodes.
    /// Re-adding an existing leaf replaces its size.
    pub fn add(&mut self, path: &str, size: u64) {
        let tokens = tokenize(path);
        let Some((leaf, dirs)) = tokens.split_last() else {
            return;
        };

        let mut chain = vec![ROOT];
        let mut current = ROOT;
        for name in dirs {
            current = match self.nodes[current].children.get(*name) {
                Some(&child) => child,
                None => self.insert_child(current, name, 0),
            };
            chain.push(current);
        }

        let previous = match self.nodes[current].children.get(*leaf) {
            Some(&existing) => {
                let old = self.nodes[existing].size;
                self.detach(current, leaf);
                old
            }
            None => 0,
        };
        self.insert_child(current, leaf, size);

        for id in chain {
            let node = &mut self.nodes[id];
            node.size = node.size.saturating_sub(previous).saturating_add(size);
        }
    }

    /// Removes the leaf or subtree at `path`, deducting its size from every ancestor.
    /// Directories left without entries are removed as well.
    /// Returns `false` when nothing exists at `path`.
    pub fn remove(&mut self, path: &str) -> bool {
        let tokens = tokenize(path);
        let Some((leaf, dirs)) = tokens.split_last() else {
            return false;
        };

        let mut chain = vec![ROOT];
        let mut current = ROOT;
        for name in dirs {
            match self.nodes[current].children.get(*name) {
                Some(&child) => current = child,
                None => return false,
            }
            chain.push(current);
        }

        let Some(removed) = self.detach(current, leaf) else {
            return false;
        };
        let size = self.nodes[removed].size;
        for &id in &chain {
            self.nodes[id].size = self.nodes[id].size.saturating_sub(size);
        }

        for pair in chain.windows(2).rev() {
            let (parent, dir) = (pair[0], pair[1]);
            if !self.nodes[dir].children.is_empty() {
                break;
            }
            let name = self.nodes[dir].name.clone();
            self.detach(parent, &name);
        }
        true
    }

    /// Adds every leaf of `other` to this index.
    pub fn merge(&mut self, other: &FileTreeIndex) {
        for (path, size) in other.leaves_with_sizes() {
            self.add(&path, size);
        }
    }

    /// Total size of all leaves, in bytes.
    pub fn size(&self) -> u64 {
        self.nodes[ROOT].size
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[ROOT].children.is_empty()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves().len()
    }

    /// Aggregate size of the node at `path`.
    pub fn size_of(&self, path: &str) -> Option<u64> {
        self.find(path).map(|id| self.nodes[id].size)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.find(path).is_some()
    }

    /// Path of the directory holding `path`, `Some("")` for top-level entries.
    pub fn parent_of(&self, path: &str) -> Option<String> {
        let id = self.find(path)?;
        let mut names = Vec::new();
        let mut cursor = self.nodes[id].parent;
        while let Some(parent) = cursor {
            if parent != ROOT {
                names.push(self.nodes[parent].name.as_str());
            }
            cursor = self.nodes[parent].parent;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// Relative paths of every leaf, `/`-separated.
    pub fn leaves(&self) -> Vec<String> {
        self.leaves_with_sizes().into_iter().map(|(p, _)| p).collect()
    }

    pub fn leaves_with_sizes(&self) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        let mut stack: Vec<(NodeId, String)> = self.nodes[ROOT]
            .children
            .values()
            .map(|&id| (id, self.nodes[id].name.clone()))
            .collect();

        while let Some((id, path)) = stack.pop() {
            let node = &self.nodes[id];
            if node.children.is_empty() {
                out.push((path, node.size));
                continue;
            }
            for &child in node.children.values() {
                stack.push((child, format!("{}/{}", path, self.nodes[child].name)));
            }
        }
        out
    }

    pub fn iter(&self) -> std::vec::IntoIter<String> {
        self.leaves().into_iter()
    }

    /// Removes the entries for the index and metadata files stored in a backup root.
    pub fn remove_metadata_entries(&mut self) {
        self.remove(INDEX_FILE);
        self.remove(INFO_FILE);
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        self.write_node(ROOT, writer)
    }

    fn write_node<W: Write>(&self, id: NodeId, writer: &mut W) -> Result<()> {
        let node = &self.nodes[id];
        let name = node.name.as_bytes();
        let name_len = u16::try_from(name.len()).map_err(|_| {
            BackupError::Format(format!("name of node '{}' exceeds {} bytes", node.name, u16::MAX))
        })?;
        let child_count = u32::try_from(node.children.len()).map_err(|_| {
            BackupError::Format(format!("too many entries in '{}'", node.name))
        })?;

        writer.write_all(&[FORMAT_VERSION])?;
        writer.write_all(&name_len.to_be_bytes())?;
        writer.write_all(name)?;
        writer.write_all(&node.size.to_be_bytes())?;
        writer.write_all(&child_count.to_be_bytes())?;
        for &child in node.children.values() {
            self.write_node(child, writer)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut index = Self { nodes: Vec::new() };
        index.read_node(reader, None)?;
        Ok(index)
    }

    fn read_node<R: Read>(&mut self, reader: &mut R, parent: Option<NodeId>) -> Result<NodeId> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(BackupError::SerializationVersionMismatch {
                expected: FORMAT_VERSION,
                found: version[0],
            });
        }

        let mut len = [0u8; 2];
        reader.read_exact(&mut len)?;
        let mut name = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| BackupError::Format("node name is not valid UTF-8".to_string()))?;

        let mut size = [0u8; 8];
        reader.read_exact(&mut size)?;
        let mut count = [0u8; 4];
        reader.read_exact(&mut count)?;

        let id = self.nodes.len();
        let size = u64::from_be_bytes(size);
        let count = u32::from_be_bytes(count);
        self.nodes.push(Node::new(name, size, parent));

        let mut total: u64 = 0;
        for _ in 0..count {
            let child = self.read_node(reader, Some(id))?;
            let child_name = self.nodes[child].name.clone();
            total = total.checked_add(self.nodes[child].size).ok_or_else(|| {
                BackupError::Format(format!("size of '{}' overflows", self.nodes[id].name))
            })?;
            if self.nodes[id].children.insert(child_name.clone(), child).is_some() {
                return Err(BackupError::Format(format!(
                    "duplicate entry '{}' in index",
                    child_name
                )));
            }
        }
        if count > 0 && total != size {
            return Err(BackupError::Format(format!(
                "size of '{}' is {} but its entries add up to {}",
                self.nodes[id].name, size, total
            )));
        }
        Ok(id)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(&mut &bytes[..])
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| BackupError::io_at(path, e))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush().map_err(|e| BackupError::io_at(path, e))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| BackupError::io_at(path, e))?;
        Self::read_from(&mut BufReader::new(file))
    }

    fn find(&self, path: &str) -> Option<NodeId> {
        let tokens = tokenize(path);
        if tokens.is_empty() {
            return None;
        }
        let mut current = ROOT;
        for name in tokens {
            current = *self.nodes[current].children.get(name)?;
        }
        Some(current)
    }

    fn insert_child(&mut self, parent: NodeId, name: &str, size: u64) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::new(name.to_string(), size, Some(parent)));
        self.nodes[parent].children.insert(name.to_string(), id);
        id
    }

    // Detached nodes stay in the arena but are unreachable from the root.
    fn detach(&mut self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent].children.remove(name)
    }
}

impl<'a> IntoIterator for &'a FileTreeIndex {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
