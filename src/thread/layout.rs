//! On-disk placement of thread logs under per-device namespaces.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use super::ThreadType;

/// A thread log discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadFile {
    pub thread_type: ThreadType,
    pub path: PathBuf,
}

impl ThreadFile {
    /// File stem, used as the fallback thread key.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// `<nodes_base>/<node_uid>/threads/{channels,dms}/<key>.csv`
#[derive(Debug, Clone)]
pub struct NodeLayout {
    nodes_base: PathBuf,
}

impl NodeLayout {
    pub fn new(nodes_base: impl Into<PathBuf>) -> Self {
        Self {
            nodes_base: nodes_base.into(),
        }
    }

    pub fn nodes_base(&self) -> &Path {
        &self.nodes_base
    }

    pub fn node_dir(&self, node_uid: &str) -> PathBuf {
        self.nodes_base.join(sanitize_name(node_uid))
    }

    pub fn threads_dir(&self, node_uid: &str, thread_type: ThreadType) -> PathBuf {
        self.node_dir(node_uid).join("threads").join(thread_type.dir_name())
    }

    pub fn nodes_registry(&self, node_uid: &str) -> PathBuf {
        self.node_dir(node_uid).join("nodes.csv")
    }

    pub fn sightings_log(&self, node_uid: &str) -> PathBuf {
        self.node_dir(node_uid).join("sightings.csv")
    }

    pub fn thread_path(&self, node_uid: &str, thread_type: ThreadType, thread_key: &str) -> PathBuf {
        self.threads_dir(node_uid, thread_type)
            .join(format!("{}.csv", sanitize_name(thread_key)))
    }

    /// Every node namespace directory, sorted by name.
    pub fn node_dirs(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.nodes_base) else {
            debug!("Nodes base {} missing; nothing to scan", self.nodes_base.display());
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    /// Thread logs of one node directory: channels first, then DMs, each sorted.
    pub fn thread_files(node_dir: &Path) -> Vec<ThreadFile> {
        let mut out = Vec::new();
        for thread_type in [ThreadType::Channel, ThreadType::Dm] {
            let dir = node_dir.join("threads").join(thread_type.dir_name());
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().map(|x| x == "csv").unwrap_or(false))
                .collect();
            paths.sort();
            out.extend(paths.into_iter().map(|path| ThreadFile { thread_type, path }));
        }
        out
    }

    /// Thread logs across every node.
    pub fn all_thread_files(&self) -> Vec<ThreadFile> {
        self.node_dirs()
            .iter()
            .flat_map(|dir| Self::thread_files(dir))
            .collect()
    }
}

/// Lowercase, alphanumerics kept, everything else collapsed to single
/// underscores; `unnamed` when nothing survives.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            out.push(ch);
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
