//! Manifest and chunk descriptor types, plus the object-key scheme shared by
//! every component that touches a remote.
//!
//! On-remote layout:
//!   - data chunk:   `{data_prefix}/{file_name}.chunk.{index:03}`
//!   - parity chunk: `{data_prefix}/{file_name}.parity.{index:03}`
//!   - manifest:     `{manifest_prefix}/{mangled(file_path)}.manifest.json`

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MANIFEST_VERSION: u32 = 1;

/// Whether a chunk carries file bytes or erasure-code parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    #[default]
    Data,
    Parity,
}

/// An extra copy of a chunk on a different remote (same object path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRef {
    pub remote: String,
    pub path: String,
}

/// One placed chunk of a file.
///
/// Chunks of a file are contiguous and non-overlapping: `offset` equals the
/// sum of the sizes of all lower-indexed chunks, and every chunk except the
/// last has `size == chunk_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub index: u32,
    pub remote: String,
    pub path: String,
    pub size: u64,
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<ReplicaRef>,
    #[serde(default, skip_serializing_if = "ChunkKind::is_data")]
    pub kind: ChunkKind,
    /// Stored object is zstd-compressed; `size` remains the plaintext length.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    /// On-remote object length when it differs from `size` (compression).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_size: Option<u64>,
}

impl ChunkRef {
    /// Length of the object as stored on the remote.
    pub fn stored_len(&self) -> u64 {
        self.stored_size.unwrap_or(self.size)
    }
}

impl ChunkKind {
    fn is_data(&self) -> bool {
        matches!(self, ChunkKind::Data)
    }
}

/// Per-file placement record, replicated to every remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub file_name: String,
    pub remote_dir: String,
    pub file_path: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parity_chunks: Vec<ChunkRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub created_at: f64,
    pub checksum: String,
}

impl Manifest {
    pub fn new(
        file_name: &str,
        remote_dir: &str,
        file_size: u64,
        chunk_size: u64,
        chunks: Vec<ChunkRef>,
    ) -> Self {
        let remote_dir = normalize_dir(remote_dir);
        let file_path = join_path(&remote_dir, file_name);
        let chunk_count = chunks.len();
        Manifest {
            version: MANIFEST_VERSION,
            file_name: file_name.to_string(),
            remote_dir,
            file_path,
            file_size,
            chunk_size,
            chunk_count,
            chunks,
            parity_chunks: Vec::new(),
            content_hash: None,
            created_at: unix_now(),
            checksum: manifest_checksum(file_name, file_size, chunk_count),
        }
    }

    /// Serialize to the on-remote representation (2-space indented JSON).
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }

    /// Distinct remotes holding any data chunk of this file.
    pub fn remotes(&self) -> BTreeSet<String> {
        self.chunks.iter().map(|c| c.remote.clone()).collect()
    }

    /// Rewrite the identity fields for a rename. Chunk object paths are
    /// opaque keys and stay untouched.
    pub fn rename_to(&mut self, dest_path: &str) {
        let dest = normalize_path(dest_path);
        let (dir, name) = split_file_path(&dest);
        self.file_name = name;
        self.remote_dir = dir;
        self.file_path = dest;
        self.checksum = manifest_checksum(&self.file_name, self.file_size, self.chunk_count);
    }
}

/// Listing summary returned by `ls` and the REST file list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub chunk_count: usize,
    pub remotes: Vec<String>,
    pub created_at: f64,
}

impl From<&Manifest> for FileSummary {
    fn from(m: &Manifest) -> Self {
        FileSummary {
            name: m.file_name.clone(),
            path: m.file_path.clone(),
            size: m.file_size,
            chunk_count: m.chunks.len(),
            remotes: m.remotes().into_iter().collect(),
            created_at: m.created_at,
        }
    }
}

/// First 16 hex chars of SHA-256 over `{name}:{size}:{chunk_count}`.
pub fn manifest_checksum(file_name: &str, file_size: u64, chunk_count: usize) -> String {
    let digest = Sha256::digest(format!("{file_name}:{file_size}:{chunk_count}").as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..16].to_string()
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Canonical pool path: leading `/`, no trailing `/` (except root itself).
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Canonical directory path (same rules as `normalize_path`).
pub fn normalize_dir(dir: &str) -> String {
    normalize_path(dir)
}

/// Join a directory and a file name into a canonical file path.
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_dir(dir);
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split a canonical file path into `(remote_dir, file_name)`.
pub fn split_file_path(file_path: &str) -> (String, String) {
    let path = normalize_path(file_path);
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path),
    }
}

/// Resolve an upload target: a trailing `/` (or empty) means "directory",
/// taking the file name from the local source; anything else is a full file
/// path split at the last component.
pub fn resolve_upload_target(remote_path: &str, local_name: &str) -> (String, String) {
    let trimmed = remote_path.trim();
    if trimmed.is_empty() || trimmed == "/" || trimmed.ends_with('/') {
        (normalize_dir(trimmed), local_name.to_string())
    } else {
        split_file_path(trimmed)
    }
}

/// Manifest object name for a pool path: `/` becomes `_`, leading `_` is
/// stripped, `root` when nothing remains. Total but not injective: paths
/// differing only in `/` vs `_` placement collide (callers own avoiding
/// that).
pub fn mangle_file_path(file_path: &str) -> String {
    let mangled: String = normalize_path(file_path).replace('/', "_");
    let stripped = mangled.trim_start_matches('_');
    if stripped.is_empty() {
        "root".to_string()
    } else {
        stripped.to_string()
    }
}

pub fn manifest_object_key(manifest_prefix: &str, file_path: &str) -> String {
    format!(
        "{manifest_prefix}/{}.manifest.json",
        mangle_file_path(file_path)
    )
}

pub fn chunk_object_key(data_prefix: &str, file_name: &str, index: u32) -> String {
    format!("{data_prefix}/{file_name}.chunk.{index:03}")
}

pub fn parity_object_key(data_prefix: &str, file_name: &str, index: u32) -> String {
    format!("{data_prefix}/{file_name}.parity.{index:03}")
}

/// True when `dir` equals `ancestor` or lies underneath it.
pub fn dir_is_within(dir: &str, ancestor: &str) -> bool {
    let dir = normalize_dir(dir);
    let ancestor = normalize_dir(ancestor);
    if ancestor == "/" {
        return true;
    }
    dir == ancestor || dir.starts_with(&format!("{ancestor}/"))
}
