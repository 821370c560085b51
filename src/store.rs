//! Content-addressed storage.
//!
//! Every upload is keyed by the SHA-256 of its raw bytes. A hash owns two
//! subtrees, one for the untouched original and one for everything derived
//! from it:
//!
//! ```text
//! <base_path>/<originals>/ab/cd/ef0123…/photo.jpg
//! <base_path>/<optimized>/ab/cd/ef0123…/photo.webp
//!                                       photo-640w.webp
//!                                       meta.json
//! ```
//!
//! The two-character fan-out (`hash_depth` levels) keeps directories small.
//! `meta.json` is the existence predicate: a hash without it is treated as
//! absent even if other files are lying around from an interrupted run, and
//! those are simply overwritten on the next attempt at the same paths.
//!
//! Bytes move through the [`BlobStore`] trait. [`FsBlobStore`] is the only
//! implementation; processors read and write its files directly through
//! [`BlobStore::path`].

use crate::config::StorageConfig;
use crate::imaging::Format;
use crate::metadata::{ImageMetadata, WidthDescriptor};
use crate::naming::{derived_filename, sanitize_filename};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use walkdir::WalkDir;

/// Name of the metadata record inside a hash's optimized subtree.
pub const METADATA_FILENAME: &str = "meta.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// =============================================================================
// Content hash
// =============================================================================

/// SHA-256 of an upload as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", Sha256::digest(bytes)))
    }

    /// Accept exactly 64 hex characters, normalised to lowercase.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ContentHash> for String {
    fn from(h: ContentHash) -> String {
        h.0
    }
}

impl TryFrom<String> for ContentHash {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&s).ok_or_else(|| format!("invalid content hash: {s:?}"))
    }
}

/// Split a hash into `depth` two-character directories plus the remainder.
pub fn hash_path(hash: &ContentHash, depth: usize) -> String {
    split_prefixes(hash.as_str(), depth)
}

/// - `split_prefixes("abcdef", 2)` → `"ab/cd/ef"`
/// - `split_prefixes("abcdef", 0)` → `"abcdef"`
///
/// The remainder always keeps at least one character. Input that cannot be
/// cut on character boundaries comes back unsplit.
fn split_prefixes(s: &str, depth: usize) -> String {
    let depth = depth.min(s.len().saturating_sub(1) / 2);
    let segments: Option<Vec<&str>> = (0..depth)
        .map(|i| s.get(i * 2..i * 2 + 2))
        .chain(std::iter::once(s.get(depth * 2..)))
        .collect();
    segments.map_or_else(|| s.to_string(), |segments| segments.join("/"))
}

// =============================================================================
// Blob store
// =============================================================================

/// Minimal key/value blob interface. Keys are `/`-separated relative paths.
pub trait BlobStore: Send + Sync {
    /// Write atomically, creating parent directories.
    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

    /// `Ok(None)` when the key does not exist.
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    fn exists(&self, key: &str) -> bool;

    /// Remove a blob or everything under a prefix. Missing keys are fine.
    fn delete(&self, key: &str) -> io::Result<()>;

    fn size(&self, key: &str) -> io::Result<u64>;

    fn modified(&self, key: &str) -> io::Result<SystemTime>;

    /// Every blob key under a prefix, sorted.
    fn list(&self, prefix: &str) -> io::Result<Vec<String>>;

    /// Local filesystem location of a key.
    fn path(&self, key: &str) -> PathBuf;

    /// Public URL of a key.
    fn url(&self, key: &str) -> String;
}

/// Blobs as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Same directory so the rename never crosses filesystems.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })
    }

    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn exists(&self, key: &str) -> bool {
        self.path(key).is_file()
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        let path = self.path(key);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn size(&self, key: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.path(key))?.len())
    }

    fn modified(&self, key: &str) -> io::Result<SystemTime> {
        fs::metadata(self.path(key))?.modified()
    }

    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        let base = self.path(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&base) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                let key: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                keys.push(key.join("/"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |p, s| p.join(s))
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }
}

// =============================================================================
// Content store
// =============================================================================

/// Which of a hash's two subtrees a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Original,
    Optimized,
}

/// A persisted record found by [`ContentStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub hash: ContentHash,
    /// Modification time of the record's `meta.json`.
    pub modified: DateTime<Utc>,
}

/// Hash-addressed layout over a [`BlobStore`].
pub struct ContentStore<S: BlobStore = FsBlobStore> {
    blobs: S,
    config: StorageConfig,
}

impl ContentStore<FsBlobStore> {
    /// Filesystem store rooted at `config.root`.
    pub fn open(config: StorageConfig) -> Self {
        let blobs = FsBlobStore::new(&config.root, &config.base_url);
        Self::new(blobs, config)
    }
}

impl<S: BlobStore> ContentStore<S> {
    pub fn new(blobs: S, config: StorageConfig) -> Self {
        Self { blobs, config }
    }

    pub fn blobs(&self) -> &S {
        &self.blobs
    }

    pub fn hash(&self, bytes: &[u8]) -> ContentHash {
        ContentHash::of(bytes)
    }

    /// Directory segments for a hash under the configured distribution.
    pub fn hash_path(&self, hash: &ContentHash) -> String {
        hash_path(hash, self.config.effective_depth())
    }

    fn subtree(&self, kind: BlobKind) -> String {
        let dir = match kind {
            BlobKind::Original => &self.config.paths.originals,
            BlobKind::Optimized => &self.config.paths.optimized,
        };
        join_key(&[&self.config.base_path, dir])
    }

    fn hash_dir(&self, kind: BlobKind, hash: &ContentHash) -> String {
        join_key(&[&self.subtree(kind), &self.hash_path(hash)])
    }

    /// Key of `file` in a hash's subtree. The name is used as given.
    pub fn key(&self, kind: BlobKind, hash: &ContentHash, file: &str) -> String {
        join_key(&[&self.hash_dir(kind, hash), file])
    }

    /// Store bytes under a sanitized filename and return the key.
    pub fn put(
        &self,
        kind: BlobKind,
        hash: &ContentHash,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String> {
        let key = self.key(kind, hash, &sanitize_filename(filename));
        self.blobs.put(&key, bytes)?;
        Ok(key)
    }

    /// Key of a derived asset: `<stem>[-<640w>].<ext>` in the optimized subtree.
    pub fn optimized_key(
        &self,
        hash: &ContentHash,
        original_name: &str,
        variant: Option<WidthDescriptor>,
        format: Format,
    ) -> String {
        let file = derived_filename(original_name, variant, format);
        self.key(BlobKind::Optimized, hash, &file)
    }

    pub fn metadata_key(&self, hash: &ContentHash) -> String {
        self.key(BlobKind::Optimized, hash, METADATA_FILENAME)
    }

    pub fn write_metadata(&self, hash: &ContentHash, metadata: &ImageMetadata) -> Result<()> {
        let json = serde_json::to_vec_pretty(metadata)?;
        self.blobs.put(&self.metadata_key(hash), &json)?;
        Ok(())
    }

    pub fn read_metadata(&self, hash: &ContentHash) -> Result<Option<ImageMetadata>> {
        match self.blobs.get(&self.metadata_key(hash))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.blobs.exists(&self.metadata_key(hash))
    }

    /// Remove both subtrees of a hash. Always `true`; absent hashes are fine.
    ///
    /// `meta.json` goes first: once it is gone the hash no longer exists, so
    /// a failure part way leaves orphaned files, never a record pointing at
    /// missing ones.
    pub fn delete(&self, hash: &ContentHash) -> Result<bool> {
        self.blobs.delete(&self.metadata_key(hash))?;
        self.blobs.delete(&self.hash_dir(BlobKind::Original, hash))?;
        self.blobs.delete(&self.hash_dir(BlobKind::Optimized, hash))?;
        Ok(true)
    }

    /// Total bytes held by a hash across both subtrees.
    pub fn subtree_size(&self, hash: &ContentHash) -> Result<u64> {
        let mut total = 0;
        for kind in [BlobKind::Original, BlobKind::Optimized] {
            for key in self.blobs.list(&self.hash_dir(kind, hash))? {
                total += self.blobs.size(&key)?;
            }
        }
        Ok(total)
    }

    /// Every persisted record, found by walking the optimized subtree for
    /// `meta.json` files. Directories that do not spell a valid hash are
    /// skipped.
    pub fn list(&self) -> Result<Vec<StoredRecord>> {
        let root = self.subtree(BlobKind::Optimized);
        let mut records = Vec::new();
        for key in self.blobs.list(&root)? {
            let Some(dir) = key.strip_suffix(METADATA_FILENAME) else {
                continue;
            };
            let Some(rel) = dir.strip_prefix(&root) else {
                continue;
            };
            let Some(hash) = ContentHash::parse(&rel.replace('/', "")) else {
                continue;
            };
            let modified = self.blobs.modified(&key)?;
            records.push(StoredRecord {
                hash,
                modified: DateTime::<Utc>::from(modified),
            });
        }
        Ok(records)
    }
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
