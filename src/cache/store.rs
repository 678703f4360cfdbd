//! File-backed cache of generated commit messages.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/
//!   outputs/<key>.txt        one blob per cache key (raw message text)
//!   models/<model>.json      per-model load info
//!   cache_metadata.json      key -> {model, timestamp, diff_size}
//! ```
//!
//! Blobs are the ground truth. The metadata file is bookkeeping only: it may
//! reference blobs that no longer exist and may miss blobs that do. Nothing
//! here fails because of that divergence.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::key::{CacheKey, model_file_stem};

/// Freshness window applied by [`CacheStore::get`].
pub const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const SECS_PER_DAY: u64 = 24 * 60 * 60;
const OUTPUTS_DIR: &str = "outputs";
const MODELS_DIR: &str = "models";
const METADATA_FILE: &str = "cache_metadata.json";
const BLOB_EXTENSION: &str = "txt";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize cache data: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Bookkeeping for one stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default = "unknown_model")]
    pub model: String,
    /// Unix seconds at store time.
    #[serde(default)]
    pub timestamp: f64,
    /// Length of the diff in bytes.
    #[serde(default)]
    pub diff_size: u64,
}

fn unknown_model() -> String {
    "unknown".to_string()
}

pub type Metadata = BTreeMap<String, MetadataRecord>;

/// Load hint recorded the first time an engine for a model is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Unix seconds.
    pub loaded_at: f64,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl ModelInfo {
    pub fn now(config: serde_json::Value) -> Self {
        Self {
            loaded_at: unix_secs(SystemTime::now()),
            config,
        }
    }
}

/// Aggregate view of the cache.
///
/// `entry_count` and `total_size_bytes` come from the blobs on disk; `models`
/// comes from the metadata file and can disagree with them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_size_bytes: u64,
    pub models: BTreeMap<String, usize>,
    pub cache_dir: PathBuf,
}

impl CacheStats {
    pub fn total_size_mb(&self) -> f64 {
        let mb = self.total_size_bytes as f64 / 1024.0 / 1024.0;
        (mb * 100.0).round() / 100.0
    }
}

/// Result of an eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub removed_blobs: usize,
    pub kept_records: usize,
}

/// Content-addressed message cache rooted at one directory.
///
/// Directories are created on the first write; reading from a cache that was
/// never written behaves like an empty cache.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join(OUTPUTS_DIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join(MODELS_DIR)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.outputs_dir().join(key.blob_file_name())
    }

    fn model_info_path(&self, model: &str) -> PathBuf {
        self.models_dir()
            .join(format!("{}.json", model_file_stem(model)))
    }

    /// Look up a message generated by `model` for `diff`.
    ///
    /// Returns `None` for a missing blob and for a blob at least
    /// [`ENTRY_TTL`] old. Expired blobs stay on disk until an eviction pass.
    pub fn get(&self, diff: &str, model: &str) -> Option<String> {
        let key = CacheKey::derive(model, diff);
        let path = self.blob_path(&key);

        let meta = fs::metadata(&path).ok()?;
        let age = file_age(&meta, SystemTime::now());
        if age >= ENTRY_TTL {
            debug!(key = %key, age_secs = age.as_secs(), "Cache entry expired");
            return None;
        }

        match fs::read_to_string(&path) {
            Ok(text) => {
                debug!(key = %key, model = model, "Cache hit");
                Some(text)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache entry, treating as miss");
                None
            }
        }
    }

    /// Store `message` for `(model, diff)`, overwriting any previous entry.
    pub fn put(&self, diff: &str, model: &str, message: &str) -> CacheResult<CacheKey> {
        let key = CacheKey::derive(model, diff);
        let outputs = self.outputs_dir();
        fs::create_dir_all(&outputs).map_err(|e| CacheError::io(&outputs, e))?;

        let path = self.blob_path(&key);
        fs::write(&path, message).map_err(|e| CacheError::io(&path, e))?;

        let mut metadata = self.load_metadata();
        metadata.insert(
            key.as_str().to_string(),
            MetadataRecord {
                model: model.to_string(),
                timestamp: unix_secs(SystemTime::now()),
                diff_size: diff.len() as u64,
            },
        );
        self.save_metadata(&metadata)?;

        debug!(key = %key, model = model, bytes = message.len(), "Cached message");
        Ok(key)
    }

    pub fn get_model_info(&self, model: &str) -> Option<ModelInfo> {
        let path = self.model_info_path(model);
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(info) => Some(info),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt model info, ignoring");
                None
            }
        }
    }

    pub fn put_model_info(&self, model: &str, info: &ModelInfo) -> CacheResult<()> {
        let dir = self.models_dir();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
        let path = self.model_info_path(model);
        let json = serde_json::to_string_pretty(info)?;
        fs::write(&path, json).map_err(|e| CacheError::io(&path, e))
    }

    /// Evict blobs at least `days` days old and drop metadata records stored
    /// before the same cutoff.
    ///
    /// Independent of the freshness window used by [`CacheStore::get`].
    pub fn clear_older_than(&self, days: u64) -> CacheResult<ClearReport> {
        let now = SystemTime::now();
        let max_age = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));

        let mut removed_blobs = 0;
        for (path, meta) in self.list_blobs()? {
            if file_age(&meta, now) >= max_age {
                remove_if_exists(&path)?;
                removed_blobs += 1;
            }
        }

        let cutoff = unix_secs(now) - max_age.as_secs_f64();
        let metadata = retain_since(self.load_metadata(), cutoff);
        let kept_records = metadata.len();
        self.save_metadata(&metadata)?;

        debug!(days, removed_blobs, kept_records, "Evicted old cache entries");
        Ok(ClearReport {
            removed_blobs,
            kept_records,
        })
    }

    /// Remove every blob and reset the metadata, regardless of age.
    pub fn clear_all(&self) -> CacheResult<ClearReport> {
        let mut removed_blobs = 0;
        for (path, _) in self.list_blobs()? {
            remove_if_exists(&path)?;
            removed_blobs += 1;
        }
        self.save_metadata(&Metadata::new())?;
        Ok(ClearReport {
            removed_blobs,
            kept_records: 0,
        })
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let blobs = self.list_blobs()?;
        let total_size_bytes = blobs.iter().map(|(_, meta)| meta.len()).sum();

        let mut models = BTreeMap::new();
        for record in self.load_metadata().into_values() {
            *models.entry(record.model).or_insert(0) += 1;
        }

        Ok(CacheStats {
            entry_count: blobs.len(),
            total_size_bytes,
            models,
            cache_dir: self.root.clone(),
        })
    }

    /// Read the metadata file. Missing or unparsable files yield an empty map.
    pub fn load_metadata(&self) -> Metadata {
        let path = self.metadata_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Metadata::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache metadata, treating as empty");
                return Metadata::new();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Corrupt cache metadata, treating as empty");
            Metadata::new()
        })
    }

    fn save_metadata(&self, metadata: &Metadata) -> CacheResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| CacheError::io(&self.root, e))?;
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&path, json).map_err(|e| CacheError::io(&path, e))
    }

    fn list_blobs(&self) -> CacheResult<Vec<(PathBuf, fs::Metadata)>> {
        let dir = self.outputs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CacheError::io(&dir, e)),
        };

        let mut blobs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            // Deleted between read_dir and stat.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_file() {
                blobs.push((path, meta));
            }
        }
        Ok(blobs)
    }
}

fn file_age(meta: &fs::Metadata, now: SystemTime) -> Duration {
    meta.modified()
        .ok()
        .and_then(|mtime| now.duration_since(mtime).ok())
        .unwrap_or(Duration::ZERO)
}

/// Records stored at or after `cutoff` (Unix seconds).
fn retain_since(metadata: Metadata, cutoff: f64) -> Metadata {
    metadata
        .into_iter()
        .filter(|(_, record)| record.timestamp >= cutoff)
        .collect()
}

fn remove_if_exists(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

pub(crate) fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
