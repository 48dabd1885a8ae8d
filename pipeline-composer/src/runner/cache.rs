// Execution Cache
// Records successful stage executions by cache key

use crate::compiler::CacheKey;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors that can occur with the execution cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Corrupt cache record: {0}")]
    CorruptRecord(#[from] serde_json::Error),
}

/// Configuration for the on-disk part of the cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache directory (default: ~/.pipeline-composer/cache/)
    pub cache_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let cache_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pipeline-composer")
            .join("cache");

        Self { cache_dir }
    }
}

/// A recorded successful execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub stage: String,
    pub cache_key: CacheKey,
    /// Where the execution wrote its output
    pub output_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_manifest_ref: Option<String>,
}

/// Cache of successful executions, shared between clones
///
/// Lookups check memory first, then `{cache_dir}/{key}.json` when a
/// directory is configured.
#[derive(Debug, Clone)]
pub struct ExecutionCache {
    cache_dir: Option<PathBuf>,
    records: Arc<RwLock<HashMap<CacheKey, CacheRecord>>>,
}

impl Default for ExecutionCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ExecutionCache {
    /// Cache that lives only as long as this value and its clones
    pub fn in_memory() -> Self {
        Self {
            cache_dir: None,
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Cache persisted under the configured directory
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            cache_dir: Some(config.cache_dir),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_cache_dir(cache_dir: impl AsRef<Path>) -> Self {
        Self::with_config(CacheConfig {
            cache_dir: cache_dir.as_ref().to_path_buf(),
        })
    }

    pub fn cache_dir(&self) -> Option<&Path> {
        self.cache_dir.as_deref()
    }

    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheRecord>, CacheError> {
        // Check in-memory cache first
        {
            let records = self.records.read().await;
            if let Some(record) = records.get(key) {
                return Ok(Some(record.clone()));
            }
        }

        // Check disk cache
        let Some(path) = self.record_path(key) else {
            return Ok(None);
        };
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CacheRecord = serde_json::from_str(&content)?;

        let mut records = self.records.write().await;
        records.insert(key.clone(), record.clone());
        Ok(Some(record))
    }

    pub async fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.lookup(key).await, Ok(Some(_)))
    }

    /// Record a successful execution
    pub async fn record(&self, record: CacheRecord) -> Result<(), CacheError> {
        if let Some(path) = self.record_path(&record.cache_key) {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            tokio::fs::create_dir_all(&dir).await?;

            // Readers never see a partial record, and concurrent writers of
            // one key each get their own temporary file
            let content = serde_json::to_vec_pretty(&record)?;
            tokio::task::spawn_blocking(move || -> io::Result<()> {
                let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
                tmp.write_all(&content)?;
                tmp.persist(&path).map_err(|e| e.error)?;
                Ok(())
            })
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        }

        let mut records = self.records.write().await;
        records.insert(record.cache_key.clone(), record);
        Ok(())
    }

    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let in_memory = self.records.write().await.remove(key).is_some();

        let on_disk = match self.record_path(key) {
            Some(path) => match tokio::fs::remove_file(&path).await {
                Ok(()) => true,
                Err(e) if e.kind() == io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            },
            None => false,
        };

        Ok(in_memory || on_disk)
    }

    /// Drop every in-memory record and every record file in the cache directory
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.records.write().await.clear();

        if let Some(dir) = &self.cache_dir {
            let mut entries = match tokio::fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    tokio::fs::remove_file(path).await?;
                }
            }
        }

        Ok(())
    }

    /// Number of records held in memory
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn record_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", key.as_str())))
    }
}
