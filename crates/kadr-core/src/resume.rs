//! Resume-position persistence

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

/// Resume policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub enabled: bool,
    /// Content at or below this duration is never saved (seconds)
    pub min_duration: f64,
    /// Stored positions at or below this are ignored (seconds)
    pub min_position: f64,
    /// Stored positions this close to the end are ignored (seconds)
    pub end_epsilon: f64,
    /// Minimum time between saves; 0 saves on every tick
    pub save_interval_ms: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duration: 30.0,
            min_position: 10.0,
            end_epsilon: 2.0,
            save_interval_ms: 0,
        }
    }
}

impl ResumeConfig {
    /// Whether positions of content with `duration` are persisted at all
    pub fn should_save(&self, duration: Option<f64>) -> bool {
        self.enabled && duration.is_some_and(|d| d > self.min_duration)
    }

    /// Position to start from, if `stored` is inside the resumable window
    pub fn applicable(&self, stored: f64, duration: f64) -> Option<f64> {
        (self.enabled && stored > self.min_position && stored < duration - self.end_epsilon)
            .then_some(stored)
    }
}

/// Stored resume position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub content_id: String,
    pub position_seconds: f64,
    pub saved_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn new(content_id: impl Into<String>, position_seconds: f64) -> Self {
        Self {
            content_id: content_id.into(),
            position_seconds,
            saved_at: Utc::now(),
        }
    }
}

/// Storage key of a content id
pub fn resume_key(content_id: &str) -> String {
    format!("resume:{}", content_id)
}

/// Async key/value collaborator holding resume records
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ResumeRecord>>;

    async fn set(&self, key: &str, record: ResumeRecord) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    records: RwLock<HashMap<String, ResumeRecord>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn get(&self, key: &str) -> Result<Option<ResumeRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, record: ResumeRecord) -> Result<()> {
        self.records.write().await.insert(key.to_string(), record);
        Ok(())
    }
}

/// JSON file holding every record, rewritten on each save
#[derive(Debug)]
pub struct FileResumeStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileResumeStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, ResumeRecord>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(HashMap::new()),
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn get(&self, key: &str) -> Result<Option<ResumeRecord>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, record: ResumeRecord) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await?;
        records.insert(key.to_string(), record);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&records)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// Resume policy on top of a [`ResumeStore`]. Never surfaces errors.
#[derive(Clone)]
pub struct PositionStore {
    store: Arc<dyn ResumeStore>,
    config: ResumeConfig,
}

impl PositionStore {
    pub fn new(store: Arc<dyn ResumeStore>, config: ResumeConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ResumeConfig {
        &self.config
    }

    /// Stored position for `content_id`; storage failures read as none
    #[instrument(skip(self))]
    pub async fn load(&self, content_id: &str) -> Option<f64> {
        if !self.config.enabled {
            return None;
        }
        match self.store.get(&resume_key(content_id)).await {
            Ok(record) => record
                .map(|r| r.position_seconds)
                .filter(|p| p.is_finite() && *p >= 0.0),
            Err(e) => {
                warn!(error = %e, "Resume lookup failed");
                None
            }
        }
    }

    /// Persist a position; failures are logged and dropped
    pub async fn save(&self, content_id: &str, position: f64) {
        let record = ResumeRecord::new(content_id, position);
        match self.store.set(&resume_key(content_id), record).await {
            Ok(()) => debug!(content_id, position, "Resume position saved"),
            Err(e) => warn!(content_id, error = %e, "Resume save failed"),
        }
    }
}

/// Save throttle, one per attach
#[derive(Debug, Clone)]
pub struct SaveThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl SaveThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// True if a save is due at `now`; records the save when it is
    pub fn due(&mut self, now: Instant) -> bool {
        let due = match self.last {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applicable_window() {
        let config = ResumeConfig::default();
        assert_eq!(config.applicable(42.0, 600.0), Some(42.0));
        assert_eq!(config.applicable(10.0, 600.0), None);
        assert_eq!(config.applicable(598.5, 600.0), None);
        assert!(!config.should_save(Some(30.0)));
        assert!(config.should_save(Some(30.5)));
        assert!(!config.should_save(None));
    }

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = PositionStore::new(Arc::new(MemoryResumeStore::new()), ResumeConfig::default());
        assert_eq!(store.load("ep-1").await, None);
        store.save("ep-1", 42.0).await;
        assert_eq!(store.load("ep-1").await, Some(42.0));
        assert_eq!(store.load("ep-2").await, None);
    }

    #[tokio::test]
    async fn test_records_keyed_by_content() {
        let backend = Arc::new(MemoryResumeStore::new());
        let store = PositionStore::new(backend.clone(), ResumeConfig::default());
        store.save("movie", 12.5).await;

        let record = backend.get("resume:movie").await.unwrap().unwrap();
        assert_eq!(record.content_id, "movie");
        assert_eq!(record.position_seconds, 12.5);
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("resume.json");

        let store = PositionStore::new(Arc::new(FileResumeStore::new(&path)), ResumeConfig::default());
        assert_eq!(store.load("movie").await, None);
        store.save("movie", 42.0).await;
        store.save("series-1", 301.5).await;

        let reopened = PositionStore::new(Arc::new(FileResumeStore::new(&path)), ResumeConfig::default());
        assert_eq!(reopened.load("movie").await, Some(42.0));
        assert_eq!(reopened.load("series-1").await, Some(301.5));
    }

    #[tokio::test]
    async fn test_corrupt_file_reads_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        std::fs::write(&path, "{not json").unwrap();

        let backend = Arc::new(FileResumeStore::new(&path));
        assert!(matches!(backend.get("resume:movie").await, Err(Error::Storage(_))));

        let store = PositionStore::new(backend, ResumeConfig::default());
        assert_eq!(store.load("movie").await, None);
    }

    #[test]
    fn test_throttle() {
        let start = Instant::now();
        let mut every_tick = SaveThrottle::new(Duration::ZERO);
        assert!(every_tick.due(start));
        assert!(every_tick.due(start));

        let mut slow = SaveThrottle::new(Duration::from_secs(5));
        assert!(slow.due(start));
        assert!(!slow.due(start + Duration::from_secs(1)));
        assert!(slow.due(start + Duration::from_secs(5)));
    }
}
