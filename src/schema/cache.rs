//! Schema snapshot cache
//!
//! Serves the current [`SchemaSnapshot`] from memory, falling back to a JSON
//! artifact on disk and finally to live introspection. A stale snapshot is
//! returned immediately while one background refresh replaces it; readers
//! keep seeing the old `Arc` until the new one is committed.

use crate::error::{CopilotError, Result};
use crate::schema::introspect::{introspect, SchemaSource};
use crate::schema::model::SchemaSnapshot;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call cache options.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotOptions {
    pub use_cache: bool,
    pub force_refresh: bool,
    /// Overrides the cache's configured maximum age.
    pub max_age_hours: Option<f64>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            force_refresh: false,
            max_age_hours: None,
        }
    }
}

impl SnapshotOptions {
    pub fn refresh() -> Self {
        Self {
            force_refresh: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RefreshStatus {
    Idle,
    Running { started_at: DateTime<Utc> },
    Succeeded { at: DateTime<Utc>, tables: usize, failed_tables: usize },
    Failed { at: DateTime<Utc>, message: String },
}

/// Handle to a detached refresh. Awaiting it yields the refresh outcome.
pub struct RefreshHandle {
    started_at: DateTime<Utc>,
    join: JoinHandle<Result<()>>,
}

impl RefreshHandle {
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| CopilotError::SchemaIntrospection(format!("refresh task failed: {}", e)))?
    }
}

pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    path: PathBuf,
    max_age: Duration,
    concurrency: usize,
    current: RwLock<Option<Arc<SchemaSnapshot>>>,
    refresh: Mutex<Option<RefreshHandle>>,
    status: watch::Sender<RefreshStatus>,
}

impl SchemaCache {
    pub fn new(
        source: Arc<dyn SchemaSource>,
        path: impl Into<PathBuf>,
        max_age_hours: f64,
        concurrency: usize,
    ) -> Self {
        let (status, _) = watch::channel(RefreshStatus::Idle);
        Self {
            source,
            path: path.into(),
            max_age: hours(max_age_hours),
            concurrency,
            current: RwLock::new(None),
            refresh: Mutex::new(None),
            status,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Subscribe to background refresh outcomes.
    pub fn refresh_status(&self) -> watch::Receiver<RefreshStatus> {
        self.status.subscribe()
    }

    /// Current snapshot according to `options`. Never waits on a background refresh.
    pub async fn get_snapshot(self: &Arc<Self>, options: SnapshotOptions) -> Result<Arc<SchemaSnapshot>> {
        if options.force_refresh || !options.use_cache {
            info!("Introspecting schema (cache bypassed)");
            return self.refresh_now().await;
        }

        let max_age = options.max_age_hours.map(hours).unwrap_or(self.max_age);

        let cached = self.current.read().await.clone();
        if let Some(snapshot) = cached {
            self.refresh_if_stale(&snapshot, max_age).await;
            return Ok(snapshot);
        }

        match load_from_disk(&self.path).await {
            Ok(Some(snapshot)) => {
                let snapshot = Arc::new(snapshot);
                debug!("Loaded schema snapshot from {}", self.path.display());
                {
                    let mut current = self.current.write().await;
                    // Another caller may have committed first; keep theirs.
                    if let Some(existing) = current.as_ref() {
                        return Ok(Arc::clone(existing));
                    }
                    *current = Some(Arc::clone(&snapshot));
                }
                self.refresh_if_stale(&snapshot, max_age).await;
                Ok(snapshot)
            }
            Ok(None) => {
                info!("No cached schema at {}, introspecting", self.path.display());
                self.refresh_now().await
            }
            Err(e) => {
                warn!("Ignoring unreadable schema cache {}: {}", self.path.display(), e);
                self.refresh_now().await
            }
        }
    }

    /// Introspect synchronously and commit the result.
    pub async fn refresh_now(&self) -> Result<Arc<SchemaSnapshot>> {
        let snapshot = Arc::new(introspect(Arc::clone(&self.source), self.concurrency).await?);
        self.commit(Arc::clone(&snapshot)).await?;
        Ok(snapshot)
    }

    /// Start a background refresh unless one is already running.
    /// Returns `true` when a new refresh was started.
    pub async fn spawn_refresh(self: &Arc<Self>) -> bool {
        let mut slot = self.refresh.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Schema refresh already in flight");
            return false;
        }

        let started_at = Utc::now();
        self.status.send_replace(RefreshStatus::Running { started_at });
        let cache = Arc::clone(self);
        let join = tokio::spawn(async move {
            let outcome = cache.refresh_now().await;
            let status = match &outcome {
                Ok(snapshot) => {
                    info!("Background schema refresh committed {} tables", snapshot.total_tables);
                    RefreshStatus::Succeeded {
                        at: Utc::now(),
                        tables: snapshot.total_tables,
                        failed_tables: snapshot.failed_tables().len(),
                    }
                }
                Err(e) => {
                    warn!("Background schema refresh failed: {}", e);
                    RefreshStatus::Failed {
                        at: Utc::now(),
                        message: e.to_string(),
                    }
                }
            };
            cache.status.send_replace(status);
            outcome.map(|_| ())
        });
        *slot = Some(RefreshHandle { started_at, join });
        true
    }

    /// Take the most recent refresh handle, if any, to await or inspect it.
    pub async fn take_refresh_handle(&self) -> Option<RefreshHandle> {
        self.refresh.lock().await.take()
    }

    async fn refresh_if_stale(self: &Arc<Self>, snapshot: &SchemaSnapshot, max_age: Duration) {
        if snapshot.is_stale(max_age, Utc::now()) {
            info!(
                "Schema snapshot is {} minutes old, refreshing in background",
                snapshot.age(Utc::now()).num_minutes()
            );
            self.spawn_refresh().await;
        }
    }

    async fn commit(&self, snapshot: Arc<SchemaSnapshot>) -> Result<()> {
        *self.current.write().await = Some(Arc::clone(&snapshot));
        if let Err(e) = save_to_disk(&self.path, &snapshot).await {
            // The in-memory snapshot is still served.
            warn!("Failed to persist schema cache to {}: {}", self.path.display(), e);
        }
        Ok(())
    }
}

fn hours(value: f64) -> Duration {
    Duration::milliseconds((value.max(0.0) * 3_600_000.0) as i64)
}

pub async fn load_from_disk(path: &Path) -> Result<Option<SchemaSnapshot>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write through a sibling temp file and rename, so readers never see a torn file.
pub async fn save_to_disk(path: &Path, snapshot: &SchemaSnapshot) -> Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
