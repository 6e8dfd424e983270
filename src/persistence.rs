//! Search cache persistence.
//!
//! Flat snapshot semantics: the whole search cache is loaded at startup and
//! written back as one JSON document. Writes go to a temp file in the target
//! directory which is then renamed over the target, so a crash mid-write
//! leaves the previous snapshot intact.

use crate::cache::SearchCache;
use crate::search::SearchResult;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Normalized query -> results
pub type SearchSnapshot = BTreeMap<String, Vec<SearchResult>>;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed snapshot {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Snapshot store for the search cache
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<SearchSnapshot, PersistError>;
    fn save(&self, snapshot: &SearchSnapshot) -> Result<(), PersistError>;
}

/// JSON file store
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl Persistence for JsonFileStore {
    /// A missing file is an empty snapshot.
    fn load(&self) -> Result<SearchSnapshot, PersistError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SearchSnapshot::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| PersistError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, snapshot: &SearchSnapshot) -> Result<(), PersistError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let body = serde_json::to_vec(snapshot).map_err(|source| PersistError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| self.io_err(e))?;
        tmp.write_all(&body).map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;
        Ok(())
    }
}

/// Write the current search cache through `store`. Errors are logged.
pub async fn checkpoint(cache: &SearchCache, store: &Arc<dyn Persistence>) -> bool {
    let snapshot = cache.snapshot();
    let entries = snapshot.len();
    let store = store.clone();

    match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
        Ok(Ok(())) => {
            debug!("Checkpointed {} search cache entries", entries);
            true
        }
        Ok(Err(e)) => {
            error!("Search cache checkpoint failed: {}", e);
            false
        }
        Err(e) => {
            error!("Search cache checkpoint task panicked: {}", e);
            false
        }
    }
}

/// Background task that saves the search cache after it changes.
///
/// Mutations are batched: after the first change the task waits `debounce`
/// before writing, so a burst of searches costs one write. On cancellation
/// anything inserted since the last successful save is flushed before the
/// task exits, whichever order the change and the cancellation arrive in.
pub fn spawn_checkpointer(
    cache: SearchCache,
    store: Arc<dyn Persistence>,
    debounce: Duration,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) {
    // Read before spawning so inserts racing the task's first poll still count
    let mut saved = cache.generation();

    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = cache.changed() => {}
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }

            let generation = cache.generation();
            if checkpoint(&cache, &store).await {
                saved = generation;
            }
        }

        if cache.generation() != saved {
            info!("Flushing search cache before shutdown");
            checkpoint(&cache, &store).await;
        }
    });
}
