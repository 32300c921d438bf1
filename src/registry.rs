use crate::builder::Builder;
use crate::error::BuilderError;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Concurrent name -> builder map; no lifecycle logic of its own
#[derive(Default)]
pub struct BuilderRegistry {
    builders: RwLock<HashMap<String, Arc<Builder>>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, builder: Arc<Builder>) {
        self.builders
            .write()
            .insert(builder.name().to_string(), builder);
    }

    pub fn get(&self, name: &str) -> Result<Arc<Builder>, BuilderError> {
        self.builders
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BuilderError::UnknownBuilder(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Builder>> {
        self.builders.write().remove(name)
    }

    pub fn all(&self) -> Vec<Arc<Builder>> {
        self.builders.read().values().cloned().collect()
    }
}

/// Periodic reclamation across every registered builder.
///
/// Independent of each builder's own expiry sweep, so a stuck
/// per-builder scheduler does not leak disk indefinitely.
pub struct BuilderCleaner {
    registry: Arc<BuilderRegistry>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BuilderCleaner {
    pub fn new(registry: Arc<BuilderRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            interval,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let registry = self.registry.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                for builder in registry.all() {
                    let mut cleaned = 0;
                    for task in builder.tasks() {
                        if task.is_expired(now) && builder.clean_build_task(task.id()).is_ok() {
                            cleaned += 1;
                        }
                    }
                    if cleaned > 0 {
                        tracing::debug!(
                            builder = %builder.name(),
                            cleaned,
                            "cleaner reclaimed expired build tasks"
                        );
                    }
                }
            }
        });
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Stop every builder and force-delete its repository tree
    pub async fn shutdown(&self) {
        self.stop();
        for builder in self.registry.all() {
            builder.stop().await;
            if let Err(e) = fs::remove_dir_all(builder.repository_dir()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(
                        builder = %builder.name(),
                        error = %e,
                        "failed to remove repository tree"
                    );
                }
            }
            self.registry.remove(builder.name());
        }
    }
}
