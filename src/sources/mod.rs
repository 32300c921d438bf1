pub mod client;
pub mod manifest;

pub use client::{HttpSourceClient, SourceClient, SourceUpdate, StagingError};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

/// Bookkeeping file recording the last successful sync of a project
/// cache; its mtime drives eviction.
pub(crate) const SYNC_MARKER: &str = ".last-sync";

type FetchFuture = Shared<BoxFuture<'static, Result<(), StagingError>>>;

struct InflightFetch {
    generation: u64,
    future: FetchFuture,
}

/// Stages project source trees into build work directories.
///
/// A persistent per-project cache under `sources/<workspace>/<project>`
/// is diffed against the remote via md5 manifests, so repeat builds
/// transfer only changed files. Concurrent fetches for one project are
/// coalesced onto a single in-flight future, and a background sweep
/// evicts caches untouched longer than the retention window.
pub struct SourcesManager {
    weak_self: Weak<SourcesManager>,
    sources_dir: PathBuf,
    client: Arc<dyn SourceClient>,
    retention: Duration,
    sweep_interval: Duration,
    inflight: Mutex<HashMap<String, InflightFetch>>,
    key_guards: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl SourcesManager {
    pub fn new(
        sources_dir: PathBuf,
        client: Arc<dyn SourceClient>,
        retention: Duration,
        sweep_interval: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            sources_dir,
            client,
            retention,
            sweep_interval,
            inflight: Mutex::new(HashMap::new()),
            key_guards: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            sweep: Mutex::new(None),
        })
    }

    pub fn sources_dir(&self) -> &Path {
        &self.sources_dir
    }

    /// Launch the periodic cache eviction sweep
    pub fn start(&self) {
        let weak = self.weak_self.clone();
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = Weak::upgrade(&weak) else {
                    break;
                };
                manager.sweep_once().await;
            }
        });
        *self.sweep.lock() = Some(handle);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.abort();
        }
    }

    /// Bring the project cache up to date and copy it into `work_dir`.
    ///
    /// Concurrent callers for the same (workspace, project) block on one
    /// shared fetch and observe the same success or error.
    pub async fn get_sources(
        &self,
        workspace: &str,
        project: &str,
        url: &str,
        work_dir: &Path,
    ) -> Result<(), StagingError> {
        let key = project_key(workspace, project);

        let (generation, fetch) = {
            let mut inflight = self.inflight.lock();
            if let Some(entry) = inflight.get(&key) {
                (entry.generation, entry.future.clone())
            } else {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                let future: FetchFuture = refresh_cache(
                    self.client.clone(),
                    self.key_guard(&key),
                    self.cache_dir(workspace, project),
                    workspace.to_string(),
                    project.to_string(),
                    url.to_string(),
                )
                .boxed()
                .shared();
                inflight.insert(
                    key.clone(),
                    InflightFetch {
                        generation,
                        future: future.clone(),
                    },
                );
                (generation, future)
            }
        };

        let outcome = fetch.await;

        {
            let mut inflight = self.inflight.lock();
            if inflight.get(&key).map(|e| e.generation) == Some(generation) {
                inflight.remove(&key);
            }
        }

        outcome?;

        let cache_dir = self.cache_dir(workspace, project);
        let copied = manifest::copy_tree(&cache_dir, work_dir)
            .map_err(|e| StagingError::io(work_dir, e))?;
        tracing::debug!(workspace, project, files = copied, "sources staged");
        Ok(())
    }

    fn cache_dir(&self, workspace: &str, project: &str) -> PathBuf {
        self.sources_dir.join(workspace).join(project)
    }

    fn key_guard(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.key_guards
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    /// Evict project caches untouched longer than the retention window.
    /// An in-flight download always wins ties: the sweep try-locks the
    /// project guard and skips on contention.
    async fn sweep_once(&self) {
        let Ok(workspaces) = fs::read_dir(&self.sources_dir) else {
            return;
        };
        for workspace in workspaces.flatten() {
            if !workspace.path().is_dir() {
                continue;
            }
            let workspace_name = workspace.file_name().to_string_lossy().to_string();
            let Ok(projects) = fs::read_dir(workspace.path()) else {
                continue;
            };
            for project in projects.flatten() {
                let project_dir = project.path();
                if !project_dir.is_dir() {
                    continue;
                }
                let age = match last_touched(&project_dir).and_then(|t| t.elapsed().ok()) {
                    Some(age) => age,
                    None => continue,
                };
                if age < self.retention {
                    continue;
                }

                let project_name = project.file_name().to_string_lossy().to_string();
                let key = project_key(&workspace_name, &project_name);
                let guard = self.key_guard(&key);
                match guard.try_lock() {
                    Ok(_held) => {
                        match fs::remove_dir_all(&project_dir) {
                            Ok(()) => tracing::info!(
                                workspace = workspace_name,
                                project = project_name,
                                "evicted stale sources cache"
                            ),
                            Err(e) => tracing::warn!(
                                path = %project_dir.display(),
                                error = %e,
                                "failed to evict sources cache"
                            ),
                        }
                    }
                    Err(_) => {
                        tracing::debug!(key, "skipping eviction, download in flight");
                    }
                };
            }
        }
    }
}

/// The single real fetch behind a dedup future: hash the cache, ask
/// the remote for the delta, apply it. Holds the per-project guard for
/// the duration, so the eviction sweep cannot touch the cache
/// mid-download.
async fn refresh_cache(
    client: Arc<dyn SourceClient>,
    guard: Arc<tokio::sync::Mutex<()>>,
    cache_dir: PathBuf,
    workspace: String,
    project: String,
    url: String,
) -> Result<(), StagingError> {
    let _held = guard.lock().await;

    fs::create_dir_all(&cache_dir).map_err(|e| StagingError::io(&cache_dir, e))?;

    let manifest_text =
        manifest::compute_manifest(&cache_dir).map_err(|e| StagingError::io(&cache_dir, e))?;

    match client.fetch(&url, &manifest_text).await? {
        SourceUpdate::Unchanged => {
            tracing::debug!(workspace, project, "sources cache already current");
        }
        SourceUpdate::Full { archive } => {
            // Full snapshot replaces whatever the cache held,
            // including leftovers from an aborted earlier fetch
            fs::remove_dir_all(&cache_dir).ok();
            fs::create_dir_all(&cache_dir).map_err(|e| StagingError::io(&cache_dir, e))?;
            unpack_archive(archive.path(), &cache_dir)?;
            tracing::info!(workspace, project, "full source snapshot unpacked");
        }
        SourceUpdate::Partial { updates, removed } => {
            for path in &removed {
                let Some(relative) = sanitize_relative(path) else {
                    tracing::warn!(workspace, project, path, "ignoring unsafe removed path");
                    continue;
                };
                let target = cache_dir.join(relative);
                let removal = if target.is_dir() {
                    fs::remove_dir_all(&target)
                } else {
                    fs::remove_file(&target)
                };
                if let Err(e) = removal {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path, error = %e, "failed to remove stale source");
                    }
                }
            }
            if let Some(archive) = updates {
                unpack_archive(archive.path(), &cache_dir)?;
            }
            tracing::info!(
                workspace,
                project,
                removed = removed.len(),
                "source delta applied"
            );
        }
    }

    if let Err(e) = fs::write(cache_dir.join(SYNC_MARKER), Utc::now().to_rfc3339()) {
        tracing::warn!(error = %e, "failed to touch sources sync marker");
    }
    Ok(())
}

fn project_key(workspace: &str, project: &str) -> String {
    format!("{}/{}", workspace, project)
}

/// Newest of the sync marker and the directory itself
fn last_touched(dir: &Path) -> Option<SystemTime> {
    let marker = fs::metadata(dir.join(SYNC_MARKER))
        .and_then(|m| m.modified())
        .ok();
    let own = fs::metadata(dir).and_then(|m| m.modified()).ok();
    match (marker, own) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Reject absolute paths and parent-directory escapes from the remote
fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let path = Path::new(path);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Unpack a zip archive into the cache, overwriting existing entries
fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), StagingError> {
    let file = fs::File::open(archive_path).map_err(|e| StagingError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| StagingError::Archive(format!("unreadable archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| StagingError::Archive(format!("bad archive entry: {}", e)))?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            tracing::warn!(entry = entry.name(), "skipping archive entry escaping root");
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| StagingError::io(&target, e))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| StagingError::io(parent, e))?;
        }
        let mut out = fs::File::create(&target).map_err(|e| StagingError::io(&target, e))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| StagingError::Archive(format!("truncated archive entry: {}", e)))?;
    }
    Ok(())
}
