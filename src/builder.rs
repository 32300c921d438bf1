use crate::config::{BuilderConfiguration, ConfigurationFactory};
use crate::constants::{
    DEFAULT_KEEP_RESULT_SECS, DEFAULT_MAX_QUEUE_TIME_SECS, DEFAULT_QUEUE_SIZE,
    DEFAULT_SHUTDOWN_WAIT_SECS, DEFAULT_SOURCES_RETENTION_DAYS, OUTPUT_DRAIN_SECS,
    SOURCES_SWEEP_INTERVAL_SECS, TASK_SWEEP_INTERVAL_SECS,
};
use crate::error::BuilderError;
use crate::events::{BuilderEvent, BuilderEventKind, EventBus};
use crate::logger::{BuildLogger, EventPublishingLogger, FileBuildLogger};
use crate::request::BuildRequest;
use crate::sources::{SourceClient, SourcesManager};
use crate::strategy::{CommandLineBuilder, ResultExtractor};
use crate::task::{next_task_id, FutureBuildTask, TaskDescriptor, TaskStatus};
use crate::watchdog::{Watchdog, WatchdogOutcome};
use anyhow::Result;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Tuning surface for one builder instance
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    /// Worker count; defaults to the logical CPU count
    pub workers: usize,
    /// Bounded queue beyond the workers; admissions past
    /// `workers + queue_size` are rejected
    pub queue_size: usize,
    pub keep_result_time: Duration,
    pub max_queue_time: Duration,
    pub task_sweep_interval: Duration,
    pub shutdown_wait: Duration,
    pub sources_retention: Duration,
    pub sources_sweep_interval: Duration,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_size: DEFAULT_QUEUE_SIZE,
            keep_result_time: Duration::from_secs(DEFAULT_KEEP_RESULT_SECS),
            max_queue_time: Duration::from_secs(DEFAULT_MAX_QUEUE_TIME_SECS),
            task_sweep_interval: Duration::from_secs(TASK_SWEEP_INTERVAL_SECS),
            shutdown_wait: Duration::from_secs(DEFAULT_SHUTDOWN_WAIT_SECS),
            sources_retention: Duration::from_secs(DEFAULT_SOURCES_RETENTION_DAYS * 24 * 3600),
            sources_sweep_interval: Duration::from_secs(SOURCES_SWEEP_INTERVAL_SECS),
        }
    }
}

/// Read-only engine snapshot
#[derive(Debug, Clone, Serialize)]
pub struct BuilderStats {
    pub workers: usize,
    pub busy_workers: usize,
    pub queued_tasks: usize,
    pub live_tasks: usize,
}

/// Observer invoked on the worker immediately before and after task
/// execution. Failures are logged, never propagated to the pool.
pub trait BuildListener: Send + Sync {
    fn begin(&self, task: &Arc<FutureBuildTask>) -> Result<()>;
    fn end(&self, task: &Arc<FutureBuildTask>) -> Result<()>;
}

/// Engine core: bounded worker pool, task registry, expiry sweep and
/// the build lifecycle (perform -> execute -> cleanup).
///
/// The repository tree `repository/<name>/{sources,builds}` is owned
/// exclusively by this instance.
pub struct Builder {
    weak_self: Weak<Builder>,
    name: String,
    repository_dir: PathBuf,
    builds_dir: PathBuf,
    settings: BuilderSettings,
    command_line: Arc<dyn CommandLineBuilder>,
    extractor: Arc<dyn ResultExtractor>,
    sources: Arc<SourcesManager>,
    factory: ConfigurationFactory,
    events: EventBus,
    started: Mutex<bool>,
    tasks: RwLock<HashMap<u64, Arc<FutureBuildTask>>>,
    listeners: RwLock<Vec<Arc<dyn BuildListener>>>,
    worker_permits: Arc<Semaphore>,
    admission_permits: Arc<Semaphore>,
    busy: AtomicUsize,
    queued: AtomicUsize,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl Builder {
    pub fn new(
        name: &str,
        repository_root: &Path,
        settings: BuilderSettings,
        command_line: Arc<dyn CommandLineBuilder>,
        extractor: Arc<dyn ResultExtractor>,
        source_client: Arc<dyn SourceClient>,
    ) -> Arc<Self> {
        let repository_dir = repository_root.join(name);
        let builds_dir = repository_dir.join("builds");
        let sources_dir = repository_dir.join("sources");

        let sources = SourcesManager::new(
            sources_dir,
            source_client,
            settings.sources_retention,
            settings.sources_sweep_interval,
        );

        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            name: name.to_string(),
            repository_dir,
            builds_dir: builds_dir.clone(),
            command_line,
            extractor,
            sources,
            factory: ConfigurationFactory::new(builds_dir),
            events: EventBus::default(),
            started: Mutex::new(false),
            tasks: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            worker_permits: Arc::new(Semaphore::new(settings.workers)),
            admission_permits: Arc::new(Semaphore::new(settings.workers + settings.queue_size)),
            busy: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            sweep: Mutex::new(None),
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repository_dir(&self) -> &Path {
        &self.repository_dir
    }

    /// Subscribe to this builder's lifecycle events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BuilderEvent> {
        self.events.subscribe()
    }

    /// Create the on-disk repository and launch the background sweeps.
    /// Must be called exactly once before any other operation.
    pub fn start(&self) -> Result<(), BuilderError> {
        let mut started = self.started.lock();
        if *started {
            return Err(BuilderError::AlreadyStarted(self.name.clone()));
        }

        let dirs = [
            self.repository_dir.clone(),
            self.builds_dir.clone(),
            self.sources.sources_dir().to_path_buf(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir).map_err(|source| BuilderError::Infrastructure {
                path: dir.clone(),
                source,
            })?;
        }

        self.sources.start();

        let weak = self.weak_self.clone();
        let interval = self.settings.task_sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = Weak::upgrade(&weak) else {
                    break;
                };
                let removed = engine.remove_expired_tasks();
                if removed > 0 {
                    tracing::debug!(
                        builder = %engine.name,
                        removed,
                        "expired build tasks evicted"
                    );
                }
            }
        });
        *self.sweep.lock() = Some(handle);

        *started = true;
        tracing::info!(builder = %self.name, workers = self.settings.workers, "builder started");
        Ok(())
    }

    /// Idempotent inverse of `start()`: cancel live tasks, drain with a
    /// bounded wait, then reclaim all on-disk task state.
    pub async fn stop(&self) {
        {
            let mut started = self.started.lock();
            if !*started {
                return;
            }
            *started = false;
        }

        if let Some(handle) = self.sweep.lock().take() {
            handle.abort();
        }
        self.sources.stop();

        let live: Vec<Arc<FutureBuildTask>> = self.tasks.read().values().cloned().collect();
        for task in &live {
            task.cancel();
        }

        let deadline = tokio::time::Instant::now() + self.settings.shutdown_wait;
        while self.busy.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for task in &live {
            self.cleanup(task);
        }
        if let Err(e) = fs::remove_dir_all(&self.builds_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(builder = %self.name, error = %e, "failed to remove builds tree");
            }
        }

        self.tasks.write().clear();
        self.listeners.write().clear();
        tracing::info!(builder = %self.name, "builder stopped");
    }

    /// Validate the request, derive its configuration, open a fresh log
    /// and submit the work. Non-blocking: the returned task is
    /// observable via polling or listeners.
    pub fn perform(&self, request: BuildRequest) -> Result<Arc<FutureBuildTask>, BuilderError> {
        self.ensure_started()?;
        let configuration = self.factory.create(request)?;
        let logger = FileBuildLogger::create(configuration.log_path())
            .map_err(BuilderError::Internal)?;
        self.execute(configuration, Box::new(logger))
    }

    /// Admit a configured build to the worker pool.
    ///
    /// Fails fast with `TooManyTasks` when the pool and its bounded
    /// queue are both full, protecting the host from unbounded growth.
    pub fn execute(
        &self,
        configuration: BuilderConfiguration,
        logger: Box<dyn BuildLogger>,
    ) -> Result<Arc<FutureBuildTask>, BuilderError> {
        self.ensure_started()?;

        let admission = self
            .admission_permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| BuilderError::TooManyTasks {
                limit: self.settings.workers + self.settings.queue_size,
            })?;

        let command_line = self
            .command_line
            .command_line(&configuration)
            .map_err(BuilderError::Internal)?;
        if command_line.is_empty() {
            return Err(BuilderError::InvalidRequest(
                "derived command line is empty".to_string(),
            ));
        }

        let id = next_task_id();
        let logger = EventPublishingLogger::new(
            logger,
            self.events.clone(),
            id,
            &configuration.request.workspace,
            &configuration.request.project,
        );
        let timeout_secs = configuration.request.timeout_secs;
        let task = Arc::new(FutureBuildTask::new(
            id,
            &self.name,
            command_line,
            configuration,
            Box::new(logger),
            self.settings.keep_result_time,
            self.extractor.clone(),
        ));

        self.tasks.write().insert(id, task.clone());

        // The queued event is published synchronously with admission, so
        // it is never observable after the task's own BEGIN
        if self.worker_permits.available_permits() == 0 {
            self.events.publish(self.event(BuilderEventKind::BuildTaskAddedInQueue, &task));
        }

        let Some(engine) = self.weak_self.upgrade() else {
            return Err(BuilderError::NotStarted(self.name.clone()));
        };
        tokio::spawn(engine.run(task.clone(), timeout_secs, admission));
        tracing::debug!(builder = %self.name, task_id = id, "build task submitted");
        Ok(task)
    }

    /// Task lookup; `TaskNotFound` covers both never-registered and
    /// already-expired ids
    pub fn build_task(&self, id: u64) -> Result<Arc<FutureBuildTask>, BuilderError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(BuilderError::TaskNotFound(id))
    }

    pub fn tasks(&self) -> Vec<Arc<FutureBuildTask>> {
        self.tasks.read().values().cloned().collect()
    }

    pub fn stats(&self) -> BuilderStats {
        BuilderStats {
            workers: self.settings.workers,
            busy_workers: self.busy.load(Ordering::SeqCst),
            queued_tasks: self.queued.load(Ordering::SeqCst),
            live_tasks: self.tasks.read().len(),
        }
    }

    pub fn task_stats(&self, id: u64) -> Result<TaskDescriptor, BuilderError> {
        Ok(self.build_task(id)?.descriptor())
    }

    pub fn add_build_listener(&self, listener: Arc<dyn BuildListener>) {
        self.listeners.write().push(listener);
    }

    pub fn remove_build_listener(&self, listener: &Arc<dyn BuildListener>) {
        self.listeners
            .write()
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    /// Remove a task from the registry and reclaim its artifacts
    pub fn clean_build_task(&self, id: u64) -> Result<(), BuilderError> {
        let task = self
            .tasks
            .write()
            .remove(&id)
            .ok_or(BuilderError::TaskNotFound(id))?;
        self.cleanup(&task);
        Ok(())
    }

    /// Evict every terminal task past its retention window; returns the
    /// number removed. Runs on the internal sweep and is also driven by
    /// the cross-builder cleaner.
    pub fn remove_expired_tasks(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<u64> = self
            .tasks
            .read()
            .values()
            .filter(|task| task.is_expired(now))
            .map(|task| task.id())
            .collect();
        let mut removed = 0;
        for id in expired {
            if self.clean_build_task(id).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Best-effort removal of the task's directories, log and declared
    /// artifacts. Individual failures are logged and skipped; leaked
    /// files are recoverable by a later sweep.
    pub fn cleanup(&self, task: &Arc<FutureBuildTask>) {
        if let Some(result) = task.computed_result() {
            for file in &result.result_files {
                remove_quietly(file, false);
            }
            if let Some(report) = &result.report {
                remove_quietly(report, report.is_dir());
            }
        }
        remove_quietly(&task.configuration().build_dir, true);
        remove_quietly(&task.configuration().log_path(), false);
    }

    fn ensure_started(&self) -> Result<(), BuilderError> {
        if !*self.started.lock() {
            return Err(BuilderError::NotStarted(self.name.clone()));
        }
        Ok(())
    }

    fn event(&self, kind: BuilderEventKind, task: &FutureBuildTask) -> BuilderEvent {
        BuilderEvent::new(kind, task.id(), task.workspace(), task.project())
    }

    fn notify_listeners(&self, task: &Arc<FutureBuildTask>, begin: bool) {
        let listeners: Vec<Arc<dyn BuildListener>> = self.listeners.read().clone();
        for listener in listeners {
            let outcome = if begin {
                listener.begin(task)
            } else {
                listener.end(task)
            };
            if let Err(e) = outcome {
                tracing::warn!(
                    builder = %self.name,
                    task_id = task.id(),
                    error = %e,
                    "build listener failed"
                );
            }
        }
    }

    fn finish_cancelled(&self, task: &Arc<FutureBuildTask>, exit_code: Option<i32>) {
        task.complete(TaskStatus::Cancelled, exit_code, None, Utc::now());
        self.events.publish(self.event(BuilderEventKind::Canceled, task));
    }

    /// The worker-side build lifecycle. Holds its admission permit until
    /// the task is terminal.
    async fn run(
        self: Arc<Self>,
        task: Arc<FutureBuildTask>,
        timeout_secs: i64,
        _admission: OwnedSemaphorePermit,
    ) {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::select! {
            permit = self.worker_permits.clone().acquire_owned() => permit.ok(),
            _ = task.cancel_requested() => None,
            _ = tokio::time::sleep(self.settings.max_queue_time) => {
                self.events.publish(self.event(BuilderEventKind::BuildTaskQueueTimeExceeded, &task));
                tracing::warn!(task_id = task.id(), "build task exceeded its queue time");
                task.cancel();
                None
            }
        };
        self.queued.fetch_sub(1, Ordering::SeqCst);

        let Some(_permit) = permit else {
            self.finish_cancelled(&task, None);
            return;
        };
        if task.is_cancelled() {
            self.finish_cancelled(&task, None);
            return;
        }

        self.busy.fetch_add(1, Ordering::SeqCst);
        self.notify_listeners(&task, true);
        self.execute_on_worker(&task, timeout_secs).await;
        self.notify_listeners(&task, false);
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }

    async fn execute_on_worker(&self, task: &Arc<FutureBuildTask>, timeout_secs: i64) {
        task.mark_started(Utc::now());
        self.events.publish(self.event(BuilderEventKind::BuildTimeStarted, task));

        let request = &task.configuration().request;
        let staging = self
            .sources
            .get_sources(
                &request.workspace,
                &request.project,
                &request.source_url,
                &task.configuration().work_dir,
            )
            .await;
        if let Err(e) = staging {
            let detail = format!("Failed to stage sources: {}", e);
            if let Err(log_err) = task.logger().lock().write_line(&detail) {
                tracing::debug!(error = %log_err, "could not record staging failure");
            }
            task.complete(TaskStatus::Failed, None, Some(detail), Utc::now());
            self.events.publish(self.event(BuilderEventKind::Done, task));
            return;
        }
        if task.is_cancelled() {
            self.finish_cancelled(task, None);
            return;
        }

        self.events.publish(self.event(BuilderEventKind::Begin, task));

        let command_line = task.command_line();
        let mut command = tokio::process::Command::new(&command_line[0]);
        command
            .args(&command_line[1..])
            .current_dir(&task.configuration().work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let detail = format!("Failed to launch build process: {}", e);
                if let Err(log_err) = task.logger().lock().write_line(&detail) {
                    tracing::debug!(error = %log_err, "could not record launch failure");
                }
                task.complete(TaskStatus::Failed, None, Some(detail), Utc::now());
                self.events.publish(self.event(BuilderEventKind::Done, task));
                return;
            }
        };

        let stdout_pump = child.stdout.take().map(|out| pump_output(out, task));
        let stderr_pump = child.stderr.take().map(|err| pump_output(err, task));

        let watchdog = Watchdog::new(timeout_secs);
        let timeout_logger = task.logger();
        let wait = async {
            // biased: an exit status that is already available wins over
            // a racing cancellation
            tokio::select! {
                biased;
                status = child.wait() => ProcessWait::Exited(status),
                _ = task.cancel_requested() => ProcessWait::CancelRequested,
            }
        };
        let verdict = watchdog
            .guard(wait, move || {
                let notice = format!(
                    "Build terminated: execution time exceeded {} seconds",
                    timeout_secs
                );
                if let Err(e) = timeout_logger.lock().write_line(&notice) {
                    tracing::debug!(error = %e, "could not record timeout notice");
                }
            })
            .await;

        let (status, exit_code, failure) = match verdict {
            WatchdogOutcome::Completed(ProcessWait::Exited(Ok(exit))) => {
                // A cancel that raced a natural exit still yields the
                // process's own result
                let code = exit.code();
                if exit.success() {
                    (TaskStatus::Successful, code, None)
                } else {
                    (
                        TaskStatus::Failed,
                        code,
                        Some(format!("build process exited with {}", exit)),
                    )
                }
            }
            WatchdogOutcome::Completed(ProcessWait::Exited(Err(e))) => (
                TaskStatus::Failed,
                None,
                Some(format!("failed to await build process: {}", e)),
            ),
            WatchdogOutcome::Completed(ProcessWait::CancelRequested) => {
                let exit = kill_and_reap(&mut child).await;
                (TaskStatus::Cancelled, exit, None)
            }
            WatchdogOutcome::Expired => {
                let exit = kill_and_reap(&mut child).await;
                (
                    TaskStatus::Failed,
                    exit,
                    Some(format!("execution time exceeded {} seconds", timeout_secs)),
                )
            }
        };

        // In-flight output is best-effort after a kill
        let drain = async {
            if let Some(pump) = stdout_pump {
                let _ = pump.await;
            }
            if let Some(pump) = stderr_pump {
                let _ = pump.await;
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(OUTPUT_DRAIN_SECS), drain).await;

        task.complete(status, exit_code, failure, Utc::now());
        let kind = if status == TaskStatus::Cancelled {
            BuilderEventKind::Canceled
        } else {
            BuilderEventKind::Done
        };
        self.events.publish(self.event(kind, task));
        tracing::info!(
            builder = %self.name,
            task_id = task.id(),
            status = ?status,
            exit_code,
            "build task finished"
        );
    }
}

enum ProcessWait {
    Exited(std::io::Result<std::process::ExitStatus>),
    CancelRequested,
}

async fn kill_and_reap(child: &mut tokio::process::Child) -> Option<i32> {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "build process already gone");
    }
    match child.wait().await {
        Ok(exit) => exit.code(),
        Err(_) => None,
    }
}

fn pump_output(
    reader: impl AsyncRead + Unpin + Send + 'static,
    task: &Arc<FutureBuildTask>,
) -> JoinHandle<()> {
    let logger = task.logger();
    let task_id = task.id();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Err(e) = logger.lock().write_line(&line) {
                tracing::debug!(task_id, error = %e, "dropping build output line");
                break;
            }
        }
    })
}

fn remove_quietly(path: &Path, recursive: bool) {
    let outcome = if recursive {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = outcome {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "cleanup failure skipped");
        }
    }
}
