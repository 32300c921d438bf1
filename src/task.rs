use crate::config::BuilderConfiguration;
use crate::error::BuilderError;
use crate::logger::BuildLogger;
use crate::strategy::ResultExtractor;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, OnceCell};

/// Task ids are allocated in submission order from a process-wide
/// sequence and never reused.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst)
}

/// Externally observable task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    InQueue,
    InProgress,
    Successful,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Successful | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Outcome of one build, computed lazily and exactly once per task
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub successful: bool,
    pub result_files: Vec<PathBuf>,
    pub report: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Snapshot of a task for the surrounding request layer
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub id: u64,
    pub builder: String,
    pub workspace: String,
    pub project: String,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub command_line: Vec<String>,
    pub log_path: PathBuf,
}

#[derive(Debug, Clone)]
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<String>,
}

/// One asynchronous unit of build work.
///
/// State machine: created (`InQueue`) -> `InProgress` -> terminal, with
/// an orthogonal cancelled flag settable only before the terminal state.
/// The logger is owned by the task until closed at completion.
pub struct FutureBuildTask {
    id: u64,
    builder_name: String,
    command_line: Vec<String>,
    configuration: BuilderConfiguration,
    logger: Arc<Mutex<Box<dyn BuildLogger>>>,
    keep_result: chrono::Duration,
    extractor: Arc<dyn ResultExtractor>,
    state: Mutex<TaskState>,
    cancelled: AtomicBool,
    cancel_notify: Notify,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    result: OnceCell<BuildResult>,
}

impl FutureBuildTask {
    pub(crate) fn new(
        id: u64,
        builder_name: &str,
        command_line: Vec<String>,
        configuration: BuilderConfiguration,
        logger: Box<dyn BuildLogger>,
        keep_result_time: Duration,
        extractor: Arc<dyn ResultExtractor>,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let keep_result = chrono::Duration::from_std(keep_result_time)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        Self {
            id,
            builder_name: builder_name.to_string(),
            command_line,
            configuration,
            logger: Arc::new(Mutex::new(logger)),
            keep_result,
            extractor,
            state: Mutex::new(TaskState {
                status: TaskStatus::InQueue,
                start_time: None,
                end_time: None,
                exit_code: None,
                failure: None,
            }),
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            done_tx,
            done_rx,
            result: OnceCell::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn builder_name(&self) -> &str {
        &self.builder_name
    }

    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    pub fn configuration(&self) -> &BuilderConfiguration {
        &self.configuration
    }

    pub fn workspace(&self) -> &str {
        &self.configuration.request.workspace
    }

    pub fn project(&self) -> &str {
        &self.configuration.request.project
    }

    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state.lock().end_time
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    /// Failure detail when the task aborted before or during execution
    pub fn failure(&self) -> Option<String> {
        self.state.lock().failure.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    pub fn descriptor(&self) -> TaskDescriptor {
        let state = self.state.lock();
        TaskDescriptor {
            id: self.id,
            builder: self.builder_name.clone(),
            workspace: self.workspace().to_string(),
            project: self.project().to_string(),
            status: state.status,
            start_time: state.start_time,
            end_time: state.end_time,
            command_line: self.command_line.clone(),
            log_path: self.configuration.log_path(),
        }
    }

    /// Request cancellation; interrupts the queue wait or the live
    /// process. Returns false once the task is already terminal.
    pub fn cancel(&self) -> bool {
        if self.state.lock().status.is_terminal() {
            return false;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_notify.notify_one();
        true
    }

    /// Pure timestamp comparison, independent of result computation, so
    /// expiry works even when the result extractor later fails
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.state.lock().end_time {
            Some(end) => end + self.keep_result < now,
            None => false,
        }
    }

    /// Block until the task reaches a terminal state
    pub async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Await completion, then compute the result through the extractor
    /// exactly once; concurrent callers share the memoized value.
    ///
    /// Only an engine malfunction surfaces as an error here; a failed
    /// build is an unsuccessful result.
    pub async fn result(&self) -> Result<BuildResult, BuilderError> {
        self.wait_done().await;
        let result = self
            .result
            .get_or_try_init(|| async { self.extractor.extract(self) })
            .await
            .map_err(BuilderError::Internal)?;
        Ok(result.clone())
    }

    /// Result value if it has already been computed
    pub fn computed_result(&self) -> Option<&BuildResult> {
        self.result.get()
    }

    pub(crate) fn logger(&self) -> Arc<Mutex<Box<dyn BuildLogger>>> {
        self.logger.clone()
    }

    pub(crate) async fn cancel_requested(&self) {
        self.cancel_notify.notified().await;
    }

    pub(crate) fn mark_started(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::InQueue {
            return false;
        }
        state.status = TaskStatus::InProgress;
        state.start_time = Some(now);
        true
    }

    /// Transition to a terminal state, close the logger and wake all
    /// result waiters. Later calls are ignored.
    pub(crate) fn complete(
        &self,
        status: TaskStatus,
        exit_code: Option<i32>,
        failure: Option<String>,
        now: DateTime<Utc>,
    ) {
        {
            let mut state = self.state.lock();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
            state.end_time = Some(now);
            state.exit_code = exit_code;
            state.failure = failure;
        }
        if let Err(e) = self.logger.lock().close() {
            tracing::debug!(task_id = self.id, error = %e, "failed to close build log");
        }
        let _ = self.done_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigurationFactory;
    use crate::logger::FileBuildLogger;
    use crate::request::{BuildRequest, TaskType};
    use crate::strategy::WorkDirResultExtractor;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn make_task(root: &TempDir, keep: Duration) -> FutureBuildTask {
        let factory = ConfigurationFactory::new(root.path().to_path_buf());
        let configuration = factory
            .create(BuildRequest {
                workspace: "ws1".to_string(),
                project: "app".to_string(),
                source_url: "http://localhost/sources".to_string(),
                builder: "default".to_string(),
                timeout_secs: 0,
                targets: vec![],
                options: HashMap::new(),
                task_type: TaskType::Default,
            })
            .unwrap();
        let logger = FileBuildLogger::create(configuration.log_path()).unwrap();
        FutureBuildTask::new(
            next_task_id(),
            "default",
            vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
            configuration,
            Box::new(logger),
            keep,
            Arc::new(WorkDirResultExtractor::default()),
        )
    }

    #[test]
    fn test_task_ids_strictly_increase() {
        let a = next_task_id();
        let b = next_task_id();
        assert!(b > a);
    }

    #[test]
    fn test_cancel_before_terminal_then_after() {
        let root = TempDir::new().unwrap();
        let task = make_task(&root, Duration::from_secs(60));

        assert!(task.cancel());
        assert!(task.is_cancelled());

        task.complete(TaskStatus::Cancelled, None, None, Utc::now());
        assert!(!task.cancel());
    }

    #[test]
    fn test_complete_is_first_writer_wins() {
        let root = TempDir::new().unwrap();
        let task = make_task(&root, Duration::from_secs(60));

        task.complete(TaskStatus::Failed, Some(2), None, Utc::now());
        task.complete(TaskStatus::Successful, Some(0), None, Utc::now());

        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.exit_code(), Some(2));
    }

    #[test]
    fn test_expiry_is_pure_timestamp_comparison() {
        let root = TempDir::new().unwrap();
        let task = make_task(&root, Duration::from_secs(10));

        let now = Utc::now();
        assert!(!task.is_expired(now), "no end time yet");

        task.complete(TaskStatus::Successful, Some(0), None, now);
        assert!(!task.is_expired(now + chrono::Duration::seconds(5)));
        assert!(task.is_expired(now + chrono::Duration::seconds(11)));
    }

    #[tokio::test]
    async fn test_wait_done_unblocks_on_completion() {
        let root = TempDir::new().unwrap();
        let task = Arc::new(make_task(&root, Duration::from_secs(60)));

        let waiter = {
            let task = task.clone();
            tokio::spawn(async move {
                task.wait_done().await;
                task.status()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        task.complete(TaskStatus::Successful, Some(0), None, Utc::now());
        assert_eq!(waiter.await.unwrap(), TaskStatus::Successful);
    }
}
