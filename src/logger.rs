use crate::events::{BuilderEvent, BuilderEventKind, EventBus};
use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only line sink for a running build.
///
/// A logger is open until closed; writing after close is an error.
pub trait BuildLogger: Send {
    fn write_line(&mut self, line: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    /// Backing file, if the sink persists to disk
    fn path(&self) -> Option<&Path>;
}

/// File-backed logger flushing after every line.
///
/// Durability over throughput: lines arrive at process speed, not
/// hot-path volume.
pub struct FileBuildLogger {
    path: PathBuf,
    file: Option<File>,
}

impl FileBuildLogger {
    pub fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .with_context(|| format!("failed to create build log {}", path.display()))?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }
}

impl BuildLogger for FileBuildLogger {
    fn write_line(&mut self, line: &str) -> Result<()> {
        let Some(file) = self.file.as_mut() else {
            bail!("build log {} is already closed", self.path.display());
        };
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        Ok(())
    }

    fn path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Decorator that publishes every line as a `MessageLogged` event before
/// delegating to the underlying sink.
pub struct EventPublishingLogger {
    inner: Box<dyn BuildLogger>,
    events: EventBus,
    task_id: u64,
    workspace: String,
    project: String,
    next_line: u64,
}

impl EventPublishingLogger {
    pub fn new(
        inner: Box<dyn BuildLogger>,
        events: EventBus,
        task_id: u64,
        workspace: &str,
        project: &str,
    ) -> Self {
        Self {
            inner,
            events,
            task_id,
            workspace: workspace.to_string(),
            project: project.to_string(),
            next_line: 0,
        }
    }
}

impl BuildLogger for EventPublishingLogger {
    fn write_line(&mut self, line: &str) -> Result<()> {
        self.next_line += 1;
        self.events.publish(
            BuilderEvent::new(
                BuilderEventKind::MessageLogged,
                self.task_id,
                &self.workspace,
                &self.project,
            )
            .with_message(self.next_line, line),
        );
        self.inner.write_line(line)
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn path(&self) -> Option<&Path> {
        self.inner.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_logger_persists_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task-1.log");
        let mut logger = FileBuildLogger::create(path.clone()).unwrap();
        logger.write_line("first").unwrap();
        logger.write_line("second").unwrap();
        logger.close().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = TempDir::new().unwrap();
        let mut logger = FileBuildLogger::create(dir.path().join("task-2.log")).unwrap();
        logger.close().unwrap();
        assert!(logger.write_line("late").is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut logger = FileBuildLogger::create(dir.path().join("task-3.log")).unwrap();
        logger.close().unwrap();
        logger.close().unwrap();
    }

    #[tokio::test]
    async fn test_decorator_numbers_and_publishes_before_delegating() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task-4.log");
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let inner = FileBuildLogger::create(path.clone()).unwrap();
        let mut logger = EventPublishingLogger::new(Box::new(inner), bus, 9, "ws", "proj");
        logger.write_line("alpha").unwrap();
        logger.write_line("beta").unwrap();
        logger.close().unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, BuilderEventKind::MessageLogged);
        assert_eq!(first.task_id, 9);
        let msg = first.message.unwrap();
        assert_eq!(msg.line_number, 1);
        assert_eq!(msg.text, "alpha");

        let second = rx.recv().await.unwrap();
        assert_eq!(second.message.unwrap().line_number, 2);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "alpha\nbeta\n");
    }

    #[tokio::test]
    async fn test_decorator_publishes_even_when_sink_rejects() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let dir = TempDir::new().unwrap();
        let inner = FileBuildLogger::create(dir.path().join("task-5.log")).unwrap();
        let mut logger = EventPublishingLogger::new(Box::new(inner), bus, 2, "ws", "proj");
        logger.close().unwrap();

        // Event goes out first, then the closed sink rejects the write
        assert!(logger.write_line("dropped").is_err());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.message.unwrap().text, "dropped");
    }
}
