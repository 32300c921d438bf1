/// Registry and cross-builder cleaner tests
#[cfg(test)]
mod registry_tests {
    use buildforge::builder::{Builder, BuilderSettings};
    use buildforge::error::BuilderError;
    use buildforge::registry::{BuilderCleaner, BuilderRegistry};
    use buildforge::request::{BuildRequest, TaskType};
    use buildforge::sources::{SourceClient, SourceUpdate, StagingError};
    use buildforge::strategy::{ShellCommandLine, WorkDirResultExtractor};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NoSourcesClient;

    #[async_trait::async_trait]
    impl SourceClient for NoSourcesClient {
        async fn fetch(&self, _url: &str, _manifest: &str) -> Result<SourceUpdate, StagingError> {
            Ok(SourceUpdate::Unchanged)
        }
    }

    fn make_builder(name: &str, root: &TempDir, keep_result: Duration) -> Arc<Builder> {
        let settings = BuilderSettings {
            workers: 2,
            queue_size: 4,
            keep_result_time: keep_result,
            // Only the cleaner reclaims in these tests
            task_sweep_interval: Duration::from_secs(3600),
            ..BuilderSettings::default()
        };
        Builder::new(
            name,
            root.path(),
            settings,
            Arc::new(ShellCommandLine),
            Arc::new(WorkDirResultExtractor::default()),
            Arc::new(NoSourcesClient),
        )
    }

    fn shell_request(command: &str) -> BuildRequest {
        let mut options = HashMap::new();
        options.insert("command".to_string(), command.to_string());
        BuildRequest {
            workspace: "ws1".to_string(),
            project: "app".to_string(),
            source_url: "http://localhost/unused".to_string(),
            builder: "default".to_string(),
            timeout_secs: 0,
            targets: vec![],
            options,
            task_type: TaskType::Default,
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_removal() {
        let root = TempDir::new().unwrap();
        let registry = BuilderRegistry::new();

        let builder = make_builder("alpha", &root, Duration::from_secs(60));
        registry.add(builder.clone());

        assert_eq!(registry.get("alpha").unwrap().name(), "alpha");
        assert!(matches!(
            registry.get("beta"),
            Err(BuilderError::UnknownBuilder(_))
        ));
        assert_eq!(registry.all().len(), 1);

        assert!(registry.remove("alpha").is_some());
        assert!(registry.get("alpha").is_err());
        assert!(registry.all().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cleaner_reclaims_expired_tasks_across_builders() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(BuilderRegistry::new());

        let builder = make_builder("swept", &root, Duration::from_secs(1));
        builder.start().unwrap();
        registry.add(builder.clone());

        let cleaner = BuilderCleaner::new(registry.clone(), Duration::from_millis(500));
        cleaner.start();

        let task = builder.perform(shell_request("true")).unwrap();
        let id = task.id();
        task.result().await.unwrap();
        assert!(builder.build_task(id).is_ok());

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while builder.build_task(id).is_ok() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert!(matches!(
            builder.build_task(id),
            Err(BuilderError::TaskNotFound(_))
        ));

        cleaner.stop();
        builder.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_force_deletes_repository_trees() {
        let root = TempDir::new().unwrap();
        let registry = Arc::new(BuilderRegistry::new());

        let builder = make_builder("doomed", &root, Duration::from_secs(60));
        builder.start().unwrap();
        registry.add(builder.clone());

        let task = builder.perform(shell_request("true")).unwrap();
        task.result().await.unwrap();

        let repository = builder.repository_dir().to_path_buf();
        assert!(repository.exists());

        let cleaner = BuilderCleaner::new(registry.clone(), Duration::from_secs(3600));
        cleaner.start();
        cleaner.shutdown().await;

        assert!(!repository.exists(), "repository tree survived shutdown");
        assert!(registry.all().is_empty());
    }
}
