use crate::error::BuilderError;
use crate::request::{BuildRequest, TaskType};
use std::fs;
use std::path::PathBuf;

/// Concrete working-directory layout for one task.
///
/// Immutable after creation and owned exclusively by the task it
/// configures. The build directory is a fresh unique directory under the
/// builder's `builds/` root; the work directory is a named project
/// subdirectory holding the staged sources.
#[derive(Debug, Clone)]
pub struct BuilderConfiguration {
    pub build_dir: PathBuf,
    pub work_dir: PathBuf,
    pub task_type: TaskType,
    pub request: BuildRequest,
}

impl BuilderConfiguration {
    /// The task's log file sits next to its build directory:
    /// `builds/<taskDir>.log`
    pub fn log_path(&self) -> PathBuf {
        self.build_dir.with_extension("log")
    }
}

/// Turns an accepted request into a `BuilderConfiguration`
pub struct ConfigurationFactory {
    builds_dir: PathBuf,
}

impl ConfigurationFactory {
    pub fn new(builds_dir: PathBuf) -> Self {
        Self { builds_dir }
    }

    pub fn create(&self, request: BuildRequest) -> Result<BuilderConfiguration, BuilderError> {
        request.validate().map_err(BuilderError::InvalidRequest)?;

        let build_dir = tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&self.builds_dir)
            .map_err(|source| BuilderError::Infrastructure {
                path: self.builds_dir.clone(),
                source,
            })?
            .into_path();

        let work_dir = build_dir.join(&request.project);
        fs::create_dir_all(&work_dir).map_err(|source| BuilderError::Infrastructure {
            path: work_dir.clone(),
            source,
        })?;

        Ok(BuilderConfiguration {
            build_dir,
            work_dir,
            task_type: request.task_type,
            request,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn request(project: &str) -> BuildRequest {
        BuildRequest {
            workspace: "ws1".to_string(),
            project: project.to_string(),
            source_url: "http://localhost/sources".to_string(),
            builder: "default".to_string(),
            timeout_secs: 0,
            targets: vec![],
            options: HashMap::new(),
            task_type: TaskType::Default,
        }
    }

    #[test]
    fn test_creates_unique_build_dirs() {
        let root = TempDir::new().unwrap();
        let factory = ConfigurationFactory::new(root.path().to_path_buf());

        let first = factory.create(request("app")).unwrap();
        let second = factory.create(request("app")).unwrap();

        assert_ne!(first.build_dir, second.build_dir);
        assert!(first.work_dir.is_dir());
        assert!(second.work_dir.is_dir());
        assert!(first.work_dir.ends_with("app"));
    }

    #[test]
    fn test_log_path_is_sibling_of_build_dir() {
        let root = TempDir::new().unwrap();
        let factory = ConfigurationFactory::new(root.path().to_path_buf());
        let configuration = factory.create(request("app")).unwrap();

        let log = configuration.log_path();
        assert_eq!(log.parent(), configuration.build_dir.parent());
        assert_eq!(log.extension().unwrap(), "log");
    }

    #[test]
    fn test_invalid_request_creates_nothing() {
        let root = TempDir::new().unwrap();
        let factory = ConfigurationFactory::new(root.path().to_path_buf());
        let err = factory.create(request("../escape")).unwrap_err();
        assert!(matches!(err, BuilderError::InvalidRequest(_)));
        assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_builds_root_is_infrastructure_error() {
        let factory = ConfigurationFactory::new(PathBuf::from("/nonexistent/builds"));
        let err = factory.create(request("app")).unwrap_err();
        assert!(matches!(err, BuilderError::Infrastructure { .. }));
    }
}
