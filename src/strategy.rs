use crate::config::BuilderConfiguration;
use crate::request::TaskType;
use crate::task::{BuildResult, FutureBuildTask, TaskStatus};
use anyhow::{bail, Result};
use std::path::PathBuf;
use walkdir::WalkDir;

/// Computes the external-process command line for a configuration.
///
/// Injected into the engine at construction; build-tool-specific
/// command construction lives behind this seam.
pub trait CommandLineBuilder: Send + Sync {
    fn command_line(&self, configuration: &BuilderConfiguration) -> Result<Vec<String>>;
}

/// Turns a finished task into its `BuildResult`.
///
/// Invoked at most once per task; the engine memoizes the value.
pub trait ResultExtractor: Send + Sync {
    fn extract(&self, task: &FutureBuildTask) -> Result<BuildResult>;
}

/// Default strategy: run the request's command through a shell in the
/// task's work directory.
///
/// The command comes from the `command` option, with task-kind specific
/// overrides (`list-deps-command`, `copy-deps-command`); without one the
/// targets are chained with `&&`.
pub struct ShellCommandLine;

impl CommandLineBuilder for ShellCommandLine {
    fn command_line(&self, configuration: &BuilderConfiguration) -> Result<Vec<String>> {
        let request = &configuration.request;
        let override_key = match configuration.task_type {
            TaskType::Default => None,
            TaskType::ListDeps => Some("list-deps-command"),
            TaskType::CopyDeps => Some("copy-deps-command"),
        };

        let script = override_key
            .and_then(|key| request.options.get(key))
            .or_else(|| request.options.get("command"))
            .cloned()
            .or_else(|| {
                if request.targets.is_empty() {
                    None
                } else {
                    Some(request.targets.join(" && "))
                }
            });

        let Some(script) = script else {
            bail!("build request carries neither a command option nor targets");
        };

        Ok(vec!["sh".to_string(), "-c".to_string(), script])
    }
}

/// Default extractor: success mirrors the terminal status; result files
/// are whatever the build left in the work directory, the report is a
/// well-known file next to them.
pub struct WorkDirResultExtractor {
    report_name: String,
}

impl WorkDirResultExtractor {
    pub fn new(report_name: &str) -> Self {
        Self {
            report_name: report_name.to_string(),
        }
    }
}

impl Default for WorkDirResultExtractor {
    fn default() -> Self {
        Self::new("build-report")
    }
}

impl ResultExtractor for WorkDirResultExtractor {
    fn extract(&self, task: &FutureBuildTask) -> Result<BuildResult> {
        let work_dir = &task.configuration().work_dir;
        let report_path = work_dir.join(&self.report_name);

        let mut result_files: Vec<PathBuf> = WalkDir::new(work_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.path().to_path_buf())
            .filter(|path| *path != report_path)
            .collect();
        result_files.sort();

        let report = report_path.exists().then_some(report_path);

        Ok(BuildResult {
            successful: task.status() == TaskStatus::Successful,
            result_files,
            report,
            message: task.failure(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BuildRequest;
    use std::collections::HashMap;
    use std::path::Path;

    fn configuration(
        options: HashMap<String, String>,
        targets: Vec<String>,
        task_type: TaskType,
    ) -> BuilderConfiguration {
        BuilderConfiguration {
            build_dir: Path::new("/tmp/task-x").to_path_buf(),
            work_dir: Path::new("/tmp/task-x/app").to_path_buf(),
            task_type,
            request: BuildRequest {
                workspace: "ws1".to_string(),
                project: "app".to_string(),
                source_url: "http://localhost/sources".to_string(),
                builder: "default".to_string(),
                timeout_secs: 0,
                targets,
                options,
                task_type,
            },
        }
    }

    #[test]
    fn test_command_option_becomes_shell_invocation() {
        let mut options = HashMap::new();
        options.insert("command".to_string(), "make all".to_string());

        let line = ShellCommandLine
            .command_line(&configuration(options, vec![], TaskType::Default))
            .unwrap();
        assert_eq!(line, vec!["sh", "-c", "make all"]);
    }

    #[test]
    fn test_targets_are_chained_without_command_option() {
        let line = ShellCommandLine
            .command_line(&configuration(
                HashMap::new(),
                vec!["clean".to_string(), "install".to_string()],
                TaskType::Default,
            ))
            .unwrap();
        assert_eq!(line, vec!["sh", "-c", "clean && install"]);
    }

    #[test]
    fn test_task_kind_override_wins() {
        let mut options = HashMap::new();
        options.insert("command".to_string(), "make all".to_string());
        options.insert("list-deps-command".to_string(), "make deps".to_string());

        let line = ShellCommandLine
            .command_line(&configuration(options, vec![], TaskType::ListDeps))
            .unwrap();
        assert_eq!(line, vec!["sh", "-c", "make deps"]);
    }

    #[test]
    fn test_empty_request_is_rejected() {
        let err = ShellCommandLine
            .command_line(&configuration(HashMap::new(), vec![], TaskType::Default))
            .unwrap_err();
        assert!(err.to_string().contains("neither"));
    }
}
