use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What kind of work the external process performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    #[default]
    Default,
    ListDeps,
    CopyDeps,
}

/// Inbound build request, immutable once accepted.
///
/// `timeout_secs <= 0` requests unbounded execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub workspace: String,
    pub project: String,
    pub source_url: String,
    pub builder: String,
    #[serde(default)]
    pub timeout_secs: i64,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub task_type: TaskType,
}

impl BuildRequest {
    /// Rejects requests whose identifiers cannot become directory names
    pub fn validate(&self) -> Result<(), String> {
        for (label, value) in [("workspace", &self.workspace), ("project", &self.project)] {
            if value.is_empty() {
                return Err(format!("{} must not be empty", label));
            }
            if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
                return Err(format!("{} `{}` is not a valid directory name", label, value));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(workspace: &str, project: &str) -> BuildRequest {
        BuildRequest {
            workspace: workspace.to_string(),
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
    fn test_plain_names_are_valid() {
        assert!(request("ws1", "demo-project").validate().is_ok());
    }

    #[test]
    fn test_path_like_names_are_rejected() {
        assert!(request("ws1", "../escape").validate().is_err());
        assert!(request("a/b", "proj").validate().is_err());
        assert!(request("ws1", "").validate().is_err());
    }

    #[test]
    fn test_task_type_wire_names() {
        let json = serde_json::to_string(&TaskType::ListDeps).unwrap();
        assert_eq!(json, "\"LIST_DEPS\"");
    }

    #[test]
    fn test_request_defaults_on_deserialize() {
        let json = r#"{
            "workspace": "ws1",
            "project": "app",
            "source_url": "http://host/sources",
            "builder": "maven"
        }"#;
        let request: BuildRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.timeout_secs, 0);
        assert_eq!(request.task_type, TaskType::Default);
        assert!(request.targets.is_empty());
    }
}
