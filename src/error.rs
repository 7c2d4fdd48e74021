//! Error kinds surfaced by the build.
//!
//! Most plumbing errors travel as `anyhow::Error` with context attached at
//! the call site. The variants below are the failures callers need to tell
//! apart: they carry the task id (and script path where one exists) so the
//! final report can name the offender.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Cannot find '.pipeline.yaml' in current directory.")]
    MissingConfig,

    #[error("there are duplicated task ids: {}", ids.join(", "))]
    DuplicatedTask { ids: Vec<String> },

    #[error("template '{template}' of task '{task}' was not found")]
    UnknownTemplate { task: String, template: String },

    #[error("dependency cycle detected: {}", nodes.join(" -> "))]
    Cycle { nodes: Vec<String> },

    #[error("tasks '{first}' and '{second}' both produce '{target}'")]
    ConflictingProducers {
        first: String,
        second: String,
        target: String,
    },

    #[error("task '{task}' has an undefined variable: {detail}")]
    Render { task: String, detail: String },

    #[error("task '{task}' in file '{}' failed with exit status {status}", script.display())]
    Exec {
        task: String,
        script: PathBuf,
        status: i32,
    },

    #[error("target(s) {} were not produced by task '{task}'", targets.join(", "))]
    MissingTarget { task: String, targets: Vec<String> },

    #[error("dependency '{dependency}' of task '{task}' cannot be found")]
    MissingDependency { task: String, dependency: String },

    #[error(
        "task '{task}' needs an R interpreter, but 'Rscript' was not found on PATH"
    )]
    RNotAvailable { task: String },

    #[error("only Python and R templates are supported, got '{template}' for task '{task}'")]
    UnsupportedTemplate { task: String, template: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_message_is_exact() {
        assert_eq!(
            BuildError::MissingConfig.to_string(),
            "Cannot find '.pipeline.yaml' in current directory."
        );
    }

    #[test]
    fn exec_error_names_task_and_script() {
        let err = BuildError::Exec {
            task: "task-1".to_string(),
            script: PathBuf::from("/bld/.tasks/task-1.py"),
            status: 2,
        };
        let rendered = err.to_string();
        assert!(rendered.contains("task-1"));
        assert!(rendered.contains("/bld/.tasks/task-1.py"));
        assert!(rendered.contains("exit status 2"));
    }

    #[test]
    fn duplicated_task_lists_ids() {
        let err = BuildError::DuplicatedTask {
            ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(err.to_string(), "there are duplicated task ids: a, b");
    }
}
