//! Task declarations — discovery, parsing, defaults, rewriting.
//!
//! Every `*.yaml` under the source directory is rendered with the project
//! config as context (so declarations may embed `{{ build_directory }}`),
//! then parsed as a mapping of task id to record. Ids must be unique across
//! the whole project. After parsing, a missing `produces` defaults to one
//! path under the hidden build directory, and any dependency naming another
//! task id is rewritten to that task's first output.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::Config;
use crate::error::BuildError;
use crate::templates;

/// An immutable task declaration after loading.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRecord {
    pub id: String,
    pub template: String,
    pub depends_on: Vec<String>,
    pub produces: Vec<String>,
    pub config_path: PathBuf,
    pub run_always: bool,
    pub priority: f64,
    pub parameters: BTreeMap<String, serde_yaml::Value>,
}

/// Raw record fields as declared in YAML. Unrecognized keys are collected
/// as free-form parameters for the renderer.
#[derive(Debug, Deserialize)]
struct RawTask {
    template: String,
    #[serde(default)]
    depends_on: Option<OneOrMany>,
    #[serde(default)]
    produces: Option<OneOrMany>,
    #[serde(default)]
    priority: Option<f64>,
    #[serde(default)]
    run_always: bool,
    #[serde(flatten)]
    parameters: BTreeMap<String, serde_yaml::Value>,
}

/// A YAML field that may be a single string or a sequence of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Load every task declared under the source directory.
pub fn load_tasks(config: &Config) -> Result<BTreeMap<String, TaskRecord>> {
    let pattern = config.source_directory.join("**").join("*.yaml");
    let pattern = pattern.to_string_lossy();
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .with_context(|| format!("invalid glob pattern {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    let mut tasks: BTreeMap<String, TaskRecord> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for path in files {
        for record in load_declaration_file(&path, config)? {
            if tasks.contains_key(&record.id) {
                duplicates.push(record.id.clone());
            } else {
                tasks.insert(record.id.clone(), record);
            }
        }
    }
    if !duplicates.is_empty() {
        duplicates.sort();
        return Err(BuildError::DuplicatedTask { ids: duplicates }.into());
    }

    fill_default_outputs(&mut tasks, config);
    rewrite_task_dependencies(&mut tasks);

    Ok(tasks)
}

/// Parse one declaration file into task records.
fn load_declaration_file(path: &Path, config: &Config) -> Result<Vec<TaskRecord>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    let rendered = templates::render_declaration(&contents, config)
        .with_context(|| format!("failed to render task file {}", path.display()))?;

    // serde_yaml rejects duplicate mapping keys, which covers duplicated
    // ids inside a single file.
    let mapping = serde_yaml::from_str::<Option<serde_yaml::Mapping>>(&rendered)
        .with_context(|| format!("failed to parse task file {}", path.display()))?
        .unwrap_or_default();

    let mut records = Vec::new();
    for (key, value) in mapping {
        let id = match key {
            serde_yaml::Value::String(id) => id,
            other => anyhow::bail!(
                "task id in {} must be a string, got {:?}",
                path.display(),
                other
            ),
        };
        let raw: RawTask = serde_yaml::from_value(value)
            .with_context(|| format!("invalid declaration for task '{id}' in {}", path.display()))?;
        records.push(TaskRecord {
            id,
            template: raw.template,
            depends_on: raw.depends_on.map(OneOrMany::into_vec).unwrap_or_default(),
            produces: raw.produces.map(OneOrMany::into_vec).unwrap_or_default(),
            config_path: path.to_path_buf(),
            run_always: raw.run_always,
            priority: raw.priority.unwrap_or(0.0),
            parameters: raw.parameters,
        });
    }
    Ok(records)
}

fn fill_default_outputs(tasks: &mut BTreeMap<String, TaskRecord>, config: &Config) {
    for task in tasks.values_mut() {
        if task.produces.is_empty() {
            task.produces = vec![
                config
                    .hidden_build_directory
                    .join(&task.id)
                    .display()
                    .to_string(),
            ];
        }
    }
}

/// Users may reference upstream tasks by id; the workflow is formed over
/// artifacts, so such entries become the upstream task's first output.
fn rewrite_task_dependencies(tasks: &mut BTreeMap<String, TaskRecord>) {
    let outputs: BTreeMap<String, String> = tasks
        .iter()
        .filter_map(|(id, task)| {
            task.produces
                .first()
                .map(|target| (id.clone(), target.clone()))
        })
        .collect();

    for task in tasks.values_mut() {
        for dep in &mut task.depends_on {
            if let Some(target) = outputs.get(dep) {
                *dep = target.clone();
            }
        }
    }
}
