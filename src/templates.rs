//! Template collection and rendering.
//!
//! Templates come from two places, custom entries winning over fallbacks:
//! - `custom_templates` config entries: a file is registered under its file
//!   name, a directory contributes every file it contains;
//! - any template name a task declares that is not registered is resolved
//!   as a path next to the declaring YAML file.
//!
//! Task scripts render with strict undefined behavior so a misspelled
//! variable fails the task instead of silently emitting nothing.
//! Declaration files render leniently: an unknown variable becomes empty,
//! which lets tasks be declared before every global exists.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, ErrorKind, UndefinedBehavior};

use crate::config::Config;
use crate::error::BuildError;
use crate::tasks::TaskRecord;

#[derive(Debug)]
pub struct TemplateEngine {
    env: Environment<'static>,
    origins: BTreeMap<String, PathBuf>,
}

impl TemplateEngine {
    /// Gather all templates the given tasks can reference.
    pub fn collect(config: &Config, tasks: &BTreeMap<String, TaskRecord>) -> Result<Self> {
        let mut sources: BTreeMap<String, (PathBuf, String)> = BTreeMap::new();

        for entry in &config.custom_templates {
            if entry.is_dir() {
                let mut files: Vec<PathBuf> = std::fs::read_dir(entry)
                    .with_context(|| format!("failed to read {}", entry.display()))?
                    .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                    .filter(|path| path.is_file())
                    .collect();
                files.sort();
                for file in files {
                    register(&mut sources, template_name(&file), &file)?;
                }
            } else if entry.is_file() {
                register(&mut sources, template_name(entry), entry)?;
            } else {
                bail!(
                    "custom template path '{}' cannot be resolved",
                    entry.display()
                );
            }
        }

        // A template name nothing registered resolves next to the YAML file
        // that declared the task.
        for task in tasks.values() {
            if sources.contains_key(&task.template) {
                continue;
            }
            let candidate = task
                .config_path
                .parent()
                .map(|dir| dir.join(&task.template))
                .unwrap_or_else(|| PathBuf::from(&task.template));
            if candidate.is_file() {
                register(&mut sources, task.template.clone(), &candidate)?;
            } else {
                return Err(BuildError::UnknownTemplate {
                    task: task.id.clone(),
                    template: task.template.clone(),
                }
                .into());
            }
        }

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        let mut origins = BTreeMap::new();
        for (name, (path, text)) in sources {
            env.add_template_owned(name.clone(), text)
                .with_context(|| format!("failed to compile template {}", path.display()))?;
            origins.insert(name, path);
        }

        Ok(Self { env, origins })
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.origins.contains_key(name)
    }

    pub fn template_names(&self) -> impl Iterator<Item = &str> {
        self.origins.keys().map(String::as_str)
    }

    /// Render the task's script from the merged context: config variables
    /// first, then the task's own fields and parameters on top.
    pub fn render_task(&self, task: &TaskRecord, config: &Config) -> Result<String> {
        let context = task_context(task, config);
        let template = self
            .env
            .get_template(&task.template)
            .with_context(|| format!("template '{}' is not registered", task.template))?;
        template.render(&context).map_err(|err| {
            if err.kind() == ErrorKind::UndefinedError {
                BuildError::Render {
                    task: task.id.clone(),
                    detail: err.to_string(),
                }
                .into()
            } else {
                anyhow::Error::new(err)
                    .context(format!("failed to render template for task '{}'", task.id))
            }
        })
    }
}

/// Render a task declaration file with the project config as context.
pub fn render_declaration(contents: &str, config: &Config) -> Result<String> {
    let env = Environment::new();
    env.render_str(contents, config.template_context())
        .context("failed to render task declaration")
}

fn task_context(task: &TaskRecord, config: &Config) -> BTreeMap<String, serde_yaml::Value> {
    let mut context = config.template_context();
    context.insert(
        "id".to_string(),
        serde_yaml::Value::String(task.id.clone()),
    );
    context.insert(
        "template".to_string(),
        serde_yaml::Value::String(task.template.clone()),
    );
    context.insert(
        "produces".to_string(),
        serde_yaml::Value::String(task.produces.first().cloned().unwrap_or_default()),
    );
    context.insert(
        "targets".to_string(),
        serde_yaml::Value::Sequence(
            task.produces
                .iter()
                .map(|target| serde_yaml::Value::String(target.clone()))
                .collect(),
        ),
    );
    context.insert(
        "depends_on".to_string(),
        serde_yaml::Value::Sequence(
            task.depends_on
                .iter()
                .map(|dep| serde_yaml::Value::String(dep.clone()))
                .collect(),
        ),
    );
    context.insert(
        "run_always".to_string(),
        serde_yaml::Value::from(task.run_always),
    );
    context.insert(
        "priority".to_string(),
        serde_yaml::Value::from(task.priority),
    );
    for (key, value) in &task.parameters {
        context.insert(key.clone(), value.clone());
    }
    context
}

fn template_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn register(
    sources: &mut BTreeMap<String, (PathBuf, String)>,
    name: String,
    path: &std::path::Path,
) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read template {}", path.display()))?;
    sources.entry(name).or_insert((path.to_path_buf(), text));
    Ok(())
}
