//! Project configuration — `.pipeline.yaml` loading and path resolution.
//!
//! The config file lives in the project root. Relative paths are resolved
//! against their documented parent: the source and build directories
//! against the project directory, the hidden directories against the build
//! directory, and custom template entries against the project directory.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::BuildError;

pub const CONFIG_FILENAME: &str = ".pipeline.yaml";

/// Raw keys as they appear in `.pipeline.yaml`. Unknown keys are a
/// configuration error.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    project_directory: Option<String>,
    source_directory: Option<String>,
    build_directory: Option<String>,
    hidden_build_directory: Option<String>,
    hidden_task_directory: Option<String>,
    #[serde(default)]
    custom_templates: Vec<String>,
    #[serde(default)]
    globals: BTreeMap<String, serde_yaml::Value>,
    n_jobs: Option<usize>,
    priority_scheduling: Option<bool>,
    priority_discount_factor: Option<f64>,
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Default, Clone, Copy)]
pub struct Overrides {
    pub n_jobs: Option<usize>,
    pub priority: bool,
    pub debug: bool,
}

/// Fully resolved project configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: PathBuf,
    pub project_directory: PathBuf,
    pub source_directory: PathBuf,
    pub build_directory: PathBuf,
    pub hidden_build_directory: PathBuf,
    pub hidden_task_directory: PathBuf,
    pub custom_templates: Vec<PathBuf>,
    pub globals: BTreeMap<String, serde_yaml::Value>,
    pub n_jobs: usize,
    pub priority: bool,
    pub priority_discount_factor: f64,
    pub debug: bool,
}

impl Config {
    /// Load `.pipeline.yaml` from `dir` and resolve every path.
    pub fn load(dir: &Path, overrides: Overrides) -> Result<Self> {
        let config_file = dir.join(CONFIG_FILENAME);
        if !config_file.is_file() {
            return Err(BuildError::MissingConfig.into());
        }

        let contents = std::fs::read_to_string(&config_file)
            .with_context(|| format!("failed to read {}", config_file.display()))?;
        let raw: RawConfig = serde_yaml::from_str::<Option<RawConfig>>(&contents)
            .with_context(|| format!("failed to parse {}", config_file.display()))?
            .unwrap_or_default();

        let config_dir = dir.to_path_buf();
        let project_directory =
            resolve(&config_dir, raw.project_directory.as_deref().unwrap_or("."));
        let source_directory = resolve(
            &project_directory,
            raw.source_directory.as_deref().unwrap_or("src"),
        );
        let build_directory = resolve(
            &project_directory,
            raw.build_directory.as_deref().unwrap_or("bld"),
        );
        let hidden_build_directory = resolve(
            &build_directory,
            raw.hidden_build_directory.as_deref().unwrap_or(".pipeline"),
        );
        let hidden_task_directory = resolve(
            &build_directory,
            raw.hidden_task_directory.as_deref().unwrap_or(".tasks"),
        );

        let custom_templates = raw
            .custom_templates
            .iter()
            .map(|entry| resolve(&project_directory, entry))
            .collect();

        // Debug mode turns off parallelization so stack traces stay coherent.
        let n_jobs = if overrides.debug {
            1
        } else {
            overrides.n_jobs.or(raw.n_jobs).unwrap_or(1).max(1)
        };

        let priority = overrides.priority || raw.priority_scheduling.unwrap_or(false);

        Ok(Self {
            config_file,
            project_directory,
            source_directory,
            build_directory,
            hidden_build_directory,
            hidden_task_directory,
            custom_templates,
            globals: raw.globals,
            n_jobs,
            priority,
            priority_discount_factor: raw.priority_discount_factor.unwrap_or(0.0),
            debug: overrides.debug,
        })
    }

    /// The variables every template render sees: resolved paths, the
    /// scheduling knobs, and the user-supplied `globals` mapping.
    pub fn template_context(&self) -> BTreeMap<String, serde_yaml::Value> {
        let mut context = BTreeMap::new();
        for (key, path) in [
            ("project_directory", &self.project_directory),
            ("source_directory", &self.source_directory),
            ("build_directory", &self.build_directory),
            ("hidden_build_directory", &self.hidden_build_directory),
            ("hidden_task_directory", &self.hidden_task_directory),
        ] {
            context.insert(
                key.to_string(),
                serde_yaml::Value::String(path.display().to_string()),
            );
        }
        context.insert("n_jobs".to_string(), serde_yaml::Value::from(self.n_jobs as u64));
        context.insert(
            "priority_scheduling".to_string(),
            serde_yaml::Value::from(self.priority),
        );
        context.insert(
            "priority_discount_factor".to_string(),
            serde_yaml::Value::from(self.priority_discount_factor),
        );
        let globals = self
            .globals
            .iter()
            .map(|(key, value)| (serde_yaml::Value::String(key.clone()), value.clone()))
            .collect::<serde_yaml::Mapping>();
        context.insert("globals".to_string(), serde_yaml::Value::Mapping(globals));
        context
    }
}

/// Join `path` onto `parent` unless it is absolute, dropping `.` components
/// so resolved paths stay comparable.
fn resolve(parent: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    let mut resolved = if path.is_absolute() {
        PathBuf::new()
    } else {
        parent.to_path_buf()
    };
    for component in path.components() {
        match component {
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_config(dir: &Path, contents: &str) {
        fs::write(dir.join(CONFIG_FILENAME), contents).unwrap();
    }

    #[test]
    fn missing_config_file_has_exact_message() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Config::load(tmp.path(), Overrides::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot find '.pipeline.yaml' in current directory."
        );
    }

    #[test]
    fn empty_config_resolves_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "");

        let config = Config::load(tmp.path(), Overrides::default()).unwrap();
        assert_eq!(config.project_directory, tmp.path());
        assert_eq!(config.source_directory, tmp.path().join("src"));
        assert_eq!(config.build_directory, tmp.path().join("bld"));
        assert_eq!(
            config.hidden_build_directory,
            tmp.path().join("bld").join(".pipeline")
        );
        assert_eq!(
            config.hidden_task_directory,
            tmp.path().join("bld").join(".tasks")
        );
        assert_eq!(config.n_jobs, 1);
        assert!(!config.priority);
        assert_eq!(config.priority_discount_factor, 0.0);
        assert!(config.custom_templates.is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_documented_parents() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(
            tmp.path(),
            "source_directory: tasks\nbuild_directory: out\nhidden_build_directory: .cache\n",
        );

        let config = Config::load(tmp.path(), Overrides::default()).unwrap();
        assert_eq!(config.source_directory, tmp.path().join("tasks"));
        assert_eq!(config.build_directory, tmp.path().join("out"));
        assert_eq!(
            config.hidden_build_directory,
            tmp.path().join("out").join(".cache")
        );
    }

    #[test]
    fn absolute_paths_are_kept() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "build_directory: /tmp/elsewhere\n");

        let config = Config::load(tmp.path(), Overrides::default()).unwrap();
        assert_eq!(config.build_directory, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "not_a_real_key: 1\n");

        let err = Config::load(tmp.path(), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "n_jobs: 4\n");

        let config = Config::load(
            tmp.path(),
            Overrides {
                n_jobs: Some(2),
                ..Overrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.n_jobs, 2);
    }

    #[test]
    fn debug_forces_single_worker() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "n_jobs: 8\n");

        let config = Config::load(
            tmp.path(),
            Overrides {
                n_jobs: Some(8),
                debug: true,
                ..Overrides::default()
            },
        )
        .unwrap();
        assert!(config.debug);
        assert_eq!(config.n_jobs, 1);
    }

    #[test]
    fn priority_comes_from_flag_or_config() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "priority_scheduling: true\n");
        let config = Config::load(tmp.path(), Overrides::default()).unwrap();
        assert!(config.priority);

        write_config(tmp.path(), "");
        let config = Config::load(
            tmp.path(),
            Overrides {
                priority: true,
                ..Overrides::default()
            },
        )
        .unwrap();
        assert!(config.priority);
    }

    #[test]
    fn template_context_exposes_paths_and_globals() {
        let tmp = tempfile::tempdir().unwrap();
        write_config(tmp.path(), "globals:\n  alpha: 1\n");

        let config = Config::load(tmp.path(), Overrides::default()).unwrap();
        let context = config.template_context();
        assert_eq!(
            context.get("build_directory"),
            Some(&serde_yaml::Value::String(
                tmp.path().join("bld").display().to_string()
            ))
        );
        let globals = context.get("globals").unwrap();
        assert_eq!(
            globals.get("alpha"),
            Some(&serde_yaml::Value::from(1))
        );
    }
}
