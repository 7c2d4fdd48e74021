mod build;
mod cli;
mod config;
mod dag;
mod error;
mod executor;
mod hashing;
mod scheduler;
mod staleness;
mod store;
mod tasks;
mod templates;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cli::{Cli, Command};
use config::{Config, Overrides};
use templates::TemplateEngine;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "pipeline=info",
        1 => "pipeline=debug",
        _ => "pipeline=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir()?;

    match cli.command {
        Command::Collect {
            configuration,
            tasks: show_tasks,
            templates: show_templates,
        } => {
            let config = Config::load(&cwd, Overrides::default())?;
            if configuration {
                println!("{config:#?}");
            }
            if show_tasks {
                for (id, record) in tasks::load_tasks(&config)? {
                    println!("{id}: {record:?}");
                }
            }
            if show_templates {
                let records = tasks::load_tasks(&config)?;
                let engine = TemplateEngine::collect(&config, &records)?;
                for name in engine.template_names() {
                    println!("{name}");
                }
            }
        }
        Command::Build {
            n_jobs,
            priority,
            debug,
        } => {
            let config = Config::load(
                &cwd,
                Overrides {
                    n_jobs,
                    priority,
                    debug,
                },
            )?;
            println!("### Build Project");
            let report = build::build_project(&config)?;
            println!(
                "### Finished ({} of {} tasks executed, {} stale)",
                report.executed, report.task_count, report.unfinished_count
            );
        }
        Command::Clean => {
            let config = Config::load(&cwd, Overrides::default())?;
            match std::fs::remove_dir_all(&config.build_directory) {
                Ok(()) => info!(
                    directory = %config.build_directory.display(),
                    "removed build directory"
                ),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("failed to remove {}", config.build_directory.display())
                    });
                }
            }
        }
    }

    Ok(())
}
