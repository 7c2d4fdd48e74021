//! Build command — the main orchestration pipeline.
//!
//! `pipeline build` loads the task declarations, collects their templates,
//! constructs the dependency graph, decides which tasks are unfinished by
//! comparing content hashes against the persistent store, and hands the
//! unfinished set to the executor. The hash store is owned here and
//! threaded into every component that needs it.

use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::dag::Graph;
use crate::executor;
use crate::hashing::Hasher;
use crate::staleness;
use crate::store::HashStore;
use crate::tasks;
use crate::templates::TemplateEngine;

#[derive(Debug)]
pub struct BuildReport {
    pub task_count: usize,
    pub unfinished_count: usize,
    pub executed: usize,
}

pub fn build_project(config: &Config) -> Result<BuildReport> {
    // 1. Load declarations and the templates they reference.
    let records = tasks::load_tasks(config)?;
    let task_count = records.len();
    let engine = TemplateEngine::collect(config, &records)?;

    // 2. Build the graph and, when requested, propagate priorities.
    let mut graph = Graph::from_tasks(records)?;
    if config.priority {
        graph.assign_priorities(config.priority_discount_factor)?;
    }

    // 3. Decide what is unfinished.
    let mut store = HashStore::load(&config.hidden_build_directory)?;
    let mut hasher = Hasher::default();
    let unfinished =
        staleness::collect_unfinished(&graph, &engine, config, &mut store, &mut hasher)?;
    info!(
        total = task_count,
        unfinished = unfinished.len(),
        "collected unfinished tasks"
    );

    // 4. Execute and persist.
    let executed = executor::execute(
        &graph,
        &engine,
        config,
        &mut store,
        &mut hasher,
        &unfinished,
    )?;
    store.flush()?;

    Ok(BuildReport {
        task_count,
        unfinished_count: unfinished.len(),
        executed,
    })
}
