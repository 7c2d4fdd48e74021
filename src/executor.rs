//! Task execution — render, write, spawn, verify.
//!
//! Both modes share one per-task sequence: render the template, persist
//! the dependency hashes, write the script into the hidden task directory,
//! spawn the interpreter, verify the declared targets, persist their
//! hashes, flush the store. Serial mode runs everything in the coordinator
//! thread. Parallel mode keeps a fixed pool of worker threads fed over
//! channels; the coordinator alone touches the graph, the scheduler, and
//! the hash store. On the first failure no further tasks are proposed,
//! in-flight workers drain, and all collected errors surface together.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::config::Config;
use crate::dag::Graph;
use crate::error::BuildError;
use crate::hashing::{self, Hasher};
use crate::scheduler::Scheduler;
use crate::store::HashStore;
use crate::templates::TemplateEngine;

const PYTHON_PROGRAM: &str = "python3";
const R_PROGRAM: &str = "Rscript";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Interpreter chosen from the template suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interpreter {
    Python,
    R,
}

impl Interpreter {
    fn from_template(task: &str, template: &str) -> Result<Self> {
        if template.ends_with(".py") {
            Ok(Self::Python)
        } else if template.ends_with(".r") {
            Ok(Self::R)
        } else {
            Err(BuildError::UnsupportedTemplate {
                task: task.to_string(),
                template: template.to_string(),
            }
            .into())
        }
    }

    fn extension(self) -> &'static str {
        match self {
            Self::Python => "py",
            Self::R => "r",
        }
    }
}

/// A task rendered and written to disk, ready to spawn in any thread.
#[derive(Debug)]
struct PreparedTask {
    id: String,
    script: PathBuf,
    interpreter: Interpreter,
    project_directory: PathBuf,
}

/// Execute the unfinished tasks, serially for one worker and through the
/// pool otherwise. Returns the number of completed tasks.
pub fn execute(
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
    unfinished: &BTreeSet<String>,
) -> Result<usize> {
    if config.n_jobs <= 1 {
        execute_serially(graph, engine, config, store, hasher, unfinished)
    } else {
        execute_parallelly(graph, engine, config, store, hasher, unfinished)
    }
}

fn execute_serially(
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
    unfinished: &BTreeSet<String>,
) -> Result<usize> {
    let mut scheduler = Scheduler::new(graph, unfinished, config.priority);
    let mut executed = 0;

    while scheduler.has_work() {
        let Some(id) = scheduler.propose(Some(1)).into_iter().next() else {
            bail!("no task is ready although unfinished tasks remain");
        };
        info!(task = %id, "executing task");

        let prepared = prepare_task(&id, graph, engine, config, store, hasher)?;
        store.flush()?;
        run_task(&prepared, config.debug)?;
        finish_task(&id, graph, store, hasher)?;

        scheduler.complete(&[id]);
        executed += 1;
    }

    Ok(executed)
}

fn execute_parallelly(
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
    unfinished: &BTreeSet<String>,
) -> Result<usize> {
    let mut scheduler = Scheduler::new(graph, unfinished, config.priority);
    let pool = WorkerPool::new(config.n_jobs)?;
    let mut failures: Vec<anyhow::Error> = Vec::new();
    let mut active = 0usize;
    let mut executed = 0usize;

    loop {
        if failures.is_empty() {
            if !scheduler.has_work() {
                break;
            }
        } else if active == 0 {
            // Draining is done; surface everything collected below.
            break;
        }

        let mut progressed = false;

        if failures.is_empty() {
            // With priority scheduling only the free slots are proposed so
            // a higher-priority task never queues behind a lower one;
            // otherwise any ready task is fair game and the pool throttles.
            let slots = config.n_jobs.saturating_sub(scheduler.in_flight_count());
            let limit = config.priority.then_some(slots);
            if limit != Some(0) {
                for id in scheduler.propose(limit) {
                    if !failures.is_empty() {
                        break;
                    }
                    match prepare_task(&id, graph, engine, config, store, hasher) {
                        Ok(prepared) => {
                            debug!(task = %id, "submitting task to pool");
                            pool.submit(prepared)?;
                            active += 1;
                            progressed = true;
                        }
                        Err(error) => failures.push(error),
                    }
                }
                store.flush()?;
            }
        }

        let mut finished = Vec::new();
        for event in pool.drain() {
            active -= 1;
            progressed = true;
            match event.result {
                Ok(()) => match finish_task(&event.id, graph, store, hasher) {
                    Ok(()) => {
                        executed += 1;
                        finished.push(event.id);
                    }
                    Err(error) => failures.push(error),
                },
                Err(error) => failures.push(error),
            }
        }
        scheduler.complete(&finished);

        if !progressed {
            thread::sleep(POLL_INTERVAL);
        }
    }

    pool.shutdown();

    if failures.is_empty() {
        Ok(executed)
    } else {
        let combined = failures
            .iter()
            .map(|error| format!("{error:#}"))
            .collect::<Vec<_>>()
            .join("\n\n");
        bail!("{combined}")
    }
}

/// Render the task, persist its dependency hashes, and write the script
/// and target parent directories.
fn prepare_task(
    id: &str,
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
) -> Result<PreparedTask> {
    let node = graph
        .task(id)
        .with_context(|| format!("task '{id}' missing from graph"))?;
    let record = &node.record;
    let interpreter = Interpreter::from_template(id, &record.template)?;

    let rendered = engine.render_task(record, config)?;
    save_dependency_hashes(id, &rendered, graph, engine, store, hasher)?;

    let script = config
        .hidden_task_directory
        .join(format!("{id}.{}", interpreter.extension()));
    if let Some(parent) = script.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&script, &rendered)
        .with_context(|| format!("failed to write {}", script.display()))?;

    for target in &record.produces {
        if let Some(parent) = Path::new(target).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    Ok(PreparedTask {
        id: id.to_string(),
        script,
        interpreter,
        project_directory: config.project_directory.clone(),
    })
}

/// Record the current digest of every dependency under `(task, dep_key)`.
/// A dependency that is a template digests as the rendered script.
fn save_dependency_hashes(
    id: &str,
    rendered: &str,
    graph: &Graph,
    engine: &TemplateEngine,
    store: &mut HashStore,
    hasher: &mut Hasher,
) -> Result<()> {
    for dep in graph.predecessors(id) {
        if engine.has_template(dep) {
            store.put(id, dep, hashing::hash_string(rendered));
            continue;
        }
        let path = Path::new(dep);
        if !path.exists() {
            return Err(BuildError::MissingDependency {
                task: id.to_string(),
                dependency: dep.to_string(),
            }
            .into());
        }
        for (key, digest) in hasher.hash_artifact(dep, path)? {
            store.put(id, &key, digest);
        }
    }
    Ok(())
}

/// Spawn the interpreter and wait. Stdout and stderr are inherited.
fn run_task(task: &PreparedTask, debug: bool) -> Result<()> {
    match task.interpreter {
        Interpreter::Python => {
            let status = interpreter_command(PYTHON_PROGRAM, task)
                .arg(&task.script)
                .status()
                .with_context(|| format!("failed to spawn {PYTHON_PROGRAM}"))?;
            if status.success() {
                return Ok(());
            }
            let error = BuildError::Exec {
                task: task.id.clone(),
                script: task.script.clone(),
                status: status.code().unwrap_or(-1),
            };
            if debug {
                eprintln!("{error}");
                eprintln!("Rerunning the task under the debugger.");
                let _ = interpreter_command(PYTHON_PROGRAM, task)
                    .args(["-m", "pdb", "-c", "continue"])
                    .arg(&task.script)
                    .status();
                bail!("aborted build after debugger session for task '{}'", task.id);
            }
            Err(error.into())
        }
        Interpreter::R => {
            let status = interpreter_command(R_PROGRAM, task)
                .arg(&task.script)
                .status();
            match status {
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    Err(BuildError::RNotAvailable {
                        task: task.id.clone(),
                    }
                    .into())
                }
                Err(error) => {
                    Err(error).with_context(|| format!("failed to spawn {R_PROGRAM}"))
                }
                Ok(status) if !status.success() => Err(BuildError::Exec {
                    task: task.id.clone(),
                    script: task.script.clone(),
                    status: status.code().unwrap_or(-1),
                }
                .into()),
                Ok(_) => Ok(()),
            }
        }
    }
}

fn interpreter_command(program: &str, task: &PreparedTask) -> Command {
    let mut command = Command::new(program);
    command.env(
        "PYTHONPATH",
        module_search_path(&task.project_directory, std::env::var_os("PYTHONPATH")),
    );
    command
}

/// Prepend the project directory to the module search path so task scripts
/// can import project code.
fn module_search_path(project_directory: &Path, existing: Option<OsString>) -> OsString {
    let separator = if cfg!(windows) { ";" } else { ":" };
    let mut value = OsString::from(project_directory);
    if let Some(existing) = existing
        && !existing.is_empty()
    {
        value.push(separator);
        value.push(existing);
    }
    value
}

/// Verify the declared targets exist and persist their hashes.
fn finish_task(
    id: &str,
    graph: &Graph,
    store: &mut HashStore,
    hasher: &mut Hasher,
) -> Result<()> {
    let node = graph
        .task(id)
        .with_context(|| format!("task '{id}' missing from graph"))?;

    let missing: Vec<String> = node
        .record
        .produces
        .iter()
        .filter(|target| !Path::new(target).exists())
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(BuildError::MissingTarget {
            task: id.to_string(),
            targets: missing,
        }
        .into());
    }

    for target in &node.record.produces {
        for (key, digest) in hasher.hash_artifact(target, Path::new(target))? {
            store.put(id, &key, digest);
        }
    }
    store.flush()?;
    Ok(())
}

struct CompletionEvent {
    id: String,
    result: Result<()>,
}

/// Fixed-size pool of worker threads. Jobs go out over one channel,
/// completion events come back over another; workers exit when the job
/// channel closes.
struct WorkerPool {
    job_tx: Option<mpsc::Sender<PreparedTask>>,
    event_rx: mpsc::Receiver<CompletionEvent>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(size: usize) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<PreparedTask>();
        let (event_tx, event_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let job_rx = Arc::clone(&job_rx);
            let event_tx = event_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("pipeline-worker-{index}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let Ok(receiver) = job_rx.lock() else { break };
                            receiver.recv()
                        };
                        let Ok(job) = job else { break };
                        let result = run_task(&job, false);
                        if event_tx
                            .send(CompletionEvent { id: job.id, result })
                            .is_err()
                        {
                            break;
                        }
                    }
                })
                .context("failed to spawn worker thread")?;
            workers.push(handle);
        }

        Ok(Self {
            job_tx: Some(job_tx),
            event_rx,
            workers,
        })
    }

    fn submit(&self, task: PreparedTask) -> Result<()> {
        self.job_tx
            .as_ref()
            .context("worker pool is shut down")?
            .send(task)
            .context("worker pool hung up")
    }

    fn drain(&self) -> Vec<CompletionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn shutdown(mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}
