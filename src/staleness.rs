//! Staleness analysis — which tasks must run this build.
//!
//! Walks the graph in topological order and compares the digest of every
//! task neighbor (dependencies and targets alike) against the hash store.
//! A template neighbor is digested by rendering the task's template with
//! its parameters — two tasks sharing a template but with different
//! parameters invalidate independently. A mismatch or missing neighbor
//! marks the task unfinished, and unfinished-ness propagates to every
//! downstream task.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Result;

use crate::config::Config;
use crate::dag::Graph;
use crate::hashing::{self, Hasher};
use crate::store::HashStore;
use crate::templates::TemplateEngine;

/// Compute the set of unfinished task ids, updating the store with every
/// freshly observed digest.
pub fn collect_unfinished(
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
) -> Result<BTreeSet<String>> {
    let mut unfinished: BTreeSet<String> = BTreeSet::new();

    for id in graph.topological_sort()? {
        if !graph.is_task(&id) || unfinished.contains(&id) {
            continue;
        }
        let Some(node) = graph.task(&id) else { continue };

        let stale = if node.record.run_always {
            true
        } else {
            hashes_changed(&id, graph, engine, config, store, hasher)?
        };

        if stale {
            unfinished.extend(graph.descendant_tasks(&id));
            unfinished.insert(id);
        }
    }

    store.flush()?;
    Ok(unfinished)
}

/// Compare the digests of all neighbors of a task against the store,
/// recording fresh values. Returns whether anything changed or is missing.
fn hashes_changed(
    id: &str,
    graph: &Graph,
    engine: &TemplateEngine,
    config: &Config,
    store: &mut HashStore,
    hasher: &mut Hasher,
) -> Result<bool> {
    let mut changed = false;
    let mut rendered_digest: Option<String> = None;

    for neighbor in graph.neighbors(id) {
        if engine.has_template(&neighbor) {
            let digest = match &rendered_digest {
                Some(digest) => digest.clone(),
                None => {
                    let Some(node) = graph.task(id) else { continue };
                    let rendered = engine.render_task(&node.record, config)?;
                    let digest = hashing::hash_string(&rendered);
                    rendered_digest = Some(digest.clone());
                    digest
                }
            };
            changed |= compare_and_update(store, id, &neighbor, digest);
        } else {
            let path = Path::new(&neighbor);
            if path.exists() {
                for (key, digest) in hasher.hash_artifact(&neighbor, path)? {
                    changed |= compare_and_update(store, id, &key, digest);
                }
            } else {
                changed = true;
            }
        }
    }

    Ok(changed)
}

fn compare_and_update(store: &mut HashStore, task_id: &str, key: &str, digest: String) -> bool {
    if store.get(task_id, key) == Some(digest.as_str()) {
        false
    } else {
        store.put(task_id, key, digest);
        true
    }
}
