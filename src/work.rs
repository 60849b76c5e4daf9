//! Scopes: bounded regions of concurrent node execution.
//!
//! A Session holds what one invocation shares: the graph, the oracle, the
//! runner, progress reporting, and a ledger of which nodes already finished.
//! A Context is a scope within it, with its own concurrency bound and helper
//! table.  Context::run dispatches the requested nodes (plus any producers
//! not yet evaluated in this invocation) onto a rayon pool and returns only
//! once every dispatched node has finished.

use crate::densemap::DenseMap;
use crate::db::Oracle;
use crate::error::BuildError;
use crate::graph::{Graph, NodeId};
use crate::helper::{Helper, Helpers};
use crate::interrupt;
use crate::process::Runner;
use crate::progress::Progress;
use crate::task::{self, NodeOutcome, TaskEnv};
use crate::trace;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex, MutexGuard};
use std::time::Instant;

/// A node's state in the current invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Not evaluated yet.
    Unknown,
    /// Claimed by a running scope.
    Queued(String),
    /// Evaluated; the flag records whether the action ran.
    Done { ran: bool },
    Failed,
}

/// Counts from one Context::run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScopeSummary {
    /// Nodes whose actions ran.
    pub ran: usize,
    /// Nodes found current.
    pub current: usize,
}

pub struct Session<'a> {
    graph: &'a Graph,
    root: PathBuf,
    oracle: &'a dyn Oracle,
    runner: &'a dyn Runner,
    progress: Mutex<Box<dyn Progress + Send + 'a>>,
    ledger: Mutex<DenseMap<NodeId, NodeState>>,
    ran: AtomicUsize,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<'a> Session<'a> {
    /// `root` should be absolute: helpers and test binaries are spawned with
    /// other working directories.
    pub fn new(
        graph: &'a Graph,
        root: impl Into<PathBuf>,
        oracle: &'a dyn Oracle,
        runner: &'a dyn Runner,
        progress: Box<dyn Progress + Send + 'a>,
    ) -> Self {
        Session {
            graph,
            root: root.into(),
            oracle,
            runner,
            progress: Mutex::new(progress),
            ledger: Mutex::new(DenseMap::filled(&graph.nodes, NodeState::Unknown)),
            ran: AtomicUsize::new(0),
        }
    }

    pub fn graph(&self) -> &'a Graph {
        self.graph
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The outermost scope.
    pub fn context(&self, name: &str, parallelism: usize, helpers: Helpers) -> Context<'_, 'a> {
        Context {
            session: self,
            name: name.to_string(),
            parallelism: parallelism.max(1),
            helpers,
        }
    }

    /// Number of actions run so far in this invocation.
    pub fn tasks_run(&self) -> usize {
        self.ran.load(Ordering::Relaxed)
    }

    pub fn state(&self, id: NodeId) -> NodeState {
        lock(&self.ledger)[id].clone()
    }

    pub fn log(&self, msg: &str) {
        lock(&self.progress).log(msg);
    }
}

/// A scope: concurrency bound, helper snapshot and display name.
pub struct Context<'s, 'a> {
    session: &'s Session<'a>,
    name: String,
    parallelism: usize,
    helpers: Helpers,
}

impl<'s, 'a> Context<'s, 'a> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn helpers(&self) -> &Helpers {
        &self.helpers
    }

    /// A nested scope.  It inherits this scope's helpers with `overrides`
    /// layered on top, and this scope's bound unless given its own.
    pub fn child<I>(&self, name: &str, parallelism: Option<usize>, overrides: I) -> Context<'s, 'a>
    where
        I: IntoIterator<Item = (String, Helper)>,
    {
        Context {
            session: self.session,
            name: format!("{}/{}", self.name, name),
            parallelism: parallelism.unwrap_or(self.parallelism).max(1),
            helpers: self.helpers.with_overrides(overrides),
        }
    }

    /// Run `f` in a nested scope, with entry and exit traced.
    pub fn scope<R, I>(
        &self,
        name: &str,
        parallelism: Option<usize>,
        overrides: I,
        f: impl FnOnce(&Context<'s, 'a>) -> Result<R, BuildError>,
    ) -> Result<R, BuildError>
    where
        I: IntoIterator<Item = (String, Helper)>,
    {
        let child = self.child(name, parallelism, overrides);
        tracing::info!(scope = %child.name, parallelism = child.parallelism, "enter scope");
        let result = trace::scope(&child.name, || f(&child));
        tracing::info!(scope = %child.name, ok = result.is_ok(), "exit scope");
        result
    }

    /// Claim every node needed for `targets` that this invocation has not
    /// evaluated yet, producers first.
    fn plan(&self, targets: &[NodeId]) -> Result<Vec<NodeId>, BuildError> {
        let graph = self.session.graph;
        let mut ledger = lock(&self.session.ledger);
        let mut planned: Vec<NodeId> = Vec::new();
        let mut seen: FxHashSet<NodeId> = FxHashSet::default();
        // Iterative post-order walk: (node, the node that needs it, whether
        // its producers were already pushed).
        let mut stack: Vec<(NodeId, Option<NodeId>, bool)> =
            targets.iter().rev().map(|&id| (id, None, false)).collect();
        while let Some((id, consumer, expanded)) = stack.pop() {
            if expanded {
                planned.push(id);
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            match &ledger[id] {
                NodeState::Done { .. } => continue,
                NodeState::Failed => {
                    return Err(BuildError::DependencyFailed {
                        node: graph.describe(consumer.unwrap_or(id)),
                        dependency: graph.describe(id),
                    });
                }
                NodeState::Queued(scope) => {
                    return Err(BuildError::Other(anyhow::anyhow!(
                        "{}: already being built by scope {}",
                        graph.describe(id),
                        scope
                    )));
                }
                NodeState::Unknown => {}
            }
            stack.push((id, consumer, true));
            for producer in graph.producers(id).into_iter().rev() {
                if !seen.contains(&producer) {
                    stack.push((producer, Some(id), false));
                }
            }
        }
        for &id in &planned {
            ledger[id] = NodeState::Queued(self.name.clone());
        }
        Ok(planned)
    }

    /// Evaluate `targets` and whatever they transitively need.  Returns after
    /// every dispatched node finished.  On the first failure nothing new is
    /// dispatched; nodes already running are drained, then the failure is
    /// returned.
    pub fn run(&self, targets: &[NodeId]) -> Result<ScopeSummary, BuildError> {
        let session = self.session;
        let graph = session.graph;
        let planned = self.plan(targets)?;
        let mut summary = ScopeSummary::default();
        if planned.is_empty() {
            return Ok(summary);
        }
        tracing::debug!(scope = %self.name, nodes = planned.len(), "run");

        // Number of unfinished planned producers per planned node.
        let mut pending: FxHashMap<NodeId, usize> = FxHashMap::default();
        for &id in &planned {
            pending.insert(id, 0);
        }
        let mut dependents: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
        for &id in &planned {
            for producer in graph.producers(id) {
                if pending.contains_key(&producer) {
                    *pending.entry(id).or_default() += 1;
                    dependents.entry(producer).or_default().push(id);
                }
            }
        }
        let mut ready: VecDeque<NodeId> = planned
            .iter()
            .copied()
            .filter(|id| pending[id] == 0)
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name({
                let name = self.name.clone();
                move |i| format!("xforge {} {}", name, i)
            })
            .build()
            .map_err(|err| BuildError::Other(err.into()))?;

        let env = TaskEnv {
            graph,
            root: &session.root,
            helpers: &self.helpers,
            oracle: session.oracle,
            runner: session.runner,
        };
        let (tx, rx) = mpsc::channel::<(NodeId, Result<NodeOutcome, BuildError>)>();
        let mut failure: Option<BuildError> = None;
        let mut running = 0usize;
        let mut undispatched = planned.len();

        pool.in_place_scope(|s| {
            loop {
                while failure.is_none() && running < self.parallelism {
                    if interrupt::interrupted() {
                        failure = Some(BuildError::Interrupted);
                        break;
                    }
                    let Some(id) = ready.pop_front() else { break };
                    running += 1;
                    undispatched -= 1;
                    let tx = tx.clone();
                    s.spawn(move |_| {
                        let start = Instant::now();
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            task::evaluate_and_run(&env, id)
                        }))
                        .unwrap_or_else(|panic| {
                            let msg = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_default();
                            Err(BuildError::Other(anyhow::anyhow!(
                                "{}: action panicked: {}",
                                env.graph.describe(id),
                                msg
                            )))
                        });
                        if trace::enabled() {
                            trace::span(
                                &env.graph.message(id),
                                trace::current_tid(),
                                start,
                                Instant::now(),
                            );
                        }
                        // The receiver outlives every spawned task.
                        let _ = tx.send((id, result));
                    });
                }
                if running == 0 {
                    break;
                }

                let Ok((id, result)) = rx.recv() else { break };
                running -= 1;
                let message = graph.message(id);
                match result {
                    Ok(outcome) => {
                        lock(&session.ledger)[id] = NodeState::Done { ran: outcome.ran };
                        if outcome.ran {
                            summary.ran += 1;
                            session.ran.fetch_add(1, Ordering::Relaxed);
                        } else {
                            summary.current += 1;
                        }
                        lock(&session.progress).task_finished(id, &message, &outcome);
                        if let Some(deps) = dependents.get(&id) {
                            for &dep in deps {
                                let count = pending.entry(dep).or_default();
                                *count -= 1;
                                if *count == 0 {
                                    ready.push_back(dep);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        lock(&session.ledger)[id] = NodeState::Failed;
                        let err = if interrupt::interrupted() && err.is_action_failure() {
                            BuildError::Interrupted
                        } else {
                            err
                        };
                        lock(&session.progress).task_failed(id, &message, &err);
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                }
            }
        });

        // Nodes never dispatched go back to unevaluated.
        if undispatched > 0 {
            let mut ledger = lock(&session.ledger);
            for &id in &planned {
                if matches!(ledger[id], NodeState::Queued(_)) {
                    ledger[id] = NodeState::Unknown;
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}
