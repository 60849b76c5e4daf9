//! Evaluating and running a single node.
//! Unaware of scheduling; a worker thread calls evaluate_and_run once the
//! node's producers have all finished.

use crate::adapter::{AdapterKind, NodePaths, TestFailurePolicy};
use crate::canon::canon_path;
use crate::db::{Freshness, Oracle, Query};
use crate::depfile;
use crate::error::{BuildError, ExitDetail};
use crate::graph::{Graph, NodeId, ResourceKind};
use crate::hash;
use crate::helper::Helpers;
use crate::process::{Invocation, Runner, TaskResult, Termination};
use crate::publish::{self, Staged};
use anyhow::Context;
use std::path::{Path, PathBuf};

/// Everything a node needs to run, borrowed from its scope.
#[derive(Clone, Copy)]
pub struct TaskEnv<'a> {
    pub graph: &'a Graph,
    /// Absolute working root; every graph path is relative to it.
    pub root: &'a Path,
    pub helpers: &'a Helpers,
    pub oracle: &'a dyn Oracle,
    pub runner: &'a dyn Runner,
}

/// What happened to a node that did not fail.
#[derive(Debug)]
pub struct NodeOutcome {
    /// False when the oracle judged the outputs current.
    pub ran: bool,
    /// Declared output paths, relative to the root.
    pub outputs: Vec<PathBuf>,
    pub cmdline: String,
    /// Console output of the action, if it ran.
    pub output: Vec<u8>,
}

/// Program path for a helper name.  Relative paths with a directory part are
/// taken relative to the root; bare names are left for PATH lookup.
fn program(graph: &Graph, root: &Path, helpers: &Helpers, name: &str) -> PathBuf {
    let resolved = helpers.resolve(graph, root, name);
    if resolved.is_relative() && resolved.components().count() > 1 {
        root.join(resolved)
    } else {
        resolved
    }
}

/// The invocation a node would run with its outputs at `outs`, resolving its
/// helper through `helpers`.
pub fn invocation(
    graph: &Graph,
    root: &Path,
    helpers: &Helpers,
    id: NodeId,
    outs: Vec<PathBuf>,
) -> Invocation {
    let node = graph.node(id);
    let paths = NodePaths {
        ins: node
            .ins
            .iter()
            .map(|i| (i.kind, graph.file(i.file).path.clone()))
            .collect(),
        outs,
    };
    Invocation {
        program: program(graph, root, helpers, node.action.helper()),
        args: node.action.args(&paths),
        cwd: match node.action.cwd() {
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        },
    }
}

/// The invocation as it would run with outputs at their declared paths.
pub fn final_invocation(graph: &Graph, root: &Path, helpers: &Helpers, id: NodeId) -> Invocation {
    invocation(graph, root, helpers, id, declared_outputs(graph, id))
}

fn declared_outputs(graph: &Graph, id: NodeId) -> Vec<PathBuf> {
    graph
        .node(id)
        .output_files()
        .map(|f| graph.file(f).path.clone())
        .collect()
}

/// Path of a staging file as the action should see it: relative to the root
/// when possible, to keep command lines short.
fn staged_arg(root: &Path, staged: &Staged) -> PathBuf {
    staged
        .path()
        .strip_prefix(root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| staged.path().to_path_buf())
}

fn exit_detail(result: &TaskResult) -> ExitDetail {
    ExitDetail {
        termination: result.termination,
        code: result.code,
        output: String::from_utf8_lossy(&result.output).into_owned(),
    }
}

fn report(result: &TaskResult) -> Vec<u8> {
    let mut report = result.output.clone();
    if !report.is_empty() && !report.ends_with(b"\n") {
        report.push(b'\n');
    }
    let verdict = match (result.termination, result.code) {
        (Termination::Success, _) => "passed".to_string(),
        (Termination::Interrupted, _) => "interrupted".to_string(),
        (Termination::Failure, Some(code)) => format!("failed with exit status {}", code),
        (Termination::Failure, None) => "failed".to_string(),
    };
    report.extend_from_slice(format!("xforge: tests {}\n", verdict).as_bytes());
    report
}

/// Read and remove a depfile.  Its paths are relative to the root, like
/// every graph path.
fn take_depfile(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()));
    if data.is_ok() {
        std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    let deps = depfile::parse(&data?).with_context(|| format!("parse {}", path.display()))?;
    Ok(deps.deps.into_iter().map(canon_path).collect())
}

/// Consult the oracle and, if the node is stale, run its action through
/// staged outputs and record the new state.
pub fn evaluate_and_run(env: &TaskEnv, id: NodeId) -> Result<NodeOutcome, BuildError> {
    let graph = env.graph;
    let node = graph.node(id);
    let outputs = declared_outputs(graph, id);
    let inputs: Vec<PathBuf> = node
        .input_files()
        .map(|f| graph.file(f).path.clone())
        .collect();

    // Fingerprint over the declared output names, so the decision does not
    // depend on this run's staging names.
    let declared = invocation(graph, env.root, env.helpers, id, outputs.clone());
    let key = graph.key(id);
    let query = Query {
        key: &key,
        inputs: &inputs,
        outputs: &outputs,
        fingerprint: hash::fingerprint(&declared),
    };
    let cmdline = declared.cmdline();

    if env.oracle.check(&query)? == Freshness::Current {
        return Ok(NodeOutcome {
            ran: false,
            outputs,
            cmdline,
            output: Vec::new(),
        });
    }

    let mut staged = Vec::with_capacity(node.outs.len());
    for out in &node.outs {
        let dest = env.root.join(&graph.file(out.file).path);
        let s = Staged::acquire(&dest, out.kind == ResourceKind::Executable).map_err(|err| {
            BuildError::PublishAborted {
                node: graph.describe(id),
                path: graph.file(out.file).name(),
                source: err,
            }
        })?;
        staged.push(s);
    }

    let staged_invocation = if node.action.writes_outputs() {
        let outs = staged.iter().map(|s| staged_arg(env.root, s)).collect();
        invocation(graph, env.root, env.helpers, id, outs)
    } else {
        declared
    };
    tracing::debug!("{}: running {}", graph.describe(id), staged_invocation.cmdline());
    let result = env
        .runner
        .run(&staged_invocation)
        .unwrap_or_else(|err| TaskResult::spawn_failure(&err));

    let mut discovered = Vec::new();
    if let Some(path) = staged.first().and_then(|s| node.action.depfile(s.path())) {
        // Taken even after a failure, so no depfile outlives its run.
        let deps = take_depfile(&path);
        if result.termination == Termination::Success {
            discovered = deps.with_context(|| graph.describe(id))?;
            discovered.retain(|dep| !inputs.contains(dep));
        }
    }
    let mut record = true;

    if let AdapterKind::TestRun(params) = &node.action {
        if result.termination != Termination::Success {
            if params.on_failure == TestFailurePolicy::FailBuild
                || result.termination == Termination::Interrupted
            {
                return Err(BuildError::ActionFailed {
                    node: graph.describe(id),
                    detail: exit_detail(&result),
                });
            }
            // Left unrecorded, so the tests run again until they pass.
            record = false;
            tracing::error!(
                "{}: unit tests {}; continuing",
                graph.describe(id),
                exit_detail(&result)
                    .to_string()
                    .lines()
                    .next()
                    .unwrap_or("failed")
            );
        }
        let data = report(&result);
        for s in &staged {
            s.write(&data).map_err(|err| BuildError::PublishAborted {
                node: graph.describe(id),
                path: s.dest().display().to_string(),
                source: err,
            })?;
        }
    } else if result.termination != Termination::Success {
        // Dropping the stagings discards whatever the action wrote.
        return Err(BuildError::ActionFailed {
            node: graph.describe(id),
            detail: exit_detail(&result),
        });
    }

    publish::publish_all(staged).map_err(|(path, err)| BuildError::PublishAborted {
        node: graph.describe(id),
        path: path.display().to_string(),
        source: err,
    })?;
    if record {
        env.oracle.record(&query, &discovered)?;
    }

    Ok(NodeOutcome {
        ran: true,
        outputs,
        cmdline,
        output: result.output,
    })
}
