//! Subcommands reachable through `-t`.

use crate::adapter::AdapterKind;
use crate::canon::to_slash;
use crate::graph::NodeId;
use crate::pipeline::Pipeline;
use crate::publish;
use crate::task;
use serde::Serialize;
use std::path::Path;

pub fn list() {
    println!("subcommands:");
    println!("  clean     remove built files and the build database");
    println!("  commands  list all commands required to build");
    println!("  compdb    write compile_commands.json");
}

/// Remove every declared output that exists, plus the database.  Returns the
/// number of files removed.
pub fn clean(pipeline: &Pipeline, root: &Path, db: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    for (_, node) in pipeline.graph.nodes.iter() {
        for out in node.output_files() {
            let path = root.join(&pipeline.graph.file(out).path);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => anyhow::bail!("remove {}: {}", path.display(), err),
            }
        }
    }
    match std::fs::remove_file(root.join(db)) {
        Ok(()) => removed += 1,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => anyhow::bail!("remove {}: {}", db.display(), err),
    }
    Ok(removed)
}

/// Every node with the helpers of the branch that runs it, in dependency
/// order.
fn nodes_with_helpers(pipeline: &Pipeline) -> Vec<(NodeId, crate::helper::Helpers)> {
    let mut nodes = Vec::new();
    for branch in &pipeline.branches {
        let helpers = pipeline.helpers.with_overrides(branch.helpers.clone());
        nodes.extend(branch.nodes.iter().map(|&id| (id, helpers.clone())));
    }
    nodes.sort_by_key(|(id, _)| *id);
    nodes
}

/// Command lines of every node, one per line.
pub fn commands(pipeline: &Pipeline, root: &Path) -> Vec<String> {
    nodes_with_helpers(pipeline)
        .into_iter()
        .map(|(id, helpers)| task::final_invocation(&pipeline.graph, root, &helpers, id).cmdline())
        .collect()
}

#[derive(Serialize)]
struct CompileCommand {
    directory: String,
    arguments: Vec<String>,
    file: String,
    output: String,
}

/// Write compile_commands.json at the root for every compile node.  Returns
/// the number of entries.
pub fn compdb(pipeline: &Pipeline, root: &Path) -> anyhow::Result<usize> {
    let graph = &pipeline.graph;
    let mut entries = Vec::new();
    for (id, helpers) in nodes_with_helpers(pipeline) {
        let node = graph.node(id);
        if !matches!(node.action, AdapterKind::Compile(_)) {
            continue;
        }
        let inv = task::final_invocation(graph, root, &helpers, id);
        let mut arguments = vec![inv.program.to_string_lossy().into_owned()];
        arguments.extend(inv.args.iter().map(|a| a.to_string_lossy().into_owned()));
        let source = node.ins[0].file;
        let output = node.outs[0].file;
        entries.push(CompileCommand {
            directory: to_slash(&inv.cwd),
            arguments,
            file: graph.file(source).name(),
            output: graph.file(output).name(),
        });
    }
    let json = serde_json::to_string_pretty(&entries)?;
    publish::write_atomic(&root.join("compile_commands.json"), json.as_bytes())?;
    Ok(entries.len())
}
