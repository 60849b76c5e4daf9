//! The build graph, a graph between files and nodes.
//!
//! Nodes are declared producer-first: an input either names a file some
//! earlier node produces, or a file that already exists on disk.  That makes
//! the graph acyclic by construction and lets NodeId order double as a
//! topological order.

use crate::adapter::AdapterKind;
use crate::canon::{canon_path, to_slash};
use crate::densemap::{self, DenseMap};
use crate::error::ConfigurationError;
use crate::fs::FileSystem;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);
impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u as u32)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u as u32)
    }
}

/// What a declared path holds.  Informational for most purposes; Executable
/// outputs get their mode bits fixed up when published.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResourceKind {
    Source,
    Object,
    Archive,
    Directory,
    Executable,
    Image,
    Descriptor,
    Report,
}

/// A typed reference to a path, as it appears in a node declaration.
#[derive(Debug, Clone)]
pub struct Resource {
    pub path: PathBuf,
    pub kind: ResourceKind,
    /// For inputs: whether the path must exist (or be produced by an earlier
    /// node) before the node can be evaluated at all.
    pub must_exist: bool,
}

impl Resource {
    pub fn required(kind: ResourceKind, path: impl Into<PathBuf>) -> Self {
        Resource {
            path: path.into(),
            kind,
            must_exist: true,
        }
    }

    pub fn optional(kind: ResourceKind, path: impl Into<PathBuf>) -> Self {
        Resource {
            path: path.into(),
            kind,
            must_exist: false,
        }
    }
}

#[derive(Debug)]
pub struct File {
    pub path: PathBuf,
    /// The node that produces this file, if any.
    pub producer: Option<NodeId>,
    /// Nodes that take this file as input.
    pub dependents: Vec<NodeId>,
}

impl File {
    pub fn name(&self) -> String {
        to_slash(&self.path)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Input {
    pub file: FileId,
    pub kind: ResourceKind,
    pub must_exist: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub file: FileId,
    pub kind: ResourceKind,
}

/// A declared unit of rebuildable work.  Immutable once declared.
#[derive(Debug)]
pub struct Node {
    pub label: Option<String>,
    /// Progress message, e.g. "compile src/main.cpp".
    pub desc: Option<String>,
    pub ins: Vec<Input>,
    pub outs: Vec<Output>,
    pub action: AdapterKind,
}

impl Node {
    pub fn input_files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.ins.iter().map(|i| i.file)
    }

    pub fn output_files(&self) -> impl Iterator<Item = FileId> + '_ {
        self.outs.iter().map(|o| o.file)
    }
}

/// Arguments to Graph::declare.
pub struct NodeSpec {
    label: Option<String>,
    desc: Option<String>,
    ins: Vec<Resource>,
    outs: Vec<Resource>,
    action: AdapterKind,
}

impl NodeSpec {
    pub fn new(action: AdapterKind) -> Self {
        NodeSpec {
            label: None,
            desc: None,
            ins: Vec::new(),
            outs: Vec::new(),
            action,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = Some(desc.into());
        self
    }

    pub fn input(mut self, res: Resource) -> Self {
        self.ins.push(res);
        self
    }

    pub fn inputs(mut self, res: impl IntoIterator<Item = Resource>) -> Self {
        self.ins.extend(res);
        self
    }

    pub fn output(mut self, res: Resource) -> Self {
        self.outs.push(res);
        self
    }
}

#[derive(Default)]
pub struct Graph {
    pub files: DenseMap<FileId, File>,
    pub nodes: DenseMap<NodeId, Node>,
    file_to_id: FxHashMap<PathBuf, FileId>,
    labels: FxHashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn file(&self, id: FileId) -> &File {
        &self.files[id]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Look up the id for a path, adding it if not already known.
    pub fn file_id(&mut self, path: impl AsRef<Path>) -> FileId {
        let canon = canon_path(path);
        if let Some(&id) = self.file_to_id.get(&canon) {
            return id;
        }
        let id = self.files.push(File {
            path: canon.clone(),
            producer: None,
            dependents: Vec::new(),
        });
        self.file_to_id.insert(canon, id);
        id
    }

    pub fn lookup(&self, path: impl AsRef<Path>) -> Option<FileId> {
        self.file_to_id.get(&canon_path(path)).copied()
    }

    pub fn lookup_label(&self, label: &str) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    /// A node's identity for messages: its declared outputs, or its label
    /// when it has none.
    pub fn describe(&self, id: NodeId) -> String {
        let node = self.node(id);
        if node.outs.is_empty() {
            return node.label.clone().unwrap_or_default();
        }
        let names: Vec<String> = node.outs.iter().map(|o| self.file(o.file).name()).collect();
        names.join(" ")
    }

    /// The message shown while a node runs.
    pub fn message(&self, id: NodeId) -> String {
        match &self.node(id).desc {
            Some(desc) if !desc.is_empty() => desc.clone(),
            _ => self.describe(id),
        }
    }

    /// Key under which the oracle tracks a node across invocations.
    pub fn key(&self, id: NodeId) -> String {
        let node = self.node(id);
        if node.outs.is_empty() {
            // Output paths never contain NUL, so labels cannot collide with them.
            return format!("\0{}", node.label.as_deref().unwrap_or_default());
        }
        let names: Vec<String> = node.outs.iter().map(|o| self.file(o.file).name()).collect();
        names.join("\0")
    }

    /// Nodes producing some input of `id`, deduplicated.
    pub fn producers(&self, id: NodeId) -> Vec<NodeId> {
        let mut producers: Vec<NodeId> = self
            .node(id)
            .input_files()
            .filter_map(|f| self.file(f).producer)
            .collect();
        producers.sort_unstable();
        producers.dedup();
        producers
    }

    /// Declare a node.  Fails, leaving the graph's nodes untouched, if the
    /// inputs and outputs do not fit the node's action, if an output is
    /// already claimed, or if a required input is neither produced by an
    /// earlier node nor present on disk.
    pub fn declare(
        &mut self,
        fs: &dyn FileSystem,
        spec: NodeSpec,
    ) -> Result<NodeId, ConfigurationError> {
        let NodeSpec {
            label,
            desc,
            ins,
            outs,
            action,
        } = spec;

        if outs.is_empty() && label.is_none() {
            return Err(ConfigurationError::Unidentified);
        }
        if let Some(label) = &label {
            if self.labels.contains_key(label) {
                return Err(ConfigurationError::DuplicateLabel(label.clone()));
            }
        }
        let identity = match &label {
            Some(label) if outs.is_empty() => label.clone(),
            _ => {
                let names: Vec<String> =
                    outs.iter().map(|o| to_slash(&canon_path(&o.path))).collect();
                names.join(" ")
            }
        };
        action
            .check_arity(&ins, &outs)
            .map_err(|msg| ConfigurationError::Invalid(format!("{}: {}", identity, msg)))?;

        let mut out_ids: Vec<Output> = Vec::with_capacity(outs.len());
        for out in &outs {
            let file = self.file_id(&out.path);
            let earlier = self.file(file).producer.map(|p| self.describe(p));
            let repeated = out_ids.iter().any(|o| o.file == file);
            if earlier.is_some() || repeated {
                return Err(ConfigurationError::DuplicateOutput {
                    path: self.file(file).name(),
                    first: earlier.unwrap_or_else(|| identity.clone()),
                    second: identity,
                });
            }
            out_ids.push(Output {
                file,
                kind: out.kind,
            });
        }

        let mut in_ids: Vec<Input> = Vec::with_capacity(ins.len());
        for input in &ins {
            let file = self.file_id(&input.path);
            if out_ids.iter().any(|o| o.file == file) {
                return Err(ConfigurationError::Invalid(format!(
                    "{}: {} is both input and output",
                    identity,
                    self.file(file).name()
                )));
            }
            if input.must_exist && self.file(file).producer.is_none() {
                let path = self.file(file).path.clone();
                let mtime = fs.stat(&path).map_err(|err| {
                    ConfigurationError::Invalid(format!("stat {}: {}", to_slash(&path), err))
                })?;
                if !mtime.exists() {
                    return Err(ConfigurationError::MissingInput {
                        node: identity,
                        path: to_slash(&path),
                    });
                }
            }
            in_ids.push(Input {
                file,
                kind: input.kind,
                must_exist: input.must_exist,
            });
        }

        let id = self.nodes.next_id();
        for input in &in_ids {
            let dependents = &mut self.files[input.file].dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
        for out in &out_ids {
            self.files[out.file].producer = Some(id);
        }
        if let Some(label) = &label {
            self.labels.insert(label.clone(), id);
        }
        let pushed = self.nodes.push(Node {
            label,
            desc,
            ins: in_ids,
            outs: out_ids,
            action,
        });
        debug_assert_eq!(pushed, id);
        Ok(id)
    }
}
