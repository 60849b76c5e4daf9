//! Helper resolution: logical executable names to concrete paths.
//!
//! A scope holds an immutable snapshot of the table.  Child scopes layer
//! overrides on top of the parent's snapshot; nothing is mutated in place, so
//! running actions can read the table without locking.

use crate::graph::{FileId, Graph};
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a logical helper name is bound to.
#[derive(Debug, Clone, PartialEq)]
pub enum Helper {
    /// An executable outside the build, e.g. an installed cross compiler.
    External(PathBuf),
    /// A file produced by the build itself, e.g. a just-linked test binary.
    Artifact(FileId),
}

#[derive(Debug, Clone, Default)]
pub struct Helpers {
    table: Arc<FxHashMap<String, Helper>>,
}

impl Helpers {
    pub fn new() -> Self {
        Helpers::default()
    }

    /// A new snapshot with `overrides` shadowing this one's bindings.
    pub fn with_overrides<I>(&self, overrides: I) -> Helpers
    where
        I: IntoIterator<Item = (String, Helper)>,
    {
        let mut overrides = overrides.into_iter().peekable();
        if overrides.peek().is_none() {
            return self.clone();
        }
        let mut table = (*self.table).clone();
        table.extend(overrides);
        Helpers {
            table: Arc::new(table),
        }
    }

    pub fn with(&self, name: impl Into<String>, helper: Helper) -> Helpers {
        self.with_overrides([(name.into(), helper)])
    }

    pub fn get(&self, name: &str) -> Option<&Helper> {
        self.table.get(name)
    }

    /// The program to spawn for `name`.  Unbound names resolve to themselves,
    /// leaving the search to the OS's PATH lookup.  Artifact paths are made
    /// relative to `root` explicit so they are not looked up on PATH.
    pub fn resolve(&self, graph: &Graph, root: &Path, name: &str) -> PathBuf {
        match self.table.get(name) {
            None => PathBuf::from(name),
            Some(Helper::External(path)) => path.clone(),
            Some(Helper::Artifact(id)) => root.join(&graph.file(*id).path),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(|k| k.as_str())
    }
}
