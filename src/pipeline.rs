//! The firmware and test pipelines, declared from the configuration.
//!
//! Firmware: sources -> compile* -> link -> image, joined at flash with the
//! partition table and two prebuilt images.  Test: application and test
//! sources -> compile* -> link -> test run.  The two branches share no nodes
//! and run side by side, each in its own scope.

use crate::adapter::{
    self, CompileParams, FlashParams, ImageParams, Language, LinkParams, PartitionParams,
    TestParams,
};
use crate::canon::canon_path;
use crate::config::{parse_define, Config, LinkSection, SourceGroup};
use crate::error::BuildError;
use crate::fs::FileSystem;
use crate::graph::{Graph, NodeId};
use crate::helper::{Helper, Helpers};
use crate::work::{Context, ScopeSummary};
use anyhow::Context as _;
use std::path::{Component, Path, PathBuf};

/// One independent chain of nodes and the scope settings it runs with.
#[derive(Debug)]
pub struct Branch {
    pub name: String,
    /// Every node of the branch, in declaration (dependency) order.
    pub nodes: Vec<NodeId>,
    pub compiles: Vec<NodeId>,
    /// The nodes that end the branch; running them runs everything.
    pub finals: Vec<NodeId>,
    /// Helper overrides for the branch's scope.
    pub helpers: Vec<(String, Helper)>,
}

pub struct Pipeline {
    pub graph: Graph,
    /// Helpers every branch inherits.
    pub helpers: Helpers,
    pub branches: Vec<Branch>,
}

/// Scope bounds for a run.
#[derive(Debug, Clone, Copy)]
pub struct Bounds {
    pub compile: usize,
    pub default: usize,
}

impl Bounds {
    /// Configured bounds, all replaced by `jobs` when given.
    pub fn new(config: &Config, jobs: Option<usize>) -> Self {
        Bounds {
            compile: jobs.unwrap_or(config.parallelism.compile),
            default: jobs.unwrap_or(config.parallelism.default),
        }
    }
}

fn language(path: &Path) -> Language {
    match path.extension().and_then(|e| e.to_str()) {
        Some("c") | Some("S") | Some("s") => Language::C,
        _ => Language::Cxx,
    }
}

/// Source files of a group, relative to the root, sorted.  Recursion skips
/// directories with a '.' in their name.
pub fn enumerate(root: &Path, group: &SourceGroup) -> anyhow::Result<Vec<PathBuf>> {
    let dir = root.join(&group.dir);
    let mut walk = walkdir::WalkDir::new(&dir).follow_links(true).min_depth(1);
    if !group.recurse {
        walk = walk.max_depth(1);
    }
    let mut sources = Vec::new();
    let entries = walk.into_iter().filter_entry(|e| {
        !(e.file_type().is_dir() && e.depth() > 0 && e.file_name().to_string_lossy().contains('.'))
    });
    for entry in entries {
        let entry = entry.with_context(|| format!("list {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if group.exclude.iter().any(|x| *x == name) {
            continue;
        }
        let ext = entry.path().extension().and_then(|e| e.to_str());
        if !ext.is_some_and(|ext| group.extensions.iter().any(|x| x == ext)) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();
        sources.push(rel);
    }
    sources.sort();
    Ok(sources)
}

/// `build/<branch>/<source>.o`.  Sources outside the root still land inside
/// the branch directory: a leading root becomes "_abs" and every ".." that
/// survives canonicalization becomes "_up".
fn object_path(build_dir: &Path, branch: &str, source: &Path) -> PathBuf {
    let mut rel = PathBuf::new();
    for comp in canon_path(source).components() {
        match comp {
            Component::Prefix(prefix) => {
                let drive: String = prefix
                    .as_os_str()
                    .to_string_lossy()
                    .chars()
                    .filter(|c| c.is_ascii_alphanumeric())
                    .collect();
                rel.push(format!("_abs_{}", drive));
            }
            Component::RootDir => {
                if rel.as_os_str().is_empty() {
                    rel.push("_abs");
                }
            }
            Component::ParentDir => rel.push("_up"),
            Component::CurDir => {}
            Component::Normal(part) => rel.push(part),
        }
    }
    let mut name = rel.into_os_string();
    name.push(".o");
    build_dir.join(branch).join(name)
}

fn link_params(link: &LinkSection) -> LinkParams {
    LinkParams {
        search_dirs: link.search_dirs.clone(),
        libraries: link.libraries.clone(),
        flags: link.flags.clone(),
        group: link.group,
    }
}

fn external(table: &std::collections::BTreeMap<String, PathBuf>) -> Vec<(String, Helper)> {
    table
        .iter()
        .map(|(name, path)| (name.clone(), Helper::External(path.clone())))
        .collect()
}

struct Declarer<'a> {
    config: &'a Config,
    root: &'a Path,
    fs: &'a dyn FileSystem,
    graph: Graph,
}

impl<'a> Declarer<'a> {
    fn declare(&mut self, spec: crate::graph::NodeSpec) -> Result<NodeId, BuildError> {
        Ok(self.graph.declare(self.fs, spec)?)
    }

    /// One compile node per source file of each group, as one batch.
    fn compile_groups(
        &mut self,
        branch: &mut Branch,
        groups: &[SourceGroup],
        include_dirs: &[PathBuf],
        defines: &[String],
        flags: &[String],
    ) -> Result<Vec<PathBuf>, BuildError> {
        let config = self.config;
        let compile = &config.compile;
        let mut objects = Vec::new();
        for group in groups {
            let sources = enumerate(self.root, group)?;
            if sources.is_empty() {
                tracing::warn!("{}: no sources in {}", branch.name, group.dir.display());
            }
            for source in sources {
                let language = language(&source);
                let mut all_flags = compile.flags.clone();
                all_flags.extend(match language {
                    Language::C => compile.c_flags.iter().cloned(),
                    Language::Cxx => compile.cxx_flags.iter().cloned(),
                });
                all_flags.extend(flags.iter().cloned());
                all_flags.extend(group.flags.iter().cloned());
                let params = CompileParams {
                    language,
                    dialect: match language {
                        Language::C => compile.c_dialect.clone(),
                        Language::Cxx => compile.cxx_dialect.clone(),
                    },
                    defines: compile
                        .defines
                        .iter()
                        .chain(defines)
                        .chain(&group.defines)
                        .map(|d| parse_define(d))
                        .collect(),
                    include_dirs: group
                        .include_dirs
                        .iter()
                        .chain(include_dirs)
                        .cloned()
                        .collect(),
                    flags: all_flags,
                };
                let object = object_path(&config.build.build_dir, &branch.name, &source);
                let id = self.declare(adapter::compile(params, &source, &object))?;
                branch.nodes.push(id);
                branch.compiles.push(id);
                objects.push(object);
            }
        }
        Ok(objects)
    }

    fn firmware(&mut self) -> Result<Branch, BuildError> {
        let config = self.config;
        let dist = &config.build.dist_dir;
        let name = &config.firmware.name;
        let mut branch = Branch {
            name: "firmware".into(),
            nodes: Vec::new(),
            compiles: Vec::new(),
            finals: Vec::new(),
            helpers: Vec::new(),
        };
        let objects = self.compile_groups(
            &mut branch,
            &config.firmware.sources,
            &config.firmware.include_dirs,
            &[],
            &[],
        )?;

        let elf = dist.join(name);
        let link = self.declare(adapter::link(link_params(&config.link), &objects, &elf))?;
        branch.nodes.push(link);

        let image = dist.join(format!("{}.bin", name));
        let mut image_node = None;
        if config.image.enabled {
            let params = ImageParams {
                args: config.image.args.clone(),
            };
            let id = self.declare(adapter::image_convert(params, &elf, &image))?;
            branch.nodes.push(id);
            image_node = Some(id);
        }

        let table = dist.join(format!("{}.partitions.bin", name));
        let mut partition_node = None;
        if let Some(partition) = &config.partition {
            let params = PartitionParams {
                script: partition.script.clone(),
                args: partition.args.clone(),
            };
            let id = self.declare(adapter::partition_gen(params, &partition.layout, &table))?;
            branch.nodes.push(id);
            partition_node = Some(id);
        }

        match &config.flash {
            Some(flash) if flash.enabled => {
                let params = FlashParams {
                    args: flash.args.clone(),
                    offsets: flash.offsets.clone(),
                };
                let id = self.declare(adapter::flash(
                    params,
                    &image,
                    &table,
                    &flash.bootloader,
                    &flash.boot_app,
                ))?;
                branch.nodes.push(id);
                branch.finals.push(id);
            }
            _ => {
                branch.finals.extend(image_node.or(Some(link)));
                branch.finals.extend(partition_node);
            }
        }
        Ok(branch)
    }

    fn test(&mut self) -> Result<Option<Branch>, BuildError> {
        let config = self.config;
        let test = match &config.test {
            Some(test) if test.enabled => test,
            _ => return Ok(None),
        };
        let mut branch = Branch {
            name: "test".into(),
            nodes: Vec::new(),
            compiles: Vec::new(),
            finals: Vec::new(),
            helpers: external(&test.helpers),
        };
        let objects = self.compile_groups(
            &mut branch,
            &test.sources,
            &test.include_dirs,
            &test.defines,
            &test.flags,
        )?;

        let binary_dir = config.build.dist_dir.join("test");
        let binary = binary_dir.join(&test.name);
        let link = self.declare(adapter::link(link_params(&test.link), &objects, &binary))?;
        branch.nodes.push(link);

        let params = TestParams {
            args: test.args.clone(),
            cwd: test.cwd.clone().unwrap_or(binary_dir),
            on_failure: test.on_failure,
        };
        let report = config
            .build
            .build_dir
            .join("test")
            .join(format!("{}.report", test.name));
        let run = self.declare(adapter::test_run(params, &binary, &report))?;
        branch.nodes.push(run);
        branch.finals.push(run);

        // The test runner's executable is the binary linked just above.
        let file = self.graph.file_id(&binary);
        branch
            .helpers
            .push(("test-binary".to_string(), Helper::Artifact(file)));
        Ok(Some(branch))
    }
}

/// Declare the whole graph.  Fails before anything runs on any
/// configuration problem.
pub fn declare(
    config: &Config,
    root: &Path,
    fs: &dyn FileSystem,
    with_test: bool,
) -> Result<Pipeline, BuildError> {
    let mut declarer = Declarer {
        config,
        root,
        fs,
        graph: Graph::new(),
    };
    let mut branches = vec![declarer.firmware()?];
    if with_test {
        branches.extend(declarer.test()?);
    }
    Ok(Pipeline {
        graph: declarer.graph,
        helpers: Helpers::new().with_overrides(external(&config.helpers)),
        branches,
    })
}

/// Compile a branch's sources in a compile scope, then finish it in the
/// branch scope.
fn run_branch(
    parent: &Context,
    branch: &Branch,
    bounds: Bounds,
) -> Result<ScopeSummary, BuildError> {
    parent.scope(
        &branch.name,
        Some(bounds.default),
        branch.helpers.clone(),
        |ctx| {
            let compiled = ctx.scope("compile", Some(bounds.compile), Vec::new(), |c| {
                c.run(&branch.compiles)
            })?;
            let rest = ctx.run(&branch.finals)?;
            Ok(ScopeSummary {
                ran: compiled.ran + rest.ran,
                current: compiled.current + rest.current,
            })
        },
    )
}

/// Run every branch concurrently under `root`.  Each branch stops at its own
/// first failure; the others carry on.  Returns the first failure, if any.
pub fn run(root: &Context, branches: &[Branch], bounds: Bounds) -> Result<ScopeSummary, BuildError> {
    let results: Vec<Result<ScopeSummary, BuildError>> = std::thread::scope(|s| {
        let handles: Vec<_> = branches
            .iter()
            .map(|branch| s.spawn(move || run_branch(root, branch, bounds)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(BuildError::Other(anyhow::anyhow!("branch scheduler panicked")))
                })
            })
            .collect()
    });
    let mut total = ScopeSummary::default();
    let mut first_err = None;
    for result in results {
        match result {
            Ok(summary) => {
                total.ran += summary.ran;
                total.current += summary.current;
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(total),
    }
}
