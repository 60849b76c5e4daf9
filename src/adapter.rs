//! Toolchain steps.
//!
//! Each node carries an AdapterKind: a plain record of the parameters for one
//! external tool.  Turning a record plus the node's resolved paths into an
//! argument vector is a pure function; nothing here touches the disk or
//! spawns anything.

use crate::canon::to_slash;
use crate::graph::{NodeSpec, Resource, ResourceKind};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    C,
    Cxx,
}

#[derive(Debug, Clone)]
pub struct CompileParams {
    pub language: Language,
    /// e.g. "gnu99", passed as -std=.
    pub dialect: Option<String>,
    /// Preprocessor definitions, in command-line order.
    pub defines: Vec<(String, Option<String>)>,
    pub include_dirs: Vec<PathBuf>,
    pub flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LinkParams {
    pub search_dirs: Vec<PathBuf>,
    /// Library names for -l, in resolution order.
    pub libraries: Vec<String>,
    pub flags: Vec<String>,
    /// Wrap objects and libraries in --start-group/--end-group so symbols are
    /// resolved iteratively across the group rather than left to right once.
    pub group: bool,
}

#[derive(Debug, Clone)]
pub struct ImageParams {
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PartitionParams {
    /// Generator script, when the helper is an interpreter.
    pub script: Option<PathBuf>,
    pub args: Vec<String>,
}

/// Flash addresses of the four images written by a Flash step.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashOffsets {
    #[serde(default = "FlashOffsets::default_boot_app")]
    pub boot_app: String,
    #[serde(default = "FlashOffsets::default_bootloader")]
    pub bootloader: String,
    #[serde(default = "FlashOffsets::default_firmware")]
    pub firmware: String,
    #[serde(default = "FlashOffsets::default_partitions")]
    pub partitions: String,
}

impl FlashOffsets {
    fn default_boot_app() -> String {
        "0xe000".into()
    }
    fn default_bootloader() -> String {
        "0x1000".into()
    }
    fn default_firmware() -> String {
        "0x10000".into()
    }
    fn default_partitions() -> String {
        "0x8000".into()
    }
}

impl Default for FlashOffsets {
    fn default() -> Self {
        FlashOffsets {
            boot_app: Self::default_boot_app(),
            bootloader: Self::default_bootloader(),
            firmware: Self::default_firmware(),
            partitions: Self::default_partitions(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlashParams {
    pub args: Vec<String>,
    pub offsets: FlashOffsets,
}

/// What a failing test run does to the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFailurePolicy {
    /// The test-runner node fails, and with it the build.
    #[default]
    FailBuild,
    /// The failure is logged and written to the report; the node succeeds.
    ReportOnly,
}

#[derive(Debug, Clone)]
pub struct TestParams {
    pub args: Vec<String>,
    /// Working directory of the test binary, relative to the build root.
    pub cwd: PathBuf,
    pub on_failure: TestFailurePolicy,
}

/// A free-form command; "$in" and "$out" arguments expand to the node's
/// input and output paths.
#[derive(Debug, Clone)]
pub struct CommandParams {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum AdapterKind {
    Compile(CompileParams),
    Link(LinkParams),
    ImageConvert(ImageParams),
    PartitionGen(PartitionParams),
    Flash(FlashParams),
    TestRun(TestParams),
    Command(CommandParams),
}

/// The resolved paths of one node, as its action sees them.  Outputs may be
/// staging paths rather than the declared ones.
pub struct NodePaths {
    pub ins: Vec<(ResourceKind, PathBuf)>,
    pub outs: Vec<PathBuf>,
}

impl NodePaths {
    fn nth_in(&self, n: usize) -> &Path {
        &self.ins[n].1
    }

    fn ins_of<'a>(&'a self, kinds: &'a [ResourceKind]) -> impl Iterator<Item = &'a Path> + 'a {
        self.ins
            .iter()
            .filter(move |(kind, _)| kinds.contains(kind))
            .map(|(_, path)| path.as_path())
    }

    fn out(&self) -> &Path {
        &self.outs[0]
    }
}

fn push_all(args: &mut Vec<OsString>, strs: &[String]) {
    args.extend(strs.iter().map(OsString::from));
}

impl AdapterKind {
    /// Logical name of the executable this step runs, resolved through the
    /// scope's helper table.
    pub fn helper(&self) -> &str {
        match self {
            AdapterKind::Compile(p) => match p.language {
                Language::C => "c-compiler",
                Language::Cxx => "c++-compiler",
            },
            AdapterKind::Link(_) => "linker",
            AdapterKind::ImageConvert(_) => "image-tool",
            AdapterKind::PartitionGen(_) => "partition-tool",
            AdapterKind::Flash(_) => "flash-tool",
            AdapterKind::TestRun(_) => "test-binary",
            AdapterKind::Command(p) => &p.program,
        }
    }

    /// Working directory relative to the build root, if not the root itself.
    pub fn cwd(&self) -> Option<&Path> {
        match self {
            AdapterKind::TestRun(p) => Some(&p.cwd),
            _ => None,
        }
    }

    /// Whether the program writes the node's outputs itself.  A test run's
    /// report is written from the captured output instead.
    pub fn writes_outputs(&self) -> bool {
        !matches!(self, AdapterKind::TestRun(_))
    }

    /// Where the step writes the headers it read, given where it writes its
    /// object.  Only compiles have one.
    pub fn depfile(&self, out: &Path) -> Option<PathBuf> {
        match self {
            AdapterKind::Compile(_) => {
                let mut path = out.as_os_str().to_owned();
                path.push(".d");
                Some(PathBuf::from(path))
            }
            _ => None,
        }
    }

    /// Check that declared inputs and outputs have the shape args() reads.
    pub fn check_arity(&self, ins: &[Resource], outs: &[Resource]) -> Result<(), String> {
        let step = match self {
            AdapterKind::Compile(_) => "compile",
            AdapterKind::Link(_) => "link",
            AdapterKind::ImageConvert(_) => "image conversion",
            AdapterKind::PartitionGen(_) => "partition table",
            AdapterKind::Flash(_) => "flash",
            AdapterKind::TestRun(_) => "test run",
            AdapterKind::Command(_) => return Ok(()),
        };
        match self {
            AdapterKind::Compile(_) => {
                let first = ins.first().map(|r| r.kind);
                let sources = ins.iter().filter(|r| r.kind == ResourceKind::Source);
                if first != Some(ResourceKind::Source) || sources.count() != 1 {
                    return Err(format!("{} takes exactly one source, declared first", step));
                }
            }
            AdapterKind::Link(_) => {
                let linkable = [ResourceKind::Object, ResourceKind::Archive];
                if !ins.iter().any(|r| linkable.contains(&r.kind)) {
                    return Err(format!("{} takes at least one object or archive", step));
                }
            }
            AdapterKind::Flash(_) => {
                if ins.len() != 4 {
                    return Err(format!("{} takes 4 images, got {}", step, ins.len()));
                }
                return Ok(());
            }
            _ => {
                if ins.is_empty() {
                    return Err(format!("{} takes at least one input", step));
                }
            }
        }
        if outs.len() != 1 {
            return Err(format!("{} writes exactly one output, got {}", step, outs.len()));
        }
        Ok(())
    }

    pub fn args(&self, paths: &NodePaths) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match self {
            AdapterKind::Compile(p) => {
                push_all(&mut args, &p.flags);
                if let Some(dialect) = &p.dialect {
                    args.push(format!("-std={}", dialect).into());
                }
                for (name, value) in &p.defines {
                    args.push(match value {
                        Some(value) => format!("-D{}={}", name, value).into(),
                        None => format!("-D{}", name).into(),
                    });
                }
                for dir in &p.include_dirs {
                    args.push(format!("-I{}", to_slash(dir)).into());
                }
                if let Some(depfile) = self.depfile(paths.out()) {
                    args.push("-MMD".into());
                    args.push("-MF".into());
                    args.push(depfile.into());
                }
                args.push("-c".into());
                args.push(paths.nth_in(0).into());
                args.push("-o".into());
                args.push(paths.out().into());
            }
            AdapterKind::Link(p) => {
                push_all(&mut args, &p.flags);
                for dir in &p.search_dirs {
                    args.push(format!("-L{}", to_slash(dir)).into());
                }
                if p.group {
                    args.push("-Wl,--start-group".into());
                }
                args.extend(
                    paths
                        .ins_of(&[ResourceKind::Object, ResourceKind::Archive])
                        .map(OsString::from),
                );
                for lib in &p.libraries {
                    args.push(format!("-l{}", lib).into());
                }
                if p.group {
                    args.push("-Wl,--end-group".into());
                }
                args.push("-o".into());
                args.push(paths.out().into());
            }
            AdapterKind::ImageConvert(p) => {
                push_all(&mut args, &p.args);
                args.push("-o".into());
                args.push(paths.out().into());
                args.push(paths.nth_in(0).into());
            }
            AdapterKind::PartitionGen(p) => {
                if let Some(script) = &p.script {
                    args.push(script.into());
                }
                push_all(&mut args, &p.args);
                args.push(paths.nth_in(0).into());
                args.push(paths.out().into());
            }
            AdapterKind::Flash(p) => {
                push_all(&mut args, &p.args);
                // Inputs are declared as firmware, partitions, bootloader, boot stub.
                let o = &p.offsets;
                for (offset, n) in [
                    (&o.boot_app, 3),
                    (&o.bootloader, 2),
                    (&o.firmware, 0),
                    (&o.partitions, 1),
                ] {
                    args.push(offset.into());
                    args.push(paths.nth_in(n).into());
                }
            }
            AdapterKind::TestRun(p) => push_all(&mut args, &p.args),
            AdapterKind::Command(p) => {
                for arg in &p.args {
                    match arg.as_str() {
                        "$in" => args.extend(paths.ins.iter().map(|(_, p)| p.into())),
                        "$out" => args.extend(paths.outs.iter().map(OsString::from)),
                        _ => args.push(arg.into()),
                    }
                }
            }
        }
        args
    }
}

/// A compile node: one source in, one object out.  Include directories are
/// declared as optional inputs so adding headers to them is noticed; the
/// headers actually read come back through the depfile.
pub fn compile(params: CompileParams, source: &Path, object: &Path) -> NodeSpec {
    let dirs: Vec<Resource> = params
        .include_dirs
        .iter()
        .map(|d| Resource::optional(ResourceKind::Directory, d))
        .collect();
    NodeSpec::new(AdapterKind::Compile(params))
        .desc(format!("compile {}", to_slash(source)))
        .input(Resource::required(ResourceKind::Source, source))
        .inputs(dirs)
        .output(Resource::required(ResourceKind::Object, object))
}

pub fn link(params: LinkParams, objects: &[PathBuf], output: &Path) -> NodeSpec {
    let dirs: Vec<Resource> = params
        .search_dirs
        .iter()
        .map(|d| Resource::optional(ResourceKind::Directory, d))
        .collect();
    NodeSpec::new(AdapterKind::Link(params))
        .desc(format!("link {}", to_slash(output)))
        .inputs(objects.iter().map(|o| {
            let kind = match o.extension().and_then(|e| e.to_str()) {
                Some("a") => ResourceKind::Archive,
                _ => ResourceKind::Object,
            };
            Resource::required(kind, o)
        }))
        .inputs(dirs)
        .output(Resource::required(ResourceKind::Executable, output))
}

pub fn image_convert(params: ImageParams, elf: &Path, image: &Path) -> NodeSpec {
    NodeSpec::new(AdapterKind::ImageConvert(params))
        .desc(format!("image {}", to_slash(image)))
        .input(Resource::required(ResourceKind::Executable, elf))
        .output(Resource::required(ResourceKind::Image, image))
}

pub fn partition_gen(params: PartitionParams, layout: &Path, table: &Path) -> NodeSpec {
    let script = params
        .script
        .clone()
        .map(|s| Resource::optional(ResourceKind::Source, s));
    NodeSpec::new(AdapterKind::PartitionGen(params))
        .desc(format!("partition table {}", to_slash(table)))
        .input(Resource::required(ResourceKind::Descriptor, layout))
        .inputs(script)
        .output(Resource::required(ResourceKind::Image, table))
}

pub fn flash(
    params: FlashParams,
    firmware: &Path,
    partitions: &Path,
    bootloader: &Path,
    boot_app: &Path,
) -> NodeSpec {
    NodeSpec::new(AdapterKind::Flash(params))
        .label("flash")
        .desc(format!("flash {}", to_slash(firmware)))
        .input(Resource::required(ResourceKind::Image, firmware))
        .input(Resource::required(ResourceKind::Image, partitions))
        .input(Resource::required(ResourceKind::Image, bootloader))
        .input(Resource::required(ResourceKind::Image, boot_app))
}

pub fn test_run(params: TestParams, binary: &Path, report: &Path) -> NodeSpec {
    NodeSpec::new(AdapterKind::TestRun(params))
        .desc(format!("test {}", to_slash(binary)))
        .input(Resource::required(ResourceKind::Executable, binary))
        .output(Resource::required(ResourceKind::Report, report))
}
