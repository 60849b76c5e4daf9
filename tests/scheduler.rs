//! Scheduler tests against an in-memory filesystem, a fake runner and a
//! memory-backed oracle.  Outputs are published into a temp directory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use xforge::adapter::{self, AdapterKind, CommandParams};
use xforge::db::{Freshness, Oracle, Query};
use xforge::densemap::Index;
use xforge::error::BuildError;
use xforge::fs::{FileSystem, MTime};
use xforge::graph::{Graph, NodeId, NodeSpec, Resource, ResourceKind};
use xforge::hash::Hash;
use xforge::helper::Helpers;
use xforge::process::{Invocation, Runner, TaskResult, Termination};
use xforge::task::NodeOutcome;
use xforge::work::{NodeState, Session};

/// Implementation of Progress that prints nothing.
struct NoProgress;

impl xforge::progress::Progress for NoProgress {
    fn task_finished(&mut self, _id: NodeId, _message: &str, _outcome: &NodeOutcome) {}
    fn task_failed(&mut self, _id: NodeId, _message: &str, _err: &BuildError) {}
    fn log(&mut self, _msg: &str) {}
}

/// Files that exist before the build; everything else is missing.
struct TestFileSystem {
    present: HashSet<PathBuf>,
}

impl TestFileSystem {
    fn with(paths: &[&str]) -> Self {
        TestFileSystem {
            present: paths.iter().map(PathBuf::from).collect(),
        }
    }
}

impl FileSystem for TestFileSystem {
    fn stat(&self, path: &Path) -> std::io::Result<MTime> {
        Ok(if self.present.contains(path) {
            MTime::Stamp(std::time::UNIX_EPOCH)
        } else {
            MTime::Missing
        })
    }
}

/// Current once recorded with the same fingerprint.
#[derive(Default)]
struct MemoryOracle {
    hashes: Mutex<HashMap<String, Hash>>,
}

impl Oracle for MemoryOracle {
    fn check(&self, query: &Query) -> anyhow::Result<Freshness> {
        Ok(match self.hashes.lock().unwrap().get(query.key) {
            Some(hash) if *hash == query.fingerprint => Freshness::Current,
            _ => Freshness::Stale,
        })
    }

    fn record(&self, query: &Query, _discovered: &[PathBuf]) -> anyhow::Result<()> {
        self.hashes
            .lock()
            .unwrap()
            .insert(query.key.to_string(), query.fingerprint);
        Ok(())
    }
}

fn ok() -> TaskResult {
    TaskResult {
        termination: Termination::Success,
        code: Some(0),
        output: Vec::new(),
    }
}

fn failed(output: &str) -> TaskResult {
    TaskResult {
        termination: Termination::Failure,
        code: Some(1),
        output: output.as_bytes().to_vec(),
    }
}

/// A node running `step <name> $in`, reading `inputs` and writing
/// `out/<name>`.
fn step(name: &str, inputs: &[PathBuf]) -> NodeSpec {
    NodeSpec::new(AdapterKind::Command(CommandParams {
        program: "step".into(),
        args: vec![name.into(), "$in".into()],
    }))
    .inputs(
        inputs
            .iter()
            .map(|p| Resource::required(ResourceKind::Object, p)),
    )
    .output(Resource::required(
        ResourceKind::Object,
        format!("out/{}", name),
    ))
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

/// Records start and end of every step, sleeping a pseudo-random while in
/// between.
struct Recorder {
    seed: u64,
    events: Mutex<Vec<(String, bool)>>,
}

impl Runner for Recorder {
    fn run(&self, inv: &Invocation) -> anyhow::Result<TaskResult> {
        let name = inv.args[0].to_string_lossy().into_owned();
        self.events.lock().unwrap().push((name.clone(), true));
        let salt = name.bytes().fold(self.seed, |h, b| xorshift(h ^ b as u64));
        std::thread::sleep(Duration::from_micros(xorshift(salt) % 400));
        self.events.lock().unwrap().push((name, false));
        Ok(ok())
    }
}

#[test]
fn dependency_order_holds_under_random_timing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = TestFileSystem::with(&[]);
    let mut graph = Graph::new();
    let mut rng = 0x2545f4914f6cdd1d_u64;
    let mut outs: Vec<PathBuf> = Vec::new();
    for i in 0..16 {
        let mut inputs = Vec::new();
        for _ in 0..3 {
            rng = xorshift(rng);
            if !outs.is_empty() && rng % 3 != 0 {
                let pick = outs[(rng as usize / 3) % outs.len()].clone();
                if !inputs.contains(&pick) {
                    inputs.push(pick);
                }
            }
        }
        let name = format!("n{}", i);
        graph.declare(&fs, step(&name, &inputs))?;
        outs.push(PathBuf::from(format!("out/{}", name)));
    }
    let all: Vec<NodeId> = graph.nodes.ids().collect();

    for trial in 0..100u64 {
        let runner = Recorder {
            seed: xorshift(trial + 1),
            events: Mutex::new(Vec::new()),
        };
        let oracle = MemoryOracle::default();
        let session = Session::new(&graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
        let ctx = session.context("order", 4, Helpers::new());
        let summary = ctx.run(&all)?;
        assert_eq!(summary.ran, all.len());

        let events = runner.events.lock().unwrap().clone();
        let at = |name: &str, start: bool| {
            events
                .iter()
                .position(|(n, s)| n == name && *s == start)
                .unwrap()
        };
        for &id in &all {
            let name = format!("n{}", id.index());
            for producer in graph.producers(id) {
                let producer = format!("n{}", producer.index());
                assert!(
                    at(&producer, false) < at(&name, true),
                    "trial {}: {} started before {} finished",
                    trial,
                    name,
                    producer
                );
            }
        }
    }
    Ok(())
}

/// Tracks how many actions are running at once.
#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Runner for Gauge {
    fn run(&self, _inv: &Invocation) -> anyhow::Result<TaskResult> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ok())
    }
}

#[test]
fn concurrency_bound_is_respected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = TestFileSystem::with(&[]);
    let mut graph = Graph::new();
    let ids = (0..24)
        .map(|i| graph.declare(&fs, step(&format!("n{}", i), &[])))
        .collect::<Result<Vec<_>, _>>()?;

    let runner = Gauge::default();
    let oracle = MemoryOracle::default();
    let session = Session::new(&graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
    let ctx = session.context("bounded", 3, Helpers::new());
    assert_eq!(ctx.run(&ids)?.ran, 24);
    assert!(runner.peak.load(Ordering::SeqCst) <= 3);
    Ok(())
}

#[test]
fn second_invocation_does_nothing() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = TestFileSystem::with(&[]);
    let mut graph = Graph::new();
    let a = graph.declare(&fs, step("a", &[]))?;
    let b = graph.declare(&fs, step("b", &[PathBuf::from("out/a")]))?;
    let oracle = MemoryOracle::default();
    let runner = Gauge::default();

    let first = Session::new(&graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
    first.context("build", 2, Helpers::new()).run(&[b])?;
    assert_eq!(first.tasks_run(), 2);
    assert!(dir.path().join("out/b").exists());

    let second = Session::new(&graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
    let summary = second.context("build", 2, Helpers::new()).run(&[b])?;
    assert_eq!(second.tasks_run(), 0);
    assert_eq!(summary.current, 2);
    assert_eq!(second.state(a), NodeState::Done { ran: false });
    Ok(())
}

/// Fails every invocation of one program, remembering what was run.
struct FailProgram {
    fail: &'static str,
    ran: Mutex<Vec<String>>,
}

impl FailProgram {
    fn new(fail: &'static str) -> Self {
        FailProgram {
            fail,
            ran: Mutex::new(Vec::new()),
        }
    }

    fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }
}

impl Runner for FailProgram {
    fn run(&self, inv: &Invocation) -> anyhow::Result<TaskResult> {
        let program = inv.program.to_string_lossy().into_owned();
        self.ran.lock().unwrap().push(program.clone());
        if program == self.fail {
            return Ok(failed("undefined reference to `app_main'\n"));
        }
        // Compiles are asked for a depfile and must leave one.
        if let Some(at) = inv.args.iter().position(|a| a == "-MF") {
            std::fs::write(inv.cwd.join(&inv.args[at + 1]), "a.o: src/a.c\n")?;
        }
        Ok(ok())
    }
}

struct Firmware {
    graph: Graph,
    link: NodeId,
    image: NodeId,
    partition: NodeId,
    flash: NodeId,
}

fn firmware() -> anyhow::Result<Firmware> {
    let fs = TestFileSystem::with(&["src/a.c", "layout.csv", "bootloader.bin", "boot_app0.bin"]);
    let mut graph = Graph::new();
    graph.declare(
        &fs,
        adapter::compile(
            adapter::CompileParams {
                language: adapter::Language::C,
                dialect: None,
                defines: vec![],
                include_dirs: vec![],
                flags: vec![],
            },
            Path::new("src/a.c"),
            Path::new("build/a.c.o"),
        ),
    )?;
    let link = graph.declare(
        &fs,
        adapter::link(
            adapter::LinkParams {
                search_dirs: vec![],
                libraries: vec![],
                flags: vec![],
                group: false,
            },
            &[PathBuf::from("build/a.c.o")],
            Path::new("dist/fw"),
        ),
    )?;
    let image = graph.declare(
        &fs,
        adapter::image_convert(
            adapter::ImageParams { args: vec![] },
            Path::new("dist/fw"),
            Path::new("dist/fw.bin"),
        ),
    )?;
    let partition = graph.declare(
        &fs,
        adapter::partition_gen(
            adapter::PartitionParams {
                script: None,
                args: vec![],
            },
            Path::new("layout.csv"),
            Path::new("dist/parts.bin"),
        ),
    )?;
    let flash = graph.declare(
        &fs,
        adapter::flash(
            adapter::FlashParams {
                args: vec![],
                offsets: adapter::FlashOffsets::default(),
            },
            Path::new("dist/fw.bin"),
            Path::new("dist/parts.bin"),
            Path::new("bootloader.bin"),
            Path::new("boot_app0.bin"),
        ),
    )?;
    Ok(Firmware {
        graph,
        link,
        image,
        partition,
        flash,
    })
}

#[test]
fn link_failure_never_flashes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fw = firmware()?;
    let oracle = MemoryOracle::default();
    let runner = FailProgram::new("linker");
    let session = Session::new(&fw.graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
    let ctx = session.context("firmware", 2, Helpers::new());

    let err = ctx.run(&[fw.flash]).unwrap_err();
    assert!(matches!(err, BuildError::ActionFailed { .. }), "{}", err);
    let msg = err.to_string();
    assert!(msg.contains("dist/fw"), "{}", msg);
    assert!(msg.contains("undefined reference"), "{}", msg);

    let ran = runner.ran();
    assert!(!ran.iter().any(|p| p == "flash-tool" || p == "image-tool"));
    assert!(!dir.path().join("dist/fw").exists());
    assert_eq!(session.state(fw.link), NodeState::Failed);
    assert_eq!(session.state(fw.flash), NodeState::Unknown);
    // Partition generation does not depend on the link and may have finished.
    match session.state(fw.partition) {
        NodeState::Done { ran: true } => assert!(dir.path().join("dist/parts.bin").exists()),
        NodeState::Unknown => {}
        other => panic!("unexpected partition state {:?}", other),
    }

    // A later request for anything downstream names the failed producer.
    match ctx.run(&[fw.image]) {
        Err(BuildError::DependencyFailed { node, dependency }) => {
            assert_eq!(node, fw.graph.describe(fw.image));
            assert_eq!(dependency, fw.graph.describe(fw.link));
        }
        other => panic!("unexpected {:?}", other.map(|_| ())),
    }
    Ok(())
}

#[test]
fn first_failure_stops_dispatch() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let fs = TestFileSystem::with(&[]);
    let mut graph = Graph::new();
    let ids = (0..5)
        .map(|i| graph.declare(&fs, step(&format!("n{}", i), &[])))
        .collect::<Result<Vec<_>, _>>()?;
    let oracle = MemoryOracle::default();
    let runner = FailProgram::new("step");
    let session = Session::new(&graph, dir.path(), &oracle, &runner, Box::new(NoProgress));
    let ctx = session.context("serial", 1, Helpers::new());

    assert!(ctx.run(&ids).is_err());
    assert_eq!(runner.ran().len(), 1);
    let failed = ids
        .iter()
        .filter(|&&id| session.state(id) == NodeState::Failed)
        .count();
    let unknown = ids
        .iter()
        .filter(|&&id| session.state(id) == NodeState::Unknown)
        .count();
    assert_eq!((failed, unknown), (1, 4));
    Ok(())
}
