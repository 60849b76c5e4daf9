use crate::config::{self, Config};
use crate::db::ManifestOracle;
use crate::error::BuildError;
use crate::fs::RealFileSystem;
use crate::pipeline::{self, Bounds};
use crate::process::SubprocessRunner;
use crate::progress::ConsoleProgress;
use crate::work::Session;
use crate::{interrupt, tools, trace};
use anyhow::anyhow;
use argh::FromArgs;
use std::path::{Path, PathBuf};

/// an incremental cross-compiling firmware builder
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<PathBuf>,

    /// build description [default=xforge.toml]
    #[argh(option, short = 'f')]
    file: Option<PathBuf>,

    /// run at most N actions at once in every scope
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// build and run the host tests even if [test] is disabled
    #[argh(switch)]
    test: bool,

    /// skip the host tests
    #[argh(switch)]
    no_test: bool,

    /// print executed command lines
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools, use -d list to list
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// subcommands, use -t list to list
    #[argh(option, short = 't')]
    tool: Option<String>,
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("XFORGE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Load the description, forcing the test branch on or off as asked.
fn load_config(path: &Path, args: &Args) -> anyhow::Result<(Config, bool)> {
    if args.test && args.no_test {
        anyhow::bail!("--test and --no-test are exclusive");
    }
    let mut config = Config::load(path)?;
    let with_test = match (&mut config.test, args.test, args.no_test) {
        (_, _, true) => false,
        (Some(test), true, _) => {
            test.enabled = true;
            true
        }
        (None, true, _) => anyhow::bail!("--test given but {} has no [test]", path.display()),
        (Some(test), false, _) => test.enabled,
        (None, false, _) => false,
    };
    Ok((config, with_test))
}

fn run_tool(
    tool: &str,
    pipeline: &pipeline::Pipeline,
    root: &Path,
    db: &Path,
) -> anyhow::Result<i32> {
    match tool {
        "clean" => {
            let n = tools::clean(pipeline, root, db)?;
            println!("xforge: removed {} files", n);
        }
        "commands" => {
            for cmdline in tools::commands(pipeline, root) {
                println!("{}", cmdline);
            }
        }
        "compdb" => {
            let n = tools::compdb(pipeline, root)?;
            println!("xforge: wrote {} entries to compile_commands.json", n);
        }
        _ => anyhow::bail!("unknown -t {:?}, use -t list to list", tool),
    }
    Ok(0)
}

fn run_impl() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    init_logging();

    if let Some(debug) = &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => anyhow::bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }
    if args.tool.as_deref() == Some("list") {
        tools::list();
        return Ok(1);
    }
    if args.jobs == Some(0) {
        anyhow::bail!("invalid -j 0: need at least one job");
    }

    if let Some(dir) = &args.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    let root = std::env::current_dir()?;

    let config_path = root.join(args.file.as_deref().unwrap_or(Path::new(config::DEFAULT_FILE)));
    let (config, with_test) = load_config(&config_path, &args)?;
    let db_path = root.join(config.build.db_path());

    let fs = RealFileSystem::new(&root);
    let pipeline = trace::scope("declare", || {
        pipeline::declare(&config, &root, &fs, with_test)
    })?;
    tracing::info!(
        "declared {} nodes in {} branches",
        pipeline.graph.nodes.len(),
        pipeline.branches.len()
    );

    if let Some(tool) = &args.tool {
        return run_tool(tool, &pipeline, &root, &db_path);
    }

    interrupt::register_sigint();
    let oracle = ManifestOracle::load(RealFileSystem::new(&root), &db_path)?;
    let runner = SubprocessRunner;
    let session = Session::new(
        &pipeline.graph,
        &root,
        &oracle,
        &runner,
        Box::new(ConsoleProgress::new(args.verbose)),
    );
    let bounds = Bounds::new(&config, args.jobs);
    let top = session.context("xforge", bounds.default, pipeline.helpers.clone());
    let result = trace::scope("run", || pipeline::run(&top, &pipeline.branches, bounds));

    // Whatever finished is recorded, even when the build as a whole failed.
    if let Err(err) = oracle.save(&db_path) {
        tracing::error!("{:#}", err);
    }

    match result {
        Ok(_) => {
            match session.tasks_run() {
                0 => println!("xforge: no work to do"),
                n => println!("xforge: ran {} tasks, now up to date", n),
            }
            Ok(0)
        }
        // The failing node and its output were already printed.
        Err(err) if err.is_action_failure() => Ok(1),
        Err(BuildError::Interrupted) => {
            println!("xforge: interrupted");
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    if let Err(err) = trace::close() {
        tracing::warn!("trace: {}", err);
    }
    res
}
