//! Subprocess execution.
//!
//! A Runner takes a fully resolved invocation and blocks until the child
//! exits.  Scheduling, staging and staleness all live elsewhere; tests swap in
//! runners that never spawn anything.

use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// A program, its argument vector and its working directory.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
}

impl Invocation {
    /// Command line for display, with arguments quoted where a shell would
    /// need it.
    pub fn cmdline(&self) -> String {
        let mut line = quote(&self.program.to_string_lossy());
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(&arg.to_string_lossy()));
        }
        line
    }
}

fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=+,:@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// The result of executing one invocation.
#[derive(Debug)]
pub struct TaskResult {
    pub termination: Termination,
    /// Exit code, when the child exited rather than died by signal.
    pub code: Option<i32>,
    /// Console output, stdout followed by stderr.
    pub output: Vec<u8>,
}

impl TaskResult {
    /// A failure that happened outside the child, e.g. the program was not
    /// found.
    pub fn spawn_failure(err: &anyhow::Error) -> Self {
        TaskResult {
            termination: Termination::Failure,
            code: None,
            output: format!("{:#}", err).into_bytes(),
        }
    }
}

pub trait Runner: Sync {
    /// Run to completion.  Err means the process could not be run at all.
    fn run(&self, invocation: &Invocation) -> anyhow::Result<TaskResult>;
}

/// Runs invocations as real child processes.
pub struct SubprocessRunner;

impl Runner for SubprocessRunner {
    fn run(&self, invocation: &Invocation) -> anyhow::Result<TaskResult> {
        let cmd = std::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(std::process::Stdio::null())
            .output()
            .map_err(|err| {
                anyhow::anyhow!("spawn {}: {}", invocation.program.display(), err)
            })?;
        let mut output = cmd.stdout;
        output.extend_from_slice(&cmd.stderr);

        let mut termination = Termination::Success;
        if !cmd.status.success() {
            termination = Termination::Failure;
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match cmd.status.signal() {
                    Some(libc::SIGINT) => {
                        output.extend_from_slice(b"interrupted");
                        termination = Termination::Interrupted;
                    }
                    Some(sig) => output.extend_from_slice(format!("signal {}", sig).as_bytes()),
                    None => {}
                }
            }
        }

        Ok(TaskResult {
            termination,
            code: cmd.status.code(),
            output,
        })
    }
}
