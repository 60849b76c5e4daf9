//! Build progress reporting, for the purpose of display to the user.

use crate::error::BuildError;
use crate::graph::NodeId;
use crate::task::NodeOutcome;
use std::io::Write;

/// Trait for build progress notifications.  Called only from the threads
/// that dispatch scopes, never from inside a running action.
pub trait Progress {
    /// Called when a node finishes without error, whether or not it ran.
    fn task_finished(&mut self, id: NodeId, message: &str, outcome: &NodeOutcome);

    /// Called when a node fails.
    fn task_failed(&mut self, id: NodeId, message: &str, err: &BuildError);

    /// Log a line of output.
    fn log(&mut self, msg: &str);
}

/// Progress implementation for "dumb" console, without any overprinting.
/// Prints one line per node that actually ran.
#[derive(Default)]
pub struct ConsoleProgress {
    /// Whether to print command lines of started programs.
    verbose: bool,
}

impl ConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        ConsoleProgress { verbose }
    }
}

impl Progress for ConsoleProgress {
    fn task_finished(&mut self, _id: NodeId, message: &str, outcome: &NodeOutcome) {
        if !outcome.ran {
            return;
        }
        self.log(if self.verbose {
            &outcome.cmdline
        } else {
            message
        });
        if !outcome.output.is_empty() {
            let mut stdout = std::io::stdout().lock();
            // A closed stdout is not worth failing the build over.
            let _ = stdout.write_all(&outcome.output);
        }
    }

    fn task_failed(&mut self, _id: NodeId, message: &str, err: &BuildError) {
        match err {
            BuildError::Interrupted => self.log(&format!("interrupted: {}", message)),
            _ => {
                self.log(&format!("failed: {}", message));
                self.log(&err.to_string());
            }
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}
