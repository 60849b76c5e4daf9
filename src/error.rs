//! Build error taxonomy.
//!
//! Configuration problems are detected while the graph is declared and never
//! retried.  Everything else surfaces from a scope run, naming the failing
//! node by its declared outputs (or label).

use crate::process::Termination;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{path}: declared as output of both {first} and {second}")]
    DuplicateOutput {
        path: String,
        first: String,
        second: String,
    },

    #[error("label {0:?} declared by two nodes")]
    DuplicateLabel(String),

    #[error("{node}: input {path} is missing and no node produces it")]
    MissingInput { node: String, path: String },

    #[error("node has neither outputs nor a label to identify it")]
    Unidentified,

    #[error("{0}")]
    Invalid(String),
}

/// How a failed action ended, plus whatever it printed.
#[derive(Debug)]
pub struct ExitDetail {
    pub termination: Termination,
    pub code: Option<i32>,
    pub output: String,
}

impl std::fmt::Display for ExitDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.termination, self.code) {
            (Termination::Interrupted, _) => write!(f, "interrupted")?,
            (_, Some(code)) => write!(f, "failed with exit status {}", code)?,
            (_, None) => write!(f, "failed")?,
        }
        let output = self.output.trim_end();
        if !output.is_empty() {
            write!(f, "\n{}", output)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("{node}: {detail}")]
    ActionFailed { node: String, detail: ExitDetail },

    #[error("{node}: publishing {path} aborted: {source}")]
    PublishAborted {
        node: String,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{node}: not run because {dependency} failed")]
    DependencyFailed { node: String, dependency: String },

    #[error("interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BuildError {
    /// Whether this failure came from running (or publishing) an action, as
    /// opposed to a problem found before anything ran.
    pub fn is_action_failure(&self) -> bool {
        matches!(
            self,
            BuildError::ActionFailed { .. } | BuildError::PublishAborted { .. }
        )
    }
}
