use crate::corpus::CorpusError;
use thiserror::Error;

/// Errors surfaced by engine operations.
///
/// Crashes found while fuzzing are not errors; they are reported through
/// [`crate::FuzzResult::crashes`]. Merge-back failures are recovered inside the
/// fuzz session and never reach the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A phase exceeded its time budget. The message names the phase.
    #[error("{0}")]
    Timeout(&'static str),

    /// The merge process exited with a non-zero code.
    #[error("Merging new testcases failed with exit code {return_code}")]
    Merge { return_code: i32 },

    /// The target process could not be started at all.
    #[error("Failed to spawn command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected engine behavior detected from process output or exit codes.
    #[error("Engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Corpus(#[from] CorpusError),

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
