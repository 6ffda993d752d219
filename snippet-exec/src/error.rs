use thiserror::Error;

use crate::request::ValidationError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Missing required tools: {0}")]
    MissingTool(String),

    #[error("Execution capacity exhausted")]
    Overloaded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Host-side failures that may succeed when attempted again.
    ///
    /// Anything the submitted code does is reported through
    /// [`ExecutionResult`](crate::ExecutionResult) and never lands here.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Spawn(_))
    }
}
