//! Interpreter-specific executor implementations

mod python;

pub use python::PythonExecutor;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{error::Error, types::LimitExceeded};

/// Trait for interpreter-specific code executors
#[async_trait]
pub trait LanguageExecutor: Send + Sync {
    /// Name of the source file written into the sandbox directory
    fn source_file_name(&self) -> &str;

    /// Absolute path of the interpreter binary
    fn run_command(&self) -> &Path;

    /// Arguments passed to the interpreter
    fn run_args(&self) -> Vec<String>;

    /// Extra environment variables for the sandboxed process
    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Write the submitted code into the sandbox directory
    async fn write_source(&self, sandbox_dir: &Path, code: &str) -> Result<PathBuf, Error> {
        let path = sandbox_dir.join(self.source_file_name());
        fs::write(&path, code)
            .await
            .map_err(|e| Error::Sandbox(format!("Failed to write source file: {}", e)))?;
        Ok(path)
    }

    /// Recognize an interpreter-level report of resource exhaustion in stderr
    fn detect_resource_exhaustion(&self, stderr: &str) -> Option<LimitExceeded>;
}

/// Resolve a tool through `PATH` unless it is already a path
pub(crate) fn resolve_tool(tool: &str) -> Result<PathBuf, Error> {
    let candidate = Path::new(tool);
    if candidate.is_absolute() {
        if candidate.is_file() {
            return Ok(candidate.to_path_buf());
        }
        return Err(Error::MissingTool(tool.to_string()));
    }

    which::which(tool).map_err(|_| Error::MissingTool(tool.to_string()))
}
