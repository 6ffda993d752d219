//! # Snippet Execution
//!
//! Runs untrusted Python snippets in a disposable, resource-bounded process
//! and maps the outcome onto a stable `{ success, output }` contract.

mod cgroup;
mod error;
mod languages;
mod mapper;
mod request;
mod sandbox;
mod service;
mod types;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use languages::{LanguageExecutor, PythonExecutor};
pub use mapper::{to_response, RunResponse};
pub use request::{ExecutionRequest, ValidationError};
pub use sandbox::Sandbox;
pub use service::CodeExecutionService;
pub use types::{
    CapturedOutput, ExecutionResult, ExitReason, LimitExceeded, RequestLimits, ResourceLimits,
    RetryPolicy, RunAs, ServiceConfig,
};

/// Result type for code execution operations
pub type Result<T> = std::result::Result<T, Error>;
