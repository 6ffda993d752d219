use std::sync::Arc;
use tokio::{
    sync::{Semaphore, SemaphorePermit},
    time,
};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    cgroup,
    error::Error,
    languages::{LanguageExecutor, PythonExecutor},
    request::{ExecutionRequest, ValidationError},
    sandbox::Sandbox,
    types::{ExecutionResult, ServiceConfig},
};

/// Admission control plus one fresh [`Sandbox`] per execution
#[derive(Clone)]
pub struct CodeExecutionService {
    executor: Arc<dyn LanguageExecutor>,
    semaphore: Arc<Semaphore>,
    config: Arc<ServiceConfig>,
}

impl CodeExecutionService {
    /// Build a service running Python through `config.interpreter`
    pub fn new(config: ServiceConfig) -> Result<Self, Error> {
        let executor = PythonExecutor::new(&config.interpreter)?;

        match (&config.cgroup_root, config.run_as) {
            (Some(root), _) => cgroup::enable_controllers(root)?,
            (None, Some(_)) => warn!(
                "No cgroup root configured, runs under the same uid share one process budget"
            ),
            (None, None) => warn!(
                "No cgroup root or run_as identity configured, process count is not limited"
            ),
        }

        Ok(Self::with_executor(config, Arc::new(executor)))
    }

    pub fn with_executor(config: ServiceConfig, executor: Arc<dyn LanguageExecutor>) -> Self {
        // Zero permits would park every request forever
        let slots = config.max_concurrent_executions.max(1);
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(slots)),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Validate a raw request body against this service's request limits
    pub fn validate(&self, raw: &[u8]) -> Result<ExecutionRequest, ValidationError> {
        ExecutionRequest::validate(raw, &self.config.request_limits)
    }

    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, Error> {
        let _permit = self.admit().await?;

        let span = info_span!("execution", id = %Uuid::new_v4());
        async move {
            debug!(
                "Starting execution: {} bytes of code, {} bytes of input, timeout {:?}",
                request.code.len(),
                request.stdin.len(),
                request.timeout
            );

            let result = self.execute_with_retry(&request).await;

            match &result {
                Ok(result) => info!(
                    "Code execution finished: {} in {:?}",
                    result.exit_reason, result.elapsed
                ),
                Err(e) => error!("Code execution failed: {}", e),
            }

            result
        }
        .instrument(span)
        .await
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    async fn admit(&self) -> Result<SemaphorePermit<'_>, Error> {
        let acquire = self.semaphore.acquire();
        let permit = match self.config.queue_timeout {
            Some(wait) => time::timeout(wait, acquire).await.map_err(|_| {
                warn!("No execution slot freed up within {:?}", wait);
                Error::Overloaded
            })?,
            None => acquire.await,
        };

        permit.map_err(|e| Error::Sandbox(format!("Failed to acquire execution permit: {}", e)))
    }

    /// Code-level outcomes are final; only transient host failures are attempted again
    async fn execute_with_retry(&self, request: &ExecutionRequest) -> Result<ExecutionResult, Error> {
        let retry = self.config.retry;
        let mut attempt = 1;

        loop {
            match self.run_once(request).await {
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    warn!("Attempt {} failed, retrying: {}", attempt, e);
                    time::sleep(retry.backoff * attempt).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn run_once(&self, request: &ExecutionRequest) -> Result<ExecutionResult, Error> {
        let sandbox = Sandbox::new(&self.config)?;
        sandbox.run(self.executor.as_ref(), request).await
    }
}
