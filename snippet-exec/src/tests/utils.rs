pub mod defaults {
    use crate::{ResourceLimits, RetryPolicy, ServiceConfig};
    use std::path::Path;
    use tokio::time::Duration;

    pub fn default_test_limits() -> ResourceLimits {
        ResourceLimits {
            memory: 256 * 1024 * 1024, // 256MB
            cpu_time: 10,              // 10 seconds
            processes: 64,
            file_size: 1024 * 1024, // 1MB
            max_output: 64 * 1024,  // 64KB
        }
    }

    pub fn test_config(work_dir: &Path) -> ServiceConfig {
        ServiceConfig::default()
            .with_limits(default_test_limits())
            .with_work_dir(work_dir)
            .with_retry(RetryPolicy::none())
    }

    pub fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn short_timeout() -> Duration {
        Duration::from_millis(500)
    }
}

pub mod fixtures {
    use crate::{ExecutionRequest, PythonExecutor};
    use std::path::Path;

    use super::defaults::default_timeout;

    pub fn python() -> PythonExecutor {
        PythonExecutor::new("python3").expect("python3 must be installed to run these tests")
    }

    pub fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code).with_timeout(default_timeout())
    }

    /// Scratch directories left behind under `work_dir`
    pub fn leftover_entries(work_dir: &Path) -> usize {
        std::fs::read_dir(work_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}
