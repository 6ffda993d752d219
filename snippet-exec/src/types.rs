use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Why an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Process exited with status 0
    Completed,
    /// Process exited with a non-zero status or was killed by a signal it did not owe to a limit
    NonZeroExit,
    /// Wall-clock timeout elapsed and the process group was killed
    Timeout,
    /// Resource ceiling hit or another failure not attributable to the code's own logic
    InternalError,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::Completed => "completed",
            ExitReason::NonZeroExit => "non_zero_exit",
            ExitReason::Timeout => "timeout",
            ExitReason::InternalError => "internal_error",
        };
        f.write_str(s)
    }
}

/// Resource ceiling that terminated an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitExceeded {
    Memory,
    CpuTime,
    FileSize,
}

impl fmt::Display for LimitExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitExceeded::Memory => "memory",
            LimitExceeded::CpuTime => "cpu time",
            LimitExceeded::FileSize => "file size",
        };
        f.write_str(s)
    }
}

/// Raw stream capture of one execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

/// Outcome of running one [`ExecutionRequest`](crate::ExecutionRequest)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// True iff `exit_reason` is [`ExitReason::Completed`]
    pub success: bool,
    /// Program output (stdout)
    pub stdout: String,
    /// Program errors (stderr)
    pub stderr: String,
    pub exit_reason: ExitReason,
    /// Exit code, absent when the process was killed by a signal
    pub exit_code: Option<i32>,
    /// Set only together with [`ExitReason::InternalError`]
    pub limit_exceeded: Option<LimitExceeded>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Wall-clock time from spawn to reap
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Builds a result whose `success` flag agrees with its exit reason.
    ///
    /// `Completed` is downgraded to `NonZeroExit` when the exit code is not 0.
    pub fn new(
        exit_reason: ExitReason,
        exit_code: Option<i32>,
        output: CapturedOutput,
        elapsed: Duration,
    ) -> Self {
        let exit_reason = match (exit_reason, exit_code) {
            (ExitReason::Completed, Some(0)) => ExitReason::Completed,
            (ExitReason::Completed, _) => ExitReason::NonZeroExit,
            (reason, _) => reason,
        };

        Self {
            success: exit_reason == ExitReason::Completed,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_reason,
            exit_code,
            limit_exceeded: None,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            elapsed,
        }
    }

    /// Marks the execution as terminated by a resource ceiling.
    pub fn resource_exhausted(
        limit: LimitExceeded,
        exit_code: Option<i32>,
        output: CapturedOutput,
        elapsed: Duration,
    ) -> Self {
        let mut result = Self::new(ExitReason::InternalError, exit_code, output, elapsed);
        result.limit_exceeded = Some(limit);
        result
    }
}

/// Resource limits for code execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum CPU time (seconds)
    pub cpu_time: u32,
    /// Maximum address space (bytes)
    pub memory: u64,
    /// Maximum number of processes: `pids.max` of the run's cgroup, or
    /// RLIMIT_NPROC of a dedicated `run_as` uid when there is no cgroup
    pub processes: u32,
    /// Maximum size of any file the code writes (bytes)
    pub file_size: u64,
    /// Maximum captured bytes per output stream
    pub max_output: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: 10,
            memory: 512 * 1024 * 1024, // 512MB
            processes: 64,
            file_size: 10 * 1024 * 1024, // 10MB
            max_output: 1024 * 1024,     // 1MB
        }
    }
}

/// Bounds applied while validating incoming requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(5000),
            max_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Unprivileged identity the sandboxed process switches to before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Retry policy for host-side spawn failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Everything the execution service needs, passed explicitly at construction
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub limits: ResourceLimits,
    pub request_limits: RequestLimits,
    /// Maximum number of sandboxes alive at once, at least one
    pub max_concurrent_executions: usize,
    /// How long a request may wait for a free slot; `None` waits indefinitely
    pub queue_timeout: Option<Duration>,
    pub retry: RetryPolicy,
    /// Interpreter binary, resolved through `PATH` when not absolute
    pub interpreter: String,
    /// Parent directory for per-execution scratch directories
    pub work_dir: PathBuf,
    pub run_as: Option<RunAs>,
    /// Place each execution in a fresh network namespace (needs CAP_SYS_ADMIN)
    pub isolate_network: bool,
    /// Delegated cgroup v2 directory; each execution gets a child cgroup under it
    pub cgroup_root: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            request_limits: RequestLimits::default(),
            max_concurrent_executions: 10,
            queue_timeout: Some(Duration::from_secs(10)),
            retry: RetryPolicy::default(),
            interpreter: "python3".to_string(),
            work_dir: std::env::temp_dir(),
            run_as: None,
            isolate_network: false,
            cgroup_root: None,
        }
    }
}

impl ServiceConfig {
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_request_limits(mut self, request_limits: RequestLimits) -> Self {
        self.request_limits = request_limits;
        self
    }

    pub fn with_max_concurrent_executions(mut self, max: usize) -> Self {
        self.max_concurrent_executions = max;
        self
    }

    pub fn with_queue_timeout(mut self, queue_timeout: Option<Duration>) -> Self {
        self.queue_timeout = queue_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_run_as(mut self, run_as: Option<RunAs>) -> Self {
        self.run_as = run_as;
        self
    }

    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    pub fn with_cgroup_root(mut self, cgroup_root: Option<PathBuf>) -> Self {
        self.cgroup_root = cgroup_root;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
