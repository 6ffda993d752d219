use clap::Parser;
use snippet_exec::{RequestLimits, ResourceLimits, RetryPolicy, RunAs, ServiceConfig};
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Maximum number of concurrent executions
    #[arg(
        short,
        long,
        default_value_t = 10,
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_concurrent: usize,

    /// How long a request may wait for a free execution slot (0 waits forever)
    #[arg(long, default_value_t = 10_000)]
    pub queue_timeout_ms: u64,

    /// Address space limit in bytes
    #[arg(long, default_value_t = 512 * 1024 * 1024)] // 512MB
    pub memory_limit: u64,

    /// CPU time limit in seconds
    #[arg(long, default_value_t = 10)]
    pub cpu_time_limit: u32,

    /// Maximum number of processes per execution (cgroup pids.max, or RLIMIT_NPROC of --run-as-uid)
    #[arg(long, default_value_t = 64)]
    pub max_processes: u32,

    /// File size limit in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024)] // 10MB
    pub file_size_limit: u64,

    /// Captured bytes per output stream
    #[arg(long, default_value_t = 1024 * 1024)] // 1MB
    pub max_output_bytes: usize,

    /// Timeout applied when a request does not ask for one
    #[arg(long, default_value_t = 5000)]
    pub default_timeout_ms: u64,

    /// Upper bound for requested timeouts
    #[arg(long, default_value_t = 30_000)]
    pub max_timeout_ms: u64,

    /// Python interpreter, looked up in PATH unless absolute
    #[arg(long, default_value = "python3")]
    pub python: String,

    /// Parent directory for per-execution scratch directories
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Run sandboxed code as this uid (requires root)
    #[arg(long, requires = "run_as_gid")]
    pub run_as_uid: Option<u32>,

    /// Run sandboxed code as this gid (requires root)
    #[arg(long, requires = "run_as_uid")]
    pub run_as_gid: Option<u32>,

    /// Give every execution an empty network namespace (requires CAP_SYS_ADMIN)
    #[arg(long)]
    pub isolate_network: bool,

    /// Delegated cgroup v2 directory; every execution gets its own child cgroup
    #[arg(long)]
    pub cgroup_root: Option<PathBuf>,

    /// Attempts per request when spawning the interpreter fails
    #[arg(long, default_value_t = 3)]
    pub spawn_retries: u32,

    /// Maximum request body size in bytes
    #[arg(long, default_value_t = 256 * 1024)]
    pub max_body_bytes: usize,
}

impl Args {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn service_config(&self) -> ServiceConfig {
        let limits = ResourceLimits {
            memory: self.memory_limit,
            cpu_time: self.cpu_time_limit,
            processes: self.max_processes,
            file_size: self.file_size_limit,
            max_output: self.max_output_bytes,
        };

        let request_limits = RequestLimits {
            default_timeout: Duration::from_millis(self.default_timeout_ms),
            max_timeout: Duration::from_millis(self.max_timeout_ms.max(self.default_timeout_ms)),
        };

        let run_as = match (self.run_as_uid, self.run_as_gid) {
            (Some(uid), Some(gid)) => Some(RunAs { uid, gid }),
            _ => None,
        };

        let queue_timeout =
            (self.queue_timeout_ms > 0).then(|| Duration::from_millis(self.queue_timeout_ms));

        let mut config = ServiceConfig::default()
            .with_limits(limits)
            .with_request_limits(request_limits)
            .with_max_concurrent_executions(self.max_concurrent)
            .with_queue_timeout(queue_timeout)
            .with_retry(RetryPolicy {
                max_attempts: self.spawn_retries.max(1),
                ..RetryPolicy::default()
            })
            .with_interpreter(self.python.clone())
            .with_run_as(run_as)
            .with_network_isolation(self.isolate_network)
            .with_cgroup_root(self.cgroup_root.clone());

        if let Some(work_dir) = &self.work_dir {
            config = config.with_work_dir(work_dir);
        }

        config
    }
}
