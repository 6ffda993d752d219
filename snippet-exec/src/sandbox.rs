use nix::{
    sys::{
        resource::{getrlimit, setrlimit, Resource},
        signal::{kill, killpg, Signal},
    },
    unistd::{chown, setsid, Gid, Pid, Uid},
};
use std::{
    fs::{self, File},
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};
use tempfile::TempDir;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
    task::{self, JoinHandle},
    time::{self, Duration},
};
use tracing::{debug, error, warn};

use crate::{
    cgroup::RunCgroup,
    error::Error,
    languages::LanguageExecutor,
    request::ExecutionRequest,
    types::{
        CapturedOutput, ExecutionResult, ExitReason, LimitExceeded, ResourceLimits, RunAs,
        ServiceConfig,
    },
};

const SANDBOX_PATH: &str = "/usr/bin:/bin";
const READ_CHUNK: usize = 8192;
/// How long output readers may keep draining after the process group is gone
const READER_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Lives outside the reader task so an aborted read keeps what it already got
type SharedCapture = Arc<Mutex<Capture>>;

/// Disposable execution context: one scratch directory and one process group per run
pub struct Sandbox {
    root: Option<TempDir>,
    /// Canonical form of the scratch directory, as seen by the child
    real_root: PathBuf,
    limits: ResourceLimits,
    run_as: Option<RunAs>,
    isolate_network: bool,
    cgroup_root: Option<PathBuf>,
}

impl Sandbox {
    /// Create a new sandbox directory under `config.work_dir`
    pub fn new(config: &ServiceConfig) -> Result<Self, Error> {
        let root = tempfile::Builder::new()
            .prefix("sandbox-")
            .tempdir_in(&config.work_dir)
            .map_err(|e| Error::Sandbox(format!("Failed to create sandbox directory: {}", e)))?;

        if let Some(run_as) = config.run_as {
            chown(
                root.path(),
                Some(Uid::from_raw(run_as.uid)),
                Some(Gid::from_raw(run_as.gid)),
            )
            .map_err(|e| Error::Sandbox(format!("Failed to chown sandbox directory: {}", e)))?;
        }

        let real_root = std::fs::canonicalize(root.path())
            .map_err(|e| Error::Sandbox(format!("Failed to resolve sandbox directory: {}", e)))?;

        Ok(Sandbox {
            root: Some(root),
            real_root,
            limits: config.limits.clone(),
            run_as: config.run_as,
            isolate_network: config.isolate_network,
            cgroup_root: config.cgroup_root.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.real_root
    }

    /// Run the request's code once with the given executor.
    ///
    /// Only host-side failures are returned as `Err`; whatever the code does
    /// ends up in the [`ExecutionResult`].
    pub async fn run(
        &self,
        executor: &dyn LanguageExecutor,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, Error> {
        executor.write_source(self.path(), &request.code).await?;

        let cgroup = self
            .cgroup_root
            .as_deref()
            .map(|root| RunCgroup::create(root, &self.limits))
            .transpose()?;
        let procs = cgroup.as_ref().map(RunCgroup::procs_file).transpose()?;
        let process_limit = process_rlimit(&self.limits, self.run_as, cgroup.is_some());

        let mut command = Command::new(executor.run_command());
        command
            .args(executor.run_args())
            .env_clear()
            .envs(executor.env())
            .env("PATH", SANDBOX_PATH)
            .env("HOME", self.path())
            .env("LANG", "C.UTF-8")
            .current_dir(self.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let limits = self.limits.clone();
        let run_as = self.run_as;
        let isolate_network = self.isolate_network;
        unsafe {
            command.pre_exec(move || {
                restrict_process(&limits, procs.as_ref(), process_limit, run_as, isolate_network)
            });
        }

        debug!(
            "Sandbox spawn - command: {}, dir: {}, cgroup: {:?}",
            executor.run_command().display(),
            self.path().display(),
            cgroup.as_ref().map(RunCgroup::path)
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| Error::Spawn(e.to_string()))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Sandbox("Child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Sandbox("Child stderr not captured".to_string()))?;
        let pipes: Vec<PathBuf> = [pipe_identity(&stdout), pipe_identity(&stderr)]
            .into_iter()
            .flatten()
            .collect();

        let input = request.stdin.clone().into_bytes();
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                // The code may exit without reading; a broken pipe is expected then
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        });

        let max_output = self.limits.max_output;
        let stdout_sink = SharedCapture::default();
        let stderr_sink = SharedCapture::default();
        let stdout_reader = tokio::spawn(read_capped(stdout, max_output, stdout_sink.clone()));
        let stderr_reader = tokio::spawn(read_capped(stderr, max_output, stderr_sink.clone()));

        let waited = time::timeout(request.timeout, child.wait()).await;
        let timed_out = waited.is_err();
        if timed_out {
            warn!("Execution exceeded {:?}, killing process group", request.timeout);
        }

        // Leader exit does not end background children; the group goes either way
        kill_process_group(pid);
        if let Some(cgroup) = &cgroup {
            cgroup.kill();
        }

        let status = match waited {
            Ok(status) => status,
            Err(_) => child.wait().await,
        };
        let elapsed = started.elapsed();
        writer.abort();

        if cgroup.is_none() {
            // Descendants that left the session through setsid are still holding the pipes
            if let Err(e) = task::spawn_blocking(move || kill_pipe_holders(&pipes)).await {
                error!("Pipe holder sweep failed: {}", e);
            }
        }

        let (stdout, stdout_truncated) = join_reader(stdout_reader, stdout_sink, "stdout").await;
        let (stderr, stderr_truncated) = join_reader(stderr_reader, stderr_sink, "stderr").await;

        let oom_killed = match &cgroup {
            Some(cgroup) => {
                cgroup.drain(READER_GRACE).await;
                cgroup.oom_killed()
            }
            None => false,
        };

        let status =
            status.map_err(|e| Error::Sandbox(format!("Failed to wait for process: {}", e)))?;

        let output = CapturedOutput {
            stdout: self.redact(&stdout),
            stderr: self.redact(&stderr),
            stdout_truncated,
            stderr_truncated,
        };

        let reported = if oom_killed {
            Some(LimitExceeded::Memory)
        } else {
            executor.detect_resource_exhaustion(&output.stderr)
        };
        let (reason, limit) = classify(status, timed_out, reported);
        debug!(
            "Sandbox exit - status: {}, reason: {}, elapsed: {:?}",
            status, reason, elapsed
        );

        Ok(match limit {
            Some(limit) => {
                warn!("Execution hit the {} limit", limit);
                ExecutionResult::resource_exhausted(limit, status.code(), output, elapsed)
            }
            None => ExecutionResult::new(reason, status.code(), output, elapsed),
        })
    }

    /// Replace the scratch directory path so host layout never reaches the caller
    fn redact(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let mut text = text.replace(&*self.real_root.to_string_lossy(), ".");
        if let Some(root) = &self.root {
            text = text.replace(&*root.path().to_string_lossy(), ".");
        }
        text
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(root) = self.root.take() {
            if let Err(e) = root.close() {
                error!("Failed to clean up sandbox directory: {}", e);
            }
        }
    }
}

/// Runs in the forked child before exec
fn restrict_process(
    limits: &ResourceLimits,
    cgroup_procs: Option<&File>,
    process_limit: Option<u64>,
    run_as: Option<RunAs>,
    isolate_network: bool,
) -> io::Result<()> {
    // Join before dropping privileges; "0" means the writing process
    if let Some(mut procs) = cgroup_procs {
        procs.write_all(b"0")?;
    }

    // Own session, so the whole tree can be killed through one process group
    setsid()?;

    lower_limit(Resource::RLIMIT_AS, limits.memory)?;
    lower_limit(Resource::RLIMIT_CPU, u64::from(limits.cpu_time))?;
    lower_limit(Resource::RLIMIT_FSIZE, limits.file_size)?;
    if let Some(processes) = process_limit {
        lower_limit(Resource::RLIMIT_NPROC, processes)?;
    }
    lower_limit(Resource::RLIMIT_CORE, 0)?;

    #[cfg(target_os = "linux")]
    {
        if isolate_network {
            nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWNET)?;
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = isolate_network;

    if let Some(run_as) = run_as {
        let gid = Gid::from_raw(run_as.gid);
        #[cfg(target_os = "linux")]
        nix::unistd::setgroups(&[gid])?;
        nix::unistd::setgid(gid)?;
        nix::unistd::setuid(Uid::from_raw(run_as.uid))?;
    }

    Ok(())
}

/// Set soft and hard limit, never above the inherited hard limit
fn lower_limit(resource: Resource, value: u64) -> io::Result<()> {
    let (_, hard) = getrlimit(resource)?;
    let value = value.min(hard);
    setrlimit(resource, value, value)?;
    Ok(())
}

/// RLIMIT_NPROC counts every process of the real uid, server threads included,
/// so it is only set for a dedicated sandbox uid when no cgroup `pids.max` applies
fn process_rlimit(limits: &ResourceLimits, run_as: Option<RunAs>, cgroup: bool) -> Option<u64> {
    (run_as.is_some() && !cgroup).then(|| u64::from(limits.processes))
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    // ESRCH just means nothing is left in the group
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

/// `pipe:[inode]` link target of our end of a child pipe
fn pipe_identity(stream: &impl AsRawFd) -> Option<PathBuf> {
    fs::read_link(format!("/proc/self/fd/{}", stream.as_raw_fd())).ok()
}

/// SIGKILL every other process that still has one of the given pipes open
fn kill_pipe_holders(pipes: &[PathBuf]) {
    if pipes.is_empty() {
        return;
    }
    let Ok(entries) = fs::read_dir("/proc") else {
        return;
    };
    let own = std::process::id();

    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        let holds_pipe = fds
            .flatten()
            .any(|fd| fs::read_link(fd.path()).is_ok_and(|target| pipes.contains(&target)));
        if !holds_pipe {
            continue;
        }
        if let Ok(pid) = i32::try_from(pid) {
            warn!("Killing process {} that escaped the process group", pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }
}

fn lock(sink: &SharedCapture) -> MutexGuard<'_, Capture> {
    sink.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read a stream to the end into `sink`, keeping at most `cap` bytes
async fn read_capped<R>(mut reader: R, cap: usize, sink: SharedCapture) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }

        {
            let mut capture = lock(&sink);
            let room = cap.saturating_sub(capture.bytes.len());
            if n > room {
                capture.truncated = true;
            }
            capture.bytes.extend_from_slice(&chunk[..n.min(room)]);
        }
    }
}

/// Wait briefly for a reader, then take whatever it captured
async fn join_reader(
    mut handle: JoinHandle<io::Result<()>>,
    sink: SharedCapture,
    stream: &str,
) -> (Vec<u8>, bool) {
    let mut cut_short = false;
    match time::timeout(READER_GRACE, &mut handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!("Failed to read {}: {}", stream, e),
        Ok(Err(e)) => error!("{} reader task failed: {}", stream, e),
        Err(_) => {
            handle.abort();
            warn!("{} still open after the kill, keeping what was read", stream);
            cut_short = true;
        }
    }

    let Capture {
        mut bytes,
        truncated,
    } = std::mem::take(&mut *lock(&sink));
    let truncated = truncated || cut_short;
    if truncated {
        trim_partial_char(&mut bytes);
    }
    (bytes, truncated)
}

/// Drop a trailing UTF-8 sequence that the cut left incomplete
fn trim_partial_char(bytes: &mut Vec<u8>) {
    let tail = bytes.len().saturating_sub(4);
    let Some(offset) = bytes[tail..].iter().rposition(|b| b & 0xC0 != 0x80) else {
        return;
    };
    let start = tail + offset;
    let width = match bytes[start] {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    };
    if start + width > bytes.len() {
        bytes.truncate(start);
    }
}

/// Map a raw exit status onto the result contract
fn classify(
    status: ExitStatus,
    timed_out: bool,
    reported: Option<LimitExceeded>,
) -> (ExitReason, Option<LimitExceeded>) {
    use std::os::unix::process::ExitStatusExt;

    if timed_out {
        return (ExitReason::Timeout, None);
    }

    if let Some(signal) = status.signal() {
        let limit = match Signal::try_from(signal) {
            Ok(Signal::SIGXCPU) => Some(LimitExceeded::CpuTime),
            Ok(Signal::SIGXFSZ) => Some(LimitExceeded::FileSize),
            // A bare SIGKILL may come from the code itself; memory needs OOM evidence
            _ => reported,
        };
        return match limit {
            Some(limit) => (ExitReason::InternalError, Some(limit)),
            None => (ExitReason::NonZeroExit, None),
        };
    }

    match (status.code(), reported) {
        (Some(0), _) => (ExitReason::Completed, None),
        (_, Some(limit)) => (ExitReason::InternalError, Some(limit)),
        _ => (ExitReason::NonZeroExit, None),
    }
}
