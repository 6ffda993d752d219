use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{error::Error, types::ResourceLimits};

const CONTROLLERS: &str = "+memory +pids";
const DRAIN_POLL: Duration = Duration::from_millis(10);

/// Turn on the memory and pids controllers for children of a delegated cgroup v2 directory
pub fn enable_controllers(root: &Path) -> Result<(), Error> {
    if !root.is_dir() {
        return Err(Error::Sandbox(format!(
            "Cgroup root {} does not exist",
            root.display()
        )));
    }

    fs::write(root.join("cgroup.subtree_control"), CONTROLLERS).map_err(|e| {
        Error::Sandbox(format!(
            "Failed to enable cgroup controllers under {}: {}",
            root.display(),
            e
        ))
    })?;

    debug!("Cgroup controllers enabled under {}", root.display());
    Ok(())
}

/// Cgroup owned by a single execution.
///
/// Holds the memory and process ceilings of that run only, so concurrent
/// runs never share a budget. Every process started by the run stays in it
/// whatever session or process group it moves to.
pub struct RunCgroup {
    path: PathBuf,
}

impl RunCgroup {
    pub fn create(parent: &Path, limits: &ResourceLimits) -> Result<Self, Error> {
        let path = parent.join(format!("run-{}", Uuid::new_v4()));
        fs::create_dir(&path)
            .map_err(|e| Error::Sandbox(format!("Failed to create cgroup: {}", e)))?;

        let cgroup = RunCgroup { path };
        cgroup.write("memory.max", &limits.memory.to_string())?;
        cgroup.write("pids.max", &limits.processes.to_string())?;
        if let Err(e) = cgroup.write("memory.swap.max", "0") {
            debug!("Swap limit not applied: {}", e);
        }

        Ok(cgroup)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, file: &str, value: &str) -> Result<(), Error> {
        fs::write(self.path.join(file), value)
            .map_err(|e| Error::Sandbox(format!("Failed to write {}: {}", file, e)))
    }

    /// Opened before the fork; the child writes `0` to it to move itself in
    pub fn procs_file(&self) -> Result<File, Error> {
        OpenOptions::new()
            .write(true)
            .open(self.path.join("cgroup.procs"))
            .map_err(|e| Error::Sandbox(format!("Failed to open cgroup.procs: {}", e)))
    }

    pub fn pids(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|content| parse_pids(&content))
            .unwrap_or_default()
    }

    /// SIGKILL everything in the cgroup
    pub fn kill(&self) {
        if let Err(e) = self.write("cgroup.kill", "1") {
            // Kernels before 5.14 lack cgroup.kill
            debug!("{}, killing members one by one", e);
            for pid in self.pids() {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
    }

    /// Whether the kernel OOM killer fired inside this cgroup
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|content| oom_kill_count(&content) > 0)
            .unwrap_or(false)
    }

    /// Wait until no process is left, so the directory can be removed
    pub async fn drain(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        while !self.pids().is_empty() {
            if Instant::now() >= deadline {
                warn!("Cgroup {} still populated after kill", self.path.display());
                return;
            }
            time::sleep(DRAIN_POLL).await;
        }
    }
}

impl Drop for RunCgroup {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!("Failed to remove cgroup {}: {}", self.path.display(), e);
            }
        }
    }
}

fn parse_pids(content: &str) -> Vec<i32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .collect()
}

fn oom_kill_count(events: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(key, _)| *key == "oom_kill")
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_kill_count() {
        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\noom_group_kill 0\n";
        assert_eq!(oom_kill_count(events), 1);
        assert_eq!(oom_kill_count("low 0\nhigh 0\nmax 0\noom 0\noom_kill 0\n"), 0);
        assert_eq!(oom_kill_count(""), 0);
    }

    #[test]
    fn test_parse_pids_skips_noise() {
        assert_eq!(parse_pids("12\n345\n\n"), vec![12, 345]);
        assert_eq!(parse_pids("0\n-1\nabc\n"), Vec::<i32>::new());
    }

    #[test]
    fn test_create_writes_limits() {
        let parent = tempfile::tempdir().unwrap();
        let limits = ResourceLimits {
            memory: 64 * 1024 * 1024,
            processes: 8,
            ..ResourceLimits::default()
        };

        let cgroup = RunCgroup::create(parent.path(), &limits).unwrap();
        let read = |file: &str| fs::read_to_string(cgroup.path().join(file)).unwrap();

        assert_eq!(read("memory.max"), "67108864");
        assert_eq!(read("pids.max"), "8");
        assert!(cgroup.pids().is_empty());
        assert!(!cgroup.oom_killed());

        fs::write(cgroup.path().join("memory.events"), "oom 1\noom_kill 2\n").unwrap();
        assert!(cgroup.oom_killed());
    }

    #[test]
    fn test_enable_controllers_needs_existing_root() {
        let parent = tempfile::tempdir().unwrap();
        assert!(enable_controllers(&parent.path().join("missing")).is_err());

        enable_controllers(parent.path()).unwrap();
        let control = fs::read_to_string(parent.path().join("cgroup.subtree_control")).unwrap();
        assert_eq!(control, CONTROLLERS);
    }
}
