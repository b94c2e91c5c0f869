/// Stop, start and restart for managed projects
///
/// Nothing here tracks children. Every decision starts from a fresh status read and
/// every outcome is confirmed by another one:
/// - stop: pm2 if configured, otherwise SIGTERM, grace period, SIGKILL, bounded wait
/// - start: pm2 if configured, otherwise the project's start script in its own session
/// - restart: stop then start, both reports returned
///
/// Our own PID is never signalled, even when a project's rules happen to match it.
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::ControlConfig;
use crate::error::{ControlError, ControlResult, RecoverableError};
use crate::project::{ProjectDescriptor, ProjectSet};
use crate::status::{ProjectStatus, StatusAggregator};

// pm2 can hang on a wedged daemon; never wait on it longer than this
const PM2_TIMEOUT: Duration = Duration::from_secs(15);
const START_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Pm2,
    Stopped { signalled: usize },
    /// Still shutting down when we stopped waiting; a later status read may catch up
    StillRunning { pids: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    AlreadyRunning,
    Pm2,
    Online { status: Box<ProjectStatus> },
    /// Script is alive but nothing attributable showed up yet
    Launched { pid: u32 },
    Exited { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartReport {
    #[serde(flatten)]
    pub outcome: StartOutcome,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartReport {
    pub stop: StopOutcome,
    pub start: StartReport,
}

/// Deliver a signal to one PID
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> Result<(), RecoverableError> {
    let signum = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if rc == 0 {
        return Ok(());
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => Err(RecoverableError::PermissionDenied { pid }),
        _ => Err(RecoverableError::ProcessGone { pid }),
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, _signal: Signal) -> Result<(), RecoverableError> {
    let output = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()
        .map_err(|_| RecoverableError::ProcessGone { pid })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(RecoverableError::ProcessGone { pid })
    }
}

/// Run `pm2 <action> <name>`; false when pm2 is missing, fails, or hangs
async fn pm2_action(pm2_name: &str, action: &str) -> bool {
    let Ok(pm2) = which::which("pm2") else {
        warn!("pm2_name {} configured but pm2 is not on PATH", pm2_name);
        return false;
    };
    let run = tokio::process::Command::new(pm2)
        .args([action, pm2_name])
        .stdin(Stdio::null())
        .output();
    match tokio::time::timeout(PM2_TIMEOUT, run).await {
        Ok(Ok(output)) if output.status.success() => true,
        Ok(Ok(output)) => {
            warn!(
                "pm2 {} {} failed: {}",
                action,
                pm2_name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            false
        }
        Ok(Err(e)) => {
            error!("Failed to run pm2: {}", e);
            false
        }
        Err(_) => {
            warn!("pm2 {} {} timed out", action, pm2_name);
            false
        }
    }
}

fn spawn_script(script: &Path, cwd: &str) -> std::io::Result<std::process::Child> {
    let mut cmd = std::process::Command::new("/bin/bash");
    cmd.arg(script)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // Detach from our session so the project outlives us
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    cmd.spawn()
}

/// Start/stop/restart on top of the status engine. These only decide *what* to signal
/// or launch; whether it worked is always answered by re-querying status.
pub struct ProcessControl {
    aggregator: Arc<StatusAggregator>,    // All "is it running" answers come from here
    stop_grace: Duration,                 // SIGTERM -> SIGKILL
    kill_wait: Duration,                  // SIGKILL -> final re-query
    start_wait_secs: u64,                 // Poll budget after launching a script
}

impl ProcessControl {
    pub fn new(aggregator: Arc<StatusAggregator>, config: &ControlConfig) -> Self {
        Self {
            aggregator,
            stop_grace: config.stop_grace(),
            kill_wait: config.kill_wait(),
            start_wait_secs: config.start_wait_secs,
        }
    }

    async fn signal_all(&self, descriptor: &ProjectDescriptor, signal: Signal) -> usize {
        let me = std::process::id();
        let matched = self.aggregator.matched_processes(descriptor).await;
        let mut delivered = 0;
        for pid in matched.pids().filter(|pid| *pid != me) {
            match send_signal(pid, signal) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("{:?} to {} ({}): {}", signal, pid, descriptor.name, e),
            }
        }
        delivered
    }

    /// SIGTERM, grace period, SIGKILL for survivors, one more bounded wait
    pub async fn stop(&self, descriptor: &ProjectDescriptor) -> ControlResult<StopOutcome> {
        if let Some(pm2_name) = descriptor.pm2_name.as_deref() {
            if pm2_action(pm2_name, "stop").await {
                info!("{} stopped via pm2", descriptor.name);
                return Ok(StopOutcome::Pm2);
            }
            warn!("pm2 stop failed for {}, falling back to signals", descriptor.name);
        }

        let signalled = self.signal_all(descriptor, Signal::Terminate).await;
        if signalled == 0 && self.aggregator.matched_processes(descriptor).await.is_empty() {
            info!("{} is not running", descriptor.name);
            return Ok(StopOutcome::NotRunning);
        }
        info!("Sent SIGTERM to {} processes of {}", signalled, descriptor.name);

        tokio::time::sleep(self.stop_grace).await;

        let killed = self.signal_all(descriptor, Signal::Kill).await;
        if killed > 0 {
            warn!("{} processes of {} survived SIGTERM, sent SIGKILL", killed, descriptor.name);
            tokio::time::sleep(self.kill_wait).await;
        }

        let remaining = self.aggregator.matched_processes(descriptor).await;
        if remaining.is_empty() {
            info!("{} stopped", descriptor.name);
            Ok(StopOutcome::Stopped { signalled })
        } else {
            warn!("{} still has {} processes", descriptor.name, remaining.len());
            Ok(StopOutcome::StillRunning {
                pids: remaining.pids().collect(),
            })
        }
    }

    /// Launch the project's start script and wait for it to show up
    pub async fn start(&self, descriptor: &ProjectDescriptor, projects: &ProjectSet) -> ControlResult<StartReport> {
        let mut warnings = Vec::new();

        if !self.aggregator.matched_processes(descriptor).await.is_empty() {
            return Ok(StartReport {
                outcome: StartOutcome::AlreadyRunning,
                warnings,
            });
        }

        if let Some(pm2_name) = descriptor.pm2_name.as_deref() {
            if pm2_action(pm2_name, "start").await {
                info!("{} started via pm2", descriptor.name);
                return Ok(StartReport {
                    outcome: StartOutcome::Pm2,
                    warnings,
                });
            }
            warn!("pm2 start failed for {}, trying start_script", descriptor.name);
        }

        let conflicts = self.aggregator.detector().detect(projects).await;
        for port in self.aggregator.resolver().resolve(descriptor).await {
            let rivals = conflicts.rivals(port, &descriptor.name);
            if !rivals.is_empty() {
                let message = format!("port {} is also used by {}", port, rivals.join(", "));
                warn!("{}: {}", descriptor.name, message);
                warnings.push(message);
            }
        }

        let script = descriptor
            .start_script_path()
            .ok_or_else(|| ControlError::NoStartScript(descriptor.name.clone()))?;
        if !script.exists() {
            return Err(ControlError::ScriptNotFound(script.display().to_string()));
        }

        let mut child = spawn_script(&script, &descriptor.path).map_err(|source| ControlError::Spawn {
            what: script.display().to_string(),
            source,
        })?;
        info!("Launched {} for {} (PID {})", script.display(), descriptor.name, child.id());

        for _ in 0..self.start_wait_secs {
            tokio::time::sleep(START_POLL_INTERVAL).await;
            let status = self.aggregator.aggregate_with(descriptor, &conflicts).await;
            if status.running {
                info!("{} is online", descriptor.name);
                return Ok(StartReport {
                    outcome: StartOutcome::Online {
                        status: Box::new(status),
                    },
                    warnings,
                });
            }
        }

        let outcome = match child.try_wait() {
            Ok(None) => StartOutcome::Launched { pid: child.id() },
            Ok(Some(exit)) => StartOutcome::Exited { code: exit.code() },
            Err(e) => {
                warn!("Could not check start script of {}: {}", descriptor.name, e);
                StartOutcome::Launched { pid: child.id() }
            }
        };
        Ok(StartReport { outcome, warnings })
    }

    pub async fn restart(&self, descriptor: &ProjectDescriptor, projects: &ProjectSet) -> ControlResult<RestartReport> {
        let stop = self.stop(descriptor).await?;
        let start = self.start(descriptor, projects).await?;
        Ok(RestartReport { stop, start })
    }
}
