use crate::config::types::{BidboxError, Result};
use crate::core::escalation::{Escalation, EscalationAction};
use crate::core::types::{GuestRequest, KillReport};
use crate::kernel::preexec::PreExecPlan;
use crate::kernel::reaper;
use crate::kernel::signal::{signal_group, sweep_group};
use crate::utils::output::{OutputCollector, OutputLimits, OutputResult};
use nix::sys::signal::Signal;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> BidboxError {
    BidboxError::Process(format!("{prefix}: {err}"))
}

/// Everything needed to run one single-use context.
#[derive(Debug)]
pub struct ContextLaunch<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub request: &'a GuestRequest,
    pub plan: &'a PreExecPlan,
    pub path_env: &'a str,
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub grace: Duration,
    pub poll_interval: Duration,
    pub limits: OutputLimits,
}

/// What the host observed about a finished context.
#[derive(Debug, Clone)]
pub struct ContextOutcome {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub timed_out: bool,
    pub wall_time: Duration,
    pub output: OutputResult,
    pub kill_report: Option<KillReport>,
    pub stdin_error: Option<String>,
}

/// Run one guest context to completion or forced termination.
///
/// The host never blocks on guest code: the request is written from a helper
/// thread, output is drained concurrently, and the wait loop escalates
/// SIGTERM -> SIGKILL on the context's process group once the deadline passes.
pub fn run_context(launch: &ContextLaunch<'_>) -> Result<ContextOutcome> {
    let payload = serde_json::to_vec(launch.request)?;

    let mut cmd = Command::new(launch.program);
    cmd.args(launch.args)
        .env_clear()
        .env("PATH", launch.path_env)
        .current_dir(launch.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut plan = launch.plan.clone();
    // SAFETY: apply_in_child only issues async-signal-safe libc calls.
    unsafe {
        cmd.pre_exec(move || plan.apply_in_child());
    }

    let started = Instant::now();
    let mut child = reaper::spawn_leader(&mut cmd)
        .map_err(|e| to_process_error(&format!("spawn({})", launch.program.display()), e))?;
    let pid = child.id();

    let stdin_rx = child.stdin.take().map(|mut stdin| {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let result = stdin
                .write_all(&payload)
                .and_then(|_| stdin.flush())
                .map_err(|e| e.to_string());
            drop(stdin);
            let _ = tx.send(result);
        });
        rx
    });

    let pending = OutputCollector::new(launch.limits.clone())
        .start(child.stdout.take(), child.stderr.take());

    let mut escalation = Escalation::new(started, launch.timeout, launch.grace);
    let waited = loop {
        let reaped = match child.try_wait() {
            Ok(reaped) => reaped,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(to_process_error("try_wait(context)", e));
            }
        };
        let now = Instant::now();
        match escalation.poll(now, reaped.is_some()) {
            EscalationAction::Done => {
                if let Some(status) = reaped {
                    break Ok(status);
                }
            }
            EscalationAction::SendTerm => {
                log::debug!("context {} passed its deadline, sending SIGTERM", pid);
                let delivery = signal_group(pid, Signal::SIGTERM);
                escalation.note(format!("SIGTERM: {:?}", delivery));
            }
            EscalationAction::SendKill => {
                log::debug!("context {} ignored SIGTERM, sending SIGKILL", pid);
                let delivery = signal_group(pid, Signal::SIGKILL);
                if !delivery.delivered() {
                    let _ = child.kill();
                }
                escalation.note(format!("SIGKILL: {:?}", delivery));
            }
            EscalationAction::Wait => {
                std::thread::sleep(escalation.next_wakeup(now, launch.poll_interval));
            }
        }
    };
    let wall_time = started.elapsed();

    // Anything the guest forked into its group dies with it; descendants that
    // left the group were reparented to the host and are reaped here.
    reaper::release_leader(pid);
    sweep_group(pid);
    let orphans = reaper::reap_orphans();
    if orphans > 0 {
        log::debug!("context {} left {} orphaned processes", pid, orphans);
    }

    let output = pending.finish();
    let status = waited?;
    let stdin_error = stdin_rx.and_then(|rx| match rx.recv_timeout(launch.limits.collection_timeout) {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some("request writer did not finish".to_string()),
    });

    Ok(ContextOutcome {
        pid,
        exit_code: status.code(),
        term_signal: status.signal(),
        timed_out: escalation.timed_out(),
        wall_time,
        output,
        kill_report: escalation.into_report(),
        stdin_error,
    })
}

/// Run-scoped working directory for one context, removed afterwards.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(root: &Path, label: &str, owner: Option<(u32, u32)>) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(format!("{}-{}", label, uuid::Uuid::new_v4()));
        std::fs::create_dir(&path)?;
        if let Some((uid, gid)) = owner {
            nix::unistd::chown(
                &path,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )
            .map_err(|e| to_process_error("chown(scratch)", e))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log::debug!("failed to remove scratch dir {}: {}", self.path.display(), e);
        }
    }
}
