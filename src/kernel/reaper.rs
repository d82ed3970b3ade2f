/// Descendant teardown for guest contexts
///
/// The host registers itself as a child subreaper, so a guest descendant
/// that leaves its context's process group (setsid, double fork) is
/// reparented to the host instead of init once its parent exits. After every
/// call the host kills and reaps each such orphan.
///
/// Context leaders are spawned while the registry lock is held and stay
/// listed until they are reaped. A sweep never touches a listed leader, nor
/// a child in the host's own session: every guest process lives in a
/// session its context leader created.
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::io;
use std::process::{Child, Command};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Each pass catches the orphans of the processes killed in the one before.
const SWEEP_PASSES: usize = 8;
const REAP_WAIT: Duration = Duration::from_millis(200);

static LIVE_LEADERS: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());

fn live_leaders() -> MutexGuard<'static, BTreeSet<u32>> {
    LIVE_LEADERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Make orphaned descendants of this process reparent to it.
pub fn become_subreaper() -> io::Result<()> {
    // SAFETY: plain prctl on the calling process.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_subreaper() -> bool {
    let mut flag: libc::c_int = 0;
    // SAFETY: PR_GET_CHILD_SUBREAPER writes one int through the pointer.
    let rc = unsafe {
        libc::prctl(
            libc::PR_GET_CHILD_SUBREAPER,
            &mut flag as *mut libc::c_int,
            0,
            0,
            0,
        )
    };
    rc == 0 && flag != 0
}

/// Spawn a context leader and list it before any sweep can see it.
pub fn spawn_leader(cmd: &mut Command) -> io::Result<Child> {
    let mut live = live_leaders();
    let child = cmd.spawn()?;
    live.insert(child.id());
    Ok(child)
}

/// Forget a leader once it has been reaped.
pub fn release_leader(pid: u32) {
    live_leaders().remove(&pid);
}

/// Kill and reap every orphan the host has inherited. Returns how many
/// were reaped.
pub fn reap_orphans() -> usize {
    let host = std::process::id();
    let host_session = nix::unistd::getsid(None).ok().map(|sid| sid.as_raw() as u32);
    let mut reaped = 0;

    for _ in 0..SWEEP_PASSES {
        let orphans: Vec<u32> = {
            let live = live_leaders();
            let found: Vec<u32> = children_of(host)
                .into_iter()
                .filter(|(pid, session)| !live.contains(pid) && Some(*session) != host_session)
                .map(|(pid, _)| pid)
                .collect();
            for &pid in &found {
                match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(e) => debug!("kill of orphan {} failed: {}", pid, e),
                }
            }
            found
        };
        if orphans.is_empty() {
            return reaped;
        }
        for pid in orphans {
            if reap(pid) {
                debug!("reaped orphaned guest process {}", pid);
                reaped += 1;
            }
        }
    }

    warn!("orphan sweep stopped after {} passes", SWEEP_PASSES);
    reaped
}

fn reap(pid: u32) -> bool {
    let deadline = Instant::now() + REAP_WAIT;
    loop {
        match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(WaitStatus::StillAlive) => return false,
            Ok(_) => return true,
            // Reaped by a concurrent sweep.
            Err(Errno::ECHILD) => return false,
            Err(e) => {
                debug!("waitpid({}) failed: {}", pid, e);
                return false;
            }
        }
    }
}

/// `(pid, session)` of every process whose parent is `parent`.
fn children_of(parent: u32) -> Vec<(u32, u32)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|pid| {
            let (ppid, session) = parent_and_session(pid)?;
            (ppid == parent).then_some((pid, session))
        })
        .collect()
}

fn parent_and_session(pid: u32) -> Option<(u32, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    let ppid = fields.next()?.parse().ok()?;
    let _pgrp = fields.next()?;
    let session = fields.next()?.parse().ok()?;
    Some((ppid, session))
}
