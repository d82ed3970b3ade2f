/// Process-group signalling for guest contexts
///
/// Every context leads its own process group (see `kernel::preexec`), so a
/// signal sent to the group also reaches anything the guest forked.
use log::debug;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Delivery result of a group signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SignalDelivery {
    /// Delivered to the whole process group.
    Group,
    /// Group delivery failed; delivered to the leader only.
    LeaderOnly(String),
    /// Nothing left to signal.
    AlreadyGone,
    Failed(String),
}

impl SignalDelivery {
    pub fn delivered(&self) -> bool {
        matches!(self, SignalDelivery::Group | SignalDelivery::LeaderOnly(_))
    }
}

/// Send `sig` to the process group led by `leader`, falling back to the
/// leader itself when the group is not reachable (e.g. setsid was skipped).
pub fn signal_group(leader: u32, sig: Signal) -> SignalDelivery {
    let pid = Pid::from_raw(leader as i32);
    match signal::killpg(pid, sig) {
        Ok(()) => {
            debug!("{:?} sent to process group {}", sig, leader);
            SignalDelivery::Group
        }
        Err(group_err) => match signal::kill(pid, sig) {
            Ok(()) => {
                debug!("{:?} sent to leader {} (group: {})", sig, leader, group_err);
                SignalDelivery::LeaderOnly(group_err.to_string())
            }
            Err(Errno::ESRCH) => SignalDelivery::AlreadyGone,
            Err(e) => SignalDelivery::Failed(format!("group: {}, leader: {}", group_err, e)),
        },
    }
}

/// Best-effort SIGKILL of a context's group after it has been reaped, so a
/// guest that forked and exited cannot leave stragglers behind.
pub fn sweep_group(leader: u32) {
    let pid = Pid::from_raw(leader as i32);
    match signal::killpg(pid, Signal::SIGKILL) {
        Ok(()) => debug!("swept straggler processes of group {}", leader),
        Err(Errno::ESRCH) => {}
        Err(e) => debug!("group sweep for {} failed: {}", leader, e),
    }
}
