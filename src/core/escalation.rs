/// Per-call escalating termination
///
/// Running -> StopRequested (deadline passed, SIGTERM) -> Killed (grace
/// window passed, SIGKILL) -> Reaped. The machine is clock-injected: the
/// supervisor feeds it `Instant`s and performs whatever action it returns,
/// so every transition can be driven deterministically in tests.
use crate::core::types::KillReport;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPhase {
    Running,
    StopRequested { at: Instant },
    Killed { at: Instant },
    Reaped,
}

/// What the supervisor must do after a poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscalationAction {
    Wait,
    SendTerm,
    SendKill,
    Done,
}

#[derive(Debug)]
pub struct Escalation {
    deadline: Instant,
    grace: Duration,
    phase: CallPhase,
    stop_requested_at: Option<Instant>,
    report: KillReport,
}

impl Escalation {
    pub fn new(started: Instant, timeout: Duration, grace: Duration) -> Self {
        Self {
            deadline: started + timeout,
            grace,
            phase: CallPhase::Running,
            stop_requested_at: None,
            report: KillReport::default(),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the deadline has been crossed, whatever happened after.
    pub fn timed_out(&self) -> bool {
        self.stop_requested_at.is_some()
    }

    /// Advance the machine. `exited` reports whether the context has already
    /// been reaped.
    pub fn poll(&mut self, now: Instant, exited: bool) -> EscalationAction {
        if exited {
            if let Some(stopped) = self.stop_requested_at {
                self.report.waited_ms = now.saturating_duration_since(stopped).as_millis() as u64;
            }
            self.phase = CallPhase::Reaped;
            return EscalationAction::Done;
        }

        match self.phase {
            CallPhase::Running if now >= self.deadline => {
                self.phase = CallPhase::StopRequested { at: now };
                self.stop_requested_at = Some(now);
                self.report.term_sent = true;
                EscalationAction::SendTerm
            }
            CallPhase::Running => EscalationAction::Wait,
            CallPhase::StopRequested { at } if now >= at + self.grace => {
                self.phase = CallPhase::Killed { at: now };
                self.report.kill_sent = true;
                EscalationAction::SendKill
            }
            CallPhase::StopRequested { .. } | CallPhase::Killed { .. } => EscalationAction::Wait,
            CallPhase::Reaped => EscalationAction::Done,
        }
    }

    /// Attach a delivery note (fallbacks, failures) to the report.
    pub fn note(&mut self, note: String) {
        self.report.notes.push(note);
    }

    /// Time the supervisor may sleep before the next transition is due.
    pub fn next_wakeup(&self, now: Instant, poll_interval: Duration) -> Duration {
        let due = match self.phase {
            CallPhase::Running => self.deadline,
            CallPhase::StopRequested { at } => at + self.grace,
            CallPhase::Killed { .. } | CallPhase::Reaped => return poll_interval,
        };
        due.saturating_duration_since(now).min(poll_interval)
    }

    pub fn into_report(self) -> Option<KillReport> {
        if self.report.term_sent || self.report.kill_sent {
            Some(self.report)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(100);
    const GRACE: Duration = Duration::from_millis(50);

    #[test]
    fn running_waits_until_deadline() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, GRACE);
        assert_eq!(esc.poll(start + Duration::from_millis(99), false), EscalationAction::Wait);
        assert_eq!(esc.phase(), CallPhase::Running);
        assert!(!esc.timed_out());
    }

    #[test]
    fn deadline_requests_stop() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, GRACE);
        let at = start + TIMEOUT;
        assert_eq!(esc.poll(at, false), EscalationAction::SendTerm);
        assert_eq!(esc.phase(), CallPhase::StopRequested { at });
        assert!(esc.timed_out());
    }

    #[test]
    fn grace_expiry_forces_kill() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, GRACE);
        let stop_at = start + TIMEOUT;
        esc.poll(stop_at, false);
        assert_eq!(esc.poll(stop_at + Duration::from_millis(49), false), EscalationAction::Wait);
        let kill_at = stop_at + GRACE;
        assert_eq!(esc.poll(kill_at, false), EscalationAction::SendKill);
        assert_eq!(esc.phase(), CallPhase::Killed { at: kill_at });
        assert_eq!(esc.poll(kill_at + GRACE, false), EscalationAction::Wait);
    }

    #[test]
    fn graceful_exit_within_grace_skips_kill() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, GRACE);
        let stop_at = start + TIMEOUT;
        esc.poll(stop_at, false);
        assert_eq!(esc.poll(stop_at + Duration::from_millis(20), true), EscalationAction::Done);
        assert_eq!(esc.phase(), CallPhase::Reaped);
        assert!(esc.timed_out());
        let report = esc.into_report().unwrap();
        assert!(report.term_sent);
        assert!(!report.kill_sent);
        assert_eq!(report.waited_ms, 20);
    }

    #[test]
    fn exit_before_deadline_is_clean() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, GRACE);
        assert_eq!(esc.poll(start + Duration::from_millis(10), true), EscalationAction::Done);
        assert!(!esc.timed_out());
        assert!(esc.into_report().is_none());
    }

    #[test]
    fn zero_grace_kills_on_next_poll() {
        let start = Instant::now();
        let mut esc = Escalation::new(start, TIMEOUT, Duration::ZERO);
        let at = start + TIMEOUT;
        assert_eq!(esc.poll(at, false), EscalationAction::SendTerm);
        assert_eq!(esc.poll(at, false), EscalationAction::SendKill);
    }

    #[test]
    fn next_wakeup_is_capped_by_poll_interval() {
        let start = Instant::now();
        let esc = Escalation::new(start, TIMEOUT, GRACE);
        let poll = Duration::from_millis(10);
        assert_eq!(esc.next_wakeup(start, poll), poll);
        assert_eq!(
            esc.next_wakeup(start + Duration::from_millis(95), poll),
            Duration::from_millis(5)
        );
    }
}
