/// Verdict classification for finished contexts
///
/// A pure function over what the supervisor observed. Host-enforced
/// termination takes precedence over anything the guest printed: a context
/// that crossed its deadline is a timeout even if a reply made it out.
use crate::core::supervisor::ContextOutcome;
use crate::core::types::{GuestOutcome, GuestReply};
use serde::{Deserialize, Serialize};

/// Typed per-call failure kinds. All are absorbed at the executor boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallErrorKind {
    /// The call exceeded its deadline.
    Timeout,
    /// The guest raised, crashed, or exited abnormally.
    GuestRuntimeError,
    /// The guest answered with something that is not a valid reply.
    MalformedReply,
    /// The context could not be created or its result not retrieved.
    ContextFailure,
    /// The registered code changed on disk since registration.
    CodeTampered,
    /// The guest explicitly declined an update.
    Rejected,
}

impl std::fmt::Display for CallErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallErrorKind::Timeout => "timeout",
            CallErrorKind::GuestRuntimeError => "guest_runtime_error",
            CallErrorKind::MalformedReply => "malformed_reply",
            CallErrorKind::ContextFailure => "context_failure",
            CallErrorKind::CodeTampered => "code_tampered",
            CallErrorKind::Rejected => "rejected",
        };
        write!(f, "{}", name)
    }
}

/// A classified call failure with its human-readable detail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFailure {
    pub kind: CallErrorKind,
    pub detail: String,
}

impl CallFailure {
    pub fn new(kind: CallErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

const STDERR_TAIL: usize = 512;

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}

/// Classify a finished context into a usable reply or a typed failure.
pub fn classify(outcome: &ContextOutcome) -> Result<GuestReply, CallFailure> {
    if outcome.timed_out {
        return Err(CallFailure::new(
            CallErrorKind::Timeout,
            format!("deadline exceeded after {} ms", outcome.wall_time.as_millis()),
        ));
    }

    if let Some(signal) = outcome.term_signal {
        return Err(CallFailure::new(
            CallErrorKind::GuestRuntimeError,
            format!("terminated by signal {}: {}", signal, stderr_tail(&outcome.output.stderr)),
        ));
    }

    match outcome.exit_code {
        Some(0) => {}
        Some(code) => {
            return Err(CallFailure::new(
                CallErrorKind::GuestRuntimeError,
                format!("exited with status {}: {}", code, stderr_tail(&outcome.output.stderr)),
            ));
        }
        None => {
            return Err(CallFailure::new(
                CallErrorKind::ContextFailure,
                "no exit status recorded",
            ));
        }
    }

    let reply = GuestReply::parse_from_stdout(&outcome.output.stdout)
        .map_err(|e| CallFailure::new(CallErrorKind::MalformedReply, e))?;

    if let GuestOutcome::Error { message } = &reply.outcome {
        return Err(CallFailure::new(
            CallErrorKind::GuestRuntimeError,
            message.clone(),
        ));
    }

    Ok(reply)
}
