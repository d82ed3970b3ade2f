/// Security event logging for bidbox
/// Structured, JSON-serializable records of everything a guest context did
/// that the host had to act on: deadlines, escalations, crashes, lossy
/// checkpoints, tampered code and rejected registrations.
///
/// Events always go through the `log` facade under the `bidbox::audit`
/// target. When an audit file is configured they are also appended to it
/// as one JSON object per line.
///
/// Guests sharing the host uid can rewrite the audit file. The logger keeps
/// the trail it has written in memory and checks the file against it before
/// every append; a file that was truncated, edited, appended to or replaced
/// is rebuilt from memory and an `AuditTampered` event is recorded.
use crate::config::types::{BidboxError, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::SystemTime;
use uuid::Uuid;

const AUDIT_TARGET: &str = "bidbox::audit";

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Lifecycle
    ContextStart,
    ContextEnd,
    ControlDegraded,

    // Registration
    RegistrationRejected,

    // Call failures
    CallTimeout,
    GuestRuntimeError,
    MalformedReply,
    ContextFailure,

    // Termination
    GracefulStop,
    ForcedKill,

    // State and code integrity
    SerializationLoss,
    CheckpointRejected,
    CodeTampered,
    OutputLimitViolation,
    AuditTampered,
}

impl SecurityEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::ContextStart => SecuritySeverity::Low,
            SecurityEventType::ContextEnd => SecuritySeverity::Low,
            SecurityEventType::ControlDegraded => SecuritySeverity::High,

            SecurityEventType::RegistrationRejected => SecuritySeverity::Medium,

            SecurityEventType::CallTimeout => SecuritySeverity::Medium,
            SecurityEventType::GuestRuntimeError => SecuritySeverity::Medium,
            SecurityEventType::MalformedReply => SecuritySeverity::Medium,
            SecurityEventType::ContextFailure => SecuritySeverity::High,

            SecurityEventType::GracefulStop => SecuritySeverity::Medium,
            SecurityEventType::ForcedKill => SecuritySeverity::High,

            SecurityEventType::SerializationLoss => SecuritySeverity::Medium,
            SecurityEventType::CheckpointRejected => SecuritySeverity::Medium,
            SecurityEventType::CodeTampered => SecuritySeverity::Critical,
            SecurityEventType::OutputLimitViolation => SecuritySeverity::Low,
            SecurityEventType::AuditTampered => SecuritySeverity::Critical,
        }
    }
}

/// Correlation identifiers for one guest call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    /// Unique identifier of this call's context
    pub call_id: String,
    pub team_id: String,
    /// bid / update / describe
    pub operation: String,
    /// Context process id on the host
    pub pid: Option<u32>,
}

impl CorrelationIds {
    pub fn new(team_id: &str, operation: &str) -> Self {
        Self {
            call_id: Uuid::new_v4().to_string(),
            team_id: team_id.to_string(),
            operation: operation.to_string(),
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }
}

/// Individual security event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub timestamp: SystemTime,
    pub details: String,
    pub correlation: Option<CorrelationIds>,
    pub field: Option<String>,
    pub file_path: Option<String>,
}

impl SecurityEvent {
    /// Create a new security event with default severity
    pub fn new(event_type: SecurityEventType, details: String) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: SystemTime::now(),
            details,
            correlation: None,
            field: None,
            file_path: None,
        }
    }

    pub fn with_correlation(mut self, correlation: CorrelationIds) -> Self {
        self.correlation = Some(correlation);
        self
    }

    pub fn with_field(mut self, field: String) -> Self {
        self.field = Some(field);
        self
    }

    pub fn with_file_path(mut self, file_path: String) -> Self {
        self.file_path = Some(file_path);
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }

    fn to_log_entry(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            "event_type": self.event_type,
            "severity": self.severity,
            "details": self.details,
            "host_pid": std::process::id(),
        });
        if let Some(correlation) = &self.correlation {
            entry["correlation"] =
                serde_json::to_value(correlation).unwrap_or(serde_json::Value::Null);
        }
        if let Some(field) = &self.field {
            entry["field"] = serde_json::json!(field);
        }
        if let Some(file_path) = &self.file_path {
            entry["file_path"] = serde_json::json!(file_path);
        }
        entry
    }
}

/// Open audit file plus the bytes the logger has put in it.
struct AuditSink {
    file: File,
    /// (device, inode) of `file`
    identity: (u64, u64),
    trail: Vec<u8>,
}

fn open_audit_file(path: &Path, create_new: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options
        .read(true)
        .append(true)
        .mode(0o600)
        .custom_flags(libc::O_NOFOLLOW);
    if create_new {
        options.create_new(true);
    } else {
        options.create(true);
    }
    options.open(path)
}

fn identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

impl AuditSink {
    fn open(path: &Path) -> io::Result<Self> {
        let mut file = open_audit_file(path, false)?;
        let mut trail = Vec::new();
        file.read_to_end(&mut trail)?;
        Ok(Self {
            identity: identity(&file)?,
            file,
            trail,
        })
    }

    /// How the file on disk departs from the trail, if it does.
    fn tampering(&self, path: &Path) -> Option<String> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if (meta.dev(), meta.ino()) == self.identity => {}
            Ok(_) => return Some("audit file was replaced".to_string()),
            Err(e) => return Some(format!("audit file is gone: {}", e)),
        }
        let len = match self.file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => return Some(format!("audit file cannot be inspected: {}", e)),
        };
        if len != self.trail.len() as u64 {
            return Some(format!(
                "audit file length changed from {} to {} bytes",
                self.trail.len(),
                len
            ));
        }
        let mut on_disk = vec![0u8; self.trail.len()];
        match self.file.read_exact_at(&mut on_disk, 0) {
            Ok(()) if on_disk == self.trail => None,
            Ok(()) => Some("audit file content was rewritten".to_string()),
            Err(e) => Some(format!("audit file cannot be read back: {}", e)),
        }
    }

    /// Replace whatever is at `path` with a fresh file holding the trail.
    fn restore(&mut self, path: &Path) -> io::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let mut file = open_audit_file(path, true)?;
        file.write_all(&self.trail)?;
        self.identity = identity(&file)?;
        self.file = file;
        Ok(())
    }

    fn append(&mut self, line: &[u8]) -> io::Result<()> {
        let start = self.trail.len();
        self.trail.extend_from_slice(line);
        self.trail.push(b'\n');
        if let Err(e) = self.file.write_all(&self.trail[start..]).and_then(|_| self.file.flush()) {
            self.trail.truncate(start);
            return Err(e);
        }
        Ok(())
    }

    fn write_entry(&mut self, path: &Path, entry: &serde_json::Value) -> io::Result<()> {
        if let Some(reason) = self.tampering(path) {
            error!(target: AUDIT_TARGET, "{:?} [-] {}", SecurityEventType::AuditTampered, reason);
            self.restore(path)?;
            let notice = SecurityEvent::new(SecurityEventType::AuditTampered, reason)
                .with_file_path(path.display().to_string())
                .to_log_entry();
            self.append(notice.to_string().as_bytes())?;
        }
        self.append(entry.to_string().as_bytes())
    }
}

/// Append-only JSONL audit trail
pub struct SecurityLogger {
    sink: Mutex<AuditSink>,
    audit_path: PathBuf,
}

impl SecurityLogger {
    pub fn new(audit_path: &Path) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BidboxError::Config(format!("Failed to create audit log directory: {}", e))
            })?;
        }

        let sink = AuditSink::open(audit_path)
            .map_err(|e| BidboxError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            sink: Mutex::new(sink),
            audit_path: audit_path.to_path_buf(),
        })
    }

    pub fn log_security_event(&self, event: &SecurityEvent) {
        let entry = event.to_log_entry();
        match self.sink.lock() {
            Ok(mut sink) => {
                if let Err(e) = sink.write_entry(&self.audit_path, &entry) {
                    error!("Failed to write to audit log: {}", e);
                }
            }
            Err(_) => error!("Failed to acquire lock on audit file"),
        }
    }

    pub fn audit_path(&self) -> &Path {
        &self.audit_path
    }
}

static SECURITY_LOGGER: OnceLock<SecurityLogger> = OnceLock::new();

/// Initialize the global file-backed audit trail.
pub fn init_security_logger(audit_path: &Path) -> Result<()> {
    let logger = SecurityLogger::new(audit_path)?;
    if SECURITY_LOGGER.set(logger).is_err() {
        warn!("Security logger already initialized");
    } else {
        info!("Audit trail at {}", audit_path.display());
    }
    Ok(())
}

/// Log a security event to the `log` facade and, if configured, the audit file
pub fn log_security_event(event: SecurityEvent) {
    let team = event
        .correlation
        .as_ref()
        .map(|c| c.team_id.as_str())
        .unwrap_or("-");
    match event.severity {
        SecuritySeverity::Critical | SecuritySeverity::High => {
            error!(target: AUDIT_TARGET, "{:?} [{}] {}", event.event_type, team, event.details)
        }
        SecuritySeverity::Medium => {
            warn!(target: AUDIT_TARGET, "{:?} [{}] {}", event.event_type, team, event.details)
        }
        SecuritySeverity::Low => {
            info!(target: AUDIT_TARGET, "{:?} [{}] {}", event.event_type, team, event.details)
        }
    }

    if let Some(logger) = SECURITY_LOGGER.get() {
        logger.log_security_event(&event);
    }
}

/// Convenience functions for common security events
pub mod events {
    use super::*;

    pub fn context_start(correlation: CorrelationIds, controls: &[String]) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ContextStart,
                format!("controls: {}", controls.join(",")),
            )
            .with_correlation(correlation),
        );
    }

    pub fn context_end(correlation: CorrelationIds, wall_ms: u128, verdict: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::ContextEnd,
                format!("verdict={} wall_ms={}", verdict, wall_ms),
            )
            .with_correlation(correlation),
        );
    }

    pub fn control_degraded(reason: String) {
        log_security_event(SecurityEvent::new(SecurityEventType::ControlDegraded, reason));
    }

    pub fn registration_rejected(team_id: &str, reason: String) {
        log_security_event(
            SecurityEvent::new(SecurityEventType::RegistrationRejected, reason)
                .with_correlation(CorrelationIds::new(team_id, "register")),
        );
    }

    pub fn call_failed(correlation: CorrelationIds, event_type: SecurityEventType, detail: String) {
        log_security_event(SecurityEvent::new(event_type, detail).with_correlation(correlation));
    }

    pub fn signal_escalation(correlation: CorrelationIds, forced: bool, waited_ms: u64) {
        let (event_type, details) = if forced {
            (
                SecurityEventType::ForcedKill,
                format!("SIGKILL after grace window ({} ms since SIGTERM)", waited_ms),
            )
        } else {
            (
                SecurityEventType::GracefulStop,
                format!("stopped by SIGTERM within {} ms", waited_ms),
            )
        };
        log_security_event(SecurityEvent::new(event_type, details).with_correlation(correlation));
    }

    pub fn serialization_loss(correlation: CorrelationIds, field: String, reason: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::SerializationLoss,
                format!("checkpoint field '{}' dropped: {}", field, reason),
            )
            .with_correlation(correlation)
            .with_field(field),
        );
    }

    pub fn checkpoint_rejected(correlation: CorrelationIds, reason: String) {
        log_security_event(
            SecurityEvent::new(SecurityEventType::CheckpointRejected, reason)
                .with_correlation(correlation),
        );
    }

    pub fn code_tampered(correlation: CorrelationIds, path: &Path) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::CodeTampered,
                "registered code digest changed; call refused".to_string(),
            )
            .with_correlation(correlation)
            .with_file_path(path.display().to_string()),
        );
    }

    pub fn output_truncated(correlation: CorrelationIds, stream: &str) {
        log_security_event(
            SecurityEvent::new(
                SecurityEventType::OutputLimitViolation,
                format!("{} exceeded its collection limit", stream),
            )
            .with_correlation(correlation),
        );
    }
}
