/// Core types and structures for the bidbox system
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Unique key of a competing team.
pub type TeamId = String;

/// Identifier of an auctioned item.
pub type ItemId = String;

/// Enforcement posture for isolation controls.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    /// Every configured control must apply, or the call fails.
    Strict,
    /// Controls that cannot apply are logged and skipped.
    Permissive,
}

impl Default for SecurityMode {
    fn default() -> Self {
        if nix::unistd::geteuid().is_root() {
            SecurityMode::Strict
        } else {
            SecurityMode::Permissive
        }
    }
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SecurityMode::Strict => write!(f, "strict"),
            SecurityMode::Permissive => write!(f, "permissive"),
        }
    }
}

/// Per-context process hardening applied before the guest program starts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationPolicy {
    pub security_mode: SecurityMode,
    /// The only environment variable a guest sees.
    pub path_env: String,
    /// RLIMIT_AS in bytes.
    pub memory_limit: Option<u64>,
    /// RLIMIT_CPU in seconds; a backstop behind the wall-clock deadline.
    pub cpu_time_limit_secs: Option<u64>,
    pub fd_limit: Option<u64>,
    pub file_size_limit: Option<u64>,
    /// RLIMIT_NPROC, only applied together with a credential drop.
    pub process_limit: Option<u64>,
    pub unshare_network: bool,
    /// Confine guest signals (kill, tgkill, sigqueue, pidfd) to the
    /// context's own process group with a seccomp filter.
    pub restrict_signals: bool,
    /// When the host runs as root, team `n` runs as uid/gid `base + n`.
    pub guest_uid_base: Option<u32>,
    /// Parent directory of the per-call working directories.
    pub scratch_root: PathBuf,
}

impl Default for IsolationPolicy {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::default(),
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            memory_limit: Some(512 * 1024 * 1024),
            cpu_time_limit_secs: Some(10),
            fd_limit: Some(64),
            file_size_limit: Some(16 * 1024 * 1024),
            process_limit: Some(16),
            unshare_network: nix::unistd::geteuid().is_root(),
            restrict_signals: true,
            guest_uid_base: Some(60000),
            scratch_root: std::env::temp_dir().join("bidbox"),
        }
    }
}

/// Agent executor knobs: deadlines, bounds and isolation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub call_timeout_ms: u64,
    /// Time between SIGTERM and SIGKILL for an overrunning context.
    pub grace_window_ms: u64,
    pub poll_interval_ms: u64,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    /// How long to wait for output collectors once the context is reaped.
    pub collection_timeout_ms: u64,
    pub max_checkpoint_bytes: usize,
    /// Upper bound on concurrently running contexts.
    pub max_workers: usize,
    pub isolation: IsolationPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 3000,
            grace_window_ms: 1000,
            poll_interval_ms: 10,
            stdout_limit: 2 * 1024 * 1024,
            stderr_limit: 256 * 1024,
            collection_timeout_ms: 500,
            max_checkpoint_bytes: 1024 * 1024,
            max_workers: 8,
            isolation: IsolationPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }
}

/// Game-level configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Number of sequential auction rounds (T).
    pub rounds: usize,
    pub initial_budget: f64,
    pub executor: ExecutorConfig,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            rounds: 15,
            initial_budget: 60.0,
            executor: ExecutorConfig::default(),
        }
    }
}

/// Custom error types for bidbox
#[derive(Error, Debug)]
pub enum BidboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid agent for team {team_id}: {reason}")]
    InvalidAgent { team_id: TeamId, reason: String },

    #[error("Game initialization failed: {0}")]
    GameInitFailed(String),

    #[error("Unknown team: {0}")]
    UnknownTeam(TeamId),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, BidboxError>;
