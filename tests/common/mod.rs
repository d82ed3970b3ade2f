//! Shared helpers for integration tests.
//!
//! Guest binaries are copied into a world-readable temp directory so that
//! contexts running under a dropped per-team uid (when the tests run as
//! root) can still exec them.

#![allow(dead_code)]

use bidbox::config::types::{ExecutorConfig, IsolationPolicy, SecurityMode};
use bidbox::executor::CodeSource;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Stage {
    pub dir: TempDir,
}

impl Stage {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        Self { dir }
    }

    /// Copy a built agent binary into the stage under `name`.
    pub fn install(&self, binary: &str, name: &str) -> PathBuf {
        let target = self.dir.path().join(name);
        std::fs::copy(binary, &target).unwrap();
        std::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755)).unwrap();
        target
    }

    pub fn truthful(&self, name: &str) -> CodeSource {
        CodeSource::executable(self.install(env!("CARGO_BIN_EXE_truthful_agent"), name))
    }

    pub fn probe(&self, args: &[&str]) -> CodeSource {
        let path = self.dir.path().join("probe_agent");
        if !path.exists() {
            self.install(env!("CARGO_BIN_EXE_probe_agent"), "probe_agent");
        }
        CodeSource::Executable {
            path,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        executor_config(&self.scratch())
    }
}

pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

pub fn executor_config(scratch: &Path) -> ExecutorConfig {
    ExecutorConfig {
        call_timeout_ms: 3000,
        grace_window_ms: 200,
        isolation: IsolationPolicy {
            security_mode: SecurityMode::Permissive,
            unshare_network: false,
            guest_uid_base: if running_as_root() { Some(61000) } else { None },
            scratch_root: scratch.to_path_buf(),
            ..IsolationPolicy::default()
        },
        ..ExecutorConfig::default()
    }
}

pub fn valuations(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}
