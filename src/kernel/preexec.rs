/// Pre-exec hardening for guest contexts
///
/// The plan is computed on the host and applied in the forked child before
/// exec. The child-side sequence is fixed:
/// 1. setsid() so the context owns its own process group
/// 2. unshare namespaces (network, IPC) as configured
/// 3. apply the rlimit set
/// 4. drop supplementary groups, then setresgid, then setresuid
/// 5. prctl(PR_SET_PDEATHSIG, SIGKILL), re-armed after the credential change
/// 6. prctl(PR_SET_NO_NEW_PRIVS, 1)
/// 7. the signal filter from `kernel::seccomp`
///
/// Before any of that, the sealed code image (if any) is made inheritable so
/// the context can exec it through `/proc/self/fd`.
///
/// Only async-signal-safe libc calls run between fork and exec: no
/// allocation, no logging, no locks.
use crate::config::types::{IsolationPolicy, SecurityMode};
use crate::kernel::seccomp::SignalFilter;
use std::io;
use std::os::fd::RawFd;

/// Single resource limit to apply in the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: libc::__rlimit_resource_t,
    pub value: u64,
}

/// Everything the child must do before exec, precomputed on the host.
#[derive(Clone, Debug)]
pub struct PreExecPlan {
    pub strict: bool,
    pub rlimits: Vec<RlimitSetting>,
    pub unshare_flags: libc::c_int,
    pub credentials: Option<(libc::uid_t, libc::gid_t)>,
    /// Host pid observed before fork; the child exits if it was reparented.
    pub host_pid: libc::pid_t,
    pub signal_filter: Option<SignalFilter>,
    /// Descriptor of the sealed code image the context execs.
    pub exec_fd: Option<RawFd>,
}

impl PreExecPlan {
    /// Build the plan for one context. `slot` selects the per-team uid.
    pub fn from_policy(policy: &IsolationPolicy, slot: u32) -> Self {
        let running_as_root = nix::unistd::geteuid().is_root();
        let credentials = match policy.guest_uid_base {
            Some(base) if running_as_root => {
                let id = base.saturating_add(slot);
                Some((id as libc::uid_t, id as libc::gid_t))
            }
            _ => None,
        };

        let mut rlimits = vec![RlimitSetting {
            name: "RLIMIT_CORE",
            resource: libc::RLIMIT_CORE,
            value: 0,
        }];
        if let Some(bytes) = policy.memory_limit {
            rlimits.push(RlimitSetting {
                name: "RLIMIT_AS",
                resource: libc::RLIMIT_AS,
                value: bytes,
            });
        }
        if let Some(secs) = policy.cpu_time_limit_secs {
            rlimits.push(RlimitSetting {
                name: "RLIMIT_CPU",
                resource: libc::RLIMIT_CPU,
                value: secs,
            });
        }
        if let Some(fds) = policy.fd_limit {
            rlimits.push(RlimitSetting {
                name: "RLIMIT_NOFILE",
                resource: libc::RLIMIT_NOFILE,
                value: fds,
            });
        }
        if let Some(bytes) = policy.file_size_limit {
            rlimits.push(RlimitSetting {
                name: "RLIMIT_FSIZE",
                resource: libc::RLIMIT_FSIZE,
                value: bytes,
            });
        }
        // NPROC counts per uid; on a shared uid it would throttle the host.
        if let (Some(procs), Some(_)) = (policy.process_limit, credentials) {
            rlimits.push(RlimitSetting {
                name: "RLIMIT_NPROC",
                resource: libc::RLIMIT_NPROC,
                value: procs,
            });
        }

        let mut unshare_flags = 0;
        if policy.unshare_network {
            unshare_flags |= libc::CLONE_NEWNET | libc::CLONE_NEWIPC;
        }

        Self {
            strict: policy.security_mode == SecurityMode::Strict,
            rlimits,
            unshare_flags,
            credentials,
            host_pid: nix::unistd::getpid().as_raw(),
            signal_filter: if policy.restrict_signals {
                SignalFilter::new()
            } else {
                None
            },
            exec_fd: None,
        }
    }

    pub fn with_exec_fd(mut self, fd: Option<RawFd>) -> Self {
        self.exec_fd = fd;
        self
    }

    /// Names of the controls this plan will attempt, for evidence/audit.
    pub fn configured_controls(&self) -> Vec<String> {
        let mut controls = vec!["process_group".to_string()];
        if self.unshare_flags != 0 {
            controls.push("network_namespace".to_string());
        }
        controls.extend(self.rlimits.iter().map(|r| r.name.to_ascii_lowercase()));
        if self.credentials.is_some() {
            controls.push("credential_drop".to_string());
        }
        controls.push("parent_death_signal".to_string());
        controls.push("no_new_privileges".to_string());
        if self.signal_filter.is_some() {
            controls.push("signal_filter".to_string());
        }
        if self.exec_fd.is_some() {
            controls.push("sealed_code".to_string());
        }
        controls
    }

    /// Apply the plan in the forked child.
    ///
    /// # Safety
    /// Must only be called between fork and exec (from `CommandExt::pre_exec`).
    pub unsafe fn apply_in_child(&mut self) -> io::Result<()> {
        if let Some(fd) = self.exec_fd {
            if libc::fcntl(fd, libc::F_SETFD, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if libc::setsid() < 0 {
            self.fail_or_continue()?;
        }

        if self.unshare_flags != 0 && libc::unshare(self.unshare_flags) != 0 {
            self.fail_or_continue()?;
        }

        for setting in &self.rlimits {
            let limit = libc::rlimit {
                rlim_cur: setting.value as libc::rlim_t,
                rlim_max: setting.value as libc::rlim_t,
            };
            if libc::setrlimit(setting.resource, &limit) != 0 {
                self.fail_or_continue()?;
            }
        }

        if let Some((uid, gid)) = self.credentials {
            // Credential failures are always fatal: running as root is never
            // an acceptable fallback.
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setresgid(gid, gid, gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setresuid(uid, uid, uid) != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0) != 0 {
            self.fail_or_continue()?;
        }
        if libc::getppid() != self.host_pid {
            libc::_exit(137);
        }

        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
            self.fail_or_continue()?;
        }

        let strict = self.strict;
        if let Some(filter) = self.signal_filter.as_mut() {
            if let Err(e) = filter.install() {
                if strict {
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    fn fail_or_continue(&self) -> io::Result<()> {
        if self.strict {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Mark the host process non-dumpable.
///
/// Guests sharing the host uid then can no longer open the host's
/// `/proc/<pid>/mem`, `environ` or `maps`, nor ptrace it. The flag is reset
/// on exec, so it never carries over to guests.
pub fn harden_host() -> io::Result<()> {
    // SAFETY: plain prctl on the calling process.
    if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permissive_policy() -> IsolationPolicy {
        IsolationPolicy {
            security_mode: SecurityMode::Permissive,
            unshare_network: false,
            ..IsolationPolicy::default()
        }
    }

    #[test]
    fn core_dumps_always_disabled() {
        let plan = PreExecPlan::from_policy(&permissive_policy(), 0);
        assert!(plan
            .rlimits
            .iter()
            .any(|r| r.resource == libc::RLIMIT_CORE && r.value == 0));
        assert!(!plan.strict);
    }

    #[test]
    fn credential_drop_depends_on_root() {
        let policy = permissive_policy();
        let plan = PreExecPlan::from_policy(&policy, 3);
        if nix::unistd::geteuid().is_root() {
            assert_eq!(plan.credentials, Some((60003, 60003)));
            assert!(plan.rlimits.iter().any(|r| r.name == "RLIMIT_NPROC"));
        } else {
            assert!(plan.credentials.is_none());
            assert!(!plan.rlimits.iter().any(|r| r.name == "RLIMIT_NPROC"));
        }
    }

    #[test]
    fn unshare_flags_follow_policy() {
        let mut policy = permissive_policy();
        assert_eq!(PreExecPlan::from_policy(&policy, 0).unshare_flags, 0);
        policy.unshare_network = true;
        let plan = PreExecPlan::from_policy(&policy, 0);
        assert_ne!(plan.unshare_flags & libc::CLONE_NEWNET, 0);
        assert!(plan
            .configured_controls()
            .contains(&"network_namespace".to_string()));
    }

    #[test]
    fn host_hardening_clears_dumpable() {
        harden_host().unwrap();
        assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE, 0, 0, 0, 0) }, 0);
    }

    #[test]
    fn configured_controls_lists_hardening() {
        let plan = PreExecPlan::from_policy(&permissive_policy(), 0);
        let controls = plan.configured_controls();
        assert!(controls.contains(&"no_new_privileges".to_string()));
        assert!(controls.contains(&"rlimit_as".to_string()));
        assert!(!controls.contains(&"sealed_code".to_string()));
    }

    #[test]
    fn signal_filter_follows_policy() {
        let mut policy = permissive_policy();
        let plan = PreExecPlan::from_policy(&policy, 0);
        assert_eq!(plan.signal_filter.is_some(), SignalFilter::new().is_some());
        assert_eq!(plan.host_pid as u32, std::process::id());

        policy.restrict_signals = false;
        let plan = PreExecPlan::from_policy(&policy, 0).with_exec_fd(Some(7));
        assert!(plan.signal_filter.is_none());
        assert_eq!(plan.exec_fd, Some(7));
        assert!(plan
            .configured_controls()
            .contains(&"sealed_code".to_string()));
    }
}
