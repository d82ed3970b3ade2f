/// Signal confinement for guest contexts
///
/// Contexts that share the host uid could otherwise signal the host, its
/// threads or sibling contexts. The filter built here lets the signalling
/// syscalls through only when they target the context leader itself or its
/// process group; everything else fails with EPERM. The leader's pid is not
/// known until fork, so it is patched into the program in the child.
///
/// Denied targets include the host pid, any host thread id, the host's
/// process group and `-1`, since none of them equals the leader's pid.
use std::io;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

// BPF_LD|BPF_W|BPF_ABS, BPF_JMP|BPF_JEQ|BPF_K, BPF_JMP|BPF_JGE|BPF_K, BPF_RET|BPF_K
const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JEQ_K: u16 = 0x15;
const BPF_JGE_K: u16 = 0x35;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// struct seccomp_data: nr, arch, instruction_pointer, args[6].
const OFFSET_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARG0_LOW: u32 = 16;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH: u32 = 0xC000_003E;
#[cfg(target_arch = "x86_64")]
const FOREIGN_NR_FLOOR: u32 = 0x4000_0000; // x32 ABI bit
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH: u32 = 0xC000_00B7;
#[cfg(target_arch = "aarch64")]
const FOREIGN_NR_FLOOR: u32 = u32::MAX;

/// Where the child writes its own pid (or its negation) before install.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Patch {
    Leader,
    LeaderGroup,
}

/// Seccomp program confining signals to the context's own process group.
#[derive(Clone, Debug)]
pub struct SignalFilter {
    program: Vec<BpfInsn>,
    patches: Vec<(usize, Patch)>,
}

fn stmt(code: u16, k: u32) -> BpfInsn {
    BpfInsn { code, jt: 0, jf: 0, k }
}

fn jump(code: u16, k: u32, jt: u8, jf: u8) -> BpfInsn {
    BpfInsn { code, jt, jf, k }
}

/// A target the filter compares the first argument against.
#[derive(Clone, Copy)]
enum Target {
    Fixed(u32),
    Patched(Patch),
}

impl SignalFilter {
    /// Build the filter, or `None` on architectures it does not cover.
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    pub fn new() -> Option<Self> {
        let mut filter = Self {
            program: vec![
                stmt(BPF_LD_W_ABS, OFFSET_ARCH),
                jump(BPF_JEQ_K, AUDIT_ARCH, 1, 0),
                stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
                stmt(BPF_LD_W_ABS, OFFSET_NR),
                jump(BPF_JGE_K, FOREIGN_NR_FLOOR, 0, 1),
                stmt(BPF_RET_K, SECCOMP_RET_KILL_PROCESS),
            ],
            patches: Vec::new(),
        };

        let leader = Target::Patched(Patch::Leader);
        let group = Target::Patched(Patch::LeaderGroup);
        // kill(0, sig) addresses the caller's own group.
        filter.allow_first_arg(libc::SYS_kill, &[leader, group, Target::Fixed(0)]);
        filter.allow_first_arg(libc::SYS_tgkill, &[leader]);
        filter.allow_first_arg(libc::SYS_rt_sigqueueinfo, &[leader]);
        filter.allow_first_arg(libc::SYS_rt_tgsigqueueinfo, &[leader]);
        // prlimit64(0, ..) is how setrlimit reaches the kernel.
        filter.allow_first_arg(libc::SYS_prlimit64, &[leader, Target::Fixed(0)]);
        filter.deny(libc::SYS_tkill);
        filter.deny(libc::SYS_pidfd_send_signal);
        filter.program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
        Some(filter)
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn new() -> Option<Self> {
        None
    }

    /// Allow `nr` only when its first argument equals one of `targets`.
    ///
    /// Expects the syscall number in the accumulator and leaves it there
    /// when `nr` does not match.
    fn allow_first_arg(&mut self, nr: libc::c_long, targets: &[Target]) {
        let n = targets.len();
        self.program
            .push(jump(BPF_JEQ_K, nr as u32, 0, (n + 3) as u8));
        self.program.push(stmt(BPF_LD_W_ABS, OFFSET_ARG0_LOW));
        for (i, target) in targets.iter().enumerate() {
            let k = match target {
                Target::Fixed(k) => *k,
                Target::Patched(patch) => {
                    self.patches.push((self.program.len(), *patch));
                    0
                }
            };
            // Matches jump over the remaining compares and the deny.
            self.program.push(jump(BPF_JEQ_K, k, (n - i) as u8, 0));
        }
        self.program
            .push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | libc::EPERM as u32));
        self.program.push(stmt(BPF_RET_K, SECCOMP_RET_ALLOW));
    }

    fn deny(&mut self, nr: libc::c_long) {
        self.program.push(jump(BPF_JEQ_K, nr as u32, 0, 1));
        self.program
            .push(stmt(BPF_RET_K, SECCOMP_RET_ERRNO | libc::EPERM as u32));
    }

    pub fn instructions(&self) -> &[BpfInsn] {
        &self.program
    }

    /// Patch in the caller's pid and load the filter.
    ///
    /// # Safety
    /// Must only be called between fork and exec, after
    /// `PR_SET_NO_NEW_PRIVS`. Performs no allocation.
    pub unsafe fn install(&mut self) -> io::Result<()> {
        let pid = libc::getpid();
        for &(index, patch) in &self.patches {
            self.program[index].k = match patch {
                Patch::Leader => pid as u32,
                Patch::LeaderGroup => pid.wrapping_neg() as u32,
            };
        }
        let prog = libc::sock_fprog {
            len: self.program.len() as libc::c_ushort,
            filter: self.program.as_mut_ptr().cast::<libc::sock_filter>(),
        };
        if libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog as libc::c_ulong,
            0,
            0,
        ) != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    #[test]
    fn program_ends_in_allow_and_patches_every_own_pid_slot() {
        let filter = SignalFilter::new().unwrap();
        let program = filter.instructions();
        assert_eq!(program.last().unwrap().k, SECCOMP_RET_ALLOW);
        // kill carries two patched targets, the other four one each.
        assert_eq!(filter.patches.len(), 6);
        assert!(program.len() < 256);
        for (index, _) in &filter.patches {
            assert_eq!(program[*index].code, BPF_JEQ_K);
        }
    }

    #[test]
    fn filtered_shell_can_signal_itself_but_not_a_bystander() {
        let mut bystander = Command::new("sleep").arg("30").spawn().unwrap();
        let script = format!(
            "kill -0 $$ || exit 3; kill -KILL {} && exit 4; exit 0",
            bystander.id()
        );

        let mut filter = SignalFilter::new().unwrap();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        // SAFETY: only prctl and the allocation-free install run in the child.
        unsafe {
            cmd.pre_exec(move || {
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                filter.install()
            });
        }
        let status = cmd.status().unwrap();

        assert_eq!(status.code(), Some(0));
        assert!(bystander.try_wait().unwrap().is_none());
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }
}
