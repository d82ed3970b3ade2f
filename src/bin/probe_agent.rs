//! Adversarial test agent.
//!
//! `probe_agent <mode> [arg] [round]` behaves like a truthful bidder, except
//! that during `bid` it performs the selected probe. When `round` is given
//! the probe only fires in that round (rounds are counted from the agent's
//! own update history, so they follow its checkpoint lineage).
//!
//! Modes:
//! - `truthful`: no probe
//! - `counter`: bid the number of bids this lineage has seen
//! - `sleep SECS`: sleep before answering
//! - `stubborn SECS`: ignore SIGTERM, then sleep
//! - `crash`: panic
//! - `malformed`: print a garbled reply line and exit
//! - `nan`: bid NaN
//! - `decline`: answer every update with `false`
//! - `incomplete`: describe a shape without `budget`
//! - `memscan HEX`: scan own memory for the hex-decoded needle; bid the hit count
//! - `snoop`: try to read the host's environment and memory; bid successes
//! - `flood BYTES`: write BYTES of chatter to stderr
//! - `linger`: leave a background process holding stdout open
//! - `sabotage PATH`: try to overwrite PATH
//! - `hog MB`: touch MB megabytes of memory
//! - `escape PATH`: start a detached session that writes PATH a second later
//! - `hijack PATH`: rewrite the audit file at PATH, then signal the host;
//!   bid the number of signals delivered
//! - `inject`: raise its own budget, then try to write into the host's
//!   memory; bid the number of channels that opened

use bidbox::config::types::{ItemId, TeamId};
use bidbox::core::types::AgentInit;
use bidbox::guest::{serve, BiddingAgent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::process::CommandExt;
use std::process::{ExitCode, Stdio};
use std::time::Duration;

struct Probe {
    mode: String,
    arg: Option<String>,
    round: Option<u32>,
}

impl Probe {
    fn from_args() -> Self {
        let mut args = std::env::args().skip(1);
        Self {
            mode: args.next().unwrap_or_else(|| "truthful".to_string()),
            arg: args.next(),
            round: args.next().and_then(|r| r.parse().ok()),
        }
    }

    fn arg_u64(&self, default: u64) -> u64 {
        self.arg.as_deref().and_then(|a| a.parse().ok()).unwrap_or(default)
    }
}

#[derive(Serialize, Deserialize)]
struct ProbeAgent {
    team_id: TeamId,
    valuation_vector: BTreeMap<ItemId, f64>,
    budget: f64,
    bids_seen: u32,
    updates_seen: u32,
    history: Vec<String>,
}

impl ProbeAgent {
    fn truthful(&self, item_id: &str) -> f64 {
        self.valuation_vector
            .get(item_id)
            .copied()
            .unwrap_or(0.0)
            .min(self.budget)
            .max(0.0)
    }
}

impl BiddingAgent for ProbeAgent {
    fn new(init: AgentInit) -> Self {
        Self {
            team_id: init.team_id,
            valuation_vector: init.valuation_vector,
            budget: init.budget,
            bids_seen: 0,
            updates_seen: 0,
            history: Vec::new(),
        }
    }

    fn bid(&mut self, item_id: &str) -> f64 {
        self.bids_seen += 1;
        let probe = Probe::from_args();
        let current_round = self.updates_seen + 1;
        if probe.round.is_some_and(|r| r != current_round) {
            return self.truthful(item_id);
        }

        match probe.mode.as_str() {
            "counter" => self.bids_seen as f64,
            "sleep" => {
                std::thread::sleep(Duration::from_secs(probe.arg_u64(30)));
                self.truthful(item_id)
            }
            "stubborn" => {
                // SAFETY: installing SIG_IGN has no preconditions.
                unsafe {
                    libc::signal(libc::SIGTERM, libc::SIG_IGN);
                }
                std::thread::sleep(Duration::from_secs(probe.arg_u64(30)));
                self.truthful(item_id)
            }
            "crash" => panic!("probe crash in bid({})", item_id),
            "malformed" => {
                println!("@@bidbox-reply {{\"outcome\": {{\"status\": \"bid\", \"amount\": ");
                std::process::exit(0);
            }
            "nan" => f64::NAN,
            "memscan" => {
                let needle = probe
                    .arg
                    .as_deref()
                    .and_then(|h| hex::decode(h).ok())
                    .unwrap_or_default();
                scan_own_memory(&needle) as f64
            }
            "snoop" => snoop_host() as f64,
            "flood" => {
                let chunk = vec![b'x'; 64 * 1024];
                let mut remaining = probe.arg_u64(4 * 1024 * 1024) as usize;
                let mut stderr = std::io::stderr().lock();
                while remaining > 0 {
                    let n = remaining.min(chunk.len());
                    if stderr.write_all(&chunk[..n]).is_err() {
                        break;
                    }
                    remaining -= n;
                }
                self.truthful(item_id)
            }
            "linger" => {
                let _ = std::process::Command::new("sleep").arg("30").spawn();
                self.truthful(item_id)
            }
            "sabotage" => {
                let hit = probe.arg.as_deref().is_some_and(|path| {
                    std::fs::OpenOptions::new()
                        .write(true)
                        .truncate(true)
                        .open(path)
                        .and_then(|mut f| f.write_all(b"#!/bin/sh\necho sabotaged\n"))
                        .is_ok()
                });
                if hit {
                    1.0
                } else {
                    0.0
                }
            }
            "hog" => {
                let mb = probe.arg_u64(2048) as usize;
                let mut blocks: Vec<Vec<u8>> = Vec::new();
                for _ in 0..mb {
                    blocks.push(vec![1u8; 1024 * 1024]);
                }
                blocks.len() as f64
            }
            "escape" => {
                if let Some(path) = probe.arg.as_deref() {
                    let mut cmd = std::process::Command::new("/bin/sh");
                    cmd.arg("-c")
                        .arg(format!("sleep 1; echo alive > '{}'", path))
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null());
                    // SAFETY: setsid is async-signal-safe.
                    unsafe {
                        cmd.pre_exec(|| {
                            libc::setsid();
                            Ok(())
                        });
                    }
                    let _ = cmd.spawn();
                }
                self.truthful(item_id)
            }
            "hijack" => {
                if let Some(path) = probe.arg.as_deref() {
                    forge_audit(path);
                }
                signal_host() as f64
            }
            "inject" => {
                self.budget = 999_999.0;
                write_into_host() as f64
            }
            _ => self.truthful(item_id),
        }
    }

    fn update(&mut self, item_id: &str, winner_id: Option<&str>, price_paid: f64) -> bool {
        self.updates_seen += 1;
        if winner_id == Some(self.team_id.as_str()) {
            self.budget -= price_paid;
        }
        self.history.push(format!(
            "{}:{}:{:.2}",
            item_id,
            winner_id.unwrap_or("-"),
            price_paid
        ));
        Probe::from_args().mode != "decline"
    }
}

/// Count occurrences of `needle` in readable mappings of this process,
/// excluding the needle buffer itself.
fn scan_own_memory(needle: &[u8]) -> usize {
    if needle.is_empty() {
        return 0;
    }
    let own = needle.as_ptr() as usize;
    let (Ok(maps), Ok(mem)) = (File::open("/proc/self/maps"), File::open("/proc/self/mem")) else {
        return 0;
    };

    let mut hits = 0;
    let mut chunk = vec![0u8; 1 << 20];
    for line in BufReader::new(maps).lines().map_while(Result::ok) {
        let mut fields = line.split_whitespace();
        let (Some(range), Some(perms)) = (fields.next(), fields.next()) else {
            continue;
        };
        if !perms.starts_with('r') || line.contains("[vvar") || line.contains("[vsyscall]") {
            continue;
        }
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let (Ok(start), Ok(end)) = (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) else {
            continue;
        };

        let mut offset = start;
        while offset < end {
            let len = chunk.len().min(end - offset);
            let Ok(n) = mem.read_at(&mut chunk[..len], offset as u64) else {
                break;
            };
            if n == 0 {
                break;
            }
            if n >= needle.len() {
                for i in 0..=n - needle.len() {
                    if chunk[i] == needle[0]
                        && &chunk[i..i + needle.len()] == needle
                        && offset + i != own
                    {
                        hits += 1;
                    }
                }
            }
            chunk[..n].fill(0);
            // Overlap so matches across chunk borders are not missed.
            offset += n.saturating_sub(needle.len() - 1).max(1);
        }
    }
    hits
}

/// Try to read the host process's environment and memory.
fn snoop_host() -> u32 {
    // SAFETY: getppid has no preconditions.
    let host = unsafe { libc::getppid() };
    let mut successes = 0;

    if std::fs::read(format!("/proc/{}/environ", host)).is_ok_and(|env| !env.is_empty()) {
        successes += 1;
    }

    let maps = std::fs::read_to_string(format!("/proc/{}/maps", host)).unwrap_or_default();
    if let (Some(first), Ok(mem)) = (maps.lines().next(), File::open(format!("/proc/{}/mem", host))) {
        let start = first
            .split('-')
            .next()
            .and_then(|s| u64::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        let mut buf = [0u8; 64];
        if mem.read_at(&mut buf, start).is_ok_and(|n| n > 0) {
            successes += 1;
        }
    }
    successes
}

/// Wipe the audit file and leave a fabricated event in it.
fn forge_audit(path: &str) {
    let forged = "{\"event_type\":\"ContextEnd\",\"severity\":\"Low\",\"details\":\"forged\"}\n";
    let _ = std::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path);
    let _ = std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(forged.as_bytes()));
}

/// Try every way of delivering a signal to the host. Returns how many worked.
fn signal_host() -> u32 {
    // SAFETY: plain syscalls on pids; failures are reported through errno.
    unsafe {
        let host = libc::getppid();
        let mut delivered = 0;
        if libc::kill(host, libc::SIGTERM) == 0 {
            delivered += 1;
        }
        if libc::kill(host, libc::SIGKILL) == 0 {
            delivered += 1;
        }
        let group = libc::getpgid(host);
        if group > 0 && libc::kill(-group, libc::SIGTERM) == 0 {
            delivered += 1;
        }
        if libc::syscall(libc::SYS_tgkill, host, host, libc::SIGTERM) == 0 {
            delivered += 1;
        }
        let pidfd = libc::syscall(libc::SYS_pidfd_open, host, 0);
        if pidfd >= 0 {
            let sent = libc::syscall(
                libc::SYS_pidfd_send_signal,
                pidfd as libc::c_int,
                libc::SIGTERM,
                std::ptr::null::<libc::siginfo_t>(),
                0,
            );
            if sent == 0 {
                delivered += 1;
            }
            libc::close(pidfd as libc::c_int);
        }
        delivered
    }
}

/// Try to open a write channel into the host's memory. Whatever is read is
/// written back unchanged. Returns how many channels opened.
fn write_into_host() -> u32 {
    // SAFETY: getppid has no preconditions.
    let host = unsafe { libc::getppid() };
    let mut opened = 0;

    let maps = std::fs::read_to_string(format!("/proc/{}/maps", host)).unwrap_or_default();
    let writable = maps
        .lines()
        .find(|line| line.split_whitespace().nth(1).is_some_and(|p| p.starts_with("rw")))
        .and_then(|line| line.split('-').next())
        .and_then(|start| u64::from_str_radix(start, 16).ok());

    if let Ok(mem) = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(format!("/proc/{}/mem", host))
    {
        opened += 1;
        if let Some(addr) = writable {
            let mut buf = [0u8; 16];
            if mem.read_at(&mut buf, addr).is_ok_and(|n| n == buf.len()) {
                let _ = mem.write_at(&buf, addr);
            }
        }
    }

    // SAFETY: ptrace and process_vm_readv only report errors for a foreign pid.
    unsafe {
        if libc::ptrace(libc::PTRACE_SEIZE, host, 0, 0) == 0 {
            opened += 1;
            libc::ptrace(libc::PTRACE_DETACH, host, 0, 0);
        }
        if let Some(addr) = writable {
            let mut buf = [0u8; 16];
            let local = libc::iovec {
                iov_base: buf.as_mut_ptr().cast(),
                iov_len: buf.len(),
            };
            let remote = libc::iovec {
                iov_base: addr as *mut libc::c_void,
                iov_len: buf.len(),
            };
            if libc::process_vm_readv(host, &local, 1, &remote, 1, 0) > 0 {
                opened += 1;
            }
        }
    }
    opened
}

#[derive(Serialize, Deserialize)]
struct IncompleteAgent {
    team_id: TeamId,
    valuation_vector: BTreeMap<ItemId, f64>,
}

impl BiddingAgent for IncompleteAgent {
    fn new(init: AgentInit) -> Self {
        Self {
            team_id: init.team_id,
            valuation_vector: init.valuation_vector,
        }
    }

    fn bid(&mut self, _item_id: &str) -> f64 {
        0.0
    }

    fn update(&mut self, _item_id: &str, _winner_id: Option<&str>, _price_paid: f64) -> bool {
        true
    }
}

fn main() -> ExitCode {
    if Probe::from_args().mode == "incomplete" {
        return serve::<IncompleteAgent>();
    }
    serve::<ProbeAgent>()
}
