/// Bounded output collection for guest contexts
///
/// Collectors start as soon as the context is spawned so a chatty guest never
/// blocks on a full pipe. Bytes past a stream's limit are drained and
/// discarded. After the context is reaped the host waits at most the
/// collection timeout; a guest that leaked the pipe to an escaped process
/// cannot stall the host.
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Output integrity classification
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputIntegrity {
    #[default]
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    #[serde(rename = "collection_timed_out")]
    CollectionTimedOut,
    #[serde(rename = "read_error")]
    ReadError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::CollectionTimedOut => write!(f, "collection_timed_out"),
            OutputIntegrity::ReadError => write!(f, "read_error"),
        }
    }
}

/// Output limits configuration
#[derive(Debug, Clone)]
pub struct OutputLimits {
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    /// Post-reap wait for collectors.
    pub collection_timeout: Duration,
}

impl Default for OutputLimits {
    fn default() -> Self {
        OutputLimits {
            stdout_limit: 2 * 1024 * 1024,
            stderr_limit: 256 * 1024,
            collection_timeout: Duration::from_millis(500),
        }
    }
}

/// Output collection result
#[derive(Debug, Clone, Default)]
pub struct OutputResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
}

impl OutputResult {
    pub fn is_complete(&self) -> bool {
        self.stdout_integrity == OutputIntegrity::Complete
            && self.stderr_integrity == OutputIntegrity::Complete
    }
}

type StreamResult = (Vec<u8>, OutputIntegrity);

/// Collectors running alongside a live context.
pub struct PendingOutput {
    stdout_rx: Option<Receiver<StreamResult>>,
    stderr_rx: Option<Receiver<StreamResult>>,
    limits: OutputLimits,
}

/// Output collector with bounded collection
pub struct OutputCollector {
    limits: OutputLimits,
}

impl OutputCollector {
    pub fn new(limits: OutputLimits) -> Self {
        OutputCollector { limits }
    }

    /// Start draining both streams on background threads.
    pub fn start<O, E>(&self, stdout: Option<O>, stderr: Option<E>) -> PendingOutput
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        PendingOutput {
            stdout_rx: stdout.map(|s| spawn_collector(s, self.limits.stdout_limit)),
            stderr_rx: stderr.map(|s| spawn_collector(s, self.limits.stderr_limit)),
            limits: self.limits.clone(),
        }
    }
}

impl PendingOutput {
    /// Gather whatever the collectors produced, waiting at most the
    /// collection timeout in total.
    pub fn finish(self) -> OutputResult {
        let deadline = Instant::now() + self.limits.collection_timeout;
        let (stdout, stdout_integrity) = receive_until(self.stdout_rx, deadline);
        let (stderr, stderr_integrity) = receive_until(self.stderr_rx, deadline);
        OutputResult {
            stdout,
            stderr,
            stdout_integrity,
            stderr_integrity,
        }
    }
}

fn receive_until(rx: Option<Receiver<StreamResult>>, deadline: Instant) -> StreamResult {
    let Some(rx) = rx else {
        return (Vec::new(), OutputIntegrity::Complete);
    };
    let wait = deadline.saturating_duration_since(Instant::now());
    match rx.recv_timeout(wait) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => (Vec::new(), OutputIntegrity::CollectionTimedOut),
        Err(RecvTimeoutError::Disconnected) => (Vec::new(), OutputIntegrity::ReadError),
    }
}

fn spawn_collector<R: Read + Send + 'static>(stream: R, limit: usize) -> Receiver<StreamResult> {
    let (tx, rx) = channel();
    thread::spawn(move || collect_stream(stream, limit, tx));
    rx
}

/// Collect from a single stream with limit, draining past it.
fn collect_stream<R: Read>(mut stream: R, limit: usize, tx: Sender<StreamResult>) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut integrity = OutputIntegrity::Complete;

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(buffer.len());
                if n > room {
                    buffer.extend_from_slice(&chunk[..room]);
                    integrity = OutputIntegrity::TruncatedByLimit;
                } else {
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => {
                if integrity == OutputIntegrity::Complete {
                    integrity = OutputIntegrity::ReadError;
                }
                break;
            }
        }
    }

    let _ = tx.send((buffer, integrity));
}
