/// Pluggable guest code sources
///
/// A code source says how to start a guest program. Nothing is loaded into
/// the host: executables are copied into a sealed image at registration and
/// exec'd from it inside the context, inline source is passed to an
/// interpreter through argv.
use crate::config::types::{BidboxError, Result};
use crate::kernel::sealed::SealedImage;
use crate::utils::digest::{bytes_sha256, file_sha256};
use log::warn;
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeSource {
    /// A program on disk: a compiled agent or a script with a shebang.
    Executable {
        path: PathBuf,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Source text run by an interpreter, e.g. `["sh", "-c"]`.
    Inline {
        interpreter: Vec<String>,
        source: String,
    },
}

impl CodeSource {
    pub fn executable(path: impl Into<PathBuf>) -> Self {
        CodeSource::Executable {
            path: path.into(),
            args: Vec::new(),
        }
    }

    pub fn inline(interpreter: &[&str], source: impl Into<String>) -> Self {
        CodeSource::Inline {
            interpreter: interpreter.iter().map(|s| s.to_string()).collect(),
            source: source.into(),
        }
    }

    /// Resolve the program and argv, fingerprinting on-disk code.
    ///
    /// Executables are sealed into memory so later calls run exactly the
    /// bytes hashed here. When sealing is unavailable the on-disk path is
    /// exec'd instead; `is_sealed` reports which.
    pub fn prepare(&self) -> Result<PreparedCode> {
        match self {
            CodeSource::Executable { path, args } => {
                let origin = std::fs::canonicalize(path).map_err(|e| {
                    BidboxError::Config(format!("code path {}: {}", path.display(), e))
                })?;
                if !origin.is_file() {
                    return Err(BidboxError::Config(format!(
                        "code path {} is not a file",
                        origin.display()
                    )));
                }
                let (program, digest, image) = match SealedImage::from_path(&origin) {
                    Ok(image) => (
                        image.exec_path().to_path_buf(),
                        image.digest().to_string(),
                        Some(Arc::new(image)),
                    ),
                    Err(e) => {
                        warn!("cannot seal {}: {}; exec'ing from disk", origin.display(), e);
                        (origin.clone(), file_sha256(&origin)?, None)
                    }
                };
                Ok(PreparedCode {
                    program,
                    args: args.clone(),
                    fingerprint: digest.clone(),
                    digest: Some(digest),
                    origin: Some(origin),
                    image,
                })
            }
            CodeSource::Inline {
                interpreter,
                source,
            } => {
                let (program, flags) = interpreter.split_first().ok_or_else(|| {
                    BidboxError::Config("inline code source needs an interpreter".to_string())
                })?;
                let mut args = flags.to_vec();
                args.push(source.clone());
                Ok(PreparedCode {
                    program: PathBuf::from(program),
                    args,
                    digest: None,
                    fingerprint: bytes_sha256(source.as_bytes()),
                    origin: None,
                    image: None,
                })
            }
        }
    }
}

/// Registration-time snapshot of how to launch a team's code.
#[derive(Clone, Debug)]
pub struct PreparedCode {
    program: PathBuf,
    args: Vec<String>,
    /// On-disk digest, re-verified before each call.
    digest: Option<String>,
    fingerprint: String,
    /// The registered file, for executable sources.
    origin: Option<PathBuf>,
    image: Option<Arc<SealedImage>>,
}

impl PreparedCode {
    /// What the context execs: the sealed image's fd path when there is one.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// File the code was registered from; the program itself for inline code.
    pub fn origin(&self) -> &Path {
        self.origin.as_deref().unwrap_or(&self.program)
    }

    /// Descriptor the context must inherit to exec the sealed image.
    pub fn exec_fd(&self) -> Option<RawFd> {
        self.image.as_ref().map(|image| image.raw_fd())
    }

    /// Whether an executable source runs from a sealed image.
    pub fn is_sealed(&self) -> bool {
        self.origin.is_none() || self.image.is_some()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// SHA-256 of the code as registered, for logs.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Re-hash the registered file and compare with the registration digest.
    pub fn verify(&self) -> std::result::Result<(), String> {
        let Some(expected) = &self.digest else {
            return Ok(());
        };
        let origin = self.origin();
        match file_sha256(origin) {
            Ok(actual) if &actual == expected => Ok(()),
            Ok(actual) => Err(format!(
                "digest of {} changed: {} -> {}",
                origin.display(),
                &expected[..12],
                &actual[..12]
            )),
            Err(e) => Err(format!("cannot read {}: {}", origin.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn inline_source_goes_through_argv() {
        let prepared = CodeSource::inline(&["sh", "-c"], "echo hi").prepare().unwrap();
        assert_eq!(prepared.program(), Path::new("sh"));
        assert_eq!(prepared.args(), &["-c".to_string(), "echo hi".to_string()]);
        assert!(prepared.digest().is_none());
        assert!(prepared.exec_fd().is_none());
        assert_eq!(prepared.origin(), Path::new("sh"));
        assert_eq!(prepared.fingerprint(), bytes_sha256(b"echo hi"));
        assert!(prepared.verify().is_ok());
    }

    #[test]
    fn empty_interpreter_is_rejected() {
        let source = CodeSource::Inline {
            interpreter: vec![],
            source: "x".to_string(),
        };
        assert!(source.prepare().is_err());
    }

    #[test]
    fn executable_digest_detects_modification() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "#!/bin/sh\necho one").unwrap();
        let prepared = CodeSource::executable(file.path()).prepare().unwrap();
        assert!(prepared.verify().is_ok());

        writeln!(file, "echo two").unwrap();
        file.flush().unwrap();
        assert!(prepared.verify().unwrap_err().contains("changed"));
    }

    #[test]
    fn executable_runs_from_sealed_copy_not_the_disk_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, b"#!/bin/sh\necho registered\n").unwrap();
        let prepared = CodeSource::executable(&path).prepare().unwrap();

        assert!(prepared.is_sealed());
        let fd = prepared.exec_fd().unwrap();
        assert_eq!(prepared.program(), Path::new(&format!("/proc/self/fd/{}", fd)));
        assert_eq!(prepared.origin(), std::fs::canonicalize(&path).unwrap());

        // A rename over the registered path leaves the sealed bytes alone.
        let swap = dir.path().join("swap.sh");
        std::fs::write(&swap, b"#!/bin/sh\necho swapped\n").unwrap();
        std::fs::rename(&swap, &path).unwrap();
        assert!(prepared.verify().is_err());
        assert_eq!(
            std::fs::read(prepared.program()).unwrap(),
            b"#!/bin/sh\necho registered\n"
        );

        // Clones share the image, so its descriptor stays open.
        let clone = prepared.clone();
        drop(prepared);
        assert_eq!(clone.exec_fd(), Some(fd));
        assert!(std::fs::read(clone.program()).is_ok());
    }

    #[test]
    fn missing_executable_is_config_error() {
        let err = CodeSource::executable("/nonexistent/agent").prepare().unwrap_err();
        assert!(matches!(err, BidboxError::Config(_)));
    }

    #[test]
    fn manifest_form_deserializes() {
        let source: CodeSource =
            serde_json::from_str(r#"{"kind":"executable","path":"/bin/true"}"#).unwrap();
        assert_eq!(source, CodeSource::executable("/bin/true"));
    }
}
