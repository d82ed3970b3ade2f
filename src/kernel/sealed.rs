/// Sealed in-memory copies of guest executables
///
/// At registration an executable is copied once into a memfd, hashed from
/// the bytes copied, and sealed against writes and resizes. Contexts exec
/// the sealed copy through `/proc/self/fd/<n>`, so the program that runs is
/// always the program that was hashed, whatever happens to the file on disk.
use crate::utils::digest::copy_sha256;
use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

// Not exported by every libc release; kernels before 6.3 reject it.
const MFD_EXEC: libc::c_uint = 0x0010;

const IMAGE_NAME: &[u8] = b"bidbox-guest\0";

#[derive(Debug)]
pub struct SealedImage {
    file: File,
    digest: String,
    exec_path: PathBuf,
}

impl SealedImage {
    /// Copy `path` into a sealed memfd.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let mut source = File::open(path)?;
        let mut file = File::from(create_memfd()?);
        let digest = copy_sha256(&mut source, &mut file)?;

        let seals = libc::F_SEAL_WRITE | libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL;
        // SAFETY: fcntl on a descriptor owned by `file`.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let exec_path = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
        Ok(Self {
            file,
            digest,
            exec_path,
        })
    }

    /// SHA-256 of the sealed bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Path that resolves to the image in any process holding the descriptor.
    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

fn create_memfd() -> io::Result<OwnedFd> {
    let name = CStr::from_bytes_with_nul(IMAGE_NAME)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let flags = libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING;
    // SAFETY: `name` is NUL-terminated; a non-negative result is a fresh fd.
    let mut fd = unsafe { libc::memfd_create(name.as_ptr(), flags | MFD_EXEC) };
    if fd < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINVAL) {
        // SAFETY: as above.
        fd = unsafe { libc::memfd_create(name.as_ptr(), flags) };
    }
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by memfd_create and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::digest::bytes_sha256;
    use std::io::Write;

    #[test]
    fn image_keeps_registered_bytes_after_disk_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sh");
        std::fs::write(&path, b"#!/bin/sh\necho registered\n").unwrap();

        let image = SealedImage::from_path(&path).unwrap();
        std::fs::write(&path, b"#!/bin/sh\necho swapped\n").unwrap();

        assert_eq!(image.digest(), bytes_sha256(b"#!/bin/sh\necho registered\n"));
        assert_eq!(
            std::fs::read(image.exec_path()).unwrap(),
            b"#!/bin/sh\necho registered\n"
        );
    }

    #[test]
    fn image_refuses_writes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"original").unwrap();
        let image = SealedImage::from_path(file.path()).unwrap();

        let rewrite = std::fs::OpenOptions::new()
            .write(true)
            .open(image.exec_path())
            .and_then(|mut f| f.write_all(b"tampered"));
        assert!(rewrite.is_err());
        assert_eq!(std::fs::read(image.exec_path()).unwrap(), b"original");
    }
}
