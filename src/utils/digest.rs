/// SHA-256 fingerprints of guest code
use sha2::{Digest, Sha256};
use std::io::{self, Read, Write};
use std::path::Path;

/// Copy `reader` into `writer` and return the hex SHA-256 of exactly the
/// bytes that were copied.
pub fn copy_sha256(reader: &mut impl Read, writer: &mut impl Write) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        writer.write_all(&chunk[..n])?;
    }
    writer.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a file's contents.
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    copy_sha256(&mut file, &mut io::sink())
}

/// Hex SHA-256 of in-memory bytes.
pub fn bytes_sha256(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn known_vector() {
        assert_eq!(
            bytes_sha256(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn copy_digest_covers_the_copied_bytes() {
        let mut copy = Vec::new();
        let digest = copy_sha256(&mut &b"guest code"[..], &mut copy).unwrap();
        assert_eq!(copy, b"guest code");
        assert_eq!(digest, bytes_sha256(b"guest code"));
    }

    #[test]
    fn file_digest_matches_bytes_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"guest code").unwrap();
        assert_eq!(file_sha256(file.path()).unwrap(), bytes_sha256(b"guest code"));
    }
}
