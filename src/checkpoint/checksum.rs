//! Content checksums for source files.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const CHUNK_SIZE: usize = 64 * 1024;

/// SHA-256 of the file at `path`, hex encoded.
///
/// Streams the file so large CSV extracts are never loaded whole.
pub fn file_checksum(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_checksum_tracks_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.csv");

        fs::write(&path, b"").unwrap();
        assert_eq!(
            file_checksum(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );

        fs::write(&path, vec![7u8; CHUNK_SIZE * 2 + 3]).unwrap();
        let first = file_checksum(&path).unwrap();
        assert_eq!(first.len(), 64);

        fs::write(&path, vec![7u8; CHUNK_SIZE * 2 + 4]).unwrap();
        assert_ne!(file_checksum(&path).unwrap(), first);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(file_checksum(&dir.path().join("missing")).is_err());
    }
}
