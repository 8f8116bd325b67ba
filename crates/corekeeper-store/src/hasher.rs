//! Streaming SHA-256 content hashing for archives and installed binaries.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Result, StoreError};

/// Default read size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Compute the lowercase hex SHA-256 of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    sha256_file_chunked(path, DEFAULT_CHUNK_SIZE)
}

/// Compute the lowercase hex SHA-256 of the file at `path`, reading at most
/// `chunk_size` bytes at a time. A zero chunk size is treated as 1.
pub fn sha256_file_chunked(path: &Path, chunk_size: usize) -> Result<String> {
    let mut file = File::open(path).map_err(|e| StoreError::from_io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StoreError::from_io(path, e)),
        };
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare two hex digests ignoring ASCII case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Hash `path` and fail with `ChecksumMismatch` unless it equals `expected`.
/// Returns the computed digest.
pub fn verify_file(path: &Path, expected: &str) -> Result<String> {
    let actual = sha256_file(path)?;
    if !digests_match(expected, &actual) {
        return Err(StoreError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: expected.to_ascii_lowercase(),
            actual,
        });
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_known_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hello");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_chunk_size_does_not_change_digest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let whole = sha256_file(&path).unwrap();
        assert_eq!(sha256_file_chunked(&path, 7).unwrap(), whole);
        assert_eq!(sha256_file_chunked(&path, 0).unwrap(), whole);
        assert_eq!(sha256_file_chunked(&path, 10_000).unwrap(), whole);
    }

    #[test]
    fn test_copy_hashes_identically_and_flip_changes_digest() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("a");
        let copy = dir.path().join("b");
        let data = vec![0x5Au8; 4096];
        std::fs::write(&original, &data).unwrap();
        std::fs::copy(&original, &copy).unwrap();

        let a = sha256_file(&original).unwrap();
        assert_eq!(a, sha256_file(&copy).unwrap());

        for idx in [0usize, 2048, 4095] {
            let mut flipped = data.clone();
            flipped[idx] ^= 0x01;
            std::fs::write(&copy, &flipped).unwrap();
            assert_ne!(a, sha256_file(&copy).unwrap(), "flip at {idx}");
        }
    }

    #[test]
    fn test_missing_file_is_file_missing() {
        let dir = tempdir().unwrap();
        let err = sha256_file(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileMissing);
    }

    #[test]
    fn test_verify_file_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bin");
        std::fs::write(&path, b"payload").unwrap();

        let err = verify_file(&path, &"0".repeat(64)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);

        let actual = sha256_file(&path).unwrap();
        assert_eq!(
            verify_file(&path, &actual.to_ascii_uppercase()).unwrap(),
            actual
        );
    }
}
