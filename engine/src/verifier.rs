//! Post-copy verification by SHA-256 digest comparison.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

const READ_BUFFER: usize = 64 * 1024;

/// SHA-256 digest of a file.
pub fn sha256_file(path: &Path) -> EngineResult<[u8; 32]> {
    let mut file = File::open(path).map_err(|e| EngineError::read(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::read(path, e)),
        }
    }

    Ok(hasher.finalize().into())
}

/// Lowercase hex form of a digest, for logs.
pub fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

async fn digest_on_blocking_thread(path: PathBuf) -> EngineResult<[u8; 32]> {
    tokio::task::spawn_blocking(move || sha256_file(&path)).await?
}

/// Hash both files concurrently and compare.
///
/// Returns `false` when either file is missing or unreadable.
pub async fn verify(source: &Path, destination: &Path) -> bool {
    let result = tokio::try_join!(
        digest_on_blocking_thread(source.to_path_buf()),
        digest_on_blocking_thread(destination.to_path_buf()),
    );

    match result {
        Ok((src, dst)) => {
            if src != dst {
                warn!(
                    source = %source.display(),
                    destination = %destination.display(),
                    source_sha256 = %to_hex(&src),
                    destination_sha256 = %to_hex(&dst),
                    "checksum mismatch"
                );
            }
            src == dst
        }
        Err(err) => {
            warn!(
                source = %source.display(),
                destination = %destination.display(),
                error = %err,
                "verification could not read files"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sha256_known_value() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("abc.txt");
        fs::write(&path, b"abc").expect("Failed to write file");

        let digest = sha256_file(&path).expect("Failed to hash");
        assert_eq!(
            to_hex(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_identical_files_verify() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.bin");
        let b = temp_dir.path().join("b.bin");
        let data = vec![7u8; 200_000];
        fs::write(&a, &data).expect("Failed to write file");
        fs::write(&b, &data).expect("Failed to write file");

        assert!(verify(&a, &b).await);
    }

    #[tokio::test]
    async fn test_single_byte_difference_fails() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.bin");
        let b = temp_dir.path().join("b.bin");
        let mut data = vec![1u8; 100_000];
        fs::write(&a, &data).expect("Failed to write file");
        data[50_000] = 2;
        fs::write(&b, &data).expect("Failed to write file");

        assert!(!verify(&a, &b).await);
    }

    #[tokio::test]
    async fn test_missing_file_fails_closed() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let a = temp_dir.path().join("a.bin");
        fs::write(&a, b"x").expect("Failed to write file");

        assert!(!verify(&a, &temp_dir.path().join("missing.bin")).await);
    }
}
