use blake3::Hasher;

use crate::chunk::{ContentHash, FileManifest};
use crate::integrity::error::{IntegrityError, IntegrityResult};

pub struct IntegrityVerifier;

impl IntegrityVerifier {
    /// Calculate BLAKE3 checksum for byte slice
    pub fn calculate_checksum(data: &[u8]) -> ContentHash {
        let mut hasher = Hasher::new();
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Verify bytes received from a peer against the hash recorded at chunking time
    pub fn verify_payload(
        subject: impl std::fmt::Display,
        expected: &ContentHash,
        data: &[u8],
    ) -> IntegrityResult<()> {
        let calculated = Self::calculate_checksum(data);
        if &calculated != expected {
            return Err(IntegrityError::ChecksumMismatch {
                subject: subject.to_string(),
                expected: *expected,
                actual: calculated,
            });
        }
        Ok(())
    }

    /// Verify a manifest fetched from the directory is self-consistent
    pub fn verify_manifest(manifest: &FileManifest) -> IntegrityResult<()> {
        let inconsistent = |reason: String| IntegrityError::InconsistentManifest {
            file_id: manifest.file_id.to_string(),
            reason,
        };

        if manifest.chunk_size == 0 {
            return Err(inconsistent("chunk size is zero".to_string()));
        }

        if manifest.chunk_ids.len() != manifest.chunk_hashes.len() {
            return Err(inconsistent(format!(
                "{} chunk ids but {} hashes",
                manifest.chunk_ids.len(),
                manifest.chunk_hashes.len()
            )));
        }

        let expected_chunks = manifest.total_size.div_ceil(manifest.chunk_size).max(1);
        if manifest.chunk_ids.len() as u64 != expected_chunks {
            return Err(inconsistent(format!(
                "{} chunks listed, {} expected for {} bytes",
                manifest.chunk_ids.len(),
                expected_chunks,
                manifest.total_size
            )));
        }

        for (position, id) in manifest.chunk_ids.iter().enumerate() {
            if id.file_id != manifest.file_id || id.index as usize != position {
                return Err(inconsistent(format!(
                    "chunk id {id} out of place at position {position}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, FileId};

    fn manifest(total_size: u64, chunk_size: u64, chunks: u32) -> FileManifest {
        let file_id = FileId::new();
        FileManifest {
            file_id,
            name: "test.bin".to_string(),
            total_size,
            chunk_size,
            chunk_ids: (0..chunks).map(|i| ChunkId::new(file_id, i)).collect(),
            chunk_hashes: vec![[0u8; 32]; chunks as usize],
            encrypted: true,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    #[test]
    fn test_checksum_deterministic() {
        let data = b"hello world";
        let a = IntegrityVerifier::calculate_checksum(data);
        let b = IntegrityVerifier::calculate_checksum(data);
        assert_eq!(a, b);
        assert_ne!(a, IntegrityVerifier::calculate_checksum(b"hello worle"));
    }

    #[test]
    fn test_verify_payload() {
        let data = b"chunk bytes";
        let hash = IntegrityVerifier::calculate_checksum(data);
        assert!(IntegrityVerifier::verify_payload("c-0", &hash, data).is_ok());
    }

    #[test]
    fn test_verify_payload_single_flipped_byte() {
        let mut data = b"chunk bytes".to_vec();
        let hash = IntegrityVerifier::calculate_checksum(&data);
        data[4] ^= 0x80;

        let result = IntegrityVerifier::verify_payload("c-0", &hash, &data);
        match result {
            Err(IntegrityError::ChecksumMismatch { subject, expected, .. }) => {
                assert_eq!(subject, "c-0");
                assert_eq!(expected, hash);
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_manifest_verification() {
        assert!(IntegrityVerifier::verify_manifest(&manifest(3000, 1024, 3)).is_ok());
        assert!(IntegrityVerifier::verify_manifest(&manifest(0, 1024, 1)).is_ok());
        assert!(IntegrityVerifier::verify_manifest(&manifest(2048, 1024, 2)).is_ok());
    }

    #[test]
    fn test_manifest_verification_invalid_counts() {
        let result = IntegrityVerifier::verify_manifest(&manifest(3000, 1024, 4));
        assert!(matches!(
            result,
            Err(IntegrityError::InconsistentManifest { .. })
        ));
    }

    #[test]
    fn test_manifest_verification_misordered_ids() {
        let mut m = manifest(3000, 1024, 3);
        m.chunk_ids.swap(0, 2);
        assert!(IntegrityVerifier::verify_manifest(&m).is_err());
    }
}
