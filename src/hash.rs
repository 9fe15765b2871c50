use crate::record::Digest;
use digest::Digest as _;
use sha2::Sha256;

/// Opaque `(bytes) -> digest` collaborator consumed by the pipeline.
/// Implementations must be pure, deterministic, and thread-safe; they
/// must not retain the input slice beyond the call.
pub trait Hasher: Send + Sync {
    fn hash(&self, data: &[u8]) -> Digest;
}

/// CRC32 (IEEE), via `crc32fast`'s SIMD-accelerated implementation.
#[derive(Default)]
pub struct Crc32Hasher;

impl Hasher for Crc32Hasher {
    fn hash(&self, data: &[u8]) -> Digest {
        let crc = crc32fast::hash(data);
        Digest::new(crc.to_be_bytes())
    }
}

/// SHA-256, via RustCrypto's `sha2`.
#[derive(Default)]
pub struct Sha256Hasher;

impl Hasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Digest::new(hasher.finalize().to_vec())
    }
}
