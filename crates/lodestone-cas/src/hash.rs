//! Content hashing with a fixed algorithm.
//!
//! Every key in the store is a lowercase hex SHA-256 digest. The same type is
//! used as the expected value for integrity checks after a transfer.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{CasError, Result};

/// Length of a hex encoded digest.
pub const HASH_HEX_LEN: usize = 64;

/// Read buffer size used when hashing streams and files.
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Lowercase hex SHA-256 digest identifying an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse a hex digest, accepting either case.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.len() != HASH_HEX_LEN || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CasError::InvalidHash(value.to_string()));
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub(crate) fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }

    /// Hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two character shard directory name.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Shortened form for log output.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }

    /// Lock stripe for this hash, derived from the first byte.
    pub(crate) fn stripe(&self) -> usize {
        usize::from_str_radix(self.shard(), 16).unwrap_or(0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = CasError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

/// Incremental hasher fed while bytes are in flight.
#[derive(Clone, Default)]
pub struct StreamHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamHasher {
    /// Create an empty hasher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub const fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the digest.
    pub fn finalize(self) -> ContentHash {
        ContentHash::from_digest(&self.inner.finalize())
    }
}

impl fmt::Debug for StreamHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHasher")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// Hash provider with a fixed algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashProvider;

impl HashProvider {
    /// Name of the algorithm backing every [`ContentHash`].
    pub const ALGORITHM: &'static str = "sha256";

    /// Create a provider.
    pub const fn new() -> Self {
        Self
    }

    /// Start an incremental hash.
    pub fn hasher(&self) -> StreamHasher {
        StreamHasher::new()
    }

    /// Hash an in-memory buffer.
    pub fn hash_bytes(&self, data: &[u8]) -> ContentHash {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }

    /// Hash everything a reader yields. Returns the digest and byte count.
    pub async fn hash_reader<R>(&self, mut reader: R) -> Result<(ContentHash, u64)>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = self.hasher();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let size = hasher.bytes_hashed();
        Ok((hasher.finalize(), size))
    }

    /// Hash a file on disk. Returns the digest and file size.
    pub async fn hash_file(&self, path: &Path) -> Result<(ContentHash, u64)> {
        let file = tokio::fs::File::open(path).await?;
        self.hash_reader(file).await
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_known_vectors() {
        let provider = HashProvider::new();
        assert_eq!(provider.hash_bytes(b"").as_str(), EMPTY_SHA256);
        assert_eq!(provider.hash_bytes(b"abc").as_str(), ABC_SHA256);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let upper = ABC_SHA256.to_ascii_uppercase();
        let hash = ContentHash::parse(&upper).expect("valid hash");
        assert_eq!(hash.as_str(), ABC_SHA256);
        assert_eq!(hash.shard(), "ba");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ContentHash::parse("").is_err());
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"g".repeat(HASH_HEX_LEN)).is_err());
        assert!(ContentHash::parse(&"a".repeat(HASH_HEX_LEN + 2)).is_err());
    }

    #[test]
    fn test_serde_round_trip_uses_string_form() {
        let hash = ContentHash::parse(ABC_SHA256).expect("valid hash");
        let json = serde_json::to_string(&hash).expect("serialize");
        assert_eq!(json, format!("\"{ABC_SHA256}\""));
        let back: ContentHash = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, hash);
        assert!(serde_json::from_str::<ContentHash>("\"nothex\"").is_err());
    }

    #[tokio::test]
    async fn test_hash_file_matches_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        let data = vec![0x5Au8; HASH_BUFFER_SIZE * 2 + 17];
        std::fs::write(&path, &data).expect("write");

        let provider = HashProvider::new();
        let (hash, size) = provider.hash_file(&path).await.expect("hash file");
        assert_eq!(size, data.len() as u64);
        assert_eq!(hash, provider.hash_bytes(&data));
    }

    proptest! {
        #[test]
        fn prop_chunked_hash_equals_one_shot(data in proptest::collection::vec(any::<u8>(), 0..4096), split in 0usize..4096) {
            let provider = HashProvider::new();
            let split = split.min(data.len());
            let mut hasher = provider.hasher();
            hasher.update(&data[..split]);
            hasher.update(&data[split..]);
            prop_assert_eq!(hasher.bytes_hashed(), data.len() as u64);
            prop_assert_eq!(hasher.finalize(), provider.hash_bytes(&data));
        }

        #[test]
        fn prop_display_parses_back(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let hash = HashProvider::new().hash_bytes(&data);
            prop_assert_eq!(ContentHash::parse(&hash.to_string()).unwrap(), hash);
        }
    }
}
