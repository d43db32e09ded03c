use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use std::fmt;

/// The only digest algorithm issues are published with.
pub const SHA256: &str = "sha256";

/// A declared file checksum: `<base64 digest>.<algorithm>` plus the declared size.
///
/// Two checksums are the same content only if digest, algorithm and size all match,
/// mirroring the `<checksum>#<size>` index values the issue format is built on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    pub digest: String,
    pub algorithm: Option<String>,
    pub size: u64,
}

impl ContentId {
    /// Parses the `checksum` field of an issue file entry.
    pub fn parse(checksum: &str, size: u64) -> Result<Self, String> {
        let (digest, algorithm) = match checksum.split_once('.') {
            Some((digest, algorithm)) => (digest, Some(algorithm.to_owned())),
            None => (checksum, None),
        };
        if digest.is_empty() {
            return Err(format!("empty checksum '{checksum}'"));
        }
        if let Some(algorithm) = algorithm.as_deref().filter(|a| *a != SHA256) {
            return Err(format!("unsupported checksum algorithm '{algorithm}'"));
        }
        Ok(Self {
            digest: digest.to_owned(),
            algorithm,
            size,
        })
    }

    /// Reference of the content-addressed blob holding this content.
    pub fn blob(&self) -> BlobRef {
        BlobRef {
            digest: self.digest.clone(),
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.algorithm {
            Some(algorithm) => write!(f, "{}.{algorithm}#{}", self.digest, self.size),
            None => write!(f, "{}#{}", self.digest, self.size),
        }
    }
}

/// A blob reference, `&<base64 sha256>.sha256`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    digest: String,
}

impl BlobRef {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Hex form of the digest, used for on-disk blob paths.
    pub fn hex(&self) -> Result<String, String> {
        STANDARD
            .decode(&self.digest)
            .map(hex::encode)
            .map_err(|e| format!("blob digest '{}' is not base64: {e}", self.digest))
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}.{SHA256}", self.digest)
    }
}

/// Base64 encoding of a finished sha256 state, the form digests are declared in.
pub fn encode_digest(hasher: Sha256) -> String {
    STANDARD.encode(hasher.finalize())
}
