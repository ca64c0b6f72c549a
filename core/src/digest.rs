//! Content digests and layer chain identities.
//!
//! A [`Digest`] is an algorithm-tagged hash (`sha256:<hex>`) and is the sole
//! identity of a blob. [`chain_ids`] folds an ordered diff-ID sequence into
//! the ChainIDs that key filesystem snapshots.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};

use crate::error::{PullError, Result};

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash.
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

impl FromStr for Algorithm {
    type Err = PullError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(PullError::InvalidDigest(format!(
                "unsupported algorithm '{}'",
                other
            ))),
        }
    }
}

/// An algorithm-tagged content hash, e.g. `sha256:e3b0c4...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s.split_once(':').ok_or_else(|| {
            PullError::InvalidDigest(format!("'{}': expected algorithm:hex", s))
        })?;
        let algorithm: Algorithm = algorithm.parse()?;

        if hex.len() != algorithm.hex_len() {
            return Err(PullError::InvalidDigest(format!(
                "'{}': expected {} hex characters, got {}",
                s,
                algorithm.hex_len(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(PullError::InvalidDigest(format!(
                "'{}': hash must be lowercase hex",
                s
            )));
        }

        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Compute the sha256 digest of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self::hash(Algorithm::Sha256, data)
    }

    /// Compute the digest of `data` with the given algorithm.
    pub fn hash(algorithm: Algorithm, data: &[u8]) -> Self {
        let mut hasher = Digester::new(algorithm);
        hasher.update(data);
        hasher.finish()
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The hex-encoded hash without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Start a streaming verification of content expected to hash to `self`.
    pub fn verifier(&self) -> DigestVerifier {
        DigestVerifier {
            expected: self.clone(),
            hasher: Digester::new(self.algorithm),
            written: 0,
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl FromStr for Digest {
    type Err = PullError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = PullError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

/// Incremental digest computation over a byte stream.
pub struct Digester(DigesterInner);

enum DigesterInner {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Digester {
    pub fn new(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Sha256 => Digester(DigesterInner::Sha256(Sha256::new())),
            Algorithm::Sha512 => Digester(DigesterInner::Sha512(Sha512::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.0 {
            DigesterInner::Sha256(h) => h.update(data),
            DigesterInner::Sha512(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Digest {
        let (algorithm, hex) = match self.0 {
            DigesterInner::Sha256(h) => (Algorithm::Sha256, hex::encode(h.finalize())),
            DigesterInner::Sha512(h) => (Algorithm::Sha512, hex::encode(h.finalize())),
        };
        Digest { algorithm, hex }
    }
}

/// Incrementally hashes a byte stream and checks it against an expected
/// digest and length.
pub struct DigestVerifier {
    expected: Digest,
    hasher: Digester,
    written: u64,
}

impl DigestVerifier {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    /// Bytes seen so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish the stream. `expected_size` is checked first when given, so a
    /// truncated stream reports a size mismatch rather than a digest one.
    pub fn verify(self, expected_size: Option<u64>) -> Result<()> {
        if let Some(expected) = expected_size {
            if self.written != expected {
                return Err(PullError::SizeMismatch {
                    digest: self.expected.to_string(),
                    expected,
                    actual: self.written,
                });
            }
        }

        let actual = self.hasher.finish();
        if actual != self.expected {
            return Err(PullError::DigestMismatch {
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

/// Fold a diff-ID sequence into its ChainIDs.
///
/// `chain[0] = diff[0]` and `chain[i] = sha256(chain[i-1] + " " + diff[i])`.
/// Element `i` names the filesystem state after applying layers `0..=i`.
pub fn chain_ids(diff_ids: &[Digest]) -> Vec<Digest> {
    let mut chain: Vec<Digest> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => Digest::from_bytes(format!("{} {}", parent, diff_id).as_bytes()),
        };
        chain.push(next);
    }
    chain
}

/// ChainID of the full diff-ID sequence, or `None` for an empty sequence.
pub fn chain_id(diff_ids: &[Digest]) -> Option<Digest> {
    chain_ids(diff_ids).pop()
}
