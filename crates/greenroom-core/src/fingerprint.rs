//! Request fingerprints for idempotent admission.
//!
//! A [`Fingerprint`] is a SHA-256 digest over (episode, conversation key,
//! scenario text, seed). Two intents with the same fingerprint are the same
//! request: within the idempotency TTL the second one is answered from the
//! result cache without re-reserving or re-executing.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::conv_key::ConvKey;

/// SHA-256 fingerprint of an episode request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint for a request.
    ///
    /// Each field is hashed behind a length prefix so that adjacent fields
    /// cannot collide by concatenation, and absent optionals hash
    /// differently from empty ones.
    #[must_use]
    pub fn compute(
        episode: &str,
        conv_key: &ConvKey,
        scenario: Option<&str>,
        seed: Option<u64>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, episode.as_bytes());
        hash_field(&mut hasher, conv_key.as_str().as_bytes());
        match scenario {
            Some(text) => {
                hasher.update([1u8]);
                hash_field(&mut hasher, text.as_bytes());
            }
            None => hasher.update([0u8]),
        }
        match seed {
            Some(value) => {
                hasher.update([1u8]);
                hasher.update(value.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn hash_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}
