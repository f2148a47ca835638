use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encrypted::ring::RnsPoly;
use crate::errors::{AppError, AppResult};

pub(crate) const CIPHERTEXT_FORMAT_VERSION: u32 = 1;

/// CKKS ciphertext `(c0, c1)` in coefficient form, bound to the context that
/// produced it. `length` counts the meaningful leading slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ciphertext {
    pub(crate) context_id: Uuid,
    pub(crate) c0: RnsPoly,
    pub(crate) c1: RnsPoly,
    pub(crate) scale: f64,
    pub(crate) length: usize,
}

#[derive(Serialize, Deserialize)]
struct CiphertextBlob {
    version: u32,
    ciphertext: Ciphertext,
}

impl Ciphertext {
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of data primes still in the modulus.
    pub fn level(&self) -> usize {
        self.c0.prime_count()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        let blob = CiphertextBlob {
            version: CIPHERTEXT_FORMAT_VERSION,
            ciphertext: self.clone(),
        };
        Ok(bincode::serialize(&blob)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let blob: CiphertextBlob = bincode::deserialize(bytes)?;
        if blob.version != CIPHERTEXT_FORMAT_VERSION {
            return Err(AppError::MalformedArtifact(format!(
                "unsupported ciphertext format version {}",
                blob.version
            )));
        }
        let ciphertext = blob.ciphertext;
        if ciphertext.c0.prime_count() != ciphertext.c1.prime_count()
            || ciphertext.c0.prime_count() == 0
        {
            return Err(AppError::MalformedArtifact(
                "ciphertext components disagree on their modulus".into(),
            ));
        }
        if !ciphertext.scale.is_finite() || ciphertext.scale <= 0.0 {
            return Err(AppError::MalformedArtifact(format!(
                "ciphertext scale {} is not positive",
                ciphertext.scale
            )));
        }
        Ok(ciphertext)
    }
}

/// An encrypted embedding plus its plaintext L2 norm. The norm stays in the
/// clear next to the ciphertext, never inside it.
#[derive(Debug, Clone)]
pub struct EncryptedVector {
    pub ciphertext: Ciphertext,
    pub magnitude: f64,
}

impl EncryptedVector {
    pub fn context_id(&self) -> Uuid {
        self.ciphertext.context_id
    }

    pub fn dimension(&self) -> usize {
        self.ciphertext.length
    }
}
