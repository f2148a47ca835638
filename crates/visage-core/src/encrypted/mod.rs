//! CKKS-encrypted cosine matching.
//!
//! Vectors are encrypted into the leading slots of a ciphertext; the dot
//! product of two ciphertexts is computed without the secret key, and only
//! the scalar result is decrypted. Magnitudes travel in the clear alongside
//! each ciphertext. Results are approximate, so compare them with a tolerance.

mod arith;
mod encoding;
mod evaluator;
mod keys;
mod ring;

pub mod catalog;
pub mod ciphertext;
pub mod context;
pub mod engine;
pub mod params;
pub mod pipeline;

pub use catalog::{
    encrypt_catalog, find_nearest_encrypted, load_encrypted_catalog, save_encrypted_catalog,
    EncryptedCatalog, EncryptedRecord, CIPHERTEXT_EXTENSION, ENCRYPTED_INDEX_FILE,
};

pub use ciphertext::{Ciphertext, EncryptedVector};

pub use context::EncryptionContext;

pub use engine::{
    decrypt_scalar, encrypt_vector, encrypted_cosine_similarity, encrypted_dot,
    EncryptedMatchEngine, EngineState,
};

pub use params::{EncryptionParams, SecurityLevel};

pub use pipeline::{
    run_catalog_encryption, run_encrypted_match, CatalogEncryptionConfig,
    CatalogEncryptionOutcome, EncryptedMatchConfig,
};
