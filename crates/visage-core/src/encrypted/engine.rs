use std::fmt;

use tracing::{debug, info};

use crate::encrypted::catalog::{encrypt_catalog, find_nearest_encrypted, EncryptedCatalog};
use crate::encrypted::ciphertext::{Ciphertext, EncryptedVector};
use crate::encrypted::context::EncryptionContext;
use crate::encrypted::params::EncryptionParams;
use crate::errors::{AppError, AppResult};
use crate::faces::catalog::Catalog;
use crate::faces::matcher::MatchResult;
use crate::faces::store::EmbeddingReader;
use crate::vector::magnitude;

/// Encrypts the raw embedding and records its norm in the clear.
pub fn encrypt_vector(raw: &[f64], context: &EncryptionContext) -> AppResult<EncryptedVector> {
    let norm = magnitude(raw);
    if norm == 0.0 {
        return Err(AppError::DivideByZero);
    }
    Ok(EncryptedVector {
        ciphertext: context.encrypt(raw)?,
        magnitude: norm,
    })
}

/// Encrypted `a . b`, in slot 0 of the result. Needs no secret key.
pub fn encrypted_dot(
    a: &Ciphertext,
    b: &Ciphertext,
    context: &EncryptionContext,
) -> AppResult<Ciphertext> {
    context.dot(a, b)
}

/// Decrypts the scalar in slot 0. Only a context holding the secret key can.
pub fn decrypt_scalar(ciphertext: &Ciphertext, context: &EncryptionContext) -> AppResult<f64> {
    context
        .decrypt(ciphertext)?
        .first()
        .copied()
        .ok_or_else(|| AppError::MalformedArtifact("ciphertext holds no slots".into()))
}

/// `decrypt(a . b) / (magnitude_a * magnitude_b)`. Approximate: compare with
/// a tolerance, never exactly.
pub fn encrypted_cosine_similarity(
    a: &Ciphertext,
    b: &Ciphertext,
    magnitude_a: f64,
    magnitude_b: f64,
    context: &EncryptionContext,
) -> AppResult<f64> {
    context.ensure_owns(a)?;
    context.ensure_owns(b)?;
    if !context.has_secret_key() {
        return Err(AppError::DecryptionUnauthorized);
    }
    let denominator = magnitude_a * magnitude_b;
    if denominator == 0.0 {
        return Err(AppError::DivideByZero);
    }

    let dot = decrypt_scalar(&encrypted_dot(a, b, context)?, context)?;
    Ok(dot / denominator)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Uninitialized,
    ContextReady,
    VectorsEncrypted,
    MatchComputed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::ContextReady => "context-ready",
            EngineState::VectorsEncrypted => "vectors-encrypted",
            EngineState::MatchComputed => "match-computed",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session wrapper enforcing the order context creation, encryption, matching.
/// Encrypting more vectors after a match is allowed and keeps the engine in
/// its current state.
#[derive(Debug)]
pub struct EncryptedMatchEngine {
    state: EngineState,
    context: Option<EncryptionContext>,
}

impl Default for EncryptedMatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptedMatchEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            context: None,
        }
    }

    /// Starts from an existing (for example loaded) context.
    pub fn with_context(context: EncryptionContext) -> Self {
        Self {
            state: EngineState::ContextReady,
            context: Some(context),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn context(&self) -> AppResult<&EncryptionContext> {
        self.context.as_ref().ok_or(AppError::InvalidState {
            operation: "use the encryption context",
            state: self.state.as_str(),
        })
    }

    pub fn create_context(&mut self, params: EncryptionParams) -> AppResult<&EncryptionContext> {
        if self.state != EngineState::Uninitialized {
            return Err(AppError::InvalidState {
                operation: "create a context",
                state: self.state.as_str(),
            });
        }
        let context = EncryptionContext::new(params)?;
        self.transition(EngineState::ContextReady);
        Ok(self.context.insert(context))
    }

    pub fn encrypt_vector(&mut self, raw: &[f64]) -> AppResult<EncryptedVector> {
        let encrypted = encrypt_vector(raw, self.require_context("encrypt a vector")?)?;
        self.advance_to(EngineState::VectorsEncrypted);
        Ok(encrypted)
    }

    pub fn encrypt_catalog<R: EmbeddingReader + ?Sized>(
        &mut self,
        catalog: &Catalog,
        reader: &R,
    ) -> AppResult<EncryptedCatalog> {
        let encrypted = encrypt_catalog(catalog, reader, self.require_context("encrypt a catalog")?)?;
        self.advance_to(EngineState::VectorsEncrypted);
        Ok(encrypted)
    }

    /// Marks externally produced ciphertexts (such as a loaded encrypted
    /// catalog) as available for matching.
    pub fn register_encrypted(&mut self, catalog: &EncryptedCatalog) -> AppResult<()> {
        let context = self.require_context("register encrypted vectors")?;
        if catalog.context_id() != context.id() {
            return Err(AppError::ContextMismatch {
                expected: context.id(),
                found: catalog.context_id(),
            });
        }
        self.advance_to(EngineState::VectorsEncrypted);
        Ok(())
    }

    pub fn cosine_similarity(&mut self, a: &EncryptedVector, b: &EncryptedVector) -> AppResult<f64> {
        self.encrypted_cosine_similarity(&a.ciphertext, &b.ciphertext, a.magnitude, b.magnitude)
    }

    pub fn encrypted_cosine_similarity(
        &mut self,
        a: &Ciphertext,
        b: &Ciphertext,
        magnitude_a: f64,
        magnitude_b: f64,
    ) -> AppResult<f64> {
        self.require_vectors("compute a similarity")?;
        let context = self.context()?;
        let similarity = encrypted_cosine_similarity(a, b, magnitude_a, magnitude_b, context)?;
        debug!(similarity, "computed encrypted similarity");
        self.transition(EngineState::MatchComputed);
        Ok(similarity)
    }

    pub fn find_nearest(
        &mut self,
        query: &EncryptedVector,
        catalog: &EncryptedCatalog,
    ) -> AppResult<MatchResult> {
        self.require_vectors("match against an encrypted catalog")?;
        let result = find_nearest_encrypted(query, catalog, self.context()?)?;
        self.transition(EngineState::MatchComputed);
        Ok(result)
    }

    /// Drops the secret key held by the engine's context.
    pub fn release_secret_key(&mut self) -> AppResult<bool> {
        let context = self.context.as_mut().ok_or(AppError::InvalidState {
            operation: "release the secret key",
            state: self.state.as_str(),
        })?;
        Ok(context.release_secret_key())
    }

    fn require_context(&self, operation: &'static str) -> AppResult<&EncryptionContext> {
        self.context.as_ref().ok_or(AppError::InvalidState {
            operation,
            state: self.state.as_str(),
        })
    }

    fn require_vectors(&self, operation: &'static str) -> AppResult<()> {
        if self.state < EngineState::VectorsEncrypted {
            return Err(AppError::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn advance_to(&mut self, target: EngineState) {
        if self.state < target {
            self.transition(target);
        }
    }

    fn transition(&mut self, next: EngineState) {
        if self.state != next {
            info!(from = %self.state, to = %next, "encrypted match engine transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypted::context::tests::test_params;
    use crate::vector::cosine_similarity;

    fn ready_engine() -> EncryptedMatchEngine {
        let mut engine = EncryptedMatchEngine::new();
        engine.create_context(test_params()).unwrap();
        engine
    }

    #[test]
    fn states_advance_in_order() {
        let mut engine = EncryptedMatchEngine::new();
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(
            engine.encrypt_vector(&[1.0, 2.0]),
            Err(AppError::InvalidState {
                state: "uninitialized",
                ..
            })
        ));

        engine.create_context(test_params()).unwrap();
        assert_eq!(engine.state(), EngineState::ContextReady);

        let a = engine.encrypt_vector(&[1.0, 2.0, 3.0]).unwrap();
        let b = engine.encrypt_vector(&[4.0, 5.0, 6.0]).unwrap();
        assert_eq!(engine.state(), EngineState::VectorsEncrypted);

        let similarity = engine.cosine_similarity(&a, &b).unwrap();
        assert_eq!(engine.state(), EngineState::MatchComputed);
        let expected = cosine_similarity(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap();
        assert!((similarity - expected).abs() < 1e-4);

        engine.encrypt_vector(&[1.0, 1.0, 1.0]).unwrap();
        assert_eq!(engine.state(), EngineState::MatchComputed);
    }

    #[test]
    fn context_is_created_once() {
        let mut engine = ready_engine();
        assert!(matches!(
            engine.create_context(test_params()),
            Err(AppError::InvalidState { .. })
        ));
    }

    #[test]
    fn matching_before_encryption_is_rejected() {
        let mut engine = ready_engine();
        let context = engine.context().unwrap().clone();
        let a = encrypt_vector(&[1.0], &context).unwrap();
        assert!(matches!(
            engine.cosine_similarity(&a, &a),
            Err(AppError::InvalidState {
                state: "context-ready",
                ..
            })
        ));
    }

    #[test]
    fn magnitudes_stay_outside_the_ciphertext() {
        let mut engine = ready_engine();
        let encrypted = engine.encrypt_vector(&[3.0, 4.0]).unwrap();
        assert!((encrypted.magnitude - 5.0).abs() < 1e-12);
        assert_eq!(encrypted.dimension(), 2);
        assert!(matches!(
            engine.encrypt_vector(&[0.0, 0.0]),
            Err(AppError::DivideByZero)
        ));
    }

    #[test]
    fn untrusted_party_computes_dot_but_cannot_decrypt() {
        let owner = EncryptionContext::new(test_params()).unwrap();
        let untrusted = owner.public_view();
        let a = encrypt_vector(&[0.5, -0.25, 1.0], &untrusted).unwrap();
        let b = encrypt_vector(&[2.0, 4.0, 0.5], &untrusted).unwrap();

        let dot = encrypted_dot(&a.ciphertext, &b.ciphertext, &untrusted).unwrap();
        assert!(matches!(
            decrypt_scalar(&dot, &untrusted),
            Err(AppError::DecryptionUnauthorized)
        ));
        assert!(matches!(
            encrypted_cosine_similarity(&a.ciphertext, &b.ciphertext, 1.0, 1.0, &untrusted),
            Err(AppError::DecryptionUnauthorized)
        ));
        assert!((decrypt_scalar(&dot, &owner).unwrap() - 0.5).abs() < 1e-4);
    }

    #[test]
    fn mixed_contexts_fail_fast() {
        let first = EncryptionContext::new(test_params()).unwrap();
        let second = EncryptionContext::new(test_params()).unwrap();
        let a = encrypt_vector(&[1.0, 0.0], &first).unwrap();
        let b = encrypt_vector(&[0.0, 1.0], &second).unwrap();
        assert!(matches!(
            encrypted_cosine_similarity(&a.ciphertext, &b.ciphertext, 1.0, 1.0, &first),
            Err(AppError::ContextMismatch { .. })
        ));
    }

    #[test]
    fn zero_magnitude_is_divide_by_zero() {
        let context = EncryptionContext::new(test_params()).unwrap();
        let a = encrypt_vector(&[1.0, 0.0], &context).unwrap();
        assert!(matches!(
            encrypted_cosine_similarity(&a.ciphertext, &a.ciphertext, 0.0, 1.0, &context),
            Err(AppError::DivideByZero)
        ));
    }
}
