use std::fmt;
use std::fs;
use std::path::Path;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::encrypted::arith::generate_primes;
use crate::encrypted::ciphertext::Ciphertext;
use crate::encrypted::encoding::SlotEncoder;
use crate::encrypted::keys::{
    sample_error, sample_ternary, GaloisKeys, KeySwitchKey, PublicKey, SecretKey,
};
use crate::encrypted::params::EncryptionParams;
use crate::encrypted::ring::RingContext;
use crate::errors::{AppError, AppResult, NotFoundKind};
use crate::faces::catalog::persist_atomically;

const CONTEXT_FORMAT_VERSION: u32 = 1;

/// Scheme parameters plus key material for one encryption session.
///
/// Every ciphertext records the id of the context that produced it, and all
/// operations refuse ciphertexts from another context. Encryption and the
/// homomorphic operations only need the public, relinearisation and Galois
/// keys, so a [`public_view`](Self::public_view) can be handed to an untrusted
/// party; decryption additionally needs the secret key.
#[derive(Clone)]
pub struct EncryptionContext {
    id: Uuid,
    params: EncryptionParams,
    ring: RingContext,
    encoder: SlotEncoder,
    public_key: PublicKey,
    relin_key: KeySwitchKey,
    galois_keys: GaloisKeys,
    secret_key: Option<SecretKey>,
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("id", &self.id)
            .field("params", &self.params)
            .field("rotation_keys", &self.galois_keys.len())
            .field("has_secret_key", &self.secret_key.is_some())
            .finish()
    }
}

#[derive(Serialize)]
struct ContextBlobRef<'a> {
    version: u32,
    id: Uuid,
    params: &'a EncryptionParams,
    primes: Vec<u64>,
    public_key: &'a PublicKey,
    relin_key: &'a KeySwitchKey,
    galois_keys: &'a GaloisKeys,
    secret_key: Option<&'a SecretKey>,
}

#[derive(Deserialize)]
struct ContextBlob {
    version: u32,
    id: Uuid,
    params: EncryptionParams,
    primes: Vec<u64>,
    public_key: PublicKey,
    relin_key: KeySwitchKey,
    galois_keys: GaloisKeys,
    secret_key: Option<SecretKey>,
}

impl EncryptionContext {
    /// Generates fresh keys. This is the expensive setup step; build one
    /// context per session and reuse it.
    pub fn new(params: EncryptionParams) -> AppResult<Self> {
        params.validate()?;
        let degree = params.poly_modulus_degree;
        let primes = generate_primes(&params.coeff_mod_bit_sizes, degree)?;
        let ring = RingContext::new(degree, &primes)?;
        let encoder = SlotEncoder::new(degree);

        let mut rng = StdRng::from_entropy();
        let secret_key = SecretKey::generate(degree, &mut rng);
        let public_key = PublicKey::generate(&ring, &secret_key, &mut rng);
        let relin_key = KeySwitchKey::relinearization(&ring, &secret_key, &mut rng);
        let galois_keys = GaloisKeys::power_of_two(&ring, &encoder, &secret_key, &mut rng);

        let id = Uuid::new_v4();
        info!(
            context = %id,
            degree,
            data_primes = ring.data_prime_count(),
            rotation_keys = galois_keys.len(),
            "created encryption context"
        );

        Ok(Self {
            id,
            params,
            ring,
            encoder,
            public_key,
            relin_key,
            galois_keys,
            secret_key: Some(secret_key),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &EncryptionParams {
        &self.params
    }

    pub fn slot_count(&self) -> usize {
        self.encoder.slot_count()
    }

    pub fn has_secret_key(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Copy of this context without the secret key.
    pub fn public_view(&self) -> Self {
        Self {
            id: self.id,
            params: self.params.clone(),
            ring: self.ring.clone(),
            encoder: self.encoder.clone(),
            public_key: self.public_key.clone(),
            relin_key: self.relin_key.clone(),
            galois_keys: self.galois_keys.clone(),
            secret_key: None,
        }
    }

    /// Zeroizes and drops the secret key. Returns whether one was held.
    pub fn release_secret_key(&mut self) -> bool {
        let released = self.secret_key.take().is_some();
        if released {
            info!(context = %self.id, "released secret key");
        }
        released
    }

    pub(crate) fn ring(&self) -> &RingContext {
        &self.ring
    }

    pub(crate) fn encoder(&self) -> &SlotEncoder {
        &self.encoder
    }

    pub(crate) fn relin_key(&self) -> &KeySwitchKey {
        &self.relin_key
    }

    pub(crate) fn galois_keys(&self) -> &GaloisKeys {
        &self.galois_keys
    }

    /// Fails fast on ciphertexts from another context or with a shape this
    /// context cannot have produced.
    pub fn ensure_owns(&self, ciphertext: &Ciphertext) -> AppResult<()> {
        if ciphertext.context_id != self.id {
            return Err(AppError::ContextMismatch {
                expected: self.id,
                found: ciphertext.context_id,
            });
        }
        let level = ciphertext.level();
        let degree = self.ring.degree();
        if level == 0
            || level > self.ring.data_prime_count()
            || ciphertext.c1.prime_count() != level
            || !ciphertext.c0.has_degree(degree)
            || !ciphertext.c1.has_degree(degree)
            || ciphertext.length > self.slot_count()
        {
            return Err(AppError::MalformedArtifact(format!(
                "ciphertext shape does not fit context {}",
                self.id
            )));
        }
        Ok(())
    }

    /// Encrypts `values` into the leading slots at the global scale.
    pub fn encrypt(&self, values: &[f64]) -> AppResult<Ciphertext> {
        if values.is_empty() {
            return Err(AppError::InvalidEmbedding(
                "cannot encrypt an empty vector".into(),
            ));
        }
        let scale = self.params.global_scale();
        let message = self.encoder.encode(values, scale)?;

        let ring = &self.ring;
        let degree = ring.degree();
        let basis = ring.basis(ring.data_prime_count());
        let moduli = ring.moduli(&basis);
        let mut rng = StdRng::from_entropy();

        let u = ring.to_ntt(
            ring.from_signed(&sample_ternary(&mut rng, degree), &basis),
            &basis,
        );
        let mut c0 = ring.from_ntt(self.public_key.b.mul(&u, &moduli), &basis);
        let mut c1 = ring.from_ntt(self.public_key.a.mul(&u, &moduli), &basis);
        c0.add_assign(
            &ring.from_signed(&sample_error(&mut rng, degree), &basis),
            &moduli,
        );
        c0.add_assign(&ring.from_signed(&message, &basis), &moduli);
        c1.add_assign(
            &ring.from_signed(&sample_error(&mut rng, degree), &basis),
            &moduli,
        );

        debug!(context = %self.id, length = values.len(), "encrypted vector");
        Ok(Ciphertext {
            context_id: self.id,
            c0,
            c1,
            scale,
            length: values.len(),
        })
    }

    /// Decrypts and decodes the meaningful slots of `ciphertext`.
    pub fn decrypt(&self, ciphertext: &Ciphertext) -> AppResult<Vec<f64>> {
        self.ensure_owns(ciphertext)?;
        let secret = self
            .secret_key
            .as_ref()
            .ok_or(AppError::DecryptionUnauthorized)?;

        let ring = &self.ring;
        let basis = ring.basis(ciphertext.level());
        let moduli = ring.moduli(&basis);
        let c1 = ring.to_ntt(ciphertext.c1.clone(), &basis);
        let mut plain = ring.from_ntt(c1.mul(&secret.to_ntt(ring, &basis), &moduli), &basis);
        plain.add_assign(&ciphertext.c0, &moduli);

        let coeffs = ring.to_centered_f64(&plain);
        Ok(self
            .encoder
            .decode(&coeffs, ciphertext.scale, ciphertext.length))
    }

    /// Serializes parameters and keys. The secret key is included only when
    /// `include_secret` is set and this context holds one.
    pub fn to_bytes(&self, include_secret: bool) -> AppResult<Vec<u8>> {
        let blob = ContextBlobRef {
            version: CONTEXT_FORMAT_VERSION,
            id: self.id,
            params: &self.params,
            primes: self.ring.primes(),
            public_key: &self.public_key,
            relin_key: &self.relin_key,
            galois_keys: &self.galois_keys,
            secret_key: if include_secret {
                self.secret_key.as_ref()
            } else {
                None
            },
        };
        Ok(bincode::serialize(&blob)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let blob: ContextBlob = bincode::deserialize(bytes)?;
        if blob.version != CONTEXT_FORMAT_VERSION {
            return Err(AppError::MalformedArtifact(format!(
                "unsupported context format version {}",
                blob.version
            )));
        }
        blob.params.validate()?;

        let degree = blob.params.poly_modulus_degree;
        let primes = generate_primes(&blob.params.coeff_mod_bit_sizes, degree)?;
        if primes != blob.primes {
            return Err(AppError::MalformedArtifact(
                "stored modulus chain does not match the parameters".into(),
            ));
        }
        let ring = RingContext::new(degree, &primes)?;
        if blob.relin_key.digits.len() != ring.data_prime_count() {
            return Err(AppError::MalformedArtifact(
                "relinearisation key does not match the modulus chain".into(),
            ));
        }
        if let Some(secret) = &blob.secret_key {
            if secret.degree() != degree {
                return Err(AppError::MalformedArtifact(
                    "secret key does not match the ring degree".into(),
                ));
            }
        }

        debug!(context = %blob.id, has_secret_key = blob.secret_key.is_some(), "loaded encryption context");
        Ok(Self {
            id: blob.id,
            encoder: SlotEncoder::new(degree),
            ring,
            params: blob.params,
            public_key: blob.public_key,
            relin_key: blob.relin_key,
            galois_keys: blob.galois_keys,
            secret_key: blob.secret_key,
        })
    }

    pub fn save(&self, path: &Path, include_secret: bool) -> AppResult<()> {
        let bytes = self.to_bytes(include_secret)?;
        persist_atomically(path, &bytes).map_err(|source| AppError::ArtifactWrite {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            context = %self.id,
            include_secret = include_secret && self.has_secret_key(),
            "encryption context written"
        );
        Ok(())
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let bytes = fs::read(path)
            .map_err(|source| AppError::from_read(NotFoundKind::Context, path.to_path_buf(), source))?;
        Self::from_bytes(&bytes).map_err(|err| AppError::Format {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
    }
}
