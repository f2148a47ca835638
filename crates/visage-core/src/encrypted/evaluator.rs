//! Homomorphic operations on ciphertexts of one [`EncryptionContext`]. None of
//! them touch the secret key.

use tracing::debug;

use crate::encrypted::ciphertext::Ciphertext;
use crate::encrypted::context::EncryptionContext;
use crate::encrypted::keys::KeySwitchKey;
use crate::encrypted::ring::RnsPoly;
use crate::errors::{AppError, AppResult};

const SCALE_TOLERANCE: f64 = 1e-9;

impl EncryptionContext {
    pub fn add(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> AppResult<Ciphertext> {
        self.ensure_owns(lhs)?;
        self.ensure_owns(rhs)?;
        ensure_same_level(lhs, rhs)?;
        if (lhs.scale - rhs.scale).abs() > lhs.scale * SCALE_TOLERANCE {
            return Err(AppError::InvalidParameters(format!(
                "cannot add ciphertexts at scales {} and {}",
                lhs.scale, rhs.scale
            )));
        }

        let moduli = self.ring().moduli(&self.ring().basis(lhs.level()));
        let mut c0 = lhs.c0.clone();
        let mut c1 = lhs.c1.clone();
        c0.add_assign(&rhs.c0, &moduli);
        c1.add_assign(&rhs.c1, &moduli);
        Ok(Ciphertext {
            context_id: self.id(),
            c0,
            c1,
            scale: lhs.scale,
            length: lhs.length.max(rhs.length),
        })
    }

    /// Slot-wise product, relinearised back to two components. The result
    /// carries the product of the input scales; see [`rescale`](Self::rescale).
    pub fn multiply(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> AppResult<Ciphertext> {
        self.ensure_owns(lhs)?;
        self.ensure_owns(rhs)?;
        ensure_same_level(lhs, rhs)?;

        let ring = self.ring();
        let level = lhs.level();
        let basis = ring.basis(level);
        let moduli = ring.moduli(&basis);

        let a0 = ring.to_ntt(lhs.c0.clone(), &basis);
        let a1 = ring.to_ntt(lhs.c1.clone(), &basis);
        let b0 = ring.to_ntt(rhs.c0.clone(), &basis);
        let b1 = ring.to_ntt(rhs.c1.clone(), &basis);

        let d0 = a0.mul(&b0, &moduli);
        let mut d1 = a0.mul(&b1, &moduli);
        d1.add_assign(&a1.mul(&b0, &moduli), &moduli);
        let d2 = ring.from_ntt(a1.mul(&b1, &moduli), &basis);

        let (k0, k1) = self.switch_key(&d2, self.relin_key(), level);
        let mut c0 = ring.from_ntt(d0, &basis);
        let mut c1 = ring.from_ntt(d1, &basis);
        c0.add_assign(&k0, &moduli);
        c1.add_assign(&k1, &moduli);

        Ok(Ciphertext {
            context_id: self.id(),
            c0,
            c1,
            scale: lhs.scale * rhs.scale,
            length: lhs.length.max(rhs.length),
        })
    }

    /// Divides by the last data prime, dropping it from the modulus.
    pub fn rescale(&self, ciphertext: &Ciphertext) -> AppResult<Ciphertext> {
        self.ensure_owns(ciphertext)?;
        let level = ciphertext.level();
        if level < 2 {
            return Err(AppError::InvalidParameters(
                "no data prime left to rescale by".into(),
            ));
        }

        let ring = self.ring();
        let dropped = ring.modulus(level - 1) as f64;
        Ok(Ciphertext {
            context_id: self.id(),
            c0: ring.rescale(ciphertext.c0.clone()),
            c1: ring.rescale(ciphertext.c1.clone()),
            scale: ciphertext.scale / dropped,
            length: ciphertext.length,
        })
    }

    /// Rotates slots left by `steps`, composing the power-of-two rotations.
    pub fn rotate(&self, ciphertext: &Ciphertext, steps: usize) -> AppResult<Ciphertext> {
        self.ensure_owns(ciphertext)?;
        let mut remaining = steps % self.slot_count();
        let mut power = 1;
        let mut current = ciphertext.clone();
        while remaining > 0 {
            if remaining & 1 == 1 {
                current = self.rotate_once(&current, power)?;
            }
            remaining >>= 1;
            power <<= 1;
        }
        Ok(current)
    }

    /// Homomorphic dot product: multiply, rescale, then rotate-and-sum over
    /// the next power of two of the vector length. The sum lands in slot 0.
    pub fn dot(&self, lhs: &Ciphertext, rhs: &Ciphertext) -> AppResult<Ciphertext> {
        self.ensure_owns(lhs)?;
        self.ensure_owns(rhs)?;
        if lhs.length != rhs.length {
            return Err(AppError::DimensionMismatch {
                expected: lhs.length,
                found: rhs.length,
            });
        }

        let mut acc = self.rescale(&self.multiply(lhs, rhs)?)?;
        let span = lhs.length.next_power_of_two();
        let mut step = 1;
        while step < span {
            let rotated = self.rotate_once(&acc, step)?;
            acc = self.add(&acc, &rotated)?;
            step <<= 1;
        }
        acc.length = 1;

        debug!(context = %self.id(), length = lhs.length, "computed encrypted dot product");
        Ok(acc)
    }

    fn rotate_once(&self, ciphertext: &Ciphertext, steps: usize) -> AppResult<Ciphertext> {
        let galois = self.encoder().galois_element(steps);
        let key = self.galois_keys().get(galois).ok_or_else(|| {
            AppError::InvalidParameters(format!("no rotation key for {steps} slot(s)"))
        })?;

        let ring = self.ring();
        let level = ciphertext.level();
        let basis = ring.basis(level);
        let moduli = ring.moduli(&basis);

        let mut c0 = ring.automorphism(&ciphertext.c0, galois, &basis);
        let c1 = ring.automorphism(&ciphertext.c1, galois, &basis);
        let (k0, k1) = self.switch_key(&c1, key, level);
        c0.add_assign(&k0, &moduli);

        Ok(Ciphertext {
            context_id: self.id(),
            c0,
            c1: k1,
            scale: ciphertext.scale,
            length: ciphertext.length,
        })
    }

    /// Turns `poly * s'` into a pair decryptable under `s`, with one digit
    /// per data prime and a final division by the special prime.
    fn switch_key(&self, poly: &RnsPoly, key: &KeySwitchKey, level: usize) -> (RnsPoly, RnsPoly) {
        let ring = self.ring();
        let extended = ring.extended_basis(level);
        let moduli = ring.moduli(&extended);
        let degree = ring.degree();

        let mut acc_b = RnsPoly::zero(extended.len(), degree);
        let mut acc_a = RnsPoly::zero(extended.len(), degree);
        for (digit, key_digit) in poly.residues().iter().zip(&key.digits) {
            let lifted: Vec<Vec<u64>> = moduli
                .iter()
                .map(|&q| digit.iter().map(|&value| value % q).collect())
                .collect();
            let lifted = ring.to_ntt(RnsPoly::from_residues(lifted), &extended);
            acc_b.mul_add_assign(&lifted, &key_digit.b, &extended, &moduli);
            acc_a.mul_add_assign(&lifted, &key_digit.a, &extended, &moduli);
        }

        let acc_b = ring.from_ntt(acc_b, &extended);
        let acc_a = ring.from_ntt(acc_a, &extended);
        (ring.mod_down(acc_b, level), ring.mod_down(acc_a, level))
    }
}

fn ensure_same_level(lhs: &Ciphertext, rhs: &Ciphertext) -> AppResult<()> {
    if lhs.level() != rhs.level() {
        return Err(AppError::InvalidParameters(format!(
            "ciphertexts sit at different levels ({} and {})",
            lhs.level(),
            rhs.level()
        )));
    }
    Ok(())
}
