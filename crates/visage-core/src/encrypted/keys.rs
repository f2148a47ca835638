use std::collections::BTreeMap;
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::encrypted::arith::{add_mod, mul_mod};
use crate::encrypted::encoding::SlotEncoder;
use crate::encrypted::ring::{RingContext, RnsPoly};

/// Half-width of the centered binomial error distribution (variance 10.5).
const ERROR_WIDTH: u32 = 21;

/// Ternary secret `s`. Only the decrypting party should ever hold one.
#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct SecretKey {
    coeffs: Vec<i64>,
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl SecretKey {
    pub(crate) fn generate<R: Rng + ?Sized>(degree: usize, rng: &mut R) -> Self {
        Self {
            coeffs: sample_ternary(rng, degree),
        }
    }

    pub(crate) fn degree(&self) -> usize {
        self.coeffs.len()
    }

    pub(crate) fn to_ntt(&self, ring: &RingContext, basis: &[usize]) -> RnsPoly {
        ring.to_ntt(ring.from_signed(&self.coeffs, basis), basis)
    }

    fn automorphism(&self, galois: usize) -> Vec<i64> {
        let n = self.coeffs.len();
        let mut out = vec![0i64; n];
        for (i, &value) in self.coeffs.iter().enumerate() {
            let target = (i * galois) % (2 * n);
            if target < n {
                out[target] = value;
            } else {
                out[target - n] = -value;
            }
        }
        out
    }
}

/// `(b, a) = (-a*s + e, a)` in NTT form over the data primes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKey {
    pub(crate) b: RnsPoly,
    pub(crate) a: RnsPoly,
}

impl PublicKey {
    pub(crate) fn generate<R: Rng + ?Sized>(
        ring: &RingContext,
        secret: &SecretKey,
        rng: &mut R,
    ) -> Self {
        let basis = ring.basis(ring.data_prime_count());
        let (b, a) = rlwe_sample(ring, secret, &basis, rng);
        Self { b, a }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct KeySwitchDigit {
    pub(crate) b: RnsPoly,
    pub(crate) a: RnsPoly,
}

/// Encrypts `P * s'` under `s`, one digit per data prime, over every data
/// prime plus the special prime `P` (NTT form). Relinearisation uses
/// `s' = s^2`; rotations use `s' = s(X^g)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySwitchKey {
    pub(crate) digits: Vec<KeySwitchDigit>,
}

impl KeySwitchKey {
    fn generate<R: Rng + ?Sized>(
        ring: &RingContext,
        secret: &SecretKey,
        target: &RnsPoly,
        rng: &mut R,
    ) -> Self {
        let basis = ring.extended_basis(ring.data_prime_count());
        let special = ring.modulus(ring.special_index());

        let digits = (0..ring.data_prime_count())
            .map(|digit| {
                let (mut b, a) = rlwe_sample(ring, secret, &basis, rng);
                let q = ring.modulus(digit);
                let factor = special % q;
                for (value, &t) in b.residue_mut(digit).iter_mut().zip(&target.residues()[digit]) {
                    *value = add_mod(*value, mul_mod(factor, t, q), q);
                }
                KeySwitchDigit { b, a }
            })
            .collect();
        Self { digits }
    }

    pub(crate) fn relinearization<R: Rng + ?Sized>(
        ring: &RingContext,
        secret: &SecretKey,
        rng: &mut R,
    ) -> Self {
        let basis = ring.extended_basis(ring.data_prime_count());
        let s = secret.to_ntt(ring, &basis);
        let squared = s.mul(&s, &ring.moduli(&basis));
        Self::generate(ring, secret, &squared, rng)
    }

    fn galois<R: Rng + ?Sized>(
        ring: &RingContext,
        secret: &SecretKey,
        galois: usize,
        rng: &mut R,
    ) -> Self {
        let basis = ring.extended_basis(ring.data_prime_count());
        let mut rotated = secret.automorphism(galois);
        let target = ring.to_ntt(ring.from_signed(&rotated, &basis), &basis);
        rotated.zeroize();
        Self::generate(ring, secret, &target, rng)
    }
}

/// Rotation keys indexed by Galois element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GaloisKeys {
    keys: BTreeMap<usize, KeySwitchKey>,
}

impl GaloisKeys {
    /// Keys for every power-of-two left rotation below the slot count, which
    /// is what the rotate-and-sum reduction needs.
    pub(crate) fn power_of_two<R: Rng + ?Sized>(
        ring: &RingContext,
        encoder: &SlotEncoder,
        secret: &SecretKey,
        rng: &mut R,
    ) -> Self {
        let mut keys = BTreeMap::new();
        let mut step = 1;
        while step < encoder.slot_count() {
            let galois = encoder.galois_element(step);
            keys.insert(galois, KeySwitchKey::galois(ring, secret, galois, rng));
            step <<= 1;
        }
        Self { keys }
    }

    pub(crate) fn get(&self, galois: usize) -> Option<&KeySwitchKey> {
        self.keys.get(&galois)
    }

    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}

/// `(-a*s + e, a)` in NTT form over `basis`, with `a` uniform.
fn rlwe_sample<R: Rng + ?Sized>(
    ring: &RingContext,
    secret: &SecretKey,
    basis: &[usize],
    rng: &mut R,
) -> (RnsPoly, RnsPoly) {
    let moduli = ring.moduli(basis);
    let s = secret.to_ntt(ring, basis);
    let a = ring.sample_uniform(rng, basis);
    let e = ring.to_ntt(
        ring.from_signed(&sample_error(rng, ring.degree()), basis),
        basis,
    );

    let mut b = a.mul(&s, &moduli);
    b.negate(&moduli);
    b.add_assign(&e, &moduli);
    (b, a)
}

pub(crate) fn sample_ternary<R: Rng + ?Sized>(rng: &mut R, degree: usize) -> Vec<i64> {
    (0..degree).map(|_| rng.gen_range(-1i64..=1)).collect()
}

pub(crate) fn sample_error<R: Rng + ?Sized>(rng: &mut R, degree: usize) -> Vec<i64> {
    let mask = (1u64 << ERROR_WIDTH) - 1;
    (0..degree)
        .map(|_| {
            let bits: u64 = rng.gen();
            (bits & mask).count_ones() as i64 - ((bits >> ERROR_WIDTH) & mask).count_ones() as i64
        })
        .collect()
}
