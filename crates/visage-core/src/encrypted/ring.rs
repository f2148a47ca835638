//! Polynomials in `Z_Q[X]/(X^N + 1)` stored as one residue vector per prime
//! of the coefficient modulus (RNS form).

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::encrypted::arith::{
    add_mod, center, inv_mod, mul_mod, neg_mod, reduce_i64, sub_mod, NttTables,
};
use crate::errors::{AppError, AppResult};

/// A polynomial over a basis of primes. Whether the residues hold
/// coefficients or NTT evaluations is tracked by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RnsPoly {
    residues: Vec<Vec<u64>>,
}

impl RnsPoly {
    pub(crate) fn zero(primes: usize, degree: usize) -> Self {
        Self {
            residues: vec![vec![0; degree]; primes],
        }
    }

    pub(crate) fn from_residues(residues: Vec<Vec<u64>>) -> Self {
        Self { residues }
    }

    pub fn prime_count(&self) -> usize {
        self.residues.len()
    }

    pub(crate) fn residues(&self) -> &[Vec<u64>] {
        &self.residues
    }

    pub(crate) fn residue_mut(&mut self, index: usize) -> &mut [u64] {
        &mut self.residues[index]
    }

    pub(crate) fn add_assign(&mut self, other: &RnsPoly, moduli: &[u64]) {
        for ((lhs, rhs), &q) in self.residues.iter_mut().zip(&other.residues).zip(moduli) {
            for (a, b) in lhs.iter_mut().zip(rhs) {
                *a = add_mod(*a, *b, q);
            }
        }
    }

    pub(crate) fn negate(&mut self, moduli: &[u64]) {
        for (residue, &q) in self.residues.iter_mut().zip(moduli) {
            for a in residue.iter_mut() {
                *a = neg_mod(*a, q);
            }
        }
    }

    /// Pointwise product; both operands must be in NTT form.
    pub(crate) fn mul(&self, other: &RnsPoly, moduli: &[u64]) -> RnsPoly {
        let residues = self
            .residues
            .iter()
            .zip(&other.residues)
            .zip(moduli)
            .map(|((lhs, rhs), &q)| lhs.iter().zip(rhs).map(|(a, b)| mul_mod(*a, *b, q)).collect())
            .collect();
        RnsPoly { residues }
    }

    /// `self += lhs * rhs` pointwise, where residue `k` of `self` and `lhs`
    /// pairs with residue `rhs_basis[k]` of `rhs`.
    pub(crate) fn mul_add_assign(
        &mut self,
        lhs: &RnsPoly,
        rhs: &RnsPoly,
        rhs_basis: &[usize],
        moduli: &[u64],
    ) {
        for (((acc, l), &index), &q) in self
            .residues
            .iter_mut()
            .zip(&lhs.residues)
            .zip(rhs_basis)
            .zip(moduli)
        {
            for ((a, x), y) in acc.iter_mut().zip(l).zip(&rhs.residues[index]) {
                *a = add_mod(*a, mul_mod(*x, *y, q), q);
            }
        }
    }

    pub(crate) fn has_degree(&self, degree: usize) -> bool {
        self.residues.iter().all(|residue| residue.len() == degree)
    }
}

/// NTT tables for every prime of the modulus chain. The last prime is the
/// special key-switching prime; the others carry ciphertext data.
#[derive(Debug, Clone)]
pub struct RingContext {
    degree: usize,
    tables: Vec<NttTables>,
}

impl RingContext {
    pub fn new(degree: usize, primes: &[u64]) -> AppResult<Self> {
        if primes.len() < 2 {
            return Err(AppError::InvalidParameters(
                "the modulus chain needs at least one data prime and the special prime".into(),
            ));
        }
        let tables = primes
            .iter()
            .map(|&q| NttTables::new(q, degree))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { degree, tables })
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn data_prime_count(&self) -> usize {
        self.tables.len() - 1
    }

    pub fn special_index(&self) -> usize {
        self.tables.len() - 1
    }

    pub fn primes(&self) -> Vec<u64> {
        self.tables.iter().map(NttTables::modulus).collect()
    }

    /// Data primes `0..level`.
    pub(crate) fn basis(&self, level: usize) -> Vec<usize> {
        (0..level).collect()
    }

    /// Data primes `0..level` followed by the special prime.
    pub(crate) fn extended_basis(&self, level: usize) -> Vec<usize> {
        (0..level).chain(std::iter::once(self.special_index())).collect()
    }

    pub(crate) fn moduli(&self, basis: &[usize]) -> Vec<u64> {
        basis.iter().map(|&index| self.tables[index].modulus()).collect()
    }

    pub(crate) fn modulus(&self, index: usize) -> u64 {
        self.tables[index].modulus()
    }

    pub(crate) fn forward(&self, poly: &mut RnsPoly, basis: &[usize]) {
        for (residue, &index) in poly.residues.iter_mut().zip(basis) {
            self.tables[index].forward(residue);
        }
    }

    pub(crate) fn inverse(&self, poly: &mut RnsPoly, basis: &[usize]) {
        for (residue, &index) in poly.residues.iter_mut().zip(basis) {
            self.tables[index].inverse(residue);
        }
    }

    pub(crate) fn to_ntt(&self, mut poly: RnsPoly, basis: &[usize]) -> RnsPoly {
        self.forward(&mut poly, basis);
        poly
    }

    pub(crate) fn from_ntt(&self, mut poly: RnsPoly, basis: &[usize]) -> RnsPoly {
        self.inverse(&mut poly, basis);
        poly
    }

    pub(crate) fn from_signed(&self, coeffs: &[i64], basis: &[usize]) -> RnsPoly {
        let residues = basis
            .iter()
            .map(|&index| {
                let q = self.modulus(index);
                coeffs.iter().map(|&c| reduce_i64(c, q)).collect()
            })
            .collect();
        RnsPoly { residues }
    }

    pub(crate) fn sample_uniform<R: Rng + ?Sized>(&self, rng: &mut R, basis: &[usize]) -> RnsPoly {
        let residues = basis
            .iter()
            .map(|&index| {
                let q = self.modulus(index);
                (0..self.degree).map(|_| rng.gen_range(0..q)).collect()
            })
            .collect();
        RnsPoly { residues }
    }

    /// `p(X) -> p(X^galois)` on coefficient-form residues.
    pub(crate) fn automorphism(&self, poly: &RnsPoly, galois: usize, basis: &[usize]) -> RnsPoly {
        let n = self.degree;
        let two_n = 2 * n;
        let residues = poly
            .residues
            .iter()
            .zip(basis)
            .map(|(residue, &index)| {
                let q = self.modulus(index);
                let mut out = vec![0u64; n];
                for (i, &value) in residue.iter().enumerate() {
                    let target = (i * galois) % two_n;
                    if target < n {
                        out[target] = value;
                    } else {
                        out[target - n] = neg_mod(value, q);
                    }
                }
                out
            })
            .collect();
        RnsPoly { residues }
    }

    /// Divides a coefficient-form polynomial over `extended_basis(level)` by
    /// the special prime, rounding, and returns it over `basis(level)`.
    pub(crate) fn mod_down(&self, mut poly: RnsPoly, level: usize) -> RnsPoly {
        let special = self.modulus(self.special_index());
        let last = poly.residues.pop().unwrap_or_default();
        for (index, residue) in poly.residues.iter_mut().enumerate().take(level) {
            let q = self.modulus(index);
            let special_inv = inv_mod(special % q, q);
            for (value, &top) in residue.iter_mut().zip(&last) {
                let correction = reduce_i64(center(top, special), q);
                *value = mul_mod(sub_mod(*value, correction, q), special_inv, q);
            }
        }
        poly
    }

    /// Divides a coefficient-form polynomial by its last data prime, rounding,
    /// and drops that prime.
    pub(crate) fn rescale(&self, mut poly: RnsPoly) -> RnsPoly {
        let level = poly.prime_count();
        let dropped = self.modulus(level - 1);
        let last = poly.residues.pop().unwrap_or_default();
        for (index, residue) in poly.residues.iter_mut().enumerate() {
            let q = self.modulus(index);
            let dropped_inv = inv_mod(dropped % q, q);
            for (value, &top) in residue.iter_mut().zip(&last) {
                let correction = reduce_i64(center(top, dropped), q);
                *value = mul_mod(sub_mod(*value, correction, q), dropped_inv, q);
            }
        }
        poly
    }

    /// Lifts every coefficient to its centered integer value modulo the
    /// product of the polynomial's primes, as `f64`.
    pub(crate) fn to_centered_f64(&self, poly: &RnsPoly) -> Vec<f64> {
        let moduli = self.moduli(&self.basis(poly.prime_count()));
        let garner = Garner::new(&moduli);
        let mut residues = vec![0u64; moduli.len()];
        (0..self.degree)
            .map(|k| {
                for (slot, residue) in residues.iter_mut().zip(&poly.residues) {
                    *slot = residue[k];
                }
                garner.centered(&residues)
            })
            .collect()
    }
}

/// Mixed-radix reconstruction for a fixed prime basis.
struct Garner<'a> {
    moduli: &'a [u64],
    /// `(q_0 ... q_{i-1})^-1 mod q_i`
    prefix_inv: Vec<u64>,
}

impl<'a> Garner<'a> {
    fn new(moduli: &'a [u64]) -> Self {
        let prefix_inv = moduli
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                let prefix = moduli[..i].iter().fold(1u64, |acc, &p| mul_mod(acc, p % q, q));
                inv_mod(prefix, q)
            })
            .collect();
        Self { moduli, prefix_inv }
    }

    fn digits(&self, residues: &[u64]) -> Vec<u64> {
        let mut digits: Vec<u64> = Vec::with_capacity(self.moduli.len());
        for (i, &q) in self.moduli.iter().enumerate() {
            let mut partial = 0u64;
            let mut radix = 1u64;
            for (j, &digit) in digits.iter().enumerate() {
                partial = add_mod(partial, mul_mod(digit % q, radix, q), q);
                radix = mul_mod(radix, self.moduli[j] % q, q);
            }
            digits.push(mul_mod(sub_mod(residues[i], partial, q), self.prefix_inv[i], q));
        }
        digits
    }

    fn value(&self, digits: &[u64]) -> f64 {
        let mut total = 0.0;
        let mut radix = 1.0;
        for (&digit, &q) in digits.iter().zip(self.moduli) {
            total += digit as f64 * radix;
            radix *= q as f64;
        }
        total
    }

    fn centered(&self, residues: &[u64]) -> f64 {
        let positive = self.digits(residues);
        let negated: Vec<u64> = residues
            .iter()
            .zip(self.moduli)
            .map(|(&r, &q)| neg_mod(r, q))
            .collect();
        let negative = self.digits(&negated);

        if positive.iter().rev().le(negative.iter().rev()) {
            self.value(&positive)
        } else {
            -self.value(&negative)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypted::arith::generate_primes;

    fn ring(degree: usize, bits: &[u32]) -> RingContext {
        RingContext::new(degree, &generate_primes(bits, degree).unwrap()).unwrap()
    }

    #[test]
    fn centered_lift_recovers_signed_coefficients() {
        let ring = ring(16, &[40, 30, 40]);
        let coeffs: Vec<i64> = (0..16).map(|i| (i as i64 - 8) * 123_456_789).collect();
        let poly = ring.from_signed(&coeffs, &ring.basis(2));
        let lifted = ring.to_centered_f64(&poly);
        for (value, expected) in lifted.iter().zip(&coeffs) {
            assert_eq!(*value, *expected as f64);
        }
    }

    #[test]
    fn rescale_divides_by_the_last_prime() {
        let ring = ring(16, &[50, 30, 50]);
        let dropped = ring.modulus(1) as i64;
        let coeffs: Vec<i64> = (0..16).map(|i| (i as i64 - 5) * dropped * 7 + 3).collect();
        let poly = ring.rescale(ring.from_signed(&coeffs, &ring.basis(2)));
        assert_eq!(poly.prime_count(), 1);
        let lifted = ring.to_centered_f64(&poly);
        for (value, i) in lifted.iter().zip(0..) {
            assert_eq!(*value, ((i as i64 - 5) * 7) as f64);
        }
    }

    #[test]
    fn automorphism_by_one_is_identity_and_composes() {
        let ring = ring(8, &[30, 30, 30]);
        let coeffs: Vec<i64> = vec![1, -2, 3, -4, 5, -6, 7, -8];
        let basis = ring.basis(2);
        let poly = ring.from_signed(&coeffs, &basis);
        assert_eq!(ring.automorphism(&poly, 1, &basis), poly);

        let once = ring.automorphism(&poly, 5, &basis);
        let twice = ring.automorphism(&once, 5, &basis);
        assert_eq!(ring.automorphism(&poly, 25 % 16, &basis), twice);
    }

    #[test]
    fn mod_down_removes_the_special_prime() {
        let ring = ring(8, &[40, 40]);
        let special = ring.modulus(ring.special_index()) as i64;
        let coeffs: Vec<i64> = (0..8).map(|i| i as i64 * special - 2).collect();
        let basis = ring.extended_basis(1);
        let reduced = ring.mod_down(ring.from_signed(&coeffs, &basis), 1);
        assert_eq!(reduced.prime_count(), 1);
        let lifted = ring.to_centered_f64(&reduced);
        for (value, i) in lifted.iter().zip(0..) {
            assert_eq!(*value, i as f64);
        }
    }
}
