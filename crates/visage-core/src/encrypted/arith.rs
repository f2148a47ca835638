//! Word-sized modular arithmetic, NTT-friendly prime search and the negacyclic
//! number-theoretic transform used by the ring layer.

use crate::errors::{AppError, AppResult};

pub const MIN_PRIME_BITS: u32 = 14;
pub const MAX_PRIME_BITS: u32 = 60;

const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

#[inline]
pub(crate) fn add_mod(a: u64, b: u64, q: u64) -> u64 {
    let sum = a + b;
    if sum >= q {
        sum - q
    } else {
        sum
    }
}

#[inline]
pub(crate) fn sub_mod(a: u64, b: u64, q: u64) -> u64 {
    if a >= b {
        a - b
    } else {
        a + q - b
    }
}

#[inline]
pub(crate) fn neg_mod(a: u64, q: u64) -> u64 {
    if a == 0 {
        0
    } else {
        q - a
    }
}

#[inline]
pub(crate) fn mul_mod(a: u64, b: u64, q: u64) -> u64 {
    ((a as u128 * b as u128) % q as u128) as u64
}

pub(crate) fn pow_mod(mut base: u64, mut exp: u64, q: u64) -> u64 {
    let mut result = 1 % q;
    base %= q;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, q);
        }
        base = mul_mod(base, base, q);
        exp >>= 1;
    }
    result
}

/// Inverse modulo a prime.
pub(crate) fn inv_mod(a: u64, q: u64) -> u64 {
    pow_mod(a, q - 2, q)
}

#[inline]
pub(crate) fn reduce_i64(value: i64, q: u64) -> u64 {
    (value as i128).rem_euclid(q as i128) as u64
}

/// Representative of `value` in `(-q/2, q/2]`.
#[inline]
pub(crate) fn center(value: u64, q: u64) -> i64 {
    if value > q / 2 {
        value as i64 - q as i64
    } else {
        value as i64
    }
}

/// Deterministic Miller-Rabin; the witness set is exact for every `u64`.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }

    'witness: for &a in &WITNESSES {
        let mut x = pow_mod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Picks one prime `q ≡ 1 (mod 2·degree)` of exactly each requested bit size,
/// searching downward from `2^bits` and never repeating a prime.
pub fn generate_primes(bit_sizes: &[u32], degree: usize) -> AppResult<Vec<u64>> {
    let step = 2 * degree as u64;
    let mut chosen: Vec<u64> = Vec::with_capacity(bit_sizes.len());

    for &bits in bit_sizes {
        if !(MIN_PRIME_BITS..=MAX_PRIME_BITS).contains(&bits) {
            return Err(AppError::InvalidParameters(format!(
                "coefficient modulus bit size {bits} is outside {MIN_PRIME_BITS}..={MAX_PRIME_BITS}"
            )));
        }
        let upper = 1u64 << bits;
        let lower = 1u64 << (bits - 1);
        if upper <= step {
            return Err(AppError::InvalidParameters(format!(
                "{bits}-bit primes are too small for polynomial degree {degree}"
            )));
        }

        let mut candidate = upper - step + 1;
        loop {
            if candidate <= lower {
                return Err(AppError::InvalidParameters(format!(
                    "not enough {bits}-bit primes congruent to 1 mod {step}"
                )));
            }
            if !chosen.contains(&candidate) && is_prime(candidate) {
                break;
            }
            candidate -= step;
        }
        chosen.push(candidate);
    }

    Ok(chosen)
}

fn bit_reverse(mut value: usize, bits: u32) -> usize {
    let mut reversed = 0;
    for _ in 0..bits {
        reversed = (reversed << 1) | (value & 1);
        value >>= 1;
    }
    reversed
}

/// Twiddle tables for the negacyclic NTT modulo one prime. Powers of the
/// primitive `2n`-th root are stored in bit-reversed order so the forward
/// transform takes natural-order input and produces bit-reversed output,
/// which the inverse transform undoes.
#[derive(Debug, Clone)]
pub struct NttTables {
    modulus: u64,
    degree: usize,
    psi_rev: Vec<u64>,
    psi_inv_rev: Vec<u64>,
    degree_inv: u64,
}

impl NttTables {
    pub fn new(modulus: u64, degree: usize) -> AppResult<Self> {
        if !degree.is_power_of_two() || degree < 2 {
            return Err(AppError::InvalidParameters(format!(
                "polynomial degree {degree} is not a power of two"
            )));
        }
        let two_n = 2 * degree as u64;
        if (modulus - 1) % two_n != 0 {
            return Err(AppError::InvalidParameters(format!(
                "{modulus} is not congruent to 1 mod {two_n}"
            )));
        }

        let psi = primitive_root(modulus, degree).ok_or_else(|| {
            AppError::InvalidParameters(format!("no primitive {two_n}-th root modulo {modulus}"))
        })?;
        let psi_inv = inv_mod(psi, modulus);
        let log_n = degree.trailing_zeros();

        let mut psi_rev = vec![0u64; degree];
        let mut psi_inv_rev = vec![0u64; degree];
        let mut power = 1u64;
        let mut power_inv = 1u64;
        for i in 0..degree {
            let slot = bit_reverse(i, log_n);
            psi_rev[slot] = power;
            psi_inv_rev[slot] = power_inv;
            power = mul_mod(power, psi, modulus);
            power_inv = mul_mod(power_inv, psi_inv, modulus);
        }

        Ok(Self {
            modulus,
            degree,
            psi_rev,
            psi_inv_rev,
            degree_inv: inv_mod(degree as u64 % modulus, modulus),
        })
    }

    pub fn modulus(&self) -> u64 {
        self.modulus
    }

    pub fn forward(&self, values: &mut [u64]) {
        let q = self.modulus;
        let n = self.degree;
        let mut t = n;
        let mut m = 1;
        while m < n {
            t >>= 1;
            for i in 0..m {
                let start = 2 * i * t;
                let twiddle = self.psi_rev[m + i];
                for j in start..start + t {
                    let u = values[j];
                    let v = mul_mod(values[j + t], twiddle, q);
                    values[j] = add_mod(u, v, q);
                    values[j + t] = sub_mod(u, v, q);
                }
            }
            m <<= 1;
        }
    }

    pub fn inverse(&self, values: &mut [u64]) {
        let q = self.modulus;
        let mut t = 1;
        let mut m = self.degree;
        while m > 1 {
            let half = m >> 1;
            let mut start = 0;
            for i in 0..half {
                let twiddle = self.psi_inv_rev[half + i];
                for j in start..start + t {
                    let u = values[j];
                    let v = values[j + t];
                    values[j] = add_mod(u, v, q);
                    values[j + t] = mul_mod(sub_mod(u, v, q), twiddle, q);
                }
                start += 2 * t;
            }
            t <<= 1;
            m = half;
        }
        for value in values.iter_mut() {
            *value = mul_mod(*value, self.degree_inv, q);
        }
    }
}

fn primitive_root(modulus: u64, degree: usize) -> Option<u64> {
    let exponent = (modulus - 1) / (2 * degree as u64);
    (2..modulus.min(1 << 20))
        .map(|generator| pow_mod(generator, exponent, modulus))
        .find(|&psi| pow_mod(psi, degree as u64, modulus) == modulus - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn negacyclic_product(a: &[u64], b: &[u64], q: u64) -> Vec<u64> {
        let n = a.len();
        let mut out = vec![0u64; n];
        for i in 0..n {
            for j in 0..n {
                let term = mul_mod(a[i], b[j], q);
                let k = i + j;
                if k < n {
                    out[k] = add_mod(out[k], term, q);
                } else {
                    out[k - n] = sub_mod(out[k - n], term, q);
                }
            }
        }
        out
    }

    #[test]
    fn small_primes_are_classified() {
        let primes: Vec<u64> = (0..60).filter(|&n| is_prime(n)).collect();
        assert_eq!(
            primes,
            vec![2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59]
        );
        assert!(is_prime(1_152_921_504_606_844_417));
        assert!(!is_prime(1_152_921_504_606_844_419));
        assert!(!is_prime(3_215_031_751));
    }

    #[test]
    fn generated_primes_are_ntt_friendly_and_distinct() {
        let primes = generate_primes(&[60, 40, 60], 2048).unwrap();
        assert_eq!(primes.len(), 3);
        assert_ne!(primes[0], primes[2]);
        for (prime, bits) in primes.iter().zip([60u32, 40, 60]) {
            assert!(is_prime(*prime));
            assert_eq!(64 - prime.leading_zeros(), bits);
            assert_eq!(prime % 4096, 1);
        }
    }

    #[test]
    fn prime_search_rejects_impossible_sizes() {
        assert!(matches!(
            generate_primes(&[70], 1024),
            Err(AppError::InvalidParameters(_))
        ));
        assert!(matches!(
            generate_primes(&[14], 8192),
            Err(AppError::InvalidParameters(_))
        ));
    }

    #[test]
    fn ntt_multiplication_matches_schoolbook() {
        let tables = NttTables::new(97, 8).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let a: Vec<u64> = (0..8).map(|_| rng.gen_range(0..97)).collect();
            let b: Vec<u64> = (0..8).map(|_| rng.gen_range(0..97)).collect();
            let expected = negacyclic_product(&a, &b, 97);

            let mut fa = a.clone();
            let mut fb = b.clone();
            tables.forward(&mut fa);
            tables.forward(&mut fb);
            let mut product: Vec<u64> = fa.iter().zip(&fb).map(|(x, y)| mul_mod(*x, *y, 97)).collect();
            tables.inverse(&mut product);
            assert_eq!(product, expected);
        }
    }

    #[test]
    fn ntt_round_trips_large_prime() {
        let q = generate_primes(&[50], 64).unwrap()[0];
        let tables = NttTables::new(q, 64).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let original: Vec<u64> = (0..64).map(|_| rng.gen_range(0..q)).collect();
        let mut values = original.clone();
        tables.forward(&mut values);
        tables.inverse(&mut values);
        assert_eq!(values, original);
    }

    #[test]
    fn centering_and_reduction_agree() {
        assert_eq!(reduce_i64(-1, 97), 96);
        assert_eq!(center(96, 97), -1);
        assert_eq!(center(48, 97), 48);
        assert_eq!(center(49, 97), -48);
        assert_eq!(mul_mod(inv_mod(5, 97), 5, 97), 1);
    }
}
