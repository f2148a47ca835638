use serde::{Deserialize, Serialize};
use visage_config::ResolvedEncryption;

use crate::encrypted::arith::{MAX_PRIME_BITS, MIN_PRIME_BITS};
use crate::errors::{AppError, AppResult};

/// Largest total coefficient modulus, in bits, that keeps each ring degree at
/// 128-bit classical security with ternary secrets.
const TC128_MAX_MODULUS_BITS: [(usize, u32); 6] = [
    (1024, 27),
    (2048, 54),
    (4096, 109),
    (8192, 218),
    (16384, 438),
    (32768, 881),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// No security bound; only for tests and experiments on tiny rings.
    None,
    Tc128,
}

/// CKKS parameters. The last entry of `coeff_mod_bit_sizes` sizes the special
/// key-switching prime; the others size the data primes, and the dot product
/// consumes one of them when it rescales.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub poly_modulus_degree: usize,
    pub coeff_mod_bit_sizes: Vec<u32>,
    pub global_scale_bits: u32,
    pub security: SecurityLevel,
}

impl Default for EncryptionParams {
    fn default() -> Self {
        Self::from(&visage_config::ResolvedConfig::default().encryption)
    }
}

impl From<&ResolvedEncryption> for EncryptionParams {
    fn from(config: &ResolvedEncryption) -> Self {
        Self {
            poly_modulus_degree: config.poly_modulus_degree,
            coeff_mod_bit_sizes: config.coeff_mod_bit_sizes.clone(),
            global_scale_bits: config.global_scale_bits,
            security: SecurityLevel::Tc128,
        }
    }
}

impl EncryptionParams {
    pub fn new(
        poly_modulus_degree: usize,
        coeff_mod_bit_sizes: Vec<u32>,
        global_scale_bits: u32,
    ) -> AppResult<Self> {
        let params = Self {
            poly_modulus_degree,
            coeff_mod_bit_sizes,
            global_scale_bits,
            security: SecurityLevel::Tc128,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn with_security(mut self, security: SecurityLevel) -> Self {
        self.security = security;
        self
    }

    pub fn global_scale(&self) -> f64 {
        2f64.powi(self.global_scale_bits as i32)
    }

    pub fn slot_count(&self) -> usize {
        self.poly_modulus_degree / 2
    }

    pub fn total_modulus_bits(&self) -> u32 {
        self.coeff_mod_bit_sizes.iter().sum()
    }

    pub fn validate(&self) -> AppResult<()> {
        let degree = self.poly_modulus_degree;
        if !degree.is_power_of_two() || degree < 8 {
            return Err(AppError::InvalidParameters(format!(
                "poly_modulus_degree {degree} must be a power of two of at least 8"
            )));
        }
        if self.coeff_mod_bit_sizes.len() < 3 {
            return Err(AppError::InvalidParameters(
                "coeff_mod_bit_sizes needs two data primes and a special prime".into(),
            ));
        }
        if let Some(bits) = self
            .coeff_mod_bit_sizes
            .iter()
            .find(|bits| !(MIN_PRIME_BITS..=MAX_PRIME_BITS).contains(*bits))
        {
            return Err(AppError::InvalidParameters(format!(
                "coefficient modulus bit size {bits} is outside {MIN_PRIME_BITS}..={MAX_PRIME_BITS}"
            )));
        }
        if self.global_scale_bits == 0 || self.global_scale_bits > MAX_PRIME_BITS {
            return Err(AppError::InvalidParameters(format!(
                "global_scale_bits {} is outside 1..={MAX_PRIME_BITS}",
                self.global_scale_bits
            )));
        }

        if self.security == SecurityLevel::Tc128 {
            let bound = TC128_MAX_MODULUS_BITS
                .iter()
                .find(|(n, _)| *n == degree)
                .map(|(_, bits)| *bits)
                .ok_or_else(|| {
                    AppError::InvalidParameters(format!(
                        "poly_modulus_degree {degree} is not supported at 128-bit security"
                    ))
                })?;
            let total = self.total_modulus_bits();
            if total > bound {
                return Err(AppError::InvalidParameters(format!(
                    "total coefficient modulus of {total} bits exceeds {bound} bits for degree {degree}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_configuration_defaults() {
        let params = EncryptionParams::default();
        assert_eq!(params.poly_modulus_degree, 8192);
        assert_eq!(params.coeff_mod_bit_sizes, vec![40, 20, 40]);
        assert_eq!(params.global_scale(), 1_048_576.0);
        assert_eq!(params.slot_count(), 4096);
        params.validate().unwrap();
    }

    #[test]
    fn oversized_modulus_is_rejected_at_128_bits() {
        let err = EncryptionParams::new(2048, vec![60, 40, 60], 40).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameters(_)));

        EncryptionParams {
            poly_modulus_degree: 2048,
            coeff_mod_bit_sizes: vec![60, 40, 60],
            global_scale_bits: 40,
            security: SecurityLevel::None,
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn malformed_parameters_are_rejected() {
        assert!(EncryptionParams::new(3000, vec![40, 20, 40], 20).is_err());
        assert!(EncryptionParams::new(8192, vec![40, 40], 20).is_err());
        assert!(EncryptionParams::new(8192, vec![40, 61, 40], 20).is_err());
        assert!(EncryptionParams::new(8192, vec![40, 20, 40], 0).is_err());
    }
}
