use std::f64::consts::PI;

use crate::errors::{AppError, AppResult};

/// Galois element that rotates slots one step to the left.
pub const ROTATION_GENERATOR: usize = 5;

/// Real-valued canonical embedding: slot `j` is the evaluation of the message
/// polynomial at `zeta^(5^j)`, `zeta = exp(i*pi/N)`. Only real inputs are
/// supported, so one cosine table covers both encoding and decoding.
#[derive(Debug, Clone)]
pub struct SlotEncoder {
    degree: usize,
    cosines: Vec<f64>,
    rotation_group: Vec<usize>,
}

impl SlotEncoder {
    pub fn new(degree: usize) -> Self {
        let two_n = 2 * degree;
        let cosines = (0..two_n)
            .map(|k| (PI * k as f64 / degree as f64).cos())
            .collect();

        let mut rotation_group = Vec::with_capacity(degree / 2);
        let mut element = 1usize;
        for _ in 0..degree / 2 {
            rotation_group.push(element);
            element = (element * ROTATION_GENERATOR) % two_n;
        }

        Self {
            degree,
            cosines,
            rotation_group,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.degree / 2
    }

    /// Rounds `values * scale` into integer polynomial coefficients. Slots past
    /// `values.len()` encode zero.
    pub fn encode(&self, values: &[f64], scale: f64) -> AppResult<Vec<i64>> {
        if values.len() > self.slot_count() {
            return Err(AppError::InvalidParameters(format!(
                "{} values do not fit in {} slots",
                values.len(),
                self.slot_count()
            )));
        }
        if values.iter().any(|value| !value.is_finite()) {
            return Err(AppError::InvalidEmbedding(
                "cannot encode non-finite values".into(),
            ));
        }

        let two_n = 2 * self.degree;
        let factor = 2.0 * scale / self.degree as f64;
        let limit = 2f64.powi(62);
        let mut coeffs = Vec::with_capacity(self.degree);
        for i in 0..self.degree {
            let mut acc = 0.0;
            for (value, &element) in values.iter().zip(&self.rotation_group) {
                acc += value * self.cosines[(element * i) % two_n];
            }
            let scaled = (acc * factor).round();
            if scaled.abs() >= limit {
                return Err(AppError::InvalidParameters(format!(
                    "scaled coefficient {scaled:e} overflows the plaintext range"
                )));
            }
            coeffs.push(scaled as i64);
        }
        Ok(coeffs)
    }

    /// Evaluates the first `count` slots of a lifted plaintext.
    pub fn decode(&self, coeffs: &[f64], scale: f64, count: usize) -> Vec<f64> {
        let two_n = 2 * self.degree;
        self.rotation_group
            .iter()
            .take(count)
            .map(|&element| {
                let sum: f64 = coeffs
                    .iter()
                    .enumerate()
                    .map(|(i, coeff)| coeff * self.cosines[(element * i) % two_n])
                    .sum();
                sum / scale
            })
            .collect()
    }

    /// Galois element for a left rotation by `steps` slots.
    pub fn galois_element(&self, steps: usize) -> usize {
        let two_n = 2 * self.degree;
        let mut element = 1usize;
        for _ in 0..steps % self.slot_count() {
            element = (element * ROTATION_GENERATOR) % two_n;
        }
        element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_recovers_values() {
        let encoder = SlotEncoder::new(64);
        let values = [0.5, -1.25, 3.0, 0.0, 7.75];
        let coeffs = encoder.encode(&values, 2f64.powi(30)).unwrap();
        let lifted: Vec<f64> = coeffs.iter().map(|&c| c as f64).collect();
        let decoded = encoder.decode(&lifted, 2f64.powi(30), 6);
        for (got, want) in decoded.iter().zip(values.iter().chain([0.0].iter())) {
            assert!((got - want).abs() < 1e-6, "{got} vs {want}");
        }
    }

    #[test]
    fn galois_elements_follow_powers_of_five() {
        let encoder = SlotEncoder::new(16);
        assert_eq!(encoder.galois_element(0), 1);
        assert_eq!(encoder.galois_element(1), 5);
        assert_eq!(encoder.galois_element(2), 25 % 32);
        assert_eq!(encoder.galois_element(8), 1);
    }

    #[test]
    fn too_many_values_are_rejected() {
        let encoder = SlotEncoder::new(8);
        assert!(matches!(
            encoder.encode(&[1.0; 5], 1024.0),
            Err(AppError::InvalidParameters(_))
        ));
        assert!(matches!(
            encoder.encode(&[f64::NAN], 1024.0),
            Err(AppError::InvalidEmbedding(_))
        ));
    }
}
