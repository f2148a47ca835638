//! Normalization and cosine-distance primitives shared by every matcher.

use crate::errors::{AppError, AppResult};

pub fn magnitude(values: &[f64]) -> f64 {
    values.iter().map(|value| value * value).sum::<f64>().sqrt()
}

pub fn dot(lhs: &[f64], rhs: &[f64]) -> AppResult<f64> {
    ensure_same_dimension(lhs, rhs)?;
    Ok(lhs.iter().zip(rhs.iter()).map(|(l, r)| l * r).sum())
}

/// Returns `values / ||values||`.
pub fn normalize(values: &[f64]) -> AppResult<Vec<f64>> {
    let norm = magnitude(values);
    if norm == 0.0 {
        return Err(AppError::DivideByZero);
    }
    Ok(values.iter().map(|value| value / norm).collect())
}

pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> AppResult<f64> {
    ensure_same_dimension(lhs, rhs)?;

    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    if norm_lhs == 0.0 || norm_rhs == 0.0 {
        return Err(AppError::DivideByZero);
    }
    Ok(dot / (norm_lhs.sqrt() * norm_rhs.sqrt()))
}

/// `1 - cos(lhs, rhs)`; 0 for identical direction, 2 for opposite.
pub fn cosine_distance(lhs: &[f64], rhs: &[f64]) -> AppResult<f64> {
    cosine_similarity(lhs, rhs).map(|similarity| 1.0 - similarity)
}

pub fn ensure_same_dimension(lhs: &[f64], rhs: &[f64]) -> AppResult<()> {
    if lhs.len() != rhs.len() {
        return Err(AppError::DimensionMismatch {
            expected: lhs.len(),
            found: rhs.len(),
        });
    }
    Ok(())
}
