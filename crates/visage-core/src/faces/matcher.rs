use std::cmp::Ordering;

use serde::Serialize;
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::faces::catalog::Catalog;
use crate::faces::store::EmbeddingReader;
use crate::vector::cosine_distance;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MatchResult {
    pub label: String,
    pub distance: f64,
    pub image_path: String,
}

/// Linear scan over every catalogued embedding. The first record wins ties;
/// a missing or unreadable embedding file fails the whole match.
pub fn find_nearest<R: EmbeddingReader + ?Sized>(
    query: &[f64],
    catalog: &Catalog,
    reader: &R,
) -> AppResult<MatchResult> {
    if catalog.is_empty() {
        return Err(AppError::EmptyCatalog);
    }

    let mut best: Option<MatchResult> = None;
    for record in catalog.records() {
        let stored = reader.read_embedding(record)?;
        let distance = cosine_distance(query, &stored)?;
        debug!(label = %record.label, hash = %record.content_hash, distance, "scored record");

        let closer = best
            .as_ref()
            .map_or(true, |current| distance < current.distance);
        if closer {
            best = Some(MatchResult {
                label: record.label.clone(),
                distance,
                image_path: record.image_path.clone(),
            });
        }
    }

    best.ok_or(AppError::EmptyCatalog)
}

/// The `k` closest records in ascending distance, catalog order breaking ties.
pub fn rank_nearest<R: EmbeddingReader + ?Sized>(
    query: &[f64],
    catalog: &Catalog,
    reader: &R,
    k: usize,
) -> AppResult<Vec<MatchResult>> {
    if catalog.is_empty() {
        return Err(AppError::EmptyCatalog);
    }

    let mut scored = Vec::with_capacity(catalog.len());
    for record in catalog.records() {
        let stored = reader.read_embedding(record)?;
        scored.push(MatchResult {
            label: record.label.clone(),
            distance: cosine_distance(query, &stored)?,
            image_path: record.image_path.clone(),
        });
    }

    scored.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    Ok(scored)
}
