use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::faces::catalog::Catalog;
use crate::faces::matcher::MatchResult;
use crate::faces::store::EmbeddingReader;
use crate::vector::{cosine_distance, ensure_same_dimension, magnitude, normalize};

/// Element-wise mean of the unit-normalized member vectors of one label.
///
/// The mean itself is not renormalized, so its norm is at most 1 and shrinks
/// as members disagree. Cosine distance is scale invariant, so matching is
/// unaffected; callers computing raw dot products against `vector` must
/// divide by [`Centroid::norm`] themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroid {
    pub label: String,
    pub vector: Vec<f64>,
    pub members: usize,
    /// First catalogued image carrying this label.
    pub representative_image: String,
}

impl Centroid {
    pub fn norm(&self) -> f64 {
        magnitude(&self.vector)
    }
}

/// Centroids in order of each label's first appearance in the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CentroidSet {
    centroids: Vec<Centroid>,
}

impl CentroidSet {
    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    pub fn get(&self, label: &str) -> Option<&Centroid> {
        self.centroids.iter().find(|centroid| centroid.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Centroid> {
        self.centroids.iter()
    }
}

struct Accumulator {
    label: String,
    sum: Vec<f64>,
    members: usize,
    representative_image: String,
}

pub fn build_centroids<R: EmbeddingReader + ?Sized>(
    catalog: &Catalog,
    reader: &R,
) -> AppResult<CentroidSet> {
    let mut groups: Vec<Accumulator> = Vec::new();

    for record in catalog.records() {
        let unit = normalize(&reader.read_embedding(record)?)?;
        match groups.iter_mut().find(|group| group.label == record.label) {
            Some(group) => {
                ensure_same_dimension(&group.sum, &unit)?;
                for (total, value) in group.sum.iter_mut().zip(unit.iter()) {
                    *total += value;
                }
                group.members += 1;
            }
            None => groups.push(Accumulator {
                label: record.label.clone(),
                sum: unit,
                members: 1,
                representative_image: record.image_path.clone(),
            }),
        }
    }

    let centroids = groups
        .into_iter()
        .map(|group| {
            let count = group.members as f64;
            debug!(label = %group.label, members = group.members, "built centroid");
            Centroid {
                label: group.label,
                vector: group.sum.into_iter().map(|total| total / count).collect(),
                members: group.members,
                representative_image: group.representative_image,
            }
        })
        .collect();

    Ok(CentroidSet { centroids })
}

pub fn find_nearest_centroid(query: &[f64], centroids: &CentroidSet) -> AppResult<MatchResult> {
    if centroids.is_empty() {
        return Err(AppError::EmptyCentroidSet);
    }

    let query = normalize(query)?;
    let mut best: Option<MatchResult> = None;
    for centroid in centroids.iter() {
        let distance = cosine_distance(&query, &centroid.vector)?;
        let closer = best
            .as_ref()
            .map_or(true, |current| distance < current.distance);
        if closer {
            best = Some(MatchResult {
                label: centroid.label.clone(),
                distance,
                image_path: centroid.representative_image.clone(),
            });
        }
    }

    best.ok_or(AppError::EmptyCentroidSet)
}
