use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};
use visage_config::ResolvedConfig;

use crate::errors::{AppError, AppResult, ExtractionError};
use crate::faces::extractor::{extract_first_embedding, EmbeddingExtractor, ExtractorConfig};
use crate::vector::cosine_distance;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Verification {
    pub verified: bool,
    pub distance: f64,
    pub threshold: f64,
    pub model_name: String,
    pub detector_backend: String,
}

/// Two faces verify as the same person when their cosine distance is at or
/// below `threshold`.
pub fn verify_embeddings(
    first: &[f64],
    second: &[f64],
    threshold: f64,
    config: &ExtractorConfig,
) -> AppResult<Verification> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(AppError::InvalidEmbedding(format!(
            "distance threshold {threshold} must be a finite, non-negative number"
        )));
    }
    let distance = cosine_distance(first, second)?;
    Ok(Verification {
        verified: distance <= threshold,
        distance,
        threshold,
        model_name: config.model_name.clone(),
        detector_backend: config.detector_backend.clone(),
    })
}

/// Extracts the first face of each image and verifies the pair.
pub fn verify_pair<E: EmbeddingExtractor + ?Sized>(
    extractor: &E,
    first: &Path,
    second: &Path,
    config: &ExtractorConfig,
    threshold: f64,
) -> AppResult<Verification> {
    let lhs = extract_first_embedding(extractor, first, config)?;
    let rhs = extract_first_embedding(extractor, second, config)?;
    verify_embeddings(&lhs, &rhs, threshold, config)
}

#[derive(Debug, Clone)]
pub struct PairwiseConfig {
    pub images: Vec<PathBuf>,
    pub extractor: ExtractorConfig,
    pub threshold: f64,
}

impl PairwiseConfig {
    pub fn from_resolved(images: Vec<PathBuf>, config: &ResolvedConfig) -> Self {
        Self {
            images,
            extractor: ExtractorConfig::from(config),
            threshold: config.distance_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PairVerification {
    pub first: PathBuf,
    pub second: PathBuf,
    pub result: Verification,
}

#[derive(Debug)]
pub struct FailedPair {
    pub first: PathBuf,
    pub second: PathBuf,
    pub error: ExtractionError,
}

#[derive(Debug)]
pub struct PairwiseOutcome {
    pub pairs: Vec<PairVerification>,
    pub failed: Vec<FailedPair>,
    pub logs: Vec<String>,
}

/// Verifies every unordered pair of images, in input order. Each image is
/// extracted once; a pair involving an image the extractor failed on is
/// recorded in `failed` and the run continues. Other errors abort.
pub fn run_pairwise_comparison<E: EmbeddingExtractor + ?Sized>(
    config: &PairwiseConfig,
    extractor: &E,
) -> AppResult<PairwiseOutcome> {
    let embeddings: Vec<Result<Vec<f64>, ExtractionError>> = config
        .images
        .iter()
        .map(|image| extract_first_embedding(extractor, image, &config.extractor))
        .collect();

    let mut pairs = Vec::new();
    let mut failed = Vec::new();
    let mut logs = vec![format!(
        "Comparing {} image(s) pairwise with {} (threshold {:.4})",
        config.images.len(),
        config.extractor.model_name,
        config.threshold
    )];

    for (i, first) in config.images.iter().enumerate() {
        for (j, second) in config.images.iter().enumerate().skip(i + 1) {
            match (&embeddings[i], &embeddings[j]) {
                (Ok(lhs), Ok(rhs)) => {
                    let result =
                        verify_embeddings(lhs, rhs, config.threshold, &config.extractor)?;
                    debug!(
                        first = %first.display(),
                        second = %second.display(),
                        distance = result.distance,
                        verified = result.verified,
                        "verified pair"
                    );
                    logs.push(format!(
                        "{} vs {} => cosine distance {:.4} ({})",
                        first.display(),
                        second.display(),
                        result.distance,
                        if result.verified { "same person" } else { "different people" }
                    ));
                    pairs.push(PairVerification {
                        first: first.clone(),
                        second: second.clone(),
                        result,
                    });
                }
                (Err(error), _) | (_, Err(error)) => {
                    warn!(
                        first = %first.display(),
                        second = %second.display(),
                        %error,
                        "could not compare pair"
                    );
                    logs.push(format!(
                        "Error comparing {} and {}: {}",
                        first.display(),
                        second.display(),
                        error
                    ));
                    failed.push(FailedPair {
                        first: first.clone(),
                        second: second.clone(),
                        error: error.clone(),
                    });
                }
            }
        }
    }

    Ok(PairwiseOutcome {
        pairs,
        failed,
        logs,
    })
}
