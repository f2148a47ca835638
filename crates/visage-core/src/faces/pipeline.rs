use std::path::PathBuf;

use visage_config::ResolvedConfig;

use crate::errors::AppResult;
use crate::faces::catalog::load_catalog;
use crate::faces::centroid::{build_centroids, find_nearest_centroid};
use crate::faces::extractor::{extract_first_embedding, EmbeddingExtractor, ExtractorConfig};
use crate::faces::matcher::{find_nearest, MatchResult};
use crate::faces::store::{EmbeddingStore, IngestReport, LabeledImage, NpyEmbeddingReader, StoreConfig};

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub store: StoreConfig,
    pub images: Vec<LabeledImage>,
}

#[derive(Debug)]
pub struct IngestionOutcome {
    pub report: IngestReport,
    pub catalog_len: usize,
    pub logs: Vec<String>,
}

pub fn run_ingestion<E: EmbeddingExtractor + ?Sized>(
    config: &IngestConfig,
    extractor: &E,
) -> AppResult<IngestionOutcome> {
    let mut store = EmbeddingStore::open(config.store.clone())?;
    let mut logs = vec![format!(
        "Opened catalog {} ({} record(s))",
        config.store.catalog_path.display(),
        store.catalog().len()
    )];

    let report = store.ingest_batch(&config.images, extractor)?;
    for record in &report.added {
        logs.push(format!(
            "Added {} as '{}' ({})",
            record.image_path, record.label, record.content_hash
        ));
    }
    for record in &report.duplicates {
        logs.push(format!("Skipped duplicate {}", record.image_path));
    }
    for record in &report.restored {
        logs.push(format!("Restored embedding for {}", record.image_path));
    }
    for record in &report.relabeled {
        logs.push(format!(
            "Relabeled {} as '{}'",
            record.content_hash, record.label
        ));
    }
    for skipped in &report.skipped {
        logs.push(format!(
            "Skipped {}: {}",
            skipped.path.display(),
            skipped.error
        ));
    }

    Ok(IngestionOutcome {
        catalog_len: store.catalog().len(),
        report,
        logs,
    })
}

#[derive(Debug, Clone)]
pub struct MatchConfig {
    pub query_image: PathBuf,
    pub catalog_path: PathBuf,
    pub extractor: ExtractorConfig,
}

impl MatchConfig {
    pub fn from_resolved(query_image: impl Into<PathBuf>, config: &ResolvedConfig) -> Self {
        Self {
            query_image: query_image.into(),
            catalog_path: config.catalog_path.clone(),
            extractor: ExtractorConfig::from(config),
        }
    }
}

#[derive(Debug)]
pub struct MatchOutcome {
    pub result: MatchResult,
    pub logs: Vec<String>,
}

pub fn run_nearest_match<E: EmbeddingExtractor + ?Sized>(
    config: &MatchConfig,
    extractor: &E,
) -> AppResult<MatchOutcome> {
    let query = extract_first_embedding(extractor, &config.query_image, &config.extractor)?;
    let catalog = load_catalog(&config.catalog_path)?;
    let result = find_nearest(&query, &catalog, &NpyEmbeddingReader)?;

    let logs = vec![
        format!(
            "Compared {} against {} record(s)",
            config.query_image.display(),
            catalog.len()
        ),
        format!(
            "Nearest: '{}' ({}) at cosine distance {:.4}",
            result.label, result.image_path, result.distance
        ),
    ];
    Ok(MatchOutcome { result, logs })
}

pub fn run_centroid_match<E: EmbeddingExtractor + ?Sized>(
    config: &MatchConfig,
    extractor: &E,
) -> AppResult<MatchOutcome> {
    let query = extract_first_embedding(extractor, &config.query_image, &config.extractor)?;
    let catalog = load_catalog(&config.catalog_path)?;
    let centroids = build_centroids(&catalog, &NpyEmbeddingReader)?;
    let result = find_nearest_centroid(&query, &centroids)?;

    let logs = vec![
        format!(
            "Compared {} against {} centroid(s) from {} record(s)",
            config.query_image.display(),
            centroids.len(),
            catalog.len()
        ),
        format!(
            "Nearest centroid: '{}' at cosine distance {:.4}",
            result.label, result.distance
        ),
    ];
    Ok(MatchOutcome { result, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{AppError, ExtractionError, NotFoundKind};
    use crate::faces::catalog::CatalogParams;
    use crate::faces::extractor::PrecomputedExtractor;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use visage_config::ConflictPolicy;

    fn store_config(root: &Path) -> StoreConfig {
        StoreConfig {
            catalog_path: root.join("db/metadata.json"),
            embeddings_dir: root.join("db/embeddings"),
            params: CatalogParams {
                model_name: "ArcFace".into(),
                detector_backend: "retinaface".into(),
            },
            enforce_detection: true,
            conflict_policy: ConflictPolicy::Reject,
        }
    }

    fn image(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    fn seeded(root: &Path) -> (StoreConfig, PrecomputedExtractor) {
        let alice = image(root, "alice.png");
        let bob = image(root, "bob.png");
        let query = image(root, "query.png");
        let mut extractor = PrecomputedExtractor::new();
        extractor.insert_embedding(&alice, vec![1.0, 0.0]);
        extractor.insert_embedding(&bob, vec![0.0, 1.0]);
        extractor.insert_embedding(&query, vec![0.9, 0.1]);

        let config = IngestConfig {
            store: store_config(root),
            images: vec![
                LabeledImage::new(&alice, "Alice"),
                LabeledImage::new(&bob, "Bob"),
            ],
        };
        let outcome = run_ingestion(&config, &extractor).unwrap();
        assert_eq!(outcome.catalog_len, 2);
        (config.store, extractor)
    }

    #[test]
    fn ingestion_logs_each_item() {
        let tmp = TempDir::new().unwrap();
        let blank = image(tmp.path(), "blank.png");
        let face = image(tmp.path(), "face.png");
        let mut extractor = PrecomputedExtractor::new();
        extractor.insert(&blank, vec![]);
        extractor.insert_embedding(&face, vec![0.3, 0.4]);

        let config = IngestConfig {
            store: store_config(tmp.path()),
            images: vec![
                LabeledImage::new(&blank, "Carol"),
                LabeledImage::new(&face, "Carol"),
            ],
        };
        let outcome = run_ingestion(&config, &extractor).unwrap();
        assert_eq!(outcome.catalog_len, 1);
        assert_eq!(outcome.report.skipped.len(), 1);
        assert!(outcome.logs.iter().any(|line| line.starts_with("Skipped")));
        assert!(outcome.logs.iter().any(|line| line.starts_with("Added")));
    }

    #[test]
    fn nearest_and_centroid_matches_agree_for_single_member_labels() {
        let tmp = TempDir::new().unwrap();
        let (store, extractor) = seeded(tmp.path());
        let config = MatchConfig {
            query_image: tmp.path().join("query.png"),
            catalog_path: store.catalog_path.clone(),
            extractor: store.extractor_config(),
        };

        let nearest = run_nearest_match(&config, &extractor).unwrap();
        let centroid = run_centroid_match(&config, &extractor).unwrap();
        assert_eq!(nearest.result.label, "Alice");
        assert_eq!(centroid.result.label, "Alice");
        assert!((nearest.result.distance - centroid.result.distance).abs() < 1e-9);
        assert_eq!(nearest.logs.len(), 2);
    }

    #[test]
    fn query_without_face_is_an_extraction_error() {
        let tmp = TempDir::new().unwrap();
        let (store, mut extractor) = seeded(tmp.path());
        let empty = image(tmp.path(), "empty.png");
        extractor.insert(&empty, vec![]);

        let config = MatchConfig {
            query_image: empty,
            extractor: store.extractor_config(),
            catalog_path: store.catalog_path,
        };
        match run_nearest_match(&config, &extractor).unwrap_err() {
            AppError::Extraction(ExtractionError::NoFace { .. }) => {}
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn missing_catalog_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let query = image(tmp.path(), "query.png");
        let mut extractor = PrecomputedExtractor::new();
        extractor.insert_embedding(&query, vec![1.0, 0.0]);

        let config = MatchConfig {
            query_image: query,
            catalog_path: tmp.path().join("absent.json"),
            extractor: ExtractorConfig::default(),
        };
        assert!(matches!(
            run_centroid_match(&config, &extractor).unwrap_err(),
            AppError::NotFound {
                kind: NotFoundKind::Catalog,
                ..
            }
        ));
    }

    #[test]
    fn match_config_follows_resolved_config() {
        let resolved = ResolvedConfig::default();
        let config = MatchConfig::from_resolved("q.png", &resolved);
        assert_eq!(config.catalog_path, resolved.catalog_path);
        assert_eq!(config.extractor.model_name, "ArcFace");
    }
}
