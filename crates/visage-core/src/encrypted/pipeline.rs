use std::path::PathBuf;

use uuid::Uuid;
use visage_config::ResolvedConfig;

use crate::encrypted::catalog::{load_encrypted_catalog, save_encrypted_catalog};
use crate::encrypted::context::EncryptionContext;
use crate::encrypted::engine::EncryptedMatchEngine;
use crate::encrypted::params::EncryptionParams;
use crate::errors::AppResult;
use crate::faces::catalog::load_catalog;
use crate::faces::extractor::{extract_first_embedding, EmbeddingExtractor, ExtractorConfig};
use crate::faces::pipeline::MatchOutcome;
use crate::faces::store::NpyEmbeddingReader;

#[derive(Debug, Clone)]
pub struct CatalogEncryptionConfig {
    pub catalog_path: PathBuf,
    pub encrypted_dir: PathBuf,
    pub context_path: PathBuf,
    pub params: EncryptionParams,
    /// Store the secret key next to the public keys. Leave unset when the
    /// context file is handed to the party that only computes similarities.
    pub include_secret: bool,
}

impl CatalogEncryptionConfig {
    pub fn from_resolved(
        encrypted_dir: impl Into<PathBuf>,
        context_path: impl Into<PathBuf>,
        config: &ResolvedConfig,
    ) -> Self {
        Self {
            catalog_path: config.catalog_path.clone(),
            encrypted_dir: encrypted_dir.into(),
            context_path: context_path.into(),
            params: EncryptionParams::from(&config.encryption),
            include_secret: true,
        }
    }
}

#[derive(Debug)]
pub struct CatalogEncryptionOutcome {
    pub context_id: Uuid,
    pub records: usize,
    pub logs: Vec<String>,
}

/// Builds a fresh context, encrypts every catalogued embedding and writes both
/// the context and the encrypted catalog.
///
/// The context goes to disk first. A failed run therefore never leaves
/// ciphertexts bound to keys that were not saved, and the previous encrypted
/// catalog stays usable with the previous context.
pub fn run_catalog_encryption(
    config: &CatalogEncryptionConfig,
) -> AppResult<CatalogEncryptionOutcome> {
    let catalog = load_catalog(&config.catalog_path)?;
    let mut engine = EncryptedMatchEngine::new();
    let context_id = engine.create_context(config.params.clone())?.id();
    let mut logs = vec![format!(
        "Created encryption context {context_id} (degree {}, modulus {:?})",
        config.params.poly_modulus_degree, config.params.coeff_mod_bit_sizes
    )];

    let encrypted = engine.encrypt_catalog(&catalog, &NpyEmbeddingReader)?;

    engine
        .context()?
        .save(&config.context_path, config.include_secret)?;
    logs.push(format!(
        "Wrote context to {}{}",
        config.context_path.display(),
        if config.include_secret {
            " (with secret key)"
        } else {
            ""
        }
    ));

    save_encrypted_catalog(&config.encrypted_dir, &encrypted)?;
    logs.push(format!(
        "Encrypted {} record(s) into {}",
        encrypted.len(),
        config.encrypted_dir.display()
    ));

    Ok(CatalogEncryptionOutcome {
        context_id,
        records: encrypted.len(),
        logs,
    })
}

#[derive(Debug, Clone)]
pub struct EncryptedMatchConfig {
    pub query_image: PathBuf,
    pub encrypted_dir: PathBuf,
    pub context_path: PathBuf,
    pub extractor: ExtractorConfig,
}

/// Matches a query image against a saved encrypted catalog. The context file
/// must carry the secret key.
pub fn run_encrypted_match<E: EmbeddingExtractor + ?Sized>(
    config: &EncryptedMatchConfig,
    extractor: &E,
) -> AppResult<MatchOutcome> {
    let mut engine = EncryptedMatchEngine::with_context(EncryptionContext::load(&config.context_path)?);
    let catalog = load_encrypted_catalog(&config.encrypted_dir)?;
    engine.register_encrypted(&catalog)?;

    let query = extract_first_embedding(extractor, &config.query_image, &config.extractor)?;
    let encrypted_query = engine.encrypt_vector(&query)?;
    let result = engine.find_nearest(&encrypted_query, &catalog)?;

    let logs = vec![
        format!(
            "Compared {} against {} encrypted record(s)",
            config.query_image.display(),
            catalog.len()
        ),
        format!(
            "Nearest: '{}' ({}) at approximate cosine distance {:.4}",
            result.label, result.image_path, result.distance
        ),
    ];
    Ok(MatchOutcome { result, logs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypted::context::tests::test_params;
    use crate::errors::AppError;
    use crate::faces::catalog::CatalogParams;
    use crate::faces::extractor::PrecomputedExtractor;
    use crate::faces::pipeline::{run_ingestion, IngestConfig};
    use crate::faces::store::{LabeledImage, StoreConfig};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;
    use visage_config::ConflictPolicy;

    fn image(root: &Path, name: &str) -> PathBuf {
        let path = root.join(name);
        fs::write(&path, name.as_bytes()).unwrap();
        path
    }

    fn seeded(root: &Path) -> (PathBuf, PrecomputedExtractor) {
        let alice = image(root, "alice.png");
        let bob = image(root, "bob.png");
        let query = image(root, "query.png");
        let mut extractor = PrecomputedExtractor::new();
        extractor.insert_embedding(&alice, vec![1.0, 0.0]);
        extractor.insert_embedding(&bob, vec![0.0, 1.0]);
        extractor.insert_embedding(&query, vec![0.2, 0.8]);

        let store = StoreConfig {
            catalog_path: root.join("db/metadata.json"),
            embeddings_dir: root.join("db/embeddings"),
            params: CatalogParams {
                model_name: "ArcFace".into(),
                detector_backend: "retinaface".into(),
            },
            enforce_detection: true,
            conflict_policy: ConflictPolicy::Reject,
        };
        let catalog_path = store.catalog_path.clone();
        run_ingestion(
            &IngestConfig {
                store,
                images: vec![
                    LabeledImage::new(&alice, "Alice"),
                    LabeledImage::new(&bob, "Bob"),
                ],
            },
            &extractor,
        )
        .unwrap();
        (catalog_path, extractor)
    }

    fn encryption_config(root: &Path, catalog_path: PathBuf, include_secret: bool) -> CatalogEncryptionConfig {
        CatalogEncryptionConfig {
            catalog_path,
            encrypted_dir: root.join("encrypted"),
            context_path: root.join("keys/context.bin"),
            params: test_params(),
            include_secret,
        }
    }

    fn match_config(root: &Path) -> EncryptedMatchConfig {
        EncryptedMatchConfig {
            query_image: root.join("query.png"),
            encrypted_dir: root.join("encrypted"),
            context_path: root.join("keys/context.bin"),
            extractor: ExtractorConfig::default(),
        }
    }

    #[test]
    fn encrypted_pipeline_finds_the_closest_label() {
        let tmp = TempDir::new().unwrap();
        let (catalog_path, extractor) = seeded(tmp.path());

        let outcome =
            run_catalog_encryption(&encryption_config(tmp.path(), catalog_path, true)).unwrap();
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.logs.len(), 3);

        let matched = run_encrypted_match(&match_config(tmp.path()), &extractor).unwrap();
        assert_eq!(matched.result.label, "Bob");
        let expected = 1.0 - 0.8 / 0.68f64.sqrt();
        assert!((matched.result.distance - expected).abs() < 1e-4);
    }

    #[test]
    fn public_context_cannot_finish_a_match() {
        let tmp = TempDir::new().unwrap();
        let (catalog_path, extractor) = seeded(tmp.path());
        run_catalog_encryption(&encryption_config(tmp.path(), catalog_path, false)).unwrap();

        assert!(matches!(
            run_encrypted_match(&match_config(tmp.path()), &extractor).unwrap_err(),
            AppError::DecryptionUnauthorized
        ));
    }

    #[test]
    fn failed_context_write_keeps_previous_encrypted_catalog() {
        let tmp = TempDir::new().unwrap();
        let (catalog_path, extractor) = seeded(tmp.path());
        let first =
            run_catalog_encryption(&encryption_config(tmp.path(), catalog_path.clone(), true))
                .unwrap();

        let blocker = tmp.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let mut blocked = encryption_config(tmp.path(), catalog_path, true);
        blocked.context_path = blocker.join("context.bin");
        match run_catalog_encryption(&blocked).unwrap_err() {
            AppError::ArtifactWrite { path, .. } => assert_eq!(path, blocked.context_path),
            other => panic!("unexpected error: {:?}", other),
        }

        let saved = load_encrypted_catalog(&tmp.path().join("encrypted")).unwrap();
        assert_eq!(saved.context_id(), first.context_id);
        let matched = run_encrypted_match(&match_config(tmp.path()), &extractor).unwrap();
        assert_eq!(matched.result.label, "Bob");
    }

    #[test]
    fn resolved_config_supplies_catalog_and_parameters() {
        let resolved = ResolvedConfig::default();
        let config = CatalogEncryptionConfig::from_resolved("enc", "ctx.bin", &resolved);
        assert_eq!(config.catalog_path, resolved.catalog_path);
        assert_eq!(config.params.poly_modulus_degree, 8192);
        assert!(config.include_secret);
    }
}
