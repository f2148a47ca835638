use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use ndarray::{Array1, ArrayView1};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use visage_config::{ConflictPolicy, ResolvedConfig};

use crate::errors::{AppError, AppResult, ExtractionError, NotFoundKind};
use crate::faces::catalog::{
    append_catalog, load_catalog, persist_atomically, save_catalog, Catalog, CatalogParams,
    EmbeddingRecord,
};
use crate::faces::extractor::{extract_first_embedding, EmbeddingExtractor, ExtractorConfig};
use crate::vector::magnitude;

const EMBEDDING_EXTENSION: &str = "npy";

/// Source of the stored vector behind a catalog record.
pub trait EmbeddingReader {
    fn read_embedding(&self, record: &EmbeddingRecord) -> AppResult<Vec<f64>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NpyEmbeddingReader;

impl EmbeddingReader for NpyEmbeddingReader {
    fn read_embedding(&self, record: &EmbeddingRecord) -> AppResult<Vec<f64>> {
        read_embedding_file(Path::new(&record.embedding_path))
    }
}

pub fn read_embedding_file(path: &Path) -> AppResult<Vec<f64>> {
    let file = File::open(path).map_err(|source| {
        AppError::from_read(NotFoundKind::Embedding, path.to_path_buf(), source)
    })?;
    let array = Array1::<f64>::read_npy(BufReader::new(file)).map_err(|err| AppError::Format {
        path: path.to_path_buf(),
        message: format!("invalid embedding file: {err}"),
    })?;
    if array.is_empty() {
        return Err(AppError::Format {
            path: path.to_path_buf(),
            message: "embedding file holds an empty vector".into(),
        });
    }
    Ok(array.to_vec())
}

pub fn encode_embedding(values: &[f64]) -> AppResult<Vec<u8>> {
    let mut buffer = Vec::new();
    ArrayView1::from(values)
        .write_npy(&mut buffer)
        .map_err(|err| AppError::InvalidEmbedding(format!("failed to encode as npy: {err}")))?;
    Ok(buffer)
}

/// SHA-256 of the raw image bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn validate_label(label: &str) -> AppResult<()> {
    if label.trim().is_empty() {
        return Err(AppError::InvalidLabel {
            label: label.to_string(),
            message: "label cannot be empty".into(),
        });
    }
    if label.trim() != label {
        return Err(AppError::InvalidLabel {
            label: label.to_string(),
            message: "label cannot start or end with whitespace".into(),
        });
    }
    if label
        .chars()
        .any(|ch| ch == '/' || ch == '\\' || ch.is_control())
    {
        return Err(AppError::InvalidLabel {
            label: label.to_string(),
            message: "path separators and control characters are not allowed".into(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub catalog_path: PathBuf,
    pub embeddings_dir: PathBuf,
    pub params: CatalogParams,
    pub enforce_detection: bool,
    pub conflict_policy: ConflictPolicy,
}

impl From<&ResolvedConfig> for StoreConfig {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            catalog_path: config.catalog_path.clone(),
            embeddings_dir: config.embeddings_dir.clone(),
            params: CatalogParams {
                model_name: config.model_name.clone(),
                detector_backend: config.detector_backend.clone(),
            },
            enforce_detection: config.enforce_detection,
            conflict_policy: config.conflict_policy,
        }
    }
}

impl StoreConfig {
    pub fn extractor_config(&self) -> ExtractorConfig {
        ExtractorConfig {
            model_name: self.params.model_name.clone(),
            detector_backend: self.params.detector_backend.clone(),
            enforce_detection: self.enforce_detection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Added(EmbeddingRecord),
    /// The image bytes were already catalogued under the same label.
    Duplicate(EmbeddingRecord),
    /// Already catalogued, but the embedding file had gone missing and was
    /// extracted again.
    Restored(EmbeddingRecord),
    Relabeled {
        record: EmbeddingRecord,
        previous_label: String,
    },
}

impl IngestOutcome {
    pub fn record(&self) -> &EmbeddingRecord {
        match self {
            IngestOutcome::Added(record)
            | IngestOutcome::Duplicate(record)
            | IngestOutcome::Restored(record) => record,
            IngestOutcome::Relabeled { record, .. } => record,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, IngestOutcome::Added(_))
    }
}

#[derive(Debug, Clone)]
pub struct LabeledImage {
    pub path: PathBuf,
    pub label: String,
}

impl LabeledImage {
    pub fn new(path: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug)]
pub struct SkippedImage {
    pub path: PathBuf,
    pub error: ExtractionError,
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub added: Vec<EmbeddingRecord>,
    pub duplicates: Vec<EmbeddingRecord>,
    pub restored: Vec<EmbeddingRecord>,
    pub relabeled: Vec<EmbeddingRecord>,
    pub skipped: Vec<SkippedImage>,
}

/// Content-addressed embedding files plus the catalog that indexes them.
///
/// The store assumes a single writer; concurrent readers only ever observe
/// whole catalog files because every write is an atomic replace.
#[derive(Debug)]
pub struct EmbeddingStore {
    config: StoreConfig,
    catalog: Catalog,
    dimension: Option<usize>,
}

impl EmbeddingStore {
    /// Loads the catalog at `config.catalog_path`, or starts an empty one when
    /// the file does not exist yet.
    pub fn open(config: StoreConfig) -> AppResult<Self> {
        let catalog = match load_catalog(&config.catalog_path) {
            Ok(catalog) => {
                if catalog.params != config.params {
                    return Err(AppError::Format {
                        path: config.catalog_path.clone(),
                        message: format!(
                            "catalog was built with model {} / detector {}, not {} / {}",
                            catalog.params.model_name,
                            catalog.params.detector_backend,
                            config.params.model_name,
                            config.params.detector_backend
                        ),
                    });
                }
                catalog
            }
            Err(AppError::NotFound {
                kind: NotFoundKind::Catalog,
                ..
            }) => {
                debug!(path = %config.catalog_path.display(), "starting empty catalog");
                Catalog::new(config.params.clone())
            }
            Err(err) => return Err(err),
        };

        Ok(Self {
            config,
            catalog,
            dimension: None,
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn into_catalog(self) -> Catalog {
        self.catalog
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn embedding_path(&self, content_hash: &str) -> PathBuf {
        self.config
            .embeddings_dir
            .join(format!("{content_hash}.{EMBEDDING_EXTENSION}"))
    }

    pub fn ingest<E: EmbeddingExtractor + ?Sized>(
        &mut self,
        image: &Path,
        label: &str,
        extractor: &E,
    ) -> AppResult<IngestOutcome> {
        validate_label(label)?;

        let bytes = fs::read(image)
            .map_err(|source| AppError::from_read(NotFoundKind::Image, image.to_path_buf(), source))?;
        let hash = content_hash(&bytes);

        if let Some(existing) = self.catalog.find_by_hash(&hash) {
            if existing.label != label {
                return self.resolve_conflict(&hash, label);
            }
            let existing = existing.clone();
            if Path::new(&existing.embedding_path).exists() {
                debug!(image = %image.display(), hash = %hash, "image already catalogued");
                return Ok(IngestOutcome::Duplicate(existing));
            }
            return self.restore_embedding(image, existing, extractor);
        }

        let embedding =
            extract_first_embedding(extractor, image, &self.config.extractor_config())?;
        self.check_dimension(embedding.len())?;

        let embedding_path = self.embedding_path(&hash);
        write_embedding_file(&embedding_path, &embedding)?;

        let record = EmbeddingRecord {
            label: label.to_string(),
            image_path: image.display().to_string(),
            content_hash: hash,
            embedding_path: embedding_path.display().to_string(),
            magnitude: magnitude(&embedding),
        };
        self.append_catalog(record.clone())?;
        self.dimension.get_or_insert(embedding.len());

        info!(
            image = %image.display(),
            label = %record.label,
            hash = %record.content_hash,
            "ingested embedding"
        );
        Ok(IngestOutcome::Added(record))
    }

    /// Ingests every image, skipping (and reporting) the ones the extractor
    /// fails on. Any other failure aborts the batch.
    pub fn ingest_batch<E: EmbeddingExtractor + ?Sized>(
        &mut self,
        images: &[LabeledImage],
        extractor: &E,
    ) -> AppResult<IngestReport> {
        let mut report = IngestReport::default();
        for item in images {
            match self.ingest(&item.path, &item.label, extractor) {
                Ok(IngestOutcome::Added(record)) => report.added.push(record),
                Ok(IngestOutcome::Duplicate(record)) => report.duplicates.push(record),
                Ok(IngestOutcome::Restored(record)) => report.restored.push(record),
                Ok(IngestOutcome::Relabeled { record, .. }) => report.relabeled.push(record),
                Err(AppError::Extraction(error)) => {
                    warn!(image = %item.path.display(), %error, "skipping image");
                    report.skipped.push(SkippedImage {
                        path: item.path.clone(),
                        error,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Ok(report)
    }

    /// Appends to the catalog and persists it; the in-memory catalog is left
    /// unchanged if the write fails.
    pub fn append_catalog(&mut self, record: EmbeddingRecord) -> AppResult<()> {
        append_catalog(record, &mut self.catalog)?;
        if let Err(err) = self.persist() {
            self.catalog.images.pop();
            return Err(err);
        }
        Ok(())
    }

    pub fn persist(&self) -> AppResult<()> {
        save_catalog(&self.config.catalog_path, &self.catalog)
    }

    /// Reads a record's vector and checks it against the catalog dimension.
    pub fn load_embedding(&mut self, record: &EmbeddingRecord) -> AppResult<Vec<f64>> {
        let values = NpyEmbeddingReader.read_embedding(record)?;
        self.check_dimension(values.len())?;
        Ok(values)
    }

    /// Re-extracts the embedding of a catalogued image whose `.npy` file is
    /// gone and writes it back under the recorded path.
    fn restore_embedding<E: EmbeddingExtractor + ?Sized>(
        &mut self,
        image: &Path,
        record: EmbeddingRecord,
        extractor: &E,
    ) -> AppResult<IngestOutcome> {
        let embedding =
            extract_first_embedding(extractor, image, &self.config.extractor_config())?;
        let first_is_missing = self
            .catalog
            .images
            .first()
            .is_some_and(|first| first.content_hash == record.content_hash);
        if first_is_missing && self.dimension.is_none() {
            self.dimension = Some(embedding.len());
        } else {
            self.check_dimension(embedding.len())?;
        }

        write_embedding_file(Path::new(&record.embedding_path), &embedding)?;
        warn!(
            image = %image.display(),
            hash = %record.content_hash,
            "restored missing embedding file"
        );
        Ok(IngestOutcome::Restored(record))
    }

    fn check_dimension(&mut self, found: usize) -> AppResult<()> {
        match self.expected_dimension()? {
            Some(expected) if expected != found => {
                Err(AppError::DimensionMismatch { expected, found })
            }
            _ => Ok(()),
        }
    }

    fn resolve_conflict(&mut self, hash: &str, label: &str) -> AppResult<IngestOutcome> {
        let policy = self.config.conflict_policy;
        let record = self
            .catalog
            .find_by_hash_mut(hash)
            .ok_or_else(|| AppError::InvalidEmbedding(format!("no record for hash {hash}")))?;

        match policy {
            ConflictPolicy::Reject => Err(AppError::HashConflict {
                hash: hash.to_string(),
                existing_label: record.label.clone(),
                requested_label: label.to_string(),
            }),
            ConflictPolicy::Relabel => {
                let previous_label = std::mem::replace(&mut record.label, label.to_string());
                let updated = record.clone();
                if let Err(err) = self.persist() {
                    if let Some(record) = self.catalog.find_by_hash_mut(hash) {
                        record.label = previous_label;
                    }
                    return Err(err);
                }
                info!(hash = %hash, from = %previous_label, to = %label, "relabeled image");
                Ok(IngestOutcome::Relabeled {
                    record: updated,
                    previous_label,
                })
            }
        }
    }

    fn expected_dimension(&mut self) -> AppResult<Option<usize>> {
        if self.dimension.is_none() {
            if let Some(first) = self.catalog.images.first() {
                self.dimension = Some(NpyEmbeddingReader.read_embedding(first)?.len());
            }
        }
        Ok(self.dimension)
    }
}

impl EmbeddingReader for EmbeddingStore {
    fn read_embedding(&self, record: &EmbeddingRecord) -> AppResult<Vec<f64>> {
        NpyEmbeddingReader.read_embedding(record)
    }
}

/// Writes an embedding under its content-addressed name. An identical file
/// is reused as is; an orphaned file with different bytes (no catalog record
/// points at it yet) is atomically replaced.
pub fn write_embedding_file(path: &Path, values: &[f64]) -> AppResult<()> {
    let encoded = encode_embedding(values)?;
    match fs::read(path) {
        Ok(existing) if existing == encoded => {
            debug!(path = %path.display(), "embedding file already present");
            return Ok(());
        }
        Ok(_) => warn!(path = %path.display(), "replacing orphaned embedding file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(AppError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    persist_atomically(path, &encoded).map_err(|source| AppError::ArtifactWrite {
        path: path.to_path_buf(),
        source,
    })
}
