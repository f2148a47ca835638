use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::encrypted::ciphertext::{Ciphertext, EncryptedVector};
use crate::encrypted::context::EncryptionContext;
use crate::encrypted::engine::{encrypt_vector, encrypted_cosine_similarity};
use crate::errors::{AppError, AppResult, NotFoundKind};
use crate::faces::catalog::{is_valid_content_hash, persist_atomically, Catalog};
use crate::faces::matcher::MatchResult;
use crate::faces::store::EmbeddingReader;

pub const ENCRYPTED_INDEX_FILE: &str = "index.json";
pub const CIPHERTEXT_EXTENSION: &str = "ckks";

#[derive(Debug, Clone)]
pub struct EncryptedRecord {
    pub label: String,
    pub image_path: String,
    pub content_hash: String,
    pub vector: EncryptedVector,
}

/// Encrypted counterpart of a [`Catalog`]: every record belongs to one
/// encryption context.
#[derive(Debug, Clone)]
pub struct EncryptedCatalog {
    context_id: Uuid,
    records: Vec<EncryptedRecord>,
}

impl EncryptedCatalog {
    pub fn new(context_id: Uuid) -> Self {
        Self {
            context_id,
            records: Vec::new(),
        }
    }

    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[EncryptedRecord] {
        &self.records
    }

    pub fn push(&mut self, record: EncryptedRecord) -> AppResult<()> {
        if record.vector.context_id() != self.context_id {
            return Err(AppError::ContextMismatch {
                expected: self.context_id,
                found: record.vector.context_id(),
            });
        }
        if let Some(existing) = self
            .records
            .iter()
            .find(|existing| existing.content_hash == record.content_hash)
        {
            return Err(AppError::HashConflict {
                hash: record.content_hash,
                existing_label: existing.label.clone(),
                requested_label: record.label,
            });
        }
        self.records.push(record);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedIndex {
    context_id: Uuid,
    entries: Vec<EncryptedIndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedIndexEntry {
    label: String,
    image_path: String,
    hash: String,
    ciphertext_path: String,
    magnitude: f64,
}

/// Encrypts every catalogued embedding under `context`, keeping catalog order.
pub fn encrypt_catalog<R: EmbeddingReader + ?Sized>(
    catalog: &Catalog,
    reader: &R,
    context: &EncryptionContext,
) -> AppResult<EncryptedCatalog> {
    let mut encrypted = EncryptedCatalog::new(context.id());
    for record in catalog.records() {
        let raw = reader.read_embedding(record)?;
        let vector = encrypt_vector(&raw, context)?;
        encrypted.push(EncryptedRecord {
            label: record.label.clone(),
            image_path: record.image_path.clone(),
            content_hash: record.content_hash.clone(),
            vector,
        })?;
    }
    info!(context = %context.id(), records = encrypted.len(), "encrypted catalog");
    Ok(encrypted)
}

/// Nearest record by encrypted cosine similarity, reported as the distance
/// `1 - similarity`. The first record wins ties. Distances carry CKKS noise.
pub fn find_nearest_encrypted(
    query: &EncryptedVector,
    catalog: &EncryptedCatalog,
    context: &EncryptionContext,
) -> AppResult<MatchResult> {
    if catalog.is_empty() {
        return Err(AppError::EmptyCatalog);
    }
    if catalog.context_id() != context.id() {
        return Err(AppError::ContextMismatch {
            expected: context.id(),
            found: catalog.context_id(),
        });
    }

    let mut best: Option<MatchResult> = None;
    for record in catalog.records() {
        let similarity = encrypted_cosine_similarity(
            &query.ciphertext,
            &record.vector.ciphertext,
            query.magnitude,
            record.vector.magnitude,
            context,
        )?;
        let distance = 1.0 - similarity;
        debug!(label = %record.label, hash = %record.content_hash, distance, "scored encrypted record");

        if best
            .as_ref()
            .map_or(true, |current| distance < current.distance)
        {
            best = Some(MatchResult {
                label: record.label.clone(),
                distance,
                image_path: record.image_path.clone(),
            });
        }
    }

    best.ok_or(AppError::EmptyCatalog)
}

/// Writes one `<hash>.ckks` blob per record, then `index.json`. Each file is
/// replaced atomically; the index is written last so it never names a blob
/// that is missing.
pub fn save_encrypted_catalog(dir: &Path, catalog: &EncryptedCatalog) -> AppResult<()> {
    let mut entries = Vec::with_capacity(catalog.len());
    for record in catalog.records() {
        let file_name = format!("{}.{CIPHERTEXT_EXTENSION}", record.content_hash);
        let path = dir.join(&file_name);
        let bytes = record.vector.ciphertext.to_bytes()?;
        persist_atomically(&path, &bytes)
            .map_err(|source| AppError::ArtifactWrite { path, source })?;

        entries.push(EncryptedIndexEntry {
            label: record.label.clone(),
            image_path: record.image_path.clone(),
            hash: record.content_hash.clone(),
            ciphertext_path: file_name,
            magnitude: record.vector.magnitude,
        });
    }

    let index = EncryptedIndex {
        context_id: catalog.context_id(),
        entries,
    };
    let mut serialized = serde_json::to_vec_pretty(&index)?;
    serialized.push(b'\n');
    let index_path = dir.join(ENCRYPTED_INDEX_FILE);
    persist_atomically(&index_path, &serialized).map_err(|source| AppError::CatalogWrite {
        path: index_path.clone(),
        source,
    })?;

    info!(dir = %dir.display(), records = catalog.len(), "encrypted catalog written");
    Ok(())
}

pub fn load_encrypted_catalog(dir: &Path) -> AppResult<EncryptedCatalog> {
    let index_path = dir.join(ENCRYPTED_INDEX_FILE);
    let data = fs::read(&index_path)
        .map_err(|source| AppError::from_read(NotFoundKind::Catalog, index_path.clone(), source))?;
    let index: EncryptedIndex = serde_json::from_slice(&data).map_err(|err| AppError::Format {
        path: index_path.clone(),
        message: format!("invalid encrypted index: {err}"),
    })?;

    let mut catalog = EncryptedCatalog::new(index.context_id);
    for (idx, entry) in index.entries.into_iter().enumerate() {
        let format_error = |message: String| AppError::Format {
            path: index_path.clone(),
            message: format!("entry {idx}: {message}"),
        };
        if !is_valid_content_hash(&entry.hash) {
            return Err(format_error(format!("invalid hash '{}'", entry.hash)));
        }
        if !entry.magnitude.is_finite() || entry.magnitude <= 0.0 {
            return Err(format_error("magnitude must be positive".into()));
        }
        let path = resolve_ciphertext_path(dir, &entry.ciphertext_path)
            .ok_or_else(|| format_error(format!("unsafe ciphertext path '{}'", entry.ciphertext_path)))?;

        let bytes = fs::read(&path)
            .map_err(|source| AppError::from_read(NotFoundKind::Ciphertext, path.clone(), source))?;
        let ciphertext = Ciphertext::from_bytes(&bytes).map_err(|err| AppError::Format {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if ciphertext.context_id() != catalog.context_id() {
            return Err(AppError::Format {
                path,
                message: format!(
                    "ciphertext belongs to context {}, index names {}",
                    ciphertext.context_id(),
                    catalog.context_id()
                ),
            });
        }

        catalog.push(EncryptedRecord {
            label: entry.label,
            image_path: entry.image_path,
            content_hash: entry.hash,
            vector: EncryptedVector {
                ciphertext,
                magnitude: entry.magnitude,
            },
        })?;
    }

    debug!(dir = %dir.display(), records = catalog.len(), "loaded encrypted catalog");
    Ok(catalog)
}

/// Ciphertext paths are relative to the catalog directory and may not
/// climb out of it.
fn resolve_ciphertext_path(dir: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let contained = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    (contained && !relative.as_os_str().is_empty()).then(|| dir.join(relative))
}
