use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::errors::{AppError, AppResult, NotFoundKind};

pub const CONTENT_HASH_LEN: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogParams {
    pub model_name: String,
    pub detector_backend: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub label: String,
    pub image_path: String,
    #[serde(rename = "hash")]
    pub content_hash: String,
    pub embedding_path: String,
    pub magnitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    pub params: CatalogParams,
    pub images: Vec<EmbeddingRecord>,
}

impl Catalog {
    pub fn new(params: CatalogParams) -> Self {
        Self {
            params,
            images: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn records(&self) -> &[EmbeddingRecord] {
        &self.images
    }

    pub fn find_by_hash(&self, content_hash: &str) -> Option<&EmbeddingRecord> {
        self.images
            .iter()
            .find(|record| record.content_hash == content_hash)
    }

    pub(crate) fn find_by_hash_mut(&mut self, content_hash: &str) -> Option<&mut EmbeddingRecord> {
        self.images
            .iter_mut()
            .find(|record| record.content_hash == content_hash)
    }

    /// Labels in order of first appearance.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = Vec::new();
        for record in &self.images {
            if !labels.contains(&record.label.as_str()) {
                labels.push(&record.label);
            }
        }
        labels
    }
}

/// Appends `record` to the in-memory catalog. Persisting is a separate,
/// atomic step (see [`save_catalog`]).
pub fn append_catalog(record: EmbeddingRecord, catalog: &mut Catalog) -> AppResult<()> {
    if let Some(existing) = catalog.find_by_hash(&record.content_hash) {
        return Err(AppError::HashConflict {
            hash: record.content_hash.clone(),
            existing_label: existing.label.clone(),
            requested_label: record.label,
        });
    }
    catalog.images.push(record);
    Ok(())
}

pub fn load_catalog(path: &Path) -> AppResult<Catalog> {
    let data = fs::read(path)
        .map_err(|source| AppError::from_read(NotFoundKind::Catalog, path.to_path_buf(), source))?;

    let catalog: Catalog = serde_json::from_slice(&data).map_err(|err| AppError::Format {
        path: path.to_path_buf(),
        message: format!("invalid catalog contents: {err}"),
    })?;

    for (idx, record) in catalog.images.iter().enumerate() {
        if !is_valid_content_hash(&record.content_hash) {
            return Err(AppError::Format {
                path: path.to_path_buf(),
                message: format!(
                    "record {idx} has hash '{}', expected {CONTENT_HASH_LEN} lowercase hex characters",
                    record.content_hash
                ),
            });
        }
        if !record.magnitude.is_finite() {
            return Err(AppError::Format {
                path: path.to_path_buf(),
                message: format!("record {idx} has a non-finite magnitude"),
            });
        }
    }

    debug!(path = %path.display(), records = catalog.len(), "loaded catalog");
    Ok(catalog)
}

/// Replaces the catalog file atomically: readers see either the previous
/// catalog or the new one, never a partial write.
pub fn save_catalog(path: &Path, catalog: &Catalog) -> AppResult<()> {
    let mut serialized = serde_json::to_vec_pretty(catalog)?;
    serialized.push(b'\n');
    persist_atomically(path, &serialized).map_err(|source| AppError::CatalogWrite {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), records = catalog.len(), "catalog written");
    Ok(())
}

pub fn is_valid_content_hash(value: &str) -> bool {
    value.len() == CONTENT_HASH_LEN
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

pub(crate) fn persist_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let file = tmp.as_file_mut();
        {
            let mut writer = BufWriter::new(&mut *file);
            writer.write_all(bytes)?;
            writer.flush()?;
        }
        file.sync_all()?;
    }

    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
