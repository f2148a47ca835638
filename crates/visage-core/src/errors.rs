use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;
use visage_config::ConfigError;

/// Failures reported by an embedding extractor backend.
#[derive(Debug, Clone, Error)]
pub enum ExtractionError {
    #[error("no face detected in {path}")]
    NoFace { path: PathBuf },

    #[error("failed to decode image {path}: {message}")]
    UnreadableImage { path: PathBuf, message: String },

    #[error("extractor backend {backend} failed on {path}: {message}")]
    Backend {
        backend: String,
        path: PathBuf,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundKind {
    Catalog,
    Embedding,
    Image,
    Ciphertext,
    Context,
}

impl fmt::Display for NotFoundKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotFoundKind::Catalog => "catalog",
            NotFoundKind::Embedding => "embedding file",
            NotFoundKind::Image => "image",
            NotFoundKind::Ciphertext => "ciphertext file",
            NotFoundKind::Context => "encryption context",
        };
        f.write_str(name)
    }
}

/// Flat discriminant of [`AppError`] for callers that only branch on the
/// failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Extraction,
    Format,
    NotFound,
    DivideByZero,
    DimensionMismatch,
    EmptyCatalog,
    EmptyCentroidSet,
    ContextMismatch,
    DecryptionUnauthorized,
    HashConflict,
    InvalidInput,
    InvalidState,
    Io,
    Config,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("{kind} not found: {path}")]
    NotFound { kind: NotFoundKind, path: PathBuf },

    #[error("{path} is malformed: {message}")]
    Format { path: PathBuf, message: String },

    #[error("cannot normalize or compare a zero-magnitude vector")]
    DivideByZero,

    #[error("embedding dimension mismatch: expected {expected} values, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("catalog contains no embeddings to match against")]
    EmptyCatalog,

    #[error("no centroids available to match against")]
    EmptyCentroidSet,

    #[error("ciphertext bound to encryption context {found} used with context {expected}")]
    ContextMismatch { expected: Uuid, found: Uuid },

    #[error("decryption requires the secret key, which this encryption context does not hold")]
    DecryptionUnauthorized,

    #[error(
        "image {hash} is already catalogued as '{existing_label}'; refusing to record it as '{requested_label}'"
    )]
    HashConflict {
        hash: String,
        existing_label: String,
        requested_label: String,
    },

    #[error("invalid label '{label}': {message}")]
    InvalidLabel { label: String, message: String },

    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),

    #[error("invalid encryption parameters: {0}")]
    InvalidParameters(String),

    #[error("cannot {operation} while the encrypted match engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write catalog {path}: {source}")]
    CatalogWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("binary encoding error: {0}")]
    Binary(#[from] bincode::Error),

    #[error("malformed encrypted artifact: {0}")]
    MalformedArtifact(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Extraction(_) => ErrorKind::Extraction,
            AppError::NotFound { .. } => ErrorKind::NotFound,
            AppError::Format { .. }
            | AppError::Serialization(_)
            | AppError::Binary(_)
            | AppError::MalformedArtifact(_) => ErrorKind::Format,
            AppError::DivideByZero => ErrorKind::DivideByZero,
            AppError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            AppError::EmptyCatalog => ErrorKind::EmptyCatalog,
            AppError::EmptyCentroidSet => ErrorKind::EmptyCentroidSet,
            AppError::ContextMismatch { .. } => ErrorKind::ContextMismatch,
            AppError::DecryptionUnauthorized => ErrorKind::DecryptionUnauthorized,
            AppError::HashConflict { .. } => ErrorKind::HashConflict,
            AppError::InvalidLabel { .. }
            | AppError::InvalidEmbedding(_)
            | AppError::InvalidParameters(_) => ErrorKind::InvalidInput,
            AppError::InvalidState { .. } => ErrorKind::InvalidState,
            AppError::Read { .. }
            | AppError::CatalogWrite { .. }
            | AppError::ArtifactWrite { .. }
            | AppError::Io(_) => ErrorKind::Io,
            AppError::Config(_) => ErrorKind::Config,
        }
    }

    /// Maps a read failure to `NotFound` when the file is absent.
    pub(crate) fn from_read(kind: NotFoundKind, path: PathBuf, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            AppError::NotFound { kind, path }
        } else {
            AppError::Read { path, source }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_map_to_not_found() {
        let err = AppError::from_read(
            NotFoundKind::Embedding,
            PathBuf::from("gone.npy"),
            io::Error::from(io::ErrorKind::NotFound),
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "embedding file not found: gone.npy");
    }

    #[test]
    fn other_read_failures_stay_io() {
        let err = AppError::from_read(
            NotFoundKind::Catalog,
            PathBuf::from("metadata.json"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, AppError::Read { .. }));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn extraction_errors_keep_their_type() {
        let err = AppError::from(ExtractionError::NoFace {
            path: PathBuf::from("blank.png"),
        });
        assert_eq!(err.kind(), ErrorKind::Extraction);
        assert!(matches!(
            err,
            AppError::Extraction(ExtractionError::NoFace { .. })
        ));
    }
}
