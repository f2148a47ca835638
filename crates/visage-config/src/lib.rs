use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "VISAGE_CONFIG";
pub const PRIMARY_CONFIG_PATH: &str = "/etc/visage/config.toml";
pub const SECONDARY_CONFIG_PATH: &str = "/usr/local/etc/visage/config.toml";
pub const DEFAULT_MODEL_NAME: &str = "ArcFace";
pub const DEFAULT_DETECTOR_BACKEND: &str = "retinaface";
pub const DEFAULT_ENFORCE_DETECTION: bool = true;
/// Cosine-distance cut-off for ArcFace embeddings; pairs at or below it verify.
pub const DEFAULT_DISTANCE_THRESHOLD: f64 = 0.68;
pub const DEFAULT_CATALOG_PATH: &str = "database/metadata.json";
pub const DEFAULT_EMBEDDINGS_DIR: &str = "database/embeddings";
pub const DEFAULT_POLY_MODULUS_DEGREE: usize = 8192;
pub const DEFAULT_COEFF_MOD_BIT_SIZES: [u32; 3] = [40, 20, 40];
pub const DEFAULT_GLOBAL_SCALE_BITS: u32 = 20;

/// What to do when an image whose bytes are already catalogued is ingested
/// again under a different label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Relabel,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EncryptionSection {
    pub poly_modulus_degree: Option<usize>,
    pub coeff_mod_bit_sizes: Option<Vec<u32>>,
    pub global_scale_bits: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    pub model_name: Option<String>,
    pub detector_backend: Option<String>,
    pub enforce_detection: Option<bool>,
    pub distance_threshold: Option<f64>,
    pub catalog_path: Option<PathBuf>,
    pub embeddings_dir: Option<PathBuf>,
    pub conflict_policy: Option<ConflictPolicy>,
    #[serde(default)]
    pub encryption: EncryptionSection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEncryption {
    pub poly_modulus_degree: usize,
    pub coeff_mod_bit_sizes: Vec<u32>,
    pub global_scale_bits: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub model_name: String,
    pub detector_backend: String,
    pub enforce_detection: bool,
    pub distance_threshold: f64,
    pub catalog_path: PathBuf,
    pub embeddings_dir: PathBuf,
    pub conflict_policy: ConflictPolicy,
    pub encryption: ResolvedEncryption,
}

impl ResolvedConfig {
    pub fn from_raw(raw: ConfigFile) -> Self {
        let encryption = raw.encryption;
        Self {
            model_name: raw
                .model_name
                .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string()),
            detector_backend: raw
                .detector_backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            enforce_detection: raw.enforce_detection.unwrap_or(DEFAULT_ENFORCE_DETECTION),
            distance_threshold: raw
                .distance_threshold
                .unwrap_or(DEFAULT_DISTANCE_THRESHOLD),
            catalog_path: raw
                .catalog_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CATALOG_PATH)),
            embeddings_dir: raw
                .embeddings_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_EMBEDDINGS_DIR)),
            conflict_policy: raw.conflict_policy.unwrap_or_default(),
            encryption: ResolvedEncryption {
                poly_modulus_degree: encryption
                    .poly_modulus_degree
                    .unwrap_or(DEFAULT_POLY_MODULUS_DEGREE),
                coeff_mod_bit_sizes: encryption
                    .coeff_mod_bit_sizes
                    .unwrap_or_else(|| DEFAULT_COEFF_MOD_BIT_SIZES.to_vec()),
                global_scale_bits: encryption
                    .global_scale_bits
                    .unwrap_or(DEFAULT_GLOBAL_SCALE_BITS),
            },
        }
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_raw(ConfigFile::default())
    }
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub contents: ConfigFile,
    pub source: PathBuf,
}

impl LoadedConfig {
    pub fn new(contents: ConfigFile, source: PathBuf) -> Self {
        Self { contents, source }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfigWithSource {
    pub resolved: ResolvedConfig,
    pub source: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Search order: explicit path, `$VISAGE_CONFIG`, then the system locations.
pub fn config_sources(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut sources = Vec::with_capacity(4);
    if let Some(path) = explicit {
        sources.push(path.to_path_buf());
    }
    if let Ok(value) = env::var(CONFIG_ENV) {
        if !value.trim().is_empty() {
            sources.push(PathBuf::from(value));
        }
    }
    sources.push(PathBuf::from(PRIMARY_CONFIG_PATH));
    sources.push(PathBuf::from(SECONDARY_CONFIG_PATH));
    sources
}

pub fn load_config(explicit: Option<&Path>) -> Result<Option<LoadedConfig>, ConfigError> {
    load_from_paths(&config_sources(explicit))
}

pub fn load_resolved_config(
    explicit: Option<&Path>,
) -> Result<ResolvedConfigWithSource, ConfigError> {
    load_resolved_from_paths(&config_sources(explicit))
}

pub fn load_from_paths(paths: &[PathBuf]) -> Result<Option<LoadedConfig>, ConfigError> {
    for path in paths {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let parsed =
                    toml::from_str::<ConfigFile>(&contents).map_err(|err| ConfigError::Parse {
                        path: path.clone(),
                        message: err.to_string(),
                    })?;
                debug!(path = %path.display(), "loaded configuration");
                return Ok(Some(LoadedConfig::new(parsed, path.clone())));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                return Err(ConfigError::Read {
                    path: path.clone(),
                    source: err,
                })
            }
        }
    }

    Ok(None)
}

pub fn load_resolved_from_paths(
    paths: &[PathBuf],
) -> Result<ResolvedConfigWithSource, ConfigError> {
    match load_from_paths(paths)? {
        Some(entry) => {
            let path = entry.source.clone();
            Ok(ResolvedConfigWithSource {
                resolved: ResolvedConfig::from_raw(entry.contents),
                source: Some(path),
            })
        }
        None => Ok(ResolvedConfigWithSource {
            resolved: ResolvedConfig::default(),
            source: None,
        }),
    }
}
