use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use visage_config::ResolvedConfig;

use crate::errors::ExtractionError;
use crate::vector::magnitude;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    pub model_name: String,
    pub detector_backend: String,
    pub enforce_detection: bool,
}

impl From<&ResolvedConfig> for ExtractorConfig {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            model_name: config.model_name.clone(),
            detector_backend: config.detector_backend.clone(),
            enforce_detection: config.enforce_detection,
        }
    }
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self::from(&ResolvedConfig::default())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FacialArea {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaceRepresentation {
    pub embedding: Vec<f64>,
    pub facial_area: FacialArea,
    pub face_confidence: Option<f64>,
}

/// Black-box face detector plus embedding model.
pub trait EmbeddingExtractor {
    fn represent(
        &self,
        image: &Path,
        config: &ExtractorConfig,
    ) -> Result<Vec<FaceRepresentation>, ExtractionError>;
}

/// Runs the extractor and keeps the first face, which is the one used for
/// both ingestion and queries.
pub fn extract_first_embedding<E: EmbeddingExtractor + ?Sized>(
    extractor: &E,
    image: &Path,
    config: &ExtractorConfig,
) -> Result<Vec<f64>, ExtractionError> {
    let faces = extractor.represent(image, config)?;
    let first = faces.into_iter().next().ok_or_else(|| ExtractionError::NoFace {
        path: image.to_path_buf(),
    })?;

    let embedding = first.embedding;
    if embedding.is_empty() {
        return Err(ExtractionError::Backend {
            backend: config.model_name.clone(),
            path: image.to_path_buf(),
            message: "returned an empty embedding".into(),
        });
    }
    if embedding.iter().any(|value| !value.is_finite()) {
        return Err(ExtractionError::Backend {
            backend: config.model_name.clone(),
            path: image.to_path_buf(),
            message: "returned non-finite embedding values".into(),
        });
    }
    if magnitude(&embedding) <= f64::EPSILON {
        return Err(ExtractionError::Backend {
            backend: config.model_name.clone(),
            path: image.to_path_buf(),
            message: "returned a zero-magnitude embedding".into(),
        });
    }

    Ok(embedding)
}

/// Extractor backed by representations computed elsewhere, keyed by image path.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedExtractor {
    faces: HashMap<PathBuf, Vec<FaceRepresentation>>,
}

impl PrecomputedExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image: impl Into<PathBuf>, faces: Vec<FaceRepresentation>) {
        self.faces.insert(image.into(), faces);
    }

    pub fn insert_embedding(&mut self, image: impl Into<PathBuf>, embedding: Vec<f64>) {
        self.insert(
            image,
            vec![FaceRepresentation {
                embedding,
                facial_area: FacialArea::default(),
                face_confidence: None,
            }],
        );
    }
}

impl EmbeddingExtractor for PrecomputedExtractor {
    fn represent(
        &self,
        image: &Path,
        config: &ExtractorConfig,
    ) -> Result<Vec<FaceRepresentation>, ExtractionError> {
        match self.faces.get(image) {
            Some(faces) if faces.is_empty() && config.enforce_detection => {
                Err(ExtractionError::NoFace {
                    path: image.to_path_buf(),
                })
            }
            Some(faces) => Ok(faces.clone()),
            None => Err(ExtractionError::Backend {
                backend: "precomputed".into(),
                path: image.to_path_buf(),
                message: "no precomputed representation for this image".into(),
            }),
        }
    }
}

#[cfg(feature = "dlib")]
pub use dlib_backend::{DlibBackend, DlibModelPaths};

#[cfg(feature = "dlib")]
mod dlib_backend {
    use std::path::{Path, PathBuf};

    use dlib_face_recognition::{
        FaceDetector, FaceDetectorTrait, FaceEncoderNetwork, FaceEncoderTrait, ImageMatrix,
        LandmarkPredictor, LandmarkPredictorTrait,
    };
    use image::RgbImage;
    use tracing::debug;

    use super::{EmbeddingExtractor, ExtractorConfig, FaceRepresentation, FacialArea};
    use crate::errors::ExtractionError;

    pub const DLIB_MODEL_NAME: &str = "Dlib";

    #[derive(Debug, Clone)]
    pub struct DlibModelPaths {
        pub landmark: PathBuf,
        pub encoder: PathBuf,
    }

    pub struct DlibBackend {
        detector: FaceDetector,
        predictor: LandmarkPredictor,
        encoder: FaceEncoderNetwork,
        jitters: u32,
    }

    impl DlibBackend {
        pub fn new(models: &DlibModelPaths, jitters: u32) -> Result<Self, ExtractionError> {
            debug!(path = %models.landmark.display(), "loading landmark model");
            let predictor = LandmarkPredictor::open(&models.landmark).map_err(|message| {
                ExtractionError::Backend {
                    backend: DLIB_MODEL_NAME.into(),
                    path: models.landmark.clone(),
                    message,
                }
            })?;
            debug!(path = %models.encoder.display(), "loading encoder model");
            let encoder = FaceEncoderNetwork::open(&models.encoder).map_err(|message| {
                ExtractionError::Backend {
                    backend: DLIB_MODEL_NAME.into(),
                    path: models.encoder.clone(),
                    message,
                }
            })?;

            Ok(Self {
                detector: FaceDetector::new(),
                predictor,
                encoder,
                jitters,
            })
        }

        fn load_rgb(image: &Path) -> Result<RgbImage, ExtractionError> {
            let decoded = image::open(image).map_err(|err| ExtractionError::UnreadableImage {
                path: image.to_path_buf(),
                message: err.to_string(),
            })?;
            Ok(decoded.to_rgb8())
        }
    }

    impl EmbeddingExtractor for DlibBackend {
        fn represent(
            &self,
            image: &Path,
            config: &ExtractorConfig,
        ) -> Result<Vec<FaceRepresentation>, ExtractionError> {
            if !config.model_name.eq_ignore_ascii_case(DLIB_MODEL_NAME) {
                return Err(ExtractionError::Backend {
                    backend: DLIB_MODEL_NAME.into(),
                    path: image.to_path_buf(),
                    message: format!("model '{}' is not served by dlib", config.model_name),
                });
            }

            let rgb = Self::load_rgb(image)?;
            let matrix = ImageMatrix::from_image(&rgb);
            let locations = self.detector.face_locations(&matrix);
            debug!(image = %image.display(), faces = locations.len(), "dlib detection");
            if locations.is_empty() {
                return Err(ExtractionError::NoFace {
                    path: image.to_path_buf(),
                });
            }

            let mut landmarks = Vec::with_capacity(locations.len());
            for rect in locations.iter() {
                landmarks.push(self.predictor.face_landmarks(&matrix, rect));
            }
            let encodings = self
                .encoder
                .get_face_encodings(&matrix, &landmarks, self.jitters);

            let mut faces = Vec::with_capacity(locations.len());
            for (rect, encoding) in locations.iter().zip(encodings.iter()) {
                faces.push(FaceRepresentation {
                    embedding: encoding.as_ref().to_vec(),
                    facial_area: FacialArea {
                        x: rect.left,
                        y: rect.top,
                        w: rect.right - rect.left,
                        h: rect.bottom - rect.top,
                    },
                    face_confidence: None,
                });
            }
            Ok(faces)
        }
    }
}
