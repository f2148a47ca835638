//! In-memory catalog fixtures shared by the matcher tests.

use std::collections::HashMap;

use crate::errors::AppResult;
use crate::faces::catalog::{Catalog, CatalogParams, EmbeddingRecord};
use crate::faces::store::EmbeddingReader;
use crate::vector::magnitude;

/// Serves vectors by content hash instead of reading `.npy` files.
pub(crate) struct MapReader(HashMap<String, Vec<f64>>);

impl EmbeddingReader for MapReader {
    fn read_embedding(&self, record: &EmbeddingRecord) -> AppResult<Vec<f64>> {
        Ok(self.0[&record.content_hash].clone())
    }
}

/// One record per entry, in order. Record `i` gets the hash `{i:064x}` and
/// the image path `{label}/{i}.png`.
pub(crate) fn fixture(entries: &[(&str, Vec<f64>)]) -> (Catalog, MapReader) {
    let mut catalog = Catalog::new(CatalogParams {
        model_name: "ArcFace".into(),
        detector_backend: "retinaface".into(),
    });
    let mut vectors = HashMap::new();
    for (idx, (label, vector)) in entries.iter().enumerate() {
        let hash = format!("{idx:064x}");
        catalog.images.push(EmbeddingRecord {
            label: label.to_string(),
            image_path: format!("{label}/{idx}.png"),
            content_hash: hash.clone(),
            embedding_path: format!("embeddings/{hash}.npy"),
            magnitude: magnitude(vector),
        });
        vectors.insert(hash, vector.clone());
    }
    (catalog, MapReader(vectors))
}
