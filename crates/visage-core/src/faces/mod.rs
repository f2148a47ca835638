pub mod catalog;
pub mod centroid;
pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod store;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

pub use catalog::{
    append_catalog, is_valid_content_hash, load_catalog, save_catalog, Catalog, CatalogParams,
    EmbeddingRecord, CONTENT_HASH_LEN,
};

pub use centroid::{build_centroids, find_nearest_centroid, Centroid, CentroidSet};

pub use extractor::{
    extract_first_embedding, EmbeddingExtractor, ExtractorConfig, FaceRepresentation, FacialArea,
    PrecomputedExtractor,
};

#[cfg(feature = "dlib")]
pub use extractor::{DlibBackend, DlibModelPaths};

pub use matcher::{find_nearest, rank_nearest, MatchResult};

pub use pipeline::{
    run_centroid_match, run_ingestion, run_nearest_match, IngestConfig, IngestionOutcome,
    MatchConfig, MatchOutcome,
};

pub use verify::{
    run_pairwise_comparison, verify_embeddings, verify_pair, FailedPair, PairVerification,
    PairwiseConfig, PairwiseOutcome, Verification,
};

pub use store::{
    content_hash, read_embedding_file, validate_label, write_embedding_file, EmbeddingReader,
    EmbeddingStore, IngestOutcome, IngestReport, LabeledImage, NpyEmbeddingReader, SkippedImage,
    StoreConfig,
};
