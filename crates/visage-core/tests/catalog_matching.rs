use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use visage_config::ConflictPolicy;
use visage_core::faces::{
    build_centroids, find_nearest, find_nearest_centroid, load_catalog, run_ingestion,
    CatalogParams, EmbeddingStore, IngestConfig, LabeledImage, NpyEmbeddingReader,
    PrecomputedExtractor, StoreConfig,
};
use visage_core::vector::normalize;
use visage_core::AppError;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("visage_core=debug")
        .try_init();
}

fn store_config(root: &Path) -> StoreConfig {
    StoreConfig {
        catalog_path: root.join("database/metadata.json"),
        embeddings_dir: root.join("database/embeddings"),
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
    fs::write(&path, format!("pixels of {name}")).unwrap();
    path
}

struct Gallery {
    _tmp: TempDir,
    root: PathBuf,
    extractor: PrecomputedExtractor,
    images: Vec<LabeledImage>,
}

fn gallery() -> Gallery {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let mut extractor = PrecomputedExtractor::new();
    let mut images = Vec::new();
    for (name, label, embedding) in [
        ("alice-1.png", "Alice", vec![1.0, 0.0, 0.0]),
        ("alice-2.png", "Alice", vec![0.9, 0.1, 0.0]),
        ("bob-1.png", "Bob", vec![0.0, 1.0, 0.0]),
        ("carol-1.png", "Carol", vec![0.0, 0.0, 1.0]),
    ] {
        let path = image(&root, name);
        extractor.insert_embedding(&path, embedding);
        images.push(LabeledImage::new(path, label));
    }
    Gallery {
        _tmp: tmp,
        root,
        extractor,
        images,
    }
}

#[test]
fn ingesting_the_same_images_twice_changes_nothing() {
    let gallery = gallery();
    let config = IngestConfig {
        store: store_config(&gallery.root),
        images: gallery.images.clone(),
    };

    let first = run_ingestion(&config, &gallery.extractor).unwrap();
    assert_eq!(first.report.added.len(), 4);
    let catalog_bytes = fs::read(&config.store.catalog_path).unwrap();

    let second = run_ingestion(&config, &gallery.extractor).unwrap();
    assert!(second.report.added.is_empty());
    assert_eq!(second.report.duplicates.len(), 4);
    assert_eq!(second.catalog_len, 4);
    assert_eq!(fs::read(&config.store.catalog_path).unwrap(), catalog_bytes);

    let embeddings: Vec<_> = fs::read_dir(&config.store.embeddings_dir)
        .unwrap()
        .collect();
    assert_eq!(embeddings.len(), 4);
}

#[test]
fn nearest_and_centroid_matching_pick_the_right_person() {
    let gallery = gallery();
    let config = IngestConfig {
        store: store_config(&gallery.root),
        images: gallery.images.clone(),
    };
    run_ingestion(&config, &gallery.extractor).unwrap();

    let catalog = load_catalog(&config.store.catalog_path).unwrap();
    let query = normalize(&[0.8, 0.3, 0.1]).unwrap();

    let nearest = find_nearest(&query, &catalog, &NpyEmbeddingReader).unwrap();
    assert_eq!(nearest.label, "Alice");
    assert!(nearest.image_path.ends_with("alice-2.png"));

    let centroids = build_centroids(&catalog, &NpyEmbeddingReader).unwrap();
    assert_eq!(centroids.len(), 3);
    assert_eq!(centroids.get("Alice").unwrap().members, 2);
    let by_centroid = find_nearest_centroid(&query, &centroids).unwrap();
    assert_eq!(by_centroid.label, "Alice");
    assert!(by_centroid.distance >= 0.0 && by_centroid.distance < nearest.distance + 0.1);
}

#[test]
fn reopened_store_keeps_dimension_checks() {
    let gallery = gallery();
    let config = IngestConfig {
        store: store_config(&gallery.root),
        images: gallery.images.clone(),
    };
    run_ingestion(&config, &gallery.extractor).unwrap();

    let mut extractor = gallery.extractor;
    let odd = image(&gallery.root, "dave.png");
    extractor.insert_embedding(&odd, vec![0.5, 0.5]);
    let mut store = EmbeddingStore::open(config.store.clone()).unwrap();
    match store.ingest(&odd, "Dave", &extractor).unwrap_err() {
        AppError::DimensionMismatch { expected, found } => {
            assert_eq!(expected, 3);
            assert_eq!(found, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(store.catalog().len(), 4);
}

#[test]
fn matching_an_empty_catalog_is_an_error() {
    let gallery = gallery();
    let store = EmbeddingStore::open(store_config(&gallery.root)).unwrap();
    assert!(matches!(
        find_nearest(&[1.0, 0.0, 0.0], store.catalog(), &NpyEmbeddingReader),
        Err(AppError::EmptyCatalog)
    ));
    assert!(matches!(
        find_nearest_centroid(
            &[1.0, 0.0, 0.0],
            &build_centroids(store.catalog(), &NpyEmbeddingReader).unwrap()
        ),
        Err(AppError::EmptyCentroidSet)
    ));
}
