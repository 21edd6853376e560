//! End-to-end tests of the engine: every algorithm against a linear scan,
//! incremental updates, removal and persistence.

use annkit_engine::{Algorithm, BuildParams, CentersInit, Engine, Error, CHECKS_UNLIMITED};
use ndarray::{s, Array2};
use tempfile::tempdir;

/// Helper to generate uniform vectors in [-1, 1).
fn generate_vectors(num_vectors: usize, dim: usize, seed: u64) -> Array2<f32> {
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut vectors = Array2::zeros((num_vectors, dim));
    for i in 0..num_vectors {
        for j in 0..dim {
            vectors[[i, j]] = rng.gen::<f32>() * 2.0 - 1.0;
        }
    }
    vectors
}

fn params(algorithm: Algorithm) -> BuildParams {
    BuildParams {
        algorithm,
        trees: 4,
        branching: 8,
        random_seed: 17,
        ..BuildParams::default()
    }
}

#[test]
fn test_exact_search_agrees_across_algorithms() {
    let engine = Engine::new();
    let points = generate_vectors(500, 6, 1);
    let queries = generate_vectors(20, 6, 2);

    let (linear, _) = engine.build_index(points.view(), &params(Algorithm::Linear)).unwrap();
    let (want_ids, want_dists) = engine
        .search(&linear, queries.view(), 5, CHECKS_UNLIMITED)
        .unwrap();

    for algorithm in [Algorithm::KdTree, Algorithm::KMeans, Algorithm::Composite] {
        let (index, report) = engine.build_index(points.view(), &params(algorithm)).unwrap();
        assert_eq!(report.params.algorithm, algorithm);
        let (ids, dists) = engine
            .search(&index, queries.view(), 5, CHECKS_UNLIMITED)
            .unwrap();
        assert_eq!(ids, want_ids, "{:?} ids differ", algorithm);
        for (a, b) in dists.iter().zip(want_dists.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}

#[test]
fn test_distances_sorted_ascending() {
    let engine = Engine::new();
    let points = generate_vectors(300, 16, 3);
    let (index, _) = engine.build_index(points.view(), &params(Algorithm::KMeans)).unwrap();
    let (_, dists) = engine.search(&index, points.slice(s![..10, ..]), 8, 64).unwrap();
    for row in dists.rows() {
        for pair in row.to_vec().windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }
}

#[test]
fn test_approximate_recall_is_high() {
    let engine = Engine::new();
    let points = generate_vectors(2000, 8, 4);
    let queries = generate_vectors(50, 8, 5);

    let (linear, _) = engine.build_index(points.view(), &params(Algorithm::Linear)).unwrap();
    let (truth, _) = engine.search(&linear, queries.view(), 1, -1).unwrap();

    let (kd, _) = engine.build_index(points.view(), &params(Algorithm::KdTree)).unwrap();
    let (found, _) = engine.search(&kd, queries.view(), 1, 256).unwrap();
    let hits = truth.iter().zip(found.iter()).filter(|(a, b)| a == b).count();
    assert!(hits >= 40, "recall too low: {}/50", hits);
}

#[test]
fn test_centers_init_variants_build() {
    let engine = Engine::new();
    let points = generate_vectors(200, 4, 6);
    for init in [CentersInit::Random, CentersInit::Gonzales, CentersInit::KMeansPP] {
        let p = BuildParams {
            centers_init: init,
            ..params(Algorithm::KMeans)
        };
        let (index, _) = engine.build_index(points.view(), &p).unwrap();
        let (ids, dists) = engine.search(&index, points.slice(s![7..8, ..]), 1, -1).unwrap();
        assert_eq!(ids[[0, 0]], 7);
        assert_eq!(dists[[0, 0]], 0.0);
    }
}

#[test]
fn test_removed_points_never_returned() {
    let engine = Engine::new();
    let points = generate_vectors(100, 4, 7);
    let (mut index, _) = engine.build_index(points.view(), &params(Algorithm::KdTree)).unwrap();
    engine.remove_point(&mut index, 10).unwrap();

    let (ids, _) = engine
        .search(&index, points.slice(s![10..11, ..]), 100, -1)
        .unwrap();
    assert!(!ids.iter().any(|&id| id == 10));
    assert_eq!(ids[[0, 99]], -1);
}

#[test]
fn test_incremental_add_is_searchable() {
    let engine = Engine::new();
    let points = generate_vectors(200, 4, 8);
    let (mut index, _) = engine
        .build_index(points.slice(s![..150, ..]), &params(Algorithm::Composite))
        .unwrap();
    let rebuilt = engine
        .add_points(&mut index, points.slice(s![150.., ..]), 2.0)
        .unwrap();
    assert!(!rebuilt);
    assert_eq!(index.len(), 200);

    let (ids, _) = engine
        .search(&index, points.slice(s![150.., ..]), 1, -1)
        .unwrap();
    for (row, id) in ids.column(0).iter().enumerate() {
        assert_eq!(*id, 150 + row as i64);
    }
}

#[test]
fn test_save_load_preserves_results() {
    let engine = Engine::new();
    let points = generate_vectors(400, 8, 9);
    let queries = generate_vectors(10, 8, 10);
    let dir = tempdir().unwrap();

    for algorithm in [Algorithm::Linear, Algorithm::KdTree, Algorithm::KMeans, Algorithm::Composite] {
        let (mut index, _) = engine.build_index(points.view(), &params(algorithm)).unwrap();
        engine.remove_point(&mut index, 3).unwrap();
        let path = dir.path().join(format!("{:?}.idx", algorithm));
        engine.save_index(&index, &path).unwrap();

        let restored = engine.load_index(&path, points.view()).unwrap();
        assert_eq!(restored.params(), index.params());
        assert!(restored.is_removed(3));
        let before = engine.search(&index, queries.view(), 4, 32).unwrap();
        let after = engine.search(&restored, queries.view(), 4, 32).unwrap();
        assert_eq!(before, after);
    }
}

#[test]
fn test_load_rejects_wrong_points() {
    let engine = Engine::new();
    let points = generate_vectors(50, 4, 11);
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.idx");
    let (index, _) = engine.build_index(points.view(), &params(Algorithm::KdTree)).unwrap();
    engine.save_index(&index, &path).unwrap();

    let fewer = points.slice(s![..40, ..]);
    assert!(matches!(
        engine.load_index(&path, fewer),
        Err(Error::PointCountMismatch { expected: 50, got: 40 })
    ));
    let wider = generate_vectors(50, 5, 11);
    assert!(matches!(
        engine.load_index(&path, wider.view()),
        Err(Error::DimensionMismatch { expected: 4, got: 5 })
    ));

    let bogus = dir.path().join("bogus.idx");
    std::fs::write(&bogus, b"definitely not an index").unwrap();
    assert!(matches!(
        engine.load_index(&bogus, points.view()),
        Err(Error::CorruptedIndex(_))
    ));
}

#[test]
fn test_autotune_reports_concrete_params() {
    let engine = Engine::new();
    let points = generate_vectors(1000, 4, 12);
    let p = BuildParams {
        algorithm: Algorithm::Autotuned,
        target_precision: 0.9,
        sample_fraction: 0.2,
        ..BuildParams::default()
    };
    let (index, report) = engine.build_index(points.view(), &p).unwrap();
    assert_ne!(report.params.algorithm, Algorithm::Autotuned);
    assert_eq!(index.params(), &report.params);
    assert!(report.speedup > 0.0);
}

#[test]
fn test_cluster_centers_count() {
    let engine = Engine::new();
    let points = generate_vectors(1000, 3, 13);
    let p = BuildParams {
        branching: 5,
        iterations: 10,
        ..BuildParams::default()
    };
    // (5 - 1) * 3 + 1
    let (centers, count) = engine.compute_cluster_centers(points.view(), 13, &p).unwrap();
    assert_eq!(count, 13);
    assert_eq!(centers.dim(), (13, 3));

    let (_, count) = engine.compute_cluster_centers(points.view(), 12, &p).unwrap();
    assert_eq!(count, 9);
}

#[test]
fn test_memory_accounting() {
    let engine = Engine::new();
    let points = generate_vectors(256, 16, 14);
    let (linear, _) = engine.build_index(points.view(), &params(Algorithm::Linear)).unwrap();
    let (kd, _) = engine.build_index(points.view(), &params(Algorithm::KdTree)).unwrap();
    assert_eq!(engine.used_memory_for_dataset(&kd), 256 * 16 * 4);
    assert!(engine.used_memory(&kd) > engine.used_memory(&linear));
}
