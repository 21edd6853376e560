//! Integration tests for hierarchical k-means and clustering evaluation.

use annkit::evaluate::{self, ClusterEvidence};
use annkit::{CentersInit, Error, Flann, HierarchicalKMeans, IndexParams, NativeEngine};
use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn random_points(n: usize, dim: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::random_using((n, dim), Uniform::new(0.0f32, 1.0), &mut rng)
}

#[test]
fn test_five_clusters_of_two_dimensional_points() {
    let points = random_points(500, 2, 1);
    let flann = Flann::new();
    let centroids = flann
        .hierarchical_kmeans(points.view(), &HierarchicalKMeans::new(5, 1).with_seed(3))
        .unwrap();
    assert_eq!(centroids.dim(), (5, 2));
}

#[test]
fn test_cluster_count_for_several_shapes() {
    let points = random_points(2000, 3, 2);
    let engine = NativeEngine::new();
    let base = IndexParams::default();
    for (branch_size, num_branches) in [(2, 1), (3, 2), (4, 3), (8, 2)] {
        let config = HierarchicalKMeans::new(branch_size, num_branches).with_seed(5);
        let result = config.run(&engine, &base, points.view()).unwrap();
        assert_eq!(
            result.centroids.nrows(),
            (branch_size - 1) * num_branches + 1,
            "branch_size={} num_branches={}",
            branch_size,
            num_branches
        );
    }
}

#[test]
fn test_explicit_seed_is_reproducible() {
    let points = random_points(800, 4, 3);
    let flann = Flann::new();
    let config = HierarchicalKMeans::new(4, 3).with_seed(77).with_best_of_n(3);
    let first = flann.hierarchical_kmeans(points.view(), &config).unwrap();
    let second = flann.hierarchical_kmeans(points.view(), &config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_different_seeds_usually_differ() {
    let points = random_points(800, 4, 4);
    let engine = NativeEngine::new();
    let base = IndexParams::default();
    let results: Vec<Array2<f32>> = (0..4u64)
        .map(|seed| {
            HierarchicalKMeans::new(6, 2)
                .with_seed(seed)
                .run(&engine, &base, points.view())
                .unwrap()
                .centroids
        })
        .collect();
    let distinct = results
        .iter()
        .enumerate()
        .filter(|(i, r)| results[..*i].iter().all(|prev| prev != *r))
        .count();
    assert!(distinct >= 2);

    // Unseeded runs draw fresh seeds.
    let unseeded: Vec<Option<u64>> = (0..3)
        .map(|_| {
            HierarchicalKMeans::new(6, 2)
                .run(&engine, &base, points.view())
                .unwrap()
                .seed
        })
        .collect();
    assert!(unseeded[0] != unseeded[1] || unseeded[1] != unseeded[2]);
}

#[test]
fn test_best_of_n_never_worse_than_single_run() {
    let points = random_points(600, 3, 5);
    let engine = NativeEngine::new();
    let base = IndexParams::default();
    for seed in [1u64, 2, 3] {
        let single = HierarchicalKMeans::new(8, 1)
            .with_seed(seed)
            .with_max_iterations(3)
            .run(&engine, &base, points.view())
            .unwrap();
        let best = HierarchicalKMeans::new(8, 1)
            .with_seed(seed)
            .with_max_iterations(3)
            .with_best_of_n(5)
            .run(&engine, &base, points.view())
            .unwrap();
        assert!(best.objective <= single.objective);
    }
}

#[test]
fn test_reported_objective_matches_evaluator() {
    let points = random_points(300, 5, 6);
    let result = HierarchicalKMeans::new(4, 2)
        .with_seed(8)
        .run(&NativeEngine::new(), &IndexParams::default(), points.view())
        .unwrap();
    let expected = evaluate::objective(points.view(), result.centroids.view()).unwrap();
    assert!((result.objective - expected as f64).abs() < 1e-3);
}

#[test]
fn test_none_empty_clusterings_have_members() {
    let points = random_points(400, 2, 7);
    let engine = NativeEngine::new();
    let base = IndexParams::default();
    for seed in 0..5u64 {
        let result = HierarchicalKMeans::new(5, 3)
            .with_seed(seed)
            .with_centers_init(CentersInit::KMeansPP)
            .with_none_empty(10)
            .run(&engine, &base, points.view());
        match result {
            Ok(result) => {
                let evidence = ClusterEvidence::RawPoints {
                    points: points.view(),
                    centers: result.centroids.view(),
                };
                assert!(!evidence.has_empty_cluster().unwrap());
            }
            Err(Error::Clustering(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
}

#[test]
fn test_kmeans_wrapper_and_output_type() {
    let points = random_points(200, 3, 8).mapv(f64::from);
    let flann = Flann::new();
    let config = HierarchicalKMeans::default().with_seed(2);

    let mean = flann.kmeans(points.view(), 1, &config).unwrap();
    let expected = points.mean_axis(ndarray::Axis(0)).unwrap();
    for (a, b) in mean.row(0).iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-12);
    }

    let centroids = flann.kmeans(points.view(), 7, &config).unwrap();
    assert_eq!(centroids.dim(), (7, 3));

    let narrowed: Array2<f32> = config
        .kmeans(&NativeEngine::new(), &IndexParams::default(), points.view(), 7)
        .unwrap()
        .cast();
    assert_eq!(narrowed.dim(), (7, 3));

    let cast: Array2<f32> = HierarchicalKMeans::new(7, 1)
        .with_seed(2)
        .run_as(&NativeEngine::new(), &IndexParams::default(), points.view())
        .unwrap();
    assert_eq!(cast, narrowed);
}

#[test]
fn test_seed_list_must_match_attempts() {
    let points = random_points(100, 2, 9);
    let engine = NativeEngine::new();
    let base = IndexParams::default();
    let mismatched = HierarchicalKMeans::new(3, 1)
        .with_best_of_n(3)
        .with_seeds(vec![1, 2]);
    assert!(matches!(
        mismatched.run(&engine, &base, points.view()),
        Err(Error::Validation(_))
    ));

    let listed = HierarchicalKMeans::new(3, 1)
        .with_best_of_n(2)
        .with_seeds(vec![10, 20])
        .run(&engine, &base, points.view())
        .unwrap();
    assert!(matches!(listed.seed, Some(10) | Some(20)));
}

#[test]
fn test_evaluator_paths_agree_on_random_inputs() {
    for seed in 0..5u64 {
        let points = random_points(120, 4, 100 + seed).mapv(f64::from);
        let centers = random_points(6, 4, 200 + seed).mapv(f64::from);

        let distances = evaluate::distance2_matrix(points.view(), centers.view()).unwrap();
        let labels = evaluate::labels(points.view(), centers.view()).unwrap();
        assert_eq!(evaluate::labels_from_distances(distances.view()).unwrap(), labels);

        let raw = evaluate::objective(points.view(), centers.view()).unwrap();
        let from_distances = evaluate::objective_from_distances(distances.view()).unwrap();
        let from_labeled =
            evaluate::objective_from_labeled_distances(distances.view(), labels.view()).unwrap();
        assert!((raw - from_distances).abs() < 1e-9);
        assert!((raw - from_labeled).abs() < 1e-9);

        let by_sizes = evaluate::cluster_sizes(labels.view(), Some(6)).unwrap();
        let evidence = ClusterEvidence::PrecomputedDistances {
            distances: distances.view(),
            labels: None,
        };
        assert_eq!(evidence.cluster_sizes().unwrap(), by_sizes);
        assert_eq!(by_sizes.sum(), 120);
    }
}
