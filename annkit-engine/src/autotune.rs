//! Parameter autotuning.
//!
//! A random sample of the dataset is indexed with each candidate
//! configuration. For every candidate the smallest `checks` reaching the
//! target precision is searched for, and the candidate with the lowest cost
//! wins: `search_time + build_weight * build_time`, normalized by the best
//! time cost, plus `memory_weight * (index + data) / data`. Precision is the
//! fraction of sample queries whose nearest other point is found.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use std::time::Instant;

use crate::error::Result;
use crate::index::{NnIndex, Structure};
use crate::linear;
use crate::params::{Algorithm, BuildParams, LogLevel};
use crate::result_set::KnnResultSet;
use crate::store::PointStore;

/// Precision targeted when autotuning is requested without a target.
pub const DEFAULT_TARGET_PRECISION: f32 = 0.9;

const MAX_TEST_QUERIES: usize = 100;
const MIN_SAMPLE: usize = 20;
const BISECT_STEPS: usize = 4;

const KD_TREES: [usize; 4] = [1, 4, 8, 16];
const KMEANS_BRANCHING: [usize; 3] = [16, 32, 64];
const KMEANS_ITERATIONS: [i32; 3] = [1, 5, 10];

/// Held-out queries with the distance of their nearest other point.
struct Probe {
    queries: Vec<u32>,
    truth: Vec<f32>,
}

struct Evaluation {
    checks: i32,
    search_time: f64,
}

struct Candidate {
    params: BuildParams,
    time_cost: f64,
    memory_cost: f64,
}

pub(crate) fn effective_target(params: &BuildParams) -> f32 {
    if params.target_precision > 0.0 {
        params.target_precision.min(1.0)
    } else {
        DEFAULT_TARGET_PRECISION
    }
}

fn probe(store: &PointStore, candidates: &[u32], rng: &mut ChaCha8Rng) -> Probe {
    let mut queries = candidates.to_vec();
    queries.shuffle(rng);
    queries.truncate(MAX_TEST_QUERIES.min((candidates.len() / 10).max(1)));
    let truth = queries
        .iter()
        .map(|&q| {
            let mut result = KnnResultSet::new(2);
            linear::search(store, store.row(q as usize), &mut result);
            nearest_other(result, q).unwrap_or(f32::INFINITY)
        })
        .collect();
    Probe { queries, truth }
}

fn nearest_other(result: KnnResultSet, query: u32) -> Option<f32> {
    result
        .into_sorted()
        .into_iter()
        .find(|&(_, id)| id != query as usize)
        .map(|(d, _)| d)
}

/// Precision and elapsed seconds of running the probe against `structure`.
fn measure(structure: &Structure, store: &PointStore, probe: &Probe, checks: i32) -> (f32, f64) {
    let start = Instant::now();
    let mut correct = 0usize;
    for (&q, &truth) in probe.queries.iter().zip(&probe.truth) {
        let mut result = KnnResultSet::new(2);
        structure.search(store, store.row(q as usize), &mut result, checks);
        if nearest_other(result, q).is_some_and(|d| d <= truth) {
            correct += 1;
        }
    }
    let elapsed = start.elapsed().as_secs_f64();
    (correct as f32 / probe.queries.len().max(1) as f32, elapsed)
}

/// Smallest power-of-two budget reaching `target`, refined by bisection.
fn find_checks(structure: &Structure, store: &PointStore, probe: &Probe, target: f32) -> Evaluation {
    if matches!(structure, Structure::Linear) {
        let (_, time) = measure(structure, store, probe, -1);
        return Evaluation {
            checks: -1,
            search_time: time,
        };
    }
    let limit = (store.len() as i32).saturating_mul(2).max(1);
    let mut checks = 1;
    let (mut precision, mut time) = measure(structure, store, probe, checks);
    while precision < target && checks < limit {
        checks = checks.saturating_mul(2);
        (precision, time) = measure(structure, store, probe, checks);
    }
    if precision < target {
        // Budget exhausted without reaching the target: fall back to exact.
        let (_, exact_time) = measure(structure, store, probe, -1);
        return Evaluation {
            checks: -1,
            search_time: exact_time,
        };
    }

    let mut low = checks / 2;
    let mut high = checks;
    for _ in 0..BISECT_STEPS {
        let mid = (low + high) / 2;
        if mid <= low {
            break;
        }
        let (p, t) = measure(structure, store, probe, mid);
        if p >= target {
            high = mid;
            time = t;
        } else {
            low = mid;
        }
    }
    Evaluation {
        checks: high,
        search_time: time,
    }
}

fn candidate_grid(params: &BuildParams) -> Vec<BuildParams> {
    let mut grid = vec![BuildParams {
        algorithm: Algorithm::Linear,
        ..params.clone()
    }];
    for trees in KD_TREES {
        grid.push(BuildParams {
            algorithm: Algorithm::KdTree,
            trees,
            ..params.clone()
        });
    }
    for branching in KMEANS_BRANCHING {
        for iterations in KMEANS_ITERATIONS {
            grid.push(BuildParams {
                algorithm: Algorithm::KMeans,
                branching,
                iterations,
                ..params.clone()
            });
        }
    }
    grid
}

/// Picks an algorithm and build parameters on a sample of `store`.
pub(crate) fn tune(store: &PointStore, params: &BuildParams, rng: &mut ChaCha8Rng) -> Result<BuildParams> {
    let target = effective_target(params);
    let mut live = store.live_ids();
    live.shuffle(rng);
    let wanted = (live.len() as f32 * params.sample_fraction.clamp(0.0, 1.0)) as usize;
    live.truncate(wanted.max(MIN_SAMPLE).min(live.len()));

    let sample = store.subset(&live);
    if sample.len() < 2 {
        return Ok(BuildParams {
            algorithm: Algorithm::Linear,
            checks: -1,
            target_precision: target,
            ..params.clone()
        });
    }
    let sample_ids: Vec<u32> = (0..sample.len() as u32).collect();
    let probe = probe(&sample, &sample_ids, rng);
    let data_bytes = sample.dataset_bytes().max(1) as f64;

    let mut candidates = Vec::new();
    for candidate in candidate_grid(params) {
        let start = Instant::now();
        let structure = Structure::build(&sample, &candidate, rng)?;
        let build_time = start.elapsed().as_secs_f64();
        let eval = find_checks(&structure, &sample, &probe, target);
        let memory_cost = (structure.used_memory() as f64 + data_bytes) / data_bytes;
        let time_cost = eval.search_time + params.build_weight as f64 * build_time;

        if params.log_level.admits(LogLevel::Info) {
            tracing::info!(
                algorithm = ?candidate.algorithm,
                trees = candidate.trees,
                branching = candidate.branching,
                iterations = candidate.iterations,
                checks = eval.checks,
                search_time = eval.search_time,
                build_time,
                "autotune.candidate"
            );
        }
        candidates.push(Candidate {
            params: BuildParams {
                checks: eval.checks,
                ..candidate
            },
            time_cost,
            memory_cost,
        });
    }

    let best_time = candidates
        .iter()
        .map(|c| c.time_cost)
        .fold(f64::INFINITY, f64::min)
        .max(f64::MIN_POSITIVE);
    let memory_weight = params.memory_weight as f64;
    let cost = |c: &Candidate| c.time_cost / best_time + memory_weight * c.memory_cost;

    let mut best: Option<(f64, BuildParams)> = None;
    for c in &candidates {
        let total = cost(c);
        if best.as_ref().map_or(true, |(b, _)| total < *b) {
            best = Some((total, c.params.clone()));
        }
    }
    let chosen = best.map(|(_, p)| p).unwrap_or_else(|| params.clone());
    Ok(BuildParams {
        target_precision: target,
        ..chosen
    })
}

/// Estimates `checks` for a fully built index and its speedup over a scan.
pub(crate) fn estimate_search_params(index: &NnIndex, target: f32, rng: &mut ChaCha8Rng) -> (i32, f32) {
    let live = index.store.live_ids();
    if live.len() < 2 {
        return (index.params.checks, 1.0);
    }
    let probe = probe(&index.store, &live, rng);
    let eval = find_checks(&index.structure, &index.store, &probe, target);
    let (_, linear_time) = measure(&Structure::Linear, &index.store, &probe, -1);
    let speedup = if eval.search_time > 0.0 {
        (linear_time / eval.search_time) as f32
    } else {
        1.0
    };
    (eval.checks, speedup)
}
