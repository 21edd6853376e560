//! Clustering quality evaluation.
//!
//! Distance matrices, labels, objective values and cluster sizes can be
//! computed from whatever is at hand. The free functions each take one
//! concrete input combination; [`ClusterEvidence`] wraps the combinations
//! in one type and always picks the cheapest path to the requested value.
//! All paths share the same kernels, so they agree on identical
//! assignments up to floating-point rounding.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, NdFloat, Zip};

use crate::error::{Error, Result};

fn check_dims(points: &ArrayView2<impl NdFloat>, centers: &ArrayView2<impl NdFloat>) -> Result<()> {
    if points.ncols() != centers.ncols() {
        return Err(Error::Validation(format!(
            "points have {} dimensions but centers have {}",
            points.ncols(),
            centers.ncols()
        )));
    }
    Ok(())
}

/// N x K matrix of squared Euclidean distances from points to centers.
pub fn distance2_matrix<A: NdFloat>(
    points: ArrayView2<A>,
    centers: ArrayView2<A>,
) -> Result<Array2<A>> {
    check_dims(&points, &centers)?;
    let mut dm = Array2::<A>::zeros((points.nrows(), centers.nrows()));
    Zip::from(dm.rows_mut())
        .and(points.rows())
        .par_for_each(|mut row, point| {
            for (slot, center) in row.iter_mut().zip(centers.rows()) {
                *slot = point
                    .iter()
                    .zip(center.iter())
                    .fold(A::zero(), |acc, (&p, &c)| acc + (p - c) * (p - c));
            }
        });
    Ok(dm)
}

/// N x K matrix of Euclidean distances (square root of [`distance2_matrix`]).
pub fn distance_matrix<A: NdFloat>(
    points: ArrayView2<A>,
    centers: ArrayView2<A>,
) -> Result<Array2<A>> {
    let mut dm = distance2_matrix(points, centers)?;
    dm.mapv_inplace(|d| d.sqrt());
    Ok(dm)
}

/// Index and value of the row minimum; ties go to the first column.
fn row_min<A: NdFloat>(row: ArrayView1<A>) -> (usize, A) {
    let mut best = 0;
    let mut best_dist = A::infinity();
    for (j, &d) in row.iter().enumerate() {
        if d < best_dist {
            best = j;
            best_dist = d;
        }
    }
    (best, best_dist)
}

fn check_width<A>(distances: &ArrayView2<A>) -> Result<()> {
    if distances.ncols() == 0 && distances.nrows() > 0 {
        return Err(Error::Validation(
            "distance matrix has no center columns".into(),
        ));
    }
    Ok(())
}

/// Nearest center per row of a distance matrix.
pub fn labels_from_distances<A: NdFloat>(distances: ArrayView2<A>) -> Result<Array1<usize>> {
    check_width(&distances)?;
    Ok(distances
        .axis_iter(Axis(0))
        .map(|row| row_min(row).0)
        .collect())
}

/// Nearest center per point.
pub fn labels<A: NdFloat>(points: ArrayView2<A>, centers: ArrayView2<A>) -> Result<Array1<usize>> {
    labels_from_distances(distance2_matrix(points, centers)?.view())
}

/// Sum over rows of the smallest squared distance.
pub fn objective_from_distances<A: NdFloat>(distances: ArrayView2<A>) -> Result<A> {
    check_width(&distances)?;
    Ok(distances
        .axis_iter(Axis(0))
        .fold(A::zero(), |acc, row| acc + row_min(row).1))
}

/// Sum of each row's distance to its labeled center.
pub fn objective_from_labeled_distances<A: NdFloat>(
    distances: ArrayView2<A>,
    labels: ArrayView1<usize>,
) -> Result<A> {
    if labels.len() != distances.nrows() {
        return Err(Error::Validation(format!(
            "{} labels for {} distance rows",
            labels.len(),
            distances.nrows()
        )));
    }
    let k = distances.ncols();
    let mut total = A::zero();
    for (row, &label) in distances.axis_iter(Axis(0)).zip(labels.iter()) {
        if label >= k {
            return Err(Error::Validation(format!(
                "label {} out of range for {} centers",
                label, k
            )));
        }
        total = total + row[label];
    }
    Ok(total)
}

/// Sum of squared distances from each point to its nearest center.
pub fn objective<A: NdFloat>(points: ArrayView2<A>, centers: ArrayView2<A>) -> Result<A> {
    objective_from_distances(distance2_matrix(points, centers)?.view())
}

/// Points per cluster. `num_clusters` defaults to `max(label) + 1`.
pub fn cluster_sizes(labels: ArrayView1<usize>, num_clusters: Option<usize>) -> Result<Array1<usize>> {
    let k = num_clusters.unwrap_or_else(|| labels.iter().max().map_or(0, |&m| m + 1));
    let mut sizes = Array1::<usize>::zeros(k);
    for &label in labels.iter() {
        if label >= k {
            return Err(Error::Validation(format!(
                "label {} out of range for {} clusters",
                label, k
            )));
        }
        sizes[label] += 1;
    }
    Ok(sizes)
}

/// N x K 0/1 matrix with a one at `(i, labels[i])`.
pub fn assignment_matrix(labels: ArrayView1<usize>, num_clusters: Option<usize>) -> Result<Array2<u8>> {
    let k = num_clusters.unwrap_or_else(|| labels.iter().max().map_or(0, |&m| m + 1));
    let mut matrix = Array2::<u8>::zeros((labels.len(), k));
    for (i, &label) in labels.iter().enumerate() {
        if label >= k {
            return Err(Error::Validation(format!(
                "label {} out of range for {} clusters",
                label, k
            )));
        }
        matrix[[i, label]] = 1;
    }
    Ok(matrix)
}

/// The inputs available for evaluating a clustering.
#[derive(Debug, Clone, Copy)]
pub enum ClusterEvidence<'a, A> {
    /// Points and the centers they are assigned to.
    RawPoints {
        points: ArrayView2<'a, A>,
        centers: ArrayView2<'a, A>,
    },
    /// A precomputed squared distance matrix, optionally with labels.
    PrecomputedDistances {
        distances: ArrayView2<'a, A>,
        labels: Option<ArrayView1<'a, usize>>,
    },
    /// Labels only; `num_clusters` defaults to `max(label) + 1`.
    Labeled {
        labels: ArrayView1<'a, usize>,
        num_clusters: Option<usize>,
    },
    /// Cluster sizes only.
    Sizes(ArrayView1<'a, usize>),
}

impl<'a, A: NdFloat> ClusterEvidence<'a, A> {
    /// Number of clusters, when the inputs determine it.
    pub fn num_clusters(&self) -> Option<usize> {
        match self {
            ClusterEvidence::RawPoints { centers, .. } => Some(centers.nrows()),
            ClusterEvidence::PrecomputedDistances { distances, .. } => Some(distances.ncols()),
            ClusterEvidence::Labeled { num_clusters, .. } => *num_clusters,
            ClusterEvidence::Sizes(sizes) => Some(sizes.len()),
        }
    }

    pub fn labels(&self) -> Result<Array1<usize>> {
        match self {
            ClusterEvidence::RawPoints { points, centers } => labels(*points, *centers),
            ClusterEvidence::PrecomputedDistances {
                labels: Some(l), ..
            }
            | ClusterEvidence::Labeled { labels: l, .. } => Ok(l.to_owned()),
            ClusterEvidence::PrecomputedDistances { distances, .. } => {
                labels_from_distances(*distances)
            }
            ClusterEvidence::Sizes(_) => Err(Error::Validation(
                "labels cannot be derived from cluster sizes".into(),
            )),
        }
    }

    pub fn distance_matrix(&self) -> Result<Array2<A>> {
        match self {
            ClusterEvidence::RawPoints { points, centers } => distance2_matrix(*points, *centers),
            ClusterEvidence::PrecomputedDistances { distances, .. } => Ok(distances.to_owned()),
            _ => Err(Error::Validation(
                "a distance matrix needs points and centers".into(),
            )),
        }
    }

    pub fn objective(&self) -> Result<A> {
        match self {
            ClusterEvidence::RawPoints { points, centers } => objective(*points, *centers),
            ClusterEvidence::PrecomputedDistances {
                distances,
                labels: Some(l),
            } => objective_from_labeled_distances(*distances, *l),
            ClusterEvidence::PrecomputedDistances {
                distances,
                labels: None,
            } => objective_from_distances(*distances),
            _ => Err(Error::Validation(
                "the objective needs distances or points and centers".into(),
            )),
        }
    }

    pub fn cluster_sizes(&self) -> Result<Array1<usize>> {
        match self {
            ClusterEvidence::Sizes(sizes) => Ok(sizes.to_owned()),
            ClusterEvidence::Labeled {
                labels,
                num_clusters,
            } => cluster_sizes(*labels, *num_clusters),
            _ => cluster_sizes(self.labels()?.view(), self.num_clusters()),
        }
    }

    pub fn has_empty_cluster(&self) -> Result<bool> {
        Ok(self.cluster_sizes()?.iter().any(|&s| s == 0))
    }

    pub fn assignment_matrix(&self) -> Result<Array2<u8>> {
        assignment_matrix(self.labels()?.view(), self.num_clusters())
    }
}
