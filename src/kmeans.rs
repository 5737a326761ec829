use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("k must be at least 1")]
    ZeroClusters,

    #[error("need at least {k} rows to fit {k} clusters, got {rows}")]
    TooFewRows { k: usize, rows: usize },

    #[error("dimensionality mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("non-finite value in row {row}")]
    NonFinite { row: usize },

    #[error("predict called before the model was fitted or loaded")]
    NotFitted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KMeansConfig {
    /// Number of clusters (gestures)
    pub k: usize,
    pub max_iter: usize,
    /// Independent k-means++ restarts; the lowest inertia wins
    pub n_init: usize,
    pub seed: u64,
    /// Stop once no centroid moves more than this (squared distance)
    pub tol: f32,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            k: 6,
            max_iter: 300,
            n_init: 10,
            seed: 42,
            tol: 1e-4,
        }
    }
}

/// Frozen centroids in standardized feature space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterModel {
    centroids: Vec<Vec<f32>>,
}

impl ClusterModel {
    pub(crate) fn from_centroids(centroids: Vec<Vec<f32>>) -> Self {
        Self { centroids }
    }

    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    pub fn dims(&self) -> usize {
        self.centroids.first().map(Vec::len).unwrap_or(0)
    }

    pub fn centroids(&self) -> &[Vec<f32>] {
        &self.centroids
    }

    /// Index of the nearest centroid; ties go to the lowest index.
    pub fn predict(&self, row: &[f32]) -> Result<usize, ModelError> {
        let dims = self.dims();
        if row.len() != dims {
            return Err(ModelError::DimensionMismatch {
                expected: dims,
                actual: row.len(),
            });
        }
        Ok(nearest(row, &self.centroids).0)
    }

    /// Distance to every centroid, useful when inspecting a sample.
    pub fn distances(&self, row: &[f32]) -> Result<Vec<f32>, ModelError> {
        let dims = self.dims();
        if row.len() != dims {
            return Err(ModelError::DimensionMismatch {
                expected: dims,
                actual: row.len(),
            });
        }
        Ok(self
            .centroids
            .iter()
            .map(|c| squared_distance(row, c).sqrt())
            .collect())
    }

    pub(crate) fn is_consistent(&self) -> bool {
        let dims = self.dims();
        !self.centroids.is_empty()
            && dims > 0
            && self
                .centroids
                .iter()
                .all(|c| c.len() == dims && c.iter().all(|v| v.is_finite()))
    }
}

/// Result of a batch fit.
#[derive(Debug, Clone)]
pub struct KMeansFit {
    pub model: ClusterModel,
    /// Cluster assignment of every training row
    pub labels: Vec<usize>,
    /// Sum of squared distances to the assigned centroid
    pub inertia: f32,
    pub iterations: usize,
}

impl KMeansFit {
    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.model.k()];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

/// k-means estimator. Holds the fitted model once `fit` succeeds.
pub struct KMeans {
    config: KMeansConfig,
    fitted: Option<ClusterModel>,
}

impl KMeans {
    pub fn new(config: KMeansConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn config(&self) -> &KMeansConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&ClusterModel> {
        self.fitted.as_ref()
    }

    pub fn into_model(self) -> Option<ClusterModel> {
        self.fitted
    }

    pub fn predict(&self, row: &[f32]) -> Result<usize, ModelError> {
        self.fitted
            .as_ref()
            .ok_or(ModelError::NotFitted)?
            .predict(row)
    }

    /// Fits on a standardized matrix. Deterministic for a given seed.
    pub fn fit(&mut self, rows: &[Vec<f32>]) -> Result<KMeansFit, ModelError> {
        let k = self.config.k;
        if k == 0 {
            return Err(ModelError::ZeroClusters);
        }
        if rows.len() < k {
            return Err(ModelError::TooFewRows { k, rows: rows.len() });
        }

        let dims = rows[0].len();
        for (i, row) in rows.iter().enumerate() {
            if row.len() != dims {
                return Err(ModelError::DimensionMismatch {
                    expected: dims,
                    actual: row.len(),
                });
            }
            if row.iter().any(|v| !v.is_finite()) {
                return Err(ModelError::NonFinite { row: i });
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut best: Option<KMeansFit> = None;

        for run in 0..self.config.n_init.max(1) {
            let init_seed = rng.gen::<u64>();
            let candidate = self.lloyd(rows, init_seed);
            debug!(
                run,
                inertia = candidate.inertia,
                iterations = candidate.iterations,
                "k-means run finished"
            );

            let better = best
                .as_ref()
                .map(|b| candidate.inertia < b.inertia)
                .unwrap_or(true);
            if better {
                best = Some(candidate);
            }
        }

        let best = best.ok_or(ModelError::NotFitted)?;
        self.fitted = Some(best.model.clone());
        Ok(best)
    }

    /// One k-means++ initialisation followed by Lloyd iterations.
    fn lloyd(&self, rows: &[Vec<f32>], seed: u64) -> KMeansFit {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut centroids = kmeans_plus_plus_init(rows, self.config.k, &mut rng);
        let mut labels = vec![usize::MAX; rows.len()];
        let mut iterations = 0;

        for iter in 0..self.config.max_iter {
            iterations = iter + 1;

            let mut changed = false;
            for (row, label) in rows.iter().zip(labels.iter_mut()) {
                let (nearest_idx, _) = nearest(row, &centroids);
                if *label != nearest_idx {
                    *label = nearest_idx;
                    changed = true;
                }
            }

            if !changed {
                break;
            }

            let updated = recompute_centroids(rows, &mut labels, &centroids);
            let shift = centroids
                .iter()
                .zip(&updated)
                .map(|(a, b)| squared_distance(a, b))
                .fold(0.0f32, f32::max);
            centroids = updated;

            if shift <= self.config.tol {
                break;
            }
        }

        // Labels must reflect the final centroids
        for (row, label) in rows.iter().zip(labels.iter_mut()) {
            *label = nearest(row, &centroids).0;
        }

        let inertia: f32 = rows
            .iter()
            .zip(&labels)
            .map(|(row, &label)| squared_distance(row, &centroids[label]))
            .sum();

        KMeansFit {
            model: ClusterModel::from_centroids(centroids),
            labels,
            inertia,
            iterations,
        }
    }
}

/// k-means++: first centroid uniform, the rest weighted by squared distance
/// to the closest centroid chosen so far.
fn kmeans_plus_plus_init(rows: &[Vec<f32>], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(rows[rng.gen_range(0..rows.len())].clone());

    let mut closest: Vec<f32> = rows
        .iter()
        .map(|r| squared_distance(r, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total: f32 = closest.iter().sum();

        let selected = if total > 0.0 {
            let target = rng.gen_range(0.0..total);
            let mut cumsum = 0.0;
            let mut selected = rows.len() - 1;
            for (i, d) in closest.iter().enumerate() {
                cumsum += d;
                if cumsum > target {
                    selected = i;
                    break;
                }
            }
            selected
        } else {
            // Every row sits on a centroid already (duplicates)
            rng.gen_range(0..rows.len())
        };

        let centroid = rows[selected].clone();
        for (d, row) in closest.iter_mut().zip(rows) {
            *d = d.min(squared_distance(row, &centroid));
        }
        centroids.push(centroid);
    }

    centroids
}

/// Mean of the rows assigned to each cluster. An empty cluster takes the row
/// farthest from its current centroid, which is then reassigned to it.
fn recompute_centroids(
    rows: &[Vec<f32>],
    labels: &mut [usize],
    previous: &[Vec<f32>],
) -> Vec<Vec<f32>> {
    let k = previous.len();
    let dims = previous[0].len();
    let mut sums = vec![vec![0.0f64; dims]; k];
    let mut counts = vec![0usize; k];

    for (row, &label) in rows.iter().zip(labels.iter()) {
        counts[label] += 1;
        for (acc, &x) in sums[label].iter_mut().zip(row) {
            *acc += x as f64;
        }
    }

    for cluster in 0..k {
        if counts[cluster] > 0 {
            continue;
        }

        let donor = rows
            .iter()
            .enumerate()
            .filter(|(i, _)| counts[labels[*i]] > 1)
            .map(|(i, row)| (i, squared_distance(row, &previous[labels[i]])))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i);

        if let Some(i) = donor {
            let from = labels[i];
            counts[from] -= 1;
            for (acc, &x) in sums[from].iter_mut().zip(&rows[i]) {
                *acc -= x as f64;
            }
            labels[i] = cluster;
            counts[cluster] = 1;
            for (acc, &x) in sums[cluster].iter_mut().zip(&rows[i]) {
                *acc = x as f64;
            }
        }
    }

    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((sum, count), prev)| {
            if count == 0 {
                prev.clone()
            } else {
                sum.iter().map(|s| (s / count as f64) as f32).collect()
            }
        })
        .collect()
}

/// Nearest centroid and its squared distance; strict `<` keeps the lowest index on ties.
fn nearest(row: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    let mut best_cluster = 0;
    let mut best_dist = f32::MAX;

    for (i, centroid) in centroids.iter().enumerate() {
        let dist = squared_distance(row, centroid);
        if dist < best_dist {
            best_dist = dist;
            best_cluster = i;
        }
    }

    (best_cluster, best_dist)
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
