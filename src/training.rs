use std::fmt;

use thiserror::Error;
use tracing::info;

use crate::kmeans::{KMeans, KMeansConfig, KMeansFit, ModelError};
use crate::standardizer::{ScalerError, Standardizer};
use crate::types::FeatureSet;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("no training rows left after cleaning")]
    NoRows,

    #[error("feature pipeline: {0}")]
    Scaler(#[from] ScalerError),

    #[error("k-means: {0}")]
    Model(#[from] ModelError),
}

/// Fitted standardizer + clustering of one training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub scaler: Standardizer,
    pub fit: KMeansFit,
    pub config: KMeansConfig,
}

impl TrainingOutcome {
    pub fn rows(&self) -> usize {
        self.fit.labels.len()
    }

    /// Per-cluster size and centroid in raw sensor units, for building the
    /// cluster → gesture table by hand.
    pub fn report(&self) -> ClusterReport {
        let sizes = self.fit.cluster_sizes();
        let clusters = self
            .fit
            .model
            .centroids()
            .iter()
            .enumerate()
            .map(|(cluster, centroid)| ClusterSummary {
                cluster,
                size: sizes[cluster],
                centroid: self
                    .scaler
                    .inverse_transform(centroid)
                    .unwrap_or_else(|_| centroid.clone()),
            })
            .collect();

        ClusterReport {
            columns: self.scaler.columns().to_vec(),
            clusters,
            inertia: self.fit.inertia,
        }
    }
}

/// Fits the standardizer on `rows`, then k-means on the standardized rows.
pub fn fit_pipeline(
    feature_set: FeatureSet,
    rows: &[Vec<f32>],
    config: KMeansConfig,
) -> Result<TrainingOutcome, TrainingError> {
    if rows.is_empty() {
        return Err(TrainingError::NoRows);
    }

    info!(
        rows = rows.len(),
        k = config.k,
        features = ?feature_set.column_names(),
        "training k-means"
    );

    let scaler = Standardizer::fit(feature_set, rows)?;
    let standardized = scaler.transform_batch(rows)?;

    let mut kmeans = KMeans::new(config.clone());
    let fit = kmeans.fit(&standardized)?;

    info!(
        inertia = fit.inertia,
        iterations = fit.iterations,
        sizes = ?fit.cluster_sizes(),
        "k-means converged"
    );

    Ok(TrainingOutcome {
        scaler,
        fit,
        config,
    })
}

#[derive(Debug, Clone)]
pub struct ClusterSummary {
    pub cluster: usize,
    pub size: usize,
    /// Centroid in raw ADC / gyro units
    pub centroid: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct ClusterReport {
    pub columns: Vec<String>,
    pub clusters: Vec<ClusterSummary>,
    pub inertia: f32,
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>7} {:>6}", "cluster", "rows")?;
        for col in &self.columns {
            write!(f, " {:>8}", col)?;
        }
        writeln!(f)?;

        for c in &self.clusters {
            write!(f, "{:>7} {:>6}", c.cluster, c.size)?;
            for v in &c.centroid {
                write!(f, " {:>8.1}", v)?;
            }
            writeln!(f)?;
        }
        write!(f, "inertia: {:.3}", self.inertia)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_groups() -> Vec<Vec<f32>> {
        (0..20)
            .map(|i| {
                let bent = if i < 10 { 900.0 } else { 150.0 };
                // Only the thumb column separates the groups
                vec![bent + (i % 3) as f32, 200.0, 210.0, 190.0, 205.0]
            })
            .collect()
    }

    #[test]
    fn report_centroids_are_in_raw_units() {
        let outcome = fit_pipeline(
            FeatureSet::Flex,
            &two_groups(),
            KMeansConfig {
                k: 2,
                ..KMeansConfig::default()
            },
        )
        .unwrap();

        let report = outcome.report();
        assert_eq!(report.clusters.len(), 2);
        assert!(report.clusters.iter().all(|c| c.size == 10));

        let mut thumbs: Vec<f32> = report.clusters.iter().map(|c| c.centroid[0]).collect();
        thumbs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((thumbs[0] - 151.0).abs() < 2.0);
        assert!((thumbs[1] - 901.0).abs() < 2.0);

        let text = report.to_string();
        assert!(text.contains("Thumb"));
        assert!(text.contains("inertia"));
    }

    #[test]
    fn empty_training_set_is_rejected() {
        assert_eq!(
            fit_pipeline(FeatureSet::Flex, &[], KMeansConfig::default()).unwrap_err(),
            TrainingError::NoRows
        );
    }
}
