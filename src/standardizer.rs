use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::FeatureSet;

/// Std below this is treated as a constant column.
const MIN_SCALE: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScalerError {
    #[error("cannot fit a standardizer on an empty matrix")]
    Empty,

    #[error("dimensionality mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("non-finite value in column {column}")]
    NonFinite { column: usize },
}

/// Per-column standardization learned once at training time.
///
/// Columns with zero variance keep a scale of 1.0, so they transform to
/// `x - mean` instead of dividing by zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Standardizer {
    feature_set: FeatureSet,
    columns: Vec<String>,
    mean: Vec<f32>,
    scale: Vec<f32>,
}

impl Standardizer {
    /// Population mean / std (ddof = 0) per column.
    pub fn fit(feature_set: FeatureSet, rows: &[Vec<f32>]) -> Result<Self, ScalerError> {
        let dims = feature_set.dims();
        if rows.is_empty() {
            return Err(ScalerError::Empty);
        }

        let mut sum = vec![0.0f64; dims];
        for row in rows {
            check_dims(dims, row)?;
            for (col, (acc, &x)) in sum.iter_mut().zip(row).enumerate() {
                if !x.is_finite() {
                    return Err(ScalerError::NonFinite { column: col });
                }
                *acc += x as f64;
            }
        }

        let n = rows.len() as f64;
        let mean: Vec<f64> = sum.iter().map(|s| s / n).collect();

        let mut sq = vec![0.0f64; dims];
        for row in rows {
            for (acc, (&x, m)) in sq.iter_mut().zip(row.iter().zip(&mean)) {
                let d = x as f64 - m;
                *acc += d * d;
            }
        }

        let scale = sq
            .iter()
            .map(|s| {
                let std = (s / n).sqrt();
                if std < MIN_SCALE {
                    1.0
                } else {
                    std as f32
                }
            })
            .collect();

        Ok(Self {
            feature_set,
            columns: feature_set
                .column_names()
                .into_iter()
                .map(String::from)
                .collect(),
            mean: mean.into_iter().map(|m| m as f32).collect(),
            scale,
        })
    }

    pub fn feature_set(&self) -> FeatureSet {
        self.feature_set
    }

    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn mean(&self) -> &[f32] {
        &self.mean
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    /// `(x - mean) / scale` per column.
    pub fn transform(&self, row: &[f32]) -> Result<Vec<f32>, ScalerError> {
        check_dims(self.dims(), row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| (x - m) / s)
            .collect())
    }

    pub fn transform_batch(&self, rows: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, ScalerError> {
        rows.iter().map(|row| self.transform(row)).collect()
    }

    /// Back to raw sensor units (used to report centroids).
    pub fn inverse_transform(&self, row: &[f32]) -> Result<Vec<f32>, ScalerError> {
        check_dims(self.dims(), row)?;
        Ok(row
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(z, (m, s))| z * s + m)
            .collect())
    }

    /// Checks the internal vectors agree after deserialization.
    pub(crate) fn is_consistent(&self) -> bool {
        let dims = self.feature_set.dims();
        self.mean.len() == dims
            && self.scale.len() == dims
            && self.columns.len() == dims
            && self.scale.iter().all(|s| s.is_finite() && *s > 0.0)
    }
}

fn check_dims(expected: usize, row: &[f32]) -> Result<(), ScalerError> {
    if row.len() != expected {
        return Err(ScalerError::DimensionMismatch {
            expected,
            actual: row.len(),
        });
    }
    Ok(())
}
