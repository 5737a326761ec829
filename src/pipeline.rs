use thiserror::Error;

use crate::kmeans::{ClusterModel, ModelError};
use crate::standardizer::{ScalerError, Standardizer};
use crate::types::{FeatureSet, MissingGyro, Sample};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    MissingGyro(#[from] MissingGyro),

    #[error("feature pipeline: {0}")]
    Scaler(#[from] ScalerError),

    #[error("cluster model: {0}")]
    Model(#[from] ModelError),
}

impl PipelineError {
    /// The sample or model changed shape since training.
    pub fn is_dimension_mismatch(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingGyro(_)
                | PipelineError::Scaler(ScalerError::DimensionMismatch { .. })
                | PipelineError::Model(ModelError::DimensionMismatch { .. })
        )
    }
}

/// Standardizer and cluster model from the same training run.
///
/// Immutable once built; share it between loops behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedPipeline {
    run_id: String,
    standardizer: Standardizer,
    model: ClusterModel,
}

impl TrainedPipeline {
    pub(crate) fn new(run_id: String, standardizer: Standardizer, model: ClusterModel) -> Self {
        Self {
            run_id,
            standardizer,
            model,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn standardizer(&self) -> &Standardizer {
        &self.standardizer
    }

    pub fn model(&self) -> &ClusterModel {
        &self.model
    }

    pub fn feature_set(&self) -> FeatureSet {
        self.standardizer.feature_set()
    }

    /// Raw feature vector → cluster index.
    pub fn classify_features(&self, features: &[f32]) -> Result<usize, PipelineError> {
        let z = self.standardizer.transform(features)?;
        Ok(self.model.predict(&z)?)
    }

    pub fn classify_sample(&self, sample: &Sample) -> Result<usize, PipelineError> {
        let features = sample.features(self.feature_set())?;
        self.classify_features(&features)
    }
}
