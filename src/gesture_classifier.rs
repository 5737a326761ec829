use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::gesture_map::{GestureLabel, GestureMap, GestureMapError};
use crate::model_store::{ModelStore, StoreError};
use crate::pipeline::{PipelineError, TrainedPipeline};
use crate::types::Sample;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("model artifacts: {0}")]
    Store(#[from] StoreError),

    #[error("gesture map: {0}")]
    Map(#[from] GestureMapError),
}

/// Frozen pipeline plus the cluster → gesture table written for it.
#[derive(Debug, Clone)]
pub struct GestureClassifier {
    pipeline: Arc<TrainedPipeline>,
    map: GestureMap,
}

impl GestureClassifier {
    pub fn new(pipeline: Arc<TrainedPipeline>, map: GestureMap) -> Self {
        match map.model_run_id() {
            Some(id) if id != pipeline.run_id() => warn!(
                map_run = id,
                model_run = pipeline.run_id(),
                "gesture map was written for another training run; cluster indices may not match"
            ),
            None => warn!("gesture map does not name a training run; assuming it matches"),
            _ => {}
        }

        let unmapped = map.unmapped(pipeline.model().k());
        if !unmapped.is_empty() {
            warn!(?unmapped, "clusters without a gesture will be reported as unknown");
        }

        Self { pipeline, map }
    }

    /// Loads the artifacts in `models_dir` and the map at `map_path`, or the
    /// built-in table when no path is given.
    pub fn load(models_dir: &Path, map_path: Option<&Path>) -> Result<Self, ClassifierError> {
        let pipeline = ModelStore::new(models_dir).load()?;
        let map = match map_path {
            Some(path) => GestureMap::from_json(path)?,
            None => GestureMap::default(),
        };

        info!(
            run_id = pipeline.run_id(),
            k = pipeline.model().k(),
            features = ?pipeline.feature_set(),
            gestures = map.len(),
            "classifier ready"
        );
        Ok(Self::new(Arc::new(pipeline), map))
    }

    pub fn pipeline(&self) -> &Arc<TrainedPipeline> {
        &self.pipeline
    }

    pub fn map(&self) -> &GestureMap {
        &self.map
    }

    pub fn classify(&self, sample: &Sample) -> Result<GestureLabel, PipelineError> {
        let cluster = self.pipeline.classify_sample(sample)?;
        Ok(self.map.lookup(cluster))
    }

    pub fn classify_features(&self, features: &[f32]) -> Result<GestureLabel, PipelineError> {
        let cluster = self.pipeline.classify_features(features)?;
        Ok(self.map.lookup(cluster))
    }
}
