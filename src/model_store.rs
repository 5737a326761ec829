//! Paired persistence of the standardizer and the cluster model.
//!
//! Both artifacts are written with the same `run_id`; loading refuses a pair
//! that did not come out of the same training run.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::kmeans::{ClusterModel, KMeansConfig};
use crate::pipeline::TrainedPipeline;
use crate::standardizer::Standardizer;

pub const ARTIFACT_VERSION: u32 = 1;
pub const SCALER_FILE: &str = "scaler.json";
pub const MODEL_FILE: &str = "kmeans.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("artifact missing: {0}")]
    Missing(PathBuf),

    #[error("artifact corrupt: {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("artifact {path} has format version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("artifact {path} holds a {found:?}, expected a {expected:?}")]
    WrongKind {
        path: PathBuf,
        found: ArtifactKind,
        expected: ArtifactKind,
    },

    #[error("scaler run {scaler} does not match model run {model}; retrain or restore both")]
    Unpaired { scaler: String, model: String },

    #[error("artifacts are inconsistent: {0}")]
    Inconsistent(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Scaler,
    ClusterModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArtifactHeader {
    format_version: u32,
    run_id: String,
    kind: ArtifactKind,
}

#[derive(Debug, Serialize, Deserialize)]
struct ScalerArtifact {
    header: ArtifactHeader,
    scaler: Standardizer,
}

#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact {
    header: ArtifactHeader,
    config: KMeansConfig,
    training_rows: usize,
    model: ClusterModel,
}

/// Directory holding one `scaler.json` + `kmeans.json` pair.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn scaler_path(&self) -> PathBuf {
        self.dir.join(SCALER_FILE)
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Writes both artifacts under a fresh run id and returns the id.
    pub fn save(
        &self,
        scaler: &Standardizer,
        model: &ClusterModel,
        config: &KMeansConfig,
        training_rows: usize,
    ) -> Result<String, StoreError> {
        if scaler.dims() != model.dims() {
            return Err(StoreError::Inconsistent(format!(
                "scaler has {} features, centroids have {}",
                scaler.dims(),
                model.dims()
            )));
        }

        fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let run_id = format!("{:016x}", rand::random::<u64>());
        let header = |kind| ArtifactHeader {
            format_version: ARTIFACT_VERSION,
            run_id: run_id.clone(),
            kind,
        };

        let scaler_tmp = write_tmp(
            &self.scaler_path(),
            &ScalerArtifact {
                header: header(ArtifactKind::Scaler),
                scaler: scaler.clone(),
            },
        )?;
        let model_tmp = write_tmp(
            &self.model_path(),
            &ModelArtifact {
                header: header(ArtifactKind::ClusterModel),
                config: config.clone(),
                training_rows,
                model: model.clone(),
            },
        )?;

        // Both files are complete before either replaces the old pair
        promote(&scaler_tmp, &self.scaler_path())?;
        promote(&model_tmp, &self.model_path())?;

        info!(run_id = %run_id, dir = %self.dir.display(), "saved scaler + k-means artifacts");
        Ok(run_id)
    }

    /// Loads the pair. Fails if either file is missing, unreadable, from
    /// another format version, or from another training run.
    pub fn load(&self) -> Result<TrainedPipeline, StoreError> {
        let scaler_path = self.scaler_path();
        let model_path = self.model_path();

        // Check both before parsing either
        for path in [&scaler_path, &model_path] {
            if !path.is_file() {
                return Err(StoreError::Missing(path.clone()));
            }
        }

        let scaler: ScalerArtifact = read_artifact(&scaler_path, ArtifactKind::Scaler)?;
        let model: ModelArtifact = read_artifact(&model_path, ArtifactKind::ClusterModel)?;

        if scaler.header.run_id != model.header.run_id {
            return Err(StoreError::Unpaired {
                scaler: scaler.header.run_id,
                model: model.header.run_id,
            });
        }

        if !scaler.scaler.is_consistent() {
            return Err(StoreError::Inconsistent(
                "scaler mean/scale do not match its feature set".into(),
            ));
        }
        if !model.model.is_consistent() {
            return Err(StoreError::Inconsistent("centroids are ragged or empty".into()));
        }
        if scaler.scaler.dims() != model.model.dims() {
            return Err(StoreError::Inconsistent(format!(
                "scaler has {} features, centroids have {}",
                scaler.scaler.dims(),
                model.model.dims()
            )));
        }

        info!(
            run_id = %scaler.header.run_id,
            k = model.model.k(),
            features = ?scaler.scaler.feature_set(),
            "loaded trained pipeline"
        );

        Ok(TrainedPipeline::new(
            scaler.header.run_id,
            scaler.scaler,
            model.model,
        ))
    }
}

fn write_tmp<T: Serialize>(target: &Path, artifact: &T) -> Result<PathBuf, StoreError> {
    let tmp = target.with_extension("json.tmp");
    let io_err = |source| StoreError::Io {
        path: tmp.clone(),
        source,
    };

    let file = File::create(&tmp).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, artifact).map_err(|source| StoreError::Corrupt {
        path: tmp.clone(),
        source,
    })?;
    writer.flush().map_err(io_err)?;
    Ok(tmp)
}

fn promote(tmp: &Path, target: &Path) -> Result<(), StoreError> {
    fs::rename(tmp, target).map_err(|source| StoreError::Io {
        path: target.to_path_buf(),
        source,
    })
}

fn read_artifact<T: DeserializeOwned>(path: &Path, expected: ArtifactKind) -> Result<T, StoreError> {
    let corrupt = |source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_json::Value = serde_json::from_reader(BufReader::new(file)).map_err(corrupt)?;

    // Header first, so a format bump reports as a version error and not as garbage
    let header: ArtifactHeader =
        serde_json::from_value(value.get("header").cloned().unwrap_or_default()).map_err(corrupt)?;

    if header.format_version != ARTIFACT_VERSION {
        return Err(StoreError::VersionMismatch {
            path: path.to_path_buf(),
            found: header.format_version,
            expected: ARTIFACT_VERSION,
        });
    }
    if header.kind != expected {
        return Err(StoreError::WrongKind {
            path: path.to_path_buf(),
            found: header.kind,
            expected,
        });
    }

    serde_json::from_value(value).map_err(corrupt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmeans::KMeans;
    use crate::types::FeatureSet;
    use tempfile::tempdir;

    fn fitted() -> (Standardizer, ClusterModel, KMeansConfig) {
        let rows: Vec<Vec<f32>> = (0..30)
            .map(|i| {
                let base = if i % 2 == 0 { 100.0 } else { 800.0 };
                vec![base + i as f32, 300.0, 300.0 - i as f32, base, 420.0]
            })
            .collect();
        let scaler = Standardizer::fit(FeatureSet::Flex, &rows).unwrap();
        let z = scaler.transform_batch(&rows).unwrap();
        let config = KMeansConfig {
            k: 2,
            ..KMeansConfig::default()
        };
        let fit = KMeans::new(config.clone()).fit(&z).unwrap();
        (scaler, fit.model, config)
    }

    #[test]
    fn save_then_load_reproduces_predictions() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, model, config) = fitted();

        let run_id = store.save(&scaler, &model, &config, 30).unwrap();
        let loaded = store.load().unwrap();

        assert_eq!(loaded.run_id(), run_id);
        assert_eq!(loaded.feature_set(), FeatureSet::Flex);
        assert_eq!(loaded.model().k(), model.k());

        let readings = [
            [105.0, 300.0, 290.0, 100.0, 420.0],
            [790.0, 300.0, 280.0, 800.0, 420.0],
            [450.0, 310.0, 300.0, 450.0, 400.0],
        ];
        for reading in readings {
            let z = scaler.transform(&reading).unwrap();
            assert_eq!(
                loaded.classify_features(&reading).unwrap(),
                model.predict(&z).unwrap()
            );
        }
    }

    #[test]
    fn missing_half_of_the_pair_is_refused() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, model, config) = fitted();
        store.save(&scaler, &model, &config, 30).unwrap();

        fs::remove_file(store.model_path()).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Missing(p)) if p == store.model_path()));
    }

    #[test]
    fn artifacts_from_different_runs_are_unpaired() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, model, config) = fitted();

        store.save(&scaler, &model, &config, 30).unwrap();
        let old_scaler = fs::read(store.scaler_path()).unwrap();
        store.save(&scaler, &model, &config, 30).unwrap();
        fs::write(store.scaler_path(), old_scaler).unwrap();

        assert!(matches!(store.load(), Err(StoreError::Unpaired { .. })));
    }

    #[test]
    fn corrupt_and_version_mismatched_artifacts() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, model, config) = fitted();
        store.save(&scaler, &model, &config, 30).unwrap();

        let original = fs::read_to_string(store.model_path()).unwrap();
        let bumped = original.replace(
            &format!("\"format_version\": {}", ARTIFACT_VERSION),
            "\"format_version\": 99",
        );
        fs::write(store.model_path(), bumped).unwrap();
        assert!(matches!(
            store.load(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));

        fs::write(store.model_path(), "{ not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn swapped_files_report_the_wrong_kind() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, model, config) = fitted();
        store.save(&scaler, &model, &config, 30).unwrap();

        let scaler_json = fs::read(store.scaler_path()).unwrap();
        let model_json = fs::read(store.model_path()).unwrap();
        fs::write(store.scaler_path(), model_json).unwrap();
        fs::write(store.model_path(), scaler_json).unwrap();

        assert!(matches!(
            store.load(),
            Err(StoreError::WrongKind {
                found: ArtifactKind::ClusterModel,
                expected: ArtifactKind::Scaler,
                ..
            })
        ));
    }

    #[test]
    fn feature_count_mismatch_is_inconsistent() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path());
        let (scaler, _, config) = fitted();

        let gyro_centroids = ClusterModel::from_centroids(vec![vec![0.0; 8], vec![1.0; 8]]);
        assert!(matches!(
            store.save(&scaler, &gyro_centroids, &config, 30),
            Err(StoreError::Inconsistent(_))
        ));
        assert!(!store.scaler_path().exists());
        assert!(!store.model_path().exists());

        // Same run id on both files, but the centroids lost a column
        let (scaler, model, config) = fitted();
        store.save(&scaler, &model, &config, 30).unwrap();
        let mut artifact: serde_json::Value =
            serde_json::from_slice(&fs::read(store.model_path()).unwrap()).unwrap();
        for centroid in artifact["model"]["centroids"].as_array_mut().unwrap() {
            centroid.as_array_mut().unwrap().pop();
        }
        fs::write(store.model_path(), serde_json::to_vec(&artifact).unwrap()).unwrap();

        assert!(matches!(store.load(), Err(StoreError::Inconsistent(_))));
    }

    #[test]
    fn empty_directory_reports_missing_scaler() {
        let dir = tempdir().unwrap();
        let store = ModelStore::new(dir.path().join("nope"));
        assert!(matches!(store.load(), Err(StoreError::Missing(_))));
    }
}
