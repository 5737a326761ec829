//! Application settings, loaded from an optional JSON file and then
//! overridden from the command line.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::LoopConfig;
use crate::kmeans::KMeansConfig;
use crate::source::SerialConfig;
use crate::types::FeatureSet;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot read config file {path:?}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    fn invalid_value(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    pub kmeans: KMeansConfig,
    /// Cluster on flex + gyro instead of flex only
    pub use_gyro: bool,
}

impl TrainingSettings {
    pub fn feature_set(&self) -> FeatureSet {
        FeatureSet::from_use_gyro(self.use_gyro)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding `scaler.json` and `kmeans.json`
    pub models_dir: PathBuf,
    /// Cluster → gesture table; the built-in table is used when unset
    pub gesture_map: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            gesture_map: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub serial: SerialConfig,
    pub training: TrainingSettings,
    pub inference: LoopConfig,
    pub paths: PathsConfig,
}

impl AppConfig {
    /// Reads and validates a JSON config. Missing sections and fields take
    /// their defaults.
    pub fn from_json(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: AppConfig = serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Returns the first incoherent setting, if any.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::invalid_value("serial.port", "must not be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::invalid_value("serial.baud_rate", "must be > 0"));
        }
        if self.serial.read_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "serial.read_timeout_ms",
                "must be > 0 so shutdown is observed",
            ));
        }

        let km = &self.training.kmeans;
        if km.k == 0 {
            return Err(ConfigError::invalid_value("training.kmeans.k", "must be > 0"));
        }
        if km.max_iter == 0 {
            return Err(ConfigError::invalid_value("training.kmeans.max_iter", "must be > 0"));
        }
        if km.n_init == 0 {
            return Err(ConfigError::invalid_value("training.kmeans.n_init", "must be > 0"));
        }
        if !km.tol.is_finite() || km.tol < 0.0 {
            return Err(ConfigError::invalid_value(
                "training.kmeans.tol",
                format!("must be finite and >= 0, got {}", km.tol),
            ));
        }

        if self.inference.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid_value(
                "inference.max_consecutive_failures",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_parser::{LineSchema, SampleParser};

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.training.kmeans.k, 6);
        assert_eq!(cfg.training.feature_set(), FeatureSet::Flex);
        assert_eq!(cfg.inference.max_consecutive_failures, 10);
        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("glove.json");
        std::fs::write(
            &path,
            r#"{ "serial": { "port": "COM5" }, "training": { "kmeans": { "k": 4 }, "use_gyro": true } }"#,
        )
        .unwrap();

        let cfg = AppConfig::from_json(&path).unwrap();
        assert_eq!(cfg.serial.port, "COM5");
        assert_eq!(cfg.serial.baud_rate, 115_200);
        assert_eq!(cfg.training.kmeans.k, 4);
        assert_eq!(cfg.training.kmeans.seed, 42);
        assert_eq!(cfg.training.feature_set(), FeatureSet::FlexGyro);
    }

    #[test]
    fn line_schema_selects_the_live_format() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.serial.line_schema, LineSchema::FIRMWARE);
        let firmware = SampleParser::new(cfg.serial.line_schema);
        assert!(firmware.parse("600,100,120,110,95,5,-3,2").is_none());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.json");
        std::fs::write(
            &path,
            r#"{ "serial": { "line_schema": { "skip_prefix": 0, "require_gyro": false } } }"#,
        )
        .unwrap();

        let cfg = AppConfig::from_json(&path).unwrap();
        assert_eq!(cfg.serial.line_schema, LineSchema::BARE);
        assert_eq!(cfg.serial.baud_rate, 115_200);

        let sample = SampleParser::new(cfg.serial.line_schema)
            .parse("600,100,120,110,95,5,-3,2")
            .unwrap();
        assert_eq!(sample.flex, [600, 100, 120, 110, 95]);
        assert_eq!(sample.gyro, Some([5, -3, 2]));
    }

    #[test]
    fn rejects_zero_clusters() {
        let mut cfg = AppConfig::default();
        cfg.training.kmeans.k = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue {
                field: "training.kmeans.k",
                ..
            })
        ));
    }

    #[test]
    fn unreadable_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            AppConfig::from_json(&dir.path().join("missing.json")),
            Err(ConfigError::FileRead { .. })
        ));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ serial: ").unwrap();
        assert!(matches!(
            AppConfig::from_json(&bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
