//! Hand-curated cluster → gesture table.
//!
//! k-means gives no meaning to its indices and they are not stable across
//! retraining, so the table records the run it was written for and has to be
//! regenerated after every `train`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::ActuationCommand;

pub const UNKNOWN_GESTURE: &str = "unknown";

#[derive(Error, Debug)]
pub enum GestureMapError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("invalid cluster index {0:?}")]
    InvalidIndex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GestureEntry {
    pub gesture: String,
    /// Audio clip to play; `None` maps the cluster to a silent gesture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clip: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GestureMapJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model_run_id: Option<String>,
    clusters: BTreeMap<String, GestureEntry>,
}

/// Result of mapping one cluster index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GestureLabel {
    pub cluster: usize,
    pub name: String,
    pub command: Option<ActuationCommand>,
}

impl GestureLabel {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_GESTURE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GestureMap {
    model_run_id: Option<String>,
    entries: BTreeMap<usize, GestureEntry>,
}

impl GestureMap {
    pub fn new(model_run_id: Option<String>) -> Self {
        Self {
            model_run_id,
            entries: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, cluster: usize, gesture: &str, clip: Option<u16>) -> Self {
        self.insert(cluster, gesture, clip);
        self
    }

    pub fn insert(&mut self, cluster: usize, gesture: &str, clip: Option<u16>) {
        self.entries.insert(
            cluster,
            GestureEntry {
                gesture: gesture.to_string(),
                clip,
            },
        );
    }

    pub fn model_run_id(&self) -> Option<&str> {
        self.model_run_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total over all indices; unmapped clusters come back as `unknown`
    /// with no command.
    pub fn lookup(&self, cluster: usize) -> GestureLabel {
        match self.entries.get(&cluster) {
            Some(entry) => GestureLabel {
                cluster,
                name: entry.gesture.clone(),
                command: entry.clip.map(ActuationCommand::Play),
            },
            None => GestureLabel {
                cluster,
                name: UNKNOWN_GESTURE.to_string(),
                command: None,
            },
        }
    }

    /// Cluster indices in `0..k` with no entry.
    pub fn unmapped(&self, k: usize) -> Vec<usize> {
        (0..k).filter(|c| !self.entries.contains_key(c)).collect()
    }

    pub fn from_json(path: impl AsRef<Path>) -> Result<Self, GestureMapError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, GestureMapError> {
        let data: GestureMapJson = serde_json::from_str(content)?;

        let mut entries = BTreeMap::new();
        for (key, entry) in data.clusters {
            let idx = key
                .trim()
                .parse::<usize>()
                .map_err(|_| GestureMapError::InvalidIndex(key.clone()))?;
            entries.insert(idx, entry);
        }

        Ok(Self {
            model_run_id: data.model_run_id,
            entries,
        })
    }

    pub fn to_json_string(&self) -> Result<String, GestureMapError> {
        let data = GestureMapJson {
            model_run_id: self.model_run_id.clone(),
            clusters: self
                .entries
                .iter()
                .map(|(idx, entry)| (idx.to_string(), entry.clone()))
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&data)?)
    }

    pub fn to_json(&self, path: impl AsRef<Path>) -> Result<(), GestureMapError> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }
}

impl Default for GestureMap {
    /// Table from the reference six-gesture training session (k = 6).
    fn default() -> Self {
        GestureMap::new(None)
            .with_entry(5, "thumb_bent", Some(1))
            .with_entry(1, "index_bent", Some(2))
            .with_entry(4, "middle_bent", Some(3))
            .with_entry(0, "ring_bent", Some(4))
            .with_entry(3, "pinky_bent", Some(5))
            .with_entry(2, "all_bent", Some(6))
    }
}
