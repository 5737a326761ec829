use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flex sensors, one per finger
pub const NUM_FLEX: usize = 5;
/// Gyroscope axes
pub const NUM_GYRO: usize = 3;
/// Values in a full sample: 5 flex + 3 gyro
pub const SAMPLE_WIDTH: usize = NUM_FLEX + NUM_GYRO;

/// Dataset column names, in feature order.
pub const FLEX_COLUMNS: [&str; NUM_FLEX] = ["Thumb", "Index", "Middle", "Ring", "Pinky"];
pub const GYRO_COLUMNS: [&str; NUM_GYRO] = ["GyroX", "GyroY", "GyroZ"];

/// One reading from the glove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sample {
    /// Raw ADC counts: [thumb, index, middle, ring, pinky]
    pub flex: [u32; NUM_FLEX],
    /// Signed angular rates, absent when the source only carries flex values
    pub gyro: Option<[i32; NUM_GYRO]>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("feature set {feature_set:?} needs gyro values but the sample has none")]
pub struct MissingGyro {
    pub feature_set: FeatureSet,
}

impl Sample {
    pub fn new(flex: [u32; NUM_FLEX], gyro: Option<[i32; NUM_GYRO]>) -> Self {
        Self { flex, gyro }
    }

    /// All-zero flex means the glove sent no signal.
    pub fn is_flex_silent(&self) -> bool {
        self.flex.iter().all(|&v| v == 0)
    }

    /// Projects the sample onto the active feature set
    pub fn features(&self, feature_set: FeatureSet) -> Result<Vec<f32>, MissingGyro> {
        let mut out = Vec::with_capacity(feature_set.dims());
        out.extend(self.flex.iter().map(|&v| v as f32));

        if feature_set.uses_gyro() {
            let gyro = self.gyro.ok_or(MissingGyro { feature_set })?;
            out.extend(gyro.iter().map(|&v| v as f32));
        }

        Ok(out)
    }
}

/// Which sensor channels feed the model. Fixed at fit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeatureSet {
    #[default]
    Flex,
    FlexGyro,
}

impl FeatureSet {
    pub fn from_use_gyro(use_gyro: bool) -> Self {
        if use_gyro {
            FeatureSet::FlexGyro
        } else {
            FeatureSet::Flex
        }
    }

    pub fn uses_gyro(self) -> bool {
        matches!(self, FeatureSet::FlexGyro)
    }

    pub fn dims(self) -> usize {
        match self {
            FeatureSet::Flex => NUM_FLEX,
            FeatureSet::FlexGyro => SAMPLE_WIDTH,
        }
    }

    pub fn column_names(self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = FLEX_COLUMNS.to_vec();
        if self.uses_gyro() {
            names.extend(GYRO_COLUMNS);
        }
        names
    }
}
