use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{Sample, NUM_FLEX, NUM_GYRO};

fn integer_token() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-?\d+").expect("static regex"))
}

fn labeled_flex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Thumb:(\d+)\s*\|\s*Index:(\d+)\s*\|\s*Middle:(\d+)\s*\|\s*Ring:(\d+)\s*\|\s*Pinky:(\d+)",
        )
        .expect("static regex")
    })
}

fn labeled_gyro() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Gyro X:(-?\d+)\s*Y:(-?\d+)\s*Z:(-?\d+)").expect("static regex")
    })
}

/// Layout of a raw line coming off the sample source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineSchema {
    /// Leading tokens to drop (the firmware prepends a timestamp)
    pub skip_prefix: usize,
    /// Lines without the three gyro values are rejected
    pub require_gyro: bool,
}

impl LineSchema {
    /// Timestamp + 5 flex + 3 gyro, as printed by the glove firmware.
    pub const FIRMWARE: LineSchema = LineSchema {
        skip_prefix: 1,
        require_gyro: true,
    };

    /// Bare `Thumb,Index,Middle,Ring,Pinky[,GyroX,GyroY,GyroZ]` records.
    pub const BARE: LineSchema = LineSchema {
        skip_prefix: 0,
        require_gyro: false,
    };

    pub fn min_tokens(&self) -> usize {
        self.skip_prefix + NUM_FLEX + if self.require_gyro { NUM_GYRO } else { 0 }
    }
}

impl Default for LineSchema {
    fn default() -> Self {
        Self::FIRMWARE
    }
}

/// Decodes raw text lines into samples. Stateless apart from the schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleParser {
    schema: LineSchema,
}

impl SampleParser {
    pub fn new(schema: LineSchema) -> Self {
        Self { schema }
    }

    pub fn schema(&self) -> LineSchema {
        self.schema
    }

    /// Extracts the integer tokens and decodes the fixed-width window after
    /// the prefix. The prefix and anything past the gyro triple are never
    /// parsed. `None` is the normal outcome for noise and partial reads.
    pub fn parse(&self, line: &str) -> Option<Sample> {
        let tokens: Vec<&str> = integer_token().find_iter(line).map(|m| m.as_str()).collect();

        if tokens.len() < self.schema.min_tokens() {
            return None;
        }

        let values = &tokens[self.schema.skip_prefix..];
        let mut flex = [0u32; NUM_FLEX];
        for (dst, token) in flex.iter_mut().zip(&values[..NUM_FLEX]) {
            // Negative or overflowing readings are noise, not a sample
            *dst = token.parse::<u32>().ok()?;
        }

        // Trailing tokens past the gyro triple are firmware drift and ignored
        let gyro = if values.len() >= NUM_FLEX + NUM_GYRO {
            let mut gyro = [0i32; NUM_GYRO];
            for (dst, token) in gyro.iter_mut().zip(&values[NUM_FLEX..NUM_FLEX + NUM_GYRO]) {
                *dst = token.parse::<i32>().ok()?;
            }
            Some(gyro)
        } else {
            None
        };

        Some(Sample { flex, gyro })
    }
}

/// Parses the firmware debug log format:
/// `Thumb:600 | Index:100 | Middle:120 | Ring:110 | Pinky:95 ... Gyro X:5 Y:-3 Z:2`.
/// Both groups must be present.
pub fn parse_labeled_line(line: &str) -> Option<Sample> {
    let flex_caps = labeled_flex().captures(line)?;
    let gyro_caps = labeled_gyro().captures(line)?;

    let mut flex = [0u32; NUM_FLEX];
    for (i, dst) in flex.iter_mut().enumerate() {
        *dst = flex_caps.get(i + 1)?.as_str().parse().ok()?;
    }

    let mut gyro = [0i32; NUM_GYRO];
    for (i, dst) in gyro.iter_mut().enumerate() {
        *dst = gyro_caps.get(i + 1)?.as_str().parse().ok()?;
    }

    Some(Sample::new(flex, Some(gyro)))
}
