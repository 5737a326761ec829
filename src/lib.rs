//! Flex-sensor glove gesture pipeline: sample ingestion, standardization,
//! k-means clustering, paired model artifacts, a hand-curated cluster →
//! gesture table and a real-time loop that sends `PLAY:<n>` commands.

pub mod actuator;
pub mod capture;
pub mod config;
pub mod csv_loader;
pub mod gesture_classifier;
pub mod gesture_map;
pub mod inference;
pub mod kmeans;
pub mod model_store;
pub mod pipeline;
pub mod sample_parser;
pub mod source;
pub mod standardizer;
pub mod training;
pub mod types;
