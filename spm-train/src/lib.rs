//! # spm-train
//!
//! Training and evaluation orchestration for spatial-pyramid scene
//! recognition.
//!
//! This crate provides:
//! - `RecognitionConfig` - the experiment configuration surface, validated
//!   once at startup
//! - `DatasetManifest` - ordered image/label lists driving both pipelines
//! - Artifact persistence for vocabularies, word maps, and trained banks
//! - `DiskWordmaps` - the production word assigner, reading precomputed
//!   word-map artifacts
//! - `train_bank` / `evaluate_bank` - parallel pipelines with exact
//!   worker-count control and manifest-order result collection
//!
//! The algorithmic core (pyramid features, metrics, nearest-neighbor
//! matching) lives in `spm-core`; this crate turns manifests into
//! artifacts.

pub mod adapter;
pub mod artifacts;
pub mod config;
pub mod manifest;
pub mod pipeline;

pub use adapter::DiskWordmaps;
pub use config::{ConfigError, RecognitionConfig};
pub use manifest::{DatasetManifest, ManifestEntry, ManifestError};
pub use pipeline::{
    compute_features, evaluate_bank, train_bank, ConfusionMatrix, EvaluationReport,
    Misclassification, PipelineError, PipelineResult,
};
