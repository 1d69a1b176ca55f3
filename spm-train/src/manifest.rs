//! Ordered dataset manifests: image paths paired with class labels.
//!
//! Entry order is significant - feature rows and labels stay aligned with
//! it through every pipeline stage.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

/// Errors in manifest loading and construction
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Manifest paths ({paths}) and labels ({labels}) differ in length")]
    LengthMismatch { paths: usize, labels: usize },
}

/// Result type for manifest operations
pub type ManifestResult<T> = Result<T, ManifestError>;

/// One dataset entry: a relative image path and its class label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub label: u32,
}

/// An ordered list of dataset entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub entries: Vec<ManifestEntry>,
}

impl DatasetManifest {
    /// Build from an entry list.
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        Self { entries }
    }

    /// Build from parallel path and label vectors.
    pub fn from_pairs(paths: Vec<String>, labels: Vec<u32>) -> ManifestResult<Self> {
        if paths.len() != labels.len() {
            return Err(ManifestError::LengthMismatch {
                paths: paths.len(),
                labels: labels.len(),
            });
        }
        let entries = paths
            .into_iter()
            .zip(labels)
            .map(|(path, label)| ManifestEntry { path, label })
            .collect();
        Ok(Self { entries })
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the manifest holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Label vector in entry order
    pub fn labels(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.label).collect()
    }

    /// Smallest class count covering every label
    pub fn num_classes(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.label as usize + 1)
            .max()
            .unwrap_or(0)
    }

    /// Load from JSON.
    pub fn load_json<P: AsRef<Path>>(path: P) -> ManifestResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Save to JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ManifestResult<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
