//! Disk-backed word assigner.
//!
//! The vocabulary-construction collaborator writes one word-map artifact
//! per image, mirroring the dataset's relative layout under a root
//! directory. This adapter resolves an image path to its artifact, loads
//! it, and validates it against the vocabulary and assignment options
//! before handing it to the feature builder.

use spm_core::{AssignOptions, FeatureError, FeatureResult, Vocabulary, WordAssigner, WordMap};
use std::path::{Path, PathBuf};

use crate::artifacts;

/// Extension carried by word-map artifacts
const WORDMAP_EXTENSION: &str = "wmap";

/// `WordAssigner` reading precomputed word maps from disk.
#[derive(Debug, Clone)]
pub struct DiskWordmaps {
    root: PathBuf,
}

impl DiskWordmaps {
    /// Create an assigner rooted at the word-map directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Artifact path for an image: same relative path, `.wmap` extension.
    pub fn wordmap_path(&self, image: &Path) -> PathBuf {
        self.root.join(image).with_extension(WORDMAP_EXTENSION)
    }
}

impl WordAssigner for DiskWordmaps {
    fn assign_words(
        &self,
        image: &Path,
        vocabulary: &Vocabulary,
        options: &AssignOptions,
    ) -> FeatureResult<WordMap> {
        let path = self.wordmap_path(image);
        let map = artifacts::load_wordmap(&path)
            .map_err(|e| FeatureError::Assign(format!("{}: {}", path.display(), e)))?;

        map.validate_words(vocabulary.size())?;
        if map.candidates_per_pixel() != options.neighbor_count {
            return Err(FeatureError::Assign(format!(
                "{}: expected {} candidates per pixel, found {}",
                path.display(),
                options.neighbor_count,
                map.candidates_per_pixel()
            )));
        }
        Ok(map)
    }
}
