//! # spm-core
//!
//! Bag-of-visual-words features pooled over a spatial pyramid.
//!
//! This crate provides:
//! - `Vocabulary` - the fixed set of filter-response centroids defining the word space
//! - `WordMap` - per-pixel visual-word assignments for one image
//! - `pyramid_feature` - hierarchical spatial-pyramid histogram construction
//! - `Metric` - the similarity engine (euclidean, intersect, chi2, correl)
//! - `classify` - nearest-neighbor matching against a `TrainedBank`
//!
//! ## Pipeline position
//!
//! ```text
//! Image → WordAssigner → WordMap → pyramid_feature → SPM feature → classify → label
//!        (external)                 (this crate)                   (this crate)
//! ```
//!
//! Raw filter responses, clustering, and image decoding all live behind the
//! `WordAssigner` seam. Same word map in, same feature out - deterministic.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors in feature construction and matching
#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("Empty vocabulary")]
    EmptyVocabulary,
    #[error("Invalid word map shape: {0}x{1}x{2}")]
    InvalidMapShape(usize, usize, usize),
    #[error("Word index {word} out of range for dictionary size {dict_size}")]
    WordOutOfRange { word: u32, dict_size: usize },
    #[error("Invalid layer count: {0} (expected >= 1)")]
    InvalidLayerCount(usize),
    #[error("Unknown distance metric: {0:?}")]
    UnknownMetric(String),
    #[error("Feature length mismatch: query {query}, references {reference}")]
    LengthMismatch { query: usize, reference: usize },
    #[error("Label count {labels} does not match feature rows {rows}")]
    LabelCountMismatch { labels: usize, rows: usize },
    #[error("Feature width {got} does not match pyramid length {expected}")]
    FeatureWidthMismatch { got: usize, expected: usize },
    #[error("Empty feature bank")]
    EmptyBank,
    #[error("Word assignment failed: {0}")]
    Assign(String),
}

/// Result type for feature operations
pub type FeatureResult<T> = Result<T, FeatureError>;

// ============================================================================
// Vocabulary
// ============================================================================

/// The visual-word dictionary: K centroids in filter-response space.
///
/// Built by an external collaborator and read-only for the lifetime of this
/// subsystem. Rows are centroids, columns are the stacked per-channel
/// responses (3F wide for F response channels).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocabulary {
    centers: Array2<f32>,
}

impl Vocabulary {
    /// Wrap a centroid matrix, rejecting empty dictionaries.
    pub fn new(centers: Array2<f32>) -> FeatureResult<Self> {
        if centers.nrows() == 0 || centers.ncols() == 0 {
            return Err(FeatureError::EmptyVocabulary);
        }
        Ok(Self { centers })
    }

    /// Dictionary size K
    pub fn size(&self) -> usize {
        self.centers.nrows()
    }

    /// Width of one centroid (3F for F response channels)
    pub fn response_dim(&self) -> usize {
        self.centers.ncols()
    }

    /// The centroid matrix
    pub fn centers(&self) -> ArrayView2<'_, f32> {
        self.centers.view()
    }
}

// ============================================================================
// Word Maps
// ============================================================================

/// Per-pixel visual-word assignments for one image.
///
/// Shape is `H x W x R`: R is the number of candidate words kept per pixel
/// (1 for plain nearest-centroid assignment, more when the assigner keeps
/// several nearest neighbors). Transient - created per image, dropped once
/// its feature is extracted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordMap {
    words: Array3<u32>,
}

impl WordMap {
    /// Single-candidate map from an `H x W` grid of word indices.
    pub fn from_grid(grid: Array2<u32>) -> Self {
        Self {
            words: grid.insert_axis(Axis(2)),
        }
    }

    /// Multi-candidate map from an `H x W x R` grid, `R >= 1`.
    pub fn from_candidates(words: Array3<u32>) -> FeatureResult<Self> {
        let (h, w, r) = words.dim();
        if r == 0 {
            return Err(FeatureError::InvalidMapShape(h, w, r));
        }
        Ok(Self { words })
    }

    /// Map height in pixels
    pub fn height(&self) -> usize {
        self.words.dim().0
    }

    /// Map width in pixels
    pub fn width(&self) -> usize {
        self.words.dim().1
    }

    /// Candidate words kept per pixel
    pub fn candidates_per_pixel(&self) -> usize {
        self.words.dim().2
    }

    /// True when the map holds no pixels
    pub fn is_empty(&self) -> bool {
        self.height() == 0 || self.width() == 0
    }

    /// The raw index grid
    pub fn words(&self) -> &Array3<u32> {
        &self.words
    }

    /// Check that every index is below the dictionary size.
    pub fn validate_words(&self, dict_size: usize) -> FeatureResult<()> {
        for &word in self.words.iter() {
            if word as usize >= dict_size {
                return Err(FeatureError::WordOutOfRange { word, dict_size });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Vocabulary Adapter Boundary
// ============================================================================

/// Options forwarded to the word assigner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignOptions {
    /// Number of nearest centroids kept per pixel
    pub neighbor_count: usize,
    /// Extra Sobel response channels enabled
    pub sobel: bool,
    /// Extra Prewitt response channels enabled
    pub prewitt: bool,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            neighbor_count: 1,
            sobel: false,
            prewitt: false,
        }
    }
}

impl AssignOptions {
    /// Set the nearest-neighbor count
    pub fn with_neighbors(mut self, neighbor_count: usize) -> Self {
        self.neighbor_count = neighbor_count;
        self
    }

    /// Toggle the Sobel response channels
    pub fn with_sobel(mut self, sobel: bool) -> Self {
        self.sobel = sobel;
        self
    }

    /// Toggle the Prewitt response channels
    pub fn with_prewitt(mut self, prewitt: bool) -> Self {
        self.prewitt = prewitt;
        self
    }
}

/// The external boundary that turns an image into a word map.
///
/// Implementations own image decoding, filter responses, and centroid
/// lookup. This crate only consumes the resulting index grid, so workers can
/// share one assigner immutably across threads.
pub trait WordAssigner: Send + Sync {
    /// Assign a visual word (or several candidates) to every pixel.
    fn assign_words(
        &self,
        image: &Path,
        vocabulary: &Vocabulary,
        options: &AssignOptions,
    ) -> FeatureResult<WordMap>;
}

// ============================================================================
// Bag-of-Words Histogram
// ============================================================================

/// Plain bag-of-words histogram over the whole map, normalized to sum 1.
///
/// This is the spatially-blind baseline feature; an all-zero vector is
/// returned for a degenerate map rather than dividing by zero.
pub fn word_histogram(map: &WordMap, dict_size: usize) -> FeatureResult<Array1<f32>> {
    let mut hist = Array1::<f32>::zeros(dict_size);
    for &word in map.words().iter() {
        if word as usize >= dict_size {
            return Err(FeatureError::WordOutOfRange { word, dict_size });
        }
        hist[word as usize] += 1.0;
    }
    let total = hist.sum();
    if total > 0.0 {
        hist /= total;
    }
    Ok(hist)
}

// ============================================================================
// Spatial Pyramid Feature
// ============================================================================

/// Length of a pyramid feature: `K * (4^L - 1) / 3`.
pub fn pyramid_feature_len(dict_size: usize, layers: usize) -> usize {
    dict_size * (4usize.pow(layers as u32) - 1) / 3
}

fn level_weight(level: usize, layers: usize) -> f32 {
    // Coarse-to-fine pooling: levels 0 and 1 share the smallest weight,
    // finer levels double it per level.
    if level <= 1 {
        2f32.powi(1 - layers as i32)
    } else {
        2f32.powi(level as i32 - layers as i32)
    }
}

/// Build the spatial-pyramid feature for one word map.
///
/// The map is partitioned into a `2^(L-1) x 2^(L-1)` grid of cells and a
/// length-K word count is taken per cell; every coarser level is then the
/// elementwise sum of its four children, so only the finest level ever
/// touches pixels. Cells are concatenated level 0 (coarsest) through L-1
/// (finest), row-major within each grid, scaled by the level weight, and the
/// whole vector is normalized to sum 1.
///
/// Trailing rows/columns that do not fill a whole cell are dropped. Every
/// candidate word of a multi-candidate map counts. A degenerate map (no
/// pixels, or smaller than the finest grid) yields the all-zero vector.
///
/// # Example
/// ```
/// use ndarray::Array2;
/// use spm_core::{pyramid_feature, WordMap};
///
/// let map = WordMap::from_grid(Array2::<u32>::zeros((4, 4)));
/// let feature = pyramid_feature(&map, 2, 4).unwrap();
/// assert_eq!(feature.len(), 20);
/// assert!((feature.sum() - 1.0).abs() < 1e-6);
/// ```
pub fn pyramid_feature(
    map: &WordMap,
    layers: usize,
    dict_size: usize,
) -> FeatureResult<Array1<f32>> {
    if layers == 0 {
        return Err(FeatureError::InvalidLayerCount(layers));
    }

    let grid = 1usize << (layers - 1);
    let cell_h = map.height() / grid;
    let cell_w = map.width() / grid;

    // Finest level: direct word counts per cell.
    let mut finest = Array3::<f32>::zeros((grid, grid, dict_size));
    if cell_h > 0 && cell_w > 0 {
        let words = map.words();
        for y in 0..grid * cell_h {
            for x in 0..grid * cell_w {
                for c in 0..map.candidates_per_pixel() {
                    let word = words[[y, x, c]];
                    if word as usize >= dict_size {
                        return Err(FeatureError::WordOutOfRange { word, dict_size });
                    }
                    finest[[y / cell_h, x / cell_w, word as usize]] += 1.0;
                }
            }
        }
    }

    // Coarser levels bottom-up: each cell is the sum of its four children.
    let mut levels: Vec<Array3<f32>> = Vec::with_capacity(layers);
    levels.push(finest);
    for _ in 1..layers {
        let finer = &levels[levels.len() - 1];
        let half = finer.dim().0 / 2;
        let mut coarser = Array3::<f32>::zeros((half, half, dict_size));
        for i in 0..half {
            for j in 0..half {
                let children = finer.slice(s![2 * i..2 * i + 2, 2 * j..2 * j + 2, ..]);
                let summed = children.sum_axis(Axis(0)).sum_axis(Axis(0));
                coarser.slice_mut(s![i, j, ..]).assign(&summed);
            }
        }
        levels.push(coarser);
    }
    levels.reverse(); // level 0 first

    // Weighted concatenation, then one global normalization.
    let mut feature = Array1::<f32>::zeros(pyramid_feature_len(dict_size, layers));
    let mut offset = 0;
    for (level, cells) in levels.iter().enumerate() {
        let weight = level_weight(level, layers);
        let side = cells.dim().0;
        for i in 0..side {
            for j in 0..side {
                let mut out = feature.slice_mut(s![offset..offset + dict_size]);
                out.assign(&cells.slice(s![i, j, ..]));
                out *= weight;
                offset += dict_size;
            }
        }
    }

    let total = feature.sum();
    if total > 0.0 {
        feature /= total;
    }
    Ok(feature)
}

// ============================================================================
// Similarity Engine
// ============================================================================

/// Distance/similarity metric between a query histogram and reference rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Per-row L2 distance (lower is more similar)
    Euclidean,
    /// Histogram intersection (higher is more similar)
    Intersect,
    /// Halved chi-squared distance (lower is more similar)
    Chi2,
    /// Normalized cross-correlation after mean-centering (higher is more similar)
    Correl,
}

impl Metric {
    /// Canonical configuration name
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Euclidean => "euclidean",
            Metric::Intersect => "intersect",
            Metric::Chi2 => "chi2",
            Metric::Correl => "correl",
        }
    }

    /// Whether a larger score denotes a better match.
    ///
    /// Distance metrics (`euclidean`, `chi2`) minimize; similarity metrics
    /// (`intersect`, `correl`) maximize. The classifier consults this
    /// instead of uniformly maximizing.
    pub fn higher_is_better(&self) -> bool {
        match self {
            Metric::Euclidean | Metric::Chi2 => false,
            Metric::Intersect | Metric::Correl => true,
        }
    }

    /// Score one query against every row of a reference matrix.
    pub fn scores(
        &self,
        query: ArrayView1<'_, f32>,
        references: ArrayView2<'_, f32>,
    ) -> FeatureResult<Array1<f32>> {
        if references.ncols() != query.len() {
            return Err(FeatureError::LengthMismatch {
                query: query.len(),
                reference: references.ncols(),
            });
        }
        let scores: Vec<f32> = references
            .outer_iter()
            .map(|row| self.score_pair(query, row))
            .collect();
        Ok(Array1::from_vec(scores))
    }

    fn score_pair(&self, q: ArrayView1<'_, f32>, r: ArrayView1<'_, f32>) -> f32 {
        match self {
            Metric::Euclidean => q
                .iter()
                .zip(r.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum::<f32>()
                .sqrt(),
            Metric::Intersect => q.iter().zip(r.iter()).map(|(a, b)| a.min(*b)).sum(),
            Metric::Chi2 => {
                // Coordinates where both sides are zero contribute nothing.
                let sum: f32 = q
                    .iter()
                    .zip(r.iter())
                    .filter(|(a, b)| **a + **b > 0.0)
                    .map(|(a, b)| (a - b) * (a - b) / (a + b))
                    .sum();
                sum / 2.0
            }
            Metric::Correl => {
                let qm = q.mean().unwrap_or(0.0);
                let rm = r.mean().unwrap_or(0.0);
                let mut num = 0.0;
                let mut qs = 0.0;
                let mut rs = 0.0;
                for (a, b) in q.iter().zip(r.iter()) {
                    let qa = a - qm;
                    let rb = b - rm;
                    num += qa * rb;
                    qs += qa * qa;
                    rs += rb * rb;
                }
                let den = (qs * rs).sqrt();
                if den > 0.0 {
                    num / den
                } else {
                    0.0
                }
            }
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = FeatureError;

    fn from_str(s: &str) -> FeatureResult<Self> {
        match s {
            "euclidean" => Ok(Metric::Euclidean),
            "intersect" => Ok(Metric::Intersect),
            "chi2" => Ok(Metric::Chi2),
            "correl" => Ok(Metric::Correl),
            other => Err(FeatureError::UnknownMetric(other.to_string())),
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Trained Bank
// ============================================================================

/// The trained recognition system: vocabulary, one pyramid feature per
/// training image, the parallel label vector, and the layer count the
/// features were built with. Built once, read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedBank {
    vocabulary: Vocabulary,
    features: Array2<f32>,
    labels: Vec<u32>,
    layer_num: usize,
}

impl TrainedBank {
    /// Assemble a bank, checking row/label alignment and feature width.
    pub fn new(
        vocabulary: Vocabulary,
        features: Array2<f32>,
        labels: Vec<u32>,
        layer_num: usize,
    ) -> FeatureResult<Self> {
        if layer_num == 0 {
            return Err(FeatureError::InvalidLayerCount(layer_num));
        }
        if features.nrows() != labels.len() {
            return Err(FeatureError::LabelCountMismatch {
                labels: labels.len(),
                rows: features.nrows(),
            });
        }
        let expected = pyramid_feature_len(vocabulary.size(), layer_num);
        if features.ncols() != expected {
            return Err(FeatureError::FeatureWidthMismatch {
                got: features.ncols(),
                expected,
            });
        }
        Ok(Self {
            vocabulary,
            features,
            labels,
            layer_num,
        })
    }

    /// The vocabulary the features were assigned against
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Reference feature matrix, one row per training image
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    /// Label vector parallel to the feature rows
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Pyramid layer count the features were built with
    pub fn layer_num(&self) -> usize {
        self.layer_num
    }

    /// Number of reference images
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when the bank holds no references
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Smallest class count covering every stored label
    pub fn num_classes(&self) -> usize {
        self.labels.iter().map(|&l| l as usize + 1).max().unwrap_or(0)
    }
}

// ============================================================================
// Nearest-Neighbor Classifier
// ============================================================================

/// Index of the best score under the metric's own extremum direction.
///
/// Ties keep the first occurrence. Returns `None` for an empty score vector.
pub fn best_index(metric: Metric, scores: ArrayView1<'_, f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        let better = match best {
            None => true,
            Some((_, current)) => {
                if metric.higher_is_better() {
                    score > current
                } else {
                    score < current
                }
            }
        };
        if better {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

/// Predict the label of the best-matching reference row.
pub fn classify(
    feature: ArrayView1<'_, f32>,
    bank: &TrainedBank,
    metric: Metric,
) -> FeatureResult<u32> {
    if bank.is_empty() {
        return Err(FeatureError::EmptyBank);
    }
    let scores = metric.scores(feature, bank.features().view())?;
    let best = best_index(metric, scores.view()).ok_or(FeatureError::EmptyBank)?;
    Ok(bank.labels()[best])
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::str::FromStr;

    fn vocab(k: usize) -> Vocabulary {
        Vocabulary::new(Array2::<f32>::zeros((k, 6))).unwrap()
    }

    /// Map whose quadrants hold words 0..4, 4x4 pixels.
    fn quadrant_map() -> WordMap {
        WordMap::from_grid(array![
            [0u32, 0, 1, 1],
            [0, 0, 1, 1],
            [2, 2, 3, 3],
            [2, 2, 3, 3],
        ])
    }

    #[test]
    fn test_vocabulary_rejects_empty() {
        assert!(matches!(
            Vocabulary::new(Array2::<f32>::zeros((0, 6))),
            Err(FeatureError::EmptyVocabulary)
        ));
        let v = vocab(5);
        assert_eq!(v.size(), 5);
        assert_eq!(v.response_dim(), 6);
    }

    #[test]
    fn test_wordmap_shapes() {
        let map = quadrant_map();
        assert_eq!(map.height(), 4);
        assert_eq!(map.width(), 4);
        assert_eq!(map.candidates_per_pixel(), 1);
        assert!(!map.is_empty());

        let multi = WordMap::from_candidates(Array3::<u32>::zeros((2, 2, 3))).unwrap();
        assert_eq!(multi.candidates_per_pixel(), 3);

        assert!(matches!(
            WordMap::from_candidates(Array3::<u32>::zeros((2, 2, 0))),
            Err(FeatureError::InvalidMapShape(2, 2, 0))
        ));
    }

    #[test]
    fn test_wordmap_validation() {
        let map = quadrant_map();
        assert!(map.validate_words(4).is_ok());
        assert!(matches!(
            map.validate_words(3),
            Err(FeatureError::WordOutOfRange { word: 3, dict_size: 3 })
        ));
    }

    #[test]
    fn test_word_histogram_density() {
        let hist = word_histogram(&quadrant_map(), 4).unwrap();
        assert_eq!(hist.len(), 4);
        assert!((hist.sum() - 1.0).abs() < 1e-6);
        for &v in hist.iter() {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn test_word_histogram_empty_map_is_zero() {
        let map = WordMap::from_grid(Array2::<u32>::zeros((0, 0)));
        let hist = word_histogram(&map, 8).unwrap();
        assert_eq!(hist.len(), 8);
        assert_eq!(hist.sum(), 0.0);
    }

    #[test]
    fn test_pyramid_length_invariant() {
        for &(k, layers) in &[(4usize, 1usize), (4, 2), (10, 3), (3, 4), (200, 3)] {
            let expected = k * (4usize.pow(layers as u32) - 1) / 3;
            assert_eq!(pyramid_feature_len(k, layers), expected);

            let side = 1 << (layers - 1);
            let map = WordMap::from_grid(Array2::<u32>::zeros((side * 2, side * 2)));
            let feature = pyramid_feature(&map, layers, k).unwrap();
            assert_eq!(feature.len(), expected);
        }
    }

    #[test]
    fn test_pyramid_sums_to_one() {
        let map = quadrant_map();
        for layers in 1..=3 {
            let feature = pyramid_feature(&map, layers, 4).unwrap();
            assert!(
                (feature.sum() - 1.0).abs() < 1e-6,
                "layers {} should normalize to 1",
                layers
            );
            assert!(feature.iter().all(|&v| v >= 0.0));
        }
    }

    #[test]
    fn test_pyramid_empty_map_all_zero() {
        let map = WordMap::from_grid(Array2::<u32>::zeros((0, 0)));
        let feature = pyramid_feature(&map, 3, 5).unwrap();
        assert_eq!(feature.len(), pyramid_feature_len(5, 3));
        assert!(feature.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pyramid_map_smaller_than_grid_all_zero() {
        // 2x2 map against an 4x4 finest grid: cell extent is zero.
        let map = WordMap::from_grid(Array2::<u32>::zeros((2, 2)));
        let feature = pyramid_feature(&map, 3, 5).unwrap();
        assert!(feature.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_pyramid_rejects_zero_layers() {
        let map = quadrant_map();
        assert!(matches!(
            pyramid_feature(&map, 0, 4),
            Err(FeatureError::InvalidLayerCount(0))
        ));
    }

    #[test]
    fn test_pyramid_rejects_out_of_range_word() {
        let map = quadrant_map();
        assert!(matches!(
            pyramid_feature(&map, 2, 3),
            Err(FeatureError::WordOutOfRange { word: 3, dict_size: 3 })
        ));
    }

    #[test]
    fn test_pyramid_quadrant_scenario() {
        // 4x4 map, K=4, L=2: four finest 2x2 cells, each pure in one word.
        let feature = pyramid_feature(&quadrant_map(), 2, 4).unwrap();
        assert_eq!(feature.len(), 20);
        assert!((feature.sum() - 1.0).abs() < 1e-6);

        // Both levels carry weight 1/2, so every nonzero entry is
        // (4 * 0.5) / 16 = 0.125: the level-0 cell over all four words and
        // one word per finest cell.
        for w in 0..4 {
            assert!((feature[w] - 0.125).abs() < 1e-6, "level-0 word {}", w);
        }
        for cell in 0..4 {
            for w in 0..4 {
                let v = feature[4 + cell * 4 + w];
                let expected = if w == cell { 0.125 } else { 0.0 };
                assert!(
                    (v - expected).abs() < 1e-6,
                    "finest cell {} word {}",
                    cell,
                    w
                );
            }
        }
    }

    #[test]
    fn test_pyramid_bottom_up_matches_brute_force() {
        // 8x8 map with a mix of words; L=3 so levels are 4x4, 2x2, 1x1.
        let mut grid = Array2::<u32>::zeros((8, 8));
        for y in 0..8 {
            for x in 0..8 {
                grid[[y, x]] = ((y * 3 + x * 5) % 6) as u32;
            }
        }
        let map = WordMap::from_grid(grid.clone());
        let layers = 3;
        let k = 6;
        let feature = pyramid_feature(&map, layers, k).unwrap();

        // Brute force: histogram every cell of every level directly from
        // pixels, apply the same weights, then normalize.
        let mut flat = Vec::new();
        for level in 0..layers {
            let side = 1usize << level;
            let cell = 8 / side;
            let weight = level_weight(level, layers);
            for i in 0..side {
                for j in 0..side {
                    let mut hist = vec![0f32; k];
                    for y in i * cell..(i + 1) * cell {
                        for x in j * cell..(j + 1) * cell {
                            hist[grid[[y, x]] as usize] += 1.0;
                        }
                    }
                    flat.extend(hist.into_iter().map(|v| v * weight));
                }
            }
        }
        let total: f32 = flat.iter().sum();
        for v in flat.iter_mut() {
            *v /= total;
        }

        assert_eq!(feature.len(), flat.len());
        for (i, (&got, &want)) in feature.iter().zip(flat.iter()).enumerate() {
            assert!((got - want).abs() < 1e-6, "entry {}: {} vs {}", i, got, want);
        }
    }

    #[test]
    fn test_pyramid_multi_candidate_accumulates() {
        // Two candidates per pixel: word 0 and word 1 everywhere.
        let mut words = Array3::<u32>::zeros((4, 4, 2));
        words.slice_mut(s![.., .., 1]).fill(1);
        let map = WordMap::from_candidates(words).unwrap();
        let feature = pyramid_feature(&map, 1, 4).unwrap();
        assert!((feature[0] - 0.5).abs() < 1e-6);
        assert!((feature[1] - 0.5).abs() < 1e-6);
        assert_eq!(feature[2], 0.0);
    }

    #[test]
    fn test_pyramid_remainder_pixels_dropped() {
        // 5x5 map, L=2: finest cells are 2x2, the fifth row/column is
        // outside every cell and must not be counted.
        let mut grid = Array2::<u32>::zeros((5, 5));
        grid.slice_mut(s![4, ..]).fill(1);
        grid.slice_mut(s![.., 4]).fill(1);
        let map = WordMap::from_grid(grid);
        let feature = pyramid_feature(&map, 2, 2).unwrap();
        // Word 1 never appears inside the 4x4 counted region.
        assert_eq!(feature[1], 0.0);
        assert!((feature.sum() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_level_weights() {
        // L=3: levels 0 and 1 share 1/4, level 2 gets 1/2.
        assert!((level_weight(0, 3) - 0.25).abs() < 1e-6);
        assert!((level_weight(1, 3) - 0.25).abs() < 1e-6);
        assert!((level_weight(2, 3) - 0.5).abs() < 1e-6);
        // L=1: single level, weight 1.
        assert!((level_weight(0, 1) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!(Metric::from_str("euclidean").unwrap(), Metric::Euclidean);
        assert_eq!(Metric::from_str("intersect").unwrap(), Metric::Intersect);
        assert_eq!(Metric::from_str("chi2").unwrap(), Metric::Chi2);
        assert_eq!(Metric::from_str("correl").unwrap(), Metric::Correl);
        assert!(matches!(
            Metric::from_str("bogus"),
            Err(FeatureError::UnknownMetric(_))
        ));
        assert_eq!(Metric::Chi2.to_string(), "chi2");
    }

    #[test]
    fn test_metric_directions() {
        assert!(!Metric::Euclidean.higher_is_better());
        assert!(!Metric::Chi2.higher_is_better());
        assert!(Metric::Intersect.higher_is_better());
        assert!(Metric::Correl.higher_is_better());
    }

    #[test]
    fn test_metric_identities_on_equal_vectors() {
        let q = array![0.2f32, 0.3, 0.5, 0.0];
        let refs = q.clone().insert_axis(Axis(0));

        let euclid = Metric::Euclidean.scores(q.view(), refs.view()).unwrap();
        assert!(euclid[0].abs() < 1e-6);

        let inter = Metric::Intersect.scores(q.view(), refs.view()).unwrap();
        assert!((inter[0] - q.sum()).abs() < 1e-6);

        let chi2 = Metric::Chi2.scores(q.view(), refs.view()).unwrap();
        assert!(chi2[0].abs() < 1e-6);

        let correl = Metric::Correl.scores(q.view(), refs.view()).unwrap();
        assert!((correl[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_metric_length_mismatch() {
        let q = array![0.5f32, 0.5];
        let refs = Array2::<f32>::zeros((3, 4));
        assert!(matches!(
            Metric::Euclidean.scores(q.view(), refs.view()),
            Err(FeatureError::LengthMismatch { query: 2, reference: 4 })
        ));
    }

    #[test]
    fn test_chi2_zero_coordinates() {
        let q = array![0.0f32, 0.5, 0.5];
        let r = array![[0.0f32, 0.5, 0.5]];
        let scores = Metric::Chi2.scores(q.view(), r.view()).unwrap();
        assert!(scores[0].is_finite());
        assert!(scores[0].abs() < 1e-6);
    }

    #[test]
    fn test_correl_zero_variance_is_zero() {
        let q = array![0.25f32, 0.25, 0.25, 0.25];
        let r = array![[0.1f32, 0.2, 0.3, 0.4]];
        let scores = Metric::Correl.scores(q.view(), r.view()).unwrap();
        assert_eq!(scores[0], 0.0);
    }

    fn two_row_bank(labels: [u32; 2]) -> TrainedBank {
        // L=1, K=4: feature length 4. Row 0 concentrated on word 0,
        // row 1 concentrated on word 3.
        let features = array![[0.7f32, 0.1, 0.1, 0.1], [0.1, 0.1, 0.1, 0.7]];
        TrainedBank::new(vocab(4), features, labels.to_vec(), 1).unwrap()
    }

    #[test]
    fn test_bank_validation() {
        let features = Array2::<f32>::zeros((2, 4));
        assert!(TrainedBank::new(vocab(4), features.clone(), vec![0, 1], 1).is_ok());
        assert!(matches!(
            TrainedBank::new(vocab(4), features.clone(), vec![0], 1),
            Err(FeatureError::LabelCountMismatch { labels: 1, rows: 2 })
        ));
        assert!(matches!(
            TrainedBank::new(vocab(4), features.clone(), vec![0, 1], 2),
            Err(FeatureError::FeatureWidthMismatch { got: 4, expected: 20 })
        ));
        assert!(matches!(
            TrainedBank::new(vocab(4), features, vec![0, 1], 0),
            Err(FeatureError::InvalidLayerCount(0))
        ));
    }

    #[test]
    fn test_bank_num_classes() {
        let bank = two_row_bank([2, 5]);
        assert_eq!(bank.num_classes(), 6);
        assert_eq!(bank.len(), 2);
        assert!(!bank.is_empty());
    }

    #[test]
    fn test_classifier_extremum_direction_per_metric() {
        let bank = two_row_bank([7, 9]);
        let query = array![0.7f32, 0.1, 0.1, 0.1]; // identical to row 0

        // Distance metrics must pick the minimum, similarity metrics the
        // maximum; every one of them should land on row 0 here.
        for metric in [
            Metric::Euclidean,
            Metric::Intersect,
            Metric::Chi2,
            Metric::Correl,
        ] {
            let pred = classify(query.view(), &bank, metric).unwrap();
            assert_eq!(pred, 7, "metric {} picked the wrong row", metric);
        }
    }

    #[test]
    fn test_classifier_distance_metric_would_fail_under_argmax() {
        // Guard against uniform maximization: under euclidean the WORSE row
        // has the LARGER score, so argmax would return label 9.
        let bank = two_row_bank([7, 9]);
        let query = array![0.7f32, 0.1, 0.1, 0.1];
        let scores = Metric::Euclidean
            .scores(query.view(), bank.features().view())
            .unwrap();
        assert!(scores[1] > scores[0]);
        assert_eq!(best_index(Metric::Euclidean, scores.view()), Some(0));
    }

    #[test]
    fn test_classifier_tie_breaks_first() {
        // Two identical rows; the prediction is the shared best label and
        // the index tie resolves to the first occurrence.
        let features = array![
            [0.7f32, 0.1, 0.1, 0.1],
            [0.7, 0.1, 0.1, 0.1],
            [0.1, 0.1, 0.1, 0.7],
        ];
        let bank = TrainedBank::new(vocab(4), features, vec![3, 3, 9], 1).unwrap();
        let query = array![0.7f32, 0.1, 0.1, 0.1];
        assert_eq!(classify(query.view(), &bank, Metric::Intersect).unwrap(), 3);

        let scores = Metric::Intersect
            .scores(query.view(), bank.features().view())
            .unwrap();
        assert_eq!(best_index(Metric::Intersect, scores.view()), Some(0));
    }

    #[test]
    fn test_classifier_empty_bank() {
        let bank = TrainedBank::new(vocab(4), Array2::<f32>::zeros((0, 4)), vec![], 1).unwrap();
        let query = array![0.25f32, 0.25, 0.25, 0.25];
        assert!(matches!(
            classify(query.view(), &bank, Metric::Intersect),
            Err(FeatureError::EmptyBank)
        ));
    }

    #[test]
    fn test_assign_options_builder() {
        let opts = AssignOptions::default()
            .with_neighbors(3)
            .with_sobel(true)
            .with_prewitt(false);
        assert_eq!(opts.neighbor_count, 3);
        assert!(opts.sobel);
        assert!(!opts.prewitt);
    }
}
