//! Training and evaluation pipelines.
//!
//! Both pipelines fan one task per image out over a dedicated rayon pool
//! sized to exactly the configured worker count, share the vocabulary and
//! trained bank read-only across workers, and collect results in manifest
//! order regardless of completion order. The first task failure aborts the
//! whole batch with the offending image's path and index; nothing partial
//! is ever persisted.

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use spm_core::{
    classify, pyramid_feature, pyramid_feature_len, FeatureError, TrainedBank, Vocabulary,
    WordAssigner,
};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

use crate::config::{ConfigError, RecognitionConfig};
use crate::manifest::DatasetManifest;

// ============================================================================
// Error Types
// ============================================================================

/// Errors in pipeline orchestration
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Artifact(#[from] crate::artifacts::ArtifactError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("Image {index} ({path}): {source}")]
    Task {
        index: usize,
        path: String,
        #[source]
        source: FeatureError,
    },
    #[error("Vocabulary shape {rows}x{cols} does not match configuration (expected {expected_rows}x{expected_cols})")]
    VocabularyShape {
        rows: usize,
        cols: usize,
        expected_rows: usize,
        expected_cols: usize,
    },
    #[error("Worker pool: {0}")]
    Pool(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================================================
// Worker Pool
// ============================================================================

/// Build a pool with exactly the requested thread count.
///
/// The caller-specified worker count bounds actual concurrency; it is never
/// silently replaced by a default pool size.
fn exact_pool(workers: usize) -> PipelineResult<rayon::ThreadPool> {
    if workers == 0 {
        return Err(PipelineError::Pool(
            "worker count must be at least 1".to_string(),
        ));
    }
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .map_err(|e| PipelineError::Pool(e.to_string()))
}

fn check_vocabulary(
    vocabulary: &Vocabulary,
    config: &RecognitionConfig,
) -> PipelineResult<()> {
    let expected_rows = config.dict_size;
    let expected_cols = 3 * config.feature_dim;
    if vocabulary.size() != expected_rows || vocabulary.response_dim() != expected_cols {
        return Err(PipelineError::VocabularyShape {
            rows: vocabulary.size(),
            cols: vocabulary.response_dim(),
            expected_rows,
            expected_cols,
        });
    }
    Ok(())
}

// ============================================================================
// Training Pipeline
// ============================================================================

/// Compute one pyramid feature per manifest entry, in manifest order.
pub fn compute_features<A: WordAssigner>(
    assigner: &A,
    manifest: &DatasetManifest,
    vocabulary: &Vocabulary,
    config: &RecognitionConfig,
    workers: usize,
) -> PipelineResult<Array2<f32>> {
    compute_features_with_progress(assigner, manifest, vocabulary, config, workers, |_, _| {})
}

/// `compute_features` with a completion callback `(finished, total)`.
pub fn compute_features_with_progress<A, F>(
    assigner: &A,
    manifest: &DatasetManifest,
    vocabulary: &Vocabulary,
    config: &RecognitionConfig,
    workers: usize,
    on_progress: F,
) -> PipelineResult<Array2<f32>>
where
    A: WordAssigner,
    F: Fn(usize, usize) + Send + Sync,
{
    config.validate()?;
    check_vocabulary(vocabulary, config)?;

    let options = config.assign_options();
    let layers = config.layer_num;
    let dict_size = config.dict_size;
    let total = manifest.len();
    let finished = AtomicUsize::new(0);

    let pool = exact_pool(workers)?;
    let rows: Vec<Array1<f32>> = pool.install(|| {
        manifest
            .entries
            .par_iter()
            .enumerate()
            .map(|(index, entry)| {
                let map = assigner
                    .assign_words(Path::new(&entry.path), vocabulary, &options)
                    .map_err(|source| PipelineError::Task {
                        index,
                        path: entry.path.clone(),
                        source,
                    })?;
                let feature =
                    pyramid_feature(&map, layers, dict_size).map_err(|source| {
                        PipelineError::Task {
                            index,
                            path: entry.path.clone(),
                            source,
                        }
                    })?;
                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                on_progress(done, total);
                Ok(feature)
            })
            .collect::<PipelineResult<Vec<_>>>()
    })?;

    // par_iter + collect keeps index order, so rows stay aligned with the
    // manifest even when tasks complete out of order.
    let mut features = Array2::<f32>::zeros((total, pyramid_feature_len(dict_size, layers)));
    for (i, row) in rows.into_iter().enumerate() {
        features.row_mut(i).assign(&row);
    }
    Ok(features)
}

/// Train a recognition bank from every manifest entry.
pub fn train_bank<A: WordAssigner>(
    assigner: &A,
    manifest: &DatasetManifest,
    vocabulary: &Vocabulary,
    config: &RecognitionConfig,
) -> PipelineResult<TrainedBank> {
    train_bank_with_progress(assigner, manifest, vocabulary, config, |_, _| {})
}

/// `train_bank` with a completion callback `(finished, total)`.
pub fn train_bank_with_progress<A, F>(
    assigner: &A,
    manifest: &DatasetManifest,
    vocabulary: &Vocabulary,
    config: &RecognitionConfig,
    on_progress: F,
) -> PipelineResult<TrainedBank>
where
    A: WordAssigner,
    F: Fn(usize, usize) + Send + Sync,
{
    let features = compute_features_with_progress(
        assigner,
        manifest,
        vocabulary,
        config,
        config.train_workers,
        on_progress,
    )?;
    Ok(TrainedBank::new(
        vocabulary.clone(),
        features,
        manifest.labels(),
        config.layer_num,
    )?)
}

// ============================================================================
// Confusion Matrix
// ============================================================================

/// Counts of (actual, predicted) label pairs over one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Array2<u64>,
}

impl ConfusionMatrix {
    /// A zeroed `num_classes x num_classes` matrix.
    pub fn new(num_classes: usize) -> Self {
        Self {
            counts: Array2::zeros((num_classes, num_classes)),
        }
    }

    /// Count one evaluated image.
    pub fn record(&mut self, actual: u32, predicted: u32) {
        self.counts[[actual as usize, predicted as usize]] += 1;
    }

    /// The raw count matrix
    pub fn counts(&self) -> ArrayView2<'_, u64> {
        self.counts.view()
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    /// Total evaluated images
    pub fn total(&self) -> u64 {
        self.counts.sum()
    }

    /// Correctly classified images
    pub fn trace(&self) -> u64 {
        self.counts.diag().sum()
    }

    /// `trace / total`, or 0.0 for an empty run.
    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            self.trace() as f64 / total as f64
        }
    }
}

// ============================================================================
// Evaluation Pipeline
// ============================================================================

/// One misclassified test image, referenced by its manifest index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Misclassification {
    pub index: usize,
    pub path: String,
    pub predicted: u32,
    pub actual: u32,
}

/// Full result of one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub run_label: String,
    pub accuracy: f64,
    pub confusion: ConfusionMatrix,
    pub errors: Vec<Misclassification>,
}

impl EvaluationReport {
    /// Persist the report as pretty JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> PipelineResult<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Load a previously saved report.
    pub fn load_json<P: AsRef<Path>>(path: P) -> PipelineResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Classify every test entry against the bank and tally the results.
pub fn evaluate_bank<A: WordAssigner>(
    assigner: &A,
    manifest: &DatasetManifest,
    bank: &TrainedBank,
    config: &RecognitionConfig,
) -> PipelineResult<EvaluationReport> {
    evaluate_bank_with_progress(assigner, manifest, bank, config, |_, _| {})
}

/// `evaluate_bank` with a completion callback `(finished, total)`.
pub fn evaluate_bank_with_progress<A, F>(
    assigner: &A,
    manifest: &DatasetManifest,
    bank: &TrainedBank,
    config: &RecognitionConfig,
    on_progress: F,
) -> PipelineResult<EvaluationReport>
where
    A: WordAssigner,
    F: Fn(usize, usize) + Send + Sync,
{
    config.validate()?;
    let metric = config.metric()?;
    check_vocabulary(bank.vocabulary(), config)?;

    // The bank is authoritative for the feature geometry: test features
    // must be built with the layer count it was trained with.
    let layers = bank.layer_num();
    let dict_size = bank.vocabulary().size();
    let options = config.assign_options();
    let total = manifest.len();
    let finished = AtomicUsize::new(0);

    let pool = exact_pool(config.eval_workers)?;
    let predictions: Vec<u32> = pool.install(|| {
        manifest
            .entries
            .par_iter()
            .enumerate()
            .map(|(index, entry)| {
                let task_err = |source: FeatureError| PipelineError::Task {
                    index,
                    path: entry.path.clone(),
                    source,
                };
                let map = assigner
                    .assign_words(Path::new(&entry.path), bank.vocabulary(), &options)
                    .map_err(task_err)?;
                let feature = pyramid_feature(&map, layers, dict_size).map_err(task_err)?;
                let predicted = classify(feature.view(), bank, metric).map_err(task_err)?;
                let done = finished.fetch_add(1, Ordering::Relaxed) + 1;
                on_progress(done, total);
                Ok(predicted)
            })
            .collect::<PipelineResult<Vec<_>>>()
    })?;

    let num_classes = bank.num_classes().max(manifest.num_classes());
    let mut confusion = ConfusionMatrix::new(num_classes);
    let mut errors = Vec::new();
    for (index, (entry, &predicted)) in
        manifest.entries.iter().zip(predictions.iter()).enumerate()
    {
        confusion.record(entry.label, predicted);
        if predicted != entry.label {
            errors.push(Misclassification {
                index,
                path: entry.path.clone(),
                predicted,
                actual: entry.label,
            });
        }
    }

    Ok(EvaluationReport {
        run_label: config.run_label(),
        accuracy: confusion.accuracy(),
        confusion,
        errors,
    })
}

// ============================================================================
// Tests
// ============================================================================
