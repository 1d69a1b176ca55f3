//! Experiment configuration for the recognition pipelines.
//!
//! Loaded from JSON, validated once at startup. Defaults mirror the
//! standard experiment setup (K=200, three pyramid layers, histogram
//! intersection, no edge filters).

use serde::{Deserialize, Serialize};
use spm_core::{AssignOptions, FeatureError, Metric};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Errors in configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Feature dimension {got} does not match filter flags (expected {expected})")]
    FeatureDim { got: usize, expected: usize },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error(transparent)]
    Metric(#[from] FeatureError),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Response channels of the base filter bank
const BASE_FEATURE_DIM: usize = 60;
/// Response channels added by each enabled edge filter
const EDGE_FILTER_DIM: usize = 6;

/// Full configuration surface consumed by the pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Vocabulary size K
    pub dict_size: usize,
    /// Number of spatial pyramid layers
    pub layer_num: usize,
    /// Nearest centroids kept per pixel during word assignment
    pub nearest_neighbor_num: usize,
    /// Metric name: euclidean, intersect, chi2, or correl
    pub distance: String,
    /// Enable the Sobel response channels
    pub sobel: bool,
    /// Enable the Prewitt response channels
    pub prewitt: bool,
    /// Per-pixel filter-response dimensionality F
    pub feature_dim: usize,
    /// Worker threads for the training pipeline
    pub train_workers: usize,
    /// Worker threads for the evaluation pipeline
    pub eval_workers: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            dict_size: 200,
            layer_num: 3,
            nearest_neighbor_num: 1,
            distance: "intersect".to_string(),
            sobel: false,
            prewitt: false,
            feature_dim: BASE_FEATURE_DIM,
            train_workers: 2,
            eval_workers: 2,
        }
    }
}

impl RecognitionConfig {
    /// Load from a JSON file and validate immediately.
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Feature dimensionality implied by the filter flags.
    pub fn expected_feature_dim(&self) -> usize {
        BASE_FEATURE_DIM
            + usize::from(self.sobel) * EDGE_FILTER_DIM
            + usize::from(self.prewitt) * EDGE_FILTER_DIM
    }

    /// Check every startup precondition; called before any batch dispatch.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.dict_size == 0 {
            return Err(ConfigError::Invalid("dict_size must be at least 1".into()));
        }
        if self.layer_num == 0 {
            return Err(ConfigError::Invalid("layer_num must be at least 1".into()));
        }
        if self.nearest_neighbor_num == 0 {
            return Err(ConfigError::Invalid(
                "nearest_neighbor_num must be at least 1".into(),
            ));
        }
        if self.train_workers == 0 || self.eval_workers == 0 {
            return Err(ConfigError::Invalid(
                "worker counts must be at least 1".into(),
            ));
        }
        let expected = self.expected_feature_dim();
        if self.feature_dim != expected {
            return Err(ConfigError::FeatureDim {
                got: self.feature_dim,
                expected,
            });
        }
        self.metric()?;
        Ok(())
    }

    /// Parse the configured distance name.
    pub fn metric(&self) -> ConfigResult<Metric> {
        Ok(Metric::from_str(&self.distance)?)
    }

    /// Options forwarded to the word assigner.
    pub fn assign_options(&self) -> AssignOptions {
        AssignOptions::default()
            .with_neighbors(self.nearest_neighbor_num)
            .with_sobel(self.sobel)
            .with_prewitt(self.prewitt)
    }

    /// Short label naming artifacts produced under this configuration.
    pub fn run_label(&self) -> String {
        let mut label = format!(
            "K{}-fd{}-layers{}-nn{}-{}",
            self.dict_size,
            self.feature_dim,
            self.layer_num,
            self.nearest_neighbor_num,
            self.distance
        );
        if self.sobel {
            label.push_str("-sobel");
        }
        if self.prewitt {
            label.push_str("-prewitt");
        }
        label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RecognitionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.metric().unwrap(), Metric::Intersect);
        assert_eq!(config.feature_dim, 60);
    }

    #[test]
    fn test_feature_dim_follows_filter_flags() {
        let mut config = RecognitionConfig {
            sobel: true,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::FeatureDim { got: 60, expected: 66 })
        ));

        config.feature_dim = 66;
        assert!(config.validate().is_ok());

        config.prewitt = true;
        config.feature_dim = 72;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let config = RecognitionConfig {
            distance: "bogus".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Metric(FeatureError::UnknownMetric(_)))
        ));
    }

    #[test]
    fn test_zero_values_rejected() {
        for broken in [
            RecognitionConfig {
                dict_size: 0,
                ..Default::default()
            },
            RecognitionConfig {
                layer_num: 0,
                ..Default::default()
            },
            RecognitionConfig {
                nearest_neighbor_num: 0,
                ..Default::default()
            },
            RecognitionConfig {
                train_workers: 0,
                ..Default::default()
            },
        ] {
            assert!(matches!(broken.validate(), Err(ConfigError::Invalid(_))));
        }
    }

    #[test]
    fn test_run_label() {
        let config = RecognitionConfig::default();
        assert_eq!(config.run_label(), "K200-fd60-layers3-nn1-intersect");

        let with_filters = RecognitionConfig {
            sobel: true,
            prewitt: true,
            feature_dim: 72,
            distance: "chi2".to_string(),
            ..Default::default()
        };
        assert_eq!(
            with_filters.run_label(),
            "K200-fd72-layers3-nn1-chi2-sobel-prewitt"
        );
    }

    #[test]
    fn test_assign_options_mirror_config() {
        let config = RecognitionConfig {
            nearest_neighbor_num: 3,
            sobel: true,
            feature_dim: 66,
            ..Default::default()
        };
        let opts = config.assign_options();
        assert_eq!(opts.neighbor_count, 3);
        assert!(opts.sobel);
        assert!(!opts.prewitt);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RecognitionConfig =
            serde_json::from_str(r#"{"dict_size": 50, "distance": "chi2"}"#).unwrap();
        assert_eq!(config.dict_size, 50);
        assert_eq!(config.distance, "chi2");
        assert_eq!(config.layer_num, 3);
        assert!(config.validate().is_ok());
    }
}
