//! Risk scoring.
//!
//! [`RiskScorer`] wraps a trained [`IsolationForest`] and maps a feature vector
//! to a continuous anomaly score plus a discrete [`RiskLevel`]:
//!
//! ```text
//! score <  medium          → low
//! medium <= score <  high  → medium
//! score >= high            → high
//! ```
//!
//! The model is loaded lazily on first use (or eagerly through
//! [`RiskScorer::warm_up`]) and is read-only afterwards. With a configured
//! `model_path` the file must load; without one a default model is trained on
//! a seeded synthetic reference population.

mod forest;
mod reference;

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

pub use forest::{average_path_length, ForestError, ForestParams, IsolationForest};
pub use reference::{benign_profiles, REFERENCE_SAMPLES};

use super::error::ScoringError;
use super::features::{FeatureVector, FEATURE_COUNT};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid risk thresholds: require 0 <= medium ({medium}) <= high ({high}) <= 1")]
pub struct ThresholdError {
    pub medium: f64,
    pub high: f64,
}

/// Score cut-offs for the discrete risk levels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            medium: 0.55,
            high: 0.70,
        }
    }
}

impl RiskThresholds {
    pub fn new(medium: f64, high: f64) -> Result<Self, ThresholdError> {
        let valid = (0.0..=1.0).contains(&medium) && (0.0..=1.0).contains(&high) && medium <= high;
        if valid {
            Ok(Self { medium, high })
        } else {
            Err(ThresholdError { medium, high })
        }
    }

    pub fn level(&self, score: f64) -> RiskLevel {
        if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of scoring one feature vector. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: f64,
    pub level: RiskLevel,
    pub summary: String,
    pub features: FeatureVector,
}

#[derive(Debug, Clone, Default)]
pub struct ScoringConfig {
    /// Serialized forest to load. `None` trains the default model.
    pub model_path: Option<PathBuf>,
    pub thresholds: RiskThresholds,
    pub forest: ForestParams,
}

static GLOBAL_SCORER: OnceLock<Arc<RiskScorer>> = OnceLock::new();

pub struct RiskScorer {
    config: ScoringConfig,
    model: OnceCell<Arc<IsolationForest>>,
}

impl RiskScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            config,
            model: OnceCell::new(),
        }
    }

    /// Scorer backed by an already trained model.
    pub fn with_model(model: IsolationForest, thresholds: RiskThresholds) -> Self {
        Self {
            config: ScoringConfig {
                thresholds,
                ..Default::default()
            },
            model: OnceCell::new_with(Some(Arc::new(model))),
        }
    }

    /// Process-wide scorer shared by every worker.
    ///
    /// The first call installs the scorer with its configuration; later calls
    /// return the same instance and ignore their argument. The model is never
    /// mutated after loading and lives until process exit.
    pub fn global(config: ScoringConfig) -> Arc<Self> {
        GLOBAL_SCORER
            .get_or_init(|| {
                tracing::debug!(target: "auditor::pipeline::scoring", "Installing process-wide risk scorer");
                Arc::new(Self::new(config))
            })
            .clone()
    }

    pub fn thresholds(&self) -> RiskThresholds {
        self.config.thresholds
    }

    /// Loads the model now instead of on the first job.
    pub async fn warm_up(&self) -> Result<(), ScoringError> {
        self.model().await.map(|_| ())
    }

    pub async fn score(&self, features: &FeatureVector) -> Result<RiskAssessment, ScoringError> {
        let model = self.model().await?;
        if model.dims() != FEATURE_COUNT {
            return Err(ScoringError::ModelUnavailable(format!(
                "model expects {} features, extractor produces {FEATURE_COUNT}",
                model.dims()
            )));
        }

        let score = model.score(features.as_slice());
        let level = self.config.thresholds.level(score);

        Ok(RiskAssessment {
            score,
            level,
            summary: summarize(score, level, features),
            features: *features,
        })
    }

    async fn model(&self) -> Result<&IsolationForest, ScoringError> {
        let model = self.model.get_or_try_init(|| self.load_model()).await?;
        Ok(model.as_ref())
    }

    async fn load_model(&self) -> Result<Arc<IsolationForest>, ScoringError> {
        let Some(path) = &self.config.model_path else {
            let params = self.config.forest;
            let forest = tokio::task::spawn_blocking(move || {
                IsolationForest::fit(&benign_profiles(REFERENCE_SAMPLES, params.seed), params)
            })
            .await
            .map_err(|e| ScoringError::ModelUnavailable(format!("training task failed: {e}")))?
            .map_err(|e| ScoringError::ModelUnavailable(e.to_string()))?;

            tracing::info!(
                target: "auditor::pipeline::scoring",
                trees = forest.tree_count(),
                "Trained default risk model on reference population"
            );
            return Ok(Arc::new(forest));
        };

        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ScoringError::ModelUnavailable(format!("cannot read {}: {e}", path.display()))
        })?;
        let forest = IsolationForest::from_json(&raw).map_err(|e| {
            ScoringError::ModelUnavailable(format!("cannot decode {}: {e}", path.display()))
        })?;
        if forest.dims() != FEATURE_COUNT {
            return Err(ScoringError::ModelUnavailable(format!(
                "{} was trained on {} features, expected {FEATURE_COUNT}",
                path.display(),
                forest.dims()
            )));
        }

        tracing::info!(
            target: "auditor::pipeline::scoring",
            path = %path.display(),
            trees = forest.tree_count(),
            "Loaded risk model"
        );
        Ok(Arc::new(forest))
    }
}

fn summarize(score: f64, level: RiskLevel, features: &FeatureVector) -> String {
    let members = features.get("member_count").unwrap_or_default();
    let state_changing = features.get("state_changing_ratio").unwrap_or_default() * 100.0;
    let flags = features.raised_flags();
    let flags = if flags.is_empty() {
        "none".to_string()
    } else {
        flags.join(", ")
    };
    format!(
        "{level} risk (score {score:.3}): {members} callable members, {state_changing:.0}% state-changing; risk flags: {flags}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::abi::{AbiMember, InterfaceDescription, Mutability};
    use crate::pipeline::features::extract;

    #[test]
    fn test_threshold_mapping() {
        let thresholds = RiskThresholds::default();
        assert_eq!(thresholds.level(0.10), RiskLevel::Low);
        assert_eq!(thresholds.level(0.55), RiskLevel::Medium);
        assert_eq!(thresholds.level(0.69), RiskLevel::Medium);
        assert_eq!(thresholds.level(0.70), RiskLevel::High);
        assert!(RiskThresholds::new(0.8, 0.6).is_err());
        assert!(RiskThresholds::new(-0.1, 0.6).is_err());
        assert!(RiskThresholds::new(0.4, 0.9).is_ok());
    }

    #[tokio::test]
    async fn test_default_model_scores_suspicious_surface_higher() {
        let scorer = RiskScorer::new(ScoringConfig::default());

        let plain = InterfaceDescription::new(
            (0..20)
                .map(|i| {
                    let mutability = if i % 2 == 0 { Mutability::View } else { Mutability::NonPayable };
                    AbiMember::function(format!("member{i}"), mutability)
                })
                .collect(),
        );
        let suspicious = InterfaceDescription::new(vec![
            AbiMember::function("kill", Mutability::NonPayable),
            AbiMember::function("upgradeToAndCall", Mutability::Payable),
            AbiMember::function("withdrawAll", Mutability::NonPayable),
        ]);

        let plain = scorer.score(&extract(&plain, None)).await.unwrap();
        let suspicious = scorer.score(&extract(&suspicious, None)).await.unwrap();

        assert!(suspicious.score > plain.score);
        assert!(suspicious.summary.contains("self_destruct"));
        assert!(plain.summary.contains("risk flags: none"));
    }

    #[tokio::test]
    async fn test_missing_model_file_is_model_unavailable() {
        let scorer = RiskScorer::new(ScoringConfig {
            model_path: Some(PathBuf::from("/nonexistent/risk-model.json")),
            ..Default::default()
        });

        let err = scorer.score(&FeatureVector::zeroed()).await.unwrap_err();
        assert!(matches!(err, ScoringError::ModelUnavailable(_)));
        assert!(scorer.warm_up().await.is_err());
    }

    #[tokio::test]
    async fn test_model_with_wrong_dimensions_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.json");
        IsolationForest::fit(&[vec![0.0, 1.0], vec![1.0, 0.0]], ForestParams::default())
            .unwrap()
            .save(&path)
            .unwrap();

        let scorer = RiskScorer::new(ScoringConfig {
            model_path: Some(path),
            ..Default::default()
        });
        let err = scorer.score(&FeatureVector::zeroed()).await.unwrap_err();
        assert!(err.to_string().contains("expected 14"));
    }

    #[tokio::test]
    async fn test_model_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let params = ForestParams {
            trees: 20,
            ..Default::default()
        };
        IsolationForest::fit(&benign_profiles(300, 3), params)
            .unwrap()
            .save(&path)
            .unwrap();

        let scorer = RiskScorer::new(ScoringConfig {
            model_path: Some(path),
            ..Default::default()
        });
        let assessment = scorer.score(&FeatureVector::zeroed()).await.unwrap();
        assert!(assessment.score > 0.0 && assessment.score <= 1.0);
    }

    #[test]
    fn test_global_scorer_is_installed_once() {
        let first = RiskScorer::global(ScoringConfig::default());
        let second = RiskScorer::global(ScoringConfig {
            thresholds: RiskThresholds { medium: 0.1, high: 0.2 },
            ..Default::default()
        });
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.thresholds(), RiskThresholds::default());
    }
}
