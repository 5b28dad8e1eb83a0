//! Quality drift detection.
//!
//! Drift compares the mean score of a character's most recent reviewed
//! images against the mean over its whole reviewed history. Too few recent
//! samples is reported as such and never as "no drift".

use serde::Serialize;

/// Drift detection parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftConfig {
    /// Number of most recent scored reviews forming the recent window.
    pub window: usize,
    /// Alert when `drift <= -threshold`.
    pub threshold: f64,
    /// Fewer scored reviews than this in the recent window never alerts.
    pub min_recent_samples: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            window: 20,
            threshold: 0.15,
            min_recent_samples: 5,
        }
    }
}

/// A drift measurement for one character.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftAlert {
    pub character_slug: String,
    pub recent_avg: f64,
    pub overall_avg: f64,
    /// `recent_avg - overall_avg`.
    pub drift: f64,
    pub recent_samples: usize,
    pub overall_samples: usize,
    pub alert: bool,
}

/// Result of a drift check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DriftAssessment {
    /// Not enough scored reviews to say anything.
    InsufficientHistory { samples: usize, required: usize },
    Measured(DriftAlert),
}

impl DriftAssessment {
    /// True only for a measured alert.
    pub fn is_alert(&self) -> bool {
        matches!(self, DriftAssessment::Measured(alert) if alert.alert)
    }

    pub fn measurement(&self) -> Option<&DriftAlert> {
        match self {
            DriftAssessment::Measured(alert) => Some(alert),
            DriftAssessment::InsufficientHistory { .. } => None,
        }
    }
}

/// Assesses drift from scores of reviewed images in review order.
///
/// Unscored reviews are skipped; only scored ones count as samples.
pub fn assess_drift(
    character_slug: &str,
    reviewed_scores: &[Option<f64>],
    config: &DriftConfig,
) -> DriftAssessment {
    let scores: Vec<f64> = reviewed_scores.iter().flatten().copied().collect();
    let recent_start = scores.len().saturating_sub(config.window);
    let recent = &scores[recent_start..];

    let required = config.min_recent_samples.max(1);
    if recent.len() < required {
        return DriftAssessment::InsufficientHistory {
            samples: recent.len(),
            required,
        };
    }

    let recent_avg = mean(recent);
    let overall_avg = mean(&scores);
    let drift = recent_avg - overall_avg;

    DriftAssessment::Measured(DriftAlert {
        character_slug: character_slug.to_string(),
        recent_avg,
        overall_avg,
        drift,
        recent_samples: recent.len(),
        overall_samples: scores.len(),
        alert: drift <= -config.threshold,
    })
}

/// Assessments at each of the last `points` review points, newest first.
///
/// Point `i` is the state of the history after dropping the `i` most recent
/// reviews. Fewer points are returned when the history is shorter.
pub fn drift_history(
    character_slug: &str,
    reviewed_scores: &[Option<f64>],
    points: usize,
    config: &DriftConfig,
) -> Vec<DriftAssessment> {
    (0..points.min(reviewed_scores.len()))
        .map(|i| {
            let end = reviewed_scores.len() - i;
            assess_drift(character_slug, &reviewed_scores[..end], config)
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
