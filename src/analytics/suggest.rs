//! Parameter suggestions from recent review outcomes.

use std::collections::HashMap;

use serde::Serialize;

use crate::storage::{GeneratedImage, GenerationParams, ReviewStatus};

use super::stats::approval_rate;

/// Suggestion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuggestConfig {
    /// Minimum reviewed images in the window before suggesting anything.
    pub min_samples: usize,
    /// Only the most recent reviews are considered.
    pub recent_window: usize,
    /// Parameter sets with fewer reviews than this are not candidates.
    pub min_group_samples: usize,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            recent_window: 100,
            min_group_samples: 3,
        }
    }
}

/// Outcome of a suggestion query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ParameterSuggestion {
    /// Too little history; callers fall back to their defaults.
    InsufficientHistory { samples: usize, required: usize },
    Suggested {
        params: GenerationParams,
        approval_rate: f64,
        samples: u32,
    },
}

impl ParameterSuggestion {
    pub fn params(&self) -> Option<&GenerationParams> {
        match self {
            ParameterSuggestion::Suggested { params, .. } => Some(params),
            ParameterSuggestion::InsufficientHistory { .. } => None,
        }
    }
}

#[derive(Default)]
struct Group {
    approved: u32,
    total: u32,
}

/// Picks the (checkpoint, sampler, steps) set with the best recent
/// approval rate. `reviewed` must be in review order, oldest first.
///
/// Ties go to the set with more samples, then to the lexically smallest key
/// so the answer is stable. Seeds are never suggested.
pub fn suggest_parameters(reviewed: &[GeneratedImage], config: &SuggestConfig) -> ParameterSuggestion {
    let recent: Vec<&GeneratedImage> = reviewed
        .iter()
        .filter(|image| image.is_reviewed())
        .collect();
    let recent = &recent[recent.len().saturating_sub(config.recent_window)..];

    if recent.len() < config.min_samples {
        return ParameterSuggestion::InsufficientHistory {
            samples: recent.len(),
            required: config.min_samples,
        };
    }

    let mut groups: HashMap<(&str, &str, u32), Group> = HashMap::new();
    for image in recent {
        let group = groups
            .entry((image.checkpoint.as_str(), image.sampler.as_str(), image.steps))
            .or_default();
        group.total += 1;
        if image.review_status == ReviewStatus::Approved {
            group.approved += 1;
        }
    }

    let best = groups
        .into_iter()
        .filter(|(_, group)| group.total as usize >= config.min_group_samples)
        .map(|(key, group)| (key, approval_rate(group.approved, group.total), group.total))
        .max_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.2.cmp(&b.2))
                .then_with(|| b.0.cmp(&a.0))
        });

    match best {
        Some(((checkpoint, sampler, steps), rate, samples)) => ParameterSuggestion::Suggested {
            params: GenerationParams::new(checkpoint, sampler, steps),
            approval_rate: rate,
            samples,
        },
        None => ParameterSuggestion::InsufficientHistory {
            samples: recent.len(),
            required: config.min_samples,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::test_support::image;

    fn reviewed(checkpoint: &str, sampler: &str, approved: usize, rejected: usize) -> Vec<GeneratedImage> {
        let mut out = Vec::new();
        for i in 0..approved + rejected {
            let status = if i < approved {
                ReviewStatus::Approved
            } else {
                ReviewStatus::Rejected
            };
            let mut img = image(checkpoint, status, None);
            img.sampler = sampler.to_string();
            out.push(img);
        }
        out
    }

    #[test]
    fn test_insufficient_history_is_explicit() {
        let images = reviewed("a", "euler", 5, 4);
        assert_eq!(
            suggest_parameters(&images, &SuggestConfig::default()),
            ParameterSuggestion::InsufficientHistory {
                samples: 9,
                required: 10
            }
        );
    }

    #[test]
    fn test_best_approval_rate_wins() {
        let mut images = reviewed("a", "euler", 2, 4);
        images.extend(reviewed("b", "dpm", 5, 1));

        let suggestion = suggest_parameters(&images, &SuggestConfig::default());
        let params = suggestion.params().unwrap();
        assert_eq!(params.checkpoint, "b");
        assert_eq!(params.sampler, "dpm");
        assert_eq!(params.seed, None);
    }

    #[test]
    fn test_tiny_groups_are_not_candidates() {
        // "lucky" has a perfect rate from only two samples.
        let mut images = reviewed("steady", "euler", 7, 3);
        images.extend(reviewed("lucky", "euler", 2, 0));

        let suggestion = suggest_parameters(&images, &SuggestConfig::default());
        assert_eq!(suggestion.params().unwrap().checkpoint, "steady");
    }

    #[test]
    fn test_only_recent_window_counts() {
        let mut images = reviewed("old", "euler", 20, 0);
        images.extend(reviewed("new", "euler", 6, 4));
        let config = SuggestConfig {
            recent_window: 10,
            ..SuggestConfig::default()
        };

        let suggestion = suggest_parameters(&images, &config);
        assert_eq!(suggestion.params().unwrap().checkpoint, "new");
    }
}
