//! Checkpoint leaderboard.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::Serialize;

use crate::storage::{GeneratedImage, ReviewStatus};

use super::stats::approval_rate;

/// Aggregate performance of one checkpoint within a project.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRanking {
    pub checkpoint: String,
    /// Mean score over scored images; `None` when none are scored.
    pub avg_quality: Option<f64>,
    pub scored: u32,
    pub approved: u32,
    pub total: u32,
    pub approval_rate: f64,
}

#[derive(Default)]
struct Accumulator {
    score_sum: f64,
    scored: u32,
    approved: u32,
    total: u32,
}

/// Groups images by checkpoint and orders the groups best first.
///
/// Ordering: average quality descending (unscored groups last), then
/// approval rate, then sample count, then checkpoint name.
pub fn rank_checkpoints(images: &[GeneratedImage]) -> Vec<CheckpointRanking> {
    let mut groups: BTreeMap<&str, Accumulator> = BTreeMap::new();
    for image in images {
        let acc = groups.entry(image.checkpoint.as_str()).or_default();
        acc.total += 1;
        if image.review_status == ReviewStatus::Approved {
            acc.approved += 1;
        }
        if let Some(score) = image.quality_score {
            acc.score_sum += score;
            acc.scored += 1;
        }
    }

    let mut rankings: Vec<CheckpointRanking> = groups
        .into_iter()
        .map(|(checkpoint, acc)| CheckpointRanking {
            checkpoint: checkpoint.to_string(),
            avg_quality: (acc.scored > 0).then(|| acc.score_sum / acc.scored as f64),
            scored: acc.scored,
            approved: acc.approved,
            total: acc.total,
            approval_rate: approval_rate(acc.approved, acc.total),
        })
        .collect();

    rankings.sort_by(compare_rankings);
    rankings
}

fn compare_rankings(a: &CheckpointRanking, b: &CheckpointRanking) -> Ordering {
    let quality = match (a.avg_quality, b.avg_quality) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    quality
        .then_with(|| b.approval_rate.total_cmp(&a.approval_rate))
        .then_with(|| b.total.cmp(&a.total))
        .then_with(|| a.checkpoint.cmp(&b.checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::test_support::image;

    #[test]
    fn test_unscored_images_do_not_dilute_average() {
        let images = vec![
            image("a", ReviewStatus::Approved, Some(0.8)),
            image("a", ReviewStatus::Approved, None),
        ];
        let rankings = rank_checkpoints(&images);
        assert_eq!(rankings[0].avg_quality, Some(0.8));
        assert_eq!(rankings[0].scored, 1);
        assert_eq!(rankings[0].total, 2);
    }

    #[test]
    fn test_ordering_by_quality_then_approval_then_count() {
        let images = vec![
            // low: best approval but lowest quality
            image("low", ReviewStatus::Approved, Some(0.4)),
            // tie-a and tie-b share quality; tie-b approves more
            image("tie-a", ReviewStatus::Rejected, Some(0.7)),
            image("tie-b", ReviewStatus::Approved, Some(0.7)),
            // bigger shares quality and approval rate with tie-b but has more samples
            image("bigger", ReviewStatus::Approved, Some(0.7)),
            image("bigger", ReviewStatus::Approved, Some(0.7)),
            image("unscored", ReviewStatus::Approved, None),
        ];

        let order: Vec<String> = rank_checkpoints(&images)
            .into_iter()
            .map(|r| r.checkpoint)
            .collect();
        assert_eq!(order, vec!["bigger", "tie-b", "tie-a", "low", "unscored"]);
    }

    #[test]
    fn test_no_images_no_rankings() {
        assert!(rank_checkpoints(&[]).is_empty());
    }
}
