//! Per-character dataset totals.

use serde::Serialize;

use crate::storage::ImageCounts;

/// Review totals for one character.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CharacterStats {
    pub project_id: String,
    pub character_slug: String,
    pub approved: u32,
    pub pending: u32,
    pub rejected: u32,
    pub total: u32,
    /// approved / total, or 0 when there are no images.
    pub approval_rate: f64,
}

impl CharacterStats {
    pub fn from_counts(
        project_id: impl Into<String>,
        character_slug: impl Into<String>,
        counts: ImageCounts,
    ) -> Self {
        let total = counts.total();
        Self {
            project_id: project_id.into(),
            character_slug: character_slug.into(),
            approved: counts.approved,
            pending: counts.pending,
            rejected: counts.rejected,
            total,
            approval_rate: approval_rate(counts.approved, total),
        }
    }
}

/// `approved / total`, defined as 0 for an empty set.
pub fn approval_rate(approved: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (approved as f64 / total as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_approval_rate_is_zero() {
        let rate = approval_rate(0, 0);
        assert_eq!(rate, 0.0);
        assert!(!rate.is_nan());
    }

    #[test]
    fn test_approval_rate_stays_in_unit_interval() {
        for (approved, total) in [(0, 5), (3, 4), (7, 7), (1, 3)] {
            let rate = approval_rate(approved, total);
            assert!((0.0..=1.0).contains(&rate));
        }
    }

    #[test]
    fn test_stats_from_counts() {
        let stats = CharacterStats::from_counts(
            "p1",
            "mira",
            ImageCounts {
                approved: 3,
                pending: 1,
                rejected: 1,
            },
        );
        assert_eq!(stats.total, 5);
        assert!((stats.approval_rate - 0.6).abs() < 1e-9);
    }
}
