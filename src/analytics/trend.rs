//! Daily quality trend.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::storage::GeneratedImage;

/// What a trend query covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrendScope {
    Character {
        project_id: String,
        character_slug: String,
    },
    Project(String),
}

/// One calendar day of scored output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendBucket {
    pub date: NaiveDate,
    /// Scored images created that day.
    pub samples: u32,
    /// `None` for days with no scored images.
    pub avg_quality: Option<f64>,
}

/// Longest trend window, in days.
pub const MAX_TREND_DAYS: u32 = 3660;

/// Buckets scored images by creation day over the `days` days ending on
/// `today` (inclusive), oldest first. Every day in the window is present.
///
/// The window is clamped to [`MAX_TREND_DAYS`] and to the earliest
/// representable date.
pub fn daily_trend(images: &[GeneratedImage], today: NaiveDate, days: u32) -> Vec<TrendBucket> {
    let days = days.min(MAX_TREND_DAYS);
    if days == 0 {
        return Vec::new();
    }
    let start = today
        .checked_sub_signed(Duration::days(days as i64 - 1))
        .unwrap_or(NaiveDate::MIN);
    let days = (today - start).num_days() + 1;

    let mut sums: HashMap<NaiveDate, (f64, u32)> = HashMap::new();
    for image in images {
        let Some(score) = image.quality_score else {
            continue;
        };
        let date = image.created_at.date_naive();
        if date < start || date > today {
            continue;
        }
        let entry = sums.entry(date).or_insert((0.0, 0));
        entry.0 += score;
        entry.1 += 1;
    }

    (0..days)
        .map(|offset| {
            let date = start + Duration::days(offset);
            match sums.get(&date) {
                Some(&(sum, samples)) => TrendBucket {
                    date,
                    samples,
                    avg_quality: Some(sum / samples as f64),
                },
                None => TrendBucket {
                    date,
                    samples: 0,
                    avg_quality: None,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::test_support::image;
    use crate::storage::ReviewStatus;
    use chrono::{TimeZone, Utc};

    fn at_day(day: u32, score: Option<f64>) -> GeneratedImage {
        let mut img = image("base", ReviewStatus::Approved, score);
        img.created_at = Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap();
        img
    }

    #[test]
    fn test_empty_days_have_no_average() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let images = vec![at_day(3, Some(0.6)), at_day(3, Some(0.8)), at_day(5, Some(0.5))];

        let trend = daily_trend(&images, today, 3);
        assert_eq!(trend.len(), 3);

        assert_eq!(trend[0].date, NaiveDate::from_ymd_opt(2026, 3, 3).unwrap());
        assert_eq!(trend[0].samples, 2);
        assert!((trend[0].avg_quality.unwrap() - 0.7).abs() < 1e-9);

        assert_eq!(trend[1].samples, 0);
        assert_eq!(trend[1].avg_quality, None);

        assert_eq!(trend[2].avg_quality, Some(0.5));
    }

    #[test]
    fn test_huge_window_is_clamped() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let trend = daily_trend(&[at_day(5, Some(0.4))], today, 200_000_000);

        assert_eq!(trend.len(), MAX_TREND_DAYS as usize);
        assert_eq!(trend.last().unwrap().date, today);
        assert_eq!(trend.last().unwrap().avg_quality, Some(0.4));
    }

    #[test]
    fn test_window_stops_at_earliest_date() {
        let today = NaiveDate::MIN + Duration::days(2);
        let trend = daily_trend(&[], today, 30);

        assert_eq!(trend.len(), 3);
        assert_eq!(trend[0].date, NaiveDate::MIN);
    }

    #[test]
    fn test_unscored_and_out_of_window_images_are_ignored() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 5).unwrap();
        let images = vec![at_day(1, Some(0.9)), at_day(5, None)];

        let trend = daily_trend(&images, today, 2);
        assert!(trend.iter().all(|b| b.samples == 0 && b.avg_quality.is_none()));
    }
}
