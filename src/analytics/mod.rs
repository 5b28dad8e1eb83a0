//! Quality and drift analytics.
//!
//! Read-only queries over generated images and review decisions. Every
//! aggregate is recomputed from the datastore on each call; nothing here
//! keeps running totals.
//!
//! Whenever there is too little data to answer, the result says so with an
//! explicit `InsufficientHistory` variant instead of reporting zero.

pub mod drift;
pub mod monitor;
pub mod rankings;
pub mod stats;
pub mod suggest;
pub mod trend;

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::storage::{Database, DatabaseError, ImageCounts};

pub use drift::{assess_drift, drift_history, DriftAlert, DriftAssessment, DriftConfig};
pub use monitor::DriftMonitor;
pub use rankings::{rank_checkpoints, CheckpointRanking};
pub use stats::{approval_rate, CharacterStats};
pub use suggest::{suggest_parameters, ParameterSuggestion, SuggestConfig};
pub use trend::{daily_trend, TrendBucket, TrendScope, MAX_TREND_DAYS};

/// Errors that can occur while computing analytics.
#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// The character does not exist.
    #[error("Unknown character '{slug}' in project {project_id}")]
    UnknownCharacter { project_id: String, slug: String },

    /// Trend window outside `1..=MAX_TREND_DAYS`.
    #[error("Invalid trend window of {days} days (allowed 1..={max})")]
    InvalidWindow { days: u32, max: u32 },
}

/// Analytics service over the shared datastore.
#[derive(Debug, Clone)]
pub struct Analytics {
    db: Database,
    drift: DriftConfig,
    suggest: SuggestConfig,
}

impl Analytics {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            drift: DriftConfig::default(),
            suggest: SuggestConfig::default(),
        }
    }

    pub fn with_drift_config(mut self, config: DriftConfig) -> Self {
        self.drift = config;
        self
    }

    pub fn with_suggest_config(mut self, config: SuggestConfig) -> Self {
        self.suggest = config;
        self
    }

    pub fn drift_config(&self) -> &DriftConfig {
        &self.drift
    }

    /// Review totals per character, optionally for one project.
    ///
    /// Characters without any images are included with zero totals.
    pub async fn dataset_stats(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<CharacterStats>, AnalyticsError> {
        let mut by_key: BTreeMap<(String, String), ImageCounts> = BTreeMap::new();
        for character in self.db.list_characters(project_id).await? {
            by_key.insert((character.project_id, character.slug), ImageCounts::default());
        }
        for row in self.db.image_counts_by_character(project_id).await? {
            by_key.insert((row.project_id, row.character_slug), row.counts);
        }

        Ok(by_key
            .into_iter()
            .map(|((project_id, slug), counts)| CharacterStats::from_counts(project_id, slug, counts))
            .collect())
    }

    /// Checkpoints of a project ordered best first.
    pub async fn checkpoint_rankings(
        &self,
        project_id: &str,
    ) -> Result<Vec<CheckpointRanking>, AnalyticsError> {
        let images = self.db.list_images(Some(project_id)).await?;
        Ok(rank_checkpoints(&images))
    }

    /// Daily quality over the last `days` days, ending today (UTC).
    pub async fn quality_trend(
        &self,
        scope: &TrendScope,
        days: u32,
    ) -> Result<Vec<TrendBucket>, AnalyticsError> {
        self.quality_trend_until(scope, days, Utc::now().date_naive())
            .await
    }

    /// Daily quality over the `days` days ending on `today`.
    pub async fn quality_trend_until(
        &self,
        scope: &TrendScope,
        days: u32,
        today: NaiveDate,
    ) -> Result<Vec<TrendBucket>, AnalyticsError> {
        if days == 0 || days > MAX_TREND_DAYS {
            return Err(AnalyticsError::InvalidWindow {
                days,
                max: MAX_TREND_DAYS,
            });
        }
        let images = match scope {
            TrendScope::Character {
                project_id,
                character_slug,
            } => {
                self.require_character(project_id, character_slug).await?;
                self.db
                    .list_character_images(project_id, character_slug)
                    .await?
            }
            TrendScope::Project(project_id) => self.db.list_images(Some(project_id)).await?,
        };
        Ok(daily_trend(&images, today, days))
    }

    /// Current drift assessment for a character.
    pub async fn drift_alert(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<DriftAssessment, AnalyticsError> {
        let scores = self.reviewed_scores(project_id, character_slug).await?;
        Ok(assess_drift(character_slug, &scores, &self.drift))
    }

    /// Drift assessments at the last `points` review points, newest first.
    pub async fn drift_history(
        &self,
        project_id: &str,
        character_slug: &str,
        points: usize,
    ) -> Result<Vec<DriftAssessment>, AnalyticsError> {
        let scores = self.reviewed_scores(project_id, character_slug).await?;
        Ok(drift_history(character_slug, &scores, points, &self.drift))
    }

    /// Best recent parameter set for a character.
    pub async fn suggest_parameters(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<ParameterSuggestion, AnalyticsError> {
        self.require_character(project_id, character_slug).await?;
        let reviewed = self.db.reviewed_images(project_id, character_slug).await?;
        Ok(suggest_parameters(&reviewed, &self.suggest))
    }

    async fn reviewed_scores(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<Vec<Option<f64>>, AnalyticsError> {
        self.require_character(project_id, character_slug).await?;
        let reviewed = self.db.reviewed_images(project_id, character_slug).await?;
        Ok(reviewed.iter().map(|image| image.quality_score).collect())
    }

    async fn require_character(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<(), AnalyticsError> {
        if self.db.get_character(project_id, character_slug).await?.is_none() {
            return Err(AnalyticsError::UnknownCharacter {
                project_id: project_id.to_string(),
                slug: character_slug.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use crate::storage::{GeneratedImage, ReviewStatus};

    /// An in-memory image for the pure aggregation functions.
    pub fn image(checkpoint: &str, status: ReviewStatus, score: Option<f64>) -> GeneratedImage {
        let now = Utc::now();
        GeneratedImage {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: "p1".to_string(),
            character_slug: "mira".to_string(),
            filename: "img.png".to_string(),
            review_status: status,
            quality_score: score,
            issues: Vec::new(),
            caption: None,
            checkpoint: checkpoint.to_string(),
            sampler: "euler".to_string(),
            steps: 30,
            seed: None,
            job_id: None,
            feedback: None,
            created_at: now,
            reviewed_at: (status != ReviewStatus::Pending).then_some(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::*;
    use crate::storage::{GenerationParams, NewImage, ReviewStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_dataset_stats_include_characters_without_images() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;

        let stats = Analytics::new(db).dataset_stats(Some(&project.id)).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total, 0);
        assert_eq!(stats[0].approval_rate, 0.0);
    }

    #[tokio::test]
    async fn test_drift_alert_from_stored_reviews() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;
        let start = Utc::now() - Duration::hours(1);

        for i in 0..20 {
            let score = if i < 15 { 0.9 } else { 0.3 };
            let at = start + Duration::seconds(i);
            db.insert_image(
                &NewImage::pending(
                    &project.id,
                    &character.slug,
                    format!("{}.png", i),
                    GenerationParams::new("base-v1", "euler", 30),
                )
                .with_score(score)
                .created_at(at)
                .reviewed(ReviewStatus::Approved, at),
            )
            .await
            .unwrap();
        }

        let analytics = Analytics::new(db).with_drift_config(DriftConfig {
            window: 5,
            ..DriftConfig::default()
        });
        let assessment = analytics.drift_alert(&project.id, "mira").await.unwrap();
        let alert = assessment.measurement().unwrap();
        assert!(alert.alert);
        assert!((alert.drift + 0.45).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_trend_window_is_bounded() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let analytics = Analytics::new(db);
        let scope = TrendScope::Project(project.id.clone());

        for days in [0, MAX_TREND_DAYS + 1, 200_000_000] {
            let result = analytics.quality_trend(&scope, days).await;
            assert!(matches!(
                result,
                Err(AnalyticsError::InvalidWindow { days: d, max: MAX_TREND_DAYS }) if d == days
            ));
        }
        let trend = analytics.quality_trend(&scope, 7).await.unwrap();
        assert_eq!(trend.len(), 7);
    }

    #[tokio::test]
    async fn test_unknown_character_is_an_error() {
        let (_dir, db) = temp_db().await;
        let result = Analytics::new(db).drift_alert("p", "ghost").await;
        assert!(matches!(result, Err(AnalyticsError::UnknownCharacter { .. })));
    }
}
