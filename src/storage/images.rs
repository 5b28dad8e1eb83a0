//! Generated image records and review decisions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::database::{opt_u32, parse_column, Database, DatabaseError};
use super::models::{GeneratedImage, GenerationParams, ReviewStatus};

/// Fields needed to record a generated image.
#[derive(Debug, Clone)]
pub struct NewImage {
    pub project_id: String,
    pub character_slug: String,
    pub filename: String,
    pub params: GenerationParams,
    pub job_id: Option<String>,
    pub review_status: ReviewStatus,
    pub quality_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl NewImage {
    /// A freshly generated image awaiting review.
    pub fn pending(
        project_id: impl Into<String>,
        character_slug: impl Into<String>,
        filename: impl Into<String>,
        params: GenerationParams,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            character_slug: character_slug.into(),
            filename: filename.into(),
            params,
            job_id: None,
            review_status: ReviewStatus::Pending,
            quality_score: None,
            created_at: Utc::now(),
            reviewed_at: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }

    /// Marks the image as already reviewed at `at`.
    pub fn reviewed(mut self, status: ReviewStatus, at: DateTime<Utc>) -> Self {
        self.review_status = status;
        self.reviewed_at = if status == ReviewStatus::Pending {
            None
        } else {
            Some(at)
        };
        self
    }
}

/// Approved/pending/rejected totals for one character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImageCounts {
    pub approved: u32,
    pub pending: u32,
    pub rejected: u32,
}

impl ImageCounts {
    pub fn total(&self) -> u32 {
        self.approved + self.pending + self.rejected
    }

    pub fn reviewed(&self) -> u32 {
        self.approved + self.rejected
    }
}

/// Counts for one (project, character) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterImageCounts {
    pub project_id: String,
    pub character_slug: String,
    pub counts: ImageCounts,
}

impl Database {
    /// Records a generated image and returns its id.
    pub async fn insert_image(&self, image: &NewImage) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        insert_image_with(self.pool(), &id, image).await?;
        Ok(id)
    }

    /// Retrieves an image by id.
    pub async fn get_image(&self, id: &str) -> Result<Option<GeneratedImage>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM generated_images WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(image_from_row).transpose()
    }

    /// Lists images for a character ordered by creation time.
    pub async fn list_character_images(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<Vec<GeneratedImage>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM generated_images
             WHERE project_id = ?1 AND character_slug = ?2
             ORDER BY created_at, id",
        )
        .bind(project_id)
        .bind(character_slug)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(image_from_row).collect()
    }

    /// Lists images for a project, or every image when `project_id` is `None`.
    pub async fn list_images(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<GeneratedImage>, DatabaseError> {
        let rows = match project_id {
            Some(project_id) => {
                sqlx::query(
                    "SELECT * FROM generated_images WHERE project_id = ?1 ORDER BY created_at, id",
                )
                .bind(project_id)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM generated_images ORDER BY created_at, id")
                    .fetch_all(self.pool())
                    .await?
            }
        };

        rows.iter().map(image_from_row).collect()
    }

    /// Reviewed images for a character, oldest review first.
    pub async fn reviewed_images(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<Vec<GeneratedImage>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM generated_images
             WHERE project_id = ?1 AND character_slug = ?2 AND review_status != 'pending'
             ORDER BY COALESCE(reviewed_at, created_at), id",
        )
        .bind(project_id)
        .bind(character_slug)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(image_from_row).collect()
    }

    /// Live review-status counts for one character.
    pub async fn image_counts(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<ImageCounts, DatabaseError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN review_status = 'approved' THEN 1 ELSE 0 END), 0) AS approved,
                COALESCE(SUM(CASE WHEN review_status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN review_status = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected
             FROM generated_images
             WHERE project_id = ?1 AND character_slug = ?2",
        )
        .bind(project_id)
        .bind(character_slug)
        .fetch_one(self.pool())
        .await?;

        Ok(counts_from_row(&row))
    }

    /// Review-status counts for every character that has images.
    pub async fn image_counts_by_character(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<CharacterImageCounts>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT project_id, character_slug,
                COALESCE(SUM(CASE WHEN review_status = 'approved' THEN 1 ELSE 0 END), 0) AS approved,
                COALESCE(SUM(CASE WHEN review_status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN review_status = 'rejected' THEN 1 ELSE 0 END), 0) AS rejected
             FROM generated_images
             WHERE ?1 IS NULL OR project_id = ?1
             GROUP BY project_id, character_slug
             ORDER BY project_id, character_slug",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| CharacterImageCounts {
                project_id: row.get("project_id"),
                character_slug: row.get("character_slug"),
                counts: counts_from_row(row),
            })
            .collect())
    }

    /// Applies a reviewer decision if the image is still in `expected` state.
    ///
    /// Returns `false` when another writer changed the status first.
    pub async fn set_review_status(
        &self,
        id: &str,
        expected: ReviewStatus,
        status: ReviewStatus,
        feedback: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let reviewed_at = (status != ReviewStatus::Pending).then(Utc::now);
        let result = sqlx::query(
            "UPDATE generated_images
             SET review_status = ?3, feedback = COALESCE(?4, feedback), reviewed_at = ?5
             WHERE id = ?1 AND review_status = ?2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(status.as_str())
        .bind(feedback)
        .bind(reviewed_at)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Unscored images with fewer than `max_attempts` failed scoring
    /// attempts, least-tried first and oldest first within that.
    pub async fn unscored_images(
        &self,
        limit: u32,
        max_attempts: u32,
    ) -> Result<Vec<GeneratedImage>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM generated_images
             WHERE quality_score IS NULL AND score_attempts < ?2
             ORDER BY score_attempts, created_at, id LIMIT ?1",
        )
        .bind(limit as i64)
        .bind(max_attempts as i64)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(image_from_row).collect()
    }

    /// Counts a failed scoring attempt and keeps the last error.
    ///
    /// Returns the attempts recorded so far, or `None` if the image was
    /// scored (or removed) in the meantime.
    pub async fn record_score_failure(
        &self,
        id: &str,
        error: &str,
    ) -> Result<Option<u32>, DatabaseError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE generated_images
             SET score_attempts = score_attempts + 1, score_error = ?2
             WHERE id = ?1 AND quality_score IS NULL
             RETURNING score_attempts",
        )
        .bind(id)
        .bind(error)
        .fetch_optional(self.pool())
        .await?;

        Ok(attempts.map(|n| n as u32))
    }

    /// Last scoring error and attempt count for an image.
    pub async fn score_failure(&self, id: &str) -> Result<Option<(u32, Option<String>)>, DatabaseError> {
        let row = sqlx::query("SELECT score_attempts, score_error FROM generated_images WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.map(|row| {
            (
                row.get::<i64, _>("score_attempts") as u32,
                row.get::<Option<String>, _>("score_error"),
            )
        }))
    }

    /// Stores the scorer verdict unless a score was already recorded.
    pub async fn set_image_score(
        &self,
        id: &str,
        score: f64,
        issues: &[String],
        caption: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let issues = serde_json::to_string(issues)?;
        let result = sqlx::query(
            "UPDATE generated_images SET quality_score = ?2, issues = ?3, caption = COALESCE(?4, caption)
             WHERE id = ?1 AND quality_score IS NULL",
        )
        .bind(id)
        .bind(score.clamp(0.0, 1.0))
        .bind(issues)
        .bind(caption)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Inserts an image row on any executor (pool or open transaction).
pub(crate) async fn insert_image_with<'e, E>(
    executor: E,
    id: &str,
    image: &NewImage,
) -> Result<(), DatabaseError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO generated_images (
            id, project_id, character_slug, filename, review_status, quality_score,
            checkpoint, sampler, steps, seed, job_id, created_at, reviewed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )
    .bind(id)
    .bind(&image.project_id)
    .bind(&image.character_slug)
    .bind(&image.filename)
    .bind(image.review_status.as_str())
    .bind(image.quality_score)
    .bind(&image.params.checkpoint)
    .bind(&image.params.sampler)
    .bind(image.params.steps as i64)
    .bind(image.params.seed)
    .bind(&image.job_id)
    .bind(image.created_at)
    .bind(image.reviewed_at)
    .execute(executor)
    .await?;

    Ok(())
}

fn counts_from_row(row: &SqliteRow) -> ImageCounts {
    ImageCounts {
        approved: row.get::<i64, _>("approved") as u32,
        pending: row.get::<i64, _>("pending") as u32,
        rejected: row.get::<i64, _>("rejected") as u32,
    }
}

fn image_from_row(row: &SqliteRow) -> Result<GeneratedImage, DatabaseError> {
    let issues: String = row.get("issues");
    Ok(GeneratedImage {
        id: row.get("id"),
        project_id: row.get("project_id"),
        character_slug: row.get("character_slug"),
        filename: row.get("filename"),
        review_status: parse_column(row, "review_status")?,
        quality_score: row.get("quality_score"),
        issues: serde_json::from_str(&issues)?,
        caption: row.get("caption"),
        checkpoint: row.get("checkpoint"),
        sampler: row.get("sampler"),
        steps: opt_u32(row, "steps").unwrap_or(0),
        seed: row.get("seed"),
        job_id: row.get("job_id"),
        feedback: row.get("feedback"),
        created_at: row.get("created_at"),
        reviewed_at: row.get("reviewed_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::*;

    fn params() -> GenerationParams {
        GenerationParams::new("base-v1", "euler", 30)
    }

    #[tokio::test]
    async fn test_counts_track_review_decisions() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;

        let a = db
            .insert_image(&NewImage::pending(&project.id, &character.slug, "a.png", params()))
            .await
            .unwrap();
        db.insert_image(&NewImage::pending(&project.id, &character.slug, "b.png", params()))
            .await
            .unwrap();

        assert!(db
            .set_review_status(&a, ReviewStatus::Pending, ReviewStatus::Approved, Some("nice"))
            .await
            .unwrap());

        let counts = db.image_counts(&project.id, &character.slug).await.unwrap();
        assert_eq!(
            counts,
            ImageCounts {
                approved: 1,
                pending: 1,
                rejected: 0
            }
        );

        let image = db.get_image(&a).await.unwrap().unwrap();
        assert_eq!(image.feedback.as_deref(), Some("nice"));
        assert!(image.reviewed_at.is_some());
    }

    #[tokio::test]
    async fn test_review_cas_loses_to_earlier_writer() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;
        let id = db
            .insert_image(&NewImage::pending(&project.id, &character.slug, "a.png", params()))
            .await
            .unwrap();

        assert!(db
            .set_review_status(&id, ReviewStatus::Pending, ReviewStatus::Rejected, None)
            .await
            .unwrap());
        assert!(!db
            .set_review_status(&id, ReviewStatus::Pending, ReviewStatus::Approved, None)
            .await
            .unwrap());

        let image = db.get_image(&id).await.unwrap().unwrap();
        assert_eq!(image.review_status, ReviewStatus::Rejected);
    }

    #[tokio::test]
    async fn test_score_is_written_once() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;
        let id = db
            .insert_image(&NewImage::pending(&project.id, &character.slug, "a.png", params()))
            .await
            .unwrap();

        assert_eq!(db.unscored_images(10, 3).await.unwrap().len(), 1);
        let issues = vec!["extra_fingers".to_string()];
        assert!(db.set_image_score(&id, 0.8, &issues, Some("a portrait")).await.unwrap());
        assert!(!db.set_image_score(&id, 0.1, &[], None).await.unwrap());

        let image = db.get_image(&id).await.unwrap().unwrap();
        assert_eq!(image.quality_score, Some(0.8));
        assert_eq!(image.issues, issues);
        assert!(db.unscored_images(10, 3).await.unwrap().is_empty());
        assert_eq!(db.record_score_failure(&id, "late").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_scoring_moves_to_the_back_and_gives_up() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;
        let now = Utc::now();
        let broken = db
            .insert_image(
                &NewImage::pending(&project.id, &character.slug, "broken.png", params())
                    .created_at(now - chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();
        let good = db
            .insert_image(
                &NewImage::pending(&project.id, &character.slug, "good.png", params()).created_at(now),
            )
            .await
            .unwrap();

        let first = db.unscored_images(1, 2).await.unwrap();
        assert_eq!(first[0].id, broken);

        assert_eq!(db.record_score_failure(&broken, "unreadable").await.unwrap(), Some(1));
        let next = db.unscored_images(1, 2).await.unwrap();
        assert_eq!(next[0].id, good);

        assert_eq!(db.record_score_failure(&broken, "unreadable").await.unwrap(), Some(2));
        let remaining: Vec<String> = db
            .unscored_images(10, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(remaining, vec![good]);
        assert_eq!(
            db.score_failure(&broken).await.unwrap(),
            Some((2, Some("unreadable".to_string())))
        );
    }

    #[tokio::test]
    async fn test_counts_for_unknown_character_are_zero() {
        let (_dir, db) = temp_db().await;
        let counts = db.image_counts("nope", "nobody").await.unwrap();
        assert_eq!(counts.total(), 0);
    }
}
