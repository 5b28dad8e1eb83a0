//! Image generation job rows.
//!
//! Jobs move `pending -> generating -> completed | failed`. Every move is a
//! conditional update on the recorded status, so concurrent loops can race
//! on the same row and exactly one wins.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::database::{opt_u32, parse_column, Database, DatabaseError};
use super::images::{insert_image_with, NewImage};
use super::models::{GenerationJob, GenerationParams, JobOrigin, JobStatus};

/// Fields needed to enqueue a generation job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub project_id: String,
    pub character_slug: String,
    pub batch_size: u32,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: GenerationParams,
    pub origin: JobOrigin,
}

/// Pending and generating jobs for one character.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutstandingJobs {
    /// Number of outstanding batches.
    pub batches: u32,
    /// Sum of their batch sizes.
    pub images: u32,
}

/// Everything the replenishment planner reads for one character, taken in
/// a single statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacterSupply {
    pub approved: u32,
    /// Images waiting for review.
    pub pending: u32,
    pub outstanding: OutstandingJobs,
}

impl CharacterSupply {
    /// Images that count towards the target.
    pub fn covered(&self) -> u32 {
        self.approved + self.pending + self.outstanding.images
    }
}

const INSERT_JOB_COLUMNS: &str = "id, project_id, character_slug, batch_size, prompt,
    negative_prompt, params, origin, status, created_at, updated_at";

/// One-row supply snapshot for the character bound at the `project` and
/// `slug` placeholders.
fn supply_query(project: &str, slug: &str) -> String {
    let character = format!("project_id = {} AND character_slug = {}", project, slug);
    format!(
        "SELECT
            (SELECT COUNT(*) FROM generated_images
             WHERE {c} AND review_status = 'approved') AS approved,
            (SELECT COUNT(*) FROM generated_images
             WHERE {c} AND review_status = 'pending') AS pending,
            (SELECT COUNT(*) FROM generation_jobs
             WHERE {c} AND status IN ('pending', 'generating')) AS batches,
            (SELECT COALESCE(SUM(batch_size), 0) FROM generation_jobs
             WHERE {c} AND status IN ('pending', 'generating')) AS images",
        c = character
    )
}

impl Database {
    /// Enqueues a job unconditionally (operator request).
    pub async fn insert_job(&self, job: &NewJob) -> Result<GenerationJob, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let params = serde_json::to_string(&job.params)?;

        sqlx::query(&format!(
            "INSERT INTO generation_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
            INSERT_JOB_COLUMNS
        ))
        .bind(&id)
        .bind(&job.project_id)
        .bind(&job.character_slug)
        .bind(job.batch_size as i64)
        .bind(&job.prompt)
        .bind(&job.negative_prompt)
        .bind(params)
        .bind(job.origin.as_str())
        .bind(now)
        .execute(self.pool())
        .await?;

        self.require_job(&id).await
    }

    /// Enqueues a job only if the character's supply still matches the
    /// `observed` snapshot: same number of outstanding batches and same
    /// approved + pending + in-flight total.
    ///
    /// Returns `None` when another writer enqueued, finished or reviewed
    /// something in between, in which case the caller should re-plan on its
    /// next tick.
    pub async fn enqueue_job_if_unchanged(
        &self,
        job: &NewJob,
        observed: &CharacterSupply,
    ) -> Result<Option<GenerationJob>, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let params = serde_json::to_string(&job.params)?;

        let result = sqlx::query(&format!(
            "INSERT INTO generation_jobs ({columns})
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9
             FROM ({supply}) AS supply
             WHERE supply.batches = ?10
               AND supply.approved + supply.pending + supply.images = ?11",
            columns = INSERT_JOB_COLUMNS,
            supply = supply_query("?2", "?3"),
        ))
        .bind(&id)
        .bind(&job.project_id)
        .bind(&job.character_slug)
        .bind(job.batch_size as i64)
        .bind(&job.prompt)
        .bind(&job.negative_prompt)
        .bind(params)
        .bind(job.origin.as_str())
        .bind(now)
        .bind(observed.outstanding.batches as i64)
        .bind(observed.covered() as i64)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.require_job(&id).await.map(Some)
    }

    /// Approved, pending and outstanding counts for a character as of one
    /// read.
    pub async fn character_supply(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<CharacterSupply, DatabaseError> {
        let row = sqlx::query(&supply_query("?1", "?2"))
            .bind(project_id)
            .bind(character_slug)
            .fetch_one(self.pool())
            .await?;

        Ok(CharacterSupply {
            approved: row.get::<i64, _>("approved") as u32,
            pending: row.get::<i64, _>("pending") as u32,
            outstanding: OutstandingJobs {
                batches: row.get::<i64, _>("batches") as u32,
                images: row.get::<i64, _>("images") as u32,
            },
        })
    }

    /// Outstanding batches and images for a character.
    pub async fn outstanding_jobs(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<OutstandingJobs, DatabaseError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS batches, COALESCE(SUM(batch_size), 0) AS images
             FROM generation_jobs
             WHERE project_id = ?1 AND character_slug = ?2
               AND status IN ('pending', 'generating')",
        )
        .bind(project_id)
        .bind(character_slug)
        .fetch_one(self.pool())
        .await?;

        Ok(OutstandingJobs {
            batches: row.get::<i64, _>("batches") as u32,
            images: row.get::<i64, _>("images") as u32,
        })
    }

    /// Retrieves a job by id.
    pub async fn get_job(&self, id: &str) -> Result<Option<GenerationJob>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM generation_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn require_job(&self, id: &str) -> Result<GenerationJob, DatabaseError> {
        self.get_job(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("generation job {}", id)))
    }

    /// Jobs in `status`, oldest first.
    pub async fn jobs_with_status(
        &self,
        status: JobStatus,
        limit: u32,
    ) -> Result<Vec<GenerationJob>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM generation_jobs WHERE status = ?1 ORDER BY created_at, id LIMIT ?2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Jobs for one character, newest first.
    pub async fn list_character_jobs(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<Vec<GenerationJob>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM generation_jobs WHERE project_id = ?1 AND character_slug = ?2
             ORDER BY created_at DESC, id",
        )
        .bind(project_id)
        .bind(character_slug)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    /// Claims a pending job for submission (`pending -> generating`).
    pub async fn claim_job(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET status = 'generating', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records the backend handle of a claimed job.
    pub async fn set_job_handle(&self, id: &str, handle: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET backend_handle = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'generating'",
        )
        .bind(id)
        .bind(handle)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Completes a generating job and records its images atomically.
    ///
    /// Returns `false` (and records nothing) if the job was no longer
    /// generating, e.g. because it was cancelled meanwhile.
    pub async fn complete_job(&self, id: &str, images: &[NewImage]) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query(
            "UPDATE generation_jobs SET status = 'completed', updated_at = ?2
             WHERE id = ?1 AND status = 'generating'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for image in images {
            insert_image_with(&mut *tx, &Uuid::new_v4().to_string(), image).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Fails a job that is still pending or generating.
    pub async fn fail_job(&self, id: &str, reason: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE generation_jobs SET status = 'failed', error_message = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'generating')",
        )
        .bind(id)
        .bind(reason)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn job_from_row(row: &SqliteRow) -> Result<GenerationJob, DatabaseError> {
    let params: String = row.get("params");
    Ok(GenerationJob {
        id: row.get("id"),
        project_id: row.get("project_id"),
        character_slug: row.get("character_slug"),
        batch_size: opt_u32(row, "batch_size").unwrap_or(0),
        prompt: row.get("prompt"),
        negative_prompt: row.get("negative_prompt"),
        params: serde_json::from_str(&params)?,
        origin: parse_column::<JobOrigin>(row, "origin")?,
        status: parse_column(row, "status")?,
        backend_handle: row.get("backend_handle"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
