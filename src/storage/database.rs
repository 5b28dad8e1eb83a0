//! SQLite database client for persistent storage.
//!
//! This module provides the connection handling plus project, character and
//! settings operations. Images, jobs, pipeline phases and production rows
//! live in sibling modules as further `impl Database` blocks.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::models::{Character, ParseStatusError, Project, TrainingStatus};

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// A stored value could not be interpreted.
    #[error("Invalid stored data: {0}")]
    InvalidData(#[from] ParseStatusError),

    /// A write was rejected because other rows still depend on the target.
    #[error("Record still referenced: {0}")]
    StillReferenced(String),
}

/// Fields needed to create a character.
#[derive(Debug, Clone)]
pub struct NewCharacter {
    pub project_id: String,
    pub slug: String,
    pub name: String,
    pub design_prompt: String,
    pub checkpoint: Option<String>,
    pub replenish_target: Option<u32>,
}

impl NewCharacter {
    pub fn new(
        project_id: impl Into<String>,
        slug: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            slug: slug.into(),
            name: name.into(),
            design_prompt: String::new(),
            checkpoint: None,
            replenish_target: None,
        }
    }

    pub fn with_design_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.design_prompt = prompt.into();
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.checkpoint = Some(checkpoint.into());
        self
    }

    pub fn with_target(mut self, target: u32) -> Self {
        self.replenish_target = Some(target);
        self
    }
}

/// SQLite database client.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl Database {
    /// Opens (creating if missing) the database file and applies migrations.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let db = Self { pool };
        db.run_migrations().await?;

        tracing::info!(path = path, "Database opened");
        Ok(db)
    }

    /// Creates a new database client from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Project Operations
    // =========================================================================

    /// Creates a project with its style configuration.
    pub async fn create_project(
        &self,
        name: &str,
        default_checkpoint: Option<&str>,
        prompt_template: &str,
        negative_prompt: Option<&str>,
    ) -> Result<Project, DatabaseError> {
        let project = Project {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            default_checkpoint: default_checkpoint.map(str::to_string),
            prompt_template: prompt_template.to_string(),
            negative_prompt: negative_prompt.map(str::to_string),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO projects (id, name, default_checkpoint, prompt_template, negative_prompt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.default_checkpoint)
        .bind(&project.prompt_template)
        .bind(&project.negative_prompt)
        .bind(project.created_at)
        .execute(&self.pool)
        .await?;

        Ok(project)
    }

    /// Retrieves a project by id.
    pub async fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| project_from_row(&r)))
    }

    /// Lists all projects ordered by creation time.
    pub async fn list_projects(&self) -> Result<Vec<Project>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(project_from_row).collect())
    }

    // =========================================================================
    // Character Operations
    // =========================================================================

    /// Creates a character. Slugs are unique per project.
    pub async fn create_character(&self, new: &NewCharacter) -> Result<Character, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        sqlx::query(
            "INSERT INTO characters (
                id, project_id, slug, name, design_prompt, checkpoint,
                replenish_target, replenish_enabled, training_status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 'not_started', ?8)",
        )
        .bind(&id)
        .bind(&new.project_id)
        .bind(&new.slug)
        .bind(&new.name)
        .bind(&new.design_prompt)
        .bind(&new.checkpoint)
        .bind(new.replenish_target.map(|t| t as i64))
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_character_by_id(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("character {}", id)))
    }

    /// Retrieves a character by its id.
    pub async fn get_character_by_id(&self, id: &str) -> Result<Option<Character>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM characters WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(character_from_row).transpose()
    }

    /// Retrieves a character by project and slug.
    pub async fn get_character(
        &self,
        project_id: &str,
        slug: &str,
    ) -> Result<Option<Character>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM characters WHERE project_id = ?1 AND slug = ?2")
            .bind(project_id)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(character_from_row).transpose()
    }

    /// Lists characters, optionally restricted to one project.
    pub async fn list_characters(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<Character>, DatabaseError> {
        let rows = match project_id {
            Some(project_id) => {
                sqlx::query("SELECT * FROM characters WHERE project_id = ?1 ORDER BY slug")
                    .bind(project_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM characters ORDER BY project_id, slug")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(character_from_row).collect()
    }

    /// Enables or disables replenishment for one character.
    pub async fn set_character_replenish_enabled(
        &self,
        character_id: &str,
        enabled: bool,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE characters SET replenish_enabled = ?2 WHERE id = ?1")
            .bind(character_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;

        expect_one_row(result.rows_affected(), || format!("character {}", character_id))
    }

    /// Sets (or clears, with `None`) a character's replenishment target.
    pub async fn set_character_replenish_target(
        &self,
        character_id: &str,
        target: Option<u32>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE characters SET replenish_target = ?2 WHERE id = ?1")
            .bind(character_id)
            .bind(target.map(|t| t as i64))
            .execute(&self.pool)
            .await?;

        expect_one_row(result.rows_affected(), || format!("character {}", character_id))
    }

    /// Records where a character's training dataset was written.
    pub async fn set_training_dataset(
        &self,
        character_id: &str,
        path: &str,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query("UPDATE characters SET training_dataset_path = ?2 WHERE id = ?1")
            .bind(character_id)
            .bind(path)
            .execute(&self.pool)
            .await?;

        expect_one_row(result.rows_affected(), || format!("character {}", character_id))
    }

    /// Records the outcome of the external training job.
    pub async fn record_training_result(
        &self,
        character_id: &str,
        status: TrainingStatus,
        model_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE characters SET training_status = ?2, model_path = ?3, training_error = ?4
             WHERE id = ?1",
        )
        .bind(character_id)
        .bind(status.as_str())
        .bind(model_path)
        .bind(error)
        .execute(&self.pool)
        .await?;

        expect_one_row(result.rows_affected(), || format!("character {}", character_id))
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Reads a setting value.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("value")))
    }

    /// Writes a setting value, replacing any previous one.
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Maps a zero-row update to `NotFound`.
pub(crate) fn expect_one_row(
    rows_affected: u64,
    what: impl FnOnce() -> String,
) -> Result<(), DatabaseError> {
    if rows_affected == 0 {
        return Err(DatabaseError::NotFound(what()));
    }
    Ok(())
}

/// Parses a stored status column.
pub(crate) fn parse_column<T>(row: &SqliteRow, column: &str) -> Result<T, DatabaseError>
where
    T: FromStr<Err = ParseStatusError>,
{
    let raw: String = row.try_get(column)?;
    Ok(raw.parse()?)
}

/// Reads an optional non-negative integer column.
pub(crate) fn opt_u32(row: &SqliteRow, column: &str) -> Option<u32> {
    row.get::<Option<i64>, _>(column).map(|v| v.max(0) as u32)
}

fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        name: row.get("name"),
        default_checkpoint: row.get("default_checkpoint"),
        prompt_template: row.get("prompt_template"),
        negative_prompt: row.get("negative_prompt"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}

fn character_from_row(row: &SqliteRow) -> Result<Character, DatabaseError> {
    Ok(Character {
        id: row.get("id"),
        project_id: row.get("project_id"),
        slug: row.get("slug"),
        name: row.get("name"),
        design_prompt: row.get("design_prompt"),
        checkpoint: row.get("checkpoint"),
        replenish_target: opt_u32(row, "replenish_target"),
        replenish_enabled: row.get("replenish_enabled"),
        training_dataset_path: row.get("training_dataset_path"),
        model_path: row.get("model_path"),
        training_status: parse_column(row, "training_status")?,
        training_error: row.get("training_error"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Opens a fresh database in a temporary directory.
    ///
    /// The directory guard must outlive the database.
    pub async fn temp_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        (dir, db)
    }

    /// Creates a project with one character and returns both.
    pub async fn project_with_character(db: &Database, slug: &str) -> (Project, Character) {
        let project = db
            .create_project("Test Project", Some("base-v1"), "{{ name }}", None)
            .await
            .unwrap();
        let character = db
            .create_character(&NewCharacter::new(&project.id, slug, slug.to_uppercase()))
            .await
            .unwrap();
        (project, character)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_create_and_get_character() {
        let (_dir, db) = temp_db().await;
        let project = db
            .create_project("Show", None, "{{ name }}", None)
            .await
            .unwrap();

        let created = db
            .create_character(
                &NewCharacter::new(&project.id, "mira", "Mira")
                    .with_checkpoint("mira-v2")
                    .with_target(25),
            )
            .await
            .unwrap();

        let fetched = db.get_character(&project.id, "mira").await.unwrap().unwrap();
        assert_eq!(created, fetched);
        assert_eq!(fetched.replenish_target, Some(25));
        assert!(fetched.replenish_enabled);
        assert_eq!(fetched.training_status, TrainingStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;

        let result = db
            .create_character(&NewCharacter::new(&project.id, "mira", "Other"))
            .await;
        assert!(matches!(result, Err(DatabaseError::QueryFailed(_))));
    }

    #[tokio::test]
    async fn test_settings_upsert() {
        let (_dir, db) = temp_db().await;
        assert_eq!(db.get_setting("k").await.unwrap(), None);

        db.set_setting("k", "1").await.unwrap();
        db.set_setting("k", "2").await.unwrap();
        assert_eq!(db.get_setting("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_update_missing_character_is_not_found() {
        let (_dir, db) = temp_db().await;
        let result = db.set_character_replenish_enabled("nope", false).await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }
}
