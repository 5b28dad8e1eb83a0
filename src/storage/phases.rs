//! Pipeline phase rows and their audit trail.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::database::{opt_u32, parse_column, Database, DatabaseError};
use super::models::{Actor, EntityType, PhaseStatus, PipelineAudit, PipelineEntry};

/// A single compare-and-set move of one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseTransition {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub phase: String,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
    pub actor: Actor,
    pub reason: String,
}

impl Database {
    /// Creates one row per phase; the first is active, the rest pending.
    ///
    /// Existing rows are left untouched, so calling this again is a no-op.
    /// Returns the number of rows created.
    pub async fn initialize_pipeline(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        phases: &[&str],
    ) -> Result<u64, DatabaseError> {
        let mut tx = self.pool().begin().await?;

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pipeline_entries WHERE entity_type = ?1 AND entity_id = ?2",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        let mut created = 0;
        for (position, phase) in phases.iter().enumerate() {
            let status = if position == 0 && existing == 0 {
                PhaseStatus::Active
            } else {
                PhaseStatus::Pending
            };

            let result = sqlx::query(
                "INSERT OR IGNORE INTO pipeline_entries
                    (entity_type, entity_id, phase, position, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(entity_type.as_str())
            .bind(entity_id)
            .bind(*phase)
            .bind(position as i64)
            .bind(status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected();
        }

        tx.commit().await?;
        Ok(created)
    }

    /// Phases of one entity in declared order.
    pub async fn pipeline_entries(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PipelineEntry>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_entries WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY position",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Every pipeline row, grouped by entity and ordered by position.
    pub async fn all_pipeline_entries(&self) -> Result<Vec<PipelineEntry>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_entries ORDER BY entity_type, entity_id, position",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Applies a group of phase moves all-or-nothing.
    ///
    /// Each move only succeeds if the phase is still in its `from` status.
    /// If any move loses its race the whole group is rolled back and
    /// `false` is returned. Every applied move is appended to the audit log.
    pub async fn apply_phase_transitions(
        &self,
        transitions: &[PhaseTransition],
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool().begin().await?;
        let now = Utc::now();

        for t in transitions {
            let result = sqlx::query(
                "UPDATE pipeline_entries SET status = ?5, updated_at = ?6
                 WHERE entity_type = ?1 AND entity_id = ?2 AND phase = ?3 AND status = ?4",
            )
            .bind(t.entity_type.as_str())
            .bind(&t.entity_id)
            .bind(&t.phase)
            .bind(t.from.as_str())
            .bind(t.to.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO pipeline_audit
                    (entity_type, entity_id, phase, from_status, to_status, actor, reason, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(t.entity_type.as_str())
            .bind(&t.entity_id)
            .bind(&t.phase)
            .bind(t.from.as_str())
            .bind(t.to.as_str())
            .bind(t.actor.as_str())
            .bind(&t.reason)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Audit trail of one entity, oldest first.
    pub async fn pipeline_audit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PipelineAudit>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_audit WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id",
        )
        .bind(entity_type.as_str())
        .bind(entity_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PipelineAudit {
                    entity_type: parse_column(row, "entity_type")?,
                    entity_id: row.get("entity_id"),
                    phase: row.get("phase"),
                    from_status: parse_column(row, "from_status")?,
                    to_status: parse_column(row, "to_status")?,
                    actor: parse_column(row, "actor")?,
                    reason: row.get("reason"),
                    at: row.get("at"),
                })
            })
            .collect()
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<PipelineEntry, DatabaseError> {
    Ok(PipelineEntry {
        entity_type: parse_column(row, "entity_type")?,
        entity_id: row.get("entity_id"),
        phase: row.get("phase"),
        position: opt_u32(row, "position").unwrap_or(0),
        status: parse_column(row, "status")?,
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::*;

    const PHASES: &[&str] = &["first", "second", "third"];

    fn transition(phase: &str, from: PhaseStatus, to: PhaseStatus) -> PhaseTransition {
        PhaseTransition {
            entity_type: EntityType::Character,
            entity_id: "c1".to_string(),
            phase: phase.to_string(),
            from,
            to,
            actor: Actor::Auto,
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (_dir, db) = temp_db().await;
        assert_eq!(
            db.initialize_pipeline(EntityType::Character, "c1", PHASES).await.unwrap(),
            3
        );

        db.apply_phase_transitions(&[
            transition("first", PhaseStatus::Active, PhaseStatus::Completed),
            transition("second", PhaseStatus::Pending, PhaseStatus::Active),
        ])
        .await
        .unwrap();

        assert_eq!(
            db.initialize_pipeline(EntityType::Character, "c1", PHASES).await.unwrap(),
            0
        );
        let entries = db.pipeline_entries(EntityType::Character, "c1").await.unwrap();
        let statuses: Vec<_> = entries.iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![PhaseStatus::Completed, PhaseStatus::Active, PhaseStatus::Pending]
        );
    }

    #[tokio::test]
    async fn test_transition_group_rolls_back_on_lost_race() {
        let (_dir, db) = temp_db().await;
        db.initialize_pipeline(EntityType::Character, "c1", PHASES).await.unwrap();

        let applied = db
            .apply_phase_transitions(&[
                transition("first", PhaseStatus::Active, PhaseStatus::Completed),
                // "third" is pending, not active, so this move loses.
                transition("third", PhaseStatus::Active, PhaseStatus::Completed),
            ])
            .await
            .unwrap();
        assert!(!applied);

        let entries = db.pipeline_entries(EntityType::Character, "c1").await.unwrap();
        assert_eq!(entries[0].status, PhaseStatus::Active);
        assert!(db
            .pipeline_audit(EntityType::Character, "c1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_applied_transitions_are_audited() {
        let (_dir, db) = temp_db().await;
        db.initialize_pipeline(EntityType::Character, "c1", PHASES).await.unwrap();

        let mut skip = transition("first", PhaseStatus::Active, PhaseStatus::Skipped);
        skip.actor = Actor::Operator;
        assert!(db.apply_phase_transitions(&[skip]).await.unwrap());

        let audit = db.pipeline_audit(EntityType::Character, "c1").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, Actor::Operator);
        assert_eq!(audit[0].to_status, PhaseStatus::Skipped);
    }
}
