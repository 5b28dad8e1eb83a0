//! Scene, shot and episode rows.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::database::{expect_one_row, opt_u32, parse_column, Database, DatabaseError};
use super::models::{
    Episode, EpisodeScene, EpisodeStatus, NewShot, Scene, Shot, ShotStatus, Transition,
};

impl Database {
    // =========================================================================
    // Scenes
    // =========================================================================

    pub async fn create_scene(
        &self,
        project_id: &str,
        title: &str,
        target_duration_seconds: Option<f64>,
    ) -> Result<Scene, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO scenes (id, project_id, title, target_duration_seconds, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(project_id)
        .bind(title)
        .bind(target_duration_seconds)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.get_scene(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("scene {}", id)))
    }

    pub async fn get_scene(&self, id: &str) -> Result<Option<Scene>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM scenes WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        Ok(row.as_ref().map(scene_from_row))
    }

    pub async fn list_scenes(&self, project_id: &str) -> Result<Vec<Scene>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM scenes WHERE project_id = ?1 ORDER BY title, id")
            .bind(project_id)
            .fetch_all(self.pool())
            .await?;

        Ok(rows.iter().map(scene_from_row).collect())
    }

    /// Deletes a scene and its shots.
    ///
    /// Scenes referenced by an episode are never deleted.
    pub async fn delete_scene(&self, id: &str) -> Result<(), DatabaseError> {
        let references: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM episode_scenes WHERE scene_id = ?1")
                .bind(id)
                .fetch_one(self.pool())
                .await?;
        if references > 0 {
            return Err(DatabaseError::StillReferenced(format!(
                "scene {} is used by {} episode slot(s)",
                id, references
            )));
        }

        let result = sqlx::query("DELETE FROM scenes WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        expect_one_row(result.rows_affected(), || format!("scene {}", id))
    }

    /// Records the artifact of a scene assembly, replacing any earlier one.
    pub async fn record_scene_assembly(
        &self,
        id: &str,
        final_video_path: &str,
        duration_seconds: f64,
        shot_count: u32,
    ) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "UPDATE scenes SET final_video_path = ?2, actual_duration_seconds = ?3,
                assembled_shot_count = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(final_video_path)
        .bind(duration_seconds)
        .bind(shot_count as i64)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        expect_one_row(result.rows_affected(), || format!("scene {}", id))
    }

    // =========================================================================
    // Shots
    // =========================================================================

    pub async fn add_shot(&self, scene_id: &str, shot: &NewShot) -> Result<Shot, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO shots (
                id, scene_id, shot_number, shot_type, camera_angle, duration_seconds,
                motion_prompt, source_image_path, seed, steps, engine,
                transition_kind, transition_duration, status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'draft', ?14)",
        )
        .bind(&id)
        .bind(scene_id)
        .bind(shot.shot_number as i64)
        .bind(&shot.shot_type)
        .bind(&shot.camera_angle)
        .bind(shot.duration_seconds)
        .bind(&shot.motion_prompt)
        .bind(&shot.source_image_path)
        .bind(shot.seed)
        .bind(shot.steps.map(|s| s as i64))
        .bind(&shot.engine)
        .bind(shot.transition.kind.as_str())
        .bind(shot.transition.duration_seconds)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.get_shot(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("shot {}", id)))
    }

    pub async fn get_shot(&self, id: &str) -> Result<Option<Shot>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM shots WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(shot_from_row).transpose()
    }

    /// Shots of a scene in render order.
    pub async fn list_shots(&self, scene_id: &str) -> Result<Vec<Shot>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM shots WHERE scene_id = ?1 ORDER BY shot_number")
            .bind(scene_id)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(shot_from_row).collect()
    }

    /// Shots in `status` across all scenes, least recently touched first.
    pub async fn shots_with_status(
        &self,
        status: ShotStatus,
        limit: u32,
    ) -> Result<Vec<Shot>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM shots WHERE status = ?1 ORDER BY updated_at, id LIMIT ?2",
        )
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(shot_from_row).collect()
    }

    /// Moves a shot to `to` if it is currently in one of `from`.
    ///
    /// `error` replaces the stored error message; leaving the failed state
    /// clears the handle and any previous error.
    pub async fn transition_shot(
        &self,
        id: &str,
        from: &[ShotStatus],
        to: ShotStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let from_list: Vec<&str> = from.iter().map(|s| s.as_str()).collect();
        let from_json = serde_json::to_string(&from_list)?;
        let reset = matches!(to, ShotStatus::Draft | ShotStatus::Pending);

        let result = sqlx::query(
            "UPDATE shots SET status = ?3, error_message = ?4, updated_at = ?5,
                backend_handle = CASE WHEN ?6 THEN NULL ELSE backend_handle END
             WHERE id = ?1 AND status IN (SELECT value FROM json_each(?2))",
        )
        .bind(id)
        .bind(from_json)
        .bind(to.as_str())
        .bind(error)
        .bind(Utc::now())
        .bind(reset)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records the backend handle of a generating shot.
    pub async fn set_shot_handle(&self, id: &str, handle: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE shots SET backend_handle = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'generating'",
        )
        .bind(id)
        .bind(handle)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Records the clip of a generating shot and completes it.
    pub async fn complete_shot(
        &self,
        id: &str,
        output_video_path: &str,
        generation_time_seconds: Option<f64>,
        quality_score: Option<f64>,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE shots SET status = 'completed', output_video_path = ?2,
                generation_time_seconds = ?3, quality_score = ?4, error_message = NULL,
                updated_at = ?5
             WHERE id = ?1 AND status = 'generating'",
        )
        .bind(id)
        .bind(output_video_path)
        .bind(generation_time_seconds)
        .bind(quality_score)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Episodes
    // =========================================================================

    pub async fn create_episode(
        &self,
        project_id: &str,
        title: &str,
    ) -> Result<Episode, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO episodes (id, project_id, title, status, updated_at)
             VALUES (?1, ?2, ?3, 'draft', ?4)",
        )
        .bind(&id)
        .bind(project_id)
        .bind(title)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        self.get_episode(&id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("episode {}", id)))
    }

    pub async fn get_episode(&self, id: &str) -> Result<Option<Episode>, DatabaseError> {
        let row = sqlx::query("SELECT * FROM episodes WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;

        row.as_ref().map(episode_from_row).transpose()
    }

    pub async fn list_episodes(&self, project_id: &str) -> Result<Vec<Episode>, DatabaseError> {
        let rows = sqlx::query("SELECT * FROM episodes WHERE project_id = ?1 ORDER BY title, id")
            .bind(project_id)
            .fetch_all(self.pool())
            .await?;

        rows.iter().map(episode_from_row).collect()
    }

    /// Places a scene at `position` within an episode, replacing that slot.
    pub async fn set_episode_scene(
        &self,
        episode_id: &str,
        scene_id: &str,
        position: u32,
        transition: Transition,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO episode_scenes (episode_id, scene_id, position, transition_kind, transition_duration)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(episode_id, position) DO UPDATE SET
                scene_id = excluded.scene_id,
                transition_kind = excluded.transition_kind,
                transition_duration = excluded.transition_duration",
        )
        .bind(episode_id)
        .bind(scene_id)
        .bind(position as i64)
        .bind(transition.kind.as_str())
        .bind(transition.duration_seconds)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Scene slots of an episode in position order.
    pub async fn episode_scenes(&self, episode_id: &str) -> Result<Vec<EpisodeScene>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT * FROM episode_scenes WHERE episode_id = ?1 ORDER BY position",
        )
        .bind(episode_id)
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EpisodeScene {
                    scene_id: row.get("scene_id"),
                    position: opt_u32(row, "position").unwrap_or(0),
                    transition: transition_from_row(row)?,
                })
            })
            .collect()
    }

    /// Records the artifact of an episode assembly and marks it assembled.
    pub async fn record_episode_assembly(
        &self,
        id: &str,
        final_video_path: &str,
        duration_seconds: f64,
        scenes_missing: &[String],
    ) -> Result<(), DatabaseError> {
        let missing = serde_json::to_string(scenes_missing)?;
        let result = sqlx::query(
            "UPDATE episodes SET status = 'assembled', final_video_path = ?2,
                actual_duration_seconds = ?3, scenes_missing = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(final_video_path)
        .bind(duration_seconds)
        .bind(missing)
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        expect_one_row(result.rows_affected(), || format!("episode {}", id))
    }

    /// Moves an episode between statuses if it is still in `from`.
    pub async fn transition_episode(
        &self,
        id: &str,
        from: EpisodeStatus,
        to: EpisodeStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE episodes SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Utc::now())
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn transition_from_row(row: &SqliteRow) -> Result<Transition, DatabaseError> {
    Ok(Transition::new(
        parse_column(row, "transition_kind")?,
        row.get("transition_duration"),
    ))
}

fn scene_from_row(row: &SqliteRow) -> Scene {
    Scene {
        id: row.get("id"),
        project_id: row.get("project_id"),
        title: row.get("title"),
        target_duration_seconds: row.get("target_duration_seconds"),
        actual_duration_seconds: row.get("actual_duration_seconds"),
        final_video_path: row.get("final_video_path"),
        assembled_shot_count: opt_u32(row, "assembled_shot_count"),
        updated_at: row.get("updated_at"),
    }
}

fn shot_from_row(row: &SqliteRow) -> Result<Shot, DatabaseError> {
    Ok(Shot {
        id: row.get("id"),
        scene_id: row.get("scene_id"),
        shot_number: opt_u32(row, "shot_number").unwrap_or(0),
        shot_type: row.get("shot_type"),
        camera_angle: row.get("camera_angle"),
        duration_seconds: row.get("duration_seconds"),
        motion_prompt: row.get("motion_prompt"),
        source_image_path: row.get("source_image_path"),
        seed: row.get("seed"),
        steps: opt_u32(row, "steps"),
        engine: row.get("engine"),
        transition: transition_from_row(row)?,
        status: parse_column(row, "status")?,
        backend_handle: row.get("backend_handle"),
        output_video_path: row.get("output_video_path"),
        error_message: row.get("error_message"),
        quality_score: row.get("quality_score"),
        generation_time_seconds: row.get("generation_time_seconds"),
        updated_at: row.get("updated_at"),
    })
}

fn episode_from_row(row: &SqliteRow) -> Result<Episode, DatabaseError> {
    let missing: String = row.get("scenes_missing");
    Ok(Episode {
        id: row.get("id"),
        project_id: row.get("project_id"),
        title: row.get("title"),
        status: parse_column(row, "status")?,
        final_video_path: row.get("final_video_path"),
        actual_duration_seconds: row.get("actual_duration_seconds"),
        scenes_missing: serde_json::from_str(&missing)?,
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::*;
    use crate::storage::models::TransitionKind;

    #[tokio::test]
    async fn test_shots_are_listed_in_render_order() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let scene = db.create_scene(&project.id, "Opening", Some(12.0)).await.unwrap();

        db.add_shot(&scene.id, &NewShot::new(2, "pan", 4.0)).await.unwrap();
        db.add_shot(
            &scene.id,
            &NewShot::new(1, "walk", 3.0)
                .with_transition(Transition::new(TransitionKind::Fade, 0.5)),
        )
        .await
        .unwrap();

        let shots = db.list_shots(&scene.id).await.unwrap();
        assert_eq!(shots.iter().map(|s| s.shot_number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(shots[0].transition.kind, TransitionKind::Fade);
        assert_eq!(shots[0].status, ShotStatus::Draft);
    }

    #[tokio::test]
    async fn test_shot_transition_requires_expected_status() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let scene = db.create_scene(&project.id, "Opening", None).await.unwrap();
        let shot = db.add_shot(&scene.id, &NewShot::new(1, "walk", 3.0)).await.unwrap();

        assert!(!db
            .transition_shot(&shot.id, &[ShotStatus::Failed], ShotStatus::Pending, None)
            .await
            .unwrap());
        assert!(db
            .transition_shot(&shot.id, &[ShotStatus::Draft], ShotStatus::Pending, None)
            .await
            .unwrap());
        assert!(db
            .transition_shot(
                &shot.id,
                &[ShotStatus::Pending, ShotStatus::Generating],
                ShotStatus::Failed,
                Some("cancelled")
            )
            .await
            .unwrap());

        let shot = db.get_shot(&shot.id).await.unwrap().unwrap();
        assert_eq!(shot.status, ShotStatus::Failed);
        assert_eq!(shot.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_referenced_scene_cannot_be_deleted() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let scene = db.create_scene(&project.id, "Opening", None).await.unwrap();
        let episode = db.create_episode(&project.id, "Pilot").await.unwrap();
        db.set_episode_scene(&episode.id, &scene.id, 0, Transition::cut())
            .await
            .unwrap();

        let result = db.delete_scene(&scene.id).await;
        assert!(matches!(result, Err(DatabaseError::StillReferenced(_))));
        assert!(db.get_scene(&scene.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_episode_assembly_and_publish_transition() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let episode = db.create_episode(&project.id, "Pilot").await.unwrap();

        assert!(!db
            .transition_episode(&episode.id, EpisodeStatus::Assembled, EpisodeStatus::Published)
            .await
            .unwrap());

        db.record_episode_assembly(&episode.id, "/out/pilot.mp4", 42.0, &["s2".to_string()])
            .await
            .unwrap();
        let assembled = db.get_episode(&episode.id).await.unwrap().unwrap();
        assert_eq!(assembled.status, EpisodeStatus::Assembled);
        assert_eq!(assembled.scenes_missing, vec!["s2".to_string()]);

        assert!(db
            .transition_episode(&episode.id, EpisodeStatus::Assembled, EpisodeStatus::Published)
            .await
            .unwrap());
    }
}
