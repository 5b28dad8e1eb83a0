//! Scene status and assembly.

use serde::Serialize;
use tracing::info;

use crate::backend::Clip;
use crate::storage::{Scene, SceneStatus, ShotStatus};

use super::{Production, ProductionError};

/// Derives a scene's status from its shots.
///
/// In-flight shots win over everything. Once nothing is in flight, an
/// assembly that used fewer shots than the scene has is `partial`, any
/// failure is `failed` and a scene whose shots all completed is `completed`.
pub fn derive_scene_status(shots: &[ShotStatus], assembled_shot_count: Option<u32>) -> SceneStatus {
    if shots.is_empty() {
        return SceneStatus::Draft;
    }
    if shots.iter().any(ShotStatus::is_in_flight) {
        return SceneStatus::Generating;
    }
    if assembled_shot_count.is_some_and(|n| n > 0 && (n as usize) < shots.len()) {
        return SceneStatus::Partial;
    }
    if shots.contains(&ShotStatus::Failed) {
        return SceneStatus::Failed;
    }
    if shots.iter().all(|s| *s == ShotStatus::Completed) {
        return SceneStatus::Completed;
    }
    SceneStatus::Draft
}

/// A scene with its derived status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneSummary {
    pub scene: Scene,
    pub status: SceneStatus,
    pub shots_total: usize,
    pub shots_completed: usize,
    pub shots_failed: usize,
    pub shots_in_flight: usize,
}

/// Outcome of assembling one scene.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneAssembly {
    pub scene_id: String,
    pub final_video_path: String,
    pub duration_seconds: f64,
    pub shots_included: u32,
    pub shots_total: usize,
}

impl SceneAssembly {
    /// True when some shots were left out.
    pub fn is_partial(&self) -> bool {
        (self.shots_included as usize) < self.shots_total
    }
}

impl Production {
    pub async fn scene_status(&self, scene_id: &str) -> Result<SceneSummary, ProductionError> {
        let scene = self
            .db
            .get_scene(scene_id)
            .await?
            .ok_or_else(|| ProductionError::UnknownScene(scene_id.to_string()))?;
        let statuses: Vec<ShotStatus> = self
            .db
            .list_shots(scene_id)
            .await?
            .iter()
            .map(|s| s.status)
            .collect();

        Ok(SceneSummary {
            status: derive_scene_status(&statuses, scene.assembled_shot_count),
            shots_total: statuses.len(),
            shots_completed: statuses.iter().filter(|s| **s == ShotStatus::Completed).count(),
            shots_failed: statuses.iter().filter(|s| **s == ShotStatus::Failed).count(),
            shots_in_flight: statuses.iter().filter(|s| s.is_in_flight()).count(),
            scene,
        })
    }

    /// Summaries for every scene of a project.
    pub async fn project_scenes(&self, project_id: &str) -> Result<Vec<SceneSummary>, ProductionError> {
        let mut summaries = Vec::new();
        for scene in self.db.list_scenes(project_id).await? {
            summaries.push(self.scene_status(&scene.id).await?);
        }
        Ok(summaries)
    }

    /// Joins the scene's completed shots in shot order.
    ///
    /// Shots that are not completed are left out and the result says so.
    pub async fn assemble_scene(&self, scene_id: &str) -> Result<SceneAssembly, ProductionError> {
        if self.db.get_scene(scene_id).await?.is_none() {
            return Err(ProductionError::UnknownScene(scene_id.to_string()));
        }
        let shots = self.db.list_shots(scene_id).await?;

        let clips: Vec<Clip> = shots
            .iter()
            .filter(|s| s.status == ShotStatus::Completed)
            .filter_map(|s| {
                s.output_video_path
                    .as_ref()
                    .map(|path| Clip::new(path.clone(), s.duration_seconds, s.transition))
            })
            .collect();
        if clips.is_empty() {
            return Err(ProductionError::NothingToAssemble {
                entity: "scene",
                id: scene_id.to_string(),
                reason: format!("none of {} shot(s) completed", shots.len()),
            });
        }

        let output = self.output_dir.join("scenes").join(format!("{}.mp4", scene_id));
        let video = self.assembler.assemble(&clips, &output).await?;
        let included = clips.len() as u32;
        self.db
            .record_scene_assembly(scene_id, &video.path, video.duration_seconds, included)
            .await?;

        let assembly = SceneAssembly {
            scene_id: scene_id.to_string(),
            final_video_path: video.path,
            duration_seconds: video.duration_seconds,
            shots_included: included,
            shots_total: shots.len(),
        };
        info!(
            scene_id = scene_id,
            shots_included = assembly.shots_included,
            shots_total = assembly.shots_total,
            partial = assembly.is_partial(),
            "Scene assembled"
        );
        Ok(assembly)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::{complete, production};
    use super::*;
    use crate::events::EventBus;
    use crate::storage::database::test_support::temp_db;
    use crate::storage::{NewShot, Transition, TransitionKind};

    use ShotStatus::*;

    #[test]
    fn test_derived_status() {
        assert_eq!(derive_scene_status(&[], None), SceneStatus::Draft);
        assert_eq!(derive_scene_status(&[Draft, Completed], None), SceneStatus::Draft);
        assert_eq!(derive_scene_status(&[Completed, Pending], None), SceneStatus::Generating);
        assert_eq!(derive_scene_status(&[Failed, Generating], None), SceneStatus::Generating);
        assert_eq!(derive_scene_status(&[Completed, Failed], None), SceneStatus::Failed);
        assert_eq!(derive_scene_status(&[Completed, Completed], None), SceneStatus::Completed);
        assert_eq!(derive_scene_status(&[Completed, Failed], Some(1)), SceneStatus::Partial);
        assert_eq!(derive_scene_status(&[Completed, Completed], Some(2)), SceneStatus::Completed);
        // Assembly never hides in-flight work.
        assert_eq!(derive_scene_status(&[Completed, Pending], Some(1)), SceneStatus::Generating);
    }

    #[test]
    fn test_derived_status_is_pure() {
        let shots = [Completed, Failed, Completed];
        assert_eq!(
            derive_scene_status(&shots, Some(2)),
            derive_scene_status(&shots, Some(2))
        );
    }

    #[tokio::test]
    async fn test_assemble_scene_with_failed_shot_is_partial() {
        let (_dir, db) = temp_db().await;
        let project = db.create_project("Show", None, "{{ name }}", None).await.unwrap();
        let scene = db.create_scene(&project.id, "Opening", Some(9.0)).await.unwrap();
        let a = db.add_shot(&scene.id, &NewShot::new(1, "pan", 3.0)).await.unwrap();
        let b = db
            .add_shot(
                &scene.id,
                &NewShot::new(2, "zoom", 4.0)
                    .with_transition(Transition::new(TransitionKind::Fade, 0.5)),
            )
            .await
            .unwrap();
        let c = db.add_shot(&scene.id, &NewShot::new(3, "tilt", 2.0)).await.unwrap();

        complete(&db, &a.id, "/clips/a.mp4").await;
        complete(&db, &b.id, "/clips/b.mp4").await;
        db.transition_shot(&c.id, &[Draft], Failed, Some("nsfw filter")).await.unwrap();

        let (production, assembler, _) = production(&db, Arc::new(EventBus::default()));
        assert_eq!(production.scene_status(&scene.id).await.unwrap().status, SceneStatus::Failed);

        let assembly = production.assemble_scene(&scene.id).await.unwrap();
        assert_eq!(assembly.shots_included, 2);
        assert!(assembly.is_partial());
        assert_eq!(assembly.final_video_path, format!("/renders/scenes/{}.mp4", scene.id));

        let calls = assembler.calls.lock().unwrap().clone();
        assert_eq!(calls[0].0[1].transition.kind, TransitionKind::Fade);

        let summary = production.scene_status(&scene.id).await.unwrap();
        assert_eq!(summary.status, SceneStatus::Partial);
        assert_eq!(summary.scene.assembled_shot_count, Some(2));
        assert_eq!(summary.shots_failed, 1);
    }

    #[tokio::test]
    async fn test_assemble_scene_without_completed_shots() {
        let (_dir, db) = temp_db().await;
        let project = db.create_project("Show", None, "{{ name }}", None).await.unwrap();
        let scene = db.create_scene(&project.id, "Opening", None).await.unwrap();
        db.add_shot(&scene.id, &NewShot::new(1, "pan", 3.0)).await.unwrap();

        let (production, _, _) = production(&db, Arc::new(EventBus::default()));
        assert!(matches!(
            production.assemble_scene(&scene.id).await,
            Err(ProductionError::NothingToAssemble { entity: "scene", .. })
        ));
    }
}
