//! Episode assembly and publishing.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::Clip;
use crate::storage::{Episode, EpisodeStatus};

use super::{Production, ProductionError};

/// Outcome of assembling an episode.
///
/// Scenes without a final video are listed in `scenes_missing`; the artifact
/// still contains every scene in `scenes_included`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpisodeAssembly {
    pub episode_id: String,
    pub final_video_path: String,
    pub duration_seconds: f64,
    pub scenes_included: Vec<String>,
    pub scenes_missing: Vec<String>,
}

impl EpisodeAssembly {
    pub fn is_partial(&self) -> bool {
        !self.scenes_missing.is_empty()
    }
}

impl Production {
    pub async fn episode(&self, episode_id: &str) -> Result<Episode, ProductionError> {
        self.db
            .get_episode(episode_id)
            .await?
            .ok_or_else(|| ProductionError::UnknownEpisode(episode_id.to_string()))
    }

    /// Joins the episode's scenes in position order.
    ///
    /// Re-running replaces the previous artifact. Fails only when no scene
    /// has a final video.
    pub async fn assemble_episode(&self, episode_id: &str) -> Result<EpisodeAssembly, ProductionError> {
        let episode = self.episode(episode_id).await?;
        let slots = self.db.episode_scenes(episode_id).await?;

        let mut clips = Vec::new();
        let mut included = Vec::new();
        let mut missing = Vec::new();
        for slot in &slots {
            let Some(scene) = self.db.get_scene(&slot.scene_id).await? else {
                error!(
                    episode_id = episode_id,
                    scene_id = %slot.scene_id,
                    position = slot.position,
                    "Episode references a scene that does not exist"
                );
                return Err(ProductionError::MissingScene {
                    episode_id: episode_id.to_string(),
                    scene_id: slot.scene_id.clone(),
                });
            };

            match scene.final_video_path {
                Some(ref path) => {
                    let duration = scene
                        .actual_duration_seconds
                        .or(scene.target_duration_seconds)
                        .unwrap_or(0.0);
                    clips.push(Clip::new(path.clone(), duration, slot.transition));
                    included.push(scene.id);
                }
                None => missing.push(scene.id),
            }
        }

        if clips.is_empty() {
            return Err(ProductionError::NothingToAssemble {
                entity: "episode",
                id: episode_id.to_string(),
                reason: format!("none of {} scene(s) has a final video", slots.len()),
            });
        }

        let output = self
            .output_dir
            .join("episodes")
            .join(format!("{}.mp4", episode_id));
        let video = self.assembler.assemble(&clips, &output).await?;
        self.db
            .record_episode_assembly(episode_id, &video.path, video.duration_seconds, &missing)
            .await?;

        let assembly = EpisodeAssembly {
            episode_id: episode_id.to_string(),
            final_video_path: video.path,
            duration_seconds: video.duration_seconds,
            scenes_included: included,
            scenes_missing: missing,
        };
        if assembly.is_partial() {
            warn!(
                episode_id = episode_id,
                title = %episode.title,
                included = assembly.scenes_included.len(),
                missing = ?assembly.scenes_missing,
                "Episode assembled without some scenes"
            );
        } else {
            info!(
                episode_id = episode_id,
                title = %episode.title,
                scenes = assembly.scenes_included.len(),
                duration = assembly.duration_seconds,
                "Episode assembled"
            );
        }
        Ok(assembly)
    }

    /// Registers an assembled episode with the media server.
    pub async fn publish_episode(&self, episode_id: &str) -> Result<Episode, ProductionError> {
        let episode = self.episode(episode_id).await?;
        let path = match (episode.status, episode.final_video_path.as_deref()) {
            (EpisodeStatus::Assembled, Some(path)) => path.to_string(),
            (status, _) => {
                return Err(ProductionError::NotAssembled {
                    episode_id: episode_id.to_string(),
                    status,
                })
            }
        };

        let media_id = self.media.register(&path, &episode.title).await?;
        if !self
            .db
            .transition_episode(episode_id, EpisodeStatus::Assembled, EpisodeStatus::Published)
            .await?
        {
            return Err(ProductionError::Conflict {
                entity: "episode",
                id: episode_id.to_string(),
            });
        }

        info!(
            episode_id = episode_id,
            media_id = %media_id,
            path = %path,
            "Episode published"
        );
        self.episode(episode_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::test_support::production;
    use super::*;
    use crate::events::EventBus;
    use crate::storage::database::test_support::temp_db;
    use crate::storage::{Database, Transition, TransitionKind};

    async fn assembled_scene(db: &Database, project_id: &str, title: &str) -> String {
        let scene = db.create_scene(project_id, title, Some(10.0)).await.unwrap();
        db.record_scene_assembly(&scene.id, &format!("/renders/{}.mp4", title), 10.0, 2)
            .await
            .unwrap();
        scene.id
    }

    #[tokio::test]
    async fn test_assemble_reports_missing_scene() {
        let (_dir, db) = temp_db().await;
        let project = db.create_project("Show", None, "{{ name }}", None).await.unwrap();
        let first = assembled_scene(&db, &project.id, "one").await;
        let second = db.create_scene(&project.id, "two", Some(8.0)).await.unwrap().id;
        let third = assembled_scene(&db, &project.id, "three").await;

        let episode = db.create_episode(&project.id, "Pilot").await.unwrap();
        db.set_episode_scene(&episode.id, &first, 0, Transition::cut()).await.unwrap();
        db.set_episode_scene(&episode.id, &second, 1, Transition::cut()).await.unwrap();
        db.set_episode_scene(&episode.id, &third, 2, Transition::new(TransitionKind::Fade, 1.0))
            .await
            .unwrap();

        let (production, assembler, _) = production(&db, Arc::new(EventBus::default()));
        let assembly = production.assemble_episode(&episode.id).await.unwrap();
        assert_eq!(assembly.scenes_included, vec![first.clone(), third.clone()]);
        assert_eq!(assembly.scenes_missing, vec![second.clone()]);
        assert!(assembly.is_partial());

        let stored = production.episode(&episode.id).await.unwrap();
        assert_eq!(stored.status, EpisodeStatus::Assembled);
        assert_eq!(stored.scenes_missing, vec![second]);

        // Re-running targets the same artifact.
        production.assemble_episode(&episode.id).await.unwrap();
        let calls = assembler.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, calls[1].1);
        assert_eq!(calls[0].0.len(), 2);
    }

    #[tokio::test]
    async fn test_assemble_fails_without_any_scene() {
        let (_dir, db) = temp_db().await;
        let project = db.create_project("Show", None, "{{ name }}", None).await.unwrap();
        let scene = db.create_scene(&project.id, "one", None).await.unwrap();
        let episode = db.create_episode(&project.id, "Pilot").await.unwrap();
        db.set_episode_scene(&episode.id, &scene.id, 0, Transition::cut()).await.unwrap();

        let (production, _, _) = production(&db, Arc::new(EventBus::default()));
        assert!(matches!(
            production.assemble_episode(&episode.id).await,
            Err(ProductionError::NothingToAssemble { entity: "episode", .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_requires_assembly() {
        let (_dir, db) = temp_db().await;
        let project = db.create_project("Show", None, "{{ name }}", None).await.unwrap();
        let scene = assembled_scene(&db, &project.id, "one").await;
        let episode = db.create_episode(&project.id, "Pilot").await.unwrap();
        db.set_episode_scene(&episode.id, &scene, 0, Transition::cut()).await.unwrap();

        let (production, _, media) = production(&db, Arc::new(EventBus::default()));
        assert!(matches!(
            production.publish_episode(&episode.id).await,
            Err(ProductionError::NotAssembled { status: EpisodeStatus::Draft, .. })
        ));

        production.assemble_episode(&episode.id).await.unwrap();
        let published = production.publish_episode(&episode.id).await.unwrap();
        assert_eq!(published.status, EpisodeStatus::Published);
        assert_eq!(media.registered.lock().unwrap().len(), 1);

        assert!(matches!(
            production.publish_episode(&episode.id).await,
            Err(ProductionError::NotAssembled { status: EpisodeStatus::Published, .. })
        ));
    }
}
