//! Shot, scene and episode state machine.
//!
//! Shots move `draft -> pending -> generating -> completed | failed`. Only the
//! dispatcher moves a shot out of `generating`; only an operator moves a
//! failed shot back to `pending`. Scene status is never stored: it is
//! derived from the shots every time it is read.
//!
//! Assembly writes to `<output>/scenes/<scene id>.mp4` and
//! `<output>/episodes/<episode id>.mp4`, replacing any earlier artifact.

mod episode;
mod scene;
mod shot;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::backend::{MediaServer, VideoAssembler};
use crate::error::BackendError;
use crate::events::EventBus;
use crate::metrics::MetricsCollector;
use crate::storage::{Database, DatabaseError, EpisodeStatus, ShotStatus};

pub use episode::EpisodeAssembly;
pub use scene::{derive_scene_status, SceneAssembly, SceneSummary};
pub use shot::QueueReport;

/// Errors raised by production operations.
#[derive(Debug, Error)]
pub enum ProductionError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Unknown shot {0}")]
    UnknownShot(String),

    #[error("Unknown scene {0}")]
    UnknownScene(String),

    #[error("Unknown episode {0}")]
    UnknownEpisode(String),

    /// The shot is not in a state the action accepts.
    #[error("Cannot {action} shot {shot_id}: it is {status}")]
    InvalidShotState {
        shot_id: String,
        status: ShotStatus,
        action: &'static str,
    },

    /// Nothing completed to assemble.
    #[error("Nothing to assemble for {entity} {id}: {reason}")]
    NothingToAssemble {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// An episode slot points at a scene that no longer exists.
    #[error("Episode {episode_id} references missing scene {scene_id}")]
    MissingScene { episode_id: String, scene_id: String },

    /// Publishing requires an assembled episode.
    #[error("Cannot publish episode {episode_id}: it is {status}")]
    NotAssembled {
        episode_id: String,
        status: EpisodeStatus,
    },

    /// Another writer changed the row first.
    #[error("{entity} {id} changed concurrently")]
    Conflict { entity: &'static str, id: String },
}

/// Entry point for shot, scene and episode operations.
pub struct Production {
    db: Database,
    bus: Arc<EventBus>,
    assembler: Arc<dyn VideoAssembler>,
    media: Arc<dyn MediaServer>,
    output_dir: PathBuf,
    metrics: MetricsCollector,
}

impl Production {
    pub fn new(
        db: Database,
        bus: Arc<EventBus>,
        assembler: Arc<dyn VideoAssembler>,
        media: Arc<dyn MediaServer>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            db,
            bus,
            assembler,
            media,
            output_dir: output_dir.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::{AssembledVideo, Clip};

    /// Records every assembly instead of running ffmpeg.
    #[derive(Default)]
    pub struct RecordingAssembler {
        pub calls: Mutex<Vec<(Vec<Clip>, String)>>,
    }

    #[async_trait]
    impl VideoAssembler for RecordingAssembler {
        async fn assemble(
            &self,
            clips: &[Clip],
            output: &Path,
        ) -> Result<AssembledVideo, BackendError> {
            if clips.is_empty() {
                return Err(BackendError::NoInputs);
            }
            let path = output.display().to_string();
            self.calls
                .lock()
                .unwrap()
                .push((clips.to_vec(), path.clone()));
            Ok(AssembledVideo {
                path,
                duration_seconds: clips.iter().map(|c| c.duration_seconds).sum(),
            })
        }
    }

    #[derive(Default)]
    pub struct RecordingMedia {
        pub registered: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaServer for RecordingMedia {
        async fn register(&self, path: &str, _title: &str) -> Result<String, BackendError> {
            self.registered.lock().unwrap().push(path.to_string());
            Ok("media-1".to_string())
        }
    }

    /// Drives a draft shot through to completed with `path` as its clip.
    pub async fn complete(db: &Database, shot_id: &str, path: &str) {
        db.transition_shot(shot_id, &[ShotStatus::Draft], ShotStatus::Pending, None)
            .await
            .unwrap();
        db.transition_shot(shot_id, &[ShotStatus::Pending], ShotStatus::Generating, None)
            .await
            .unwrap();
        assert!(db.complete_shot(shot_id, path, Some(12.0), None).await.unwrap());
    }

    pub fn production(
        db: &Database,
        bus: Arc<EventBus>,
    ) -> (Production, Arc<RecordingAssembler>, Arc<RecordingMedia>) {
        let assembler = Arc::new(RecordingAssembler::default());
        let media = Arc::new(RecordingMedia::default());
        let production = Production::new(
            db.clone(),
            bus,
            assembler.clone(),
            media.clone(),
            "/renders",
        );
        (production, assembler, media)
    }
}
