//! Hand-off to the external fine-tuning job.
//!
//! Training itself happens elsewhere. This module writes the dataset
//! manifest the trainer consumes and records the trainer's verdict.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{EventBus, PipelineEvent};
use crate::storage::{Character, Database, DatabaseError, ReviewStatus, TrainingStatus};

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown character '{slug}' in project {project_id}")]
    UnknownCharacter { project_id: String, slug: String },

    #[error("Character '{slug}' in project {project_id} has no approved images")]
    NoApprovedImages { project_id: String, slug: String },
}

/// One image in a training manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestImage {
    pub image_id: String,
    pub filename: String,
    pub caption: Option<String>,
    pub quality_score: Option<f64>,
    pub checkpoint: String,
    pub seed: Option<i64>,
}

/// The dataset description handed to the trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub project_id: String,
    pub character_slug: String,
    pub character_name: String,
    pub design_prompt: String,
    pub base_checkpoint: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub images: Vec<ManifestImage>,
}

/// Outcome reported by the trainer.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Completed { model_path: String },
    Failed { reason: String },
}

pub struct TrainingHandoff {
    db: Database,
    bus: Arc<EventBus>,
    output_dir: PathBuf,
}

impl TrainingHandoff {
    pub fn new(db: Database, bus: Arc<EventBus>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            bus,
            output_dir: output_dir.into(),
        }
    }

    /// Directory the manifest for a character is written to.
    pub fn dataset_dir(&self, project_id: &str, slug: &str) -> PathBuf {
        self.output_dir.join("training").join(project_id).join(slug)
    }

    /// Writes `manifest.json` listing the character's approved images and
    /// records its path on the character.
    pub async fn prepare_training_set(
        &self,
        project_id: &str,
        slug: &str,
    ) -> Result<(PathBuf, TrainingManifest), TrainingError> {
        let character = self.character(project_id, slug).await?;
        let images: Vec<ManifestImage> = self
            .db
            .list_character_images(project_id, slug)
            .await?
            .into_iter()
            .filter(|image| image.review_status == ReviewStatus::Approved)
            .map(|image| ManifestImage {
                image_id: image.id,
                filename: image.filename,
                caption: image.caption,
                quality_score: image.quality_score,
                checkpoint: image.checkpoint,
                seed: image.seed,
            })
            .collect();
        if images.is_empty() {
            return Err(TrainingError::NoApprovedImages {
                project_id: project_id.to_string(),
                slug: slug.to_string(),
            });
        }

        let manifest = TrainingManifest {
            project_id: project_id.to_string(),
            character_slug: slug.to_string(),
            character_name: character.name.clone(),
            design_prompt: character.design_prompt.clone(),
            base_checkpoint: character.checkpoint.clone(),
            generated_at: Utc::now(),
            images,
        };

        let dir = self.dataset_dir(project_id, slug);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join("manifest.json");
        write_manifest(&path, &manifest).await?;
        self.db
            .set_training_dataset(&character.id, &path.display().to_string())
            .await?;

        info!(
            project_id = project_id,
            character = slug,
            images = manifest.images.len(),
            path = %path.display(),
            "Training set prepared"
        );
        Ok((path, manifest))
    }

    /// Records the trainer's outcome and publishes the matching event.
    pub async fn record_training_result(
        &self,
        project_id: &str,
        slug: &str,
        outcome: TrainingOutcome,
    ) -> Result<Character, TrainingError> {
        let character = self.character(project_id, slug).await?;

        let event = match outcome {
            TrainingOutcome::Completed { model_path } => {
                self.db
                    .record_training_result(
                        &character.id,
                        TrainingStatus::Completed,
                        Some(&model_path),
                        None,
                    )
                    .await?;
                info!(project_id = project_id, character = slug, model_path = %model_path, "Training completed");
                PipelineEvent::TrainingCompleted {
                    project_id: project_id.to_string(),
                    character_slug: slug.to_string(),
                    model_path,
                    timestamp: Utc::now(),
                }
            }
            TrainingOutcome::Failed { reason } => {
                self.db
                    .record_training_result(
                        &character.id,
                        TrainingStatus::Failed,
                        None,
                        Some(&reason),
                    )
                    .await?;
                warn!(project_id = project_id, character = slug, reason = %reason, "Training failed");
                PipelineEvent::TrainingFailed {
                    project_id: project_id.to_string(),
                    character_slug: slug.to_string(),
                    reason,
                    timestamp: Utc::now(),
                }
            }
        };
        self.bus.publish(event).await;

        self.character(project_id, slug).await
    }

    async fn character(&self, project_id: &str, slug: &str) -> Result<Character, TrainingError> {
        self.db
            .get_character(project_id, slug)
            .await?
            .ok_or_else(|| TrainingError::UnknownCharacter {
                project_id: project_id.to_string(),
                slug: slug.to_string(),
            })
    }
}

async fn write_manifest(path: &Path, manifest: &TrainingManifest) -> Result<(), TrainingError> {
    let json = serde_json::to_vec_pretty(manifest)?;
    tokio::fs::write(path, json).await?;
    Ok(())
}
