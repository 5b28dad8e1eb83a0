//! Typed pipeline events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events flowing through the control plane.
///
/// Every variant carries enough identity for a handler to reload the
/// affected rows; handlers never trust payload counts over the datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A reviewer approved a candidate image.
    ImageApproved {
        project_id: String,
        character_slug: String,
        image_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A reviewer rejected a candidate image.
    ImageRejected {
        project_id: String,
        character_slug: String,
        image_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A generation job finished and its images await review.
    JobCompleted {
        job_id: String,
        project_id: String,
        character_slug: String,
        images: u32,
        timestamp: DateTime<Utc>,
    },

    /// A generation job failed or was cancelled.
    JobFailed {
        job_id: String,
        project_id: String,
        character_slug: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A shot's clip was produced.
    ShotCompleted {
        shot_id: String,
        scene_id: String,
        output_path: String,
        timestamp: DateTime<Utc>,
    },

    /// A shot failed or was cancelled.
    ShotFailed {
        shot_id: String,
        scene_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The external fine-tuning job produced a model.
    TrainingCompleted {
        project_id: String,
        character_slug: String,
        model_path: String,
        timestamp: DateTime<Utc>,
    },

    /// The external fine-tuning job failed.
    TrainingFailed {
        project_id: String,
        character_slug: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Recent quality for a character dropped below its history.
    DriftDetected {
        project_id: String,
        character_slug: String,
        recent_avg: f64,
        overall_avg: f64,
        drift: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Discriminant of [`PipelineEvent`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ImageApproved,
    ImageRejected,
    JobCompleted,
    JobFailed,
    ShotCompleted,
    ShotFailed,
    TrainingCompleted,
    TrainingFailed,
    DriftDetected,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 9] = [
        EventKind::ImageApproved,
        EventKind::ImageRejected,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::ShotCompleted,
        EventKind::ShotFailed,
        EventKind::TrainingCompleted,
        EventKind::TrainingFailed,
        EventKind::DriftDetected,
    ];

    /// Kinds that change a character's review or job counts.
    pub const REVIEW_AND_JOBS: [EventKind; 4] = [
        EventKind::ImageApproved,
        EventKind::ImageRejected,
        EventKind::JobCompleted,
        EventKind::JobFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ImageApproved => "image_approved",
            EventKind::ImageRejected => "image_rejected",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::ShotCompleted => "shot_completed",
            EventKind::ShotFailed => "shot_failed",
            EventKind::TrainingCompleted => "training_completed",
            EventKind::TrainingFailed => "training_failed",
            EventKind::DriftDetected => "drift_detected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::ImageApproved { .. } => EventKind::ImageApproved,
            PipelineEvent::ImageRejected { .. } => EventKind::ImageRejected,
            PipelineEvent::JobCompleted { .. } => EventKind::JobCompleted,
            PipelineEvent::JobFailed { .. } => EventKind::JobFailed,
            PipelineEvent::ShotCompleted { .. } => EventKind::ShotCompleted,
            PipelineEvent::ShotFailed { .. } => EventKind::ShotFailed,
            PipelineEvent::TrainingCompleted { .. } => EventKind::TrainingCompleted,
            PipelineEvent::TrainingFailed { .. } => EventKind::TrainingFailed,
            PipelineEvent::DriftDetected { .. } => EventKind::DriftDetected,
        }
    }

    /// The (project id, character slug) the event is about, if any.
    pub fn character(&self) -> Option<(&str, &str)> {
        match self {
            PipelineEvent::ImageApproved {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::ImageRejected {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::JobCompleted {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::JobFailed {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::TrainingCompleted {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::TrainingFailed {
                project_id,
                character_slug,
                ..
            }
            | PipelineEvent::DriftDetected {
                project_id,
                character_slug,
                ..
            } => Some((project_id.as_str(), character_slug.as_str())),
            PipelineEvent::ShotCompleted { .. } | PipelineEvent::ShotFailed { .. } => None,
        }
    }

    /// The scene a shot event belongs to.
    pub fn scene_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::ShotCompleted { scene_id, .. }
            | PipelineEvent::ShotFailed { scene_id, .. } => Some(scene_id.as_str()),
            _ => None,
        }
    }
}
