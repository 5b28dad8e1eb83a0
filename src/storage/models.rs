//! Row types and status enums persisted by the storage layer.
//!
//! Every status enum round-trips through its lowercase string form, which is
//! what the SQLite schema stores and what the CLI prints.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error returned when a stored status string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} value '{value}'")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Returns the stored string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseStatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    other => Err(ParseStatusError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum! {
    /// Reviewer decision on a generated image.
    ReviewStatus ("review status") {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
    }
}

string_enum! {
    /// Kind of entity that owns a pipeline.
    EntityType ("entity type") {
        Project => "project",
        Character => "character",
    }
}

string_enum! {
    /// Status of a single pipeline phase for one entity.
    PhaseStatus ("phase status") {
        Pending => "pending",
        Active => "active",
        Completed => "completed",
        Skipped => "skipped",
        Failed => "failed",
    }
}

impl PhaseStatus {
    /// Completed, skipped and failed phases never move on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Completed | PhaseStatus::Skipped | PhaseStatus::Failed
        )
    }

    /// Completed and skipped phases let the next phase start.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

string_enum! {
    /// Status of an image generation job.
    JobStatus ("job status") {
        Pending => "pending",
        Generating => "generating",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    /// Where a generation job came from.
    JobOrigin ("job origin") {
        Replenishment => "replenishment",
        Manual => "manual",
    }
}

string_enum! {
    /// Status of a single shot (one video clip).
    ShotStatus ("shot status") {
        Draft => "draft",
        Pending => "pending",
        Generating => "generating",
        Completed => "completed",
        Failed => "failed",
    }
}

impl ShotStatus {
    /// Pending and generating shots are in flight.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ShotStatus::Pending | ShotStatus::Generating)
    }
}

string_enum! {
    /// Derived generation status of a scene.
    SceneStatus ("scene status") {
        Draft => "draft",
        Generating => "generating",
        Completed => "completed",
        Failed => "failed",
        Partial => "partial",
    }
}

string_enum! {
    /// Lifecycle of an episode.
    EpisodeStatus ("episode status") {
        Draft => "draft",
        Assembled => "assembled",
        Published => "published",
    }
}

string_enum! {
    /// Outcome of the external fine-tuning job for a character.
    TrainingStatus ("training status") {
        NotStarted => "not_started",
        Completed => "completed",
        Failed => "failed",
    }
}

string_enum! {
    /// Visual transition between two consecutive clips.
    TransitionKind ("transition") {
        Cut => "cut",
        Fade => "fade",
        Dissolve => "dissolve",
        WipeLeft => "wipeleft",
        WipeRight => "wiperight",
        SlideLeft => "slideleft",
        SlideRight => "slideright",
    }
}

string_enum! {
    /// Who caused a pipeline transition.
    Actor ("actor") {
        Auto => "auto",
        Operator => "operator",
    }
}

/// A transition and its length in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub kind: TransitionKind,
    pub duration_seconds: f64,
}

impl Transition {
    /// A hard cut with no overlap.
    pub fn cut() -> Self {
        Self {
            kind: TransitionKind::Cut,
            duration_seconds: 0.0,
        }
    }

    pub fn new(kind: TransitionKind, duration_seconds: f64) -> Self {
        if kind == TransitionKind::Cut {
            return Self::cut();
        }
        Self {
            kind,
            duration_seconds: duration_seconds.max(0.0),
        }
    }

    /// Seconds by which the two clips overlap.
    pub fn overlap(&self) -> f64 {
        match self.kind {
            TransitionKind::Cut => 0.0,
            _ => self.duration_seconds,
        }
    }
}

impl Default for Transition {
    fn default() -> Self {
        Self::cut()
    }
}

/// Parameters used to generate an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub checkpoint: String,
    pub sampler: String,
    pub steps: u32,
    /// Left unset to let the backend pick a fresh seed per image.
    #[serde(default)]
    pub seed: Option<i64>,
}

impl GenerationParams {
    pub fn new(checkpoint: impl Into<String>, sampler: impl Into<String>, steps: u32) -> Self {
        Self {
            checkpoint: checkpoint.into(),
            sampler: sampler.into(),
            steps,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// A production project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Default checkpoint for every character of the project.
    pub default_checkpoint: Option<String>,
    /// Tera template used to render character prompts.
    pub prompt_template: String,
    pub negative_prompt: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A character within a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub project_id: String,
    pub slug: String,
    pub name: String,
    pub design_prompt: String,
    pub checkpoint: Option<String>,
    /// Overrides the global replenishment target when set.
    pub replenish_target: Option<u32>,
    pub replenish_enabled: bool,
    pub training_dataset_path: Option<String>,
    pub model_path: Option<String>,
    pub training_status: TrainingStatus,
    pub training_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A candidate image produced by a generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub project_id: String,
    pub character_slug: String,
    pub filename: String,
    pub review_status: ReviewStatus,
    pub quality_score: Option<f64>,
    pub issues: Vec<String>,
    pub caption: Option<String>,
    pub checkpoint: String,
    pub sampler: String,
    pub steps: u32,
    pub seed: Option<i64>,
    pub job_id: Option<String>,
    pub feedback: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl GeneratedImage {
    /// Approved or rejected.
    pub fn is_reviewed(&self) -> bool {
        self.review_status != ReviewStatus::Pending
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            checkpoint: self.checkpoint.clone(),
            sampler: self.sampler.clone(),
            steps: self.steps,
            seed: self.seed,
        }
    }
}

/// A batch of images requested from the generation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    pub project_id: String,
    pub character_slug: String,
    pub batch_size: u32,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub params: GenerationParams,
    pub origin: JobOrigin,
    pub status: JobStatus,
    pub backend_handle: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One phase of one entity's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEntry {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub phase: String,
    pub position: u32,
    pub status: PhaseStatus,
    pub updated_at: DateTime<Utc>,
}

/// An audited phase transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineAudit {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub phase: String,
    pub from_status: PhaseStatus,
    pub to_status: PhaseStatus,
    pub actor: Actor,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// A single generated video clip within a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shot {
    pub id: String,
    pub scene_id: String,
    pub shot_number: u32,
    pub shot_type: String,
    pub camera_angle: String,
    pub duration_seconds: f64,
    pub motion_prompt: String,
    pub source_image_path: Option<String>,
    pub seed: Option<i64>,
    pub steps: Option<u32>,
    pub engine: String,
    /// Transition from the previous shot into this one; unused on the first shot.
    pub transition: Transition,
    pub status: ShotStatus,
    pub backend_handle: Option<String>,
    pub output_video_path: Option<String>,
    pub error_message: Option<String>,
    pub quality_score: Option<f64>,
    pub generation_time_seconds: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to create a shot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewShot {
    pub shot_number: u32,
    pub shot_type: String,
    pub camera_angle: String,
    pub duration_seconds: f64,
    pub motion_prompt: String,
    pub source_image_path: Option<String>,
    pub seed: Option<i64>,
    pub steps: Option<u32>,
    pub engine: String,
    pub transition: Transition,
}

impl NewShot {
    pub fn new(shot_number: u32, motion_prompt: impl Into<String>, duration_seconds: f64) -> Self {
        Self {
            shot_number,
            shot_type: "medium".to_string(),
            camera_angle: "eye_level".to_string(),
            duration_seconds,
            motion_prompt: motion_prompt.into(),
            source_image_path: None,
            seed: None,
            steps: None,
            engine: "default".to_string(),
            transition: Transition::cut(),
        }
    }

    pub fn with_transition(mut self, transition: Transition) -> Self {
        self.transition = transition;
        self
    }

    pub fn with_source_image(mut self, path: impl Into<String>) -> Self {
        self.source_image_path = Some(path.into());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }
}

/// A scene: an ordered list of shots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub target_duration_seconds: Option<f64>,
    pub actual_duration_seconds: Option<f64>,
    pub final_video_path: Option<String>,
    /// Number of shots the last assembly used, if any.
    pub assembled_shot_count: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// A scene's slot within an episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeScene {
    pub scene_id: String,
    pub position: u32,
    /// Transition from the previous scene into this one; unused in the first slot.
    pub transition: Transition,
}

/// An episode assembled from scenes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub status: EpisodeStatus,
    pub final_video_path: Option<String>,
    pub actual_duration_seconds: Option<f64>,
    pub scenes_missing: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            ShotStatus::Draft,
            ShotStatus::Pending,
            ShotStatus::Generating,
            ShotStatus::Completed,
            ShotStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ShotStatus>(), Ok(status));
        }
        assert_eq!(
            "wipeleft".parse::<TransitionKind>(),
            Ok(TransitionKind::WipeLeft)
        );
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        let err = "archived".parse::<PhaseStatus>().unwrap_err();
        assert_eq!(err.kind, "phase status");
        assert_eq!(err.value, "archived");
    }

    #[test]
    fn test_phase_status_terminal_and_satisfied() {
        assert!(!PhaseStatus::Active.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert!(!PhaseStatus::Failed.is_satisfied());
        assert!(PhaseStatus::Skipped.is_satisfied());
    }

    #[test]
    fn test_cut_transition_has_no_overlap() {
        let t = Transition::new(TransitionKind::Cut, 2.0);
        assert_eq!(t.overlap(), 0.0);
        let t = Transition::new(TransitionKind::Dissolve, 0.5);
        assert_eq!(t.overlap(), 0.5);
    }
}
