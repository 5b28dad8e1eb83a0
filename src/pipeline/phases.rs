//! Declared phases and their completion predicates.
//!
//! Each phase maps to a pure function over a snapshot loaded fresh from the
//! datastore on every tick. Nothing about phase progress is cached.

use crate::analytics::DriftAssessment;
use crate::storage::{EntityType, EpisodeStatus, PhaseStatus, ShotStatus, TrainingStatus};

/// Result of evaluating an active phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Waiting(String),
    Failed(String),
}

/// Everything the character predicates look at.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterSnapshot {
    pub approved: u32,
    pub pending: u32,
    pub reviewed: u32,
    pub target: u32,
    /// Drift assessments at the most recent review points, newest first.
    pub drift_points: Vec<DriftAssessment>,
    /// Number of clean review points `consistency_check` requires.
    pub required_points: usize,
    pub has_training_dataset: bool,
    pub has_model: bool,
    pub training_status: TrainingStatus,
    pub training_error: Option<String>,
}

/// Everything the project predicates look at.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectSnapshot {
    /// `(slug, status of the character's training phase)`.
    pub characters: Vec<(String, Option<PhaseStatus>)>,
    /// `(scene id, number of shots)`.
    pub scenes: Vec<(String, usize)>,
    pub shot_statuses: Vec<ShotStatus>,
    pub episode_statuses: Vec<EpisodeStatus>,
}

type CharacterPredicate = fn(&CharacterSnapshot) -> Verdict;
type ProjectPredicate = fn(&ProjectSnapshot) -> Verdict;

const CHARACTER_PHASES: &[(&str, CharacterPredicate)] = &[
    ("image_generation", image_generation),
    ("review", review),
    ("consistency_check", consistency_check),
    ("training_prep", training_prep),
    ("training", training),
];

const PROJECT_PHASES: &[(&str, ProjectPredicate)] = &[
    ("character_setup", character_setup),
    ("scene_planning", scene_planning),
    ("shot_generation", shot_generation),
    ("episode_assembly", episode_assembly),
    ("publishing", publishing),
];

/// Phase names of an entity type in declared order.
pub fn phases_for(entity_type: EntityType) -> Vec<&'static str> {
    match entity_type {
        EntityType::Character => CHARACTER_PHASES.iter().map(|(name, _)| *name).collect(),
        EntityType::Project => PROJECT_PHASES.iter().map(|(name, _)| *name).collect(),
    }
}

pub fn character_predicate(phase: &str) -> Option<CharacterPredicate> {
    CHARACTER_PHASES
        .iter()
        .find(|(name, _)| *name == phase)
        .map(|(_, predicate)| *predicate)
}

pub fn project_predicate(phase: &str) -> Option<ProjectPredicate> {
    PROJECT_PHASES
        .iter()
        .find(|(name, _)| *name == phase)
        .map(|(_, predicate)| *predicate)
}

fn image_generation(s: &CharacterSnapshot) -> Verdict {
    if s.approved >= s.target {
        Verdict::Complete
    } else {
        Verdict::Waiting(format!("{}/{} images approved", s.approved, s.target))
    }
}

fn review(s: &CharacterSnapshot) -> Verdict {
    if s.approved < s.target {
        Verdict::Waiting(format!("{}/{} images approved", s.approved, s.target))
    } else if s.pending > 0 {
        Verdict::Waiting(format!("{} images awaiting review", s.pending))
    } else {
        Verdict::Complete
    }
}

fn consistency_check(s: &CharacterSnapshot) -> Verdict {
    let required = s.required_points.max(1);
    if (s.reviewed as usize) < required || s.drift_points.len() < required {
        return Verdict::Waiting(format!(
            "{} reviewed images, {} needed for a drift check",
            s.reviewed, required
        ));
    }

    let points = &s.drift_points[..required];
    if let Some(index) = points.iter().position(|p| p.is_alert()) {
        return Verdict::Waiting(format!("drift alert {} review(s) ago", index));
    }
    if points
        .iter()
        .any(|p| matches!(p, DriftAssessment::InsufficientHistory { .. }))
    {
        return Verdict::Waiting("not enough scored reviews to measure drift".to_string());
    }
    Verdict::Complete
}

fn training_prep(s: &CharacterSnapshot) -> Verdict {
    if s.has_training_dataset {
        Verdict::Complete
    } else {
        Verdict::Waiting("no training dataset prepared".to_string())
    }
}

fn training(s: &CharacterSnapshot) -> Verdict {
    if s.training_status == TrainingStatus::Failed {
        return Verdict::Failed(
            s.training_error
                .clone()
                .unwrap_or_else(|| "training failed".to_string()),
        );
    }
    if s.has_model {
        Verdict::Complete
    } else {
        Verdict::Waiting("waiting for trained model".to_string())
    }
}

fn character_setup(s: &ProjectSnapshot) -> Verdict {
    if s.characters.is_empty() {
        return Verdict::Waiting("project has no characters".to_string());
    }
    let unfinished: Vec<&str> = s
        .characters
        .iter()
        .filter(|(_, status)| !status.is_some_and(|st| st.is_satisfied()))
        .map(|(slug, _)| slug.as_str())
        .collect();
    if unfinished.is_empty() {
        Verdict::Complete
    } else {
        Verdict::Waiting(format!("training unfinished for: {}", unfinished.join(", ")))
    }
}

fn scene_planning(s: &ProjectSnapshot) -> Verdict {
    if s.scenes.is_empty() {
        return Verdict::Waiting("project has no scenes".to_string());
    }
    let empty = s.scenes.iter().filter(|(_, shots)| *shots == 0).count();
    if empty == 0 {
        Verdict::Complete
    } else {
        Verdict::Waiting(format!("{} scene(s) without shots", empty))
    }
}

fn shot_generation(s: &ProjectSnapshot) -> Verdict {
    if s.shot_statuses.is_empty() {
        return Verdict::Waiting("project has no shots".to_string());
    }
    let done = s
        .shot_statuses
        .iter()
        .filter(|st| **st == ShotStatus::Completed)
        .count();
    if done == s.shot_statuses.len() {
        Verdict::Complete
    } else {
        Verdict::Waiting(format!("{}/{} shots completed", done, s.shot_statuses.len()))
    }
}

fn episode_assembly(s: &ProjectSnapshot) -> Verdict {
    if s
        .episode_statuses
        .iter()
        .any(|st| matches!(st, EpisodeStatus::Assembled | EpisodeStatus::Published))
    {
        Verdict::Complete
    } else {
        Verdict::Waiting("no episode assembled".to_string())
    }
}

fn publishing(s: &ProjectSnapshot) -> Verdict {
    if s.episode_statuses.contains(&EpisodeStatus::Published) {
        Verdict::Complete
    } else {
        Verdict::Waiting("no episode published".to_string())
    }
}
