//! Per-entity phase state machine.
//!
//! The `PipelineOrchestrator` owns the lifecycle of every project and
//! character pipeline:
//! - Initialization of one row per declared phase
//! - Predicate evaluation of the active phase on every tick
//! - Recovery activation after an operator reset
//! - Audited operator overrides
//!
//! # Architecture
//!
//! ```text
//! tick() ──> load entries ──> snapshot ──> predicate ──> apply_phase_transitions
//!                                                          (CAS + audit, all-or-nothing)
//! ```
//!
//! Every move is a compare-and-set on the observed status. When a move
//! loses a race the whole group rolls back and the next tick re-derives
//! everything from fresh data.

use std::collections::BTreeMap;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::analytics::{Analytics, AnalyticsError};
use crate::events::{EventError, EventHandler, EventKind, PipelineEvent};
use crate::metrics::MetricsCollector;
use crate::replenish::ReplenishSettings;
use crate::storage::{
    Actor, Database, DatabaseError, EntityType, PhaseStatus, PhaseTransition, PipelineAudit,
    PipelineEntry,
};

use super::phases::{
    character_predicate, phases_for, project_predicate, CharacterSnapshot, ProjectSnapshot,
    Verdict,
};

/// Errors that can occur during orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Analytics error while building a snapshot.
    #[error("Analytics error: {0}")]
    Analytics(#[from] AnalyticsError),

    /// The project or character does not exist.
    #[error("Unknown {entity_type} {entity_id}")]
    UnknownEntity {
        entity_type: EntityType,
        entity_id: String,
    },

    /// The entity has no pipeline rows.
    #[error("{entity_type} {entity_id} has no pipeline; run init first")]
    NotInitialized {
        entity_type: EntityType,
        entity_id: String,
    },

    /// The phase is not part of the entity's pipeline.
    #[error("{entity_type} {entity_id} has no phase '{phase}'")]
    UnknownPhase {
        entity_type: EntityType,
        entity_id: String,
        phase: String,
    },

    /// A concurrent writer moved the phase first.
    #[error("{entity_type} {entity_id} phase '{phase}' changed concurrently; retry")]
    Conflict {
        entity_type: EntityType,
        entity_id: String,
        phase: String,
    },
}

/// Operator override actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideAction {
    Skip,
    Reset,
    Complete,
}

impl std::fmt::Display for OverrideAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverrideAction::Skip => write!(f, "skip"),
            OverrideAction::Reset => write!(f, "reset"),
            OverrideAction::Complete => write!(f, "complete"),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Review points that must be free of drift alerts before
    /// `consistency_check` completes.
    pub consistency_points: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            consistency_points: 3,
        }
    }
}

/// Where an entity stands after a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntityState {
    /// The active phase's predicate does not hold yet.
    Waiting { phase: String, reason: String },
    /// A failed phase blocks the pipeline until an operator acts.
    Blocked { phase: String },
    /// Every phase is completed or skipped.
    Finished,
    /// More than one phase is active; nothing was touched.
    Violation { active: Vec<String> },
    /// A concurrent writer won a compare-and-set; retried next tick.
    Contended { phase: String },
}

/// A phase move applied during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMove {
    pub phase: String,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
}

/// Outcome of evaluating one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityTick {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub moves: Vec<AppliedMove>,
    pub state: EntityState,
}

/// An entity whose evaluation errored during a full tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityFailure {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub error: String,
}

/// Outcome of a full tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub entities: Vec<EntityTick>,
    /// Entities skipped because of an error; the others were still evaluated.
    pub failed: Vec<EntityFailure>,
}

impl TickReport {
    /// Number of phase moves applied.
    pub fn moves(&self) -> usize {
        self.entities.iter().map(|e| e.moves.len()).sum()
    }

    pub fn violations(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e.state, EntityState::Violation { .. }))
            .count()
    }
}

/// Read-only view of one entity's pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityPipeline {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub phases: Vec<PipelineEntry>,
}

impl EntityPipeline {
    /// The single active phase, if any.
    pub fn active_phase(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|e| e.status == PhaseStatus::Active)
            .map(|e| e.phase.as_str())
    }
}

/// Drives every project and character pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator {
    db: Database,
    analytics: Analytics,
    settings: ReplenishSettings,
    config: OrchestratorConfig,
    metrics: MetricsCollector,
}

impl PipelineOrchestrator {
    pub fn new(
        db: Database,
        analytics: Analytics,
        settings: ReplenishSettings,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            db,
            analytics,
            settings,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Event kinds the orchestrator should be registered for.
    pub fn event_kinds() -> Vec<EventKind> {
        EventKind::ALL
            .into_iter()
            .filter(|kind| *kind != EventKind::DriftDetected)
            .collect()
    }

    /// Creates the entity's pipeline. Calling it again changes nothing.
    ///
    /// Returns the number of phase rows created.
    pub async fn initialize(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<u64, OrchestratorError> {
        self.require_entity(entity_type, entity_id).await?;

        let phases = phases_for(entity_type);
        let created = self
            .db
            .initialize_pipeline(entity_type, entity_id, &phases)
            .await?;

        if created > 0 {
            info!(
                entity_type = %entity_type,
                entity_id = entity_id,
                phases = created,
                "Pipeline initialized"
            );
        }
        Ok(created)
    }

    /// Evaluates every initialized entity.
    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let started = Instant::now();

        let mut grouped: BTreeMap<(EntityType, String), Vec<PipelineEntry>> = BTreeMap::new();
        for entry in self.db.all_pipeline_entries().await? {
            grouped
                .entry((entry.entity_type, entry.entity_id.clone()))
                .or_default()
                .push(entry);
        }

        let mut report = TickReport::default();
        // Characters first so a project sees this tick's training results.
        let (characters, projects): (Vec<_>, Vec<_>) = grouped
            .into_iter()
            .partition(|((entity_type, _), _)| *entity_type == EntityType::Character);

        for ((entity_type, entity_id), entries) in characters.into_iter().chain(projects) {
            match self.evaluate(entity_type, &entity_id, entries).await {
                Ok(result) => report.entities.push(result),
                Err(e) => {
                    error!(
                        entity_type = %entity_type,
                        entity_id = %entity_id,
                        error = %e,
                        "Pipeline evaluation failed"
                    );
                    report.failed.push(EntityFailure {
                        entity_type,
                        entity_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.metrics
            .observe_tick("orchestrator", started.elapsed().as_secs_f64());
        debug!(
            entities = report.entities.len(),
            moves = report.moves(),
            failed = report.failed.len(),
            "Orchestrator tick finished"
        );
        Ok(report)
    }

    /// Evaluates a single entity.
    pub async fn tick_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<EntityTick, OrchestratorError> {
        let entries = self.require_pipeline(entity_type, entity_id).await?;
        self.evaluate(entity_type, entity_id, entries).await
    }

    /// Applies an operator override. Always permitted.
    ///
    /// Returns the moves that were applied; an override that changes
    /// nothing (skipping an already skipped phase) returns an empty list.
    pub async fn override_phase(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        phase: &str,
        action: OverrideAction,
        reason: Option<&str>,
    ) -> Result<Vec<AppliedMove>, OrchestratorError> {
        let entries = self.require_pipeline(entity_type, entity_id).await?;
        let index = entries
            .iter()
            .position(|e| e.phase == phase)
            .ok_or_else(|| OrchestratorError::UnknownPhase {
                entity_type,
                entity_id: entity_id.to_string(),
                phase: phase.to_string(),
            })?;
        let reason = reason
            .map(str::to_string)
            .unwrap_or_else(|| format!("operator {}", action));

        let mut moves = Vec::new();
        match action {
            OverrideAction::Skip | OverrideAction::Complete => {
                let to = if action == OverrideAction::Skip {
                    PhaseStatus::Skipped
                } else {
                    PhaseStatus::Completed
                };
                let target = &entries[index];
                if target.status != to {
                    moves.push((index, target.status, to));
                }

                // The overridden phase was holding the pipeline.
                let other_active = entries
                    .iter()
                    .enumerate()
                    .any(|(i, e)| i != index && e.status == PhaseStatus::Active);
                let was_holding =
                    matches!(target.status, PhaseStatus::Active | PhaseStatus::Failed);
                if !moves.is_empty() && was_holding && !other_active {
                    if let Some(next) = next_pending(&entries, index) {
                        moves.push((next, PhaseStatus::Pending, PhaseStatus::Active));
                    }
                }
            }
            OverrideAction::Reset => {
                for (i, entry) in entries.iter().enumerate().skip(index) {
                    if entry.status != PhaseStatus::Pending {
                        moves.push((i, entry.status, PhaseStatus::Pending));
                    }
                }
            }
        }

        if moves.is_empty() {
            return Ok(Vec::new());
        }

        let transitions: Vec<PhaseTransition> = moves
            .iter()
            .map(|(i, from, to)| PhaseTransition {
                entity_type,
                entity_id: entity_id.to_string(),
                phase: entries[*i].phase.clone(),
                from: *from,
                to: *to,
                actor: Actor::Operator,
                reason: reason.clone(),
            })
            .collect();

        if !self.db.apply_phase_transitions(&transitions).await? {
            return Err(OrchestratorError::Conflict {
                entity_type,
                entity_id: entity_id.to_string(),
                phase: phase.to_string(),
            });
        }

        for t in &transitions {
            warn!(
                entity_type = %entity_type,
                entity_id = entity_id,
                phase = %t.phase,
                from = %t.from,
                to = %t.to,
                actor = "operator",
                action = %action,
                reason = %reason,
                "Pipeline phase overridden"
            );
            self.record(t);
        }

        Ok(transitions.into_iter().map(applied).collect())
    }

    /// All pipelines, characters and projects alike.
    pub async fn status(&self) -> Result<Vec<EntityPipeline>, OrchestratorError> {
        let mut grouped: BTreeMap<(EntityType, String), Vec<PipelineEntry>> = BTreeMap::new();
        for entry in self.db.all_pipeline_entries().await? {
            grouped
                .entry((entry.entity_type, entry.entity_id.clone()))
                .or_default()
                .push(entry);
        }
        Ok(grouped
            .into_iter()
            .map(|((entity_type, entity_id), phases)| EntityPipeline {
                entity_type,
                entity_id,
                phases,
            })
            .collect())
    }

    /// One entity's pipeline.
    pub async fn pipeline(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<EntityPipeline, OrchestratorError> {
        let phases = self.require_pipeline(entity_type, entity_id).await?;
        Ok(EntityPipeline {
            entity_type,
            entity_id: entity_id.to_string(),
            phases,
        })
    }

    /// Transition history of one entity, oldest first.
    pub async fn audit(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PipelineAudit>, OrchestratorError> {
        Ok(self.db.pipeline_audit(entity_type, entity_id).await?)
    }

    /// Advances one entity until nothing more changes.
    ///
    /// Looping to a fixpoint keeps a second tick with no new data a no-op.
    async fn evaluate(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        mut entries: Vec<PipelineEntry>,
    ) -> Result<EntityTick, OrchestratorError> {
        let mut moves = Vec::new();

        // Each pass either stops or moves at least one phase forward.
        for _ in 0..=entries.len() * 2 {
            let step = self.step(entity_type, entity_id, &entries).await?;
            let transitions = match step {
                Step::Stop(state) => {
                    return Ok(EntityTick {
                        entity_type,
                        entity_id: entity_id.to_string(),
                        moves,
                        state,
                    })
                }
                Step::Apply(transitions) => transitions,
            };

            if !self.db.apply_phase_transitions(&transitions).await? {
                debug!(
                    entity_type = %entity_type,
                    entity_id = entity_id,
                    phase = %transitions[0].phase,
                    "Lost phase transition race"
                );
                return Ok(EntityTick {
                    entity_type,
                    entity_id: entity_id.to_string(),
                    moves,
                    state: EntityState::Contended {
                        phase: transitions[0].phase.clone(),
                    },
                });
            }

            for t in &transitions {
                info!(
                    entity_type = %entity_type,
                    entity_id = entity_id,
                    phase = %t.phase,
                    from = %t.from,
                    to = %t.to,
                    reason = %t.reason,
                    "Pipeline phase transitioned"
                );
                self.record(t);
            }
            moves.extend(transitions.into_iter().map(applied));
            entries = self.db.pipeline_entries(entity_type, entity_id).await?;
        }

        Ok(EntityTick {
            entity_type,
            entity_id: entity_id.to_string(),
            moves,
            state: EntityState::Contended {
                phase: String::new(),
            },
        })
    }

    /// Decides the next group of moves for one entity.
    async fn step(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        entries: &[PipelineEntry],
    ) -> Result<Step, OrchestratorError> {
        let active: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status == PhaseStatus::Active)
            .map(|(i, _)| i)
            .collect();

        match active.as_slice() {
            [] => Ok(recover(entity_type, entity_id, entries)),
            [index] => {
                let entry = &entries[*index];
                let verdict = self.verdict(entity_type, entity_id, &entry.phase).await?;
                Ok(match verdict {
                    Verdict::Waiting(reason) => Step::Stop(EntityState::Waiting {
                        phase: entry.phase.clone(),
                        reason,
                    }),
                    Verdict::Complete => {
                        let mut transitions = vec![auto_move(
                            entity_type,
                            entity_id,
                            entry,
                            PhaseStatus::Completed,
                            "predicate satisfied",
                        )];
                        if let Some(next) = next_pending(entries, *index) {
                            transitions.push(auto_move(
                                entity_type,
                                entity_id,
                                &entries[next],
                                PhaseStatus::Active,
                                "previous phase completed",
                            ));
                        }
                        Step::Apply(transitions)
                    }
                    Verdict::Failed(reason) => Step::Apply(vec![auto_move(
                        entity_type,
                        entity_id,
                        entry,
                        PhaseStatus::Failed,
                        &reason,
                    )]),
                })
            }
            many => {
                let active: Vec<String> = many.iter().map(|i| entries[*i].phase.clone()).collect();
                error!(
                    entity_type = %entity_type,
                    entity_id = entity_id,
                    active = ?active,
                    "Pipeline has more than one active phase; leaving it untouched"
                );
                Ok(Step::Stop(EntityState::Violation { active }))
            }
        }
    }

    async fn verdict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        phase: &str,
    ) -> Result<Verdict, OrchestratorError> {
        match entity_type {
            EntityType::Character => {
                let Some(predicate) = character_predicate(phase) else {
                    return Ok(unknown_predicate(phase));
                };
                let snapshot = self.character_snapshot(entity_id).await?;
                Ok(predicate(&snapshot))
            }
            EntityType::Project => {
                let Some(predicate) = project_predicate(phase) else {
                    return Ok(unknown_predicate(phase));
                };
                let snapshot = self.project_snapshot(entity_id).await?;
                Ok(predicate(&snapshot))
            }
        }
    }

    async fn character_snapshot(
        &self,
        character_id: &str,
    ) -> Result<CharacterSnapshot, OrchestratorError> {
        let character = self
            .db
            .get_character_by_id(character_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownEntity {
                entity_type: EntityType::Character,
                entity_id: character_id.to_string(),
            })?;

        let counts = self
            .db
            .image_counts(&character.project_id, &character.slug)
            .await?;
        let target = self.settings.target_for(&character).await?;
        let drift_points = self
            .analytics
            .drift_history(
                &character.project_id,
                &character.slug,
                self.config.consistency_points,
            )
            .await?;

        Ok(CharacterSnapshot {
            approved: counts.approved,
            pending: counts.pending,
            reviewed: counts.reviewed(),
            target,
            drift_points,
            required_points: self.config.consistency_points,
            has_training_dataset: character.training_dataset_path.is_some(),
            has_model: character.model_path.is_some(),
            training_status: character.training_status,
            training_error: character.training_error,
        })
    }

    async fn project_snapshot(&self, project_id: &str) -> Result<ProjectSnapshot, OrchestratorError> {
        let mut snapshot = ProjectSnapshot::default();

        for character in self.db.list_characters(Some(project_id)).await? {
            let training = self
                .db
                .pipeline_entries(EntityType::Character, &character.id)
                .await?
                .into_iter()
                .find(|e| e.phase == "training")
                .map(|e| e.status);
            snapshot.characters.push((character.slug, training));
        }

        for scene in self.db.list_scenes(project_id).await? {
            let shots = self.db.list_shots(&scene.id).await?;
            snapshot.scenes.push((scene.id, shots.len()));
            snapshot
                .shot_statuses
                .extend(shots.into_iter().map(|shot| shot.status));
        }

        snapshot.episode_statuses = self
            .db
            .list_episodes(project_id)
            .await?
            .into_iter()
            .map(|episode| episode.status)
            .collect();

        Ok(snapshot)
    }

    async fn require_entity(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(), OrchestratorError> {
        let exists = match entity_type {
            EntityType::Project => self.db.get_project(entity_id).await?.is_some(),
            EntityType::Character => self.db.get_character_by_id(entity_id).await?.is_some(),
        };
        if !exists {
            return Err(OrchestratorError::UnknownEntity {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        }
        Ok(())
    }

    async fn require_pipeline(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<PipelineEntry>, OrchestratorError> {
        let entries = self.db.pipeline_entries(entity_type, entity_id).await?;
        if entries.is_empty() {
            return Err(OrchestratorError::NotInitialized {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        }
        Ok(entries)
    }

    fn record(&self, t: &PhaseTransition) {
        self.metrics.record_phase_transition(
            t.entity_type.as_str(),
            &t.phase,
            t.to.as_str(),
            t.actor.as_str(),
        );
    }

    async fn handle_event(&self, event: &PipelineEvent) -> Result<(), OrchestratorError> {
        let mut projects = Vec::new();

        if let Some((project_id, slug)) = event.character() {
            if let Some(character) = self.db.get_character(project_id, slug).await? {
                self.tick_if_initialized(EntityType::Character, &character.id)
                    .await?;
            }
            if matches!(
                event.kind(),
                EventKind::TrainingCompleted | EventKind::TrainingFailed
            ) {
                projects.push(project_id.to_string());
            }
        }

        if let Some(scene_id) = event.scene_id() {
            if let Some(scene) = self.db.get_scene(scene_id).await? {
                projects.push(scene.project_id);
            }
        }

        for project_id in projects {
            self.tick_if_initialized(EntityType::Project, &project_id)
                .await?;
        }
        Ok(())
    }

    async fn tick_if_initialized(
        &self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<(), OrchestratorError> {
        let entries = self.db.pipeline_entries(entity_type, entity_id).await?;
        if !entries.is_empty() {
            self.evaluate(entity_type, entity_id, entries).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for PipelineOrchestrator {
    fn name(&self) -> &str {
        "pipeline-orchestrator"
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<(), EventError> {
        self.handle_event(event)
            .await
            .map_err(|e| EventError::handler(self.name(), e))
    }
}

enum Step {
    Stop(EntityState),
    Apply(Vec<PhaseTransition>),
}

/// With no active phase, activates the first unsatisfied phase if it is
/// pending and everything before it is completed or skipped.
fn recover(entity_type: EntityType, entity_id: &str, entries: &[PipelineEntry]) -> Step {
    match entries.iter().find(|e| !e.status.is_satisfied()) {
        None => Step::Stop(EntityState::Finished),
        Some(entry) if entry.status == PhaseStatus::Pending => Step::Apply(vec![auto_move(
            entity_type,
            entity_id,
            entry,
            PhaseStatus::Active,
            "earlier phases satisfied",
        )]),
        Some(entry) => Step::Stop(EntityState::Blocked {
            phase: entry.phase.clone(),
        }),
    }
}

/// First pending phase after `index`.
fn next_pending(entries: &[PipelineEntry], index: usize) -> Option<usize> {
    entries
        .iter()
        .enumerate()
        .skip(index + 1)
        .find(|(_, e)| e.status == PhaseStatus::Pending)
        .map(|(i, _)| i)
}

fn auto_move(
    entity_type: EntityType,
    entity_id: &str,
    entry: &PipelineEntry,
    to: PhaseStatus,
    reason: &str,
) -> PhaseTransition {
    PhaseTransition {
        entity_type,
        entity_id: entity_id.to_string(),
        phase: entry.phase.clone(),
        from: entry.status,
        to,
        actor: Actor::Auto,
        reason: reason.to_string(),
    }
}

fn applied(t: PhaseTransition) -> AppliedMove {
    AppliedMove {
        phase: t.phase,
        from: t.from,
        to: t.to,
    }
}

fn unknown_predicate(phase: &str) -> Verdict {
    Verdict::Waiting(format!("no predicate for phase '{}'; override required", phase))
}
