//! Replenishment control loop.
//!
//! Keeps every enabled character's approved-image count at its target by
//! enqueueing generation batches. The deficit is recomputed from live counts
//! on every tick:
//!
//! ```text
//! deficit = target - (approved + pending review + images in outstanding batches)
//! ```
//!
//! A batch is only enqueued while fewer than `max_outstanding_batches` are
//! pending or generating. The counts are read in one statement and the
//! insert is conditional on that same snapshot (outstanding batches and
//! covered images), so two concurrent ticks can never both enqueue for the
//! same gap and a job finishing mid-plan cannot inflate the deficit.
//!
//! A character that errors (a broken project template, say) is reported in
//! [`ReplenishReport::failed`] and the tick moves on to the next one.

pub mod settings;

use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::analytics::{Analytics, AnalyticsError, ParameterSuggestion};
use crate::events::{EventError, EventHandler, EventKind, PipelineEvent};
use crate::metrics::MetricsCollector;
use crate::storage::{
    Character, CharacterSupply, Database, DatabaseError, GenerationJob, GenerationParams,
    JobOrigin, NewJob, OutstandingJobs, Project,
};

pub use settings::ReplenishSettings;

/// Errors that can occur in the replenishment loop.
#[derive(Debug, Error)]
pub enum ReplenishError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Analytics error while choosing parameters.
    #[error("Analytics error: {0}")]
    Analytics(#[from] AnalyticsError),

    /// The project prompt template failed to render.
    #[error("Prompt template error for {character}: {source}")]
    Template {
        character: String,
        #[source]
        source: tera::Error,
    },

    /// The character does not exist.
    #[error("Unknown character '{slug}' in project {project_id}")]
    UnknownCharacter { project_id: String, slug: String },

    /// The project does not exist.
    #[error("Unknown project {0}")]
    UnknownProject(String),
}

/// Replenishment settings that do not change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplenishConfig {
    /// Global target until an operator sets one.
    pub default_target: u32,
    /// Whether the loop runs until an operator toggles it.
    pub enabled_by_default: bool,
    /// Largest batch a single job may request.
    pub max_batch_size: u32,
    /// Outstanding batches allowed per character.
    pub max_outstanding_batches: u32,
    /// Fallbacks used when there is no suggestion and no checkpoint on the
    /// character or project.
    pub default_checkpoint: String,
    pub default_sampler: String,
    pub default_steps: u32,
}

impl Default for ReplenishConfig {
    fn default() -> Self {
        Self {
            default_target: 40,
            enabled_by_default: true,
            max_batch_size: 5,
            max_outstanding_batches: 1,
            default_checkpoint: "base".to_string(),
            default_sampler: "euler".to_string(),
            default_steps: 30,
        }
    }
}

/// What the planner would do for one character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// The loop or the character is switched off.
    Disabled,
    /// Nothing missing.
    Satisfied,
    /// A gap exists but the outstanding-batch cap is reached.
    AtCapacity,
    Enqueue { batch_size: u32 },
}

/// Planner view of one character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterPlan {
    pub project_id: String,
    pub character_slug: String,
    pub target: u32,
    pub approved: u32,
    pub pending: u32,
    pub in_flight: u32,
    pub outstanding_batches: u32,
    pub deficit: i64,
    pub decision: Decision,
}

impl CharacterPlan {
    /// The supply snapshot this plan was computed from.
    pub fn supply(&self) -> CharacterSupply {
        CharacterSupply {
            approved: self.approved,
            pending: self.pending,
            outstanding: OutstandingJobs {
                batches: self.outstanding_batches,
                images: self.in_flight,
            },
        }
    }
}

/// Whether a character has reached its target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    pub project_id: String,
    pub character_slug: String,
    pub approved: u32,
    pub target: u32,
    pub ready: bool,
}

/// A character the tick could not replenish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacterFailure {
    pub project_id: String,
    pub character_slug: String,
    pub error: String,
}

/// Outcome of one replenishment tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplenishReport {
    /// Jobs enqueued by this tick.
    pub enqueued: Vec<GenerationJob>,
    /// Characters whose conditional insert lost a race.
    pub contended: Vec<String>,
    /// Characters skipped because of an error; the rest were still handled.
    pub failed: Vec<CharacterFailure>,
    /// True when the global switch is off and nothing was planned.
    pub disabled: bool,
}

/// The replenishment loop.
#[derive(Debug, Clone)]
pub struct Replenisher {
    db: Database,
    analytics: Analytics,
    settings: ReplenishSettings,
    config: ReplenishConfig,
    metrics: MetricsCollector,
}

impl Replenisher {
    pub fn new(db: Database, analytics: Analytics, config: ReplenishConfig) -> Self {
        let settings =
            ReplenishSettings::new(db.clone(), config.default_target, config.enabled_by_default);
        Self {
            db,
            analytics,
            settings,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn settings(&self) -> &ReplenishSettings {
        &self.settings
    }

    /// Turns replenishment on or off, globally or for one character
    /// given as `(project id, slug)`.
    pub async fn toggle(
        &self,
        enabled: bool,
        character: Option<(&str, &str)>,
    ) -> Result<(), ReplenishError> {
        match character {
            None => {
                self.settings.set_global_enabled(enabled).await?;
                info!(enabled = enabled, "Replenishment toggled globally");
            }
            Some((project_id, slug)) => {
                let character = self.require_character(project_id, slug).await?;
                self.db
                    .set_character_replenish_enabled(&character.id, enabled)
                    .await?;
                info!(
                    project_id = project_id,
                    character = slug,
                    enabled = enabled,
                    "Replenishment toggled for character"
                );
            }
        }
        Ok(())
    }

    /// Sets the global target or one character's target.
    pub async fn set_target(
        &self,
        count: u32,
        character: Option<(&str, &str)>,
    ) -> Result<(), ReplenishError> {
        match character {
            None => {
                self.settings.set_global_target(count).await?;
                info!(target = count, "Global replenishment target set");
            }
            Some((project_id, slug)) => {
                let character = self.require_character(project_id, slug).await?;
                self.db
                    .set_character_replenish_target(&character.id, Some(count))
                    .await?;
                info!(
                    project_id = project_id,
                    character = slug,
                    target = count,
                    "Character replenishment target set"
                );
            }
        }
        Ok(())
    }

    /// Computes the decision for every character without writing anything.
    pub async fn plan(&self) -> Result<Vec<CharacterPlan>, ReplenishError> {
        let global_enabled = self.settings.global_enabled().await?;
        let mut plans = Vec::new();
        for character in self.db.list_characters(None).await? {
            plans.push(self.plan_character(&character, global_enabled).await?);
        }
        Ok(plans)
    }

    /// Enqueues one batch for every character with a gap.
    pub async fn tick(&self) -> Result<ReplenishReport, ReplenishError> {
        let started = Instant::now();
        let mut report = ReplenishReport::default();

        if !self.settings.global_enabled().await? {
            debug!("Replenishment disabled globally; skipping tick");
            report.disabled = true;
            return Ok(report);
        }

        for character in self.db.list_characters(None).await? {
            match self.replenish(&character, true).await {
                Ok(Outcome::Enqueued(job)) => report.enqueued.push(job),
                Ok(Outcome::Contended) => report.contended.push(character.slug.clone()),
                Ok(Outcome::Idle) => {}
                Err(e) => {
                    warn!(
                        project_id = %character.project_id,
                        character = %character.slug,
                        error = %e,
                        "Replenishment failed for character"
                    );
                    report.failed.push(CharacterFailure {
                        project_id: character.project_id.clone(),
                        character_slug: character.slug.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        self.metrics
            .observe_tick("replenish", started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Event-triggered tick for one character.
    pub async fn tick_character(
        &self,
        project_id: &str,
        slug: &str,
    ) -> Result<Option<GenerationJob>, ReplenishError> {
        if !self.settings.global_enabled().await? {
            return Ok(None);
        }
        let character = self.require_character(project_id, slug).await?;
        Ok(match self.replenish(&character, true).await? {
            Outcome::Enqueued(job) => Some(job),
            Outcome::Contended | Outcome::Idle => None,
        })
    }

    /// Per-character `approved >= target`, optionally for one project.
    pub async fn readiness(
        &self,
        project_id: Option<&str>,
    ) -> Result<Vec<Readiness>, ReplenishError> {
        let mut out = Vec::new();
        for character in self.db.list_characters(project_id).await? {
            let counts = self
                .db
                .image_counts(&character.project_id, &character.slug)
                .await?;
            let target = self.settings.target_for(&character).await?;
            out.push(Readiness {
                ready: counts.approved >= target,
                project_id: character.project_id,
                character_slug: character.slug,
                approved: counts.approved,
                target,
            });
        }
        Ok(out)
    }

    async fn plan_character(
        &self,
        character: &Character,
        global_enabled: bool,
    ) -> Result<CharacterPlan, ReplenishError> {
        let supply = self
            .db
            .character_supply(&character.project_id, &character.slug)
            .await?;
        let outstanding = supply.outstanding;
        let target = self.settings.target_for(character).await?;

        let deficit = target as i64 - supply.covered() as i64;

        let decision = if !global_enabled || !character.replenish_enabled {
            Decision::Disabled
        } else if deficit <= 0 {
            Decision::Satisfied
        } else if outstanding.batches >= self.config.max_outstanding_batches {
            Decision::AtCapacity
        } else {
            Decision::Enqueue {
                batch_size: (deficit as u32).min(self.config.max_batch_size),
            }
        };

        Ok(CharacterPlan {
            project_id: character.project_id.clone(),
            character_slug: character.slug.clone(),
            target,
            approved: supply.approved,
            pending: supply.pending,
            in_flight: outstanding.images,
            outstanding_batches: outstanding.batches,
            deficit,
            decision,
        })
    }

    async fn replenish(
        &self,
        character: &Character,
        global_enabled: bool,
    ) -> Result<Outcome, ReplenishError> {
        let plan = self.plan_character(character, global_enabled).await?;
        self.metrics
            .set_deficit(&character.slug, plan.deficit.max(0));

        let Decision::Enqueue { batch_size } = plan.decision else {
            return Ok(Outcome::Idle);
        };

        let project = self
            .db
            .get_project(&character.project_id)
            .await?
            .ok_or_else(|| ReplenishError::UnknownProject(character.project_id.clone()))?;
        let params = self.choose_params(&project, character).await?;
        let prompt = render_prompt(&project, character)?;

        let job = NewJob {
            project_id: character.project_id.clone(),
            character_slug: character.slug.clone(),
            batch_size,
            prompt,
            negative_prompt: project.negative_prompt.clone(),
            params,
            origin: JobOrigin::Replenishment,
        };

        match self
            .db
            .enqueue_job_if_unchanged(&job, &plan.supply())
            .await?
        {
            Some(job) => {
                info!(
                    project_id = %job.project_id,
                    character = %job.character_slug,
                    job_id = %job.id,
                    batch_size = batch_size,
                    deficit = plan.deficit,
                    checkpoint = %job.params.checkpoint,
                    "Replenishment batch enqueued"
                );
                self.metrics
                    .record_replenish_batch(&character.slug, batch_size);
                Ok(Outcome::Enqueued(job))
            }
            None => {
                debug!(
                    project_id = %character.project_id,
                    character = %character.slug,
                    "Supply changed during planning; retrying next tick"
                );
                Ok(Outcome::Contended)
            }
        }
    }

    /// Suggested parameters, else the character/project/configured defaults.
    async fn choose_params(
        &self,
        project: &Project,
        character: &Character,
    ) -> Result<GenerationParams, ReplenishError> {
        let suggestion = self
            .analytics
            .suggest_parameters(&character.project_id, &character.slug)
            .await?;

        if let ParameterSuggestion::Suggested { params, .. } = suggestion {
            return Ok(params);
        }

        let checkpoint = character
            .checkpoint
            .as_deref()
            .or(project.default_checkpoint.as_deref())
            .unwrap_or(&self.config.default_checkpoint);
        Ok(GenerationParams::new(
            checkpoint,
            self.config.default_sampler.clone(),
            self.config.default_steps,
        ))
    }

    async fn require_character(
        &self,
        project_id: &str,
        slug: &str,
    ) -> Result<Character, ReplenishError> {
        self.db
            .get_character(project_id, slug)
            .await?
            .ok_or_else(|| ReplenishError::UnknownCharacter {
                project_id: project_id.to_string(),
                slug: slug.to_string(),
            })
    }
}

enum Outcome {
    Enqueued(GenerationJob),
    Contended,
    Idle,
}

/// Renders the project's prompt template for a character.
///
/// The template sees `name`, `slug`, `design_prompt` and `project`.
pub fn render_prompt(project: &Project, character: &Character) -> Result<String, ReplenishError> {
    let mut context = Context::new();
    context.insert("name", &character.name);
    context.insert("slug", &character.slug);
    context.insert("design_prompt", &character.design_prompt);
    context.insert("project", &project.name);

    Tera::one_off(&project.prompt_template, &context, false).map_err(|source| {
        ReplenishError::Template {
            character: character.slug.clone(),
            source,
        }
    })
}

#[async_trait]
impl EventHandler for Replenisher {
    fn name(&self) -> &str {
        "replenisher"
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<(), EventError> {
        if !EventKind::REVIEW_AND_JOBS.contains(&event.kind()) {
            return Ok(());
        }
        let Some((project_id, slug)) = event.character() else {
            return Ok(());
        };
        self.tick_character(project_id, slug)
            .await
            .map(|_| ())
            .map_err(|e| EventError::handler(self.name(), e))
    }
}
