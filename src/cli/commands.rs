//! CLI command definitions for reelforge.
//!
//! Every command opens the shared control plane, performs one operation and
//! prints the result as JSON. `serve` runs the periodic loops until Ctrl-C.

use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::analytics::{TrendScope, MAX_TREND_DAYS};
use crate::control::ControlPlane;
use crate::metrics::{export_metrics, init_metrics};
use crate::pipeline::{AppConfig, OverrideAction};
use crate::scheduler::LoopRunner;
use crate::storage::EntityType;
use crate::training::TrainingOutcome;

/// Content-production pipeline control plane.
#[derive(Parser)]
#[command(name = "reelforge")]
#[command(about = "Drive character image pipelines, replenishment and video assembly")]
#[command(version)]
#[command(
    long_about = "reelforge coordinates character image generation, human review, drift detection and shot/scene/episode assembly against one SQLite datastore.\n\nExample usage:\n  reelforge serve\n  reelforge replenish plan\n  reelforge review approve <image-id> --feedback \"good likeness\""
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// SQLite database file.
    #[arg(long, env = "REELFORGE_DATABASE", global = true)]
    pub database: Option<String>,

    /// Root directory for assembled videos and training manifests.
    #[arg(long, env = "REELFORGE_OUTPUT_DIR", global = true)]
    pub output_dir: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the orchestrator, replenishment and dispatch loops until Ctrl-C.
    Serve,

    /// Inspect and drive project/character phase pipelines.
    Pipeline(PipelineArgs),

    /// Control the replenishment loop.
    Replenish(ReplenishArgs),

    /// Quality and drift queries.
    Analytics(AnalyticsArgs),

    /// Record reviewer decisions.
    Review(ReviewArgs),

    /// Queue, retry or cancel shots.
    Shot(ShotArgs),

    /// Scene status and assembly.
    Scene(SceneArgs),

    /// Episode assembly and publishing.
    Episode(EpisodeArgs),

    /// Hand-off to the external trainer.
    Training(TrainingArgs),

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Identifies one character when given, otherwise the whole loop.
#[derive(clap::Args, Debug, Clone)]
pub struct CharacterScope {
    /// Project id of the character.
    #[arg(long, requires = "character")]
    pub project: Option<String>,

    /// Character slug.
    #[arg(long, requires = "project")]
    pub character: Option<String>,
}

impl CharacterScope {
    fn as_pair(&self) -> Option<(&str, &str)> {
        match (self.project.as_deref(), self.character.as_deref()) {
            (Some(project), Some(character)) => Some((project, character)),
            _ => None,
        }
    }
}

// ============================================================================
// pipeline
// ============================================================================

#[derive(Parser, Debug)]
pub struct PipelineArgs {
    #[command(subcommand)]
    pub command: PipelineSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum PipelineSubcommand {
    /// Create the phase rows for a project or character.
    Init {
        /// project or character.
        entity_type: EntityType,
        entity_id: String,
    },

    /// Evaluate every pipeline once, or a single entity.
    Tick {
        #[arg(long, requires = "entity_id")]
        entity_type: Option<EntityType>,
        #[arg(long, requires = "entity_type")]
        entity_id: Option<String>,
    },

    /// Every pipeline with its active phase.
    Status,

    /// One pipeline in full.
    Show {
        entity_type: EntityType,
        entity_id: String,
        /// Include the transition history.
        #[arg(long)]
        audit: bool,
    },

    /// Operator override of one phase.
    Override {
        entity_type: EntityType,
        entity_id: String,
        phase: String,
        action: OverrideArg,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
pub enum OverrideArg {
    Skip,
    Reset,
    Complete,
}

impl From<OverrideArg> for OverrideAction {
    fn from(arg: OverrideArg) -> Self {
        match arg {
            OverrideArg::Skip => OverrideAction::Skip,
            OverrideArg::Reset => OverrideAction::Reset,
            OverrideArg::Complete => OverrideAction::Complete,
        }
    }
}

// ============================================================================
// replenish
// ============================================================================

#[derive(Parser, Debug)]
pub struct ReplenishArgs {
    #[command(subcommand)]
    pub command: ReplenishSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ReplenishSubcommand {
    /// Switch replenishment on or off, globally or for one character.
    Toggle {
        #[arg(value_parser = parse_switch, action = clap::ArgAction::Set)]
        state: bool,
        #[command(flatten)]
        scope: CharacterScope,
    },

    /// Set the approved-image target, globally or for one character.
    Target {
        count: u32,
        #[command(flatten)]
        scope: CharacterScope,
    },

    /// Run one replenishment tick now.
    Tick,

    /// Show what a tick would do without enqueueing anything.
    Plan,

    /// Which characters have reached their target.
    Readiness {
        #[arg(long)]
        project: Option<String>,
    },
}

// ============================================================================
// analytics
// ============================================================================

#[derive(Parser, Debug)]
pub struct AnalyticsArgs {
    #[command(subcommand)]
    pub command: AnalyticsSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum AnalyticsSubcommand {
    /// Review totals per character.
    Stats {
        #[arg(long)]
        project: Option<String>,
    },

    /// Checkpoints ranked by quality within a project.
    Rankings { project: String },

    /// Daily average quality for a project or one character.
    Trend {
        project: String,
        #[arg(long)]
        character: Option<String>,
        #[arg(
            long,
            default_value = "14",
            value_parser = clap::value_parser!(u32).range(1..=MAX_TREND_DAYS as i64)
        )]
        days: u32,
    },

    /// Current drift assessment for a character.
    Drift {
        project: String,
        character: String,
        /// Also show this many past review points.
        #[arg(long)]
        history: Option<usize>,
    },

    /// Parameters with the best recent approval rate.
    Suggest { project: String, character: String },
}

// ============================================================================
// review / production / training
// ============================================================================

#[derive(Parser, Debug)]
pub struct ReviewArgs {
    #[command(subcommand)]
    pub command: ReviewSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ReviewSubcommand {
    Approve {
        image_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
    Reject {
        image_id: String,
        #[arg(long)]
        feedback: Option<String>,
    },
}

#[derive(Parser, Debug)]
pub struct ShotArgs {
    #[command(subcommand)]
    pub command: ShotSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum ShotSubcommand {
    /// Queue one draft shot, or every draft shot of a scene.
    Queue {
        #[arg(required_unless_present = "scene", conflicts_with = "scene")]
        shot_id: Option<String>,
        #[arg(long)]
        scene: Option<String>,
    },
    /// Move a failed shot back to pending.
    Retry { shot_id: String },
    /// Fail a pending or generating shot.
    Cancel {
        shot_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
}

#[derive(Parser, Debug)]
pub struct SceneArgs {
    #[command(subcommand)]
    pub command: SceneSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum SceneSubcommand {
    /// Derived status of one scene, or every scene of a project.
    Status {
        #[arg(required_unless_present = "project", conflicts_with = "project")]
        scene_id: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Assemble the completed shots of a scene.
    Assemble { scene_id: String },
}

#[derive(Parser, Debug)]
pub struct EpisodeArgs {
    #[command(subcommand)]
    pub command: EpisodeSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum EpisodeSubcommand {
    Assemble { episode_id: String },
    Publish { episode_id: String },
}

#[derive(Parser, Debug)]
pub struct TrainingArgs {
    #[command(subcommand)]
    pub command: TrainingSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum TrainingSubcommand {
    /// Write the manifest of approved images for the trainer.
    Prepare { project: String, character: String },

    /// Record the trainer's outcome.
    Record {
        project: String,
        character: String,
        #[arg(long, required_unless_present = "error", conflicts_with = "error")]
        model_path: Option<String>,
        #[arg(long)]
        error: Option<String>,
    },
}

// ============================================================================
// Entry points
// ============================================================================

/// Parse CLI arguments without running the command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse and run.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Metrics = cli.command {
        init_metrics()?;
    }

    let mut config = AppConfig::from_env()?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    if let Some(output_dir) = cli.output_dir {
        config.output_dir = output_dir;
    }
    config.validate()?;

    let plane = ControlPlane::open(config).await?;

    match cli.command {
        Commands::Serve => run_serve(plane).await,
        Commands::Pipeline(args) => run_pipeline_command(&plane, args).await,
        Commands::Replenish(args) => run_replenish_command(&plane, args).await,
        Commands::Analytics(args) => run_analytics_command(&plane, args).await,
        Commands::Review(args) => run_review_command(&plane, args).await,
        Commands::Shot(args) => run_shot_command(&plane, args).await,
        Commands::Scene(args) => run_scene_command(&plane, args).await,
        Commands::Episode(args) => run_episode_command(&plane, args).await,
        Commands::Training(args) => run_training_command(&plane, args).await,
        Commands::Metrics => run_metrics_command(&plane).await,
    }
}

async fn run_serve(plane: ControlPlane) -> anyhow::Result<()> {
    init_metrics()?;

    let mut runner = LoopRunner::new(plane.config.shutdown_timeout);
    runner.start(plane.loops())?;
    info!("reelforge serving; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let stats = runner.stats();
    runner.shutdown().await?;
    info!(
        ticks = stats.ticks,
        failures = stats.failures,
        "reelforge stopped"
    );
    Ok(())
}

async fn run_pipeline_command(plane: &ControlPlane, args: PipelineArgs) -> anyhow::Result<()> {
    let orchestrator = &plane.orchestrator;
    match args.command {
        PipelineSubcommand::Init {
            entity_type,
            entity_id,
        } => {
            let created = orchestrator.initialize(entity_type, &entity_id).await?;
            print_json(&orchestrator.pipeline(entity_type, &entity_id).await?)?;
            if created == 0 {
                info!(entity_id = %entity_id, "Pipeline already initialized");
            }
        }
        PipelineSubcommand::Tick {
            entity_type: Some(entity_type),
            entity_id: Some(entity_id),
        } => {
            print_json(&orchestrator.tick_entity(entity_type, &entity_id).await?)?;
        }
        PipelineSubcommand::Tick { .. } => {
            let report = orchestrator.tick().await?;
            if report.violations() > 0 {
                warn!(violations = report.violations(), "Pipelines with more than one active phase");
            }
            print_json(&report)?;
        }
        PipelineSubcommand::Status => {
            let rows: Vec<PipelineStatusRow> = orchestrator
                .status()
                .await?
                .into_iter()
                .map(|pipeline| PipelineStatusRow {
                    active_phase: pipeline.active_phase().map(str::to_string),
                    entity_type: pipeline.entity_type,
                    entity_id: pipeline.entity_id,
                })
                .collect();
            print_json(&rows)?;
        }
        PipelineSubcommand::Show {
            entity_type,
            entity_id,
            audit,
        } => {
            let pipeline = orchestrator.pipeline(entity_type, &entity_id).await?;
            if audit {
                let history = orchestrator.audit(entity_type, &entity_id).await?;
                print_json(&serde_json::json!({ "pipeline": pipeline, "audit": history }))?;
            } else {
                print_json(&pipeline)?;
            }
        }
        PipelineSubcommand::Override {
            entity_type,
            entity_id,
            phase,
            action,
            reason,
        } => {
            let moves = orchestrator
                .override_phase(entity_type, &entity_id, &phase, action.into(), reason.as_deref())
                .await?;
            print_json(&moves)?;
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PipelineStatusRow {
    entity_type: EntityType,
    entity_id: String,
    active_phase: Option<String>,
}

async fn run_replenish_command(plane: &ControlPlane, args: ReplenishArgs) -> anyhow::Result<()> {
    let replenisher = &plane.replenisher;
    match args.command {
        ReplenishSubcommand::Toggle { state, scope } => {
            replenisher.toggle(state, scope.as_pair()).await?;
            print_json(&serde_json::json!({
                "enabled": state,
                "project": scope.project,
                "character": scope.character,
            }))?;
        }
        ReplenishSubcommand::Target { count, scope } => {
            replenisher.set_target(count, scope.as_pair()).await?;
            print_json(&serde_json::json!({
                "target": count,
                "project": scope.project,
                "character": scope.character,
            }))?;
        }
        ReplenishSubcommand::Tick => print_json(&replenisher.tick().await?)?,
        ReplenishSubcommand::Plan => print_json(&replenisher.plan().await?)?,
        ReplenishSubcommand::Readiness { project } => {
            print_json(&replenisher.readiness(project.as_deref()).await?)?
        }
    }
    Ok(())
}

async fn run_analytics_command(plane: &ControlPlane, args: AnalyticsArgs) -> anyhow::Result<()> {
    let analytics = &plane.analytics;
    match args.command {
        AnalyticsSubcommand::Stats { project } => {
            print_json(&analytics.dataset_stats(project.as_deref()).await?)?
        }
        AnalyticsSubcommand::Rankings { project } => {
            print_json(&analytics.checkpoint_rankings(&project).await?)?
        }
        AnalyticsSubcommand::Trend {
            project,
            character,
            days,
        } => {
            let scope = match character {
                Some(character_slug) => TrendScope::Character {
                    project_id: project,
                    character_slug,
                },
                None => TrendScope::Project(project),
            };
            print_json(&analytics.quality_trend(&scope, days).await?)?;
        }
        AnalyticsSubcommand::Drift {
            project,
            character,
            history,
        } => match history {
            Some(points) => {
                print_json(&analytics.drift_history(&project, &character, points).await?)?
            }
            None => print_json(&analytics.drift_alert(&project, &character).await?)?,
        },
        AnalyticsSubcommand::Suggest { project, character } => {
            print_json(&analytics.suggest_parameters(&project, &character).await?)?
        }
    }
    Ok(())
}

async fn run_review_command(plane: &ControlPlane, args: ReviewArgs) -> anyhow::Result<()> {
    let outcome = match args.command {
        ReviewSubcommand::Approve { image_id, feedback } => {
            plane.review.approve(&image_id, feedback.as_deref()).await?
        }
        ReviewSubcommand::Reject { image_id, feedback } => {
            plane.review.reject(&image_id, feedback.as_deref()).await?
        }
    };
    print_json(&outcome)
}

async fn run_shot_command(plane: &ControlPlane, args: ShotArgs) -> anyhow::Result<()> {
    let production = &plane.production;
    match args.command {
        ShotSubcommand::Queue {
            scene: Some(scene_id),
            ..
        } => print_json(&production.queue_scene(&scene_id).await?)?,
        ShotSubcommand::Queue {
            shot_id: Some(shot_id),
            ..
        } => print_json(&production.queue(&shot_id).await?)?,
        ShotSubcommand::Queue { .. } => anyhow::bail!("either a shot id or --scene is required"),
        ShotSubcommand::Retry { shot_id } => print_json(&production.retry(&shot_id).await?)?,
        ShotSubcommand::Cancel { shot_id, reason } => {
            print_json(&production.cancel(&shot_id, &reason).await?)?
        }
    }
    Ok(())
}

async fn run_scene_command(plane: &ControlPlane, args: SceneArgs) -> anyhow::Result<()> {
    let production = &plane.production;
    match args.command {
        SceneSubcommand::Status {
            project: Some(project_id),
            ..
        } => print_json(&production.project_scenes(&project_id).await?)?,
        SceneSubcommand::Status {
            scene_id: Some(scene_id),
            ..
        } => print_json(&production.scene_status(&scene_id).await?)?,
        SceneSubcommand::Status { .. } => anyhow::bail!("either a scene id or --project is required"),
        SceneSubcommand::Assemble { scene_id } => {
            let assembly = production.assemble_scene(&scene_id).await?;
            if assembly.is_partial() {
                warn!(
                    scene_id = %scene_id,
                    included = assembly.shots_included,
                    total = assembly.shots_total,
                    "Partial scene assembly"
                );
            }
            print_json(&assembly)?;
        }
    }
    Ok(())
}

async fn run_episode_command(plane: &ControlPlane, args: EpisodeArgs) -> anyhow::Result<()> {
    let production = &plane.production;
    match args.command {
        EpisodeSubcommand::Assemble { episode_id } => {
            print_json(&production.assemble_episode(&episode_id).await?)?
        }
        EpisodeSubcommand::Publish { episode_id } => {
            print_json(&production.publish_episode(&episode_id).await?)?
        }
    }
    Ok(())
}

async fn run_training_command(plane: &ControlPlane, args: TrainingArgs) -> anyhow::Result<()> {
    let training = &plane.training;
    match args.command {
        TrainingSubcommand::Prepare { project, character } => {
            let (path, manifest) = training.prepare_training_set(&project, &character).await?;
            print_json(&serde_json::json!({
                "manifest_path": path.display().to_string(),
                "images": manifest.images.len(),
            }))?;
        }
        TrainingSubcommand::Record {
            project,
            character,
            model_path,
            error,
        } => {
            let outcome = match (model_path, error) {
                (Some(model_path), _) => TrainingOutcome::Completed { model_path },
                (None, Some(reason)) => TrainingOutcome::Failed { reason },
                (None, None) => anyhow::bail!("either --model-path or --error is required"),
            };
            print_json(
                &training
                    .record_training_result(&project, &character, outcome)
                    .await?,
            )?;
        }
    }
    Ok(())
}

async fn run_metrics_command(plane: &ControlPlane) -> anyhow::Result<()> {
    // Refresh the deficit gauges from stored state before exporting.
    plane.replenisher.plan().await?;
    print!("{}", export_metrics());
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output JSON: {}", e))?;
    println!("{}", json);
    Ok(())
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "on" | "true" | "enable" | "enabled" => Ok(true),
        "off" | "false" | "disable" | "disabled" => Ok(false),
        other => Err(format!("expected on/off, got '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_override_command() {
        let cli = Cli::try_parse_from([
            "reelforge",
            "pipeline",
            "override",
            "character",
            "c-1",
            "review",
            "reset",
            "--reason",
            "bad batch",
        ])
        .unwrap();
        match cli.command {
            Commands::Pipeline(PipelineArgs {
                command:
                    PipelineSubcommand::Override {
                        entity_type,
                        action,
                        reason,
                        ..
                    },
            }) => {
                assert_eq!(entity_type, EntityType::Character);
                assert_eq!(OverrideAction::from(action), OverrideAction::Reset);
                assert_eq!(reason.as_deref(), Some("bad batch"));
            }
            _ => panic!("expected pipeline override"),
        }
    }

    #[test]
    fn test_toggle_scope_requires_both_parts() {
        let cli = Cli::try_parse_from([
            "reelforge", "replenish", "toggle", "off", "--project", "p1", "--character", "mira",
        ])
        .unwrap();
        match cli.command {
            Commands::Replenish(ReplenishArgs {
                command: ReplenishSubcommand::Toggle { state, scope },
            }) => {
                assert!(!state);
                assert_eq!(scope.as_pair(), Some(("p1", "mira")));
            }
            _ => panic!("expected replenish toggle"),
        }

        assert!(Cli::try_parse_from(["reelforge", "replenish", "toggle", "on", "--project", "p1"]).is_err());
        assert!(Cli::try_parse_from(["reelforge", "replenish", "toggle", "maybe"]).is_err());
    }

    #[test]
    fn test_trend_days_are_bounded() {
        assert!(Cli::try_parse_from(["reelforge", "analytics", "trend", "p1", "--days", "0"]).is_err());
        assert!(Cli::try_parse_from([
            "reelforge", "analytics", "trend", "p1", "--days", "200000000",
        ])
        .is_err());
        assert!(Cli::try_parse_from(["reelforge", "analytics", "trend", "p1", "--days", "30"]).is_ok());
    }

    #[test]
    fn test_training_record_needs_an_outcome() {
        assert!(Cli::try_parse_from(["reelforge", "training", "record", "p1", "mira"]).is_err());
        assert!(Cli::try_parse_from([
            "reelforge", "training", "record", "p1", "mira", "--error", "oom",
        ])
        .is_ok());
    }
}
