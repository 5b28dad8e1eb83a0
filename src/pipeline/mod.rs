//! Pipeline orchestration for projects and characters.
//!
//! Every project and character owns an ordered list of phases. At most one
//! phase is active at a time; a tick evaluates the active phase's predicate
//! against freshly loaded data and moves the pipeline forward.
//!
//! # Architecture
//!
//! - **Phases**: the declared phase lists and one pure predicate per phase
//! - **Orchestrator**: ticks, event reactions and audited operator overrides
//! - **Config**: control-plane settings loaded from `REELFORGE_*` variables
//!
//! # Example
//!
//! ```rust,ignore
//! use reelforge::pipeline::{AppConfig, PipelineOrchestrator};
//! use reelforge::storage::EntityType;
//!
//! let config = AppConfig::from_env()?;
//! let orchestrator = PipelineOrchestrator::new(db, analytics, settings, config.orchestrator_config());
//!
//! orchestrator.initialize(EntityType::Character, &character.id).await?;
//! let report = orchestrator.tick().await?;
//! println!("{} phase moves", report.moves());
//! ```

pub mod config;
pub mod orchestrator;
pub mod phases;

pub use config::{AppConfig, ConfigError};
pub use orchestrator::{
    AppliedMove, EntityFailure, EntityPipeline, EntityState, EntityTick, OrchestratorConfig,
    OrchestratorError, OverrideAction, PipelineOrchestrator, TickReport,
};
pub use phases::{phases_for, CharacterSnapshot, ProjectSnapshot, Verdict};
