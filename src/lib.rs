//! reelforge: control plane for a character-driven content-production
//! pipeline.
//!
//! Characters accumulate approved training images through a replenishment
//! loop, move through a per-entity phase pipeline, and end up in generated
//! shots that are assembled into scenes and episodes.

pub mod analytics;
pub mod backend;
pub mod cli;
pub mod control;
pub mod error;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod production;
pub mod replenish;
pub mod review;
pub mod scheduler;
pub mod storage;
pub mod training;
pub mod utils;

pub use control::{ControlPlane, Services, SetupError};
pub use error::{BackendError, LlmError};
