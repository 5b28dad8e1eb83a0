//! Event bus connecting reviewers, loops and analytics.
//!
//! Reviewer decisions, job and shot outcomes, training results and drift
//! alerts are published as [`PipelineEvent`] values. The orchestrator, the
//! replenishment loop and the drift monitor register handlers for the kinds
//! they care about. Nothing is persisted; a restart loses undelivered events
//! and the periodic ticks pick up the slack from stored state.

mod bus;
mod types;

pub use bus::{EventBus, EventError, EventHandler, PublishReport};
pub use types::{EventKind, PipelineEvent};
