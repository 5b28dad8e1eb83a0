//! Background work: dispatch to the generation backend and the periodic
//! control loops.
//!
//! ```text
//!   orchestrator tick ──┐
//!   replenisher tick  ──┼── LoopRunner (one tokio task each, shared shutdown)
//!   dispatcher tick   ──┘
//!                          │
//!                          ▼
//!              submit / poll / score via backend traits
//! ```
//!
//! All loops read and write through compare-and-set updates, so a manual
//! `tick` from the CLI can run alongside them.

pub mod dispatcher;
pub mod runner;

pub use dispatcher::{DispatchConfig, DispatchReport, Dispatcher, HANDLE_LOST};
pub use runner::{LoopRunner, PeriodicTask, RunnerError, RunnerStats};
