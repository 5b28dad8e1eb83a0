//! SQLite persistent storage.
//!
//! Every control loop resumes purely from the status columns stored here.
//!
//! # Overview
//!
//! - **Database**: pooled SQLite client; one `impl Database` block per
//!   record family (characters, images, jobs, phases, production)
//! - **Migrations**: idempotent schema runner with a `_migrations` table
//! - **Models**: row types and their status enums
//!
//! # Usage
//!
//! ```rust,ignore
//! use reelforge::storage::{Database, NewImage};
//!
//! let db = Database::open("reelforge.db").await?;
//! let counts = db.image_counts(&project_id, "mira").await?;
//! println!("{} approved", counts.approved);
//! ```

pub mod database;
pub mod images;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod phases;
pub mod production;
pub mod schema;

// Re-export main types for convenience
pub use database::{Database, DatabaseError, NewCharacter};
pub use images::{CharacterImageCounts, ImageCounts, NewImage};
pub use jobs::{CharacterSupply, NewJob, OutstandingJobs};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use models::*;
pub use phases::PhaseTransition;
