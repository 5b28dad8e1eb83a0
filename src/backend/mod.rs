//! External collaborators.
//!
//! Each service sits behind a trait so the loops can be exercised with
//! in-memory fakes:
//!
//! - [`GenerationBackend`]: image batches and video clips (HTTP)
//! - [`QualityScorer`]: vision-model scoring of candidate images
//! - [`MediaServer`]: registration of published episodes (HTTP)
//! - [`VideoAssembler`]: scene and episode assembly (ffmpeg)

pub mod assembler;
pub mod generation;
pub mod media;
pub mod scorer;

pub use assembler::{build_filter, AssembledVideo, Clip, FfmpegAssembler, FilterPlan, VideoAssembler};
pub use generation::{BackendStatus, GenerationBackend, GenerationRequest, HttpGenerationBackend};
pub use media::{HttpMediaServer, MediaServer, UnconfiguredMediaServer};
pub use scorer::{parse_verdict, QualityScorer, QualityVerdict, VisionScorer};
