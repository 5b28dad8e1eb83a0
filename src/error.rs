//! Error types for the external collaborators.
//!
//! Defines the error types shared by the boundary adapters:
//! - LLM API interactions (the vision scorer)
//! - Generation backend, media server and video assembly calls
//!
//! Subsystem errors (`DatabaseError`, `OrchestratorError`, ...) live next to
//! the code that raises them.

use thiserror::Error;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: REELFORGE_LLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the generation backend, the scorer, the media server
/// and the video assembler.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid response from {service}: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("ffmpeg exited with {status:?}: {stderr}")]
    Ffmpeg { status: Option<i32>, stderr: String },

    #[error("Nothing to assemble")]
    NoInputs,

    #[error("No {0} configured")]
    NotConfigured(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn invalid(service: &'static str, message: impl Into<String>) -> Self {
        BackendError::InvalidResponse {
            service,
            message: message.into(),
        }
    }
}
