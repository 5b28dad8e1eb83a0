//! Image and video generation backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::storage::{GenerationJob, Shot};

const SERVICE: &str = "generation backend";

/// Work submitted to the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationRequest {
    /// A batch of still images for one character.
    Images {
        job_id: String,
        prompt: String,
        negative_prompt: Option<String>,
        batch_size: u32,
        checkpoint: String,
        sampler: String,
        steps: u32,
        seed: Option<i64>,
    },
    /// One video clip.
    Video {
        shot_id: String,
        motion_prompt: String,
        source_image_path: Option<String>,
        duration_seconds: f64,
        seed: Option<i64>,
        steps: Option<u32>,
        engine: String,
    },
}

impl GenerationRequest {
    pub fn for_job(job: &GenerationJob) -> Self {
        GenerationRequest::Images {
            job_id: job.id.clone(),
            prompt: job.prompt.clone(),
            negative_prompt: job.negative_prompt.clone(),
            batch_size: job.batch_size,
            checkpoint: job.params.checkpoint.clone(),
            sampler: job.params.sampler.clone(),
            steps: job.params.steps,
            seed: job.params.seed,
        }
    }

    pub fn for_shot(shot: &Shot) -> Self {
        GenerationRequest::Video {
            shot_id: shot.id.clone(),
            motion_prompt: shot.motion_prompt.clone(),
            source_image_path: shot.source_image_path.clone(),
            duration_seconds: shot.duration_seconds,
            seed: shot.seed,
            steps: shot.steps,
            engine: shot.engine.clone(),
        }
    }
}

/// State of submitted work as reported by the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendStatus {
    Queued,
    Running,
    Completed {
        /// Output file names (images) or paths (video).
        outputs: Vec<String>,
        #[serde(default)]
        seed: Option<i64>,
        #[serde(default)]
        generation_time_seconds: Option<f64>,
    },
    Failed {
        reason: String,
    },
}

/// The external generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Submits work and returns the backend's handle for it.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, BackendError>;

    /// Reports the state of previously submitted work.
    async fn poll(&self, handle: &str) -> Result<BackendStatus, BackendError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

/// JSON-over-HTTP backend.
///
/// `POST {base}/jobs` returns `{"id": ...}`; `GET {base}/jobs/{id}` returns a
/// [`BackendStatus`].
#[derive(Debug, Clone)]
pub struct HttpGenerationBackend {
    base_url: String,
    client: Client,
}

impl HttpGenerationBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }

    fn job_url(&self, handle: Option<&str>) -> String {
        match handle {
            Some(handle) => format!("{}/jobs/{}", self.base_url, handle),
            None => format!("{}/jobs", self.base_url),
        }
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn submit(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let response = self.client.post(self.job_url(None)).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| BackendError::invalid(SERVICE, e.to_string()))?;
        if body.id.is_empty() {
            return Err(BackendError::invalid(SERVICE, "empty job id"));
        }
        Ok(body.id)
    }

    async fn poll(&self, handle: &str) -> Result<BackendStatus, BackendError> {
        let response = self.client.get(self.job_url(Some(handle))).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(BackendStatus::Failed {
                reason: "backend handle lost".to_string(),
            });
        }
        if !status.is_success() {
            return Err(BackendError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::invalid(SERVICE, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{NewShot, ShotStatus, Transition};
    use chrono::Utc;

    #[test]
    fn test_status_parsing() {
        let running: BackendStatus = serde_json::from_str(r#"{"state": "running"}"#).unwrap();
        assert_eq!(running, BackendStatus::Running);

        let done: BackendStatus =
            serde_json::from_str(r#"{"state": "completed", "outputs": ["a.png", "b.png"]}"#)
                .unwrap();
        assert_eq!(
            done,
            BackendStatus::Completed {
                outputs: vec!["a.png".to_string(), "b.png".to_string()],
                seed: None,
                generation_time_seconds: None,
            }
        );

        let failed: BackendStatus =
            serde_json::from_str(r#"{"state": "failed", "reason": "OOM"}"#).unwrap();
        assert!(matches!(failed, BackendStatus::Failed { reason } if reason == "OOM"));
    }

    #[test]
    fn test_video_request_shape() {
        let planned = NewShot::new(2, "slow zoom", 4.0);
        let shot = Shot {
            id: "shot-1".to_string(),
            scene_id: "scene-1".to_string(),
            shot_number: planned.shot_number,
            shot_type: planned.shot_type,
            camera_angle: planned.camera_angle,
            duration_seconds: planned.duration_seconds,
            motion_prompt: planned.motion_prompt,
            source_image_path: Some("mira/001.png".to_string()),
            seed: None,
            steps: None,
            engine: planned.engine,
            transition: Transition::cut(),
            status: ShotStatus::Pending,
            backend_handle: None,
            output_video_path: None,
            error_message: None,
            quality_score: None,
            generation_time_seconds: None,
            updated_at: Utc::now(),
        };

        let json = serde_json::to_value(GenerationRequest::for_shot(&shot)).unwrap();
        assert_eq!(json["kind"], "video");
        assert_eq!(json["shot_id"], "shot-1");
        assert_eq!(json["source_image_path"], "mira/001.png");
    }

    #[test]
    fn test_job_urls() {
        let backend =
            HttpGenerationBackend::new("http://gen.local/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.job_url(None), "http://gen.local/api/jobs");
        assert_eq!(backend.job_url(Some("abc")), "http://gen.local/api/jobs/abc");
    }
}
