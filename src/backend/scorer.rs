//! Vision quality scorer.
//!
//! Sends a generated image to a vision model as a base64 data URL and
//! parses the JSON verdict it returns.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::error::BackendError;
use crate::llm::{ChatRequest, LlmProvider, Message};
use crate::metrics::MetricsCollector;
use crate::utils::extract_json_object;

const SERVICE: &str = "vision scorer";

const SCORING_PROMPT: &str = "You review candidate training images for a character model. \
Rate the image for anatomical correctness, sharpness and consistency with the character \
description. Reply with JSON only: \
{\"score\": <0.0-1.0>, \"issues\": [<short tags>], \"caption\": \"<one sentence>\"}";

/// A parsed verdict.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QualityVerdict {
    pub score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// Scores one image file.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn score(&self, image_path: &Path, description: &str) -> Result<QualityVerdict, BackendError>;
}

/// Scorer backed by an OpenAI-compatible vision model.
pub struct VisionScorer {
    provider: Arc<dyn LlmProvider>,
    model: String,
    metrics: MetricsCollector,
}

impl VisionScorer {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl QualityScorer for VisionScorer {
    async fn score(&self, image_path: &Path, description: &str) -> Result<QualityVerdict, BackendError> {
        let bytes = tokio::fs::read(image_path).await?;
        let data_url = format!("data:{};base64,{}", mime_type(image_path), STANDARD.encode(bytes));

        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                Message::system(SCORING_PROMPT),
                Message::user_with_image(format!("Character: {}", description), data_url),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(300);

        let started = Instant::now();
        let result = self.provider.generate(request).await;
        self.metrics.record_scorer_request(
            &self.model,
            result.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        let content = result?
            .first_content()
            .ok_or_else(|| BackendError::invalid(SERVICE, "no choices returned"))?;
        let verdict = parse_verdict(&content)?;
        debug!(
            path = %image_path.display(),
            score = verdict.score,
            issues = verdict.issues.len(),
            "Image scored"
        );
        Ok(verdict)
    }
}

/// Parses a model reply into a verdict with the score clamped to [0, 1].
pub fn parse_verdict(content: &str) -> Result<QualityVerdict, BackendError> {
    let json = extract_json_object(content).map_err(|e| BackendError::invalid(SERVICE, e.to_string()))?;
    let mut verdict: QualityVerdict =
        serde_json::from_str(&json).map_err(|e| BackendError::invalid(SERVICE, e.to_string()))?;
    if !verdict.score.is_finite() {
        return Err(BackendError::invalid(SERVICE, "score is not a number"));
    }
    verdict.score = verdict.score.clamp(0.0, 1.0);
    Ok(verdict)
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, LlmError, MessageContent};
    use std::sync::Mutex;

    struct CannedProvider {
        reply: String,
        seen: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl LlmProvider for CannedProvider {
        async fn generate(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
            self.seen.lock().unwrap().push(request);
            let body = serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": self.reply}}]
            });
            Ok(serde_json::from_value(body).unwrap())
        }
    }

    #[test]
    fn test_parse_verdict_clamps() {
        let verdict = parse_verdict("```json\n{\"score\": 1.4, \"issues\": [\"hands\"]}\n```").unwrap();
        assert_eq!(verdict.score, 1.0);
        assert_eq!(verdict.issues, vec!["hands".to_string()]);
        assert!(parse_verdict("looks fine to me").is_err());
    }

    #[tokio::test]
    async fn test_scores_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("001.jpg");
        tokio::fs::write(&path, b"jpegbytes").await.unwrap();

        let provider = Arc::new(CannedProvider {
            reply: r#"{"score": 0.72, "caption": "mira waving"}"#.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let scorer = VisionScorer::new(provider.clone(), "vision-model");

        let verdict = scorer.score(&path, "red-haired pilot").await.unwrap();
        assert!((verdict.score - 0.72).abs() < 1e-9);
        assert_eq!(verdict.caption.as_deref(), Some("mira waving"));

        let seen = provider.seen.lock().unwrap();
        let MessageContent::Parts(parts) = &seen[0].messages[1].content else {
            panic!("expected a multimodal message");
        };
        let json = serde_json::to_value(&parts[1]).unwrap();
        let url = json["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/jpeg;base64,"));
    }
}
