//! Reviewer decisions on candidate images.
//!
//! A decision is a compare-and-set on the status the reviewer saw. When it
//! lands, the matching `ImageApproved` / `ImageRejected` event is published
//! so the orchestrator, the replenishment loop and the drift monitor react
//! immediately instead of waiting for their next tick.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::events::{EventBus, PipelineEvent};
use crate::storage::{Database, DatabaseError, GeneratedImage, ReviewStatus};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Unknown image {0}")]
    UnknownImage(String),

    /// The image changed between read and write.
    #[error("Image {image_id} was reviewed concurrently (now {status})")]
    Conflict {
        image_id: String,
        status: ReviewStatus,
    },
}

/// Result of a review decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    pub image: GeneratedImage,
    pub previous: ReviewStatus,
    /// False when the image already carried this decision.
    pub changed: bool,
}

/// Applies reviewer decisions.
pub struct ReviewDesk {
    db: Database,
    bus: Arc<EventBus>,
}

impl ReviewDesk {
    pub fn new(db: Database, bus: Arc<EventBus>) -> Self {
        Self { db, bus }
    }

    pub async fn approve(
        &self,
        image_id: &str,
        feedback: Option<&str>,
    ) -> Result<ReviewOutcome, ReviewError> {
        self.decide(image_id, ReviewStatus::Approved, feedback).await
    }

    pub async fn reject(
        &self,
        image_id: &str,
        feedback: Option<&str>,
    ) -> Result<ReviewOutcome, ReviewError> {
        self.decide(image_id, ReviewStatus::Rejected, feedback).await
    }

    async fn decide(
        &self,
        image_id: &str,
        decision: ReviewStatus,
        feedback: Option<&str>,
    ) -> Result<ReviewOutcome, ReviewError> {
        let image = self.load(image_id).await?;
        let previous = image.review_status;
        if previous == decision {
            debug!(image_id = image_id, status = %decision, "Review decision unchanged");
            return Ok(ReviewOutcome {
                image,
                previous,
                changed: false,
            });
        }

        if !self
            .db
            .set_review_status(image_id, previous, decision, feedback)
            .await?
        {
            let current = self.load(image_id).await?;
            return Err(ReviewError::Conflict {
                image_id: image_id.to_string(),
                status: current.review_status,
            });
        }

        let image = self.load(image_id).await?;
        info!(
            image_id = image_id,
            project_id = %image.project_id,
            character = %image.character_slug,
            from = %previous,
            to = %decision,
            "Image reviewed"
        );

        let event = match decision {
            ReviewStatus::Approved => PipelineEvent::ImageApproved {
                project_id: image.project_id.clone(),
                character_slug: image.character_slug.clone(),
                image_id: image.id.clone(),
                timestamp: Utc::now(),
            },
            _ => PipelineEvent::ImageRejected {
                project_id: image.project_id.clone(),
                character_slug: image.character_slug.clone(),
                image_id: image.id.clone(),
                timestamp: Utc::now(),
            },
        };
        self.bus.publish(event).await;

        Ok(ReviewOutcome {
            image,
            previous,
            changed: true,
        })
    }

    async fn load(&self, image_id: &str) -> Result<GeneratedImage, ReviewError> {
        self.db
            .get_image(image_id)
            .await?
            .ok_or_else(|| ReviewError::UnknownImage(image_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::storage::database::test_support::*;
    use crate::storage::{GenerationParams, NewImage};

    #[tokio::test]
    async fn test_approve_publishes_event() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let image_id = db
            .insert_image(&NewImage::pending(
                &project.id,
                "mira",
                "001.png",
                GenerationParams::new("base-v1", "euler", 30),
            ))
            .await
            .unwrap();

        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let desk = ReviewDesk::new(db.clone(), bus);

        let outcome = desk.approve(&image_id, Some("great likeness")).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.previous, ReviewStatus::Pending);
        assert_eq!(outcome.image.review_status, ReviewStatus::Approved);
        assert_eq!(outcome.image.feedback.as_deref(), Some("great likeness"));
        assert!(outcome.image.reviewed_at.is_some());

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::ImageApproved);
        assert_eq!(event.character(), Some((project.id.as_str(), "mira")));

        // Repeating the same decision is a no-op.
        let again = desk.approve(&image_id, None).await.unwrap();
        assert!(!again.changed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reject_can_overturn_approval() {
        let (_dir, db) = temp_db().await;
        let (project, _) = project_with_character(&db, "mira").await;
        let image_id = db
            .insert_image(&NewImage::pending(
                &project.id,
                "mira",
                "002.png",
                GenerationParams::new("base-v1", "euler", 30),
            ))
            .await
            .unwrap();
        let desk = ReviewDesk::new(db.clone(), Arc::new(EventBus::default()));

        desk.approve(&image_id, None).await.unwrap();
        let outcome = desk.reject(&image_id, Some("extra fingers")).await.unwrap();
        assert_eq!(outcome.previous, ReviewStatus::Approved);

        let counts = db.image_counts(&project.id, "mira").await.unwrap();
        assert_eq!(counts.approved, 0);
        assert_eq!(counts.rejected, 1);

        assert!(matches!(
            desk.reject("missing", None).await,
            Err(ReviewError::UnknownImage(_))
        ));
    }
}
