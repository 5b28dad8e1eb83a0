//! Drift monitor wired to review events.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::events::{EventBus, EventError, EventHandler, EventKind, PipelineEvent};
use crate::metrics::MetricsCollector;

use super::{Analytics, AnalyticsError, DriftAssessment};

/// Recomputes drift after every review decision and publishes
/// `DriftDetected` when a character crosses into the alert state.
pub struct DriftMonitor {
    analytics: Analytics,
    bus: Weak<EventBus>,
    metrics: MetricsCollector,
}

impl DriftMonitor {
    /// Event kinds the monitor should be registered for.
    pub const KINDS: [EventKind; 2] = [EventKind::ImageApproved, EventKind::ImageRejected];

    pub fn new(analytics: Analytics, bus: &Arc<EventBus>) -> Self {
        Self {
            analytics,
            bus: Arc::downgrade(bus),
            metrics: MetricsCollector::new(),
        }
    }

    /// Checks one character and publishes an alert on a fresh crossing.
    ///
    /// Returns the current assessment.
    pub async fn check(
        &self,
        project_id: &str,
        character_slug: &str,
    ) -> Result<DriftAssessment, AnalyticsError> {
        let mut points = self
            .analytics
            .drift_history(project_id, character_slug, 2)
            .await?
            .into_iter();
        let current = points.next().unwrap_or(DriftAssessment::InsufficientHistory {
            samples: 0,
            required: self.analytics.drift_config().min_recent_samples,
        });
        let previously_alerting = points.next().is_some_and(|p| p.is_alert());

        let DriftAssessment::Measured(alert) = &current else {
            debug!(
                project_id = project_id,
                character = character_slug,
                "Drift check skipped: insufficient history"
            );
            return Ok(current);
        };

        self.metrics.set_drift(character_slug, alert.drift);
        if alert.alert && !previously_alerting {
            warn!(
                project_id = project_id,
                character = character_slug,
                recent_avg = alert.recent_avg,
                overall_avg = alert.overall_avg,
                drift = alert.drift,
                "Quality drift detected"
            );
            self.metrics.record_drift_alert(character_slug);

            if let Some(bus) = self.bus.upgrade() {
                bus.publish(PipelineEvent::DriftDetected {
                    project_id: project_id.to_string(),
                    character_slug: character_slug.to_string(),
                    recent_avg: alert.recent_avg,
                    overall_avg: alert.overall_avg,
                    drift: alert.drift,
                    timestamp: Utc::now(),
                })
                .await;
            }
        }

        Ok(current)
    }
}

#[async_trait]
impl EventHandler for DriftMonitor {
    fn name(&self) -> &str {
        "drift-monitor"
    }

    async fn handle(&self, event: &PipelineEvent) -> Result<(), EventError> {
        let Some((project_id, character_slug)) = event.character() else {
            return Ok(());
        };
        self.check(project_id, character_slug)
            .await
            .map(|_| ())
            .map_err(|e| EventError::handler(self.name(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::DriftConfig;
    use crate::storage::database::test_support::*;
    use crate::storage::{GenerationParams, NewImage, ReviewStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_crossing_publishes_once() {
        let (_dir, db) = temp_db().await;
        let (project, character) = project_with_character(&db, "mira").await;
        let start = Utc::now() - Duration::hours(1);

        let reviewed = |i: i64, score: f64| {
            let at = start + Duration::seconds(i);
            NewImage::pending(
                &project.id,
                &character.slug,
                format!("{}.png", i),
                GenerationParams::new("base-v1", "euler", 30),
            )
            .with_score(score)
            .created_at(at)
            .reviewed(ReviewStatus::Approved, at)
        };
        for i in 0..10 {
            db.insert_image(&reviewed(i, 0.9)).await.unwrap();
        }

        let bus = Arc::new(EventBus::new(16));
        let mut rx = bus.subscribe();
        let analytics = Analytics::new(db.clone()).with_drift_config(DriftConfig {
            window: 5,
            threshold: 0.15,
            min_recent_samples: 5,
        });
        let monitor = DriftMonitor::new(analytics, &bus);

        assert!(!monitor.check(&project.id, "mira").await.unwrap().is_alert());

        // Low scores arrive one review at a time; the alert crosses once.
        let mut last = None;
        for i in 10..14 {
            db.insert_image(&reviewed(i, 0.1)).await.unwrap();
            last = Some(monitor.check(&project.id, "mira").await.unwrap());
        }
        assert!(last.unwrap().is_alert());

        let mut published = 0;
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.kind(), EventKind::DriftDetected);
            published += 1;
        }
        assert_eq!(published, 1);
    }
}
