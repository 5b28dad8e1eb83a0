//! Operator actions on shots.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::events::PipelineEvent;
use crate::storage::{Shot, ShotStatus};

use super::{Production, ProductionError};

/// Result of queueing a whole scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueReport {
    pub scene_id: String,
    /// Shots moved from draft to pending.
    pub queued: Vec<String>,
    /// Shots left alone because they were not drafts.
    pub skipped: usize,
}

impl Production {
    /// Moves a draft shot to pending so the dispatcher picks it up.
    pub async fn queue(&self, shot_id: &str) -> Result<Shot, ProductionError> {
        self.move_shot(shot_id, &[ShotStatus::Draft], ShotStatus::Pending, None, "queue")
            .await
    }

    /// Queues every draft shot of a scene.
    pub async fn queue_scene(&self, scene_id: &str) -> Result<QueueReport, ProductionError> {
        if self.db.get_scene(scene_id).await?.is_none() {
            return Err(ProductionError::UnknownScene(scene_id.to_string()));
        }

        let mut report = QueueReport {
            scene_id: scene_id.to_string(),
            ..Default::default()
        };
        for shot in self.db.list_shots(scene_id).await? {
            let moved = shot.status == ShotStatus::Draft
                && self
                    .db
                    .transition_shot(&shot.id, &[ShotStatus::Draft], ShotStatus::Pending, None)
                    .await?;
            if moved {
                report.queued.push(shot.id);
            } else {
                report.skipped += 1;
            }
        }

        info!(
            scene_id = scene_id,
            queued = report.queued.len(),
            skipped = report.skipped,
            "Queued scene shots"
        );
        Ok(report)
    }

    /// Resets a failed shot to pending. The only way out of `failed`.
    pub async fn retry(&self, shot_id: &str) -> Result<Shot, ProductionError> {
        self.move_shot(shot_id, &[ShotStatus::Failed], ShotStatus::Pending, None, "retry")
            .await
    }

    /// Fails a pending or generating shot with `reason`.
    ///
    /// The shot stops counting as in flight once this returns.
    pub async fn cancel(&self, shot_id: &str, reason: &str) -> Result<Shot, ProductionError> {
        let shot = self
            .move_shot(
                shot_id,
                &[ShotStatus::Pending, ShotStatus::Generating],
                ShotStatus::Failed,
                Some(reason),
                "cancel",
            )
            .await?;

        self.metrics.record_job_outcome("shot", "cancelled");
        self.bus
            .publish(PipelineEvent::ShotFailed {
                shot_id: shot.id.clone(),
                scene_id: shot.scene_id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(shot)
    }

    async fn move_shot(
        &self,
        shot_id: &str,
        from: &[ShotStatus],
        to: ShotStatus,
        reason: Option<&str>,
        action: &'static str,
    ) -> Result<Shot, ProductionError> {
        let moved = self.db.transition_shot(shot_id, from, to, reason).await?;
        let shot = self
            .db
            .get_shot(shot_id)
            .await?
            .ok_or_else(|| ProductionError::UnknownShot(shot_id.to_string()))?;

        if !moved {
            warn!(
                shot_id = shot_id,
                status = %shot.status,
                action = action,
                "Shot action rejected"
            );
            return Err(ProductionError::InvalidShotState {
                shot_id: shot_id.to_string(),
                status: shot.status,
                action,
            });
        }

        info!(
            shot_id = shot_id,
            scene_id = %shot.scene_id,
            to = %to,
            action = action,
            reason = reason.unwrap_or(""),
            "Shot transitioned"
        );
        Ok(shot)
    }
}
