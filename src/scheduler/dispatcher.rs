//! Job dispatch to the generation backend.
//!
//! One tick submits pending image jobs and pending shots, polls everything
//! that is generating and scores a bounded number of new images. Every move
//! is a compare-and-set on the stored status; a row that lost its race is
//! skipped. Nothing is ever retried: a failure is recorded with its reason
//! and left for an operator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{BackendStatus, GenerationBackend, GenerationRequest, QualityScorer};
use crate::events::{EventBus, PipelineEvent};
use crate::metrics::MetricsCollector;
use crate::storage::{
    Database, DatabaseError, GenerationJob, JobStatus, NewImage, Shot, ShotStatus,
};

/// Reason recorded on rows whose backend handle is gone.
pub const HANDLE_LOST: &str = "backend handle lost";

/// Dispatcher limits.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    /// Rows of each kind handled per tick.
    pub batch_limit: u32,
    /// Images scored per tick.
    pub scoring_limit: u32,
    /// Failed scoring attempts after which an image is left unscored.
    pub score_max_attempts: u32,
    /// A generating row without a handle older than this is treated as lost.
    pub handle_grace: Duration,
    /// Directory relative image file names resolve against.
    pub image_root: PathBuf,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: 20,
            scoring_limit: 5,
            score_max_attempts: 3,
            handle_grace: Duration::from_secs(120),
            image_root: PathBuf::from("output/images"),
        }
    }
}

/// Counts from one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub submitted: usize,
    pub completed: usize,
    pub failed: usize,
    pub lost: usize,
    pub running: usize,
    pub scored: usize,
    pub score_errors: usize,
    /// Handles returned for rows that left `generating` before the handle
    /// was stored.
    pub orphaned: usize,
}

pub struct Dispatcher {
    db: Database,
    backend: Arc<dyn GenerationBackend>,
    scorer: Option<Arc<dyn QualityScorer>>,
    bus: Arc<EventBus>,
    config: DispatchConfig,
    metrics: MetricsCollector,
}

impl Dispatcher {
    pub fn new(
        db: Database,
        backend: Arc<dyn GenerationBackend>,
        bus: Arc<EventBus>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            db,
            backend,
            scorer: None,
            bus,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub async fn tick(&self) -> Result<DispatchReport, DatabaseError> {
        let started = Instant::now();
        let mut report = DispatchReport::default();

        self.submit_jobs(&mut report).await?;
        self.submit_shots(&mut report).await?;
        self.poll_jobs(&mut report).await?;
        self.poll_shots(&mut report).await?;
        self.score_images(&mut report).await?;

        let in_flight_jobs = self.db.jobs_with_status(JobStatus::Generating, u32::MAX).await?;
        let in_flight_shots = self.db.shots_with_status(ShotStatus::Generating, u32::MAX).await?;
        self.metrics.set_in_flight("image_job", in_flight_jobs.len());
        self.metrics.set_in_flight("shot", in_flight_shots.len());
        self.metrics
            .observe_tick("dispatcher", started.elapsed().as_secs_f64());

        if report != DispatchReport::default() {
            info!(
                submitted = report.submitted,
                completed = report.completed,
                failed = report.failed,
                lost = report.lost,
                orphaned = report.orphaned,
                running = report.running,
                scored = report.scored,
                score_errors = report.score_errors,
                "Dispatcher tick"
            );
        }
        Ok(report)
    }

    // =========================================================================
    // Image jobs
    // =========================================================================

    async fn submit_jobs(&self, report: &mut DispatchReport) -> Result<(), DatabaseError> {
        for job in self
            .db
            .jobs_with_status(JobStatus::Pending, self.config.batch_limit)
            .await?
        {
            if !self.db.claim_job(&job.id).await? {
                debug!(job_id = %job.id, "Job claimed elsewhere");
                continue;
            }

            match self.backend.submit(&GenerationRequest::for_job(&job)).await {
                Ok(handle) => {
                    if !self.db.set_job_handle(&job.id, &handle).await? {
                        report.orphaned += 1;
                        warn!(
                            job_id = %job.id,
                            character = %job.character_slug,
                            handle = %handle,
                            "Job left generating before its handle was stored; backend job orphaned"
                        );
                        continue;
                    }
                    report.submitted += 1;
                    info!(
                        job_id = %job.id,
                        character = %job.character_slug,
                        batch_size = job.batch_size,
                        handle = %handle,
                        "Job submitted"
                    );
                }
                Err(e) => {
                    if self.fail_job(&job, &format!("submit failed: {}", e)).await? {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn poll_jobs(&self, report: &mut DispatchReport) -> Result<(), DatabaseError> {
        for job in self
            .db
            .jobs_with_status(JobStatus::Generating, self.config.batch_limit)
            .await?
        {
            let Some(handle) = job.backend_handle.clone() else {
                if self.past_grace(job.updated_at) && self.fail_job(&job, HANDLE_LOST).await? {
                    report.lost += 1;
                }
                continue;
            };

            match self.backend.poll(&handle).await {
                Ok(BackendStatus::Queued) | Ok(BackendStatus::Running) => report.running += 1,
                Ok(BackendStatus::Completed { outputs, seed, .. }) => {
                    self.complete_job(&job, outputs, seed, report).await?;
                }
                Ok(BackendStatus::Failed { reason }) => {
                    if self.fail_job(&job, &reason).await? {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    if self.fail_job(&job, &format!("poll failed: {}", e)).await? {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job: &GenerationJob,
        outputs: Vec<String>,
        seed: Option<i64>,
        report: &mut DispatchReport,
    ) -> Result<(), DatabaseError> {
        let images: Vec<NewImage> = outputs
            .iter()
            .enumerate()
            .map(|(i, filename)| {
                let mut params = job.params.clone();
                if let Some(seed) = seed {
                    params.seed = Some(seed + i as i64);
                }
                NewImage::pending(&job.project_id, &job.character_slug, filename, params)
                    .with_job(&job.id)
            })
            .collect();

        if !self.db.complete_job(&job.id, &images).await? {
            debug!(job_id = %job.id, "Job left generating before completion was recorded");
            return Ok(());
        }

        report.completed += 1;
        self.metrics.record_job_outcome("image_job", "completed");
        info!(
            job_id = %job.id,
            character = %job.character_slug,
            images = images.len(),
            "Job completed"
        );
        self.bus
            .publish(PipelineEvent::JobCompleted {
                job_id: job.id.clone(),
                project_id: job.project_id.clone(),
                character_slug: job.character_slug.clone(),
                images: images.len() as u32,
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Returns whether this call recorded the failure.
    async fn fail_job(&self, job: &GenerationJob, reason: &str) -> Result<bool, DatabaseError> {
        if !self.db.fail_job(&job.id, reason).await? {
            return Ok(false);
        }

        self.metrics.record_job_outcome("image_job", "failed");
        warn!(
            job_id = %job.id,
            character = %job.character_slug,
            reason = reason,
            "Job failed"
        );
        self.bus
            .publish(PipelineEvent::JobFailed {
                job_id: job.id.clone(),
                project_id: job.project_id.clone(),
                character_slug: job.character_slug.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    // =========================================================================
    // Shots
    // =========================================================================

    async fn submit_shots(&self, report: &mut DispatchReport) -> Result<(), DatabaseError> {
        for shot in self
            .db
            .shots_with_status(ShotStatus::Pending, self.config.batch_limit)
            .await?
        {
            if !self
                .db
                .transition_shot(&shot.id, &[ShotStatus::Pending], ShotStatus::Generating, None)
                .await?
            {
                continue;
            }

            match self.backend.submit(&GenerationRequest::for_shot(&shot)).await {
                Ok(handle) => {
                    if !self.db.set_shot_handle(&shot.id, &handle).await? {
                        report.orphaned += 1;
                        warn!(
                            shot_id = %shot.id,
                            scene_id = %shot.scene_id,
                            handle = %handle,
                            "Shot left generating before its handle was stored; backend job orphaned"
                        );
                        continue;
                    }
                    report.submitted += 1;
                    info!(
                        shot_id = %shot.id,
                        scene_id = %shot.scene_id,
                        handle = %handle,
                        "Shot submitted"
                    );
                }
                Err(e) => {
                    if self.fail_shot(&shot, &format!("submit failed: {}", e)).await? {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn poll_shots(&self, report: &mut DispatchReport) -> Result<(), DatabaseError> {
        for shot in self
            .db
            .shots_with_status(ShotStatus::Generating, self.config.batch_limit)
            .await?
        {
            let Some(handle) = shot.backend_handle.clone() else {
                if self.past_grace(shot.updated_at) && self.fail_shot(&shot, HANDLE_LOST).await? {
                    report.lost += 1;
                }
                continue;
            };

            match self.backend.poll(&handle).await {
                Ok(BackendStatus::Queued) | Ok(BackendStatus::Running) => report.running += 1,
                Ok(BackendStatus::Completed {
                    outputs,
                    generation_time_seconds,
                    ..
                }) => match outputs.first() {
                    Some(path) => {
                        if self
                            .db
                            .complete_shot(&shot.id, path, generation_time_seconds, None)
                            .await?
                        {
                            report.completed += 1;
                            self.metrics.record_job_outcome("shot", "completed");
                            info!(shot_id = %shot.id, scene_id = %shot.scene_id, output = %path, "Shot completed");
                            self.bus
                                .publish(PipelineEvent::ShotCompleted {
                                    shot_id: shot.id.clone(),
                                    scene_id: shot.scene_id.clone(),
                                    output_path: path.clone(),
                                    timestamp: Utc::now(),
                                })
                                .await;
                        }
                    }
                    None => {
                        if self.fail_shot(&shot, "backend returned no output").await? {
                            report.failed += 1;
                        }
                    }
                },
                Ok(BackendStatus::Failed { reason }) => {
                    if self.fail_shot(&shot, &reason).await? {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    if self.fail_shot(&shot, &format!("poll failed: {}", e)).await? {
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn fail_shot(&self, shot: &Shot, reason: &str) -> Result<bool, DatabaseError> {
        if !self
            .db
            .transition_shot(&shot.id, &[ShotStatus::Generating], ShotStatus::Failed, Some(reason))
            .await?
        {
            return Ok(false);
        }

        self.metrics.record_job_outcome("shot", "failed");
        warn!(
            shot_id = %shot.id,
            scene_id = %shot.scene_id,
            reason = reason,
            "Shot failed"
        );
        self.bus
            .publish(PipelineEvent::ShotFailed {
                shot_id: shot.id.clone(),
                scene_id: shot.scene_id.clone(),
                reason: reason.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        Ok(true)
    }

    // =========================================================================
    // Scoring
    // =========================================================================

    async fn score_images(&self, report: &mut DispatchReport) -> Result<(), DatabaseError> {
        let Some(scorer) = self.scorer.as_ref() else {
            return Ok(());
        };

        for image in self
            .db
            .unscored_images(self.config.scoring_limit, self.config.score_max_attempts)
            .await?
        {
            let description = self
                .db
                .get_character(&image.project_id, &image.character_slug)
                .await?
                .map(|c| {
                    if c.design_prompt.is_empty() {
                        c.name
                    } else {
                        c.design_prompt
                    }
                })
                .unwrap_or_else(|| image.character_slug.clone());
            let path = self.config.image_root.join(&image.filename);

            match scorer.score(&path, &description).await {
                Ok(verdict) => {
                    if self
                        .db
                        .set_image_score(
                            &image.id,
                            verdict.score,
                            &verdict.issues,
                            verdict.caption.as_deref(),
                        )
                        .await?
                    {
                        report.scored += 1;
                        self.metrics.record_quality_score(verdict.score);
                    }
                }
                Err(e) => {
                    report.score_errors += 1;
                    let attempts = self.db.record_score_failure(&image.id, &e.to_string()).await?;
                    match attempts {
                        Some(n) if n >= self.config.score_max_attempts => warn!(
                            image_id = %image.id,
                            path = %path.display(),
                            attempts = n,
                            error = %e,
                            "Scoring failed; giving up on image"
                        ),
                        _ => warn!(
                            image_id = %image.id,
                            path = %path.display(),
                            attempts = attempts.unwrap_or_default(),
                            error = %e,
                            "Scoring failed"
                        ),
                    }
                }
            }
        }
        Ok(())
    }

    fn past_grace(&self, updated_at: chrono::DateTime<Utc>) -> bool {
        let age = Utc::now().signed_duration_since(updated_at);
        age.to_std().is_ok_and(|age| age >= self.config.handle_grace)
    }
}
