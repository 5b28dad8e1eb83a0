//! End-to-end tests of the control plane against a real SQLite file and
//! in-memory external services.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tempfile::TempDir;

use reelforge::analytics::DriftAssessment;
use reelforge::backend::{
    AssembledVideo, BackendStatus, Clip, GenerationBackend, GenerationRequest, MediaServer,
    VideoAssembler,
};
use reelforge::pipeline::{AppConfig, EntityState};
use reelforge::production::ProductionError;
use reelforge::replenish::Decision;
use reelforge::storage::{
    Character, Database, EntityType, EpisodeStatus, GenerationParams, NewCharacter, NewImage,
    NewShot, PhaseStatus, Project, ReviewStatus, SceneStatus, ShotStatus, Transition,
};
use reelforge::{BackendError, ControlPlane, Services};

/// Accepts nothing: every submit is refused.
struct RefusingBackend;

#[async_trait]
impl GenerationBackend for RefusingBackend {
    async fn submit(&self, _request: &GenerationRequest) -> Result<String, BackendError> {
        Err(BackendError::Status {
            service: "generation backend",
            status: 503,
            body: "queue full".to_string(),
        })
    }

    async fn poll(&self, _handle: &str) -> Result<BackendStatus, BackendError> {
        Ok(BackendStatus::Queued)
    }
}

/// Writes a placeholder file and records the clips it was given.
#[derive(Default)]
struct FileAssembler {
    calls: Mutex<Vec<Vec<Clip>>>,
}

#[async_trait]
impl VideoAssembler for FileAssembler {
    async fn assemble(&self, clips: &[Clip], output: &Path) -> Result<AssembledVideo, BackendError> {
        if clips.is_empty() {
            return Err(BackendError::NoInputs);
        }
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, format!("{} clips", clips.len())).await?;
        self.calls.lock().unwrap().push(clips.to_vec());
        Ok(AssembledVideo {
            path: output.display().to_string(),
            duration_seconds: clips.iter().map(|c| c.duration_seconds).sum(),
        })
    }
}

#[derive(Default)]
struct RecordingMedia {
    registered: Mutex<Vec<String>>,
}

#[async_trait]
impl MediaServer for RecordingMedia {
    async fn register(&self, path: &str, _title: &str) -> Result<String, BackendError> {
        self.registered.lock().unwrap().push(path.to_string());
        Ok("media-1".to_string())
    }
}

struct Harness {
    _dir: TempDir,
    plane: ControlPlane,
    assembler: Arc<FileAssembler>,
    media: Arc<RecordingMedia>,
}

async fn harness(config: AppConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("reelforge.db").to_str().unwrap())
        .await
        .unwrap();
    db.run_migrations().await.unwrap();

    let assembler = Arc::new(FileAssembler::default());
    let media = Arc::new(RecordingMedia::default());
    let services = Services {
        backend: Arc::new(RefusingBackend),
        scorer: None,
        assembler: assembler.clone(),
        media: media.clone(),
    };
    let config = config.with_output_dir(dir.path().join("out"));
    Harness {
        plane: ControlPlane::new(db, config, services),
        _dir: dir,
        assembler,
        media,
    }
}

async fn character(db: &Database, slug: &str, target: u32) -> (Project, Character) {
    let project = db
        .create_project("Harbor Lights", Some("base-v1"), "{{ design_prompt }}, portrait", None)
        .await
        .unwrap();
    let character = db
        .create_character(
            &NewCharacter::new(&project.id, slug, "Mira")
                .with_design_prompt("red coat, silver hair")
                .with_target(target),
        )
        .await
        .unwrap();
    (project, character)
}

async fn add_images(
    db: &Database,
    project_id: &str,
    slug: &str,
    status: ReviewStatus,
    count: usize,
) -> Vec<String> {
    let mut ids = Vec::new();
    for i in 0..count {
        let image = NewImage::pending(
            project_id,
            slug,
            format!("{}-{}.png", status, i),
            GenerationParams::new("base-v1", "euler", 30),
        );
        let image = if status == ReviewStatus::Pending {
            image
        } else {
            image.reviewed(status, Utc::now())
        };
        ids.push(db.insert_image(&image).await.unwrap());
    }
    ids
}

#[tokio::test]
async fn test_replenishment_closes_the_gap_in_one_batch() {
    let h = harness(AppConfig::default().with_max_batch_size(5)).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 15).await;
    add_images(db, &project.id, "mira", ReviewStatus::Approved, 10).await;
    add_images(db, &project.id, "mira", ReviewStatus::Pending, 2).await;

    // Toggling off and on again with nothing in between changes nothing.
    let before = h.plane.replenisher.plan().await.unwrap();
    h.plane.replenisher.toggle(false, None).await.unwrap();
    assert!(h.plane.replenisher.tick().await.unwrap().disabled);
    h.plane.replenisher.toggle(true, None).await.unwrap();
    let after = h.plane.replenisher.plan().await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after[0].decision, Decision::Enqueue { batch_size: 3 });

    let report = h.plane.replenisher.tick().await.unwrap();
    assert_eq!(report.enqueued.len(), 1);
    let job = &report.enqueued[0];
    assert_eq!(job.batch_size, 3);
    assert_eq!(job.character_slug, "mira");
    assert_eq!(job.prompt, "red coat, silver hair, portrait");

    // The batch now counts as in flight.
    let report = h.plane.replenisher.tick().await.unwrap();
    assert!(report.enqueued.is_empty());
}

#[tokio::test]
async fn test_drift_alert_on_recent_quality_drop() {
    let h = harness(AppConfig::default().with_drift(5, 0.15, 5)).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 40).await;

    let start = Utc::now() - ChronoDuration::hours(1);
    for i in 0..20 {
        let score = if i < 15 { 0.9 } else { 0.3 };
        let image = NewImage::pending(
            &project.id,
            "mira",
            format!("{:03}.png", i),
            GenerationParams::new("base-v1", "euler", 30),
        )
        .with_score(score)
        .reviewed(ReviewStatus::Approved, start + ChronoDuration::seconds(i));
        db.insert_image(&image).await.unwrap();
    }

    match h.plane.analytics.drift_alert(&project.id, "mira").await.unwrap() {
        DriftAssessment::Measured(alert) => {
            assert!(alert.alert);
            assert!((alert.recent_avg - 0.30).abs() < 1e-9);
            assert!((alert.overall_avg - 0.75).abs() < 1e-9);
            assert!((alert.drift + 0.45).abs() < 1e-9);
        }
        other => panic!("expected a measurement, got {:?}", other),
    }
}

#[tokio::test]
async fn test_drift_never_fires_below_sample_floor() {
    let h = harness(AppConfig::default().with_drift(5, 0.15, 5)).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 40).await;

    for (i, score) in [1.0, 1.0, 0.0, 0.0].into_iter().enumerate() {
        let image = NewImage::pending(
            &project.id,
            "mira",
            format!("{}.png", i),
            GenerationParams::new("base-v1", "euler", 30),
        )
        .with_score(score)
        .reviewed(ReviewStatus::Rejected, Utc::now());
        db.insert_image(&image).await.unwrap();
    }

    let assessment = h.plane.analytics.drift_alert(&project.id, "mira").await.unwrap();
    assert!(!assessment.is_alert());
    assert!(matches!(
        assessment,
        DriftAssessment::InsufficientHistory {
            samples: 4,
            required: 5
        }
    ));

    // Approval rate is zero, not NaN, for a character without images.
    db.create_character(&NewCharacter::new(&project.id, "theo", "Theo"))
        .await
        .unwrap();
    let stats = h.plane.analytics.dataset_stats(Some(&project.id)).await.unwrap();
    let theo = stats.iter().find(|s| s.character_slug == "theo").unwrap();
    assert_eq!(theo.total, 0);
    assert_eq!(theo.approval_rate, 0.0);
}

#[tokio::test]
async fn test_partial_episode_assembly_and_publish() {
    let h = harness(AppConfig::default()).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 40).await;

    let mut scene_ids = Vec::new();
    for title in ["Arrival", "Storm", "Departure"] {
        scene_ids.push(db.create_scene(&project.id, title, Some(12.0)).await.unwrap().id);
    }
    db.record_scene_assembly(&scene_ids[0], "/renders/scenes/1.mp4", 12.0, 3)
        .await
        .unwrap();
    db.record_scene_assembly(&scene_ids[2], "/renders/scenes/3.mp4", 10.0, 2)
        .await
        .unwrap();

    let episode = db.create_episode(&project.id, "Pilot").await.unwrap();
    for (i, scene_id) in scene_ids.iter().enumerate() {
        db.set_episode_scene(&episode.id, scene_id, i as u32 + 1, Transition::cut())
            .await
            .unwrap();
    }

    let assembly = h.plane.production.assemble_episode(&episode.id).await.unwrap();
    assert_eq!(assembly.scenes_included, vec![scene_ids[0].clone(), scene_ids[2].clone()]);
    assert_eq!(assembly.scenes_missing, vec![scene_ids[1].clone()]);
    assert!(assembly.is_partial());
    assert!((assembly.duration_seconds - 22.0).abs() < 1e-9);
    assert!(Path::new(&assembly.final_video_path).exists());
    assert_eq!(h.assembler.calls.lock().unwrap()[0].len(), 2);

    // Re-running overwrites the same artifact.
    let again = h.plane.production.assemble_episode(&episode.id).await.unwrap();
    assert_eq!(again.final_video_path, assembly.final_video_path);

    let published = h.plane.production.publish_episode(&episode.id).await.unwrap();
    assert_eq!(published.status, EpisodeStatus::Published);
    assert_eq!(h.media.registered.lock().unwrap().len(), 1);
    assert!(matches!(
        h.plane.production.publish_episode(&episode.id).await,
        Err(ProductionError::NotAssembled { .. })
    ));
}

#[tokio::test]
async fn test_orchestrator_advances_when_target_reached() {
    let h = harness(AppConfig::default()).await;
    let db = &h.plane.db;
    let orchestrator = &h.plane.orchestrator;
    let (project, character) = character(db, "mira", 3).await;
    add_images(db, &project.id, "mira", ReviewStatus::Approved, 2).await;
    let pending = add_images(db, &project.id, "mira", ReviewStatus::Pending, 2).await;

    orchestrator
        .initialize(EntityType::Character, &character.id)
        .await
        .unwrap();
    let tick = orchestrator
        .tick_entity(EntityType::Character, &character.id)
        .await
        .unwrap();
    assert!(tick.moves.is_empty());
    assert!(matches!(tick.state, EntityState::Waiting { ref phase, .. } if phase == "image_generation"));

    // The third approval lands between ticks.
    assert!(db
        .set_review_status(&pending[0], ReviewStatus::Pending, ReviewStatus::Approved, None)
        .await
        .unwrap());

    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.moves(), 2);
    let pipeline = orchestrator
        .pipeline(EntityType::Character, &character.id)
        .await
        .unwrap();
    assert_eq!(pipeline.active_phase(), Some("review"));
    assert_eq!(pipeline.phases[0].status, PhaseStatus::Completed);
    assert_eq!(
        pipeline
            .phases
            .iter()
            .filter(|p| p.status == PhaseStatus::Active)
            .count(),
        1
    );

    // A second tick with nothing new is a no-op.
    let report = orchestrator.tick().await.unwrap();
    assert_eq!(report.moves(), 0);
    assert_eq!(
        orchestrator
            .pipeline(EntityType::Character, &character.id)
            .await
            .unwrap(),
        pipeline
    );
}

#[tokio::test]
async fn test_failed_shot_waits_for_explicit_retry() {
    let h = harness(AppConfig::default()).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 1).await;
    let scene = db.create_scene(&project.id, "Storm", None).await.unwrap();
    let shot = db
        .add_shot(&scene.id, &NewShot::new(1, "waves crash over the bow", 4.0))
        .await
        .unwrap();

    h.plane.production.queue(&shot.id).await.unwrap();
    let report = h.plane.dispatcher.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = db.get_shot(&shot.id).await.unwrap().unwrap();
    assert_eq!(failed.status, ShotStatus::Failed);
    assert!(failed.error_message.unwrap().starts_with("submit failed"));
    assert_eq!(
        h.plane.production.scene_status(&scene.id).await.unwrap().status,
        SceneStatus::Failed
    );

    // No loop picks a failed shot back up.
    for _ in 0..2 {
        h.plane.dispatcher.tick().await.unwrap();
        h.plane.orchestrator.tick().await.unwrap();
        h.plane.replenisher.tick().await.unwrap();
    }
    assert_eq!(
        db.get_shot(&shot.id).await.unwrap().unwrap().status,
        ShotStatus::Failed
    );

    let retried = h.plane.production.retry(&shot.id).await.unwrap();
    assert_eq!(retried.status, ShotStatus::Pending);
    assert_eq!(retried.error_message, None);
}

#[tokio::test]
async fn test_review_event_reaches_replenisher() {
    let h = harness(AppConfig::default().with_max_batch_size(5)).await;
    let db = &h.plane.db;
    let (project, _) = character(db, "mira", 2).await;
    let pending = add_images(db, &project.id, "mira", ReviewStatus::Pending, 2).await;

    // Nothing missing while both candidates await review.
    assert_eq!(
        h.plane.replenisher.plan().await.unwrap()[0].decision,
        Decision::Satisfied
    );

    // A rejection opens a gap and the handler enqueues immediately.
    let outcome = h.plane.review.reject(&pending[0], Some("wrong coat")).await.unwrap();
    assert!(outcome.changed);
    let jobs = db
        .jobs_with_status(reelforge::storage::JobStatus::Pending, 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].batch_size, 1);
}
