//! Assembly of the shared control plane.
//!
//! One database, one event bus and one set of external services feed every
//! loop and every operator command. Handlers are registered here so the
//! drift monitor sees a review before the orchestrator and the replenisher
//! react to it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::analytics::{Analytics, DriftMonitor};
use crate::backend::{
    FfmpegAssembler, GenerationBackend, HttpGenerationBackend, HttpMediaServer, MediaServer,
    QualityScorer, UnconfiguredMediaServer, VideoAssembler, VisionScorer,
};
use crate::error::{BackendError, LlmError};
use crate::events::{EventBus, EventKind};
use crate::llm::{ChatClient, LlmProvider};
use crate::pipeline::{AppConfig, PipelineOrchestrator};
use crate::production::Production;
use crate::replenish::Replenisher;
use crate::review::ReviewDesk;
use crate::scheduler::{Dispatcher, PeriodicTask};
use crate::storage::{Database, DatabaseError};
use crate::training::TrainingHandoff;

/// Observer channel capacity of the process-wide bus.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Backend setup failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Scorer setup failed: {0}")]
    Llm(#[from] LlmError),
}

/// The external collaborators the control plane talks to.
#[derive(Clone)]
pub struct Services {
    pub backend: Arc<dyn GenerationBackend>,
    pub scorer: Option<Arc<dyn QualityScorer>>,
    pub assembler: Arc<dyn VideoAssembler>,
    pub media: Arc<dyn MediaServer>,
}

impl Services {
    /// Builds the HTTP, LLM and ffmpeg adapters described by `config`.
    pub fn from_config(config: &AppConfig) -> Result<Self, SetupError> {
        let backend = HttpGenerationBackend::new(&config.backend_url, config.request_timeout)?;

        let scorer: Option<Arc<dyn QualityScorer>> = if config.scoring_enabled {
            let client = ChatClient::new(
                &config.llm_api_base,
                config.llm_api_key.clone(),
                &config.scorer_model,
                config.request_timeout,
            )?;
            let provider: Arc<dyn LlmProvider> = Arc::new(client);
            Some(Arc::new(VisionScorer::new(provider, &config.scorer_model)))
        } else {
            None
        };

        let media: Arc<dyn MediaServer> = match config.media_url {
            Some(ref url) => Arc::new(HttpMediaServer::new(
                url,
                config.media_api_key.clone(),
                config.request_timeout,
            )?),
            None => Arc::new(UnconfiguredMediaServer),
        };

        Ok(Self {
            backend: Arc::new(backend),
            scorer,
            assembler: Arc::new(FfmpegAssembler::new(&config.ffmpeg_binary, config.frame_rate)),
            media,
        })
    }
}

/// Every component, wired to one database and one bus.
pub struct ControlPlane {
    pub config: AppConfig,
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub analytics: Analytics,
    pub drift_monitor: Arc<DriftMonitor>,
    pub orchestrator: Arc<PipelineOrchestrator>,
    pub replenisher: Arc<Replenisher>,
    pub dispatcher: Arc<Dispatcher>,
    pub production: Production,
    pub review: ReviewDesk,
    pub training: TrainingHandoff,
}

impl ControlPlane {
    /// Opens the database, runs migrations and wires real services.
    pub async fn open(config: AppConfig) -> Result<Self, SetupError> {
        let db = Database::open(&config.database_path).await?;
        db.run_migrations().await?;
        let services = Services::from_config(&config)?;
        Ok(Self::new(db, config, services))
    }

    /// Wires the components and registers their event handlers.
    pub fn new(db: Database, config: AppConfig, services: Services) -> Self {
        let bus = Arc::new(EventBus::new(EVENT_CAPACITY));
        let analytics = Analytics::new(db.clone()).with_drift_config(config.drift_config());

        let replenisher = Arc::new(Replenisher::new(
            db.clone(),
            analytics.clone(),
            config.replenish_config(),
        ));
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            db.clone(),
            analytics.clone(),
            replenisher.settings().clone(),
            config.orchestrator_config(),
        ));
        let drift_monitor = Arc::new(DriftMonitor::new(analytics.clone(), &bus));

        bus.register_all(&DriftMonitor::KINDS, drift_monitor.clone());
        bus.register_all(&PipelineOrchestrator::event_kinds(), orchestrator.clone());
        bus.register_all(&EventKind::REVIEW_AND_JOBS, replenisher.clone());

        let mut dispatcher = Dispatcher::new(
            db.clone(),
            services.backend,
            Arc::clone(&bus),
            config.dispatch_config(),
        );
        if let Some(scorer) = services.scorer {
            dispatcher = dispatcher.with_scorer(scorer);
        }

        let production = Production::new(
            db.clone(),
            Arc::clone(&bus),
            services.assembler,
            services.media,
            &config.output_dir,
        );
        let review = ReviewDesk::new(db.clone(), Arc::clone(&bus));
        let training = TrainingHandoff::new(db.clone(), Arc::clone(&bus), &config.output_dir);

        info!(
            database = %config.database_path,
            output_dir = %config.output_dir.display(),
            "Control plane ready"
        );

        Self {
            config,
            db,
            bus,
            analytics,
            drift_monitor,
            orchestrator,
            replenisher,
            dispatcher: Arc::new(dispatcher),
            production,
            review,
            training,
        }
    }

    /// The periodic loops and their intervals, for [`crate::scheduler::LoopRunner`].
    pub fn loops(&self) -> Vec<(Arc<dyn PeriodicTask>, Duration)> {
        vec![
            (
                self.orchestrator.clone() as Arc<dyn PeriodicTask>,
                self.config.orchestrator_interval,
            ),
            (
                self.replenisher.clone() as Arc<dyn PeriodicTask>,
                self.config.replenish_interval,
            ),
            (
                self.dispatcher.clone() as Arc<dyn PeriodicTask>,
                self.config.dispatch_interval,
            ),
        ]
    }
}
