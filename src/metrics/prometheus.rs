//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by reelforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Global Prometheus registry for all reelforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Phase transitions, labeled by entity type, phase, target status and actor.
pub static PHASE_TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Replenishment batches enqueued, labeled by character.
pub static REPLENISH_BATCHES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Images requested by replenishment, labeled by character.
pub static REPLENISH_IMAGES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last observed approved-image deficit, labeled by character.
pub static REPLENISH_DEFICIT: OnceLock<GaugeVec> = OnceLock::new();

/// Finished generation work, labeled by kind (image/shot) and outcome.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Work currently in flight at the backend, labeled by kind.
pub static JOBS_IN_FLIGHT: OnceLock<GaugeVec> = OnceLock::new();

/// Recent-minus-overall quality, labeled by character.
pub static QUALITY_DRIFT: OnceLock<GaugeVec> = OnceLock::new();

/// Drift alerts raised, labeled by character.
pub static DRIFT_ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Duration of one loop tick in seconds, labeled by loop.
pub static TICK_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Distribution of scorer quality scores.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Events published on the bus, labeled by kind.
pub static EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Vision scorer requests, labeled by model and status.
pub static SCORER_REQUESTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Vision scorer latency in seconds, labeled by model.
pub static SCORER_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Safe to call more than once; later calls leave the first registry in
/// place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Orchestrator metrics
    let phase_transitions_total = CounterVec::new(
        Opts::new(
            "reelforge_phase_transitions_total",
            "Pipeline phase transitions",
        ),
        &["entity_type", "phase", "to", "actor"],
    )?;

    // Replenishment metrics
    let replenish_batches_total = CounterVec::new(
        Opts::new(
            "reelforge_replenish_batches_total",
            "Generation batches enqueued by replenishment",
        ),
        &["character"],
    )?;

    let replenish_images_total = CounterVec::new(
        Opts::new(
            "reelforge_replenish_images_total",
            "Images requested by replenishment",
        ),
        &["character"],
    )?;

    let replenish_deficit = GaugeVec::new(
        Opts::new(
            "reelforge_replenish_deficit",
            "Last observed approved-image deficit",
        ),
        &["character"],
    )?;

    // Dispatch metrics
    let jobs_total = CounterVec::new(
        Opts::new("reelforge_jobs_total", "Finished generation work"),
        &["kind", "outcome"],
    )?;

    let jobs_in_flight = GaugeVec::new(
        Opts::new("reelforge_jobs_in_flight", "Work in flight at the backend"),
        &["kind"],
    )?;

    // Analytics metrics
    let quality_drift = GaugeVec::new(
        Opts::new("reelforge_quality_drift", "Recent minus overall quality"),
        &["character"],
    )?;

    let drift_alerts_total = CounterVec::new(
        Opts::new("reelforge_drift_alerts_total", "Drift alerts raised"),
        &["character"],
    )?;

    let tick_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reelforge_tick_duration_seconds",
            "Duration of one loop tick in seconds",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["loop"],
    )?;

    let quality_score = Histogram::with_opts(
        prometheus::HistogramOpts::new("reelforge_quality_score", "Distribution of quality scores")
            .buckets(vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0]),
    )?;

    let events_total = CounterVec::new(
        Opts::new("reelforge_events_total", "Events published on the bus"),
        &["kind"],
    )?;

    // Scorer metrics
    let scorer_requests_total = CounterVec::new(
        Opts::new("reelforge_scorer_requests_total", "Vision scorer requests"),
        &["model", "status"],
    )?;

    let scorer_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "reelforge_scorer_latency_seconds",
            "Vision scorer latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        &["model"],
    )?;

    registry.register(Box::new(phase_transitions_total.clone()))?;
    registry.register(Box::new(replenish_batches_total.clone()))?;
    registry.register(Box::new(replenish_images_total.clone()))?;
    registry.register(Box::new(replenish_deficit.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(jobs_in_flight.clone()))?;
    registry.register(Box::new(quality_drift.clone()))?;
    registry.register(Box::new(drift_alerts_total.clone()))?;
    registry.register(Box::new(tick_duration.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(events_total.clone()))?;
    registry.register(Box::new(scorer_requests_total.clone()))?;
    registry.register(Box::new(scorer_latency.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = PHASE_TRANSITIONS_TOTAL.set(phase_transitions_total);
    let _ = REPLENISH_BATCHES_TOTAL.set(replenish_batches_total);
    let _ = REPLENISH_IMAGES_TOTAL.set(replenish_images_total);
    let _ = REPLENISH_DEFICIT.set(replenish_deficit);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOBS_IN_FLIGHT.set(jobs_in_flight);
    let _ = QUALITY_DRIFT.set(quality_drift);
    let _ = DRIFT_ALERTS_TOTAL.set(drift_alerts_total);
    let _ = TICK_DURATION.set(tick_duration);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = EVENTS_TOTAL.set(events_total);
    let _ = SCORER_REQUESTS_TOTAL.set(scorer_requests_total);
    let _ = SCORER_LATENCY.set(scorer_latency);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, the returned
/// text is a single comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
