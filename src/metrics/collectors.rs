//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op until `init_metrics()` has run, so library code
//! and tests can record freely.

use super::prometheus::{
    DRIFT_ALERTS_TOTAL, EVENTS_TOTAL, JOBS_IN_FLIGHT, JOBS_TOTAL, PHASE_TRANSITIONS_TOTAL,
    QUALITY_DRIFT, QUALITY_SCORE, REPLENISH_BATCHES_TOTAL, REPLENISH_DEFICIT,
    REPLENISH_IMAGES_TOTAL, SCORER_LATENCY, SCORER_REQUESTS_TOTAL, TICK_DURATION,
};

/// Metrics collector for recording reelforge operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record one phase transition.
    pub fn record_phase_transition(&self, entity_type: &str, phase: &str, to: &str, actor: &str) {
        if let Some(counter) = PHASE_TRANSITIONS_TOTAL.get() {
            counter
                .with_label_values(&[entity_type, phase, to, actor])
                .inc();
        }
    }

    /// Record an enqueued replenishment batch.
    pub fn record_replenish_batch(&self, character: &str, batch_size: u32) {
        if let Some(counter) = REPLENISH_BATCHES_TOTAL.get() {
            counter.with_label_values(&[character]).inc();
        }
        if let Some(counter) = REPLENISH_IMAGES_TOTAL.get() {
            counter
                .with_label_values(&[character])
                .inc_by(batch_size as f64);
        }
    }

    /// Record the deficit observed for a character.
    pub fn set_deficit(&self, character: &str, deficit: i64) {
        if let Some(gauge) = REPLENISH_DEFICIT.get() {
            gauge.with_label_values(&[character]).set(deficit as f64);
        }
    }

    /// Record a finished job or shot.
    ///
    /// # Arguments
    ///
    /// * `kind` - "image" for generation jobs, "shot" for video clips
    /// * `outcome` - "completed", "failed" or "cancelled"
    pub fn record_job_outcome(&self, kind: &str, outcome: &str) {
        if let Some(counter) = JOBS_TOTAL.get() {
            counter.with_label_values(&[kind, outcome]).inc();
        }
        tracing::trace!(kind = kind, outcome = outcome, "Recorded job outcome");
    }

    /// Record the number of rows currently generating.
    pub fn set_in_flight(&self, kind: &str, count: usize) {
        if let Some(gauge) = JOBS_IN_FLIGHT.get() {
            gauge.with_label_values(&[kind]).set(count as f64);
        }
    }

    /// Record the latest drift measurement for a character.
    pub fn set_drift(&self, character: &str, drift: f64) {
        if let Some(gauge) = QUALITY_DRIFT.get() {
            gauge.with_label_values(&[character]).set(drift);
        }
    }

    /// Record a raised drift alert.
    pub fn record_drift_alert(&self, character: &str) {
        if let Some(counter) = DRIFT_ALERTS_TOTAL.get() {
            counter.with_label_values(&[character]).inc();
        }
    }

    /// Record how long one loop tick took.
    pub fn observe_tick(&self, loop_name: &str, duration_secs: f64) {
        if let Some(histogram) = TICK_DURATION.get() {
            histogram
                .with_label_values(&[loop_name])
                .observe(duration_secs);
        }
    }

    /// Record a scorer verdict.
    pub fn record_quality_score(&self, score: f64) {
        if let Some(histogram) = QUALITY_SCORE.get() {
            histogram.observe(score);
        }
    }

    /// Record a published event.
    pub fn record_event(&self, kind: &str) {
        if let Some(counter) = EVENTS_TOTAL.get() {
            counter.with_label_values(&[kind]).inc();
        }
    }

    /// Record one vision scorer request.
    pub fn record_scorer_request(&self, model: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "error" };
        if let Some(counter) = SCORER_REQUESTS_TOTAL.get() {
            counter.with_label_values(&[model, status]).inc();
        }
        if let Some(histogram) = SCORER_LATENCY.get() {
            histogram.with_label_values(&[model]).observe(latency_secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_recording_before_init_is_harmless() {
        let collector = MetricsCollector::new();
        collector.record_job_outcome("image", "failed");
        collector.set_drift("mira", -0.2);
    }

    #[test]
    fn test_recorded_values_are_exported() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();
        collector.record_replenish_batch("collector-test", 3);
        collector.record_phase_transition("character", "review", "completed", "auto");

        let text = export_metrics();
        assert!(text.contains("reelforge_replenish_images_total{character=\"collector-test\"}"));
        assert!(text.contains("reelforge_phase_transitions_total"));
    }
}
