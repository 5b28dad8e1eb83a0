//! Periodic control loops.
//!
//! Each loop is an independent tokio task ticking on its own interval until
//! a shutdown signal arrives on the shared broadcast channel. A failed tick
//! is logged and the loop carries on; the next tick starts again from
//! stored state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineOrchestrator;
use crate::replenish::Replenisher;

use super::dispatcher::Dispatcher;

/// Errors that can occur when starting or stopping the loops.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Loops are already running")]
    AlreadyRunning,

    #[error("Loops are not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Work done once per interval.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run_once(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl PeriodicTask for PipelineOrchestrator {
    fn name(&self) -> &'static str {
        "orchestrator"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let report = self.tick().await?;
        debug!(moves = report.moves(), failed = report.failed.len(), "Orchestrator loop tick");
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for Replenisher {
    fn name(&self) -> &'static str {
        "replenisher"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let report = self.tick().await?;
        debug!(
            enqueued = report.enqueued.len(),
            failed = report.failed.len(),
            "Replenisher loop tick"
        );
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for Dispatcher {
    fn name(&self) -> &'static str {
        "dispatcher"
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.tick().await?;
        Ok(())
    }
}

/// Tick counters shared by all loops.
#[derive(Debug, Default)]
struct LoopStats {
    ticks: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of [`LoopRunner`] activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub loops: usize,
    pub ticks: u64,
    pub failures: u64,
}

/// Owns the spawned loops and their shutdown channel.
pub struct LoopRunner {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<LoopStats>,
    shutdown_timeout: Duration,
    is_running: AtomicBool,
}

impl LoopRunner {
    pub fn new(shutdown_timeout: Duration) -> Self {
        // One message is enough: shutdown is sent once.
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(LoopStats::default()),
            shutdown_timeout,
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts one loop per `(task, interval)` pair.
    pub fn start(&mut self, tasks: Vec<(Arc<dyn PeriodicTask>, Duration)>) -> Result<(), RunnerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }

        for (task, period) in tasks {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let stats = Arc::clone(&self.stats);
            info!(loop_name = task.name(), interval_ms = period.as_millis() as u64, "Starting loop");
            self.handles
                .push(tokio::spawn(run_loop(task, period, shutdown_rx, stats)));
        }
        Ok(())
    }

    /// Signals every loop to stop and waits for the current ticks to end.
    pub async fn shutdown(&mut self) -> Result<(), RunnerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(RunnerError::NotRunning);
        }

        info!("Stopping control loops");
        // Loops that already exited have dropped their receivers.
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let wait_all = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Loop task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.shutdown_timeout, wait_all).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Control loops stopped");
                Ok(())
            }
            Err(_) => Err(RunnerError::ShutdownTimeout(self.shutdown_timeout)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            loops: self.handles.len(),
            ticks: self.stats.ticks.load(Ordering::SeqCst),
            failures: self.stats.failures.load(Ordering::SeqCst),
        }
    }
}

async fn run_loop(
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<LoopStats>,
) {
    let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(loop_name = task.name(), "Loop received shutdown signal");
                break;
            }
            _ = interval.tick() => {
                let started = Instant::now();
                stats.ticks.fetch_add(1, Ordering::SeqCst);
                if let Err(e) = task.run_once().await {
                    stats.failures.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        loop_name = task.name(),
                        error = %e,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Loop tick failed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PeriodicTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run_once(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("tick failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_loops_tick_until_shutdown() {
        let ok = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail: false,
        });
        let failing = Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail: true,
        });

        let mut runner = LoopRunner::new(Duration::from_secs(5));
        runner
            .start(vec![
                (ok.clone() as Arc<dyn PeriodicTask>, Duration::from_millis(10)),
                (failing.clone() as Arc<dyn PeriodicTask>, Duration::from_millis(10)),
            ])
            .unwrap();
        assert!(runner.is_running());
        assert!(matches!(runner.start(vec![]), Err(RunnerError::AlreadyRunning)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        runner.shutdown().await.unwrap();
        assert!(!runner.is_running());

        // A failing tick never stops its loop.
        assert!(failing.runs.load(Ordering::SeqCst) >= 2);
        assert!(ok.runs.load(Ordering::SeqCst) >= 2);
        let stats = runner.stats();
        assert_eq!(stats.failures, failing.runs.load(Ordering::SeqCst) as u64);

        let after = ok.runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ok.runs.load(Ordering::SeqCst), after);
    }

    #[tokio::test]
    async fn test_shutdown_requires_running() {
        let mut runner = LoopRunner::new(Duration::from_secs(1));
        assert!(matches!(runner.shutdown().await, Err(RunnerError::NotRunning)));
    }
}
