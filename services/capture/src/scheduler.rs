//! Background capture loop.
//!
//! Each cycle runs the capture pipeline once, runs retention every N cycles,
//! then sleeps for the configured interval. The sleep is raced against a
//! cancellation token, so shutdown never waits for the interval to elapse.
//! A capture already in flight is allowed to finish.

use crate::error::{PipelineError, Result};
use crate::metadata_store::ImageRecord;
use crate::pipeline::CapturePipeline;
use crate::retention::{RetentionEnforcer, RetentionReport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle of the loop: `Stopped -> Running -> StopRequested -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    StopRequested,
}

/// What one cycle did
#[derive(Debug)]
pub struct CycleOutcome {
    pub capture: Result<ImageRecord>,
    /// Present on cycles that ran retention
    pub retention: Option<RetentionReport>,
}

pub struct CaptureScheduler {
    pipeline: Arc<CapturePipeline>,
    retention: Arc<RetentionEnforcer>,
    retention_every: u64,
    state: watch::Sender<SchedulerState>,
}

impl CaptureScheduler {
    pub fn new(
        pipeline: Arc<CapturePipeline>,
        retention: Arc<RetentionEnforcer>,
        retention_every: u64,
    ) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            pipeline,
            retention,
            retention_every: retention_every.max(1),
            state,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Capture immediately, outside the timer.
    ///
    /// Shares the pipeline lock with the loop, so it waits for an in-flight
    /// scheduled capture rather than racing it.
    pub async fn capture_now(&self) -> Result<ImageRecord> {
        self.pipeline.capture_one().await
    }

    /// Run until `cancel` fires. Returns the number of completed cycles.
    ///
    /// A second concurrent call returns immediately with zero cycles.
    pub async fn run(&self, cancel: CancellationToken) -> u64 {
        let started = self.state.send_if_modified(|state| {
            if *state == SchedulerState::Stopped {
                *state = SchedulerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            warn!("Capture scheduler is already running");
            return 0;
        }

        info!(retention_every = self.retention_every, "Capture scheduler started");

        let mut cycles: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                self.state.send_replace(SchedulerState::StopRequested);
                break;
            }

            cycles += 1;
            self.run_cycle(cycles).await;

            let interval = self.pipeline.settings().snapshot().capture_interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    self.state.send_replace(SchedulerState::StopRequested);
                    break;
                }
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        info!(cycles = cycles, "Capture scheduler stopped");
        cycles
    }

    /// One capture, plus retention when `cycle` is a multiple of the
    /// retention period. Failures are logged and never abort the loop.
    pub async fn run_cycle(&self, cycle: u64) -> CycleOutcome {
        let capture = self.pipeline.capture_one().await;
        if let Err(e) = &capture {
            let exit_status = match e {
                PipelineError::Capture(c) => c.exit_status(),
                _ => None,
            };
            error!(
                cycle = cycle,
                code = e.code(),
                exit_status = exit_status,
                error = %e,
                "Capture cycle failed"
            );
        }

        let retention = if cycle % self.retention_every == 0 {
            let settings = self.pipeline.settings().snapshot();
            Some(
                self.retention
                    .enforce(settings.retention_days, settings.max_storage_bytes)
                    .await,
            )
        } else {
            None
        };

        if let Some(report) = &retention {
            for failure in &report.failures {
                warn!(
                    path = %failure.path.display(),
                    phase = %failure.phase,
                    error = %failure.error,
                    "Retention could not prune file"
                );
            }
        }

        CycleOutcome { capture, retention }
    }
}
