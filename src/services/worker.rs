//! Plumbing shared by the upload and download workers: cooperative control,
//! engine events, retry loops and record finalization.

use serde::Serialize;
use std::{future::Future, io, sync::Arc, time::Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    errors::{StoreError, TransferError, TransferResult},
    models::transfer::{Direction, TransferStatus},
    services::{
        object_store::ObjectStore,
        progress::SpeedTracker,
        retry::Backoff,
        transfer_store::TransferRepository,
    },
};

/// Signals produced by the engine and its workers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress {
        id: i64,
        bytes_done: u64,
        total_bytes: u64,
    },
    Speed {
        id: i64,
        bytes_per_sec: f64,
    },
    StatusChanged {
        id: i64,
        status: TransferStatus,
    },
    Error {
        id: i64,
        user_message: String,
        detail: String,
    },
    Finished {
        id: i64,
        direction: Direction,
        key: String,
        size: u64,
    },
}

/// Why a worker stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Paused,
    Cancelled,
}

/// Per-run pause and cancel flags, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct TransferControl {
    paused: CancellationToken,
    cancelled: CancellationToken,
}

impl TransferControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.cancel();
    }

    pub fn cancel(&self) {
        self.cancelled.cancel();
    }

    /// Pending interrupt, cancel taking precedence over pause.
    pub fn checkpoint(&self) -> Option<Interrupt> {
        if self.cancelled.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.paused.is_cancelled() {
            Some(Interrupt::Paused)
        } else {
            None
        }
    }

    /// Resolves as soon as either flag is raised.
    pub async fn interrupted(&self) -> Interrupt {
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Interrupt::Cancelled,
            _ = self.paused.cancelled() => Interrupt::Paused,
        }
    }
}

/// How a worker run ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    Completed,
    Paused,
    Cancelled,
    Failed(TransferError),
}

/// Error raised inside a worker step.
#[derive(Debug)]
pub(crate) enum StepError {
    Interrupted(Interrupt),
    Failed(TransferError),
}

impl From<TransferError> for StepError {
    fn from(err: TransferError) -> Self {
        StepError::Failed(err)
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Failed(err.into())
    }
}

impl From<io::Error> for StepError {
    fn from(err: io::Error) -> Self {
        StepError::Failed(err.into())
    }
}

pub(crate) type StepResult<T> = Result<T, StepError>;

/// Everything a worker needs for one run of one transfer.
pub struct WorkerContext {
    pub transfer_id: i64,
    pub store: Arc<dyn ObjectStore>,
    pub repo: Arc<dyn TransferRepository>,
    pub control: TransferControl,
    pub events: broadcast::Sender<TransferEvent>,
    pub backoff: Backoff,
    pub speed: SpeedTracker,
    /// Highest byte count reported so far. Seeded from the stored record.
    pub progress: u64,
}

impl WorkerContext {
    pub(crate) fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn checkpoint(&self) -> StepResult<()> {
        match self.control.checkpoint() {
            Some(interrupt) => Err(StepError::Interrupted(interrupt)),
            None => Ok(()),
        }
    }

    /// Persist and report cumulative progress short of completion.
    ///
    /// The reported count never goes down, and the stored one stays below
    /// `total_bytes` until [`report_complete`](Self::report_complete).
    pub(crate) async fn report_progress(&mut self, bytes_done: u64, total_bytes: u64) -> StepResult<()> {
        self.progress = self.progress.max(bytes_done);
        let held = self.progress.min(total_bytes.saturating_sub(1));
        self.repo.set_transferred(self.transfer_id, held as i64).await?;
        self.publish_progress(total_bytes);
        Ok(())
    }

    /// Record the whole object as transferred. Only called once the object
    /// is in its final place.
    pub(crate) async fn report_complete(&mut self, total_bytes: u64) -> StepResult<()> {
        self.progress = total_bytes;
        self.repo
            .set_transferred(self.transfer_id, total_bytes as i64)
            .await?;
        self.publish_progress(total_bytes);
        Ok(())
    }

    /// Start counting from zero again after the transfer's data was discarded.
    pub(crate) async fn reset_progress(&mut self) -> StepResult<()> {
        self.progress = 0;
        self.repo.set_transferred(self.transfer_id, 0).await?;
        Ok(())
    }

    fn publish_progress(&mut self, total_bytes: u64) {
        let bytes_done = self.progress.min(total_bytes);
        self.emit(TransferEvent::Progress {
            id: self.transfer_id,
            bytes_done,
            total_bytes,
        });
        if let Some(bytes_per_sec) = self.speed.record(bytes_done, Instant::now()) {
            self.emit(TransferEvent::Speed {
                id: self.transfer_id,
                bytes_per_sec,
            });
        }
    }

    /// Run `op` until it succeeds, fails terminally, or exhausts the policy.
    ///
    /// Backoff sleeps end early on pause or cancel. Each retry bumps the
    /// record's retry counter.
    pub(crate) async fn with_retry<T, F, Fut>(&mut self, what: &str, mut op: F) -> StepResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TransferResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let delay = self.backoff.delay(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    interrupt = self.control.interrupted() => {
                        return Err(StepError::Interrupted(interrupt));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.backoff.policy().allows(attempt + 1) => {
                    attempt += 1;
                    let retries = self.repo.increment_retry(self.transfer_id).await?;
                    warn!(
                        transfer_id = self.transfer_id,
                        attempt,
                        retries,
                        "{} failed, retrying: {}",
                        what,
                        err
                    );
                }
                Err(err) => return Err(StepError::Failed(err)),
            }
        }
    }

    /// Write the terminal (or paused) state and emit the matching events.
    pub(crate) async fn finish(&self, outcome: &WorkerOutcome) {
        let id = self.transfer_id;
        let (status, error) = match outcome {
            WorkerOutcome::Completed => (TransferStatus::Completed, None),
            WorkerOutcome::Paused => (TransferStatus::Paused, None),
            WorkerOutcome::Cancelled => (TransferStatus::Cancelled, None),
            WorkerOutcome::Failed(err) => (TransferStatus::Failed, Some(err.to_string())),
        };
        if let Err(err) = self.repo.update_status(id, status, error.as_deref()).await {
            warn!(transfer_id = id, "failed to persist {} status: {}", status, err);
        }

        if let WorkerOutcome::Failed(err) = outcome {
            warn!(transfer_id = id, "transfer failed: {}", err);
            self.emit(TransferEvent::Error {
                id,
                user_message: err.user_message(),
                detail: err.to_string(),
            });
        } else {
            info!(transfer_id = id, %status, "transfer stopped");
        }
        self.emit(TransferEvent::StatusChanged { id, status });
    }
}

/// Fold a step result into an outcome.
pub(crate) fn outcome_of<T>(result: StepResult<T>) -> WorkerOutcome {
    match result {
        Ok(_) => WorkerOutcome::Completed,
        Err(StepError::Interrupted(Interrupt::Paused)) => WorkerOutcome::Paused,
        Err(StepError::Interrupted(Interrupt::Cancelled)) => WorkerOutcome::Cancelled,
        Err(StepError::Failed(err)) => WorkerOutcome::Failed(err),
    }
}
