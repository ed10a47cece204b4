//! Transfer engine: the queue, the worker pool and lifecycle control.
//!
//! A single dispatcher task owns the registry of queued and active
//! transfers. Every public call is a message to that task, so admission
//! decisions are serialized and no transfer id can be handed to two workers.
//! Workers report back over a separate channel when they stop.

use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use serde::Serialize;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    fs,
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::EngineConfig,
    errors::{StoreError, TransferError, TransferResult},
    models::transfer::{Direction, NewTransfer, Transfer, TransferStatus},
    services::{
        download_worker,
        object_store::ObjectStore,
        progress::SpeedTracker,
        retry::Backoff,
        transfer_store::TransferRepository,
        upload_worker,
        worker::{TransferControl, TransferEvent, WorkerContext, WorkerOutcome},
    },
};

type Reply = oneshot::Sender<TransferResult<()>>;

enum Command {
    Enqueue(i64, Reply),
    Pause(i64, Reply),
    Resume(i64, Reply),
    Cancel(i64, Reply),
    Retry(i64, Reply),
    PauseAll(Reply),
    ResumeAll(Reply),
    Shutdown,
}

struct WorkerExit {
    id: i64,
    paused: bool,
}

/// What `restore_pending` did with each leftover record.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RestoreReport {
    pub requeued: Vec<i64>,
    pub paused: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct TransferEngine {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TransferEvent>,
    idle: watch::Receiver<bool>,
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn TransferRepository>,
    config: EngineConfig,
    /// Orphan sweep started by `restore_pending`, until someone awaits it.
    sweep: Arc<Mutex<Option<JoinHandle<usize>>>>,
}

impl TransferEngine {
    /// Spawn the dispatcher on the current runtime.
    pub fn start(
        store: Arc<dyn ObjectStore>,
        repo: Arc<dyn TransferRepository>,
        config: EngineConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        let (idle_tx, idle) = watch::channel(true);

        let dispatcher = Dispatcher {
            store: store.clone(),
            repo: repo.clone(),
            config: config.clone(),
            events: events.clone(),
            idle: idle_tx,
            exits: exits_tx,
            queue: BTreeSet::new(),
            active: HashMap::new(),
        };
        tokio::spawn(dispatcher.run(command_rx, exits_rx));
        info!(concurrency = config.concurrency, "transfer engine started");

        Self {
            commands,
            events,
            idle,
            store,
            repo,
            config,
            sweep: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Create a record for `new` and queue it.
    pub async fn submit(&self, new: NewTransfer) -> TransferResult<Transfer> {
        let transfer = self.repo.create(&new).await?;
        self.emit(TransferEvent::StatusChanged {
            id: transfer.id,
            status: TransferStatus::Queued,
        });
        self.enqueue(transfer.id).await?;
        Ok(transfer)
    }

    /// Make a transfer eligible for scheduling. No-op when it is already
    /// queued, running, or finished.
    pub async fn enqueue(&self, id: i64) -> TransferResult<()> {
        self.call(|reply| Command::Enqueue(id, reply)).await
    }

    /// Ask a running transfer to stop after its current chunk, or park a
    /// queued one.
    pub async fn pause(&self, id: i64) -> TransferResult<()> {
        self.call(|reply| Command::Pause(id, reply)).await
    }

    pub async fn resume(&self, id: i64) -> TransferResult<()> {
        self.call(|reply| Command::Resume(id, reply)).await
    }

    /// Cancel a transfer. Its multipart session is aborted (uploads) or its
    /// temp file deleted (downloads); the record is kept as `cancelled`.
    pub async fn cancel(&self, id: i64) -> TransferResult<()> {
        self.call(|reply| Command::Cancel(id, reply)).await
    }

    /// Requeue a failed transfer with a fresh retry budget.
    pub async fn retry(&self, id: i64) -> TransferResult<()> {
        self.call(|reply| Command::Retry(id, reply)).await
    }

    pub async fn pause_all(&self) -> TransferResult<()> {
        self.call(Command::PauseAll).await
    }

    pub async fn resume_all(&self) -> TransferResult<()> {
        self.call(Command::ResumeAll).await
    }

    /// Stop admitting work. Running workers are left to finish on their own.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Resolve once nothing is running and nothing is waiting for a slot.
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.clone();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    pub async fn transfer(&self, id: i64) -> TransferResult<Transfer> {
        self.repo.get(id).await
    }

    pub async fn transfers(&self) -> TransferResult<Vec<Transfer>> {
        self.repo.list_all().await
    }

    /// Pick up records left behind by a previous process.
    ///
    /// Running records are demoted to queued, paused ones stay paused.
    /// Records whose local file or directory disappeared fail right away.
    /// An orphan-session sweep is started in the background afterwards.
    pub async fn restore_pending(&self) -> TransferResult<RestoreReport> {
        let mut report = RestoreReport::default();
        let pending = self
            .repo
            .list_by_status(&[
                TransferStatus::Queued,
                TransferStatus::Running,
                TransferStatus::Paused,
            ])
            .await?;

        for transfer in pending {
            if transfer.status == TransferStatus::Paused {
                report.paused.push(transfer.id);
                continue;
            }
            if let Err(err) = check_local_preconditions(&transfer).await {
                warn!(transfer_id = transfer.id, "cannot restore transfer: {}", err);
                self.repo
                    .update_status(transfer.id, TransferStatus::Failed, Some(&err.to_string()))
                    .await?;
                self.emit(TransferEvent::Error {
                    id: transfer.id,
                    user_message: err.user_message(),
                    detail: err.to_string(),
                });
                self.emit(TransferEvent::StatusChanged {
                    id: transfer.id,
                    status: TransferStatus::Failed,
                });
                report.failed.push(transfer.id);
                continue;
            }
            if transfer.status == TransferStatus::Running {
                self.repo
                    .update_status(transfer.id, TransferStatus::Queued, None)
                    .await?;
            }
            self.enqueue(transfer.id).await?;
            report.requeued.push(transfer.id);
        }
        info!(
            requeued = report.requeued.len(),
            paused = report.paused.len(),
            failed = report.failed.len(),
            "restored pending transfers"
        );

        let engine = self.clone();
        let sweep = tokio::spawn(async move {
            match engine.cleanup_orphans().await {
                Ok(0) => 0,
                Ok(aborted) => {
                    info!(aborted, "aborted orphaned multipart sessions");
                    aborted
                }
                Err(err) => {
                    warn!("orphan cleanup failed: {}", err);
                    0
                }
            }
        });
        *self.sweep.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweep);
        Ok(report)
    }

    /// Wait for the orphan sweep started by `restore_pending` and return how
    /// many sessions it aborted. Zero when no sweep is outstanding.
    pub async fn finish_orphan_sweep(&self) -> usize {
        let sweep = self
            .sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sweep {
            Some(sweep) => sweep.await.unwrap_or(0),
            None => 0,
        }
    }

    /// Abort multipart sessions no record knows about, once they are older
    /// than the grace window. Returns how many were aborted.
    pub async fn cleanup_orphans(&self) -> TransferResult<usize> {
        let known: HashSet<String> = self.repo.known_session_ids().await?.into_iter().collect();
        let grace = chrono::Duration::from_std(self.config.orphan_grace)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let cutoff = Utc::now() - grace;

        let orphans: Vec<_> = self
            .store
            .list_multipart_sessions()
            .await?
            .into_iter()
            .filter(|session| !known.contains(&session.session_id))
            .filter(|session| session.initiated_at < cutoff)
            .collect();
        debug!(candidates = orphans.len(), "sweeping orphaned sessions");

        let aborted = stream::iter(orphans)
            .map(|session| {
                let store = self.store.clone();
                async move {
                    match store
                        .abort_multipart_session(&session.key, &session.session_id)
                        .await
                    {
                        Ok(()) => {
                            info!(key = %session.key, session_id = %session.session_id, "aborted orphaned session");
                            true
                        }
                        Err(StoreError::SessionNotFound(_)) => false,
                        Err(err) => {
                            warn!(session_id = %session.session_id, "failed to abort orphaned session: {}", err);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(2)
            .filter(|aborted| future::ready(*aborted))
            .count()
            .await;
        Ok(aborted)
    }

    /// Delete completed and cancelled records past the retention window.
    pub async fn prune_finished(&self) -> TransferResult<u64> {
        let retention = chrono::Duration::from_std(self.config.finished_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        let pruned = self.repo.prune_finished(Utc::now() - retention).await?;
        if pruned > 0 {
            info!(pruned, "pruned finished transfers");
        }
        Ok(pruned)
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn call(&self, make: impl FnOnce(Reply) -> Command) -> TransferResult<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| TransferError::EngineStopped)?;
        rx.await.map_err(|_| TransferError::EngineStopped)?
    }
}

async fn check_local_preconditions(transfer: &Transfer) -> TransferResult<()> {
    let path = transfer.local_path();
    match transfer.direction {
        Direction::Upload => {
            let present = fs::metadata(&path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);
            if !present {
                return Err(TransferError::SourceMissing(path));
            }
        }
        Direction::Download => {
            if !download_worker::destination_exists(&path).await {
                let dir = path.parent().map(|p| p.to_path_buf()).unwrap_or_default();
                return Err(TransferError::DestinationMissing(dir));
            }
        }
    }
    Ok(())
}

struct ActiveEntry {
    control: TransferControl,
    /// A pause was requested and the worker has not exited yet.
    pausing: bool,
    /// Resume arrived while the worker was still winding down.
    resume_requested: bool,
    /// Cleanup tasks for idle cancellations do not count against concurrency.
    holds_slot: bool,
}

struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    repo: Arc<dyn TransferRepository>,
    config: EngineConfig,
    events: broadcast::Sender<TransferEvent>,
    idle: watch::Sender<bool>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    /// Queued transfers in creation order.
    queue: BTreeSet<(DateTime<Utc>, i64)>,
    active: HashMap<i64, ActiveEntry>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut exits: mpsc::UnboundedReceiver<WorkerExit>,
    ) {
        loop {
            tokio::select! {
                Some(exit) = exits.recv() => {
                    self.on_exit(exit).await;
                    self.admit().await;
                    self.publish_idle();
                }
                command = commands.recv() => {
                    let (reply, result) = match command {
                        None | Some(Command::Shutdown) => break,
                        Some(Command::Enqueue(id, reply)) => (reply, self.enqueue(id).await),
                        Some(Command::Pause(id, reply)) => (reply, self.pause(id).await),
                        Some(Command::Resume(id, reply)) => (reply, self.resume(id).await),
                        Some(Command::Cancel(id, reply)) => (reply, self.cancel(id).await),
                        Some(Command::Retry(id, reply)) => (reply, self.retry(id).await),
                        Some(Command::PauseAll(reply)) => (reply, self.pause_all().await),
                        Some(Command::ResumeAll(reply)) => (reply, self.resume_all().await),
                    };
                    self.admit().await;
                    self.publish_idle();
                    let _ = reply.send(result);
                }
            }
        }
        info!("transfer engine stopped");
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    async fn set_status(
        &self,
        id: i64,
        status: TransferStatus,
        error: Option<&str>,
    ) -> TransferResult<()> {
        self.repo.update_status(id, status, error).await?;
        self.emit(TransferEvent::StatusChanged { id, status });
        Ok(())
    }

    fn is_queued(&self, id: i64) -> bool {
        self.queue.iter().any(|(_, queued)| *queued == id)
    }

    fn dequeue(&mut self, id: i64) {
        self.queue.retain(|(_, queued)| *queued != id);
    }

    fn running(&self) -> usize {
        self.active.values().filter(|entry| entry.holds_slot).count()
    }

    async fn enqueue(&mut self, id: i64) -> TransferResult<()> {
        if self.active.contains_key(&id) || self.is_queued(id) {
            return Ok(());
        }
        let transfer = self.repo.get(id).await?;
        if transfer.status.is_terminal() {
            debug!(transfer_id = id, status = %transfer.status, "not enqueuing finished transfer");
            return Ok(());
        }
        if transfer.status != TransferStatus::Queued {
            self.set_status(id, TransferStatus::Queued, None).await?;
        }
        self.queue.insert((transfer.created_at, id));
        Ok(())
    }

    async fn pause(&mut self, id: i64) -> TransferResult<()> {
        if let Some(entry) = self.active.get_mut(&id) {
            if entry.holds_slot {
                entry.control.pause();
                entry.pausing = true;
                entry.resume_requested = false;
            }
            return Ok(());
        }
        let transfer = self.repo.get(id).await?;
        match transfer.status {
            TransferStatus::Queued | TransferStatus::Running => {
                self.dequeue(id);
                self.set_status(id, TransferStatus::Paused, None).await
            }
            TransferStatus::Paused => Ok(()),
            status => Err(TransferError::InvalidState {
                id,
                status,
                expected: "queued or running",
            }),
        }
    }

    async fn resume(&mut self, id: i64) -> TransferResult<()> {
        if let Some(entry) = self.active.get_mut(&id) {
            if entry.pausing {
                entry.resume_requested = true;
            }
            return Ok(());
        }
        let transfer = self.repo.get(id).await?;
        match transfer.status {
            TransferStatus::Paused | TransferStatus::Queued | TransferStatus::Running => {
                self.enqueue(id).await
            }
            status => Err(TransferError::InvalidState {
                id,
                status,
                expected: "paused",
            }),
        }
    }

    async fn cancel(&mut self, id: i64) -> TransferResult<()> {
        if let Some(entry) = self.active.get_mut(&id) {
            entry.control.cancel();
            entry.resume_requested = false;
            return Ok(());
        }
        let transfer = self.repo.get(id).await?;
        if matches!(
            transfer.status,
            TransferStatus::Completed | TransferStatus::Cancelled
        ) {
            return Err(TransferError::InvalidState {
                id,
                status: transfer.status,
                expected: "unfinished",
            });
        }
        self.dequeue(id);
        self.spawn_cleanup(transfer);
        Ok(())
    }

    async fn retry(&mut self, id: i64) -> TransferResult<()> {
        let transfer = self.repo.get(id).await?;
        if transfer.status != TransferStatus::Failed || self.active.contains_key(&id) {
            return Err(TransferError::InvalidState {
                id,
                status: transfer.status,
                expected: "failed",
            });
        }
        self.repo.reset_retry(id).await?;
        self.set_status(id, TransferStatus::Queued, None).await?;
        self.queue.insert((transfer.created_at, id));
        info!(transfer_id = id, "transfer requeued for retry");
        Ok(())
    }

    async fn pause_all(&mut self) -> TransferResult<()> {
        for entry in self.active.values_mut().filter(|entry| entry.holds_slot) {
            entry.control.pause();
            entry.pausing = true;
            entry.resume_requested = false;
        }
        let queued: Vec<i64> = self.queue.iter().map(|(_, id)| *id).collect();
        self.queue.clear();
        for id in queued {
            self.set_status(id, TransferStatus::Paused, None).await?;
        }
        Ok(())
    }

    async fn resume_all(&mut self) -> TransferResult<()> {
        for entry in self.active.values_mut().filter(|entry| entry.pausing) {
            entry.resume_requested = true;
        }
        let paused = self.repo.list_by_status(&[TransferStatus::Paused]).await?;
        for transfer in paused {
            if self.active.contains_key(&transfer.id) {
                continue;
            }
            self.set_status(transfer.id, TransferStatus::Queued, None)
                .await?;
            self.queue.insert((transfer.created_at, transfer.id));
        }
        Ok(())
    }

    async fn on_exit(&mut self, exit: WorkerExit) {
        let Some(entry) = self.active.remove(&exit.id) else {
            return;
        };
        debug!(transfer_id = exit.id, paused = exit.paused, "worker exited");
        if exit.paused && entry.resume_requested {
            if let Err(err) = self.enqueue(exit.id).await {
                warn!(transfer_id = exit.id, "failed to requeue resumed transfer: {}", err);
            }
        }
    }

    /// Hand free slots to the oldest queued transfers.
    async fn admit(&mut self) {
        while self.running() < self.config.concurrency {
            let Some((_, id)) = self.queue.pop_first() else {
                break;
            };
            let mut transfer = match self.repo.get(id).await {
                Ok(transfer) => transfer,
                Err(err) => {
                    warn!(transfer_id = id, "dropping queued transfer: {}", err);
                    continue;
                }
            };
            if transfer.status != TransferStatus::Queued {
                debug!(transfer_id = id, status = %transfer.status, "skipping stale queue entry");
                continue;
            }
            if let Err(err) = self.set_status(id, TransferStatus::Running, None).await {
                warn!(transfer_id = id, "failed to mark transfer running: {}", err);
                continue;
            }
            transfer.status = TransferStatus::Running;
            self.spawn_worker(transfer);
        }
    }

    fn backoff_for(&self, id: i64) -> Backoff {
        match self.config.jitter_seed {
            Some(seed) => Backoff::with_seed(self.config.retry, seed ^ id as u64),
            None => Backoff::new(self.config.retry),
        }
    }

    fn spawn_worker(&mut self, transfer: Transfer) {
        let id = transfer.id;
        let control = TransferControl::new();
        let ctx = WorkerContext {
            transfer_id: id,
            store: self.store.clone(),
            repo: self.repo.clone(),
            control: control.clone(),
            events: self.events.clone(),
            backoff: self.backoff_for(id),
            speed: SpeedTracker::new(self.config.speed_window, self.config.speed_emit_interval),
            progress: transfer.transferred.max(0) as u64,
        };
        let exits = self.exits.clone();
        info!(transfer_id = id, direction = ?transfer.direction, "transfer admitted");
        tokio::spawn(async move {
            let outcome = match transfer.direction {
                Direction::Upload => upload_worker::run(ctx, transfer).await,
                Direction::Download => download_worker::run(ctx, transfer).await,
            };
            let _ = exits.send(WorkerExit {
                id,
                paused: matches!(outcome, WorkerOutcome::Paused),
            });
        });
        self.active.insert(
            id,
            ActiveEntry {
                control,
                pausing: false,
                resume_requested: false,
                holds_slot: true,
            },
        );
    }

    /// Cancel a transfer that has no worker: clean up remote and local
    /// leftovers, then record the cancellation.
    fn spawn_cleanup(&mut self, transfer: Transfer) {
        let id = transfer.id;
        let store = self.store.clone();
        let repo = self.repo.clone();
        let events = self.events.clone();
        let exits = self.exits.clone();
        tokio::spawn(async move {
            match transfer.direction {
                Direction::Upload => {
                    upload_worker::abort_upload(
                        store.as_ref(),
                        repo.as_ref(),
                        id,
                        &transfer.object_key,
                    )
                    .await
                }
                Direction::Download => {
                    download_worker::discard_temp(&transfer.local_path(), id).await
                }
            }
            match repo
                .update_status(id, TransferStatus::Cancelled, None)
                .await
            {
                Ok(()) => {
                    info!(transfer_id = id, "transfer cancelled");
                    let _ = events.send(TransferEvent::StatusChanged {
                        id,
                        status: TransferStatus::Cancelled,
                    });
                }
                Err(err) => warn!(transfer_id = id, "failed to record cancellation: {}", err),
            }
            let _ = exits.send(WorkerExit { id, paused: false });
        });
        self.active.insert(
            id,
            ActiveEntry {
                control: TransferControl::new(),
                pausing: false,
                resume_requested: false,
                holds_slot: false,
            },
        );
    }

    fn publish_idle(&self) {
        let idle = self.active.is_empty() && self.queue.is_empty();
        self.idle.send_if_modified(|current| {
            if *current == idle {
                false
            } else {
                *current = idle;
                true
            }
        });
    }
}
