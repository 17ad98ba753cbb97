//! Asynchronous, batched soft deletion.
//!
//! A durable store accepts deletions synchronously and hands the accepted
//! codes to a [`DeletionPipeline`]. A single worker task collects them into
//! batches and applies each batch through the store's [`BatchDeleter`], first
//! durably and then in memory. Callers only learn that a deletion was
//! accepted; visibility is eventual.

use async_trait::async_trait;
use burrow_core::{Result, ShortCode};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

#[cfg(any(test, feature = "test-util"))]
use tokio::sync::oneshot;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Applies one batch of accepted deletions.
#[async_trait]
pub trait BatchDeleter: Send + Sync + 'static {
    async fn delete_batch(&self, codes: &[ShortCode]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TypedBuilder)]
pub struct PipelineSettings {
    /// A full buffer is flushed right away.
    #[builder(default = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,
    /// A partly filled buffer is flushed after at most this long.
    #[builder(default = DEFAULT_FLUSH_INTERVAL)]
    pub flush_interval: Duration,
}

impl PipelineSettings {
    pub fn queue_capacity(&self) -> usize {
        self.batch_size.max(1) * 2
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Accumulating,
    Flushing,
    Stopped,
}

enum Command {
    Delete(ShortCode),
    #[cfg(any(test, feature = "test-util"))]
    Flush(oneshot::Sender<()>),
}

pub struct DeletionPipeline {
    sender: mpsc::Sender<Command>,
    token: CancellationToken,
    pending: Arc<AtomicUsize>,
    state: watch::Receiver<PipelineState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeletionPipeline {
    /// Starts the worker. Cancelling `token` stops it without draining the queue.
    pub fn spawn(
        deleter: Arc<dyn BatchDeleter>,
        settings: PipelineSettings,
        token: CancellationToken,
    ) -> Self {
        let settings = PipelineSettings {
            batch_size: settings.batch_size.max(1),
            ..settings
        };
        let (sender, receiver) = mpsc::channel(settings.queue_capacity());
        let (state_tx, state) = watch::channel(PipelineState::Idle);
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            deleter,
            settings,
            batch: Vec::with_capacity(settings.batch_size),
            pending: pending.clone(),
            state: state_tx,
        };
        let handle = tokio::spawn(worker.run(receiver, token.clone()));

        Self {
            sender,
            token,
            pending,
            state,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Queues accepted codes without waiting for queue space.
    pub fn submit(&self, codes: Vec<ShortCode>) {
        if codes.is_empty() {
            return;
        }
        if self.token.is_cancelled() {
            warn!(dropped = codes.len(), "deletion pipeline stopped, dropping codes");
            return;
        }

        self.pending.fetch_add(codes.len(), Ordering::AcqRel);
        let sender = self.sender.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let total = codes.len();
            for (sent, code) in codes.into_iter().enumerate() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        warn!(dropped = total - sent, "deletion pipeline cancelled while enqueueing");
                        return;
                    }
                    sent = sender.send(Command::Delete(code)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    /// Codes accepted but not yet applied or dropped.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Cancels the worker and waits for it to exit. An in-flight batch finishes first.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "deletion worker panicked");
            }
        }
    }

    /// Forces flushes until every accepted code has been processed.
    ///
    /// Returns early once the pipeline is cancelled.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn flush(&self) {
        while !self.token.is_cancelled() {
            let (ack, done) = oneshot::channel();
            if self.sender.send(Command::Flush(ack)).await.is_err() {
                return;
            }
            let _ = done.await;
            if self.pending() == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Drop for DeletionPipeline {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    deleter: Arc<dyn BatchDeleter>,
    settings: PipelineSettings,
    batch: Vec<ShortCode>,
    pending: Arc<AtomicUsize>,
    state: watch::Sender<PipelineState>,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<Command>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    if !self.batch.is_empty() {
                        warn!(dropped = self.batch.len(), "deletion worker cancelled with unflushed codes");
                    }
                    break;
                }
                command = receiver.recv() => match command {
                    Some(Command::Delete(code)) => {
                        self.batch.push(code);
                        self.state.send_replace(PipelineState::Accumulating);
                        if self.batch.len() >= self.settings.batch_size {
                            self.flush().await;
                        }
                    }
                    #[cfg(any(test, feature = "test-util"))]
                    Some(Command::Flush(ack)) => {
                        self.flush().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick(), if !self.batch.is_empty() => self.flush().await,
            }
        }

        self.state.send_replace(PipelineState::Stopped);
        info!("deletion worker stopped");
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::replace(
            &mut self.batch,
            Vec::with_capacity(self.settings.batch_size),
        );
        self.state.send_replace(PipelineState::Flushing);

        match self.deleter.delete_batch(&batch).await {
            Ok(()) => debug!(count = batch.len(), "deletion batch applied"),
            Err(err) => {
                error!(count = batch.len(), error = %err, "failed to apply deletion batch, dropping it")
            }
        }

        self.pending.fetch_sub(batch.len(), Ordering::AcqRel);
        self.state.send_replace(PipelineState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_core::StorageError;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<ShortCode>>>,
        fail: bool,
    }

    impl Recorder {
        fn batches(&self) -> Vec<Vec<ShortCode>> {
            self.batches.lock().clone()
        }
    }

    #[async_trait]
    impl BatchDeleter for Recorder {
        async fn delete_batch(&self, codes: &[ShortCode]) -> Result<()> {
            self.batches.lock().push(codes.to_vec());
            if self.fail {
                return Err(StorageError::Io("disk full".to_string()));
            }
            Ok(())
        }
    }

    fn codes(n: usize) -> Vec<ShortCode> {
        (0..n)
            .map(|i| ShortCode::new_unchecked(format!("c{i}")))
            .collect()
    }

    fn settings(batch_size: usize, flush_interval: Duration) -> PipelineSettings {
        PipelineSettings::builder()
            .batch_size(batch_size)
            .flush_interval(flush_interval)
            .build()
    }

    #[test]
    fn defaults() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.batch_size, 20);
        assert_eq!(settings.flush_interval, Duration::from_millis(100));
        assert_eq!(settings.queue_capacity(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_batch_flushes_without_waiting_for_the_ticker() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DeletionPipeline::spawn(
            recorder.clone(),
            settings(3, Duration::from_secs(3600)),
            CancellationToken::new(),
        );

        pipeline.submit(codes(3));
        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { pipeline.pending() == 0 })
            .await;

        assert_eq!(recorder.batches(), vec![codes(3)]);
        pipeline.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn partial_batch_flushes_on_tick() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DeletionPipeline::spawn(
            recorder.clone(),
            settings(20, Duration::from_millis(20)),
            CancellationToken::new(),
        );

        pipeline.submit(codes(2));
        awaitility::at_most(Duration::from_secs(2))
            .poll_interval(Duration::from_millis(10))
            .until_async(|| async { pipeline.pending() == 0 })
            .await;

        assert_eq!(recorder.batches().concat(), codes(2));
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn flush_hook_applies_everything_submitted() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = DeletionPipeline::spawn(
            recorder.clone(),
            settings(4, Duration::from_secs(3600)),
            CancellationToken::new(),
        );

        pipeline.submit(codes(10));
        pipeline.flush().await;

        assert_eq!(pipeline.pending(), 0);
        assert_eq!(recorder.batches().concat(), codes(10));
        assert!(recorder.batches().iter().all(|batch| batch.len() <= 4));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn failed_batch_is_dropped() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let pipeline = DeletionPipeline::spawn(
            recorder.clone(),
            settings(2, Duration::from_secs(3600)),
            CancellationToken::new(),
        );

        pipeline.submit(codes(2));
        pipeline.flush().await;
        pipeline.submit(codes(2));
        pipeline.flush().await;

        assert_eq!(recorder.batches().len(), 2);
        assert_eq!(pipeline.pending(), 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_the_worker() {
        let recorder = Arc::new(Recorder::default());
        let parent = CancellationToken::new();
        let pipeline = DeletionPipeline::spawn(
            recorder.clone(),
            settings(20, Duration::from_secs(3600)),
            parent.child_token(),
        );

        parent.cancel();
        pipeline.shutdown().await;
        pipeline.submit(codes(3));
        pipeline.flush().await;

        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert!(recorder.batches().is_empty());
    }
}
