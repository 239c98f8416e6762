//! Shared recognizer pool
//!
//! Local inference is CPU/GPU-bound, not I/O-bound: one process-wide worker
//! prevents memory blow-up and device contention. The pool is a bounded
//! FIFO in front of a single worker task; the engine is constructed (and
//! its model loaded) before the pool starts accepting work, so the first
//! utterance pays no load latency.
//!
//! A full queue answers `Busy` immediately; callers translate that into a
//! polite spoken message, never a hard error.

use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

use voice_gateway_core::AudioFormat;

use crate::providers::AsrEngine;
use crate::{PipelineError, BUSY_MESSAGE};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolTask {
    frames: Vec<Vec<u8>>,
    session_id: String,
    format: AudioFormat,
    reply: oneshot::Sender<Result<(String, Option<PathBuf>), PipelineError>>,
}

pub struct SharedAsrPool {
    task_tx: RwLock<Option<mpsc::Sender<PoolTask>>>,
    running: Arc<AtomicBool>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SharedAsrPool {
    /// Start the pool over an already-loaded engine.
    pub fn spawn(engine: Arc<dyn AsrEngine>, capacity: usize) -> Arc<Self> {
        let (task_tx, mut task_rx) = mpsc::channel::<PoolTask>(capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));

        let worker_running = running.clone();
        // Serializes inference even if the worker ever grows siblings.
        let inference_lock = Arc::new(Mutex::new(()));
        let worker = tokio::spawn(async move {
            tracing::info!(capacity, "shared asr pool worker started");
            while let Some(task) = task_rx.recv().await {
                if !worker_running.load(Ordering::Acquire) {
                    let _ = task.reply.send(Err(PipelineError::ShuttingDown));
                    continue;
                }
                let _guard = inference_lock.lock().await;
                let result = engine
                    .speech_to_text(task.frames, &task.session_id, task.format)
                    .await;
                let _ = task.reply.send(result);
            }
            tracing::info!("shared asr pool worker stopped");
        });

        Arc::new(Self {
            task_tx: RwLock::new(Some(task_tx)),
            running,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    /// Queue one utterance and wait for its transcript.
    ///
    /// Returns `Busy` without blocking when the queue is full and
    /// `ShuttingDown` once the pool stopped accepting work.
    pub async fn submit(
        &self,
        frames: Vec<Vec<u8>>,
        session_id: &str,
        format: AudioFormat,
    ) -> Result<(String, Option<PathBuf>), PipelineError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(PipelineError::ShuttingDown);
        }
        let sender = self
            .task_tx
            .read()
            .clone()
            .ok_or(PipelineError::ShuttingDown)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let task = PoolTask {
            frames,
            session_id: session_id.to_string(),
            format,
            reply: reply_tx,
        };
        match sender.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(session_id, "asr pool queue full");
                return Err(PipelineError::Busy);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(PipelineError::ShuttingDown);
            }
        }

        reply_rx.await.map_err(|_| PipelineError::ShuttingDown)?
    }

    /// Stop accepting work, let the in-flight task finish within a bounded
    /// window, fail what is still queued.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender ends the worker loop once the queue drains;
        // queued tasks are answered with ShuttingDown by the worker.
        self.task_tx.write().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
                tracing::warn!("asr pool drain timed out");
            }
        }
        tracing::info!("shared asr pool shut down");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Per-session recognizer backed by the shared pool.
///
/// Translates back-pressure into the polite busy phrase so the user hears
/// an answer instead of an error.
pub struct SharedAsrHandle {
    pool: Arc<SharedAsrPool>,
}

impl SharedAsrHandle {
    pub fn new(pool: Arc<SharedAsrPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AsrEngine for SharedAsrHandle {
    async fn speech_to_text(
        &self,
        frames: Vec<Vec<u8>>,
        session_id: &str,
        format: AudioFormat,
    ) -> Result<(String, Option<PathBuf>), PipelineError> {
        match self.pool.submit(frames, session_id, format).await {
            Ok(result) => Ok(result),
            Err(PipelineError::Busy) => Ok((BUSY_MESSAGE.to_string(), None)),
            Err(err) => {
                tracing::error!(session_id, error = %err, "shared pool recognition failed");
                Ok((String::new(), None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Engine that parks until released, counting concurrent entries.
    struct GatedEngine {
        release: Notify,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        completed: AtomicUsize,
    }

    impl GatedEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: Notify::new(),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AsrEngine for GatedEngine {
        async fn speech_to_text(
            &self,
            _frames: Vec<Vec<u8>>,
            session_id: &str,
            _format: AudioFormat,
        ) -> Result<(String, Option<PathBuf>), PipelineError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok((format!("text-{session_id}"), None))
        }
    }

    #[tokio::test]
    async fn at_most_one_task_executes_at_a_time() {
        let engine = GatedEngine::new();
        let pool = SharedAsrPool::spawn(engine.clone(), 10);

        let mut submissions = Vec::new();
        for i in 0..4 {
            let pool = pool.clone();
            submissions.push(tokio::spawn(async move {
                pool.submit(vec![vec![0u8; 4]], &format!("s{i}"), AudioFormat::Opus)
                    .await
            }));
        }

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            engine.release.notify_one();
        }
        for submission in submissions {
            submission.await.unwrap().unwrap();
        }
        assert_eq!(engine.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(engine.completed.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn overflow_returns_busy_without_blocking() {
        let engine = GatedEngine::new();
        let pool = SharedAsrPool::spawn(engine.clone(), 2);

        // One running (dequeued) plus two queued fills the pipe.
        let mut held = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            held.push(tokio::spawn(async move {
                pool.submit(vec![], &format!("s{i}"), AudioFormat::Opus).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let overflow = pool.submit(vec![], "late", AudioFormat::Opus).await;
        assert!(matches!(overflow, Err(PipelineError::Busy)));

        for _ in 0..3 {
            engine.release.notify_one();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for task in held {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn handle_translates_busy_to_polite_text() {
        let engine = GatedEngine::new();
        let pool = SharedAsrPool::spawn(engine.clone(), 1);
        let handle = SharedAsrHandle::new(pool.clone());

        // Fill: one in flight, one queued.
        let mut held = Vec::new();
        for i in 0..2 {
            let pool = pool.clone();
            held.push(tokio::spawn(async move {
                pool.submit(vec![], &format!("s{i}"), AudioFormat::Opus).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (text, _) = handle
            .speech_to_text(vec![], "late", AudioFormat::Opus)
            .await
            .unwrap();
        assert_eq!(text, BUSY_MESSAGE);

        for _ in 0..2 {
            engine.release.notify_one();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for task in held {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_rejects_new_and_fails_queued() {
        let engine = GatedEngine::new();
        let pool = SharedAsrPool::spawn(engine.clone(), 4);

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(vec![], "s0", AudioFormat::Opus).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let also_queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit(vec![], "s1", AudioFormat::Opus).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Release the in-flight task so the drain completes.
        engine.release.notify_one();
        shutdown.await.unwrap();

        assert!(matches!(
            pool.submit(vec![], "late", AudioFormat::Opus).await,
            Err(PipelineError::ShuttingDown)
        ));
        // The in-flight task finished; the queued one was failed.
        assert!(queued.await.unwrap().is_ok());
        assert!(matches!(
            also_queued.await.unwrap(),
            Err(PipelineError::ShuttingDown)
        ));
    }
}
