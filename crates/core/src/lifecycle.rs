//! Per-session lifecycle
//!
//! `Created → Starting → Running → Stopping → Stopped`, with `Error` as a
//! terminal sink. Start hooks run in registration order; stop hooks run in
//! reverse. A failing hook flips the state to `Error` but the remaining
//! hooks still run, so partially-started sessions tear down cleanly.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

type Hook = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CoreError>> + Send>;

pub struct LifecycleManager {
    session_id: String,
    state: Mutex<LifecycleState>,
    on_start: Mutex<Vec<Hook>>,
    on_stop: Mutex<Vec<Hook>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl LifecycleManager {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (stop_tx, stop_rx) = watch::channel(false);
        Arc::new(Self {
            session_id: session_id.into(),
            state: Mutex::new(LifecycleState::Created),
            on_start: Mutex::new(Vec::new()),
            on_stop: Mutex::new(Vec::new()),
            stop_tx,
            stop_rx,
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), LifecycleState::Stopped | LifecycleState::Error)
    }

    /// Register a start hook. No effect once `start` has run.
    pub fn on_start<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        self.on_start.lock().push(Box::new(move || Box::pin(hook())));
    }

    /// Register a stop hook. Stop hooks run in reverse registration order.
    pub fn on_stop<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), CoreError>> + Send + 'static,
    {
        self.on_stop.lock().push(Box::new(move || Box::pin(hook())));
    }

    pub async fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Created {
                tracing::warn!(
                    session_id = %self.session_id,
                    state = ?*state,
                    "lifecycle already started"
                );
                return;
            }
            *state = LifecycleState::Starting;
        }

        let hooks: Vec<Hook> = std::mem::take(&mut *self.on_start.lock());
        let mut failed = false;
        for hook in hooks {
            if let Err(err) = hook().await {
                tracing::error!(session_id = %self.session_id, error = %err, "start hook failed");
                failed = true;
            }
        }

        let mut state = self.state.lock();
        *state = if failed {
            LifecycleState::Error
        } else {
            LifecycleState::Running
        };
        tracing::debug!(session_id = %self.session_id, state = ?*state, "lifecycle started");
    }

    /// Idempotent stop: run stop hooks reversed, then unblock waiters.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                LifecycleState::Stopping | LifecycleState::Stopped
            ) {
                return;
            }
            *state = LifecycleState::Stopping;
        }

        let mut hooks: Vec<Hook> = std::mem::take(&mut *self.on_stop.lock());
        hooks.reverse();
        for hook in hooks {
            if let Err(err) = hook().await {
                tracing::error!(session_id = %self.session_id, error = %err, "stop hook failed");
            }
        }

        *self.state.lock() = LifecycleState::Stopped;
        let _ = self.stop_tx.send(true);
        tracing::debug!(session_id = %self.session_id, "lifecycle stopped");
    }

    /// A receiver session-owned tasks watch at their suspension points.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }

    pub async fn wait_for_stop(&self) {
        let mut rx = self.stop_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
