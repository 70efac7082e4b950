//! One-shot completion token.
//!
//! An [`AsyncResult`] is handed to every provider operation and is completed
//! exactly once, either with success or with a [`ProviderError`]. Later
//! completions are ignored, which makes late completions after a local
//! timeout harmless.
//!
//! Two ways of observing the outcome are supported:
//!
//! - awaiting it with [`AsyncResult::wait`] / [`AsyncResult::wait_timeout`]
//! - registering a callback with [`AsyncResult::with_callback`]; the callback
//!   runs on whichever task completes the token
//!
//! Callbacks are how results cross from one serialized queue to another: the
//! failover orchestrator builds tokens whose callback posts a message back to
//! its own queue rather than touching shared state.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;

use crate::{ProviderError, Result};

/// Outcome carried by a completed token.
pub type Outcome = Result<()>;

type Callback = Box<dyn FnOnce(&Outcome) + Send>;

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct State {
    outcome: Option<Outcome>,
    callback: Option<Callback>,
}

struct Inner {
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

/// Shared one-shot completion token.
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct AsyncResult {
    inner: Arc<Inner>,
}

impl AsyncResult {
    // ---

    /// Create a token with no callback.
    pub fn new() -> Self {
        // ---
        Self::build(None)
    }

    /// Create a token that invokes `callback` once, when it is completed.
    pub fn with_callback<F>(callback: F) -> Self
    where
        F: FnOnce(&Outcome) + Send + 'static,
    {
        Self::build(Some(Box::new(callback)))
    }

    fn build(callback: Option<Callback>) -> Self {
        // ---
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    callback,
                }),
                done,
            }),
        }
    }

    /// Complete with success. Returns `false` if already complete.
    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Complete with failure. Returns `false` if already complete.
    pub fn fail(&self, error: ProviderError) -> bool {
        self.complete(Err(error))
    }

    /// Complete with the given outcome. Returns `false` if already complete,
    /// in which case the outcome is dropped.
    pub fn complete(&self, outcome: Outcome) -> bool {
        // ---
        let callback = {
            let mut state = lock_ignore_poison(&self.inner.state);
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            state.callback.take()
        };

        if let Some(callback) = callback {
            callback(&outcome);
        }
        self.inner.done.send_replace(true);
        true
    }

    /// Whether the token has been completed.
    pub fn is_complete(&self) -> bool {
        lock_ignore_poison(&self.inner.state).outcome.is_some()
    }

    /// The outcome, if the token has been completed.
    pub fn outcome(&self) -> Option<Outcome> {
        lock_ignore_poison(&self.inner.state).outcome.clone()
    }

    /// Wait for completion without a bound.
    pub async fn wait(&self) -> Outcome {
        // ---
        let mut rx = self.inner.done.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = rx.wait_for(|done| *done).await;
        self.outcome()
            .unwrap_or_else(|| Err(ProviderError::IllegalState("completion lost".into())))
    }

    /// Wait for completion, giving up with [`ProviderError::Timeout`] after
    /// `timeout`. `None` waits indefinitely.
    ///
    /// Giving up does not retract the work that will complete the token.
    pub async fn wait_timeout(&self, timeout: Option<Duration>) -> Outcome {
        // ---
        match timeout {
            None => self.wait().await,
            Some(limit) => match tokio::time::timeout(limit, self.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ProviderError::Timeout),
            },
        }
    }
}

impl Default for AsyncResult {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("outcome", &self.outcome())
            .finish()
    }
}
