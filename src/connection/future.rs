use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::error::ConnectionError;

type Listener<T> = Box<dyn FnOnce(&Result<T, ConnectionError>) + Send>;

struct State<T> {
    outcome: Option<Result<T, ConnectionError>>,
    listeners: Vec<Listener<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores the first outcome and runs the listeners on this thread.
    /// Later outcomes are dropped.
    fn finish(&self, outcome: Result<T, ConnectionError>) {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return;
        }
        state.outcome = Some(outcome);
        let listeners = std::mem::take(&mut state.listeners);
        self.done.notify_all();

        if let Some(outcome) = state.outcome.as_ref() {
            for listener in listeners {
                listener(outcome);
            }
        }
    }
}

/// Handle to the result of an asynchronous call.
pub struct ResultsFuture<T> {
    shared: Arc<Shared<T>>,
    message_key: i64,
}

/// Write side of a [`ResultsFuture`]. Dropping it without completing fails
/// the future with [`ConnectionError::Closed`].
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> ResultsFuture<T> {
    pub fn pending(message_key: i64) -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                listeners: Vec::new(),
            }),
            done: Condvar::new(),
        });
        let completer = Completer {
            shared: Some(Arc::clone(&shared)),
        };
        (
            Self {
                shared,
                message_key,
            },
            completer,
        )
    }

    /// Key of the request behind this future, for server-side cancellation.
    pub fn message_key(&self) -> i64 {
        self.message_key
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().outcome.is_some()
    }

    /// Blocks until the call completes.
    pub fn get(self) -> Result<T, ConnectionError> {
        let mut state = self.shared.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                return outcome;
            }
            state = self
                .shared
                .done
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Waits at most `timeout`; returns whether the call has completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        while state.outcome.is_none() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            state = self
                .shared
                .done
                .wait_timeout(state, left)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Like [`ResultsFuture::get`], failing with
    /// [`ConnectionError::CallTimeout`] if nothing arrives in time.
    pub fn get_timeout(self, timeout: Duration) -> Result<T, ConnectionError> {
        if self.wait_timeout(timeout) {
            self.get()
        } else {
            Err(ConnectionError::CallTimeout(timeout))
        }
    }

    /// Releases the caller right away. The request itself may still run.
    pub fn cancel(&self) -> bool {
        if self.is_done() {
            return false;
        }
        self.shared.finish(Err(ConnectionError::Cancelled));
        true
    }

    /// Runs `listener` with the outcome on the completing thread, or right
    /// now on this thread if the call already finished.
    ///
    /// Listeners run with the future's state locked: they must not block or
    /// call back into this future.
    pub fn on_completion<F>(&self, listener: F)
    where
        F: FnOnce(&Result<T, ConnectionError>) + Send + 'static,
    {
        let mut state = self.shared.lock();
        match state.outcome.as_ref() {
            Some(outcome) => listener(outcome),
            None => state.listeners.push(Box::new(listener)),
        }
    }
}

impl<T> fmt::Debug for ResultsFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultsFuture")
            .field("message_key", &self.message_key)
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> Completer<T> {
    pub fn complete(mut self, outcome: Result<T, ConnectionError>) {
        if let Some(shared) = self.shared.take() {
            shared.finish(outcome);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.finish(Err(ConnectionError::Closed));
        }
    }
}
