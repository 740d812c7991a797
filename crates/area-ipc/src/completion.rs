//! One-shot completion shared between a producer and a consumer.
//!
//! [`completion`] returns a [`Completer`] (the producing half, held by the
//! handshake thread or an RPC pending-call table) and a [`Completion`] (the
//! consuming half, returned to the caller). The result reaches the consumer
//! exactly once: through a registered continuation, through a blocking
//! `wait`, or through `.await`.
//!
//! Dropping either half early is well defined. A dropped `Completer` delivers
//! [`Error::Cancelled`]; a dropped `Completion` abandons the operation and
//! hands `Cancelled` to any continuation already registered. Continuations
//! always run outside the internal lock.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{Error, Result};

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send>;

enum State<T> {
    /// No result yet; maybe a continuation waiting for it.
    Pending(Option<Continuation<T>>),
    /// Result produced, nobody has taken it yet.
    Ready(Result<T>),
    /// Result handed to the consumer.
    Delivered,
    /// Consumer went away before the result was taken.
    Abandoned,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Create a linked producer/consumer pair.
pub fn completion<T>() -> (Completer<T>, Completion<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(None)),
        ready: Condvar::new(),
    });
    (
        Completer {
            shared: Some(Arc::clone(&shared)),
        },
        Completion {
            shared: Some(shared),
        },
    )
}

/// A completion that already holds `result`.
pub(crate) fn completed<T>(result: Result<T>) -> Completion<T> {
    let (completer, completion) = completion();
    completer.complete(result);
    completion
}

/// Producing half.
pub struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    /// Deliver `result`. Returns `false` if the consumer had already gone.
    pub fn complete(mut self, result: Result<T>) -> bool {
        match self.shared.take() {
            Some(shared) => deliver(&shared, result),
            None => false,
        }
    }

    /// Whether the consumer has abandoned the operation.
    pub fn is_abandoned(&self) -> bool {
        self.shared
            .as_ref()
            .is_none_or(|shared| matches!(*shared.lock(), State::Abandoned))
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            deliver(&shared, Err(Error::Cancelled));
        }
    }
}

impl<T> std::fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer").finish_non_exhaustive()
    }
}

fn deliver<T>(shared: &Shared<T>, result: Result<T>) -> bool {
    let mut state = shared.lock();
    match std::mem::replace(&mut *state, State::Delivered) {
        State::Pending(Some(continuation)) => {
            drop(state);
            continuation(result);
            true
        }
        State::Pending(None) => {
            *state = State::Ready(result);
            drop(state);
            shared.ready.notify_all();
            true
        }
        previous @ (State::Ready(_) | State::Delivered | State::Abandoned) => {
            *state = previous;
            false
        }
    }
}

/// Consuming half.
pub struct Completion<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completion<T> {
    /// Run `continuation` with the result, now if it is already available or
    /// later on the producing thread.
    ///
    /// Only one continuation may be registered.
    pub fn on_complete<F>(&mut self, continuation: F) -> Result<()>
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| Error::usage("completion already consumed"))?;
        let mut state = shared.lock();
        match std::mem::replace(&mut *state, State::Delivered) {
            State::Pending(None) => {
                *state = State::Pending(Some(Box::new(continuation)));
                Ok(())
            }
            State::Ready(result) => {
                drop(state);
                continuation(result);
                Ok(())
            }
            previous => {
                *state = previous;
                Err(Error::usage("completion callback already registered"))
            }
        }
    }

    /// Register `continuation` and detach; dropping the handle no longer
    /// cancels the operation.
    pub fn then<F>(mut self, continuation: F) -> Result<()>
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        self.on_complete(continuation)?;
        self.shared = None;
        Ok(())
    }

    /// Whether a result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|shared| matches!(*shared.lock(), State::Ready(_)))
    }

    /// Block until the result arrives.
    pub fn wait(mut self) -> Result<T> {
        let shared = self
            .shared
            .take()
            .ok_or_else(|| Error::usage("completion already consumed"))?;
        let mut state = shared.lock();
        while matches!(*state, State::Pending(None)) {
            state = shared.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        take_ready(&mut state)
    }

    /// Block for at most `timeout`. On timeout the operation is abandoned.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<T> {
        let shared = self
            .shared
            .take()
            .ok_or_else(|| Error::usage("completion already consumed"))?;
        let state = shared.lock();
        let (mut state, _) = shared
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, State::Pending(None)))
            .unwrap_or_else(|e| e.into_inner());
        if matches!(*state, State::Pending(None)) {
            *state = State::Abandoned;
            return Err(Error::TimedOut(format!(
                "no result within {}ms",
                timeout.as_millis()
            )));
        }
        take_ready(&mut state)
    }

    /// Abandon the operation. A registered continuation receives
    /// [`Error::Cancelled`]. Returns `true` if the result was still pending.
    pub fn cancel(mut self) -> bool {
        self.abandon()
    }

    fn abandon(&mut self) -> bool {
        let Some(shared) = self.shared.take() else {
            return false;
        };
        let mut state = shared.lock();
        match std::mem::replace(&mut *state, State::Abandoned) {
            State::Pending(continuation) => {
                drop(state);
                if let Some(continuation) = continuation {
                    continuation(Err(Error::Cancelled));
                }
                true
            }
            State::Ready(_) => false,
            State::Delivered => {
                *state = State::Delivered;
                false
            }
            State::Abandoned => false,
        }
    }
}

fn take_ready<T>(state: &mut State<T>) -> Result<T> {
    match std::mem::replace(state, State::Delivered) {
        State::Ready(result) => result,
        previous => {
            *state = previous;
            Err(Error::usage("result was already delivered to a continuation"))
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl<T> std::fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntoFuture for Completion<T> {
    type Output = Result<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        let registered = self.then(move |result| {
            let _ = tx.send(result);
        });
        Box::pin(async move {
            registered?;
            rx.await.unwrap_or(Err(Error::Cancelled))
        })
    }
}
