//! Deferred units of work and the handles callers wait on.
//!
//! # Design
//! A `DeferredTask` pairs a blocking closure with the completion slot behind
//! its `TaskHandle`. Running the closure and delivering its outcome are two
//! separate steps so the dispatcher can do its own bookkeeping in between.
//!
//! The slot is a tagged state behind a mutex. Exactly one transition out of
//! `Pending` ever succeeds; whichever of deliver, fail or cancel gets there
//! first wins and the others report `false`. Handles can be waited on from a
//! thread (`wait`, `wait_timeout`) or awaited as a `Future`.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Why a task produced no value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError<E> {
    #[error("task was cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(E),
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl<E> TaskError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// The error raised by the work itself, if that is why the task failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            TaskError::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Misuse of the run/deliver protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TaskStateError {
    #[error("task was delivered before it ran successfully")]
    NotRun,
}

pub type TaskResult<T, E> = Result<T, TaskError<E>>;

enum Slot<T, E> {
    Pending,
    Done(TaskResult<T, E>),
    Taken,
}

struct State<T, E> {
    slot: Slot<T, E>,
    cancelled: bool,
    waker: Option<Waker>,
}

struct Completion<T, E> {
    state: Mutex<State<T, E>>,
    done: Condvar,
}

impl<T, E> Completion<T, E> {
    fn new() -> Self {
        Self::with_slot(Slot::Pending)
    }

    fn with_slot(slot: Slot<T, E>) -> Self {
        Self {
            state: Mutex::new(State {
                slot,
                cancelled: false,
                waker: None,
            }),
            done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, outcome: TaskResult<T, E>) -> bool {
        let waker = {
            let mut state = self.lock();
            if !matches!(state.slot, Slot::Pending) {
                return false;
            }
            state.cancelled = matches!(outcome, Err(TaskError::Cancelled));
            state.slot = Slot::Done(outcome);
            state.waker.take()
        };
        self.done.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
        true
    }

    fn is_pending(&self) -> bool {
        matches!(self.lock().slot, Slot::Pending)
    }

    fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }
}

/// Cancellation seen through a type-erased task.
pub(crate) trait Cancel: Send + Sync {
    fn cancel(&self) -> bool;
}

impl<T: Send, E: Send> Cancel for Completion<T, E> {
    fn cancel(&self) -> bool {
        self.complete(Err(TaskError::Cancelled))
    }
}

type Work<T, E> = Box<dyn FnOnce() -> Result<T, E> + Send>;

/// A unit of work plus the completion slot of its caller-visible handle.
pub struct DeferredTask<T, E> {
    work: Option<Work<T, E>>,
    result: Option<T>,
    failure: Option<E>,
    completion: Arc<Completion<T, E>>,
}

impl<T, E> DeferredTask<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<F>(work: F) -> (Self, TaskHandle<T, E>)
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let completion = Arc::new(Completion::new());
        let task = Self {
            work: Some(Box::new(work)),
            result: None,
            failure: None,
            completion: completion.clone(),
        };
        (task, TaskHandle { completion })
    }

    /// Invokes the work once and stashes its value. An error is handed back
    /// to the caller, who decides how to deliver it. Later calls do nothing.
    pub fn run(&mut self) -> Result<(), E> {
        if let Some(work) = self.work.take() {
            self.result = Some(work()?);
        }
        Ok(())
    }

    /// Completes the handle with the stashed value.
    ///
    /// Returns `Ok(false)` when the handle was already cancelled. Delivering
    /// before a successful `run` is a protocol error; the handle is failed so
    /// its owner does not wait forever.
    pub fn deliver(mut self) -> Result<bool, TaskStateError> {
        match self.result.take() {
            Some(value) => Ok(self.completion.complete(Ok(value))),
            None => {
                let error = TaskStateError::NotRun;
                self.completion
                    .complete(Err(TaskError::Panicked(error.to_string())));
                Err(error)
            }
        }
    }

    /// Completes the handle exceptionally.
    pub fn deliver_error(self, error: TaskError<E>) -> bool {
        self.completion.complete(Err(error))
    }

    pub fn cancel(&self) -> bool {
        self.completion.complete(Err(TaskError::Cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }
}

impl<T, E> fmt::Debug for DeferredTask<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredTask")
            .field("ran", &self.work.is_none())
            .field("pending", &self.completion.is_pending())
            .finish()
    }
}

/// The type-erased face of a `DeferredTask`, as seen by the dispatcher.
pub(crate) trait Job: Send {
    /// Runs the work, keeping any failure for `settle`.
    fn execute(&mut self);

    /// Delivers the outcome. `panic` carries the message of a panic raised
    /// while executing.
    fn settle(self: Box<Self>, panic: Option<String>);

    fn cancel(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    fn canceller(&self) -> Arc<dyn Cancel>;
}

impl<T, E> Job for DeferredTask<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn execute(&mut self) {
        if let Err(error) = self.run() {
            self.failure = Some(error);
        }
    }

    fn settle(self: Box<Self>, panic: Option<String>) {
        let mut task = *self;
        let failure = task.failure.take();
        let delivered = match (panic, failure) {
            (Some(message), _) => task.deliver_error(TaskError::Panicked(message)),
            (None, Some(error)) => task.deliver_error(TaskError::Failed(error)),
            (None, None) => match task.deliver() {
                Ok(delivered) => delivered,
                Err(error) => {
                    tracing::error!(%error, "task settled without a result");
                    false
                }
            },
        };
        if !delivered {
            tracing::trace!("outcome discarded, handle already completed");
        }
    }

    fn cancel(&self) -> bool {
        DeferredTask::cancel(self)
    }

    fn is_cancelled(&self) -> bool {
        DeferredTask::is_cancelled(self)
    }

    fn canceller(&self) -> Arc<dyn Cancel> {
        self.completion.clone()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Caller-side view of a submitted task.
pub struct TaskHandle<T, E> {
    completion: Arc<Completion<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    /// A handle that is already completed with `value`.
    pub fn ready(value: T) -> Self {
        Self {
            completion: Arc::new(Completion::with_slot(Slot::Done(Ok(value)))),
        }
    }

    /// A handle that is already failed with `error`.
    pub fn failed(error: E) -> Self {
        Self {
            completion: Arc::new(Completion::with_slot(Slot::Done(Err(TaskError::Failed(error))))),
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.completion.is_pending()
    }

    pub fn is_cancelled(&self) -> bool {
        self.completion.is_cancelled()
    }

    /// Cancels the task if it has not completed yet. A task cancelled before
    /// it is dispatched never runs.
    pub fn cancel(&self) -> bool {
        self.completion.complete(Err(TaskError::Cancelled))
    }

    /// Blocks until the task completes.
    pub fn wait(self) -> TaskResult<T, E> {
        let mut state = self.completion.lock();
        loop {
            match std::mem::replace(&mut state.slot, Slot::Taken) {
                Slot::Pending => {
                    state.slot = Slot::Pending;
                    state = self
                        .completion
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Slot::Done(outcome) => return outcome,
                Slot::Taken => panic!("task outcome was already taken"),
            }
        }
    }

    /// Blocks for at most `timeout`. Returns `None` if the task is still
    /// running, leaving the handle usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<TaskResult<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.completion.lock();
        loop {
            match std::mem::replace(&mut state.slot, Slot::Taken) {
                Slot::Pending => {
                    state.slot = Slot::Pending;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    state = self
                        .completion
                        .done
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                Slot::Done(outcome) => return Some(outcome),
                Slot::Taken => return None,
            }
        }
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = TaskResult<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.completion.lock();
        match std::mem::replace(&mut state.slot, Slot::Taken) {
            Slot::Pending => {
                state.slot = Slot::Pending;
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Slot::Done(outcome) => Poll::Ready(outcome),
            Slot::Taken => panic!("TaskHandle polled after completion"),
        }
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("finished", &self.is_finished())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
