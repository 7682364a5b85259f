//! Single-threaded, admission-controlled task dispatcher.
//!
//! # Design
//! One dispatcher thread drains a FIFO queue of deferred tasks. Each task is
//! handed to a dedicated worker thread so the dispatcher can still notice a
//! `halt` while arbitrary user code is running; the dispatcher itself only
//! ever blocks on its condition variable.
//!
//! After every task the admission policy is consulted. If it refuses, the
//! dispatcher waits until the policy's next eligible instant. If it admits and
//! nothing is queued, the dispatcher parks for at most `idle_sleep` or until
//! new work arrives.
//!
//! Two locks are involved and never nested: the queue lock (tasks, state,
//! worker hand-back) and the listener lock. Listeners are copied out and run
//! with no lock held, so they may enqueue work or edit the listener set.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::limiter::AdmissionPolicy;
use crate::task::{panic_message, DeferredTask, Job, TaskHandle};

/// Where the dispatcher loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Nothing queued.
    Idle,
    /// A task was taken off the queue and is about to run.
    Dispatching,
    /// A task is running on the worker.
    Executing,
    /// Waiting for the admission policy to reopen.
    Throttled,
    /// Terminal.
    Halted,
}

/// Identifies a registered idle listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type IdleListener = Arc<dyn Fn() + Send + Sync>;

struct Queue {
    tasks: VecDeque<Box<dyn Job>>,
    /// Set by the worker once the in-flight task returned or panicked.
    finished: Option<(Box<dyn Job>, Option<String>)>,
    state: DispatcherState,
    halted: bool,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    persistent: Vec<(ListenerId, IdleListener)>,
    once: Vec<(ListenerId, IdleListener)>,
}

struct Shared {
    queue: Mutex<Queue>,
    signal: Condvar,
    listeners: Mutex<Listeners>,
    policy: Arc<dyn AdmissionPolicy>,
    idle_sleep: Duration,
}

enum Flow {
    Continue,
    /// The task was cancelled before dispatch and never ran.
    Skipped,
    Halted,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, worker: Sender<Box<dyn Job>>) {
        // Whether a task ran since listeners were last told about idleness.
        let mut ran = false;
        loop {
            let next = {
                let mut queue = self.lock_queue();
                if queue.halted {
                    break;
                }
                let next = queue.tasks.pop_front();
                if next.is_some() {
                    queue.state = DispatcherState::Dispatching;
                }
                next
            };

            let idle = match next {
                Some(job) => {
                    match self.execute(job, &worker) {
                        Flow::Halted => break,
                        Flow::Continue => ran = true,
                        Flow::Skipped => {}
                    }
                    let idle = {
                        let mut queue = self.lock_queue();
                        let idle = queue.tasks.is_empty();
                        if !queue.halted {
                            queue.state = if idle {
                                DispatcherState::Idle
                            } else {
                                DispatcherState::Dispatching
                            };
                        }
                        idle
                    };
                    if idle && ran {
                        ran = false;
                        self.notify_idle();
                    }
                    idle
                }
                None => true,
            };

            if let Flow::Halted = self.pace(idle) {
                break;
            }
        }
        self.lock_queue().state = DispatcherState::Halted;
        debug!("dispatcher stopped");
    }

    fn execute(&self, job: Box<dyn Job>, worker: &Sender<Box<dyn Job>>) -> Flow {
        if job.is_cancelled() {
            trace!("skipping task cancelled before dispatch");
            return Flow::Skipped;
        }
        let canceller = job.canceller();
        self.lock_queue().state = DispatcherState::Executing;

        if let Err(SendError(job)) = worker.send(job) {
            job.settle(Some("worker thread is gone".to_string()));
            return Flow::Continue;
        }

        let mut queue = self.lock_queue();
        loop {
            if let Some((job, panic)) = queue.finished.take() {
                drop(queue);
                job.settle(panic);
                return Flow::Continue;
            }
            if queue.halted {
                drop(queue);
                // The worker keeps running the closure; whatever it returns
                // lands on an already cancelled handle.
                canceller.cancel();
                return Flow::Halted;
            }
            queue = self
                .signal
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn pace(&self, idle: bool) -> Flow {
        let mut queue = self.lock_queue();
        if queue.halted {
            return Flow::Halted;
        }
        if !self.policy.can_proceed_now() {
            queue.state = DispatcherState::Throttled;
            loop {
                let wait = self.policy.time_until_eligible();
                if wait.is_zero() {
                    break;
                }
                trace!(wait_ms = wait.as_millis() as u64, "throttled");
                queue = self
                    .signal
                    .wait_timeout(queue, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                if queue.halted {
                    return Flow::Halted;
                }
            }
            queue.state = if queue.tasks.is_empty() {
                DispatcherState::Idle
            } else {
                DispatcherState::Dispatching
            };
        } else if idle && queue.tasks.is_empty() {
            queue = self
                .signal
                .wait_timeout(queue, self.idle_sleep)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            if queue.halted {
                return Flow::Halted;
            }
        }
        Flow::Continue
    }

    fn notify_idle(&self) {
        let listeners: Vec<IdleListener> = {
            let mut registered = self.lock_listeners();
            let mut all: Vec<IdleListener> = registered
                .persistent
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();
            all.extend(registered.once.drain(..).map(|(_, listener)| listener));
            all
        };
        for listener in listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener())) {
                warn!(panic = %panic_message(payload), "idle listener panicked");
            }
        }
    }
}

fn work(shared: Arc<Shared>, jobs: Receiver<Box<dyn Job>>) {
    for mut job in jobs {
        let panic = panic::catch_unwind(AssertUnwindSafe(|| job.execute()))
            .err()
            .map(panic_message);
        if let Some(message) = &panic {
            warn!(panic = %message, "task panicked");
        }
        shared.lock_queue().finished = Some((job, panic));
        shared.signal.notify_all();
    }
}

/// Runs submitted work one task at a time, paced by an admission policy.
///
/// Dropping the dispatcher halts it. To share one dispatcher between several
/// clients, wrap it in an `Arc`.
pub struct Dispatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn AdmissionPolicy>) -> Result<Self, DispatchError> {
        Self::with_config(policy, &DispatcherConfig::default())
    }

    pub fn with_config(
        policy: Arc<dyn AdmissionPolicy>,
        config: &DispatcherConfig,
    ) -> Result<Self, DispatchError> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                finished: None,
                state: DispatcherState::Idle,
                halted: false,
            }),
            signal: Condvar::new(),
            listeners: Mutex::new(Listeners::default()),
            policy,
            idle_sleep: config.idle_sleep,
        });

        let (sender, receiver) = mpsc::channel();
        let worker_shared = shared.clone();
        thread::Builder::new()
            .name("ore-worker".to_string())
            .spawn(move || work(worker_shared, receiver))?;

        let loop_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("ore-dispatcher".to_string())
            .spawn(move || loop_shared.run(sender))?;

        debug!(idle_sleep = ?config.idle_sleep, "dispatcher started");
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues `work` and returns its handle without blocking.
    pub fn enqueue<T, E, F>(&self, work: F) -> Result<TaskHandle<T, E>, DispatchError>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (task, handle) = DeferredTask::new(work);
        {
            let mut queue = self.shared.lock_queue();
            if queue.halted {
                return Err(DispatchError::Halted);
            }
            queue.tasks.push_back(Box::new(task));
            trace!(queued = queue.tasks.len(), "task enqueued");
        }
        self.shared.signal.notify_all();
        Ok(handle)
    }

    /// Stops the dispatcher. Queued tasks and the in-flight task are
    /// cancelled. Calling it again does nothing.
    pub fn halt(&self) {
        let drained = {
            let mut queue = self.shared.lock_queue();
            if queue.halted {
                return;
            }
            queue.halted = true;
            queue.state = DispatcherState::Halted;
            std::mem::take(&mut queue.tasks)
        };
        self.shared.signal.notify_all();
        let cancelled = drained.len();
        for job in drained {
            job.cancel();
        }
        info!(cancelled, "dispatcher halted");
    }

    pub fn is_halted(&self) -> bool {
        self.shared.lock_queue().halted
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.lock_queue().state
    }

    /// Number of tasks waiting to be dispatched.
    pub fn queued(&self) -> usize {
        self.shared.lock_queue().tasks.len()
    }

    /// Registers `listener` to run whenever the queue drains after a task.
    /// With `once` set it is removed before its first invocation.
    pub fn add_idle_listener<F>(&self, listener: F, once: bool) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut registered = self.shared.lock_listeners();
        let id = ListenerId(registered.next_id);
        registered.next_id += 1;
        let entry = (id, Arc::new(listener) as IdleListener);
        if once {
            registered.once.push(entry);
        } else {
            registered.persistent.push(entry);
        }
        id
    }

    pub fn remove_idle_listener(&self, id: ListenerId) -> bool {
        let mut registered = self.shared.lock_listeners();
        let before = registered.persistent.len() + registered.once.len();
        registered.persistent.retain(|(listener, _)| *listener != id);
        registered.once.retain(|(listener, _)| *listener != id);
        before != registered.persistent.len() + registered.once.len()
    }

    pub fn policy(&self) -> &Arc<dyn AdmissionPolicy> {
        &self.shared.policy
    }

    pub fn record_request(&self) {
        self.shared.policy.record_request();
    }

    pub fn can_proceed_now(&self) -> bool {
        self.shared.policy.can_proceed_now()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state())
            .field("queued", &self.queued())
            .field("policy", &self.shared.policy)
            .finish()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.halt();
        let thread = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                warn!("dispatcher thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::{Limits, TokenBucket};
    use crate::task::TaskError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    fn unthrottled() -> Dispatcher {
        Dispatcher::new(Arc::new(TokenBucket::new(Limits::new(1000, 100_000)))).unwrap()
    }

    /// Enqueues a task that blocks until the returned sender fires.
    fn block(dispatcher: &Dispatcher) -> (Sender<()>, TaskHandle<(), ()>) {
        let (release, gate) = mpsc::channel::<()>();
        let handle = dispatcher
            .enqueue(move || {
                let _ = gate.recv();
                Ok(())
            })
            .unwrap();
        (release, handle)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn tasks_run_in_submission_order() {
        let dispatcher = unthrottled();
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let order = order.clone();
                dispatcher
                    .enqueue::<_, (), _>(move || {
                        order.lock().unwrap().push(i);
                        Ok(i)
                    })
                    .unwrap()
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.wait().unwrap()).collect();
        assert_eq!(results, (0..20).collect::<Vec<_>>());
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn failures_are_delivered_and_loop_continues() {
        let dispatcher = unthrottled();

        let failing = dispatcher.enqueue::<u8, _, _>(|| Err("remote said no")).unwrap();
        let panicking = dispatcher.enqueue::<u8, &str, _>(|| panic!("bad task")).unwrap();
        let fine = dispatcher.enqueue::<_, &str, _>(|| Ok(3)).unwrap();

        assert_eq!(failing.wait().unwrap_err().into_failure(), Some("remote said no"));
        assert!(matches!(panicking.wait(), Err(TaskError::Panicked(m)) if m == "bad task"));
        assert_eq!(fine.wait().unwrap(), 3);
        assert!(!dispatcher.is_halted());
    }

    #[test]
    fn halt_cancels_pending_without_running_them() {
        let dispatcher = unthrottled();
        let (release, in_flight) = block(&dispatcher);
        let ran = Arc::new(AtomicUsize::new(0));

        let pending: Vec<_> = (0..3)
            .map(|_| {
                let ran = ran.clone();
                dispatcher
                    .enqueue::<_, (), _>(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        dispatcher.halt();
        dispatcher.halt();
        let _ = release.send(());

        for handle in pending {
            assert!(handle.wait().unwrap_err().is_cancelled());
        }
        assert!(in_flight.wait().unwrap_err().is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(wait_for(|| dispatcher.state() == DispatcherState::Halted));
    }

    #[test]
    fn enqueue_after_halt_fails_fast() {
        let dispatcher = unthrottled();
        dispatcher.halt();

        let result = dispatcher.enqueue::<(), (), _>(|| Ok(()));
        assert!(matches!(result, Err(DispatchError::Halted)));
    }

    #[test]
    fn handle_cancelled_before_dispatch_is_skipped() {
        let dispatcher = unthrottled();
        let (release, first) = block(&dispatcher);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let skipped = dispatcher
            .enqueue::<_, (), _>(move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        let after = dispatcher.enqueue::<_, (), _>(|| Ok("after")).unwrap();

        assert!(skipped.cancel());
        release.send(()).unwrap();

        first.wait().unwrap();
        assert_eq!(after.wait().unwrap(), "after");
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn skipped_task_alone_does_not_signal_idle() {
        let policy = Arc::new(TokenBucket::new(Limits::new(1, 80)));
        let dispatcher = Dispatcher::new(policy.clone()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        dispatcher.add_idle_listener(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        dispatcher
            .enqueue::<_, (), _>(move || {
                policy.record_request();
                Ok(())
            })
            .unwrap()
            .wait()
            .unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));

        // Still inside the one-second window, so this is queued, not running.
        let lone = dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap();
        assert!(lone.cancel());

        assert!(wait_for(|| dispatcher.queued() == 0));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_listener_fires_once_per_burst() {
        let dispatcher = unthrottled();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        dispatcher.add_idle_listener(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        let (release, _first) = block(&dispatcher);
        let handles: Vec<_> = (0..5)
            .map(|i| dispatcher.enqueue::<_, (), _>(move || Ok(i)).unwrap())
            .collect();
        release.send(()).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }

        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_listeners_are_dropped_after_first_call() {
        let dispatcher = unthrottled();
        let once = Arc::new(AtomicUsize::new(0));
        let always = Arc::new(AtomicUsize::new(0));
        let (once_counter, always_counter) = (once.clone(), always.clone());
        dispatcher.add_idle_listener(move || { once_counter.fetch_add(1, Ordering::SeqCst); }, true);
        dispatcher.add_idle_listener(move || { always_counter.fetch_add(1, Ordering::SeqCst); }, false);

        for burst in 1..=2 {
            dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();
            assert!(wait_for(|| always.load(Ordering::SeqCst) == burst));
        }

        assert_eq!(once.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let dispatcher = unthrottled();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = dispatcher.add_idle_listener(move || flag.store(true, Ordering::SeqCst), false);

        assert!(dispatcher.remove_idle_listener(id));
        assert!(!dispatcher.remove_idle_listener(id));

        dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();
        thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn panicking_listener_does_not_break_others() {
        let dispatcher = unthrottled();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        dispatcher.add_idle_listener(|| panic!("listener bug"), false);
        dispatcher.add_idle_listener(move || { counter.fetch_add(1, Ordering::SeqCst); }, false);

        dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1));

        dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn listeners_may_register_listeners() {
        let dispatcher = Arc::new(unthrottled());
        let nested = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&dispatcher);
        let counter = nested.clone();
        dispatcher.add_idle_listener(
            move || {
                if let Some(dispatcher) = weak.upgrade() {
                    let counter = counter.clone();
                    dispatcher.add_idle_listener(move || { counter.fetch_add(1, Ordering::SeqCst); }, true);
                }
            },
            true,
        );

        dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();
        thread::sleep(Duration::from_millis(50));
        dispatcher.enqueue::<_, (), _>(|| Ok(())).unwrap().wait().unwrap();

        assert!(wait_for(|| nested.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn throttles_between_tasks() {
        let policy = Arc::new(TokenBucket::new(Limits::new(1, 80)));
        let dispatcher = Dispatcher::new(policy.clone()).unwrap();
        let started = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let policy = policy.clone();
                let started = started.clone();
                dispatcher
                    .enqueue::<_, (), _>(move || {
                        started.lock().unwrap().push(Instant::now());
                        policy.record_request();
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }

        let started = started.lock().unwrap();
        for pair in started.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(1000), "gap {:?}", pair[1] - pair[0]);
        }
    }

    #[test]
    fn state_reports_execution() {
        let dispatcher = unthrottled();
        assert!(wait_for(|| dispatcher.state() == DispatcherState::Idle));

        let (release, handle) = block(&dispatcher);
        assert!(wait_for(|| dispatcher.state() == DispatcherState::Executing));

        release.send(()).unwrap();
        handle.wait().unwrap();
        assert!(wait_for(|| dispatcher.state() == DispatcherState::Idle));
    }

    #[tokio::test]
    async fn handles_can_be_awaited() {
        let dispatcher = unthrottled();
        let handle = dispatcher.enqueue::<_, (), _>(|| Ok("awaited")).unwrap();
        assert_eq!(handle.await.unwrap(), "awaited");
    }
}
