//! Serial execution queue bound to one context.
//!
//! # Responsibility
//! - Run a context's jobs one at a time, in submission order.
//! - Provide fire-and-forget submission and a blocking hand-off.
//!
//! # Invariants
//! - Jobs of one queue never interleave.
//! - A thread owns every queue whose job it is running, plus every queue
//!   owned by a caller blocked in `perform_and_wait` on it. A blocking
//!   hand-off to an owned queue runs inline, so parent/child call chains
//!   across queues never wait on themselves.
//! - Jobs submitted after shutdown are dropped silently; jobs submitted before
//!   shutdown still run.

use log::{debug, error};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static OWNED_QUEUES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Queues owned by the current thread, innermost last.
fn owned_queues() -> Vec<u64> {
    OWNED_QUEUES.with(|owned| owned.borrow().clone())
}

fn owns_queue(id: u64) -> bool {
    OWNED_QUEUES.with(|owned| owned.borrow().contains(&id))
}

/// Marks `ids` as owned by the current thread until dropped.
struct Ownership {
    restore_len: usize,
}

impl Ownership {
    fn enter(ids: &[u64]) -> Self {
        OWNED_QUEUES.with(|owned| {
            let mut owned = owned.borrow_mut();
            let restore_len = owned.len();
            owned.extend_from_slice(ids);
            Self { restore_len }
        })
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        OWNED_QUEUES.with(|owned| owned.borrow_mut().truncate(self.restore_len));
    }
}

/// How a context serializes its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationMode {
    /// Dedicated worker thread per context.
    #[default]
    PrivateQueue,
    /// Jobs wait until a caller drains the queue and then run on the
    /// caller's thread (main-thread style confinement).
    Confined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was shut down before the job could run.
    Closed,
    /// The job panicked.
    Panicked,
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "context queue is closed"),
            Self::Panicked => write!(f, "context job panicked"),
        }
    }
}

impl Error for QueueError {}

pub struct SerialQueue {
    id: u64,
    label: String,
    kind: QueueKind,
}

enum QueueKind {
    Worker(WorkerQueue),
    Confined(ConfinedQueue),
}

struct WorkerQueue {
    sender: Mutex<Option<Sender<Job>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct ConfinedQueue {
    pending: Mutex<VecDeque<Job>>,
    run_lock: Mutex<()>,
    closed: AtomicBool,
}

impl SerialQueue {
    pub fn new(label: impl Into<String>, mode: SerializationMode) -> std::io::Result<Self> {
        let id = NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        let kind = match mode {
            SerializationMode::PrivateQueue => QueueKind::Worker(spawn_worker(id, &label)?),
            SerializationMode::Confined => QueueKind::Confined(ConfinedQueue {
                pending: Mutex::new(VecDeque::new()),
                run_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        };
        Ok(Self { id, label, kind })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mode(&self) -> SerializationMode {
        match self.kind {
            QueueKind::Worker(_) => SerializationMode::PrivateQueue,
            QueueKind::Confined(_) => SerializationMode::Confined,
        }
    }

    /// Whether the calling thread owns this queue: it is running one of the
    /// queue's jobs, or works on behalf of a caller that is.
    pub fn is_current(&self) -> bool {
        owns_queue(self.id)
    }

    /// Schedules `job` without waiting for it.
    pub fn perform(&self, job: impl FnOnce() + Send + 'static) {
        match &self.kind {
            QueueKind::Worker(worker) => {
                let guard = worker.sender.lock();
                let delivered = match guard.as_ref() {
                    Some(sender) => sender.send(Box::new(job)).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!(
                        "event=queue_drop module=context status=closed queue={}",
                        self.label
                    );
                }
            }
            QueueKind::Confined(confined) => {
                if confined.closed.load(Ordering::Acquire) {
                    debug!(
                        "event=queue_drop module=context status=closed queue={}",
                        self.label
                    );
                    return;
                }
                confined.pending.lock().push_back(Box::new(job));
            }
        }
    }

    /// Runs `job` on the queue and blocks until it returns.
    ///
    /// The job inherits every queue the caller owns.
    pub fn perform_and_wait<R, F>(&self, job: F) -> Result<R, QueueError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        match &self.kind {
            QueueKind::Worker(worker) => {
                let inherited = owned_queues();
                let (result_tx, result_rx) = mpsc::sync_channel(1);
                let wrapped: Job = Box::new(move || {
                    let _inherited = Ownership::enter(&inherited);
                    let _ = result_tx.send(catch_unwind(AssertUnwindSafe(job)));
                });
                {
                    let guard = worker.sender.lock();
                    let sender = guard.as_ref().ok_or(QueueError::Closed)?;
                    sender.send(wrapped).map_err(|_| QueueError::Closed)?;
                }
                match result_rx.recv() {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(_)) => Err(QueueError::Panicked),
                    Err(_) => Err(QueueError::Closed),
                }
            }
            QueueKind::Confined(confined) => {
                if confined.closed.load(Ordering::Acquire) {
                    return Err(QueueError::Closed);
                }
                let _run = confined.run_lock.lock();
                let _owned = Ownership::enter(&[self.id]);
                confined.run_pending(&self.label);
                catch_unwind(AssertUnwindSafe(job)).map_err(|_| QueueError::Panicked)
            }
        }
    }

    /// Blocks until every job submitted before this call has run.
    ///
    /// For a confined queue the jobs run on the calling thread.
    pub fn drain(&self) {
        if self.is_current() {
            return;
        }
        match &self.kind {
            QueueKind::Worker(_) => {
                let _ = self.perform_and_wait(|| ());
            }
            QueueKind::Confined(confined) => {
                let _run = confined.run_lock.lock();
                let _owned = Ownership::enter(&[self.id]);
                confined.run_pending(&self.label);
            }
        }
    }

    /// Stops accepting jobs. Already queued jobs of a worker queue still run;
    /// the worker thread is joined unless called from that thread.
    pub fn shutdown(&self) {
        match &self.kind {
            QueueKind::Worker(worker) => {
                worker.sender.lock().take();
                let handle = worker.handle.lock().take();
                if let Some(handle) = handle {
                    if handle.thread().id() != thread::current().id() {
                        let _ = handle.join();
                    }
                }
            }
            QueueKind::Confined(confined) => {
                confined.closed.store(true, Ordering::Release);
            }
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ConfinedQueue {
    fn run_pending(&self, label: &str) {
        loop {
            let next = self.pending.lock().pop_front();
            match next {
                Some(job) => run_job(label, job),
                None => break,
            }
        }
    }
}

fn spawn_worker(id: u64, label: &str) -> std::io::Result<WorkerQueue> {
    let (sender, receiver) = mpsc::channel::<Job>();
    let worker_label = label.to_string();
    let handle = thread::Builder::new()
        .name(label.to_string())
        .spawn(move || {
            let _owned = Ownership::enter(&[id]);
            while let Ok(job) = receiver.recv() {
                run_job(&worker_label, job);
            }
        })?;
    Ok(WorkerQueue {
        sender: Mutex::new(Some(sender)),
        handle: Mutex::new(Some(handle)),
    })
}

fn run_job(label: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!(
            "event=queue_job module=context status=error queue={} error_code=job_panicked",
            label
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{QueueError, SerialQueue, SerializationMode};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn worker_queue_runs_jobs_in_order() {
        let queue = SerialQueue::new("test-worker", SerializationMode::PrivateQueue).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for value in 0..20 {
            let seen = Arc::clone(&seen);
            queue.perform(move || seen.lock().push(value));
        }
        queue.drain();
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn confined_queue_waits_for_drain() {
        let queue = SerialQueue::new("test-confined", SerializationMode::Confined).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            queue.perform(move || seen.lock().push(1));
        }
        assert!(seen.lock().is_empty());

        queue.drain();
        assert_eq!(*seen.lock(), vec![1]);
    }

    #[test]
    fn perform_and_wait_returns_value_after_earlier_jobs() {
        for mode in [SerializationMode::PrivateQueue, SerializationMode::Confined] {
            let queue = SerialQueue::new("test-wait", mode).unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            {
                let seen = Arc::clone(&seen);
                queue.perform(move || seen.lock().push("first"));
            }
            let seen_in_job = Arc::clone(&seen);
            let len = queue
                .perform_and_wait(move || {
                    seen_in_job.lock().push("second");
                    seen_in_job.lock().len()
                })
                .unwrap();
            assert_eq!(len, 2);
            assert_eq!(*seen.lock(), vec!["first", "second"]);
        }
    }

    #[test]
    fn nested_perform_and_wait_runs_inline() {
        let queue = Arc::new(SerialQueue::new("test-nested", SerializationMode::PrivateQueue).unwrap());
        let inner = Arc::clone(&queue);
        let value = queue
            .perform_and_wait(move || {
                assert!(inner.is_current());
                inner.perform_and_wait(|| 7).unwrap()
            })
            .unwrap();
        assert_eq!(value, 7);
        assert!(!queue.is_current());
    }

    #[test]
    fn panicking_job_is_reported_and_queue_survives() {
        let queue = SerialQueue::new("test-panic", SerializationMode::PrivateQueue).unwrap();
        let result = queue.perform_and_wait(|| -> u8 { panic!("boom") });
        assert_eq!(result, Err(QueueError::Panicked));
        assert_eq!(queue.perform_and_wait(|| 1u8), Ok(1));
    }

    #[test]
    fn closed_queue_rejects_and_drops_jobs() {
        for mode in [SerializationMode::PrivateQueue, SerializationMode::Confined] {
            let queue = SerialQueue::new("test-closed", mode).unwrap();
            queue.shutdown();
            assert_eq!(queue.perform_and_wait(|| ()), Err(QueueError::Closed));

            let ran = Arc::new(Mutex::new(false));
            let flag = Arc::clone(&ran);
            queue.perform(move || *flag.lock() = true);
            queue.drain();
            assert!(!*ran.lock());
        }
    }

    #[test]
    fn hand_off_inherits_ownership_of_waiting_queue() {
        for outer_mode in [SerializationMode::PrivateQueue, SerializationMode::Confined] {
            let (done_tx, done_rx) = mpsc::channel();
            thread::spawn(move || {
                let outer = Arc::new(SerialQueue::new("test-outer", outer_mode).unwrap());
                let inner = Arc::new(
                    SerialQueue::new("test-inner", SerializationMode::PrivateQueue).unwrap(),
                );
                let outer_in_job = Arc::clone(&outer);
                let value = outer.perform_and_wait(move || {
                    let outer_again = Arc::clone(&outer_in_job);
                    inner
                        .perform_and_wait(move || {
                            assert!(outer_again.is_current());
                            outer_again.perform_and_wait(|| 11).unwrap()
                        })
                        .unwrap()
                });
                let _ = done_tx.send(value);
            });
            let value = done_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("nested hand-off did not complete");
            assert_eq!(value, Ok(11));
        }
    }

    #[test]
    fn ownership_ends_with_the_job() {
        let outer = Arc::new(SerialQueue::new("test-outer", SerializationMode::PrivateQueue).unwrap());
        let inner = Arc::new(SerialQueue::new("test-inner", SerializationMode::PrivateQueue).unwrap());
        let outer_in_job = Arc::clone(&outer);
        let inner_in_job = Arc::clone(&inner);
        outer
            .perform_and_wait(move || {
                let outer_again = Arc::clone(&outer_in_job);
                inner_in_job
                    .perform_and_wait(move || assert!(outer_again.is_current()))
                    .unwrap();
            })
            .unwrap();

        let outer_later = Arc::clone(&outer);
        let owned_later = inner
            .perform_and_wait(move || outer_later.is_current())
            .unwrap();
        assert!(!owned_later);
        assert!(!outer.is_current());
    }
}
