//! Delayed delivery: holds events until they are due, then submits them.

use super::engine::Ingress;
use super::event::Event;
use crate::error::Result;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Scheduled {
    due: Instant,
    seq: u64,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct DelayQueue {
    heap: BinaryHeap<Reverse<Scheduled>>,
    next_seq: u64,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<DelayQueue>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

/// Timer thread feeding due events into the engine's ingestion queue.
///
/// The thread is spawned on first use. Events due at the same instant are
/// submitted in the order they were scheduled.
pub(crate) struct Scheduler {
    inner: Arc<Inner>,
    ingress: Ingress,
    thread_name: String,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(ingress: Ingress, thread_name: String) -> Self {
        Self {
            inner: Arc::new(Inner::default()),
            ingress,
            thread_name,
            worker: Mutex::new(None),
        }
    }

    /// Submit `event` once `delay` has elapsed
    pub fn schedule(&self, event: Event, delay: Duration) -> Result<()> {
        self.ensure_worker()?;

        let mut queue = self.inner.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Scheduled {
            due: Instant::now() + delay,
            seq,
            event,
        }));
        drop(queue);

        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Number of events waiting for their due time
    pub fn len(&self) -> usize {
        self.inner.queue.lock().heap.len()
    }

    fn ensure_worker(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let ingress = self.ingress.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-scheduler", self.thread_name))
            .spawn(move || run(inner, ingress))?;
        *worker = Some(handle);
        Ok(())
    }
}

fn run(inner: Arc<Inner>, ingress: Ingress) {
    let mut queue = inner.queue.lock();
    while !inner.shutdown.load(AtomicOrdering::Acquire) {
        let next_due = queue.heap.peek().map(|Reverse(next)| next.due);
        match next_due {
            None => {
                inner.wakeup.wait(&mut queue);
            }
            Some(due) if due <= Instant::now() => {
                if let Some(Reverse(item)) = queue.heap.pop() {
                    // Release the lock while submitting; a bounded queue may block
                    MutexGuard::unlocked(&mut queue, || {
                        ingress.submit_unless(item.event, &inner.shutdown);
                    });
                }
            }
            Some(due) => {
                inner.wakeup.wait_until(&mut queue, due);
            }
        }
    }

    if !queue.heap.is_empty() {
        tracing::warn!(
            dropped = queue.heap.len(),
            "Scheduler shut down with undelivered events"
        );
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, AtomicOrdering::Release);
        {
            // Taking the lock orders the flag store before the worker's next wait
            let _queue = self.inner.queue.lock();
            self.inner.wakeup.notify_all();
        }
        if let Some(handle) = self.worker.get_mut().take() {
            let _ = handle.join();
        }
    }
}
