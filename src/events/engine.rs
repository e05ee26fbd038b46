//! Event engine: ingestion queue, dispatch table and the processing loop.
//!
//! Producers call [`EventEngine::submit`] from any thread. A single
//! dispatch thread takes events off the queue in FIFO order and hands each
//! one to the interested listeners, one at a time, in registration order.
//! A listener that errors or panics is reported and skipped; delivery to
//! the remaining listeners and to later events carries on.

use super::dispatch::DispatchTable;
use super::event::{Event, EventType, Payload};
use super::listener::ListenerRef;
use super::reporter::{FailureReporter, ListenerFailure, TracingReporter, ENGINE_SOURCE};
use super::scheduler::Scheduler;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No dispatch thread; events accumulate in the queue
    Stopped,
    /// Dispatch thread is delivering events
    Running,
    /// `process_pending` is delivering events on the caller's thread
    Draining,
    /// Dispatch machinery broke; the engine cannot be restarted
    Failed,
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineMetrics {
    /// Events accepted onto the queue
    pub submitted: u64,
    /// Events taken off the queue and dispatched
    pub dispatched: u64,
    /// Individual `handle` calls
    pub deliveries: u64,
    /// `handle` calls that errored or panicked
    pub failures: u64,
    /// Dispatched events by type
    pub event_counts: HashMap<String, u64>,
    /// Events waiting in the queue
    pub queue_depth: usize,
    /// Events waiting on a delay
    pub scheduled: usize,
    /// Registered listeners
    pub listeners: usize,
    pub state: EngineState,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    per_type: Mutex<HashMap<EventType, u64>>,
}

impl Counters {
    fn record_dispatch(&self, event_type: EventType) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        *self.per_type.lock().entry(event_type).or_insert(0) += 1;
    }
}

/// Producer side of the ingestion queue
#[derive(Clone)]
pub(crate) struct Ingress {
    sender: Sender<Event>,
    capacity: Option<usize>,
    counters: Arc<Counters>,
}

impl Ingress {
    /// Enqueue, waiting for room if the queue is bounded and full
    pub fn submit(&self, event: Event) {
        match self.sender.send(event) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                tracing::error!(event_id = %err.0.id(), "Event queue disconnected; event dropped");
            }
        }
    }

    /// Enqueue without waiting
    pub fn try_submit(&self, event: Event) -> Result<()> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(EngineError::QueueFull {
                capacity: self.capacity.unwrap_or_default(),
            }),
            Err(TrySendError::Disconnected(_)) => Err(EngineError::EngineFailed),
        }
    }

    /// Enqueue, waiting for room until `cancel` is raised
    pub fn submit_unless(&self, mut event: Event, cancel: &AtomicBool) -> bool {
        loop {
            match self.sender.send_timeout(event, Duration::from_millis(50)) {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(SendTimeoutError::Timeout(returned)) => {
                    if cancel.load(Ordering::Acquire) {
                        tracing::warn!(event_id = %returned.id(), "Event dropped: queue full at shutdown");
                        return false;
                    }
                    event = returned;
                }
                Err(SendTimeoutError::Disconnected(returned)) => {
                    tracing::error!(event_id = %returned.id(), "Event queue disconnected; event dropped");
                    return false;
                }
            }
        }
    }
}

/// State shared between the engine, its threads and its handles
struct Shared {
    config: EngineConfig,
    table: Mutex<DispatchTable>,
    ingress: Ingress,
    receiver: Receiver<Event>,
    running: AtomicBool,
    state: Mutex<EngineState>,
    dispatch_thread: Mutex<Option<ThreadId>>,
    reporter: Arc<dyn FailureReporter>,
    counters: Arc<Counters>,
    scheduler: Scheduler,
}

impl Shared {
    fn register(&self, listener: ListenerRef) -> bool {
        let name = listener.name().to_string();
        let added = self.table.lock().register(listener);
        if added {
            tracing::debug!(listener = %name, "Listener registered");
        }
        added
    }

    fn unregister(&self, listener: &ListenerRef) -> bool {
        let removed = self.table.lock().unregister(listener);
        if removed {
            tracing::debug!(listener = %listener.name(), "Listener unregistered");
        }
        removed
    }

    fn on_dispatch_thread(&self) -> bool {
        *self.dispatch_thread.lock() == Some(thread::current().id())
    }

    /// Deliver one event to every interested listener, in bucket order
    fn dispatch(&self, event: &Event) {
        let event_type = event.event_type();
        self.counters.record_dispatch(event_type);

        // Snapshot so handlers may (un)register without deadlocking
        let listeners = self.table.lock().snapshot(event_type);
        if listeners.is_empty() {
            tracing::trace!(event_type = %event_type, "No listeners for event");
            return;
        }

        for listener in &listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if listener.can_handle(event_type) {
                    listener.handle(event).map(|()| true)
                } else {
                    Ok(false)
                }
            }));

            let (detail, panicked) = match outcome {
                Ok(Ok(true)) => {
                    self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(Ok(false)) => continue,
                Ok(Err(err)) => (format!("{err:#}"), false),
                Err(payload) => (panic_message(payload.as_ref()), true),
            };

            self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
            self.report_failure(
                ListenerFailure {
                    listener: listener.name().to_string(),
                    event_type,
                    event_id: event.id(),
                    detail,
                    panicked,
                },
                event,
            );
        }
    }

    fn report_failure(&self, failure: ListenerFailure, event: &Event) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.reporter.report(&failure);

        if !self.config.publish_failures || is_failure_report(event) {
            return;
        }
        // Never block here: on the dispatch thread a full queue would wait on itself
        if let Err(err) = self.ingress.try_submit(failure.to_event()) {
            tracing::warn!(listener = %failure.listener, error = %err, "Could not publish listener failure");
        }
    }

    fn fail(&self, reason: &str) {
        self.running.store(false, Ordering::Release);
        *self.state.lock() = EngineState::Failed;
        tracing::error!(reason, "Event engine failed");
    }

    /// Post an engine-originated SYSTEM event without waiting for room
    fn post_system(&self, kind: &str) {
        if let Err(err) = self.ingress.try_submit(system_event(kind, None)) {
            tracing::warn!(kind, error = %err, "System event skipped");
        }
    }

    /// Body of the dispatch thread
    fn run(self: Arc<Self>) {
        let me = thread::current().id();
        *self.dispatch_thread.lock() = Some(me);
        tracing::debug!("Dispatch loop started");

        // Listener panics are caught per delivery; anything escaping here
        // came from the engine's own machinery (e.g. the failure reporter)
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch_loop())) {
            self.fail(&panic_message(payload.as_ref()));
        }

        let mut current = self.dispatch_thread.lock();
        if *current == Some(me) {
            *current = None;
        }
        tracing::debug!("Dispatch loop exited");
    }

    fn dispatch_loop(&self) {
        let poll_interval = self.config.poll_interval();
        while self.running.load(Ordering::Acquire) {
            match self.receiver.recv_timeout(poll_interval) {
                Ok(event) => self.dispatch(&event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.fail("event queue disconnected");
                    break;
                }
            }
        }
    }

    /// Deliver the events queued right now on the caller's thread
    fn drain(&self) -> Result<usize> {
        {
            let mut state = self.state.lock();
            match *state {
                EngineState::Running => return Err(EngineError::EngineRunning),
                EngineState::Draining => return Err(EngineError::EngineBusy),
                EngineState::Failed => return Err(EngineError::EngineFailed),
                EngineState::Stopped => {}
            }
            // A dispatch thread told to stop may still be finishing an event
            if self.dispatch_thread.lock().is_some() {
                return Err(EngineError::EngineBusy);
            }
            *state = EngineState::Draining;
        }

        let result = match panic::catch_unwind(AssertUnwindSafe(|| self.drain_backlog())) {
            Ok(result) => result,
            Err(payload) => {
                self.fail(&panic_message(payload.as_ref()));
                Err(EngineError::EngineFailed)
            }
        };

        let mut state = self.state.lock();
        if *state == EngineState::Draining {
            *state = EngineState::Stopped;
        }
        result
    }

    fn drain_backlog(&self) -> Result<usize> {
        let pending = self.receiver.len();
        let mut processed = 0;
        while processed < pending {
            match self.receiver.try_recv() {
                Ok(event) => {
                    self.dispatch(&event);
                    processed += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.fail("event queue disconnected");
                    return Err(EngineError::EngineFailed);
                }
            }
        }
        Ok(processed)
    }

    fn metrics(&self) -> EngineMetrics {
        let event_counts = self
            .counters
            .per_type
            .lock()
            .iter()
            .map(|(t, n)| (t.to_string(), *n))
            .collect();

        EngineMetrics {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            event_counts,
            queue_depth: self.receiver.len(),
            scheduled: self.scheduler.len(),
            listeners: self.table.lock().len(),
            state: *self.state.lock(),
        }
    }
}

/// `Ok(true)` if a start may proceed, `Ok(false)` if already running
fn startable(state: EngineState) -> Result<bool> {
    match state {
        EngineState::Stopped => Ok(true),
        EngineState::Running => Ok(false),
        EngineState::Draining => Err(EngineError::EngineBusy),
        EngineState::Failed => Err(EngineError::EngineFailed),
    }
}

/// ERROR events the engine emitted about a failed listener
fn is_failure_report(event: &Event) -> bool {
    event.event_type() == EventType::Error && event.source() == Some(ENGINE_SOURCE)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: <non-string payload>".to_string()
    }
}

fn system_event(kind: &str, extra: Option<(&str, serde_json::Value)>) -> Event {
    let mut data: Payload = HashMap::new();
    data.insert("kind".to_string(), json!(kind));
    if let Some((key, value)) = extra {
        data.insert(key.to_string(), value);
    }
    Event::with_source(EventType::System, data, ENGINE_SOURCE)
}

struct Heartbeat {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(shared: &Arc<Shared>, interval: Duration) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name(format!("{}-heartbeat", shared.config.thread_name))
            .spawn(move || {
                let mut tick = 0u64;
                // Dropping stop_tx disconnects the channel and ends the loop
                while let Err(RecvTimeoutError::Timeout) = stop_rx.recv_timeout(interval) {
                    if !shared.running.load(Ordering::Acquire) {
                        break;
                    }
                    tick += 1;
                    let event = system_event("heartbeat", Some(("tick", json!(tick))));
                    if let Err(err) = shared.ingress.try_submit(event) {
                        tracing::warn!(tick, error = %err, "Heartbeat skipped");
                    }
                }
            })?;
        Ok(Self { stop_tx, handle })
    }

    fn join(self) {
        drop(self.stop_tx);
        if self.handle.join().is_err() {
            tracing::error!("Heartbeat thread panicked");
        }
    }
}

#[derive(Default)]
struct Threads {
    worker: Option<JoinHandle<()>>,
    heartbeat: Option<Heartbeat>,
}

/// The event bus.
///
/// Created stopped. Events submitted while stopped stay queued until the
/// next [`start`](Self::start) or [`process_pending`](Self::process_pending).
/// Dropping the engine stops it.
pub struct EventEngine {
    shared: Arc<Shared>,
    /// Serialises start and stop
    threads: Mutex<Threads>,
}

impl Default for EventEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EventEngine {
    /// Create an engine reporting listener failures through `tracing`
    pub fn new(config: EngineConfig) -> Self {
        Self::with_reporter(config, Arc::new(TracingReporter))
    }

    /// Create an engine with a custom failure sink
    pub fn with_reporter(config: EngineConfig, reporter: Arc<dyn FailureReporter>) -> Self {
        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        let counters = Arc::new(Counters::default());
        let ingress = Ingress {
            sender,
            capacity: config.queue_capacity,
            counters: Arc::clone(&counters),
        };
        let scheduler = Scheduler::new(ingress.clone(), config.thread_name.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                table: Mutex::new(DispatchTable::new()),
                ingress,
                receiver,
                running: AtomicBool::new(false),
                state: Mutex::new(EngineState::Stopped),
                dispatch_thread: Mutex::new(None),
                reporter,
                counters,
                scheduler,
            }),
            threads: Mutex::new(Threads::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Cloneable handle for listeners that need to talk back to the bus
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Register a listener. Registering the same object twice is a no-op.
    ///
    /// Returns whether the listener was newly added.
    pub fn register(&self, listener: ListenerRef) -> bool {
        self.shared.register(listener)
    }

    /// Unregister a listener. Unknown listeners are ignored.
    ///
    /// Returns whether the listener was registered.
    pub fn unregister(&self, listener: &ListenerRef) -> bool {
        self.shared.unregister(listener)
    }

    /// Snapshot of registered listeners in registration order
    pub fn listeners(&self) -> Vec<ListenerRef> {
        self.shared.table.lock().listeners()
    }

    /// Put an event on the queue.
    ///
    /// With a bounded queue this waits for room. A listener submitting
    /// from inside `handle` into a full bounded queue would wait on the
    /// dispatch thread itself; use [`try_submit`](Self::try_submit) there.
    pub fn submit(&self, event: Event) {
        self.shared.ingress.submit(event);
    }

    /// Put an event on the queue without waiting
    pub fn try_submit(&self, event: Event) -> Result<()> {
        self.shared.ingress.try_submit(event)
    }

    /// Put an event on the queue once `delay` has elapsed
    pub fn submit_after(&self, event: Event, delay: Duration) -> Result<()> {
        self.shared.scheduler.schedule(event, delay)
    }

    /// Number of events waiting in the queue
    pub fn pending(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Number of events waiting on a delay
    pub fn scheduled(&self) -> usize {
        self.shared.scheduler.len()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.shared.metrics()
    }

    /// Start the dispatch thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        if self.shared.on_dispatch_thread() {
            // Cannot restart the loop from inside it
            return if self.is_running() {
                Ok(())
            } else {
                Err(EngineError::EngineBusy)
            };
        }

        let mut threads = self.threads.lock();
        if !startable(self.state())? {
            return Ok(());
        }

        // Reap threads left behind by a stop issued from inside a handler.
        // Their running flag is already down, so they exit on their own.
        Self::join_threads(&mut threads);

        {
            let mut state = self.shared.state.lock();
            if !startable(*state)? {
                return Ok(());
            }
            self.shared.running.store(true, Ordering::Release);
            *state = EngineState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.shared.config.thread_name.clone())
            .spawn(move || shared.run());
        match spawned {
            Ok(handle) => threads.worker = Some(handle),
            Err(err) => {
                self.mark_stopped();
                return Err(err.into());
            }
        }

        if let Some(interval) = self.shared.config.heartbeat_interval() {
            match Heartbeat::spawn(&self.shared, interval) {
                Ok(heartbeat) => threads.heartbeat = Some(heartbeat),
                Err(err) => {
                    self.mark_stopped();
                    Self::join_threads(&mut threads);
                    return Err(err);
                }
            }
        }

        if self.shared.config.lifecycle_events {
            self.shared.post_system("startup");
        }
        tracing::info!(
            thread = %self.shared.config.thread_name,
            queued = self.pending(),
            "Event engine started"
        );
        Ok(())
    }

    /// Stop the dispatch thread, waiting for its in-flight event to finish.
    ///
    /// Events still queued stay queued. No-op if already stopped. Called
    /// from inside a handler, this signals the loop and returns at once.
    pub fn stop(&self) {
        if self.shared.on_dispatch_thread() {
            self.mark_stopped();
            return;
        }

        let mut threads = self.threads.lock();
        let was_running = self.mark_stopped();
        Self::join_threads(&mut threads);

        if was_running {
            if self.shared.config.lifecycle_events {
                self.shared.post_system("shutdown");
            }
            tracing::info!(queued = self.pending(), "Event engine stopped");
        }
    }

    /// Deliver every event queued at call time, in order, on this thread.
    ///
    /// Fails with [`EngineError::EngineRunning`] while the dispatch thread
    /// runs. Events submitted by handlers during the drain stay queued.
    /// Returns the number of events processed.
    pub fn process_pending(&self) -> Result<usize> {
        self.shared.drain()
    }

    /// Flip Running to Stopped; returns whether it was running
    fn mark_stopped(&self) -> bool {
        self.shared.running.store(false, Ordering::Release);
        let mut state = self.shared.state.lock();
        if *state == EngineState::Running {
            *state = EngineState::Stopped;
            true
        } else {
            false
        }
    }

    fn join_threads(threads: &mut Threads) {
        if let Some(heartbeat) = threads.heartbeat.take() {
            heartbeat.join();
        }
        if let Some(worker) = threads.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Dispatch thread panicked");
            }
        }
    }
}

impl Drop for EventEngine {
    fn drop(&mut self) {
        self.stop();
        // Listeners holding handles back to the engine must not keep it alive
        self.shared.table.lock().clear();
    }
}

/// Cheap, cloneable access to an engine's registration and submission.
///
/// Holds the engine weakly: once the engine is dropped, submissions are
/// discarded and registration does nothing.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Weak<Shared>,
}

impl EngineHandle {
    pub fn register(&self, listener: ListenerRef) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.register(listener))
    }

    pub fn unregister(&self, listener: &ListenerRef) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.unregister(listener))
    }

    pub fn listeners(&self) -> Vec<ListenerRef> {
        self.shared
            .upgrade()
            .map(|shared| shared.table.lock().listeners())
            .unwrap_or_default()
    }

    pub fn submit(&self, event: Event) {
        match self.shared.upgrade() {
            Some(shared) => shared.ingress.submit(event),
            None => tracing::warn!(event_id = %event.id(), "Engine dropped; event discarded"),
        }
    }

    pub fn try_submit(&self, event: Event) -> Result<()> {
        self.shared
            .upgrade()
            .ok_or(EngineError::EngineDropped)?
            .ingress
            .try_submit(event)
    }

    pub fn submit_after(&self, event: Event, delay: Duration) -> Result<()> {
        self.shared
            .upgrade()
            .ok_or(EngineError::EngineDropped)?
            .scheduler
            .schedule(event, delay)
    }

    pub fn pending(&self) -> usize {
        self.shared
            .upgrade()
            .map_or(0, |shared| shared.receiver.len())
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.running.load(Ordering::Acquire))
    }
}
