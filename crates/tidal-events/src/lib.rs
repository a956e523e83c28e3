//! Tidal Events - Asynchronous event dispatch for the scheduler
//!
//! Provides:
//! - A bounded, single-consumer event queue with drop accounting
//! - Ordered dispatch to registered listeners on a dedicated thread

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use tidal_common::error::{Error, Result};
use tidal_common::metrics::{record_event_dropped, record_event_posted};

/// Minimum interval between dropped-event warnings
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Receives every event posted to a queue, in post order
pub trait EventListener<E>: Send + Sync {
    fn on_event(&self, event: &E);
}

enum Message<E> {
    Event(E),
    /// Stop sentinel; the consumer exits when it dequeues it
    PoisonPill,
}

struct DropReport {
    last_report: Instant,
    dropped_at_last_report: usize,
}

/// An asynchronous, bounded queue of events dispatched to listeners on a
/// dedicated consumer thread.
///
/// Life cycle: created, then `start`, then `stop`. Posting to a stopped
/// queue silently discards the event; posting to a full queue drops the
/// event and counts it instead of blocking the producer.
pub struct AsyncEventQueue<E: Send + 'static> {
    name: String,
    sender: Sender<Message<E>>,
    receiver: Receiver<Message<E>>,
    listeners: Arc<RwLock<Vec<Arc<dyn EventListener<E>>>>>,
    started: AtomicBool,
    stopped: Arc<AtomicBool>,
    /// Events posted but not yet fully dispatched, including the stop sentinel
    event_count: Arc<AtomicUsize>,
    dropped_events: AtomicUsize,
    logged_drop_once: AtomicBool,
    drop_report: Mutex<DropReport>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Send + 'static> AsyncEventQueue<E> {
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            name: name.into(),
            sender,
            receiver,
            listeners: Arc::new(RwLock::new(Vec::new())),
            started: AtomicBool::new(false),
            stopped: Arc::new(AtomicBool::new(false)),
            event_count: Arc::new(AtomicUsize::new(0)),
            dropped_events: AtomicUsize::new(0),
            logged_drop_once: AtomicBool::new(false),
            drop_report: Mutex::new(DropReport {
                last_report: Instant::now(),
                dropped_at_last_report: 0,
            }),
            consumer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a listener. Listeners receive events in registration order.
    pub fn add_listener(&self, listener: Arc<dyn EventListener<E>>) {
        self.listeners.write().push(listener);
    }

    /// Unregister a previously added listener
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener<E>>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Start the consumer thread. May only be called once.
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "Event queue {} already stopped",
                self.name
            )));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "Event queue {} already started",
                self.name
            )));
        }

        let name = self.name.clone();
        let receiver = self.receiver.clone();
        let listeners = Arc::clone(&self.listeners);
        let event_count = Arc::clone(&self.event_count);

        let handle = std::thread::Builder::new()
            .name(format!("tidal-events-{name}"))
            .spawn(move || {
                debug!("Event queue {} consumer started", name);
                while let Ok(message) = receiver.recv() {
                    match message {
                        Message::Event(event) => {
                            let listeners = listeners.read();
                            for listener in listeners.iter() {
                                let outcome = std::panic::catch_unwind(
                                    std::panic::AssertUnwindSafe(|| listener.on_event(&event)),
                                );
                                if outcome.is_err() {
                                    error!("Listener on queue {} panicked on event", name);
                                }
                            }
                            drop(listeners);
                            event_count.fetch_sub(1, Ordering::SeqCst);
                        }
                        Message::PoisonPill => {
                            event_count.fetch_sub(1, Ordering::SeqCst);
                            break;
                        }
                    }
                }
                debug!("Event queue {} consumer exiting", name);
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn consumer thread: {e}")))?;

        *self.consumer.lock() = Some(handle);
        info!("Event queue {} started", self.name);
        Ok(())
    }

    /// Post an event without blocking. Discarded silently after `stop`;
    /// dropped with accounting when the queue is full.
    pub fn post(&self, event: E) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        self.event_count.fetch_add(1, Ordering::SeqCst);
        match self.sender.try_send(Message::Event(event)) {
            Ok(()) => {
                record_event_posted(&self.name);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.event_count.fetch_sub(1, Ordering::SeqCst);
                self.on_drop();
            }
        }
    }

    fn on_drop(&self) {
        let dropped = self.dropped_events.fetch_add(1, Ordering::SeqCst) + 1;
        record_event_dropped(&self.name);

        if !self.logged_drop_once.swap(true, Ordering::SeqCst) {
            error!(
                "Dropping event from queue {}. This likely means one of the \
                 listeners is too slow and cannot keep up with the rate at \
                 which events are being posted.",
                self.name
            );
        }

        let mut report = self.drop_report.lock();
        if report.last_report.elapsed() >= DROP_REPORT_INTERVAL {
            let since_last = dropped - report.dropped_at_last_report;
            warn!(
                "Dropped {} events from {} since the last report",
                since_last, self.name
            );
            report.last_report = Instant::now();
            report.dropped_at_last_report = dropped;
        }
    }

    /// Stop the consumer by enqueueing the stop sentinel and joining the
    /// thread. Events posted after this call are discarded. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!(
                "Attempted to stop queue {} that was not started",
                self.name
            )));
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            // A second stop finds the sentinel already enqueued
            return Ok(());
        }

        self.event_count.fetch_add(1, Ordering::SeqCst);
        // Blocking send: the sentinel must not be dropped by a full queue
        self.sender
            .send(Message::PoisonPill)
            .map_err(|_| Error::Internal(format!("Queue {} consumer is gone", self.name)))?;

        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
        info!("Event queue {} stopped", self.name);
        Ok(())
    }

    /// Block until every posted event has been dispatched, or the deadline
    /// elapses. Returns whether the queue drained.
    pub fn wait_until_empty(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while self.event_count.load(Ordering::SeqCst) > 0 {
            if start.elapsed() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Events dropped by a full queue since creation
    pub fn dropped_count(&self) -> usize {
        self.dropped_events.load(Ordering::SeqCst)
    }

    /// Events posted but not yet dispatched
    pub fn pending_count(&self) -> usize {
        self.event_count.load(Ordering::SeqCst)
    }
}
