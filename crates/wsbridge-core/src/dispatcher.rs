//! Ordered, single-consumer event dispatch on a dedicated thread.
//!
//! An [`EventDispatcher`] owns one thread and an unbounded FIFO queue. Any
//! thread may [`enqueue`](EventDispatcher::enqueue) events; the dispatcher
//! thread hands them to a sink closure one at a time, in insertion order.
//! Deliveries never overlap.
//!
//! A panic raised by the sink is caught and logged, and the thread carries on
//! with the next event.
//!
//! # Stopping
//!
//! - [`dispose`](EventDispatcher::dispose) sets the stop flag and joins the
//!   thread. Undelivered events are discarded. Calling it on the dispatcher
//!   thread returns [`DispatchError::SelfDispose`].
//! - [`shutdown`](EventDispatcher::shutdown) is `dispose` that also works
//!   from the dispatcher thread, by handing the join to a helper thread.
//! - [`finish_with`](EventDispatcher::finish_with) queues a last event and an
//!   end marker. The thread delivers everything queued up to and including
//!   that event, then exits by itself.
//!
//! A dispatcher started with [`start_after`](EventDispatcher::start_after)
//! accepts events at once but delivers nothing until its predecessor has
//! exited, so two dispatchers feeding the same sinks never deliver
//! concurrently.
//!
//! ```
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use wsbridge_core::dispatcher::{DispatcherConfig, EventDispatcher};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink_seen = seen.clone();
//! let dispatcher = EventDispatcher::start(DispatcherConfig::with_name("doc-dispatch"), move |n: u32| {
//!     sink_seen.lock().push(n);
//! })
//! .unwrap();
//!
//! dispatcher.enqueue(1).unwrap();
//! dispatcher.finish_with(2).unwrap();
//! assert!(dispatcher.join_drained());
//! assert_eq!(*seen.lock(), vec![1, 2]);
//! ```

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::error::DispatchError;
use crate::logging::{panic_message, targets};
use crate::thread_check::{ThreadAffinity, ThreadRole, enter_role};

/// Default time the dispatcher waits on an empty queue before re-checking
/// its stop flag.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(1);

/// Configuration for an [`EventDispatcher`] thread.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for the dispatcher thread.
    pub name: String,
    /// Id of the object the dispatcher works for; the thread is tagged with
    /// [`ThreadRole::Dispatcher`] for this owner.
    pub owner: u64,
    /// How long to wait on an empty queue before re-checking the stop flag.
    pub idle_wait: Duration,
    /// Stack size for the thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "wsbridge-dispatch".to_string(),
            owner: 0,
            idle_wait: DEFAULT_IDLE_WAIT,
            stack_size: None,
        }
    }
}

impl DispatcherConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the owner id.
    pub fn owner(mut self, owner: u64) -> Self {
        self.owner = owner;
        self
    }

    /// Set the idle wait.
    pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }
}

enum Envelope<E> {
    Deliver(E),
    Finish,
}

/// State shared between the handle and the dispatcher thread.
struct DispatchState {
    stop: AtomicBool,
    finishing: AtomicBool,
    running: AtomicBool,
    delivered: AtomicU64,
}

/// A dedicated thread delivering queued events to a sink, one at a time.
pub struct EventDispatcher<E: Send + 'static> {
    sender: Sender<Envelope<E>>,
    /// Held across the closed check and the send, so no event can land
    /// behind the end marker. `true` once `finish_with` has run.
    gate: Mutex<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    affinity: ThreadAffinity,
    state: Arc<DispatchState>,
    name: String,
}

impl<E: Send + 'static> EventDispatcher<E> {
    /// Spawn the dispatcher thread. `sink` runs on that thread for every
    /// delivered event.
    pub fn start<F>(config: DispatcherConfig, sink: F) -> io::Result<Self>
    where
        F: FnMut(E) + Send + 'static,
    {
        Self::start_after(config, None, sink)
    }

    /// Spawn the dispatcher thread behind `predecessor`.
    ///
    /// Events can be queued immediately. The thread waits for the
    /// predecessor's thread to exit before its first delivery, and gives up
    /// waiting if it is stopped first.
    pub fn start_after<F>(
        config: DispatcherConfig,
        predecessor: Option<Arc<EventDispatcher<E>>>,
        sink: F,
    ) -> io::Result<Self>
    where
        F: FnMut(E) + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let state = Arc::new(DispatchState {
            stop: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            running: AtomicBool::new(true),
            delivered: AtomicU64::new(0),
        });

        let thread_state = state.clone();
        let thread_name = config.name.clone();
        let owner = config.owner;
        let idle_wait = config.idle_wait;

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder.spawn(move || {
            let _role = enter_role(owner, ThreadRole::Dispatcher);
            if let Some(previous) = predecessor {
                wait_for_predecessor(&previous, &thread_state, idle_wait, &thread_name);
            }
            dispatch_loop(&receiver, &thread_state, idle_wait, sink, &thread_name);
            thread_state.running.store(false, Ordering::Release);
        })?;

        tracing::debug!(target: targets::DISPATCHER, name = %config.name, owner, "dispatcher started");

        Ok(Self {
            sender,
            gate: Mutex::new(false),
            affinity: ThreadAffinity::of(handle.thread()),
            handle: Mutex::new(Some(handle)),
            state,
            name: config.name,
        })
    }

    /// The dispatcher thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the dispatcher thread is still running.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Check if the caller is running on the dispatcher thread.
    pub fn is_current_thread(&self) -> bool {
        self.affinity.is_same_thread()
    }

    /// Number of events queued and not yet taken by the dispatcher thread.
    pub fn pending_events(&self) -> usize {
        self.sender.len()
    }

    /// Number of events handed to the sink so far, including ones whose
    /// delivery panicked.
    pub fn delivered_events(&self) -> u64 {
        self.state.delivered.load(Ordering::Acquire)
    }

    /// Queue an event for delivery.
    pub fn enqueue(&self, event: E) -> Result<(), DispatchError> {
        let finished = self.gate.lock();
        if *finished || self.state.stop.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }
        self.sender
            .send(Envelope::Deliver(event))
            .map_err(|_| DispatchError::Stopped)
    }

    /// Queue a final event. The thread delivers everything queued before it,
    /// then `event`, then exits. Later `enqueue` calls fail.
    pub fn finish_with(&self, event: E) -> Result<(), DispatchError> {
        let mut finished = self.gate.lock();
        if *finished || self.state.stop.load(Ordering::Acquire) {
            return Err(DispatchError::Stopped);
        }
        *finished = true;
        self.state.finishing.store(true, Ordering::Release);
        self.sender
            .send(Envelope::Deliver(event))
            .and_then(|()| self.sender.send(Envelope::Finish))
            .map_err(|_| DispatchError::Stopped)
    }

    /// Stop the dispatcher and wait for its thread to exit.
    ///
    /// The delivery in progress (if any) completes; queued events are
    /// discarded. Returns `Ok(true)` if this call joined the thread and it
    /// exited normally, `Ok(false)` if it was already joined.
    pub fn dispose(&self) -> Result<bool, DispatchError> {
        if self.is_current_thread() {
            return Err(DispatchError::SelfDispose);
        }
        self.state.stop.store(true, Ordering::Release);
        Ok(self.join())
    }

    /// Wait for a finishing dispatcher to drain and exit, without setting the
    /// stop flag. Returns `false` when called on the dispatcher thread or when
    /// the thread was already joined.
    pub fn join_drained(&self) -> bool {
        if self.is_current_thread() {
            return false;
        }
        self.join()
    }

    /// Dispose from any thread.
    ///
    /// On the dispatcher thread the stop flag is set immediately and a helper
    /// thread performs the join once the current delivery returns.
    pub fn shutdown(self: Arc<Self>) {
        if !self.is_current_thread() {
            let _ = self.dispose();
            return;
        }

        self.state.stop.store(true, Ordering::Release);
        let name = format!("{}-teardown", self.name);
        let dispatcher = self.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let _ = dispatcher.dispose();
        });
        if let Err(err) = spawned {
            tracing::warn!(
                target: targets::DISPATCHER,
                name = %self.name,
                error = %err,
                "could not spawn teardown thread; dispatcher thread will exit unjoined"
            );
        }
    }

    /// Retire a finishing dispatcher: a helper thread waits for it to drain
    /// and joins it.
    pub fn retire(self: Arc<Self>) {
        let name = format!("{}-retire", self.name);
        let dispatcher = self.clone();
        let spawned = thread::Builder::new().name(name).spawn(move || {
            dispatcher.join_drained();
        });
        if let Err(err) = spawned {
            tracing::warn!(
                target: targets::DISPATCHER,
                name = %self.name,
                error = %err,
                "could not spawn retire thread; dispatcher thread will exit unjoined"
            );
        }
    }

    fn join(&self) -> bool {
        let handle = self.handle.lock().take();
        match handle {
            Some(h) => match h.join() {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(target: targets::DISPATCHER, name = %self.name, "dispatcher thread panicked");
                    false
                }
            },
            None => false,
        }
    }
}

impl<E: Send + 'static> Drop for EventDispatcher<E> {
    fn drop(&mut self) {
        // Don't block in drop. A finishing dispatcher is left to drain.
        if !self.state.finishing.load(Ordering::Acquire) {
            self.state.stop.store(true, Ordering::Release);
        }
    }
}

fn wait_for_predecessor<E: Send + 'static>(
    previous: &EventDispatcher<E>,
    state: &DispatchState,
    idle_wait: Duration,
    name: &str,
) {
    if previous.is_running() {
        tracing::debug!(target: targets::DISPATCHER, name, previous = %previous.name, "waiting for previous dispatcher to drain");
    }
    while previous.is_running() {
        if state.stop.load(Ordering::Acquire) {
            return;
        }
        thread::sleep(idle_wait);
    }
    previous.join_drained();
}

fn dispatch_loop<E, F>(
    receiver: &Receiver<Envelope<E>>,
    state: &DispatchState,
    idle_wait: Duration,
    mut sink: F,
    name: &str,
) where
    F: FnMut(E),
{
    while !state.stop.load(Ordering::Acquire) {
        match receiver.recv_timeout(idle_wait) {
            Ok(Envelope::Deliver(event)) => {
                if state.stop.load(Ordering::Acquire) {
                    break;
                }
                state.delivered.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(target: targets::DISPATCHER, name, "delivering event");
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink(event))) {
                    tracing::error!(
                        target: targets::DISPATCHER,
                        name,
                        panic = %panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
            Ok(Envelope::Finish) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let discarded = receiver.len();
    tracing::debug!(target: targets::DISPATCHER, name, discarded, "dispatcher stopped");
}
