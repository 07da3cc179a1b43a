//! Event Runner: the indexed, bounded, fan-out log of one operation.
//!
//! Every event gets the next index, lands in a FIFO buffer capped at
//! `buffer_cap`, and is handed synchronously to each attached listener.
//! A listener that returns an error is treated as a dead connection and
//! detached; the event is still buffered and delivered to the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tether_core::events::{EventPayload, OperationKind, RunStatus, RunnerEvent};
use tether_core::ids::{OperationId, SessionId};

use crate::backend::Interrupter;

/// Returned by a listener whose connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerClosed;

pub type Listener = dyn Fn(&RunnerEvent) -> Result<(), ListenerClosed> + Send + Sync;

/// Opaque handle identifying one attached listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of [`EventRunner::replay_from`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    pub events: Vec<RunnerEvent>,
    /// Some requested events were evicted and cannot be recovered.
    pub gap: bool,
    /// The terminal `done` event has already been published.
    pub finished: bool,
}

struct RunnerInner {
    status: RunStatus,
    next_index: u64,
    buffer: VecDeque<RunnerEvent>,
    listeners: Vec<(ListenerId, Arc<Listener>)>,
    last_detached_at: Option<Instant>,
    interrupt_requested_at: Option<Instant>,
    finished: bool,
}

pub struct EventRunner {
    operation_id: OperationId,
    kind: OperationKind,
    session_id: RwLock<SessionId>,
    buffer_cap: usize,
    created_at: Instant,
    cancel: CancellationToken,
    inner: Mutex<RunnerInner>,
    /// Held across index assignment and delivery so listeners observe events
    /// in index order, and so replay-then-attach cannot interleave with a
    /// publish. Reentrant so a listener may itself publish.
    publish: ReentrantMutex<()>,
    next_listener: AtomicU64,
    interrupter: Mutex<Option<Arc<dyn Interrupter>>>,
}

impl EventRunner {
    pub fn new(
        operation_id: OperationId,
        session_id: SessionId,
        kind: OperationKind,
        buffer_cap: usize,
    ) -> Self {
        Self {
            operation_id,
            kind,
            session_id: RwLock::new(session_id),
            buffer_cap,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            inner: Mutex::new(RunnerInner {
                status: RunStatus::Running,
                next_index: 0,
                buffer: VecDeque::with_capacity(buffer_cap.min(1024)),
                listeners: Vec::new(),
                last_detached_at: None,
                interrupt_requested_at: None,
                finished: false,
            }),
            publish: ReentrantMutex::new(()),
            next_listener: AtomicU64::new(0),
            interrupter: Mutex::new(None),
        }
    }

    pub fn operation_id(&self) -> &OperationId {
        &self.operation_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id.read().clone()
    }

    pub(crate) fn set_session_id(&self, session_id: SessionId) {
        *self.session_id.write() = session_id;
    }

    pub fn buffer_cap(&self) -> usize {
        self.buffer_cap
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Append an event and deliver it to every attached listener.
    pub fn buffer_event(&self, payload: EventPayload) -> RunnerEvent {
        let _publish = self.publish.lock();

        let (event, listeners) = {
            let mut inner = self.inner.lock();
            let event = RunnerEvent {
                index: inner.next_index,
                payload,
            };
            inner.next_index += 1;
            inner.finished |= event.payload.is_done();
            inner.buffer.push_back(event.clone());
            while inner.buffer.len() > self.buffer_cap {
                inner.buffer.pop_front();
            }
            (event, inner.listeners.clone())
        };

        let dead: Vec<ListenerId> = listeners
            .iter()
            .filter(|(_, listener)| listener(&event).is_err())
            .map(|(id, _)| *id)
            .collect();

        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            inner.listeners.retain(|(id, _)| !dead.contains(id));
            inner.last_detached_at = Some(Instant::now());
            tracing::debug!(
                operation_id = %self.operation_id,
                dropped = dead.len(),
                "detached dead listeners"
            );
        }

        event
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&RunnerEvent) -> Result<(), ListenerClosed> + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.lock().listeners.push((id, Arc::new(listener)));
        id
    }

    /// Detach a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        let removed = inner.listeners.len() != before;
        if removed {
            inner.last_detached_at = Some(Instant::now());
        }
        removed
    }

    pub fn replay_from(&self, index: u64) -> Replay {
        let inner = self.inner.lock();
        match inner.buffer.front() {
            None => Replay {
                events: Vec::new(),
                gap: index < inner.next_index,
                finished: inner.finished,
            },
            Some(first) => Replay {
                gap: index < first.index,
                finished: inner.finished,
                events: inner
                    .buffer
                    .iter()
                    .filter(|e| e.index >= index)
                    .cloned()
                    .collect(),
            },
        }
    }

    /// Replay from `index` and attach `listener` with no publish in between,
    /// so the caller sees every event exactly once.
    pub fn replay_and_listen<F>(&self, index: u64, listener: F) -> (Replay, ListenerId)
    where
        F: Fn(&RunnerEvent) -> Result<(), ListenerClosed> + Send + Sync + 'static,
    {
        let _publish = self.publish.lock();
        let replay = self.replay_from(index);
        let id = self.add_listener(listener);
        (replay, id)
    }

    /// Replay plus a channel-backed live subscription. The listener is
    /// detached when the returned [`Subscription`] drops, or as soon as the
    /// channel is full or closed.
    pub fn subscribe(
        self: &Arc<Self>,
        from: u64,
        capacity: usize,
    ) -> (Replay, mpsc::Receiver<RunnerEvent>, Subscription) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (replay, id) = self.replay_and_listen(from, move |event| {
            tx.try_send(event.clone()).map_err(|_| ListenerClosed)
        });
        let subscription = Subscription {
            runner: Arc::downgrade(self),
            id,
        };
        (replay, rx, subscription)
    }

    pub fn status(&self) -> RunStatus {
        self.inner.lock().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == RunStatus::Running
    }

    /// Move to a terminal status. Only the first call wins.
    pub fn set_status(&self, status: RunStatus) -> bool {
        if !status.is_terminal() {
            return false;
        }
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = status;
        true
    }

    /// Total events ever emitted, including evicted ones.
    pub fn event_count(&self) -> u64 {
        self.inner.lock().next_index
    }

    pub fn buffered_len(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    pub fn first_buffered_index(&self) -> Option<u64> {
        self.inner.lock().buffer.front().map(|e| e.index)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// When this runner last became unattended: creation, or the most recent
    /// listener detach.
    pub fn unattended_since(&self) -> Instant {
        let inner = self.inner.lock();
        match inner.last_detached_at {
            Some(at) if at > self.created_at => at,
            _ => self.created_at,
        }
    }

    pub fn set_interrupter(&self, interrupter: Option<Arc<dyn Interrupter>>) {
        *self.interrupter.lock() = interrupter;
    }

    pub fn interrupter(&self) -> Option<Arc<dyn Interrupter>> {
        self.interrupter.lock().clone()
    }

    /// Record a graceful interrupt request, returning the previous one.
    pub(crate) fn note_interrupt_request(&self, at: Instant) -> Option<Instant> {
        self.inner.lock().interrupt_requested_at.replace(at)
    }

    pub fn is_interrupting(&self) -> bool {
        let inner = self.inner.lock();
        inner.status == RunStatus::Running && inner.interrupt_requested_at.is_some()
    }
}

impl std::fmt::Debug for EventRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRunner")
            .field("operation_id", &self.operation_id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("event_count", &self.event_count())
            .finish()
    }
}

/// Detaches its listener on drop. Holds only a weak reference, so an open
/// connection never keeps a reaped runner alive.
pub struct Subscription {
    runner: Weak<EventRunner>,
    id: ListenerId,
}

impl Subscription {
    pub fn listener_id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.upgrade() {
            runner.remove_listener(self.id);
        }
    }
}
