//! Event bus and replay buffer (SPEC_FULL.md §4.G): every committed reading,
//! alert, or system update is pushed into a capped per-municipality ring
//! buffer and broadcast to live subscribers. A late-joining subscriber
//! replays from the buffer before following the live stream.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use tokio::sync::broadcast;

use crate::model::{Event, GLOBAL_SCOPE};

const DEFAULT_CAPACITY: usize = 500;
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct ScopedEvent {
    pub scope: String,
    pub event: Event,
}

pub struct EventBus {
    capacity: usize,
    buffers: RwLock<HashMap<String, VecDeque<Event>>>,
    sender: broadcast::Sender<ScopedEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { capacity, buffers: RwLock::new(HashMap::new()), sender }
    }

    /// Appends `event` to `scope`'s buffer and to the global buffer (unless
    /// `scope` already is `global`), then broadcasts it to live subscribers.
    /// Broadcasting after the ring buffer write means a replay-then-follow
    /// subscriber can never see a gap between the two.
    pub fn publish(&self, scope: &str, event: Event) {
        self.push_to_buffer(scope, event.clone());
        if scope != GLOBAL_SCOPE {
            self.push_to_buffer(GLOBAL_SCOPE, event.clone());
        }

        // No receivers is the common case between WebSocket connections; the
        // broadcast channel reports it as an error that is fine to ignore.
        let _ = self.sender.send(ScopedEvent { scope: scope.to_string(), event });
    }

    fn push_to_buffer(&self, scope: &str, event: Event) {
        let mut buffers = self.buffers.write().expect("event buffer lock poisoned");
        let buf = buffers.entry(scope.to_string()).or_insert_with(|| VecDeque::with_capacity(self.capacity));
        if buf.len() >= self.capacity {
            buf.pop_front();
        }
        buf.push_back(event);
    }

    /// The most recent `limit` events recorded for `scope`, oldest first.
    pub fn recent(&self, scope: &str, limit: usize) -> Vec<Event> {
        let buffers = self.buffers.read().expect("event buffer lock poisoned");
        match buffers.get(scope) {
            Some(buf) => buf.iter().rev().take(limit).rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// A live subscription; the caller filters by scope on each received
    /// item (subscribing to `global` sees everything).
    pub fn subscribe(&self) -> broadcast::Receiver<ScopedEvent> {
        self.sender.subscribe()
    }
}
