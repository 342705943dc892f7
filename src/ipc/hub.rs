//! Single-listener action sink
//!
//! The polling loop hands every routed action to the hub. At most one UI
//! listener is attached at a time; delivery never blocks, an action that cannot
//! be delivered right now is dropped and never replayed.

use crate::mapping::Action;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Anything the polling loop can push actions into.
pub trait ActionSink: Send + Sync {
    fn send(&self, action: Action) -> Delivery;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Nobody is attached; the action is gone
    NoListener,
    /// The listener queue is full; the action is gone
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// Another UI attached in its place
    Replaced,
    /// The UI asked to detach
    Requested,
    /// The daemon is stopping
    Shutdown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Action(Action),
    Detached(DetachReason),
}

/// Receiving end handed to whoever attached.
#[derive(Debug)]
pub struct Listener {
    pub id: u64,
    pub events: mpsc::Receiver<ListenerEvent>,
}

struct Slot {
    id: u64,
    sender: mpsc::Sender<ListenerEvent>,
}

pub struct ActionHub {
    slot: Mutex<Option<Slot>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl ActionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new listener, replacing (and notifying) the current one.
    pub fn attach(&self) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, events) = mpsc::channel(self.capacity);

        if self.closed.load(Ordering::Acquire) {
            let _ = sender.try_send(ListenerEvent::Detached(DetachReason::Shutdown));
            return Listener { id, events };
        }

        let previous = self.lock().replace(Slot { id, sender });
        if let Some(previous) = previous {
            info!("Listener {} replaced by listener {}", previous.id, id);
            let _ = previous
                .sender
                .try_send(ListenerEvent::Detached(DetachReason::Replaced));
        } else {
            info!("Listener {} attached", id);
        }
        Listener { id, events }
    }

    /// Detaches `id` if it is still the attached listener.
    pub fn detach(&self, id: u64) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(current) if current.id == id => {
                *slot = None;
                info!("Listener {} detached", id);
                true
            }
            _ => false,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.lock().is_some()
    }

    /// Notifies the listener that the daemon is going away and refuses new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(current) = self.lock().take() {
            debug!("Notifying listener {} of shutdown", current.id);
            let _ = current
                .sender
                .try_send(ListenerEvent::Detached(DetachReason::Shutdown));
        }
    }
}

impl ActionSink for ActionHub {
    fn send(&self, action: Action) -> Delivery {
        let mut slot = self.lock();
        let Some(current) = slot.as_ref() else {
            return Delivery::NoListener;
        };

        match current.sender.try_send(ListenerEvent::Action(action)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                warn!("Listener {} is not keeping up, dropping {:?}", current.id, action);
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => {
                info!("Listener {} went away, resetting", current.id);
                *slot = None;
                Delivery::NoListener
            }
        }
    }
}
