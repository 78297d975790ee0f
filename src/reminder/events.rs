use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use serde::Serialize;

use crate::db::models::DoseRecord;

use super::{policy::AlertKind, state::Trigger};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DoseEvent {
    /// A record was registered and its first alert armed.
    Scheduled { record: DoseRecord },
    /// A transition was committed to the store.
    Changed { record: DoseRecord, trigger: Trigger },
    /// T-15 advisory should be shown.
    PreAlert { record: DoseRecord },
    /// The record newly needs a user decision.
    AlertDue { record: DoseRecord, alert: AlertKind },
    /// Records deleted in bulk (medication removal or retention cleanup).
    Removed { dose_ids: Vec<String> },
}

type Listener = Arc<dyn Fn(&DoseEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<BTreeMap<u64, Listener>>,
}

impl BusInner {
    fn listeners(&self) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
        match self.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Listener registry owned by one scheduler instance.
#[derive(Clone, Default)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DoseEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().insert(id, Arc::new(listener));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `event` to every listener registered at call time. Listeners
    /// run outside the registry lock, so they may subscribe or unsubscribe.
    pub fn publish(&self, event: &DoseEvent) {
        let listeners: Vec<Listener> = self.inner.listeners().values().cloned().collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

/// Handle returned by [`ChangeBus::subscribe`]. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners().remove(&self.id);
        }
    }
}
