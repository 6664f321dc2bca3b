//! Best-effort pub/sub fan-out.
//!
//! A [`Tower`] hands every published event to all subscribers through the
//! bounded slot each subscriber supplied. Sends never block: a full slot
//! drops the event for that subscriber only, and a closed slot is pruned.
//! Delivery is not guaranteed across subscriber churn.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::endpoint::EndpointId;

/// Fan-out of reconnect-needed notifications, tagged with the endpoint that
/// lost its connection.
pub type ReconnectTower = Tower<EndpointId>;

/// Handle returned by [`Tower::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of a single [`Tower::publish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers whose slot accepted the event.
    pub delivered: usize,
    /// Subscribers whose slot was full.
    pub dropped: usize,
    /// Subscribers removed because their receiver was gone.
    pub pruned: usize,
}

pub struct Tower<T> {
    name: Arc<str>,
    inner: Arc<Mutex<TowerInner<T>>>,
}

struct TowerInner<T> {
    next_id: u64,
    subscribers: Vec<(SubscriptionId, mpsc::Sender<T>)>,
}

impl<T: Clone + Send + 'static> Tower<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::new(Mutex::new(TowerInner {
                next_id: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a delivery slot. The slot's capacity bounds how many events
    /// can be pending for this subscriber before further ones are dropped.
    pub fn subscribe(&self, slot: mpsc::Sender<T>) -> SubscriptionId {
        let mut inner = self.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.push((id, slot));
        debug!(tower = %self.name, subscription = id.0, "Subscriber added");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|(sub, _)| *sub != id);
        let removed = inner.subscribers.len() != before;
        drop(inner);
        if removed {
            debug!(tower = %self.name, subscription = id.0, "Subscriber removed");
        }
        removed
    }

    /// Offer `event` to every subscriber without waiting on any of them.
    pub fn publish(&self, event: T) -> PublishReport {
        let mut report = PublishReport::default();
        let mut inner = self.lock();
        inner.subscribers.retain(|(id, slot)| match slot.try_send(event.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                trace!(subscription = id.0, "Subscriber slot full, dropping event");
                report.dropped += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                report.pruned += 1;
                false
            }
        });
        drop(inner);
        debug!(
            tower = %self.name,
            delivered = report.delivered,
            dropped = report.dropped,
            pruned = report.pruned,
            "Event published"
        );
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, TowerInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Clone for Tower<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Tower<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tower").field("name", &self.name).finish_non_exhaustive()
    }
}
