//! Group broadcast fabric
//!
//! Maps a group address to the live connections subscribed to it and fans
//! published events out to each of them. Every subscriber owns a bounded
//! queue; the fabric only ever holds the sending half.
//!
//! [`GroupFabric`] is the seam: [`InProcessFabric`] serves a single node,
//! a pub/sub backed implementation can replace it without touching the
//! channel logic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use lms_chat_shared::GroupEvent;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Sending half of a subscriber's delivery queue
pub type DeliveryHandle = mpsc::Sender<GroupEvent>;

/// Identifies one subscription within the fabric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Publish/subscribe registry keyed by group address.
///
/// Implementations must be safe under concurrent use from any number of
/// connection tasks. Sequential publishes from one caller reach each
/// subscriber in publish order.
#[async_trait]
pub trait GroupFabric: Send + Sync + 'static {
    /// Register `handle` as a subscriber of `group`
    fn subscribe(&self, group: &str, handle: DeliveryHandle) -> SubscriptionId;

    /// Remove a subscription. Unknown ids are ignored.
    fn unsubscribe(&self, group: &str, id: SubscriptionId);

    /// Deliver `event` to every current subscriber of `group`.
    ///
    /// Returns how many subscribers accepted the event. A group with no
    /// subscribers is not an error.
    async fn publish(&self, group: &str, event: GroupEvent) -> anyhow::Result<usize>;

    /// Live subscriptions for `group`
    fn subscriber_count(&self, group: &str) -> usize;

    /// Groups with at least one subscriber
    fn group_count(&self) -> usize;
}

/// Single-process fabric backed by a concurrent map
#[derive(Default)]
pub struct InProcessFabric {
    groups: DashMap<String, HashMap<SubscriptionId, DeliveryHandle>>,
    next_id: AtomicU64,
}

impl InProcessFabric {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupFabric for InProcessFabric {
    fn subscribe(&self, group: &str, handle: DeliveryHandle) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(id, handle);
        debug!("Subscribed {:?} to {}", id, group);
        id
    }

    fn unsubscribe(&self, group: &str, id: SubscriptionId) {
        let now_empty = match self.groups.get_mut(group) {
            Some(mut entry) => {
                if entry.remove(&id).is_some() {
                    debug!("Unsubscribed {:?} from {}", id, group);
                }
                entry.is_empty()
            }
            None => return,
        };
        if now_empty {
            self.groups.remove_if(group, |_, subs| subs.is_empty());
        }
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> anyhow::Result<usize> {
        // Snapshot the handles so no shard lock is held while delivering
        let targets: Vec<(SubscriptionId, DeliveryHandle)> = match self.groups.get(group) {
            Some(entry) => entry.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return Ok(0),
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Delivery queue full for {:?} in {}, dropping event", id, group);
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        for id in closed {
            self.unsubscribe(group, id);
        }

        Ok(delivered)
    }

    fn subscriber_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|e| e.len()).unwrap_or(0)
    }

    fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// A live subscription. Dropping it unsubscribes.
///
/// Held by the connection task, so the fabric is cleaned up on every exit
/// path including errors, panics and task aborts.
pub struct Subscription {
    fabric: Arc<dyn GroupFabric>,
    group: String,
    id: SubscriptionId,
}

impl Subscription {
    pub fn open(fabric: Arc<dyn GroupFabric>, group: impl Into<String>, handle: DeliveryHandle) -> Self {
        let group = group.into();
        let id = fabric.subscribe(&group, handle);
        Self { fabric, group, id }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.fabric.unsubscribe(&self.group, self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("group", &self.group)
            .field("id", &self.id)
            .finish()
    }
}
