//! Shared subscription registry.
//!
//! Subscriptions are the one resource shared between connections: however
//! many connections subscribe to a topic, the middleware sees a single
//! subscription.  Each inbound message is fanned out, in registration order,
//! to every connection registered on the topic.
//!
//! The registry is constructed once per server and handed to every
//! connection behind an [`Arc`].
//!
//! # Locking
//!
//! Two levels: the entry map, and one fan-out list per topic.  The
//! middleware's delivery callback only ever takes the fan-out lock, and it
//! copies the listeners out before calling them, so a listener may re-enter
//! the registry or the node without deadlocking.  Callers holding the map
//! lock may call into the node, never the other way round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ros2web_middleware::{MessageCallback, Node, Subscription};
use ros2web_types::BridgeError;
use serde_json::Value;
use tracing::debug;

use crate::handle::ResourceHandle;

/// Per-connection delivery target, called with `(topic, msg)`.
pub type DeliveryCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

type Fanout = Arc<Mutex<Vec<(String, DeliveryCallback)>>>;

struct SharedSubscription {
    msg_type: String,
    handle: ResourceHandle<Box<dyn Subscription>>,
    fanout: Fanout,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The one subscription table shared by every connection of a server.
///
/// Entries are keyed by topic name as the client sent it.  Each entry owns a
/// single middleware subscription, ref-counted by the number of connections
/// registered on it, and the ordered list of those connections' delivery
/// callbacks.  The entry, and the middleware subscription with it, goes away
/// when the last connection leaves.
pub struct SubscriptionRegistry {
    node: Arc<dyn Node>,
    entries: Mutex<HashMap<String, SharedSubscription>>,
}

impl SubscriptionRegistry {
    /// An empty registry creating its subscriptions on `node`.
    pub fn new(node: Arc<dyn Node>) -> Self {
        Self {
            node,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register `connection_id` on `topic`, creating the middleware
    /// subscription if this is the first registrant.
    ///
    /// Registering a connection that is already on the topic is a no-op.
    /// A different `msg_type` than the one the topic is shared with is a
    /// [`BridgeError::TypeConflict`].
    pub fn create_subscription(
        &self,
        msg_type: &str,
        topic: &str,
        connection_id: &str,
        callback: DeliveryCallback,
    ) -> Result<(), BridgeError> {
        let mut entries = lock(&self.entries);

        if let Some(entry) = entries.get_mut(topic) {
            if entry.msg_type != msg_type {
                return Err(BridgeError::TypeConflict {
                    name: topic.to_string(),
                    existing: entry.msg_type.clone(),
                    requested: msg_type.to_string(),
                });
            }
            let mut fanout = lock(&entry.fanout);
            if fanout.iter().any(|(id, _)| id == connection_id) {
                return Ok(());
            }
            fanout.push((connection_id.to_string(), callback));
            drop(fanout);
            entry.handle.retain();
            debug!(
                topic,
                connection = connection_id,
                subscribers = entry.handle.count(),
                "joined shared subscription"
            );
            return Ok(());
        }

        let fanout: Fanout = Arc::new(Mutex::new(vec![(connection_id.to_string(), callback)]));
        let on_message: MessageCallback = {
            let fanout = Arc::clone(&fanout);
            let topic = topic.to_string();
            Arc::new(move |msg: &Value| {
                let listeners: Vec<DeliveryCallback> =
                    lock(&fanout).iter().map(|(_, cb)| Arc::clone(cb)).collect();
                for listener in listeners {
                    listener(&topic, msg);
                }
            })
        };

        let subscription = self.node.create_subscription(msg_type, topic, on_message)?;
        let node = Arc::clone(&self.node);
        let handle = ResourceHandle::new(subscription, move |s| node.destroy_subscription(s));
        entries.insert(
            topic.to_string(),
            SharedSubscription {
                msg_type: msg_type.to_string(),
                handle,
                fanout,
            },
        );
        debug!(topic, connection = connection_id, msg_type, "created shared subscription");
        Ok(())
    }

    /// Remove `connection_id` from `topic`.  Returns `false` if it was not
    /// registered there.
    pub fn destroy_subscription(&self, topic: &str, connection_id: &str) -> bool {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(topic) else {
            return false;
        };
        if !remove_listener(&entry.fanout, connection_id) {
            return false;
        }
        if entry.handle.release() {
            entries.remove(topic);
            debug!(topic, connection = connection_id, "destroyed shared subscription");
        } else {
            debug!(topic, connection = connection_id, "left shared subscription");
        }
        true
    }

    /// Remove `connection_id` from every topic it is registered on.  Returns
    /// the number of registrations removed.
    pub fn destroy_for_connection(&self, connection_id: &str) -> usize {
        let mut entries = lock(&self.entries);
        let mut removed = 0;
        let mut emptied = Vec::new();
        for (topic, entry) in entries.iter_mut() {
            if remove_listener(&entry.fanout, connection_id) {
                removed += 1;
                if entry.handle.release() {
                    emptied.push(topic.clone());
                }
            }
        }
        for topic in &emptied {
            entries.remove(topic);
            debug!(topic = %topic, connection = connection_id, "destroyed shared subscription");
        }
        removed
    }

    /// Whether `connection_id` is registered on `topic`.
    pub fn is_registered(&self, topic: &str, connection_id: &str) -> bool {
        lock(&self.entries)
            .get(topic)
            .is_some_and(|entry| lock(&entry.fanout).iter().any(|(id, _)| id == connection_id))
    }

    /// Number of connections sharing `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.entries)
            .get(topic)
            .map_or(0, |entry| entry.handle.count())
    }

    /// Number of topics with a live shared subscription.
    pub fn topic_count(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Destroy every shared subscription.
    pub fn shutdown(&self) {
        let mut entries = lock(&self.entries);
        for (_, mut entry) in entries.drain() {
            entry.handle.destroy();
        }
        debug!("subscription registry shut down");
    }
}

fn remove_listener(fanout: &Fanout, connection_id: &str) -> bool {
    let mut listeners = lock(fanout);
    match listeners.iter().position(|(id, _)| id == connection_id) {
        Some(index) => {
            listeners.remove(index);
            true
        }
        None => false,
    }
}
