//! Per-connection resource ownership.
//!
//! A [`ResourceProvider`] holds the publishers, service clients and service
//! servers created by one connection.  None of these are shared: two
//! connections advertising the same topic each get their own publisher.
//! Subscriptions are the exception and are delegated to the shared
//! [`SubscriptionRegistry`], tagged with the connection id.

use std::collections::HashMap;
use std::sync::Arc;

use ros2web_middleware::{Node, Publisher, RequestHandler, ServiceClient, ServiceServer};
use ros2web_types::BridgeError;
use tracing::debug;

use crate::handle::ResourceHandle;
use crate::registry::{DeliveryCallback, SubscriptionRegistry};

struct Owned<T> {
    type_name: String,
    handle: ResourceHandle<T>,
}

/// Get-or-create `name` in `map`.  An existing entry of the same type is
/// retained; a different type is a conflict and leaves the entry untouched.
fn acquire<T>(
    map: &mut HashMap<String, Owned<T>>,
    name: &str,
    type_name: &str,
    create: impl FnOnce() -> Result<ResourceHandle<T>, BridgeError>,
) -> Result<(), BridgeError> {
    if let Some(owned) = map.get_mut(name) {
        if owned.type_name != type_name {
            return Err(BridgeError::TypeConflict {
                name: name.to_string(),
                existing: owned.type_name.clone(),
                requested: type_name.to_string(),
            });
        }
        owned.handle.retain();
        return Ok(());
    }
    let handle = create()?;
    map.insert(
        name.to_string(),
        Owned {
            type_name: type_name.to_string(),
            handle,
        },
    );
    Ok(())
}

/// Release one reference to `name`.  `None` if `map` has no such entry,
/// otherwise whether the resource was torn down.
fn release<T>(map: &mut HashMap<String, Owned<T>>, name: &str) -> Option<bool> {
    let owned = map.get_mut(name)?;
    let destroyed = owned.handle.release();
    if destroyed {
        map.remove(name);
    }
    Some(destroyed)
}

fn destroy_all<T>(map: &mut HashMap<String, Owned<T>>) -> usize {
    let count = map.len();
    for (_, mut owned) in map.drain() {
        owned.handle.destroy();
    }
    count
}

/// Everything one connection has created on the middleware.
///
/// Publishers, clients and servers are keyed by name as the client sent
/// it and ref-counted per connection: advertising a topic twice needs two
/// `unadvertise` calls before the publisher goes away.  A repeated create
/// with a different type is a [`BridgeError::TypeConflict`] and leaves the
/// existing resource untouched.
pub struct ResourceProvider {
    connection_id: String,
    node: Arc<dyn Node>,
    registry: Arc<SubscriptionRegistry>,
    publishers: HashMap<String, Owned<Box<dyn Publisher>>>,
    clients: HashMap<String, Owned<Box<dyn ServiceClient>>>,
    services: HashMap<String, Owned<Box<dyn ServiceServer>>>,
    cleaned: bool,
}

impl ResourceProvider {
    /// A provider for `connection_id`, owning nothing yet.
    pub fn new(
        connection_id: impl Into<String>,
        node: Arc<dyn Node>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            node,
            registry,
            publishers: HashMap::new(),
            clients: HashMap::new(),
            services: HashMap::new(),
            cleaned: false,
        }
    }

    // ───────────────────────────────────────────────────────────────────────
    // Publishers
    // ───────────────────────────────────────────────────────────────────────

    /// Advertise `topic`, or take another reference to this connection's
    /// publisher on it.
    pub fn create_publisher(&mut self, msg_type: &str, topic: &str) -> Result<(), BridgeError> {
        let node = &self.node;
        acquire(&mut self.publishers, topic, msg_type, || {
            let publisher = node.create_publisher(msg_type, topic)?;
            let node = Arc::clone(node);
            Ok(ResourceHandle::new(publisher, move |p| node.destroy_publisher(p)))
        })
    }

    /// This connection's publisher on `topic`.
    pub fn publisher(&self, topic: &str) -> Option<&dyn Publisher> {
        self.publishers
            .get(topic)
            .and_then(|owned| owned.handle.get())
            .map(|p| p.as_ref())
    }

    /// Release one advertisement of `topic`.
    pub fn destroy_publisher(&mut self, topic: &str) -> Result<(), BridgeError> {
        release(&mut self.publishers, topic)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotAdvertised(topic.to_string()))
    }

    /// Outstanding advertisements of `topic`.
    pub fn publisher_refs(&self, topic: &str) -> usize {
        self.publishers.get(topic).map_or(0, |o| o.handle.count())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Service clients
    // ───────────────────────────────────────────────────────────────────────

    /// Create, or take another reference to, the client for `service`.
    pub fn create_client(&mut self, srv_type: &str, service: &str) -> Result<(), BridgeError> {
        let node = &self.node;
        acquire(&mut self.clients, service, srv_type, || {
            let client = node.create_client(srv_type, service)?;
            let node = Arc::clone(node);
            Ok(ResourceHandle::new(client, move |c| node.destroy_client(c)))
        })
    }

    /// This connection's client for `service`.
    pub fn client(&self, service: &str) -> Option<&dyn ServiceClient> {
        self.clients
            .get(service)
            .and_then(|owned| owned.handle.get())
            .map(|c| c.as_ref())
    }

    /// Release one reference to the client for `service`.  Returns `false`
    /// if this connection holds no such client.
    pub fn destroy_client(&mut self, service: &str) -> bool {
        release(&mut self.clients, service).is_some()
    }

    /// Outstanding references to the client for `service`.
    pub fn client_refs(&self, service: &str) -> usize {
        self.clients.get(service).map_or(0, |o| o.handle.count())
    }

    // ───────────────────────────────────────────────────────────────────────
    // Service servers
    // ───────────────────────────────────────────────────────────────────────

    /// Offer `service`.  Offering it again retains the existing server and
    /// ignores the new handler.
    pub fn create_service(
        &mut self,
        srv_type: &str,
        service: &str,
        on_request: RequestHandler,
    ) -> Result<(), BridgeError> {
        let node = &self.node;
        acquire(&mut self.services, service, srv_type, || {
            let server = node.create_service(srv_type, service, on_request)?;
            let node = Arc::clone(node);
            Ok(ResourceHandle::new(server, move |s| node.destroy_service(s)))
        })
    }

    /// Release one offer of `service`.  Returns whether the server was torn
    /// down.
    pub fn destroy_service(&mut self, service: &str) -> Result<bool, BridgeError> {
        release(&mut self.services, service)
            .ok_or_else(|| BridgeError::NotOffered(service.to_string()))
    }

    /// Whether this connection offers `service`.
    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ───────────────────────────────────────────────────────────────────────

    /// Register this connection on `topic` in the shared registry.
    pub fn create_subscription(
        &self,
        msg_type: &str,
        topic: &str,
        callback: DeliveryCallback,
    ) -> Result<(), BridgeError> {
        self.registry
            .create_subscription(msg_type, topic, &self.connection_id, callback)
    }

    /// Leave `topic`.  [`BridgeError::NotSubscribed`] if this connection is
    /// not on it.
    pub fn destroy_subscription(&self, topic: &str) -> Result<(), BridgeError> {
        if self.registry.destroy_subscription(topic, &self.connection_id) {
            Ok(())
        } else {
            Err(BridgeError::NotSubscribed(topic.to_string()))
        }
    }

    /// Whether this connection is registered on `topic`.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.registry.is_registered(topic, &self.connection_id)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Teardown
    // ───────────────────────────────────────────────────────────────────────

    /// Force-destroy everything this connection owns and remove it from the
    /// shared registry.  Later calls do nothing.
    pub fn clean(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        let publishers = destroy_all(&mut self.publishers);
        let clients = destroy_all(&mut self.clients);
        let services = destroy_all(&mut self.services);
        let subscriptions = self.registry.destroy_for_connection(&self.connection_id);
        debug!(
            connection = %self.connection_id,
            publishers,
            clients,
            services,
            subscriptions,
            "released connection resources"
        );
    }
}

impl Drop for ResourceProvider {
    fn drop(&mut self) {
        self.clean();
    }
}
