//! In-process middleware node.
//!
//! [`LocalNode`] implements the [`Node`] capability without any external
//! runtime: publishers deliver straight into the subscriptions registered on
//! the same expanded topic, and service clients call the handler of the
//! server offering the same expanded service name.
//!
//! It is what the gateway runs against when no real middleware binding is
//! linked in, and what the test-suites use to observe exactly when resources
//! are created and destroyed (see [`LocalNode::stats`]).
//!
//! # Interface catalogue
//!
//! Types are resolved against a closed catalogue of fully qualified names
//! (`pkg/msg/Type`, `pkg/srv/Type`).  [`DEFAULT_INTERFACES`] covers the
//! common message and service packages; [`LocalNode::with_types`] extends it.
//! Creating a resource with a type outside the catalogue fails with
//! [`BridgeError::UnknownType`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use ros2web_types::BridgeError;
use serde_json::Value;
use tracing::debug;

use crate::naming::expand_topic_name;
use crate::node::{
    MessageCallback, Node, PendingResponse, Publisher, RequestHandler, ResourceId, ResponseSink,
    ServiceClient, ServiceServer, Subscription,
};

/// Interface types every [`LocalNode`] knows about.
pub const DEFAULT_INTERFACES: &[&str] = &[
    "std_msgs/msg/Bool",
    "std_msgs/msg/Byte",
    "std_msgs/msg/Char",
    "std_msgs/msg/ColorRGBA",
    "std_msgs/msg/Empty",
    "std_msgs/msg/Float32",
    "std_msgs/msg/Float64",
    "std_msgs/msg/Header",
    "std_msgs/msg/Int8",
    "std_msgs/msg/Int16",
    "std_msgs/msg/Int32",
    "std_msgs/msg/Int64",
    "std_msgs/msg/String",
    "std_msgs/msg/UInt8",
    "std_msgs/msg/UInt16",
    "std_msgs/msg/UInt32",
    "std_msgs/msg/UInt64",
    "geometry_msgs/msg/Point",
    "geometry_msgs/msg/Pose",
    "geometry_msgs/msg/Quaternion",
    "geometry_msgs/msg/Twist",
    "geometry_msgs/msg/Vector3",
    "sensor_msgs/msg/BatteryState",
    "sensor_msgs/msg/Imu",
    "sensor_msgs/msg/JointState",
    "sensor_msgs/msg/LaserScan",
    "nav_msgs/msg/Odometry",
    "std_srvs/srv/Empty",
    "std_srvs/srv/SetBool",
    "std_srvs/srv/Trigger",
    "example_interfaces/srv/AddTwoInts",
];

/// Create / destroy counters for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Resources handed out by a `create_*` call.
    pub created: usize,
    /// Resources torn down, by a `destroy_*` call or by shutdown.
    pub destroyed: usize,
}

impl ResourceStats {
    /// Resources created and not yet destroyed.
    pub fn live(&self) -> usize {
        self.created - self.destroyed
    }
}

/// Snapshot of every counter kept by a [`LocalNode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    /// Publishers.
    pub publishers: ResourceStats,
    /// Subscriptions.
    pub subscriptions: ResourceStats,
    /// Service clients.
    pub clients: ResourceStats,
    /// Service servers.
    pub services: ResourceStats,
}

// ───────────────────────────────────────────────────────────────────────────
// Graph state
// ───────────────────────────────────────────────────────────────────────────

struct LocalSubscriber {
    id: ResourceId,
    msg_type: String,
    callback: MessageCallback,
}

struct LocalService {
    id: ResourceId,
    srv_type: String,
    handler: RequestHandler,
}

#[derive(Default)]
struct Graph {
    next_id: ResourceId,
    shut_down: bool,
    publishers: HashMap<ResourceId, String>,
    subscriptions: HashMap<String, Vec<LocalSubscriber>>,
    services: HashMap<String, LocalService>,
    clients: HashSet<ResourceId>,
    stats: NodeStats,
}

impl Graph {
    fn allocate(&mut self) -> Result<ResourceId, BridgeError> {
        if self.shut_down {
            return Err(BridgeError::NodeShutdown);
        }
        self.next_id += 1;
        Ok(self.next_id)
    }
}

fn lock(graph: &Mutex<Graph>) -> MutexGuard<'_, Graph> {
    graph.lock().unwrap_or_else(PoisonError::into_inner)
}

// ───────────────────────────────────────────────────────────────────────────
// LocalNode
// ───────────────────────────────────────────────────────────────────────────

/// In-process implementation of the [`Node`] capability.
pub struct LocalNode {
    name: String,
    catalogue: HashSet<String>,
    graph: Arc<Mutex<Graph>>,
}

impl LocalNode {
    /// Create a node called `name` with the [`DEFAULT_INTERFACES`] catalogue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            catalogue: DEFAULT_INTERFACES.iter().map(|t| t.to_string()).collect(),
            graph: Arc::new(Mutex::new(Graph::default())),
        }
    }

    /// Extend the interface catalogue (builder-style).
    pub fn with_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalogue.extend(types.into_iter().map(Into::into));
        self
    }

    /// Whether `interface` is in the catalogue.
    pub fn knows(&self, interface: &str) -> bool {
        self.catalogue.contains(interface)
    }

    /// Current create / destroy counters.
    pub fn stats(&self) -> NodeStats {
        lock(&self.graph).stats
    }

    fn resolve(&self, interface: &str) -> Result<(), BridgeError> {
        if self.knows(interface) {
            Ok(())
        } else {
            Err(BridgeError::UnknownType(interface.to_string()))
        }
    }

    fn expand(&self, name: &str) -> String {
        expand_topic_name(name, &self.name)
    }
}

impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_publisher(
        &self,
        msg_type: &str,
        topic: &str,
    ) -> Result<Box<dyn Publisher>, BridgeError> {
        self.resolve(msg_type)?;
        let full_topic = self.expand(topic);
        let mut graph = lock(&self.graph);
        let id = graph.allocate()?;
        graph.publishers.insert(id, full_topic.clone());
        graph.stats.publishers.created += 1;
        debug!(node = %self.name, topic = %full_topic, msg_type, "publisher created");
        Ok(Box::new(LocalPublisher {
            id,
            topic: topic.to_string(),
            full_topic,
            msg_type: msg_type.to_string(),
            graph: Arc::downgrade(&self.graph),
        }))
    }

    fn destroy_publisher(&self, publisher: Box<dyn Publisher>) {
        let mut graph = lock(&self.graph);
        if graph.publishers.remove(&publisher.id()).is_some() {
            graph.stats.publishers.destroyed += 1;
            debug!(node = %self.name, topic = publisher.topic(), "publisher destroyed");
        }
    }

    fn create_subscription(
        &self,
        msg_type: &str,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>, BridgeError> {
        self.resolve(msg_type)?;
        let full_topic = self.expand(topic);
        let mut graph = lock(&self.graph);
        let id = graph.allocate()?;
        graph
            .subscriptions
            .entry(full_topic.clone())
            .or_default()
            .push(LocalSubscriber {
                id,
                msg_type: msg_type.to_string(),
                callback: on_message,
            });
        graph.stats.subscriptions.created += 1;
        debug!(node = %self.name, topic = %full_topic, msg_type, "subscription created");
        Ok(Box::new(LocalSubscription {
            id,
            topic: topic.to_string(),
        }))
    }

    fn destroy_subscription(&self, subscription: Box<dyn Subscription>) {
        let full_topic = self.expand(subscription.topic());
        let mut graph = lock(&self.graph);
        let Some(subscribers) = graph.subscriptions.get_mut(&full_topic) else {
            return;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription.id());
        let removed = before != subscribers.len();
        if subscribers.is_empty() {
            graph.subscriptions.remove(&full_topic);
        }
        if removed {
            graph.stats.subscriptions.destroyed += 1;
            debug!(node = %self.name, topic = %full_topic, "subscription destroyed");
        }
    }

    fn create_client(
        &self,
        srv_type: &str,
        service: &str,
    ) -> Result<Box<dyn ServiceClient>, BridgeError> {
        self.resolve(srv_type)?;
        let full_service = self.expand(service);
        let mut graph = lock(&self.graph);
        let id = graph.allocate()?;
        graph.clients.insert(id);
        graph.stats.clients.created += 1;
        debug!(node = %self.name, service = %full_service, srv_type, "client created");
        Ok(Box::new(LocalClient {
            id,
            service: service.to_string(),
            full_service,
            srv_type: srv_type.to_string(),
            graph: Arc::downgrade(&self.graph),
        }))
    }

    fn destroy_client(&self, client: Box<dyn ServiceClient>) {
        let mut graph = lock(&self.graph);
        if graph.clients.remove(&client.id()) {
            graph.stats.clients.destroyed += 1;
            debug!(node = %self.name, service = client.service(), "client destroyed");
        }
    }

    fn create_service(
        &self,
        srv_type: &str,
        service: &str,
        on_request: RequestHandler,
    ) -> Result<Box<dyn ServiceServer>, BridgeError> {
        self.resolve(srv_type)?;
        let full_service = self.expand(service);
        let mut graph = lock(&self.graph);
        if graph.services.contains_key(&full_service) {
            return Err(BridgeError::ServiceAlreadyOffered(full_service));
        }
        let id = graph.allocate()?;
        graph.services.insert(
            full_service.clone(),
            LocalService {
                id,
                srv_type: srv_type.to_string(),
                handler: on_request,
            },
        );
        graph.stats.services.created += 1;
        debug!(node = %self.name, service = %full_service, srv_type, "service created");
        Ok(Box::new(LocalServer {
            id,
            service: service.to_string(),
        }))
    }

    fn destroy_service(&self, server: Box<dyn ServiceServer>) {
        let full_service = self.expand(server.service());
        let mut graph = lock(&self.graph);
        let owned = graph
            .services
            .get(&full_service)
            .is_some_and(|s| s.id == server.id());
        if owned {
            graph.services.remove(&full_service);
            graph.stats.services.destroyed += 1;
            debug!(node = %self.name, service = %full_service, "service destroyed");
        }
    }

    fn shutdown(&self) {
        let mut graph = lock(&self.graph);
        if graph.shut_down {
            return;
        }
        graph.shut_down = true;

        let publishers = graph.publishers.drain().count();
        let subscriptions: usize = graph.subscriptions.drain().map(|(_, s)| s.len()).sum();
        let clients = graph.clients.drain().count();
        let services = graph.services.drain().count();

        graph.stats.publishers.destroyed += publishers;
        graph.stats.subscriptions.destroyed += subscriptions;
        graph.stats.clients.destroyed += clients;
        graph.stats.services.destroyed += services;
        debug!(node = %self.name, "node shut down");
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Resources
// ───────────────────────────────────────────────────────────────────────────

struct LocalPublisher {
    id: ResourceId,
    topic: String,
    full_topic: String,
    msg_type: String,
    graph: Weak<Mutex<Graph>>,
}

impl Publisher for LocalPublisher {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    /// Deliver `msg` to every matching subscription.
    ///
    /// The callbacks are collected under the graph lock and invoked after it
    /// is released, so a callback may call back into the node.
    fn publish(&self, msg: Value) -> Result<(), BridgeError> {
        let graph = self.graph.upgrade().ok_or(BridgeError::NodeShutdown)?;
        let callbacks: Vec<MessageCallback> = {
            let graph = lock(&graph);
            if !graph.publishers.contains_key(&self.id) {
                return Err(BridgeError::Middleware(format!(
                    "publisher on '{}' has been destroyed",
                    self.full_topic
                )));
            }
            graph
                .subscriptions
                .get(&self.full_topic)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .filter(|s| s.msg_type == self.msg_type)
                        .map(|s| Arc::clone(&s.callback))
                        .collect()
                })
                .unwrap_or_default()
        };
        for callback in callbacks {
            callback(&msg);
        }
        Ok(())
    }
}

struct LocalSubscription {
    id: ResourceId,
    topic: String,
}

impl Subscription for LocalSubscription {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

struct LocalClient {
    id: ResourceId,
    service: String,
    full_service: String,
    srv_type: String,
    graph: Weak<Mutex<Graph>>,
}

impl ServiceClient for LocalClient {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn service(&self) -> &str {
        &self.service
    }

    /// Hand `request` to the server offering this service.
    ///
    /// When no server with a matching type exists the sink is dropped and
    /// the returned receiver resolves with an error.
    fn send_request(&self, request: Value) -> PendingResponse {
        let (sink, pending) = ResponseSink::channel();
        let handler = self.graph.upgrade().and_then(|graph| {
            let graph = lock(&graph);
            if !graph.clients.contains(&self.id) {
                return None;
            }
            graph
                .services
                .get(&self.full_service)
                .filter(|s| s.srv_type == self.srv_type)
                .map(|s| Arc::clone(&s.handler))
        });
        match handler {
            Some(handler) => handler(request, sink),
            None => debug!(service = %self.full_service, "no server available for request"),
        }
        pending
    }
}

struct LocalServer {
    id: ResourceId,
    service: String,
}

impl ServiceServer for LocalServer {
    fn id(&self) -> ResourceId {
        self.id
    }

    fn service(&self) -> &str {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::node::ServiceReply;

    fn counting_callback() -> (MessageCallback, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: MessageCallback = Arc::new(move |msg: &Value| {
            sink.lock().unwrap().push(msg.clone());
        });
        (callback, seen)
    }

    #[test]
    fn unknown_type_is_rejected() {
        let node = LocalNode::new("test");
        let result = node.create_publisher("std_msgs/msg/Foo", "/chatter");
        assert!(matches!(result, Err(BridgeError::UnknownType(t)) if t == "std_msgs/msg/Foo"));
        assert_eq!(node.stats().publishers.created, 0);
    }

    #[test]
    fn catalogue_can_be_extended() {
        let node = LocalNode::new("test").with_types(["my_pkg/msg/Custom"]);
        assert!(node.knows("my_pkg/msg/Custom"));
        assert!(node.create_publisher("my_pkg/msg/Custom", "/custom").is_ok());
    }

    #[test]
    fn publish_reaches_matching_subscriptions() {
        let node = LocalNode::new("test");
        let (callback, seen) = counting_callback();
        let _sub = node
            .create_subscription("std_msgs/msg/String", "/chatter", callback)
            .unwrap();
        let publisher = node.create_publisher("std_msgs/msg/String", "chatter").unwrap();

        publisher.publish(json!({"data": "hello"})).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[json!({"data": "hello"})]);
    }

    #[test]
    fn publish_skips_subscriptions_of_another_type() {
        let node = LocalNode::new("test");
        let (callback, seen) = counting_callback();
        let _sub = node
            .create_subscription("std_msgs/msg/Char", "/chatter", callback)
            .unwrap();
        let publisher = node.create_publisher("std_msgs/msg/String", "/chatter").unwrap();

        publisher.publish(json!({"data": "hello"})).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn destroyed_subscription_no_longer_receives() {
        let node = LocalNode::new("test");
        let (callback, seen) = counting_callback();
        let sub = node
            .create_subscription("std_msgs/msg/String", "/chatter", callback)
            .unwrap();
        let publisher = node.create_publisher("std_msgs/msg/String", "/chatter").unwrap();

        node.destroy_subscription(sub);
        publisher.publish(json!({"data": "late"})).unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(node.stats().subscriptions, ResourceStats { created: 1, destroyed: 1 });
    }

    #[test]
    fn destroyed_publisher_refuses_to_publish() {
        let node = LocalNode::new("test");
        let publisher = node.create_publisher("std_msgs/msg/String", "/chatter").unwrap();
        let again = LocalPublisher {
            id: publisher.id(),
            topic: "/chatter".into(),
            full_topic: "/chatter".into(),
            msg_type: "std_msgs/msg/String".into(),
            graph: Arc::downgrade(&node.graph),
        };
        node.destroy_publisher(publisher);
        assert!(again.publish(json!({})).is_err());
        assert_eq!(node.stats().publishers.live(), 0);
    }

    #[tokio::test]
    async fn client_reaches_service_handler() {
        let node = LocalNode::new("test");
        let handler: RequestHandler = Arc::new(|request: Value, sink: ResponseSink| {
            let sum = request["a"].as_i64().unwrap_or(0) + request["b"].as_i64().unwrap_or(0);
            sink.send(json!({"sum": sum}));
        });
        let _server = node
            .create_service("example_interfaces/srv/AddTwoInts", "add_two_ints", handler)
            .unwrap();
        let client = node
            .create_client("example_interfaces/srv/AddTwoInts", "/add_two_ints")
            .unwrap();

        let response = client.send_request(json!({"a": 1, "b": 2})).await.unwrap();
        assert_eq!(response.values, json!({"sum": 3}));
        assert!(response.result);
    }

    #[tokio::test]
    async fn failed_request_carries_the_reason() {
        let node = LocalNode::new("test");
        let handler: RequestHandler = Arc::new(|_request: Value, sink: ResponseSink| {
            sink.fail(json!("divide by zero"));
        });
        let _server = node
            .create_service("example_interfaces/srv/AddTwoInts", "/add_two_ints", handler)
            .unwrap();
        let client = node
            .create_client("example_interfaces/srv/AddTwoInts", "/add_two_ints")
            .unwrap();

        let response = client.send_request(json!({})).await.unwrap();
        assert_eq!(
            response,
            ServiceReply {
                values: json!("divide by zero"),
                result: false,
            }
        );
    }

    #[tokio::test]
    async fn request_without_server_is_cancelled() {
        let node = LocalNode::new("test");
        let client = node
            .create_client("example_interfaces/srv/AddTwoInts", "/nobody")
            .unwrap();
        assert!(client.send_request(json!({})).await.is_err());
    }

    #[test]
    fn second_server_for_same_service_is_rejected() {
        let node = LocalNode::new("test");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: RequestHandler = Arc::new(move |_req: Value, _sink: ResponseSink| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _first = node
            .create_service("std_srvs/srv/Trigger", "/reset", Arc::clone(&handler))
            .unwrap();
        let second = node.create_service("std_srvs/srv/Trigger", "reset", handler);
        assert!(matches!(second, Err(BridgeError::ServiceAlreadyOffered(_))));
        assert_eq!(node.stats().services.created, 1);
    }

    #[test]
    fn destroy_is_counted_once() {
        let node = LocalNode::new("test");
        let client = node.create_client("std_srvs/srv/Trigger", "/reset").unwrap();
        let id = client.id();
        node.destroy_client(client);
        // A forged handle with the same id must not be counted again.
        node.destroy_client(Box::new(LocalClient {
            id,
            service: "/reset".into(),
            full_service: "/reset".into(),
            srv_type: "std_srvs/srv/Trigger".into(),
            graph: Weak::new(),
        }));
        assert_eq!(node.stats().clients, ResourceStats { created: 1, destroyed: 1 });
    }

    #[test]
    fn shutdown_destroys_everything_and_refuses_new_resources() {
        let node = LocalNode::new("test");
        let (callback, _) = counting_callback();
        let _p = node.create_publisher("std_msgs/msg/String", "/a").unwrap();
        let _s = node
            .create_subscription("std_msgs/msg/String", "/a", callback)
            .unwrap();

        node.shutdown();

        let stats = node.stats();
        assert_eq!(stats.publishers.live(), 0);
        assert_eq!(stats.subscriptions.live(), 0);
        assert!(matches!(
            node.create_publisher("std_msgs/msg/String", "/b"),
            Err(BridgeError::NodeShutdown)
        ));
    }
}
