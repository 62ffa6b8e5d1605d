//! The middleware capability interface.
//!
//! ros2web never talks to a robotics middleware directly.  Everything it
//! needs from one is expressed by the [`Node`] trait: create and destroy
//! publishers, subscriptions, service clients and service servers, plus name
//! validation.  [`LocalNode`][crate::local::LocalNode] is the in-process
//! implementation; a binding to a real middleware implements the same trait.
//!
//! # Contract
//!
//! * Every `create_*` either returns a live resource or an error, never a
//!   half-registered resource.
//! * Every `destroy_*` tears the resource down immediately.  The caller
//!   guarantees each resource is destroyed at most once.
//! * Callbacks ([`MessageCallback`], [`RequestHandler`]) may be invoked from
//!   any thread and must not block.

use std::sync::Arc;

use ros2web_types::BridgeError;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::naming;

/// Middleware-assigned identity of a created resource.
pub type ResourceId = u64;

/// Invoked once per message delivered on a subscription.
pub type MessageCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Invoked once per request arriving at a service server.  The handler owns
/// the [`ResponseSink`] and must complete it at most once.
pub type RequestHandler = Arc<dyn Fn(Value, ResponseSink) + Send + Sync>;

/// Receiving half of a service call.  Resolves with the server's reply, or
/// with an error when the sink was dropped without answering.
pub type PendingResponse = oneshot::Receiver<ServiceReply>;

/// A server's answer to one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceReply {
    /// Response values, or the server's explanation when `result` is false.
    pub values: Value,
    /// Whether the server handled the request successfully.
    pub result: bool,
}

/// Completes exactly one service request.
///
/// Consuming [`send`][Self::send] and [`fail`][Self::fail] makes double
/// completion unrepresentable.  Dropping the sink without answering tells the
/// caller that no answer is coming.
#[derive(Debug)]
pub struct ResponseSink {
    tx: oneshot::Sender<ServiceReply>,
}

impl ResponseSink {
    /// Create a linked sink / pending-response pair.
    pub fn channel() -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver a successful response.  Returns `false` if the caller stopped
    /// waiting.
    pub fn send(self, values: Value) -> bool {
        self.tx.send(ServiceReply { values, result: true }).is_ok()
    }

    /// Report that the request failed, with whatever `values` the server
    /// gave as the reason.
    pub fn fail(self, values: Value) -> bool {
        self.tx.send(ServiceReply { values, result: false }).is_ok()
    }

    /// Whether the caller has stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Sends messages on one topic.
pub trait Publisher: Send + Sync {
    /// Node-unique id of this publisher.
    fn id(&self) -> ResourceId;
    /// Topic name as given at creation.
    fn topic(&self) -> &str;
    /// Hand `msg` to every matching subscription.
    fn publish(&self, msg: Value) -> Result<(), BridgeError>;
}

/// A live subscription.  Messages arrive through the [`MessageCallback`]
/// given at creation until the subscription is destroyed.
pub trait Subscription: Send + Sync {
    /// Node-unique id of this subscription.
    fn id(&self) -> ResourceId;
    /// Topic name as given at creation.
    fn topic(&self) -> &str;
}

/// Calls one service.
pub trait ServiceClient: Send + Sync {
    /// Node-unique id of this client.
    fn id(&self) -> ResourceId;
    /// Service name as given at creation.
    fn service(&self) -> &str;
    /// Send `request` and return a handle to its eventual response.
    fn send_request(&self, request: Value) -> PendingResponse;
}

/// Offers one service.  Requests reach the [`RequestHandler`] given at
/// creation.
pub trait ServiceServer: Send + Sync {
    /// Node-unique id of this server.
    fn id(&self) -> ResourceId;
    /// Service name as given at creation.
    fn service(&self) -> &str;
}

/// A middleware node: the resource factory every connection shares.
pub trait Node: Send + Sync {
    /// Node name, used to expand private (`~`) names.
    fn name(&self) -> &str;

    /// Create a publisher of `msg_type` on `topic`.
    ///
    /// Fails with [`BridgeError::UnknownType`] for a type the node cannot
    /// resolve, or with a name error for a malformed `topic`.
    fn create_publisher(
        &self,
        msg_type: &str,
        topic: &str,
    ) -> Result<Box<dyn Publisher>, BridgeError>;
    /// Tear `publisher` down.
    fn destroy_publisher(&self, publisher: Box<dyn Publisher>);

    /// Subscribe to `topic`.  `on_message` is called for every message
    /// published on it with a matching type.
    fn create_subscription(
        &self,
        msg_type: &str,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn Subscription>, BridgeError>;
    /// Tear `subscription` down.  No callback runs after this returns.
    fn destroy_subscription(&self, subscription: Box<dyn Subscription>);

    /// Create a client for `service`.  The service does not have to be
    /// offered yet.
    fn create_client(
        &self,
        srv_type: &str,
        service: &str,
    ) -> Result<Box<dyn ServiceClient>, BridgeError>;
    /// Tear `client` down.
    fn destroy_client(&self, client: Box<dyn ServiceClient>);

    /// Offer `service`.  Each request is passed to `on_request` together
    /// with the sink that answers it.
    fn create_service(
        &self,
        srv_type: &str,
        service: &str,
        on_request: RequestHandler,
    ) -> Result<Box<dyn ServiceServer>, BridgeError>;
    /// Withdraw `server`.  Requests still in flight are left to their sinks.
    fn destroy_service(&self, server: Box<dyn ServiceServer>);

    /// Reject syntactically malformed topic or service names.
    fn validate_topic_name(&self, name: &str) -> Result<(), BridgeError> {
        naming::validate_topic_name(name)
    }

    /// Like [`validate_topic_name`][Self::validate_topic_name] but the name
    /// must also be absolute.
    fn validate_full_topic_name(&self, name: &str) -> Result<(), BridgeError> {
        naming::validate_full_topic_name(name)
    }

    /// Destroy every remaining resource and refuse new ones.
    fn shutdown(&self);
}
