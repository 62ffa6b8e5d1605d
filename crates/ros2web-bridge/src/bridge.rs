//! Per-connection protocol state machine.
//!
//! A [`Bridge`] is created for every client connection.  It owns the
//! connection's [`MessageFramer`] and [`ResourceProvider`], dispatches each
//! decoded command, and filters the status replies it produces against the
//! connection's reporting level.
//!
//! The bridge never touches the socket.  Replies go out through an unbounded
//! `ServerMessage` channel drained by the socket writer, and everything that
//! happens asynchronously (a relayed service request for a service this
//! connection offers, the response to a service call it made) comes back in
//! as a [`ConnectionEvent`] on the connection's event channel.  The owning
//! task feeds both socket input and events into the bridge one at a time, so
//! commands are processed strictly in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use ros2web_middleware::{Node, RequestHandler, ResponseSink};
use ros2web_types::protocol::command_id;
use ros2web_types::{BridgeError, Command, Operation, ServerMessage, StatusLevel};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::framer::{DEFAULT_MAX_FRAME_BYTES, MessageFramer};
use crate::provider::ResourceProvider;
use crate::registry::{DeliveryCallback, SubscriptionRegistry};

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeOptions {
    /// Initial status reporting level.
    pub status_level: StatusLevel,
    /// Bound on buffered, incomplete input.
    pub max_frame_bytes: usize,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            status_level: StatusLevel::Error,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Asynchronous input to a connection, delivered on its event channel.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Another party called a service this connection offers.
    ServiceRequest {
        service: String,
        request: Value,
        sink: ResponseSink,
    },
    /// A `call_service` issued by this connection finished.  `result` is
    /// false when the server reported a failure, in which case `values`
    /// carries its reason, or when the service was unavailable or never
    /// answered, in which case `values` is null.
    CallCompleted {
        service: String,
        id: Option<String>,
        values: Value,
        result: bool,
    },
}

/// Which half of the interface namespace a type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    Message,
    Service,
}

impl InterfaceKind {
    fn segment(self) -> &'static str {
        match self {
            InterfaceKind::Message => "msg",
            InterfaceKind::Service => "srv",
        }
    }
}

/// Qualify a legacy `pkg/Type` name as `pkg/msg/Type` or `pkg/srv/Type`.
///
/// Already-qualified names are returned unchanged.
pub fn normalize_type(type_name: &str, kind: InterfaceKind) -> Result<String, BridgeError> {
    let parts: Vec<&str> = type_name.split('/').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(BridgeError::InvalidType(type_name.to_string()));
    }
    match parts.as_slice() {
        [package, name] => Ok(format!("{package}/{}/{name}", kind.segment())),
        [_, _, _] => Ok(type_name.to_string()),
        _ => Err(BridgeError::InvalidType(type_name.to_string())),
    }
}

/// Outcome of a successfully dispatched operation.
enum Reply {
    Ack,
    Silent,
}

/// A relayed request waiting for this connection's `service_response`.
struct PendingCall {
    service: String,
    sink: ResponseSink,
}

/// Protocol state of one client connection.
///
/// Holds the connection's status level, framing buffer, resources and the
/// relayed service requests waiting for a `service_response`.  Once
/// [`close`][Self::close] has run, every further input is ignored and no
/// reply is sent.
pub struct Bridge {
    id: String,
    node: Arc<dyn Node>,
    level: StatusLevel,
    framer: MessageFramer,
    provider: ResourceProvider,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    pending: HashMap<String, PendingCall>,
    closed: bool,
}

impl Bridge {
    /// A fresh connection with a random id.
    ///
    /// Replies go to `outbound`.  `events` must be drained by the connection's
    /// owner into [`handle_event`][Self::handle_event].
    pub fn new(
        node: Arc<dyn Node>,
        registry: Arc<SubscriptionRegistry>,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        options: BridgeOptions,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let provider = ResourceProvider::new(id.clone(), Arc::clone(&node), registry);
        Self {
            id,
            node,
            level: options.status_level,
            framer: MessageFramer::new(options.max_frame_bytes),
            provider,
            outbound,
            events,
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Connection id used in logs and registry entries.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status reporting level.
    pub fn status_level(&self) -> StatusLevel {
        self.level
    }

    /// Whether [`close`][Self::close] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Relayed service requests still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// The resources this connection owns.
    pub fn provider(&self) -> &ResourceProvider {
        &self.provider
    }

    /// Feed raw socket text and execute every command it completes.
    ///
    /// # Errors
    ///
    /// Only fatal framing errors are returned; the caller must drop the
    /// connection.  Command failures are reported to the client instead.
    pub fn receive(&mut self, chunk: &str) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        let mut next = self.framer.process(chunk)?;
        while let Some(value) = next {
            self.execute_command(value);
            if self.closed {
                break;
            }
            next = self.framer.process("")?;
        }
        Ok(())
    }

    /// Decode and run one command, replying with a status as appropriate.
    pub fn execute_command(&mut self, raw: Value) {
        if self.closed {
            return;
        }
        let raw_id = command_id(&raw);
        let command = match Command::from_value(raw) {
            Ok(command) => command,
            Err(e) => {
                self.report_error(None, raw_id, &e);
                return;
            }
        };

        let op = command.op.clone();
        let id = command.id.clone();
        debug!(connection = %self.id, op = %op, id = ?id, "dispatching command");

        let result = command
            .into_operation()
            .and_then(|operation| self.dispatch(&op, id.clone(), operation));
        match result {
            Ok(Reply::Ack) => self.send_status(ServerMessage::ok(id)),
            Ok(Reply::Silent) => {}
            Err(e) => self.report_error(Some(&op), id, &e),
        }
    }

    fn dispatch(
        &mut self,
        op: &str,
        id: Option<String>,
        operation: Operation,
    ) -> Result<Reply, BridgeError> {
        match operation {
            Operation::SetLevel { level } => {
                self.level = level.parse()?;
                Ok(Reply::Ack)
            }
            Operation::Advertise { topic, msg_type } => {
                self.node.validate_topic_name(&topic)?;
                let msg_type = normalize_type(&msg_type, InterfaceKind::Message)?;
                self.provider.create_publisher(&msg_type, &topic)?;
                Ok(Reply::Ack)
            }
            Operation::Unadvertise { topic } => {
                self.node.validate_topic_name(&topic)?;
                self.provider.destroy_publisher(&topic)?;
                Ok(Reply::Ack)
            }
            Operation::Publish { topic, msg } => {
                let publisher = self
                    .provider
                    .publisher(&topic)
                    .ok_or(BridgeError::PublishWithoutAdvertise(topic))?;
                publisher.publish(msg)?;
                Ok(Reply::Ack)
            }
            Operation::Subscribe { topic, msg_type } => {
                self.node.validate_topic_name(&topic)?;
                let msg_type = normalize_type(&msg_type, InterfaceKind::Message)?;
                self.provider
                    .create_subscription(&msg_type, &topic, self.delivery_callback())?;
                Ok(Reply::Ack)
            }
            Operation::Unsubscribe { topic } => {
                self.node.validate_topic_name(&topic)?;
                self.provider.destroy_subscription(&topic)?;
                Ok(Reply::Ack)
            }
            Operation::CallService {
                service,
                srv_type,
                args,
            } => {
                self.call_service(service, &srv_type, Value::Object(args), id)?;
                Ok(Reply::Ack)
            }
            Operation::AdvertiseService { service, srv_type } => {
                self.node.validate_topic_name(&service)?;
                let srv_type = normalize_type(&srv_type, InterfaceKind::Service)?;
                let handler = self.request_handler(&service);
                self.provider.create_service(&srv_type, &service, handler)?;
                Ok(Reply::Ack)
            }
            Operation::ServiceResponse { values, result, .. } => {
                self.complete_relayed_call(id, values, result);
                Ok(Reply::Silent)
            }
            Operation::UnadvertiseService { service } => {
                self.node.validate_topic_name(&service)?;
                if self.provider.destroy_service(&service)? {
                    let before = self.pending.len();
                    self.pending.retain(|_, call| call.service != service);
                    let dropped = before - self.pending.len();
                    if dropped > 0 {
                        debug!(connection = %self.id, service = %service, dropped, "cancelled pending calls");
                    }
                }
                Ok(Reply::Ack)
            }
            Operation::Unsupported => Err(BridgeError::UnsupportedOperation(op.to_string())),
        }
    }

    /// Send a request on this connection's client for `service`.  The
    /// response arrives later as [`ConnectionEvent::CallCompleted`].
    fn call_service(
        &mut self,
        service: String,
        srv_type: &str,
        args: Value,
        id: Option<String>,
    ) -> Result<(), BridgeError> {
        self.node.validate_topic_name(&service)?;
        let srv_type = normalize_type(srv_type, InterfaceKind::Service)?;
        self.provider.create_client(&srv_type, &service)?;
        let Some(client) = self.provider.client(&service) else {
            return Err(BridgeError::Middleware(format!(
                "client for '{service}' disappeared"
            )));
        };
        let pending = client.send_request(args);

        let events = self.events.clone();
        tokio::spawn(async move {
            let (values, result) = match pending.await {
                Ok(reply) => (reply.values, reply.result),
                Err(_) => (Value::Null, false),
            };
            let _ = events.send(ConnectionEvent::CallCompleted {
                service,
                id,
                values,
                result,
            });
        });
        Ok(())
    }

    /// Complete the relayed request `id` with the client's answer.  Unknown
    /// ids are ignored.  An explicit `result: false` fails the request and
    /// forwards `values` as the reason.
    fn complete_relayed_call(
        &mut self,
        id: Option<String>,
        values: Option<Value>,
        result: Option<bool>,
    ) {
        let Some(call) = id.and_then(|id| self.pending.remove(&id)) else {
            debug!(connection = %self.id, "ignoring unmatched service_response");
            return;
        };
        let values = values.unwrap_or(Value::Null);
        let delivered = if result == Some(false) {
            debug!(connection = %self.id, service = %call.service, "service call failed by provider");
            call.sink.fail(values)
        } else {
            call.sink.send(values)
        };
        if !delivered {
            debug!(connection = %self.id, service = %call.service, "caller stopped waiting");
        }
    }

    /// Handle an event from the connection's event channel.
    pub fn handle_event(&mut self, event: ConnectionEvent) {
        if self.closed {
            return;
        }
        match event {
            ConnectionEvent::ServiceRequest {
                service,
                request,
                sink,
            } => {
                if !self.provider.has_service(&service) {
                    debug!(connection = %self.id, service = %service, "request for withdrawn service");
                    return;
                }
                if sink.is_closed() {
                    debug!(connection = %self.id, service = %service, "caller gave up before relay");
                    return;
                }
                let id = Uuid::new_v4().to_string();
                self.pending.insert(
                    id.clone(),
                    PendingCall {
                        service: service.clone(),
                        sink,
                    },
                );
                self.send(ServerMessage::CallService {
                    service,
                    args: request,
                    id,
                });
            }
            ConnectionEvent::CallCompleted {
                service,
                id,
                values,
                result,
            } => {
                self.provider.destroy_client(&service);
                self.send(ServerMessage::ServiceResponse {
                    service,
                    values,
                    id,
                    result,
                });
            }
        }
    }

    /// Release everything this connection owns.  Idempotent; after this the
    /// bridge ignores all input.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.provider.clean();
        self.pending.clear();
        info!(connection = %self.id, "connection closed");
    }

    fn delivery_callback(&self) -> DeliveryCallback {
        let outbound = self.outbound.clone();
        Arc::new(move |topic: &str, msg: &Value| {
            let _ = outbound.send(ServerMessage::Publish {
                topic: topic.to_string(),
                msg: msg.clone(),
            });
        })
    }

    fn request_handler(&self, service: &str) -> RequestHandler {
        let events = self.events.clone();
        let service = service.to_string();
        Arc::new(move |request: Value, sink: ResponseSink| {
            // A closed connection drops the event, and with it the sink.
            let _ = events.send(ConnectionEvent::ServiceRequest {
                service: service.clone(),
                request,
                sink,
            });
        })
    }

    fn report_error(&self, op: Option<&str>, id: Option<String>, error: &BridgeError) {
        let msg = match op {
            Some(op) => format!("{op}: {error}"),
            None => error.to_string(),
        };
        let level = error.level();
        match level {
            StatusLevel::Error => warn!(connection = %self.id, %msg, "command failed"),
            _ => debug!(connection = %self.id, %msg, "command had no effect"),
        }
        self.send_status(ServerMessage::status(level, msg, id));
    }

    fn send_status(&self, message: ServerMessage) {
        let permitted = message
            .status_level()
            .is_none_or(|severity| self.level.permits(severity));
        if permitted {
            self.send(message);
        }
    }

    fn send(&self, message: ServerMessage) {
        if self.outbound.send(message).is_err() {
            debug!(connection = %self.id, "outbound channel closed");
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}
