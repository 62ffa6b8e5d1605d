//! rosbridge v2 wire protocol.
//!
//! Every frame is a JSON object carrying an `op` string.  Inbound frames are
//! decoded in two steps: [`Command::from_value`] checks the envelope (`op`,
//! optional `id`), then [`Command::into_operation`] decodes the typed
//! [`Operation`] so that field errors can still be reported against the
//! originating `op` and `id`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{BridgeError, StatusLevel};

/// Client → gateway operations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Change the status reporting threshold of this connection.
    SetLevel { level: String },

    /// Start publishing `topic` with messages of `type`.
    Advertise {
        topic: String,
        #[serde(rename = "type")]
        msg_type: String,
    },

    /// Release one advertisement of `topic`.
    Unadvertise { topic: String },

    /// Publish `msg` on an advertised topic.
    Publish { topic: String, msg: Value },

    /// Receive every message published on `topic` as a `publish` frame.
    Subscribe {
        topic: String,
        #[serde(rename = "type")]
        msg_type: String,
    },

    /// Stop receiving `topic`.
    Unsubscribe { topic: String },

    /// Call a service offered somewhere on the middleware graph.
    CallService {
        service: String,
        #[serde(rename = "type")]
        srv_type: String,
        #[serde(default)]
        args: Map<String, Value>,
    },

    /// Offer a service; requests are relayed back as `call_service` frames.
    AdvertiseService {
        service: String,
        #[serde(rename = "type")]
        srv_type: String,
    },

    /// Answer to a relayed `call_service`, correlated by the envelope `id`.
    ServiceResponse {
        #[serde(default)]
        service: Option<String>,
        #[serde(default)]
        values: Option<Value>,
        #[serde(default)]
        result: Option<bool>,
    },

    /// Withdraw a service this connection offers.
    UnadvertiseService { service: String },

    /// Any `op` this gateway does not implement.
    #[serde(other)]
    Unsupported,
}

/// A framed inbound command: envelope fields plus the raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// The `op` field.
    pub op: String,
    /// Client correlation id, echoed back in replies.  Non-string ids are
    /// ignored.
    pub id: Option<String>,
    body: Value,
}

impl Command {
    /// Validate the envelope of a decoded JSON frame.
    pub fn from_value(value: Value) -> Result<Self, BridgeError> {
        let Value::Object(ref map) = value else {
            return Err(BridgeError::NotAnObject);
        };
        let op = match map.get("op") {
            Some(Value::String(op)) => op.clone(),
            Some(other) => {
                return Err(BridgeError::InvalidCommand(format!(
                    "'op' must be a string, got {other}"
                )));
            }
            None => return Err(BridgeError::MissingOp),
        };
        let id = command_id(&value);
        Ok(Self { op, id, body: value })
    }

    /// Decode the typed operation, consuming the body.
    pub fn into_operation(self) -> Result<Operation, BridgeError> {
        let op = self.op;
        match serde_json::from_value::<Operation>(self.body) {
            Ok(Operation::Unsupported) => Err(BridgeError::UnsupportedOperation(op)),
            Ok(operation) => Ok(operation),
            Err(e) => Err(BridgeError::InvalidCommand(e.to_string())),
        }
    }
}

/// Extract the optional correlation `id` of a raw frame.
///
/// Non-string ids are ignored rather than rejected.
pub fn command_id(value: &Value) -> Option<String> {
    value.get("id").and_then(Value::as_str).map(str::to_owned)
}

/// Gateway → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Operation status / diagnostic reply.
    Status {
        level: StatusLevel,
        msg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    /// Message delivered on a subscribed topic.
    Publish { topic: String, msg: Value },

    /// Request relayed to a connection that offers `service`.
    CallService {
        service: String,
        args: Value,
        id: String,
    },

    /// Result of a `call_service` issued by this connection.
    ServiceResponse {
        service: String,
        values: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        result: bool,
    },
}

impl ServerMessage {
    /// Successful acknowledgement of the command `id`.
    pub fn ok(id: Option<String>) -> Self {
        Self::Status {
            level: StatusLevel::None,
            msg: "OK".to_string(),
            id,
        }
    }

    /// A status reply at `level`.
    pub fn status(level: StatusLevel, msg: impl Into<String>, id: Option<String>) -> Self {
        Self::Status {
            level,
            msg: msg.into(),
            id,
        }
    }

    /// Severity of a status reply; data messages have none.
    pub fn status_level(&self) -> Option<StatusLevel> {
        match self {
            Self::Status { level, .. } => Some(*level),
            _ => None,
        }
    }
}
