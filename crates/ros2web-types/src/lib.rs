//! `ros2web-types` – shared vocabulary for the ros2web gateway.
//!
//! - [`StatusLevel`] – severity of a diagnostic reply and the per-connection
//!   threshold that filters them.
//! - [`BridgeError`] – the single error taxonomy used by every crate in the
//!   workspace.  Each variant knows the [`StatusLevel`] it is reported at.
//! - [`protocol`] – the rosbridge v2 JSON wire format.

pub mod protocol;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use protocol::{Command, Operation, ServerMessage};

/// Severity of a status reply, ordered from least to most significant.
///
/// The same type doubles as the per-connection reporting threshold set with
/// the `set_level` operation.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    /// Plain acknowledgement. Always delivered.
    None,
    Info,
    Warning,
    /// Failed command. Never suppressed.
    #[default]
    Error,
}

impl StatusLevel {
    /// Wire name of the level.
    pub fn as_str(self) -> &'static str {
        match self {
            StatusLevel::None => "none",
            StatusLevel::Info => "info",
            StatusLevel::Warning => "warning",
            StatusLevel::Error => "error",
        }
    }

    /// Whether a reply of `severity` passes this threshold.
    ///
    /// `none` acknowledgements always pass; everything else must be at least
    /// as severe as the threshold.
    pub fn permits(self, severity: StatusLevel) -> bool {
        severity == StatusLevel::None || severity >= self
    }
}

impl fmt::Display for StatusLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(StatusLevel::None),
            "info" => Ok(StatusLevel::Info),
            "warning" => Ok(StatusLevel::Warning),
            "error" => Ok(StatusLevel::Error),
            other => Err(BridgeError::InvalidLevel(other.to_string())),
        }
    }
}

/// Global error type spanning protocol faults, resource conflicts, middleware
/// failures and transport errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("missing required field 'op'")]
    MissingOp,

    #[error("command is not a JSON object")]
    NotAnObject,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("unsupported operation '{0}'")]
    UnsupportedOperation(String),

    #[error("invalid status level '{0}'")]
    InvalidLevel(String),

    #[error("invalid interface type '{0}'")]
    InvalidType(String),

    #[error("unknown interface type '{0}'")]
    UnknownType(String),

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("'{name}' is already in use with type '{existing}', refusing '{requested}'")]
    TypeConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("cannot publish to '{0}': topic has not been advertised")]
    PublishWithoutAdvertise(String),

    #[error("topic '{0}' is not advertised by this connection")]
    NotAdvertised(String),

    #[error("topic '{0}' is not subscribed by this connection")]
    NotSubscribed(String),

    #[error("service '{0}' is not offered by this connection")]
    NotOffered(String),

    #[error("service '{0}' is already offered")]
    ServiceAlreadyOffered(String),

    #[error("middleware node has been shut down")]
    NodeShutdown,

    #[error("middleware error: {0}")]
    Middleware(String),

    #[error("frame buffer exceeded {limit} bytes without a complete command")]
    FrameOverflow { limit: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Severity this error is reported at in a status reply.
    ///
    /// Releasing something this connection never owned is harmless and
    /// reported as a warning; every other failure is an error.
    pub fn level(&self) -> StatusLevel {
        match self {
            BridgeError::NotAdvertised(_)
            | BridgeError::NotSubscribed(_)
            | BridgeError::NotOffered(_) => StatusLevel::Warning,
            _ => StatusLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered_by_significance() {
        assert!(StatusLevel::Error > StatusLevel::Warning);
        assert!(StatusLevel::Warning > StatusLevel::Info);
        assert!(StatusLevel::Info > StatusLevel::None);
        assert_eq!(StatusLevel::default(), StatusLevel::Error);
    }

    #[test]
    fn default_threshold_passes_errors_and_acknowledgements_only() {
        let threshold = StatusLevel::Error;
        assert!(threshold.permits(StatusLevel::Error));
        assert!(threshold.permits(StatusLevel::None));
        assert!(!threshold.permits(StatusLevel::Warning));
        assert!(!threshold.permits(StatusLevel::Info));
    }

    #[test]
    fn none_threshold_passes_everything() {
        let threshold = StatusLevel::None;
        for severity in [
            StatusLevel::None,
            StatusLevel::Info,
            StatusLevel::Warning,
            StatusLevel::Error,
        ] {
            assert!(threshold.permits(severity), "{severity} should pass");
        }
    }

    #[test]
    fn warning_threshold_drops_info() {
        assert!(StatusLevel::Warning.permits(StatusLevel::Warning));
        assert!(!StatusLevel::Warning.permits(StatusLevel::Info));
    }

    #[test]
    fn parse_level_strings() {
        assert_eq!("warning".parse::<StatusLevel>().unwrap(), StatusLevel::Warning);
        assert_eq!("none".parse::<StatusLevel>().unwrap(), StatusLevel::None);
        let err = "loud".parse::<StatusLevel>().unwrap_err();
        assert_eq!(err, BridgeError::InvalidLevel("loud".to_string()));
    }

    #[test]
    fn level_serializes_lowercase() {
        let json = serde_json::to_string(&StatusLevel::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }

    #[test]
    fn cleanup_mismatches_are_warnings() {
        assert_eq!(
            BridgeError::NotAdvertised("/a".into()).level(),
            StatusLevel::Warning
        );
        assert_eq!(
            BridgeError::NotSubscribed("/a".into()).level(),
            StatusLevel::Warning
        );
        assert_eq!(
            BridgeError::NotOffered("/s".into()).level(),
            StatusLevel::Warning
        );
        assert_eq!(
            BridgeError::PublishWithoutAdvertise("/a".into()).level(),
            StatusLevel::Error
        );
    }

    #[test]
    fn error_display_names_the_resource() {
        let err = BridgeError::TypeConflict {
            name: "/chatter".into(),
            existing: "std_msgs/msg/String".into(),
            requested: "std_msgs/msg/Char".into(),
        };
        let text = err.to_string();
        assert!(text.contains("/chatter"));
        assert!(text.contains("std_msgs/msg/Char"));
    }
}
