//! Gateway configuration – reads `~/.ros2web/config.toml`.
//!
//! Values are resolved in three layers, later layers winning:
//!
//! 1. the TOML file (every field optional, see the `default_*` functions),
//! 2. `ROS2WEB_*` environment variables ([`apply_env_overrides`]),
//! 3. command-line flags (applied by `main`).

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ros2web_bridge::{BridgeOptions, DEFAULT_MAX_FRAME_BYTES, ServerOptions};
use ros2web_types::{BridgeError, StatusLevel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// TCP port the WebSocket server listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// IP address the WebSocket server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Remote `ws://` endpoint.  When set the gateway dials out instead of
    /// listening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Initial status reporting level of every connection.
    #[serde(default = "default_status_level")]
    pub status_level: String,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Name of the middleware node all connections share.
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Upper bound of the client-mode reconnect backoff.
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    /// Interface types accepted in addition to the built-in catalogue,
    /// fully qualified (`pkg/msg/Type`, `pkg/srv/Type`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known_types: Vec<String>,
}

fn default_port() -> u16 {
    9090
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_status_level() -> String {
    StatusLevel::Error.to_string()
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_max_connections() -> usize {
    100
}
fn default_node_name() -> String {
    "ros2_web_bridge".to_string()
}
fn default_reconnect_max_delay_secs() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            address: None,
            status_level: default_status_level(),
            max_frame_bytes: default_max_frame_bytes(),
            max_connections: default_max_connections(),
            node_name: default_node_name(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            known_types: Vec::new(),
        }
    }
}

impl Config {
    /// Socket address for server mode.
    pub fn listen_addr(&self) -> Result<SocketAddr, BridgeError> {
        let ip: IpAddr = self
            .bind
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid bind address '{}': {e}", self.bind)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Transport and per-connection settings.  Fails on an invalid
    /// `status_level`.
    pub fn server_options(&self) -> Result<ServerOptions, BridgeError> {
        Ok(ServerOptions {
            bridge: BridgeOptions {
                status_level: self.status_level.parse()?,
                max_frame_bytes: self.max_frame_bytes,
            },
            max_connections: self.max_connections,
            reconnect_max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
        })
    }
}

/// Return the path to `~/.ros2web/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".ros2web").join("config.toml")
}

/// Load the configuration and apply environment overrides.
///
/// Without an explicit `path` a missing default file means defaults; an
/// explicit path that does not exist is an error.
pub fn load(path: Option<&Path>) -> Result<Config, BridgeError> {
    let mut cfg = match path {
        Some(path) => load_from(path)?.ok_or_else(|| {
            BridgeError::Config(format!("config file {} not found", path.display()))
        })?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg)?;
    Ok(cfg)
}

/// Parse the TOML file at `path`.  Returns `None` if it does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, BridgeError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BridgeError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    let cfg: Config = toml::from_str(&raw).map_err(|e| {
        BridgeError::Config(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `ROS2WEB_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ROS2WEB_PORT` | `port` |
/// | `ROS2WEB_BIND` | `bind` |
/// | `ROS2WEB_ADDRESS` | `address` |
/// | `ROS2WEB_STATUS_LEVEL` | `status_level` |
pub fn apply_env_overrides(cfg: &mut Config) -> Result<(), BridgeError> {
    if let Ok(v) = std::env::var("ROS2WEB_PORT") {
        cfg.port = v
            .parse()
            .map_err(|_| BridgeError::Config(format!("ROS2WEB_PORT is not a port: '{v}'")))?;
    }
    if let Ok(v) = std::env::var("ROS2WEB_BIND") {
        cfg.bind = v;
    }
    if let Ok(v) = std::env::var("ROS2WEB_ADDRESS")
        && !v.is_empty()
    {
        cfg.address = Some(v);
    }
    if let Ok(v) = std::env::var("ROS2WEB_STATUS_LEVEL") {
        v.parse::<StatusLevel>()?;
        cfg.status_level = v;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn config_path_points_to_ros2web_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".ros2web"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let result = load_from(&dir.path().join("absent.toml")).expect("no error");
        assert!(result.is_none());
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "");
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.status_level, "error");
        assert_eq!(cfg.max_frame_bytes, 16 * 1024 * 1024);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(
            &dir,
            r#"
port = 9191
address = "ws://robot:9090"
status_level = "warning"
known_types = ["my_pkg/msg/Custom"]
"#,
        );
        let cfg = load_from(&path).expect("load ok").expect("some");
        assert_eq!(cfg.port, 9191);
        assert_eq!(cfg.address.as_deref(), Some("ws://robot:9090"));
        assert_eq!(cfg.known_types, vec!["my_pkg/msg/Custom".to_string()]);
        assert_eq!(cfg.bind, "0.0.0.0");

        let options = cfg.server_options().expect("valid options");
        assert_eq!(options.bridge.status_level, StatusLevel::Warning);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = write(&dir, "port = \"not a number\"");
        assert!(matches!(load_from(&path), Err(BridgeError::Config(_))));
    }

    #[test]
    fn invalid_status_level_is_rejected() {
        let cfg = Config {
            status_level: "verbose".into(),
            ..Config::default()
        };
        assert_eq!(
            cfg.server_options().unwrap_err(),
            BridgeError::InvalidLevel("verbose".into())
        );
    }

    #[test]
    fn listen_addr_combines_bind_and_port() {
        let cfg = Config {
            bind: "127.0.0.1".into(),
            port: 9999,
            ..Config::default()
        };
        assert_eq!(cfg.listen_addr().unwrap(), "127.0.0.1:9999".parse().unwrap());

        let cfg = Config {
            bind: "not-an-ip".into(),
            ..Config::default()
        };
        assert!(cfg.listen_addr().is_err());
    }

    // Every ROS2WEB_* override is exercised in this one test so that no
    // other test observes a half-configured environment.
    #[test]
    fn apply_env_overrides_layers_on_top_of_file_values() {
        // SAFETY: no other test reads these env-vars.
        unsafe {
            std::env::set_var("ROS2WEB_PORT", "9999");
            std::env::set_var("ROS2WEB_ADDRESS", "ws://robot-host:9090");
            std::env::set_var("ROS2WEB_STATUS_LEVEL", "info");
        }
        let mut cfg = Config::default();
        let applied = apply_env_overrides(&mut cfg);

        unsafe { std::env::set_var("ROS2WEB_STATUS_LEVEL", "chatty") };
        let mut rejected = Config::default();
        let invalid = apply_env_overrides(&mut rejected);

        unsafe { std::env::set_var("ROS2WEB_STATUS_LEVEL", "info") };
        unsafe { std::env::set_var("ROS2WEB_PORT", "not-a-port") };
        let bad_port = apply_env_overrides(&mut Config::default());

        unsafe {
            std::env::remove_var("ROS2WEB_PORT");
            std::env::remove_var("ROS2WEB_ADDRESS");
            std::env::remove_var("ROS2WEB_STATUS_LEVEL");
        }

        applied.unwrap();
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.address.as_deref(), Some("ws://robot-host:9090"));
        assert_eq!(cfg.status_level, "info");

        assert!(matches!(invalid, Err(BridgeError::InvalidLevel(_))));
        assert_eq!(rejected.status_level, "error");
        assert!(matches!(bad_port, Err(BridgeError::Config(_))));
    }
}
