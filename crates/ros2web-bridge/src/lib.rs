//! `ros2web-bridge` – the rosbridge v2 gateway core.
//!
//! Exposes a middleware [`Node`][ros2web_middleware::Node] to WebSocket
//! clients speaking the rosbridge v2 JSON protocol.
//!
//! # Modules
//!
//! - [`handle`] – [`ResourceHandle`], reference-counted ownership of one
//!   middleware resource with an exactly-once destructor.
//! - [`registry`] – [`SubscriptionRegistry`], the subscriptions shared by all
//!   connections, fanned out per topic.
//! - [`provider`] – [`ResourceProvider`], the publishers, clients and services
//!   owned by a single connection.
//! - [`framer`] – [`MessageFramer`], JSON command reassembly from a
//!   fragmented stream.
//! - [`bridge`] – [`Bridge`], the per-connection protocol state machine.
//! - [`server`] – [`BridgeServer`], WebSocket server and client modes.

pub mod bridge;
pub mod framer;
pub mod handle;
pub mod provider;
pub mod registry;
pub mod server;

pub use bridge::{Bridge, BridgeOptions, ConnectionEvent, InterfaceKind, normalize_type};
pub use framer::{DEFAULT_MAX_FRAME_BYTES, MessageFramer};
pub use handle::ResourceHandle;
pub use provider::ResourceProvider;
pub use registry::{DeliveryCallback, SubscriptionRegistry};
pub use server::{BridgeServer, ServerOptions, reconnect_delay};
