//! `ros2web-middleware` – the gateway's view of the robotics middleware.
//!
//! # Modules
//!
//! - [`node`] – The [`Node`] capability trait and the resource handles it
//!   hands out (publishers, subscriptions, service clients and servers).
//! - [`naming`] – Topic / service name validation and expansion.
//! - [`local`] – [`LocalNode`], an in-process middleware that routes messages
//!   and service requests between the resources created on it.

pub mod local;
pub mod naming;
pub mod node;

pub use local::{LocalNode, NodeStats, ResourceStats, DEFAULT_INTERFACES};
pub use node::{
    MessageCallback, Node, PendingResponse, Publisher, RequestHandler, ResourceId, ResponseSink,
    ServiceClient, ServiceReply, ServiceServer, Subscription,
};
