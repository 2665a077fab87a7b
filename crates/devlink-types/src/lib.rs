//! Core types for the devlink object-proxy protocol.
//!
//! This crate defines the shared data structures used by the wire protocol,
//! the proxy side and the peer registry: payload values, capability tables,
//! configuration and the top-level error type. It contains no business logic.

pub mod capability;
pub mod config;
pub mod error;
pub mod value;

pub use capability::{CachePolicy, Capability, CapabilityTable, Operation, PropertySpec};
pub use error::{DevlinkError, DevlinkResult};
pub use value::{Value, ValueKind};
