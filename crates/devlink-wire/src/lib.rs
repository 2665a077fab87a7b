//! devlink wire protocol: remote objects that behave like local ones.
//!
//! A library of device-control classes runs on one host while the resources
//! they drive are attached to another. Commands, blocking queries and
//! hardware events travel as JSON envelopes over a framed link.
//!
//! ## Architecture
//!
//! - **Envelope**: JSON-framed protocol messages (`message`)
//! - **Link**: Channel-multiplexed transport, in-memory or authenticated TCP (`link`)
//! - **ProxyNode**: Caller-side stand-in for one remote object (`proxy`)
//! - **Registry / Dispatcher**: Host-side alias directory and envelope routing (`registry`, `dispatch`)
//! - **WrappedAdapter**: Binds one alias to one concrete resource (`adapter`)
//! - **PresenceManifest**: Which optional units are physically fitted (`presence`)

pub mod adapter;
pub mod dispatch;
pub mod link;
pub mod message;
pub mod presence;
pub mod proxy;
pub mod registry;

pub use adapter::{EventSink, Resource, ResourceError, ResourceFactory, WrappedAdapter};
pub use dispatch::{DeviceHost, Dispatcher};
pub use link::{Inbound, Link, LinkError, LinkEvent, LinkListener, MemoryLink, TcpLink};
pub use message::{Channel, Envelope, EnvelopeKind, ErrorCode};
pub use presence::{AllPresent, PresenceManifest, StaticManifest};
pub use proxy::{ErrorRecord, ProxyClient, ProxyError, ProxyNode, ProxySpec, QueryError};
pub use registry::{InitOutcome, Registry, SlotState};
