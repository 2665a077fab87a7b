//! Wrapped adapters: bind one alias to one real resource.
//!
//! A [`WrappedAdapter`] exclusively owns a [`Resource`] built by a
//! [`ResourceFactory`]. It resolves incoming command/query names through the
//! factory's [`CapabilityTable`], converts binary arguments from base64 text,
//! and hands the resource one [`EventSink`] per declared event so native
//! events come back out as Update envelopes.

use crate::link::Link;
use crate::message::{Channel, Envelope, ErrorCode};

use async_trait::async_trait;
use devlink_types::{CapabilityTable, Operation, Value};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure reported by a resource.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResourceError {
    /// The hardware call failed.
    #[error("{0}")]
    Failed(String),
    /// An argument had the wrong shape.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The resource does not implement this name although it was declared.
    #[error("not supported: {0}")]
    Unsupported(String),
}

/// Failure of one adapter operation, already classified for the wire.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("property does not exist")]
    PropertyMissing,
    #[error("{0}")]
    Invocation(String),
}

impl AdapterError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AdapterError::PropertyMissing => ErrorCode::PropertyMissing,
            AdapterError::Invocation(_) => ErrorCode::InvocationFailed,
        }
    }
}

impl From<ResourceError> for AdapterError {
    fn from(e: ResourceError) -> Self {
        AdapterError::Invocation(e.to_string())
    }
}

/// A concrete piece of equipment (or anything behaving like one).
///
/// Calls arrive from the delivery task one at a time. Background work
/// (polling, keep-alives) must report back through an [`EventSink`] rather
/// than touching adapter state.
#[async_trait]
pub trait Resource: Send + 'static {
    /// Call method `name`.
    async fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ResourceError>;

    /// Read property `name`.
    async fn read(&mut self, name: &str) -> Result<Value, ResourceError>;

    /// Write property `name`.
    async fn write(&mut self, name: &str, value: Value) -> Result<(), ResourceError>;

    /// Start delivering native `event` occurrences to `sink`.
    fn attach(&mut self, _event: &str, _sink: EventSink) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Release the underlying handle. Called before a rebuild.
    async fn shutdown(&mut self) {}
}

/// Builds resources of one type.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    /// Type name carried by Init envelopes.
    fn type_name(&self) -> &str;

    /// Callable/settable names and events of this type.
    fn capabilities(&self) -> CapabilityTable;

    /// Bind a new resource for `alias` with the given construction args.
    async fn construct(
        &self,
        alias: &str,
        args: &[Value],
    ) -> Result<Box<dyn Resource>, ResourceError>;
}

struct Route {
    link: Arc<dyn Link>,
    channel: Channel,
}

/// Where an adapter's events are sent. Shared by all of its sinks and
/// retargeted when the object is re-Init'd from another link.
#[derive(Clone, Default)]
pub struct EventRoute(Arc<RwLock<Option<Route>>>);

impl EventRoute {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, link: Arc<dyn Link>, channel: Channel) {
        let mut route = self.0.write().unwrap_or_else(|e| e.into_inner());
        *route = Some(Route { link, channel });
    }

    /// Point the route at `(link, channel)` unless it already targets an
    /// open link. Returns whether the route changed.
    pub fn claim(&self, link: &Arc<dyn Link>, channel: Channel) -> bool {
        let mut route = self.0.write().unwrap_or_else(|e| e.into_inner());
        if route.as_ref().is_some_and(|r| r.link.is_open()) {
            return false;
        }
        *route = Some(Route {
            link: Arc::clone(link),
            channel,
        });
        true
    }

    fn send(&self, envelope: &Envelope) -> bool {
        let route = self.0.read().unwrap_or_else(|e| e.into_inner());
        match route.as_ref() {
            Some(r) => match r.link.send(r.channel, envelope) {
                Ok(()) => true,
                Err(e) => {
                    debug!(alias = %envelope.alias, error = %e, "Event dropped");
                    false
                }
            },
            None => false,
        }
    }
}

/// Handle a resource uses to publish one kind of native event.
#[derive(Clone)]
pub struct EventSink {
    alias: String,
    event: String,
    route: EventRoute,
}

impl EventSink {
    pub fn new(alias: &str, event: &str, route: EventRoute) -> Self {
        Self {
            alias: alias.to_string(),
            event: event.to_string(),
            route,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    /// Publish one occurrence as exactly one Update envelope.
    ///
    /// Returns false when there is nowhere to deliver it.
    pub fn emit(&self, value: Value) -> bool {
        self.route
            .send(&Envelope::update(&self.alias, &self.event, value))
    }

    /// Publish a multi-argument occurrence.
    pub fn emit_args(&self, args: Vec<Value>) -> bool {
        self.emit(Value::List(args))
    }
}

/// Peer-side wrapper around one owned resource.
pub struct WrappedAdapter {
    alias: String,
    construction_args: Vec<Value>,
    factory: Arc<dyn ResourceFactory>,
    capabilities: CapabilityTable,
    resource: Box<dyn Resource>,
    subscriptions: Vec<String>,
    route: EventRoute,
}

impl WrappedAdapter {
    /// Construct the resource and subscribe to every declared event.
    pub async fn construct(
        factory: Arc<dyn ResourceFactory>,
        alias: &str,
        args: Vec<Value>,
    ) -> Result<Self, ResourceError> {
        let capabilities = factory.capabilities();
        let resource = factory.construct(alias, &args).await?;
        let mut adapter = Self {
            alias: alias.to_string(),
            construction_args: args,
            factory,
            subscriptions: capabilities.events().map(str::to_string).collect(),
            capabilities,
            resource,
            route: EventRoute::new(),
        };
        adapter.subscribe_all()?;
        info!(
            alias = %adapter.alias,
            type_name = adapter.factory.type_name(),
            "Adapter constructed"
        );
        Ok(adapter)
    }

    /// Destroy the resource and build a fresh one with `args`, then
    /// re-establish every event subscription on it.
    pub async fn reconstruct(&mut self, args: Vec<Value>) -> Result<(), ResourceError> {
        info!(alias = %self.alias, "Reconstructing adapter with new construction args");
        self.resource.shutdown().await;
        self.resource = self.factory.construct(&self.alias, &args).await?;
        self.construction_args = args;
        self.subscribe_all()
    }

    fn subscribe_all(&mut self) -> Result<(), ResourceError> {
        for event in &self.subscriptions {
            let sink = EventSink::new(&self.alias, event, self.route.clone());
            self.resource.attach(event, sink)?;
        }
        Ok(())
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn type_name(&self) -> &str {
        self.factory.type_name()
    }

    pub fn construction_args(&self) -> &[Value] {
        &self.construction_args
    }

    pub fn capabilities(&self) -> &CapabilityTable {
        &self.capabilities
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn route(&self) -> &EventRoute {
        &self.route
    }

    /// Execute a Command. Nothing is returned to the caller.
    pub async fn command(&mut self, name: &str, args: Vec<Value>) -> Result<(), AdapterError> {
        let op = self
            .capabilities
            .resolve_command(name)
            .ok_or(AdapterError::PropertyMissing)?;
        self.run(op, args).await.map(|_| ())
    }

    /// Execute a Query and produce the reply value.
    pub async fn query(&mut self, name: &str, args: Vec<Value>) -> Result<Value, AdapterError> {
        let op = self
            .capabilities
            .resolve_query(name)
            .ok_or(AdapterError::PropertyMissing)?;
        self.run(op, args).await
    }

    async fn run(&mut self, op: Operation, args: Vec<Value>) -> Result<Value, AdapterError> {
        match op {
            Operation::Invoke { name, binary } => {
                let args = if binary { to_binary_args(args)? } else { args };
                Ok(self.resource.invoke(&name, args).await?)
            }
            Operation::Read { name, .. } => Ok(self.resource.read(&name).await?),
            Operation::Write { name, binary } => {
                let mut args = if binary { to_binary_args(args)? } else { args };
                if args.len() != 1 {
                    warn!(alias = %self.alias, property = %name, count = args.len(), "Set expects one argument");
                    return Err(AdapterError::Invocation(format!(
                        "Set{name} expects exactly one argument, got {}",
                        args.len()
                    )));
                }
                let value = args.remove(0);
                self.resource.write(&name, value).await?;
                Ok(Value::Null)
            }
        }
    }
}

/// Base64 text arguments become raw bytes; everything else must already be
/// bytes (or null for an empty payload).
fn to_binary_args(args: Vec<Value>) -> Result<Vec<Value>, AdapterError> {
    args.into_iter()
        .map(|arg| {
            arg.to_binary()
                .map(Value::Bytes)
                .map_err(|e| AdapterError::Invocation(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scriptable resource shared by the adapter, registry and proxy tests.

    use super::*;
    use devlink_types::ValueKind;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Observable counters shared by every resource a factory builds.
    #[derive(Default)]
    pub struct Probe {
        pub constructed: AtomicUsize,
        pub shutdowns: AtomicUsize,
        pub attached: AtomicUsize,
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub sinks: Mutex<Vec<EventSink>>,
    }

    impl Probe {
        pub fn constructed(&self) -> usize {
            self.constructed.load(Ordering::SeqCst)
        }

        pub fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }

        pub fn attached(&self) -> usize {
            self.attached.load(Ordering::SeqCst)
        }

        /// Fire `event` through the most recently attached sink for it.
        pub fn fire(&self, event: &str, value: Value) -> bool {
            let sinks = self.sinks.lock().unwrap();
            sinks
                .iter()
                .rev()
                .find(|s| s.event() == event)
                .map(|s| s.emit(value))
                .unwrap_or(false)
        }
    }

    pub struct Relay {
        probe: Arc<Probe>,
        props: HashMap<String, Value>,
    }

    #[async_trait]
    impl Resource for Relay {
        async fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ResourceError> {
            match name {
                "Send" => {
                    for arg in args {
                        let bytes = arg.as_bytes().ok_or_else(|| {
                            ResourceError::InvalidArgument("Send takes bytes".into())
                        })?;
                        self.probe.sent.lock().unwrap().push(bytes.to_vec());
                    }
                    Ok(Value::Null)
                }
                "Echo" => Ok(Value::List(args)),
                "Jam" => Err(ResourceError::Failed("relay coil stuck".into())),
                "Crash" => panic!("driver fault"),
                other => Err(ResourceError::Unsupported(other.to_string())),
            }
        }

        async fn read(&mut self, name: &str) -> Result<Value, ResourceError> {
            self.props
                .get(name)
                .cloned()
                .ok_or_else(|| ResourceError::Unsupported(name.to_string()))
        }

        async fn write(&mut self, name: &str, value: Value) -> Result<(), ResourceError> {
            if name == "Locked" {
                return Err(ResourceError::Failed("front panel lock engaged".into()));
            }
            self.props.insert(name.to_string(), value);
            Ok(())
        }

        fn attach(&mut self, _event: &str, sink: EventSink) -> Result<(), ResourceError> {
            self.probe.attached.fetch_add(1, Ordering::SeqCst);
            self.probe.sinks.lock().unwrap().push(sink);
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.probe.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory for `Relay` objects. Construction fails when the first
    /// argument is the text "broken".
    pub struct RelayFactory {
        pub probe: Arc<Probe>,
    }

    impl RelayFactory {
        pub fn new() -> (Arc<Self>, Arc<Probe>) {
            let probe = Arc::new(Probe::default());
            (
                Arc::new(Self {
                    probe: probe.clone(),
                }),
                probe,
            )
        }
    }

    #[async_trait]
    impl ResourceFactory for RelayFactory {
        fn type_name(&self) -> &str {
            "Relay"
        }

        fn capabilities(&self) -> CapabilityTable {
            CapabilityTable::new()
                .settable("Power", ValueKind::Text)
                .settable("Locked", ValueKind::Bool)
                .property("Model", ValueKind::Text)
                .binary_method("Send")
                .method("Echo")
                .method("Jam")
                .method("Crash")
                .event("Disconnected")
                .event("Changed")
        }

        async fn construct(
            &self,
            _alias: &str,
            args: &[Value],
        ) -> Result<Box<dyn Resource>, ResourceError> {
            if args.first().and_then(Value::as_str) == Some("broken") {
                return Err(ResourceError::Failed("no device on port".into()));
            }
            self.probe.constructed.fetch_add(1, Ordering::SeqCst);
            let mut props = HashMap::new();
            props.insert("Power".to_string(), Value::from("On"));
            props.insert("Model".to_string(), Value::from("RX-7"));
            Ok(Box::new(Relay {
                probe: self.probe.clone(),
                props,
            }))
        }
    }
}
