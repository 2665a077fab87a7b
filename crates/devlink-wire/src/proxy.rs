//! Caller-side stand-ins for remote objects.
//!
//! A [`ProxyClient`] owns one link and the delivery task reading from it.
//! Each [`ProxyNode`] it hands out behaves like the remote object: commands
//! are fire-and-forget, queries suspend until the matching reply (or a
//! timeout), and events arrive at registered handlers.
//!
//! Every outstanding query owns one slot in the client's pending table,
//! keyed by a process-wide correlation id. The slot is removed exactly once,
//! by whichever of reply, error, timeout or disconnect gets there first.

use crate::link::{Inbound, Link, LinkError, LinkEvent};
use crate::message::{Channel, Envelope, EnvelopeKind, ErrorCode};

use dashmap::DashMap;
use devlink_types::capability::SET_PREFIX;
use devlink_types::config::ProxyConfig;
use devlink_types::{CachePolicy, PropertySpec, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

/// Event delivered to every node when its link goes down.
pub const OFFLINE_EVENT: &str = "Offline";

static NEXT_CORRELATION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a correlation id. Ids are never reused within a process.
pub fn next_correlation_id() -> u64 {
    NEXT_CORRELATION_ID.fetch_add(1, Ordering::Relaxed)
}

/// An Error envelope as seen by the caller.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{alias}.{}: {message} ({code:?})", .property.as_deref().unwrap_or("<init>"))]
pub struct ErrorRecord {
    pub alias: String,
    pub property: Option<String>,
    pub args: Vec<Value>,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorRecord {
    fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            alias: envelope.alias.clone(),
            property: envelope.property.clone(),
            args: envelope.args.clone(),
            code: envelope.error_code().unwrap_or(ErrorCode::Unknown),
            message: envelope.error_message(),
        }
    }

    fn offline(alias: &str, property: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            alias: alias.to_string(),
            property: property.map(str::to_string),
            args: Vec::new(),
            code: ErrorCode::Offline,
            message: message.into(),
        }
    }
}

/// Failure of a query where timeout is distinguishable from an empty reply.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no reply to '{property}' within {timeout:?}")]
    Timeout { property: String, timeout: Duration },
    #[error("peer error: {0}")]
    Remote(ErrorRecord),
    #[error("link closed before the reply arrived")]
    Closed,
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

/// Failure to attach a proxy node.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("construction failed: {0}")]
    Construction(ErrorRecord),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;
type QuerySlot = oneshot::Sender<Result<Value, ErrorRecord>>;
type InitSlot = oneshot::Sender<Result<(), ErrorRecord>>;

struct PendingQuery {
    alias: String,
    property: String,
    slot: QuerySlot,
}

/// Description of the remote object a node stands in for.
#[derive(Debug, Clone)]
pub struct ProxySpec {
    pub type_name: String,
    pub alias: String,
    pub channel: Option<Channel>,
    pub args: Vec<Value>,
    pub properties: Vec<PropertySpec>,
}

impl ProxySpec {
    pub fn new(type_name: &str, alias: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            alias: alias.to_string(),
            channel: None,
            args: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub fn args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn property(mut self, spec: PropertySpec) -> Self {
        self.properties.push(spec);
        self
    }
}

struct NodeState {
    alias: String,
    type_name: String,
    channel: Channel,
    construction_args: RwLock<Vec<Value>>,
    properties: RwLock<HashMap<String, PropertySpec>>,
    cache: RwLock<HashMap<String, Value>>,
    handlers: RwLock<HashMap<String, Handler>>,
    mirrors: RwLock<HashMap<String, (String, usize)>>,
    fetch_lock: Mutex<()>,
}

impl NodeState {
    fn new(spec: &ProxySpec, channel: Channel) -> Self {
        Self {
            alias: spec.alias.clone(),
            type_name: spec.type_name.clone(),
            channel,
            construction_args: RwLock::new(spec.args.clone()),
            properties: RwLock::new(
                spec.properties
                    .iter()
                    .map(|p| (p.name.clone(), p.clone()))
                    .collect(),
            ),
            cache: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            mirrors: RwLock::new(HashMap::new()),
            fetch_lock: Mutex::new(()),
        }
    }

    fn policy(&self, name: &str) -> CachePolicy {
        let properties = self.properties.read().unwrap_or_else(|e| e.into_inner());
        properties.get(name).map(|p| p.policy).unwrap_or_default()
    }

    fn empty_value(&self, name: &str) -> Value {
        let properties = self.properties.read().unwrap_or_else(|e| e.into_inner());
        properties
            .get(name)
            .map(|p| p.kind.empty())
            .unwrap_or(Value::Null)
    }

    fn cached(&self, name: &str) -> Option<Value> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(name).cloned()
    }

    fn store(&self, name: &str, value: Value) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(name.to_string(), value);
    }

    /// Apply a mirror for `event`, then run its handler.
    fn on_event(&self, event: &str, value: &Value) {
        let mirror = {
            let mirrors = self.mirrors.read().unwrap_or_else(|e| e.into_inner());
            mirrors.get(event).cloned()
        };
        if let Some((property, index)) = mirror {
            match value.event_arg(index) {
                Some(arg) => self.store(&property, arg.clone()),
                None => debug!(alias = %self.alias, event, index, "Mirrored argument missing"),
            }
        }

        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(event).cloned()
        };
        match handler {
            Some(handler) => handler(value),
            None => debug!(alias = %self.alias, event, "No handler for event"),
        }
    }
}

/// Client half of the protocol for one link.
pub struct ProxyClient {
    link: Arc<dyn Link>,
    config: ProxyConfig,
    pending: DashMap<u64, PendingQuery>,
    init_waiters: DashMap<String, Vec<InitSlot>>,
    nodes: DashMap<String, Arc<NodeState>>,
    online: AtomicBool,
}

impl ProxyClient {
    /// Wrap `link` and start the delivery task draining `inbound`.
    pub fn new(link: Arc<dyn Link>, inbound: Inbound, config: ProxyConfig) -> Arc<Self> {
        let client = Arc::new(Self {
            link,
            config,
            pending: DashMap::new(),
            init_waiters: DashMap::new(),
            nodes: DashMap::new(),
            online: AtomicBool::new(true),
        });
        let weak = Arc::downgrade(&client);
        tokio::spawn(Self::delivery_loop(weak, inbound));
        client
    }

    async fn delivery_loop(client: Weak<Self>, mut inbound: Inbound) {
        while let Some(event) = inbound.recv().await {
            let Some(client) = client.upgrade() else {
                break;
            };
            match event {
                LinkEvent::Envelope { channel, envelope } => client.deliver(channel, envelope),
                LinkEvent::Disconnected => {
                    client.go_offline();
                    break;
                }
            }
        }
        debug!("Proxy delivery task exiting");
    }

    /// Whether the link is still up as far as this client knows.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire) && self.link.is_open()
    }

    /// Outstanding queries.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Create (or re-create) the remote object and return its proxy.
    ///
    /// Waits for the Init acknowledgement up to the init timeout. A timeout
    /// is logged and the node is returned anyway; an Error reply fails.
    pub async fn attach(self: &Arc<Self>, spec: ProxySpec) -> Result<ProxyNode, ProxyError> {
        let node = self.bind(&spec);
        let (tx, rx) = oneshot::channel();
        self.init_waiters
            .entry(spec.alias.clone())
            .or_default()
            .push(tx);

        let init = Envelope::init(&spec.alias, &spec.type_name, spec.args.clone());
        if let Err(e) = self.link.send(node.state.channel, &init) {
            self.init_waiters.remove(&spec.alias);
            return Err(e.into());
        }

        let timeout = self.config.init_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(alias = %spec.alias, type_name = %spec.type_name, "Init acknowledged");
                Ok(node)
            }
            Ok(Ok(Err(record))) => {
                error!(alias = %spec.alias, error = %record, "Init rejected by peer");
                Err(ProxyError::Construction(record))
            }
            Ok(Err(_)) => Err(ProxyError::Link(LinkError::ConnectionClosed)),
            Err(_) => {
                warn!(
                    alias = %spec.alias,
                    timeout_ms = timeout.as_millis() as u64,
                    "No Init acknowledgement; continuing"
                );
                Ok(node)
            }
        }
    }

    /// Proxy for an object the peer registered on its own, without sending
    /// an Init.
    pub fn detached(self: &Arc<Self>, spec: ProxySpec) -> ProxyNode {
        self.bind(&spec)
    }

    /// Find or create the local state for `spec`. Re-binding an alias with
    /// new construction args keeps its handlers and mirrors but drops the
    /// property cache.
    fn bind(self: &Arc<Self>, spec: &ProxySpec) -> ProxyNode {
        let channel = spec.channel.unwrap_or(self.config.default_channel);
        let state = self
            .nodes
            .entry(spec.alias.clone())
            .or_insert_with(|| Arc::new(NodeState::new(spec, channel)))
            .clone();

        {
            let mut args = state
                .construction_args
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if *args != spec.args {
                info!(alias = %spec.alias, "Construction args changed; clearing property cache");
                *args = spec.args.clone();
                state
                    .cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .clear();
            }
        }
        {
            let mut properties = state.properties.write().unwrap_or_else(|e| e.into_inner());
            for p in &spec.properties {
                properties.insert(p.name.clone(), p.clone());
            }
        }

        ProxyNode {
            client: Arc::clone(self),
            state,
        }
    }

    fn deliver(&self, channel: Channel, envelope: Envelope) {
        match envelope.kind {
            EnvelopeKind::Update => match (envelope.correlation_id, &envelope.property) {
                (Some(id), _) => {
                    let value = envelope.value.unwrap_or(Value::Null);
                    self.fill(id, Ok(value));
                }
                (None, None) => self.finish_init(&envelope.alias, Ok(())),
                (None, Some(event)) => self.dispatch_event(&envelope.alias, event, &envelope.value),
            },
            EnvelopeKind::Error => {
                let record = ErrorRecord::from_envelope(&envelope);
                match (envelope.correlation_id, &envelope.property) {
                    (Some(id), _) => self.fill(id, Err(record)),
                    (None, None) => self.finish_init(&envelope.alias, Err(record)),
                    (None, Some(_)) => {
                        warn!(channel, error = %record, "Command failed on peer");
                    }
                }
            }
            EnvelopeKind::Init | EnvelopeKind::Command | EnvelopeKind::Query => {
                warn!(
                    channel,
                    alias = %envelope.alias,
                    kind = ?envelope.kind,
                    "Unexpected request envelope on the proxy side"
                );
            }
        }
    }

    fn fill(&self, id: u64, result: Result<Value, ErrorRecord>) {
        match self.pending.remove(&id) {
            Some((_, pending)) => {
                if let Err(e) = &result {
                    error!(
                        alias = %pending.alias,
                        property = %pending.property,
                        error = %e,
                        "Query failed"
                    );
                }
                // The caller may have given up between our remove and this send
                let _ = pending.slot.send(result);
            }
            None => {
                debug!(correlation_id = id, "Dropping reply for a query that is no longer pending");
            }
        }
    }

    fn finish_init(&self, alias: &str, result: Result<(), ErrorRecord>) {
        match self.init_waiters.remove(alias) {
            Some((_, waiters)) => {
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            }
            None => match result {
                Ok(()) => debug!(alias, "Unsolicited Init acknowledgement"),
                Err(e) => error!(alias, error = %e, "Init failed after the caller stopped waiting"),
            },
        }
    }

    fn dispatch_event(&self, alias: &str, event: &str, value: &Option<Value>) {
        let Some(state) = self.nodes.get(alias).map(|n| Arc::clone(n.value())) else {
            debug!(alias, event, "Update for an alias with no proxy");
            return;
        };
        state.on_event(event, value.as_ref().unwrap_or(&Value::Null));
    }

    /// Fail everything in flight and tell every node its link is gone.
    fn go_offline(&self) {
        self.online.store(false, Ordering::Release);
        warn!(nodes = self.nodes.len(), pending = self.pending.len(), "Link lost; proxies offline");

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.slot.send(Err(ErrorRecord::offline(
                    &pending.alias,
                    Some(&pending.property),
                    "link closed",
                )));
            }
        }

        let aliases: Vec<String> = self.init_waiters.iter().map(|e| e.key().clone()).collect();
        for alias in aliases {
            self.finish_init(&alias, Err(ErrorRecord::offline(&alias, None, "link closed")));
        }

        let nodes: Vec<Arc<NodeState>> = self.nodes.iter().map(|n| Arc::clone(n.value())).collect();
        for node in nodes {
            node.on_event(OFFLINE_EVENT, &Value::Null);
        }
    }
}

/// Caller-side stand-in for one remote object.
#[derive(Clone)]
pub struct ProxyNode {
    client: Arc<ProxyClient>,
    state: Arc<NodeState>,
}

impl ProxyNode {
    pub fn alias(&self) -> &str {
        &self.state.alias
    }

    pub fn type_name(&self) -> &str {
        &self.state.type_name
    }

    pub fn channel(&self) -> Channel {
        self.state.channel
    }

    pub fn construction_args(&self) -> Vec<Value> {
        self.state
            .construction_args
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Fire-and-forget. Peer-side failures are never reported back here.
    pub fn command(&self, name: &str, args: Vec<Value>) -> Result<(), LinkError> {
        let envelope = Envelope::command(&self.state.alias, name, args);
        self.client.link.send(self.state.channel, &envelope)
    }

    /// Query with the client's default timeout. See [`ProxyNode::query_within`].
    pub async fn query(&self, name: &str, args: Vec<Value>) -> Result<Value, ErrorRecord> {
        self.query_within(name, args, self.client.config.query_timeout())
            .await
    }

    /// Query `name` and wait for the reply.
    ///
    /// A timeout yields the declared type's empty value, not an error.
    pub async fn query_within(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, ErrorRecord> {
        let result = self.try_query_within(name, args, timeout).await;
        self.settle(name, result).map(|(value, _)| value)
    }

    pub async fn try_query(&self, name: &str, args: Vec<Value>) -> Result<Value, QueryError> {
        self.try_query_within(name, args, self.client.config.query_timeout())
            .await
    }

    /// Like [`ProxyNode::query_within`], but a timeout is an error.
    pub async fn try_query_within(
        &self,
        name: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, QueryError> {
        let id = next_correlation_id();
        let (tx, rx) = oneshot::channel();
        self.client.pending.insert(
            id,
            PendingQuery {
                alias: self.state.alias.clone(),
                property: name.to_string(),
                slot: tx,
            },
        );

        // Cleared on every exit, including a caller that stops polling
        let _slot = PendingSlot {
            pending: &self.client.pending,
            id,
        };

        let envelope = Envelope::query(&self.state.alias, name, args, id);
        self.client.link.send(self.state.channel, &envelope)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(record))) => Err(QueryError::Remote(record)),
            Ok(Err(_)) => Err(QueryError::Closed),
            Err(_) => Err(QueryError::Timeout {
                property: name.to_string(),
                timeout,
            }),
        }
    }

    /// Map a strict query result onto the lenient contract. The flag says
    /// whether the value was confirmed by the peer.
    fn settle(
        &self,
        name: &str,
        result: Result<Value, QueryError>,
    ) -> Result<(Value, bool), ErrorRecord> {
        match result {
            Ok(value) => Ok((value, true)),
            Err(QueryError::Timeout { timeout, .. }) => {
                warn!(
                    alias = %self.state.alias,
                    property = name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Query timed out; returning empty value"
                );
                Ok((self.state.empty_value(name), false))
            }
            Err(QueryError::Remote(record)) => Err(record),
            Err(e @ (QueryError::Closed | QueryError::Link(_))) => Err(ErrorRecord::offline(
                &self.state.alias,
                Some(name),
                e.to_string(),
            )),
        }
    }

    /// Read a property honoring its cache policy.
    pub async fn get(&self, name: &str) -> Result<Value, ErrorRecord> {
        match self.state.policy(name) {
            CachePolicy::AlwaysFetchLive => {
                let result = self.try_query(name, Vec::new()).await;
                let (value, confirmed) = self.settle(name, result)?;
                if confirmed {
                    self.state.store(name, value.clone());
                }
                Ok(value)
            }
            CachePolicy::FetchOnceThenCache => {
                if let Some(value) = self.state.cached(name) {
                    return Ok(value);
                }
                let _guard = self.state.fetch_lock.lock().await;
                if let Some(value) = self.state.cached(name) {
                    return Ok(value);
                }
                let result = self.try_query(name, Vec::new()).await;
                let (value, confirmed) = self.settle(name, result)?;
                if confirmed {
                    self.state.store(name, value.clone());
                }
                Ok(value)
            }
        }
    }

    /// Write a property. The local cache is updated before the peer confirms
    /// anything and keeps the local value even if the peer later fails.
    pub fn set(&self, name: &str, value: Value) -> Result<(), LinkError> {
        self.state.store(name, value.clone());
        self.command(&format!("{SET_PREFIX}{name}"), vec![value])
    }

    /// The locally cached value of `name`, without touching the link.
    pub fn cached(&self, name: &str) -> Option<Value> {
        self.state.cached(name)
    }

    /// Run `handler` for every `event` Update. Replaces any earlier handler.
    pub fn subscribe<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut handlers = self.state.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(event.to_string(), Arc::new(handler));
    }

    pub fn unsubscribe(&self, event: &str) -> bool {
        let mut handlers = self.state.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(event).is_some()
    }

    /// Copy argument `arg_index` of every `event` into cached `property`
    /// before the event's handler runs.
    pub fn mirror(&self, event: &str, property: &str, arg_index: usize) {
        let mut mirrors = self.state.mirrors.write().unwrap_or_else(|e| e.into_inner());
        mirrors.insert(event.to_string(), (property.to_string(), arg_index));
    }
}

/// Removes a query's pending entry when the waiting future goes away.
struct PendingSlot<'a> {
    pending: &'a DashMap<u64, PendingQuery>,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl std::fmt::Debug for ProxyNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyNode")
            .field("alias", &self.state.alias)
            .field("type_name", &self.state.type_name)
            .field("channel", &self.state.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::{Probe, RelayFactory};
    use crate::adapter::WrappedAdapter;
    use crate::dispatch::{DeviceHost, OBJECT_MISSING};
    use crate::link::MemoryLink;
    use crate::registry::Registry;
    use devlink_types::value::encode_base64;
    use devlink_types::ValueKind;
    use tokio::sync::mpsc;

    fn fast_config() -> ProxyConfig {
        ProxyConfig {
            query_timeout_ms: 200,
            init_timeout_ms: 200,
            ..ProxyConfig::default()
        }
    }

    /// A proxy client wired to a live device host serving `Relay` objects.
    fn setup() -> (Arc<ProxyClient>, Arc<Probe>, Arc<MemoryLink>) {
        let registry = Registry::new();
        let (factory, probe) = RelayFactory::new();
        registry.add_factory(factory);
        let host = DeviceHost::new(registry);
        let ((host_link, host_rx), (client_link, client_rx)) = MemoryLink::pair();
        host.serve_link(host_link.clone(), host_rx);
        let client = ProxyClient::new(client_link, client_rx, fast_config());
        (client, probe, host_link)
    }

    fn relay_spec(alias: &str) -> ProxySpec {
        ProxySpec::new("Relay", alias)
            .property(PropertySpec::cached("Power", ValueKind::Text))
            .property(PropertySpec::cached("Locked", ValueKind::Bool))
            .property(PropertySpec::live("Model", ValueKind::Text))
    }

    #[test]
    fn test_correlation_ids_increase() {
        let a = next_correlation_id();
        let b = next_correlation_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_query_returns_value_and_clears_slot() {
        let (client, _probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();

        let value = node
            .query_within("Power", vec![], Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(value, Value::from("On"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_binary_command_reaches_resource_without_reply() {
        let (client, probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();

        let payload = Value::Text(encode_base64(b"\x00\x01\xff"));
        node.command("Send", vec![payload]).unwrap();
        // Same link, same order: once this answers, Send has been handled
        node.query("Model", vec![]).await.unwrap();

        assert_eq!(probe.sent.lock().unwrap().as_slice(), &[vec![0x00, 0x01, 0xff]]);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_event_reaches_handler_without_query() {
        let (client, probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.subscribe("Disconnected", move |value| {
            let _ = tx.send(value.clone());
        });

        assert!(probe.fire("Disconnected", Value::from("cable pulled")));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Value::from("cable pulled")));
    }

    #[tokio::test]
    async fn test_query_on_uninitialized_alias_returns_error_record() {
        let (client, _probe, _host) = setup();
        let node = client.detached(relay_spec("Relay9"));

        let err = node
            .query_within("Power", vec![], Duration::from_secs(3))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ObjectMissing);
        assert_eq!(err.message, OBJECT_MISSING);
        assert_eq!(err.property.as_deref(), Some("Power"));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_yields_empty_value_and_removes_slot() {
        // Nobody serves the other end
        let ((link, rx), (_peer, _peer_rx)) = MemoryLink::pair();
        let client = ProxyClient::new(link, rx, fast_config());
        let node = client.detached(relay_spec("Relay1"));

        let value = node
            .query_within("Locked", vec![], Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(value, Value::Bool(false));
        assert_eq!(client.pending_count(), 0);

        let err = node
            .try_query_within("Power", vec![], Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout { .. }));
        assert_eq!(client.pending_count(), 0);

        // A timed-out fetch is not memoized
        assert_eq!(node.get("Power").await.unwrap(), Value::from(""));
        assert_eq!(node.cached("Power"), None);
    }

    #[tokio::test]
    async fn test_attach_without_ack_still_returns_node() {
        let ((link, rx), (_peer, _peer_rx)) = MemoryLink::pair();
        let client = ProxyClient::new(link, rx, fast_config());
        let node = client.attach(relay_spec("Relay1")).await.unwrap();
        assert_eq!(node.alias(), "Relay1");
        assert_eq!(node.type_name(), "Relay");
    }

    #[tokio::test]
    async fn test_failed_construction_surfaces() {
        let (client, _probe, _host) = setup();
        let err = client
            .attach(relay_spec("Relay1").args(vec![Value::from("broken")]))
            .await
            .unwrap_err();
        match err {
            ProxyError::Construction(record) => {
                assert_eq!(record.code, ErrorCode::ConstructionFailed);
                assert_eq!(record.property, None);
            }
            other => panic!("Expected construction error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_once_is_memoized_and_live_is_not() {
        let (client, _probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();

        assert_eq!(node.get("Power").await.unwrap(), Value::from("On"));
        // Change the peer without touching the local cache
        node.command("SetPower", vec![Value::from("Off")]).unwrap();
        assert_eq!(node.query("Power", vec![]).await.unwrap(), Value::from("Off"));
        assert_eq!(node.get("Power").await.unwrap(), Value::from("On"));

        assert_eq!(node.get("Model").await.unwrap(), Value::from("RX-7"));
        assert_eq!(node.cached("Model"), Some(Value::from("RX-7")));
    }

    #[tokio::test]
    async fn test_optimistic_set_survives_peer_error() {
        let (client, _probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();

        node.set("Locked", Value::Bool(true)).unwrap();
        assert_eq!(node.cached("Locked"), Some(Value::Bool(true)));

        // The peer refuses the write; the command issuer never hears of it
        node.query("Model", vec![]).await.unwrap();
        assert_eq!(node.get("Locked").await.unwrap(), Value::Bool(true));

        node.set("Power", Value::from("Standby")).unwrap();
        assert_eq!(node.query("Power", vec![]).await.unwrap(), Value::from("Standby"));
    }

    #[tokio::test]
    async fn test_mirror_updates_cache_before_handler() {
        let (client, probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();
        node.mirror("Changed", "Power", 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = node.clone();
        node.subscribe("Changed", move |_| {
            let _ = tx.send(observer.cached("Power"));
        });

        probe.fire(
            "Changed",
            Value::List(vec![Value::from("Power"), Value::from("Standby")]),
        );
        let seen = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(seen, Some(Some(Value::from("Standby"))));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (client, probe, _host) = setup();
        let node = client.attach(relay_spec("Relay1")).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.subscribe("Disconnected", move |v| {
            let _ = tx.send(v.clone());
        });
        assert!(node.unsubscribe("Disconnected"));
        assert!(!node.unsubscribe("Disconnected"));

        probe.fire("Disconnected", Value::Null);
        node.query("Model", vec![]).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reattach_with_new_args_keeps_handlers() {
        let (client, probe, _host) = setup();
        let node = client
            .attach(relay_spec("Relay1").args(vec![Value::Int(1)]))
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.subscribe("Disconnected", move |v| {
            let _ = tx.send(v.clone());
        });
        node.get("Power").await.unwrap();

        let again = client
            .attach(relay_spec("Relay1").args(vec![Value::Int(2)]))
            .await
            .unwrap();
        assert_eq!(probe.constructed(), 2);
        assert_eq!(probe.shutdowns(), 1);
        assert_eq!(again.construction_args(), vec![Value::Int(2)]);
        assert_eq!(node.cached("Power"), None);

        probe.fire("Disconnected", Value::from("after rebuild"));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Value::from("after rebuild")));
    }

    #[tokio::test]
    async fn test_disconnect_fires_offline_and_fails_pending() {
        let ((link, rx), (peer, _peer_rx)) = MemoryLink::pair();
        let client = ProxyClient::new(link, rx, fast_config());
        let node = client.detached(relay_spec("Relay1"));
        let (tx, mut offline) = mpsc::unbounded_channel();
        node.subscribe(OFFLINE_EVENT, move |_| {
            let _ = tx.send(());
        });

        let waiting = {
            let node = node.clone();
            tokio::spawn(async move {
                node.try_query_within("Power", vec![], Duration::from_secs(5))
                    .await
            })
        };
        while client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        peer.close();

        match waiting.await.unwrap() {
            Err(QueryError::Remote(record)) => assert_eq!(record.code, ErrorCode::Offline),
            other => panic!("Expected offline error, got {other:?}"),
        }
        tokio::time::timeout(Duration::from_secs(1), offline.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_online());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_registered_object_delivers_events_to_detached_proxy() {
        let registry = Registry::new();
        let (factory, probe) = RelayFactory::new();
        let adapter = WrappedAdapter::construct(factory, "Relay4", vec![])
            .await
            .unwrap();
        registry.register("Relay", "Relay4", adapter).unwrap();
        let host = DeviceHost::new(registry);
        let ((host_link, host_rx), (client_link, client_rx)) = MemoryLink::pair();
        host.serve_link(host_link, host_rx);
        let client = ProxyClient::new(client_link, client_rx, fast_config());

        let node = client.detached(relay_spec("Relay4"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        node.subscribe("Disconnected", move |value| {
            let _ = tx.send(value.clone());
        });
        assert_eq!(node.query("Power", vec![]).await.unwrap(), Value::from("On"));

        assert!(probe.fire("Disconnected", Value::from("cable pulled")));
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Value::from("cable pulled")));
    }

    #[tokio::test]
    async fn test_abandoned_query_leaves_no_pending_slot() {
        let ((link, rx), (_peer, _peer_rx)) = MemoryLink::pair();
        let client = ProxyClient::new(link, rx, fast_config());
        let node = client.detached(relay_spec("Relay1"));

        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            node.try_query_within("Power", vec![], Duration::from_secs(60)),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_reply_is_dropped_and_next_query_unaffected() {
        let ((link, rx), (peer, mut peer_rx)) = MemoryLink::pair();
        let client = ProxyClient::new(link, rx, fast_config());
        let node = client.detached(relay_spec("Relay1"));

        async fn next_query(rx: &mut Inbound) -> (Channel, u64) {
            match rx.recv().await {
                Some(LinkEvent::Envelope { channel, envelope }) => {
                    assert_eq!(envelope.kind, EnvelopeKind::Query);
                    (channel, envelope.correlation_id.unwrap())
                }
                other => panic!("Expected query, got {other:?}"),
            }
        }

        let first = node
            .try_query_within("Power", vec![], Duration::from_millis(30))
            .await;
        assert!(matches!(first, Err(QueryError::Timeout { .. })));
        let (channel, stale_id) = next_query(&mut peer_rx).await;
        assert_eq!(client.pending_count(), 0);

        // Answer the timed-out query after the fact
        peer.send(
            channel,
            &Envelope::reply("Relay1", "Power", Value::from("Stale"), stale_id),
        )
        .unwrap();

        let second = {
            let node = node.clone();
            tokio::spawn(async move {
                node.try_query_within("Power", vec![], Duration::from_secs(2))
                    .await
            })
        };
        let (channel, id) = next_query(&mut peer_rx).await;
        assert_ne!(id, stale_id);
        peer.send(channel, &Envelope::reply("Relay1", "Power", Value::from("Off"), id))
            .unwrap();

        assert_eq!(second.await.unwrap().unwrap(), Value::from("Off"));
        assert_eq!(client.pending_count(), 0);
    }
}
