//! Inbound envelope routing on the host that owns the real resources.
//!
//! The [`Dispatcher`] turns each inbound envelope into at most one reply.
//! [`DeviceHost`] runs one delivery task per link and, for TCP, an accept
//! loop that hands each authenticated connection its own task.

use crate::adapter::AdapterError;
use crate::link::{Inbound, Link, LinkEvent, LinkListener, TcpLink};
use crate::message::{Channel, Envelope, EnvelopeKind, ErrorCode};
use crate::registry::{AdapterHandle, Registry};

use devlink_types::Value;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply text for calls on an alias that is not Ready.
pub const OBJECT_MISSING: &str = "object does not exist";

/// Routes inbound envelopes to the adapters in a [`Registry`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Registry,
}

#[derive(Clone, Copy)]
enum Call {
    Command,
    Query,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Handle one envelope that arrived on `(link, channel)` and produce the
    /// reply to send back, if any.
    pub async fn dispatch(
        &self,
        link: &Arc<dyn Link>,
        channel: Channel,
        envelope: Envelope,
    ) -> Option<Envelope> {
        match envelope.kind {
            EnvelopeKind::Init => Some(self.handle_init(link, channel, envelope).await),
            EnvelopeKind::Command => self.handle_call(Call::Command, link, channel, envelope).await,
            EnvelopeKind::Query => self.handle_call(Call::Query, link, channel, envelope).await,
            EnvelopeKind::Update | EnvelopeKind::Error => {
                debug!(
                    alias = %envelope.alias,
                    kind = ?envelope.kind,
                    "Ignoring reply-type envelope on the host side"
                );
                None
            }
        }
    }

    async fn handle_init(
        &self,
        link: &Arc<dyn Link>,
        channel: Channel,
        envelope: Envelope,
    ) -> Envelope {
        let Envelope { alias, args, .. } = envelope.clone();
        let Some(type_name) = envelope.type_name() else {
            warn!(alias = %alias, "Init without a type name");
            return Envelope::error(
                &alias,
                None,
                args,
                ErrorCode::ConstructionFailed,
                "init carries no type name",
                None,
            );
        };

        match self
            .registry
            .init(&alias, type_name, args.clone(), link.clone(), channel)
            .await
        {
            Ok(outcome) => {
                debug!(alias = %alias, type_name, ?outcome, "Init acknowledged");
                Envelope::init_ack(&alias)
            }
            Err(e) => {
                error!(alias = %alias, type_name, error = %e, "Init failed");
                Envelope::error(&alias, None, args, e.code(), e.to_string(), None)
            }
        }
    }

    async fn handle_call(
        &self,
        call: Call,
        link: &Arc<dyn Link>,
        channel: Channel,
        envelope: Envelope,
    ) -> Option<Envelope> {
        let Envelope {
            alias,
            property,
            args,
            correlation_id,
            ..
        } = envelope;
        // Commands never carry a correlation id, not even on their errors
        let correlation_id = match call {
            Call::Command => None,
            Call::Query => correlation_id,
        };

        let Some(name) = property else {
            warn!(alias = %alias, "Call without a property name");
            return Some(Envelope::error(
                &alias,
                None,
                args,
                ErrorCode::PropertyMissing,
                "property does not exist",
                correlation_id,
            ));
        };

        let Some(handle) = self.registry.ready(&alias) else {
            warn!(alias = %alias, property = %name, "Call on an object that does not exist");
            return Some(Envelope::error(
                &alias,
                Some(&name),
                args,
                ErrorCode::ObjectMissing,
                OBJECT_MISSING,
                correlation_id,
            ));
        };

        let origin = (Arc::clone(link), channel);
        match run_isolated(handle, origin, call, name.clone(), args.clone()).await {
            Ok(value) => match call {
                Call::Command => None,
                Call::Query => Some(match correlation_id {
                    Some(id) => Envelope::reply(&alias, &name, value, id),
                    None => Envelope::update(&alias, &name, value),
                }),
            },
            Err(e) => {
                error!(alias = %alias, property = %name, error = %e, "Call failed");
                Some(Envelope::error(
                    &alias,
                    Some(&name),
                    args,
                    e.code(),
                    e.to_string(),
                    correlation_id,
                ))
            }
        }
    }

    /// Deliver every inbound envelope in arrival order until the link drops.
    pub async fn run(&self, link: Arc<dyn Link>, mut inbound: Inbound) {
        while let Some(event) = inbound.recv().await {
            match event {
                LinkEvent::Envelope { channel, envelope } => {
                    let Some(reply) = self.dispatch(&link, channel, envelope).await else {
                        continue;
                    };
                    if let Err(e) = link.send(channel, &reply) {
                        warn!(alias = %reply.alias, error = %e, "Failed to send reply");
                    }
                }
                LinkEvent::Disconnected => {
                    info!("Link disconnected; delivery task exiting");
                    break;
                }
            }
        }
    }
}

/// Run one adapter call on its own task so a panicking resource surfaces as
/// an invocation error instead of taking down the delivery task.
///
/// Objects registered at startup have no event route until a caller shows
/// up, so the first link to reach them receives their events.
async fn run_isolated(
    handle: AdapterHandle,
    (link, channel): (Arc<dyn Link>, Channel),
    call: Call,
    name: String,
    args: Vec<Value>,
) -> Result<Value, AdapterError> {
    let task = tokio::spawn(async move {
        let mut adapter = handle.lock_owned().await;
        if adapter.route().claim(&link, channel) {
            debug!(alias = %adapter.alias(), channel, "Event route bound to caller");
        }
        match call {
            Call::Command => adapter.command(&name, args).await.map(|()| Value::Null),
            Call::Query => adapter.query(&name, args).await,
        }
    });
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(AdapterError::Invocation(format!(
            "resource panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(AdapterError::Invocation(e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Serves a [`Registry`] to remote proxy clients.
#[derive(Clone)]
pub struct DeviceHost {
    dispatcher: Arc<Dispatcher>,
}

impl DeviceHost {
    pub fn new(registry: Registry) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(registry)),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.dispatcher.registry()
    }

    /// Spawn the delivery task for one already-established link.
    pub fn serve_link(&self, link: Arc<dyn Link>, inbound: Inbound) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move { dispatcher.run(link, inbound).await })
    }

    /// Spawn the accept loop. Each connection is authenticated on its own
    /// task so a stalled handshake never blocks the listener.
    pub fn serve(&self, listener: LinkListener) -> JoinHandle<()> {
        let host = self.clone();
        tokio::spawn(async move {
            info!(addr = %listener.local_addr(), "Device host accepting connections");
            loop {
                match listener.accept_stream().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Accepted connection");
                        let config = listener.config().clone();
                        let host = host.clone();
                        tokio::spawn(async move {
                            match TcpLink::accept_handshake(&config, stream, addr).await {
                                Ok((link, inbound)) => {
                                    info!(%addr, peer = link.peer_node_id(), "Peer connected");
                                    let link: Arc<dyn Link> = link;
                                    host.dispatcher.run(link, inbound).await;
                                }
                                Err(e) => {
                                    warn!(%addr, error = %e, "Handshake failed");
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }
}
