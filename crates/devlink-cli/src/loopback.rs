//! Built-in `Loopback` object for exercising a link end to end.
//!
//! Construction args: `[tick_ms]`. When `tick_ms` is positive the object
//! emits a `Tick` event with a running counter at that interval.

use async_trait::async_trait;
use devlink_types::{CapabilityTable, Value, ValueKind};
use devlink_wire::{EventSink, Resource, ResourceError, ResourceFactory};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

pub const TYPE_NAME: &str = "Loopback";

pub struct LoopbackFactory;

#[async_trait]
impl ResourceFactory for LoopbackFactory {
    fn type_name(&self) -> &str {
        TYPE_NAME
    }

    fn capabilities(&self) -> CapabilityTable {
        CapabilityTable::new()
            .settable("Label", ValueKind::Text)
            .settable("Level", ValueKind::Int)
            .property("Uptime", ValueKind::Int)
            .property("Alias", ValueKind::Text)
            .binary_method("Echo")
            .method("Pulse")
            .event("Tick")
            .event("Pulse")
    }

    async fn construct(
        &self,
        alias: &str,
        args: &[Value],
    ) -> Result<Box<dyn Resource>, ResourceError> {
        let tick_ms = match args.first() {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .filter(|ms| *ms >= 0)
                .ok_or_else(|| ResourceError::InvalidArgument(format!("tick_ms: {v}")))?,
        };
        let mut props = HashMap::new();
        props.insert("Label".to_string(), Value::from(alias));
        props.insert("Level".to_string(), Value::Int(0));
        Ok(Box::new(Loopback {
            alias: alias.to_string(),
            started: Instant::now(),
            tick: Duration::from_millis(tick_ms as u64),
            props,
            pulse: None,
            ticker: None,
        }))
    }
}

struct Loopback {
    alias: String,
    started: Instant,
    tick: Duration,
    props: HashMap<String, Value>,
    pulse: Option<EventSink>,
    ticker: Option<JoinHandle<()>>,
}

#[async_trait]
impl Resource for Loopback {
    async fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ResourceError> {
        match name {
            "Echo" => {
                let mut out = Vec::new();
                for arg in &args {
                    let bytes = arg
                        .as_bytes()
                        .ok_or_else(|| ResourceError::InvalidArgument("Echo takes bytes".into()))?;
                    out.extend_from_slice(bytes);
                }
                Ok(Value::Bytes(out))
            }
            "Pulse" => {
                if let Some(sink) = &self.pulse {
                    sink.emit_args(args);
                }
                Ok(Value::Null)
            }
            other => Err(ResourceError::Unsupported(other.to_string())),
        }
    }

    async fn read(&mut self, name: &str) -> Result<Value, ResourceError> {
        match name {
            "Uptime" => Ok(Value::Int(self.started.elapsed().as_secs() as i64)),
            "Alias" => Ok(Value::from(self.alias.as_str())),
            other => self
                .props
                .get(other)
                .cloned()
                .ok_or_else(|| ResourceError::Unsupported(other.to_string())),
        }
    }

    async fn write(&mut self, name: &str, value: Value) -> Result<(), ResourceError> {
        if name == "Level" && value.as_i64().is_none() {
            return Err(ResourceError::InvalidArgument(format!("Level must be an integer, got {value}")));
        }
        self.props.insert(name.to_string(), value);
        Ok(())
    }

    fn attach(&mut self, event: &str, sink: EventSink) -> Result<(), ResourceError> {
        match event {
            "Pulse" => self.pulse = Some(sink),
            "Tick" if !self.tick.is_zero() => {
                let period = self.tick;
                self.ticker = Some(tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;
                    let mut count: i64 = 0;
                    loop {
                        interval.tick().await;
                        count += 1;
                        sink.emit(Value::Int(count));
                    }
                }));
            }
            _ => {}
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        debug!(alias = %self.alias, "Loopback shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink_wire::{Envelope, Link, LinkEvent, MemoryLink, WrappedAdapter};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_echo_returns_raw_bytes() {
        let mut adapter = WrappedAdapter::construct(Arc::new(LoopbackFactory), "Loop1", vec![])
            .await
            .unwrap();
        let reply = adapter
            .query("Echo", vec![Value::from("AAH/")])
            .await
            .unwrap();
        assert_eq!(reply, Value::Bytes(vec![0x00, 0x01, 0xff]));
    }

    #[tokio::test]
    async fn test_level_must_be_integer() {
        let mut adapter = WrappedAdapter::construct(Arc::new(LoopbackFactory), "Loop1", vec![])
            .await
            .unwrap();
        assert!(adapter
            .command("SetLevel", vec![Value::from("high")])
            .await
            .is_err());
        adapter.command("SetLevel", vec![Value::Int(7)]).await.unwrap();
        assert_eq!(adapter.query("Level", vec![]).await.unwrap(), Value::Int(7));
        assert_eq!(
            adapter.query("Label", vec![]).await.unwrap(),
            Value::from("Loop1")
        );
    }

    #[tokio::test]
    async fn test_bad_tick_rejected() {
        let result =
            WrappedAdapter::construct(Arc::new(LoopbackFactory), "Loop1", vec![Value::Int(-5)])
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tick_events_flow_until_shutdown() {
        let mut adapter =
            WrappedAdapter::construct(Arc::new(LoopbackFactory), "Loop1", vec![Value::Int(10)])
                .await
                .unwrap();
        let ((host, _host_rx), (_client, mut client_rx)) = MemoryLink::pair();
        let host: Arc<dyn Link> = host;
        adapter.route().set(host, 0);

        match tokio::time::timeout(Duration::from_secs(2), client_rx.recv()).await {
            Ok(Some(LinkEvent::Envelope { envelope, .. })) => {
                assert_eq!(envelope, Envelope::update("Loop1", "Tick", Value::Int(1)));
            }
            other => panic!("Expected a tick, got {other:?}"),
        }

        // Rebuilding shuts the ticking resource down; the new one has no ticker
        adapter.reconstruct(vec![]).await.unwrap();
        while client_rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(client_rx.try_recv().is_err());
    }
}
