//! devlink CLI: host device objects or drive them from another machine.
//!
//! `serve` runs a device host over an authenticated TCP listener. The client
//! subcommands (`query`, `command`, `watch`) connect, Init the target object
//! and talk to it through a proxy node.

mod cli;
mod config;
mod loopback;

use crate::cli::{Cli, Commands, Target};
use clap::Parser;
use devlink_types::config::DevlinkConfig;
use devlink_types::{DevlinkError, DevlinkResult, Value};
use devlink_wire::presence::manifest_from_config;
use devlink_wire::proxy::OFFLINE_EVENT;
use devlink_wire::{
    DeviceHost, LinkListener, ProxyClient, ProxyError, ProxyNode, ProxySpec, QueryError,
    Registry, TcpLink,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

fn init_tracing_stderr(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref());
    init_tracing_stderr(&config.log_level);

    let result = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt.block_on(run(cli.command, config)),
        Err(e) => Err(DevlinkError::Io(e)),
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Commands, config: DevlinkConfig) -> DevlinkResult<()> {
    match command {
        Commands::Serve { listen } => cmd_serve(config, listen).await,
        Commands::Query {
            target,
            property,
            args,
            timeout_ms,
        } => cmd_query(config, target, property, args, timeout_ms).await,
        Commands::Command { target, name, args } => {
            cmd_command(config, target, name, args).await
        }
        Commands::Watch { target, event } => cmd_watch(config, target, event).await,
        Commands::Config => cmd_config(config),
    }
}

/// CLI argument -> Value: JSON if it parses, otherwise plain text.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::Text(raw.to_string()))
}

fn render(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

async fn cmd_serve(mut config: DevlinkConfig, listen: Option<String>) -> DevlinkResult<()> {
    if let Some(addr) = listen {
        config.link.listen_addr = addr;
    }
    let registry = Registry::with_presence(manifest_from_config(&config.presence));
    registry.add_factory(Arc::new(loopback::LoopbackFactory));

    let listener = LinkListener::bind(config.link.clone())
        .await
        .map_err(|e| DevlinkError::Link(e.to_string()))?;
    let addr = listener.local_addr();
    let host = DeviceHost::new(registry);
    let accept = host.serve(listener);
    println!("devlink host listening on {addr}");

    tokio::signal::ctrl_c().await?;
    info!(objects = host.registry().ready_count(), "Shutting down");
    accept.abort();
    Ok(())
}

async fn connect(
    config: &DevlinkConfig,
    target: &Target,
) -> DevlinkResult<(Arc<ProxyClient>, ProxyNode)> {
    let mut link_config = config.link.clone();
    if let Some(addr) = &target.connect {
        link_config.connect_addr = addr.clone();
    }
    let (link, inbound) = TcpLink::connect(&link_config)
        .await
        .map_err(|e| DevlinkError::Link(e.to_string()))?;
    let client = ProxyClient::new(link, inbound, config.proxy.clone());
    let node = attach(&client, target).await?;
    Ok((client, node))
}

async fn attach(client: &Arc<ProxyClient>, target: &Target) -> DevlinkResult<ProxyNode> {
    client
        .attach(spec_for(target))
        .await
        .map_err(|e| match e {
            ProxyError::Construction(record) => DevlinkError::Construction {
                alias: record.alias,
                reason: record.message,
            },
            ProxyError::Link(e) => DevlinkError::Link(e.to_string()),
        })
}

fn spec_for(target: &Target) -> ProxySpec {
    let spec = ProxySpec::new(&target.type_name, &target.alias)
        .args(target.init_args.iter().map(|a| parse_arg(a)).collect());
    match target.channel {
        Some(channel) => spec.channel(channel),
        None => spec,
    }
}

async fn cmd_query(
    config: DevlinkConfig,
    target: Target,
    property: String,
    args: Vec<String>,
    timeout_ms: Option<u64>,
) -> DevlinkResult<()> {
    let (_client, node) = connect(&config, &target).await?;
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.proxy.query_timeout());
    let args = args.iter().map(|a| parse_arg(a)).collect();

    match node.try_query_within(&property, args, timeout).await {
        Ok(value) => {
            println!("{}", render(&value));
            Ok(())
        }
        Err(QueryError::Timeout { property, timeout }) => Err(
            DevlinkError::Timeout(format!("{property} after {}ms", timeout.as_millis())),
        ),
        Err(QueryError::Remote(record)) => Err(DevlinkError::Remote {
            alias: record.alias,
            property: record.property.unwrap_or_default(),
            message: record.message,
        }),
        Err(e) => Err(DevlinkError::Link(e.to_string())),
    }
}

async fn cmd_command(
    config: DevlinkConfig,
    target: Target,
    name: String,
    args: Vec<String>,
) -> DevlinkResult<()> {
    let (client, node) = connect(&config, &target).await?;
    let args = args.iter().map(|a| parse_arg(a)).collect();
    node.command(&name, args)
        .map_err(|e| DevlinkError::Link(e.to_string()))?;

    // The host handles envelopes in order, so the ack to this identical
    // Init means the command has been processed before we hang up.
    attach(&client, &target).await?;
    println!("sent {}.{name}", target.alias);
    Ok(())
}

async fn cmd_watch(config: DevlinkConfig, target: Target, event: String) -> DevlinkResult<()> {
    let (_client, node) = connect(&config, &target).await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Option<Value>>();

    let events = tx.clone();
    node.subscribe(&event, move |value| {
        let _ = events.send(Some(value.clone()));
    });
    node.subscribe(OFFLINE_EVENT, move |_| {
        let _ = tx.send(None);
    });
    eprintln!("watching {}.{event} (Ctrl+C to stop)", target.alias);

    loop {
        tokio::select! {
            next = rx.recv() => match next {
                Some(Some(value)) => println!("{}", render(&value)),
                Some(None) | None => {
                    warn!(alias = %target.alias, "Link lost");
                    return Err(DevlinkError::Link("host went offline".into()));
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn cmd_config(mut config: DevlinkConfig) -> DevlinkResult<()> {
    if !config.link.shared_secret.is_empty() {
        config.link.shared_secret = "<redacted>".to_string();
    }
    let text = toml::to_string_pretty(&config)
        .map_err(|e| DevlinkError::Serialization(e.to_string()))?;
    print!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("3"), Value::Int(3));
        assert_eq!(parse_arg("true"), Value::Bool(true));
        assert_eq!(parse_arg("Standby"), Value::from("Standby"));
        assert_eq!(parse_arg("\"7\""), Value::from("7"));
        assert_eq!(
            parse_arg(r#"{"base64": "AAH/"}"#),
            Value::Bytes(vec![0x00, 0x01, 0xff])
        );
    }

    #[test]
    fn test_spec_for_target() {
        let target = Target {
            type_name: "Loopback".into(),
            alias: "Loop1".into(),
            init_args: vec!["250".into()],
            connect: None,
            channel: Some(4),
        };
        let spec = spec_for(&target);
        assert_eq!(spec.args, vec![Value::Int(250)]);
        assert_eq!(spec.channel, Some(4));
    }

    #[test]
    fn test_cli_parses_query() {
        let cli = Cli::try_parse_from([
            "devlink", "query", "Loopback", "Loop1", "Label", "--timeout-ms", "50",
        ])
        .unwrap();
        match cli.command {
            Commands::Query {
                target,
                property,
                timeout_ms,
                ..
            } => {
                assert_eq!(target.alias, "Loop1");
                assert_eq!(property, "Label");
                assert_eq!(timeout_ms, Some(50));
            }
            _ => panic!("Expected query"),
        }
    }
}
