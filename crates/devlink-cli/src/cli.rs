//! Clap CLI definitions for devlink.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  devlink serve                              Host the built-in Loopback objects
  devlink query Loopback Loop1 Label         Read a property
  devlink command Loopback Loop1 SetLevel 3  Fire a command (no reply)
  devlink watch Loopback Loop1 Tick --init-arg 1000
                                             Print events as they arrive
  devlink config                             Show the effective configuration

Arguments are parsed as JSON when possible, otherwise taken as text.
Bytes are written as {\"base64\": \"...\"}.";

/// devlink: drive remote devices as if they were local objects.
#[derive(Parser)]
#[command(name = "devlink", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept proxy connections and host objects until interrupted.
    Serve {
        /// Override `[link] listen_addr`.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Query a property or method and print the reply.
    Query {
        #[command(flatten)]
        target: Target,
        /// Property or method name.
        property: String,
        /// Query arguments.
        args: Vec<String>,
        /// Wait this long for the reply instead of `[proxy] query_timeout_ms`.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Send a fire-and-forget command.
    Command {
        #[command(flatten)]
        target: Target,
        /// Method name, or Set<Property>.
        name: String,
        /// Command arguments.
        args: Vec<String>,
    },
    /// Print every occurrence of an event until the link drops.
    Watch {
        #[command(flatten)]
        target: Target,
        /// Event name.
        event: String,
    },
    /// Print the effective configuration (secret redacted).
    Config,
}

/// The remote object a client subcommand talks to.
#[derive(clap::Args, Debug, Clone)]
pub struct Target {
    /// Object type, e.g. `Loopback`.
    pub type_name: String,
    /// Object alias on the host.
    pub alias: String,
    /// Construction argument sent with the Init (repeatable).
    #[arg(long = "init-arg")]
    pub init_args: Vec<String>,
    /// Override `[link] connect_addr`.
    #[arg(long)]
    pub connect: Option<String>,
    /// Channel to place the object on.
    #[arg(long)]
    pub channel: Option<u16>,
}
