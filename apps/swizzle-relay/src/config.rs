use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use relay_proto::Role;

use crate::session::SessionConfig;

#[derive(Debug, Parser)]
#[command(
    name = "swizzle-relay",
    author,
    version,
    about = "WebSocket relay that pairs a UI driver with a swizzling peer and runs a command script",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Server options, used when no subcommand is given.
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect to a running relay and impersonate one of the peers
    Peer(PeerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(
        long,
        env = "SWIZZLE_RELAY_LISTEN_ADDR",
        default_value = "0.0.0.0:8080"
    )]
    pub listen_addr: String,

    /// JSON script to run once both roles are bound.
    #[arg(long, env = "SWIZZLE_RELAY_SCRIPT")]
    pub script: Option<PathBuf>,

    /// Send the `initial` envelope to every accepted connection.
    #[arg(
        long,
        env = "SWIZZLE_RELAY_HANDSHAKE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub handshake: bool,

    /// Outbound frames buffered per connection before dispatch blocks.
    #[arg(long, env = "SWIZZLE_RELAY_WRITER_BUFFER", default_value_t = 64)]
    pub writer_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SWIZZLE_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct PeerArgs {
    /// Relay base URL (e.g., ws://localhost:8080)
    #[arg(short, long, default_value = "ws://localhost:8080")]
    pub url: String,

    /// Role to announce: ui_driver or instrumentation
    #[arg(short, long, value_parser = parse_role)]
    pub role: Role,

    /// Answer every received command with an execution result.
    #[arg(long)]
    pub ack: bool,

    /// Status code reported in execution results.
    #[arg(long, default_value_t = 0)]
    pub status: i64,
}

fn parse_role(value: &str) -> Result<Role, String> {
    Role::ALL
        .into_iter()
        .find(|role| role.as_str() == value || role.announcement() == value)
        .ok_or_else(|| format!("unknown role '{value}' (expected ui_driver or instrumentation)"))
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub script: Option<PathBuf>,
    pub session: SessionConfig,
    pub writer_buffer: usize,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.writer_buffer == 0 {
            bail!("writer buffer must hold at least one frame");
        }
        Ok(RelayConfig {
            listen_addr,
            script: args.script,
            session: SessionConfig {
                handshake: args.handshake,
            },
            writer_buffer: args.writer_buffer,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
