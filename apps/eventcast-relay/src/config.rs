use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::state::RelaySettings;

#[derive(Debug, Parser)]
#[command(
    name = "eventcast-relay",
    author,
    version,
    about = "WebRTC signaling relay for Eventcast streams"
)]
pub struct Cli {
    /// Interface to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "EVENTCAST_RELAY_LISTEN_ADDR", default_value = "0.0.0.0")]
    pub listen_addr: String,

    /// Port to listen on.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Shared HS256 secret used by the REST API to sign access tokens.
    /// Without it every client is accepted anonymously.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Close connections that send nothing for this long.
    #[arg(long, env = "EVENTCAST_RELAY_IDLE_TIMEOUT_SECS", default_value_t = 120)]
    pub idle_timeout_secs: u64,

    /// Seconds between server-sent WebSocket pings.
    #[arg(long, env = "EVENTCAST_RELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Frames queued per connection before new ones are dropped.
    #[arg(long, env = "EVENTCAST_RELAY_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    /// Peers remembered per connection for disconnect notices.
    #[arg(long, env = "EVENTCAST_RELAY_RECENT_PEERS", default_value_t = 16)]
    pub recent_peers: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "EVENTCAST_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub jwt_secret: Option<String>,
    pub relay: RelaySettings,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for Config {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let ip: IpAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.idle_timeout_secs == 0 {
            anyhow::bail!("idle timeout must be greater than zero");
        }
        if cli.heartbeat_secs == 0 || cli.heartbeat_secs >= cli.idle_timeout_secs {
            anyhow::bail!(
                "heartbeat interval must be non-zero and shorter than the idle timeout"
            );
        }
        if cli.outbound_buffer == 0 {
            anyhow::bail!("outbound buffer must hold at least one frame");
        }

        Ok(Config {
            listen_addr: SocketAddr::new(ip, cli.port),
            jwt_secret: cli.jwt_secret.filter(|secret| !secret.is_empty()),
            relay: RelaySettings {
                outbound_buffer: cli.outbound_buffer,
                idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
                heartbeat_interval: Duration::from_secs(cli.heartbeat_secs),
                recent_peers: cli.recent_peers.max(1),
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

impl Config {
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args)?;
        Config::try_from(cli)
    }
}
