use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{self, Endpoint, SessionConfig, DEFAULT_HOST, DEFAULT_PORT};

#[derive(Parser)]
#[command(name = "camlink")]
#[command(about = "📷 Remote camera control over a line-based TCP protocol", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log verbosity (off, error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LevelFilter,

    /// Also write plain log records to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to a camera server and drive it from stdin
    Connect {
        /// Server host name or address
        #[arg(long, default_value = DEFAULT_HOST)]
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Directory where received snapshots are written
        #[arg(short, long, default_value = ".")]
        save_dir: PathBuf,

        /// Delay before each reconnect attempt, in milliseconds
        #[arg(long, default_value_t = config::RECONNECT_DELAY.as_millis() as u64)]
        reconnect_ms: u64,

        /// Heartbeat period, in seconds
        #[arg(long, default_value_t = config::HEARTBEAT_INTERVAL.as_secs())]
        heartbeat_secs: u64,

        /// Print events as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Everything `connect` needs, resolved from the flags.
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    pub session: SessionConfig,
    pub save_dir: PathBuf,
    pub json: bool,
}

impl Commands {
    pub fn into_connect_options(self) -> ConnectOptions {
        match self {
            Commands::Connect {
                host,
                port,
                save_dir,
                reconnect_ms,
                heartbeat_secs,
                json,
            } => ConnectOptions {
                endpoint: Endpoint::new(host, port),
                session: SessionConfig {
                    reconnect_delay: Duration::from_millis(reconnect_ms),
                    // a zero period would make the interval timer panic
                    heartbeat_interval: Duration::from_secs(heartbeat_secs.max(1)),
                    ..SessionConfig::default()
                },
                save_dir,
                json,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_defaults() {
        let cli = Cli::try_parse_from(["camlink", "connect"]).unwrap();
        assert_eq!(cli.log_level, LevelFilter::Info);
        assert!(cli.log_file.is_none());

        let options = cli.command.into_connect_options();
        assert_eq!(options.endpoint, Endpoint::new(DEFAULT_HOST, DEFAULT_PORT));
        assert_eq!(options.session.reconnect_delay, config::RECONNECT_DELAY);
        assert_eq!(options.session.heartbeat_interval, config::HEARTBEAT_INTERVAL);
        assert_eq!(options.session.identify_delay, config::IDENTIFY_DELAY);
        assert_eq!(options.save_dir, PathBuf::from("."));
        assert!(!options.json);
    }

    #[test]
    fn test_connect_overrides() {
        let cli = Cli::try_parse_from([
            "camlink",
            "connect",
            "--host",
            "cam.local",
            "-p",
            "9000",
            "--save-dir",
            "/tmp/shots",
            "--reconnect-ms",
            "250",
            "--heartbeat-secs",
            "0",
            "--json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LevelFilter::Debug);

        let options = cli.command.into_connect_options();
        assert_eq!(options.endpoint.to_string(), "cam.local:9000");
        assert_eq!(options.session.reconnect_delay, Duration::from_millis(250));
        assert_eq!(options.session.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(options.save_dir, PathBuf::from("/tmp/shots"));
        assert!(options.json);
    }

    #[test]
    fn test_bad_port_rejected() {
        assert!(Cli::try_parse_from(["camlink", "connect", "--port", "70000"]).is_err());
    }
}
