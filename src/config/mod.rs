use std::time::Duration;

/// Upper bound on establishing the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on a single blocking read. Expiry is not an error, the read loop just goes around.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between `Established` and sending the identification line.
pub const IDENTIFY_DELAY: Duration = Duration::from_millis(200);
/// Delay between `Established` and the first heartbeat.
pub const HEARTBEAT_START_DELAY: Duration = Duration::from_millis(1200);
/// Heartbeat period while connected.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Fixed delay before each reconnect attempt. No backoff growth.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(5000);

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;

/// Socket-level knobs for one connection attempt.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
        }
    }
}

/// Timing of the session state machine plus the transport it drives.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub transport: TransportConfig,
    pub identify_delay: Duration,
    pub heartbeat_start_delay: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            identify_delay: IDENTIFY_DELAY,
            heartbeat_start_delay: HEARTBEAT_START_DELAY,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

/// Remote address. Replaced wholesale on every explicit connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
