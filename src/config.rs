//! Command line and environment configuration.

use crate::broker::TlsMaterial;
use crate::mac_address::MacAddress;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Fallback identity when no interface address can be read.
pub const UNKNOWN_GATEWAY_ID: &str = "gateway-unknown";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting --{0} (or use --plaintext)")]
    Missing(&'static str),
    #[error("Failed to read {}: {source}", .path.display())]
    Credential {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid setting --{name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Building identifier, first segment of every topic
    #[arg(long, env = "IAQ_BUILDING_ID", default_value = "building-001")]
    pub building_id: String,

    /// Gateway identifier. Derived from the network interface MAC when unset.
    #[arg(long, env = "IAQ_GATEWAY_ID")]
    pub gateway_id: Option<String>,

    /// Network interface whose MAC address derives the gateway id
    #[arg(long, env = "IAQ_INTERFACE", default_value = "eth0")]
    pub interface: String,

    /// MQTT broker host name
    #[arg(long, env = "IAQ_MQTT_HOST")]
    pub mqtt_host: String,

    #[arg(long, env = "IAQ_MQTT_PORT", default_value_t = 8883)]
    pub mqtt_port: u16,

    #[arg(long, env = "IAQ_KEEP_ALIVE", value_parser = parse_duration, default_value = "60s")]
    pub keep_alive: Duration,

    /// PEM file with the broker CA certificate
    #[arg(long, env = "IAQ_CA_CERT")]
    pub ca_cert: Option<PathBuf>,

    /// PEM file with this gateway's client certificate
    #[arg(long, env = "IAQ_CLIENT_CERT")]
    pub client_cert: Option<PathBuf>,

    /// PEM file with this gateway's private key
    #[arg(long, env = "IAQ_CLIENT_KEY")]
    pub client_key: Option<PathBuf>,

    /// Connect without TLS (lab brokers only)
    #[arg(long, env = "IAQ_PLAINTEXT")]
    pub plaintext: bool,

    /// SQLite file holding the telemetry buffer
    #[arg(
        long,
        env = "IAQ_BUFFER_PATH",
        default_value = "/var/lib/iaq-gateway/buffer.db"
    )]
    pub buffer_path: PathBuf,

    /// How long published readings are kept before eviction.
    /// Accepts duration with suffix: 7d, 12h, 30m, 5s, 500ms.
    #[arg(long, env = "IAQ_RETENTION", value_parser = parse_duration, default_value = "7d")]
    pub retention: Duration,

    #[arg(long, env = "IAQ_SCAN_WINDOW", value_parser = parse_duration, default_value = "5s")]
    pub scan_window: Duration,

    /// Pause after a failed scan
    #[arg(long, env = "IAQ_SCAN_BACKOFF", value_parser = parse_duration, default_value = "5s")]
    pub scan_backoff: Duration,

    #[arg(long, env = "IAQ_DRAIN_INTERVAL", value_parser = parse_duration, default_value = "60s")]
    pub drain_interval: Duration,

    /// Maximum records replayed per drain pass
    #[arg(long, env = "IAQ_BATCH_SIZE", default_value_t = 100)]
    pub batch_size: usize,

    /// Pause between replayed publishes
    #[arg(long, env = "IAQ_PUBLISH_PACING", value_parser = parse_duration, default_value = "100ms")]
    pub publish_pacing: Duration,

    #[arg(long, env = "IAQ_HEALTH_INTERVAL", value_parser = parse_duration, default_value = "300s")]
    pub health_interval: Duration,

    #[arg(long, env = "IAQ_PUBLISH_TIMEOUT", value_parser = parse_duration, default_value = "5s")]
    pub publish_timeout: Duration,

    /// Upper bound on a single buffer operation
    #[arg(long, env = "IAQ_STORE_TIMEOUT", value_parser = parse_duration, default_value = "5s")]
    pub store_timeout: Duration,

    #[arg(long, env = "IAQ_RECONNECT_MIN", value_parser = parse_duration, default_value = "1s")]
    pub reconnect_min: Duration,

    #[arg(long, env = "IAQ_RECONNECT_MAX", value_parser = parse_duration, default_value = "60s")]
    pub reconnect_max: Duration,

    /// Warn when this many readings are waiting for delivery (0 disables)
    #[arg(long, env = "IAQ_BACKLOG_WARN", default_value_t = 10_000)]
    pub backlog_warn: u64,

    /// Verbose output, log rejected frames and connection details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Reject settings that would stall a loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "batch-size",
                reason: "must be at least 1".to_string(),
            });
        }
        for (name, value) in [
            ("scan-window", self.scan_window),
            ("drain-interval", self.drain_interval),
            ("health-interval", self.health_interval),
            ("publish-timeout", self.publish_timeout),
            ("store-timeout", self.store_timeout),
            ("reconnect-min", self.reconnect_min),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        // Zero disables keep-alive; otherwise MQTT carries whole seconds in a u16.
        if !self.keep_alive.is_zero()
            && (self.keep_alive < Duration::from_secs(1)
                || self.keep_alive.as_secs() > u64::from(u16::MAX))
        {
            return Err(ConfigError::Invalid {
                name: "keep-alive",
                reason: format!("must be 0s or between 1s and {}s", u16::MAX),
            });
        }
        Ok(())
    }

    /// Read the TLS credentials. `None` when running in plaintext mode.
    pub fn load_tls(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        if self.plaintext {
            return Ok(None);
        }
        let ca = self.ca_cert.as_deref().ok_or(ConfigError::Missing("ca-cert"))?;
        let cert = self
            .client_cert
            .as_deref()
            .ok_or(ConfigError::Missing("client-cert"))?;
        let key = self
            .client_key
            .as_deref()
            .ok_or(ConfigError::Missing("client-key"))?;

        Ok(Some(TlsMaterial {
            ca: read_credential(ca)?,
            client_cert: read_credential(cert)?,
            client_key: read_credential(key)?,
        }))
    }

    /// Configured gateway id, or one derived from the interface address.
    pub fn resolve_gateway_id(&self) -> String {
        match &self.gateway_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => detect_gateway_id(Path::new("/sys/class/net"), &self.interface),
        }
    }
}

fn read_credential(path: &Path) -> Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|source| ConfigError::Credential {
        path: path.to_path_buf(),
        source,
    })
}

/// `gateway-` followed by the last 8 hex digits of the address.
pub fn gateway_id_from_mac(mac: &MacAddress) -> String {
    let hex = mac.device_id();
    format!("gateway-{}", &hex[hex.len() - 8..])
}

/// Read `<sys_net>/<interface>/address`, falling back to
/// [`UNKNOWN_GATEWAY_ID`].
pub fn detect_gateway_id(sys_net: &Path, interface: &str) -> String {
    let path = sys_net.join(interface).join("address");
    let mac = std::fs::read_to_string(&path)
        .map_err(|e| e.to_string())
        .and_then(|text| text.trim().parse::<MacAddress>().map_err(|e| e.to_string()));

    match mac {
        Ok(mac) => gateway_id_from_mac(&mac),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot derive gateway id");
            UNKNOWN_GATEWAY_ID.to_string()
        }
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `d`: days
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use iaq_gateway::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // "ms" before "m" and "s"
    let (num, unit, scale) = if let Some(num) = src.strip_suffix("ms") {
        return parse_count(num, "milliseconds").map(Duration::from_millis);
    } else if let Some(num) = src.strip_suffix('d') {
        (num, "days", 86_400)
    } else if let Some(num) = src.strip_suffix('h') {
        (num, "hours", 3_600)
    } else if let Some(num) = src.strip_suffix('m') {
        (num, "minutes", 60)
    } else if let Some(num) = src.strip_suffix('s') {
        (num, "seconds", 1)
    } else {
        (src, "duration", 1)
    };

    let count = parse_count(num, unit)?;
    count
        .checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("{unit} out of range: {num}"))
}

fn parse_count(num: &str, unit: &str) -> Result<u64, String> {
    num.trim()
        .parse()
        .map_err(|_| format!("invalid {unit}: {num}"))
}
