//! Room Controller configuration.
//!
//! Configuration is loaded from environment variables. Every value has a
//! default; malformed values are rejected rather than silently replaced.

use crate::media::{MediaKind, RtpCodec, WebRtcTransportOptions, WorkerSettings};
use common::config::ObservabilityConfig;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3016";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default media worker log level.
pub const DEFAULT_WORKER_LOG_LEVEL: &str = "warn";

/// Default lower bound of the RTC port range.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;

/// Default upper bound of the RTC port range.
pub const DEFAULT_RTC_MAX_PORT: u16 = 10100;

/// Default initial available outgoing bitrate for new transports.
pub const DEFAULT_INITIAL_OUTGOING_BITRATE: u32 = 1_000_000;

/// Default maximum incoming bitrate applied to new transports.
pub const DEFAULT_MAX_INCOMING_BITRATE: u32 = 1_500_000;

/// Default bound on waiting for a room's router.
pub const DEFAULT_ROUTER_READY_TIMEOUT_MS: u64 = 10_000;

/// Default delay between a worker death and process exit.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2_000;

/// Default per-connection outbound event queue depth.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Default tracing filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "room_controller=debug,tower_http=info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Room Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket signaling bind address (default: "0.0.0.0:3016").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Number of media workers in the pool (default: CPU count).
    pub num_workers: usize,

    /// Log level forwarded to media workers.
    pub worker_log_level: String,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// IP transports listen on.
    pub listen_ip: IpAddr,

    /// IP advertised in ICE candidates, if different from `listen_ip`.
    pub announced_ip: Option<String>,

    pub initial_outgoing_bitrate: u32,

    /// Applied to every new transport. `None` when disabled with `0`.
    pub max_incoming_bitrate: Option<u32>,

    /// Bound on waiting for a room's router to become ready.
    pub router_ready_timeout: Duration,

    /// Delay between a worker death and process exit.
    pub worker_death_grace: Duration,

    /// Per-connection outbound event queue depth.
    pub event_buffer: usize,

    /// Codecs every router is created with.
    pub media_codecs: Vec<RtpCodec>,

    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("RC_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers = parse_or(vars, "RC_NUM_WORKERS", default_num_workers())?;
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_NUM_WORKERS must be at least 1".to_string(),
            ));
        }

        let worker_log_level = vars
            .get("RC_WORKER_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_WORKER_LOG_LEVEL.to_string());

        let rtc_min_port = parse_or(vars, "RC_RTC_MIN_PORT", DEFAULT_RTC_MIN_PORT)?;
        let rtc_max_port = parse_or(vars, "RC_RTC_MAX_PORT", DEFAULT_RTC_MAX_PORT)?;
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "RC_RTC_MIN_PORT ({rtc_min_port}) exceeds RC_RTC_MAX_PORT ({rtc_max_port})"
            )));
        }

        let listen_ip = parse_or(vars, "RC_LISTEN_IP", IpAddr::V4(Ipv4Addr::UNSPECIFIED))?;

        let announced_ip = vars
            .get("RC_ANNOUNCED_IP")
            .filter(|s| !s.is_empty())
            .cloned();

        let initial_outgoing_bitrate = parse_or(
            vars,
            "RC_INITIAL_OUTGOING_BITRATE",
            DEFAULT_INITIAL_OUTGOING_BITRATE,
        )?;

        let max_incoming_bitrate = match parse_or(
            vars,
            "RC_MAX_INCOMING_BITRATE",
            DEFAULT_MAX_INCOMING_BITRATE,
        )? {
            0 => None,
            bitrate => Some(bitrate),
        };

        let router_ready_timeout = Duration::from_millis(parse_or(
            vars,
            "RC_ROUTER_READY_TIMEOUT_MS",
            DEFAULT_ROUTER_READY_TIMEOUT_MS,
        )?);

        let worker_death_grace = Duration::from_millis(parse_or(
            vars,
            "RC_WORKER_DEATH_GRACE_MS",
            DEFAULT_WORKER_DEATH_GRACE_MS,
        )?);

        let event_buffer = parse_or(vars, "RC_EVENT_BUFFER", DEFAULT_EVENT_BUFFER)?;
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "RC_EVENT_BUFFER must be at least 1".to_string(),
            ));
        }

        let observability = ObservabilityConfig::from_vars(vars, DEFAULT_LOG_FILTER)
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;

        Ok(Config {
            signaling_bind_address,
            health_bind_address,
            num_workers,
            worker_log_level,
            rtc_min_port,
            rtc_max_port,
            listen_ip,
            announced_ip,
            initial_outgoing_bitrate,
            max_incoming_bitrate,
            router_ready_timeout,
            worker_death_grace,
            event_buffer,
            media_codecs: default_media_codecs(),
            observability,
        })
    }

    /// Settings handed to the engine for every worker.
    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.worker_log_level.clone(),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
        }
    }

    /// Options for every WebRTC transport.
    #[must_use]
    pub fn transport_options(&self) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: self.listen_ip,
            announced_ip: self.announced_ip.clone(),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: self.initial_outgoing_bitrate,
        }
    }
}

fn parse_or<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(format!("{key}={raw}: {e}"))),
        None => Ok(default),
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Codec set every router is created with.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodec> {
    fn params(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        }
    }

    vec![
        RtpCodec {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: serde_json::Map::new(),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({ "x-google-start-bitrate": 1000 })),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/VP9".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({
                "profile-id": 2,
                "x-google-start-bitrate": 1000,
            })),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/h264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({
                "packetization-mode": 1,
                "profile-level-id": "4d0032",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000,
            })),
        },
        RtpCodec {
            kind: MediaKind::Video,
            mime_type: "video/h264".to_string(),
            clock_rate: 90000,
            channels: None,
            parameters: params(json!({
                "packetization-mode": 1,
                "profile-level-id": "42e01f",
                "level-asymmetry-allowed": 1,
                "x-google-start-bitrate": 1000,
            })),
        },
    ]
}
