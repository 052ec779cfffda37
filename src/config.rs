use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use serde::Deserialize;
use tracing::warn;

use crate::error::ProxyError;

/// Tuning of the cross-party proxy. Every value is optional: whatever is left unset keeps the
///  transport's default (see [LinkOptions::default]).
///
/// Created either in code, or from a loosely typed (e.g. JSON) mapping via
///  [ProxyConfig::from_json_value]. Keys are camelCase, and unrecognized keys are rejected.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProxyConfig {
    /// generic timeout, used as the HTTP timeout unless `http_timeout_ms` is set as well
    pub timeout_in_ms: Option<u64>,

    pub connect_retry_times: Option<u32>,
    pub connect_retry_interval_ms: Option<u64>,
    pub recv_timeout_ms: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub http_max_payload_size: Option<usize>,
    pub throttle_window_size: Option<usize>,
    pub channel_protocol: Option<String>,
    pub channel_connection_type: Option<String>,

    /// whether the cause of a local failure is sent to peers verbatim, or redacted
    pub expose_error_trace: Option<bool>,
}

impl ProxyConfig {
    pub fn from_json_value(value: serde_json::Value) -> Result<ProxyConfig, ProxyError> {
        serde_json::from_value(value)
            .map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<ProxyConfig, ProxyError> {
        serde_json::from_str(s)
            .map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn expose_error_trace(&self) -> bool {
        self.expose_error_trace.unwrap_or(true)
    }

    /// Merges the values that are set onto the transport options, leaving the rest untouched.
    pub fn apply_to(&self, options: &mut LinkOptions) -> anyhow::Result<()> {
        if let Some(timeout) = self.timeout_in_ms {
            options.http_timeout = Duration::from_millis(timeout);
        }

        if let Some(n) = self.connect_retry_times {
            options.connect_retry_times = n;
        }
        if let Some(millis) = self.connect_retry_interval_ms {
            options.connect_retry_interval = Duration::from_millis(millis);
        }
        if let Some(millis) = self.recv_timeout_ms {
            options.recv_timeout = Duration::from_millis(millis);
        }
        if let Some(millis) = self.http_timeout_ms {
            if self.timeout_in_ms.is_some() {
                warn!("http_timeout_ms and timeout_in_ms are set at the same time, http_timeout_ms {} will be used", millis);
            }
            options.http_timeout = Duration::from_millis(millis);
        }
        if let Some(size) = self.http_max_payload_size {
            options.http_max_payload_size = size;
        }
        if let Some(size) = self.throttle_window_size {
            options.throttle_window_size = size;
        }
        if let Some(protocol) = &self.channel_protocol {
            options.channel_protocol = protocol.parse()?;
        }
        if let Some(connection_type) = &self.channel_connection_type {
            options.channel_connection_type = connection_type.parse()?;
        }

        options.validate()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelProtocol {
    /// length-prefixed frames
    Frame,
    /// length-prefixed frames with a trailing CRC-64 checksum
    FrameCrc,
}
impl FromStr for ChannelProtocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "frame" => Ok(ChannelProtocol::Frame),
            "frame_crc" => Ok(ChannelProtocol::FrameCrc),
            other => Err(anyhow!("unsupported channel protocol {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChannelConnectionType {
    /// one persistent outbound connection per peer
    Single,
    /// a fresh outbound connection per message
    Short,
}
impl FromStr for ChannelConnectionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(ChannelConnectionType::Single),
            "short" => Ok(ChannelConnectionType::Short),
            other => Err(anyhow!("unsupported channel connection type {:?}", other)),
        }
    }
}

/// The effective transport settings after merging a [ProxyConfig] onto the defaults.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LinkOptions {
    /// number of additional attempts after the first failed connect
    pub connect_retry_times: u32,
    pub connect_retry_interval: Duration,
    /// max time a consumer waits for a single matching message
    pub recv_timeout: Duration,
    /// upper bound for connecting to a peer and for writing one frame
    pub http_timeout: Duration,
    pub http_max_payload_size: usize,
    /// number of outbound messages per peer that may be queued before senders have to wait
    pub throttle_window_size: usize,
    pub channel_protocol: ChannelProtocol,
    pub channel_connection_type: ChannelConnectionType,
}

impl Default for LinkOptions {
    fn default() -> Self {
        LinkOptions {
            connect_retry_times: 10,
            connect_retry_interval: Duration::from_millis(1000),
            recv_timeout: Duration::from_millis(3600 * 1000),
            http_timeout: Duration::from_millis(120 * 1000),
            http_max_payload_size: 32 * 1024 * 1024,
            throttle_window_size: 10,
            channel_protocol: ChannelProtocol::Frame,
            channel_connection_type: ChannelConnectionType::Single,
        }
    }
}

impl LinkOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.recv_timeout.is_zero() {
            bail!("recv timeout must be positive");
        }
        if self.http_timeout.is_zero() {
            bail!("http timeout must be positive");
        }
        // frame lengths are u32, including a trailing checksum
        let upper_bound = (u32::MAX - 8) as usize;
        if self.http_max_payload_size == 0 || self.http_max_payload_size > upper_bound {
            bail!("max payload size must be between 1 and {}, was {}", upper_bound, self.http_max_payload_size);
        }
        if self.throttle_window_size == 0 {
            bail!("throttle window size must be positive");
        }
        Ok(())
    }
}

/// TLS material, applied identically to the listening and the connecting side
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
pub struct TlsConfig {
    pub ca_cert: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}
