//! Protocol provider configuration.
//!
//! These settings are read when a provider binds its protocol engine. They
//! contain no reconnect behavior; see [`ReconnectConfig`](crate::ReconnectConfig)
//! for the failover side.

use serde::Deserialize;
use std::time::Duration;

use crate::{ProviderError, Result};

/// Default maximum frame size negotiated at bind time (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Default channel max. Kept inside the signed 16-bit range because some
/// brokers mishandle the upper half of the unsigned range.
pub const DEFAULT_CHANNEL_MAX: u16 = 32767;

/// Timeouts captured from the connection descriptor.
///
/// `None` means "no bound". A `None` close timeout makes `close()` wait for
/// the orderly protocol close indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionTimeouts {
    /// Bound on establishing the transport.
    pub connect: Option<Duration>,
    /// Bound on the orderly close handshake.
    pub close: Option<Duration>,
    /// Bound on a synchronous send.
    pub send: Option<Duration>,
    /// Bound on other request/response operations.
    pub request: Option<Duration>,
}

impl Default for ConnectionTimeouts {
    /// - `connect`: 15s
    /// - `close`: 15s
    /// - `send`, `request`: unbounded
    fn default() -> Self {
        // ---
        Self {
            connect: Some(Duration::from_secs(15)),
            close: Some(Duration::from_secs(15)),
            send: None,
            request: None,
        }
    }
}

/// Configuration for a single protocol-driving provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    // ---
    /// Largest frame the engine will accept or produce.
    pub max_frame_size: u32,

    /// Highest channel number the engine will negotiate.
    pub channel_max: u16,

    /// Consumers receive settled deliveries (no acknowledgement round trip).
    pub presettle_consumers: bool,

    /// Producers send settled (no broker acknowledgement round trip).
    pub presettle_producers: bool,

    /// Log every engine event at trace level.
    pub trace_frames: bool,

    /// Hex-dump every outbound chunk.
    pub trace_bytes: bool,

    /// Transport override (`"tcp"` or `"memory"`). When `None` the remote
    /// URI's scheme decides.
    pub transport_type: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        // ---
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: DEFAULT_CHANNEL_MAX,
            presettle_consumers: false,
            presettle_producers: false,
            trace_frames: false,
            trace_bytes: false,
            transport_type: None,
        }
    }
}

impl ProviderConfig {
    // ---

    /// Set both presettle flags at once.
    pub fn with_presettle(mut self, presettle: bool) -> Self {
        self.presettle_consumers = presettle;
        self.presettle_producers = presettle;
        self
    }

    /// Set the maximum frame size.
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the channel max.
    pub fn with_channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    /// Enable or disable frame tracing.
    pub fn with_trace_frames(mut self, trace: bool) -> Self {
        self.trace_frames = trace;
        self
    }

    /// Enable or disable outbound byte dumps.
    pub fn with_trace_bytes(mut self, trace: bool) -> Self {
        self.trace_bytes = trace;
        self
    }

    /// Force a transport type regardless of URI scheme.
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = Some(transport_type.into());
        self
    }

    /// Apply one URI-style option (`amqp.maxFrameSize=...`).
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] for unknown keys or unparsable values.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        // ---
        match key {
            "amqp.maxFrameSize" => self.max_frame_size = parse_value(key, value)?,
            "amqp.channelMax" => self.channel_max = parse_value(key, value)?,
            "amqp.presettle" => {
                let presettle = parse_value(key, value)?;
                self.presettle_consumers = presettle;
                self.presettle_producers = presettle;
            }
            "amqp.presettleConsumers" => self.presettle_consumers = parse_value(key, value)?,
            "amqp.presettleProducers" => self.presettle_producers = parse_value(key, value)?,
            "amqp.traceFrames" => self.trace_frames = parse_value(key, value)?,
            "amqp.traceBytes" => self.trace_bytes = parse_value(key, value)?,
            "transport.type" => self.transport_type = Some(value.to_string()),
            other => {
                return Err(ProviderError::Config(format!(
                    "unknown provider option: {other}"
                )))
            }
        }
        Ok(())
    }
}

/// Parse an option value, naming the key in the error.
pub(crate) fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
{
    value
        .trim()
        .parse()
        .map_err(|_| ProviderError::Config(format!("invalid value for {key}: {value}")))
}
