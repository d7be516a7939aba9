use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure of the underlying BLE link, below the protocol layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("BLE error: {0}")]
    Ble(#[from] bluest::Error),
    #[error("default BLE adapter not found")]
    NoAdapter,
    /// The device lacks a GATT service or characteristic the protocol needs.
    #[error("{0}")]
    Unsupported(&'static str),
    #[error("notification stream closed")]
    Closed,
    #[error("timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("device not found within {window:?} ({seen} candidates seen)")]
    DeviceNotFound { window: Duration, seen: usize },
    #[error("failed to connect to {device}: {source}")]
    ConnectFailure {
        device: String,
        #[source]
        source: LinkError,
    },
    #[error("scan failed: {0}")]
    Adapter(#[source] LinkError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    /// Checksum mismatch, bad framing, device error status or a length out of bounds.
    /// `frame` is the hex encoded buffer as received.
    #[error("malformed frame: {reason}: {frame}")]
    MalformedFrame { reason: &'static str, frame: String },
    #[error("response incomplete after {received} bytes: {frame}")]
    IncompleteResponse { received: usize, frame: String },
    #[error("unexpected frame 0x{actual:02x}, expected 0x{expected:02x}")]
    UnexpectedFrame { expected: u8, actual: u8 },
    #[error("link failed during request: {0}")]
    Link(#[from] LinkError),
}

impl CodecError {
    pub(crate) fn malformed(reason: &'static str, buffer: &[u8]) -> Self {
        Self::MalformedFrame { reason, frame: hex::encode(buffer) }
    }
}

/// An `EndpointDeliveryFailure`: one endpoint did not accept one record.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request failed: {0}")]
    Network(String),
    #[error("endpoint responded with HTTP {0}")]
    Status(u16),
}

/// Why a poll cycle ended in the `Aborted` state.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("watchdog deadline of {timeout:?} elapsed")]
    WatchdogTimeout { timeout: Duration },
}

impl CycleError {
    pub fn is_watchdog_timeout(&self) -> bool {
        matches!(self, Self::WatchdogTimeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
