//! Runtime configuration.
//!
//! Every option has a default matching the values the logger shipped with, so an
//! empty file (or no file at all) yields a working configuration for a JBD BMS
//! advertising as `xiaoxiang`. The whole value is built once at startup and handed
//! to each component.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use reqwest::Url;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::watchdog::RecoveryAction;

/// Cell count above which no JBD board exists; bounds `bms.max_cells`.
const CELLS_LIMIT: usize = 32;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub bms: BmsConfig,
    pub ble: BleConfig,
    pub network: Option<NetworkConfig>,
    pub endpoints: Vec<EndpointDescriptor>,
    pub http: HttpConfig,
    pub time: TimeConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bms: BmsConfig::default(),
            ble: BleConfig::default(),
            network: None,
            endpoints: vec![EndpointDescriptor {
                url: "http://example.com/test_path/".to_string(),
                key: "test_key".to_string(),
                key_param: default_key_param(),
            }],
            http: HttpConfig::default(),
            time: TimeConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl Config {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.bms.max_cells == 0 || self.bms.max_cells > CELLS_LIMIT {
            return invalid(format!(
                "bms.max_cells must be between 1 and {CELLS_LIMIT}, got {}",
                self.bms.max_cells
            ));
        }
        if self.bms.polling_interval_ms == 0 {
            return invalid("bms.polling_interval_ms must not be zero".to_string());
        }
        let has_name = self.ble.name.as_deref().is_some_and(|n| !n.is_empty());
        if !has_name && self.ble.address.is_none() {
            return invalid("ble.name or ble.address must be set".to_string());
        }
        if self.ble.timeout_ms == 0 {
            return invalid("ble.timeout_ms must not be zero".to_string());
        }
        if let Some(network) = &self.network {
            if network.ssid.is_empty() {
                return invalid("network.ssid must not be empty".to_string());
            }
        }
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        if FixedOffset::east_opt(self.time.total_offset_sec()).is_none() {
            return invalid(format!(
                "time offset of {}s is out of range",
                self.time.total_offset_sec()
            ));
        }
        Ok(())
    }

    /// The fatal-recovery deadline of one cycle: the BLE timeout plus the fixed margin.
    pub fn watchdog_timeout(&self) -> Duration {
        self.ble.timeout() + self.watchdog.margin()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BmsConfig {
    /// Upper bound on the number of cell voltages accepted from the device
    pub max_cells: usize,
    /// Delay between the starts of successive poll cycles, in ms
    pub polling_interval_ms: u64,
}

impl Default for BmsConfig {
    fn default() -> Self {
        Self { max_cells: 15, polling_interval_ms: 10_000 }
    }
}

impl BmsConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BleConfig {
    pub name: Option<String>,
    pub address: Option<BleAddress>,
    /// Minimum signal strength (dBm) before a connection is attempted
    pub min_rssi: i16,
    pub scan_duration_ms: u64,
    /// Settle time between sending a request and the first read, in ms
    pub request_delay_ms: u64,
    /// Time allowed for scan, connect and gathering the response, in ms
    pub timeout_ms: u64,
    /// Log every advertisement and connection step at info level. Handy for
    /// finding the address, name and RSSI of a BMS.
    pub callback_debug: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            name: Some("xiaoxiang".to_string()),
            address: Some(BleAddress([0xa4, 0xc1, 0x38, 0x1a, 0x0c, 0x49])),
            min_rssi: -75,
            scan_duration_ms: 1_000,
            request_delay_ms: 500,
            timeout_ms: 10_000,
            callback_debug: true,
        }
    }
}

impl BleConfig {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            name: self.name.clone().filter(|n| !n.is_empty()),
            address: self.address,
            min_rssi: self.min_rssi,
        }
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The BMS to look for while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: Option<String>,
    pub address: Option<BleAddress>,
    pub min_rssi: i16,
}

impl DeviceIdentity {
    /// Whether an advertised name or address identifies this device. Signal strength
    /// is not considered here.
    pub fn matches(&self, name: Option<&str>, address: Option<BleAddress>) -> bool {
        let name_match = matches!((self.name.as_deref(), name), (Some(want), Some(got)) if want == got);
        let address_match = matches!((self.address, address), (Some(want), Some(got)) if want == got);
        name_match || address_match
    }
}

/// A 48-bit Bluetooth device address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct BleAddress(pub [u8; 6]);

impl BleAddress {
    /// Find the first `aa:bb:cc:dd:ee:ff` shaped address inside arbitrary text, such
    /// as a platform device identifier.
    pub fn find_in(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        (0..bytes.len().saturating_sub(16)).find_map(|start| {
            let window = text.get(start..start + 17)?;
            window.parse().ok()
        })
    }
}

impl FromStr for BleAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Invalid(format!("invalid BLE address {s:?}"));
        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for BleAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BleAddress({self})")
    }
}

/// Credentials of the network the reports travel over. The host OS owns the link;
/// these are only reported at startup.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub ssid: String,
    pub password: Option<String>,
}

impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("ssid", &self.ssid)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A remote logging destination.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDescriptor {
    /// Base URL. A `{key}` placeholder, if present, receives the auth key.
    pub url: String,
    pub key: String,
    /// Query parameter carrying the key when the URL has no placeholder
    #[serde(default = "default_key_param")]
    pub key_param: String,
}

pub(crate) const KEY_PLACEHOLDER: &str = "{key}";

fn default_key_param() -> String {
    "key".to_string()
}

impl EndpointDescriptor {
    pub fn is_templated(&self) -> bool {
        self.url.contains(KEY_PLACEHOLDER)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let probe = self.url.replace(KEY_PLACEHOLDER, "key");
        match Url::parse(&probe) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
            Ok(url) => Err(ConfigError::Invalid(format!(
                "endpoint {} uses unsupported scheme {}",
                self.url,
                url.scheme()
            ))),
            Err(err) => Err(ConfigError::Invalid(format!("endpoint {}: {err}", self.url))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Clock parameters, used only to stamp records.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeConfig {
    pub ntp_server: String,
    pub gmt_offset_sec: i32,
    pub daylight_offset_sec: i32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            ntp_server: "pool.ntp.org".to_string(),
            gmt_offset_sec: 3600,
            daylight_offset_sec: 3600,
        }
    }
}

impl TimeConfig {
    fn total_offset_sec(&self) -> i32 {
        self.gmt_offset_sec.saturating_add(self.daylight_offset_sec)
    }

    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.total_offset_sec()).unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryMode {
    Sleep,
    Exit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchdogConfig {
    /// Added to `ble.timeout_ms` to form the watchdog deadline
    pub margin_ms: u64,
    pub action: RecoveryMode,
    pub recovery_sleep_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { margin_ms: 10_000, action: RecoveryMode::Sleep, recovery_sleep_ms: 60_000 }
    }
}

impl WatchdogConfig {
    pub fn margin(&self) -> Duration {
        Duration::from_millis(self.margin_ms)
    }

    pub fn recovery_action(&self) -> RecoveryAction {
        match self.action {
            RecoveryMode::Sleep => RecoveryAction::Sleep(Duration::from_millis(self.recovery_sleep_ms)),
            RecoveryMode::Exit => RecoveryAction::Exit(1),
        }
    }
}
