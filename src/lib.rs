//! Poll a JBD smart Battery Management System over Bluetooth Low Energy and log its
//! state to remote HTTP endpoints.
//!
//! JBD boards (sold under many names, the BLE module usually advertises as `xiaoxiang`)
//! speak a small register based serial protocol, bridged to BLE as a GATT service
//! with one write and one notify characteristic.
//!
//! Each poll cycle scans for the configured device, connects, reads the basic info
//! and cell voltage registers, disconnects and sends the decoded record to every
//! endpoint. A watchdog bounds the whole cycle.
//!
//! Currently the following data is reported:
//!
//! - State of charge (%)
//! - Residual and nominal capacity (Ah)
//! - Cycles (count)
//! - Cell voltages (v)
//! - Battery voltage (v) and current (a)
//! - Temperatures (°C)
//! - Protection and MOSFET status
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # pub async fn main() -> anyhow::Result<()> {
//!     let config = bmspoll::Config::default();
//!     let scanner = bmspoll::BluestScanner::new(config.ble.callback_debug).await?;
//!     let transport = bmspoll::HttpTransport::new(config.http.timeout())?;
//!     let mut poller = bmspoll::Poller::new(&config, scanner, transport);
//!     loop {
//!         let report = poller.tick().await;
//!         println!("{:?}", report.outcome);
//!     }
//! # }
//! ```

mod bluetooth;
mod codec;
mod config;
mod error;
mod link;
pub mod message;
mod poller;
mod reporter;
mod telemetry;
#[cfg(test)]
mod testing;
mod watchdog;

pub use bluetooth::{BluestLink, BluestScanner};
pub use codec::BmsCodec;
pub use config::{
    BleAddress, BleConfig, BmsConfig, Config, DeviceIdentity, EndpointDescriptor, HttpConfig, NetworkConfig,
    RecoveryMode, TimeConfig, WatchdogConfig,
};
pub use error::{CodecError, ConfigError, CycleError, DeliveryError, LinkError, ScanError};
pub use link::{scan_and_connect, select_candidate, BmsLink, Candidate, Scanner};
pub use poller::{CycleOutcome, CycleReport, CycleState, Poller};
pub use reporter::{request_url, DeliveryOutcome, HttpTransport, Reporter, Transport};
pub use telemetry::{Protection, TelemetryRecord};
pub use watchdog::{RecoveryAction, Watchdog};
