//! The BLE seams the poll cycle is written against, and device selection.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::{BleAddress, DeviceIdentity};
use crate::error::{LinkError, ScanError};

/// A device seen while scanning.
#[derive(Debug, Clone)]
pub struct Candidate<D> {
    pub name: Option<String>,
    pub address: Option<BleAddress>,
    /// Signal strength in dBm, if the platform reported one
    pub rssi: Option<i16>,
    pub device: D,
}

impl<D> Candidate<D> {
    /// A printable label, for logs and errors
    pub fn label(&self) -> String {
        match (&self.name, &self.address) {
            (Some(name), Some(address)) => format!("{name} ({address})"),
            (Some(name), None) => name.clone(),
            (None, Some(address)) => address.to_string(),
            (None, None) => "<unnamed device>".to_string(),
        }
    }
}

/// Something that can find BMS devices and open links to them.
#[allow(async_fn_in_trait)]
pub trait Scanner {
    type Device;
    type Link: BmsLink;

    /// Collect every device advertising within `window`, one entry per device.
    async fn scan(&mut self, window: Duration) -> Result<Vec<Candidate<Self::Device>>, LinkError>;

    /// Open a link to `candidate`, subscribed to notifications by the time this
    /// returns. Past `deadline` this fails with [`LinkError::Timeout`]. Any part
    /// of the connection that was already up is torn down before an error returns.
    async fn connect(
        &mut self,
        candidate: &Candidate<Self::Device>,
        deadline: Instant,
    ) -> Result<Self::Link, LinkError>;
}

/// An open link to the BMS: a write channel and a notification stream.
#[allow(async_fn_in_trait)]
pub trait BmsLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// The next notification, or `None` once the stream has ended.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError>;

    /// Close the link. Calling it again after an interrupted disconnect is allowed.
    async fn disconnect(&mut self) -> Result<(), LinkError>;
}

/// Pick the strongest candidate that matches `identity` by name or address and is
/// at least `identity.min_rssi` strong. Candidates without a reported RSSI never
/// pass. Ties go to the candidate seen first.
pub fn select_candidate<D>(identity: &DeviceIdentity, candidates: Vec<Candidate<D>>) -> Option<Candidate<D>> {
    candidates
        .into_iter()
        .filter(|c| identity.matches(c.name.as_deref(), c.address))
        .filter(|c| c.rssi.is_some_and(|rssi| rssi >= identity.min_rssi))
        .fold(None, |best: Option<Candidate<D>>, c| match best {
            Some(b) if b.rssi >= c.rssi => Some(b),
            _ => Some(c),
        })
}

/// Scan for `window`, then connect to the best match for `identity`.
///
/// No connection is attempted when nothing passes the filter. The scanner gives up
/// connecting at `deadline`.
pub async fn scan_and_connect<S: Scanner>(
    scanner: &mut S,
    identity: &DeviceIdentity,
    window: Duration,
    deadline: Instant,
) -> Result<S::Link, ScanError> {
    let candidates = scanner.scan(window).await.map_err(ScanError::Adapter)?;
    let seen = candidates.len();

    let chosen = select_candidate(identity, candidates).ok_or(ScanError::DeviceNotFound { window, seen })?;
    let device = chosen.label();
    log::info!("Connecting to {device} at {} dBm", chosen.rssi.unwrap_or_default());

    scanner
        .connect(&chosen, deadline)
        .await
        .map_err(|source| ScanError::ConnectFailure { device, source })
}
