//! [`Scanner`] and [`BmsLink`] over the platform BLE stack, via `bluest`.
//!
//! JBD boards expose their serial port as GATT service 0xFF00: notifications
//! arrive on characteristic 0xFF01 and requests are written to 0xFF02.

use std::time::Duration;

use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use log::Level;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::BleAddress;
use crate::error::LinkError;
use crate::link::{BmsLink, Candidate, Scanner};

const JBD_SERVICE_ID: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);
const JBD_NOTIFY_CHARACTERISTIC_ID: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);
const JBD_WRITE_CHARACTERISTIC_ID: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);
// Notifications buffered between the GATT stream and the codec
const NOTIFICATION_BUFFER: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BluestScanner {
    adapter: Adapter,
    callback_debug: bool,
}

impl BluestScanner {
    /// Open the default adapter and wait for it to become available.
    pub async fn new(callback_debug: bool) -> Result<Self, LinkError> {
        let adapter = Adapter::default().await.ok_or(LinkError::NoAdapter)?;
        adapter.wait_available().await?;
        Ok(Self { adapter, callback_debug })
    }

    fn callback_level(&self) -> Level {
        if self.callback_debug {
            Level::Info
        } else {
            Level::Trace
        }
    }
}

impl Scanner for BluestScanner {
    type Device = Device;
    type Link = BluestLink;

    async fn scan(&mut self, window: Duration) -> Result<Vec<Candidate<Device>>, LinkError> {
        let level = self.callback_level();
        let deadline = Instant::now() + window;
        let mut candidates: Vec<Candidate<Device>> = Vec::new();

        let mut adapter_events = self.adapter.scan(&[]).await?;
        while let Ok(Some(adv)) = timeout_at(deadline, adapter_events.next()).await {
            let name = adv.adv_data.local_name.clone().or_else(|| adv.device.name().ok());
            let address = BleAddress::find_in(&adv.device.id().to_string());
            let candidate = Candidate { name, address, rssi: adv.rssi, device: adv.device };
            log::log!(level, "BLE: advertisement from {} rssi {:?}", candidate.label(), candidate.rssi);

            match candidates.iter_mut().find(|c| c.device == candidate.device) {
                Some(seen) if seen.rssi >= candidate.rssi => {}
                Some(seen) => *seen = candidate,
                None => candidates.push(candidate),
            }
        }

        Ok(candidates)
    }

    async fn connect(&mut self, candidate: &Candidate<Device>, deadline: Instant) -> Result<BluestLink, LinkError> {
        let level = self.callback_level();
        log::log!(level, "BLE: connecting to {}", candidate.label());

        // Armed before connecting, so a cancelled connect is still torn down
        let mut connection = Connection { adapter: self.adapter.clone(), device: candidate.device.clone(), open: true };
        let setup = async {
            connection.adapter.connect_device(&connection.device).await?;
            open_uart(&connection.device).await
        };

        let opened = timeout_at(deadline, setup).await.unwrap_or(Err(LinkError::Timeout));
        match opened {
            Ok((write, rx, pump)) => {
                log::log!(level, "BLE: connected to {}", candidate.label());
                Ok(BluestLink { connection, write, rx, pump })
            }
            Err(err) => {
                match timeout(DISCONNECT_TIMEOUT, connection.close()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(disconnect_err)) => {
                        log::warn!("BLE: failed to disconnect after setup error: {disconnect_err}")
                    }
                    Err(_) => log::warn!("BLE: disconnect after setup error timed out"),
                }
                Err(err)
            }
        }
    }
}

/// Find the UART characteristics and subscribe to notifications.
async fn open_uart(device: &Device) -> Result<(Characteristic, Notifications, JoinHandle<()>), LinkError> {
    let service = device
        .discover_services_with_uuid(JBD_SERVICE_ID)
        .await?
        .first()
        .ok_or(LinkError::Unsupported("The specified device does not support the JBD UART service."))?
        .clone();
    let write = service
        .discover_characteristics_with_uuid(JBD_WRITE_CHARACTERISTIC_ID)
        .await?
        .first()
        .ok_or(LinkError::Unsupported("The specified device does not support the JBD write characteristic."))?
        .clone();
    let notify = service
        .discover_characteristics_with_uuid(JBD_NOTIFY_CHARACTERISTIC_ID)
        .await?
        .first()
        .ok_or(LinkError::Unsupported("The specified device does not support the JBD notify characteristic."))?
        .clone();

    let (rx, pump) = spawn_notification_pump(notify).await?;
    Ok((write, rx, pump))
}

/// An adapter level connection to one device. Dropped while still open, it
/// disconnects from a spawned task.
struct Connection {
    adapter: Adapter,
    device: Device,
    open: bool,
}

impl Connection {
    async fn close(&mut self) -> Result<(), LinkError> {
        let result = self.adapter.disconnect_device(&self.device).await;
        self.open = false;
        Ok(result?)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            log::warn!("BLE: connection dropped outside the runtime, left open");
            return;
        };
        let adapter = self.adapter.clone();
        let device = self.device.clone();
        runtime.spawn(async move {
            match timeout(DISCONNECT_TIMEOUT, adapter.disconnect_device(&device)).await {
                Ok(Ok(())) => log::debug!("BLE: disconnected abandoned connection"),
                Ok(Err(err)) => log::warn!("BLE: failed to disconnect abandoned connection: {err}"),
                Err(_) => log::warn!("BLE: disconnect of abandoned connection timed out"),
            }
        });
    }
}

type Notifications = mpsc::Receiver<Result<Vec<u8>, bluest::Error>>;

/// Move the notification stream onto its own task, since it borrows the
/// characteristic it came from. Returns once the subscription is active so no
/// reply to a following write is missed.
async fn spawn_notification_pump(notify: Characteristic) -> Result<(Notifications, JoinHandle<()>), LinkError> {
    let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
    let (ready_tx, ready_rx) = oneshot::channel();

    let pump = tokio::spawn(async move {
        let mut reader = match notify.notify().await {
            Ok(reader) => {
                let _ = ready_tx.send(Ok(()));
                reader
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        };
        while let Some(item) = reader.next().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    match ready_rx.await {
        Ok(Ok(())) => Ok((rx, pump)),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(LinkError::Closed),
    }
}

pub struct BluestLink {
    connection: Connection,
    write: Characteristic,
    rx: Notifications,
    pump: JoinHandle<()>,
}

impl BmsLink for BluestLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.write.write(frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        match self.rx.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }

    /// Disconnect from the battery
    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.pump.abort();
        self.connection.close().await
    }
}

impl Drop for BluestLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
