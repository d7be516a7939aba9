//! The poll cycle: scan, connect, request, report, with everything bounded by the
//! watchdog.

use std::time::Duration;

use tokio::time::{interval, timeout, Instant, Interval, MissedTickBehavior};

use crate::codec::BmsCodec;
use crate::config::{Config, DeviceIdentity};
use crate::error::CycleError;
use crate::link::{scan_and_connect, BmsLink, Scanner};
use crate::reporter::{DeliveryOutcome, Reporter, Transport};
use crate::telemetry::TelemetryRecord;
use crate::watchdog::{RecoveryAction, Watchdog};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Scanning,
    Connected,
    Requesting,
    Reporting,
    Aborted,
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// The record was read and every endpoint was attempted, whether or not
    /// delivery succeeded
    Completed {
        record: TelemetryRecord,
        deliveries: Vec<DeliveryOutcome>,
    },
    Aborted {
        at: CycleState,
        error: CycleError,
    },
}

#[derive(Debug)]
pub struct CycleReport {
    /// Every state entered, in order, ending in `Idle` or `Aborted`
    pub states: Vec<CycleState>,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Completed { .. })
    }

    pub fn error(&self) -> Option<&CycleError> {
        match &self.outcome {
            CycleOutcome::Aborted { error, .. } => Some(error),
            CycleOutcome::Completed { .. } => None,
        }
    }
}

struct CycleSettings {
    identity: DeviceIdentity,
    scan_duration: Duration,
    ble_timeout: Duration,
}

/// Drives one poll cycle per polling interval. Only one cycle is ever in flight.
pub struct Poller<S: Scanner, T> {
    settings: CycleSettings,
    scanner: S,
    codec: BmsCodec,
    reporter: Reporter<T>,
    watchdog: Watchdog,
    recovery: RecoveryAction,
    polling_interval: Duration,
    ticker: Option<Interval>,
}

impl<S: Scanner, T: Transport> Poller<S, T> {
    pub fn new(config: &Config, scanner: S, transport: T) -> Self {
        Self {
            settings: CycleSettings {
                identity: config.ble.identity(),
                scan_duration: config.ble.scan_duration(),
                ble_timeout: config.ble.timeout(),
            },
            scanner,
            codec: BmsCodec::from_config(config),
            reporter: Reporter::new(transport, config.endpoints.clone()),
            watchdog: Watchdog::new(config.watchdog_timeout()),
            recovery: config.watchdog.recovery_action(),
            polling_interval: config.bms.polling_interval(),
            ticker: None,
        }
    }

    pub fn reporter(&self) -> &Reporter<T> {
        &self.reporter
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Poll forever.
    pub async fn run(&mut self) {
        loop {
            self.tick().await;
        }
    }

    /// Wait for the next polling interval, then run one cycle. After a watchdog
    /// timeout the recovery action runs before this returns.
    pub async fn tick(&mut self) -> CycleReport {
        let polling_interval = self.polling_interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(polling_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;

        let report = self.run_cycle().await;
        if report.error().is_some_and(CycleError::is_watchdog_timeout) {
            self.recovery.apply().await;
        }
        report
    }

    /// Run one cycle now.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.watchdog.arm();
        let ble_deadline = Instant::now() + self.settings.ble_timeout;
        let watchdog = self.watchdog.clone();
        let mut held: Option<S::Link> = None;
        let mut states = Vec::new();
        enter(&mut states, CycleState::Scanning);

        let result = tokio::select! {
            biased;
            _ = watchdog.expired() => Err(CycleError::WatchdogTimeout { timeout: watchdog.timeout() }),
            result = Self::drive(
                &mut self.scanner,
                &self.codec,
                &self.reporter,
                &self.settings,
                &mut held,
                &mut states,
                ble_deadline,
            ) => result,
        };

        release(&mut held).await;
        self.watchdog.disarm();

        let outcome = match result {
            Ok((record, deliveries)) => {
                let delivered = deliveries.iter().filter(|d| d.is_delivered()).count();
                log::info!(
                    "CYCLE: {:.2}V {:.2}A {}% delivered to {delivered}/{} endpoints",
                    record.pack_voltage_v(),
                    record.pack_current_a(),
                    record.state_of_charge_pct(),
                    deliveries.len()
                );
                enter(&mut states, CycleState::Idle);
                CycleOutcome::Completed { record, deliveries }
            }
            Err(error) => {
                let at = states.last().copied().unwrap_or(CycleState::Idle);
                if error.is_watchdog_timeout() {
                    log::error!("CYCLE: aborted in {at:?}: {error}");
                } else {
                    log::warn!("CYCLE: aborted in {at:?}: {error}");
                }
                enter(&mut states, CycleState::Aborted);
                CycleOutcome::Aborted { at, error }
            }
        };

        CycleReport { states, outcome }
    }

    async fn drive(
        scanner: &mut S,
        codec: &BmsCodec,
        reporter: &Reporter<T>,
        settings: &CycleSettings,
        held: &mut Option<S::Link>,
        states: &mut Vec<CycleState>,
        ble_deadline: Instant,
    ) -> Result<(TelemetryRecord, Vec<DeliveryOutcome>), CycleError> {
        let link = scan_and_connect(scanner, &settings.identity, settings.scan_duration, ble_deadline).await?;
        let link = held.insert(link);
        enter(states, CycleState::Connected);
        enter(states, CycleState::Requesting);

        let result = codec.request(link, ble_deadline).await;
        release(held).await;
        let record = result?;

        enter(states, CycleState::Reporting);
        let deliveries = reporter.dispatch(&record).await;
        Ok((record, deliveries))
    }
}

fn enter(states: &mut Vec<CycleState>, state: CycleState) {
    log::debug!("CYCLE: -> {state:?}");
    states.push(state);
}

/// Disconnect and drop the held link. It stays held until the disconnect returns,
/// so a release interrupted by the watchdog is repeated after the race.
async fn release<L: BmsLink>(held: &mut Option<L>) {
    let Some(link) = held.as_mut() else {
        return;
    };
    match timeout(RELEASE_TIMEOUT, link.disconnect()).await {
        Ok(Ok(())) => log::debug!("BLE: disconnected"),
        Ok(Err(err)) => log::warn!("BLE: failed to disconnect: {err}"),
        Err(_) => log::warn!("BLE: disconnect timed out"),
    }
    *held = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointDescriptor;
    use crate::error::{CodecError, LinkError, ScanError};
    use crate::message::encode_response;
    use crate::telemetry::tests::{BASIC_INFO, CELLS};
    use crate::testing::{candidate, MockLink, MockScanner, MockTransport};
    use CycleState::*;

    fn config() -> Config {
        let mut config = Config::default();
        config.ble.address = None;
        config.endpoints = vec![
            EndpointDescriptor {
                url: "http://unreachable.example/log/".to_string(),
                key: "a".to_string(),
                key_param: "key".to_string(),
            },
            EndpointDescriptor {
                url: "http://reachable.example/log/".to_string(),
                key: "b".to_string(),
                key_param: "key".to_string(),
            },
        ];
        config
    }

    fn frames() -> Vec<Vec<u8>> {
        vec![
            encode_response(0x03, 0x00, &hex::decode(BASIC_INFO).unwrap()),
            encode_response(0x04, 0x00, &hex::decode(CELLS).unwrap()),
        ]
    }

    fn poller(config: &Config, link: MockLink) -> Poller<MockScanner, MockTransport> {
        let scanner = MockScanner::new(vec![candidate(1, Some("xiaoxiang"), None, Some(-60))], link);
        Poller::new(config, scanner, MockTransport::unreachable(&["unreachable.example"]))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_completes_despite_one_failed_endpoint() {
        let link = MockLink::replying(&frames());
        let mut poller = poller(&config(), link.clone());

        let report = poller.run_cycle().await;

        assert_eq!(report.states, vec![Scanning, Connected, Requesting, Reporting, Idle]);
        let CycleOutcome::Completed { record, deliveries } = report.outcome else {
            panic!("cycle aborted");
        };
        assert_eq!(record.cell_voltage_mv().len(), 4);
        assert!(!deliveries[0].is_delivered());
        assert!(deliveries[1].is_delivered());
        assert_eq!(poller.reporter().transport().sent().len(), 2);
        assert_eq!(link.released(), 1);
        assert_eq!(poller.watchdog().deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupted_frame_aborts_and_releases() {
        let mut frames = frames();
        let crc_at = frames[0].len() - 2;
        frames[0][crc_at] ^= 0x01;
        let link = MockLink::replying(&frames);
        let config = config();
        let mut poller = poller(&config, link.clone());
        let started = Instant::now();

        let first = poller.tick().await;
        let second = poller.tick().await;

        assert_eq!(first.states, vec![Scanning, Connected, Requesting, Aborted]);
        assert!(matches!(
            first.outcome,
            CycleOutcome::Aborted { at: Requesting, error: CycleError::Codec(CodecError::MalformedFrame { .. }) }
        ));
        assert!(second.error().is_some());
        assert_eq!(link.released(), 2);
        assert!(started.elapsed() >= config.bms.polling_interval());
        assert!(poller.reporter().transport().sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_not_found_aborts_while_scanning() {
        let mut config = config();
        config.ble.name = Some("someone-else".to_string());
        let link = MockLink::replying(&frames());
        let mut poller = poller(&config, link.clone());

        let report = poller.run_cycle().await;

        assert_eq!(report.states, vec![Scanning, Aborted]);
        assert!(matches!(
            report.outcome,
            CycleOutcome::Aborted { at: Scanning, error: CycleError::Scan(ScanError::DeviceNotFound { .. }) }
        ));
        assert_eq!(link.released(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_aborts_stuck_scan() {
        let config = config();
        let scanner = MockScanner::new(Vec::new(), MockLink::silent()).hanging();
        let mut poller = Poller::new(&config, scanner, MockTransport::default());
        let started = Instant::now();

        let report = poller.run_cycle().await;

        assert!(started.elapsed() >= config.watchdog_timeout());
        assert!(matches!(
            report.outcome,
            CycleOutcome::Aborted { at: Scanning, error: CycleError::WatchdogTimeout { .. } }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_held_link() {
        let mut config = config();
        config.watchdog.margin_ms = 0;
        let link = MockLink::silent();
        let mut poller = poller(&config, link.clone());

        let report = poller.run_cycle().await;

        assert_eq!(report.states, vec![Scanning, Connected, Requesting, Aborted]);
        assert!(report.error().is_some_and(CycleError::is_watchdog_timeout));
        assert_eq!(link.released(), 1);
        assert_eq!(poller.watchdog().deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_during_release_still_disconnects() {
        let mut config = config();
        config.watchdog.margin_ms = 1_000;
        let link = MockLink::silent().slow_disconnect(Duration::from_millis(1_500));
        let mut poller = poller(&config, link.clone());

        let report = poller.run_cycle().await;

        assert_eq!(report.states, vec![Scanning, Connected, Requesting, Aborted]);
        assert!(report.error().is_some_and(CycleError::is_watchdog_timeout));
        assert_eq!(link.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_setup_is_torn_down() {
        let config = config();
        let link = MockLink::silent();
        let scanner =
            MockScanner::new(vec![candidate(1, Some("xiaoxiang"), None, Some(-60))], link.clone()).stalling_setup();
        let mut poller = Poller::new(&config, scanner, MockTransport::default());
        let started = Instant::now();

        let report = poller.run_cycle().await;

        assert_eq!(report.states, vec![Scanning, Aborted]);
        assert!(matches!(
            report.outcome,
            CycleOutcome::Aborted {
                at: Scanning,
                error: CycleError::Scan(ScanError::ConnectFailure { source: LinkError::Timeout, .. })
            }
        ));
        assert!(started.elapsed() < config.watchdog_timeout());
        assert_eq!(link.connected(), 1);
        assert_eq!(link.released(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_timeout_applies_recovery_sleep() {
        let mut config = config();
        config.watchdog.recovery_sleep_ms = 60_000;
        let scanner = MockScanner::new(Vec::new(), MockLink::silent()).hanging();
        let mut poller = Poller::new(&config, scanner, MockTransport::default());
        let started = Instant::now();

        poller.tick().await;

        assert!(started.elapsed() >= config.watchdog_timeout() + Duration::from_secs(60));
    }
}
