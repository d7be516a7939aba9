//! Scripted stand-ins for the BLE and HTTP sides of a poll cycle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Url;
use tokio::time::Instant;

use crate::error::{DeliveryError, LinkError};
use crate::link::{BmsLink, Candidate, Scanner};
use crate::reporter::Transport;

pub(crate) fn candidate(id: u32, name: Option<&str>, address: Option<&str>, rssi: Option<i16>) -> Candidate<u32> {
    Candidate {
        name: name.map(str::to_string),
        address: address.map(|a| a.parse().unwrap()),
        rssi,
        device: id,
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Notify(Vec<u8>),
    /// Never deliver anything again
    Hang,
    End,
}

/// A link that replays notifications in order, regardless of what is written.
#[derive(Debug, Clone)]
pub(crate) struct MockLink {
    script: VecDeque<Step>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    connected: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
    disconnect_delay: Duration,
}

impl MockLink {
    pub(crate) fn new(script: Vec<Step>) -> Self {
        Self {
            script: script.into(),
            writes: Arc::default(),
            connected: Arc::default(),
            released: Arc::default(),
            disconnect_delay: Duration::ZERO,
        }
    }

    pub(crate) fn silent() -> Self {
        Self::new(vec![Step::Hang])
    }

    /// A link delivering each frame split into 20 byte notifications, the way a
    /// BLE UART bridge does.
    pub(crate) fn replying(frames: &[Vec<u8>]) -> Self {
        let script = frames
            .iter()
            .flat_map(|frame| frame.chunks(20).map(|c| Step::Notify(c.to_vec())).collect::<Vec<_>>())
            .collect();
        Self::new(script)
    }

    /// Disconnects take `delay` to complete
    pub(crate) fn slow_disconnect(mut self, delay: Duration) -> Self {
        self.disconnect_delay = delay;
        self
    }

    /// How many times a scanner brought this link, or a clone of it, up
    pub(crate) fn connected(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    /// How many disconnects of this link, or a clone of it, ran to completion
    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

impl BmsLink for MockLink {
    async fn write(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        self.writes.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, LinkError> {
        match self.script.pop_front() {
            Some(Step::Notify(data)) => Ok(Some(data)),
            Some(Step::End) => Ok(None),
            Some(Step::Hang) | None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        tokio::time::sleep(self.disconnect_delay).await;
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockScanner {
    candidates: Vec<Candidate<u32>>,
    link: MockLink,
    refuse: bool,
    hang_scan: bool,
    stall_setup: bool,
    attempts: Vec<u32>,
}

impl MockScanner {
    pub(crate) fn new(candidates: Vec<Candidate<u32>>, link: MockLink) -> Self {
        Self { candidates, link, refuse: false, hang_scan: false, stall_setup: false, attempts: Vec::new() }
    }

    pub(crate) fn refusing(mut self) -> Self {
        self.refuse = true;
        self
    }

    /// Scans never complete
    pub(crate) fn hanging(mut self) -> Self {
        self.hang_scan = true;
        self
    }

    /// The connection comes up but setup never finishes, so `connect` runs into
    /// its deadline and tears the connection down again
    pub(crate) fn stalling_setup(mut self) -> Self {
        self.stall_setup = true;
        self
    }

    pub(crate) fn connect_attempts(&self) -> Vec<u32> {
        self.attempts.clone()
    }
}

impl Scanner for MockScanner {
    type Device = u32;
    type Link = MockLink;

    async fn scan(&mut self, window: Duration) -> Result<Vec<Candidate<u32>>, LinkError> {
        if self.hang_scan {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(window).await;
        Ok(self.candidates.clone())
    }

    async fn connect(&mut self, candidate: &Candidate<u32>, deadline: Instant) -> Result<MockLink, LinkError> {
        self.attempts.push(candidate.device);
        if self.refuse {
            return Err(LinkError::Unsupported("connection refused"));
        }
        self.link.connected.fetch_add(1, Ordering::SeqCst);
        if self.stall_setup {
            tokio::time::sleep_until(deadline).await;
            self.link.clone().disconnect().await?;
            return Err(LinkError::Timeout);
        }
        Ok(self.link.clone())
    }
}

/// Accepts every request except those to the hosts it was told are unreachable.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    unreachable: Vec<String>,
    sent: Mutex<Vec<Url>>,
}

impl MockTransport {
    pub(crate) fn unreachable(hosts: &[&str]) -> Self {
        Self {
            unreachable: hosts.iter().map(|h| h.to_string()).collect(),
            sent: Mutex::default(),
        }
    }

    pub(crate) fn sent(&self) -> Vec<Url> {
        self.sent.lock().unwrap().clone()
    }
}

impl Transport for MockTransport {
    async fn get(&self, url: Url) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(url.clone());
        match url.host_str() {
            Some(host) if self.unreachable.iter().any(|h| h == host) => {
                Err(DeliveryError::Network(format!("{host}: network unreachable")))
            }
            _ => Ok(()),
        }
    }
}
