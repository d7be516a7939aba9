use std::time::Duration;

use chrono::{FixedOffset, Utc};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::config::Config;
use crate::error::{CodecError, LinkError};
use crate::link::BmsLink;
use crate::message::{encode_request, try_parse_msg, BasicInfo, CellVoltages, Register, TryParseMessageResult};
use crate::telemetry::TelemetryRecord;

/// Reads one [`TelemetryRecord`] over an open link.
#[derive(Debug, Clone)]
pub struct BmsCodec {
    max_cells: usize,
    request_delay: Duration,
    utc_offset: FixedOffset,
}

impl BmsCodec {
    pub fn new(max_cells: usize, request_delay: Duration, utc_offset: FixedOffset) -> Self {
        Self { max_cells, request_delay, utc_offset }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.bms.max_cells, config.ble.request_delay(), config.time.utc_offset())
    }

    /// Read basic info then cell voltages, finishing by `deadline`.
    ///
    /// The link is given `request_delay` to settle between the first request and
    /// the first read.
    pub async fn request<L: BmsLink>(&self, link: &mut L, deadline: Instant) -> Result<TelemetryRecord, CodecError> {
        let data = self.request_response(link, Register::BasicInfo, self.request_delay, deadline).await?;
        let info = BasicInfo::decode(&data, self.max_cells).map_err(|reason| CodecError::malformed(reason, &data))?;

        let data = self.request_response(link, Register::CellVoltages, Duration::ZERO, deadline).await?;
        let cells = CellVoltages::decode(&data, self.max_cells).map_err(|reason| CodecError::malformed(reason, &data))?;
        log::debug!("BMS: {info:?} {cells:?}");

        let timestamp = Utc::now().with_timezone(&self.utc_offset);
        TelemetryRecord::from_frames(&info, cells, self.max_cells, timestamp)
            .map_err(|reason| CodecError::malformed(reason, &data))
    }

    async fn request_response<L: BmsLink>(
        &self,
        link: &mut L,
        register: Register,
        settle: Duration,
        deadline: Instant,
    ) -> Result<Vec<u8>, CodecError> {
        let rq = encode_request(register);
        log::debug!("BMS: TX: {}", hex::encode(rq));

        timeout_at(deadline, link.write(&rq))
            .await
            .map_err(|_| CodecError::Link(LinkError::Timeout))??;

        if !settle.is_zero() {
            sleep_until(deadline.min(Instant::now() + settle)).await;
        }

        self.read_message(link, register, deadline).await
    }

    /// Accumulate notifications until they form a complete frame for `register`,
    /// or the deadline passes.
    ///
    /// A frame arrives split over several notifications. Its header carries the
    /// length, so the frame is known to be complete once that many bytes are in;
    /// the checksum is only checked then.
    async fn read_message<L: BmsLink>(
        &self,
        link: &mut L,
        register: Register,
        deadline: Instant,
    ) -> Result<Vec<u8>, CodecError> {
        let mut response = Vec::<u8>::new();
        loop {
            match try_parse_msg(&response, register, self.max_cells) {
                TryParseMessageResult::Ok(payload) => return Ok(payload),
                TryParseMessageResult::Invalid(reason) => return Err(CodecError::malformed(reason, &response)),
                TryParseMessageResult::Unexpected(actual) => {
                    return Err(CodecError::UnexpectedFrame { expected: register.id(), actual })
                }
                TryParseMessageResult::Incomplete => {}
            }

            match timeout_at(deadline, link.recv()).await {
                Err(_) => {
                    return Err(CodecError::IncompleteResponse {
                        received: response.len(),
                        frame: hex::encode(&response),
                    })
                }
                Ok(Ok(None)) => {
                    log::debug!("BMS: End of notification stream");
                    return Err(LinkError::Closed.into());
                }
                Ok(Ok(Some(data))) => {
                    log::debug!("BMS: RX notification: 0x{}", hex::encode(&data));
                    response.extend_from_slice(&data);
                }
                Ok(Err(err)) => {
                    log::debug!("BMS: Notification error: {err}");
                    return Err(err.into());
                }
            }
        }
    }
}
