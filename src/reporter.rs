use std::time::Duration;

use futures_util::future::join_all;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

use crate::config::{EndpointDescriptor, KEY_PLACEHOLDER};
use crate::error::DeliveryError;
use crate::telemetry::TelemetryRecord;

/// Everything but the RFC 3986 unreserved characters
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Sends one prepared request.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn get(&self, url: Url) -> Result<(), DeliveryError>;
}

/// Plain HTTP(S) GET through `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, url: Url) -> Result<(), DeliveryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| DeliveryError::Network(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// The result of delivering one record to one endpoint.
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub endpoint: String,
    pub result: Result<(), DeliveryError>,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Ships records to every configured endpoint.
pub struct Reporter<T> {
    transport: T,
    endpoints: Vec<EndpointDescriptor>,
}

impl<T: Transport> Reporter<T> {
    pub fn new(transport: T, endpoints: Vec<EndpointDescriptor>) -> Self {
        Self { transport, endpoints }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Deliver `record` to all endpoints at once. Each endpoint gets exactly one
    /// attempt and its outcome never affects the others.
    pub async fn dispatch(&self, record: &TelemetryRecord) -> Vec<DeliveryOutcome> {
        join_all(self.endpoints.iter().map(|endpoint| self.deliver(endpoint, record))).await
    }

    async fn deliver(&self, endpoint: &EndpointDescriptor, record: &TelemetryRecord) -> DeliveryOutcome {
        let result = match request_url(endpoint, record) {
            Ok(url) => self.transport.get(url).await,
            Err(err) => Err(err),
        };
        match &result {
            Ok(()) => log::debug!("REPORT: delivered to {}", endpoint.url),
            Err(err) => log::warn!("REPORT: delivery to {} failed: {err}", endpoint.url),
        }
        DeliveryOutcome { endpoint: endpoint.url.clone(), result }
    }
}

/// Build the GET request URL carrying `record` and the endpoint's key.
pub fn request_url(endpoint: &EndpointDescriptor, record: &TelemetryRecord) -> Result<Url, DeliveryError> {
    let base = endpoint.url.replace(KEY_PLACEHOLDER, &utf8_percent_encode(&endpoint.key, KEY_ENCODE_SET).to_string());
    let mut url = Url::parse(&base).map_err(|err| DeliveryError::InvalidUrl {
        url: endpoint.url.clone(),
        reason: err.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        if !endpoint.is_templated() {
            query.append_pair(&endpoint.key_param, &endpoint.key);
        }
        for (name, value) in record.query_pairs() {
            query.append_pair(name, &value);
        }
    }
    Ok(url)
}
