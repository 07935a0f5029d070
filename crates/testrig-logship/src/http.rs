//! Delivery of batches to the remote collector.

use crate::config::{RetryPolicy, ShipperConfig};
use crate::error::DeliveryError;
use crate::record::LogRecord;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::thread;

/// Sends one batch; called from the flush path only.
///
/// Implementations must not log: the shipper may itself be the installed
/// logger.
pub trait Delivery: Send + Sync + 'static {
    fn send(&self, batch: &[LogRecord]) -> Result<(), DeliveryError>;
}

/// Posts each batch as a JSON array with basic authentication.
pub struct HttpDelivery {
    client: Client,
    url: String,
    username: String,
    password: Option<String>,
    retry: RetryPolicy,
}

impl HttpDelivery {
    pub fn new(config: &ShipperConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            url: config.url(),
            username: config.username.clone(),
            password: config.password.clone(),
            retry: config.retry.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn post(&self, body: &[u8]) -> reqwest::Result<reqwest::blocking::Response> {
        self.client
            .post(&self.url)
            .basic_auth(&self.username, self.password.as_ref())
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(body.to_vec())
            .send()
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

impl Delivery for HttpDelivery {
    fn send(&self, batch: &[LogRecord]) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(batch)?;
        let mut retries = 0;
        loop {
            match self.post(&body) {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    let status = status.as_u16();
                    if !self.retry.should_retry(status) {
                        return Err(DeliveryError::Rejected {
                            status,
                            body: response.text().unwrap_or_default(),
                        });
                    }
                    if retries >= self.retry.max_retries {
                        return Err(DeliveryError::RetriesExhausted {
                            status,
                            attempts: retries + 1,
                        });
                    }
                }
                Err(err) if is_transient(&err) && retries < self.retry.max_retries => {}
                Err(err) => return Err(err.into()),
            }
            retries += 1;
            thread::sleep(self.retry.backoff(retries));
        }
    }
}
