//! HTTP implementation of the signal transport.
//!
//! Signals are POSTed as JSON to `http://host:port/signals{signal-name}` on
//! the target isolate; the receiving side is the axum route installed by
//! [`crate::server::build_router`]. The client timeout bounds every send, so
//! a hung peer costs at most one timeout per broadcast target.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::directory::IsolateAccess;
use crate::signals::{SignalEnvelope, SignalTransport, TransportError};

/// Reqwest-backed signal sender.
pub struct HttpSignalTransport {
    client: reqwest::Client,
    timeout: Duration,
    intents: BTreeSet<String>,
}

impl HttpSignalTransport {
    /// Builds the transport with a per-request timeout and the intents this
    /// transport guarantees (from configuration).
    pub fn new(
        timeout: Duration,
        intents: impl IntoIterator<Item = String>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            timeout,
            intents: intents.into_iter().collect(),
        })
    }

    fn url(&self, target: &IsolateAccess, signal: &str) -> String {
        format!("http://{}:{}/signals{signal}", target.host, target.port)
    }

    async fn post(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<reqwest::Response, TransportError> {
        let url = self.url(target, signal);
        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|source| {
                if source.is_timeout() {
                    TransportError::Timeout {
                        target: url.clone(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    TransportError::Unreachable {
                        target: url.clone(),
                        source,
                    }
                }
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(TransportError::Status {
                target: url,
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl SignalTransport for HttpSignalTransport {
    fn intents(&self) -> &BTreeSet<String> {
        &self.intents
    }

    async fn fire(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<(), TransportError> {
        self.post(target, signal, envelope).await.map(|_| ())
    }

    async fn send(
        &self,
        target: &IsolateAccess,
        signal: &str,
        envelope: &SignalEnvelope,
    ) -> Result<Option<serde_json::Value>, TransportError> {
        let response = self.post(target, signal, envelope).await?;
        let url = self.url(target, signal);

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let text = response.text().await.map_err(|source| TransportError::Payload {
            target: url.clone(),
            detail: source.to_string(),
        })?;
        if text.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| TransportError::Payload {
                target: url,
                detail: source.to_string(),
            })
    }
}
