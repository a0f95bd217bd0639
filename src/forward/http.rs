use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};

use super::{EventSink, ForwardError};
use crate::core::{IngestError, IngestResult};
use crate::protocol::NormalizedEvent;
use crate::tls::install_rustls_crypto_provider;

pub const EVENTS_PATH: &str = "/api/v1/events";

#[derive(Serialize)]
struct ForwardEnvelope<'a> {
    event_id: &'a str,
    timestamp: DateTime<Utc>,
    source: &'a str,
    data: &'a NormalizedEvent,
}

#[derive(Debug, Deserialize)]
struct IngestAck {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Posts events to `{base}/api/v1/events` over a pooled reqwest client.
#[derive(Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    pub fn new(base_url: &str, timeout: Duration) -> IngestResult<Self> {
        install_rustls_crypto_provider();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Config(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: format!("{}{EVENTS_PATH}", base_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn classify(err: reqwest::Error) -> ForwardError {
    if err.is_timeout() {
        ForwardError::Timeout
    } else {
        ForwardError::Transport(err.to_string())
    }
}

#[async_trait]
impl EventSink for HttpSink {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, event: &NormalizedEvent) -> Result<(), ForwardError> {
        let body = sonic_rs::to_vec(&ForwardEnvelope {
            event_id: &event.event_id,
            timestamp: event.timestamp,
            source: event.source,
            data: event,
        })
        .map_err(|e| ForwardError::Encode(e.to_string()))?;

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await.map_err(classify)?;
        let ack: IngestAck = sonic_rs::from_slice(&bytes)
            .map_err(|e| ForwardError::InvalidResponse(e.to_string()))?;
        if ack.success {
            Ok(())
        } else {
            Err(ForwardError::Rejected(
                ack.message.unwrap_or_else(|| "success=false".to_string()),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_base_and_path() {
        let sink = HttpSink::new("http://enrichment:8002/", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.url(), "http://enrichment:8002/api/v1/events");
    }
}
