//! HTTP client for the SFU control API.
//!
//! # Routes
//!
//! | Operation | Route |
//! |---|---|
//! | router capabilities | `GET /rooms/{room}/rtp-capabilities` |
//! | create transport | `POST /rooms/{room}/transports` |
//! | connect transport | `POST /transports/{id}/connect` |
//! | close transport | `DELETE /transports/{id}` |
//! | produce | `POST /transports/{id}/producers` |
//! | consume | `POST /transports/{id}/consumers` |
//! | pause / resume consumer | `POST /consumers/{id}/pause`, `/resume` |
//! | close producer | `DELETE /producers/{id}` |
//! | stats | `GET /stats/{id}` |
//!
//! Status mapping: `404` is [`MediaEngineError::NotFound`], `400`/`409`/`422`
//! are [`MediaEngineError::Rejected`], everything else (including timeouts)
//! is [`MediaEngineError::Unavailable`].

use super::{MediaEngine, MediaEngineError, MediaStats};
use crate::observability::metrics;
use common::types::{ConsumerDescriptor, MediaKind, TransportDescriptor, TransportDirection};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// Connect timeout for the sidecar.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceResponse {
    producer_id: String,
}

/// [`MediaEngine`] backed by the SFU's HTTP control API.
#[derive(Debug, Clone)]
pub struct HttpMediaEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMediaEngine {
    /// Create a client for the engine at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`MediaEngineError::Unavailable`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MediaEngineError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| {
                MediaEngineError::Unavailable(format!("Failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a request and decode a JSON body.
    async fn call_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<T, MediaEngineError> {
        let start = Instant::now();
        let result = match execute(request).await {
            Ok(response) => response.json::<T>().await.map_err(|e| {
                MediaEngineError::Unavailable(format!("invalid response body: {e}"))
            }),
            Err(e) => Err(e),
        };
        observe(operation, start, &result);
        result
    }

    /// Send a request whose response body is irrelevant.
    async fn call_empty(
        &self,
        operation: &'static str,
        request: RequestBuilder,
    ) -> Result<(), MediaEngineError> {
        let start = Instant::now();
        let result = execute(request).await.map(|_| ());
        observe(operation, start, &result);
        result
    }
}

async fn execute(request: RequestBuilder) -> Result<Response, MediaEngineError> {
    let response = request.send().await.map_err(|e| {
        debug!(target: "sc.media_engine", error = %e, "HTTP request failed");
        MediaEngineError::Unavailable(e.to_string())
    })?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_else(|e| {
        trace!(target: "sc.media_engine", error = %e, "Failed to read error response body");
        String::new()
    });
    // Body may echo client-supplied parameters; keep it out of info-level logs
    trace!(target: "sc.media_engine", status = %status, body = %body, "Engine error response body");

    Err(classify_status(status, body))
}

fn classify_status(status: StatusCode, detail: String) -> MediaEngineError {
    let detail = if detail.is_empty() {
        status.to_string()
    } else {
        detail
    };
    match status {
        StatusCode::NOT_FOUND => MediaEngineError::NotFound(detail),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            MediaEngineError::Rejected(detail)
        }
        _ => MediaEngineError::Unavailable(detail),
    }
}

fn observe<T>(operation: &'static str, start: Instant, result: &Result<T, MediaEngineError>) {
    metrics::record_media_engine_latency(operation, start.elapsed());
    if let Err(e) = result {
        metrics::record_media_engine_error(operation, e.kind_label());
        warn!(
            target: "sc.media_engine",
            operation = operation,
            kind = e.kind_label(),
            "Media engine call failed"
        );
    }
}

#[async_trait::async_trait]
impl MediaEngine for HttpMediaEngine {
    #[instrument(skip_all, fields(room_id = %room_id))]
    async fn router_rtp_capabilities(
        &self,
        room_id: &str,
    ) -> Result<serde_json::Value, MediaEngineError> {
        let request = self
            .client
            .get(self.url(&format!("/rooms/{room_id}/rtp-capabilities")));
        self.call_json("router_rtp_capabilities", request).await
    }

    #[instrument(skip_all, fields(room_id = %room_id, direction = direction.as_str()))]
    async fn create_transport(
        &self,
        room_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/rooms/{room_id}/transports")))
            .json(&json!({ "direction": direction }));
        self.call_json("create_transport", request).await
    }

    #[instrument(skip_all, fields(transport_id = %transport_id))]
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: serde_json::Value,
    ) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/connect")))
            .json(&json!({ "dtlsParameters": dtls_parameters }));
        self.call_empty("connect_transport", request).await
    }

    #[instrument(skip_all, fields(transport_id = %transport_id))]
    async fn close_transport(&self, transport_id: &str) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .delete(self.url(&format!("/transports/{transport_id}")));
        self.call_empty("close_transport", request).await
    }

    #[instrument(skip_all, fields(transport_id = %transport_id, kind = kind.as_str()))]
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: serde_json::Value,
    ) -> Result<String, MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/producers")))
            .json(&json!({ "kind": kind, "rtpParameters": rtp_parameters }));
        let response: ProduceResponse = self.call_json("produce", request).await?;
        Ok(response.producer_id)
    }

    #[instrument(skip_all, fields(transport_id = %transport_id, producer_id = %producer_id))]
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: serde_json::Value,
    ) -> Result<ConsumerDescriptor, MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/transports/{transport_id}/consumers")))
            .json(&json!({
                "producerId": producer_id,
                "rtpCapabilities": rtp_capabilities,
                "paused": true,
            }));
        self.call_json("consume", request).await
    }

    #[instrument(skip_all, fields(consumer_id = %consumer_id))]
    async fn pause_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/consumers/{consumer_id}/pause")));
        self.call_empty("pause_consumer", request).await
    }

    #[instrument(skip_all, fields(consumer_id = %consumer_id))]
    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .post(self.url(&format!("/consumers/{consumer_id}/resume")));
        self.call_empty("resume_consumer", request).await
    }

    #[instrument(skip_all, fields(producer_id = %producer_id))]
    async fn close_producer(&self, producer_id: &str) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .delete(self.url(&format!("/producers/{producer_id}")));
        self.call_empty("close_producer", request).await
    }

    #[instrument(skip_all, fields(consumer_id = %consumer_id))]
    async fn close_consumer(&self, consumer_id: &str) -> Result<(), MediaEngineError> {
        let request = self
            .client
            .delete(self.url(&format!("/consumers/{consumer_id}")));
        self.call_empty("close_consumer", request).await
    }

    async fn get_stats(&self, object_id: &str) -> Result<MediaStats, MediaEngineError> {
        let request = self.client.get(self.url(&format!("/stats/{object_id}")));
        self.call_json("get_stats", request).await
    }
}
