//! HTTP client for the transcription/summarization backend.
//!
//! ## Endpoints:
//! - `POST {base_url}/transcriptions`: `{session_id, utterance, audio}` → `{transcript?}`
//! - `POST {base_url}/summaries`: `{session_id, transcript}` → `{summary}`
//!
//! Audio is sent base64-encoded inside the JSON body.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::{AudioReceipt, DownstreamGateway, GatewayError, SummaryReceipt};
use crate::config::GatewayConfig;
use crate::session::ConnectionId;

#[derive(Debug, Serialize)]
struct TranscriptionRequest<'a> {
    session_id: &'a ConnectionId,
    utterance: u64,
    audio: String,
}

#[derive(Debug, Serialize)]
struct SummaryRequest<'a> {
    session_id: &'a ConnectionId,
    transcript: &'a str,
}

pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("gateway.base_url is required for the http gateway"))?
            .trim_end_matches('/')
            .to_string();

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.endpoint(path);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(url = %url, elapsed_ms = started.elapsed().as_millis() as u64, "Backend request failed: {}", e);
                GatewayError::Transport(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = response
            .json::<R>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        debug!(url = %url, elapsed_ms = started.elapsed().as_millis() as u64, "Backend request completed");
        Ok(parsed)
    }
}

#[async_trait]
impl DownstreamGateway for HttpGateway {
    async fn submit_audio(
        &self,
        session_id: &ConnectionId,
        utterance: u64,
        audio: Bytes,
    ) -> Result<AudioReceipt, GatewayError> {
        let request = TranscriptionRequest {
            session_id,
            utterance,
            audio: STANDARD.encode(&audio),
        };
        self.post("transcriptions", &request).await
    }

    async fn submit_summary_request(
        &self,
        session_id: &ConnectionId,
        transcript: &str,
    ) -> Result<SummaryReceipt, GatewayError> {
        let request = SummaryRequest {
            session_id,
            transcript,
        };
        self.post("summaries", &request).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
