//! # Downstream Gateway
//!
//! The transcription/summarization backend is opaque to the relay. It is
//! only reached through [`DownstreamGateway`]. Calls are started by the
//! event router on their own task and never block the session that issued
//! them.
//!
//! ## Implementations:
//! - **`HttpGateway`**: JSON over HTTP to a configurable base URL
//! - **`LoggingGateway`**: accepts everything and only logs it (no backend)

pub mod http;
pub mod logging;

pub use http::HttpGateway;
pub use logging::LoggingGateway;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::{GatewayConfig, GatewayKind};
use crate::error::RelayError;
use crate::session::ConnectionId;

/// Reply to an audio submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioReceipt {
    /// Transcribed text, if the backend answers synchronously.
    #[serde(default)]
    pub transcript: Option<String>,
}

/// Reply to a summary request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryReceipt {
    #[serde(default)]
    pub summary: String,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid backend response: {0}")]
    Decode(String),
}

impl From<GatewayError> for RelayError {
    fn from(err: GatewayError) -> Self {
        RelayError::DownstreamFailure(err.to_string())
    }
}

/// Interface to the external transcription and summarization service.
#[async_trait]
pub trait DownstreamGateway: Send + Sync {
    /// Submit one committed utterance.
    async fn submit_audio(
        &self,
        session_id: &ConnectionId,
        utterance: u64,
        audio: Bytes,
    ) -> Result<AudioReceipt, GatewayError>;

    /// Ask for a summary of the transcript accumulated so far.
    async fn submit_summary_request(
        &self,
        session_id: &ConnectionId,
        transcript: &str,
    ) -> Result<SummaryReceipt, GatewayError>;

    /// Short name for logs and the health endpoint.
    fn name(&self) -> &'static str;
}

/// Build the gateway selected in configuration.
pub fn build(config: &GatewayConfig) -> anyhow::Result<Arc<dyn DownstreamGateway>> {
    let gateway: Arc<dyn DownstreamGateway> = match config.kind {
        GatewayKind::Log => Arc::new(LoggingGateway),
        GatewayKind::Http => Arc::new(HttpGateway::new(config)?),
    };
    Ok(gateway)
}

#[cfg(test)]
pub mod testing {
    //! In-memory gateway that records every call.

    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    pub enum RecordedCall {
        Audio {
            session_id: ConnectionId,
            utterance: u64,
            audio: Bytes,
        },
        Summary {
            session_id: ConnectionId,
            transcript: String,
        },
    }

    #[derive(Default)]
    pub struct RecordingGateway {
        calls: Mutex<Vec<RecordedCall>>,
        fail: bool,
        /// When set, every call waits for one notification before replying.
        gate: Option<Arc<Notify>>,
    }

    impl RecordingGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        pub fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        async fn finish(&self) -> Result<(), GatewayError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail {
                return Err(GatewayError::Status {
                    status: 503,
                    body: "backend unavailable".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DownstreamGateway for RecordingGateway {
        async fn submit_audio(
            &self,
            session_id: &ConnectionId,
            utterance: u64,
            audio: Bytes,
        ) -> Result<AudioReceipt, GatewayError> {
            let transcript = format!("utterance {} ({} bytes)", utterance, audio.len());
            self.calls.lock().push(RecordedCall::Audio {
                session_id: session_id.clone(),
                utterance,
                audio,
            });
            self.finish().await?;
            Ok(AudioReceipt {
                transcript: Some(transcript),
            })
        }

        async fn submit_summary_request(
            &self,
            session_id: &ConnectionId,
            transcript: &str,
        ) -> Result<SummaryReceipt, GatewayError> {
            self.calls.lock().push(RecordedCall::Summary {
                session_id: session_id.clone(),
                transcript: transcript.to_string(),
            });
            self.finish().await?;
            Ok(SummaryReceipt {
                summary: format!("summary of: {}", transcript),
            })
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }
}
