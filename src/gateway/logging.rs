//! Gateway used when no backend is configured.
//!
//! Every submission is logged and acknowledged with an empty receipt, so the
//! relay can run on its own during development.

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use super::{AudioReceipt, DownstreamGateway, GatewayError, SummaryReceipt};
use crate::session::ConnectionId;

pub struct LoggingGateway;

#[async_trait]
impl DownstreamGateway for LoggingGateway {
    async fn submit_audio(
        &self,
        session_id: &ConnectionId,
        utterance: u64,
        audio: Bytes,
    ) -> Result<AudioReceipt, GatewayError> {
        info!(
            session_id = %session_id,
            utterance,
            bytes = audio.len(),
            "Utterance committed (no backend configured)"
        );
        Ok(AudioReceipt::default())
    }

    async fn submit_summary_request(
        &self,
        session_id: &ConnectionId,
        transcript: &str,
    ) -> Result<SummaryReceipt, GatewayError> {
        info!(
            session_id = %session_id,
            transcript_chars = transcript.chars().count(),
            "Summary requested (no backend configured)"
        );
        Ok(SummaryReceipt::default())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
