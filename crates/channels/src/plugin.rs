use {anyhow::Result, async_trait::async_trait, serde::Serialize};

/// A file attached to an outbound message (receipt PDF, XML, ...).
#[derive(Debug, Clone)]
pub struct OutboundDocument {
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub mimetype: String,
}

/// Send messages through a channel account.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    /// Returns the transport-assigned message id.
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<String>;
    async fn send_document(
        &self,
        account_id: &str,
        to: &str,
        caption: &str,
        document: OutboundDocument,
    ) -> Result<String>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}
