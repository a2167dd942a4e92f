/// Config schema types for the messaging session manager.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReciboConfig {
    pub whatsapp: WhatsAppConfig,
}

/// How outbound messages pick the connection they go out through when the
/// caller does not name a branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendRouting {
    /// Use any connected branch (lowest branch id first).
    #[default]
    AnyConnected,
    /// Refuse unscoped sends; callers must name the branch.
    BranchOnly,
}

/// Per-branch messaging sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Directory holding one `session_<branch>` folder per paired branch.
    /// Defaults to `~/.recibo/sessions`.
    pub sessions_root: Option<PathBuf>,

    /// Reconnects attempted after a recoverable close before the session is dropped.
    pub max_reconnect_attempts: u32,

    /// Linear backoff unit: attempt `n` waits `n * reconnect_base_delay_ms`.
    pub reconnect_base_delay_ms: u64,

    /// How long `ensure_connection` waits for a pairing code or an open connection.
    pub pairing_timeout_secs: u64,

    pub routing: SendRouting,

    /// Websocket endpoint of the messaging bridge process.
    pub bridge_url: String,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            sessions_root: None,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 5_000,
            pairing_timeout_secs: 60,
            routing: SendRouting::AnyConnected,
            bridge_url: "ws://127.0.0.1:3210".into(),
        }
    }
}

impl WhatsAppConfig {
    /// Resolved sessions root: the configured path or `<data_dir>/sessions`.
    pub fn sessions_root(&self) -> PathBuf {
        self.sessions_root
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("sessions"))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn pairing_timeout(&self) -> Duration {
        Duration::from_secs(self.pairing_timeout_secs)
    }
}
