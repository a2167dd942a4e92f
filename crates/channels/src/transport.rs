//! Boundary to the messaging transport library.
//!
//! A transport opens one session per branch from persisted auth state and
//! reports everything that happens on it as a sequential event stream.

use std::{collections::BTreeMap, sync::Arc};

use {anyhow::Result, async_trait::async_trait, tokio::sync::mpsc};

use crate::plugin::OutboundDocument;

/// Close status the transport reports when the account was logged out from
/// the companion app. Every other status is treated as recoverable.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Opaque credential files, keyed by file name.
///
/// The transport owns the contents; the session manager only moves them
/// between disk and the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub files: BTreeMap<String, Vec<u8>>,
}

impl AuthState {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Events emitted by an open session, one at a time.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A new pairing code (QR payload) the user must scan.
    PairingCode(String),
    /// The session authenticated; carries the account's phone identity.
    Opened { identity: String },
    /// The connection closed with the given status code.
    Closed { status: u16 },
    /// Credentials rotated and must be persisted.
    CredentialsUpdated(AuthState),
}

/// What goes out in a single send.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    Document {
        caption: String,
        document: OutboundDocument,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
}

/// A live connection for one branch.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<SentMessage>;

    /// Close the connection. Must be idempotent.
    async fn close(&self);
}

/// A freshly opened session: the handle plus its event stream.
pub struct OpenedSession {
    pub handle: Arc<dyn TransportHandle>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Opens transport sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open_session(&self, branch: &str, auth: AuthState) -> Result<OpenedSession>;
}
