use std::{path::PathBuf, sync::Arc};

use crate::branch::BranchId;

/// Errors surfaced by the session manager.
///
/// `Clone` because one initialization result is handed to every caller
/// attached to it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid branch identifier {0:?}")]
    InvalidBranch(String),

    #[error("credential store I/O failed at {}", path.display())]
    Credentials {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("refusing credential file name {0:?}")]
    InvalidCredentialFile(String),

    #[error("failed to open transport session for branch {branch}: {message}")]
    Open { branch: BranchId, message: String },

    #[error("initialization for branch {0} aborted before completing")]
    InitAborted(BranchId),

    #[error("failed to encode pairing code: {0}")]
    PairingEncode(String),

    #[error("no active connection available")]
    NoActiveConnection,

    #[error("branch {0} has no active connection")]
    BranchNotConnected(BranchId),

    #[error("unscoped sends are disabled; name the sending branch")]
    UnscopedSendDisabled,

    #[error("invalid destination {0:?}")]
    InvalidDestination(String),

    #[error("send through branch {branch} failed: {message}")]
    Send { branch: BranchId, message: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Credentials {
            path: path.into(),
            source: Arc::new(source),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
