//! Per-branch messaging sessions.
//!
//! Each branch gets at most one live transport connection. The
//! [`SessionManager`] pairs branches, supervises their connections
//! (reconnect with backoff, terminal logout), persists credentials under
//! `<root>/session_<branch>/` and routes outbound receipts.

pub mod branch;
pub mod bridge;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod guard;
pub mod manager;
pub mod pairing;
pub mod recovery;
pub mod registry;
pub mod supervisor;
mod telemetry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use {
    branch::BranchId,
    bridge::WsBridgeTransport,
    credentials::CredentialStore,
    dispatch::{MessageDispatcher, SendRoute},
    error::{Error, Result},
    guard::InitializationGuard,
    manager::{BranchStatus, PairingCodeResponse, SessionManager, SessionStats, SessionSummary},
    pairing::{PairingCode, PairingCodeCache},
    registry::{ConnectionState, SessionRegistry, SessionStatus},
    supervisor::{ConnectOutcome, ConnectionSupervisor, SupervisorSettings},
};
