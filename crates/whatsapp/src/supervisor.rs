//! Per-branch connection state machine.
//!
//! Each live branch is driven by one task that consumes the transport's event
//! stream, so transitions for a branch are applied strictly in order. The
//! task also owns the reconnect loop: a recoverable close moves the branch to
//! `Reconnecting`, waits `base * attempt` and reopens, until the attempt
//! ceiling is hit and the session is dropped. A logged-out close wipes
//! everything the branch owns.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    dashmap::DashMap,
    recibo_channels::{AuthState, LOGGED_OUT_STATUS, OpenedSession, Transport, TransportEvent},
    recibo_config::WhatsAppConfig,
    serde::Serialize,
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    branch::BranchId,
    credentials::CredentialStore,
    error::{Error, Result},
    guard::InitializationGuard,
    pairing::PairingCodeCache,
    registry::{ConnectionState, SessionEntry, SessionRegistry, SessionStatus},
    telemetry,
};

/// Status used when the event stream ends without a close event.
const CONNECTION_LOST_STATUS: u16 = 408;

/// Result of [`ConnectionSupervisor::ensure_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConnectOutcome {
    /// The branch must be paired. `code` is the scannable encoding of the
    /// current pairing code, absent when the session was logged out while
    /// waiting.
    PairingRequired { code: Option<String> },
    Connected { phone: String },
    /// Neither a pairing code nor an open connection within the wait window.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub pairing_timeout: Duration,
}

impl From<&WhatsAppConfig> for SupervisorSettings {
    fn from(cfg: &WhatsAppConfig) -> Self {
        Self {
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay: cfg.reconnect_base_delay(),
            pairing_timeout: cfg.pairing_timeout(),
        }
    }
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    pairing: Arc<PairingCodeCache>,
    registry: Arc<SessionRegistry>,
    guard: InitializationGuard<ConnectOutcome>,
    settings: SupervisorSettings,
    next_epoch: AtomicU64,
    /// Bumped by every explicit teardown. A first open that started under an
    /// older generation is discarded instead of installed.
    teardowns: DashMap<BranchId, u64>,
}

/// Reconnect delay for `attempt`: linear in the attempt number.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        pairing: Arc<PairingCodeCache>,
        registry: Arc<SessionRegistry>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            pairing,
            registry,
            guard: InitializationGuard::new(),
            settings,
            next_epoch: AtomicU64::new(0),
            teardowns: DashMap::new(),
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Whether the branch has a live session or one being initialized.
    pub fn is_active(&self, branch: &BranchId) -> bool {
        self.registry.contains(branch) || self.guard.in_flight(branch)
    }

    /// Make sure `branch` has a live session and report where it stands.
    ///
    /// Concurrent callers for the same branch share one attempt, and a branch
    /// that already has a session (in any state) never gets a second
    /// transport handle. Waits at most the pairing timeout.
    pub async fn ensure_connection(self: &Arc<Self>, branch: &BranchId) -> Result<ConnectOutcome> {
        if let Some(outcome) = self.settled_outcome(branch) {
            return Ok(outcome);
        }
        let this = Arc::clone(self);
        let key = branch.clone();
        self.guard
            .run(branch, move || async move { this.connect_attempt(key).await })
            .await
    }

    fn settled_outcome(&self, branch: &BranchId) -> Option<ConnectOutcome> {
        let status = self.registry.get(branch)?;
        match status.state {
            ConnectionState::Connected => Some(ConnectOutcome::Connected {
                phone: status.phone.unwrap_or_default(),
            }),
            ConnectionState::PairingPending => {
                self.pairing
                    .get(branch)
                    .map(|code| ConnectOutcome::PairingRequired {
                        code: Some(code.encoded),
                    })
            },
            _ => None,
        }
    }

    async fn connect_attempt(self: Arc<Self>, branch: BranchId) -> Result<ConnectOutcome> {
        let rx = match self.registry.subscribe(&branch) {
            Some(rx) => {
                debug!(branch = %branch, "attaching to existing session");
                rx
            },
            None => self.start_session(&branch).await?,
        };
        Ok(self.await_outcome(&branch, rx).await)
    }

    async fn start_session(
        self: &Arc<Self>,
        branch: &BranchId,
    ) -> Result<watch::Receiver<SessionStatus>> {
        let generation = self.teardowns.get(branch).map_or(0, |g| *g);
        let opened = self.open_transport(branch).await?;
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = SessionEntry::new(epoch, opened.handle);
        let rx = entry.status.subscribe();
        let cancel = entry.cancel.clone();

        // Installed while holding the generation slot: a concurrent
        // `disconnect` either finds the entry or makes us drop it.
        let installed = {
            let current = self.teardowns.entry(branch.clone()).or_insert(0);
            if *current == generation {
                Ok(self.registry.put(branch.clone(), entry))
            } else {
                Err(entry)
            }
        };
        let stale = match installed {
            Ok(stale) => stale,
            Err(entry) => {
                entry.handle.close().await;
                info!(branch = %branch, "torn down while opening, session discarded");
                return Err(Error::InitAborted(branch.clone()));
            },
        };
        if let Some(stale) = stale {
            warn!(branch = %branch, epoch = stale.epoch, "replacing stale session entry");
            stale.cancel.cancel();
            stale.handle.close().await;
        }
        info!(branch = %branch, epoch, "session started");
        telemetry::session_opened(branch.as_str());

        let this = Arc::clone(self);
        let branch = branch.clone();
        tokio::spawn(async move { this.supervise(branch, epoch, opened.events, cancel).await });
        Ok(rx)
    }

    async fn open_transport(&self, branch: &BranchId) -> Result<OpenedSession> {
        let auth = self.store.load(branch)?;
        self.transport
            .open_session(branch.as_str(), auth)
            .await
            .map_err(|e| Error::Open {
                branch: branch.clone(),
                message: format!("{e:#}"),
            })
    }

    async fn await_outcome(
        &self,
        branch: &BranchId,
        mut rx: watch::Receiver<SessionStatus>,
    ) -> ConnectOutcome {
        let waited = tokio::time::timeout(self.settings.pairing_timeout, async {
            rx.wait_for(|s| s.state.is_settled())
                .await
                .map(|s| s.clone())
        })
        .await;

        match waited {
            Ok(Ok(status)) => match status.state {
                ConnectionState::Connected => ConnectOutcome::Connected {
                    phone: status.phone.unwrap_or_default(),
                },
                ConnectionState::PairingPending => ConnectOutcome::PairingRequired {
                    code: self.pairing.get(branch).map(|c| c.encoded),
                },
                _ => ConnectOutcome::PairingRequired { code: None },
            },
            Ok(Err(_)) => {
                debug!(branch = %branch, "session dropped while waiting for it to settle");
                ConnectOutcome::TimedOut
            },
            Err(_) => {
                debug!(branch = %branch, "timed out waiting for pairing code or connection");
                ConnectOutcome::TimedOut
            },
        }
    }

    async fn supervise(
        self: Arc<Self>,
        branch: BranchId,
        epoch: u64,
        mut events: mpsc::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let status = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                status = self.pump(&branch, epoch, &mut events) => status,
            };

            if status == LOGGED_OUT_STATUS {
                self.logged_out(&branch, epoch).await;
                return;
            }

            warn!(branch = %branch, status, "connection closed");
            // Off the connected set before the dead handle is closed.
            self.registry.update(&branch, epoch, |s| {
                s.state = ConnectionState::Reconnecting;
            });
            if let Some(handle) = self.registry.handle(&branch, epoch) {
                handle.close().await;
            }
            match self.reconnect(&branch, epoch, &cancel).await {
                Some(next) => events = next,
                None => return,
            }
        }
    }

    /// Apply events until the connection closes; returns the close status.
    async fn pump(
        &self,
        branch: &BranchId,
        epoch: u64,
        events: &mut mpsc::Receiver<TransportEvent>,
    ) -> u16 {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::PairingCode(code) => self.on_pairing_code(branch, epoch, &code),
                TransportEvent::Opened { identity } => self.on_opened(branch, epoch, identity),
                TransportEvent::CredentialsUpdated(auth) => {
                    self.on_credentials(branch, epoch, &auth)
                },
                TransportEvent::Closed { status } => return status,
            }
        }
        debug!(branch = %branch, "event stream ended without a close event");
        CONNECTION_LOST_STATUS
    }

    fn owns(&self, branch: &BranchId, epoch: u64) -> bool {
        self.registry.update(branch, epoch, |_| ()).is_some()
    }

    fn on_pairing_code(&self, branch: &BranchId, epoch: u64, raw: &str) {
        if !self.owns(branch, epoch) {
            return;
        }
        // Cache first: waiters read the code as soon as the state flips.
        if let Err(e) = self.pairing.set(branch, raw) {
            warn!(branch = %branch, error = %e, "failed to encode pairing code");
        }
        self.registry.update(branch, epoch, |s| {
            s.state = ConnectionState::PairingPending;
        });
        info!(branch = %branch, "pairing code issued");
    }

    fn on_opened(&self, branch: &BranchId, epoch: u64, identity: String) {
        if !self.owns(branch, epoch) {
            return;
        }
        self.pairing.clear(branch);
        self.registry.update(branch, epoch, |s| {
            s.state = ConnectionState::Connected;
            s.phone = Some(identity.clone());
            s.reconnect_attempts = 0;
        });
        info!(branch = %branch, phone = %identity, "connected");
        telemetry::connected_sessions(self.registry.connected().len());
    }

    fn on_credentials(&self, branch: &BranchId, epoch: u64, auth: &AuthState) {
        if !self.owns(branch, epoch) {
            return;
        }
        if let Err(e) = self.store.persist(branch, auth) {
            warn!(branch = %branch, error = %e, "failed to persist rotated credentials");
        }
    }

    /// Run the backoff loop. Returns the next event stream, or `None` when
    /// the branch was torn down or gave up.
    async fn reconnect(
        &self,
        branch: &BranchId,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Option<mpsc::Receiver<TransportEvent>> {
        let max = self.settings.max_reconnect_attempts;
        loop {
            let next = self.registry.update(branch, epoch, |s| {
                (s.reconnect_attempts < max).then(|| {
                    s.reconnect_attempts += 1;
                    s.state = ConnectionState::Reconnecting;
                    s.reconnect_attempts
                })
            })?;
            let Some(attempt) = next else {
                self.give_up(branch, epoch).await;
                return None;
            };

            let delay = backoff_delay(self.settings.reconnect_base_delay, attempt);
            info!(
                branch = %branch,
                attempt,
                max,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );
            telemetry::reconnect_scheduled(branch.as_str());
            tokio::select! {
                biased;
                () = cancel.cancelled() => return None,
                () = tokio::time::sleep(delay) => {},
            }

            match self.open_transport(branch).await {
                Ok(opened) => {
                    if cancel.is_cancelled()
                        || !self
                            .registry
                            .replace_handle(branch, epoch, Arc::clone(&opened.handle))
                    {
                        opened.handle.close().await;
                        return None;
                    }
                    self.registry.update(branch, epoch, |s| {
                        s.state = ConnectionState::Connecting;
                    });
                    return Some(opened.events);
                },
                Err(e) => warn!(branch = %branch, attempt, error = %e, "reconnect failed"),
            }
        }
    }

    async fn give_up(&self, branch: &BranchId, epoch: u64) {
        if let Some(handle) = self.registry.handle(branch, epoch) {
            handle.close().await;
        }
        self.pairing.clear(branch);
        self.registry.remove_epoch(branch, epoch);
        warn!(
            branch = %branch,
            max = self.settings.max_reconnect_attempts,
            "reconnect attempts exhausted, session dropped"
        );
        telemetry::connected_sessions(self.registry.connected().len());
    }

    /// Terminal close: the registry entry disappears only after the handle
    /// is closed, the credentials are gone and the pairing code is cleared.
    async fn logged_out(&self, branch: &BranchId, epoch: u64) {
        let owned = self.registry.update(branch, epoch, |s| {
            s.state = ConnectionState::LoggedOut;
            s.phone = None;
            s.reconnect_attempts = 0;
        });
        if owned.is_none() {
            return;
        }
        if let Some(handle) = self.registry.handle(branch, epoch) {
            handle.close().await;
        }
        if let Err(e) = self.store.delete(branch) {
            warn!(branch = %branch, error = %e, "failed to delete credentials after logout");
        }
        self.pairing.clear(branch);
        self.registry.remove_epoch(branch, epoch);
        info!(branch = %branch, "logged out, credentials wiped");
        telemetry::logged_out(branch.as_str());
        telemetry::connected_sessions(self.registry.connected().len());
    }

    /// Forcibly close the branch's session, whatever its state. Pending
    /// reconnects are cancelled and a first open still in flight is
    /// discarded when it completes; credentials stay on disk.
    pub async fn disconnect(&self, branch: &BranchId) -> bool {
        *self.teardowns.entry(branch.clone()).or_insert(0) += 1;
        let opening = self.guard.in_flight(branch);
        let Some(entry) = self.registry.remove(branch) else {
            self.pairing.clear(branch);
            if opening {
                info!(branch = %branch, "aborting in-flight initialization");
            }
            return opening;
        };
        entry.cancel.cancel();
        entry.handle.close().await;
        self.pairing.clear(branch);
        info!(branch = %branch, epoch = entry.epoch, "disconnected");
        telemetry::connected_sessions(self.registry.connected().len());
        true
    }

    /// Disconnect and delete the branch's credentials.
    pub async fn delete_session(&self, branch: &BranchId) -> Result<bool> {
        let was_live = self.disconnect(branch).await;
        // An aborted first open must finish closing before its directory goes.
        self.guard.settled(branch).await;
        let had_credentials = self.store.delete(branch)?;
        if had_credentials {
            info!(branch = %branch, "session deleted");
        }
        Ok(was_live || had_credentials)
    }

    /// Disconnect every live branch, keeping credentials for the next start.
    pub async fn shutdown(&self) {
        for branch in self.registry.branches() {
            self.disconnect(&branch).await;
        }
    }
}
