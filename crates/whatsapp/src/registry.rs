use std::sync::Arc;

use {
    dashmap::DashMap,
    recibo_channels::TransportHandle,
    serde::Serialize,
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
};

use crate::branch::BranchId;

/// Connection state of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    PairingPending,
    Connected,
    Reconnecting,
    LoggedOut,
}

impl ConnectionState {
    /// States where `ensure_connection` has an answer for its caller.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::PairingPending | Self::Connected | Self::LoggedOut)
    }
}

/// Point-in-time view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub phone: Option<String>,
    pub reconnect_attempts: u32,
}

impl SessionStatus {
    pub(crate) fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            phone: None,
            reconnect_attempts: 0,
        }
    }
}

/// A live session: its transport handle plus the supervisor's bookkeeping.
pub struct SessionEntry {
    /// Identifies the supervisor task that owns this entry.
    pub epoch: u64,
    pub handle: Arc<dyn TransportHandle>,
    pub status: Arc<watch::Sender<SessionStatus>>,
    /// Cancels the supervisor task (pending reconnect timers included).
    pub cancel: CancellationToken,
}

impl SessionEntry {
    pub fn new(epoch: u64, handle: Arc<dyn TransportHandle>) -> Self {
        let (status, _) = watch::channel(SessionStatus::connecting());
        Self {
            epoch,
            handle,
            status: Arc::new(status),
            cancel: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self) -> SessionStatus {
        self.status.borrow().clone()
    }
}

/// Process-wide map of branch → live session. Never persisted.
///
/// Guards from the underlying map are never held across an await.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<BranchId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, branch: &BranchId) -> Option<SessionStatus> {
        self.sessions.get(branch).map(|e| e.snapshot())
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.sessions.contains_key(branch)
    }

    pub fn put(&self, branch: BranchId, entry: SessionEntry) -> Option<SessionEntry> {
        self.sessions.insert(branch, entry)
    }

    pub fn remove(&self, branch: &BranchId) -> Option<SessionEntry> {
        self.sessions.remove(branch).map(|(_, e)| e)
    }

    /// Remove the entry only if it still belongs to `epoch`.
    pub fn remove_epoch(&self, branch: &BranchId, epoch: u64) -> Option<SessionEntry> {
        self.sessions
            .remove_if(branch, |_, e| e.epoch == epoch)
            .map(|(_, e)| e)
    }

    /// Apply `f` to the entry's status and notify watchers. `None` when the
    /// branch has no entry or the entry belongs to another epoch.
    pub fn update<R>(
        &self,
        branch: &BranchId,
        epoch: u64,
        f: impl FnOnce(&mut SessionStatus) -> R,
    ) -> Option<R> {
        let entry = self.sessions.get(branch).filter(|e| e.epoch == epoch)?;
        let mut out = None;
        entry.status.send_modify(|s| out = Some(f(s)));
        out
    }

    /// Swap in the handle of a reopened connection.
    pub fn replace_handle(
        &self,
        branch: &BranchId,
        epoch: u64,
        handle: Arc<dyn TransportHandle>,
    ) -> bool {
        match self.sessions.get_mut(branch) {
            Some(mut e) if e.epoch == epoch => {
                e.handle = handle;
                true
            },
            _ => false,
        }
    }

    /// Current handle of the entry owned by `epoch`, whatever its state.
    pub fn handle(&self, branch: &BranchId, epoch: u64) -> Option<Arc<dyn TransportHandle>> {
        self.sessions
            .get(branch)
            .filter(|e| e.epoch == epoch)
            .map(|e| Arc::clone(&e.handle))
    }

    pub fn subscribe(&self, branch: &BranchId) -> Option<watch::Receiver<SessionStatus>> {
        self.sessions.get(branch).map(|e| e.status.subscribe())
    }

    /// Handles of every connected branch, sorted by branch id.
    pub fn connected(&self) -> Vec<(BranchId, Arc<dyn TransportHandle>)> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .filter(|e| e.status.borrow().state == ConnectionState::Connected)
            .map(|e| (e.key().clone(), Arc::clone(&e.handle)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Handle of `branch` if it is connected.
    pub fn connected_handle(&self, branch: &BranchId) -> Option<Arc<dyn TransportHandle>> {
        self.sessions
            .get(branch)
            .filter(|e| e.status.borrow().state == ConnectionState::Connected)
            .map(|e| Arc::clone(&e.handle))
    }

    /// Every entry with its status, sorted by branch id.
    pub fn list(&self) -> Vec<(BranchId, SessionStatus)> {
        let mut out: Vec<_> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.snapshot()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn branches(&self) -> Vec<BranchId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
