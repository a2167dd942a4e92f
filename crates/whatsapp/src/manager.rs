//! The session manager: one object per process, built at bootstrap and handed
//! to whoever needs to pair branches, query them or send through them.

use std::{collections::BTreeMap, sync::Arc};

use {
    anyhow::Result as AnyResult,
    async_trait::async_trait,
    recibo_channels::{
        ChannelHealthSnapshot, ChannelOutbound, ChannelStatus, OutboundDocument, Transport,
    },
    recibo_config::{SendRouting, WhatsAppConfig},
    serde::Serialize,
    tracing::{info, warn},
};

use crate::{
    branch::BranchId,
    credentials::CredentialStore,
    dispatch::{MessageDispatcher, SendRoute},
    error::Result,
    pairing::PairingCodeCache,
    recovery,
    registry::{ConnectionState, SessionRegistry},
    supervisor::{ConnectOutcome, ConnectionSupervisor, SupervisorSettings},
};

/// Answer to a pairing-code request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCodeResponse {
    pub requires_pairing: bool,
    pub code: Option<String>,
    /// Set when no code materialized within the wait window.
    pub timeout: bool,
    pub issued_at: Option<u64>,
}

impl PairingCodeResponse {
    fn already_connected() -> Self {
        Self {
            requires_pairing: false,
            code: None,
            timeout: false,
            issued_at: None,
        }
    }
}

/// Best-effort snapshot of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchStatus {
    pub branch: BranchId,
    pub state: ConnectionState,
    pub connected: bool,
    pub phone: Option<String>,
    pub reconnect_attempts: u32,
    pub has_pairing_code: bool,
    pub has_credentials: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub branch: BranchId,
    pub state: ConnectionState,
    pub phone: Option<String>,
    pub persisted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub connected: usize,
    pub pairing_pending: usize,
    pub reconnecting: usize,
    pub persisted: usize,
}

/// Attachment whose mimetype the dispatcher derives from `file_name`.
fn document(bytes: Vec<u8>, file_name: &str) -> OutboundDocument {
    OutboundDocument {
        bytes,
        file_name: file_name.to_string(),
        mimetype: String::new(),
    }
}

pub struct SessionManager {
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: MessageDispatcher,
    store: CredentialStore,
    pairing: Arc<PairingCodeCache>,
    registry: Arc<SessionRegistry>,
}

impl SessionManager {
    pub fn new(config: &WhatsAppConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::from_parts(
            CredentialStore::new(config.sessions_root()),
            SupervisorSettings::from(config),
            config.routing,
            transport,
        )
    }

    pub fn from_parts(
        store: CredentialStore,
        settings: SupervisorSettings,
        routing: SendRouting,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let pairing = Arc::new(PairingCodeCache::new());
        let registry = Arc::new(SessionRegistry::new());
        let supervisor = ConnectionSupervisor::new(
            transport,
            store.clone(),
            Arc::clone(&pairing),
            Arc::clone(&registry),
            settings,
        );
        info!(
            root = %store.root().display(),
            max_reconnect_attempts = supervisor.settings().max_reconnect_attempts,
            ?routing,
            "session manager ready"
        );
        Arc::new(Self {
            supervisor,
            dispatcher: MessageDispatcher::new(Arc::clone(&registry), routing),
            store,
            pairing,
            registry,
        })
    }

    pub async fn ensure_connection(&self, branch: &BranchId) -> Result<ConnectOutcome> {
        self.supervisor.ensure_connection(branch).await
    }

    pub async fn get_pairing_code(&self, branch: &BranchId) -> Result<PairingCodeResponse> {
        if self.is_connected(branch) {
            return Ok(PairingCodeResponse::already_connected());
        }
        if let Some(code) = self.pairing.get(branch) {
            return Ok(PairingCodeResponse {
                requires_pairing: true,
                code: Some(code.encoded),
                timeout: false,
                issued_at: Some(code.issued_at),
            });
        }

        Ok(match self.ensure_connection(branch).await? {
            ConnectOutcome::Connected { .. } => PairingCodeResponse::already_connected(),
            ConnectOutcome::PairingRequired { code } => PairingCodeResponse {
                requires_pairing: true,
                issued_at: code
                    .as_ref()
                    .and_then(|_| self.pairing.get(branch))
                    .map(|c| c.issued_at),
                code,
                timeout: false,
            },
            ConnectOutcome::TimedOut => PairingCodeResponse {
                requires_pairing: true,
                code: None,
                timeout: true,
                issued_at: None,
            },
        })
    }

    fn is_connected(&self, branch: &BranchId) -> bool {
        self.registry
            .get(branch)
            .is_some_and(|s| s.state == ConnectionState::Connected)
    }

    pub fn get_status(&self, branch: &BranchId) -> BranchStatus {
        let live = self.registry.get(branch);
        let state = live
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.state);
        BranchStatus {
            branch: branch.clone(),
            state,
            connected: state == ConnectionState::Connected,
            phone: live.as_ref().and_then(|s| s.phone.clone()),
            reconnect_attempts: live.map_or(0, |s| s.reconnect_attempts),
            has_pairing_code: self.pairing.contains(branch),
            has_credentials: self.store.has_credentials(branch),
        }
    }

    /// Send through the connection chosen by the configured routing policy.
    pub async fn send_text(&self, destination: &str, body: &str) -> Result<String> {
        let route = self.dispatcher.default_route()?;
        self.dispatcher.send_text(&route, destination, body).await
    }

    /// Send through `branch`'s own connection.
    pub async fn send_text_as(
        &self,
        branch: &BranchId,
        destination: &str,
        body: &str,
    ) -> Result<String> {
        self.dispatcher
            .send_text(&SendRoute::Branch(branch.clone()), destination, body)
            .await
    }

    pub async fn send_document(
        &self,
        destination: &str,
        body: &str,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<String> {
        let route = self.dispatcher.default_route()?;
        self.dispatcher
            .send_document(&route, destination, body, document(bytes, file_name))
            .await
    }

    pub async fn send_document_as(
        &self,
        branch: &BranchId,
        destination: &str,
        body: &str,
        bytes: Vec<u8>,
        file_name: &str,
    ) -> Result<String> {
        self.dispatcher
            .send_document(
                &SendRoute::Branch(branch.clone()),
                destination,
                body,
                document(bytes, file_name),
            )
            .await
    }

    pub async fn disconnect(&self, branch: &BranchId) -> bool {
        self.supervisor.disconnect(branch).await
    }

    pub async fn delete_session(&self, branch: &BranchId) -> Result<bool> {
        self.supervisor.delete_session(branch).await
    }

    /// Live sessions and persisted-only ones, sorted by branch.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut sessions: BTreeMap<BranchId, SessionSummary> = BTreeMap::new();
        for branch in self.store.list()? {
            sessions.insert(branch.clone(), SessionSummary {
                branch,
                state: ConnectionState::Disconnected,
                phone: None,
                persisted: true,
            });
        }
        for (branch, status) in self.registry.list() {
            let persisted = sessions.contains_key(&branch);
            sessions.insert(branch.clone(), SessionSummary {
                branch,
                state: status.state,
                phone: status.phone,
                persisted,
            });
        }
        Ok(sessions.into_values().collect())
    }

    /// Delete persisted session directories that hold no credentials and
    /// belong to no live or initializing session.
    pub fn clean_invalid_sessions(&self) -> Result<Vec<BranchId>> {
        let mut removed = Vec::new();
        for branch in self.store.list()? {
            if self.supervisor.is_active(&branch) || self.store.has_credentials(&branch) {
                continue;
            }
            match self.store.delete(&branch) {
                Ok(_) => removed.push(branch),
                Err(e) => warn!(branch = %branch, error = %e, "failed to remove invalid session"),
            }
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "removed invalid sessions");
        }
        Ok(removed)
    }

    pub fn get_stats(&self) -> Result<SessionStats> {
        let mut stats = SessionStats {
            persisted: self.store.list()?.len(),
            ..Default::default()
        };
        for (_, status) in self.registry.list() {
            stats.total += 1;
            match status.state {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::PairingPending => stats.pairing_pending += 1,
                ConnectionState::Reconnecting => stats.reconnecting += 1,
                _ => {},
            }
        }
        Ok(stats)
    }

    /// Bring back every branch with persisted credentials without waiting.
    pub fn recover_all(&self) -> Vec<BranchId> {
        recovery::recover_all(&self.supervisor, &self.store)
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

#[async_trait]
impl ChannelOutbound for SessionManager {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> AnyResult<String> {
        let branch = BranchId::new(account_id)?;
        Ok(self.send_text_as(&branch, to, text).await?)
    }

    async fn send_document(
        &self,
        account_id: &str,
        to: &str,
        caption: &str,
        document: OutboundDocument,
    ) -> AnyResult<String> {
        let branch = BranchId::new(account_id)?;
        Ok(self
            .dispatcher
            .send_document(&SendRoute::Branch(branch), to, caption, document)
            .await?)
    }
}

#[async_trait]
impl ChannelStatus for SessionManager {
    async fn probe(&self, account_id: &str) -> AnyResult<ChannelHealthSnapshot> {
        let status = self.get_status(&BranchId::new(account_id)?);
        let details = match (&status.phone, status.state) {
            (Some(phone), state) => format!("{state:?} as {phone}"),
            (None, state) => format!("{state:?}"),
        };
        Ok(ChannelHealthSnapshot {
            connected: status.connected,
            account_id: account_id.to_string(),
            details: Some(details),
        })
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            error::Error,
            testing::{MockSession, MockTransport, eventually},
        },
        recibo_channels::{AuthState, LOGGED_OUT_STATUS},
        std::time::Duration,
        tokio::sync::mpsc::UnboundedReceiver,
    };

    struct Fixture {
        manager: Arc<SessionManager>,
        transport: Arc<MockTransport>,
        sessions: UnboundedReceiver<MockSession>,
        dir: tempfile::TempDir,
    }

    fn fixture(max_reconnect_attempts: u32, pairing_timeout: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let (transport, sessions) = MockTransport::new();
        let manager = SessionManager::from_parts(
            CredentialStore::new(dir.path().to_path_buf()),
            SupervisorSettings {
                max_reconnect_attempts,
                reconnect_base_delay: Duration::from_millis(2),
                pairing_timeout,
            },
            SendRouting::AnyConnected,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        Fixture {
            manager,
            transport,
            sessions,
            dir,
        }
    }

    fn branch(id: &str) -> BranchId {
        BranchId::new(id).unwrap()
    }

    impl Fixture {
        async fn open(
            &mut self,
            id: &str,
        ) -> (MockSession, tokio::task::JoinHandle<Result<ConnectOutcome>>) {
            let manager = Arc::clone(&self.manager);
            let b = branch(id);
            let call = tokio::spawn(async move { manager.ensure_connection(&b).await });
            (self.sessions.recv().await.unwrap(), call)
        }

        async fn connect(&mut self, id: &str, phone: &str) -> MockSession {
            let (session, call) = self.open(id).await;
            session.opened(phone).await;
            assert!(matches!(
                call.await.unwrap().unwrap(),
                ConnectOutcome::Connected { .. }
            ));
            session
        }
    }

    #[tokio::test]
    async fn scenario_pairing_code_for_new_branch() {
        let mut f = fixture(5, Duration::from_secs(5));
        let (session, call) = f.open("5").await;
        assert!(session.auth.is_empty());

        session.pairing_code("ABC123").await;
        call.await.unwrap().unwrap();

        let pairing = f.manager.get_pairing_code(&branch("5")).await.unwrap();
        assert!(pairing.requires_pairing);
        assert!(!pairing.timeout);
        assert!(
            pairing
                .code
                .as_deref()
                .is_some_and(|c| c.starts_with("data:image/svg+xml;base64,"))
        );
        assert!(pairing.issued_at.is_some());

        let status = f.manager.get_status(&branch("5"));
        assert!(!status.connected);
        assert_eq!(status.state, ConnectionState::PairingPending);
        assert!(status.has_pairing_code);
    }

    #[tokio::test]
    async fn scenario_send_text_after_connect() {
        let mut f = fixture(5, Duration::from_secs(5));
        let session = f.connect("5", "51999999999").await;

        let id = f.manager.send_text("51888888888", "hola").await.unwrap();
        assert!(!id.is_empty());

        let sent = session.handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "51888888888@s.whatsapp.net");

        let status = f.manager.get_status(&branch("5"));
        assert!(status.connected);
        assert_eq!(status.phone.as_deref(), Some("51999999999"));
    }

    #[tokio::test]
    async fn scenario_retry_exhaustion_drops_session() {
        let mut f = fixture(5, Duration::from_millis(50));
        let (first, _call) = f.open("7").await;
        first.closed(500).await;
        for _ in 0..5 {
            f.sessions.recv().await.unwrap().closed(500).await;
        }

        let manager = Arc::clone(&f.manager);
        assert!(eventually(|| manager.registry.get(&branch("7")).is_none()).await);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), f.sessions.recv())
                .await
                .is_err()
        );
        assert_eq!(f.manager.get_status(&branch("7")).state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn scenario_logout_removes_credentials_directory() {
        let mut f = fixture(5, Duration::from_secs(5));
        let session = f.connect("9", "51999999999").await;
        session
            .credentials(AuthState {
                files: [("creds.json".to_string(), b"{\"registered\":true}".to_vec())].into(),
            })
            .await;
        let dir = f.dir.path().join("session_9");
        assert!(eventually(|| dir.join("creds.json").exists()).await);

        session.closed(LOGGED_OUT_STATUS).await;
        assert!(eventually(|| !dir.exists()).await);
        let manager = Arc::clone(&f.manager);
        assert!(eventually(|| manager.registry.get(&branch("9")).is_none()).await);
    }

    #[tokio::test]
    async fn persisted_credentials_are_handed_to_the_transport() {
        let mut f = fixture(5, Duration::from_secs(5));
        let store = CredentialStore::new(f.dir.path().to_path_buf());
        let auth = AuthState {
            files: [("creds.json".to_string(), b"{}".to_vec())].into(),
        };
        store.persist(&branch("4"), &auth).unwrap();

        let (session, _call) = f.open("4").await;
        assert_eq!(session.auth, auth);
    }

    #[tokio::test]
    async fn pairing_code_when_connected_is_not_required() {
        let mut f = fixture(5, Duration::from_secs(5));
        let _session = f.connect("5", "51999999999").await;

        let pairing = f.manager.get_pairing_code(&branch("5")).await.unwrap();
        assert_eq!(pairing, PairingCodeResponse::already_connected());
    }

    #[tokio::test]
    async fn pairing_code_times_out() {
        let f = fixture(5, Duration::from_millis(30));
        let manager = Arc::clone(&f.manager);
        let pairing = manager.get_pairing_code(&branch("5")).await.unwrap();
        assert!(pairing.timeout);
        assert!(pairing.code.is_none());
        assert_eq!(f.transport.opens(), 1);
    }

    #[tokio::test]
    async fn pairing_code_propagates_initialization_failure() {
        let f = fixture(5, Duration::from_secs(5));
        f.transport.fail_next_open("bridge unreachable");
        let err = f.manager.get_pairing_code(&branch("5")).await.unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
    }

    #[tokio::test]
    async fn branch_scoped_send_refuses_other_branches() {
        let mut f = fixture(5, Duration::from_secs(5));
        let _one = f.connect("1", "51911111111").await;

        let err = f
            .manager
            .send_text_as(&branch("2"), "51888888888", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BranchNotConnected(_)));
    }

    #[tokio::test]
    async fn delete_session_disconnects_and_wipes() {
        let mut f = fixture(5, Duration::from_secs(5));
        let session = f.connect("5", "51999999999").await;

        assert!(f.manager.delete_session(&branch("5")).await.unwrap());
        assert!(session.handle.is_closed());
        assert!(!f.dir.path().join("session_5").exists());
        assert!(!f.manager.get_status(&branch("5")).has_credentials);
        assert!(!f.manager.delete_session(&branch("5")).await.unwrap());
    }

    #[tokio::test]
    async fn list_clean_and_stats() {
        let mut f = fixture(5, Duration::from_secs(5));
        let store = CredentialStore::new(f.dir.path().to_path_buf());
        store
            .persist(&branch("3"), &AuthState {
                files: [("creds.json".to_string(), b"{}".to_vec())].into(),
            })
            .unwrap();
        store.load(&branch("8")).unwrap(); // empty: invalid

        let _live = f.connect("5", "51999999999").await;
        let (pending, _call) = f.open("6").await;
        pending.pairing_code("QR").await;
        let manager = Arc::clone(&f.manager);
        assert!(eventually(|| manager.get_status(&branch("6")).has_pairing_code).await);

        let listed: Vec<_> = f
            .manager
            .list_sessions()
            .unwrap()
            .into_iter()
            .map(|s| (s.branch.to_string(), s.state))
            .collect();
        assert_eq!(listed, vec![
            ("3".to_string(), ConnectionState::Disconnected),
            ("5".to_string(), ConnectionState::Connected),
            ("6".to_string(), ConnectionState::PairingPending),
            ("8".to_string(), ConnectionState::Disconnected),
        ]);

        // Live branches 5 and 6 have empty directories too but must survive.
        assert_eq!(f.manager.clean_invalid_sessions().unwrap(), vec![branch("8")]);

        assert_eq!(f.manager.get_stats().unwrap(), SessionStats {
            total: 2,
            connected: 1,
            pairing_pending: 1,
            reconnecting: 0,
            persisted: 3,
        });
    }

    #[tokio::test]
    async fn recover_all_reconnects_persisted_branches() {
        let mut f = fixture(5, Duration::from_secs(5));
        let store = CredentialStore::new(f.dir.path().to_path_buf());
        store
            .persist(&branch("2"), &AuthState {
                files: [("creds.json".to_string(), b"{}".to_vec())].into(),
            })
            .unwrap();

        assert_eq!(f.manager.recover_all(), vec![branch("2")]);
        let session = f.sessions.recv().await.unwrap();
        assert_eq!(session.branch, "2");
        assert!(!session.auth.is_empty());
    }

    #[tokio::test]
    async fn shutdown_keeps_credentials() {
        let mut f = fixture(5, Duration::from_secs(5));
        let one = f.connect("1", "51911111111").await;
        let two = f.connect("2", "51922222222").await;

        f.manager.shutdown().await;
        assert!(one.handle.is_closed() && two.handle.is_closed());
        assert_eq!(f.manager.get_stats().unwrap().total, 0);
        assert!(f.dir.path().join("session_1").exists());
    }

    #[tokio::test]
    async fn channel_traits_route_by_account() {
        let mut f = fixture(5, Duration::from_secs(5));
        let _one = f.connect("1", "51911111111").await;
        let two = f.connect("2", "51922222222").await;

        let outbound: &dyn ChannelOutbound = f.manager.as_ref();
        outbound
            .send_document("2", "51888888888", "Boleta B001-7", OutboundDocument {
                bytes: b"%PDF".to_vec(),
                file_name: "B001-7.pdf".into(),
                mimetype: "application/pdf".into(),
            })
            .await
            .unwrap();
        assert_eq!(two.handle.sent().len(), 1);

        // Extensionless receipt names keep the mimetype the caller supplied.
        outbound
            .send_document("2", "51888888888", "Boleta B001-7", OutboundDocument {
                bytes: b"%PDF".to_vec(),
                file_name: "B001-7".into(),
                mimetype: "application/pdf".into(),
            })
            .await
            .unwrap();
        match two.handle.sent().remove(1).1 {
            recibo_channels::OutboundPayload::Document { document, .. } => {
                assert_eq!(document.mimetype, "application/pdf");
            },
            other => panic!("unexpected payload {other:?}"),
        }

        let health = ChannelStatus::probe(f.manager.as_ref(), "2").await.unwrap();
        assert!(health.connected);
        assert_eq!(health.details.as_deref(), Some("Connected as 51922222222"));
        assert!(ChannelStatus::probe(f.manager.as_ref(), "../x").await.is_err());
    }
}
