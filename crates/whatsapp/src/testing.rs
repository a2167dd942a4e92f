//! Scripted in-memory transport for exercising the session manager.
//!
//! Every `open_session` call is published on a channel as a [`MockSession`];
//! tests drive the branch by pushing events into it.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Result, anyhow},
    async_trait::async_trait,
    recibo_channels::{
        AuthState, OpenedSession, OutboundPayload, SentMessage, Transport, TransportEvent,
        TransportHandle,
    },
    tokio::sync::mpsc,
};

/// A session opened through [`MockTransport`].
pub struct MockSession {
    pub branch: String,
    /// Auth state the session was opened with.
    pub auth: AuthState,
    pub handle: Arc<MockHandle>,
    events: mpsc::Sender<TransportEvent>,
}

impl MockSession {
    pub async fn emit(&self, event: TransportEvent) {
        // The supervisor may already have moved on; that is not an error here.
        let _ = self.events.send(event).await;
    }

    pub async fn pairing_code(&self, code: &str) {
        self.emit(TransportEvent::PairingCode(code.into())).await;
    }

    pub async fn opened(&self, identity: &str) {
        self.emit(TransportEvent::Opened {
            identity: identity.into(),
        })
        .await;
    }

    pub async fn closed(&self, status: u16) {
        self.emit(TransportEvent::Closed { status }).await;
    }

    pub async fn credentials(&self, auth: AuthState) {
        self.emit(TransportEvent::CredentialsUpdated(auth)).await;
    }
}

/// Handle that records sends instead of delivering them.
#[derive(Default)]
pub struct MockHandle {
    sent: Mutex<Vec<(String, OutboundPayload)>>,
    closed: AtomicBool,
    reject_sends: AtomicBool,
    next_id: AtomicU64,
    close_delay: Mutex<Duration>,
}

impl MockHandle {
    pub fn sent(&self) -> Vec<(String, OutboundPayload)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    /// Make `close` take this long before the handle reports closed.
    pub fn set_close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<SentMessage> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("recipient {to} not on the network"));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((to.to_string(), payload));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SentMessage {
            id: format!("3EB0MOCK{n:04}"),
        })
    }

    async fn close(&self) {
        let delay = *self.close_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Transport whose sessions are driven by the test.
pub struct MockTransport {
    sessions: mpsc::UnboundedSender<MockSession>,
    opens: AtomicUsize,
    failures: Mutex<VecDeque<String>>,
    open_delay: Mutex<Duration>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            sessions: tx,
            opens: AtomicUsize::new(0),
            failures: Mutex::new(VecDeque::new()),
            open_delay: Mutex::new(Duration::ZERO),
        });
        (transport, rx)
    }

    /// Number of `open_session` calls, failed ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make the next `open_session` call fail with `message`.
    pub fn fail_next_open(&self, message: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message.to_string());
    }

    /// Delay every `open_session` call, widening race windows.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open_session(&self, branch: &str, auth: AuthState) -> Result<OpenedSession> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(message) = failure {
            return Err(anyhow!(message));
        }

        let (events_tx, events_rx) = mpsc::channel(32);
        let handle = Arc::new(MockHandle::default());
        self.sessions
            .send(MockSession {
                branch: branch.to_string(),
                auth,
                handle: Arc::clone(&handle),
                events: events_tx,
            })
            .map_err(|_| anyhow!("mock session receiver dropped"))?;

        Ok(OpenedSession {
            handle,
            events: events_rx,
        })
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
