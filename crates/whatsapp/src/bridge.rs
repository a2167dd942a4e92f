//! Websocket transport: one connection per branch to an external messaging
//! bridge, speaking tagged JSON frames.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    anyhow::{Context, Result, anyhow, bail},
    async_trait::async_trait,
    base64::{Engine, engine::general_purpose::STANDARD},
    futures::{SinkExt, StreamExt},
    recibo_channels::{
        AuthState, OpenedSession, OutboundPayload, SentMessage, Transport, TransportEvent,
        TransportHandle,
    },
    serde::{Deserialize, Serialize},
    tokio::{
        sync::{Mutex, mpsc, oneshot},
        task::JoinHandle,
    },
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, trace, warn},
};

const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 64;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<String, String>>>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFrame {
    pub file_name: String,
    pub mimetype: String,
    /// Base64 file contents.
    pub data: String,
}

/// Frames sent to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Open {
        branch: String,
        auth: BTreeMap<String, String>,
    },
    Send {
        request_id: u64,
        to: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document: Option<DocumentFrame>,
    },
    Close,
}

/// Frames received from the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeFrame {
    Qr { code: String },
    Open { identity: String },
    Close { status: u16 },
    Creds { auth: BTreeMap<String, String> },
    Sent { request_id: u64, id: String },
    SendFailed { request_id: u64, error: String },
}

fn encode_auth(auth: &AuthState) -> BTreeMap<String, String> {
    auth.files
        .iter()
        .map(|(name, bytes)| (name.clone(), STANDARD.encode(bytes)))
        .collect()
}

fn decode_auth(files: BTreeMap<String, String>) -> Result<AuthState> {
    let files = files
        .into_iter()
        .map(|(name, data)| {
            let bytes = STANDARD
                .decode(data.as_bytes())
                .with_context(|| format!("invalid base64 in credential file {name}"))?;
            Ok((name, bytes))
        })
        .collect::<Result<_>>()?;
    Ok(AuthState { files })
}

/// [`Transport`] backed by a websocket bridge at `url`.
pub struct WsBridgeTransport {
    url: String,
    ack_timeout: Duration,
}

impl WsBridgeTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ack_timeout: SEND_ACK_TIMEOUT,
        }
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for WsBridgeTransport {
    async fn open_session(&self, branch: &str, auth: AuthState) -> Result<OpenedSession> {
        let (ws, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("failed to connect to bridge at {}", self.url))?;
        let (mut sink, mut stream) = ws.split();
        debug!(branch, url = %self.url, "bridge connected");

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "bridge write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let handle = Arc::new(BridgeHandle {
            outgoing,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            ack_timeout: self.ack_timeout,
            reader: Mutex::new(None),
        });
        handle.push(&ClientFrame::Open {
            branch: branch.to_string(),
            auth: encode_auth(&auth),
        })?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending = Arc::clone(&handle.pending);
        let branch_name = branch.to_string();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        debug!(branch = %branch_name, ?frame, "bridge closed the socket");
                        break;
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(branch = %branch_name, error = %e, "bridge read failed");
                        break;
                    },
                };
                trace!(branch = %branch_name, raw = %text.as_str(), "bridge -> client");

                let frame = match serde_json::from_str::<BridgeFrame>(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(branch = %branch_name, error = %e, "ignoring malformed bridge frame");
                        continue;
                    },
                };
                let event = match frame {
                    BridgeFrame::Qr { code } => TransportEvent::PairingCode(code),
                    BridgeFrame::Open { identity } => TransportEvent::Opened { identity },
                    BridgeFrame::Close { status } => {
                        let _ = events_tx.send(TransportEvent::Closed { status }).await;
                        break;
                    },
                    BridgeFrame::Creds { auth } => match decode_auth(auth) {
                        Ok(auth) => TransportEvent::CredentialsUpdated(auth),
                        Err(e) => {
                            warn!(branch = %branch_name, error = %e, "ignoring credential update");
                            continue;
                        },
                    },
                    BridgeFrame::Sent { request_id, id } => {
                        resolve(&pending, request_id, Ok(id)).await;
                        continue;
                    },
                    BridgeFrame::SendFailed { request_id, error } => {
                        resolve(&pending, request_id, Err(error)).await;
                        continue;
                    },
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            // Outstanding sends fail once their senders are dropped.
            pending.lock().await.clear();
        });
        *handle.reader.lock().await = Some(reader);

        Ok(OpenedSession {
            handle,
            events: events_rx,
        })
    }
}

async fn resolve(pending: &Pending, request_id: u64, ack: Result<String, String>) {
    match pending.lock().await.remove(&request_id) {
        Some(tx) => {
            let _ = tx.send(ack);
        },
        None => warn!(request_id, "ack for unknown send request"),
    }
}

struct BridgeHandle {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    ack_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeHandle {
    fn push(&self, frame: &ClientFrame) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        self.outgoing
            .send(Message::Text(json.into()))
            .map_err(|_| anyhow!("bridge connection closed"))
    }
}

#[async_trait]
impl TransportHandle for BridgeHandle {
    async fn send(&self, to: &str, payload: OutboundPayload) -> Result<SentMessage> {
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (text, document) = match payload {
            OutboundPayload::Text(text) => (text, None),
            OutboundPayload::Document { caption, document } => (
                caption,
                Some(DocumentFrame {
                    data: STANDARD.encode(&document.bytes),
                    file_name: document.file_name,
                    mimetype: document.mimetype,
                }),
            ),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        let pushed = self.push(&ClientFrame::Send {
            request_id,
            to: to.to_string(),
            text,
            document,
        });
        if let Err(e) = pushed {
            self.pending.lock().await.remove(&request_id);
            return Err(e);
        }
        trace!(request_id, to, "client -> bridge send");

        let ack = match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(ack) => ack.context("bridge connection dropped before ack")?,
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                bail!("bridge did not acknowledge send within {:?}", self.ack_timeout);
            },
        };
        let id = ack.map_err(|e| anyhow!("bridge rejected send: {e}"))?;
        Ok(SentMessage { id })
    }

    async fn close(&self) {
        let _ = self.push(&ClientFrame::Close);
        let _ = self.outgoing.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        self.pending.lock().await.clear();
    }
}
