use std::{path::Path, sync::Arc};

use {
    recibo_channels::{OutboundDocument, OutboundPayload, TransportHandle},
    recibo_config::SendRouting,
    tracing::{debug, info, warn},
};

use crate::{
    branch::BranchId,
    error::{Error, Result},
    registry::SessionRegistry,
    telemetry,
};

const USER_SERVER: &str = "s.whatsapp.net";

/// Which connection an outbound message goes through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendRoute {
    /// Any connected branch, lowest branch id first.
    AnyConnected,
    /// Only this branch's connection.
    Branch(BranchId),
}

/// Turn a phone number (any punctuation) into a user address; addresses
/// that already carry a server part pass through untouched.
pub fn normalize_destination(destination: &str) -> Result<String> {
    let trimmed = destination.trim();
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(Error::InvalidDestination(destination.to_string()));
    }
    Ok(format!("{digits}@{USER_SERVER}"))
}

/// Mimetype for the receipt formats we deliver.
pub fn mimetype_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("xml") => "application/xml",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Submits outbound messages through live connections from the registry.
pub struct MessageDispatcher {
    registry: Arc<SessionRegistry>,
    routing: SendRouting,
}

impl MessageDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, routing: SendRouting) -> Self {
        Self { registry, routing }
    }

    /// Route used by unscoped sends under the configured policy.
    pub fn default_route(&self) -> Result<SendRoute> {
        match self.routing {
            SendRouting::AnyConnected => Ok(SendRoute::AnyConnected),
            SendRouting::BranchOnly => Err(Error::UnscopedSendDisabled),
        }
    }

    pub async fn send_text(&self, route: &SendRoute, destination: &str, body: &str) -> Result<String> {
        self.submit(route, destination, OutboundPayload::Text(body.to_string()))
            .await
    }

    /// An empty `document.mimetype` is derived from the file extension;
    /// anything else is sent as given.
    pub async fn send_document(
        &self,
        route: &SendRoute,
        destination: &str,
        caption: &str,
        mut document: OutboundDocument,
    ) -> Result<String> {
        if document.mimetype.trim().is_empty() {
            document.mimetype = mimetype_for(&document.file_name).to_string();
        }
        self.submit(route, destination, OutboundPayload::Document {
            caption: caption.to_string(),
            document,
        })
        .await
    }

    fn select(&self, route: &SendRoute) -> Result<(BranchId, Arc<dyn TransportHandle>)> {
        match route {
            SendRoute::AnyConnected => self
                .registry
                .connected()
                .into_iter()
                .next()
                .ok_or(Error::NoActiveConnection),
            SendRoute::Branch(branch) => self
                .registry
                .connected_handle(branch)
                .map(|h| (branch.clone(), h))
                .ok_or_else(|| Error::BranchNotConnected(branch.clone())),
        }
    }

    async fn submit(
        &self,
        route: &SendRoute,
        destination: &str,
        payload: OutboundPayload,
    ) -> Result<String> {
        let to = normalize_destination(destination)?;
        let (branch, handle) = self.select(route)?;
        let kind = match payload {
            OutboundPayload::Text(_) => "text",
            OutboundPayload::Document { .. } => "document",
        };
        debug!(branch = %branch, to = %to, kind, "submitting message");

        match handle.send(&to, payload).await {
            Ok(sent) => {
                info!(branch = %branch, to = %to, id = %sent.id, kind, "message sent");
                telemetry::message_sent(branch.as_str(), kind);
                Ok(sent.id)
            },
            Err(e) => {
                warn!(branch = %branch, to = %to, error = %e, "send failed");
                Err(Error::Send {
                    branch,
                    message: format!("{e:#}"),
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            registry::{ConnectionState, SessionEntry},
            testing::MockHandle,
        },
    };

    fn branch(id: &str) -> BranchId {
        BranchId::new(id).unwrap()
    }

    fn connect(registry: &SessionRegistry, id: &str, epoch: u64) -> Arc<MockHandle> {
        let handle = Arc::new(MockHandle::default());
        registry.put(branch(id), SessionEntry::new(epoch, handle.clone()));
        registry.update(&branch(id), epoch, |s| s.state = ConnectionState::Connected);
        handle
    }

    #[test]
    fn normalizes_phone_numbers() {
        assert_eq!(
            normalize_destination("+51 888-888-888").unwrap(),
            "51888888888@s.whatsapp.net"
        );
        assert_eq!(
            normalize_destination("120363@g.us").unwrap(),
            "120363@g.us"
        );
        assert!(matches!(
            normalize_destination("n/a"),
            Err(Error::InvalidDestination(_))
        ));
    }

    #[test]
    fn mimetypes_follow_extension() {
        assert_eq!(mimetype_for("F001-00000042.PDF"), "application/pdf");
        assert_eq!(mimetype_for("20123456789-01-F001-42.xml"), "application/xml");
        assert_eq!(mimetype_for("receipt"), "application/octet-stream");
    }

    #[tokio::test]
    async fn no_connection_is_an_error() {
        let dispatcher =
            MessageDispatcher::new(Arc::new(SessionRegistry::new()), SendRouting::AnyConnected);
        let err = dispatcher
            .send_text(&SendRoute::AnyConnected, "51888888888", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoActiveConnection));
    }

    #[tokio::test]
    async fn connecting_sessions_are_not_used() {
        let registry = Arc::new(SessionRegistry::new());
        registry.put(branch("5"), SessionEntry::new(1, Arc::new(MockHandle::default())));
        let dispatcher = MessageDispatcher::new(registry, SendRouting::AnyConnected);

        let err = dispatcher
            .send_text(&SendRoute::Branch(branch("5")), "51888888888", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BranchNotConnected(_)));
    }

    #[tokio::test]
    async fn branch_route_uses_that_branch_only() {
        let registry = Arc::new(SessionRegistry::new());
        let first = connect(&registry, "1", 1);
        let second = connect(&registry, "2", 2);
        let dispatcher = MessageDispatcher::new(Arc::clone(&registry), SendRouting::AnyConnected);

        dispatcher
            .send_text(&SendRoute::Branch(branch("2")), "51888888888", "hola")
            .await
            .unwrap();
        assert!(first.sent().is_empty());
        assert_eq!(second.sent().len(), 1);

        dispatcher
            .send_text(&SendRoute::AnyConnected, "51888888888", "hola")
            .await
            .unwrap();
        assert_eq!(first.sent().len(), 1);
    }

    #[tokio::test]
    async fn documents_carry_name_and_mimetype() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = connect(&registry, "5", 1);
        let dispatcher = MessageDispatcher::new(registry, SendRouting::AnyConnected);

        let id = dispatcher
            .send_document(
                &SendRoute::AnyConnected,
                "51888888888",
                "Gracias por su compra",
                OutboundDocument {
                    bytes: b"%PDF-1.7".to_vec(),
                    file_name: "B001-00000123.pdf".into(),
                    mimetype: String::new(),
                },
            )
            .await
            .unwrap();
        assert!(!id.is_empty());

        let (to, payload) = handle.sent().remove(0);
        assert_eq!(to, "51888888888@s.whatsapp.net");
        match payload {
            OutboundPayload::Document { caption, document } => {
                assert_eq!(caption, "Gracias por su compra");
                assert_eq!(document.file_name, "B001-00000123.pdf");
                assert_eq!(document.mimetype, "application/pdf");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_rejection_is_propagated() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = connect(&registry, "5", 1);
        handle.reject_sends(true);
        let dispatcher = MessageDispatcher::new(registry, SendRouting::AnyConnected);

        let err = dispatcher
            .send_text(&SendRoute::AnyConnected, "51888888888", "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Send { .. }));
    }

    #[test]
    fn branch_only_policy_refuses_unscoped_route() {
        let dispatcher =
            MessageDispatcher::new(Arc::new(SessionRegistry::new()), SendRouting::BranchOnly);
        assert!(matches!(
            dispatcher.default_route(),
            Err(Error::UnscopedSendDisabled)
        ));
    }

    #[tokio::test]
    async fn supplied_mimetype_wins_over_extension() {
        let registry = Arc::new(SessionRegistry::new());
        let handle = connect(&registry, "5", 1);
        let dispatcher = MessageDispatcher::new(registry, SendRouting::AnyConnected);

        dispatcher
            .send_document(&SendRoute::AnyConnected, "51888888888", "", OutboundDocument {
                bytes: b"%PDF-1.7".to_vec(),
                file_name: "B001-7".into(),
                mimetype: "application/pdf".into(),
            })
            .await
            .unwrap();

        match handle.sent().remove(0).1 {
            OutboundPayload::Document { document, .. } => {
                assert_eq!(document.mimetype, "application/pdf");
            },
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
