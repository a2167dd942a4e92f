//! Session metrics, compiled to no-ops without the `metrics` feature.
#![cfg_attr(not(feature = "metrics"), allow(unused_variables))]

pub(crate) fn session_opened(branch: &str) {
    #[cfg(feature = "metrics")]
    metrics::counter!("whatsapp_sessions_opened_total", "branch" => branch.to_string())
        .increment(1);
}

pub(crate) fn reconnect_scheduled(branch: &str) {
    #[cfg(feature = "metrics")]
    metrics::counter!("whatsapp_reconnects_total", "branch" => branch.to_string()).increment(1);
}

pub(crate) fn logged_out(branch: &str) {
    #[cfg(feature = "metrics")]
    metrics::counter!("whatsapp_logouts_total", "branch" => branch.to_string()).increment(1);
}

pub(crate) fn message_sent(branch: &str, kind: &'static str) {
    #[cfg(feature = "metrics")]
    metrics::counter!(
        "whatsapp_messages_sent_total",
        "branch" => branch.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub(crate) fn connected_sessions(count: usize) {
    #[cfg(feature = "metrics")]
    metrics::gauge!("whatsapp_sessions_connected").set(count as f64);
}
