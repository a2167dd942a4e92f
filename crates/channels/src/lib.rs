//! Channel seams shared by the messaging session manager and its hosts.
//!
//! `plugin` holds the traits a channel host drives (outbound sends and health
//! probes keyed by account). `transport` is the boundary to the library that
//! owns the actual messaging connection.

pub mod plugin;
pub mod transport;

pub use {
    plugin::{ChannelHealthSnapshot, ChannelOutbound, ChannelStatus, OutboundDocument},
    transport::{
        AuthState, LOGGED_OUT_STATUS, OpenedSession, OutboundPayload, SentMessage, Transport,
        TransportEvent, TransportHandle,
    },
};
