//! Protocol-driving messaging provider with transparent failover.
//!
//! This library provides the client-side runtime that sits between a
//! messaging API and a broker: an [`AmqpProvider`] that drives a protocol
//! engine over a single transport, and a [`FailoverProvider`] that keeps a
//! succession of those alive across broker disconnects, holding and
//! replaying requests while it reconnects.
//!
//! Both implement the same [`Provider`] trait. Every operation takes an
//! [`AsyncResult`] completion token; connection-wide changes are reported to
//! a [`ProviderListener`].
//!

// Import all sub modules once...
mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

mod async_result;
mod domain;
mod error;
mod failover;
mod provider;
mod provider_config;
mod reconnect;

pub mod engine;
pub mod transport;

// Re-export main types
pub use async_result::{AsyncResult, Outcome};
pub use error::{ProviderError, Result};

pub use provider_config::{
    //
    ConnectionTimeouts,
    ProviderConfig,
    DEFAULT_CHANNEL_MAX,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use reconnect::ReconnectConfig;

pub use provider::{
    //
    AmqpProvider,
    AmqpProviderFactory,
    ProviderFactory,
    ProviderFactoryPtr,
    ProviderState,
};

pub use failover::{
    //
    EndpointPool,
    FailoverBuilder,
    FailoverProvider,
    OfflinePolicy,
};

// --- public re-exports
pub use domain::{
    //
    AckMode,
    AckType,
    ConnectionId,
    ConnectionInfo,
    ConsumerId,
    ConsumerInfo,
    Destination,
    DestinationKind,
    InboundEnvelope,
    ListenerPtr,
    Message,
    MessageFactory,
    MessageFactoryPtr,
    Operation,
    OutboundEnvelope,
    ProducerId,
    ProducerInfo,
    Provider,
    ProviderHint,
    ProviderListener,
    ProviderPtr,
    RemoteUri,
    Resource,
    SessionId,
    SessionInfo,
    TransactionId,
    TransactionInfo,
    Transport,
    TransportEvent,
    TransportEvents,
    TransportPtr,
};

pub use transport::{create_memory_transport, create_tcp_transport, MemoryHub};
