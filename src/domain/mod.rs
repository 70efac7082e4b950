//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! protocol engines, transport implementations, or broker specifics.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod envelope;
mod listener;
mod provider;
mod resource;
mod transport;

// --- Resource re-exports ---

pub use resource::{
    //
    AckMode,
    ConnectionId,
    ConnectionInfo,
    ConsumerId,
    ConsumerInfo,
    Destination,
    DestinationKind,
    ProducerId,
    ProducerInfo,
    ProviderHint,
    Resource,
    SessionId,
    SessionInfo,
    TransactionId,
    TransactionInfo,
};

pub(crate) use resource::HintKey;

// --- Message re-exports ---

pub use envelope::{
    //
    AckType,
    InboundEnvelope,
    Message,
    MessageFactory,
    MessageFactoryPtr,
    OutboundEnvelope,
};

// --- Provider re-exports ---

pub use listener::{ListenerPtr, ProviderListener};
pub(crate) use listener::ListenerSlot;
pub use provider::{Operation, Provider, ProviderPtr};

// --- Transport re-exports ---

pub use transport::{
    //
    RemoteUri,
    Transport,
    TransportEvent,
    TransportEvents,
    TransportPtr,
};
