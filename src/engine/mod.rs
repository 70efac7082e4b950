//! Protocol engine seam.
//!
//! The provider does not speak a wire protocol itself. It owns a
//! [`ProtocolEngine`] that turns inbound bytes into [`EngineEvent`]s and
//! keeps the bytes it wants written in an output buffer, plus a set of
//! runtime endpoints (see [`endpoint`]) that translate resource operations
//! into engine state changes.
//!
//! Engine events carry an [`EndpointKey`] naming the runtime object they
//! concern, so the provider can route each event with one map lookup.

mod endpoint;

use std::any::Any;
use std::fmt;

use bytes::Bytes;

use crate::{Result, SessionId};

pub use endpoint::{
    //
    ConnectionEndpoint,
    ConsumerEndpoint,
    EndpointContext,
    EndpointFactory,
    EndpointFactoryPtr,
    ProducerEndpoint,
    ResourceEndpoint,
    SessionEndpoint,
    TemporaryEndpoint,
};

/// Provider-assigned handle of a link-level runtime object (producer,
/// consumer or temporary destination).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(u64);

impl LinkHandle {
    pub fn new(value: u64) -> Self {
        LinkHandle(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The runtime object an engine event is about.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKey {
    Connection,
    Session(SessionId),
    Link(LinkHandle),
}

/// What happened inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    ConnectionRemoteOpen,
    ConnectionRemoteClose,
    SessionRemoteOpen,
    SessionRemoteClose,
    LinkRemoteOpen,
    LinkRemoteClose,
    LinkRemoteDetach,
    LinkFlow,
    Delivery,
    /// Engine-internal bookkeeping with no endpoint work attached.
    Transport,
}

/// One entry of the engine's event queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineEvent {
    pub kind: EventKind,
    pub context: Option<EndpointKey>,
}

impl EngineEvent {
    pub fn new(kind: EventKind, context: EndpointKey) -> Self {
        Self {
            kind,
            context: Some(context),
        }
    }

    /// An event with no owning endpoint.
    pub fn bare(kind: EventKind) -> Self {
        Self {
            kind,
            context: None,
        }
    }
}

/// Wire protocol engine driven by a provider.
///
/// The provider runs one feed cycle per inbound buffer:
///
/// 1. copy bytes in, at most [`input_capacity`](Self::input_capacity) at a
///    time, calling [`process_input`](Self::process_input) after each chunk
/// 2. drain [`next_event`](Self::next_event) and dispatch to endpoints
/// 3. write [`pending_output`](Self::pending_output) to the transport and
///    acknowledge it with [`output_consumed`](Self::output_consumed)
///
/// Endpoints that need engine-specific calls downcast through
/// [`EndpointContext::engine`](crate::engine::EndpointContext::engine).
pub trait ProtocolEngine: Send {
    // ---

    /// Apply connection limits. Called once, before [`bind`](Self::bind).
    fn configure(&mut self, max_frame_size: u32, channel_max: u16);

    /// Bind a new connection. Returns whether a SASL exchange is offered.
    fn bind(&mut self) -> Result<bool>;

    /// Free space in the input buffer.
    fn input_capacity(&self) -> usize;

    /// Copy `chunk` into the input buffer. `chunk` never exceeds
    /// [`input_capacity`](Self::input_capacity).
    fn push_input(&mut self, chunk: &[u8]) -> Result<()>;

    /// Decode buffered input into events.
    fn process_input(&mut self) -> Result<()>;

    /// Pop the oldest pending event.
    fn next_event(&mut self) -> Option<EngineEvent>;

    /// Bytes waiting to be written, without consuming them.
    fn pending_output(&mut self) -> Option<Bytes>;

    /// Mark `len` bytes of pending output as written.
    fn output_consumed(&mut self, len: usize);

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
