// src/domain/provider.rs

//! Provider abstraction.
//!
//! A provider turns resource-level operations (create a consumer, send a
//! message, commit a transaction) into wire traffic against one remote peer.
//! Every operation takes an [`AsyncResult`] that the provider completes once
//! the operation finishes; the call itself only enqueues the work.
//!
//! Two implementations ship with the crate: the protocol-driving
//! [`AmqpProvider`](crate::AmqpProvider) and the
//! [`FailoverProvider`](crate::FailoverProvider) that wraps a succession of
//! them behind one stable facade.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{AsyncResult, Result};

use super::envelope::{AckType, InboundEnvelope, MessageFactoryPtr, OutboundEnvelope};
use super::listener::ListenerPtr;
use super::resource::{ConsumerId, Resource, SessionId};
use super::transport::RemoteUri;

/// A unit of work submitted to a provider.
#[derive(Clone, Debug)]
pub enum Operation {
    Create(Resource),
    Start(Resource),
    Stop(Resource),
    Destroy(Resource),
    Send(OutboundEnvelope),
    AcknowledgeSession(SessionId),
    AcknowledgeMessage(InboundEnvelope, AckType),
    Commit(SessionId),
    Rollback(SessionId),
    Recover(SessionId),
    Unsubscribe(String),
    /// Request a message from a consumer. `None` waits without a bound,
    /// `Some(Duration::ZERO)` asks for an immediately available message.
    Pull(ConsumerId, Option<Duration>),
}

impl Operation {
    /// Whether this creates the connection itself.
    pub fn is_connection_create(&self) -> bool {
        matches!(self, Operation::Create(resource) if resource.is_connection())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create(resource) => write!(f, "create {resource}"),
            Operation::Start(resource) => write!(f, "start {resource}"),
            Operation::Stop(resource) => write!(f, "stop {resource}"),
            Operation::Destroy(resource) => write!(f, "destroy {resource}"),
            Operation::Send(envelope) => write!(f, "send from {}", envelope.producer_id),
            Operation::AcknowledgeSession(id) => write!(f, "acknowledge session {id}"),
            Operation::AcknowledgeMessage(envelope, ack) => {
                write!(f, "acknowledge ({ack}) delivery {}", envelope.delivery_id)
            }
            Operation::Commit(id) => write!(f, "commit {id}"),
            Operation::Rollback(id) => write!(f, "rollback {id}"),
            Operation::Recover(id) => write!(f, "recover {id}"),
            Operation::Unsubscribe(name) => write!(f, "unsubscribe {name}"),
            Operation::Pull(id, _) => write!(f, "pull {id}"),
        }
    }
}

/// Resource-level operations against one logical connection.
///
/// `submit` and the convenience wrappers only enqueue work. They fail
/// synchronously when the provider is already closed; every other outcome is
/// reported on the supplied token.
///
/// # Notes
///
/// This trait uses `async_trait`; consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    // ---

    /// Establish the underlying connection.
    async fn connect(&self) -> Result<()>;

    /// Gate for normal operation; fails when no listener is registered.
    fn start(&self) -> Result<()>;

    /// Close the provider. Idempotent; concurrent callers all wait for the
    /// same close to finish.
    async fn close(&self);

    /// Enqueue one operation.
    fn submit(&self, operation: Operation, request: AsyncResult) -> Result<()>;

    /// Handle to the message factory of the live connection, if any.
    fn message_factory(&self) -> Option<MessageFactoryPtr>;

    /// Peer this provider is talking to, if any.
    fn remote_uri(&self) -> Option<RemoteUri>;

    fn set_listener(&self, listener: ListenerPtr);

    fn listener(&self) -> Option<ListenerPtr>;

    // --- convenience wrappers

    fn create(&self, resource: Resource, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Create(resource), request)
    }

    fn start_resource(&self, resource: Resource, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Start(resource), request)
    }

    fn stop_resource(&self, resource: Resource, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Stop(resource), request)
    }

    fn destroy(&self, resource: Resource, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Destroy(resource), request)
    }

    fn send(&self, envelope: OutboundEnvelope, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Send(envelope), request)
    }

    fn acknowledge_session(&self, session: SessionId, request: AsyncResult) -> Result<()> {
        self.submit(Operation::AcknowledgeSession(session), request)
    }

    fn acknowledge_message(
        &self,
        envelope: InboundEnvelope,
        ack: AckType,
        request: AsyncResult,
    ) -> Result<()> {
        self.submit(Operation::AcknowledgeMessage(envelope, ack), request)
    }

    fn commit(&self, session: SessionId, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Commit(session), request)
    }

    fn rollback(&self, session: SessionId, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Rollback(session), request)
    }

    fn recover(&self, session: SessionId, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Recover(session), request)
    }

    fn unsubscribe(&self, subscription: &str, request: AsyncResult) -> Result<()> {
        self.submit(Operation::Unsubscribe(subscription.to_string()), request)
    }

    fn pull(
        &self,
        consumer: ConsumerId,
        timeout: Option<Duration>,
        request: AsyncResult,
    ) -> Result<()> {
        self.submit(Operation::Pull(consumer, timeout), request)
    }
}

/// Shared provider pointer.
pub type ProviderPtr = Arc<dyn Provider>;
