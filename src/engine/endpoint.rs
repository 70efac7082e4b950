// src/engine/endpoint.rs

//! Runtime endpoints.
//!
//! For every resource it creates, the provider asks an [`EndpointFactory`]
//! for a runtime object that knows how to express that resource in the
//! engine's terms. Endpoints are called only from the provider's serialized
//! queue, always with an [`EndpointContext`] giving them the engine and a
//! way to raise notifications.
//!
//! Operations that finish asynchronously keep the supplied
//! [`AsyncResult`] and complete it later, typically while processing the
//! matching remote event.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::ListenerPtr;
use crate::{
    AckType, AsyncResult, ConnectionInfo, ConsumerInfo, Destination, InboundEnvelope,
    MessageFactoryPtr, OutboundEnvelope, ProducerInfo, ProviderConfig, ProviderError, Resource,
    Result, SessionInfo, TransactionId,
};

use super::{EndpointKey, ProtocolEngine};

/// What an endpoint may touch while handling a call.
pub struct EndpointContext<'a> {
    engine: &'a mut dyn ProtocolEngine,
    listener: Option<ListenerPtr>,
    config: &'a ProviderConfig,
}

impl<'a> EndpointContext<'a> {
    // ---

    pub(crate) fn new(
        engine: &'a mut dyn ProtocolEngine,
        listener: Option<ListenerPtr>,
        config: &'a ProviderConfig,
    ) -> Self {
        Self {
            engine,
            listener,
            config,
        }
    }

    /// The engine, downcast to its concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::IllegalState`] when the provider runs a
    /// different engine type than the endpoint was written for.
    pub fn engine<E: ProtocolEngine + 'static>(&mut self) -> Result<&mut E> {
        // ---
        self.engine
            .as_any_mut()
            .downcast_mut::<E>()
            .ok_or_else(|| ProviderError::IllegalState("unexpected protocol engine".into()))
    }

    /// The engine behind its trait object.
    pub fn raw_engine(&mut self) -> &mut dyn ProtocolEngine {
        &mut *self.engine
    }

    pub fn config(&self) -> &ProviderConfig {
        self.config
    }

    /// Dispatch an inbound message to the listener.
    pub fn deliver(&self, envelope: InboundEnvelope) {
        if let Some(listener) = &self.listener {
            listener.on_inbound_message(envelope);
        }
    }

    /// Report that the broker closed `resource` on its own.
    pub fn resource_remotely_closed(&self, resource: Resource, error: ProviderError) {
        if let Some(listener) = &self.listener {
            listener.on_resource_remotely_closed(resource, error);
        }
    }

    /// Report that the connection as a whole is unusable.
    pub fn connection_failed(&self, error: ProviderError) {
        if let Some(listener) = &self.listener {
            listener.on_connection_failure(error);
        }
    }
}

/// Behavior shared by every runtime endpoint.
pub trait ResourceEndpoint: Send {
    // ---

    /// Start opening; complete `request` once the peer confirms.
    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    /// Start closing; complete `request` once the peer confirms.
    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    fn process_remote_open(&mut self, cx: &mut EndpointContext<'_>) -> Result<()>;

    fn process_remote_close(&mut self, cx: &mut EndpointContext<'_>) -> Result<()>;

    fn process_remote_detach(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        self.process_remote_close(cx)
    }

    fn process_flow_updates(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        Ok(())
    }

    fn process_delivery_updates(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Fully closed; the provider drops closed endpoints after each cycle.
    fn is_closed(&self) -> bool;
}

/// Runtime side of the connection.
pub trait ConnectionEndpoint: ResourceEndpoint {
    // ---

    /// Advance SASL negotiation, if any. Called after every event drain.
    fn process_sasl_authentication(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        Ok(())
    }

    fn unsubscribe(
        &mut self,
        cx: &mut EndpointContext<'_>,
        subscription: &str,
        request: AsyncResult,
    ) -> Result<()>;

    fn message_factory(&self) -> MessageFactoryPtr;

    /// The transport is gone; fail whatever is still waiting on the peer.
    fn closed(&mut self);
}

/// Runtime side of a session.
pub trait SessionEndpoint: ResourceEndpoint {
    // ---

    fn begin(
        &mut self,
        cx: &mut EndpointContext<'_>,
        txid: &TransactionId,
        request: AsyncResult,
    ) -> Result<()>;

    fn commit(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    fn rollback(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    /// Acknowledge everything delivered to the session so far.
    fn acknowledge(&mut self, cx: &mut EndpointContext<'_>) -> Result<()>;

    /// Release unacknowledged deliveries for redelivery.
    fn recover(&mut self, cx: &mut EndpointContext<'_>) -> Result<()>;

    /// Acknowledgements complete without waiting for the peer.
    fn is_async_ack(&self) -> bool;
}

/// Runtime side of a producer.
pub trait ProducerEndpoint: ResourceEndpoint {
    /// Enqueue `envelope`. Returns whether the message went out; the
    /// endpoint completes `request` once the peer settles it.
    fn send(
        &mut self,
        cx: &mut EndpointContext<'_>,
        envelope: &OutboundEnvelope,
        request: AsyncResult,
    ) -> Result<bool>;
}

/// Runtime side of a consumer.
pub trait ConsumerEndpoint: ResourceEndpoint {
    // ---

    fn start(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    fn stop(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()>;

    fn acknowledge(
        &mut self,
        cx: &mut EndpointContext<'_>,
        envelope: &InboundEnvelope,
        ack: AckType,
    ) -> Result<()>;

    fn pull(&mut self, cx: &mut EndpointContext<'_>, timeout: Option<Duration>) -> Result<()>;
}

/// Runtime side of a temporary destination.
pub trait TemporaryEndpoint: ResourceEndpoint {
    fn destination(&self) -> &Destination;
}

/// Builds the engine and runtime endpoints for one provider.
pub trait EndpointFactory: Send + Sync {
    // ---

    fn create_engine(&self, config: &ProviderConfig) -> Box<dyn ProtocolEngine>;

    fn create_connection(
        &self,
        info: &ConnectionInfo,
        sasl: bool,
    ) -> Result<Box<dyn ConnectionEndpoint>>;

    fn create_session(&self, info: &SessionInfo) -> Result<Box<dyn SessionEndpoint>>;

    fn create_producer(
        &self,
        info: &ProducerInfo,
        key: EndpointKey,
    ) -> Result<Box<dyn ProducerEndpoint>>;

    fn create_consumer(
        &self,
        info: &ConsumerInfo,
        key: EndpointKey,
    ) -> Result<Box<dyn ConsumerEndpoint>>;

    fn create_temporary(
        &self,
        destination: &Destination,
        key: EndpointKey,
    ) -> Result<Box<dyn TemporaryEndpoint>>;
}

/// Shared endpoint factory pointer.
pub type EndpointFactoryPtr = Arc<dyn EndpointFactory>;
