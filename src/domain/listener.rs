// src/domain/listener.rs

//! Connection lifecycle listener.
//!
//! The messaging layer above a provider observes connection-wide changes
//! only through this trait. Request outcomes travel on completion tokens;
//! listener callbacks never report the result of an individual request.

use std::sync::{Arc, Mutex};

use crate::async_result::lock_ignore_poison;
use crate::{ProviderError, Result};

use super::envelope::InboundEnvelope;
use super::provider::ProviderPtr;
use super::resource::Resource;
use super::transport::RemoteUri;

/// Receiver of provider lifecycle notifications.
///
/// Every method has a no-op default so listeners implement only what they
/// care about. Callbacks run on the notifying provider's serialized queue and
/// must not block.
///
/// The two recovery callbacks are asynchronous: the failover orchestrator
/// awaits them in order while rebuilding state on a new provider, and treats
/// an error from either as a failure of that provider.
#[async_trait::async_trait]
pub trait ProviderListener: Send + Sync {
    // ---

    /// The very first connection is up.
    fn on_connection_established(&self, _remote: &RemoteUri) {}

    /// The connection is lost for good.
    fn on_connection_failure(&self, _error: ProviderError) {}

    /// The connection dropped and reconnection is starting.
    fn on_connection_interrupted(&self, _remote: &RemoteUri) {}

    /// Recreate previously open resources on `provider`.
    async fn on_connection_recovery(&self, _provider: ProviderPtr) -> Result<()> {
        Ok(())
    }

    /// Resume steady-state work (consumer restarts, pending pulls) on
    /// `provider`.
    async fn on_connection_recovered(&self, _provider: ProviderPtr) -> Result<()> {
        Ok(())
    }

    /// Recovery finished.
    fn on_connection_restored(&self, _remote: &RemoteUri) {}

    /// A message arrived for a consumer.
    fn on_inbound_message(&self, _envelope: InboundEnvelope) {}

    /// The broker closed a resource on its own initiative.
    fn on_resource_remotely_closed(&self, _resource: Resource, _error: ProviderError) {}
}

/// Shared listener pointer.
pub type ListenerPtr = Arc<dyn ProviderListener>;

/// Replaceable listener registration shared between a provider facade and
/// its actor.
#[derive(Clone, Default)]
pub(crate) struct ListenerSlot(Arc<Mutex<Option<ListenerPtr>>>);

impl ListenerSlot {
    // ---

    pub fn set(&self, listener: ListenerPtr) {
        *lock_ignore_poison(&self.0) = Some(listener);
    }

    pub fn get(&self) -> Option<ListenerPtr> {
        lock_ignore_poison(&self.0).clone()
    }

    pub fn is_set(&self) -> bool {
        lock_ignore_poison(&self.0).is_some()
    }

    pub fn connection_established(&self, remote: &RemoteUri) {
        if let Some(listener) = self.get() {
            listener.on_connection_established(remote);
        }
    }

    pub fn connection_failure(&self, error: ProviderError) {
        if let Some(listener) = self.get() {
            listener.on_connection_failure(error);
        }
    }

    pub fn connection_interrupted(&self, remote: &RemoteUri) {
        if let Some(listener) = self.get() {
            listener.on_connection_interrupted(remote);
        }
    }

    pub fn connection_restored(&self, remote: &RemoteUri) {
        if let Some(listener) = self.get() {
            listener.on_connection_restored(remote);
        }
    }

    pub fn inbound_message(&self, envelope: InboundEnvelope) {
        if let Some(listener) = self.get() {
            listener.on_inbound_message(envelope);
        }
    }

    pub fn resource_remotely_closed(&self, resource: Resource, error: ProviderError) {
        if let Some(listener) = self.get() {
            listener.on_resource_remotely_closed(resource, error);
        }
    }
}
