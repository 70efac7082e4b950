//! Provider construction seam.

use std::sync::Arc;

use crate::engine::EndpointFactoryPtr;
use crate::{ProviderConfig, ProviderPtr, RemoteUri, Result};

use super::AmqpProvider;

/// Creates an unconnected provider for a remote URI.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, remote: &RemoteUri) -> Result<ProviderPtr>;
}

/// Shared provider factory pointer.
pub type ProviderFactoryPtr = Arc<dyn ProviderFactory>;

/// Builds [`AmqpProvider`]s from an endpoint factory and a base config.
///
/// Query options on the URI (`amqp://host:5672?amqp.traceFrames=true`)
/// override the base config for that provider only.
#[derive(Clone)]
pub struct AmqpProviderFactory {
    config: ProviderConfig,
    endpoints: EndpointFactoryPtr,
}

impl AmqpProviderFactory {
    // ---

    pub fn new(endpoints: EndpointFactoryPtr) -> Self {
        Self {
            config: ProviderConfig::default(),
            endpoints,
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }
}

impl ProviderFactory for AmqpProviderFactory {
    fn create(&self, remote: &RemoteUri) -> Result<ProviderPtr> {
        // ---
        let mut config = self.config.clone();
        for (key, value) in remote.query_pairs() {
            config.apply_option(&key, &value)?;
        }

        Ok(Arc::new(AmqpProvider::new(
            remote.without_query(),
            config,
            self.endpoints.clone(),
        )))
    }
}
