//! Failover orchestrator builder.
//!
//! Provides a fluent API for configuring a [`FailoverProvider`]: the
//! candidate endpoints, reconnect behavior, and how providers for each
//! endpoint get created.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::EndpointFactoryPtr;
use crate::{
    // ---
    AmqpProviderFactory,
    ProviderConfig,
    ProviderError,
    ProviderFactoryPtr,
    ReconnectConfig,
    RemoteUri,
    Result,
};

use super::FailoverProvider;

const FAILOVER_SCHEME: &str = "failover:";

/// Builder for [`FailoverProvider`] instances.
///
/// Providers for each endpoint come either from an explicit
/// [`ProviderFactory`](crate::ProviderFactory) or, more commonly, from an
/// [`AmqpProviderFactory`] assembled from an endpoint factory and the
/// provider options collected here.
///
/// # Examples
///
/// ```no_run
/// use mom_provider::{FailoverBuilder, Provider};
/// use mom_provider::engine::EndpointFactoryPtr;
/// use std::time::Duration;
///
/// # async fn example(endpoints: EndpointFactoryPtr) -> mom_provider::Result<()> {
/// let failover = FailoverBuilder::from_uri(
///     "failover:(amqp://broker-a:5672,amqp://broker-b:5672)?failover.randomize=true",
/// )?
/// .max_reconnect_attempts(Some(20))
/// .reconnect_delay(Duration::from_millis(50))
/// .endpoint_factory(endpoints)
/// .build()?;
///
/// failover.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct FailoverBuilder {
    // ---
    uris: Vec<RemoteUri>,
    reconnect: ReconnectConfig,
    provider_config: ProviderConfig,
    provider_factory: Option<ProviderFactoryPtr>,
    endpoint_factory: Option<EndpointFactoryPtr>,
}

impl FailoverBuilder {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a failover URI.
    ///
    /// Accepts `failover:(uri1,uri2)?options` and the bare form
    /// `failover:uri?options`. Options prefixed `failover.` configure
    /// reconnect behavior; everything else is a provider option.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] for a malformed URI or an unknown
    /// option.
    pub fn from_uri(uri: &str) -> Result<Self> {
        // ---
        let rest = uri
            .trim()
            .strip_prefix(FAILOVER_SCHEME)
            .ok_or_else(|| ProviderError::Config(format!("not a failover URI: {uri}")))?;

        let (targets, query) = match rest.strip_prefix('(') {
            Some(inner) => {
                let close = inner
                    .find(')')
                    .ok_or_else(|| ProviderError::Config(format!("unbalanced parentheses: {uri}")))?;
                let query = inner[close + 1..].strip_prefix('?').unwrap_or("");
                (&inner[..close], query)
            }
            None => match rest.split_once('?') {
                Some((target, query)) => (target, query),
                None => (rest, ""),
            },
        };

        let mut builder = Self::new();
        for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            builder.uris.push(RemoteUri::from(target));
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            builder = builder.option(key, value)?;
        }

        Ok(builder)
    }

    /// Add one candidate endpoint.
    pub fn uri(mut self, uri: impl Into<RemoteUri>) -> Self {
        self.uris.push(uri.into());
        self
    }

    /// Add several candidate endpoints.
    pub fn uris<I, U>(mut self, uris: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<RemoteUri>,
    {
        self.uris.extend(uris.into_iter().map(Into::into));
        self
    }

    /// Delay before the very first attempt.
    ///
    /// Default: none.
    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.initial_delay = delay;
        self
    }

    /// Base delay between attempts.
    ///
    /// Default: 10ms.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.reconnect_delay = delay;
        self
    }

    /// Cap on the delay between attempts.
    ///
    /// Default: 30s.
    pub fn max_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect.max_reconnect_delay = delay;
        self
    }

    /// Enable or disable exponential backoff.
    pub fn use_backoff(mut self, enabled: bool) -> Self {
        self.reconnect.use_backoff = enabled;
        self
    }

    /// Backoff multiplier.
    ///
    /// Default: 2.0.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.reconnect.backoff_multiplier = multiplier;
        self
    }

    /// Attempt limit per reconnect cycle. `None` is unlimited.
    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect.max_reconnect_attempts = attempts;
        self
    }

    /// Attempt limit for the first connection only.
    pub fn startup_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.reconnect.startup_max_reconnect_attempts = attempts;
        self
    }

    /// Warn every `attempts` failed attempts; 0 disables the warning.
    pub fn warn_after_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.warn_after_reconnect_attempts = attempts;
        self
    }

    /// Shuffle the endpoint order on every pass.
    pub fn randomize(mut self, randomize: bool) -> Self {
        self.reconnect.randomize = randomize;
        self
    }

    /// Replace the whole reconnect configuration.
    pub fn reconnect_config(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Options for the providers created per endpoint. Ignored when an
    /// explicit provider factory is set.
    pub fn provider_config(mut self, config: ProviderConfig) -> Self {
        self.provider_config = config;
        self
    }

    /// Use `factory` to create the provider for each attempt.
    pub fn provider_factory(mut self, factory: ProviderFactoryPtr) -> Self {
        self.provider_factory = Some(factory);
        self
    }

    /// Create [`AmqpProvider`](crate::AmqpProvider)s over `endpoints`.
    pub fn endpoint_factory(mut self, endpoints: EndpointFactoryPtr) -> Self {
        self.endpoint_factory = Some(endpoints);
        self
    }

    /// Apply one URI-style option.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] for unknown keys or bad values.
    pub fn option(mut self, key: &str, value: &str) -> Result<Self> {
        // ---
        if key.starts_with("failover.") {
            self.reconnect.apply_option(key, value)?;
        } else {
            self.provider_config.apply_option(key, value)?;
        }
        Ok(self)
    }

    /// Build the orchestrator (consumes self). Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Config`] when neither a provider factory nor
    /// an endpoint factory was given.
    pub fn build(self) -> Result<FailoverProvider> {
        // ---
        let factory: ProviderFactoryPtr = match (self.provider_factory, self.endpoint_factory) {
            (Some(factory), _) => factory,
            (None, Some(endpoints)) => {
                Arc::new(AmqpProviderFactory::new(endpoints).with_config(self.provider_config))
            }
            (None, None) => {
                return Err(ProviderError::Config(
                    "a provider factory or an endpoint factory is required".into(),
                ))
            }
        };

        Ok(FailoverProvider::new(self.uris, self.reconnect, factory))
    }
}
