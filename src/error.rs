use thiserror::Error;

/// Errors produced by providers, the failover orchestrator, and their
/// collaborators.
///
/// The type is `Clone` so that a single outcome can be handed to every
/// observer of a completion token.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The provider (or orchestrator) has already been closed.
    #[error("the provider is already closed")]
    Closed,

    /// Transport, socket or protocol engine I/O failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// The peer closed the connection gracefully.
    #[error("connection remotely closed")]
    RemotelyClosed,

    /// The operation is not supported by the provider or the broker.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// The broker rejected the request at the application level.
    #[error("request rejected: {0}")]
    Application(String),

    /// A resource referenced by id is not known to the provider.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// The operation is not valid in the current state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A bounded wait elapsed.
    #[error("timed out waiting for completion")]
    Timeout,

    /// The reconnect attempt limit was reached.
    #[error("failed to connect after {attempts} attempt(s): {cause}")]
    ReconnectExhausted {
        /// Number of attempts made in the final cycle.
        attempts: u32,
        /// Rendering of the last attempt's failure.
        cause: String,
    },

    /// Invalid configuration value or unknown option.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Convenience constructor for [`ProviderError::Connection`].
    pub fn connection(msg: impl Into<String>) -> Self {
        // ---
        ProviderError::Connection(msg.into())
    }

    /// Errors that end the request they occurred on without saying anything
    /// about the health of the connection.
    pub fn is_request_scoped(&self) -> bool {
        // ---
        matches!(
            self,
            ProviderError::Unsupported(_)
                | ProviderError::Application(_)
                | ProviderError::ResourceNotFound(_)
        )
    }

    /// Errors that mean the connection underneath the request is gone.
    pub fn is_connection_fatal(&self) -> bool {
        // ---
        !self.is_request_scoped() && !matches!(self, ProviderError::Closed)
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        // ---
        ProviderError::Connection(err.to_string())
    }
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;
