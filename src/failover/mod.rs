//! Failover orchestrator.
//!
//! [`FailoverProvider`] presents the same operation surface as a single
//! provider while owning zero or one live provider at a time. When the live
//! provider fails it is torn down, a new one is obtained from the endpoint
//! pool through a [`ProviderFactory`](crate::ProviderFactory), the listener
//! is asked to rebuild its resources on it, and the requests held in the
//! meantime are replayed in submission order.
//!
//! Two tasks do the work:
//!
//! - the primary queue ([`actor`]) owns all bookkeeping and every listener
//!   notification
//! - the reconnect worker ([`reconnector`]) only dials, so a slow connect
//!   never delays completions or inbound messages

mod actor;
mod builder;
mod pool;
mod reconnector;
mod request;

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::async_result::lock_ignore_poison;
use crate::{
    // ---
    log_warn,
    AsyncResult,
    ConnectionTimeouts,
    ListenerPtr,
    MessageFactoryPtr,
    Operation,
    Provider,
    ProviderError,
    ProviderFactoryPtr,
    ReconnectConfig,
    RemoteUri,
    Result,
};

use actor::{Cmd, FailoverActor, Shared};
use reconnector::Reconnector;

pub use builder::FailoverBuilder;
pub use pool::EndpointPool;
pub use request::OfflinePolicy;

/// Provider facade that survives connection loss by reconnecting.
pub struct FailoverProvider {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    shared: Arc<Shared>,
    closing: Mutex<Option<AsyncResult>>,
}

impl FailoverProvider {
    // ---

    /// Create an orchestrator over `uris` and start its tasks. Nothing is
    /// dialed until [`connect`](Provider::connect) is called.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        uris: impl IntoIterator<Item = RemoteUri>,
        config: ReconnectConfig,
        factory: ProviderFactoryPtr,
    ) -> Self {
        // ---
        let pool = EndpointPool::new(uris, config.randomize);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new(ConnectionTimeouts::default().close));

        let reconnector = Reconnector::new(config.clone(), factory, reconnect_rx, cmd_tx.clone());
        let reconnector = tokio::spawn(reconnector.run());

        let actor = FailoverActor::new(
            pool,
            config,
            shared.clone(),
            cmd_tx.clone(),
            cmd_rx,
            reconnect_tx,
            reconnector,
        );
        tokio::spawn(actor.run());

        Self {
            cmd_tx,
            shared,
            closing: Mutex::new(None),
        }
    }

    /// Add a candidate endpoint at runtime.
    pub fn add(&self, uri: impl Into<RemoteUri>) {
        let _ = self.cmd_tx.send(Cmd::Add(uri.into()));
    }

    /// Remove a candidate endpoint at runtime. A live connection to it is
    /// left alone.
    pub fn remove(&self, uri: impl Into<RemoteUri>) {
        let _ = self.cmd_tx.send(Cmd::Remove(uri.into()));
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    fn check_closed(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ProviderError::Closed);
        }
        Ok(())
    }

    fn send(&self, cmd: Cmd) -> Result<()> {
        self.cmd_tx.send(cmd).map_err(|_| ProviderError::Closed)
    }
}

#[async_trait::async_trait]
impl Provider for FailoverProvider {
    // ---

    async fn connect(&self) -> Result<()> {
        self.check_closed()?;
        self.send(Cmd::Connect)
    }

    fn start(&self) -> Result<()> {
        // ---
        self.check_closed()?;
        if !self.shared.listener.is_set() {
            return Err(ProviderError::IllegalState(
                "no provider listener has been set".into(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        // ---
        let teardown = {
            let mut closing = lock_ignore_poison(&self.closing);
            match closing.as_ref() {
                Some(teardown) => teardown.clone(),
                None => {
                    self.shared.mark_closed();
                    let teardown = AsyncResult::new();
                    *closing = Some(teardown.clone());
                    if self
                        .cmd_tx
                        .send(Cmd::Close {
                            done: teardown.clone(),
                        })
                        .is_err()
                    {
                        teardown.succeed();
                    }
                    teardown
                }
            }
        };

        if let Err(error) = teardown.wait_timeout(self.shared.close_timeout()).await {
            log_warn!("error caught while closing failover provider: {error}");
        }
    }

    fn submit(&self, operation: Operation, request: AsyncResult) -> Result<()> {
        self.check_closed()?;
        self.send(Cmd::Submit { operation, request })
    }

    fn message_factory(&self) -> Option<MessageFactoryPtr> {
        self.shared.message_factory()
    }

    fn remote_uri(&self) -> Option<RemoteUri> {
        self.shared.connected()
    }

    fn set_listener(&self, listener: ListenerPtr) {
        self.shared.listener.set(listener);
    }

    fn listener(&self) -> Option<ListenerPtr> {
        self.shared.listener.get()
    }
}

impl fmt::Display for FailoverProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.connected() {
            Some(uri) => write!(f, "FailoverProvider: {uri}"),
            None => write!(f, "FailoverProvider: unconnected"),
        }
    }
}
