//! Protocol-driving provider.
//!
//! [`AmqpProvider`] owns one transport, one protocol engine and the runtime
//! endpoints of one connection. All of that state lives in an actor task;
//! the public struct only enqueues commands and reads a few atomically
//! shared values (closed flag, timeouts, message factory).
//!
//! A provider is single-use: once its connection is lost or it is closed, a
//! new provider has to be created. The failover orchestrator does exactly
//! that through a [`ProviderFactory`].

mod actor;
mod factory;
mod registry;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::async_result::lock_ignore_poison;
use crate::domain::ListenerSlot;
use crate::engine::EndpointFactoryPtr;
use crate::transport::create_transport;
use crate::{
    // ---
    log_debug,
    log_warn,
    AsyncResult,
    ConnectionTimeouts,
    ListenerPtr,
    MessageFactoryPtr,
    Operation,
    Provider,
    ProviderConfig,
    ProviderError,
    RemoteUri,
    Result,
    TransportEvents,
};

use actor::{Cmd, ProviderActor};

pub use factory::{AmqpProviderFactory, ProviderFactory, ProviderFactoryPtr};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a protocol-driving provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// Created, no transport yet.
    Unbound,
    /// Transport connected, connection not yet created.
    Connecting,
    /// Engine bound to a connection.
    Bound,
    /// Orderly close in progress.
    Closing,
    Closed,
}

/// State readable from outside the actor.
pub(crate) struct Shared {
    closed: AtomicBool,
    state: Mutex<ProviderState>,
    timeouts: Mutex<ConnectionTimeouts>,
    message_factory: Mutex<Option<MessageFactoryPtr>>,
}

impl Shared {
    // ---

    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            state: Mutex::new(ProviderState::Unbound),
            timeouts: Mutex::new(ConnectionTimeouts::default()),
            message_factory: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProviderState {
        *lock_ignore_poison(&self.state)
    }

    pub fn set_state(&self, state: ProviderState) {
        *lock_ignore_poison(&self.state) = state;
    }

    pub fn timeouts(&self) -> ConnectionTimeouts {
        *lock_ignore_poison(&self.timeouts)
    }

    pub fn set_timeouts(&self, timeouts: ConnectionTimeouts) {
        *lock_ignore_poison(&self.timeouts) = timeouts;
    }

    pub fn message_factory(&self) -> Option<MessageFactoryPtr> {
        lock_ignore_poison(&self.message_factory).clone()
    }

    pub fn set_message_factory(&self, factory: Option<MessageFactoryPtr>) {
        *lock_ignore_poison(&self.message_factory) = factory;
    }
}

/// Provider that drives a wire protocol over a single transport.
pub struct AmqpProvider {
    remote: RemoteUri,
    config: ProviderConfig,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    events_tx: TransportEvents,
    shared: Arc<Shared>,
    listener: ListenerSlot,
    connecting: AtomicBool,
    closing: Mutex<Option<AsyncResult>>,
}

impl AmqpProvider {
    // ---

    /// Create a provider for `remote` and start its actor.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(remote: RemoteUri, config: ProviderConfig, endpoints: EndpointFactoryPtr) -> Self {
        // ---
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::new());
        let listener = ListenerSlot::default();

        let actor = ProviderActor::new(
            instance,
            remote.clone(),
            config.clone(),
            endpoints,
            listener.clone(),
            shared.clone(),
            cmd_rx,
            events_rx,
        );
        tokio::spawn(actor.run());

        Self {
            remote,
            config,
            cmd_tx,
            events_tx,
            shared,
            listener,
            connecting: AtomicBool::new(false),
            closing: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProviderState {
        self.shared.state()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn check_closed(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(ProviderError::Closed);
        }
        Ok(())
    }

    /// Run the orderly close then the teardown, off the caller's task so a
    /// cancelled caller cannot stall it.
    fn begin_close(&self) -> AsyncResult {
        // ---
        let mut closing = lock_ignore_poison(&self.closing);
        if let Some(teardown) = closing.as_ref() {
            return teardown.clone();
        }

        self.shared.closed.store(true, Ordering::SeqCst);
        let teardown = AsyncResult::new();
        *closing = Some(teardown.clone());

        let cmd_tx = self.cmd_tx.clone();
        let shared = self.shared.clone();
        let remote = self.remote.clone();
        let finished = teardown.clone();

        tokio::spawn(async move {
            // ---
            let orderly = AsyncResult::new();
            if cmd_tx
                .send(Cmd::Close {
                    request: orderly.clone(),
                })
                .is_err()
            {
                orderly.succeed();
            }

            if let Err(error) = orderly.wait_timeout(shared.timeouts().close).await {
                log_warn!("error while closing provider for {remote}: {error}");
            }

            let done = AsyncResult::new();
            if cmd_tx.send(Cmd::Shutdown { done: done.clone() }).is_err() {
                done.succeed();
            }
            let _ = done.wait().await;

            log_debug!("provider for {remote} closed");
            finished.succeed();
        });

        teardown
    }
}

#[async_trait::async_trait]
impl Provider for AmqpProvider {
    // ---

    async fn connect(&self) -> Result<()> {
        // ---
        self.check_closed()?;
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(ProviderError::IllegalState(
                "provider already connected".into(),
            ));
        }

        let transport = create_transport(
            &self.remote,
            self.config.transport_type.as_deref(),
            self.shared.timeouts().connect,
        )?;
        transport.connect(self.events_tx.clone()).await?;

        self.cmd_tx
            .send(Cmd::Attach(transport))
            .map_err(|_| ProviderError::Closed)
    }

    fn start(&self) -> Result<()> {
        // ---
        self.check_closed()?;
        if !self.listener.is_set() {
            return Err(ProviderError::IllegalState(
                "no provider listener has been set".into(),
            ));
        }
        Ok(())
    }

    async fn close(&self) {
        // ---
        let _ = self.begin_close().wait().await;
    }

    fn submit(&self, operation: Operation, request: AsyncResult) -> Result<()> {
        // ---
        self.check_closed()?;
        self.cmd_tx
            .send(Cmd::Execute { operation, request })
            .map_err(|_| ProviderError::Closed)
    }

    fn message_factory(&self) -> Option<MessageFactoryPtr> {
        self.shared.message_factory()
    }

    fn remote_uri(&self) -> Option<RemoteUri> {
        Some(self.remote.clone())
    }

    fn set_listener(&self, listener: ListenerPtr) {
        self.listener.set(listener);
    }

    fn listener(&self) -> Option<ListenerPtr> {
        self.listener.get()
    }
}

impl fmt::Display for AmqpProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AmqpProvider: {}", self.remote.authority())
    }
}
