//! Primary serialized queue of the failover orchestrator.
//!
//! Every caller operation, every completion coming back from a provider and
//! every provider notification is turned into a [`Cmd`] and handled here, one
//! at a time. Only connection attempts run elsewhere (see
//! [`Reconnector`](super::reconnector::Reconnector)).
//!
//! Each provider instance handed to the actor gets a new generation number.
//! Completions and notifications carry the generation they came from; the
//! ones from a provider that has already been torn down are dropped. This
//! keeps failure handling single-flight: one provider failure produces
//! exactly one teardown and one reconnect cycle, no matter how many of its
//! requests report the same loss.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::async_result::lock_ignore_poison;
use crate::domain::ListenerSlot;
use crate::{
    // ---
    log_debug,
    log_trace,
    log_warn,
    AsyncResult,
    InboundEnvelope,
    MessageFactoryPtr,
    Operation,
    Outcome,
    ProviderError,
    ProviderListener,
    ProviderPtr,
    ReconnectConfig,
    RemoteUri,
    Resource,
};

use super::pool::EndpointPool;
use super::reconnector::ReconnectCmd;
use super::request::{OfflinePolicy, RequestTable};

/// Messages consumed by the primary queue.
pub(super) enum Cmd {
    /// Start the first connection cycle.
    Connect,
    Submit {
        operation: Operation,
        request: AsyncResult,
    },
    /// A provider finished running a tracked request.
    Completed {
        id: u64,
        generation: u64,
        outcome: Outcome,
    },
    /// The reconnect worker connected a new provider.
    Connected { provider: ProviderPtr },
    /// The reconnect worker gave up.
    ReconnectExhausted { error: ProviderError },
    /// The reconnect worker wants its next candidate.
    NextCandidate {
        reply: oneshot::Sender<Option<RemoteUri>>,
    },
    /// Notification from the provider of the given generation.
    ProviderEvent {
        generation: u64,
        event: ProviderEvent,
    },
    Add(RemoteUri),
    Remove(RemoteUri),
    Close { done: AsyncResult },
}

pub(super) enum ProviderEvent {
    Inbound(InboundEnvelope),
    Failure(ProviderError),
    RemotelyClosed(Resource, ProviderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailoverState {
    Disconnected,
    Attempting,
    Connected,
    PermanentlyFailed,
    Closed,
}

/// State read by the facade without going through the queue.
pub(super) struct Shared {
    closed: AtomicBool,
    pub listener: ListenerSlot,
    message_factory: Mutex<Option<MessageFactoryPtr>>,
    connected: Mutex<Option<RemoteUri>>,
    close_timeout: Mutex<Option<Duration>>,
}

impl Shared {
    // ---

    pub fn new(close_timeout: Option<Duration>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            listener: ListenerSlot::default(),
            message_factory: Mutex::new(None),
            connected: Mutex::new(None),
            close_timeout: Mutex::new(close_timeout),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed; returns whether this call did it.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn message_factory(&self) -> Option<MessageFactoryPtr> {
        lock_ignore_poison(&self.message_factory).clone()
    }

    fn set_message_factory(&self, factory: Option<MessageFactoryPtr>) {
        *lock_ignore_poison(&self.message_factory) = factory;
    }

    pub fn connected(&self) -> Option<RemoteUri> {
        lock_ignore_poison(&self.connected).clone()
    }

    fn set_connected(&self, uri: Option<RemoteUri>) {
        *lock_ignore_poison(&self.connected) = uri;
    }

    pub fn close_timeout(&self) -> Option<Duration> {
        *lock_ignore_poison(&self.close_timeout)
    }

    fn set_close_timeout(&self, timeout: Option<Duration>) {
        *lock_ignore_poison(&self.close_timeout) = timeout;
    }
}

/// Listener installed on each live provider. It only re-queues
/// notifications, tagged with the provider's generation.
struct GenerationListener {
    generation: u64,
    primary: mpsc::UnboundedSender<Cmd>,
}

impl GenerationListener {
    fn forward(&self, event: ProviderEvent) {
        let _ = self.primary.send(Cmd::ProviderEvent {
            generation: self.generation,
            event,
        });
    }
}

#[async_trait::async_trait]
impl ProviderListener for GenerationListener {
    // ---

    fn on_connection_failure(&self, error: ProviderError) {
        self.forward(ProviderEvent::Failure(error));
    }

    fn on_inbound_message(&self, envelope: InboundEnvelope) {
        self.forward(ProviderEvent::Inbound(envelope));
    }

    fn on_resource_remotely_closed(&self, resource: Resource, error: ProviderError) {
        self.forward(ProviderEvent::RemotelyClosed(resource, error));
    }
}

pub(super) struct FailoverActor {
    state: FailoverState,
    provider: Option<ProviderPtr>,
    generation: u64,
    requests: RequestTable,
    pool: EndpointPool,
    config: ReconnectConfig,
    first_connection: bool,
    failure_cause: Option<ProviderError>,
    shared: Arc<Shared>,
    primary: mpsc::UnboundedSender<Cmd>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectCmd>,
    reconnector: Option<JoinHandle<()>>,
}

impl FailoverActor {
    // ---

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: EndpointPool,
        config: ReconnectConfig,
        shared: Arc<Shared>,
        primary: mpsc::UnboundedSender<Cmd>,
        cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        reconnect_tx: mpsc::UnboundedSender<ReconnectCmd>,
        reconnector: JoinHandle<()>,
    ) -> Self {
        Self {
            state: FailoverState::Disconnected,
            provider: None,
            generation: 0,
            requests: RequestTable::new(),
            pool,
            config,
            first_connection: true,
            failure_cause: None,
            shared,
            primary,
            cmd_rx,
            reconnect_tx,
            reconnector: Some(reconnector),
        }
    }

    pub async fn run(mut self) {
        // ---
        while let Some(cmd) = self.cmd_rx.recv().await {
            if let Cmd::Close { done } = cmd {
                self.close(done).await;
                break;
            }
            self.handle(cmd).await;
        }
        log_debug!("failover actor stopped");
    }

    async fn handle(&mut self, cmd: Cmd) {
        // ---
        match cmd {
            Cmd::Connect => {
                log_debug!("initiating initial connection attempt");
                self.trigger_reconnect();
            }
            Cmd::Submit { operation, request } => self.submit(operation, request),
            Cmd::Completed {
                id,
                generation,
                outcome,
            } => self.completed(id, generation, outcome),
            Cmd::Connected { provider } => self.connected(provider).await,
            Cmd::ReconnectExhausted { error } => self.permanently_failed(error),
            Cmd::NextCandidate { reply } => {
                let _ = reply.send(self.pool.next());
            }
            Cmd::ProviderEvent { generation, event } => self.provider_event(generation, event),
            Cmd::Add(uri) => {
                if self.pool.add(uri.clone()) {
                    log_debug!("added remote endpoint {uri}");
                }
            }
            Cmd::Remove(uri) => {
                if self.pool.remove(&uri) {
                    log_debug!("removed remote endpoint {uri}");
                }
            }
            Cmd::Close { done } => {
                // Handled by `run`.
                done.succeed();
            }
        }
    }

    fn submit(&mut self, operation: Operation, request: AsyncResult) {
        // ---
        if self.state == FailoverState::PermanentlyFailed {
            request.fail(self.failure_error());
            return;
        }

        let id = self.requests.register(operation, request);
        self.run_request(id);
    }

    /// Run a tracked request against the live provider, or apply its offline
    /// policy when there is none.
    fn run_request(&mut self, id: u64) {
        // ---
        let Some(provider) = self.provider.clone() else {
            self.when_offline(id, ProviderError::connection("connection failed"));
            return;
        };

        let generation = self.generation;
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        request.generation = Some(generation);
        let operation = request.operation.clone();

        if let Operation::Create(Resource::Connection(info)) = &operation {
            self.shared.set_close_timeout(info.timeouts.close);
        }

        log_trace!("executing failover request {id}: {operation}");

        let primary = self.primary.clone();
        let token = AsyncResult::with_callback(move |outcome| {
            let _ = primary.send(Cmd::Completed {
                id,
                generation,
                outcome: outcome.clone(),
            });
        });

        if let Err(error) = provider.submit(operation, token) {
            self.request_failed(id, generation, error);
        }
    }

    fn completed(&mut self, id: u64, generation: u64, outcome: Outcome) {
        // ---
        let Some(request) = self.requests.get(id) else {
            return;
        };
        if request.generation != Some(generation) {
            log_trace!("dropping stale completion of request {id} from generation {generation}");
            return;
        }

        match outcome {
            Ok(()) => {
                let Some(request) = self.requests.remove(id) else {
                    return;
                };
                if request.operation.is_connection_create() {
                    self.connection_created();
                }
                request.watcher.succeed();
            }
            Err(error) => self.request_failed(id, generation, error),
        }
    }

    /// The connection descriptor was accepted by the live provider.
    fn connection_created(&mut self) {
        // ---
        if !self.first_connection {
            log_warn!("ignoring duplicate connection established notification");
            return;
        }

        self.first_connection = false;
        let provider = self.provider.as_ref();
        self.shared
            .set_message_factory(provider.and_then(|p| p.message_factory()));

        if let Some(remote) = provider.and_then(|p| p.remote_uri()) {
            self.shared.listener.connection_established(&remote);
        }
    }

    fn request_failed(&mut self, id: u64, generation: u64, error: ProviderError) {
        // ---
        if error.is_request_scoped()
            || matches!(
                self.state,
                FailoverState::Closed | FailoverState::PermanentlyFailed
            )
        {
            if let Some(request) = self.requests.remove(id) {
                request.watcher.fail(error);
            }
            return;
        }

        log_debug!("request {id} received error: {error}");
        self.when_offline(id, error.clone());
        self.handle_provider_failure(generation, error);
    }

    /// Resolve a request that cannot run right now according to its policy.
    fn when_offline(&mut self, id: u64, error: ProviderError) {
        // ---
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };

        match request.policy() {
            OfflinePolicy::Hold => {
                log_trace!("holding request {id} until reconnected");
                request.generation = None;
            }
            OfflinePolicy::Succeed => {
                if let Some(request) = self.requests.remove(id) {
                    request.watcher.succeed();
                }
            }
            OfflinePolicy::Fail => {
                if let Some(request) = self.requests.remove(id) {
                    request.watcher.fail(error);
                }
            }
        }
    }

    /// Tear down the provider of `generation` and start reconnecting.
    /// Reports about an older generation are ignored.
    fn handle_provider_failure(&mut self, generation: u64, cause: ProviderError) {
        // ---
        if generation != self.generation {
            log_trace!("ignoring failure of stale provider generation {generation}");
            return;
        }
        let Some(provider) = self.provider.take() else {
            return;
        };

        log_debug!("handling provider failure: {cause}");

        self.generation += 1;
        self.state = FailoverState::Disconnected;
        self.pool.clear_connected();
        self.shared.set_connected(None);
        self.failure_cause = Some(cause.clone());

        // Requests still in flight on the failed provider resolve by policy
        // now; the ones held get replayed on the next provider.
        for id in self.requests.ids() {
            let in_flight = self
                .requests
                .get(id)
                .is_some_and(|request| request.generation == Some(generation));
            if in_flight {
                self.when_offline(id, cause.clone());
            }
        }

        let failed_uri = provider.remote_uri();
        tokio::spawn(async move { provider.close().await });

        if self.config.reconnect_allowed(self.first_connection) {
            if let Some(uri) = failed_uri.as_ref() {
                self.shared.listener.connection_interrupted(uri);
            }
            self.trigger_reconnect();
        } else {
            self.state = FailoverState::PermanentlyFailed;
            self.fail_all(cause.clone());
            self.shared.listener.connection_failure(cause);
        }
    }

    fn trigger_reconnect(&mut self) {
        // ---
        if self.state != FailoverState::Disconnected {
            return;
        }
        self.state = FailoverState::Attempting;
        let _ = self.reconnect_tx.send(ReconnectCmd::Attempt {
            first_connection: self.first_connection,
        });
    }

    /// Install a freshly connected provider, run recovery staging and replay
    /// held requests.
    async fn connected(&mut self, provider: ProviderPtr) {
        // ---
        if self.state != FailoverState::Attempting {
            log_debug!("discarding connected provider in state {:?}", self.state);
            provider.close().await;
            return;
        }

        self.generation += 1;
        let generation = self.generation;

        provider.set_listener(Arc::new(GenerationListener {
            generation,
            primary: self.primary.clone(),
        }));
        self.provider = Some(provider.clone());
        self.state = FailoverState::Connected;

        if !self.first_connection {
            if let Err(error) = self.recover(&provider).await {
                self.handle_provider_failure(generation, error);
                return;
            }
        }

        for id in self.requests.ids() {
            if self.generation != generation {
                return;
            }
            self.run_request(id);
        }

        if self.generation == generation {
            let _ = self.reconnect_tx.send(ReconnectCmd::Reset);
            if let Some(uri) = provider.remote_uri() {
                self.pool.mark_connected(&uri);
                self.shared.set_connected(Some(uri));
            }
            self.failure_cause = None;
        }
    }

    /// Recovery staging on a replacement provider.
    async fn recover(&self, provider: &ProviderPtr) -> crate::Result<()> {
        // ---
        if let Some(uri) = provider.remote_uri() {
            log_debug!("signalling connection recovery: {uri}");
        }
        let listener = self.shared.listener.get();

        if let Some(listener) = listener.as_ref() {
            listener.on_connection_recovery(provider.clone()).await?;
        }

        self.shared.set_message_factory(provider.message_factory());

        if let Some(listener) = listener.as_ref() {
            listener.on_connection_recovered(provider.clone()).await?;
            if let Some(uri) = provider.remote_uri() {
                listener.on_connection_restored(&uri);
            }
        }
        Ok(())
    }

    fn permanently_failed(&mut self, error: ProviderError) {
        // ---
        if self.state != FailoverState::Attempting {
            return;
        }
        self.state = FailoverState::PermanentlyFailed;
        self.failure_cause = Some(error.clone());
        self.fail_all(error.clone());
        self.shared.listener.connection_failure(error);
    }

    fn provider_event(&mut self, generation: u64, event: ProviderEvent) {
        // ---
        if matches!(
            self.state,
            FailoverState::Closed | FailoverState::PermanentlyFailed
        ) || generation != self.generation
        {
            log_trace!("dropping notification from provider generation {generation}");
            return;
        }

        match event {
            ProviderEvent::Inbound(envelope) => self.shared.listener.inbound_message(envelope),
            ProviderEvent::RemotelyClosed(resource, error) => {
                self.shared.listener.resource_remotely_closed(resource, error)
            }
            ProviderEvent::Failure(error) => self.handle_provider_failure(generation, error),
        }
    }

    fn fail_all(&mut self, error: ProviderError) {
        for request in self.requests.drain() {
            request.watcher.fail(error.clone());
        }
    }

    fn failure_error(&self) -> ProviderError {
        self.failure_cause
            .clone()
            .unwrap_or_else(|| ProviderError::connection("connection closed"))
    }

    async fn close(&mut self, done: AsyncResult) {
        // ---
        self.state = FailoverState::Closed;
        self.fail_all(self.failure_error());

        if let Some(reconnector) = self.reconnector.take() {
            reconnector.abort();
        }
        if let Some(provider) = self.provider.take() {
            provider.close().await;
        }

        // A provider may have been handed over while the close was queued.
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Cmd::Connected { provider } => provider.close().await,
                Cmd::Submit { request, .. } => {
                    request.fail(ProviderError::Closed);
                }
                Cmd::Close { done } => {
                    done.succeed();
                }
                _ => {}
            }
        }

        self.shared.set_connected(None);
        done.succeed();
    }
}
