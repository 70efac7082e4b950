//! The provider's serialized queue.
//!
//! One task owns the engine, the transport handle and the registry, and
//! processes commands and transport events one at a time. Nothing else
//! touches that state.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::domain::ListenerSlot;
use crate::engine::{EndpointContext, EndpointFactoryPtr, ProtocolEngine};
use crate::{
    // ---
    log_debug,
    log_info,
    log_trace,
    log_warn,
    AsyncResult,
    Operation,
    ProviderConfig,
    ProviderError,
    RemoteUri,
    Resource,
    Result,
    TransportEvent,
    TransportPtr,
};

use super::registry::Registry;
use super::{ProviderState, Shared};

pub(super) enum Cmd {
    /// Adopt a connected transport.
    Attach(TransportPtr),
    Execute {
        operation: Operation,
        request: AsyncResult,
    },
    /// Start the orderly protocol close.
    Close { request: AsyncResult },
    /// Drop the transport and stop the actor.
    Shutdown { done: AsyncResult },
}

pub(super) struct ProviderActor {
    instance: u64,
    remote: RemoteUri,
    config: ProviderConfig,
    endpoints: EndpointFactoryPtr,
    engine: Box<dyn ProtocolEngine>,
    transport: Option<TransportPtr>,
    registry: Option<Registry>,
    epoch: u64,
    inflight: Vec<AsyncResult>,
    listener: ListenerSlot,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    /// The listener has been told the connection failed.
    failed: bool,
}

impl ProviderActor {
    // ---

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: u64,
        remote: RemoteUri,
        config: ProviderConfig,
        endpoints: EndpointFactoryPtr,
        listener: ListenerSlot,
        shared: Arc<Shared>,
        cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        events_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        // ---
        let engine = endpoints.create_engine(&config);
        Self {
            instance,
            remote,
            config,
            endpoints,
            engine,
            transport: None,
            registry: None,
            epoch: 0,
            inflight: Vec::new(),
            listener,
            shared,
            cmd_rx,
            events_rx,
            failed: false,
        }
    }

    pub async fn run(mut self) {
        // ---
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_transport_event(event).await,
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if !self.on_command(cmd).await {
                        break;
                    }
                }
            }
        }
        log_debug!("provider actor for {} stopped", self.remote);
    }

    /// Split borrows of the registry and a context over the engine.
    fn parts(&mut self) -> Result<(&mut Registry, EndpointContext<'_>)> {
        // ---
        let registry = self
            .registry
            .as_mut()
            .ok_or_else(|| ProviderError::IllegalState("connection not established".into()))?;
        let cx = EndpointContext::new(self.engine.as_mut(), self.listener.get(), &self.config);
        Ok((registry, cx))
    }

    async fn on_command(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::Attach(transport) => {
                if self.shared.is_closed() {
                    let _ = transport.close().await;
                    return true;
                }
                self.transport = Some(transport);
                self.shared.set_state(ProviderState::Connecting);
                self.pump(&AsyncResult::new()).await;
            }
            Cmd::Execute { operation, request } => {
                if self.shared.is_closed() {
                    request.fail(ProviderError::Closed);
                    return true;
                }

                log_trace!("executing: {operation}");
                if let Err(error) = self.execute(operation, &request).await {
                    request.fail(error);
                }

                self.inflight.retain(|pending| !pending.is_complete());
                if !request.is_complete() {
                    self.inflight.push(request);
                }
            }
            Cmd::Close { request } => {
                self.shared.set_state(ProviderState::Closing);
                self.close_connection(&request);
                self.pump(&request).await;
            }
            Cmd::Shutdown { done } => {
                if let Some(transport) = self.transport.take() {
                    if let Err(error) = transport.close().await {
                        log_debug!("error closing transport: {error}");
                    }
                }
                if let Some(registry) = self.registry.take() {
                    registry.teardown();
                }
                self.fail_inflight(ProviderError::Closed);
                self.shared.set_state(ProviderState::Closed);
                done.succeed();
                return false;
            }
        }
        true
    }

    fn close_connection(&mut self, request: &AsyncResult) {
        // ---
        let connected = self
            .transport
            .as_ref()
            .is_some_and(|transport| transport.is_connected());
        if !connected {
            request.succeed();
        }

        match self.parts() {
            Ok((registry, mut cx)) => {
                if let Err(error) = registry.connection().close(&mut cx, request.clone()) {
                    request.fail(error);
                }
            }
            Err(_) => {
                request.succeed();
            }
        }
    }

    fn fail_inflight(&mut self, error: ProviderError) {
        for request in self.inflight.drain(..) {
            request.fail(error.clone());
        }
    }

    // --- operations

    async fn execute(&mut self, operation: Operation, request: &AsyncResult) -> Result<()> {
        // ---
        match operation {
            Operation::Create(resource) => {
                self.create(resource, request)?;
                self.pump(request).await;
            }
            Operation::Start(resource) => {
                match resource {
                    Resource::Consumer(info) => {
                        let (registry, mut cx) = self.parts()?;
                        registry.consumer(&info.id)?.start(&mut cx, request.clone())?;
                    }
                    _ => {
                        request.succeed();
                    }
                }
                self.pump(request).await;
            }
            Operation::Stop(resource) => {
                match resource {
                    Resource::Consumer(info) => {
                        let (registry, mut cx) = self.parts()?;
                        registry.consumer(&info.id)?.stop(&mut cx, request.clone())?;
                    }
                    _ => {
                        request.succeed();
                    }
                }
                self.pump(request).await;
            }
            Operation::Destroy(resource) => {
                self.destroy(resource, request)?;
                self.pump(request).await;
            }
            Operation::Send(envelope) => {
                let sent = {
                    let (registry, mut cx) = self.parts()?;
                    registry
                        .producer(&envelope.producer_id)?
                        .send(&mut cx, &envelope, request.clone())?
                };
                self.pump(request).await;
                if sent && envelope.send_async {
                    request.succeed();
                }
            }
            Operation::AcknowledgeSession(session) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry.session(&session)?.acknowledge(&mut cx)?;
                }
                self.pump(request).await;
                request.succeed();
            }
            Operation::AcknowledgeMessage(envelope, ack) => {
                let async_ack = {
                    let (registry, mut cx) = self.parts()?;
                    registry
                        .consumer(&envelope.consumer_id)?
                        .acknowledge(&mut cx, &envelope, ack)?;
                    registry.session(envelope.consumer_id.session())?.is_async_ack()
                };
                if async_ack {
                    request.succeed();
                    self.pump(request).await;
                } else {
                    self.pump(request).await;
                    request.succeed();
                }
            }
            Operation::Commit(session) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry.session(&session)?.commit(&mut cx, request.clone())?;
                }
                self.pump(request).await;
            }
            Operation::Rollback(session) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry.session(&session)?.rollback(&mut cx, request.clone())?;
                }
                self.pump(request).await;
            }
            Operation::Recover(session) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry.session(&session)?.recover(&mut cx)?;
                }
                self.pump(request).await;
                request.succeed();
            }
            Operation::Unsubscribe(subscription) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry
                        .connection()
                        .unsubscribe(&mut cx, &subscription, request.clone())?;
                }
                self.pump(request).await;
            }
            Operation::Pull(consumer, timeout) => {
                {
                    let (registry, mut cx) = self.parts()?;
                    registry.consumer(&consumer)?.pull(&mut cx, timeout)?;
                }
                self.pump(request).await;
                request.succeed();
            }
        }
        Ok(())
    }

    fn create(&mut self, resource: Resource, request: &AsyncResult) -> Result<()> {
        // ---
        let endpoints = self.endpoints.clone();

        match resource {
            Resource::Connection(info) => {
                if self.registry.is_some() {
                    return Err(ProviderError::IllegalState(
                        "connection already created".into(),
                    ));
                }

                self.shared.set_timeouts(info.timeouts);
                self.engine
                    .configure(self.config.max_frame_size, self.config.channel_max);
                let sasl = self.engine.bind()?;
                let connection = endpoints.create_connection(&info, sasl)?;
                self.shared
                    .set_message_factory(Some(connection.message_factory()));

                self.epoch += 1;
                self.registry = Some(Registry::new(self.instance, self.epoch, connection));
                self.shared.set_state(ProviderState::Bound);

                // The established notification must precede the caller's
                // completion.
                let listener = self.listener.clone();
                let remote = self.remote.clone();
                let caller = request.clone();
                let opened = AsyncResult::with_callback(move |outcome| match outcome {
                    Ok(()) => {
                        listener.connection_established(&remote);
                        caller.succeed();
                    }
                    Err(error) => {
                        caller.fail(error.clone());
                    }
                });

                let (registry, mut cx) = self.parts()?;
                registry.connection().open(&mut cx, opened)
            }
            Resource::Session(info) => {
                let (registry, mut cx) = self.parts()?;
                registry.add_session(endpoints.as_ref(), &info, &mut cx, request.clone())
            }
            Resource::Producer(info) => {
                let (registry, mut cx) = self.parts()?;
                registry.add_producer(endpoints.as_ref(), &info, &mut cx, request.clone())
            }
            Resource::Consumer(info) => {
                let (registry, mut cx) = self.parts()?;
                registry.add_consumer(endpoints.as_ref(), &info, &mut cx, request.clone())
            }
            Resource::Destination(destination) => {
                if !destination.is_temporary() {
                    request.succeed();
                    return Ok(());
                }
                let (registry, mut cx) = self.parts()?;
                registry.add_temporary(endpoints.as_ref(), &destination, &mut cx, request.clone())
            }
            Resource::Transaction(info) => {
                let (registry, mut cx) = self.parts()?;
                registry
                    .session(&info.session_id)?
                    .begin(&mut cx, &info.id, request.clone())
            }
        }
    }

    fn destroy(&mut self, resource: Resource, request: &AsyncResult) -> Result<()> {
        // ---
        if self.registry.is_none() {
            log_debug!("nothing to destroy for {resource}: not connected");
            request.succeed();
            return Ok(());
        }

        let (registry, mut cx) = self.parts()?;
        match resource {
            Resource::Connection(_) => registry.connection().close(&mut cx, request.clone()),
            Resource::Session(info) => registry.session(&info.id)?.close(&mut cx, request.clone()),
            Resource::Producer(info) => {
                registry.producer(&info.id)?.close(&mut cx, request.clone())
            }
            Resource::Consumer(info) => {
                registry.consumer(&info.id)?.close(&mut cx, request.clone())
            }
            Resource::Destination(destination) => match registry.temporary(&destination) {
                Some(temporary) => temporary.close(&mut cx, request.clone()),
                None => {
                    request.succeed();
                    Ok(())
                }
            },
            Resource::Transaction(_) => {
                request.succeed();
                Ok(())
            }
        }
    }

    // --- transport events

    async fn on_transport_event(&mut self, event: TransportEvent) {
        // ---
        match event {
            TransportEvent::Data(data) => self.on_data(data).await,
            TransportEvent::Error(error) => {
                if !self.shared.is_closed() {
                    log_info!("transport to {} failed: {error}", self.remote);
                    self.connection_lost(error);
                }
            }
            TransportEvent::Closed => {
                if !self.shared.is_closed() {
                    log_debug!("transport to {} remotely closed", self.remote);
                    self.connection_lost(ProviderError::RemotelyClosed);
                }
            }
        }
    }

    fn connection_lost(&mut self, error: ProviderError) {
        // ---
        self.connection_failed(error.clone());
        if let Some(registry) = self.registry.take() {
            registry.teardown();
        }
        self.fail_inflight(error);
    }

    /// Report the loss of the connection once; later reports are dropped.
    fn connection_failed(&mut self, error: ProviderError) {
        // ---
        if std::mem::replace(&mut self.failed, true) {
            log_trace!("connection to {} already reported failed: {error}", self.remote);
            return;
        }
        self.listener.connection_failure(error);
    }

    /// Feed, process, drain, pump.
    async fn on_data(&mut self, data: Bytes) {
        // ---
        if let Err(error) = self.feed(&data) {
            log_warn!("problem processing inbound data: {error}");
            self.connection_failed(error);
            return;
        }

        self.process_updates();
        self.pump(&AsyncResult::new()).await;
    }

    fn feed(&mut self, data: &[u8]) -> Result<()> {
        // ---
        let mut rest = data;
        while !rest.is_empty() {
            let capacity = self.engine.input_capacity();
            if capacity == 0 {
                return Err(ProviderError::connection(
                    "protocol engine input buffer is full",
                ));
            }

            let (chunk, tail) = rest.split_at(capacity.min(rest.len()));
            self.engine.push_input(chunk)?;
            self.engine.process_input()?;
            rest = tail;
        }
        Ok(())
    }

    fn process_updates(&mut self) {
        // ---
        if let Err(error) = self.drain_events() {
            log_warn!("problem processing engine updates: {error}");
            self.connection_failed(error);
        }
    }

    fn drain_events(&mut self) -> Result<()> {
        // ---
        while let Some(event) = self.engine.next_event() {
            if self.config.trace_frames {
                log_trace!("RECV: {:?} {:?}", event.kind, event.context);
            }

            if let Some(registry) = self.registry.as_mut() {
                let mut cx =
                    EndpointContext::new(self.engine.as_mut(), self.listener.get(), &self.config);
                registry.dispatch(&event, &mut cx)?;
            }
        }

        let Some(registry) = self.registry.as_mut() else {
            return Ok(());
        };

        {
            let mut cx =
                EndpointContext::new(self.engine.as_mut(), self.listener.get(), &self.config);
            registry.connection().process_sasl_authentication(&mut cx)?;
        }

        if registry.sweep() {
            log_debug!("connection to {} closed", self.remote);
            self.registry = None;
        }
        Ok(())
    }

    // --- output

    /// Write pending engine output. Failure is reported to the listener and
    /// fails `request`.
    async fn pump(&mut self, request: &AsyncResult) {
        // ---
        if let Err(error) = self.write_output().await {
            log_warn!("problem writing to {}: {error}", self.remote);
            self.connection_failed(error.clone());
            request.fail(error);
        }
    }

    async fn write_output(&mut self) -> Result<()> {
        // ---
        let Some(transport) = self.transport.clone() else {
            return Ok(());
        };

        while let Some(chunk) = self.engine.pending_output() {
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            if self.config.trace_bytes {
                log_info!("SENT: {}", hex(&chunk));
            }
            transport.send(chunk).await?;
            self.engine.output_consumed(len);
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    // ---
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
