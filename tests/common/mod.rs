//! Shared integration test support.
//!
//! - [`LineEngine`] and the `Line*` endpoints: a newline-framed text protocol
//!   standing in for a real wire codec
//! - [`Broker`]: an in-memory peer that answers that protocol
//! - [`MockProvider`] / [`MockProviderFactory`]: scripted providers for
//!   driving the failover orchestrator directly
//! - [`RecordingListener`]: collects every listener notification

#![allow(dead_code)]

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mom_provider::engine::{
    // ---
    ConnectionEndpoint,
    ConsumerEndpoint,
    EndpointContext,
    EndpointFactory,
    EndpointKey,
    EngineEvent,
    EventKind,
    LinkHandle,
    ProducerEndpoint,
    ProtocolEngine,
    ResourceEndpoint,
    SessionEndpoint,
    TemporaryEndpoint,
};
use mom_provider::transport::{MemoryPeer, MemoryPeerControl};
use mom_provider::{
    // ---
    AckMode,
    AckType,
    AsyncResult,
    ConnectionInfo,
    ConsumerInfo,
    Destination,
    InboundEnvelope,
    ListenerPtr,
    MemoryHub,
    Message,
    MessageFactory,
    MessageFactoryPtr,
    Operation,
    Outcome,
    OutboundEnvelope,
    ProducerInfo,
    Provider,
    ProviderError,
    ProviderFactory,
    ProviderListener,
    ProviderPtr,
    RemoteUri,
    Resource,
    Result,
    SessionId,
    SessionInfo,
    TransactionId,
};

pub const WAIT: Duration = Duration::from_secs(5);

// --------------------
// Logging
// --------------------

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    // ---
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// --------------------
// Line protocol engine
// --------------------

/// Input buffer size; small enough that longer reads get fed in chunks.
pub const INPUT_BUFFER: usize = 64;

/// Text protocol engine: one frame per line.
#[derive(Default)]
pub struct LineEngine {
    input: Vec<u8>,
    output: BytesMut,
    events: VecDeque<EngineEvent>,
    bound: bool,
    pub limits: Option<(u32, u16)>,
    sessions: HashMap<u64, SessionId>,
    settlements: HashMap<u64, VecDeque<(u64, bool)>>,
    deliveries: HashMap<u64, VecDeque<(u64, String)>>,
    transactions: HashMap<u64, VecDeque<bool>>,
    unsubscribes: VecDeque<bool>,
}

impl LineEngine {
    // ---

    pub fn write(&mut self, frame: &str) {
        self.output.extend_from_slice(frame.as_bytes());
        self.output.extend_from_slice(b"\n");
    }

    pub fn begin_session(&mut self, id: &SessionId) {
        self.sessions.insert(id.value(), id.clone());
        self.write(&format!("BEGIN {}", id.value()));
    }

    pub fn take_settlement(&mut self, handle: LinkHandle) -> Option<(u64, bool)> {
        self.settlements.get_mut(&handle.value())?.pop_front()
    }

    pub fn take_delivery(&mut self, handle: LinkHandle) -> Option<(u64, String)> {
        self.deliveries.get_mut(&handle.value())?.pop_front()
    }

    pub fn take_transaction(&mut self, session: &SessionId) -> Option<bool> {
        self.transactions.get_mut(&session.value())?.pop_front()
    }

    pub fn take_unsubscribe(&mut self) -> Option<bool> {
        self.unsubscribes.pop_front()
    }

    fn push(&mut self, kind: EventKind, key: EndpointKey) {
        self.events.push_back(EngineEvent::new(kind, key));
    }

    fn handle_frame(&mut self, frame: &str) -> Result<()> {
        // ---
        let mut parts = frame.splitn(4, ' ');
        let verb = parts.next().unwrap_or_default();

        match verb {
            "OPEN" => self.push(EventKind::ConnectionRemoteOpen, EndpointKey::Connection),
            "CLOSE" => self.push(EventKind::ConnectionRemoteClose, EndpointKey::Connection),
            "BEGIN" | "END" => {
                let value = number(parts.next(), frame)?;
                let Some(id) = self.sessions.get(&value).cloned() else {
                    return Ok(());
                };
                let kind = if verb == "BEGIN" {
                    EventKind::SessionRemoteOpen
                } else {
                    EventKind::SessionRemoteClose
                };
                self.push(kind, EndpointKey::Session(id));
            }
            "ATTACH" | "DETACH" | "FLOW" => {
                let handle = LinkHandle::new(number(parts.next(), frame)?);
                let kind = match verb {
                    "ATTACH" => EventKind::LinkRemoteOpen,
                    "DETACH" => EventKind::LinkRemoteClose,
                    _ => EventKind::LinkFlow,
                };
                self.push(kind, EndpointKey::Link(handle));
            }
            "SETTLE" => {
                let handle = number(parts.next(), frame)?;
                let tag = number(parts.next(), frame)?;
                let accepted = parts.next() == Some("accepted");
                self.settlements
                    .entry(handle)
                    .or_default()
                    .push_back((tag, accepted));
                self.push(EventKind::Delivery, EndpointKey::Link(LinkHandle::new(handle)));
            }
            "TRANSFER" => {
                let handle = number(parts.next(), frame)?;
                let delivery = number(parts.next(), frame)?;
                let body = parts.next().unwrap_or_default().to_string();
                self.deliveries
                    .entry(handle)
                    .or_default()
                    .push_back((delivery, body));
                self.push(EventKind::Delivery, EndpointKey::Link(LinkHandle::new(handle)));
            }
            "TXN" => {
                let value = number(parts.next(), frame)?;
                let ok = parts.next() == Some("ok");
                let Some(id) = self.sessions.get(&value).cloned() else {
                    return Ok(());
                };
                self.transactions.entry(value).or_default().push_back(ok);
                self.push(EventKind::Delivery, EndpointKey::Session(id));
            }
            "UNSUB" => {
                self.unsubscribes.push_back(parts.next() == Some("ok"));
                self.push(EventKind::Delivery, EndpointKey::Connection);
            }
            _ => {
                return Err(ProviderError::connection(format!(
                    "unexpected frame: {frame}"
                )))
            }
        }
        Ok(())
    }
}

fn number(part: Option<&str>, frame: &str) -> Result<u64> {
    part.and_then(|p| p.parse().ok())
        .ok_or_else(|| ProviderError::connection(format!("malformed frame: {frame}")))
}

impl ProtocolEngine for LineEngine {
    // ---

    fn configure(&mut self, max_frame_size: u32, channel_max: u16) {
        self.limits = Some((max_frame_size, channel_max));
    }

    fn bind(&mut self) -> Result<bool> {
        // ---
        if self.bound {
            return Err(ProviderError::IllegalState("engine already bound".into()));
        }
        self.bound = true;
        Ok(false)
    }

    fn input_capacity(&self) -> usize {
        INPUT_BUFFER.saturating_sub(self.input.len())
    }

    fn push_input(&mut self, chunk: &[u8]) -> Result<()> {
        // ---
        if chunk.len() > self.input_capacity() {
            return Err(ProviderError::connection("input buffer overflow"));
        }
        self.input.extend_from_slice(chunk);
        Ok(())
    }

    fn process_input(&mut self) -> Result<()> {
        // ---
        while let Some(pos) = self.input.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.input.drain(..=pos).collect();
            let frame = String::from_utf8(line)
                .map_err(|_| ProviderError::connection("frame is not utf-8"))?;
            self.handle_frame(frame.trim_end())?;
        }
        Ok(())
    }

    fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }

    fn pending_output(&mut self) -> Option<Bytes> {
        (!self.output.is_empty()).then(|| Bytes::copy_from_slice(&self.output))
    }

    fn output_consumed(&mut self, len: usize) {
        let len = len.min(self.output.len());
        self.output.advance(len);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// --------------------
// Line endpoints
// --------------------

/// Open/close bookkeeping shared by every endpoint.
#[derive(Default)]
struct Lifecycle {
    opening: Option<AsyncResult>,
    closing: Option<AsyncResult>,
    closed: bool,
}

impl Lifecycle {
    // ---

    fn remote_open(&mut self) {
        if let Some(request) = self.opening.take() {
            request.succeed();
        }
    }

    /// Returns whether the peer closed without being asked to.
    fn remote_close(&mut self) -> bool {
        // ---
        self.closed = true;
        if let Some(request) = self.opening.take() {
            request.fail(ProviderError::Application("open refused".into()));
            return false;
        }
        match self.closing.take() {
            Some(request) => {
                request.succeed();
                false
            }
            None => true,
        }
    }

    fn fail(&mut self, error: ProviderError) {
        // ---
        for request in [self.opening.take(), self.closing.take()].into_iter().flatten() {
            request.fail(error.clone());
        }
    }
}

pub struct LineMessageFactory {
    protocol: String,
}

impl LineMessageFactory {
    pub fn new(protocol: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            protocol: protocol.into(),
        })
    }
}

impl MessageFactory for LineMessageFactory {
    // ---

    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn create_text_message(&self, text: &str) -> Message {
        Message::text(text)
    }

    fn create_bytes_message(&self, body: Bytes) -> Message {
        Message {
            body,
            ..Message::default()
        }
    }
}

struct LineConnection {
    life: Lifecycle,
    unsubscribes: VecDeque<AsyncResult>,
    stats: Arc<FactoryStats>,
}

impl ResourceEndpoint for LineConnection {
    // ---

    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?.write("OPEN");
        self.life.opening = Some(request);
        Ok(())
    }

    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?.write("CLOSE");
        self.life.closing = Some(request);
        Ok(())
    }

    fn process_remote_open(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_open();
        Ok(())
    }

    fn process_remote_close(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        if self.life.remote_close() {
            cx.connection_failed(ProviderError::RemotelyClosed);
        }
        Ok(())
    }

    fn process_delivery_updates(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        let engine = cx.engine::<LineEngine>()?;
        while let Some(ok) = engine.take_unsubscribe() {
            let Some(request) = self.unsubscribes.pop_front() else {
                continue;
            };
            if ok {
                request.succeed();
            } else {
                request.fail(ProviderError::Application("no such subscription".into()));
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.life.closed
    }
}

impl ConnectionEndpoint for LineConnection {
    // ---

    fn unsubscribe(
        &mut self,
        cx: &mut EndpointContext<'_>,
        subscription: &str,
        request: AsyncResult,
    ) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("UNSUB {subscription}"));
        self.unsubscribes.push_back(request);
        Ok(())
    }

    fn message_factory(&self) -> MessageFactoryPtr {
        LineMessageFactory::new("line")
    }

    fn closed(&mut self) {
        // ---
        self.stats.teardowns.fetch_add(1, Ordering::SeqCst);
        let error = ProviderError::connection("transport closed");
        self.life.fail(error.clone());
        for request in self.unsubscribes.drain(..) {
            request.fail(error.clone());
        }
    }
}

struct LineSession {
    info: SessionInfo,
    life: Lifecycle,
    transactions: VecDeque<AsyncResult>,
}

impl ResourceEndpoint for LineSession {
    // ---

    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?.begin_session(&self.info.id);
        self.life.opening = Some(request);
        Ok(())
    }

    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("END {}", self.info.id.value()));
        self.life.closing = Some(request);
        Ok(())
    }

    fn process_remote_open(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_open();
        Ok(())
    }

    fn process_remote_close(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        if self.life.remote_close() {
            cx.resource_remotely_closed(
                Resource::Session(self.info.clone()),
                ProviderError::Application("session ended by peer".into()),
            );
        }
        Ok(())
    }

    fn process_delivery_updates(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        let engine = cx.engine::<LineEngine>()?;
        while let Some(ok) = engine.take_transaction(&self.info.id) {
            let Some(request) = self.transactions.pop_front() else {
                continue;
            };
            if ok {
                request.succeed();
            } else {
                request.fail(ProviderError::Application("transaction rolled back".into()));
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.life.closed
    }
}

impl SessionEndpoint for LineSession {
    // ---

    fn begin(
        &mut self,
        cx: &mut EndpointContext<'_>,
        txid: &TransactionId,
        request: AsyncResult,
    ) -> Result<()> {
        cx.engine::<LineEngine>()?.write(&format!(
            "TXN {} declare {}",
            self.info.id.value(),
            txid.value()
        ));
        self.transactions.push_back(request);
        Ok(())
    }

    fn commit(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("TXN {} commit", self.info.id.value()));
        self.transactions.push_back(request);
        Ok(())
    }

    fn rollback(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("TXN {} rollback", self.info.id.value()));
        self.transactions.push_back(request);
        Ok(())
    }

    fn acknowledge(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("ACK {}", self.info.id.value()));
        Ok(())
    }

    fn recover(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("RECOVER {}", self.info.id.value()));
        Ok(())
    }

    fn is_async_ack(&self) -> bool {
        matches!(self.info.ack_mode, AckMode::DupsOk)
    }
}

struct LineProducer {
    info: ProducerInfo,
    handle: LinkHandle,
    life: Lifecycle,
    next_tag: u64,
    unsettled: HashMap<u64, AsyncResult>,
}

impl ResourceEndpoint for LineProducer {
    // ---

    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        // ---
        let target = self
            .info
            .destination
            .as_ref()
            .map(|d| d.name.to_string())
            .unwrap_or_else(|| "-".into());
        cx.engine::<LineEngine>()?
            .write(&format!("ATTACH {} sender {target}", self.handle));
        self.life.opening = Some(request);
        Ok(())
    }

    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("DETACH {}", self.handle));
        self.life.closing = Some(request);
        Ok(())
    }

    fn process_remote_open(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_open();
        Ok(())
    }

    fn process_remote_close(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        for (_, request) in self.unsettled.drain() {
            request.fail(ProviderError::Application("producer detached".into()));
        }
        if self.life.remote_close() {
            cx.resource_remotely_closed(
                Resource::Producer(self.info.clone()),
                ProviderError::Application("producer detached by peer".into()),
            );
        }
        Ok(())
    }

    fn process_delivery_updates(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        let engine = cx.engine::<LineEngine>()?;
        while let Some((tag, accepted)) = engine.take_settlement(self.handle) {
            let Some(request) = self.unsettled.remove(&tag) else {
                continue;
            };
            if accepted {
                request.succeed();
            } else {
                request.fail(ProviderError::Application("message rejected".into()));
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.life.closed
    }
}

impl ProducerEndpoint for LineProducer {
    fn send(
        &mut self,
        cx: &mut EndpointContext<'_>,
        envelope: &OutboundEnvelope,
        request: AsyncResult,
    ) -> Result<bool> {
        // ---
        self.next_tag += 1;
        let presettled = cx.config().presettle_producers;
        let body = envelope.message.body_text().unwrap_or_default();
        cx.engine::<LineEngine>()?.write(&format!(
            "TRANSFER {} {} {body}",
            self.handle, self.next_tag
        ));

        if presettled {
            request.succeed();
        } else {
            self.unsettled.insert(self.next_tag, request);
        }
        Ok(true)
    }
}

struct LineConsumer {
    info: ConsumerInfo,
    handle: LinkHandle,
    life: Lifecycle,
}

impl ResourceEndpoint for LineConsumer {
    // ---

    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?.write(&format!(
            "ATTACH {} receiver {}",
            self.handle, self.info.destination.name
        ));
        self.life.opening = Some(request);
        Ok(())
    }

    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("DETACH {}", self.handle));
        self.life.closing = Some(request);
        Ok(())
    }

    fn process_remote_open(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_open();
        Ok(())
    }

    fn process_remote_close(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        if self.life.remote_close() {
            cx.resource_remotely_closed(
                Resource::Consumer(self.info.clone()),
                ProviderError::Application("consumer detached by peer".into()),
            );
        }
        Ok(())
    }

    fn process_delivery_updates(&mut self, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        let deliveries: Vec<(u64, String)> = {
            let engine = cx.engine::<LineEngine>()?;
            std::iter::from_fn(|| engine.take_delivery(self.handle)).collect()
        };

        for (delivery_id, body) in deliveries {
            cx.deliver(InboundEnvelope {
                consumer_id: self.info.id.clone(),
                delivery_id,
                redelivery_count: 0,
                message: Message::text(body),
            });
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.life.closed
    }
}

impl ConsumerEndpoint for LineConsumer {
    // ---

    fn start(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("FLOW {} {}", self.handle, self.info.prefetch));
        request.succeed();
        Ok(())
    }

    fn stop(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("DRAIN {}", self.handle));
        request.succeed();
        Ok(())
    }

    fn acknowledge(
        &mut self,
        cx: &mut EndpointContext<'_>,
        envelope: &InboundEnvelope,
        ack: AckType,
    ) -> Result<()> {
        cx.engine::<LineEngine>()?.write(&format!(
            "DISPOSITION {} {} {ack}",
            self.handle, envelope.delivery_id
        ));
        Ok(())
    }

    fn pull(&mut self, cx: &mut EndpointContext<'_>, timeout: Option<Duration>) -> Result<()> {
        // ---
        let timeout = timeout
            .map(|t| t.as_millis().to_string())
            .unwrap_or_else(|| "-".into());
        cx.engine::<LineEngine>()?
            .write(&format!("PULL {} {timeout}", self.handle));
        Ok(())
    }
}

struct LineTemporary {
    destination: Destination,
    handle: LinkHandle,
    life: Lifecycle,
}

impl ResourceEndpoint for LineTemporary {
    // ---

    fn open(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?.write(&format!(
            "ATTACH {} temporary {}",
            self.handle, self.destination.name
        ));
        self.life.opening = Some(request);
        Ok(())
    }

    fn close(&mut self, cx: &mut EndpointContext<'_>, request: AsyncResult) -> Result<()> {
        cx.engine::<LineEngine>()?
            .write(&format!("DETACH {}", self.handle));
        self.life.closing = Some(request);
        Ok(())
    }

    fn process_remote_open(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_open();
        Ok(())
    }

    fn process_remote_close(&mut self, _cx: &mut EndpointContext<'_>) -> Result<()> {
        self.life.remote_close();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.life.closed
    }
}

impl TemporaryEndpoint for LineTemporary {
    fn destination(&self) -> &Destination {
        &self.destination
    }
}

fn link_handle(key: EndpointKey) -> Result<LinkHandle> {
    match key {
        EndpointKey::Link(handle) => Ok(handle),
        other => Err(ProviderError::IllegalState(format!(
            "expected a link key, got {other:?}"
        ))),
    }
}

#[derive(Default)]
pub struct FactoryStats {
    pub connections: AtomicUsize,
    pub sessions: AtomicUsize,
    pub producers: AtomicUsize,
    pub consumers: AtomicUsize,
    pub teardowns: AtomicUsize,
}

/// Endpoint factory for the line protocol.
#[derive(Default)]
pub struct LineFactory {
    pub stats: Arc<FactoryStats>,
}

impl EndpointFactory for LineFactory {
    // ---

    fn create_engine(&self, _config: &mom_provider::ProviderConfig) -> Box<dyn ProtocolEngine> {
        Box::<LineEngine>::default()
    }

    fn create_connection(
        &self,
        _info: &ConnectionInfo,
        _sasl: bool,
    ) -> Result<Box<dyn ConnectionEndpoint>> {
        self.stats.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LineConnection {
            life: Lifecycle::default(),
            unsubscribes: VecDeque::new(),
            stats: self.stats.clone(),
        }))
    }

    fn create_session(&self, info: &SessionInfo) -> Result<Box<dyn SessionEndpoint>> {
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LineSession {
            info: info.clone(),
            life: Lifecycle::default(),
            transactions: VecDeque::new(),
        }))
    }

    fn create_producer(
        &self,
        info: &ProducerInfo,
        key: EndpointKey,
    ) -> Result<Box<dyn ProducerEndpoint>> {
        self.stats.producers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LineProducer {
            info: info.clone(),
            handle: link_handle(key)?,
            life: Lifecycle::default(),
            next_tag: 0,
            unsettled: HashMap::new(),
        }))
    }

    fn create_consumer(
        &self,
        info: &ConsumerInfo,
        key: EndpointKey,
    ) -> Result<Box<dyn ConsumerEndpoint>> {
        self.stats.consumers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LineConsumer {
            info: info.clone(),
            handle: link_handle(key)?,
            life: Lifecycle::default(),
        }))
    }

    fn create_temporary(
        &self,
        destination: &Destination,
        key: EndpointKey,
    ) -> Result<Box<dyn TemporaryEndpoint>> {
        Ok(Box::new(LineTemporary {
            destination: destination.clone(),
            handle: link_handle(key)?,
            life: Lifecycle::default(),
        }))
    }
}

// --------------------
// In-memory broker
// --------------------

#[derive(Default)]
struct BrokerState {
    frames: Mutex<Vec<String>>,
    peers: Mutex<Vec<MemoryPeerControl>>,
    connections: AtomicUsize,
    reject_commits: AtomicBool,
    silent: AtomicBool,
}

/// Line protocol peer bound on the process-wide memory hub.
pub struct Broker {
    name: String,
    state: Arc<BrokerState>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    // ---

    /// Bind a broker under a fresh unique name.
    pub fn start() -> Self {
        // ---
        let broker = Self {
            name: format!("broker-{}", uuid::Uuid::new_v4()),
            state: Arc::new(BrokerState::default()),
            acceptor: Mutex::new(None),
        };
        broker.listen();
        broker
    }

    pub fn uri(&self) -> RemoteUri {
        RemoteUri::from(format!("memory://{}", self.name))
    }

    /// (Re)start accepting connections.
    pub fn listen(&self) {
        // ---
        let mut acceptor = MemoryHub::global().bind(self.name.clone());
        let state = self.state.clone();
        let task = tokio::spawn(async move {
            while let Some(peer) = acceptor.accept().await {
                state.connections.fetch_add(1, Ordering::SeqCst);
                state.peers.lock().unwrap().push(peer.control());
                tokio::spawn(serve(peer, state.clone()));
            }
        });
        if let Some(previous) = self.acceptor.lock().unwrap().replace(task) {
            previous.abort();
        }
    }

    /// Refuse new connections; existing ones stay up.
    pub fn stop(&self) {
        // ---
        MemoryHub::global().unbind(&self.name);
        if let Some(task) = self.acceptor.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Close every live connection from the broker side.
    pub fn drop_connections(&self) {
        for peer in self.state.peers.lock().unwrap().drain(..) {
            peer.close();
        }
    }

    /// Write raw bytes to every live connection.
    pub fn inject(&self, data: &'static [u8]) {
        for peer in self.state.peers.lock().unwrap().iter() {
            peer.send(Bytes::from_static(data));
        }
    }

    /// Stop answering frames (new and existing connections).
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    pub fn reject_commits(&self, reject: bool) {
        self.state.reject_commits.store(reject, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<String> {
        self.state.frames.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.frames().iter().filter(|f| f.starts_with(prefix)).count()
    }

    pub async fn wait_for(&self, prefix: &str, count: usize) -> bool {
        eventually(WAIT, || self.count(prefix) >= count).await
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
        self.drop_connections();
    }
}

/// Per-connection protocol state.
#[derive(Default)]
struct Conversation {
    /// Link handle to destination, for sending links.
    senders: HashMap<u64, String>,
    /// Destination to receiving link handles with credit.
    receivers: HashMap<String, HashSet<u64>>,
    receiver_targets: HashMap<u64, String>,
    next_delivery: u64,
}

async fn serve(mut peer: MemoryPeer, state: Arc<BrokerState>) {
    // ---
    let control = peer.control();
    let mut conversation = Conversation::default();
    let mut pending = String::new();

    while let Some(chunk) = peer.recv().await {
        pending.push_str(&String::from_utf8_lossy(&chunk));

        let mut replies = String::new();
        while let Some(pos) = pending.find('\n') {
            let frame: String = pending.drain(..=pos).collect();
            let frame = frame.trim_end();
            state.frames.lock().unwrap().push(frame.to_string());

            if state.silent.load(Ordering::SeqCst) {
                continue;
            }
            for reply in conversation.respond(frame, &state) {
                replies.push_str(&reply);
                replies.push('\n');
            }
        }

        if !replies.is_empty() && !control.send(Bytes::from(replies)) {
            break;
        }
    }
}

impl Conversation {
    fn respond(&mut self, frame: &str, state: &BrokerState) -> Vec<String> {
        // ---
        let parts: Vec<&str> = frame.splitn(4, ' ').collect();

        match parts.as_slice() {
            ["OPEN"] => vec!["OPEN".into()],
            ["CLOSE"] => vec!["CLOSE".into()],
            ["BEGIN", session] => vec![format!("BEGIN {session}")],
            ["END", session] => vec![format!("END {session}")],
            ["ATTACH", handle, role, name] => {
                if name.starts_with("forbidden") {
                    return vec![format!("DETACH {handle}")];
                }
                if let Ok(handle) = handle.parse::<u64>() {
                    match *role {
                        "sender" => {
                            self.senders.insert(handle, name.to_string());
                        }
                        "receiver" => {
                            self.receiver_targets.insert(handle, name.to_string());
                        }
                        _ => {}
                    }
                }
                vec![format!("ATTACH {handle}")]
            }
            ["DETACH", handle] => {
                if let Ok(value) = handle.parse::<u64>() {
                    self.senders.remove(&value);
                    if let Some(name) = self.receiver_targets.remove(&value) {
                        if let Some(set) = self.receivers.get_mut(&name) {
                            set.remove(&value);
                        }
                    }
                }
                vec![format!("DETACH {handle}")]
            }
            ["FLOW", handle, _credit] => {
                if let Ok(value) = handle.parse::<u64>() {
                    if let Some(name) = self.receiver_targets.get(&value) {
                        self.receivers.entry(name.clone()).or_default().insert(value);
                    }
                }
                Vec::new()
            }
            ["TRANSFER", handle, tag, body] => self.transfer(handle, tag, body),
            ["TRANSFER", handle, tag] => self.transfer(handle, tag, ""),
            ["TXN", session, "commit"] if state.reject_commits.load(Ordering::SeqCst) => {
                vec![format!("TXN {session} fail")]
            }
            ["TXN", session, ..] => vec![format!("TXN {session} ok")],
            ["UNSUB", "missing"] => vec!["UNSUB fail".into()],
            ["UNSUB", _] => vec!["UNSUB ok".into()],
            _ => Vec::new(),
        }
    }

    fn transfer(&mut self, handle: &str, tag: &str, body: &str) -> Vec<String> {
        // ---
        let outcome = if body == "poison" { "rejected" } else { "accepted" };
        let mut replies = vec![format!("SETTLE {handle} {tag} {outcome}")];

        let target = handle
            .parse::<u64>()
            .ok()
            .and_then(|h| self.senders.get(&h).cloned());
        if let Some(receivers) = target.and_then(|t| self.receivers.get(&t)) {
            let mut receivers: Vec<u64> = receivers.iter().copied().collect();
            receivers.sort_unstable();
            for receiver in receivers {
                self.next_delivery += 1;
                replies.push(format!("TRANSFER {receiver} {} {body}", self.next_delivery));
            }
        }
        replies
    }
}

// --------------------
// Mock provider
// --------------------

type Responder = Box<dyn Fn(&Operation) -> Option<Outcome> + Send + Sync>;

/// Shared script for every [`MockProvider`] a [`MockProviderFactory`] makes.
#[derive(Default)]
pub struct MockScript {
    /// Remaining connect failures, consumed one per attempt.
    pub failing_connects: AtomicUsize,
    /// URIs whose connect always fails.
    pub refused: Mutex<HashSet<RemoteUri>>,
    /// Decides the outcome of each submitted operation; `None` leaves the
    /// request pending. Without a responder every operation succeeds.
    responder: Mutex<Option<Responder>>,
    pub attempts: Mutex<Vec<(Instant, RemoteUri)>>,
    pub providers: Mutex<Vec<Arc<MockProvider>>>,
    /// Leave pending requests untouched when a provider is closed.
    pub keep_pending_on_close: AtomicBool,
}

impl MockScript {
    // ---

    pub fn respond_with(&self, responder: impl Fn(&Operation) -> Option<Outcome> + Send + Sync + 'static) {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    pub fn refuse(&self, uri: &RemoteUri) {
        self.refused.lock().unwrap().insert(uri.clone());
    }

    pub fn accept(&self, uri: &RemoteUri) {
        self.refused.lock().unwrap().remove(uri);
    }

    pub fn attempts(&self) -> Vec<(Instant, RemoteUri)> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Providers that finished connecting, oldest first.
    pub fn providers(&self) -> Vec<Arc<MockProvider>> {
        self.providers.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<Arc<MockProvider>> {
        self.providers.lock().unwrap().last().cloned()
    }
}

pub struct MockProvider {
    remote: RemoteUri,
    script: Arc<MockScript>,
    listener: Mutex<Option<ListenerPtr>>,
    executed: Mutex<Vec<String>>,
    pending: Mutex<Vec<(String, AsyncResult)>>,
    closed: AtomicBool,
}

impl MockProvider {
    // ---

    /// Operations this provider ran, in order.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Complete every pending request with `outcome`.
    pub fn complete_pending(&self, outcome: Outcome) {
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for (_, request) in pending {
            request.complete(outcome.clone());
        }
    }

    /// Report an asynchronous connection failure.
    pub fn fail_connection(&self, error: ProviderError) {
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_connection_failure(error);
        }
    }

    pub fn deliver(&self, envelope: InboundEnvelope) {
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_inbound_message(envelope);
        }
    }

    pub fn remotely_close(&self, resource: Resource) {
        if let Some(listener) = self.listener.lock().unwrap().clone() {
            listener.on_resource_remotely_closed(resource, ProviderError::Application("gone".into()));
        }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    // ---

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        if self.script.keep_pending_on_close.load(Ordering::SeqCst) {
            return;
        }
        let pending: Vec<_> = self.pending.lock().unwrap().drain(..).collect();
        for (_, request) in pending {
            request.fail(ProviderError::Closed);
        }
    }

    fn submit(&self, operation: Operation, request: AsyncResult) -> Result<()> {
        // ---
        if self.is_closed() {
            return Err(ProviderError::Closed);
        }

        let label = operation.to_string();
        self.executed.lock().unwrap().push(label.clone());

        let outcome = match self.script.responder.lock().unwrap().as_ref() {
            Some(responder) => responder(&operation),
            None => Some(Ok(())),
        };
        match outcome {
            Some(outcome) => {
                request.complete(outcome);
            }
            None => self.pending.lock().unwrap().push((label, request)),
        }
        Ok(())
    }

    fn message_factory(&self) -> Option<MessageFactoryPtr> {
        Some(LineMessageFactory::new(self.remote.to_string()))
    }

    fn remote_uri(&self) -> Option<RemoteUri> {
        Some(self.remote.clone())
    }

    fn set_listener(&self, listener: ListenerPtr) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    fn listener(&self) -> Option<ListenerPtr> {
        self.listener.lock().unwrap().clone()
    }
}

/// Provider factory producing [`MockProvider`]s whose connect outcome
/// follows a [`MockScript`].
#[derive(Default)]
pub struct MockProviderFactory {
    pub script: Arc<MockScript>,
}

impl MockProviderFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Connect happens in `create` so attempts are recorded in dial order.
impl ProviderFactory for MockProviderFactory {
    fn create(&self, remote: &RemoteUri) -> Result<ProviderPtr> {
        // ---
        let script = &self.script;
        script
            .attempts
            .lock()
            .unwrap()
            .push((Instant::now(), remote.clone()));

        if script.refused.lock().unwrap().contains(remote) {
            return Err(ProviderError::connection(format!("{remote} refused")));
        }
        let failing = script.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            script.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(ProviderError::connection(format!("{remote} unreachable")));
        }

        let provider = Arc::new(MockProvider {
            remote: remote.clone(),
            script: script.clone(),
            listener: Mutex::new(None),
            executed: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        script.providers.lock().unwrap().push(provider.clone());
        Ok(provider)
    }
}

// --------------------
// Recording listener
// --------------------

/// Listener that records notifications as short strings, e.g.
/// `"established memory://a"`, `"interrupted amqp://b"`.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<String>>,
    inbound: Mutex<Vec<InboundEnvelope>>,
    /// Resources recreated on every recovery, in order.
    recreate: Mutex<Vec<Resource>>,
    /// Number of upcoming recoveries that fail.
    failing_recoveries: AtomicUsize,
}

impl RecordingListener {
    // ---

    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    pub async fn wait_for(&self, prefix: &str, count: usize) -> bool {
        eventually(WAIT, || self.count(prefix) >= count).await
    }

    pub fn inbound(&self) -> Vec<InboundEnvelope> {
        self.inbound.lock().unwrap().clone()
    }

    pub fn recreate_on_recovery(&self, resource: Resource) {
        self.recreate.lock().unwrap().push(resource);
    }

    pub fn fail_next_recoveries(&self, count: usize) {
        self.failing_recoveries.store(count, Ordering::SeqCst);
    }
}

fn uri_text(uri: &RemoteUri) -> String {
    uri.to_string()
}

#[async_trait::async_trait]
impl ProviderListener for RecordingListener {
    // ---

    fn on_connection_established(&self, remote: &RemoteUri) {
        self.record(format!("established {}", uri_text(remote)));
    }

    fn on_connection_failure(&self, error: ProviderError) {
        self.record(format!("failure {error}"));
    }

    fn on_connection_interrupted(&self, remote: &RemoteUri) {
        self.record(format!("interrupted {}", uri_text(remote)));
    }

    async fn on_connection_recovery(&self, provider: ProviderPtr) -> Result<()> {
        // ---
        let remote = provider.remote_uri().map(|u| u.to_string()).unwrap_or_default();
        self.record(format!("recovery {remote}"));

        let failing = self.failing_recoveries.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_recoveries.store(failing - 1, Ordering::SeqCst);
            return Err(ProviderError::connection("recovery failed"));
        }

        let resources = self.recreate.lock().unwrap().clone();
        for resource in resources {
            let request = AsyncResult::new();
            provider.create(resource, request.clone())?;
            request.wait_timeout(Some(WAIT)).await?;
        }
        Ok(())
    }

    async fn on_connection_recovered(&self, provider: ProviderPtr) -> Result<()> {
        let remote = provider.remote_uri().map(|u| u.to_string()).unwrap_or_default();
        self.record(format!("recovered {remote}"));
        Ok(())
    }

    fn on_connection_restored(&self, remote: &RemoteUri) {
        self.record(format!("restored {}", uri_text(remote)));
    }

    fn on_inbound_message(&self, envelope: InboundEnvelope) {
        self.record(format!("inbound {}", envelope.delivery_id));
        self.inbound.lock().unwrap().push(envelope);
    }

    fn on_resource_remotely_closed(&self, resource: Resource, _error: ProviderError) {
        self.record(format!("remotely-closed {resource}"));
    }
}
