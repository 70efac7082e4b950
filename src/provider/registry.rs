//! Runtime objects of one bound connection.
//!
//! Link-level endpoints live in a flat arena keyed by [`LinkHandle`]; each
//! session records which handles belong to it. Producer and consumer ids
//! cache their handle in their [`ProviderHint`](crate::ProviderHint) so hot
//! paths skip the session lookup. Hints are stamped with the provider
//! instance and connection epoch and are cleared when their link is swept
//! or the registry is torn down.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::HintKey;
use crate::engine::{
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
    SessionEndpoint,
    TemporaryEndpoint,
};
use crate::{
    log_trace, AsyncResult, ConsumerId, ConsumerInfo, Destination, ProducerId, ProducerInfo,
    ProviderError, ProviderHint, Result, SessionId, SessionInfo,
};

enum Link {
    Producer(Box<dyn ProducerEndpoint>),
    Consumer(Box<dyn ConsumerEndpoint>),
    Temporary(Box<dyn TemporaryEndpoint>),
}

/// Call a `ResourceEndpoint` method on whatever endpoint a link holds.
macro_rules! on_link {
    ($link:expr, $method:ident ( $($arg:expr),* )) => {
        match $link {
            Link::Producer(endpoint) => endpoint.$method($($arg),*),
            Link::Consumer(endpoint) => endpoint.$method($($arg),*),
            Link::Temporary(endpoint) => endpoint.$method($($arg),*),
        }
    };
}

struct SessionSlot {
    endpoint: Box<dyn SessionEndpoint>,
    producers: HashMap<ProducerId, LinkHandle>,
    consumers: HashMap<ConsumerId, LinkHandle>,
}

pub(super) struct Registry {
    provider: u64,
    epoch: u64,
    connection: Box<dyn ConnectionEndpoint>,
    sessions: HashMap<SessionId, SessionSlot>,
    links: HashMap<LinkHandle, Link>,
    temporaries: HashMap<Arc<str>, LinkHandle>,
    next_link: u64,
    hints: HashMap<LinkHandle, ProviderHint>,
}

impl Registry {
    // ---

    pub fn new(provider: u64, epoch: u64, connection: Box<dyn ConnectionEndpoint>) -> Self {
        Self {
            provider,
            epoch,
            connection,
            sessions: HashMap::new(),
            links: HashMap::new(),
            temporaries: HashMap::new(),
            next_link: 0,
            hints: HashMap::new(),
        }
    }

    pub fn connection(&mut self) -> &mut dyn ConnectionEndpoint {
        self.connection.as_mut()
    }

    fn allocate(&mut self) -> LinkHandle {
        self.next_link += 1;
        LinkHandle::new(self.next_link)
    }

    fn stamp(&mut self, hint: &ProviderHint, handle: LinkHandle) {
        // ---
        hint.set(HintKey {
            provider: self.provider,
            epoch: self.epoch,
            slot: handle.value(),
        });
        self.hints.insert(handle, hint.clone());
    }

    fn cached(&self, hint: &ProviderHint) -> Option<LinkHandle> {
        // ---
        let key = hint.get()?;
        let handle = LinkHandle::new(key.slot);
        (key.provider == self.provider && key.epoch == self.epoch && self.links.contains_key(&handle))
            .then_some(handle)
    }

    fn session_slot(&mut self, id: &SessionId) -> Result<&mut SessionSlot> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| ProviderError::ResourceNotFound(format!("session {id}")))
    }

    // --- creation

    pub fn add_session(
        &mut self,
        factory: &dyn EndpointFactory,
        info: &SessionInfo,
        cx: &mut EndpointContext<'_>,
        request: AsyncResult,
    ) -> Result<()> {
        // ---
        if self.sessions.contains_key(&info.id) {
            return Err(ProviderError::IllegalState(format!(
                "session {} already exists",
                info.id
            )));
        }

        let endpoint = factory.create_session(info)?;
        let slot = self.sessions.entry(info.id.clone()).or_insert(SessionSlot {
            endpoint,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        });
        slot.endpoint.open(cx, request)
    }

    pub fn add_producer(
        &mut self,
        factory: &dyn EndpointFactory,
        info: &ProducerInfo,
        cx: &mut EndpointContext<'_>,
        request: AsyncResult,
    ) -> Result<()> {
        // ---
        self.session_slot(info.id.session())?;
        let handle = self.allocate();
        let mut endpoint = factory.create_producer(info, EndpointKey::Link(handle))?;

        self.session_slot(info.id.session())?
            .producers
            .insert(info.id.clone(), handle);
        self.stamp(info.id.hint(), handle);

        let result = endpoint.open(cx, request);
        self.links.insert(handle, Link::Producer(endpoint));
        result
    }

    pub fn add_consumer(
        &mut self,
        factory: &dyn EndpointFactory,
        info: &ConsumerInfo,
        cx: &mut EndpointContext<'_>,
        request: AsyncResult,
    ) -> Result<()> {
        // ---
        self.session_slot(info.id.session())?;
        let handle = self.allocate();
        let mut endpoint = factory.create_consumer(info, EndpointKey::Link(handle))?;

        self.session_slot(info.id.session())?
            .consumers
            .insert(info.id.clone(), handle);
        self.stamp(info.id.hint(), handle);

        let result = endpoint.open(cx, request);
        self.links.insert(handle, Link::Consumer(endpoint));
        result
    }

    pub fn add_temporary(
        &mut self,
        factory: &dyn EndpointFactory,
        destination: &Destination,
        cx: &mut EndpointContext<'_>,
        request: AsyncResult,
    ) -> Result<()> {
        // ---
        let handle = self.allocate();
        let mut endpoint = factory.create_temporary(destination, EndpointKey::Link(handle))?;

        self.temporaries.insert(destination.name.clone(), handle);
        let result = endpoint.open(cx, request);
        self.links.insert(handle, Link::Temporary(endpoint));
        result
    }

    // --- lookup

    pub fn session(&mut self, id: &SessionId) -> Result<&mut dyn SessionEndpoint> {
        Ok(self.session_slot(id)?.endpoint.as_mut())
    }

    pub fn producer(&mut self, id: &ProducerId) -> Result<&mut dyn ProducerEndpoint> {
        // ---
        let handle = match self.cached(id.hint()) {
            Some(handle) => handle,
            None => self
                .session_slot(id.session())?
                .producers
                .get(id)
                .copied()
                .ok_or_else(|| ProviderError::ResourceNotFound(format!("producer {id}")))?,
        };

        match self.links.get_mut(&handle) {
            Some(Link::Producer(endpoint)) => Ok(endpoint.as_mut()),
            _ => Err(ProviderError::ResourceNotFound(format!("producer {id}"))),
        }
    }

    pub fn consumer(&mut self, id: &ConsumerId) -> Result<&mut dyn ConsumerEndpoint> {
        // ---
        let handle = match self.cached(id.hint()) {
            Some(handle) => handle,
            None => self
                .session_slot(id.session())?
                .consumers
                .get(id)
                .copied()
                .ok_or_else(|| ProviderError::ResourceNotFound(format!("consumer {id}")))?,
        };

        match self.links.get_mut(&handle) {
            Some(Link::Consumer(endpoint)) => Ok(endpoint.as_mut()),
            _ => Err(ProviderError::ResourceNotFound(format!("consumer {id}"))),
        }
    }

    pub fn temporary(&mut self, destination: &Destination) -> Option<&mut dyn TemporaryEndpoint> {
        // ---
        let handle = self.temporaries.get(&destination.name)?;
        match self.links.get_mut(handle) {
            Some(Link::Temporary(endpoint)) => Some(endpoint.as_mut()),
            _ => None,
        }
    }

    // --- event routing

    /// Route one engine event to the endpoint it names. Events for unknown
    /// endpoints are dropped.
    pub fn dispatch(&mut self, event: &EngineEvent, cx: &mut EndpointContext<'_>) -> Result<()> {
        // ---
        let Some(context) = &event.context else {
            return Ok(());
        };

        match context {
            EndpointKey::Connection => {
                let connection = self.connection.as_mut();
                match event.kind {
                    EventKind::ConnectionRemoteOpen => connection.process_remote_open(cx),
                    EventKind::ConnectionRemoteClose => connection.process_remote_close(cx),
                    EventKind::LinkFlow => connection.process_flow_updates(cx),
                    EventKind::Delivery => connection.process_delivery_updates(cx),
                    _ => Ok(()),
                }
            }
            EndpointKey::Session(id) => {
                let Some(slot) = self.sessions.get_mut(id) else {
                    log_trace!("event {:?} for unknown session {id}", event.kind);
                    return Ok(());
                };
                let session = slot.endpoint.as_mut();
                match event.kind {
                    EventKind::SessionRemoteOpen => session.process_remote_open(cx),
                    EventKind::SessionRemoteClose => session.process_remote_close(cx),
                    EventKind::LinkFlow => session.process_flow_updates(cx),
                    EventKind::Delivery => session.process_delivery_updates(cx),
                    _ => Ok(()),
                }
            }
            EndpointKey::Link(handle) => {
                let Some(link) = self.links.get_mut(handle) else {
                    log_trace!("event {:?} for unknown link {handle}", event.kind);
                    return Ok(());
                };
                match event.kind {
                    EventKind::LinkRemoteOpen => on_link!(link, process_remote_open(cx)),
                    EventKind::LinkRemoteClose => on_link!(link, process_remote_close(cx)),
                    EventKind::LinkRemoteDetach => on_link!(link, process_remote_detach(cx)),
                    EventKind::LinkFlow => on_link!(link, process_flow_updates(cx)),
                    EventKind::Delivery => on_link!(link, process_delivery_updates(cx)),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Drop endpoints that finished closing. A closed session takes its
    /// producers and consumers with it. Returns whether the connection
    /// itself is closed.
    pub fn sweep(&mut self) -> bool {
        // ---
        let mut dead: Vec<LinkHandle> = self
            .links
            .iter()
            .filter(|(_, link)| on_link!(link, is_closed()))
            .map(|(handle, _)| *handle)
            .collect();

        self.sessions.retain(|_, slot| {
            if slot.endpoint.is_closed() {
                dead.extend(slot.producers.values().copied());
                dead.extend(slot.consumers.values().copied());
                false
            } else {
                true
            }
        });

        for handle in &dead {
            self.links.remove(handle);
            if let Some(hint) = self.hints.remove(handle) {
                self.release(&hint);
            }
        }
        for slot in self.sessions.values_mut() {
            slot.producers.retain(|_, handle| !dead.contains(handle));
            slot.consumers.retain(|_, handle| !dead.contains(handle));
        }
        self.temporaries.retain(|_, handle| !dead.contains(handle));

        self.connection.is_closed()
    }

    /// The transport is gone: let the connection fail what it still waits
    /// for and forget every cached lookup.
    pub fn teardown(mut self) {
        // ---
        self.connection.closed();
        self.release_hints();
    }

    /// Clear the hints this registry stamped. A hint since restamped by
    /// another provider or epoch is left alone.
    fn release_hints(&mut self) {
        // ---
        let hints = std::mem::take(&mut self.hints);
        for hint in hints.values() {
            self.release(hint);
        }
    }

    fn release(&self, hint: &ProviderHint) {
        if hint
            .get()
            .is_some_and(|key| key.provider == self.provider && key.epoch == self.epoch)
        {
            hint.clear();
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.release_hints();
    }
}
