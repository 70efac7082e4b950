//! In-memory transport implementation.
//!
//! This module provides a pure in-process byte pipe implementing the
//! domain-level `Transport` trait. It is intended primarily for testing and
//! as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - A [`MemoryHub`] maps names to acceptors. `memory://<name>` connects to
//!   the acceptor bound under `<name>`; connecting to an unbound name fails
//!   like a refused TCP connection.
//! - Every accepted connection hands the acceptor a [`MemoryPeer`] that sees
//!   exactly the bytes the client sent, in order.
//! - The peer side decides when the connection ends: [`MemoryPeerControl::close`]
//!   reports a graceful close to the client, [`MemoryPeerControl::fail`] an
//!   I/O error. Dropping the client transport ends the peer's byte stream.
//!
//! ## Non-Goals
//!
//! This transport does not model partial writes, latency, or backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::async_result::lock_ignore_poison;
use crate::{
    // ---
    ProviderError,
    RemoteUri,
    Result,
    Transport,
    TransportEvent,
    TransportEvents,
    TransportPtr,
};

/// Registry of in-process acceptors.
#[derive(Default)]
pub struct MemoryHub {
    acceptors: Mutex<HashMap<String, mpsc::UnboundedSender<MemoryPeer>>>,
}

impl MemoryHub {
    // ---

    /// Create an isolated hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide hub used for `memory://` URIs.
    pub fn global() -> Arc<Self> {
        // ---
        static GLOBAL: OnceLock<Arc<MemoryHub>> = OnceLock::new();
        GLOBAL.get_or_init(MemoryHub::new).clone()
    }

    /// Start accepting connections under `name`, replacing any previous
    /// acceptor bound to it.
    pub fn bind(&self, name: impl Into<String>) -> MemoryAcceptor {
        // ---
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();
        lock_ignore_poison(&self.acceptors).insert(name.clone(), tx);
        MemoryAcceptor { name, incoming: rx }
    }

    /// Stop accepting connections under `name`. Existing connections stay
    /// up. Returns whether an acceptor was bound.
    pub fn unbind(&self, name: &str) -> bool {
        lock_ignore_poison(&self.acceptors).remove(name).is_some()
    }

    fn accept(&self, name: &str, events: TransportEvents) -> Result<mpsc::UnboundedSender<Bytes>> {
        // ---
        let mut acceptors = lock_ignore_poison(&self.acceptors);

        let Some(acceptor) = acceptors.get(name) else {
            return Err(ProviderError::connection(format!(
                "connection refused: {name}"
            )));
        };

        let (to_peer, inbound) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            inbound,
            control: MemoryPeerControl {
                events,
                ended: Arc::new(AtomicBool::new(false)),
            },
        };

        if acceptor.send(peer).is_err() {
            // Acceptor dropped without unbinding.
            acceptors.remove(name);
            return Err(ProviderError::connection(format!(
                "connection refused: {name}"
            )));
        }

        Ok(to_peer)
    }
}

/// Receiving end of a bound name.
pub struct MemoryAcceptor {
    name: String,
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }
}

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    inbound: mpsc::UnboundedReceiver<Bytes>,
    control: MemoryPeerControl,
}

impl MemoryPeer {
    // ---

    /// Next chunk written by the client. `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Handle for writing to, closing or failing this connection.
    pub fn control(&self) -> MemoryPeerControl {
        self.control.clone()
    }
}

/// Cloneable write/terminate handle for a [`MemoryPeer`].
#[derive(Clone)]
pub struct MemoryPeerControl {
    events: TransportEvents,
    ended: Arc<AtomicBool>,
}

impl MemoryPeerControl {
    // ---

    /// Write bytes to the client. Returns `false` once the connection ended.
    pub fn send(&self, data: Bytes) -> bool {
        !self.ended.load(Ordering::SeqCst) && self.events.send(TransportEvent::Data(data)).is_ok()
    }

    /// Close gracefully.
    pub fn close(&self) {
        self.terminate(TransportEvent::Closed);
    }

    /// Drop the connection with an I/O error.
    pub fn fail(&self, error: ProviderError) {
        self.terminate(TransportEvent::Error(error));
    }

    fn terminate(&self, event: TransportEvent) {
        // ---
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }
}

/// Client side of an in-memory connection.
struct MemoryTransport {
    // ---
    remote: RemoteUri,
    hub: Arc<MemoryHub>,
    to_peer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---

    fn remote(&self) -> &RemoteUri {
        &self.remote
    }

    async fn connect(&self, events: TransportEvents) -> Result<()> {
        // ---
        let to_peer = self.hub.accept(self.remote.host(), events)?;
        *lock_ignore_poison(&self.to_peer) = Some(to_peer);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        // ---
        lock_ignore_poison(&self.to_peer)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        // ---
        let guard = lock_ignore_poison(&self.to_peer);
        let Some(tx) = guard.as_ref() else {
            return Err(ProviderError::connection("transport not connected"));
        };

        tx.send(data)
            .map_err(|_| ProviderError::connection("peer closed the connection"))
    }

    /// Close the transport.
    ///
    /// Dropping the sender ends the peer's byte stream.
    async fn close(&self) -> Result<()> {
        // ---
        lock_ignore_poison(&self.to_peer).take();
        Ok(())
    }
}

/// Create an in-memory transport for `remote` on `hub`.
///
/// The URI host names the acceptor, e.g. `memory://broker-a`.
pub fn create_transport(remote: RemoteUri, hub: Arc<MemoryHub>) -> TransportPtr {
    // ---
    Arc::new(MemoryTransport {
        remote,
        hub,
        to_peer: Mutex::new(None),
    })
}
