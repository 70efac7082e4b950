//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait, exposed only through constructor functions and the
//! in-memory hub types.
//!
//! Domain code must not depend on transport-specific types.

mod memory;
mod tcp;

use std::time::Duration;

use crate::{ProviderError, RemoteUri, Result, TransportPtr};

pub use memory::{
    //
    create_transport as create_memory_transport,
    MemoryAcceptor,
    MemoryHub,
    MemoryPeer,
    MemoryPeerControl,
};
pub use tcp::create_transport as create_tcp_transport;

/// Create the transport for `remote`.
///
/// `transport_type` overrides the URI scheme. `amqp` and `tcp` select TCP,
/// `memory` selects the process-wide [`MemoryHub`].
///
/// # Errors
///
/// Returns [`ProviderError::Config`] for unrecognized transport types.
pub fn create_transport(
    remote: &RemoteUri,
    transport_type: Option<&str>,
    connect_timeout: Option<Duration>,
) -> Result<TransportPtr> {
    // ---
    let kind = transport_type.unwrap_or_else(|| remote.scheme());

    match kind {
        "amqp" | "tcp" => Ok(create_tcp_transport(remote.clone(), connect_timeout)),
        "memory" => Ok(create_memory_transport(remote.clone(), MemoryHub::global())),
        other => Err(ProviderError::Config(format!(
            "unrecognized transport type: {other:?}"
        ))),
    }
}
