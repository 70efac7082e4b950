// src/domain/resource.rs

//! Resource identifiers and descriptors.
//!
//! Every messaging object a client works with (connection, session,
//! producer, consumer, destination, transaction) is described by an info
//! struct carrying its id and creation options. Providers receive these
//! descriptors through [`Operation`](crate::Operation)s and keep their own
//! runtime state keyed by the ids.
//!
//! Ids form a hierarchy: a session id embeds its connection id, and producer
//! and consumer ids embed their session id. Lookups therefore never need a
//! back-pointer from child to parent.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use crate::async_result::lock_ignore_poison;
use crate::ConnectionTimeouts;

/// Identifier of a client connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Arc<str>);

impl ConnectionId {
    /// Generate a fresh, globally unique id.
    pub fn generate() -> Self {
        // ---
        ConnectionId(format!("ID:{}", uuid::Uuid::new_v4()).into())
    }

    /// The id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for ConnectionId
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        ConnectionId(value.into())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a session within a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    connection: ConnectionId,
    value: u64,
}

impl SessionId {
    pub fn new(connection: ConnectionId, value: u64) -> Self {
        Self { connection, value }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection, self.value)
    }
}

/// Provider-private lookup slot cached on a producer or consumer id.
///
/// A provider stores where it keeps the runtime object for an id so later
/// operations skip the session walk. The key carries the provider instance
/// and connection epoch that populated it; a provider only trusts keys that
/// match its own, so hints left behind by a torn-down connection or by a
/// different provider are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct HintKey {
    pub provider: u64,
    pub epoch: u64,
    pub slot: u64,
}

/// Interior-mutable holder for a [`HintKey`].
///
/// Clones share the same cell, so a hint set through one copy of an id is
/// visible through every other copy.
#[derive(Clone, Default)]
pub struct ProviderHint(Arc<Mutex<Option<HintKey>>>);

impl ProviderHint {
    // ---

    pub(crate) fn get(&self) -> Option<HintKey> {
        *lock_ignore_poison(&self.0)
    }

    pub(crate) fn set(&self, key: HintKey) {
        *lock_ignore_poison(&self.0) = Some(key);
    }

    pub(crate) fn clear(&self) {
        *lock_ignore_poison(&self.0) = None;
    }

    /// Whether some provider has populated this hint.
    pub fn is_set(&self) -> bool {
        self.get().is_some()
    }
}

impl fmt::Debug for ProviderHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProviderHint({:?})", self.get())
    }
}

macro_rules! link_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        ///
        /// Equality and hashing ignore the provider hint.
        #[derive(Clone, Debug)]
        pub struct $name {
            session: SessionId,
            value: u64,
            hint: ProviderHint,
        }

        impl $name {
            pub fn new(session: SessionId, value: u64) -> Self {
                Self {
                    session,
                    value,
                    hint: ProviderHint::default(),
                }
            }

            pub fn session(&self) -> &SessionId {
                &self.session
            }

            pub fn value(&self) -> u64 {
                self.value
            }

            pub fn hint(&self) -> &ProviderHint {
                &self.hint
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.session == other.session && self.value == other.value
            }
        }

        impl Eq for $name {}

        impl Hash for $name {
            fn hash<H: Hasher>(&self, state: &mut H) {
                self.session.hash(state);
                self.value.hash(state);
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}:{}", self.session, self.value)
            }
        }
    };
}

link_id!(
    /// Identifier of a producer within a session.
    ProducerId
);

link_id!(
    /// Identifier of a consumer within a session.
    ConsumerId
);

/// Identifier of a local transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId {
    connection: ConnectionId,
    value: u64,
}

impl TransactionId {
    pub fn new(connection: ConnectionId, value: u64) -> Self {
        Self { connection, value }
    }

    pub fn value(&self) -> u64 {
        self.value
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TX:{}:{}", self.connection, self.value)
    }
}

/// Kind of messaging destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
    TemporaryQueue,
    TemporaryTopic,
}

/// A named destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Destination {
    pub name: Arc<str>,
    pub kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn temporary_queue(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::TemporaryQueue,
        }
    }

    /// Temporary destinations are created and destroyed on the broker.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self.kind,
            DestinationKind::TemporaryQueue | DestinationKind::TemporaryTopic
        )
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Session acknowledgement mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    DupsOk,
    Individual,
    Transacted,
}

/// Connection descriptor.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeouts: ConnectionTimeouts,
}

impl ConnectionInfo {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            client_id: None,
            username: None,
            password: None,
            timeouts: ConnectionTimeouts::default(),
        }
    }
}

/// Session descriptor.
#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: SessionId,
    pub ack_mode: AckMode,
}

impl SessionInfo {
    pub fn new(id: SessionId, ack_mode: AckMode) -> Self {
        Self { id, ack_mode }
    }
}

/// Producer descriptor. A producer without a destination is anonymous.
#[derive(Clone, Debug)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub destination: Option<Destination>,
}

/// Consumer descriptor.
#[derive(Clone, Debug)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub destination: Destination,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
    pub prefetch: u32,
    pub no_local: bool,
    pub browser: bool,
}

impl ConsumerInfo {
    pub fn new(id: ConsumerId, destination: Destination) -> Self {
        Self {
            id,
            destination,
            selector: None,
            subscription_name: None,
            prefetch: 1000,
            no_local: false,
            browser: false,
        }
    }
}

/// Transaction descriptor.
#[derive(Clone, Debug)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub session_id: SessionId,
}

/// Any resource a provider can create, start, stop or destroy.
#[derive(Clone, Debug)]
pub enum Resource {
    Connection(ConnectionInfo),
    Session(SessionInfo),
    Producer(ProducerInfo),
    Consumer(ConsumerInfo),
    Destination(Destination),
    Transaction(TransactionInfo),
}

impl Resource {
    /// Whether this is the connection descriptor.
    pub fn is_connection(&self) -> bool {
        matches!(self, Resource::Connection(_))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Connection(info) => write!(f, "connection {}", info.id),
            Resource::Session(info) => write!(f, "session {}", info.id),
            Resource::Producer(info) => write!(f, "producer {}", info.id),
            Resource::Consumer(info) => write!(f, "consumer {}", info.id),
            Resource::Destination(dest) => write!(f, "destination {dest}"),
            Resource::Transaction(info) => write!(f, "transaction {}", info.id),
        }
    }
}

macro_rules! resource_from {
    ($($info:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$info> for Resource {
                fn from(info: $info) -> Self {
                    Resource::$variant(info)
                }
            }
        )*
    };
}

resource_from!(
    ConnectionInfo => Connection,
    SessionInfo => Session,
    ProducerInfo => Producer,
    ConsumerInfo => Consumer,
    Destination => Destination,
    TransactionInfo => Transaction,
);
