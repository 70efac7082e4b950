use std::collections::BTreeMap;

use crate::{AsyncResult, Operation};

/// What happens to a request while no provider is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflinePolicy {
    /// Keep it and replay it once a provider is connected.
    Hold,
    /// Complete it successfully; the remote side of the work is gone anyway.
    Succeed,
    /// Fail it with the connection error.
    Fail,
}

impl OfflinePolicy {
    /// Policy for one kind of operation.
    pub fn of(operation: &Operation) -> Self {
        // ---
        match operation {
            Operation::Destroy(_)
            | Operation::AcknowledgeSession(_)
            | Operation::AcknowledgeMessage(..)
            | Operation::Recover(_) => OfflinePolicy::Succeed,
            Operation::Commit(_) | Operation::Rollback(_) => OfflinePolicy::Fail,
            _ => OfflinePolicy::Hold,
        }
    }
}

/// A caller's request, tracked until it resolves.
pub(super) struct FailoverRequest {
    pub operation: Operation,
    /// The caller's token.
    pub watcher: AsyncResult,
    /// Provider generation the request was last run against.
    pub generation: Option<u64>,
}

impl FailoverRequest {
    pub fn policy(&self) -> OfflinePolicy {
        OfflinePolicy::of(&self.operation)
    }
}

/// Pending requests keyed by submission order.
///
/// Ids are assigned monotonically, so iterating the map replays requests in
/// the order callers submitted them.
pub(super) struct RequestTable {
    // ---
    next_id: u64,
    requests: BTreeMap<u64, FailoverRequest>,
}

impl RequestTable {
    // ---

    pub fn new() -> Self {
        Self {
            next_id: 0,
            requests: BTreeMap::new(),
        }
    }

    /// Track a new request and return its id.
    pub fn register(&mut self, operation: Operation, watcher: AsyncResult) -> u64 {
        // ---
        self.next_id += 1;
        let id = self.next_id;
        self.requests.insert(
            id,
            FailoverRequest {
                operation,
                watcher,
                generation: None,
            },
        );
        id
    }

    pub fn get(&self, id: u64) -> Option<&FailoverRequest> {
        self.requests.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut FailoverRequest> {
        self.requests.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<FailoverRequest> {
        self.requests.remove(&id)
    }

    /// Ids of all pending requests, oldest first.
    pub fn ids(&self) -> Vec<u64> {
        self.requests.keys().copied().collect()
    }

    /// Remove and return every pending request, oldest first.
    pub fn drain(&mut self) -> Vec<FailoverRequest> {
        std::mem::take(&mut self.requests).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}
