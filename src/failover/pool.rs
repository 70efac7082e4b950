//! Candidate endpoints for the failover orchestrator.

use rand::seq::SliceRandom;

use crate::RemoteUri;

/// Round-robin pool of remote URIs.
///
/// With `randomize` set the order is reshuffled at the start of every pass.
/// At most one entry is marked as the currently connected endpoint.
#[derive(Debug, Clone)]
pub struct EndpointPool {
    uris: Vec<RemoteUri>,
    randomize: bool,
    cursor: usize,
    connected: Option<RemoteUri>,
}

impl EndpointPool {
    // ---

    /// Build a pool; duplicate URIs are dropped.
    pub fn new(uris: impl IntoIterator<Item = RemoteUri>, randomize: bool) -> Self {
        // ---
        let mut pool = Self {
            uris: Vec::new(),
            randomize,
            cursor: 0,
            connected: None,
        };
        for uri in uris {
            pool.add(uri);
        }
        pool
    }

    /// Next candidate, or `None` if the pool is empty.
    pub fn next(&mut self) -> Option<RemoteUri> {
        // ---
        if self.uris.is_empty() {
            return None;
        }

        if self.cursor == 0 && self.randomize {
            self.uris.shuffle(&mut rand::rng());
        }

        let uri = self.uris[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.uris.len();
        Some(uri)
    }

    /// Record `uri` as the live endpoint.
    pub fn mark_connected(&mut self, uri: &RemoteUri) {
        self.connected = Some(uri.clone());
    }

    pub fn clear_connected(&mut self) {
        self.connected = None;
    }

    pub fn connected(&self) -> Option<&RemoteUri> {
        self.connected.as_ref()
    }

    /// Add `uri` unless already present. Returns whether it was added.
    pub fn add(&mut self, uri: RemoteUri) -> bool {
        // ---
        if self.uris.contains(&uri) {
            return false;
        }
        self.uris.push(uri);
        true
    }

    /// Remove `uri`. Returns whether it was present.
    pub fn remove(&mut self, uri: &RemoteUri) -> bool {
        // ---
        let Some(index) = self.uris.iter().position(|candidate| candidate == uri) else {
            return false;
        };

        self.uris.remove(index);
        if index < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.uris.len() {
            self.cursor = 0;
        }
        if self.connected.as_ref() == Some(uri) {
            self.connected = None;
        }
        true
    }

    pub fn contains(&self, uri: &RemoteUri) -> bool {
        self.uris.contains(uri)
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    pub fn uris(&self) -> &[RemoteUri] {
        &self.uris
    }
}
