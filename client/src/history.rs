//! Bounded exchange history for the inspector.
//!
//! Entries are kept newest first in a fixed-capacity deque. Each entry is
//! stamped with a monotonically increasing insertion sequence, and an
//! id→sequence index turns a sequence back into a deque position in O(1):
//! the newest entry has sequence `next_seq - 1` and sits at position 0.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use relaytap_shared::protocol::{Headers, TunnelRequest};
use serde::{Serialize, Serializer};

/// Default number of exchanges kept
pub const MAX_ENTRIES: usize = 500;

/// A relayed request paired with its (possibly pending) outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectedExchange {
    pub id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    #[serde(serialize_with = "lossy_body")]
    pub body: Option<Vec<u8>>,
    pub is_replay: bool,
    pub received_at: DateTime<Utc>,
    pub outcome: Option<ExchangeOutcome>,
}

/// What the local service answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExchangeOutcome {
    pub status: u16,
    pub headers: Headers,
    #[serde(serialize_with = "lossy_body")]
    pub body: Option<Vec<u8>>,
    pub duration_ms: u64,
}

impl InspectedExchange {
    pub fn from_request(request: &TunnelRequest) -> Self {
        Self {
            id: request.request_id.clone(),
            method: request.method.clone(),
            path: request.path.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            is_replay: request.is_replay,
            received_at: Utc::now(),
            outcome: None,
        }
    }

    /// Rebuild the recorded request under a new id, flagged as a replay
    pub fn to_replay(&self, request_id: String) -> TunnelRequest {
        TunnelRequest {
            request_id,
            method: self.method.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            is_replay: true,
        }
    }
}

fn lossy_body<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match body {
        Some(bytes) => serializer.serialize_str(&String::from_utf8_lossy(bytes)),
        None => serializer.serialize_none(),
    }
}

/// Newest-first ring of exchanges with O(1) lookup by id
#[derive(Debug)]
pub struct History {
    entries: VecDeque<InspectedExchange>,
    index: HashMap<String, u64>,
    next_seq: u64,
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            next_seq: 0,
            capacity,
        }
    }

    /// Insert at the front, returning the evicted oldest entry if full
    pub fn insert(&mut self, exchange: InspectedExchange) -> Option<InspectedExchange> {
        let evicted = if self.entries.len() == self.capacity {
            let oldest_seq = self.next_seq - self.entries.len() as u64;
            let oldest = self.entries.pop_back();
            if let Some(oldest) = &oldest {
                // A later insert may have reused the id
                if self.index.get(&oldest.id) == Some(&oldest_seq) {
                    self.index.remove(&oldest.id);
                }
            }
            oldest
        } else {
            None
        };

        self.index.insert(exchange.id.clone(), self.next_seq);
        self.entries.push_front(exchange);
        self.next_seq += 1;
        evicted
    }

    pub fn get(&self, id: &str) -> Option<&InspectedExchange> {
        let pos = self.position(id)?;
        self.entries.get(pos)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InspectedExchange> {
        let pos = self.position(id)?;
        self.entries.get_mut(pos)
    }

    fn position(&self, id: &str) -> Option<usize> {
        let seq = *self.index.get(id)?;
        Some((self.next_seq - 1 - seq) as usize)
    }

    /// Copy of all entries, newest first
    pub fn snapshot(&self) -> Vec<InspectedExchange> {
        self.entries.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(MAX_ENTRIES)
    }
}
