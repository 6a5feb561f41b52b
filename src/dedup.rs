//! Per-task duplicate detection.
//!
//! Bounded, time-windowed set of content fingerprints. Insertion order is
//! kept in a `VecDeque` so both eviction paths (capacity and retention) pop
//! from the front in O(1).

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::pipeline::types::OutboundMessage;

/// What a fingerprint covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// Transformed text plus media kind and file id. Reposts of the same
    /// content are duplicates.
    #[default]
    Content,
    /// Source chat and message id. Only redelivery of the same event is a
    /// duplicate.
    SourceMessage,
}

/// Stable SHA-256 fingerprint of an outbound payload.
pub fn fingerprint(scope: DedupScope, message: &OutboundMessage) -> String {
    let mut hasher = Sha256::new();
    match scope {
        DedupScope::Content => {
            hasher.update(b"content\0");
            match &message.media {
                Some(media) => {
                    hasher.update(media.kind.to_string().as_bytes());
                    hasher.update(b"\0");
                    hasher.update(media.file_id.as_bytes());
                }
                None => hasher.update(b"text"),
            }
            hasher.update(b"\0");
            hasher.update(message.body().as_bytes());
        }
        DedupScope::SourceMessage => {
            hasher.update(b"source\0");
            hasher.update(message.source_id.to_be_bytes());
            hasher.update(message.source_message_id.to_be_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

/// Recency-evicted fingerprint set with a retention window.
#[derive(Debug)]
pub struct DeduplicationCache {
    capacity: usize,
    retention: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DeduplicationCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            retention,
            seen: HashMap::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Returns `true` if `fp` was seen within the retention window. A fresh
    /// fingerprint is recorded; a duplicate is not re-inserted, so its window
    /// still runs from the first sighting.
    pub fn check_and_insert(&mut self, fp: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(fp) {
            return true;
        }
        while self.order.len() >= self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.seen.insert(fp.to_string(), now);
        self.order.push_back((fp.to_string(), now));
        false
    }

    /// Check without recording.
    pub fn contains(&self, fp: &str, now: Instant) -> bool {
        self.seen
            .get(fp)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.retention)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.retention {
                break;
            }
            if let Some((fp, _)) = self.order.pop_front() {
                self.seen.remove(&fp);
            }
        }
    }
}
