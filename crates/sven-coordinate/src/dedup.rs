// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded-TTL "seen once" set.
//!
//! This is the hard at-most-once gate for inbound dispatch (see
//! [`crate::inbound`]) and the mark-dispatched guard in
//! [`crate::holder::DispatchHolder`]. It runs inside the coordinator's single
//! actor task (see the crate-level concurrency notes), so `mark` needs no
//! internal locking — the atomicity the protocol relies on comes from there
//! being exactly one caller at a time, not from this type.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// A bounded set of keys, each valid until its own expiry.
///
/// Expired entries are swept lazily: a stale entry is only removed when
/// `mark` happens to touch that exact key, or during the occasional full
/// [`DedupWindow::sweep`] call. Given the short TTLs involved (seconds to a
/// few minutes) and the modest key population this protocol produces, a
/// background sweeper would add a task for no measurable benefit.
#[derive(Debug, Default)]
pub struct DedupWindow {
    entries: HashMap<String, Instant>,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// Atomic check-and-insert: returns `true` if `key` was already present
    /// (and still live), `false` if this is the first time it's been seen
    /// (or its previous mark has expired).  Either way, `key` is now marked
    /// live until `now + ttl`.
    pub fn mark(&mut self, key: impl Into<String>, ttl: Duration) -> bool {
        let key = key.into();
        let now = Instant::now();
        let was_present = match self.entries.get(&key) {
            Some(expiry) => *expiry > now,
            None => false,
        };
        self.entries.insert(key, now + ttl);
        was_present
    }

    /// Non-mutating check: is `key` currently marked and still live? Unlike
    /// `mark`, never writes to the map, so it's safe to use as a peek
    /// without disturbing an existing entry's expiry.
    pub fn contains(&self, key: &str) -> bool {
        matches!(self.entries.get(key), Some(expiry) if *expiry > Instant::now())
    }

    /// Drop all expired entries. Not required for correctness — `mark`
    /// already treats an expired entry as absent — but keeps the map from
    /// growing unbounded across a long-lived process.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build the content-dedup key for an inbound user message: `chat_id|user_id|`
/// plus the first 80 characters of the text. Catches duplicate row inserts
/// that arrive under a different message id (observed ~8ms apart upstream).
pub fn content_key(chat_id: &str, user_id: &str, text: &str) -> String {
    let prefix: String = text.chars().take(80).collect();
    format!("{chat_id}|{user_id}|{prefix}")
}
