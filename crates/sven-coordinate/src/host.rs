// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The seam between this crate and its external collaborators.
//!
//! `sven-coordinate` never depends on `sven-node`, `sven-channels`, or any
//! concrete chat-store/gateway crate — it takes `Arc<dyn Trait>` the same way
//! `sven-core::Agent` takes an `Arc<dyn sven_model::ModelProvider>` rather
//! than depending on a concrete provider. A host binary (`sven-node`'s HTTP/
//! websocket surface, or a `sven-channels` adapter) supplies the
//! implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::InboundRow;

/// Options for a gateway call.
#[derive(Debug, Clone, Default)]
pub struct GatewayCallOpts {
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub retries: Option<u32>,
}

/// The language-model gateway. Proposal generation uses a long-lived logical
/// session (via `session_id` in [`GatewayCallOpts`]) so context carries
/// across rounds; fast micro-proposal/reply calls use a per-call session to
/// avoid bleed. Neither distinction is semantic for the protocol — it only
/// affects resource bounds, which is why [`crate::semaphore::BoundedSemaphore`]
/// exists independently of this trait.
#[async_trait]
pub trait GatewayClient: Send + Sync {
    /// A full call with its own timeout and one retry at 2x on failure.
    /// Returns `None` if the call could not produce a result (generator
    /// failure — triggers fail-open in the engine).
    async fn call(&self, prompt: &str, timeout: Duration, opts: GatewayCallOpts) -> Option<String>;

    /// A cheap, stateless-per-call variant used for micro-proposals.
    async fn call_fast(&self, prompt: &str) -> Option<String>;
}

/// The chat backend: posting coordination records, sending plain outbound
/// text, and running the actual user-facing reply pipeline.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Best-effort; failures are logged, never propagated (§6).
    async fn post_coordination(&self, chat_id: &str, content: &str) -> anyhow::Result<()>;

    /// Best-effort plain send (used for layer-2 peer chat replies).
    async fn send_outbound(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;

    /// Runs the actual reply pipeline and returns the concatenated reply
    /// text (for `writeResponseSummary`).
    async fn dispatch_reply(&self, chat_id: &str, text: &str, user_id: &str) -> anyhow::Result<String>;
}

/// The durable `pending`/`handled` row store backing the safety-net poll and
/// cross-instance CAS dedup. The CAS claim is an optimization, not the hard
/// gate — [`crate::dedup::DedupWindow`] on `message_id` is.
#[async_trait]
pub trait DurableRowStore: Send + Sync {
    /// Attempt `update status='handled' where bot_id=self and message_id=m
    /// and status='pending'`. Returns `true` if this call won the race
    /// (i.e. the row was `pending` and is now `handled`), `false` if another
    /// path already claimed it.
    async fn claim(&self, bot_id: &str, message_id: &str) -> anyhow::Result<bool>;

    /// Bulk-mark every `pending` row created before `boot_time` as
    /// `handled` without ever invoking a callback for them.
    async fn bulk_mark_stale(&self, bot_id: &str, boot_time: DateTime<Utc>) -> anyhow::Result<()>;

    /// Scan for live `pending` rows addressed to `bot_id`.
    async fn poll_pending(&self, bot_id: &str) -> anyhow::Result<Vec<InboundRow>>;
}

/// A single coordination-stream record as read off the realtime transport,
/// already deserialized.
pub type CoordinationEnvelope = crate::types::CoordinationRecord;

/// A subscription to the per-agent dispatch stream: yields
/// [`crate::types::InboundDispatch`] as they arrive, and a one-shot signal
/// that fires when the subscription dies (reported to
/// [`crate::supervisor::ReconnectSupervisor`]).
pub struct DispatchSubscription {
    pub events: tokio::sync::mpsc::Receiver<crate::types::InboundDispatch>,
    pub died: tokio::sync::oneshot::Receiver<()>,
}

/// A subscription to the shared coordination stream.
pub struct CoordinationSubscription {
    pub records: tokio::sync::mpsc::Receiver<CoordinationEnvelope>,
    pub died: tokio::sync::oneshot::Receiver<()>,
}

/// Realtime subscribe primitives for the two durable streams.
#[async_trait]
pub trait CoordinationTransport: Send + Sync {
    async fn subscribe_dispatch(&self, agent_id: &str) -> anyhow::Result<DispatchSubscription>;
    async fn subscribe_coordination(&self) -> anyhow::Result<CoordinationSubscription>;
    /// Periodic no-op query to keep the upstream session warm.
    async fn health_check(&self) -> anyhow::Result<()>;
}

/// The response-summary sink (`writeResponseSummary`/`waitForResponseSummary`
/// plus the history-loader reads).
#[async_trait]
pub trait SummarySink: Send + Sync {
    async fn write_summary(
        &self,
        round_id: &str,
        speaker: &str,
        content: &str,
        source_chat_id: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Most recent summary matching `(round_id, speaker_name)`, if any.
    async fn find_summary(&self, round_id: &str, speaker_name: &str) -> anyhow::Result<Option<String>>;

    /// Agent names (other than `exclude`) that have written a summary for
    /// `source_chat_id`, used by `loadRecentPeerReplies` to discover peers.
    async fn known_agents(&self, source_chat_id: &str, exclude: &str) -> anyhow::Result<Vec<String>>;

    /// Up to `limit` most recent reply texts the given agent sent in
    /// `source_chat_id`.
    async fn recent_replies(&self, source_chat_id: &str, agent: &str, limit: usize) -> anyhow::Result<Vec<String>>;

    /// The last `limit` coordination records from the shared chat, most
    /// recent first, for `loadCoordinationHistory`.
    async fn recent_coordination_records(&self, limit: usize) -> anyhow::Result<Vec<CoordinationEnvelope>>;
}
