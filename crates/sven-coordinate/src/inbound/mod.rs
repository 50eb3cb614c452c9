// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turns a duplicative, possibly-missing event stream into an exactly-once
//! local handler invocation.
//!
//! Three delivery paths cooperate: a fast-path broadcast subscription, a 5s
//! safety-net poll over the durable row store ([`poll`]), and reconnection
//! handled by [`crate::supervisor::ReconnectSupervisor`] one level up. All
//! three funnel through [`ReliableInbound::dispatch_one`] so the at-most-once
//! dedup gate has exactly one code path (see the crate-level design notes).

mod poll;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::dedup::{content_key, DedupWindow};
use crate::host::{CoordinationTransport, DurableRowStore};
use crate::types::{CoordinationRecord, InboundDispatch};

/// Callbacks the reliable inbound layer drives. Implemented by the
/// `Coordinator` facade, forwarding into the dispatch holder and engine —
/// modeled as trait methods rather than boxed closures so they stay
/// `Send + 'static` across a reconnecting subscription loop without extra
/// boxing gymnastics, matching how `sven_model::ModelProvider` and
/// `sven_tools::Tool` are used elsewhere in the workspace.
#[async_trait]
pub trait CoordinationHandlers: Send + Sync {
    async fn on_dispatch(&self, dispatch: InboundDispatch);
    async fn on_coordination(&self, record: CoordinationRecord);
}

#[derive(Debug, Clone, Copy)]
pub struct InboundTiming {
    pub id_ttl: Duration,
    pub content_ttl: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
}

/// One (re)connectable run of the reliable inbound layer. A fresh instance
/// is created by [`crate::supervisor::ReconnectSupervisor`] for every
/// connect attempt; `id_window`/`content_window` are owned here, not shared
/// across reconnects, per the crate's single-actor-owns-state model — the
/// supervisor only ever has one `ReliableInbound` alive at a time.
pub struct ReliableInbound {
    bot_id: String,
    boot_time: DateTime<Utc>,
    transport: Arc<dyn CoordinationTransport>,
    store: Arc<dyn DurableRowStore>,
    handlers: Arc<dyn CoordinationHandlers>,
    timing: InboundTiming,
    id_window: DedupWindow,
    content_window: DedupWindow,
}

impl ReliableInbound {
    pub fn new(
        bot_id: impl Into<String>,
        boot_time: DateTime<Utc>,
        transport: Arc<dyn CoordinationTransport>,
        store: Arc<dyn DurableRowStore>,
        handlers: Arc<dyn CoordinationHandlers>,
        timing: InboundTiming,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            boot_time,
            transport,
            store,
            handlers,
            timing,
            id_window: DedupWindow::new(),
            content_window: DedupWindow::new(),
        }
    }

    /// The at-most-once hard gate (§9): `id_window.mark` before any
    /// callback invocation. If already present, returns without calling.
    /// Also gates on the short content-fingerprint window, which catches
    /// the same logical event re-inserted under a *different* message id.
    async fn dispatch_one(&mut self, dispatch: InboundDispatch) {
        if self.id_window.mark(dispatch.message_id.clone(), self.timing.id_ttl) {
            trace!(message_id = %dispatch.message_id, "inbound: duplicate id, dropping");
            return;
        }
        let ckey = content_key(&dispatch.chat_id, &dispatch.user_id, &dispatch.text);
        if self.content_window.mark(ckey, self.timing.content_ttl) {
            trace!(message_id = %dispatch.message_id, "inbound: duplicate content fingerprint, dropping");
            return;
        }
        debug!(message_id = %dispatch.message_id, chat_id = %dispatch.chat_id, "inbound: dispatching");
        self.handlers.on_dispatch(dispatch).await;
    }

    async fn run_poll_sweep(&mut self) {
        let rows = poll::sweep(&self.store, &self.bot_id, self.boot_time).await;
        for row in rows {
            self.dispatch_one(row.dispatch).await;
        }
    }

    /// Run until the fast-path subscription dies or `abort` fires. Returns
    /// `Ok(())` on a clean abort, `Err` if the subscription died and the
    /// caller (the supervisor) should reconnect.
    pub async fn run(mut self, abort: tokio_util::sync::CancellationToken) -> anyhow::Result<()> {
        if let Err(e) = self.store.bulk_mark_stale(&self.bot_id, self.boot_time).await {
            warn!(error = %e, "inbound: initial boot-time quarantine failed");
        }

        let mut dispatch_sub = self.transport.subscribe_dispatch(&self.bot_id).await?;
        let mut coord_sub = self.transport.subscribe_coordination().await?;

        let mut poll_timer = tokio::time::interval(self.timing.poll_interval);
        poll_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut health_timer = tokio::time::interval(self.timing.health_interval);
        health_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    debug!("inbound: abort requested, exiting cleanly");
                    return Ok(());
                }
                _ = &mut dispatch_sub.died => {
                    warn!("inbound: dispatch subscription died, signalling reconnect");
                    anyhow::bail!("dispatch subscription died");
                }
                _ = &mut coord_sub.died => {
                    warn!("inbound: coordination subscription died, signalling reconnect");
                    anyhow::bail!("coordination subscription died");
                }
                maybe_dispatch = dispatch_sub.events.recv() => {
                    match maybe_dispatch {
                        Some(d) => self.dispatch_one(d).await,
                        None => anyhow::bail!("dispatch channel closed"),
                    }
                }
                maybe_record = coord_sub.records.recv() => {
                    match maybe_record {
                        Some(rec) => self.handlers.on_coordination(rec).await,
                        None => anyhow::bail!("coordination channel closed"),
                    }
                }
                _ = poll_timer.tick() => self.run_poll_sweep().await,
                _ = health_timer.tick() => {
                    if let Err(e) = self.transport.health_check().await {
                        warn!(error = %e, "inbound: health check failed");
                    }
                }
            }
        }
    }
}
