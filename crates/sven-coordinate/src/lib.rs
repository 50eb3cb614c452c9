// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-agent negotiation and dispatch coordination sidecar for multi-agent
//! sven teams.
//!
//! When two or more instances of the same bot co-inhabit a chat, an
//! uncoordinated reply to every inbound message produces duplicate or
//! clashing responses. This crate arbitrates: on each trigger, both
//! instances silently propose a one-line self-assessment, a pure
//! deterministic filter (see [`filter`]) picks a winner (or lets both reply
//! on genuinely disjoint angles, or sequences a synthesis), and the loser's
//! original reply is either dropped, delayed, or rewritten with context
//! before being dispatched. None of this is visible to the end user beyond
//! the eventual reply text.
//!
//! # Concurrency model
//!
//! Exactly one [`Coordinator`] actor task owns all mutable state — the round
//! store (inside [`engine::Engine`]), the held-dispatch map and dedup window
//! (inside [`holder::DispatchHolder`]), and the advisory register (inside
//! the engine). Every external caller talks to it through a cheap-clone
//! [`CoordinatorHandle`] backed by an `mpsc` channel, mirroring how
//! `sven-core`'s agent loop keeps its own state single-owner and pushes
//! cross-task communication through channels rather than locks.
//!
//! Timers (round deadline, backstop, defer-backstop, synthesis wait) are
//! armed as plain spawned sleeps that post a message back onto the same
//! channel when they fire. Every fire-side handler
//! ([`engine::Engine::round_deadline`], [`holder::DispatchHolder::fire_backstop`],
//! etc.) is already idempotent against a stale timer racing a decision that
//! arrived first, so no cancellation bookkeeping is needed for correctness —
//! a timer that fires after its message was already handled is just a no-op.

mod config;
mod dedup;
mod engine;
mod error;
mod filter;
mod history;
mod holder;
mod host;
mod inbound;
mod register;
mod round_store;
mod semaphore;
mod supervisor;
#[cfg(test)]
mod tests;
mod types;

pub use config::RuntimeConfig;
pub use error::CoordinateError;
pub use filter::FilterThresholds;
pub use history::HistoryLimits;
pub use host::{
    ChatBackend, CoordinationEnvelope, CoordinationTransport, CoordinationSubscription,
    DispatchSubscription, DurableRowStore, GatewayCallOpts, GatewayClient, SummarySink,
};
pub use round_store::Phase as RoundPhase;
pub use supervisor::BackoffConfig;
pub use types::{
    CoordinationKind, CoordinationRecord, DispatchDecision, FilterResult, InboundDispatch,
    InboundRow, MicroProposal, Mode, PeerChatFields, RegisterState, WaitForResponse,
    ACCEPTED_PROTOCOLS,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::history;

use engine::{Engine, EngineEffect};
use holder::{DispatchHolder, HolderEffect};
use inbound::{CoordinationHandlers, InboundTiming};
use supervisor::ReconnectSupervisor;

/// One unit of work for the actor loop. Not public: everything reaches the
/// actor through [`CoordinatorHandle`]'s typed methods.
enum ActorMessage {
    Dispatch(InboundDispatch),
    Coordination(CoordinationRecord),
    RoundDeadline(String),
    Backstop(String),
    DeferBackstop(String),
    /// The off-loop synthesis-wait poll (spawned by `spawn_holder_timer`)
    /// has completed, with or without finding the winner's summary.
    SynthesisResolved { message_id: String, round_id: String, winner_name: String, found: Option<String> },
    /// A user message addressed with `@name` to a specific instance,
    /// bypassing coordination entirely (§7's hard routing rule).
    Bypass { message_id: String, chat_id: String, text: String, user_id: String },
    RecordResponse { agent: String, angle: String },
    ReadRegister(oneshot::Sender<RegisterState>),
}

/// Cheap-clone front door to a running [`Coordinator`] actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<ActorMessage>,
}

impl CoordinatorHandle {
    /// The `@name` hard routing bypass: dispatch immediately, skipping
    /// coordination.
    pub async fn bypass(&self, message_id: impl Into<String>, chat_id: impl Into<String>, text: impl Into<String>, user_id: impl Into<String>) -> Result<(), CoordinateError> {
        self.tx
            .send(ActorMessage::Bypass { message_id: message_id.into(), chat_id: chat_id.into(), text: text.into(), user_id: user_id.into() })
            .await
            .map_err(|_| CoordinateError::ActorGone)
    }

    /// Record that `agent` actually replied with `angle`, updating the
    /// advisory per-chat register used to enrich future proposal prompts.
    pub async fn record_response(&self, agent: impl Into<String>, angle: impl Into<String>) -> Result<(), CoordinateError> {
        self.tx
            .send(ActorMessage::RecordResponse { agent: agent.into(), angle: angle.into() })
            .await
            .map_err(|_| CoordinateError::ActorGone)
    }

    /// Snapshot of the advisory register, for diagnostics/tests.
    pub async fn register(&self) -> Result<RegisterState, CoordinateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(ActorMessage::ReadRegister(reply_tx)).await.map_err(|_| CoordinateError::ActorGone)?;
        reply_rx.await.map_err(|_| CoordinateError::ActorGone)
    }
}

#[async_trait]
impl CoordinationHandlers for CoordinatorHandle {
    async fn on_dispatch(&self, dispatch: InboundDispatch) {
        if self.tx.send(ActorMessage::Dispatch(dispatch)).await.is_err() {
            warn!("coordinator: actor gone, dropping dispatch");
        }
    }

    async fn on_coordination(&self, record: CoordinationRecord) {
        if self.tx.send(ActorMessage::Coordination(record)).await.is_err() {
            warn!("coordinator: actor gone, dropping coordination record");
        }
    }
}

/// Owns the engine and holder; runs as a single task so neither ever needs
/// internal locking. Constructed via [`Coordinator::spawn`].
struct Coordinator {
    engine: Engine,
    holder: DispatchHolder,
    cfg: RuntimeConfig,
    chat: Arc<dyn ChatBackend>,
    self_tx: mpsc::Sender<ActorMessage>,
}

impl Coordinator {
    /// Builds the engine/holder pair and the host-facing handle, but does
    /// not start the inbound layer or its own actor loop — see [`spawn`]
    /// for wiring both up together.
    fn new(
        my_name: impl Into<String>,
        cfg: RuntimeConfig,
        gateway: Arc<dyn GatewayClient>,
        chat: Arc<dyn ChatBackend>,
        summary: Arc<dyn SummarySink>,
    ) -> (Self, CoordinatorHandle, mpsc::Receiver<ActorMessage>) {
        let my_name = my_name.into();
        let engine = Engine::new(my_name.clone(), cfg.clone(), gateway, chat.clone(), summary.clone());
        let holder = DispatchHolder::new(
            my_name,
            chat.clone(),
            summary,
            cfg.history,
            cfg.backstop,
            cfg.defer_backstop,
            cfg.synthesis_wait,
            cfg.mark_dispatched_ttl,
        );
        let (tx, rx) = mpsc::channel(256);
        let coordinator = Coordinator { engine, holder, cfg, chat, self_tx: tx.clone() };
        (coordinator, CoordinatorHandle { tx }, rx)
    }

    /// The actor loop: processes messages until every sender (all
    /// `CoordinatorHandle` clones plus the internal timer tasks) has been
    /// dropped, or `abort` fires.
    async fn run(mut self, mut rx: mpsc::Receiver<ActorMessage>, abort: CancellationToken) {
        loop {
            let msg = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    self.engine.shutdown();
                    return;
                }
                msg = rx.recv() => msg,
            };
            let Some(msg) = msg else {
                self.engine.shutdown();
                return;
            };
            self.handle(msg).await;
        }
    }

    async fn handle(&mut self, msg: ActorMessage) {
        match msg {
            ActorMessage::Dispatch(d) => self.on_user_dispatch(d).await,
            ActorMessage::Coordination(rec) => self.on_coordination_record(rec).await,
            ActorMessage::RoundDeadline(round_id) => {
                let effect = self.engine.round_deadline(&round_id);
                self.apply_engine_effect(effect).await;
            }
            ActorMessage::Backstop(message_id) => {
                let effect = self.holder.fire_backstop(&message_id);
                self.apply_holder_effect(effect).await;
            }
            ActorMessage::DeferBackstop(message_id) => {
                let effect = self.holder.fire_defer_backstop(&message_id);
                self.apply_holder_effect(effect).await;
            }
            ActorMessage::SynthesisResolved { message_id, round_id, winner_name, found } => {
                let effect = self.holder.resolve_synthesis_wait(&message_id, &round_id, &winner_name, found);
                self.apply_holder_effect(effect).await;
            }
            ActorMessage::Bypass { message_id, chat_id, text, user_id } => {
                let effect = self.holder.bypass(&message_id, &chat_id, &text, &user_id);
                self.apply_holder_effect(effect).await;
            }
            ActorMessage::RecordResponse { agent, angle } => {
                self.engine.record_response(&agent, &angle);
            }
            ActorMessage::ReadRegister(reply) => {
                let _ = reply.send(self.engine.register().clone());
            }
        }
    }

    /// A fresh, deduplicated user message. Holds it immediately, then starts
    /// the round (or, if a round is already in flight for this chat's
    /// layer-2 traffic, routes it to the engine's peer-chat path instead —
    /// only user-triggered dispatch goes through the holder).
    async fn on_user_dispatch(&mut self, d: InboundDispatch) {
        let effect = self.holder.hold(&d.message_id, &d.chat_id, &d.text, &d.user_id);
        self.apply_holder_effect(effect).await;

        let round_id = d.message_id.clone();
        let effect = self.engine.round_start(&round_id, &d.text, Some(d.chat_id.clone())).await;
        self.arm_round_deadline(round_id);
        self.apply_engine_effect(effect).await;
    }

    async fn on_coordination_record(&mut self, rec: CoordinationRecord) {
        if !ACCEPTED_PROTOCOLS.contains(&rec.protocol.as_str()) {
            trace!(protocol = %rec.protocol, "coordinator: unrecognized protocol version, dropping");
            return;
        }
        // Never process a record this instance itself authored.
        if rec.from.as_deref() == Some(self.engine.my_name()) {
            return;
        }
        let Some(round_id) = rec.round_id.clone() else {
            // Layer-2 peer chat kinds never carry a round_id.
            if let Some(fields) = rec.kind.peer_chat_fields() {
                let speaker = rec.from.clone().unwrap_or_default();
                let effect = self.engine.peer_chat(&speaker, rec.source_chat_id.as_deref().unwrap_or_default(), fields).await;
                self.apply_engine_effect(effect).await;
            }
            return;
        };
        match &rec.kind {
            CoordinationKind::MicroPropose { proposal } => {
                let Some(other_name) = rec.from.clone() else {
                    trace!(round_id, "coordinator: micro_propose record with no author, dropping");
                    return;
                };
                let effect = self.engine.peer_micro_propose(&round_id, &other_name, proposal.clone()).await;
                self.apply_engine_effect(effect).await;
            }
            CoordinationKind::RoundStart { .. } => {
                // Our own round_start echoing back off the shared stream, or
                // a peer's independent trigger for the same user message —
                // either way `round_start` is naturally idempotent per I1.
            }
            CoordinationKind::Resolved { .. } => {
                // Informational for any third observer; this instance's own
                // resolution already happened inside `resolve`.
            }
            other => {
                if let Some(fields) = other.peer_chat_fields() {
                    let speaker = rec.from.clone().unwrap_or_default();
                    let effect = self.engine.peer_chat(&speaker, rec.source_chat_id.as_deref().unwrap_or_default(), fields).await;
                    self.apply_engine_effect(effect).await;
                }
            }
        }
    }

    async fn apply_engine_effect(&mut self, effect: EngineEffect) {
        if let EngineEffect::Decision(decision) = effect {
            let holder_effect = self.holder.apply_decision(&decision);
            self.apply_holder_effect(holder_effect).await;
        }
    }

    async fn apply_holder_effect(&mut self, effect: HolderEffect) {
        match effect {
            HolderEffect::None => {}
            HolderEffect::DispatchNow { chat_id, text, user_id, angle, round_id } => {
                match self.chat.dispatch_reply(&chat_id, &text, &user_id).await {
                    Ok(response) => {
                        if let Some(angle) = angle {
                            let my_name = self.engine.my_name().to_string();
                            self.engine.record_response(&my_name, &angle);
                        }
                        if let Some(round_id) = round_id {
                            self.holder.record_dispatch_summary(&round_id, &response, &chat_id).await;
                        }
                    }
                    Err(e) => warn!(chat_id, error = %e, "coordinator: dispatch_reply failed"),
                }
            }
            other => self.spawn_holder_timer(other, self.self_tx.clone()),
        }
    }

    /// Arms whichever timer a [`HolderEffect`] requests by spawning a sleep
    /// that posts the corresponding fire-message back onto the actor
    /// channel. A stale timer racing an already-applied decision is handled
    /// by the fire-side handlers being idempotent, so no cancellation is
    /// threaded through here.
    fn spawn_holder_timer(&self, effect: HolderEffect, tx: mpsc::Sender<ActorMessage>) {
        match effect {
            HolderEffect::None | HolderEffect::DispatchNow { .. } => {}
            HolderEffect::ArmBackstop { message_id, after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ActorMessage::Backstop(message_id)).await;
                });
            }
            HolderEffect::ArmDeferBackstop { message_id, after } => {
                tokio::spawn(async move {
                    tokio::time::sleep(after).await;
                    let _ = tx.send(ActorMessage::DeferBackstop(message_id)).await;
                });
            }
            HolderEffect::ArmSynthesisWait { message_id, round_id, winner_name, timeout, summary, limits } => {
                // Runs the up-to-15s poll on its own task rather than inline
                // in `handle`, so the actor keeps processing other messages
                // (dispatches, coordination records, round deadlines) while
                // this round's synthesis wait is outstanding.
                tokio::spawn(async move {
                    let found = history::wait_for_response_summary(&summary, &round_id, &winner_name, timeout, limits).await;
                    let _ = tx.send(ActorMessage::SynthesisResolved { message_id, round_id, winner_name, found }).await;
                });
            }
        }
    }

    /// Arms the round-deadline timer for a just-started round, using the
    /// configured max round duration.
    fn arm_round_deadline(&self, round_id: String) {
        let tx = self.self_tx.clone();
        let after = self.cfg.max_round;
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(ActorMessage::RoundDeadline(round_id)).await;
        });
    }
}

/// Spawns the full coordination sidecar for one bot instance: the actor
/// loop and a [`supervisor::ReconnectSupervisor`] driving the reliable
/// inbound layer into it. Returns the handle other code uses to feed
/// `@name`-bypassed messages and response notifications in, plus a
/// [`oneshot::Receiver`] that resolves once both background tasks have
/// exited (on `abort`).
pub fn spawn(
    bot_id: impl Into<String>,
    my_name: impl Into<String>,
    cfg: RuntimeConfig,
    gateway: Arc<dyn GatewayClient>,
    chat: Arc<dyn ChatBackend>,
    summary: Arc<dyn SummarySink>,
    transport: Arc<dyn CoordinationTransport>,
    store: Arc<dyn DurableRowStore>,
    abort: CancellationToken,
) -> CoordinatorHandle {
    let (coordinator, handle, rx) = Coordinator::new(my_name, cfg.clone(), gateway, chat, summary);

    let timing = InboundTiming {
        id_ttl: cfg.dedup_id_ttl,
        content_ttl: cfg.dedup_content_ttl,
        poll_interval: cfg.poll_interval,
        health_interval: cfg.health_interval,
    };
    let supervisor_handlers: Arc<dyn CoordinationHandlers> = Arc::new(handle.clone());
    let supervisor = ReconnectSupervisor::new(bot_id, Utc::now(), transport, store, supervisor_handlers, timing, cfg.backoff);

    let actor_abort = abort.clone();
    tokio::spawn(coordinator.run(rx, actor_abort));
    tokio::spawn(async move { supervisor.run(abort).await });

    handle
}
