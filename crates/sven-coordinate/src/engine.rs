// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The round state machine: consumes coordination events, drives proposal
//! generation, runs the filter once both proposals are present, and raises
//! [`DispatchDecision`]s to the [`crate::holder::DispatchHolder`].
//!
//! Owned and driven exclusively by the `Coordinator` actor task (see
//! `lib.rs`) — never behind a lock. Every `.await` point here is bracketed
//! by a re-check of round existence/`resolved` before continuing, the same
//! re-check-after-yield discipline `sven-core`'s agent tool loop uses after
//! each model round.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::RuntimeConfig;
use crate::dedup::DedupWindow;
use crate::filter;
use crate::history;
use crate::host::{ChatBackend, GatewayCallOpts, GatewayClient, SummarySink};
use crate::register;
use crate::round_store::{RoundState, RoundStore};
use crate::semaphore::{Acquire, BoundedSemaphore};
use crate::types::{
    CoordinationKind, CoordinationRecord, DispatchDecision, MicroProposal, Mode, PeerChatFields,
    RegisterState, WaitForResponse, ACCEPTED_PROTOCOLS,
};

/// Builds the proposal-generation prompt. Kept as a free function so it's
/// easy to unit-test the text shape without standing up a whole engine.
fn proposal_prompt(trigger_content: &str, coord_history: &str, recent_peer_replies: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("A user message arrived in a shared chat you co-inhabit with another agent.\n");
    prompt.push_str("Produce a brief self-assessment as JSON: {angle, confidence, covers, solo_sufficient, builds_on_other}.\n\n");
    if !coord_history.is_empty() {
        prompt.push_str("Recent coordination history:\n");
        prompt.push_str(coord_history);
        prompt.push('\n');
    }
    if !recent_peer_replies.is_empty() {
        prompt.push_str("Recent peer replies:\n");
        prompt.push_str(recent_peer_replies);
        prompt.push('\n');
    }
    prompt.push_str("Message: ");
    prompt.push_str(trigger_content);
    prompt
}

fn parse_proposal(raw: &str) -> Option<MicroProposal> {
    serde_json::from_str(raw).ok()
}

/// Result of processing one inbound event, handed back to the `Coordinator`
/// actor so it can drive the holder. Outbound coordination records and
/// peer-chat replies are posted directly from inside the engine via `chat`
/// (matching the spec's framing of `postCoordination` as a host-provided
/// call the engine itself makes, not something routed back up) — only the
/// dispatch-affecting outcome needs to flow back out.
pub enum EngineEffect {
    None,
    Decision(DispatchDecision),
}

pub struct Engine {
    my_name: String,
    cfg: RuntimeConfig,
    gateway: Arc<dyn GatewayClient>,
    chat: Arc<dyn ChatBackend>,
    summary: Arc<dyn SummarySink>,
    rounds: RoundStore,
    register: RegisterState,
    gateway_sem: Arc<BoundedSemaphore>,
    layer2_sem: Arc<BoundedSemaphore>,
    peer_chat_dedup: DedupWindow,
}

impl Engine {
    pub fn new(
        my_name: impl Into<String>,
        cfg: RuntimeConfig,
        gateway: Arc<dyn GatewayClient>,
        chat: Arc<dyn ChatBackend>,
        summary: Arc<dyn SummarySink>,
    ) -> Self {
        let gateway_sem = Arc::new(BoundedSemaphore::new(cfg.gateway_inflight_max));
        let layer2_sem = Arc::new(BoundedSemaphore::new(cfg.layer2_inflight_max));
        Self {
            my_name: my_name.into(),
            cfg,
            gateway,
            chat,
            summary,
            rounds: RoundStore::new(),
            register: RegisterState::default(),
            gateway_sem,
            layer2_sem,
            peer_chat_dedup: DedupWindow::new(),
        }
    }

    pub fn my_name(&self) -> &str {
        &self.my_name
    }

    /// Drains both bounded semaphores, waking any caller parked in
    /// `acquire().await` with [`Acquire::Stopped`] instead of leaving it
    /// parked past shutdown (spec §5: "drain wakes queued callers").
    pub fn shutdown(&self) {
        self.gateway_sem.drain();
        self.layer2_sem.drain();
    }

    pub fn has_unresolved_round(&self) -> bool {
        // Linear scan is fine: round population is bounded by concurrent
        // in-flight negotiations, not total message volume.
        self.rounds.values().any(|r| !r.resolved)
    }

    /// `round_start` event. `round_id` is the triggering message id.
    pub async fn round_start(
        &mut self,
        round_id: &str,
        trigger_content: &str,
        source_chat_id: Option<String>,
    ) -> EngineEffect {
        let state = RoundState::new(round_id, trigger_content, round_id, source_chat_id.clone());
        if !self.rounds.insert(state) {
            trace!(round_id, "engine: round_start for existing round, dropping");
            return EngineEffect::None;
        }
        debug!(round_id, "engine: round started");

        let coord_history =
            history::load_coordination_history(&self.summary, round_id, self.cfg.history).await;
        let recent_peer_replies = match &source_chat_id {
            Some(chat_id) => history::load_recent_peer_replies(&self.summary, chat_id, &self.my_name, self.cfg.history).await,
            None => String::new(),
        };

        // Re-check: the round may have been resolved or deleted by a
        // deadline/peer-propose event that raced ahead of this history load.
        let Some(mut taken) = self.rounds.take(round_id) else {
            trace!(round_id, "engine: round vanished while loading history");
            return EngineEffect::None;
        };
        if taken.resolved {
            self.rounds.put_back(taken);
            return EngineEffect::None;
        }
        let prompt = proposal_prompt(trigger_content, &coord_history, &recent_peer_replies);
        taken.coord_history = coord_history;
        taken.recent_peer_replies = recent_peer_replies;
        self.rounds.put_back(taken);

        let raw = match self.gateway_sem.acquire().await {
            Acquire::Stopped => None,
            Acquire::Granted(_guard) => self.gateway.call(&prompt, self.cfg.max_round, GatewayCallOpts::default()).await,
        };

        let Some(mut taken) = self.rounds.take(round_id) else {
            return EngineEffect::None;
        };
        if taken.resolved {
            self.rounds.put_back(taken);
            return EngineEffect::None;
        }

        let Some(proposal) = raw.as_deref().and_then(parse_proposal) else {
            warn!(round_id, "engine: proposal generator failed, failing open");
            taken.mark_resolved();
            return EngineEffect::Decision(DispatchDecision::fail_open(round_id, &taken.trigger_message_id));
        };

        taken.my_proposal = Some(proposal.clone());
        let outbound = CoordinationRecord {
            protocol: ACCEPTED_PROTOCOLS[0].to_string(),
            round_id: Some(round_id.to_string()),
            source_chat_id: source_chat_id.clone(),
            from: Some(self.my_name.clone()),
            kind: CoordinationKind::MicroPropose { proposal },
        };
        let content = serde_json::to_string(&outbound).unwrap_or_default();
        if let Err(e) = self.chat.post_coordination(source_chat_id.as_deref().unwrap_or_default(), &content).await {
            warn!(round_id, error = %e, "engine: failed to post micro_propose record");
        }

        if taken.other_proposal.is_some() {
            let effect = self.resolve(&mut taken).await;
            self.rounds.put_back(taken);
            return effect.map(EngineEffect::Decision).unwrap_or(EngineEffect::None);
        }

        self.rounds.put_back(taken);
        EngineEffect::None
    }

    /// `peer_micro_propose` event.
    pub async fn peer_micro_propose(&mut self, round_id: &str, other_name: &str, proposal: MicroProposal) -> EngineEffect {
        let Some(mut taken) = self.rounds.take(round_id) else {
            trace!(round_id, "engine: micro_propose for unknown round, dropping");
            return EngineEffect::None;
        };
        if taken.resolved {
            trace!(round_id, "engine: micro_propose for resolved round, dropping");
            self.rounds.put_back(taken);
            return EngineEffect::None;
        }

        taken.other_proposal = Some(proposal);
        taken.other_name = Some(other_name.to_string());

        if taken.my_proposal.is_some() {
            let effect = self.resolve(&mut taken).await;
            self.rounds.put_back(taken);
            return effect.map(EngineEffect::Decision).unwrap_or(EngineEffect::None);
        }

        self.rounds.put_back(taken);
        EngineEffect::None
    }

    /// Round-deadline timer fired.
    pub fn round_deadline(&mut self, round_id: &str) -> EngineEffect {
        let Some(mut taken) = self.rounds.take(round_id) else {
            return EngineEffect::None;
        };
        if taken.resolved {
            self.rounds.put_back(taken);
            return EngineEffect::None;
        }
        warn!(round_id, "engine: round deadline fired unresolved, failing open");
        taken.mark_resolved();
        let decision = DispatchDecision::fail_open(round_id, &taken.trigger_message_id);
        self.rounds.put_back(taken);
        EngineEffect::Decision(decision)
    }

    /// One-shot resolving step: run the filter, build the outbound
    /// `resolved` record, return this instance's [`DispatchDecision`].
    /// `state.resolved` is set before returning.
    async fn resolve(&mut self, state: &mut RoundState) -> Option<DispatchDecision> {
        let (mine, other_name, other) = state.both_proposals()?;
        let other_name = other_name.to_string();
        let result = filter::filter(&self.my_name, mine, &other_name, other, self.cfg.thresholds);
        info!(round_id = %state.round_id, mode = ?result.mode, winner = %result.winner, "engine: round resolved");

        let outbound = CoordinationRecord {
            protocol: ACCEPTED_PROTOCOLS[0].to_string(),
            round_id: Some(state.round_id.clone()),
            source_chat_id: state.source_chat_id.clone(),
            from: Some(self.my_name.clone()),
            kind: CoordinationKind::Resolved {
                mode: result.mode,
                winner: result.winner.clone(),
                runner_up: result.runner_up.clone(),
                reason: result.reason.clone(),
                my_proposal: mine.clone(),
                other_proposal: other.clone(),
            },
        };
        let content = serde_json::to_string(&outbound).unwrap_or_default();
        if let Err(e) = self.chat.post_coordination(state.source_chat_id.as_deref().unwrap_or_default(), &content).await {
            warn!(round_id = %state.round_id, error = %e, "engine: failed to post resolved record");
        }

        let i_am_winner = result.winner == self.my_name;
        let mine = mine.clone();
        let other = other.clone();
        state.mark_resolved();

        let decision = match (result.mode, i_am_winner) {
            (Mode::Solo, true) => DispatchDecision {
                round_id: state.round_id.clone(),
                trigger_message_id: state.trigger_message_id.clone(),
                should_respond: true,
                synthesize_context: Some(format!(
                    "[coordination resolved. your angle: {}; peer angle: {}; you were selected ({}).]",
                    mine.angle, other.angle, result.reason
                )),
                cancel_pending: false,
                wait_for_response: None,
                my_angle: Some(mine.angle.clone()),
            },
            (Mode::Solo, false) => DispatchDecision {
                round_id: state.round_id.clone(),
                trigger_message_id: state.trigger_message_id.clone(),
                should_respond: false,
                synthesize_context: None,
                cancel_pending: true,
                wait_for_response: None,
                my_angle: None,
            },
            (Mode::Parallel, _) => DispatchDecision {
                round_id: state.round_id.clone(),
                trigger_message_id: state.trigger_message_id.clone(),
                should_respond: true,
                synthesize_context: Some(format!(
                    "[coordination resolved: parallel. focus on your unique angle: {}; peer is covering: {}.]",
                    mine.angle, other.angle
                )),
                cancel_pending: false,
                wait_for_response: None,
                my_angle: Some(mine.angle.clone()),
            },
            (Mode::Synthesis, true) => DispatchDecision {
                round_id: state.round_id.clone(),
                trigger_message_id: state.trigger_message_id.clone(),
                should_respond: true,
                synthesize_context: Some("[you go first; peer will build on you]".to_string()),
                cancel_pending: false,
                wait_for_response: None,
                my_angle: Some(mine.angle.clone()),
            },
            (Mode::Synthesis, false) => DispatchDecision {
                round_id: state.round_id.clone(),
                trigger_message_id: state.trigger_message_id.clone(),
                should_respond: false,
                synthesize_context: None,
                cancel_pending: false,
                my_angle: Some(mine.angle.clone()),
                wait_for_response: Some(WaitForResponse {
                    winner_name: result.winner.clone(),
                    my_proposal: mine,
                    other_proposal: other,
                }),
            },
        };
        Some(decision)
    }

    /// Called by the `Coordinator` after a positive decision's responder
    /// actually replied, updating the advisory register.
    pub fn record_response(&mut self, agent: &str, angle: &str) {
        register::record(&mut self.register, agent, angle);
    }

    pub fn register(&self) -> &RegisterState {
        &self.register
    }

    /// Peer-chat (layer 2) event: gated on "no unresolved round", an address
    /// filter, dedup, and depth cap before the bounded semaphore is even
    /// consulted.
    pub async fn peer_chat(&mut self, speaker: &str, chat_id: &str, fields: &PeerChatFields) -> EngineEffect {
        if self.has_unresolved_round() {
            trace!("engine: dropping peer-chat record, round in progress");
            return EngineEffect::None;
        }
        if let Some(to) = &fields.to {
            if to != &self.my_name {
                trace!(to, "engine: peer-chat addressed to someone else, dropping");
                return EngineEffect::None;
            }
        }
        let prefix: String = fields.content.chars().take(120).collect();
        let key = format!("{speaker}|{prefix}");
        if self.peer_chat_dedup.mark(key, Duration::from_secs(60)) {
            trace!(speaker, "engine: duplicate peer-chat record, dropping");
            return EngineEffect::None;
        }
        if fields.depth >= self.cfg.depth_cap {
            trace!(speaker, depth = fields.depth, "engine: peer-chat depth cap reached, dropping");
            return EngineEffect::None;
        }
        if !fields.expects_reply {
            return EngineEffect::None;
        }

        let guard = self.layer2_sem.acquire().await;
        let Acquire::Granted(_permit) = guard else {
            return EngineEffect::None;
        };
        let prompt = format!("Peer message from {speaker}: {}\nReply briefly, depth {}.", fields.content, fields.depth + 1);
        let Some(reply) = self.gateway.call_fast(&prompt).await else {
            return EngineEffect::None;
        };
        if let Err(e) = self.chat.send_outbound(chat_id, &reply).await {
            warn!(chat_id, error = %e, "engine: failed to send peer-chat reply");
        }
        EngineEffect::None
    }
}
