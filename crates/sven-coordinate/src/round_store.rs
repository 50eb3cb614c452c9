// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-round state and its lifecycle timers.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use crate::types::MicroProposal;

/// Internal machine state a round is in. Mirrors §4.6's state diagram;
/// `RESOLVING` is collapsed into the transition inside
/// [`crate::engine::Engine`] rather than stored, since resolving is a
/// one-shot synchronous step once both proposals are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    GeneratingProposal,
    ProposalPosted,
    Resolved,
}

/// One negotiation round, keyed by `round_id` (== the triggering message id).
#[derive(Debug)]
pub struct RoundState {
    pub round_id: String,
    pub trigger_content: String,
    pub trigger_message_id: String,
    pub source_chat_id: Option<String>,

    pub phase: Phase,
    pub my_proposal: Option<MicroProposal>,
    pub other_proposal: Option<MicroProposal>,
    pub other_name: Option<String>,

    pub coord_history: String,
    pub recent_peer_replies: String,

    /// Cancels the round-deadline timer (fires fail-open if the round isn't
    /// resolved in time).
    pub deadline_token: CancellationToken,
    /// Cancels the cleanup timer (deletes the round from the store). Started
    /// only after proposal generation completes or fails (I5).
    pub cleanup_token: Option<CancellationToken>,

    /// I2: resolved is monotonic false -> true.
    pub resolved: bool,
}

impl RoundState {
    pub fn new(
        round_id: impl Into<String>,
        trigger_content: impl Into<String>,
        trigger_message_id: impl Into<String>,
        source_chat_id: Option<String>,
    ) -> Self {
        Self {
            round_id: round_id.into(),
            trigger_content: trigger_content.into(),
            trigger_message_id: trigger_message_id.into(),
            source_chat_id,
            phase: Phase::GeneratingProposal,
            my_proposal: None,
            other_proposal: None,
            other_name: None,
            coord_history: String::new(),
            recent_peer_replies: String::new(),
            deadline_token: CancellationToken::new(),
            cleanup_token: None,
            resolved: false,
        }
    }

    /// I2 enforcement: once true, refuses to go back to false.
    pub fn mark_resolved(&mut self) {
        if !self.resolved {
            self.resolved = true;
            self.deadline_token.cancel();
            if let Some(t) = self.cleanup_token.take() {
                // Cleanup cancellation here only stops the *old* cleanup
                // countdown; callers that want the entry actually removed
                // (post-resolution cleanup) arm a fresh short-lived one —
                // see `Engine::resolve`.
                t.cancel();
            }
        }
    }

    pub fn both_proposals(&self) -> Option<(&MicroProposal, &str, &MicroProposal)> {
        match (&self.my_proposal, &self.other_proposal, &self.other_name) {
            (Some(mine), Some(other), Some(name)) => Some((mine, name.as_str(), other)),
            _ => None,
        }
    }
}

/// I1: at most one [`RoundState`] per `round_id`.
#[derive(Debug, Default)]
pub struct RoundStore {
    rounds: HashMap<String, RoundState>,
}

impl RoundStore {
    pub fn new() -> Self {
        Self { rounds: HashMap::new() }
    }

    pub fn get(&self, round_id: &str) -> Option<&RoundState> {
        self.rounds.get(round_id)
    }

    pub fn get_mut(&mut self, round_id: &str) -> Option<&mut RoundState> {
        self.rounds.get_mut(round_id)
    }

    pub fn contains(&self, round_id: &str) -> bool {
        self.rounds.contains_key(round_id)
    }

    /// Inserts only if absent; returns `false` if a round with this id
    /// already exists (I1 — caller must drop the event).
    pub fn insert(&mut self, state: RoundState) -> bool {
        if self.rounds.contains_key(&state.round_id) {
            return false;
        }
        self.rounds.insert(state.round_id.clone(), state);
        true
    }

    /// Remove and return the state for `round_id`, if present — used by the
    /// engine to mutate across `.await` points without holding a reference
    /// into the map (see the crate-level concurrency notes).
    pub fn take(&mut self, round_id: &str) -> Option<RoundState> {
        self.rounds.remove(round_id)
    }

    /// Re-insert a state previously taken (e.g. after an `.await` that
    /// didn't resolve the round). No-op (drops `state`) if a round with the
    /// same id was independently re-inserted in the meantime — that should
    /// never happen given the single-actor ownership model, but dropping is
    /// the safe default over silently overwriting.
    pub fn put_back(&mut self, state: RoundState) {
        self.rounds.entry(state.round_id.clone()).or_insert(state);
    }

    pub fn delete(&mut self, round_id: &str) -> Option<RoundState> {
        self.rounds.remove(round_id)
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &RoundState> {
        self.rounds.values()
    }
}
