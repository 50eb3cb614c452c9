// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Gates the user-visible reply on the coordination decision.
//!
//! Holds the user-triggered work per `message_id` while a round runs, then
//! applies whichever [`DispatchDecision`] shape the engine raises — or, if
//! none ever arrives, dispatches anyway once a timer fires. Every path ends
//! in exactly one [`ChatBackend::dispatch_reply`] call per `message_id`
//! (`UniqueDispatch`), enforced by the mark-dispatched dedup window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::dedup::DedupWindow;
use crate::history;
use crate::host::{ChatBackend, SummarySink};
use crate::types::DispatchDecision;

struct PendingEntry {
    chat_id: String,
    text: String,
    user_id: String,
    /// This instance's own proposed angle, if a decision carrying one has
    /// been applied (populated on `wait_for_response` so
    /// `resolve_synthesis_wait` can still report it once the wait resolves).
    my_angle: Option<String>,
}

/// A message id's held work. A given decision shape arms at most one of the
/// two timers (backstop, or — for the double-defer case — the 8s
/// defer-backstop); both fire-side handlers are idempotent against a stale
/// timer racing a decision that already removed the entry, so no
/// cancellation bookkeeping is needed here (see the crate-level docs).
pub struct DispatchHolder {
    my_name: String,
    chat: Arc<dyn ChatBackend>,
    summary: Arc<dyn SummarySink>,
    history_limits: history::HistoryLimits,
    backstop_duration: Duration,
    defer_backstop_duration: Duration,
    synthesis_wait: Duration,
    pending: HashMap<String, PendingEntry>,
    dispatched: DedupWindow,
    mark_dispatched_ttl: Duration,
}

/// Effect a holder operation wants the `Coordinator` actor to carry out.
/// Timer arming is represented as a request rather than a spawned task
/// directly inside `DispatchHolder`, so the actor's main `select!` loop
/// stays the single place that owns live timer futures — mirroring how
/// [`crate::engine::Engine`] never spawns its own sub-tasks either.
pub enum HolderEffect {
    None,
    /// Dispatch immediately with the given (possibly prefixed) text. `angle`
    /// carries this instance's own proposed angle when one exists, so the
    /// caller can update the advisory register with it (`None` when the
    /// dispatch happened without ever forming a proposal — fail-open,
    /// backstop, or the `@name` bypass). `round_id` is `Some` whenever this
    /// dispatch concluded an actual round, so the caller can best-effort
    /// write a response summary (`history::write_response_summary`) the way
    /// a peer's synthesis wait needs to observe — `None` only for the
    /// `@name` bypass, which never joins a round.
    DispatchNow { chat_id: String, text: String, user_id: String, angle: Option<String>, round_id: Option<String> },
    /// Arm (or re-arm) a timer that, on fire, should call
    /// [`DispatchHolder::fire_backstop`] for this message id.
    ArmBackstop { message_id: String, after: Duration },
    /// Arm a timer that should call [`DispatchHolder::fire_defer_backstop`].
    ArmDeferBackstop { message_id: String, after: Duration },
    /// Arm the synthesis-wait poll. The caller runs the poll itself (it's a
    /// plain async read against `summary`/`limits`, not a method that needs
    /// `&mut self`) and hands the result to
    /// [`DispatchHolder::resolve_synthesis_wait`] — kept this way so the
    /// actor loop that owns the holder never blocks on the up-to-15s poll
    /// itself; see the crate-level docs on timer handling.
    ArmSynthesisWait {
        message_id: String,
        round_id: String,
        winner_name: String,
        timeout: Duration,
        summary: Arc<dyn SummarySink>,
        limits: history::HistoryLimits,
    },
}

impl DispatchHolder {
    pub fn new(
        my_name: impl Into<String>,
        chat: Arc<dyn ChatBackend>,
        summary: Arc<dyn SummarySink>,
        history_limits: history::HistoryLimits,
        backstop_duration: Duration,
        defer_backstop_duration: Duration,
        synthesis_wait: Duration,
        mark_dispatched_ttl: Duration,
    ) -> Self {
        Self {
            my_name: my_name.into(),
            chat,
            summary,
            history_limits,
            backstop_duration,
            defer_backstop_duration,
            synthesis_wait,
            pending: HashMap::new(),
            dispatched: DedupWindow::new(),
            mark_dispatched_ttl,
        }
    }

    fn already_dispatched(&mut self, message_id: &str) -> bool {
        self.dispatched.mark(message_id.to_string(), self.mark_dispatched_ttl)
    }

    /// `hold(messageId, {chatId, text, userId})`.
    pub fn hold(&mut self, message_id: &str, chat_id: &str, text: &str, user_id: &str) -> HolderEffect {
        if self.pending.contains_key(message_id) || self.dispatched.contains(message_id) {
            trace!(message_id, "holder: already held or dispatched, dropping hold");
            return HolderEffect::None;
        }
        self.pending.insert(
            message_id.to_string(),
            PendingEntry { chat_id: chat_id.to_string(), text: text.to_string(), user_id: user_id.to_string(), my_angle: None },
        );
        debug!(message_id, "holder: holding pending dispatch");
        HolderEffect::ArmBackstop { message_id: message_id.to_string(), after: self.backstop_duration }
    }

    /// The `@name` hard routing bypass: dispatch immediately and skip
    /// coordination entirely.
    pub fn bypass(&mut self, message_id: &str, chat_id: &str, text: &str, user_id: &str) -> HolderEffect {
        self.pending.remove(message_id);
        if self.already_dispatched(message_id) {
            return HolderEffect::None;
        }
        HolderEffect::DispatchNow { chat_id: chat_id.to_string(), text: text.to_string(), user_id: user_id.to_string(), angle: None, round_id: None }
    }

    /// The backstop timer fired: dispatch with the original text if the
    /// entry is still held (i.e. no decision arrived in time).
    pub fn fire_backstop(&mut self, message_id: &str) -> HolderEffect {
        let Some(entry) = self.pending.remove(message_id) else {
            return HolderEffect::None;
        };
        if self.already_dispatched(message_id) {
            return HolderEffect::None;
        }
        warn!(message_id, "holder: backstop fired, dispatching original text");
        // `round_id` equals `message_id` for every round this holder was
        // ever handed — both are the triggering user message's id (see
        // `Coordinator::on_user_dispatch`).
        HolderEffect::DispatchNow { chat_id: entry.chat_id, text: entry.text, user_id: entry.user_id, angle: None, round_id: Some(message_id.to_string()) }
    }

    /// The 8s defer-backstop fired: the peer's terminal decision never
    /// arrived (both sides raised an initial defer). Dispatch with the
    /// original text. Gated upstream by the alphabetical tiebreaker — see
    /// `should_defer_backstop_dispatch`.
    pub fn fire_defer_backstop(&mut self, message_id: &str) -> HolderEffect {
        self.fire_backstop(message_id)
    }

    /// `applyDecision(messageId, decision)`. Returns the effect to carry out
    /// plus, for `should_respond=true`, the text already prefixed with
    /// `synthesize_context` when present.
    pub fn apply_decision(&mut self, decision: &DispatchDecision) -> HolderEffect {
        let message_id = &decision.trigger_message_id;
        if !self.pending.contains_key(message_id) {
            trace!(message_id, "holder: decision for unheld message, dropping");
            return HolderEffect::None;
        }

        if decision.should_respond {
            let entry = self.pending.remove(message_id).expect("checked above");
            if self.already_dispatched(message_id) {
                return HolderEffect::None;
            }
            let text = match &decision.synthesize_context {
                Some(ctx) => format!("{ctx}\n\n{}", entry.text),
                None => entry.text,
            };
            return HolderEffect::DispatchNow {
                chat_id: entry.chat_id,
                text,
                user_id: entry.user_id,
                angle: decision.my_angle.clone(),
                round_id: Some(decision.round_id.clone()),
            };
        }

        if decision.cancel_pending {
            self.pending.remove(message_id);
            self.already_dispatched(message_id);
            debug!(message_id, "holder: cancel_pending applied, entry removed");
            return HolderEffect::None;
        }

        if let Some(wfr) = &decision.wait_for_response {
            debug!(message_id, winner = %wfr.winner_name, "holder: waiting for winner's response summary");
            if let Some(entry) = self.pending.get_mut(message_id) {
                entry.my_angle = Some(wfr.my_proposal.angle.clone());
            }
            return HolderEffect::ArmSynthesisWait {
                message_id: message_id.clone(),
                round_id: decision.round_id.clone(),
                winner_name: wfr.winner_name.clone(),
                timeout: self.synthesis_wait,
                summary: self.summary.clone(),
                limits: self.history_limits,
            };
        }

        // Initial defer: neither should_respond nor cancel_pending nor
        // wait_for_response. Arm the shorter defer-backstop.
        debug!(message_id, "holder: initial defer, arming defer-backstop");
        HolderEffect::ArmDeferBackstop { message_id: message_id.clone(), after: self.defer_backstop_duration }
    }

    /// Resolves a synthesis wait once its poll has completed (run by the
    /// caller off the actor loop — see [`HolderEffect::ArmSynthesisWait`]):
    /// dispatches either with the winner's reply folded in, or a
    /// parallel-style fallback if `found` is `None` (the poll timed out).
    pub fn resolve_synthesis_wait(&mut self, message_id: &str, round_id: &str, winner_name: &str, found: Option<String>) -> HolderEffect {
        let Some(entry) = self.pending.remove(message_id) else {
            return HolderEffect::None;
        };
        if self.already_dispatched(message_id) {
            return HolderEffect::None;
        }
        let angle = entry.my_angle.clone();
        let text = match found {
            Some(winner_reply) => {
                format!("[{winner_name} went first. their reply: {winner_reply}\n\nnow build on it.]\n\n{}", entry.text)
            }
            None => {
                warn!(message_id, round_id, winner_name, "holder: synthesis wait timed out, falling back to parallel-style context");
                format!("[coordination: proceeding independently, peer did not respond in time.]\n\n{}", entry.text)
            }
        };
        HolderEffect::DispatchNow { chat_id: entry.chat_id, text, user_id: entry.user_id, angle, round_id: Some(round_id.to_string()) }
    }

    /// Best-effort write of this instance's own dispatched response into the
    /// summary sink, so a peer's synthesis wait (`resolve_synthesis_wait`)
    /// can observe it. Called by the `Coordinator` after every successful
    /// `dispatch_reply` that concluded a round (spec §4.7: "invoke
    /// `writeResponseSummary(round_id, my_name, response)` best-effort").
    pub async fn record_dispatch_summary(&self, round_id: &str, response: &str, source_chat_id: &str) {
        history::write_response_summary(&self.summary, round_id, &self.my_name, response, Some(source_chat_id), self.history_limits).await;
    }

    /// Whether this instance should be the one whose defer-backstop
    /// actually dispatches when both peers reached initial-defer
    /// simultaneously — see the crate's design notes on the double-defer
    /// open question. The lexicographically-smaller name wins; the other
    /// instance's backstop should instead treat its own fire as a no-op and
    /// let this instance's dispatch (and subsequent `writeResponseSummary`)
    /// land first.
    pub fn should_defer_backstop_dispatch(&self, other_name: &str) -> bool {
        self.my_name.as_str() <= other_name
    }
}
