// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Wire and in-memory data types for the negotiation protocol.
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Protocol version strings this build accepts. Both current and one legacy
/// string are accepted inclusively; anything else is dropped.
pub const ACCEPTED_PROTOCOLS: &[&str] = &["sven-coordinate/1", "sven-coordinate/1.1"];

/// An agent's self-assessment for a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicroProposal {
    pub angle: String,
    pub confidence: f64,
    #[serde(default)]
    pub covers: Vec<String>,
    #[serde(default)]
    pub solo_sufficient: bool,
    #[serde(default)]
    pub builds_on_other: bool,
}

impl MicroProposal {
    /// Text used for Jaccard token similarity: the angle plus the covers list.
    pub fn similarity_text(&self) -> String {
        let mut s = self.angle.clone();
        if !self.covers.is_empty() {
            s.push(' ');
            s.push_str(&self.covers.join(" "));
        }
        s
    }
}

/// Dispatch mode chosen by the proposal filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Solo,
    Parallel,
    Synthesis,
}

/// Output of the pure proposal filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub mode: Mode,
    pub winner: String,
    pub runner_up: Option<String>,
    pub reason: String,
    /// Both proposals, keyed by agent name.
    pub proposals: std::collections::BTreeMap<String, MicroProposal>,
}

/// Context handed to the runner-up in synthesis mode so the holder can poll
/// for the winner's reply.
#[derive(Debug, Clone)]
pub struct WaitForResponse {
    pub winner_name: String,
    pub my_proposal: MicroProposal,
    pub other_proposal: MicroProposal,
}

/// Raised by the [`crate::engine::Engine`] to the [`crate::holder::DispatchHolder`]
/// once a round resolves (or fails open).
#[derive(Debug, Clone)]
pub struct DispatchDecision {
    pub round_id: String,
    pub trigger_message_id: String,
    pub should_respond: bool,
    pub synthesize_context: Option<String>,
    pub cancel_pending: bool,
    pub wait_for_response: Option<WaitForResponse>,
    /// This instance's own `MicroProposal::angle` for the round, if one was
    /// formed (`None` under fail-open, where no proposal ever existed).
    /// Carried so the register update after an actual reply records the
    /// angle that was proposed, not the reply text itself.
    pub my_angle: Option<String>,
}

impl DispatchDecision {
    pub fn fail_open(round_id: impl Into<String>, trigger_message_id: impl Into<String>) -> Self {
        Self {
            round_id: round_id.into(),
            trigger_message_id: trigger_message_id.into(),
            should_respond: true,
            synthesize_context: None,
            cancel_pending: false,
            wait_for_response: None,
            my_angle: None,
        }
    }
}

/// Advisory per-chat register: "who spoke last / recent angles". Injected
/// into proposal prompts only — never read by the filter, so peers with
/// slightly different registers still agree on mode/winner.
///
/// See [`crate::register`] for the update logic.
#[derive(Debug, Clone, Default)]
pub struct RegisterState {
    pub last_responder: Option<String>,
    /// Newest-first, unique by agent, truncated to 5.
    pub recent_angles: VecDeque<(String, String)>,
}

/// Payload delivered by the reliable inbound layer's fast path or poll.
#[derive(Debug, Clone)]
pub struct InboundDispatch {
    pub chat_id: String,
    pub text: String,
    pub user_id: String,
    pub message_id: String,
    pub speaker: String,
}

/// A durable row in the `pending`/`handled` inbound store.
#[derive(Debug, Clone)]
pub struct InboundRow {
    pub bot_id: String,
    pub message_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub dispatch: InboundDispatch,
}

/// Fields shared by the layer-2 (free-form peer chat) record kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerChatFields {
    #[serde(default)]
    pub to: Option<String>,
    pub content: String,
    #[serde(default)]
    pub expects_reply: bool,
    #[serde(default)]
    pub depth: u32,
}

/// A parsed coordination-stream record. Unknown `kind`s deserialize into
/// [`CoordinationKind::Unknown`] instead of failing, so one malformed or
/// future field doesn't reject an otherwise-useful record's envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationRecord {
    pub protocol: String,
    #[serde(default)]
    pub round_id: Option<String>,
    #[serde(default)]
    pub source_chat_id: Option<String>,
    /// Authoring agent's name. Populated by the transport adapter from
    /// whatever sender identity the wire message carries (the same way
    /// [`InboundDispatch::speaker`] is populated for user messages), not by
    /// this crate — `sven-coordinate` only reads it back.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(flatten)]
    pub kind: CoordinationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoordinationKind {
    RoundStart {
        trigger_message_id: String,
        trigger_content: String,
    },
    MicroPropose {
        proposal: MicroProposal,
    },
    Resolved {
        mode: Mode,
        winner: String,
        #[serde(default)]
        runner_up: Option<String>,
        reason: String,
        my_proposal: MicroProposal,
        other_proposal: MicroProposal,
    },
    Signal {
        #[serde(default)]
        solo_insufficient: bool,
        confidence: f64,
        reason: String,
        basis: String,
        chain_depth: u32,
        #[serde(default)]
        source_chat_id: Option<String>,
    },
    Question(PeerChatFields),
    Inform(PeerChatFields),
    Flag(PeerChatFields),
    Delegate(PeerChatFields),
    Status(PeerChatFields),
    /// Any `kind` not listed above. Dropped with a log line, never an error.
    #[serde(other)]
    Unknown,
}

impl CoordinationKind {
    /// The peer-chat payload, if this is one of the layer-2 kinds.
    pub fn peer_chat_fields(&self) -> Option<&PeerChatFields> {
        match self {
            CoordinationKind::Question(f)
            | CoordinationKind::Inform(f)
            | CoordinationKind::Flag(f)
            | CoordinationKind::Delegate(f)
            | CoordinationKind::Status(f) => Some(f),
            _ => None,
        }
    }
}
