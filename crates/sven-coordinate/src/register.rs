// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Advisory per-chat register update logic.
//!
//! The register is deliberately not consulted by [`crate::filter`] — only by
//! prompt construction in [`crate::engine`] — so that two peers running with
//! slightly different (per-process) registers still compute identical
//! `(mode, winner, runner_up)` for the same pair of proposals.

use crate::types::RegisterState;

const MAX_RECENT_ANGLES: usize = 5;

/// Record that `agent` responded with `angle`: sets `last_responder`, and
/// moves `agent` to the front of `recent_angles` (inserting if new),
/// truncated to the most recent five distinct agents.
pub fn record(state: &mut RegisterState, agent: &str, angle: &str) {
    state.last_responder = Some(agent.to_string());
    state.recent_angles.retain(|(a, _)| a != agent);
    state.recent_angles.push_front((agent.to_string(), angle.to_string()));
    state.recent_angles.truncate(MAX_RECENT_ANGLES);
}
