// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Errors surfaced to the host application.
///
/// Protocol malformation, unknown `kind`s, and events for unknown/resolved
/// rounds are *not* represented here — those are dropped and logged inside
/// the engine (see the crate-level error handling notes), never propagated.
#[derive(Debug, Error)]
pub enum CoordinateError {
    #[error("gateway call failed after retry: {0}")]
    Gateway(String),

    #[error("chat backend call failed: {0}")]
    ChatBackend(#[from] anyhow::Error),

    #[error("inbound subscription could not be (re)established")]
    InboundUnavailable,

    #[error("coordinator actor channel closed")]
    ActorGone,
}
