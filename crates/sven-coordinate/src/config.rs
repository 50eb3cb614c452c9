// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Adapts `sven_config::CoordinateConfig` (raw millisecond fields, the shape
//! that round-trips through YAML) into the `Duration`-based runtime types
//! engine components actually take.

use std::time::Duration;

use sven_config::CoordinateConfig as RawConfig;

use crate::filter::FilterThresholds;
use crate::history::HistoryLimits;
use crate::supervisor::BackoffConfig;

/// Fully resolved runtime configuration for one `Coordinator` instance.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_round: Duration,
    pub cleanup: Duration,
    pub dedup_id_ttl: Duration,
    pub dedup_content_ttl: Duration,
    pub gateway_inflight_max: usize,
    pub layer2_inflight_max: usize,
    pub depth_cap: u32,
    pub backstop: Duration,
    pub defer_backstop: Duration,
    pub synthesis_wait: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub mark_dispatched_ttl: Duration,
    pub thresholds: FilterThresholds,
    pub history: HistoryLimits,
    pub backoff: BackoffConfig,
}

impl From<&RawConfig> for RuntimeConfig {
    fn from(raw: &RawConfig) -> Self {
        Self {
            max_round: Duration::from_millis(raw.max_round_ms),
            cleanup: Duration::from_millis(raw.cleanup_ms),
            dedup_id_ttl: Duration::from_millis(raw.dedup_id_ttl_ms),
            dedup_content_ttl: Duration::from_millis(raw.dedup_content_ttl_ms),
            gateway_inflight_max: raw.gateway_inflight_max,
            layer2_inflight_max: raw.layer2_inflight_max,
            depth_cap: raw.depth_cap,
            backstop: Duration::from_millis(raw.backstop_ms),
            defer_backstop: Duration::from_millis(raw.defer_backstop_ms),
            synthesis_wait: Duration::from_millis(raw.synthesis_wait_ms),
            poll_interval: Duration::from_millis(raw.poll_interval_ms),
            health_interval: Duration::from_millis(raw.health_interval_ms),
            mark_dispatched_ttl: Duration::from_millis(raw.mark_dispatched_ttl_ms),
            thresholds: FilterThresholds {
                gap: raw.confidence_gap,
                overlap: raw.overlap,
                high: raw.high,
                low: raw.low,
                synth: raw.synth,
                epsilon: raw.epsilon,
            },
            history: HistoryLimits {
                max_records: raw.history_max_records,
                max_rounds: raw.history_max_rounds,
                max_chars: raw.history_max_chars,
                peer_replies_per_agent: raw.peer_replies_per_agent,
                peer_replies_max_chars: raw.peer_replies_max_chars,
                summary_max_chars: raw.summary_max_chars,
                summary_poll: Duration::from_millis(raw.summary_poll_ms),
            },
            backoff: BackoffConfig {
                initial: Duration::from_millis(raw.backoff.initial_ms),
                max: Duration::from_millis(raw.backoff.max_ms),
                factor: raw.backoff.factor,
                jitter: raw.backoff.jitter,
            },
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::from(&RawConfig::default())
    }
}
