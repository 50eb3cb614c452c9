// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Keeps exactly one [`crate::inbound::ReliableInbound`] alive, reconnecting
//! with exponential backoff and jitter when the current one dies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::host::{CoordinationTransport, DurableRowStore};
use crate::inbound::{CoordinationHandlers, InboundTiming, ReliableInbound};

/// Backoff shape, mirrored 1:1 from `sven_config::CoordinateBackoffConfig`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial: Duration::from_secs(2), max: Duration::from_secs(60), factor: 2.0, jitter: 0.2 }
    }
}

/// Stateful backoff sequence: `next()` advances and returns the delay to
/// sleep before the next attempt; `reset()` drops back to `initial` after a
/// successful connection (one that ran long enough to be worth forgetting
/// prior failures for).
struct Backoff {
    cfg: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    fn new(cfg: BackoffConfig) -> Self {
        Self { cfg, attempt: 0 }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next(&mut self) -> Duration {
        let base_ms = self.cfg.initial.as_millis() as f64 * self.cfg.factor.powi(self.attempt as i32);
        let capped_ms = base_ms.min(self.cfg.max.as_millis() as f64);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_span = capped_ms * self.cfg.jitter;
        let jittered_ms = if jitter_span > 0.0 {
            let offset = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
            (capped_ms + offset).max(0.0)
        } else {
            capped_ms
        };
        Duration::from_millis(jittered_ms.round() as u64)
    }
}

/// A connection attempt ran at least this long counts as a successful
/// connection for backoff-reset purposes, rather than an instant failure
/// loop masquerading as "it connected".
const MIN_HEALTHY_CONNECTION: Duration = Duration::from_secs(30);

/// Supervises the inbound layer's lifetime: connect, run until death or
/// abort, sleep per backoff, repeat. `bot_id`/`boot_time` are fixed for the
/// life of the supervisor; every reconnect gets a brand new
/// [`ReliableInbound`] (and therefore fresh dedup windows — safe, since the
/// durable row store and the upstream id-ttl window on the wire are what
/// actually bound redelivery, not in-process state surviving a reconnect).
pub struct ReconnectSupervisor {
    bot_id: String,
    boot_time: chrono::DateTime<chrono::Utc>,
    transport: Arc<dyn CoordinationTransport>,
    store: Arc<dyn DurableRowStore>,
    handlers: Arc<dyn CoordinationHandlers>,
    timing: InboundTiming,
    backoff: Mutex<Backoff>,
}

impl ReconnectSupervisor {
    pub fn new(
        bot_id: impl Into<String>,
        boot_time: chrono::DateTime<chrono::Utc>,
        transport: Arc<dyn CoordinationTransport>,
        store: Arc<dyn DurableRowStore>,
        handlers: Arc<dyn CoordinationHandlers>,
        timing: InboundTiming,
        backoff_cfg: BackoffConfig,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            boot_time,
            transport,
            store,
            handlers,
            timing,
            backoff: Mutex::new(Backoff::new(backoff_cfg)),
        }
    }

    /// Runs forever until `abort` fires.
    pub async fn run(&self, abort: CancellationToken) {
        loop {
            if abort.is_cancelled() {
                return;
            }
            log_startup(&self.bot_id);
            let inbound = ReliableInbound::new(
                self.bot_id.clone(),
                self.boot_time,
                self.transport.clone(),
                self.store.clone(),
                self.handlers.clone(),
                self.timing,
            );

            let started = tokio::time::Instant::now();
            let result = inbound.run(abort.clone()).await;
            let ran_for = started.elapsed();

            if abort.is_cancelled() {
                return;
            }

            match result {
                Ok(()) => return, // clean exit only happens via abort, already handled above
                Err(e) => {
                    let mut backoff = self.backoff.lock().await;
                    if ran_for >= MIN_HEALTHY_CONNECTION {
                        backoff.reset();
                    }
                    let delay = backoff.next();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "supervisor: inbound died, reconnecting");
                    drop(backoff);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = abort.cancelled() => return,
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectSupervisor").field("bot_id", &self.bot_id).finish_non_exhaustive()
    }
}

fn log_startup(bot_id: &str) {
    info!(bot_id, "supervisor: starting reliable inbound");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_geometrically_and_caps() {
        let mut b = Backoff::new(BackoffConfig { initial: Duration::from_millis(100), max: Duration::from_secs(1), factor: 2.0, jitter: 0.0 });
        assert_eq!(b.next(), Duration::from_millis(100));
        assert_eq!(b.next(), Duration::from_millis(200));
        assert_eq!(b.next(), Duration::from_millis(400));
        assert_eq!(b.next(), Duration::from_millis(800));
        assert_eq!(b.next(), Duration::from_millis(1000)); // capped
        assert_eq!(b.next(), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_reset_drops_back_to_initial() {
        let mut b = Backoff::new(BackoffConfig { initial: Duration::from_millis(50), max: Duration::from_secs(1), factor: 2.0, jitter: 0.0 });
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_millis(50));
    }

    #[test]
    fn backoff_jitter_stays_within_configured_span() {
        let mut b = Backoff::new(BackoffConfig { initial: Duration::from_millis(1000), max: Duration::from_secs(10), factor: 1.0, jitter: 0.2 });
        for _ in 0..50 {
            let d = b.next().as_millis() as f64;
            assert!((800.0..=1200.0).contains(&d), "{d} outside expected jitter band");
        }
    }
}
