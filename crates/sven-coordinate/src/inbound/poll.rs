// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The safety-net poll: scans the durable row store for `pending` rows
//! addressed to this agent, quarantines anything older than boot, and
//! CAS-claims the rest before dispatching.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::host::DurableRowStore;
use crate::types::InboundRow;

/// One sweep of the safety-net poll.
///
/// Returns the rows that should be (re-)dispatched to the callback — i.e.
/// live rows this call won the CAS claim for. CAS failures ("already
/// handled by another path") are treated as success per §7: the other path
/// owns the invocation, so the row is simply excluded, not retried.
pub async fn sweep(store: &Arc<dyn DurableRowStore>, bot_id: &str, boot_time: DateTime<Utc>) -> Vec<InboundRow> {
    if let Err(e) = store.bulk_mark_stale(bot_id, boot_time).await {
        warn!(error = %e, "inbound poll: bulk stale-quarantine failed, continuing with live scan");
    }

    let pending = match store.poll_pending(bot_id).await {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "inbound poll: failed to read pending rows");
            return Vec::new();
        }
    };

    let mut claimed = Vec::new();
    for row in pending {
        if row.created_at < boot_time {
            // Should already have been caught by bulk_mark_stale, but a race
            // between the bulk mark and the live scan can still surface one;
            // quarantine defensively rather than replay it.
            continue;
        }
        match store.claim(bot_id, &row.message_id).await {
            Ok(true) => claimed.push(row),
            Ok(false) => { /* another path already claimed it; not an error */ }
            Err(e) => {
                // Fail-open per §4.3/§7: the claim is best-effort dedup
                // across processes, not the hard gate — still invoke.
                warn!(error = %e, message_id = %row.message_id, "inbound poll: CAS claim failed, dispatching anyway");
                claimed.push(row);
            }
        }
    }
    claimed
}
