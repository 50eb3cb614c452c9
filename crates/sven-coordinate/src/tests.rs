// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Crate-level scenario tests that exercise the engine and holder together,
//! the way a single `Coordinator` actor drives them. Per-module unit tests
//! cover the invariants that are local to one module; the ones here need
//! both halves wired up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::RuntimeConfig;
use crate::engine::{Engine, EngineEffect};
use crate::filter::FilterThresholds;
use crate::history::HistoryLimits;
use crate::holder::{DispatchHolder, HolderEffect};
use crate::host::{ChatBackend, CoordinationEnvelope, DurableRowStore, GatewayCallOpts, GatewayClient, SummarySink};
use crate::supervisor::BackoffConfig;
use crate::types::{DispatchDecision, InboundRow, MicroProposal};

struct FixedGateway {
    proposal: Mutex<Option<String>>,
}

impl FixedGateway {
    fn always(proposal: Option<&str>) -> Self {
        Self { proposal: Mutex::new(proposal.map(String::from)) }
    }
}

#[async_trait]
impl GatewayClient for FixedGateway {
    async fn call(&self, _prompt: &str, _timeout: Duration, _opts: GatewayCallOpts) -> Option<String> {
        self.proposal.lock().unwrap().clone()
    }
    async fn call_fast(&self, _prompt: &str) -> Option<String> {
        self.proposal.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingChat {
    dispatched: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl ChatBackend for RecordingChat {
    async fn post_coordination(&self, _chat_id: &str, _content: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn send_outbound(&self, _chat_id: &str, _text: &str) -> anyhow::Result<()> {
        Ok(())
    }
    async fn dispatch_reply(&self, chat_id: &str, text: &str, user_id: &str) -> anyhow::Result<String> {
        self.dispatched.lock().unwrap().push((chat_id.to_string(), text.to_string(), user_id.to_string()));
        Ok(text.to_string())
    }
}

/// A summary sink with exactly the write/find pair wired up; everything
/// else a fixed empty answer, enough for the synthesis-order scenario.
#[derive(Default)]
struct FakeSummarySink {
    summaries: Mutex<Vec<(String, String, String)>>,
}

#[async_trait]
impl SummarySink for FakeSummarySink {
    async fn write_summary(&self, round_id: &str, speaker: &str, content: &str, _source_chat_id: Option<&str>) -> anyhow::Result<()> {
        self.summaries.lock().unwrap().push((round_id.to_string(), speaker.to_string(), content.to_string()));
        Ok(())
    }
    async fn find_summary(&self, round_id: &str, speaker_name: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .summaries
            .lock()
            .unwrap()
            .iter()
            .find(|(r, s, _)| r == round_id && s == speaker_name)
            .map(|(_, _, c)| c.clone()))
    }
    async fn known_agents(&self, _source_chat_id: &str, _exclude: &str) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
    async fn recent_replies(&self, _source_chat_id: &str, _agent: &str, _limit: usize) -> anyhow::Result<Vec<String>> {
        Ok(vec![])
    }
    async fn recent_coordination_records(&self, _limit: usize) -> anyhow::Result<Vec<CoordinationEnvelope>> {
        Ok(vec![])
    }
}

fn cfg() -> RuntimeConfig {
    RuntimeConfig {
        max_round: Duration::from_secs(15),
        cleanup: Duration::from_secs(30),
        dedup_id_ttl: Duration::from_secs(720),
        dedup_content_ttl: Duration::from_secs(5),
        gateway_inflight_max: 3,
        layer2_inflight_max: 2,
        depth_cap: 6,
        backstop: Duration::from_millis(200),
        defer_backstop: Duration::from_millis(160),
        synthesis_wait: Duration::from_millis(300),
        poll_interval: Duration::from_secs(5),
        health_interval: Duration::from_secs(60),
        mark_dispatched_ttl: Duration::from_secs(60),
        thresholds: FilterThresholds::default(),
        history: HistoryLimits {
            max_records: 50,
            max_rounds: 5,
            max_chars: 8_000,
            peer_replies_per_agent: 2,
            peer_replies_max_chars: 4_000,
            summary_max_chars: 500,
            summary_poll: Duration::from_millis(20),
        },
        backoff: BackoffConfig::default(),
    }
}

fn proposal_json(angle: &str, confidence: f64, builds_on_other: bool) -> String {
    format!(
        r#"{{"angle":"{angle}","confidence":{confidence},"covers":[],"solo_sufficient":false,"builds_on_other":{builds_on_other}}}"#
    )
}

/// Scenario 3 + `ParallelBothReply`: two disjoint angles both get
/// `should_respond=true`, each sees the other's angle in its context.
#[tokio::test]
async fn parallel_both_reply_when_angles_are_disjoint() {
    let gateway = Arc::new(FixedGateway::always(Some(&proposal_json("security review", 0.80, false))));
    let chat = Arc::new(RecordingChat::default());
    let summary: Arc<dyn SummarySink> = Arc::new(FakeSummarySink::default());
    let mut alice = Engine::new("alice", cfg(), gateway, chat.clone(), summary);

    let effect = alice.round_start("r1", "please help", Some("chat1".into())).await;
    assert!(matches!(effect, EngineEffect::None));

    let other = MicroProposal { angle: "perf tuning".into(), confidence: 0.75, covers: vec![], solo_sufficient: false, builds_on_other: false };
    let effect = alice.peer_micro_propose("r1", "bob", other).await;
    let EngineEffect::Decision(decision) = effect else { panic!("expected a decision") };
    assert!(decision.should_respond);
    assert!(decision.synthesize_context.as_deref().unwrap().contains("perf tuning"));
    assert!(!decision.cancel_pending);
    assert!(decision.wait_for_response.is_none());
}

/// Scenario 4 + `SynthesisOrder`, driven through the real winner-writes/
/// runner-up-polls path: alice's holder actually dispatches her
/// `should_respond=true` decision (exercising `record_dispatch_summary`,
/// the fix for the missing `writeResponseSummary` call), and only then does
/// bob's holder poll the shared summary sink and fold it in — nothing here
/// seeds the sink directly.
#[tokio::test]
async fn synthesis_runner_up_folds_in_winners_summary_when_it_arrives_in_time() {
    let summary: Arc<dyn SummarySink> = Arc::new(FakeSummarySink::default());
    let alice_chat: Arc<dyn ChatBackend> = Arc::new(RecordingChat::default());
    let mut alice_holder = DispatchHolder::new(
        "alice",
        alice_chat.clone(),
        summary.clone(),
        cfg().history,
        cfg().backstop,
        cfg().defer_backstop,
        cfg().synthesis_wait,
        cfg().mark_dispatched_ttl,
    );
    let bob_chat: Arc<dyn ChatBackend> = Arc::new(RecordingChat::default());
    let mut bob_holder = DispatchHolder::new(
        "bob",
        bob_chat,
        summary,
        cfg().history,
        cfg().backstop,
        cfg().defer_backstop,
        cfg().synthesis_wait,
        cfg().mark_dispatched_ttl,
    );

    // Alice is the winner: her decision is an immediate `should_respond`.
    alice_holder.hold("m1a", "chat1", "alice's reply content", "user1");
    let alice_decision = DispatchDecision {
        round_id: "r1".into(),
        trigger_message_id: "m1a".into(),
        should_respond: true,
        synthesize_context: None,
        cancel_pending: false,
        wait_for_response: None,
        my_angle: Some("caching strategy".into()),
    };
    let HolderEffect::DispatchNow { chat_id, text, user_id, round_id: Some(round_id), .. } = alice_holder.apply_decision(&alice_decision) else {
        panic!("expected alice's immediate dispatch")
    };
    let response = alice_chat.dispatch_reply(&chat_id, &text, &user_id).await.unwrap();
    alice_holder.record_dispatch_summary(&round_id, &response, &chat_id).await;

    // Bob is the runner-up: his decision waits on alice's summary.
    bob_holder.hold("m1b", "chat1", "bob's original reply", "user1");
    let bob_decision = DispatchDecision {
        round_id: "r1".into(),
        trigger_message_id: "m1b".into(),
        should_respond: false,
        synthesize_context: None,
        cancel_pending: false,
        wait_for_response: Some(crate::types::WaitForResponse {
            winner_name: "alice".into(),
            my_proposal: MicroProposal { angle: "caching strategy".into(), confidence: 0.78, covers: vec![], solo_sufficient: false, builds_on_other: false },
            other_proposal: MicroProposal { angle: "caching strategy".into(), confidence: 0.82, covers: vec![], solo_sufficient: false, builds_on_other: true },
        }),
        my_angle: Some("caching strategy".into()),
    };
    let HolderEffect::ArmSynthesisWait { message_id, round_id, winner_name, timeout, summary, limits } = bob_holder.apply_decision(&bob_decision) else {
        panic!("expected synthesis wait")
    };

    let found = crate::history::wait_for_response_summary(&summary, &round_id, &winner_name, timeout, limits).await;
    match bob_holder.resolve_synthesis_wait(&message_id, &round_id, &winner_name, found) {
        HolderEffect::DispatchNow { text, .. } => {
            assert!(text.contains("alice's reply content"));
            assert!(text.contains("bob's original reply"));
        }
        _ => panic!("expected dispatch with folded-in summary"),
    }
}

/// Synthesis, no summary ever arrives: falls back to parallel-style
/// context rather than hanging or dispatching the bare original text.
#[tokio::test]
async fn synthesis_runner_up_falls_back_when_winner_never_responds() {
    let summary: Arc<dyn SummarySink> = Arc::new(FakeSummarySink::default());
    let chat: Arc<dyn ChatBackend> = Arc::new(RecordingChat::default());
    let mut holder = DispatchHolder::new(
        "bob",
        chat,
        summary,
        cfg().history,
        cfg().backstop,
        cfg().defer_backstop,
        Duration::from_millis(30),
        cfg().mark_dispatched_ttl,
    );
    holder.hold("m1", "chat1", "bob's original reply", "user1");
    let decision = DispatchDecision {
        round_id: "r1".into(),
        trigger_message_id: "m1".into(),
        should_respond: false,
        synthesize_context: None,
        cancel_pending: false,
        wait_for_response: Some(crate::types::WaitForResponse {
            winner_name: "alice".into(),
            my_proposal: MicroProposal { angle: "caching strategy".into(), confidence: 0.78, covers: vec![], solo_sufficient: false, builds_on_other: false },
            other_proposal: MicroProposal { angle: "caching strategy".into(), confidence: 0.82, covers: vec![], solo_sufficient: false, builds_on_other: true },
        }),
        my_angle: Some("caching strategy".into()),
    };
    let HolderEffect::ArmSynthesisWait { message_id, round_id, winner_name, timeout, summary, limits } = holder.apply_decision(&decision) else {
        panic!("expected synthesis wait")
    };

    let found = crate::history::wait_for_response_summary(&summary, &round_id, &winner_name, timeout, limits).await;
    match holder.resolve_synthesis_wait(&message_id, &round_id, &winner_name, found) {
        HolderEffect::DispatchNow { text, .. } => {
            assert!(text.contains("proceeding independently"));
            assert!(text.contains("bob's original reply"));
        }
        _ => panic!("expected fallback dispatch"),
    }
}

/// Scenario 6: proposal generator returns null. No `micro_propose` is
/// posted, the round is resolved (deleted from the live set), and the
/// holder dispatches the original text unprefixed once the fail-open
/// decision reaches it.
#[tokio::test]
async fn generator_null_fails_open_end_to_end() {
    let gateway = Arc::new(FixedGateway::always(None));
    let engine_chat = Arc::new(RecordingChat::default());
    let summary: Arc<dyn SummarySink> = Arc::new(FakeSummarySink::default());
    let mut engine = Engine::new("alice", cfg(), gateway, engine_chat.clone(), summary.clone());

    let holder_chat = Arc::new(RecordingChat::default());
    let mut holder = DispatchHolder::new(
        "alice",
        holder_chat.clone() as Arc<dyn ChatBackend>,
        summary,
        cfg().history,
        cfg().backstop,
        cfg().defer_backstop,
        cfg().synthesis_wait,
        cfg().mark_dispatched_ttl,
    );

    holder.hold("m1", "chat1", "the original user-facing text", "user1");
    let effect = engine.round_start("m1", "please help", None).await;
    assert!(engine_chat.dispatched.lock().unwrap().is_empty()); // fail-open never calls dispatch_reply itself, the holder does

    let EngineEffect::Decision(decision) = effect else { panic!("expected fail-open decision") };
    assert!(decision.should_respond);
    assert!(decision.synthesize_context.is_none());

    let holder_effect = holder.apply_decision(&decision);
    match holder_effect {
        HolderEffect::DispatchNow { text, chat_id, user_id, angle, .. } => {
            assert_eq!(text, "the original user-facing text");
            assert_eq!(chat_id, "chat1");
            assert_eq!(user_id, "user1");
            assert!(angle.is_none());
        }
        _ => panic!("expected immediate dispatch"),
    }
}

/// Scenario 5 + `DedupIdempotence`/`UniqueDispatch` at the durable-row
/// layer: the fast path and the safety-net poll both observe the same
/// `message_id`; the CAS claim lets exactly one path own the callback, and
/// the stale rows seeded before `boot_time` never reach a callback at all.
#[derive(Default)]
struct FakeRowStore {
    claimed: Mutex<std::collections::HashSet<String>>,
    rows: Mutex<Vec<InboundRow>>,
    bulk_marked: Mutex<bool>,
}

#[async_trait]
impl DurableRowStore for FakeRowStore {
    async fn claim(&self, _bot_id: &str, message_id: &str) -> anyhow::Result<bool> {
        Ok(self.claimed.lock().unwrap().insert(message_id.to_string()))
    }
    async fn bulk_mark_stale(&self, bot_id: &str, boot_time: DateTime<Utc>) -> anyhow::Result<()> {
        *self.bulk_marked.lock().unwrap() = true;
        self.rows.lock().unwrap().retain(|r| !(r.bot_id == bot_id && r.created_at < boot_time));
        Ok(())
    }
    async fn poll_pending(&self, bot_id: &str) -> anyhow::Result<Vec<InboundRow>> {
        Ok(self.rows.lock().unwrap().iter().filter(|r| r.bot_id == bot_id).cloned().collect())
    }
}

#[tokio::test]
async fn duplicate_row_claim_is_won_by_exactly_one_path() {
    let store = FakeRowStore::default();
    let first = store.claim("bot1", "m1").await.unwrap();
    let second = store.claim("bot1", "m1").await.unwrap();
    assert!(first);
    assert!(!second);
}

#[tokio::test]
async fn stale_rows_are_quarantined_without_a_callback() {
    let boot_time = Utc::now();
    let store = FakeRowStore::default();
    store.rows.lock().unwrap().push(InboundRow {
        bot_id: "bot1".into(),
        message_id: "old".into(),
        created_at: boot_time - chrono::Duration::seconds(10),
        dispatch: crate::types::InboundDispatch {
            chat_id: "chat1".into(),
            text: "stale".into(),
            user_id: "user1".into(),
            message_id: "old".into(),
            speaker: "user1".into(),
        },
    });
    store.bulk_mark_stale("bot1", boot_time).await.unwrap();
    let pending = store.poll_pending("bot1").await.unwrap();
    assert!(pending.is_empty());
}
