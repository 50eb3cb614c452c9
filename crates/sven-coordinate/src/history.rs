// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort reads that enrich proposal prompts; every failure degrades to
//! an empty string rather than blocking round progress.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::host::SummarySink;
use crate::types::{CoordinationKind, Mode};

/// Caps applied when assembling [`load_coordination_history`]'s output.
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub max_records: usize,
    pub max_rounds: usize,
    pub max_chars: usize,
    pub peer_replies_per_agent: usize,
    pub peer_replies_max_chars: usize,
    pub summary_max_chars: usize,
    pub summary_poll: Duration,
}

/// Group the most recent coordination records by round, excluding
/// `exclude_round_id`, and project each round into a short multi-line
/// summary (intent / proposal / resolved / peer response-summary lines),
/// capped at `limits.max_rounds` rounds and `limits.max_chars` total chars.
pub async fn load_coordination_history(
    sink: &Arc<dyn SummarySink>,
    exclude_round_id: &str,
    limits: HistoryLimits,
) -> String {
    let records = match sink.recent_coordination_records(limits.max_records).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "history: failed to load coordination records, degrading to empty");
            return String::new();
        }
    };

    // Group by round_id, preserving first-seen order (most-recent-first,
    // since `recent_coordination_records` returns newest first).
    let mut order: Vec<String> = Vec::new();
    let mut by_round: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for rec in records {
        let Some(round_id) = rec.round_id.clone() else { continue };
        if round_id == exclude_round_id {
            continue;
        }
        let line = project_record_line(&rec.kind);
        let Some(line) = line else { continue };
        if !by_round.contains_key(&round_id) {
            order.push(round_id.clone());
        }
        by_round.entry(round_id).or_default().push(line);
    }

    let mut out = String::new();
    let mut rounds_used = 0;
    for round_id in order {
        if rounds_used >= limits.max_rounds {
            break;
        }
        let Some(lines) = by_round.get(&round_id) else { continue };
        let mut block = format!("round {round_id}:\n");
        for line in lines {
            block.push_str("  ");
            block.push_str(line);
            block.push('\n');
        }
        if out.len() + block.len() > limits.max_chars {
            break;
        }
        out.push_str(&block);
        rounds_used += 1;
    }
    out
}

fn project_record_line(kind: &CoordinationKind) -> Option<String> {
    match kind {
        CoordinationKind::RoundStart { trigger_content, .. } => {
            Some(format!("intent: {trigger_content}"))
        }
        CoordinationKind::MicroPropose { proposal } => {
            Some(format!("proposal: {} (confidence {:.2})", proposal.angle, proposal.confidence))
        }
        CoordinationKind::Resolved { mode, winner, reason, .. } => {
            Some(format!("resolved: {} -> {winner} ({reason})", mode_label(*mode)))
        }
        _ => None,
    }
}

fn mode_label(mode: Mode) -> &'static str {
    match mode {
        Mode::Solo => "solo",
        Mode::Parallel => "parallel",
        Mode::Synthesis => "synthesis",
    }
}

/// Discover other agent names that have written summaries in
/// `source_chat_id`, then pull up to `peer_replies_per_agent` recent replies
/// per agent, truncated and capped as specified.
pub async fn load_recent_peer_replies(
    sink: &Arc<dyn SummarySink>,
    source_chat_id: &str,
    my_name: &str,
    limits: HistoryLimits,
) -> String {
    let agents = match sink.known_agents(source_chat_id, my_name).await {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "history: failed to discover peer agents, degrading to empty");
            return String::new();
        }
    };

    let mut out = String::new();
    'agents: for agent in agents {
        let replies = sink
            .recent_replies(source_chat_id, &agent, limits.peer_replies_per_agent)
            .await
            .unwrap_or_default();
        for reply in replies {
            let truncated: String = reply.chars().take(500).collect();
            let line = format!("{agent}: {truncated}\n");
            if out.len() + line.len() > limits.peer_replies_max_chars {
                break 'agents;
            }
            out.push_str(&line);
        }
    }
    out
}

/// Fire-and-forget write to the summary sink; content truncated to
/// `limits.summary_max_chars`. Failures are logged, never propagated.
pub async fn write_response_summary(
    sink: &Arc<dyn SummarySink>,
    round_id: &str,
    speaker: &str,
    content: &str,
    source_chat_id: Option<&str>,
    limits: HistoryLimits,
) {
    let truncated: String = content.chars().take(limits.summary_max_chars).collect();
    if let Err(e) = sink.write_summary(round_id, speaker, &truncated, source_chat_id).await {
        warn!(error = %e, round_id, speaker, "history: failed to write response summary");
    }
}

/// Poll `sink` at `limits.summary_poll` cadence for a summary matching
/// `(round_id, speaker_name)`, up to `timeout`. Returns `None` on timeout or
/// read failure.
pub async fn wait_for_response_summary(
    sink: &Arc<dyn SummarySink>,
    round_id: &str,
    speaker_name: &str,
    timeout: Duration,
    limits: HistoryLimits,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut interval = tokio::time::interval(limits.summary_poll);
    loop {
        match sink.find_summary(round_id, speaker_name).await {
            Ok(Some(content)) => return Some(content),
            Ok(None) => {}
            Err(e) => warn!(error = %e, round_id, speaker_name, "history: summary poll read failed"),
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::time::sleep_until(deadline) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CoordinationEnvelope;
    use crate::types::{CoordinationKind, MicroProposal};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeSink {
        records: Vec<CoordinationEnvelope>,
        summaries: Mutex<Vec<(String, String, String)>>,
        agents: Vec<String>,
        replies: std::collections::HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl SummarySink for FakeSink {
        async fn write_summary(
            &self,
            round_id: &str,
            speaker: &str,
            content: &str,
            _source_chat_id: Option<&str>,
        ) -> anyhow::Result<()> {
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

        async fn known_agents(&self, _source_chat_id: &str, exclude: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.agents.iter().filter(|a| a.as_str() != exclude).cloned().collect())
        }

        async fn recent_replies(&self, _source_chat_id: &str, agent: &str, limit: usize) -> anyhow::Result<Vec<String>> {
            Ok(self.replies.get(agent).cloned().unwrap_or_default().into_iter().take(limit).collect())
        }

        async fn recent_coordination_records(&self, limit: usize) -> anyhow::Result<Vec<CoordinationEnvelope>> {
            Ok(self.records.iter().take(limit).cloned().collect())
        }
    }

    fn limits() -> HistoryLimits {
        HistoryLimits {
            max_records: 50,
            max_rounds: 5,
            max_chars: 8_000,
            peer_replies_per_agent: 2,
            peer_replies_max_chars: 4_000,
            summary_max_chars: 500,
            summary_poll: Duration::from_millis(10),
        }
    }

    fn record(round_id: &str, kind: CoordinationKind) -> CoordinationEnvelope {
        CoordinationEnvelope {
            protocol: "sven-coordinate/1".into(),
            round_id: Some(round_id.to_string()),
            source_chat_id: None,
            from: Some("peer".into()),
            kind,
        }
    }

    #[tokio::test]
    async fn coordination_history_excludes_current_round() {
        let sink: Arc<dyn SummarySink> = Arc::new(FakeSink {
            records: vec![
                record("current", CoordinationKind::RoundStart { trigger_message_id: "current".into(), trigger_content: "hi".into() }),
                record("past", CoordinationKind::RoundStart { trigger_message_id: "past".into(), trigger_content: "older message".into() }),
            ],
            ..Default::default()
        });
        let out = load_coordination_history(&sink, "current", limits()).await;
        assert!(out.contains("older message"));
        assert!(!out.contains("hi"));
    }

    #[tokio::test]
    async fn coordination_history_projects_resolved_records() {
        let sink: Arc<dyn SummarySink> = Arc::new(FakeSink {
            records: vec![record(
                "r1",
                CoordinationKind::Resolved {
                    mode: Mode::Solo,
                    winner: "alice".into(),
                    runner_up: Some("bob".into()),
                    reason: "confident".into(),
                    my_proposal: MicroProposal { angle: "x".into(), confidence: 0.9, covers: vec![], solo_sufficient: true, builds_on_other: false },
                    other_proposal: MicroProposal { angle: "y".into(), confidence: 0.1, covers: vec![], solo_sufficient: false, builds_on_other: false },
                },
            )],
            ..Default::default()
        });
        let out = load_coordination_history(&sink, "none", limits()).await;
        assert!(out.contains("solo"));
        assert!(out.contains("alice"));
    }

    #[tokio::test]
    async fn peer_replies_truncated_and_capped() {
        let mut replies = std::collections::HashMap::new();
        replies.insert("peer".to_string(), vec!["a".repeat(600), "short reply".to_string()]);
        let sink: Arc<dyn SummarySink> = Arc::new(FakeSink {
            agents: vec!["peer".into()],
            replies,
            ..Default::default()
        });
        let out = load_recent_peer_replies(&sink, "chat1", "me", limits()).await;
        assert!(out.contains("peer: "));
        // First reply truncated to 500 chars of 'a'.
        let a_run: String = out.chars().filter(|c| *c == 'a').collect();
        assert_eq!(a_run.len(), 500);
        assert!(out.contains("short reply"));
    }

    #[tokio::test]
    async fn write_then_find_summary_round_trips() {
        let sink: Arc<dyn SummarySink> = Arc::new(FakeSink::default());
        write_response_summary(&sink, "r1", "alice", "the answer", None, limits()).await;
        let found = wait_for_response_summary(&sink, "r1", "alice", Duration::from_millis(50), limits()).await;
        assert_eq!(found.as_deref(), Some("the answer"));
    }

    #[tokio::test]
    async fn wait_for_summary_times_out_when_absent() {
        let sink: Arc<dyn SummarySink> = Arc::new(FakeSink::default());
        let found = wait_for_response_summary(&sink, "r1", "alice", Duration::from_millis(30), limits()).await;
        assert!(found.is_none());
    }
}
