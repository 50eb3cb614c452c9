// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pure, deterministic mode selection over a pair of micro-proposals.
//!
//! [`filter`] reads no register state, no timers, and does no I/O, so both
//! peers in a round compute the identical [`FilterResult`] from the same
//! two proposals — the filter's determinism substitutes for an ordering
//! protocol between independently-running instances.

use std::collections::{BTreeMap, HashSet};

use crate::types::{FilterResult, MicroProposal, Mode};

/// Tunable thresholds the routing rules compare against. Field names match
/// the configuration surface (`sven_config::CoordinateConfig`).
#[derive(Debug, Clone, Copy)]
pub struct FilterThresholds {
    pub gap: f64,
    pub overlap: f64,
    pub high: f64,
    pub low: f64,
    pub synth: f64,
    pub epsilon: f64,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self { gap: 0.3, overlap: 0.5, high: 0.5, low: 0.3, synth: 0.7, epsilon: 0.01 }
    }
}

/// Tokens of length > 2, lowercased, whitespace-split.
fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 2)
        .collect()
}

/// Jaccard similarity over token sets built from `angle + " " + covers`.
/// Both-empty is defined as fully similar (1.0); exactly-one-empty as fully
/// dissimilar (0.0) — there is no meaningful overlap to measure otherwise.
pub fn sim(a: &MicroProposal, b: &MicroProposal) -> f64 {
    let ta = tokens(&a.similarity_text());
    let tb = tokens(&b.similarity_text());
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f64 / union as f64
}

/// Decide `(winner, runner_up)` by confidence, falling back to
/// lexicographic name order within `epsilon` of a tie.
fn pick_winner<'a>(
    my_name: &'a str,
    my: &MicroProposal,
    other_name: &'a str,
    other: &MicroProposal,
    epsilon: f64,
) -> (&'a str, &'a str) {
    let delta = my.confidence - other.confidence;
    if delta.abs() < epsilon {
        if my_name <= other_name {
            (my_name, other_name)
        } else {
            (other_name, my_name)
        }
    } else if delta > 0.0 {
        (my_name, other_name)
    } else {
        (other_name, my_name)
    }
}

/// Run the six routing rules in order against `my`/`other`, returning the
/// first match. Symmetric under swapping `(my, my_name)` with
/// `(other, other_name)` — see the `filter_determinism` test below and
/// `FilterDeterminism`/`PeerAgreement` in the crate's integration tests.
pub fn filter(
    my_name: &str,
    my: &MicroProposal,
    other_name: &str,
    other: &MicroProposal,
    thresholds: FilterThresholds,
) -> FilterResult {
    let mut proposals = BTreeMap::new();
    proposals.insert(my_name.to_string(), my.clone());
    proposals.insert(other_name.to_string(), other.clone());

    let delta_conf = (my.confidence - other.confidence).abs();
    let similarity = sim(my, other);
    let (winner, runner_up) = pick_winner(my_name, my, other_name, other, thresholds.epsilon);

    // Rule 1: confidence gap dominates — the more confident proposal stands
    // alone regardless of angle overlap.
    if delta_conf > thresholds.gap {
        return FilterResult {
            mode: Mode::Solo,
            winner: winner.to_string(),
            runner_up: Some(runner_up.to_string()),
            reason: format!(
                "confidence gap {delta_conf:.2} exceeds {:.2}: {winner} leads",
                thresholds.gap
            ),
            proposals,
        };
    }

    let both_high = my.confidence > thresholds.high && other.confidence > thresholds.high;
    let both_synth = my.confidence > thresholds.synth && other.confidence > thresholds.synth;
    let both_low = my.confidence < thresholds.low && other.confidence < thresholds.low;

    // Rule 2: both confident, angles don't overlap — let both reply.
    if both_high && similarity < thresholds.overlap {
        return FilterResult {
            mode: Mode::Parallel,
            winner: winner.to_string(),
            runner_up: Some(runner_up.to_string()),
            reason: format!(
                "both confident (>{:.2}) with low overlap ({similarity:.2} < {:.2}): distinct angles",
                thresholds.high, thresholds.overlap
            ),
            proposals,
        };
    }

    // Rule 3: both highly confident, angles overlap, and at least one wants
    // to build on the other — winner replies first, runner-up synthesizes.
    let builds_on_other = my.builds_on_other || other.builds_on_other;
    if both_synth && similarity >= thresholds.overlap && builds_on_other {
        return FilterResult {
            mode: Mode::Synthesis,
            winner: winner.to_string(),
            runner_up: Some(runner_up.to_string()),
            reason: format!(
                "both highly confident (>{:.2}) with overlap ({similarity:.2} >= {:.2}) and a build-on request",
                thresholds.synth, thresholds.overlap
            ),
            proposals,
        };
    }

    // Rule 4: both confident and overlapping, but no one wants to build on
    // the other — redundant, let the stronger one answer alone.
    if both_high && similarity >= thresholds.overlap {
        return FilterResult {
            mode: Mode::Solo,
            winner: winner.to_string(),
            runner_up: Some(runner_up.to_string()),
            reason: format!(
                "both confident (>{:.2}) with overlapping angles ({similarity:.2} >= {:.2}): redundant, {winner} leads",
                thresholds.high, thresholds.overlap
            ),
            proposals,
        };
    }

    // Rule 5: neither is confident — default to the higher (or lex-lower on
    // tie) of the two rather than risk two weak replies.
    if both_low {
        return FilterResult {
            mode: Mode::Solo,
            winner: winner.to_string(),
            runner_up: Some(runner_up.to_string()),
            reason: format!("both low confidence (<{:.2}): {winner} leads by default", thresholds.low),
            proposals,
        };
    }

    // Rule 6: default.
    FilterResult {
        mode: Mode::Solo,
        winner: winner.to_string(),
        runner_up: Some(runner_up.to_string()),
        reason: format!("no rule matched: {winner} leads by default"),
        proposals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mp(angle: &str, confidence: f64, covers: &[&str], builds_on_other: bool) -> MicroProposal {
        MicroProposal {
            angle: angle.to_string(),
            confidence,
            covers: covers.iter().map(|s| s.to_string()).collect(),
            solo_sufficient: false,
            builds_on_other,
        }
    }

    // ── sim() ─────────────────────────────────────────────────────────────

    #[test]
    fn sim_both_empty_is_one() {
        let a = mp("", 0.5, &[], false);
        let b = mp("", 0.5, &[], false);
        assert_eq!(sim(&a, &b), 1.0);
    }

    #[test]
    fn sim_one_empty_is_zero() {
        let a = mp("", 0.5, &[], false);
        let b = mp("performance", 0.5, &[], false);
        assert_eq!(sim(&a, &b), 0.0);
    }

    #[test]
    fn sim_ignores_short_tokens() {
        let a = mp("the a it of perf", 0.5, &[], false);
        let b = mp("perf", 0.5, &[], false);
        // "the", "a", "it", "of" are all length <= 2 or filtered; only "perf" counts
        assert_eq!(sim(&a, &b), 1.0);
    }

    #[test]
    fn sim_identical_angles_is_one() {
        let a = mp("caching strategy", 0.8, &["redis"], false);
        let b = mp("caching strategy", 0.7, &["redis"], false);
        assert_eq!(sim(&a, &b), 1.0);
    }

    #[test]
    fn sim_disjoint_angles_is_zero() {
        let a = mp("security review", 0.8, &[], false);
        let b = mp("performance tuning", 0.8, &[], false);
        assert_eq!(sim(&a, &b), 0.0);
    }

    // ── routing rules (spec §8 scenarios 1-4) ───────────────────────────────

    #[test]
    fn scenario_1_clear_solo() {
        let a = mp("perf", 0.85, &["latency"], false);
        let b = mp("perf", 0.40, &["latency"], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Solo);
        assert_eq!(r.winner, "A");
        assert_eq!(r.runner_up.as_deref(), Some("B"));
    }

    #[test]
    fn scenario_2_tie_goes_to_lex_smaller() {
        let a = mp("x", 0.70, &[], false);
        let b = mp("y", 0.705, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.winner, "A");
        let r2 = filter("B", &b, "A", &a, FilterThresholds::default());
        assert_eq!(r2.winner, "A");
    }

    #[test]
    fn scenario_3_parallel_on_disjoint_high_confidence() {
        let a = mp("security review", 0.80, &[], false);
        let b = mp("perf tuning", 0.75, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Parallel);
    }

    #[test]
    fn scenario_4_synthesis_with_build_on() {
        let a = mp("caching strategy", 0.82, &[], true);
        let b = mp("caching strategy", 0.78, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Synthesis);
        assert_eq!(r.winner, "A");
    }

    #[test]
    fn rule_4_overlap_without_build_on_is_solo() {
        let a = mp("caching strategy", 0.82, &[], false);
        let b = mp("caching strategy", 0.78, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Solo);
        assert_eq!(r.winner, "A");
    }

    #[test]
    fn rule_5_both_low_confidence_is_solo() {
        let a = mp("x", 0.2, &[], false);
        let b = mp("y", 0.1, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Solo);
    }

    #[test]
    fn rule_6_default_mid_confidence_disagreement_is_solo() {
        // both between low and high, small confidence gap, some overlap but
        // not high enough to hit rule 2/3/4 thresholds.
        let a = mp("x", 0.45, &[], false);
        let b = mp("y", 0.40, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Solo);
    }

    // ── universal properties (spec §8) ──────────────────────────────────────

    #[test]
    fn filter_determinism_is_symmetric_under_swap() {
        let a = mp("caching", 0.72, &["redis"], true);
        let b = mp("caching layer", 0.70, &["redis"], false);
        let r1 = filter("alice", &a, "bob", &b, FilterThresholds::default());
        let r2 = filter("bob", &b, "alice", &a, FilterThresholds::default());
        assert_eq!(r1.mode, r2.mode);
        assert_eq!(r1.winner, r2.winner);
        assert_eq!(r1.runner_up, r2.runner_up);
    }

    #[test]
    fn tie_break_uses_lexicographic_name_order() {
        let a = mp("x", 0.5, &[], false);
        let b = mp("y", 0.5005, &[], false);
        let r = filter("zeta", &a, "alpha", &b, FilterThresholds::default());
        // |Δ| < epsilon, so the lexicographically smaller name wins regardless
        // of which positional argument ("my" vs "other") it was passed as.
        assert_eq!(r.winner, "alpha");
    }

    #[test]
    fn parallel_both_reply_implies_both_are_winner_or_runner_up() {
        let a = mp("security review", 0.80, &[], false);
        let b = mp("perf tuning", 0.75, &[], false);
        let r = filter("A", &a, "B", &b, FilterThresholds::default());
        assert_eq!(r.mode, Mode::Parallel);
        let names: HashSet<_> = [r.winner.clone(), r.runner_up.clone().unwrap()].into_iter().collect();
        assert!(names.contains("A") && names.contains("B"));
    }

    #[test]
    fn peer_agreement_same_inputs_same_output_from_either_instance() {
        let a = mp("perf", 0.85, &["latency"], false);
        let b = mp("perf", 0.40, &["latency"], false);
        let from_a = filter("A", &a, "B", &b, FilterThresholds::default());
        let from_b = filter("B", &b, "A", &a, FilterThresholds::default());
        assert_eq!(from_a.mode, from_b.mode);
        assert_eq!(from_a.winner, from_b.winner);
        assert_eq!(from_a.runner_up, from_b.runner_up);
    }
}
