//! Property-based tests for the overlay session, classifier, and composer.
//!
//! Covers empty-pass idempotence, cause ordering and uniqueness, the
//! Unknown fallback rule, replacement semantics, and epoch monotonicity.

use std::sync::Arc;

use proptest::prelude::*;
use redbox_core::classifier::{CauseClassifier, CauseTag};
use redbox_core::composer::DiagnosticComposer;
use redbox_core::events::ConnectionId;
use redbox_core::overlay::{CommitOutcome, OverlaySession};
use redbox_core::rebuild::{BuildEpoch, EpochClock};
use redbox_core::signals::{MismatchSignal, NodePath, RenderPassId, SignalCollector};

// ============================================================================
// Strategies
// ============================================================================

/// Source fragments, each known to trigger (or not) one cause.
fn arb_source_fragment() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("const isClient = typeof window !== 'undefined'"),
        Just("const now = Date.now()"),
        Just("const id = Math.random()"),
        Just("value.toLocaleDateString()"),
        Just("new Intl.NumberFormat('de').format(n)"),
        Just("const token = localStorage.getItem('t')"),
        Just("const res = await fetch('/api')"),
        Just("return <span>{props.label}</span>"),
        Just(""),
    ]
}

fn arb_tag() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("div"),
        Just("span"),
        Just("main"),
        Just("section"),
        Just("p"),
        Just("ul"),
        Just("li"),
        Just("a"),
        Just("button"),
        Just("table"),
        Just("tr"),
    ]
}

fn arb_node_path() -> impl Strategy<Value = NodePath> {
    proptest::collection::vec(arb_tag(), 1..6)
        .prop_map(|tags| NodePath::new(tags.into_iter().map(str::to_string).collect()))
}

fn arb_signal() -> impl Strategy<Value = MismatchSignal> {
    (
        arb_node_path(),
        "[a-z ]{0,12}",
        "[a-z ]{0,12}",
        proptest::collection::vec(arb_source_fragment(), 0..3),
        any::<bool>(),
    )
        .prop_map(|(path, client, server, fragments, outside)| {
            let mut signal = MismatchSignal::client(path, client)
                .with_counterpart(server)
                .with_outside_snapshot(outside);
            if !fragments.is_empty() {
                signal = signal.with_component_source(fragments.join("\n"));
            }
            signal
        })
}

fn arb_signals() -> impl Strategy<Value = Vec<MismatchSignal>> {
    proptest::collection::vec(arb_signal(), 1..6)
}

/// One step applied to a session: commit a pass (with some signals) or rebuild.
#[derive(Debug, Clone)]
enum Step {
    Pass(Vec<MismatchSignal>),
    StalePass(Vec<MismatchSignal>),
    Rebuild,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => proptest::collection::vec(arb_signal(), 0..3).prop_map(Step::Pass),
        1 => proptest::collection::vec(arb_signal(), 0..3).prop_map(Step::StalePass),
        1 => Just(Step::Rebuild),
    ]
}

fn new_session() -> (OverlaySession, Arc<EpochClock>) {
    let clock = EpochClock::shared();
    let session = OverlaySession::new(ConnectionId(1), clock.clone(), DiagnosticComposer::default());
    (session, clock)
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Property 1: empty passes on an empty session never show anything.
    #[test]
    fn empty_passes_keep_session_empty(passes in 1usize..20) {
        let (mut session, clock) = new_session();
        for _ in 0..passes {
            let outcome = session.commit_pass(clock.current(), Vec::new());
            prop_assert_eq!(outcome, CommitOutcome::Unchanged);
            prop_assert!(!session.has_active());
        }
        prop_assert_eq!(session.snapshot().commit_seq, 0);
    }

    /// Property 2: causes are non-empty, duplicate-free, and in precedence order.
    #[test]
    fn causes_are_ordered_and_unique(signals in arb_signals()) {
        let composer = DiagnosticComposer::default();
        let diagnostic = composer.compose(BuildEpoch(0), &signals).unwrap();
        let causes = diagnostic.causes.to_vec();
        prop_assert!(!causes.is_empty());
        for pair in causes.windows(2) {
            prop_assert!(pair[0].precedence() < pair[1].precedence());
        }
    }

    /// Property 3: Unknown appears iff some signal matched no rule.
    #[test]
    fn unknown_iff_some_signal_unmatched(signals in arb_signals()) {
        let classifier = CauseClassifier::new();
        let composer = DiagnosticComposer::new(Arc::new(CauseClassifier::new()));
        let diagnostic = composer.compose(BuildEpoch(0), &signals).unwrap();
        let some_unmatched = signals
            .iter()
            .any(|s| classifier.classify(s).to_vec() == vec![CauseTag::Unknown]);
        prop_assert_eq!(diagnostic.causes.contains(CauseTag::Unknown), some_unmatched);
        if let Some(last) = diagnostic.causes.to_vec().last() {
            if diagnostic.causes.contains(CauseTag::Unknown) {
                prop_assert_eq!(*last, CauseTag::Unknown);
            }
        }
    }

    /// Property 4: per-signal classification is deterministic and never empty.
    #[test]
    fn classification_is_deterministic(signal in arb_signal()) {
        let classifier = CauseClassifier::new();
        let first = classifier.explain(&signal);
        let second = classifier.explain(&signal);
        prop_assert!(!first.tags.is_empty());
        prop_assert_eq!(&first, &second);
        if first.tags.contains(CauseTag::Unknown) {
            prop_assert_eq!(first.tags.len(), 1);
            prop_assert!(first.matched_rules.is_empty());
        }
    }

    /// Property 5: the description and warning never depend on the causes.
    #[test]
    fn wording_is_cause_independent(a in arb_signals(), b in arb_signals()) {
        let composer = DiagnosticComposer::default();
        let da = composer.compose(BuildEpoch(0), &a).unwrap();
        let db = composer.compose(BuildEpoch(7), &b).unwrap();
        prop_assert_eq!(&da.description, &db.description);
        prop_assert_eq!(&da.warning, &db.warning);
        prop_assert_eq!(da.bullets().len(), 5);
    }

    /// Property 6: the session mirrors the latest non-stale pass, and nothing
    /// composed under an older epoch is visible after a newer commit.
    #[test]
    fn session_tracks_latest_current_pass(steps in proptest::collection::vec(arb_step(), 1..30)) {
        let (mut session, clock) = new_session();
        let mut expected_active: Option<usize> = None;
        let mut last_commit_epoch = BuildEpoch(0);

        for step in steps {
            match step {
                Step::Rebuild => {
                    let epoch = clock.advance();
                    session.on_rebuild(epoch);
                }
                Step::StalePass(signals) => {
                    let current = clock.current();
                    if current.0 == 0 {
                        continue;
                    }
                    let outcome = session.commit_pass(BuildEpoch(current.0 - 1), signals);
                    prop_assert!(outcome.is_stale());
                }
                Step::Pass(signals) => {
                    let epoch = clock.current();
                    let count = signals.len();
                    session.commit_pass(epoch, signals);
                    last_commit_epoch = epoch;
                    expected_active = (count > 0).then_some(count);
                }
            }

            match (expected_active, session.state().diagnostic()) {
                (None, None) => {}
                (Some(count), Some(d)) => {
                    prop_assert_eq!(d.raw_signals.len(), count);
                    prop_assert_eq!(d.epoch, last_commit_epoch);
                }
                (want, got) => {
                    prop_assert!(false, "expected {:?} signals, got {:?}", want, got.map(|d| d.raw_signals.len()));
                }
            }
        }
    }

    /// Property 7: collected passes never hold two signals for one node path,
    /// and the first recorded one wins.
    #[test]
    fn collector_dedups_first_wins(signals in proptest::collection::vec(arb_signal(), 0..20)) {
        let mut collector = SignalCollector::new(64);
        let pass = RenderPassId(1);
        collector.begin_pass(pass);
        for signal in &signals {
            collector.record_signal(pass, signal.clone());
        }
        let collected = collector.collect(pass);
        let mut seen = std::collections::HashSet::new();
        for signal in &collected {
            prop_assert!(seen.insert(signal.node_path.clone()));
            let first = signals.iter().find(|s| s.node_path == signal.node_path).unwrap();
            prop_assert_eq!(first, signal);
        }
        prop_assert_eq!(seen.len(), signals.iter().map(|s| s.node_path.clone()).collect::<std::collections::HashSet<_>>().len());
    }

    /// Property 8: epochs only move forward.
    #[test]
    fn epoch_clock_is_monotonic(advances in 0usize..50) {
        let clock = EpochClock::new();
        let mut last = clock.current();
        for _ in 0..advances {
            let next = clock.advance();
            prop_assert!(next > last);
            prop_assert!(clock.is_stale(last));
            last = next;
        }
        prop_assert_eq!(clock.current(), BuildEpoch(advances as u64));
    }
}
