//! Plain-text rendering for CLI output.

use std::fmt::Write;

use redbox_core::classifier::{Classification, RuleDef};
use redbox_core::config::Config;

use crate::replay::ReplayResult;

pub fn render_replay(result: &ReplayResult, config: &Config) -> String {
    let report = &result.report;
    let snapshot = &report.final_snapshot;
    let mut out = String::new();

    let _ = writeln!(out, "connection: {}", report.connection_id);
    let _ = writeln!(out, "events: {}", result.events_applied);
    let _ = writeln!(out, "epoch: {}", snapshot.build_epoch);
    let _ = writeln!(
        out,
        "commits: shown={} replaced={} cleared={} unchanged={} stale={}",
        report.session.shown,
        report.session.replaced,
        report.session.cleared,
        report.session.unchanged,
        report.session.stale_discarded
    );

    let Some(diagnostic) = snapshot.diagnostic.as_deref() else {
        let _ = writeln!(out, "overlay: empty");
        return out;
    };

    let _ = writeln!(
        out,
        "overlay: showing{}",
        if snapshot.rebuilding { " (rebuilding)" } else { "" }
    );
    let causes: Vec<&str> = diagnostic.causes.iter().map(|t| t.as_str()).collect();
    let _ = writeln!(out, "causes: {}", causes.join(", "));
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", diagnostic.description);
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", diagnostic.causes_text());
    let _ = writeln!(out);
    let _ = writeln!(out, "details:");
    for line in diagnostic.details(config.overlay.detail_max_chars) {
        let _ = writeln!(out, "  {line}");
    }
    out
}

pub fn render_classification(classification: &Classification) -> String {
    let mut out = String::new();
    let tags: Vec<&str> = classification.tags.iter().map(|t| t.as_str()).collect();
    let _ = writeln!(out, "causes: {}", tags.join(", "));
    if classification.matched_rules.is_empty() {
        let _ = writeln!(out, "rules: (none)");
    } else {
        let _ = writeln!(out, "rules:");
        for rule in &classification.matched_rules {
            let _ = writeln!(out, "  {rule}");
        }
    }
    if let Some(nesting) = &classification.nesting {
        let _ = writeln!(
            out,
            "nesting: <{}> inside <{}>: {}",
            nesting.child, nesting.parent, nesting.reason
        );
    }
    out
}

pub fn render_rules(rules: &[RuleDef]) -> String {
    let width = rules.iter().map(|r| r.id.len()).max().unwrap_or(0);
    let mut out = String::new();
    for rule in rules {
        let scope = match rule.scope {
            redbox_core::classifier::RuleScope::Source => "source",
            redbox_core::classifier::RuleScope::Observed => "observed",
            redbox_core::classifier::RuleScope::Any => "any",
        };
        let _ = writeln!(
            out,
            "{:<width$}  {:<14} {:<8} {}",
            rule.id,
            rule.tag.as_str(),
            scope,
            rule.description
        );
    }
    let _ = writeln!(out, "{} rules", rules.len());
    out
}
