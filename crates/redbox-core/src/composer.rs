//! Diagnostic composition.
//!
//! Turns the non-empty signal set of one render pass into a single
//! [`Diagnostic`]. The description and warning body are fixed text that
//! overlay UIs and browser harnesses compare literally, so they are kept here
//! as constants and never assembled from the classification result. The
//! classification only decides `causes` (and which bullets a UI highlights).

use std::fmt::Write;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::{CauseClassifier, CauseSet, CauseTag, Classification};
use crate::error::ComposeError;
use crate::rebuild::BuildEpoch;
use crate::signals::MismatchSignal;

/// Fixed description shown for every hydration mismatch.
pub const HYDRATION_DESCRIPTION: &str = "Hydration failed because the server rendered HTML didn't match the client. As a result this tree will be regenerated on the client. This can happen if a SSR-ed Client Component used\nSee more info here: https://nextjs.org/docs/messages/react-hydration-error";

/// Taxonomy bullets in precedence order. `Unknown` has no bullet.
pub const CAUSE_BULLETS: [(CauseTag, &str); 5] = [
    (
        CauseTag::EnvBranch,
        "- A server/client branch `if (typeof window !== 'undefined')`.",
    ),
    (
        CauseTag::VolatileApi,
        "- Variable input such as `Date.now()` or `Math.random()` which changes each time it's called.",
    ),
    (
        CauseTag::LocaleFormat,
        "- Date formatting in a user's locale which doesn't match the server.",
    ),
    (
        CauseTag::ExternalData,
        "- External changing data without sending a snapshot of it along with the HTML.",
    ),
    (CauseTag::InvalidNesting, "- Invalid HTML tag nesting."),
];

/// Closing note after the bullets.
pub const EXTENSION_NOTE: &str = "It can also happen if the client has a browser extension installed which messes with the HTML before React loaded.";

/// Default cap for one rendered detail line.
pub const DEFAULT_DETAIL_MAX_CHARS: usize = 200;

/// Render the fixed warning body: five bullets, a blank line, the note.
#[must_use]
pub fn warning_body() -> String {
    let mut out = String::new();
    for (_, text) in CAUSE_BULLETS {
        out.push_str(text);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(EXTENSION_NOTE);
    out
}

/// One taxonomy bullet and whether the diagnostic's causes include it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CauseBullet {
    pub tag: CauseTag,
    pub text: &'static str,
    pub matched: bool,
}

/// Immutable result of composing one render pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub epoch: BuildEpoch,
    pub description: String,
    /// Union of per-signal causes in precedence order.
    pub causes: CauseSet,
    pub raw_signals: Vec<MismatchSignal>,
    pub warning: String,
    /// Per-signal classification, parallel to `raw_signals`.
    pub classifications: Vec<Classification>,
    /// Hex sha256 over the visible content; equal fingerprints render equally.
    pub fingerprint: String,
}

impl Diagnostic {
    /// Bullets with their `matched` flag set from `causes`.
    #[must_use]
    pub fn bullets(&self) -> Vec<CauseBullet> {
        CAUSE_BULLETS
            .into_iter()
            .map(|(tag, text)| CauseBullet {
                tag,
                text,
                matched: self.causes.contains(tag),
            })
            .collect()
    }

    /// Causes text as shown under the description.
    #[must_use]
    pub fn causes_text(&self) -> &str {
        &self.warning
    }

    /// Per-signal detail lines built from the framework-supplied snapshots.
    #[must_use]
    pub fn details(&self, max_chars: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for signal in &self.raw_signals {
            let mut header = signal.node_path.to_string();
            if let Some(component) = signal.component_name.as_deref() {
                let _ = write!(header, " ({component})");
            }
            lines.push(truncate(&header, max_chars));
            if let Some(client) = signal.client_value() {
                lines.push(truncate(&format!("+ {client}"), max_chars));
            }
            if let Some(server) = signal.server_value() {
                lines.push(truncate(&format!("- {server}"), max_chars));
            }
        }
        lines
    }

    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.raw_signals.len()
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn fingerprint(causes: CauseSet, signals: &[MismatchSignal]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(HYDRATION_DESCRIPTION.as_bytes());
    for tag in causes.iter() {
        hasher.update(tag.as_str().as_bytes());
        hasher.update([0]);
    }
    for signal in signals {
        hasher.update(signal.node_path.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(signal.observed_value.as_bytes());
        hasher.update([0]);
        if let Some(counterpart) = signal.counterpart_value.as_deref() {
            hasher.update(counterpart.as_bytes());
        }
        hasher.update([0xff]);
    }
    hex::encode(hasher.finalize())
}

/// Classifies signals and assembles diagnostics.
#[derive(Debug, Clone)]
pub struct DiagnosticComposer {
    classifier: Arc<CauseClassifier>,
}

impl Default for DiagnosticComposer {
    fn default() -> Self {
        Self::new(Arc::new(CauseClassifier::new()))
    }
}

impl DiagnosticComposer {
    #[must_use]
    pub fn new(classifier: Arc<CauseClassifier>) -> Self {
        Self { classifier }
    }

    #[must_use]
    pub fn classifier(&self) -> &CauseClassifier {
        &self.classifier
    }

    /// Compose one diagnostic from a non-empty signal set.
    ///
    /// `Unknown` appears in `causes` only if some signal matched no rule.
    pub fn compose(
        &self,
        epoch: BuildEpoch,
        signals: &[MismatchSignal],
    ) -> Result<Diagnostic, ComposeError> {
        if signals.is_empty() {
            return Err(ComposeError::EmptyInput);
        }

        let classifications: Vec<Classification> =
            signals.iter().map(|s| self.classifier.explain(s)).collect();
        let causes = classifications
            .iter()
            .fold(CauseSet::empty(), |acc, c| acc.union(c.tags));

        tracing::debug!(
            epoch = %epoch,
            signals = signals.len(),
            causes = ?causes.to_vec(),
            "Composed hydration diagnostic"
        );

        Ok(Diagnostic {
            epoch,
            description: HYDRATION_DESCRIPTION.to_string(),
            causes,
            raw_signals: signals.to_vec(),
            warning: warning_body(),
            classifications,
            fingerprint: fingerprint(causes, signals),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::NodePath;

    const EXPECTED_WARNING: &str = "- A server/client branch `if (typeof window !== 'undefined')`.
- Variable input such as `Date.now()` or `Math.random()` which changes each time it's called.
- Date formatting in a user's locale which doesn't match the server.
- External changing data without sending a snapshot of it along with the HTML.
- Invalid HTML tag nesting.

It can also happen if the client has a browser extension installed which messes with the HTML before React loaded.";

    fn env_signal() -> MismatchSignal {
        MismatchSignal::client(NodePath::parse("div.parent > main.child"), "client")
            .with_counterpart("server")
            .with_component_name("Mismatch")
            .with_component_source("const isClient = typeof window !== 'undefined'")
    }

    #[test]
    fn empty_input_is_rejected() {
        let composer = DiagnosticComposer::default();
        assert_eq!(
            composer.compose(BuildEpoch(0), &[]).unwrap_err(),
            ComposeError::EmptyInput
        );
    }

    #[test]
    fn description_and_warning_are_verbatim() {
        let composer = DiagnosticComposer::default();
        let d = composer.compose(BuildEpoch(3), &[env_signal()]).unwrap();
        assert_eq!(
            d.description,
            "Hydration failed because the server rendered HTML didn't match the client. As a result this tree will be regenerated on the client. This can happen if a SSR-ed Client Component used\nSee more info here: https://nextjs.org/docs/messages/react-hydration-error"
        );
        assert_eq!(d.warning, EXPECTED_WARNING);
        assert_eq!(d.causes_text(), EXPECTED_WARNING);
        assert_eq!(d.epoch, BuildEpoch(3));
    }

    #[test]
    fn causes_union_in_precedence_order() {
        let composer = DiagnosticComposer::default();
        let nesting = MismatchSignal::client(NodePath::parse("p > div"), "<div> inside <p>");
        let d = composer.compose(BuildEpoch(0), &[nesting, env_signal()]).unwrap();
        assert_eq!(
            d.causes.to_vec(),
            vec![CauseTag::EnvBranch, CauseTag::InvalidNesting]
        );
        assert_eq!(d.classifications.len(), 2);
    }

    #[test]
    fn unknown_only_when_some_signal_is_unmatched() {
        let composer = DiagnosticComposer::default();
        let plain = MismatchSignal::client(NodePath::parse("span"), "a").with_counterpart("b");
        let d = composer
            .compose(BuildEpoch(0), &[env_signal(), plain.clone()])
            .unwrap();
        assert_eq!(d.causes.to_vec(), vec![CauseTag::EnvBranch, CauseTag::Unknown]);

        let d = composer.compose(BuildEpoch(0), &[env_signal()]).unwrap();
        assert!(!d.causes.contains(CauseTag::Unknown));

        let d = composer.compose(BuildEpoch(0), &[plain]).unwrap();
        assert_eq!(d.causes.to_vec(), vec![CauseTag::Unknown]);
    }

    #[test]
    fn bullets_flag_matched_causes() {
        let composer = DiagnosticComposer::default();
        let d = composer.compose(BuildEpoch(0), &[env_signal()]).unwrap();
        let bullets = d.bullets();
        assert_eq!(bullets.len(), 5);
        assert!(bullets[0].matched);
        assert!(bullets[1..].iter().all(|b| !b.matched));
        assert!(bullets[0].text.contains("typeof window !== 'undefined'"));
    }

    #[test]
    fn details_render_snapshots_and_truncate() {
        let composer = DiagnosticComposer::default();
        let d = composer.compose(BuildEpoch(0), &[env_signal()]).unwrap();
        assert_eq!(
            d.details(200),
            vec![
                "div.parent > main.child (Mismatch)".to_string(),
                "+ client".to_string(),
                "- server".to_string(),
            ]
        );
        let short = d.details(10);
        assert_eq!(short[0], "div.par...");
        assert!(short.iter().all(|l| l.chars().count() <= 10));
    }

    #[test]
    fn fingerprint_tracks_visible_content() {
        let composer = DiagnosticComposer::default();
        let a = composer.compose(BuildEpoch(0), &[env_signal()]).unwrap();
        let b = composer.compose(BuildEpoch(5), &[env_signal()]).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);

        let other = MismatchSignal::client(NodePath::parse("div.parent > main.child"), "Value");
        let c = composer.compose(BuildEpoch(0), &[other]).unwrap();
        assert_ne!(a.fingerprint, c.fingerprint);
    }
}
