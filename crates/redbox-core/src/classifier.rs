//! Cause classification for mismatch signals.
//!
//! Maps a [`MismatchSignal`] to probable-cause tags from a closed taxonomy.
//! Text rules are organized in packs (the built-in pack is
//! `builtin:hydration`); each rule has literal anchors compiled once into an
//! Aho-Corasick automaton and an optional regex confirmation. Tag-nesting is
//! a structural check on the node path (see [`crate::nesting`]) and external
//! data also follows from the collector's `outside_snapshot` flag.
//!
//! Categories are evaluated independently, so one signal may carry several
//! tags. A signal that matches nothing is tagged [`CauseTag::Unknown`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use aho_corasick::AhoCorasick;
use memchr::memchr;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::PatternError;
use crate::nesting::{self, NestingViolation};
use crate::signals::MismatchSignal;

/// Name of the built-in rule pack.
pub const BUILTIN_PACK: &str = "builtin:hydration";

const OUTSIDE_SNAPSHOT_RULE: &str = "hydration.external_data:outside_snapshot";
const NESTING_RULE: &str = "hydration.invalid_nesting:content_model";

/// Probable cause of a hydration mismatch, in display precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseTag {
    EnvBranch,
    VolatileApi,
    LocaleFormat,
    ExternalData,
    InvalidNesting,
    Unknown,
}

impl CauseTag {
    /// Every tag, most specific first, `Unknown` last.
    pub const ALL: [Self; 6] = [
        Self::EnvBranch,
        Self::VolatileApi,
        Self::LocaleFormat,
        Self::ExternalData,
        Self::InvalidNesting,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn precedence(self) -> u8 {
        match self {
            Self::EnvBranch => 0,
            Self::VolatileApi => 1,
            Self::LocaleFormat => 2,
            Self::ExternalData => 3,
            Self::InvalidNesting => 4,
            Self::Unknown => 5,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EnvBranch => "env_branch",
            Self::VolatileApi => "volatile_api",
            Self::LocaleFormat => "locale_format",
            Self::ExternalData => "external_data",
            Self::InvalidNesting => "invalid_nesting",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub const fn is_specific(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    const fn bit(self) -> u8 {
        1 << self.precedence()
    }
}

impl fmt::Display for CauseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CauseTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown cause tag: {s}. Expected one of: env_branch, volatile_api, locale_format, external_data, invalid_nesting, unknown"
                )
            })
    }
}

/// Ordered, duplicate-free set of cause tags.
///
/// Iteration always follows [`CauseTag::precedence`], so `Unknown` is last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<CauseTag>", into = "Vec<CauseTag>")]
pub struct CauseSet(u8);

impl CauseSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn only(tag: CauseTag) -> Self {
        Self(tag.bit())
    }

    pub fn insert(&mut self, tag: CauseTag) {
        self.0 |= tag.bit();
    }

    #[must_use]
    pub const fn contains(self, tag: CauseTag) -> bool {
        self.0 & tag.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if at least one non-`Unknown` tag is present.
    #[must_use]
    pub const fn has_specific(self) -> bool {
        self.0 & !CauseTag::Unknown.bit() != 0
    }

    pub fn iter(self) -> impl Iterator<Item = CauseTag> {
        CauseTag::ALL.into_iter().filter(move |tag| self.contains(*tag))
    }

    #[must_use]
    pub fn to_vec(self) -> Vec<CauseTag> {
        self.iter().collect()
    }
}

impl FromIterator<CauseTag> for CauseSet {
    fn from_iter<I: IntoIterator<Item = CauseTag>>(iter: I) -> Self {
        let mut set = Self::empty();
        for tag in iter {
            set.insert(tag);
        }
        set
    }
}

impl From<Vec<CauseTag>> for CauseSet {
    fn from(tags: Vec<CauseTag>) -> Self {
        tags.into_iter().collect()
    }
}

impl From<CauseSet> for Vec<CauseTag> {
    fn from(set: CauseSet) -> Self {
        set.to_vec()
    }
}

/// Which text of a signal a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Component source text only.
    Source,
    /// Observed (and counterpart) value only.
    Observed,
    /// Either of the above.
    #[default]
    Any,
}

impl RuleScope {
    const fn admits(self, text: TextKind) -> bool {
        matches!(
            (self, text),
            (Self::Any, _) | (Self::Source, TextKind::Source) | (Self::Observed, TextKind::Observed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextKind {
    Source,
    Observed,
}

/// A text rule definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDef {
    /// Stable identifier (e.g., "hydration.volatile_api:date_now")
    pub id: String,
    pub tag: CauseTag,
    /// Literal strings; any one of them makes the rule a candidate.
    pub anchors: Vec<String>,
    /// Optional regex that must also match the same text.
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub scope: RuleScope,
    #[serde(default)]
    pub description: String,
}

impl RuleDef {
    fn new(id: &str, tag: CauseTag, anchors: &[&str], scope: RuleScope, description: &str) -> Self {
        Self {
            id: id.to_string(),
            tag,
            anchors: anchors.iter().map(|a| (*a).to_string()).collect(),
            regex: None,
            scope,
            description: description.to_string(),
        }
    }

    fn with_regex(mut self, regex: &str) -> Self {
        self.regex = Some(regex.to_string());
        self
    }

    /// Check structural validity (regexes are checked when compiling).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PatternError::InvalidRule("rule id must not be empty".to_string()).into());
        }
        if !self.tag.is_specific() || self.tag == CauseTag::InvalidNesting {
            return Err(PatternError::InvalidRule(format!(
                "rule id '{}' uses tag '{}', which text rules cannot produce",
                self.id, self.tag
            ))
            .into());
        }
        if self.anchors.iter().all(|a| a.is_empty()) {
            return Err(PatternError::InvalidRule(format!(
                "rule id '{}' needs at least one non-empty anchor",
                self.id
            ))
            .into());
        }
        Ok(())
    }
}

/// A named, versioned collection of rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePack {
    pub name: String,
    pub version: String,
    pub rules: Vec<RuleDef>,
}

impl RulePack {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>, rules: Vec<RuleDef>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            rules,
        }
    }
}

/// Resolve a pack by name.
pub fn builtin_pack(name: &str) -> Result<RulePack> {
    match name {
        BUILTIN_PACK => Ok(builtin_hydration_pack()),
        other => Err(PatternError::PackNotFound(other.to_string()).into()),
    }
}

/// Built-in rules for the common hydration mismatch causes.
#[must_use]
pub fn builtin_hydration_pack() -> RulePack {
    use CauseTag::{EnvBranch, ExternalData, LocaleFormat, VolatileApi};
    use RuleScope::{Any, Observed, Source};

    RulePack::new(
        BUILTIN_PACK,
        "0.1.0",
        vec![
            RuleDef::new(
                "hydration.env_branch:typeof_window",
                EnvBranch,
                &["typeof window"],
                Any,
                "Branches on the presence of the browser window global",
            ),
            RuleDef::new(
                "hydration.env_branch:typeof_document",
                EnvBranch,
                &["typeof document", "typeof navigator", "typeof localStorage"],
                Any,
                "Branches on the presence of a browser-only global",
            ),
            RuleDef::new(
                "hydration.env_branch:process_browser",
                EnvBranch,
                &["process.browser", "import.meta.env.SSR"],
                Any,
                "Branches on a bundler-provided environment flag",
            ),
            RuleDef::new(
                "hydration.env_branch:client_flag",
                EnvBranch,
                &["isClient", "isServer", "isBrowser", "useIsClient", "useIsMounted"],
                Source,
                "Renders differently based on a client/server flag",
            )
            .with_regex(r"\b(?:is(?:Client|Server|Browser)|useIs(?:Client|Mounted))\b"),
            RuleDef::new(
                "hydration.env_branch:window_layout",
                EnvBranch,
                &["window.inner", "window.matchMedia", "window.devicePixelRatio", "window.location"],
                Source,
                "Reads viewport or location state only known in the browser",
            ),
            RuleDef::new(
                "hydration.volatile_api:date_now",
                VolatileApi,
                &["Date.now("],
                Source,
                "Reads the current time",
            ),
            RuleDef::new(
                "hydration.volatile_api:new_date",
                VolatileApi,
                &["new Date("],
                Source,
                "Constructs a Date for the current time",
            )
            .with_regex(r"new Date\(\s*\)"),
            RuleDef::new(
                "hydration.volatile_api:math_random",
                VolatileApi,
                &["Math.random("],
                Source,
                "Generates a random number",
            ),
            RuleDef::new(
                "hydration.volatile_api:performance_now",
                VolatileApi,
                &["performance.now("],
                Source,
                "Reads a high resolution timer",
            ),
            RuleDef::new(
                "hydration.volatile_api:random_uuid",
                VolatileApi,
                &["randomUUID(", "getRandomValues("],
                Source,
                "Generates random identifiers",
            ),
            RuleDef::new(
                "hydration.locale_format:to_locale",
                LocaleFormat,
                &["toLocaleString(", "toLocaleDateString(", "toLocaleTimeString("],
                Source,
                "Formats values using the runtime locale",
            ),
            RuleDef::new(
                "hydration.locale_format:intl",
                LocaleFormat,
                &["Intl.DateTimeFormat", "Intl.NumberFormat", "Intl.RelativeTimeFormat"],
                Source,
                "Formats values using Intl with the runtime locale",
            ),
            RuleDef::new(
                "hydration.locale_format:observed_meridiem",
                LocaleFormat,
                &[" AM", " PM", "\u{202f}AM", "\u{202f}PM"],
                Observed,
                "Rendered a clock time with a locale-dependent AM/PM marker",
            )
            .with_regex(r"\d{1,2}:\d{2}(?::\d{2})?[ \x{202F}](?:AM|PM)\b"),
            RuleDef::new(
                "hydration.external_data:web_storage",
                ExternalData,
                &["localStorage", "sessionStorage", "document.cookie"],
                Source,
                "Reads browser storage that the server cannot see",
            ),
            RuleDef::new(
                "hydration.external_data:network",
                ExternalData,
                &["fetch(", "XMLHttpRequest", "new WebSocket", "new EventSource"],
                Source,
                "Loads data outside the render snapshot",
            )
            .with_regex(r"(?:^|[^\w.])fetch\(|window\.fetch\(|XMLHttpRequest|new (?:WebSocket|EventSource)\b"),
        ],
    )
}

/// Merge packs in order; later packs override earlier rules with the same id.
fn merge_rules(packs: &[RulePack]) -> Vec<RuleDef> {
    let mut merged: HashMap<String, RuleDef> = HashMap::new();
    for pack in packs {
        for rule in &pack.rules {
            merged.insert(rule.id.clone(), rule.clone());
        }
    }
    let mut rules: Vec<RuleDef> = merged.into_values().collect();
    rules.sort_by(|a, b| a.id.cmp(&b.id));
    rules
}

#[derive(Debug, Clone)]
struct CompiledRule {
    def: RuleDef,
    regex: Option<Regex>,
}

#[derive(Debug)]
struct ClassifierIndex {
    compiled_rules: Vec<CompiledRule>,
    anchor_to_rules: Vec<Vec<usize>>,
    anchor_matcher: Option<AhoCorasick>,
    quick_bytes: Vec<u8>,
}

fn build_index(rules: &[RuleDef]) -> Result<ClassifierIndex> {
    let mut compiled_rules = Vec::with_capacity(rules.len());
    let mut anchor_list: Vec<String> = Vec::new();
    let mut anchor_slots: HashMap<String, usize> = HashMap::new();
    let mut anchor_to_rules: Vec<Vec<usize>> = Vec::new();
    let mut quick_byte_set: HashSet<u8> = HashSet::new();

    for (idx, rule) in rules.iter().enumerate() {
        rule.validate()?;
        let regex = match rule.regex.as_ref() {
            Some(raw) => Some(Regex::new(raw).map_err(|e| {
                PatternError::InvalidRegex(format!("rule id '{}' has invalid regex: {e}", rule.id))
            })?),
            None => None,
        };
        compiled_rules.push(CompiledRule {
            def: rule.clone(),
            regex,
        });

        for anchor in rule.anchors.iter().filter(|a| !a.is_empty()) {
            let slot = *anchor_slots.entry(anchor.clone()).or_insert_with(|| {
                anchor_list.push(anchor.clone());
                anchor_to_rules.push(Vec::new());
                anchor_list.len() - 1
            });
            if !anchor_to_rules[slot].contains(&idx) {
                anchor_to_rules[slot].push(idx);
            }
            if let Some(&byte) = anchor.as_bytes().first() {
                quick_byte_set.insert(byte);
            }
        }
    }

    let anchor_matcher = if anchor_list.is_empty() {
        None
    } else {
        Some(
            AhoCorasick::builder()
                .build(anchor_list.iter().map(String::as_str))
                .map_err(|e| {
                    PatternError::InvalidRule(format!("failed to build anchor matcher: {e}"))
                })?,
        )
    };

    let mut quick_bytes: Vec<u8> = quick_byte_set.into_iter().collect();
    quick_bytes.sort_unstable();

    Ok(ClassifierIndex {
        compiled_rules,
        anchor_to_rules,
        anchor_matcher,
        quick_bytes,
    })
}

/// Full classification result for one signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub tags: CauseSet,
    /// Ids of the rules that fired, sorted.
    pub matched_rules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nesting: Option<NestingViolation>,
}

/// Deterministic classifier over a merged rule library.
#[derive(Debug)]
pub struct CauseClassifier {
    rules: Vec<RuleDef>,
    index: ClassifierIndex,
}

impl Default for CauseClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CauseClassifier {
    /// Classifier with the built-in pack only.
    #[must_use]
    pub fn new() -> Self {
        Self::from_packs(&[builtin_hydration_pack()])
            .expect("builtin hydration pack must compile")
    }

    /// Build from explicit packs, validating every rule and regex.
    pub fn from_packs(packs: &[RulePack]) -> Result<Self> {
        let rules = merge_rules(packs);
        let index = build_index(&rules)?;
        tracing::debug!(rules = rules.len(), packs = packs.len(), "Compiled cause classifier");
        Ok(Self { rules, index })
    }

    /// Build from configuration: named packs plus custom rules.
    pub fn from_config(config: &crate::config::ClassifierConfig) -> Result<Self> {
        let mut packs = config
            .packs
            .iter()
            .map(|name| builtin_pack(name))
            .collect::<Result<Vec<_>>>()?;
        if !config.rules.is_empty() {
            packs.push(RulePack::new("config:custom", "0.0.0", config.rules.clone()));
        }
        Self::from_packs(&packs)
    }

    #[must_use]
    pub fn rules(&self) -> &[RuleDef] {
        &self.rules
    }

    /// Returns false if `text` definitely contains no anchor.
    #[must_use]
    pub fn quick_reject(&self, text: &str) -> bool {
        if text.is_empty() || self.index.quick_bytes.is_empty() {
            return false;
        }
        let bytes = text.as_bytes();
        self.index
            .quick_bytes
            .iter()
            .any(|byte| memchr(*byte, bytes).is_some())
    }

    /// Probable causes for `signal`; never empty.
    #[must_use]
    pub fn classify(&self, signal: &MismatchSignal) -> CauseSet {
        self.explain(signal).tags
    }

    /// Like [`classify`](Self::classify) but also reports which rules fired.
    #[must_use]
    pub fn explain(&self, signal: &MismatchSignal) -> Classification {
        let mut tags = CauseSet::empty();
        let mut matched: Vec<String> = Vec::new();

        if let Some(source) = signal.component_source.as_deref() {
            self.match_text(source, TextKind::Source, &mut tags, &mut matched);
        }
        self.match_text(&signal.observed_value, TextKind::Observed, &mut tags, &mut matched);
        if let Some(counterpart) = signal.counterpart_value.as_deref() {
            self.match_text(counterpart, TextKind::Observed, &mut tags, &mut matched);
        }

        if signal.outside_snapshot {
            tags.insert(CauseTag::ExternalData);
            matched.push(OUTSIDE_SNAPSHOT_RULE.to_string());
        }

        let nesting = nesting::check_path(&signal.node_path);
        if nesting.is_some() {
            tags.insert(CauseTag::InvalidNesting);
            matched.push(NESTING_RULE.to_string());
        }

        if tags.is_empty() {
            tags.insert(CauseTag::Unknown);
        }
        matched.sort();
        matched.dedup();

        tracing::trace!(
            node_path = %signal.node_path,
            tags = ?tags.to_vec(),
            rules = ?matched,
            "Classified mismatch signal"
        );

        Classification {
            tags,
            matched_rules: matched,
            nesting,
        }
    }

    fn match_text(
        &self,
        text: &str,
        kind: TextKind,
        tags: &mut CauseSet,
        matched: &mut Vec<String>,
    ) {
        if !self.quick_reject(text) {
            return;
        }
        let Some(matcher) = self.index.anchor_matcher.as_ref() else {
            return;
        };

        let mut candidates: HashSet<usize> = HashSet::new();
        for hit in matcher.find_overlapping_iter(text) {
            if let Some(rule_indices) = self.index.anchor_to_rules.get(hit.pattern().as_usize()) {
                candidates.extend(rule_indices.iter().copied());
            }
        }

        let mut candidates: Vec<usize> = candidates.into_iter().collect();
        candidates.sort_unstable();
        for idx in candidates {
            let rule = &self.index.compiled_rules[idx];
            if !rule.def.scope.admits(kind) {
                continue;
            }
            if let Some(regex) = rule.regex.as_ref() {
                if !regex.is_match(text) {
                    continue;
                }
            }
            tags.insert(rule.def.tag);
            matched.push(rule.def.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::NodePath;

    const ISCLIENT_SOURCE: &str = "const isClient = typeof window !== 'undefined'\nexport default function Mismatch() {\n  return (\n    <div className=\"parent\">\n      <main className=\"child\">{isClient ? \"client\" : \"server\"}</main>\n    </div>\n  );\n}";

    fn signal_with_source(path: &str, source: &str) -> MismatchSignal {
        MismatchSignal::client(NodePath::parse(path), "client")
            .with_counterpart("server")
            .with_component_source(source)
    }

    #[test]
    fn cause_tag_precedence_is_total_and_unknown_last() {
        let order: Vec<u8> = CauseTag::ALL.iter().map(|t| t.precedence()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(CauseTag::ALL.last(), Some(&CauseTag::Unknown));
    }

    #[test]
    fn cause_tag_from_str_roundtrip() {
        for tag in CauseTag::ALL {
            assert_eq!(tag.to_string().parse::<CauseTag>().unwrap(), tag);
        }
        assert!("weather".parse::<CauseTag>().is_err());
    }

    #[test]
    fn cause_set_orders_by_precedence() {
        let set: CauseSet = [CauseTag::Unknown, CauseTag::InvalidNesting, CauseTag::EnvBranch]
            .into_iter()
            .collect();
        assert_eq!(
            set.to_vec(),
            vec![CauseTag::EnvBranch, CauseTag::InvalidNesting, CauseTag::Unknown]
        );
        assert_eq!(set.len(), 3);
        assert!(set.has_specific());
        assert!(!CauseSet::only(CauseTag::Unknown).has_specific());
    }

    #[test]
    fn cause_set_serializes_as_list() {
        let set: CauseSet = [CauseTag::LocaleFormat, CauseTag::EnvBranch].into_iter().collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["env_branch","locale_format"]"#);
        let back: CauseSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }

    #[test]
    fn typeof_window_branch_is_env_branch() {
        let classifier = CauseClassifier::new();
        let result = classifier.explain(&signal_with_source("div.parent > main.child", ISCLIENT_SOURCE));
        assert_eq!(result.tags.to_vec(), vec![CauseTag::EnvBranch]);
        assert!(
            result
                .matched_rules
                .contains(&"hydration.env_branch:typeof_window".to_string())
        );
        assert!(
            result
                .matched_rules
                .contains(&"hydration.env_branch:client_flag".to_string())
        );
    }

    #[test]
    fn volatile_and_locale_apis() {
        let classifier = CauseClassifier::new();
        let source = "export default () => <p>{new Date().toLocaleTimeString()} {Math.random()}</p>";
        let tags = classifier.classify(&signal_with_source("p", source));
        assert_eq!(tags.to_vec(), vec![CauseTag::VolatileApi, CauseTag::LocaleFormat]);
    }

    #[test]
    fn date_with_argument_is_not_volatile() {
        let classifier = CauseClassifier::new();
        let source = "const d = new Date(props.timestamp); return <span>{d.getUTCFullYear()}</span>";
        let tags = classifier.classify(&signal_with_source("span", source));
        assert_eq!(tags.to_vec(), vec![CauseTag::Unknown]);
    }

    #[test]
    fn outside_snapshot_flag_is_external_data() {
        let classifier = CauseClassifier::new();
        let signal =
            MismatchSignal::client(NodePath::parse("ul > li"), "3 items").with_outside_snapshot(true);
        let result = classifier.explain(&signal);
        assert_eq!(result.tags.to_vec(), vec![CauseTag::ExternalData]);
        assert_eq!(result.matched_rules, vec![OUTSIDE_SNAPSHOT_RULE.to_string()]);
    }

    #[test]
    fn storage_reads_are_external_data() {
        let classifier = CauseClassifier::new();
        let source = "const theme = localStorage.getItem('theme')";
        let tags = classifier.classify(&signal_with_source("div", source));
        assert!(tags.contains(CauseTag::ExternalData));
    }

    #[test]
    fn network_reads_are_external_data() {
        let classifier = CauseClassifier::new();
        for source in [
            "const res = await fetch('/api/user')",
            "window.fetch(url).then(r => r.json())",
            "const ws = new WebSocket(url)",
        ] {
            let result = classifier.explain(&signal_with_source("div", source));
            assert!(
                result
                    .matched_rules
                    .contains(&"hydration.external_data:network".to_string()),
                "{source}"
            );
        }
    }

    #[test]
    fn fetch_lookalikes_are_not_network() {
        let classifier = CauseClassifier::new();
        for source in [
            "router.prefetch('/dashboard')",
            "const { refetch } = useQuery(); refetch()",
            "api.fetch(id)",
        ] {
            let tags = classifier.classify(&signal_with_source("div", source));
            assert!(!tags.contains(CauseTag::ExternalData), "{source}");
        }
    }

    #[test]
    fn meridiem_in_observed_text_is_locale_format() {
        let classifier = CauseClassifier::new();
        let signal = MismatchSignal::client(NodePath::parse("time"), "10:01\u{202f}PM")
            .with_counterpart("22:01");
        let result = classifier.explain(&signal);
        assert_eq!(result.tags.to_vec(), vec![CauseTag::LocaleFormat]);
        assert_eq!(
            result.matched_rules,
            vec!["hydration.locale_format:observed_meridiem".to_string()]
        );

        let spaced = MismatchSignal::client(NodePath::parse("time"), "Updated 9:30 AM");
        assert!(classifier.classify(&spaced).contains(CauseTag::LocaleFormat));
    }

    #[test]
    fn observed_scoped_rules_ignore_source_text() {
        let classifier = CauseClassifier::new();
        let signal = signal_with_source("time", "const label = '10:00 AM'");
        assert_eq!(classifier.classify(&signal).to_vec(), vec![CauseTag::Unknown]);
    }

    #[test]
    fn invalid_nesting_from_path_alone() {
        let classifier = CauseClassifier::new();
        let signal = MismatchSignal::client(NodePath::parse("p > div"), "<div> inside <p>");
        let result = classifier.explain(&signal);
        assert_eq!(result.tags.to_vec(), vec![CauseTag::InvalidNesting]);
        assert_eq!(result.nesting.as_ref().map(|v| v.child.as_str()), Some("div"));
    }

    #[test]
    fn no_match_is_unknown_only() {
        let classifier = CauseClassifier::new();
        let signal = MismatchSignal::client(NodePath::parse("div > span"), "hello");
        let result = classifier.explain(&signal);
        assert_eq!(result.tags.to_vec(), vec![CauseTag::Unknown]);
        assert!(result.matched_rules.is_empty());
    }

    #[test]
    fn observed_value_can_trigger_env_branch() {
        let classifier = CauseClassifier::new();
        let signal = MismatchSignal::client(NodePath::parse("pre"), "typeof window === 'object'");
        assert!(classifier.classify(&signal).contains(CauseTag::EnvBranch));
    }

    #[test]
    fn source_scoped_rules_ignore_observed_text() {
        let classifier = CauseClassifier::new();
        let signal = MismatchSignal::client(NodePath::parse("code"), "Math.random()");
        assert_eq!(classifier.classify(&signal).to_vec(), vec![CauseTag::Unknown]);
    }

    #[test]
    fn quick_reject_respects_anchor_bytes() {
        let classifier = CauseClassifier::new();
        assert!(!classifier.quick_reject(""));
        assert!(classifier.quick_reject("typeof window"));
    }

    #[test]
    fn later_packs_override_rules_by_id() {
        let mut custom = builtin_hydration_pack();
        custom.name = "custom".to_string();
        custom.rules.retain(|r| r.id == "hydration.volatile_api:date_now");
        custom.rules[0].anchors = vec!["Clock.tick(".to_string()];

        let classifier =
            CauseClassifier::from_packs(&[builtin_hydration_pack(), custom]).expect("compile");
        assert_eq!(classifier.rules().len(), builtin_hydration_pack().rules.len());
        let tags = classifier.classify(&signal_with_source("span", "Clock.tick()"));
        assert_eq!(tags.to_vec(), vec![CauseTag::VolatileApi]);
        let tags = classifier.classify(&signal_with_source("span", "Date.now()"));
        assert_eq!(tags.to_vec(), vec![CauseTag::Unknown]);
    }

    #[test]
    fn invalid_custom_regex_is_rejected() {
        let pack = RulePack::new(
            "custom",
            "0.0.1",
            vec![RuleDef::new("custom:bad", CauseTag::VolatileApi, &["x"], RuleScope::Any, "")
                .with_regex("(unclosed")],
        );
        let err = CauseClassifier::from_packs(&[pack]).unwrap_err();
        assert!(err.to_string().contains("invalid regex"));
    }

    #[test]
    fn text_rules_cannot_claim_structural_tags() {
        let rule = RuleDef::new("custom:nest", CauseTag::InvalidNesting, &["<p>"], RuleScope::Any, "");
        assert!(rule.validate().is_err());
        let rule = RuleDef::new("custom:none", CauseTag::VolatileApi, &[""], RuleScope::Any, "");
        assert!(rule.validate().is_err());
    }

    #[test]
    fn unknown_pack_name_is_an_error() {
        assert!(builtin_pack("builtin:nope").is_err());
        assert!(builtin_pack(BUILTIN_PACK).is_ok());
    }
}
