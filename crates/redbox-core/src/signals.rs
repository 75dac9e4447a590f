//! Mismatch signal collection.
//!
//! The rendering framework reports hydration problems in several shapes
//! depending on its version: structured text-mismatch events, printf-style
//! console warnings with a component stack, recoverable errors carrying the
//! framework's own `+`/`-` diff, and DOM nesting warnings. [`SignalCollector`]
//! normalizes all of them into [`MismatchSignal`] records buffered per render
//! pass, so the classifier never depends on a version-specific event layout.
//!
//! # Pass buffering
//!
//! ```text
//! begin_pass(p) ─► record(p, raw)* ─► collect(p) ─► Vec<MismatchSignal>
//!                        │
//!                        └─ dedup by node path (first detected wins)
//! ```
//!
//! An empty `collect` result is meaningful: it is what clears the overlay.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, LazyLock};

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder segment used when a raw event carries no usable path.
pub const ROOT_SEGMENT: &str = "#root";

/// Identifier for one render pass on one page connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderPassId(pub u64);

impl fmt::Display for RenderPassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pass-{}", self.0)
    }
}

/// Which side's markup the observed value was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    Server,
    Client,
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Ordered element identifiers from the root to the divergent node.
///
/// Each segment is a tag optionally followed by `.class` and `#id` parts,
/// e.g. `div.parent` or `main.child#content`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(Vec<String>);

impl NodePath {
    #[must_use]
    pub fn new(segments: Vec<String>) -> Self {
        let segments: Vec<String> = segments
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if segments.is_empty() {
            return Self::root();
        }
        Self(segments)
    }

    /// Path consisting only of the placeholder root segment.
    #[must_use]
    pub fn root() -> Self {
        Self(vec![ROOT_SEGMENT.to_string()])
    }

    /// Parse a `>`-separated path such as `div.parent > main.child`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split('>').map(str::to_string).collect())
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn is_root_placeholder(&self) -> bool {
        self.0.len() == 1 && self.0[0] == ROOT_SEGMENT
    }

    #[must_use]
    pub fn leaf(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Lower-cased tag name of every segment, skipping the root placeholder.
    #[must_use]
    pub fn tag_names(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|segment| segment.as_str() != ROOT_SEGMENT)
            .map(|segment| segment_tag(segment))
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" > "))
    }
}

fn segment_tag(segment: &str) -> String {
    let end = segment.find(['.', '#', '[']).unwrap_or(segment.len());
    segment[..end].trim().to_ascii_lowercase()
}

/// One normalized divergence between server and client output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MismatchSignal {
    pub source: SignalSource,
    pub node_path: NodePath,
    /// Text snapshot as observed on `source`.
    pub observed_value: String,
    /// Text snapshot from the other side, when the raw event carried it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_name: Option<String>,
    /// Source text of the component that rendered the divergent node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_source: Option<Arc<str>>,
    /// Data behind this node was not part of the serialized render snapshot.
    #[serde(default)]
    pub outside_snapshot: bool,
}

impl MismatchSignal {
    #[must_use]
    pub fn new(source: SignalSource, node_path: NodePath, observed_value: impl Into<String>) -> Self {
        Self {
            source,
            node_path,
            observed_value: observed_value.into(),
            counterpart_value: None,
            component_name: None,
            component_source: None,
            outside_snapshot: false,
        }
    }

    /// Client-observed divergence, the common case during hydration.
    #[must_use]
    pub fn client(node_path: NodePath, observed_value: impl Into<String>) -> Self {
        Self::new(SignalSource::Client, node_path, observed_value)
    }

    #[must_use]
    pub fn with_counterpart(mut self, value: impl Into<String>) -> Self {
        self.counterpart_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn with_component_name(mut self, name: impl Into<String>) -> Self {
        self.component_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_component_source(mut self, source: impl Into<Arc<str>>) -> Self {
        self.component_source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_outside_snapshot(mut self, outside: bool) -> Self {
        self.outside_snapshot = outside;
        self
    }

    /// Server-side snapshot, whichever field holds it.
    #[must_use]
    pub fn server_value(&self) -> Option<&str> {
        match self.source {
            SignalSource::Server => Some(&self.observed_value),
            SignalSource::Client => self.counterpart_value.as_deref(),
        }
    }

    /// Client-side snapshot, whichever field holds it.
    #[must_use]
    pub fn client_value(&self) -> Option<&str> {
        match self.source {
            SignalSource::Client => Some(&self.observed_value),
            SignalSource::Server => self.counterpart_value.as_deref(),
        }
    }
}

/// Raw hydration event as emitted by the rendering framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawHydrationEvent {
    /// Structured text mismatch with an explicit node path.
    TextMismatch {
        server_text: String,
        client_text: String,
        #[serde(default)]
        node_path: Vec<String>,
        #[serde(default)]
        component_name: Option<String>,
        #[serde(default)]
        component_source: Option<String>,
        #[serde(default)]
        outside_snapshot: bool,
    },
    /// printf-style console warning (`%s` placeholders filled from `args`).
    ConsoleWarning {
        format: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        component_stack: Option<String>,
        #[serde(default)]
        component_source: Option<String>,
    },
    /// Recoverable hydration error, optionally carrying the framework diff.
    RecoverableError {
        message: String,
        #[serde(default)]
        component_stack: Option<String>,
        #[serde(default)]
        diff: Option<String>,
        #[serde(default)]
        component_source: Option<String>,
    },
    /// Tag nesting warning reported by the framework.
    NestingWarning {
        parent_tag: String,
        child_tag: String,
        #[serde(default)]
        node_path: Option<Vec<String>>,
        #[serde(default)]
        component_source: Option<String>,
    },
    /// Anything else the framework forwarded on the same channel.
    Other { message: String },
}

impl RawHydrationEvent {
    /// Short label for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextMismatch { .. } => "text_mismatch",
            Self::ConsoleWarning { .. } => "console_warning",
            Self::RecoverableError { .. } => "recoverable_error",
            Self::NestingWarning { .. } => "nesting_warning",
            Self::Other { .. } => "other",
        }
    }
}

const HYDRATION_ANCHORS: &[&str] = &[
    "did not match",
    "hydration failed",
    "hydrating",
    "hydration mismatch",
    "didn't match the client",
    "cannot be a descendant of",
    "cannot appear as a descendant of",
    "cannot be a child of",
    "cannot appear as a child of",
    "cannot contain a nested",
];

static HYDRATION_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(HYDRATION_ANCHORS)
        .expect("static hydration anchors must compile")
});

static SERVER_CLIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Server:\s*"(?P<server>[^"]*)"\s*Client:\s*"(?P<client>[^"]*)""#)
        .expect("static server/client regex must compile")
});

static NESTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"<(?P<child>[A-Za-z][A-Za-z0-9-]*)> cannot (?:appear as|be) an? (?:descendant|child) of <(?P<parent>[A-Za-z][A-Za-z0-9-]*)>",
    )
    .expect("static nesting regex must compile")
});

static ELEMENT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^<(?P<tag>[A-Za-z][A-Za-z0-9.-]*)(?P<attrs>[^>]*)>?"#)
        .expect("static element regex must compile")
});

static CLASS_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:className|class)=["'{]+(?P<class>[^"'}]*)"#)
        .expect("static class regex must compile")
});

/// Returns true if `message` looks like a hydration report.
#[must_use]
pub fn is_hydration_message(message: &str) -> bool {
    HYDRATION_MATCHER.is_match(message)
}

/// Normalize one raw event into a signal. `None` means the event is not a
/// hydration report and should be ignored.
#[must_use]
pub fn normalize(raw: &RawHydrationEvent) -> Option<MismatchSignal> {
    match raw {
        RawHydrationEvent::TextMismatch {
            server_text,
            client_text,
            node_path,
            component_name,
            component_source,
            outside_snapshot,
        } => {
            let mut signal = MismatchSignal::client(NodePath::new(node_path.clone()), client_text)
                .with_counterpart(server_text)
                .with_outside_snapshot(*outside_snapshot);
            signal.component_name.clone_from(component_name);
            signal.component_source = component_source.as_deref().map(Arc::from);
            Some(signal)
        }
        RawHydrationEvent::ConsoleWarning {
            format,
            args,
            component_stack,
            component_source,
        } => {
            let message = substitute_format(format, args);
            if !is_hydration_message(&message) {
                return None;
            }
            let stack = component_stack.as_deref().unwrap_or(&message);
            let frames = StackFrames::parse(stack);
            let signal = if let Some(caps) = NESTING_RE.captures(&message) {
                nesting_signal(&caps["parent"], &caps["child"], frames.path())
            } else if let Some(caps) = SERVER_CLIENT_RE.captures(&message) {
                MismatchSignal::client(frames.path(), &caps["client"])
                    .with_counterpart(&caps["server"])
            } else {
                MismatchSignal::client(frames.path(), first_line(&message))
            };
            Some(attach_component(signal, frames.component, component_source.as_deref()))
        }
        RawHydrationEvent::RecoverableError {
            message,
            component_stack,
            diff,
            component_source,
        } => {
            if !is_hydration_message(message) && diff.is_none() {
                return None;
            }
            let diff_text = diff.as_deref().unwrap_or(message);
            let parsed = FrameworkDiff::parse(diff_text);
            let (path, component) = if parsed.path.is_root_placeholder() {
                let frames = StackFrames::parse(component_stack.as_deref().unwrap_or(message));
                (frames.path(), frames.component)
            } else {
                (parsed.path.clone(), parsed.component.clone())
            };
            let signal = match (parsed.client, parsed.server) {
                (Some(client), server) => {
                    let signal = MismatchSignal::client(path, client);
                    match server {
                        Some(server) => signal.with_counterpart(server),
                        None => signal,
                    }
                }
                (None, Some(server)) => MismatchSignal::new(SignalSource::Server, path, server),
                (None, None) => MismatchSignal::client(path, first_line(message)),
            };
            Some(attach_component(signal, component, component_source.as_deref()))
        }
        RawHydrationEvent::NestingWarning {
            parent_tag,
            child_tag,
            node_path,
            component_source,
        } => {
            let path = match node_path {
                Some(segments) if !segments.is_empty() => NodePath::new(segments.clone()),
                _ => NodePath::new(vec![parent_tag.clone(), child_tag.clone()]),
            };
            let signal = nesting_signal(parent_tag, child_tag, path);
            Some(attach_component(signal, None, component_source.as_deref()))
        }
        RawHydrationEvent::Other { message } => {
            if is_hydration_message(message) {
                let frames = StackFrames::parse(message);
                Some(attach_component(
                    MismatchSignal::client(frames.path(), first_line(message)),
                    frames.component,
                    None,
                ))
            } else {
                None
            }
        }
    }
}

fn nesting_signal(parent: &str, child: &str, path: NodePath) -> MismatchSignal {
    let parent = parent.to_ascii_lowercase();
    let child = child.to_ascii_lowercase();
    // Make sure the offending pair is visible to the structural checker even
    // when the stack only covered part of the tree.
    let tags = path.tag_names();
    let path = if tags.iter().any(|t| *t == parent) && tags.last() == Some(&child) {
        path
    } else {
        let mut segments: Vec<String> = path
            .segments()
            .iter()
            .filter(|s| s.as_str() != ROOT_SEGMENT)
            .cloned()
            .collect();
        segments.push(parent.clone());
        segments.push(child.clone());
        NodePath::new(segments)
    };
    MismatchSignal::client(path, format!("<{child}> inside <{parent}>"))
}

fn attach_component(
    mut signal: MismatchSignal,
    component: Option<String>,
    source: Option<&str>,
) -> MismatchSignal {
    if signal.component_name.is_none() {
        signal.component_name = component;
    }
    if let Some(source) = source {
        signal.component_source = Some(Arc::from(source));
    }
    signal
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim().to_string()
}

/// Fill `%s` placeholders in order; surplus placeholders become empty.
#[must_use]
pub fn substitute_format(format: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(format.len());
    let mut args = args.iter();
    let mut rest = format;
    while let Some(pos) = memchr::memmem::find(rest.as_bytes(), b"%s") {
        out.push_str(&rest[..pos]);
        if let Some(arg) = args.next() {
            out.push_str(arg);
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// Component stack frames (`at main`, `at div`, ...), innermost first.
struct StackFrames {
    elements: Vec<String>,
    component: Option<String>,
}

impl StackFrames {
    fn parse(stack: &str) -> Self {
        let mut elements = Vec::new();
        let mut component = None;
        for line in stack.lines() {
            let Some(frame) = line.trim().strip_prefix("at ") else {
                continue;
            };
            let name = frame.split_whitespace().next().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            if is_component_name(name) {
                // Innermost component owns the divergent node.
                if component.is_none() {
                    component = Some(name.to_string());
                }
                continue;
            }
            elements.push(name.to_ascii_lowercase());
        }
        elements.reverse();
        Self {
            elements,
            component,
        }
    }

    fn path(&self) -> NodePath {
        NodePath::new(self.elements.clone())
    }
}

fn is_component_name(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

/// Element chain and values read from a framework-rendered `+`/`-` diff.
struct FrameworkDiff {
    path: NodePath,
    component: Option<String>,
    client: Option<String>,
    server: Option<String>,
}

impl FrameworkDiff {
    fn parse(text: &str) -> Self {
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut component = None;
        let mut client = None;
        let mut server = None;

        for line in text.lines() {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with("...") {
                continue;
            }
            let marker = trimmed.as_bytes()[0];
            if marker == b'+' || marker == b'-' {
                let value = unquote(trimmed[1..].trim());
                if marker == b'+' && client.is_none() {
                    client = Some(value);
                } else if marker == b'-' && server.is_none() {
                    server = Some(value);
                }
                continue;
            }
            if client.is_some() || server.is_some() {
                break;
            }
            let indent = line.len() - trimmed.len();
            let Some(caps) = ELEMENT_LINE_RE.captures(trimmed) else {
                continue;
            };
            if trimmed.starts_with("</") {
                continue;
            }
            let tag = &caps["tag"];
            while stack.last().is_some_and(|(depth, _)| *depth >= indent) {
                stack.pop();
            }
            if is_component_name(tag) {
                component = Some(tag.to_string());
                continue;
            }
            let mut ident = tag.to_ascii_lowercase();
            if let Some(class) = CLASS_ATTR_RE
                .captures(&caps["attrs"])
                .map(|c| c["class"].trim().to_string())
            {
                if let Some(first) = class.split_whitespace().next() {
                    ident.push('.');
                    ident.push_str(first);
                }
            }
            stack.push((indent, ident));
        }

        Self {
            path: NodePath::new(stack.into_iter().map(|(_, ident)| ident).collect()),
            component,
            client,
            server,
        }
    }
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        value[1..value.len() - 1].to_string()
    } else {
        value.to_string()
    }
}

/// Outcome of buffering one raw event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Accepted,
    /// A signal for the same node path was already buffered this pass.
    Duplicate,
    /// Not a hydration report.
    Ignored,
    /// Pass buffer is full; signal dropped.
    OverCapacity,
    /// Pass already finished or was retired by a rebuild; signal dropped.
    Late,
}

#[derive(Debug, Default)]
struct PassBuffer {
    signals: Vec<MismatchSignal>,
    seen: HashSet<NodePath>,
    duplicates: usize,
    dropped: usize,
}

/// Per-pass signal buffers for one page connection.
#[derive(Debug)]
pub struct SignalCollector {
    passes: HashMap<RenderPassId, PassBuffer>,
    max_signals_per_pass: usize,
}

impl Default for SignalCollector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_SIGNALS_PER_PASS)
    }
}

impl SignalCollector {
    #[must_use]
    pub fn new(max_signals_per_pass: usize) -> Self {
        Self {
            passes: HashMap::new(),
            max_signals_per_pass: max_signals_per_pass.max(1),
        }
    }

    /// Open (or reset) the buffer for `pass`.
    pub fn begin_pass(&mut self, pass: RenderPassId) {
        self.passes.insert(pass, PassBuffer::default());
    }

    /// Normalize and buffer a raw framework event.
    pub fn record(&mut self, pass: RenderPassId, raw: &RawHydrationEvent) -> RecordOutcome {
        match normalize(raw) {
            Some(signal) => self.record_signal(pass, signal),
            None => {
                tracing::debug!(pass_id = %pass, kind = raw.kind(), "Ignoring non-hydration event");
                RecordOutcome::Ignored
            }
        }
    }

    /// Buffer an already-normalized signal.
    pub fn record_signal(&mut self, pass: RenderPassId, signal: MismatchSignal) -> RecordOutcome {
        let cap = self.max_signals_per_pass;
        let buffer = self.passes.entry(pass).or_default();
        if buffer.seen.contains(&signal.node_path) {
            buffer.duplicates += 1;
            return RecordOutcome::Duplicate;
        }
        if buffer.signals.len() >= cap {
            buffer.dropped += 1;
            if buffer.dropped == 1 {
                tracing::warn!(pass_id = %pass, cap, "Signal buffer full; dropping further signals");
            }
            return RecordOutcome::OverCapacity;
        }
        buffer.seen.insert(signal.node_path.clone());
        buffer.signals.push(signal);
        RecordOutcome::Accepted
    }

    /// Drain the signals buffered for `pass`. Unknown passes yield nothing.
    pub fn collect(&mut self, pass: RenderPassId) -> Vec<MismatchSignal> {
        let Some(buffer) = self.passes.remove(&pass) else {
            return Vec::new();
        };
        if buffer.duplicates > 0 || buffer.dropped > 0 {
            tracing::debug!(
                pass_id = %pass,
                kept = buffer.signals.len(),
                duplicates = buffer.duplicates,
                dropped = buffer.dropped,
                "Collected render pass signals"
            );
        }
        buffer.signals
    }

    /// Forget a pass whose results are no longer wanted.
    pub fn discard(&mut self, pass: RenderPassId) {
        self.passes.remove(&pass);
    }

    #[must_use]
    pub fn pending_passes(&self) -> usize {
        self.passes.len()
    }

    #[must_use]
    pub fn buffered(&self, pass: RenderPassId) -> usize {
        self.passes.get(&pass).map_or(0, |b| b.signals.len())
    }
}
