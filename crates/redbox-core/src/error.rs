//! Error types for redbox-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
    /// Optional reference for more details
    pub learn_more: Option<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
            learn_more: None,
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Add a learn-more reference
    #[must_use]
    pub fn learn_more(mut self, link: impl Into<String>) -> Self {
        self.learn_more = Some(link.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        if let Some(learn_more) = &self.learn_more {
            let _ = writeln!(output, "  Learn more: {learn_more}");
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for redbox-core
#[derive(Error, Debug)]
pub enum Error {
    /// Diagnostic composition errors
    #[error("Compose error: {0}")]
    Compose(#[from] ComposeError),

    /// Classifier rule errors
    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (closed channels, dropped connections)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Compose(err) => Some(err.remediation()),
            Self::Pattern(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "redbox config show")
                    .alternative("Verify the transcript or config path exists and is readable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .command("Validate JSON", "python -m json.tool < input.json")
                    .alternative("Transcripts are JSON lines: one event object per line."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("The page connection stopped. Reload the page to reconnect.")
                    .command("Replay transcript", "redbox replay <transcript.jsonl>")
                    .alternative("If the issue persists, restart the dev server."),
            ),
        }
    }
}

/// Diagnostic composition errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    /// Composer invoked without any mismatch signal. Callers must clear the
    /// overlay instead of composing.
    #[error("compose() requires at least one mismatch signal")]
    EmptyInput,
}

impl ComposeError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::EmptyInput => Remediation::new(
                "A render pass without mismatch signals must clear the overlay, not compose.",
            )
            .command("Replay transcript", "redbox replay <transcript.jsonl> --format json")
            .alternative("Route empty passes through OverlaySession::commit_pass."),
        }
    }
}

/// Classifier rule errors
#[derive(Error, Debug)]
pub enum PatternError {
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Pack not found: {0}")]
    PackNotFound(String),
}

impl PatternError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::InvalidRule(_) => {
                Remediation::new("Classifier rule invalid. Fix or remove the custom rule.")
                    .command("List rules", "redbox rules")
                    .alternative("Every custom rule needs an id, a tag, and at least one anchor.")
            }
            Self::InvalidRegex(_) => Remediation::new(
                "Classifier regex invalid. Fix the regex in [[classifier.rules]].",
            )
            .command("List rules", "redbox rules")
            .alternative("Validate the regex syntax."),
            Self::PackNotFound(_) => Remediation::new(
                "Classifier pack not found. Use a known pack name in [classifier].packs.",
            )
            .command("List rules", "redbox rules")
            .alternative("The built-in pack is named builtin:hydration."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the syntax and retry.")
                .command("Show defaults", "redbox config show")
                .alternative("Validate the file as TOML."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show defaults", "redbox config show")
                    .alternative("Review validation errors and adjust redbox.toml.")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
