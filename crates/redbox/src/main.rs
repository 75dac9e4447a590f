//! redbox - hydration mismatch overlay harness
//!
//! Replays recorded collaborator transcripts through a page connection and
//! prints the resulting overlay, classifies ad-hoc component sources, and
//! lists the active classifier rules.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use redbox_core::classifier::CauseClassifier;
use redbox_core::config::{Config, LogFormat};
use redbox_core::error::format_error_with_remediation;
use redbox_core::logging::{LogError, init_logging};
use redbox_core::signals::{MismatchSignal, NodePath};

mod output;
mod replay;

/// Exit code when `replay --check` ends with an active overlay.
const EXIT_REDBOX_ACTIVE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "redbox",
    version,
    about = "Hydration mismatch detector and dev error overlay harness",
    arg_required_else_help = true
)]
struct Cli {
    /// Config file (default: built-in defaults).
    #[arg(long, global = true, env = "REDBOX_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level filter; `RUST_LOG` still wins when set.
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log output format on stderr.
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a JSONL transcript of framework and rebuild events.
    Replay {
        /// Transcript path, or `-` for stdin.
        transcript: PathBuf,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,

        /// Exit with status 2 if the overlay is still showing at the end.
        #[arg(long)]
        check: bool,
    },

    /// Classify one mismatch against a component source.
    Classify {
        /// Component source file, or `-` for stdin.
        #[arg(long, value_name = "FILE")]
        source: Option<PathBuf>,

        /// Client-rendered text at the mismatch.
        #[arg(long, default_value = "")]
        observed: String,

        /// Server-rendered text at the mismatch.
        #[arg(long)]
        counterpart: Option<String>,

        /// Node path, e.g. `div.parent > main.child`.
        #[arg(long, default_value = "#root")]
        path: String,

        /// Rendered data was missing from the server snapshot.
        #[arg(long)]
        outside_snapshot: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// List the classifier rules in effect.
    Rules {
        #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
        format: OutputFormat,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML.
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            match err.downcast_ref::<redbox_core::Error>() {
                Some(core) if err.chain().count() == 1 => {
                    eprintln!("{}", format_error_with_remediation(core));
                }
                Some(core) => {
                    eprintln!("Error: {err:#}");
                    if let Some(remediation) = core.remediation() {
                        eprintln!("\n{}", remediation.render_plain());
                    }
                }
                None => eprintln!("Error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match cli.config.as_deref() {
        Some(path) => Config::load_from(path)?,
        None => Config::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    match init_logging(&config.logging) {
        Ok(()) | Err(LogError::AlreadyInitialized) => {}
        Err(err) => return Err(err).context("failed to initialize logging"),
    }

    match cli.command {
        Command::Replay {
            transcript,
            format,
            check,
        } => {
            let raw = read_input(&transcript)
                .with_context(|| format!("failed to read transcript {}", transcript.display()))?;
            let events = replay::parse_transcript(&raw)?;
            let result = replay::replay(&config, events)?;
            match format {
                OutputFormat::Plain => print!("{}", output::render_replay(&result, &config)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }
            if check && result.report.final_snapshot.has_active() {
                return Ok(ExitCode::from(EXIT_REDBOX_ACTIVE));
            }
        }
        Command::Classify {
            source,
            observed,
            counterpart,
            path,
            outside_snapshot,
            format,
        } => {
            let classifier = CauseClassifier::from_config(&config.classifier)?;
            let mut signal = MismatchSignal::client(NodePath::parse(&path), observed)
                .with_outside_snapshot(outside_snapshot);
            if let Some(counterpart) = counterpart {
                signal = signal.with_counterpart(counterpart);
            }
            if let Some(source) = source.as_deref() {
                let text = read_input(source)
                    .with_context(|| format!("failed to read source {}", source.display()))?;
                signal = signal.with_component_source(text);
            }
            let classification = classifier.explain(&signal);
            match format {
                OutputFormat::Plain => print!("{}", output::render_classification(&classification)),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&classification)?);
                }
            }
        }
        Command::Rules { format } => {
            let classifier = CauseClassifier::from_config(&config.classifier)?;
            match format {
                OutputFormat::Plain => print!("{}", output::render_rules(classifier.rules())),
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(classifier.rules())?);
                }
            }
        }
        Command::Config(ConfigCommand::Show) => {
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Read a file, or stdin for `-`.
fn read_input(path: &Path) -> redbox_core::Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}
