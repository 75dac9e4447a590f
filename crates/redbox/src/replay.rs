//! Transcript replay through a single page connection.
//!
//! A transcript is JSON Lines: one `CollaboratorEvent` per line, blank lines
//! and `#` comments ignored. Events are applied in file order, so the result
//! is deterministic regardless of how the live runtime would interleave them.

use anyhow::{Context, Result, bail};
use serde::Serialize;

use redbox_core::config::Config;
use redbox_core::events::{CollaboratorEvent, ConnectionId};
use redbox_core::runtime::{ConnectionReport, PageConnection, StepOutcome};

/// Connection id used for replays.
const REPLAY_CONNECTION: ConnectionId = ConnectionId(1);

#[derive(Debug, Clone, Serialize)]
pub struct ReplayResult {
    pub events_applied: usize,
    pub steps: Vec<StepOutcome>,
    pub report: ConnectionReport,
}

pub fn parse_transcript(raw: &str) -> Result<Vec<CollaboratorEvent>> {
    let mut events = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event = CollaboratorEvent::from_json_line(line)
            .with_context(|| format!("line {}: not a collaborator event", idx + 1))?;
        events.push(event);
    }
    if events.is_empty() {
        bail!("transcript contains no events");
    }
    Ok(events)
}

pub fn replay(config: &Config, events: Vec<CollaboratorEvent>) -> Result<ReplayResult> {
    let mut conn = PageConnection::from_config(REPLAY_CONNECTION, config)?;
    let span = tracing::info_span!("replay", connection_id = %REPLAY_CONNECTION);
    let _guard = span.enter();

    let events_applied = events.len();
    let steps: Vec<StepOutcome> = events.into_iter().map(|event| conn.apply(event)).collect();

    tracing::info!(
        events = events_applied,
        active = conn.session().has_active(),
        "Replay finished"
    );

    Ok(ReplayResult {
        events_applied,
        steps,
        report: conn.report(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use redbox_core::overlay::CommitOutcome;

    const TRANSCRIPT: &str = r#"
# first render fails
{"type":"pass_started","pass_id":1}
{"type":"hydration","pass_id":1,"event":{"kind":"text_mismatch","server_text":"server","client_text":"client","node_path":["div.parent","main.child"],"component_source":"const isClient = typeof window !== 'undefined'"}}
{"type":"pass_completed","pass_id":1}
{"type":"file_changed","path":"app/page.tsx"}
{"type":"pass_started","pass_id":2}
{"type":"pass_completed","pass_id":2}
"#;

    #[test]
    fn parses_both_event_families() {
        let events = parse_transcript(TRANSCRIPT).unwrap();
        assert_eq!(events.len(), 6);
        assert!(matches!(events[3], CollaboratorEvent::Rebuild(_)));
        assert!(matches!(events[0], CollaboratorEvent::Framework(_)));
    }

    #[test]
    fn replay_clears_after_clean_rebuild() {
        let events = parse_transcript(TRANSCRIPT).unwrap();
        let result = replay(&Config::default(), events).unwrap();
        assert_eq!(result.events_applied, 6);
        assert!(!result.report.final_snapshot.has_active());
        assert_eq!(
            result.steps.last(),
            Some(&StepOutcome::Committed {
                commit: CommitOutcome::Cleared
            })
        );
        assert_eq!(result.report.session.shown, 1);
        assert_eq!(result.report.session.cleared, 1);
    }

    #[test]
    fn bad_line_reports_line_number() {
        let err = parse_transcript("{\"type\":\"pass_started\",\"pass_id\":1}\nnot json\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }

    #[test]
    fn bad_line_keeps_json_error_source() {
        let err = parse_transcript("{\"type\":\"teleport\"}\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<redbox_core::Error>(),
            Some(redbox_core::Error::Json(_))
        ));
    }

    #[test]
    fn empty_transcript_is_rejected() {
        assert!(parse_transcript("# nothing\n\n").is_err());
    }
}
