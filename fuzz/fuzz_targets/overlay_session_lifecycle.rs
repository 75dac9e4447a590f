#![no_main]

use libfuzzer_sys::fuzz_target;
use redbox_core::classifier::CauseTag;
use redbox_core::composer::{DiagnosticComposer, HYDRATION_DESCRIPTION};
use redbox_core::events::{ConnectionId, FrameworkEvent, RebuildEvent};
use redbox_core::overlay::CommitOutcome;
use redbox_core::runtime::{PageConnection, StepOutcome};
use redbox_core::signals::{RawHydrationEvent, RenderPassId};

const SOURCES: [&str; 6] = [
    "const isClient = typeof window !== 'undefined'",
    "const now = Date.now()",
    "new Intl.DateTimeFormat().format(d)",
    "const res = await fetch('/api')",
    "return <b>{label}</b>",
    "",
];

const PATHS: [&[&str]; 5] = [
    &["div.parent", "main.child"],
    &["p", "div"],
    &["ul", "li", "a"],
    &["table", "tr"],
    &[],
];

fn raw_event(tag: u8, seed: u8) -> RawHydrationEvent {
    let source = SOURCES[usize::from(seed) % SOURCES.len()];
    let path = PATHS[usize::from(seed / 8) % PATHS.len()];
    match tag % 4 {
        0 => RawHydrationEvent::TextMismatch {
            server_text: format!("s{seed}"),
            client_text: format!("c{seed}"),
            node_path: path.iter().map(|s| (*s).to_string()).collect(),
            component_name: None,
            component_source: (!source.is_empty()).then(|| source.to_string()),
            outside_snapshot: seed % 7 == 0,
        },
        1 => RawHydrationEvent::ConsoleWarning {
            format: "Warning: Text content did not match. Server: \"%s\" Client: \"%s\"".to_string(),
            args: vec![format!("s{seed}"), format!("c{seed}")],
            component_stack: Some("\n    at main\n    at div\n    at Page".to_string()),
            component_source: Some(source.to_string()),
        },
        2 => RawHydrationEvent::NestingWarning {
            parent_tag: "p".to_string(),
            child_tag: "div".to_string(),
            node_path: None,
            component_source: None,
        },
        _ => RawHydrationEvent::Other {
            message: format!("unrelated log {seed}"),
        },
    }
}

fuzz_target!(|data: &[u8]| {
    let mut conn = PageConnection::new(ConnectionId(1), DiagnosticComposer::default(), 8);
    let mut last_epoch = conn.current_epoch();

    for chunk in data.chunks(3).take(512) {
        let op = chunk[0];
        let pass_id = RenderPassId(u64::from(chunk.get(1).copied().unwrap_or(0) % 4));
        let seed = chunk.get(2).copied().unwrap_or(0);

        let step = match op % 6 {
            0 => conn.apply(FrameworkEvent::PassStarted { pass_id }.into()),
            1 | 2 => conn.apply(
                FrameworkEvent::Hydration {
                    pass_id,
                    event: raw_event(op / 6, seed),
                }
                .into(),
            ),
            3 => conn.apply(FrameworkEvent::PassCompleted { pass_id }.into()),
            4 => conn.apply(
                RebuildEvent::FileChanged {
                    path: format!("src/{seed}.tsx").into(),
                }
                .into(),
            ),
            _ => conn.apply(
                RebuildEvent::BuildFailed {
                    message: format!("error {seed}"),
                }
                .into(),
            ),
        };

        let epoch = conn.current_epoch();
        assert!(epoch >= last_epoch, "epoch went backwards");
        assert!(conn.activity().borrow().in_flight <= 4);
        last_epoch = epoch;

        if let StepOutcome::Committed {
            commit: CommitOutcome::StaleDiscarded { pass_epoch, current_epoch },
        } = step
        {
            assert!(pass_epoch < current_epoch);
        }

        if let Some(diagnostic) = conn.session().state().diagnostic() {
            assert!(!diagnostic.raw_signals.is_empty());
            assert!(!diagnostic.causes.is_empty());
            assert!(diagnostic.epoch <= epoch);
            assert_eq!(diagnostic.description, HYDRATION_DESCRIPTION);
            let any_unknown = diagnostic
                .classifications
                .iter()
                .any(|c| c.tags.contains(CauseTag::Unknown));
            assert_eq!(diagnostic.causes.contains(CauseTag::Unknown), any_unknown);
        }
    }
});
