#![no_main]

use libfuzzer_sys::fuzz_target;
use redbox_core::events::{CollaboratorEvent, ConnectionId};
use redbox_core::runtime::PageConnection;
use redbox_core::signals::normalize;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let mut conn = PageConnection::new(ConnectionId(1), Default::default(), 16);
    for line in text.lines().take(256) {
        let Ok(event) = serde_json::from_str::<CollaboratorEvent>(line) else {
            continue;
        };
        if let CollaboratorEvent::Framework(redbox_core::events::FrameworkEvent::Hydration {
            event: raw,
            ..
        }) = &event
        {
            if let Some(signal) = normalize(raw) {
                assert!(!signal.node_path.is_empty());
            }
        }
        conn.apply(event);
    }
    let _ = conn.report();
});
