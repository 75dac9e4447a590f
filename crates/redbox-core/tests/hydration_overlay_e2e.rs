//! End-to-end overlay behavior for a text hydration mismatch.
//!
//! Drives a dev server with a scripted framework: a component that renders
//! `isClient ? "client" : "server"` raises a recoverable hydration error, the
//! overlay shows the fixed description and warning, and patching the
//! component to render `Value` clears the overlay after the rebuild.

use std::time::Duration;

use redbox_core::classifier::CauseTag;
use redbox_core::config::Config;
use redbox_core::events::{FrameworkEvent, OverlayEventKind};
use redbox_core::rebuild::BuildEpoch;
use redbox_core::runtime::{ConnectionHandle, DevServer};
use redbox_core::signals::{RawHydrationEvent, RenderPassId};
use redbox_core::wait::{wait_for_no_redbox, wait_for_redbox, wait_for_render_idle};

const MISMATCH_SOURCE: &str = r#"const isClient = typeof window !== 'undefined'
export default function Mismatch() {
    return (
      <div className="parent">
        <main className="child">{isClient ? "client" : "server"}</main>
      </div>
    );
  }"#;

const PATCHED_SOURCE: &str = r#"export default function Mismatch() {
    return (
      <div className="parent">
        <main className="child">Value</main>
      </div>
    );
  }"#;

const EXPECTED_DESCRIPTION: &str = "Hydration failed because the server rendered HTML didn't match the client. As a result this tree will be regenerated on the client. This can happen if a SSR-ed Client Component used
See more info here: https://nextjs.org/docs/messages/react-hydration-error";

const EXPECTED_WARNING: &str = "- A server/client branch `if (typeof window !== 'undefined')`.
- Variable input such as `Date.now()` or `Math.random()` which changes each time it's called.
- Date formatting in a user's locale which doesn't match the server.
- External changing data without sending a snapshot of it along with the HTML.
- Invalid HTML tag nesting.

It can also happen if the client has a browser extension installed which messes with the HTML before React loaded.";

const TIMEOUT: Duration = Duration::from_secs(5);

/// Text each side renders into `.child` for a given component source.
fn render_child(source: &str) -> (&'static str, &'static str) {
    if source.contains(r#"isClient ? "client" : "server""#) {
        ("server", "client")
    } else {
        ("Value", "Value")
    }
}

/// Block until the connection loop has committed `passes` render passes.
async fn passes_committed(conn: &ConnectionHandle, passes: u64) {
    let mut activity = conn.activity.clone();
    tokio::time::timeout(TIMEOUT, activity.wait_for(|a| a.passes_completed >= passes))
        .await
        .expect("render passes committed in time")
        .expect("connection alive");
}

/// Script one render pass the way the framework reports it.
async fn render(conn: &ConnectionHandle, pass: u64, source: &str) -> &'static str {
    let pass_id = RenderPassId(pass);
    conn.framework
        .send(FrameworkEvent::PassStarted { pass_id })
        .await
        .unwrap();

    let (server, client) = render_child(source);
    if server != client {
        let diff = format!(
            "  <Mismatch>\n    <div className=\"parent\">\n      <main className=\"child\">\n+        {client}\n-        {server}\n"
        );
        conn.framework
            .send(FrameworkEvent::Hydration {
                pass_id,
                event: RawHydrationEvent::RecoverableError {
                    message: "Hydration failed because the server rendered HTML didn't match the client.".to_string(),
                    component_stack: None,
                    diff: Some(diff),
                    component_source: Some(source.to_string()),
                },
            })
            .await
            .unwrap();
    }

    conn.framework
        .send(FrameworkEvent::PassCompleted { pass_id })
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn text_mismatch_shows_redbox_then_clears_after_patch() {
    let mut server = DevServer::new(&Config::default()).unwrap();
    let mut events = server.subscribe();
    let conn = server.connect();

    render(&conn, 1, MISMATCH_SOURCE).await;

    let snapshot = wait_for_redbox(&conn.overlay, TIMEOUT).await.unwrap();
    let (description, warning) = conn.overlay.describe().unwrap();
    assert_eq!(description, EXPECTED_DESCRIPTION);
    assert_eq!(warning, EXPECTED_WARNING);

    let diagnostic = snapshot.diagnostic.unwrap();
    assert_eq!(diagnostic.epoch, BuildEpoch(0));
    assert_eq!(diagnostic.causes.to_vec(), vec![CauseTag::EnvBranch]);
    assert_eq!(diagnostic.raw_signals.len(), 1);
    assert_eq!(
        diagnostic.raw_signals[0].node_path.to_string(),
        "div.parent > main.child"
    );
    assert_eq!(
        diagnostic.details(200),
        vec![
            "div.parent > main.child (Mismatch)".to_string(),
            "+ client".to_string(),
            "- server".to_string(),
        ]
    );

    // Patch the component; the rebuild pipeline reports the change first.
    assert_eq!(server.file_changed("index.js").await, 1);
    let rendered = render(&conn, 2, PATCHED_SOURCE).await;

    let snapshot = wait_for_no_redbox(&conn.overlay, TIMEOUT).await.unwrap();
    assert_eq!(snapshot.build_epoch, BuildEpoch(1));
    assert!(conn.overlay.describe().is_none());
    assert_eq!(rendered, "Value");

    wait_for_render_idle(conn.activity.clone(), Duration::ZERO, TIMEOUT)
        .await
        .unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    assert!(matches!(kinds.first(), Some(OverlayEventKind::Shown { .. })));
    assert!(kinds.contains(&OverlayEventKind::RebuildStarted));
    assert_eq!(kinds.last(), Some(&OverlayEventKind::Cleared));
}

#[tokio::test]
async fn clean_first_render_never_shows_redbox() {
    let mut server = DevServer::new(&Config::default()).unwrap();
    let conn = server.connect();

    render(&conn, 1, PATCHED_SOURCE).await;
    passes_committed(&conn, 1).await;
    wait_for_render_idle(conn.activity.clone(), Duration::ZERO, TIMEOUT)
        .await
        .unwrap();

    assert!(!conn.overlay.has_active());
    let snapshot = conn.overlay.snapshot();
    assert_eq!(snapshot.commit_seq, 0);
}

#[tokio::test]
async fn connections_do_not_share_overlay_state() {
    let mut server = DevServer::new(&Config::default()).unwrap();
    let broken = server.connect();
    let clean = server.connect();

    render(&broken, 1, MISMATCH_SOURCE).await;
    render(&clean, 1, PATCHED_SOURCE).await;

    wait_for_redbox(&broken.overlay, TIMEOUT).await.unwrap();
    passes_committed(&clean, 1).await;
    wait_for_render_idle(clean.activity.clone(), Duration::ZERO, TIMEOUT)
        .await
        .unwrap();
    assert!(!clean.overlay.has_active());
    assert_ne!(broken.id, clean.id);
}
