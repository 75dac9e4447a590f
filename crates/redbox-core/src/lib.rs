//! redbox-core: hydration mismatch detection and dev error overlay state
//!
//! When client rendering of a server-rendered page diverges from the server
//! markup, this crate turns the framework's raw reports into one structured
//! diagnostic per render pass, keeps it in a per-page overlay session, and
//! clears it once a rebuild renders cleanly.
//!
//! # Architecture
//!
//! ```text
//! file save ─► RebuildCorrelator (epoch+1) ─► framework renders
//!                                                   │
//!                      SignalCollector ◄────────────┘ raw hydration events
//!                            │
//!              signals ≠ ∅   │   signals = ∅
//!          ┌─────────────────┴──────────────┐
//!          ▼                                ▼
//!  CauseClassifier ─► DiagnosticComposer   OverlaySession::clear
//!                            │
//!                            ▼
//!                   OverlaySession (epoch guarded) ─► OverlayHandle / EventBus
//! ```
//!
//! # Modules
//!
//! - `signals`: raw event normalization and per-pass buffering
//! - `classifier`: rule packs mapping signals to cause tags
//! - `nesting`: structural tag-nesting checks
//! - `composer`: verbatim diagnostic text and cause union
//! - `overlay`: per-connection overlay state machine
//! - `rebuild`: epoch clock and render pass correlation
//! - `events`: collaborator events and overlay event bus
//! - `runtime`: page connection event loop and dev server registry
//! - `wait`: wait-for helpers for automation harnesses
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod classifier;
pub mod composer;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod nesting;
pub mod overlay;
pub mod rebuild;
pub mod runtime;
pub mod signals;
pub mod wait;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
