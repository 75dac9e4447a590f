//! Overlay session: the per-connection "currently displayed error" state.
//!
//! # State machine
//!
//! ```text
//!            pass, no signals
//!           ┌──────────────┐
//!           ▼              │
//!        ┌───────┐  pass, signals   ┌──────────────┐
//!        │ Empty │ ───────────────► │ Showing(d)   │ ◄─┐ pass, signals
//!        └───────┘ ◄─────────────── └──────────────┘ ──┘ (d' replaces d)
//!                   pass, no signals
//! ```
//!
//! A rebuild advances the shared [`EpochClock`]; commits stamped with an
//! older epoch are discarded before they can touch the state. Between the
//! rebuild and the first commit of the new epoch the previous diagnostic
//! stays visible with `rebuilding = true`.
//!
//! Readers never see a half-built diagnostic: every commit publishes a whole
//! [`OverlaySnapshot`] through a `watch` channel and [`OverlayHandle`] reads
//! from that channel only.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::composer::{Diagnostic, DiagnosticComposer};
use crate::events::{ConnectionId, EventBus, OverlayEvent, OverlayEventKind};
use crate::rebuild::{BuildEpoch, EpochClock};
use crate::signals::MismatchSignal;

/// Overlay state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OverlayState {
    #[default]
    Empty,
    Showing(Arc<Diagnostic>),
}

impl OverlayState {
    #[must_use]
    pub fn diagnostic(&self) -> Option<&Arc<Diagnostic>> {
        match self {
            Self::Empty => None,
            Self::Showing(d) => Some(d),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Showing(_) => "showing",
        }
    }
}

/// Whole committed overlay state as seen by readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub connection_id: ConnectionId,
    pub build_epoch: BuildEpoch,
    /// A rebuild is pending and the shown diagnostic may be outdated.
    pub rebuilding: bool,
    pub diagnostic: Option<Arc<Diagnostic>>,
    /// Increments on every published change.
    pub commit_seq: u64,
}

impl OverlaySnapshot {
    fn initial(connection_id: ConnectionId, epoch: BuildEpoch) -> Self {
        Self {
            connection_id,
            build_epoch: epoch,
            rebuilding: false,
            diagnostic: None,
            commit_seq: 0,
        }
    }

    #[must_use]
    pub fn has_active(&self) -> bool {
        self.diagnostic.is_some()
    }

    /// `(description, causes_text)` of the active diagnostic.
    #[must_use]
    pub fn describe(&self) -> Option<(String, String)> {
        self.diagnostic
            .as_ref()
            .map(|d| (d.description.clone(), d.causes_text().to_string()))
    }
}

/// Result of committing one completed render pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    Shown,
    Replaced,
    Cleared,
    /// Empty pass while already empty.
    Unchanged,
    StaleDiscarded {
        pass_epoch: BuildEpoch,
        current_epoch: BuildEpoch,
    },
}

impl CommitOutcome {
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleDiscarded { .. })
    }
}

/// Per-session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub shown: u64,
    pub replaced: u64,
    pub cleared: u64,
    pub unchanged: u64,
    pub stale_discarded: u64,
    pub rebuilds: u64,
}

/// Cheap, cloneable read side of an overlay session.
#[derive(Debug, Clone)]
pub struct OverlayHandle {
    rx: watch::Receiver<OverlaySnapshot>,
}

impl OverlayHandle {
    #[must_use]
    pub fn has_active(&self) -> bool {
        self.rx.borrow().has_active()
    }

    #[must_use]
    pub fn describe(&self) -> Option<(String, String)> {
        self.rx.borrow().describe()
    }

    #[must_use]
    pub fn snapshot(&self) -> OverlaySnapshot {
        self.rx.borrow().clone()
    }

    /// Fresh receiver for change notifications.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<OverlaySnapshot> {
        self.rx.clone()
    }

    /// Wait for the next published snapshot. Errors once the session is gone.
    pub async fn changed(&mut self) -> crate::Result<OverlaySnapshot> {
        self.rx
            .changed()
            .await
            .map_err(|_| crate::Error::Runtime("overlay session dropped".to_string()))?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

/// Write side of the overlay for one page connection.
#[derive(Debug)]
pub struct OverlaySession {
    connection_id: ConnectionId,
    clock: Arc<EpochClock>,
    composer: DiagnosticComposer,
    state: OverlayState,
    rebuilding: bool,
    commit_seq: u64,
    stats: SessionStats,
    snapshot_tx: watch::Sender<OverlaySnapshot>,
    events: Option<EventBus>,
}

impl OverlaySession {
    #[must_use]
    pub fn new(
        connection_id: ConnectionId,
        clock: Arc<EpochClock>,
        composer: DiagnosticComposer,
    ) -> Self {
        let (snapshot_tx, _) =
            watch::channel(OverlaySnapshot::initial(connection_id, clock.current()));
        Self {
            connection_id,
            clock,
            composer,
            state: OverlayState::Empty,
            rebuilding: false,
            commit_seq: 0,
            stats: SessionStats::default(),
            snapshot_tx,
            events: None,
        }
    }

    /// Announce transitions on `bus`.
    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> &OverlayState {
        &self.state
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    #[must_use]
    pub fn build_epoch(&self) -> BuildEpoch {
        self.clock.current()
    }

    #[must_use]
    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding
    }

    #[must_use]
    pub fn has_active(&self) -> bool {
        self.state.diagnostic().is_some()
    }

    #[must_use]
    pub fn describe(&self) -> Option<(String, String)> {
        self.state
            .diagnostic()
            .map(|d| (d.description.clone(), d.causes_text().to_string()))
    }

    #[must_use]
    pub fn handle(&self) -> OverlayHandle {
        OverlayHandle {
            rx: self.snapshot_tx.subscribe(),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> OverlaySnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Mark the shown state as pending a rebuild that reached `epoch`.
    pub fn on_rebuild(&mut self, epoch: BuildEpoch) {
        self.stats.rebuilds += 1;
        self.rebuilding = true;
        tracing::debug!(
            connection_id = %self.connection_id,
            epoch = %epoch,
            state = self.state.name(),
            "Overlay awaiting first pass of new build"
        );
        self.publish(OverlayEventKind::RebuildStarted);
    }

    /// Commit the signal set of a completed pass stamped with `pass_epoch`.
    pub fn commit_pass(
        &mut self,
        pass_epoch: BuildEpoch,
        signals: Vec<MismatchSignal>,
    ) -> CommitOutcome {
        let current_epoch = self.clock.current();
        if pass_epoch < current_epoch {
            self.stats.stale_discarded += 1;
            tracing::debug!(
                connection_id = %self.connection_id,
                pass_epoch = %pass_epoch,
                current_epoch = %current_epoch,
                signals = signals.len(),
                "Discarding render pass from stale epoch"
            );
            if let Some(bus) = self.events.as_ref() {
                bus.publish(OverlayEvent {
                    connection_id: self.connection_id,
                    epoch: current_epoch,
                    commit_seq: self.commit_seq,
                    kind: OverlayEventKind::StaleDiscarded { pass_epoch },
                });
            }
            return CommitOutcome::StaleDiscarded {
                pass_epoch,
                current_epoch,
            };
        }

        let was_rebuilding = std::mem::replace(&mut self.rebuilding, false);

        if signals.is_empty() {
            return match std::mem::take(&mut self.state) {
                OverlayState::Showing(_) => {
                    self.stats.cleared += 1;
                    tracing::info!(
                        connection_id = %self.connection_id,
                        epoch = %pass_epoch,
                        "Hydration mismatch resolved; overlay cleared"
                    );
                    self.publish(OverlayEventKind::Cleared);
                    CommitOutcome::Cleared
                }
                OverlayState::Empty => {
                    self.stats.unchanged += 1;
                    if was_rebuilding {
                        self.publish_snapshot();
                    }
                    CommitOutcome::Unchanged
                }
            };
        }

        let diagnostic = match self.composer.compose(pass_epoch, &signals) {
            Ok(d) => Arc::new(d),
            Err(err) => {
                // Unreachable for non-empty input; keep the page alive regardless.
                tracing::warn!(connection_id = %self.connection_id, error = %err, "Compose failed");
                self.stats.unchanged += 1;
                return CommitOutcome::Unchanged;
            }
        };
        let fingerprint = diagnostic.fingerprint.clone();
        let causes = diagnostic.causes;
        let previous = std::mem::replace(&mut self.state, OverlayState::Showing(diagnostic));

        tracing::info!(
            connection_id = %self.connection_id,
            epoch = %pass_epoch,
            signals = signals.len(),
            causes = ?causes.to_vec(),
            "Hydration mismatch overlay {}",
            if previous.diagnostic().is_some() { "replaced" } else { "shown" }
        );

        match previous {
            OverlayState::Empty => {
                self.stats.shown += 1;
                self.publish(OverlayEventKind::Shown {
                    fingerprint,
                    causes,
                });
                CommitOutcome::Shown
            }
            OverlayState::Showing(_) => {
                self.stats.replaced += 1;
                self.publish(OverlayEventKind::Replaced {
                    fingerprint,
                    causes,
                });
                CommitOutcome::Replaced
            }
        }
    }

    fn publish(&mut self, kind: OverlayEventKind) {
        self.publish_snapshot();
        if let Some(bus) = self.events.as_ref() {
            bus.publish(OverlayEvent {
                connection_id: self.connection_id,
                epoch: self.clock.current(),
                commit_seq: self.commit_seq,
                kind,
            });
        }
    }

    fn publish_snapshot(&mut self) {
        self.commit_seq += 1;
        let snapshot = OverlaySnapshot {
            connection_id: self.connection_id,
            build_epoch: self.clock.current(),
            rebuilding: self.rebuilding,
            diagnostic: self.state.diagnostic().cloned(),
            commit_seq: self.commit_seq,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}
