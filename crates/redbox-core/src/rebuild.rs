//! Rebuild correlation and the per-connection epoch guard.
//!
//! Every file change advances the connection's [`EpochClock`]. Render passes
//! are stamped with the epoch that was current when they started, and the
//! overlay session rejects commits whose stamp is older than the clock. The
//! atomic compare is the only concurrency control between a slow stale pass
//! and a newer rebuild.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::signals::RenderPassId;

/// Finished or retired passes remembered so late events can be recognized.
pub const MAX_CLOSED_PASSES: usize = 64;

/// Rebuild generation counter value.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BuildEpoch(pub u64);

impl fmt::Display for BuildEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic epoch counter shared by one connection's correlator and session.
#[derive(Debug, Default)]
pub struct EpochClock {
    current: AtomicU64,
}

impl EpochClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[must_use]
    pub fn current(&self) -> BuildEpoch {
        BuildEpoch(self.current.load(Ordering::Acquire))
    }

    /// Increment and return the new epoch.
    pub fn advance(&self) -> BuildEpoch {
        BuildEpoch(self.current.fetch_add(1, Ordering::AcqRel).saturating_add(1))
    }

    /// True if a result stamped with `epoch` must be discarded.
    #[must_use]
    pub fn is_stale(&self, epoch: BuildEpoch) -> bool {
        epoch < self.current()
    }
}

/// Where a render pass stands in the correlator's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "epoch", rename_all = "snake_case")]
pub enum PassStatus {
    /// Started and not yet finished.
    Open(BuildEpoch),
    /// Already finished, or retired by a newer file change.
    Closed(BuildEpoch),
    /// Never started (or forgotten).
    Unknown,
}

/// Why a re-render was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RebuildReason {
    FileChanged { path: PathBuf },
    Manual,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileChanged { path } => write!(f, "file changed: {}", path.display()),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Request sent to the rendering pipeline after an epoch advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub epoch: BuildEpoch,
    pub reason: RebuildReason,
}

/// Counters kept by the correlator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorStats {
    pub file_changes: u64,
    pub failed_builds: u64,
    /// Render requests not delivered because the pipeline queue was full or gone.
    pub requests_dropped: u64,
}

/// Tags render passes with epochs and advances the clock on file changes.
#[derive(Debug)]
pub struct RebuildCorrelator {
    clock: Arc<EpochClock>,
    render_tx: Option<mpsc::Sender<RenderRequest>>,
    pass_epochs: HashMap<RenderPassId, BuildEpoch>,
    /// Bounded ring of finished or retired passes, oldest first.
    closed: VecDeque<(RenderPassId, BuildEpoch)>,
    stats: CorrelatorStats,
}

impl RebuildCorrelator {
    #[must_use]
    pub fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            clock,
            render_tx: None,
            pass_epochs: HashMap::new(),
            closed: VecDeque::new(),
            stats: CorrelatorStats::default(),
        }
    }

    /// Route render requests to the rendering pipeline.
    #[must_use]
    pub fn with_render_requests(mut self, tx: mpsc::Sender<RenderRequest>) -> Self {
        self.render_tx = Some(tx);
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<EpochClock> {
        &self.clock
    }

    #[must_use]
    pub fn current_epoch(&self) -> BuildEpoch {
        self.clock.current()
    }

    #[must_use]
    pub fn stats(&self) -> CorrelatorStats {
        self.stats
    }

    /// Advance the epoch and ask the pipeline to re-render.
    pub fn on_file_change(&mut self, reason: RebuildReason) -> BuildEpoch {
        let epoch = self.clock.advance();
        self.stats.file_changes += 1;
        tracing::debug!(epoch = %epoch, reason = %reason, "Rebuild triggered");

        if let Some(tx) = self.render_tx.as_ref() {
            match tx.try_send(RenderRequest { epoch, reason }) {
                Ok(()) => {}
                Err(TrySendError::Full(request)) => {
                    // A pending request will render the latest source anyway.
                    self.stats.requests_dropped += 1;
                    tracing::debug!(epoch = %request.epoch, "Render request queue full; coalescing");
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.requests_dropped += 1;
                    tracing::warn!(epoch = %epoch, "Rendering pipeline closed; render request dropped");
                }
            }
        }
        epoch
    }

    /// Record a failed rebuild. The epoch stays advanced; the visible
    /// diagnostic is kept until a pass of the new epoch completes.
    pub fn on_build_failed(&mut self, epoch: BuildEpoch, message: &str) {
        self.stats.failed_builds += 1;
        tracing::info!(epoch = %epoch, error = message, "Rebuild failed");
    }

    /// Stamp a starting pass with the current epoch. Reusing a closed pass
    /// id opens it afresh.
    pub fn begin_pass(&mut self, pass: RenderPassId) -> BuildEpoch {
        let epoch = self.clock.current();
        self.closed.retain(|(id, _)| *id != pass);
        self.pass_epochs.insert(pass, epoch);
        tracing::trace!(pass_id = %pass, epoch = %epoch, "Render pass started");
        epoch
    }

    /// Epoch a still-open pass was stamped with.
    #[must_use]
    pub fn pass_epoch(&self, pass: RenderPassId) -> Option<BuildEpoch> {
        self.pass_epochs.get(&pass).copied()
    }

    #[must_use]
    pub fn pass_status(&self, pass: RenderPassId) -> PassStatus {
        if let Some(epoch) = self.pass_epochs.get(&pass) {
            return PassStatus::Open(*epoch);
        }
        self.closed
            .iter()
            .rev()
            .find(|(id, _)| *id == pass)
            .map_or(PassStatus::Unknown, |(_, epoch)| PassStatus::Closed(*epoch))
    }

    /// Close a pass and report how it stood before. An open pass becomes
    /// closed; closed and unknown passes are left as they are.
    pub fn finish_pass(&mut self, pass: RenderPassId) -> PassStatus {
        match self.pass_epochs.remove(&pass) {
            Some(epoch) => {
                self.remember_closed(pass, epoch);
                PassStatus::Open(epoch)
            }
            None => self.pass_status(pass),
        }
    }

    /// Close every open pass stamped before the current epoch and return
    /// their ids. Their results can no longer reach the overlay.
    pub fn retire_stale_passes(&mut self) -> Vec<RenderPassId> {
        let current = self.clock.current();
        let mut retired: Vec<(RenderPassId, BuildEpoch)> = self
            .pass_epochs
            .iter()
            .filter(|(_, epoch)| **epoch < current)
            .map(|(pass, epoch)| (*pass, *epoch))
            .collect();
        retired.sort();
        for (pass, epoch) in &retired {
            self.pass_epochs.remove(pass);
            self.remember_closed(*pass, *epoch);
        }
        if !retired.is_empty() {
            tracing::debug!(
                epoch = %current,
                retired = retired.len(),
                "Retired render passes from older builds"
            );
        }
        retired.into_iter().map(|(pass, _)| pass).collect()
    }

    fn remember_closed(&mut self, pass: RenderPassId, epoch: BuildEpoch) {
        self.closed.retain(|(id, _)| *id != pass);
        if self.closed.len() >= MAX_CLOSED_PASSES {
            self.closed.pop_front();
        }
        self.closed.push_back((pass, epoch));
    }

    /// Open passes stamped with the current epoch.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let current = self.clock.current();
        self.pass_epochs.values().filter(|epoch| **epoch >= current).count()
    }

    /// Passes currently tracked as open, any epoch.
    #[must_use]
    pub fn open_passes(&self) -> usize {
        self.pass_epochs.len()
    }
}
