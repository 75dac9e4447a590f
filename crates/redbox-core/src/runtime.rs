//! Page connection runtime.
//!
//! A [`PageConnection`] owns the collector, correlator, and overlay session
//! of exactly one live page and reacts to collaborator events. It can be
//! driven synchronously (replay, tests) or spawned as a task that selects
//! over the framework and rebuild channels. [`DevServer`] is the registry of
//! live connections; it fans file-change events out to every connection
//! while keeping their state isolated.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::Result;
use crate::classifier::CauseClassifier;
use crate::composer::DiagnosticComposer;
use crate::config::Config;
use crate::events::{
    CollaboratorEvent, ConnectionId, EventBus, FrameworkEvent, OverlayEvent, RebuildEvent,
};
use crate::overlay::{
    CommitOutcome, OverlayHandle, OverlaySession, OverlaySnapshot, SessionStats,
};
use crate::rebuild::{
    BuildEpoch, CorrelatorStats, EpochClock, PassStatus, RebuildCorrelator, RebuildReason,
    RenderRequest,
};
use crate::signals::{RecordOutcome, RenderPassId, SignalCollector};

/// Render pipeline activity, published for idle detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderActivity {
    pub in_flight: usize,
    pub last_activity: Option<Instant>,
    pub passes_completed: u64,
}

/// What one collaborator event did to the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum StepOutcome {
    PassStarted { epoch: BuildEpoch },
    Recorded { record: RecordOutcome },
    Committed { commit: CommitOutcome },
    /// Completion for a pass of the current epoch that already committed.
    DuplicateCompletion { pass_id: RenderPassId },
    Rebuild { epoch: BuildEpoch, retired: usize },
    BuildFailed,
}

/// Final state of a connection after it stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionReport {
    pub connection_id: ConnectionId,
    pub session: SessionStats,
    pub correlator: CorrelatorStats,
    pub final_snapshot: OverlaySnapshot,
}

/// Per-connection engine state.
#[derive(Debug)]
pub struct PageConnection {
    id: ConnectionId,
    collector: SignalCollector,
    correlator: RebuildCorrelator,
    session: OverlaySession,
    activity_tx: watch::Sender<RenderActivity>,
}

impl PageConnection {
    #[must_use]
    pub fn new(id: ConnectionId, composer: DiagnosticComposer, max_signals_per_pass: usize) -> Self {
        let clock = EpochClock::shared();
        let (activity_tx, _) = watch::channel(RenderActivity::default());
        Self {
            id,
            collector: SignalCollector::new(max_signals_per_pass),
            correlator: RebuildCorrelator::new(Arc::clone(&clock)),
            session: OverlaySession::new(id, clock, composer),
            activity_tx,
        }
    }

    /// Build from configuration with a freshly compiled classifier.
    pub fn from_config(id: ConnectionId, config: &Config) -> Result<Self> {
        let classifier = CauseClassifier::from_config(&config.classifier)?;
        Ok(Self::new(
            id,
            DiagnosticComposer::new(Arc::new(classifier)),
            config.overlay.max_signals_per_pass,
        ))
    }

    #[must_use]
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.session = self.session.with_events(bus);
        self
    }

    #[must_use]
    pub fn with_render_requests(mut self, tx: mpsc::Sender<RenderRequest>) -> Self {
        self.correlator = self.correlator.with_render_requests(tx);
        self
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn session(&self) -> &OverlaySession {
        &self.session
    }

    #[must_use]
    pub fn overlay(&self) -> OverlayHandle {
        self.session.handle()
    }

    #[must_use]
    pub fn activity(&self) -> watch::Receiver<RenderActivity> {
        self.activity_tx.subscribe()
    }

    #[must_use]
    pub fn current_epoch(&self) -> BuildEpoch {
        self.correlator.current_epoch()
    }

    /// Apply one event of either collaborator.
    pub fn apply(&mut self, event: CollaboratorEvent) -> StepOutcome {
        match event {
            CollaboratorEvent::Framework(event) => self.handle_framework(event),
            CollaboratorEvent::Rebuild(event) => self.handle_rebuild(event),
        }
    }

    pub fn handle_framework(&mut self, event: FrameworkEvent) -> StepOutcome {
        match event {
            FrameworkEvent::PassStarted { pass_id } => {
                self.collector.begin_pass(pass_id);
                let epoch = self.correlator.begin_pass(pass_id);
                self.touch(false);
                StepOutcome::PassStarted { epoch }
            }
            FrameworkEvent::Hydration { pass_id, event } => {
                match self.correlator.pass_status(pass_id) {
                    PassStatus::Open(_) => {}
                    PassStatus::Closed(epoch) => {
                        tracing::debug!(
                            connection_id = %self.id,
                            pass_id = %pass_id,
                            pass_epoch = %epoch,
                            "Hydration event for a closed pass dropped"
                        );
                        return StepOutcome::Recorded {
                            record: RecordOutcome::Late,
                        };
                    }
                    PassStatus::Unknown => {
                        // Framework skipped the start notification.
                        self.collector.begin_pass(pass_id);
                        self.correlator.begin_pass(pass_id);
                        self.touch(false);
                    }
                }
                let record = self.collector.record(pass_id, &event);
                tracing::trace!(
                    connection_id = %self.id,
                    pass_id = %pass_id,
                    kind = event.kind(),
                    outcome = ?record,
                    "Hydration event"
                );
                StepOutcome::Recorded { record }
            }
            FrameworkEvent::PassCompleted { pass_id } => {
                let (epoch, signals) = match self.correlator.finish_pass(pass_id) {
                    PassStatus::Open(epoch) => (epoch, self.collector.collect(pass_id)),
                    PassStatus::Closed(epoch) if self.correlator.clock().is_stale(epoch) => {
                        // Retired by a rebuild; its buffer is already gone.
                        self.collector.discard(pass_id);
                        (epoch, Vec::new())
                    }
                    PassStatus::Closed(_) => {
                        tracing::debug!(
                            connection_id = %self.id,
                            pass_id = %pass_id,
                            "Duplicate pass completion ignored"
                        );
                        return StepOutcome::DuplicateCompletion { pass_id };
                    }
                    PassStatus::Unknown => {
                        let epoch = self.correlator.current_epoch();
                        (epoch, self.collector.collect(pass_id))
                    }
                };
                let commit = self.session.commit_pass(epoch, signals);
                self.touch(true);
                StepOutcome::Committed { commit }
            }
        }
    }

    pub fn handle_rebuild(&mut self, event: RebuildEvent) -> StepOutcome {
        match event {
            RebuildEvent::FileChanged { path } => {
                let epoch = self.correlator.on_file_change(RebuildReason::FileChanged { path });
                let retired = self.correlator.retire_stale_passes();
                for pass in &retired {
                    self.collector.discard(*pass);
                }
                self.session.on_rebuild(epoch);
                self.touch(false);
                StepOutcome::Rebuild {
                    epoch,
                    retired: retired.len(),
                }
            }
            RebuildEvent::BuildFailed { message } => {
                let epoch = self.correlator.current_epoch();
                self.correlator.on_build_failed(epoch, &message);
                StepOutcome::BuildFailed
            }
        }
    }

    fn touch(&self, completed: bool) {
        let in_flight = self.correlator.in_flight();
        self.activity_tx.send_modify(|activity| {
            activity.in_flight = in_flight;
            activity.last_activity = Some(Instant::now());
            if completed {
                activity.passes_completed += 1;
            }
        });
    }

    #[must_use]
    pub fn report(&self) -> ConnectionReport {
        ConnectionReport {
            connection_id: self.id,
            session: self.session.stats(),
            correlator: self.correlator.stats(),
            final_snapshot: self.session.snapshot(),
        }
    }

    /// Process events until both channels close. Rebuild events are
    /// drained first so a completed pass never outruns a newer file change.
    pub async fn run(
        self,
        framework_rx: mpsc::Receiver<FrameworkEvent>,
        rebuild_rx: mpsc::Receiver<RebuildEvent>,
    ) -> ConnectionReport {
        let span = crate::redbox_span!("page_connection", connection_id = self.id.0);
        self.event_loop(framework_rx, rebuild_rx)
            .instrument(span)
            .await
    }

    async fn event_loop(
        mut self,
        mut framework_rx: mpsc::Receiver<FrameworkEvent>,
        mut rebuild_rx: mpsc::Receiver<RebuildEvent>,
    ) -> ConnectionReport {
        tracing::debug!("Page connection started");

        loop {
            tokio::select! {
                biased;
                Some(event) = rebuild_rx.recv() => {
                    self.handle_rebuild(event);
                }
                Some(event) = framework_rx.recv() => {
                    self.handle_framework(event);
                }
                else => break,
            }
        }

        let report = self.report();
        tracing::debug!(
            shown = report.session.shown,
            cleared = report.session.cleared,
            stale = report.session.stale_discarded,
            "Page connection closed"
        );
        report
    }
}

/// Caller side of a spawned connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Framework events for this page.
    pub framework: mpsc::Sender<FrameworkEvent>,
    pub overlay: OverlayHandle,
    pub activity: watch::Receiver<RenderActivity>,
    /// Re-render requests issued after file changes.
    pub render_requests: mpsc::Receiver<RenderRequest>,
}

#[derive(Debug)]
struct ConnectionEntry {
    rebuild_tx: mpsc::Sender<RebuildEvent>,
    overlay: OverlayHandle,
    task: JoinHandle<ConnectionReport>,
}

/// Registry of live page connections for one dev server.
#[derive(Debug)]
pub struct DevServer {
    composer: DiagnosticComposer,
    max_signals_per_pass: usize,
    channel_capacity: usize,
    bus: EventBus,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    next_id: u64,
}

impl DevServer {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let classifier = CauseClassifier::from_config(&config.classifier)?;
        Ok(Self {
            composer: DiagnosticComposer::new(Arc::new(classifier)),
            max_signals_per_pass: config.overlay.max_signals_per_pass,
            channel_capacity: config.runtime.channel_capacity,
            bus: EventBus::new(config.runtime.channel_capacity),
            connections: HashMap::new(),
            next_id: 1,
        })
    }

    /// Overlay transitions of every connection.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OverlayEvent> {
        self.bus.subscribe()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn overlay(&self, id: ConnectionId) -> Option<OverlayHandle> {
        self.connections.get(&id).map(|entry| entry.overlay.clone())
    }

    /// Register a page and spawn its event loop. Requires a tokio runtime.
    pub fn connect(&mut self) -> ConnectionHandle {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let (framework_tx, framework_rx) = mpsc::channel(self.channel_capacity);
        let (rebuild_tx, rebuild_rx) = mpsc::channel(self.channel_capacity);
        let (render_tx, render_rx) = mpsc::channel(self.channel_capacity);

        let connection = PageConnection::new(id, self.composer.clone(), self.max_signals_per_pass)
            .with_events(self.bus.clone())
            .with_render_requests(render_tx);
        let overlay = connection.overlay();
        let activity = connection.activity();
        let task = tokio::spawn(connection.run(framework_rx, rebuild_rx));

        self.connections.insert(
            id,
            ConnectionEntry {
                rebuild_tx,
                overlay: overlay.clone(),
                task,
            },
        );
        tracing::info!(connection_id = %id, "Page connected");

        ConnectionHandle {
            id,
            framework: framework_tx,
            overlay,
            activity,
            render_requests: render_rx,
        }
    }

    /// Fan a file change out to every connection; returns how many got it.
    pub async fn file_changed(&self, path: impl Into<PathBuf>) -> usize {
        let path = path.into();
        self.broadcast(RebuildEvent::FileChanged { path }).await
    }

    pub async fn build_failed(&self, message: impl Into<String>) -> usize {
        let message = message.into();
        self.broadcast(RebuildEvent::BuildFailed { message }).await
    }

    async fn broadcast(&self, event: RebuildEvent) -> usize {
        let mut delivered = 0;
        for (id, entry) in &self.connections {
            if entry.rebuild_tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(connection_id = %id, "Connection gone; rebuild event dropped");
            }
        }
        delivered
    }

    /// Stop routing rebuilds to `id` and wait for its loop to finish. The
    /// loop ends once the caller also drops its framework sender.
    pub async fn disconnect(&mut self, id: ConnectionId) -> Result<Option<ConnectionReport>> {
        let Some(entry) = self.connections.remove(&id) else {
            return Ok(None);
        };
        drop(entry.rebuild_tx);
        let report = entry
            .task
            .await
            .map_err(|e| crate::Error::Runtime(format!("connection {id} task failed: {e}")))?;
        tracing::info!(connection_id = %id, "Page disconnected");
        Ok(Some(report))
    }

    /// Disconnect every page.
    pub async fn shutdown(mut self) -> Result<Vec<ConnectionReport>> {
        let mut ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        ids.sort();
        let mut reports = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(report) = self.disconnect(id).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }
}
