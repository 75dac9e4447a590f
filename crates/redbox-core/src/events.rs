//! Collaborator events and the overlay event bus.
//!
//! Inbound events come from the rendering framework ([`FrameworkEvent`]) and
//! from the dev server's rebuild pipeline ([`RebuildEvent`]). Outbound
//! [`OverlayEvent`]s are fanned out to UI subscribers over a bounded
//! broadcast channel.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::classifier::CauseSet;
use crate::rebuild::BuildEpoch;
use crate::signals::{RawHydrationEvent, RenderPassId};

/// Identifier of one live page connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Events emitted by the rendering framework for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FrameworkEvent {
    PassStarted {
        pass_id: RenderPassId,
    },
    /// Raw hydration report raised during a pass.
    Hydration {
        pass_id: RenderPassId,
        event: RawHydrationEvent,
    },
    PassCompleted {
        pass_id: RenderPassId,
    },
}

impl FrameworkEvent {
    #[must_use]
    pub fn pass_id(&self) -> RenderPassId {
        match self {
            Self::PassStarted { pass_id }
            | Self::Hydration { pass_id, .. }
            | Self::PassCompleted { pass_id } => *pass_id,
        }
    }
}

/// Events emitted by the dev server's rebuild pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RebuildEvent {
    FileChanged { path: PathBuf },
    BuildFailed { message: String },
}

/// One line of a recorded collaborator transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollaboratorEvent {
    Framework(FrameworkEvent),
    Rebuild(RebuildEvent),
}

impl CollaboratorEvent {
    /// Decode one JSON Lines transcript entry.
    pub fn from_json_line(line: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

impl From<FrameworkEvent> for CollaboratorEvent {
    fn from(event: FrameworkEvent) -> Self {
        Self::Framework(event)
    }
}

impl From<RebuildEvent> for CollaboratorEvent {
    fn from(event: RebuildEvent) -> Self {
        Self::Rebuild(event)
    }
}

/// Overlay transition kinds announced to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayEventKind {
    Shown { fingerprint: String, causes: CauseSet },
    Replaced { fingerprint: String, causes: CauseSet },
    Cleared,
    RebuildStarted,
    StaleDiscarded { pass_epoch: BuildEpoch },
}

/// Overlay transition notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEvent {
    pub connection_id: ConnectionId,
    pub epoch: BuildEpoch,
    pub commit_seq: u64,
    #[serde(flatten)]
    pub kind: OverlayEventKind,
}

/// Bounded fanout of overlay events.
#[derive(Debug, Clone)]
pub struct EventBus {
    capacity: usize,
    sender: broadcast::Sender<OverlayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    /// Create a new event bus with specified queue capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { capacity, sender }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.sender.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers; returns how many received it.
    pub fn publish(&self, event: OverlayEvent) -> usize {
        // No subscribers is the normal state for a headless connection.
        self.sender.send(event).unwrap_or(0)
    }
}
