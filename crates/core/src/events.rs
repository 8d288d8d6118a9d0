use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::position::Position;

/// Lifecycle events published for dashboards and monitors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "position", rename_all = "snake_case")]
pub enum PositionEvent {
    PositionOpened(Position),
    PositionUpdated(Position),
    PositionClosed(Position),
}

impl PositionEvent {
    #[must_use]
    pub const fn position(&self) -> &Position {
        match self {
            Self::PositionOpened(p) | Self::PositionUpdated(p) | Self::PositionClosed(p) => p,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PositionOpened(_) => "position_opened",
            Self::PositionUpdated(_) => "position_updated",
            Self::PositionClosed(_) => "position_closed",
        }
    }
}

/// Fan-out of position events; publishing never blocks or fails.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PositionEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PositionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: PositionEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
