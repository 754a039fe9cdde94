//! Typed event bus between the polling controller and the view layer.
//!
//! The controller publishes [`PanelEvent`]s on an [`EventBus`]; any number of
//! views subscribe and receive every event published after they subscribed.
//! The bus is a thin wrapper around `tokio::sync::broadcast`, so a slow
//! subscriber lags (and is told so by its receiver) instead of blocking the
//! controller.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = EventBus::default();
//! let mut rx = bus.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         if let PanelEvent::NewData(reading) = event {
//!             println!("{reading}");
//!         }
//!     }
//! });
//! ```

use crate::reading::{DeviceDescriptor, PowerReading};
use tokio::sync::broadcast;

/// Connection state of the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No console connected
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Console connected
    Connected,
}

/// Acquisition state of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingState {
    /// Continuous reading active
    Reading,
    /// Reading paused, accumulated data kept
    Paused,
    /// Reading stopped, accumulated data discarded
    Stopped,
}

/// Every notification the controller emits.
#[derive(Debug, Clone, PartialEq)]
pub enum PanelEvent {
    /// A discovery scan finished
    DevicesListed(Vec<DeviceDescriptor>),
    /// Connection state transition
    ConnectionChanged(ConnectionState),
    /// Reading state transition
    ReadingChanged(ReadingState),
    /// A new power reading was acquired
    NewData(PowerReading),
    /// A poll cycle failed; polling continues
    ReadFailed(String),
    /// Number of accumulated readings after a poll cycle
    HistoryUpdated(usize),
    /// Refresh interval in seconds (also re-sent on rejected input)
    RefreshTimeChanged(f64),
    /// Wavelength in nm (also re-sent on rejected input)
    WavelengthChanged(i64),
    /// Wavelength limits reported by the console
    WavelengthBounds {
        /// Minimum wavelength in nm
        min: i64,
        /// Maximum wavelength in nm
        max: i64,
    },
    /// Power range in W
    PowerRangeChanged(f64),
    /// Auto-range flag
    AutoPowerRangeChanged(bool),
}

/// Coarse category of a [`PanelEvent`], for subscribers that filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    /// Device list updates
    Devices,
    /// Connection state
    Connection,
    /// Reading state
    Reading,
    /// Acquired data and acquisition failures
    Data,
    /// Settings and device configuration
    Settings,
}

impl PanelEvent {
    /// Category of this event.
    pub fn category(&self) -> EventCategory {
        match self {
            PanelEvent::DevicesListed(_) => EventCategory::Devices,
            PanelEvent::ConnectionChanged(_) => EventCategory::Connection,
            PanelEvent::ReadingChanged(_) => EventCategory::Reading,
            PanelEvent::NewData(_) | PanelEvent::ReadFailed(_) | PanelEvent::HistoryUpdated(_) => {
                EventCategory::Data
            }
            PanelEvent::RefreshTimeChanged(_)
            | PanelEvent::WavelengthChanged(_)
            | PanelEvent::WavelengthBounds { .. }
            | PanelEvent::PowerRangeChanged(_)
            | PanelEvent::AutoPowerRangeChanged(_) => EventCategory::Settings,
        }
    }
}

/// Multi-subscriber publisher of [`PanelEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PanelEvent>,
}

impl EventBus {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a bus holding at most `capacity` unread events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PanelEvent> {
        self.sender.subscribe()
    }

    /// Publish to all current subscribers. Having none is not an error.
    pub fn publish(&self, event: PanelEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            tracing::trace!(category = ?event.category(), "No subscribers for panel event");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(PanelEvent::WavelengthChanged(633));

        assert_eq!(first.recv().await.ok(), Some(PanelEvent::WavelengthChanged(633)));
        assert_eq!(second.recv().await.ok(), Some(PanelEvent::WavelengthChanged(633)));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(PanelEvent::ReadingChanged(ReadingState::Stopped));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            PanelEvent::NewData(PowerReading::new(1e-3, "W")).category(),
            EventCategory::Data
        );
        assert_eq!(
            PanelEvent::WavelengthBounds { min: 400, max: 1100 }.category(),
            EventCategory::Settings
        );
        assert_eq!(
            PanelEvent::ConnectionChanged(ConnectionState::Connected).category(),
            EventCategory::Connection
        );
    }
}
