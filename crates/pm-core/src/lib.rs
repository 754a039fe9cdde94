//! Core types and traits for the PM100x panel.
//!
//! This crate holds everything the device adapter and the polling controller
//! share without depending on each other:
//!
//! - [`bus`]: the instrument-bus abstraction ([`ResourceManager`] and
//!   [`InstrumentSession`]). The concrete VISA backend and the simulated
//!   console both implement these traits.
//! - [`error`]: the error taxonomy ([`PmError`], [`BusError`]).
//! - [`reading`]: power readings, samples and device descriptors.
//! - [`events`]: the typed event bus the view layer subscribes to.
//!
//! # Data Flow
//!
//! ```text
//! ResourceManager --open--> InstrumentSession <--query/write-- device adapter
//!                                                                  |
//!                                           polling controller <---+
//!                                                   |
//!                                  EventBus --[PanelEvent]--> view layer
//! ```

pub mod bus;
pub mod error;
pub mod events;
pub mod reading;

pub use bus::{InstrumentSession, ResourceManager};
pub use error::{BusError, PmError, PmResult};
pub use events::{ConnectionState, EventBus, EventCategory, PanelEvent, ReadingState};
pub use reading::{DeviceDescriptor, PowerReading, PowerSample};
