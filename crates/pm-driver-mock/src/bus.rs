//! Mock resource manager and sessions.

use crate::console::SimulatedConsole;
use async_trait::async_trait;
use parking_lot::Mutex;
use pm_core::{BusError, InstrumentSession, ResourceManager};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum ResourceKind {
    Console(SimulatedConsole),
    /// Some other instrument answering `*IDN?` with this string
    Foreign(String),
    /// Listed by the bus but refuses to open
    Unreachable,
}

#[derive(Debug)]
struct MockResource {
    address: String,
    kind: ResourceKind,
    failing_commands: HashSet<String>,
    fail_all: bool,
    /// Time every query spends on the bus
    query_delay: Duration,
}

#[derive(Debug, Default)]
struct MockBus {
    resources: Vec<MockResource>,
    listing_failure: Option<String>,
    /// Every successful open, in order
    opened: Vec<String>,
    open_sessions: HashMap<String, usize>,
    commands: HashMap<String, Vec<String>>,
}

impl MockBus {
    fn resource_mut(&mut self, address: &str) -> Option<&mut MockResource> {
        self.resources.iter_mut().find(|r| r.address == address)
    }
}

/// Resource manager over simulated resources.
///
/// Cloning shares the underlying bus, so a test can keep a handle to inspect
/// and script it after giving a clone to the driver.
#[derive(Debug, Clone, Default)]
pub struct MockResourceManager {
    bus: Arc<Mutex<MockBus>>,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(self, address: &str, kind: ResourceKind) -> Self {
        {
            let mut bus = self.bus.lock();
            bus.resources.retain(|r| r.address != address);
            bus.resources.push(MockResource {
                address: address.to_string(),
                kind,
                failing_commands: HashSet::new(),
                fail_all: false,
                query_delay: Duration::ZERO,
            });
        }
        self
    }

    /// Attach a simulated PM100x console at `address`.
    pub fn with_console(self, address: &str, console: SimulatedConsole) -> Self {
        self.add(address, ResourceKind::Console(console))
    }

    /// Attach a non-PM100x instrument.
    pub fn with_foreign_device(self, address: &str, identity: &str) -> Self {
        self.add(address, ResourceKind::Foreign(identity.to_string()))
    }

    /// List `address` but fail every attempt to open it.
    pub fn with_unreachable(self, address: &str) -> Self {
        self.add(address, ResourceKind::Unreachable)
    }

    /// Make `list_resources` fail with `message` (or succeed again with `None`).
    pub fn fail_listing(&self, message: Option<&str>) {
        self.bus.lock().listing_failure = message.map(str::to_string);
    }

    /// Make every query or write of exactly `command` on `address` fail.
    pub fn fail_command(&self, address: &str, command: &str) {
        if let Some(resource) = self.bus.lock().resource_mut(address) {
            resource.failing_commands.insert(command.to_string());
        }
    }

    /// Make every query and write on `address` fail.
    pub fn fail_all(&self, address: &str, enabled: bool) {
        if let Some(resource) = self.bus.lock().resource_mut(address) {
            resource.fail_all = enabled;
        }
    }

    /// Make every query on `address` take `delay` before it answers.
    pub fn set_query_delay(&self, address: &str, delay: Duration) {
        if let Some(resource) = self.bus.lock().resource_mut(address) {
            resource.query_delay = delay;
        }
    }

    /// Undo [`MockResourceManager::fail_command`] and [`MockResourceManager::fail_all`].
    pub fn clear_failures(&self, address: &str) {
        if let Some(resource) = self.bus.lock().resource_mut(address) {
            resource.failing_commands.clear();
            resource.fail_all = false;
        }
    }

    /// Snapshot of the console at `address`.
    pub fn console(&self, address: &str) -> Option<SimulatedConsole> {
        let bus = self.bus.lock();
        bus.resources
            .iter()
            .find(|r| r.address == address)
            .and_then(|r| match &r.kind {
                ResourceKind::Console(console) => Some(console.clone()),
                _ => None,
            })
    }

    /// Mutate the console at `address` in place.
    pub fn update_console<F>(&self, address: &str, f: F) -> bool
    where
        F: FnOnce(&mut SimulatedConsole),
    {
        let mut bus = self.bus.lock();
        match bus.resource_mut(address).map(|r| &mut r.kind) {
            Some(ResourceKind::Console(console)) => {
                f(console);
                true
            }
            _ => false,
        }
    }

    /// Commands received on `address`, in order.
    pub fn commands(&self, address: &str) -> Vec<String> {
        self.bus
            .lock()
            .commands
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_commands(&self) {
        self.bus.lock().commands.clear();
    }

    /// Addresses successfully opened so far, in order, with repeats.
    pub fn opened_addresses(&self) -> Vec<String> {
        self.bus.lock().opened.clone()
    }

    /// Sessions on `address` opened and not yet closed.
    pub fn open_sessions(&self, address: &str) -> usize {
        self.bus
            .lock()
            .open_sessions
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn list_resources(&self) -> Result<Vec<String>, BusError> {
        let bus = self.bus.lock();
        if let Some(message) = &bus.listing_failure {
            return Err(BusError::ResourceManager(message.clone()));
        }
        Ok(bus.resources.iter().map(|r| r.address.clone()).collect())
    }

    async fn open_resource(&self, address: &str) -> Result<Box<dyn InstrumentSession>, BusError> {
        let mut bus = self.bus.lock();
        let resource = bus
            .resources
            .iter()
            .find(|r| r.address == address)
            .ok_or_else(|| BusError::Open {
                address: address.to_string(),
                message: "VI_ERROR_RSRC_NFOUND".to_string(),
            })?;
        if matches!(resource.kind, ResourceKind::Unreachable) {
            return Err(BusError::Open {
                address: address.to_string(),
                message: "VI_ERROR_RSRC_BUSY".to_string(),
            });
        }

        bus.opened.push(address.to_string());
        *bus.open_sessions.entry(address.to_string()).or_insert(0) += 1;
        tracing::trace!(address = %address, "Mock session opened");

        Ok(Box::new(MockSession {
            address: address.to_string(),
            bus: Arc::clone(&self.bus),
            closed: false,
        }))
    }
}

/// Session on a [`MockResourceManager`] resource.
#[derive(Debug)]
pub struct MockSession {
    address: String,
    bus: Arc<Mutex<MockBus>>,
    closed: bool,
}

impl MockSession {
    /// Log `command` and check the injected failures.
    fn check(&self, bus: &mut MockBus, command: &str) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed(self.address.clone()));
        }
        bus.commands
            .entry(self.address.clone())
            .or_default()
            .push(command.to_string());

        let resource = bus.resource_mut(&self.address).ok_or_else(|| BusError::Io {
            address: self.address.clone(),
            message: "resource removed".to_string(),
        })?;
        if let ResourceKind::Console(console) = &mut resource.kind {
            console.set_remote(true);
        }
        if resource.fail_all || resource.failing_commands.contains(command) {
            return Err(BusError::Io {
                address: self.address.clone(),
                message: format!("injected failure on '{command}'"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl InstrumentSession for MockSession {
    fn address(&self) -> &str {
        &self.address
    }

    async fn query(&mut self, command: &str) -> Result<String, BusError> {
        let (answer, delay) = {
            let mut bus = self.bus.lock();
            self.check(&mut bus, command)?;
            let address = self.address.clone();
            let resource = bus.resource_mut(&address).ok_or_else(|| BusError::Closed(address.clone()))?;
            let answer = match &mut resource.kind {
                ResourceKind::Console(console) => console.answer(&address, command),
                ResourceKind::Foreign(identity) if command == "*IDN?" => Ok(identity.clone()),
                _ => Err(BusError::Timeout {
                    address,
                    command: command.to_string(),
                }),
            };
            (answer, resource.query_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        answer
    }

    async fn write(&mut self, command: &str) -> Result<(), BusError> {
        let delay = {
            let mut bus = self.bus.lock();
            self.check(&mut bus, command)?;
            let address = self.address.clone();
            let resource = bus.resource_mut(&address).ok_or_else(|| BusError::Closed(address.clone()))?;
            match &mut resource.kind {
                ResourceKind::Console(console) => {
                    console.apply(&address, command)?;
                    if command == "sense:correction:collect:zero" {
                        console.zero_duration()
                    } else {
                        Duration::ZERO
                    }
                }
                _ => {
                    return Err(BusError::Io {
                        address,
                        message: format!("Undefined header: '{command}'"),
                    })
                }
            }
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        if self.closed {
            return Err(BusError::Closed(self.address.clone()));
        }
        self.closed = true;
        let mut bus = self.bus.lock();
        if let Some(count) = bus.open_sessions.get_mut(&self.address) {
            *count = count.saturating_sub(1);
        }
        if let Some(ResourceKind::Console(console)) = bus.resource_mut(&self.address).map(|r| &mut r.kind) {
            console.set_remote(false);
        }
        tracing::trace!(address = %self.address, "Mock session closed");
        Ok(())
    }
}
