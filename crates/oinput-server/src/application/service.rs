//! The Service lifecycle contract.
//!
//! A service is one input source: a tracker, a touch surface, a gamepad, a
//! heartbeat generator.  The [`ServiceManager`](super::service_manager::ServiceManager)
//! owns every service and drives it through this lifecycle:
//!
//! ```text
//! Created ──setup──► Created ──initialize──► Initialized ──start──► Started
//!                                   │                                  │
//!                                   └─(error)─► Disabled          poll (every tick)
//!                                                                      │
//!                                              Disposed ◄──dispose── Stopped ◄──stop
//! ```
//!
//! Services write events through the [`ServiceContext`] they receive at
//! initialization.  The context holds a clone of the manager's
//! [`EventQueue`], so a service that runs its own thread (a vendor SDK
//! callback thread, for instance) moves the context into that thread and
//! locks the queue there.  Nothing in the context is process-global.

use std::collections::HashMap;
use std::sync::Arc;

use oinput_core::{Event, EventQueue, EventType, ServiceType};
use thiserror::Error;

/// Free-form settings from a service's `[[services]]` config table.
pub type ServiceSettings = toml::Table;

/// Error type for service lifecycle operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A setting is present but has the wrong type or an unusable value.
    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    /// The service could not acquire its device or resources.
    #[error("initialization failed: {0}")]
    InitFailed(String),

    /// No factory is registered for the requested class.
    #[error("unknown service class: {0}")]
    UnknownClass(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordering tier within one poll tick.
///
/// Every `First` service is polled before every `Normal` one, and every
/// `Normal` one before every `Last`.  A `Last` service therefore sees all
/// events the other tiers wrote during the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PollPriority {
    First,
    Normal,
    Last,
}

impl PollPriority {
    pub const TIERS: [PollPriority; 3] = [PollPriority::First, PollPriority::Normal, PollPriority::Last];
}

/// Lifecycle state tracked by the manager for each service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Initialized,
    Started,
    Stopped,
    Disposed,
    /// Initialization or start failed.  The service is never polled again.
    Disabled,
}

/// Everything a service needs to produce events.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    id: u16,
    name: String,
    queue: EventQueue,
    directory: Arc<HashMap<String, u16>>,
}

impl ServiceContext {
    pub(crate) fn new(
        id: u16,
        name: String,
        queue: EventQueue,
        directory: Arc<HashMap<String, u16>>,
    ) -> Self {
        Self {
            id,
            name,
            queue,
            directory,
        }
    }

    /// Sequential id assigned by the manager.  Goes into the low half of
    /// every event's device tag.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared event buffer.  Lock it around each batch of writes.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Id of another service managed alongside this one, by instance name.
    pub fn lookup_service(&self, name: &str) -> Option<u16> {
        self.directory.get(name).copied()
    }

    /// Locks the buffer, claims one slot and lets `fill` write it.
    ///
    /// The slot is reset first and tagged with this service's id.
    pub fn emit<F>(&self, fill: F)
    where
        F: FnOnce(&mut Event),
    {
        let mut buf = self.queue.lock();
        let evt = buf.write_head();
        evt.reset(EventType::Null, ServiceType::Generic, 0, self.id, 0);
        fill(evt);
    }
}

/// One input source.
///
/// Only [`initialize`](Service::initialize) is required; every other hook
/// defaults to a no-op.  `poll` runs on the main tick and must not block.
#[cfg_attr(test, mockall::automock)]
pub trait Service: Send {
    /// Reads the service's config table.  Called once, before initialization.
    fn setup(&mut self, _settings: &ServiceSettings) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Acquires devices and stores the context.
    fn initialize(&mut self, ctx: ServiceContext) -> Result<(), ServiceError>;

    /// Begins producing events (starts threads, opens streams).
    fn start(&mut self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Called once per tick while started.
    fn poll(&mut self) {}

    /// Stops producing events.  Threads owned by the service are joined here.
    fn stop(&mut self) {}

    /// Releases everything.  The service is dropped afterwards.
    fn dispose(&mut self) {}

    /// Tier this service is polled in.  Read once, right after `setup`.
    fn poll_priority(&self) -> PollPriority {
        PollPriority::Normal
    }
}

// ── Setting helpers ───────────────────────────────────────────────────────────

fn invalid(key: &str, reason: impl Into<String>) -> ServiceError {
    ServiceError::InvalidSetting {
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// Reads a float setting.  Integers are accepted.
pub fn setting_f64(settings: &ServiceSettings, key: &str, default: f64) -> Result<f64, ServiceError> {
    match settings.get(key) {
        None => Ok(default),
        Some(toml::Value::Float(v)) => Ok(*v),
        Some(toml::Value::Integer(v)) => Ok(*v as f64),
        Some(other) => Err(invalid(key, format!("expected a number, got {}", other.type_str()))),
    }
}

/// Reads an unsigned 32-bit setting.
pub fn setting_u32(settings: &ServiceSettings, key: &str, default: u32) -> Result<u32, ServiceError> {
    match settings.get(key) {
        None => Ok(default),
        Some(toml::Value::Integer(v)) => {
            u32::try_from(*v).map_err(|_| invalid(key, format!("{v} is out of range")))
        }
        Some(other) => Err(invalid(key, format!("expected an integer, got {}", other.type_str()))),
    }
}

pub fn setting_bool(settings: &ServiceSettings, key: &str, default: bool) -> Result<bool, ServiceError> {
    match settings.get(key) {
        None => Ok(default),
        Some(toml::Value::Boolean(v)) => Ok(*v),
        Some(other) => Err(invalid(key, format!("expected a boolean, got {}", other.type_str()))),
    }
}

pub fn setting_str<'a>(settings: &'a ServiceSettings, key: &str) -> Result<Option<&'a str>, ServiceError> {
    match settings.get(key) {
        None => Ok(None),
        Some(toml::Value::String(v)) => Ok(Some(v.as_str())),
        Some(other) => Err(invalid(key, format!("expected a string, got {}", other.type_str()))),
    }
}
