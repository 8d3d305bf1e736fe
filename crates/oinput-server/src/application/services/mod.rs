//! Built-in services.
//!
//! - **`heartbeat`** – emits a generic update at a fixed rate, optionally
//!   from its own thread.  Useful as a liveness signal for clients.
//! - **`wand`** – merges a tracked rigid body with a controller's buttons
//!   into six-degree-of-freedom wand events.

pub mod heartbeat;
pub mod wand;

use super::service::Service;
use super::service_manager::ServiceManager;

pub use heartbeat::HeartbeatService;
pub use wand::WandService;

/// Registers every built-in service class on `manager`.
pub fn register_default_services(manager: &mut ServiceManager) {
    manager.register_service("HeartbeatService", || -> Box<dyn Service> {
        Box::new(HeartbeatService::default())
    });
    manager.register_service("WandService", || -> Box<dyn Service> {
        Box::new(WandService::default())
    });
}
