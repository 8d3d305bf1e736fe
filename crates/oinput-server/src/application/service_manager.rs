//! ServiceManager: owns every service and the shared event buffer.
//!
//! # Tick
//!
//! The main loop calls [`ServiceManager::poll`] once per tick and then drains
//! the buffer with [`ServiceManager::drain_events`].  Polling walks the
//! services tier by tier (see [`PollPriority`]); within one tier services
//! are polled in the order they were added.
//!
//! # Failure policy
//!
//! A service whose `initialize` or `start` returns an error is logged and
//! marked [`ServiceState::Disabled`].  It is never polled, and the rest of the
//! system carries on without it.  The same goes for a `[[services]]` entry
//! naming an unknown class or failing `setup`: the entry is skipped.

use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};

use oinput_core::{Event, EventBuffer, EventQueue};
use tracing::{debug, info, warn};

use super::service::{PollPriority, Service, ServiceContext, ServiceError, ServiceSettings, ServiceState};
use super::services;
use crate::infrastructure::storage::config::ServiceEntry;

/// Creates a fresh, un-setup service instance.
pub type ServiceFactory = fn() -> Box<dyn Service>;

/// Read-only snapshot of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    /// Sequential id.  0 until the service has been initialized.
    pub id: u16,
    pub name: String,
    pub priority: PollPriority,
    pub state: ServiceState,
}

struct ManagedService {
    info: ServiceInfo,
    service: Box<dyn Service>,
}

/// Owner of every service and of the event buffer they write into.
pub struct ServiceManager {
    factories: HashMap<String, ServiceFactory>,
    services: Vec<ManagedService>,
    queue: EventQueue,
    next_id: u16,
}

impl ServiceManager {
    /// Creates a manager with a buffer of `max_events` slots and the built-in
    /// service classes registered.
    pub fn new(max_events: usize) -> Self {
        let mut mgr = Self {
            factories: HashMap::new(),
            services: Vec::new(),
            queue: EventQueue::new(max_events),
            next_id: 1,
        };
        services::register_default_services(&mut mgr);
        mgr
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    /// Makes `class` available to [`setup`](Self::setup).
    pub fn register_service(&mut self, class: &str, factory: ServiceFactory) {
        self.factories.insert(class.to_string(), factory);
    }

    pub fn is_registered(&self, class: &str) -> bool {
        self.factories.contains_key(class)
    }

    /// Creates, configures and adds one service per config entry.
    ///
    /// Entries with an unknown class or a failing `setup` are logged and
    /// skipped.  Returns the number of services added.
    pub fn setup(&mut self, entries: &[ServiceEntry]) -> usize {
        let mut added = 0;
        for entry in entries {
            match self.create_service(entry) {
                Ok(()) => added += 1,
                Err(e) => warn!("skipping service {}: {e}", entry.instance_name()),
            }
        }
        added
    }

    fn create_service(&mut self, entry: &ServiceEntry) -> Result<(), ServiceError> {
        let factory = self
            .factories
            .get(&entry.class)
            .ok_or_else(|| ServiceError::UnknownClass(entry.class.clone()))?;
        self.add_service(entry.instance_name(), factory(), &entry.settings)
    }

    /// Runs `setup` on `service` and takes ownership of it.
    ///
    /// # Errors
    ///
    /// Returns the service's setup error; the service is dropped.
    pub fn add_service(
        &mut self,
        name: &str,
        mut service: Box<dyn Service>,
        settings: &ServiceSettings,
    ) -> Result<(), ServiceError> {
        service.setup(settings)?;
        let priority = service.poll_priority();
        info!("service added: {name} ({priority:?})");
        self.services.push(ManagedService {
            info: ServiceInfo {
                id: 0,
                name: name.to_string(),
                priority,
                state: ServiceState::Created,
            },
            service,
        });
        Ok(())
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Assigns ids to every newly added service and initializes them.
    ///
    /// Ids are assigned to all services before any `initialize` call, so a
    /// service can resolve its peers through
    /// [`ServiceContext::lookup_service`].
    pub fn initialize(&mut self) {
        for managed in self
            .services
            .iter_mut()
            .filter(|m| m.info.state == ServiceState::Created)
        {
            managed.info.id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
        }

        let directory: Arc<HashMap<String, u16>> = Arc::new(
            self.services
                .iter()
                .map(|m| (m.info.name.clone(), m.info.id))
                .collect(),
        );

        for managed in self
            .services
            .iter_mut()
            .filter(|m| m.info.state == ServiceState::Created)
        {
            let ctx = ServiceContext::new(
                managed.info.id,
                managed.info.name.clone(),
                self.queue.clone(),
                Arc::clone(&directory),
            );
            match managed.service.initialize(ctx) {
                Ok(()) => {
                    managed.info.state = ServiceState::Initialized;
                    debug!("service {} initialized with id {}", managed.info.name, managed.info.id);
                }
                Err(e) => {
                    managed.info.state = ServiceState::Disabled;
                    warn!("service {} disabled: {e}", managed.info.name);
                }
            }
        }
    }

    /// Starts every initialized service.
    pub fn start(&mut self) {
        for managed in self
            .services
            .iter_mut()
            .filter(|m| matches!(m.info.state, ServiceState::Initialized | ServiceState::Stopped))
        {
            match managed.service.start() {
                Ok(()) => managed.info.state = ServiceState::Started,
                Err(e) => {
                    managed.info.state = ServiceState::Disabled;
                    warn!("service {} failed to start and is disabled: {e}", managed.info.name);
                }
            }
        }
    }

    /// Polls every started service, `First` tier to `Last` tier.
    pub fn poll(&mut self) {
        for tier in PollPriority::TIERS {
            for managed in self
                .services
                .iter_mut()
                .filter(|m| m.info.priority == tier && m.info.state == ServiceState::Started)
            {
                managed.service.poll();
            }
        }
    }

    /// Stops every started service.
    pub fn stop(&mut self) {
        for managed in self
            .services
            .iter_mut()
            .filter(|m| m.info.state == ServiceState::Started)
        {
            managed.service.stop();
            managed.info.state = ServiceState::Stopped;
        }
    }

    /// Disposes and drops every service, stopping any still running.
    pub fn dispose(&mut self) {
        self.stop();
        for mut managed in self.services.drain(..) {
            if managed.info.state != ServiceState::Disabled {
                managed.service.dispose();
            }
            debug!("service {} disposed", managed.info.name);
        }
    }

    // ── Lookup ────────────────────────────────────────────────────────────────

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.services.iter().map(|m| m.info.clone()).collect()
    }

    /// Finds a service by instance name.
    pub fn find_service(&self, name: &str) -> Option<&ServiceInfo> {
        self.services
            .iter()
            .map(|m| &m.info)
            .find(|info| info.name == name)
    }

    /// Finds a service by id.
    pub fn get_service(&self, id: u16) -> Option<&ServiceInfo> {
        self.services
            .iter()
            .map(|m| &m.info)
            .find(|info| info.id == id && info.state != ServiceState::Created)
    }

    /// Mutable access to a service by instance name.
    pub fn service_mut(&mut self, name: &str) -> Option<&mut (dyn Service + 'static)> {
        self.services
            .iter_mut()
            .find(|m| m.info.name == name)
            .map(|m| m.service.as_mut())
    }

    // ── Events ────────────────────────────────────────────────────────────────

    /// Handle producers clone to write into the buffer.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Locks the buffer for a batch of reads or writes.
    pub fn lock_events(&self) -> MutexGuard<'_, EventBuffer> {
        self.queue.lock()
    }

    /// Takes up to `max_count` events, oldest first, and empties the buffer.
    ///
    /// See [`EventBuffer::drain_into`]: events beyond `max_count` are lost.
    pub fn drain_events(&self, max_count: usize) -> Vec<Event> {
        self.queue.lock().drain(max_count)
    }

    /// As [`drain_events`](Self::drain_events), appending into `out`.
    pub fn drain_events_into(&self, max_count: usize, out: &mut Vec<Event>) -> usize {
        self.queue.lock().drain_into(max_count, out)
    }

    pub fn available_events(&self) -> usize {
        self.queue.available_count()
    }

    pub fn dropped_events(&self) -> u64 {
        self.queue.dropped_count()
    }

    pub fn reset_dropped_events(&self) {
        self.queue.lock().reset_dropped();
    }

    pub fn max_events(&self) -> usize {
        self.queue.lock().capacity()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::service::MockService;
    use mockall::Sequence;
    use oinput_core::{EventType, ServiceType};

    /// PollFirst service writing one mocap update at (1, 2, 3).
    struct MocapSource {
        ctx: Option<ServiceContext>,
    }

    impl Service for MocapSource {
        fn initialize(&mut self, ctx: ServiceContext) -> Result<(), ServiceError> {
            self.ctx = Some(ctx);
            Ok(())
        }

        fn poll(&mut self) {
            if let Some(ctx) = &self.ctx {
                ctx.emit(|evt| {
                    evt.event_type = EventType::Update;
                    evt.service_type = ServiceType::Mocap;
                    evt.set_position(1.0, 2.0, 3.0);
                });
            }
        }

        fn poll_priority(&self) -> PollPriority {
            PollPriority::First
        }
    }

    /// PollLast service copying the position of the most recent event into a
    /// new controller update.
    struct PositionFollower {
        ctx: Option<ServiceContext>,
    }

    impl Service for PositionFollower {
        fn initialize(&mut self, ctx: ServiceContext) -> Result<(), ServiceError> {
            self.ctx = Some(ctx);
            Ok(())
        }

        fn poll(&mut self) {
            let Some(ctx) = &self.ctx else { return };
            let mut buf = ctx.queue().lock();
            let Some(pos) = buf.latest().map(|e| e.position) else {
                return;
            };
            let evt = buf.write_head();
            evt.reset(EventType::Update, ServiceType::Controller, 0, ctx.id(), 0);
            evt.position = pos;
        }

        fn poll_priority(&self) -> PollPriority {
            PollPriority::Last
        }
    }

    fn empty() -> ServiceSettings {
        ServiceSettings::new()
    }

    fn bare_manager() -> ServiceManager {
        ServiceManager {
            factories: HashMap::new(),
            services: Vec::new(),
            queue: EventQueue::new(16),
            next_id: 1,
        }
    }

    fn mock_ok(priority: PollPriority) -> MockService {
        let mut mock = MockService::new();
        mock.expect_setup().returning(|_| Ok(()));
        mock.expect_poll_priority().return_const(priority);
        mock.expect_initialize().returning(|_| Ok(()));
        mock.expect_start().returning(|| Ok(()));
        mock.expect_stop().return_const(());
        mock.expect_dispose().return_const(());
        mock
    }

    #[test]
    fn test_poll_runs_first_tier_before_last_tier() {
        // Arrange: add the Last service first to prove ordering is by tier.
        let mut mgr = bare_manager();
        mgr.add_service("follower", Box::new(PositionFollower { ctx: None }), &empty())
            .unwrap();
        mgr.add_service("mocap", Box::new(MocapSource { ctx: None }), &empty())
            .unwrap();
        mgr.initialize();
        mgr.start();

        // Act
        mgr.poll();
        let events = mgr.drain_events(usize::MAX);

        // Assert
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].service_type, ServiceType::Mocap);
        assert_eq!(events[0].event_type, EventType::Update);
        assert_eq!(events[0].position, [1.0, 2.0, 3.0]);
        assert_eq!(events[1].service_type, ServiceType::Controller);
        assert_eq!(events[1].event_type, EventType::Update);
        assert_eq!(events[1].position, [1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_initialize_assigns_sequential_ids() {
        let mut mgr = bare_manager();
        mgr.add_service("a", Box::new(mock_ok(PollPriority::Normal)), &empty())
            .unwrap();
        mgr.add_service("b", Box::new(mock_ok(PollPriority::Normal)), &empty())
            .unwrap();

        mgr.initialize();

        assert_eq!(mgr.find_service("a").map(|s| s.id), Some(1));
        assert_eq!(mgr.find_service("b").map(|s| s.id), Some(2));
        assert_eq!(mgr.get_service(2).map(|s| s.name.as_str()), Some("b"));
    }

    #[test]
    fn test_lifecycle_calls_hooks_in_order() {
        let mut seq = Sequence::new();
        let mut mock = MockService::new();
        mock.expect_setup()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_poll_priority()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(PollPriority::Normal);
        mock.expect_initialize()
            .withf(|ctx| ctx.id() == 1 && ctx.name() == "svc")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        mock.expect_start()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        mock.expect_poll().times(2).in_sequence(&mut seq).return_const(());
        mock.expect_stop().times(1).in_sequence(&mut seq).return_const(());
        mock.expect_dispose()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut mgr = bare_manager();
        mgr.add_service("svc", Box::new(mock), &empty()).unwrap();
        mgr.initialize();
        mgr.start();
        mgr.poll();
        mgr.poll();
        mgr.stop();
        mgr.dispose();

        assert_eq!(mgr.service_count(), 0);
    }

    #[test]
    fn test_failed_initialize_disables_only_that_service() {
        let mut broken = MockService::new();
        broken.expect_setup().returning(|_| Ok(()));
        broken
            .expect_poll_priority()
            .return_const(PollPriority::Normal);
        broken
            .expect_initialize()
            .returning(|_| Err(ServiceError::InitFailed("no device".into())));
        broken.expect_start().never();
        broken.expect_poll().never();
        broken.expect_dispose().never();

        let mut healthy = mock_ok(PollPriority::Normal);
        healthy.expect_poll().times(1).return_const(());

        let mut mgr = bare_manager();
        mgr.add_service("broken", Box::new(broken), &empty()).unwrap();
        mgr.add_service("healthy", Box::new(healthy), &empty())
            .unwrap();
        mgr.initialize();
        mgr.start();
        mgr.poll();

        assert_eq!(
            mgr.find_service("broken").map(|s| s.state),
            Some(ServiceState::Disabled)
        );
        assert_eq!(
            mgr.find_service("healthy").map(|s| s.state),
            Some(ServiceState::Started)
        );
        mgr.dispose();
    }

    #[test]
    fn test_failed_start_disables_service() {
        let mut mock = MockService::new();
        mock.expect_setup().returning(|_| Ok(()));
        mock.expect_poll_priority().return_const(PollPriority::First);
        mock.expect_initialize().returning(|_| Ok(()));
        mock.expect_start()
            .returning(|| Err(ServiceError::InitFailed("stream closed".into())));
        mock.expect_poll().never();

        let mut mgr = bare_manager();
        mgr.add_service("svc", Box::new(mock), &empty()).unwrap();
        mgr.initialize();
        mgr.start();
        mgr.poll();

        assert_eq!(
            mgr.find_service("svc").map(|s| s.state),
            Some(ServiceState::Disabled)
        );
    }

    #[test]
    fn test_setup_error_rejects_service() {
        let mut mock = MockService::new();
        mock.expect_setup().returning(|_| {
            Err(ServiceError::InvalidSetting {
                key: "rate".into(),
                reason: "negative".into(),
            })
        });

        let mut mgr = bare_manager();
        let result = mgr.add_service("svc", Box::new(mock), &empty());

        assert!(result.is_err());
        assert_eq!(mgr.service_count(), 0);
    }

    #[test]
    fn test_setup_from_config_skips_unknown_class() {
        let mut mgr = ServiceManager::new(16);
        let entries: Vec<ServiceEntry> = toml::from_str::<crate::infrastructure::storage::config::AppConfig>(
            r#"
[[services]]
class = "HeartbeatService"

[[services]]
class = "NoSuchService"
"#,
        )
        .unwrap()
        .services;

        let added = mgr.setup(&entries);

        assert_eq!(added, 1);
        assert!(mgr.find_service("HeartbeatService").is_some());
        assert!(mgr.is_registered("WandService"));
    }

    #[test]
    fn test_drain_reports_available_and_dropped() {
        let mgr = ServiceManager::new(2);
        {
            let mut buf = mgr.lock_events();
            for i in 0..3 {
                buf.write_head()
                    .reset(EventType::Move, ServiceType::Pointer, i, 1, 0);
            }
        }

        assert_eq!(mgr.available_events(), 2);
        assert_eq!(mgr.dropped_events(), 1);

        let events = mgr.drain_events(1);
        assert_eq!(events[0].source_id, 1);
        assert_eq!(mgr.available_events(), 0);

        mgr.reset_dropped_events();
        assert_eq!(mgr.dropped_events(), 0);
        assert_eq!(mgr.max_events(), 2);
    }

    #[test]
    fn test_context_lookup_resolves_peer_added_later() {
        let mut first = MockService::new();
        first.expect_setup().returning(|_| Ok(()));
        first.expect_poll_priority().return_const(PollPriority::Last);
        first
            .expect_initialize()
            .withf(|ctx| ctx.lookup_service("second") == Some(2))
            .times(1)
            .returning(|_| Ok(()));

        let mut mgr = bare_manager();
        mgr.add_service("first", Box::new(first), &empty()).unwrap();
        mgr.add_service("second", Box::new(mock_ok(PollPriority::Normal)), &empty())
            .unwrap();
        mgr.initialize();
    }
}
