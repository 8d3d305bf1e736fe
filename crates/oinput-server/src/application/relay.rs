//! Relay: one tick of the main loop.
//!
//! A tick polls every service, services the network (new connections,
//! handshakes, stream-in packets, departures), then drains the event buffer
//! and hands each event to the input server for fan-out.  Stream-in events
//! injected during the tick go out in the same drain.

use std::time::Instant;

use oinput_core::Event;
use tracing::info;

use super::service_manager::ServiceManager;
use crate::infrastructure::network::InputServer;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub registered: usize,
    pub injected: usize,
    pub relayed: usize,
    pub evicted: usize,
}

/// Drives a [`ServiceManager`] and an [`InputServer`] together.
pub struct Relay {
    manager: ServiceManager,
    server: InputServer,
    batch: Vec<Event>,
    show_stream_speed: bool,
}

impl Relay {
    /// `manager` should already be initialized and started.
    pub fn new(manager: ServiceManager, server: InputServer, show_stream_speed: bool) -> Self {
        let batch = Vec::with_capacity(manager.max_events());
        Self {
            manager,
            server,
            batch,
            show_stream_speed,
        }
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        self.manager.poll();

        self.server.accept_pending();
        report.registered = self.server.advance_handshakes(now);
        report.injected = self.server.poll_stream_in(self.manager.queue());
        self.server.check_clients(now);

        self.batch.clear();
        let max = self.manager.max_events();
        self.manager.drain_events_into(max, &mut self.batch);
        for event in &self.batch {
            self.server.handle_event(event);
        }
        report.relayed = self.batch.len();

        report.evicted = self.server.reap_disconnected();

        if let Some(stats) = self.server.update_stats(now, self.manager.dropped_events()) {
            if self.show_stream_speed {
                info!(
                    "outgoing events/sec: {:.1} (total {}, dropped {}, clients {})",
                    stats.events_per_sec,
                    stats.events_handled,
                    stats.events_dropped,
                    self.server.client_count()
                );
            }
        }

        report
    }

    pub fn manager(&self) -> &ServiceManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ServiceManager {
        &mut self.manager
    }

    pub fn server(&self) -> &InputServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut InputServer {
        &mut self.server
    }

    /// Stops services, closes every client, then disposes services.
    ///
    /// Returns the number of events lost to buffer overflow over the run.
    pub fn shutdown(mut self) -> u64 {
        self.manager.stop();
        self.server.shutdown();
        self.manager.dispose();
        let dropped = self.manager.dropped_events();
        info!("relay stopped, {dropped} events dropped");
        dropped
    }
}
