//! HeartbeatService: a fixed-rate generic event source.
//!
//! Clients that see no traffic for a while cannot tell an idle tracker from a
//! dead server.  This service emits a `Generic`/`Update` event `rate` times
//! per second so they can.  Each beat carries a running sequence number in
//! its int payload and in `position[0]`, and an orientation that turns a few
//! degrees per beat, so a client can also check for gaps and reordering.
//!
//! Settings:
//!
//! | key         | type  | default | meaning                                   |
//! |-------------|-------|---------|-------------------------------------------|
//! | `rate`      | float | `1.0`   | beats per second                          |
//! | `source_id` | int   | `0`     | source id stamped on every beat           |
//! | `threaded`  | bool  | `false` | beat from a dedicated thread, not `poll`  |
//!
//! In threaded mode the beats are written from a background thread that
//! holds its own clone of the event queue, exactly as a vendor SDK callback
//! thread would.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use oinput_core::{EventType, Quaternion, ServiceType};
use tracing::{debug, warn};

use crate::application::service::{
    setting_bool, setting_f64, setting_u32, Service, ServiceContext, ServiceError, ServiceSettings,
};

/// Rotation applied to the heartbeat orientation per beat, in radians.
const TURN_PER_BEAT: f32 = std::f32::consts::PI / 36.0;

pub struct HeartbeatService {
    period: Duration,
    source_id: u32,
    threaded: bool,
    ctx: Option<ServiceContext>,
    sequence: u32,
    last_beat: Option<Instant>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Default for HeartbeatService {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(1),
            source_id: 0,
            threaded: false,
            ctx: None,
            sequence: 0,
            last_beat: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl HeartbeatService {
    /// Beats emitted so far by the polled mode.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// Writes one beat.
fn beat(ctx: &ServiceContext, source_id: u32, sequence: u32) {
    let angle = sequence as f32 * TURN_PER_BEAT;
    ctx.emit(|evt| {
        evt.event_type = EventType::Update;
        evt.service_type = ServiceType::Generic;
        evt.source_id = source_id;
        evt.set_position(sequence as f32, 0.0, 0.0);
        evt.set_orientation(Quaternion::new((angle / 2.0).cos(), 0.0, (angle / 2.0).sin(), 0.0));
        // A single int always fits.
        let _ = evt.set_extra_data_ints(&[sequence as i32]);
    });
}

impl Service for HeartbeatService {
    fn setup(&mut self, settings: &ServiceSettings) -> Result<(), ServiceError> {
        let rate = setting_f64(settings, "rate", 1.0)?;
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(ServiceError::InvalidSetting {
                key: "rate".into(),
                reason: format!("must be a positive number, got {rate}"),
            });
        }
        self.period = Duration::try_from_secs_f64(1.0 / rate).map_err(|_| {
            ServiceError::InvalidSetting {
                key: "rate".into(),
                reason: format!("{rate} is too small for a beat period"),
            }
        })?;
        self.source_id = setting_u32(settings, "source_id", 0)?;
        self.threaded = setting_bool(settings, "threaded", false)?;
        Ok(())
    }

    fn initialize(&mut self, ctx: ServiceContext) -> Result<(), ServiceError> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn start(&mut self) -> Result<(), ServiceError> {
        if !self.threaded {
            return Ok(());
        }
        let ctx = self
            .ctx
            .clone()
            .ok_or_else(|| ServiceError::InitFailed("started before initialize".into()))?;

        self.running.store(true, Ordering::Relaxed);
        let running = Arc::clone(&self.running);
        let period = self.period;
        let source_id = self.source_id;

        let handle = std::thread::Builder::new()
            .name(format!("heartbeat-{}", ctx.id()))
            .spawn(move || {
                let mut sequence = 0u32;
                while running.load(Ordering::Relaxed) {
                    beat(&ctx, source_id, sequence);
                    sequence = sequence.wrapping_add(1);
                    std::thread::sleep(period);
                }
            })?;
        self.worker = Some(handle);
        debug!("heartbeat thread started ({:?} period)", self.period);
        Ok(())
    }

    fn poll(&mut self) {
        if self.threaded {
            return;
        }
        let Some(ctx) = &self.ctx else { return };

        let now = Instant::now();
        let due = self
            .last_beat
            .map_or(true, |last| now.duration_since(last) >= self.period);
        if due {
            beat(ctx, self.source_id, self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            self.last_beat = Some(now);
        }
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("heartbeat thread panicked");
            }
        }
    }

    fn dispose(&mut self) {
        self.stop();
        self.ctx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oinput_core::EventQueue;
    use std::collections::HashMap;

    fn context(queue: &EventQueue) -> ServiceContext {
        ServiceContext::new(7, "heartbeat".into(), queue.clone(), Arc::new(HashMap::new()))
    }

    fn settings(src: &str) -> ServiceSettings {
        src.parse().expect("valid toml")
    }

    #[test]
    fn test_setup_rejects_non_positive_rate() {
        let mut svc = HeartbeatService::default();
        assert!(svc.setup(&settings("rate = 0")).is_err());
        assert!(svc.setup(&settings("rate = -2.0")).is_err());
    }

    #[test]
    fn test_setup_rejects_rate_with_unrepresentable_period() {
        let mut svc = HeartbeatService::default();
        let result = svc.setup(&settings("rate = 1e-30"));

        assert!(matches!(
            result,
            Err(ServiceError::InvalidSetting { ref key, .. }) if key == "rate"
        ));
    }

    #[test]
    fn test_first_poll_beats_immediately_then_waits_for_period() {
        let queue = EventQueue::new(16);
        let mut svc = HeartbeatService::default();
        svc.setup(&settings("rate = 0.5\nsource_id = 9")).unwrap();
        svc.initialize(context(&queue)).unwrap();
        svc.start().unwrap();

        svc.poll();
        svc.poll();

        assert_eq!(queue.available_count(), 1, "second poll is inside the period");
        let buf = queue.lock();
        let evt = buf.latest().unwrap();
        assert_eq!(evt.service_type, ServiceType::Generic);
        assert_eq!(evt.event_type, EventType::Update);
        assert_eq!(evt.source_id, 9);
        assert_eq!(evt.service_id(), 7);
        assert_eq!(evt.extra_data_int(0), Some(0));
    }

    #[test]
    fn test_sequence_advances_each_beat() {
        let queue = EventQueue::new(16);
        let mut svc = HeartbeatService::default();
        svc.setup(&settings("rate = 1000000.0")).unwrap();
        svc.initialize(context(&queue)).unwrap();

        for _ in 0..3 {
            svc.poll();
            std::thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(svc.sequence(), 3);
        let seqs: Vec<i32> = queue
            .lock()
            .iter()
            .filter_map(|e| e.extra_data_int(0))
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_threaded_mode_writes_from_background_thread() {
        let queue = EventQueue::new(64);
        let mut svc = HeartbeatService::default();
        svc.setup(&settings("rate = 200.0\nthreaded = true")).unwrap();
        svc.initialize(context(&queue)).unwrap();
        svc.start().unwrap();

        std::thread::sleep(Duration::from_millis(100));
        svc.poll(); // no-op in threaded mode
        svc.stop();

        let written = queue.available_count();
        assert!(written > 0, "background thread wrote nothing");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.available_count(), written, "thread kept writing after stop");
    }
}
