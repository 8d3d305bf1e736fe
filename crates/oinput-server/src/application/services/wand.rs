//! WandService: fuses a tracked rigid body and a handheld controller.
//!
//! A wand is a gamepad with a motion-capture marker attached.  The tracker
//! reports its pose as `Mocap` events and the gamepad reports its buttons as
//! `Controller` events, from two unrelated services.  This service runs in
//! the `Last` tier, after both have written their events for the tick, and
//! rewrites each matching controller event in place into a `Wand` event that
//! carries the latest rigid-body pose.  Event type, flags and extra data are
//! kept, so button state and analog axes pass through unchanged.
//!
//! The mocap events themselves are left alone: clients that do not care
//! about wands still see the rigid body.
//!
//! Settings:
//!
//! | key                    | type   | default | meaning                                  |
//! |------------------------|--------|---------|------------------------------------------|
//! | `ray_source_id`        | int    | `0`     | mocap rigid body tracking the wand       |
//! | `controller_service`   | string | –       | instance name of the controller service  |
//! | `controller_source_id` | int    | `0`     | controller index within that service     |
//! | `debug`                | bool   | `false` | log every pose update                    |
//!
//! Without `controller_service`, any `Controller` event with the right
//! source id is taken.

use oinput_core::domain::event::timestamp_ms;
use oinput_core::{Event, Quaternion, ServiceType};
use tracing::{debug, warn};

use crate::application::service::{
    setting_bool, setting_str, setting_u32, PollPriority, Service, ServiceContext, ServiceError,
    ServiceSettings,
};

#[derive(Default)]
pub struct WandService {
    ray_source_id: u32,
    controller_service: Option<String>,
    controller_service_id: Option<u16>,
    controller_source_id: u32,
    debug: bool,
    ctx: Option<ServiceContext>,
    pose: WandPose,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct WandPose {
    position: [f32; 3],
    orientation: Quaternion,
    user_id: u16,
}

impl WandService {
    fn is_controller_event(&self, evt: &Event) -> bool {
        if evt.source_id != self.controller_source_id {
            return false;
        }
        match self.controller_service_id {
            Some(id) => evt.service_id() == id,
            None => evt.service_type == ServiceType::Controller,
        }
    }
}

impl Service for WandService {
    fn setup(&mut self, settings: &ServiceSettings) -> Result<(), ServiceError> {
        self.ray_source_id = setting_u32(settings, "ray_source_id", 0)?;
        self.controller_service = setting_str(settings, "controller_service")?.map(str::to_string);
        self.controller_source_id = setting_u32(settings, "controller_source_id", 0)?;
        self.debug = setting_bool(settings, "debug", false)?;
        debug!(
            "wand ray source {} controller source {}",
            self.ray_source_id, self.controller_source_id
        );
        Ok(())
    }

    fn initialize(&mut self, ctx: ServiceContext) -> Result<(), ServiceError> {
        if let Some(name) = &self.controller_service {
            self.controller_service_id = ctx.lookup_service(name);
            if self.controller_service_id.is_none() {
                warn!("wand: controller service {name} not found, matching any controller");
            }
        }
        self.ctx = Some(ctx);
        Ok(())
    }

    fn poll(&mut self) {
        let Some(ctx) = &self.ctx else { return };
        let wand_id = ctx.id();
        let mut buf = ctx.queue().lock();

        for i in 0..buf.available_count() {
            let Some(evt) = buf.get_mut(i) else { break };

            if evt.is_from(ServiceType::Mocap, self.ray_source_id) {
                self.pose = WandPose {
                    position: evt.position,
                    orientation: evt.orientation,
                    user_id: evt.user_id(),
                };
                if self.debug {
                    debug!("wand pose {:?} {:?}", self.pose.position, self.pose.orientation);
                }
            } else if self.is_controller_event(evt) {
                evt.timestamp = timestamp_ms();
                evt.service_type = ServiceType::Wand;
                evt.source_id = self.ray_source_id;
                evt.set_device_tag(wand_id, self.pose.user_id);
                evt.position = self.pose.position;
                evt.orientation = self.pose.orientation;
            }
        }
    }

    fn poll_priority(&self) -> PollPriority {
        PollPriority::Last
    }
}
