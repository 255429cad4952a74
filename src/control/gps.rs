use crate::estimator::{EstimatorCore, HorizontalSource};
use crate::health::AidingSource;
use crate::types::Vec3;

use super::{reset_heading_from_mag, AidingEvent, AidingState, CycleContext};

/// GPS aiding: start after alignment once the origin is set and the failure
/// cooldown has passed; on a fusion timeout either reset to the measurement
/// or, if the data itself has gone stale, fall back to the synthetic anchor.
pub fn control_gps<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    let mut events = Vec::new();
    let params = ctx.params;
    let timeouts = &params.timeouts;
    let prev = &ctx.prev;
    let now = ctx.clock.now_us;

    if !params.fusion_mode.use_gps {
        if prev.gps {
            state.status.gps = false;
            log::info!("GPS fusion disabled");
            events.push(AidingEvent::GpsDisabled);
        }
        return events;
    }

    let gps_fresh = ctx.buffers.gps.is_fresh(now, timeouts.gps_data_max_age_us);

    if !prev.gps {
        let cooled_down = state
            .health
            .source(AidingSource::Gps)
            .can_retry(now, timeouts.gps_fail_cooldown_us);
        if !(prev.tilt_align && gps_fresh && core.ned_origin_initialised() && cooled_down) {
            return events;
        }

        if !state.status.yaw_align {
            state.status.yaw_align = reset_heading_from_mag(core, ctx.buffers);
        }
        if !state.status.yaw_align {
            return events;
        }

        if prev.opt_flow {
            state.status.gps = true;
        } else if core.reset_position(HorizontalSource::Gps, ctx.buffers)
            && core.reset_velocity(HorizontalSource::Gps, ctx.buffers)
        {
            state.status.gps = true;
            state.health.restart_pos_vel_clocks(now);
        } else {
            state.health.record_failure(AidingSource::Gps, now);
            log::warn!(
                "GPS state reset failed, retry in {:.1} s",
                timeouts.gps_fail_cooldown_us as f64 * 1e-6
            );
            events.push(AidingEvent::GpsActivationFailed);
            return events;
        }

        log::info!("commencing GPS fusion");
        events.push(AidingEvent::GpsStarted);
    } else if !prev.opt_flow {
        let pos_timed_out = state.health.time_since_pos_fuse(now) > timeouts.gps_fusion_timeout_us;
        let vel_timed_out = state.health.time_since_vel_fuse(now) > timeouts.gps_fusion_timeout_us;
        if !(pos_timed_out && vel_timed_out) {
            return events;
        }

        if !gps_fresh {
            state.status.gps = false;
            let anchor = core.state().pos.xy();
            state.last_known_pos_ne = anchor;
            core.state_mut().vel = Vec3::zeros();
            log::warn!("GPS data stopped - holding position at {:?}", anchor);
            events.push(AidingEvent::GpsLost { anchor });
        } else {
            let vel_ok = core.reset_velocity(HorizontalSource::Gps, ctx.buffers);
            let pos_ok = core.reset_position(HorizontalSource::Gps, ctx.buffers);
            if vel_ok && pos_ok {
                state.health.restart_pos_vel_clocks(now);
                log::warn!("GPS fusion timeout - reset to GPS");
                events.push(AidingEvent::GpsResetToMeasurement);
            } else {
                // Clocks stay expired so the reset is retried next cycle
                log::warn!("GPS fusion timeout - reset failed (vel: {}, pos: {})", vel_ok, pos_ok);
                events.push(AidingEvent::GpsResetFailed);
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::buffer::SensorBuffers;
    use crate::params::AidingParams;
    use crate::types::Vec2;

    #[test]
    fn test_start_resets_position_and_velocity() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(900_000));
        let mut state = aligned_state();
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_gps(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::GpsStarted]);
        assert!(state.status.gps);
        assert_eq!(core.state().pos.xy(), Vec2::new(5.0, -3.0));
        assert_eq!(core.state().vel.xy(), Vec2::new(0.5, 0.0));
        assert_eq!(state.health.last_pos_fuse_us, Some(1_000_000));
    }

    #[test]
    fn test_start_waits_for_origin() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(900_000));
        let mut state = aligned_state();
        let mut core = core();
        core.set_origin_initialised(false);

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert!(control_gps(&ctx, &mut state, &mut core).is_empty());
        assert!(!state.status.gps);
    }

    #[test]
    fn test_start_with_flow_skips_reset() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(900_000));
        let mut state = aligned_state();
        state.status.opt_flow = true;
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert_eq!(control_gps(&ctx, &mut state, &mut core), vec![AidingEvent::GpsStarted]);
        assert_eq!(core.state().pos.xy(), Vec2::zeros());
        assert_eq!(core.reset_status().counters().pos_ne, 0);
    }

    #[test]
    fn test_no_retry_during_cooldown() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        let mut state = aligned_state();
        state.health.record_failure(AidingSource::Gps, 1_000_000);
        let mut core = core();

        for now in [2_000_000, 4_000_000, 6_000_000] {
            buffers.gps.push(gps(now - 100_000));
            let ctx = context(now, &params, &buffers, state.status);
            assert!(control_gps(&ctx, &mut state, &mut core).is_empty());
            assert!(!state.status.gps);
        }

        buffers.gps.push(gps(6_100_000));
        let ctx = context(6_200_000, &params, &buffers, state.status);
        assert_eq!(control_gps(&ctx, &mut state, &mut core), vec![AidingEvent::GpsStarted]);
    }

    #[test]
    fn test_stale_data_after_timeout_falls_back_to_anchor() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(500_000));
        let mut state = aligned_state();
        state.status.gps = true;
        state.health.restart_pos_vel_clocks(1_000_000);
        let mut core = core();
        core.state_mut().pos = Vec3::new(10.0, 20.0, 0.0);
        core.state_mut().vel = Vec3::new(3.0, 0.0, 0.0);

        let ctx = context(11_500_000, &params, &buffers, state.status);
        let events = control_gps(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::GpsLost { anchor: Vec2::new(10.0, 20.0) }]);
        assert!(!state.status.gps);
        assert_eq!(state.last_known_pos_ne, Vec2::new(10.0, 20.0));
        assert_eq!(core.state().vel, Vec3::zeros());
    }

    #[test]
    fn test_only_one_channel_timed_out_keeps_gps() {
        let params = AidingParams::default();
        let buffers = SensorBuffers::default();
        let mut state = aligned_state();
        state.status.gps = true;
        state.health.last_pos_fuse_us = Some(1_000_000);
        state.health.last_vel_fuse_us = Some(11_000_000);
        let mut core = core();

        let ctx = context(11_500_000, &params, &buffers, state.status);
        assert!(control_gps(&ctx, &mut state, &mut core).is_empty());
        assert!(state.status.gps);
    }

    #[test]
    fn test_failed_recovery_keeps_clocks_expired() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(11_400_000));
        let mut state = aligned_state();
        state.status.gps = true;
        state.health.restart_pos_vel_clocks(1_000_000);
        let mut core = ScriptedCore::new();
        core.fail_horizontal_resets = true;

        let ctx = context(11_500_000, &params, &buffers, state.status);
        let events = control_gps(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::GpsResetFailed]);
        assert!(state.status.gps);
        assert_eq!(state.health.last_pos_fuse_us, Some(1_000_000));
        assert_eq!(state.health.last_vel_fuse_us, Some(1_000_000));

        // Retried on the next cycle once the core accepts the reset
        core.fail_horizontal_resets = false;
        let ctx = context(11_510_000, &params, &buffers, state.status);
        let events = control_gps(&ctx, &mut state, &mut core);
        assert_eq!(events, vec![AidingEvent::GpsResetToMeasurement]);
        assert_eq!(state.health.last_pos_fuse_us, Some(11_510_000));
    }

    #[test]
    fn test_disabled_by_configuration() {
        let mut params = AidingParams::default();
        params.fusion_mode.use_gps = false;
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(900_000));
        let mut state = aligned_state();
        state.status.gps = true;
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert_eq!(control_gps(&ctx, &mut state, &mut core), vec![AidingEvent::GpsDisabled]);
        assert!(!state.status.gps);

        // Fresh data does not restart it while disabled
        let ctx = context(1_010_000, &params, &buffers, state.status);
        assert!(control_gps(&ctx, &mut state, &mut core).is_empty());
        assert!(!state.status.gps);
    }

    #[test]
    fn test_failed_reset_starts_cooldown() {
        let params = AidingParams::default();
        let mut buffers = SensorBuffers::default();
        buffers.gps.push(gps(900_000));
        let mut state = aligned_state();
        let mut core = ScriptedCore::new();
        core.fail_horizontal_resets = true;

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_gps(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::GpsActivationFailed]);
        assert!(!state.status.gps);
        assert_eq!(
            state.health.source(AidingSource::Gps).last_failure_us,
            Some(1_000_000)
        );
    }
}
