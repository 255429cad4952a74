use std::f64::consts::PI;

use crate::estimator::{EstimatorCore, HorizontalSource};
use crate::reset::StateResetEvent;
use crate::status::HeightSource;
use crate::types::Attitude;

use super::{AidingEvent, AidingState, CycleContext};

fn wrap_pi(angle: f64) -> f64 {
    (angle + PI).rem_euclid(2.0 * PI) - PI
}

/// Replace the yaw of the current attitude with `yaw`, keeping roll and
/// pitch. Records the rotation applied and returns the yaw change.
fn reset_yaw<C: EstimatorCore>(core: &mut C, yaw: f64) -> f64 {
    let old = core.state().quat_nominal;
    let (roll, pitch, old_yaw) = old.euler_angles();
    let new = Attitude::from_euler_angles(roll, pitch, yaw);
    let delta = new * old.inverse();

    core.state_mut().quat_nominal = new;
    core.reset_status_mut()
        .record(StateResetEvent::Attitude { delta });
    wrap_pi(yaw - old_yaw)
}

/// External vision: position/height and yaw take-over. Neither has a
/// timeout-driven exit.
pub fn control_vision<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    let mut events = Vec::new();
    let fusion = ctx.params.fusion_mode;
    let prev = &ctx.prev;
    let ev_fresh = ctx
        .buffers
        .ext_vision
        .is_fresh(ctx.clock.now_us, 2 * ctx.params.ev_max_interval_us);

    if fusion.use_ev_pos && !prev.ev_pos && prev.tilt_align && prev.yaw_align && ev_fresh {
        let pos_ok = core.reset_position(HorizontalSource::Vision, ctx.buffers);
        let vel_ok = core.reset_velocity(HorizontalSource::Vision, ctx.buffers);
        let hgt_ok = core.reset_height(HeightSource::Vision, ctx.buffers);
        if pos_ok && vel_ok && hgt_ok {
            state.status.height = HeightSource::Vision;
            state.status.ev_pos = true;
            log::info!("commencing external vision position fusion");
            events.push(AidingEvent::VisionPositionStarted);
        } else {
            log::warn!(
                "ev states not reset (pos: {}, vel: {}, hgt: {}), retrying",
                pos_ok,
                vel_ok,
                hgt_ok
            );
            events.push(AidingEvent::VisionPositionResetFailed);
        }
    }

    if fusion.use_ev_yaw && !prev.ev_yaw() && prev.tilt_align && ev_fresh {
        if let Some(ev) = ctx.buffers.ext_vision.newest() {
            let (_, _, ev_yaw) = ev.quat.euler_angles();
            let yaw_change = reset_yaw(core, ev_yaw);
            state.status.yaw_align = true;
            state.status.claim_vision_yaw();
            log::info!(
                "commencing external vision yaw fusion (yaw change {:.1}°)",
                yaw_change.to_degrees()
            );
            events.push(AidingEvent::VisionYawStarted { yaw_change });
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::buffer::SensorBuffers;
    use crate::params::{AidingParams, FusionMode};
    use crate::status::MagMode;
    use crate::types::{ExtVisionSample, Vec3};
    use approx::assert_relative_eq;

    fn ev(time_us: u64, yaw: f64) -> ExtVisionSample {
        ExtVisionSample {
            time_us,
            pos: Vec3::new(1.0, 2.0, -3.0),
            quat: Attitude::from_euler_angles(0.0, 0.0, yaw),
            pos_err: 0.1,
            ang_err: 0.05,
        }
    }

    fn params(use_ev_pos: bool, use_ev_yaw: bool) -> AidingParams {
        AidingParams {
            fusion_mode: FusionMode {
                use_ev_pos,
                use_ev_yaw,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_wrap_pi() {
        assert_relative_eq!(wrap_pi(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_pi(-3.0 * PI / 2.0), PI / 2.0, epsilon = 1e-12);
        assert_relative_eq!(wrap_pi(0.25), 0.25);
    }

    #[test]
    fn test_position_start_resets_to_vision() {
        let params = params(true, false);
        let mut buffers = SensorBuffers::default();
        buffers.ext_vision.push(ev(950_000, 0.0));
        let mut state = aligned_state();
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_vision(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::VisionPositionStarted]);
        assert!(state.status.ev_pos);
        assert_eq!(state.status.height, HeightSource::Vision);
        assert_eq!(core.state().pos, Vec3::new(1.0, 2.0, -3.0));
    }

    #[test]
    fn test_position_start_commits_only_after_all_resets() {
        let params = params(true, false);
        let mut buffers = SensorBuffers::default();
        buffers.ext_vision.push(ev(950_000, 0.0));
        let mut state = aligned_state();
        let mut core = ScriptedCore::new();
        core.fail_height_reset = true;

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_vision(&ctx, &mut state, &mut core);

        assert_eq!(events, vec![AidingEvent::VisionPositionResetFailed]);
        assert!(!state.status.ev_pos);
        assert_eq!(state.status.height, HeightSource::Baro);

        core.fail_height_reset = false;
        core.fail_horizontal_resets = true;
        let ctx = context(1_010_000, &params, &buffers, state.status);
        let events = control_vision(&ctx, &mut state, &mut core);
        assert_eq!(events, vec![AidingEvent::VisionPositionResetFailed]);
        assert!(!state.status.ev_pos);
        assert_eq!(state.status.height, HeightSource::Baro);

        core.fail_horizontal_resets = false;
        let ctx = context(1_020_000, &params, &buffers, state.status);
        let events = control_vision(&ctx, &mut state, &mut core);
        assert_eq!(events, vec![AidingEvent::VisionPositionStarted]);
        assert!(state.status.ev_pos);
        assert_eq!(state.status.height, HeightSource::Vision);
    }

    #[test]
    fn test_position_start_requires_yaw_alignment() {
        let params = params(true, false);
        let mut buffers = SensorBuffers::default();
        buffers.ext_vision.push(ev(950_000, 0.0));
        let mut state = aligned_state();
        state.status.yaw_align = false;
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert!(control_vision(&ctx, &mut state, &mut core).is_empty());
        assert!(!state.status.ev_pos);
    }

    #[test]
    fn test_stale_vision_is_ignored() {
        let params = params(true, true);
        let mut buffers = SensorBuffers::default();
        buffers.ext_vision.push(ev(500_000, 0.0));
        let mut state = aligned_state();
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert!(control_vision(&ctx, &mut state, &mut core).is_empty());
        assert!(!state.status.ev_yaw());
    }

    #[test]
    fn test_yaw_start_keeps_roll_and_pitch() {
        let params = params(false, true);
        let mut buffers = SensorBuffers::default();
        buffers.ext_vision.push(ev(950_000, -2.0));
        let mut state = aligned_state();
        state.status.yaw_align = false;
        state.status.set_mag_mode(MagMode::Heading);
        let mut core = core();
        core.state_mut().quat_nominal = Attitude::from_euler_angles(0.1, -0.05, 2.0);

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_vision(&ctx, &mut state, &mut core);

        let (roll, pitch, yaw) = core.state().quat_nominal.euler_angles();
        assert_relative_eq!(roll, 0.1, epsilon = 1e-9);
        assert_relative_eq!(pitch, -0.05, epsilon = 1e-9);
        assert_relative_eq!(yaw, -2.0, epsilon = 1e-9);
        match events.as_slice() {
            [AidingEvent::VisionYawStarted { yaw_change }] => {
                assert_relative_eq!(*yaw_change, 2.0 * PI - 4.0, epsilon = 1e-9)
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(state.status.yaw_align);
        assert!(state.status.ev_yaw());
        assert_eq!(state.status.mag_mode(), MagMode::Off);
        assert_eq!(core.reset_status().counters().quat, 1);
    }
}
