use crate::estimator::EstimatorCore;
use crate::health::AidingSource;
use crate::params::MagFusionType;
use crate::status::{ControlStatus, MagMode};

use super::{reset_heading_from_mag, AidingEvent, AidingState, CycleContext};

/// Magnetometer fusion mode, declination fusion and wind validity.
///
/// While vision owns yaw the magnetometer group stays cleared and nothing
/// else is evaluated. Mode changes made elsewhere in the cycle are still
/// reported here.
pub fn control_mag<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    if !state.status.ev_yaw() {
        let target = target_mode(ctx, state, core);
        if target == MagMode::ThreeAxis && !state.status.mag_3d() {
            // Field states and yaw are re-initialised on entry to 3-axis
            state.status.yaw_align = reset_heading_from_mag(core, ctx.buffers);
        }
        state.status.set_mag_mode(target);

        // Without GPS the declination is the only long term yaw reference
        state
            .status
            .set_mag_dec(!ctx.prev.gps || ctx.params.fuse_declination);

        let since_airspeed = state
            .health
            .source(AidingSource::Airspeed)
            .time_since_fusion(ctx.clock.now_us);
        state.status.wind = since_airspeed <= ctx.params.timeouts.airspeed_timeout_us;
    }

    transition_events(&ctx.prev, &state.status)
}

fn target_mode<C: EstimatorCore>(ctx: &CycleContext, state: &AidingState, core: &C) -> MagMode {
    let prev = &ctx.prev;
    match ctx.params.mag_fusion_type {
        MagFusionType::Auto => {
            // Stay in 3-axis until landing once clear of ground anomalies
            let climbed = state.last_on_ground_pos_d - core.state().pos.z;
            let height_achieved = climbed > ctx.params.timeouts.mag_3d_min_climb;
            if prev.in_air && (prev.mag_3d() || height_achieved) && prev.tilt_align {
                MagMode::ThreeAxis
            } else {
                MagMode::Heading
            }
        }
        MagFusionType::Heading => MagMode::Heading,
        MagFusionType::ThreeAxis => MagMode::ThreeAxis,
        MagFusionType::None => MagMode::Off,
    }
}

fn transition_events(prev: &ControlStatus, status: &ControlStatus) -> Vec<AidingEvent> {
    let mut events = Vec::new();
    if prev.mag_mode() != status.mag_mode() {
        log::info!("mag fusion {:?} -> {:?}", prev.mag_mode(), status.mag_mode());
        events.push(AidingEvent::MagModeChanged {
            from: prev.mag_mode(),
            to: status.mag_mode(),
        });
    }
    if prev.mag_dec() != status.mag_dec() {
        events.push(AidingEvent::DeclinationFusion {
            enabled: status.mag_dec(),
        });
    }
    if prev.wind != status.wind {
        log::info!("wind estimate {}", if status.wind { "valid" } else { "invalid" });
        events.push(AidingEvent::WindValidity { valid: status.wind });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::buffer::SensorBuffers;
    use crate::params::AidingParams;

    fn policy(mag_fusion_type: MagFusionType) -> AidingParams {
        AidingParams {
            mag_fusion_type,
            ..Default::default()
        }
    }

    fn with_mag() -> SensorBuffers {
        let mut buffers = SensorBuffers::default();
        buffers.mag.push(mag(900_000));
        buffers
    }

    #[test]
    fn test_auto_uses_heading_on_ground() {
        let params = AidingParams::default();
        let buffers = with_mag();
        let mut state = aligned_state();
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);

        assert_eq!(
            events,
            vec![AidingEvent::MagModeChanged {
                from: MagMode::Off,
                to: MagMode::Heading
            }]
        );
        assert!(state.status.mag_hdg());
        assert!(!state.status.mag_dec());
        assert_eq!(core.reset_status().counters().quat, 0);
    }

    #[test]
    fn test_auto_switches_to_3d_after_climb() {
        let params = AidingParams::default();
        let buffers = with_mag();
        let mut state = aligned_state();
        state.status.in_air = true;
        state.status.set_mag_mode(MagMode::Heading);
        state.last_on_ground_pos_d = 0.0;
        let mut core = core();

        core.state_mut().pos.z = -1.0;
        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert!(control_mag(&ctx, &mut state, &mut core).is_empty());
        assert!(state.status.mag_hdg());

        core.state_mut().pos.z = -2.0;
        let ctx = context(1_010_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);

        assert!(state.status.mag_3d());
        assert!(state.status.yaw_align);
        assert_eq!(core.reset_status().counters().quat, 1);
        assert_eq!(
            events,
            vec![
                AidingEvent::MagModeChanged {
                    from: MagMode::Heading,
                    to: MagMode::ThreeAxis
                },
                AidingEvent::DeclinationFusion { enabled: true },
            ]
        );
    }

    #[test]
    fn test_auto_keeps_3d_until_landing() {
        let params = AidingParams::default();
        let buffers = with_mag();
        let mut state = aligned_state();
        state.status.in_air = true;
        state.status.set_mag_mode(MagMode::ThreeAxis);
        let mut core = core();

        // Descended below the climb threshold but still flying
        let ctx = context(1_000_000, &params, &buffers, state.status);
        control_mag(&ctx, &mut state, &mut core);
        assert!(state.status.mag_3d());
        assert_eq!(core.reset_status().counters().quat, 0);

        state.status.in_air = false;
        let ctx = context(1_010_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);
        assert!(state.status.mag_hdg());
        assert!(!state.status.mag_dec());
        assert!(events.contains(&AidingEvent::MagModeChanged {
            from: MagMode::ThreeAxis,
            to: MagMode::Heading
        }));
        assert!(events.contains(&AidingEvent::DeclinationFusion { enabled: false }));
    }

    #[test]
    fn test_declination_with_gps_follows_configuration() {
        let buffers = with_mag();
        let mut core = core();

        for (fuse_declination, expected) in [(false, false), (true, true)] {
            let params = AidingParams {
                fuse_declination,
                ..policy(MagFusionType::ThreeAxis)
            };
            let mut state = aligned_state();
            state.status.gps = true;
            state.status.set_mag_mode(MagMode::ThreeAxis);

            let ctx = context(1_000_000, &params, &buffers, state.status);
            control_mag(&ctx, &mut state, &mut core);
            assert_eq!(state.status.mag_dec(), expected);
        }

        // Without GPS declination is always fused in 3-axis
        let params = AidingParams {
            fuse_declination: false,
            ..policy(MagFusionType::ThreeAxis)
        };
        let mut state = aligned_state();
        state.status.set_mag_mode(MagMode::ThreeAxis);
        let ctx = context(1_000_000, &params, &buffers, state.status);
        control_mag(&ctx, &mut state, &mut core);
        assert!(state.status.mag_dec());
    }

    #[test]
    fn test_3d_entry_without_mag_sample_drops_yaw_alignment() {
        let params = policy(MagFusionType::ThreeAxis);
        let buffers = SensorBuffers::default();
        let mut state = aligned_state();
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        control_mag(&ctx, &mut state, &mut core);
        assert!(state.status.mag_3d());
        assert!(!state.status.yaw_align);
    }

    #[test]
    fn test_none_policy_disables_mag() {
        let params = policy(MagFusionType::None);
        let buffers = with_mag();
        let mut state = aligned_state();
        state.status.set_mag_mode(MagMode::Heading);
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);
        assert_eq!(state.status.mag_mode(), MagMode::Off);
        assert_eq!(
            events,
            vec![AidingEvent::MagModeChanged {
                from: MagMode::Heading,
                to: MagMode::Off
            }]
        );
    }

    #[test]
    fn test_wind_validity_follows_airspeed_fusion() {
        let params = policy(MagFusionType::Heading);
        let buffers = with_mag();
        let mut state = aligned_state();
        state.status.set_mag_mode(MagMode::Heading);
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        control_mag(&ctx, &mut state, &mut core);
        assert!(!state.status.wind);

        state.health.record_fusion(AidingSource::Airspeed, 500_000);
        let ctx = context(5_000_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);
        assert!(state.status.wind);
        assert_eq!(events, vec![AidingEvent::WindValidity { valid: true }]);

        let ctx = context(10_600_000, &params, &buffers, state.status);
        let events = control_mag(&ctx, &mut state, &mut core);
        assert!(!state.status.wind);
        assert_eq!(events, vec![AidingEvent::WindValidity { valid: false }]);
    }

    #[test]
    fn test_vision_yaw_suppresses_mag() {
        let params = policy(MagFusionType::ThreeAxis);
        let buffers = with_mag();
        let mut state = aligned_state();
        state.status.claim_vision_yaw();
        state.health.record_fusion(AidingSource::Airspeed, 900_000);
        let mut core = core();

        let ctx = context(1_000_000, &params, &buffers, state.status);
        assert!(control_mag(&ctx, &mut state, &mut core).is_empty());
        assert_eq!(state.status.mag_mode(), MagMode::Off);
        assert!(!state.status.mag_dec());
        assert!(!state.status.wind);
        assert_eq!(core.reset_status().counters().quat, 0);
    }
}
