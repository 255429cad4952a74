use crate::estimator::EstimatorCore;
use crate::health::AidingSource;
use crate::types::{Vec2, Vec3, POS_NE_IDX, POS_E_IDX, POS_N_IDX, VEL_E_IDX, VEL_NE_IDX, VEL_N_IDX};

use super::{reset_heading_from_mag, AidingEvent, AidingState, CycleContext};

/// Minimum height above the ground clearance for a usable flow velocity [m]
const MIN_FLOW_RANGE_MARGIN: f64 = 0.3;
/// Minimum flow integration interval for a usable flow velocity [s]
const MIN_FLOW_DT: f64 = 0.05;

/// Optical-flow aiding: start when flow and terrain height are fresh, drop
/// back to the synthetic anchor when flow stops fusing without GPS.
pub fn control_optical_flow<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    let mut events = Vec::new();
    let params = ctx.params;
    let prev = &ctx.prev;
    let now = ctx.clock.now_us;

    if !params.fusion_mode.use_optical_flow {
        if prev.opt_flow {
            state.status.opt_flow = false;
            log::info!("optical flow fusion disabled");
            events.push(AidingEvent::FlowDisabled);
        }
        return events;
    }

    let max_age = params.timeouts.flow_data_max_age_us;
    let flow_fresh = ctx.buffers.flow.is_fresh(now, max_age);
    let hagl_fresh = state.health.time_since_hagl_fuse(now) < max_age;

    if !prev.opt_flow && prev.tilt_align && flow_fresh && hagl_fresh {
        if !state.status.yaw_align {
            state.status.yaw_align = reset_heading_from_mag(core, ctx.buffers);
        }
        if !state.status.yaw_align {
            return events;
        }

        state.status.opt_flow = true;
        state.health.record_fusion(AidingSource::OpticalFlow, now);

        if !prev.gps {
            if let Some(flow) = ctx.buffers.flow.newest() {
                let rot = core.state().quat_nominal.to_rotation_matrix();
                let hagl = (core.terrain_vpos() - core.state().pos.z).max(params.rng_gnd_clearance);
                let range = hagl / rot[(2, 2)];

                let vel_ne = if range - params.rng_gnd_clearance > MIN_FLOW_RANGE_MARGIN
                    && flow.dt > MIN_FLOW_DT
                {
                    let body = Vec3::new(
                        -range * flow.flow_rad_xy_comp.y / flow.dt,
                        range * flow.flow_rad_xy_comp.x / flow.dt,
                        0.0,
                    );
                    (rot * body).xy()
                } else {
                    Vec2::zeros()
                };

                let meas_var = core.opt_flow_meas_var(flow);
                let vel = &mut core.state_mut().vel;
                vel.x = vel_ne.x;
                vel.y = vel_ne.y;
                core.zero_cov_block(VEL_NE_IDX);
                core.set_variance(VEL_N_IDX, range * range * meas_var);
                core.set_variance(VEL_E_IDX, range * range * meas_var);

                if !prev.in_air {
                    // First start on the ground: this point becomes the origin
                    let pos = &mut core.state_mut().pos;
                    pos.x = 0.0;
                    pos.y = 0.0;
                    core.zero_cov_block(POS_NE_IDX);
                    core.set_variance(POS_N_IDX, 0.0);
                    core.set_variance(POS_E_IDX, 0.0);
                    // Outputs are copied from the state, so deltas queued
                    // earlier this cycle are already contained in them
                    core.reset_status_mut().take_pending();
                    core.align_output_filter();
                }
            }
        }

        log::info!("commencing optical flow fusion");
        events.push(AidingEvent::FlowStarted);
    } else if prev.opt_flow
        && !prev.gps
        && state.health.source(AidingSource::OpticalFlow).time_since_fusion(now)
            > params.timeouts.flow_fusion_timeout_us
    {
        state.status.opt_flow = false;
        let anchor = core.state().pos.xy();
        state.last_known_pos_ne = anchor;
        core.state_mut().vel = Vec3::zeros();
        log::warn!("optical flow fusion timeout - holding position at {:?}", anchor);
        events.push(AidingEvent::FlowLost { anchor });
    }

    events
}
