use crate::estimator::{EstimatorCore, InnovationChannel};
use crate::health::AidingSource;
use crate::status::HeightSource;
use crate::types::POS_D_IDX;

use super::{AidingEvent, AidingState, CycleContext};

/// Sensor conditions the height timeout decision depends on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeightTimeoutInputs {
    pub active: HeightSource,
    pub baro_fresh: bool,
    pub gps_fresh: bool,
    /// Reported vertical accuracy within the required limit
    pub gps_accurate: bool,
    pub gps_faulty: bool,
    pub baro_faulty: bool,
    /// Baro innovation inside the consistency gate
    pub baro_consistent: bool,
    /// Inertial fault suspected within the memory window
    pub recent_inertial_fault: bool,
    pub rng_fresh: bool,
    pub ev_fresh: bool,
}

/// Source to reset height to after the active source timed out, or `None`
/// when no source is viable.
pub fn select_height_reset(inputs: &HeightTimeoutInputs) -> Option<HeightSource> {
    let i = inputs;
    match i.active {
        HeightSource::Baro => {
            let gps_trusted =
                i.gps_fresh && i.gps_accurate && !i.gps_faulty && !i.recent_inertial_fault;
            if gps_trusted || (i.gps_fresh && !i.baro_fresh) {
                Some(HeightSource::Gps)
            } else if i.baro_fresh {
                Some(HeightSource::Baro)
            } else {
                None
            }
        }
        HeightSource::Gps => {
            let baro_trusted =
                i.baro_consistent && i.baro_fresh && !i.baro_faulty && !i.gps_accurate;
            if baro_trusted || (!i.gps_fresh && i.baro_fresh) {
                Some(HeightSource::Baro)
            } else if i.gps_fresh {
                Some(HeightSource::Gps)
            } else {
                None
            }
        }
        HeightSource::Range => {
            if i.rng_fresh {
                Some(HeightSource::Range)
            } else if i.baro_fresh {
                Some(HeightSource::Baro)
            } else {
                None
            }
        }
        HeightSource::Vision => {
            if i.ev_fresh {
                Some(HeightSource::Vision)
            } else if i.baro_fresh {
                Some(HeightSource::Baro)
            } else {
                None
            }
        }
    }
}

/// Height aiding: timeout handling first, then preferred-source selection.
pub fn control_height<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    let mut events = check_height_timeout(ctx, state, core);
    events.extend(select_preferred_source(ctx, state));

    if !ctx.prev.in_air {
        state.last_on_ground_pos_d = core.state().pos.z;
    }
    events
}

fn check_height_timeout<C: EstimatorCore>(
    ctx: &CycleContext,
    state: &mut AidingState,
    core: &mut C,
) -> Vec<AidingEvent> {
    let mut events = Vec::new();
    let params = ctx.params;
    let buffers = ctx.buffers;
    let now = ctx.clock.now_us;
    let from = ctx.prev.height;

    let baro_max_age = 2 * params.baro_max_interval_us;
    let gps_max_age = 2 * params.gps_max_interval_us;
    let baro_fresh = buffers.baro.is_fresh(now, baro_max_age);
    let gps_fresh = buffers.gps.is_fresh(now, gps_max_age);

    // Vertical position and velocity pulled the same way by baro and GPS:
    // more likely an accelerometer problem than a sensor one
    if from == HeightSource::Baro {
        let same_sign = core.innovation(InnovationChannel::VelD)
            * core.innovation(InnovationChannel::PosD)
            > 0.0;
        let both_fresh = ctx.horizon_fresh(&buffers.baro, baro_max_age)
            && ctx.horizon_fresh(&buffers.gps, gps_max_age);
        let both_failing = core.innovation_test_ratio(InnovationChannel::VelD) > 1.0
            && core.innovation_test_ratio(InnovationChannel::PosD) > 1.0;
        if same_sign && both_fresh && both_failing {
            state.health.last_bad_vert_accel_us = Some(now);
            log::debug!("bad vertical accel suspected");
            events.push(AidingEvent::InertialFaultSuspected);
        }
    }

    let var_pos_d = core.variance(POS_D_IDX);
    let timed_out = state.health.time_since_hgt_fuse(now) > params.timeouts.hgt_fusion_timeout_us;
    if var_pos_d <= params.hgt_reset_var() || !timed_out {
        return events;
    }

    let baro_consistent = buffers.baro.newest().map_or(false, |baro| {
        let baro_pos_d = core.hgt_sensor_offset() - baro.hgt + core.baro_hgt_offset();
        let innov = core.state().pos.z - baro_pos_d;
        let gate = params.baro_innov_gate * params.baro_innov_gate;
        innov.abs() < (params.baro_noise * params.baro_noise + var_pos_d) * gate
    });
    // GPS and range heights are only usable once yaw is aligned
    let yaw_aligned = ctx.prev.yaw_align;
    let inputs = HeightTimeoutInputs {
        active: from,
        baro_fresh,
        gps_fresh: gps_fresh && yaw_aligned,
        gps_accurate: buffers
            .gps
            .newest()
            .map_or(false, |gps| gps.vacc < params.req_vacc),
        gps_faulty: state.health.is_faulty(AidingSource::Gps),
        baro_faulty: state.health.is_faulty(AidingSource::Baro),
        baro_consistent,
        recent_inertial_fault: state.health.time_since_bad_vert_accel(now)
            < params.timeouts.bad_vert_accel_memory_us,
        rng_fresh: yaw_aligned && buffers.range.is_fresh(now, 2 * params.rng_max_interval_us),
        ev_fresh: buffers.ext_vision.is_fresh(now, 2 * params.ev_max_interval_us),
    };

    let Some(to) = select_height_reset(&inputs) else {
        log::warn!("{} hgt timeout - no viable source, reset denied", from.label());
        events.push(AidingEvent::HeightResetDenied { source: from });
        return events;
    };

    // Nothing is committed unless the core accepted the reset
    if !core.reset_height(to, buffers) {
        log::warn!("{} hgt timeout - reset to {} failed", from.label(), to.label());
        events.push(AidingEvent::HeightResetFailed { from, to });
        return events;
    }

    if to != from {
        state.health.set_faulty(AidingSource::from(from), true);
    }
    state.health.set_faulty(AidingSource::from(to), false);
    state.status.height = to;
    state.health.last_hgt_fuse_us = Some(now);
    log::info!("{} hgt timeout - reset to {}", from.label(), to.label());
    events.push(AidingEvent::HeightReset { from, to });
    events
}

fn select_preferred_source(ctx: &CycleContext, state: &mut AidingState) -> Vec<AidingEvent> {
    let params = ctx.params;
    let buffers = ctx.buffers;
    let preferred = params.vdist_sensor_type;
    let active = state.status.height == preferred;
    let healthy = |source| !state.health.is_faulty(source);

    let available = match preferred {
        HeightSource::Baro => {
            healthy(AidingSource::Baro)
                && (active || ctx.horizon_fresh(&buffers.baro, 2 * params.baro_max_interval_us))
        }
        HeightSource::Gps => {
            ctx.prev.yaw_align
                && healthy(AidingSource::Gps)
                && (active || ctx.horizon_fresh(&buffers.gps, 2 * params.gps_max_interval_us))
        }
        HeightSource::Range => {
            ctx.prev.yaw_align
                && healthy(AidingSource::Range)
                && (active || ctx.horizon_fresh(&buffers.range, 2 * params.rng_max_interval_us))
        }
        HeightSource::Vision => {
            active || ctx.horizon_fresh(&buffers.ext_vision, 2 * params.ev_max_interval_us)
        }
    };

    if !available || active {
        return Vec::new();
    }
    state.status.height = preferred;
    log::info!("switching to {} height", preferred.label());
    vec![AidingEvent::HeightSourceSelected { source: preferred }]
}
