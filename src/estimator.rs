// estimator.rs — Estimator core interface and a scalar reference core
//
// The arbitration layer never touches Kalman math directly. It reads state,
// covariance and innovation bookkeeping through `EstimatorCore` and asks the
// core to reset itself to a named source. `ReferenceCore` is a small core with
// gated scalar corrections, used by the tests and the replay tool.

use std::ops::RangeInclusive;

use ndarray::{s, Array2};

use crate::buffer::{SampleBuffer, SensorBuffers};
use crate::health::{AidingSource, StalenessTracker};
use crate::params::AidingParams;
use crate::reset::{ResetStatus, StateResetEvent};
use crate::status::{ControlStatus, HeightSource};
use crate::types::{
    Attitude, Covariance, FlowSample, NavState, OutputSample, TimeUs, Timestamped, Vec2, Vec3,
    POS_D_IDX, POS_E_IDX, POS_NE_IDX, POS_N_IDX, QUAT_IDX, STATE_DIM, VEL_D_IDX, VEL_E_IDX,
    VEL_NE_IDX, VEL_N_IDX,
};

/// Source of a horizontal position/velocity reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HorizontalSource {
    Gps,
    Vision,
}

/// Velocity/position innovation channels, NED.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InnovationChannel {
    VelN,
    VelE,
    VelD,
    PosN,
    PosE,
    PosD,
}

impl InnovationChannel {
    fn index(self) -> usize {
        self as usize
    }
}

pub trait EstimatorCore {
    fn state(&self) -> &NavState;
    fn state_mut(&mut self) -> &mut NavState;

    fn covariance(&self) -> &Covariance;
    fn covariance_mut(&mut self) -> &mut Covariance;

    /// Rotation-vector error variances [rad²]
    fn rotation_variances(&self) -> Vec3;

    fn innovation(&self, channel: InnovationChannel) -> f64;
    fn innovation_test_ratio(&self, channel: InnovationChannel) -> f64;

    /// Vertical position of the terrain, NED [m]
    fn terrain_vpos(&self) -> f64;
    fn ned_origin_initialised(&self) -> bool;
    fn update_mag_declination(&mut self);
    fn opt_flow_meas_var(&self, flow: &FlowSample) -> f64;
    fn baro_hgt_offset(&self) -> f64;
    fn hgt_sensor_offset(&self) -> f64;

    fn reset_position(&mut self, source: HorizontalSource, buffers: &SensorBuffers) -> bool;
    fn reset_velocity(&mut self, source: HorizontalSource, buffers: &SensorBuffers) -> bool;
    fn reset_height(&mut self, source: HeightSource, buffers: &SensorBuffers) -> bool;
    fn reset_mag_heading(&mut self, mag: &Vec3) -> bool;
    fn align_output_filter(&mut self);

    fn output_buffer_mut(&mut self) -> &mut SampleBuffer<OutputSample>;
    fn reset_status_mut(&mut self) -> &mut ResetStatus;

    fn variance(&self, index: usize) -> f64 {
        self.covariance()[[index, index]]
    }

    fn set_variance(&mut self, index: usize, var: f64) {
        self.covariance_mut()[[index, index]] = var;
    }

    /// Zero the rows and columns of `states`, cross terms included.
    fn zero_cov_block(&mut self, states: RangeInclusive<usize>) {
        let (first, last) = (*states.start(), *states.end() + 1);
        let p = self.covariance_mut();
        p.slice_mut(s![first..last, ..]).fill(0.0);
        p.slice_mut(s![.., first..last]).fill(0.0);
    }
}

// ─── Reference core ──────────────────────────────────────────────────────────

const INITIAL_ROT_VAR: f64 = 0.1;
const MIN_ROT_VAR: f64 = 1e-6;
const TILT_CONVERGENCE_TAU_S: f64 = 2.0;
const ROT_PROCESS_NOISE: f64 = 1e-4;
const POS_PROCESS_NOISE: f64 = 0.05;
const VEL_PROCESS_NOISE: f64 = 0.1;
const FUSION_GATE: f64 = 5.0;
const OUTPUT_BUFFER_LEN: usize = 12;

/// Timestamp of the last sample consumed per source, so a sample sitting at
/// the fusion horizon is fused once.
#[derive(Clone, Copy, Debug, Default)]
struct Consumed {
    gps: Option<TimeUs>,
    height: Option<TimeUs>,
    range: Option<TimeUs>,
    vision: Option<TimeUs>,
    flow: Option<TimeUs>,
    mag: Option<TimeUs>,
    airspeed: Option<TimeUs>,
}

fn pick<T: Timestamped>(buffer: &SampleBuffer<T>, at_us: Option<TimeUs>) -> Option<&T> {
    match at_us {
        Some(horizon_us) => buffer.sample_near(horizon_us),
        None => buffer.newest(),
    }
}

fn take_new<'a, T: Timestamped>(
    buffer: &'a SampleBuffer<T>,
    horizon_us: TimeUs,
    last: &mut Option<TimeUs>,
) -> Option<&'a T> {
    let sample = buffer.sample_near(horizon_us)?;
    if last.map_or(false, |t| sample.time_us() <= t) {
        return None;
    }
    *last = Some(sample.time_us());
    Some(sample)
}

/// Outcome of one gated scalar correction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScalarFusion {
    pub innovation: f64,
    pub test_ratio: f64,
    pub accepted: bool,
}

pub struct ReferenceCore {
    state: NavState,
    covariance: Covariance,
    rot_var: Vec3,
    innovations: [f64; 6],
    test_ratios: [f64; 6],
    terrain_vpos: f64,
    origin_initialised: bool,
    mag_declination: f64,
    baro_hgt_offset: f64,
    hgt_sensor_offset: f64,
    flow_noise: f64,
    flow_noise_qual_min: f64,
    flow_qual_min: u8,
    baro_noise: f64,
    outputs: SampleBuffer<OutputSample>,
    reset_status: ResetStatus,
    consumed: Consumed,
}

impl ReferenceCore {
    pub fn new(params: &AidingParams) -> Self {
        let mut covariance = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        for i in QUAT_IDX {
            covariance[[i, i]] = INITIAL_ROT_VAR;
        }
        for i in VEL_N_IDX..=VEL_D_IDX {
            covariance[[i, i]] = 1.0;
        }
        for i in POS_N_IDX..=POS_D_IDX {
            covariance[[i, i]] = 25.0;
        }
        for i in (POS_D_IDX + 1)..STATE_DIM {
            covariance[[i, i]] = 1e-3;
        }

        Self {
            state: NavState::default(),
            covariance,
            rot_var: Vec3::repeat(INITIAL_ROT_VAR),
            innovations: [0.0; 6],
            test_ratios: [0.0; 6],
            terrain_vpos: 0.0,
            origin_initialised: false,
            mag_declination: 0.0,
            baro_hgt_offset: 0.0,
            hgt_sensor_offset: 0.0,
            flow_noise: params.flow_noise,
            flow_noise_qual_min: params.flow_noise_qual_min,
            flow_qual_min: params.flow_qual_min,
            baro_noise: params.baro_noise,
            outputs: SampleBuffer::bounded(OUTPUT_BUFFER_LEN),
            reset_status: ResetStatus::new(),
            consumed: Consumed::default(),
        }
    }

    pub fn set_origin_initialised(&mut self, initialised: bool) {
        self.origin_initialised = initialised;
    }

    pub fn set_terrain_vpos(&mut self, vpos: f64) {
        self.terrain_vpos = vpos;
    }

    pub fn set_rotation_variances(&mut self, var: Vec3) {
        self.rot_var = var;
    }

    pub fn set_innovation(&mut self, channel: InnovationChannel, innovation: f64, test_ratio: f64) {
        self.innovations[channel.index()] = innovation;
        self.test_ratios[channel.index()] = test_ratio;
    }

    pub fn mag_declination(&self) -> f64 {
        self.mag_declination
    }

    pub fn reset_status(&self) -> &ResetStatus {
        &self.reset_status
    }

    pub fn outputs(&self) -> &SampleBuffer<OutputSample> {
        &self.outputs
    }

    /// Propagate position, inflate the covariance and record an output sample.
    /// Tilt variance converges while the vehicle is stationary.
    pub fn predict(&mut self, now_us: TimeUs, dt: f64, stationary: bool) {
        self.state.pos += self.state.vel * dt;

        for i in POS_N_IDX..=POS_D_IDX {
            self.covariance[[i, i]] += POS_PROCESS_NOISE * dt;
        }
        for i in VEL_N_IDX..=VEL_D_IDX {
            self.covariance[[i, i]] += VEL_PROCESS_NOISE * dt;
        }

        if stationary {
            let decay = (-dt / TILT_CONVERGENCE_TAU_S).exp();
            self.rot_var.x = (self.rot_var.x * decay).max(MIN_ROT_VAR);
            self.rot_var.y = (self.rot_var.y * decay).max(MIN_ROT_VAR);
        } else {
            self.rot_var.x += ROT_PROCESS_NOISE * dt;
            self.rot_var.y += ROT_PROCESS_NOISE * dt;
        }
        self.rot_var.z += ROT_PROCESS_NOISE * dt;

        self.outputs.push(OutputSample {
            time_us: now_us,
            quat_nominal: self.state.quat_nominal,
            vel: self.state.vel,
            pos: self.state.pos,
        });
    }

    fn nav_value_mut(&mut self, index: usize) -> Option<&mut f64> {
        match index {
            VEL_N_IDX => Some(&mut self.state.vel.x),
            VEL_E_IDX => Some(&mut self.state.vel.y),
            VEL_D_IDX => Some(&mut self.state.vel.z),
            POS_N_IDX => Some(&mut self.state.pos.x),
            POS_E_IDX => Some(&mut self.state.pos.y),
            POS_D_IDX => Some(&mut self.state.pos.z),
            _ => None,
        }
    }

    /// Gated scalar Kalman update of one velocity/position state.
    pub fn fuse_scalar(&mut self, index: usize, observation: f64, obs_var: f64) -> ScalarFusion {
        let Some(predicted) = self.nav_value_mut(index).map(|v| *v) else {
            return ScalarFusion { innovation: 0.0, test_ratio: f64::INFINITY, accepted: false };
        };
        let innovation = predicted - observation;
        let innov_var = self.covariance[[index, index]] + obs_var;
        let test_ratio = innovation * innovation / (FUSION_GATE * FUSION_GATE * innov_var);
        if test_ratio >= 1.0 || innov_var <= 0.0 {
            return ScalarFusion { innovation, test_ratio, accepted: false };
        }

        let column = self.covariance.column(index).to_owned();
        let gain = &column / innov_var;
        if let Some(value) = self.nav_value_mut(index) {
            *value -= gain[index] * innovation;
        }
        for i in 0..STATE_DIM {
            for j in 0..STATE_DIM {
                self.covariance[[i, j]] -= gain[i] * column[j];
            }
        }
        ScalarFusion { innovation, test_ratio, accepted: true }
    }

    fn record_channel(&mut self, channel: InnovationChannel, fusion: ScalarFusion) {
        self.set_innovation(channel, fusion.innovation, fusion.test_ratio);
    }

    /// Vertical position observation `(sample time, pos_d, variance)` from
    /// the sample at `at_us`, or the newest sample when `None`.
    fn height_observation(
        &self,
        source: HeightSource,
        buffers: &SensorBuffers,
        at_us: Option<TimeUs>,
    ) -> Option<(TimeUs, f64, f64)> {
        match source {
            HeightSource::Baro => pick(&buffers.baro, at_us).map(|b| {
                (
                    b.time_us,
                    self.hgt_sensor_offset - b.hgt + self.baro_hgt_offset,
                    self.baro_noise * self.baro_noise,
                )
            }),
            HeightSource::Gps => pick(&buffers.gps, at_us)
                .map(|g| (g.time_us, self.hgt_sensor_offset - g.hgt, g.vacc * g.vacc)),
            HeightSource::Range => pick(&buffers.range, at_us).map(|r| {
                (
                    r.time_us,
                    self.hgt_sensor_offset - r.rng * self.tilt_cosine(),
                    0.01,
                )
            }),
            HeightSource::Vision => pick(&buffers.ext_vision, at_us)
                .map(|ev| (ev.time_us, ev.pos.z, ev.pos_err * ev.pos_err)),
        }
    }

    /// Body Z axis projected on the earth vertical.
    fn tilt_cosine(&self) -> f64 {
        self.state.quat_nominal.to_rotation_matrix()[(2, 2)]
    }

    /// Fuse every source the control status allows, recording outcomes in
    /// the staleness tracker.
    pub fn fuse_active_sources(
        &mut self,
        status: &ControlStatus,
        buffers: &SensorBuffers,
        tracker: &mut StalenessTracker,
        horizon_us: TimeUs,
        now_us: TimeUs,
    ) {
        let mut consumed = self.consumed;

        if status.gps {
            if let Some(gps) = take_new(&buffers.gps, horizon_us, &mut consumed.gps) {
                let pos_var = gps.hacc * gps.hacc;
                let vel_var = gps.sacc * gps.sacc;
                let pn = self.fuse_scalar(POS_N_IDX, gps.pos.x, pos_var);
                let pe = self.fuse_scalar(POS_E_IDX, gps.pos.y, pos_var);
                let vn = self.fuse_scalar(VEL_N_IDX, gps.vel.x, vel_var);
                let ve = self.fuse_scalar(VEL_E_IDX, gps.vel.y, vel_var);
                let vd = self.fuse_scalar(VEL_D_IDX, gps.vel.z, vel_var);
                self.record_channel(InnovationChannel::PosN, pn);
                self.record_channel(InnovationChannel::PosE, pe);
                self.record_channel(InnovationChannel::VelN, vn);
                self.record_channel(InnovationChannel::VelE, ve);
                self.record_channel(InnovationChannel::VelD, vd);
                if pn.accepted && pe.accepted {
                    tracker.last_pos_fuse_us = Some(now_us);
                }
                if vn.accepted && ve.accepted {
                    tracker.last_vel_fuse_us = Some(now_us);
                }
                // A rejected measurement is not an activation failure, so
                // the retry cooldown is left alone
                if pn.accepted || vn.accepted {
                    tracker.record_fusion(AidingSource::Gps, now_us);
                }
            }
        }

        if status.ev_pos {
            if let Some(ev) = take_new(&buffers.ext_vision, horizon_us, &mut consumed.vision) {
                let var = ev.pos_err * ev.pos_err;
                let pn = self.fuse_scalar(POS_N_IDX, ev.pos.x, var);
                let pe = self.fuse_scalar(POS_E_IDX, ev.pos.y, var);
                self.record_channel(InnovationChannel::PosN, pn);
                self.record_channel(InnovationChannel::PosE, pe);
                if pn.accepted && pe.accepted {
                    tracker.last_pos_fuse_us = Some(now_us);
                    tracker.record_fusion(AidingSource::Vision, now_us);
                }
            }
        }

        if let Some(rng) = take_new(&buffers.range, horizon_us, &mut consumed.range) {
            self.terrain_vpos = self.state.pos.z + rng.rng * self.tilt_cosine();
            tracker.last_hagl_fuse_us = Some(now_us);
        }

        if status.opt_flow {
            if let Some(flow) = take_new(&buffers.flow, horizon_us, &mut consumed.flow) {
                if flow.quality >= self.flow_qual_min && flow.dt > 0.0 {
                    tracker.record_fusion(AidingSource::OpticalFlow, now_us);
                }
            }
        }

        if let Some((time_us, obs, var)) =
            self.height_observation(status.height, buffers, Some(horizon_us))
        {
            if consumed.height.map_or(true, |t| time_us > t) {
                consumed.height = Some(time_us);
                let fusion = self.fuse_scalar(POS_D_IDX, obs, var);
                self.record_channel(InnovationChannel::PosD, fusion);
                let source = AidingSource::from(status.height);
                if fusion.accepted {
                    tracker.last_hgt_fuse_us = Some(now_us);
                    tracker.record_fusion(source, now_us);
                }
            }
        }

        if status.mag_hdg() || status.mag_3d() {
            if take_new(&buffers.mag, horizon_us, &mut consumed.mag).is_some() {
                tracker.record_fusion(AidingSource::Mag, now_us);
            }
        }

        if status.in_air {
            if let Some(tas) = take_new(&buffers.airspeed, horizon_us, &mut consumed.airspeed) {
                if tas.true_airspeed > 0.0 {
                    tracker.record_fusion(AidingSource::Airspeed, now_us);
                }
            }
        }

        self.consumed = consumed;
    }
}

impl From<HeightSource> for AidingSource {
    fn from(source: HeightSource) -> Self {
        match source {
            HeightSource::Baro => AidingSource::Baro,
            HeightSource::Gps => AidingSource::Gps,
            HeightSource::Range => AidingSource::Range,
            HeightSource::Vision => AidingSource::Vision,
        }
    }
}

impl EstimatorCore for ReferenceCore {
    fn state(&self) -> &NavState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut NavState {
        &mut self.state
    }

    fn covariance(&self) -> &Covariance {
        &self.covariance
    }

    fn covariance_mut(&mut self) -> &mut Covariance {
        &mut self.covariance
    }

    fn rotation_variances(&self) -> Vec3 {
        self.rot_var
    }

    fn innovation(&self, channel: InnovationChannel) -> f64 {
        self.innovations[channel.index()]
    }

    fn innovation_test_ratio(&self, channel: InnovationChannel) -> f64 {
        self.test_ratios[channel.index()]
    }

    fn terrain_vpos(&self) -> f64 {
        self.terrain_vpos
    }

    fn ned_origin_initialised(&self) -> bool {
        self.origin_initialised
    }

    fn update_mag_declination(&mut self) {
        let field = self.state.mag_earth;
        if field.x.hypot(field.y) > 1e-3 {
            self.mag_declination = field.y.atan2(field.x);
        }
    }

    /// Noise interpolated linearly between the best-quality and
    /// minimum-quality values.
    fn opt_flow_meas_var(&self, flow: &FlowSample) -> f64 {
        let qual_min = f64::from(self.flow_qual_min);
        let weight = ((f64::from(flow.quality) - qual_min) / (255.0 - qual_min)).clamp(0.0, 1.0);
        let noise = self.flow_noise_qual_min + weight * (self.flow_noise - self.flow_noise_qual_min);
        noise * noise
    }

    fn baro_hgt_offset(&self) -> f64 {
        self.baro_hgt_offset
    }

    fn hgt_sensor_offset(&self) -> f64 {
        self.hgt_sensor_offset
    }

    fn reset_position(&mut self, source: HorizontalSource, buffers: &SensorBuffers) -> bool {
        let (pos, var) = match source {
            HorizontalSource::Gps => match buffers.gps.newest() {
                Some(gps) => (gps.pos, gps.hacc * gps.hacc),
                None => return false,
            },
            HorizontalSource::Vision => match buffers.ext_vision.newest() {
                Some(ev) => (ev.pos.xy(), ev.pos_err * ev.pos_err),
                None => return false,
            },
        };
        let delta = pos - self.state.pos.xy();
        self.state.pos.x = pos.x;
        self.state.pos.y = pos.y;
        self.zero_cov_block(POS_NE_IDX);
        self.set_variance(POS_N_IDX, var);
        self.set_variance(POS_E_IDX, var);
        self.reset_status.record(StateResetEvent::HorizontalPosition { delta });
        true
    }

    fn reset_velocity(&mut self, source: HorizontalSource, buffers: &SensorBuffers) -> bool {
        let (vel, var) = match source {
            HorizontalSource::Gps => match buffers.gps.newest() {
                Some(gps) => (gps.vel.xy(), gps.sacc * gps.sacc),
                None => return false,
            },
            // Vision carries no velocity; start from rest
            HorizontalSource::Vision => match buffers.ext_vision.newest() {
                Some(_) => (Vec2::zeros(), 0.25),
                None => return false,
            },
        };
        let delta = vel - self.state.vel.xy();
        self.state.vel.x = vel.x;
        self.state.vel.y = vel.y;
        self.zero_cov_block(VEL_NE_IDX);
        self.set_variance(VEL_N_IDX, var);
        self.set_variance(VEL_E_IDX, var);
        self.reset_status.record(StateResetEvent::HorizontalVelocity { delta });
        true
    }

    fn reset_height(&mut self, source: HeightSource, buffers: &SensorBuffers) -> bool {
        let Some((_, pos_d, var)) = self.height_observation(source, buffers, None) else {
            return false;
        };
        let delta = pos_d - self.state.pos.z;
        self.state.pos.z = pos_d;
        self.zero_cov_block(POS_D_IDX..=POS_D_IDX);
        self.set_variance(POS_D_IDX, var);
        self.reset_status.record(StateResetEvent::VerticalPosition { delta });

        if let (HeightSource::Gps, Some(gps)) = (source, buffers.gps.newest()) {
            let delta = gps.vel.z - self.state.vel.z;
            self.state.vel.z = gps.vel.z;
            self.zero_cov_block(VEL_D_IDX..=VEL_D_IDX);
            self.set_variance(VEL_D_IDX, gps.sacc * gps.sacc);
            self.reset_status.record(StateResetEvent::VerticalVelocity { delta });
        }
        true
    }

    fn reset_mag_heading(&mut self, mag: &Vec3) -> bool {
        if !mag.iter().all(|v| v.is_finite()) || mag.norm() < 1e-6 {
            return false;
        }
        let old = self.state.quat_nominal;
        let (roll, pitch, _) = old.euler_angles();

        // Level the measured field, then heading = -atan2(east, north)
        let leveled = Attitude::from_euler_angles(roll, pitch, 0.0) * mag;
        let yaw = -leveled.y.atan2(leveled.x) + self.mag_declination;

        let new = Attitude::from_euler_angles(roll, pitch, yaw);
        let delta = new * old.inverse();
        self.state.quat_nominal = new;
        self.state.mag_earth = new * mag;
        self.rot_var.z = self.rot_var.z.min(INITIAL_ROT_VAR);
        self.reset_status.record(StateResetEvent::Attitude { delta });
        true
    }

    fn align_output_filter(&mut self) {
        let (quat, vel, pos) = (self.state.quat_nominal, self.state.vel, self.state.pos);
        for out in self.outputs.iter_mut() {
            out.quat_nominal = quat;
            out.vel = vel;
            out.pos = pos;
        }
    }

    fn output_buffer_mut(&mut self) -> &mut SampleBuffer<OutputSample> {
        &mut self.outputs
    }

    fn reset_status_mut(&mut self) -> &mut ResetStatus {
        &mut self.reset_status
    }
}
