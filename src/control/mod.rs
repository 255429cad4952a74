// control/mod.rs — Aiding-source arbitration, one pass per estimator cycle
//
// Pure policy layer: decides which aiding sources may correct the estimate,
// detects stale or inconsistent sources and asks the core to reset. No Kalman
// math happens here.
//
// Ordering within a cycle:
//   1. snapshot the settled status as `prev`
//   2. declination update, tilt alignment monitor
//   3. vision → optical flow → GPS → height → magnetometer
//   4. pending reset deltas are applied to the output history
//
// Controllers read their activation preconditions from `prev` and write into
// the working status, so a flag raised this cycle takes effect next cycle.
// Vision yaw is the exception: claiming it removes the magnetometer modes from
// the working status, which the magnetometer controller honours immediately.

mod flow;
mod gps;
mod height;
mod mag;
mod vision;

pub use flow::control_optical_flow;
pub use gps::control_gps;
pub use height::{control_height, select_height_reset, HeightTimeoutInputs};
pub use mag::control_mag;
pub use vision::control_vision;

use serde::Serialize;

use crate::buffer::{SampleBuffer, SensorBuffers};
use crate::error::AidingResult;
use crate::estimator::EstimatorCore;
use crate::health::StalenessTracker;
use crate::params::AidingParams;
use crate::reset::apply_to_outputs;
use crate::status::{ControlStatus, HeightSource, MagMode};
use crate::types::{elapsed_us, TimeUs, Timestamped, Vec2};

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum AidingEvent {
    TiltAligned { yaw_aligned: bool },
    VisionPositionStarted,
    VisionPositionResetFailed,
    VisionYawStarted { yaw_change: f64 },
    FlowStarted,
    FlowDisabled,
    FlowLost { anchor: Vec2 },
    GpsStarted,
    GpsActivationFailed,
    GpsDisabled,
    GpsLost { anchor: Vec2 },
    GpsResetToMeasurement,
    GpsResetFailed,
    InertialFaultSuspected,
    HeightReset { from: HeightSource, to: HeightSource },
    HeightResetDenied { source: HeightSource },
    HeightResetFailed { from: HeightSource, to: HeightSource },
    HeightSourceSelected { source: HeightSource },
    MagModeChanged { from: MagMode, to: MagMode },
    DeclinationFusion { enabled: bool },
    WindValidity { valid: bool },
}

impl AidingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TiltAligned { .. } => "tilt_aligned",
            Self::VisionPositionStarted => "vision_position_started",
            Self::VisionPositionResetFailed => "vision_position_reset_failed",
            Self::VisionYawStarted { .. } => "vision_yaw_started",
            Self::FlowStarted => "flow_started",
            Self::FlowDisabled => "flow_disabled",
            Self::FlowLost { .. } => "flow_lost",
            Self::GpsStarted => "gps_started",
            Self::GpsActivationFailed => "gps_activation_failed",
            Self::GpsDisabled => "gps_disabled",
            Self::GpsLost { .. } => "gps_lost",
            Self::GpsResetToMeasurement => "gps_reset_to_measurement",
            Self::GpsResetFailed => "gps_reset_failed",
            Self::InertialFaultSuspected => "inertial_fault_suspected",
            Self::HeightReset { .. } => "height_reset",
            Self::HeightResetDenied { .. } => "height_reset_denied",
            Self::HeightResetFailed { .. } => "height_reset_failed",
            Self::HeightSourceSelected { .. } => "height_source_selected",
            Self::MagModeChanged { .. } => "mag_mode_changed",
            Self::DeclinationFusion { .. } => "declination_fusion",
            Self::WindValidity { .. } => "wind_validity",
        }
    }
}

// ─── Cycle inputs ────────────────────────────────────────────────────────────

/// `now_us` is the newest IMU time; `horizon_us` the delayed IMU time at the
/// fusion horizon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleClock {
    pub now_us: TimeUs,
    pub horizon_us: TimeUs,
}

/// Read-only inputs shared by every controller in one cycle.
pub struct CycleContext<'a> {
    pub clock: CycleClock,
    pub params: &'a AidingParams,
    pub buffers: &'a SensorBuffers,
    pub prev: ControlStatus,
}

impl CycleContext<'_> {
    /// True when the sample at the fusion horizon is younger than `max_age_us`.
    pub fn horizon_fresh<T: Timestamped>(&self, buffer: &SampleBuffer<T>, max_age_us: TimeUs) -> bool {
        buffer
            .sample_near(self.clock.horizon_us)
            .map_or(false, |s| elapsed_us(self.clock.horizon_us, s.time_us()) < max_age_us)
    }
}

/// State owned by the arbitration layer across cycles.
#[derive(Clone, Debug, Default)]
pub struct AidingState {
    pub status: ControlStatus,
    pub health: StalenessTracker,
    /// Frozen position used as a pseudo-observation once aiding is lost
    pub last_known_pos_ne: Vec2,
    /// Vertical position recorded while on the ground, NED [m]
    pub last_on_ground_pos_d: f64,
}

/// Attempt a yaw reset from the newest magnetometer sample.
pub(crate) fn reset_heading_from_mag<C: EstimatorCore>(core: &mut C, buffers: &SensorBuffers) -> bool {
    buffers
        .mag
        .newest()
        .map_or(false, |sample| core.reset_mag_heading(&sample.mag))
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

pub struct AidingControl {
    params: AidingParams,
    state: AidingState,
    prev: ControlStatus,
}

impl AidingControl {
    pub fn new(params: AidingParams) -> AidingResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            state: AidingState::default(),
            prev: ControlStatus::default(),
        })
    }

    pub fn params(&self) -> &AidingParams {
        &self.params
    }

    pub fn status(&self) -> &ControlStatus {
        &self.state.status
    }

    /// Status as it stood at the start of the last cycle.
    pub fn previous_status(&self) -> &ControlStatus {
        &self.prev
    }

    pub fn health(&self) -> &StalenessTracker {
        &self.state.health
    }

    /// Fusion outcomes are reported here by the core.
    pub fn health_mut(&mut self) -> &mut StalenessTracker {
        &mut self.state.health
    }

    pub fn last_known_pos_ne(&self) -> Vec2 {
        self.state.last_known_pos_ne
    }

    pub fn last_on_ground_pos_d(&self) -> f64 {
        self.state.last_on_ground_pos_d
    }

    /// Land detector input.
    pub fn set_in_air(&mut self, in_air: bool) {
        self.state.status.in_air = in_air;
    }

    /// Run one arbitration cycle.
    pub fn update<C: EstimatorCore>(
        &mut self,
        clock: CycleClock,
        buffers: &SensorBuffers,
        core: &mut C,
    ) -> Vec<AidingEvent> {
        let mut events = Vec::new();
        self.prev = self.state.status;

        core.update_mag_declination();

        if !self.state.status.tilt_align {
            let var = core.rotation_variances();
            if var.x + var.y < self.params.timeouts.tilt_align_var {
                let yaw_aligned = reset_heading_from_mag(core, buffers);
                self.state.status.tilt_align = true;
                self.state.status.yaw_align = yaw_aligned;
                log::info!("tilt alignment complete (yaw aligned: {})", yaw_aligned);
                events.push(AidingEvent::TiltAligned { yaw_aligned });
            }
        }

        let ctx = CycleContext {
            clock,
            params: &self.params,
            buffers,
            prev: self.prev,
        };
        events.extend(control_vision(&ctx, &mut self.state, core));
        events.extend(control_optical_flow(&ctx, &mut self.state, core));
        events.extend(control_gps(&ctx, &mut self.state, core));
        events.extend(control_height(&ctx, &mut self.state, core));
        events.extend(control_mag(&ctx, &mut self.state, core));

        for event in core.reset_status_mut().take_pending() {
            apply_to_outputs(core.output_buffer_mut().iter_mut(), &event);
        }

        for (flag, set) in self.state.status.transitions(&self.prev) {
            log::debug!("status {} -> {}", flag, set);
        }

        events
    }
}
