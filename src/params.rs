use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AidingError, AidingResult};
use crate::status::HeightSource;
use crate::types::TimeUs;

// ─── Sensor intervals ────────────────────────────────────────────────────────

pub const BARO_MAX_INTERVAL_US: TimeUs = 200_000;
pub const GPS_MAX_INTERVAL_US: TimeUs = 500_000;
pub const RNG_MAX_INTERVAL_US: TimeUs = 200_000;
pub const EV_MAX_INTERVAL_US: TimeUs = 200_000;

/// Which aiding sources the operator allows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionMode {
    pub use_gps: bool,
    pub use_optical_flow: bool,
    pub use_ev_pos: bool,
    pub use_ev_yaw: bool,
}

impl Default for FusionMode {
    fn default() -> Self {
        Self {
            use_gps: true,
            use_optical_flow: false,
            use_ev_pos: false,
            use_ev_yaw: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MagFusionType {
    /// Heading on the ground, 3-axis once clear of ground anomalies
    #[default]
    Auto,
    Heading,
    ThreeAxis,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub gps_fail_cooldown_us: TimeUs,
    pub gps_fusion_timeout_us: TimeUs,
    pub gps_data_max_age_us: TimeUs,
    pub flow_fusion_timeout_us: TimeUs,
    pub flow_data_max_age_us: TimeUs,
    pub hgt_fusion_timeout_us: TimeUs,
    pub bad_vert_accel_memory_us: TimeUs,
    pub airspeed_timeout_us: TimeUs,
    /// Sum of roll and pitch error variances below which tilt is aligned [rad²]
    pub tilt_align_var: f64,
    /// Climb above the last on-ground height before auto 3-axis fusion [m]
    pub mag_3d_min_climb: f64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            gps_fail_cooldown_us: 5_000_000,
            gps_fusion_timeout_us: 10_000_000,
            gps_data_max_age_us: 500_000,
            flow_fusion_timeout_us: 5_000_000,
            flow_data_max_age_us: 500_000,
            hgt_fusion_timeout_us: 5_000_000,
            bad_vert_accel_memory_us: 10_000_000,
            airspeed_timeout_us: 10_000_000,
            tilt_align_var: 0.05235 * 0.05235,
            mag_3d_min_climb: 1.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AidingParams {
    // ── Source selection ──
    pub fusion_mode: FusionMode,
    pub vdist_sensor_type: HeightSource,
    pub mag_fusion_type: MagFusionType,
    /// Fuse declination even while GPS constrains yaw
    pub fuse_declination: bool,

    // ── Height reset ──
    /// Vertical position 1-sigma above which a stalled height source is reset [m]
    pub hgt_reset_lim: f64,
    /// Required GPS vertical accuracy to be trusted for height [m]
    pub req_vacc: f64,
    pub baro_noise: f64,
    pub baro_innov_gate: f64,

    // ── Optical flow ──
    pub rng_gnd_clearance: f64,
    /// Flow noise at best quality [rad/s]
    pub flow_noise: f64,
    /// Flow noise at minimum accepted quality [rad/s]
    pub flow_noise_qual_min: f64,
    pub flow_qual_min: u8,

    // ── Sensor intervals ──
    pub baro_max_interval_us: TimeUs,
    pub gps_max_interval_us: TimeUs,
    pub rng_max_interval_us: TimeUs,
    pub ev_max_interval_us: TimeUs,

    pub timeouts: Timeouts,
}

impl Default for AidingParams {
    fn default() -> Self {
        Self {
            fusion_mode: FusionMode::default(),
            vdist_sensor_type: HeightSource::Baro,
            mag_fusion_type: MagFusionType::Auto,
            fuse_declination: true,
            hgt_reset_lim: 5.0,
            req_vacc: 8.0,
            baro_noise: 2.0,
            baro_innov_gate: 5.0,
            rng_gnd_clearance: 0.1,
            flow_noise: 0.15,
            flow_noise_qual_min: 0.5,
            flow_qual_min: 1,
            baro_max_interval_us: BARO_MAX_INTERVAL_US,
            gps_max_interval_us: GPS_MAX_INTERVAL_US,
            rng_max_interval_us: RNG_MAX_INTERVAL_US,
            ev_max_interval_us: EV_MAX_INTERVAL_US,
            timeouts: Timeouts::default(),
        }
    }
}

fn require_positive(name: &'static str, value: f64) -> AidingResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(AidingError::InvalidParameter {
            name,
            reason: format!("must be positive and finite, got {value}"),
        })
    }
}

fn require_nonzero(name: &'static str, value: TimeUs) -> AidingResult<()> {
    if value > 0 {
        Ok(())
    } else {
        Err(AidingError::InvalidParameter {
            name,
            reason: "must be non-zero".to_string(),
        })
    }
}

impl AidingParams {
    /// Load a (possibly partial) JSON parameter file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> AidingResult<Self> {
        let reader = BufReader::new(File::open(path)?);
        let params: AidingParams = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_str(json: &str) -> AidingResult<Self> {
        let params: AidingParams = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> AidingResult<()> {
        require_positive("hgt_reset_lim", self.hgt_reset_lim)?;
        require_positive("req_vacc", self.req_vacc)?;
        require_positive("baro_noise", self.baro_noise)?;
        require_positive("baro_innov_gate", self.baro_innov_gate)?;
        require_positive("flow_noise", self.flow_noise)?;
        require_positive("flow_noise_qual_min", self.flow_noise_qual_min)?;
        require_positive("timeouts.tilt_align_var", self.timeouts.tilt_align_var)?;
        if !(self.rng_gnd_clearance.is_finite() && self.rng_gnd_clearance >= 0.0) {
            return Err(AidingError::InvalidParameter {
                name: "rng_gnd_clearance",
                reason: format!("must be non-negative, got {}", self.rng_gnd_clearance),
            });
        }
        require_nonzero("baro_max_interval_us", self.baro_max_interval_us)?;
        require_nonzero("gps_max_interval_us", self.gps_max_interval_us)?;
        require_nonzero("rng_max_interval_us", self.rng_max_interval_us)?;
        require_nonzero("ev_max_interval_us", self.ev_max_interval_us)?;
        Ok(())
    }

    /// Height reset limit squared, compared against the vertical position variance.
    pub fn hgt_reset_var(&self) -> f64 {
        self.hgt_reset_lim * self.hgt_reset_lim
    }
}
