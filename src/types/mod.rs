pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};

/// Microseconds on the estimator clock.
pub type TimeUs = u64;

/// Elapsed microseconds from `then` to `now`, clamped at zero.
pub fn elapsed_us(now: TimeUs, then: TimeUs) -> TimeUs {
    now.saturating_sub(then)
}

/// Elapsed microseconds since an optional event. `None` means "never", which
/// is infinitely old.
pub fn elapsed_since(now: TimeUs, then: Option<TimeUs>) -> TimeUs {
    then.map(|t| elapsed_us(now, t)).unwrap_or(TimeUs::MAX)
}

pub trait Timestamped {
    fn time_us(&self) -> TimeUs;
}

macro_rules! impl_timestamped {
    ($($ty:ty),* $(,)?) => {
        $(impl Timestamped for $ty {
            fn time_us(&self) -> TimeUs {
                self.time_us
            }
        })*
    };
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsSample {
    pub time_us: TimeUs,
    /// North/East position relative to the local origin [m]
    pub pos: Vec2,
    /// Height above the origin, up positive [m]
    pub hgt: f64,
    /// NED velocity [m/s]
    pub vel: Vec3,
    /// Reported horizontal accuracy [m]
    pub hacc: f64,
    /// Reported vertical accuracy [m]
    pub vacc: f64,
    /// Reported speed accuracy [m/s]
    pub sacc: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BaroSample {
    pub time_us: TimeUs,
    /// Barometric height, up positive [m]
    pub hgt: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RangeSample {
    pub time_us: TimeUs,
    /// Slant range along the sensor axis [m]
    pub rng: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExtVisionSample {
    pub time_us: TimeUs,
    /// NED position in the vision frame [m]
    pub pos: Vec3,
    pub quat: Attitude,
    /// 1-sigma position error [m]
    pub pos_err: f64,
    /// 1-sigma angular error [rad]
    pub ang_err: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlowSample {
    pub time_us: TimeUs,
    /// Integrated flow about body X/Y, motion compensated [rad]
    pub flow_rad_xy_comp: Vec2,
    /// Integrated gyro over the same interval [rad]
    pub gyro_xyz: Vec3,
    /// Integration interval [s]
    pub dt: f64,
    /// Sensor quality 0..=255
    pub quality: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MagSample {
    pub time_us: TimeUs,
    /// Body frame field [gauss]
    pub mag: Vec3,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AirspeedSample {
    pub time_us: TimeUs,
    pub true_airspeed: f64,
    pub eas2tas: f64,
}

/// Output predictor sample. The only buffered type corrected in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutputSample {
    pub time_us: TimeUs,
    pub quat_nominal: Attitude,
    pub vel: Vec3,
    pub pos: Vec3,
}

impl_timestamped!(
    GpsSample,
    BaroSample,
    RangeSample,
    ExtVisionSample,
    FlowSample,
    MagSample,
    AirspeedSample,
    OutputSample,
);

/// Navigation states the arbitration layer reads and occasionally overwrites.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavState {
    pub quat_nominal: Attitude,
    /// NED velocity [m/s]
    pub vel: Vec3,
    /// NED position [m]
    pub pos: Vec3,
    /// Earth frame magnetic field [gauss]
    pub mag_earth: Vec3,
    /// Body frame magnetic bias [gauss]
    pub mag_body: Vec3,
    /// NE wind velocity [m/s]
    pub wind_vel: Vec2,
}

impl Default for NavState {
    fn default() -> Self {
        Self {
            quat_nominal: Attitude::identity(),
            vel: Vec3::zeros(),
            pos: Vec3::zeros(),
            mag_earth: Vec3::zeros(),
            mag_body: Vec3::zeros(),
            wind_vel: Vec2::zeros(),
        }
    }
}
