//! Linear algebra type system for the aiding layer
//!
//! State layout constants and aliases shared by the controllers and the
//! reference core. Vectors and attitudes use nalgebra; the covariance matrix
//! is an ndarray so row/column blocks can be zeroed with slice views.

use std::ops::RangeInclusive;

use nalgebra::{UnitQuaternion, Vector2, Vector3};
use ndarray::Array2;

// ===== State Dimensions =====
pub const STATE_DIM: usize = 24;

// ===== State Indices =====
pub const QUAT_IDX: RangeInclusive<usize> = 0..=3;
pub const VEL_N_IDX: usize = 4;
pub const VEL_E_IDX: usize = 5;
pub const VEL_D_IDX: usize = 6;
pub const POS_N_IDX: usize = 7;
pub const POS_E_IDX: usize = 8;
pub const POS_D_IDX: usize = 9;
pub const GYRO_BIAS_IDX: RangeInclusive<usize> = 10..=12;
pub const ACCEL_BIAS_IDX: RangeInclusive<usize> = 13..=15;
pub const MAG_EARTH_IDX: RangeInclusive<usize> = 16..=18;
pub const MAG_BODY_IDX: RangeInclusive<usize> = 19..=21;
pub const WIND_IDX: RangeInclusive<usize> = 22..=23;

pub const VEL_NE_IDX: RangeInclusive<usize> = VEL_N_IDX..=VEL_E_IDX;
pub const POS_NE_IDX: RangeInclusive<usize> = POS_N_IDX..=POS_E_IDX;

// ===== Aliases =====
pub type Vec2 = Vector2<f64>;
pub type Vec3 = Vector3<f64>;
pub type Attitude = UnitQuaternion<f64>;

/// Full state covariance [24x24]
pub type Covariance = Array2<f64>;
