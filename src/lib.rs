//! Aiding-source arbitration for an inertial navigation EKF.
//!
//! Every estimator cycle [`AidingControl::update`] decides which aiding
//! sensors (GPS, baro, rangefinder, external vision, optical flow,
//! magnetometer, airspeed) may correct the state, detects sources that went
//! stale or inconsistent, and asks the [`EstimatorCore`] for the resets that
//! keep the estimate continuous across a source switch.

pub mod buffer;
pub mod control;
pub mod error;
pub mod estimator;
pub mod health;
pub mod params;
pub mod reset;
pub mod status;
pub mod types;

pub use buffer::{SampleBuffer, SampleInbox, SensorBuffers};
pub use control::{AidingControl, AidingEvent, CycleClock};
pub use error::{AidingError, AidingResult};
pub use estimator::{EstimatorCore, HorizontalSource, InnovationChannel, ReferenceCore};
pub use health::{AidingSource, StalenessTracker};
pub use params::{AidingParams, FusionMode, MagFusionType};
pub use reset::{ResetCounters, StateResetEvent};
pub use status::{ControlStatus, HeightSource, MagMode};
