// reset.rs — State reset events and retroactive output correction
//
// A reset records the delta it applied and bumps a per-category counter.
// Downstream consumers watch the counters to notice a discontinuity; the
// output predictor history is corrected by draining the pending deltas once.

use serde::{Deserialize, Serialize};

use crate::types::{Attitude, OutputSample, Vec2};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateResetEvent {
    Attitude { delta: Attitude },
    HorizontalPosition { delta: Vec2 },
    HorizontalVelocity { delta: Vec2 },
    VerticalPosition { delta: f64 },
    VerticalVelocity { delta: f64 },
}

/// Monotonic (wrapping) reset counters, one per category
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetCounters {
    pub quat: u8,
    pub pos_ne: u8,
    pub vel_ne: u8,
    pub pos_d: u8,
    pub vel_d: u8,
}

#[derive(Clone, Debug, Default)]
pub struct ResetStatus {
    counters: ResetCounters,
    pending: Vec<StateResetEvent>,
}

impl ResetStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: StateResetEvent) {
        let counter = match event {
            StateResetEvent::Attitude { .. } => &mut self.counters.quat,
            StateResetEvent::HorizontalPosition { .. } => &mut self.counters.pos_ne,
            StateResetEvent::HorizontalVelocity { .. } => &mut self.counters.vel_ne,
            StateResetEvent::VerticalPosition { .. } => &mut self.counters.pos_d,
            StateResetEvent::VerticalVelocity { .. } => &mut self.counters.vel_d,
        };
        *counter = counter.wrapping_add(1);
        self.pending.push(event);
    }

    pub fn counters(&self) -> ResetCounters {
        self.counters
    }

    /// Hand over the pending events. Each event is returned exactly once.
    pub fn take_pending(&mut self) -> Vec<StateResetEvent> {
        std::mem::take(&mut self.pending)
    }
}

/// Apply one reset delta to every sample yielded by `outputs`.
pub fn apply_to_outputs<'a, I>(outputs: I, event: &StateResetEvent)
where
    I: IntoIterator<Item = &'a mut OutputSample>,
{
    for out in outputs {
        match event {
            StateResetEvent::Attitude { delta } => {
                out.quat_nominal = delta * out.quat_nominal;
            }
            StateResetEvent::HorizontalPosition { delta } => {
                out.pos.x += delta.x;
                out.pos.y += delta.y;
            }
            StateResetEvent::HorizontalVelocity { delta } => {
                out.vel.x += delta.x;
                out.vel.y += delta.y;
            }
            StateResetEvent::VerticalPosition { delta } => out.pos.z += delta,
            StateResetEvent::VerticalVelocity { delta } => out.vel.z += delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;
    use approx::assert_relative_eq;

    fn output(time_us: u64, yaw: f64) -> OutputSample {
        OutputSample {
            time_us,
            quat_nominal: Attitude::from_euler_angles(0.0, 0.0, yaw),
            vel: Vec3::new(1.0, 2.0, 3.0),
            pos: Vec3::new(10.0, 20.0, -5.0),
        }
    }

    #[test]
    fn test_counters_wrap() {
        let mut status = ResetStatus::new();
        for _ in 0..256 {
            status.record(StateResetEvent::VerticalPosition { delta: 1.0 });
        }
        assert_eq!(status.counters().pos_d, 0);
        assert_eq!(status.take_pending().len(), 256);
    }

    #[test]
    fn test_pending_consumed_once() {
        let mut status = ResetStatus::new();
        status.record(StateResetEvent::HorizontalVelocity {
            delta: Vec2::new(1.0, 0.0),
        });
        assert_eq!(status.take_pending().len(), 1);
        assert!(status.take_pending().is_empty());
        assert_eq!(status.counters().vel_ne, 1);
    }

    #[test]
    fn test_attitude_delta_rotates_history() {
        let mut history = vec![output(0, 0.1), output(1, 0.2)];
        let delta = Attitude::from_euler_angles(0.0, 0.0, 0.5);

        apply_to_outputs(history.iter_mut(), &StateResetEvent::Attitude { delta });

        assert_relative_eq!(history[0].quat_nominal.euler_angles().2, 0.6, epsilon = 1e-9);
        assert_relative_eq!(history[1].quat_nominal.euler_angles().2, 0.7, epsilon = 1e-9);
    }

    #[test]
    fn test_position_delta_shifts_history() {
        let mut history = vec![output(0, 0.0)];
        apply_to_outputs(
            history.iter_mut(),
            &StateResetEvent::HorizontalPosition {
                delta: Vec2::new(-10.0, 5.0),
            },
        );
        apply_to_outputs(
            history.iter_mut(),
            &StateResetEvent::VerticalPosition { delta: 2.0 },
        );

        assert_relative_eq!(history[0].pos, Vec3::new(0.0, 25.0, -3.0));
    }
}
