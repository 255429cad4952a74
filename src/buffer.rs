// buffer.rs — Time-indexed sample history and the driver hand-off queue
//
// Drivers run on their own threads and only ever push into a `SampleInbox`.
// The estimator thread drains every inbox into its `SampleBuffer` at the start
// of a cycle, so the arbitration layer itself never needs a lock.

use std::collections::VecDeque;

use crossbeam::queue::ArrayQueue;

use crate::error::{AidingError, AidingResult};
use crate::types::{
    AirspeedSample, BaroSample, ExtVisionSample, FlowSample, GpsSample, MagSample, RangeSample,
    TimeUs, Timestamped,
};

// ─── Ring buffer ─────────────────────────────────────────────────────────────

/// Bounded, time-ordered history. Pushing into a full buffer evicts the oldest
/// sample. Index 0 is the oldest sample.
#[derive(Clone, Debug)]
pub struct SampleBuffer<T> {
    samples: VecDeque<T>,
    capacity: usize,
}

impl<T: Timestamped> SampleBuffer<T> {
    pub fn new(capacity: usize) -> AidingResult<Self> {
        if capacity == 0 {
            return Err(AidingError::ZeroCapacity);
        }
        Ok(Self::bounded(capacity))
    }

    pub(crate) fn bounded(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: T) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn newest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.samples.front()
    }

    /// Newest sample not later than `horizon_us`, i.e. the sample that has
    /// fallen behind the fusion horizon.
    pub fn sample_near(&self, horizon_us: TimeUs) -> Option<&T> {
        self.samples
            .iter()
            .rev()
            .find(|s| s.time_us() <= horizon_us)
    }

    /// True when the newest sample is strictly younger than `max_age_us`.
    pub fn is_fresh(&self, now_us: TimeUs, max_age_us: TimeUs) -> bool {
        self.newest()
            .map(|s| now_us.saturating_sub(s.time_us()) < max_age_us)
            .unwrap_or(false)
    }

    pub fn get_from_index(&self, index: usize) -> Option<&T> {
        self.samples.get(index)
    }

    /// Overwrite the sample at `index`. Returns false when out of range.
    pub fn push_to_index(&mut self, index: usize, sample: T) -> bool {
        match self.samples.get_mut(index) {
            Some(slot) => {
                *slot = sample;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.samples.iter_mut()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

// ─── Driver hand-off ─────────────────────────────────────────────────────────

/// Lock-free bounded queue between one driver thread and the estimator thread.
pub struct SampleInbox<T> {
    queue: ArrayQueue<T>,
}

impl<T: Timestamped> SampleInbox<T> {
    pub fn new(capacity: usize) -> AidingResult<Self> {
        if capacity == 0 {
            return Err(AidingError::ZeroCapacity);
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
        })
    }

    /// Queue a sample, overwriting the oldest queued one when full.
    /// Returns the overwritten sample, if any.
    pub fn push(&self, sample: T) -> Option<T> {
        self.queue.force_push(sample)
    }

    /// Move every queued sample into `buffer`. Returns the number moved.
    pub fn drain_into(&self, buffer: &mut SampleBuffer<T>) -> usize {
        let mut moved = 0;
        while let Some(sample) = self.queue.pop() {
            buffer.push(sample);
            moved += 1;
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ─── Per-sensor buffers ──────────────────────────────────────────────────────

/// One history per aiding sensor. Owned by the caller and lent read-only to
/// the controllers each cycle.
#[derive(Clone, Debug)]
pub struct SensorBuffers {
    pub gps: SampleBuffer<GpsSample>,
    pub baro: SampleBuffer<BaroSample>,
    pub range: SampleBuffer<RangeSample>,
    pub ext_vision: SampleBuffer<ExtVisionSample>,
    pub flow: SampleBuffer<FlowSample>,
    pub mag: SampleBuffer<MagSample>,
    pub airspeed: SampleBuffer<AirspeedSample>,
}

impl SensorBuffers {
    pub fn new(capacity: usize) -> AidingResult<Self> {
        Ok(Self {
            gps: SampleBuffer::new(capacity)?,
            baro: SampleBuffer::new(capacity)?,
            range: SampleBuffer::new(capacity)?,
            ext_vision: SampleBuffer::new(capacity)?,
            flow: SampleBuffer::new(capacity)?,
            mag: SampleBuffer::new(capacity)?,
            airspeed: SampleBuffer::new(capacity)?,
        })
    }
}

impl Default for SensorBuffers {
    fn default() -> Self {
        let capacity = 12;
        Self {
            gps: SampleBuffer::bounded(capacity),
            baro: SampleBuffer::bounded(capacity),
            range: SampleBuffer::bounded(capacity),
            ext_vision: SampleBuffer::bounded(capacity),
            flow: SampleBuffer::bounded(capacity),
            mag: SampleBuffer::bounded(capacity),
            airspeed: SampleBuffer::bounded(capacity),
        }
    }
}
