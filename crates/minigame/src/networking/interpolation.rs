//! Snapshot interpolation for remote entities.
//!
//! Remote poses arrive at the session's rate, not the frame rate. Every pose is
//! stored with its arrival time and remote entities are rendered a fixed delay
//! in the past, between the two snapshots bracketing that instant. Entities
//! under local physics control get a velocity nudge towards the interpolated
//! target instead of having their position overwritten.

use std::collections::VecDeque;
use std::sync::Arc;

use bevy::math::Vec2;

use crate::clock::Clock;
use crate::config::SyncSettings;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot {
    pub x: f32,
    pub y: f32,
    pub timestamp: f64,
}

impl Snapshot {
    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }
}

/// Bounded buffer of snapshots, strictly ordered by timestamp.
#[derive(Clone, Debug)]
pub struct SnapshotBuffer {
    samples: VecDeque<Snapshot>,
    capacity: usize,
}

impl SnapshotBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
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

    pub fn latest(&self) -> Option<&Snapshot> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&Snapshot> {
        self.samples.front()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Append a snapshot, evicting the oldest beyond capacity.
    ///
    /// Snapshots older than the newest one are rejected; one with the same
    /// timestamp replaces it. Returns whether the buffer changed.
    pub fn push(&mut self, snapshot: Snapshot) -> bool {
        if let Some(latest) = self.samples.back_mut() {
            if snapshot.timestamp < latest.timestamp {
                return false;
            }
            if snapshot.timestamp == latest.timestamp {
                *latest = snapshot;
                return true;
            }
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(snapshot);
        true
    }

    /// Position at `render_time`.
    ///
    /// `None` with fewer than two samples. Clamps to the newest sample when
    /// `render_time` is past it and to the oldest when before it.
    pub fn sample(&self, render_time: f64) -> Option<Vec2> {
        if self.samples.len() < 2 {
            return None;
        }
        let (oldest, latest) = (self.samples.front()?, self.samples.back()?);
        if render_time >= latest.timestamp {
            return Some(latest.position());
        }
        if render_time <= oldest.timestamp {
            return Some(oldest.position());
        }

        let (from, to) = self
            .samples
            .iter()
            .zip(self.samples.iter().skip(1))
            .find(|(_, to)| to.timestamp >= render_time)?;
        let span = to.timestamp - from.timestamp;
        let t = ((render_time - from.timestamp) / span) as f32;
        Some(from.position().lerp(to.position(), t))
    }
}

/// Per-entity interpolator reading time from a [`Clock`].
#[derive(Clone, Debug)]
pub struct SnapshotInterpolator {
    buffer: SnapshotBuffer,
    delay_ms: f64,
    clock: Arc<dyn Clock>,
}

impl SnapshotInterpolator {
    pub fn new(settings: &SyncSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            buffer: SnapshotBuffer::new(settings.buffer_capacity),
            delay_ms: settings.interpolation_delay_ms,
            clock,
        }
    }

    /// Record a pose received now.
    pub fn add_snapshot(&mut self, x: f32, y: f32) -> bool {
        let timestamp = self.clock.now_ms();
        self.buffer.push(Snapshot { x, y, timestamp })
    }

    /// Smoothed position for this frame, `None` until two poses arrived.
    pub fn render(&self) -> Option<Vec2> {
        self.buffer.sample(self.clock.now_ms() - self.delay_ms)
    }

    pub fn buffer(&self) -> &SnapshotBuffer {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Outcome of steering a physics-driven entity towards its target.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Correction {
    /// Desync too large: place the entity at the target.
    Snap(Vec2),
    /// Set this velocity.
    Velocity(Vec2),
    /// Close enough: zero the velocity.
    Stop,
}

pub fn velocity_correction(current: Vec2, target: Vec2, settings: &SyncSettings) -> Correction {
    let error = target - current;
    let distance = error.length();
    if distance > settings.teleport_threshold {
        Correction::Snap(target)
    } else if distance < settings.stop_threshold {
        Correction::Stop
    } else {
        Correction::Velocity((error * settings.correction_gain).clamp_length_max(settings.max_correction_speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn snapshot(x: f32, timestamp: f64) -> Snapshot {
        Snapshot {
            x,
            y: 0.0,
            timestamp,
        }
    }

    #[test]
    fn test_render_needs_two_samples() {
        let clock = Arc::new(ManualClock::new(1000.0));
        let mut interp = SnapshotInterpolator::new(&SyncSettings::default(), clock.clone());
        assert_eq!(interp.render(), None);
        interp.add_snapshot(1.0, 1.0);
        clock.advance(500.0);
        assert_eq!(interp.render(), None);
        clock.advance(50.0);
        interp.add_snapshot(2.0, 2.0);
        assert!(interp.render().is_some());
    }

    #[test]
    fn test_render_interpolates_between_bracketing_pair() {
        let clock = Arc::new(ManualClock::new(0.0));
        let mut interp = SnapshotInterpolator::new(&SyncSettings::default(), clock.clone());
        interp.add_snapshot(0.0, 0.0);
        clock.set(100.0);
        interp.add_snapshot(100.0, 50.0);
        clock.set(200.0);
        interp.add_snapshot(300.0, 50.0);

        // render time 150 -> halfway between the 100 and 200 samples
        clock.set(250.0);
        assert_eq!(interp.render(), Some(Vec2::new(200.0, 50.0)));

        // render time beyond the newest sample clamps to it
        clock.set(1000.0);
        assert_eq!(interp.render(), Some(Vec2::new(300.0, 50.0)));
    }

    #[test]
    fn test_sample_is_bounded_by_its_bracket() {
        let mut buffer = SnapshotBuffer::new(30);
        let xs = [0.0, 40.0, -10.0, 25.0, 25.0, 90.0];
        for (i, x) in xs.iter().enumerate() {
            buffer.push(snapshot(*x, i as f64 * 50.0));
        }
        for step in 0..=250 {
            let t = step as f64;
            let x = buffer.sample(t).unwrap().x;
            let i = ((t / 50.0).floor() as usize).min(xs.len() - 2);
            let (lo, hi) = (xs[i].min(xs[i + 1]), xs[i].max(xs[i + 1]));
            assert!(x >= lo - 1e-3 && x <= hi + 1e-3, "t={t} x={x}");
        }
    }

    #[test]
    fn test_before_oldest_clamps_to_oldest() {
        let mut buffer = SnapshotBuffer::new(30);
        buffer.push(snapshot(5.0, 100.0));
        buffer.push(snapshot(9.0, 200.0));
        assert_eq!(buffer.sample(0.0), Some(Vec2::new(5.0, 0.0)));
    }

    #[test]
    fn test_buffer_is_bounded_and_monotonic() {
        let mut buffer = SnapshotBuffer::new(3);
        for i in 0..5 {
            assert!(buffer.push(snapshot(i as f32, i as f64)));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.oldest().unwrap().timestamp, 2.0);

        assert!(!buffer.push(snapshot(99.0, 1.0)));
        assert!(buffer.push(snapshot(7.0, 4.0)));
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest().unwrap().x, 7.0);
    }

    #[test]
    fn test_velocity_correction_ranges() {
        let settings = SyncSettings::default();
        let origin = Vec2::ZERO;

        assert_eq!(
            velocity_correction(origin, Vec2::new(1000.0, 0.0), &settings),
            Correction::Snap(Vec2::new(1000.0, 0.0))
        );
        assert_eq!(
            velocity_correction(origin, Vec2::new(1.0, 0.0), &settings),
            Correction::Stop
        );
        assert_eq!(
            velocity_correction(origin, Vec2::new(0.0, 10.0), &settings),
            Correction::Velocity(Vec2::new(0.0, 100.0))
        );
        let Correction::Velocity(capped) = velocity_correction(origin, Vec2::new(150.0, 0.0), &settings)
        else {
            panic!("expected a velocity correction");
        };
        assert_eq!(capped.length(), settings.max_correction_speed);
    }
}
