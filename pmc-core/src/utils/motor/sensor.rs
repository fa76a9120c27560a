//! Ride distance sources for the ramp controller.
//!
//! A ride is the stretch between two ramp starts. [`EncoderSensor`] measures it
//! from encoder pulses, [`TimedDistance`] estimates it from elapsed time for
//! wheels without an encoder.

use super::encoder::{EncoderTracker, ENCODER_TIMEOUT_MS};

/// Distance and speed of the current ride of one wheel.
pub trait RideSensor {
    /// Mark the start of a new ride.
    fn start_ride(&mut self, now_ms: u32);
    /// Freeze whatever must not advance once the wheel is stopped.
    fn end_ride(&mut self, now_ms: u32);
    fn distance_mm(&self, now_ms: u32) -> u32;
    fn speed_cm_per_s(&self, now_ms: u32) -> u32;
    /// No motion evidence for longer than the encoder timeout.
    fn stalled(&self, now_ms: u32) -> bool;
    /// Pulses counted since power-up, 0 without an encoder.
    fn pulse_count(&self) -> u32;
}

/// Encoder-backed ride measurement.
///
/// Only reads the tracker, so the pulse interrupt stays its single writer.
pub struct EncoderSensor<'a> {
    tracker: &'a EncoderTracker<'a>,
    ride_base: u32,
    ride_start_ms: u32,
}

impl<'a> EncoderSensor<'a> {
    pub fn new(tracker: &'a EncoderTracker<'a>) -> Self {
        Self {
            tracker,
            ride_base: tracker.count(),
            ride_start_ms: 0,
        }
    }

    pub fn tracker(&self) -> &EncoderTracker<'a> {
        self.tracker
    }

    /// Pulses since ride start.
    pub fn ride_pulses(&self) -> u32 {
        self.tracker.count().wrapping_sub(self.ride_base)
    }

    pub fn average_speed_cm_per_s(&self, now_ms: u32) -> u32 {
        self.tracker.average_speed_cm_per_s(now_ms)
    }
}

impl RideSensor for EncoderSensor<'_> {
    fn start_ride(&mut self, now_ms: u32) {
        self.ride_base = self.tracker.count();
        self.ride_start_ms = now_ms;
    }

    fn end_ride(&mut self, _now_ms: u32) {}

    fn distance_mm(&self, _now_ms: u32) -> u32 {
        self.ride_pulses() * self.tracker.mm_per_pulse()
    }

    fn speed_cm_per_s(&self, now_ms: u32) -> u32 {
        self.tracker.speed_cm_per_s(now_ms)
    }

    fn stalled(&self, now_ms: u32) -> bool {
        let last_pulse = self.tracker.last_pulse_ms();
        let last_evidence = if (last_pulse.wrapping_sub(self.ride_start_ms) as i32) > 0 {
            last_pulse
        } else {
            self.ride_start_ms
        };
        now_ms.wrapping_sub(last_evidence) > ENCODER_TIMEOUT_MS
    }

    fn pulse_count(&self) -> u32 {
        self.tracker.count()
    }
}

/// Time-based distance estimate for wheels without an encoder.
///
/// Calibrated with the wheel speed at drive duty and the time the motor needs
/// before it starts turning.
pub struct TimedDistance {
    millimeter_per_second: u32,
    start_delay_ms: u32,
    ride_start_ms: Option<u32>,
    frozen_mm: u32,
}

impl TimedDistance {
    pub fn new(
        millimeter_per_second: u32,
        start_delay_ms: u32,
    ) -> Self {
        Self {
            millimeter_per_second,
            start_delay_ms,
            ride_start_ms: None,
            frozen_mm: 0,
        }
    }

    fn moving_ms(
        &self,
        start_ms: u32,
        now_ms: u32,
    ) -> u32 {
        now_ms
            .wrapping_sub(start_ms)
            .saturating_sub(self.start_delay_ms)
    }
}

impl RideSensor for TimedDistance {
    fn start_ride(&mut self, now_ms: u32) {
        self.ride_start_ms = Some(now_ms);
        self.frozen_mm = 0;
    }

    fn end_ride(&mut self, now_ms: u32) {
        self.frozen_mm = self.distance_mm(now_ms);
        self.ride_start_ms = None;
    }

    fn distance_mm(&self, now_ms: u32) -> u32 {
        match self.ride_start_ms {
            Some(start) => {
                let mm = self.moving_ms(start, now_ms) as u64 * self.millimeter_per_second as u64 / 1000;
                mm.min(u32::MAX as u64) as u32
            }
            None => self.frozen_mm,
        }
    }

    fn speed_cm_per_s(&self, now_ms: u32) -> u32 {
        match self.ride_start_ms {
            Some(start) if self.moving_ms(start, now_ms) > 0 => self.millimeter_per_second / 10,
            _ => 0,
        }
    }

    fn stalled(&self, _now_ms: u32) -> bool {
        false
    }

    fn pulse_count(&self) -> u32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::motor::encoder::{ChangeFlag, MILLIMETER_PER_PULSE};

    #[test]
    fn test_ride_distance_restarts_at_ride_start() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        tracker.on_pulse(100);
        tracker.on_pulse(120);
        let mut sensor = EncoderSensor::new(&tracker);
        assert_eq!(sensor.distance_mm(120), 0);

        tracker.on_pulse(140);
        assert_eq!(sensor.distance_mm(140), 11);

        sensor.start_ride(150);
        assert_eq!(sensor.distance_mm(150), 0);
        tracker.on_pulse(160);
        tracker.on_pulse(180);
        assert_eq!(sensor.distance_mm(180), 22);
        assert_eq!(sensor.pulse_count(), 5);
    }

    #[test]
    fn test_stall_measured_from_ride_start() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        let mut sensor = EncoderSensor::new(&tracker);
        sensor.start_ride(1000);
        assert!(!sensor.stalled(1000 + ENCODER_TIMEOUT_MS));
        assert!(sensor.stalled(1001 + ENCODER_TIMEOUT_MS));

        tracker.on_pulse(1300);
        assert!(!sensor.stalled(1300 + ENCODER_TIMEOUT_MS));
        assert!(sensor.stalled(1301 + ENCODER_TIMEOUT_MS));
    }

    #[test]
    fn test_timed_distance_waits_for_motor_start() {
        let mut timed = TimedDistance::new(200, 100);
        timed.start_ride(0);
        assert_eq!(timed.distance_mm(100), 0);
        assert_eq!(timed.speed_cm_per_s(100), 0);
        assert_eq!(timed.distance_mm(1100), 200);
        assert_eq!(timed.speed_cm_per_s(1100), 20);
        assert!(!timed.stalled(60_000));

        timed.end_ride(1100);
        assert_eq!(timed.distance_mm(5000), 200);
    }

    #[test]
    fn test_timed_distance_over_long_ride() {
        let mut timed = TimedDistance::new(640, 0);
        timed.start_ride(0);
        // two hours at 0.64 m/s
        assert_eq!(timed.distance_mm(7_200_000), 4_608_000);
        timed.end_ride(7_200_000);
        assert_eq!(timed.distance_mm(7_300_000), 4_608_000);
    }
}
