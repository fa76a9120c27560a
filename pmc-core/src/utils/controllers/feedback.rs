//! Where the coordinator gets car-level motion from.
//!
//! With [`WheelEncoders`] every wheel measures its own ride and the
//! coordinator relies on the ramp controllers. With [`ImuFeedback`] heading,
//! speed and distance of the whole car come from an inertial sensor, which
//! lets turns stop on the measured angle instead of wheel distance.

use crate::utils::{math::inertial::ImuSample, motor::encoder::ChangeFlag};

/// Motion of the whole car since the last ride reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CarMotion {
    /// Signed heading change, half degrees, positive to the left.
    pub turn_angle_half_deg: i32,
    /// Absolute turn rate in units of 2 °/s.
    pub turn_rate: u16,
    pub speed_cm_per_s: u32,
    pub distance_mm: u32,
}

/// Source of integrated IMU readings.
pub trait ImuSampler {
    /// A new sample if one is due, `None` otherwise.
    fn sample_if_available(&mut self, now_ms: u32) -> Option<ImuSample>;
    /// Zero heading, speed and distance.
    fn reset_car_data(&mut self);
}

/// Feedback strategy of the coordinator.
pub trait FeedbackSource {
    /// Pull new data; returns whether any car value changed.
    fn refresh(&mut self, now_ms: u32) -> bool;
    /// Car-level motion, `None` when only the wheels measure.
    fn car_motion(&self) -> Option<CarMotion>;
    /// Start measuring a new ride from zero.
    fn reset_ride(&mut self);
}

/// Per-wheel encoder feedback; the car itself is not measured.
#[derive(Debug, Default, Clone, Copy)]
pub struct WheelEncoders;

impl FeedbackSource for WheelEncoders {
    fn refresh(&mut self, _now_ms: u32) -> bool {
        false
    }

    fn car_motion(&self) -> Option<CarMotion> {
        None
    }

    fn reset_ride(&mut self) {}
}

/// IMU feedback adapter.
///
/// Samples taken before the sensor was calibrated are ignored, and until the
/// first calibrated sample arrives the car is reported as unmeasured so the
/// coordinator keeps using wheel distances.
pub struct ImuFeedback<'a, S> {
    sampler: S,
    motion: CarMotion,
    calibration_offset: Option<i16>,
    changed: &'a ChangeFlag,
}

impl<'a, S: ImuSampler> ImuFeedback<'a, S> {
    pub fn new(
        sampler: S,
        changed: &'a ChangeFlag,
    ) -> Self {
        Self {
            sampler,
            motion: CarMotion::default(),
            calibration_offset: None,
            changed,
        }
    }

    pub fn sampler(&self) -> &S {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut S {
        &mut self.sampler
    }

    /// Gyro offset of the last calibrated sample.
    pub fn calibration_offset(&self) -> Option<i16> {
        self.calibration_offset
    }
}

impl<S: ImuSampler> FeedbackSource for ImuFeedback<'_, S> {
    fn refresh(&mut self, now_ms: u32) -> bool {
        let Some(sample) = self.sampler.sample_if_available(now_ms) else {
            return false;
        };
        if sample.calibration_offset.is_none() {
            return false;
        }

        let motion = CarMotion {
            turn_angle_half_deg: sample.turn_angle_half_deg,
            turn_rate: sample.turn_rate.unsigned_abs(),
            speed_cm_per_s: sample.speed_cm_per_s.unsigned_abs(),
            distance_mm: sample.distance_mm.unsigned_abs(),
        };
        if motion == self.motion && sample.calibration_offset == self.calibration_offset {
            return false;
        }
        self.motion = motion;
        self.calibration_offset = sample.calibration_offset;
        self.changed.raise();
        true
    }

    fn car_motion(&self) -> Option<CarMotion> {
        self.calibration_offset.map(|_| self.motion)
    }

    fn reset_ride(&mut self) {
        self.sampler.reset_car_data();
        self.motion = CarMotion::default();
    }
}

/// Feedback chosen at startup, e.g. depending on whether an IMU answered.
pub enum SelectedFeedback<'a, S> {
    Encoders(WheelEncoders),
    Imu(ImuFeedback<'a, S>),
}

impl<S: ImuSampler> FeedbackSource for SelectedFeedback<'_, S> {
    fn refresh(&mut self, now_ms: u32) -> bool {
        match self {
            SelectedFeedback::Encoders(f) => f.refresh(now_ms),
            SelectedFeedback::Imu(f) => f.refresh(now_ms),
        }
    }

    fn car_motion(&self) -> Option<CarMotion> {
        match self {
            SelectedFeedback::Encoders(f) => f.car_motion(),
            SelectedFeedback::Imu(f) => f.car_motion(),
        }
    }

    fn reset_ride(&mut self) {
        match self {
            SelectedFeedback::Encoders(f) => f.reset_ride(),
            SelectedFeedback::Imu(f) => f.reset_ride(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        next: Option<ImuSample>,
        resets: u32,
    }

    impl ImuSampler for Scripted {
        fn sample_if_available(&mut self, _now_ms: u32) -> Option<ImuSample> {
            self.next.take()
        }

        fn reset_car_data(&mut self) {
            self.resets += 1;
        }
    }

    fn sample(
        turn_angle_half_deg: i32,
        calibration_offset: Option<i16>,
    ) -> ImuSample {
        ImuSample {
            turn_angle_half_deg,
            turn_rate: -12,
            speed_cm_per_s: -30,
            distance_mm: 40,
            calibration_offset,
        }
    }

    #[test]
    fn test_uncalibrated_samples_are_ignored() {
        let flag = ChangeFlag::new();
        let mut imu = ImuFeedback::new(
            Scripted {
                next: Some(sample(50, None)),
                resets: 0,
            },
            &flag,
        );
        assert!(!imu.refresh(0));
        assert_eq!(imu.car_motion(), None);
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_new_sample_raises_change_flag() {
        let flag = ChangeFlag::new();
        let mut imu = ImuFeedback::new(
            Scripted {
                next: Some(sample(-50, Some(3))),
                resets: 0,
            },
            &flag,
        );
        assert!(imu.refresh(0));
        let motion = imu.car_motion().unwrap();
        assert_eq!(motion.turn_angle_half_deg, -50);
        assert_eq!(motion.turn_rate, 12);
        assert_eq!(motion.speed_cm_per_s, 30);
        assert!(flag.take());

        // nothing new
        assert!(!imu.refresh(10));

        imu.sampler_mut().next = Some(sample(-50, Some(3)));
        assert!(!imu.refresh(20));
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_recalibration_alone_raises_change_flag() {
        let flag = ChangeFlag::new();
        let mut imu = ImuFeedback::new(
            Scripted {
                next: Some(sample(20, Some(3))),
                resets: 0,
            },
            &flag,
        );
        assert!(imu.refresh(0));
        assert!(flag.take());

        imu.sampler_mut().next = Some(sample(20, Some(-4)));
        assert!(imu.refresh(10));
        assert!(flag.take());
        assert_eq!(imu.calibration_offset(), Some(-4));
        assert_eq!(imu.car_motion().unwrap().turn_angle_half_deg, 20);
    }

    #[test]
    fn test_reset_ride_zeroes_motion() {
        let flag = ChangeFlag::new();
        let mut imu = ImuFeedback::new(
            Scripted {
                next: Some(sample(90, Some(1))),
                resets: 0,
            },
            &flag,
        );
        imu.refresh(0);
        imu.reset_ride();
        assert_eq!(imu.car_motion(), Some(CarMotion::default()));
        assert_eq!(imu.sampler().resets, 1);
    }

    #[test]
    fn test_selected_encoders_report_no_car_motion() {
        let mut feedback: SelectedFeedback<'_, Scripted> =
            SelectedFeedback::Encoders(WheelEncoders);
        assert!(!feedback.refresh(0));
        assert_eq!(feedback.car_motion(), None);
    }
}
