//! Dead reckoning of car heading, speed and distance from IMU readings.
//!
//! Readings are integrated only after [`ImuIntegrator::calibrate`] has captured
//! the rest offsets; until then samples report no calibration offset and are
//! ignored by the feedback adapter.

/// 1 g in mm/s².
const STANDARD_GRAVITY_MM_PER_S2: f32 = 9806.65;
/// Gyro noise floor of a resting car, °/s.
const GYRO_DEADBAND_DPS: f32 = 0.3;
/// Accelerometer noise floor of a resting car, g.
const ACCEL_DEADBAND_G: f32 = 0.008;

/// One integrated IMU reading, in the units the coordinator works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImuSample {
    /// Heading change since the last reset, half degrees, positive to the left.
    pub turn_angle_half_deg: i32,
    /// Turn rate in units of 2 °/s.
    pub turn_rate: i16,
    pub speed_cm_per_s: i32,
    pub distance_mm: i32,
    /// Forward accelerometer rest offset in milli-g, `None` before calibration.
    pub calibration_offset: Option<i16>,
}

/// Integrates gyro z and forward acceleration into car motion.
#[derive(Debug, Default)]
pub struct ImuIntegrator {
    gyro_offset_dps: f32,
    accel_offset_g: f32,
    calibrated: bool,
    turn_rate_dps: f32,
    turn_angle_deg: f32,
    speed_mm_per_s: f32,
    distance_mm: f32,
}

impl ImuIntegrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture rest offsets from averaged readings of a standing car.
    pub fn calibrate(
        &mut self,
        gyro_z_dps: f32,
        accel_forward_g: f32,
    ) {
        self.gyro_offset_dps = gyro_z_dps;
        self.accel_offset_g = accel_forward_g;
        self.calibrated = true;
        self.reset_car_data();
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    /// Zero heading, speed and distance, keeping the calibration.
    pub fn reset_car_data(&mut self) {
        self.turn_rate_dps = 0.0;
        self.turn_angle_deg = 0.0;
        self.speed_mm_per_s = 0.0;
        self.distance_mm = 0.0;
    }

    /// Integrate one reading taken `dt_ms` after the previous one.
    pub fn step(
        &mut self,
        gyro_z_dps: f32,
        accel_forward_g: f32,
        dt_ms: u32,
    ) -> ImuSample {
        if self.calibrated {
            let dt_s = dt_ms as f32 / 1000.0;

            let rate = deadband(gyro_z_dps - self.gyro_offset_dps, GYRO_DEADBAND_DPS);
            self.turn_rate_dps = rate;
            self.turn_angle_deg += rate * dt_s;

            let accel = deadband(accel_forward_g - self.accel_offset_g, ACCEL_DEADBAND_G);
            self.speed_mm_per_s += accel * STANDARD_GRAVITY_MM_PER_S2 * dt_s;
            self.distance_mm += libm::fabsf(self.speed_mm_per_s) * dt_s;
        }
        self.sample()
    }

    pub fn sample(&self) -> ImuSample {
        ImuSample {
            turn_angle_half_deg: libm::roundf(self.turn_angle_deg * 2.0) as i32,
            turn_rate: libm::roundf(self.turn_rate_dps / 2.0) as i16,
            speed_cm_per_s: libm::roundf(self.speed_mm_per_s / 10.0) as i32,
            distance_mm: libm::roundf(self.distance_mm) as i32,
            calibration_offset: self
                .calibrated
                .then(|| libm::roundf(self.accel_offset_g * 1000.0) as i16),
        }
    }
}

fn deadband(
    value: f32,
    band: f32,
) -> f32 {
    if libm::fabsf(value) < band {
        0.0
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uncalibrated_readings_are_ignored() {
        let mut imu = ImuIntegrator::new();
        let sample = imu.step(90.0, 0.5, 1000);
        assert_eq!(sample.calibration_offset, None);
        assert_eq!(sample.turn_angle_half_deg, 0);
        assert_eq!(sample.distance_mm, 0);
    }

    #[test]
    fn test_turn_integrates_minus_offset() {
        let mut imu = ImuIntegrator::new();
        imu.calibrate(1.0, 0.02);
        let sample = imu.step(91.0, 0.02, 1000);
        assert_eq!(sample.turn_angle_half_deg, 180);
        assert_eq!(sample.turn_rate, 45);
        assert_eq!(sample.speed_cm_per_s, 0);
        assert_eq!(sample.calibration_offset, Some(20));
    }

    #[test]
    fn test_forward_acceleration_builds_speed_and_distance() {
        let mut imu = ImuIntegrator::new();
        imu.calibrate(0.0, 0.0);
        let mut last = imu.sample();
        for _ in 0..10 {
            let sample = imu.step(0.0, 0.05, 50);
            assert!(sample.speed_cm_per_s >= last.speed_cm_per_s);
            assert!(sample.distance_mm >= last.distance_mm);
            last = sample;
        }
        // 0.05 g for 0.5 s is about 245 mm/s
        assert!((last.speed_cm_per_s - 25).abs() <= 1);
        assert!(last.distance_mm > 0);

        imu.reset_car_data();
        assert_eq!(imu.sample().distance_mm, 0);
        assert!(imu.is_calibrated());
    }
}
