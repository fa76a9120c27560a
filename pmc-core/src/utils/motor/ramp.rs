//! Ramp controller: one wheel with a speed profile and distance feedback.
//!
//! A ride runs through `Starting -> RampingUp -> Cruising -> RampingDown` and
//! back to `Idle`. Every [`RampMotor::update`] first checks whether the ride
//! target is satisfied or the encoder stalled, and only then advances the
//! profile, so a reached target always wins over a pending duty change.

use tracing::{debug, info, warn};

use super::{
    reached,
    sensor::RideSensor,
    Direction,
    DirectDrive,
    DriveMode,
    FeedbackDrive,
    MotorSide,
    MotorValues,
    RampState,
    RideOutcome,
    StopMode,
    DEFAULT_DRIVE_DUTY,
    DEFAULT_MIN_DUTY,
    DEFAULT_START_DUTY,
};
use crate::utils::math::braking::{braking_distance_mm, RAMP_DECELERATION_MM_PER_S2};

/// Duty added or removed per ramp interval.
pub const RAMP_STEP_DUTY: u8 = 20;
/// Time between two ramp steps.
pub const RAMP_INTERVAL_MS: u32 = 50;

/// Profile parameters of one wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RampConfig {
    /// Breakaway duty a ramp-up starts from.
    pub start_duty: u8,
    /// Floor a ramp-down decays to.
    pub min_duty: u8,
    pub ramp_step: u8,
    pub ramp_interval_ms: u32,
    /// Braking deceleration times two, mm/s².
    pub deceleration_times_2: u32,
}

impl Default for RampConfig {
    fn default() -> Self {
        Self {
            start_duty: DEFAULT_START_DUTY,
            min_duty: DEFAULT_MIN_DUTY,
            ramp_step: RAMP_STEP_DUTY,
            ramp_interval_ms: RAMP_INTERVAL_MS,
            deceleration_times_2: RAMP_DECELERATION_MM_PER_S2 * 2,
        }
    }
}

/// A [`DirectDrive`] motor driven through a ramp profile, measured by a
/// [`RideSensor`].
pub struct RampMotor<P, S> {
    motor: P,
    sensor: S,
    config: RampConfig,
    side: MotorSide,
    state: RampState,
    direction: Direction,
    mode: DriveMode,
    stop_mode: StopMode,
    max_duty: u8,
    drive_duty: u8,
    requested_duty: u8,
    /// Duty of the profile before compensation.
    profile_duty: u8,
    current_duty: u8,
    compensation: u8,
    target_mm: Option<u32>,
    hold_floor: bool,
    next_ramp_change_ms: u32,
    last_update_ms: u32,
    outcome: RideOutcome,
    sync_base: u32,
    duty_changed: bool,
}

impl<P, S> RampMotor<P, S>
where
    P: DirectDrive,
    S: RideSensor,
{
    pub fn new(
        motor: P,
        sensor: S,
        side: MotorSide,
        config: RampConfig,
    ) -> Self {
        let max_duty = motor.max_duty();
        let sync_base = sensor.pulse_count();
        Self {
            motor,
            sensor,
            config,
            side,
            state: RampState::Idle,
            direction: Direction::Forward,
            mode: DriveMode::Release,
            stop_mode: StopMode::Brake,
            max_duty,
            drive_duty: DEFAULT_DRIVE_DUTY.min(max_duty),
            requested_duty: 0,
            profile_duty: 0,
            current_duty: 0,
            compensation: 0,
            target_mm: None,
            hold_floor: false,
            next_ramp_change_ms: 0,
            last_update_ms: 0,
            outcome: RideOutcome::TargetReached,
            sync_base,
            duty_changed: false,
        }
    }

    pub fn config(&self) -> &RampConfig {
        &self.config
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    pub fn sensor_mut(&mut self) -> &mut S {
        &mut self.sensor
    }

    pub fn motor(&self) -> &P {
        &self.motor
    }

    /// Distance target of the active ride, if it is bounded.
    pub fn target_mm(&self) -> Option<u32> {
        self.target_mm
    }

    fn output_duty(&self, profile: u8) -> u8 {
        if profile == 0 {
            return 0;
        }
        // compensation never stalls a wheel the profile wants moving
        profile
            .saturating_sub(self.compensation)
            .max(1)
            .min(self.max_duty)
    }

    /// Write the compensated profile duty if it differs from the applied one.
    fn refresh_output(&mut self) -> Result<(), P::Error> {
        let duty = self.output_duty(self.profile_duty);
        if duty == self.current_duty {
            return Ok(());
        }
        if duty == 0 {
            self.motor.stop(StopMode::KeepPrevious)?;
        } else {
            self.motor.set_duty_and_direction(duty, self.direction)?;
            self.mode = self.direction.into();
        }
        self.current_duty = duty;
        self.duty_changed = true;
        Ok(())
    }

    fn apply_profile(&mut self, duty: u8) -> Result<(), P::Error> {
        self.profile_duty = duty.min(self.max_duty);
        self.refresh_output()
    }

    /// Brake first when a moving wheel is asked to reverse.
    fn change_direction(&mut self, direction: Direction) -> Result<(), P::Error> {
        if direction != self.direction && self.current_duty > 0 {
            debug!(side = ?self.side, ?direction, "reversing, braking first");
            self.motor.stop(StopMode::Brake)?;
            self.mode = DriveMode::Brake;
            self.profile_duty = 0;
            self.current_duty = 0;
            self.duty_changed = true;
        }
        self.direction = direction;
        Ok(())
    }

    fn braking_reaches_target(&self, now_ms: u32) -> bool {
        match self.target_mm {
            Some(target) => {
                self.sensor.distance_mm(now_ms) + self.braking_distance_mm(now_ms) >= target
            }
            None => false,
        }
    }

    fn set_state(&mut self, state: RampState) {
        if self.state != state {
            debug!(side = ?self.side, from = ?self.state, to = ?state, duty = self.profile_duty, "ramp");
            self.state = state;
        }
    }

    fn finish_ride(&mut self, outcome: RideOutcome) -> Result<(), P::Error> {
        self.outcome = outcome;
        self.stop(StopMode::Brake)
    }
}

impl<P, S> FeedbackDrive for RampMotor<P, S>
where
    P: DirectDrive,
    S: RideSensor,
{
    type Error = P::Error;

    fn side(&self) -> MotorSide {
        self.side
    }

    fn ramp_state(&self) -> RampState {
        self.state
    }

    fn drive_mode(&self) -> DriveMode {
        self.mode
    }

    fn current_duty(&self) -> u8 {
        self.current_duty
    }

    fn requested_duty(&self) -> u8 {
        self.requested_duty
    }

    fn drive_duty(&self) -> u8 {
        self.drive_duty
    }

    fn set_drive_duty(&mut self, duty: u8) {
        self.drive_duty = duty.min(self.max_duty);
    }

    fn compensation(&self) -> u8 {
        self.compensation
    }

    fn set_compensation(&mut self, compensation: u8) -> Result<(), Self::Error> {
        self.compensation = compensation.min(self.max_duty / 2);
        self.refresh_output()
    }

    fn set_stop_mode(&mut self, mode: StopMode) {
        if mode != StopMode::KeepPrevious {
            self.stop_mode = mode;
        }
    }

    fn motor_values(&self) -> MotorValues {
        MotorValues {
            compensation: self.compensation,
            min_duty: self.config.min_duty,
            max_duty: self.max_duty,
            drive_duty: self.drive_duty,
        }
    }

    fn apply_motor_values(&mut self, values: &MotorValues) {
        self.max_duty = values.max_duty.min(self.motor.max_duty());
        self.config.min_duty = values.min_duty;
        self.drive_duty = values.drive_duty.min(self.max_duty);
        self.compensation = values.compensation.min(self.max_duty / 2);
    }

    fn set_duty(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        if duty == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        self.change_direction(direction)?;
        if self.current_duty == 0 {
            self.sync_base = self.sensor.pulse_count();
        }
        self.requested_duty = duty;
        self.apply_profile(duty)
    }

    fn change_duty(&mut self, duty: u8) -> Result<(), Self::Error> {
        if self.current_duty == 0 {
            return Ok(());
        }
        if duty == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        self.apply_profile(duty)
    }

    fn start_ramp(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        if duty == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        self.change_direction(direction)?;
        self.requested_duty = duty.min(self.max_duty);
        self.target_mm = None;
        self.hold_floor = false;
        if self.current_duty == 0 {
            self.outcome = RideOutcome::InProgress;
            self.set_state(RampState::Starting);
        } else if self.state != RampState::RampingUp {
            self.set_state(RampState::Cruising);
            self.apply_profile(duty)?;
        }
        Ok(())
    }

    fn start_go_distance(
        &mut self,
        duty: u8,
        distance_mm: u32,
        direction: Direction,
        now_ms: u32,
    ) -> Result<(), Self::Error> {
        if distance_mm == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        if self.current_duty == 0 || direction != self.direction {
            self.start_ramp(duty, direction)?;
            self.target_mm = Some(distance_mm);
            info!(side = ?self.side, distance_mm, duty, "ride started");
        } else {
            let target = self.sensor.distance_mm(now_ms) + distance_mm;
            self.target_mm = Some(target);
            self.requested_duty = duty.min(self.max_duty);
            self.hold_floor = false;
            self.set_state(RampState::Cruising);
            self.apply_profile(duty)?;
            info!(side = ?self.side, target_mm = target, duty, "ride extended");
        }
        Ok(())
    }

    fn start_ramp_down(
        &mut self,
        now_ms: u32,
        hold_floor: bool,
    ) {
        if self.current_duty == 0 {
            return;
        }
        self.hold_floor = hold_floor;
        self.next_ramp_change_ms = now_ms;
        self.set_state(RampState::RampingDown);
    }

    fn update(&mut self, now_ms: u32) -> Result<bool, Self::Error> {
        self.last_update_ms = now_ms;

        if self.current_duty > 0 && self.state != RampState::Idle {
            if let Some(target) = self.target_mm {
                let distance = self.sensor.distance_mm(now_ms);
                if distance >= target {
                    info!(side = ?self.side, distance, target, "ride target reached");
                    self.finish_ride(RideOutcome::TargetReached)?;
                    return Ok(false);
                }
            }
            if self.sensor.stalled(now_ms) {
                warn!(side = ?self.side, "no encoder pulse within timeout, stopping");
                self.finish_ride(RideOutcome::Stalled)?;
                return Ok(false);
            }
        }

        let mut duty = self.profile_duty;
        match self.state {
            RampState::Starting => {
                self.sensor.start_ride(now_ms);
                self.sync_base = self.sensor.pulse_count();
                self.next_ramp_change_ms = now_ms.wrapping_add(self.config.ramp_interval_ms);
                if self.requested_duty > self.config.start_duty {
                    duty = self.config.start_duty;
                    self.set_state(RampState::RampingUp);
                } else {
                    duty = self.requested_duty;
                    self.set_state(RampState::Cruising);
                }
            }
            RampState::RampingUp if reached(now_ms, self.next_ramp_change_ms) => {
                self.next_ramp_change_ms = self
                    .next_ramp_change_ms
                    .wrapping_add(self.config.ramp_interval_ms);
                if duty == self.requested_duty || self.braking_reaches_target(now_ms) {
                    self.set_state(RampState::Cruising);
                } else {
                    duty = duty
                        .saturating_add(self.config.ramp_step)
                        .min(self.requested_duty);
                }
            }
            _ => {}
        }

        // not an else branch: a ride may start its ramp-down in the tick it stops ramping up
        if self.state == RampState::Cruising && self.braking_reaches_target(now_ms) {
            self.hold_floor = true;
            self.next_ramp_change_ms = now_ms;
            self.set_state(RampState::RampingDown);
        }

        if self.state == RampState::RampingDown && reached(now_ms, self.next_ramp_change_ms) {
            self.next_ramp_change_ms = now_ms.wrapping_add(self.config.ramp_interval_ms);
            let floor = self.config.min_duty.min(duty);
            duty = duty.saturating_sub(self.config.ramp_step).max(floor);
            if duty == floor && !self.hold_floor {
                let outcome = match self.target_mm {
                    Some(_) => RideOutcome::Cancelled,
                    None => RideOutcome::TargetReached,
                };
                self.outcome = outcome;
                self.stop_at(StopMode::KeepPrevious, now_ms)?;
                return Ok(false);
            }
        }

        if duty != self.profile_duty {
            self.apply_profile(duty)?;
        }
        Ok(self.current_duty > 0 || self.state == RampState::Starting)
    }

    fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        self.stop_at(mode, self.last_update_ms)
    }

    fn stop_at(
        &mut self,
        mode: StopMode,
        now_ms: u32,
    ) -> Result<(), Self::Error> {
        let mode = match mode {
            StopMode::KeepPrevious => self.stop_mode,
            mode => mode,
        };
        if self.state != RampState::Idle && self.outcome == RideOutcome::InProgress {
            self.outcome = RideOutcome::Cancelled;
        }
        self.motor.stop(mode)?;
        if self.current_duty > 0 {
            self.duty_changed = true;
        }
        self.mode = match mode {
            StopMode::Release => DriveMode::Release,
            _ => DriveMode::Brake,
        };
        self.profile_duty = 0;
        self.current_duty = 0;
        self.target_mm = None;
        self.hold_floor = false;
        self.state = RampState::Idle;
        self.sensor.end_ride(now_ms);
        Ok(())
    }

    fn ride_outcome(&self) -> RideOutcome {
        self.outcome
    }

    fn distance_mm(&self, now_ms: u32) -> u32 {
        self.sensor.distance_mm(now_ms)
    }

    fn speed_cm_per_s(&self, now_ms: u32) -> u32 {
        self.sensor.speed_cm_per_s(now_ms)
    }

    fn braking_distance_mm(&self, now_ms: u32) -> u32 {
        braking_distance_mm(
            self.sensor.speed_cm_per_s(now_ms),
            self.config.deceleration_times_2,
        )
    }

    fn sync_count(&self) -> u32 {
        self.sensor.pulse_count().wrapping_sub(self.sync_base)
    }

    fn align_sync_count(&mut self, count: u32) {
        self.sync_base = self.sensor.pulse_count().wrapping_sub(count);
    }

    fn take_duty_changed(&mut self) -> bool {
        core::mem::take(&mut self.duty_changed)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::convert::Infallible;
    use std::vec::Vec;

    use super::*;
    use crate::utils::motor::sensor::TimedDistance;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Drive(u8, Direction),
        Stop(StopMode),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<Call>,
    }

    impl DirectDrive for Recorder {
        type Error = Infallible;

        fn set_duty_and_direction(
            &mut self,
            duty: u8,
            direction: Direction,
        ) -> Result<(), Self::Error> {
            self.calls.push(Call::Drive(duty, direction));
            Ok(())
        }

        fn stop(
            &mut self,
            mode: StopMode,
        ) -> Result<(), Self::Error> {
            self.calls.push(Call::Stop(mode));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSensor {
        distance_mm: u32,
        speed_cm_per_s: u32,
        stalled: bool,
        pulses: u32,
        rides: u32,
    }

    impl RideSensor for FakeSensor {
        fn start_ride(&mut self, _now_ms: u32) {
            self.rides += 1;
            self.distance_mm = 0;
        }

        fn end_ride(&mut self, _now_ms: u32) {}

        fn distance_mm(&self, _now_ms: u32) -> u32 {
            self.distance_mm
        }

        fn speed_cm_per_s(&self, _now_ms: u32) -> u32 {
            self.speed_cm_per_s
        }

        fn stalled(&self, _now_ms: u32) -> bool {
            self.stalled
        }

        fn pulse_count(&self) -> u32 {
            self.pulses
        }
    }

    fn wheel() -> RampMotor<Recorder, FakeSensor> {
        RampMotor::new(
            Recorder::default(),
            FakeSensor::default(),
            MotorSide::Right,
            RampConfig::default(),
        )
    }

    #[test]
    fn test_ramp_up_steps_every_interval() {
        let mut w = wheel();
        w.start_ramp(100, Direction::Forward).unwrap();
        assert_eq!(w.ramp_state(), RampState::Starting);
        assert!(w.update(0).unwrap());
        assert_eq!(w.ramp_state(), RampState::RampingUp);
        assert_eq!(w.current_duty(), DEFAULT_START_DUTY);
        assert_eq!(w.sensor().rides, 1);

        w.update(49).unwrap();
        assert_eq!(w.current_duty(), 40);
        w.update(50).unwrap();
        assert_eq!(w.current_duty(), 60);
        w.update(100).unwrap();
        w.update(150).unwrap();
        assert_eq!(w.current_duty(), 100);
        assert_eq!(w.ramp_state(), RampState::RampingUp);
        w.update(200).unwrap();
        assert_eq!(w.ramp_state(), RampState::Cruising);
        assert_eq!(w.current_duty(), 100);
    }

    #[test]
    fn test_low_request_skips_ramp() {
        let mut w = wheel();
        w.start_ramp(35, Direction::Backward).unwrap();
        w.update(0).unwrap();
        assert_eq!(w.ramp_state(), RampState::Cruising);
        assert_eq!(w.motor().calls, [Call::Drive(35, Direction::Backward)]);
        assert_eq!(w.drive_mode(), DriveMode::Backward);
    }

    #[test]
    fn test_distance_ride_ramps_down_and_stops_at_target() {
        let mut w = wheel();
        w.start_go_distance(200, 200, Direction::Forward, 0).unwrap();
        w.update(0).unwrap();
        assert_eq!(w.target_mm(), Some(200));

        // 150 mm done, 80 cm/s brakes for 91 mm
        w.sensor_mut().distance_mm = 150;
        w.sensor_mut().speed_cm_per_s = 80;
        w.update(50).unwrap();
        assert_eq!(w.ramp_state(), RampState::RampingDown);
        assert_eq!(w.current_duty(), DEFAULT_MIN_DUTY);

        w.update(100).unwrap();
        assert_eq!(w.current_duty(), DEFAULT_MIN_DUTY);
        assert_eq!(w.ramp_state(), RampState::RampingDown);

        w.sensor_mut().distance_mm = 200;
        assert!(!w.update(110).unwrap());
        assert_eq!(w.ramp_state(), RampState::Idle);
        assert_eq!(w.current_duty(), 0);
        assert_eq!(w.ride_outcome(), RideOutcome::TargetReached);
        assert_eq!(w.motor().calls.last(), Some(&Call::Stop(StopMode::Brake)));
    }

    #[test]
    fn test_stall_forces_stop() {
        let mut w = wheel();
        w.start_go_distance(120, 1000, Direction::Forward, 0).unwrap();
        w.update(0).unwrap();
        w.sensor_mut().stalled = true;
        assert!(!w.update(401).unwrap());
        assert_eq!(w.ride_outcome(), RideOutcome::Stalled);
        assert_eq!(w.ramp_state(), RampState::Idle);
        assert_eq!(w.drive_mode(), DriveMode::Brake);
    }

    #[test]
    fn test_zero_distance_is_a_stop() {
        let mut w = wheel();
        w.set_stop_mode(StopMode::Release);
        w.start_go_distance(120, 0, Direction::Forward, 0).unwrap();
        assert_eq!(w.ramp_state(), RampState::Idle);
        assert_eq!(w.motor().calls, [Call::Stop(StopMode::Release)]);
    }

    #[test]
    fn test_distance_while_moving_extends_target() {
        let mut w = wheel();
        w.set_duty(120, Direction::Forward).unwrap();
        w.sensor_mut().distance_mm = 300;
        w.start_go_distance(150, 100, Direction::Forward, 0).unwrap();
        assert_eq!(w.target_mm(), Some(400));
        assert_eq!(w.ramp_state(), RampState::Cruising);
        assert_eq!(w.current_duty(), 150);
    }

    #[test]
    fn test_compensation_lowers_output() {
        let mut w = wheel();
        w.set_compensation(10).unwrap();
        w.set_duty(100, Direction::Forward).unwrap();
        assert_eq!(w.current_duty(), 90);
        w.set_compensation(4).unwrap();
        assert_eq!(w.current_duty(), 96);
        w.set_compensation(250).unwrap();
        assert_eq!(w.compensation(), 127);
        assert_eq!(w.current_duty(), 1);
    }

    #[test]
    fn test_reversal_brakes_before_driving() {
        let mut w = wheel();
        w.set_duty(100, Direction::Forward).unwrap();
        w.set_duty(100, Direction::Backward).unwrap();
        assert_eq!(
            w.motor().calls,
            [
                Call::Drive(100, Direction::Forward),
                Call::Stop(StopMode::Brake),
                Call::Drive(100, Direction::Backward),
            ]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut w = wheel();
        w.start_ramp(100, Direction::Forward).unwrap();
        w.update(0).unwrap();
        w.stop(StopMode::Brake).unwrap();
        let first = (w.ramp_state(), w.current_duty(), w.drive_mode(), w.ride_outcome());
        w.stop(StopMode::Brake).unwrap();
        let second = (w.ramp_state(), w.current_duty(), w.drive_mode(), w.ride_outcome());
        assert_eq!(first, second);
        assert_eq!(first.3, RideOutcome::Cancelled);
    }

    #[test]
    fn test_stop_closes_ride_at_stop_time() {
        let mut w = RampMotor::new(
            Recorder::default(),
            TimedDistance::new(100, 0),
            MotorSide::Left,
            RampConfig::default(),
        );
        w.start_ramp(35, Direction::Forward).unwrap();
        w.update(0).unwrap();
        w.update(1000).unwrap();
        w.stop_at(StopMode::Brake, 3000).unwrap();
        assert_eq!(w.distance_mm(5000), 300);

        w.start_ramp(35, Direction::Forward).unwrap();
        w.update(6000).unwrap();
        w.update(7000).unwrap();
        w.stop(StopMode::Brake).unwrap();
        assert_eq!(w.distance_mm(9000), 100);
    }

    #[test]
    fn test_unbounded_ramp_down_stops_at_floor() {
        let mut w = wheel();
        w.set_duty(90, Direction::Forward).unwrap();
        w.start_ramp_down(1000, false);
        w.update(1000).unwrap();
        assert_eq!(w.current_duty(), 70);
        w.update(1050).unwrap();
        assert_eq!(w.current_duty(), 50);
        assert!(!w.update(1100).unwrap());
        assert_eq!(w.ramp_state(), RampState::Idle);
    }

    #[test]
    fn test_held_floor_keeps_creeping() {
        let mut w = wheel();
        w.set_duty(50, Direction::Forward).unwrap();
        w.start_ramp_down(0, true);
        for now in [0, 50, 100, 150] {
            assert!(w.update(now).unwrap());
        }
        assert_eq!(w.current_duty(), DEFAULT_MIN_DUTY);
    }

    #[test]
    fn test_sync_count_alignment() {
        let mut w = wheel();
        w.set_duty(100, Direction::Forward).unwrap();
        w.sensor_mut().pulses = 12;
        assert_eq!(w.sync_count(), 12);
        w.align_sync_count(9);
        assert_eq!(w.sync_count(), 9);
        w.sensor_mut().pulses = 13;
        assert_eq!(w.sync_count(), 10);
    }
}
