//! Dual-motor coordinator for a two-wheel differential car.
//!
//! [`CarMotorControl`] owns both wheels and keeps them consistent: one shared
//! drive direction, brake-and-settle before reversing, equal pulse counts
//! while driving straight, and turns split into per-wheel rides. With IMU
//! feedback, turns and straight rides stop on the measured car motion instead
//! of wheel distance.
//!
//! Non-blocking `start_*` calls only arm a ride; [`CarMotorControl::update_motors`]
//! must then be called often (every few milliseconds). The blocking variants
//! loop on `update_motors` themselves and hand control to a per-tick callback.

use embedded_hal::delay::DelayNs;
use tracing::{debug, info};

use super::{
    feedback::{CarMotion, FeedbackSource},
    storage::{accept_stored, MotorValueStore},
    Clock,
};
use crate::utils::{
    math::{
        braking::{braking_distance_mm, turn_overrun_half_degree, RAMP_DECELERATION_MM_PER_S2},
        turn::{Chassis, TurnMode, WheelMove},
    },
    motor::{reached, Direction, DriveMode, FeedbackDrive, RampState, StopMode, MAX_DUTY},
};

/// Default period of [`CarMotorControl::synchronize`].
pub const SYNCHRONIZE_INTERVAL_MS: u32 = 100;
/// Pulse gap that triggers a synchronization correction.
const SYNC_PULSE_GAP: u32 = 2;
/// Compensation moved per synchronization correction.
const SYNC_COMPENSATION_STEP: u8 = 2;
const MAX_COMPENSATION: i16 = (MAX_DUTY / 2) as i16;

/// Shared direction or stop state of the car.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarMode {
    Forward,
    Backward,
    Turning,
    Brake,
    Release,
}

impl From<Direction> for CarMode {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => CarMode::Forward,
            Direction::Backward => CarMode::Backward,
        }
    }
}

/// Coordinates the left and right wheel of the car.
pub struct CarMotorControl<M, F, D, C> {
    left: M,
    right: M,
    feedback: F,
    delay: D,
    clock: C,
    chassis: Chassis,
    mode: CarMode,
    next_sync_ms: u32,
    requested_rotation_deg: i16,
    requested_distance_mm: u32,
    control_values_changed: bool,
}

impl<M, F, D, C> CarMotorControl<M, F, D, C>
where
    M: FeedbackDrive,
    F: FeedbackSource,
    D: DelayNs,
    C: Clock,
{
    pub fn new(
        left: M,
        right: M,
        feedback: F,
        delay: D,
        clock: C,
        chassis: Chassis,
    ) -> Self {
        Self {
            left,
            right,
            feedback,
            delay,
            clock,
            chassis,
            mode: CarMode::Release,
            next_sync_ms: 0,
            requested_rotation_deg: 0,
            requested_distance_mm: 0,
            control_values_changed: false,
        }
    }

    pub fn left(&self) -> &M {
        &self.left
    }

    pub fn right(&self) -> &M {
        &self.right
    }

    pub fn left_mut(&mut self) -> &mut M {
        &mut self.left
    }

    pub fn right_mut(&mut self) -> &mut M {
        &mut self.right
    }

    pub fn feedback(&self) -> &F {
        &self.feedback
    }

    pub fn feedback_mut(&mut self) -> &mut F {
        &mut self.feedback
    }

    pub fn chassis(&self) -> &Chassis {
        &self.chassis
    }

    pub fn set_chassis(&mut self, chassis: Chassis) {
        self.chassis = chassis;
    }

    pub fn mode(&self) -> CarMode {
        self.mode
    }

    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    fn max_current_duty(&self) -> u8 {
        self.left.current_duty().max(self.right.current_duty())
    }

    /// Brake and let the car settle before it changes its direction.
    fn check_and_handle_direction_change(&mut self, mode: CarMode) -> Result<(), M::Error> {
        if mode == self.mode {
            return Ok(());
        }
        let duty = self.max_current_duty();
        if duty > 0 {
            info!(from = ?self.mode, to = ?mode, duty, "direction change, braking");
            self.stop(StopMode::Brake)?;
            // the faster the car was, the longer it needs to stand still
            self.delay.delay_ms(duty as u32);
        }
        self.mode = mode;
        Ok(())
    }

    /// Drive both wheels with `duty` right away, no ramp.
    pub fn set_duty(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), M::Error> {
        if duty == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        self.check_and_handle_direction_change(direction.into())?;
        self.left.set_duty(duty, direction)?;
        self.right.set_duty(duty, direction)
    }

    /// Drive with a steering offset. A positive offset slows the left wheel,
    /// a negative one the right wheel.
    pub fn set_duty_with_offset(
        &mut self,
        duty: u8,
        direction: Direction,
        left_right_offset: i8,
    ) -> Result<(), M::Error> {
        self.check_and_handle_direction_change(direction.into())?;
        let offset = left_right_offset.unsigned_abs();
        let (left, right) = if left_right_offset >= 0 {
            (duty.saturating_sub(offset), duty)
        } else {
            (duty, duty.saturating_sub(offset))
        };
        self.left.set_duty(left, direction)?;
        self.right.set_duty(right, direction)
    }

    /// New duty for both wheels in the current direction.
    pub fn change_duty(&mut self, duty: u8) -> Result<(), M::Error> {
        self.left.change_duty(duty)?;
        self.right.change_duty(duty)
    }

    /// Ramp both wheels up to their drive duty, without a distance target.
    pub fn start_ramp_up(&mut self, direction: Direction) -> Result<(), M::Error> {
        let (left, right) = (self.left.drive_duty(), self.right.drive_duty());
        self.check_and_handle_direction_change(direction.into())?;
        self.left.start_ramp(left, direction)?;
        self.right.start_ramp(right, direction)
    }

    /// Ramp up and block until both wheels cruise.
    pub fn start_ramp_up_and_wait(
        &mut self,
        direction: Direction,
        mut on_tick: impl FnMut(&mut Self),
    ) -> Result<(), M::Error> {
        self.start_ramp_up(direction)?;
        loop {
            on_tick(self);
            if !self.update_motors()? {
                break;
            }
            let ramping = [self.left.ramp_state(), self.right.ramp_state()]
                .iter()
                .any(|state| matches!(state, RampState::Starting | RampState::RampingUp));
            if !ramping {
                break;
            }
        }
        Ok(())
    }

    /// Ramp both wheels down to their floor duty and stop them there.
    pub fn start_ramp_down(&mut self) {
        let now = self.clock.now_ms();
        self.requested_distance_mm = 0;
        self.left.start_ramp_down(now, false);
        self.right.start_ramp_down(now, false);
    }

    /// Ramp down and block until the car stands still.
    pub fn stop_and_wait(&mut self, on_tick: impl FnMut(&mut Self)) -> Result<(), M::Error> {
        if self.is_stopped() {
            return Ok(());
        }
        self.start_ramp_down();
        self.wait_until_stopped(on_tick)
    }

    /// Arm a straight ride of `distance_mm`. A zero distance stops the car.
    pub fn start_go_distance(
        &mut self,
        distance_mm: u32,
        direction: Direction,
    ) -> Result<(), M::Error> {
        if distance_mm == 0 {
            return self.stop(StopMode::KeepPrevious);
        }
        self.check_and_handle_direction_change(direction.into())?;
        let now = self.clock.now_ms();

        if let Some(motion) = self.feedback.car_motion() {
            self.requested_rotation_deg = 0;
            if self.is_stopped() {
                self.feedback.reset_ride();
                self.requested_distance_mm = distance_mm;
            } else {
                self.requested_distance_mm = motion.distance_mm + distance_mm;
            }
            let (left, right) = (self.left.drive_duty(), self.right.drive_duty());
            self.left.start_ramp(left, direction)?;
            self.right.start_ramp(right, direction)?;
        } else {
            let (left, right) = (self.left.drive_duty(), self.right.drive_duty());
            self.left.start_go_distance(left, distance_mm, direction, now)?;
            self.right.start_go_distance(right, distance_mm, direction, now)?;
        }
        info!(distance_mm, ?direction, "go distance");
        Ok(())
    }

    /// Negative distances drive backward.
    pub fn start_go_distance_signed(&mut self, distance_mm: i32) -> Result<(), M::Error> {
        let direction = if distance_mm < 0 {
            Direction::Backward
        } else {
            Direction::Forward
        };
        self.start_go_distance(distance_mm.unsigned_abs(), direction)
    }

    /// Drive `distance_mm` and block until the car stands still.
    pub fn drive_distance(
        &mut self,
        distance_mm: u32,
        direction: Direction,
        on_tick: impl FnMut(&mut Self),
    ) -> Result<(), M::Error> {
        self.start_go_distance(distance_mm, direction)?;
        self.wait_until_stopped(on_tick)
    }

    pub fn go_distance_signed(
        &mut self,
        distance_mm: i32,
        on_tick: impl FnMut(&mut Self),
    ) -> Result<(), M::Error> {
        self.start_go_distance_signed(distance_mm)?;
        self.wait_until_stopped(on_tick)
    }

    fn turn_duty(
        wheel: &M,
        slow: bool,
    ) -> u8 {
        if slow {
            (wheel.drive_duty() / 2).max(1)
        } else {
            wheel.drive_duty()
        }
    }

    fn drive_wheel_directly(
        wheel: &mut M,
        duty: u8,
        wheel_move: WheelMove,
    ) -> Result<(), M::Error> {
        if wheel_move.distance_mm == 0 {
            wheel.stop(StopMode::KeepPrevious)
        } else {
            wheel.set_duty(duty, wheel_move.direction)
        }
    }

    /// Arm a turn by `degrees`, positive turns left. Zero does nothing.
    pub fn start_rotate(
        &mut self,
        degrees: i16,
        mode: TurnMode,
        slow: bool,
    ) -> Result<(), M::Error> {
        if degrees == 0 {
            return Ok(());
        }
        self.check_and_handle_direction_change(CarMode::Turning)?;
        let plan = self.chassis.plan_turn(degrees, mode);
        let left_duty = Self::turn_duty(&self.left, slow);
        let right_duty = Self::turn_duty(&self.right, slow);

        if self.feedback.car_motion().is_some() {
            // the IMU decides when to stop, the wheels just turn
            self.feedback.reset_ride();
            self.requested_distance_mm = 0;
            self.requested_rotation_deg = degrees;
            Self::drive_wheel_directly(&mut self.left, left_duty, plan.left)?;
            Self::drive_wheel_directly(&mut self.right, right_duty, plan.right)?;
        } else {
            let now = self.clock.now_ms();
            self.left
                .start_go_distance(left_duty, plan.left.distance_mm, plan.left.direction, now)?;
            self.right
                .start_go_distance(right_duty, plan.right.distance_mm, plan.right.direction, now)?;
        }
        info!(degrees, ?mode, slow, "rotation started");
        Ok(())
    }

    /// Turn by `degrees` and block until the car stands still.
    pub fn rotate(
        &mut self,
        degrees: i16,
        mode: TurnMode,
        slow: bool,
        on_tick: impl FnMut(&mut Self),
    ) -> Result<(), M::Error> {
        self.start_rotate(degrees, mode, slow)?;
        self.wait_until_stopped(on_tick)
    }

    /// Watch IMU-guided turns and rides. `Some` when this tick decided for the
    /// wheels and they must not be updated.
    fn update_from_car_motion(
        &mut self,
        motion: CarMotion,
        now_ms: u32,
    ) -> Result<Option<bool>, M::Error> {
        if self.requested_rotation_deg != 0 {
            let turned = motion.turn_angle_half_deg.unsigned_abs();
            let requested = (self.requested_rotation_deg as i32 * 2).unsigned_abs();
            if turned + 1 >= requested {
                info!(turned_half_deg = turned, "rotation done");
                self.stop(StopMode::Brake)?;
                return Ok(Some(false));
            }
            if turned + turn_overrun_half_degree(motion.turn_rate) >= requested {
                // close to the target, slow down
                let (left, right) = (self.left.drive_duty() / 2, self.right.drive_duty() / 2);
                self.left.change_duty(left.max(1))?;
                self.right.change_duty(right.max(1))?;
            }
            return Ok(Some(!self.is_stopped()));
        }

        if self.requested_distance_mm != 0 {
            if motion.distance_mm >= self.requested_distance_mm {
                info!(distance_mm = motion.distance_mm, "ride target reached");
                self.stop(StopMode::Brake)?;
                return Ok(Some(false));
            }
            let braking =
                braking_distance_mm(motion.speed_cm_per_s, RAMP_DECELERATION_MM_PER_S2 * 2);
            let cruising = matches!(
                self.right.ramp_state(),
                RampState::RampingUp | RampState::Cruising
            );
            if cruising && motion.distance_mm + braking >= self.requested_distance_mm {
                debug!(distance_mm = motion.distance_mm, braking, "ramping down on imu distance");
                self.left.start_ramp_down(now_ms, true);
                self.right.start_ramp_down(now_ms, true);
            }
        }
        Ok(None)
    }

    /// Advance both wheels. Returns whether the car still moves.
    pub fn update_motors(&mut self) -> Result<bool, M::Error> {
        let now = self.clock.now_ms();
        self.feedback.refresh(now);
        if let Some(motion) = self.feedback.car_motion() {
            if let Some(moving) = self.update_from_car_motion(motion, now)? {
                return Ok(moving);
            }
        }
        let left = self.left.update(now)?;
        let right = self.right.update(now)?;
        Ok(left || right)
    }

    /// Call `on_tick`, then update, until the car stands still. The callback
    /// may stop the car itself.
    pub fn wait_until_stopped(&mut self, mut on_tick: impl FnMut(&mut Self)) -> Result<(), M::Error> {
        loop {
            on_tick(self);
            if !self.update_motors()? {
                break;
            }
        }
        Ok(())
    }

    /// Keep updating for `duration_ms`.
    pub fn delay_and_update(
        &mut self,
        duration_ms: u32,
        mut on_tick: impl FnMut(&mut Self),
    ) -> Result<(), M::Error> {
        let end = self.clock.now_ms().wrapping_add(duration_ms);
        while !reached(self.clock.now_ms(), end) {
            on_tick(self);
            self.update_motors()?;
        }
        Ok(())
    }

    /// Stop both wheels and forget pending turn or ride requests. Idempotent.
    pub fn stop(&mut self, mode: StopMode) -> Result<(), M::Error> {
        self.requested_rotation_deg = 0;
        self.requested_distance_mm = 0;
        let now = self.clock.now_ms();
        self.left.stop_at(mode, now)?;
        self.right.stop_at(mode, now)?;
        self.mode = match self.right.drive_mode() {
            DriveMode::Release => CarMode::Release,
            _ => CarMode::Brake,
        };
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        [&self.left, &self.right]
            .iter()
            .all(|wheel| wheel.current_duty() == 0 && wheel.ramp_state() != RampState::Starting)
    }

    /// Either wheel is ramping up or down.
    pub fn is_ramping(&self) -> bool {
        self.left.ramp_state().is_ramp() || self.right.ramp_state().is_ramp()
    }

    /// Both wheels are in `state`.
    pub fn is_state(&self, state: RampState) -> bool {
        self.left.ramp_state() == state && self.right.ramp_state() == state
    }

    /// Compare pulse counts of both wheels and move compensation toward the
    /// trailing wheel. Runs at most every `check_interval_ms`, only while
    /// driving forward with both wheels cruising or both driven directly.
    ///
    /// Returns whether a compensation changed.
    pub fn synchronize(&mut self, check_interval_ms: u32) -> Result<bool, M::Error> {
        let now = self.clock.now_ms();
        if !reached(now, self.next_sync_ms) {
            return Ok(false);
        }
        self.next_sync_ms = now.wrapping_add(check_interval_ms);

        if self.left.drive_mode() != DriveMode::Forward
            || self.right.drive_mode() != DriveMode::Forward
        {
            return Ok(false);
        }
        let cruising = self.is_state(RampState::Cruising);
        let direct = self.is_state(RampState::Idle)
            && self.left.current_duty() > 0
            && self.right.current_duty() > 0;
        if !(cruising || direct) {
            return Ok(false);
        }

        let (left, right) = (self.left.sync_count(), self.right.sync_count());
        let corrected = if left >= right + SYNC_PULSE_GAP {
            Self::correct_leading(&mut self.left, &mut self.right)?
        } else if right >= left + SYNC_PULSE_GAP {
            Self::correct_leading(&mut self.right, &mut self.left)?
        } else {
            false
        };
        if corrected {
            self.control_values_changed = true;
        }
        Ok(corrected)
    }

    fn correct_leading(
        leading: &mut M,
        trailing: &mut M,
    ) -> Result<bool, M::Error> {
        leading.align_sync_count(trailing.sync_count());
        if trailing.compensation() >= SYNC_COMPENSATION_STEP {
            trailing.set_compensation(trailing.compensation() - SYNC_COMPENSATION_STEP)?;
        } else if leading.current_duty() > leading.requested_duty() / 2 {
            leading.set_compensation(leading.compensation() + SYNC_COMPENSATION_STEP)?;
        } else {
            // Leading wheel already at half its requested duty.
            return Ok(false);
        }
        debug!(
            leading = ?leading.side(),
            leading_compensation = leading.compensation(),
            trailing_compensation = trailing.compensation(),
            "wheels synchronized"
        );
        Ok(true)
    }

    /// Signed compensation, positive when the right wheel is held back.
    pub fn compensation(&self) -> i16 {
        self.right.compensation() as i16 - self.left.compensation() as i16
    }

    /// Set the signed compensation; only one wheel ends up compensated.
    pub fn set_compensation(&mut self, right_compensation: i16) -> Result<(), M::Error> {
        let net = right_compensation.clamp(-MAX_COMPENSATION, MAX_COMPENSATION);
        if net >= 0 {
            self.left.set_compensation(0)?;
            self.right.set_compensation(net as u8)?;
        } else {
            self.right.set_compensation(0)?;
            self.left.set_compensation(net.unsigned_abs() as u8)?;
        }
        self.control_values_changed = true;
        Ok(())
    }

    /// Shift compensation toward the right wheel by `delta` (left if negative),
    /// releasing the other wheel's compensation first.
    pub fn change_compensation(&mut self, delta: i8) -> Result<(), M::Error> {
        self.set_compensation(self.compensation() + delta as i16)
    }

    pub fn set_drive_duty(&mut self, duty: u8) {
        self.left.set_drive_duty(duty);
        self.right.set_drive_duty(duty);
        self.control_values_changed = true;
    }

    pub fn set_drive_duty_and_compensation(
        &mut self,
        duty: u8,
        right_compensation: i16,
    ) -> Result<(), M::Error> {
        self.set_drive_duty(duty);
        self.set_compensation(right_compensation)
    }

    pub fn set_stop_mode(&mut self, mode: StopMode) {
        self.left.set_stop_mode(mode);
        self.right.set_stop_mode(mode);
    }

    /// Load stored tuning for both wheels; implausible fields are kept.
    pub fn load_motor_values<S: MotorValueStore>(&mut self, store: &mut S) -> Result<(), S::Error> {
        for wheel in [&mut self.left, &mut self.right] {
            if let Some(stored) = store.load(wheel.side().channel())? {
                let values = accept_stored(&wheel.motor_values(), &stored);
                wheel.apply_motor_values(&values);
            }
        }
        self.control_values_changed = true;
        Ok(())
    }

    pub fn save_motor_values<S: MotorValueStore>(&mut self, store: &mut S) -> Result<(), S::Error> {
        for wheel in [&self.left, &self.right] {
            store.save(wheel.side().channel(), &wheel.motor_values())?;
        }
        info!(compensation = self.compensation(), "motor values saved");
        Ok(())
    }

    /// Car ride distance: IMU distance, or the mean of both wheels.
    pub fn distance_mm(&self) -> u32 {
        let now = self.clock.now_ms();
        match self.feedback.car_motion() {
            Some(motion) => motion.distance_mm,
            None => (self.left.distance_mm(now) + self.right.distance_mm(now)) / 2,
        }
    }

    pub fn speed_cm_per_s(&self) -> u32 {
        let now = self.clock.now_ms();
        match self.feedback.car_motion() {
            Some(motion) => motion.speed_cm_per_s,
            None => (self.left.speed_cm_per_s(now) + self.right.speed_cm_per_s(now)) / 2,
        }
    }

    pub fn braking_distance_mm(&self) -> u32 {
        let now = self.clock.now_ms();
        match self.feedback.car_motion() {
            Some(motion) => {
                braking_distance_mm(motion.speed_cm_per_s, RAMP_DECELERATION_MM_PER_S2 * 2)
            }
            None => self
                .left
                .braking_distance_mm(now)
                .max(self.right.braking_distance_mm(now)),
        }
    }

    /// Heading change since the last IMU ride reset, half degrees.
    pub fn turn_angle_half_deg(&self) -> Option<i32> {
        self.feedback.car_motion().map(|motion| motion.turn_angle_half_deg)
    }

    /// Read and clear whether any applied duty changed.
    pub fn take_duty_changed(&mut self) -> bool {
        let left = self.left.take_duty_changed();
        let right = self.right.take_duty_changed();
        left || right
    }

    /// Read and clear whether compensation or drive duty changed.
    pub fn take_control_values_changed(&mut self) -> bool {
        core::mem::take(&mut self.control_values_changed)
    }
}
