//! Motor capabilities shared by every wheel of the car.
//!
//! A wheel is built from two layers:
//!
//! - [`DirectDrive`]: the base motor, which only knows how to apply a duty and
//!   a direction or to stop with brake/release semantics.
//! - [`FeedbackDrive`]: a base motor wrapped with distance feedback and a ramp
//!   profile (see [`ramp::RampMotor`]). The coordinator only talks to this
//!   layer.
//!
//! The encoder pulse tracker in [`encoder`] is the interrupt-facing part of a
//! wheel; [`sensor`] turns its counts into ride distances.

pub mod encoder;
pub mod ramp;
pub mod sensor;

use serde::{Deserialize, Serialize};

/// Highest duty value any motor accepts.
pub const MAX_DUTY: u8 = u8::MAX;
/// Default cruise duty for rides that do not name one.
pub const DEFAULT_DRIVE_DUTY: u8 = 160;
/// Breakaway duty a ramp starts from.
pub const DEFAULT_START_DUTY: u8 = 40;
/// Lowest duty a ramp-down decays to.
pub const DEFAULT_MIN_DUTY: u8 = 30;

/// Rotation sense of a wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Backward,
            Direction::Backward => Direction::Forward,
        }
    }
}

/// How a wheel is left after its duty drops to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Both bridge outputs driven, shorting the motor.
    Brake,
    /// Bridge outputs floating, the wheel coasts.
    Release,
    /// Whatever stop mode the wheel was configured with.
    KeepPrevious,
}

/// What the bridge of one wheel is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    Forward,
    Backward,
    Brake,
    Release,
}

impl From<Direction> for DriveMode {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => DriveMode::Forward,
            Direction::Backward => DriveMode::Backward,
        }
    }
}

/// Ramp profile state of one wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RampState {
    /// No profile active. The wheel may still be driven directly.
    Idle,
    /// A ride was requested while the wheel stood still; the next update
    /// captures ride start and picks the first duty.
    Starting,
    RampingUp,
    Cruising,
    RampingDown,
}

impl RampState {
    pub fn is_ramp(self) -> bool {
        matches!(self, RampState::RampingUp | RampState::RampingDown)
    }
}

/// How the last ride of a wheel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideOutcome {
    InProgress,
    TargetReached,
    /// No encoder pulse arrived in time; the target was not confirmed.
    Stalled,
    /// Stopped from outside before the target was reached.
    Cancelled,
}

/// Wheel position on the chassis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorSide {
    Left,
    Right,
}

impl MotorSide {
    /// Persistence channel, left wheel first.
    pub fn channel(self) -> u8 {
        match self {
            MotorSide::Left => 0,
            MotorSide::Right => 1,
        }
    }
}

/// Persisted tuning of one wheel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorValues {
    pub compensation: u8,
    pub min_duty: u8,
    pub max_duty: u8,
    pub drive_duty: u8,
}

impl Default for MotorValues {
    fn default() -> Self {
        Self {
            compensation: 0,
            min_duty: DEFAULT_MIN_DUTY,
            max_duty: MAX_DUTY,
            drive_duty: DEFAULT_DRIVE_DUTY,
        }
    }
}

/// Base motor primitive: apply a duty in a direction, or stop.
pub trait DirectDrive {
    type Error: core::fmt::Debug;

    fn set_duty_and_direction(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error>;

    /// Zero the duty and leave the bridge braked or released.
    ///
    /// `KeepPrevious` leaves the direction pins untouched.
    fn stop(
        &mut self,
        mode: StopMode,
    ) -> Result<(), Self::Error>;

    fn max_duty(&self) -> u8 {
        MAX_DUTY
    }
}

impl<T: DirectDrive + ?Sized> DirectDrive for &mut T {
    type Error = T::Error;

    fn set_duty_and_direction(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        (**self).set_duty_and_direction(duty, direction)
    }

    fn stop(
        &mut self,
        mode: StopMode,
    ) -> Result<(), Self::Error> {
        (**self).stop(mode)
    }

    fn max_duty(&self) -> u8 {
        (**self).max_duty()
    }
}

/// A wheel with distance feedback and a ramp profile.
///
/// All time arguments are milliseconds from a free-running, wrapping clock.
pub trait FeedbackDrive {
    type Error: core::fmt::Debug;

    fn side(&self) -> MotorSide;
    fn ramp_state(&self) -> RampState;
    fn drive_mode(&self) -> DriveMode;
    /// Duty currently applied to the bridge, compensation included.
    fn current_duty(&self) -> u8;
    /// Cruise duty of the active ride.
    fn requested_duty(&self) -> u8;
    /// Default cruise duty.
    fn drive_duty(&self) -> u8;
    fn set_drive_duty(&mut self, duty: u8);
    fn compensation(&self) -> u8;
    /// Change the compensation; a moving wheel gets its new duty at once.
    fn set_compensation(&mut self, compensation: u8) -> Result<(), Self::Error>;
    fn set_stop_mode(&mut self, mode: StopMode);
    fn motor_values(&self) -> MotorValues;
    fn apply_motor_values(&mut self, values: &MotorValues);

    /// Drive with the given duty right away, no profile.
    fn set_duty(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error>;
    /// New duty in the current direction; ignored while stopped.
    fn change_duty(&mut self, duty: u8) -> Result<(), Self::Error>;
    /// Ramp up to `duty` without a distance target.
    fn start_ramp(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error>;
    /// Ride `distance_mm` at `duty`, ramping up and down on the way.
    fn start_go_distance(
        &mut self,
        duty: u8,
        distance_mm: u32,
        direction: Direction,
        now_ms: u32,
    ) -> Result<(), Self::Error>;
    /// Begin decaying the duty. With `hold_floor` the wheel creeps at the
    /// floor duty until stopped from outside, else it stops at the floor.
    fn start_ramp_down(
        &mut self,
        now_ms: u32,
        hold_floor: bool,
    );
    /// Advance the profile. Returns whether the wheel is still driven.
    fn update(&mut self, now_ms: u32) -> Result<bool, Self::Error>;
    /// Idempotent. A running ride is closed at the last update time.
    fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;
    /// Like `stop`, closing a running ride at `now_ms`.
    fn stop_at(
        &mut self,
        mode: StopMode,
        now_ms: u32,
    ) -> Result<(), Self::Error>;
    fn ride_outcome(&self) -> RideOutcome;

    fn distance_mm(&self, now_ms: u32) -> u32;
    fn speed_cm_per_s(&self, now_ms: u32) -> u32;
    fn braking_distance_mm(&self, now_ms: u32) -> u32;

    /// Pulse count used for wheel synchronization.
    fn sync_count(&self) -> u32;
    /// Rebase the synchronization count onto `count`.
    fn align_sync_count(&mut self, count: u32);

    /// Read and clear the flag raised whenever the applied duty changed.
    fn take_duty_changed(&mut self) -> bool;
}

/// Whether the wrapping clock `now_ms` has reached `deadline_ms`.
#[inline]
pub(crate) fn reached(
    now_ms: u32,
    deadline_ms: u32,
) -> bool {
    (now_ms.wrapping_sub(deadline_ms) as i32) >= 0
}
