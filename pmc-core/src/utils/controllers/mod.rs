//! Car controllers.
//!
//! - `car`: the dual-motor coordinator
//! - `feedback`: encoder or IMU feedback for the coordinator
//! - `storage`: persisted per-wheel tuning
//! - `i2c`: motor shield and IMU bindings on a shared I2C bus
//!
//! [`CarController`] runs the coordinator as an async task fed by
//! [`CAR_CHANNEL`].

pub mod car;
pub mod feedback;
pub mod i2c;
pub mod storage;

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use embassy_time::{Instant, Timer};
use embedded_hal::delay::DelayNs;
use serde::{Deserialize, Serialize};

use crate::utils::{
    math::turn::TurnMode,
    motor::{Direction, FeedbackDrive, StopMode},
};
use car::{CarMotorControl, SYNCHRONIZE_INTERVAL_MS};
use feedback::FeedbackSource;
use storage::MotorValueStore;

/// Channel used to receive car commands (`CarCommand` messages).
pub static CAR_CHANNEL: Channel<CriticalSectionRawMutex, CarCommand, 16> = Channel::new();

/// Period of the control loop while the car moves.
pub const CONTROL_TICK_MS: u64 = 2;

/// Millisecond time source, free running and wrapping.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// `embassy_time` based clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    #[inline]
    fn now_ms(&self) -> u32 {
        Instant::now().as_millis() as u32
    }
}

/// Car command variants.
///
/// Serialized as JSON with tag `"cc"`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(tag = "cc", rename_all = "snake_case")] // cc = car command
pub enum CarCommand {
    /// Straight ride, negative distances drive backward.
    Go { mm: i32 },
    /// Turn, positive degrees to the left. Defaults to an in-place turn.
    Rotate {
        deg: i16,
        turn: Option<TurnMode>,
        slow: Option<bool>,
    },
    /// Ramp up to drive duty and keep driving.
    Drive { dir: Direction },
    /// Apply a duty right away, optionally steering.
    Duty {
        duty: u8,
        dir: Direction,
        offset: Option<i8>,
    },
    /// Ramp down to a stop.
    RampDown,
    Stop { mode: StopMode },
    /// Shift wheel compensation, positive toward the right wheel.
    Compensate { delta: i8 },
    DriveDuty { duty: u8 },
    SaveValues,
    LoadValues,
}

/// Errors of the command loop.
#[derive(Debug)]
pub enum ControlError<E: core::fmt::Debug, SE: core::fmt::Debug> {
    Motor(E),
    Store(SE),
}

/// Runs a [`CarMotorControl`] from [`CAR_CHANNEL`].
pub struct CarController<M, F, D, C, S> {
    pub car: CarMotorControl<M, F, D, C>,
    store: S,
    sync_interval_ms: u32,
}

impl<M, F, D, C, S> CarController<M, F, D, C, S>
where
    M: FeedbackDrive,
    F: FeedbackSource,
    D: DelayNs,
    C: Clock,
    S: MotorValueStore,
{
    /// Wrap `car` and load its stored tuning.
    pub fn new(
        mut car: CarMotorControl<M, F, D, C>,
        mut store: S,
    ) -> Self {
        if let Err(e) = car.load_motor_values(&mut store) {
            tracing::warn!("Loading motor values failed, using defaults: {:?}", e);
        }
        CarController {
            car,
            store,
            sync_interval_ms: SYNCHRONIZE_INTERVAL_MS,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Start the commanded action without waiting for it to finish.
    pub fn execute_command(
        &mut self,
        command: CarCommand,
    ) -> Result<(), ControlError<M::Error, S::Error>> {
        let car = &mut self.car;
        match command {
            CarCommand::Go { mm } => car.start_go_distance_signed(mm).map_err(ControlError::Motor),
            CarCommand::Rotate { deg, turn, slow } => car
                .start_rotate(deg, turn.unwrap_or(TurnMode::InPlace), slow.unwrap_or(false))
                .map_err(ControlError::Motor),
            CarCommand::Drive { dir } => car.start_ramp_up(dir).map_err(ControlError::Motor),
            CarCommand::Duty { duty, dir, offset } => car
                .set_duty_with_offset(duty, dir, offset.unwrap_or(0))
                .map_err(ControlError::Motor),
            CarCommand::RampDown => {
                car.start_ramp_down();
                Ok(())
            }
            CarCommand::Stop { mode } => car.stop(mode).map_err(ControlError::Motor),
            CarCommand::Compensate { delta } => {
                car.change_compensation(delta).map_err(ControlError::Motor)
            }
            CarCommand::DriveDuty { duty } => {
                car.set_drive_duty(duty);
                Ok(())
            }
            CarCommand::SaveValues => car
                .save_motor_values(&mut self.store)
                .map_err(ControlError::Store),
            CarCommand::LoadValues => car
                .load_motor_values(&mut self.store)
                .map_err(ControlError::Store),
        }
    }

    /// One control step. Returns whether the car still moves.
    pub fn tick(&mut self) -> Result<bool, M::Error> {
        let moving = self.car.update_motors()?;
        if moving {
            self.car.synchronize(self.sync_interval_ms)?;
        }
        Ok(moving)
    }

    fn handle(&mut self, command: CarCommand) {
        tracing::info!("Received car command: {:?}", command);
        match self.execute_command(command) {
            Ok(()) => tracing::debug!("Car command started"),
            Err(e) => tracing::error!("Car command failed: {:?}", e),
        }
    }

    pub async fn car_ch(&mut self) -> ! {
        loop {
            if self.car.is_stopped() {
                let command = CAR_CHANNEL.receiver().receive().await;
                self.handle(command);
            }
            while let Ok(command) = CAR_CHANNEL.try_receive() {
                self.handle(command);
            }

            if let Err(e) = self.tick() {
                tracing::error!("Motor update failed, stopping: {:?}", e);
                if let Err(e) = self.car.stop(StopMode::Brake) {
                    tracing::error!("Stop failed: {:?}", e);
                }
            }
            Timer::after_millis(CONTROL_TICK_MS).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json() {
        let go: CarCommand = serde_json::from_str(r#"{"cc":"go","mm":-250}"#).unwrap();
        assert_eq!(go, CarCommand::Go { mm: -250 });

        let rotate: CarCommand =
            serde_json::from_str(r#"{"cc":"rotate","deg":90,"turn":"forward"}"#).unwrap();
        assert_eq!(
            rotate,
            CarCommand::Rotate {
                deg: 90,
                turn: Some(TurnMode::Forward),
                slow: None,
            }
        );

        let stop: CarCommand = serde_json::from_str(r#"{"cc":"stop","mode":"release"}"#).unwrap();
        assert_eq!(stop, CarCommand::Stop { mode: StopMode::Release });

        let save: CarCommand = serde_json::from_str(r#"{"cc":"save_values"}"#).unwrap();
        assert_eq!(save, CarCommand::SaveValues);
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        assert!(serde_json::from_str::<CarCommand>(r#"{"cc":"fly"}"#).is_err());
    }
}
