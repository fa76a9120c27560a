//! I2C hardware bindings for the motor car.
//!
//! - [`ShieldMotor`]: one DC motor on an Adafruit-style motor shield, whose
//!   PCA9685 drives the PWM and both bridge inputs of each TB6612 channel.
//! - [`ImuCarData`]: ICM42670 readings integrated into car motion.
//!
//! Both devices share the bus through `embedded_hal_bus::i2c::RefCellDevice`.

use core::cell::RefCell;

use embedded_hal::{delay::DelayNs, i2c::I2c};
use embedded_hal_bus::i2c::RefCellDevice;
use icm42670::{
    accelerometer::{Accelerometer, Error as AccelerometerError},
    Address as ImuAddress,
    Error as ImuError,
    Icm42670,
};
use pwm_pca9685::{Address as PwmAddress, Channel, Error as PwmError, Pca9685};

use super::feedback::ImuSampler;
use crate::utils::{
    math::inertial::{ImuIntegrator, ImuSample},
    motor::{Direction, DirectDrive, MotorSide, StopMode},
};

/// Default I2C address of the motor shield PWM controller.
pub const PWM_ADDRESS: u8 = 0x60;
/// Prescale for 1600 Hz PWM, the fastest the PCA9685 accepts.
pub const PWM_PRESCALE_1600HZ: u8 = 3;
/// PCA9685 resolution per duty step.
const PWM_COUNTS_PER_DUTY: u16 = 16;
/// Time between two IMU samples.
pub const IMU_SAMPLE_PERIOD_MS: u32 = 10;

/// Errors that can occur when interacting with I2C-based devices.
#[derive(Debug)]
pub enum DeviceError<E: core::fmt::Debug> {
    PwmError(PwmError<E>),
    ImuError(ImuError<E>),
    AccelError(AccelerometerError<ImuError<E>>),
    /// The shared PWM controller is borrowed elsewhere.
    PwmBusy,
}

/// Shield pins of one motor.
#[derive(Debug, Clone, Copy)]
pub struct ShieldChannels {
    pub pwm: Channel,
    pub forward: Channel,
    pub backward: Channel,
}

impl ShieldChannels {
    /// Motor 1 is the left wheel, motor 2 the right one.
    pub fn for_side(side: MotorSide) -> Self {
        match side {
            MotorSide::Left => ShieldChannels {
                pwm: Channel::C8,
                backward: Channel::C9,
                forward: Channel::C10,
            },
            MotorSide::Right => ShieldChannels {
                pwm: Channel::C13,
                backward: Channel::C12,
                forward: Channel::C11,
            },
        }
    }
}

/// PWM controller shared by both shield motors.
pub type ShieldPwm<'a, I2C> = RefCell<Pca9685<RefCellDevice<'a, I2C>>>;

/// Create, enable and clock the shield PWM controller.
pub fn init_shield<I2C, E>(
    i2c_bus: &RefCell<I2C>,
    address: u8,
) -> Result<Pca9685<RefCellDevice<'_, I2C>>, DeviceError<E>>
where
    I2C: I2c<Error = E>,
    E: core::fmt::Debug,
{
    let mut pwm =
        Pca9685::new(RefCellDevice::new(i2c_bus), PwmAddress::from(address)).map_err(DeviceError::PwmError)?;
    pwm.enable().map_err(DeviceError::PwmError)?;
    pwm.set_prescale(PWM_PRESCALE_1600HZ)
        .map_err(DeviceError::PwmError)?;
    tracing::info!("motor shield enabled at 1600Hz");
    Ok(pwm)
}

/// One DC motor of the shield.
pub struct ShieldMotor<'p, 'a, I2C> {
    pwm: &'p ShieldPwm<'a, I2C>,
    channels: ShieldChannels,
}

impl<'p, 'a, I2C, E> ShieldMotor<'p, 'a, I2C>
where
    I2C: I2c<Error = E>,
    E: core::fmt::Debug,
{
    pub fn new(
        pwm: &'p ShieldPwm<'a, I2C>,
        side: MotorSide,
    ) -> Self {
        Self {
            pwm,
            channels: ShieldChannels::for_side(side),
        }
    }

    fn write_pins(
        &mut self,
        forward: bool,
        backward: bool,
    ) -> Result<(), DeviceError<E>> {
        let mut pwm = self.pwm.try_borrow_mut().map_err(|_| DeviceError::PwmBusy)?;
        for (channel, high) in [(self.channels.forward, forward), (self.channels.backward, backward)] {
            let written = if high {
                pwm.set_channel_full_on(channel, 0)
            } else {
                pwm.set_channel_full_off(channel)
            };
            written.map_err(DeviceError::PwmError)?;
        }
        Ok(())
    }

    fn write_duty(&mut self, duty: u8) -> Result<(), DeviceError<E>> {
        let mut pwm = self.pwm.try_borrow_mut().map_err(|_| DeviceError::PwmBusy)?;
        pwm.set_channel_on_off(self.channels.pwm, 0, duty as u16 * PWM_COUNTS_PER_DUTY)
            .map_err(DeviceError::PwmError)
    }
}

impl<I2C, E> DirectDrive for ShieldMotor<'_, '_, I2C>
where
    I2C: I2c<Error = E>,
    E: core::fmt::Debug,
{
    type Error = DeviceError<E>;

    fn set_duty_and_direction(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        match direction {
            Direction::Forward => self.write_pins(true, false)?,
            Direction::Backward => self.write_pins(false, true)?,
        }
        self.write_duty(duty)
    }

    fn stop(
        &mut self,
        mode: StopMode,
    ) -> Result<(), Self::Error> {
        self.write_duty(0)?;
        match mode {
            StopMode::Brake => self.write_pins(true, true),
            StopMode::Release => self.write_pins(false, false),
            StopMode::KeepPrevious => Ok(()),
        }
    }
}

/// ICM42670 mounted with its x axis pointing forward.
pub struct ImuCarData<'a, I2C: 'static> {
    imu: Icm42670<RefCellDevice<'a, I2C>>,
    integrator: ImuIntegrator,
    last_sample_ms: Option<u32>,
}

impl<'a, I2C, E> ImuCarData<'a, I2C>
where
    I2C: I2c<Error = E> + 'static,
    E: core::fmt::Debug,
{
    /// Probe the IMU; it comes up in six-axis low-noise mode.
    pub fn new(i2c_bus: &'a RefCell<I2C>) -> Result<Self, DeviceError<E>> {
        let imu = Icm42670::new(RefCellDevice::new(i2c_bus), ImuAddress::Primary)
            .map_err(DeviceError::ImuError)?;
        Ok(Self {
            imu,
            integrator: ImuIntegrator::new(),
            last_sample_ms: None,
        })
    }

    /// Gyro z in °/s and forward acceleration in g.
    fn read_motion(&mut self) -> Result<(f32, f32), DeviceError<E>> {
        let gyro = self.imu.gyro_norm().map_err(DeviceError::ImuError)?;
        let accel = self.imu.accel_norm().map_err(DeviceError::AccelError)?;
        Ok((gyro.z, accel.x))
    }

    /// Average `samples` readings of the standing car into rest offsets.
    pub fn calibrate<D: DelayNs>(
        &mut self,
        delay: &mut D,
        samples: u16,
    ) -> Result<(), DeviceError<E>> {
        let samples = samples.max(1);
        let (mut gyro_sum, mut accel_sum) = (0.0f32, 0.0f32);
        for _ in 0..samples {
            let (gyro, accel) = self.read_motion()?;
            gyro_sum += gyro;
            accel_sum += accel;
            delay.delay_ms(IMU_SAMPLE_PERIOD_MS);
        }
        let n = samples as f32;
        self.integrator.calibrate(gyro_sum / n, accel_sum / n);
        tracing::info!(gyro_offset = gyro_sum / n, accel_offset = accel_sum / n, "IMU calibrated");
        Ok(())
    }
}

impl<I2C, E> ImuSampler for ImuCarData<'_, I2C>
where
    I2C: I2c<Error = E> + 'static,
    E: core::fmt::Debug,
{
    fn sample_if_available(&mut self, now_ms: u32) -> Option<ImuSample> {
        let dt_ms = match self.last_sample_ms {
            Some(last) if now_ms.wrapping_sub(last) < IMU_SAMPLE_PERIOD_MS => return None,
            Some(last) => now_ms.wrapping_sub(last),
            None => IMU_SAMPLE_PERIOD_MS,
        };
        self.last_sample_ms = Some(now_ms);
        match self.read_motion() {
            Ok((gyro_z, accel_forward)) => Some(self.integrator.step(gyro_z, accel_forward, dt_ms)),
            Err(e) => {
                tracing::error!("Failed to read IMU data: {:?}", e);
                None
            }
        }
    }

    fn reset_car_data(&mut self) {
        self.integrator.reset_car_data();
    }
}
