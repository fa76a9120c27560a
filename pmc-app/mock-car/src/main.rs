use clap::Parser;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use embassy_executor::{Executor, Spawner};
use embassy_time::{Delay, Timer};
use pmc_core::mk_static;
use pmc_core::utils::controllers::{
    CAR_CHANNEL, CarCommand, CarController, Clock, EmbassyClock,
    feedback::{FeedbackSource, ImuFeedback, ImuSampler, SelectedFeedback, WheelEncoders},
    storage::RamValueStore,
};
use pmc_core::utils::math::{inertial::ImuSample, turn::Chassis};
use pmc_core::utils::motor::{
    Direction, DirectDrive, MotorSide, StopMode,
    encoder::{ChangeFlag, EncoderTracker, MILLIMETER_PER_PULSE},
    ramp::{RampConfig, RampMotor},
    sensor::EncoderSensor,
};
use pmc_core::utils::CarMotorControl;
use std::convert::Infallible;
use tracing::{debug, error, info};

/// Wheel speed per duty unit in µm/ms; duty 250 covers 1 m/s.
const UM_PER_MS_PER_DUTY: i32 = 4;

static CHANGED: ChangeFlag = ChangeFlag::new();
static LEFT_ENCODER: EncoderTracker<'static> = EncoderTracker::new(&CHANGED, MILLIMETER_PER_PULSE);
static RIGHT_ENCODER: EncoderTracker<'static> = EncoderTracker::new(&CHANGED, MILLIMETER_PER_PULSE);

/// Physical state of one simulated wheel, shared between motor, wheel task and IMU.
struct WheelState {
    duty: AtomicU8,
    forward: AtomicBool,
    position_um: AtomicI32,
    travel_um: AtomicI32,
}

impl WheelState {
    const fn new() -> Self {
        Self {
            duty: AtomicU8::new(0),
            forward: AtomicBool::new(true),
            position_um: AtomicI32::new(0),
            travel_um: AtomicI32::new(0),
        }
    }

    fn velocity_um_per_ms(&self) -> i32 {
        let v = self.duty.load(Ordering::Relaxed) as i32 * UM_PER_MS_PER_DUTY;
        if self.forward.load(Ordering::Relaxed) { v } else { -v }
    }
}

static LEFT_WHEEL: WheelState = WheelState::new();
static RIGHT_WHEEL: WheelState = WheelState::new();

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts
{
    /// Car commands as JSON, e.g. '{"cc":"go","mm":500}'
    #[clap(long = "cmd")]
    commands: Vec<String>,
    /// Time given to each command before the next one is sent
    #[clap(long, default_value_t = 3000)]
    pause_ms: u64,
    /// Guide turns and rides by the simulated IMU
    #[clap(long)]
    imu: bool,
    /// Use the four-wheel-drive turn factor
    #[clap(long)]
    four_wheel: bool,
}

/// Motor driver that moves a simulated wheel and logs to console.
struct SimMotor {
    side: MotorSide,
    wheel: &'static WheelState,
}

impl DirectDrive for SimMotor {
    type Error = Infallible;

    fn set_duty_and_direction(
        &mut self,
        duty: u8,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        debug!("{:?} motor: duty {} {:?}", self.side, duty, direction);
        self.wheel.forward.store(direction == Direction::Forward, Ordering::Relaxed);
        self.wheel.duty.store(duty, Ordering::Relaxed);
        Ok(())
    }

    fn stop(
        &mut self,
        mode: StopMode,
    ) -> Result<(), Self::Error> {
        debug!("{:?} motor: stop {:?}", self.side, mode);
        self.wheel.duty.store(0, Ordering::Relaxed);
        Ok(())
    }
}

/// IMU that sees the simulated car body without noise.
struct SimImu {
    degree_to_millimeter: f32,
    heading_base_um: i32,
    travel_base_um: i32,
}

impl SimImu {
    fn heading_um() -> i32 {
        RIGHT_WHEEL.position_um.load(Ordering::Relaxed) - LEFT_WHEEL.position_um.load(Ordering::Relaxed)
    }

    fn travel_um() -> i32 {
        RIGHT_WHEEL.travel_um.load(Ordering::Relaxed) + LEFT_WHEEL.travel_um.load(Ordering::Relaxed)
    }
}

impl ImuSampler for SimImu {
    fn sample_if_available(&mut self, _now_ms: u32) -> Option<ImuSample> {
        let angle_deg = (Self::heading_um() - self.heading_base_um) as f32 / 1000.0 / self.degree_to_millimeter;
        let rate_dps = (RIGHT_WHEEL.velocity_um_per_ms() - LEFT_WHEEL.velocity_um_per_ms()) as f32
            / self.degree_to_millimeter;
        let speed_um_per_ms =
            (RIGHT_WHEEL.velocity_um_per_ms().abs() + LEFT_WHEEL.velocity_um_per_ms().abs()) / 2;
        Some(ImuSample {
            turn_angle_half_deg: (angle_deg * 2.0).round() as i32,
            turn_rate: (rate_dps / 2.0) as i16,
            speed_cm_per_s: speed_um_per_ms / 10,
            distance_mm: (Self::travel_um() - self.travel_base_um) / 2000,
            calibration_offset: Some(0),
        })
    }

    fn reset_car_data(&mut self) {
        self.heading_base_um = Self::heading_um();
        self.travel_base_um = Self::travel_um();
    }
}

type SimWheel = RampMotor<SimMotor, EncoderSensor<'static>>;
type SimCar = CarMotorControl<SimWheel, SelectedFeedback<'static, SimImu>, Delay, EmbassyClock>;
type SimController = CarController<SimWheel, SelectedFeedback<'static, SimImu>, Delay, EmbassyClock, RamValueStore>;

/// Move one wheel every millisecond and fire its encoder every slot.
#[embassy_executor::task(pool_size = 2)]
async fn wheel_task(
    wheel: &'static WheelState,
    encoder: &'static EncoderTracker<'static>,
) -> ! {
    let clock = EmbassyClock;
    let mut to_next_pulse_um = (MILLIMETER_PER_PULSE * 1000) as i32;
    loop {
        Timer::after_millis(1).await;
        let v = wheel.velocity_um_per_ms();
        wheel.position_um.fetch_add(v, Ordering::Relaxed);
        wheel.travel_um.fetch_add(v.abs(), Ordering::Relaxed);
        to_next_pulse_um -= v.abs();
        if to_next_pulse_um <= 0 {
            to_next_pulse_um += (MILLIMETER_PER_PULSE * 1000) as i32;
            encoder.on_pulse(clock.now_ms());
        }
    }
}

#[embassy_executor::task]
async fn car_task(mut ctrl: SimController) -> ! {
    ctrl.car_ch().await
}

fn build_car(opts: &Opts) -> SimCar {
    let chassis = if opts.four_wheel {
        Chassis::FOUR_WHEEL_DRIVE
    } else {
        Chassis::TWO_WHEEL_DRIVE
    };
    let wheel = |side: MotorSide, state: &'static WheelState, encoder: &'static EncoderTracker<'static>| {
        RampMotor::new(
            SimMotor { side, wheel: state },
            EncoderSensor::new(encoder),
            side,
            RampConfig::default(),
        )
    };
    let feedback = if opts.imu {
        let mut imu = ImuFeedback::new(
            SimImu {
                degree_to_millimeter: chassis.degree_to_millimeter,
                heading_base_um: 0,
                travel_base_um: 0,
            },
            &CHANGED,
        );
        imu.refresh(EmbassyClock.now_ms());
        SelectedFeedback::Imu(imu)
    } else {
        SelectedFeedback::Encoders(WheelEncoders)
    };
    CarMotorControl::new(
        wheel(MotorSide::Left, &LEFT_WHEEL, &LEFT_ENCODER),
        wheel(MotorSide::Right, &RIGHT_WHEEL, &RIGHT_ENCODER),
        feedback,
        Delay,
        EmbassyClock,
        chassis,
    )
}

#[embassy_executor::task]
async fn main_task(spawner: Spawner) {
    let opts: Opts = Opts::parse();

    spawner.spawn(wheel_task(&LEFT_WHEEL, &LEFT_ENCODER)).unwrap();
    spawner.spawn(wheel_task(&RIGHT_WHEEL, &RIGHT_ENCODER)).unwrap();

    let car = build_car(&opts);
    let ctrl = CarController::new(car, RamValueStore::new());
    spawner.spawn(car_task(ctrl)).unwrap();

    for raw in &opts.commands {
        let command: CarCommand = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(e) => {
                error!("Invalid command {}: {}", raw, e);
                continue;
            }
        };
        CAR_CHANNEL.send(command).await;
        Timer::after_millis(opts.pause_ms).await;
        info!(
            left_mm = LEFT_WHEEL.position_um.load(Ordering::Relaxed) / 1000,
            right_mm = RIGHT_WHEEL.position_um.load(Ordering::Relaxed) / 1000,
            left_pulses = LEFT_ENCODER.count(),
            right_pulses = RIGHT_ENCODER.count(),
            "after {:?}",
            command
        );
    }
    info!("All commands done");
    std::process::exit(0);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let executor = mk_static!(Executor, Executor::new());
    executor.run(|spawner| {
        spawner.spawn(main_task(spawner)).unwrap();
    });
}
