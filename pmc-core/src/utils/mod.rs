//! Utility re-exports and helper macros for the PWM motor car.
//!
//! - `motor`: base motor capability, encoder tracking and the ramp controller
//! - `math`: braking and turn prediction, turn geometry, IMU integration
//! - `controllers`: the dual-motor coordinator, feedback sources, persistence
//!   and the I2C hardware bindings
//!
//! The `mk_static!` macro simplifies static initialization in no-std contexts.

pub mod controllers;
pub mod math;
pub mod motor;

pub use controllers::{car::CarMotorControl, CarController};
pub use embassy_time::{Duration, Instant, Timer};
pub use motor::{encoder::EncoderTracker, ramp::RampMotor};

#[doc(hidden)]
pub use static_cell;

#[macro_export]
/// Initialize a no-std static cell and write the given value into it.
///
/// This macro creates a `StaticCell` for type `$t` and initializes
/// it with `$val`, returning a mutable reference to the stored value.
macro_rules! mk_static {
    ($t:ty, $val:expr) => {{
        static STATIC_CELL: $crate::utils::static_cell::StaticCell<$t> =
            $crate::utils::static_cell::StaticCell::new();
        STATIC_CELL.uninit().write($val)
    }};
}
