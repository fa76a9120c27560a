//! Math helpers for the motor car.
//!
//! - `braking`: stopping distance and turn overrun prediction
//! - `turn`: degree to wheel distance conversion per turn mode
//! - `inertial`: dead reckoning from gyro and accelerometer readings

pub mod braking;
pub mod inertial;
pub mod turn;
