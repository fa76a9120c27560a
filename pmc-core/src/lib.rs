//! Core motor control for two-wheel PWM robot cars on no-std embedded platforms.
//!
//! Ramped starts and stops, encoder distance rides, wheel synchronization and
//! IMU-guided turns. The host simulation lives in `pmc-app/mock-car`.
#![no_std]

pub mod utils;
