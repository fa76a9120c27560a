//! Stopping predictions used to start ramp-downs early enough.

/// Deceleration of a braked car, mm/s².
pub const RAMP_DECELERATION_MM_PER_S2: u32 = 3500;

/// Distance a wheel still covers after braking from `speed_cm_per_s`.
///
/// `s = v² / 2a`, with `v` in cm/s and `deceleration_times_2` in mm/s², which
/// gives millimeters after dividing by 100.
pub fn braking_distance_mm(
    speed_cm_per_s: u32,
    deceleration_times_2: u32,
) -> u32 {
    let divisor = (deceleration_times_2 / 100).max(1);
    speed_cm_per_s * speed_cm_per_s / divisor
}

/// Half degrees a car still turns after stopping at `turn_rate`, given in
/// units of 2 °/s.
pub fn turn_overrun_half_degree(turn_rate: u16) -> u32 {
    let rate = turn_rate as u32;
    rate * rate / 20
}
