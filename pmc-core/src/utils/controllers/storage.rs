//! Persistence of per-wheel tuning values.
//!
//! The store itself is a collaborator (EEPROM, flash page, file); this module
//! only defines the interface and the plausibility rules applied on load.

use core::convert::Infallible;

use tracing::warn;

pub use crate::utils::motor::MotorValues;

/// Stored drive duties outside `(MIN, MAX)` exclusive are ignored.
pub const STORED_DRIVE_DUTY_MIN: u8 = 40;
pub const STORED_DRIVE_DUTY_MAX: u8 = 222;
/// Stored compensations at or above this are ignored.
pub const STORED_COMPENSATION_LIMIT: u8 = 24;

/// Non-volatile storage of [`MotorValues`], addressed by channel (0 = left, 1 = right).
pub trait MotorValueStore {
    type Error: core::fmt::Debug;

    /// `Ok(None)` when the channel was never written.
    fn load(&mut self, channel: u8) -> Result<Option<MotorValues>, Self::Error>;

    fn save(
        &mut self,
        channel: u8,
        values: &MotorValues,
    ) -> Result<(), Self::Error>;
}

/// Merge plausible stored fields over `current`. Implausible fields keep
/// their current value.
pub fn accept_stored(
    current: &MotorValues,
    stored: &MotorValues,
) -> MotorValues {
    let mut values = *current;

    if stored.drive_duty > STORED_DRIVE_DUTY_MIN && stored.drive_duty < STORED_DRIVE_DUTY_MAX {
        values.drive_duty = stored.drive_duty;
    } else {
        warn!(drive_duty = stored.drive_duty, "stored drive duty rejected");
    }

    if stored.compensation < STORED_COMPENSATION_LIMIT {
        values.compensation = stored.compensation;
    } else {
        warn!(compensation = stored.compensation, "stored compensation rejected");
    }

    if stored.min_duty < stored.max_duty {
        values.min_duty = stored.min_duty;
        values.max_duty = stored.max_duty;
    } else {
        warn!(min = stored.min_duty, max = stored.max_duty, "stored duty limits rejected");
    }

    values
}

/// Volatile store, for hosts and boards without non-volatile memory.
#[derive(Debug, Default)]
pub struct RamValueStore {
    slots: [Option<MotorValues>; 2],
}

impl RamValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MotorValueStore for RamValueStore {
    type Error = Infallible;

    fn load(&mut self, channel: u8) -> Result<Option<MotorValues>, Self::Error> {
        Ok(self.slots.get(channel as usize).copied().flatten())
    }

    fn save(
        &mut self,
        channel: u8,
        values: &MotorValues,
    ) -> Result<(), Self::Error> {
        if let Some(slot) = self.slots.get_mut(channel as usize) {
            *slot = Some(*values);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plausible_values_are_taken() {
        let stored = MotorValues {
            compensation: 6,
            min_duty: 25,
            max_duty: 200,
            drive_duty: 180,
        };
        assert_eq!(accept_stored(&MotorValues::default(), &stored), stored);
    }

    #[test]
    fn test_erased_memory_keeps_defaults() {
        let erased = MotorValues {
            compensation: 0xFF,
            min_duty: 0xFF,
            max_duty: 0xFF,
            drive_duty: 0xFF,
        };
        assert_eq!(
            accept_stored(&MotorValues::default(), &erased),
            MotorValues::default()
        );
    }

    #[test]
    fn test_drive_duty_bounds_are_exclusive() {
        let current = MotorValues::default();
        let low = MotorValues {
            drive_duty: STORED_DRIVE_DUTY_MIN,
            ..current
        };
        let high = MotorValues {
            drive_duty: STORED_DRIVE_DUTY_MAX,
            ..current
        };
        assert_eq!(accept_stored(&current, &low).drive_duty, current.drive_duty);
        assert_eq!(accept_stored(&current, &high).drive_duty, current.drive_duty);

        let edge = MotorValues {
            drive_duty: STORED_DRIVE_DUTY_MIN + 1,
            compensation: STORED_COMPENSATION_LIMIT - 1,
            ..current
        };
        let merged = accept_stored(&current, &edge);
        assert_eq!(merged.drive_duty, 41);
        assert_eq!(merged.compensation, 23);
    }

    #[test]
    fn test_ram_store_round_trip_per_channel() {
        let mut store = RamValueStore::new();
        assert_eq!(store.load(0).unwrap(), None);
        let values = MotorValues {
            compensation: 3,
            ..MotorValues::default()
        };
        store.save(1, &values).unwrap();
        assert_eq!(store.load(0).unwrap(), None);
        assert_eq!(store.load(1).unwrap(), Some(values));
        assert_eq!(store.load(7).unwrap(), None);
    }
}
