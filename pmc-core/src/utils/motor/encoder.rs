//! Encoder pulse tracking, shared between the pulse interrupt and the control loop.
//!
//! [`EncoderTracker::on_pulse`] is the only writer of every field, so it may run
//! in interrupt context while the control loop reads. Each field is a single
//! atomic load or store; no read-modify-write is needed, which keeps the
//! tracker usable on cores without compare-and-swap.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

/// Distance covered per encoder slot: 220 mm wheel circumference, 20 slots.
pub const MILLIMETER_PER_PULSE: u32 = 11;
/// Pulses closer than this after the previous one are contact ringing.
pub const RING_SUPPRESS_MS: u32 = 3;
/// A pulse interval longer than this is treated as a fresh start.
pub const ENCODER_TIMEOUT_MS: u32 = 400;
/// Speed reads as zero once the last pulse is older than this.
pub const SPEED_STALE_MS: u32 = 1000;
/// Intervals averaged for [`EncoderTracker::average_speed_cm_per_s`], one revolution.
pub const AVERAGE_SPEED_SAMPLES: usize = 20;

const TIMESTAMP_SLOTS: usize = AVERAGE_SPEED_SAMPLES + 1;

/// Raised whenever a sensor produced a new value; consumed by display logic.
pub struct ChangeFlag(AtomicBool);

impl ChangeFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    #[inline]
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Read and clear.
    pub fn take(&self) -> bool {
        let raised = self.0.load(Ordering::Acquire);
        if raised {
            self.0.store(false, Ordering::Release);
        }
        raised
    }
}

impl Default for ChangeFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulse bookkeeping for one wheel encoder.
pub struct EncoderTracker<'a> {
    changed: &'a ChangeFlag,
    mm_per_pulse: u32,
    last_pulse_ms: AtomicU32,
    interval_ms: AtomicU32,
    count: AtomicU32,
    timestamps: [AtomicU32; TIMESTAMP_SLOTS],
    next_slot: AtomicU8,
    window_valid: AtomicBool,
}

impl<'a> EncoderTracker<'a> {
    pub const fn new(
        changed: &'a ChangeFlag,
        mm_per_pulse: u32,
    ) -> Self {
        Self {
            changed,
            mm_per_pulse,
            last_pulse_ms: AtomicU32::new(0),
            interval_ms: AtomicU32::new(0),
            count: AtomicU32::new(0),
            timestamps: [const { AtomicU32::new(0) }; TIMESTAMP_SLOTS],
            next_slot: AtomicU8::new(0),
            window_valid: AtomicBool::new(false),
        }
    }

    /// Record one encoder edge. Call from the pulse interrupt.
    ///
    /// Returns `false` when the edge was discarded as ringing.
    pub fn on_pulse(&self, now_ms: u32) -> bool {
        let delta = now_ms.wrapping_sub(self.last_pulse_ms.load(Ordering::Relaxed));
        if delta <= RING_SUPPRESS_MS {
            return false;
        }
        self.last_pulse_ms.store(now_ms, Ordering::Relaxed);

        let mut slot = self.next_slot.load(Ordering::Relaxed) as usize;
        if delta < ENCODER_TIMEOUT_MS {
            self.interval_ms.store(delta, Ordering::Relaxed);
        } else {
            // fresh start, the averaging window restarts too
            self.interval_ms.store(0, Ordering::Relaxed);
            self.window_valid.store(false, Ordering::Relaxed);
            slot = 0;
        }

        self.timestamps[slot].store(now_ms, Ordering::Relaxed);
        slot += 1;
        if slot >= TIMESTAMP_SLOTS {
            slot = 0;
            self.window_valid.store(true, Ordering::Relaxed);
        }
        self.next_slot.store(slot as u8, Ordering::Relaxed);

        let count = self.count.load(Ordering::Relaxed).wrapping_add(1);
        self.count.store(count, Ordering::Release);
        self.changed.raise();
        true
    }

    /// Pulses since power-up, wrapping.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn last_pulse_ms(&self) -> u32 {
        self.last_pulse_ms.load(Ordering::Acquire)
    }

    /// Last pulse interval, 0 after a fresh start.
    pub fn interval_ms(&self) -> u32 {
        self.interval_ms.load(Ordering::Acquire)
    }

    pub fn mm_per_pulse(&self) -> u32 {
        self.mm_per_pulse
    }

    fn speed_scale(&self) -> u32 {
        // mm per pulse -> cm/s per 1/ms
        self.mm_per_pulse * 100
    }

    /// Speed from the last pulse interval.
    pub fn speed_cm_per_s(&self, now_ms: u32) -> u32 {
        if now_ms.wrapping_sub(self.last_pulse_ms()) > SPEED_STALE_MS {
            return 0;
        }
        match self.interval_ms() {
            0 => 0,
            interval => self.speed_scale() / interval,
        }
    }

    /// Speed averaged over the last revolution, or over what has been
    /// recorded since the last fresh start.
    pub fn average_speed_cm_per_s(&self, now_ms: u32) -> u32 {
        self.average_speed_over(AVERAGE_SPEED_SAMPLES, now_ms)
    }

    /// Speed averaged over the last `pulses` intervals, capped at one revolution.
    pub fn average_speed_over(
        &self,
        pulses: usize,
        now_ms: u32,
    ) -> u32 {
        if pulses == 0 || now_ms.wrapping_sub(self.last_pulse_ms()) > SPEED_STALE_MS {
            return 0;
        }
        let next = self.next_slot.load(Ordering::Relaxed) as usize;
        let newest = (next + TIMESTAMP_SLOTS - 1) % TIMESTAMP_SLOTS;
        let available = if self.window_valid.load(Ordering::Relaxed) {
            AVERAGE_SPEED_SAMPLES
        } else {
            next.saturating_sub(1)
        };
        let pulses = pulses.min(available);
        if pulses == 0 {
            return 0;
        }
        let oldest = (newest + TIMESTAMP_SLOTS - pulses) % TIMESTAMP_SLOTS;
        let span = self.timestamps[newest]
            .load(Ordering::Relaxed)
            .wrapping_sub(self.timestamps[oldest].load(Ordering::Relaxed));
        if span == 0 {
            return 0;
        }
        self.speed_scale() * pulses as u32 / span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pulse_every(
        tracker: &EncoderTracker,
        start_ms: u32,
        interval_ms: u32,
        pulses: u32,
    ) -> u32 {
        let mut now = start_ms;
        for _ in 0..pulses {
            now += interval_ms;
            tracker.on_pulse(now);
        }
        now
    }

    #[test]
    fn test_ringing_is_suppressed() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        assert!(tracker.on_pulse(1000));
        assert!(!tracker.on_pulse(1002));
        assert!(!tracker.on_pulse(1003));
        assert!(tracker.on_pulse(1004));
        assert_eq!(tracker.count(), 2);
    }

    #[test]
    fn test_speed_from_interval() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        let now = pulse_every(&tracker, 1000, 20, 3);
        // 11 mm in 20 ms = 55 cm/s
        assert_eq!(tracker.speed_cm_per_s(now), 55);
        assert_eq!(tracker.speed_cm_per_s(now + SPEED_STALE_MS + 1), 0);
        assert!(flag.take());
        assert!(!flag.is_raised());
    }

    #[test]
    fn test_first_pulse_after_pause_has_no_speed() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        tracker.on_pulse(5000);
        assert_eq!(tracker.interval_ms(), 0);
        assert_eq!(tracker.speed_cm_per_s(5000), 0);
    }

    #[test]
    fn test_average_speed_before_and_after_window_fills() {
        let flag = ChangeFlag::new();
        let tracker = EncoderTracker::new(&flag, MILLIMETER_PER_PULSE);
        let now = pulse_every(&tracker, 1000, 500, 1);
        assert_eq!(tracker.average_speed_cm_per_s(now), 0);

        let now = pulse_every(&tracker, now, 10, 5);
        assert_eq!(tracker.average_speed_cm_per_s(now), 110);

        let now = pulse_every(&tracker, now, 20, 40);
        assert_eq!(tracker.average_speed_cm_per_s(now), 55);
        assert_eq!(tracker.average_speed_over(4, now), 55);
    }
}
