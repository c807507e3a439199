//! Simulated logical clock.
//!
//! The allocator owns the only writable [`SimClock`]. Every handled event
//! advances it by a fixed quantum; nothing here consults wall-clock time.
//! Workers see the clock through a [`ClockReader`], which the allocator
//! refreshes after each advance, and stamp their messages with it.

use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Default advance per handled event.
pub const DEFAULT_QUANTUM_NS: u32 = 5_000;

const_assert!(DEFAULT_QUANTUM_NS < NSEC_PER_SEC);

/// A point in logical time. `nsecs` is always below [`NSEC_PER_SEC`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ClockValue {
    pub secs: u32,
    pub nsecs: u32,
}

impl ClockValue {
    pub const ZERO: ClockValue = ClockValue { secs: 0, nsecs: 0 };

    pub fn new(secs: u32, nsecs: u32) -> Self {
        let mut v = ClockValue { secs, nsecs: 0 };
        v.add_nanos(nsecs as u64);
        v
    }

    pub fn from_nanos(ns: u64) -> Self {
        let secs = ns / NSEC_PER_SEC as u64;
        ClockValue {
            secs: secs.min(u32::MAX as u64) as u32,
            nsecs: (ns % NSEC_PER_SEC as u64) as u32,
        }
    }

    pub fn as_nanos(&self) -> u64 {
        self.secs as u64 * NSEC_PER_SEC as u64 + self.nsecs as u64
    }

    /// Add `ns`, carrying whole seconds out of the sub-second field.
    pub fn add_nanos(&mut self, ns: u64) {
        let total = self.nsecs as u64 + ns;
        let carry = total / NSEC_PER_SEC as u64;
        self.nsecs = (total % NSEC_PER_SEC as u64) as u32;
        self.secs = self.secs.saturating_add(carry.min(u32::MAX as u64) as u32);
    }

    pub fn plus_nanos(mut self, ns: u64) -> Self {
        self.add_nanos(ns);
        self
    }
}

impl fmt::Display for ClockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:09}", self.secs, self.nsecs)
    }
}

/// The allocator's clock.
#[derive(Debug)]
pub struct SimClock {
    now: ClockValue,
    quantum_ns: u32,
    published: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new(quantum_ns: u32) -> Self {
        Self {
            now: ClockValue::ZERO,
            quantum_ns,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn now(&self) -> ClockValue {
        self.now
    }

    pub fn quantum_ns(&self) -> u32 {
        self.quantum_ns
    }

    /// Advance by one quantum and publish the new value.
    pub fn tick(&mut self) -> ClockValue {
        self.advance(self.quantum_ns as u64)
    }

    pub fn advance(&mut self, ns: u64) -> ClockValue {
        self.now.add_nanos(ns);
        self.published.store(self.now.as_nanos(), Ordering::Release);
        self.now
    }

    pub fn reader(&self) -> ClockReader {
        ClockReader {
            published: self.published.clone(),
        }
    }
}

/// Read-only view of the allocator's clock, shared with workers.
#[derive(Debug, Clone)]
pub struct ClockReader {
    published: Arc<AtomicU64>,
}

impl ClockReader {
    pub fn now(&self) -> ClockValue {
        ClockValue::from_nanos(self.published.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carry_into_seconds() {
        let mut v = ClockValue::new(0, NSEC_PER_SEC - 1);
        v.add_nanos(1);
        assert_eq!(v, ClockValue { secs: 1, nsecs: 0 });

        let v = ClockValue::new(2, 2_500_000_000);
        assert_eq!(v, ClockValue { secs: 4, nsecs: 500_000_000 });
    }

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = SimClock::new(DEFAULT_QUANTUM_NS);
        assert_eq!(clock.quantum_ns(), DEFAULT_QUANTUM_NS);
        let mut prev = clock.now();
        for _ in 0..500_000 {
            let now = clock.tick();
            assert!(now > prev);
            assert!(now.nsecs < NSEC_PER_SEC);
            prev = now;
        }
        assert_eq!(prev.as_nanos(), 500_000 * DEFAULT_QUANTUM_NS as u64);
        assert_eq!(prev.secs, 2);
    }

    #[test]
    fn test_reader_sees_published_value() {
        let mut clock = SimClock::new(700_000_000);
        let reader = clock.reader();
        assert_eq!(reader.now(), ClockValue::ZERO);
        clock.tick();
        clock.tick();
        assert_eq!(reader.now(), ClockValue::new(1, 400_000_000));
    }

    #[test]
    fn test_display() {
        assert_eq!(ClockValue::new(3, 42).to_string(), "3:000000042");
    }
}
