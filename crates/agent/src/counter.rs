//! Per-device daily output budget
//!
//! Counts assistant-text characters per device id, rolling over at local
//! midnight. Consulted before every turn when `max_output_size` is set.

use parking_lot::Mutex;
use std::collections::HashMap;

use chrono::{Local, NaiveDate};

pub struct OutputCounter {
    state: Mutex<CounterState>,
}

struct CounterState {
    day: NaiveDate,
    by_device: HashMap<String, usize>,
}

impl Default for OutputCounter {
    fn default() -> Self {
        Self {
            state: Mutex::new(CounterState {
                day: Local::now().date_naive(),
                by_device: HashMap::new(),
            }),
        }
    }
}

impl OutputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn rollover(state: &mut CounterState) {
        let today = Local::now().date_naive();
        if state.day != today {
            state.day = today;
            state.by_device.clear();
        }
    }

    /// Whether the device has already spent its daily budget.
    pub fn exceeded(&self, device_id: &str, max_output_size: usize) -> bool {
        if max_output_size == 0 {
            return false;
        }
        let mut state = self.state.lock();
        Self::rollover(&mut state);
        state
            .by_device
            .get(device_id)
            .is_some_and(|&used| used >= max_output_size)
    }

    /// Record assistant output for the device.
    pub fn add(&self, device_id: &str, chars: usize) {
        let mut state = self.state.lock();
        Self::rollover(&mut state);
        *state.by_device.entry(device_id.to_string()).or_default() += chars;
    }

    pub fn used(&self, device_id: &str) -> usize {
        let mut state = self.state.lock();
        Self::rollover(&mut state);
        state.by_device.get(device_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_caps() {
        let counter = OutputCounter::new();
        assert!(!counter.exceeded("dev", 100));
        counter.add("dev", 60);
        assert!(!counter.exceeded("dev", 100));
        counter.add("dev", 60);
        assert!(counter.exceeded("dev", 100));
        assert_eq!(counter.used("dev"), 120);
    }

    #[test]
    fn zero_budget_disables_the_cap() {
        let counter = OutputCounter::new();
        counter.add("dev", 10_000);
        assert!(!counter.exceeded("dev", 0));
    }

    #[test]
    fn devices_are_independent() {
        let counter = OutputCounter::new();
        counter.add("a", 100);
        assert!(counter.exceeded("a", 50));
        assert!(!counter.exceeded("b", 50));
    }
}
