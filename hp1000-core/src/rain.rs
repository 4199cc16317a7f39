//! Rain accumulation.
//!
//! The console only reports running totals (daily, weekly, ...). Consumers
//! want the rain that fell between two observations, so the driver derives a
//! [`Field::Rain`] value from consecutive daily totals.

use chrono::NaiveDate;

use crate::record::{Field, RawValues};

/// Tracks the previous daily rain total within one session or catch-up run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RainTracker {
    last: Option<(NaiveDate, f64)>,
}

impl RainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rain since the previous observation.
    ///
    /// `None` for the first observation and whenever either total is missing.
    /// `0` after a day rollover or when the total went down (console reset).
    pub fn update(&mut self, date: NaiveDate, daily_total: Option<f64>) -> Option<f64> {
        let previous = self.last.take();
        let total = daily_total?;
        self.last = Some((date, total));

        let (last_date, last_total) = previous?;
        if date != last_date || total < last_total {
            Some(0.0)
        } else {
            Some(round_rain(total - last_total))
        }
    }

    /// Derive [`Field::Rain`] from the daily total in `values`.
    pub fn apply(&mut self, date: NaiveDate, values: &mut RawValues) {
        let daily = values.get(&Field::DailyRain).copied();
        match self.update(date, daily) {
            Some(rain) => {
                values.insert(Field::Rain, rain);
            }
            None => {
                values.remove(&Field::Rain);
            }
        }
    }
}

/// Differences of decimal totals pick up float noise: 1.3 - 1.2 = 0.10000000000000009
fn round_rain(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_first_observation_has_no_rain() {
        let mut rain = RainTracker::new();
        assert_eq!(rain.update(day(1), Some(2.0)), None);
        assert_eq!(rain.update(day(1), Some(2.0)), Some(0.0));
        assert_eq!(rain.update(day(1), Some(3.3)), Some(1.3));
    }

    #[test]
    fn test_rollover_and_reset() {
        let mut rain = RainTracker::new();
        rain.update(day(1), Some(5.0));
        // New day: the total restarted from zero
        assert_eq!(rain.update(day(2), Some(0.4)), Some(0.0));
        assert_eq!(rain.update(day(2), Some(1.2)), Some(0.8));
        // Total went down on the same day (manual reset on the console)
        assert_eq!(rain.update(day(2), Some(0.2)), Some(0.0));
    }

    #[test]
    fn test_missing_total_breaks_the_chain() {
        let mut rain = RainTracker::new();
        rain.update(day(1), Some(1.0));
        assert_eq!(rain.update(day(1), None), None);
        assert_eq!(rain.update(day(1), Some(1.5)), None);
        assert_eq!(rain.update(day(1), Some(1.7)), Some(0.2));

        let mut fresh = RainTracker::new();
        assert_eq!(fresh.update(day(1), Some(1.9)), None);
    }

    #[test]
    fn test_apply_sets_rain_field() {
        let mut rain = RainTracker::new();
        let mut values = RawValues::new();
        values.insert(Field::DailyRain, 1.0);
        rain.apply(day(3), &mut values);
        assert!(!values.contains_key(&Field::Rain));

        values.insert(Field::DailyRain, 1.6);
        rain.apply(day(3), &mut values);
        assert_eq!(values.get(&Field::Rain), Some(&0.6));
    }
}
