//! Maintenance session
//!
//! While the beekeeper works on an open hive the scale readings are
//! meaningless. A session weighs every channel when it starts, waits until it
//! is told to stop (or until the watchdog ends it after
//! [`MAINTENANCE_MAX_DURATION`]), weighs again and folds the difference into
//! `offset2` through the [`CalibrationStateManager`].
//!
//! Settings are reloaded before the closing measurement because they are
//! often edited on site during maintenance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::calibration::{CalibrationReport, CalibrationStateManager};
use crate::clock::{Clock, SystemClock};
use crate::config::WeightSensorConfig;
use crate::constants::timing::{MAINTENANCE_MAX_DURATION, MAINTENANCE_POLL_INTERVAL};
use crate::errors::WeighResult;
use crate::hx711::ChipFactory;
use crate::settings::SettingsStore;
use crate::station::WeightStation;

/// One maintenance window
pub struct MaintenanceSession {
    store: SettingsStore,
    clock: Arc<dyn Clock>,
    max_duration: Duration,
    poll_interval: Duration,
    manager: CalibrationStateManager,
}

impl MaintenanceSession {
    /// Session writing corrections back to `store`
    pub fn new(store: SettingsStore) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            max_duration: MAINTENANCE_MAX_DURATION,
            poll_interval: MAINTENANCE_POLL_INTERVAL,
            manager: CalibrationStateManager::new(),
        }
    }

    /// Clock driving the watchdog
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Watchdog limit
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    /// Wait between checks for the end of maintenance
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run the session until `stop` is set or the watchdog fires
    ///
    /// The watchdog sets `stop` itself, so other threads watching the flag
    /// see the session end either way. Settings are only written when some
    /// `offset2` changed.
    pub fn run<F: ChipFactory>(&self, station: &mut WeightStation<F>, stop: &AtomicBool) -> WeighResult<CalibrationReport> {
        let settings = self.store.load()?;
        let mut weigher = |config: &WeightSensorConfig| -> WeighResult<f64> {
            station.measure_estimate(config).map(|estimate| estimate.grams)
        };

        info!("maintenance mode started");
        let snapshot = self.manager.record_before(&mut weigher, settings.weight_sensors());
        debug!("{} channel(s) weighed before maintenance", snapshot.len());

        self.wait(stop);

        let settings = self.store.load()?;
        let report = self
            .manager
            .record_after(&mut weigher, settings.weight_sensors(), &snapshot);

        if report.changed() {
            let written = self.store.persist_offset2(&report.configs)?;
            info!("maintenance mode ended, offset2 updated for {} sensor(s)", written);
        } else {
            info!("maintenance mode ended, no offset2 change");
        }
        Ok(report)
    }

    fn wait(&self, stop: &AtomicBool) {
        let started = self.clock.now();
        while !stop.load(Ordering::SeqCst) {
            if self.clock.elapsed_since(started) >= self.max_duration {
                warn!(
                    "automatically stopping maintenance mode after exceeding the maximum runtime of {} seconds",
                    self.max_duration.as_secs()
                );
                stop.store(true, Ordering::SeqCst);
                break;
            }
            self.clock.sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn watchdog_sets_stop_flag() {
        let clock = Arc::new(ManualClock::starting_now());
        let session = MaintenanceSession::new(SettingsStore::new("unused.json"))
            .with_clock(clock.clone())
            .with_max_duration(Duration::from_secs(30));
        let stop = AtomicBool::new(false);

        session.wait(&stop);

        assert!(stop.load(Ordering::SeqCst));
        assert_eq!(clock.total_slept(), Duration::from_secs(30));
    }

    #[test]
    fn preset_stop_returns_immediately() {
        let clock = Arc::new(ManualClock::starting_now());
        let session = MaintenanceSession::new(SettingsStore::new("unused.json")).with_clock(clock.clone());
        let stop = AtomicBool::new(true);

        session.wait(&stop);
        assert_eq!(clock.sleep_count(), 0);
    }
}
