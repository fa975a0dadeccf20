//! Field Map Sinks for HoneyPi
//!
//! ## Overview
//!
//! A measurement cycle ends with one [`FieldMap`] holding every reading of the
//! cycle. Sinks take that map somewhere: a cloud time series, a display, or a
//! file on the SD card for when the Pi has no connectivity.
//!
//! ## Available Sinks
//!
//! ### Offline CSV (`csv` feature, default)
//!
//! **When to use:**
//! - No network at the apiary
//! - As a backup next to an uploader
//!
//! **Characteristics:**
//! - One file per ThingSpeak channel (`offline-<channel>.csv`)
//! - ThingSpeak columns only (`field1`..`field8`, position, status)
//! - Bounded size: oldest rows are dropped once the file passes 5 MiB
//!
//! ## Failure Policy
//!
//! A sink failure must not lose the other sinks' data. [`publish_all`] hands
//! the map to every sink and only logs individual failures.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use honeypi_connectors::{publish_all, FieldSink, OfflineCsvSink};
//! use honeypi_core::FieldMap;
//!
//! let mut csv = OfflineCsvSink::new("/home/pi/HoneyPi/rpi-scripts", "123456");
//! let fields: FieldMap = [("field3", 41.235)].into_iter().collect();
//!
//! let mut sinks: Vec<&mut dyn FieldSink> = vec![&mut csv];
//! let delivered = publish_all(&mut sinks, &fields);
//! assert_eq!(delivered, 1);
//! ```

use std::io;
use std::path::PathBuf;

use honeypi_core::FieldMap;
use log::error;
use thiserror::Error;

#[cfg(feature = "csv")]
pub mod offline;

#[cfg(feature = "csv")]
pub use offline::OfflineCsvSink;

/// Common sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Consumer of a finished measurement cycle
pub trait FieldSink {
    /// Short name for log messages
    fn name(&self) -> &str;

    /// Deliver one cycle's fields
    fn publish(&mut self, fields: &FieldMap) -> Result<(), SinkError>;
}

/// Publish `fields` to every sink, returning how many succeeded
pub fn publish_all(sinks: &mut [&mut dyn FieldSink], fields: &FieldMap) -> usize {
    let mut delivered = 0;
    for sink in sinks.iter_mut() {
        match sink.publish(fields) {
            Ok(()) => delivered += 1,
            Err(e) => error!("{} sink failed: {}", sink.name(), e),
        }
    }
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recording {
        published: Vec<FieldMap>,
        fail: bool,
    }

    impl FieldSink for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn publish(&mut self, fields: &FieldMap) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::Io {
                    path: PathBuf::from("/dev/full"),
                    source: io::Error::new(io::ErrorKind::Other, "disk full"),
                });
            }
            self.published.push(fields.clone());
            Ok(())
        }
    }

    #[test]
    fn one_failing_sink_does_not_stop_the_others() {
        let mut broken = Recording { published: Vec::new(), fail: true };
        let mut working = Recording { published: Vec::new(), fail: false };
        let fields: FieldMap = [("field1", 1.0)].into_iter().collect();

        let delivered = {
            let mut sinks: Vec<&mut dyn FieldSink> = vec![&mut broken, &mut working];
            publish_all(&mut sinks, &fields)
        };

        assert_eq!(delivered, 1);
        assert_eq!(working.published, vec![fields]);
    }
}
