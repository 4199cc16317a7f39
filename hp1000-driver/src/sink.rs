//! Where records go.
//!
//! The driver hands every archive record and live reading to a
//! [`RecordSink`]. Calls are synchronous and must not block for long: the
//! poll loop waits on them.

use std::io::Write;

use hp1000_core::{ArchiveRecord, LiveReading};
use serde::Serialize;

/// Host-supplied receiver of records
pub trait RecordSink: Send {
    fn emit_archive_record(&mut self, record: ArchiveRecord);
    fn emit_live_reading(&mut self, reading: LiveReading);
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Line<'a> {
    Archive(&'a ArchiveRecord),
    Live(&'a LiveReading),
}

/// Writes one JSON object per record, tagged `"type": "archive"` or `"live"`
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        JsonLinesSink { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &Line<'_>) {
        let result = serde_json::to_writer(&mut self.writer, line)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush());
        if let Err(e) = result {
            log::error!("Cannot write record: {}", e);
        }
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn emit_archive_record(&mut self, record: ArchiveRecord) {
        self.write_line(&Line::Archive(&record));
    }

    fn emit_live_reading(&mut self, reading: LiveReading) {
        self.write_line(&Line::Live(&reading));
    }
}

/// Something a [`MemorySink`] received
#[cfg(any(test, feature = "emulator"))]
#[derive(Debug, Clone, PartialEq)]
pub enum Emitted {
    Archive(ArchiveRecord),
    Live(LiveReading),
}

/// Collects records in memory; clones share the same store.
///
/// Can cancel a token once a number of live readings arrived, which is how
/// tests bound an otherwise endless poll loop.
#[cfg(any(test, feature = "emulator"))]
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    emitted: std::sync::Arc<std::sync::Mutex<Vec<Emitted>>>,
    stop: Option<(usize, tokio_util::sync::CancellationToken)>,
}

#[cfg(any(test, feature = "emulator"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` when the `readings`-th live reading is emitted
    pub fn stop_after(mut self, readings: usize, token: tokio_util::sync::CancellationToken) -> Self {
        self.stop = Some((readings, token));
        self
    }

    pub fn emitted(&self) -> Vec<Emitted> {
        self.emitted.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn archive(&self) -> Vec<ArchiveRecord> {
        self.emitted()
            .into_iter()
            .filter_map(|e| match e {
                Emitted::Archive(record) => Some(record),
                Emitted::Live(_) => None,
            })
            .collect()
    }

    pub fn live(&self) -> Vec<LiveReading> {
        self.emitted()
            .into_iter()
            .filter_map(|e| match e {
                Emitted::Live(reading) => Some(reading),
                Emitted::Archive(_) => None,
            })
            .collect()
    }

    fn push(&self, item: Emitted) {
        if let Ok(mut emitted) = self.emitted.lock() {
            emitted.push(item);
        }
    }
}

#[cfg(any(test, feature = "emulator"))]
impl RecordSink for MemorySink {
    fn emit_archive_record(&mut self, record: ArchiveRecord) {
        self.push(Emitted::Archive(record));
    }

    fn emit_live_reading(&mut self, reading: LiveReading) {
        self.push(Emitted::Live(reading));
        if let Some((readings, token)) = &self.stop {
            if self.live().len() >= *readings {
                token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use hp1000_core::record::tag_values;
    use hp1000_core::{Field, RawValues, UnitSelection};

    #[test]
    fn test_json_lines() {
        let mut raw = RawValues::new();
        raw.insert(Field::OutTemp, 12.5);
        raw.insert(Field::WindSpeed, 3.0);
        let timestamp = DateTime::from_timestamp(1_700_000_000, 0).unwrap();

        let mut sink = JsonLinesSink::new(Vec::new());
        sink.emit_archive_record(ArchiveRecord::new(
            timestamp,
            tag_values(&raw, &UnitSelection::ARCHIVE),
        ));
        sink.emit_live_reading(LiveReading {
            timestamp,
            values: tag_values(&raw, &UnitSelection::default()),
        });

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "archive");
        assert_eq!(lines[0]["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(lines[0]["values"]["outTemp"]["value"], 12.5);
        assert_eq!(lines[1]["type"], "live");
        assert_eq!(lines[1]["values"]["windSpeed"]["unit"], "meter_per_second");
    }

    #[test]
    fn test_memory_sink_stops() {
        let token = tokio_util::sync::CancellationToken::new();
        let mut sink = MemorySink::new().stop_after(2, token.clone());
        let reading = LiveReading {
            timestamp: DateTime::from_timestamp(0, 0).unwrap(),
            values: Default::default(),
        };
        sink.emit_live_reading(reading.clone());
        assert!(!token.is_cancelled());
        sink.emit_live_reading(reading);
        assert!(token.is_cancelled());
        assert_eq!(sink.live().len(), 2);
    }
}
