//! Archive bookkeeping: the retrieval cursor, batch draining, the console
//! clock and record-position math.
//!
//! Nothing here talks to the console. The driver fetches batches and feeds
//! them through a [`RetrievalCursor`], which decides record by record whether
//! to emit, and keeps the resume point across sessions.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ArchiveIndex;
use crate::record::ArchiveRecord;

// =============================================================================
// Retrieval Cursor
// =============================================================================

/// What to do with one record of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New record; the cursor has moved to its timestamp
    Emit,
    /// Already emitted (same timestamp and payload), or at the starting cursor
    Duplicate,
    /// Older than the cursor: the console clock went backwards
    Regressed,
}

/// Timestamp of the last archive record handed to the sink.
///
/// Supplied by the caller at start and advanced per emitted record; the
/// driver keeps one cursor for its whole lifetime so a catch-up after
/// reconnection resumes where the previous one stopped. Never persisted here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalCursor {
    position: Option<DateTime<Utc>>,
    last_emitted: Option<ArchiveRecord>,
}

impl RetrievalCursor {
    /// Start from the caller's cursor; `None` retrieves the whole archive
    pub fn new(position: Option<DateTime<Utc>>) -> Self {
        RetrievalCursor {
            position,
            last_emitted: None,
        }
    }

    pub fn position(&self) -> Option<DateTime<Utc>> {
        self.position
    }

    /// Judge the next record of a sorted batch, advancing on [`Verdict::Emit`].
    ///
    /// A record stamped exactly at the starting position is taken as the one
    /// the caller already consumed. Once something was emitted, only an exact
    /// repeat of the last record is dropped, so distinct records sharing a
    /// timestamp all get through.
    pub fn accept(&mut self, record: &ArchiveRecord) -> Verdict {
        if let Some(position) = self.position {
            if record.timestamp < position {
                return Verdict::Regressed;
            }
            if record.timestamp == position {
                let repeat = match &self.last_emitted {
                    Some(last) => last == record,
                    None => true,
                };
                if repeat {
                    return Verdict::Duplicate;
                }
            }
        }
        self.position = Some(record.timestamp);
        self.last_emitted = Some(record.clone());
        Verdict::Emit
    }
}

/// Counts from draining one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub emitted: usize,
    pub duplicates: usize,
    pub regressed: usize,
}

impl DrainStats {
    pub fn add(&mut self, other: DrainStats) {
        self.emitted += other.emitted;
        self.duplicates += other.duplicates;
        self.regressed += other.regressed;
    }
}

/// Sorts a batch and feeds it through a cursor.
pub struct BatchDrainer<'a> {
    cursor: &'a mut RetrievalCursor,
    stats: DrainStats,
}

impl<'a> BatchDrainer<'a> {
    pub fn new(cursor: &'a mut RetrievalCursor) -> Self {
        BatchDrainer {
            cursor,
            stats: DrainStats::default(),
        }
    }

    /// Emit every new record of `batch` in ascending timestamp order.
    ///
    /// The sort is stable, so records with equal timestamps keep the order the
    /// console sent them in. `emit` runs after the cursor has moved past the
    /// record. `regressed` sees each record skipped for being older than the
    /// cursor.
    pub fn drain<E, R>(mut self, mut batch: Vec<ArchiveRecord>, mut emit: E, mut regressed: R) -> DrainStats
    where
        E: FnMut(ArchiveRecord),
        R: FnMut(&ArchiveRecord, DateTime<Utc>),
    {
        batch.sort_by_key(|record| record.timestamp);
        for record in batch {
            let position = self.cursor.position();
            match self.cursor.accept(&record) {
                Verdict::Emit => {
                    self.stats.emitted += 1;
                    emit(record);
                }
                Verdict::Duplicate => self.stats.duplicates += 1,
                Verdict::Regressed => {
                    self.stats.regressed += 1;
                    if let Some(position) = position {
                        regressed(&record, position);
                    }
                }
            }
        }
        self.stats
    }
}

// =============================================================================
// Console Clock
// =============================================================================

/// How to read the console's wall-clock timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockZone {
    /// The console runs on the host's local time
    #[default]
    Local,
    Utc,
}

impl ClockZone {
    /// Console wall-clock time to an instant.
    ///
    /// Ambiguous local times (clocks going back) take the earlier instant;
    /// times inside a spring-forward gap are read one hour later.
    pub fn to_utc(&self, wall: NaiveDateTime) -> DateTime<Utc> {
        match self {
            ClockZone::Utc => wall.and_utc(),
            ClockZone::Local => Local
                .from_local_datetime(&wall)
                .earliest()
                .or_else(|| Local.from_local_datetime(&(wall + Duration::hours(1))).earliest())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| wall.and_utc()),
        }
    }

    /// An instant as console wall-clock time
    pub fn to_wall(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        match self {
            ClockZone::Utc => instant.naive_utc(),
            ClockZone::Local => instant.with_timezone(&Local).naive_local(),
        }
    }
}

impl std::fmt::Display for ClockZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClockZone::Local => write!(f, "local"),
            ClockZone::Utc => write!(f, "utc"),
        }
    }
}

impl std::str::FromStr for ClockZone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ClockZone::Local),
            "utc" => Ok(ClockZone::Utc),
            _ => Err(format!("Unknown console clock: {} (expected local or utc)", s)),
        }
    }
}

// =============================================================================
// Record Positions
// =============================================================================

/// A record slot in the archive: partition (index into
/// [`ArchiveIndex::partitions`]) and record number within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArchivePosition {
    pub partition: usize,
    pub record: u32,
}

impl ArchivePosition {
    pub fn start() -> Self {
        ArchivePosition {
            partition: 0,
            record: 0,
        }
    }
}

impl ArchiveIndex {
    /// First partition that can hold records at or after `key`
    pub fn first_partition_from(&self, key: u16) -> Option<usize> {
        self.partitions.iter().position(|p| p.key >= key)
    }

    /// Normalise `position` to a readable record, skipping past the end of
    /// exhausted partitions. `None` once the whole archive has been read.
    pub fn settle(&self, mut position: ArchivePosition) -> Option<ArchivePosition> {
        while let Some(partition) = self.partitions.get(position.partition) {
            if position.record < partition.records {
                return Some(position);
            }
            position = ArchivePosition {
                partition: position.partition + 1,
                record: 0,
            };
        }
        None
    }

    /// How many records to ask for at `position`, at most `page_size`,
    /// without running past the end of its partition
    pub fn page_len(&self, position: ArchivePosition, page_size: u16) -> u16 {
        self.partitions
            .get(position.partition)
            .map(|p| p.records.saturating_sub(position.record).min(page_size as u32) as u16)
            .unwrap_or(0)
    }

    /// Where `position` (taken from an older snapshot) lands in this index.
    ///
    /// Partitions are matched by key, so a position survives new partitions
    /// appearing after it.
    pub fn rebase(&self, old: &ArchiveIndex, position: ArchivePosition) -> ArchivePosition {
        match old.partitions.get(position.partition) {
            Some(partition) => match self.find(partition.key) {
                Some(index) => ArchivePosition {
                    partition: index,
                    record: position.record,
                },
                None => ArchivePosition {
                    partition: self
                        .first_partition_from(partition.key)
                        .unwrap_or(self.partitions.len()),
                    record: 0,
                },
            },
            None => {
                // Past the end of the old snapshot: continue after its last key
                let next = old
                    .partitions
                    .last()
                    .and_then(|last| self.partitions.iter().position(|p| p.key > last.key))
                    .unwrap_or(self.partitions.len());
                ArchivePosition {
                    partition: next,
                    record: 0,
                }
            }
        }
    }
}

/// Binary search for the first record strictly after a cursor within one
/// partition, one probe at a time.
///
/// Records are assumed to be stored in ascending time order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSearch {
    lo: u32,
    hi: u32,
}

impl RecordSearch {
    /// Search records `0..records`
    pub fn new(records: u32) -> Self {
        RecordSearch { lo: 0, hi: records }
    }

    /// The record to read next, or `None` when the search is over
    pub fn probe(&self) -> Option<u32> {
        if self.lo < self.hi {
            Some(self.lo + (self.hi - self.lo) / 2)
        } else {
            None
        }
    }

    /// Report whether record `probe` lies after the cursor
    pub fn observe(&mut self, probe: u32, after_cursor: bool) {
        if after_cursor {
            self.hi = probe;
        } else {
            self.lo = probe + 1;
        }
    }

    /// First record after the cursor; equals the record count when none is
    pub fn result(&self) -> u32 {
        self.lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ArchivePartition;
    use crate::record::{tag_values, Field, RawValues};
    use crate::units::UnitSelection;

    fn t(minute: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + minute * 60, 0).unwrap()
    }

    fn record(minute: i64, temp: f64) -> ArchiveRecord {
        let mut raw = RawValues::new();
        raw.insert(Field::OutTemp, temp);
        ArchiveRecord::new(t(minute), tag_values(&raw, &UnitSelection::ARCHIVE))
    }

    fn index(parts: &[(u16, u32)]) -> ArchiveIndex {
        ArchiveIndex {
            partitions: parts
                .iter()
                .map(|(key, records)| ArchivePartition {
                    key: *key,
                    records: *records,
                })
                .collect(),
        }
    }

    #[test]
    fn test_drain_sorts_and_advances() {
        let mut cursor = RetrievalCursor::new(None);
        let mut emitted = Vec::new();
        let stats = BatchDrainer::new(&mut cursor).drain(
            vec![record(3, 3.0), record(1, 1.0), record(2, 2.0)],
            |r| emitted.push(r.timestamp),
            |_, _| panic!("nothing regressed"),
        );
        assert_eq!(emitted, vec![t(1), t(2), t(3)]);
        assert_eq!(stats.emitted, 3);
        assert_eq!(cursor.position(), Some(t(3)));
    }

    #[test]
    fn test_drain_drops_repeat_of_last_emitted() {
        let mut cursor = RetrievalCursor::new(None);
        BatchDrainer::new(&mut cursor).drain(vec![record(1, 1.0), record(2, 2.0)], |_| {}, |_, _| {});

        let mut emitted = Vec::new();
        let stats = BatchDrainer::new(&mut cursor).drain(
            vec![record(2, 2.0), record(2, 2.5), record(3, 3.0)],
            |r| emitted.push(r),
            |_, _| {},
        );
        assert_eq!(stats.duplicates, 1);
        assert_eq!(emitted, vec![record(2, 2.5), record(3, 3.0)]);
    }

    #[test]
    fn test_record_at_starting_cursor_is_consumed() {
        let mut cursor = RetrievalCursor::new(Some(t(5)));
        assert_eq!(cursor.accept(&record(5, 0.0)), Verdict::Duplicate);
        assert_eq!(cursor.accept(&record(6, 0.0)), Verdict::Emit);
        assert_eq!(cursor.position(), Some(t(6)));
    }

    #[test]
    fn test_regression_is_skipped() {
        let mut cursor = RetrievalCursor::new(Some(t(10)));
        let mut seen = Vec::new();
        let stats = BatchDrainer::new(&mut cursor).drain(
            vec![record(2, 0.0), record(11, 0.0)],
            |_| {},
            |r, at| seen.push((r.timestamp, at)),
        );
        assert_eq!(stats.regressed, 1);
        assert_eq!(stats.emitted, 1);
        assert_eq!(seen, vec![(t(2), t(10))]);
        assert_eq!(cursor.position(), Some(t(11)));
    }

    #[test]
    fn test_clock_zone_utc_round_trip() {
        let wall = t(0).naive_utc();
        assert_eq!(ClockZone::Utc.to_utc(wall), t(0));
        assert_eq!(ClockZone::Utc.to_wall(t(0)), wall);
        let local = ClockZone::Local.to_wall(t(0));
        assert_eq!(ClockZone::Local.to_utc(local), t(0));
        assert_eq!("UTC".parse::<ClockZone>(), Ok(ClockZone::Utc));
        assert!("mars".parse::<ClockZone>().is_err());
    }

    #[test]
    fn test_settle_and_page_len() {
        let idx = index(&[(2022, 3), (2023, 0), (2024, 250)]);
        let pos = idx.settle(ArchivePosition { partition: 0, record: 3 }).unwrap();
        assert_eq!(pos, ArchivePosition { partition: 2, record: 0 });
        assert_eq!(idx.page_len(pos, 100), 100);
        assert_eq!(idx.page_len(ArchivePosition { partition: 2, record: 200 }, 100), 50);
        assert_eq!(idx.settle(ArchivePosition { partition: 2, record: 250 }), None);
        assert_eq!(idx.first_partition_from(2023), Some(1));
        assert_eq!(idx.first_partition_from(2025), None);
    }

    #[test]
    fn test_rebase_onto_newer_index() {
        let old = index(&[(2023, 10)]);
        let new = index(&[(2023, 12), (2024, 4)]);
        // Mid-partition positions keep their record number
        assert_eq!(
            new.rebase(&old, ArchivePosition { partition: 0, record: 10 }),
            ArchivePosition { partition: 0, record: 10 }
        );
        // Past the end of the old snapshot continues in the next year
        assert_eq!(
            new.rebase(&old, ArchivePosition { partition: 1, record: 0 }),
            ArchivePosition { partition: 1, record: 0 }
        );
    }

    #[test]
    fn test_record_search() {
        // Records at minutes 0, 5, 10, ... 95; cursor at minute 42
        let times: Vec<i64> = (0..20).map(|i| i * 5).collect();
        let mut search = RecordSearch::new(times.len() as u32);
        let mut probes = 0;
        while let Some(probe) = search.probe() {
            probes += 1;
            search.observe(probe, times[probe as usize] > 42);
        }
        assert_eq!(search.result(), 9);
        assert!(probes <= 5);

        let mut all_before = RecordSearch::new(3);
        while let Some(probe) = all_before.probe() {
            all_before.observe(probe, false);
        }
        assert_eq!(all_before.result(), 3);

        assert_eq!(RecordSearch::new(0).probe(), None);
    }
}
