//! Reading the console's archive page by page.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use hp1000_core::archive::{ArchivePosition, RecordSearch};
use hp1000_core::protocol::{ArchiveEntry, ArchiveIndex};
use hp1000_core::record::tag_values;
use hp1000_core::{ArchiveRecord, ClockZone, RainTracker, UnitSelection};

use crate::events::{Events, LogCategory};
use crate::link::{LinkFailure, StationLink};

/// Records read in one go
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArchiveBatch {
    pub records: Vec<ArchiveRecord>,
    /// Whether asking again may yield more
    pub more: bool,
}

/// Where archive catch-up gets its records
#[async_trait]
pub trait ArchiveSource: Send {
    /// The next batch of records stored after `cursor`.
    ///
    /// Records at or before the cursor may still show up; the caller
    /// filters them.
    async fn fetch_after(&mut self, cursor: Option<DateTime<Utc>>) -> Result<ArchiveBatch, LinkFailure>;
}

/// Walks the archive of one console for one catch-up run.
///
/// The first call reads the archive index and positions itself on the first
/// record after the cursor: partitions before the cursor's year are
/// skipped, and within that year a binary search with one-record pages finds
/// the spot. Pages are then read in order. Once the index is exhausted it is
/// read again, once, to pick up records logged while catching up.
pub struct HistoryReader<'a> {
    link: &'a mut StationLink,
    clock: ClockZone,
    page_size: u16,
    rain: RainTracker,
    index: Option<ArchiveIndex>,
    position: Option<ArchivePosition>,
    refreshed: bool,
    events: Events,
}

impl<'a> HistoryReader<'a> {
    pub fn new(link: &'a mut StationLink, clock: ClockZone, page_size: u16, events: Events) -> Self {
        HistoryReader {
            link,
            clock,
            page_size,
            rain: RainTracker::new(),
            index: None,
            position: None,
            refreshed: false,
            events,
        }
    }

    async fn read_index(&mut self) -> Result<ArchiveIndex, LinkFailure> {
        let index = self.link.read_archive_index().await?;
        self.events.info(
            LogCategory::Catchup,
            format_args!(
                "Archive holds {} records in {} partition(s)",
                index.total_records(),
                index.partitions.len()
            ),
        );
        Ok(index)
    }

    /// First position holding a record after `cursor`
    async fn locate(&mut self, index: &ArchiveIndex, cursor: Option<DateTime<Utc>>) -> Result<ArchivePosition, LinkFailure> {
        let Some(cursor) = cursor else {
            return Ok(ArchivePosition::start());
        };
        let year = self.clock.to_wall(cursor).year();
        let key = u16::try_from(year).unwrap_or(0);

        let Some(partition) = index.first_partition_from(key) else {
            return Ok(ArchivePosition {
                partition: index.partitions.len(),
                record: 0,
            });
        };
        let found = index.partitions[partition];
        if found.key != key {
            return Ok(ArchivePosition {
                partition,
                record: 0,
            });
        }

        let mut search = RecordSearch::new(found.records);
        let mut probes = 0;
        while let Some(probe) = search.probe() {
            let entries = self.link.read_archive_page(found.key, probe, 1).await?;
            let after_cursor = match entries.first() {
                Some(entry) => self.clock.to_utc(entry.recorded_at) > cursor,
                None => true,
            };
            search.observe(probe, after_cursor);
            probes += 1;
        }
        log::debug!(
            "Cursor {} lands at record {} of {} in {} ({} probes)",
            cursor,
            search.result(),
            found.records,
            found.key,
            probes
        );
        Ok(ArchivePosition {
            partition,
            record: search.result(),
        })
    }

    fn convert(&mut self, entry: ArchiveEntry) -> ArchiveRecord {
        let mut values = entry.values;
        self.rain.apply(entry.recorded_at.date(), &mut values);
        ArchiveRecord::new(
            self.clock.to_utc(entry.recorded_at),
            tag_values(&values, &UnitSelection::ARCHIVE),
        )
    }
}

#[async_trait]
impl ArchiveSource for HistoryReader<'_> {
    async fn fetch_after(&mut self, cursor: Option<DateTime<Utc>>) -> Result<ArchiveBatch, LinkFailure> {
        let mut index = match self.index.take() {
            Some(index) => index,
            None => self.read_index().await?,
        };
        let mut position = match self.position {
            Some(position) => position,
            None => self.locate(&index, cursor).await?,
        };

        let batch = loop {
            let Some(at) = index.settle(position) else {
                if self.refreshed {
                    break ArchiveBatch::default();
                }
                self.refreshed = true;
                let fresh = self.read_index().await?;
                position = fresh.rebase(&index, position);
                index = fresh;
                continue;
            };

            let key = index.partitions[at.partition].key;
            let count = index.page_len(at, self.page_size);
            let entries = self.link.read_archive_page(key, at.record, count).await?;
            if entries.is_empty() {
                log::debug!("Partition {} ended early at record {}", key, at.record);
                position = ArchivePosition {
                    partition: at.partition + 1,
                    record: 0,
                };
                continue;
            }

            position = ArchivePosition {
                partition: at.partition,
                record: at.record + entries.len() as u32,
            };
            let records = entries.into_iter().map(|e| self.convert(e)).collect();
            break ArchiveBatch {
                records,
                more: true,
            };
        };

        self.index = Some(index);
        self.position = Some(position);
        Ok(batch)
    }
}
