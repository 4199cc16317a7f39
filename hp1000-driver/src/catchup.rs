//! Archive catch-up: hand every archive record logged since the cursor to
//! the sink, oldest first, exactly once.

use hp1000_core::{BatchDrainer, CatchupState, DrainStats, RetrievalCursor};
use tokio_util::sync::CancellationToken;

use crate::events::{Events, LogCategory};
use crate::history::ArchiveSource;
use crate::link::LinkFailure;
use crate::sink::RecordSink;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchupSummary {
    pub stats: DrainStats,
    pub batches: usize,
}

#[derive(Debug)]
pub enum CatchupOutcome {
    /// The archive was read to the end
    Done(CatchupSummary),
    /// The session failed; the cursor keeps everything emitted so far
    Aborted {
        failure: LinkFailure,
        summary: CatchupSummary,
    },
    /// Shutdown was requested
    Cancelled(CatchupSummary),
}

/// One catch-up run over one session
pub struct ArchiveCatchup<'a> {
    cursor: &'a mut RetrievalCursor,
    events: &'a Events,
    state: CatchupState,
}

impl<'a> ArchiveCatchup<'a> {
    pub fn new(cursor: &'a mut RetrievalCursor, events: &'a Events) -> Self {
        ArchiveCatchup {
            cursor,
            events,
            state: CatchupState::Idle,
        }
    }

    pub fn state(&self) -> CatchupState {
        self.state
    }

    fn enter(&mut self, next: CatchupState) {
        if let Err(e) = self.state.advance(next) {
            log::error!("{}", e);
        }
    }

    /// Fetch and drain batches until the source runs dry, the link fails or
    /// `cancel` fires.
    pub async fn run(
        &mut self,
        source: &mut dyn ArchiveSource,
        sink: &mut dyn RecordSink,
        cancel: &CancellationToken,
    ) -> CatchupOutcome {
        let mut summary = CatchupSummary::default();
        self.events.info(
            LogCategory::Catchup,
            match self.cursor.position() {
                Some(position) => format!("Catching up on archive records after {}", position),
                None => "Catching up on the whole archive".to_string(),
            },
        );

        loop {
            self.enter(CatchupState::Requesting);
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.enter(CatchupState::Aborted);
                    return CatchupOutcome::Cancelled(summary);
                }
                fetched = source.fetch_after(self.cursor.position()) => fetched,
            };
            let batch = match fetched {
                Ok(batch) => batch,
                Err(failure) => {
                    self.enter(CatchupState::Aborted);
                    self.events.info(
                        LogCategory::Catchup,
                        format_args!(
                            "Catch-up aborted after {} record(s), resuming after reconnect",
                            summary.stats.emitted
                        ),
                    );
                    return CatchupOutcome::Aborted { failure, summary };
                }
            };

            self.enter(CatchupState::Draining);
            let events = self.events;
            let stats = BatchDrainer::new(self.cursor).drain(
                batch.records,
                |record| sink.emit_archive_record(record),
                |record, position| {
                    events.error(
                        LogCategory::Catchup,
                        format_args!(
                            "Console clock went backwards: record at {} is before {}, skipped",
                            record.timestamp, position
                        ),
                    )
                },
            );
            summary.stats.add(stats);
            summary.batches += 1;

            if !batch.more {
                self.enter(CatchupState::Done);
                self.events.info(
                    LogCategory::Catchup,
                    format_args!(
                        "Catch-up done: {} record(s) emitted, {} already seen",
                        summary.stats.emitted, summary.stats.duplicates
                    ),
                );
                return CatchupOutcome::Done(summary);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventLog;
    use crate::history::ArchiveBatch;
    use crate::link::LinkError;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use hp1000_core::{ArchiveRecord, RequestKind};
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    fn t(minute: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_717_200_000 + minute * 60, 0).unwrap()
    }

    fn record(minute: i64) -> ArchiveRecord {
        ArchiveRecord::new(t(minute), Default::default())
    }

    /// Plays back scripted answers; batches honour the cursor the way the
    /// console reader does, handing back the record at the cursor itself
    struct ScriptedSource {
        script: VecDeque<Result<(Vec<i64>, bool), ()>>,
        cursors: Vec<Option<DateTime<Utc>>>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<(Vec<i64>, bool), ()>>) -> Self {
            ScriptedSource {
                script: script.into(),
                cursors: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl ArchiveSource for ScriptedSource {
        async fn fetch_after(&mut self, cursor: Option<DateTime<Utc>>) -> Result<ArchiveBatch, LinkFailure> {
            self.cursors.push(cursor);
            match self.script.pop_front() {
                Some(Ok((minutes, more))) => Ok(ArchiveBatch {
                    records: minutes
                        .into_iter()
                        .map(record)
                        .filter(|r| cursor.map_or(true, |c| r.timestamp >= c))
                        .collect(),
                    more,
                }),
                Some(Err(())) | None => Err(LinkFailure {
                    request: RequestKind::ArchivePage,
                    attempts: 2,
                    cause: LinkError::Timeout(Duration::from_secs(5)),
                }),
            }
        }
    }

    fn emitted(sink: &MemorySink) -> Vec<DateTime<Utc>> {
        sink.archive().iter().map(|r| r.timestamp).collect()
    }

    #[tokio::test]
    async fn test_drains_until_source_is_done() {
        let mut cursor = RetrievalCursor::new(None);
        let events = Events::default();
        let mut sink = MemorySink::new();
        let mut source = ScriptedSource::new(vec![Ok((vec![1, 2, 3], true)), Ok((vec![4, 5], false))]);

        let mut catchup = ArchiveCatchup::new(&mut cursor, &events);
        let outcome = catchup
            .run(&mut source, &mut sink, &CancellationToken::new())
            .await;
        assert_eq!(catchup.state(), CatchupState::Done);
        match outcome {
            CatchupOutcome::Done(summary) => {
                assert_eq!(summary.batches, 2);
                assert_eq!(summary.stats.emitted, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(emitted(&sink), (1..=5).map(t).collect::<Vec<_>>());
        assert_eq!(cursor.position(), Some(t(5)));
        assert_eq!(source.cursors, vec![None, Some(t(3))]);
    }

    #[tokio::test]
    async fn test_resume_after_abort() {
        let mut cursor = RetrievalCursor::new(None);
        let events = Events::default();
        let mut sink = MemorySink::new();

        let mut source = ScriptedSource::new(vec![Ok((vec![1, 2], true)), Err(())]);
        let outcome = ArchiveCatchup::new(&mut cursor, &events)
            .run(&mut source, &mut sink, &CancellationToken::new())
            .await;
        assert!(matches!(outcome, CatchupOutcome::Aborted { .. }));
        assert_eq!(cursor.position(), Some(t(2)));

        // Next session re-reads from the cursor
        let mut source = ScriptedSource::new(vec![Ok((vec![1, 2, 3, 4], false))]);
        let outcome = ArchiveCatchup::new(&mut cursor, &events)
            .run(&mut source, &mut sink, &CancellationToken::new())
            .await;
        match outcome {
            CatchupOutcome::Done(summary) => {
                assert_eq!(summary.stats.emitted, 2);
                assert_eq!(summary.stats.duplicates, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(emitted(&sink), (1..=4).map(t).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_starting_cursor_is_exclusive() {
        let mut cursor = RetrievalCursor::new(Some(t(2)));
        let events = Events::default();
        let mut sink = MemorySink::new();
        let mut source = ScriptedSource::new(vec![Ok((vec![1, 2, 3], false))]);

        ArchiveCatchup::new(&mut cursor, &events)
            .run(&mut source, &mut sink, &CancellationToken::new())
            .await;
        assert_eq!(emitted(&sink), vec![t(3)]);
    }

    #[tokio::test]
    async fn test_clock_regression_is_logged() {
        let mut cursor = RetrievalCursor::new(None);
        let memory = Arc::new(MemoryEventLog::default());
        let events = Events::new(memory.clone());
        let mut sink = MemorySink::new();
        // The console clock was set back between the two batches
        let source = ScriptedSource::new(vec![Ok((vec![10, 11], true)), Ok((vec![12, 13], false))]);

        struct Regressing(ScriptedSource);
        #[async_trait]
        impl ArchiveSource for Regressing {
            async fn fetch_after(&mut self, cursor: Option<DateTime<Utc>>) -> Result<ArchiveBatch, LinkFailure> {
                let mut batch = self.0.fetch_after(cursor).await?;
                if cursor.is_some() {
                    batch.records.insert(0, record(5));
                }
                Ok(batch)
            }
        }

        let outcome = ArchiveCatchup::new(&mut cursor, &events)
            .run(&mut Regressing(source), &mut sink, &CancellationToken::new())
            .await;
        match outcome {
            CatchupOutcome::Done(summary) => assert_eq!(summary.stats.regressed, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(emitted(&sink), vec![t(10), t(11), t(12), t(13)]);
        let errors = memory.errors(LogCategory::Catchup);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("clock went backwards"));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let mut cursor = RetrievalCursor::new(None);
        let events = Events::default();
        let mut sink = MemorySink::new();
        let mut source = ScriptedSource::new(vec![Ok((vec![1], true))]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ArchiveCatchup::new(&mut cursor, &events)
            .run(&mut source, &mut sink, &cancel)
            .await;
        assert!(matches!(outcome, CatchupOutcome::Cancelled(_)));
        assert!(sink.archive().is_empty());
    }
}
