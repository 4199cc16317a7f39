//! The driver's main loop.
//!
//! ```text
//!   Unbound -> Discovering -> Negotiating -> CatchingUp -> Polling
//!                  ^              |              |            |
//!                  |              v              v            v
//!                  +-------------------- Degraded <-----------+
//! ```
//!
//! Every failure lands in Degraded: the session is dropped, the loop cools
//! down and starts over with discovery. The retrieval cursor survives, so
//! catch-up after a reconnect resumes where it stopped.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hp1000_core::record::tag_values;
use hp1000_core::{
    LinkState, LinkStateMachine, LiveReading, RainTracker, RetrievalCursor, UnitSelection,
    WireCodec,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::catchup::{ArchiveCatchup, CatchupOutcome};
use crate::config::StationConfig;
use crate::discovery::Locate;
use crate::events::{Events, LogCategory};
use crate::history::HistoryReader;
use crate::link::StationLink;
use crate::sink::RecordSink;
use crate::transport::Connector;

/// Sees every link state transition as `(from, to)`
pub type StateObserver = Box<dyn FnMut(LinkState, LinkState) + Send>;

enum PollEnd {
    Cancelled,
    Failed,
}

/// Runs `future` unless `cancel` fires first
async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

pub struct PollLoop<L: Locate, C: Connector> {
    locator: L,
    connector: C,
    codec: Arc<dyn WireCodec>,
    sink: Box<dyn RecordSink>,
    events: Events,
    config: StationConfig,
    cancel: CancellationToken,
    machine: LinkStateMachine,
    cursor: RetrievalCursor,
    observer: Option<StateObserver>,
}

impl<L: Locate, C: Connector> PollLoop<L, C> {
    pub fn new(
        locator: L,
        connector: C,
        codec: Arc<dyn WireCodec>,
        sink: Box<dyn RecordSink>,
        events: Events,
        config: StationConfig,
        cancel: CancellationToken,
    ) -> Self {
        let cursor = RetrievalCursor::new(config.initial_cursor);
        PollLoop {
            locator,
            connector,
            codec,
            sink,
            events,
            config,
            cancel,
            machine: LinkStateMachine::new(),
            cursor,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn enter(&mut self, next: LinkState) {
        match self.machine.transition(next) {
            Ok(previous) => {
                log::debug!("Link state {} -> {}", previous, next);
                if let Some(observer) = self.observer.as_mut() {
                    observer(previous, next);
                }
            }
            Err(e) => log::error!("{}", e),
        }
    }

    /// Drop the session and wait out the cool-down. Returns false when
    /// cancelled meanwhile.
    ///
    /// The failure itself was already logged where it happened.
    async fn degrade(&mut self) -> bool {
        self.enter(LinkState::Degraded);
        self.events.info(
            LogCategory::Poll,
            format_args!(
                "Link degraded, rediscovering in {}s (failure {})",
                self.config.degraded_cooldown.as_secs_f64(),
                self.machine.failure_count()
            ),
        );
        let cancel = self.cancel.clone();
        until_cancelled(&cancel, tokio::time::sleep(self.config.degraded_cooldown))
            .await
            .is_some()
    }

    /// Run until cancelled. Returns the archive cursor so the caller can
    /// persist it.
    pub async fn run(mut self) -> Option<DateTime<Utc>> {
        let cancel = self.cancel.clone();

        while !cancel.is_cancelled() {
            self.enter(LinkState::Discovering);
            let station = match until_cancelled(&cancel, self.locator.locate()).await {
                None => break,
                Some(Ok(station)) => station,
                Some(Err(_)) => {
                    if self.degrade().await {
                        continue;
                    }
                    break;
                }
            };

            self.enter(LinkState::Negotiating);
            let transport = match until_cancelled(&cancel, self.connector.connect(&station)).await {
                None => break,
                Some(Ok(transport)) => transport,
                Some(Err(e)) => {
                    self.events.error(
                        LogCategory::Link,
                        format_args!("Cannot open session with {}: {}", station, e),
                    );
                    if self.degrade().await {
                        continue;
                    }
                    break;
                }
            };
            self.events.info(
                LogCategory::Link,
                format_args!("Session {} open with {}", self.machine.sessions(), station),
            );
            let mut link = StationLink::new(
                station,
                transport,
                self.codec.clone(),
                self.config.request_timeout,
                self.config.link_retries,
                self.events.clone(),
            );

            let units = match until_cancelled(&cancel, link.fetch_units()).await {
                None => break,
                Some(Ok(units)) => units,
                Some(Err(_)) => {
                    if self.degrade().await {
                        continue;
                    }
                    break;
                }
            };

            self.enter(LinkState::CatchingUp);
            let outcome = {
                let mut reader = HistoryReader::new(
                    &mut link,
                    self.config.console_clock,
                    self.config.archive_page_size,
                    self.events.clone(),
                );
                ArchiveCatchup::new(&mut self.cursor, &self.events)
                    .run(&mut reader, self.sink.as_mut(), &cancel)
                    .await
            };
            match outcome {
                CatchupOutcome::Done(_) => {}
                CatchupOutcome::Cancelled(_) => break,
                CatchupOutcome::Aborted { .. } => {
                    if self.degrade().await {
                        continue;
                    }
                    break;
                }
            }

            self.enter(LinkState::Polling);
            match self.poll(&mut link, &units.selection).await {
                PollEnd::Cancelled => break,
                PollEnd::Failed => {
                    if !self.degrade().await {
                        break;
                    }
                }
            }
        }

        let position = self.cursor.position();
        self.events.info(
            LogCategory::Poll,
            match position {
                Some(position) => format!("Stopped; archive cursor at {}", position),
                None => "Stopped; no archive records seen".to_string(),
            },
        );
        position
    }

    /// Read live data every `loop_delay` until the link fails. The first
    /// reading is taken straight away.
    async fn poll(&mut self, link: &mut StationLink, units: &UnitSelection) -> PollEnd {
        let cancel = self.cancel.clone();
        let mut rain = RainTracker::new();
        let mut next = Instant::now();

        loop {
            if until_cancelled(&cancel, tokio::time::sleep_until(next)).await.is_none() {
                return PollEnd::Cancelled;
            }
            next = Instant::now() + self.config.loop_delay;

            let mut values = match until_cancelled(&cancel, link.read_live()).await {
                None => return PollEnd::Cancelled,
                Some(Err(_)) => return PollEnd::Failed,
                Some(Ok(values)) => values,
            };
            let timestamp = Utc::now();
            rain.apply(self.config.console_clock.to_wall(timestamp).date(), &mut values);
            self.sink.emit_live_reading(LiveReading {
                timestamp,
                values: tag_values(&values, units),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::{Emulator, Fault};
    use crate::events::MemoryEventLog;
    use crate::sink::MemorySink;
    use chrono::NaiveDateTime;
    use hp1000_core::protocol::hp1000::Hp1000Codec;
    use hp1000_core::units::UnitCodes;
    use hp1000_core::{ClockZone, Field, RawValues, RequestKind, UnitTag};
    use std::sync::Mutex;
    use std::time::Duration;

    fn config() -> StationConfig {
        StationConfig {
            loop_delay: Duration::ZERO,
            degraded_cooldown: Duration::from_secs(60),
            console_clock: ClockZone::Utc,
            ..StationConfig::default()
        }
    }

    fn emulator() -> Emulator {
        let emulator = Emulator::new();
        let start = NaiveDateTime::parse_from_str("2024-06-01 10:00", "%Y-%m-%d %H:%M").unwrap();
        for i in 0..3 {
            let mut values = RawValues::new();
            values.insert(Field::OutTemp, 15.0 + i as f64);
            emulator.push_archive(start + chrono::Duration::minutes(5 * i), values);
        }
        let mut live = RawValues::new();
        live.insert(Field::OutTemp, 64.4);
        live.insert(Field::DailyRain, 0.0);
        emulator.set_live(live);
        emulator.set_rain_step(0.1);
        emulator.set_units(UnitCodes {
            temperature: 1,
            ..UnitCodes::default()
        });
        emulator
    }

    fn poll_loop(
        emulator: &Emulator,
        sink: MemorySink,
        config: StationConfig,
        cancel: CancellationToken,
        events: Events,
    ) -> PollLoop<crate::emulator::EmulatedLocator, crate::emulator::EmulatedConnector> {
        PollLoop::new(
            emulator.locator(),
            emulator.connector(),
            Arc::new(Hp1000Codec),
            Box::new(sink),
            events,
            config,
            cancel,
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<(LinkState, LinkState)>>>, StateObserver) {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let observer: StateObserver = Box::new(move |from, to| seen.lock().unwrap().push((from, to)));
        (transitions, observer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_catch_up_then_poll() {
        let emulator = emulator();
        let cancel = CancellationToken::new();
        let sink = MemorySink::new().stop_after(3, cancel.clone());

        let cursor = poll_loop(&emulator, sink.clone(), config(), cancel, Events::default())
            .run()
            .await;

        assert_eq!(emulator.requests_of(RequestKind::Live), 3);
        let archive = sink.archive();
        assert_eq!(archive.len(), 3);
        assert_eq!(cursor, Some(archive[2].timestamp));

        // Archive records come first, then live readings
        let emitted = sink.emitted();
        assert!(matches!(emitted[0], crate::sink::Emitted::Archive(_)));
        assert!(matches!(emitted[3], crate::sink::Emitted::Live(_)));

        let live = sink.live();
        assert_eq!(live[0].values[&Field::OutTemp].unit, UnitTag::Fahrenheit);
        assert_eq!(live[0].values[&Field::OutTemp].value, 64.4);
        // Rain needs a previous reading
        assert!(!live[0].values.contains_key(&Field::Rain));
        assert_eq!(live[1].values[&Field::Rain].value, 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_with_empty_archive() {
        let emulator = Emulator::new();
        let cancel = CancellationToken::new();
        let sink = MemorySink::new().stop_after(3, cancel.clone());

        let started = Instant::now();
        let cursor = poll_loop(&emulator, sink.clone(), config(), cancel, Events::default())
            .run()
            .await;

        assert_eq!(cursor, None);
        assert!(sink.archive().is_empty());
        assert_eq!(emulator.requests_of(RequestKind::Live), 3);
        let live = sink.live();
        assert_eq!(live.len(), 3);
        assert!(live.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        // Every emitted item is a live reading, in request order
        assert!(sink
            .emitted()
            .iter()
            .all(|e| matches!(e, crate::sink::Emitted::Live(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_delay_spaces_requests() {
        let emulator = emulator();
        let cancel = CancellationToken::new();
        let sink = MemorySink::new().stop_after(3, cancel.clone());
        let config = StationConfig {
            loop_delay: Duration::from_secs(15),
            ..config()
        };

        let started = Instant::now();
        poll_loop(&emulator, sink.clone(), config, cancel, Events::default())
            .run()
            .await;
        assert_eq!(started.elapsed().as_secs(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_closed_link() {
        let emulator = emulator();
        emulator.inject(RequestKind::Live, 2, Fault::Close);
        let cancel = CancellationToken::new();
        let sink = MemorySink::new().stop_after(3, cancel.clone());
        let memory = Arc::new(MemoryEventLog::default());
        let (transitions, observer) = recorder();

        poll_loop(&emulator, sink.clone(), config(), cancel, Events::new(memory.clone()))
            .with_observer(observer)
            .run()
            .await;

        use LinkState::*;
        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                (Unbound, Discovering),
                (Discovering, Negotiating),
                (Negotiating, CatchingUp),
                (CatchingUp, Polling),
                (Polling, Degraded),
                (Degraded, Discovering),
                (Discovering, Negotiating),
                (Negotiating, CatchingUp),
                (CatchingUp, Polling),
            ]
        );
        assert_eq!(emulator.connections(), 2);
        assert_eq!(emulator.requests_of(RequestKind::Units), 2);
        // The second catch-up found nothing new
        assert_eq!(sink.archive().len(), 3);
        assert_eq!(sink.live().len(), 3);
        // Logged once, where it happened
        assert_eq!(memory.errors(LogCategory::Link).len(), 1);
        assert!(memory.errors(LogCategory::Poll).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_degrades() {
        let emulator = emulator();
        emulator.fail_discovery(2);
        let cancel = CancellationToken::new();
        let sink = MemorySink::new().stop_after(1, cancel.clone());
        let (transitions, observer) = recorder();

        let started = Instant::now();
        poll_loop(&emulator, sink, config(), cancel, Events::default())
            .with_observer(observer)
            .run()
            .await;

        let transitions = transitions.lock().unwrap();
        assert_eq!(
            transitions
                .iter()
                .filter(|(_, to)| *to == LinkState::Degraded)
                .count(),
            2
        );
        assert_eq!(started.elapsed().as_secs(), 120);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_cooldown() {
        let emulator = emulator();
        emulator.fail_discovery(1);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stopper.cancel();
        });

        let started = Instant::now();
        let cursor = poll_loop(&emulator, MemorySink::new(), config(), cancel, Events::default())
            .run()
            .await;
        assert_eq!(cursor, None);
        assert_eq!(started.elapsed().as_secs(), 10);
    }
}
