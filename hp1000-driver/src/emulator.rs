//! In-process console for tests and `--emulate`.
//!
//! Speaks the console side of the wire protocol over an in-memory transport:
//! requests are decoded the way the console would and answered with encoded
//! response frames. Faults can be scheduled per request kind.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDateTime};
use hp1000_core::protocol::hp1000::{self, DISCOVERY_PORT};
use hp1000_core::protocol::{ArchiveEntry, ArchiveIndex, ArchivePartition, ConsoleSetup};
use hp1000_core::units::UnitCodes;
use hp1000_core::{Field, RawValues, Request, RequestKind, Response, StationAddress};

use crate::discovery::{DiscoveryError, Locate};
use crate::link::LinkError;
use crate::transport::{Connector, Transport};

/// A misbehaviour to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Never answer
    Silent,
    /// Drop the connection instead of answering
    Close,
    /// Answer with bytes that don't decode
    Garble,
    /// Answer only once the next request has been sent
    Late,
}

#[derive(Debug)]
struct ConsoleState {
    name: String,
    mac: String,
    ip: Ipv4Addr,
    setup: ConsoleSetup,
    live: RawValues,
    /// Added to the daily rain total on every live request
    rain_step: f64,
    archive: BTreeMap<u16, Vec<ArchiveEntry>>,
    faults: HashMap<(RequestKind, usize), Fault>,
    requests: Vec<Request>,
    connections: usize,
    discovery_failures: usize,
}

impl ConsoleState {
    fn index(&self) -> ArchiveIndex {
        ArchiveIndex {
            partitions: self
                .archive
                .iter()
                .filter(|(_, records)| !records.is_empty())
                .map(|(key, records)| ArchivePartition {
                    key: *key,
                    records: records.len() as u32,
                })
                .collect(),
        }
    }

    fn page(&self, partition: u16, start: u32, count: u16) -> Vec<ArchiveEntry> {
        self.archive
            .get(&partition)
            .map(|records| {
                records
                    .iter()
                    .skip(start as usize)
                    .take(count as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn answer(&mut self, request: &Request) -> Response {
        match *request {
            Request::Units => Response::Units(self.setup),
            Request::Live => {
                if self.rain_step > 0.0 {
                    let daily = self.live.entry(Field::DailyRain).or_insert(0.0);
                    *daily = ((*daily + self.rain_step) * 10.0).round() / 10.0;
                }
                Response::Live(self.live.clone())
            }
            Request::ArchiveIndex => Response::ArchiveIndex(self.index()),
            Request::ArchivePage {
                partition,
                start,
                count,
            } => Response::ArchivePage(self.page(partition, start, count)),
        }
    }
}

/// Shared handle on an emulated console; clones see the same console
#[derive(Debug, Clone)]
pub struct Emulator {
    state: Arc<Mutex<ConsoleState>>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Emulator {
    pub fn new() -> Self {
        Emulator {
            state: Arc::new(Mutex::new(ConsoleState {
                name: "HP2000".to_string(),
                mac: "00:0E:C6:00:10:00".to_string(),
                ip: Ipv4Addr::new(192, 168, 1, 40),
                setup: ConsoleSetup::default(),
                live: RawValues::new(),
                rain_step: 0.0,
                archive: BTreeMap::new(),
                faults: HashMap::new(),
                requests: Vec::new(),
                connections: 0,
                discovery_failures: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// What discovery reports for this console
    pub fn station(&self) -> StationAddress {
        let state = self.lock();
        let response = hp1000::discovery_response(&state.name, &state.mac, state.ip);
        let source = SocketAddrV4::new(state.ip, DISCOVERY_PORT);
        hp1000::parse_discovery(&response, source).unwrap_or(StationAddress {
            name: state.name.clone(),
            mac: Some(state.mac.clone()),
            ip: state.ip,
            source,
        })
    }

    pub fn set_units(&self, units: UnitCodes) {
        self.lock().setup.units = units;
    }

    pub fn set_live(&self, values: RawValues) {
        self.lock().live = values;
    }

    pub fn set_rain_step(&self, step: f64) {
        self.lock().rain_step = step;
    }

    /// Log a record; its partition is the year of its timestamp
    pub fn push_archive(&self, recorded_at: NaiveDateTime, values: RawValues) {
        let partition = recorded_at.year() as u16;
        self.lock()
            .archive
            .entry(partition)
            .or_default()
            .push(ArchiveEntry {
                recorded_at,
                values,
            });
    }

    /// Misbehave on the `nth` request (1-based) of `kind`
    pub fn inject(&self, kind: RequestKind, nth: usize, fault: Fault) {
        self.lock().faults.insert((kind, nth), fault);
    }

    /// Let the next `count` discovery attempts fail
    pub fn fail_discovery(&self, count: usize) {
        self.lock().discovery_failures = count;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub fn requests_of(&self, kind: RequestKind) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }

    pub fn locator(&self) -> EmulatedLocator {
        EmulatedLocator {
            emulator: self.clone(),
        }
    }

    pub fn connector(&self) -> EmulatedConnector {
        EmulatedConnector {
            emulator: self.clone(),
        }
    }

    /// A console with a few hours of archive and some weather going on
    pub fn demo() -> Self {
        let emulator = Emulator::new();
        let now = chrono::Local::now().naive_local();
        let start = now - chrono::Duration::hours(3);
        for step in 0..36 {
            let recorded_at = start + chrono::Duration::minutes(5 * step);
            let mut values = RawValues::new();
            values.insert(Field::InTemp, 21.0 + step as f64 * 0.05);
            values.insert(Field::InHumidity, 45.0);
            values.insert(Field::OutTemp, 12.0 + (step as f64 / 6.0).sin());
            values.insert(Field::OutHumidity, 80.0);
            values.insert(Field::RelativePressure, 1013.2);
            values.insert(Field::AbsolutePressure, 1008.7);
            values.insert(Field::WindSpeed, 2.5);
            values.insert(Field::WindGust, 4.1);
            values.insert(Field::WindDir, 225.0);
            values.insert(Field::DailyRain, (step / 6) as f64 * 0.3);
            emulator.push_archive(recorded_at, values);
        }

        let mut live = RawValues::new();
        live.insert(Field::InTemp, 22.8);
        live.insert(Field::InHumidity, 44.0);
        live.insert(Field::OutTemp, 12.9);
        live.insert(Field::OutHumidity, 79.0);
        live.insert(Field::RelativePressure, 1013.0);
        live.insert(Field::AbsolutePressure, 1008.5);
        live.insert(Field::WindSpeed, 2.2);
        live.insert(Field::WindGust, 3.9);
        live.insert(Field::WindDir, 230.0);
        live.insert(Field::DailyRain, 1.8);
        live.insert(Field::UvIndex, 2.0);
        emulator.set_live(live);
        emulator.set_rain_step(0.3);
        emulator
    }
}

/// Finds the emulated console without touching the network
pub struct EmulatedLocator {
    emulator: Emulator,
}

#[async_trait]
impl Locate for EmulatedLocator {
    async fn locate(&mut self) -> Result<StationAddress, DiscoveryError> {
        tokio::task::yield_now().await;
        {
            let mut state = self.emulator.lock();
            if state.discovery_failures > 0 {
                state.discovery_failures -= 1;
                return Err(DiscoveryError::NoResponse {
                    attempts: 1,
                    target: "emulator".to_string(),
                });
            }
        }
        Ok(self.emulator.station())
    }
}

pub struct EmulatedConnector {
    emulator: Emulator,
}

#[async_trait]
impl Connector for EmulatedConnector {
    async fn connect(&mut self, station: &StationAddress) -> Result<Box<dyn Transport>, LinkError> {
        let name = {
            let mut state = self.emulator.lock();
            if station.ip != state.ip {
                return Err(LinkError::PeerMismatch {
                    expected: station.ip,
                    actual: state.ip,
                });
            }
            state.connections += 1;
            state.name.clone()
        };
        Ok(Box::new(EmulatedTransport {
            emulator: self.emulator.clone(),
            name,
            outbox: VecDeque::new(),
            held: None,
            closed: false,
        }))
    }
}

/// One session with the emulated console
pub struct EmulatedTransport {
    emulator: Emulator,
    name: String,
    outbox: VecDeque<Vec<u8>>,
    /// A late answer, still on its way
    held: Option<Vec<u8>>,
    closed: bool,
}

#[async_trait]
impl Transport for EmulatedTransport {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        if self.closed {
            return Err(LinkError::Closed);
        }
        if let Some(late) = self.held.take() {
            self.outbox.push_back(late);
        }
        // A console ignores requests it can't parse
        let Ok(request) = hp1000::decode_request(frame) else {
            return Ok(());
        };

        let (response, fault) = {
            let mut state = self.emulator.lock();
            state.requests.push(request);
            let nth = state
                .requests
                .iter()
                .filter(|r| r.kind() == request.kind())
                .count();
            let fault = state.faults.get(&(request.kind(), nth)).copied();
            (state.answer(&request), fault)
        };

        match fault {
            None => self
                .outbox
                .push_back(hp1000::encode_response(&self.name, &response)),
            Some(Fault::Silent) => {}
            Some(Fault::Close) => self.closed = true,
            Some(Fault::Garble) => {
                let mut frame = hp1000::encode_response(&self.name, &response);
                frame.truncate(hp1000::HEADER_SIZE + 2);
                self.outbox.push_back(frame);
            }
            Some(Fault::Late) => {
                self.held = Some(hp1000::encode_response(&self.name, &response));
            }
        }
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        tokio::task::yield_now().await;
        if let Some(frame) = self.outbox.pop_front() {
            return Ok(frame);
        }
        if self.closed {
            return Err(LinkError::Closed);
        }
        std::future::pending().await
    }

    fn discard_pending(&mut self) {
        self.outbox.clear();
    }
}
