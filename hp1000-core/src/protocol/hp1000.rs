//! HP1000 / WS1001 / XC0422 "easyweather" LAN protocol
//!
//! Pure encoding and decoding of the console's frames. No I/O.
//!
//! # Frames
//!
//! Every TCP frame starts with a 32-byte header: the sender's device name (8),
//! a command (`READ` from the client, `WRITE` from the console, 8) and the
//! argument naming the data set (16). All integers are little-endian and all
//! text is NUL-padded ASCII.
//!
//! | Argument       | Request | Response                         |
//! |----------------|---------|----------------------------------|
//! | `SETUP`        | 40      | 55                               |
//! | `NOWRECORD`    | 40      | 104                              |
//! | `HISTORY_FILE` | 40      | 88                               |
//! | `HISTORY_DATA` | 48      | 40 + 60 per record (declared)    |
//!
//! The protocol carries no checksum. Fixed frame sizes and the declared length
//! of `HISTORY_DATA` are the only integrity checks.
//!
//! Besides the client codec ([`Hp1000Codec`]) this module has the console
//! side of the exchange ([`decode_request`], [`encode_response`],
//! [`discovery_response`]), which the driver's emulator uses.

use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, NaiveDateTime};
use serde::Deserialize;

use super::{
    c_string, padded, ArchiveEntry, ArchiveIndex, ArchivePartition, ConsoleSetup, Request,
    RequestKind, Response, WireCodec,
};
use crate::error::DecodeError;
use crate::record::{Field, RawValues};
use crate::station::StationAddress;
use crate::units::UnitCodes;

// =============================================================================
// Constants
// =============================================================================

/// UDP port the console listens on for discovery probes
pub const DISCOVERY_PORT: u16 = 6000;

/// TCP port the console connects back to
pub const SESSION_PORT: u16 = 6500;

/// Device name the client puts in its frames
pub const CLIENT_NAME: &str = "PC2000";

pub const CMD_SEARCH: &str = "SEARCH";
pub const CMD_READ: &str = "READ";
pub const CMD_WRITE: &str = "WRITE";

pub const ARG_SETUP: &str = "SETUP";
pub const ARG_NOWRECORD: &str = "NOWRECORD";
pub const ARG_HISTORY_FILE: &str = "HISTORY_FILE";
pub const ARG_HISTORY_DATA: &str = "HISTORY_DATA";

/// Size of the discovery probe
pub const PROBE_SIZE: usize = 40;

/// Size of a plain request (header + 8 bytes)
pub const REQUEST_SIZE: usize = 40;

/// Size of a `HISTORY_DATA` request
pub const HISTORY_DATA_REQUEST_SIZE: usize = 48;

/// The console never returns more than this many records per page
pub const MAX_PAGE_RECORDS: u16 = 100;

/// Seconds between 1601-01-01 (FILETIME epoch) and 1970-01-01
pub const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// FILETIME ticks are 100 ns
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// "No reading" marker for 16-bit fields
const MISSING_I16: i16 = i16::MAX;

/// "No reading" marker for 8-bit humidity fields
const MISSING_HUMIDITY: i8 = 127;

/// "No reading" marker for 32-bit archive fields
const MISSING_U32: u32 = i32::MAX as u32;

/// Live temperatures, pressures and speeds at or above this are missing
const LIVE_MISSING_MEASURE: f32 = 3276.0;

/// Live rain totals at or above this are missing
const LIVE_MISSING_RAIN: f32 = 214_748_367.0;

/// Live radiation above this is missing
const LIVE_MISSING_RADIATION: f32 = 2_147_480.0;

// =============================================================================
// Frame Structures
// =============================================================================

/// Common 32-byte header of every TCP frame
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct FrameHeader {
    pub device: [u8; 8],    // 0: sender name, "PC2000" or e.g. "HP2000"
    pub command: [u8; 8],   // 8: READ / WRITE
    pub argument: [u8; 16], // 16: SETUP, NOWRECORD, HISTORY_FILE, HISTORY_DATA
}

pub const HEADER_SIZE: usize = std::mem::size_of::<FrameHeader>();

/// Console answer to the discovery probe (UDP)
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct DiscoveryFrame {
    pub device: [u8; 8],   // 0: e.g. "HP2000"
    pub command: [u8; 8],  // 8: "SEARCH"
    _unknown: [u8; 24],    // 16: not deciphered
    pub mac: [u8; 24],     // 40: "00:0E:C6:..." as text
    pub ip: [u8; 16],      // 64: dotted quad as text
}

pub const DISCOVERY_RESPONSE_SIZE: usize = std::mem::size_of::<DiscoveryFrame>();

/// `SETUP` response: the console's set-up screen
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct SetupFrame {
    pub header: FrameHeader,
    _echo: [u8; 8],         // 32
    pub time_format: i8,    // 40
    pub date_format: i8,    // 41
    pub temperature: i8,    // 42: 0 C, 1 F
    pub pressure: i8,       // 43: 0 hPa, 1 inHg, 2 mmHg
    pub wind: i8,           // 44: 0 m/s, 1 km/h, 2 knots, 3 mph, 4 Beaufort, 5 ft/s
    pub rain: i8,           // 45: 0 mm, 1 in
    pub solar: i8,          // 46: 0 lux, 1 fc, 2 W/m2
    pub rain_display: i8,   // 47
    pub graph_time: i8,     // 48
    pub barometer_display: i8, // 49
    pub weather_threshold: i8, // 50
    pub storm_threshold: i8,   // 51
    pub current_weather: i8,   // 52
    pub rain_reset_month: i8,  // 53
    pub update_interval: i8,   // 54: minutes
}

pub const SETUP_SIZE: usize = std::mem::size_of::<SetupFrame>();

/// `NOWRECORD` response: current conditions in the selected units
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct NowRecordFrame {
    pub header: FrameHeader,
    _echo: [u8; 8],         // 32
    pub wind_dir: i16,      // 40
    pub in_humidity: i8,    // 42
    pub out_humidity: i8,   // 43
    pub measures: [f32; 14], // 44: see LIVE_FIELDS
    pub uv_index: i8,       // 100
    _unknown1: i8,          // 101
    _unknown2: i16,         // 102
}

pub const NOWRECORD_SIZE: usize = std::mem::size_of::<NowRecordFrame>();

/// Order of the floats in [`NowRecordFrame::measures`]
const LIVE_FIELDS: [Field; 14] = [
    Field::InTemp,
    Field::RelativePressure,
    Field::AbsolutePressure,
    Field::OutTemp,
    Field::DewPoint,
    Field::WindChill,
    Field::WindSpeed,
    Field::WindGust,
    Field::RainRate,
    Field::DailyRain,
    Field::WeeklyRain,
    Field::MonthlyRain,
    Field::YearlyRain,
    Field::Radiation,
];

/// `HISTORY_FILE` response: the archive partitions
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct HistoryFileFrame {
    pub header: FrameHeader,
    pub sizes: [i16; 4],   // 32: first is the payload size
    pub years: [u16; 8],   // 40: newest first, 0 = unused slot
    pub counts: [u32; 8],  // 56: records per year
}

pub const HISTORY_FILE_SIZE: usize = std::mem::size_of::<HistoryFileFrame>();

/// Number of partition slots in the index
pub const HISTORY_SLOTS: usize = 8;

/// Fixed part of a `HISTORY_DATA` response
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct HistoryDataHeader {
    pub header: FrameHeader,
    pub length: u32,  // 32: total frame length
    _reserved: u32,   // 36
}

pub const HISTORY_DATA_HEADER_SIZE: usize = std::mem::size_of::<HistoryDataHeader>();

/// One archive record. Always metric, radiation in lux.
#[derive(Deserialize, Debug, Copy, Clone)]
#[repr(C, packed)]
pub struct HistoryRecord {
    pub filetime: u64,   // 0: 100 ns ticks since 1601, console wall clock
    pub words: [i16; 12], // 8: see ARCHIVE_WORDS
    pub longs: [u32; 7],  // 32: see ARCHIVE_LONGS
}

pub const HISTORY_RECORD_SIZE: usize = std::mem::size_of::<HistoryRecord>();

/// Largest `HISTORY_DATA` frame we accept
pub const MAX_HISTORY_DATA_SIZE: usize =
    HISTORY_DATA_HEADER_SIZE + MAX_PAGE_RECORDS as usize * HISTORY_RECORD_SIZE;

/// Fields of [`HistoryRecord::words`] and their scale divisor
const ARCHIVE_WORDS: [(Field, f64); 12] = [
    (Field::InTemp, 10.0),
    (Field::InHumidity, 1.0),
    (Field::AbsolutePressure, 10.0),
    (Field::RelativePressure, 10.0),
    (Field::OutTemp, 10.0),
    (Field::OutHumidity, 1.0),
    (Field::DewPoint, 10.0),
    (Field::WindChill, 10.0),
    (Field::HeatIndex, 10.0),
    (Field::WindSpeed, 10.0),
    (Field::WindGust, 10.0),
    (Field::WindDir, 1.0),
];

/// Fields of [`HistoryRecord::longs`] and their scale divisor
const ARCHIVE_LONGS: [(Field, f64); 7] = [
    (Field::RainRate, 10.0),
    (Field::DailyRain, 10.0),
    (Field::WeeklyRain, 10.0),
    (Field::MonthlyRain, 10.0),
    (Field::YearlyRain, 10.0),
    (Field::UvIrradiance, 1.0),
    (Field::Radiation, 10.0),
];

// =============================================================================
// Codec
// =============================================================================

/// Client side of the HP1000 protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct Hp1000Codec;

impl WireCodec for Hp1000Codec {
    fn max_page_records(&self) -> u16 {
        MAX_PAGE_RECORDS
    }

    fn discovery_probe(&self) -> Vec<u8> {
        let mut probe = Vec::with_capacity(PROBE_SIZE);
        probe.extend_from_slice(&padded::<8>(CLIENT_NAME));
        probe.extend_from_slice(&padded::<8>(CMD_SEARCH));
        probe.resize(PROBE_SIZE, 0);
        probe
    }

    fn decode_discovery(
        &self,
        data: &[u8],
        source: SocketAddrV4,
    ) -> Result<StationAddress, DecodeError> {
        parse_discovery(data, source)
    }

    fn encode_request(&self, request: &Request) -> Vec<u8> {
        match request {
            Request::Units => plain_request(ARG_SETUP, [0; 8]),
            Request::Live => plain_request(ARG_NOWRECORD, [0; 8]),
            Request::ArchiveIndex => {
                let mut body = [0u8; 8];
                body[..4].copy_from_slice(&(REQUEST_SIZE as i32).to_le_bytes());
                plain_request(ARG_HISTORY_FILE, body)
            }
            Request::ArchivePage {
                partition,
                start,
                count,
            } => {
                let mut frame = header_bytes(CLIENT_NAME, CMD_READ, ARG_HISTORY_DATA);
                let reply_len = HISTORY_DATA_HEADER_SIZE + *count as usize * HISTORY_RECORD_SIZE;
                frame.extend_from_slice(&(HISTORY_DATA_REQUEST_SIZE as i32).to_le_bytes());
                frame.extend_from_slice(&(reply_len as i32).to_le_bytes());
                frame.extend_from_slice(&(*partition as i16).to_le_bytes());
                frame.extend_from_slice(&(*count as i16).to_le_bytes());
                frame.extend_from_slice(&(*start as i32).to_le_bytes());
                frame
            }
        }
    }

    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = parse_response_header(buf)?;
        match header {
            RequestKind::Units => Ok(Some(SETUP_SIZE)),
            RequestKind::Live => Ok(Some(NOWRECORD_SIZE)),
            RequestKind::ArchiveIndex => Ok(Some(HISTORY_FILE_SIZE)),
            RequestKind::ArchivePage => {
                if buf.len() < HEADER_SIZE + 4 {
                    return Ok(None);
                }
                let declared = declared_history_len(buf)?;
                Ok(Some(declared))
            }
        }
    }

    fn decode_response(&self, data: &[u8]) -> Result<Response, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }
        match parse_response_header(data)? {
            RequestKind::Units => parse_setup(data).map(Response::Units),
            RequestKind::Live => parse_now_record(data).map(Response::Live),
            RequestKind::ArchiveIndex => parse_history_file(data).map(Response::ArchiveIndex),
            RequestKind::ArchivePage => parse_history_data(data).map(Response::ArchivePage),
        }
    }
}

// =============================================================================
// Parsing Functions
// =============================================================================

/// Parse the console's answer to the discovery probe.
///
/// Our own probe, looped back by the broadcast, is shorter than a response
/// and fails with [`DecodeError::TooShort`].
pub fn parse_discovery(data: &[u8], source: SocketAddrV4) -> Result<StationAddress, DecodeError> {
    if data.len() < DISCOVERY_RESPONSE_SIZE {
        return Err(DecodeError::TooShort {
            expected: DISCOVERY_RESPONSE_SIZE,
            actual: data.len(),
        });
    }

    let frame: DiscoveryFrame = bincode::deserialize(&data[..DISCOVERY_RESPONSE_SIZE])?;

    let command = frame.command;
    expect_marker("command", &command, CMD_SEARCH)?;

    let device = frame.device;
    let name = printable(&device).ok_or(DecodeError::InvalidString("device name"))?;
    if name == CLIENT_NAME {
        return Err(DecodeError::InvalidMarker {
            field: "device",
            expected: "console name".to_string(),
            actual: name,
        });
    }

    let ip_field = frame.ip;
    let ip: Ipv4Addr = printable(&ip_field)
        .and_then(|text| text.parse().ok())
        .ok_or(DecodeError::InvalidString("ip address"))?;

    let mac_field = frame.mac;
    let mac = printable(&mac_field);

    Ok(StationAddress {
        name,
        mac,
        ip,
        source,
    })
}

/// Validate a response header and return which data set it carries
fn parse_response_header(data: &[u8]) -> Result<RequestKind, DecodeError> {
    let header: FrameHeader = bincode::deserialize(&data[..HEADER_SIZE])?;

    let device = header.device;
    printable(&device).ok_or(DecodeError::InvalidString("device name"))?;

    let command = header.command;
    expect_marker("command", &command, CMD_WRITE)?;

    let argument = header.argument;
    kind_of_argument(&argument)
}

fn kind_of_argument(argument: &[u8]) -> Result<RequestKind, DecodeError> {
    match c_string(argument).as_deref() {
        Some(ARG_SETUP) => Ok(RequestKind::Units),
        Some(ARG_NOWRECORD) => Ok(RequestKind::Live),
        Some(ARG_HISTORY_FILE) => Ok(RequestKind::ArchiveIndex),
        Some(ARG_HISTORY_DATA) => Ok(RequestKind::ArchivePage),
        _ => Err(DecodeError::UnknownCommand(marker_text(argument))),
    }
}

/// Argument text naming a request kind on the wire
pub fn argument_of(kind: RequestKind) -> &'static str {
    match kind {
        RequestKind::Units => ARG_SETUP,
        RequestKind::Live => ARG_NOWRECORD,
        RequestKind::ArchiveIndex => ARG_HISTORY_FILE,
        RequestKind::ArchivePage => ARG_HISTORY_DATA,
    }
}

/// Declared length of a `HISTORY_DATA` frame, validated.
fn declared_history_len(data: &[u8]) -> Result<usize, DecodeError> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[HEADER_SIZE..HEADER_SIZE + 4]);
    let declared = u32::from_le_bytes(raw) as usize;

    if declared < HISTORY_DATA_HEADER_SIZE
        || declared > MAX_HISTORY_DATA_SIZE
        || (declared - HISTORY_DATA_HEADER_SIZE) % HISTORY_RECORD_SIZE != 0
    {
        return Err(DecodeError::InvalidFrame(format!(
            "HISTORY_DATA declares {} bytes, not 40 + n x 60 (n <= {})",
            declared, MAX_PAGE_RECORDS
        )));
    }
    Ok(declared)
}

/// Frame must be exactly `size` bytes
fn expect_size(data: &[u8], size: usize) -> Result<(), DecodeError> {
    if data.len() < size {
        return Err(DecodeError::TooShort {
            expected: size,
            actual: data.len(),
        });
    }
    if data.len() > size {
        return Err(DecodeError::LengthMismatch {
            header_len: size,
            actual_len: data.len(),
        });
    }
    Ok(())
}

/// Parse a `SETUP` response
pub fn parse_setup(data: &[u8]) -> Result<ConsoleSetup, DecodeError> {
    expect_size(data, SETUP_SIZE)?;
    let frame: SetupFrame = bincode::deserialize(data)?;

    Ok(ConsoleSetup {
        units: UnitCodes {
            temperature: frame.temperature,
            pressure: frame.pressure,
            speed: frame.wind,
            rain: frame.rain,
            solar_radiation: frame.solar,
        },
        time_format: frame.time_format,
        date_format: frame.date_format,
        rain_display: frame.rain_display,
        graph_time: frame.graph_time,
        barometer_display: frame.barometer_display,
        weather_threshold: frame.weather_threshold,
        storm_threshold: frame.storm_threshold,
        current_weather: frame.current_weather,
        rain_reset_month: frame.rain_reset_month,
        update_interval_minutes: frame.update_interval,
    })
}

/// Parse a `NOWRECORD` response. Values stay in the console's units.
pub fn parse_now_record(data: &[u8]) -> Result<RawValues, DecodeError> {
    expect_size(data, NOWRECORD_SIZE)?;
    let frame: NowRecordFrame = bincode::deserialize(data)?;

    let mut values = RawValues::new();

    let wind_dir = frame.wind_dir;
    if wind_dir != MISSING_I16 {
        values.insert(Field::WindDir, wind_dir as f64);
    }
    for (field, humidity) in [
        (Field::InHumidity, frame.in_humidity),
        (Field::OutHumidity, frame.out_humidity),
    ] {
        if humidity != MISSING_HUMIDITY {
            values.insert(field, humidity as f64);
        }
    }

    let measures = frame.measures;
    for (field, value) in LIVE_FIELDS.iter().zip(measures) {
        if live_value_present(*field, value) {
            values.insert(*field, round3(value));
        }
    }

    let uv = frame.uv_index;
    if uv >= 0 {
        values.insert(Field::UvIndex, uv as f64);
    }

    Ok(values)
}

fn live_value_present(field: Field, value: f32) -> bool {
    if !value.is_finite() {
        return false;
    }
    match field {
        Field::RainRate
        | Field::DailyRain
        | Field::WeeklyRain
        | Field::MonthlyRain
        | Field::YearlyRain => value < LIVE_MISSING_RAIN,
        Field::Radiation => value <= LIVE_MISSING_RADIATION,
        _ => value < LIVE_MISSING_MEASURE,
    }
}

/// Round a wire float to 3 decimals so 15.9f32 reads as 15.9
fn round3(value: f32) -> f64 {
    (value as f64 * 1000.0).round() / 1000.0
}

/// Parse a `HISTORY_FILE` response into partitions, oldest first
pub fn parse_history_file(data: &[u8]) -> Result<ArchiveIndex, DecodeError> {
    expect_size(data, HISTORY_FILE_SIZE)?;
    let frame: HistoryFileFrame = bincode::deserialize(data)?;

    let years = frame.years;
    let counts = frame.counts;
    let mut partitions: Vec<ArchivePartition> = years
        .iter()
        .zip(counts.iter())
        .filter(|(year, _)| **year != 0)
        .map(|(year, count)| ArchivePartition {
            key: *year,
            records: *count,
        })
        .collect();
    partitions.reverse();

    if partitions.windows(2).any(|w| w[0].key >= w[1].key) {
        return Err(DecodeError::InvalidFrame(format!(
            "HISTORY_FILE years out of order: {:?}",
            years
        )));
    }

    Ok(ArchiveIndex { partitions })
}

/// Parse a `HISTORY_DATA` response
pub fn parse_history_data(data: &[u8]) -> Result<Vec<ArchiveEntry>, DecodeError> {
    if data.len() < HISTORY_DATA_HEADER_SIZE {
        return Err(DecodeError::TooShort {
            expected: HISTORY_DATA_HEADER_SIZE,
            actual: data.len(),
        });
    }
    let declared = declared_history_len(data)?;
    if declared != data.len() {
        return Err(DecodeError::LengthMismatch {
            header_len: declared,
            actual_len: data.len(),
        });
    }

    data[HISTORY_DATA_HEADER_SIZE..]
        .chunks_exact(HISTORY_RECORD_SIZE)
        .map(parse_history_record)
        .collect()
}

fn parse_history_record(chunk: &[u8]) -> Result<ArchiveEntry, DecodeError> {
    let record: HistoryRecord = bincode::deserialize(chunk)?;

    let filetime = record.filetime;
    let recorded_at = filetime_to_naive(filetime).ok_or_else(|| {
        DecodeError::InvalidFrame(format!("archive timestamp {} out of range", filetime))
    })?;

    let mut values = RawValues::new();

    let words = record.words;
    for ((field, scale), raw) in ARCHIVE_WORDS.iter().zip(words) {
        let humidity = matches!(field, Field::InHumidity | Field::OutHumidity);
        if raw == MISSING_I16 || (humidity && raw == MISSING_HUMIDITY as i16) {
            continue;
        }
        values.insert(*field, raw as f64 / scale);
    }

    let longs = record.longs;
    for ((field, scale), raw) in ARCHIVE_LONGS.iter().zip(longs) {
        if raw >= MISSING_U32 || (*field == Field::UvIrradiance && raw == MISSING_I16 as u32) {
            continue;
        }
        values.insert(*field, raw as f64 / scale);
    }

    Ok(ArchiveEntry {
        recorded_at,
        values,
    })
}

/// Convert FILETIME ticks to a wall-clock time
pub fn filetime_to_naive(ticks: u64) -> Option<NaiveDateTime> {
    let secs = (ticks / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos).map(|t| t.naive_utc())
}

/// Convert a wall-clock time to FILETIME ticks (saturates before 1601)
pub fn naive_to_filetime(time: NaiveDateTime) -> u64 {
    let utc = time.and_utc();
    let secs = utc.timestamp() + FILETIME_UNIX_OFFSET_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * FILETIME_TICKS_PER_SEC + (utc.timestamp_subsec_nanos() / 100) as u64
}

// =============================================================================
// Console side
// =============================================================================

/// Decode a client request, as the console would.
pub fn decode_request(data: &[u8]) -> Result<Request, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::TooShort {
            expected: HEADER_SIZE,
            actual: data.len(),
        });
    }
    let header: FrameHeader = bincode::deserialize(&data[..HEADER_SIZE])?;

    let device = header.device;
    expect_marker("device", &device, CLIENT_NAME)?;
    let command = header.command;
    expect_marker("command", &command, CMD_READ)?;

    let argument = header.argument;
    match kind_of_argument(&argument)? {
        RequestKind::Units => expect_size(data, REQUEST_SIZE).map(|_| Request::Units),
        RequestKind::Live => expect_size(data, REQUEST_SIZE).map(|_| Request::Live),
        RequestKind::ArchiveIndex => {
            expect_size(data, REQUEST_SIZE).map(|_| Request::ArchiveIndex)
        }
        RequestKind::ArchivePage => {
            expect_size(data, HISTORY_DATA_REQUEST_SIZE)?;
            let i32_at = |at: usize| {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[at..at + 4]);
                i32::from_le_bytes(raw)
            };
            let i16_at = |at: usize| i16::from_le_bytes([data[at], data[at + 1]]);

            let partition = i16_at(40);
            let count = i16_at(42);
            let start = i32_at(44);
            let reply_len = i32_at(36);
            if partition <= 0 || count < 0 || start < 0 {
                return Err(DecodeError::InvalidFrame(format!(
                    "HISTORY_DATA request for year {} records {}+{}",
                    partition, start, count
                )));
            }
            let expected = HISTORY_DATA_HEADER_SIZE + count as usize * HISTORY_RECORD_SIZE;
            if reply_len as usize != expected {
                return Err(DecodeError::LengthMismatch {
                    header_len: reply_len as usize,
                    actual_len: expected,
                });
            }
            Ok(Request::ArchivePage {
                partition: partition as u16,
                start: start as u32,
                count: count as u16,
            })
        }
    }
}

/// Encode a console response frame. `device` is the console's name.
///
/// Missing values are written as the console's "no reading" markers.
pub fn encode_response(device: &str, response: &Response) -> Vec<u8> {
    let argument = argument_of(response.kind());
    let mut frame = header_bytes(device, CMD_WRITE, argument);

    match response {
        Response::Units(setup) => {
            frame.extend_from_slice(&padded::<8>(argument));
            let settings = [
                setup.time_format,
                setup.date_format,
                setup.units.temperature,
                setup.units.pressure,
                setup.units.speed,
                setup.units.rain,
                setup.units.solar_radiation,
                setup.rain_display,
                setup.graph_time,
                setup.barometer_display,
                setup.weather_threshold,
                setup.storm_threshold,
                setup.current_weather,
                setup.rain_reset_month,
                setup.update_interval_minutes,
            ];
            frame.extend(settings.iter().map(|s| *s as u8));
        }
        Response::Live(values) => {
            frame.extend_from_slice(&padded::<8>(argument));
            let wind_dir = values.get(&Field::WindDir).map_or(MISSING_I16, |v| *v as i16);
            frame.extend_from_slice(&wind_dir.to_le_bytes());
            for field in [Field::InHumidity, Field::OutHumidity] {
                let humidity = values.get(&field).map_or(MISSING_HUMIDITY, |v| *v as i8);
                frame.push(humidity as u8);
            }
            for field in LIVE_FIELDS {
                let missing = match field {
                    Field::RainRate
                    | Field::DailyRain
                    | Field::WeeklyRain
                    | Field::MonthlyRain
                    | Field::YearlyRain => LIVE_MISSING_RAIN * 2.0,
                    Field::Radiation => LIVE_MISSING_RADIATION * 2.0,
                    _ => MISSING_I16 as f32,
                };
                let value = values.get(&field).map_or(missing, |v| *v as f32);
                frame.extend_from_slice(&value.to_le_bytes());
            }
            let uv = values.get(&Field::UvIndex).map_or(-1, |v| *v as i8);
            frame.push(uv as u8);
            frame.extend_from_slice(&[0u8; 3]);
        }
        Response::ArchiveIndex(index) => {
            let mut years = [0u16; HISTORY_SLOTS];
            let mut counts = [0u32; HISTORY_SLOTS];
            for (slot, partition) in index.partitions.iter().rev().take(HISTORY_SLOTS).enumerate() {
                years[slot] = partition.key;
                counts[slot] = partition.records;
            }
            let payload = (HISTORY_FILE_SIZE - HEADER_SIZE) as i16;
            for size in [payload, 0, 0, 0] {
                frame.extend_from_slice(&size.to_le_bytes());
            }
            for year in years {
                frame.extend_from_slice(&year.to_le_bytes());
            }
            for count in counts {
                frame.extend_from_slice(&count.to_le_bytes());
            }
        }
        Response::ArchivePage(entries) => {
            let total = HISTORY_DATA_HEADER_SIZE + entries.len() * HISTORY_RECORD_SIZE;
            frame.extend_from_slice(&(total as u32).to_le_bytes());
            frame.extend_from_slice(&[0u8; 4]);
            for entry in entries {
                encode_history_record(&mut frame, entry);
            }
        }
    }
    frame
}

fn encode_history_record(frame: &mut Vec<u8>, entry: &ArchiveEntry) {
    frame.extend_from_slice(&naive_to_filetime(entry.recorded_at).to_le_bytes());
    for (field, scale) in ARCHIVE_WORDS {
        let raw = entry
            .values
            .get(&field)
            .map_or(MISSING_I16, |v| (v * scale).round() as i16);
        frame.extend_from_slice(&raw.to_le_bytes());
    }
    for (field, scale) in ARCHIVE_LONGS {
        let raw = entry
            .values
            .get(&field)
            .map_or(MISSING_U32, |v| (v * scale).round() as u32);
        frame.extend_from_slice(&raw.to_le_bytes());
    }
}

/// The console's answer to a discovery probe
pub fn discovery_response(name: &str, mac: &str, ip: Ipv4Addr) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DISCOVERY_RESPONSE_SIZE);
    frame.extend_from_slice(&padded::<8>(name));
    frame.extend_from_slice(&padded::<8>(CMD_SEARCH));
    frame.extend_from_slice(&[0u8; 24]);
    frame.extend_from_slice(&padded::<24>(mac));
    frame.extend_from_slice(&padded::<16>(&ip.to_string()));
    frame
}

// =============================================================================
// Helpers
// =============================================================================

fn header_bytes(device: &str, command: &str, argument: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_SIZE + 8);
    frame.extend_from_slice(&padded::<8>(device));
    frame.extend_from_slice(&padded::<8>(command));
    frame.extend_from_slice(&padded::<16>(argument));
    frame
}

fn plain_request(argument: &str, body: [u8; 8]) -> Vec<u8> {
    let mut frame = header_bytes(CLIENT_NAME, CMD_READ, argument);
    frame.extend_from_slice(&body);
    frame
}

/// Printable ASCII text of a NUL-padded field
fn printable(bytes: &[u8]) -> Option<String> {
    c_string(bytes).filter(|s| s.bytes().all(|b| b.is_ascii_graphic() || b == b' '))
}

fn marker_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn expect_marker(field: &'static str, bytes: &[u8], expected: &str) -> Result<(), DecodeError> {
    if c_string(bytes).as_deref() == Some(expected) {
        Ok(())
    } else {
        Err(DecodeError::InvalidMarker {
            field,
            expected: expected.to_string(),
            actual: marker_text(bytes),
        })
    }
}
