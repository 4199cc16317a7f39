//! Station wire protocols.
//!
//! Each console family gets its own module implementing [`WireCodec`]. All
//! functions are pure (no I/O): the driver crate owns the sockets and hands
//! bytes in and out.
//!
//! # Structure
//!
//! A codec provides:
//! - **Discovery** - the broadcast probe and parsing of the console's answer
//! - **Framing** - how many bytes make up the next response on the stream
//! - **Requests** - encoding of unit, live, archive-index and archive-page requests
//! - **Responses** - validated decoding into the typed [`Response`]
//!
//! # Example
//!
//! ```rust
//! use hp1000_core::protocol::{hp1000::Hp1000Codec, Request, WireCodec};
//!
//! let codec = Hp1000Codec;
//! let frame = codec.encode_request(&Request::Live);
//! assert_eq!(frame.len(), 40);
//! ```

use std::net::SocketAddrV4;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::record::RawValues;
use crate::station::StationAddress;
use crate::units::UnitCodes;
use crate::StationModel;

#[cfg(feature = "hp1000")]
pub mod hp1000;

/// The kinds of request a station session can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RequestKind {
    Units,
    Live,
    ArchiveIndex,
    ArchivePage,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Units => "units",
            RequestKind::Live => "live data",
            RequestKind::ArchiveIndex => "archive index",
            RequestKind::ArchivePage => "archive page",
        }
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request to the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// Unit selector codes and other set-up screen settings
    Units,
    /// Current conditions
    Live,
    /// Which archive partitions exist and how many records each holds
    ArchiveIndex,
    /// `count` records of one partition starting at record `start`
    ArchivePage { partition: u16, start: u32, count: u16 },
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Units => RequestKind::Units,
            Request::Live => RequestKind::Live,
            Request::ArchiveIndex => RequestKind::ArchiveIndex,
            Request::ArchivePage { .. } => RequestKind::ArchivePage,
        }
    }
}

/// Everything the console reports from its set-up screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConsoleSetup {
    pub units: UnitCodes,
    pub time_format: i8,
    pub date_format: i8,
    pub rain_display: i8,
    pub graph_time: i8,
    pub barometer_display: i8,
    pub weather_threshold: i8,
    pub storm_threshold: i8,
    pub current_weather: i8,
    pub rain_reset_month: i8,
    pub update_interval_minutes: i8,
}

/// One archive partition (a calendar year on the HP1000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePartition {
    pub key: u16,
    pub records: u32,
}

/// Archive partitions, oldest first; empty partitions are left out
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveIndex {
    pub partitions: Vec<ArchivePartition>,
}

impl ArchiveIndex {
    pub fn total_records(&self) -> u64 {
        self.partitions.iter().map(|p| p.records as u64).sum()
    }

    pub fn find(&self, key: u16) -> Option<usize> {
        self.partitions.iter().position(|p| p.key == key)
    }
}

/// One decoded archive record, still in console wall-clock time
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub recorded_at: NaiveDateTime,
    pub values: RawValues,
}

/// A decoded, validated response
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Units(ConsoleSetup),
    Live(RawValues),
    ArchiveIndex(ArchiveIndex),
    ArchivePage(Vec<ArchiveEntry>),
}

impl Response {
    pub fn kind(&self) -> RequestKind {
        match self {
            Response::Units(_) => RequestKind::Units,
            Response::Live(_) => RequestKind::Live,
            Response::ArchiveIndex(_) => RequestKind::ArchiveIndex,
            Response::ArchivePage(_) => RequestKind::ArchivePage,
        }
    }
}

/// Frame definitions for one console family.
///
/// Implementations must never return a partially decoded structure: any
/// header, length or payload problem is a [`DecodeError`].
pub trait WireCodec: Send + Sync {
    /// Largest number of records one archive page request may ask for
    fn max_page_records(&self) -> u16;

    /// The broadcast discovery probe
    fn discovery_probe(&self) -> Vec<u8>;

    /// Parse a datagram received in answer to the probe
    fn decode_discovery(
        &self,
        data: &[u8],
        source: SocketAddrV4,
    ) -> Result<StationAddress, DecodeError>;

    /// Encode a request frame
    fn encode_request(&self, request: &Request) -> Vec<u8>;

    /// Length of the response frame at the start of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed to tell.
    fn frame_len(&self, buf: &[u8]) -> Result<Option<usize>, DecodeError>;

    /// Decode one complete response frame
    fn decode_response(&self, data: &[u8]) -> Result<Response, DecodeError>;
}

/// The codec for a station model
#[cfg(feature = "hp1000")]
pub fn codec_for(model: StationModel) -> Box<dyn WireCodec> {
    match model {
        StationModel::Hp1000 => Box::new(hp1000::Hp1000Codec),
    }
}

/// Helper function to extract a null-terminated C string from bytes
pub fn c_string(bytes: &[u8]) -> Option<String> {
    let null_pos = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..null_pos])
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Copy `text` into a NUL-padded fixed-size field
pub fn padded<const N: usize>(text: &str) -> [u8; N] {
    let mut field = [0u8; N];
    let len = text.len().min(N);
    field[..len].copy_from_slice(&text.as_bytes()[..len]);
    field
}
