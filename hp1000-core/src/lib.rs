//! # HP1000 Core
//!
//! Platform-independent protocol library for HP1000 / WS1001 / XC0422
//! weather-station consoles.
//!
//! This crate contains pure parsing and bookkeeping logic with **zero I/O
//! dependencies**: no sockets, no async runtime. The `hp1000-driver` crate
//! owns the network and drives the state machines defined here.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  hp1000-core (platform-independent, no tokio/async deps)    │
//! │  ├── units/      (selector code -> unit tag table)          │
//! │  ├── protocol/   (WireCodec trait, HP1000 frames)           │
//! │  ├── record      (archive records, live readings)           │
//! │  ├── connection  (link and catch-up state machines)         │
//! │  ├── archive     (cursor, batch draining, console clock)    │
//! │  └── rain        (rain since previous observation)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  hp1000-driver          │
//!                 │  (tokio, sockets, CLI)  │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Feature Flags
//!
//! - `hp1000` - HP1000 family frame definitions (default)
//!
//! ## Example: Decoding a Discovery Response
//!
//! ```rust
//! use hp1000_core::protocol::{codec_for, hp1000};
//! use hp1000_core::StationModel;
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! let codec = codec_for(StationModel::Hp1000);
//! let packet = hp1000::discovery_response("HP2000", "00:0E:C6:01:02:03", Ipv4Addr::new(192, 168, 1, 40));
//! let source = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 40), 6000);
//! match codec.decode_discovery(&packet, source) {
//!     Ok(station) => println!("Found console: {}", station),
//!     Err(e) => println!("Parse error: {}", e),
//! }
//! ```
//!
//! ## Example: Resolving Units
//!
//! ```rust
//! use hp1000_core::units::{resolve, Quantity, UnitTag};
//!
//! assert_eq!(resolve(Quantity::Speed, 2), Ok(UnitTag::Knot));
//! assert!(resolve(Quantity::Rain, 7).is_err());
//! ```

pub mod archive;
pub mod connection;
pub mod error;
pub mod model;
pub mod protocol;
pub mod rain;
pub mod record;
pub mod station;
pub mod units;

// Re-export commonly used types
pub use archive::{BatchDrainer, ClockZone, DrainStats, RetrievalCursor, Verdict};
pub use connection::{CatchupState, InvalidTransition, LinkState, LinkStateMachine};
pub use error::DecodeError;
pub use model::StationModel;
pub use protocol::{Request, RequestKind, Response, WireCodec};
pub use rain::RainTracker;
pub use record::{ArchiveRecord, Field, LiveReading, Observations, RawValues, TaggedValue};
pub use station::StationAddress;
pub use units::{Quantity, UnitSelection, UnitTag, UnknownSelector};
