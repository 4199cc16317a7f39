//! # HP1000 Driver
//!
//! Network driver for HP1000 / WS1001 / XC0422 weather-station consoles.
//!
//! The driver:
//! - Discovers the console on the local network by UDP broadcast
//! - Opens a session and reads the console's unit settings
//! - Catches up on archive records logged since a caller-supplied cursor
//! - Polls live data at a bounded rate, forever, reconnecting after failures
//!
//! ## Architecture
//!
//! Protocol handling lives in [`hp1000_core`]; this crate owns the sockets,
//! timers and the reconnect loop.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     hp1000-driver                         │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │ PollLoop (poll)                                     │  │
//! │  │  Discovering -> Negotiating -> CatchingUp -> Polling│  │
//! │  └──────┬──────────────┬───────────────┬───────────────┘  │
//! │         ▼              ▼               ▼                  │
//! │  ┌────────────┐ ┌─────────────┐ ┌──────────────────────┐  │
//! │  │ Discovery  │ │ StationLink │ │ ArchiveCatchup       │  │
//! │  │ (UDP bcast)│ │ (TCP 6500)  │ │  + HistoryReader     │  │
//! │  └────────────┘ └─────────────┘ └──────────────────────┘  │
//! │         │              │               │                  │
//! │         ▼              ▼               ▼                  │
//! │   EventLog (events)          RecordSink (sink)            │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Running the Driver
//!
//! ```rust,no_run
//! use clap::Parser;
//! use hp1000_driver::{config::StationConfig, run_station, Cli};
//! use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let args = Cli::parse_from(["hp1000-driver", "--broadcast", "192.168.1.255"]);
//!     let config = StationConfig::from_cli(&args).unwrap();
//!
//!     Toplevel::new(|s| async move {
//!         s.start(SubsystemBuilder::new("station", move |s| run_station(s, config, false)));
//!     })
//!     .catch_signals()
//!     .handle_shutdown_requests(Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `emulator` - in-memory console and the `--emulate` flag
//!
//! ## Command-Line Interface
//!
//! See [`Cli`] for all options. Output goes to stdout as JSON lines, logs to
//! stderr.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;
use hp1000_core::protocol::codec_for;
use hp1000_core::{ClockZone, StationModel, WireCodec};
use tokio_graceful_shutdown::SubsystemHandle;

pub mod catchup;
pub mod config;
pub mod discovery;
#[cfg(any(test, feature = "emulator"))]
pub mod emulator;
pub mod events;
pub mod history;
pub mod link;
pub mod network;
pub mod poll;
pub mod sink;
pub mod transport;

use config::StationConfig;
use discovery::Discovery;
use events::Events;
use poll::PollLoop;
use sink::JsonLinesSink;
use transport::AcceptConnector;

/// Product identifier carried by every log message
pub const PRODUCT: &str = "HP1000";

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// JSON config file; flags given here override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Derive the discovery broadcast address from this interface
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Send discovery probes to this address instead
    #[arg(short, long)]
    pub broadcast: Option<Ipv4Addr>,

    /// Console model (HP1000, WS1001 or XC0422)
    #[arg(short, long)]
    pub model: Option<StationModel>,

    /// Seconds to wait for a discovery response
    #[arg(long)]
    pub discovery_timeout: Option<f64>,

    /// Discovery attempts before the link counts as degraded
    #[arg(long)]
    pub max_retry: Option<u32>,

    /// Seconds to wait for each response from the console
    #[arg(long)]
    pub request_timeout: Option<f64>,

    /// Minimum seconds between two live data requests
    #[arg(short, long)]
    pub loop_delay: Option<f64>,

    /// Seconds to wait after losing the console before rediscovering
    #[arg(long)]
    pub cooldown: Option<f64>,

    /// Only emit archive records after this instant (RFC 3339)
    #[arg(short, long)]
    pub since: Option<DateTime<Utc>>,

    /// Time zone of the console clock: local or utc
    #[arg(long)]
    pub console_clock: Option<ClockZone>,

    /// Archive records per page request (1 to 100)
    #[arg(long)]
    pub page_size: Option<u16>,

    /// Talk to a built-in emulated console instead of the network
    #[cfg(feature = "emulator")]
    #[arg(long, default_value_t = false)]
    pub emulate: bool,
}

impl Cli {
    #[cfg(feature = "emulator")]
    pub fn emulate(&self) -> bool {
        self.emulate
    }

    #[cfg(not(feature = "emulator"))]
    pub fn emulate(&self) -> bool {
        false
    }
}

/// Run the driver until the subsystem is asked to shut down.
///
/// Archive records and live readings go to stdout as JSON lines.
pub async fn run_station(
    subsys: SubsystemHandle,
    config: StationConfig,
    emulate: bool,
) -> Result<(), std::io::Error> {
    let cancel = subsys.create_cancellation_token();
    let codec: Arc<dyn WireCodec> = Arc::from(codec_for(config.model));
    let events = Events::default();
    let sink = Box::new(JsonLinesSink::new(std::io::stdout()));

    log::info!("{} driver {} starting for {} consoles", PRODUCT, VERSION, config.model);

    let cursor = if emulate {
        run_emulated(codec, sink, events, config, cancel).await
    } else {
        let locator = Discovery::from_config(codec.clone(), &config, events.clone());
        let connector = AcceptConnector::new(codec.clone(), config.session_port, config.request_timeout);
        PollLoop::new(locator, connector, codec, sink, events, config, cancel)
            .run()
            .await
    };

    if let Some(cursor) = cursor {
        log::info!("Resume with --since {}", cursor.to_rfc3339());
    }
    Ok(())
}

#[cfg(feature = "emulator")]
async fn run_emulated(
    codec: Arc<dyn WireCodec>,
    sink: Box<dyn sink::RecordSink>,
    events: Events,
    config: StationConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> Option<DateTime<Utc>> {
    let console = emulator::Emulator::demo();
    log::info!("Using emulated console {}", console.station());
    PollLoop::new(console.locator(), console.connector(), codec, sink, events, config, cancel)
        .run()
        .await
}

#[cfg(not(feature = "emulator"))]
async fn run_emulated(
    _codec: Arc<dyn WireCodec>,
    _sink: Box<dyn sink::RecordSink>,
    _events: Events,
    _config: StationConfig,
    _cancel: tokio_util::sync::CancellationToken,
) -> Option<DateTime<Utc>> {
    log::error!("Built without the emulator feature");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses() {
        let args = Cli::parse_from([
            "hp1000-driver",
            "-i",
            "eth0",
            "--model",
            "ws1001",
            "--since",
            "2024-05-01T10:00:00Z",
            "--console-clock",
            "utc",
            "-l",
            "0",
        ]);
        assert_eq!(args.interface.as_deref(), Some("eth0"));
        assert_eq!(args.model, Some(StationModel::Hp1000));
        assert_eq!(args.console_clock, Some(ClockZone::Utc));
        assert_eq!(args.loop_delay, Some(0.0));
        assert!(!args.emulate());

        let config = StationConfig::from_cli(&args).unwrap();
        assert_eq!(config.interface.as_deref(), Some("eth0"));
        assert!(config.loop_delay.is_zero());
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(Cli::try_parse_from(["hp1000-driver", "--model", "vantage"]).is_err());
        assert!(Cli::try_parse_from(["hp1000-driver", "--console-clock", "mars"]).is_err());
        assert!(Cli::try_parse_from(["hp1000-driver", "--broadcast", "not-an-ip"]).is_err());
    }
}
