//! Request/response session with one console.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use hp1000_core::protocol::{ArchiveIndex, ArchiveEntry, ConsoleSetup};
use hp1000_core::{
    DecodeError, Request, RequestKind, Response, StationAddress, UnitSelection, UnknownSelector,
    WireCodec,
};
use thiserror::Error;
use tokio::time::Instant;

use crate::events::{Events, LogCategory};
use crate::transport::Transport;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No response within {0:?}")]
    Timeout(Duration),
    #[error("Invalid response: {0}")]
    Decode(#[from] DecodeError),
    #[error("I/O operation failed")]
    Io(#[from] std::io::Error),
    #[error("Connection closed by console")]
    Closed,
    #[error("Expected {expected} response, got {actual}")]
    UnexpectedResponse {
        expected: RequestKind,
        actual: RequestKind,
    },
    #[error("Session opened from {actual}, expected {expected}")]
    PeerMismatch { expected: Ipv4Addr, actual: Ipv4Addr },
}

impl LinkError {
    /// Whether another attempt on the same session may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::Timeout(_) | LinkError::Decode(_) | LinkError::UnexpectedResponse { .. }
        )
    }
}

/// A request that failed on every attempt
#[derive(Error, Debug)]
#[error("{request} request failed after {attempts} attempt(s): {cause}")]
pub struct LinkFailure {
    pub request: RequestKind,
    pub attempts: u32,
    #[source]
    pub cause: LinkError,
}

/// Units the console is set to
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUnits {
    pub selection: UnitSelection,
    pub setup: ConsoleSetup,
    /// Selector codes outside the table; their quantities use defaults
    pub unknown: Vec<UnknownSelector>,
}

/// Answers still owed for attempts that timed out.
///
/// A retry is the same request, so a late answer repeats `frame`, the
/// answer that was finally taken.
#[derive(Debug)]
struct Owed {
    frame: Vec<u8>,
    count: u32,
}

/// An open session with a discovered console.
///
/// One request is in flight at a time. Retries stay on the same session;
/// when they run out the session is unusable and the caller rediscovers.
///
/// The console answers in order. An attempt that timed out may still be
/// answered later, after the next request went out, so those late answers
/// are recognised and dropped instead of being paired with the wrong request.
pub struct StationLink {
    station: StationAddress,
    transport: Box<dyn Transport>,
    codec: Arc<dyn WireCodec>,
    request_timeout: Duration,
    link_retries: u32,
    owed: Option<Owed>,
    events: Events,
}

impl StationLink {
    pub fn new(
        station: StationAddress,
        transport: Box<dyn Transport>,
        codec: Arc<dyn WireCodec>,
        request_timeout: Duration,
        link_retries: u32,
        events: Events,
    ) -> Self {
        StationLink {
            station,
            transport,
            codec,
            request_timeout,
            link_retries,
            owed: None,
            events,
        }
    }

    pub fn station(&self) -> &StationAddress {
        &self.station
    }

    pub fn codec(&self) -> &Arc<dyn WireCodec> {
        &self.codec
    }

    /// Send `request` and wait for its validated response.
    ///
    /// Timeouts and undecodable or mismatched responses are retried up to
    /// `link_retries` times. I/O errors and a closed connection end the
    /// session at once.
    pub async fn request(&mut self, request: Request) -> Result<Response, LinkFailure> {
        let kind = request.kind();
        let frame = self.codec.encode_request(&request);
        let max_attempts = 1 + self.link_retries;
        let mut attempts = 0;
        let mut timeouts = 0;

        loop {
            attempts += 1;
            match self.attempt(kind, &frame).await {
                Ok((response, answer)) => {
                    if timeouts > 0 {
                        self.owed = Some(Owed {
                            frame: answer,
                            count: timeouts,
                        });
                    }
                    return Ok(response);
                }
                Err(cause) if cause.is_retryable() && attempts < max_attempts => {
                    log::debug!(
                        "{}: {} request attempt {} failed: {}",
                        self.station.name,
                        kind,
                        attempts,
                        cause
                    );
                    match cause {
                        LinkError::Timeout(_) => timeouts += 1,
                        LinkError::Decode(_) => self.transport.discard_pending(),
                        _ => {}
                    }
                }
                Err(cause) => {
                    let failure = LinkFailure {
                        request: kind,
                        attempts,
                        cause,
                    };
                    self.events.error(LogCategory::Link, &failure);
                    return Err(failure);
                }
            }
        }
    }

    /// One send and the frame answering it, with the raw frame
    async fn attempt(&mut self, kind: RequestKind, frame: &[u8]) -> Result<(Response, Vec<u8>), LinkError> {
        self.transport.send_frame(frame).await?;
        let deadline = Instant::now() + self.request_timeout;

        let mut dropped = None;
        loop {
            let data = match tokio::time::timeout_at(deadline, self.transport.recv_frame()).await {
                Ok(received) => {
                    let data = received?;
                    if self.is_late_answer(&data) {
                        dropped = Some(data);
                        continue;
                    }
                    data
                }
                // Nothing followed, so the frame taken for a late answer was this one's
                Err(_) => dropped
                    .take()
                    .ok_or(LinkError::Timeout(self.request_timeout))?,
            };
            let response = self.codec.decode_response(&data)?;
            if response.kind() != kind {
                return Err(LinkError::UnexpectedResponse {
                    expected: kind,
                    actual: response.kind(),
                });
            }
            return Ok((response, data));
        }
    }

    /// Whether `data` is a late answer to an attempt that timed out.
    ///
    /// Anything else settles the debt: answers come in order, so owed ones
    /// that haven't shown up by now were lost.
    fn is_late_answer(&mut self, data: &[u8]) -> bool {
        let Some(owed) = self.owed.as_mut() else {
            return false;
        };
        if owed.frame != data {
            self.owed = None;
            return false;
        }
        owed.count -= 1;
        if owed.count == 0 {
            self.owed = None;
        }
        log::debug!("{}: dropped a late answer to a timed out request", self.station.name);
        true
    }

    /// Read the console's unit settings.
    ///
    /// Unknown selector codes are logged and fall back to the default unit of
    /// their quantity.
    pub async fn fetch_units(&mut self) -> Result<SessionUnits, LinkFailure> {
        let setup = match self.request(Request::Units).await? {
            Response::Units(setup) => setup,
            other => return Err(self.unexpected(RequestKind::Units, &other)),
        };
        let (selection, unknown) = UnitSelection::from_codes(&setup.units);
        for selector in &unknown {
            self.events.error(
                LogCategory::Units,
                format_args!(
                    "{}, using {}",
                    selector,
                    selector.quantity.default_unit()
                ),
            );
        }
        self.events
            .info(LogCategory::Units, format_args!("Console units: {}", selection));
        self.events.info(
            LogCategory::Units,
            format_args!(
                "Console setup: update every {} min, rain year starts in month {}, time format {}, date format {}, barometer display {}",
                setup.update_interval_minutes,
                setup.rain_reset_month,
                setup.time_format,
                setup.date_format,
                setup.barometer_display
            ),
        );
        Ok(SessionUnits {
            selection,
            setup,
            unknown,
        })
    }

    /// Current conditions, not yet tagged with units
    pub async fn read_live(&mut self) -> Result<hp1000_core::RawValues, LinkFailure> {
        match self.request(Request::Live).await? {
            Response::Live(values) => Ok(values),
            other => Err(self.unexpected(RequestKind::Live, &other)),
        }
    }

    pub async fn read_archive_index(&mut self) -> Result<ArchiveIndex, LinkFailure> {
        match self.request(Request::ArchiveIndex).await? {
            Response::ArchiveIndex(index) => Ok(index),
            other => Err(self.unexpected(RequestKind::ArchiveIndex, &other)),
        }
    }

    /// Up to `count` records of partition `partition`, starting at `start`
    pub async fn read_archive_page(
        &mut self,
        partition: u16,
        start: u32,
        count: u16,
    ) -> Result<Vec<ArchiveEntry>, LinkFailure> {
        let count = count.min(self.codec.max_page_records());
        let request = Request::ArchivePage {
            partition,
            start,
            count,
        };
        match self.request(request).await? {
            Response::ArchivePage(entries) => Ok(entries),
            other => Err(self.unexpected(RequestKind::ArchivePage, &other)),
        }
    }

    // request() already checks the kind, so this only guards the match arms
    fn unexpected(&self, expected: RequestKind, response: &Response) -> LinkFailure {
        LinkFailure {
            request: expected,
            attempts: 1,
            cause: LinkError::UnexpectedResponse {
                expected,
                actual: response.kind(),
            },
        }
    }
}

impl std::fmt::Debug for StationLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StationLink")
            .field("station", &self.station)
            .field("request_timeout", &self.request_timeout)
            .field("link_retries", &self.link_retries)
            .finish_non_exhaustive()
    }
}
