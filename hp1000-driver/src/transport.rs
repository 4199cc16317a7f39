//! Byte transport for a station session.
//!
//! The HP1000 console opens the data session itself: after discovery the
//! client listens on the session port and the console connects back. The
//! [`Connector`] waits for that connection and yields a [`Transport`] that
//! moves whole frames.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use hp1000_core::{StationAddress, WireCodec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::link::LinkError;
use crate::network::create_session_listener;

/// Moves complete frames to and from the console.
#[async_trait]
pub trait Transport: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError>;

    /// Wait for the next complete frame. Cancel-safe: dropping the future
    /// keeps any bytes already received.
    async fn recv_frame(&mut self) -> Result<Vec<u8>, LinkError>;

    /// Forget buffered bytes after an undecodable frame, before the request
    /// is retried.
    fn discard_pending(&mut self) {}
}

/// Opens a session with a discovered console
#[async_trait]
pub trait Connector: Send {
    async fn connect(&mut self, station: &StationAddress) -> Result<Box<dyn Transport>, LinkError>;
}

// =============================================================================
// Framing
// =============================================================================

/// Splits the session byte stream into response frames using the codec's
/// header rules.
#[derive(Clone)]
pub struct FrameCodec {
    codec: Arc<dyn WireCodec>,
}

impl FrameCodec {
    pub fn new(codec: Arc<dyn WireCodec>) -> Self {
        FrameCodec { codec }
    }
}

impl Decoder for FrameCodec {
    type Item = Vec<u8>;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.frame_len(src) {
            Ok(Some(len)) if src.len() >= len => Ok(Some(src.split_to(len).to_vec())),
            Ok(_) => Ok(None),
            Err(e) => {
                // Resynchronising inside a garbled stream isn't possible, the
                // next request starts from an empty buffer
                src.clear();
                Err(e.into())
            }
        }
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = LinkError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

// =============================================================================
// TCP
// =============================================================================

/// A console session over TCP.
///
/// Drives [`FrameCodec`] by hand instead of through `Framed`, which gives up
/// on the stream after the first decode error.
pub struct TcpTransport {
    stream: TcpStream,
    buf: BytesMut,
    framer: FrameCodec,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, codec: Arc<dyn WireCodec>) -> Self {
        TcpTransport {
            stream,
            buf: BytesMut::with_capacity(4096),
            framer: FrameCodec::new(codec),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let mut out = BytesMut::with_capacity(frame.len());
        self.framer.encode(frame, &mut out)?;
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, LinkError> {
        loop {
            if let Some(frame) = self.framer.decode(&mut self.buf)? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(LinkError::Closed);
            }
        }
    }

    fn discard_pending(&mut self) {
        if self.buf.has_remaining() {
            log::trace!("Discarding {} stale bytes", self.buf.len());
            self.buf.clear();
        }
    }
}

/// Waits on the session port for the discovered console to connect.
///
/// The listener only lives while a connection is expected. Connections from
/// any other address are dropped and waiting continues until the timeout.
pub struct AcceptConnector {
    codec: Arc<dyn WireCodec>,
    port: u16,
    timeout: Duration,
}

impl AcceptConnector {
    pub fn new(codec: Arc<dyn WireCodec>, port: u16, timeout: Duration) -> Self {
        AcceptConnector {
            codec,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Connector for AcceptConnector {
    async fn connect(&mut self, station: &StationAddress) -> Result<Box<dyn Transport>, LinkError> {
        let listener = create_session_listener(self.port)?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        let expected = [station.ip, *station.source.ip()];

        loop {
            let (stream, peer) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| LinkError::Timeout(self.timeout))??;
            match peer.ip() {
                std::net::IpAddr::V4(ip) if expected.contains(&ip) => {
                    log::debug!("{}: session connected from {}", station.name, peer);
                    stream.set_nodelay(true)?;
                    return Ok(Box::new(TcpTransport::new(stream, self.codec.clone())));
                }
                ip => {
                    let actual = match ip {
                        std::net::IpAddr::V4(ip) => ip,
                        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    };
                    log::warn!(
                        "{}",
                        LinkError::PeerMismatch {
                            expected: station.ip,
                            actual,
                        }
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hp1000_core::protocol::hp1000::{self, Hp1000Codec};
    use hp1000_core::protocol::{ConsoleSetup, Response};
    use hp1000_core::DecodeError;
    use std::net::SocketAddrV4;

    fn codec() -> Arc<dyn WireCodec> {
        Arc::new(Hp1000Codec)
    }

    #[test]
    fn test_decoder_waits_for_whole_frame() {
        let frame = hp1000::encode_response("HP2000", &Response::Units(ConsoleSetup::default()));
        let mut framer = FrameCodec::new(codec());
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&frame[..20]);
        assert_eq!(framer.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&frame[20..]);
        buf.extend_from_slice(&frame[..5]);
        assert_eq!(framer.decode(&mut buf).unwrap(), Some(frame.clone()));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn test_decoder_clears_garbage() {
        let mut framer = FrameCodec::new(codec());
        let mut buf = BytesMut::from(&[0xffu8; 64][..]);
        assert!(matches!(
            framer.decode(&mut buf),
            Err(LinkError::Decode(DecodeError::InvalidString("device name")))
        ));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_accept_from_station() {
        let listener_port = {
            // Find a free port, then release it for the connector
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let station = StationAddress {
            name: "HP2000".to_string(),
            mac: None,
            ip: Ipv4Addr::LOCALHOST,
            source: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6000),
        };
        let mut connector = AcceptConnector::new(codec(), listener_port, Duration::from_secs(5));

        let console = tokio::spawn(async move {
            let frame = hp1000::encode_response("HP2000", &Response::Units(ConsoleSetup::default()));
            loop {
                match TcpStream::connect(("127.0.0.1", listener_port)).await {
                    Ok(mut stream) => {
                        // Split the frame so the reader has to reassemble it
                        stream.write_all(&frame[..10]).await.unwrap();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        stream.write_all(&frame[10..]).await.unwrap();
                        let mut request = [0u8; hp1000::REQUEST_SIZE];
                        stream.read_exact(&mut request).await.unwrap();
                        return request.to_vec();
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        });

        let mut transport = connector.connect(&station).await.unwrap();
        let frame = transport.recv_frame().await.unwrap();
        assert!(matches!(
            Hp1000Codec.decode_response(&frame).unwrap(),
            Response::Units(_)
        ));
        let request = Hp1000Codec.encode_request(&hp1000_core::Request::Live);
        transport.send_frame(&request).await.unwrap();
        assert_eq!(console.await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let station = StationAddress {
            name: "HP2000".to_string(),
            mac: None,
            ip: Ipv4Addr::new(192, 0, 2, 1),
            source: SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 6000),
        };
        let mut connector = AcceptConnector::new(codec(), 0, Duration::from_millis(50));
        assert!(matches!(
            connector.connect(&station).await,
            Err(LinkError::Timeout(_))
        ));
    }
}
