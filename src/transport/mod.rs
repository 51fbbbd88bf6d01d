
pub mod interleaved;
pub mod udp;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::transport::udp::UdpTransport;

pub use interleaved::InterleavedTransport;

/// Magic datagram sent to prime a NAT mapping for inbound media.
pub const NAT_PUNCH_PAYLOAD: [u8; 4] = 0xCEFA_EDFE_u32.to_be_bytes();

/// How the media bytes travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowerTransport {
    Udp,
    TcpInterleaved,
}

/// What the media bytes are framed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportProtocol {
    Rtp,
    Mp2t,
    Raw,
}

/// Negotiated transport parameters for one track, as extracted from the
/// session's Transport header by the signalling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTransport {
    pub lower_transport: LowerTransport,
    pub protocol: TransportProtocol,
    /// SSRC the server announced for this track, when any.
    pub ssrc: Option<u32>,
    /// `source` attribute of the Transport header.
    pub source: Option<String>,
    /// `destination` attribute of the Transport header.
    pub destination: Option<String>,
    /// Server RTP port and, when distinct, server RTCP port.
    pub server_port: Option<(u16, Option<u16>)>,
    /// Interleaved channel pair (RTP, RTCP).
    pub interleaved: Option<(u8, u8)>,
}

impl TrackTransport {
    /// Parses the hex SSRC attribute of a Transport header. Signalling is
    /// lax here; wider-than-32-bit values are truncated.
    pub fn parse_ssrc(value: &str) -> Option<u32> {
        let trimmed = value.trim().trim_start_matches("0x");
        u64::from_str_radix(trimmed, 16).ok().map(|v| v as u32)
    }
}

/// Outcome of one transport read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRead {
    /// `len` bytes of an RTP datagram/frame were copied into the buffer.
    Rtp(usize),
    /// `len` bytes of an RTCP datagram/frame were copied into the buffer.
    Rtcp(usize),
    /// No datagram arrived within the configured timeout.
    Timeout,
    /// The transport is closed and drained.
    Eof,
}

/// One track's media byte source: a UDP socket pair, or the interleaved
/// channels of the RTSP control connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<()>;

    /// Reads the next datagram/frame into `buf`.
    async fn read(&self, buf: &mut [u8]) -> Result<TransportRead>;

    /// Sends raw bytes to an arbitrary destination. UDP only; used for NAT
    /// punching.
    async fn write_to(&self, _bytes: &[u8], _host: &str, _port: u16) -> Result<()> {
        Err(Error::UnsupportedProtocol)
    }

    async fn close(&self);

    /// The local RTP port, for UDP transports.
    fn local_port(&self) -> Option<u16>;

    /// The interleaved channel pair, for TCP transports.
    fn interleaved_channels(&self) -> Option<(u8, u8)>;
}

fn is_private_host(host: &str) -> bool {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}

/// Picks the NAT punch destination host: the transport source, else the
/// transport destination, else the track URI host; a private candidate
/// falls back to the URI host.
pub fn punch_host(transport: &TrackTransport, uri: &Url) -> Option<String> {
    let candidate = transport
        .source
        .clone()
        .or_else(|| transport.destination.clone());
    match candidate {
        Some(host) if !is_private_host(&host) => Some(host),
        _ => uri.host_str().map(str::to_owned),
    }
}

/// Sends the punch payload twice to each relevant server port: the RTP
/// port, and the RTCP port when it is distinct and RTCP is not muxed onto
/// the RTP port. Send failures are logged and swallowed.
pub async fn perform_nat_punch(
    udp: &UdpTransport,
    transport: &TrackTransport,
    uri: &Url,
    rtcp_muxed: bool,
) {
    let (rtp_port, rtcp_port) = match transport.server_port {
        Some(ports) => ports,
        None => return,
    };
    let host = match punch_host(transport, uri) {
        Some(host) => host,
        None => return,
    };

    for _ in 0..2 {
        if let Err(e) = udp.write_to(&NAT_PUNCH_PAYLOAD, &host, rtp_port).await {
            log::debug!("nat punch to {}:{} failed: {}", host, rtp_port, e);
        }
    }
    if let Some(rtcp_port) = rtcp_port {
        if rtcp_port != rtp_port && !rtcp_muxed {
            for _ in 0..2 {
                if let Err(e) = udp.write_to_rtcp(&NAT_PUNCH_PAYLOAD, &host, rtcp_port).await {
                    log::debug!("nat punch to {}:{} failed: {}", host, rtcp_port, e);
                }
            }
        }
    }
}
