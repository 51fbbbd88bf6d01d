use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::error::{Error, Result};
use crate::session::TransferListener;
use crate::transport::{Transport, TransportRead};

/// Local ports are drawn from [50000, 60000), even numbers only: the RTP
/// socket takes the even port, the RTCP socket the odd one above it.
const PORT_RANGE_START: u16 = 50_000;
const PORT_RANGE_END: u16 = 60_000;

/// Bind attempts before giving up with [`Error::PortBind`].
pub const DEFAULT_BIND_ATTEMPTS: usize = 20;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

/// RFC 5761 demultiplexing: RTCP packet types occupy [192, 223] in the
/// second octet, colliding RTP payload types are forbidden there.
fn is_rtcp_datagram(datagram: &[u8]) -> bool {
    datagram.len() >= 2 && (192..=223).contains(&datagram[1])
}

fn rtp_ssrc(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < 12 {
        return None;
    }
    Some(u32::from_be_bytes([
        datagram[8],
        datagram[9],
        datagram[10],
        datagram[11],
    ]))
}

#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    pub read_timeout: Duration,
    /// Drop RTP datagrams whose SSRC differs from this one.
    pub ssrc_filter: Option<u32>,
    /// When false, inbound RTCP is dropped at the socket.
    pub rtcp_enabled: bool,
    /// When true, RTP and RTCP share the single even port.
    pub rtcp_muxed: bool,
    pub bind_attempts: usize,
}

impl Default for UdpTransportConfig {
    fn default() -> Self {
        UdpTransportConfig {
            read_timeout: DEFAULT_READ_TIMEOUT,
            ssrc_filter: None,
            rtcp_enabled: true,
            rtcp_muxed: false,
            bind_attempts: DEFAULT_BIND_ATTEMPTS,
        }
    }
}

struct SocketPair {
    rtp: UdpSocket,
    /// Absent when RTCP is muxed onto the RTP socket.
    rtcp: Option<UdpSocket>,
}

/// UDP variant of the track transport: an adjacent socket pair on an even
/// local port drawn at random from the configured range.
pub struct UdpTransport {
    config: UdpTransportConfig,
    pair: ArcSwapOption<SocketPair>,
    local_port: AtomicU16,
    transfer_listener: Option<Arc<dyn TransferListener>>,
}

impl UdpTransport {
    pub fn new(
        config: UdpTransportConfig,
        transfer_listener: Option<Arc<dyn TransferListener>>,
    ) -> Self {
        UdpTransport {
            config,
            pair: ArcSwapOption::empty(),
            local_port: AtomicU16::new(0),
            transfer_listener,
        }
    }

    async fn bind_pair(&self) -> Result<SocketPair> {
        for _ in 0..self.config.bind_attempts {
            let port = {
                let mut rng = rand::thread_rng();
                rng.gen_range(PORT_RANGE_START / 2..PORT_RANGE_END / 2) * 2
            };
            let rtp = match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => socket,
                Err(_) => continue,
            };
            if self.config.rtcp_muxed {
                self.local_port.store(port, Ordering::SeqCst);
                return Ok(SocketPair { rtp, rtcp: None });
            }
            match UdpSocket::bind(("0.0.0.0", port + 1)).await {
                Ok(rtcp) => {
                    self.local_port.store(port, Ordering::SeqCst);
                    return Ok(SocketPair {
                        rtp,
                        rtcp: Some(rtcp),
                    });
                }
                Err(_) => continue,
            }
        }
        Err(Error::PortBind)
    }

    /// Sends raw bytes from the RTP socket.
    pub async fn write_to(&self, bytes: &[u8], host: &str, port: u16) -> Result<()> {
        let pair = self.pair.load_full().ok_or(Error::QueueClosed)?;
        pair.rtp.send_to(bytes, (host, port)).await?;
        Ok(())
    }

    /// Sends raw bytes from the RTCP socket (the RTP socket when muxed).
    pub async fn write_to_rtcp(&self, bytes: &[u8], host: &str, port: u16) -> Result<()> {
        let pair = self.pair.load_full().ok_or(Error::QueueClosed)?;
        let socket = pair.rtcp.as_ref().unwrap_or(&pair.rtp);
        socket.send_to(bytes, (host, port)).await?;
        Ok(())
    }

    fn meter(&self, bytes: usize) {
        if let Some(listener) = &self.transfer_listener {
            listener.on_bytes_transferred(bytes);
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn open(&self) -> Result<()> {
        let pair = self.bind_pair().await?;
        log::debug!(
            "udp transport open on local port {} (muxed: {})",
            self.local_port.load(Ordering::SeqCst),
            self.config.rtcp_muxed
        );
        self.pair.store(Some(Arc::new(pair)));
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<TransportRead> {
        let pair = match self.pair.load_full() {
            Some(pair) => pair,
            None => return Ok(TransportRead::Eof),
        };
        let deadline = Instant::now() + self.config.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(TransportRead::Timeout);
            }

            // Wait for either socket to become readable, then drain one
            // datagram without blocking.
            let received = if let Some(rtcp) = &pair.rtcp {
                let readable = async {
                    tokio::select! {
                        r = pair.rtp.readable() => r.map(|_| false),
                        r = rtcp.readable() => r.map(|_| true),
                    }
                };
                match timeout(remaining, readable).await {
                    Err(_) => return Ok(TransportRead::Timeout),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(true)) => rtcp.try_recv_from(buf).map(|(n, _)| (n, true)),
                    Ok(Ok(false)) => pair.rtp.try_recv_from(buf).map(|(n, _)| (n, false)),
                }
            } else {
                match timeout(remaining, pair.rtp.readable()).await {
                    Err(_) => return Ok(TransportRead::Timeout),
                    Ok(Err(e)) => return Err(e.into()),
                    Ok(Ok(())) => pair
                        .rtp
                        .try_recv_from(buf)
                        .map(|(n, _)| (n, is_rtcp_datagram(&buf[..n]))),
                }
            };

            let (n, is_rtcp) = match received {
                Ok(read) => read,
                // Lost the race against another reader; wait again.
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            };
            self.meter(n);

            if is_rtcp {
                if !self.config.rtcp_enabled {
                    continue;
                }
                return Ok(TransportRead::Rtcp(n));
            }
            if let (Some(filter), Some(ssrc)) = (self.config.ssrc_filter, rtp_ssrc(&buf[..n])) {
                if ssrc != filter {
                    continue;
                }
            }
            return Ok(TransportRead::Rtp(n));
        }
    }

    async fn write_to(&self, bytes: &[u8], host: &str, port: u16) -> Result<()> {
        UdpTransport::write_to(self, bytes, host, port).await
    }

    async fn close(&self) {
        self.pair.store(None);
    }

    fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    fn interleaved_channels(&self) -> Option<(u8, u8)> {
        None
    }
}
