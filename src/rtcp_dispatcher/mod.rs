#[cfg(test)]
mod rtcp_dispatcher_test;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;
use util::marshal::Marshal;

use crate::error::Result;
use crate::session::MediaSession;
use crate::transport::udp::UdpTransport;

pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// Observer of parsed inbound RTCP.
#[async_trait]
pub trait RtcpListener: Send + Sync {
    /// Called with the packets of one compound datagram/frame, on the
    /// thread that read it, before the next datagram is read.
    async fn on_rtcp(&self, packets: &[RtcpPacket]);
}

/// Fans parsed inbound RTCP out to registered listeners, in registration
/// order.
#[derive(Default)]
pub struct RtcpDispatcher {
    listeners: Mutex<Vec<Arc<dyn RtcpListener>>>,
}

impl RtcpDispatcher {
    pub fn new() -> Self {
        RtcpDispatcher::default()
    }

    pub async fn register(&self, listener: Arc<dyn RtcpListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn clear(&self) {
        self.listeners.lock().await.clear();
    }

    /// Parses one compound RTCP datagram/frame and delivers it.
    pub async fn dispatch(&self, data: &[u8]) -> Result<()> {
        let mut buf = data;
        let packets = rtcp::packet::unmarshal(&mut buf)?;
        let listeners = self.listeners.lock().await.clone();
        for listener in &listeners {
            listener.on_rtcp(&packets).await;
        }
        Ok(())
    }
}

/// Where locally generated RTCP leaves the pipeline.
pub enum RtcpSink {
    /// Out the RTCP half of the UDP socket pair.
    Udp {
        transport: Arc<UdpTransport>,
        host: String,
        port: u16,
    },
    /// Out the RTSP control connection as an interleaved frame.
    Interleaved {
        session: Arc<dyn MediaSession>,
        channel: u8,
    },
}

/// Emitter for locally generated reports (e.g. receiver reports produced by
/// an [`RtcpListener`]).
#[derive(Default)]
pub struct RtcpOutput {
    sink: Mutex<Option<RtcpSink>>,
}

impl RtcpOutput {
    pub fn new() -> Self {
        RtcpOutput::default()
    }

    pub async fn set_sink(&self, sink: Option<RtcpSink>) {
        *self.sink.lock().await = sink;
    }

    /// Marshals `packets` into one compound frame and emits it via the
    /// configured sink. A missing sink drops the report silently.
    pub async fn send(&self, packets: &[RtcpPacket]) -> Result<()> {
        let mut compound = BytesMut::new();
        for packet in packets {
            compound.extend_from_slice(&packet.marshal()?);
        }

        let sink = self.sink.lock().await;
        match &*sink {
            Some(RtcpSink::Udp {
                transport,
                host,
                port,
            }) => {
                transport.write_to_rtcp(&compound, host, *port).await?;
            }
            Some(RtcpSink::Interleaved { session, channel }) => {
                session
                    .on_outgoing_interleaved_frame(*channel, compound.freeze())
                    .await;
            }
            None => {
                log::debug!("dropping outbound rtcp, no sink configured");
            }
        }
        Ok(())
    }
}
