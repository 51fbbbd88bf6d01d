use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rtp::packet::Packet;
use util::marshal::Unmarshal;

use crate::error::{Error, Result};
use crate::extractor::{
    select_extractor, ExtractorDriver, ExtractorFactory, ExtractorOutput, MediaStreamInput,
    StreamSource, TrackIdGenerator,
};
use crate::loader::{LoadCondition, Loadable};
use crate::packet_queue::{ByteFifo, PacketQueue};
use crate::pipeline::{MediaTrack, PipelineInner, TrackOutputRegistry};
use crate::rtcp_dispatcher::RtcpDispatcher;
use crate::session::MediaSession;
use crate::transport::interleaved::InterleavedTransport;
use crate::transport::udp::UdpTransport;
use crate::transport::{Transport, TransportProtocol, TransportRead};

enum TransportHandle {
    Udp(Arc<UdpTransport>),
    Interleaved(Arc<InterleavedTransport>),
}

/// One load: opens the transport, selects the extractor, then concurrently
/// pumps the transport (RTP into the packet queue, RTCP into the
/// dispatcher) and drives extraction into the sample queues. The loadable
/// is the only feeder of sample queues.
pub struct TrackLoadable {
    track: MediaTrack,
    session: Arc<dyn MediaSession>,
    extractor_factory: Arc<dyn ExtractorFactory>,
    output: Arc<TrackOutputRegistry>,
    transport: TransportHandle,
    packet_queue: Arc<PacketQueue>,
    byte_fifo: Arc<ByteFifo>,
    rtcp_in: Arc<RtcpDispatcher>,
    load_condition: Arc<LoadCondition>,
    pending_reset_us: Arc<AtomicI64>,
    track_ids: Arc<TrackIdGenerator>,
    local_port: Arc<AtomicU16>,
    receive_mtu: usize,
    canceled: AtomicBool,
    /// Set when the extractor side is done, so the pump stops reading.
    stopped: AtomicBool,
}

impl TrackLoadable {
    pub(crate) fn udp(inner: &Arc<PipelineInner>, transport: Arc<UdpTransport>) -> Self {
        TrackLoadable::new(inner, TransportHandle::Udp(transport))
    }

    pub(crate) fn interleaved(
        inner: &Arc<PipelineInner>,
        transport: Arc<InterleavedTransport>,
    ) -> Self {
        TrackLoadable::new(inner, TransportHandle::Interleaved(transport))
    }

    fn new(inner: &Arc<PipelineInner>, transport: TransportHandle) -> Self {
        TrackLoadable {
            track: inner.track.clone(),
            session: inner.session.clone(),
            extractor_factory: inner.extractor_factory.clone(),
            output: inner.registry.clone(),
            transport,
            packet_queue: Arc::new(PacketQueue::with_capacity(
                inner.track.payload_format.clock_rate,
                inner.config.packet_queue_capacity,
            )),
            byte_fifo: Arc::new(ByteFifo::new()),
            rtcp_in: inner.rtcp_in.clone(),
            load_condition: inner.load_condition.clone(),
            pending_reset_us: inner.pending_reset_us.clone(),
            track_ids: inner.track_ids.clone(),
            local_port: inner.local_port.clone(),
            receive_mtu: inner.config.receive_mtu,
            canceled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    fn dyn_transport(&self) -> Arc<dyn Transport> {
        match &self.transport {
            TransportHandle::Udp(t) => t.clone(),
            TransportHandle::Interleaved(t) => t.clone(),
        }
    }

    /// Closes everything the load loop may be blocked on. Releasing while
    /// the loadable is open is legal.
    pub(crate) async fn release(&self) {
        self.canceled.store(true, Ordering::Release);
        self.load_condition.open();
        self.packet_queue.close().await;
        self.byte_fifo.close().await;
        self.dyn_transport().close().await;
    }

    async fn pump(&self, transport: Arc<dyn Transport>) -> Result<()> {
        let result = self.pump_loop(&*transport).await;
        // Unblock the extractor side regardless of how the pump ended.
        self.packet_queue.close().await;
        self.byte_fifo.close().await;
        result
    }

    async fn pump_loop(&self, transport: &dyn Transport) -> Result<()> {
        let mut buf = vec![0u8; self.receive_mtu];
        loop {
            if self.canceled.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
                return Ok(());
            }
            match transport.read(&mut buf).await? {
                TransportRead::Rtp(n) => match self.track.transport.protocol {
                    TransportProtocol::Rtp => {
                        let mut data: &[u8] = &buf[..n];
                        match Packet::unmarshal(&mut data) {
                            Ok(packet) => {
                                self.packet_queue.queue(packet).await;
                            }
                            Err(e) => log::debug!("dropping malformed rtp packet: {}", e),
                        }
                    }
                    _ => self.byte_fifo.push(Bytes::copy_from_slice(&buf[..n])).await,
                },
                TransportRead::Rtcp(n) => {
                    if let Err(e) = self.rtcp_in.dispatch(&buf[..n]).await {
                        log::debug!("dropping malformed rtcp: {}", e);
                    }
                }
                TransportRead::Timeout => {
                    // Timeouts while the session is paused carry no signal.
                    if self.session.is_paused() {
                        continue;
                    }
                    return Err(Error::ReadTimeout);
                }
                TransportRead::Eof => return Ok(()),
            }
        }
    }

    async fn drive_extractor(&self) -> Result<()> {
        let result = self.drive_inner().await;
        self.stopped.store(true, Ordering::Release);
        result
    }

    async fn drive_inner(&self) -> Result<()> {
        let source = match self.track.transport.protocol {
            TransportProtocol::Rtp => StreamSource::Packets(self.packet_queue.clone()),
            _ => StreamSource::Bytes(self.byte_fifo.clone()),
        };
        let mut input = MediaStreamInput::new(source);
        let mut extractor = select_extractor(
            &*self.extractor_factory,
            self.track.transport.protocol,
            Some(&self.track.payload_format),
            &self.track_ids,
            &mut input,
        )
        .await?;
        extractor.init(self.output.clone() as Arc<dyn ExtractorOutput>);

        let mut driver = ExtractorDriver::new(extractor, self.pending_reset_us.clone());
        let result = driver
            .drive(&mut input, &self.load_condition, &self.canceled)
            .await;
        driver.release();
        result
    }
}

#[async_trait]
impl Loadable for TrackLoadable {
    async fn load(&self) -> Result<()> {
        // An interleaved channel can only carry RTP; anything else has no
        // usable byte source and must fail before opening.
        if matches!(self.transport, TransportHandle::Interleaved(_))
            && self.track.transport.protocol != TransportProtocol::Rtp
        {
            return Err(Error::UnsupportedProtocol);
        }

        let transport = self.dyn_transport();
        transport.open().await?;
        if let TransportHandle::Udp(udp) = &self.transport {
            if let Some(port) = Transport::local_port(&**udp) {
                self.local_port.store(port, Ordering::SeqCst);
            }
        }
        if self.canceled.load(Ordering::Acquire) {
            transport.close().await;
            return Err(Error::LoadCanceled);
        }
        log::debug!(
            "load open: protocol {:?}, local port {:?}",
            self.track.transport.protocol,
            Transport::local_port(&*transport)
        );

        let (pump_result, drive_result) =
            tokio::join!(self.pump(transport.clone()), self.drive_extractor());
        transport.close().await;

        match (pump_result, drive_result) {
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn cancel_load(&self) {
        self.canceled.store(true, Ordering::Release);
        // Unblock a driver waiting on the gate; it observes the flag next.
        self.load_condition.open();
    }

    fn is_load_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}
