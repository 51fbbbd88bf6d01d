use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Instant};

use crate::error::Result;
use crate::session::TransferListener;
use crate::transport::{Transport, TransportRead};

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Default)]
struct Frames {
    rtp: VecDeque<Bytes>,
    rtcp: VecDeque<Bytes>,
    closed: bool,
}

/// TCP-interleaved variant of the track transport.
///
/// Owns no socket: the RTSP signalling connection demultiplexes interleaved
/// frames and feeds them in through [`on_interleaved_frame`]. The first
/// channel of the pair carries RTP, the second RTCP.
///
/// [`on_interleaved_frame`]: InterleavedTransport::on_interleaved_frame
pub struct InterleavedTransport {
    channels: (u8, u8),
    read_timeout: Duration,
    frames: Mutex<Frames>,
    notify: Notify,
    transfer_listener: Option<Arc<dyn TransferListener>>,
}

impl InterleavedTransport {
    pub fn new(channels: (u8, u8), transfer_listener: Option<Arc<dyn TransferListener>>) -> Self {
        InterleavedTransport {
            channels,
            read_timeout: DEFAULT_READ_TIMEOUT,
            frames: Mutex::new(Frames::default()),
            notify: Notify::new(),
            transfer_listener,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Accepts one demultiplexed frame from the signalling connection.
    /// Frames for unrecognized channels are dropped.
    pub async fn on_interleaved_frame(&self, channel: u8, frame: Bytes) {
        let mut frames = self.frames.lock().await;
        if frames.closed {
            return;
        }
        if channel == self.channels.0 {
            frames.rtp.push_back(frame);
        } else if channel == self.channels.1 {
            frames.rtcp.push_back(frame);
        } else {
            log::debug!("dropping interleaved frame for unknown channel {}", channel);
            return;
        }
        self.notify.notify_one();
    }
}

#[async_trait]
impl Transport for InterleavedTransport {
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<TransportRead> {
        let deadline = Instant::now() + self.read_timeout;
        loop {
            {
                let mut frames = self.frames.lock().await;
                let (frame, is_rtcp) = if let Some(frame) = frames.rtp.pop_front() {
                    (Some(frame), false)
                } else if let Some(frame) = frames.rtcp.pop_front() {
                    (Some(frame), true)
                } else if frames.closed {
                    return Ok(TransportRead::Eof);
                } else {
                    (None, false)
                };
                if let Some(frame) = frame {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    if let Some(listener) = &self.transfer_listener {
                        listener.on_bytes_transferred(n);
                    }
                    return Ok(if is_rtcp {
                        TransportRead::Rtcp(n)
                    } else {
                        TransportRead::Rtp(n)
                    });
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(TransportRead::Timeout);
            }
            if timeout(remaining, self.notify.notified()).await.is_err() {
                return Ok(TransportRead::Timeout);
            }
        }
    }

    async fn close(&self) {
        let mut frames = self.frames.lock().await;
        frames.closed = true;
        self.notify.notify_one();
    }

    fn local_port(&self) -> Option<u16> {
        None
    }

    fn interleaved_channels(&self) -> Option<(u8, u8)> {
        Some(self.channels)
    }
}
