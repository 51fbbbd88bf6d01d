
use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use rtp::packet::Packet;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::error::{Error, Result};

/// RFC 3550 maximum misorder/dropout bound: a jump beyond this many
/// sequence numbers is a discontinuity, not reordering.
const DISCONTINUITY_THRESHOLD: i32 = 3000;

const DEFAULT_CAPACITY: usize = 128;

/// Signed shortest distance from `from` to `to` in sequence-number space.
fn seq_distance(from: u16, to: u16) -> i32 {
    let d = to.wrapping_sub(from);
    if d < 0x8000 {
        d as i32
    } else {
        d as i32 - 0x1_0000
    }
}

#[derive(Default)]
struct QueueInner {
    /// Buffered packets, ascending by (wrapped) sequence number.
    packets: VecDeque<Packet>,
    /// Next sequence number the reader is owed, once known.
    expected_seq: Option<u16>,
    closed: bool,
    dropped: u64,
}

/// Reorder/jitter buffer between the transport and the extractor.
///
/// Packets are inserted in sequence order; the read side only yields a
/// packet when it is contiguous with what was already read. A gap is
/// surrendered (skipped over) only when the buffer is full or closed, so
/// bounded memory wins over completeness. When full, the oldest packet is
/// discarded, preserving recent media.
pub struct PacketQueue {
    clock_rate: u32,
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl PacketQueue {
    pub fn new(clock_rate: u32) -> Self {
        PacketQueue::with_capacity(clock_rate, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(clock_rate: u32, capacity: usize) -> Self {
        PacketQueue {
            clock_rate,
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Clock rate of the payload this queue reorders, in Hz.
    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Inserts a parsed RTP packet. Returns false when the packet was
    /// dropped (late duplicate, or the queue is closed).
    pub async fn queue(&self, packet: Packet) -> bool {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        if inner.closed {
            return false;
        }
        let seq = packet.header.sequence_number;

        if let Some(expected) = inner.expected_seq {
            let dist = seq_distance(expected, seq);
            if dist.abs() > DISCONTINUITY_THRESHOLD {
                // Discontinuity: restart ordering from this packet.
                log::debug!(
                    "sequence discontinuity ({} -> {}), resetting reorder state",
                    expected,
                    seq
                );
                inner.dropped += inner.packets.len() as u64;
                inner.packets.clear();
                inner.expected_seq = Some(seq);
            } else if dist < 0 {
                // Late packet, already surrendered.
                inner.dropped += 1;
                return false;
            }
        }

        // Insert in sequence order, dropping duplicates.
        let mut insert_at = inner.packets.len();
        for (i, queued) in inner.packets.iter().enumerate() {
            let d = seq_distance(queued.header.sequence_number, seq);
            if d == 0 {
                inner.dropped += 1;
                return false;
            }
            if d < 0 {
                insert_at = i;
                break;
            }
        }
        inner.packets.insert(insert_at, packet);

        if inner.packets.len() > self.capacity {
            if let Some(oldest) = inner.packets.pop_front() {
                log::trace!(
                    "packet queue full, dropping oldest seq {}",
                    oldest.header.sequence_number
                );
                inner.dropped += 1;
            }
            // The reader continues from what remains buffered.
            inner.expected_seq = inner
                .packets
                .front()
                .map(|p| p.header.sequence_number);
        }

        self.notify.notify_one();
        true
    }

    fn poll_locked(&self, inner: &mut QueueInner) -> Option<Packet> {
        let front_seq = inner.packets.front()?.header.sequence_number;
        let ready = match inner.expected_seq {
            None => true,
            Some(expected) => {
                front_seq == expected || inner.packets.len() >= self.capacity || inner.closed
            }
        };
        if !ready {
            return None;
        }
        let packet = inner.packets.pop_front()?;
        inner.expected_seq = Some(packet.header.sequence_number.wrapping_add(1));
        Some(packet)
    }

    /// Non-blocking variant of [`read_packet`](PacketQueue::read_packet).
    pub async fn poll(&self) -> Option<Packet> {
        let mut inner = self.inner.lock().await;
        self.poll_locked(&mut inner)
    }

    /// Reads the next in-order packet, waiting until one is contiguous with
    /// the read position, the queue fills or closes, or `wait` elapses.
    ///
    /// Returns [`Error::QueueClosed`] once the queue is closed and drained,
    /// [`Error::ReadTimeout`] when `wait` elapses first.
    pub async fn read_packet(&self, wait: Option<Duration>) -> Result<Packet> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(packet) = self.poll_locked(&mut inner) {
                    return Ok(packet);
                }
                if inner.closed {
                    return Err(Error::QueueClosed);
                }
            }
            let notified = self.notify.notified();
            match wait {
                Some(wait) => {
                    if timeout(wait, notified).await.is_err() {
                        return Err(Error::ReadTimeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Reads the next in-order packet's payload bytes into `buf`, blocking
    /// like [`read_packet`](PacketQueue::read_packet).
    pub async fn read(&self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        let packet = self.read_packet(wait).await?;
        let n = packet.payload.len().min(buf.len());
        buf[..n].copy_from_slice(&packet.payload[..n]);
        Ok(n)
    }

    /// Drops all buffered packets and forgets the read position.
    pub async fn flush(&self) {
        let mut inner = self.inner.lock().await;
        let flushed = inner.packets.len() as u64;
        inner.dropped += flushed;
        inner.packets.clear();
        inner.expected_seq = None;
    }

    /// Unblocks pending readers; buffered packets remain readable, after
    /// which reads report end of stream.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.notify.notify_one();
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.packets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.packets.is_empty()
    }

    /// Packets dropped so far (late duplicates, overflow, discontinuities).
    pub async fn dropped(&self) -> u64 {
        self.inner.lock().await.dropped
    }
}

#[derive(Default)]
struct FifoInner {
    chunks: VecDeque<Bytes>,
    /// Bytes of the front chunk already consumed.
    front_offset: usize,
    closed: bool,
}

/// Unframed byte FIFO between the transport pump and the extractor, used
/// when the track carries a raw byte stream (MP2T or sniffed formats)
/// rather than RTP. Reads may span chunk boundaries; `close()` unblocks
/// pending readers.
#[derive(Default)]
pub struct ByteFifo {
    inner: Mutex<FifoInner>,
    notify: Notify,
}

impl ByteFifo {
    pub fn new() -> Self {
        ByteFifo::default()
    }

    pub async fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return;
        }
        inner.chunks.push_back(chunk);
        self.notify.notify_one();
    }

    /// Reads up to `buf.len()` bytes, blocking until at least one byte is
    /// available, the fifo is closed ([`Error::QueueClosed`]) or `wait`
    /// elapses ([`Error::ReadTimeout`]).
    pub async fn read(&self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let inner = &mut *inner;
                if !inner.chunks.is_empty() {
                    let mut copied = 0;
                    while copied < buf.len() {
                        let front = match inner.chunks.front() {
                            Some(front) => front,
                            None => break,
                        };
                        let available = front.len() - inner.front_offset;
                        let n = available.min(buf.len() - copied);
                        buf[copied..copied + n]
                            .copy_from_slice(&front[inner.front_offset..inner.front_offset + n]);
                        copied += n;
                        inner.front_offset += n;
                        if inner.front_offset == front.len() {
                            inner.chunks.pop_front();
                            inner.front_offset = 0;
                        }
                    }
                    return Ok(copied);
                }
                if inner.closed {
                    return Err(Error::QueueClosed);
                }
            }
            let notified = self.notify.notified();
            match wait {
                Some(wait) => {
                    if timeout(wait, notified).await.is_err() {
                        return Err(Error::ReadTimeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        self.notify.notify_one();
    }
}
