#[cfg(test)]
mod extractor_test;

pub mod mock;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::format::{mime, Format, TrackType};
use crate::loader::LoadCondition;
use crate::packet_queue::{ByteFifo, PacketQueue};
use crate::sample_queue::SampleQueue;
use crate::transport::TransportProtocol;
use crate::TIME_UNSET;

/// Extractor flag: treat recovery points as keyframes even when they are
/// not IDR pictures.
pub const FLAG_ALLOW_NON_IDR_KEYFRAMES: u32 = 1;

/// Describes the RTP payload of a track, as negotiated in the session
/// description: the dynamic payload type, its clock rate, the sample-level
/// format and the raw fmtp attributes.
#[derive(Debug, Clone)]
pub struct RtpPayloadFormat {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub format: Format,
    pub fmtp: HashMap<String, String>,
}

/// Hands out unique track ids to extractors that discover tracks on the
/// fly.
#[derive(Debug)]
pub struct TrackIdGenerator {
    next: AtomicU32,
}

impl TrackIdGenerator {
    pub fn new(first_id: u32) -> Self {
        TrackIdGenerator {
            next: AtomicU32::new(first_id),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Byte source an extractor reads from, with a rewindable peek cursor for
/// sniffing.
#[async_trait]
pub trait ExtractorInput: Send {
    /// Reads up to `buf.len()` bytes, blocking until data is available.
    /// Returns 0 at the end of the stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Fills `buf` from the peek cursor without consuming, advancing the
    /// cursor. Fails with [`Error::EndOfInput`] when the stream ends before
    /// `buf` is full.
    async fn peek(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Rewinds the peek cursor to the read position.
    fn reset_peek(&mut self);

    /// Bytes consumed so far.
    fn position(&self) -> u64;

    /// Adjusts the position bookkeeping after an extractor-requested seek.
    fn set_position(&mut self, position: u64);
}

/// Sink for the tracks and samples an extractor produces.
#[async_trait]
pub trait ExtractorOutput: Send + Sync {
    /// Returns the sample queue for `(id, track_type)`, creating it on
    /// first use.
    async fn track(&self, id: u32, track_type: TrackType) -> Arc<SampleQueue>;

    /// Signals that no further tracks will be discovered.
    async fn end_tracks(&self);
}

/// What the extractor wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    /// More input, call `read` again.
    Continue,
    /// The stream is exhausted.
    EndOfInput,
    /// Reposition the input to the given byte offset, then call `read`.
    Seek(u64),
}

/// Converts a byte stream into typed elementary samples.
#[async_trait]
pub trait Extractor: Send {
    /// Cheap content probe over peeked bytes; must not consume input.
    async fn sniff(&mut self, input: &mut (dyn ExtractorInput + Send)) -> Result<bool>;

    fn init(&mut self, output: Arc<dyn ExtractorOutput>);

    async fn read(&mut self, input: &mut (dyn ExtractorInput + Send)) -> Result<ReadAction>;

    /// Repositions extraction to `position` bytes / `time_us`.
    fn seek(&mut self, position: u64, time_us: i64);

    fn release(&mut self);
}

/// Supplies the concrete extractors; byte-level extraction lives outside
/// the pipeline.
pub trait ExtractorFactory: Send + Sync {
    /// MPEG-TS over RTP.
    fn create_rtp_mp2t(&self, flags: u32) -> Box<dyn Extractor + Send>;

    /// Generic RTP depacketizer configured by the payload format.
    fn create_rtp(
        &self,
        payload_format: &RtpPayloadFormat,
        track_ids: &TrackIdGenerator,
    ) -> Box<dyn Extractor + Send>;

    /// Plain MPEG-TS byte stream.
    fn create_mp2t(&self, flags: u32) -> Box<dyn Extractor + Send>;

    /// Candidates to sniff a raw byte stream against, in preference order.
    fn create_raw_candidates(&self) -> Vec<Box<dyn Extractor + Send>>;
}

/// Picks the extractor for a track: a pure function of the transport
/// protocol and the sample MIME, falling back to sniffing for raw streams.
pub async fn select_extractor(
    factory: &dyn ExtractorFactory,
    protocol: TransportProtocol,
    payload_format: Option<&RtpPayloadFormat>,
    track_ids: &TrackIdGenerator,
    input: &mut (dyn ExtractorInput + Send),
) -> Result<Box<dyn Extractor + Send>> {
    match protocol {
        TransportProtocol::Rtp => {
            let payload_format = payload_format.ok_or_else(|| {
                Error::UnsupportedFormat("rtp track without payload format".to_owned())
            })?;
            if payload_format.format.sample_mime.as_deref() == Some(mime::VIDEO_MP2T) {
                Ok(factory.create_rtp_mp2t(FLAG_ALLOW_NON_IDR_KEYFRAMES))
            } else {
                Ok(factory.create_rtp(payload_format, track_ids))
            }
        }
        TransportProtocol::Mp2t => Ok(factory.create_mp2t(FLAG_ALLOW_NON_IDR_KEYFRAMES)),
        TransportProtocol::Raw => {
            for mut candidate in factory.create_raw_candidates() {
                let accepted = match candidate.sniff(input).await {
                    Ok(accepted) => accepted,
                    // Stream ended before this candidate could decide.
                    Err(Error::EndOfInput) => false,
                    Err(e) => return Err(e),
                };
                input.reset_peek();
                if accepted {
                    return Ok(candidate);
                }
            }
            Err(Error::UnsupportedFormat(
                "no extractor accepted the stream".to_owned(),
            ))
        }
    }
}

/// The byte source feeding an extractor input.
pub enum StreamSource {
    /// Reordered RTP payloads.
    Packets(Arc<PacketQueue>),
    /// Raw byte chunks (MP2T / sniffed formats).
    Bytes(Arc<ByteFifo>),
}

/// How long one input read waits before surfacing [`Error::ReadTimeout`],
/// giving the driver a chance to observe cancellation and pending seeks on
/// an idle stream.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [`ExtractorInput`] over the stream the transport pump fills.
pub struct MediaStreamInput {
    source: StreamSource,
    /// Bytes fetched from the source but not yet consumed by `read`.
    peeked: Vec<u8>,
    /// Peek cursor into `peeked`.
    peek_offset: usize,
    position: u64,
}

impl MediaStreamInput {
    pub fn new(source: StreamSource) -> Self {
        MediaStreamInput {
            source,
            peeked: Vec::new(),
            peek_offset: 0,
            position: 0,
        }
    }

    async fn fetch(&mut self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        let result = match &self.source {
            StreamSource::Packets(queue) => queue.read(buf, wait).await,
            StreamSource::Bytes(fifo) => fifo.read(buf, wait).await,
        };
        match result {
            Ok(n) => Ok(n),
            Err(Error::QueueClosed) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ExtractorInput for MediaStreamInput {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.peeked.is_empty() {
            let n = self.peeked.len().min(buf.len());
            buf[..n].copy_from_slice(&self.peeked[..n]);
            self.peeked.drain(..n);
            self.peek_offset = self.peek_offset.saturating_sub(n);
            self.position += n as u64;
            return Ok(n);
        }
        let n = self.fetch(buf, Some(INPUT_POLL_INTERVAL)).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn peek(&mut self, buf: &mut [u8]) -> Result<()> {
        let needed = self.peek_offset + buf.len();
        while self.peeked.len() < needed {
            let mut chunk = [0u8; 2048];
            // Sniffing happens while preparing; block until bytes arrive or
            // the pump closes the stream.
            let n = self.fetch(&mut chunk, None).await?;
            if n == 0 {
                return Err(Error::EndOfInput);
            }
            self.peeked.extend_from_slice(&chunk[..n]);
        }
        buf.copy_from_slice(&self.peeked[self.peek_offset..needed]);
        self.peek_offset = needed;
        Ok(())
    }

    fn reset_peek(&mut self) {
        self.peek_offset = 0;
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) {
        self.position = position;
    }
}

/// Drives an extractor against an input until end of input, cancellation
/// or error, gated on the load condition each iteration.
pub struct ExtractorDriver {
    extractor: Box<dyn Extractor + Send>,
    pending_reset_us: Arc<AtomicI64>,
}

impl ExtractorDriver {
    pub fn new(extractor: Box<dyn Extractor + Send>, pending_reset_us: Arc<AtomicI64>) -> Self {
        ExtractorDriver {
            extractor,
            pending_reset_us,
        }
    }

    pub async fn drive(
        &mut self,
        input: &mut (dyn ExtractorInput + Send),
        load_condition: &LoadCondition,
        canceled: &AtomicBool,
    ) -> Result<()> {
        while !canceled.load(Ordering::Acquire) {
            load_condition.block().await;
            if canceled.load(Ordering::Acquire) {
                break;
            }

            let pending_reset_us = self.pending_reset_us.swap(TIME_UNSET, Ordering::SeqCst);
            if pending_reset_us != TIME_UNSET {
                self.extractor.seek(input.position(), pending_reset_us);
            }

            match self.extractor.read(input).await {
                Ok(ReadAction::Continue) => {}
                Ok(ReadAction::EndOfInput) => return Ok(()),
                Ok(ReadAction::Seek(position)) => input.set_position(position),
                // Idle input; loop to observe cancellation and seeks.
                Err(Error::ReadTimeout) => {}
                // The pump closed the stream under us; the loader decides
                // whether that was a cancel or a failure.
                Err(Error::QueueClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn release(&mut self) {
        self.extractor.release();
    }
}
