use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::format::{CryptoType, Format, TrackType};

/// View of the established RTSP session the pipeline runs inside.
///
/// The signalling layer implements this; the pipeline only queries session
/// facts and pushes the two callbacks, it never sequences RTSP requests.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Whether media travels interleaved on the RTSP control connection.
    fn is_interleaved(&self) -> bool;

    /// Whether an outbound NAT punch is required before media can arrive.
    fn is_nat_required(&self) -> bool;

    fn is_rtcp_supported(&self) -> bool;

    /// Whether RTP and RTCP are multiplexed on a single port.
    fn is_rtcp_muxed(&self) -> bool;

    fn is_paused(&self) -> bool;

    /// Known media duration in microseconds, when the session declares one.
    fn duration_us(&self) -> Option<i64>;

    /// Informs the session which track types the consumer has enabled.
    async fn on_select_tracks(&self, track_types: &[TrackType], enabled: bool);

    /// Hands a locally generated frame (RTCP) to the signalling connection
    /// for interleaved transmission on `channel`.
    async fn on_outgoing_interleaved_frame(&self, channel: u8, frame: Bytes);
}

/// Provides backing storage for sample payloads and accounts for it.
///
/// Implementations must be thread safe; one allocator is shared by every
/// sample queue of a pipeline.
pub trait Allocator: Send + Sync {
    fn allocate(&self, len: usize) -> BytesMut;

    /// Returns `len` bytes to the allocator's accounting.
    fn release(&self, len: usize);

    fn total_bytes_allocated(&self) -> usize;
}

/// Heap allocator with byte accounting.
#[derive(Debug, Default)]
pub struct DefaultAllocator {
    allocated: AtomicUsize,
}

impl DefaultAllocator {
    pub fn new() -> Self {
        DefaultAllocator::default()
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, len: usize) -> BytesMut {
        self.allocated.fetch_add(len, Ordering::Relaxed);
        BytesMut::with_capacity(len)
    }

    fn release(&self, len: usize) {
        self.allocated.fetch_sub(len, Ordering::Relaxed);
    }

    fn total_bytes_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// Maps formats to the crypto type their samples are protected with.
///
/// Key exchange happens elsewhere; sample queues only consult this to tag
/// the formats they deliver to readers.
pub trait DrmSessionManager: Send + Sync {
    fn crypto_type(&self, format: &Format) -> Option<CryptoType>;
}

/// Manager for streams without DRM.
#[derive(Debug, Default)]
pub struct NoopDrmSessionManager;

impl DrmSessionManager for NoopDrmSessionManager {
    fn crypto_type(&self, _format: &Format) -> Option<CryptoType> {
        None
    }
}

/// Bandwidth metering sink attached to every transport the pipeline opens.
pub trait TransferListener: Send + Sync {
    fn on_bytes_transferred(&self, bytes: usize);
}
