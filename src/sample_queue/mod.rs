
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::format::{Format, TrackType};
use crate::session::{Allocator, DrmSessionManager};
use crate::TIME_UNSET;

/// The sample starts a decodable unit.
pub const SAMPLE_FLAG_KEY_FRAME: u32 = 1;
/// The sample is known to be the last of the stream.
pub const SAMPLE_FLAG_LAST_SAMPLE: u32 = 1 << 1;
/// Synthetic flag set on the holder when the end of stream is reached.
pub const SAMPLE_FLAG_END_OF_STREAM: u32 = 1 << 2;

/// Receives the format applying to subsequently read samples.
#[derive(Debug, Default)]
pub struct FormatHolder {
    pub format: Option<Arc<Format>>,
}

/// Receives one sample's payload and timing on read.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    pub data: Bytes,
    pub timestamp_us: i64,
    pub flags: u32,
}

impl SampleBuffer {
    pub fn clear(&mut self) {
        self.data = Bytes::new();
        self.timestamp_us = 0;
        self.flags = 0;
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags & SAMPLE_FLAG_KEY_FRAME != 0
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.flags & SAMPLE_FLAG_END_OF_STREAM != 0
    }
}

/// Outcome of [`SampleQueue::read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDataResult {
    NothingRead,
    FormatRead,
    BufferRead,
    EndOfStream,
}

/// Notified when the upstream (writer-side) format of a queue changes.
pub type OnUpstreamFormatChangedFn = Box<dyn Fn(&Format) + Send + Sync>;

struct Entry {
    timestamp_us: i64,
    flags: u32,
    data: Bytes,
    format: Arc<Format>,
}

struct QueueState {
    entries: VecDeque<Entry>,
    /// Index into `entries` of the next unread sample.
    read_index: usize,
    upstream_format: Option<Arc<Format>>,
    /// Format most recently delivered through a [`FormatHolder`].
    downstream_format: Option<Arc<Format>>,
    largest_queued_timestamp_us: i64,
    released: bool,
}

/// Ring of elementary media samples for one produced track.
///
/// Written by the single loader task, read by consumers on any thread; all
/// state sits behind one per-queue lock, so a reader never observes a
/// partially appended sample. A format change is injected as a marker in
/// sequence: readers get `FormatRead` before the first sample the new
/// format applies to.
pub struct SampleQueue {
    id: u32,
    track_type: TrackType,
    allocator: Arc<dyn Allocator>,
    drm: Arc<dyn DrmSessionManager>,
    state: Mutex<QueueState>,
    format_listener: std::sync::Mutex<Option<OnUpstreamFormatChangedFn>>,
}

impl SampleQueue {
    pub fn new(
        id: u32,
        track_type: TrackType,
        allocator: Arc<dyn Allocator>,
        drm: Arc<dyn DrmSessionManager>,
    ) -> Self {
        SampleQueue {
            id,
            track_type,
            allocator,
            drm,
            state: Mutex::new(QueueState {
                entries: VecDeque::new(),
                read_index: 0,
                upstream_format: None,
                downstream_format: None,
                largest_queued_timestamp_us: TIME_UNSET,
                released: false,
            }),
            format_listener: std::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn track_type(&self) -> TrackType {
        self.track_type
    }

    pub fn set_upstream_format_change_listener(&self, listener: Option<OnUpstreamFormatChangedFn>) {
        *self.format_listener.lock().unwrap() = listener;
    }

    /// Announces the format of subsequently appended samples. No-op when the
    /// format equals the most recently announced one.
    pub async fn set_format(&self, format: Format) {
        let mut format = format;
        if format.crypto_type.is_none() {
            format.crypto_type = self.drm.crypto_type(&format);
        }

        let changed = {
            let mut state = self.state.lock().await;
            if state.released {
                return;
            }
            let unchanged =
                matches!(&state.upstream_format, Some(current) if **current == format);
            if unchanged {
                None
            } else {
                let format = Arc::new(format);
                state.upstream_format = Some(format.clone());
                Some(format)
            }
        };

        if let Some(format) = changed {
            let listener = self.format_listener.lock().unwrap();
            if let Some(listener) = &*listener {
                listener(&format);
            }
        }
    }

    /// Appends one sample carrying the current upstream format. Samples
    /// arrive in append order, not timestamp order.
    pub async fn append(&self, timestamp_us: i64, flags: u32, payload: &[u8]) {
        let mut state = self.state.lock().await;
        if state.released {
            return;
        }
        let format = match &state.upstream_format {
            Some(format) => format.clone(),
            None => {
                log::warn!("sample queue {}: sample before any format, dropped", self.id);
                return;
            }
        };
        let mut storage = self.allocator.allocate(payload.len());
        storage.extend_from_slice(payload);
        state.entries.push_back(Entry {
            timestamp_us,
            flags,
            data: storage.freeze(),
            format,
        });
        if state.largest_queued_timestamp_us == TIME_UNSET
            || timestamp_us > state.largest_queued_timestamp_us
        {
            state.largest_queued_timestamp_us = timestamp_us;
        }
    }

    pub async fn upstream_format(&self) -> Option<Arc<Format>> {
        self.state.lock().await.upstream_format.clone()
    }

    /// Largest timestamp appended in the current epoch, [`TIME_UNSET`] when
    /// none.
    pub async fn largest_queued_timestamp_us(&self) -> i64 {
        self.state.lock().await.largest_queued_timestamp_us
    }

    /// True when a call to [`read`](SampleQueue::read) would not return
    /// `NothingRead`.
    pub async fn is_ready(&self, loading_finished: bool) -> bool {
        let state = self.state.lock().await;
        if state.released || loading_finished {
            return true;
        }
        state.read_index < state.entries.len()
    }

    /// Reads the next event at the cursor: a pending format, a sample, end
    /// of stream (when `loading_finished`), or nothing.
    pub async fn read(
        &self,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
        loading_finished: bool,
    ) -> ReadDataResult {
        let mut state = self.state.lock().await;
        if state.released {
            buffer.clear();
            buffer.flags |= SAMPLE_FLAG_END_OF_STREAM;
            return ReadDataResult::EndOfStream;
        }

        // The format applying at the cursor: the format of the next sample,
        // or the upstream format once the queue is drained.
        let cursor_format = if state.read_index < state.entries.len() {
            Some(state.entries[state.read_index].format.clone())
        } else {
            state.upstream_format.clone()
        };

        if let Some(format) = cursor_format {
            let pending = match &state.downstream_format {
                Some(delivered) => !Arc::ptr_eq(&format, delivered),
                None => true,
            };
            if pending || require_format {
                state.downstream_format = Some(format.clone());
                format_holder.format = Some(format);
                return ReadDataResult::FormatRead;
            }
        }

        if state.read_index < state.entries.len() {
            let entry = &state.entries[state.read_index];
            buffer.data = entry.data.clone();
            buffer.timestamp_us = entry.timestamp_us;
            buffer.flags = entry.flags;
            state.read_index += 1;
            return ReadDataResult::BufferRead;
        }

        if loading_finished {
            buffer.clear();
            buffer.flags |= SAMPLE_FLAG_END_OF_STREAM;
            return ReadDataResult::EndOfStream;
        }
        ReadDataResult::NothingRead
    }

    /// Skips unread samples with timestamp strictly below `position_us`,
    /// returning how many were skipped.
    pub async fn advance_to(&self, position_us: i64) -> usize {
        let mut state = self.state.lock().await;
        let mut skipped = 0;
        while state.read_index < state.entries.len()
            && state.entries[state.read_index].timestamp_us < position_us
        {
            state.read_index += 1;
            skipped += 1;
        }
        skipped
    }

    /// Skips every readable sample.
    pub async fn advance_to_end(&self) -> usize {
        let mut state = self.state.lock().await;
        let skipped = state.entries.len() - state.read_index;
        state.read_index = state.entries.len();
        skipped
    }

    /// Repositions the read cursor at the latest in-buffer keyframe with
    /// timestamp at or below `position_us`. Fails when no such keyframe is
    /// buffered, or when `position_us` lies beyond the buffer and
    /// `allow_beyond_buffer` is false.
    pub async fn seek_to(&self, position_us: i64, allow_beyond_buffer: bool) -> bool {
        let mut state = self.state.lock().await;
        if state.entries.is_empty() {
            return false;
        }
        if !allow_beyond_buffer && position_us > state.largest_queued_timestamp_us {
            return false;
        }
        let target = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.timestamp_us <= position_us && e.flags & SAMPLE_FLAG_KEY_FRAME != 0
            })
            .map(|(i, _)| i)
            .last();
        match target {
            Some(index) => {
                state.read_index = index;
                true
            }
            None => false,
        }
    }

    /// Discards samples from the front of the buffer up to `position_us`.
    ///
    /// With `to_keyframe`, only samples preceding the latest keyframe at or
    /// below `position_us` are discarded, so a seek back to the keyframe
    /// stays possible. With `stop_at_read_position`, already-read samples
    /// only.
    pub async fn discard_to(
        &self,
        position_us: i64,
        to_keyframe: bool,
        stop_at_read_position: bool,
    ) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let limit = if stop_at_read_position {
            state.read_index
        } else {
            state.entries.len()
        };

        let discard_count = if to_keyframe {
            // Everything before the latest keyframe <= position.
            state
                .entries
                .iter()
                .take(limit)
                .enumerate()
                .filter(|(_, e)| {
                    e.timestamp_us <= position_us && e.flags & SAMPLE_FLAG_KEY_FRAME != 0
                })
                .map(|(i, _)| i)
                .last()
                .unwrap_or(0)
        } else {
            state
                .entries
                .iter()
                .take(limit)
                .take_while(|e| e.timestamp_us <= position_us)
                .count()
        };

        for _ in 0..discard_count {
            if let Some(entry) = state.entries.pop_front() {
                self.allocator.release(entry.data.len());
            }
        }
        state.read_index = state.read_index.saturating_sub(discard_count);
    }

    /// Discards the entire buffer, keeping the epoch (largest timestamp and
    /// announced format) intact.
    pub async fn discard_to_end(&self) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        for entry in state.entries.drain(..) {
            self.allocator.release(entry.data.len());
        }
        state.read_index = 0;
    }

    /// Empties the queue and starts a new epoch: the upstream format must be
    /// re-announced before the first subsequent read delivers anything.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        for entry in state.entries.drain(..) {
            self.allocator.release(entry.data.len());
        }
        state.read_index = 0;
        state.largest_queued_timestamp_us = TIME_UNSET;
        state.upstream_format = None;
        state.downstream_format = None;
    }

    /// Releases the queue; subsequent reads report end of stream and writes
    /// are dropped.
    pub async fn release(&self) {
        {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            for entry in state.entries.drain(..) {
                self.allocator.release(entry.data.len());
            }
            state.read_index = 0;
            state.released = true;
        }
        self.set_upstream_format_change_listener(None);
    }

    pub async fn is_released(&self) -> bool {
        self.state.lock().await.released
    }
}
