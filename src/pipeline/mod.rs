#[cfg(test)]
mod pipeline_test;

mod loadable;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use url::Url;

use crate::error::{Error, Result};
use crate::extractor::{ExtractorFactory, ExtractorOutput, RtpPayloadFormat, TrackIdGenerator};
use crate::format::{Format, TrackType};
use crate::loader::{LoadCondition, Loadable, Loader, LoaderCallback, RetryAction};
use crate::rtcp_dispatcher::{RtcpDispatcher, RtcpOutput, RtcpSink};
use crate::sample_queue::{FormatHolder, ReadDataResult, SampleBuffer, SampleQueue};
use crate::session::{Allocator, DrmSessionManager, MediaSession, TransferListener};
use crate::transport::interleaved::InterleavedTransport;
use crate::transport::udp::{UdpTransport, UdpTransportConfig};
use crate::transport::{perform_nat_punch, punch_host, LowerTransport, TrackTransport};
use crate::{TIME_END_OF_SOURCE, TIME_UNSET};

pub use loadable::TrackLoadable;

/// Interleaved channels used when the session does not declare a pair.
const DEFAULT_INTERLEAVED_CHANNELS: (u8, u8) = (0, 1);

/// Everything the signalling layer knows about the selected track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub uri: Url,
    pub payload_format: RtpPayloadFormat,
    pub transport: TrackTransport,
}

/// A bundle of exchangeable formats; this pipeline always produces groups
/// of size one.
#[derive(Debug, Clone)]
pub struct TrackGroup {
    pub formats: Vec<Arc<Format>>,
}

#[derive(Debug, Clone, Default)]
pub struct TrackGroupArray {
    pub groups: Vec<TrackGroup>,
}

impl TrackGroupArray {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// A consumer's choice of one track within one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSelection {
    pub group_index: usize,
    pub track_index: usize,
}

/// Outcome of [`TrackPipeline::select_tracks`].
pub struct TrackSelectionResult {
    pub streams: Vec<Option<SampleStream>>,
    pub reset_flags: Vec<bool>,
    pub position_us: i64,
}

/// Lifecycle and failure events, delivered on the pipeline's event loop.
#[derive(Debug)]
pub enum PipelineEvent {
    PrepareStarted,
    PrepareFailure(Error),
    PrepareSuccess,
    PlaybackCancel,
    PlaybackComplete,
    PlaybackFailure(Error),
}

pub type OnEventHdlrFn = Box<
    dyn (FnMut(PipelineEvent) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync
        + 'static,
>;

/// Tunables, one value per pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub socket_read_timeout: Duration,
    pub packet_queue_capacity: usize,
    pub bind_attempts: usize,
    pub min_retry_delay: Duration,
    pub receive_mtu: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            socket_read_timeout: Duration::from_millis(250),
            packet_queue_capacity: 128,
            bind_attempts: crate::transport::udp::DEFAULT_BIND_ATTEMPTS,
            min_retry_delay: Duration::from_millis(1000),
            receive_mtu: crate::RECEIVE_MTU,
        }
    }
}

impl PipelineConfig {
    pub fn with_socket_read_timeout(mut self, socket_read_timeout: Duration) -> Self {
        self.socket_read_timeout = socket_read_timeout;
        self
    }

    pub fn with_packet_queue_capacity(mut self, packet_queue_capacity: usize) -> Self {
        self.packet_queue_capacity = packet_queue_capacity;
        self
    }

    pub fn with_min_retry_delay(mut self, min_retry_delay: Duration) -> Self {
        self.min_retry_delay = min_retry_delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PipelineState {
    Idle = 0,
    Preparing = 1,
    Prepared = 2,
    Playing = 3,
    Released = 4,
}

impl From<u8> for PipelineState {
    fn from(v: u8) -> Self {
        match v {
            1 => PipelineState::Preparing,
            2 => PipelineState::Prepared,
            3 => PipelineState::Playing,
            4 => PipelineState::Released,
            _ => PipelineState::Idle,
        }
    }
}

enum Command {
    SetEventHandler(OnEventHdlrFn),
    Prepare,
    Playback,
    SelectTracks {
        selections: Vec<Option<TrackSelection>>,
        may_retain: Vec<bool>,
        prev_streams: Vec<Option<SampleStream>>,
        position_us: i64,
        reply: oneshot::Sender<Result<TrackSelectionResult>>,
    },
    SeekTo {
        position_us: i64,
        reply: oneshot::Sender<bool>,
    },
    DiscardBuffer {
        position_us: i64,
        to_keyframe: bool,
    },
    DiscardBufferToEnd,
    Release {
        reply: oneshot::Sender<()>,
    },

    // Internal, posted by the loader worker and the track output registry.
    QueueFormatAnnounced,
    TracksEnded,
    LoadCompleted,
    LoadCanceled { released: bool },
    LoadError { error: Error },
}

struct EnabledTracks {
    states: Vec<bool>,
    count: usize,
}

/// State shared between the actor, the loader worker and consumer threads.
/// Only the actor mutates wrapper-level fields; consumers read.
pub(crate) struct PipelineInner {
    config: PipelineConfig,
    session: Arc<dyn MediaSession>,
    track: MediaTrack,
    extractor_factory: Arc<dyn ExtractorFactory>,
    transfer_listener: Option<Arc<dyn TransferListener>>,

    state: AtomicU8,
    track_groups: ArcSwapOption<TrackGroupArray>,
    registry: Arc<TrackOutputRegistry>,
    enabled: Mutex<EnabledTracks>,
    /// Written by the actor on an out-of-buffer seek, consumed by the
    /// extractor driver on its next iteration.
    pending_reset_us: Arc<AtomicI64>,
    last_seek_position_us: AtomicI64,
    loading_finished: AtomicBool,
    local_port: Arc<AtomicU16>,
    track_ids: Arc<TrackIdGenerator>,

    loader: Loader,
    load_condition: Arc<LoadCondition>,
    rtcp_in: Arc<RtcpDispatcher>,
    rtcp_out: Arc<RtcpOutput>,
    udp_transport: ArcSwapOption<UdpTransport>,
    interleaved_transport: ArcSwapOption<InterleavedTransport>,

    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl PipelineInner {
    fn state(&self) -> PipelineState {
        self.state.load(Ordering::SeqCst).into()
    }

    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn suppress_read(&self) -> bool {
        self.pending_reset_us.load(Ordering::SeqCst) != TIME_UNSET
    }

    async fn queue(&self, group: usize) -> Option<Arc<SampleQueue>> {
        self.registry.queue_at(group).await
    }

    async fn is_ready(&self, group: usize) -> bool {
        if self.suppress_read() {
            return false;
        }
        let loading_finished = self.loading_finished.load(Ordering::SeqCst);
        match self.queue(group).await {
            Some(queue) => queue.is_ready(loading_finished).await,
            None => false,
        }
    }

    async fn read_data(
        &self,
        group: usize,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
    ) -> ReadDataResult {
        if self.suppress_read() {
            return ReadDataResult::NothingRead;
        }
        let loading_finished = self.loading_finished.load(Ordering::SeqCst);
        match self.queue(group).await {
            Some(queue) => {
                queue
                    .read(format_holder, buffer, require_format, loading_finished)
                    .await
            }
            None => ReadDataResult::NothingRead,
        }
    }

    async fn skip_data(&self, group: usize, position_us: i64) -> usize {
        if self.suppress_read() {
            return 0;
        }
        let queue = match self.queue(group).await {
            Some(queue) => queue,
            None => return 0,
        };
        if self.loading_finished.load(Ordering::SeqCst)
            && position_us > queue.largest_queued_timestamp_us().await
        {
            queue.advance_to_end().await
        } else {
            queue.advance_to(position_us).await
        }
    }

    fn maybe_throw_error(&self) -> Result<()> {
        self.loader.maybe_throw_error()
    }

    async fn buffered_position_us(&self) -> i64 {
        if self.loading_finished.load(Ordering::SeqCst) {
            return TIME_END_OF_SOURCE;
        }
        let pending_reset_us = self.pending_reset_us.load(Ordering::SeqCst);
        if pending_reset_us != TIME_UNSET {
            return pending_reset_us;
        }

        let queues = self.registry.snapshot().await;
        let enabled = self.enabled.lock().await;
        let mut min_largest: Option<i64> = None;
        let mut min_largest_any: Option<i64> = None;
        for (i, queue) in queues.iter().enumerate() {
            let largest = queue.largest_queued_timestamp_us().await;
            if largest == TIME_UNSET {
                continue;
            }
            if enabled.states.get(i).copied().unwrap_or(false) {
                min_largest = Some(min_largest.map_or(largest, |m| m.min(largest)));
            }
            min_largest_any = Some(min_largest_any.map_or(largest, |m| m.min(largest)));
        }
        min_largest.or(min_largest_any).unwrap_or(0)
    }
}

/// Lazily creates one sample queue per unique `(id, track type)` the
/// extractor discovers, and reports discovery progress to the actor.
pub(crate) struct TrackOutputRegistry {
    allocator: Arc<dyn Allocator>,
    drm: Arc<dyn DrmSessionManager>,
    tracks: Mutex<Vec<(u32, TrackType, Arc<SampleQueue>)>>,
    tracks_ended: AtomicBool,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl TrackOutputRegistry {
    fn new(
        allocator: Arc<dyn Allocator>,
        drm: Arc<dyn DrmSessionManager>,
        cmd_tx: mpsc::UnboundedSender<Command>,
    ) -> Self {
        TrackOutputRegistry {
            allocator,
            drm,
            tracks: Mutex::new(Vec::new()),
            tracks_ended: AtomicBool::new(false),
            cmd_tx,
        }
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<SampleQueue>> {
        self.tracks
            .lock()
            .await
            .iter()
            .map(|(_, _, q)| q.clone())
            .collect()
    }

    pub(crate) async fn queue_at(&self, index: usize) -> Option<Arc<SampleQueue>> {
        self.tracks.lock().await.get(index).map(|(_, _, q)| q.clone())
    }

    fn tracks_ended(&self) -> bool {
        self.tracks_ended.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractorOutput for TrackOutputRegistry {
    async fn track(&self, id: u32, track_type: TrackType) -> Arc<SampleQueue> {
        let mut tracks = self.tracks.lock().await;
        if let Some((_, _, queue)) = tracks
            .iter()
            .find(|(tid, ttype, _)| *tid == id && *ttype == track_type)
        {
            return queue.clone();
        }
        let queue = Arc::new(SampleQueue::new(
            id,
            track_type,
            self.allocator.clone(),
            self.drm.clone(),
        ));
        let cmd_tx = self.cmd_tx.clone();
        queue.set_upstream_format_change_listener(Some(Box::new(move |_format| {
            let _ = cmd_tx.send(Command::QueueFormatAnnounced);
        })));
        tracks.push((id, track_type, queue.clone()));
        queue
    }

    async fn end_tracks(&self) {
        self.tracks_ended.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::TracksEnded);
    }
}

/// Routes loader outcomes onto the actor's queue. Retry decisions are made
/// here, without a round trip: the pipeline maps every load failure to an
/// event instead of retrying in place, and recovers transports through the
/// cancellation path.
struct ActorLoaderCallback {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

#[async_trait]
impl LoaderCallback for ActorLoaderCallback {
    async fn on_load_completed(&self, _loadable: Arc<dyn Loadable>) {
        let _ = self.cmd_tx.send(Command::LoadCompleted);
    }

    async fn on_load_canceled(&self, _loadable: Arc<dyn Loadable>, released: bool) {
        let _ = self.cmd_tx.send(Command::LoadCanceled { released });
    }

    async fn on_load_error(
        &self,
        _loadable: Arc<dyn Loadable>,
        error: Error,
        _retry_count: u32,
    ) -> RetryAction {
        let _ = self.cmd_tx.send(Command::LoadError { error });
        RetryAction::DontRetry
    }
}

/// Consumer-side handle to one enabled track's sample stream. Reads touch
/// only the per-queue synchronization and may run on any thread.
pub struct SampleStream {
    inner: Arc<PipelineInner>,
    group_index: usize,
}

impl SampleStream {
    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.is_ready(self.group_index).await
    }

    pub async fn read_data(
        &self,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
    ) -> ReadDataResult {
        self.inner
            .read_data(self.group_index, format_holder, buffer, require_format)
            .await
    }

    pub async fn skip_data(&self, position_us: i64) -> usize {
        self.inner.skip_data(self.group_index, position_us).await
    }

    pub fn maybe_throw_error(&self) -> Result<()> {
        self.inner.maybe_throw_error()
    }
}

impl std::fmt::Debug for SampleStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStream")
            .field("group_index", &self.group_index)
            .finish()
    }
}

/// The per-track pipeline coordinator.
///
/// Owns the transport, packet queue, dispatchers, extractor driver, loader
/// and sample queues. A dedicated actor task serializes every wrapper-state
/// mutation and listener callback; consumer read APIs bypass it and touch
/// only per-queue state.
#[derive(Clone)]
pub struct TrackPipeline {
    inner: Arc<PipelineInner>,
}

impl TrackPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<dyn MediaSession>,
        track: MediaTrack,
        extractor_factory: Arc<dyn ExtractorFactory>,
        allocator: Arc<dyn Allocator>,
        drm: Arc<dyn DrmSessionManager>,
        transfer_listener: Option<Arc<dyn TransferListener>>,
        config: PipelineConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(TrackOutputRegistry::new(allocator, drm, cmd_tx.clone()));
        let inner = Arc::new(PipelineInner {
            loader: Loader::new("track-pipeline").with_min_retry_delay(config.min_retry_delay),
            config,
            session,
            track,
            extractor_factory,
            transfer_listener,
            state: AtomicU8::new(PipelineState::Idle as u8),
            track_groups: ArcSwapOption::empty(),
            registry,
            enabled: Mutex::new(EnabledTracks {
                states: Vec::new(),
                count: 0,
            }),
            pending_reset_us: Arc::new(AtomicI64::new(TIME_UNSET)),
            last_seek_position_us: AtomicI64::new(TIME_UNSET),
            loading_finished: AtomicBool::new(false),
            local_port: Arc::new(AtomicU16::new(0)),
            track_ids: Arc::new(TrackIdGenerator::new(0)),
            load_condition: Arc::new(LoadCondition::new(true)),
            rtcp_in: Arc::new(RtcpDispatcher::new()),
            rtcp_out: Arc::new(RtcpOutput::new()),
            udp_transport: ArcSwapOption::empty(),
            interleaved_transport: ArcSwapOption::empty(),
            cmd_tx,
        });

        let actor = Actor {
            inner: inner.clone(),
            handler: None,
            prepare_called: false,
            prepared: false,
            released: false,
            load_started_at: None,
            current_loadable: None,
        };
        tokio::spawn(actor.run(cmd_rx));

        TrackPipeline { inner }
    }

    /// Registers the event handler; call before `prepare()` to observe
    /// `PrepareStarted`.
    pub fn on_event(&self, handler: OnEventHdlrFn) {
        let _ = self.inner.cmd_tx.send(Command::SetEventHandler(handler));
    }

    /// Starts preparation. Idempotent; while a load is live this re-prepares
    /// by canceling the loader, which re-enters load on the declared
    /// transport.
    pub fn prepare(&self) {
        let _ = self.inner.cmd_tx.send(Command::Prepare);
    }

    /// Transitions into playback: punches the NAT when the session requires
    /// it, then lets the loader continue.
    pub fn playback(&self) {
        let _ = self.inner.cmd_tx.send(Command::Playback);
    }

    /// Applies a consumer track selection. `prev_streams[i]` carries the
    /// stream previously handed out for selection slot `i`, if any.
    pub async fn select_tracks(
        &self,
        selections: Vec<Option<TrackSelection>>,
        may_retain: Vec<bool>,
        prev_streams: Vec<Option<SampleStream>>,
        position_us: i64,
    ) -> Result<TrackSelectionResult> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(Command::SelectTracks {
                selections,
                may_retain,
                prev_streams,
                position_us,
                reply,
            })
            .map_err(|_| Error::Released)?;
        rx.await.map_err(|_| Error::Released)?
    }

    /// Seeks. Returns false when every queue could satisfy the position
    /// in-buffer; true when buffers were dropped and the extractor will be
    /// reset to the position instead.
    pub async fn seek_to_us(&self, position_us: i64) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .inner
            .cmd_tx
            .send(Command::SeekTo { position_us, reply })
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Discards buffer up to `position_us` on every queue.
    pub fn discard_buffer(&self, position_us: i64, to_keyframe: bool) {
        let _ = self.inner.cmd_tx.send(Command::DiscardBuffer {
            position_us,
            to_keyframe,
        });
    }

    pub fn discard_buffer_to_end(&self) {
        let _ = self.inner.cmd_tx.send(Command::DiscardBufferToEnd);
    }

    /// Tears the pipeline down. Idempotent; resolves once the loader worker
    /// has stopped and every queue is released.
    pub async fn release(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Release { reply }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Routes one interleaved frame from the signalling connection into the
    /// live TCP transport.
    pub async fn on_interleaved_frame(&self, channel: u8, frame: Bytes) {
        if let Some(transport) = self.inner.interleaved_transport.load_full() {
            transport.on_interleaved_frame(channel, frame).await;
        }
    }

    // Per-stream API, callable from any thread.

    pub async fn is_ready(&self, group: usize) -> bool {
        self.inner.is_ready(group).await
    }

    pub async fn read_data(
        &self,
        group: usize,
        format_holder: &mut FormatHolder,
        buffer: &mut SampleBuffer,
        require_format: bool,
    ) -> ReadDataResult {
        self.inner
            .read_data(group, format_holder, buffer, require_format)
            .await
    }

    pub async fn skip_data(&self, group: usize, position_us: i64) -> usize {
        self.inner.skip_data(group, position_us).await
    }

    pub fn maybe_throw_error(&self, _group: usize) -> Result<()> {
        self.inner.maybe_throw_error()
    }

    // Queries.

    pub fn track_groups(&self) -> Option<Arc<TrackGroupArray>> {
        self.inner.track_groups.load_full()
    }

    pub fn media_track(&self) -> MediaTrack {
        self.inner.track.clone()
    }

    pub fn local_port(&self) -> Option<u16> {
        match self.inner.local_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub async fn buffered_position_us(&self) -> i64 {
        self.inner.buffered_position_us().await
    }

    pub async fn next_load_position_us(&self) -> i64 {
        if self.inner.loading_finished.load(Ordering::SeqCst) {
            return TIME_END_OF_SOURCE;
        }
        self.inner.buffered_position_us().await
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loader.is_loading()
    }

    pub async fn enabled_track_count(&self) -> usize {
        self.inner.enabled.lock().await.count
    }

    /// Observable for this track's inbound RTCP.
    pub fn rtcp_dispatcher(&self) -> Arc<RtcpDispatcher> {
        self.inner.rtcp_in.clone()
    }

    /// Emitter for locally generated RTCP reports on this track.
    pub fn rtcp_output(&self) -> Arc<RtcpOutput> {
        self.inner.rtcp_out.clone()
    }
}

enum LoadableKind {
    Udp,
    Interleaved,
}

/// The coordinator state machine. Runs on its own task; commands arrive in
/// FIFO order and every wrapper-state mutation happens here.
struct Actor {
    inner: Arc<PipelineInner>,
    handler: Option<OnEventHdlrFn>,
    prepare_called: bool,
    /// Track groups built, `PrepareSuccess` emitted.
    prepared: bool,
    released: bool,
    load_started_at: Option<Instant>,
    current_loadable: Option<Arc<TrackLoadable>>,
}

impl Actor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = cmd_rx.recv().await {
            match command {
                Command::SetEventHandler(handler) => self.handler = Some(handler),
                Command::Prepare => self.handle_prepare().await,
                Command::Playback => self.handle_playback().await,
                Command::SelectTracks {
                    selections,
                    may_retain,
                    prev_streams,
                    position_us,
                    reply,
                } => {
                    let result = self
                        .handle_select_tracks(selections, may_retain, prev_streams, position_us)
                        .await;
                    let _ = reply.send(result);
                }
                Command::SeekTo { position_us, reply } => {
                    let _ = reply.send(self.handle_seek(position_us).await);
                }
                Command::DiscardBuffer {
                    position_us,
                    to_keyframe,
                } => self.handle_discard(position_us, to_keyframe).await,
                Command::DiscardBufferToEnd => {
                    for queue in self.inner.registry.snapshot().await {
                        queue.discard_to_end().await;
                    }
                }
                Command::Release { reply } => {
                    self.handle_release().await;
                    let _ = reply.send(());
                    // Wrapper state is final; stop the event loop. Late
                    // commands fail to send and are dropped, which released
                    // semantics allow.
                    break;
                }
                Command::QueueFormatAnnounced | Command::TracksEnded => {
                    self.maybe_finish_prepare().await;
                }
                Command::LoadCompleted => self.handle_load_completed().await,
                Command::LoadCanceled { released } => {
                    self.handle_load_canceled(released).await;
                }
                Command::LoadError { error } => self.handle_load_error(error).await,
            }
        }
    }

    async fn emit(&mut self, event: PipelineEvent) {
        log::debug!("pipeline event: {:?}", event);
        if let Some(handler) = &mut self.handler {
            handler(event).await;
        }
    }

    async fn handle_prepare(&mut self) {
        if self.released {
            return;
        }
        if !self.prepare_called {
            self.prepare_called = true;
            self.inner.set_state(PipelineState::Preparing);
            self.emit(PipelineEvent::PrepareStarted).await;
            let kind = if self.inner.session.is_interleaved() {
                LoadableKind::Interleaved
            } else {
                LoadableKind::Udp
            };
            self.start_load(kind).await;
        } else if self.inner.loader.is_loading() {
            // Re-prepare: cancel the live load; the canceled callback
            // re-enters load on the transport the track now declares.
            self.inner.loader.cancel_loading().await;
        }
    }

    async fn start_load(&mut self, kind: LoadableKind) {
        let inner = &self.inner;
        // The condition gates loading: open while preparing or playing,
        // closed in the prepared gap in between.
        if self.prepared && inner.state() != PipelineState::Playing {
            inner.load_condition.close();
        } else {
            inner.load_condition.open();
        }

        let loadable = match kind {
            LoadableKind::Udp => {
                let transport = Arc::new(UdpTransport::new(
                    UdpTransportConfig {
                        read_timeout: inner.config.socket_read_timeout,
                        ssrc_filter: inner.track.transport.ssrc,
                        rtcp_enabled: inner.session.is_rtcp_supported(),
                        rtcp_muxed: inner.session.is_rtcp_muxed(),
                        bind_attempts: inner.config.bind_attempts,
                    },
                    inner.transfer_listener.clone(),
                ));
                inner.udp_transport.store(Some(transport.clone()));
                inner.interleaved_transport.store(None);
                self.configure_rtcp_out(Some(transport.clone()), None).await;
                TrackLoadable::udp(inner, transport)
            }
            LoadableKind::Interleaved => {
                let channels = inner
                    .track
                    .transport
                    .interleaved
                    .unwrap_or(DEFAULT_INTERLEAVED_CHANNELS);
                let transport = Arc::new(
                    InterleavedTransport::new(channels, inner.transfer_listener.clone())
                        .with_read_timeout(inner.config.socket_read_timeout),
                );
                inner.udp_transport.store(None);
                inner.interleaved_transport.store(Some(transport.clone()));
                self.configure_rtcp_out(None, Some(channels.1)).await;
                TrackLoadable::interleaved(inner, transport)
            }
        };

        let loadable = Arc::new(loadable);
        self.current_loadable = Some(loadable.clone());
        self.load_started_at = Some(Instant::now());
        let callback = Arc::new(ActorLoaderCallback {
            cmd_tx: inner.cmd_tx.clone(),
        });
        if let Err(e) = inner.loader.start_loading(loadable, callback).await {
            log::warn!("failed to start load: {}", e);
        }
    }

    async fn configure_rtcp_out(
        &self,
        udp: Option<Arc<UdpTransport>>,
        interleaved_channel: Option<u8>,
    ) {
        let inner = &self.inner;
        if !inner.session.is_rtcp_supported() {
            inner.rtcp_out.set_sink(None).await;
            return;
        }
        let sink = match (udp, interleaved_channel) {
            (Some(transport), _) => {
                let ports = inner.track.transport.server_port;
                let host = punch_host(&inner.track.transport, &inner.track.uri);
                match (ports, host) {
                    (Some((rtp_port, rtcp_port)), Some(host)) => Some(RtcpSink::Udp {
                        transport,
                        host,
                        port: rtcp_port.unwrap_or(rtp_port),
                    }),
                    _ => None,
                }
            }
            (None, Some(channel)) => Some(RtcpSink::Interleaved {
                session: inner.session.clone(),
                channel,
            }),
            (None, None) => None,
        };
        inner.rtcp_out.set_sink(sink).await;
    }

    async fn handle_playback(&mut self) {
        if self.released || !self.prepared {
            return;
        }
        let inner = &self.inner;
        if inner.state() == PipelineState::Playing {
            return;
        }
        if inner.session.is_nat_required() && !inner.session.is_interleaved() {
            if let Some(udp) = inner.udp_transport.load_full() {
                perform_nat_punch(
                    &udp,
                    &inner.track.transport,
                    &inner.track.uri,
                    inner.session.is_rtcp_muxed(),
                )
                .await;
            }
        }
        inner.set_state(PipelineState::Playing);
        inner.load_condition.open();
    }

    async fn maybe_finish_prepare(&mut self) {
        if self.released || self.prepared || !self.prepare_called {
            return;
        }
        if !self.inner.registry.tracks_ended() {
            return;
        }
        let queues = self.inner.registry.snapshot().await;
        if queues.is_empty() {
            return;
        }
        let mut formats = Vec::with_capacity(queues.len());
        for queue in &queues {
            match queue.upstream_format().await {
                Some(format) => formats.push(format),
                None => return,
            }
        }

        self.inner.load_condition.close();
        let groups = formats
            .into_iter()
            .map(|format| TrackGroup {
                formats: vec![format],
            })
            .collect();
        self.inner
            .track_groups
            .store(Some(Arc::new(TrackGroupArray { groups })));
        {
            let mut enabled = self.inner.enabled.lock().await;
            enabled.states = vec![false; queues.len()];
            enabled.count = 0;
        }
        self.prepared = true;
        self.inner.set_state(PipelineState::Prepared);
        self.emit(PipelineEvent::PrepareSuccess).await;
    }

    async fn handle_select_tracks(
        &mut self,
        selections: Vec<Option<TrackSelection>>,
        may_retain: Vec<bool>,
        mut streams: Vec<Option<SampleStream>>,
        position_us: i64,
    ) -> Result<TrackSelectionResult> {
        if self.released {
            return Err(Error::Released);
        }
        if !self.prepared {
            return Err(Error::PrepareNotComplete);
        }
        streams.resize_with(selections.len(), || None);
        let mut reset_flags = vec![false; selections.len()];
        let mut enabled = self.inner.enabled.lock().await;

        for i in 0..selections.len() {
            let deselect = match &streams[i] {
                Some(_) => selections[i].is_none() || !may_retain.get(i).copied().unwrap_or(false),
                None => false,
            };
            if deselect {
                if let Some(stream) = streams[i].take() {
                    let group = stream.group_index;
                    if enabled.states.get(group).copied().unwrap_or(false) {
                        enabled.states[group] = false;
                        enabled.count -= 1;
                    }
                }
            }
        }

        for i in 0..selections.len() {
            if streams[i].is_some() {
                continue;
            }
            if let Some(selection) = selections[i] {
                assert_eq!(selection.track_index, 0, "groups hold exactly one track");
                let group = selection.group_index;
                if !enabled.states[group] {
                    enabled.states[group] = true;
                    enabled.count += 1;
                }
                streams[i] = Some(SampleStream {
                    inner: self.inner.clone(),
                    group_index: group,
                });
                reset_flags[i] = true;
            }
        }

        let queues = self.inner.registry.snapshot().await;
        let enabled_types: Vec<TrackType> = queues
            .iter()
            .enumerate()
            .filter(|(i, _)| enabled.states.get(*i).copied().unwrap_or(false))
            .map(|(_, q)| q.track_type())
            .collect();
        let any_enabled = !enabled_types.is_empty();
        drop(enabled);
        self.inner
            .session
            .on_select_tracks(&enabled_types, any_enabled)
            .await;

        Ok(TrackSelectionResult {
            streams,
            reset_flags,
            position_us,
        })
    }

    async fn handle_seek(&mut self, position_us: i64) -> bool {
        if self.released || !self.prepared {
            return false;
        }
        self.inner
            .last_seek_position_us
            .store(position_us, Ordering::SeqCst);

        let queues = self.inner.registry.snapshot().await;
        let mut all_in_buffer = !queues.is_empty();
        for queue in &queues {
            if !queue.seek_to(position_us, false).await {
                all_in_buffer = false;
                break;
            }
        }
        if all_in_buffer {
            return false;
        }

        for queue in &queues {
            queue.discard_to_end().await;
        }
        self.inner
            .pending_reset_us
            .store(position_us, Ordering::SeqCst);
        true
    }

    async fn handle_discard(&mut self, position_us: i64, to_keyframe: bool) {
        if self.released {
            return;
        }
        let queues = self.inner.registry.snapshot().await;
        let enabled = self.inner.enabled.lock().await;
        for (i, queue) in queues.iter().enumerate() {
            let stop_at_read_position = enabled.states.get(i).copied().unwrap_or(false);
            queue
                .discard_to(position_us, to_keyframe, stop_at_read_position)
                .await;
        }
    }

    async fn handle_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.inner.state() == PipelineState::Playing {
            self.emit(PipelineEvent::PlaybackCancel).await;
        }
        self.inner.set_state(PipelineState::Released);

        self.inner.loader.release(None).await;
        if let Some(loadable) = self.current_loadable.take() {
            loadable.release().await;
        }
        self.inner.rtcp_in.clear().await;
        self.inner.rtcp_out.set_sink(None).await;
        self.inner.udp_transport.store(None);
        self.inner.interleaved_transport.store(None);
        for queue in self.inner.registry.snapshot().await {
            queue.release().await;
        }
        log::debug!("pipeline released");
    }

    async fn handle_load_completed(&mut self) {
        if self.released {
            return;
        }
        self.inner.loading_finished.store(true, Ordering::SeqCst);
        if !self.prepared {
            self.emit(PipelineEvent::PrepareFailure(Error::PrepareNotComplete))
                .await;
        } else {
            self.emit(PipelineEvent::PlaybackComplete).await;
        }
    }

    async fn handle_load_canceled(&mut self, released: bool) {
        if self.released {
            return;
        }
        if released {
            // Terminal teardown; release() already reported it.
            return;
        }
        // Transport failover: re-enter load on whatever lower transport the
        // track now declares. Sample queues are deliberately retained.
        let kind = match self.inner.track.transport.lower_transport {
            LowerTransport::TcpInterleaved => LoadableKind::Interleaved,
            LowerTransport::Udp => LoadableKind::Udp,
        };
        log::debug!(
            "load canceled without release, re-entering load ({})",
            match kind {
                LoadableKind::Interleaved => "interleaved",
                LoadableKind::Udp => "udp",
            }
        );
        self.start_load(kind).await;
    }

    async fn handle_load_error(&mut self, error: Error) {
        if self.released {
            return;
        }
        if !self.prepared {
            self.emit(PipelineEvent::PrepareFailure(error)).await;
            return;
        }
        // A steady-state read failure after the known duration has fully
        // elapsed is the end of the stream, not an error.
        if matches!(error, Error::ReadTimeout | Error::ReadFailed(_)) {
            if let (Some(duration_us), Some(started)) =
                (self.inner.session.duration_us(), self.load_started_at)
            {
                let elapsed_us = started.elapsed().as_micros() as i64;
                if elapsed_us > duration_us {
                    self.inner.loading_finished.store(true, Ordering::SeqCst);
                    self.emit(PipelineEvent::PlaybackComplete).await;
                    return;
                }
            }
        }
        self.emit(PipelineEvent::PlaybackFailure(error)).await;
    }
}
