use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use url::Url;
use util::marshal::Marshal;

use super::*;
use crate::error::Error;
use crate::extractor::mock::{MockExtractor, MockExtractorFactory, MockPassthrough, MockStep};
use crate::extractor::RtpPayloadFormat;
use crate::format::{mime, Format, FormatDetails, TrackType};
use crate::sample_queue::SAMPLE_FLAG_KEY_FRAME;
use crate::session::{DefaultAllocator, MediaSession, NoopDrmSessionManager};
use crate::transport::{LowerTransport, TrackTransport, TransportProtocol};
use crate::TIME_END_OF_SOURCE;

struct TestSession {
    interleaved: bool,
    nat_required: bool,
    rtcp_supported: bool,
    rtcp_muxed: bool,
    paused: AtomicBool,
    duration_us: Option<i64>,
    selected: StdMutex<Vec<(Vec<TrackType>, bool)>>,
}

impl Default for TestSession {
    fn default() -> Self {
        TestSession {
            interleaved: false,
            nat_required: false,
            rtcp_supported: true,
            rtcp_muxed: false,
            // RTSP sessions idle until PLAY; idle socket timeouts are
            // expected and swallowed.
            paused: AtomicBool::new(true),
            duration_us: None,
            selected: StdMutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl MediaSession for TestSession {
    fn is_interleaved(&self) -> bool {
        self.interleaved
    }
    fn is_nat_required(&self) -> bool {
        self.nat_required
    }
    fn is_rtcp_supported(&self) -> bool {
        self.rtcp_supported
    }
    fn is_rtcp_muxed(&self) -> bool {
        self.rtcp_muxed
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn duration_us(&self) -> Option<i64> {
        self.duration_us
    }
    async fn on_select_tracks(&self, track_types: &[TrackType], enabled: bool) {
        self.selected
            .lock()
            .unwrap()
            .push((track_types.to_vec(), enabled));
    }
    async fn on_outgoing_interleaved_frame(&self, _channel: u8, _frame: Bytes) {}
}

fn audio_format() -> Format {
    let mut format = Format::default();
    format.sample_mime = Some(mime::AUDIO_AAC.to_owned());
    format.average_bitrate = Some(96_000);
    format.details = FormatDetails::Audio(Default::default());
    format
}

fn media_track(lower_transport: LowerTransport) -> MediaTrack {
    MediaTrack {
        uri: Url::parse("rtsp://127.0.0.1/test/track1").unwrap(),
        payload_format: RtpPayloadFormat {
            payload_type: 96,
            clock_rate: 48_000,
            format: audio_format(),
            fmtp: HashMap::new(),
        },
        transport: TrackTransport {
            lower_transport,
            protocol: TransportProtocol::Rtp,
            ssrc: None,
            source: None,
            destination: None,
            server_port: None,
            interleaved: Some((0, 1)),
        },
    }
}

fn test_config() -> PipelineConfig {
    PipelineConfig::default()
        .with_socket_read_timeout(Duration::from_millis(60))
        .with_min_retry_delay(Duration::from_millis(20))
}

fn pipeline_with(
    session: Arc<TestSession>,
    track: MediaTrack,
    template: MockExtractor,
) -> TrackPipeline {
    TrackPipeline::new(
        session,
        track,
        Arc::new(MockExtractorFactory::new(template)),
        Arc::new(DefaultAllocator::new()),
        Arc::new(NoopDrmSessionManager),
        None,
        test_config(),
    )
}

fn event_label(event: &PipelineEvent) -> &'static str {
    match event {
        PipelineEvent::PrepareStarted => "prepare-started",
        PipelineEvent::PrepareFailure(_) => "prepare-failure",
        PipelineEvent::PrepareSuccess => "prepare-success",
        PipelineEvent::PlaybackCancel => "playback-cancel",
        PipelineEvent::PlaybackComplete => "playback-complete",
        PipelineEvent::PlaybackFailure(_) => "playback-failure",
    }
}

fn watch_events(pipeline: &TrackPipeline) -> mpsc::UnboundedReceiver<&'static str> {
    let (tx, rx) = mpsc::unbounded_channel();
    pipeline.on_event(Box::new(move |event| {
        let tx = tx.clone();
        let label = event_label(&event);
        Box::pin(async move {
            let _ = tx.send(label);
        })
    }));
    rx
}

async fn expect_event(events: &mut mpsc::UnboundedReceiver<&'static str>, expected: &str) {
    let event = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", expected))
        .expect("event channel closed");
    assert_eq!(event, expected);
}

async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn rtp_packet_bytes(seq: u16, payload: &'static [u8]) -> Bytes {
    let packet = rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            payload_type: 96,
            sequence_number: seq,
            timestamp: u32::from(seq) * 480,
            ssrc: 7,
            ..Default::default()
        },
        payload: Bytes::from_static(payload),
    };
    packet.marshal().unwrap()
}

fn declare_and_end(template: MockExtractor) -> MockExtractor {
    template
        .with_step(MockStep::DeclareTrack {
            id: 0,
            track_type: TrackType::Audio,
            format: audio_format(),
        })
        .with_step(MockStep::EndTracks)
}

fn sample_step(timestamp_us: i64, flags: u32) -> MockStep {
    MockStep::Sample {
        track_id: 0,
        track_type: TrackType::Audio,
        timestamp_us,
        flags,
        payload: b"sample".to_vec(),
    }
}

#[tokio::test]
async fn clean_udp_prepare_over_loopback() {
    let session = Arc::new(TestSession::default());
    // The extractor waits for the first packet, then announces the track.
    let template = declare_and_end(MockExtractor::new().with_step(MockStep::ReadInput))
        .with_passthrough(MockPassthrough {
            track_id: 0,
            track_type: TrackType::Audio,
            timestamp_step_us: 10_000,
            flags: SAMPLE_FLAG_KEY_FRAME,
        });
    let pipeline = pipeline_with(session, media_track(LowerTransport::Udp), template);
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;

    // The loader opens an even local port pair inside the range.
    wait_until(|| pipeline.local_port().is_some()).await;
    let port = pipeline.local_port().unwrap();
    assert_eq!(port % 2, 0);
    assert!((50_000..60_000).contains(&port));

    // The first RTP packet produces the track and its format.
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender
        .send_to(&rtp_packet_bytes(1, b"audio-frame"), ("127.0.0.1", port))
        .await
        .unwrap();

    expect_event(&mut events, "prepare-success").await;
    let groups = pipeline.track_groups().expect("track groups built");
    assert_eq!(groups.len(), 1);
    assert_eq!(
        groups.groups[0].formats[0].sample_mime.as_deref(),
        Some(mime::AUDIO_AAC)
    );
    assert!(pipeline.maybe_throw_error(0).is_ok());

    pipeline.release().await;
}

#[tokio::test]
async fn select_tracks_reads_samples_and_notifies_session() {
    let session = Arc::new(TestSession::default());
    let template = MockExtractor::new()
        .with_step(MockStep::DeclareTrack {
            id: 0,
            track_type: TrackType::Audio,
            format: audio_format(),
        })
        .with_step(sample_step(0, SAMPLE_FLAG_KEY_FRAME))
        .with_step(MockStep::EndTracks);
    let pipeline = pipeline_with(session.clone(), media_track(LowerTransport::Udp), template);
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;

    let result = pipeline
        .select_tracks(
            vec![Some(TrackSelection {
                group_index: 0,
                track_index: 0,
            })],
            vec![false],
            vec![None],
            0,
        )
        .await
        .unwrap();
    assert!(result.reset_flags[0]);
    assert_eq!(pipeline.enabled_track_count().await, 1);
    {
        let selected = session.selected.lock().unwrap();
        assert_eq!(selected.last().unwrap(), &(vec![TrackType::Audio], true));
    }

    let stream = result.streams.into_iter().next().unwrap().unwrap();
    assert!(stream.is_ready().await);
    let mut holder = crate::sample_queue::FormatHolder::default();
    let mut buffer = crate::sample_queue::SampleBuffer::default();
    assert_eq!(
        stream.read_data(&mut holder, &mut buffer, false).await,
        crate::sample_queue::ReadDataResult::FormatRead
    );
    assert_eq!(
        stream.read_data(&mut holder, &mut buffer, false).await,
        crate::sample_queue::ReadDataResult::BufferRead
    );
    assert_eq!(&buffer.data[..], b"sample");

    // Deselect; the enabled count drops and the session hears about it.
    let result = pipeline
        .select_tracks(vec![None], vec![false], vec![Some(stream)], 0)
        .await
        .unwrap();
    assert!(result.streams[0].is_none());
    assert_eq!(pipeline.enabled_track_count().await, 0);
    {
        let selected = session.selected.lock().unwrap();
        assert_eq!(selected.last().unwrap(), &(vec![], false));
    }

    pipeline.release().await;
}

#[tokio::test]
async fn seek_inside_buffer_keeps_pending_reset_unset() {
    let session = Arc::new(TestSession::default());
    let mut template = MockExtractor::new().with_step(MockStep::DeclareTrack {
        id: 0,
        track_type: TrackType::Audio,
        format: audio_format(),
    });
    for base in [0i64, 1_000_000, 2_000_000] {
        template = template
            .with_step(sample_step(base, SAMPLE_FLAG_KEY_FRAME))
            .with_step(sample_step(base + 500_000, 0));
    }
    let template = template.with_step(MockStep::EndTracks);
    let pipeline = pipeline_with(session, media_track(LowerTransport::Udp), template);
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;
    wait_until_async(|| async { pipeline.buffered_position_us().await == 2_500_000 }).await;

    // All queues hold a keyframe at or before 1.5s: no reset.
    assert!(!pipeline.seek_to_us(1_500_000).await);
    assert_eq!(pipeline.buffered_position_us().await, 2_500_000);

    pipeline.release().await;
}

#[tokio::test]
async fn seek_beyond_buffer_resets_and_reaches_extractor() {
    let session = Arc::new(TestSession::default());
    let mut template = MockExtractor::new().with_step(MockStep::DeclareTrack {
        id: 0,
        track_type: TrackType::Audio,
        format: audio_format(),
    });
    for base in [0i64, 1_000_000, 2_000_000] {
        template = template
            .with_step(sample_step(base, SAMPLE_FLAG_KEY_FRAME))
            .with_step(sample_step(base + 500_000, 0));
    }
    let template = template.with_step(MockStep::EndTracks);
    let seeks = template.seek_targets();
    let pipeline = pipeline_with(session, media_track(LowerTransport::Udp), template);
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;
    wait_until_async(|| async { pipeline.buffered_position_us().await == 2_500_000 }).await;

    // Out of buffer: queues are dropped and the reset position is pending.
    assert!(pipeline.seek_to_us(10_000_000).await);
    assert_eq!(pipeline.buffered_position_us().await, 10_000_000);
    assert_eq!(pipeline.next_load_position_us().await, 10_000_000);
    // Reads are suppressed while the reset is pending (the load gate is
    // still closed, so the extractor cannot have consumed it yet).
    assert!(!pipeline.is_ready(0).await);

    // Playback opens the gate; the driver hands the position to the
    // extractor and the pending reset reverts to unset.
    pipeline.playback();
    wait_until(|| seeks.lock().unwrap().contains(&10_000_000)).await;
    wait_until_async(|| async { pipeline.buffered_position_us().await != 10_000_000 }).await;

    pipeline.release().await;
}

#[tokio::test]
async fn udp_cancel_fails_over_to_interleaved_keeping_queues() {
    let session = Arc::new(TestSession::default());
    // The track declares TCP as its lower transport: cancellation without
    // release re-enters load interleaved.
    let template = MockExtractor::new()
        .with_step(MockStep::DeclareTrack {
            id: 0,
            track_type: TrackType::Audio,
            format: audio_format(),
        })
        .with_step(sample_step(0, SAMPLE_FLAG_KEY_FRAME))
        .with_step(MockStep::EndTracks)
        .with_passthrough(MockPassthrough {
            track_id: 0,
            track_type: TrackType::Audio,
            timestamp_step_us: 10_000,
            flags: SAMPLE_FLAG_KEY_FRAME,
        });
    let pipeline = pipeline_with(
        session,
        media_track(LowerTransport::TcpInterleaved),
        template,
    );
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;
    pipeline.playback();

    // Re-prepare cancels the live UDP load; failover must not disturb the
    // prepared state or the queued samples.
    pipeline.prepare();
    wait_until(|| pipeline.is_loading()).await;
    assert!(pipeline.track_groups().is_some());
    assert_eq!(pipeline.buffered_position_us().await, 0);

    // The interleaved transport is live: frames fed through the signalling
    // path become samples.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seq = 10u16;
    while pipeline.buffered_position_us().await < 10_000 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "interleaved samples never arrived"
        );
        pipeline
            .on_interleaved_frame(0, rtp_packet_bytes(seq, b"frame"))
            .await;
        seq += 1;
        sleep(Duration::from_millis(20)).await;
    }

    // No failure events: the failover is invisible to the listener.
    while let Ok(event) = events.try_recv() {
        assert!(
            event != "prepare-failure" && event != "playback-failure",
            "unexpected {}",
            event
        );
    }

    pipeline.release().await;
}

#[tokio::test]
async fn interleaved_non_rtp_track_fails_fast() {
    let session = Arc::new(TestSession {
        interleaved: true,
        ..Default::default()
    });
    let mut track = media_track(LowerTransport::TcpInterleaved);
    track.transport.protocol = TransportProtocol::Mp2t;
    let pipeline = pipeline_with(session, track, MockExtractor::new());
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-failure").await;
    assert!(matches!(
        pipeline.maybe_throw_error(0),
        Err(Error::UnsupportedProtocol)
    ));

    pipeline.release().await;
}

#[tokio::test]
async fn load_completion_without_formats_is_prepare_failure() {
    let session = Arc::new(TestSession::default());
    let pipeline = pipeline_with(
        session,
        media_track(LowerTransport::Udp),
        MockExtractor::new().with_step(MockStep::Finish),
    );
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-failure").await;

    pipeline.release().await;
}

#[tokio::test]
async fn read_failure_after_duration_is_reinterpreted_as_complete() {
    let session = Arc::new(TestSession {
        duration_us: Some(50_000),
        ..Default::default()
    });
    let pipeline = pipeline_with(
        session.clone(),
        media_track(LowerTransport::Udp),
        declare_and_end(MockExtractor::new()),
    );
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;

    // Resuming exposes the idle socket: the timeout that follows lands
    // beyond the declared duration and counts as end of playback.
    session.paused.store(false, Ordering::SeqCst);
    expect_event(&mut events, "playback-complete").await;
    assert_eq!(pipeline.next_load_position_us().await, TIME_END_OF_SOURCE);

    pipeline.release().await;
}

#[tokio::test]
async fn read_failure_within_duration_is_playback_failure() {
    let session = Arc::new(TestSession::default());
    let pipeline = pipeline_with(
        session.clone(),
        media_track(LowerTransport::Udp),
        declare_and_end(MockExtractor::new()),
    );
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;

    session.paused.store(false, Ordering::SeqCst);
    expect_event(&mut events, "playback-failure").await;
    assert!(matches!(
        pipeline.maybe_throw_error(0),
        Err(Error::ReadTimeout)
    ));

    pipeline.release().await;
}

#[tokio::test]
async fn release_is_idempotent_and_blocks_further_work() {
    let session = Arc::new(TestSession::default());
    let pipeline = pipeline_with(
        session,
        media_track(LowerTransport::Udp),
        declare_and_end(MockExtractor::new()),
    );
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    expect_event(&mut events, "prepare-success").await;
    pipeline.playback();

    pipeline.release().await;
    pipeline.release().await;
    assert!(!pipeline.is_loading());

    // Released pipelines ignore new work entirely.
    pipeline.prepare();
    pipeline.playback();
    sleep(Duration::from_millis(100)).await;
    assert!(!pipeline.is_loading());

    // The playing pipeline reported the teardown as a cancel.
    let mut saw_cancel = false;
    while let Ok(event) = events.try_recv() {
        saw_cancel |= event == "playback-cancel";
    }
    assert!(saw_cancel);
}

#[tokio::test]
async fn prepare_twice_before_completion_recovers() {
    let session = Arc::new(TestSession::default());
    let template = declare_and_end(MockExtractor::new().with_step(MockStep::ReadInput));
    let pipeline = pipeline_with(session, media_track(LowerTransport::Udp), template);
    let mut events = watch_events(&pipeline);

    pipeline.prepare();
    expect_event(&mut events, "prepare-started").await;
    wait_until(|| pipeline.local_port().is_some()).await;

    // Second prepare while the first load waits for its first packet.
    pipeline.prepare();
    sleep(Duration::from_millis(100)).await;

    // Feed whatever port the recovered loader bound until prepare lands.
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut seq = 1u16;
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "prepare never completed after re-prepare"
        );
        if let Some(port) = pipeline.local_port() {
            sender
                .send_to(&rtp_packet_bytes(seq, b"audio"), ("127.0.0.1", port))
                .await
                .unwrap();
            seq += 1;
        }
        match events.try_recv() {
            Ok("prepare-success") => break,
            Ok(other) => panic!("unexpected event {}", other),
            Err(_) => sleep(Duration::from_millis(20)).await,
        }
    }

    pipeline.release().await;
}

async fn wait_until_async<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
