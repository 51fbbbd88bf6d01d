use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::mock::{MockExtractor, MockExtractorFactory, MockStep};
use super::*;
use crate::error::Error;
use crate::format::{mime, Format, FormatDetails, TrackType};
use crate::loader::LoadCondition;
use crate::packet_queue::ByteFifo;
use crate::transport::TransportProtocol;
use crate::sample_queue::{
    FormatHolder, ReadDataResult, SampleBuffer, SampleQueue, SAMPLE_FLAG_KEY_FRAME,
};
use crate::session::{DefaultAllocator, NoopDrmSessionManager};

struct TestOutput {
    tracks: tokio::sync::Mutex<Vec<(u32, TrackType, Arc<SampleQueue>)>>,
    ended: AtomicBool,
}

impl TestOutput {
    fn new() -> Arc<Self> {
        Arc::new(TestOutput {
            tracks: tokio::sync::Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        })
    }

    async fn queue(&self, index: usize) -> Arc<SampleQueue> {
        self.tracks.lock().await[index].2.clone()
    }
}

#[async_trait::async_trait]
impl ExtractorOutput for TestOutput {
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
            Arc::new(DefaultAllocator::new()),
            Arc::new(NoopDrmSessionManager),
        ));
        tracks.push((id, track_type, queue.clone()));
        queue
    }

    async fn end_tracks(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

fn payload_format(sample_mime: &str) -> RtpPayloadFormat {
    let mut format = Format::default();
    format.sample_mime = Some(sample_mime.to_owned());
    format.details = FormatDetails::Audio(Default::default());
    RtpPayloadFormat {
        payload_type: 96,
        clock_rate: 90_000,
        format,
        fmtp: HashMap::new(),
    }
}

fn audio_format() -> Format {
    let mut format = Format::default();
    format.sample_mime = Some(mime::AUDIO_AAC.to_owned());
    format.details = FormatDetails::Audio(Default::default());
    format
}

async fn closed_input() -> MediaStreamInput {
    let fifo = Arc::new(ByteFifo::new());
    fifo.close().await;
    MediaStreamInput::new(StreamSource::Bytes(fifo))
}

#[tokio::test]
async fn selection_follows_protocol_and_sample_mime() {
    let ids = TrackIdGenerator::new(0);

    let factory = MockExtractorFactory::new(MockExtractor::new());
    let created = factory.created_kinds();
    let pf = payload_format(mime::AUDIO_AAC);
    let mut input = closed_input().await;
    select_extractor(&factory, TransportProtocol::Rtp, Some(&pf), &ids, &mut input)
        .await
        .unwrap();
    assert_eq!(&*created.lock().unwrap(), &["rtp".to_owned()]);

    let factory = MockExtractorFactory::new(MockExtractor::new());
    let created = factory.created_kinds();
    let pf = payload_format(mime::VIDEO_MP2T);
    let mut input = closed_input().await;
    select_extractor(&factory, TransportProtocol::Rtp, Some(&pf), &ids, &mut input)
        .await
        .unwrap();
    assert_eq!(&*created.lock().unwrap(), &["rtp-mp2t".to_owned()]);

    let factory = MockExtractorFactory::new(MockExtractor::new());
    let created = factory.created_kinds();
    let mut input = closed_input().await;
    select_extractor(&factory, TransportProtocol::Mp2t, None, &ids, &mut input)
        .await
        .unwrap();
    assert_eq!(&*created.lock().unwrap(), &["mp2t".to_owned()]);
}

#[tokio::test]
async fn rtp_without_payload_format_is_unsupported() {
    let ids = TrackIdGenerator::new(0);
    let factory = MockExtractorFactory::new(MockExtractor::new());
    let mut input = closed_input().await;
    let result =
        select_extractor(&factory, TransportProtocol::Rtp, None, &ids, &mut input).await;
    assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
}

#[tokio::test]
async fn raw_sniff_skips_rejecting_and_eof_candidates() {
    let ids = TrackIdGenerator::new(0);
    let fifo = Arc::new(ByteFifo::new());
    fifo.push(Bytes::from_static(b"abcd")).await;
    fifo.close().await;
    let mut input = MediaStreamInput::new(StreamSource::Bytes(fifo));

    let factory = MockExtractorFactory::new(MockExtractor::new()).with_raw_candidates(vec![
        // Decides against the stream after two peeked bytes.
        MockExtractor::new().with_sniff(false, 2),
        // Needs more bytes than the stream holds: EOF, skipped.
        MockExtractor::new().with_sniff(true, 100),
        // Accepts on the full four bytes.
        MockExtractor::new().with_sniff(true, 4),
    ]);
    select_extractor(&factory, TransportProtocol::Raw, None, &ids, &mut input)
        .await
        .unwrap();

    // Sniffing must not have consumed anything.
    let mut buf = [0u8; 8];
    let n = input.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"abcd");
}

#[tokio::test]
async fn raw_with_no_accepting_candidate_is_unsupported() {
    let ids = TrackIdGenerator::new(0);
    let mut input = closed_input().await;
    let factory = MockExtractorFactory::new(MockExtractor::new())
        .with_raw_candidates(vec![MockExtractor::new().with_sniff(false, 0)]);
    let result =
        select_extractor(&factory, TransportProtocol::Raw, None, &ids, &mut input).await;
    assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
}

#[tokio::test]
async fn input_peek_does_not_consume_until_read() {
    let fifo = Arc::new(ByteFifo::new());
    fifo.push(Bytes::from_static(b"abcdef")).await;
    fifo.close().await;
    let mut input = MediaStreamInput::new(StreamSource::Bytes(fifo));

    let mut probe = [0u8; 3];
    input.peek(&mut probe).await.unwrap();
    assert_eq!(&probe, b"abc");
    let mut probe = [0u8; 2];
    input.peek(&mut probe).await.unwrap();
    assert_eq!(&probe, b"de");
    input.reset_peek();

    let mut buf = [0u8; 4];
    let n = input.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"abcd");
    assert_eq!(input.position(), 4);
    let n = input.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ef");
    assert_eq!(input.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn track_id_generator_is_monotonic() {
    let ids = TrackIdGenerator::new(7);
    assert_eq!(ids.next_id(), 7);
    assert_eq!(ids.next_id(), 8);
    assert_eq!(ids.next_id(), 9);
}

#[tokio::test]
async fn driver_runs_script_into_the_output() {
    let output = TestOutput::new();
    let extractor = MockExtractor::new()
        .with_step(MockStep::DeclareTrack {
            id: 0,
            track_type: TrackType::Audio,
            format: audio_format(),
        })
        .with_step(MockStep::EndTracks)
        .with_step(MockStep::Sample {
            track_id: 0,
            track_type: TrackType::Audio,
            timestamp_us: 1_000,
            flags: SAMPLE_FLAG_KEY_FRAME,
            payload: b"sample".to_vec(),
        })
        .with_step(MockStep::Finish);

    let mut boxed: Box<dyn Extractor + Send> = Box::new(extractor);
    boxed.init(output.clone() as Arc<dyn ExtractorOutput>);
    let pending = Arc::new(AtomicI64::new(crate::TIME_UNSET));
    let mut driver = ExtractorDriver::new(boxed, pending);

    let condition = LoadCondition::new(true);
    let canceled = AtomicBool::new(false);
    let mut input = closed_input().await;
    driver.drive(&mut input, &condition, &canceled).await.unwrap();

    assert!(output.ended.load(Ordering::SeqCst));
    let queue = output.queue(0).await;
    let mut holder = FormatHolder::default();
    let mut buffer = SampleBuffer::default();
    assert_eq!(
        queue.read(&mut holder, &mut buffer, false, false).await,
        ReadDataResult::FormatRead
    );
    assert_eq!(
        queue.read(&mut holder, &mut buffer, false, false).await,
        ReadDataResult::BufferRead
    );
    assert_eq!(&buffer.data[..], b"sample");
}

#[tokio::test]
async fn driver_applies_pending_reset_before_reading() {
    let output = TestOutput::new();
    let extractor = MockExtractor::new().with_step(MockStep::Finish);
    let seeks = extractor.seek_targets();

    let mut boxed: Box<dyn Extractor + Send> = Box::new(extractor);
    boxed.init(output as Arc<dyn ExtractorOutput>);
    let pending = Arc::new(AtomicI64::new(7_000_000));
    let mut driver = ExtractorDriver::new(boxed, pending.clone());

    let condition = LoadCondition::new(true);
    let canceled = AtomicBool::new(false);
    let mut input = closed_input().await;
    driver.drive(&mut input, &condition, &canceled).await.unwrap();

    assert_eq!(&*seeks.lock().unwrap(), &[7_000_000]);
    assert_eq!(pending.load(Ordering::SeqCst), crate::TIME_UNSET);
}

#[tokio::test]
async fn driver_observes_cancellation_while_input_is_idle() {
    let output = TestOutput::new();
    // Empty script, nothing scripted: the driver would poll forever.
    let mut boxed: Box<dyn Extractor + Send> = Box::new(MockExtractor::new());
    boxed.init(output as Arc<dyn ExtractorOutput>);
    let pending = Arc::new(AtomicI64::new(crate::TIME_UNSET));
    let mut driver = ExtractorDriver::new(boxed, pending);

    let condition = Arc::new(LoadCondition::new(true));
    let canceled = Arc::new(AtomicBool::new(false));
    let fifo = Arc::new(ByteFifo::new());
    let task = {
        let condition = condition.clone();
        let canceled = canceled.clone();
        let fifo = fifo.clone();
        tokio::spawn(async move {
            let mut input = MediaStreamInput::new(StreamSource::Bytes(fifo));
            driver.drive(&mut input, &condition, &canceled).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    canceled.store(true, Ordering::Release);
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("driver must stop after cancellation")
        .unwrap();
    assert!(result.is_ok());
}
