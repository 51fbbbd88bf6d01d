use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use rtcp::receiver_report::ReceiverReport;
use util::marshal::Marshal;

use super::*;
use crate::format::TrackType;
use crate::session::MediaSession;

struct RecordingListener {
    tag: &'static str,
    log: Arc<StdMutex<Vec<(&'static str, u32)>>>,
}

#[async_trait]
impl RtcpListener for RecordingListener {
    async fn on_rtcp(&self, packets: &[RtcpPacket]) {
        let mut log = self.log.lock().unwrap();
        for packet in packets {
            for ssrc in packet.destination_ssrc() {
                log.push((self.tag, ssrc));
            }
        }
    }
}

#[tokio::test]
async fn dispatch_parses_and_fans_out_in_registration_order() {
    let dispatcher = RtcpDispatcher::new();
    let log = Arc::new(StdMutex::new(Vec::new()));
    dispatcher
        .register(Arc::new(RecordingListener {
            tag: "first",
            log: log.clone(),
        }))
        .await;
    dispatcher
        .register(Arc::new(RecordingListener {
            tag: "second",
            log: log.clone(),
        }))
        .await;

    let report = ReceiverReport {
        ssrc: 0x1,
        reports: vec![rtcp::reception_report::ReceptionReport {
            ssrc: 0xCAFE,
            ..Default::default()
        }],
        ..Default::default()
    };
    let data = report.marshal().unwrap();
    dispatcher.dispatch(&data).await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(&*log, &[("first", 0xCAFE), ("second", 0xCAFE)]);
}

#[tokio::test]
async fn dispatch_rejects_garbage() {
    let dispatcher = RtcpDispatcher::new();
    assert!(dispatcher.dispatch(&[0xFF, 0x00, 0x01]).await.is_err());
}

struct FrameCapturingSession {
    frames: Arc<StdMutex<Vec<(u8, Bytes)>>>,
}

#[async_trait]
impl MediaSession for FrameCapturingSession {
    fn is_interleaved(&self) -> bool {
        true
    }
    fn is_nat_required(&self) -> bool {
        false
    }
    fn is_rtcp_supported(&self) -> bool {
        true
    }
    fn is_rtcp_muxed(&self) -> bool {
        false
    }
    fn is_paused(&self) -> bool {
        false
    }
    fn duration_us(&self) -> Option<i64> {
        None
    }
    async fn on_select_tracks(&self, _track_types: &[TrackType], _enabled: bool) {}
    async fn on_outgoing_interleaved_frame(&self, channel: u8, frame: Bytes) {
        self.frames.lock().unwrap().push((channel, frame));
    }
}

#[tokio::test]
async fn output_emits_interleaved_frames_on_the_rtcp_channel() {
    let frames = Arc::new(StdMutex::new(Vec::new()));
    let session = Arc::new(FrameCapturingSession {
        frames: frames.clone(),
    });
    let output = RtcpOutput::new();
    output
        .set_sink(Some(RtcpSink::Interleaved {
            session,
            channel: 1,
        }))
        .await;

    let report = ReceiverReport {
        ssrc: 0xBEEF,
        ..Default::default()
    };
    let expected = report.marshal().unwrap();
    let packets: Vec<RtcpPacket> = vec![Box::new(report)];
    output.send(&packets).await.unwrap();

    let frames = frames.lock().unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 1);
    assert_eq!(frames[0].1, expected);
}

#[tokio::test]
async fn output_without_sink_drops_silently() {
    let output = RtcpOutput::new();
    let packets: Vec<RtcpPacket> = vec![Box::new(ReceiverReport::default())];
    assert!(output.send(&packets).await.is_ok());
}
