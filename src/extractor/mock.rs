//! Scriptable extractor doubles for driver and pipeline tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::extractor::{
    Extractor, ExtractorFactory, ExtractorInput, ExtractorOutput, ReadAction, RtpPayloadFormat,
    TrackIdGenerator,
};
use crate::format::{Format, TrackType};

/// One scripted action, performed per `read` call in order.
#[derive(Clone)]
pub enum MockStep {
    /// Block until one chunk arrives from the input, then continue.
    ReadInput,
    /// Declare a track and announce its format.
    DeclareTrack {
        id: u32,
        track_type: TrackType,
        format: Format,
    },
    /// Signal end of track discovery.
    EndTracks,
    /// Append one sample to a (declared) track.
    Sample {
        track_id: u32,
        track_type: TrackType,
        timestamp_us: i64,
        flags: u32,
        payload: Vec<u8>,
    },
    /// Report end of input.
    Finish,
}

/// After the script runs out, turn every input chunk into one sample.
#[derive(Clone)]
pub struct MockPassthrough {
    pub track_id: u32,
    pub track_type: TrackType,
    pub timestamp_step_us: i64,
    pub flags: u32,
}

/// Extractor whose behavior is a script plus an optional passthrough mode.
#[derive(Clone)]
pub struct MockExtractor {
    sniff_accept: bool,
    /// Bytes the sniffer peeks before deciding; lets tests exercise the
    /// EOF-skips-candidate rule.
    sniff_peek_len: usize,
    script: VecDeque<MockStep>,
    passthrough: Option<MockPassthrough>,
    next_timestamp_us: i64,
    output: Option<Arc<dyn ExtractorOutput>>,
    seeks: Arc<Mutex<Vec<i64>>>,
    released: Arc<AtomicBool>,
}

impl Default for MockExtractor {
    fn default() -> Self {
        MockExtractor {
            sniff_accept: true,
            sniff_peek_len: 0,
            script: VecDeque::new(),
            passthrough: None,
            next_timestamp_us: 0,
            output: None,
            seeks: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl MockExtractor {
    pub fn new() -> Self {
        MockExtractor::default()
    }

    pub fn with_step(mut self, step: MockStep) -> Self {
        self.script.push_back(step);
        self
    }

    pub fn with_passthrough(mut self, passthrough: MockPassthrough) -> Self {
        self.passthrough = Some(passthrough);
        self
    }

    pub fn with_sniff(mut self, accept: bool, peek_len: usize) -> Self {
        self.sniff_accept = accept;
        self.sniff_peek_len = peek_len;
        self
    }

    /// Shared handle to the recorded `seek` target timestamps.
    pub fn seek_targets(&self) -> Arc<Mutex<Vec<i64>>> {
        self.seeks.clone()
    }

    /// Shared handle observing whether `release` ran.
    pub fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn sniff(&mut self, input: &mut (dyn ExtractorInput + Send)) -> Result<bool> {
        if self.sniff_peek_len > 0 {
            let mut probe = vec![0u8; self.sniff_peek_len];
            input.peek(&mut probe).await?;
        }
        Ok(self.sniff_accept)
    }

    fn init(&mut self, output: Arc<dyn ExtractorOutput>) {
        self.output = Some(output);
    }

    async fn read(&mut self, input: &mut (dyn ExtractorInput + Send)) -> Result<ReadAction> {
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::UnsupportedFormat("extractor not initialized".to_owned()))?;

        if let Some(step) = self.script.pop_front() {
            match step {
                MockStep::ReadInput => {
                    let mut buf = [0u8; 2048];
                    match input.read(&mut buf).await {
                        Ok(0) => return Ok(ReadAction::EndOfInput),
                        Ok(_) => {}
                        Err(e) => {
                            // Idle input: the step has not happened yet.
                            self.script.push_front(MockStep::ReadInput);
                            return Err(e);
                        }
                    }
                }
                MockStep::DeclareTrack {
                    id,
                    track_type,
                    format,
                } => {
                    let queue = output.track(id, track_type).await;
                    queue.set_format(format).await;
                }
                MockStep::EndTracks => output.end_tracks().await,
                MockStep::Sample {
                    track_id,
                    track_type,
                    timestamp_us,
                    flags,
                    payload,
                } => {
                    let queue = output.track(track_id, track_type).await;
                    queue.append(timestamp_us, flags, &payload).await;
                }
                MockStep::Finish => return Ok(ReadAction::EndOfInput),
            }
            return Ok(ReadAction::Continue);
        }

        if let Some(passthrough) = self.passthrough.clone() {
            let mut buf = vec![0u8; 2048];
            let n = input.read(&mut buf).await?;
            if n == 0 {
                return Ok(ReadAction::EndOfInput);
            }
            let queue = output
                .track(passthrough.track_id, passthrough.track_type)
                .await;
            queue
                .append(self.next_timestamp_us, passthrough.flags, &buf[..n])
                .await;
            self.next_timestamp_us += passthrough.timestamp_step_us;
            return Ok(ReadAction::Continue);
        }

        // Nothing scripted: just drain.
        let mut buf = vec![0u8; 2048];
        if input.read(&mut buf).await? == 0 {
            return Ok(ReadAction::EndOfInput);
        }
        Ok(ReadAction::Continue)
    }

    fn seek(&mut self, _position: u64, time_us: i64) {
        self.seeks.lock().unwrap().push(time_us);
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out clones of a template extractor, recording which
/// kind was requested.
pub struct MockExtractorFactory {
    pub template: MockExtractor,
    pub raw_candidates: Vec<MockExtractor>,
    created: Arc<Mutex<Vec<String>>>,
}

impl MockExtractorFactory {
    pub fn new(template: MockExtractor) -> Self {
        MockExtractorFactory {
            template,
            raw_candidates: Vec::new(),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_raw_candidates(mut self, raw_candidates: Vec<MockExtractor>) -> Self {
        self.raw_candidates = raw_candidates;
        self
    }

    /// Shared handle to the log of requested extractor kinds.
    pub fn created_kinds(&self) -> Arc<Mutex<Vec<String>>> {
        self.created.clone()
    }

    fn record(&self, kind: &str) {
        self.created.lock().unwrap().push(kind.to_owned());
    }
}

impl ExtractorFactory for MockExtractorFactory {
    fn create_rtp_mp2t(&self, _flags: u32) -> Box<dyn Extractor + Send> {
        self.record("rtp-mp2t");
        Box::new(self.template.clone())
    }

    fn create_rtp(
        &self,
        _payload_format: &RtpPayloadFormat,
        _track_ids: &TrackIdGenerator,
    ) -> Box<dyn Extractor + Send> {
        self.record("rtp");
        Box::new(self.template.clone())
    }

    fn create_mp2t(&self, _flags: u32) -> Box<dyn Extractor + Send> {
        self.record("mp2t");
        Box::new(self.template.clone())
    }

    fn create_raw_candidates(&self) -> Vec<Box<dyn Extractor + Send>> {
        self.record("raw");
        self.raw_candidates
            .iter()
            .map(|c| Box::new(c.clone()) as Box<dyn Extractor + Send>)
            .collect()
    }
}
