//! In-memory doubles shared by the unit tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{GrayImage, Luma};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::camera_loop::{LoopSettings, PipelineContext};
use crate::clip::{ClipStore, ClipWriter};
use crate::database::{NewRecording, RecordingQuery, RecordingRecord, RecordingStore};
use crate::detector::{Detector, DetectorPool};
use crate::errors::{Result, VigilError};
use crate::finalizer::Finalizer;
use crate::frame::{BoundingBox, DetectionResult, Frame};
use crate::notifier::{BroadcastNotifier, Event};
use crate::processing::{ModeSwitch, ProcessingMode};
use crate::recorder::{RecorderContext, RecorderSettings};
use crate::source::{FrameSource, FrameStream};
use crate::transcoder::{output_path_for, Transcoder};

pub fn solid_jpeg(width: u32, height: u32, value: u8) -> Bytes {
    let image = GrayImage::from_pixel(width, height, Luma([value]));
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&image)
        .expect("encode test jpeg");
    Bytes::from(out)
}

pub fn test_jpeg() -> Bytes {
    static JPEG: OnceLock<Bytes> = OnceLock::new();
    JPEG.get_or_init(|| solid_jpeg(8, 8, 128)).clone()
}

pub fn test_frame(frame_id: u64) -> Frame {
    Frame::new(frame_id, test_jpeg())
}

fn person() -> DetectionResult {
    DetectionResult {
        label: "person".into(),
        confidence: 0.9,
        bbox: BoundingBox { xmin: 1.0, ymin: 1.0, xmax: 6.0, ymax: 6.0 },
    }
}

/// Records which worker served which camera
pub struct IndexedDetector {
    index: usize,
    calls: Arc<StdMutex<Vec<(usize, String)>>>,
}

impl IndexedDetector {
    pub fn new(index: usize, calls: Arc<StdMutex<Vec<(usize, String)>>>) -> Self {
        Self { index, calls }
    }
}

#[async_trait]
impl Detector for IndexedDetector {
    async fn detect(&mut self, _frame: &Frame, camera_id: &str, _frame_id: u64) -> Result<Vec<DetectionResult>> {
        self.calls.lock().unwrap().push((self.index, camera_id.to_string()));
        Ok(vec![person()])
    }
}

pub struct FailingDetector;

#[async_trait]
impl Detector for FailingDetector {
    async fn detect(&mut self, _frame: &Frame, _camera_id: &str, _frame_id: u64) -> Result<Vec<DetectionResult>> {
        Err(VigilError::detector("inference backend offline"))
    }
}

pub struct PanickingDetector;

#[async_trait]
impl Detector for PanickingDetector {
    async fn detect(&mut self, _frame: &Frame, _camera_id: &str, _frame_id: u64) -> Result<Vec<DetectionResult>> {
        panic!("detector crashed");
    }
}

type DetectionRule = Arc<dyn Fn(&str, u64) -> bool + Send + Sync>;

/// Reports one person whenever `rule(camera_id, frame_id)` holds
#[derive(Clone)]
pub struct PatternDetector {
    rule: DetectionRule,
}

impl PatternDetector {
    pub fn new(rule: impl Fn(&str, u64) -> bool + Send + Sync + 'static) -> Self {
        Self { rule: Arc::new(rule) }
    }

    pub fn always() -> Self {
        Self::new(|_, _| true)
    }

    pub fn never() -> Self {
        Self::new(|_, _| false)
    }
}

#[async_trait]
impl Detector for PatternDetector {
    async fn detect(&mut self, _frame: &Frame, camera_id: &str, frame_id: u64) -> Result<Vec<DetectionResult>> {
        if (self.rule)(camera_id, frame_id) {
            Ok(vec![person()])
        } else {
            Ok(Vec::new())
        }
    }
}

#[derive(Debug, Clone)]
pub struct StubFeed {
    gap: Duration,
    fail_after: Option<u64>,
    max_opens: Option<usize>,
}

impl StubFeed {
    /// A frame every `gap`, forever
    pub fn frames(gap: Duration) -> Self {
        Self { gap, fail_after: None, max_opens: None }
    }

    /// `count` good frames per connection, then every read fails
    pub fn failing_after(gap: Duration, count: u64) -> Self {
        Self { gap, fail_after: Some(count), max_opens: None }
    }

    /// Like `failing_after`, but the camera never comes back after the first connection
    pub fn single_connection(gap: Duration, count: u64) -> Self {
        Self { gap, fail_after: Some(count), max_opens: Some(1) }
    }
}

#[derive(Default)]
struct StubState {
    log: Vec<String>,
    opens: HashMap<String, usize>,
    active: HashMap<String, usize>,
    max_active: HashMap<String, usize>,
}

/// Frame source keyed by address; unknown addresses are unreachable
#[derive(Default)]
pub struct StubSource {
    feeds: HashMap<String, StubFeed>,
    state: Arc<StdMutex<StubState>>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, address: &str, feed: StubFeed) -> Self {
        self.feeds.insert(address.to_string(), feed);
        self
    }

    /// `open:<address>` / `close:<address>` in the order they happened
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn active_streams(&self, camera_id: &str) -> usize {
        self.state.lock().unwrap().active.get(camera_id).copied().unwrap_or(0)
    }

    pub fn max_concurrent_streams(&self, camera_id: &str) -> usize {
        self.state.lock().unwrap().max_active.get(camera_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl FrameSource for StubSource {
    async fn open(&self, camera_id: &str, address: &str) -> Result<Box<dyn FrameStream>> {
        let Some(feed) = self.feeds.get(address).cloned() else {
            return Err(VigilError::stream_unavailable(format!("no stub feed for {}", address)));
        };

        {
            let mut state = self.state.lock().unwrap();
            let opens = state.opens.entry(address.to_string()).or_insert(0);
            if feed.max_opens.is_some_and(|max| *opens >= max) {
                return Err(VigilError::stream_unavailable(format!("{} went offline", address)));
            }
            *opens += 1;
            state.log.push(format!("open:{}", address));
            let active = state.active.entry(camera_id.to_string()).or_insert(0);
            *active += 1;
            let now_active = *active;
            let max = state.max_active.entry(camera_id.to_string()).or_insert(0);
            *max = (*max).max(now_active);
        }

        Ok(Box::new(StubStream {
            camera_id: camera_id.to_string(),
            address: address.to_string(),
            feed,
            produced: 0,
            closed: false,
            state: self.state.clone(),
        }))
    }
}

struct StubStream {
    camera_id: String,
    address: String,
    feed: StubFeed,
    produced: u64,
    closed: bool,
    state: Arc<StdMutex<StubState>>,
}

impl StubStream {
    fn release(&mut self, log_close: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock().unwrap();
        if log_close {
            state.log.push(format!("close:{}", self.address));
        }
        if let Some(active) = state.active.get_mut(&self.camera_id) {
            *active = active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl FrameStream for StubStream {
    async fn next_frame(&mut self) -> Result<Bytes> {
        tokio::time::sleep(self.feed.gap).await;
        if self.feed.fail_after.is_some_and(|limit| self.produced >= limit) {
            return Err(VigilError::stream_unavailable("stub read failure"));
        }
        self.produced += 1;
        Ok(test_jpeg())
    }

    async fn close(&mut self) {
        self.release(true);
    }
}

impl Drop for StubStream {
    fn drop(&mut self) {
        self.release(false);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryClip {
    pub camera_id: String,
    pub path: PathBuf,
    pub frames: Vec<u64>,
    pub finished: bool,
    pub opened_at: Instant,
    pub finished_at: Option<Instant>,
}

/// Clip store that remembers frame ids instead of writing bytes
#[derive(Default)]
pub struct MemoryClipStore {
    clips: Arc<StdMutex<Vec<MemoryClip>>>,
    fail: bool,
    write_limit: Option<usize>,
}

impl MemoryClipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    /// Every clip accepts `limit` frames, then each write fails
    pub fn failing_writes_after(limit: usize) -> Self {
        Self { write_limit: Some(limit), ..Self::default() }
    }

    pub fn clips(&self) -> Vec<MemoryClip> {
        self.clips.lock().unwrap().clone()
    }

    fn find(&self, path: &Path) -> Option<MemoryClip> {
        self.clips.lock().unwrap().iter().find(|c| c.path == path).cloned()
    }

    pub fn frames(&self, path: &Path) -> Vec<u64> {
        self.find(path).map(|c| c.frames).unwrap_or_default()
    }

    pub fn is_finished(&self, path: &Path) -> bool {
        self.find(path).is_some_and(|c| c.finished)
    }
}

#[async_trait]
impl ClipStore for MemoryClipStore {
    async fn create(&self, camera_id: &str, _start_time: DateTime<Utc>) -> Result<Box<dyn ClipWriter>> {
        if self.fail {
            return Err(VigilError::recorder_io("disk full"));
        }
        let mut clips = self.clips.lock().unwrap();
        let index = clips.len();
        let path = PathBuf::from(format!("/memory/{}_{}.mjpeg", camera_id, index));
        clips.push(MemoryClip {
            camera_id: camera_id.to_string(),
            path: path.clone(),
            frames: Vec::new(),
            finished: false,
            opened_at: Instant::now(),
            finished_at: None,
        });
        Ok(Box::new(MemoryClipWriter {
            clips: self.clips.clone(),
            index,
            path,
            write_limit: self.write_limit,
        }))
    }
}

struct MemoryClipWriter {
    clips: Arc<StdMutex<Vec<MemoryClip>>>,
    index: usize,
    path: PathBuf,
    write_limit: Option<usize>,
}

#[async_trait]
impl ClipWriter for MemoryClipWriter {
    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut clips = self.clips.lock().unwrap();
        let clip = &mut clips[self.index];
        if self.write_limit.is_some_and(|limit| clip.frames.len() >= limit) {
            return Err(VigilError::recorder_io("no space left on device"));
        }
        clip.frames.push(frame.frame_id);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        let mut clips = self.clips.lock().unwrap();
        clips[self.index].finished = true;
        clips[self.index].finished_at = Some(Instant::now());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRecordingStore {
    records: StdMutex<Vec<RecordingRecord>>,
}

impl MemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recordings(&self) -> Vec<RecordingRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordingStore for MemoryRecordingStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn save_recording(&self, recording: &NewRecording) -> Result<i64> {
        let mut records = self.records.lock().unwrap();
        let id = records.len() as i64 + 1;
        records.push(RecordingRecord {
            id,
            camera_id: recording.camera_id.clone(),
            file_path: recording.file_path.clone(),
            start_time: recording.start_time,
            end_time: recording.end_time,
        });
        Ok(id)
    }

    async fn list_recordings(&self, query: &RecordingQuery) -> Result<Vec<RecordingRecord>> {
        Ok(self
            .recordings()
            .into_iter()
            .filter(|r| query.camera_id.as_ref().map_or(true, |id| &r.camera_id == id))
            .collect())
    }
}

pub struct FakeTranscoder {
    fail: bool,
}

impl FakeTranscoder {
    pub fn succeeding() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(&self, input: &Path) -> Result<PathBuf> {
        if self.fail {
            Err(VigilError::transcode("encoder missing"))
        } else {
            Ok(output_path_for(input))
        }
    }
}

pub struct FinalizerHarness {
    pub finalizer: Finalizer,
    pub store: Arc<MemoryRecordingStore>,
    pub notifier: BroadcastNotifier,
}

/// Finalizer without transcoding, persisting into memory
pub fn test_finalizer() -> (Finalizer, FinalizerHarness) {
    let store = Arc::new(MemoryRecordingStore::new());
    let notifier = BroadcastNotifier::new(64);
    let finalizer = Finalizer::new(None, store.clone(), Arc::new(notifier.clone()));
    let harness = FinalizerHarness {
        finalizer: finalizer.clone(),
        store,
        notifier,
    };
    (finalizer, harness)
}

pub fn test_settings() -> LoopSettings {
    LoopSettings {
        target_fps: 1.0,
        reconnect_interval: Duration::from_secs(1),
        max_failed_reads: 3,
        failed_read_backoff: Duration::from_secs(1),
        preview_interval: Duration::from_secs(1),
        absence_window: Duration::from_secs(30),
        start_threshold: 5,
        stop_threshold: 5,
        buffer_capacity: 30,
    }
}

pub struct TestPipeline {
    pub ctx: Arc<PipelineContext>,
    pub notifier: BroadcastNotifier,
    pub clips: Arc<MemoryClipStore>,
    pub recordings: Arc<MemoryRecordingStore>,
    pub finalizer: Finalizer,
}

/// Two-worker pipeline over in-memory clips and recordings, 30s minimum clips at 1 fps
pub fn test_pipeline<S>(source: Arc<S>, detector: PatternDetector, settings: LoopSettings) -> TestPipeline
where
    S: FrameSource + 'static,
{
    let notifier = BroadcastNotifier::new(4096);
    let clips = Arc::new(MemoryClipStore::new());
    let recordings = Arc::new(MemoryRecordingStore::new());
    let finalizer = Finalizer::new(None, recordings.clone(), Arc::new(notifier.clone()));

    let workers: Vec<Box<dyn Detector>> = vec![Box::new(detector.clone()), Box::new(detector)];
    let detectors = DetectorPool::new(workers).expect("detector pool");

    let ctx = Arc::new(PipelineContext {
        source,
        detectors: Arc::new(detectors),
        notifier: Arc::new(notifier.clone()),
        recorder: RecorderContext {
            clip_store: clips.clone(),
            finalizer: finalizer.clone(),
            settings: RecorderSettings {
                fps: 1.0,
                min_duration: Duration::from_secs(30),
                live_queue_size: 64,
            },
        },
        modes: ModeSwitch::new(ProcessingMode::Human),
        settings,
    });

    TestPipeline {
        ctx,
        notifier,
        clips,
        recordings,
        finalizer,
    }
}

/// Everything currently queued, without waiting
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return events,
        }
    }
}

/// Wait for the first event matching `predicate`, discarding the others
pub async fn next_matching<F>(rx: &mut broadcast::Receiver<Event>, predicate: F) -> Event
where
    F: Fn(&Event) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notifier closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for event")
}
