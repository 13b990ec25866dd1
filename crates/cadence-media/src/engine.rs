//! The decode engine: one thread per source orchestrating read, decode,
//! flush, loop, seek, and error recovery.
//!
//! # State machine
//!
//! ```text
//! open() → Loading
//!
//! source opened, streams selected        → HeaderReady
//! first video/audio output decoded       → Ready
//! steady-state decode loop               → Ready (self-loop)
//! fatal open failure / read-error cap    → Error    (terminal)
//! end of stream drained, looping off     → Finished
//! looping on, or a seek arrives          → Finished → Ready
//! ```
//!
//! The decode thread is the only writer into the frame and audio rings; it
//! never busy-spins, sleeping in bounded slices while waiting on
//! backpressure and re-checking the running flag and pending seeks on every
//! wake. Final resource teardown happens on the decode thread so slow
//! hardware shutdown never blocks the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audio_ring::{audio_ring, AudioConsumer, AudioProducer, AudioRingConfig, AudioRingControl};
use crate::clock::{PlayMode, SyncClock};
use crate::device_gate::{DeviceLease, DeviceRegistry};
use crate::frame::{FramePool, PlaneLayout, VideoFrame};
use crate::frame_ring::{FrameRing, MAX_CAPACITY};
use crate::seek::{SeekController, SeekDirection, SeekKind, SeekRequest};
use crate::source::{
    CaptureFormatProvider, DecodeOutput, MediaSource, OpenConfig, RawAudioBlock, RawVideoFrame,
    ReadOutcome, SeekTarget, SourceError, SourceFactory, SourceInfo,
};
use crate::sync_metrics::SyncMetrics;
use crate::timing::MediaTimestamp;

/// Lifecycle state of a decode engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// The source is being opened.
    Loading,
    /// Streams and codecs are open; geometry may still be unknown.
    HeaderReady,
    /// At least one frame or audio block has been decoded.
    Ready,
    /// End of stream reached with looping disabled. A seek or enabling
    /// looping resumes playback.
    Finished,
    /// Fatal failure; terminal until the source is re-opened.
    Error,
}

/// Tunable engine parameters. Defaults match typical file and capture
/// sources; tests tighten the waits.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Consecutive read errors (no successful read in between) before the
    /// engine gives up. Capture cards legitimately emit bursts of early
    /// errors, so this must not be small.
    pub read_error_cap: u32,
    /// Backwards-pts tolerance within one generation before a discontinuity
    /// is declared, in seconds.
    pub discontinuity_tolerance: f64,
    /// Sleep slice while waiting on ring/pool backpressure.
    pub backpressure_wait: Duration,
    /// Sleep after an EAGAIN-equivalent read.
    pub would_block_wait: Duration,
    /// Sleep between transient read-error retries.
    pub read_retry_wait: Duration,
    /// How long to contend for exclusive capture-device access.
    pub device_timeout: Duration,
    /// Audio buffer level below which the video ring grows instead of
    /// stalling the decode loop.
    pub audio_low_water_seconds: f64,
    /// Video-ahead-of-audio gap after which the audio track is assumed
    /// ended. Rolling: widened each time audio resumes after being declared
    /// ended.
    pub audio_end_gap: f64,
    /// Growth factor applied to `audio_end_gap` when audio resumes.
    pub audio_end_gap_growth: f64,
    /// Upper bound for the rolling `audio_end_gap`.
    pub audio_end_gap_max: f64,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            read_error_cap: 50,
            discontinuity_tolerance: 0.1,
            backpressure_wait: Duration::from_millis(10),
            would_block_wait: Duration::from_millis(2),
            read_retry_wait: Duration::from_millis(5),
            device_timeout: Duration::from_secs(2),
            audio_low_water_seconds: 0.1,
            audio_end_gap: 1.5,
            audio_end_gap_growth: 1.5,
            audio_end_gap_max: 6.0,
        }
    }
}

/// Collaborators injected at open time.
pub struct EngineOptions {
    pub tuning: EngineTuning,
    /// Exclusivity registry for capture devices; the shared default is used
    /// when absent.
    pub registry: Option<Arc<DeviceRegistry>>,
    /// Capture-format negotiation, consulted once at open for capture
    /// sources.
    pub capture_formats: Option<Box<dyn CaptureFormatProvider>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tuning: EngineTuning::default(),
            registry: None,
            capture_formats: None,
        }
    }
}

/// Occupancy of the decoded buffers, for UI and adaptive consumers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferState {
    /// Decoded video frames ready for display.
    pub video_frames: usize,
    /// Current video ring capacity in frames.
    pub video_capacity: usize,
    /// Decoded audio buffered, in seconds.
    pub audio_seconds: f64,
    /// Audio ring capacity, in seconds.
    pub audio_capacity_seconds: f64,
}

/// Result of a renderer frame pull.
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// The frame to display; `None` before anything was decoded.
    pub frame: Option<VideoFrame>,
    /// True when the consumer had to fall back to a stale frame because the
    /// ring ran dry (buffer underrun).
    pub underrun: bool,
}

enum EngineCommand {
    /// Nudges the decode thread out of a timed wait.
    Wake,
    Close,
}

struct EngineShared {
    state: Mutex<EngineState>,
    last_error: Mutex<Option<SourceError>>,
    running: Arc<AtomicBool>,
    closed: AtomicBool,
    /// Generation of the content currently being published.
    generation: AtomicU64,
    duration: Mutex<Option<f64>>,
    dimensions: Mutex<Option<(u32, u32)>>,
    frame_rate: Mutex<Option<f64>>,
    looping: AtomicBool,
    /// Real-time seeking mode: no buffering or A/V sync, newest frame wins.
    realtime: AtomicBool,
    /// Explicit resync requested: bump the generation at the current
    /// position, invalidating everything buffered.
    resync: AtomicBool,
    clock: Arc<SyncClock>,
    ring: Arc<FrameRing>,
    pool: FramePool,
    audio_ctl: AudioRingControl,
    seek: SeekController,
    metrics: SyncMetrics,
}

impl EngineShared {
    fn set_state(&self, next: EngineState, source: &str) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::info!(from = ?*state, to = ?next, source, "engine state");
            *state = next;
        }
    }
}

/// Entry point: opens a source on a fresh decode thread.
pub struct DecodeEngine;

impl DecodeEngine {
    /// Spawns the decode thread for `config` and returns its control handle
    /// immediately; the engine is observable in `Loading` state until the
    /// source opens.
    pub fn open(
        config: OpenConfig,
        factory: impl SourceFactory + 'static,
        options: EngineOptions,
    ) -> EngineHandle {
        let clock = Arc::new(SyncClock::new());
        clock.set_play_mode(config.play_mode);

        let ring = Arc::new(FrameRing::new(config.video_buffer_frames));
        // Slack beyond the ring ceiling covers the frame being copied plus
        // handles still held by the renderer or the decoding library.
        let pool = FramePool::new(MAX_CAPACITY + 8);
        let (audio_producer, audio_consumer, audio_ctl) = audio_ring(
            AudioRingConfig::for_target_seconds(
                config.audio_buffer_seconds,
                config.audio_sample_rate,
                config.audio_channels,
            ),
            Arc::clone(&clock),
        );

        let running = Arc::new(AtomicBool::new(true));
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(EngineShared {
            state: Mutex::new(EngineState::Loading),
            last_error: Mutex::new(None),
            running: Arc::clone(&running),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            duration: Mutex::new(None),
            dimensions: Mutex::new(None),
            frame_rate: Mutex::new(None),
            looping: AtomicBool::new(config.looping),
            realtime: AtomicBool::new(false),
            resync: AtomicBool::new(false),
            clock: Arc::clone(&clock),
            ring,
            pool,
            audio_ctl: audio_ctl.clone(),
            seek: SeekController::new(0),
            metrics: SyncMetrics::new(),
        });

        let registry = options
            .registry
            .unwrap_or_else(|| Arc::clone(DeviceRegistry::global()));

        let worker = DecodeWorker {
            shared: Arc::clone(&shared),
            config,
            factory: Box::new(factory),
            command_rx,
            audio: audio_producer,
            tuning: options.tuning,
            registry,
            capture_formats: options.capture_formats,
            interrupt: running,
            lease: None,
            loop_offset: 0.0,
            last_video_pts: None,
            last_audio_pts: None,
            effective_start: None,
            measured_end: 0.0,
            accurate_target: None,
            read_errors: 0,
            frame_index: 0,
            has_video: false,
            has_audio: false,
            audio_ended: false,
            audio_end_gap: 0.0,
            produced_any: false,
        };

        let thread = thread::spawn(move || worker.run());

        EngineHandle {
            shared,
            command_tx,
            thread: Mutex::new(Some(thread)),
            audio_output: Mutex::new(Some(AudioOutput {
                consumer: audio_consumer,
                control: audio_ctl,
                clock,
            })),
        }
    }
}

/// Control surface of a running engine. Dropping the handle closes the
/// engine and joins its thread.
pub struct EngineHandle {
    shared: Arc<EngineShared>,
    command_tx: Sender<EngineCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
    audio_output: Mutex<Option<AudioOutput>>,
}

impl EngineHandle {
    fn wake(&self) {
        let _ = self.command_tx.send(EngineCommand::Wake);
    }

    /// Files a seek request (coalescing with any pending one) and returns
    /// the generation id allocated for it. Content carrying that generation
    /// or newer means the seek has been applied. Callable from any thread.
    pub fn seek(&self, request: SeekRequest) -> u64 {
        let generation = self.shared.seek.request(request);
        self.wake();
        generation
    }

    /// Switches the presentation clock between playing and paused.
    pub fn set_play_mode(&self, mode: PlayMode) {
        self.shared.clock.set_play_mode(mode);
        self.wake();
    }

    /// Enables or disables looping at end of stream.
    pub fn set_looping(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
        self.wake();
    }

    /// Real-time seeking mode for scrub-preview interactions: buffering and
    /// A/V sync are bypassed and the newest decoded frame is always shown.
    pub fn set_realtime_seeking(&self, enabled: bool) {
        self.shared.realtime.store(enabled, Ordering::Release);
        self.wake();
    }

    /// Forces a generation bump at the current position, invalidating every
    /// buffered frame and audio block without repositioning the source.
    pub fn resync(&self) {
        self.shared.resync.store(true, Ordering::Release);
        self.wake();
    }

    /// Sets audio volume in percent (0-100). Applied at the next callback.
    pub fn set_volume(&self, percent: u32) {
        self.shared.audio_ctl.set_volume(percent);
    }

    /// Mutes or unmutes audio without changing the volume.
    pub fn set_muted(&self, muted: bool) {
        self.shared.audio_ctl.set_muted(muted);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.shared.state.lock()
    }

    /// The error that sent the engine into [`EngineState::Error`], if any.
    pub fn last_error(&self) -> Option<SourceError> {
        self.shared.last_error.lock().clone()
    }

    /// Stream duration in seconds: header-reported, or measured at end of
    /// stream for sources without a reliable header.
    pub fn duration(&self) -> Option<f64> {
        *self.shared.duration.lock()
    }

    /// Video geometry, once known.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *self.shared.dimensions.lock()
    }

    /// Nominal video frame rate, once known.
    pub fn frame_rate(&self) -> Option<f64> {
        *self.shared.frame_rate.lock()
    }

    /// Generation of the content currently being published.
    pub fn current_generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Drift/underrun instrumentation shared with the renderer path.
    pub fn sync_metrics(&self) -> SyncMetrics {
        self.shared.metrics.clone()
    }

    /// Creates a renderer-facing pull interface.
    pub fn video_output(&self) -> VideoOutput {
        VideoOutput {
            shared: Arc::clone(&self.shared),
            last_frame: Mutex::new(None),
        }
    }

    /// Takes the audio-graph-facing pull interface. Single consumer: returns
    /// `None` after the first call.
    pub fn take_audio_output(&self) -> Option<AudioOutput> {
        self.audio_output.lock().take()
    }

    /// Stops the engine and joins the decode thread. Idempotent and safe to
    /// call from any thread; the decode thread performs the actual source
    /// teardown.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.ring.stop();
        let _ = self.command_tx.send(EngineCommand::Close);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let _ = thread.join();
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Renderer-facing view: non-blocking frame selection against the sync
/// clock. The renderer never waits; when no fresh frame is ready it reuses
/// the previous one and the underrun flag reports the fallback.
pub struct VideoOutput {
    shared: Arc<EngineShared>,
    last_frame: Mutex<Option<VideoFrame>>,
}

impl VideoOutput {
    /// Picks the frame to display at presentation wall-clock time `wall`.
    ///
    /// Frames behind the clock are skipped, a frame ahead of the clock holds
    /// the previous one on screen, and stale-generation frames are discarded
    /// unseen.
    pub fn get_frame(&self, wall: Instant) -> FrameResult {
        let ring = &self.shared.ring;

        if self.shared.realtime.load(Ordering::Acquire) {
            // Scrub preview: drain to the newest decoded frame, no sync.
            let mut newest = None;
            while let Some(frame) = ring.consume() {
                newest = Some(frame);
            }
            let mut last = self.last_frame.lock();
            if let Some(frame) = newest {
                *last = Some(frame);
            }
            return FrameResult {
                frame: last.clone(),
                underrun: false,
            };
        }

        let target = self.shared.clock.media_time(wall);
        let mut selected = None;
        loop {
            let Some(frame) = ring.peek(0) else { break };
            if frame.ts.generation < target.generation {
                // Stale generation: never displayed, even though it is
                // still physically present in the ring.
                ring.consume();
                continue;
            }
            if frame.ts.generation == target.generation && frame.ts.pts <= target.pts {
                selected = ring.consume();
                continue;
            }
            break;
        }

        let mut last = self.last_frame.lock();
        let mut underrun = false;
        match selected {
            Some(frame) => {
                self.shared.metrics.record_frame(frame.ts.pts, target.pts);
                *last = Some(frame);
            }
            None => {
                let have_current = last
                    .as_ref()
                    .map(|f| f.ts.generation >= target.generation)
                    .unwrap_or(false);
                if !have_current
                    && self.shared.clock.is_playing()
                    && !ring.is_eos()
                {
                    underrun = true;
                    self.shared.metrics.record_underrun();
                }
            }
        }
        FrameResult {
            frame: last.clone(),
            underrun,
        }
    }

    /// Neighbor lookup in the ready window: the frame `offset` positions
    /// after `frame` (by frame index, same generation), without consuming.
    pub fn peek(&self, frame: &VideoFrame, offset: i64) -> Option<VideoFrame> {
        let wanted = frame.frame_index as i64 + offset;
        if wanted < 0 {
            return None;
        }
        let mut i = 0;
        while let Some(candidate) = self.shared.ring.peek(i) {
            if candidate.frame_index as i64 == wanted
                && candidate.ts.generation == frame.ts.generation
            {
                return Some(candidate);
            }
            i += 1;
        }
        None
    }

    /// True once end of stream is reached and every buffered frame has been
    /// displayed.
    pub fn is_end_of_stream(&self) -> bool {
        self.shared.ring.is_eos() && self.shared.ring.ready_count() == 0
    }

    /// Occupancy of the decoded video and audio buffers.
    pub fn buffer_state(&self) -> BufferState {
        BufferState {
            video_frames: self.shared.ring.ready_count(),
            video_capacity: self.shared.ring.capacity(),
            audio_seconds: self.shared.audio_ctl.buffered_seconds(),
            audio_capacity_seconds: self.shared.audio_ctl.capacity_seconds(),
        }
    }
}

/// Audio-graph-facing pull interface. Owned by whoever runs the real-time
/// callback; `process` never blocks.
pub struct AudioOutput {
    consumer: AudioConsumer,
    control: AudioRingControl,
    clock: Arc<SyncClock>,
}

impl AudioOutput {
    /// Fills `out` with up to `frames` frames of decoded audio at the
    /// current gain. See [`AudioConsumer::process`].
    pub fn process(
        &mut self,
        out: &mut [&mut [f32]],
        frames: usize,
        callback_time: Instant,
    ) -> usize {
        self.consumer.process(out, frames, callback_time)
    }

    /// Maps a wall-clock timestamp to media time via the shared sync clock.
    pub fn to_media_time(&self, wall: Instant) -> MediaTimestamp {
        self.clock.media_time(wall)
    }

    /// Sets audio volume in percent (0-100).
    pub fn set_volume(&self, percent: u32) {
        self.control.set_volume(percent);
    }

    /// Current volume in percent.
    pub fn volume(&self) -> u32 {
        self.control.volume()
    }

    /// Mutes or unmutes output.
    pub fn set_muted(&self, muted: bool) {
        self.control.set_muted(muted);
    }

    /// Returns true while muted.
    pub fn is_muted(&self) -> bool {
        self.control.is_muted()
    }
}

// ============================================================================
// Decode thread
// ============================================================================

struct DecodeWorker {
    shared: Arc<EngineShared>,
    config: OpenConfig,
    factory: Box<dyn SourceFactory>,
    command_rx: Receiver<EngineCommand>,
    audio: AudioProducer,
    tuning: EngineTuning,
    registry: Arc<DeviceRegistry>,
    capture_formats: Option<Box<dyn CaptureFormatProvider>>,
    /// Shared with the source's blocking I/O so shutdown aborts it.
    interrupt: Arc<AtomicBool>,
    lease: Option<DeviceLease>,

    /// Added to every published pts so presentation time stays monotonic
    /// across loop boundaries.
    loop_offset: f64,
    /// Last published video pts (loop offset included).
    last_video_pts: Option<f64>,
    /// End pts of the last published audio block (loop offset included).
    last_audio_pts: Option<f64>,
    /// Lowest first valid pts seen, in the source's own timeline.
    effective_start: Option<f64>,
    /// Highest pts seen in the source's own timeline this loop iteration.
    measured_end: f64,
    /// Accurate-seek suppression target, in the source's own timeline.
    accurate_target: Option<f64>,
    read_errors: u32,
    frame_index: u64,
    has_video: bool,
    has_audio: bool,
    audio_ended: bool,
    /// Rolling audio-end threshold, seeded from tuning at open.
    audio_end_gap: f64,
    produced_any: bool,
}

impl DecodeWorker {
    fn run(mut self) {
        self.audio_end_gap = self.tuning.audio_end_gap;

        let mut source = match self.open_source() {
            Ok(source) => source,
            Err(error) => {
                self.fail(error);
                return;
            }
        };

        if let Some(request) = self.config.initial_seek {
            self.shared.seek.request(request);
        }

        self.decode_loop(&mut source);

        // Teardown on the decode thread: slow hardware close must not run on
        // the caller's thread.
        drop(source);
        self.lease.take();
        tracing::debug!(source = %self.config.source, "decode thread exited");
    }

    fn running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn set_state(&self, next: EngineState) {
        self.shared.set_state(next, &self.config.source);
    }

    fn fail(&self, error: SourceError) {
        tracing::error!(source = %self.config.source, %error, "fatal engine error");
        *self.shared.last_error.lock() = Some(error);
        self.set_state(EngineState::Error);
    }

    fn open_source(&mut self) -> Result<Box<dyn MediaSource>, SourceError> {
        self.set_state(EngineState::Loading);

        if self.config.capture_device {
            let key = self.config.source.clone();
            match self.registry.acquire(&key, self.tuning.device_timeout) {
                Some(lease) => self.lease = Some(lease),
                None => return Err(SourceError::DeviceBusy(key)),
            }
            if self.config.capture_format.is_none() {
                if let Some(provider) = &self.capture_formats {
                    self.config.capture_format = provider.choose_format(&key);
                    if let Some(format) = &self.config.capture_format {
                        tracing::info!(source = %key, ?format, "capture format negotiated");
                    }
                }
            }
        }

        let mut source = self.factory.open(&self.config)?;
        source.set_interrupt(Arc::clone(&self.interrupt));

        let info = source.info();
        self.has_video = info.has_video && self.config.enable_video;
        self.has_audio = info.has_audio && self.config.enable_audio;
        if !self.has_video && !self.has_audio {
            return Err(SourceError::NoStream(self.config.source.clone()));
        }
        self.publish_info(&info);
        self.set_state(EngineState::HeaderReady);
        Ok(source)
    }

    fn publish_info(&self, info: &SourceInfo) {
        if let Some(duration) = info.duration {
            *self.shared.duration.lock() = Some(duration);
        }
        if info.width > 0 && info.height > 0 {
            *self.shared.dimensions.lock() = Some((info.width, info.height));
        }
        if info.frame_rate > 0.0 {
            *self.shared.frame_rate.lock() = Some(info.frame_rate);
        }
    }

    fn decode_loop(&mut self, source: &mut Box<dyn MediaSource>) {
        loop {
            if !self.running() {
                return;
            }
            self.drain_commands();

            if let Some((request, generation)) = self.shared.seek.take() {
                if let Err(error) = self.apply_seek(source, request, generation) {
                    self.fail(error);
                    return;
                }
                continue;
            }

            if self.shared.resync.swap(false, Ordering::AcqRel) {
                let position = self.last_video_pts.or(self.last_audio_pts).unwrap_or(0.0);
                let generation = self.bump_generation(position);
                tracing::debug!(generation, position, "explicit resync");
                continue;
            }

            self.maybe_grow_ring();

            match source.read_packet() {
                Ok(ReadOutcome::Packet(packet)) => {
                    self.read_errors = 0;
                    match source.decode(packet) {
                        Ok(output) => {
                            self.publish_output(output);
                        }
                        Err(error) => {
                            // One bad packet must not abort playback.
                            tracing::warn!(
                                source = %self.config.source,
                                %error,
                                "packet decode failed, packet dropped"
                            );
                        }
                    }
                }
                Ok(ReadOutcome::WouldBlock) => {
                    thread::sleep(self.tuning.would_block_wait);
                }
                Ok(ReadOutcome::EndOfStream) => {
                    self.drain_delayed(source);
                    if !self.finish_or_loop(source) {
                        return;
                    }
                }
                Err(SourceError::Read(message)) => {
                    self.read_errors += 1;
                    if self.read_errors >= self.tuning.read_error_cap {
                        self.fail(SourceError::Read(message));
                        return;
                    }
                    tracing::trace!(
                        consecutive = self.read_errors,
                        cap = self.tuning.read_error_cap,
                        "transient read error, retrying"
                    );
                    thread::sleep(self.tuning.read_retry_wait);
                }
                Err(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(command) = self.command_rx.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Wake => {}
            EngineCommand::Close => {
                self.shared.running.store(false, Ordering::Release);
            }
        }
    }

    /// Starvation valve: audio running dry is more perceptually severe than
    /// a slightly larger video buffer, so grow the video ring instead of
    /// stalling behind it.
    fn maybe_grow_ring(&self) {
        if !self.has_audio || self.audio_ended {
            return;
        }
        let ring = &self.shared.ring;
        if ring.ready_count() < ring.capacity() {
            return;
        }
        let buffered = self.shared.audio_ctl.buffered_seconds();
        if buffered < self.tuning.audio_low_water_seconds && ring.grow() {
            tracing::debug!(
                capacity = ring.capacity(),
                audio_buffered = buffered,
                "grew video ring to avoid audio starvation"
            );
        }
    }

    fn publish_output(&mut self, output: DecodeOutput) {
        for frame in output.video {
            if self.has_video && !self.publish_video(frame) {
                return;
            }
        }
        for block in output.audio {
            if self.has_audio && !self.publish_audio(block) {
                return;
            }
        }
    }

    fn note_start(&mut self, pts: f64) {
        self.effective_start = Some(match self.effective_start {
            Some(start) => start.min(pts),
            None => pts,
        });
    }

    fn mark_ready(&mut self) {
        if !self.produced_any {
            self.produced_any = true;
            self.set_state(EngineState::Ready);
        }
    }

    /// Waits out one backpressure slice. False means stop waiting: shutdown
    /// or a pending seek that will invalidate the item being published.
    fn pause_for_backpressure(&self) -> bool {
        if !self.running() || self.shared.seek.is_pending() {
            return false;
        }
        thread::sleep(self.tuning.backpressure_wait);
        self.running() && !self.shared.seek.is_pending()
    }

    fn wait_for_ring_space(&self) -> bool {
        if !self.running() || self.shared.seek.is_pending() {
            return false;
        }
        // The starvation valve applies here too: a frame blocked on a full
        // ring must not keep audio from being decoded.
        self.maybe_grow_ring();
        self.shared.ring.wait_for_space(self.tuning.backpressure_wait);
        self.running() && !self.shared.seek.is_pending()
    }

    /// Bumps the generation outside the seek path (stream discontinuity,
    /// resync) and invalidates everything buffered.
    fn bump_generation(&mut self, start_pts: f64) -> u64 {
        let generation = self.shared.seek.allocate_generation();
        self.shared.generation.store(generation, Ordering::Release);
        self.shared.ring.flush();
        self.shared.audio_ctl.flush(generation);
        self.shared.clock.set_generation(generation, start_pts);
        self.last_video_pts = None;
        self.last_audio_pts = None;
        generation
    }

    fn publish_video(&mut self, raw: RawVideoFrame) -> bool {
        let source_pts = raw.pts;
        self.note_start(source_pts);
        self.measured_end = self.measured_end.max(source_pts);

        if let Some(target) = self.accurate_target {
            if source_pts + 1e-6 < target {
                // Accurate seek: decoded but suppressed until the target.
                return true;
            }
            self.accurate_target = None;
        }

        let pts = source_pts + self.loop_offset;
        let mut generation = self.shared.generation.load(Ordering::Acquire);
        if let Some(last) = self.last_video_pts {
            if pts + self.tuning.discontinuity_tolerance < last {
                generation = self.bump_generation(pts);
                tracing::warn!(
                    source = %self.config.source,
                    pts,
                    previous = last,
                    generation,
                    "stream discontinuity, generation bumped"
                );
            }
        }

        let mut layouts = Vec::with_capacity(raw.planes.len());
        let mut total = 0usize;
        for (stride, data) in &raw.planes {
            let stride = (*stride).max(1);
            layouts.push(PlaneLayout {
                offset: total,
                stride,
                rows: data.len() / stride,
            });
            total += data.len();
        }

        let mut buffer = loop {
            match self.shared.pool.acquire(total) {
                Some(buffer) => break buffer,
                None => {
                    if !self.pause_for_backpressure() {
                        return false;
                    }
                }
            }
        };
        {
            let bytes = buffer.as_mut_slice();
            let mut offset = 0usize;
            for (_, data) in &raw.planes {
                bytes[offset..offset + data.len()].copy_from_slice(data);
                offset += data.len();
            }
        }

        if self.shared.dimensions.lock().is_none() && raw.width > 0 && raw.height > 0 {
            *self.shared.dimensions.lock() = Some((raw.width, raw.height));
        }

        let mut frame = VideoFrame::new(
            MediaTimestamp::new(pts, generation),
            self.frame_index,
            raw.width,
            raw.height,
            raw.format,
            layouts,
            buffer.freeze(),
        );
        self.frame_index += 1;

        loop {
            match self.shared.ring.try_push(frame) {
                Ok(()) => break,
                Err(rejected) => {
                    frame = rejected;
                    if self.shared.realtime.load(Ordering::Acquire) {
                        // Newest frame wins in scrub mode: make room by
                        // dropping the oldest instead of waiting.
                        if self.shared.ring.consume().is_some() {
                            continue;
                        }
                    }
                    if !self.wait_for_ring_space() {
                        return false;
                    }
                }
            }
        }

        self.last_video_pts = Some(pts);
        self.mark_ready();

        // Without a (live) audio track the first published frame of each
        // generation starts the wall-clock extrapolation.
        if (!self.has_audio || self.audio_ended) && !self.shared.clock.is_anchored() {
            self.shared.clock.anchor(pts, Instant::now(), generation);
        }
        self.update_audio_end_state();
        true
    }

    fn publish_audio(&mut self, raw: RawAudioBlock) -> bool {
        let Some(first) = raw.channels.first() else {
            return true;
        };
        let frames = first.len();
        if frames == 0 {
            return true;
        }
        let rate = self.shared.audio_ctl.sample_rate() as f64;
        let mut source_pts = raw.pts;
        self.note_start(source_pts);
        let end_pts = source_pts + frames as f64 / rate;
        self.measured_end = self.measured_end.max(end_pts);

        let mut skip = 0usize;
        if let Some(target) = self.accurate_target {
            if end_pts <= target {
                return true;
            }
            if source_pts < target {
                // Trim at sample granularity instead of dropping the block.
                skip = (((target - source_pts) * rate) as usize).min(frames);
                source_pts += skip as f64 / rate;
            }
            if !self.has_video {
                // No video frame will clear the filter; audio has reached
                // the target.
                self.accurate_target = None;
            }
        }

        let generation = self.shared.generation.load(Ordering::Acquire);
        let pts = source_pts + self.loop_offset;
        // Runs longer than the ring can ever hold are split so each piece
        // fits under backpressure.
        let max_run = self.audio.max_run_frames();
        let total_frames = frames - skip;
        let mut offset = 0usize;
        while offset < total_frames {
            let take = (total_frames - offset).min(max_run);
            let chunk: Vec<&[f32]> = raw
                .channels
                .iter()
                .map(|c| &c[skip + offset..skip + offset + take])
                .collect();
            let chunk_pts = pts + offset as f64 / rate;
            loop {
                if self.audio.try_push(chunk_pts, generation, &chunk) {
                    break;
                }
                if !self.pause_for_backpressure() {
                    return false;
                }
            }
            offset += take;
        }

        self.last_audio_pts = Some(end_pts + self.loop_offset);
        self.mark_ready();
        self.update_audio_end_state();
        true
    }

    /// Rolling audio-end inference: a growing video-over-audio lead with no
    /// audio progress means the audio track ran out before the video did.
    /// The threshold widens each time audio resumes so borderline streams
    /// stop flapping.
    fn update_audio_end_state(&mut self) {
        if !self.has_audio {
            return;
        }
        let (Some(video), Some(audio)) = (self.last_video_pts, self.last_audio_pts) else {
            return;
        };
        let gap = video - audio;
        if !self.audio_ended && gap > self.audio_end_gap {
            self.audio_ended = true;
            tracing::debug!(
                gap,
                threshold = self.audio_end_gap,
                "audio track assumed ended"
            );
        } else if self.audio_ended && gap <= self.audio_end_gap * 0.5 {
            self.audio_ended = false;
            self.audio_end_gap =
                (self.audio_end_gap * self.tuning.audio_end_gap_growth).min(self.tuning.audio_end_gap_max);
            tracing::debug!(widened_threshold = self.audio_end_gap, "audio resumed");
        }
    }

    /// Flush phase: codecs with internal delay keep producing after end of
    /// input; drain them until dry.
    fn drain_delayed(&mut self, source: &mut Box<dyn MediaSource>) {
        loop {
            if !self.running() || self.shared.seek.is_pending() {
                return;
            }
            match source.drain() {
                Ok(output) if output.is_empty() => return,
                Ok(output) => self.publish_output(output),
                Err(error) => {
                    tracing::warn!(source = %self.config.source, %error, "drain failed");
                    return;
                }
            }
        }
    }

    /// Handles true end of stream: loop back, or enter `Finished` and wait
    /// for a seek / looping / shutdown. Returns false when the thread should
    /// exit.
    fn finish_or_loop(&mut self, source: &mut Box<dyn MediaSource>) -> bool {
        let start = self.effective_start.unwrap_or(0.0);
        let frame_period = match *self.shared.frame_rate.lock() {
            Some(rate) if rate > 0.0 => 1.0 / rate,
            _ => 0.0,
        };
        let mut measured = (self.measured_end - start).max(0.0);
        if self.has_video {
            // The final frame is displayed for one frame period.
            measured += frame_period;
        }
        if self.shared.duration.lock().is_none() && measured > 0.0 {
            *self.shared.duration.lock() = Some(measured);
        }

        if self.shared.looping.load(Ordering::Acquire) {
            return self.rewind_for_loop(source, measured);
        }

        self.shared.ring.set_eos();
        self.set_state(EngineState::Finished);

        loop {
            if !self.running() {
                return false;
            }
            if self.shared.seek.is_pending() {
                // The main loop applies it and decoding resumes.
                return true;
            }
            if self.shared.looping.load(Ordering::Acquire) {
                self.shared.ring.clear_eos();
                return self.rewind_for_loop(source, measured);
            }
            match self.command_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(command) => self.handle_command(command),
                Err(_) => {}
            }
        }
    }

    /// Looping is not a seek: the generation is unchanged and the measured
    /// duration is added to the loop offset so presentation time keeps
    /// increasing across the boundary.
    fn rewind_for_loop(&mut self, source: &mut Box<dyn MediaSource>, measured: f64) -> bool {
        self.loop_offset += measured.max(0.0);
        tracing::debug!(
            source = %self.config.source,
            loop_offset = self.loop_offset,
            "end of stream, looping"
        );

        let rewound = source.info().seekable && source.seek(SeekTarget::Start).is_ok();
        if !rewound {
            // Sources that cannot rewind get a full close+reopen.
            if let Err(error) = self.reopen(source) {
                self.fail(error);
                return false;
            }
        }
        self.shared.ring.clear_eos();
        self.measured_end = self.effective_start.unwrap_or(0.0);
        self.set_state(EngineState::Ready);
        true
    }

    fn reopen(&mut self, source: &mut Box<dyn MediaSource>) -> Result<(), SourceError> {
        tracing::debug!(source = %self.config.source, "reopening source");
        let mut fresh = self.factory.open(&self.config)?;
        fresh.set_interrupt(Arc::clone(&self.interrupt));
        *source = fresh;
        Ok(())
    }

    fn apply_seek(
        &mut self,
        source: &mut Box<dyn MediaSource>,
        request: SeekRequest,
        generation: u64,
    ) -> Result<(), SourceError> {
        let info = source.info();
        let start = info.start_time.unwrap_or(0.0);

        let target_seconds = match request.kind {
            SeekKind::Seconds => request.value,
            SeekKind::Fraction => {
                let duration = info.duration.or(*self.shared.duration.lock());
                match duration {
                    Some(duration) => request.value.clamp(0.0, 1.0) * duration,
                    None => {
                        tracing::warn!("fraction seek without known duration, seeking to start");
                        start
                    }
                }
            }
            SeekKind::Bytes => 0.0,
        };

        let target = match request.kind {
            SeekKind::Bytes => SeekTarget::Bytes {
                target: request.value.max(0.0) as u64,
            },
            _ if target_seconds <= start + 1e-9 => SeekTarget::Start,
            _ => {
                let (min, max) = match request.direction {
                    SeekDirection::Backward => (None, Some(target_seconds)),
                    SeekDirection::Forward => (Some(target_seconds), None),
                    SeekDirection::Any => (None, None),
                };
                SeekTarget::Seconds {
                    target: target_seconds,
                    min,
                    max,
                }
            }
        };

        let result = if info.seekable {
            source.seek(target)
        } else {
            Err(SourceError::Seek("source is not seekable".into()))
        };
        if let Err(error) = result {
            if matches!(target, SeekTarget::Start) {
                // Seek-to-beginning falls back to a full reopen.
                self.reopen(source)?;
            } else {
                tracing::error!(source = %self.config.source, %error, "seek not applied");
            }
        }

        // The generation moves forward regardless: everything buffered
        // before the seek must never be displayed or played.
        self.shared.generation.store(generation, Ordering::Release);
        self.shared.ring.flush();
        self.shared.audio_ctl.flush(generation);
        let clock_start = match request.kind {
            SeekKind::Bytes => 0.0,
            _ => target_seconds.max(start),
        };
        self.shared.clock.set_generation(generation, clock_start);

        self.accurate_target = (request.accurate && !matches!(request.kind, SeekKind::Bytes))
            .then_some(target_seconds);
        self.loop_offset = 0.0;
        self.last_video_pts = None;
        self.last_audio_pts = None;
        self.read_errors = 0;

        if *self.shared.state.lock() == EngineState::Finished {
            self.set_state(if self.produced_any {
                EngineState::Ready
            } else {
                EngineState::HeaderReady
            });
        }
        tracing::debug!(
            source = %self.config.source,
            generation,
            ?target,
            accurate = request.accurate,
            "seek applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::collections::VecDeque;

    #[derive(Clone)]
    enum Ev {
        Frame(f64),
        ReadError,
        Block,
    }

    struct ScriptSource {
        events: VecDeque<Ev>,
        pending: Option<f64>,
        info: SourceInfo,
    }

    impl ScriptSource {
        fn video(events: Vec<Ev>) -> Self {
            Self {
                events: events.into(),
                pending: None,
                info: SourceInfo {
                    frame_rate: 30.0,
                    width: 2,
                    height: 2,
                    pixel_format: Some(PixelFormat::Rgba),
                    has_video: true,
                    seekable: true,
                    start_time: Some(0.0),
                    ..Default::default()
                },
            }
        }
    }

    impl MediaSource for ScriptSource {
        fn info(&self) -> SourceInfo {
            self.info.clone()
        }

        fn read_packet(&mut self) -> Result<ReadOutcome, SourceError> {
            match self.events.pop_front() {
                Some(Ev::Frame(pts)) => {
                    self.pending = Some(pts);
                    Ok(ReadOutcome::Packet(crate::source::Packet { handle: 0 }))
                }
                Some(Ev::ReadError) => Err(SourceError::Read("transient".into())),
                Some(Ev::Block) => Ok(ReadOutcome::WouldBlock),
                None => Ok(ReadOutcome::EndOfStream),
            }
        }

        fn decode(&mut self, _packet: crate::source::Packet) -> Result<DecodeOutput, SourceError> {
            let pts = self.pending.take().expect("decode without packet");
            Ok(DecodeOutput {
                video: vec![RawVideoFrame {
                    pts,
                    width: 2,
                    height: 2,
                    format: PixelFormat::Rgba,
                    planes: vec![(8, vec![0u8; 16])],
                }],
                ..Default::default()
            })
        }

        fn drain(&mut self) -> Result<DecodeOutput, SourceError> {
            Ok(DecodeOutput::default())
        }

        fn seek(&mut self, _target: SeekTarget) -> Result<(), SourceError> {
            Ok(())
        }
    }

    fn open_script(events: Vec<Ev>, tuning: EngineTuning) -> EngineHandle {
        let config = OpenConfig {
            enable_audio: false,
            ..OpenConfig::for_source("script:unit")
        };
        DecodeEngine::open(
            config,
            move |_: &OpenConfig| -> Result<Box<dyn MediaSource>, SourceError> {
                Ok(Box::new(ScriptSource::video(events.clone())))
            },
            EngineOptions {
                tuning,
                ..Default::default()
            },
        )
    }

    fn wait_for_state(handle: &EngineHandle, wanted: EngineState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if handle.state() == wanted {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_reaches_finished_on_short_stream() {
        let handle = open_script(
            vec![Ev::Frame(0.0), Ev::Block, Ev::Frame(1.0 / 30.0)],
            EngineTuning::default(),
        );
        assert!(wait_for_state(&handle, EngineState::Finished));
        assert_eq!(handle.current_generation(), 0);
        let output = handle.video_output();
        assert_eq!(output.buffer_state().video_frames, 2);
        handle.close();
    }

    #[test]
    fn test_no_stream_is_fatal() {
        let config = OpenConfig {
            enable_video: false,
            enable_audio: false,
            ..OpenConfig::for_source("script:none")
        };
        let handle = DecodeEngine::open(
            config,
            |_: &OpenConfig| -> Result<Box<dyn MediaSource>, SourceError> {
                Ok(Box::new(ScriptSource::video(vec![])))
            },
            EngineOptions::default(),
        );
        assert!(wait_for_state(&handle, EngineState::Error));
        assert!(matches!(handle.last_error(), Some(SourceError::NoStream(_))));
    }

    #[test]
    fn test_read_error_cap_is_fatal_exactly_at_cap() {
        let tuning = EngineTuning {
            read_error_cap: 3,
            read_retry_wait: Duration::from_millis(1),
            ..Default::default()
        };
        // Two errors then a good frame: tolerated.
        let handle = open_script(
            vec![Ev::ReadError, Ev::ReadError, Ev::Frame(0.0)],
            tuning.clone(),
        );
        assert!(wait_for_state(&handle, EngineState::Finished));
        handle.close();

        // Three consecutive errors: fatal.
        let handle = open_script(
            vec![Ev::ReadError, Ev::ReadError, Ev::ReadError, Ev::Frame(0.0)],
            tuning,
        );
        assert!(wait_for_state(&handle, EngineState::Error));
        assert!(matches!(handle.last_error(), Some(SourceError::Read(_))));
    }

    #[test]
    fn test_would_block_not_counted_as_error() {
        let tuning = EngineTuning {
            read_error_cap: 2,
            would_block_wait: Duration::from_millis(1),
            read_retry_wait: Duration::from_millis(1),
            ..Default::default()
        };
        // Error, EAGAIN, error, EAGAIN... never two *consecutive* errors in
        // the counter's sense would be wrong — EAGAIN is neutral, so the
        // cap of 2 is still reached by the two errors with no successful
        // read in between.
        let handle = open_script(
            vec![Ev::ReadError, Ev::Block, Ev::ReadError, Ev::Frame(0.0)],
            tuning,
        );
        assert!(wait_for_state(&handle, EngineState::Error));
    }

    #[test]
    fn test_discontinuity_bumps_generation() {
        // pts jumps backwards by far more than the tolerance.
        let handle = open_script(
            vec![
                Ev::Frame(0.0),
                Ev::Frame(0.033),
                Ev::Frame(0.5),
                Ev::Frame(0.1),
            ],
            EngineTuning::default(),
        );
        assert!(wait_for_state(&handle, EngineState::Finished));
        assert!(handle.current_generation() > 0, "generation must be bumped");
        // Everything buffered before the discontinuity was invalidated.
        let output = handle.video_output();
        let state = output.buffer_state();
        assert_eq!(state.video_frames, 1);
        handle.close();
    }

    #[test]
    fn test_close_is_idempotent() {
        let handle = open_script(vec![Ev::Frame(0.0)], EngineTuning::default());
        assert!(wait_for_state(&handle, EngineState::Finished));
        handle.close();
        let state_after_first = handle.state();
        handle.close();
        assert_eq!(handle.state(), state_after_first);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_device_busy_fails_open() {
        let registry = DeviceRegistry::new();
        let _held = registry
            .acquire("cap://cam0", Duration::from_millis(10))
            .unwrap();
        let config = OpenConfig {
            capture_device: true,
            enable_audio: false,
            ..OpenConfig::for_source("cap://cam0")
        };
        let handle = DecodeEngine::open(
            config,
            |_: &OpenConfig| -> Result<Box<dyn MediaSource>, SourceError> {
                Ok(Box::new(ScriptSource::video(vec![Ev::Frame(0.0)])))
            },
            EngineOptions {
                tuning: EngineTuning {
                    device_timeout: Duration::from_millis(50),
                    ..Default::default()
                },
                registry: Some(registry),
                ..Default::default()
            },
        );
        assert!(wait_for_state(&handle, EngineState::Error));
        assert!(matches!(
            handle.last_error(),
            Some(SourceError::DeviceBusy(_))
        ));
    }

    #[test]
    fn test_device_released_after_close() {
        let registry = DeviceRegistry::new();
        let config = OpenConfig {
            capture_device: true,
            enable_audio: false,
            ..OpenConfig::for_source("cap://cam1")
        };
        let handle = DecodeEngine::open(
            config,
            |_: &OpenConfig| -> Result<Box<dyn MediaSource>, SourceError> {
                Ok(Box::new(ScriptSource::video(vec![Ev::Frame(0.0)])))
            },
            EngineOptions {
                registry: Some(Arc::clone(&registry)),
                ..Default::default()
            },
        );
        assert!(wait_for_state(&handle, EngineState::Finished));
        assert!(registry.is_held("cap://cam1"));
        handle.close();
        assert!(!registry.is_held("cap://cam1"));
    }
}
