//! The boundary to the external demux/decode/filter library.
//!
//! The engine drives any [`MediaSource`]: read a packet, feed it back for
//! decoding, drain delayed codec output at end of stream, seek. Everything
//! format- or codec-specific (container parsing, pixel/sample conversion,
//! filter graphs described by the opaque strings in [`OpenConfig`]) lives
//! behind this trait; the engine only sees decoded frames, sample runs, and
//! the error taxonomy below.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::clock::PlayMode;
use crate::frame::PixelFormat;
use crate::seek::SeekRequest;

/// Errors surfaced by a media source.
///
/// Transient read errors (`Read`) are retried by the engine up to its
/// consecutive-error cap; `WouldBlock`-style conditions are reported through
/// [`ReadOutcome::WouldBlock`] instead and never count as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The source could not be opened at all.
    Open(String),
    /// No decodable audio or video stream was found.
    NoStream(String),
    /// A read from the source failed; possibly recoverable.
    Read(String),
    /// Decoding one packet failed; the packet is dropped and playback
    /// continues.
    Decode(String),
    /// Repositioning the source failed.
    Seek(String),
    /// A capture device is exclusively held by another instance.
    DeviceBusy(String),
    /// The container or codec is not supported.
    Unsupported(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Open(msg) => write!(f, "failed to open source: {msg}"),
            SourceError::NoStream(msg) => write!(f, "no usable stream: {msg}"),
            SourceError::Read(msg) => write!(f, "read failed: {msg}"),
            SourceError::Decode(msg) => write!(f, "decode failed: {msg}"),
            SourceError::Seek(msg) => write!(f, "seek failed: {msg}"),
            SourceError::DeviceBusy(msg) => write!(f, "device busy: {msg}"),
            SourceError::Unsupported(msg) => write!(f, "unsupported format: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

/// Configuration handed to the engine (and through it to the source) at open
/// time.
#[derive(Debug, Clone)]
pub struct OpenConfig {
    /// Path, URL, or device string.
    pub source: String,
    /// Optional explicit container/demuxer hint.
    pub format_hint: Option<String>,
    /// Decode the video stream.
    pub enable_video: bool,
    /// Decode the audio stream.
    pub enable_audio: bool,
    /// Stream index to use when the container has several video streams.
    pub video_stream: Option<usize>,
    /// Stream index to use when the container has several audio streams.
    pub audio_stream: Option<usize>,
    /// Opaque key/value options passed through to the demuxer.
    pub demuxer_options: HashMap<String, String>,
    /// Opaque key/value options passed through to the decoders.
    pub decoder_options: HashMap<String, String>,
    /// Channel count the source must decode audio to.
    pub audio_channels: usize,
    /// Sample rate the source must decode audio to, in Hz.
    pub audio_sample_rate: u32,
    /// Target decoded-audio buffering in seconds.
    pub audio_buffer_seconds: f64,
    /// Target decoded-video buffering in frames.
    pub video_buffer_frames: usize,
    /// Initial play mode.
    pub play_mode: PlayMode,
    /// Seek applied before the first frame is published.
    pub initial_seek: Option<SeekRequest>,
    /// Restart from the beginning at end of stream.
    pub looping: bool,
    /// Opaque filter-graph description for video (passthrough).
    pub video_filter: Option<String>,
    /// Opaque filter-graph description for audio (passthrough).
    pub audio_filter: Option<String>,
    /// The source is a live capture device; its key is gated for exclusive
    /// access and a capture format is negotiated at open.
    pub capture_device: bool,
    /// Concrete capture format chosen at open time (filled by the engine
    /// from its format provider; sources ignore it for non-capture input).
    pub capture_format: Option<CaptureFormat>,
}

impl Default for OpenConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            format_hint: None,
            enable_video: true,
            enable_audio: true,
            video_stream: None,
            audio_stream: None,
            demuxer_options: HashMap::new(),
            decoder_options: HashMap::new(),
            audio_channels: 2,
            audio_sample_rate: 48000,
            audio_buffer_seconds: 1.0,
            video_buffer_frames: crate::frame_ring::DEFAULT_CAPACITY,
            play_mode: PlayMode::Playing,
            initial_seek: None,
            looping: false,
            video_filter: None,
            audio_filter: None,
            capture_device: false,
            capture_format: None,
        }
    }
}

impl OpenConfig {
    /// Convenience constructor for a plain file/URL source.
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }
}

/// Stream properties reported by an opened source.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    /// Container-reported duration in seconds, when reliable.
    pub duration: Option<f64>,
    /// Total byte size, when known (enables byte seeks).
    pub byte_size: Option<u64>,
    /// Video geometry; zero until the first frame for late-probing sources.
    pub width: u32,
    pub height: u32,
    /// Nominal video frame rate.
    pub frame_rate: f64,
    /// Decoded pixel format.
    pub pixel_format: Option<PixelFormat>,
    /// Decoded audio sample rate.
    pub sample_rate: u32,
    /// Decoded audio channel count.
    pub channels: usize,
    pub has_video: bool,
    pub has_audio: bool,
    /// False for live sources that cannot reposition (forces reopen-looping).
    pub seekable: bool,
    /// First pts the container reports, when known.
    pub start_time: Option<f64>,
}

/// Opaque packet token minted by a source's `read_packet` and handed back to
/// its `decode`.
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    /// Source-private identifier of the buffered packet.
    pub handle: u64,
}

/// Result of one packet read.
#[derive(Debug, Clone, Copy)]
pub enum ReadOutcome {
    /// A packet is ready to decode.
    Packet(Packet),
    /// Nothing available right now (EAGAIN-equivalent); retry without
    /// counting an error.
    WouldBlock,
    /// End of input; switch to the flush phase.
    EndOfStream,
}

/// A decoded video frame as produced by the source, before the engine copies
/// it into pooled storage.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    /// Presentation time in seconds, in the source's own timeline.
    pub pts: f64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// One `(stride, bytes)` pair per plane.
    pub planes: Vec<(usize, Vec<u8>)>,
}

/// A decoded run of audio samples (planar).
#[derive(Debug, Clone)]
pub struct RawAudioBlock {
    /// Presentation time in seconds of the first sample.
    pub pts: f64,
    /// One `Vec<f32>` per channel, equal lengths.
    pub channels: Vec<Vec<f32>>,
}

/// Zero or more decoded outputs from one packet (or one drain round).
#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    pub video: Vec<RawVideoFrame>,
    pub audio: Vec<RawAudioBlock>,
}

impl DecodeOutput {
    /// True when nothing was produced.
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

/// Seek target in the source's native unit, with optional direction bounds.
#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    /// Rewind to the beginning of the stream.
    Start,
    /// Time-based seek with lower/upper bounds from the direction hint.
    Seconds {
        target: f64,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Byte-offset seek for sources without usable timestamps.
    Bytes { target: u64 },
}

/// The opaque demux/decode service the engine drives.
///
/// Implementations wrap the actual media library; the scripted sources used
/// in tests implement it over in-memory data.
pub trait MediaSource: Send {
    /// Stream properties. May be re-queried; late-probing sources update
    /// geometry after the first decode.
    fn info(&self) -> SourceInfo;

    /// Reads the next compressed packet.
    fn read_packet(&mut self) -> Result<ReadOutcome, SourceError>;

    /// Decodes a previously read packet into zero or more outputs, running
    /// any configured filter graph.
    fn decode(&mut self, packet: Packet) -> Result<DecodeOutput, SourceError>;

    /// Drains delayed codec output after end of input. Called repeatedly
    /// until it returns an empty [`DecodeOutput`].
    fn drain(&mut self) -> Result<DecodeOutput, SourceError>;

    /// Repositions the source and flushes its internal decode buffers.
    fn seek(&mut self, target: SeekTarget) -> Result<(), SourceError>;

    /// Installs the interrupt flag; in-flight blocking I/O must abort
    /// promptly once it reads true.
    fn set_interrupt(&mut self, _interrupt: Arc<AtomicBool>) {}
}

/// Opens sources; also used for the full close+reopen fallback when a
/// loop-seek fails or a capture source must be recycled.
pub trait SourceFactory: Send {
    /// Opens a source for `config`.
    fn open(&self, config: &OpenConfig) -> Result<Box<dyn MediaSource>, SourceError>;
}

impl<F> SourceFactory for F
where
    F: Fn(&OpenConfig) -> Result<Box<dyn MediaSource>, SourceError> + Send,
{
    fn open(&self, config: &OpenConfig) -> Result<Box<dyn MediaSource>, SourceError> {
        self(config)
    }
}

/// Concrete input format chosen for an ambiguous capture source.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFormat {
    /// Capture pin/input index.
    pub pin: u32,
    /// Pixel format or codec name.
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Chooses an optimal concrete format for a capture device. Consulted once
/// at open time; device scanning itself lives outside this crate.
pub trait CaptureFormatProvider: Send {
    /// Returns the format to open `device_key` with, or `None` to let the
    /// source pick its own default.
    fn choose_format(&self, device_key: &str) -> Option<CaptureFormat>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SourceError::Open("no such file".into());
        assert_eq!(err.to_string(), "failed to open source: no such file");
        let err = SourceError::DeviceBusy("/dev/video0".into());
        assert!(err.to_string().contains("/dev/video0"));
    }

    #[test]
    fn test_open_config_defaults() {
        let config = OpenConfig::for_source("clip.mp4");
        assert_eq!(config.source, "clip.mp4");
        assert!(config.enable_video && config.enable_audio);
        assert_eq!(config.audio_sample_rate, 48000);
        assert!(!config.looping);
        assert!(config.capture_format.is_none());
    }

    #[test]
    fn test_decode_output_empty() {
        let out = DecodeOutput::default();
        assert!(out.is_empty());
        let out = DecodeOutput {
            audio: vec![RawAudioBlock { pts: 0.0, channels: vec![vec![0.0]] }],
            ..Default::default()
        };
        assert!(!out.is_empty());
    }
}
