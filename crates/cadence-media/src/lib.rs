//! cadence-media: audio/video decode and synchronization core.
//!
//! The crate implements the playback core of a media component: a decode
//! thread pulls packets from an opaque [`source::MediaSource`], decodes them,
//! and publishes video frames and audio sample blocks into bounded rings
//! consumed by a renderer and a real-time audio callback, all kept in sync by
//! a generation-aware clock.
//!
//! - [`engine`] — the decode thread, state machine, and control surface
//! - [`frame`] / [`frame_ring`] — decoded frames, the storage pool, and the
//!   video ring buffer
//! - [`audio_ring`] — the audio block ring with its non-blocking callback
//!   half
//! - [`clock`] — wall-clock ↔ media-time mapping (audio master clock with
//!   wall-clock fallback)
//! - [`seek`] — coalescing seek requests and generation allocation
//! - [`device_gate`] — exclusive-access leases for capture devices
//! - [`source`] — the trait boundary to the external demux/decode library
//! - [`sync_metrics`] — drift and underrun instrumentation
//!
//! Decoding, demuxing, and filtering themselves live behind the
//! [`source::MediaSource`] trait; rendering and the audio device callback
//! belong to the embedding application.

pub mod audio_ring;
pub mod clock;
pub mod device_gate;
pub mod engine;
pub mod frame;
pub mod frame_ring;
pub mod seek;
pub mod source;
pub mod sync_metrics;
pub mod timing;

pub use clock::{PlayMode, SyncClock};
pub use engine::{
    AudioOutput, BufferState, DecodeEngine, EngineHandle, EngineOptions, EngineState,
    EngineTuning, FrameResult, VideoOutput,
};
pub use frame::{FramePool, PixelFormat, VideoFrame};
pub use seek::{SeekDirection, SeekKind, SeekRequest};
pub use source::{MediaSource, OpenConfig, SourceError, SourceFactory};
pub use timing::MediaTimestamp;
