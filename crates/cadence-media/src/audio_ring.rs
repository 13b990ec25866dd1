//! Ring buffer of decoded audio sample blocks.
//!
//! One writer (the decode thread) fills fixed-size planar blocks; one reader
//! (the real-time audio callback, owned by the external audio graph) drains
//! them through [`AudioConsumer::process`]. The callback side never blocks
//! and never allocates: starvation writes silence and reports a short
//! consumed count, slot access uses `try_lock` on locks the producer only
//! holds for unpublished slots.
//!
//! Blocks carry a [`MediaTimestamp`]; blocks older than the currently
//! accepted generation are discarded without being played. Gain is applied
//! while copying samples out, so volume changes take effect on the very next
//! callback. Each time the consumer starts a fresh block it re-anchors the
//! shared [`SyncClock`], which makes audio the master clock while it flows.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clock::SyncClock;
use crate::timing::MediaTimestamp;

/// Sizing of the audio block ring.
#[derive(Debug, Clone)]
pub struct AudioRingConfig {
    /// Number of block slots.
    pub blocks: usize,
    /// Frames (samples per channel) per block.
    pub block_frames: usize,
    /// Channel count of the decoded stream.
    pub channels: usize,
    /// Sample rate of the decoded stream in Hz.
    pub sample_rate: u32,
    /// Frames that must be buffered before the consumer starts playing.
    pub prefill_frames: usize,
}

impl AudioRingConfig {
    /// Sizes the ring to hold roughly `seconds` of audio in ~21ms blocks,
    /// with a 50ms prefill so playback starts fast after a seek.
    pub fn for_target_seconds(seconds: f64, sample_rate: u32, channels: usize) -> Self {
        let block_frames = (sample_rate as usize / 48).next_power_of_two();
        let total_frames = (seconds.max(0.1) * sample_rate as f64) as usize;
        Self {
            blocks: (total_frames / block_frames).max(4),
            block_frames,
            channels: channels.max(1),
            sample_rate: sample_rate.max(1),
            prefill_frames: sample_rate as usize / 20,
        }
    }
}

impl Default for AudioRingConfig {
    fn default() -> Self {
        Self::for_target_seconds(1.0, 48000, 2)
    }
}

/// One decoded audio block: planar per-channel samples plus a consumption
/// cursor for partially drained blocks.
#[derive(Debug)]
pub struct AudioBlock {
    /// Timestamp of the first sample in the block.
    pub ts: MediaTimestamp,
    /// Valid frames in the block (0 when the slot is free).
    pub frames: usize,
    /// Frames already consumed by the callback.
    pub cursor: usize,
    /// Planar sample data, one `Vec<f32>` per channel, allocated once.
    pub data: Vec<Vec<f32>>,
}

struct AudioRingShared {
    slots: Box<[Mutex<AudioBlock>]>,
    /// Blocks published so far (monotonic; slot index = pos % slots.len()).
    write_pos: AtomicU64,
    /// Blocks fully consumed or discarded so far (monotonic).
    read_pos: AtomicU64,
    /// Published-minus-consumed frames, for buffer-state reporting.
    buffered_frames: AtomicU64,
    prefilled: AtomicBool,
    prefill_frames: usize,
    block_frames: usize,
    channels: usize,
    sample_rate: u32,
    /// Blocks tagged with an older generation are dropped unplayed.
    accepted_generation: AtomicU64,
    underruns: AtomicU64,
    /// Volume percent (0-100).
    volume: AtomicU32,
    muted: AtomicBool,
    producer_alive: AtomicBool,
    clock: Arc<SyncClock>,
}

/// Creates an audio ring, returning the decode-thread half, the callback
/// half, and a control handle for flush/gain/metrics.
pub fn audio_ring(
    config: AudioRingConfig,
    clock: Arc<SyncClock>,
) -> (AudioProducer, AudioConsumer, AudioRingControl) {
    let slots: Vec<Mutex<AudioBlock>> = (0..config.blocks.max(2))
        .map(|_| {
            Mutex::new(AudioBlock {
                ts: MediaTimestamp::ZERO,
                frames: 0,
                cursor: 0,
                data: vec![vec![0.0; config.block_frames]; config.channels.max(1)],
            })
        })
        .collect();

    let shared = Arc::new(AudioRingShared {
        slots: slots.into_boxed_slice(),
        write_pos: AtomicU64::new(0),
        read_pos: AtomicU64::new(0),
        buffered_frames: AtomicU64::new(0),
        prefilled: AtomicBool::new(false),
        prefill_frames: config.prefill_frames,
        block_frames: config.block_frames.max(1),
        channels: config.channels.max(1),
        sample_rate: config.sample_rate.max(1),
        accepted_generation: AtomicU64::new(0),
        underruns: AtomicU64::new(0),
        volume: AtomicU32::new(100),
        muted: AtomicBool::new(false),
        producer_alive: AtomicBool::new(true),
        clock,
    });

    (
        AudioProducer {
            shared: Arc::clone(&shared),
        },
        AudioConsumer {
            shared: Arc::clone(&shared),
        },
        AudioRingControl { shared },
    )
}

/// Decode-thread half of the ring.
pub struct AudioProducer {
    shared: Arc<AudioRingShared>,
}

impl AudioProducer {
    /// Largest sample run a single `try_push` is guaranteed to eventually
    /// fit; longer runs must be split by the caller.
    pub fn max_run_frames(&self) -> usize {
        (self.shared.slots.len() / 2).max(1) * self.shared.block_frames
    }

    /// Free frames available for writing right now.
    pub fn free_frames(&self) -> usize {
        let s = &self.shared;
        let used = s
            .write_pos
            .load(Ordering::Acquire)
            .saturating_sub(s.read_pos.load(Ordering::Acquire)) as usize;
        s.slots.len().saturating_sub(used) * s.block_frames
    }

    /// Copies a planar sample run into the ring, splitting it across block
    /// slots as needed.
    ///
    /// Returns false without consuming anything when there are not enough
    /// free blocks — the consumer is behind and the caller should wait
    /// (backpressure), not error. Inputs with fewer channels than the ring
    /// are upmixed by replicating the last channel; extra channels are
    /// dropped.
    pub fn try_push(&mut self, pts: f64, generation: u64, channels: &[&[f32]]) -> bool {
        let s = &self.shared;
        let Some(first) = channels.first() else {
            return true;
        };
        let frames = first.len();
        if frames == 0 {
            return true;
        }

        let needed = frames.div_ceil(s.block_frames);
        let wp = s.write_pos.load(Ordering::Relaxed);
        let rp = s.read_pos.load(Ordering::Acquire);
        let free = s.slots.len() - (wp - rp) as usize;
        if needed > free {
            return false;
        }

        let mut offset = 0usize;
        let mut pos = wp;
        while offset < frames {
            let take = (frames - offset).min(s.block_frames);
            let slot = &s.slots[(pos % s.slots.len() as u64) as usize];
            // Uncontended: the consumer never touches slots at or past
            // write_pos, and this slot is not yet published.
            let mut block = slot.lock();
            block.ts = MediaTimestamp::new(
                pts + offset as f64 / s.sample_rate as f64,
                generation,
            );
            block.frames = take;
            block.cursor = 0;
            for (ch, dst) in block.data.iter_mut().enumerate() {
                let src = channels
                    .get(ch)
                    .unwrap_or_else(|| &channels[channels.len() - 1]);
                dst[..take].copy_from_slice(&src[offset..offset + take]);
            }
            drop(block);
            pos += 1;
            // Publish each block as it is filled.
            s.write_pos.store(pos, Ordering::Release);
            s.buffered_frames.fetch_add(take as u64, Ordering::AcqRel);
            offset += take;
        }

        if !s.prefilled.load(Ordering::Relaxed)
            && s.buffered_frames.load(Ordering::Relaxed) >= s.prefill_frames as u64
        {
            s.prefilled.store(true, Ordering::Release);
            tracing::debug!(
                buffered = s.buffered_frames.load(Ordering::Relaxed),
                threshold = s.prefill_frames,
                "audio ring prefilled"
            );
        }
        true
    }
}

impl Drop for AudioProducer {
    fn drop(&mut self) {
        self.shared.producer_alive.store(false, Ordering::Release);
    }
}

/// Real-time callback half of the ring. Owned by the audio graph.
pub struct AudioConsumer {
    shared: Arc<AudioRingShared>,
}

impl AudioConsumer {
    /// Fills `out` (one slice per output channel) with up to `frames`
    /// frames, applying gain while copying. Never blocks, never allocates.
    ///
    /// Returns the number of frames actually consumed from the ring; the
    /// remainder of `out` is silence. `callback_time` is the wall-clock time
    /// the first written frame will be presented at; it anchors the sync
    /// clock whenever consumption enters a fresh block.
    pub fn process(
        &mut self,
        out: &mut [&mut [f32]],
        frames: usize,
        callback_time: Instant,
    ) -> usize {
        let s = &self.shared;
        let frames = frames.min(out.iter().map(|c| c.len()).min().unwrap_or(0));
        for ch in out.iter_mut() {
            ch[..frames].fill(0.0);
        }
        if frames == 0 || !s.clock.is_playing() {
            return 0;
        }

        // Free stale-generation blocks before the prefill gate, otherwise a
        // seek against a full ring would wedge the producer behind blocks the
        // consumer will never play.
        self.discard_stale();

        if !s.prefilled.load(Ordering::Acquire) {
            return 0;
        }

        let accepted = s.accepted_generation.load(Ordering::Acquire);
        let gain = if s.muted.load(Ordering::Relaxed) {
            0.0
        } else {
            s.volume.load(Ordering::Relaxed) as f32 / 100.0
        };

        let mut produced = 0usize;
        let mut rp = s.read_pos.load(Ordering::Relaxed);
        let wp = s.write_pos.load(Ordering::Acquire);
        while produced < frames && rp < wp {
            let slot = &s.slots[(rp % s.slots.len() as u64) as usize];
            let Some(mut block) = slot.try_lock() else {
                break;
            };
            if block.ts.generation < accepted {
                let remaining = (block.frames - block.cursor) as u64;
                block.frames = 0;
                block.cursor = 0;
                drop(block);
                s.buffered_frames.fetch_sub(remaining, Ordering::AcqRel);
                rp += 1;
                s.read_pos.store(rp, Ordering::Release);
                continue;
            }
            if block.cursor == 0 {
                let wall = callback_time
                    + Duration::from_secs_f64(produced as f64 / s.sample_rate as f64);
                s.clock.anchor(block.ts.pts, wall, block.ts.generation);
            }

            let take = (block.frames - block.cursor).min(frames - produced);
            for (idx, ch_out) in out.iter_mut().enumerate() {
                let src_ch = idx.min(block.data.len() - 1);
                let src = &block.data[src_ch][block.cursor..block.cursor + take];
                for (dst, &sample) in ch_out[produced..produced + take].iter_mut().zip(src) {
                    *dst = sample * gain;
                }
            }
            block.cursor += take;
            let drained = block.cursor >= block.frames;
            if drained {
                block.frames = 0;
                block.cursor = 0;
            }
            drop(block);
            s.buffered_frames.fetch_sub(take as u64, Ordering::AcqRel);
            produced += take;
            if drained {
                rp += 1;
                s.read_pos.store(rp, Ordering::Release);
            }
        }

        if produced < frames {
            s.underruns.fetch_add(1, Ordering::Relaxed);
        }
        produced
    }

    /// Maps a wall-clock timestamp to media time using the shared clock this
    /// consumer anchors.
    pub fn to_media_time(&self, wall: Instant) -> MediaTimestamp {
        self.shared.clock.media_time(wall)
    }

    /// Returns true while the decode thread still exists.
    pub fn is_producer_alive(&self) -> bool {
        self.shared.producer_alive.load(Ordering::Acquire)
    }

    fn discard_stale(&self) {
        let s = &self.shared;
        let accepted = s.accepted_generation.load(Ordering::Acquire);
        let mut rp = s.read_pos.load(Ordering::Relaxed);
        let wp = s.write_pos.load(Ordering::Acquire);
        while rp < wp {
            let slot = &s.slots[(rp % s.slots.len() as u64) as usize];
            let Some(mut block) = slot.try_lock() else {
                return;
            };
            if block.ts.generation >= accepted {
                return;
            }
            let remaining = (block.frames - block.cursor) as u64;
            block.frames = 0;
            block.cursor = 0;
            drop(block);
            s.buffered_frames.fetch_sub(remaining, Ordering::AcqRel);
            rp += 1;
            s.read_pos.store(rp, Ordering::Release);
        }
    }
}

/// Control and metrics handle, shared by the engine and the embedding
/// player.
#[derive(Clone)]
pub struct AudioRingControl {
    shared: Arc<AudioRingShared>,
}

impl AudioRingControl {
    /// Invalidates everything buffered with a generation older than
    /// `generation` and resets the prefill gate. Called on seek.
    pub fn flush(&self, generation: u64) {
        self.shared.prefilled.store(false, Ordering::Release);
        self.shared
            .accepted_generation
            .store(generation, Ordering::Release);
    }

    /// Seconds of decoded audio currently buffered.
    pub fn buffered_seconds(&self) -> f64 {
        self.shared.buffered_frames.load(Ordering::Acquire) as f64
            / self.shared.sample_rate as f64
    }

    /// Total ring capacity in seconds.
    pub fn capacity_seconds(&self) -> f64 {
        (self.shared.slots.len() * self.shared.block_frames) as f64
            / self.shared.sample_rate as f64
    }

    /// Sets playback volume in percent (clamped to 0-100).
    pub fn set_volume(&self, percent: u32) {
        self.shared.volume.store(percent.min(100), Ordering::Relaxed);
    }

    /// Current volume in percent.
    pub fn volume(&self) -> u32 {
        self.shared.volume.load(Ordering::Relaxed)
    }

    /// Mutes or unmutes output without touching the volume setting.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
    }

    /// Returns true while muted.
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    /// Number of callbacks that ran short of samples after prefill.
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Returns true once the prefill threshold has been reached.
    pub fn is_prefilled(&self) -> bool {
        self.shared.prefilled.load(Ordering::Acquire)
    }

    /// Sample rate of the decoded stream.
    pub fn sample_rate(&self) -> u32 {
        self.shared.sample_rate
    }

    /// Channel count of the decoded stream.
    pub fn channels(&self) -> usize {
        self.shared.channels
    }
}
