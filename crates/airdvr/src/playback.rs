//! Real-time playback engine.
//!
//! The audio callback reads from a double buffer (current segment plus an
//! optional decoded lookahead) guarded by a `try_lock`; it never blocks,
//! allocates or performs IO. Everything slow happens on the async side and
//! communicates through the buffer slot and a notification channel.

pub mod decode;

use std::sync::{
    atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering},
    Arc,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DvrError, DvrResult},
    events::{EventBus, PlayerEvent},
    playback::decode::DecodedAudio,
    store::EvictionGuard,
    Channel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PlaybackState {
    Stopped = 0,
    Active = 1,
    /// Paused with buffers intact; resumable without re-decoding.
    Suspended = 2,
}

impl PlaybackState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlaybackState::Active,
            2 => PlaybackState::Suspended,
            _ => PlaybackState::Stopped,
        }
    }
}

/// Messages from the audio callback to the async side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineNotify {
    /// Consumption is close to the end of the current buffer and no
    /// lookahead is installed; decode the named segment.
    NeedLookahead { index: u64 },
    /// The callback promoted the lookahead; this index is now playing.
    AdvancedTo(u64),
    /// Both buffers ran dry; the engine stopped itself.
    Starved,
}

#[derive(Default)]
struct Buffers {
    current: DecodedAudio,
    lookahead: Option<(u64, DecodedAudio)>,
    /// Consumption position into `current`, in frames.
    cursor: usize,
    index: u64,
    /// A `NeedLookahead` has been sent and not yet answered.
    pending_lookahead: bool,
}

impl Buffers {
    /// Copy up to `out.len() / channels` frames from the current buffer,
    /// scaled by `volume`. Returns the number of frames copied.
    fn copy_frames(&mut self, out: &mut [f32], channels: usize, volume: f32) -> usize {
        let available = self.current.frames().saturating_sub(self.cursor);
        let frames = (out.len() / channels).min(available);
        let from = self.cursor * channels;
        let samples = &self.current.samples[from..from + frames * channels];
        for (dst, src) in out.iter_mut().zip(samples) {
            *dst = src * volume;
        }
        self.cursor += frames;
        frames
    }

    fn promote_lookahead(&mut self) -> bool {
        match self.lookahead.take() {
            Some((index, audio)) => {
                self.current = audio;
                self.cursor = 0;
                self.index = index;
                true
            }
            None => false,
        }
    }
}

struct EngineShared {
    buffers: Mutex<Buffers>,
    /// Current volume multiplier as f32 bits.
    volume_bits: AtomicU32,
    state: AtomicU8,
    /// Mirror of `Buffers::index` readable without the lock.
    index: AtomicU64,
    notify: mpsc::UnboundedSender<EngineNotify>,
    guard: Arc<EvictionGuard>,
    /// Lookahead is requested once consumption comes within this many
    /// callback windows of the end of the current buffer.
    margin: u32,
}

/// The audio callback body. Fills silence for any frames it cannot serve;
/// a contended buffer lock produces one silent window rather than a block.
fn fill_output(shared: &EngineShared, data: &mut [f32], channels: usize) {
    data.fill(0.0);
    if PlaybackState::from_u8(shared.state.load(Ordering::Acquire)) != PlaybackState::Active {
        return;
    }
    let Some(mut buffers) = shared.buffers.try_lock() else {
        return;
    };

    let volume = f32::from_bits(shared.volume_bits.load(Ordering::Acquire));
    let requested = data.len() / channels;
    let mut written = 0usize;
    while written < requested {
        written += buffers.copy_frames(&mut data[written * channels..], channels, volume);
        if written < requested {
            if !buffers.promote_lookahead() {
                // Out of data. The remainder of this window is already
                // silence; stop and let the async side decide what next.
                shared.state.store(PlaybackState::Stopped as u8, Ordering::Release);
                let _ = shared.notify.send(EngineNotify::Starved);
                return;
            }
            shared.index.store(buffers.index, Ordering::Release);
            shared.guard.advance_playing(buffers.index);
            let _ = shared.notify.send(EngineNotify::AdvancedTo(buffers.index));
        }
    }

    let margin_frames = requested.saturating_mul(shared.margin as usize);
    if buffers.lookahead.is_none()
        && !buffers.pending_lookahead
        && buffers.cursor + margin_frames >= buffers.current.frames()
    {
        buffers.pending_lookahead = true;
        let _ = shared.notify.send(EngineNotify::NeedLookahead {
            index: buffers.index + 1,
        });
    }
}

/// The volume slider curve: perceptually linear from 0 to 100.
///
/// The position is taken to the eighth root and mapped onto a 32 dB
/// exponential range, so the bottom of the slider is usable instead of
/// jumping straight from silence to loud.
pub fn volume_multiplier(volume: u8) -> f32 {
    if volume == 0 {
        return 0.0;
    }
    let v = f32::from(volume.min(100)) / 100.0;
    2f32.powf((v.powf(0.125) * 192.0 - 192.0) / 6.0)
}

/// `cpal::Stream` is not `Send`, but ours is created, used and dropped
/// while owned by a single mutex-guarded slot; it never migrates mid-use.
struct StreamHolder {
    stream: cpal::Stream,
}

unsafe impl Send for StreamHolder {}

pub struct PlaybackEngine {
    shared: Arc<EngineShared>,
    stream: Mutex<Option<StreamHolder>>,
    lookahead_token: Mutex<CancellationToken>,
    events: EventBus,
}

impl PlaybackEngine {
    pub fn new(
        guard: Arc<EvictionGuard>,
        margin: u32,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineNotify>) {
        let (notify, notifications) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            shared: Arc::new(EngineShared {
                buffers: Mutex::new(Buffers::default()),
                volume_bits: AtomicU32::new(1f32.to_bits()),
                state: AtomicU8::new(PlaybackState::Stopped as u8),
                index: AtomicU64::new(0),
                notify,
                guard,
                margin,
            }),
            stream: Mutex::new(None),
            lookahead_token: Mutex::new(CancellationToken::new()),
            events,
        });
        (engine, notifications)
    }

    pub fn state(&self) -> PlaybackState {
        PlaybackState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn current_index(&self) -> Option<u64> {
        match self.state() {
            PlaybackState::Stopped => None,
            _ => Some(self.shared.index.load(Ordering::Acquire)),
        }
    }

    /// Begin playback of a decoded segment, replacing whatever was playing.
    /// The output stream is opened at the segment's native rate and layout.
    pub fn start(&self, channel: Channel, index: u64, audio: DecodedAudio) -> DvrResult<()> {
        self.teardown();

        let holder = self.build_stream(audio.channels, audio.sample_rate)?;
        {
            let mut buffers = self.shared.buffers.lock();
            *buffers = Buffers {
                current: audio,
                lookahead: None,
                cursor: 0,
                index,
                pending_lookahead: false,
            };
        }
        self.shared.index.store(index, Ordering::Release);
        self.shared.guard.set_playing(channel, index);
        self.shared
            .state
            .store(PlaybackState::Active as u8, Ordering::Release);
        holder.stream.play()?;
        *self.stream.lock() = Some(holder);

        self.events
            .emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Active));
        self.events.emit(PlayerEvent::CurrentIndexChanged(index));
        Ok(())
    }

    pub fn pause(&self) -> DvrResult<()> {
        if self.state() != PlaybackState::Active {
            return Ok(());
        }
        self.shared
            .state
            .store(PlaybackState::Suspended as u8, Ordering::Release);
        if let Some(holder) = &*self.stream.lock() {
            holder.stream.pause()?;
        }
        self.events
            .emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Suspended));
        Ok(())
    }

    pub fn resume(&self) -> DvrResult<()> {
        if self.state() != PlaybackState::Suspended {
            return Ok(());
        }
        self.shared
            .state
            .store(PlaybackState::Active as u8, Ordering::Release);
        if let Some(holder) = &*self.stream.lock() {
            holder.stream.play()?;
        }
        self.events
            .emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Active));
        Ok(())
    }

    pub fn stop(&self) {
        let was_stopped = self.state() == PlaybackState::Stopped;
        self.teardown();
        if !was_stopped {
            self.events
                .emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
        }
    }

    /// Used when the callback stopped itself on starvation: release the
    /// stream and guard without re-announcing the state.
    pub fn finalize_starved(&self) {
        self.teardown();
        self.events
            .emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
    }

    fn teardown(&self) {
        self.lookahead_token.lock().cancel();
        self.shared
            .state
            .store(PlaybackState::Stopped as u8, Ordering::Release);
        *self.stream.lock() = None;
        *self.shared.buffers.lock() = Buffers::default();
        self.shared.guard.clear_playing();
    }

    pub fn set_volume(&self, volume: u8) {
        self.shared
            .volume_bits
            .store(volume_multiplier(volume).to_bits(), Ordering::Release);
    }

    /// Frame count of the buffer currently being consumed. The decode-ahead
    /// path uses this as the split point when re-decoding the current and
    /// next segment as one stream.
    pub fn current_frames(&self) -> usize {
        self.shared.buffers.lock().current.frames()
    }

    /// Install the decoded next segment. Ignored when the request it
    /// answers is stale (playback moved or restarted in the meantime).
    pub fn install_lookahead(&self, for_index: u64, audio: DecodedAudio) {
        let mut buffers = self.shared.buffers.lock();
        if !buffers.pending_lookahead || buffers.index + 1 != for_index {
            return;
        }
        buffers.lookahead = Some((for_index, audio));
        buffers.pending_lookahead = false;
    }

    /// Give up on an outstanding lookahead request so a later margin check
    /// can re-issue it.
    pub fn abort_lookahead(&self, for_index: u64) {
        let mut buffers = self.shared.buffers.lock();
        if buffers.pending_lookahead && buffers.index + 1 == for_index {
            buffers.pending_lookahead = false;
        }
    }

    /// Cancellation scope for the task serving one `NeedLookahead`. Starting
    /// or stopping playback cancels the previous scope.
    pub fn new_lookahead_token(&self) -> CancellationToken {
        let mut slot = self.lookahead_token.lock();
        slot.cancel();
        *slot = CancellationToken::new();
        slot.clone()
    }

    fn build_stream(&self, channels: u16, sample_rate: u32) -> DvrResult<StreamHolder> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(DvrError::NoAudioDevice)?;
        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = self.shared.clone();
        let stream = device.build_output_stream(
            &config,
            move |data: &mut [f32], _| fill_output(&shared, data, channels as usize),
            |e| tracing::error!("Audio stream error: {e}"),
            None,
        )?;
        Ok(StreamHolder { stream })
    }
}
