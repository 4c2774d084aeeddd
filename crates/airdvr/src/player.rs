//! The player facade: channel contexts, seek resolution, decode-ahead
//! service loops and the public control surface.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::PlayerConfig,
    error::{DvrError, DvrResult},
    events::{EventBus, PlayerEvent},
    manifest::{ManifestFetcher, ManifestSnapshot},
    playback::{decode, EngineNotify, PlaybackEngine, PlaybackState},
    recording,
    store::{EvictionGuard, FetchOutcome, SegmentStore, StoreTuning},
    timeline::{self, SliderPoint, TimelinePoint, SLIDER_SLOTS},
    Channel,
};

/// How many of the newest segments to keep warm while live-tracking.
const PREFETCH_RECENT: usize = 6;

/// Slack on top of the download retry deadline when blocking on a segment.
const READY_WAIT_SLACK: Duration = Duration::from_secs(5);

/// Everything one channel owns: its manifest fetcher, its segment store
/// and the shared snapshot between them.
struct ChannelContext {
    channel: Channel,
    name: String,
    fetcher: ManifestFetcher,
    store: Arc<SegmentStore>,
    snapshot: Arc<RwLock<ManifestSnapshot>>,
}

impl ChannelContext {
    /// Ask the store for a segment; when the descriptor is still unknown,
    /// refresh the manifest once and retry.
    async fn request_index(&self, index: u64, notify: bool) -> DvrResult<FetchOutcome> {
        match self.store.fetch_index(index, notify).await? {
            FetchOutcome::NeedsManifest => {
                self.refresh_manifest().await?;
                self.store.fetch_index(index, notify).await
            }
            outcome => Ok(outcome),
        }
    }

    async fn refresh_manifest(&self) -> DvrResult<()> {
        self.fetcher.fetch().await?;
        self.store.reconcile_waiters().await;
        Ok(())
    }
}

pub struct Player {
    config: PlayerConfig,
    contexts: Vec<Arc<ChannelContext>>,
    active: AtomicUsize,
    engine: Arc<PlaybackEngine>,
    events: EventBus,
    volume: AtomicU8,
    /// Whether playback should track the live edge across manifest
    /// refreshes. Cleared by any explicit seek.
    live: AtomicBool,
    cancel: CancellationToken,
}

impl Player {
    pub fn new(config: PlayerConfig) -> DvrResult<Arc<Self>> {
        if config.channels.is_empty() {
            return Err(DvrError::UnknownChannel(0));
        }

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        let events = EventBus::default();
        let guard = EvictionGuard::new();
        let cancel = CancellationToken::new();
        let tuning = StoreTuning {
            retry_interval: config.retry_interval(),
            retry_deadline: config.retry_deadline(),
        };

        let mut contexts = Vec::with_capacity(config.channels.len());
        for (id, channel_config) in config.channels.iter().enumerate() {
            let channel = Channel(id);
            // A trailing slash so Url::join appends instead of replacing.
            let base_url = Url::parse(&format!(
                "{}/",
                channel_config.base_url.trim_end_matches('/')
            ))?;
            let manifest_url = base_url.join(&config.manifest_file)?;
            let snapshot = Arc::new(RwLock::new(ManifestSnapshot::default()));

            let fetcher = ManifestFetcher::new(
                channel,
                client.clone(),
                manifest_url,
                snapshot.clone(),
                config.manifest_cooldown(),
                events.clone(),
            );
            let store = SegmentStore::new(
                channel,
                base_url,
                config.cache_dir.join(&channel_config.name),
                client.clone(),
                snapshot.clone(),
                guard.clone(),
                config.eviction,
                tuning,
                events.clone(),
                cancel.child_token(),
            )?;

            contexts.push(Arc::new(ChannelContext {
                channel,
                name: channel_config.name.clone(),
                fetcher,
                store,
                snapshot,
            }));
        }

        let (engine, notifications) =
            PlaybackEngine::new(guard, config.decode_ahead_margin, events.clone());

        let player = Arc::new(Self {
            config,
            contexts,
            active: AtomicUsize::new(0),
            engine,
            events,
            volume: AtomicU8::new(100),
            live: AtomicBool::new(false),
            cancel,
        });

        tokio::spawn(Self::serve_notifications(player.clone(), notifications));
        tokio::spawn(Self::run_eviction(player.clone()));
        tokio::spawn(Self::run_live_refresh(player.clone()));
        Ok(player)
    }

    fn active_context(&self) -> Arc<ChannelContext> {
        self.contexts[self.active.load(Ordering::Acquire)].clone()
    }

    pub fn active_channel(&self) -> Channel {
        Channel(self.active.load(Ordering::Acquire))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PlaybackState {
        self.engine.state()
    }

    pub fn current_index(&self) -> Option<u64> {
        self.engine.current_index()
    }

    pub fn volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: u8) {
        let volume = volume.min(100);
        self.volume.store(volume, Ordering::Release);
        self.engine.set_volume(volume);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Slider slot of the segment currently playing, for UI resync.
    pub async fn current_slider_position(&self) -> Option<u16> {
        let index = self.engine.current_index()?;
        let ctx = self.active_context();
        let snapshot = ctx.snapshot.read().await;
        timeline::slider_position(&snapshot, index)
    }

    /// Start playback at a segment index, blocking until its bytes are on
    /// disk (bounded by the download retry deadline).
    pub async fn play(&self, index: u64) -> DvrResult<()> {
        let ctx = self.active_context();

        // Pause at the same position resumes without re-decoding.
        if self.engine.state() == PlaybackState::Suspended
            && self.engine.current_index() == Some(index)
        {
            return self.engine.resume();
        }

        // Subscribe before requesting so the ready event cannot slip past.
        let mut rx = self.events.subscribe();
        if ctx.request_index(index, true).await? != FetchOutcome::Ready {
            self.wait_for_segment(&mut rx, &ctx, index).await?;
        }
        self.start_at(&ctx, index).await
    }

    async fn wait_for_segment(
        &self,
        rx: &mut broadcast::Receiver<PlayerEvent>,
        ctx: &ChannelContext,
        index: u64,
    ) -> DvrResult<()> {
        let deadline =
            tokio::time::Instant::now() + self.config.retry_deadline() + READY_WAIT_SLACK;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(PlayerEvent::SegmentReady { channel, index: i }))
                    if channel == ctx.channel && i == index =>
                {
                    return Ok(());
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if ctx.store.is_cached(index) {
                        return Ok(());
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                    return Err(DvrError::SegmentNotCached { index });
                }
            }
        }
    }

    async fn start_at(&self, ctx: &ChannelContext, index: u64) -> DvrResult<()> {
        let path = ctx
            .store
            .path_for_index(index, true)
            .await
            .ok_or(DvrError::SegmentNotCached { index })?;
        // An undecodable segment ends the session; the caller re-starts.
        let audio = match decode_file(path).await {
            Ok(audio) => audio,
            Err(e) => {
                self.engine.stop();
                return Err(e);
            }
        };
        self.engine.start(ctx.channel, index, audio)?;
        self.engine.set_volume(self.volume());

        // Warm the successor; decode-ahead will need it shortly.
        if let Err(e) = ctx.request_index(index + 1, false).await {
            tracing::debug!("Failed to schedule next segment: {e}");
        }
        Ok(())
    }

    pub fn pause(&self) -> DvrResult<()> {
        self.engine.pause()
    }

    pub fn resume(&self) -> DvrResult<()> {
        self.engine.resume()
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::Release);
        self.engine.stop();
    }

    /// Seek to a wall-clock time. A stale or empty manifest is refetched
    /// once before giving up; the returned point tells the caller why a
    /// seek did not start playback.
    pub async fn seek_to_time(&self, time: DateTime<Utc>) -> DvrResult<TimelinePoint> {
        let ctx = self.active_context();
        let mut point = {
            let snapshot = ctx.snapshot.read().await;
            timeline::index_at_time(&snapshot, Utc::now(), time)
        };
        if matches!(point, TimelinePoint::Empty | TimelinePoint::TooOld) {
            ctx.refresh_manifest().await?;
            let snapshot = ctx.snapshot.read().await;
            point = timeline::index_at_time(&snapshot, Utc::now(), time);
        }
        if let TimelinePoint::Valid(index) = point {
            self.live.store(false, Ordering::Release);
            self.play(index).await?;
        }
        Ok(point)
    }

    /// Seek to a slider slot in `[0, SLIDER_SLOTS]`.
    pub async fn seek_to_slider_position(&self, position: u16) -> DvrResult<SliderPoint> {
        let ctx = self.active_context();
        let mut point = {
            let snapshot = ctx.snapshot.read().await;
            timeline::index_at_slider(&snapshot, position)
        };
        if point == SliderPoint::Empty {
            ctx.refresh_manifest().await?;
            let snapshot = ctx.snapshot.read().await;
            point = timeline::index_at_slider(&snapshot, position);
        }
        if let SliderPoint::Valid(index) = point {
            self.live.store(false, Ordering::Release);
            self.play(index).await?;
        }
        Ok(point)
    }

    /// Jump to the live edge and keep tracking it.
    pub async fn go_live(&self) -> DvrResult<SliderPoint> {
        let ctx = self.active_context();
        ctx.refresh_manifest().await?;
        ctx.store.prefetch_recent(PREFETCH_RECENT).await;

        let point = {
            let snapshot = ctx.snapshot.read().await;
            timeline::index_at_slider(&snapshot, SLIDER_SLOTS)
        };
        if let SliderPoint::Valid(index) = point {
            self.play(index).await?;
            self.live.store(true, Ordering::Release);
        }
        Ok(point)
    }

    /// Switch channels. Stops playback; the new channel's manifest is
    /// fetched immediately so seeks resolve without a cold start.
    pub async fn set_channel(&self, channel: Channel) -> DvrResult<()> {
        let ctx = self
            .contexts
            .get(channel.0)
            .ok_or(DvrError::UnknownChannel(channel.0))?
            .clone();
        self.stop();
        self.active.store(channel.0, Ordering::Release);
        ctx.refresh_manifest().await
    }

    /// Assemble the cached segments spanning `[start, end]` into one file.
    /// Both endpoints must resolve to known segments.
    pub async fn record(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        label: &str,
        out_dir: &std::path::Path,
    ) -> DvrResult<PathBuf> {
        let ctx = self.active_context();

        let resolve = |snapshot: &ManifestSnapshot, time| {
            timeline::index_at_time(snapshot, Utc::now(), time)
        };
        let (mut from, mut to) = {
            let snapshot = ctx.snapshot.read().await;
            (resolve(&snapshot, start), resolve(&snapshot, end))
        };
        if matches!(from, TimelinePoint::Empty | TimelinePoint::TooOld)
            || matches!(to, TimelinePoint::Empty | TimelinePoint::TooOld)
        {
            ctx.refresh_manifest().await?;
            let snapshot = ctx.snapshot.read().await;
            from = resolve(&snapshot, start);
            to = resolve(&snapshot, end);
        }
        let TimelinePoint::Valid(first) = from else {
            return Err(DvrError::Unreachable(from));
        };
        let TimelinePoint::Valid(last) = to else {
            return Err(DvrError::Unreachable(to));
        };
        let (first, last) = (first.min(last), first.max(last));

        recording::assemble(&ctx.store, &ctx.name, first..=last, start, end, label, out_dir)
            .await
    }

    pub fn shutdown(&self) {
        self.stop();
        self.cancel.cancel();
    }

    async fn serve_notifications(
        player: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<EngineNotify>,
    ) {
        loop {
            let message = tokio::select! {
                _ = player.cancel.cancelled() => break,
                message = notifications.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            match message {
                EngineNotify::NeedLookahead { index } => {
                    tokio::spawn(Self::serve_lookahead(player.clone(), index));
                }
                EngineNotify::AdvancedTo(index) => {
                    player.events.emit(PlayerEvent::CurrentIndexChanged(index));
                    let ctx = player.active_context();
                    tokio::spawn(async move {
                        if let Err(e) = ctx.request_index(index + 1, false).await {
                            tracing::debug!("Failed to schedule next segment: {e}");
                        }
                    });
                }
                EngineNotify::Starved => {
                    tracing::warn!("Playback starved, stopping");
                    player.engine.finalize_starved();
                }
            }
        }
    }

    /// Serve one decode-ahead request: wait for the next segment's bytes,
    /// then decode the current and next segment as one continuous stream
    /// and hand the tail to the engine.
    ///
    /// Decoding across the boundary keeps the codec warm, so the seam
    /// between segments is sample-exact instead of clicking.
    async fn serve_lookahead(player: Arc<Self>, index: u64) {
        let ctx = player.active_context();
        let token = player.engine.new_lookahead_token();
        let deadline = tokio::time::Instant::now() + player.config.retry_deadline();

        loop {
            if ctx.store.is_cached(index) {
                break;
            }
            match ctx.request_index(index, false).await {
                Ok(FetchOutcome::Ready) => break,
                Ok(_) => {}
                Err(e) => tracing::debug!("Lookahead request for {index} failed: {e}"),
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Lookahead for segment {index} timed out");
                player.engine.abort_lookahead(index);
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(player.config.lookahead_poll()) => {}
            }
        }

        let Some(next_path) = ctx.store.path_for_index(index, false).await else {
            player.engine.abort_lookahead(index);
            return;
        };
        let current_path = ctx.store.path_for_index(index.saturating_sub(1), false).await;

        let audio = match Self::decode_tail(&player, current_path, next_path).await {
            Ok(audio) => audio,
            Err(e) => {
                tracing::warn!("Decode-ahead of segment {index} failed: {e}");
                player.engine.abort_lookahead(index);
                return;
            }
        };
        if token.is_cancelled() {
            return;
        }
        player.engine.install_lookahead(index, audio);
    }

    async fn decode_tail(
        player: &Player,
        current_path: Option<PathBuf>,
        next_path: PathBuf,
    ) -> DvrResult<decode::DecodedAudio> {
        let extension = file_extension(&next_path);
        let next_bytes = tokio::fs::read(&next_path).await?;

        // With the current segment evicted mid-play there is nothing to
        // warm the decoder with; decode the next one alone.
        let Some(current_path) = current_path else {
            return spawn_decode(next_bytes, extension).await;
        };

        let mut combined = tokio::fs::read(&current_path).await?;
        combined.extend_from_slice(&next_bytes);
        let skip = player.engine.current_frames();
        let audio = spawn_decode(combined, extension).await?;
        Ok(audio.split_tail(skip))
    }

    async fn run_eviction(player: Arc<Self>) {
        let mut interval = tokio::time::interval(player.config.eviction_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = player.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            for ctx in &player.contexts {
                if let Err(e) = ctx.store.evict().await {
                    tracing::warn!("Eviction failed for {}: {e}", ctx.name);
                }
            }
        }
    }

    async fn run_live_refresh(player: Arc<Self>) {
        let mut interval = tokio::time::interval(player.config.live_refresh());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = player.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !player.is_live() {
                continue;
            }
            let ctx = player.active_context();
            if let Err(e) = ctx.refresh_manifest().await {
                tracing::debug!("Live refresh failed: {e}");
                continue;
            }
            ctx.store.prefetch_recent(PREFETCH_RECENT).await;
        }
    }
}

async fn decode_file(path: PathBuf) -> DvrResult<decode::DecodedAudio> {
    let extension = file_extension(&path);
    let bytes = tokio::fs::read(&path).await?;
    spawn_decode(bytes, extension).await
}

async fn spawn_decode(
    bytes: Vec<u8>,
    extension: Option<String>,
) -> DvrResult<decode::DecodedAudio> {
    tokio::task::spawn_blocking(move || decode::decode_bytes(bytes, extension.as_deref())).await?
}

fn file_extension(path: &std::path::Path) -> Option<String> {
    path.extension().and_then(|e| e.to_str()).map(str::to_string)
}
