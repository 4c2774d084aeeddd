use std::{
    collections::{BTreeSet, HashMap, HashSet},
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    config::EvictionPolicy,
    error::{DvrError, DvrResult},
    events::{EventBus, PlayerEvent},
    manifest::{segment_index, ManifestSnapshot, SegmentDescriptor},
    Channel,
};

/// Outcome of a [`SegmentStore::fetch_index`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The segment file is already on disk; a ready event was emitted if
    /// one was requested.
    Ready,
    /// A download job is in flight (newly enqueued or already pending).
    Downloading,
    /// The descriptor is unknown; the caller should refresh the manifest.
    /// The request stays registered and is served once a manifest names it.
    NeedsManifest,
}

const NO_CHANNEL: usize = usize::MAX;

/// Indices that eviction must not touch: the segment playback is currently
/// consuming (and its successor), plus any range an in-progress recording
/// is assembled from. Playback advances `playing_index` from the real-time
/// callback, so both fields are atomics.
pub struct EvictionGuard {
    playing_channel: AtomicUsize,
    playing_index: AtomicU64,
    recording: Mutex<Option<(Channel, RangeInclusive<u64>)>>,
}

impl EvictionGuard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            playing_channel: AtomicUsize::new(NO_CHANNEL),
            playing_index: AtomicU64::new(0),
            recording: Mutex::new(None),
        })
    }

    pub fn set_playing(&self, channel: Channel, index: u64) {
        self.playing_index.store(index, Ordering::Release);
        self.playing_channel.store(channel.0, Ordering::Release);
    }

    /// Called from the playback callback when consumption moves to the
    /// next segment.
    pub fn advance_playing(&self, index: u64) {
        self.playing_index.store(index, Ordering::Release);
    }

    pub fn clear_playing(&self) {
        self.playing_channel.store(NO_CHANNEL, Ordering::Release);
    }

    pub fn playing(&self, channel: Channel) -> Option<u64> {
        if self.playing_channel.load(Ordering::Acquire) == channel.0 {
            Some(self.playing_index.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn recording_active(&self) -> bool {
        self.recording.lock().is_some()
    }

    pub fn recording(&self, channel: Channel) -> Option<RangeInclusive<u64>> {
        match &*self.recording.lock() {
            Some((ch, range)) if *ch == channel => Some(range.clone()),
            _ => None,
        }
    }

    pub fn is_exempt(&self, channel: Channel, index: u64) -> bool {
        if let Some(playing) = self.playing(channel) {
            if index == playing || index == playing + 1 {
                return true;
            }
        }
        matches!(self.recording(channel), Some(range) if range.contains(&index))
    }

    /// Mark a recording as in progress for the lifetime of the returned
    /// session. Eviction is deferred entirely while one exists.
    pub fn begin_recording(
        self: &Arc<Self>,
        channel: Channel,
        range: RangeInclusive<u64>,
    ) -> RecordingSession {
        *self.recording.lock() = Some((channel, range));
        RecordingSession {
            guard: self.clone(),
        }
    }
}

pub struct RecordingSession {
    guard: Arc<EvictionGuard>,
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        *self.guard.recording.lock() = None;
    }
}

/// Download retry tuning. Defaults follow the broadcast timing (ten-second
/// segments, one-minute manifest churn); tests shrink them.
#[derive(Debug, Clone, Copy)]
pub struct StoreTuning {
    pub retry_interval: Duration,
    pub retry_deadline: Duration,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            retry_deadline: Duration::from_secs(60),
        }
    }
}

/// Disk-backed cache of segment bytes for one channel.
///
/// Downloads are deduplicated by URL, retried on transient failures until
/// a per-job deadline, and written with an atomic rename so readers never
/// observe a partial file. Eviction runs on the owner's timer and respects
/// the [`EvictionGuard`].
pub struct SegmentStore {
    channel: Channel,
    base_url: Url,
    cache_dir: PathBuf,
    client: Client,
    snapshot: Arc<RwLock<ManifestSnapshot>>,
    cached: Mutex<BTreeSet<u64>>,
    jobs: Mutex<HashSet<Url>>,
    waiters: Mutex<HashMap<u64, bool>>,
    guard: Arc<EvictionGuard>,
    policy: EvictionPolicy,
    tuning: StoreTuning,
    events: EventBus,
    cancel: CancellationToken,
}

impl SegmentStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        base_url: Url,
        cache_dir: PathBuf,
        client: Client,
        snapshot: Arc<RwLock<ManifestSnapshot>>,
        guard: Arc<EvictionGuard>,
        policy: EvictionPolicy,
        tuning: StoreTuning,
        events: EventBus,
        cancel: CancellationToken,
    ) -> DvrResult<Arc<Self>> {
        std::fs::create_dir_all(&cache_dir)?;

        // Warm the presence map from whatever survived the last run.
        let mut cached = BTreeSet::new();
        for entry in std::fs::read_dir(&cache_dir)? {
            let entry = entry?;
            let path = entry.path();
            // An interrupted download is garbage, not a cached segment.
            if path.extension().is_some_and(|e| e == "part") {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            if let Some(index) = entry.file_name().to_str().and_then(segment_index) {
                if entry.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false) {
                    cached.insert(index);
                }
            }
        }

        Ok(Arc::new(Self {
            channel,
            base_url,
            cache_dir,
            client,
            snapshot,
            cached: Mutex::new(cached),
            jobs: Mutex::new(HashSet::new()),
            waiters: Mutex::new(HashMap::new()),
            guard,
            policy,
            tuning,
            events,
            cancel,
        }))
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn guard(&self) -> Arc<EvictionGuard> {
        self.guard.clone()
    }

    fn segment_path(&self, file_name: &str) -> PathBuf {
        self.cache_dir.join(file_name.replace('/', "__"))
    }

    /// Make the segment available on disk.
    ///
    /// When the file is already present a `SegmentReady` event is emitted
    /// right away if `notify` is set; subscribers receive it through the
    /// event bus, never by reentering the caller's stack.
    pub async fn fetch_index(self: &Arc<Self>, index: u64, notify: bool) -> DvrResult<FetchOutcome> {
        let descriptor = self.snapshot.read().await.descriptor(index).cloned();
        let Some(descriptor) = descriptor else {
            let mut waiters = self.waiters.lock();
            let entry = waiters.entry(index).or_insert(false);
            *entry |= notify;
            return Ok(FetchOutcome::NeedsManifest);
        };

        let path = self.segment_path(&descriptor.file_name);
        if file_present(&path) {
            self.mark_cached(index);
            if notify {
                self.events.emit(PlayerEvent::SegmentReady {
                    channel: self.channel,
                    index,
                });
            }
            return Ok(FetchOutcome::Ready);
        }

        self.spawn_download(descriptor, notify)?;
        Ok(FetchOutcome::Downloading)
    }

    /// Non-blocking lookup of the on-disk location of a segment.
    ///
    /// With `prefetch` set, a missing-but-known segment is scheduled for
    /// download in the background (one-shot, not retried here).
    pub async fn path_for_index(self: &Arc<Self>, index: u64, prefetch: bool) -> Option<PathBuf> {
        let descriptor = self.snapshot.read().await.descriptor(index).cloned()?;
        let path = self.segment_path(&descriptor.file_name);
        if file_present(&path) {
            self.mark_cached(index);
            return Some(path);
        }

        // Descriptor known, file missing: a cache inconsistency, resolved
        // by fetching again rather than surfacing an error.
        self.mark_evicted(index);
        if prefetch {
            if let Err(e) = self.spawn_download(descriptor, false) {
                tracing::warn!("Failed to schedule prefetch of segment {index}: {e}");
            }
        }
        None
    }

    pub fn is_cached(&self, index: u64) -> bool {
        self.cached.lock().contains(&index)
    }

    /// Serve "waiting for index N" registrations that a fresh manifest can
    /// now satisfy. Indices still unknown stay registered.
    pub async fn reconcile_waiters(self: &Arc<Self>) {
        let pending: Vec<(u64, bool)> = self.waiters.lock().iter().map(|(i, n)| (*i, *n)).collect();
        for (index, notify) in pending {
            let descriptor = self.snapshot.read().await.descriptor(index).cloned();
            let Some(descriptor) = descriptor else {
                continue;
            };
            self.waiters.lock().remove(&index);

            let path = self.segment_path(&descriptor.file_name);
            if file_present(&path) {
                self.mark_cached(index);
                if notify {
                    self.events.emit(PlayerEvent::SegmentReady {
                        channel: self.channel,
                        index,
                    });
                }
            } else if let Err(e) = self.spawn_download(descriptor, notify) {
                tracing::warn!("Failed to schedule download of segment {index}: {e}");
            }
        }
    }

    /// Schedule downloads for the most recent known segments so live
    /// playback has data ready.
    pub async fn prefetch_recent(self: &Arc<Self>, count: usize) {
        let recent: Vec<SegmentDescriptor> = {
            let snapshot = self.snapshot.read().await;
            snapshot.segments.values().rev().take(count).cloned().collect()
        };
        for descriptor in recent {
            if file_present(&self.segment_path(&descriptor.file_name)) {
                self.mark_cached(descriptor.index);
                continue;
            }
            if let Err(e) = self.spawn_download(descriptor, false) {
                tracing::warn!("Failed to schedule prefetch: {e}");
            }
        }
    }

    fn spawn_download(self: &Arc<Self>, descriptor: SegmentDescriptor, notify: bool) -> DvrResult<()> {
        let url = self.base_url.join(&descriptor.file_name)?;
        {
            // At most one job per URL.
            let mut jobs = self.jobs.lock();
            if !jobs.insert(url.clone()) {
                return Ok(());
            }
        }

        let store = self.clone();
        tokio::spawn(async move {
            store.run_download(&url, &descriptor, notify).await;
            store.jobs.lock().remove(&url);
        });
        Ok(())
    }

    async fn run_download(&self, url: &Url, descriptor: &SegmentDescriptor, notify: bool) {
        let deadline = tokio::time::Instant::now() + self.tuning.retry_deadline;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            match self.try_download(url, descriptor).await {
                Ok(()) => {
                    tracing::debug!(
                        channel = self.channel.0,
                        index = descriptor.index,
                        "Segment downloaded"
                    );
                    self.mark_cached(descriptor.index);
                    if notify {
                        self.events.emit(PlayerEvent::SegmentReady {
                            channel: self.channel,
                            index: descriptor.index,
                        });
                    }
                    return;
                }
                Err(e) if is_transient(&e) => {
                    let retry_at = tokio::time::Instant::now() + self.tuning.retry_interval;
                    if retry_at > deadline {
                        // The manifest will eventually roll past this
                        // segment; no user-visible error.
                        tracing::warn!(
                            "Giving up on segment {} after retry deadline: {e}",
                            descriptor.index
                        );
                        return;
                    }
                    tracing::debug!("Retrying segment {}: {e}", descriptor.index);
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep_until(retry_at) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("Segment {} download failed: {e}", descriptor.index);
                    return;
                }
            }
        }
    }

    async fn try_download(&self, url: &Url, descriptor: &SegmentDescriptor) -> DvrResult<()> {
        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DvrError::HttpError(response.status()));
        }
        let bytes = response.bytes().await?;

        let path = self.segment_path(&descriptor.file_name);
        let part = path.with_file_name(format!(
            "{}.part",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("segment")
        ));
        tokio::fs::write(&part, &bytes).await?;
        // Readers (decode-ahead, recording assembly) only ever see the
        // final name, and only complete files.
        tokio::fs::rename(&part, &path).await?;
        Ok(())
    }

    /// On-disk paths for every segment in the range, in index order.
    ///
    /// Fails on the first gap: an unknown descriptor or a missing file.
    pub async fn cached_paths(&self, range: RangeInclusive<u64>) -> DvrResult<Vec<PathBuf>> {
        let snapshot = self.snapshot.read().await;
        let mut paths = Vec::with_capacity(range.clone().count());
        for index in range.clone() {
            let missing = || DvrError::IncompleteRange {
                start: *range.start(),
                end: *range.end(),
                missing: index,
            };
            let descriptor = snapshot.descriptor(index).ok_or_else(missing)?;
            let path = self.segment_path(&descriptor.file_name);
            if !file_present(&path) {
                return Err(missing());
            }
            paths.push(path);
        }
        Ok(paths)
    }

    fn mark_cached(&self, index: u64) {
        self.cached.lock().insert(index);
    }

    fn mark_evicted(&self, index: u64) {
        self.cached.lock().remove(&index);
    }

    /// Apply the eviction policy once.
    ///
    /// Deferred entirely while a recording is active. Files backing the
    /// currently-playing index, its successor, or a recording range are
    /// never removed.
    pub async fn evict(&self) -> DvrResult<()> {
        if self.policy.is_disabled() {
            return Ok(());
        }
        if self.guard.recording_active() {
            return Ok(());
        }

        struct CacheFile {
            path: PathBuf,
            index: Option<u64>,
            len: u64,
            modified: SystemTime,
        }

        let mut files = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            files.push(CacheFile {
                index: entry.file_name().to_str().and_then(segment_index),
                path: entry.path(),
                len: metadata.len(),
                modified: metadata.modified()?,
            });
        }
        files.sort_by_key(|f| f.modified);

        let exempt = |file: &CacheFile| match file.index {
            Some(index) => self.guard.is_exempt(self.channel, index),
            None => false,
        };

        let mut removed = vec![false; files.len()];

        if let Some(max_age) = self.policy.max_age() {
            let now = SystemTime::now();
            for (i, file) in files.iter().enumerate() {
                let expired = now
                    .duration_since(file.modified)
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if expired && !exempt(file) {
                    removed[i] = true;
                }
            }
        }

        if let Some(max_bytes) = self.policy.max_bytes {
            let mut total: u64 = files
                .iter()
                .zip(&removed)
                .filter(|(_, r)| !**r)
                .map(|(f, _)| f.len)
                .sum();
            // Oldest first until back under budget.
            for (i, file) in files.iter().enumerate() {
                if total <= max_bytes {
                    break;
                }
                if removed[i] || exempt(file) {
                    continue;
                }
                removed[i] = true;
                total -= file.len;
            }
        }

        let mut evicted = 0usize;
        for (file, _) in files.iter().zip(&removed).filter(|(_, r)| **r) {
            if let Err(e) = tokio::fs::remove_file(&file.path).await {
                tracing::warn!("Failed to evict {}: {e}", file.path.display());
                continue;
            }
            if let Some(index) = file.index {
                self.mark_evicted(index);
            }
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(channel = self.channel.0, evicted, "Cache eviction pass");
        }
        Ok(())
    }
}

fn file_present(path: &Path) -> bool {
    path.metadata().map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

fn is_transient(error: &DvrError) -> bool {
    match error {
        DvrError::RequestError(e) => e.is_timeout() || e.is_connect(),
        // The newest segment regularly 404s until the broadcaster has
        // finished writing it.
        DvrError::HttpError(status) => {
            status.is_server_error() || *status == reqwest::StatusCode::NOT_FOUND
        }
        _ => false,
    }
}
