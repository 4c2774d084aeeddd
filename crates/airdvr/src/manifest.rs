use std::{collections::BTreeMap, sync::Arc, sync::OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use tokio::sync::{Mutex, RwLock};
use url::Url;

use crate::{
    error::{DvrError, DvrResult},
    events::{EventBus, PlayerEvent},
    Channel,
};

/// One entry of the live manifest. Descriptors are inserted once per index
/// and never updated afterwards; the manifest is append-only from the
/// consumer's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub index: u64,
    pub duration_ms: u32,
    pub file_name: String,
}

/// All descriptors known for a channel, plus the wall-clock instant of the
/// last successful manifest fetch. The pair is enough to map any index to
/// an absolute time by walking durations backward from `loaded_at`.
#[derive(Debug, Clone, Default)]
pub struct ManifestSnapshot {
    pub segments: BTreeMap<u64, SegmentDescriptor>,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl ManifestSnapshot {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn newest_index(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    pub fn descriptor(&self, index: u64) -> Option<&SegmentDescriptor> {
        self.segments.get(&index)
    }

    /// Merge a parsed playlist into the snapshot. First-seen wins: indices
    /// already known keep their stored duration and filename. Returns the
    /// descriptors that were new to this snapshot.
    pub fn apply_playlist(
        &mut self,
        playlist: &m3u8_rs::MediaPlaylist,
        loaded_at: DateTime<Utc>,
    ) -> Vec<SegmentDescriptor> {
        let mut inserted = Vec::new();
        for segment in &playlist.segments {
            let Some(index) = segment_index(&segment.uri) else {
                tracing::warn!("Segment uri without index, skipping: {}", segment.uri);
                continue;
            };
            let duration_ms = (segment.duration * 1000.0).round() as u32;
            self.segments.entry(index).or_insert_with(|| {
                let descriptor = SegmentDescriptor {
                    index,
                    duration_ms,
                    file_name: segment.uri.clone(),
                };
                inserted.push(descriptor.clone());
                descriptor
            });
        }
        self.loaded_at = Some(loaded_at);
        inserted
    }
}

/// Recover the segment index as the last run of digits in the filename.
pub fn segment_index(file_name: &str) -> Option<u64> {
    static DIGITS: OnceLock<Regex> = OnceLock::new();
    let digits = DIGITS.get_or_init(|| Regex::new(r"\d+").unwrap());
    digits
        .find_iter(file_name)
        .last()
        .and_then(|m| m.as_str().parse().ok())
}

struct CooldownGate {
    next_allowed: tokio::time::Instant,
    deferred: bool,
}

/// Retrieves and parses the live manifest of one channel.
///
/// Outgoing requests are rate limited to one per cooldown interval;
/// requests arriving during the cooldown are deferred (coalesced into a
/// single fetch) and fire exactly when the cooldown expires.
pub struct ManifestFetcher {
    channel: Channel,
    client: Client,
    manifest_url: Url,
    snapshot: Arc<RwLock<ManifestSnapshot>>,
    cooldown: std::time::Duration,
    gate: Mutex<CooldownGate>,
    events: EventBus,
}

impl ManifestFetcher {
    pub fn new(
        channel: Channel,
        client: Client,
        manifest_url: Url,
        snapshot: Arc<RwLock<ManifestSnapshot>>,
        cooldown: std::time::Duration,
        events: EventBus,
    ) -> Self {
        Self {
            channel,
            client,
            manifest_url,
            snapshot,
            cooldown,
            gate: Mutex::new(CooldownGate {
                next_allowed: tokio::time::Instant::now(),
                deferred: false,
            }),
            events,
        }
    }

    pub fn snapshot(&self) -> Arc<RwLock<ManifestSnapshot>> {
        self.snapshot.clone()
    }

    /// Fetch and merge the manifest, honoring the per-channel cooldown.
    ///
    /// A call during the cooldown waits until it expires and then fires; if
    /// a deferred fetch is already armed the call returns immediately and
    /// lets it serve the request.
    pub async fn fetch(&self) -> DvrResult<()> {
        {
            let mut gate = self.gate.lock().await;
            let now = tokio::time::Instant::now();
            if now < gate.next_allowed {
                if gate.deferred {
                    return Ok(());
                }
                gate.deferred = true;
                let fire_at = gate.next_allowed;
                drop(gate);
                tokio::time::sleep_until(fire_at).await;
                let mut gate = self.gate.lock().await;
                gate.deferred = false;
                gate.next_allowed = tokio::time::Instant::now() + self.cooldown;
            } else {
                gate.next_allowed = now + self.cooldown;
            }
        }

        self.fetch_now().await
    }

    async fn fetch_now(&self) -> DvrResult<()> {
        let body = loop {
            match self.request_manifest().await {
                Ok(body) => break body,
                // Timeouts are re-issued immediately; any other failure
                // abandons this cycle and the next fetch recovers.
                Err(DvrError::RequestError(e)) if e.is_timeout() => {
                    tracing::debug!("Manifest request timed out, re-issuing");
                }
                Err(e) => {
                    tracing::warn!("Manifest fetch failed: {e}");
                    return Err(e);
                }
            }
        };

        let playlist = match m3u8_rs::parse_media_playlist_res(&body) {
            Ok(playlist) => playlist,
            Err(e) => return Err(DvrError::ManifestParseError(format!("{e:?}"))),
        };

        let inserted = {
            let mut snapshot = self.snapshot.write().await;
            snapshot.apply_playlist(&playlist, Utc::now())
        };
        tracing::debug!(
            channel = self.channel.0,
            new_segments = inserted.len(),
            "Manifest received"
        );

        self.events.emit(PlayerEvent::ManifestReceived {
            channel: self.channel,
        });
        Ok(())
    }

    async fn request_manifest(&self) -> DvrResult<bytes::Bytes> {
        let response = self.client.get(self.manifest_url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DvrError::HttpError(response.status()));
        }
        Ok(response.bytes().await?)
    }
}
