use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// A single broadcast stream, identified by its base URL. The segment
/// manifest lives at `<base_url>/<manifest_file>` and segments at
/// `<base_url>/<file_name>`.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub base_url: String,
}

/// Size/age limits for the on-disk segment cache of one channel.
///
/// Both thresholds are independent; either may be disabled.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct EvictionPolicy {
    /// Total on-disk bytes per channel. Oldest files are removed first
    /// until the cache is back under budget.
    pub max_bytes: Option<u64>,
    /// Files older than this are removed regardless of total size.
    pub max_age_secs: Option<u64>,
}

impl EvictionPolicy {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }

    pub fn is_disabled(&self) -> bool {
        self.max_bytes.is_none() && self.max_age_secs.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub channels: Vec<ChannelConfig>,
    /// Root of the segment cache; one subdirectory per channel.
    pub cache_dir: PathBuf,
    /// Manifest filename, relative to each channel's base URL.
    pub manifest_file: String,

    /// Minimum interval between outgoing manifest requests per channel.
    pub manifest_cooldown_ms: u64,
    /// Interval between manifest refreshes while live-tracking.
    pub live_refresh_secs: u64,

    /// Delay between download retries on timeout-class errors.
    pub retry_interval_ms: u64,
    /// Downloads are abandoned once this much time has passed since the
    /// job was first requested.
    pub retry_deadline_secs: u64,

    pub eviction: EvictionPolicy,
    pub eviction_interval_secs: u64,

    /// Decode-ahead safety margin, in units of one callback frame window.
    /// Empirically tuned; raise it if the producer side cannot keep up.
    pub decode_ahead_margin: u32,
    /// Poll interval while waiting for the next segment to reach the disk
    /// cache during decode-ahead.
    pub lookahead_poll_ms: u64,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            cache_dir: PathBuf::from("cache"),
            manifest_file: "chunklist_DVR.m3u8".to_string(),
            manifest_cooldown_ms: 1000,
            live_refresh_secs: 9,
            retry_interval_ms: 1000,
            retry_deadline_secs: 60,
            eviction: EvictionPolicy::default(),
            eviction_interval_secs: 60,
            decode_ahead_margin: 100,
            lookahead_poll_ms: 100,
        }
    }
}

impl PlayerConfig {
    pub fn manifest_cooldown(&self) -> Duration {
        Duration::from_millis(self.manifest_cooldown_ms)
    }

    pub fn live_refresh(&self) -> Duration {
        Duration::from_secs(self.live_refresh_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_deadline(&self) -> Duration {
        Duration::from_secs(self.retry_deadline_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn lookahead_poll(&self) -> Duration {
        Duration::from_millis(self.lookahead_poll_ms)
    }
}
