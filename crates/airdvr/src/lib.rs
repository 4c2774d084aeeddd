//! DVR core for live audio broadcasts: manifest tracking, a disk-backed
//! segment cache with download scheduling and eviction, time/slider/index
//! resolution, gapless real-time playback and recording assembly.

pub mod config;
pub mod error;
pub mod events;
pub mod manifest;
pub mod playback;
pub mod player;
pub mod recording;
pub mod store;
pub mod timeline;

pub use config::{ChannelConfig, EvictionPolicy, PlayerConfig};
pub use error::{DvrError, DvrResult};
pub use events::PlayerEvent;
pub use playback::PlaybackState;
pub use player::Player;
pub use timeline::{SliderPoint, TimelinePoint, SLIDER_SLOTS};

/// Identifier of a configured channel, indexing into
/// [`PlayerConfig::channels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(pub usize);
