//! Conversions between wall-clock time, slider position and segment index.
//!
//! All functions are pure over a [`ManifestSnapshot`]; callers decide how to
//! react to non-`Valid` results (usually by refetching the manifest once).

use chrono::{DateTime, Duration, Utc};

use crate::manifest::ManifestSnapshot;

/// Number of slots on the seek slider. One slot per nominal ten-second
/// segment gives a six-hour window.
pub const SLIDER_SLOTS: u16 = 2160;

/// Manifests older than this are considered stale for time resolution.
pub const STALE_AFTER_SECS: i64 = 60;

/// The retention horizon: seeking further back than this from `loaded_at`
/// is outside the broadcaster's DVR window.
pub const RETENTION_SECS: i64 = 6 * 3600;

/// Result of resolving a wall-clock time against the manifest.
///
/// A closed set: every caller must branch on all variants. There is no
/// catch-all and no way to construct an "unknown" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelinePoint {
    /// The time falls inside the segment with this index.
    Valid(u64),
    /// No descriptors are known yet; fetch the manifest first.
    Empty,
    /// The requested time is after `now`.
    Future,
    /// The manifest is too stale to resolve against; refetch it.
    TooOld,
    /// The time predates the retention horizon.
    Past,
    /// The time is inside the window but no known segment covers it.
    DoesNotExist,
}

/// Result of resolving a slider position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliderPoint {
    Valid(u64),
    Empty,
}

/// Map a wall-clock time to the segment index covering it.
///
/// Walks descriptors newest to oldest, subtracting each duration from a
/// running clock seeded at `loaded_at`, and stops at the first index whose
/// start lies at or before `time`.
pub fn index_at_time(
    snapshot: &ManifestSnapshot,
    now: DateTime<Utc>,
    time: DateTime<Utc>,
) -> TimelinePoint {
    let Some(loaded_at) = snapshot.loaded_at else {
        return TimelinePoint::Empty;
    };
    if snapshot.is_empty() {
        return TimelinePoint::Empty;
    }
    if time > now {
        return TimelinePoint::Future;
    }
    if now - loaded_at > Duration::seconds(STALE_AFTER_SECS) {
        return TimelinePoint::TooOld;
    }
    if time < loaded_at - Duration::seconds(RETENTION_SECS) {
        return TimelinePoint::Past;
    }

    let mut clock = loaded_at;
    for descriptor in snapshot.segments.values().rev() {
        clock -= Duration::milliseconds(descriptor.duration_ms as i64);
        if clock <= time {
            return TimelinePoint::Valid(descriptor.index);
        }
    }
    TimelinePoint::DoesNotExist
}

/// Map a slider position in `[0, SLIDER_SLOTS]` to a segment index.
///
/// The slider is a fixed window onto the newest `SLIDER_SLOTS` known
/// indices, padded on the left by the oldest known index when fewer exist.
/// The maximum position maps to the *second-to-last* known index: the
/// newest segment is frequently not yet downloadable.
pub fn index_at_slider(snapshot: &ManifestSnapshot, position: u16) -> SliderPoint {
    let position = position.min(SLIDER_SLOTS);
    if snapshot.segments.len() < 2 {
        return SliderPoint::Empty;
    }

    // position == SLIDER_SLOTS is one segment behind the newest; every slot
    // to the left goes one more segment back, clamped at the oldest known.
    let behind_newest = (SLIDER_SLOTS - position) as usize + 1;
    let offset = behind_newest.min(snapshot.segments.len() - 1);
    match snapshot.segments.keys().rev().nth(offset) {
        Some(index) => SliderPoint::Valid(*index),
        None => SliderPoint::Empty,
    }
}

/// Inverse of [`index_at_slider`]: the slot a given index sits at.
///
/// Returns `None` when the index is unknown. The newest index saturates at
/// the maximum slot, tied with the second-to-last: the forward mapping
/// reserves the maximum slot for the second-to-last index, so the newest
/// has no slot of its own and positions are strictly increasing only over
/// the indices the slider can actually reach.
pub fn slider_position(snapshot: &ManifestSnapshot, index: u64) -> Option<u16> {
    if !snapshot.segments.contains_key(&index) {
        return None;
    }
    let behind_newest = snapshot.segments.range(index + 1..).count();
    let position = (SLIDER_SLOTS as usize + 1).saturating_sub(behind_newest);
    Some(position.min(SLIDER_SLOTS as usize) as u16)
}

/// Whether a display slider should be re-synchronized to `actual`.
///
/// Small drift is tolerated so the player does not fight a user-held
/// slider with per-segment updates.
pub fn drift_exceeds(displayed: u16, actual: u16, tolerance: u16) -> bool {
    displayed.abs_diff(actual) > tolerance
}

/// Start time of a known segment, derived by walking durations backward
/// from `loaded_at`.
pub fn time_of_index(snapshot: &ManifestSnapshot, index: u64) -> Option<DateTime<Utc>> {
    let loaded_at = snapshot.loaded_at?;
    if !snapshot.segments.contains_key(&index) {
        return None;
    }
    let newer_ms: i64 = snapshot
        .segments
        .range(index..)
        .map(|(_, d)| d.duration_ms as i64)
        .sum();
    Some(loaded_at - Duration::milliseconds(newer_ms))
}
