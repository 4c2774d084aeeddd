//! Assembling cached segments into a single recording file.

use std::{
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::{error::DvrResult, store::SegmentStore};

/// Concatenate the cached segments covering `range` into one file under
/// `out_dir`.
///
/// Segments carry raw ADTS/TS payloads, so the recording is a plain byte
/// concatenation in index order. The range is pinned against eviction for
/// the duration of the copy; any gap fails the whole operation before a
/// single byte is written.
pub async fn assemble(
    store: &Arc<SegmentStore>,
    channel_name: &str,
    range: RangeInclusive<u64>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    label: &str,
    out_dir: &Path,
) -> DvrResult<PathBuf> {
    let paths = store.cached_paths(range.clone()).await?;
    let _session = store.guard().begin_recording(store.channel(), range.clone());

    let extension = paths
        .first()
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .unwrap_or("aac")
        .to_string();
    let stem = format!(
        "{} {} {} {}",
        sanitize(channel_name),
        start.format("%Y%m%d-%H%M%S"),
        end.format("%Y%m%d-%H%M%S"),
        sanitize(label),
    );
    let stem = stem.trim().to_string();

    tokio::fs::create_dir_all(out_dir).await?;
    let target = next_free_path(out_dir, &stem, &extension);

    let mut output = tokio::fs::File::create(&target).await?;
    for path in &paths {
        let mut segment = tokio::fs::File::open(path).await?;
        tokio::io::copy(&mut segment, &mut output).await?;
    }
    output.flush().await?;

    tracing::info!(
        segments = paths.len(),
        "Recording written to {}",
        target.display()
    );
    Ok(target)
}

/// First non-colliding path for the stem, appending ` (n)` on conflicts.
fn next_free_path(out_dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let candidate = out_dir.join(format!("{stem}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }
    for n in 2.. {
        let candidate = out_dir.join(format!("{stem} ({n}).{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Strip path separators and other filesystem-hostile characters from a
/// user-supplied name component.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
