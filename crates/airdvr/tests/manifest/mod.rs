use std::time::Duration;

use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use airdvr::{store::StoreTuning, EvictionPolicy, PlayerEvent};

use crate::helpers::{playlist_body, TestChannel, MANIFEST_FILE};

#[tokio::test]
async fn test_fetch_populates_snapshot_and_emits() -> anyhow::Result<()> {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    ctx.mock_manifest(&playlist_body(100, 6), 1).await;

    let mut rx = ctx.events.subscribe();
    ctx.fetcher.fetch().await?;

    let snapshot = ctx.snapshot.read().await;
    assert_eq!(snapshot.newest_index(), Some(105));
    assert!(snapshot.loaded_at.is_some());
    assert_eq!(snapshot.descriptor(100).unwrap().duration_ms, 10_000);

    assert_eq!(
        rx.recv().await?,
        PlayerEvent::ManifestReceived {
            channel: ctx.channel
        }
    );
    Ok(())
}

#[tokio::test]
async fn test_concurrent_fetches_coalesce_during_cooldown() -> anyhow::Result<()> {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    // One request for the first fetch, one for the coalesced pair.
    ctx.mock_manifest(&playlist_body(100, 3), 2).await;

    ctx.fetcher.fetch().await?;
    let (a, b) = tokio::join!(ctx.fetcher.fetch(), ctx.fetcher.fetch());
    a?;
    b?;
    // Mock expectations are verified when the server drops.
    Ok(())
}

#[tokio::test]
async fn test_fetch_surfaces_http_errors() {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    Mock::given(method("GET"))
        .and(path(format!("/{MANIFEST_FILE}")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&ctx.server)
        .await;

    let result = tokio::time::timeout(Duration::from_secs(5), ctx.fetcher.fetch()).await;
    assert!(result.unwrap().is_err());
}
