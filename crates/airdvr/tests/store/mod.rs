use std::time::Duration;

use wiremock::{
    matchers::{method, path},
    Mock, ResponseTemplate,
};

use airdvr::{
    store::{FetchOutcome, StoreTuning},
    DvrError, EvictionPolicy,
};

use crate::helpers::{playlist_body, segment_file, wait_segment_ready, TestChannel};

fn fast_tuning() -> StoreTuning {
    StoreTuning {
        retry_interval: Duration::from_millis(50),
        retry_deadline: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_unknown_index_waits_for_manifest() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.mock_manifest(&playlist_body(100, 3), 1).await;
    ctx.mock_segment(101, b"payload").await;

    let mut rx = ctx.events.subscribe();

    // Nothing known yet: the request parks and asks for a manifest.
    assert_eq!(
        ctx.store.fetch_index(101, true).await?,
        FetchOutcome::NeedsManifest
    );
    assert!(!ctx.segment_exists(101));

    ctx.fetcher.fetch().await?;
    ctx.store.reconcile_waiters().await;

    wait_segment_ready(&mut rx, ctx.channel, 101).await;
    assert!(ctx.segment_exists(101));
    assert!(ctx.store.is_cached(101));
    Ok(())
}

#[tokio::test]
async fn test_cached_segment_is_ready_immediately() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;
    ctx.write_segment_file(100, b"payload");

    let mut rx = ctx.events.subscribe();
    assert_eq!(ctx.store.fetch_index(100, true).await?, FetchOutcome::Ready);
    wait_segment_ready(&mut rx, ctx.channel, 100).await;
    Ok(())
}

#[tokio::test]
async fn test_download_retries_transient_failures() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;

    // Two failures, then success.
    Mock::given(method("GET"))
        .and(path(format!("/{}", segment_file(100))))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&ctx.server)
        .await;
    ctx.mock_segment(100, b"payload").await;

    let mut rx = ctx.events.subscribe();
    assert_eq!(
        ctx.store.fetch_index(100, true).await?,
        FetchOutcome::Downloading
    );
    wait_segment_ready(&mut rx, ctx.channel, 100).await;

    let body = std::fs::read(ctx.dir.path().join(segment_file(100)))?;
    assert_eq!(body, b"payload");
    Ok(())
}

#[tokio::test]
async fn test_download_abandoned_after_deadline() -> anyhow::Result<()> {
    let tuning = StoreTuning {
        retry_interval: Duration::from_millis(50),
        retry_deadline: Duration::from_millis(200),
    };
    let ctx = TestChannel::new(tuning, EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;

    Mock::given(method("GET"))
        .and(path(format!("/{}", segment_file(100))))
        .respond_with(ResponseTemplate::new(500))
        .mount(&ctx.server)
        .await;

    assert_eq!(
        ctx.store.fetch_index(100, true).await?,
        FetchOutcome::Downloading
    );
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!ctx.segment_exists(100));
    assert!(!ctx.store.is_cached(100));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_share_one_download() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;

    Mock::given(method("GET"))
        .and(path(format!("/{}", segment_file(100))))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"payload".to_vec())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&ctx.server)
        .await;

    let mut rx = ctx.events.subscribe();
    assert_eq!(
        ctx.store.fetch_index(100, true).await?,
        FetchOutcome::Downloading
    );
    assert_eq!(
        ctx.store.fetch_index(100, true).await?,
        FetchOutcome::Downloading
    );
    wait_segment_ready(&mut rx, ctx.channel, 100).await;
    Ok(())
}

#[tokio::test]
async fn test_eviction_spares_playing_and_next() -> anyhow::Result<()> {
    let policy = EvictionPolicy {
        max_bytes: Some(0),
        max_age_secs: None,
    };
    let ctx = TestChannel::new(fast_tuning(), policy).await;
    for index in 100..103 {
        ctx.write_segment_file(index, b"payload");
    }
    ctx.guard.set_playing(ctx.channel, 101);

    ctx.store.evict().await?;

    assert!(!ctx.segment_exists(100));
    assert!(ctx.segment_exists(101));
    assert!(ctx.segment_exists(102));
    Ok(())
}

#[tokio::test]
async fn test_eviction_deferred_while_recording() -> anyhow::Result<()> {
    let policy = EvictionPolicy {
        max_bytes: Some(0),
        max_age_secs: None,
    };
    let ctx = TestChannel::new(fast_tuning(), policy).await;
    for index in 100..103 {
        ctx.write_segment_file(index, b"payload");
    }

    let session = ctx.guard.begin_recording(ctx.channel, 100..=101);
    ctx.store.evict().await?;
    for index in 100..103 {
        assert!(ctx.segment_exists(index));
    }

    drop(session);
    ctx.store.evict().await?;
    for index in 100..103 {
        assert!(!ctx.segment_exists(index));
    }
    Ok(())
}

#[tokio::test]
async fn test_warm_scan_discards_partial_downloads() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.write_segment_file(101, b"payload");
    let part = ctx.dir.path().join(format!("{}.part", segment_file(100)));
    std::fs::write(&part, b"partial")?;

    // A crashed run leaves .part files behind; a fresh store must not
    // treat them as cached segments.
    let store = ctx.reopen_store();
    assert!(store.is_cached(101));
    assert!(!store.is_cached(100));
    assert!(!part.exists());
    Ok(())
}

#[tokio::test]
async fn test_cached_paths_reports_first_gap() -> anyhow::Result<()> {
    let ctx = TestChannel::new(fast_tuning(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;
    ctx.write_segment_file(100, b"payload");
    ctx.write_segment_file(102, b"payload");

    let error = ctx.store.cached_paths(100..=102).await.unwrap_err();
    match error {
        DvrError::IncompleteRange { missing, .. } => assert_eq!(missing, 101),
        other => panic!("unexpected error: {other:?}"),
    }

    ctx.write_segment_file(101, b"payload");
    let paths = ctx.store.cached_paths(100..=102).await?;
    assert_eq!(paths.len(), 3);
    Ok(())
}
