use chrono::{Duration, Utc};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use airdvr::{ChannelConfig, Player, PlayerConfig, TimelinePoint};

use crate::helpers::{playlist_body, segment_file, MANIFEST_FILE};

async fn mock_manifest_once(server: &MockServer, body: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/{MANIFEST_FILE}")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(1)
        .mount(server)
        .await;
}

fn player_config(server: &MockServer, cache_dir: &std::path::Path) -> PlayerConfig {
    PlayerConfig {
        channels: vec![ChannelConfig {
            name: "radio".to_string(),
            base_url: server.uri(),
        }],
        cache_dir: cache_dir.to_path_buf(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_record_refetches_cold_manifest_once() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    // Resolving both endpoints against the cold snapshot must cost exactly
    // one manifest request, verified when the server drops.
    mock_manifest_once(&server, &playlist_body(100, 10)).await;

    let cache = tempfile::tempdir()?;
    let channel_dir = cache.path().join("radio");
    std::fs::create_dir_all(&channel_dir)?;
    for index in 106..=108 {
        std::fs::write(channel_dir.join(segment_file(index)), format!("S{index}"))?;
    }

    let player = Player::new(player_config(&server, cache.path()))?;

    let out = tempfile::tempdir()?;
    let now = Utc::now();
    let recorded = player
        .record(
            now - Duration::seconds(35),
            now - Duration::seconds(15),
            "late show",
            out.path(),
        )
        .await?;

    assert_eq!(std::fs::read(&recorded)?, b"S106S107S108");
    player.shutdown();
    Ok(())
}

#[tokio::test]
async fn test_seek_gives_up_after_one_refetch() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mock_manifest_once(&server, &playlist_body(100, 10)).await;

    let cache = tempfile::tempdir()?;
    let player = Player::new(player_config(&server, cache.path()))?;

    // Cold snapshot: the seek refetches once, re-resolves, and reports the
    // target as unreachable instead of fetching again.
    let now = Utc::now();
    assert_eq!(
        player.seek_to_time(now - Duration::hours(7)).await?,
        TimelinePoint::Past
    );

    // Warm snapshot: unreachable points resolve without another request.
    assert_eq!(
        player.seek_to_time(now + Duration::seconds(60)).await?,
        TimelinePoint::Future
    );
    assert_eq!(
        player.seek_to_time(now - Duration::hours(2)).await?,
        TimelinePoint::DoesNotExist
    );

    player.shutdown();
    Ok(())
}
