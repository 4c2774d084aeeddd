use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::{Duration, Utc};
use clap::Parser;

use airdvr::{ChannelConfig, EvictionPolicy, Player, PlayerConfig, SliderPoint, TimelinePoint};

#[derive(Parser, Debug)]
#[clap(about = "DVR playback for live audio broadcasts")]
struct DvrplayArgs {
    /// Channel to play, as "name=base-url". Repeatable; the first one is
    /// selected at startup.
    #[clap(short, long = "channel", required = true)]
    channels: Vec<String>,

    /// Segment cache directory
    #[clap(long, default_value = "cache")]
    cache_dir: PathBuf,

    /// Manifest filename, relative to each channel's base URL
    #[clap(long, default_value = "chunklist_DVR.m3u8")]
    manifest: String,

    /// Playback volume, 0-100
    #[clap(short, long, default_value = "80")]
    volume: u8,

    /// Start this many seconds behind the live edge instead of at it
    #[clap(short, long)]
    seek_back: Option<i64>,

    /// Cache size budget per channel, in megabytes
    #[clap(long)]
    max_cache_mb: Option<u64>,

    /// Evict cached segments older than this many seconds
    #[clap(long)]
    max_cache_age: Option<u64>,

    /// Instead of playing, save the last N seconds to a recording and exit
    #[clap(long)]
    record_last: Option<i64>,

    /// Label for the recording filename
    #[clap(long, default_value = "recording")]
    label: String,

    /// Directory recordings are written to
    #[clap(long, default_value = ".")]
    out_dir: PathBuf,
}

fn parse_channels(raw: &[String]) -> anyhow::Result<Vec<ChannelConfig>> {
    raw.iter()
        .map(|spec| {
            let (name, base_url) = spec
                .split_once('=')
                .with_context(|| format!("expected name=url, got: {spec}"))?;
            Ok(ChannelConfig {
                name: name.to_string(),
                base_url: base_url.to_string(),
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = DvrplayArgs::parse();
    let config = PlayerConfig {
        channels: parse_channels(&args.channels)?,
        cache_dir: args.cache_dir,
        manifest_file: args.manifest,
        eviction: EvictionPolicy {
            max_bytes: args.max_cache_mb.map(|mb| mb * 1024 * 1024),
            max_age_secs: args.max_cache_age,
        },
        ..Default::default()
    };

    let player = Player::new(config)?;
    player.set_volume(args.volume);

    if let Some(seconds) = args.record_last {
        let end = Utc::now();
        let start = end - Duration::seconds(seconds);
        // The manifest is cold at startup; record() fetches it on demand.
        let path = player.record(start, end, &args.label, &args.out_dir).await?;
        println!("{}", path.display());
        player.shutdown();
        return Ok(());
    }

    match args.seek_back {
        Some(seconds) => {
            let target = Utc::now() - Duration::seconds(seconds);
            match player.seek_to_time(target).await? {
                TimelinePoint::Valid(index) => {
                    tracing::info!("Playing from segment {index} ({seconds}s behind live)")
                }
                point => bail!("cannot seek {seconds}s back: {point:?}"),
            }
        }
        None => match player.go_live().await? {
            SliderPoint::Valid(index) => tracing::info!("Live from segment {index}"),
            SliderPoint::Empty => bail!("manifest has no playable segments yet"),
        },
    }

    let mut events = player.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => tracing::debug!(?event, "player event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    player.shutdown();
    Ok(())
}
