use chrono::{Duration, Utc};

use airdvr::{recording, store::StoreTuning, DvrError, EvictionPolicy};

use crate::helpers::TestChannel;

#[tokio::test]
async fn test_assemble_concatenates_in_index_order() -> anyhow::Result<()> {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;
    ctx.write_segment_file(100, b"AAA");
    ctx.write_segment_file(101, b"BBB");
    ctx.write_segment_file(102, b"CCC");

    let out = tempfile::tempdir()?;
    let end = Utc::now();
    let start = end - Duration::seconds(30);
    let path = recording::assemble(
        &ctx.store,
        "radio one",
        100..=102,
        start,
        end,
        "morning show",
        out.path(),
    )
    .await?;

    assert_eq!(std::fs::read(&path)?, b"AAABBBCCC");
    let name = path.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("radio one "));
    assert!(name.contains("morning show"));
    assert!(name.ends_with(".aac"));
    Ok(())
}

#[tokio::test]
async fn test_assemble_avoids_name_collisions() -> anyhow::Result<()> {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 2).await;
    ctx.write_segment_file(100, b"AAA");
    ctx.write_segment_file(101, b"BBB");

    let out = tempfile::tempdir()?;
    let end = Utc::now();
    let start = end - Duration::seconds(20);

    let first =
        recording::assemble(&ctx.store, "radio", 100..=101, start, end, "show", out.path())
            .await?;
    let second =
        recording::assemble(&ctx.store, "radio", 100..=101, start, end, "show", out.path())
            .await?;

    assert_ne!(first, second);
    assert!(second.to_str().unwrap().ends_with(" (2).aac"));
    assert_eq!(std::fs::read(&second)?, b"AAABBB");
    Ok(())
}

#[tokio::test]
async fn test_assemble_fails_on_gap_without_writing() -> anyhow::Result<()> {
    let ctx = TestChannel::new(StoreTuning::default(), EvictionPolicy::default()).await;
    ctx.seed_snapshot(100, 3).await;
    ctx.write_segment_file(100, b"AAA");
    ctx.write_segment_file(102, b"CCC");

    let out = tempfile::tempdir()?;
    let end = Utc::now();
    let start = end - Duration::seconds(30);
    let error = recording::assemble(
        &ctx.store,
        "radio",
        100..=102,
        start,
        end,
        "show",
        out.path(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        error,
        DvrError::IncompleteRange { missing: 101, .. }
    ));
    assert_eq!(std::fs::read_dir(out.path())?.count(), 0);
    Ok(())
}
