// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `quota-sentinel` binary and
//! drive it through its log file, stdin commands, and signals.

use std::time::Duration;

use sentinel::usage::UpdateCause;
use sentinel_specs::{run_to_exit, SentinelProcess};

const TIMEOUT: Duration = Duration::from_secs(10);

const BUCKETS: &str = r#"{"buckets":[
    {"id":"A","limit":100,"sources":["m1"]},
    {"id":"B","limit":200,"sources":["m1","m2"]}
]}"#;

#[tokio::test]
async fn startup_publishes_builtin_buckets() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::start()?;

    let event = sentinel.next_event(TIMEOUT).await?;
    assert_eq!(event.seq(), 1);
    assert_eq!(event.cause(), UpdateCause::Refresh);
    assert_eq!(event.buckets().keys().collect::<Vec<_>>(), vec!["tier-1", "tier-2"]);
    assert_eq!(event.buckets()["tier-1"].limit, 1_000_000);
    assert_eq!(event.buckets()["tier-2"].sources, vec!["claude-3-haiku", "gemini-flash"]);
    assert!(event.buckets().values().all(|b| b.usage == 0.0));
    Ok(())
}

#[tokio::test]
async fn appended_usage_is_attributed() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::build().buckets(BUCKETS).spawn()?;
    sentinel.next_event(TIMEOUT).await?;

    sentinel.append_usage(&[("m1", 30.0), ("m2", 50.0)])?;
    let event = sentinel.wait_for(TIMEOUT, |e| e.buckets()["B"].usage == 80.0).await?;
    assert_eq!(event.cause(), UpdateCause::Attribution);
    assert_eq!(event.buckets()["A"].usage, 30.0);
    assert!((event.buckets()["A"].percentage - 30.0).abs() < f64::EPSILON);
    assert!((event.buckets()["B"].percentage - 40.0).abs() < f64::EPSILON);
    Ok(())
}

#[tokio::test]
async fn history_and_garbage_are_ignored() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::build()
        .buckets(BUCKETS)
        .history("{\"model\":\"m1\",\"token_count\":99}\n")
        .spawn()?;
    sentinel.next_event(TIMEOUT).await?;

    sentinel.append("{\"model\":\"m1\",\"token_count\":4}\n{oops\n\n{\"source\":\"m1\",\"amount\":6}\n")?;
    let event = sentinel.wait_for(TIMEOUT, |e| e.buckets()["A"].usage == 10.0).await?;
    assert_eq!(event.buckets()["B"].usage, 10.0);
    Ok(())
}

#[tokio::test]
async fn refresh_command_republishes() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::build().buckets(BUCKETS).spawn()?;
    let first = sentinel.next_event(TIMEOUT).await?;

    sentinel.send("refresh")?;
    let event = sentinel.next_event(TIMEOUT).await?;
    assert_eq!(event.cause(), UpdateCause::Refresh);
    assert!(event.seq() > first.seq());
    assert_eq!(event.buckets(), first.buckets());
    Ok(())
}

#[tokio::test]
async fn sigusr1_requests_snapshot() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::start()?;
    sentinel.next_event(TIMEOUT).await?;

    sentinel.signal("USR1")?;
    let event = sentinel.next_event(TIMEOUT).await?;
    assert_eq!(event.cause(), UpdateCause::Refresh);
    Ok(())
}

#[tokio::test]
async fn sigterm_exits_cleanly() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::start()?;
    sentinel.next_event(TIMEOUT).await?;

    sentinel.signal("TERM")?;
    let status = sentinel.wait_exit(TIMEOUT).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[tokio::test]
async fn quit_command_exits_cleanly() -> anyhow::Result<()> {
    let mut sentinel = SentinelProcess::start()?;
    sentinel.next_event(TIMEOUT).await?;

    sentinel.send("stats")?;
    sentinel.send("quit")?;
    let status = sentinel.wait_exit(TIMEOUT).await?;
    assert_eq!(status.code(), Some(0));
    Ok(())
}

#[test]
fn unknown_timezone_is_a_config_error() -> anyhow::Result<()> {
    let (status, stdout) = run_to_exit(&["--timezone", "Atlantis/Capital"])?;
    assert_eq!(status.code(), Some(2));
    assert!(stdout.is_empty());
    Ok(())
}

#[test]
fn duplicate_bucket_ids_are_a_config_error() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("buckets.json");
    std::fs::write(
        &path,
        r#"{"buckets":[{"id":"x","limit":1,"sources":[]},{"id":"x","limit":2,"sources":[]}]}"#,
    )?;

    let (status, stdout) = run_to_exit(&["--buckets", path.to_string_lossy().as_ref()])?;
    assert_eq!(status.code(), Some(2));
    assert!(stdout.is_empty());
    Ok(())
}

#[test]
fn zero_read_cap_is_a_config_error() -> anyhow::Result<()> {
    let (status, _) = run_to_exit(&["--max-read-bytes", "0"])?;
    assert_eq!(status.code(), Some(2));
    Ok(())
}
