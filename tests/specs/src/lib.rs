// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `quota-sentinel` binary against a scratch log file, feeds
//! it commands on stdin, and reads published events from stdout.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::time::Duration;

use tokio::sync::mpsc;

use sentinel::usage::QuotaEvent;

/// Resolve the path to the compiled `quota-sentinel` binary.
pub fn sentinel_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("quota-sentinel")
}

/// Run the binary with `args` to completion, returning its exit status and
/// stdout. For configuration errors that exit immediately.
pub fn run_to_exit(args: &[&str]) -> anyhow::Result<(ExitStatus, String)> {
    let binary = sentinel_binary();
    anyhow::ensure!(binary.exists(), "quota-sentinel binary not found at {}", binary.display());
    let output = Command::new(&binary)
        .args(args)
        .args(["--log-level", "warn"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    Ok((output.status, String::from_utf8(output.stdout)?))
}

/// A running `quota-sentinel` process that is killed on drop.
pub struct SentinelProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<String>,
    log_path: PathBuf,
    _dir: tempfile::TempDir,
}

/// Builder for the flags a [`SentinelProcess`] starts with.
#[derive(Default)]
pub struct SentinelBuilder {
    buckets: Option<String>,
    timezone: Option<String>,
    preexisting: Option<String>,
}

impl SentinelBuilder {
    /// Use this JSON as the `--buckets` file.
    pub fn buckets(mut self, json: &str) -> Self {
        self.buckets = Some(json.to_owned());
        self
    }

    pub fn timezone(mut self, tz: &str) -> Self {
        self.timezone = Some(tz.to_owned());
        self
    }

    /// Write this content to the log before the process starts.
    pub fn history(mut self, content: &str) -> Self {
        self.preexisting = Some(content.to_owned());
        self
    }

    pub fn spawn(self) -> anyhow::Result<SentinelProcess> {
        let binary = sentinel_binary();
        anyhow::ensure!(binary.exists(), "quota-sentinel binary not found at {}", binary.display());

        let dir = tempfile::tempdir()?;
        let log_path = dir.path().join("usage.log");
        std::fs::write(&log_path, self.preexisting.unwrap_or_default())?;

        let mut args: Vec<String> = vec![
            "--log-path".into(),
            log_path.to_string_lossy().into_owned(),
            "--poll-ms".into(),
            "50".into(),
            "--reset-tick-ms".into(),
            "50".into(),
            "--log-format".into(),
            "text".into(),
            "--log-level".into(),
            "warn".into(),
        ];
        if let Some(json) = self.buckets {
            let path = dir.path().join("buckets.json");
            std::fs::write(&path, json)?;
            args.extend(["--buckets".into(), path.to_string_lossy().into_owned()]);
        }
        if let Some(tz) = self.timezone {
            args.extend(["--timezone".into(), tz]);
        }

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout pipe"))?;
        let (tx, events) = mpsc::unbounded_channel();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(SentinelProcess { child, stdin, events, log_path, _dir: dir })
    }
}

impl SentinelProcess {
    pub fn build() -> SentinelBuilder {
        SentinelBuilder::default()
    }

    /// Spawn with built-in buckets and default timezone.
    pub fn start() -> anyhow::Result<Self> {
        Self::build().spawn()
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Append raw text to the tailed log.
    pub fn append(&self, text: &str) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new().append(true).open(&self.log_path)?;
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    /// Append one usage line per `(model, tokens)` pair.
    pub fn append_usage(&self, entries: &[(&str, f64)]) -> anyhow::Result<()> {
        let text: String = entries
            .iter()
            .map(|(model, tokens)| format!("{{\"model\":\"{model}\",\"token_count\":{tokens}}}\n"))
            .collect();
        self.append(&text)
    }

    /// Write a command line to stdin.
    pub fn send(&mut self, command: &str) -> anyhow::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| anyhow::anyhow!("stdin closed"))?;
        writeln!(stdin, "{command}")?;
        stdin.flush()?;
        Ok(())
    }

    /// Deliver a signal by name (e.g. `TERM`, `USR1`) via `kill`.
    pub fn signal(&self, name: &str) -> anyhow::Result<()> {
        let status =
            Command::new("kill").arg(format!("-{name}")).arg(self.pid().to_string()).status()?;
        anyhow::ensure!(status.success(), "kill -{name} failed");
        Ok(())
    }

    /// Next event printed on stdout.
    pub async fn next_event(&mut self, timeout: Duration) -> anyhow::Result<QuotaEvent> {
        let line = tokio::time::timeout(timeout, self.events.recv())
            .await?
            .ok_or_else(|| anyhow::anyhow!("stdout closed"))?;
        Ok(serde_json::from_str(&line)?)
    }

    /// Skip events until one satisfies `pred`.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&QuotaEvent) -> bool,
    ) -> anyhow::Result<QuotaEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                anyhow::bail!("no matching event within {timeout:?}");
            }
            let event = self.next_event(remaining).await?;
            if pred(&event) {
                return Ok(event);
            }
        }
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("quota-sentinel did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for SentinelProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
