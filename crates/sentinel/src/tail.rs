// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental tail of one append-only log file.
//!
//! Only bytes appended since the last read are examined, and each read is
//! capped so a burst of writes never pulls more than `max_read` bytes into
//! memory at once. The offset advances only through the last complete line;
//! a trailing fragment is re-read as the prefix of the next read.

use std::fs::{File, Metadata};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-read cap (1 MiB).
pub const DEFAULT_MAX_READ_BYTES: u64 = 1024 * 1024;

/// Default polling fallback cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Observable tail position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailState {
    pub path: PathBuf,
    pub offset: u64,
    pub dormant: bool,
}

/// Watches a log file for newly appended lines after a tracked byte offset.
/// Uses `notify` for filesystem events with a polling fallback.
pub struct LogTailer {
    path: PathBuf,
    offset: u64,
    max_read: u64,
    poll_interval: Duration,
    inode: Option<u64>,
    dormant: bool,
    /// Inside an over-long line: drop bytes through the next line-feed.
    discarding: bool,
    /// Last read hit the cap with more data behind it.
    backlog: bool,
    /// `seek_to_end` failed on an existing file; seek on the next successful open.
    pending_seek: bool,
}

impl LogTailer {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            max_read: DEFAULT_MAX_READ_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
            inode: None,
            dormant: false,
            discarding: false,
            backlog: false,
            pending_seek: false,
        }
    }

    /// Create a tailer that starts reading from a specific byte offset.
    pub fn with_offset(path: PathBuf, offset: u64) -> Self {
        Self { offset, ..Self::new(path) }
    }

    pub fn with_max_read(mut self, bytes: u64) -> Self {
        self.max_read = bytes.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current byte offset into the log file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True while the file is missing.
    pub fn is_dormant(&self) -> bool {
        self.dormant
    }

    /// True when the previous read was capped and unread bytes remain.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    pub fn state(&self) -> TailState {
        TailState { path: self.path.clone(), offset: self.offset, dormant: self.dormant }
    }

    /// Position at the current end of file so existing content is not
    /// replayed. A missing file leaves the tailer dormant at offset 0.
    ///
    /// If the file exists but cannot be read, the error is returned and the
    /// seek is retried by the first [`read_new_lines`](Self::read_new_lines)
    /// that opens it, so history is still skipped.
    pub fn seek_to_end(&mut self) -> anyhow::Result<()> {
        let result = self.try_seek_to_end();
        self.pending_seek = result.is_err();
        result
    }

    fn try_seek_to_end(&mut self) -> anyhow::Result<()> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.go_dormant();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        self.position_at_end(&mut file, &meta)
    }

    fn position_at_end(&mut self, file: &mut File, meta: &Metadata) -> anyhow::Result<()> {
        let size = meta.len();

        // Starting mid-line: skip the rest of that line instead of parsing half of it.
        let mut discarding = false;
        if size > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(size - 1))?;
            file.read_exact(&mut last)?;
            discarding = last[0] != b'\n';
        }

        self.inode = inode_from_metadata(meta);
        self.offset = size;
        self.dormant = false;
        self.backlog = false;
        self.discarding = discarding;

        info!(path = %self.path.display(), offset = size, "tailing log from end of file");
        Ok(())
    }

    /// Read new complete lines appended since the last read.
    ///
    /// On error the offset is left untouched so the next call retries the
    /// same byte range.
    pub fn read_new_lines(&mut self) -> anyhow::Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.go_dormant();
                return Ok(vec![]);
            }
            Err(e) => return Err(e.into()),
        };

        let meta = file.metadata()?;
        if self.pending_seek {
            self.position_at_end(&mut file, &meta)?;
            self.pending_seek = false;
            return Ok(vec![]);
        }
        let size = meta.len();
        let inode = inode_from_metadata(&meta);

        if self.dormant {
            info!(path = %self.path.display(), size, "log file appeared");
            self.dormant = false;
        }

        // A replaced file (new inode) or one that shrank below our offset is
        // read again from the beginning.
        let replaced = self.inode.is_some() && inode.is_some() && inode != self.inode;
        if replaced || size < self.offset {
            info!(
                path = %self.path.display(),
                offset = self.offset,
                size,
                replaced,
                "log truncated or rotated; rereading from start"
            );
            self.offset = 0;
            self.discarding = false;
        }
        self.inode = inode;

        if size == self.offset {
            self.backlog = false;
            return Ok(vec![]);
        }

        let want = (size - self.offset).min(self.max_read);
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity(want as usize);
        file.take(want).read_to_end(&mut buf)?;

        let full = buf.len() as u64 == self.max_read;
        let (lines, consumed) = self.split_lines(&buf, full);
        self.offset += consumed;
        self.backlog = full && size > self.offset;

        debug!(
            path = %self.path.display(),
            read = buf.len(),
            consumed,
            offset = self.offset,
            lines = lines.len(),
            "tail read"
        );
        Ok(lines)
    }

    /// Split `buf` into complete lines. Returns the lines and how many bytes
    /// of `buf` they account for (including any discarded prefix).
    fn split_lines(&mut self, buf: &[u8], full: bool) -> (Vec<String>, u64) {
        let mut start = 0;
        if self.discarding {
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => {
                    start = i + 1;
                    self.discarding = false;
                }
                None => return (vec![], buf.len() as u64),
            }
        }

        let body = &buf[start..];
        let Some(last) = body.iter().rposition(|&b| b == b'\n') else {
            if full && start == 0 {
                warn!(
                    path = %self.path.display(),
                    offset = self.offset,
                    max_read = self.max_read,
                    "line exceeds read cap; discarding it"
                );
                self.discarding = true;
                return (vec![], buf.len() as u64);
            }
            // Fragment waits for its line-feed.
            return (vec![], start as u64);
        };

        let lines = body[..last]
            .split(|&b| b == b'\n')
            .map(|raw| String::from_utf8_lossy(raw).trim_end_matches('\r').to_owned())
            .filter(|line| !line.trim().is_empty())
            .collect();
        (lines, (start + last + 1) as u64)
    }

    fn go_dormant(&mut self) {
        if !self.dormant {
            info!(path = %self.path.display(), "log file not found; waiting for it to appear");
        }
        self.dormant = true;
        self.offset = 0;
        self.inode = None;
        self.discarding = false;
        self.backlog = false;
        // A file created after this point holds no history.
        self.pending_seek = false;
    }

    /// Start watching the file, sending batches of new lines to `line_tx`.
    ///
    /// Wakes on `notify` events, on the poll interval, and immediately after
    /// a capped read. Runs until `shutdown` is cancelled or the channel closes.
    pub async fn run(mut self, line_tx: mpsc::Sender<Vec<String>>, shutdown: CancellationToken) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx.clone());

        let mut poll_interval = tokio::time::interval(self.poll_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll_interval.tick() => {}
            }

            match self.read_new_lines() {
                Ok(lines) if !lines.is_empty() => {
                    if line_tx.send(lines).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %self.path.display(), err = %e, "log read failed; will retry");
                }
            }

            if self.backlog {
                let _ = wake_tx.try_send(());
            }
        }
        debug!(path = %self.path.display(), "log tailer stopped");
    }

    /// Set up a `notify` watcher on the log file's parent directory so file
    /// creation is seen too. Returns the watcher handle (must be kept alive).
    fn setup_notify_watcher(&self, wake_tx: mpsc::Sender<()>) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let relevant = match (&res, &file_name) {
                (Ok(event), Some(name)) => {
                    event.paths.is_empty()
                        || event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str()))
                }
                _ => true,
            };
            if relevant {
                let _ = wake_tx.try_send(());
            }
        })
        .map_err(|e| debug!(err = %e, "notify unavailable; polling only"))
        .ok()?;

        let watch_path = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        if let Err(e) = watcher.watch(watch_path, RecursiveMode::NonRecursive) {
            debug!(dir = %watch_path.display(), err = %e, "cannot watch log directory; polling only");
            return None;
        }

        Some(watcher)
    }
}

fn inode_from_metadata(metadata: &Metadata) -> Option<u64> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        Some(metadata.ino())
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        None
    }
}

#[cfg(test)]
#[path = "tail_tests.rs"]
mod tests;
