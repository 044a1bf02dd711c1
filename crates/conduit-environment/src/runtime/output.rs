// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live output and exit status channels shared by process implementations.

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};

/// Lines buffered per output subscriber before it starts lagging.
const OUTPUT_BUFFER: usize = 1024;

/// How long output keeps being forwarded after the unit terminated.
pub(crate) const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit code reported for a unit that was stopped or lost before it exited
/// on its own. Matches the status a container killed by SIGKILL reports.
pub const STOPPED_EXIT_CODE: i64 = 128 + 9;

/// Which stream a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Source stream.
    pub stream: LogStream,
    /// Line without the trailing newline.
    pub line: String,
}

impl LogLine {
    /// A stdout line.
    pub fn stdout(line: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            line: line.into(),
        }
    }

    /// A stderr line.
    pub fn stderr(line: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            line: line.into(),
        }
    }
}

/// Output streams and exit status of one process.
pub struct ProcessOutput {
    stdout: broadcast::Sender<String>,
    stderr: broadcast::Sender<String>,
    exit_code: watch::Sender<Option<i64>>,
}

impl Default for ProcessOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOutput {
    /// Create empty channels.
    pub fn new() -> Self {
        let (stdout, _) = broadcast::channel(OUTPUT_BUFFER);
        let (stderr, _) = broadcast::channel(OUTPUT_BUFFER);
        let (exit_code, _) = watch::channel(None);
        Self {
            stdout,
            stderr,
            exit_code,
        }
    }

    /// Subscribe to stdout.
    pub fn stdout(&self) -> broadcast::Receiver<String> {
        self.stdout.subscribe()
    }

    /// Subscribe to stderr.
    pub fn stderr(&self) -> broadcast::Receiver<String> {
        self.stderr.subscribe()
    }

    /// Observe the exit code.
    pub fn exit_code(&self) -> watch::Receiver<Option<i64>> {
        self.exit_code.subscribe()
    }

    /// Publish a line. Lines without subscribers are dropped.
    pub fn push(&self, line: LogLine) {
        let sender = match line.stream {
            LogStream::Stdout => &self.stdout,
            LogStream::Stderr => &self.stderr,
        };
        let _ = sender.send(line.line);
    }

    /// Forward lines until the source closes.
    pub async fn pump(&self, mut lines: mpsc::Receiver<LogLine>) {
        while let Some(line) = lines.recv().await {
            self.push(line);
        }
    }

    /// Record the exit code. Only the first call has an effect.
    pub fn resolve(&self, code: i64) -> bool {
        self.exit_code.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(code);
            true
        })
    }

    /// Whether an exit code was recorded.
    pub fn is_resolved(&self) -> bool {
        self.exit_code.borrow().is_some()
    }
}
