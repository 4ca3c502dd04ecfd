//! Runner output capture: per-stream log files, tracing, and a bounded tail
//! of recent stderr kept for exit reports.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Per-line cap; longer lines keep their tail.
const MAX_LINE_BYTES: usize = 4096;

const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Ring buffer of the most recent stderr lines.
#[derive(Debug)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            self.dropped = self.dropped.saturating_add(1);
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped = self.dropped.saturating_add(1);
        }
        self.lines.push_back(tail_by_bytes(line, MAX_LINE_BYTES));
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Lines evicted since the buffer filled up.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

/// Keep the tail of a string within `max_bytes`, preserving UTF-8 boundaries.
fn tail_by_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len().saturating_sub(max_bytes);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Copy a pipe line-by-line into its log file and the tracing output.
/// Stderr lines also land in `tail`.
pub(crate) async fn pump_output<R>(
    pipe: R,
    mut log: File,
    session_id: String,
    stream: OutputStream,
    tail: Option<Arc<Mutex<StderrTail>>>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(pipe).lines();
    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(session_id = %session_id, stream = stream.as_str(), error = %e, "Runner pipe read failed");
                break;
            }
        };

        if let Err(e) = write_line(&mut log, &line).await {
            tracing::warn!(session_id = %session_id, stream = stream.as_str(), error = %e, "Failed to write runner log");
        }
        match stream {
            OutputStream::Stdout => {
                tracing::info!(session_id = %session_id, stream = "stdout", "{}", line)
            }
            OutputStream::Stderr => {
                tracing::warn!(session_id = %session_id, stream = "stderr", "{}", line)
            }
        }
        if let Some(tail) = &tail {
            tail.lock().push(&line);
        }
    }

    let _ = log.flush().await;
}

async fn write_line(log: &mut File, line: &str) -> std::io::Result<()> {
    log.write_all(line.as_bytes()).await?;
    log.write_all(b"\n").await
}

/// Give a pump a moment to drain after the child exits, then abandon it.
/// Grandchildren holding the pipe open would otherwise block forever.
pub(crate) async fn join_pump_with_timeout(mut handle: JoinHandle<()>) {
    if timeout(READER_JOIN_TIMEOUT, &mut handle).await.is_err() {
        handle.abort();
    }

    let _ = handle.await;
}
