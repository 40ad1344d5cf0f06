//! Access log tailing.
//!
//! [`TailReader`] reads a growing log file line by line, parses each line
//! and hands the resulting [`LogEvent`] to every registered handler, in file
//! order, on the reader task. At end of file it waits and polls again.

pub mod event;
pub mod parse;
pub mod stats;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use self::event::LogEvent;
use self::parse::LineParser;
use self::stats::ReaderStats;

/// Callback for parsed events.
pub type EventHandler = Box<dyn Fn(&LogEvent) + Send + Sync>;

/// Callback invoked each time the reader reaches the end of the file.
pub type IdleHandler = Box<dyn Fn() + Send + Sync>;

/// Cloneable control over a running [`TailReader`].
#[derive(Debug, Clone)]
pub struct ReaderHandle {
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
}

impl ReaderHandle {
    /// Asks the reader to stop after the line it is processing. A request
    /// made before the reader starts makes it exit without reading.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }

    /// False before the reader starts, after a stop request and once the
    /// reader has exited.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Clears the running flag whichever way the read loop exits.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polling reader of an append-only log file.
pub struct TailReader {
    path: PathBuf,
    idle_wait: Duration,
    parser: LineParser,
    handlers: Vec<EventHandler>,
    idle_handlers: Vec<IdleHandler>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    stats: Arc<ReaderStats>,
}

impl std::fmt::Debug for TailReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TailReader")
            .field("path", &self.path)
            .field("idle_wait", &self.idle_wait)
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl TailReader {
    pub fn new(path: impl Into<PathBuf>, parser: LineParser, idle_wait: Duration) -> Self {
        Self {
            path: path.into(),
            idle_wait,
            parser,
            handlers: Vec::with_capacity(4),
            idle_handlers: Vec::with_capacity(1),
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(ReaderStats::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Register a handler for parsed events.
    pub fn on_event(&mut self, handler: EventHandler) {
        self.handlers.push(handler);
    }

    /// Register a handler called at every end of file.
    pub fn on_idle(&mut self, handler: IdleHandler) {
        self.idle_handlers.push(handler);
    }

    pub fn handle(&self) -> ReaderHandle {
        ReaderHandle {
            running: Arc::clone(&self.running),
            stop_requested: Arc::clone(&self.stop_requested),
        }
    }

    pub fn stats(&self) -> Arc<ReaderStats> {
        Arc::clone(&self.stats)
    }

    /// Reads the file until a stop request or cancellation.
    ///
    /// Failing to open or read the file is fatal. Unparsable lines are
    /// dropped and counted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("opening access log {}", self.path.display()))?;

        self.running.store(true, Ordering::Release);
        let _guard = RunningGuard(Arc::clone(&self.running));

        info!(path = %self.path.display(), "tailing access log");

        let mut reader = BufReader::new(file);
        let mut line = Vec::with_capacity(512);

        loop {
            if self.stop_requested() || cancel.is_cancelled() {
                break;
            }

            let n = reader
                .read_until(b'\n', &mut line)
                .await
                .with_context(|| format!("reading access log {}", self.path.display()))?;

            // A line without its newline is still being written.
            if n == 0 || line.last() != Some(&b'\n') {
                for handler in &self.idle_handlers {
                    handler();
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_wait) => {}
                }
                continue;
            }

            self.process_line(&line);
            line.clear();
        }

        debug!(path = %self.path.display(), "access log reader stopped");

        Ok(())
    }

    /// Set once by [`ReaderHandle::request_stop`]; never cleared.
    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn process_line(&self, raw: &[u8]) {
        self.stats.record_line();

        let text = String::from_utf8_lossy(raw);
        let text = text.trim_end_matches(['\n', '\r']);

        match (self.parser)(text) {
            Ok(event) => {
                self.stats.record_event();
                for handler in &self.handlers {
                    handler(&event);
                }
            }
            Err(e) => {
                self.stats.record_dropped();
                trace!(error = %e, line = text, "dropping unparsable line");
            }
        }
    }
}
