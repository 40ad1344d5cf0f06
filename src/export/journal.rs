use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use super::format_millis;
use crate::alert::AlertEvent;

/// Line format of the alert journal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalFormat {
    /// `[time]! RAISED ! "description" hits = {value}` lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Serialize)]
struct JournalRecord<'a, M> {
    alert: &'a str,
    description: &'a str,
    state: &'static str,
    #[serde(with = "humantime_serde")]
    duration: std::time::Duration,
    value_at_since: &'a M,
    since: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    until: Option<String>,
}

/// Append-only file of alert transitions.
///
/// Every record is flushed before `record` returns so the file can be
/// tailed while the monitor runs.
pub struct AlertJournal {
    path: PathBuf,
    zone: FixedOffset,
    format: JournalFormat,
    writer: parking_lot::Mutex<BufWriter<File>>,
}

impl std::fmt::Debug for AlertJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertJournal")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish()
    }
}

impl AlertJournal {
    /// Opens `path` for appending, creating it when missing.
    pub fn open(path: impl AsRef<Path>, zone: FixedOffset, format: JournalFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening alerts file {}", path.display()))?;

        Ok(Self {
            path,
            zone,
            format,
            writer: parking_lot::Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one transition.
    ///
    /// Blocks on the write and flush. From async code, go through
    /// [`AlertJournal::spawn_writer`] instead.
    pub fn record<M: Display + Serialize>(&self, event: &AlertEvent<M>) -> Result<()> {
        let line = self.line(event)?;
        self.write_line(&line)
    }

    /// Moves the journal onto a blocking task fed by the returned queue.
    /// Lines are written in the order they are queued. The task exits once
    /// every clone of the queue is dropped.
    pub fn spawn_writer(self) -> (JournalQueue, JoinHandle<()>) {
        let journal = Arc::new(self);
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = Arc::clone(&journal);
        let task = tokio::task::spawn_blocking(move || {
            while let Some(line) = rx.blocking_recv() {
                if let Err(e) = writer.write_line(&line) {
                    let message = format!("{e:#}");
                    error!(error = %message, "recording alert");
                }
            }
        });

        (JournalQueue { journal, tx }, task)
    }

    fn line<M: Display + Serialize>(&self, event: &AlertEvent<M>) -> Result<String> {
        match self.format {
            JournalFormat::Text => Ok(self.text_line(event)),
            JournalFormat::Json => self.json_line(event),
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .with_context(|| format!("writing alerts file {}", self.path.display()))
    }

    fn text_line<M: Display>(&self, event: &AlertEvent<M>) -> String {
        let since = format_millis(event.since_millis, &self.zone);
        let description = event.config.description();

        match event.until_millis {
            None => format!(
                "[{since}]! RAISED ! \"{description}\" hits = {{{}}}",
                event.value_at_since
            ),
            Some(until) => format!(
                "[{}]!RELEASED! \"{description}\" hits = {{{}}} since [{since}]",
                format_millis(until, &self.zone),
                event.value_at_since
            ),
        }
    }

    fn json_line<M: Serialize>(&self, event: &AlertEvent<M>) -> Result<String> {
        let record = JournalRecord {
            alert: event.config.id().as_str(),
            description: event.config.description(),
            state: if event.is_raised() { "raised" } else { "released" },
            duration: event.duration,
            value_at_since: &event.value_at_since,
            since: format_millis(event.since_millis, &self.zone),
            until: event.until_millis.map(|ms| format_millis(ms, &self.zone)),
        };

        serde_json::to_string(&record).context("serializing alert record")
    }
}

/// Sending side of a journal writer task.
#[derive(Debug, Clone)]
pub struct JournalQueue {
    journal: Arc<AlertJournal>,
    tx: mpsc::UnboundedSender<String>,
}

impl JournalQueue {
    /// Formats one transition and queues it without touching the file.
    pub fn record<M: Display + Serialize>(&self, event: &AlertEvent<M>) -> Result<()> {
        let line = self.journal.line(event)?;
        self.tx
            .send(line)
            .map_err(|_| anyhow!("alerts file writer for {} stopped", self.journal.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::alert::{AlertConfig, AlertId};
    use crate::stat::Statistic;

    fn event(until_millis: Option<i64>) -> AlertEvent<u64> {
        let config = Arc::new(AlertConfig::new(
            AlertId::new("busy"),
            "Busy",
            |stat: &dyn Statistic, _| Ok(stat.overall().request_count),
            |value: &u64| Ok(*value > 1),
        ));

        AlertEvent {
            config,
            duration: Duration::from_secs(120),
            value_at_since: 1_300,
            since_millis: 1_525_881_642_000,
            until_millis,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).expect("utc")
    }

    #[test]
    fn test_text_lines_are_appended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alerts.log");
        std::fs::write(&path, "previous run\n").expect("seed");

        let journal = AlertJournal::open(&path, utc(), JournalFormat::Text).expect("open");
        journal.record(&event(None)).expect("raise");
        journal
            .record(&event(Some(1_525_881_702_000)))
            .expect("release");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(
            lines,
            vec![
                "previous run",
                "[2018-05-09T16:00:42Z]! RAISED ! \"Busy\" hits = {1300}",
                "[2018-05-09T16:01:42Z]!RELEASED! \"Busy\" hits = {1300} since [2018-05-09T16:00:42Z]",
            ]
        );
    }

    #[test]
    fn test_json_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alerts.jsonl");

        let journal = AlertJournal::open(&path, utc(), JournalFormat::Json).expect("open");
        journal
            .record(&event(Some(1_525_881_702_000)))
            .expect("release");

        let content = std::fs::read_to_string(&path).expect("read");
        let record: serde_json::Value = serde_json::from_str(content.trim()).expect("json");
        assert_eq!(record["alert"], "busy");
        assert_eq!(record["state"], "released");
        assert_eq!(record["duration"], "2m");
        assert_eq!(record["value_at_since"], 1300);
        assert_eq!(record["until"], "2018-05-09T16:01:42Z");
    }

    #[tokio::test]
    async fn test_writer_task_keeps_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("alerts.log");

        let journal = AlertJournal::open(&path, utc(), JournalFormat::Text).expect("open");
        let (queue, task) = journal.spawn_writer();
        queue.record(&event(None)).expect("raise");
        queue
            .record(&event(Some(1_525_881_702_000)))
            .expect("release");

        // Dropping the last queue drains and ends the writer.
        drop(queue);
        task.await.expect("writer task");

        let content = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("! RAISED !"));
        assert!(lines[1].contains("!RELEASED!"));
    }

    #[test]
    fn test_open_fails_on_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("alerts.log");

        assert!(AlertJournal::open(path, utc(), JournalFormat::Text).is_err());
    }
}
