use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{self, AlertEvent, AlertState};
use crate::clock::{LatestEvent, ReaderClock};
use crate::config::Config;
use crate::export::display::ReportLogger;
use crate::export::health::HealthMetrics;
use crate::export::journal::{AlertJournal, JournalQueue};
use crate::reader::parse::AccessLogParser;
use crate::reader::stats::ReaderStats;
use crate::reader::{ReaderHandle, TailReader};
use crate::stat::{by_request_count, Statistic, StatisticAggregator, StatisticBuckets};
use crate::watcher::{StatisticContext, Watcher};

/// Agent wires the reader, the statistics and the watcher together and owns
/// their tasks.
pub struct Agent {
    cfg: Config,
    zone: FixedOffset,
    health: Arc<HealthMetrics>,
    overall: Arc<StatisticAggregator>,
    buckets: Arc<StatisticBuckets>,
    latest: Arc<LatestEvent>,
    reader: Option<ReaderHandle>,
    reader_task: Option<JoinHandle<Result<()>>>,
    watcher_task: Option<JoinHandle<()>>,
    journal_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("log_file", &self.cfg.log_file)
            .field("started", &self.reader_task.is_some())
            .finish()
    }
}

impl Agent {
    /// Creates a new Agent from a validated configuration.
    pub fn new(cfg: Config) -> Result<Self> {
        cfg.validate()?;

        let zone = cfg.zone()?;
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let max_section_count = cfg.max_section_count();
        let overall = Arc::new(StatisticAggregator::with_overflow_diagnostics(
            max_section_count,
            by_request_count,
        ));
        let buckets = Arc::new(
            StatisticBuckets::new(
                cfg.bucket_duration,
                max_section_count,
                by_request_count,
                Arc::new(AtomicUsize::new(0)),
            )
            .context("creating statistic buckets")?,
        );

        Ok(Self {
            cfg,
            zone,
            health,
            overall,
            buckets,
            latest: Arc::new(LatestEvent::new()),
            reader: None,
            reader_task: None,
            watcher_task: None,
            journal_task: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Statistics of every event read since start.
    pub fn overall(&self) -> Arc<dyn Statistic> {
        Arc::clone(&self.overall) as Arc<dyn Statistic>
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start the health server, the reader and the watcher.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so health checks respond while the log is opened.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Alert journal, written off the watcher task.
        let journal = match &self.cfg.alerts_file {
            Some(path) => {
                let (queue, task) =
                    AlertJournal::open(path, self.zone, self.cfg.alerts_format)?.spawn_writer();
                self.journal_task = Some(task);
                Some(queue)
            }
            None => None,
        };

        // 3. Reader feeding the overall statistic, the buckets and the clock.
        let reader = self.build_reader();
        let reader_stats = reader.stats();
        self.reader = Some(reader.handle());

        // 4. Watcher.
        let watcher = self.build_watcher(journal, reader_stats);

        let cancel = self.cancel.clone();
        self.reader_task = Some(tokio::spawn(async move { reader.run(cancel).await }));
        self.watcher_task = Some(watcher.spawn(self.cfg.display_period, self.cancel.clone()));

        info!(
            log_file = %self.cfg.log_file.display(),
            bucket = %humantime::format_duration(self.cfg.bucket_duration),
            period = %humantime::format_duration(self.cfg.display_period),
            "agent fully started",
        );

        Ok(())
    }

    /// Waits until the reader exits on its own, returning its failure.
    ///
    /// Resolves immediately when the agent is not started.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.reader_task.as_mut() else {
            return Ok(());
        };

        let joined = task.await;
        self.reader_task = None;

        joined.context("reader task panicked")?
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();
        if let Some(reader) = &self.reader {
            reader.request_stop();
        }

        if let Some(mut task) = self.reader_task.take() {
            match tokio::time::timeout(self.cfg.shutdown_grace, &mut task).await {
                Ok(Ok(Ok(()))) => debug!("reader stopped"),
                Ok(Ok(Err(e))) => error!(error = %e, "reader failed during shutdown"),
                Ok(Err(e)) => error!(error = %e, "reader task failed"),
                Err(_) => {
                    warn!(
                        grace = %humantime::format_duration(self.cfg.shutdown_grace),
                        "reader did not stop in time, aborting",
                    );
                    task.abort();
                }
            }
        }

        if let Some(task) = self.watcher_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "watcher task failed");
            }
        }

        // The watcher held the last journal queue, so the writer drains and exits.
        if let Some(task) = self.journal_task.take() {
            match tokio::time::timeout(self.cfg.shutdown_grace, task).await {
                Ok(Ok(())) => debug!("alert journal flushed"),
                Ok(Err(e)) => error!(error = %e, "alert journal task failed"),
                Err(_) => warn!("alert journal did not drain in time"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    fn build_reader(&self) -> TailReader {
        let parser = AccessLogParser::new(self.cfg.date_time_format.clone()).into_line_parser();
        let mut reader = TailReader::new(&self.cfg.log_file, parser, self.cfg.read_idle);

        let overall = Arc::clone(&self.overall);
        reader.on_event(Box::new(move |event| overall.accept(event)));

        let buckets = Arc::clone(&self.buckets);
        reader.on_event(Box::new(move |event| buckets.accept(event)));

        let latest = Arc::clone(&self.latest);
        reader.on_event(Box::new(move |event| latest.observe(event)));

        reader
    }

    fn build_watcher(
        &self,
        journal: Option<JournalQueue>,
        reader_stats: Arc<ReaderStats>,
    ) -> Watcher {
        let logger = ReportLogger::new(self.zone);
        let clock = ReaderClock::new(self.zone, self.cfg.display_period, Arc::clone(&self.latest));

        let mut watcher = Watcher::new(self.overall(), Arc::clone(&self.buckets), clock);

        watcher.set_overall_context(StatisticContext::overall(
            self.cfg.top_section_count,
            Box::new(move |report| logger.report(report)),
        ));
        for duration in &self.cfg.stats_durations {
            watcher.add_latest_context(StatisticContext::latest(
                *duration,
                self.cfg.top_section_count,
                Box::new(move |report| logger.report(report)),
            ));
        }

        let mut high_traffic = alert::high_traffic(self.cfg.alert.threshold)
            .on_alert(move |event: &AlertEvent<f64>| logger.alert(event));
        if let Some(journal) = journal {
            high_traffic = high_traffic.on_alert(move |event: &AlertEvent<f64>| {
                if let Err(e) = journal.record(event) {
                    let message = format!("{e:#}");
                    error!(error = %message, "recording alert");
                }
            });
        }
        watcher.add_alert_state(Box::new(AlertState::new(
            Arc::new(high_traffic),
            self.cfg.alert.duration,
        )));

        let log_file = self.cfg.log_file.clone();
        watcher.on_waiting(Box::new(move || {
            debug!(log_file = %log_file.display(), "waiting for access log events");
        }));

        let health = Arc::clone(&self.health);
        watcher.on_tick(Box::new(move |summary| {
            health.record_reader(reader_stats.snapshot());
            health.record_tick(summary);
        }));

        watcher
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    use super::*;

    const LINE: &str = "127.0.0.1 - james [09/May/2018:16:00:39 +0000] \"GET /report HTTP/1.0\" 200 123";

    fn test_config(log_file: &Path, alerts_file: &Path) -> Config {
        let mut cfg = Config {
            log_file: log_file.to_path_buf(),
            read_idle: Duration::from_millis(5),
            bucket_duration: Duration::from_millis(10),
            display_period: Duration::from_millis(20),
            stats_durations: vec![Duration::from_millis(500)],
            alerts_file: Some(alerts_file.to_path_buf()),
            shutdown_grace: Duration::from_secs(1),
            ..Default::default()
        };
        cfg.alert.duration = Duration::from_secs(1);
        cfg.alert.threshold = 3.0;
        cfg
    }

    async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let content = std::fs::read_to_string(path).unwrap_or_default();
            let lines: Vec<String> = content.lines().map(str::to_string).collect();
            if lines.len() >= count {
                return lines;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never reached {count} lines", path.display());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let cfg = Config {
            top_section_count: 0,
            ..Default::default()
        };
        assert!(Agent::new(cfg).is_err());
    }

    #[tokio::test]
    async fn test_alert_raised_and_released_from_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_file = dir.path().join("access.log");
        let alerts_file = dir.path().join("alerts.log");

        let mut file = std::fs::File::create(&log_file).expect("create log");
        for _ in 0..3 {
            writeln!(file, "{LINE}").expect("write line");
        }
        file.flush().expect("flush");

        let mut agent = Agent::new(test_config(&log_file, &alerts_file)).expect("agent");
        agent.start().await.expect("start");

        // Three requests in a one second window raise the alert, then the
        // idle clock slides the window past them.
        let lines = wait_for_lines(&alerts_file, 2).await;
        agent.stop().await.expect("stop");

        assert!(lines[0].contains("! RAISED ! \"High traffic\" hits = {3}"));
        assert!(lines[1].contains("!RELEASED!"));
        assert!(lines[1].ends_with("since [2018-05-09T16:00:38Z]"));
        assert_eq!(agent.overall().overall().request_count, 3);
        assert!(agent.health().ticks.get() >= 1.0);
        assert_eq!(agent.health().lines_read.get(), 3.0);
    }

    #[tokio::test]
    async fn test_missing_log_fails_pipeline() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(&dir.path().join("missing.log"), &dir.path().join("alerts.log"));

        let mut agent = Agent::new(cfg).expect("agent");
        agent.start().await.expect("start");

        let err = agent.wait().await.expect_err("missing log");
        assert!(format!("{err:#}").contains("opening access log"));

        agent.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = test_config(&dir.path().join("access.log"), &dir.path().join("alerts.log"));

        let mut agent = Agent::new(cfg).expect("agent");
        agent.wait().await.expect("not started");
        agent.stop().await.expect("stop");
    }
}
