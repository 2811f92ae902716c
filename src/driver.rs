/// Batch driver: one run of the tool is one window.
///
/// Reads the lines appended since the last run, decodes and folds each
/// one, flushes the totals into metric readings and then records how far
/// it got so the next run reports only the delta.
use crate::aggregate::JobAggregator;
use crate::decode::{decode_line, Decoded, LineError};
use crate::export::{flush, MetricNaming, MetricReading};
use crate::logtail::{LogTail, TailError};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// What to do when a qualifying line cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure, keep it in the summary and move on.
    #[default]
    Continue,
    /// Stop the window at the first failure without flushing.
    Abort,
}

/// How readings are written to stdout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// `name value` per line.
    #[default]
    Plain,
    /// One JSON object per line.
    Json,
}

/// Line counts for one window.
#[derive(Debug, Default)]
pub struct WindowSummary {
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
    pub failures: Vec<LineError>,
}

/// Decode and fold `lines` in order.
///
/// Failed lines never touch the aggregator. Under [`FailurePolicy::Abort`]
/// the first failure ends the window with [`DriverError::Aborted`].
pub fn run_window<I, S>(
    lines: I,
    aggregator: &mut JobAggregator,
    policy: FailurePolicy,
) -> Result<WindowSummary, DriverError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut summary = WindowSummary::default();

    for line in lines {
        let line = line.as_ref();
        summary.lines += 1;

        match decode_line(line) {
            Ok(Decoded::Event(event)) => {
                debug!(
                    line = summary.lines,
                    job = %event.job_type,
                    server = %event.server,
                    duration_secs = event.duration_secs,
                    "job event"
                );
                if event.duration_secs < 0 {
                    warn!(
                        line = summary.lines,
                        job = %event.job_type,
                        duration_secs = event.duration_secs,
                        "job ended before it started"
                    );
                }
                aggregator.fold(&event);
                summary.events += 1;
            }
            Ok(Decoded::Skip) => summary.skipped += 1,
            Err(kind) => {
                let err = LineError::new(summary.lines, line, kind);
                match policy {
                    FailurePolicy::Abort => return Err(DriverError::Aborted(err)),
                    FailurePolicy::Continue => {
                        warn!(line = err.line_no, error = %err.kind, excerpt = %err.excerpt, "failed to decode line");
                        summary.failures.push(err);
                    }
                }
            }
        }
    }

    Ok(summary)
}

/// Everything one run needs, already merged from config and CLI.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub log_file: PathBuf,
    pub state_file: PathBuf,
    pub policy: FailurePolicy,
    pub naming: MetricNaming,
    pub from_start: bool,
    /// Report readings without saving the new offset.
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub readings: Vec<MetricReading>,
    pub summary: WindowSummary,
}

/// Run one window over the lines appended since the previous run.
///
/// The offset only advances when the window completes; an aborted window
/// is read again next time.
pub fn run(opts: &RunOptions) -> Result<RunOutcome, DriverError> {
    let mut tail = LogTail::open(&opts.log_file, &opts.state_file, opts.from_start)?;
    let lines = tail.read_new_lines()?;
    info!(
        lines = lines.len(),
        from_offset = tail.start_offset(),
        file = %opts.log_file.display(),
        "read new log lines"
    );

    let mut aggregator = JobAggregator::new();
    let summary = run_window(&lines, &mut aggregator, opts.policy)?;
    let readings = flush(aggregator.state(), &opts.naming);

    info!(
        events = summary.events,
        skipped = summary.skipped,
        failures = summary.failures.len(),
        jobs = aggregator.len(),
        "window complete"
    );

    if opts.dry_run {
        info!(offset = tail.pending_offset(), "dry run, offset not saved");
    } else {
        tail.commit()?;
    }

    Ok(RunOutcome { readings, summary })
}

/// Format readings for stdout.
pub fn render(readings: &[MetricReading], format: OutputFormat) -> String {
    let mut out = String::new();
    for r in readings {
        match format {
            OutputFormat::Plain => {
                out.push_str(&format!("{} {}\n", r.name, r.value));
            }
            OutputFormat::Json => {
                // A struct of strings and an integer always serializes.
                if let Ok(line) = serde_json::to_string(r) {
                    out.push_str(&line);
                    out.push('\n');
                }
            }
        }
    }
    out
}

#[derive(Debug)]
pub enum DriverError {
    Tail(TailError),
    /// A line failed under [`FailurePolicy::Abort`].
    Aborted(LineError),
}

impl From<TailError> for DriverError {
    fn from(e: TailError) -> Self {
        DriverError::Tail(e)
    }
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Tail(e) => write!(f, "{e}"),
            DriverError::Aborted(e) => write!(f, "window aborted at {e}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Tail(e) => Some(e),
            DriverError::Aborted(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::{ec_line, job_payload};
    use crate::decode::{DecodeError, APP_TAG};
    use std::io::Write;
    use tempfile::tempdir;

    const SCENARIO_LINE: &str = r#"x,x,01/02/20,00:00:00,COMPASS_ECCONNECT,"{""SERVERNAME"":""S1"",""JOBTYPE"":""a.b.Sync"",""START"":""01:00:00"",""END"":""01:05:30""}""#;

    fn sync_line(start: &str, end: &str) -> String {
        ec_line("01/02/20", APP_TAG, &job_payload("a.b.Sync", start, end))
    }

    fn missing_end_line() -> String {
        ec_line(
            "01/02/20",
            APP_TAG,
            r#"{"SERVERNAME":"S1","JOBTYPE":"a.Sync","START":"01:00:00"}"#,
        )
    }

    fn options(dir: &std::path::Path, log: PathBuf) -> RunOptions {
        RunOptions {
            log_file: log,
            state_file: dir.join("offset.state"),
            policy: FailurePolicy::Continue,
            naming: MetricNaming::default(),
            from_start: false,
            dry_run: false,
        }
    }

    fn write_log(path: &std::path::Path, lines: &[String]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn scenario_line_yields_sync_readings() {
        let mut agg = JobAggregator::new();
        let summary = run_window([SCENARIO_LINE], &mut agg, FailurePolicy::Continue).unwrap();
        assert_eq!(summary.events, 1);

        let readings = flush(agg.state(), &MetricNaming::default());
        assert!(readings.contains(&MetricReading {
            name: "Sync.completed".to_string(),
            value: 1,
            description: "Jobs completed".to_string(),
        }));
        assert!(readings.contains(&MetricReading {
            name: "Sync.execution_time".to_string(),
            value: 330,
            description: "Job execution time".to_string(),
        }));
    }

    #[test]
    fn two_sync_lines_accumulate() {
        let lines = vec![
            sync_line("01:00:00", "01:05:30"),
            sync_line("02:00:00", "02:01:30"),
        ];
        let mut agg = JobAggregator::new();
        run_window(&lines, &mut agg, FailurePolicy::Continue).unwrap();
        assert_eq!(agg.completed_count("Sync"), Some(2));
        assert_eq!(agg.total_duration("Sync"), Some(420));
    }

    #[test]
    fn identical_lines_multiply() {
        let line = sync_line("01:00:00", "01:00:45");
        let lines = vec![line; 7];
        let mut agg = JobAggregator::new();
        run_window(&lines, &mut agg, FailurePolicy::Continue).unwrap();
        assert_eq!(agg.completed_count("Sync"), Some(7));
        assert_eq!(agg.total_duration("Sync"), Some(7 * 45));
    }

    #[test]
    fn other_app_line_changes_nothing() {
        let line = ec_line("01/02/20", "OTHER_APP", &job_payload("a.b.Sync", "01:00:00", "01:05:30"));
        let mut agg = JobAggregator::new();
        let summary = run_window([line], &mut agg, FailurePolicy::Continue).unwrap();
        assert_eq!(summary.skipped, 1);
        assert!(agg.is_empty());
        assert!(flush(agg.state(), &MetricNaming::default()).is_empty());
    }

    #[test]
    fn missing_end_is_recorded_and_skipped() {
        let mut agg = JobAggregator::new();
        let summary =
            run_window([missing_end_line()], &mut agg, FailurePolicy::Continue).unwrap();
        assert!(agg.is_empty());
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].line_no, 1);
        assert!(matches!(
            summary.failures[0].kind,
            DecodeError::MissingField("END")
        ));
    }

    #[test]
    fn malformed_json_never_touches_state() {
        let lines = vec![
            sync_line("01:00:00", "01:00:10"),
            ec_line("01/02/20", APP_TAG, "{\"SERVERNAME\":\"S1\",\"JOBTYPE\""),
            sync_line("01:00:00", "01:00:20"),
        ];
        let mut agg = JobAggregator::new();
        let summary = run_window(&lines, &mut agg, FailurePolicy::Continue).unwrap();
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.events, 2);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].line_no, 2);
        assert!(matches!(summary.failures[0].kind, DecodeError::Json(_)));
        assert_eq!(agg.completed_count("Sync"), Some(2));
        assert_eq!(agg.total_duration("Sync"), Some(30));
    }

    #[test]
    fn abort_policy_stops_at_first_failure() {
        let lines = vec![
            sync_line("01:00:00", "01:00:10"),
            missing_end_line(),
            sync_line("01:00:00", "01:00:20"),
        ];
        let mut agg = JobAggregator::new();
        let err = run_window(&lines, &mut agg, FailurePolicy::Abort).unwrap_err();
        match err {
            DriverError::Aborted(e) => assert_eq!(e.line_no, 2),
            other => panic!("expected abort, got {other:?}"),
        }
        // The line before the failure was folded; the failed one was not.
        assert_eq!(agg.completed_count("Sync"), Some(1));
    }

    #[test]
    fn midnight_crossing_job_is_negative() {
        let mut agg = JobAggregator::new();
        run_window(
            [sync_line("23:59:00", "00:01:00")],
            &mut agg,
            FailurePolicy::Continue,
        )
        .unwrap();
        assert_eq!(agg.total_duration("Sync"), Some(-86280));
    }

    #[test]
    fn run_reports_delta_since_last_run() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("gateway.log");
        write_log(&log, &[sync_line("01:00:00", "01:05:30")]);
        let opts = options(dir.path(), log.clone());

        let first = run(&opts).unwrap();
        assert_eq!(first.readings[0].name, "Sync.completed");
        assert_eq!(first.readings[0].value, 1);

        write_log(
            &log,
            &[
                sync_line("02:00:00", "02:01:30"),
                sync_line("03:00:00", "03:00:30"),
            ],
        );
        let second = run(&opts).unwrap();
        assert_eq!(second.readings[0].value, 2);
        assert_eq!(second.readings[1].value, 120);

        let third = run(&opts).unwrap();
        assert!(third.readings.is_empty());
        assert_eq!(third.summary.lines, 0);
    }

    #[test]
    fn dry_run_does_not_advance() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("gateway.log");
        write_log(&log, &[sync_line("01:00:00", "01:05:30")]);
        let mut opts = options(dir.path(), log);
        opts.dry_run = true;

        run(&opts).unwrap();
        let again = run(&opts).unwrap();
        assert_eq!(again.readings[0].value, 1);
        assert!(!opts.state_file.exists());
    }

    #[test]
    fn aborted_run_keeps_offset() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("gateway.log");
        write_log(&log, &[sync_line("01:00:00", "01:05:30"), missing_end_line()]);
        let mut opts = options(dir.path(), log);
        opts.policy = FailurePolicy::Abort;

        assert!(matches!(run(&opts), Err(DriverError::Aborted(_))));

        opts.policy = FailurePolicy::Continue;
        let outcome = run(&opts).unwrap();
        assert_eq!(outcome.summary.events, 1);
        assert_eq!(outcome.summary.failures.len(), 1);
    }

    #[test]
    fn run_applies_naming() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("gateway.log");
        write_log(&log, &[sync_line("01:00:00", "01:05:30")]);
        let mut opts = options(dir.path(), log);
        opts.naming = MetricNaming::new(Some("job".to_string()), None);

        let outcome = run(&opts).unwrap();
        assert_eq!(outcome.readings[0].name, "job.Sync.completed");
        assert_eq!(outcome.readings[1].name, "job.Sync.execution_time");
    }

    #[test]
    fn render_plain_and_json() {
        let readings = vec![
            MetricReading {
                name: "Sync.completed".to_string(),
                value: 2,
                description: "Jobs completed".to_string(),
            },
            MetricReading {
                name: "Sync.execution_time".to_string(),
                value: 420,
                description: "Job execution time".to_string(),
            },
        ];

        assert_eq!(
            render(&readings, OutputFormat::Plain),
            "Sync.completed 2\nSync.execution_time 420\n"
        );

        let json = render(&readings, OutputFormat::Json);
        let first: serde_json::Value =
            serde_json::from_str(json.lines().next().unwrap()).unwrap();
        assert_eq!(first["name"], "Sync.completed");
        assert_eq!(first["description"], "Jobs completed");
        assert_eq!(json.lines().count(), 2);
    }

    #[test]
    fn render_empty_is_empty() {
        assert_eq!(render(&[], OutputFormat::Plain), "");
    }
}
