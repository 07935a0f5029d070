//! The shared, append-only record of test outcomes.
//!
//! Suite-defined tests and hook-injected dynamic tests go through the same
//! start/stop protocol, so counts and timings in the summary cover both.

use serde::Serialize;
use std::fmt::Write as _;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Running,
    Pass,
    Fail,
    Error,
    Skip,
}

/// One entry of the report.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub test_id: usize,
    pub name: String,
    /// Injected by a hook rather than defined by the suite.
    pub dynamic: bool,
    pub status: TestStatus,
    pub start_time_ms: u64,
    pub elapsed_ms: Option<u64>,
    pub message: Option<String>,
    #[serde(skip)]
    started: Instant,
}

/// Counts over a report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub num_run: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub skipped: usize,
    pub dynamic: usize,
    pub failed_tests: Vec<String>,
    pub errored_tests: Vec<String>,
}

impl ReportSummary {
    pub fn was_successful(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TestReport {
    records: Vec<TestRecord>,
}

impl TestReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `name` started.  Returns its id for [`stop_test`].
    ///
    /// [`stop_test`]: TestReport::stop_test
    pub fn start_test(&mut self, name: impl Into<String>, dynamic: bool) -> usize {
        let test_id = self.records.len();
        self.records.push(TestRecord {
            test_id,
            name: name.into(),
            dynamic,
            status: TestStatus::Running,
            start_time_ms: unix_millis(),
            elapsed_ms: None,
            message: None,
            started: Instant::now(),
        });
        test_id
    }

    /// Record the outcome of a started test.  Unknown ids are ignored.
    pub fn stop_test(&mut self, test_id: usize, status: TestStatus, message: Option<String>) {
        if let Some(record) = self.records.get_mut(test_id) {
            record.status = status;
            record.elapsed_ms = Some(duration_ms(record.started.elapsed()));
            record.message = message;
        }
    }

    pub fn records(&self) -> &[TestRecord] {
        &self.records
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary::default();
        for record in &self.records {
            summary.num_run += 1;
            if record.dynamic {
                summary.dynamic += 1;
            }
            match record.status {
                TestStatus::Pass => summary.passed += 1,
                TestStatus::Fail => {
                    summary.failed += 1;
                    summary.failed_tests.push(record.name.clone());
                }
                // A test still running when the summary is taken was interrupted.
                TestStatus::Error | TestStatus::Running => {
                    summary.errored += 1;
                    summary.errored_tests.push(record.name.clone());
                }
                TestStatus::Skip => summary.skipped += 1,
            }
        }
        summary
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Human-readable run summary.
pub fn format_summary(summary: &ReportSummary) -> String {
    let mut out = format!(
        "{} test(s) ran: {} succeeded, {} were skipped, {} failed, {} errored",
        summary.num_run, summary.passed, summary.skipped, summary.failed, summary.errored
    );
    if summary.dynamic > 0 {
        let _ = write!(out, " ({} dynamic)", summary.dynamic);
    }
    if !summary.failed_tests.is_empty() {
        out.push_str("\n    The following tests failed:");
        for name in &summary.failed_tests {
            let _ = write!(out, "\n        {}", name);
        }
    }
    if !summary.errored_tests.is_empty() {
        out.push_str("\n    The following tests had errors:");
        for name in &summary.errored_tests {
            let _ = write!(out, "\n        {}", name);
        }
    }
    out
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or(0)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
