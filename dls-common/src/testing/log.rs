//! Structured scenario logging for CI debugging.
//!
//! Scenarios are timing-sensitive, so a failed wait is much easier to read
//! with a JSONL trail of what the worker, the peer and the waiter did.
//!
//! # Global JSONL Logging
//!
//! ```ignore
//! use dls_common::testing::init_global_test_logging;
//!
//! #[ctor::ctor]
//! fn setup() {
//!     init_global_test_logging();
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once, PoisonError};
use std::time::Instant;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Scenario execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    /// Environment, store and peer construction.
    Setup,
    /// Worker triggered, waits in progress.
    Execute,
    /// Assertions on observed state.
    Verify,
    /// Drain, cleanup and shutdown.
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Initialize global JSONL logging for all tests.
///
/// Events go to `target/test-logs/all_tests.jsonl` and, compactly, to the
/// test writer. Safe to call multiple times.
///
/// # Environment Variables
///
/// - `DLS_TEST_LOG_FILE`: Override the log file path
/// - `DLS_TEST_LOG_LEVEL`: Level filter for the harness crates (default: `info`)
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let log_file = create_global_log_file();

        let file_layer = log_file.map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .with_thread_names(true)
            .compact();

        let level = std::env::var("DLS_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "dls_common={level},dls_worker={level},dls_harness={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var("DLS_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = test_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}

/// `target/test-logs`, searching upwards from the current directory.
fn test_log_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir).join("test-logs");
    }

    let mut dir = std::env::current_dir().unwrap_or_default();
    loop {
        if dir.join("target").is_dir() {
            return dir.join("target").join("test-logs");
        }
        if !dir.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

/// One JSONL line in a scenario log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    /// RFC 3339 wall-clock time, millisecond precision.
    pub at: String,
    pub test: String,
    pub phase: TestPhase,
    /// Milliseconds since the logger was created.
    pub elapsed_ms: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Outcome written as the last line of a scenario log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: String,
    pub passed: bool,
    pub elapsed_ms: u64,
    /// Entries written, including the start and end lines.
    pub entries: usize,
}

/// Writes `target/test-logs/<name>.jsonl` for one scenario and mirrors every
/// entry to `tracing` under the `test` target.
pub struct TestLogger {
    test: String,
    started: Instant,
    entries: AtomicUsize,
    file: Option<Mutex<std::fs::File>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let file = open_scenario_log(test_name)
            .map_err(|err| tracing::warn!(test = test_name, error = %err, "no scenario log file"))
            .ok();
        let logger = Self {
            test: test_name.to_string(),
            started: Instant::now(),
            entries: AtomicUsize::new(0),
            file: file.map(Mutex::new),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.record(phase, message.into(), None);
    }

    pub fn log_with_data(
        &self,
        phase: TestPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        self.record(phase, message.into(), Some(data));
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Write the closing line and return the summary.
    pub fn finish(self, failure: Option<String>) -> TestResult {
        let passed = failure.is_none();
        match failure {
            None => self.log(TestPhase::Verify, "TEST PASS"),
            Some(reason) => self.log_with_data(
                TestPhase::Verify,
                "TEST FAIL",
                serde_json::json!({ "reason": reason }),
            ),
        }
        TestResult {
            test: self.test.clone(),
            passed,
            elapsed_ms: self.elapsed_ms(),
            entries: self.entries.load(Ordering::SeqCst),
        }
    }

    fn record(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            test: self.test.clone(),
            phase,
            elapsed_ms: self.elapsed_ms(),
            message,
            data,
        };
        self.entries.fetch_add(1, Ordering::SeqCst);

        tracing::info!(
            target: "test",
            test = %entry.test,
            %phase,
            elapsed_ms = entry.elapsed_ms,
            "{}",
            entry.message
        );

        let Some(file) = &self.file else { return };
        let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Ok(line) = serde_json::to_string(&entry) {
            let _ = writeln!(file, "{line}");
        }
    }
}

fn open_scenario_log(test_name: &str) -> std::io::Result<std::fs::File> {
    let dir = test_log_dir();
    std::fs::create_dir_all(&dir)?;
    let file_name: String = test_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    std::fs::File::create(dir.join(format!("{file_name}.jsonl")))
}

/// Scenario logger that writes TEST PASS or TEST FAIL when dropped.
///
/// Enabled with `DLS_TEST_LOGGING=1`, or by default in CI; otherwise a no-op.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        let inner = Self::is_enabled().then(|| {
            init_global_test_logging();
            TestLogger::for_test(test_name)
        });
        Self { inner }
    }

    fn is_enabled() -> bool {
        match std::env::var("DLS_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        }
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        if let Some(logger) = &self.inner {
            logger.log(phase, message);
        }
    }

    pub fn log_with_data(
        &self,
        phase: TestPhase,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        if let Some(logger) = &self.inner {
            logger.log_with_data(phase, message, data);
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            let failure = std::thread::panicking().then(|| "test panicked".to_string());
            logger.finish(failure);
        }
    }
}

/// Create a [`TestGuard`] named after the enclosing test function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_omits_missing_data() {
        let logger = TestLogger {
            test: "scenario_ok".to_string(),
            started: Instant::now(),
            entries: AtomicUsize::new(0),
            file: None,
        };
        logger.log(TestPhase::Execute, "waiting");
        let result = logger.finish(None);
        assert!(result.passed);
        assert_eq!(result.entries, 2);

        let entry = TestLogEntry {
            at: "2026-01-01T00:00:00.000Z".to_string(),
            test: "scenario_ok".to_string(),
            phase: TestPhase::Execute,
            elapsed_ms: 42,
            message: "waiting".to_string(),
            data: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"phase\":\"execute\""));
        assert!(!json.contains("data"));
    }

    #[test]
    fn test_logger_writes_jsonl_file() {
        let logger = TestLogger::for_test("dls_common_logger_writes_jsonl");
        logger.log_with_data(
            TestPhase::Teardown,
            "drained",
            serde_json::json!({ "polls": 3 }),
        );
        let result = logger.finish(Some("boom".to_string()));
        assert!(!result.passed);
        assert_eq!(result.entries, 3);

        let path = test_log_dir().join("dls_common_logger_writes_jsonl.jsonl");
        let text = std::fs::read_to_string(path).unwrap();
        let entries: Vec<TestLogEntry> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "TEST START");
        assert_eq!(entries[1].data, Some(serde_json::json!({ "polls": 3 })));
        assert_eq!(entries[2].message, "TEST FAIL");
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(TestPhase::Setup.to_string(), "setup");
        assert_eq!(TestPhase::Teardown.to_string(), "teardown");
    }

    #[test]
    fn test_guard_disabled_is_noop() {
        let guard = TestGuard { inner: None };
        guard.log(TestPhase::Execute, "no-op");
        guard.log_with_data(TestPhase::Verify, "no-op", serde_json::json!({}));
    }
}
