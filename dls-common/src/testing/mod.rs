//! Test support: structured scenario logging.

mod log;

pub use log::{
    TestGuard, TestLogEntry, TestLogger, TestPhase, TestResult, init_global_test_logging,
};
