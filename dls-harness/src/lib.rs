//! Deterministic synchronization harness for background download workers.
//!
//! A scenario drives a worker through the shared state store and a scripted
//! HTTP peer, then waits on observable state instead of sleeping:
//!
//! - [`ChangeNotifier`] turns store commits into wake-ups for the scenario thread.
//! - [`StatusWaiter`] waits, with a deadline, for a download to reach a status.
//! - [`MockNetworkPeer`] serves queued responses and records requests, which
//!   [`RequestCorrelator`] hands back in order.
//! - [`ThreadDrain`] waits for the worker to go quiet before teardown.
//! - [`Scenario`] wires all of the above around one worker instance.

pub mod assertions;
pub mod config;
pub mod correlator;
pub mod drain;
pub mod error;
pub mod notifier;
pub mod peer;
pub mod scenario;
pub mod waiter;

pub use assertions::{assert_starts_with, read_stream};
pub use config::HarnessConfig;
pub use correlator::RequestCorrelator;
pub use drain::{DrainReport, ThreadDrain};
pub use error::{ErrorKind, HarnessError, HarnessResult};
pub use notifier::{ChangeNotifier, NotifierObserver};
pub use peer::{MockNetworkPeer, MockResponse, PeerError, RecordedRequest};
pub use scenario::{NoWorker, Scenario, ScenarioBuilder};
pub use waiter::{FaultCheck, StatusReader, StatusWaiter, StoreStatusReader, WaitOutcome};
