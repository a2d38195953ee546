#![doc = include_str!("../README.md")]

use anyhow::Result;
use async_trait::async_trait;

/// Contains the wire codec of the challenge contracts.
pub mod abi;

/// Contains the ledger backends.
pub mod backend;

/// Contains the event watchers and the decoders of every challenge variant.
pub mod watcher;

mod config;
pub use config::{DriverConfig, TrackerConfig};

mod drivers;
pub use drivers::{DisputeDriver, HeadTrackerDriver};

mod error;
pub use error::{DecodeError, SessionError, TrackerError, WatchError};

mod session;
pub use session::{ChallengeSession, DEFAULT_REWIND_DEPTH};

mod state;
pub use state::{ActiveDisputes, DisputeClaim};

mod tracker;
pub use tracker::ChainHeadTracker;

mod types;
pub use types::{BlockIdentity, LogEntry, MaybeBlockIdentity, Notification, ObservedEvent, TxHash};

mod utils;

/// The [Driver] trait defines the interface for all driver loops that are ran by the
/// `rollup-challenger` binary.
#[async_trait]
pub trait Driver {
    /// Starts the [Driver] loop.
    async fn start_loop(self) -> Result<()>;
}
