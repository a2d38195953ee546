//! The watcher module contains the [EventWatcher], which turns the logs of a challenge contract
//! into a stream of decoded [Notification]s, and the decoders of every challenge variant.

use crate::{
    backend::Backend,
    error::{DecodeError, WatchError},
    types::{BlockIdentity, LogEntry, Notification, ObservedEvent},
    utils, ChainHeadTracker, DriverConfig, TrackerConfig,
};
use anyhow::Result;
use ethers::{
    abi::ParamType,
    types::{Address, H256},
};
use rollup_challenger_protocol::bisection::ChallengeEvent;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

mod bisection;
pub use bisection::BisectionDecoder;

mod execution;
pub use execution::ExecutionDecoder;

mod inbox_top;
pub use inbox_top::InboxTopDecoder;

mod messages;
pub use messages::MessagesDecoder;

pub(crate) const BYTES32: ParamType = ParamType::FixedBytes(32);
pub(crate) const UINT64: ParamType = ParamType::Uint(64);

pub(crate) fn array_of(param: ParamType) -> ParamType {
    ParamType::Array(Box::new(param))
}

/// Returns the topic identifying the event of `log`.
pub(crate) fn topic_of(log: &LogEntry) -> Result<H256, DecodeError> {
    utils::first_topic(log).ok_or(DecodeError::MissingTopic)
}

/// Either the next [Notification] of an event stream or the terminal error that ended it.
pub type MaybeNotification = Result<Notification, WatchError>;

/// The [EventDecoder] trait decodes the logs of one challenge contract variant.
pub trait EventDecoder: Send + Sync + 'static {
    /// The `topics[0]` of every event the decoder understands.
    fn topics(&self) -> Vec<H256>;

    /// Decode a log into a [ChallengeEvent].
    ///
    /// ### Returns
    /// - `Ok(ChallengeEvent)`: The decoded event.
    /// - `Err(DecodeError)`: The log is not a well formed event of this variant.
    fn decode(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError>;
}

/// The [EventWatcher] follows the chain and reports the events of a single challenge contract,
/// block by block.
pub struct EventWatcher<D> {
    /// The address of the watched contract.
    address: Address,
    /// Decodes the logs of the watched contract.
    decoder: Arc<D>,
    /// The ledger.
    backend: Arc<dyn Backend>,
    /// The configuration of the underlying chain head tracker.
    tracker: TrackerConfig,
    /// The capacity of the notification channel.
    buffer: usize,
}

impl<D: EventDecoder> EventWatcher<D> {
    /// Creates a new [EventWatcher].
    pub fn new(
        address: Address,
        decoder: D,
        backend: Arc<dyn Backend>,
        config: &DriverConfig,
    ) -> Self {
        Self {
            address,
            decoder: Arc::new(decoder),
            backend,
            tracker: config.tracker,
            buffer: config.event_buffer,
        }
    }

    /// Returns the address of the watched contract.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Opens a stream of the contract's events.
    ///
    /// Every block from `from_height` onwards is reported as the [Notification::Event]s of its
    /// logs followed by a [Notification::Block]. Logs of block `from_height` with an index below
    /// `from_log_index` are skipped, which lets a consumer resume right after the last event it
    /// processed.
    ///
    /// ### Takes
    /// - `from_height`: The first block to report. It must exist.
    /// - `from_log_index`: The first log index to report within `from_height`.
    /// - `shutdown`: Closes the stream without an error when signalled or when its sender is
    ///   dropped.
    ///
    /// ### Returns
    /// - `Ok(mpsc::Receiver)`: The stream. An error item is always the last one.
    /// - `Err(anyhow::Error)`: The block at `from_height` could not be fetched.
    pub async fn open_event_stream(
        &self,
        from_height: u64,
        from_log_index: u64,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<mpsc::Receiver<MaybeNotification>> {
        let start = self.backend.block_identity_for_height(from_height).await?;
        let blocks = ChainHeadTracker::new(Arc::clone(&self.backend), self.tracker)
            .start(start, shutdown.resubscribe());

        let (tx, rx) = mpsc::channel(self.buffer.max(1));
        let subscription = Subscription {
            address: self.address,
            decoder: Arc::clone(&self.decoder),
            topics: self.decoder.topics(),
            backend: Arc::clone(&self.backend),
            resume: (from_height, from_log_index),
        };
        tracing::info!(target: "event-watcher", "Watching {:?} from block {}, log {}", self.address, from_height, from_log_index);
        tokio::spawn(subscription.run(blocks, tx, shutdown));
        Ok(rx)
    }
}

/// A single running event stream.
struct Subscription<D> {
    address: Address,
    decoder: Arc<D>,
    topics: Vec<H256>,
    backend: Arc<dyn Backend>,
    resume: (u64, u64),
}

impl<D: EventDecoder> Subscription<D> {
    async fn run(
        self,
        mut blocks: mpsc::Receiver<crate::types::MaybeBlockIdentity>,
        tx: mpsc::Sender<MaybeNotification>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                next = blocks.recv() => next,
            };
            let block = match next {
                Some(Ok(block)) => block,
                Some(Err(err)) => {
                    utils::publish(&tx, Err(err.into()), &mut shutdown).await;
                    return;
                }
                None => return,
            };

            match self.notifications(&block).await {
                Ok(notifications) => {
                    for notification in notifications {
                        if !utils::publish(&tx, Ok(notification), &mut shutdown).await {
                            return;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(target: "event-watcher", "Watching {:?} stopped: {}", self.address, err);
                    utils::publish(&tx, Err(err), &mut shutdown).await;
                    return;
                }
            }
        }
    }

    /// Collects the notifications of a single block.
    async fn notifications(&self, block: &BlockIdentity) -> Result<Vec<Notification>, WatchError> {
        let logs = self
            .backend
            .fetch_logs(self.address, &self.topics, block.height, block.height)
            .await
            .map_err(|source| WatchError::Fetch {
                height: block.height,
                source,
            })?;

        let mut notifications = Vec::with_capacity(logs.len() + 1);
        for log in logs {
            if log.block_hash != block.header_hash {
                return Err(WatchError::BlockMismatch {
                    height: block.height,
                    expected: block.header_hash,
                    found: log.block_hash,
                });
            }
            if (log.block_height, log.log_index) < self.resume {
                continue;
            }

            let event = self.decoder.decode(&log).map_err(|source| WatchError::Decode {
                height: block.height,
                log_index: log.log_index,
                source,
            })?;
            tracing::debug!(target: "event-watcher", "{} at block {}, log {}", event.name(), block.height, log.log_index);
            notifications.push(Notification::Event(ObservedEvent {
                block: *block,
                log_index: log.log_index,
                event,
            }));
        }

        notifications.push(Notification::Block(*block));
        Ok(notifications)
    }
}
