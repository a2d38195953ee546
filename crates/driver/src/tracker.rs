//! The tracker module contains the [ChainHeadTracker], which follows the base ledger one block at
//! a time.

use crate::{
    backend::Backend,
    error::TrackerError,
    types::{BlockIdentity, MaybeBlockIdentity},
    utils, TrackerConfig,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// The [ChainHeadTracker] turns the header source of a [Backend] into an ordered stream of
/// [BlockIdentity]s in which every block extends the previous one.
///
/// A header that is not available yet is polled for until it appears. Any other fetch failure is
/// retried up to [TrackerConfig::max_fetch_attempts] times per height. A header whose parent is
/// not the previously emitted block ends the stream with [TrackerError::Reorg]. A tracker
/// cannot be restarted; construct a new one from the block to resume at.
pub struct ChainHeadTracker {
    /// The header source.
    backend: Arc<dyn Backend>,
    /// The retry policy and channel capacity.
    config: TrackerConfig,
}

impl ChainHeadTracker {
    /// Creates a new [ChainHeadTracker].
    pub fn new(backend: Arc<dyn Backend>, config: TrackerConfig) -> Self {
        Self { backend, config }
    }

    /// Spawns the tracking task.
    ///
    /// ### Takes
    /// - `start`: The first block of the stream. It is emitted before any other block.
    /// - `shutdown`: Closes the stream without an error when signalled or when its sender is
    ///   dropped.
    ///
    /// ### Returns
    /// - The receiving end of the stream. After an error item the stream is closed.
    pub fn start(
        self,
        start: BlockIdentity,
        shutdown: broadcast::Receiver<()>,
    ) -> mpsc::Receiver<MaybeBlockIdentity> {
        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        tokio::spawn(self.run(start, tx, shutdown));
        rx
    }

    async fn run(
        self,
        start: BlockIdentity,
        tx: mpsc::Sender<MaybeBlockIdentity>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tracing::debug!(target: "chain-head-tracker", "Tracking chain head from block {}", start);
        if !utils::publish(&tx, Ok(start), &mut shutdown).await {
            return;
        }

        let mut previous = start;
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::debug!(target: "chain-head-tracker", "Shutdown requested at block {}", previous.height);
                    return;
                }
                next = self.next_block(&previous) => next,
            };

            match next {
                Ok(block) => {
                    tracing::trace!(target: "chain-head-tracker", "New block {}", block);
                    if !utils::publish(&tx, Ok(block), &mut shutdown).await {
                        return;
                    }
                    previous = block;
                }
                Err(err) => {
                    tracing::error!(target: "chain-head-tracker", "Tracking stopped: {}", err);
                    utils::publish(&tx, Err(err), &mut shutdown).await;
                    return;
                }
            }
        }
    }

    /// Fetches the block following `previous`, retrying until it is available.
    async fn next_block(&self, previous: &BlockIdentity) -> Result<BlockIdentity, TrackerError> {
        let height = previous.height + 1;
        let mut failures = 0u32;

        loop {
            match self.backend.fetch_header(height).await {
                Ok(Some(block)) if block.parent_hash == previous.header_hash => return Ok(block),
                Ok(Some(block)) => {
                    return Err(TrackerError::Reorg {
                        height,
                        expected_parent: previous.header_hash,
                        found_parent: block.parent_hash,
                    })
                }
                Ok(None) => {
                    tracing::trace!(target: "chain-head-tracker", "Block {} not available yet", height);
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(target: "chain-head-tracker", "Failed to fetch block {} ({}/{}): {}", height, failures, self.config.max_fetch_attempts, e);
                    if failures >= self.config.max_fetch_attempts {
                        return Err(TrackerError::FetchExhausted {
                            height,
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                }
            }

            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::SimBackend;
    use std::time::Duration;

    fn config() -> TrackerConfig {
        TrackerConfig {
            retry_delay: Duration::from_millis(100),
            max_fetch_attempts: 5,
            buffer: 8,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_a_continuous_chain() {
        let sim = SimBackend::new();
        let genesis = sim.latest_header().await.unwrap();
        sim.mine_blocks(5).await;

        let (shutdown, _) = broadcast::channel(1);
        let mut blocks =
            ChainHeadTracker::new(Arc::new(sim.clone()), config()).start(genesis, shutdown.subscribe());

        let mut previous = blocks.recv().await.unwrap().unwrap();
        assert_eq!(previous, genesis);
        for _ in 0..5 {
            let block = blocks.recv().await.unwrap().unwrap();
            assert!(previous.is_parent_of(&block));
            previous = block;
        }

        // Blocks mined while tracking are picked up as well.
        let mined = sim.mine_block().await;
        assert_eq!(blocks.recv().await.unwrap().unwrap(), mined);

        shutdown.send(()).unwrap();
        assert!(blocks.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reorg_is_terminal() {
        let sim = SimBackend::new();
        sim.mine_blocks(5).await;
        let stale = sim.block_identity_for_height(3).await.unwrap();
        sim.reorg(3).await;

        let (shutdown, _) = broadcast::channel(1);
        let mut blocks =
            ChainHeadTracker::new(Arc::new(sim), config()).start(stale, shutdown.subscribe());

        assert_eq!(blocks.recv().await.unwrap().unwrap(), stale);
        match blocks.recv().await.unwrap() {
            Err(TrackerError::Reorg {
                height,
                expected_parent,
                ..
            }) => {
                assert_eq!(height, 4);
                assert_eq!(expected_parent, stale.header_hash);
            }
            other => panic!("Expected a reorg, got {:?}", other),
        }
        assert!(blocks.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetches_are_bounded() {
        let sim = SimBackend::new();
        let genesis = sim.latest_header().await.unwrap();
        sim.mine_block().await;
        sim.fail_header_fetches(5).await;

        let (shutdown, _) = broadcast::channel(1);
        let mut blocks =
            ChainHeadTracker::new(Arc::new(sim), config()).start(genesis, shutdown.subscribe());

        assert_eq!(blocks.recv().await.unwrap().unwrap(), genesis);
        assert!(matches!(
            blocks.recv().await.unwrap(),
            Err(TrackerError::FetchExhausted {
                height: 1,
                attempts: 5,
                ..
            })
        ));
        assert!(blocks.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_below_the_cap_recover() {
        let sim = SimBackend::new();
        let genesis = sim.latest_header().await.unwrap();
        let first = sim.mine_block().await;
        sim.fail_header_fetches(4).await;

        let (shutdown, _) = broadcast::channel(1);
        let mut blocks =
            ChainHeadTracker::new(Arc::new(sim), config()).start(genesis, shutdown.subscribe());

        assert_eq!(blocks.recv().await.unwrap().unwrap(), genesis);
        assert_eq!(blocks.recv().await.unwrap().unwrap(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_blocks_are_polled_until_shutdown() {
        let sim = SimBackend::new();
        let genesis = sim.latest_header().await.unwrap();

        let (shutdown, _) = broadcast::channel(1);
        let mut blocks =
            ChainHeadTracker::new(Arc::new(sim), config()).start(genesis, shutdown.subscribe());
        assert_eq!(blocks.recv().await.unwrap().unwrap(), genesis);

        // Far more polls than the failure cap; not-found never exhausts the tracker.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(blocks.try_recv().is_err());

        drop(shutdown);
        assert!(blocks.recv().await.is_none());
    }
}
