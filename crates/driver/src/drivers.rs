//! The `drivers` module contains implementations of the [Driver] trait.

use crate::{
    backend::Backend,
    error::{TrackerError, WatchError},
    session::ChallengeSession,
    types::{BlockIdentity, Notification},
    watcher::{EventWatcher, ExecutionDecoder},
    ChainHeadTracker, Driver, DriverConfig,
};
use anyhow::Result;
use async_trait::async_trait;
use rollup_challenger_protocol::bisection::{Response, Solver};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Defines a new [Driver] implementation from its fields and its loop.
#[macro_export]
macro_rules! define_driver {
    ($name:ident { $($(#[$doc:meta])* $field:ident: $ty:ty),* $(,)? }, $inner:expr) => {
        #[doc = concat!("Variant of the [Driver] trait: [", stringify!($name), "]")]
        pub struct $name {
            $($(#[$doc])* pub $field: $ty,)*
        }

        #[async_trait]
        impl Driver for $name {
            async fn start_loop(self) -> Result<()> {
                #[allow(clippy::redundant_closure_call)]
                $inner(self).await
            }
        }

        impl $name {
            #[doc = concat!("Creates a new instance of the [", stringify!($name), "] driver.")]
            pub fn new($($field: $ty),*) -> Self {
                Self { $($field),* }
            }
        }
    };
}

define_driver!(
    HeadTrackerDriver {
        /// The ledger to follow.
        backend: Arc<dyn Backend>,
        /// The configuration for all of the drivers.
        config: Arc<DriverConfig>,
        /// Receives every new head. After a reorg, heads restart below the reorged block.
        heads: mpsc::Sender<BlockIdentity>,
        /// Stops the driver when signalled.
        shutdown: broadcast::Sender<()>,
    },
    (|driver: HeadTrackerDriver| {
        async move {
            let mut start = driver.backend.current_block_identity().await?;
            tracing::info!(target: "head-tracker-driver", "Starting head tracker driver at block {}", start);

            loop {
                let mut blocks = ChainHeadTracker::new(Arc::clone(&driver.backend), driver.config.tracker)
                    .start(start, driver.shutdown.subscribe());

                let mut rollback = None;
                while let Some(next) = blocks.recv().await {
                    match next {
                        Ok(block) => {
                            if driver.heads.send(block).await.is_err() {
                                tracing::info!(target: "head-tracker-driver", "Head receiver dropped, stopping");
                                return Ok(());
                            }
                        }
                        Err(TrackerError::Reorg { height, .. }) => {
                            let height = height.saturating_sub(1 + driver.config.reorg_rollback_depth);
                            tracing::warn!(target: "head-tracker-driver", "Reorg detected, restarting from block {}", height);
                            rollback = Some(height);
                        }
                        Err(err) => return Err(err.into()),
                    }
                }

                match rollback {
                    Some(height) => start = driver.backend.block_identity_for_height(height).await?,
                    None => {
                        tracing::info!(target: "head-tracker-driver", "Head tracker driver shut down");
                        return Ok(());
                    }
                }
            }
        }
    })
);

define_driver!(
    DisputeDriver {
        /// Our side of the challenge.
        session: ChallengeSession,
        /// Follows the events of the challenge contract.
        watcher: EventWatcher<ExecutionDecoder>,
        /// Decides our moves.
        solver: Arc<dyn Solver>,
        /// Stops the driver when signalled.
        shutdown: broadcast::Sender<()>,
    },
    (|driver: DisputeDriver| {
        async move {
            let DisputeDriver { mut session, watcher, solver, shutdown } = driver;
            let (height, log_index) = session.resume_from();
            tracing::info!(target: "dispute-driver", "Playing {:?} as {}", session.address(), session.role());
            let mut stream = watcher.open_event_stream(height, log_index, shutdown.subscribe()).await?;

            while let Some(next) = stream.recv().await {
                let reorged = match next {
                    Ok(notification) if !session.extends_head(notification.block()) => {
                        tracing::warn!(target: "dispute-driver", "Block {} does not extend block {}", notification.block(), session.head());
                        true
                    }
                    Ok(notification) => {
                        if let Err(err) = session.handle(&notification) {
                            // Soft failure, the session logged it. Keep following the ledger.
                            tracing::debug!(target: "dispute-driver", "Ignoring inconsistent notification: {}", err);
                        }
                        if let Some(outcome) = session.outcome() {
                            tracing::info!(target: "dispute-driver", "Challenge {:?} over: {}", session.address(), outcome);
                            return Ok(());
                        }
                        if matches!(notification, Notification::Block(_)) {
                            respond(&mut session, solver.as_ref()).await;
                        }
                        false
                    }
                    Err(WatchError::Tracker(TrackerError::Reorg { height, .. })) => {
                        tracing::warn!(target: "dispute-driver", "Reorg at block {}", height);
                        true
                    }
                    Err(err) => return Err(err.into()),
                };

                if reorged {
                    // Everything applied since the last canonical block is replayed from the new branch.
                    let (height, log_index) = session.rewind().await?;
                    tracing::info!(target: "dispute-driver", "Replaying {:?} from block {}", session.address(), height);
                    stream = watcher.open_event_stream(height, log_index, shutdown.subscribe()).await?;
                }
            }

            tracing::info!(target: "dispute-driver", "Dispute driver shut down");
            Ok(())
        }
    })
);

/// Asks the solver for our next move and submits it. Failures are logged; the move is retried at
/// the next block.
async fn respond(session: &mut ChallengeSession, solver: &dyn Solver) {
    let response = match solver.respond(session.challenge(), session.role()) {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(target: "dispute-driver", "Solver failed: {}", err);
            return;
        }
    };

    let result = match response {
        Response::DoNothing => return,
        Response::Bisect(assertions) => session.submit_bisection(assertions).await,
        Response::ChooseSegment(index) => session.submit_choose_segment(index).await,
        Response::OneStepProof(proof) => session.submit_one_step_proof(proof).await,
    };
    if let Err(err) = result {
        tracing::warn!(target: "dispute-driver", "Move failed at block {}: {}", session.head().height, err);
    }
}
