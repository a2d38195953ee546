//! The session module contains the [ChallengeSession], one participant's view of a single
//! challenge contract.

use crate::{
    backend::Backend,
    error::SessionError,
    state::{ActiveDisputes, DisputeClaim},
    types::{BlockIdentity, Notification, TxHash},
};
use ethers::types::{Address, Bytes};
use rollup_challenger_protocol::bisection::{
    BisectionChallenge, ChallengeAction, ChallengePhase, ExecutionAssertionStub, Outcome, Party,
    ProtocolError, TimeTicks,
};
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::watch;

/// The number of blocks a session can rewind by default after a reorg.
pub const DEFAULT_REWIND_DEPTH: usize = 64;

/// A point a session can rewind to: the local state and the position of the first notification
/// it has not applied yet.
#[derive(Clone)]
struct Checkpoint {
    head: BlockIdentity,
    cursor: (u64, u64),
    challenge: BisectionChallenge,
}

/// The [ChallengeSession] binds a local [BisectionChallenge] to a challenge contract.
///
/// Moves are validated locally, submitted through the [Backend] and kept only if the ledger
/// accepts them. Notifications of the contract's event stream keep the local state in sync with
/// the ledger, and every change of the outcome is published to subscribers.
///
/// The state at the end of each of the last [DEFAULT_REWIND_DEPTH] blocks is kept so that a
/// reorg can be undone with [ChallengeSession::rewind].
pub struct ChallengeSession {
    /// The address of the challenge contract.
    address: Address,
    /// The side we play.
    role: Party,
    /// The ledger.
    backend: Arc<dyn Backend>,
    /// The local copy of the challenge.
    challenge: BisectionChallenge,
    /// The latest block whose events have all been applied.
    head: BlockIdentity,
    /// The position of the first notification that has not been applied yet.
    cursor: (u64, u64),
    /// Publishes the outcome of the challenge.
    outcome: watch::Sender<Option<Outcome>>,
    /// The state at the end of recent blocks, oldest first.
    checkpoints: VecDeque<Checkpoint>,
    /// The number of blocks that can be rewound.
    rewind_depth: usize,
    /// Keeps the challenge registered as active while the session lives.
    _claim: DisputeClaim,
}

impl ChallengeSession {
    /// Opens a session on the challenge contract at `address`.
    ///
    /// ### Takes
    /// - `disputes`: The registry of challenges this process plays.
    /// - `address`: The address of the challenge contract.
    /// - `role`: The side we play.
    /// - `backend`: The ledger the contract lives on.
    /// - `challenge`: The local copy of the challenge, as of `opened_at`.
    /// - `opened_at`: The block the challenge was opened at.
    ///
    /// ### Returns
    /// - `Ok(ChallengeSession)`: The session.
    /// - `Err(SessionError::AlreadyActive)`: The challenge is already played from that side.
    pub fn open(
        disputes: &ActiveDisputes,
        address: Address,
        role: Party,
        backend: Arc<dyn Backend>,
        challenge: BisectionChallenge,
        opened_at: BlockIdentity,
    ) -> Result<Self, SessionError> {
        let claim = disputes
            .claim(address, role)
            .ok_or(SessionError::AlreadyActive { address, role })?;
        let (outcome, _) = watch::channel(challenge.outcome());

        tracing::info!(target: "challenge-session", "Playing {:?} as {} from block {}", address, role, opened_at.height);
        let opening = Checkpoint {
            head: opened_at,
            cursor: (opened_at.height, 0),
            challenge: challenge.clone(),
        };
        Ok(Self {
            address,
            role,
            backend,
            challenge,
            head: opened_at,
            cursor: opening.cursor,
            outcome,
            checkpoints: VecDeque::from([opening]),
            rewind_depth: DEFAULT_REWIND_DEPTH,
            _claim: claim,
        })
    }

    /// Sets the number of blocks the session can rewind after a reorg.
    pub fn with_rewind_depth(mut self, depth: usize) -> Self {
        self.rewind_depth = depth.max(1);
        self.trim_checkpoints();
        self
    }

    /// Returns the address of the challenge contract.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the side we play.
    pub fn role(&self) -> Party {
        self.role
    }

    /// Returns the local copy of the challenge.
    pub fn challenge(&self) -> &BisectionChallenge {
        &self.challenge
    }

    /// Returns the phase of the local copy of the challenge.
    pub fn current_state(&self) -> &ChallengePhase {
        self.challenge.current_state()
    }

    /// Returns the latest block whose events have all been applied.
    pub fn head(&self) -> BlockIdentity {
        self.head
    }

    /// Returns the outcome of the challenge, if it is resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        self.challenge.outcome()
    }

    /// Returns the block height a move submitted now executes at.
    pub fn now(&self) -> TimeTicks {
        TimeTicks(self.head.height + 1)
    }

    /// Returns the position an event stream should be reopened at to continue right after the
    /// last applied notification, as a `(height, log_index)` pair.
    pub fn resume_from(&self) -> (u64, u64) {
        self.cursor
    }

    /// Returns true if `block` is the next block the session expects. The block the session was
    /// opened or rewound at is expected again only before any later block was applied.
    pub fn extends_head(&self, block: &BlockIdentity) -> bool {
        self.head == *block || self.head.is_parent_of(block)
    }

    /// Subscribes to the outcome of the challenge. The receiver holds [None] until the challenge
    /// is resolved.
    pub fn subscribe_outcome(&self) -> watch::Receiver<Option<Outcome>> {
        self.outcome.subscribe()
    }

    /// Splits the disputed interval and submits the bisection.
    pub async fn submit_bisection(
        &mut self,
        assertions: Vec<ExecutionAssertionStub>,
    ) -> Result<TxHash, SessionError> {
        let now = self.now();
        self.submit(move |challenge| challenge.submit_bisection(now, assertions))
            .await
    }

    /// Picks a segment of the pending bisection and submits the choice.
    pub async fn submit_choose_segment(&mut self, index: usize) -> Result<TxHash, SessionError> {
        let now = self.now();
        self.submit(move |challenge| challenge.submit_choose_segment(now, index))
            .await
    }

    /// Submits the one step proof of the disputed step.
    pub async fn submit_one_step_proof(&mut self, proof: Bytes) -> Result<TxHash, SessionError> {
        let now = self.now();
        self.submit(move |challenge| challenge.submit_one_step_proof(now, proof))
            .await
    }

    /// Applies `make_move` to the local challenge and submits the resulting action. The local
    /// state is rolled back unless the ledger accepts the action.
    async fn submit<F>(&mut self, make_move: F) -> Result<TxHash, SessionError>
    where
        F: FnOnce(&mut BisectionChallenge) -> Result<ChallengeAction, ProtocolError>,
    {
        let snapshot = self.challenge.clone();
        let action = make_move(&mut self.challenge)?;

        match self.backend.submit_and_wait(self.address, &action).await {
            Ok((tx, true)) => {
                tracing::info!(target: "challenge-session", "{} on {:?} included in {:?}", action.name(), self.address, tx);
                self.publish_outcome();
                Ok(tx)
            }
            Ok((tx, false)) => {
                tracing::warn!(target: "challenge-session", "{} on {:?} reverted in {:?}", action.name(), self.address, tx);
                self.challenge = snapshot;
                Err(SessionError::Rejected {
                    action: action.name(),
                    tx,
                })
            }
            Err(source) => {
                tracing::warn!(target: "challenge-session", "Failed to submit {} on {:?}: {}", action.name(), self.address, source);
                self.challenge = snapshot;
                Err(SessionError::Submission {
                    action: action.name(),
                    source,
                })
            }
        }
    }

    /// Applies a notification of the contract's event stream.
    ///
    /// ### Returns
    /// - `Ok(Some(Outcome))`: The notification resolved the challenge.
    /// - `Ok(None)`: The notification was applied.
    /// - `Err(ProtocolError)`: The event contradicts the local state, which is left unchanged.
    pub fn handle(&mut self, notification: &Notification) -> Result<Option<Outcome>, ProtocolError> {
        let result = match notification {
            Notification::Event(observed) => {
                self.cursor = (observed.block.height, observed.log_index + 1);
                self.challenge
                    .apply_event(&observed.event, observed.block.ticks())
            }
            Notification::Block(block) => {
                self.head = *block;
                self.cursor = (block.height + 1, 0);
                let result = self.challenge.on_block(block.ticks());
                self.checkpoints.push_back(Checkpoint {
                    head: self.head,
                    cursor: self.cursor,
                    challenge: self.challenge.clone(),
                });
                self.trim_checkpoints();
                Ok(result)
            }
        };

        match &result {
            Ok(Some(outcome)) => {
                tracing::info!(target: "challenge-session", "Challenge {:?} resolved: {}", self.address, outcome)
            }
            Ok(None) => {}
            Err(err) => {
                tracing::error!(target: "challenge-session", "Challenge {:?} diverged from the ledger: {}", self.address, err)
            }
        }
        self.publish_outcome();
        result
    }

    /// Restores the state at the end of the latest block that is still part of the canonical
    /// chain, dropping everything applied after it.
    ///
    /// ### Returns
    /// - `Ok((u64, u64))`: The position the event stream must be reopened at.
    /// - `Err(SessionError::RewindExhausted)`: None of the recent blocks is canonical anymore.
    /// - `Err(SessionError::Ledger)`: A header could not be fetched.
    pub async fn rewind(&mut self) -> Result<(u64, u64), SessionError> {
        while let Some(head) = self.checkpoints.back().map(|c| c.head) {
            let canonical = self
                .backend
                .fetch_header(head.height)
                .await
                .map_err(|source| SessionError::Ledger { source })?;
            if canonical == Some(head) {
                break;
            }
            tracing::debug!(target: "challenge-session", "Block {} left the canonical chain", head);
            self.checkpoints.pop_back();
        }

        let checkpoint = self
            .checkpoints
            .back()
            .cloned()
            .ok_or(SessionError::RewindExhausted {
                address: self.address,
            })?;
        tracing::warn!(target: "challenge-session", "Challenge {:?} rewound from block {} to block {}", self.address, self.head, checkpoint.head);
        self.head = checkpoint.head;
        self.cursor = checkpoint.cursor;
        self.challenge = checkpoint.challenge;
        self.publish_outcome();
        Ok(self.cursor)
    }

    fn trim_checkpoints(&mut self) {
        while self.checkpoints.len() > self.rewind_depth + 1 {
            self.checkpoints.pop_front();
        }
    }

    fn publish_outcome(&self) {
        let outcome = self.challenge.outcome();
        self.outcome.send_if_modified(|current| {
            let modified = *current != outcome;
            *current = outcome;
            modified
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{backend::SimBackend, types::ObservedEvent};
    use ethers::types::H256;
    use rollup_challenger_protocol::bisection::{
        AlphabetTrace, AlphabetVerifier, ChallengeConfig, ChallengeEvent, Resolution,
        SegmentClaim, StepRange, TimeBounds,
    };

    const CONTRACT: Address = Address::repeat_byte(0x66);
    const CONFIG: ChallengeConfig = ChallengeConfig {
        fan_out: 2,
        timeout_window: 3,
    };

    fn claim_of(trace: &AlphabetTrace) -> SegmentClaim {
        SegmentClaim {
            precondition: trace.precondition(0).unwrap(),
            assertion: trace
                .assertion(StepRange::new(0, trace.total_steps()))
                .unwrap(),
        }
    }

    /// Deploys a contract disputing `onchain` and opens a session that believes in `local`.
    async fn setup(
        sim: &SimBackend,
        disputes: &ActiveDisputes,
        onchain: &AlphabetTrace,
        local: &AlphabetTrace,
        role: Party,
    ) -> ChallengeSession {
        let total = onchain.total_steps();
        let opened_at = sim
            .open_execution_challenge(
                CONTRACT,
                CONFIG,
                claim_of(onchain),
                total,
                Arc::new(AlphabetVerifier),
            )
            .await
            .unwrap();
        let challenge =
            BisectionChallenge::new(CONFIG, total, opened_at.ticks(), Arc::new(AlphabetVerifier))
                .unwrap()
                .with_claim(claim_of(local));
        ChallengeSession::open(
            disputes,
            CONTRACT,
            role,
            Arc::new(sim.clone()),
            challenge,
            opened_at,
        )
        .unwrap()
    }

    fn block(height: u64) -> BlockIdentity {
        BlockIdentity {
            height,
            header_hash: H256::from_low_u64_be(height + 1),
            parent_hash: H256::from_low_u64_be(height),
        }
    }

    #[tokio::test]
    async fn failed_submission_restores_state() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let mut session = setup(&sim, &disputes, &trace, &trace, Party::Asserter).await;
        let stubs = trace.bisect(StepRange::new(0, 4), 2).unwrap();

        sim.reject_next_submission().await;
        let err = session.submit_bisection(stubs.clone()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Submission {
                action: "BisectAssertion",
                ..
            }
        ));
        assert!(session.challenge().pending_segments().is_none());

        session.submit_bisection(stubs).await.unwrap();
        assert_eq!(session.challenge().pending_segments().map(|s| s.len()), Some(2));
        assert_eq!(
            session.current_state().state().map(|s| s.turn),
            Some(Party::Challenger)
        );
    }

    #[tokio::test]
    async fn reverted_move_restores_state() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let honest = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let faulty = AlphabetTrace::faulty(b'a', 4, 2, TimeBounds::default());
        // The local claim differs from the one the contract disputes.
        let mut session = setup(&sim, &disputes, &honest, &faulty, Party::Asserter).await;

        let stubs = faulty.bisect(StepRange::new(0, 4), 2).unwrap();
        let err = session.submit_bisection(stubs).await.unwrap_err();
        assert!(matches!(err, SessionError::Rejected { action: "BisectAssertion", .. }));
        assert!(session.challenge().pending_segments().is_none());
    }

    #[tokio::test]
    async fn invalid_moves_are_not_submitted() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let mut session = setup(&sim, &disputes, &trace, &trace, Party::Challenger).await;

        let err = session.submit_choose_segment(0).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Protocol(ProtocolError::OutOfTurn { .. })
        ));
    }

    #[tokio::test]
    async fn a_side_is_played_once() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let session = setup(&sim, &disputes, &trace, &trace, Party::Challenger).await;

        let challenge = session.challenge().clone();
        let again = ChallengeSession::open(
            &disputes,
            CONTRACT,
            Party::Challenger,
            Arc::new(sim.clone()),
            challenge,
            session.head(),
        );
        assert!(matches!(again, Err(SessionError::AlreadyActive { .. })));

        drop(session);
        assert!(disputes.is_empty());
    }

    #[tokio::test]
    async fn notifications_drive_timeouts_and_cursor() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let mut session = setup(&sim, &disputes, &trace, &trace, Party::Challenger).await;
        let mut outcome = session.subscribe_outcome();
        assert_eq!(session.now(), TimeTicks(1));

        // An event that contradicts the state is reported but not applied.
        let stray = Notification::Event(ObservedEvent {
            block: block(1),
            log_index: 4,
            event: ChallengeEvent::OneStepProofCompleted { valid: true },
        });
        assert!(session.handle(&stray).is_err());
        assert_eq!(session.resume_from(), (1, 5));

        for height in 1..=3 {
            assert_eq!(session.handle(&Notification::Block(block(height))), Ok(None));
        }
        assert_eq!(session.resume_from(), (4, 0));
        assert!(outcome.borrow_and_update().is_none());

        let resolved = session.handle(&Notification::Block(block(4))).unwrap();
        let expected = Outcome::new(Party::Challenger, Resolution::Timeout);
        assert_eq!(resolved, Some(expected));
        assert!(outcome.has_changed().unwrap());
        assert_eq!(*outcome.borrow_and_update(), Some(expected));
        assert_eq!(session.head(), block(4));
    }

    #[tokio::test]
    async fn rewind_undoes_orphaned_blocks() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let mut session = setup(&sim, &disputes, &trace, &trace, Party::Challenger).await;
        let mut outcome = session.subscribe_outcome();

        sim.mine_blocks(3).await;
        for height in 1..=2 {
            let block = sim.block_identity_for_height(height).await.unwrap();
            assert!(session.extends_head(&block));
            session.handle(&Notification::Block(block)).unwrap();
        }
        let orphaned = sim.block_identity_for_height(3).await.unwrap();
        let forfeit = Notification::Event(ObservedEvent {
            block: orphaned,
            log_index: 0,
            event: ChallengeEvent::AsserterTimedOut,
        });
        assert!(session.handle(&forfeit).unwrap().is_some());
        session.handle(&Notification::Block(orphaned)).unwrap();
        assert!(outcome.borrow_and_update().is_some());

        sim.reorg(1).await;
        let replacement = sim.block_identity_for_height(3).await.unwrap();
        assert!(!session.extends_head(&replacement));

        assert_eq!(session.rewind().await.unwrap(), (3, 0));
        assert_eq!(session.head(), sim.block_identity_for_height(2).await.unwrap());
        assert!(session.extends_head(&replacement));
        assert!(session.outcome().is_none());
        assert!(outcome.has_changed().unwrap());
        assert!(outcome.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn rewind_is_bounded() {
        let sim = SimBackend::new();
        let disputes = ActiveDisputes::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        let mut session = setup(&sim, &disputes, &trace, &trace, Party::Challenger)
            .await
            .with_rewind_depth(1);

        sim.mine_blocks(2).await;
        for height in 1..=2 {
            let block = sim.block_identity_for_height(height).await.unwrap();
            session.handle(&Notification::Block(block)).unwrap();
        }

        // Both remembered blocks are replaced.
        sim.reorg(2).await;
        assert!(matches!(
            session.rewind().await,
            Err(SessionError::RewindExhausted { .. })
        ));
    }
}
