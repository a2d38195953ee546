use ethers::types::Address;
use rollup_challenger_driver::{
    backend::SimBackend,
    watcher::{EventWatcher, ExecutionDecoder},
    ActiveDisputes, BlockIdentity, ChallengeSession, DisputeDriver, Driver, DriverConfig,
    TrackerConfig,
};
use rollup_challenger_protocol::bisection::{
    AlphabetSolver, AlphabetTrace, AlphabetVerifier, BisectionChallenge, ChallengeConfig,
    Outcome, Party, Resolution, SegmentClaim, StepRange, TimeBounds,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch};

const CONTRACT: Address = Address::repeat_byte(0xc0);
const BLOCK_TIME: Duration = Duration::from_millis(50);
const TOTAL_STEPS: u64 = 8;
const FAULT_STEP: u64 = 5;

fn config() -> Arc<DriverConfig> {
    Arc::new(DriverConfig {
        tracker: TrackerConfig {
            retry_delay: Duration::from_millis(10),
            ..Default::default()
        },
        challenge: ChallengeConfig {
            fan_out: 2,
            timeout_window: 10,
        },
        ..Default::default()
    })
}

fn honest() -> AlphabetTrace {
    AlphabetTrace::honest(b'a', TOTAL_STEPS, TimeBounds::default())
}

fn faulty() -> AlphabetTrace {
    AlphabetTrace::faulty(b'a', TOTAL_STEPS, FAULT_STEP, TimeBounds::default())
}

/// A simulated ledger hosting one challenge, with a task mining blocks in the background.
struct Dispute {
    sim: SimBackend,
    config: Arc<DriverConfig>,
    disputes: ActiveDisputes,
    claim: SegmentClaim,
    opened_at: BlockIdentity,
    shutdown: broadcast::Sender<()>,
}

impl Dispute {
    /// Opens a challenge of the claim made by the `asserted` trace.
    async fn open(asserted: &AlphabetTrace) -> Self {
        let sim = SimBackend::new();
        sim.mine_block().await;

        let config = config();
        let claim = SegmentClaim {
            precondition: asserted.precondition(0).unwrap(),
            assertion: asserted.assertion(StepRange::new(0, TOTAL_STEPS)).unwrap(),
        };
        let opened_at = sim
            .open_execution_challenge(
                CONTRACT,
                config.challenge,
                claim,
                TOTAL_STEPS,
                Arc::new(AlphabetVerifier),
            )
            .await
            .unwrap();

        let (shutdown, _) = broadcast::channel(1);
        let miner = sim.clone();
        let mut stop = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => return,
                    _ = tokio::time::sleep(BLOCK_TIME) => {
                        miner.mine_block().await;
                    }
                }
            }
        });

        Self {
            sim,
            config,
            disputes: ActiveDisputes::new(),
            claim,
            opened_at,
            shutdown,
        }
    }

    /// Starts a driver playing `role` from `trace`.
    fn join(&self, role: Party, trace: AlphabetTrace) -> watch::Receiver<Option<Outcome>> {
        let challenge = BisectionChallenge::new(
            self.config.challenge,
            TOTAL_STEPS,
            self.opened_at.ticks(),
            Arc::new(AlphabetVerifier),
        )
        .unwrap()
        .with_claim(self.claim);
        let session = ChallengeSession::open(
            &self.disputes,
            CONTRACT,
            role,
            Arc::new(self.sim.clone()),
            challenge,
            self.opened_at,
        )
        .unwrap();
        let outcome = session.subscribe_outcome();

        let watcher = EventWatcher::new(
            CONTRACT,
            ExecutionDecoder::default(),
            Arc::new(self.sim.clone()),
            &self.config,
        );
        let driver = DisputeDriver::new(
            session,
            watcher,
            Arc::new(AlphabetSolver::new(trace)),
            self.shutdown.clone(),
        );
        tokio::spawn(driver.start_loop());
        outcome
    }

    /// Waits for the outcome seen by a driver and checks that the contract agrees.
    async fn resolved(&self, mut outcome: watch::Receiver<Option<Outcome>>) -> Outcome {
        let seen = tokio::time::timeout(Duration::from_secs(60), async move {
            loop {
                if let Some(outcome) = *outcome.borrow_and_update() {
                    return outcome;
                }
                outcome
                    .changed()
                    .await
                    .expect("session closed before the challenge was resolved");
            }
        })
        .await
        .expect("challenge was not resolved in time");

        let onchain = self.sim.challenge_phase(CONTRACT).await.unwrap();
        assert_eq!(onchain.outcome(), Some(seen));
        seen
    }
}

impl Drop for Dispute {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

#[tokio::test(start_paused = true)]
async fn honest_asserter_defends_its_claim() {
    let dispute = Dispute::open(&honest()).await;
    let asserter = dispute.join(Party::Asserter, honest());
    let challenger = dispute.join(Party::Challenger, faulty());

    let expected = Outcome::new(Party::Asserter, Resolution::OneStepProofValid);
    assert_eq!(dispute.resolved(asserter).await, expected);
    assert_eq!(dispute.resolved(challenger).await, expected);
}

#[tokio::test(start_paused = true)]
async fn honest_challenger_finds_the_faulty_step() {
    let dispute = Dispute::open(&faulty()).await;
    let asserter = dispute.join(Party::Asserter, faulty());
    let challenger = dispute.join(Party::Challenger, honest());

    let expected = Outcome::new(Party::Challenger, Resolution::OneStepProofInvalid);
    assert_eq!(dispute.resolved(challenger).await, expected);
    assert_eq!(dispute.resolved(asserter).await, expected);
}

#[tokio::test(start_paused = true)]
async fn silent_asserter_times_out() {
    let dispute = Dispute::open(&faulty()).await;
    let challenger = dispute.join(Party::Challenger, honest());

    assert_eq!(
        dispute.resolved(challenger).await,
        Outcome::new(Party::Challenger, Resolution::Timeout)
    );
}
