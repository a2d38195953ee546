//! The sim module contains the [SimBackend], a deterministic in-memory ledger that hosts
//! simulated challenge contracts.

use super::Backend;
use crate::{
    abi,
    types::{BlockIdentity, LogEntry, TxHash},
};
use anyhow::{anyhow, bail, ensure, Result};
use async_trait::async_trait;
use ethers::{
    abi::Token,
    types::{Address, Bytes, H256, U256},
    utils::keccak256,
};
use rollup_challenger_protocol::bisection::{
    BisectionChallenge, ChallengeAction, ChallengeConfig, ChallengeEvent, ChallengePhase,
    OneStepVerifier, Party, SegmentClaim, TimeTicks,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;

/// A log that will be included in the next mined block.
struct PendingLog {
    address: Address,
    topics: Vec<H256>,
    data: Bytes,
}

/// A simulated execution challenge contract. It runs the same [BisectionChallenge] state machine
/// as the participants and reports every transition as a log.
struct SimChallengeContract {
    challenge: BisectionChallenge,
}

impl SimChallengeContract {
    /// Executes `action` at block `now`, returning the log that reports it.
    fn execute(&mut self, now: TimeTicks, action: &ChallengeAction) -> Result<(H256, Bytes)> {
        match action {
            ChallengeAction::BisectAssertion {
                precondition,
                assertions,
                total_steps,
            } => {
                ensure!(
                    self.challenge.claim().map(|c| c.precondition) == Some(*precondition),
                    "Bisection does not start from the disputed precondition"
                );
                self.challenge.submit_bisection(now, assertions.clone())?;
                let deadline = self.deadline()?;
                Ok(abi::encode_bisected_assertion(
                    precondition.before_machine_hash,
                    assertions,
                    *total_steps,
                    deadline,
                ))
            }
            ChallengeAction::ChooseSegment {
                segment_index,
                segment_commitments,
                ..
            } => {
                let pending = self
                    .challenge
                    .pending_segments()
                    .ok_or(anyhow!("No bisection to choose from"))?;
                ensure!(
                    pending.iter().map(|s| s.commitment).eq(segment_commitments.iter().copied()),
                    "Segment commitments do not match the pending bisection"
                );
                let index = usize::try_from(*segment_index)?;
                self.challenge.submit_choose_segment(now, index)?;
                let state = self
                    .challenge
                    .current_state()
                    .state()
                    .copied()
                    .ok_or(anyhow!("Challenge resolved while choosing a segment"))?;
                Ok(abi::encode_event(&ChallengeEvent::SegmentChosen {
                    chosen_index: *segment_index,
                    new_lower_step: state.lower_step,
                    new_upper_step: state.upper_step,
                }))
            }
            ChallengeAction::OneStepProof {
                precondition,
                assertion,
                proof,
            } => {
                let claim = self
                    .challenge
                    .claim()
                    .copied()
                    .ok_or(anyhow!("The disputed step is unknown"))?;
                ensure!(
                    claim.precondition == *precondition && claim.assertion == *assertion,
                    "Proof does not target the disputed step"
                );
                self.challenge.submit_one_step_proof(now, proof.clone())?;
                let outcome = self
                    .challenge
                    .outcome()
                    .ok_or(anyhow!("One step proof did not resolve the challenge"))?;
                Ok(abi::encode_event(&ChallengeEvent::OneStepProofCompleted {
                    valid: outcome.asserter_wins(),
                }))
            }
        }
    }

    fn deadline(&self) -> Result<TimeTicks> {
        self.challenge
            .current_state()
            .state()
            .map(|s| s.deadline)
            .ok_or(anyhow!("Challenge is resolved"))
    }
}

/// The [SimLedger] holds the state of the simulated chain.
struct SimLedger {
    /// The canonical chain, indexed by height.
    blocks: Vec<BlockIdentity>,
    /// Every log of the canonical chain, ordered by height and log index.
    logs: Vec<LogEntry>,
    /// Logs waiting for the next block.
    pending: Vec<PendingLog>,
    /// The challenge contracts, keyed by address.
    contracts: BTreeMap<Address, SimChallengeContract>,
    /// The status of every submitted transaction.
    receipts: HashMap<TxHash, bool>,
    /// Mixed into block hashes so that reorged blocks differ from the ones they replace.
    salt: u64,
    /// The number of submitted transactions.
    nonce: u64,
    /// The number of upcoming header fetches that fail.
    failing_header_fetches: u32,
    /// The number of upcoming submissions that are rejected.
    rejected_submissions: u32,
}

impl SimLedger {
    fn new() -> Self {
        let genesis = BlockIdentity {
            height: 0,
            header_hash: block_hash(0, H256::zero(), 0),
            parent_hash: H256::zero(),
        };

        Self {
            blocks: vec![genesis],
            logs: Vec::new(),
            pending: Vec::new(),
            contracts: BTreeMap::new(),
            receipts: HashMap::new(),
            salt: 0,
            nonce: 0,
            failing_header_fetches: 0,
            rejected_submissions: 0,
        }
    }

    fn tip(&self) -> BlockIdentity {
        // The chain always holds at least the genesis block.
        self.blocks[self.blocks.len() - 1]
    }

    fn mine_block(&mut self) -> BlockIdentity {
        let parent = self.tip();
        let height = parent.height + 1;
        let block = BlockIdentity {
            height,
            header_hash: block_hash(height, parent.header_hash, self.salt),
            parent_hash: parent.header_hash,
        };

        for (address, contract) in self.contracts.iter_mut() {
            if let Some(outcome) = contract.challenge.on_block(TimeTicks(height)) {
                let event = match outcome.winner {
                    Party::Asserter => ChallengeEvent::ChallengerTimedOut,
                    Party::Challenger => ChallengeEvent::AsserterTimedOut,
                };
                tracing::debug!(target: "sim-backend", "Challenge {:?} timed out at block {}", address, height);
                let (topic, data) = abi::encode_event(&event);
                self.pending.push(PendingLog {
                    address: *address,
                    topics: vec![topic],
                    data,
                });
            }
        }

        for (log_index, log) in self.pending.drain(..).enumerate() {
            self.logs.push(LogEntry {
                address: log.address,
                block_hash: block.header_hash,
                block_height: height,
                log_index: log_index as u64,
                topics: log.topics,
                data: log.data,
            });
        }

        tracing::trace!(target: "sim-backend", "Mined block {}", block);
        self.blocks.push(block);
        block
    }

    fn reorg(&mut self, depth: u64) -> BlockIdentity {
        let tip = self.tip().height;
        let depth = depth.min(tip);
        let fork_point = tip - depth;

        self.salt += 1;
        self.blocks.truncate(fork_point as usize + 1);
        self.logs.retain(|log| log.block_height <= fork_point);
        tracing::debug!(target: "sim-backend", "Reorged {} blocks above block {}", depth, fork_point);

        for _ in 0..=depth {
            self.mine_block();
        }
        self.tip()
    }

    fn submit(&mut self, address: Address, action: &ChallengeAction) -> Result<TxHash> {
        if self.rejected_submissions > 0 {
            self.rejected_submissions -= 1;
            bail!("Simulated rejection of {}", action.name());
        }

        self.nonce += 1;
        let tx = H256::from(keccak256(ethers::abi::encode(&[
            Token::Address(address),
            Token::Uint(U256::from(self.nonce)),
        ])));
        let now = TimeTicks(self.tip().height + 1);

        let result = self
            .contracts
            .get_mut(&address)
            .ok_or(anyhow!("No challenge contract at {:?}", address))
            .and_then(|contract| contract.execute(now, action));
        let success = match result {
            Ok((topic, data)) => {
                self.pending.push(PendingLog {
                    address,
                    topics: vec![topic],
                    data,
                });
                true
            }
            Err(e) => {
                tracing::debug!(target: "sim-backend", "{} reverted: {}", action.name(), e);
                false
            }
        };

        self.receipts.insert(tx, success);
        Ok(tx)
    }
}

fn block_hash(height: u64, parent_hash: H256, salt: u64) -> H256 {
    H256::from(keccak256(ethers::abi::encode(&[
        Token::Uint(U256::from(height)),
        Token::FixedBytes(parent_hash.as_bytes().to_vec()),
        Token::Uint(U256::from(salt)),
    ])))
}

/// The [SimBackend] is a [Backend] over a deterministic in-memory ledger. Blocks are only
/// produced by [SimBackend::mine_block]; actions submitted while block `n` is the tip are
/// executed at block `n + 1` and their logs are included in it.
///
/// Reorgs replace blocks and drop their logs but do not revert contract state.
#[derive(Clone)]
pub struct SimBackend {
    ledger: Arc<Mutex<SimLedger>>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Creates a new ledger holding only the genesis block.
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Mutex::new(SimLedger::new())),
        }
    }

    /// Mines a block, including every pending log and every timeout it triggers.
    pub async fn mine_block(&self) -> BlockIdentity {
        self.ledger.lock().await.mine_block()
    }

    /// Mines `count` blocks and returns the new tip.
    pub async fn mine_blocks(&self, count: u64) -> BlockIdentity {
        let mut ledger = self.ledger.lock().await;
        for _ in 0..count {
            ledger.mine_block();
        }
        ledger.tip()
    }

    /// Replaces the top `depth` blocks with `depth + 1` new ones and returns the new tip.
    pub async fn reorg(&self, depth: u64) -> BlockIdentity {
        self.ledger.lock().await.reorg(depth)
    }

    /// Makes the next `count` header fetches fail.
    pub async fn fail_header_fetches(&self, count: u32) {
        self.ledger.lock().await.failing_header_fetches = count;
    }

    /// Makes the next submission fail before it reaches any contract.
    pub async fn reject_next_submission(&self) {
        self.ledger.lock().await.rejected_submissions += 1;
    }

    /// Queues an arbitrary log for the next block.
    pub async fn push_raw_log(&self, address: Address, topics: Vec<H256>, data: Bytes) {
        self.ledger.lock().await.pending.push(PendingLog {
            address,
            topics,
            data,
        });
    }

    /// Deploys an execution challenge contract at `address`, opened at the current tip.
    ///
    /// ### Returns
    /// - `Ok(BlockIdentity)`: The block the challenge was opened at.
    /// - `Err(anyhow::Error)`: A contract already lives at `address`, or the challenge
    ///   parameters are invalid.
    pub async fn open_execution_challenge(
        &self,
        address: Address,
        config: ChallengeConfig,
        claim: SegmentClaim,
        total_steps: u64,
        verifier: Arc<dyn OneStepVerifier>,
    ) -> Result<BlockIdentity> {
        let mut ledger = self.ledger.lock().await;
        ensure!(
            !ledger.contracts.contains_key(&address),
            "A challenge already lives at {:?}",
            address
        );

        let opened_at = ledger.tip();
        let challenge = BisectionChallenge::new(config, total_steps, opened_at.ticks(), verifier)?
            .with_claim(claim);
        ledger
            .contracts
            .insert(address, SimChallengeContract { challenge });
        tracing::info!(target: "sim-backend", "Opened execution challenge {:?} over {} steps at block {}", address, total_steps, opened_at.height);
        Ok(opened_at)
    }

    /// Returns the phase of the challenge contract at `address`.
    pub async fn challenge_phase(&self, address: Address) -> Option<ChallengePhase> {
        self.ledger
            .lock()
            .await
            .contracts
            .get(&address)
            .map(|contract| *contract.challenge.current_state())
    }
}

#[async_trait]
impl Backend for SimBackend {
    async fn fetch_header(&self, height: u64) -> Result<Option<BlockIdentity>> {
        let mut ledger = self.ledger.lock().await;
        if ledger.failing_header_fetches > 0 {
            ledger.failing_header_fetches -= 1;
            bail!("Simulated failure fetching block {}", height);
        }
        Ok(usize::try_from(height)
            .ok()
            .and_then(|h| ledger.blocks.get(h))
            .copied())
    }

    async fn latest_header(&self) -> Result<BlockIdentity> {
        Ok(self.ledger.lock().await.tip())
    }

    async fn fetch_logs(
        &self,
        address: Address,
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>> {
        let ledger = self.ledger.lock().await;
        Ok(ledger
            .logs
            .iter()
            .filter(|log| log.address == address)
            .filter(|log| (from..=to).contains(&log.block_height))
            .filter(|log| {
                topics.is_empty()
                    || log
                        .topics
                        .first()
                        .map_or(false, |topic| topics.contains(topic))
            })
            .cloned()
            .collect())
    }

    async fn submit_action(&self, address: Address, action: &ChallengeAction) -> Result<TxHash> {
        self.ledger.lock().await.submit(address, action)
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<bool> {
        self.ledger
            .lock()
            .await
            .receipts
            .get(&tx)
            .copied()
            .ok_or(anyhow!("Unknown transaction {:?}", tx))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rollup_challenger_protocol::bisection::{
        AlphabetTrace, AlphabetVerifier, StepRange, TimeBounds,
    };

    const CONTRACT: Address = Address::repeat_byte(0x11);

    async fn open(sim: &SimBackend, trace: &AlphabetTrace) -> BlockIdentity {
        let claim = SegmentClaim {
            precondition: trace.precondition(0).unwrap(),
            assertion: trace
                .assertion(StepRange::new(0, trace.total_steps()))
                .unwrap(),
        };
        let config = ChallengeConfig {
            fan_out: 2,
            timeout_window: 3,
        };
        sim.open_execution_challenge(
            CONTRACT,
            config,
            claim,
            trace.total_steps(),
            Arc::new(AlphabetVerifier),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn chain_links_blocks() {
        let sim = SimBackend::new();
        let tip = sim.mine_blocks(3).await;
        assert_eq!(tip.height, 3);

        for height in 1..=3 {
            let parent = sim.block_identity_for_height(height - 1).await.unwrap();
            let block = sim.block_identity_for_height(height).await.unwrap();
            assert!(parent.is_parent_of(&block));
        }
        assert_eq!(sim.fetch_header(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reorg_replaces_blocks_and_logs() {
        let sim = SimBackend::new();
        sim.mine_block().await;
        sim.push_raw_log(CONTRACT, vec![H256::repeat_byte(1)], Bytes::new())
            .await;
        let old = sim.mine_block().await;
        assert_eq!(sim.fetch_logs(CONTRACT, &[], 0, 2).await.unwrap().len(), 1);

        let tip = sim.reorg(1).await;
        assert_eq!(tip.height, 3);
        let new = sim.block_identity_for_height(2).await.unwrap();
        assert_ne!(new.header_hash, old.header_hash);
        assert!(sim.fetch_logs(CONTRACT, &[], 0, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_actions_are_logged_in_the_next_block() {
        let sim = SimBackend::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        open(&sim, &trace).await;

        let action = ChallengeAction::BisectAssertion {
            precondition: trace.precondition(0).unwrap(),
            assertions: trace.bisect(StepRange::new(0, 4), 2).unwrap(),
            total_steps: 4,
        };
        let (_, success) = sim.submit_and_wait(CONTRACT, &action).await.unwrap();
        assert!(success);
        assert!(sim.fetch_logs(CONTRACT, &[], 0, 0).await.unwrap().is_empty());

        let block = sim.mine_block().await;
        let logs = sim.fetch_logs(CONTRACT, &[], 1, 1).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].block_hash, block.header_hash);
        assert_eq!(logs[0].topics[0], abi::event_topic(abi::BISECTED_ASSERTION));

        // Replaying the same bisection is out of turn and reverts.
        let (_, success) = sim.submit_and_wait(CONTRACT, &action).await.unwrap();
        assert!(!success);
    }

    #[tokio::test]
    async fn missed_deadline_emits_timeout() {
        let sim = SimBackend::new();
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds::default());
        open(&sim, &trace).await;

        sim.mine_blocks(3).await;
        assert!(!sim.challenge_phase(CONTRACT).await.unwrap().is_resolved());

        sim.mine_block().await;
        let logs = sim.fetch_logs(CONTRACT, &[], 4, 4).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].topics[0], abi::event_topic(abi::ASSERTER_TIMED_OUT));
        assert_eq!(
            sim.challenge_phase(CONTRACT).await.unwrap().outcome().map(|o| o.winner),
            Some(Party::Challenger)
        );
    }

    #[tokio::test]
    async fn scripted_failures() {
        let sim = SimBackend::new();
        sim.fail_header_fetches(1).await;
        assert!(sim.fetch_header(0).await.is_err());
        assert!(sim.fetch_header(0).await.unwrap().is_some());

        sim.reject_next_submission().await;
        let action = ChallengeAction::ChooseSegment {
            segment_index: 0,
            segment_commitments: Vec::new(),
            total_steps: 1,
        };
        assert!(sim.submit_action(CONTRACT, &action).await.is_err());
        let tx = sim.submit_action(CONTRACT, &action).await.unwrap();
        assert!(!sim.wait_for_receipt(tx).await.unwrap());
    }
}
