//! The challenge module contains the [BisectionChallenge] state machine, which narrows a
//! disputed execution interval down to a single step and adjudicates it.

use super::{
    chain_commitments, partition, ChallengeAction, ChallengeEvent, ChallengeState, Digest,
    ExecutionAssertionStub, OneStepVerifier, Outcome, Party, Resolution, Segment, SegmentClaim,
    StepRange, TimeTicks,
};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use thiserror::Error;

const BISECTING: &str = "Bisecting";
const AWAITING_ONE_STEP_PROOF: &str = "AwaitingOneStepProof";
const RESOLVED: &str = "Resolved";

/// The [ChallengeConfig] holds the parameters every participant of a challenge agrees on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// The number of segments an interval is split into per bisection round.
    pub fan_out: u64,
    /// The number of blocks a participant has to respond before it forfeits.
    pub timeout_window: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            fan_out: 2,
            timeout_window: 20,
        }
    }
}

impl ChallengeConfig {
    /// Checks that the configuration can drive a challenge to completion.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.fan_out < 2 {
            return Err(ProtocolError::InvalidConfig(format!(
                "fan out must be at least 2, got {}",
                self.fan_out
            )));
        }
        if self.timeout_window == 0 {
            return Err(ProtocolError::InvalidConfig(
                "timeout window must be at least one block".to_string(),
            ));
        }
        Ok(())
    }
}

/// The phases of a [BisectionChallenge].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengePhase {
    /// The disputed interval is wider than one step.
    Bisecting(ChallengeState),
    /// The disputed interval is a single step and the asserter must prove it.
    AwaitingOneStepProof(ChallengeState),
    /// The challenge is over.
    Resolved(Outcome),
}

impl ChallengePhase {
    /// Returns the name of the phase.
    pub fn name(&self) -> &'static str {
        match self {
            ChallengePhase::Bisecting(_) => BISECTING,
            ChallengePhase::AwaitingOneStepProof(_) => AWAITING_ONE_STEP_PROOF,
            ChallengePhase::Resolved(_) => RESOLVED,
        }
    }

    /// Returns the [ChallengeState] if the challenge is still open.
    pub fn state(&self) -> Option<&ChallengeState> {
        match self {
            ChallengePhase::Bisecting(state) | ChallengePhase::AwaitingOneStepProof(state) => {
                Some(state)
            }
            ChallengePhase::Resolved(_) => None,
        }
    }

    /// Returns the [Outcome] if the challenge is resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            ChallengePhase::Resolved(outcome) => Some(*outcome),
            _ => None,
        }
    }

    /// Returns true if the challenge is resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ChallengePhase::Resolved(_))
    }
}

/// A [ProtocolError] is raised when an action or an event does not fit the current state of a
/// challenge. It is never applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("challenge already resolved: {0}")]
    AlreadyResolved(Outcome),
    #[error("expected phase {expected}, challenge is {found}")]
    WrongPhase {
        expected: &'static str,
        found: &'static str,
    },
    #[error("{actor} cannot act, it is the {turn}'s turn")]
    OutOfTurn { actor: Party, turn: Party },
    #[error("deadline {deadline} passed at block {now}")]
    DeadlinePassed { deadline: TimeTicks, now: TimeTicks },
    #[error("expected {expected} segments, got {found}")]
    SegmentCountMismatch { expected: usize, found: usize },
    #[error("assertion chain breaks after assertion {index}")]
    BrokenAssertionChain { index: usize },
    #[error("bisection does not combine into the disputed assertion")]
    AssertionMismatch,
    #[error("segment {index} out of range, bisection has {count} segments")]
    SegmentIndexOutOfRange { index: u64, count: usize },
    #[error("no bisection is pending")]
    NoPendingBisection,
    #[error("the claim for the disputed interval is unknown")]
    UnknownClaim,
    #[error("event {event} is inconsistent with the challenge: {reason}")]
    InconsistentEvent { event: &'static str, reason: String },
    #[error("a challenge needs at least one step")]
    ZeroSteps,
    #[error("invalid challenge config: {0}")]
    InvalidConfig(String),
}

/// The [BisectionChallenge] is one participant's copy of the state of a single dispute.
///
/// Local moves go through the `submit_*` methods, which validate the move against the current
/// state, apply it, and return the [ChallengeAction] to send to the challenge contract. Moves
/// observed on the ledger go through [BisectionChallenge::apply_event]; the echo of a move that
/// was already applied locally is a no-op.
#[derive(Clone)]
pub struct BisectionChallenge {
    /// The agreed parameters of the challenge.
    config: ChallengeConfig,
    /// The current phase.
    phase: ChallengePhase,
    /// The claim about the disputed interval, if known.
    claim: Option<SegmentClaim>,
    /// The segments of the bisection awaiting the challenger's choice.
    pending: Option<Vec<Segment>>,
    /// The number of completed bisection rounds.
    rounds: u32,
    /// Adjudicates the final step.
    verifier: Arc<dyn OneStepVerifier>,
}

impl fmt::Debug for BisectionChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BisectionChallenge")
            .field("config", &self.config)
            .field("phase", &self.phase)
            .field("claim", &self.claim)
            .field("pending", &self.pending)
            .field("rounds", &self.rounds)
            .finish_non_exhaustive()
    }
}

impl BisectionChallenge {
    /// Opens a new challenge over `total_steps` steps at block `opened_at`. The asserter moves
    /// first.
    pub fn new(
        config: ChallengeConfig,
        total_steps: u64,
        opened_at: TimeTicks,
        verifier: Arc<dyn OneStepVerifier>,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        if total_steps == 0 {
            return Err(ProtocolError::ZeroSteps);
        }

        let state = ChallengeState {
            lower_step: 0,
            upper_step: total_steps,
            deadline: opened_at.after(config.timeout_window),
            turn: Party::Asserter,
            total_steps,
        };
        let phase = if total_steps > 1 {
            ChallengePhase::Bisecting(state)
        } else {
            ChallengePhase::AwaitingOneStepProof(state)
        };

        Ok(Self {
            config,
            phase,
            claim: None,
            pending: None,
            rounds: 0,
            verifier,
        })
    }

    /// Attaches the asserter's claim about the full interval.
    pub fn with_claim(mut self, claim: SegmentClaim) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Returns the configuration of the challenge.
    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    /// Returns the current phase of the challenge.
    pub fn current_state(&self) -> &ChallengePhase {
        &self.phase
    }

    /// Returns the claim about the disputed interval, if known.
    pub fn claim(&self) -> Option<&SegmentClaim> {
        self.claim.as_ref()
    }

    /// Returns the segments awaiting the challenger's choice.
    pub fn pending_segments(&self) -> Option<&[Segment]> {
        self.pending.as_deref()
    }

    /// Returns the number of completed bisection rounds.
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Returns the outcome if the challenge is resolved.
    pub fn outcome(&self) -> Option<Outcome> {
        self.phase.outcome()
    }

    /// Splits the disputed interval into the segments described by `assertions`.
    ///
    /// ### Takes
    /// - `now`: The block height the move is made at.
    /// - `assertions`: One stub per segment of the partition of the disputed interval.
    ///
    /// ### Returns
    /// - `Ok(ChallengeAction)`: The action to submit. The turn passes to the challenger.
    /// - `Err(ProtocolError)`: The move is not allowed. State is unchanged.
    pub fn submit_bisection(
        &mut self,
        now: TimeTicks,
        assertions: Vec<ExecutionAssertionStub>,
    ) -> Result<ChallengeAction, ProtocolError> {
        let state = self.check_move(BISECTING, Party::Asserter, now)?;
        let claim = self.claim.ok_or(ProtocolError::UnknownClaim)?;
        let segments = self.build_segments(&state, &claim, &assertions)?;

        self.propose(state, segments, now.after(self.config.timeout_window));
        Ok(ChallengeAction::BisectAssertion {
            precondition: claim.precondition,
            assertions,
            total_steps: state.width(),
        })
    }

    /// Picks the segment of the pending bisection to dispute further.
    ///
    /// ### Takes
    /// - `now`: The block height the move is made at.
    /// - `index`: The index of the disputed segment.
    ///
    /// ### Returns
    /// - `Ok(ChallengeAction)`: The action to submit. The turn passes to the asserter.
    /// - `Err(ProtocolError)`: The move is not allowed. State is unchanged.
    pub fn submit_choose_segment(
        &mut self,
        now: TimeTicks,
        index: usize,
    ) -> Result<ChallengeAction, ProtocolError> {
        let state = self.check_move(BISECTING, Party::Challenger, now)?;
        let segments = self
            .pending
            .as_ref()
            .ok_or(ProtocolError::NoPendingBisection)?;
        if index >= segments.len() {
            return Err(ProtocolError::SegmentIndexOutOfRange {
                index: index as u64,
                count: segments.len(),
            });
        }
        let segment_commitments = segments.iter().map(|s| s.commitment).collect();

        self.choose(state, index, now.after(self.config.timeout_window));
        Ok(ChallengeAction::ChooseSegment {
            segment_index: index as u64,
            segment_commitments,
            total_steps: state.width(),
        })
    }

    /// Proves the single disputed step. The challenge resolves immediately according to the
    /// verifier's verdict.
    ///
    /// ### Takes
    /// - `now`: The block height the move is made at.
    /// - `proof`: The opaque proof passed to the [OneStepVerifier].
    ///
    /// ### Returns
    /// - `Ok(ChallengeAction)`: The action to submit.
    /// - `Err(ProtocolError)`: The move is not allowed. State is unchanged.
    pub fn submit_one_step_proof(
        &mut self,
        now: TimeTicks,
        proof: Bytes,
    ) -> Result<ChallengeAction, ProtocolError> {
        self.check_move(AWAITING_ONE_STEP_PROOF, Party::Asserter, now)?;
        let claim = self.claim.ok_or(ProtocolError::UnknownClaim)?;

        let valid = self
            .verifier
            .verify(&claim.precondition, &claim.assertion, &proof);
        self.resolve(proof_outcome(valid));

        Ok(ChallengeAction::OneStepProof {
            precondition: claim.precondition,
            assertion: claim.assertion,
            proof,
        })
    }

    /// Evaluates the deadline at a new block. If the block lies past the deadline, the turn
    /// holder forfeits.
    pub fn on_block(&mut self, now: TimeTicks) -> Option<Outcome> {
        let state = *self.phase.state()?;
        if !state.deadline.is_passed_at(now) {
            return None;
        }

        tracing::debug!(target: "bisection-challenge", "Deadline {} passed at block {}, {} forfeits", state.deadline, now, state.turn);
        let outcome = Outcome::new(state.turn.opponent(), Resolution::Timeout);
        self.resolve(outcome);
        Some(outcome)
    }

    /// Applies an event observed on the ledger at block `observed_at`.
    ///
    /// ### Returns
    /// - `Ok(Some(Outcome))`: The event resolved the challenge.
    /// - `Ok(None)`: The event was applied, or was already reflected in the state.
    /// - `Err(ProtocolError)`: The event contradicts the state. State is unchanged.
    pub fn apply_event(
        &mut self,
        event: &ChallengeEvent,
        observed_at: TimeTicks,
    ) -> Result<Option<Outcome>, ProtocolError> {
        match event {
            ChallengeEvent::SegmentsProposed {
                segment_commitments,
                total_steps,
                deadline,
            } => self.apply_commitments(event.name(), segment_commitments, *total_steps, *deadline),
            ChallengeEvent::ExecutionBisected {
                before_machine_hash,
                assertions,
                total_steps,
                deadline,
            } => {
                let state = self.active()?;
                let claim = self.claim.ok_or(ProtocolError::UnknownClaim)?;
                if claim.precondition.before_machine_hash != *before_machine_hash {
                    return Err(ProtocolError::InconsistentEvent {
                        event: event.name(),
                        reason: format!(
                            "bisection starts from machine {:?}, disputed interval starts from {:?}",
                            before_machine_hash, claim.precondition.before_machine_hash
                        ),
                    });
                }
                let segments = self.build_segments(&state, &claim, assertions)?;
                self.apply_proposal(event.name(), segments, *total_steps, *deadline)
            }
            ChallengeEvent::InboxTopBisected {
                chain_hashes,
                total_length,
                deadline,
            } => self.apply_commitments(
                event.name(),
                &chain_commitments(chain_hashes, &[]),
                *total_length,
                *deadline,
            ),
            ChallengeEvent::MessagesBisected {
                chain_hashes,
                segment_hashes,
                total_length,
                deadline,
            } => self.apply_commitments(
                event.name(),
                &chain_commitments(chain_hashes, segment_hashes),
                *total_length,
                *deadline,
            ),
            ChallengeEvent::SegmentChosen {
                chosen_index,
                new_lower_step,
                new_upper_step,
            } => self.apply_choice(
                *chosen_index,
                StepRange::new(*new_lower_step, *new_upper_step),
                observed_at,
            ),
            ChallengeEvent::OneStepProofCompleted { valid } => {
                let outcome = proof_outcome(*valid);
                match self.phase {
                    ChallengePhase::Resolved(existing) if existing == outcome => Ok(None),
                    ChallengePhase::Resolved(existing) => {
                        Err(ProtocolError::AlreadyResolved(existing))
                    }
                    ChallengePhase::AwaitingOneStepProof(_) => {
                        self.resolve(outcome);
                        Ok(Some(outcome))
                    }
                    ChallengePhase::Bisecting(_) => Err(ProtocolError::WrongPhase {
                        expected: AWAITING_ONE_STEP_PROOF,
                        found: BISECTING,
                    }),
                }
            }
            ChallengeEvent::AsserterTimedOut => self.apply_timeout(event.name(), Party::Asserter),
            ChallengeEvent::ChallengerTimedOut => {
                self.apply_timeout(event.name(), Party::Challenger)
            }
        }
    }

    /// Returns the state of an open challenge.
    fn active(&self) -> Result<ChallengeState, ProtocolError> {
        match self.phase {
            ChallengePhase::Resolved(outcome) => Err(ProtocolError::AlreadyResolved(outcome)),
            ChallengePhase::Bisecting(state) | ChallengePhase::AwaitingOneStepProof(state) => {
                Ok(state)
            }
        }
    }

    /// Checks that `actor` may make a move that requires the `expected` phase at block `now`.
    fn check_move(
        &self,
        expected: &'static str,
        actor: Party,
        now: TimeTicks,
    ) -> Result<ChallengeState, ProtocolError> {
        let state = self.active()?;
        if self.phase.name() != expected {
            return Err(ProtocolError::WrongPhase {
                expected,
                found: self.phase.name(),
            });
        }
        if state.turn != actor {
            return Err(ProtocolError::OutOfTurn {
                actor,
                turn: state.turn,
            });
        }
        if state.deadline.is_passed_at(now) {
            return Err(ProtocolError::DeadlinePassed {
                deadline: state.deadline,
                now,
            });
        }
        Ok(state)
    }

    /// Builds the segments of a bisection of the disputed interval of `state`.
    fn build_segments(
        &self,
        state: &ChallengeState,
        claim: &SegmentClaim,
        assertions: &[ExecutionAssertionStub],
    ) -> Result<Vec<Segment>, ProtocolError> {
        if let Some(index) = assertions
            .windows(2)
            .position(|pair| !pair[0].is_continued_by(&pair[1]))
        {
            return Err(ProtocolError::BrokenAssertionChain { index });
        }

        let ranges = partition(state.range(), self.config.fan_out);
        if ranges.len() != assertions.len() {
            return Err(ProtocolError::SegmentCountMismatch {
                expected: ranges.len(),
                found: assertions.len(),
            });
        }
        if ExecutionAssertionStub::combine(assertions) != Some(claim.assertion) {
            return Err(ProtocolError::AssertionMismatch);
        }

        let mut precondition = claim.precondition;
        Ok(ranges
            .into_iter()
            .zip(assertions)
            .map(|(range, assertion)| {
                let segment_claim = SegmentClaim {
                    precondition,
                    assertion: *assertion,
                };
                precondition = precondition.advance(assertion);
                Segment {
                    range,
                    commitment: segment_claim.commitment(),
                    claim: Some(segment_claim),
                }
            })
            .collect())
    }

    /// Applies a bisection that is only known by its segment commitments.
    fn apply_commitments(
        &mut self,
        event: &'static str,
        commitments: &[Digest],
        total_steps: u64,
        deadline: TimeTicks,
    ) -> Result<Option<Outcome>, ProtocolError> {
        let state = self.active()?;
        let ranges = partition(state.range(), self.config.fan_out);
        if ranges.len() != commitments.len() {
            return Err(ProtocolError::SegmentCountMismatch {
                expected: ranges.len(),
                found: commitments.len(),
            });
        }

        let segments = ranges
            .into_iter()
            .zip(commitments)
            .map(|(range, commitment)| Segment {
                range,
                commitment: *commitment,
                claim: None,
            })
            .collect();
        self.apply_proposal(event, segments, total_steps, deadline)
    }

    /// Applies an observed bisection, or re-synchronises the deadline if the bisection is the
    /// one already pending.
    fn apply_proposal(
        &mut self,
        event: &'static str,
        segments: Vec<Segment>,
        total_steps: u64,
        deadline: TimeTicks,
    ) -> Result<Option<Outcome>, ProtocolError> {
        let state = self.active()?;
        if !matches!(self.phase, ChallengePhase::Bisecting(_)) {
            return Err(ProtocolError::WrongPhase {
                expected: BISECTING,
                found: self.phase.name(),
            });
        }
        if state.width() != total_steps {
            return Err(ProtocolError::InconsistentEvent {
                event,
                reason: format!(
                    "bisection covers {} steps, disputed interval has {}",
                    total_steps,
                    state.width()
                ),
            });
        }

        if state.turn == Party::Challenger {
            let already_pending = self.pending.as_ref().is_some_and(|pending| {
                pending.len() == segments.len()
                    && pending
                        .iter()
                        .zip(&segments)
                        .all(|(a, b)| a.commitment == b.commitment)
            });
            if !already_pending {
                return Err(ProtocolError::InconsistentEvent {
                    event,
                    reason: "a different bisection is already pending".to_string(),
                });
            }
            self.set_deadline(deadline);
            return Ok(None);
        }

        self.propose(state, segments, deadline);
        Ok(None)
    }

    /// Applies an observed segment choice, or re-synchronises the deadline if the choice was
    /// already applied.
    fn apply_choice(
        &mut self,
        chosen_index: u64,
        range: StepRange,
        observed_at: TimeTicks,
    ) -> Result<Option<Outcome>, ProtocolError> {
        let state = self.active()?;
        let deadline = observed_at.after(self.config.timeout_window);

        // Only a choice already made can be echoed; the opening interval was never chosen.
        if self.rounds > 0
            && state.turn == Party::Asserter
            && self.pending.is_none()
            && state.range() == range
        {
            self.set_deadline(deadline);
            return Ok(None);
        }
        if !matches!(self.phase, ChallengePhase::Bisecting(_)) {
            return Err(ProtocolError::WrongPhase {
                expected: BISECTING,
                found: self.phase.name(),
            });
        }

        let segments = self
            .pending
            .as_ref()
            .ok_or(ProtocolError::NoPendingBisection)?;
        let index = usize::try_from(chosen_index).unwrap_or(usize::MAX);
        let segment = segments
            .get(index)
            .ok_or(ProtocolError::SegmentIndexOutOfRange {
                index: chosen_index,
                count: segments.len(),
            })?;
        if segment.range != range {
            return Err(ProtocolError::InconsistentEvent {
                event: "SegmentChosen",
                reason: format!(
                    "segment {} covers [{}, {}), event reports [{}, {})",
                    chosen_index, segment.range.lower, segment.range.upper, range.lower, range.upper
                ),
            });
        }

        self.choose(state, index, deadline);
        Ok(None)
    }

    /// Applies an observed forfeit of `loser`.
    fn apply_timeout(
        &mut self,
        event: &'static str,
        loser: Party,
    ) -> Result<Option<Outcome>, ProtocolError> {
        let outcome = Outcome::new(loser.opponent(), Resolution::Timeout);
        if self.phase.outcome() == Some(outcome) {
            return Ok(None);
        }

        let state = self.active()?;
        if state.turn != loser {
            return Err(ProtocolError::InconsistentEvent {
                event,
                reason: format!("the {} holds the turn", state.turn),
            });
        }
        self.resolve(outcome);
        Ok(Some(outcome))
    }

    /// Records a bisection and passes the turn to the challenger.
    fn propose(&mut self, state: ChallengeState, segments: Vec<Segment>, deadline: TimeTicks) {
        tracing::debug!(target: "bisection-challenge", "Bisected [{}, {}) into {} segments", state.lower_step, state.upper_step, segments.len());
        self.pending = Some(segments);
        self.phase = ChallengePhase::Bisecting(ChallengeState {
            turn: Party::Challenger,
            deadline,
            ..state
        });
    }

    /// Narrows the disputed interval to the pending segment at `index` and passes the turn to
    /// the asserter.
    fn choose(&mut self, state: ChallengeState, index: usize, deadline: TimeTicks) {
        let Some(segment) = self
            .pending
            .take()
            .and_then(|segments| segments.into_iter().nth(index))
        else {
            return;
        };

        self.claim = segment.claim;
        self.rounds += 1;
        let next = ChallengeState {
            lower_step: segment.range.lower,
            upper_step: segment.range.upper,
            deadline,
            turn: Party::Asserter,
            total_steps: state.total_steps,
        };
        tracing::debug!(target: "bisection-challenge", "Round {}: disputed interval narrowed to [{}, {})", self.rounds, next.lower_step, next.upper_step);

        self.phase = if next.width() > 1 {
            ChallengePhase::Bisecting(next)
        } else {
            ChallengePhase::AwaitingOneStepProof(next)
        };
    }

    /// Moves the deadline of an open challenge.
    fn set_deadline(&mut self, deadline: TimeTicks) {
        match &mut self.phase {
            ChallengePhase::Bisecting(state) | ChallengePhase::AwaitingOneStepProof(state) => {
                state.deadline = deadline;
            }
            ChallengePhase::Resolved(_) => {}
        }
    }

    /// Ends the challenge.
    fn resolve(&mut self, outcome: Outcome) {
        tracing::info!(target: "bisection-challenge", "Challenge resolved: {}", outcome);
        self.pending = None;
        self.phase = ChallengePhase::Resolved(outcome);
    }
}

/// Maps the verdict of a one step proof to the outcome of the challenge.
fn proof_outcome(valid: bool) -> Outcome {
    if valid {
        Outcome::new(Party::Asserter, Resolution::OneStepProofValid)
    } else {
        Outcome::new(Party::Challenger, Resolution::OneStepProofInvalid)
    }
}
