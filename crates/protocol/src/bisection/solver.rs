//! The solver module holds the [Solver] trait and its implementation for the alphabet machine.

use super::{
    AlphabetTrace, BisectionChallenge, ChallengePhase, ExecutionAssertionStub, Party,
    SegmentClaim,
};
use anyhow::{anyhow, Result};
use ethers::types::Bytes;

/// A [Response] is the move a participant makes given the current state of a challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Do nothing.
    DoNothing,
    /// Split the disputed interval into the given assertion stubs.
    Bisect(Vec<ExecutionAssertionStub>),
    /// Dispute the pending segment at the given index.
    ChooseSegment(usize),
    /// Prove the single disputed step.
    OneStepProof(Bytes),
}

/// The [Solver] trait decides a participant's next move in a [BisectionChallenge].
pub trait Solver: Send + Sync {
    /// Respond to the current state of a challenge.
    ///
    /// ### Takes
    /// - `challenge`: The local copy of the challenge.
    /// - `role`: The side the participant plays.
    ///
    /// ### Returns
    /// - `Ok(Response)`: The move to make, or [Response::DoNothing] if it is not our turn.
    /// - `Err(anyhow::Error)`: An error occurred while computing the move.
    fn respond(&self, challenge: &BisectionChallenge, role: Party) -> Result<Response>;
}

/// The [AlphabetSolver] plays a challenge over the alphabet machine from its own trace.
#[derive(Debug, Clone)]
pub struct AlphabetSolver {
    /// Our full execution trace.
    pub trace: AlphabetTrace,
}

impl AlphabetSolver {
    /// Creates a new [AlphabetSolver].
    pub fn new(trace: AlphabetTrace) -> Self {
        Self { trace }
    }
}

impl Solver for AlphabetSolver {
    fn respond(&self, challenge: &BisectionChallenge, role: Party) -> Result<Response> {
        match (challenge.current_state(), role) {
            (ChallengePhase::Bisecting(state), Party::Asserter) if state.turn == role => Ok(
                Response::Bisect(self.trace.bisect(state.range(), challenge.config().fan_out)?),
            ),
            (ChallengePhase::Bisecting(state), Party::Challenger) if state.turn == role => {
                let segments = challenge
                    .pending_segments()
                    .ok_or(anyhow!("No pending bisection to respond to"))?;

                for (index, segment) in segments.iter().enumerate() {
                    let ours = SegmentClaim {
                        precondition: self.trace.precondition(segment.range.lower)?,
                        assertion: self.trace.assertion(segment.range)?,
                    };
                    if ours.commitment() != segment.commitment {
                        return Ok(Response::ChooseSegment(index));
                    }
                }

                // Every segment agrees with our trace.
                Ok(Response::DoNothing)
            }
            (ChallengePhase::AwaitingOneStepProof(state), Party::Asserter) => Ok(
                Response::OneStepProof(self.trace.one_step_proof(state.lower_step)?),
            ),
            _ => Ok(Response::DoNothing),
        }
    }
}
