//! The event module holds the decoded events emitted by challenge contracts and the actions
//! participants submit to them.

use super::{Digest, ExecutionAssertionStub, Precondition, TimeTicks};
use ethers::types::Bytes;
use serde::{Deserialize, Serialize};

/// A [ChallengeEvent] is a decoded state report emitted by a challenge contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeEvent {
    /// The asserter split the disputed interval and committed to every segment.
    SegmentsProposed {
        /// One commitment per segment, in step order.
        segment_commitments: Vec<Digest>,
        /// The width of the interval that was split.
        total_steps: u64,
        /// The deadline for the challenger's response.
        deadline: TimeTicks,
    },
    /// The challenger picked the segment to dispute further.
    SegmentChosen {
        /// The index of the chosen segment.
        chosen_index: u64,
        /// The first step of the chosen segment.
        new_lower_step: u64,
        /// The step right after the last step of the chosen segment.
        new_upper_step: u64,
    },
    /// A one step proof was checked on chain.
    OneStepProofCompleted {
        /// Whether or not the proof matched the disputed claim.
        valid: bool,
    },
    /// The asserter missed its deadline.
    AsserterTimedOut,
    /// The challenger missed its deadline.
    ChallengerTimedOut,
    /// The asserter split an execution interval and posted every assertion stub.
    ExecutionBisected {
        /// The machine hash the split interval starts from.
        before_machine_hash: Digest,
        /// One stub per segment, in step order.
        assertions: Vec<ExecutionAssertionStub>,
        /// The width of the interval that was split.
        total_steps: u64,
        /// The deadline for the challenger's response.
        deadline: TimeTicks,
    },
    /// The asserter split an inbox top interval into a chain of boundary hashes.
    InboxTopBisected {
        /// The `segments + 1` boundary hashes.
        chain_hashes: Vec<Digest>,
        /// The width of the interval that was split.
        total_length: u64,
        /// The deadline for the challenger's response.
        deadline: TimeTicks,
    },
    /// The asserter split a messages interval into chains of boundary and segment hashes.
    MessagesBisected {
        /// The `segments + 1` boundary hashes of the inbox.
        chain_hashes: Vec<Digest>,
        /// The `segments + 1` boundary hashes of the messages.
        segment_hashes: Vec<Digest>,
        /// The width of the interval that was split.
        total_length: u64,
        /// The deadline for the challenger's response.
        deadline: TimeTicks,
    },
}

impl ChallengeEvent {
    /// Returns the name of the event, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ChallengeEvent::SegmentsProposed { .. } => "SegmentsProposed",
            ChallengeEvent::SegmentChosen { .. } => "SegmentChosen",
            ChallengeEvent::OneStepProofCompleted { .. } => "OneStepProofCompleted",
            ChallengeEvent::AsserterTimedOut => "AsserterTimedOut",
            ChallengeEvent::ChallengerTimedOut => "ChallengerTimedOut",
            ChallengeEvent::ExecutionBisected { .. } => "ExecutionBisected",
            ChallengeEvent::InboxTopBisected { .. } => "InboxTopBisected",
            ChallengeEvent::MessagesBisected { .. } => "MessagesBisected",
        }
    }
}

/// A [ChallengeAction] is a move that a participant submits to a challenge contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeAction {
    /// Split the disputed execution interval.
    BisectAssertion {
        /// The precondition of the disputed interval.
        precondition: Precondition,
        /// One stub per segment, in step order.
        assertions: Vec<ExecutionAssertionStub>,
        /// The width of the disputed interval.
        total_steps: u64,
    },
    /// Pick a segment of the pending bisection.
    ChooseSegment {
        /// The index of the chosen segment.
        segment_index: u64,
        /// The commitments of the pending bisection.
        segment_commitments: Vec<Digest>,
        /// The width of the interval that was split.
        total_steps: u64,
    },
    /// Prove the single disputed step.
    OneStepProof {
        /// The precondition of the disputed step.
        precondition: Precondition,
        /// The claimed result of the disputed step.
        assertion: ExecutionAssertionStub,
        /// The opaque proof checked by the one step verifier.
        proof: Bytes,
    },
}

impl ChallengeAction {
    /// Returns the name of the action, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ChallengeAction::BisectAssertion { .. } => "BisectAssertion",
            ChallengeAction::ChooseSegment { .. } => "ChooseSegment",
            ChallengeAction::OneStepProof { .. } => "OneStepProof",
        }
    }
}
