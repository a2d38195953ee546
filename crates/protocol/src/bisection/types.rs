//! The types module contains all of the value types relevant to the bisection challenge.

use ethers::{
    abi::{self, Token},
    types::{H256, U256},
    utils::keccak256,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The [Digest] type is a 32 byte commitment produced by keccak256.
pub type Digest = H256;

/// The hash of an inbox that has been fully consumed.
pub const EMPTY_INBOX_HASH: Digest = H256([0u8; 32]);

/// A deadline measured in base ledger block heights.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimeTicks(pub u64);

impl TimeTicks {
    /// Returns the [TimeTicks] that lies `window` blocks after `self`.
    pub fn after(self, window: u64) -> Self {
        Self(self.0.saturating_add(window))
    }

    /// Returns true if a block at height `now` lies past this deadline.
    pub fn is_passed_at(self, now: TimeTicks) -> bool {
        now > self
    }
}

impl fmt::Display for TimeTicks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The block height window that an assertion is valid for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBounds {
    /// The first block height of the window.
    pub start: u64,
    /// The last block height of the window.
    pub end: u64,
}

/// The [Precondition] is the claimed starting state of an assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Precondition {
    /// The hash of the machine before execution.
    pub before_machine_hash: Digest,
    /// The hash of the inbox before execution.
    pub before_inbox_hash: Digest,
    /// The block height window the assertion is valid for.
    pub time_bounds: TimeBounds,
}

impl Precondition {
    /// Computes the digest that commits to this [Precondition].
    pub fn hash(&self) -> Digest {
        H256::from(keccak256(abi::encode(&[
            Token::FixedBytes(self.before_machine_hash.as_bytes().to_vec()),
            Token::Uint(U256::from(self.time_bounds.start)),
            Token::Uint(U256::from(self.time_bounds.end)),
            Token::FixedBytes(self.before_inbox_hash.as_bytes().to_vec()),
        ])))
    }

    /// Returns the [Precondition] that holds after executing `assertion` from `self`.
    pub fn advance(&self, assertion: &ExecutionAssertionStub) -> Self {
        Self {
            before_machine_hash: assertion.after_machine_hash,
            before_inbox_hash: if assertion.did_inbox_insn {
                EMPTY_INBOX_HASH
            } else {
                self.before_inbox_hash
            },
            time_bounds: self.time_bounds,
        }
    }
}

/// The [ExecutionAssertionStub] commits to the result of executing a number of steps from a
/// [Precondition].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionAssertionStub {
    /// The hash of the machine after execution.
    pub after_machine_hash: Digest,
    /// Whether or not the execution consumed the inbox.
    pub did_inbox_insn: bool,
    /// The amount of gas used by the execution.
    pub num_gas: u64,
    /// The message accumulator before execution.
    pub first_message_hash: Digest,
    /// The message accumulator after execution.
    pub last_message_hash: Digest,
    /// The log accumulator before execution.
    pub first_log_hash: Digest,
    /// The log accumulator after execution.
    pub last_log_hash: Digest,
}

impl ExecutionAssertionStub {
    /// Computes the digest that commits to this [ExecutionAssertionStub].
    pub fn hash(&self) -> Digest {
        H256::from(keccak256(abi::encode(&[
            Token::FixedBytes(self.after_machine_hash.as_bytes().to_vec()),
            Token::Bool(self.did_inbox_insn),
            Token::Uint(U256::from(self.num_gas)),
            Token::FixedBytes(self.first_message_hash.as_bytes().to_vec()),
            Token::FixedBytes(self.last_message_hash.as_bytes().to_vec()),
            Token::FixedBytes(self.first_log_hash.as_bytes().to_vec()),
            Token::FixedBytes(self.last_log_hash.as_bytes().to_vec()),
        ])))
    }

    /// Returns true if `next` continues the message and log accumulators of `self`.
    pub fn is_continued_by(&self, next: &ExecutionAssertionStub) -> bool {
        self.last_message_hash == next.first_message_hash && self.last_log_hash == next.first_log_hash
    }

    /// Combines a chain of stubs into the single stub that covers all of them. Returns [None]
    /// if the chain is empty or broken.
    pub fn combine(stubs: &[ExecutionAssertionStub]) -> Option<Self> {
        let (first, last) = (stubs.first()?, stubs.last()?);
        if stubs.windows(2).any(|pair| !pair[0].is_continued_by(&pair[1])) {
            return None;
        }

        Some(Self {
            after_machine_hash: last.after_machine_hash,
            did_inbox_insn: stubs.iter().any(|s| s.did_inbox_insn),
            num_gas: stubs.iter().fold(0u64, |acc, s| acc.saturating_add(s.num_gas)),
            first_message_hash: first.first_message_hash,
            last_message_hash: last.last_message_hash,
            first_log_hash: first.first_log_hash,
            last_log_hash: last.last_log_hash,
        })
    }
}

/// Computes the commitment to a single bisection segment.
pub fn segment_commitment(
    precondition: &Precondition,
    assertion: &ExecutionAssertionStub,
) -> Digest {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(precondition.hash().as_bytes());
    preimage[32..].copy_from_slice(assertion.hash().as_bytes());
    H256::from(keccak256(preimage))
}

/// Computes the commitments of a bisection that is only known through its chain of boundary
/// hashes. Each commitment binds two adjacent boundaries and, if present, the matching pair of
/// segment hashes.
pub fn chain_commitments(chain_hashes: &[Digest], segment_hashes: &[Digest]) -> Vec<Digest> {
    chain_hashes
        .windows(2)
        .enumerate()
        .map(|(i, pair)| {
            let mut tokens = vec![
                Token::FixedBytes(pair[0].as_bytes().to_vec()),
                Token::FixedBytes(pair[1].as_bytes().to_vec()),
            ];
            if let (Some(lower), Some(upper)) = (segment_hashes.get(i), segment_hashes.get(i + 1))
            {
                tokens.push(Token::FixedBytes(lower.as_bytes().to_vec()));
                tokens.push(Token::FixedBytes(upper.as_bytes().to_vec()));
            }
            H256::from(keccak256(abi::encode(&tokens)))
        })
        .collect()
}

/// The two participants of a bisection challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Party {
    /// Defends the correctness of the asserted computation.
    Asserter,
    /// Disputes the asserted computation.
    Challenger,
}

impl Party {
    /// Returns the other participant.
    pub fn opponent(self) -> Self {
        match self {
            Party::Asserter => Party::Challenger,
            Party::Challenger => Party::Asserter,
        }
    }
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Asserter => write!(f, "asserter"),
            Party::Challenger => write!(f, "challenger"),
        }
    }
}

/// A half open interval of computation steps: `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepRange {
    /// The first step of the interval.
    pub lower: u64,
    /// The step right after the last step of the interval.
    pub upper: u64,
}

impl StepRange {
    /// Creates a new [StepRange].
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Returns the number of steps in the interval.
    pub fn width(&self) -> u64 {
        self.upper.saturating_sub(self.lower)
    }
}

/// The [ChallengeState] holds the interval under dispute and whose move it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeState {
    /// The first step of the disputed interval.
    pub lower_step: u64,
    /// The step right after the last step of the disputed interval.
    pub upper_step: u64,
    /// The block height by which the turn holder must act.
    pub deadline: TimeTicks,
    /// The participant that must act next.
    pub turn: Party,
    /// The number of steps in the original dispute.
    pub total_steps: u64,
}

impl ChallengeState {
    /// Returns the disputed interval.
    pub fn range(&self) -> StepRange {
        StepRange::new(self.lower_step, self.upper_step)
    }

    /// Returns the number of steps in the disputed interval.
    pub fn width(&self) -> u64 {
        self.range().width()
    }
}

/// The reason a challenge was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// The one step proof was checked and matched the claim.
    OneStepProofValid,
    /// The one step proof was checked and did not match the claim.
    OneStepProofInvalid,
    /// The turn holder did not act before its deadline.
    Timeout,
}

/// The terminal result of a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Outcome {
    /// The participant that won the challenge.
    pub winner: Party,
    /// Why the challenge was resolved.
    pub reason: Resolution,
}

impl Outcome {
    /// Creates a new [Outcome].
    pub fn new(winner: Party, reason: Resolution) -> Self {
        Self { winner, reason }
    }

    /// Returns true if the asserter won.
    pub fn asserter_wins(&self) -> bool {
        self.winner == Party::Asserter
    }

    /// Returns true if the challenger won.
    pub fn challenger_wins(&self) -> bool {
        self.winner == Party::Challenger
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} wins ({:?})", self.winner, self.reason)
    }
}

/// The [SegmentClaim] is what a participant claims about one interval of steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentClaim {
    /// The claimed starting state.
    pub precondition: Precondition,
    /// The claimed result of executing the interval.
    pub assertion: ExecutionAssertionStub,
}

impl SegmentClaim {
    /// Computes the commitment to this claim.
    pub fn commitment(&self) -> Digest {
        segment_commitment(&self.precondition, &self.assertion)
    }
}

/// A [Segment] is one of the sub-intervals proposed by a bisection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// The steps covered by the segment.
    pub range: StepRange,
    /// The commitment posted for the segment.
    pub commitment: Digest,
    /// The full claim, if it was observed. Segments that are only known by their commitment
    /// have no claim.
    pub claim: Option<SegmentClaim>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn stub(first: u8, last: u8, gas: u64) -> ExecutionAssertionStub {
        ExecutionAssertionStub {
            after_machine_hash: H256::repeat_byte(last),
            did_inbox_insn: false,
            num_gas: gas,
            first_message_hash: H256::repeat_byte(first),
            last_message_hash: H256::repeat_byte(last),
            first_log_hash: H256::repeat_byte(first.wrapping_add(100)),
            last_log_hash: H256::repeat_byte(last.wrapping_add(100)),
        }
    }

    #[test]
    fn combine_chained_stubs() {
        let mut second = stub(2, 3, 5);
        second.did_inbox_insn = true;
        let combined = ExecutionAssertionStub::combine(&[stub(1, 2, 4), second]).unwrap();

        assert_eq!(combined.first_message_hash, H256::repeat_byte(1));
        assert_eq!(combined.last_message_hash, H256::repeat_byte(3));
        assert_eq!(combined.after_machine_hash, H256::repeat_byte(3));
        assert_eq!(combined.num_gas, 9);
        assert!(combined.did_inbox_insn);
    }

    #[test]
    fn combine_rejects_broken_chain() {
        assert!(ExecutionAssertionStub::combine(&[stub(1, 2, 1), stub(3, 4, 1)]).is_none());
        assert!(ExecutionAssertionStub::combine(&[]).is_none());
    }

    #[test]
    fn advance_consumes_inbox() {
        let pre = Precondition {
            before_machine_hash: H256::repeat_byte(9),
            before_inbox_hash: H256::repeat_byte(7),
            time_bounds: TimeBounds { start: 1, end: 10 },
        };
        let mut assertion = stub(1, 2, 1);

        let next = pre.advance(&assertion);
        assert_eq!(next.before_machine_hash, assertion.after_machine_hash);
        assert_eq!(next.before_inbox_hash, pre.before_inbox_hash);

        assertion.did_inbox_insn = true;
        assert_eq!(pre.advance(&assertion).before_inbox_hash, EMPTY_INBOX_HASH);
    }

    #[test]
    fn commitments_bind_both_halves() {
        let pre = Precondition::default();
        let a = stub(1, 2, 1);
        let b = stub(1, 2, 2);
        assert_ne!(segment_commitment(&pre, &a), segment_commitment(&pre, &b));

        let other_pre = Precondition {
            before_inbox_hash: H256::repeat_byte(1),
            ..pre
        };
        assert_ne!(segment_commitment(&pre, &a), segment_commitment(&other_pre, &a));
    }

    #[test]
    fn chain_commitments_pair_adjacent_hashes() {
        let chain = [H256::repeat_byte(1), H256::repeat_byte(2), H256::repeat_byte(3)];
        let commitments = chain_commitments(&chain, &[]);
        assert_eq!(commitments.len(), 2);
        assert_ne!(commitments[0], commitments[1]);

        let with_segments = chain_commitments(&chain, &chain);
        assert_ne!(with_segments[0], commitments[0]);
    }

    #[test]
    fn deadline_passes_strictly_after() {
        let deadline = TimeTicks(10).after(5);
        assert_eq!(deadline, TimeTicks(15));
        assert!(!deadline.is_passed_at(TimeTicks(15)));
        assert!(deadline.is_passed_at(TimeTicks(16)));
    }
}
