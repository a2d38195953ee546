//! The alphabet module contains the alphabet machine: a toy VM whose state at every step is a
//! single letter and whose only instruction increments that letter. It is used to drive
//! simulated challenges end to end.

use super::{
    partition, Digest, ExecutionAssertionStub, OneStepVerifier, Precondition, StepRange,
    TimeBounds,
};
use anyhow::{anyhow, Result};
use ethers::{
    abi::{self, ParamType, Token},
    types::{Bytes, H256, U256},
    utils::keccak256,
};
use std::sync::Arc;

/// The inbox hash used by every alphabet precondition. The machine never reads its inbox.
const ALPHABET_INBOX_HASH: Digest = H256([0u8; 32]);

/// Computes the machine hash of the alphabet machine holding `letter` at `step`.
pub fn machine_hash(step: u64, letter: u8) -> Digest {
    H256::from(keccak256(abi::encode(&[
        Token::Uint(U256::from(step)),
        Token::Uint(U256::from(letter)),
    ])))
}

/// Advances the log accumulator over a letter emitted by the machine.
pub fn log_step(accumulator: Digest, letter: u8) -> Digest {
    let mut preimage = [0u8; 33];
    preimage[..32].copy_from_slice(accumulator.as_bytes());
    preimage[32] = letter;
    H256::from(keccak256(preimage))
}

/// Encodes a one step proof for the alphabet machine holding `letter` at `step`.
pub fn encode_proof(step: u64, letter: u8) -> Bytes {
    abi::encode(&[Token::Uint(U256::from(step)), Token::Uint(U256::from(letter))]).into()
}

/// Decodes a one step proof into the step and the letter it claims.
pub fn decode_proof(proof: &[u8]) -> Result<(u64, u8)> {
    let mut tokens = abi::decode(&[ParamType::Uint(64), ParamType::Uint(8)], proof)?.into_iter();
    let step = tokens
        .next()
        .and_then(Token::into_uint)
        .ok_or(anyhow!("Missing step in alphabet proof"))?;
    let letter = tokens
        .next()
        .and_then(Token::into_uint)
        .ok_or(anyhow!("Missing letter in alphabet proof"))?;
    Ok((step.low_u64(), letter.low_u32() as u8))
}

/// An [AlphabetTrace] is one participant's view of the full execution of the alphabet machine.
/// `trace[i]` is the letter held before executing step `i`.
#[derive(Debug, Clone)]
pub struct AlphabetTrace {
    /// The letters held at every step, `total_steps + 1` entries long.
    trace: Arc<[u8]>,
    /// The time bounds every precondition is valid for.
    time_bounds: TimeBounds,
}

impl AlphabetTrace {
    /// Creates a new [AlphabetTrace] from the letters held at every step.
    pub fn new(trace: impl Into<Arc<[u8]>>, time_bounds: TimeBounds) -> Self {
        Self {
            trace: trace.into(),
            time_bounds,
        }
    }

    /// Creates the correct trace of `total_steps` steps starting from `first`.
    pub fn honest(first: u8, total_steps: u64, time_bounds: TimeBounds) -> Self {
        let trace: Vec<u8> = (0..=total_steps)
            .map(|i| first.wrapping_add(i as u8))
            .collect();
        Self::new(trace, time_bounds)
    }

    /// Creates a trace of `total_steps` steps starting from `first` whose step `fault_step`
    /// yields the wrong letter. Every later step builds on the wrong letter.
    pub fn faulty(first: u8, total_steps: u64, fault_step: u64, time_bounds: TimeBounds) -> Self {
        let mut letter = first;
        let mut trace = Vec::with_capacity(total_steps as usize + 1);
        trace.push(letter);
        for step in 0..total_steps {
            letter = letter.wrapping_add(if step == fault_step { 2 } else { 1 });
            trace.push(letter);
        }
        Self::new(trace, time_bounds)
    }

    /// Returns the number of steps in the trace.
    pub fn total_steps(&self) -> u64 {
        self.trace.len().saturating_sub(1) as u64
    }

    /// Returns the letter held before executing `step`.
    pub fn letter_at(&self, step: u64) -> Result<u8> {
        self.trace
            .get(step as usize)
            .copied()
            .ok_or(anyhow!("Invalid trace index {}", step))
    }

    /// Returns the log accumulator after the machine reached `step`.
    pub fn log_accumulator(&self, step: u64) -> Result<Digest> {
        let mut acc = Digest::zero();
        for i in 1..=step {
            acc = log_step(acc, self.letter_at(i)?);
        }
        Ok(acc)
    }

    /// Returns the [Precondition] holding before `step`.
    pub fn precondition(&self, step: u64) -> Result<Precondition> {
        Ok(Precondition {
            before_machine_hash: machine_hash(step, self.letter_at(step)?),
            before_inbox_hash: ALPHABET_INBOX_HASH,
            time_bounds: self.time_bounds,
        })
    }

    /// Returns the [ExecutionAssertionStub] for executing `range`.
    pub fn assertion(&self, range: StepRange) -> Result<ExecutionAssertionStub> {
        Ok(ExecutionAssertionStub {
            after_machine_hash: machine_hash(range.upper, self.letter_at(range.upper)?),
            did_inbox_insn: false,
            num_gas: range.width(),
            first_message_hash: Digest::zero(),
            last_message_hash: Digest::zero(),
            first_log_hash: self.log_accumulator(range.lower)?,
            last_log_hash: self.log_accumulator(range.upper)?,
        })
    }

    /// Returns the assertion stubs of a bisection of `range` into at most `fan_out` segments.
    pub fn bisect(&self, range: StepRange, fan_out: u64) -> Result<Vec<ExecutionAssertionStub>> {
        partition(range, fan_out)
            .into_iter()
            .map(|segment| self.assertion(segment))
            .collect()
    }

    /// Returns the one step proof for executing `step`.
    pub fn one_step_proof(&self, step: u64) -> Result<Bytes> {
        Ok(encode_proof(step, self.letter_at(step)?))
    }
}

/// The [AlphabetVerifier] re-executes a single step of the alphabet machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlphabetVerifier;

impl OneStepVerifier for AlphabetVerifier {
    fn verify(
        &self,
        precondition: &Precondition,
        assertion: &ExecutionAssertionStub,
        proof: &[u8],
    ) -> bool {
        let Ok((step, letter)) = decode_proof(proof) else {
            tracing::debug!(target: "alphabet-verifier", "Malformed alphabet proof");
            return false;
        };
        let next = letter.wrapping_add(1);

        precondition.before_machine_hash == machine_hash(step, letter)
            && assertion.after_machine_hash == machine_hash(step + 1, next)
            && assertion.num_gas == 1
            && !assertion.did_inbox_insn
            && assertion.first_message_hash == assertion.last_message_hash
            && assertion.last_log_hash == log_step(assertion.first_log_hash, next)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BOUNDS: TimeBounds = TimeBounds { start: 0, end: 100 };

    #[test]
    fn honest_steps_verify() {
        let trace = AlphabetTrace::honest(b'a', 8, BOUNDS);
        for step in 0..8 {
            let pre = trace.precondition(step).unwrap();
            let assertion = trace.assertion(StepRange::new(step, step + 1)).unwrap();
            let proof = trace.one_step_proof(step).unwrap();
            assert!(AlphabetVerifier.verify(&pre, &assertion, &proof));
        }
    }

    #[test]
    fn faulty_step_fails_verification() {
        let trace = AlphabetTrace::faulty(b'a', 8, 5, BOUNDS);
        let pre = trace.precondition(5).unwrap();
        let assertion = trace.assertion(StepRange::new(5, 6)).unwrap();
        let proof = trace.one_step_proof(5).unwrap();
        assert!(!AlphabetVerifier.verify(&pre, &assertion, &proof));

        // Every other step of the faulty trace is still a correct increment.
        let pre = trace.precondition(6).unwrap();
        let assertion = trace.assertion(StepRange::new(6, 7)).unwrap();
        let proof = trace.one_step_proof(6).unwrap();
        assert!(AlphabetVerifier.verify(&pre, &assertion, &proof));
    }

    #[test]
    fn garbage_proof_is_invalid() {
        let trace = AlphabetTrace::honest(b'a', 2, BOUNDS);
        let pre = trace.precondition(0).unwrap();
        let assertion = trace.assertion(StepRange::new(0, 1)).unwrap();
        assert!(!AlphabetVerifier.verify(&pre, &assertion, &[1, 2, 3]));
    }

    #[test]
    fn bisection_stubs_chain() {
        let trace = AlphabetTrace::honest(b'a', 8, BOUNDS);
        let stubs = trace.bisect(StepRange::new(0, 8), 2).unwrap();
        assert_eq!(stubs.len(), 2);
        assert_eq!(
            ExecutionAssertionStub::combine(&stubs).unwrap(),
            trace.assertion(StepRange::new(0, 8)).unwrap()
        );
    }
}
