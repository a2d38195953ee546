//! The abi module contains the wire codec of the challenge contracts: the event signatures the
//! watchers decode, the log payloads the simulation backend emits, and the calldata of the
//! actions a participant submits.

use crate::error::DecodeError;
use ethers::{
    abi::{self, ParamType, Token},
    types::{Bytes, H256, U256},
    utils::{id, keccak256},
};
use rollup_challenger_protocol::bisection::{
    ChallengeAction, ChallengeEvent, ExecutionAssertionStub, Precondition, TimeTicks,
};

pub const BISECTION_PROPOSED: &str = "BisectionProposed(bytes32[],uint64,uint64)";
pub const CONTINUED: &str = "Continued(uint64,uint64,uint64)";
pub const ONE_STEP_PROOF_COMPLETED: &str = "OneStepProofCompleted(bool)";
pub const ASSERTER_TIMED_OUT: &str = "AsserterTimedOut()";
pub const CHALLENGER_TIMED_OUT: &str = "ChallengerTimedOut()";
pub const BISECTED_ASSERTION: &str =
    "BisectedAssertion(bytes32[],bool[],bytes32[],bytes32[],uint64[],uint64,uint64)";
pub const INBOX_TOP_BISECTED: &str = "InboxTopBisected(bytes32[],uint64,uint64)";
pub const MESSAGES_BISECTED: &str = "MessagesBisected(bytes32[],bytes32[],uint64,uint64)";

pub const BISECT_ASSERTION: &str = "bisectAssertion(bytes32,bytes32,uint64,uint64,bytes32[],bool[],bytes32[],bytes32[],uint64[],uint64)";
pub const CHOOSE_SEGMENT: &str = "chooseSegment(uint64,bytes32[],uint64)";
pub const ONE_STEP_PROOF: &str = "oneStepProof(bytes32,bytes32,uint64,uint64,bytes32,bool,uint64,bytes32,bytes32,bytes32,bytes32,bytes)";

/// Computes the `topics[0]` of the event with the given signature.
pub fn event_topic(signature: &str) -> H256 {
    H256::from(keccak256(signature))
}

/// Encodes a [ChallengeEvent] into the first topic and the data of a log.
pub fn encode_event(event: &ChallengeEvent) -> (H256, Bytes) {
    let (signature, tokens) = match event {
        ChallengeEvent::SegmentsProposed {
            segment_commitments,
            total_steps,
            deadline,
        } => (
            BISECTION_PROPOSED,
            vec![
                digests(segment_commitments.iter().copied()),
                uint(*total_steps),
                uint(deadline.0),
            ],
        ),
        ChallengeEvent::SegmentChosen {
            chosen_index,
            new_lower_step,
            new_upper_step,
        } => (
            CONTINUED,
            vec![uint(*chosen_index), uint(*new_lower_step), uint(*new_upper_step)],
        ),
        ChallengeEvent::OneStepProofCompleted { valid } => {
            (ONE_STEP_PROOF_COMPLETED, vec![Token::Bool(*valid)])
        }
        ChallengeEvent::AsserterTimedOut => (ASSERTER_TIMED_OUT, Vec::new()),
        ChallengeEvent::ChallengerTimedOut => (CHALLENGER_TIMED_OUT, Vec::new()),
        ChallengeEvent::ExecutionBisected {
            before_machine_hash,
            assertions,
            total_steps,
            deadline,
        } => {
            return encode_bisected_assertion(
                *before_machine_hash,
                assertions,
                *total_steps,
                *deadline,
            )
        }
        ChallengeEvent::InboxTopBisected {
            chain_hashes,
            total_length,
            deadline,
        } => (
            INBOX_TOP_BISECTED,
            vec![
                digests(chain_hashes.iter().copied()),
                uint(*total_length),
                uint(deadline.0),
            ],
        ),
        ChallengeEvent::MessagesBisected {
            chain_hashes,
            segment_hashes,
            total_length,
            deadline,
        } => (
            MESSAGES_BISECTED,
            vec![
                digests(chain_hashes.iter().copied()),
                digests(segment_hashes.iter().copied()),
                uint(*total_length),
                uint(deadline.0),
            ],
        ),
    };

    (event_topic(signature), abi::encode(&tokens).into())
}

/// Encodes a `BisectedAssertion` log. The stubs are flattened into their boundary hashes:
/// `K + 1` machine hashes starting with `before_machine_hash`, `K + 1` message and log
/// accumulators, and `K` inbox flags and gas amounts.
pub fn encode_bisected_assertion(
    before_machine_hash: H256,
    assertions: &[ExecutionAssertionStub],
    total_steps: u64,
    deadline: TimeTicks,
) -> (H256, Bytes) {
    let machine_hashes = std::iter::once(before_machine_hash)
        .chain(assertions.iter().map(|a| a.after_machine_hash));
    let tokens = [
        digests(machine_hashes),
        Token::Array(assertions.iter().map(|a| Token::Bool(a.did_inbox_insn)).collect()),
        digests(message_accumulators(assertions)),
        digests(log_accumulators(assertions)),
        Token::Array(assertions.iter().map(|a| uint(a.num_gas)).collect()),
        uint(total_steps),
        uint(deadline.0),
    ];

    (event_topic(BISECTED_ASSERTION), abi::encode(&tokens).into())
}

/// Encodes a [ChallengeAction] into transaction calldata: the 4 byte selector followed by the
/// ABI encoded arguments.
pub fn encode_action(action: &ChallengeAction) -> Bytes {
    let (signature, tokens) = match action {
        ChallengeAction::BisectAssertion {
            precondition,
            assertions,
            total_steps,
        } => {
            let mut tokens = precondition_tokens(precondition);
            tokens.extend([
                digests(assertions.iter().map(|a| a.after_machine_hash)),
                Token::Array(assertions.iter().map(|a| Token::Bool(a.did_inbox_insn)).collect()),
                digests(message_accumulators(assertions)),
                digests(log_accumulators(assertions)),
                Token::Array(assertions.iter().map(|a| uint(a.num_gas)).collect()),
                uint(*total_steps),
            ]);
            (BISECT_ASSERTION, tokens)
        }
        ChallengeAction::ChooseSegment {
            segment_index,
            segment_commitments,
            total_steps,
        } => (
            CHOOSE_SEGMENT,
            vec![
                uint(*segment_index),
                digests(segment_commitments.iter().copied()),
                uint(*total_steps),
            ],
        ),
        ChallengeAction::OneStepProof {
            precondition,
            assertion,
            proof,
        } => {
            let mut tokens = precondition_tokens(precondition);
            tokens.extend([
                digest(assertion.after_machine_hash),
                Token::Bool(assertion.did_inbox_insn),
                uint(assertion.num_gas),
                digest(assertion.first_message_hash),
                digest(assertion.last_message_hash),
                digest(assertion.first_log_hash),
                digest(assertion.last_log_hash),
                Token::Bytes(proof.to_vec()),
            ]);
            (ONE_STEP_PROOF, tokens)
        }
    };

    let mut calldata = id(signature).to_vec();
    calldata.extend(abi::encode(&tokens));
    calldata.into()
}

fn precondition_tokens(precondition: &Precondition) -> Vec<Token> {
    vec![
        digest(precondition.before_machine_hash),
        digest(precondition.before_inbox_hash),
        uint(precondition.time_bounds.start),
        uint(precondition.time_bounds.end),
    ]
}

fn message_accumulators(assertions: &[ExecutionAssertionStub]) -> impl Iterator<Item = H256> + '_ {
    assertions
        .first()
        .map(|a| a.first_message_hash)
        .into_iter()
        .chain(assertions.iter().map(|a| a.last_message_hash))
}

fn log_accumulators(assertions: &[ExecutionAssertionStub]) -> impl Iterator<Item = H256> + '_ {
    assertions
        .first()
        .map(|a| a.first_log_hash)
        .into_iter()
        .chain(assertions.iter().map(|a| a.last_log_hash))
}

fn digest(hash: H256) -> Token {
    Token::FixedBytes(hash.as_bytes().to_vec())
}

fn digests(hashes: impl IntoIterator<Item = H256>) -> Token {
    Token::Array(hashes.into_iter().map(digest).collect())
}

fn uint(value: u64) -> Token {
    Token::Uint(U256::from(value))
}

/// The [EventData] struct reads the decoded parameters of a log in order.
pub(crate) struct EventData {
    /// The name of the event, used in errors.
    event: &'static str,
    /// The parameters that have not been read yet.
    tokens: std::vec::IntoIter<Token>,
}

impl EventData {
    /// Decodes `data` as the ABI encoding of `types`.
    pub(crate) fn decode(
        event: &'static str,
        types: &[ParamType],
        data: &[u8],
    ) -> Result<Self, DecodeError> {
        let tokens = abi::decode(types, data).map_err(|e| DecodeError::malformed(event, e))?;
        Ok(Self {
            event,
            tokens: tokens.into_iter(),
        })
    }

    fn next(&mut self) -> Result<Token, DecodeError> {
        self.tokens
            .next()
            .ok_or_else(|| DecodeError::malformed(self.event, "missing parameter"))
    }

    fn array(&mut self) -> Result<Vec<Token>, DecodeError> {
        match self.next()? {
            Token::Array(items) => Ok(items),
            other => Err(DecodeError::malformed(
                self.event,
                format!("expected array, found {:?}", other),
            )),
        }
    }

    pub(crate) fn digests(&mut self) -> Result<Vec<H256>, DecodeError> {
        let event = self.event;
        self.array()?
            .into_iter()
            .map(|token| token_digest(event, token))
            .collect()
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        let token = self.next()?;
        token_u64(self.event, token)
    }

    pub(crate) fn u64s(&mut self) -> Result<Vec<u64>, DecodeError> {
        let event = self.event;
        self.array()?
            .into_iter()
            .map(|token| token_u64(event, token))
            .collect()
    }

    pub(crate) fn bool(&mut self) -> Result<bool, DecodeError> {
        let token = self.next()?;
        token_bool(self.event, token)
    }

    pub(crate) fn bools(&mut self) -> Result<Vec<bool>, DecodeError> {
        let event = self.event;
        self.array()?
            .into_iter()
            .map(|token| token_bool(event, token))
            .collect()
    }

    pub(crate) fn ticks(&mut self) -> Result<TimeTicks, DecodeError> {
        self.u64().map(TimeTicks)
    }
}

fn token_digest(event: &'static str, token: Token) -> Result<H256, DecodeError> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(&bytes)),
        other => Err(DecodeError::malformed(
            event,
            format!("expected bytes32, found {:?}", other),
        )),
    }
}

fn token_u64(event: &'static str, token: Token) -> Result<u64, DecodeError> {
    match token {
        Token::Uint(value) if value <= U256::from(u64::MAX) => Ok(value.as_u64()),
        other => Err(DecodeError::malformed(
            event,
            format!("expected uint64, found {:?}", other),
        )),
    }
}

fn token_bool(event: &'static str, token: Token) -> Result<bool, DecodeError> {
    match token {
        Token::Bool(value) => Ok(value),
        other => Err(DecodeError::malformed(
            event,
            format!("expected bool, found {:?}", other),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rollup_challenger_protocol::bisection::{AlphabetTrace, StepRange, TimeBounds};

    #[test]
    fn topics_are_keccak_of_signature() {
        assert_eq!(
            event_topic(ASSERTER_TIMED_OUT),
            H256::from(keccak256(b"AsserterTimedOut()"))
        );
        assert_ne!(event_topic(ASSERTER_TIMED_OUT), event_topic(CHALLENGER_TIMED_OUT));
    }

    #[test]
    fn timeouts_carry_no_data() {
        let (_, data) = encode_event(&ChallengeEvent::ChallengerTimedOut);
        assert!(data.is_empty());
    }

    #[test]
    fn event_data_rejects_oversized_integers() {
        let data = abi::encode(&[Token::Uint(U256::MAX)]);
        let mut params =
            EventData::decode("Test", &[ParamType::Uint(256)], &data).unwrap();
        assert!(matches!(params.u64(), Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn event_data_rejects_truncated_data() {
        let err = EventData::decode(
            "Continued",
            &[ParamType::Uint(64), ParamType::Uint(64), ParamType::Uint(64)],
            &[0u8; 40],
        )
        .err()
        .unwrap();
        assert!(matches!(err, DecodeError::Malformed { event: "Continued", .. }));
    }

    #[test]
    fn bisect_assertion_calldata() {
        let trace = AlphabetTrace::honest(b'a', 4, TimeBounds { start: 3, end: 9 });
        let precondition = trace.precondition(0).unwrap();
        let assertions = trace.bisect(StepRange::new(0, 4), 2).unwrap();
        let calldata = encode_action(&ChallengeAction::BisectAssertion {
            precondition,
            assertions: assertions.clone(),
            total_steps: 4,
        });

        assert_eq!(calldata[..4], id(BISECT_ASSERTION));
        let tokens = abi::decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::FixedBytes(32),
                ParamType::Uint(64),
                ParamType::Uint(64),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::Bool)),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::FixedBytes(32))),
                ParamType::Array(Box::new(ParamType::Uint(64))),
                ParamType::Uint(64),
            ],
            &calldata[4..],
        )
        .unwrap();

        assert_eq!(tokens[0], digest(precondition.before_machine_hash));
        assert_eq!(tokens[2], uint(3));
        assert_eq!(tokens[3], uint(9));
        assert_eq!(
            tokens[4],
            digests(assertions.iter().map(|a| a.after_machine_hash))
        );
        // Accumulators have one boundary more than there are segments.
        assert_eq!(tokens[7].clone().into_array().unwrap().len(), 3);
        assert_eq!(tokens[9], uint(4));
    }

    #[test]
    fn one_step_proof_calldata_ends_with_proof() {
        let trace = AlphabetTrace::honest(b'a', 1, TimeBounds::default());
        let proof = trace.one_step_proof(0).unwrap();
        let calldata = encode_action(&ChallengeAction::OneStepProof {
            precondition: trace.precondition(0).unwrap(),
            assertion: trace.assertion(StepRange::new(0, 1)).unwrap(),
            proof: proof.clone(),
        });

        assert_eq!(calldata[..4], id(ONE_STEP_PROOF));
        let mut types = vec![ParamType::FixedBytes(32); 2];
        types.extend([ParamType::Uint(64), ParamType::Uint(64), ParamType::FixedBytes(32)]);
        types.extend([ParamType::Bool, ParamType::Uint(64)]);
        types.extend(vec![ParamType::FixedBytes(32); 4]);
        types.push(ParamType::Bytes);
        let tokens = abi::decode(&types, &calldata[4..]).unwrap();
        assert_eq!(
            tokens.last().cloned().and_then(Token::into_bytes).map(Bytes::from),
            Some(proof)
        );
    }
}
