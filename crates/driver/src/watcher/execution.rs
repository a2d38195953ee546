use super::{array_of, topic_of, BisectionDecoder, EventDecoder, BYTES32, UINT64};
use crate::{
    abi::{self, EventData},
    error::DecodeError,
    types::LogEntry,
};
use ethers::{abi::ParamType, types::H256};
use rollup_challenger_protocol::bisection::{ChallengeEvent, ExecutionAssertionStub};

const EVENT: &str = "BisectedAssertion";

/// The [ExecutionDecoder] decodes the events of an execution challenge: the shared events plus
/// `BisectedAssertion`, whose flattened boundary arrays are rebuilt into assertion stubs.
#[derive(Debug, Clone)]
pub struct ExecutionDecoder {
    shared: BisectionDecoder,
    bisected_assertion: H256,
}

impl Default for ExecutionDecoder {
    fn default() -> Self {
        Self {
            shared: BisectionDecoder::default(),
            bisected_assertion: abi::event_topic(abi::BISECTED_ASSERTION),
        }
    }
}

impl ExecutionDecoder {
    fn decode_bisection(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError> {
        let mut data = EventData::decode(
            EVENT,
            &[
                array_of(BYTES32),
                array_of(ParamType::Bool),
                array_of(BYTES32),
                array_of(BYTES32),
                array_of(UINT64),
                UINT64,
                UINT64,
            ],
            &log.data,
        )?;
        let machine_hashes = data.digests()?;
        let did_inbox_insns = data.bools()?;
        let message_accs = data.digests()?;
        let log_accs = data.digests()?;
        let gases = data.u64s()?;
        let total_steps = data.u64()?;
        let deadline = data.ticks()?;

        let segments = did_inbox_insns.len();
        if segments == 0 {
            return Err(DecodeError::malformed(EVENT, "no segments"));
        }
        let lengths = [
            ("machine hashes", machine_hashes.len(), segments + 1),
            ("message accumulators", message_accs.len(), segments + 1),
            ("log accumulators", log_accs.len(), segments + 1),
            ("gas amounts", gases.len(), segments),
        ];
        if let Some((name, found, expected)) =
            lengths.iter().find(|(_, found, expected)| found != expected)
        {
            return Err(DecodeError::malformed(
                EVENT,
                format!(
                    "{} segments carry {} {}, expected {}",
                    segments, found, name, expected
                ),
            ));
        }

        let assertions = (0..segments)
            .map(|i| ExecutionAssertionStub {
                after_machine_hash: machine_hashes[i + 1],
                did_inbox_insn: did_inbox_insns[i],
                num_gas: gases[i],
                first_message_hash: message_accs[i],
                last_message_hash: message_accs[i + 1],
                first_log_hash: log_accs[i],
                last_log_hash: log_accs[i + 1],
            })
            .collect();

        Ok(ChallengeEvent::ExecutionBisected {
            before_machine_hash: machine_hashes[0],
            assertions,
            total_steps,
            deadline,
        })
    }
}

impl EventDecoder for ExecutionDecoder {
    fn topics(&self) -> Vec<H256> {
        let mut topics = self.shared.topics();
        topics.push(self.bisected_assertion);
        topics
    }

    fn decode(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError> {
        if let Some(event) = self.shared.try_decode(log)? {
            return Ok(event);
        }

        let topic = topic_of(log)?;
        if topic == self.bisected_assertion {
            self.decode_bisection(log)
        } else {
            Err(DecodeError::UnknownTopic(topic))
        }
    }
}
