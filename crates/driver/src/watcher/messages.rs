use super::{array_of, topic_of, BisectionDecoder, EventDecoder, BYTES32, UINT64};
use crate::{
    abi::{self, EventData},
    error::DecodeError,
    types::LogEntry,
};
use ethers::types::H256;
use rollup_challenger_protocol::bisection::ChallengeEvent;

const EVENT: &str = "MessagesBisected";

/// The [MessagesDecoder] decodes the events of a messages challenge. Its bisections carry two
/// parallel chains of boundary hashes.
#[derive(Debug, Clone)]
pub struct MessagesDecoder {
    shared: BisectionDecoder,
    messages_bisected: H256,
}

impl Default for MessagesDecoder {
    fn default() -> Self {
        Self {
            shared: BisectionDecoder::default(),
            messages_bisected: abi::event_topic(abi::MESSAGES_BISECTED),
        }
    }
}

impl EventDecoder for MessagesDecoder {
    fn topics(&self) -> Vec<H256> {
        let mut topics = self.shared.topics();
        topics.push(self.messages_bisected);
        topics
    }

    fn decode(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError> {
        if let Some(event) = self.shared.try_decode(log)? {
            return Ok(event);
        }

        let topic = topic_of(log)?;
        if topic != self.messages_bisected {
            return Err(DecodeError::UnknownTopic(topic));
        }

        let mut data = EventData::decode(
            EVENT,
            &[array_of(BYTES32), array_of(BYTES32), UINT64, UINT64],
            &log.data,
        )?;
        let chain_hashes = data.digests()?;
        let segment_hashes = data.digests()?;
        if chain_hashes.len() != segment_hashes.len() {
            return Err(DecodeError::malformed(
                EVENT,
                format!(
                    "{} chain hashes but {} segment hashes",
                    chain_hashes.len(),
                    segment_hashes.len()
                ),
            ));
        }
        if chain_hashes.len() < 2 {
            return Err(DecodeError::malformed(EVENT, "no segments"));
        }

        Ok(ChallengeEvent::MessagesBisected {
            chain_hashes,
            segment_hashes,
            total_length: data.u64()?,
            deadline: data.ticks()?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::watcher::bisection::test::encoded;
    use rollup_challenger_protocol::bisection::TimeTicks;

    fn bisected(chain: usize, segments: usize) -> ChallengeEvent {
        ChallengeEvent::MessagesBisected {
            chain_hashes: vec![H256::repeat_byte(1); chain],
            segment_hashes: vec![H256::repeat_byte(2); segments],
            total_length: 16,
            deadline: TimeTicks(8),
        }
    }

    #[test]
    fn decodes_parallel_chains() {
        let event = bisected(3, 3);
        assert_eq!(MessagesDecoder::default().decode(&encoded(&event)).unwrap(), event);
    }

    #[test]
    fn rejects_uneven_chains() {
        assert!(matches!(
            MessagesDecoder::default().decode(&encoded(&bisected(3, 2))),
            Err(DecodeError::Malformed { event: EVENT, .. })
        ));
        assert!(MessagesDecoder::default().decode(&encoded(&bisected(1, 1))).is_err());
    }
}
