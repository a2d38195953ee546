use super::{array_of, topic_of, BisectionDecoder, EventDecoder, BYTES32, UINT64};
use crate::{
    abi::{self, EventData},
    error::DecodeError,
    types::LogEntry,
};
use ethers::types::H256;
use rollup_challenger_protocol::bisection::ChallengeEvent;

/// The [InboxTopDecoder] decodes the events of an inbox top challenge.
#[derive(Debug, Clone)]
pub struct InboxTopDecoder {
    shared: BisectionDecoder,
    inbox_top_bisected: H256,
}

impl Default for InboxTopDecoder {
    fn default() -> Self {
        Self {
            shared: BisectionDecoder::default(),
            inbox_top_bisected: abi::event_topic(abi::INBOX_TOP_BISECTED),
        }
    }
}

impl EventDecoder for InboxTopDecoder {
    fn topics(&self) -> Vec<H256> {
        let mut topics = self.shared.topics();
        topics.push(self.inbox_top_bisected);
        topics
    }

    fn decode(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError> {
        if let Some(event) = self.shared.try_decode(log)? {
            return Ok(event);
        }

        let topic = topic_of(log)?;
        if topic != self.inbox_top_bisected {
            return Err(DecodeError::UnknownTopic(topic));
        }

        let mut data = EventData::decode(
            "InboxTopBisected",
            &[array_of(BYTES32), UINT64, UINT64],
            &log.data,
        )?;
        let chain_hashes = data.digests()?;
        if chain_hashes.len() < 2 {
            return Err(DecodeError::malformed(
                "InboxTopBisected",
                format!("{} chain hashes bound no segment", chain_hashes.len()),
            ));
        }

        Ok(ChallengeEvent::InboxTopBisected {
            chain_hashes,
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

    #[test]
    fn decodes_chain_hashes() {
        let event = ChallengeEvent::InboxTopBisected {
            chain_hashes: (1..=4).map(H256::repeat_byte).collect(),
            total_length: 30,
            deadline: TimeTicks(100),
        };
        assert_eq!(InboxTopDecoder::default().decode(&encoded(&event)).unwrap(), event);
    }

    #[test]
    fn rejects_single_boundary() {
        let event = ChallengeEvent::InboxTopBisected {
            chain_hashes: vec![H256::repeat_byte(1)],
            total_length: 30,
            deadline: TimeTicks(100),
        };
        assert!(matches!(
            InboxTopDecoder::default().decode(&encoded(&event)),
            Err(DecodeError::Malformed { .. })
        ));
    }
}
