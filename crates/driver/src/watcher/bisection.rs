use super::{array_of, topic_of, EventDecoder, BYTES32, UINT64};
use crate::{
    abi::{self, EventData},
    error::DecodeError,
    types::LogEntry,
};
use ethers::{abi::ParamType, types::H256};
use rollup_challenger_protocol::bisection::ChallengeEvent;

/// The [BisectionDecoder] decodes the events every challenge variant shares: proposals, choices,
/// one step proofs and timeouts.
#[derive(Debug, Clone)]
pub struct BisectionDecoder {
    proposed: H256,
    continued: H256,
    one_step_proof: H256,
    asserter_timed_out: H256,
    challenger_timed_out: H256,
}

impl Default for BisectionDecoder {
    fn default() -> Self {
        Self {
            proposed: abi::event_topic(abi::BISECTION_PROPOSED),
            continued: abi::event_topic(abi::CONTINUED),
            one_step_proof: abi::event_topic(abi::ONE_STEP_PROOF_COMPLETED),
            asserter_timed_out: abi::event_topic(abi::ASSERTER_TIMED_OUT),
            challenger_timed_out: abi::event_topic(abi::CHALLENGER_TIMED_OUT),
        }
    }
}

impl BisectionDecoder {
    /// Decodes `log` if it is one of the shared events.
    ///
    /// ### Returns
    /// - `Ok(Some(ChallengeEvent))`: The decoded event.
    /// - `Ok(None)`: The log is not one of the shared events.
    /// - `Err(DecodeError)`: The log is a shared event with malformed data.
    pub(crate) fn try_decode(&self, log: &LogEntry) -> Result<Option<ChallengeEvent>, DecodeError> {
        let topic = topic_of(log)?;

        let event = if topic == self.proposed {
            let mut data = EventData::decode(
                "BisectionProposed",
                &[array_of(BYTES32), UINT64, UINT64],
                &log.data,
            )?;
            let segment_commitments = data.digests()?;
            if segment_commitments.is_empty() {
                return Err(DecodeError::malformed(
                    "BisectionProposed",
                    "no segment commitments",
                ));
            }
            ChallengeEvent::SegmentsProposed {
                segment_commitments,
                total_steps: data.u64()?,
                deadline: data.ticks()?,
            }
        } else if topic == self.continued {
            let mut data = EventData::decode("Continued", &[UINT64, UINT64, UINT64], &log.data)?;
            let (chosen_index, new_lower_step, new_upper_step) =
                (data.u64()?, data.u64()?, data.u64()?);
            if new_lower_step >= new_upper_step {
                return Err(DecodeError::malformed(
                    "Continued",
                    format!("empty range {}..{}", new_lower_step, new_upper_step),
                ));
            }
            ChallengeEvent::SegmentChosen {
                chosen_index,
                new_lower_step,
                new_upper_step,
            }
        } else if topic == self.one_step_proof {
            let mut data =
                EventData::decode("OneStepProofCompleted", &[ParamType::Bool], &log.data)?;
            ChallengeEvent::OneStepProofCompleted {
                valid: data.bool()?,
            }
        } else if topic == self.asserter_timed_out {
            ChallengeEvent::AsserterTimedOut
        } else if topic == self.challenger_timed_out {
            ChallengeEvent::ChallengerTimedOut
        } else {
            return Ok(None);
        };

        Ok(Some(event))
    }
}

impl EventDecoder for BisectionDecoder {
    fn topics(&self) -> Vec<H256> {
        vec![
            self.proposed,
            self.continued,
            self.one_step_proof,
            self.asserter_timed_out,
            self.challenger_timed_out,
        ]
    }

    fn decode(&self, log: &LogEntry) -> Result<ChallengeEvent, DecodeError> {
        match self.try_decode(log)? {
            Some(event) => Ok(event),
            None => Err(DecodeError::UnknownTopic(topic_of(log)?)),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use ethers::types::{Address, Bytes};
    use rollup_challenger_protocol::bisection::TimeTicks;

    pub(crate) fn log_of(topic: H256, data: Bytes) -> LogEntry {
        LogEntry {
            address: Address::repeat_byte(0x44),
            block_hash: H256::repeat_byte(0x55),
            block_height: 7,
            log_index: 0,
            topics: vec![topic],
            data,
        }
    }

    pub(crate) fn encoded(event: &ChallengeEvent) -> LogEntry {
        let (topic, data) = abi::encode_event(event);
        log_of(topic, data)
    }

    #[test]
    fn decodes_shared_events() {
        let decoder = BisectionDecoder::default();
        let events = [
            ChallengeEvent::SegmentsProposed {
                segment_commitments: vec![H256::repeat_byte(1), H256::repeat_byte(2)],
                total_steps: 8,
                deadline: TimeTicks(40),
            },
            ChallengeEvent::SegmentChosen {
                chosen_index: 1,
                new_lower_step: 4,
                new_upper_step: 8,
            },
            ChallengeEvent::OneStepProofCompleted { valid: false },
            ChallengeEvent::AsserterTimedOut,
            ChallengeEvent::ChallengerTimedOut,
        ];

        for event in events {
            assert_eq!(decoder.decode(&encoded(&event)).unwrap(), event);
        }
    }

    #[test]
    fn rejects_unknown_and_missing_topics() {
        let decoder = BisectionDecoder::default();
        let unknown = H256::repeat_byte(9);
        assert_eq!(
            decoder.decode(&log_of(unknown, Bytes::new())),
            Err(DecodeError::UnknownTopic(unknown))
        );

        let mut log = encoded(&ChallengeEvent::AsserterTimedOut);
        log.topics.clear();
        assert_eq!(decoder.decode(&log), Err(DecodeError::MissingTopic));
    }

    #[test]
    fn rejects_empty_choice() {
        let log = encoded(&ChallengeEvent::SegmentChosen {
            chosen_index: 0,
            new_lower_step: 5,
            new_upper_step: 5,
        });
        assert!(matches!(
            BisectionDecoder::default().decode(&log),
            Err(DecodeError::Malformed { event: "Continued", .. })
        ));
    }

    #[test]
    fn rejects_proposal_without_segments() {
        let log = encoded(&ChallengeEvent::SegmentsProposed {
            segment_commitments: Vec::new(),
            total_steps: 8,
            deadline: TimeTicks(40),
        });
        assert!(BisectionDecoder::default().decode(&log).is_err());
    }
}
