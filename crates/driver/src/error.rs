//! The error module contains the terminal errors of the tracker, the watchers and the challenge
//! session.

use crate::types::TxHash;
use ethers::types::{Address, H256};
use rollup_challenger_protocol::bisection::{Party, ProtocolError};
use thiserror::Error;

/// A [TrackerError] ends a chain head tracker stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("reorg at block {height}: expected parent {expected_parent:?}, found {found_parent:?}")]
    Reorg {
        height: u64,
        expected_parent: H256,
        found_parent: H256,
    },
    #[error("failed to fetch block {height} after {attempts} attempts: {last_error}")]
    FetchExhausted {
        height: u64,
        attempts: u32,
        last_error: String,
    },
}

/// A [DecodeError] is raised for a log that is not a well formed event of the watched contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("log has no topics")]
    MissingTopic,
    #[error("unknown event topic {0:?}")]
    UnknownTopic(H256),
    #[error("malformed {event} data: {reason}")]
    Malformed { event: &'static str, reason: String },
}

impl DecodeError {
    pub(crate) fn malformed(event: &'static str, reason: impl ToString) -> Self {
        DecodeError::Malformed {
            event,
            reason: reason.to_string(),
        }
    }
}

/// A [WatchError] ends an event stream.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("undecodable log {log_index} in block {height}: {source}")]
    Decode {
        height: u64,
        log_index: u64,
        source: DecodeError,
    },
    #[error("failed to fetch logs of block {height}: {source}")]
    Fetch { height: u64, source: anyhow::Error },
    #[error("log of block {height} belongs to {found:?}, tracked block is {expected:?}")]
    BlockMismatch {
        height: u64,
        expected: H256,
        found: H256,
    },
}

/// A [SessionError] is returned by a challenge session when a move cannot be made. The local
/// state of the challenge is left as it was before the move.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("failed to submit {action}: {source}")]
    Submission {
        action: &'static str,
        source: anyhow::Error,
    },
    #[error("{action} was rejected by the ledger in transaction {tx:?}")]
    Rejected { action: &'static str, tx: TxHash },
    #[error("challenge {address:?} is already being played as {role}")]
    AlreadyActive { address: Address, role: Party },
    #[error("failed to query the ledger: {source}")]
    Ledger { source: anyhow::Error },
    #[error("no recent block of challenge {address:?} is on the canonical chain")]
    RewindExhausted { address: Address },
}
