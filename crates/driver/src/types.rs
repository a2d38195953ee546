//! The types module contains the ledger-facing value types shared by the tracker, the watchers
//! and the drivers.

use crate::error::TrackerError;
use ethers::types::{Address, Bytes, H256};
use rollup_challenger_protocol::bisection::{ChallengeEvent, TimeTicks};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The [TxHash] type identifies a submitted action.
pub type TxHash = H256;

/// The [BlockIdentity] struct identifies a single block of the base ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentity {
    /// The height of the block.
    pub height: u64,
    /// The hash of the block header.
    pub header_hash: H256,
    /// The hash of the parent block header.
    pub parent_hash: H256,
}

impl BlockIdentity {
    /// Returns true if `next` directly extends this block.
    pub fn is_parent_of(&self, next: &BlockIdentity) -> bool {
        next.height == self.height + 1 && next.parent_hash == self.header_hash
    }

    /// Returns the height of the block as a deadline comparable [TimeTicks].
    pub fn ticks(&self) -> TimeTicks {
        TimeTicks(self.height)
    }
}

impl fmt::Display for BlockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({:?})", self.height, self.header_hash)
    }
}

/// Either the next [BlockIdentity] of the chain or the terminal error that ended tracking.
pub type MaybeBlockIdentity = Result<BlockIdentity, TrackerError>;

/// A [LogEntry] is a raw contract log as reported by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The contract that emitted the log.
    pub address: Address,
    /// The hash of the block the log was included in.
    pub block_hash: H256,
    /// The height of the block the log was included in.
    pub block_height: u64,
    /// The index of the log within its block.
    pub log_index: u64,
    /// The indexed topics of the log. `topics[0]` identifies the event.
    pub topics: Vec<H256>,
    /// The ABI encoded, non-indexed parameters of the event.
    pub data: Bytes,
}

/// An [ObservedEvent] is a decoded [ChallengeEvent] together with its position on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedEvent {
    /// The block the event was included in.
    pub block: BlockIdentity,
    /// The index of the log within its block.
    pub log_index: u64,
    /// The decoded event.
    pub event: ChallengeEvent,
}

/// A [Notification] is an item of an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// A decoded event of the watched contract.
    Event(ObservedEvent),
    /// Every event of this block has been delivered.
    Block(BlockIdentity),
}

impl Notification {
    /// Returns the block the notification belongs to.
    pub fn block(&self) -> &BlockIdentity {
        match self {
            Notification::Event(observed) => &observed.block,
            Notification::Block(block) => block,
        }
    }
}
