use crate::types::{BlockIdentity, LogEntry};
use anyhow::{anyhow, Result};
use ethers::types::{Block, Log, H256};
use tokio::sync::{broadcast, mpsc};

/// Converts a block reported by a provider into a [BlockIdentity].
///
/// # Arguments
/// * `block` - The block returned by the provider.
///
/// # Returns
/// * The [BlockIdentity] of the block, or an error if the block is still pending and has no
/// number or hash.
pub fn block_identity<T>(block: &Block<T>) -> Result<BlockIdentity> {
    Ok(BlockIdentity {
        height: block
            .number
            .ok_or(anyhow!("Block has no number, it is still pending"))?
            .as_u64(),
        header_hash: block
            .hash
            .ok_or(anyhow!("Block has no hash, it is still pending"))?,
        parent_hash: block.parent_hash,
    })
}

/// Converts a log reported by a provider into a [LogEntry].
///
/// # Arguments
/// * `log` - The log returned by the provider.
///
/// # Returns
/// * The [LogEntry], or an error if the log is pending or was removed by a reorg.
pub fn log_entry(log: Log) -> Result<LogEntry> {
    if log.removed == Some(true) {
        return Err(anyhow!("Log was removed by a reorg"));
    }

    Ok(LogEntry {
        address: log.address,
        block_hash: log.block_hash.ok_or(anyhow!("Log has no block hash"))?,
        block_height: log
            .block_number
            .ok_or(anyhow!("Log has no block number"))?
            .as_u64(),
        log_index: log
            .log_index
            .ok_or(anyhow!("Log has no log index"))?
            .low_u64(),
        topics: log.topics,
        data: log.data,
    })
}

/// Returns the first topic of a log, if any.
pub fn first_topic(log: &LogEntry) -> Option<H256> {
    log.topics.first().copied()
}

/// Sends `item` into `tx`, giving up if the shutdown signal fires first.
///
/// # Returns
/// * `true` if the item was delivered, `false` if the receiver is gone or a shutdown was
/// requested. Either way the producer should stop.
pub async fn publish<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    shutdown: &mut broadcast::Receiver<()>,
) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.recv() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
