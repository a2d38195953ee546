//! The backend module holds the [Backend] trait, the capability interface through which the
//! tracker, the watchers and the challenge session reach the base ledger.

use crate::types::{BlockIdentity, LogEntry, TxHash};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use rollup_challenger_protocol::bisection::ChallengeAction;

mod live;
pub use live::{LiveBackend, TxPolicy};

mod sim;
pub use sim::SimBackend;

/// The [Backend] trait abstracts over the ledger a challenger runs against.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch the header of the block at `height`.
    ///
    /// ### Returns
    /// - `Ok(Some(BlockIdentity))`: The block exists.
    /// - `Ok(None)`: The ledger has not produced a block at `height` yet.
    /// - `Err(anyhow::Error)`: The header could not be fetched.
    async fn fetch_header(&self, height: u64) -> Result<Option<BlockIdentity>>;

    /// Fetch the header of the latest block.
    async fn latest_header(&self) -> Result<BlockIdentity>;

    /// Fetch the logs emitted by `address` in blocks `from..=to` whose first topic is one of
    /// `topics`, ordered by block height and log index.
    async fn fetch_logs(
        &self,
        address: Address,
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>>;

    /// Submit an action to the challenge contract at `address`.
    ///
    /// ### Returns
    /// - `Ok(TxHash)`: The action was accepted for inclusion.
    /// - `Err(anyhow::Error)`: The action could not be sent.
    async fn submit_action(&self, address: Address, action: &ChallengeAction) -> Result<TxHash>;

    /// Wait until the transaction `tx` is included.
    ///
    /// ### Returns
    /// - `Ok(bool)`: Whether or not the transaction succeeded.
    /// - `Err(anyhow::Error)`: The receipt could not be retrieved.
    async fn wait_for_receipt(&self, tx: TxHash) -> Result<bool>;

    /// Fetch the identity of the latest block.
    async fn current_block_identity(&self) -> Result<BlockIdentity> {
        self.latest_header().await
    }

    /// Fetch the identity of the block at `height`, failing if it does not exist yet.
    async fn block_identity_for_height(&self, height: u64) -> Result<BlockIdentity> {
        self.fetch_header(height)
            .await?
            .ok_or(anyhow!("Block {} not found", height))
    }

    /// Submit an action and wait for its receipt.
    async fn submit_and_wait(&self, address: Address, action: &ChallengeAction) -> Result<(TxHash, bool)> {
        let tx = self.submit_action(address, action).await?;
        let success = self.wait_for_receipt(tx).await?;
        Ok((tx, success))
    }
}
