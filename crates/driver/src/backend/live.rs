//! The live module contains the [LiveBackend], which reaches a real ledger through an ethers
//! [Middleware].

use super::Backend;
use crate::{
    abi,
    types::{BlockIdentity, LogEntry, TxHash},
    utils,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::{
    providers::Middleware,
    types::{Address, BlockNumber, Bytes, Filter, TransactionRequest, ValueOrArray, H256, U64},
};
use rollup_challenger_protocol::bisection::ChallengeAction;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};

/// The [TxPolicy] struct holds the options every transaction is built from. Fields left unset
/// are filled in by the middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxPolicy {
    /// The sender of every transaction.
    pub from: Option<Address>,
    /// The gas limit of every transaction.
    pub gas_limit: Option<u64>,
    /// The gas price of every transaction, in wei.
    pub gas_price: Option<u64>,
}

impl TxPolicy {
    /// Builds a fresh transaction request calling `to` with `calldata`.
    pub fn request(&self, to: Address, calldata: Bytes) -> TransactionRequest {
        let mut request = TransactionRequest::new().to(to).data(calldata);
        if let Some(from) = self.from {
            request = request.from(from);
        }
        if let Some(gas_limit) = self.gas_limit {
            request = request.gas(gas_limit);
        }
        if let Some(gas_price) = self.gas_price {
            request = request.gas_price(gas_price);
        }
        request
    }
}

/// The [LiveBackend] is a [Backend] over an ethers [Middleware]. Actions are sent as raw
/// calldata transactions to the challenge contract.
pub struct LiveBackend<M> {
    /// The provider used to index blocks and logs and to send transactions.
    provider: Arc<M>,
    /// The options every transaction is built from.
    policy: TxPolicy,
    /// How long to wait between receipt polls.
    receipt_poll_interval: Duration,
    /// How many times to poll for a receipt before giving up.
    receipt_attempts: u32,
}

impl<M: Middleware + 'static> LiveBackend<M> {
    /// Creates a new [LiveBackend].
    pub fn new(provider: Arc<M>, policy: TxPolicy) -> Self {
        Self {
            provider,
            policy,
            receipt_poll_interval: Duration::from_secs(2),
            receipt_attempts: 60,
        }
    }

    /// Sets how receipts are polled for.
    pub fn with_receipt_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.receipt_poll_interval = interval;
        self.receipt_attempts = attempts;
        self
    }
}

#[async_trait]
impl<M: Middleware + 'static> Backend for LiveBackend<M> {
    async fn fetch_header(&self, height: u64) -> Result<Option<BlockIdentity>> {
        let block = self
            .provider
            .get_block(height)
            .await
            .map_err(|e| anyhow!("Failed to fetch block {}: {}", height, e))?;
        block.as_ref().map(utils::block_identity).transpose()
    }

    async fn latest_header(&self) -> Result<BlockIdentity> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| anyhow!("Failed to fetch the latest block: {}", e))?
            .ok_or(anyhow!("Provider has no latest block"))?;
        utils::block_identity(&block)
    }

    async fn fetch_logs(
        &self,
        address: Address,
        topics: &[H256],
        from: u64,
        to: u64,
    ) -> Result<Vec<LogEntry>> {
        let mut filter = Filter::new().address(address).from_block(from).to_block(to);
        if !topics.is_empty() {
            filter = filter.topic0(ValueOrArray::Array(
                topics.iter().copied().map(Some).collect(),
            ));
        }

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|e| anyhow!("Failed to fetch logs of blocks {}..={}: {}", from, to, e))?;
        let mut entries = logs
            .into_iter()
            .map(utils::log_entry)
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by_key(|log| (log.block_height, log.log_index));
        Ok(entries)
    }

    async fn submit_action(&self, address: Address, action: &ChallengeAction) -> Result<TxHash> {
        let request = self.policy.request(address, abi::encode_action(action));
        let pending = self
            .provider
            .send_transaction(request, None)
            .await
            .map_err(|e| anyhow!("Failed to send {}: {}", action.name(), e))?;
        let tx = pending.tx_hash();
        tracing::info!(target: "live-backend", "Sent {} to {:?}, tx hash: {:?}", action.name(), address, tx);
        Ok(tx)
    }

    async fn wait_for_receipt(&self, tx: TxHash) -> Result<bool> {
        for _ in 0..self.receipt_attempts {
            let receipt = self
                .provider
                .get_transaction_receipt(tx)
                .await
                .map_err(|e| anyhow!("Failed to fetch receipt of {:?}: {}", tx, e))?;
            if let Some(receipt) = receipt {
                return Ok(receipt.status == Some(U64::one()));
            }
            tokio::time::sleep(self.receipt_poll_interval).await;
        }

        Err(anyhow!(
            "No receipt for {:?} after {} attempts",
            tx,
            self.receipt_attempts
        ))
    }
}
