use std::time::Duration;

use ethers::providers::{
    Http, JsonRpcClient, JsonRpcError, Middleware, Provider, ProviderError, RpcError as _,
};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Eip1559TransactionRequest, TransactionRequest, H256,
    U256,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::transaction::Tx;

const PENDING: Option<BlockId> = Some(BlockId::Number(BlockNumber::Pending));

/// Poll interval of the receipt and block waits.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EthError {
    #[error("gas estimation reverted: {0}")]
    EstimateGasRevert(String),

    #[error("{amount} blocks have not been mined within {seconds}s")]
    BlockTimeout { amount: u64, seconds: u64 },

    #[error("no receipt for {hash:?} within {seconds}s")]
    ReceiptTimeout { hash: H256, seconds: u64 },

    #[error("fee history came back empty")]
    EmptyFeeHistory,

    #[error("could not read the latest block")]
    MissingBlock,

    #[error(transparent)]
    Rpc(#[from] ProviderError),
}

/// Classifiers over the raw node error. Pure functions of the payload so
/// they can be pinned down with fixed fixtures.
#[must_use]
pub fn is_replacement_underpriced(err: &JsonRpcError) -> bool {
    err.message.contains("replacement transaction underpriced")
}

#[must_use]
pub fn is_nonce_too_low(err: &JsonRpcError) -> bool {
    err.message.contains("nonce too low") || err.message.contains("invalid nonce")
}

#[must_use]
pub fn is_estimate_gas_revert(err: &JsonRpcError) -> bool {
    // -32601/-32603 are what nodes answer for contract-logic failures during
    // estimation; 3 is the standardized revert code.
    matches!(err.code, -32601 | -32603 | 3) || err.message.starts_with("execution reverted")
}

/// The JSON-RPC payload inside a provider error, when there is one.
#[must_use]
pub fn rpc_error(err: &ProviderError) -> Option<&JsonRpcError> {
    err.as_error_response()
}

/// Base fee and reward read out of `eth_feeHistory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    /// Last `baseFeePerGas` entry, i.e. the upcoming block's base fee.
    pub base_fee: u128,
    /// Reward at the target percentile of the last block.
    pub percentile_tip: u128,
}

/// Thin facade over the JSON-RPC node.
///
/// Generic over the transport so tests can drive it with a mock client.
pub struct Eth<P: JsonRpcClient> {
    provider: Provider<P>,
    chain_id: u64,
    avg_gas_price_inc_percent: u128,
    target_reward_percentile: f64,
    disable_gas_estimation: bool,
    default_gas_limit: u64,
    gas_multiplier: f64,
}

impl Eth<Http> {
    #[instrument(name = "Eth::connect", level = "debug", skip_all)]
    pub async fn connect(config: &Config) -> Result<Self, EthError> {
        info!(endpoint = %config.endpoint, "Connecting to Ethereum");
        let provider = Provider::new(Http::new(config.endpoint.expose().clone()));
        Self::new(provider, config).await
    }
}

impl<P: JsonRpcClient + 'static> Eth<P> {
    pub async fn new(provider: Provider<P>, config: &Config) -> Result<Self, EthError> {
        let chain_id = provider.get_chainid().await?.as_u64();
        Ok(Self {
            provider,
            chain_id,
            avg_gas_price_inc_percent: config.avg_gas_price_inc_percent as u128,
            target_reward_percentile: config.target_reward_percentile as f64,
            disable_gas_estimation: config.disable_gas_estimation,
            default_gas_limit: config.default_gas_limit,
            gas_multiplier: config.gas_multiplier,
        })
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Whether the node serves `eth_feeHistory`; decides the pricing policy.
    pub async fn supports_eip1559(&self) -> bool {
        self.provider
            .fee_history(1u64, BlockNumber::Latest, &[])
            .await
            .is_ok()
    }

    /// Pending transaction count, so queued mempool entries are included.
    pub async fn nonce(&self, address: Address) -> Result<u64, EthError> {
        let count = self
            .provider
            .get_transaction_count(address, PENDING)
            .await?;
        Ok(count.as_u64())
    }

    pub async fn balance(&self, address: Address) -> Result<u128, EthError> {
        let balance = self.provider.get_balance(address, None).await?;
        Ok(balance.as_u128())
    }

    pub async fn block_number(&self) -> Result<u64, EthError> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    pub async fn block_gas_limit(&self) -> Result<u64, EthError> {
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await?
            .ok_or(EthError::MissingBlock)?;
        Ok(block.gas_limit.as_u64())
    }

    /// The node's gas price suggestion with the configured markup.
    pub async fn avg_gas_price(&self) -> Result<u128, EthError> {
        let suggested = self.provider.get_gas_price().await?.as_u128();
        Ok(suggested * (100 + self.avg_gas_price_inc_percent) / 100)
    }

    /// Base fee and target-percentile reward of the last block.
    pub async fn fee_estimate(&self) -> Result<FeeEstimate, EthError> {
        let history = self
            .provider
            .fee_history(
                1u64,
                BlockNumber::Latest,
                &[50.0, self.target_reward_percentile],
            )
            .await?;
        let base_fee = history
            .base_fee_per_gas
            .last()
            .ok_or(EthError::EmptyFeeHistory)?
            .as_u128();
        let percentile_tip = history
            .reward
            .first()
            .and_then(|rewards| rewards.get(1))
            .ok_or(EthError::EmptyFeeHistory)?
            .as_u128();
        Ok(FeeEstimate {
            base_fee,
            percentile_tip,
        })
    }

    /// Gas for the attempt: estimate with the tx multiplier applied, clamped
    /// to the block gas limit. With estimation disabled, size from the hint
    /// (or the default limit) instead of asking the node.
    pub async fn calculate_gas(&self, tx: &Tx) -> Result<u64, EthError> {
        let multiplier = tx.multiplier.unwrap_or(self.gas_multiplier);
        if self.disable_gas_estimation {
            let base = tx.gas.unwrap_or(self.default_gas_limit);
            return Ok((base as f64 * multiplier) as u64);
        }

        let envelope = self.convert_tx(tx);
        let estimated = match self.provider.estimate_gas(&envelope, None).await {
            Ok(estimated) => estimated.as_u64(),
            Err(err) => {
                if let Some(rpc) = rpc_error(&err) {
                    if is_estimate_gas_revert(rpc) {
                        return Err(EthError::EstimateGasRevert(rpc.message.clone()));
                    }
                }
                return Err(err.into());
            }
        };

        let gas = (estimated as f64 * multiplier) as u64;
        let limit = self.block_gas_limit().await?;
        if gas > limit {
            warn!(gas, limit, "Estimated gas exceeds the block limit, clamping");
            return Ok(limit);
        }
        Ok(gas)
    }

    /// Submit raw bytes. Errors propagate untouched; the caller classifies.
    pub async fn send_tx(&self, raw: Bytes) -> Result<H256, EthError> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(pending.tx_hash())
    }

    /// Receipt status: -1 when there is no receipt yet, otherwise 0/1.
    pub async fn get_status(&self, hash: H256) -> Result<i64, EthError> {
        let Some(receipt) = self.provider.get_transaction_receipt(hash).await? else {
            return Ok(-1);
        };
        debug!(?hash, ?receipt.status, "Fetched receipt");
        Ok(receipt
            .status
            .map_or(-1, |status| status.as_u64() as i64))
    }

    /// Wait until `amount` further blocks have been mined.
    pub async fn wait_for_blocks(&self, amount: u64, max_time: Duration) -> Result<(), EthError> {
        if amount == 0 {
            return Ok(());
        }
        let start_block = self.block_number().await?;
        let deadline = tokio::time::Instant::now() + max_time;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let current = self.block_number().await?;
            if current.saturating_sub(start_block) >= amount {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EthError::BlockTimeout {
                    amount,
                    seconds: max_time.as_secs(),
                });
            }
        }
    }

    /// Poll for a receipt until the window closes.
    pub async fn wait_for_receipt(&self, hash: H256, max_time: Duration) -> Result<i64, EthError> {
        let deadline = tokio::time::Instant::now() + max_time;
        loop {
            let status = self.get_status(hash).await?;
            if status >= 0 {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EthError::ReceiptTimeout {
                    hash,
                    seconds: max_time.as_secs(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Build the wire envelope: legacy when only a gas price is set,
    /// EIP-1559 when a tip/cap pair is. Unset fields are left out.
    #[must_use]
    pub fn convert_tx(&self, tx: &Tx) -> TypedTransaction {
        let fee = tx.fee();
        if fee.is_dynamic() {
            let mut request = Eip1559TransactionRequest::new()
                .to(tx.to)
                .value(U256::from(tx.value))
                .chain_id(tx.chain_id.unwrap_or(self.chain_id));
            if let Some(tip) = fee.max_priority_fee_per_gas {
                request = request.max_priority_fee_per_gas(U256::from(tip));
            }
            if let Some(cap) = fee.max_fee_per_gas {
                request = request.max_fee_per_gas(U256::from(cap));
            }
            if let Some(nonce) = tx.nonce {
                request = request.nonce(nonce);
            }
            if let Some(gas) = tx.gas {
                request = request.gas(gas);
            }
            if let Some(data) = &tx.data {
                request = request.data(data.clone());
            }
            TypedTransaction::Eip1559(request)
        } else {
            let mut request = TransactionRequest::new()
                .to(tx.to)
                .value(U256::from(tx.value))
                .chain_id(tx.chain_id.unwrap_or(self.chain_id));
            if let Some(gas_price) = fee.gas_price {
                request = request.gas_price(U256::from(gas_price));
            }
            if let Some(nonce) = tx.nonce {
                request = request.nonce(nonce);
            }
            if let Some(gas) = tx.gas {
                request = request.gas(gas);
            }
            if let Some(data) = &tx.data {
                request = request.data(data.clone());
            }
            TypedTransaction::Legacy(request)
        }
    }
}
