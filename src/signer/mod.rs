use std::sync::Arc;

use async_trait::async_trait;
use ethers::signers::WalletError;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature};
use thiserror::Error;
use tracing::info;

use crate::config::Config;

mod local;
mod sgx;

pub use local::LocalSigner;
pub use sgx::SgxSigner;

#[derive(Debug, Error)]
pub enum SignerError {
    /// Transient: the signing service could not be reached. Worth retrying
    /// on a later pass.
    #[error("signer unreachable: {0}")]
    Unreachable(String),

    /// The signer answered and refused; this envelope will never sign.
    #[error("signer rejected the request: {0}")]
    Rejected(String),

    #[error("local wallet failure: {0}")]
    Wallet(#[from] WalletError),
}

/// "Try again later" vs. "give up on this envelope".
#[must_use]
pub fn is_signer_unreachable(err: &SignerError) -> bool {
    matches!(err, SignerError::Unreachable(_))
}

/// Deterministic signing of a wire envelope. Both the software key and the
/// remote enclave signer live behind this one contract; the processor does
/// not care which it holds.
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, SignerError>;
}

/// Pick the signer from the environment: `SGX_URL` wins, `ETH_PRIVATE_KEY`
/// is the fallback. Config validation guarantees one of them is present.
pub async fn init_signer(config: &Config, chain_id: u64) -> anyhow::Result<Arc<dyn TxSigner>> {
    if let Some(sgx_url) = &config.sgx_url {
        info!("Initializing remote signer");
        let signer = SgxSigner::connect(sgx_url, &config.node_data_path, chain_id).await?;
        return Ok(Arc::new(signer));
    }
    if let Some(key) = &config.eth_private_key {
        info!("Initializing software-key signer");
        let signer = LocalSigner::new(key.expose(), chain_id)?;
        return Ok(Arc::new(signer));
    }
    anyhow::bail!("either SGX_URL or ETH_PRIVATE_KEY must be set");
}
