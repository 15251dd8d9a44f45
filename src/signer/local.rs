use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer as _, WalletError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature};
use tracing::debug;

use super::{SignerError, TxSigner};

/// Stateless software-key signer; the address is derived from the key.
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    pub fn new(private_key: &str, chain_id: u64) -> Result<Self, WalletError> {
        let wallet: LocalWallet = private_key.trim_start_matches("0x").parse()?;
        let wallet = wallet.with_chain_id(chain_id);
        debug!(address = ?wallet.address(), "Loaded software key");
        Ok(Self { wallet })
    }
}

#[async_trait]
impl TxSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, SignerError> {
        Ok(self.wallet.sign_transaction(tx).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    const TEST_KEY: &str = "ee79b5f6e221356af78cf4c36f4f7885a11b67dfcc81c34d80249947330c0f82";

    #[test]
    fn address_is_stable() {
        let a = LocalSigner::new(TEST_KEY, 1).unwrap();
        let b = LocalSigner::new(&format!("0x{TEST_KEY}"), 1).unwrap();
        assert_eq!(a.address(), b.address());
    }

    #[tokio::test]
    async fn signature_recovers_to_sender() {
        let signer = LocalSigner::new(TEST_KEY, 31337).unwrap();
        let tx: TypedTransaction = TransactionRequest::new()
            .to(signer.address())
            .value(1u64)
            .gas(21_000u64)
            .gas_price(1_000_000_000u64)
            .nonce(0u64)
            .chain_id(31337u64)
            .into();

        let signature = signer.sign(&tx).await.unwrap();
        let recovered = signature.recover(tx.sighash()).unwrap();
        assert_eq!(recovered, signer.address());
    }
}
