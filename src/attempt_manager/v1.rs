use ethers::providers::JsonRpcClient;
use ethers::types::Address;
use std::sync::Arc;
use tracing::{info, warn};

use crate::attempt::Attempt;
use crate::config::Config;
use crate::ethereum::Eth;
use crate::store::StoreError;
use crate::transaction::{Fee, Tx};

use super::storage::AttemptStorage;
use super::{next_waiting_time, resolve_gas, AttemptError, NoCurrentAttemptError};

/// Legacy pricing policy: a single gas price, escalated between attempts.
pub struct AttemptManagerV1<P: JsonRpcClient> {
    eth: Arc<Eth<P>>,
    storage: AttemptStorage,
    source: Address,
    current: Option<Attempt>,
    max_gas_price: u128,
    base_waiting_time: u64,
    min_gas_price_inc: u128,
    gas_price_inc_percent: u128,
    grad_gas_price_inc_percent: u128,
}

impl<P: JsonRpcClient + 'static> AttemptManagerV1<P> {
    pub fn new(eth: Arc<Eth<P>>, storage: AttemptStorage, source: Address, config: &Config) -> Self {
        Self {
            eth,
            storage,
            source,
            current: None,
            max_gas_price: u128::from(config.max_gas_price),
            base_waiting_time: config.base_waiting_time,
            min_gas_price_inc: u128::from(config.min_gas_price_inc_percent),
            gas_price_inc_percent: u128::from(config.gas_price_inc_percent),
            grad_gas_price_inc_percent: u128::from(config.grad_gas_price_inc_percent),
        }
    }

    pub fn current(&self) -> Option<&Attempt> {
        self.current.as_ref()
    }

    pub async fn fetch(&mut self) -> Result<(), StoreError> {
        self.current = self.storage.get().await?;
        Ok(())
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        match &self.current {
            Some(attempt) => self.storage.save(attempt).await,
            None => Ok(()),
        }
    }

    /// Bump with an absolute floor so tiny prices still make progress
    /// despite integer percent rounding.
    fn inc_gas_price(&self, gas_price: u128, inc_percent: u128) -> u128 {
        (gas_price * (100 + inc_percent) / 100).max(gas_price + self.min_gas_price_inc)
    }

    fn capped(&self, gas_price: u128) -> u128 {
        if gas_price > self.max_gas_price {
            warn!(
                gas_price,
                max = self.max_gas_price,
                "Next gas price is not allowed, saturating at the ceiling"
            );
            return self.max_gas_price;
        }
        gas_price
    }

    pub async fn make(&mut self, tx: &mut Tx) -> Result<(), AttemptError> {
        let nonce = self.eth.nonce(self.source).await?;
        let avg_gas_price = self.eth.avg_gas_price().await?;
        info!(nonce, avg_gas_price, "Fetched chain state for the attempt");

        let last = self.current.as_ref();
        let (gas_price, index) = match last {
            // Same nonce slot: escalate over the previous attempt, floored
            // by the market price.
            Some(last) if last.fee.gas_price.is_some() && nonce <= last.nonce => {
                let bumped = self.inc_gas_price(
                    last.fee.gas_price.unwrap_or(avg_gas_price),
                    self.gas_price_inc_percent,
                );
                (self.capped(bumped.max(avg_gas_price)), last.index + 1)
            }
            // The previous slot cleared (or there is none): fresh attempt
            // at the market price.
            _ => (self.capped(avg_gas_price), 1),
        };

        let wait_time = next_waiting_time(self.base_waiting_time, index);
        let fee = Fee::legacy(gas_price);

        tx.source = Some(self.source);
        tx.nonce = Some(nonce);
        tx.set_fee(fee);
        let gas = resolve_gas(&self.eth, self.source, tx, gas_price).await?;
        tx.gas = Some(gas);

        self.current = Some(Attempt {
            tx_id: tx.tx_id.clone(),
            nonce,
            index,
            fee,
            wait_time,
            gas,
        });
        Ok(())
    }

    pub fn replace(&mut self, tx: &mut Tx, _replace_attempt: u32) -> Result<(), AttemptError> {
        let gas_price = self
            .current
            .as_ref()
            .ok_or(NoCurrentAttemptError)?
            .fee
            .gas_price
            .ok_or(NoCurrentAttemptError)?;

        let bumped = self.inc_gas_price(gas_price, self.grad_gas_price_inc_percent);
        let next = if bumped > self.max_gas_price {
            warn!(
                bumped,
                max = self.max_gas_price,
                "Replacement gas price is not allowed, saturating at the ceiling"
            );
            self.max_gas_price
        } else {
            bumped
        };

        let fee = Fee::legacy(next);
        let current = self.current.as_mut().ok_or(NoCurrentAttemptError)?;
        current.fee = fee;
        tx.set_fee(fee);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::providers::{MockProvider, Provider};
    use ethers::types::U256;

    use crate::store::MemoryStore;
    use crate::transaction::TxStatus;

    const SOURCE: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

    async fn manager(config: &Config) -> (AttemptManagerV1<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        mock.push(U256::from(31337u64)).unwrap();
        let eth = Arc::new(Eth::new(provider, config).await.unwrap());
        let storage = AttemptStorage::new(Arc::new(MemoryStore::new()));
        (
            AttemptManagerV1::new(eth, storage, SOURCE.parse().unwrap(), config),
            mock,
        )
    }

    fn tx() -> Tx {
        Tx {
            tx_id: "tx-1".to_string(),
            status: TxStatus::Seen,
            score: 0,
            to: SOURCE.parse().unwrap(),
            value: 1,
            source: None,
            nonce: None,
            chain_id: None,
            gas: None,
            data: None,
            multiplier: None,
            attempts: 1,
            tx_hash: None,
            hashes: vec![],
            sent_ts: None,
            method: None,
            meta: None,
            gas_price: None,
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }

    /// Queue responses for one `make`: nonce, then the node gas price.
    fn push_chain_state(mock: &MockProvider, nonce: u64, node_gas_price: u64) {
        // LIFO: the gas price is fetched second.
        mock.push(U256::from(node_gas_price)).unwrap();
        mock.push(U256::from(nonce)).unwrap();
    }

    #[tokio::test]
    async fn first_attempt_uses_average_price() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;
        push_chain_state(&mock, 5, 1_000_000_000);

        let mut tx = tx();
        manager.make(&mut tx).await.unwrap();

        let attempt = manager.current().unwrap();
        assert_eq!(attempt.index, 1);
        assert_eq!(attempt.nonce, 5);
        // node price +50%
        assert_eq!(attempt.fee.gas_price, Some(1_500_000_000));
        assert_eq!(tx.nonce, Some(5));
        assert_eq!(tx.fee().gas_price, Some(1_500_000_000));
        assert_eq!(attempt.wait_time, 10);
        // disabled estimation: default limit * multiplier
        assert_eq!(tx.gas, Some(1_200_000));
    }

    #[tokio::test]
    async fn same_nonce_escalates_and_floors_at_market() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 5, 1_000_000_000);
        let mut first = tx();
        manager.make(&mut first).await.unwrap();

        // Same nonce, market dropped: escalation (+10%) dominates.
        push_chain_state(&mock, 5, 100);
        let mut second = tx();
        manager.make(&mut second).await.unwrap();

        let attempt = manager.current().unwrap();
        assert_eq!(attempt.index, 2);
        assert_eq!(attempt.fee.gas_price, Some(1_650_000_000));
        assert_eq!(attempt.wait_time, 40);
    }

    #[tokio::test]
    async fn advanced_nonce_resets_the_sequence() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 5, 1_000_000_000);
        manager.make(&mut tx()).await.unwrap();

        // Another transaction took the slot: nonce moved past the attempt.
        push_chain_state(&mock, 6, 2_000_000_000);
        let mut next = tx();
        manager.make(&mut next).await.unwrap();

        let attempt = manager.current().unwrap();
        assert_eq!(attempt.index, 1);
        assert_eq!(attempt.nonce, 6);
        assert_eq!(attempt.fee.gas_price, Some(3_000_000_000));
    }

    #[tokio::test]
    async fn escalation_saturates_at_the_ceiling() {
        let mut config = Config::for_tests();
        config.max_gas_price = 1_600_000_000;
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 5, 1_000_000_000);
        manager.make(&mut tx()).await.unwrap();
        assert_eq!(manager.current().unwrap().fee.gas_price, Some(1_500_000_000));

        push_chain_state(&mock, 5, 1_000_000_000);
        let mut second = tx();
        manager.make(&mut second).await.unwrap();
        // +10% would be 1.65 gwei; the ceiling wins.
        assert_eq!(manager.current().unwrap().fee.gas_price, Some(1_600_000_000));
    }

    #[tokio::test]
    async fn replace_bumps_gradually_without_advancing_index() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 5, 1_000_000_000);
        let mut tx = tx();
        manager.make(&mut tx).await.unwrap();

        manager.replace(&mut tx, 0).unwrap();
        let attempt = manager.current().unwrap();
        // +2%
        assert_eq!(attempt.fee.gas_price, Some(1_530_000_000));
        assert_eq!(tx.fee().gas_price, Some(1_530_000_000));
        assert_eq!(attempt.index, 1);
    }

    #[tokio::test]
    async fn replace_without_attempt_fails() {
        let config = Config::for_tests();
        let (mut manager, _mock) = manager(&config).await;
        let err = manager.replace(&mut tx(), 0).unwrap_err();
        assert!(matches!(err, AttemptError::NoCurrentAttempt(_)));
    }

    #[tokio::test]
    async fn fetch_and_save_round_trip() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 5, 1_000_000_000);
        manager.make(&mut tx()).await.unwrap();
        manager.save().await.unwrap();

        let made = manager.current().cloned();
        manager.current = None;
        manager.fetch().await.unwrap();
        assert_eq!(manager.current().cloned(), made);
    }
}
