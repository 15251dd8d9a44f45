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

/// EIP-1559 pricing policy: tip/cap pair driven by `eth_feeHistory`.
pub struct AttemptManagerV2<P: JsonRpcClient> {
    eth: Arc<Eth<P>>,
    storage: AttemptStorage,
    source: Address,
    current: Option<Attempt>,
    base_waiting_time: u64,
    min_priority_fee: u128,
    fee_inc_percent: u128,
    min_fee_inc: u128,
    max_fee: u128,
    base_fee_adjustment_percent: u128,
    hard_replace_start_index: u32,
    hard_replace_tip_offset: u128,
}

impl<P: JsonRpcClient + 'static> AttemptManagerV2<P> {
    pub fn new(eth: Arc<Eth<P>>, storage: AttemptStorage, source: Address, config: &Config) -> Self {
        Self {
            eth,
            storage,
            source,
            current: None,
            base_waiting_time: config.base_waiting_time,
            min_priority_fee: u128::from(config.min_priority_fee),
            fee_inc_percent: u128::from(config.fee_inc_percent),
            min_fee_inc: u128::from(config.min_fee_inc_percent),
            max_fee: u128::from(config.max_fee_value),
            base_fee_adjustment_percent: u128::from(config.base_fee_adjustment_percent),
            hard_replace_start_index: config.hard_replace_start_index,
            hard_replace_tip_offset: u128::from(config.hard_replace_tip_offset),
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

    /// Bump with an absolute floor so tiny fees still make progress despite
    /// integer percent rounding.
    fn bump(&self, value: u128, inc_percent: u128) -> u128 {
        (value * (100 + inc_percent) / 100).max(value + self.min_fee_inc)
    }

    fn clamp(&self, value: u128) -> u128 {
        if value > self.max_fee {
            warn!(
                value,
                max = self.max_fee,
                "Fee is not allowed, saturating at the ceiling"
            );
            return self.max_fee;
        }
        value
    }

    pub async fn make(&mut self, tx: &mut Tx) -> Result<(), AttemptError> {
        let nonce = self.eth.nonce(self.source).await?;
        let estimate = self.eth.fee_estimate().await?;
        info!(
            nonce,
            base_fee = estimate.base_fee,
            percentile_tip = estimate.percentile_tip,
            "Fetched chain state for the attempt"
        );

        let last = self.current.as_ref();
        let (tip, cap, index) = match last {
            // Same nonce slot: escalate the previous pair, floored by what
            // the market currently asks.
            Some(last) if last.fee.is_dynamic() && nonce <= last.nonce => {
                let last_tip = last.fee.max_priority_fee_per_gas.unwrap_or(0);
                let last_cap = last.fee.max_fee_per_gas.unwrap_or(0);
                let tip = self.clamp(
                    self.bump(last_tip, self.fee_inc_percent)
                        .max(estimate.percentile_tip),
                );
                let cap = self.clamp(
                    self.bump(last_cap, self.fee_inc_percent)
                        .max(estimate.base_fee),
                );
                (tip, cap, last.index + 1)
            }
            // Fresh slot: tip from the reward percentile, cap with headroom
            // over the base fee.
            _ => {
                let tip = self.clamp(self.min_priority_fee.max(estimate.percentile_tip));
                let cap = self.clamp(
                    (100 + self.base_fee_adjustment_percent) * tip.max(estimate.base_fee) / 100,
                );
                (tip, cap, 1)
            }
        };

        let wait_time = next_waiting_time(self.base_waiting_time, index);
        let fee = Fee::dynamic(tip, cap);

        tx.source = Some(self.source);
        tx.nonce = Some(nonce);
        tx.set_fee(fee);
        let gas = resolve_gas(&self.eth, self.source, tx, cap).await?;
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

    pub fn replace(&mut self, tx: &mut Tx, replace_attempt: u32) -> Result<(), AttemptError> {
        let (tip, cap) = {
            let current = self.current.as_ref().ok_or(NoCurrentAttemptError)?;
            let tip = current
                .fee
                .max_priority_fee_per_gas
                .ok_or(NoCurrentAttemptError)?;
            let cap = current.fee.max_fee_per_gas.ok_or(NoCurrentAttemptError)?;
            (tip, cap)
        };

        let hard_replace = replace_attempt >= self.hard_replace_start_index
            && cap > tip
            && cap - tip > self.hard_replace_tip_offset;
        let (next_tip, next_cap) = if hard_replace {
            // Emulate a legacy transaction to dislodge a stuck legacy
            // predecessor occupying the mempool slot.
            warn!(
                replace_attempt,
                "Collapsing tip towards the cap to force a replacement"
            );
            (cap - self.hard_replace_tip_offset, cap)
        } else {
            let next_tip = self.bump(tip, self.min_fee_inc);
            let next_cap = self.bump(cap, self.min_fee_inc);
            if next_tip > self.max_fee || next_cap > self.max_fee {
                warn!(
                    next_tip,
                    next_cap,
                    max = self.max_fee,
                    "Replacement fee is not allowed, saturating at the ceiling"
                );
            }
            (next_tip.min(self.max_fee), next_cap.min(self.max_fee))
        };

        let fee = Fee::dynamic(next_tip, next_cap);
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
    use ethers::types::{FeeHistory, U256};

    use crate::store::MemoryStore;
    use crate::transaction::TxStatus;

    const SOURCE: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";

    const BASE_FEE: u64 = 100_000_000_000;
    const P50_REWARD: u64 = 100_000_000;
    const P60_REWARD: u64 = 1_000_000_000;

    async fn manager(config: &Config) -> (AttemptManagerV2<MockProvider>, MockProvider) {
        let (provider, mock) = Provider::mocked();
        mock.push(U256::from(31337u64)).unwrap();
        let eth = Arc::new(Eth::new(provider, config).await.unwrap());
        let storage = AttemptStorage::new(Arc::new(MemoryStore::new()));
        (
            AttemptManagerV2::new(eth, storage, SOURCE.parse().unwrap(), config),
            mock,
        )
    }

    fn fee_history(base_fee: u64, rewards: &[u64]) -> FeeHistory {
        FeeHistory {
            base_fee_per_gas: vec![U256::from(base_fee) / 10, U256::from(base_fee)],
            gas_used_ratio: vec![0.5],
            oldest_block: U256::from(1u64),
            reward: vec![rewards.iter().map(|r| U256::from(*r)).collect()],
        }
    }

    /// Queue responses for one `make`: nonce, then the fee history.
    fn push_chain_state(mock: &MockProvider, nonce: u64) {
        // LIFO: the fee history is fetched second.
        mock.push(fee_history(BASE_FEE, &[P50_REWARD, P60_REWARD]))
            .unwrap();
        mock.push(U256::from(nonce)).unwrap();
    }

    fn tx(gas: Option<u64>) -> Tx {
        Tx {
            tx_id: "tx-a".to_string(),
            status: TxStatus::Seen,
            score: 0,
            to: SOURCE.parse().unwrap(),
            value: 1,
            source: None,
            nonce: None,
            chain_id: None,
            gas,
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

    #[tokio::test]
    async fn initial_fee_from_history() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;
        push_chain_state(&mock, 3);

        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();

        let attempt = manager.current().unwrap();
        assert_eq!(attempt.index, 1);
        assert_eq!(attempt.nonce, 3);
        // Tip is the target-percentile reward, above the configured floor.
        assert_eq!(
            attempt.fee.max_priority_fee_per_gas,
            Some(u128::from(P60_REWARD))
        );
        // Cap is 150% of the estimated base fee.
        assert_eq!(
            attempt.fee.max_fee_per_gas,
            Some(u128::from(BASE_FEE) * 150 / 100)
        );
        assert_eq!(tx.fee(), attempt.fee);
        assert_eq!(tx.nonce, Some(3));
    }

    #[tokio::test]
    async fn floor_on_the_priority_fee_applies() {
        let mut config = Config::for_tests();
        config.min_priority_fee = 2_000_000_000;
        let (mut manager, mock) = manager(&config).await;
        push_chain_state(&mock, 3);

        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();

        // The floor dominates the percentile reward.
        assert_eq!(
            manager.current().unwrap().fee.max_priority_fee_per_gas,
            Some(2_000_000_000)
        );
    }

    #[tokio::test]
    async fn iterative_attempts_escalate_and_saturate() {
        let mut config = Config::for_tests();
        config.max_fee_value = 280_000_000_000;
        let (mut manager, mock) = manager(&config).await;

        let mut expected_tip = u128::from(P60_REWARD);
        let mut expected_cap = u128::from(BASE_FEE) * 150 / 100;

        for _ in 0..6 {
            push_chain_state(&mock, 3);
            let mut tx = tx(None);
            manager.make(&mut tx).await.unwrap();
            assert_eq!(tx.fee().max_priority_fee_per_gas, Some(expected_tip));
            assert_eq!(tx.fee().max_fee_per_gas, Some(expected_cap));
            expected_tip = expected_tip * 112 / 100;
            expected_cap = expected_cap * 112 / 100;
        }

        // The seventh attempt pushes the cap over the ceiling.
        push_chain_state(&mock, 3);
        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();
        assert_eq!(tx.fee().max_priority_fee_per_gas, Some(expected_tip));
        assert_eq!(tx.fee().max_fee_per_gas, Some(280_000_000_000));
        assert_eq!(manager.current().unwrap().index, 7);
    }

    #[tokio::test]
    async fn advanced_nonce_resets_the_sequence() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 3);
        manager.make(&mut tx(None)).await.unwrap();

        push_chain_state(&mock, 3);
        manager.make(&mut tx(None)).await.unwrap();
        assert_eq!(manager.current().unwrap().index, 2);

        // The slot cleared: a different transaction occupied the nonce.
        push_chain_state(&mock, 4);
        let mut fresh = tx(None);
        manager.make(&mut fresh).await.unwrap();

        let attempt = manager.current().unwrap();
        assert_eq!(attempt.index, 1);
        assert_eq!(attempt.nonce, 4);
        assert_eq!(
            attempt.fee.max_priority_fee_per_gas,
            Some(u128::from(P60_REWARD))
        );
    }

    #[tokio::test]
    async fn replace_bumps_minimally() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 3);
        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();

        let err = {
            let mut fresh_manager =
                AttemptManagerV2::new(manager.eth.clone(), manager.storage.clone(), manager.source, &config);
            fresh_manager.replace(&mut tx, 0).unwrap_err()
        };
        assert!(matches!(err, AttemptError::NoCurrentAttempt(_)));

        manager.replace(&mut tx, 0).unwrap();
        let attempt = manager.current().unwrap();
        // +5%
        assert_eq!(
            attempt.fee.max_priority_fee_per_gas,
            Some(u128::from(P60_REWARD) * 105 / 100)
        );
        assert_eq!(
            attempt.fee.max_fee_per_gas,
            Some(u128::from(BASE_FEE) * 150 / 100 * 105 / 100)
        );
        assert_eq!(tx.fee(), attempt.fee);
    }

    #[tokio::test]
    async fn replace_saturates_at_the_ceiling() {
        let config = Config::for_tests();
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 3);
        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();

        let max = u128::from(config.max_fee_value);
        if let Some(current) = manager.current.as_mut() {
            current.fee = Fee::dynamic(max - 1, max - 1);
        }
        manager.replace(&mut tx, 0).unwrap();
        assert_eq!(tx.fee().max_priority_fee_per_gas, Some(max));
        assert_eq!(tx.fee().max_fee_per_gas, Some(max));
    }

    #[tokio::test]
    async fn hard_replace_collapses_tip_to_the_cap() {
        let mut config = Config::for_tests();
        config.hard_replace_start_index = 2;
        let (mut manager, mock) = manager(&config).await;

        push_chain_state(&mock, 3);
        let mut tx = tx(None);
        manager.make(&mut tx).await.unwrap();

        manager.replace(&mut tx, 2).unwrap();
        let attempt = manager.current().unwrap();
        let cap = attempt.fee.max_fee_per_gas.unwrap();
        assert_eq!(
            attempt.fee.max_priority_fee_per_gas,
            Some(cap - u128::from(config.hard_replace_tip_offset))
        );
    }

    #[tokio::test]
    async fn oversized_gas_hint_downgrades_when_balance_is_short() {
        let mut config = Config::for_tests();
        config.min_priority_fee = 1;
        let (mut manager, mock) = manager(&config).await;

        // LIFO: balance is fetched last, after nonce and fee history.
        mock.push(U256::from(1_000u64)).unwrap();
        mock.push(fee_history(BASE_FEE, &[P50_REWARD, P60_REWARD]))
            .unwrap();
        mock.push(U256::from(3u64)).unwrap();

        // A sub-1 multiplier makes the hint dominate the sized estimate.
        let mut tx = tx(Some(5_000_000));
        tx.multiplier = Some(0.5);
        manager.make(&mut tx).await.unwrap();

        // The hint would cost gas * cap, far past the 1000 wei balance:
        // the estimate wins.
        assert_eq!(tx.gas, Some(2_500_000));
    }
}
