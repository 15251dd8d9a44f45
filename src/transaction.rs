use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised when a stored record cannot be decoded.
#[derive(Debug, Error)]
#[error("invalid record format: {0}")]
pub struct InvalidFormatError(#[from] serde_json::Error);

/// Lifecycle state of a transaction request.
///
/// `SUCCESS`, `FAILED` and `DROPPED` are terminal; everything else returns
/// the request to the pool for another pass.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TxStatus {
    Proposed,
    Seen,
    Sent,
    Mined,
    Success,
    Failed,
    Dropped,
    Unsent,
    Timeout,
    Unconfirmed,
}

impl TxStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Dropped)
    }
}

/// Fee of a single attempt: either a legacy gas price or an EIP-1559
/// tip/cap pair. Exactly one side is populated at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fee {
    #[serde(with = "crate::serde_utils::wei_opt", default)]
    pub gas_price: Option<u128>,
    #[serde(with = "crate::serde_utils::wei_opt", default)]
    pub max_fee_per_gas: Option<u128>,
    #[serde(with = "crate::serde_utils::wei_opt", default)]
    pub max_priority_fee_per_gas: Option<u128>,
}

impl Fee {
    #[must_use]
    pub fn legacy(gas_price: u128) -> Self {
        Self {
            gas_price: Some(gas_price),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn dynamic(max_priority_fee_per_gas: u128, max_fee_per_gas: u128) -> Self {
        Self {
            gas_price: None,
            max_fee_per_gas: Some(max_fee_per_gas),
            max_priority_fee_per_gas: Some(max_priority_fee_per_gas),
        }
    }

    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.gas_price.is_some()
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.max_fee_per_gas.is_some() && self.max_priority_fee_per_gas.is_some()
    }

    /// The most the sender can pay per unit of gas under this fee.
    #[must_use]
    pub fn cap(&self) -> Option<u128> {
        self.gas_price.or(self.max_fee_per_gas)
    }
}

/// A transaction request as stored in the KV record.
///
/// Producers create it with status `PROPOSED`; the processor assigns nonce,
/// fee and gas and walks it through the state machine. The JSON shape is the
/// producer contract: unused fee fields stay `null`, and legacy records
/// missing `maxFeePerGas`/`hashes`/`tx_id` are upgraded on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    #[serde(default)]
    pub tx_id: String,
    pub status: TxStatus,
    #[serde(default)]
    pub score: u64,
    pub to: Address,
    #[serde(with = "crate::serde_utils::wei", default)]
    pub value: u128,
    #[serde(rename = "from", default)]
    pub source: Option<Address>,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(rename = "chainId", default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub data: Option<Bytes>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub tx_hash: Option<H256>,
    #[serde(default)]
    pub hashes: Vec<H256>,
    #[serde(default)]
    pub sent_ts: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(rename = "gasPrice", with = "crate::serde_utils::wei_opt", default)]
    pub gas_price: Option<u128>,
    #[serde(rename = "maxFeePerGas", with = "crate::serde_utils::wei_opt", default)]
    pub max_fee_per_gas: Option<u128>,
    #[serde(
        rename = "maxPriorityFeePerGas",
        with = "crate::serde_utils::wei_opt",
        default
    )]
    pub max_priority_fee_per_gas: Option<u128>,
}

impl Tx {
    /// Decode a stored record. The key is authoritative for the id.
    pub fn from_bytes(tx_id: &str, bytes: &[u8]) -> Result<Self, InvalidFormatError> {
        let mut tx: Tx = serde_json::from_slice(bytes)?;
        tx.tx_id = tx_id.to_string();
        // Upgrade records written before the hash list existed.
        if tx.hashes.is_empty() {
            if let Some(hash) = tx.tx_hash {
                tx.hashes.push(hash);
            }
        }
        Ok(tx)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, InvalidFormatError> {
        Ok(serde_json::to_vec(self)?)
    }

    #[must_use]
    pub fn fee(&self) -> Fee {
        Fee {
            gas_price: self.gas_price,
            max_fee_per_gas: self.max_fee_per_gas,
            max_priority_fee_per_gas: self.max_priority_fee_per_gas,
        }
    }

    pub fn set_fee(&mut self, fee: Fee) {
        self.gas_price = fee.gas_price;
        self.max_fee_per_gas = fee.max_fee_per_gas;
        self.max_priority_fee_per_gas = fee.max_priority_fee_per_gas;
    }

    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.tx_hash.is_some()
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record a successful submission, keeping `tx_hash` the tail of `hashes`.
    pub fn add_hash(&mut self, hash: H256) {
        self.hashes.push(hash);
        self.tx_hash = Some(hash);
    }

    pub fn set_as_completed(&mut self, success: bool) {
        self.status = if success {
            TxStatus::Success
        } else {
            TxStatus::Failed
        };
    }

    /// Bridge-originated requests carry a fixed id suffix and are dropped
    /// outright on pre-flight revert instead of blocking the queue.
    #[must_use]
    pub fn has_bridge_origin(&self, suffix: &str) -> bool {
        self.tx_id.ends_with(suffix)
    }
}

/// Pool score: lower dispatches sooner, ties broken by submission time.
#[must_use]
pub fn compose_score(priority: u64, submitted_at: i64) -> u64 {
    priority * 10_u64.pow(10) + submitted_at.max(0) as u64
}

/// A random-enough id for producers and tests that do not bring their own.
#[must_use]
pub fn generate_id(len: usize) -> String {
    let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let digest = ethers::utils::keccak256(seed.to_be_bytes());
    let mut id = hex::encode(digest);
    id.truncate(len);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn sample_tx() -> Tx {
        Tx {
            tx_id: "tx-a1".to_string(),
            status: TxStatus::Proposed,
            score: compose_score(2, 1_700_000_000),
            to: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".parse().unwrap(),
            value: 9,
            source: None,
            nonce: None,
            chain_id: Some(1),
            gas: Some(200_000),
            data: None,
            multiplier: None,
            attempts: 0,
            tx_hash: None,
            hashes: vec![],
            sent_ts: None,
            method: Some("transfer".to_string()),
            meta: None,
            gas_price: Some(1),
            max_fee_per_gas: None,
            max_priority_fee_per_gas: None,
        }
    }

    #[test]
    fn round_trip() {
        let tx = sample_tx();
        let bytes = tx.to_bytes().unwrap();
        let decoded = Tx::from_bytes(&tx.tx_id, &bytes).unwrap();
        similar_asserts::assert_eq!(decoded, tx);
    }

    #[test]
    fn unused_fee_fields_are_null() {
        let tx = sample_tx();
        let value: serde_json::Value = serde_json::from_slice(&tx.to_bytes().unwrap()).unwrap();
        assert_eq!(value["gasPrice"], serde_json::json!(1));
        assert!(value["maxFeePerGas"].is_null());
        assert!(value["maxPriorityFeePerGas"].is_null());
    }

    #[test]
    fn legacy_record_upgrades_on_read() {
        // Written by a pre-1559 revision: no maxFeePerGas, no hashes, no tx_id.
        let raw = indoc::indoc! {r#"
            {
                "status": "SENT",
                "score": 3,
                "to": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf",
                "value": 5,
                "gasPrice": 1000000000,
                "tx_hash": "0x2c6a1a228cc2d3716a1bdb544414a0b85a5a9a9e105c6ca7ab3a1e0bab19fd94"
            }
        "#};
        let tx = Tx::from_bytes("old-id", raw.as_bytes()).unwrap();
        assert_eq!(tx.tx_id, "old-id");
        assert!(tx.fee().is_legacy());
        assert!(!tx.fee().is_dynamic());
        assert_eq!(tx.fee().gas_price, Some(1_000_000_000));
        // The hash list is reconstructed from the current hash.
        assert_eq!(tx.hashes, vec![tx.tx_hash.unwrap()]);
    }

    #[test]
    fn values_beyond_u64_survive_the_record() {
        let mut tx = sample_tx();
        // ~340 ETH in wei, far past what a bare u64 JSON number can carry.
        tx.value = 340_000_000_000_000_000_000;
        let decoded = Tx::from_bytes(&tx.tx_id, &tx.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.value, tx.value);
    }

    #[test]
    fn missing_status_is_a_hard_error() {
        let raw = r#"{"to": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf", "value": 1}"#;
        assert!(Tx::from_bytes("id", raw.as_bytes()).is_err());
    }

    #[test]
    fn unknown_status_is_a_hard_error() {
        let raw = r#"{"status": "WAT", "to": "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"}"#;
        assert!(Tx::from_bytes("id", raw.as_bytes()).is_err());
    }

    #[test]
    fn missing_to_is_a_hard_error() {
        let raw = r#"{"status": "PROPOSED", "value": 1}"#;
        assert!(Tx::from_bytes("id", raw.as_bytes()).is_err());
    }

    #[test_case(TxStatus::Success ; "success")]
    #[test_case(TxStatus::Failed ; "failed")]
    #[test_case(TxStatus::Dropped ; "dropped")]
    fn terminal_statuses(status: TxStatus) {
        assert!(status.is_terminal());
    }

    #[test_case(TxStatus::Proposed ; "proposed")]
    #[test_case(TxStatus::Seen ; "seen")]
    #[test_case(TxStatus::Sent ; "sent")]
    #[test_case(TxStatus::Timeout ; "timeout")]
    #[test_case(TxStatus::Unsent ; "unsent")]
    #[test_case(TxStatus::Unconfirmed ; "unconfirmed")]
    fn non_terminal_statuses(status: TxStatus) {
        assert!(!status.is_terminal());
    }

    #[test]
    fn hash_accumulation_keeps_tail() {
        let mut tx = sample_tx();
        let first = H256::from_low_u64_be(1);
        let second = H256::from_low_u64_be(2);
        tx.add_hash(first);
        tx.add_hash(second);
        assert_eq!(tx.hashes, vec![first, second]);
        assert_eq!(tx.tx_hash, Some(second));
    }

    #[test]
    fn score_orders_priority_before_time() {
        let urgent_late = compose_score(1, 2_000_000_000);
        let relaxed_early = compose_score(2, 1_000_000_000);
        assert!(urgent_late < relaxed_early);

        let same_priority_early = compose_score(2, 1_000_000_000);
        let same_priority_late = compose_score(2, 1_000_000_001);
        assert!(same_priority_early < same_priority_late);
    }

    #[test]
    fn generated_id_has_requested_length() {
        let id = generate_id(19);
        assert_eq!(id.len(), 19);
    }
}
