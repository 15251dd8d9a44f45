use serde::{Deserialize, Serialize};

use crate::transaction::{Fee, InvalidFormatError};

/// The last on-wire attempt, rewritten on every successful submission.
///
/// This is the crash-recovery anchor: after a restart it tells the processor
/// which `(nonce, fee)` pair is already in the mempool so the same pair is
/// never reused for a different body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub tx_id: String,
    pub nonce: u64,
    pub index: u32,
    pub fee: Fee,
    pub wait_time: u64,
    pub gas: u64,
}

impl Attempt {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InvalidFormatError> {
        Ok(serde_json::from_slice::<Attempt>(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, InvalidFormatError> {
        Ok(serde_json::to_vec(self)?)
    }
}

// Hand-rolled deserialization: records written before the fee union existed
// carry a top-level `gas_price` that must fold into `fee`.
impl<'de> Deserialize<'de> for Attempt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Shadow {
            tx_id: String,
            nonce: u64,
            index: u32,
            #[serde(default)]
            fee: Option<Fee>,
            #[serde(default)]
            gas_price: Option<u128>,
            #[serde(default)]
            wait_time: u64,
            #[serde(default)]
            gas: u64,
        }

        let shadow = Shadow::deserialize(deserializer)?;
        let fee = match (shadow.fee, shadow.gas_price) {
            (Some(fee), _) => fee,
            (None, Some(gas_price)) => Fee::legacy(gas_price),
            (None, None) => {
                return Err(serde::de::Error::missing_field("fee"));
            }
        };
        Ok(Attempt {
            tx_id: shadow.tx_id,
            nonce: shadow.nonce,
            index: shadow.index,
            fee,
            wait_time: shadow.wait_time,
            gas: shadow.gas,
        })
    }
}
