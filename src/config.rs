use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;

use crate::secret::{Secret, SecretUrl};

/// Service configuration, read from the environment once at boot.
///
/// Every tunable has a documented default except the signing credentials:
/// at least one of `SGX_URL` / `ETH_PRIVATE_KEY` must be present.
/// Durations are plain integer seconds.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Redis-compatible ordered-set + KV store holding the pool and records.
    #[serde(default = "default::redis_uri")]
    pub redis_uri: SecretUrl,

    /// Remote signer endpoint. When set, the remote signer is used.
    #[serde(default)]
    pub sgx_url: Option<SecretUrl>,

    /// Software signing key. Used only when `SGX_URL` is absent.
    #[serde(default)]
    pub eth_private_key: Option<Secret<String>>,

    /// Ethereum JSON-RPC node.
    #[serde(default = "default::endpoint")]
    pub endpoint: SecretUrl,

    /// Directory holding `node_config.json` and `sgx_certs/`.
    #[serde(default = "default::node_data_path")]
    pub node_data_path: PathBuf,

    /// Multiplier applied to estimated gas.
    #[serde(default = "default::gas_multiplier")]
    pub gas_multiplier: f64,

    /// Seconds to sleep before re-entering the loop after a failure.
    #[serde(default = "default::restart_timeout")]
    pub restart_timeout: u64,

    /// Base of the quadratic receipt-wait window, in seconds.
    #[serde(default = "default::base_waiting_time")]
    pub base_waiting_time: u64,

    /// Blocks to wait past inclusion before declaring success.
    #[serde(default = "default::confirmation_blocks")]
    pub confirmation_blocks: u64,

    /// Attempt budget per transaction; exceeding it forces `DROPPED`.
    #[serde(default = "default::max_resubmit_amount")]
    pub max_resubmit_amount: u32,

    /// Upper bound in seconds for block waits during confirmation.
    #[serde(default = "default::max_waiting_time")]
    pub max_waiting_time: u64,

    /// In-attempt resubmissions allowed on `replacement transaction underpriced`.
    #[serde(default = "default::underpriced_retries")]
    pub underpriced_retries: u32,

    /// Skip `eth_estimateGas`; size gas from the hint or the default limit.
    #[serde(default)]
    pub disable_gas_estimation: bool,

    /// TTL of transaction records, in seconds.
    #[serde(default = "default::txrecord_expiration")]
    pub txrecord_expiration: u64,

    /// Length of generated transaction ids.
    #[serde(default = "default::default_id_len")]
    pub default_id_len: usize,

    /// Gas limit assumed when estimation is disabled and no hint is given.
    #[serde(default = "default::default_gas_limit")]
    pub default_gas_limit: u64,

    /// Id suffix marking bridge-originated requests (stricter drop policy).
    #[serde(default = "default::ima_id_suffix")]
    pub ima_id_suffix: String,

    /// Markup in percent over the node's gas price suggestion.
    #[serde(default = "default::avg_gas_price_inc_percent")]
    pub avg_gas_price_inc_percent: u64,

    /// Legacy-fee ceiling in wei.
    #[serde(default = "default::max_gas_price")]
    pub max_gas_price: u64,

    /// Legacy fee bump between attempts, percent.
    #[serde(default = "default::gas_price_inc_percent")]
    pub gas_price_inc_percent: u64,

    /// Legacy fee bump inside one attempt (replacement), percent.
    #[serde(default = "default::grad_gas_price_inc_percent")]
    pub grad_gas_price_inc_percent: u64,

    /// Absolute wei floor on legacy bumps, so tiny fees still make progress.
    #[serde(default = "default::min_gas_price_inc_percent")]
    pub min_gas_price_inc_percent: u64,

    /// Markup of the fee cap over the base-fee estimate, percent.
    #[serde(default = "default::base_fee_adjustment_percent")]
    pub base_fee_adjustment_percent: u64,

    /// Reward percentile requested from `eth_feeHistory`.
    #[serde(default = "default::target_reward_percentile")]
    pub target_reward_percentile: u64,

    /// Floor on the priority fee, in wei.
    #[serde(default = "default::min_priority_fee")]
    pub min_priority_fee: u64,

    /// EIP-1559 fee bump between attempts, percent.
    #[serde(default = "default::fee_inc_percent")]
    pub fee_inc_percent: u64,

    /// EIP-1559 fee ceiling in wei, for both tip and cap.
    #[serde(default = "default::max_fee_value")]
    pub max_fee_value: u64,

    /// EIP-1559 bump inside one attempt (replacement), percent and wei floor.
    #[serde(default = "default::min_fee_inc_percent")]
    pub min_fee_inc_percent: u64,

    /// Pool admission bound; `add` refuses once the index holds this many.
    #[serde(default = "default::max_tx_cap")]
    pub max_tx_cap: u64,

    /// Replacement count after which a stuck legacy predecessor is dislodged.
    #[serde(default = "default::hard_replace_start_index")]
    pub hard_replace_start_index: u32,

    /// Tip distance from the cap used by the hard-replace collapse, in wei.
    #[serde(default = "default::hard_replace_tip_offset")]
    pub hard_replace_tip_offset: u64,
}

pub fn load_config() -> anyhow::Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::Environment::default().try_parsing(true))
        .build()?;

    let config: Config = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Fail fast when no signing credential is configured.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sgx_url.is_none() && self.eth_private_key.is_none() {
            anyhow::bail!("either SGX_URL or ETH_PRIVATE_KEY must be set");
        }
        Ok(())
    }

    /// A baseline config for tests: local endpoints, software key,
    /// no gas estimation, zero wait windows.
    pub fn for_tests() -> Self {
        Self {
            redis_uri: "redis://127.0.0.1:6379".parse().unwrap(),
            sgx_url: None,
            eth_private_key: Some(Secret::new(
                "ee79b5f6e221356af78cf4c36f4f7885a11b67dfcc81c34d80249947330c0f82".to_string(),
            )),
            endpoint: "http://127.0.0.1:8545".parse().unwrap(),
            node_data_path: PathBuf::from("/tmp"),
            gas_multiplier: 1.2,
            restart_timeout: 0,
            base_waiting_time: 0,
            confirmation_blocks: 0,
            max_resubmit_amount: 10,
            max_waiting_time: 30,
            underpriced_retries: 5,
            disable_gas_estimation: true,
            txrecord_expiration: 86_400,
            default_id_len: 19,
            default_gas_limit: 1_000_000,
            ima_id_suffix: "js".to_string(),
            avg_gas_price_inc_percent: 50,
            max_gas_price: 1_000_000_000_000,
            gas_price_inc_percent: 10,
            grad_gas_price_inc_percent: 2,
            min_gas_price_inc_percent: 10,
            base_fee_adjustment_percent: 50,
            target_reward_percentile: 60,
            min_priority_fee: 1_000_000_000,
            fee_inc_percent: 12,
            max_fee_value: 1_000_000_000_000,
            min_fee_inc_percent: 5,
            max_tx_cap: 1000,
            hard_replace_start_index: 5,
            hard_replace_tip_offset: 1_000_000_000,
        }
    }
}

/// One line per tunable, secrets masked. Logged at boot.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "REDIS_URI: {}", self.redis_uri)?;
        match &self.sgx_url {
            Some(url) => writeln!(f, "SGX_URL: {}", url)?,
            None => writeln!(f, "SGX_URL: <unset>")?,
        }
        writeln!(
            f,
            "ETH_PRIVATE_KEY: {}",
            if self.eth_private_key.is_some() {
                "**********"
            } else {
                "<unset>"
            }
        )?;
        writeln!(f, "ENDPOINT: {}", self.endpoint)?;
        writeln!(f, "NODE_DATA_PATH: {}", self.node_data_path.display())?;
        writeln!(f, "GAS_MULTIPLIER: {}", self.gas_multiplier)?;
        writeln!(f, "RESTART_TIMEOUT: {}", self.restart_timeout)?;
        writeln!(f, "BASE_WAITING_TIME: {}", self.base_waiting_time)?;
        writeln!(f, "CONFIRMATION_BLOCKS: {}", self.confirmation_blocks)?;
        writeln!(f, "MAX_RESUBMIT_AMOUNT: {}", self.max_resubmit_amount)?;
        writeln!(f, "MAX_WAITING_TIME: {}", self.max_waiting_time)?;
        writeln!(f, "UNDERPRICED_RETRIES: {}", self.underpriced_retries)?;
        writeln!(f, "DISABLE_GAS_ESTIMATION: {}", self.disable_gas_estimation)?;
        writeln!(f, "TXRECORD_EXPIRATION: {}", self.txrecord_expiration)?;
        writeln!(f, "DEFAULT_ID_LEN: {}", self.default_id_len)?;
        writeln!(f, "DEFAULT_GAS_LIMIT: {}", self.default_gas_limit)?;
        writeln!(f, "IMA_ID_SUFFIX: {}", self.ima_id_suffix)?;
        writeln!(
            f,
            "AVG_GAS_PRICE_INC_PERCENT: {}",
            self.avg_gas_price_inc_percent
        )?;
        writeln!(f, "MAX_GAS_PRICE: {}", self.max_gas_price)?;
        writeln!(f, "GAS_PRICE_INC_PERCENT: {}", self.gas_price_inc_percent)?;
        writeln!(
            f,
            "GRAD_GAS_PRICE_INC_PERCENT: {}",
            self.grad_gas_price_inc_percent
        )?;
        writeln!(
            f,
            "MIN_GAS_PRICE_INC_PERCENT: {}",
            self.min_gas_price_inc_percent
        )?;
        writeln!(
            f,
            "BASE_FEE_ADJUSTMENT_PERCENT: {}",
            self.base_fee_adjustment_percent
        )?;
        writeln!(
            f,
            "TARGET_REWARD_PERCENTILE: {}",
            self.target_reward_percentile
        )?;
        writeln!(f, "MIN_PRIORITY_FEE: {}", self.min_priority_fee)?;
        writeln!(f, "FEE_INC_PERCENT: {}", self.fee_inc_percent)?;
        writeln!(f, "MAX_FEE_VALUE: {}", self.max_fee_value)?;
        writeln!(f, "MIN_FEE_INC_PERCENT: {}", self.min_fee_inc_percent)?;
        writeln!(f, "MAX_TX_CAP: {}", self.max_tx_cap)?;
        writeln!(
            f,
            "HARD_REPLACE_START_INDEX: {}",
            self.hard_replace_start_index
        )?;
        write!(
            f,
            "HARD_REPLACE_TIP_OFFSET: {}",
            self.hard_replace_tip_offset
        )
    }
}

mod default {
    use std::path::PathBuf;

    use crate::secret::SecretUrl;

    pub fn redis_uri() -> SecretUrl {
        "redis://127.0.0.1:6379".parse().unwrap()
    }

    pub fn endpoint() -> SecretUrl {
        "http://127.0.0.1:8545".parse().unwrap()
    }

    pub fn node_data_path() -> PathBuf {
        PathBuf::from("/skale_node_data")
    }

    pub fn gas_multiplier() -> f64 {
        1.2
    }

    pub fn restart_timeout() -> u64 {
        3
    }

    pub fn base_waiting_time() -> u64 {
        30
    }

    pub fn confirmation_blocks() -> u64 {
        2
    }

    pub fn max_resubmit_amount() -> u32 {
        10
    }

    pub fn max_waiting_time() -> u64 {
        600
    }

    pub fn underpriced_retries() -> u32 {
        5
    }

    pub fn txrecord_expiration() -> u64 {
        86_400
    }

    pub fn default_id_len() -> usize {
        19
    }

    pub fn default_gas_limit() -> u64 {
        1_000_000
    }

    pub fn ima_id_suffix() -> String {
        "js".to_string()
    }

    pub fn avg_gas_price_inc_percent() -> u64 {
        50
    }

    pub fn max_gas_price() -> u64 {
        // 1000 gwei
        1_000_000_000_000
    }

    pub fn gas_price_inc_percent() -> u64 {
        10
    }

    pub fn grad_gas_price_inc_percent() -> u64 {
        2
    }

    pub fn min_gas_price_inc_percent() -> u64 {
        10
    }

    pub fn base_fee_adjustment_percent() -> u64 {
        50
    }

    pub fn target_reward_percentile() -> u64 {
        60
    }

    pub fn min_priority_fee() -> u64 {
        // 1 gwei
        1_000_000_000
    }

    pub fn fee_inc_percent() -> u64 {
        12
    }

    pub fn max_fee_value() -> u64 {
        // 1000 gwei
        1_000_000_000_000
    }

    pub fn min_fee_inc_percent() -> u64 {
        5
    }

    pub fn max_tx_cap() -> u64 {
        1000
    }

    pub fn hard_replace_start_index() -> u32 {
        5
    }

    pub fn hard_replace_tip_offset() -> u64 {
        // 1 gwei
        1_000_000_000
    }
}
