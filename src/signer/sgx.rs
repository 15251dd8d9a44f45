use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Signature, H256, U256};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::secret::SecretUrl;

use super::{SignerError, TxSigner};

/// How often to re-check for the node config file during startup.
const NODE_CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(3);

const NODE_CONFIG_FILENAME: &str = "node_config.json";
const CERTS_DIR: &str = "sgx_certs";

/// Remote enclave signer over HTTPS with mutual TLS.
///
/// The key name is read from the node config file, which may appear only
/// after this process starts: the enrolling node writes it. Initialization
/// therefore blocks, polling until the file shows up.
pub struct SgxSigner {
    client: reqwest::Client,
    url: SecretUrl,
    key_name: String,
    address: Address,
    chain_id: u64,
}

impl SgxSigner {
    pub async fn connect(
        url: &SecretUrl,
        node_data_path: &Path,
        chain_id: u64,
    ) -> anyhow::Result<Self> {
        let key_name = wait_for_key_name(node_data_path).await?;
        let client = build_client(node_data_path)?;

        let mut signer = Self {
            client,
            url: url.clone(),
            key_name,
            address: Address::zero(),
            chain_id,
        };
        signer.address = signer.fetch_address().await?;
        info!(address = ?signer.address, "Connected to the remote signer");
        Ok(signer)
    }

    async fn fetch_address(&self) -> Result<Address, SignerError> {
        #[derive(Deserialize)]
        struct KeyResult {
            #[serde(rename = "publicKey")]
            public_key: String,
        }

        let result: KeyResult = self
            .call("getPublicKeyECDSA", json!({ "keyName": self.key_name }))
            .await?;
        address_from_public_key(&result.public_key)
            .ok_or_else(|| SignerError::Rejected("malformed public key".to_string()))
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SignerError> {
        #[derive(Deserialize)]
        struct RpcResponse<T> {
            result: Option<T>,
            error: Option<RpcErrorBody>,
        }

        #[derive(Deserialize)]
        struct RpcErrorBody {
            message: String,
        }

        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(self.url.expose().clone())
            .json(&body)
            .send()
            .await
            .map_err(|err| SignerError::Unreachable(err.to_string()))?;

        if response.status().is_server_error() {
            return Err(SignerError::Unreachable(format!(
                "signer answered {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(SignerError::Rejected(format!(
                "signer answered {}",
                response.status()
            )));
        }

        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|err| SignerError::Rejected(err.to_string()))?;
        if let Some(error) = parsed.error {
            return Err(SignerError::Rejected(error.message));
        }
        parsed
            .result
            .ok_or_else(|| SignerError::Rejected("empty result".to_string()))
    }
}

#[async_trait]
impl TxSigner for SgxSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: &TypedTransaction) -> Result<Signature, SignerError> {
        #[derive(Deserialize)]
        struct SignResult {
            signature_r: String,
            signature_s: String,
            signature_v: u64,
        }

        let digest: H256 = tx.sighash();
        let result: SignResult = self
            .call(
                "ecdsaSignMessageHash",
                json!({
                    "base": 16,
                    "keyName": self.key_name,
                    "messageHash": format!("{digest:#x}"),
                }),
            )
            .await?;

        let r = parse_word(&result.signature_r)?;
        let s = parse_word(&result.signature_s)?;
        // The enclave returns the raw parity; legacy envelopes need the
        // EIP-155 adjustment, typed ones carry parity as-is.
        let v = match tx {
            TypedTransaction::Legacy(_) => result.signature_v + 35 + 2 * self.chain_id,
            _ => result.signature_v,
        };
        Ok(Signature { r, s, v })
    }
}

fn parse_word(raw: &str) -> Result<U256, SignerError> {
    U256::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|err| SignerError::Rejected(format!("malformed signature word: {err}")))
}

fn build_client(node_data_path: &Path) -> anyhow::Result<reqwest::Client> {
    let certs_dir = node_data_path.join(CERTS_DIR);
    let cert = std::fs::read(certs_dir.join("sgx.crt"))?;
    let key = std::fs::read(certs_dir.join("sgx.key"))?;
    let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key)?;
    // The enclave terminates TLS with a self-signed certificate; trust is
    // established by the client certificate, not the server chain.
    let client = reqwest::Client::builder()
        .identity(identity)
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

async fn wait_for_key_name(node_data_path: &Path) -> anyhow::Result<String> {
    let config_path = node_data_path.join(NODE_CONFIG_FILENAME);
    loop {
        match std::fs::read(&config_path) {
            Ok(raw) => {
                let parsed: serde_json::Value = serde_json::from_slice(&raw)?;
                if let Some(key_name) = parsed["sgx_key_name"].as_str() {
                    return Ok(key_name.to_string());
                }
                warn!(path = %config_path.display(), "Node config has no sgx_key_name yet");
            }
            Err(_) => {
                info!(path = %config_path.display(), "Waiting for the node config to appear");
            }
        }
        tokio::time::sleep(NODE_CONFIG_POLL_INTERVAL).await;
    }
}

fn address_from_public_key(raw: &str) -> Option<Address> {
    let bytes = hex::decode(raw.trim_start_matches("0x")).ok()?;
    // Uncompressed keys carry a leading 0x04 marker byte.
    let key = match bytes.len() {
        65 if bytes[0] == 4 => &bytes[1..],
        64 => &bytes[..],
        _ => return None,
    };
    let digest = ethers::utils::keccak256(key);
    Some(Address::from_slice(&digest[12..]))
}
