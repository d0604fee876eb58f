//! Chain adapter: JSON-RPC access to the identity contract.
//!
//! Talks to an EVM-compatible endpoint for the handful of operations the
//! deploy pipeline needs: ownership view calls, the mint transaction, and
//! receipt retrieval during WAL recovery. Transactions are legacy-format,
//! EIP-155 signed locally; the payload is hand-encoded because the
//! contract surface is four fixed selectors.

use crate::signer::WalletSigner;
use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use teneo_types::{SdkError, SdkResult};
use tracing::{debug, info, warn};

/// Fallback mint price when the `mintPrice()` view call fails: 2 native
/// tokens in wei.
const DEFAULT_MINT_PRICE_WEI: u128 = 2_000_000_000_000_000_000;

/// How long to poll for a transaction receipt before giving up.
const RECEIPT_DEADLINE: Duration = Duration::from_secs(300);
/// Receipt polling interval.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Result of a successful on-chain mint.
#[derive(Debug, Clone)]
pub struct MintOutcome {
    pub token_id: u64,
    pub tx_hash: String,
}

/// One receipt log entry; only topics matter for token-id extraction.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub topics: Vec<B256>,
}

/// A mined transaction receipt.
#[derive(Debug, Clone)]
pub struct TxReceipt {
    pub tx_hash: String,
    pub success: bool,
    pub logs: Vec<LogEntry>,
}

/// The chain surface the orchestrator depends on; a trait so recovery and
/// idempotence scenarios are testable against a mock chain.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Does the wallet already own an identity token on this contract?
    async fn has_access(&self) -> SdkResult<bool>;

    /// Token id owned by the wallet (first token by index).
    async fn token_of_owner(&self) -> SdkResult<u64>;

    /// Submit the mint with the backend-signed authorization and wait for
    /// the receipt. `mint_price` overrides the on-chain price when set.
    async fn execute_mint(
        &self,
        signature: &str,
        mint_price: Option<U256>,
    ) -> SdkResult<MintOutcome>;

    /// Fetch a receipt; `Ok(None)` while the transaction is unknown or
    /// still pending.
    async fn transaction_receipt(&self, tx_hash: &str) -> SdkResult<Option<TxReceipt>>;
}

/// Builds [`ChainApi`] instances for the coordinates the backend hands
/// out mid-pipeline (contract address, chain id, RPC URL).
pub trait ChainConnector: Send + Sync {
    fn connect(
        &self,
        rpc_url: &str,
        contract_address: &str,
        chain_id: &str,
    ) -> SdkResult<Arc<dyn ChainApi>>;
}

/// Production connector backed by [`JsonRpcChain`].
pub struct JsonRpcConnector {
    signer: Arc<WalletSigner>,
}

impl JsonRpcConnector {
    pub fn new(signer: Arc<WalletSigner>) -> Self {
        Self { signer }
    }
}

impl ChainConnector for JsonRpcConnector {
    fn connect(
        &self,
        rpc_url: &str,
        contract_address: &str,
        chain_id: &str,
    ) -> SdkResult<Arc<dyn ChainApi>> {
        Ok(Arc::new(JsonRpcChain::new(
            rpc_url,
            contract_address,
            chain_id,
            Arc::clone(&self.signer),
        )?))
    }
}

/// Production [`ChainApi`] over plain JSON-RPC.
pub struct JsonRpcChain {
    rpc_url: String,
    contract: Address,
    chain_id: u64,
    signer: Arc<WalletSigner>,
    wallet: Address,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpcChain {
    pub fn new(
        rpc_url: &str,
        contract_address: &str,
        chain_id: &str,
        signer: Arc<WalletSigner>,
    ) -> SdkResult<Self> {
        if rpc_url.is_empty() {
            return Err(SdkError::InvalidConfig("rpc_endpoint is required".into()));
        }
        let contract = Address::from_str(contract_address)
            .map_err(|e| SdkError::InvalidConfig(format!("invalid contract address: {e}")))?;
        let chain_id: u64 = chain_id
            .parse()
            .map_err(|_| SdkError::InvalidConfig(format!("invalid chain id: {chain_id}")))?;
        let wallet = Address::from_str(signer.address())
            .map_err(|e| SdkError::Internal(format!("bad signer address: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Ok(Self {
            rpc_url: rpc_url.to_string(),
            contract,
            chain_id,
            signer,
            wallet,
            client,
        })
    }

    async fn rpc(&self, method: &str, params: serde_json::Value) -> SdkResult<serde_json::Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SdkError::NetworkError(format!("{method}: {e}")))?;
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| SdkError::NetworkError(format!("{method}: bad RPC response: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(SdkError::ContractError(format!(
                "{method}: RPC error {}: {}",
                err.code, err.message
            )));
        }
        envelope
            .result
            .ok_or_else(|| SdkError::ContractError(format!("{method}: empty RPC result")))
    }

    async fn call(&self, data: Vec<u8>) -> SdkResult<Vec<u8>> {
        let result = self
            .rpc(
                "eth_call",
                json!([{
                    "to": self.contract.to_checksum(None),
                    "data": format!("0x{}", hex::encode(data)),
                }, "latest"]),
            )
            .await?;
        let raw = result
            .as_str()
            .ok_or_else(|| SdkError::ContractError("eth_call: non-string result".into()))?;
        hex::decode(raw.trim_start_matches("0x"))
            .map_err(|e| SdkError::ContractError(format!("eth_call: bad hex result: {e}")))
    }

    async fn quantity(&self, method: &str, params: serde_json::Value) -> SdkResult<U256> {
        let result = self.rpc(method, params).await?;
        let raw = result
            .as_str()
            .ok_or_else(|| SdkError::ContractError(format!("{method}: non-string result")))?;
        parse_quantity(raw)
            .ok_or_else(|| SdkError::ContractError(format!("{method}: bad quantity {raw}")))
    }

    /// `mintPrice()` view call, falling back to the configured default.
    async fn mint_price(&self) -> U256 {
        match self.call(selector("mintPrice()").to_vec()).await {
            Ok(ret) if ret.len() >= 32 => U256::from_be_slice(&ret[..32]),
            Ok(_) | Err(_) => {
                warn!("mintPrice() call failed, using default mint price");
                U256::from(DEFAULT_MINT_PRICE_WEI)
            }
        }
    }

    async fn poll_receipt(&self, tx_hash: &str) -> SdkResult<TxReceipt> {
        let deadline = tokio::time::Instant::now() + RECEIPT_DEADLINE;
        let mut ticker = tokio::time::interval(RECEIPT_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if tokio::time::Instant::now() >= deadline {
                return Err(SdkError::ReceiptTimeout(tx_hash.to_string()));
            }
            match self.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => continue,
                Err(e) => {
                    debug!("receipt poll error (will retry): {e}");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl ChainApi for JsonRpcChain {
    async fn has_access(&self) -> SdkResult<bool> {
        let mut data = selector("hasAccess(address)").to_vec();
        data.extend_from_slice(&encode_address(self.wallet));
        let ret = self.call(data).await?;
        Ok(ret.last().copied().unwrap_or(0) != 0)
    }

    async fn token_of_owner(&self) -> SdkResult<u64> {
        let mut data = selector("tokenOfOwnerByIndex(address,uint256)").to_vec();
        data.extend_from_slice(&encode_address(self.wallet));
        data.extend_from_slice(&encode_uint(U256::ZERO));
        let ret = self.call(data).await?;
        if ret.len() < 32 {
            return Err(SdkError::ContractError(
                "tokenOfOwnerByIndex: short return".into(),
            ));
        }
        let token = U256::from_be_slice(&ret[..32]);
        u256_to_token_id(token)
    }

    async fn execute_mint(
        &self,
        signature: &str,
        mint_price: Option<U256>,
    ) -> SdkResult<MintOutcome> {
        let price = match mint_price {
            Some(price) => price,
            None => self.mint_price().await,
        };

        // Balance gate before anything is submitted
        let balance = self
            .quantity(
                "eth_getBalance",
                json!([self.wallet.to_checksum(None), "latest"]),
            )
            .await?;
        if balance < price {
            return Err(SdkError::InsufficientFunds {
                have: balance.to_string(),
                need: price.to_string(),
            });
        }

        // mint(address to, bytes signature)
        let sig_bytes = hex::decode(signature.trim_start_matches("0x"))
            .map_err(|e| SdkError::ContractError(format!("invalid mint signature hex: {e}")))?;
        let mut data = selector("mint(address,bytes)").to_vec();
        data.extend_from_slice(&encode_address(self.wallet));
        data.extend_from_slice(&encode_uint(U256::from(64u64))); // offset of bytes arg
        data.extend_from_slice(&encode_bytes(&sig_bytes));

        // Gas estimation doubles as a revert check: a rejected backend
        // signature fails here, before any funds move.
        let call_obj = json!({
            "from": self.wallet.to_checksum(None),
            "to": self.contract.to_checksum(None),
            "value": format!("0x{:x}", price),
            "data": format!("0x{}", hex::encode(&data)),
        });
        let estimated = self
            .quantity("eth_estimateGas", json!([call_obj]))
            .await
            .map_err(|e| SdkError::WouldRevert(e.to_string()))?;
        let gas_limit = estimated
            .saturating_mul(U256::from(120u64))
            .checked_div(U256::from(100u64))
            .unwrap_or(estimated);

        let gas_price = self.quantity("eth_gasPrice", json!([])).await?;
        let nonce = self
            .quantity(
                "eth_getTransactionCount",
                json!([self.wallet.to_checksum(None), "pending"]),
            )
            .await?;

        let raw_tx = sign_legacy_tx(
            self.signer.as_ref(),
            self.chain_id,
            nonce,
            gas_price,
            gas_limit,
            self.contract,
            price,
            &data,
        )?;

        let result = self
            .rpc(
                "eth_sendRawTransaction",
                json!([format!("0x{}", hex::encode(&raw_tx))]),
            )
            .await?;
        let tx_hash = result
            .as_str()
            .ok_or_else(|| SdkError::ContractError("sendRawTransaction: no hash".into()))?
            .to_string();
        info!(tx_hash, "mint transaction submitted");

        let receipt = self.poll_receipt(&tx_hash).await?;
        if !receipt.success {
            return Err(SdkError::TransactionFailed(format!(
                "mint transaction reverted: {tx_hash}"
            )));
        }

        let token_id = extract_token_id(&receipt)?;
        Ok(MintOutcome { token_id, tx_hash })
    }

    async fn transaction_receipt(&self, tx_hash: &str) -> SdkResult<Option<TxReceipt>> {
        let result = self
            .rpc("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .and_then(|s| s.as_str())
            .and_then(parse_quantity)
            .unwrap_or(U256::ZERO);

        let mut logs = Vec::new();
        if let Some(raw_logs) = result.get("logs").and_then(|l| l.as_array()) {
            for raw in raw_logs {
                let topics = raw
                    .get("topics")
                    .and_then(|t| t.as_array())
                    .map(|topics| {
                        topics
                            .iter()
                            .filter_map(|t| t.as_str())
                            .filter_map(|t| B256::from_str(t).ok())
                            .collect()
                    })
                    .unwrap_or_default();
                logs.push(LogEntry { topics });
            }
        }

        Ok(Some(TxReceipt {
            tx_hash: tx_hash.to_string(),
            success: status == U256::from(1u64),
            logs,
        }))
    }
}

// ---------------------------------------------------------------------------
// ABI + RLP helpers
// ---------------------------------------------------------------------------

/// First four bytes of keccak-256 over the function signature.
fn selector(signature: &str) -> [u8; 4] {
    let digest = keccak256(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

fn encode_address(address: Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(address.as_slice());
    out
}

fn encode_uint(value: U256) -> [u8; 32] {
    value.to_be_bytes()
}

/// ABI-encode a dynamic `bytes` tail: length word plus right-padded data.
fn encode_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = encode_uint(U256::from(data.len())).to_vec();
    out.extend_from_slice(data);
    let padding = (32 - data.len() % 32) % 32;
    out.extend(std::iter::repeat(0u8).take(padding));
    out
}

/// Parse a 0x-prefixed hex quantity.
fn parse_quantity(raw: &str) -> Option<U256> {
    U256::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Scan receipt logs for the token id: the contract's `Minted(address,
/// uint256)` event first, then the standard ERC-721 `Transfer` as a
/// fallback.
pub fn extract_token_id(receipt: &TxReceipt) -> SdkResult<u64> {
    let minted_topic = keccak256(b"Minted(address,uint256)");
    let transfer_topic = keccak256(b"Transfer(address,address,uint256)");

    for log in &receipt.logs {
        if log.topics.first() == Some(&minted_topic) && log.topics.len() >= 3 {
            return u256_to_token_id(U256::from_be_bytes(log.topics[2].0));
        }
    }
    for log in &receipt.logs {
        if log.topics.first() == Some(&transfer_topic) && log.topics.len() >= 4 {
            return u256_to_token_id(U256::from_be_bytes(log.topics[3].0));
        }
    }
    Err(SdkError::TokenIdNotExtractable)
}

/// Token ids are reported to the backend as signed 64-bit; refuse to
/// truncate anything wider.
fn u256_to_token_id(value: U256) -> SdkResult<u64> {
    if value > U256::from(i64::MAX as u64) {
        return Err(SdkError::TokenIdOutOfRange(value.to_string()));
    }
    Ok(value.to::<u64>())
}

// -- RLP ---------------------------------------------------------------------

fn rlp_encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = rlp_length_prefix(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

fn rlp_encode_uint(value: U256) -> Vec<u8> {
    if value.is_zero() {
        return vec![0x80];
    }
    rlp_encode_bytes(&value.to_be_bytes_trimmed_vec())
}

fn rlp_encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flatten().copied().collect();
    let mut out = rlp_length_prefix(payload.len(), 0xc0);
    out.extend_from_slice(&payload);
    out
}

fn rlp_length_prefix(len: usize, base: u8) -> Vec<u8> {
    if len <= 55 {
        vec![base + len as u8]
    } else {
        let len_bytes: Vec<u8> = len
            .to_be_bytes()
            .iter()
            .copied()
            .skip_while(|b| *b == 0)
            .collect();
        let mut out = vec![base + 55 + len_bytes.len() as u8];
        out.extend_from_slice(&len_bytes);
        out
    }
}

/// Build and sign a legacy transaction with EIP-155 replay protection.
/// Returns the raw bytes for `eth_sendRawTransaction`.
#[allow(clippy::too_many_arguments)]
fn sign_legacy_tx(
    signer: &WalletSigner,
    chain_id: u64,
    nonce: U256,
    gas_price: U256,
    gas_limit: U256,
    to: Address,
    value: U256,
    data: &[u8],
) -> SdkResult<Vec<u8>> {
    let base_fields = [
        rlp_encode_uint(nonce),
        rlp_encode_uint(gas_price),
        rlp_encode_uint(gas_limit),
        rlp_encode_bytes(to.as_slice()),
        rlp_encode_uint(value),
        rlp_encode_bytes(data),
    ];

    // Signing payload: the six fields plus (chain_id, 0, 0)
    let mut signing_fields = base_fields.to_vec();
    signing_fields.push(rlp_encode_uint(U256::from(chain_id)));
    signing_fields.push(rlp_encode_uint(U256::ZERO));
    signing_fields.push(rlp_encode_uint(U256::ZERO));
    let sighash = keccak256(rlp_encode_list(&signing_fields));

    let (signature, recovery_id) = signer
        .signing_key()
        .sign_prehash_recoverable(sighash.as_slice())
        .map_err(|e| SdkError::Internal(format!("transaction signing failed: {e}")))?;

    let v = U256::from(chain_id * 2 + 35 + recovery_id.to_byte() as u64);
    let sig_bytes = signature.to_bytes();
    let r = U256::from_be_slice(&sig_bytes[..32]);
    let s = U256::from_be_slice(&sig_bytes[32..]);

    let mut fields = base_fields.to_vec();
    fields.push(rlp_encode_uint(v));
    fields.push(rlp_encode_uint(r));
    fields.push(rlp_encode_uint(s));
    Ok(rlp_encode_list(&fields))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selectors_match_known_values() {
        // transfer(address,uint256) is the canonical reference selector
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        // mint(address,bytes) selector is stable across runs
        assert_eq!(selector("mint(address,bytes)"), selector("mint(address,bytes)"));
    }

    #[test]
    fn test_abi_encoding_shapes() {
        let addr = Address::from_str("0x1111111111111111111111111111111111111111").unwrap();
        let encoded = encode_address(addr);
        assert_eq!(&encoded[..12], &[0u8; 12]);
        assert_eq!(&encoded[12..], addr.as_slice());

        let bytes = encode_bytes(&[0xaa; 65]);
        // length word + 65 data bytes padded to 96
        assert_eq!(bytes.len(), 32 + 96);
        assert_eq!(U256::from_be_slice(&bytes[..32]), U256::from(65u64));
        assert_eq!(bytes[32 + 64], 0xaa);
        assert_eq!(bytes[32 + 95], 0x00);
    }

    #[test]
    fn test_rlp_primitives() {
        // Canonical RLP vectors
        assert_eq!(rlp_encode_bytes(b""), vec![0x80]);
        assert_eq!(rlp_encode_bytes(&[0x00]), vec![0x00]);
        assert_eq!(rlp_encode_bytes(&[0x7f]), vec![0x7f]);
        assert_eq!(rlp_encode_bytes(b"dog"), vec![0x83, b'd', b'o', b'g']);
        assert_eq!(rlp_encode_uint(U256::ZERO), vec![0x80]);
        assert_eq!(rlp_encode_uint(U256::from(15u64)), vec![0x0f]);
        assert_eq!(rlp_encode_uint(U256::from(1024u64)), vec![0x82, 0x04, 0x00]);
        assert_eq!(
            rlp_encode_list(&[rlp_encode_bytes(b"cat"), rlp_encode_bytes(b"dog")]),
            vec![0xc8, 0x83, b'c', b'a', b't', 0x83, b'd', b'o', b'g']
        );
        assert_eq!(rlp_encode_list(&[]), vec![0xc0]);
    }

    #[test]
    fn test_long_rlp_payloads() {
        let long = vec![0xabu8; 60];
        let encoded = rlp_encode_bytes(&long);
        assert_eq!(encoded[0], 0xb8);
        assert_eq!(encoded[1], 60);
        assert_eq!(encoded.len(), 62);
    }

    #[test]
    fn test_signed_tx_shape_and_determinism() {
        let signer = WalletSigner::from_hex(
            "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318",
        )
        .unwrap();
        let to = Address::from_str("0x2222222222222222222222222222222222222222").unwrap();

        let raw_a = sign_legacy_tx(
            &signer,
            3338,
            U256::from(1u64),
            U256::from(1_000_000_000u64),
            U256::from(100_000u64),
            to,
            U256::from(10u64).pow(U256::from(18u64)),
            &[0x01, 0x02],
        )
        .unwrap();
        let raw_b = sign_legacy_tx(
            &signer,
            3338,
            U256::from(1u64),
            U256::from(1_000_000_000u64),
            U256::from(100_000u64),
            to,
            U256::from(10u64).pow(U256::from(18u64)),
            &[0x01, 0x02],
        )
        .unwrap();
        assert_eq!(raw_a, raw_b);
        // RLP list header present
        assert!(raw_a[0] >= 0xc0);
    }

    #[test]
    fn test_extract_token_id_prefers_minted_event() {
        let minted_topic = keccak256(b"Minted(address,uint256)");
        let transfer_topic = keccak256(b"Transfer(address,address,uint256)");
        let token = |id: u64| B256::from(U256::from(id).to_be_bytes());

        let receipt = TxReceipt {
            tx_hash: "0x1".into(),
            success: true,
            logs: vec![
                LogEntry {
                    topics: vec![transfer_topic, B256::ZERO, B256::ZERO, token(7)],
                },
                LogEntry {
                    topics: vec![minted_topic, B256::ZERO, token(42)],
                },
            ],
        };
        assert_eq!(extract_token_id(&receipt).unwrap(), 42);
    }

    #[test]
    fn test_extract_token_id_transfer_fallback() {
        let transfer_topic = keccak256(b"Transfer(address,address,uint256)");
        let receipt = TxReceipt {
            tx_hash: "0x1".into(),
            success: true,
            logs: vec![LogEntry {
                topics: vec![
                    transfer_topic,
                    B256::ZERO,
                    B256::ZERO,
                    B256::from(U256::from(9u64).to_be_bytes()),
                ],
            }],
        };
        assert_eq!(extract_token_id(&receipt).unwrap(), 9);
    }

    #[test]
    fn test_extract_token_id_missing_events() {
        let receipt = TxReceipt {
            tx_hash: "0x1".into(),
            success: true,
            logs: vec![LogEntry { topics: vec![] }],
        };
        assert!(matches!(
            extract_token_id(&receipt),
            Err(SdkError::TokenIdNotExtractable)
        ));
    }

    #[test]
    fn test_token_id_above_i64_refused() {
        let too_big = U256::from(i64::MAX as u64) + U256::from(1u64);
        assert!(matches!(
            u256_to_token_id(too_big),
            Err(SdkError::TokenIdOutOfRange(_))
        ));
        assert_eq!(u256_to_token_id(U256::from(5u64)).unwrap(), 5);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("0x1"), Some(U256::from(1u64)));
        assert_eq!(parse_quantity("0x0"), Some(U256::ZERO));
        assert_eq!(parse_quantity("0xde0b6b3a7640000"), Some(U256::from(10u64).pow(U256::from(18u64))));
        assert_eq!(parse_quantity("zz"), None);
    }
}
