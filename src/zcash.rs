//! Zcash chain client: a thin adapter over the shielded wallet's
//! JSON-RPC interface. Exposes only the verbs the engine needs; no
//! business logic lives here.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ChainError;
use crate::wire;

/// Deadline for a single RPC round-trip.
const RPC_DEADLINE: Duration = Duration::from_secs(30);
/// How often the async operation queue is polled after `z_sendmany`.
const SEND_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Poll budget before a send is reported as timed out. The operation
/// is not re-submitted on timeout.
const SEND_POLL_ATTEMPTS: u32 = 30;

/// A confirmed transaction with outputs addressed to the bridge pool.
#[derive(Debug, Clone)]
pub struct ConfirmedTx {
    pub txid: String,
    pub block_height: u64,
    pub outputs: Vec<PoolOutput>,
}

#[derive(Debug, Clone)]
pub struct PoolOutput {
    pub amount_base: u64,
    pub memo: Vec<u8>,
}

impl ConfirmedTx {
    /// Multiple bridge-addressed outputs in one tx aggregate into a
    /// single deposit.
    pub fn total_base(&self) -> u64 {
        self.outputs.iter().map(|o| o.amount_base).sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolFunds {
    pub total_base: u64,
    pub spendable_base: u64,
}

pub trait ZcashChain: Send + Sync + 'static {
    fn current_tip(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Confirmed deposits to the pool address at or beyond the cursor
    /// block, ordered by (height, txid). Re-delivery of already-claimed
    /// txs is expected; the store rejects duplicates.
    fn scan_from(
        &self,
        from_block: u64,
    ) -> impl Future<Output = Result<Vec<ConfirmedTx>, ChainError>> + Send;

    fn send_shielded(
        &self,
        dest_address: &str,
        amount_base: u64,
        memo: Option<&[u8]>,
    ) -> impl Future<Output = Result<String, ChainError>> + Send;

    fn get_balance(&self) -> impl Future<Output = Result<PoolFunds, ChainError>> + Send;
}

pub struct ZcashRpcClient {
    http: reqwest::Client,
    url: String,
    auth: Option<(String, String)>,
    pool_address: String,
    min_confirmations: u32,
    /// The wallet spending key is held by one task at a time.
    send_lock: Mutex<()>,
}

impl ZcashRpcClient {
    pub fn new(
        url: String,
        user: Option<String>,
        password: Option<String>,
        pool_address: String,
        min_confirmations: u32,
    ) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(RPC_DEADLINE)
            .build()
            .map_err(|e| ChainError::NodeUnavailable(e.to_string()))?;
        let auth = match (user, password) {
            (Some(u), Some(p)) => Some((u, p)),
            (Some(u), None) => Some((u, String::new())),
            _ => None,
        };
        Ok(Self {
            http,
            url,
            auth,
            pool_address,
            min_confirmations,
            send_lock: Mutex::new(()),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "zec-miden-bridge",
            "method": method,
            "params": params,
        });
        let mut request = self.http.post(&self.url).json(&body);
        if let Some((user, password)) = &self.auth {
            request = request.basic_auth(user, Some(password));
        }
        let response = request.send().await.map_err(classify_transport)?;
        if response.status().as_u16() == 429 {
            return Err(ChainError::RateLimited);
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{method}: {e}")))?;
        let error = &value["error"];
        if !error.is_null() {
            return Err(classify_rpc_error(method, error));
        }
        Ok(value["result"].clone())
    }
}

impl ZcashChain for ZcashRpcClient {
    async fn current_tip(&self) -> Result<u64, ChainError> {
        let info = self.call("getblockchaininfo", json!([])).await?;
        info["blocks"]
            .as_u64()
            .ok_or_else(|| ChainError::Malformed("getblockchaininfo: no blocks field".into()))
    }

    async fn scan_from(&self, from_block: u64) -> Result<Vec<ConfirmedTx>, ChainError> {
        let tip = self.current_tip().await?;
        let unspent = self
            .call(
                "z_listunspent",
                json!([self.min_confirmations, 9_999_999, false, [self.pool_address]]),
            )
            .await?;
        let entries = unspent
            .as_array()
            .ok_or_else(|| ChainError::Malformed("z_listunspent: not an array".into()))?;
        let txs = group_unspent(tip, from_block, entries)?;
        debug!(tip, from_block, txs = txs.len(), "scanned pool deposits");
        Ok(txs)
    }

    async fn send_shielded(
        &self,
        dest_address: &str,
        amount_base: u64,
        memo: Option<&[u8]>,
    ) -> Result<String, ChainError> {
        // Scoped acquisition of the spending key; released on all exit
        // paths when the guard drops.
        let _guard = self.send_lock.lock().await;

        let amount_text = wire::zatoshis_to_zec_string(amount_base);
        let amount_number = serde_json::Number::from_string_unchecked(amount_text);
        let mut recipient = json!({
            "address": dest_address,
            "amount": Value::Number(amount_number),
        });
        if let Some(memo) = memo {
            recipient["memo"] = Value::String(hex::encode(memo));
        }

        let opid = self
            .call(
                "z_sendmany",
                json!([self.pool_address, [recipient], self.min_confirmations]),
            )
            .await?;
        let opid = opid
            .as_str()
            .ok_or_else(|| ChainError::Malformed("z_sendmany: no operation id".into()))?
            .to_string();

        for _ in 0..SEND_POLL_ATTEMPTS {
            tokio::time::sleep(SEND_POLL_INTERVAL).await;
            let status = self
                .call("z_getoperationstatus", json!([[opid]]))
                .await?;
            match parse_operation_status(&status) {
                OperationStatus::Success(txid) => return Ok(txid),
                OperationStatus::Failed(message) => {
                    return Err(classify_send_failure(&message));
                }
                OperationStatus::Pending => continue,
            }
        }
        // Stop waiting for confirmation, do not re-submit.
        Err(ChainError::Timeout)
    }

    async fn get_balance(&self) -> Result<PoolFunds, ChainError> {
        let balance = self
            .call("z_gettotalbalance", json!([self.min_confirmations]))
            .await?;
        let total_base = amount_field_base(&balance["total"])?;
        let spendable_base = amount_field_base(&balance["private"])?;
        Ok(PoolFunds {
            total_base,
            spendable_base,
        })
    }
}

// ---------------------------------------------------------------------------
// Response parsing (pure, tested below)
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum OperationStatus {
    Success(String),
    Failed(String),
    Pending,
}

fn parse_operation_status(response: &Value) -> OperationStatus {
    let entry = match response.as_array().and_then(|a| a.first()) {
        Some(entry) => entry,
        None => return OperationStatus::Pending,
    };
    match entry["status"].as_str() {
        Some("success") => match entry["result"]["txid"].as_str() {
            Some(txid) => OperationStatus::Success(txid.to_string()),
            None => OperationStatus::Failed("success without txid".into()),
        },
        Some("failed") => OperationStatus::Failed(
            entry["error"]["message"]
                .as_str()
                .unwrap_or("unknown failure")
                .to_string(),
        ),
        _ => OperationStatus::Pending,
    }
}

/// Groups `z_listunspent` entries into per-tx deposits at or beyond
/// the cursor block. Heights derive from confirmation counts against
/// the given tip.
fn group_unspent(
    tip: u64,
    from_block: u64,
    entries: &[Value],
) -> Result<Vec<ConfirmedTx>, ChainError> {
    let mut grouped: BTreeMap<(u64, String), Vec<PoolOutput>> = BTreeMap::new();
    for entry in entries {
        let txid = entry["txid"]
            .as_str()
            .ok_or_else(|| ChainError::Malformed("unspent entry without txid".into()))?;
        let confirmations = entry["confirmations"]
            .as_u64()
            .ok_or_else(|| ChainError::Malformed("unspent entry without confirmations".into()))?;
        if confirmations == 0 || confirmations > tip {
            continue;
        }
        let height = tip + 1 - confirmations;
        if height < from_block {
            continue;
        }
        let amount_base = amount_field_base(&entry["amount"])?;
        let memo = match entry["memo"].as_str() {
            Some(hex_memo) => hex::decode(hex_memo)
                .map_err(|e| ChainError::Malformed(format!("memo hex: {e}")))?,
            None => Vec::new(),
        };
        grouped
            .entry((height, txid.to_string()))
            .or_default()
            .push(PoolOutput { amount_base, memo });
    }
    Ok(grouped
        .into_iter()
        .map(|((block_height, txid), outputs)| ConfirmedTx {
            txid,
            block_height,
            outputs,
        })
        .collect())
}

/// Amounts arrive as decimal JSON numbers or strings, in coins. The
/// raw token goes through integer parsing; floats never touch the
/// value.
fn amount_field_base(value: &Value) -> Result<u64, ChainError> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(ChainError::Malformed(format!(
                "unexpected amount value: {other}"
            )))
        }
    };
    wire::zec_to_zatoshis(&text).map_err(|e| ChainError::Malformed(e.to_string()))
}

fn classify_transport(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else {
        ChainError::NodeUnavailable(e.to_string())
    }
}

fn classify_rpc_error(method: &str, error: &Value) -> ChainError {
    let code = error["code"].as_i64().unwrap_or(0);
    let message = error["message"].as_str().unwrap_or("").to_string();
    let lower = message.to_lowercase();
    if code == -28 || lower.contains("loading") || lower.contains("warming up") {
        return ChainError::NodeUnavailable(message);
    }
    if lower.contains("insufficient") {
        return ChainError::InsufficientFunds;
    }
    if lower.contains("expir") {
        return ChainError::ExpiryRejected;
    }
    ChainError::Rpc(format!("{method}: {message}"))
}

fn classify_send_failure(message: &str) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("insufficient") {
        ChainError::InsufficientFunds
    } else if lower.contains("expir") {
        ChainError::ExpiryRejected
    } else {
        ChainError::Rpc(format!("z_sendmany: {message}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_outputs_by_tx_and_orders_by_height() {
        let entries = vec![
            json!({"txid": "bb", "confirmations": 1, "amount": "0.2", "memo": "00"}),
            json!({"txid": "aa", "confirmations": 3, "amount": "0.1", "memo": "ff"}),
            json!({"txid": "bb", "confirmations": 1, "amount": "0.3", "memo": "00"}),
        ];
        let txs = group_unspent(100, 0, &entries).unwrap();
        assert_eq!(txs.len(), 2);
        assert_eq!(txs[0].txid, "aa");
        assert_eq!(txs[0].block_height, 98);
        assert_eq!(txs[1].txid, "bb");
        assert_eq!(txs[1].block_height, 100);
        assert_eq!(txs[1].total_base(), 50_000_000);
    }

    #[test]
    fn scan_skips_below_cursor() {
        let entries = vec![
            json!({"txid": "old", "confirmations": 50, "amount": "1", "memo": "00"}),
            json!({"txid": "new", "confirmations": 1, "amount": "1", "memo": "00"}),
        ];
        let txs = group_unspent(100, 60, &entries).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].txid, "new");
    }

    #[test]
    fn scan_skips_unconfirmed() {
        let entries = vec![json!({"txid": "mempool", "confirmations": 0, "amount": "1"})];
        assert!(group_unspent(100, 0, &entries).unwrap().is_empty());
    }

    #[test]
    fn operation_status_parses_lifecycle() {
        let pending = json!([{"status": "executing"}]);
        assert_eq!(parse_operation_status(&pending), OperationStatus::Pending);

        let success = json!([{"status": "success", "result": {"txid": "deadbeef"}}]);
        assert_eq!(
            parse_operation_status(&success),
            OperationStatus::Success("deadbeef".into())
        );

        let failed = json!([{"status": "failed", "error": {"message": "boom"}}]);
        assert_eq!(
            parse_operation_status(&failed),
            OperationStatus::Failed("boom".into())
        );
    }

    #[test]
    fn rpc_errors_classify_by_kind() {
        let err = classify_rpc_error("z_sendmany", &json!({"code": -6, "message": "Insufficient funds"}));
        assert_eq!(err, ChainError::InsufficientFunds);

        let err = classify_rpc_error("getblockchaininfo", &json!({"code": -28, "message": "Loading block index..."}));
        assert!(matches!(err, ChainError::NodeUnavailable(_)));
        assert!(err.is_transient());

        let err = classify_rpc_error("z_sendmany", &json!({"code": -4, "message": "tx expired"}));
        assert_eq!(err, ChainError::ExpiryRejected);
        assert!(!err.is_transient());
    }

    #[test]
    fn amounts_accept_numbers_and_strings() {
        assert_eq!(amount_field_base(&json!("0.30000000")).unwrap(), 30_000_000);
        let number: Value = serde_json::from_str("0.30000000").unwrap();
        assert_eq!(amount_field_base(&number).unwrap(), 30_000_000);
        assert!(amount_field_base(&json!(null)).is_err());
    }
}
