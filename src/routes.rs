//! HTTP facade (task H). The UI drives deposits and withdrawals
//! through these handlers; the relayers' correctness depends only on
//! the store rows they create, never on request ordering.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::config::BridgeConfig;
use crate::derive;
use crate::error::AppError;
use crate::miden::MidenChain;
use crate::store::{Chain, CursorStore, IntentStore, SqliteStore, WithdrawalStore};
use crate::wire;

pub struct AppState<M> {
    pub store: Arc<SqliteStore>,
    pub miden: Arc<M>,
    pub config: BridgeConfig,
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DepositHashParams {
    pub account_id: String,
    pub secret: String,
}

#[derive(Debug, Deserialize)]
pub struct AccountBalanceRequest {
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalCreateRequest {
    pub account_id: String,
    pub zcash_address: String,
    /// Base units (1 native = 10^8).
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct NoteConsumeRequest {
    pub account_id: String,
    pub secret: String,
    pub faucet_id: Option<String>,
    #[serde(default)]
    pub amount: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "zec-miden-bridge",
    }))
}

pub async fn status<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
) -> Result<impl IntoResponse, AppError> {
    let cursor_block = state.store.get_cursor(Chain::Zcash).await?;
    let deposits = state.store.deposit_counts().await?;
    let withdrawals = state.store.withdrawal_counts().await?;
    let unclaimable = state.store.list_unclaimable().await?;
    let as_map = |counts: Vec<(String, u64)>| {
        counts
            .into_iter()
            .map(|(status, count)| (status, serde_json::Value::from(count)))
            .collect::<serde_json::Map<_, _>>()
    };
    Ok(Json(json!({
        "success": true,
        "zcash_scan_height": cursor_block,
        "deposits": as_map(deposits),
        "withdrawals": as_map(withdrawals),
        "unclaimable": unclaimable,
        "zcash_relayer_interval_secs": state.config.zcash_relayer_interval_secs,
        "miden_relayer_interval_secs": state.config.miden_relayer_interval_secs,
    })))
}

/// `GET /deposit/hash?account_id=&secret=`: derive the recipient hash
/// for a deposit. The secret arrives only for the derivation and is
/// not stored; the intent row carries the public account id and hash.
pub async fn deposit_hash<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
    Query(params): Query<DepositHashParams>,
) -> Result<impl IntoResponse, AppError> {
    let account = derive::parse_account_id(&params.account_id)?;
    let secret = derive::parse_secret(&params.secret)?;
    let hash = derive::recipient_hash(&account, &secret);

    let intent = state
        .store
        .upsert_intent(Some(&account.to_hex()), &hash)
        .await?;
    info!(intent = intent.id, recipient_hash = %hash, "deposit hash issued");

    Ok(Json(json!({
        "success": true,
        "recipient_hash": hash.to_hex(),
    })))
}

pub async fn account_balance<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
    Json(request): Json<AccountBalanceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let account = derive::parse_account_id(&request.account_id)?;
    let balance = state.miden.account_balance(account).await?;
    Ok(Json(json!({ "success": true, "balance": balance })))
}

pub async fn pool_balance<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
) -> Result<impl IntoResponse, AppError> {
    let balance = state.miden.pool_balance().await?;
    Ok(Json(json!({ "success": true, "balance": balance })))
}

/// `POST /withdrawal/create`: announce a withdrawal so the relayer
/// can match the exit note when it lands. Returns the withdrawal id;
/// the rollup consumption tx only exists once the note is processed.
pub async fn withdrawal_create<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
    Json(request): Json<WithdrawalCreateRequest>,
) -> Result<impl IntoResponse, AppError> {
    let account = derive::parse_account_id(&request.account_id)?;
    wire::validate_zcash_address(&request.zcash_address)
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    if request.amount == 0 {
        return Err(AppError::BadRequest("amount must be > 0".into()));
    }

    let withdrawal = state
        .store
        .create_withdrawal(
            Some(&account.to_hex()),
            &request.zcash_address,
            request.amount,
        )
        .await?;
    info!(
        withdrawal = %withdrawal.id,
        amount_base = request.amount,
        "withdrawal announced"
    );

    Ok(Json(json!({
        "success": true,
        "transaction_id": withdrawal.id,
    })))
}

/// `POST /note/consume`: claim-mode fallback for server-custodied
/// accounts: the bridge consumes the P2IDH note with the supplied
/// secret on the account's behalf.
pub async fn note_consume<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
    Json(request): Json<NoteConsumeRequest>,
) -> Result<impl IntoResponse, AppError> {
    let account = derive::parse_account_id(&request.account_id)?;
    let secret = derive::parse_secret(&request.secret)?;
    if let Some(faucet) = &request.faucet_id {
        let faucet = derive::parse_account_id(faucet)?;
        let configured = derive::parse_account_id(&state.config.faucet_id)?;
        if faucet != configured {
            return Err(AppError::BadRequest("unknown faucet id".into()));
        }
    }

    let (tx_id, note_id) = state
        .miden
        .consume_claim(account, &secret, request.amount)
        .await?;
    Ok(Json(json!({
        "success": true,
        "transaction_id": tx_id,
        "note_id": note_id,
    })))
}

/// `POST /account/create`: server-custodied onboarding; the primary
/// flow keeps keys in the browser's rollup store.
pub async fn account_create<M: MidenChain>(
    State(state): State<Arc<AppState<M>>>,
) -> Result<impl IntoResponse, AppError> {
    let (account_id, account_id_hex) = state.miden.create_account().await?;
    info!(account_id = %account_id, "created server-custodied account");
    Ok(Json(json!({
        "success": true,
        "account_id": account_id,
        "account_id_hex": account_id_hex,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DepositStatus;
    use crate::testing::MockMiden;
    use miden_objects::account::AccountId;
    use miden_objects::testing::account_id::ACCOUNT_ID_REGULAR_PUBLIC_ACCOUNT_UPDATABLE_CODE;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            host: "127.0.0.1".into(),
            port: 0,
            zcash_rpc_url: "http://localhost:18232".into(),
            zcash_rpc_user: None,
            zcash_rpc_password: None,
            pool_address: "utest1pool".into(),
            zcash_min_confirmations: 1,
            zcash_relayer_interval_secs: 5,
            miden_rpc_url: "https://rpc.testnet.miden.io".into(),
            miden_store_path: ":memory:".into(),
            miden_keystore_path: "keystore".into(),
            faucet_id: test_account().to_hex(),
            bridge_account_id: test_account().to_hex(),
            miden_relayer_interval_secs: 10,
            exit_tag: crate::config::DEFAULT_EXIT_TAG,
            max_mint_attempts: 8,
            dust_threshold_base: 0,
            db_path: ":memory:".into(),
            allowed_origins: Vec::new(),
        }
    }

    fn test_account() -> AccountId {
        AccountId::try_from(ACCOUNT_ID_REGULAR_PUBLIC_ACCOUNT_UPDATABLE_CODE).unwrap()
    }

    fn test_state() -> Arc<AppState<MockMiden>> {
        Arc::new(AppState {
            store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            miden: Arc::new(MockMiden::new()),
            config: test_config(),
        })
    }

    fn secret_hex(last: u8) -> String {
        let mut bytes = [0u8; 32];
        bytes[31] = last;
        hex::encode(bytes)
    }

    fn test_addr() -> String {
        let hrp = bech32::Hrp::parse("utest").unwrap();
        bech32::encode::<bech32::Bech32m>(hrp, &[7u8; 40]).unwrap()
    }

    #[tokio::test]
    async fn deposit_hash_creates_intent_and_is_deterministic() {
        let state = test_state();
        let account = test_account();

        deposit_hash(
            State(state.clone()),
            Query(DepositHashParams {
                account_id: account.to_hex(),
                secret: secret_hex(1),
            }),
        )
        .await
        .unwrap();

        let secret = derive::parse_secret(&secret_hex(1)).unwrap();
        let expected = derive::recipient_hash(&account, &secret);
        let intent = state.store.intent_by_hash(&expected).await.unwrap().unwrap();
        assert_eq!(intent.status, DepositStatus::Open);
        assert_eq!(intent.account_id.as_deref(), Some(account.to_hex().as_str()));

        // Second call with the same inputs lands on the same intent.
        deposit_hash(
            State(state.clone()),
            Query(DepositHashParams {
                account_id: account.to_hex(),
                secret: secret_hex(1),
            }),
        )
        .await
        .unwrap();
        let again = state.store.intent_by_hash(&expected).await.unwrap().unwrap();
        assert_eq!(again.id, intent.id);
    }

    #[tokio::test]
    async fn deposit_hash_rejects_malformed_inputs() {
        let state = test_state();
        let err = deposit_hash(
            State(state.clone()),
            Query(DepositHashParams {
                account_id: test_account().to_hex(),
                secret: "abcd".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::MalformedSecret));

        let err = deposit_hash(
            State(state),
            Query(DepositHashParams {
                account_id: "garbage".into(),
                secret: secret_hex(1),
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::MalformedAccountId));
    }

    #[tokio::test]
    async fn withdrawal_create_persists_open_row() {
        let state = test_state();
        withdrawal_create(
            State(state.clone()),
            Json(WithdrawalCreateRequest {
                account_id: test_account().to_hex(),
                zcash_address: test_addr(),
                amount: 50_000_000,
            }),
        )
        .await
        .unwrap();

        let counts = state.store.withdrawal_counts().await.unwrap();
        assert_eq!(counts, vec![("open".to_string(), 1)]);
    }

    #[tokio::test]
    async fn withdrawal_create_rejects_bad_input() {
        let state = test_state();
        let err = withdrawal_create(
            State(state.clone()),
            Json(WithdrawalCreateRequest {
                account_id: test_account().to_hex(),
                zcash_address: "tm-transparent".into(),
                amount: 1,
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err = withdrawal_create(
            State(state),
            Json(WithdrawalCreateRequest {
                account_id: test_account().to_hex(),
                zcash_address: test_addr(),
                amount: 0,
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn note_consume_rejects_unknown_faucet() {
        let state = test_state();
        // Any valid-but-different account id; the sentinel faucet in
        // the config will not match the bridge account used here.
        let other = miden_objects::testing::account_id::ACCOUNT_ID_PUBLIC_FUNGIBLE_FAUCET;
        let err = note_consume(
            State(state),
            Json(NoteConsumeRequest {
                account_id: test_account().to_hex(),
                secret: secret_hex(2),
                faucet_id: Some(AccountId::try_from(other).unwrap().to_hex()),
                amount: 0,
            }),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
