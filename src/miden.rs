//! Miden chain client: adapter over the rollup SDK. The bridge account
//! and the wrapped-asset faucet are fixed at startup; all transaction
//! building serialises on one lock because the rollup enforces nonce
//! ordering on account state updates.

use std::future::Future;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::RngCore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use miden_client::account::component::{BasicWallet, RpoFalcon512};
use miden_client::account::{AccountBuilder, AccountId, AccountStorageMode, AccountType};
use miden_client::asset::{Asset, FungibleAsset};
use miden_client::auth::AuthSecretKey;
use miden_client::builder::ClientBuilder;
use miden_client::crypto::{FeltRng, SecretKey};
use miden_client::keystore::FilesystemKeyStore;
use miden_client::note::{
    Note, NoteAssets, NoteExecutionHint, NoteExecutionMode, NoteInputs, NoteMetadata,
    NoteRecipient, NoteScript, NoteTag, NoteType,
};
use miden_client::rpc::{Endpoint, TonicRpcClient};
use miden_client::transaction::{OutputNote, TransactionKernel, TransactionRequestBuilder};
use miden_client::{Client, ClientError, Felt};
use miden_objects::account::NetworkId;
use miden_objects::note::NoteId;

use crate::config::BridgeConfig;
use crate::derive::{self, RecipientHash, Secret};
use crate::error::ChainError;
use crate::wire;

/// Per-RPC deadline, milliseconds.
const RPC_TIMEOUT_MS: u64 = 10_000;

/// The hash-locked note script. Consumable only by an account whose id,
/// combined with the secret passed as note args, reproduces the
/// recipient hash stored in the note inputs.
const P2IDH_NOTE_CODE: &str = include_str!("../masm/p2idh_note.masm");

/// An exit note observed on the bridge account: a burn of wrapped
/// tokens carrying the shielded destination for the payout.
#[derive(Debug, Clone)]
pub struct ExitNote {
    pub id: String,
    pub destination_address: String,
    pub amount_base: u64,
}

pub trait MidenChain: Send + Sync + 'static {
    fn sync(&self) -> impl Future<Output = Result<(), ChainError>> + Send;

    /// Mints a P2IDH note of the wrapped asset locked to the recipient
    /// hash. Returns the note id.
    fn mint_p2idh(
        &self,
        recipient_hash: &RecipientHash,
        amount_base: u64,
    ) -> impl Future<Output = Result<String, ChainError>> + Send;

    /// Exit-tagged notes currently consumable by the bridge account.
    fn list_consumable_exit_notes(
        &self,
    ) -> impl Future<Output = Result<Vec<ExitNote>, ChainError>> + Send;

    /// Consumes one exit note with the bridge account. Returns the
    /// rollup transaction id.
    fn consume_note(
        &self,
        note_id: &str,
    ) -> impl Future<Output = Result<String, ChainError>> + Send;

    /// The custodial pool's wrapped-asset reserve.
    fn pool_balance(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Wrapped-asset balance of an arbitrary account.
    fn account_balance(
        &self,
        account_id: AccountId,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    /// Claim-mode fallback: consume a P2IDH note on behalf of a
    /// server-custodied account. Returns `(tx_id, note_id)`.
    fn consume_claim(
        &self,
        account_id: AccountId,
        secret: &Secret,
        amount_base: u64,
    ) -> impl Future<Output = Result<(String, String), ChainError>> + Send;

    /// Creates a fresh basic wallet account in the bridge's store.
    /// Returns `(bech32_id, hex_id)`.
    fn create_account(
        &self,
    ) -> impl Future<Output = Result<(String, String), ChainError>> + Send;
}

pub struct MidenBridge {
    client: Mutex<Client>,
    keystore: FilesystemKeyStore<StdRng>,
    bridge_account_id: AccountId,
    faucet_id: AccountId,
    exit_tag: NoteTag,
    note_script: NoteScript,
    network: NetworkId,
}

impl MidenBridge {
    pub async fn connect(config: &BridgeConfig) -> Result<Self, ChainError> {
        let (protocol, host, port) = parse_endpoint(&config.miden_rpc_url)?;
        let endpoint = Endpoint::new(protocol, host, port);
        let rpc_api = Arc::new(TonicRpcClient::new(&endpoint, RPC_TIMEOUT_MS));

        let keystore = FilesystemKeyStore::new(config.miden_keystore_path.clone().into())
            .map_err(|e| ChainError::Rpc(format!("keystore: {e}")))?;

        let mut client = ClientBuilder::new()
            .rpc(rpc_api)
            .filesystem_keystore(&config.miden_keystore_path)
            .sqlite_store(&config.miden_store_path)
            .build()
            .await
            .map_err(classify_client)?;

        let bridge_account_id = derive::parse_account_id(&config.bridge_account_id)
            .map_err(|e| ChainError::Malformed(format!("BRIDGE_ACCOUNT_ID: {e}")))?;
        let faucet_id = derive::parse_account_id(&config.faucet_id)
            .map_err(|e| ChainError::Malformed(format!("FAUCET_ID: {e}")))?;

        let exit_tag = NoteTag::for_public_use_case(config.exit_tag, 0, NoteExecutionMode::Local)
            .map_err(|e| ChainError::Malformed(format!("EXIT_TAG: {e}")))?;

        let note_script = NoteScript::compile(P2IDH_NOTE_CODE, TransactionKernel::assembler())
            .map_err(|e| ChainError::Malformed(format!("note script: {e}")))?;

        // The bridge account must be tracked before it can consume
        // notes; its signing key is provisioned in the keystore.
        if client
            .get_account(bridge_account_id)
            .await
            .map_err(classify_client)?
            .is_none()
        {
            client
                .import_account_by_id(bridge_account_id)
                .await
                .map_err(classify_client)?;
            info!(account = %bridge_account_id.to_hex(), "imported bridge account");
        }

        Ok(Self {
            client: Mutex::new(client),
            keystore,
            bridge_account_id,
            faucet_id,
            exit_tag,
            note_script,
            network: NetworkId::Testnet,
        })
    }

    async fn vault_balance(
        client: &mut Client,
        account_id: AccountId,
        faucet_id: AccountId,
    ) -> Result<Option<u64>, ChainError> {
        let record = client.get_account(account_id).await.map_err(classify_client)?;
        Ok(record.map(|r| r.account().vault().get_balance(faucet_id).unwrap_or(0)))
    }
}

impl MidenChain for MidenBridge {
    async fn sync(&self) -> Result<(), ChainError> {
        let mut client = self.client.lock().await;
        let summary = client.sync_state().await.map_err(classify_client)?;
        debug!(block = %summary.block_num, "rollup state synced");
        Ok(())
    }

    async fn mint_p2idh(
        &self,
        recipient_hash: &RecipientHash,
        amount_base: u64,
    ) -> Result<String, ChainError> {
        let mut client = self.client.lock().await;

        let asset = FungibleAsset::new(self.faucet_id, amount_base)
            .map_err(|e| ChainError::Malformed(format!("asset: {e}")))?;
        let serial_num = client.rng().draw_word();
        let inputs = NoteInputs::new(recipient_hash.to_felts().to_vec())
            .map_err(|e| ChainError::Malformed(format!("note inputs: {e}")))?;
        let recipient = NoteRecipient::new(serial_num, self.note_script.clone(), inputs);
        let tag = NoteTag::for_public_use_case(0, 0, NoteExecutionMode::Local)
            .map_err(|e| ChainError::Malformed(format!("note tag: {e}")))?;
        let metadata = NoteMetadata::new(
            self.faucet_id,
            NoteType::Public,
            tag,
            NoteExecutionHint::always(),
            Felt::new(0),
        )
        .map_err(|e| ChainError::Malformed(format!("note metadata: {e}")))?;
        let assets = NoteAssets::new(vec![asset.into()])
            .map_err(|e| ChainError::Malformed(format!("note assets: {e}")))?;
        let note = Note::new(assets, metadata, recipient);
        let note_id = note.id().to_hex();

        let request = TransactionRequestBuilder::new()
            .own_output_notes(vec![OutputNote::Full(note)])
            .build()
            .map_err(|e| ChainError::Malformed(format!("mint request: {e}")))?;
        let tx = client
            .new_transaction(self.faucet_id, request)
            .await
            .map_err(classify_client)?;
        client.submit_transaction(tx).await.map_err(classify_client)?;

        info!(note_id = %note_id, amount_base, "minted hash-locked note");
        Ok(note_id)
    }

    async fn list_consumable_exit_notes(&self) -> Result<Vec<ExitNote>, ChainError> {
        let mut client = self.client.lock().await;
        let consumable = client
            .get_consumable_notes(Some(self.bridge_account_id))
            .await
            .map_err(classify_client)?;

        let mut notes = Vec::new();
        for (record, _relevance) in consumable {
            let Some(metadata) = record.metadata() else {
                continue;
            };
            if metadata.tag() != self.exit_tag {
                continue;
            }
            let note_id = record.id().to_hex();
            let inputs = record.details().recipient().inputs().values().to_vec();
            let (destination_address, amount_base) = match wire::decode_exit_payload(&inputs) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(note_id = %note_id, error = %e, "exit note with undecodable payload, skipping");
                    continue;
                }
            };
            let carried: u64 = record
                .details()
                .assets()
                .iter()
                .filter_map(|asset| match asset {
                    Asset::Fungible(fa) if fa.faucet_id() == self.faucet_id => Some(fa.amount()),
                    _ => None,
                })
                .sum();
            if carried != amount_base {
                warn!(
                    note_id = %note_id,
                    declared = amount_base,
                    carried,
                    "exit note amount mismatch, held for operator"
                );
                continue;
            }
            notes.push(ExitNote {
                id: note_id,
                destination_address,
                amount_base,
            });
        }
        Ok(notes)
    }

    async fn consume_note(&self, note_id: &str) -> Result<String, ChainError> {
        let mut client = self.client.lock().await;
        let parsed = NoteId::try_from_hex(note_id)
            .map_err(|e| ChainError::Malformed(format!("note id: {e}")))?;
        let request = TransactionRequestBuilder::new()
            .authenticated_input_notes([(parsed, None)])
            .build()
            .map_err(|e| ChainError::Malformed(format!("consume request: {e}")))?;
        let tx = client
            .new_transaction(self.bridge_account_id, request)
            .await
            .map_err(classify_client)?;
        let tx_id = tx.executed_transaction().id().to_hex();
        client.submit_transaction(tx).await.map_err(classify_client)?;
        info!(note_id = %note_id, tx_id = %tx_id, "consumed exit note");
        Ok(tx_id)
    }

    async fn pool_balance(&self) -> Result<u64, ChainError> {
        let mut client = self.client.lock().await;
        Self::vault_balance(&mut client, self.bridge_account_id, self.faucet_id)
            .await?
            .ok_or(ChainError::AccountNotReady)
    }

    async fn account_balance(&self, account_id: AccountId) -> Result<u64, ChainError> {
        let mut client = self.client.lock().await;
        if let Some(balance) = Self::vault_balance(&mut client, account_id, self.faucet_id).await? {
            return Ok(balance);
        }
        // Unknown locally; pull the public account state once.
        client
            .import_account_by_id(account_id)
            .await
            .map_err(|_| ChainError::AccountNotReady)?;
        Self::vault_balance(&mut client, account_id, self.faucet_id)
            .await?
            .ok_or(ChainError::AccountNotReady)
    }

    async fn consume_claim(
        &self,
        account_id: AccountId,
        secret: &Secret,
        amount_base: u64,
    ) -> Result<(String, String), ChainError> {
        let expected = derive::recipient_hash(&account_id, secret);
        let expected_inputs = expected.to_felts();

        let mut client = self.client.lock().await;
        client.sync_state().await.map_err(classify_client)?;
        let consumable = client
            .get_consumable_notes(Some(account_id))
            .await
            .map_err(classify_client)?;

        let mut target = None;
        for (record, _relevance) in consumable {
            let inputs = record.details().recipient().inputs().values().to_vec();
            if inputs != expected_inputs {
                continue;
            }
            let carried: u64 = record
                .details()
                .assets()
                .iter()
                .filter_map(|asset| match asset {
                    Asset::Fungible(fa) if fa.faucet_id() == self.faucet_id => Some(fa.amount()),
                    _ => None,
                })
                .sum();
            if amount_base == 0 || carried == amount_base {
                target = Some(record.id());
                break;
            }
        }
        let note_id = target.ok_or_else(|| {
            ChainError::Rpc("no consumable note matches the derived recipient hash".into())
        })?;

        let args: miden_client::Word = secret.to_felts().into();
        let request = TransactionRequestBuilder::new()
            .authenticated_input_notes([(note_id, Some(args))])
            .build()
            .map_err(|e| ChainError::Malformed(format!("claim request: {e}")))?;
        let tx = client
            .new_transaction(account_id, request)
            .await
            .map_err(classify_client)?;
        let tx_id = tx.executed_transaction().id().to_hex();
        client.submit_transaction(tx).await.map_err(classify_client)?;
        Ok((tx_id, note_id.to_hex()))
    }

    async fn create_account(&self) -> Result<(String, String), ChainError> {
        let mut client = self.client.lock().await;

        let mut init_seed = [0u8; 32];
        client.rng().fill_bytes(&mut init_seed);
        let key_pair = SecretKey::with_rng(client.rng());

        let builder = AccountBuilder::new(init_seed)
            .account_type(AccountType::RegularAccountUpdatableCode)
            .storage_mode(AccountStorageMode::Public)
            .with_auth_component(RpoFalcon512::new(key_pair.public_key()))
            .with_component(BasicWallet);
        let (account, seed) = builder
            .build()
            .map_err(|e| ChainError::Malformed(format!("account build: {e}")))?;

        client
            .add_account(&account, Some(seed), false)
            .await
            .map_err(classify_client)?;
        self.keystore
            .add_key(&AuthSecretKey::RpoFalcon512(key_pair))
            .map_err(|e| ChainError::Rpc(format!("keystore: {e}")))?;

        let id = account.id();
        Ok((id.to_bech32(self.network), id.to_hex()))
    }
}

/// Splits an RPC URL into the `(protocol, host, port)` triple the SDK
/// endpoint wants.
fn parse_endpoint(url: &str) -> Result<(String, String, Option<u16>), ChainError> {
    let (protocol, rest) = url
        .split_once("://")
        .ok_or_else(|| ChainError::Malformed(format!("rpc url '{url}'")))?;
    if !matches!(protocol, "http" | "https") {
        return Err(ChainError::Malformed(format!("rpc url scheme '{protocol}'")));
    }
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(ChainError::Malformed(format!("rpc url '{url}'")));
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port
                .parse()
                .map_err(|_| ChainError::Malformed(format!("rpc url port in '{url}'")))?;
            Ok((protocol.to_string(), host.to_string(), Some(port)))
        }
        _ => Ok((protocol.to_string(), rest.to_string(), None)),
    }
}

fn classify_client(e: ClientError) -> ChainError {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("deadline") {
        ChainError::Timeout
    } else if lower.contains("transport")
        || lower.contains("connection")
        || lower.contains("connect")
        || lower.contains("unavailable")
    {
        ChainError::NodeUnavailable(message)
    } else {
        ChainError::Rpc(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing_handles_ports() {
        assert_eq!(
            parse_endpoint("https://rpc.testnet.miden.io:443").unwrap(),
            ("https".into(), "rpc.testnet.miden.io".into(), Some(443))
        );
        assert_eq!(
            parse_endpoint("https://rpc.testnet.miden.io").unwrap(),
            ("https".into(), "rpc.testnet.miden.io".into(), None)
        );
        assert_eq!(
            parse_endpoint("http://localhost:57291/").unwrap(),
            ("http".into(), "localhost".into(), Some(57291))
        );
    }

    #[test]
    fn endpoint_parsing_rejects_garbage() {
        assert!(parse_endpoint("rpc.testnet.miden.io").is_err());
        assert!(parse_endpoint("grpc://host").is_err());
        assert!(parse_endpoint("https://").is_err());
        assert!(parse_endpoint("https://host:notaport").is_err());
    }

    #[test]
    fn exit_tag_accepts_the_default_use_case() {
        NoteTag::for_public_use_case(crate::config::DEFAULT_EXIT_TAG, 0, NoteExecutionMode::Local)
            .unwrap();
    }
}
