//! Scripted mock chain clients for relayer tests. Outcomes are queued
//! per call; calls are recorded so tests can assert exactly-once
//! effects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use miden_objects::account::AccountId;

use crate::derive::{RecipientHash, Secret};
use crate::error::ChainError;
use crate::miden::{ExitNote, MidenChain};
use crate::wire::COIN;
use crate::zcash::{ConfirmedTx, PoolFunds, PoolOutput, ZcashChain};

pub fn deposit_tx(txid: &str, block_height: u64, memo_text: &str, amount_base: u64) -> ConfirmedTx {
    let mut memo = memo_text.as_bytes().to_vec();
    memo.resize(512, 0);
    ConfirmedTx {
        txid: txid.to_string(),
        block_height,
        outputs: vec![PoolOutput { amount_base, memo }],
    }
}

pub fn exit_note(id: &str, destination: &str, amount_base: u64) -> ExitNote {
    ExitNote {
        id: id.to_string(),
        destination_address: destination.to_string(),
        amount_base,
    }
}

pub struct MockZcash {
    tip: u64,
    pub txs: Mutex<Vec<ConfirmedTx>>,
    pub sent: Mutex<Vec<(String, u64)>>,
    send_failures: Mutex<VecDeque<ChainError>>,
}

impl MockZcash {
    pub fn new(tip: u64) -> Self {
        Self {
            tip,
            txs: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            send_failures: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_tx(&self, tx: ConfirmedTx) {
        self.txs.lock().unwrap().push(tx);
    }

    pub fn fail_next_send(&self, error: ChainError) {
        self.send_failures.lock().unwrap().push_back(error);
    }
}

impl ZcashChain for MockZcash {
    async fn current_tip(&self) -> Result<u64, ChainError> {
        Ok(self.tip)
    }

    async fn scan_from(&self, from_block: u64) -> Result<Vec<ConfirmedTx>, ChainError> {
        Ok(self
            .txs
            .lock()
            .unwrap()
            .iter()
            .filter(|tx| tx.block_height >= from_block)
            .cloned()
            .collect())
    }

    async fn send_shielded(
        &self,
        dest_address: &str,
        amount_base: u64,
        _memo: Option<&[u8]>,
    ) -> Result<String, ChainError> {
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((dest_address.to_string(), amount_base));
        Ok(format!("zectx-{}", sent.len()))
    }

    async fn get_balance(&self) -> Result<PoolFunds, ChainError> {
        Ok(PoolFunds {
            total_base: 10 * COIN,
            spendable_base: 10 * COIN,
        })
    }
}

pub struct MockMiden {
    pub minted: Mutex<Vec<(RecipientHash, u64, String)>>,
    pub consumed: Mutex<Vec<String>>,
    exit_notes: Mutex<Vec<ExitNote>>,
    mint_failures: Mutex<VecDeque<ChainError>>,
    consume_failures: Mutex<VecDeque<ChainError>>,
    /// When set, consumed notes stay listed; models the window before
    /// a consumption is reflected by the rollup.
    keep_listed: AtomicBool,
}

impl MockMiden {
    pub fn new() -> Self {
        Self {
            minted: Mutex::new(Vec::new()),
            consumed: Mutex::new(Vec::new()),
            exit_notes: Mutex::new(Vec::new()),
            mint_failures: Mutex::new(VecDeque::new()),
            consume_failures: Mutex::new(VecDeque::new()),
            keep_listed: AtomicBool::new(false),
        }
    }

    pub fn push_exit_note(&self, note: ExitNote) {
        self.exit_notes.lock().unwrap().push(note);
    }

    pub fn fail_next_mint(&self, error: ChainError) {
        self.mint_failures.lock().unwrap().push_back(error);
    }

    pub fn fail_next_consume(&self, error: ChainError) {
        self.consume_failures.lock().unwrap().push_back(error);
    }

    pub fn keep_notes_listed(&self, keep: bool) {
        self.keep_listed.store(keep, Ordering::Relaxed);
    }
}

impl MidenChain for MockMiden {
    async fn sync(&self) -> Result<(), ChainError> {
        Ok(())
    }

    async fn mint_p2idh(
        &self,
        recipient_hash: &RecipientHash,
        amount_base: u64,
    ) -> Result<String, ChainError> {
        if let Some(error) = self.mint_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut minted = self.minted.lock().unwrap();
        let note_id = format!("mnote-{}", minted.len() + 1);
        minted.push((*recipient_hash, amount_base, note_id.clone()));
        Ok(note_id)
    }

    async fn list_consumable_exit_notes(&self) -> Result<Vec<ExitNote>, ChainError> {
        let consumed = self.consumed.lock().unwrap();
        let keep = self.keep_listed.load(Ordering::Relaxed);
        Ok(self
            .exit_notes
            .lock()
            .unwrap()
            .iter()
            .filter(|note| keep || !consumed.contains(&note.id))
            .cloned()
            .collect())
    }

    async fn consume_note(&self, note_id: &str) -> Result<String, ChainError> {
        if let Some(error) = self.consume_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        let mut consumed = self.consumed.lock().unwrap();
        consumed.push(note_id.to_string());
        Ok(format!("rolluptx-{}", consumed.len()))
    }

    async fn pool_balance(&self) -> Result<u64, ChainError> {
        Ok(0)
    }

    async fn account_balance(&self, _account_id: AccountId) -> Result<u64, ChainError> {
        Ok(0)
    }

    async fn consume_claim(
        &self,
        _account_id: AccountId,
        _secret: &Secret,
        _amount_base: u64,
    ) -> Result<(String, String), ChainError> {
        Err(ChainError::Rpc("not scripted".into()))
    }

    async fn create_account(&self) -> Result<(String, String), ChainError> {
        Ok(("mtst1mockaccount".into(), "0xmockaccount".into()))
    }
}
