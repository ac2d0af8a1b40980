//! Zcash → Miden relayer (task Z): advance the scan cursor, detect new
//! confirmed deposits whose memo parses as a recipient hash, mint a
//! hash-locked note for each, mark the deposit settled.
//!
//! Per source event the ordering observe → claim → mint → mark is
//! total; a tick runs to completion before shutdown is honoured, so
//! cancellation can never split a submission from its store write.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::miden::MidenChain;
use crate::store::{Chain, CursorStore, DepositStatus, IntentStore, SqliteStore};
use crate::wire;
use crate::zcash::{ConfirmedTx, ZcashChain};

/// What to do with the cursor after looking at one deposit.
enum TxOutcome {
    /// Fully handled (minted, duplicate, unclaimable or quarantined).
    Advance,
    /// Transient trouble; stop the tick so the tx is re-observed.
    Stop,
}

pub struct ZcashRelayer<Z, M> {
    zcash: Arc<Z>,
    miden: Arc<M>,
    store: Arc<SqliteStore>,
    interval: Duration,
    max_mint_attempts: u32,
    dust_threshold_base: u64,
}

impl<Z: ZcashChain, M: MidenChain> ZcashRelayer<Z, M> {
    pub fn new(
        zcash: Arc<Z>,
        miden: Arc<M>,
        store: Arc<SqliteStore>,
        interval: Duration,
        max_mint_attempts: u32,
        dust_threshold_base: u64,
    ) -> Self {
        Self {
            zcash,
            miden,
            store,
            interval,
            max_mint_attempts,
            dust_threshold_base,
        }
    }

    /// Runs the scan → claim → mint loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "zcash relayer started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("zcash relayer shutting down");
                    return;
                }
            }
            if *shutdown.borrow() {
                info!("zcash relayer shutting down");
                return;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "zcash relayer tick failed");
            }
        }
    }

    async fn tick(&self) -> Result<(), String> {
        let cursor_block = self
            .store
            .get_cursor(Chain::Zcash)
            .await
            .map_err(|e| format!("cursor: {e}"))?;
        let tip = self
            .zcash
            .current_tip()
            .await
            .map_err(|e| format!("tip: {e}"))?;
        let txs = self
            .zcash
            .scan_from(cursor_block)
            .await
            .map_err(|e| format!("scan: {e}"))?;
        if txs.is_empty() {
            debug!(tip, cursor_block, "no new deposits");
            return Ok(());
        }

        // The cursor is block-granular; within a partially processed
        // block the idempotency log absorbs re-observations, so a tx
        // is never claimed twice.
        for tx in &txs {
            match self.process_deposit(tx).await? {
                TxOutcome::Advance => {
                    self.store
                        .advance_cursor(Chain::Zcash, tx.block_height)
                        .await
                        .map_err(|e| format!("advance cursor: {e}"))?;
                }
                TxOutcome::Stop => return Ok(()),
            }
        }

        // Everything in the batch is settled; next scan starts past it.
        let last = txs.last().expect("non-empty batch");
        self.store
            .advance_cursor(Chain::Zcash, last.block_height + 1)
            .await
            .map_err(|e| format!("advance cursor: {e}"))?;
        Ok(())
    }

    async fn process_deposit(&self, tx: &ConfirmedTx) -> Result<TxOutcome, String> {
        let txid = tx.txid.as_str();

        let mut hash = None;
        let mut memo_reason = "no outputs".to_string();
        for output in &tx.outputs {
            match wire::parse_deposit_memo(&output.memo) {
                Ok(parsed) => {
                    hash = Some(parsed);
                    break;
                }
                Err(e) => memo_reason = e.to_string(),
            }
        }
        let Some(hash) = hash else {
            if self
                .store
                .mark_unclaimable(txid, &memo_reason)
                .await
                .map_err(|e| format!("mark unclaimable: {e}"))?
            {
                warn!(txid, reason = %memo_reason, "deposit memo unclaimable, funds held in pool");
            }
            return Ok(TxOutcome::Advance);
        };

        let total = tx.total_base();
        if self.dust_threshold_base > 0 && total < self.dust_threshold_base {
            if self
                .store
                .mark_unclaimable(txid, &format!("below dust threshold: {total}"))
                .await
                .map_err(|e| format!("mark unclaimable: {e}"))?
            {
                warn!(txid, amount_base = total, "dust deposit held for operator");
            }
            return Ok(TxOutcome::Advance);
        }

        let intent = match self
            .store
            .claim_deposit(txid, &hash, total)
            .await
            .map_err(|e| format!("claim: {e}"))?
        {
            Some(intent) => intent,
            None => {
                // Already claimed. Re-observation after a failed mint
                // comes back through here; pick the row up again.
                match self
                    .store
                    .intent_by_txid(txid)
                    .await
                    .map_err(|e| format!("intent lookup: {e}"))?
                {
                    Some(intent)
                        if intent.status == DepositStatus::Observed
                            && intent.mint_note_id.is_none() =>
                    {
                        intent
                    }
                    _ => return Ok(TxOutcome::Advance),
                }
            }
        };

        // A recorded note id means a previous attempt already minted.
        if intent.mint_note_id.is_some() {
            return Ok(TxOutcome::Advance);
        }

        if intent.attempts > 0 && now_epoch() < intent.next_attempt_at {
            debug!(txid, attempts = intent.attempts, "mint backoff active");
            return Ok(TxOutcome::Stop);
        }

        let attempts = self
            .store
            .record_mint_attempt(intent.id)
            .await
            .map_err(|e| format!("record attempt: {e}"))?;
        if attempts > self.max_mint_attempts {
            error!(txid, attempts, "deposit quarantined after repeated mint failures");
            self.store
                .quarantine_deposit(intent.id, "max mint attempts exceeded")
                .await
                .map_err(|e| format!("quarantine: {e}"))?;
            return Ok(TxOutcome::Advance);
        }

        match self.miden.mint_p2idh(&hash, total).await {
            Ok(note_id) => {
                self.store
                    .mark_minted(intent.id, &note_id)
                    .await
                    .map_err(|e| format!("mark minted: {e}"))?;
                info!(txid, note_id = %note_id, amount_base = total, "deposit minted");
                Ok(TxOutcome::Advance)
            }
            Err(e) => {
                warn!(
                    txid,
                    attempt = attempts,
                    transient = e.is_transient(),
                    error = %e,
                    "mint failed, deposit will be re-observed"
                );
                Ok(TxOutcome::Stop)
            }
        }
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
