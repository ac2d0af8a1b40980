//! Miden → Zcash relayer (task M): consume exit-marked notes on the
//! bridge account and pay the encoded shielded address out of the
//! custodial pool.
//!
//! There is no rollup-side cursor; `list_consumable_exit_notes` is the
//! source of truth and `claim_withdrawal` rejects duplicates. Once an
//! exit note is consumed the wrapped supply is out of circulation, so
//! a withdrawal stuck in consumed-not-paid is owed by the pool and is
//! retried at the top of every tick until the payout lands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ChainError;
use crate::miden::{ExitNote, MidenChain};
use crate::store::{SqliteStore, Withdrawal, WithdrawalStore};
use crate::wire;
use crate::zcash::ZcashChain;

pub struct MidenRelayer<Z, M> {
    zcash: Arc<Z>,
    miden: Arc<M>,
    store: Arc<SqliteStore>,
    interval: Duration,
}

impl<Z: ZcashChain, M: MidenChain> MidenRelayer<Z, M> {
    pub fn new(zcash: Arc<Z>, miden: Arc<M>, store: Arc<SqliteStore>, interval: Duration) -> Self {
        Self {
            zcash,
            miden,
            store,
            interval,
        }
    }

    /// Runs the sync → list → consume → pay loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "miden relayer started");
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("miden relayer shutting down");
                    return;
                }
            }
            if *shutdown.borrow() {
                info!("miden relayer shutting down");
                return;
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "miden relayer tick failed");
            }
        }
    }

    async fn tick(&self) -> Result<(), String> {
        // Debts first: consumed notes whose payout has not landed.
        self.retry_unpaid().await?;

        self.miden.sync().await.map_err(|e| format!("sync: {e}"))?;
        let notes = self
            .miden
            .list_consumable_exit_notes()
            .await
            .map_err(|e| format!("list exit notes: {e}"))?;
        if notes.is_empty() {
            debug!("no consumable exit notes");
            return Ok(());
        }

        for note in &notes {
            if let Err(e) = self.process_exit_note(note).await {
                warn!(note_id = %note.id, error = %e, "exit note processing failed");
            }
        }
        Ok(())
    }

    async fn retry_unpaid(&self) -> Result<(), String> {
        let owed = self
            .store
            .list_consumed_unpaid()
            .await
            .map_err(|e| format!("list unpaid: {e}"))?;
        for withdrawal in &owed {
            info!(
                withdrawal = %withdrawal.id,
                amount_base = withdrawal.amount_base,
                "retrying payout for consumed withdrawal"
            );
            self.pay_out(withdrawal).await;
        }
        Ok(())
    }

    async fn process_exit_note(&self, note: &ExitNote) -> Result<(), String> {
        if let Err(e) = wire::validate_zcash_address(&note.destination_address) {
            // Left unconsumed: the wrapped tokens stay in the note and
            // the operator decides what to do with it.
            warn!(note_id = %note.id, error = %e, "exit note with unusable destination");
            return Ok(());
        }

        let withdrawal = match self
            .store
            .claim_withdrawal(&note.id, &note.destination_address, note.amount_base)
            .await
            .map_err(|e| format!("claim: {e}"))?
        {
            Some(withdrawal) => withdrawal,
            None => return Ok(()),
        };

        match self.miden.consume_note(&note.id).await {
            Ok(rollup_txid) => {
                self.store
                    .mark_consumed(&withdrawal.id, &rollup_txid)
                    .await
                    .map_err(|e| format!("mark consumed: {e}"))?;
                info!(
                    withdrawal = %withdrawal.id,
                    note_id = %note.id,
                    rollup_txid = %rollup_txid,
                    "exit note consumed"
                );
            }
            Err(e) => {
                // Compensating write: the note is still on the rollup,
                // make it claimable again next tick.
                warn!(
                    note_id = %note.id,
                    transient = e.is_transient(),
                    error = %e,
                    "consume failed, releasing claim"
                );
                self.store
                    .release_withdrawal(&note.id)
                    .await
                    .map_err(|e| format!("release: {e}"))?;
                return Ok(());
            }
        }

        self.pay_out(&withdrawal).await;
        Ok(())
    }

    /// Sends the shielded payout and records the target txid in the
    /// same store call that flips the row to paid. Failures leave the
    /// row consumed; `retry_unpaid` picks it up next tick.
    async fn pay_out(&self, withdrawal: &Withdrawal) {
        match self
            .zcash
            .send_shielded(&withdrawal.destination_address, withdrawal.amount_base, None)
            .await
        {
            Ok(target_txid) => {
                if let Err(e) = self.store.mark_paid(&withdrawal.id, &target_txid).await {
                    // The send landed; the row will be re-claimed and
                    // the lookup at the top of the retry path stops a
                    // duplicate send.
                    error!(withdrawal = %withdrawal.id, error = %e, "payout recorded on-chain but not in store");
                } else {
                    info!(
                        withdrawal = %withdrawal.id,
                        target_txid = %target_txid,
                        amount_base = withdrawal.amount_base,
                        "withdrawal paid out"
                    );
                }
            }
            Err(ChainError::InsufficientFunds) => match self.zcash.get_balance().await {
                Ok(funds) => error!(
                    withdrawal = %withdrawal.id,
                    needed = withdrawal.amount_base,
                    spendable = funds.spendable_base,
                    "pool cannot cover withdrawal"
                ),
                Err(_) => error!(
                    withdrawal = %withdrawal.id,
                    needed = withdrawal.amount_base,
                    "pool cannot cover withdrawal"
                ),
            },
            Err(e) => {
                warn!(
                    withdrawal = %withdrawal.id,
                    transient = e.is_transient(),
                    error = %e,
                    "payout failed, will retry"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::WithdrawalStatus;
    use crate::testing::{exit_note, MockMiden, MockZcash};

    fn relayer(
        zcash: Arc<MockZcash>,
        miden: Arc<MockMiden>,
        store: Arc<SqliteStore>,
    ) -> MidenRelayer<MockZcash, MockMiden> {
        MidenRelayer::new(zcash, miden, store, Duration::from_secs(10))
    }

    fn test_addr() -> String {
        let hrp = bech32::Hrp::parse("utest").unwrap();
        bech32::encode::<bech32::Bech32m>(hrp, &[7u8; 40]).unwrap()
    }

    #[tokio::test]
    async fn happy_withdrawal_consumes_and_pays() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());
        let addr = test_addr();

        let created = store
            .create_withdrawal(Some("0xabc"), &addr, 50_000_000)
            .await
            .unwrap();
        miden.push_exit_note(exit_note("note-1", &addr, 50_000_000));

        relayer(zcash.clone(), miden.clone(), store.clone())
            .tick()
            .await
            .unwrap();

        assert_eq!(miden.consumed.lock().unwrap().as_slice(), ["note-1"]);
        let sent = zcash.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (addr.clone(), 50_000_000));
        drop(sent);

        let paid = store.withdrawal_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(paid.status, WithdrawalStatus::Paid);
        assert!(paid.rollup_txid.is_some());
        assert!(paid.target_txid.is_some());
    }

    #[tokio::test]
    async fn duplicate_note_delivery_pays_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());
        let addr = test_addr();

        miden.push_exit_note(exit_note("note-1", &addr, 1_000));
        miden.keep_notes_listed(true);

        let relayer = relayer(zcash.clone(), miden.clone(), store.clone());
        relayer.tick().await.unwrap();
        relayer.tick().await.unwrap();

        assert_eq!(zcash.sent.lock().unwrap().len(), 1);
        assert_eq!(miden.consumed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unannounced_exit_note_back_creates_withdrawal() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());
        let addr = test_addr();

        miden.push_exit_note(exit_note("note-9", &addr, 42));
        relayer(zcash.clone(), miden, store.clone()).tick().await.unwrap();

        assert_eq!(zcash.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn consume_then_crash_pays_exactly_once() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());
        let addr = test_addr();

        miden.push_exit_note(exit_note("note-1", &addr, 2_000));
        zcash.fail_next_send(ChainError::Timeout);

        let relayer = relayer(zcash.clone(), miden.clone(), store.clone());
        relayer.tick().await.unwrap();

        // Consumed but unpaid: the pool owes the user.
        assert_eq!(miden.consumed.lock().unwrap().len(), 1);
        assert!(zcash.sent.lock().unwrap().is_empty());
        assert_eq!(store.list_consumed_unpaid().await.unwrap().len(), 1);

        // Next tick (a restart behaves the same way) retries only the
        // payout; the note is not consumed again.
        relayer.tick().await.unwrap();
        assert_eq!(miden.consumed.lock().unwrap().len(), 1);
        assert_eq!(zcash.sent.lock().unwrap().len(), 1);
        assert!(store.list_consumed_unpaid().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consume_failure_releases_the_claim() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());
        let addr = test_addr();

        miden.push_exit_note(exit_note("note-1", &addr, 3_000));
        miden.keep_notes_listed(true);
        miden.fail_next_consume(ChainError::NodeUnavailable("down".into()));

        let relayer = relayer(zcash.clone(), miden.clone(), store.clone());
        relayer.tick().await.unwrap();
        assert!(zcash.sent.lock().unwrap().is_empty());

        relayer.tick().await.unwrap();
        assert_eq!(miden.consumed.lock().unwrap().len(), 1);
        assert_eq!(zcash.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_destination_is_left_for_the_operator() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let zcash = Arc::new(MockZcash::new(100));
        let miden = Arc::new(MockMiden::new());

        miden.push_exit_note(exit_note("note-1", "tmAAAtransparent", 5_000));
        relayer(zcash.clone(), miden.clone(), store.clone())
            .tick()
            .await
            .unwrap();

        assert!(miden.consumed.lock().unwrap().is_empty());
        assert!(zcash.sent.lock().unwrap().is_empty());
    }
}
