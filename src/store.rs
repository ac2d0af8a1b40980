//! Durable bridge state: deposit intents, withdrawals, scan cursors and
//! the idempotency log. The store exclusively owns all row mutation;
//! relayers and the facade go through the operations here, every one of
//! which is a single transaction on the embedded database.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::derive::RecipientHash;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Zcash,
    Miden,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Zcash => "zcash",
            Chain::Miden => "miden",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Open,
    Observed,
    Minted,
    Quarantined,
}

impl DepositStatus {
    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "open" => Ok(DepositStatus::Open),
            "observed" => Ok(DepositStatus::Observed),
            "minted" => Ok(DepositStatus::Minted),
            "quarantined" => Ok(DepositStatus::Quarantined),
            other => Err(StoreError::Backend(format!("bad deposit status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Open,
    Consumed,
    Paid,
}

impl WithdrawalStatus {
    fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "open" => Ok(WithdrawalStatus::Open),
            "consumed" => Ok(WithdrawalStatus::Consumed),
            "paid" => Ok(WithdrawalStatus::Paid),
            other => Err(StoreError::Backend(format!(
                "bad withdrawal status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepositIntent {
    pub id: i64,
    /// Hex account id. `None` for intents back-created from an observed
    /// memo: the hash preimage only exists on the user's device.
    pub account_id: Option<String>,
    pub recipient_hash: RecipientHash,
    pub status: DepositStatus,
    pub source_txid: Option<String>,
    pub amount_base: Option<u64>,
    pub mint_note_id: Option<String>,
    pub attempts: u32,
    pub next_attempt_at: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub id: String,
    pub origin_account_id: Option<String>,
    pub destination_address: String,
    pub amount_base: u64,
    pub status: WithdrawalStatus,
    pub source_note_id: Option<String>,
    pub rollup_txid: Option<String>,
    pub target_txid: Option<String>,
    pub created_at: u64,
}

/// A deposit the relayer refused to mint, kept for operator inspection.
#[derive(Debug, Clone, Serialize)]
pub struct UnclaimableDeposit {
    pub source_txid: String,
    pub reason: String,
    pub created_at: u64,
}

// ---------------------------------------------------------------------------
// Trait definitions
// ---------------------------------------------------------------------------

pub trait IntentStore: Send + Sync + 'static {
    /// Idempotent on `recipient_hash`; refreshes the account id when a
    /// back-created intent is later claimed through the facade.
    fn upsert_intent(
        &self,
        account_id: Option<&str>,
        recipient_hash: &RecipientHash,
    ) -> impl Future<Output = Result<DepositIntent, StoreError>> + Send;

    /// Atomically binds a confirmed deposit to its intent. Returns
    /// `None` when the txid was already claimed, or when the recipient
    /// hash is already bound to a different deposit (recorded as
    /// unclaimable in that case).
    fn claim_deposit(
        &self,
        source_txid: &str,
        recipient_hash: &RecipientHash,
        amount_base: u64,
    ) -> impl Future<Output = Result<Option<DepositIntent>, StoreError>> + Send;

    fn intent_by_txid(
        &self,
        source_txid: &str,
    ) -> impl Future<Output = Result<Option<DepositIntent>, StoreError>> + Send;

    fn intent_by_hash(
        &self,
        recipient_hash: &RecipientHash,
    ) -> impl Future<Output = Result<Option<DepositIntent>, StoreError>> + Send;

    /// Increments the mint attempt counter and pushes the retry horizon
    /// out exponentially (2^n seconds, capped). Returns the new count.
    fn record_mint_attempt(
        &self,
        intent_id: i64,
    ) -> impl Future<Output = Result<u32, StoreError>> + Send;

    fn mark_minted(
        &self,
        intent_id: i64,
        mint_note_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn quarantine_deposit(
        &self,
        intent_id: i64,
        reason: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Records a deposit that will never mint. Returns `false` when the
    /// txid was already recorded.
    fn mark_unclaimable(
        &self,
        source_txid: &str,
        reason: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn list_unclaimable(
        &self,
    ) -> impl Future<Output = Result<Vec<UnclaimableDeposit>, StoreError>> + Send;

    fn deposit_counts(
        &self,
    ) -> impl Future<Output = Result<Vec<(String, u64)>, StoreError>> + Send;
}

pub trait WithdrawalStore: Send + Sync + 'static {
    fn create_withdrawal(
        &self,
        origin_account_id: Option<&str>,
        destination_address: &str,
        amount_base: u64,
    ) -> impl Future<Output = Result<Withdrawal, StoreError>> + Send;

    /// Atomically binds an exit note to a withdrawal row, back-creating
    /// the row when the UI never announced it. `None` means the note
    /// was already claimed.
    fn claim_withdrawal(
        &self,
        source_note_id: &str,
        destination_address: &str,
        amount_base: u64,
    ) -> impl Future<Output = Result<Option<Withdrawal>, StoreError>> + Send;

    /// Compensating write after a failed consume: the note becomes
    /// claimable again on the next tick.
    fn release_withdrawal(
        &self,
        source_note_id: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn mark_consumed(
        &self,
        withdrawal_id: &str,
        rollup_txid: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Withdrawals whose exit note is consumed but whose shielded
    /// payout has not landed; the pool owes these.
    fn list_consumed_unpaid(
        &self,
    ) -> impl Future<Output = Result<Vec<Withdrawal>, StoreError>> + Send;

    fn mark_paid(
        &self,
        withdrawal_id: &str,
        target_txid: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn withdrawal_by_id(
        &self,
        withdrawal_id: &str,
    ) -> impl Future<Output = Result<Option<Withdrawal>, StoreError>> + Send;

    fn withdrawal_counts(
        &self,
    ) -> impl Future<Output = Result<Vec<(String, u64)>, StoreError>> + Send;
}

pub trait CursorStore: Send + Sync + 'static {
    fn get_cursor(
        &self,
        chain: Chain,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Monotone: regressions are silently ignored so a restart can
    /// never rewind the scan. The cursor is block-granular; sub-block
    /// progress lives in the idempotency log, keyed by immutable
    /// txids rather than positions a note scan cannot keep stable.
    fn advance_cursor(
        &self,
        chain: Chain,
        block: u64,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {what}"),
            StoreError::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// Cap on the exponential retry backoff (2^12 s ≈ 68 min).
const MAX_BACKOFF_SHIFT: u32 = 12;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS deposit_intents (
    id              INTEGER PRIMARY KEY,
    account_id      TEXT,
    recipient_hash  TEXT NOT NULL UNIQUE,
    status          TEXT NOT NULL,
    source_txid     TEXT UNIQUE,
    amount_base     INTEGER,
    mint_note_id    TEXT,
    attempts        INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    created_at      INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS withdrawals (
    id                  TEXT PRIMARY KEY,
    origin_account_id   TEXT,
    destination_address TEXT NOT NULL,
    amount_base         INTEGER NOT NULL,
    status              TEXT NOT NULL,
    source_note_id      TEXT UNIQUE,
    rollup_txid         TEXT,
    target_txid         TEXT,
    created_at          INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS scan_cursors (
    chain       TEXT PRIMARY KEY,
    last_block  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS processed_events (
    source_chain TEXT NOT NULL,
    source_id    TEXT NOT NULL,
    outcome      TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    PRIMARY KEY (source_chain, source_id)
);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory database for tests; same schema, same code paths.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conversion_error(
        e: impl std::error::Error + Send + Sync + 'static,
    ) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    }

    fn intent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DepositIntent> {
        let hash_hex: String = row.get("recipient_hash")?;
        let decoded = hex::decode(&hash_hex).map_err(Self::conversion_error)?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|_| {
            Self::conversion_error(StoreError::Backend("corrupt recipient hash".into()))
        })?;
        let status: String = row.get("status")?;
        Ok(DepositIntent {
            id: row.get("id")?,
            account_id: row.get("account_id")?,
            recipient_hash: RecipientHash(bytes),
            status: DepositStatus::parse(&status).map_err(Self::conversion_error)?,
            source_txid: row.get("source_txid")?,
            amount_base: row.get::<_, Option<i64>>("amount_base")?.map(|v| v as u64),
            mint_note_id: row.get("mint_note_id")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            next_attempt_at: row.get::<_, i64>("next_attempt_at")? as u64,
            created_at: row.get::<_, i64>("created_at")? as u64,
        })
    }

    fn select_intent(
        conn: &Connection,
        where_clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<DepositIntent>, StoreError> {
        let sql = format!("SELECT * FROM deposit_intents WHERE {where_clause}");
        Ok(conn
            .query_row(&sql, [param], Self::intent_from_row)
            .optional()?)
    }

    fn withdrawal_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Withdrawal> {
        let status: String = row.get("status")?;
        Ok(Withdrawal {
            id: row.get("id")?,
            origin_account_id: row.get("origin_account_id")?,
            destination_address: row.get("destination_address")?,
            amount_base: row.get::<_, i64>("amount_base")? as u64,
            status: WithdrawalStatus::parse(&status).map_err(Self::conversion_error)?,
            source_note_id: row.get("source_note_id")?,
            rollup_txid: row.get("rollup_txid")?,
            target_txid: row.get("target_txid")?,
            created_at: row.get::<_, i64>("created_at")? as u64,
        })
    }

    fn select_withdrawal(
        conn: &Connection,
        where_clause: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<Withdrawal>, StoreError> {
        let sql = format!("SELECT * FROM withdrawals WHERE {where_clause}");
        Ok(conn
            .query_row(&sql, [param], Self::withdrawal_from_row)
            .optional()?)
    }

    fn status_counts(
        conn: &Connection,
        table: &str,
    ) -> Result<Vec<(String, u64)>, StoreError> {
        let sql = format!("SELECT status, COUNT(*) FROM {table} GROUP BY status");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

impl IntentStore for SqliteStore {
    async fn upsert_intent(
        &self,
        account_id: Option<&str>,
        recipient_hash: &RecipientHash,
    ) -> Result<DepositIntent, StoreError> {
        let conn = self.conn.lock().await;
        let hash_hex = recipient_hash.to_hex();
        conn.execute(
            "INSERT INTO deposit_intents (account_id, recipient_hash, status, created_at)
             VALUES (?1, ?2, 'open', ?3)
             ON CONFLICT(recipient_hash) DO UPDATE
             SET account_id = COALESCE(excluded.account_id, account_id)",
            params![account_id, hash_hex, now_epoch() as i64],
        )?;
        Self::select_intent(&conn, "recipient_hash = ?1", &hash_hex)?
            .ok_or_else(|| StoreError::NotFound(format!("intent {hash_hex}")))
    }

    async fn claim_deposit(
        &self,
        source_txid: &str,
        recipient_hash: &RecipientHash,
        amount_base: u64,
    ) -> Result<Option<DepositIntent>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = now_epoch() as i64;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO processed_events (source_chain, source_id, outcome, created_at)
             VALUES ('zcash', ?1, 'claimed', ?2)",
            params![source_txid, now],
        )?;
        if inserted == 0 {
            tx.commit()?;
            return Ok(None);
        }

        let hash_hex = recipient_hash.to_hex();
        let existing = tx
            .query_row(
                "SELECT * FROM deposit_intents WHERE recipient_hash = ?1",
                [&hash_hex],
                Self::intent_from_row,
            )
            .optional()?;

        match existing {
            Some(intent)
                if intent.source_txid.is_some()
                    && intent.source_txid.as_deref() != Some(source_txid) =>
            {
                // The hash is one-time by contract. A second deposit
                // reusing it is held for the operator instead of being
                // minted into an ambiguous claim.
                tx.execute(
                    "UPDATE processed_events SET outcome = 'unclaimable: recipient hash reused'
                     WHERE source_chain = 'zcash' AND source_id = ?1",
                    [source_txid],
                )?;
                tx.commit()?;
                Ok(None)
            }
            Some(intent) => {
                tx.execute(
                    "UPDATE deposit_intents
                     SET status = 'observed', source_txid = ?1, amount_base = ?2
                     WHERE id = ?3 AND status = 'open'",
                    params![source_txid, amount_base as i64, intent.id],
                )?;
                let claimed = tx.query_row(
                    "SELECT * FROM deposit_intents WHERE id = ?1",
                    [intent.id],
                    Self::intent_from_row,
                )?;
                tx.commit()?;
                Ok(Some(claimed))
            }
            None => {
                // Back-created intent: the preimage lives on the user's
                // device, the bridge only ever sees the hash.
                tx.execute(
                    "INSERT INTO deposit_intents
                     (account_id, recipient_hash, status, source_txid, amount_base, created_at)
                     VALUES (NULL, ?1, 'observed', ?2, ?3, ?4)",
                    params![hash_hex, source_txid, amount_base as i64, now],
                )?;
                let claimed = tx.query_row(
                    "SELECT * FROM deposit_intents WHERE recipient_hash = ?1",
                    [&hash_hex],
                    Self::intent_from_row,
                )?;
                tx.commit()?;
                Ok(Some(claimed))
            }
        }
    }

    async fn intent_by_txid(&self, source_txid: &str) -> Result<Option<DepositIntent>, StoreError> {
        let conn = self.conn.lock().await;
        Self::select_intent(&conn, "source_txid = ?1", &source_txid)
    }

    async fn intent_by_hash(
        &self,
        recipient_hash: &RecipientHash,
    ) -> Result<Option<DepositIntent>, StoreError> {
        let conn = self.conn.lock().await;
        Self::select_intent(&conn, "recipient_hash = ?1", &recipient_hash.to_hex())
    }

    async fn record_mint_attempt(&self, intent_id: i64) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        let now = now_epoch();
        conn.execute(
            "UPDATE deposit_intents
             SET attempts = attempts + 1,
                 next_attempt_at = ?1 + (1 << MIN(attempts + 1, ?2))
             WHERE id = ?3",
            params![now as i64, MAX_BACKOFF_SHIFT, intent_id],
        )?;
        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM deposit_intents WHERE id = ?1",
                [intent_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("intent {intent_id}")))?;
        Ok(attempts as u32)
    }

    async fn mark_minted(&self, intent_id: i64, mint_note_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE deposit_intents SET status = 'minted', mint_note_id = ?1 WHERE id = ?2",
            params![mint_note_id, intent_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("intent {intent_id}")));
        }
        Ok(())
    }

    async fn quarantine_deposit(&self, intent_id: i64, reason: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE deposit_intents SET status = 'quarantined' WHERE id = ?1",
            [intent_id],
        )?;
        tx.execute(
            "UPDATE processed_events SET outcome = ?1
             WHERE source_chain = 'zcash'
               AND source_id = (SELECT source_txid FROM deposit_intents WHERE id = ?2)",
            params![format!("quarantined: {reason}"), intent_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn mark_unclaimable(&self, source_txid: &str, reason: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO processed_events (source_chain, source_id, outcome, created_at)
             VALUES ('zcash', ?1, ?2, ?3)",
            params![
                source_txid,
                format!("unclaimable: {reason}"),
                now_epoch() as i64
            ],
        )?;
        Ok(inserted > 0)
    }

    async fn list_unclaimable(&self) -> Result<Vec<UnclaimableDeposit>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT source_id, outcome, created_at FROM processed_events
             WHERE source_chain = 'zcash' AND outcome LIKE 'unclaimable:%'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UnclaimableDeposit {
                source_txid: row.get(0)?,
                reason: row.get(1)?,
                created_at: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn deposit_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn.lock().await;
        Self::status_counts(&conn, "deposit_intents")
    }
}

impl WithdrawalStore for SqliteStore {
    async fn create_withdrawal(
        &self,
        origin_account_id: Option<&str>,
        destination_address: &str,
        amount_base: u64,
    ) -> Result<Withdrawal, StoreError> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO withdrawals
             (id, origin_account_id, destination_address, amount_base, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5)",
            params![
                id,
                origin_account_id,
                destination_address,
                amount_base as i64,
                now_epoch() as i64
            ],
        )?;
        Self::select_withdrawal(&conn, "id = ?1", &id)?
            .ok_or_else(|| StoreError::NotFound(format!("withdrawal {id}")))
    }

    async fn claim_withdrawal(
        &self,
        source_note_id: &str,
        destination_address: &str,
        amount_base: u64,
    ) -> Result<Option<Withdrawal>, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = now_epoch() as i64;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO processed_events (source_chain, source_id, outcome, created_at)
             VALUES ('miden', ?1, 'claimed', ?2)",
            params![source_note_id, now],
        )?;
        if inserted == 0 {
            tx.commit()?;
            return Ok(None);
        }

        // A row released after a failed consume keeps its note binding;
        // prefer it over matching a fresh open row.
        let bound: Option<String> = tx
            .query_row(
                "SELECT id FROM withdrawals WHERE source_note_id = ?1",
                [source_note_id],
                |row| row.get(0),
            )
            .optional()?;

        let id = match bound {
            Some(id) => id,
            None => {
                let open: Option<String> = tx
                    .query_row(
                        "SELECT id FROM withdrawals
                         WHERE status = 'open' AND source_note_id IS NULL
                           AND destination_address = ?1 AND amount_base = ?2
                         ORDER BY created_at LIMIT 1",
                        params![destination_address, amount_base as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                match open {
                    Some(id) => {
                        tx.execute(
                            "UPDATE withdrawals SET source_note_id = ?1 WHERE id = ?2",
                            params![source_note_id, id],
                        )?;
                        id
                    }
                    None => {
                        // Back-created: the exit note is the request.
                        let id = Uuid::new_v4().to_string();
                        tx.execute(
                            "INSERT INTO withdrawals
                             (id, destination_address, amount_base, status, source_note_id, created_at)
                             VALUES (?1, ?2, ?3, 'open', ?4, ?5)",
                            params![
                                id,
                                destination_address,
                                amount_base as i64,
                                source_note_id,
                                now
                            ],
                        )?;
                        id
                    }
                }
            }
        };

        let claimed = tx.query_row(
            "SELECT * FROM withdrawals WHERE id = ?1",
            [&id],
            Self::withdrawal_from_row,
        )?;
        tx.commit()?;
        Ok(Some(claimed))
    }

    async fn release_withdrawal(&self, source_note_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM processed_events WHERE source_chain = 'miden' AND source_id = ?1",
            [source_note_id],
        )?;
        Ok(())
    }

    async fn mark_consumed(&self, withdrawal_id: &str, rollup_txid: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'consumed', rollup_txid = ?1 WHERE id = ?2",
            params![rollup_txid, withdrawal_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("withdrawal {withdrawal_id}")));
        }
        Ok(())
    }

    async fn list_consumed_unpaid(&self) -> Result<Vec<Withdrawal>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM withdrawals WHERE status = 'consumed' ORDER BY created_at")?;
        let rows = stmt.query_map([], Self::withdrawal_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn mark_paid(&self, withdrawal_id: &str, target_txid: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE withdrawals SET status = 'paid', target_txid = ?1 WHERE id = ?2",
            params![target_txid, withdrawal_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("withdrawal {withdrawal_id}")));
        }
        Ok(())
    }

    async fn withdrawal_by_id(&self, withdrawal_id: &str) -> Result<Option<Withdrawal>, StoreError> {
        let conn = self.conn.lock().await;
        Self::select_withdrawal(&conn, "id = ?1", &withdrawal_id)
    }

    async fn withdrawal_counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let conn = self.conn.lock().await;
        Self::status_counts(&conn, "withdrawals")
    }
}

impl CursorStore for SqliteStore {
    async fn get_cursor(&self, chain: Chain) -> Result<u64, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT last_block FROM scan_cursors WHERE chain = ?1",
                [chain.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(row.unwrap_or(0) as u64)
    }

    async fn advance_cursor(&self, chain: Chain, block: u64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scan_cursors (chain, last_block) VALUES (?1, ?2)
             ON CONFLICT(chain) DO UPDATE SET last_block = excluded.last_block
             WHERE excluded.last_block > last_block",
            params![chain.as_str(), block as i64],
        )?;
        Ok(())
    }
}

#[cfg(test)]
impl SqliteStore {
    /// Collapses an intent's retry horizon, standing in for elapsed
    /// wall-clock time in relayer tests.
    pub async fn clear_backoff(&self, intent_id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE deposit_intents SET next_attempt_at = 0 WHERE id = ?1",
            [intent_id],
        )?;
        Ok(())
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
