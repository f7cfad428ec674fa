use anyhow::Context;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use wagerbook_types::{
    Amount, Bet, BetId, BetOutcome, BetStatus, BetTransition, CommissionRate, Currency, EntryId,
    EntryType, EscrowHold, HoldId, IdempotencyKey, IdempotencyRecord, LedgerEntry, MinorUnits,
    OperationType, OwnerId, Participant, Wallet, WalletId, WalletStatus, WalletTotals,
};

use super::{apply_batch, Batch, CommitOutcome, LedgerStore, NewHold, Txn};
use crate::StoreError;

/// Idle connections kept for reuse. Extra connections are opened on demand.
const MAX_IDLE_CONNECTIONS: usize = 8;

const WALLET_COLUMNS: &str = "id, owner_id, currency, available_balance, locked_balance, version, \
     frozen_reason, total_deposited, total_withdrawn, total_wagered, total_won, created_at, \
     updated_at";

const ENTRY_COLUMNS: &str = "id, wallet_id, entry_type, delta, available_delta, locked_delta, \
     resulting_available, resulting_locked, idempotency_key, bet_id, created_at";

const BET_COLUMNS: &str = "id, creator_wallet, title, currency, stake, commission_bps, \
     required_participants, status, outcome, winner_wallet, created_at, acceptance_deadline, \
     resolution_deadline, resolved_at, version";

const HOLD_COLUMNS: &str = "id, bet_id, wallet_id, amount, created_at, released_at";

/// [`LedgerStore`] backed by a SQLite database in WAL mode.
///
/// Writers take an `IMMEDIATE` transaction, so concurrent commits queue on SQLite's write lock
/// for at most the configured busy timeout before failing with [`StoreError::Busy`].
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    idle: Mutex<Vec<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> anyhow::Result<Self> {
        let conn = open_connection(path, busy_timeout).context("open ledger db")?;
        init_schema_sqlite(&conn)?;
        Ok(Self {
            path: path.to_path_buf(),
            busy_timeout,
            idle: Mutex::new(vec![conn]),
        })
    }

    fn with_connection<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&self.path, self.busy_timeout).map_err(map_busy)?,
        };
        let result = f(&mut conn).map_err(|err| match err {
            StoreError::Sqlite(inner) => map_busy(inner),
            other => other,
        });
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
        result
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.with_connection(|conn| {
            let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = f(&mut tx)?;
            tx.commit()?;
            Ok(result)
        })
    }
}

fn open_connection(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA synchronous=FULL;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(conn)
}

fn map_busy(err: rusqlite::Error) -> StoreError {
    let busy = matches!(
        &err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    );
    if busy {
        debug!(?err, "sqlite busy");
        return StoreError::Busy;
    }
    StoreError::Sqlite(err)
}

fn init_schema_sqlite(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE IF NOT EXISTS wallets (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             owner_id INTEGER NOT NULL,
             currency TEXT NOT NULL CHECK (length(currency) = 3),
             available_balance INTEGER NOT NULL CHECK (available_balance >= 0),
             locked_balance INTEGER NOT NULL CHECK (locked_balance >= 0),
             version INTEGER NOT NULL,
             frozen_reason TEXT,
             total_deposited INTEGER NOT NULL DEFAULT 0,
             total_withdrawn INTEGER NOT NULL DEFAULT 0,
             total_wagered INTEGER NOT NULL DEFAULT 0,
             total_won INTEGER NOT NULL DEFAULT 0,
             created_at INTEGER NOT NULL,
             updated_at INTEGER NOT NULL,
             UNIQUE (owner_id, currency)
         );
         CREATE TABLE IF NOT EXISTS ledger_entries (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             wallet_id INTEGER NOT NULL REFERENCES wallets(id),
             entry_type TEXT NOT NULL,
             delta INTEGER NOT NULL,
             available_delta INTEGER NOT NULL,
             locked_delta INTEGER NOT NULL,
             resulting_available INTEGER NOT NULL CHECK (resulting_available >= 0),
             resulting_locked INTEGER NOT NULL CHECK (resulting_locked >= 0),
             idempotency_key TEXT,
             bet_id INTEGER,
             created_at INTEGER NOT NULL,
             CHECK (available_delta + locked_delta = delta)
         );
         CREATE INDEX IF NOT EXISTS ledger_entries_wallet
             ON ledger_entries (wallet_id, id);
         CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
             BEFORE UPDATE ON ledger_entries
             BEGIN SELECT RAISE(ABORT, 'ledger entries are append-only'); END;
         CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
             BEFORE DELETE ON ledger_entries
             BEGIN SELECT RAISE(ABORT, 'ledger entries are append-only'); END;
         CREATE TABLE IF NOT EXISTS bets (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             creator_wallet INTEGER NOT NULL REFERENCES wallets(id),
             title TEXT NOT NULL,
             currency TEXT NOT NULL CHECK (length(currency) = 3),
             stake INTEGER NOT NULL CHECK (stake > 0),
             commission_bps INTEGER NOT NULL CHECK (commission_bps BETWEEN 0 AND 10000),
             required_participants INTEGER NOT NULL CHECK (required_participants >= 2),
             status TEXT NOT NULL,
             outcome TEXT NOT NULL,
             winner_wallet INTEGER,
             created_at INTEGER NOT NULL,
             acceptance_deadline INTEGER,
             resolution_deadline INTEGER,
             resolved_at INTEGER,
             version INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS bets_status ON bets (status);
         CREATE TABLE IF NOT EXISTS bet_participants (
             bet_id INTEGER NOT NULL REFERENCES bets(id),
             position INTEGER NOT NULL,
             wallet_id INTEGER NOT NULL REFERENCES wallets(id),
             stake INTEGER NOT NULL CHECK (stake > 0),
             joined_at INTEGER NOT NULL,
             PRIMARY KEY (bet_id, position),
             UNIQUE (bet_id, wallet_id)
         );
         CREATE INDEX IF NOT EXISTS bet_participants_wallet ON bet_participants (wallet_id);
         CREATE TABLE IF NOT EXISTS escrow_holds (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             bet_id INTEGER NOT NULL REFERENCES bets(id),
             wallet_id INTEGER NOT NULL REFERENCES wallets(id),
             amount INTEGER NOT NULL CHECK (amount > 0),
             created_at INTEGER NOT NULL,
             released_at INTEGER
         );
         CREATE INDEX IF NOT EXISTS escrow_holds_bet ON escrow_holds (bet_id);
         CREATE TABLE IF NOT EXISTS bet_transitions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             bet_id INTEGER NOT NULL REFERENCES bets(id),
             from_status TEXT,
             to_status TEXT NOT NULL,
             actor TEXT,
             reason TEXT,
             at INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS bet_transitions_bet ON bet_transitions (bet_id, id);
         CREATE TABLE IF NOT EXISTS idempotency_records (
             key TEXT PRIMARY KEY,
             operation_type TEXT NOT NULL,
             result_snapshot TEXT NOT NULL,
             created_at INTEGER NOT NULL
         );",
    )
    .context("init ledger schema")?;
    Ok(())
}

fn sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("integer {value} out of range")))
}

fn sql_opt_int(value: Option<u64>) -> Result<Option<i64>, StoreError> {
    value.map(sql_int).transpose()
}

fn get_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let value: i64 = row.get(idx)?;
    u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn get_opt_u64(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    let value: Option<i64> = row.get(idx)?;
    value
        .map(|value| {
            u64::try_from(value).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, value))
        })
        .transpose()
}

fn parse_column<T, E>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(String) -> Result<T, E>,
) -> rusqlite::Result<T>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    parse(raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn get_amount(row: &Row<'_>, idx: usize) -> rusqlite::Result<Amount> {
    let value: i64 = row.get(idx)?;
    Amount::new(value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Integer,
            Box::new(err),
        )
    })
}

fn wallet_from_row(row: &Row<'_>) -> rusqlite::Result<Wallet> {
    let frozen_reason: Option<String> = row.get(6)?;
    Ok(Wallet {
        id: WalletId(get_u64(row, 0)?),
        owner: OwnerId(get_u64(row, 1)?),
        currency: parse_column(row, 2, |raw| raw.parse::<Currency>())?,
        available: row.get(3)?,
        locked: row.get(4)?,
        version: get_u64(row, 5)?,
        status: match frozen_reason {
            Some(reason) => WalletStatus::Frozen { reason },
            None => WalletStatus::Active,
        },
        totals: WalletTotals {
            deposited: row.get(7)?,
            withdrawn: row.get(8)?,
            wagered: row.get(9)?,
            won: row.get(10)?,
        },
        created_at: get_u64(row, 11)?,
        updated_at: get_u64(row, 12)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: EntryId(get_u64(row, 0)?),
        wallet: WalletId(get_u64(row, 1)?),
        entry_type: parse_column(row, 2, |raw| raw.parse::<EntryType>())?,
        delta: row.get(3)?,
        available_delta: row.get(4)?,
        locked_delta: row.get(5)?,
        resulting_available: row.get(6)?,
        resulting_locked: row.get(7)?,
        idempotency_key: row.get(8)?,
        bet: get_opt_u64(row, 9)?.map(BetId),
        created_at: get_u64(row, 10)?,
    })
}

fn hold_from_row(row: &Row<'_>) -> rusqlite::Result<EscrowHold> {
    Ok(EscrowHold {
        id: HoldId(get_u64(row, 0)?),
        bet: BetId(get_u64(row, 1)?),
        wallet: WalletId(get_u64(row, 2)?),
        amount: get_amount(row, 3)?,
        created_at: get_u64(row, 4)?,
        released_at: get_opt_u64(row, 5)?,
    })
}

/// Bet row without its participants.
fn bet_from_row(row: &Row<'_>) -> rusqlite::Result<Bet> {
    let outcome_kind: String = row.get(8)?;
    let winner = get_opt_u64(row, 9)?;
    let outcome = match (outcome_kind.as_str(), winner) {
        ("undecided", _) => BetOutcome::Undecided,
        ("push", _) => BetOutcome::Push,
        ("winner", Some(wallet)) => BetOutcome::Winner(WalletId(wallet)),
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                format!("invalid bet outcome {outcome_kind:?}").into(),
            ))
        }
    };
    let commission: u16 = row.get(5)?;
    let required_participants: u8 = row.get(6)?;
    Ok(Bet {
        id: BetId(get_u64(row, 0)?),
        creator: WalletId(get_u64(row, 1)?),
        title: row.get(2)?,
        currency: parse_column(row, 3, |raw| raw.parse::<Currency>())?,
        stake: get_amount(row, 4)?,
        commission: CommissionRate::from_bps(commission).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Integer,
                Box::new(err),
            )
        })?,
        required_participants,
        participants: Vec::new(),
        status: parse_column(row, 7, |raw| raw.parse::<BetStatus>())?,
        outcome,
        created_at: get_u64(row, 10)?,
        acceptance_deadline: get_opt_u64(row, 11)?,
        resolution_deadline: get_opt_u64(row, 12)?,
        resolved_at: get_opt_u64(row, 13)?,
        version: get_u64(row, 14)?,
    })
}

fn outcome_columns(outcome: BetOutcome) -> Result<(&'static str, Option<i64>), StoreError> {
    Ok(match outcome {
        BetOutcome::Undecided => ("undecided", None),
        BetOutcome::Push => ("push", None),
        BetOutcome::Winner(wallet) => ("winner", Some(sql_int(wallet.0)?)),
    })
}

fn load_wallet(conn: &Connection, id: WalletId) -> Result<Option<Wallet>, StoreError> {
    let sql = format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = ?1");
    Ok(conn
        .query_row(&sql, params![sql_int(id.0)?], wallet_from_row)
        .optional()?)
}

fn load_bet(conn: &Connection, id: BetId) -> Result<Option<Bet>, StoreError> {
    let sql = format!("SELECT {BET_COLUMNS} FROM bets WHERE id = ?1");
    let Some(mut bet) = conn
        .query_row(&sql, params![sql_int(id.0)?], bet_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT wallet_id, stake, joined_at FROM bet_participants
         WHERE bet_id = ?1 ORDER BY position ASC",
    )?;
    let rows = stmt.query_map(params![sql_int(id.0)?], |row| {
        Ok(Participant {
            wallet: WalletId(get_u64(row, 0)?),
            stake: get_amount(row, 1)?,
            joined_at: get_u64(row, 2)?,
        })
    })?;
    for participant in rows {
        bet.participants.push(participant?);
    }
    Ok(Some(bet))
}

fn load_bets(conn: &Connection, ids: Vec<i64>) -> Result<Vec<Bet>, StoreError> {
    let mut bets = Vec::with_capacity(ids.len());
    for id in ids {
        let id = BetId(u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("bet id {id}")))?);
        if let Some(bet) = load_bet(conn, id)? {
            bets.push(bet);
        }
    }
    Ok(bets)
}

fn query_ids(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}

fn insert_participants(conn: &Connection, bet: &Bet) -> Result<(), StoreError> {
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO bet_participants (bet_id, position, wallet_id, stake, joined_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (position, participant) in bet.participants.iter().enumerate() {
        stmt.execute(params![
            sql_int(bet.id.0)?,
            sql_int(position as u64)?,
            sql_int(participant.wallet.0)?,
            participant.stake.get(),
            sql_int(participant.joined_at)?,
        ])?;
    }
    Ok(())
}

impl Txn for Transaction<'_> {
    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        load_idempotency_record(self, key)
    }

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        load_wallet(self, id)
    }

    fn last_entry(&self, wallet: WalletId) -> Result<Option<LedgerEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries
             WHERE wallet_id = ?1 ORDER BY id DESC LIMIT 1"
        );
        Ok(self
            .query_row(&sql, params![sql_int(wallet.0)?], entry_from_row)
            .optional()?)
    }

    fn put_wallet(&mut self, wallet: &Wallet) -> Result<(), StoreError> {
        let frozen_reason = match &wallet.status {
            WalletStatus::Active => None,
            WalletStatus::Frozen { reason } => Some(reason.as_str()),
        };
        let changed = self.execute(
            "UPDATE wallets SET available_balance = ?2, locked_balance = ?3, version = ?4,
                 frozen_reason = ?5, total_deposited = ?6, total_withdrawn = ?7,
                 total_wagered = ?8, total_won = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                sql_int(wallet.id.0)?,
                wallet.available,
                wallet.locked,
                sql_int(wallet.version)?,
                frozen_reason,
                wallet.totals.deposited,
                wallet.totals.withdrawn,
                wallet.totals.wagered,
                wallet.totals.won,
                sql_int(wallet.updated_at)?,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::WalletNotFound(wallet.id));
        }
        Ok(())
    }

    fn append_entry(&mut self, mut entry: LedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.execute(
            "INSERT INTO ledger_entries (wallet_id, entry_type, delta, available_delta,
                 locked_delta, resulting_available, resulting_locked, idempotency_key, bet_id,
                 created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                sql_int(entry.wallet.0)?,
                entry.entry_type.as_str(),
                entry.delta,
                entry.available_delta,
                entry.locked_delta,
                entry.resulting_available,
                entry.resulting_locked,
                entry.idempotency_key,
                sql_opt_int(entry.bet.map(|bet| bet.0))?,
                sql_int(entry.created_at)?,
            ],
        )?;
        entry.id = EntryId(self.last_insert_rowid() as u64);
        Ok(entry)
    }

    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError> {
        load_bet(self, id)
    }

    fn insert_bet(&mut self, mut bet: Bet) -> Result<Bet, StoreError> {
        let (outcome, winner) = outcome_columns(bet.outcome)?;
        self.execute(
            "INSERT INTO bets (creator_wallet, title, currency, stake, commission_bps,
                 required_participants, status, outcome, winner_wallet, created_at,
                 acceptance_deadline, resolution_deadline, resolved_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                sql_int(bet.creator.0)?,
                bet.title,
                bet.currency.as_str(),
                bet.stake.get(),
                bet.commission.bps(),
                bet.required_participants,
                bet.status.as_str(),
                outcome,
                winner,
                sql_int(bet.created_at)?,
                sql_opt_int(bet.acceptance_deadline)?,
                sql_opt_int(bet.resolution_deadline)?,
                sql_opt_int(bet.resolved_at)?,
                sql_int(bet.version)?,
            ],
        )?;
        bet.id = BetId(self.last_insert_rowid() as u64);
        insert_participants(self, &bet)?;
        Ok(bet)
    }

    fn update_bet(&mut self, bet: &Bet) -> Result<(), StoreError> {
        let (outcome, winner) = outcome_columns(bet.outcome)?;
        let changed = self.execute(
            "UPDATE bets SET status = ?2, outcome = ?3, winner_wallet = ?4, resolved_at = ?5,
                 version = ?6
             WHERE id = ?1",
            params![
                sql_int(bet.id.0)?,
                bet.status.as_str(),
                outcome,
                winner,
                sql_opt_int(bet.resolved_at)?,
                sql_int(bet.version)?,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::BetNotFound(bet.id));
        }
        insert_participants(self, bet)
    }

    fn insert_hold(&mut self, hold: NewHold, now: u64) -> Result<EscrowHold, StoreError> {
        self.execute(
            "INSERT INTO escrow_holds (bet_id, wallet_id, amount, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sql_int(hold.bet.0)?,
                sql_int(hold.wallet.0)?,
                hold.amount.get(),
                sql_int(now)?,
            ],
        )?;
        Ok(EscrowHold {
            id: HoldId(self.last_insert_rowid() as u64),
            bet: hold.bet,
            wallet: hold.wallet,
            amount: hold.amount,
            created_at: now,
            released_at: None,
        })
    }

    fn release_holds(&mut self, bet: BetId, now: u64) -> Result<Vec<EscrowHold>, StoreError> {
        let mut open: Vec<EscrowHold> = load_holds(self, bet)?
            .into_iter()
            .filter(EscrowHold::is_open)
            .collect();
        self.execute(
            "UPDATE escrow_holds SET released_at = ?2 WHERE bet_id = ?1 AND released_at IS NULL",
            params![sql_int(bet.0)?, sql_int(now)?],
        )?;
        for hold in &mut open {
            hold.released_at = Some(now);
        }
        Ok(open)
    }

    fn insert_transition(&mut self, transition: &BetTransition) -> Result<(), StoreError> {
        self.execute(
            "INSERT INTO bet_transitions (bet_id, from_status, to_status, actor, reason, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sql_int(transition.bet.0)?,
                transition.from.map(BetStatus::as_str),
                transition.to.as_str(),
                transition.actor,
                transition.reason,
                sql_int(transition.at)?,
            ],
        )?;
        Ok(())
    }

    fn insert_idempotency(&mut self, record: &IdempotencyRecord) -> Result<(), StoreError> {
        self.execute(
            "INSERT INTO idempotency_records (key, operation_type, result_snapshot, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.key.as_str(),
                record.operation.as_str(),
                record.result_snapshot,
                sql_int(record.created_at)?,
            ],
        )?;
        Ok(())
    }
}

fn load_idempotency_record(
    conn: &Connection,
    key: &IdempotencyKey,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT operation_type, result_snapshot, created_at
             FROM idempotency_records WHERE key = ?1",
            params![key.as_str()],
            |row| {
                Ok((
                    parse_column(row, 0, |raw| raw.parse::<OperationType>())?,
                    row.get::<_, String>(1)?,
                    get_u64(row, 2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(operation, result_snapshot, created_at)| IdempotencyRecord {
        key: key.clone(),
        operation,
        result_snapshot,
        created_at,
    }))
}

fn load_holds(conn: &Connection, bet: BetId) -> Result<Vec<EscrowHold>, StoreError> {
    let sql = format!("SELECT {HOLD_COLUMNS} FROM escrow_holds WHERE bet_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![sql_int(bet.0)?], hold_from_row)?;
    let mut holds = Vec::new();
    for hold in rows {
        holds.push(hold?);
    }
    Ok(holds)
}

impl LedgerStore for SqliteStore {
    fn ensure_wallet(
        &self,
        owner: OwnerId,
        currency: Currency,
        now: u64,
    ) -> Result<Wallet, StoreError> {
        self.write(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO wallets (owner_id, currency, available_balance,
                     locked_balance, version, created_at, updated_at)
                 VALUES (?1, ?2, 0, 0, 0, ?3, ?3)",
                params![sql_int(owner.0)?, currency.as_str(), sql_int(now)?],
            )?;
            let sql = format!(
                "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = ?1 AND currency = ?2"
            );
            Ok(tx.query_row(
                &sql,
                params![sql_int(owner.0)?, currency.as_str()],
                wallet_from_row,
            )?)
        })
    }

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        self.with_connection(|conn| load_wallet(conn, id))
    }

    fn wallet_by_owner(
        &self,
        owner: OwnerId,
        currency: Currency,
    ) -> Result<Option<Wallet>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {WALLET_COLUMNS} FROM wallets WHERE owner_id = ?1 AND currency = ?2"
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![sql_int(owner.0)?, currency.as_str()],
                    wallet_from_row,
                )
                .optional()?)
        })
    }

    fn set_wallet_status(
        &self,
        id: WalletId,
        status: WalletStatus,
        now: u64,
    ) -> Result<Wallet, StoreError> {
        self.write(|tx| {
            let reason = match &status {
                WalletStatus::Active => None,
                WalletStatus::Frozen { reason } => Some(reason.as_str()),
            };
            let changed = tx.execute(
                "UPDATE wallets SET frozen_reason = ?2, updated_at = ?3 WHERE id = ?1",
                params![sql_int(id.0)?, reason, sql_int(now)?],
            )?;
            if changed == 0 {
                return Err(StoreError::WalletNotFound(id));
            }
            load_wallet(tx, id)?.ok_or(StoreError::WalletNotFound(id))
        })
    }

    fn entries(&self, wallet: WalletId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.with_connection(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE wallet_id = ?1 ORDER BY id ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![sql_int(wallet.0)?], entry_from_row)?;
            let mut entries = Vec::new();
            for entry in rows {
                entries.push(entry?);
            }
            Ok(entries)
        })
    }

    fn entry_volume_since(
        &self,
        wallet: WalletId,
        entry_type: EntryType,
        since: u64,
    ) -> Result<MinorUnits, StoreError> {
        self.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(ABS(available_delta)), 0) FROM ledger_entries
                 WHERE wallet_id = ?1 AND entry_type = ?2 AND created_at >= ?3",
                params![sql_int(wallet.0)?, entry_type.as_str(), sql_int(since)?],
                |row| row.get(0),
            )?)
        })
    }

    fn idempotency_record(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        self.with_connection(|conn| load_idempotency_record(conn, key))
    }

    fn bet(&self, id: BetId) -> Result<Option<Bet>, StoreError> {
        self.with_connection(|conn| load_bet(conn, id))
    }

    fn bets_for_wallet(&self, wallet: WalletId) -> Result<Vec<Bet>, StoreError> {
        self.with_connection(|conn| {
            let ids = query_ids(
                conn,
                "SELECT DISTINCT bet_id FROM bet_participants WHERE wallet_id = ?1
                 ORDER BY bet_id ASC",
                params![sql_int(wallet.0)?],
            )?;
            load_bets(conn, ids)
        })
    }

    fn bets_with_status(&self, status: BetStatus) -> Result<Vec<Bet>, StoreError> {
        self.with_connection(|conn| {
            let ids = query_ids(
                conn,
                "SELECT id FROM bets WHERE status = ?1 ORDER BY id ASC",
                params![status.as_str()],
            )?;
            load_bets(conn, ids)
        })
    }

    fn bets_due(&self, now: u64) -> Result<Vec<Bet>, StoreError> {
        self.with_connection(|conn| {
            let ids = query_ids(
                conn,
                "SELECT id FROM bets
                 WHERE (status = 'pending' AND acceptance_deadline IS NOT NULL
                        AND acceptance_deadline <= ?1)
                    OR (status IN ('accepted', 'active') AND resolution_deadline IS NOT NULL
                        AND resolution_deadline <= ?1)
                 ORDER BY id ASC",
                params![sql_int(now)?],
            )?;
            load_bets(conn, ids)
        })
    }

    fn holds(&self, bet: BetId) -> Result<Vec<EscrowHold>, StoreError> {
        self.with_connection(|conn| load_holds(conn, bet))
    }

    fn transitions(&self, bet: BetId) -> Result<Vec<BetTransition>, StoreError> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_status, to_status, actor, reason, at FROM bet_transitions
                 WHERE bet_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(params![sql_int(bet.0)?], |row| {
                let from: Option<String> = row.get(0)?;
                let from = from
                    .map(|raw| {
                        raw.parse::<BetStatus>().map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                Box::new(err),
                            )
                        })
                    })
                    .transpose()?;
                Ok(BetTransition {
                    bet,
                    from,
                    to: parse_column(row, 1, |raw| raw.parse::<BetStatus>())?,
                    actor: row.get(2)?,
                    reason: row.get(3)?,
                    at: get_u64(row, 4)?,
                })
            })?;
            let mut transitions = Vec::new();
            for transition in rows {
                transitions.push(transition?);
            }
            Ok(transitions)
        })
    }

    fn commit(&self, batch: Batch) -> Result<CommitOutcome, StoreError> {
        self.write(|tx| apply_batch(tx, batch))
    }
}
