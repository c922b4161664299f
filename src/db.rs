//! SQLite-backed store. One connection, owned here; the lock store, cache and
//! sandbox generator all work through it.

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde_json::{Map, Value};

use crate::logging::{json_log, obj, v_int, v_str};
use crate::model::{TransactionRow, TransactionStatus};

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("open sqlite at {}", path))?;
        // The control server holds a second connection to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Create the worker-owned tables. Reference tables and transactions are
    /// included so a fresh database is self-contained; in production they are
    /// populated by the CRUD layer.
    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS locks (
                lock_id TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS position_keepers (
                position_keeper_id INTEGER PRIMARY KEY AUTOINCREMENT,
                lock_id TEXT NOT NULL,
                holder TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS position_sandbox (
                position_date TEXT NOT NULL,
                position_type_id INTEGER NOT NULL,
                portfolio_entity_id INTEGER NOT NULL,
                instrument_entity_id INTEGER NOT NULL,
                share_amount REAL NOT NULL,
                market_value REAL NOT NULL,
                position_keeper_id INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transactions (
                transaction_id INTEGER PRIMARY KEY,
                transaction_type_id INTEGER,
                transaction_status_id INTEGER NOT NULL,
                portfolio_entity_id INTEGER,
                contra_entity_id INTEGER,
                instrument_entity_id INTEGER,
                trade_date TEXT,
                settle_date TEXT,
                properties TEXT,
                updated_user_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS entities (
                entity_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                entity_type_id INTEGER
            );
            CREATE TABLE IF NOT EXISTS transaction_types (
                transaction_type_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                properties TEXT
            );
            CREATE TABLE IF NOT EXISTS entity_types (
                entity_type_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                name TEXT,
                email TEXT
            );
            CREATE TABLE IF NOT EXISTS transaction_statuses (
                transaction_status_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    /// Append the audit row for a run. Never mutated afterwards.
    pub fn insert_run_record(&self, lock_id: &str, holder: &str, expires_at: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO position_keepers (lock_id, holder, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![lock_id, holder, expires_at, crate::logging::ts_now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn transaction_by_id(&self, transaction_id: i64) -> Result<Option<TransactionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT transaction_id, transaction_type_id, transaction_status_id,
                    portfolio_entity_id, contra_entity_id, instrument_entity_id,
                    trade_date, settle_date, properties, updated_user_id
             FROM transactions WHERE transaction_id = ?1",
        )?;
        let mut rows = stmt.query(params![transaction_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(TransactionRow {
                transaction_id: row.get(0)?,
                transaction_type_id: row.get(1)?,
                transaction_status_id: row.get(2)?,
                portfolio_entity_id: row.get(3)?,
                contra_entity_id: row.get(4)?,
                instrument_entity_id: row.get(5)?,
                trade_date: row.get(6)?,
                settle_date: row.get(7)?,
                properties: row.get(8)?,
                updated_user_id: row.get(9)?,
            })),
            None => Ok(None),
        }
    }

    /// The only mutation this worker performs on the transactions table.
    pub fn set_transaction_status(
        &self,
        transaction_id: i64,
        status: TransactionStatus,
        updated_user_id: i64,
    ) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE transactions SET transaction_status_id = ?1, updated_user_id = ?2
             WHERE transaction_id = ?3",
            params![status.id(), updated_user_id, transaction_id],
        )?;
        Ok(changed > 0)
    }

    /// After a drain, anything still NEW was queued but never delivered.
    /// Mark it UNKNOWN so it is visible as needing attention. PROCESSED rows
    /// are untouched.
    pub fn sweep_orphans(&self, updated_user_id: i64) -> Result<u64> {
        let swept = self.conn.execute(
            "UPDATE transactions SET transaction_status_id = ?1, updated_user_id = ?2
             WHERE transaction_status_id = ?3",
            params![
                TransactionStatus::Unknown.id(),
                updated_user_id,
                TransactionStatus::New.id()
            ],
        )?;
        if swept > 0 {
            json_log(
                "orphan_sweep",
                obj(&[("swept", v_int(swept as i64)), ("to_status", v_str("UNKNOWN"))]),
            );
        }
        Ok(swept as u64)
    }

    /// Full snapshot of one table keyed by its primary key column, rows as
    /// JSON objects. Backs the reference cache.
    pub fn fetch_table(&self, table: &str, key_column: &str) -> Result<Vec<(i64, Value)>> {
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM {}", table))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let key_idx = names
            .iter()
            .position(|n| n == key_column)
            .with_context(|| format!("{} has no column {}", table, key_column))?;

        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key: i64 = row.get(key_idx)?;
            out.push((key, row_to_json(row, &names)?));
        }
        Ok(out)
    }

    /// Single row by key, or None if it no longer exists.
    pub fn fetch_record(
        &self,
        table: &str,
        key_column: &str,
        key: i64,
    ) -> Result<Option<Value>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} WHERE {} = ?1", table, key_column))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_json(row, &names)?)),
            None => Ok(None),
        }
    }
}

fn row_to_json(row: &rusqlite::Row<'_>, names: &[String]) -> Result<Value> {
    let mut map = Map::new();
    for (i, name) in names.iter().enumerate() {
        let value = match row.get_ref(i)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => Value::from(f),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
            ValueRef::Blob(_) => Value::Null,
        };
        map.insert(name.clone(), value);
    }
    Ok(Value::Object(map))
}
