//! In-memory mirror of the slowly-changing reference tables.
//!
//! The message processor does several lookups per message (entity names, type
//! rules, user accounts); this cache keeps those off the database. Staleness
//! is bounded by the refresh_cache events the writers emit. A refresh that
//! fails leaves the previous snapshot in place: stale-but-available beats
//! unavailable.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::db::Db;
use crate::logging::{error_log, json_log, obj, v_int, v_str};

/// Tables mirrored by default, with their primary key columns.
pub const DEFAULT_TABLES: &[(&str, &str)] = &[
    ("entities", "entity_id"),
    ("transaction_types", "transaction_type_id"),
    ("entity_types", "entity_type_id"),
    ("users", "user_id"),
    ("transaction_statuses", "transaction_status_id"),
];

struct TableSnapshot {
    rows: HashMap<i64, Value>,
    last_refresh: DateTime<Utc>,
}

pub struct ReferenceCache {
    tables: Vec<(String, String)>,
    snapshots: HashMap<String, TableSnapshot>,
}

impl ReferenceCache {
    pub fn new() -> Self {
        Self::with_tables(DEFAULT_TABLES.iter().map(|(t, k)| (t.to_string(), k.to_string())))
    }

    pub fn with_tables(tables: impl IntoIterator<Item = (String, String)>) -> Self {
        Self { tables: tables.into_iter().collect(), snapshots: HashMap::new() }
    }

    fn key_column(&self, table: &str) -> Option<&str> {
        self.tables.iter().find(|(t, _)| t == table).map(|(_, k)| k.as_str())
    }

    /// Warm-up: fetch every registered table in full.
    pub fn load_all(&mut self, db: &Db) {
        let tables: Vec<String> = self.tables.iter().map(|(t, _)| t.clone()).collect();
        for table in tables {
            self.refresh_table(db, &table);
        }
    }

    /// Re-fetch one table and swap the snapshot. On failure the old snapshot
    /// survives untouched.
    pub fn refresh_table(&mut self, db: &Db, table: &str) {
        let Some(key_column) = self.key_column(table).map(str::to_string) else {
            error_log("cache", obj(&[("op", v_str("refresh_table")), ("unregistered", v_str(table))]));
            return;
        };
        match db.fetch_table(table, &key_column) {
            Ok(rows) => {
                let count = rows.len();
                self.snapshots.insert(
                    table.to_string(),
                    TableSnapshot { rows: rows.into_iter().collect(), last_refresh: Utc::now() },
                );
                json_log(
                    "cache",
                    obj(&[
                        ("op", v_str("refresh_table")),
                        ("table", v_str(table)),
                        ("rows", v_int(count as i64)),
                    ]),
                );
            }
            Err(e) => {
                error_log(
                    "cache",
                    obj(&[
                        ("op", v_str("refresh_table")),
                        ("table", v_str(table)),
                        ("error", v_str(&e.to_string())),
                        ("kept_previous_snapshot", v_str("true")),
                    ]),
                );
            }
        }
    }

    /// Refresh exactly one row, keyed by the registered key column; queue
    /// producers never choose the SQL column. Found: replace the entry.
    /// Absent: remove the key, the row was deleted upstream. A table never
    /// loaded falls back to a full refresh.
    pub fn refresh_record(&mut self, db: &Db, table: &str, key: i64) {
        let Some(key_column) = self.key_column(table).map(str::to_string) else {
            error_log(
                "cache",
                obj(&[("op", v_str("refresh_record")), ("unregistered", v_str(table))]),
            );
            return;
        };
        if !self.snapshots.contains_key(table) {
            json_log(
                "cache",
                obj(&[("op", v_str("refresh_record")), ("table_not_loaded", v_str(table))]),
            );
            self.refresh_table(db, table);
            return;
        }
        match db.fetch_record(table, &key_column, key) {
            Ok(Some(row)) => {
                if let Some(snap) = self.snapshots.get_mut(table) {
                    snap.rows.remove(&key);
                    snap.rows.insert(key, row);
                    snap.last_refresh = Utc::now();
                }
                json_log(
                    "cache",
                    obj(&[
                        ("op", v_str("refresh_record")),
                        ("table", v_str(table)),
                        ("key", v_int(key)),
                    ]),
                );
            }
            Ok(None) => {
                if let Some(snap) = self.snapshots.get_mut(table) {
                    snap.rows.remove(&key);
                    snap.last_refresh = Utc::now();
                }
                json_log(
                    "cache",
                    obj(&[
                        ("op", v_str("refresh_record")),
                        ("table", v_str(table)),
                        ("key", v_int(key)),
                        ("removed_deleted_row", v_str("true")),
                    ]),
                );
            }
            Err(e) => {
                error_log(
                    "cache",
                    obj(&[
                        ("op", v_str("refresh_record")),
                        ("table", v_str(table)),
                        ("key", v_int(key)),
                        ("error", v_str(&e.to_string())),
                        ("kept_previous_snapshot", v_str("true")),
                    ]),
                );
            }
        }
    }

    /// Point lookup. A never-loaded table is simply "not found".
    pub fn get(&self, table: &str, key: i64) -> Option<&Value> {
        self.snapshots.get(table)?.rows.get(&key)
    }

    /// In-memory filter; never touches the backing store.
    pub fn lookup<F>(&self, table: &str, predicate: F) -> Vec<&Value>
    where
        F: Fn(&Value) -> bool,
    {
        match self.snapshots.get(table) {
            Some(snap) => snap.rows.values().filter(|row| predicate(row)).collect(),
            None => Vec::new(),
        }
    }

    pub fn last_updated(&self, table: &str) -> Option<DateTime<Utc>> {
        self.snapshots.get(table).map(|s| s.last_refresh)
    }

    /// Entity display name, with a placeholder for ids the cache has never
    /// seen. Missing reference data must not block message handling.
    pub fn entity_name(&self, entity_id: i64) -> String {
        match self.get("entities", entity_id).and_then(|row| row.get("name")) {
            Some(Value::String(name)) => name.clone(),
            _ => format!("Unknown({})", entity_id),
        }
    }
}

impl Default for ReferenceCache {
    fn default() -> Self {
        Self::new()
    }
}
