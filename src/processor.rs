//! Message processor: routes decoded queue payloads by operation and drives
//! the transaction status machine.
//!
//! Every handler is idempotent, which is what makes at-least-once delivery
//! safe: re-running a status transition or a cache refresh lands in the same
//! state. A message is deleted on any handled path; it is retained only when
//! handling failed for a reason redelivery can fix.

use serde_json::Value;

use crate::cache::ReferenceCache;
use crate::db::Db;
use crate::logging::{error_log, json_log, obj, v_int, v_str, warn_log};
use crate::model::{QueueMessage, TransactionStatus, TransactionTypeRule};

/// What to do with the message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handled (or permanently unhandleable): remove from the queue.
    Delete,
    /// Leave in place for the queue's redelivery mechanism.
    Retain,
}

pub struct MessageProcessor<'a> {
    db: &'a Db,
    cache: &'a mut ReferenceCache,
    system_user_id: i64,
}

impl<'a> MessageProcessor<'a> {
    pub fn new(db: &'a Db, cache: &'a mut ReferenceCache, system_user_id: i64) -> Self {
        Self { db, cache, system_user_id }
    }

    pub fn handle(&mut self, message_id: &str, body: &str) -> Disposition {
        let message: QueueMessage = match serde_json::from_str(body) {
            Ok(m) => m,
            Err(e) => {
                // Retrying cannot fix a parse failure.
                error_log(
                    "processor",
                    obj(&[
                        ("message_id", v_str(message_id)),
                        ("error", v_str(&format!("malformed body: {}", e))),
                        ("disposition", v_str("delete")),
                    ]),
                );
                return Disposition::Delete;
            }
        };

        match message.operation.as_str() {
            "refresh_cache" => self.handle_refresh_cache(message_id, &message),
            "create" | "update" => self.handle_transaction(message_id, &message),
            other => {
                json_log(
                    "processor",
                    obj(&[
                        ("message_id", v_str(message_id)),
                        ("unrecognized_operation", v_str(other)),
                    ]),
                );
                Disposition::Delete
            }
        }
    }

    fn handle_refresh_cache(&mut self, message_id: &str, message: &QueueMessage) -> Disposition {
        let Some(table) = message.table.as_deref() else {
            warn_log(
                "processor",
                obj(&[
                    ("message_id", v_str(message_id)),
                    ("warning", v_str("cache refresh message missing 'table' field")),
                ]),
            );
            return Disposition::Delete;
        };

        match &message.primary_key {
            Some(key_value) => {
                let Some(key) = as_key(key_value) else {
                    warn_log(
                        "processor",
                        obj(&[
                            ("message_id", v_str(message_id)),
                            ("table", v_str(table)),
                            ("warning", v_str("primary_key is not an integer")),
                        ]),
                    );
                    return Disposition::Delete;
                };
                self.cache.refresh_record(self.db, table, key);
            }
            None => self.cache.refresh_table(self.db, table),
        }
        Disposition::Delete
    }

    fn handle_transaction(&mut self, message_id: &str, message: &QueueMessage) -> Disposition {
        let Some(transaction_id) = message.transaction_id else {
            warn_log(
                "processor",
                obj(&[
                    ("message_id", v_str(message_id)),
                    ("operation", v_str(&message.operation)),
                    ("warning", v_str("missing transaction_id")),
                ]),
            );
            return Disposition::Delete;
        };

        let row = match self.db.transaction_by_id(transaction_id) {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn_log(
                    "processor",
                    obj(&[
                        ("message_id", v_str(message_id)),
                        ("transaction_id", v_int(transaction_id)),
                        ("warning", v_str("transaction not found")),
                    ]),
                );
                return Disposition::Delete;
            }
            Err(e) => {
                error_log(
                    "processor",
                    obj(&[
                        ("message_id", v_str(message_id)),
                        ("transaction_id", v_int(transaction_id)),
                        ("error", v_str(&e.to_string())),
                        ("disposition", v_str("retain")),
                    ]),
                );
                return Disposition::Retain;
            }
        };

        let type_id = row.transaction_type_id.or(message.transaction_type_id);
        let Some(type_id) = type_id else {
            warn_log(
                "processor",
                obj(&[
                    ("message_id", v_str(message_id)),
                    ("transaction_id", v_int(transaction_id)),
                    ("warning", v_str("transaction has no type")),
                ]),
            );
            return Disposition::Delete;
        };

        // The cache may not be warm yet; let the queue redeliver this one.
        let Some(type_row) = self.cache.get("transaction_types", type_id) else {
            warn_log(
                "processor",
                obj(&[
                    ("message_id", v_str(message_id)),
                    ("transaction_type_id", v_int(type_id)),
                    ("warning", v_str("transaction type not in cache")),
                    ("disposition", v_str("retain")),
                ]),
            );
            return Disposition::Retain;
        };
        let rule = TransactionTypeRule::from_row(type_row);

        if rule.position_keeping_actions.is_empty() {
            json_log(
                "processor",
                obj(&[
                    ("transaction_id", v_int(transaction_id)),
                    ("transaction_type_id", v_int(type_id)),
                    ("no_position_keeping_actions", v_str("true")),
                ]),
            );
            return Disposition::Delete;
        }

        let status = match TransactionStatus::from_id(row.transaction_status_id) {
            Some(s) => s,
            None => {
                warn_log(
                    "processor",
                    obj(&[
                        ("transaction_id", v_int(transaction_id)),
                        ("unrecognized_status_id", v_int(row.transaction_status_id)),
                    ]),
                );
                return Disposition::Delete;
            }
        };

        match status {
            TransactionStatus::Incomplete => {
                json_log(
                    "processor",
                    obj(&[
                        ("transaction_id", v_int(transaction_id)),
                        ("status", v_str(status.name())),
                        ("action", v_str("none")),
                    ]),
                );
                Disposition::Delete
            }
            TransactionStatus::New | TransactionStatus::Amended => {
                self.process_queued_transaction(transaction_id, &row, &rule)
            }
            TransactionStatus::Processed | TransactionStatus::Unknown => {
                warn_log(
                    "processor",
                    obj(&[
                        ("transaction_id", v_int(transaction_id)),
                        ("status", v_str(status.name())),
                        ("warning", v_str("no action for this status")),
                    ]),
                );
                Disposition::Delete
            }
        }
    }

    fn process_queued_transaction(
        &mut self,
        transaction_id: i64,
        row: &crate::model::TransactionRow,
        rule: &TransactionTypeRule,
    ) -> Disposition {
        let portfolio = row
            .portfolio_entity_id
            .map(|id| self.cache.entity_name(id))
            .unwrap_or_else(|| "Unknown(-)".to_string());
        let contra = row
            .contra_entity_id
            .map(|id| self.cache.entity_name(id))
            .unwrap_or_else(|| "Unknown(-)".to_string());
        // Transactions without an instrument move cash.
        let instrument = row
            .instrument_entity_id
            .map(|id| self.cache.entity_name(id))
            .unwrap_or_else(|| "Cash".to_string());

        for action in &rule.position_keeping_actions {
            // Placeholder: acknowledged, not computed. Valuation math lands
            // here once the position fields are wired through.
            json_log(
                "position_action",
                obj(&[
                    ("transaction_id", v_int(transaction_id)),
                    ("action", v_str(&action.name)),
                    ("portfolio", v_str(&portfolio)),
                    ("contra", v_str(&contra)),
                    ("instrument", v_str(&instrument)),
                    ("executed", v_str("acknowledged")),
                ]),
            );
        }

        match self.db.set_transaction_status(
            transaction_id,
            TransactionStatus::Processed,
            self.system_user_id,
        ) {
            Ok(_) => {
                json_log(
                    "processor",
                    obj(&[
                        ("transaction_id", v_int(transaction_id)),
                        ("new_status", v_str(TransactionStatus::Processed.name())),
                        ("updated_user_id", v_int(self.system_user_id)),
                    ]),
                );
                Disposition::Delete
            }
            Err(e) => {
                error_log(
                    "processor",
                    obj(&[
                        ("transaction_id", v_int(transaction_id)),
                        ("error", v_str(&e.to_string())),
                        ("disposition", v_str("retain")),
                    ]),
                );
                Disposition::Retain
            }
        }
    }
}

fn as_key(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
