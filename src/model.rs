//! Domain types shared across the worker.

use serde::Deserialize;
use serde_json::Value;

/// Transaction lifecycle status with its wire code in the backing store.
///
/// Amended carries its own code (5): it is re-queued work that must be
/// distinguishable from Unknown at the orphan-sweep boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Incomplete,
    New,
    Processed,
    Unknown,
    Amended,
}

impl TransactionStatus {
    pub fn id(&self) -> i64 {
        match self {
            TransactionStatus::Incomplete => 1,
            TransactionStatus::New => 2,
            TransactionStatus::Processed => 3,
            TransactionStatus::Unknown => 4,
            TransactionStatus::Amended => 5,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(TransactionStatus::Incomplete),
            2 => Some(TransactionStatus::New),
            3 => Some(TransactionStatus::Processed),
            4 => Some(TransactionStatus::Unknown),
            5 => Some(TransactionStatus::Amended),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionStatus::Incomplete => "INCOMPLETE",
            TransactionStatus::New => "NEW",
            TransactionStatus::Processed => "PROCESSED",
            TransactionStatus::Unknown => "UNKNOWN",
            TransactionStatus::Amended => "AMENDED",
        }
    }
}

/// Position date basis for a sandbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionType {
    TradeDate,
    SettleDate,
}

impl PositionType {
    pub fn id(&self) -> i64 {
        match self {
            PositionType::TradeDate => 1,
            PositionType::SettleDate => 2,
        }
    }

    pub const ALL: [PositionType; 2] = [PositionType::TradeDate, PositionType::SettleDate];
}

/// One action descriptor attached to a transaction type. Execution is a
/// placeholder until position valuation lands; the descriptor shape is kept
/// so rules parse fully.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionKeepingAction {
    pub name: String,
    #[serde(default)]
    pub fields: Value,
}

/// Rule derived from a transaction type's properties JSON. Read-only here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransactionTypeRule {
    #[serde(default)]
    pub current_position_field: Option<String>,
    #[serde(default)]
    pub forecast_position_field: Option<String>,
    #[serde(default)]
    pub position_keeping_actions: Vec<PositionKeepingAction>,
}

impl TransactionTypeRule {
    /// Parse a rule out of a cached transaction_types row. The properties
    /// column may hold a JSON object or a JSON string wrapping one.
    pub fn from_row(row: &Value) -> Self {
        let props = match row.get("properties") {
            Some(Value::String(s)) => serde_json::from_str::<Value>(s).unwrap_or(Value::Null),
            Some(v) => v.clone(),
            None => Value::Null,
        };
        serde_json::from_value(props).unwrap_or_default()
    }
}

/// Decoded queue message body (see the queue wire schema).
#[derive(Debug, Clone, Deserialize)]
pub struct QueueMessage {
    pub operation: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub primary_key: Option<Value>,
    #[serde(default)]
    pub transaction_id: Option<i64>,
    #[serde(default)]
    pub transaction_type_id: Option<i64>,
    #[serde(default)]
    pub portfolio_entity_id: Option<i64>,
    #[serde(default)]
    pub contra_entity_id: Option<i64>,
    #[serde(default)]
    pub instrument_entity_id: Option<i64>,
    #[serde(default)]
    pub trade_date: Option<String>,
    #[serde(default)]
    pub settle_date: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub updated_user_id: Option<i64>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Transaction row as this worker reads it. Creation and most mutation belong
/// to the CRUD layer; the worker only flips status.
#[derive(Debug, Clone)]
pub struct TransactionRow {
    pub transaction_id: i64,
    pub transaction_type_id: Option<i64>,
    pub transaction_status_id: i64,
    pub portfolio_entity_id: Option<i64>,
    pub contra_entity_id: Option<i64>,
    pub instrument_entity_id: Option<i64>,
    pub trade_date: Option<String>,
    pub settle_date: Option<String>,
    pub properties: Option<String>,
    pub updated_user_id: Option<i64>,
}
