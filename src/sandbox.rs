//! Sandbox generator: the date x position-type x entity-pair grid of
//! zero-valued placeholder rows for one run. Share and market-value math is
//! deferred; the grid is what downstream valuation will fill in.

use anyhow::{anyhow, bail, Result};
use chrono::NaiveDate;
use rusqlite::params;

use crate::db::Db;
use crate::logging::{json_log, obj, v_int, v_str};
use crate::model::PositionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    FullRefresh,
    Incremental,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::FullRefresh => "full_refresh",
            SandboxMode::Incremental => "incremental",
        }
    }
}

/// Regenerate the sandbox for `run_id`. Returns rows inserted.
///
/// FullRefresh deletes any rows already tagged with the run id first, so a
/// re-run for the same run id lands in the same place. Incremental has no
/// agreed algorithm yet and refuses to run rather than guessing.
pub fn generate(db: &mut Db, run_id: i64, mode: SandboxMode) -> Result<u64> {
    match mode {
        SandboxMode::FullRefresh => generate_full_refresh(db, run_id),
        SandboxMode::Incremental => {
            bail!("incremental sandbox mode is not implemented; use full refresh")
        }
    }
}

fn generate_full_refresh(db: &mut Db, run_id: i64) -> Result<u64> {
    let Some((min_date, max_date)) = date_bounds(db)? else {
        json_log(
            "sandbox",
            obj(&[("mode", v_str("full_refresh")), ("rows", v_int(0)), ("reason", v_str("no_transactions"))]),
        );
        return Ok(0);
    };
    let pairs = entity_pairs(db)?;
    if pairs.is_empty() {
        json_log(
            "sandbox",
            obj(&[("mode", v_str("full_refresh")), ("rows", v_int(0)), ("reason", v_str("no_entity_pairs"))]),
        );
        return Ok(0);
    }

    let tx = db.conn_mut().transaction()?;
    tx.execute("DELETE FROM position_sandbox WHERE position_keeper_id = ?1", params![run_id])?;

    let mut inserted: u64 = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO position_sandbox (
                position_date, position_type_id, portfolio_entity_id,
                instrument_entity_id, share_amount, market_value, position_keeper_id
             ) VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
        )?;
        let mut date = min_date;
        while date <= max_date {
            let date_str = date.format("%Y-%m-%d").to_string();
            for (entity_id, instrument_id) in &pairs {
                for position_type in PositionType::ALL {
                    stmt.execute(params![date_str, position_type.id(), entity_id, instrument_id, run_id])?;
                    inserted += 1;
                }
            }
            date = date
                .succ_opt()
                .ok_or_else(|| anyhow!("date overflow past {}", date))?;
        }
    }
    tx.commit()?;

    json_log(
        "sandbox",
        obj(&[
            ("mode", v_str("full_refresh")),
            ("run_id", v_int(run_id)),
            ("min_date", v_str(&min_date.to_string())),
            ("max_date", v_str(&max_date.to_string())),
            ("pairs", v_int(pairs.len() as i64)),
            ("rows", v_int(inserted as i64)),
        ]),
    );
    Ok(inserted)
}

/// Min/max over both trade and settle dates across all transactions.
/// ISO dates compare correctly as text, so SQL MIN/MAX does the scan.
fn date_bounds(db: &Db) -> Result<Option<(NaiveDate, NaiveDate)>> {
    let mut stmt = db.conn().prepare(
        "SELECT MIN(trade_date), MIN(settle_date), MAX(trade_date), MAX(settle_date)
         FROM transactions",
    )?;
    let bounds: (Option<String>, Option<String>, Option<String>, Option<String>) =
        stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))?;

    let parse = |s: &Option<String>| -> Result<Option<NaiveDate>> {
        match s {
            Some(raw) => Ok(Some(
                NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                    .map_err(|e| anyhow!("bad date {:?}: {}", raw, e))?,
            )),
            None => Ok(None),
        }
    };

    let candidates: Vec<NaiveDate> = [parse(&bounds.0)?, parse(&bounds.1)?]
        .into_iter()
        .flatten()
        .collect();
    let max_candidates: Vec<NaiveDate> = [parse(&bounds.2)?, parse(&bounds.3)?]
        .into_iter()
        .flatten()
        .collect();

    match (candidates.into_iter().min(), max_candidates.into_iter().max()) {
        (Some(min), Some(max)) => Ok(Some((min, max))),
        _ => Ok(None),
    }
}

/// Distinct (entity, instrument) pairs seen on either side of a transaction.
fn entity_pairs(db: &Db) -> Result<Vec<(i64, i64)>> {
    let mut stmt = db.conn().prepare(
        "SELECT DISTINCT portfolio_entity_id, instrument_entity_id FROM transactions
            WHERE portfolio_entity_id IS NOT NULL AND instrument_entity_id IS NOT NULL
         UNION
         SELECT DISTINCT contra_entity_id, instrument_entity_id FROM transactions
            WHERE contra_entity_id IS NOT NULL AND instrument_entity_id IS NOT NULL",
    )?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut pairs = Vec::new();
    for pair in rows {
        pairs.push(pair?);
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_transactions(rows: &[(i64, i64, i64, i64, &str, &str)]) -> Db {
        let db = Db::open_in_memory().unwrap();
        db.init().unwrap();
        for (id, portfolio, contra, instrument, trade, settle) in rows {
            db.conn()
                .execute(
                    "INSERT INTO transactions (transaction_id, transaction_status_id,
                        portfolio_entity_id, contra_entity_id, instrument_entity_id,
                        trade_date, settle_date)
                     VALUES (?1, 2, ?2, ?3, ?4, ?5, ?6)",
                    params![id, portfolio, contra, instrument, trade, settle],
                )
                .unwrap();
        }
        db
    }

    fn sandbox_count(db: &Db, run_id: i64) -> i64 {
        db.conn()
            .query_row(
                "SELECT COUNT(*) FROM position_sandbox WHERE position_keeper_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[test]
    fn zero_transactions_yield_zero_rows() {
        let mut db = db_with_transactions(&[]);
        assert_eq!(generate(&mut db, 1, SandboxMode::FullRefresh).unwrap(), 0);
        assert_eq!(sandbox_count(&db, 1), 0);
    }

    #[test]
    fn row_count_is_days_times_two_times_pairs() {
        // 2025-01-01 .. 2025-01-03 inclusive = 3 days; pairs: (10,30) and (20,30).
        let mut db =
            db_with_transactions(&[(1, 10, 20, 30, "2025-01-01", "2025-01-03")]);
        let rows = generate(&mut db, 7, SandboxMode::FullRefresh).unwrap();
        assert_eq!(rows, 3 * 2 * 2);
        assert_eq!(sandbox_count(&db, 7), 12);
    }

    #[test]
    fn rerun_is_idempotent() {
        let mut db =
            db_with_transactions(&[(1, 10, 20, 30, "2025-01-01", "2025-01-02")]);
        let first = generate(&mut db, 3, SandboxMode::FullRefresh).unwrap();
        let second = generate(&mut db, 3, SandboxMode::FullRefresh).unwrap();
        assert_eq!(first, second);
        assert_eq!(sandbox_count(&db, 3), first as i64);
    }

    #[test]
    fn runs_are_scoped_by_run_id() {
        let mut db =
            db_with_transactions(&[(1, 10, 20, 30, "2025-01-01", "2025-01-01")]);
        let a = generate(&mut db, 1, SandboxMode::FullRefresh).unwrap();
        let b = generate(&mut db, 2, SandboxMode::FullRefresh).unwrap();
        assert_eq!(sandbox_count(&db, 1), a as i64);
        assert_eq!(sandbox_count(&db, 2), b as i64);
    }

    #[test]
    fn rows_are_zero_valued() {
        let mut db =
            db_with_transactions(&[(1, 10, 20, 30, "2025-01-05", "2025-01-05")]);
        generate(&mut db, 9, SandboxMode::FullRefresh).unwrap();
        let nonzero: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM position_sandbox
                 WHERE position_keeper_id = 9 AND (share_amount != 0 OR market_value != 0)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(nonzero, 0);
    }

    #[test]
    fn incremental_fails_loudly() {
        let mut db =
            db_with_transactions(&[(1, 10, 20, 30, "2025-01-01", "2025-01-02")]);
        let err = generate(&mut db, 1, SandboxMode::Incremental).unwrap_err();
        assert!(err.to_string().contains("not implemented"));
        assert_eq!(sandbox_count(&db, 1), 0);
    }
}
