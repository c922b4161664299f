//! Run orchestrator: wires the lock store, cache, sandbox generator and
//! message processor together behind the start/stop/status commands, and
//! hosts the two run shapes — a finite drain for the HTTP-triggered variant
//! and the long-running poller with idle shutdown.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio::time::sleep;

use crate::cache::ReferenceCache;
use crate::config::Config;
use crate::db::Db;
use crate::idle::IdleMonitor;
use crate::lock::{LockStatus, LockStore};
use crate::logging::{self, error_log, json_log, obj, v_int, v_str, warn_log};
use crate::node::ComputeNode;
use crate::processor::{Disposition, MessageProcessor};
use crate::queue::MessageQueue;
use crate::retry::{retry_async, RetryConfig};
use crate::sandbox::{self, SandboxMode};

#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    pub run_id: i64,
    pub sandbox_rows: u64,
    pub messages_processed: u64,
    pub messages_retained: u64,
    pub orphans_swept: u64,
}

#[derive(Debug)]
pub enum StartOutcome {
    Started(RunStatistics),
    Conflict { holder: String, expires_at: String },
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    WasNotRunning,
}

impl StopOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            StopOutcome::Stopped => "Position Keeper stopped",
            StopOutcome::WasNotRunning => "Position Keeper was not running",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub running: bool,
    pub holder: Option<String>,
    pub expires_at: Option<String>,
    pub position_keeper_id: Option<i64>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollExit {
    IdleShutdown,
    LockLost,
}

pub struct Orchestrator {
    cfg: Config,
    db: Db,
    cache: ReferenceCache,
    queue: Arc<dyn MessageQueue>,
    holder: String,
}

impl Orchestrator {
    pub fn new(cfg: Config, db: Db, queue: Arc<dyn MessageQueue>) -> Self {
        let holder = format!("{}:{}", cfg.node_id, std::process::id());
        Self { cfg, db, cache: ReferenceCache::new(), queue, holder }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn conflict_from(&self, status: Option<LockStatus>) -> StartOutcome {
        match status {
            Some(s) => StartOutcome::Conflict {
                holder: s.holder,
                expires_at: s.expires_at.to_rfc3339(),
            },
            None => StartOutcome::Conflict { holder: String::new(), expires_at: String::new() },
        }
    }

    /// Lock acquisition, run record, cache warm-up and sandbox generation —
    /// shared by both run shapes. On failure after acquisition the lock is
    /// released so the failed run does not wedge the system.
    fn begin_run(&mut self, mode: SandboxMode) -> Result<BeginOutcome> {
        let locks = LockStore::new(&self.db);
        let ttl = Duration::seconds(self.cfg.lock_ttl_secs);

        if let Some(status) = locks.status(&self.cfg.lock_id)? {
            if status.is_active {
                return Ok(BeginOutcome::Conflict(Some(status)));
            }
        }
        if !locks.acquire_with_reclaim(&self.cfg.lock_id, &self.holder, ttl)? {
            let status = locks.status(&self.cfg.lock_id)?;
            return Ok(BeginOutcome::Conflict(status));
        }

        let expires_at = (Utc::now() + ttl).to_rfc3339();
        let warmed = (|| -> Result<(i64, u64)> {
            let run_id = self.db.insert_run_record(&self.cfg.lock_id, &self.holder, &expires_at)?;
            self.cache.load_all(&self.db);
            let rows = sandbox::generate(&mut self.db, run_id, mode)?;
            Ok((run_id, rows))
        })();

        match warmed {
            Ok((run_id, rows)) => {
                json_log(
                    "run",
                    obj(&[
                        ("run_id", v_int(run_id)),
                        ("mode", v_str(mode.as_str())),
                        ("sandbox_rows", v_int(rows as i64)),
                        ("holder", v_str(&self.holder)),
                    ]),
                );
                Ok(BeginOutcome::Running { run_id, sandbox_rows: rows })
            }
            Err(e) => {
                let _ = LockStore::new(&self.db).release(&self.cfg.lock_id);
                Err(e)
            }
        }
    }

    /// The HTTP-triggered variant: run to completion, then release the lock.
    pub async fn start(&mut self, mode: SandboxMode) -> Result<StartOutcome> {
        let (run_id, sandbox_rows) = match self.begin_run(mode)? {
            BeginOutcome::Conflict(status) => return Ok(self.conflict_from(status)),
            BeginOutcome::Running { run_id, sandbox_rows } => (run_id, sandbox_rows),
        };

        let drained = self.drain_queue().await;
        let result = drained.and_then(|(processed, retained)| {
            let orphans_swept = self.db.sweep_orphans(self.cfg.system_user_id)?;
            Ok(RunStatistics {
                run_id,
                sandbox_rows,
                messages_processed: processed,
                messages_retained: retained,
                orphans_swept,
            })
        });

        let _ = LockStore::new(&self.db).release(&self.cfg.lock_id);
        result.map(StartOutcome::Started)
    }

    /// Receive until an empty batch comes back. Each message is handled
    /// independently; one failure never blocks the rest of the batch.
    async fn drain_queue(&mut self) -> Result<(u64, u64)> {
        let mut processed: u64 = 0;
        let mut retained: u64 = 0;
        loop {
            let batch = self
                .queue
                .receive(self.cfg.receive_max_messages, 0)
                .await?;
            if batch.is_empty() {
                break;
            }
            for msg in batch {
                let disposition = MessageProcessor::new(
                    &self.db,
                    &mut self.cache,
                    self.cfg.system_user_id,
                )
                .handle(&msg.message_id, &msg.body);
                match disposition {
                    Disposition::Delete => {
                        self.queue.delete(&msg.receipt).await?;
                        processed += 1;
                    }
                    Disposition::Retain => retained += 1,
                }
            }
        }
        Ok((processed, retained))
    }

    /// The long-running variant: acquire, warm up, then long-poll until idle
    /// timeout or lock loss. Idle shutdown deliberately leaves the lock in
    /// place — its TTL governs reclaim by the next run.
    pub async fn run_poller(
        &mut self,
        mode: SandboxMode,
        node: &dyn ComputeNode,
    ) -> Result<Option<PollExit>> {
        match self.begin_run(mode)? {
            BeginOutcome::Conflict(status) => {
                warn_log(
                    "run",
                    obj(&[
                        ("warning", v_str("lock held, poller not started")),
                        ("holder", v_str(&status.map(|s| s.holder).unwrap_or_default())),
                    ]),
                );
                return Ok(None);
            }
            BeginOutcome::Running { .. } => {}
        }

        json_log(
            "run",
            obj(&[
                ("poller", v_str("started")),
                ("idle_timeout_secs", v_int(self.cfg.idle_timeout_secs)),
            ]),
        );

        let ttl = Duration::seconds(self.cfg.lock_ttl_secs);
        let mut monitor = IdleMonitor::new(self.cfg.idle_timeout_secs);
        loop {
            // Cooperative stop and lease renewal. A released, stolen or
            // expired lock means an external stop command or a competing run;
            // exit before touching the queue. While still the active holder,
            // push the expiry forward so a long-running poll cannot outlive
            // the TTL. Scoped so no database borrow is held across an await.
            {
                let locks = LockStore::new(&self.db);
                match locks.status(&self.cfg.lock_id)? {
                    Some(status) if status.holder == self.holder && status.is_active => {
                        locks.renew(&self.cfg.lock_id, &self.holder, ttl)?;
                    }
                    other => {
                        json_log(
                            "run",
                            obj(&[
                                ("poller", v_str("lock_lost")),
                                (
                                    "current_holder",
                                    v_str(&other.map(|s| s.holder).unwrap_or_default()),
                                ),
                            ]),
                        );
                        return Ok(Some(PollExit::LockLost));
                    }
                }
            }

            if monitor.expired(Utc::now()) {
                warn_log(
                    "run",
                    obj(&[
                        ("poller", v_str("idle_timeout")),
                        ("idle_secs", v_int(monitor.idle_for(Utc::now()).num_seconds())),
                    ]),
                );
                logging::flush();
                retry_async(&RetryConfig::default(), "node_stop", || {
                    node.stop(&self.cfg.node_id)
                })
                .await?;
                return Ok(Some(PollExit::IdleShutdown));
            }

            let batch = match self
                .queue
                .receive(self.cfg.receive_max_messages, self.cfg.receive_wait_secs)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error_log("run", obj(&[("queue_error", v_str(&e.to_string()))]));
                    sleep(std::time::Duration::from_secs(self.cfg.error_backoff_secs)).await;
                    continue;
                }
            };

            if batch.is_empty() {
                sleep(std::time::Duration::from_secs(self.cfg.poll_interval_secs)).await;
                continue;
            }

            for msg in batch {
                let disposition = MessageProcessor::new(
                    &self.db,
                    &mut self.cache,
                    self.cfg.system_user_id,
                )
                .handle(&msg.message_id, &msg.body);
                if disposition == Disposition::Delete {
                    if let Err(e) = self.queue.delete(&msg.receipt).await {
                        error_log("run", obj(&[("delete_error", v_str(&e.to_string()))]));
                        continue;
                    }
                }
                // Any handled message resets the idle clock, cache refreshes
                // included.
                monitor.touch();
            }
        }
    }

    pub fn stop(&self) -> Result<StopOutcome> {
        stop(&self.db, &self.cfg)
    }

    pub fn status(&self) -> Result<StatusReport> {
        status(&self.db, &self.cfg)
    }
}

/// Release the lock if someone holds it. A free function over any connection:
/// the control server runs it on its own `Db`, so a poller that owns the
/// orchestrator can still be stopped from outside.
pub fn stop(db: &Db, cfg: &Config) -> Result<StopOutcome> {
    let locks = LockStore::new(db);
    match locks.status(&cfg.lock_id)? {
        Some(status) if status.is_active => {
            locks.release(&cfg.lock_id)?;
            Ok(StopOutcome::Stopped)
        }
        _ => Ok(StopOutcome::WasNotRunning),
    }
}

/// Lock status verbatim, plus the active run id when one exists. Same
/// any-connection contract as [`stop`].
pub fn status(db: &Db, cfg: &Config) -> Result<StatusReport> {
    let locks = LockStore::new(db);
    match locks.status(&cfg.lock_id)? {
        Some(status) if status.is_active => {
            let run_id = current_run_id(db, &status.holder)?;
            Ok(StatusReport {
                running: true,
                holder: Some(status.holder),
                expires_at: Some(status.expires_at.to_rfc3339()),
                position_keeper_id: run_id,
            })
        }
        Some(status) => Ok(StatusReport {
            running: false,
            holder: Some(status.holder),
            expires_at: Some(status.expires_at.to_rfc3339()),
            position_keeper_id: None,
        }),
        None => Ok(StatusReport {
            running: false,
            holder: None,
            expires_at: None,
            position_keeper_id: None,
        }),
    }
}

fn current_run_id(db: &Db, holder: &str) -> Result<Option<i64>> {
    let mut stmt = db.conn().prepare(
        "SELECT position_keeper_id FROM position_keepers
         WHERE holder = ?1 ORDER BY position_keeper_id DESC LIMIT 1",
    )?;
    let mut rows = stmt.query(rusqlite::params![holder])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

enum BeginOutcome {
    Conflict(Option<LockStatus>),
    Running { run_id: i64, sandbox_rows: u64 },
}
