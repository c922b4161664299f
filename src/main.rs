use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;

use position_keeper::config::Config;
use position_keeper::db::Db;
use position_keeper::logging::{self, error_log, json_log, obj, v_int, v_str};
use position_keeper::node::{ComputeNode, HttpNode, NullNode};
use position_keeper::orchestrator::{Orchestrator, PollExit};
use position_keeper::queue::{HttpQueue, MessageQueue};
use position_keeper::sandbox::SandboxMode;
use position_keeper::server;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    if let Err(e) = cfg.validate() {
        error_log("startup", obj(&[("fatal", v_str(&e.to_string()))]));
        std::process::exit(1);
    }

    json_log(
        "startup",
        obj(&[
            ("queue_url", v_str(&cfg.queue_url)),
            ("node_id", v_str(&cfg.node_id)),
            ("sqlite_path", v_str(&cfg.sqlite_path)),
            ("lock_id", v_str(&cfg.lock_id)),
            ("idle_timeout_secs", v_int(cfg.idle_timeout_secs)),
            ("config_hash", v_str(&cfg.config_hash())),
        ]),
    );

    let db = Db::open(&cfg.sqlite_path)?;
    db.init()?;

    let queue: Arc<dyn MessageQueue> =
        Arc::new(HttpQueue::new(&cfg.queue_url, cfg.visibility_timeout_secs)?);
    let node: Box<dyn ComputeNode> = match &cfg.node_control_url {
        Some(url) => Box::new(HttpNode::new(url.clone())),
        None => Box::new(NullNode),
    };

    let orchestrator = Arc::new(Mutex::new(Orchestrator::new(cfg.clone(), db, queue)));

    // Control endpoints on a plain OS thread with a second database
    // connection, so stop and status answer while the poller owns the
    // orchestrator for its whole run.
    let control = server::ControlState {
        orchestrator: orchestrator.clone(),
        db: Db::open(&cfg.sqlite_path)?,
        cfg: cfg.clone(),
        runtime: tokio::runtime::Handle::current(),
    };
    std::thread::spawn(move || {
        if let Err(e) = server::serve(control) {
            error_log("server", obj(&[("fatal", v_str(&e.to_string()))]));
        }
    });

    let exit = {
        let mut orch = orchestrator.lock().await;
        orch.run_poller(SandboxMode::FullRefresh, node.as_ref()).await?
    };

    match exit {
        Some(PollExit::IdleShutdown) => {
            logging::flush();
            json_log("shutdown", obj(&[("reason", v_str("idle_timeout"))]));
        }
        Some(PollExit::LockLost) => {
            logging::flush();
            json_log("shutdown", obj(&[("reason", v_str("lock_lost"))]));
        }
        None => {
            error_log("startup", obj(&[("fatal", v_str("lock held by another run"))]));
            std::process::exit(1);
        }
    }

    Ok(())
}
