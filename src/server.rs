//! Control endpoints for the position keeper.
//!
//! POST /position-keeper/start               start a run (full refresh)
//! POST /position-keeper/start/full-refresh  same, mode spelled out
//! POST /position-keeper/stop                release the lock
//! GET  /position-keeper/status              lock status verbatim

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::Db;
use crate::lock::LockStore;
use crate::logging::{error_log, json_log, obj, v_str};
use crate::orchestrator::{self, Orchestrator, StartOutcome};
use crate::sandbox::SandboxMode;

/// Everything the control thread needs. `db` is the server's own connection:
/// stop and status go straight to the lock table, so they answer even while
/// the poller holds the orchestrator for its whole run.
pub struct ControlState {
    pub orchestrator: Arc<Mutex<Orchestrator>>,
    pub db: Db,
    pub cfg: Config,
    pub runtime: tokio::runtime::Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start(SandboxMode),
    Stop,
    Status,
}

/// Map a request line to a command. None means 404.
pub fn route(request_line: &str) -> Option<Command> {
    if request_line.starts_with("POST /position-keeper/start/full-refresh") {
        Some(Command::Start(SandboxMode::FullRefresh))
    } else if request_line.starts_with("POST /position-keeper/start/incremental") {
        Some(Command::Start(SandboxMode::Incremental))
    } else if request_line.starts_with("POST /position-keeper/start") {
        Some(Command::Start(SandboxMode::FullRefresh))
    } else if request_line.starts_with("POST /position-keeper/stop") {
        Some(Command::Stop)
    } else if request_line.starts_with("GET /position-keeper/status") {
        Some(Command::Status)
    } else {
        None
    }
}

pub fn dispatch(command: Command, state: &ControlState) -> (u16, Value) {
    match command {
        Command::Start(mode) => {
            // A busy orchestrator means the poller is mid-run; report the
            // conflict from the lock table instead of waiting for the mutex.
            let mut orch = match state.orchestrator.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    let (holder, expires_at) = match LockStore::new(&state.db)
                        .status(&state.cfg.lock_id)
                    {
                        Ok(Some(s)) => (s.holder, s.expires_at.to_rfc3339()),
                        _ => (String::new(), String::new()),
                    };
                    return (
                        409,
                        json!({
                            "error": "Position Keeper is already running",
                            "holder": holder,
                            "expires_at": expires_at,
                        }),
                    );
                }
            };
            let result = state.runtime.block_on(orch.start(mode));
            match result {
                Ok(StartOutcome::Started(stats)) => (
                    200,
                    json!({
                        "message": "Position Keeper run completed successfully",
                        "statistics": {
                            "run_id": stats.run_id,
                            "sandbox_rows": stats.sandbox_rows,
                            "messages_processed": stats.messages_processed,
                            "messages_retained": stats.messages_retained,
                            "orphans_swept": stats.orphans_swept,
                        }
                    }),
                ),
                Ok(StartOutcome::Conflict { holder, expires_at }) => (
                    409,
                    json!({
                        "error": "Position Keeper is already running",
                        "holder": holder,
                        "expires_at": expires_at,
                    }),
                ),
                Err(e) => (500, json!({ "error": format!("Internal server error: {}", e) })),
            }
        }
        Command::Stop => match orchestrator::stop(&state.db, &state.cfg) {
            Ok(outcome) => (200, json!({ "message": outcome.message() })),
            Err(e) => (500, json!({ "error": format!("Internal server error: {}", e) })),
        },
        Command::Status => {
            match orchestrator::status(&state.db, &state.cfg) {
                Ok(report) => {
                    let mut body = json!({
                        "status": if report.running { "running" } else { "idle" },
                    });
                    if let Some(holder) = report.holder {
                        body["holder"] = json!(holder);
                    }
                    if let Some(expires_at) = report.expires_at {
                        body["expires_at"] = json!(expires_at);
                    }
                    if let Some(run_id) = report.position_keeper_id {
                        body["position_keeper_id"] = json!(run_id);
                    }
                    (200, body)
                }
                Err(e) => (500, json!({ "error": format!("Internal server error: {}", e) })),
            }
        }
    }
}

fn status_text(code: u16) -> &'static str {
    match code {
        200 => "200 OK",
        404 => "404 NOT FOUND",
        409 => "409 CONFLICT",
        _ => "500 INTERNAL SERVER ERROR",
    }
}

fn respond(stream: &mut TcpStream, code: u16, body: &Value) {
    let payload = body.to_string();
    let response = format!(
        "HTTP/1.1 {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\r\n{}",
        status_text(code),
        payload.len(),
        payload
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Blocking accept loop. Runs on its own OS thread next to the tokio runtime.
pub fn serve(state: ControlState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&state.cfg.server_bind)?;
    json_log("server", obj(&[("listening", v_str(&state.cfg.server_bind))]));

    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error_log("server", obj(&[("accept_error", v_str(&e.to_string()))]));
                continue;
            }
        };

        let buf_reader = BufReader::new(&stream);
        let request_line = match buf_reader.lines().next() {
            Some(Ok(line)) => line,
            _ => continue,
        };

        match route(&request_line) {
            Some(command) => {
                let (code, body) = dispatch(command, &state);
                json_log(
                    "server",
                    obj(&[("request", v_str(&request_line)), ("status", json!(code))]),
                );
                respond(&mut stream, code, &body);
            }
            None => {
                respond(
                    &mut stream,
                    404,
                    &json!({ "error": "Invalid endpoint. Use /position-keeper/start | stop | status" }),
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_commands() {
        assert_eq!(
            route("POST /position-keeper/start HTTP/1.1"),
            Some(Command::Start(SandboxMode::FullRefresh))
        );
        assert_eq!(
            route("POST /position-keeper/start/full-refresh HTTP/1.1"),
            Some(Command::Start(SandboxMode::FullRefresh))
        );
        assert_eq!(
            route("POST /position-keeper/start/incremental HTTP/1.1"),
            Some(Command::Start(SandboxMode::Incremental))
        );
        assert_eq!(route("POST /position-keeper/stop HTTP/1.1"), Some(Command::Stop));
        assert_eq!(route("GET /position-keeper/status HTTP/1.1"), Some(Command::Status));
        assert_eq!(route("GET /somewhere-else HTTP/1.1"), None);
    }

    #[test]
    fn status_lines_cover_used_codes() {
        assert_eq!(status_text(200), "200 OK");
        assert_eq!(status_text(409), "409 CONFLICT");
        assert_eq!(status_text(500), "500 INTERNAL SERVER ERROR");
    }
}
