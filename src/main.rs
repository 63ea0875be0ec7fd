mod calc;
mod config;
mod db;
mod error;
mod grading;
mod ipc;
mod model;

use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

fn init_tracing(filter: &str) {
    // stdout carries the IPC stream; logs go to stderr.
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn main() {
    let cfg = config::DaemonConfig::from_env();
    init_tracing(&cfg.log_filter);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gradebookd starting");

    let startup_workspace = cfg.workspace.clone();
    let mut state = ipc::AppState::new(cfg);
    if let Some(ws) = startup_workspace {
        if let Err(e) = ipc::open_workspace(&mut state, &ws) {
            tracing::error!(workspace = %ws.to_string_lossy(), error = %format!("{e:#}"), "startup workspace could not be opened");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to echo back.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("gradebookd stopped");
}
