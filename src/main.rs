use std::process::ExitCode;

use tracing::{error, info, warn};

use tg_sync_engine::config::Config;
use tg_sync_engine::daemon::Daemon;
use tg_sync_engine::error::EngineError;
use tg_sync_engine::logging::setup_logging;
use tg_sync_engine::status::StatusService;

/// Thin CLI dispatch over the three `daemon` subcommands of spec §6.2. Plays the
/// composition-root role the teacher's `main.rs` plays: load env, init logging, wire
/// the long-lived services, then hand off to the loop that drives them.
#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = setup_logging() {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(String::as_str);

    let code = match command {
        Some("start") => run_start().await,
        Some("status") => run_status().await,
        Some("stop") => run_stop().await,
        _ => {
            eprintln!("usage: tg-sync-engined <daemon-start|daemon-status|daemon-stop> (or: start|status|stop)");
            1
        }
    };

    ExitCode::from(code as u8)
}

async fn run_start() -> i32 {
    let data_dir = Config::data_dir();
    info!(data_dir = %data_dir.display(), "starting daemon");

    let daemon = match Daemon::bootstrap(data_dir).await {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, code = e.code(), "daemon failed to start");
            return e.daemon_exit_code();
        }
    };

    daemon.run().await
}

async fn run_status() -> i32 {
    let data_dir = Config::data_dir();
    match load_status(&data_dir).await {
        Ok(Some(status)) => {
            match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("failed to serialize status: {e}"),
            }
            0
        }
        Ok(None) => {
            println!("{{\"state\":\"not_running\"}}");
            EngineError::DaemonNotRunning.daemon_exit_code()
        }
        Err(e) => {
            eprintln!("failed to read daemon status: {e}");
            e.daemon_exit_code()
        }
    }
}

async fn load_status(
    data_dir: &std::path::Path,
) -> tg_sync_engine::error::Result<Option<tg_sync_engine::status::DaemonStatus>> {
    let cache = tg_sync_engine::cache::CacheStore::open(data_dir.join("cache.db")).await?;
    let status = StatusService::new(cache.pool.clone());
    status.read().await
}

async fn run_stop() -> i32 {
    let data_dir = Config::data_dir();
    let pid_path = data_dir.join("daemon.pid");

    let pid = match std::fs::read_to_string(&pid_path) {
        Ok(content) => match content.trim().parse::<i32>() {
            Ok(pid) => pid,
            Err(_) => {
                warn!(path = %pid_path.display(), "pid file is malformed");
                return EngineError::DaemonNotRunning.daemon_exit_code();
            }
        },
        Err(_) => {
            warn!(path = %pid_path.display(), "no pid file, daemon is not running");
            return EngineError::DaemonNotRunning.daemon_exit_code();
        }
    };

    info!(pid, "sending SIGTERM to daemon");
    #[cfg(unix)]
    {
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            error!(pid, "failed to signal daemon process");
            return 1;
        }
    }

    for _ in 0..100 {
        if !pid_path.exists() {
            info!("daemon stopped");
            return 0;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    warn!("daemon did not stop within the timeout");
    1
}
