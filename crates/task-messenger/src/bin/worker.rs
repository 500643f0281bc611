//! Worker binary: connects to the manager and executes dispatched tasks.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 connect attempts
//! exhausted.

use std::sync::Arc;
use std::thread;

use clap::Parser;
use task_messenger::config::{FileConfig, WorkerArgs, WorkerMode, resolve_worker};
use task_messenger::logging::init_logging;
use task_messenger::skills::SkillRegistry;
use task_messenger_core::Reactor;
use task_messenger_net::{
    OsSocketFactory, TransportError, WorkerOptions, WorkerOutcome, WorkerRuntime, WorkerState,
};
use tracing::{error, info, warn};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = WorkerArgs::parse();
    let file = match FileConfig::load(args.config.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    let config = match resolve_worker(file, &args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    init_logging(config.log_level);
    info!(
        manager = %format!("{}:{}", config.manager_host, config.manager_port),
        mode = %config.mode,
        "worker starting"
    );
    if let Some(path) = &config.identity_path {
        info!(path = %path.display(), "overlay identity directory configured");
    }

    let reactor = Reactor::new();
    let _work_guard = if config.mode == WorkerMode::Async {
        let guard = reactor.make_work_guard();
        if let Err(err) = reactor.start(1) {
            error!(error = %err, "failed to start reactor");
            return 1;
        }
        Some(guard)
    } else {
        None
    };

    let runtime = Arc::new(WorkerRuntime::new(
        reactor.clone(),
        Arc::new(OsSocketFactory::new()),
        Arc::new(SkillRegistry::with_builtin_skills()),
        WorkerOptions::new(config.manager_host.clone(), config.manager_port),
    ));
    {
        let runtime = Arc::clone(&runtime);
        if let Err(err) = ctrlc::set_handler(move || {
            info!("received ctrl-c, shutting down");
            runtime.shutdown();
        }) {
            warn!(error = %err, "could not install ctrl-c handler");
        }
    }

    let mut consecutive_failures = 0u32;
    let exit_code = loop {
        if runtime.state() == WorkerState::Stopped {
            break 0;
        }
        let result = match config.mode {
            WorkerMode::Blocking => {
                if runtime.is_connected() {
                    runtime.run_blocking()
                } else {
                    runtime.connect().and_then(|_| runtime.run_blocking())
                }
            }
            WorkerMode::Async => {
                let runtime = Arc::clone(&runtime);
                reactor
                    .spawn(async move {
                        if !runtime.is_connected() {
                            runtime.connect_async().await?;
                        }
                        runtime.run_async().await
                    })
                    .wait()
            }
        };
        match result {
            Ok(WorkerOutcome::Paused) => {
                info!("worker paused; resuming");
            }
            Ok(WorkerOutcome::Finished) => {
                if runtime.state() == WorkerState::Stopped {
                    break 0;
                }
                info!("manager closed the connection; reconnecting");
                consecutive_failures = 0;
                thread::sleep(config.connect_backoff);
            }
            Err(TransportError::Connect(err)) => {
                consecutive_failures += 1;
                if consecutive_failures >= config.connect_attempts {
                    error!(
                        error = %err,
                        attempts = consecutive_failures,
                        "could not reach manager; giving up"
                    );
                    break 2;
                }
                warn!(error = %err, attempt = consecutive_failures, "connect failed; retrying");
                thread::sleep(config.connect_backoff);
            }
            Err(TransportError::ConnectionClosed) => {
                if runtime.state() == WorkerState::Stopped {
                    break 0;
                }
                consecutive_failures = 0;
                thread::sleep(config.connect_backoff);
            }
            Err(err) => {
                warn!(error = %err, "task loop failed; reconnecting");
                consecutive_failures = 0;
                thread::sleep(config.connect_backoff);
            }
        }
    };

    if config.mode == WorkerMode::Async {
        reactor.stop();
    }
    info!(tasks = runtime.tasks_completed(), "worker exiting");
    exit_code
}
