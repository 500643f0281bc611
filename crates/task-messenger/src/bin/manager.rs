//! Manager binary: accepts worker connections and dispatches queued tasks.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 bind failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use task_messenger::config::{FileConfig, ManagerArgs, resolve_manager};
use task_messenger::logging::init_logging;
use task_messenger::sink::LogSink;
use task_messenger::skills::skill_ids;
use task_messenger_core::Reactor;
use task_messenger_net::{
    OsSocketFactory, ProtocolLimits, ServerConfig, SessionManager, TaskMessage, TaskPool,
    TransportServer,
};
use tracing::{error, info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(10);

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = ManagerArgs::parse();
    let file = match FileConfig::load(args.config.as_deref()) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    let config = match resolve_manager(file, &args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return 1;
        }
    };
    init_logging(config.log_level);
    info!(
        addr = %format!("{}:{}", config.listen_host, config.listen_port),
        io_threads = config.io_threads,
        "manager starting"
    );
    if let Some(path) = &config.identity_path {
        info!(path = %path.display(), "overlay identity directory configured");
    }

    let reactor = Reactor::new();
    let pool = Arc::new(TaskPool::new());
    let sink = Arc::new(LogSink::new());
    // The session manager takes its work guard before the reactor starts,
    // so worker threads cannot retire before any session exists.
    let sessions = SessionManager::new(
        reactor.clone(),
        Arc::clone(&pool),
        sink.clone(),
        ProtocolLimits {
            max_body_size: config.max_body_size,
        },
    );
    if let Err(err) = reactor.start(config.io_threads) {
        error!(error = %err, "failed to start reactor");
        return 1;
    }
    let server = TransportServer::new(
        ServerConfig::new(config.listen_host.clone(), config.listen_port),
        Arc::new(OsSocketFactory::new()),
        Arc::clone(&sessions),
    );
    if let Err(err) = server.start() {
        error!(error = %err, "failed to bind listener");
        reactor.stop();
        return 2;
    }

    if config.demo_tasks > 0 {
        enqueue_demo_tasks(&sessions, config.demo_tasks);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(err) = ctrlc::set_handler(move || {
            info!("received ctrl-c, shutting down");
            running.store(false, Ordering::SeqCst);
        }) {
            warn!(error = %err, "could not install ctrl-c handler");
        }
    }

    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let stats = sessions.stats();
            info!(
                sessions = stats.live_sessions,
                tasks = stats.tasks_completed,
                pool_depth = stats.pool_depth,
                delivered = sink.delivered(),
                "status"
            );
        }
    }

    server.stop();
    reactor.stop();
    info!("manager exiting");
    0
}

fn enqueue_demo_tasks(sessions: &SessionManager, count: u32) {
    let mut tasks = Vec::with_capacity(count as usize);
    for i in 1..=count {
        match TaskMessage::new(i, skill_ids::REVERSE, format!("demo-{i}")) {
            Ok(task) => tasks.push(task),
            Err(err) => {
                warn!(task_id = i, error = %err, "skipping demo task");
            }
        }
    }
    match sessions.enqueue_tasks(tasks) {
        Ok(()) => info!(count, "demo tasks enqueued"),
        Err(err) => warn!(error = %err, "could not enqueue demo tasks"),
    }
}
