//! End-to-end tests for the manager/worker dispatch fabric over loopback.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use task_messenger_core::Reactor;
use task_messenger_net::{
    OsSocketFactory, ProtocolLimits, ServerConfig, SessionManager, SkillDispatcher, TaskMessage,
    TaskPool, TransportServer, WorkerOptions, WorkerRuntime,
};

const SKILL_REVERSE: u32 = 1;
const SKILL_ECHO: u32 = 2;

fn dispatcher() -> Arc<dyn SkillDispatcher> {
    Arc::new(|_task_id: u32, skill_id: u32, payload: Bytes| match skill_id {
        SKILL_REVERSE => {
            let mut bytes = payload.to_vec();
            bytes.reverse();
            Bytes::from(bytes)
        }
        SKILL_ECHO => payload,
        _ => Bytes::new(),
    })
}

type Responses = Arc<Mutex<Vec<(u32, Bytes)>>>;

fn collecting_sink() -> (Responses, Arc<dyn task_messenger_net::ResponseSink>) {
    let responses: Responses = Arc::new(Mutex::new(Vec::new()));
    let sink_responses = Arc::clone(&responses);
    let sink = Arc::new(move |task_id: u32, payload: Bytes| {
        sink_responses.lock().push((task_id, payload));
    });
    (responses, sink)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

struct Manager {
    reactor: Reactor,
    server: TransportServer,
    sessions: Arc<SessionManager>,
    responses: Responses,
    port: u16,
}

fn start_manager(config: ServerConfig) -> Manager {
    let reactor = Reactor::new();
    let pool = Arc::new(TaskPool::new());
    let (responses, sink) = collecting_sink();
    // The session manager's work guard must exist before the reactor
    // starts, or idle worker threads retire immediately.
    let sessions = SessionManager::new(
        reactor.clone(),
        pool,
        sink,
        ProtocolLimits::default(),
    );
    reactor.start(1).unwrap();
    let server = TransportServer::new(
        config,
        Arc::new(OsSocketFactory::new()),
        Arc::clone(&sessions),
    );
    server.start().unwrap();
    let port = server.local_addr().unwrap().port();
    Manager {
        reactor,
        server,
        sessions,
        responses,
        port,
    }
}

fn spawn_blocking_worker(port: u16) -> (Arc<WorkerRuntime>, thread::JoinHandle<()>) {
    let reactor = Reactor::new();
    let runtime = Arc::new(WorkerRuntime::new(
        reactor,
        Arc::new(OsSocketFactory::new()),
        dispatcher(),
        WorkerOptions::new("127.0.0.1", port).connect_timeout(Duration::from_secs(5)),
    ));
    let handle = {
        let runtime = Arc::clone(&runtime);
        thread::spawn(move || {
            runtime.connect().unwrap();
            let _ = runtime.run_blocking();
        })
    };
    (runtime, handle)
}

fn task(task_id: u32, skill_id: u32, payload: &str) -> TaskMessage {
    TaskMessage::new(task_id, skill_id, payload.as_bytes().to_vec()).unwrap()
}

#[test]
fn single_task_round_trip() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));
    let (runtime, worker) = spawn_blocking_worker(manager.port);

    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.session_count() == 1
    }));

    manager
        .sessions
        .enqueue_tasks(vec![task(1, SKILL_REVERSE, "hello")])
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        !manager.responses.lock().is_empty()
    }));
    {
        let responses = manager.responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, 1);
        assert_eq!(responses[0].1.as_ref(), b"olleh");
    }

    let stats = manager.sessions.stats();
    assert_eq!(stats.tasks_completed, 1);
    assert!(stats.bytes_out >= 12 + 5);
    assert!(stats.bytes_in >= 12 + 5);

    runtime.shutdown();
    worker.join().unwrap();
    manager.server.stop();
    manager.reactor.stop();
}

#[test]
fn queued_tasks_drain_in_order_when_worker_arrives() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));

    // Enqueue before any worker exists.
    let tasks: Vec<_> = (1..=100)
        .map(|i| task(i, SKILL_ECHO, &i.to_string()))
        .collect();
    manager.sessions.enqueue_tasks(tasks).unwrap();
    assert_eq!(manager.sessions.pool().len(), 100);

    let (runtime, worker) = spawn_blocking_worker(manager.port);

    assert!(wait_until(Duration::from_secs(15), || {
        manager.responses.lock().len() == 100
    }));
    {
        let responses = manager.responses.lock();
        let ids: Vec<u32> = responses.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, (1..=100).collect::<Vec<u32>>());
        for (id, payload) in responses.iter() {
            assert_eq!(payload.as_ref(), id.to_string().as_bytes());
        }
    }

    let stats = manager.sessions.stats();
    assert!(stats.bytes_out >= 100 * 13);
    assert_eq!(stats.tasks_completed, 100);

    runtime.shutdown();
    worker.join().unwrap();
    manager.server.stop();
    manager.reactor.stop();
}

#[test]
fn concurrent_producers_and_workers_lose_nothing() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));

    let mut workers = Vec::new();
    for _ in 0..2 {
        workers.push(spawn_blocking_worker(manager.port));
    }
    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.session_count() == 2
    }));

    const PER_PRODUCER: u32 = 200;
    let mut producers = Vec::new();
    for producer in 0..3u32 {
        let sessions = Arc::clone(&manager.sessions);
        producers.push(thread::spawn(move || {
            let base = producer * PER_PRODUCER;
            for i in 1..=PER_PRODUCER {
                let id = base + i;
                sessions
                    .enqueue_tasks(vec![task(id, SKILL_ECHO, &id.to_string())])
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    let total = 3 * PER_PRODUCER as usize;
    assert!(wait_until(Duration::from_secs(30), || {
        manager.responses.lock().len() == total
    }));
    {
        let responses = manager.responses.lock();
        let mut ids: Vec<u32> = responses.iter().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), total, "duplicate or missing task ids");
    }

    for (runtime, handle) in workers {
        runtime.shutdown();
        handle.join().unwrap();
    }
    manager.server.stop();
    manager.reactor.stop();
}

#[test]
fn dead_worker_session_is_reaped_by_maintenance() {
    let config = ServerConfig::new("127.0.0.1", 0)
        .accept_timeout(Duration::from_millis(100))
        .maintenance_interval(Duration::from_millis(300));
    let manager = start_manager(config);

    // A fake worker that reads one full request and then vanishes.
    let port = manager.port;
    let fake_worker = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut request = [0u8; 12 + 5];
        stream.read_exact(&mut request).unwrap();
        // Dropping the stream kills the TCP connection before any
        // response is written.
    });

    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.session_count() == 1
    }));
    manager
        .sessions
        .enqueue_tasks(vec![task(9, SKILL_ECHO, "hello")])
        .unwrap();
    fake_worker.join().unwrap();

    // The session observes the closed connection and the maintenance pass
    // removes it well within the 2 s bound.
    assert!(wait_until(Duration::from_secs(2), || {
        manager.sessions.session_count() == 0
    }));
    assert!(manager.responses.lock().is_empty());

    manager.server.stop();
    manager.reactor.stop();
}

#[test]
fn stop_returns_within_a_second_and_is_idempotent() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));
    assert!(manager.server.is_listening());

    let started = Instant::now();
    manager.server.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!manager.server.is_listening());
    assert!(manager.server.local_addr().is_none());

    // Second stop is a no-op.
    manager.server.stop();
    manager.reactor.stop();
}

#[test]
fn server_stop_releases_idle_sessions() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));

    let mut workers = Vec::new();
    for _ in 0..3 {
        workers.push(spawn_blocking_worker(manager.port));
    }
    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.session_count() == 3
    }));
    // No tasks: every session is suspended on the pool.
    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.pool().waiting_count() == 3
    }));

    manager.server.stop();

    // Pool shutdown resumed each session with the sentinel; all exit.
    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.stats().live_sessions == 0
    }));

    for (runtime, handle) in workers {
        runtime.shutdown();
        handle.join().unwrap();
    }
    manager.reactor.stop();
}

#[test]
fn async_worker_round_trip() {
    let manager = start_manager(ServerConfig::new("127.0.0.1", 0));

    let worker_reactor = Reactor::new();
    let worker_guard = worker_reactor.make_work_guard();
    worker_reactor.start(1).unwrap();

    let runtime = Arc::new(WorkerRuntime::new(
        worker_reactor.clone(),
        Arc::new(OsSocketFactory::new()),
        dispatcher(),
        WorkerOptions::new("127.0.0.1", manager.port),
    ));
    let handle = {
        let runtime = Arc::clone(&runtime);
        worker_reactor.spawn(async move {
            runtime.connect_async().await?;
            runtime.run_async().await
        })
    };

    assert!(wait_until(Duration::from_secs(10), || {
        manager.sessions.session_count() == 1
    }));
    manager
        .sessions
        .enqueue_tasks(vec![task(4, SKILL_REVERSE, "stream")])
        .unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        !manager.responses.lock().is_empty()
    }));
    {
        let responses = manager.responses.lock();
        assert_eq!(responses[0].0, 4);
        assert_eq!(responses[0].1.as_ref(), b"maerts");
    }

    runtime.shutdown();
    let outcome = handle.wait();
    assert!(outcome.is_ok());

    drop(worker_guard);
    worker_reactor.stop();
    manager.server.stop();
    manager.reactor.stop();
}
