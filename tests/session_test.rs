// End-to-end tests for Session against a mock Klipper daemon.
//
// The mock daemon is a UnixListener in a temp dir. Each accepted socket is
// driven by the test (or a helper thread) using the crate's own codec, so
// these tests exercise the real framing in both directions.
//
// Every blocking wait in here is bounded so a regression fails instead of
// hanging the test run.

use std::collections::HashSet;
use std::io::Write;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use klippy_rpc::codec::FrameStream;
use klippy_rpc::frame::encode_frame;
use klippy_rpc::{ReaderState, Request, RpcError, Session};
use serde_json::{json, Value};

/// Mock daemon endpoint.
struct MockDaemon {
    _tmp: tempfile::TempDir,
    path: PathBuf,
    listener: UnixListener,
}

impl MockDaemon {
    fn start() -> Self {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("klippy.sock");
        let listener = UnixListener::bind(&path).unwrap();
        Self {
            _tmp: tmp,
            path,
            listener,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn accept(&self) -> PeerConn {
        let (stream, _) = self.listener.accept().unwrap();
        PeerConn::new(stream)
    }
}

/// Daemon side of one client connection.
struct PeerConn {
    writer: UnixStream,
    frames: FrameStream<UnixStream>,
}

impl PeerConn {
    fn new(stream: UnixStream) -> Self {
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            frames: FrameStream::new(stream),
        }
    }

    /// Next request from the client.
    fn recv(&mut self) -> Value {
        self.frames
            .next()
            .expect("client closed the connection")
            .expect("client sent an undecodable frame")
            .into_value()
    }

    fn send(&mut self, value: &Value) {
        self.writer.write_all(&encode_frame(value).unwrap()).unwrap();
    }

    /// Answer every request with `{"id": .., "result": params}` until EOF.
    fn echo_forever(mut self) -> thread::JoinHandle<usize> {
        self.writer.set_read_timeout(None).unwrap();
        thread::spawn(move || {
            let mut answered = 0;
            while let Some(Ok(frame)) = self.frames.next() {
                let request = frame.into_value();
                if request["method"] == "register_remote_method" {
                    continue;
                }
                let reply = json!({"id": request["id"], "result": request["params"]});
                if self.writer.write_all(&encode_frame(&reply).unwrap()).is_err() {
                    break;
                }
                answered += 1;
            }
            answered
        })
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// Run `f` on a helper thread and fail if it does not finish in time.
fn bounded<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(5)).expect("operation blocked for more than 5 s")
}

// ============================================================================
// Queries
// ============================================================================

#[test]
fn test_query_returns_matching_response() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let peer = thread::spawn(move || {
        let request = primary.recv();
        assert_eq!(request["method"], "info");
        assert_eq!(request["params"], json!({}));
        primary.send(&json!({"id": request["id"], "result": "ok"}));
        primary
    });

    let response = session.query(Request::new("info", json!({}))).unwrap();
    assert_eq!(response.result(), Some(&json!("ok")));
    assert_eq!(response.id(), Some("KRPC_0x1".into()));
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.socket_path(), daemon.path());
    drop(peer.join().unwrap());
}

#[test]
fn test_out_of_order_responses_reach_their_own_handles() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let first = session.query_async(Request::new("objects/query", json!({"n": 1}))).unwrap();
    let second = session.query_async(Request::new("objects/query", json!({"n": 2}))).unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(session.pending_count(), 2);

    let a = primary.recv();
    let b = primary.recv();
    primary.send(&json!({"id": b["id"], "result": {"n": 2}}));
    primary.send(&json!({"id": a["id"], "result": {"n": 1}}));

    let first_id = first.id().clone();
    let first = first.wait().unwrap();
    let second = second.wait().unwrap();
    assert_eq!(first.id(), Some(first_id));
    assert_eq!(first.result(), Some(&json!({"n": 1})));
    assert_eq!(second.result(), Some(&json!({"n": 2})));
}

#[test]
fn test_concurrent_queries_get_distinct_ids_and_own_responses() {
    let daemon = MockDaemon::start();
    let session = Arc::new(Session::connect(daemon.path()).unwrap());
    let peer = daemon.accept().echo_forever();

    let ids = Arc::new(Mutex::new(HashSet::new()));
    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let session = Arc::clone(&session);
            let ids = Arc::clone(&ids);
            thread::spawn(move || {
                for n in 0..25 {
                    let params = json!({"worker": worker, "n": n});
                    let handle = session.query_async(Request::new("echo", params.clone())).unwrap();
                    let id = handle.id().clone();
                    let response = handle.wait().unwrap();
                    assert_eq!(response.id(), Some(id.clone()));
                    assert_eq!(response.result(), Some(&params));
                    assert!(ids.lock().unwrap().insert(id), "duplicate id generated");
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(ids.lock().unwrap().len(), 200);

    session.shutdown();
    assert_eq!(peer.join().unwrap(), 200);
}

#[test]
fn test_caller_supplied_ids_are_kept() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _peer = daemon.accept().echo_forever();

    let response = session.query(Request::method("info").with_id(99)).unwrap();
    assert_eq!(response.id(), Some(99.into()));
}

#[test]
fn test_duplicate_pending_id_rejected() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept();

    let _first = session.query_async(Request::method("info").with_id("same")).unwrap();
    let second = session.query_async(Request::method("info").with_id("same"));
    assert!(matches!(second, Err(RpcError::DuplicateId(_))));
}

#[test]
fn test_generated_id_skips_caller_id_in_use() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept();

    let taken = session.query_async(Request::method("info").with_id("KRPC_0x1")).unwrap();
    let generated = session.query_async(Request::method("info")).unwrap();
    assert_eq!(generated.id().to_string(), "KRPC_0x2");
    assert_ne!(taken.id(), generated.id());
    assert_eq!(session.pending_count(), 2);
}

#[test]
fn test_application_error_is_data() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let peer = thread::spawn(move || {
        let request = primary.recv();
        primary.send(&json!({"id": request["id"], "error": {"error": "WebRequestError", "message": "Invalid path"}}));
        primary
    });

    let response = session.query(Request::method("nope")).unwrap();
    assert!(response.is_error());
    assert_eq!(response.error_message().as_deref(), Some("Invalid path"));
    assert!(matches!(response.into_result(), Err(RpcError::Remote { .. })));
    drop(peer.join().unwrap());
}

// ============================================================================
// Remote methods
// ============================================================================

#[test]
fn test_push_invokes_registered_callback_once() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let calls = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let calls = Arc::clone(&calls);
        let received = Arc::clone(&received);
        session
            .register_remote_method("noop", None, move |params| {
                calls.fetch_add(1, Ordering::SeqCst);
                received.lock().unwrap().push(params);
            })
            .unwrap();
    }

    let registration = primary.recv();
    assert_eq!(registration["method"], "register_remote_method");
    assert_eq!(
        registration["params"],
        json!({"response_template": {"remote_method": "noop"}, "remote_method": "noop"})
    );

    primary.send(&json!({"remote_method": "noop", "params": {"x": 1}}));
    primary.send(&json!({"remote_method": "other", "params": {"x": 2}}));

    // Frames are routed in order, so once this query returns both pushes
    // have been handled.
    let peer = thread::spawn(move || {
        let request = primary.recv();
        primary.send(&json!({"id": request["id"], "result": {}}));
        primary
    });
    session.query(Request::method("sync")).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*received.lock().unwrap(), vec![json!({"x": 1})]);
    drop(peer.join().unwrap());
}

#[test]
fn test_push_with_id_reaches_query_and_callback() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    session
        .register_remote_method("both", Some(json!({"params": {}})), move |params| {
            tx.lock().unwrap().send(params).unwrap();
        })
        .unwrap();
    let registration = primary.recv();
    assert_eq!(registration["params"]["response_template"]["params"], json!({}));

    let handle = session.query_async(Request::method("info")).unwrap();
    let request = primary.recv();
    primary.send(&json!({"id": request["id"], "remote_method": "both", "params": "p"}));

    assert_eq!(handle.wait().unwrap().params(), Some(&json!("p")));
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), json!("p"));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[test]
fn test_subscription_streams_until_cancelled() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept().echo_forever();

    let mut subscription = session
        .subscribe(Request::new("adxl345/dump_adxl345", json!({"sensor": "adxl345"})))
        .unwrap();
    let mut stream = daemon.accept();

    let request = stream.recv();
    assert_eq!(request["method"], "adxl345/dump_adxl345");
    assert_eq!(request["params"]["sensor"], "adxl345");
    assert_eq!(request["id"], json!(subscription.id().to_string()));

    // Exactly one request on the subscription socket.
    stream.writer.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    assert!(matches!(stream.frames.next(), Some(Err(RpcError::Io(_)))));

    for n in 0..3 {
        stream.send(&json!({"params": {"data": [[n, 0.5]]}}));
    }
    let canceller = subscription.canceller();
    let mut seen = Vec::new();
    for item in subscription.by_ref() {
        seen.push(item.unwrap());
        if seen.len() == 3 {
            canceller.cancel();
        }
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].params().unwrap()["data"], json!([[2, 0.5]]));

    // Anything sent after cancel is never yielded.
    let _ = stream.writer.write_all(&encode_frame(&json!({"params": {}})).unwrap());
    assert!(subscription.next().is_none());

    // Primary connection untouched.
    assert_eq!(session.reader_state(), ReaderState::Running);
    let response = session.query(Request::new("info", json!({"still": "alive"}))).unwrap();
    assert_eq!(response.result(), Some(&json!({"still": "alive"})));
}

#[test]
fn test_cancelling_one_subscription_leaves_others_running() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept();

    let first = session.subscribe(Request::method("stream/a")).unwrap();
    let mut first_peer = daemon.accept();
    let mut second = session.subscribe(Request::method("stream/b")).unwrap();
    let mut second_peer = daemon.accept();
    assert_ne!(first.id(), second.id());
    assert_eq!(first_peer.recv()["method"], "stream/a");
    assert_eq!(second_peer.recv()["method"], "stream/b");

    first.cancel();
    let first_count = bounded(move || first.count());
    assert_eq!(first_count, 0);

    second_peer.send(&json!({"params": {"still": "streaming"}}));
    let frame = second.next().unwrap().unwrap();
    assert_eq!(frame.params(), Some(&json!({"still": "streaming"})));
    assert!(!second.is_cancelled());
}

#[test]
fn test_subscription_ends_when_daemon_closes() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept();

    let subscription = session.subscribe(Request::method("stream")).unwrap();
    let mut peer = daemon.accept();
    peer.recv();
    peer.send(&json!({"params": 1}));
    peer.send(&json!({"params": 2}));
    drop(peer);

    let frames: Vec<_> = bounded(move || subscription.collect::<Result<Vec<_>, _>>().unwrap());
    assert_eq!(frames.len(), 2);
}

#[test]
fn test_subscribe_to_missing_socket_fails() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let _primary = daemon.accept();
    drop(daemon);

    match session.subscribe(Request::method("stream")) {
        Err(e) => assert!(e.is_connection_error(), "got: {e}"),
        Ok(_) => panic!("subscribe should fail once the socket is gone"),
    }
}

// ============================================================================
// Shutdown and failure policy
// ============================================================================

#[test]
fn test_connect_to_missing_socket_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    match Session::connect(tmp.path().join("missing.sock")) {
        Err(RpcError::Connect { .. }) => {}
        other => panic!("Expected Connect error, got: {other:?}"),
    }
}

#[test]
fn test_shutdown_stops_reader_and_fails_later_queries() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();
    session.register_remote_method("noop", None, |_| {}).unwrap();
    primary.recv();
    assert_eq!(session.remote_method_count(), 1);

    session.shutdown();
    assert_eq!(session.reader_state(), ReaderState::Stopped);
    assert!(!session.is_running());
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.remote_method_count(), 0);

    let session = Arc::new(session);
    let after = Arc::clone(&session);
    let result = bounded(move || after.query(Request::method("info")));
    assert!(matches!(result, Err(RpcError::Disconnected)));
    assert!(matches!(
        session.register_remote_method("noop", None, |_| {}),
        Err(RpcError::Disconnected)
    ));

    // Idempotent.
    session.shutdown();
}

#[test]
fn test_shutdown_not_held_up_by_stalled_write() {
    let daemon = MockDaemon::start();
    let session = Arc::new(Session::connect(daemon.path()).unwrap());
    // Never reads, so a large request blocks inside write.
    let _primary = daemon.accept();

    let writer = Arc::clone(&session);
    let stalled = thread::spawn(move || {
        let script = "G28\n".repeat(4 * 1024 * 1024);
        writer
            .query_async(Request::new("gcode/script", json!({"script": script})))
            .map(drop)
    });
    thread::sleep(Duration::from_millis(300));

    let closer = Arc::clone(&session);
    bounded(move || closer.shutdown());
    assert_eq!(session.reader_state(), ReaderState::Stopped);

    let result = bounded(move || stalled.join().unwrap());
    assert!(result.is_err_and(|e| e.is_connection_error()));
    assert_eq!(session.pending_count(), 0);
}

#[test]
fn test_shutdown_fails_outstanding_handles() {
    let daemon = MockDaemon::start();
    let session = Arc::new(Session::connect(daemon.path()).unwrap());
    let _primary = daemon.accept();

    let handle = session.query_async(Request::method("info")).unwrap();
    let waiter = thread::spawn(move || handle.wait());
    thread::sleep(Duration::from_millis(50));

    session.shutdown();
    let result = bounded(move || waiter.join().unwrap());
    assert!(matches!(result, Err(RpcError::Disconnected)));
}

#[test]
fn test_daemon_disconnect_fails_pending_and_future_queries() {
    let daemon = MockDaemon::start();
    let session = Arc::new(Session::connect(daemon.path()).unwrap());
    let mut primary = daemon.accept();

    let handle = session.query_async(Request::method("info")).unwrap();
    primary.recv();
    drop(primary);

    let result = bounded(move || handle.wait());
    assert!(result.as_ref().is_err_and(RpcError::is_connection_error), "got: {result:?}");

    wait_until("reader to stop", || session.reader_state() == ReaderState::Stopped);
    assert!(!session.is_running());
    let after = Arc::clone(&session);
    let result = bounded(move || after.query(Request::method("info")));
    assert!(matches!(result, Err(RpcError::Disconnected)));
}

#[test]
fn test_protocol_error_stops_reader() {
    let daemon = MockDaemon::start();
    let session = Session::connect(daemon.path()).unwrap();
    let mut primary = daemon.accept();

    let handle = session.query_async(Request::method("info")).unwrap();
    primary.recv();
    primary.writer.write_all(b"{this is not json\x03").unwrap();

    let result = bounded(move || handle.wait());
    assert!(matches!(result, Err(RpcError::Disconnected)));
    wait_until("reader to stop", || session.reader_state() == ReaderState::Stopped);
}

#[test]
fn test_callback_can_shut_session_down() {
    let daemon = MockDaemon::start();
    let session = Arc::new(Session::connect(daemon.path()).unwrap());
    let mut primary = daemon.accept();

    let inner = Arc::downgrade(&session);
    session
        .register_remote_method("stop", None, move |_| {
            if let Some(session) = inner.upgrade() {
                session.shutdown();
            }
        })
        .unwrap();
    primary.recv();
    primary.send(&json!({"remote_method": "stop"}));

    wait_until("reader to stop", || session.reader_state() == ReaderState::Stopped);
    assert!(!session.is_running());
}
