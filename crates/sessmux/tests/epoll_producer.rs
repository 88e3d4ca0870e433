//! End-to-end scenarios for the readiness-API producer over real loopback
//! TCP sockets: one polling thread, edge-triggered one-shot registrations,
//! explicit re-arm, and at most one terminal notification per session.

#![cfg(unix)]

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use sessmux::{
    new_session_event_producer, ClosedEvent, ClosedEventHandler, Message,
    MessageProcessingAfterDisconnect, MessageReceptionAfterDisconnect, ProducerConfig, ReadEvent,
    ReadEventHandler, Session, SessionConnectionState, SessionEventProducer, SessionInfo,
    SessionOperationState, SocketId, TaskExecutionMode,
};

const EVENT_DEADLINE: Duration = Duration::from_secs(1);
const SILENCE_WINDOW: Duration = Duration::from_millis(300);

// ── Test collaborators ───────────────────────────────────────────────

struct TestSession {
    id: Uuid,
    stream: TcpStream,
    refcount: AtomicU64,
}

impl TestSession {
    fn new(stream: TcpStream) -> Arc<Self> {
        stream.set_nonblocking(true).unwrap();
        Arc::new(Self {
            id: Uuid::new_v4(),
            stream,
            refcount: AtomicU64::new(0),
        })
    }

    /// Consume whatever the peer has written so far.
    fn drain(&self) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];

        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }

        collected
    }
}

impl Session for TestSession {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> String {
        "test-session".into()
    }

    fn user_name(&self) -> String {
        "tester".into()
    }

    fn socket(&self) -> SocketId {
        self.stream.as_raw_fd()
    }

    fn message_reception_mode(&self) -> TaskExecutionMode {
        TaskExecutionMode::Sequential
    }

    fn message_reception_state(&self) -> SessionOperationState {
        SessionOperationState::Ready
    }

    fn message_processing_state(&self) -> SessionOperationState {
        SessionOperationState::Ready
    }

    fn receive_incoming_message(&self) -> Option<(Message, TaskExecutionMode)> {
        let bytes = self.drain();
        if bytes.is_empty() {
            None
        } else {
            Some((Message::new(bytes), TaskExecutionMode::Sequential))
        }
    }

    fn handle_rx_message(&self, _message: Message) {}

    fn disconnect(&self, _socket_was_closed: bool) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn increment_refcount(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_refcount(&self) {
        self.refcount.fetch_sub(1, Ordering::AcqRel);
    }

    fn current_refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }
}

struct RecordingReadHandler {
    id: Uuid,
    batches: Sender<Vec<Uuid>>,
}

impl RecordingReadHandler {
    fn new() -> (Arc<dyn ReadEventHandler>, Receiver<Vec<Uuid>>) {
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn ReadEventHandler> = Arc::new(Self {
            id: Uuid::new_v4(),
            batches: tx,
        });
        (handler, rx)
    }
}

impl ReadEventHandler for RecordingReadHandler {
    fn handler_id(&self) -> Uuid {
        self.id
    }

    fn handle_event(&self, event: &ReadEvent) {
        let ids = event.sessions().iter().map(|s| s.id()).collect();
        let _ = self.batches.send(ids);
    }
}

struct RecordingClosedHandler {
    id: Uuid,
    batches: Sender<Vec<Uuid>>,
}

impl RecordingClosedHandler {
    fn new() -> (Arc<dyn ClosedEventHandler>, Receiver<Vec<Uuid>>) {
        let (tx, rx) = mpsc::channel();
        let handler: Arc<dyn ClosedEventHandler> = Arc::new(Self {
            id: Uuid::new_v4(),
            batches: tx,
        });
        (handler, rx)
    }
}

impl ClosedEventHandler for RecordingClosedHandler {
    fn handler_id(&self) -> Uuid {
        self.id
    }

    fn handle_event(&self, event: &ClosedEvent) {
        let ids = event.sessions().iter().map(|s| s.id()).collect();
        let _ = self.batches.send(ids);
    }
}

// ── Harness ──────────────────────────────────────────────────────────

/// A connected loopback pair: the server side goes into the producer, the
/// client side plays the remote peer.
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();

    (server, peer)
}

fn session_info(session: &Arc<TestSession>) -> Arc<SessionInfo> {
    SessionInfo::new(
        "test-session",
        Arc::clone(session) as Arc<dyn Session>,
        SessionConnectionState::Connected,
        MessageReceptionAfterDisconnect::NotSupported,
        MessageProcessingAfterDisconnect::NotSupported,
    )
}

struct Harness {
    producer: Arc<dyn SessionEventProducer>,
    /// Held so the weak subscriptions stay live for the whole test.
    _read_handler: Arc<dyn ReadEventHandler>,
    read_batches: Receiver<Vec<Uuid>>,
    _closed_handler: Arc<dyn ClosedEventHandler>,
    closed_batches: Receiver<Vec<Uuid>>,
}

impl Harness {
    fn start() -> Self {
        let producer = new_session_event_producer("test", ProducerConfig::default());
        assert!(producer.start().unwrap());

        let (read_handler, read_batches) = RecordingReadHandler::new();
        let (closed_handler, closed_batches) = RecordingClosedHandler::new();

        assert!(producer.subscribe_to_read_events(Arc::downgrade(&read_handler)));
        assert!(producer.subscribe_to_closed_events(Arc::downgrade(&closed_handler)));

        Self {
            producer,
            _read_handler: read_handler,
            read_batches,
            _closed_handler: closed_handler,
            closed_batches,
        }
    }

    fn register(&self, info: &Arc<SessionInfo>) {
        self.producer
            .update_sessions(vec![Arc::clone(info)], Vec::new())
            .unwrap();
    }

    fn expect_read_batch(&self) -> Vec<Uuid> {
        self.read_batches
            .recv_timeout(EVENT_DEADLINE)
            .expect("expected a read batch")
    }

    fn expect_closed_batch(&self) -> Vec<Uuid> {
        self.closed_batches
            .recv_timeout(EVENT_DEADLINE)
            .expect("expected a closed batch")
    }

    fn expect_read_silence(&self) {
        assert!(
            self.read_batches.recv_timeout(SILENCE_WINDOW).is_err(),
            "unexpected read batch"
        );
    }

    fn expect_closed_silence(&self) {
        assert!(
            self.closed_batches.recv_timeout(SILENCE_WINDOW).is_err(),
            "unexpected closed batch"
        );
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.producer.stop();
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

/// One session, one readable: a write produces exactly one read batch;
/// after draining and re-arming, a second write produces a second batch.
#[test]
fn one_session_one_readable_then_rearm() {
    let harness = Harness::start();

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    peer.write_all(b"ping").unwrap();

    assert_eq!(harness.expect_read_batch(), vec![session.id]);
    harness.expect_closed_silence();

    // Consume the bytes before re-arming, the way the framing layer would.
    assert_eq!(session.drain(), b"ping");
    harness.producer.rearm_session(&info);

    peer.write_all(b"pong").unwrap();

    assert_eq!(harness.expect_read_batch(), vec![session.id]);
    assert_eq!(session.drain(), b"pong");
}

/// Re-arm guard: without a re-arm the one-shot registration stays quiet,
/// however much the peer writes; the re-arm releases the pending data.
#[test]
fn no_second_readable_without_rearm() {
    let harness = Harness::start();

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    peer.write_all(b"first").unwrap();
    assert_eq!(harness.expect_read_batch(), vec![session.id]);

    peer.write_all(b"second").unwrap();
    harness.expect_read_silence();

    harness.producer.rearm_session(&info);

    assert_eq!(harness.expect_read_batch(), vec![session.id]);
}

/// Peer close: exactly one closed batch, the session ends Disconnected,
/// and nothing further is delivered for it.
#[test]
fn peer_close_delivers_one_terminal_event() {
    let harness = Harness::start();

    let (server, peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    drop(peer);

    assert_eq!(harness.expect_closed_batch(), vec![session.id]);
    assert_eq!(
        info.connection_state(),
        SessionConnectionState::Disconnected
    );

    harness.expect_closed_silence();
    harness.expect_read_silence();

    // Removal after the fact is the normal lifecycle and must succeed.
    harness
        .producer
        .update_sessions(Vec::new(), vec![Arc::clone(&info)])
        .unwrap();
}

/// A session that closes right after writing still gets its read batch
/// first (or a close at the latest); it never gets a read after the close.
#[test]
fn no_readable_after_closed() {
    let harness = Harness::start();

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    peer.write_all(b"bye").unwrap();
    peer.shutdown(Shutdown::Both).unwrap();
    drop(peer);

    let mut closed_seen = false;
    let deadline = Instant::now() + EVENT_DEADLINE;

    loop {
        if let Ok(batch) = harness.closed_batches.try_recv() {
            assert!(!closed_seen, "second closed batch for the session");
            assert_eq!(batch, vec![session.id]);
            closed_seen = true;
        }

        if let Ok(batch) = harness.read_batches.try_recv() {
            assert_eq!(batch, vec![session.id]);
            assert!(!closed_seen, "read batch delivered after the closed batch");
            // Consuming and re-arming must surface the close eventually.
            session.drain();
            harness.producer.rearm_session(&info);
        }

        if closed_seen {
            break;
        }

        assert!(Instant::now() < deadline, "no closed batch within deadline");
        thread::sleep(Duration::from_millis(10));
    }

    harness.expect_read_silence();
}

/// Stop drains handlers: with events flowing, `stop()` returns promptly,
/// the producer reports not-started, and no handler runs afterwards.
#[test]
fn stop_completes_promptly_under_load() {
    let harness = Harness::start();

    let (server, peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    let writer_done = Arc::new(AtomicBool::new(false));
    let writer = {
        let done = Arc::clone(&writer_done);
        let mut peer = peer.try_clone().unwrap();
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                if peer.write_all(b"x").is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    // Keep the event stream alive: drain and re-arm after each batch.
    let _ = harness.expect_read_batch();
    session.drain();
    harness.producer.rearm_session(&info);

    let stop_started = Instant::now();
    assert!(harness.producer.stop());
    let stop_elapsed = stop_started.elapsed();

    assert!(
        stop_elapsed < Duration::from_millis(500),
        "stop took {stop_elapsed:?}"
    );
    assert!(!harness.producer.started());

    // Any invocation in flight at the moment of stop has completed by the
    // time stop returned; afterwards the producer stays silent.
    while harness.read_batches.try_recv().is_ok() {}
    harness.expect_read_silence();

    writer_done.store(true, Ordering::Release);
    writer.join().unwrap();
}

/// Disconnect-supporting session: the closed batch arrives, and the
/// dispatcher is still allowed to finish the queued message afterwards.
#[test]
fn queued_message_outlives_disconnect() {
    let harness = Harness::start();

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = SessionInfo::new(
        "sync-client",
        Arc::clone(&session) as Arc<dyn Session>,
        SessionConnectionState::Connected,
        MessageReceptionAfterDisconnect::Supported,
        MessageProcessingAfterDisconnect::Supported,
    );
    harness.register(&info);

    // The peer writes one message and disconnects immediately.
    peer.write_all(b"fire-and-forget").unwrap();
    drop(peer);

    // The reader frames the message and queues it for dispatch.
    let (message, _mode) = session
        .receive_incoming_message()
        .expect("message should be readable");
    info.increment_messages_waiting();

    // Depending on timing the producer reports the data before the close;
    // play the framer's part and re-arm until the close surfaces.
    let deadline = Instant::now() + EVENT_DEADLINE;
    let closed = loop {
        if let Ok(batch) = harness.closed_batches.try_recv() {
            break batch;
        }
        if harness.read_batches.try_recv().is_ok() {
            session.drain();
            harness.producer.rearm_session(&info);
        }
        assert!(Instant::now() < deadline, "no closed batch within deadline");
        thread::sleep(Duration::from_millis(10));
    };

    assert_eq!(closed, vec![session.id]);
    assert_eq!(
        info.connection_state(),
        SessionConnectionState::Disconnected
    );

    // Processing after disconnect is sanctioned for this session, so the
    // dispatcher may deliver the queued message exactly once.
    assert_eq!(
        info.processing_after_disconnect(),
        MessageProcessingAfterDisconnect::Supported
    );
    session.handle_rx_message(message);
    assert_eq!(info.decrement_messages_waiting(), 0);
}

/// Handler subscribe/unsubscribe round-trip at the producer surface.
#[test]
fn subscription_round_trip() {
    let harness = Harness::start();

    let (handler, _batches) = RecordingReadHandler::new();
    let id = handler.handler_id();

    assert!(harness.producer.subscribe_to_read_events(Arc::downgrade(&handler)));
    assert!(!harness.producer.subscribe_to_read_events(Arc::downgrade(&handler)));
    assert!(harness.producer.unsubscribe_from_read_events(id));
    assert!(!harness.producer.unsubscribe_from_read_events(id));
}

/// A dropped subscriber neither panics the fan-out nor receives events.
#[test]
fn dropped_subscriber_is_ignored() {
    let harness = Harness::start();

    let extra_batches = {
        let (handler, batches) = RecordingReadHandler::new();
        assert!(harness.producer.subscribe_to_read_events(Arc::downgrade(&handler)));
        batches
        // `handler` dropped here; only the weak reference remains.
    };

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    peer.write_all(b"ping").unwrap();

    // The surviving subscriber sees the batch; the dropped one's channel
    // stays empty because its sender died with it.
    assert_eq!(harness.expect_read_batch(), vec![session.id]);
    assert!(extra_batches.try_recv().is_err());
}

/// Sessions registered and removed while events are in flight: batches
/// only ever contain registered sessions.
#[test]
fn update_sessions_while_polling() {
    let harness = Harness::start();

    let mut sessions = Vec::new();
    let mut peers = Vec::new();

    for _ in 0..8 {
        let (server, peer) = tcp_pair();
        let session = TestSession::new(server);
        let info = session_info(&session);
        harness.register(&info);
        sessions.push((session, info));
        peers.push(peer);
    }

    for peer in &mut peers {
        peer.write_all(b"hello").unwrap();
    }

    // Every session's read event arrives, across one or more batches.
    let mut seen = std::collections::HashSet::new();
    let deadline = Instant::now() + EVENT_DEADLINE;
    while seen.len() < sessions.len() {
        assert!(Instant::now() < deadline, "missing read events: {seen:?}");
        if let Ok(batch) = harness.read_batches.recv_timeout(Duration::from_millis(100)) {
            seen.extend(batch);
        }
    }

    for (session, _) in &sessions {
        assert!(seen.contains(&session.id));
    }

    // Remove half the sessions; the rest keep producing after re-arm.
    let removed: Vec<_> = sessions
        .drain(..4)
        .map(|(_session, info)| info)
        .collect();
    harness
        .producer
        .update_sessions(Vec::new(), removed)
        .unwrap();

    for (session, info) in &sessions {
        session.drain();
        harness.producer.rearm_session(info);
    }

    for peer in &mut peers[4..] {
        peer.write_all(b"again").unwrap();
    }

    let mut seen_after = std::collections::HashSet::new();
    let deadline = Instant::now() + EVENT_DEADLINE;
    while seen_after.len() < sessions.len() {
        assert!(Instant::now() < deadline, "missing read events after update");
        if let Ok(batch) = harness.read_batches.recv_timeout(Duration::from_millis(100)) {
            seen_after.extend(batch);
        }
    }

    for (session, _) in &sessions {
        assert!(seen_after.contains(&session.id));
    }
}

/// Subscribers coming and going while events are being fanned out: no
/// deadlock, no panic, and the stable subscriber misses nothing.
#[test]
fn subscriber_churn_during_fan_out() {
    let harness = Harness::start();

    let (server, mut peer) = tcp_pair();
    let session = TestSession::new(server);
    let info = session_info(&session);
    harness.register(&info);

    let churn_done = Arc::new(AtomicBool::new(false));
    let churner = {
        let done = Arc::clone(&churn_done);
        let producer = Arc::clone(&harness.producer);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let (handler, _batches) = RecordingReadHandler::new();
                let id = handler.handler_id();
                assert!(producer.subscribe_to_read_events(Arc::downgrade(&handler)));
                thread::sleep(Duration::from_millis(1));
                assert!(producer.unsubscribe_from_read_events(id));
                drop(handler);
            }
        })
    };

    for _ in 0..20 {
        peer.write_all(b"tick").unwrap();
        assert_eq!(harness.expect_read_batch(), vec![session.id]);
        session.drain();
        harness.producer.rearm_session(&info);
    }

    churn_done.store(true, Ordering::Release);
    churner.join().unwrap();
}

/// Monotonic state and unique transitions, observed through the shared
/// mutable record the producer works with.
#[test]
fn connection_state_is_monotonic() {
    let (server, _peer) = tcp_pair();
    let session = TestSession::new(server);

    let info = SessionInfo::new(
        "fresh",
        Arc::clone(&session) as Arc<dyn Session>,
        SessionConnectionState::NotConnected,
        MessageReceptionAfterDisconnect::NotSupported,
        MessageProcessingAfterDisconnect::NotSupported,
    );

    let observed = Arc::new(Mutex::new(vec![info.connection_state()]));

    assert!(info.set_as_connected());
    observed.lock().unwrap().push(info.connection_state());

    assert!(info.set_as_disconnected());
    observed.lock().unwrap().push(info.connection_state());

    assert_eq!(
        *observed.lock().unwrap(),
        vec![
            SessionConnectionState::NotConnected,
            SessionConnectionState::Connected,
            SessionConnectionState::Disconnected,
        ]
    );
}
