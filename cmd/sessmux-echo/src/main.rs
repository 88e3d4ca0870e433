//! Sessmux Echo Server
//!
//! TCP echo server driven entirely by the sessmux event producer: the
//! accept loop registers sessions, the read handler echoes pending bytes
//! back and re-arms, and the closed handler hands finished sessions to a
//! blocking queue that the main loop drains into `update_sessions`.
//!
//! Usage:
//!     cargo run -p sessmux-echo [port]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!
//!     # A few concurrent clients:
//!     for i in $(seq 1 50); do echo "ping $i" | nc -q0 localhost 9999 & done

#[cfg(unix)]
fn main() {
    unix::run();
}

#[cfg(not(unix))]
fn main() {
    eprintln!("sessmux-echo drives the readiness-API producer and only runs on unix");
}

#[cfg(unix)]
mod unix {
    use std::io;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::Duration;

    use tracing::{debug, error, info, warn};
    use uuid::Uuid;

    use sessmux::{
        new_session_event_producer, ClosedEvent, ClosedEventHandler, Message,
        MessageProcessingAfterDisconnect, MessageReceptionAfterDisconnect, ProducerConfig,
        ReadEvent, ReadEventHandler, Session, SessionConnectionState, SessionEventProducer,
        SessionInfo, SessionLifetimeAction, SessionLifetimeChange, SessionLifetimeHandler,
        SessionOperationState, SocketId, TaskExecutionMode,
    };
    use sessmux_core::{BlockingQueue, CancellationSource};

    const DEFAULT_PORT: u16 = 9999;
    const BUF_SIZE: usize = 4096;

    // ── The application-side session ─────────────────────────────────

    /// One echo client. The stream stays non-blocking; all reads happen
    /// on the polling thread when the producer says bytes are pending.
    struct EchoSession {
        id: Uuid,
        stream: TcpStream,
        peer: String,
        refcount: AtomicU64,
    }

    impl EchoSession {
        fn new(stream: TcpStream) -> io::Result<Arc<Self>> {
            stream.set_nonblocking(true)?;
            stream.set_nodelay(true)?;

            let peer = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "unknown".into());

            Ok(Arc::new(Self {
                id: Uuid::new_v4(),
                stream,
                peer,
                refcount: AtomicU64::new(0),
            }))
        }
    }

    impl Session for EchoSession {
        fn id(&self) -> Uuid {
            self.id
        }

        fn name(&self) -> String {
            format!("echo-{}", self.peer)
        }

        fn user_name(&self) -> String {
            self.peer.clone()
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
            // The echo path never frames messages; bytes bounce straight
            // back in the read handler.
            None
        }

        fn handle_rx_message(&self, _message: Message) {}

        fn disconnect(&self, socket_was_closed: bool) {
            debug!(session = %self.name(), socket_was_closed, "disconnecting");
            let _ = self.stream.shutdown(std::net::Shutdown::Both);
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

    // ── Event handlers ───────────────────────────────────────────────

    /// Echoes pending bytes and re-arms the session. Small enough to run
    /// inline on the polling thread.
    struct EchoReadHandler {
        id: Uuid,
        producer: Weak<dyn SessionEventProducer>,
    }

    impl ReadEventHandler for EchoReadHandler {
        fn handler_id(&self) -> Uuid {
            self.id
        }

        fn handle_event(&self, event: &ReadEvent) {
            let Some(producer) = self.producer.upgrade() else {
                return;
            };

            for info in event.sessions() {
                if echo_pending(info) {
                    producer.rearm_session(info);
                }
                // A dead peer needs no action here: the producer reports
                // the close separately and the closed path cleans up.
            }
        }
    }

    /// Drain pending bytes on the session's socket and write them straight
    /// back. Returns `false` once the peer is gone.
    fn echo_pending(info: &Arc<SessionInfo>) -> bool {
        let fd = info.socket();
        let mut buf = [0u8; BUF_SIZE];

        loop {
            let received = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), BUF_SIZE, 0) };

            if received == 0 {
                return false;
            }

            if received < 0 {
                let err = io::Error::last_os_error();
                return err.kind() == io::ErrorKind::WouldBlock;
            }

            let mut sent = 0isize;
            while sent < received {
                let n = unsafe {
                    libc::send(
                        fd,
                        buf.as_ptr().add(sent as usize).cast(),
                        (received - sent) as usize,
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n <= 0 {
                    return false;
                }
                sent += n;
            }
        }
    }

    /// Hands closed sessions to the main loop; nothing heavier belongs on
    /// a polling thread.
    struct EchoClosedHandler {
        id: Uuid,
        closed: Arc<BlockingQueue<Arc<SessionInfo>>>,
    }

    impl ClosedEventHandler for EchoClosedHandler {
        fn handler_id(&self) -> Uuid {
            self.id
        }

        fn handle_event(&self, event: &ClosedEvent) {
            for info in event.sessions() {
                info!(session = %info, "peer closed");
                if !self.closed.enqueue(Arc::clone(info)) {
                    warn!(session = %info, "closed queue rejected session");
                }
            }
        }
    }

    /// Routes session lifetime changes into the producer's registry.
    struct EchoLifetimeManager {
        producer: Arc<dyn SessionEventProducer>,
    }

    impl SessionLifetimeHandler for EchoLifetimeManager {
        fn manage_sessions_lifetime(&self, changes: &[SessionLifetimeChange]) -> bool {
            let mut new = Vec::new();
            let mut closed = Vec::new();

            for change in changes {
                match change.action {
                    SessionLifetimeAction::Created => {
                        new.push(Arc::clone(&change.session));
                    }
                    SessionLifetimeAction::Deleted => {
                        change.session.session().disconnect(true);
                        closed.push(Arc::clone(&change.session));
                    }
                }
            }

            if let Err(err) = self.producer.update_sessions(new, closed) {
                error!(error = %err, "failed to update the session registry");
                return false;
            }

            true
        }
    }

    // ── Main loop ────────────────────────────────────────────────────

    pub(super) fn run() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();

        let port = std::env::args()
            .nth(1)
            .and_then(|arg| arg.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let producer = new_session_event_producer("echo", ProducerConfig::default());
        producer.start().expect("failed to start the event producer");

        let lifetime = CancellationSource::new();
        let closed_queue = Arc::new(BlockingQueue::new("echo-closed", lifetime.token(), true));

        let read_handler: Arc<dyn ReadEventHandler> = Arc::new(EchoReadHandler {
            id: Uuid::new_v4(),
            producer: Arc::downgrade(&producer),
        });
        let closed_handler: Arc<dyn ClosedEventHandler> = Arc::new(EchoClosedHandler {
            id: Uuid::new_v4(),
            closed: Arc::clone(&closed_queue),
        });

        assert!(producer.subscribe_to_read_events(Arc::downgrade(&read_handler)));
        assert!(producer.subscribe_to_closed_events(Arc::downgrade(&closed_handler)));

        let lifetime_manager = EchoLifetimeManager {
            producer: Arc::clone(&producer),
        };

        let listener =
            TcpListener::bind(("0.0.0.0", port)).expect("failed to bind the listen socket");
        listener
            .set_nonblocking(true)
            .expect("failed to make the listener non-blocking");

        info!(port, "echo server listening");

        loop {
            match listener.accept() {
                Ok((stream, addr)) => {
                    let session = match EchoSession::new(stream) {
                        Ok(session) => session,
                        Err(err) => {
                            error!(%addr, error = %err, "failed to set up session");
                            continue;
                        }
                    };

                    let info = SessionInfo::new(
                        session.name(),
                        session as Arc<dyn Session>,
                        SessionConnectionState::Connected,
                        MessageReceptionAfterDisconnect::NotSupported,
                        MessageProcessingAfterDisconnect::NotSupported,
                    );

                    info!(session = %info, "accepted");

                    lifetime_manager
                        .manage_sessions_lifetime(&[SessionLifetimeChange::created(info)]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    drain_closed_sessions(&lifetime_manager, &closed_queue);
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(err) => {
                    error!(error = %err, "accept failed");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn drain_closed_sessions(
        lifetime_manager: &EchoLifetimeManager,
        closed_queue: &BlockingQueue<Arc<SessionInfo>>,
    ) {
        let mut changes = Vec::new();
        while let Some(info) = closed_queue.try_take() {
            changes.push(SessionLifetimeChange::deleted(info));
        }

        if !changes.is_empty() {
            lifetime_manager.manage_sessions_lifetime(&changes);
        }
    }
}
