use crate::session_table::SessionTable;
use crate::buffer_pool::FrameBufferPool;
use crate::config::TransportConfig;
use crate::send_socket::SendSocket;
use crate::session::{Session, SessionCleanup, SessionKey, SessionRole};
use crate::wire::{self, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

/// The server side of the transport: owns the bound UDP socket, demultiplexes incoming
///  frames to per-session state by `(peer address, session id)`, and hands
///  peer-initiated sessions to [`Listener::accept`].
pub struct Listener {
    shared: Arc<ListenerShared>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Session>>>,
    recv_handle: JoinHandle<()>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.recv_handle.abort();
    }
}

impl Listener {
    pub async fn bind(addr: SocketAddr, config: Arc<TransportConfig>) -> anyhow::Result<Listener> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening on {:?}", socket.local_addr());

        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog);
        let sessions = Arc::new(SessionTable::new());
        let shared = Arc::new(ListenerShared {
            socket: socket.clone(),
            send_socket: Arc::new(socket),
            sessions: sessions.clone(),
            cleanup: Arc::new(TableCleanup { sessions }),
            accept_tx,
            buffer_pool: Arc::new(FrameBufferPool::new(wire::MAX_FRAME_LEN + 1, config.buffer_pool_size)),
            config,
        });

        let recv_handle = tokio::spawn(Arc::clone(&shared).recv_loop());
        Ok(Listener {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            recv_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.send_socket.local_addr()
    }

    /// Blocks until the next peer-initiated session is available. Returns `None` once
    ///  the listener is shutting down.
    pub async fn accept(&self) -> Option<Arc<Session>> {
        self.accept_rx.lock().await.recv().await
    }
}

struct ListenerShared {
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    sessions: Arc<SessionTable<SessionKey, Arc<Session>>>,
    cleanup: Arc<TableCleanup>,
    accept_tx: mpsc::Sender<Arc<Session>>,
    buffer_pool: Arc<FrameBufferPool>,
    config: Arc<TransportConfig>,
}

impl ListenerShared {
    async fn recv_loop(self: Arc<Self>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; wire::MAX_FRAME_LEN + 1];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            trace!("received {} bytes from {:?}", num_read, from);

            let frame = match wire::parse_frame(&buf[..num_read]) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("dropping unparseable datagram from {:?}: {:#}", from, e);
                    continue;
                }
            };

            self.dispatch(from, frame).instrument(span).await;
        }
    }

    async fn dispatch(&self, from: SocketAddr, frame: Frame) {
        let key = SessionKey { peer: from, id: frame.session() };

        match frame {
            Frame::Connect { .. } => self.on_connect(key).await,
            Frame::Close { .. } => self.on_close(key).await,
            frame @ (Frame::Ack { .. } | Frame::Data { .. }) => match self.sessions.get(&key) {
                Some(session) => session.deliver(frame),
                None => {
                    debug!("frame for unknown session {}, rejecting", key);
                    self.emit(key.peer, &Frame::Close { session: key.id }).await;
                }
            },
        }
    }

    async fn on_connect(&self, key: SessionKey) {
        if self.sessions.get(&key).is_none() {
            let fresh = Session::spawn(
                SessionRole::Server,
                key,
                self.send_socket.clone(),
                self.config.clone(),
                self.buffer_pool.clone(),
                self.cleanup.clone(),
            );

            match self.sessions.insert_if_vacant(key, fresh.clone()) {
                Some(_existing) => {
                    // lost a race against a concurrent connect: discard the loser unseen
                    fresh.abort();
                }
                None => {
                    if let Err(e) = self.accept_tx.try_send(fresh.clone()) {
                        // no response at all, so the peer's retried connect can succeed
                        // once the application catches up with accepting
                        debug!("cannot enqueue session {} for accept ({}), discarding", key, e);
                        fresh.abort();
                        self.sessions.remove(&key);
                        return;
                    }
                    debug!("accepted session {}", key);
                }
            }
        }
        else {
            trace!("duplicate connect for session {}", key);
        }

        self.emit(key.peer, &Frame::Ack { session: key.id, length: 0 }).await;
    }

    async fn on_close(&self, key: SessionKey) {
        match self.sessions.get(&key) {
            Some(session) => {
                debug!("peer closed session {}", key);
                // the close reply and the table removal both happen in here
                session.close().await;
            }
            None => {
                self.emit(key.peer, &Frame::Close { session: key.id }).await;
            }
        }
    }

    async fn emit(&self, to: SocketAddr, frame: &Frame) {
        let mut buf = self.buffer_pool.get_from_pool();
        frame.encode_into(&mut buf);
        self.send_socket.send_frame(to, &buf).await;
        self.buffer_pool.return_to_pool(buf);
    }
}

struct TableCleanup {
    sessions: Arc<SessionTable<SessionKey, Arc<Session>>>,
}

impl SessionCleanup for TableCleanup {
    fn on_session_closed(&self, key: SessionKey) {
        debug!("session {} has closed, dropping it from the table", key);
        self.sessions.remove(&key);
    }
}
