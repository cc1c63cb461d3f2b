use crate::session_table::SessionTable;
use crate::buffer_pool::FrameBufferPool;
use crate::config::TransportConfig;
use crate::session::{Session, SessionCleanup, SessionKey, SessionRole};
use crate::wire::{self, Frame};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::select;
use tracing::{debug, error, info, warn};

/// The client side of the transport. Every dialed session gets its own ephemeral UDP
///  socket connected to the remote, plus a private receive loop playing the
///  demultiplexer's role for that one session.
pub struct Dialer {
    config: Arc<TransportConfig>,
    buffer_pool: Arc<FrameBufferPool>,
    /// ids of live client sessions, so fresh random ids never collide
    live_ids: Arc<SessionTable<u32, ()>>,
}

impl Dialer {
    pub fn new(config: Arc<TransportConfig>) -> anyhow::Result<Dialer> {
        config.validate()?;
        Ok(Dialer {
            buffer_pool: Arc::new(FrameBufferPool::new(wire::MAX_FRAME_LEN + 1, config.buffer_pool_size)),
            config,
            live_ids: Arc::new(SessionTable::new()),
        })
    }

    /// Opens a client session to `remote`. The session is returned as soon as the
    ///  initial connect is on the wire - before the peer has acknowledged it. Writes
    ///  are accepted immediately, but no data frame leaves until the connect ack
    ///  arrives; until then the retransmission tick re-sends the connect.
    pub async fn dial(&self, remote: SocketAddr) -> anyhow::Result<Arc<Session>> {
        let local: SocketAddr = if remote.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        }
        else {
            "[::]:0".parse()?
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        let socket = Arc::new(socket);
        info!("dialed {:?} from {:?}", remote, socket.local_addr());

        let key = SessionKey { peer: remote, id: self.draw_session_id() };
        let session = Session::spawn(
            SessionRole::Client,
            key,
            Arc::new(socket.clone()),
            self.config.clone(),
            self.buffer_pool.clone(),
            Arc::new(RegistryCleanup { live_ids: self.live_ids.clone() }),
        );

        tokio::spawn(recv_loop(socket, Arc::clone(&session)));

        session.send_frame(&Frame::Connect { session: key.id }).await;
        Ok(session)
    }

    /// A uniformly random id below 2^31 that no live client session is using.
    fn draw_session_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.gen_range(0..=wire::MAX_NUMERIC);
            if self.live_ids.insert_if_vacant(id, ()).is_none() {
                return id;
            }
        }
    }
}

struct RegistryCleanup {
    live_ids: Arc<SessionTable<u32, ()>>,
}

impl SessionCleanup for RegistryCleanup {
    fn on_session_closed(&self, key: SessionKey) {
        debug!("client session {} has closed, releasing its id", key);
        self.live_ids.remove(&key.id);
    }
}

/// The single-session counterpart of the listener's demux loop. The socket is
///  connected, so everything it receives comes from the dialed remote.
async fn recv_loop(socket: Arc<UdpSocket>, session: Arc<Session>) {
    let mut closed_rx = session.closed_signal();
    let mut buf = vec![0u8; wire::MAX_FRAME_LEN + 1];

    loop {
        let num_read = select! {
            _ = closed_rx.changed() => return,
            result = socket.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    error!("session {}: socket error: {}", session.key(), e);
                    continue;
                }
            },
        };

        let frame = match wire::parse_frame(&buf[..num_read]) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("session {}: dropping unparseable datagram: {:#}", session.key(), e);
                continue;
            }
        };

        if frame.session() != session.id() {
            warn!("session {}: frame for foreign session {}, closing", session.key(), frame.session());
            session.close().await;
            return;
        }

        match frame {
            Frame::Connect { .. } => {
                warn!("session {}: unexpected connect from the server side, closing", session.key());
                session.close().await;
                return;
            }
            Frame::Close { .. } => {
                debug!("session {}: peer closed", session.key());
                session.close().await;
                return;
            }
            frame @ (Frame::Ack { .. } | Frame::Data { .. }) => session.deliver(frame),
        }
    }
}
