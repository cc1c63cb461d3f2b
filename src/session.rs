use crate::buffer_pool::FrameBufferPool;
use crate::config::TransportConfig;
use crate::narrow::NarrowCast;
use crate::send_socket::SendSocket;
use crate::wire::{self, Frame};
use anyhow::bail;
#[cfg(test)] use mockall::automock;
use std::cmp::min;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::select;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// The demultiplexing key. Sessions are scoped to the peer address, so numerically
///  colliding ids from distinct peers stay distinct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: SocketAddr,
    pub id: u32,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.peer, self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// accepted by a listener
    Server,
    /// created by a dialer; starts out waiting for the ack of its initial connect
    Client,
}

/// Invoked exactly once when a session reaches its terminal state, so the owning
///  listener or dialer can drop the session from its table. Sessions never touch that
///  table directly.
#[cfg_attr(test, automock)]
pub trait SessionCleanup: Send + Sync + 'static {
    fn on_session_closed(&self, key: SessionKey);
}

struct RecvState {
    /// contiguous bytes received in order; the buffer length is also the next
    ///  acceptable data position
    buffer: Vec<u8>,
    /// how far the application has consumed the buffer
    cursor: usize,
}

struct SendState {
    /// everything the application ever wrote, indexed by absolute stream offset; this
    ///  doubles as the retransmission buffer
    buffer: Vec<u8>,
    /// next offset the write worker will emit; rewound to the last acknowledged offset
    ///  by the retransmission tick
    cursor: usize,
}

/// One reliable byte-stream session. Created by a [`crate::listener::Listener`] (server
///  role) or a [`crate::dialer::Dialer`] (client role), never directly.
///
/// Two worker tasks run per session: the read worker consumes frames routed to this
///  session and drives the inactivity timeout, the write worker packs and (re)transmits
///  outgoing bytes. Both exit on the terminal transition to closed.
pub struct Session {
    key: SessionKey,
    role: SessionRole,
    config: Arc<TransportConfig>,
    socket: Arc<dyn SendSocket>,
    buffer_pool: Arc<FrameBufferPool>,
    cleanup: Arc<dyn SessionCleanup>,

    recv: Mutex<RecvState>,
    send: Mutex<SendState>,

    /// highest contiguous byte count the peer has acknowledged, monotonic
    ///  non-decreasing; -1 while a client session is still waiting for the ack of its
    ///  initial connect
    last_ack: AtomicI32,
    /// highest offset ever handed to the socket; an incoming ack above this is a
    ///  protocol violation
    max_ackable: AtomicI32,

    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,

    /// one-slot wake-up for `read`
    data_ready: Notify,
    /// wakes the write worker when `write` appends bytes
    send_pending: Notify,

    frame_tx: mpsc::Sender<Frame>,
}

impl Session {
    pub(crate) fn spawn(
        role: SessionRole,
        key: SessionKey,
        socket: Arc<dyn SendSocket>,
        config: Arc<TransportConfig>,
        buffer_pool: Arc<FrameBufferPool>,
        cleanup: Arc<dyn SessionCleanup>,
    ) -> Arc<Session> {
        let (frame_tx, frame_rx) = mpsc::channel(config.receive_queue_capacity);
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(Session {
            key,
            role,
            config,
            socket,
            buffer_pool,
            cleanup,
            recv: Mutex::new(RecvState { buffer: Vec::new(), cursor: 0 }),
            send: Mutex::new(SendState { buffer: Vec::new(), cursor: 0 }),
            last_ack: AtomicI32::new(match role {
                SessionRole::Server => 0,
                SessionRole::Client => -1,
            }),
            max_ackable: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
            data_ready: Notify::new(),
            send_pending: Notify::new(),
            frame_tx,
        });

        tokio::spawn(Arc::clone(&session).read_worker(frame_rx));
        tokio::spawn(Arc::clone(&session).write_worker());
        session
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.key.peer
    }

    pub fn id(&self) -> u32 {
        self.key.id
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Non-blocking hand-off from the demux loop to the read worker. A full queue drops
    ///  the frame; the peer's retransmission covers the loss.
    pub(crate) fn deliver(&self, frame: Frame) {
        if self.frame_tx.try_send(frame).is_err() {
            debug!("session {}: receive queue unavailable, dropping frame", self.key);
        }
    }

    /// Blocks until bytes past the read cursor are available or the session closes.
    ///  Returns the number of bytes copied into `out`, and whether the stream has ended
    ///  - which it only does once the session is closed *and* fully drained.
    pub async fn read(&self, out: &mut [u8]) -> (usize, bool) {
        let mut closed_rx = self.closed_tx.subscribe();
        loop {
            {
                let mut recv = self.recv.lock().unwrap();
                if recv.cursor < recv.buffer.len() {
                    let n = min(out.len(), recv.buffer.len() - recv.cursor);
                    out[..n].copy_from_slice(&recv.buffer[recv.cursor..recv.cursor + n]);
                    recv.cursor += n;
                    return (n, false);
                }
            }
            if self.is_closed() {
                return (0, true);
            }
            select! {
                _ = self.data_ready.notified() => {}
                _ = closed_rx.changed() => {}
            }
        }
    }

    /// Appends to the outgoing stream and wakes the write worker. Fails once the
    ///  session is closed or the stream would grow past the numeric wire bound.
    pub fn write(&self, data: &[u8]) -> anyhow::Result<usize> {
        {
            let mut send = self.send.lock().unwrap();
            if self.is_closed() {
                bail!("session {} is closed", self.key);
            }
            let total = send.buffer.len() as u64 + data.len() as u64;
            if total > wire::MAX_NUMERIC as u64 {
                bail!("session {}: stream length {} exceeds the wire bound", self.key, total);
            }
            send.buffer.extend_from_slice(data);
        }
        self.send_pending.notify_one();
        Ok(data.len())
    }

    /// The idempotent terminal transition: marks the session closed, wakes readers and
    ///  both workers, tells the peer, and lets the owner drop its table entry.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing session {}", self.key);
        let _ = self.closed_tx.send(true);
        self.send_frame(&Frame::Close { session: self.key.id }).await;
        self.cleanup.on_session_closed(self.key);
    }

    /// Tears the session down without telling the peer and without the cleanup
    ///  callback. Used to discard a session that was never exposed - most notably when
    ///  the accept queue is full, so the peer's retried connect can succeed later.
    pub fn abort(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("aborting session {}", self.key);
        let _ = self.closed_tx.send(true);
    }

    pub(crate) async fn send_frame(&self, frame: &Frame) {
        if let Err(e) = frame.validate() {
            warn!("session {}: not sending invalid frame: {}", self.key, e);
            return;
        }
        let mut buf = self.buffer_pool.get_from_pool();
        frame.encode_into(&mut buf);
        self.socket.send_frame(self.key.peer, &buf).await;
        self.buffer_pool.return_to_pool(buf);
    }

    /// Consumes frames routed to this session and drives the inactivity timeout. Every
    ///  frame that made it here was valid on the wire, so every one resets the timeout.
    async fn read_worker(self: Arc<Self>, mut frame_rx: mpsc::Receiver<Frame>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut deadline = Instant::now() + self.config.inactivity_timeout;

        loop {
            let frame = select! {
                _ = closed_rx.changed() => return,
                _ = sleep_until(deadline) => {
                    debug!("session {}: no frame from peer within {:?}, closing",
                        self.key, self.config.inactivity_timeout);
                    self.close().await;
                    return;
                }
                frame = frame_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => return,
                },
            };
            deadline = Instant::now() + self.config.inactivity_timeout;

            match frame {
                Frame::Ack { length, .. } => {
                    if !self.on_peer_ack(length) {
                        self.close().await;
                        return;
                    }
                }
                Frame::Data { pos, payload, .. } => match self.integrate_data(pos, &payload) {
                    DataOutcome::Ack(length) => {
                        self.send_frame(&Frame::Ack { session: self.key.id, length }).await;
                    }
                    DataOutcome::Dropped => {}
                    DataOutcome::Violation => {
                        self.close().await;
                        return;
                    }
                },
                Frame::Connect { .. } | Frame::Close { .. } => {
                    warn!("session {}: {:?} frame routed to the session worker, ignoring",
                        self.key, frame);
                }
            }
        }
    }

    /// Folds an incoming data frame into the receive buffer. The ack always restates
    ///  the current contiguous length, whether or not the frame lined up.
    fn integrate_data(&self, pos: u32, payload: &[u8]) -> DataOutcome {
        let mut recv = self.recv.lock().unwrap();
        if self.is_closed() {
            // late data racing a local close stays unacknowledged, so the peer times out
            debug!("session {}: data after close, dropping", self.key);
            return DataOutcome::Dropped;
        }

        let current = recv.buffer.len();
        if pos as usize != current {
            debug!("session {}: data at position {} does not line up with the {} bytes received so far",
                self.key, pos, current);
            return DataOutcome::Ack(current.narrow());
        }
        if pos as u64 + payload.len() as u64 > wire::MAX_NUMERIC as u64 {
            warn!("session {}: data would grow the stream past the wire bound, closing", self.key);
            return DataOutcome::Violation;
        }

        recv.buffer.extend_from_slice(payload);
        trace!("session {}: appended {} bytes at position {}", self.key, payload.len(), pos);
        self.data_ready.notify_one();
        DataOutcome::Ack(recv.buffer.len().narrow())
    }

    /// Monotonic update of `last_ack`. Returns false if the peer acknowledged bytes
    ///  that were never sent.
    fn on_peer_ack(&self, length: u32) -> bool {
        let length: i32 = length.narrow();
        let max_ackable = self.max_ackable.load(Ordering::SeqCst);
        if length > max_ackable {
            warn!("session {}: peer acknowledged {} bytes but only {} were ever sent",
                self.key, length, max_ackable);
            return false;
        }

        let prev = self.last_ack.fetch_max(length, Ordering::SeqCst);
        if prev < 0 {
            trace!("session {}: connect acknowledged", self.key);
            // data queued before the connect ack may go out now
            self.send_pending.notify_one();
        }
        true
    }

    async fn write_worker(self: Arc<Self>) {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut retransmit = interval_at(
            Instant::now() + self.config.retransmit_interval,
            self.config.retransmit_interval,
        );
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = closed_rx.changed() => {
                    trace!("session {}: write worker stopping", self.key);
                    return;
                }
                _ = retransmit.tick() => {
                    let last_ack = self.last_ack.load(Ordering::SeqCst);
                    if last_ack < 0 {
                        trace!("session {}: connect still unacknowledged, resending", self.key);
                        self.send_frame(&Frame::Connect { session: self.key.id }).await;
                        continue;
                    }
                    let mut send = self.send.lock().unwrap();
                    if send.cursor > last_ack.narrow() {
                        debug!("session {}: retransmitting from offset {} (cursor was {})",
                            self.key, last_ack, send.cursor);
                    }
                    send.cursor = last_ack.narrow();
                }
                _ = self.send_pending.notified() => {
                    if self.last_ack.load(Ordering::SeqCst) < 0 {
                        // no data frames before the connect ack
                        continue;
                    }
                }
            }
            self.flush_pending().await;
        }
    }

    /// Emits data frames from the send cursor until the buffer is drained. Each frame
    ///  is packed under the send lock and emitted outside it, so a slow socket never
    ///  blocks the stream surface.
    async fn flush_pending(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let (frame, next_offset) = {
                let send = self.send.lock().unwrap();
                if send.cursor >= send.buffer.len() {
                    return;
                }
                let (consumed, frame) = wire::pack_data(
                    self.key.id,
                    send.cursor.narrow(),
                    &send.buffer[send.cursor..],
                );
                if consumed == 0 {
                    return;
                }
                (frame, send.cursor + consumed)
            };

            // the offset counts as transmitted before the datagram leaves - the peer's
            // ack may overtake the send
            self.max_ackable.fetch_max(next_offset.narrow(), Ordering::SeqCst);
            self.send_frame(&frame).await;

            self.send.lock().unwrap().cursor = next_offset;
            trace!("session {}: send cursor now at {}", self.key, next_offset);
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum DataOutcome {
    /// integrated or ignored; acknowledge the current contiguous length
    Ack(u32),
    /// arrived after the local close; no response at all
    Dropped,
    /// the peer tried to grow the stream past the numeric wire bound
    Violation,
}
