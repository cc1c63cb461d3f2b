//! A connection-oriented, in-order byte-stream session layer over plain UDP datagrams.
//!
//! The protocol provides TCP-like semantics - connect, ordered stream read/write, close,
//!  retransmission, session expiry - using nothing but best-effort datagrams. It is
//!  deliberately minimal: no congestion control, no windowing, no flow control, no
//!  encryption. A session is a single bidirectional byte stream between one local and one
//!  remote address.
//!
//! ## Wire format
//!
//! Every datagram carries exactly one frame. Frames are slash-delimited ASCII:
//!
//! ```ascii
//! /connect/<session>/
//! /data/<session>/<pos>/<bytes>/
//! /ack/<session>/<length>/
//! /close/<session>/
//! ```
//!
//! * `<session>`, `<pos>` and `<length>` are unsigned decimal values below 2^31
//! * `<bytes>` is an arbitrary byte payload in which every `/` and `\` of the original
//!    stream is escaped as `\/` and `\\` - no other escape sequences are legal
//! * a frame is at most 999 bytes long in its encoded form
//!
//! Any datagram that does not parse under this grammar is dropped without a response.
//!
//! ## Reliability model
//!
//! Both directions of a session are absolute byte streams: a `data` frame carries the
//!  offset of its first byte, and an `ack` frame is a *cumulative* acknowledgement - an
//!  ack of length L promises that bytes `[0, L)` have been received in order and will be
//!  visible to the application exactly once.
//!
//! * The receive side appends a `data` frame only if its position lines up exactly with
//!    the bytes received so far; stale retransmits and gaps are answered with an ack of
//!    the current contiguous length so the peer can re-sync.
//! * The send side keeps the entire outgoing stream buffered; there is no separate
//!    retransmission buffer. A periodic retransmission tick rewinds the send cursor to
//!    the last acknowledged offset, so everything unacknowledged is sent again.
//! * A session that receives no valid frame from its peer within the inactivity timeout
//!    is torn down.
//!
//! ## Roles
//!
//! A [`listener::Listener`] owns one UDP socket shared by all accepted sessions and
//!  demultiplexes incoming frames by `(peer address, session id)`. A
//!  [`dialer::Dialer`] creates client sessions, each on its own ephemeral socket
//!  connected to the remote. Both hand out [`session::Session`] values exposing the
//!  same blocking `read` / `write` / `close` stream surface.
//!
//! Each session runs two small worker tasks: the read worker integrates incoming frames
//!  and emits acks, the write worker packs and (re)transmits outgoing data. Workers
//!  never hold a session lock across a socket send.

mod buffer_pool;
pub mod config;
pub mod dialer;
pub mod listener;
mod narrow;
pub mod send_socket;
pub mod session;
mod session_table;
pub mod wire;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
