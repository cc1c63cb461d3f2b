use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a single frame on a UDP socket, introduced to
///  facilitate mocking the I/O part away for testing.
///
/// Send errors are logged and swallowed: a lost datagram is indistinguishable from a
///  failed send anyway, and the retransmission tick covers both.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_frame(&self, to: SocketAddr, frame_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_frame(&self, to: SocketAddr, frame_buf: &[u8]) {
        trace!("UDP socket: sending frame to {:?}", to);

        if let Err(e) = self.send_to(frame_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
