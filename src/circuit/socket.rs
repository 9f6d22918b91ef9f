//! The outbound socket seam. Abstracting the send side keeps the engine testable
//!  without real UDP I/O; the receive loop always runs against a real socket and
//!  feeds the engine's inbound pump directly.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{debug, error};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// Best-effort datagram send. Never blocks: when the OS send queue is full the
    ///  packet is dropped here - reliable traffic recovers through retransmission.
    async fn send_packet(&self, to: SocketAddr, datagram: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, datagram: &[u8]) {
        match self.try_send_to(datagram, to) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("send queue full, dropping {} bytes to {:?}", datagram.len(), to);
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// records every sent datagram for inspection
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSocket {
    sent: std::sync::Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

#[cfg(test)]
impl RecordingSocket {
    pub(crate) fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }
}

#[cfg(test)]
#[async_trait]
impl SendSocket for RecordingSocket {
    async fn send_packet(&self, to: SocketAddr, datagram: &[u8]) {
        self.sent.lock().unwrap().push((to, datagram.to_vec()));
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }
}
