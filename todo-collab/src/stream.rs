//! Duplex byte stream between a transport connection and the host.
//!
//! ```text
//!  transport (relay)            host
//!  TransportEnd.inbound  ───►  PeerStream::recv
//!  TransportEnd.outbound ◄───  PeerStream::send
//! ```
//!
//! Both directions are bounded, so a slow side applies backpressure to the
//! other instead of buffering without limit.

use tokio::sync::mpsc;

use crate::protocol::ProtocolError;

/// Host-facing end of a connection.
pub struct PeerStream {
    remote: String,
    incoming: mpsc::Receiver<Vec<u8>>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl PeerStream {
    /// Next frame from the peer; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.outgoing
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Human-readable peer address, for logs.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

/// Transport-facing end of a connection.
pub struct TransportEnd {
    /// Frames read from the socket go here.
    pub inbound: mpsc::Sender<Vec<u8>>,
    /// Frames to write to the socket come from here.
    pub outbound: mpsc::Receiver<Vec<u8>>,
}

/// A connected pair: the host's [`PeerStream`] and the transport's end.
/// Both directions hold at most `capacity` frames.
pub fn duplex(capacity: usize, remote: impl Into<String>) -> (PeerStream, TransportEnd) {
    let capacity = capacity.max(1);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let (out_tx, out_rx) = mpsc::channel(capacity);
    (
        PeerStream {
            remote: remote.into(),
            incoming: in_rx,
            outgoing: out_tx,
        },
        TransportEnd {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut peer, mut transport) = duplex(4, "test");
        transport.inbound.send(vec![1]).await.unwrap();
        assert_eq!(peer.recv().await, Some(vec![1]));

        peer.send(vec![2]).await.unwrap();
        assert_eq!(transport.outbound.recv().await, Some(vec![2]));
        assert_eq!(peer.remote(), "test");
    }

    #[tokio::test]
    async fn test_closing_transport_ends_stream() {
        let (mut peer, transport) = duplex(4, "test");
        drop(transport);
        assert_eq!(peer.recv().await, None);
        assert_eq!(peer.send(vec![1]).await, Err(ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_bounded_capacity() {
        let (_peer, transport) = duplex(1, "test");
        transport.inbound.try_send(vec![1]).unwrap();
        assert!(transport.inbound.try_send(vec![2]).is_err());
    }
}
