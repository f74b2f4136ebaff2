//! Datagram (UDP) transport: one-shot best-effort send, and the signal
//! listener's receive loop with shared-secret enforcement (spec.md §4.3,
//! §6 "UDP signal channel").

use std::net::SocketAddr;
use std::sync::Arc;

use communicatord_common::logging::Logger;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::message::Message;

use super::{ConnectionEvent, TransportError};

const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Send-to/receive-from handle over a bound UDP socket.
pub struct DatagramHandle {
    socket: Arc<UdpSocket>,
}

impl DatagramHandle {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// One-shot, best-effort send (spec.md §4.3). No reply is ever expected
    /// on this path (spec.md §6).
    pub async fn send_to(&self, message: &Message, addr: SocketAddr) -> Result<(), TransportError> {
        let line = message.to_wire();
        self.socket.send_to(line.as_bytes(), addr).await?;
        Ok(())
    }

    /// Spawn the receive loop for the signal listener. Every datagram is
    /// parsed and checked against `signal_secret` (a parameter named
    /// `signal-secret` must be present and match); messages failing either
    /// check are dropped silently, per spec.md §6.
    pub fn spawn_signal_receiver(
        self: Arc<Self>,
        signal_secret: Option<String>,
        events: mpsc::Sender<ConnectionEvent>,
        logger: Logger,
    ) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (len, _peer) = match self.socket.recv_from(&mut buf).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        logger.warn(format!("signal socket recv error: {err}"));
                        continue;
                    }
                };
                let Ok(text) = std::str::from_utf8(&buf[..len]) else {
                    continue;
                };
                let message = match Message::parse(text) {
                    Ok(message) => message,
                    Err(_) => continue,
                };

                if !secret_matches(&message, signal_secret.as_deref()) {
                    logger.debug("dropping signal datagram: shared secret missing or mismatched");
                    continue;
                }

                if events.send(ConnectionEvent::Message(message)).await.is_err() {
                    return;
                }
            }
        });
    }
}

const SECRET_PARAM: &str = "signal-secret";

fn secret_matches(message: &Message, configured: Option<&str>) -> bool {
    match configured {
        None => true,
        Some(expected) => message.parameter(SECRET_PARAM) == Some(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_matches_when_equal() {
        let msg = Message::new("GOSSIP").with_parameter("signal-secret", "s3cr3t");
        assert!(secret_matches(&msg, Some("s3cr3t")));
    }

    #[test]
    fn secret_mismatch_is_rejected() {
        let msg = Message::new("GOSSIP").with_parameter("signal-secret", "wrong");
        assert!(!secret_matches(&msg, Some("s3cr3t")));
    }

    #[test]
    fn missing_secret_is_rejected_when_configured() {
        let msg = Message::new("GOSSIP");
        assert!(!secret_matches(&msg, Some("s3cr3t")));
    }

    #[test]
    fn no_configured_secret_accepts_anything() {
        let msg = Message::new("GOSSIP");
        assert!(secret_matches(&msg, None));
    }

    #[tokio::test]
    async fn send_to_round_trips_over_loopback() {
        let a = DatagramHandle::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = DatagramHandle::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();

        a.send_to(&Message::new("RECEIVED"), b_addr).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (len, _) = b.socket.recv_from(&mut buf).await.unwrap();
        let received = Message::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert_eq!(received.command, "RECEIVED");
    }
}
