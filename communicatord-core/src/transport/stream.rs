//! Stream connection primitives: line-framed send/receive over TCP or Unix
//! sockets, plain or TLS, plus the permanent (auto-reconnecting) outbound
//! connection used for peer and gossip links (spec.md §4.3).

use std::net::SocketAddr;
use std::time::Duration;

use communicatord_common::logging::Logger;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::mpsc;

use crate::message::Message;
use crate::registry::EndpointId;

use super::backoff::BackoffSchedule;
use super::{ConnectionEvent, TransportError, TransportOptions};

/// Either side of a plain stream socket. TLS streams are wrapped at the
/// call site (see `transport::tls`) and handed in as a boxed
/// `AsyncRead + AsyncWrite` via `PlainOrSecure`.
pub enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Boxed(Box<dyn tokio::io::AsyncRead + Send + Unpin>, Box<dyn tokio::io::AsyncWrite + Send + Unpin>),
}

/// A live, established stream connection: a background reader task feeding
/// a shared event channel, and a writer half the caller drives directly.
///
/// Send is "atomic at the line level": each `send_message` call writes one
/// complete, newline-terminated line with a single `write_all` + `flush`,
/// so concurrent callers never interleave partial lines.
pub struct StreamHandle {
    outgoing: mpsc::Sender<OutgoingCommand>,
    logger: Logger,
}

enum OutgoingCommand {
    Send(String),
    Drain,
}

impl StreamHandle {
    /// Spawn the reader and writer halves of a connection. `events` is the
    /// broker's shared fan-in channel; every event is tagged with `id` so
    /// the event loop can attribute it to the right registry entry.
    pub fn spawn(
        id: EndpointId,
        raw: RawStream,
        events: mpsc::Sender<(EndpointId, ConnectionEvent)>,
        options: TransportOptions,
        logger: Logger,
    ) -> StreamHandle {
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<OutgoingCommand>(256);

        match raw {
            RawStream::Tcp(stream) => {
                let (read_half, write_half) = stream.into_split();
                spawn_reader(id, read_half, events.clone(), options.max_message_size);
                spawn_writer(write_half, outgoing_rx, events);
            }
            RawStream::Unix(stream) => {
                let (read_half, write_half) = stream.into_split();
                spawn_reader(id, read_half, events.clone(), options.max_message_size);
                spawn_writer(write_half, outgoing_rx, events);
            }
            RawStream::Boxed(read_half, write_half) => {
                spawn_reader(id, read_half, events.clone(), options.max_message_size);
                spawn_writer(write_half, outgoing_rx, events);
            }
        }

        StreamHandle {
            outgoing: outgoing_tx,
            logger,
        }
    }

    /// Queue one message for sending. Non-blocking: the broker's event
    /// loop is single-threaded (spec.md §5), so handler code can never
    /// await a slow peer. Returns an error if the writer task has already
    /// exited (peer gone) or the outgoing queue is saturated.
    pub fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        let mut line = message.to_wire();
        line.push('\n');
        self.outgoing
            .try_send(OutgoingCommand::Send(line))
            .map_err(|_| TransportError::Closed)
    }

    /// Drain pending output then close, per spec.md §4.3 `mark-done`.
    pub fn mark_done(&self) {
        let _ = self.outgoing.try_send(OutgoingCommand::Drain);
    }
}

fn spawn_reader<R>(
    id: EndpointId,
    read_half: R,
    events: mpsc::Sender<(EndpointId, ConnectionEvent)>,
    max_message_size: usize,
) where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    let _ = events.send((id, ConnectionEvent::Hangup)).await;
                    return;
                }
                Ok(n) if n > max_message_size => {
                    let _ = events
                        .send((
                            id,
                            ConnectionEvent::Error(TransportError::DatagramDropped(
                                "line exceeds max_message_size",
                            )),
                        ))
                        .await;
                }
                Ok(_) => match Message::parse(&line) {
                    Ok(message) => {
                        if events
                            .send((id, ConnectionEvent::Message(message)))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events.send((id, ConnectionEvent::Invalid(err))).await;
                    }
                },
                Err(err) => {
                    let _ = events
                        .send((id, ConnectionEvent::Error(TransportError::Io(err))))
                        .await;
                    return;
                }
            }
        }
    });
}

fn spawn_writer<W>(
    mut write_half: W,
    mut outgoing: mpsc::Receiver<OutgoingCommand>,
    events: mpsc::Sender<(EndpointId, ConnectionEvent)>,
) where
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    let _ = events; // writer failures surface through the reader's hangup/error path
    tokio::spawn(async move {
        while let Some(command) = outgoing.recv().await {
            match command {
                OutgoingCommand::Send(line) => {
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                    if write_half.flush().await.is_err() {
                        return;
                    }
                }
                OutgoingCommand::Drain => {
                    let _ = write_half.flush().await;
                    let _ = write_half.shutdown().await;
                    return;
                }
            }
        }
    });
}

/// State of a permanent (auto-reconnecting) outbound stream connection
/// (spec.md §4.3 "permanent connection" variant; DESIGN NOTES §9 models
/// this as a state machine rather than a thread-backed retry loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

/// Drives repeated connection attempts against a fixed TCP address,
/// retrying forever on transient failure per the configured backoff
/// schedule, and firing `ConnectionEvent::ConnectionFailed` between
/// attempts so the broker can update its failure bookkeeping (spec.md
/// §4.3, §4.9).
pub struct PermanentConnection {
    address: SocketAddr,
    schedule: BackoffSchedule,
    state: ConnectState,
    logger: Logger,
}

impl PermanentConnection {
    pub fn new(address: SocketAddr, logger: Logger) -> Self {
        Self {
            address,
            schedule: BackoffSchedule::default(),
            state: ConnectState::Disconnected,
            logger,
        }
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    pub fn schedule_mut(&mut self) -> &mut BackoffSchedule {
        &mut self.schedule
    }

    /// Run the retry loop until connected, yielding the raw stream on
    /// success. Intended to be spawned as its own task; the surrounding
    /// broker reacts to the `Connected`/`ConnectionFailed` events the
    /// caller forwards once this resolves or fails a single attempt.
    pub async fn attempt_once(&mut self, connect_timeout: Duration) -> Result<TcpStream, String> {
        self.state = ConnectState::Connecting;
        let result = tokio::time::timeout(connect_timeout, TcpStream::connect(self.address)).await;
        match result {
            Ok(Ok(stream)) => {
                self.state = ConnectState::Connected;
                self.schedule.reset();
                Ok(stream)
            }
            Ok(Err(err)) => {
                self.state = ConnectState::Disconnected;
                self.schedule.record_failure();
                self.logger
                    .warn(format!("connect to {} failed: {err}", self.address));
                Err(err.to_string())
            }
            Err(_) => {
                self.state = ConnectState::Disconnected;
                self.schedule.record_failure();
                Err(format!("connect to {} timed out", self.address))
            }
        }
    }

    pub fn begin_draining(&mut self) {
        self.state = ConnectState::Draining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointId;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn sends_and_receives_one_line_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            stream
        });

        let client_stream = TcpStream::connect(addr).await.unwrap();
        let server_stream = server_task.await.unwrap();

        let (events_tx, mut events_rx) = mpsc::channel(16);
        let logger = Logger::new_root(communicatord_common::Component::Transport, "test");
        let client_handle = StreamHandle::spawn(
            EndpointId::test_handle(),
            RawStream::Tcp(client_stream),
            events_tx.clone(),
            TransportOptions::default(),
            logger.clone(),
        );

        let (server_events_tx, mut server_events_rx) = mpsc::channel(16);
        let _server_handle = StreamHandle::spawn(
            EndpointId::test_handle(),
            RawStream::Tcp(server_stream),
            server_events_tx,
            TransportOptions::default(),
            logger,
        );

        client_handle.send_message(&Message::new("HELP")).unwrap();

        let (_, event) = server_events_rx.recv().await.unwrap();
        match event {
            ConnectionEvent::Message(msg) => assert_eq!(msg.command, "HELP"),
            other => panic!("unexpected event: {other:?}"),
        }

        drop(client_handle);
        drop(events_tx);
        let _ = events_rx.try_recv();
    }
}
