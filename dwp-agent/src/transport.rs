// Socket transport
//
// Runs on its own thread with a current-thread tokio runtime. Accepts (or
// makes) the debugger connection, exchanges the handshake, then splits the
// stream: a reader task feeds command packets to the agent thread and the
// writer loop drains the outgoing queue, acknowledging every packet once it
// is written so event senders know it is on the wire.

use crate::agent::Agent;
use crate::commands::{command_sets, event_commands};
use crate::eventrequest::SuspendPolicy;
use crate::protocol::*;
use bytes::{BufMut, Bytes};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands buffered between the reader task and the agent thread
const COMMAND_QUEUE_DEPTH: usize = 32;

#[derive(Debug)]
pub(crate) enum Outgoing {
    Packet {
        bytes: Bytes,
        ack: Option<oneshot::Sender<()>>,
    },
    Close,
}

/// Write side of an attached client, shared by every sender
#[derive(Debug, Clone)]
pub(crate) struct Session {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Session {
    pub fn send(&self, bytes: impl Into<Bytes>) -> SendAck {
        let (tx, rx) = oneshot::channel();
        let packet = Outgoing::Packet {
            bytes: bytes.into(),
            ack: Some(tx),
        };
        match self.outgoing.send(packet) {
            Ok(()) => SendAck(Some(rx)),
            Err(_) => SendAck(None),
        }
    }

    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

/// Completion of a queued packet
#[derive(Debug)]
pub(crate) struct SendAck(Option<oneshot::Receiver<()>>);

impl SendAck {
    pub fn closed() -> Self {
        SendAck(None)
    }

    /// Block until the packet is written. False if the session died first.
    pub fn wait(self) -> bool {
        match self.0 {
            Some(rx) => rx.blocking_recv().is_ok(),
            None => false,
        }
    }
}

/// A freshly attached client, handed to the agent thread
#[derive(Debug)]
pub(crate) struct Connection {
    pub session: Session,
    pub commands: mpsc::Receiver<CommandPacket>,
}

/// Accept or connect until the agent stops
pub(crate) async fn run(
    agent: Arc<Agent>,
    listener: Option<std::net::TcpListener>,
    connections: mpsc::Sender<Connection>,
) {
    match listener {
        Some(listener) => {
            let listener = match TcpListener::from_std(listener) {
                Ok(listener) => listener,
                Err(e) => {
                    error!("Failed to register listener: {}", e);
                    return;
                }
            };

            let mut stop = agent.stop_signal.subscribe();
            loop {
                if agent.is_stopping() {
                    break;
                }
                let accepted = tokio::select! {
                    accepted = accept(&listener, agent.config.timeout) => accepted,
                    _ = stop.changed() => break,
                };

                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        break;
                    }
                };
                info!("Accepted debugger connection from {}", peer);

                if let Err(e) = serve(&agent, stream, &connections).await {
                    warn!("Session ended: {}", e);
                }
                if agent.is_stopping() {
                    break;
                }
                info!("Waiting for a new debugger connection");
            }
        }
        None => match agent.config.socket_address() {
            Ok((host, port)) => {
                info!("Connecting to debugger at {}:{}", host, port);
                match TcpStream::connect((host.as_str(), port)).await {
                    Ok(stream) => {
                        if let Err(e) = serve(&agent, stream, &connections).await {
                            warn!("Session ended: {}", e);
                        }
                    }
                    Err(e) => error!("Failed to connect to {}:{}: {}", host, port, e),
                }
            }
            Err(e) => error!("{}", e),
        },
    }

    agent.transport_finished();
}

async fn accept(
    listener: &TcpListener,
    timeout: Option<Duration>,
) -> std::io::Result<(TcpStream, std::net::SocketAddr)> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, listener.accept())
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "timed out waiting for a debugger connection",
                )
            })?,
        None => listener.accept().await,
    }
}

/// Exchange handshakes: each side writes the magic string and checks the other's
async fn handshake(stream: &mut TcpStream) -> AgentResult<()> {
    debug!("Performing handshake");

    stream.write_all(HANDSHAKE).await?;
    stream.flush().await?;

    let mut buf = vec![0u8; HANDSHAKE.len()];
    stream.read_exact(&mut buf).await?;

    if buf != HANDSHAKE {
        warn!("Invalid handshake: {:?}", String::from_utf8_lossy(&buf));
        return Err(AgentError::InvalidHandshake);
    }

    info!("Handshake successful");
    Ok(())
}

async fn serve(
    agent: &Arc<Agent>,
    mut stream: TcpStream,
    connections: &mpsc::Sender<Connection>,
) -> AgentResult<()> {
    stream.set_nodelay(true)?;
    handshake(&mut stream).await?;

    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);

    connections
        .send(Connection {
            session: Session { outgoing: out_tx },
            commands: cmd_rx,
        })
        .await
        .map_err(|_| AgentError::ConnectionClosed)?;

    let mut reader_task = tokio::spawn(read_commands(reader, cmd_tx));
    let result = write_loop(agent, writer, out_rx, &mut reader_task).await;

    // Dropping the command sender ends the dispatcher, which disposes the VM
    reader_task.abort();
    result
}

async fn read_commands(mut reader: OwnedReadHalf, commands: mpsc::Sender<CommandPacket>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut header).await {
            debug!("Connection closed: {}", e);
            break;
        }

        let header = match PacketHeader::decode(&header) {
            Ok(header) => header,
            Err(e) => {
                warn!("Malformed packet: {}", e);
                break;
            }
        };
        if header.flags != 0 {
            warn!("Unexpected packet flags {:#x}", header.flags);
            break;
        }

        let mut data = vec![0u8; header.length - HEADER_SIZE];
        if let Err(e) = reader.read_exact(&mut data).await {
            warn!("Short read: {}", e);
            break;
        }

        let packet = CommandPacket {
            id: header.id,
            command_set: header.command_set,
            command: header.command,
            data,
        };
        if commands.send(packet).await.is_err() {
            break;
        }
    }
}

async fn write_loop(
    agent: &Arc<Agent>,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    reader_task: &mut JoinHandle<()>,
) -> AgentResult<()> {
    let mut keepalive: watch::Receiver<Option<Duration>> = agent.keepalive.subscribe();

    loop {
        let interval = *keepalive.borrow_and_update();
        let idle = async move {
            match interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => pending().await,
            }
        };

        tokio::select! {
            msg = outgoing.recv() => match msg {
                Some(Outgoing::Packet { bytes, ack }) => {
                    writer.write_all(&bytes).await?;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Some(Outgoing::Close) | None => {
                    debug!("Closing connection");
                    let _ = writer.shutdown().await;
                    return Ok(());
                }
            },
            _ = idle => {
                debug!("Sending keepalive");
                writer.write_all(&keepalive_packet(agent.next_packet_id())).await?;
            }
            changed = keepalive.changed() => {
                if changed.is_ok() {
                    debug!("Keepalive changed to {:?}", *keepalive.borrow());
                }
            }
            _ = &mut *reader_task => {
                return Err(AgentError::ConnectionClosed);
            }
        }
    }
}

/// Composite event packet with no events
fn keepalive_packet(id: u32) -> Vec<u8> {
    let mut packet = CommandPacket::new(id, command_sets::EVENT, event_commands::COMPOSITE);
    packet.data.put_u8(SuspendPolicy::None as u8);
    packet.data.put_i32(0);
    packet.encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::parse_event_packet;

    #[test]
    fn test_keepalive_packet_is_empty_event_set() {
        let bytes = keepalive_packet(7);
        let header = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(header.id, 7);
        assert_eq!(header.command_set, command_sets::EVENT);
        assert_eq!(header.command, event_commands::COMPOSITE);

        let set = parse_event_packet(&bytes[HEADER_SIZE..], ProtocolVersion::CURRENT).unwrap();
        assert_eq!(set.suspend_policy, 0);
        assert!(set.events.is_empty());
    }

    #[test]
    fn test_send_after_close_reports_failure() {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session { outgoing: tx };
        drop(rx);
        assert!(!session.send(vec![1u8]).wait());
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"JDWP-Handshake").await.unwrap();
            let mut buf = vec![0u8; HANDSHAKE.len()];
            stream.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (mut stream, _) = listener.accept().await.unwrap();
        let result = handshake(&mut stream).await;
        assert!(matches!(result, Err(AgentError::InvalidHandshake)));
        assert_eq!(client.await.unwrap(), HANDSHAKE);
    }
}
