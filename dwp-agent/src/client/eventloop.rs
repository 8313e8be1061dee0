// Client event loop
//
// Owns the socket of a debugger client. Outgoing commands are written as
// they arrive; incoming replies are routed to the command waiting for them
// by packet id and composite event packets are decoded onto the event
// channel.

use crate::commands::{command_sets, event_commands};
use crate::events::{parse_event_packet, EventSet};
use crate::protocol::{
    AgentError, AgentResult, CommandPacket, PacketHeader, ProtocolVersion, ReplyPacket, HEADER_SIZE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Event sets buffered before the loop starts dropping them
const EVENT_QUEUE_DEPTH: usize = 256;

pub struct CommandRequest {
    pub packet: CommandPacket,
    pub reply_tx: oneshot::Sender<AgentResult<ReplyPacket>>,
}

/// Handle to the event loop for sending commands and receiving events
#[derive(Clone, Debug)]
pub struct EventLoopHandle {
    command_tx: mpsc::Sender<CommandRequest>,
    event_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<EventSet>>>,
}

impl EventLoopHandle {
    pub async fn send_command(&self, packet: CommandPacket) -> AgentResult<ReplyPacket> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(CommandRequest { packet, reply_tx })
            .await
            .map_err(|_| AgentError::ConnectionClosed)?;

        reply_rx.await.map_err(|_| AgentError::ConnectionClosed)?
    }

    pub async fn try_recv_event(&self) -> Option<EventSet> {
        let mut rx = self.event_rx.lock().await;
        rx.try_recv().ok()
    }

    pub async fn recv_event(&self) -> Option<EventSet> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }
}

/// Start the event loop task. `version` decides how version gated event
/// fields are decoded.
pub fn spawn_event_loop(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    version: Arc<Mutex<ProtocolVersion>>,
) -> EventLoopHandle {
    let (command_tx, command_rx) = mpsc::channel(32);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (packet_tx, packet_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

    // Reads stay out of the select below, a half read packet must not be dropped
    tokio::spawn(read_packets(reader, packet_tx));
    tokio::spawn(event_loop_task(writer, command_rx, packet_rx, event_tx, version));

    EventLoopHandle {
        command_tx,
        event_rx: Arc::new(tokio::sync::Mutex::new(event_rx)),
    }
}

async fn event_loop_task(
    mut writer: OwnedWriteHalf,
    mut command_rx: mpsc::Receiver<CommandRequest>,
    mut packet_rx: mpsc::Receiver<(PacketHeader, Vec<u8>)>,
    event_tx: mpsc::Sender<EventSet>,
    version: Arc<Mutex<ProtocolVersion>>,
) {
    info!("Client event loop started");

    let mut pending_replies: HashMap<u32, oneshot::Sender<AgentResult<ReplyPacket>>> =
        HashMap::new();

    loop {
        tokio::select! {
            Some(cmd) = command_rx.recv() => {
                let packet_id = cmd.packet.id;
                debug!("Sending command id={}", packet_id);

                let encoded = cmd.packet.encode();
                if let Err(e) = writer.write_all(&encoded).await {
                    error!("Failed to write command: {}", e);
                    cmd.reply_tx.send(Err(AgentError::Io(e))).ok();
                    continue;
                }

                pending_replies.insert(packet_id, cmd.reply_tx);
            }

            packet = packet_rx.recv() => {
                let Some((header, data)) = packet else {
                    break;
                };

                if header.is_reply() {
                    match pending_replies.remove(&header.id) {
                        Some(tx) => {
                            tx.send(ReplyPacket::decode(&data)).ok();
                        }
                        None => warn!("Received reply for unknown command id={}", header.id),
                    }
                    continue;
                }

                if header.command_set != command_sets::EVENT || header.command != event_commands::COMPOSITE {
                    warn!("Ignoring command set={} cmd={} from agent", header.command_set, header.command);
                    continue;
                }

                let version = *version.lock();
                match parse_event_packet(&data[HEADER_SIZE..], version) {
                    Ok(event_set) => {
                        debug!("Event set: {} events, suspend_policy={}",
                               event_set.events.len(), event_set.suspend_policy);
                        match event_tx.try_send(event_set) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(set)) => {
                                error!("Event channel full, dropping set with {} events", set.events.len());
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                warn!("Event receiver dropped");
                            }
                        }
                    }
                    Err(e) => warn!("Failed to parse event: {}", e),
                }
            }
        }
    }

    // Anyone still waiting learns the connection is gone
    for (_, tx) in pending_replies.drain() {
        tx.send(Err(AgentError::ConnectionClosed)).ok();
    }
    info!("Client event loop shutting down");
}

async fn read_packets(mut reader: OwnedReadHalf, packets: mpsc::Sender<(PacketHeader, Vec<u8>)>) {
    loop {
        match read_packet(&mut reader).await {
            Ok(packet) => {
                if packets.send(packet).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Connection closed: {}", e);
                break;
            }
        }
    }
}

/// Read one whole packet, header included
async fn read_packet(reader: &mut OwnedReadHalf) -> AgentResult<(PacketHeader, Vec<u8>)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = PacketHeader::decode(&header_buf)?;

    let mut packet = header_buf.to_vec();
    packet.resize(header.length, 0);
    reader.read_exact(&mut packet[HEADER_SIZE..]).await?;

    Ok((header, packet))
}
