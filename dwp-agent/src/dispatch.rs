// Command dispatch loop
//
// Runs on the agent thread. Decodes each command packet into a `Command`,
// hands it to the handler for its set and writes the reply, either at once
// or into the reply buffer while the client has buffering turned on.

use crate::agent::Agent;
use crate::commands::{Command, VmCommand};
use crate::ids::Entities;
use crate::protocol::{CommandPacket, ErrorCode, ReplyPacket};
use crate::transport::SendAck;
use crate::{eventrequest, stackframe, thread, vm};
use bytes::BytesMut;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Replies held before a forced flush
pub(crate) const REPLY_BUFFER_CAPACITY: usize = 128;

/// A command being handled
pub(crate) struct Request<'a> {
    pub id: u32,
    /// Unread part of the command body
    pub body: &'a [u8],
    pub reply: BytesMut,
}

/// What the dispatcher does once a handler succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reply {
    Send,
    /// Someone else replies later (invokes)
    Deferred,
    /// Reply, then end the session
    Dispose,
    /// Reply, then terminate the debuggee
    Exit(i32),
}

pub(crate) type HandlerResult = Result<Reply, ErrorCode>;

/// Encoded replies waiting for STOP_BUFFERING
#[derive(Debug, Default)]
struct ReplyBuffer {
    data: BytesMut,
    count: usize,
}

impl ReplyBuffer {
    fn push(&mut self, reply: &ReplyPacket) {
        reply.encode_into(&mut self.data);
        self.count += 1;
    }

    fn is_full(&self) -> bool {
        self.count >= REPLY_BUFFER_CAPACITY
    }

    fn take(&mut self) -> BytesMut {
        self.count = 0;
        self.data.split()
    }
}

/// Serve one session until its command stream ends or the client disposes
pub(crate) fn run(agent: &Agent, mut commands: mpsc::Receiver<CommandPacket>) {
    let mut buffer: Option<ReplyBuffer> = None;

    while let Some(packet) = commands.blocking_recv() {
        debug!(
            "Received command set={} cmd={} id={}",
            packet.command_set, packet.command, packet.id
        );

        let command = Command::decode(packet.command_set, packet.command);
        let mut req = Request {
            id: packet.id,
            body: &packet.data,
            reply: BytesMut::new(),
        };

        let result = match command {
            Some(command) => agent.handle_command(command, &mut req),
            None => {
                warn!(
                    "Unknown command set={} cmd={}",
                    packet.command_set, packet.command
                );
                Err(ErrorCode::NotImplemented)
            }
        };

        let (error, outcome) = match result {
            Ok(outcome) => (ErrorCode::None, outcome),
            Err(err) => {
                debug!("Command id={} failed: {}", packet.id, err);
                (err, Reply::Send)
            }
        };
        if outcome == Reply::Deferred {
            continue;
        }

        let data = if error == ErrorCode::None {
            req.reply.to_vec()
        } else {
            Vec::new()
        };
        let reply = ReplyPacket::new(packet.id, error, data);

        match command {
            Some(Command::Vm(VmCommand::StartBuffering)) if error == ErrorCode::None => {
                let mut b = buffer.take().unwrap_or_default();
                b.push(&reply);
                buffer = Some(b);
            }
            Some(Command::Vm(VmCommand::StopBuffering)) if buffer.is_some() => {
                if let Some(mut b) = buffer.take() {
                    b.push(&reply);
                    debug!("Flushing {} buffered replies", b.count);
                    agent.send_packet(b.take().freeze());
                }
            }
            _ => match buffer.as_mut() {
                Some(b) => {
                    b.push(&reply);
                    if b.is_full() {
                        agent.send_packet(b.take().freeze());
                    }
                }
                None => {
                    let ack = agent.send_packet(reply.encode());
                    if matches!(outcome, Reply::Exit(_)) {
                        // The client must see the reply before the process goes away
                        ack.wait();
                    }
                }
            },
        }

        match outcome {
            Reply::Dispose => {
                info!("Client disposed the session");
                break;
            }
            Reply::Exit(code) => {
                agent.exit_vm(code);
                break;
            }
            Reply::Send | Reply::Deferred => {}
        }
    }

    if let Some(mut b) = buffer.take() {
        if b.count > 0 {
            agent.send_packet(b.take().freeze());
        }
    }
}

impl Agent {
    fn handle_command(&self, command: Command, req: &mut Request<'_>) -> HandlerResult {
        match command {
            Command::Vm(c) => vm::handle(self, c, req),
            Command::Thread(c) => thread::handle(self, c, req),
            Command::EventRequest(c) => eventrequest::handle(self, c, req),
            Command::StackFrame(c) => stackframe::handle(self, c, req),
            other => {
                let entities = Entities::new(self);
                self.host
                    .handle_command(other, &mut req.body, &mut req.reply, &entities)?;
                Ok(Reply::Send)
            }
        }
    }

    /// Queue raw bytes on the current session
    pub(crate) fn send_packet(&self, bytes: impl Into<bytes::Bytes>) -> SendAck {
        match self.session.lock().as_ref() {
            Some(session) => session.send(bytes),
            None => SendAck::closed(),
        }
    }

    /// Reply to a command whose handler deferred its answer
    pub(crate) fn send_reply(&self, id: u32, result: Result<(), ErrorCode>, data: BytesMut) {
        let reply = match result {
            Ok(()) => ReplyPacket::new(id, ErrorCode::None, data.to_vec()),
            Err(err) => ReplyPacket::new(id, err, Vec::new()),
        };
        self.send_packet(reply.encode());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketHeader, HEADER_SIZE};

    #[test]
    fn test_reply_buffer_concatenates_packets() {
        let mut buffer = ReplyBuffer::default();
        buffer.push(&ReplyPacket::new(1, ErrorCode::None, vec![1, 2]));
        buffer.push(&ReplyPacket::new(2, ErrorCode::NotSuspended, vec![]));
        assert_eq!(buffer.count, 2);

        let data = buffer.take();
        assert_eq!(buffer.count, 0);
        assert_eq!(data.len(), 2 * HEADER_SIZE + 2);

        let first = PacketHeader::decode(&data[..HEADER_SIZE]).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.length, HEADER_SIZE + 2);

        let second = PacketHeader::decode(&data[HEADER_SIZE + 2..]).unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.error_code(), ErrorCode::NotSuspended as u16);
    }

    #[test]
    fn test_reply_buffer_capacity() {
        let mut buffer = ReplyBuffer::default();
        for i in 0..REPLY_BUFFER_CAPACITY {
            assert!(!buffer.is_full());
            buffer.push(&ReplyPacket::new(i as u32, ErrorCode::None, vec![]));
        }
        assert!(buffer.is_full());
    }
}
