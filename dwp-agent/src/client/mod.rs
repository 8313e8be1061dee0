// Debugger client
//
// The other end of the wire: connects to an agent listening in server mode,
// or accepts an agent started with server=n, and speaks the protocol with
// typed helpers for the commands the agent core answers itself.

pub mod eventloop;

use crate::commands::{
    command_sets, event_request_commands, modifier_kinds, stack_frame_commands, thread_commands,
    vm_commands,
};
use crate::eventrequest::SuspendPolicy;
use crate::events::{EventKind, EventSet};
use crate::protocol::*;
use crate::reader::{read_i32, read_string, read_u8};
use crate::step::{StepDepth, StepFilter, StepSize};
use crate::types::{EntityId, FrameId, ObjectId, RequestId};
use crate::writer::write_string;
use bytes::BufMut;
use eventloop::{spawn_event_loop, EventLoopHandle};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentVersion {
    pub name: String,
    pub major: i32,
    pub minor: i32,
}

/// A frame from THREAD.GET_FRAME_INFO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSummary {
    pub id: FrameId,
    pub method: EntityId,
    pub il_offset: i32,
    pub flags: u8,
}

/// Event request modifier in wire form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestModifier {
    Count(i32),
    ThreadOnly(ObjectId),
    LocationOnly {
        method: EntityId,
        il_offset: i64,
    },
    /// `class` 0 matches every exception
    ExceptionOnly {
        class: EntityId,
        caught: bool,
        uncaught: bool,
        subclasses: bool,
        not_filtered_feature: bool,
        everything_else: bool,
    },
    Step {
        thread: ObjectId,
        size: StepSize,
        depth: StepDepth,
        filter: StepFilter,
    },
    AssemblyOnly(Vec<EntityId>),
    SourceFileOnly {
        files: Vec<String>,
        ignore_case: bool,
    },
    TypeNameOnly(Vec<String>),
}

impl RequestModifier {
    /// Append the modifier as a client speaking `version` would
    pub fn encode(&self, buf: &mut Vec<u8>, version: ProtocolVersion) {
        match self {
            RequestModifier::Count(count) => {
                buf.put_u8(modifier_kinds::COUNT);
                buf.put_i32(*count);
            }
            RequestModifier::ThreadOnly(thread) => {
                buf.put_u8(modifier_kinds::THREAD_ONLY);
                buf.put_i32(*thread);
            }
            RequestModifier::LocationOnly { method, il_offset } => {
                buf.put_u8(modifier_kinds::LOCATION_ONLY);
                buf.put_i32(*method);
                buf.put_i64(*il_offset);
            }
            RequestModifier::ExceptionOnly {
                class,
                caught,
                uncaught,
                subclasses,
                not_filtered_feature,
                everything_else,
            } => {
                buf.put_u8(modifier_kinds::EXCEPTION_ONLY);
                buf.put_i32(*class);
                buf.put_u8(*caught as u8);
                buf.put_u8(*uncaught as u8);
                if version.at_least(2, 25) {
                    buf.put_u8(*subclasses as u8);
                }
                if version.at_least(2, 54) {
                    buf.put_u8(*not_filtered_feature as u8);
                    buf.put_u8(*everything_else as u8);
                }
            }
            RequestModifier::Step {
                thread,
                size,
                depth,
                filter,
            } => {
                buf.put_u8(modifier_kinds::STEP);
                buf.put_i32(*thread);
                buf.put_i32(*size as i32);
                buf.put_i32(*depth as i32);
                if version.at_least(2, 16) {
                    buf.put_i32(filter.0 as i32);
                }
            }
            RequestModifier::AssemblyOnly(assemblies) => {
                buf.put_u8(modifier_kinds::ASSEMBLY_ONLY);
                buf.put_i32(assemblies.len() as i32);
                for assembly in assemblies {
                    buf.put_i32(*assembly);
                }
            }
            RequestModifier::SourceFileOnly { files, ignore_case } => {
                buf.put_u8(modifier_kinds::SOURCE_FILE_ONLY);
                buf.put_i32(files.len() as i32);
                for file in files {
                    write_string(buf, file);
                }
                if version.at_least(2, 58) {
                    buf.put_u8(*ignore_case as u8);
                }
            }
            RequestModifier::TypeNameOnly(names) => {
                buf.put_u8(modifier_kinds::TYPE_NAME_ONLY);
                buf.put_i32(names.len() as i32);
                for name in names {
                    write_string(buf, name);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct DebuggerClient {
    event_loop: EventLoopHandle,
    next_id: Arc<AtomicU32>,
    version: Arc<Mutex<ProtocolVersion>>,
}

impl DebuggerClient {
    /// Connect to an agent listening in server mode
    pub async fn connect(addr: impl ToSocketAddrs) -> AgentResult<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        info!("Connected to agent at {}", stream.peer_addr()?);
        Self::handshake(&mut stream).await?;
        Ok(Self::start(stream))
    }

    /// Wait for an agent started in client mode to connect
    pub async fn accept(listener: &TcpListener) -> AgentResult<Self> {
        let (mut stream, peer) = listener.accept().await?;
        info!("Agent connected from {}", peer);
        Self::handshake(&mut stream).await?;
        Ok(Self::start(stream))
    }

    fn start(stream: TcpStream) -> Self {
        let version = Arc::new(Mutex::new(ProtocolVersion::CURRENT));
        let (reader, writer) = stream.into_split();
        let event_loop = spawn_event_loop(reader, writer, Arc::clone(&version));

        Self {
            event_loop,
            next_id: Arc::new(AtomicU32::new(1)),
            version,
        }
    }

    async fn handshake(stream: &mut TcpStream) -> AgentResult<()> {
        debug!("Performing handshake");
        stream.set_nodelay(true)?;
        stream.write_all(HANDSHAKE).await?;
        stream.flush().await?;

        let mut buf = vec![0u8; HANDSHAKE.len()];
        stream.read_exact(&mut buf).await?;

        if buf != HANDSHAKE {
            warn!("Invalid handshake response: {:?}", buf);
            return Err(AgentError::InvalidHandshake);
        }

        info!("Handshake successful");
        Ok(())
    }

    pub fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Version used to encode modifiers and decode events
    pub fn protocol_version(&self) -> ProtocolVersion {
        *self.version.lock()
    }

    /// Send a command and wait for its reply, whatever its error code
    pub async fn send_command(&self, packet: CommandPacket) -> AgentResult<ReplyPacket> {
        debug!(
            "Sending command set={} cmd={} id={}",
            packet.command_set, packet.command, packet.id
        );
        self.event_loop.send_command(packet).await
    }

    /// Send a command and return the reply body, failing on an error code
    pub async fn command(&self, command_set: u8, command: u8, data: Vec<u8>) -> AgentResult<Vec<u8>> {
        let mut packet = CommandPacket::new(self.next_id(), command_set, command);
        packet.data = data;
        let reply = self.send_command(packet).await?;
        reply.check_error()?;
        Ok(reply.data)
    }

    pub async fn try_recv_event(&self) -> Option<EventSet> {
        self.event_loop.try_recv_event().await
    }

    pub async fn recv_event(&self) -> Option<EventSet> {
        self.event_loop.recv_event().await
    }

    /// Next event set, skipping keepalives
    pub async fn recv_event_timeout(&self, timeout: Duration) -> AgentResult<EventSet> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let set = tokio::time::timeout_at(deadline, self.recv_event())
                .await
                .map_err(|_| AgentError::Protocol("Timed out waiting for an event".to_string()))?
                .ok_or(AgentError::ConnectionClosed)?;
            if !set.events.is_empty() {
                return Ok(set);
            }
        }
    }

    pub async fn version(&self) -> AgentResult<AgentVersion> {
        let data = self.command(command_sets::VM, vm_commands::VERSION, Vec::new()).await?;
        let mut buf = data.as_slice();
        Ok(AgentVersion {
            name: read_string(&mut buf)?,
            major: read_i32(&mut buf)?,
            minor: read_i32(&mut buf)?,
        })
    }

    pub async fn set_protocol_version(&self, major: u32, minor: u32) -> AgentResult<()> {
        let mut data = Vec::new();
        data.put_i32(major as i32);
        data.put_i32(minor as i32);
        self.command(command_sets::VM, vm_commands::SET_PROTOCOL_VERSION, data)
            .await?;
        *self.version.lock() = ProtocolVersion::new(major, minor);
        Ok(())
    }

    pub async fn all_threads(&self) -> AgentResult<Vec<ObjectId>> {
        let data = self
            .command(command_sets::VM, vm_commands::ALL_THREADS, Vec::new())
            .await?;
        let mut buf = data.as_slice();
        let count = read_i32(&mut buf)?;
        (0..count).map(|_| read_i32(&mut buf)).collect()
    }

    pub async fn suspend(&self) -> AgentResult<()> {
        self.command(command_sets::VM, vm_commands::SUSPEND, Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn resume(&self) -> AgentResult<()> {
        self.command(command_sets::VM, vm_commands::RESUME, Vec::new())
            .await
            .map(|_| ())
    }

    pub async fn set_keepalive(&self, interval: Option<Duration>) -> AgentResult<()> {
        let mut data = Vec::new();
        data.put_i32(interval.map(|d| d.as_millis() as i32).unwrap_or(0));
        self.command(command_sets::VM, vm_commands::SET_KEEPALIVE, data)
            .await
            .map(|_| ())
    }

    pub async fn exit(&self, code: i32) -> AgentResult<()> {
        let mut data = Vec::new();
        data.put_i32(code);
        self.command(command_sets::VM, vm_commands::EXIT, data)
            .await
            .map(|_| ())
    }

    pub async fn dispose(&self) -> AgentResult<()> {
        self.command(command_sets::VM, vm_commands::DISPOSE, Vec::new())
            .await
            .map(|_| ())
    }

    /// Ask for an event, returning the request id
    pub async fn set_request(
        &self,
        kind: EventKind,
        policy: SuspendPolicy,
        modifiers: &[RequestModifier],
    ) -> AgentResult<RequestId> {
        let version = self.protocol_version();
        let mut data = Vec::new();
        data.put_u8(kind as u8);
        data.put_u8(policy as u8);
        data.put_u8(modifiers.len() as u8);
        for modifier in modifiers {
            modifier.encode(&mut data, version);
        }

        let reply = self
            .command(command_sets::EVENT_REQUEST, event_request_commands::SET, data)
            .await?;
        Ok(read_i32(&mut reply.as_slice())?)
    }

    pub async fn set_breakpoint(&self, method: EntityId, il_offset: i64, policy: SuspendPolicy) -> AgentResult<RequestId> {
        self.set_request(
            EventKind::Breakpoint,
            policy,
            &[RequestModifier::LocationOnly { method, il_offset }],
        )
        .await
    }

    pub async fn step(
        &self,
        thread: ObjectId,
        size: StepSize,
        depth: StepDepth,
        policy: SuspendPolicy,
    ) -> AgentResult<RequestId> {
        self.set_request(
            EventKind::Step,
            policy,
            &[RequestModifier::Step {
                thread,
                size,
                depth,
                filter: StepFilter::default(),
            }],
        )
        .await
    }

    pub async fn clear_request(&self, kind: EventKind, id: RequestId) -> AgentResult<()> {
        let mut data = Vec::new();
        data.put_u8(kind as u8);
        data.put_i32(id);
        self.command(command_sets::EVENT_REQUEST, event_request_commands::CLEAR, data)
            .await
            .map(|_| ())
    }

    pub async fn clear_all_breakpoints(&self) -> AgentResult<()> {
        self.command(
            command_sets::EVENT_REQUEST,
            event_request_commands::CLEAR_ALL_BREAKPOINTS,
            Vec::new(),
        )
        .await
        .map(|_| ())
    }

    /// Frames of a suspended thread, innermost first
    pub async fn frames(&self, thread: ObjectId) -> AgentResult<Vec<FrameSummary>> {
        let mut data = Vec::new();
        data.put_i32(thread);
        data.put_i32(0);
        data.put_i32(-1);
        let reply = self
            .command(command_sets::THREAD, thread_commands::GET_FRAME_INFO, data)
            .await?;

        let mut buf = reply.as_slice();
        let count = read_i32(&mut buf)?;
        let mut frames = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            frames.push(FrameSummary {
                id: read_i32(&mut buf)?,
                method: read_i32(&mut buf)?,
                il_offset: read_i32(&mut buf)?,
                flags: read_u8(&mut buf)?,
            });
        }
        Ok(frames)
    }

    pub async fn thread_name(&self, thread: ObjectId) -> AgentResult<String> {
        let mut data = Vec::new();
        data.put_i32(thread);
        let reply = self
            .command(command_sets::THREAD, thread_commands::GET_NAME, data)
            .await?;
        read_string(&mut reply.as_slice())
    }

    pub async fn frame_domain(&self, thread: ObjectId, frame: FrameId) -> AgentResult<EntityId> {
        let mut data = Vec::new();
        data.put_i32(thread);
        data.put_i32(frame);
        let reply = self
            .command(command_sets::STACK_FRAME, stack_frame_commands::GET_DOMAIN, data)
            .await?;
        Ok(read_i32(&mut reply.as_slice())?)
    }

    /// Invoke a method on a suspended thread. The body after the thread id
    /// and flags is host specific.
    pub async fn invoke_method(&self, thread: ObjectId, flags: u32, body: &[u8]) -> AgentResult<ReplyPacket> {
        let mut packet = CommandPacket::new(self.next_id(), command_sets::VM, vm_commands::INVOKE_METHOD);
        packet.data.put_i32(thread);
        packet.data.put_u32(flags);
        packet.data.extend_from_slice(body);
        self.send_command(packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modifier_encoding_follows_version() {
        let modifier = RequestModifier::ExceptionOnly {
            class: 0,
            caught: true,
            uncaught: false,
            subclasses: true,
            not_filtered_feature: false,
            everything_else: false,
        };

        let mut old = Vec::new();
        modifier.encode(&mut old, ProtocolVersion::new(2, 20));
        assert_eq!(old, vec![modifier_kinds::EXCEPTION_ONLY, 0, 0, 0, 0, 1, 0]);

        let mut current = Vec::new();
        modifier.encode(&mut current, ProtocolVersion::CURRENT);
        assert_eq!(current.len(), old.len() + 3);
    }

    #[test]
    fn test_step_modifier_layout() {
        let mut buf = Vec::new();
        RequestModifier::Step {
            thread: 7,
            size: StepSize::Line,
            depth: StepDepth::Over,
            filter: StepFilter(StepFilter::HIDDEN),
        }
        .encode(&mut buf, ProtocolVersion::CURRENT);

        assert_eq!(buf[0], modifier_kinds::STEP);
        assert_eq!(&buf[1..5], &7i32.to_be_bytes());
        assert_eq!(&buf[5..9], &1i32.to_be_bytes());
        assert_eq!(&buf[9..13], &1i32.to_be_bytes());
        assert_eq!(&buf[13..17], &2i32.to_be_bytes());
    }
}
