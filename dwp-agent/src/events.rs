// DWP event handling
//
// Events travel agent to client as composite packets (set 64, command 100):
// suspend policy, event count, then per event its kind, request id, thread
// and a kind specific payload.

use crate::agent::{Agent, Registry};
use crate::commands::{command_sets, event_commands, event_kinds};
use crate::eventrequest::SuspendPolicy;
use crate::host::RuntimeObject;
use crate::ids::IdKind;
use crate::protocol::{AgentError, AgentResult, CommandPacket, ProtocolVersion};
use crate::reader::{read_i32, read_i64, read_string, read_u8};
use crate::types::*;
use crate::writer::write_string;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventKind {
    VmStart = event_kinds::VM_START,
    VmDeath = event_kinds::VM_DEATH,
    ThreadStart = event_kinds::THREAD_START,
    ThreadDeath = event_kinds::THREAD_DEATH,
    AppDomainCreate = event_kinds::APPDOMAIN_CREATE,
    AppDomainUnload = event_kinds::APPDOMAIN_UNLOAD,
    MethodEntry = event_kinds::METHOD_ENTRY,
    MethodExit = event_kinds::METHOD_EXIT,
    AssemblyLoad = event_kinds::ASSEMBLY_LOAD,
    AssemblyUnload = event_kinds::ASSEMBLY_UNLOAD,
    Breakpoint = event_kinds::BREAKPOINT,
    Step = event_kinds::STEP,
    TypeLoad = event_kinds::TYPE_LOAD,
    Exception = event_kinds::EXCEPTION,
    KeepAlive = event_kinds::KEEPALIVE,
    UserBreak = event_kinds::USER_BREAK,
    UserLog = event_kinds::USER_LOG,
}

impl EventKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        use event_kinds::*;

        Some(match kind {
            VM_START => EventKind::VmStart,
            VM_DEATH => EventKind::VmDeath,
            THREAD_START => EventKind::ThreadStart,
            THREAD_DEATH => EventKind::ThreadDeath,
            APPDOMAIN_CREATE => EventKind::AppDomainCreate,
            APPDOMAIN_UNLOAD => EventKind::AppDomainUnload,
            METHOD_ENTRY => EventKind::MethodEntry,
            METHOD_EXIT => EventKind::MethodExit,
            ASSEMBLY_LOAD => EventKind::AssemblyLoad,
            ASSEMBLY_UNLOAD => EventKind::AssemblyUnload,
            BREAKPOINT => EventKind::Breakpoint,
            STEP => EventKind::Step,
            TYPE_LOAD => EventKind::TypeLoad,
            EXCEPTION => EventKind::Exception,
            KEEPALIVE => EventKind::KeepAlive,
            USER_BREAK => EventKind::UserBreak,
            USER_LOG => EventKind::UserLog,
            _ => return None,
        })
    }
}

/// What happened, as reported by the host
#[derive(Debug, Clone)]
pub enum EventPayload {
    VmStart { domain: DomainRef },
    VmDeath { exit_code: i32 },
    ThreadStart,
    ThreadDeath,
    AppDomainCreate(DomainRef),
    AppDomainUnload(DomainRef),
    MethodEntry(MethodRef),
    MethodExit(MethodRef),
    AssemblyLoad { assembly: AssemblyRef, domain: DomainRef },
    AssemblyUnload { assembly: AssemblyRef, domain: DomainRef },
    Breakpoint { method: MethodRef, il_offset: i64 },
    Step { method: MethodRef, il_offset: i64 },
    TypeLoad { ty: TypeRef, domain: DomainRef },
    Exception { object: Arc<dyn RuntimeObject> },
    KeepAlive,
    UserBreak,
    UserLog { level: i32, category: String, message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::VmStart { .. } => EventKind::VmStart,
            EventPayload::VmDeath { .. } => EventKind::VmDeath,
            EventPayload::ThreadStart => EventKind::ThreadStart,
            EventPayload::ThreadDeath => EventKind::ThreadDeath,
            EventPayload::AppDomainCreate(_) => EventKind::AppDomainCreate,
            EventPayload::AppDomainUnload(_) => EventKind::AppDomainUnload,
            EventPayload::MethodEntry(_) => EventKind::MethodEntry,
            EventPayload::MethodExit(_) => EventKind::MethodExit,
            EventPayload::AssemblyLoad { .. } => EventKind::AssemblyLoad,
            EventPayload::AssemblyUnload { .. } => EventKind::AssemblyUnload,
            EventPayload::Breakpoint { .. } => EventKind::Breakpoint,
            EventPayload::Step { .. } => EventKind::Step,
            EventPayload::TypeLoad { .. } => EventKind::TypeLoad,
            EventPayload::Exception { .. } => EventKind::Exception,
            EventPayload::KeepAlive => EventKind::KeepAlive,
            EventPayload::UserBreak => EventKind::UserBreak,
            EventPayload::UserLog { .. } => EventKind::UserLog,
        }
    }
}

/// An occurrence together with the requests it matched
#[derive(Debug, Clone)]
pub(crate) struct PendingEvent {
    pub payload: EventPayload,
    pub requests: Vec<RequestId>,
    pub policy: SuspendPolicy,
}

impl Agent {
    /// Build the composite packet for one occurrence
    pub(crate) fn encode_event_packet(
        &self,
        reg: &mut Registry,
        event: &PendingEvent,
        thread: Option<ThreadRef>,
        pin: bool,
    ) -> Vec<u8> {
        let version = self.protocol_version();
        let kind = event.payload.kind();

        let thread_id = thread
            .and_then(|t| reg.threads.get(&t).map(|tls| Arc::clone(&tls.object)))
            .map(|obj| reg.ids.object_id(&obj, pin))
            .unwrap_or(0);

        let mut packet = CommandPacket::new(
            self.next_packet_id(),
            command_sets::EVENT,
            event_commands::COMPOSITE,
        );
        let buf = &mut packet.data;
        buf.put_u8(event.policy as u8);
        buf.put_i32(event.requests.len() as i32);

        for request in &event.requests {
            buf.put_u8(kind as u8);
            buf.put_i32(*request);
            buf.put_i32(thread_id);

            match &event.payload {
                EventPayload::VmStart { domain }
                | EventPayload::AppDomainCreate(domain)
                | EventPayload::AppDomainUnload(domain) => {
                    buf.put_i32(reg.ids.get_id(IdKind::Domain, *domain, domain.0));
                }
                EventPayload::VmDeath { exit_code } => {
                    if version.at_least(2, 27) {
                        buf.put_i32(*exit_code);
                    }
                }
                EventPayload::MethodEntry(method) | EventPayload::MethodExit(method) => {
                    buf.put_i32(self.method_id_in(reg, *method));
                }
                EventPayload::AssemblyLoad { assembly, domain }
                | EventPayload::AssemblyUnload { assembly, domain } => {
                    buf.put_i32(reg.ids.get_id(IdKind::Assembly, *domain, assembly.0));
                }
                EventPayload::Breakpoint { method, il_offset }
                | EventPayload::Step { method, il_offset } => {
                    buf.put_i32(self.method_id_in(reg, *method));
                    buf.put_i64(*il_offset);
                }
                EventPayload::TypeLoad { ty, domain } => {
                    buf.put_i32(reg.ids.get_id(IdKind::Type, *domain, ty.0));
                }
                EventPayload::Exception { object } => {
                    buf.put_i32(reg.ids.object_id(object, pin));
                }
                EventPayload::UserLog {
                    level,
                    category,
                    message,
                } => {
                    buf.put_i32(*level);
                    write_string(buf, category);
                    write_string(buf, message);
                }
                EventPayload::ThreadStart
                | EventPayload::ThreadDeath
                | EventPayload::KeepAlive
                | EventPayload::UserBreak => {}
            }
        }

        packet.encode()
    }

    /// Send an event and suspend as its policy demands.
    ///
    /// The packet is on the wire before this thread parks. Must be called with
    /// no locks held since it may not return until the client resumes.
    pub(crate) fn process_event(
        &self,
        mut event: PendingEvent,
        thread: Option<ThreadRef>,
        ctx: Option<&ThreadContext>,
    ) {
        let kind = event.payload.kind();

        if event.requests.is_empty() && kind != EventKind::KeepAlive {
            return;
        }

        {
            let lifecycle = self.lifecycle.lock();
            if lifecycle.vm_death_sent {
                trace!("VM is dead, dropping {:?}", kind);
                return;
            }
            if !lifecycle.vm_start_sent && kind != EventKind::VmStart {
                trace!("VM not started yet, dropping {:?}", kind);
                return;
            }
        }

        if kind == EventKind::VmStart {
            event.policy = if self.config.suspend && !self.config.defer {
                SuspendPolicy::All
            } else {
                SuspendPolicy::None
            };
        }
        if kind == EventKind::VmDeath {
            event.policy = SuspendPolicy::None;
        }

        if self.is_agent_thread() {
            // Only deferred attach replays events from the agent thread
            if self.config.defer || kind == EventKind::VmDeath || kind == EventKind::VmStart {
                event.policy = SuspendPolicy::None;
            } else {
                return;
            }
        }

        let suspend = event.policy != SuspendPolicy::None && thread.is_some();

        let ack = {
            let session = self.session.lock();
            let Some(session) = session.as_ref() else {
                trace!("No client attached, dropping {:?}", kind);
                return;
            };

            if suspend {
                if let (Some(t), Some(ctx)) = (thread, ctx) {
                    if let Some(tls) = self.registry.lock().threads.get_mut(&t) {
                        tls.save_context(ctx.clone());
                    }
                }
                self.suspend_vm(thread);
            }

            let bytes = {
                let mut reg = self.registry.lock();
                self.encode_event_packet(&mut reg, &event, thread, suspend)
            };

            info!(
                "Sending {:?} event for {} requests, policy {:?}",
                kind,
                event.requests.len(),
                event.policy
            );
            session.send(bytes)
        };

        {
            let mut lifecycle = self.lifecycle.lock();
            match kind {
                EventKind::VmStart => lifecycle.vm_start_sent = true,
                EventKind::VmDeath => lifecycle.vm_death_sent = true,
                _ => {}
            }
        }

        if !ack.wait() {
            // The session died; disposal undoes our suspension
            warn!("Failed to send {:?} event", kind);
            return;
        }

        if suspend {
            if let Some(t) = thread {
                debug!("Suspending {:?} after {:?} event", t, kind);
                self.suspend_current(t);
            }
        }
    }
}

/// Composite event packet as seen by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSet {
    pub suspend_policy: u8,
    pub events: Vec<Event>,
}

/// Single event within an event set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: u8,
    pub request_id: RequestId,
    pub thread: ObjectId,
    pub details: EventDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventDetails {
    VmStart { domain: EntityId },
    VmDeath { exit_code: Option<i32> },
    ThreadStart,
    ThreadDeath,
    AppDomain { domain: EntityId },
    Method { method: EntityId },
    Assembly { assembly: EntityId },
    Location { method: EntityId, il_offset: i64 },
    TypeLoad { ty: EntityId },
    Exception { exception: ObjectId },
    KeepAlive,
    UserBreak,
    UserLog { level: i32, category: String, message: String },
}

/// Parse the body of a composite event packet
pub fn parse_event_packet(mut data: &[u8], version: ProtocolVersion) -> AgentResult<EventSet> {
    let buf = &mut data;
    let suspend_policy = read_u8(buf)?;
    let count = read_i32(buf)?;

    let mut events = Vec::new();
    for _ in 0..count {
        let kind_byte = read_u8(buf)?;
        let kind = EventKind::from_u8(kind_byte)
            .ok_or_else(|| AgentError::Protocol(format!("Unknown event kind {}", kind_byte)))?;
        let request_id = read_i32(buf)?;
        let thread = read_i32(buf)?;

        let details = match kind {
            EventKind::VmStart => EventDetails::VmStart {
                domain: read_i32(buf)?,
            },
            EventKind::VmDeath => EventDetails::VmDeath {
                exit_code: if version.at_least(2, 27) {
                    Some(read_i32(buf)?)
                } else {
                    None
                },
            },
            EventKind::ThreadStart => EventDetails::ThreadStart,
            EventKind::ThreadDeath => EventDetails::ThreadDeath,
            EventKind::AppDomainCreate | EventKind::AppDomainUnload => EventDetails::AppDomain {
                domain: read_i32(buf)?,
            },
            EventKind::MethodEntry | EventKind::MethodExit => EventDetails::Method {
                method: read_i32(buf)?,
            },
            EventKind::AssemblyLoad | EventKind::AssemblyUnload => EventDetails::Assembly {
                assembly: read_i32(buf)?,
            },
            EventKind::Breakpoint | EventKind::Step => EventDetails::Location {
                method: read_i32(buf)?,
                il_offset: read_i64(buf)?,
            },
            EventKind::TypeLoad => EventDetails::TypeLoad { ty: read_i32(buf)? },
            EventKind::Exception => EventDetails::Exception {
                exception: read_i32(buf)?,
            },
            EventKind::KeepAlive => EventDetails::KeepAlive,
            EventKind::UserBreak => EventDetails::UserBreak,
            EventKind::UserLog => EventDetails::UserLog {
                level: read_i32(buf)?,
                category: read_string(buf)?,
                message: read_string(buf)?,
            },
        };

        events.push(Event {
            kind: kind_byte,
            request_id,
            thread,
            details,
        });
    }

    Ok(EventSet {
        suspend_policy,
        events,
    })
}
