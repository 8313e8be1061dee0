// EventRequest command implementations
//
// Clients subscribe to events with SET (kind, suspend policy, modifiers) and
// drop subscriptions with CLEAR. Breakpoint, step and method entry/exit
// requests each own a backing object in the breakpoint or step tables.

use crate::agent::{Agent, Registry};
use crate::breakpoint::{hook_offset, BreakpointId};
use crate::commands::{modifier_kinds, EventRequestCommand};
use crate::dispatch::{HandlerResult, Reply, Request};
use crate::events::{EventKind, EventPayload};
use crate::filter::EventInfo;
use crate::host::Host;
use crate::protocol::{ErrorCode, ProtocolVersion};
use crate::reader::{read_count, read_i32, read_i64, read_string, read_u8};
use crate::step::{StepDepth, StepFilter, StepSize};
use crate::types::*;
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Suspend policy for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SuspendPolicy {
    None = 0,
    EventThread = 1,
    All = 2,
}

impl SuspendPolicy {
    pub fn from_u8(policy: u8) -> Option<Self> {
        match policy {
            0 => Some(SuspendPolicy::None),
            1 => Some(SuspendPolicy::EventThread),
            2 => Some(SuspendPolicy::All),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionFilter {
    /// None matches every exception class
    pub class: Option<TypeRef>,
    pub caught: bool,
    pub uncaught: bool,
    pub subclasses: bool,
    /// Selects the explicit-fallback matching scheme
    pub not_filtered_feature: bool,
    /// Fallback request, only used when no class specific request matched
    pub everything_else: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    /// Fire on the nth occurrence only
    Count(u32),
    ThreadOnly(ThreadRef),
    LocationOnly { method: MethodRef, il_offset: i64 },
    ExceptionOnly(ExceptionFilter),
    Step {
        thread: ThreadRef,
        size: StepSize,
        depth: StepDepth,
        filter: StepFilter,
    },
    AssemblyOnly(Vec<AssemblyRef>),
    SourceFileOnly { files: Vec<String>, ignore_case: bool },
    TypeNameOnly(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct EventRequest {
    pub id: RequestId,
    pub kind: EventKind,
    pub policy: SuspendPolicy,
    pub modifiers: Vec<Modifier>,
    /// Backing breakpoint for BREAKPOINT and METHOD_ENTRY/EXIT requests
    pub breakpoint: Option<BreakpointId>,
}

impl EventRequest {
    pub fn location(&self) -> Option<(MethodRef, i64)> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::LocationOnly { method, il_offset } => Some((*method, *il_offset)),
            _ => None,
        })
    }

    pub fn step(&self) -> Option<(ThreadRef, StepSize, StepDepth, StepFilter)> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::Step {
                thread,
                size,
                depth,
                filter,
            } => Some((*thread, *size, *depth, *filter)),
            _ => None,
        })
    }
}

/// A COUNT of zero would never fire
fn read_occurrence_count(buf: &mut &[u8]) -> Result<u32, ErrorCode> {
    let count = read_i32(buf)?;
    if count <= 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    Ok(count as u32)
}

/// Decode one modifier, resolving the ids it references
fn read_modifier(agent: &Agent, buf: &mut &[u8], version: ProtocolVersion) -> Result<Modifier, ErrorCode> {
    let kind = read_u8(buf)?;
    let modifier = match kind {
        modifier_kinds::COUNT => Modifier::Count(read_occurrence_count(buf)?),
        modifier_kinds::THREAD_ONLY => Modifier::ThreadOnly(agent.decode_thread(buf)?),
        modifier_kinds::LOCATION_ONLY => {
            let method = agent.decode_method(buf)?;
            let il_offset = read_i64(buf)?;
            Modifier::LocationOnly { method, il_offset }
        }
        modifier_kinds::EXCEPTION_ONLY => {
            let class = agent.decode_optional_type(buf)?;
            let caught = read_u8(buf)? != 0;
            let uncaught = read_u8(buf)? != 0;
            let subclasses = if version.at_least(2, 25) {
                read_u8(buf)? != 0
            } else {
                true
            };
            let (not_filtered_feature, everything_else) = if version.at_least(2, 54) {
                (read_u8(buf)? != 0, read_u8(buf)? != 0)
            } else {
                (false, false)
            };
            Modifier::ExceptionOnly(ExceptionFilter {
                class,
                caught,
                uncaught,
                subclasses,
                not_filtered_feature,
                everything_else,
            })
        }
        modifier_kinds::STEP => {
            let thread = agent.decode_thread(buf)?;
            let size = StepSize::from_i32(read_i32(buf)?).ok_or(ErrorCode::InvalidArgument)?;
            let depth = StepDepth::from_i32(read_i32(buf)?).ok_or(ErrorCode::InvalidArgument)?;
            let mut filter = if version.at_least(2, 16) {
                StepFilter(read_i32(buf)? as u32)
            } else {
                StepFilter::default()
            };
            if !version.at_least(2, 26) && filter.contains(StepFilter::HIDDEN) {
                filter = StepFilter(filter.0 | StepFilter::STEP_THROUGH);
            }
            Modifier::Step {
                thread,
                size,
                depth,
                filter,
            }
        }
        modifier_kinds::ASSEMBLY_ONLY => {
            let n = read_count(buf)?;
            let mut assemblies = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                assemblies.push(agent.decode_assembly(buf)?);
            }
            Modifier::AssemblyOnly(assemblies)
        }
        modifier_kinds::SOURCE_FILE_ONLY => {
            let n = read_count(buf)?;
            let mut files = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                files.push(read_string(buf)?);
            }
            let ignore_case = if version.at_least(2, 58) {
                read_u8(buf)? != 0
            } else {
                true
            };
            if ignore_case {
                files = files.into_iter().map(|f| f.to_lowercase()).collect();
            }
            Modifier::SourceFileOnly { files, ignore_case }
        }
        modifier_kinds::TYPE_NAME_ONLY => {
            let n = read_count(buf)?;
            let mut names = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                names.push(read_string(buf)?);
            }
            Modifier::TypeNameOnly(names)
        }
        other => {
            debug!("Unsupported modifier kind {}", other);
            return Err(ErrorCode::NotImplemented);
        }
    };
    Ok(modifier)
}

pub(crate) fn handle(agent: &Agent, command: EventRequestCommand, req: &mut Request<'_>) -> HandlerResult {
    match command {
        EventRequestCommand::Set => set(agent, req),
        EventRequestCommand::Clear => {
            let kind = read_u8(&mut req.body)?;
            let id = read_i32(&mut req.body)?;
            let mut reg = agent.registry.lock();
            let matches = reg
                .requests
                .iter()
                .any(|r| r.id == id && r.kind as u8 == kind);
            if matches {
                reg.remove_request(&*agent.host, id);
                debug!("Cleared event request {}", id);
            }
            Ok(Reply::Send)
        }
        EventRequestCommand::ClearAllBreakpoints => {
            let mut reg = agent.registry.lock();
            let ids: Vec<RequestId> = reg
                .requests
                .iter()
                .filter(|r| r.kind == EventKind::Breakpoint)
                .map(|r| r.id)
                .collect();
            for id in &ids {
                reg.remove_request(&*agent.host, *id);
            }
            debug!("Cleared {} breakpoint requests", ids.len());
            Ok(Reply::Send)
        }
    }
}

/// EventRequest.SET: kind, policy, modifier count, modifiers
fn set(agent: &Agent, req: &mut Request<'_>) -> HandlerResult {
    let version = agent.protocol_version();

    let kind = read_u8(&mut req.body)?;
    let kind = EventKind::from_u8(kind).ok_or(ErrorCode::NotImplemented)?;
    let policy = SuspendPolicy::from_u8(read_u8(&mut req.body)?).ok_or(ErrorCode::InvalidArgument)?;
    let nmodifiers = read_u8(&mut req.body)?;

    let mut modifiers = Vec::with_capacity(nmodifiers as usize);
    for _ in 0..nmodifiers {
        modifiers.push(read_modifier(agent, &mut req.body, version)?);
    }

    let mut request = EventRequest {
        id: 0,
        kind,
        policy,
        modifiers,
        breakpoint: None,
    };

    // Steps take the registry lock themselves, and may wait for the suspension
    let id = if kind == EventKind::Step {
        let (thread, size, depth, filter) = request.step().ok_or(ErrorCode::InvalidArgument)?;
        let id = agent.registry.lock().next_request_id();
        request.id = id;
        agent.ss_create(thread, size, depth, filter, id)?;
        agent.registry.lock().requests.push(request);
        id
    } else {
        let mut reg = agent.registry.lock();
        let id = reg.next_request_id();
        request.id = id;

        match kind {
            EventKind::Breakpoint => {
                let (method, il_offset) = request.location().ok_or(ErrorCode::InvalidArgument)?;
                let bp = reg
                    .breakpoints
                    .set(&*agent.host, Some(method), il_offset, id, kind)?;
                request.breakpoint = Some(bp);
            }
            EventKind::MethodEntry | EventKind::MethodExit => {
                if let Some(il_offset) = hook_offset(kind) {
                    let bp = reg.breakpoints.set(&*agent.host, None, il_offset, id, kind)?;
                    request.breakpoint = Some(bp);
                }
            }
            _ => {}
        }
        reg.requests.push(request);
        id
    };

    info!("Added {:?} request {} with policy {:?}", kind, id, policy);
    req.reply.put_i32(id);

    if agent.config.defer {
        replay_existing(agent, kind, id);
    }

    Ok(Reply::Send)
}

/// In deferred mode a client attaches late; tell it about what already exists
fn replay_existing(agent: &Agent, kind: EventKind, id: RequestId) {
    match kind {
        EventKind::ThreadStart => {
            let threads: Vec<ThreadRef> = {
                let reg = agent.registry.lock();
                let mut threads: Vec<_> = reg
                    .threads
                    .values()
                    .filter(|tls| !tls.terminated)
                    .map(|tls| tls.thread)
                    .collect();
                threads.sort();
                threads
            };
            debug!("Replaying THREAD_START for {} threads", threads.len());
            for thread in threads {
                let info = EventInfo {
                    thread: Some(thread),
                    ..Default::default()
                };
                agent.raise_for(EventPayload::ThreadStart, Some(thread), &info, id);
            }
        }
        EventKind::AssemblyLoad => {
            let assemblies = agent.host.loaded_assemblies();
            debug!("Replaying ASSEMBLY_LOAD for {} assemblies", assemblies.len());
            for (assembly, domain) in assemblies {
                agent.raise_for(
                    EventPayload::AssemblyLoad { assembly, domain },
                    None,
                    &EventInfo::default(),
                    id,
                );
            }
        }
        _ => {}
    }
}

impl Agent {
    /// Deliver an occurrence to one request only
    fn raise_for(&self, payload: EventPayload, thread: Option<ThreadRef>, info: &EventInfo<'_>, request: RequestId) {
        let version = self.protocol_version();
        let matched = self.registry.lock().create_event_list(
            &*self.host,
            payload.kind(),
            Some(&[request]),
            info,
            version,
        );
        if matched.requests.is_empty() {
            return;
        }
        self.process_event(
            crate::events::PendingEvent {
                payload,
                requests: matched.requests,
                policy: matched.policy,
            },
            thread,
            None,
        );
    }
}

impl Registry {
    pub(crate) fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Drop a request together with its breakpoint or step
    pub(crate) fn remove_request(&mut self, host: &dyn Host, id: RequestId) -> Option<EventRequest> {
        let index = self.requests.iter().position(|r| r.id == id)?;
        let request = self.requests.remove(index);

        if let Some(bp) = request.breakpoint {
            self.breakpoints.clear(host, bp);
        }
        if request.kind == EventKind::Step {
            self.ss_destroy(host, id);
        }
        Some(request)
    }

    /// Forget every reference to an unloaded assembly
    pub(crate) fn assembly_unloaded(&mut self, host: &dyn Host, assembly: AssemblyRef) {
        for request in self.requests.iter_mut() {
            request.modifiers.retain_mut(|m| match m {
                Modifier::ExceptionOnly(filter) => filter
                    .class
                    .and_then(|c| host.type_info(c))
                    .map(|t| t.assembly != assembly)
                    .unwrap_or(true),
                Modifier::AssemblyOnly(assemblies) => {
                    assemblies.retain(|a| *a != assembly);
                    true
                }
                _ => true,
            });
        }

        let doomed: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|r| r.kind == EventKind::Breakpoint)
            .filter(|r| {
                r.location()
                    .and_then(|(method, _)| host.method_info(method))
                    .map(|info| info.assembly == assembly)
                    .unwrap_or(false)
            })
            .map(|r| r.id)
            .collect();
        for id in doomed {
            debug!("Dropping breakpoint request {} from unloaded assembly", id);
            self.remove_request(host, id);
        }

        self.breakpoints.assembly_unloaded(host, assembly);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::tests::FakeHost;

    fn request(id: RequestId, kind: EventKind, modifiers: Vec<Modifier>) -> EventRequest {
        EventRequest {
            id,
            kind,
            policy: SuspendPolicy::All,
            modifiers,
            breakpoint: None,
        }
    }

    #[test]
    fn test_policy_ordering() {
        assert!(SuspendPolicy::All > SuspendPolicy::EventThread);
        assert!(SuspendPolicy::EventThread > SuspendPolicy::None);
        assert_eq!(SuspendPolicy::from_u8(2), Some(SuspendPolicy::All));
        assert_eq!(SuspendPolicy::from_u8(3), None);
    }

    #[test]
    fn test_location_and_step_lookup() {
        let req = request(
            1,
            EventKind::Breakpoint,
            vec![
                Modifier::Count(2),
                Modifier::LocationOnly { method: MethodRef(7), il_offset: 0x10 },
            ],
        );
        assert_eq!(req.location(), Some((MethodRef(7), 0x10)));
        assert_eq!(req.step(), None);
    }

    #[test]
    fn test_occurrence_count_must_be_positive() {
        assert_eq!(read_occurrence_count(&mut &3i32.to_be_bytes()[..]), Ok(3));
        assert_eq!(read_occurrence_count(&mut &0i32.to_be_bytes()[..]), Err(ErrorCode::InvalidArgument));
        assert_eq!(read_occurrence_count(&mut &(-1i32).to_be_bytes()[..]), Err(ErrorCode::InvalidArgument));
        assert!(read_occurrence_count(&mut &[0u8, 0][..]).is_err());
    }

    #[test]
    fn test_remove_request_clears_breakpoint() {
        let host = FakeHost::default();
        let mut reg = Registry::default();
        let id = reg.next_request_id();
        let bp = reg
            .breakpoints
            .set(&host, Some(MethodRef(1)), 0x10, id, EventKind::Breakpoint)
            .unwrap();
        let mut req = request(id, EventKind::Breakpoint, vec![]);
        req.breakpoint = Some(bp);
        reg.requests.push(req);

        assert!(reg.remove_request(&host, id).is_some());
        assert!(reg.breakpoints.is_empty());
        assert!(reg.remove_request(&host, id).is_none());
    }

    #[test]
    fn test_assembly_unload_prunes_modifiers_and_breakpoints() {
        let host = FakeHost::default();
        let mut reg = Registry::default();

        let bp_id = reg.next_request_id();
        let bp = reg
            .breakpoints
            .set(&host, Some(MethodRef(1)), 0, bp_id, EventKind::Breakpoint)
            .unwrap();
        let mut bp_req = request(
            bp_id,
            EventKind::Breakpoint,
            vec![Modifier::LocationOnly { method: MethodRef(1), il_offset: 0 }],
        );
        bp_req.breakpoint = Some(bp);
        reg.requests.push(bp_req);

        let exc_id = reg.next_request_id();
        reg.requests.push(request(
            exc_id,
            EventKind::Exception,
            vec![Modifier::AssemblyOnly(vec![AssemblyRef(1), AssemblyRef(2)])],
        ));

        reg.assembly_unloaded(&host, AssemblyRef(1));

        assert_eq!(reg.requests.len(), 1);
        assert_eq!(reg.requests[0].id, exc_id);
        assert_eq!(
            reg.requests[0].modifiers,
            vec![Modifier::AssemblyOnly(vec![AssemblyRef(2)])]
        );
        assert!(reg.breakpoints.is_empty());
    }
}
