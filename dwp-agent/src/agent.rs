// Debugger agent
//
// `Agent` is the one object holding all debugger state. The host reports
// runtime activity through the notification methods below; the transport
// and dispatcher threads serve the client. Lock order is
// session -> registry -> suspend state, and no lock is held across a call
// that may park the calling thread.

use crate::breakpoint::BreakpointTable;
use crate::commands::UNSOLICITED_EXCEPTION_REQUEST_ID;
use crate::config::AgentConfig;
use crate::dispatch;
use crate::eventrequest::{EventRequest, SuspendPolicy};
use crate::events::{EventKind, EventPayload, PendingEvent};
use crate::filter::EventInfo;
use crate::host::{CompiledCode, ExceptionInfo, Host, RuntimeObject};
use crate::ids::{EntityIds, IdKind};
use crate::protocol::{AgentError, AgentResult, ErrorCode, ProtocolVersion};
use crate::reader::read_i32;
use crate::step::StepTable;
use crate::suspend::{Coordinator, ThreadPhase};
use crate::thread::ThreadDebugState;
use crate::transport::{self, Connection, Session};
use crate::types::*;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// How often attach waiters recheck whether the transport gave up
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// State guarded by the registry lock
#[derive(Debug)]
pub(crate) struct Registry {
    pub threads: HashMap<ThreadRef, ThreadDebugState>,
    pub requests: Vec<EventRequest>,
    pub ids: EntityIds,
    pub breakpoints: BreakpointTable,
    pub steps: StepTable,
    /// Reasons every safepoint must be reported (suspension, INTO steps)
    pub single_stepping: u32,
    pub next_request_id: RequestId,
    pub next_frame_id: FrameId,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            threads: HashMap::new(),
            requests: Vec::new(),
            ids: EntityIds::default(),
            breakpoints: BreakpointTable::default(),
            steps: StepTable::default(),
            single_stepping: 0,
            next_request_id: 0,
            next_frame_id: 0,
        }
    }
}

/// VM start/death bookkeeping
#[derive(Debug, Default)]
pub(crate) struct Lifecycle {
    /// The host reported VM start
    pub program_started: bool,
    /// Someone is sending VM_START for the current client
    pub vm_start_claimed: bool,
    pub vm_start_sent: bool,
    pub vm_death_sent: bool,
    pub root_domain: Option<DomainRef>,
}

pub struct Agent {
    pub(crate) config: AgentConfig,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) coordinator: Coordinator,
    pub(crate) session: Mutex<Option<Session>>,
    attached: Condvar,
    pub(crate) lifecycle: Mutex<Lifecycle>,
    version: Mutex<ProtocolVersion>,
    agent_threads: Mutex<Vec<std::thread::ThreadId>>,
    pub(crate) keepalive: watch::Sender<Option<Duration>>,
    pub(crate) stop_signal: watch::Sender<bool>,
    packet_id: AtomicU32,
    transport_started: AtomicBool,
    transport_done: AtomicBool,
    stopping: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    me: Weak<Agent>,
}

impl Agent {
    pub fn new(config: AgentConfig, host: Arc<dyn Host>) -> Arc<Self> {
        let (keepalive, _) = watch::channel(config.keepalive);
        let (stop_signal, _) = watch::channel(false);

        Arc::new_cyclic(|me| Agent {
            config,
            host,
            registry: Mutex::new(Registry::default()),
            coordinator: Coordinator::new(),
            session: Mutex::new(None),
            attached: Condvar::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
            version: Mutex::new(ProtocolVersion::CURRENT),
            agent_threads: Mutex::new(Vec::new()),
            keepalive,
            stop_signal,
            packet_id: AtomicU32::new(1),
            transport_started: AtomicBool::new(false),
            transport_done: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Start the transport. In server mode the socket is bound before this
    /// returns and its address is returned. With JIT attach nothing happens
    /// until the first matching exception.
    pub fn start(&self) -> AgentResult<Option<SocketAddr>> {
        if self.config.jit_attach() {
            info!("Deferring debugger connection until an exception is raised");
            return Ok(None);
        }
        self.start_transport()
    }

    fn start_transport(&self) -> AgentResult<Option<SocketAddr>> {
        if self.transport_started.swap(true, Ordering::SeqCst) {
            return Ok(*self.local_addr.lock());
        }
        let agent = self.me.upgrade().ok_or(AgentError::ConnectionClosed)?;

        if self.config.setpgid {
            debug!("setpgid is not supported by this transport, ignoring");
        }

        let listener = if self.config.server {
            let (host, port) = self.config.socket_address()?;
            let listener = std::net::TcpListener::bind((host.as_str(), port))?;
            listener.set_nonblocking(true)?;
            let addr = listener.local_addr()?;
            info!("Listening for debugger connections on {}", addr);
            *self.local_addr.lock() = Some(addr);
            Some(listener)
        } else {
            None
        };

        let (conn_tx, conn_rx) = mpsc::channel(1);

        let transport_agent = Arc::clone(&agent);
        std::thread::Builder::new()
            .name("dwp-transport".to_string())
            .spawn(move || {
                transport_agent.register_agent_thread();
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start transport runtime: {}", e);
                        transport_agent.transport_finished();
                        return;
                    }
                };
                runtime.block_on(transport::run(
                    Arc::clone(&transport_agent),
                    listener,
                    conn_tx,
                ));
            })?;

        std::thread::Builder::new()
            .name("dwp-agent".to_string())
            .spawn(move || {
                agent.register_agent_thread();
                agent.agent_loop(conn_rx);
            })?;

        Ok(*self.local_addr.lock())
    }

    /// Detach and stop serving clients
    pub fn shutdown(&self) {
        info!("Shutting down debugger agent");
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_signal.send_replace(true);
        if let Some(session) = self.session.lock().as_ref() {
            session.close();
        }
        self.attached.notify_all();
    }

    fn agent_loop(&self, mut connections: mpsc::Receiver<Connection>) {
        while let Some(conn) = connections.blocking_recv() {
            self.attach(conn.session);
            dispatch::run(self, conn.commands);
            self.dispose_vm();
            if self.is_stopping() {
                break;
            }
        }
        debug!("Agent thread exiting");
    }

    fn attach(&self, session: Session) {
        *self.version.lock() = ProtocolVersion::CURRENT;
        {
            let mut slot = self.session.lock();
            *slot = Some(session);
            self.attached.notify_all();
        }
        info!("Debugger attached");

        // A client arriving after startup gets its VM_START from us
        let claim = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.program_started && !lifecycle.vm_start_claimed {
                lifecycle.vm_start_claimed = true;
                true
            } else {
                false
            }
        };
        if claim {
            self.send_vm_start(None);
        }
    }

    /// Block until a client is attached. False if none ever will be.
    fn wait_for_attach(&self) -> bool {
        let mut slot = self.session.lock();
        while slot.is_none() {
            if self.transport_done.load(Ordering::SeqCst) || self.is_stopping() {
                return false;
            }
            self.attached.wait_for(&mut slot, ATTACH_POLL_INTERVAL);
        }
        true
    }

    pub(crate) fn transport_finished(&self) {
        debug!("Transport finished");
        self.transport_done.store(true, Ordering::SeqCst);
        let _slot = self.session.lock();
        self.attached.notify_all();
    }

    /// Tear down everything the client set up and let the program run free
    pub(crate) fn dispose_vm(&self) {
        info!("Disposing debugger session");
        if let Some(session) = self.session.lock().take() {
            session.close();
        }

        self.clear_event_requests();
        {
            let mut reg = self.registry.lock();
            for tls in reg.threads.values_mut() {
                tls.pending_invoke = None;
            }
        }
        self.resume_all();

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.vm_start_claimed = false;
            lifecycle.vm_start_sent = false;
        }
        *self.version.lock() = ProtocolVersion::CURRENT;
        self.keepalive.send_replace(self.config.keepalive);
    }

    /// VM.EXIT after its reply went out
    pub(crate) fn exit_vm(&self, code: i32) {
        info!("Exiting debuggee with code {}", code);
        self.stopping.store(true, Ordering::SeqCst);
        self.stop_signal.send_replace(true);
        self.clear_event_requests();
        self.resume_all();
        self.host.exit(code);
    }

    pub(crate) fn clear_event_requests(&self) {
        let mut reg = self.registry.lock();
        let ids: Vec<RequestId> = reg.requests.iter().map(|r| r.id).collect();
        for id in ids {
            reg.remove_request(&*self.host, id);
        }
    }

    fn register_agent_thread(&self) {
        self.agent_threads.lock().push(std::thread::current().id());
    }

    pub(crate) fn is_agent_thread(&self) -> bool {
        let current = std::thread::current().id();
        self.agent_threads.lock().contains(&current)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.session.lock().is_some()
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        *self.version.lock()
    }

    pub(crate) fn set_protocol_version(&self, version: ProtocolVersion) {
        info!("Client speaks protocol {}", version);
        *self.version.lock() = version;
    }

    pub(crate) fn next_packet_id(&self) -> u32 {
        self.packet_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn thread_terminated(&self, thread: ThreadRef) -> bool {
        self.coordinator.thread_phase(thread) == Some(ThreadPhase::Terminated)
    }

    /// Read an entity id and resolve it
    pub(crate) fn decode_id(&self, buf: &mut &[u8], kind: IdKind) -> Result<(u64, DomainRef), ErrorCode> {
        let id = read_i32(buf)?;
        self.registry.lock().ids.resolve(kind, id)
    }

    pub(crate) fn decode_method(&self, buf: &mut &[u8]) -> Result<MethodRef, ErrorCode> {
        self.decode_id(buf, IdKind::Method).map(|(h, _)| MethodRef(h))
    }

    /// Read a type id, where 0 stands for no type
    pub(crate) fn decode_optional_type(&self, buf: &mut &[u8]) -> Result<Option<TypeRef>, ErrorCode> {
        let id = read_i32(buf)?;
        if id == 0 {
            return Ok(None);
        }
        self.registry
            .lock()
            .ids
            .resolve(IdKind::Type, id)
            .map(|(h, _)| Some(TypeRef(h)))
    }

    pub(crate) fn decode_assembly(&self, buf: &mut &[u8]) -> Result<AssemblyRef, ErrorCode> {
        self.decode_id(buf, IdKind::Assembly).map(|(h, _)| AssemblyRef(h))
    }

    pub(crate) fn decode_thread(&self, buf: &mut &[u8]) -> Result<ThreadRef, ErrorCode> {
        let id = read_i32(buf)?;
        let pin = self.coordinator.is_suspending();
        let mut reg = self.registry.lock();
        let object = reg.ids.object(id, pin)?;
        let thread = object.as_thread().ok_or(ErrorCode::InvalidObject)?;
        if !reg.threads.contains_key(&thread) {
            return Err(ErrorCode::InvalidObject);
        }
        Ok(thread)
    }

    pub(crate) fn method_id(&self, method: MethodRef) -> EntityId {
        let mut reg = self.registry.lock();
        self.method_id_in(&mut reg, method)
    }

    pub(crate) fn method_id_in(&self, reg: &mut Registry, method: MethodRef) -> EntityId {
        let domain = self
            .host
            .method_info(method)
            .map(|info| info.domain)
            .unwrap_or(DomainRef(0));
        reg.ids.get_id(IdKind::Method, domain, method.0)
    }

    /// Match an occurrence against the registered requests and deliver it
    fn raise(
        &self,
        payload: EventPayload,
        thread: Option<ThreadRef>,
        ctx: Option<&ThreadContext>,
        info: EventInfo<'_>,
    ) {
        let version = self.protocol_version();
        let matched = self.registry.lock().create_event_list(
            &*self.host,
            payload.kind(),
            None,
            &info,
            version,
        );
        if matched.requests.is_empty() {
            return;
        }

        self.process_event(
            PendingEvent {
                payload,
                requests: matched.requests,
                policy: matched.policy,
            },
            thread,
            ctx,
        );
    }

    fn send_vm_start(&self, thread: Option<ThreadRef>) {
        let domain = self.lifecycle.lock().root_domain.unwrap_or(DomainRef(0));
        let info = EventInfo {
            thread,
            ..Default::default()
        };
        self.raise(EventPayload::VmStart { domain }, thread, None, info);
    }

    /// Connect lazily for an exception. True once a client is attached.
    fn jit_attach(&self) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.vm_start_claimed = true;
        }
        if let Err(e) = self.start_transport() {
            error!("Failed to start transport: {}", e);
            return false;
        }
        if !self.wait_for_attach() {
            return false;
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.program_started = true;
        lifecycle.vm_start_sent = true;
        true
    }
}

// Host notifications
impl Agent {
    /// The runtime finished starting up; `thread` is the main thread.
    ///
    /// Without deferred or JIT attach this blocks until a client attaches,
    /// then delivers VM_START, parking the main thread if `suspend=y`.
    pub fn vm_started(&self, thread: ThreadRef, domain: DomainRef) {
        self.lifecycle.lock().root_domain = Some(domain);

        if self.config.jit_attach() {
            self.lifecycle.lock().program_started = true;
            return;
        }

        if self.config.defer {
            self.lifecycle.lock().program_started = true;
            if !self.is_attached() {
                return;
            }
            let claim = {
                let mut lifecycle = self.lifecycle.lock();
                !std::mem::replace(&mut lifecycle.vm_start_claimed, true)
            };
            if claim {
                self.send_vm_start(Some(thread));
            }
            return;
        }

        if !self.wait_for_attach() {
            warn!("No debugger attached, running without one");
            self.lifecycle.lock().program_started = true;
            return;
        }
        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.program_started = true;
            lifecycle.vm_start_claimed = true;
        }
        self.send_vm_start(Some(thread));
    }

    pub fn vm_died(&self, exit_code: i32) {
        info!("VM died with exit code {}", exit_code);
        self.raise(
            EventPayload::VmDeath { exit_code },
            None,
            None,
            EventInfo::default(),
        );
        self.shutdown();
    }

    pub fn thread_started(&self, thread: ThreadRef, object: Arc<dyn RuntimeObject>) {
        if self.is_agent_thread() {
            return;
        }

        self.registry
            .lock()
            .threads
            .insert(thread, ThreadDebugState::new(thread, object));
        self.coordinator.add_thread(thread);
        debug!("Thread {:?} started", thread);

        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(EventPayload::ThreadStart, Some(thread), None, info);

        // Started while the VM is being suspended
        if self.coordinator.lock().outstanding(thread) > 0 {
            self.suspend_current(thread);
        }
    }

    pub fn thread_ended(&self, thread: ThreadRef) {
        if self.is_agent_thread() {
            return;
        }

        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(EventPayload::ThreadDeath, Some(thread), None, info);

        if let Some(tls) = self.registry.lock().threads.get_mut(&thread) {
            tls.terminated = true;
            tls.invalidate();
        }
        self.coordinator.thread_terminated(thread);
        debug!("Thread {:?} ended", thread);
    }

    pub fn appdomain_created(&self, thread: ThreadRef, domain: DomainRef) {
        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(EventPayload::AppDomainCreate(domain), Some(thread), None, info);
    }

    pub fn appdomain_unloaded(&self, thread: ThreadRef, domain: DomainRef) {
        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(EventPayload::AppDomainUnload(domain), Some(thread), None, info);

        let mut reg = self.registry.lock();
        reg.ids.domain_unloaded(domain);
        reg.breakpoints.domain_unloaded(&*self.host, domain);
    }

    pub fn assembly_loaded(&self, thread: ThreadRef, assembly: AssemblyRef, domain: DomainRef) {
        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(
            EventPayload::AssemblyLoad { assembly, domain },
            Some(thread),
            None,
            info,
        );
    }

    pub fn assembly_unloaded(&self, thread: ThreadRef, assembly: AssemblyRef, domain: DomainRef) {
        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(
            EventPayload::AssemblyUnload { assembly, domain },
            Some(thread),
            None,
            info,
        );

        self.registry
            .lock()
            .assembly_unloaded(&*self.host, assembly);
    }

    pub fn type_loaded(&self, thread: ThreadRef, ty: TypeRef, domain: DomainRef) {
        let info = EventInfo {
            thread: Some(thread),
            class: Some(ty),
            ..Default::default()
        };
        self.raise(EventPayload::TypeLoad { ty, domain }, Some(thread), None, info);
    }

    /// New code became available; resolves pending breakpoints
    pub fn method_compiled(&self, code: CompiledCode) {
        self.registry
            .lock()
            .breakpoints
            .method_compiled(&*self.host, code);
    }

    pub fn exception_raised(&self, thread: ThreadRef, ctx: &ThreadContext, exception: &ExceptionInfo) {
        if self.is_agent_thread() {
            return;
        }

        if self.config.jit_attach() && !self.is_attached() && !self.lifecycle.lock().vm_start_sent {
            let type_name = self
                .host
                .type_info(exception.class)
                .map(|t| t.full_name)
                .unwrap_or_default();
            let trigger = (self.config.onuncaught && !exception.caught)
                || self.config.attach_on_throw(&type_name);
            if !trigger || !self.jit_attach() {
                return;
            }

            info!("Attached for {} exception {}", if exception.caught { "caught" } else { "uncaught" }, type_name);
            let event = PendingEvent {
                payload: EventPayload::Exception {
                    object: Arc::clone(&exception.object),
                },
                requests: vec![UNSOLICITED_EXCEPTION_REQUEST_ID],
                policy: SuspendPolicy::All,
            };
            self.process_event(event, Some(thread), Some(ctx));
            return;
        }

        let info = EventInfo {
            thread: Some(thread),
            method: Some(ctx.method),
            code: Some(ctx.code),
            exception: Some(exception),
            class: None,
        };
        self.raise(
            EventPayload::Exception {
                object: Arc::clone(&exception.object),
            },
            Some(thread),
            Some(ctx),
            info,
        );
    }

    pub fn user_break(&self, thread: ThreadRef, ctx: &ThreadContext) {
        let info = EventInfo {
            thread: Some(thread),
            method: Some(ctx.method),
            code: Some(ctx.code),
            ..Default::default()
        };
        self.raise(EventPayload::UserBreak, Some(thread), Some(ctx), info);
    }

    pub fn user_log(&self, thread: ThreadRef, level: i32, category: &str, message: &str) {
        let info = EventInfo {
            thread: Some(thread),
            ..Default::default()
        };
        self.raise(
            EventPayload::UserLog {
                level,
                category: category.to_string(),
                message: message.to_string(),
            },
            Some(thread),
            None,
            info,
        );
    }

    /// A thread reached an armed location, or any safepoint while single
    /// stepping is on. Breakpoint and step decisions happen before the
    /// thread is allowed to park.
    pub fn safepoint_reached(&self, thread: ThreadRef, ctx: &ThreadContext) {
        if self.is_agent_thread() {
            return;
        }

        for event in self.collect_safepoint_events(thread, ctx) {
            self.process_event(event, Some(thread), Some(ctx));
        }
        self.try_process_suspend(thread, ctx);
    }
}
