// Simulated execution host
//
// Runs a scripted program on real OS threads and tells the agent about it
// the way a managed runtime would: threads starting and ending, methods being
// compiled, sequence points being reached. Programs are JSON documents; each
// method is a list of statements and statement `i` sits at IL offset
// `i * 0x10` on source line `first_line + i`.
//
// The host never holds its own lock while calling into the agent, since the
// agent calls back into the host with the registry lock held.

use crate::agent::Agent;
use crate::commands::{invoke_flags, Command, StackFrameCommand, VmCommand, METHOD_ENTRY_IL_OFFSET, METHOD_EXIT_IL_OFFSET};
use crate::host::*;
use crate::ids::{Entities, IdKind};
use crate::protocol::{AgentError, AgentResult, ErrorCode};
use crate::reader::{read_i32, read_string, read_u8};
use crate::types::*;
use crate::writer::write_string;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Distance between consecutive sequence points
pub const SEQ_POINT_STRIDE: i64 = 0x10;

pub const ROOT_DOMAIN: DomainRef = DomainRef(1);

const THREAD_CLASS: TypeRef = TypeRef(0);
const STACK_BASE: u64 = 0x7fff_0000;
const FRAME_SIZE: u64 = 0x100;

// Commands of the metadata sets the simulated host answers
mod host_commands {
    pub const METHOD_GET_NAME: u8 = 1;
    pub const METHOD_GET_DECLARING_TYPE: u8 = 2;
    pub const TYPE_GET_METHODS: u8 = 2;
    pub const TYPE_GET_SOURCE_FILES: u8 = 6;
}

fn default_tick_ms() -> u64 {
    1
}

fn default_first_line() -> u32 {
    1
}

fn default_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyDef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub id: u64,
    /// Namespace qualified name
    pub name: String,
    pub assembly: u64,
    #[serde(default)]
    pub base: Option<u64>,
    #[serde(default)]
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Stmt {
    Nop,
    Call { method: u64 },
    /// Raise an exception, caught by `catcher` if given
    Throw {
        class: u64,
        #[serde(default)]
        catcher: Option<u64>,
    },
    Log {
        #[serde(default)]
        level: i32,
        #[serde(default)]
        category: String,
        message: String,
    },
    Break,
    /// Spend time in native code, where the thread cannot park itself
    Native { ms: u64 },
    LoadType { ty: u64 },
    /// Start the program thread at index `thread`, which must be `spawned`
    Spawn { thread: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodDef {
    pub id: u64,
    pub name: String,
    pub declaring_type: u64,
    #[serde(default = "default_first_line")]
    pub first_line: u32,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub attrs: MethodAttrs,
    /// Set for a specialization of a generic method
    #[serde(default)]
    pub generic_definition: Option<u64>,
    /// Frames of this method belong to the given logical task
    #[serde(default)]
    pub async_id: Option<u64>,
    /// Value returned to invokes
    #[serde(default)]
    pub returns: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDef {
    pub name: String,
    pub entry: u64,
    /// Times the entry method runs, 0 for as long as the program runs
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub thread_pool: bool,
    /// Started by a `spawn` statement instead of at startup
    #[serde(default)]
    pub spawned: bool,
}

/// A scripted program. The first thread is the main thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub assemblies: Vec<AssemblyDef>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
    pub methods: Vec<MethodDef>,
    pub threads: Vec<ThreadDef>,
    #[serde(default)]
    pub exit_code: i32,
    /// Pause after every statement
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Program {
    pub fn from_json(json: &str) -> AgentResult<Self> {
        let program: Program = serde_json::from_str(json)
            .map_err(|e| AgentError::Config(format!("invalid program: {}", e)))?;
        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.threads.is_empty() {
            return Err(AgentError::Config("program has no threads".to_string()));
        }
        let methods: HashSet<u64> = self.methods.iter().map(|m| m.id).collect();
        let types: HashSet<u64> = self.types.iter().map(|t| t.id).collect();

        for thread in &self.threads {
            if !methods.contains(&thread.entry) {
                return Err(AgentError::Config(format!(
                    "thread '{}' starts in unknown method {}",
                    thread.name, thread.entry
                )));
            }
        }
        for method in &self.methods {
            if !types.contains(&method.declaring_type) {
                return Err(AgentError::Config(format!(
                    "method '{}' has unknown declaring type {}",
                    method.name, method.declaring_type
                )));
            }
            for stmt in &method.body {
                let missing = match stmt {
                    Stmt::Call { method } => !methods.contains(method),
                    Stmt::Throw { class, catcher } => {
                        !types.contains(class) || catcher.map_or(false, |c| !methods.contains(&c))
                    }
                    Stmt::LoadType { ty } => !types.contains(ty),
                    Stmt::Spawn { thread } => self.threads.get(*thread).map_or(true, |t| !t.spawned),
                    _ => false,
                };
                if missing {
                    return Err(AgentError::Config(format!(
                        "method '{}' refers to an unknown entity in {:?}",
                        method.name, stmt
                    )));
                }
            }
        }
        Ok(())
    }

    /// A small program exercising threads, calls, exceptions and logging
    pub fn demo() -> Self {
        let stmts = |n: usize| vec![Stmt::Nop; n];
        Program {
            assemblies: vec![AssemblyDef {
                id: 1,
                name: "Demo".to_string(),
            }],
            types: vec![
                TypeDef {
                    id: 1,
                    name: "Demo.Program".to_string(),
                    assembly: 1,
                    base: None,
                    source_files: vec!["/src/Demo/Program.cs".to_string()],
                },
                TypeDef {
                    id: 2,
                    name: "Demo.Worker".to_string(),
                    assembly: 1,
                    base: None,
                    source_files: vec!["/src/Demo/Worker.cs".to_string()],
                },
                TypeDef {
                    id: 3,
                    name: "System.InvalidOperationException".to_string(),
                    assembly: 1,
                    base: None,
                    source_files: Vec::new(),
                },
            ],
            methods: vec![
                MethodDef {
                    id: 1,
                    name: "Main".to_string(),
                    declaring_type: 1,
                    first_line: 10,
                    body: vec![
                        Stmt::Log {
                            level: 0,
                            category: "demo".to_string(),
                            message: "starting".to_string(),
                        },
                        Stmt::Call { method: 2 },
                        Stmt::Throw {
                            class: 3,
                            catcher: Some(1),
                        },
                        Stmt::Call { method: 2 },
                        Stmt::Log {
                            level: 0,
                            category: "demo".to_string(),
                            message: "done".to_string(),
                        },
                    ],
                    attrs: MethodAttrs::default(),
                    generic_definition: None,
                    async_id: None,
                    returns: None,
                },
                MethodDef {
                    id: 2,
                    name: "Compute".to_string(),
                    declaring_type: 2,
                    first_line: 20,
                    body: stmts(3),
                    attrs: MethodAttrs::default(),
                    generic_definition: None,
                    async_id: None,
                    returns: Some(42),
                },
                MethodDef {
                    id: 3,
                    name: "Spin".to_string(),
                    declaring_type: 2,
                    first_line: 30,
                    body: vec![Stmt::Native { ms: 20 }, Stmt::Call { method: 2 }],
                    attrs: MethodAttrs::default(),
                    generic_definition: None,
                    async_id: None,
                    returns: None,
                },
            ],
            threads: vec![
                ThreadDef {
                    name: "Main".to_string(),
                    entry: 1,
                    iterations: 5,
                    thread_pool: false,
                    spawned: false,
                },
                ThreadDef {
                    name: "Worker".to_string(),
                    entry: 3,
                    iterations: 0,
                    thread_pool: true,
                    spawned: false,
                },
            ],
            exit_code: 0,
            tick_ms: 50,
        }
    }

    fn method(&self, id: u64) -> Option<&MethodDef> {
        self.methods.iter().find(|m| m.id == id)
    }

    fn type_def(&self, id: u64) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.id == id)
    }
}

#[derive(Debug)]
struct SimObject {
    address: u64,
    class: TypeRef,
    thread: Option<ThreadRef>,
}

impl RuntimeObject for SimObject {
    fn address(&self) -> u64 {
        self.address
    }

    fn domain(&self) -> DomainRef {
        ROOT_DOMAIN
    }

    fn class(&self) -> TypeRef {
        self.class
    }

    fn as_thread(&self) -> Option<ThreadRef> {
        self.thread
    }
}

#[derive(Debug)]
struct SimThread {
    info: ThreadInfo,
    /// Outermost first
    frames: Vec<FrameInfo>,
    native: bool,
    finished: bool,
}

#[derive(Debug, Default)]
struct SimState {
    threads: HashMap<ThreadRef, SimThread>,
    compiled: Vec<CompiledCode>,
    loaded_types: HashSet<TypeRef>,
    installed: HashSet<(CodeRef, i64)>,
    next_object: u64,
    /// Threads started by `spawn` statements
    spawned: Vec<std::thread::JoinHandle<()>>,
}

pub struct SimHost {
    program: Program,
    state: Mutex<SimState>,
    single_stepping: AtomicBool,
    exiting: AtomicBool,
    exit_code: AtomicI32,
    agent: OnceLock<Weak<Agent>>,
    me: Weak<SimHost>,
}

impl SimHost {
    pub fn new(program: Program) -> Arc<Self> {
        let exit_code = AtomicI32::new(program.exit_code);
        Arc::new_cyclic(|me| Self {
            program,
            state: Mutex::new(SimState::default()),
            single_stepping: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            exit_code,
            agent: OnceLock::new(),
            me: me.clone(),
        })
    }

    /// Report to `agent` from now on
    pub fn attach(&self, agent: &Arc<Agent>) {
        if self.agent.set(Arc::downgrade(agent)).is_err() {
            warn!("Simulated host is already attached to an agent");
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Handle of the nth thread of the program
    pub fn thread(index: usize) -> ThreadRef {
        ThreadRef(index as u64 + 1)
    }

    pub fn is_single_stepping(&self) -> bool {
        self.single_stepping.load(Ordering::SeqCst)
    }

    pub fn installed_breakpoints(&self) -> usize {
        self.state.lock().installed.len()
    }

    /// Ask every thread to finish at its next statement
    pub fn stop(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    fn agent(&self) -> Option<Arc<Agent>> {
        self.agent.get().and_then(Weak::upgrade)
    }

    /// Run the program with the calling thread as its main thread. Returns
    /// the exit code.
    pub fn run(self: &Arc<Self>) -> AgentResult<i32> {
        let agent = self
            .agent()
            .ok_or_else(|| AgentError::Config("no agent attached to the host".to_string()))?;

        let main_def = self
            .program
            .threads
            .first()
            .ok_or_else(|| AgentError::Config("program has no threads".to_string()))?;
        let main = Self::thread(0);
        self.start_thread(&agent, main, main_def);
        agent.vm_started(main, ROOT_DOMAIN);
        agent.appdomain_created(main, ROOT_DOMAIN);
        for assembly in &self.program.assemblies {
            agent.assembly_loaded(main, AssemblyRef(assembly.id), ROOT_DOMAIN);
        }

        let mut workers = Vec::new();
        for (index, def) in self.program.threads.iter().enumerate().skip(1) {
            if !def.spawned {
                workers.push(self.spawn_thread(&agent, index)?);
            }
        }

        self.run_thread(&agent, main, main_def);

        // Background threads end with the main thread
        self.mark_finished(main);
        self.stop();
        workers.append(&mut self.state.lock().spawned);
        for handle in workers {
            if handle.join().is_err() {
                warn!("A simulated thread panicked");
            }
        }
        self.end_thread(&agent, main);

        let exit_code = self.exit_code.load(Ordering::SeqCst);
        info!("Program finished with exit code {}", exit_code);
        agent.vm_died(exit_code);
        Ok(exit_code)
    }

    /// Run program thread `index` on a new OS thread
    fn spawn_thread(self: &Arc<Self>, agent: &Arc<Agent>, index: usize) -> AgentResult<std::thread::JoinHandle<()>> {
        let def = self
            .program
            .threads
            .get(index)
            .cloned()
            .ok_or_else(|| AgentError::Config(format!("program has no thread {}", index)))?;
        let host = Arc::clone(self);
        let agent = Arc::clone(agent);
        let handle = std::thread::Builder::new()
            .name(def.name.clone())
            .spawn(move || {
                let thread = Self::thread(index);
                host.start_thread(&agent, thread, &def);
                host.run_thread(&agent, thread, &def);
                host.end_thread(&agent, thread);
            })?;
        Ok(handle)
    }

    fn start_thread(&self, agent: &Agent, thread: ThreadRef, def: &ThreadDef) {
        let object: Arc<dyn RuntimeObject> = Arc::new(SimObject {
            address: 0x1000 + thread.0 * 0x40,
            class: THREAD_CLASS,
            thread: Some(thread),
        });
        self.state.lock().threads.insert(
            thread,
            SimThread {
                info: ThreadInfo {
                    name: def.name.clone(),
                    is_thread_pool: def.thread_pool,
                    native_tid: 1000 + thread.0,
                    state: 0,
                },
                frames: Vec::new(),
                native: false,
                finished: false,
            },
        );
        debug!("Simulated thread {:?} ({}) started", thread, def.name);
        agent.thread_started(thread, object);
    }

    fn run_thread(&self, agent: &Agent, thread: ThreadRef, def: &ThreadDef) {
        let mut iteration = 0;
        while def.iterations == 0 || iteration < def.iterations {
            if self.is_exiting() {
                break;
            }
            if let Err(e) = self.call(agent, thread, MethodRef(def.entry), None) {
                warn!("{:?} stopped: {}", thread, e);
                break;
            }
            iteration += 1;
        }
    }

    fn mark_finished(&self, thread: ThreadRef) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.finished = true;
        }
    }

    fn end_thread(&self, agent: &Agent, thread: ThreadRef) {
        self.mark_finished(thread);
        agent.thread_ended(thread);
        debug!("Simulated thread {:?} ended", thread);
    }

    fn new_object(&self, class: TypeRef) -> Arc<dyn RuntimeObject> {
        let mut state = self.state.lock();
        state.next_object += 1;
        Arc::new(SimObject {
            address: 0x10_0000 + state.next_object * 0x20,
            class,
            thread: None,
        })
    }

    /// Compile on first call, loading the declaring type first
    fn ensure_compiled(&self, agent: &Agent, thread: ThreadRef, def: &MethodDef) {
        let code = CompiledCode {
            code: CodeRef(def.id),
            method: MethodRef(def.id),
            generic_definition: def.generic_definition.map(MethodRef),
        };
        let ty = TypeRef(def.declaring_type);

        let load_type = {
            let mut state = self.state.lock();
            if state.compiled.contains(&code) {
                return;
            }
            state.compiled.push(code);
            state.loaded_types.insert(ty)
        };

        if load_type {
            agent.type_loaded(thread, ty, ROOT_DOMAIN);
        }
        trace!("Compiled {}", def.name);
        agent.method_compiled(code);
    }

    fn push_frame(&self, thread: ThreadRef, def: &MethodDef) {
        let mut state = self.state.lock();
        if let Some(t) = state.threads.get_mut(&thread) {
            let depth = t.frames.len() as u64 + 1;
            t.frames.push(FrameInfo {
                method: MethodRef(def.id),
                code: CodeRef(def.id),
                il_offset: METHOD_ENTRY_IL_OFFSET,
                sp: STACK_BASE - depth * FRAME_SIZE,
                async_id: def.async_id,
                native_transition: false,
            });
        }
    }

    fn pop_frame(&self, thread: ThreadRef) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.frames.pop();
        }
    }

    /// Move the innermost frame to `il_offset`
    fn set_position(&self, thread: ThreadRef, il_offset: i64) -> Option<ThreadContext> {
        let mut state = self.state.lock();
        let frame = state.threads.get_mut(&thread)?.frames.last_mut()?;
        frame.il_offset = il_offset;
        Some(ThreadContext {
            method: frame.method,
            code: frame.code,
            il_offset,
            sp: frame.sp,
        })
    }

    fn position(&self, thread: ThreadRef) -> Option<i64> {
        let state = self.state.lock();
        state.threads.get(&thread)?.frames.last().map(|f| f.il_offset)
    }

    fn set_native(&self, thread: ThreadRef, native: bool) {
        if let Some(t) = self.state.lock().threads.get_mut(&thread) {
            t.native = native;
        }
    }

    /// Report a sequence point if anything is listening for it
    fn safepoint(&self, agent: &Agent, thread: ThreadRef, ctx: &ThreadContext) {
        let armed = self.state.lock().installed.contains(&(ctx.code, ctx.il_offset));
        if armed || self.is_single_stepping() {
            agent.safepoint_reached(thread, ctx);
        }
    }

    fn hook(&self, agent: &Agent, thread: ThreadRef, il_offset: i64) {
        if let Some(ctx) = self.set_position(thread, il_offset) {
            // Hooks only fire for breakpoints, never for single stepping
            if self.state.lock().installed.contains(&(ctx.code, il_offset)) {
                agent.safepoint_reached(thread, &ctx);
            }
        }
    }

    /// Run a method on the calling thread
    fn call(
        &self,
        agent: &Agent,
        thread: ThreadRef,
        method: MethodRef,
        abort: Option<&AtomicBool>,
    ) -> Result<Option<i32>, ErrorCode> {
        let def = self.program.method(method.0).ok_or(ErrorCode::InvalidObject)?;
        self.ensure_compiled(agent, thread, def);

        self.push_frame(thread, def);
        self.hook(agent, thread, METHOD_ENTRY_IL_OFFSET);
        let result = self.run_body(agent, thread, def, abort);
        if result.is_ok() {
            self.hook(agent, thread, METHOD_EXIT_IL_OFFSET);
        }
        self.pop_frame(thread);

        result.map(|()| def.returns)
    }

    fn run_body(
        &self,
        agent: &Agent,
        thread: ThreadRef,
        def: &MethodDef,
        abort: Option<&AtomicBool>,
    ) -> Result<(), ErrorCode> {
        let tick = Duration::from_millis(self.program.tick_ms);
        let mut index = 0;

        while index < def.body.len() {
            if abort.map_or(false, |a| a.load(Ordering::SeqCst)) {
                return Err(ErrorCode::InvokeAborted);
            }
            if self.is_exiting() {
                return Ok(());
            }

            let il_offset = index as i64 * SEQ_POINT_STRIDE;
            let Some(ctx) = self.set_position(thread, il_offset) else {
                return Ok(());
            };
            self.safepoint(agent, thread, &ctx);

            // The debugger may have moved the thread while it was stopped
            let resumed_at = self.position(thread).unwrap_or(il_offset);
            if resumed_at != il_offset {
                debug!("{:?} continues at {:#x}", thread, resumed_at);
                index = (resumed_at / SEQ_POINT_STRIDE) as usize;
                continue;
            }

            self.execute(agent, thread, &ctx, &def.body[index], abort)?;
            if !tick.is_zero() {
                std::thread::sleep(tick);
            }
            index += 1;
        }
        Ok(())
    }

    fn execute(
        &self,
        agent: &Agent,
        thread: ThreadRef,
        ctx: &ThreadContext,
        stmt: &Stmt,
        abort: Option<&AtomicBool>,
    ) -> Result<(), ErrorCode> {
        match stmt {
            Stmt::Nop => {}
            Stmt::Call { method } => {
                self.call(agent, thread, MethodRef(*method), abort)?;
            }
            Stmt::Throw { class, catcher } => {
                let class = TypeRef(*class);
                let exception = ExceptionInfo {
                    object: self.new_object(class),
                    class,
                    caught: catcher.is_some(),
                    catch_method: catcher.map(MethodRef),
                };
                agent.exception_raised(thread, ctx, &exception);
            }
            Stmt::Log {
                level,
                category,
                message,
            } => agent.user_log(thread, *level, category, message),
            Stmt::Break => agent.user_break(thread, ctx),
            Stmt::Native { ms } => {
                self.set_native(thread, true);
                std::thread::sleep(Duration::from_millis(*ms));
                self.set_native(thread, false);
                // Back in managed code: park if a suspension caught us outside
                if self.is_single_stepping() {
                    agent.safepoint_reached(thread, ctx);
                }
            }
            Stmt::LoadType { ty } => {
                let ty = TypeRef(*ty);
                if self.state.lock().loaded_types.insert(ty) {
                    agent.type_loaded(thread, ty, ROOT_DOMAIN);
                }
            }
            Stmt::Spawn { thread: index } => {
                if self.state.lock().threads.contains_key(&Self::thread(*index)) {
                    warn!("Thread {} is already running", index);
                    return Ok(());
                }
                let (Some(host), Some(agent)) = (self.me.upgrade(), self.agent()) else {
                    return Ok(());
                };
                match host.spawn_thread(&agent, *index) {
                    Ok(handle) => self.state.lock().spawned.push(handle),
                    Err(e) => warn!("Failed to spawn thread {}: {}", index, e),
                }
            }
        }
        Ok(())
    }

    fn matches_name(candidate: &str, wanted: &str, ignore_case: bool) -> bool {
        if ignore_case {
            candidate.eq_ignore_ascii_case(wanted)
        } else {
            candidate == wanted
        }
    }

    fn write_type_ids<'a>(reply: &mut BytesMut, entities: &Entities<'_>, types: impl Iterator<Item = &'a TypeDef>) {
        let ids: Vec<EntityId> = types
            .map(|t| entities.type_id(ROOT_DOMAIN, TypeRef(t.id)))
            .collect();
        reply.put_i32(ids.len() as i32);
        for id in ids {
            reply.put_i32(id);
        }
    }
}

impl Host for SimHost {
    fn async_suspend(&self, thread: ThreadRef) -> AsyncSuspend {
        let state = self.state.lock();
        let Some(t) = state.threads.get(&thread) else {
            return AsyncSuspend::Gone;
        };
        if t.finished {
            return AsyncSuspend::Gone;
        }
        match (t.native, t.frames.last()) {
            (true, Some(top)) => AsyncSuspend::Captured(ThreadContext {
                method: top.method,
                code: top.code,
                il_offset: top.il_offset,
                sp: top.sp,
            }),
            _ => AsyncSuspend::Cooperative,
        }
    }

    fn stack_walk(&self, thread: ThreadRef, _ctx: &ThreadContext) -> Vec<FrameInfo> {
        let state = self.state.lock();
        state
            .threads
            .get(&thread)
            .map(|t| {
                let mut frames = t.frames.clone();
                if let Some(top) = frames.last_mut() {
                    top.native_transition = t.native;
                }
                frames.reverse();
                frames
            })
            .unwrap_or_default()
    }

    fn thread_info(&self, thread: ThreadRef) -> ThreadInfo {
        self.state
            .lock()
            .threads
            .get(&thread)
            .map(|t| t.info.clone())
            .unwrap_or_default()
    }

    fn method_info(&self, method: MethodRef) -> Option<MethodInfo> {
        let def = self.program.method(method.0)?;
        let ty = self.program.type_def(def.declaring_type)?;
        let len = def.body.len() as i64;

        let seq_points = (0..len)
            .map(|i| SeqPoint {
                il_offset: i * SEQ_POINT_STRIDE,
                line: Some(def.first_line + i as u32),
                next: if i + 1 < len {
                    vec![(i + 1) * SEQ_POINT_STRIDE]
                } else {
                    Vec::new()
                },
            })
            .collect();

        Some(MethodInfo {
            name: def.name.clone(),
            declaring_type: TypeRef(def.declaring_type),
            assembly: AssemblyRef(ty.assembly),
            domain: ROOT_DOMAIN,
            generic_definition: def.generic_definition.map(MethodRef),
            seq_points,
            attrs: def.attrs,
            has_entry_exit_hooks: true,
        })
    }

    fn type_info(&self, ty: TypeRef) -> Option<TypeInfo> {
        let def = self.program.type_def(ty.0)?;
        Some(TypeInfo {
            full_name: def.name.clone(),
            assembly: AssemblyRef(def.assembly),
            source_files: def.source_files.clone(),
        })
    }

    fn is_assignable(&self, base: TypeRef, derived: TypeRef) -> bool {
        let mut current = Some(derived.0);
        while let Some(id) = current {
            if id == base.0 {
                return true;
            }
            current = self.program.type_def(id).and_then(|t| t.base);
        }
        false
    }

    fn compiled_code(&self) -> Vec<CompiledCode> {
        self.state.lock().compiled.clone()
    }

    fn install_breakpoint(&self, code: CodeRef, il_offset: i64) {
        trace!("Patching {:?}+{:#x}", code, il_offset);
        self.state.lock().installed.insert((code, il_offset));
    }

    fn remove_breakpoint(&self, code: CodeRef, il_offset: i64) {
        trace!("Unpatching {:?}+{:#x}", code, il_offset);
        self.state.lock().installed.remove(&(code, il_offset));
    }

    fn set_single_stepping(&self, enabled: bool) {
        self.single_stepping.store(enabled, Ordering::SeqCst);
    }

    /// Body: method id, `this` value, argument count, arguments. Simulated
    /// methods take no arguments. The reply is a success byte and the
    /// return value.
    fn invoke_method(
        &self,
        thread: ThreadRef,
        ctx: &InvokeContext<'_>,
        body: &mut &[u8],
        reply: &mut BytesMut,
    ) -> Result<(), ErrorCode> {
        let method = ctx.entities.method(read_i32(body)?)?;
        let _this = decode_value(body)?;
        let nargs = read_i32(body)?;
        for _ in 0..nargs {
            decode_value(body)?;
        }
        if nargs != 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        if ctx.flags & invoke_flags::VIRTUAL != 0 {
            trace!("Virtual invoke of {:?} resolves to itself", method);
        }

        let agent = self.agent().ok_or(ErrorCode::InvalidArgument)?;
        debug!("{:?} invoking {:?}", thread, method);
        let returned = self.call(&agent, thread, method, Some(ctx.abort))?;

        reply.put_u8(1);
        let value = returned.map(Value::I4).unwrap_or(Value::Void);
        encode_value(reply, &value, ctx.entities.version())
    }

    fn set_ip(&self, thread: ThreadRef, ctx: &ThreadContext, il_offset: i64) -> Result<ThreadContext, ErrorCode> {
        let mut state = self.state.lock();
        let frame = state
            .threads
            .get_mut(&thread)
            .and_then(|t| t.frames.last_mut())
            .ok_or(ErrorCode::InvalidObject)?;
        if frame.method != ctx.method {
            return Err(ErrorCode::InvalidArgument);
        }
        frame.il_offset = il_offset;
        Ok(ThreadContext {
            il_offset,
            ..ctx.clone()
        })
    }

    fn frame_command(
        &self,
        command: StackFrameCommand,
        _thread: ThreadRef,
        _frame: &FrameInfo,
        _body: &mut &[u8],
        reply: &mut BytesMut,
        entities: &Entities<'_>,
    ) -> Result<(), ErrorCode> {
        match command {
            // Simulated methods are static
            StackFrameCommand::GetThis => encode_value(reply, &Value::Null, entities.version()),
            _ => Err(ErrorCode::NotImplemented),
        }
    }

    fn handle_command(
        &self,
        command: Command,
        body: &mut &[u8],
        reply: &mut BytesMut,
        entities: &Entities<'_>,
    ) -> Result<(), ErrorCode> {
        match command {
            Command::Vm(VmCommand::GetTypes) => {
                let name = read_string(body)?;
                let ignore_case = read_u8(body)? != 0;
                let types = self
                    .program
                    .types
                    .iter()
                    .filter(|t| Self::matches_name(&t.name, &name, ignore_case));
                Self::write_type_ids(reply, entities, types);
            }
            Command::Vm(VmCommand::GetTypesForSourceFile) => {
                let file = read_string(body)?;
                let ignore_case = read_u8(body)? != 0;
                let types = self.program.types.iter().filter(|t| {
                    t.source_files.iter().any(|f| {
                        let base = f.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(f);
                        Self::matches_name(base, &file, ignore_case)
                    })
                });
                Self::write_type_ids(reply, entities, types);
            }
            Command::Method(host_commands::METHOD_GET_NAME) => {
                let method = entities.method(read_i32(body)?)?;
                let def = self.program.method(method.0).ok_or(ErrorCode::InvalidObject)?;
                write_string(reply, &def.name);
            }
            Command::Method(host_commands::METHOD_GET_DECLARING_TYPE) => {
                let method = entities.method(read_i32(body)?)?;
                let def = self.program.method(method.0).ok_or(ErrorCode::InvalidObject)?;
                reply.put_i32(entities.type_id(ROOT_DOMAIN, TypeRef(def.declaring_type)));
            }
            Command::Type(host_commands::TYPE_GET_METHODS) => {
                let (ty, _) = entities.resolve(IdKind::Type, read_i32(body)?)?;
                let ids: Vec<EntityId> = self
                    .program
                    .methods
                    .iter()
                    .filter(|m| m.declaring_type == ty)
                    .map(|m| entities.method_id(ROOT_DOMAIN, MethodRef(m.id)))
                    .collect();
                reply.put_i32(ids.len() as i32);
                for id in ids {
                    reply.put_i32(id);
                }
            }
            Command::Type(host_commands::TYPE_GET_SOURCE_FILES) => {
                let (ty, _) = entities.resolve(IdKind::Type, read_i32(body)?)?;
                let def = self.program.type_def(ty).ok_or(ErrorCode::InvalidObject)?;
                reply.put_i32(def.source_files.len() as i32);
                for file in &def.source_files {
                    write_string(reply, file);
                }
            }
            other => {
                debug!("Simulated host does not answer {:?}", other);
                return Err(ErrorCode::NotImplemented);
            }
        }
        Ok(())
    }

    fn loaded_assemblies(&self) -> Vec<(AssemblyRef, DomainRef)> {
        self.program
            .assemblies
            .iter()
            .map(|a| (AssemblyRef(a.id), ROOT_DOMAIN))
            .collect()
    }

    fn exit(&self, code: i32) {
        info!("Debugger asked the program to exit with {}", code);
        self.exit_code.store(code, Ordering::SeqCst);
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROGRAM: &str = r#"{
        "assemblies": [{ "id": 1, "name": "App" }],
        "types": [
            { "id": 1, "name": "App.Program", "assembly": 1, "source_files": ["/src/App/Program.cs"] },
            { "id": 2, "name": "App.Error", "assembly": 1 },
            { "id": 3, "name": "App.NotFound", "assembly": 1, "base": 2 }
        ],
        "methods": [
            { "id": 1, "name": "Main", "declaring_type": 1, "first_line": 5,
              "body": [{ "op": "nop" }, { "op": "call", "method": 2 }, { "op": "throw", "class": 3, "catcher": 1 }] },
            { "id": 2, "name": "Helper", "declaring_type": 1, "body": [{ "op": "native", "ms": 1 }], "returns": 7 }
        ],
        "threads": [{ "name": "main", "entry": 1 }],
        "tick_ms": 0
    }"#;

    #[test]
    fn test_parse_program() {
        let program = Program::from_json(PROGRAM).unwrap();
        assert_eq!(program.methods.len(), 2);
        assert_eq!(program.threads[0].iterations, 1);
        assert_eq!(
            program.methods[0].body[2],
            Stmt::Throw {
                class: 3,
                catcher: Some(1)
            }
        );
    }

    #[test]
    fn test_validation_rejects_dangling_references() {
        let broken = PROGRAM.replace(r#""method": 2"#, r#""method": 9"#);
        assert!(matches!(Program::from_json(&broken), Err(AgentError::Config(_))));
        assert!(Program::from_json(r#"{ "methods": [], "threads": [] }"#).is_err());
    }

    #[test]
    fn test_spawn_needs_a_spawned_thread() {
        let spawning = PROGRAM
            .replace(r#"{ "op": "nop" }, { "op": "call""#, r#"{ "op": "spawn", "thread": 1 }, { "op": "call""#)
            .replace(
                r#""threads": [{ "name": "main", "entry": 1 }]"#,
                r#""threads": [{ "name": "main", "entry": 1 }, { "name": "late", "entry": 2, "spawned": true }]"#,
            );
        let program = Program::from_json(&spawning).unwrap();
        assert!(program.threads[1].spawned);
        assert_eq!(program.methods[0].body[0], Stmt::Spawn { thread: 1 });

        let eager = spawning.replace(r#", "spawned": true"#, "");
        assert!(Program::from_json(&eager).is_err());
        let missing = spawning.replace(r#""thread": 1"#, r#""thread": 5"#);
        assert!(Program::from_json(&missing).is_err());
    }

    #[test]
    fn test_method_info_layout() {
        let host = SimHost::new(Program::from_json(PROGRAM).unwrap());
        let info = host.method_info(MethodRef(1)).unwrap();
        assert_eq!(info.seq_points.len(), 3);
        let sp = info.seq_point_at(0x10).unwrap();
        assert_eq!(sp.line, Some(6));
        assert_eq!(sp.next, vec![0x20]);
        assert!(info.seq_point_at(0x20).unwrap().next.is_empty());
        assert_eq!(info.assembly, AssemblyRef(1));
        assert!(host.method_info(MethodRef(9)).is_none());
    }

    #[test]
    fn test_type_hierarchy() {
        let host = SimHost::new(Program::from_json(PROGRAM).unwrap());
        assert!(host.is_assignable(TypeRef(2), TypeRef(3)));
        assert!(host.is_assignable(TypeRef(3), TypeRef(3)));
        assert!(!host.is_assignable(TypeRef(3), TypeRef(2)));
    }

    #[test]
    fn test_breakpoints_and_single_stepping_flags() {
        let host = SimHost::new(Program::demo());
        host.install_breakpoint(CodeRef(1), 0x10);
        host.install_breakpoint(CodeRef(1), 0x10);
        assert_eq!(host.installed_breakpoints(), 1);
        host.remove_breakpoint(CodeRef(1), 0x10);
        assert_eq!(host.installed_breakpoints(), 0);

        host.set_single_stepping(true);
        assert!(host.is_single_stepping());
    }

    #[test]
    fn test_unknown_threads_are_gone() {
        let host = SimHost::new(Program::demo());
        assert_eq!(host.async_suspend(ThreadRef(42)), AsyncSuspend::Gone);
        assert!(host.stack_walk(ThreadRef(42), &ThreadContext {
            method: MethodRef(1),
            code: CodeRef(1),
            il_offset: 0,
            sp: 0,
        })
        .is_empty());
    }

    #[test]
    fn test_exit_stops_the_program() {
        let host = SimHost::new(Program::demo());
        host.exit(3);
        assert!(host.is_exiting());
        assert_eq!(host.exit_code.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_demo_is_valid() {
        let demo = Program::demo();
        assert!(demo.validate().is_ok());
        let json = serde_json::to_string(&demo).unwrap();
        assert!(Program::from_json(&json).is_ok());
    }
}
