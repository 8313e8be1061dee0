// Host execution environment interface
//
// The agent never touches threads, code or metadata directly. Everything it
// needs from the runtime goes through the `Host` trait, and everything the
// runtime reports comes back through the notification methods on `Agent`.

use crate::commands::{Command, StackFrameCommand};
use crate::ids::Entities;
use crate::protocol::ErrorCode;
use crate::types::*;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A heap object the agent may hand out an ID for.
///
/// The agent only keeps weak references, except while the VM is suspended.
pub trait RuntimeObject: Send + Sync + fmt::Debug {
    fn address(&self) -> u64;
    fn domain(&self) -> DomainRef;
    fn class(&self) -> TypeRef;

    /// The thread this object represents, if it is a thread object
    fn as_thread(&self) -> Option<ThreadRef> {
        None
    }
}

/// Outcome of asking the host to interrupt a thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncSuspend {
    /// Running managed code, it will stop at its next safepoint
    Cooperative,
    /// Stopped in native code; this is where it was
    Captured(ThreadContext),
    /// Already gone
    Gone,
}

/// One frame of a stack walk, innermost first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub method: MethodRef,
    pub code: CodeRef,
    pub il_offset: i64,
    pub sp: u64,
    /// Logical task the frame belongs to, for code resumed from a continuation
    pub async_id: Option<u64>,
    pub native_transition: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqPoint {
    pub il_offset: i64,
    pub line: Option<u32>,
    /// Offsets of the sequence points that can execute next in the same method
    pub next: Vec<i64>,
}

/// Debugger attributes consulted by step filters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodAttrs {
    #[serde(default)]
    pub static_ctor: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub step_through: bool,
    #[serde(default)]
    pub non_user_code: bool,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub declaring_type: TypeRef,
    pub assembly: AssemblyRef,
    pub domain: DomainRef,
    /// Set for specializations of a generic method
    pub generic_definition: Option<MethodRef>,
    pub seq_points: Vec<SeqPoint>,
    pub attrs: MethodAttrs,
    pub has_entry_exit_hooks: bool,
}

impl MethodInfo {
    pub fn seq_point_at(&self, il_offset: i64) -> Option<&SeqPoint> {
        self.seq_points.iter().find(|sp| sp.il_offset == il_offset)
    }
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub full_name: String,
    pub assembly: AssemblyRef,
    pub source_files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ThreadInfo {
    pub name: String,
    pub is_thread_pool: bool,
    pub native_tid: u64,
    /// Managed thread state bits
    pub state: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompiledCode {
    pub code: CodeRef,
    pub method: MethodRef,
    pub generic_definition: Option<MethodRef>,
}

impl CompiledCode {
    /// True if this code realizes `method`, directly or as a specialization
    pub fn implements(&self, method: MethodRef) -> bool {
        self.method == method || self.generic_definition == Some(method)
    }
}

/// An exception as reported by the host
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    pub object: Arc<dyn RuntimeObject>,
    pub class: TypeRef,
    pub caught: bool,
    /// Method that will handle it, when caught
    pub catch_method: Option<MethodRef>,
}

/// What a host needs to run one method of an invoke request
pub struct InvokeContext<'a> {
    pub flags: u32,
    /// Set when the client asked to abort; poll it at cooperative checkpoints
    pub abort: &'a AtomicBool,
    pub entities: &'a Entities<'a>,
}

pub trait Host: Send + Sync + 'static {
    fn async_suspend(&self, thread: ThreadRef) -> AsyncSuspend;

    fn stack_walk(&self, thread: ThreadRef, ctx: &ThreadContext) -> Vec<FrameInfo>;

    fn thread_info(&self, thread: ThreadRef) -> ThreadInfo;

    fn method_info(&self, method: MethodRef) -> Option<MethodInfo>;

    fn type_info(&self, ty: TypeRef) -> Option<TypeInfo>;

    /// True if a value of type `derived` can be stored in a `base`
    fn is_assignable(&self, base: TypeRef, derived: TypeRef) -> bool;

    fn compiled_code(&self) -> Vec<CompiledCode>;

    fn install_breakpoint(&self, code: CodeRef, il_offset: i64);

    fn remove_breakpoint(&self, code: CodeRef, il_offset: i64);

    /// Make every thread report every safepoint
    fn set_single_stepping(&self, enabled: bool);

    /// Run one method of an invoke request on the calling thread.
    ///
    /// `body` is positioned at the method's encoded arguments and must be
    /// advanced past them.
    fn invoke_method(
        &self,
        thread: ThreadRef,
        ctx: &InvokeContext<'_>,
        body: &mut &[u8],
        reply: &mut BytesMut,
    ) -> Result<(), ErrorCode>;

    /// Try to interrupt a running invoke
    fn abort_invoke(&self, _thread: ThreadRef) {}

    fn set_ip(
        &self,
        _thread: ThreadRef,
        _ctx: &ThreadContext,
        _il_offset: i64,
    ) -> Result<ThreadContext, ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    /// Stack frame variable access
    fn frame_command(
        &self,
        _command: StackFrameCommand,
        _thread: ThreadRef,
        _frame: &FrameInfo,
        _body: &mut &[u8],
        _reply: &mut BytesMut,
        _entities: &Entities<'_>,
    ) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    /// Metadata and object commands the agent only routes
    fn handle_command(
        &self,
        _command: Command,
        _body: &mut &[u8],
        _reply: &mut BytesMut,
        _entities: &Entities<'_>,
    ) -> Result<(), ErrorCode> {
        Err(ErrorCode::NotImplemented)
    }

    fn loaded_assemblies(&self) -> Vec<(AssemblyRef, DomainRef)> {
        Vec::new()
    }

    fn exit(&self, code: i32);
}
