// Thread state and Thread command implementations
//
// Each observed thread has a ThreadDebugState in the registry holding its
// saved context and frame cache. Its suspend counters live in the coordinator.

use crate::agent::{Agent, Registry};
use crate::commands::{frame_flags, ThreadCommand};
use crate::dispatch::{HandlerResult, Reply, Request};
use crate::host::{FrameInfo, RuntimeObject};
use crate::invoke::{InvokeRecord, PendingInvoke};
use crate::protocol::ErrorCode;
use crate::reader::{read_i32, read_i64};
use crate::types::*;
use crate::writer::write_string;
use bytes::BufMut;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Managed thread state bit for a thread that has exited
const THREAD_STATE_STOPPED: u32 = 16;

/// A frame as reported to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub id: FrameId,
    pub info: FrameInfo,
    pub flags: u8,
}

#[derive(Debug)]
pub struct ThreadDebugState {
    pub thread: ThreadRef,
    pub object: Arc<dyn RuntimeObject>,
    pub os_thread: std::thread::ThreadId,
    /// Where the thread stopped, valid while it is suspended
    pub context: Option<ThreadContext>,
    /// Cached stack walk, dropped whenever the thread runs
    pub frames: Option<Vec<StackFrame>>,
    pub pending_invoke: Option<PendingInvoke>,
    /// Innermost running invoke; older ones hang off `last`
    pub invoke: Option<Box<InvokeRecord>>,
    pub disable_breakpoints: bool,
    pub terminated: bool,
    pub resumed_at: Instant,
}

impl ThreadDebugState {
    pub fn new(thread: ThreadRef, object: Arc<dyn RuntimeObject>) -> Self {
        Self {
            thread,
            object,
            os_thread: std::thread::current().id(),
            context: None,
            frames: None,
            pending_invoke: None,
            invoke: None,
            disable_breakpoints: false,
            terminated: false,
            resumed_at: Instant::now(),
        }
    }

    pub fn save_context(&mut self, ctx: ThreadContext) {
        self.context = Some(ctx);
        self.frames = None;
    }

    pub fn invalidate(&mut self) {
        self.context = None;
        self.frames = None;
    }

    /// Depth of the invoke nesting on this thread
    pub fn invoke_depth(&self) -> usize {
        let mut depth = 0;
        let mut record = self.invoke.as_deref();
        while let Some(r) = record {
            depth += 1;
            record = r.last.as_deref();
        }
        depth
    }
}

impl Agent {
    /// Frames of a stopped thread, walking the stack on first use after it stopped
    pub(crate) fn compute_frames(&self, thread: ThreadRef) -> Result<Vec<StackFrame>, ErrorCode> {
        let mut guard = self.registry.lock();
        let Registry {
            threads,
            next_frame_id,
            ..
        } = &mut *guard;

        let tls = threads.get_mut(&thread).ok_or(ErrorCode::InvalidObject)?;
        if let Some(frames) = &tls.frames {
            return Ok(frames.clone());
        }

        // Parked before running any managed code
        let Some(ctx) = tls.context.as_ref() else {
            return Ok(Vec::new());
        };
        let infos = self.host.stack_walk(thread, ctx);

        // Frames above the depth recorded when the invoke began belong to it
        let invoke_frames = tls
            .invoke
            .as_ref()
            .map(|r| infos.len().saturating_sub(r.stack_depth))
            .unwrap_or(0);

        let frames: Vec<StackFrame> = infos
            .into_iter()
            .enumerate()
            .map(|(i, info)| {
                let mut flags = 0;
                if info.native_transition {
                    flags |= frame_flags::NATIVE_TRANSITION;
                }
                if invoke_frames > 0 && i == invoke_frames - 1 {
                    flags |= frame_flags::DEBUGGER_INVOKE;
                }
                *next_frame_id += 1;
                StackFrame {
                    id: *next_frame_id,
                    info,
                    flags,
                }
            })
            .collect();

        debug!("Computed {} frames for {:?}", frames.len(), thread);
        tls.frames = Some(frames.clone());
        Ok(frames)
    }

    /// Wait for a pending suspension to reach `thread`, failing if none is under way
    pub(crate) fn ensure_thread_stopped(&self, thread: ThreadRef) -> Result<(), ErrorCode> {
        if self.coordinator.thread_stopped(thread) {
            return Ok(());
        }
        if self.coordinator.is_suspending() {
            self.wait_for_suspend();
        }
        if self.coordinator.thread_stopped(thread) {
            Ok(())
        } else {
            Err(ErrorCode::NotSuspended)
        }
    }

    fn set_ip(&self, thread: ThreadRef, method: MethodRef, il_offset: i64) -> Result<(), ErrorCode> {
        self.ensure_thread_stopped(thread)?;

        let info = self.host.method_info(method).ok_or(ErrorCode::InvalidObject)?;
        if info.seq_point_at(il_offset).is_none() {
            return Err(ErrorCode::NoSeqPointAtIlOffset);
        }

        let mut reg = self.registry.lock();
        let tls = reg.threads.get_mut(&thread).ok_or(ErrorCode::InvalidObject)?;
        let ctx = tls.context.as_ref().ok_or(ErrorCode::NotSuspended)?;
        if ctx.method != method {
            return Err(ErrorCode::InvalidArgument);
        }
        let new_ctx = self.host.set_ip(thread, ctx, il_offset)?;
        tls.save_context(new_ctx);
        Ok(())
    }
}

pub(crate) fn handle(agent: &Agent, command: ThreadCommand, req: &mut Request<'_>) -> HandlerResult {
    let thread = agent.decode_thread(&mut req.body)?;

    match command {
        ThreadCommand::GetFrameInfo => {
            let start_frame = read_i32(&mut req.body)?;
            let length = read_i32(&mut req.body)?;
            if start_frame != 0 {
                return Err(ErrorCode::NotImplemented);
            }

            agent.ensure_thread_stopped(thread)?;
            let frames = agent.compute_frames(thread)?;
            let count = if length < 0 {
                frames.len()
            } else {
                frames.len().min(length as usize)
            };

            req.reply.put_i32(count as i32);
            for frame in frames.iter().take(count) {
                req.reply.put_i32(frame.id);
                req.reply.put_i32(agent.method_id(frame.info.method));
                req.reply.put_i32(frame.info.il_offset as i32);
                req.reply.put_u8(frame.flags);
            }
        }
        ThreadCommand::GetName => {
            write_string(&mut req.reply, &agent.host.thread_info(thread).name);
        }
        ThreadCommand::GetState => {
            let mut state = agent.host.thread_info(thread).state;
            if agent.thread_terminated(thread) {
                state |= THREAD_STATE_STOPPED;
            }
            req.reply.put_u32(state);
        }
        ThreadCommand::GetInfo => {
            req.reply.put_u8(agent.host.thread_info(thread).is_thread_pool as u8);
        }
        ThreadCommand::GetId => {
            req.reply.put_u64(thread.0);
        }
        ThreadCommand::GetTid => {
            req.reply.put_u64(agent.host.thread_info(thread).native_tid);
        }
        ThreadCommand::SetIp => {
            let method = agent.decode_method(&mut req.body)?;
            let il_offset = read_i64(&mut req.body)?;
            agent.set_ip(thread, method, il_offset)?;
        }
        ThreadCommand::ElapsedTime => {
            let elapsed = agent
                .registry
                .lock()
                .threads
                .get(&thread)
                .map(|tls| tls.resumed_at.elapsed().as_millis() as u64)
                .unwrap_or(0);
            req.reply.put_u64(elapsed);
        }
    }

    Ok(Reply::Send)
}
