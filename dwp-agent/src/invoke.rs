// Method invocation on suspended threads
//
// VM.INVOKE_METHOD(S) parks the request on the target thread and lets that
// thread run. The thread executes it from inside `suspend_current`, replies,
// and goes back to sleep. Invokes nest through the `last` link.

use crate::agent::Agent;
use crate::commands::invoke_flags;
use crate::dispatch::{HandlerResult, Reply, Request};
use crate::host::InvokeContext;
use crate::ids::Entities;
use crate::protocol::ErrorCode;
use crate::reader::{read_i32, read_u32};
use crate::thread::StackFrame;
use crate::types::{ThreadContext, ThreadRef};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An invoke waiting for its thread to pick it up
#[derive(Debug, Clone)]
pub struct PendingInvoke {
    /// Packet id of the command, reused for every reply
    pub id: u32,
    pub flags: u32,
    /// Encoded methods and arguments
    pub body: Bytes,
    /// Global suspend count when the invoke was requested
    pub suspend_count: u32,
    pub nmethods: u32,
    /// Resume count granted to the thread for a single threaded invoke
    pub resume_delta: u32,
}

impl PendingInvoke {
    pub fn single_threaded(&self) -> bool {
        self.flags & invoke_flags::SINGLE_THREADED != 0
    }
}

/// An invoke that is running
#[derive(Debug)]
pub struct InvokeRecord {
    pub id: u32,
    pub flags: u32,
    pub abort: Arc<AtomicBool>,
    saved_context: Option<ThreadContext>,
    saved_frames: Option<Vec<StackFrame>>,
    /// Frames on the thread's stack when the invoke started
    pub stack_depth: usize,
    prev_disable_breakpoints: bool,
    pub last: Option<Box<InvokeRecord>>,
}

/// VM.INVOKE_METHOD and VM.INVOKE_METHODS
pub(crate) fn request_invoke(agent: &Agent, req: &mut Request<'_>, multiple: bool) -> HandlerResult {
    let thread = agent.decode_thread(&mut req.body)?;
    let flags = read_u32(&mut req.body)?;
    let nmethods = if multiple {
        let n = read_i32(&mut req.body)?;
        if n <= 0 {
            return Err(ErrorCode::InvalidArgument);
        }
        n as u32
    } else {
        1
    };

    let suspend_count = agent.coordinator.suspend_count();
    if suspend_count > 0 {
        agent.wait_for_suspend();
    }
    if !agent.coordinator.is_suspended() {
        return Err(ErrorCode::NotSuspended);
    }
    if !agent.coordinator.really_suspended(thread) {
        // Captured in native code, it cannot run anything for us
        return Err(ErrorCode::NotSuspended);
    }

    let single_threaded = flags & invoke_flags::SINGLE_THREADED != 0;
    {
        let mut reg = agent.registry.lock();
        let tls = reg.threads.get_mut(&thread).ok_or(ErrorCode::InvalidObject)?;
        if tls.pending_invoke.is_some() {
            return Err(ErrorCode::NotSuspended);
        }

        // The thread picks the invoke up only after we let go of the registry
        let resume_delta = if single_threaded {
            agent.resume_thread(thread)
        } else {
            0
        };

        tls.pending_invoke = Some(PendingInvoke {
            id: req.id,
            flags,
            body: Bytes::copy_from_slice(req.body),
            suspend_count,
            nmethods,
            resume_delta,
        });
    }

    info!(
        "Invoke {} queued on {:?}, {} methods, flags={:#x}",
        req.id, thread, nmethods, flags
    );

    if !single_threaded {
        for _ in 0..suspend_count {
            agent.resume_vm();
        }
    }

    Ok(Reply::Deferred)
}

/// VM.ABORT_INVOKE
pub(crate) fn abort_invoke(agent: &Agent, req: &mut Request<'_>) -> HandlerResult {
    let thread = agent.decode_thread(&mut req.body)?;
    let id = read_i32(&mut req.body)? as u32;

    {
        let reg = agent.registry.lock();
        let tls = reg.threads.get(&thread).ok_or(ErrorCode::InvalidObject)?;
        match tls.invoke.as_deref() {
            Some(record) if record.id == id => record.abort.store(true, Ordering::SeqCst),
            _ => return Err(ErrorCode::NoInvocation),
        }
    }

    debug!("Aborting invoke {} on {:?}", id, thread);
    agent.host.abort_invoke(thread);
    Ok(Reply::Send)
}

impl Agent {
    /// Run a pending invoke on the calling thread, which must be `thread`
    pub(crate) fn invoke_method(&self, thread: ThreadRef, invoke: PendingInvoke) {
        let abort = Arc::new(AtomicBool::new(false));

        {
            let mut reg = self.registry.lock();
            let Some(tls) = reg.threads.get_mut(&thread) else {
                return;
            };

            let stack_depth = tls
                .context
                .as_ref()
                .map(|ctx| self.host.stack_walk(thread, ctx).len())
                .unwrap_or(0);

            let record = InvokeRecord {
                id: invoke.id,
                flags: invoke.flags,
                abort: Arc::clone(&abort),
                saved_context: tls.context.take(),
                saved_frames: tls.frames.take(),
                stack_depth,
                prev_disable_breakpoints: tls.disable_breakpoints,
                last: tls.invoke.take(),
            };
            tls.invoke = Some(Box::new(record));

            if invoke.flags & invoke_flags::DISABLE_BREAKPOINTS != 0 {
                tls.disable_breakpoints = true;
            }
            debug!("{:?} starts invoke {}, depth {}", thread, invoke.id, tls.invoke_depth());
        }

        let entities = Entities::new(self);
        let mut body: &[u8] = &invoke.body;

        for i in 0..invoke.nmethods {
            let ctx = InvokeContext {
                flags: invoke.flags,
                abort: &abort,
                entities: &entities,
            };
            let mut reply = BytesMut::new();
            let mut result = self.host.invoke_method(thread, &ctx, &mut body, &mut reply);
            if result.is_err() && abort.load(Ordering::SeqCst) {
                result = Err(ErrorCode::InvokeAborted);
            }
            if let Err(err) = result {
                warn!("Invoke {} on {:?} failed: {}", invoke.id, thread, err);
            }

            // The client may send commands as soon as it sees the last reply
            if i + 1 == invoke.nmethods && !invoke.single_threaded() {
                for _ in 0..invoke.suspend_count {
                    self.suspend_vm(Some(thread));
                }
            }

            self.send_reply(invoke.id, result, reply);
        }

        {
            let mut reg = self.registry.lock();
            if let Some(tls) = reg.threads.get_mut(&thread) {
                if let Some(record) = tls.invoke.take() {
                    let record = *record;
                    tls.context = record.saved_context;
                    tls.frames = record.saved_frames;
                    tls.disable_breakpoints = record.prev_disable_breakpoints;
                    tls.invoke = record.last;
                }
            }
        }

        if invoke.single_threaded() {
            self.coordinator.release_resume(thread, invoke.resume_delta);
        }
        debug!("{:?} finished invoke {}", thread, invoke.id);
    }
}
