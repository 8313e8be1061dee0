// Single stepping
//
// A step request belongs to one thread. INTO turns on global single
// stepping so every safepoint is reported; OVER and OUT place transient
// breakpoints at the places execution can continue at in the current frame
// and its callers, so callees run at full speed. Each hit is checked against
// the stack depth (or async id) the step started at before it becomes an
// event.

use crate::agent::{Agent, Registry};
use crate::breakpoint::{BreakpointHit, BreakpointId};
use crate::events::{EventKind, EventPayload, PendingEvent};
use crate::filter::EventInfo;
use crate::host::{FrameInfo, Host, MethodAttrs};
use crate::protocol::ErrorCode;
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StepDepth {
    Into = 0,
    Over = 1,
    Out = 2,
}

impl StepDepth {
    pub fn from_i32(depth: i32) -> Option<Self> {
        match depth {
            0 => Some(StepDepth::Into),
            1 => Some(StepDepth::Over),
            2 => Some(StepDepth::Out),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum StepSize {
    Min = 0,
    Line = 1,
}

impl StepSize {
    pub fn from_i32(size: i32) -> Option<Self> {
        match size {
            0 => Some(StepSize::Min),
            1 => Some(StepSize::Line),
            _ => None,
        }
    }
}

/// Kinds of methods a step skips over
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepFilter(pub u32);

impl StepFilter {
    pub const STATIC_CTOR: u32 = 1;
    pub const HIDDEN: u32 = 2;
    pub const STEP_THROUGH: u32 = 4;
    pub const NON_USER_CODE: u32 = 8;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone)]
pub struct SingleStepReq {
    pub request: RequestId,
    pub thread: ThreadRef,
    pub depth: StepDepth,
    /// Depth currently in effect; OUT continues as OVER once the frame returned
    mode: StepDepth,
    pub size: StepSize,
    pub filter: StepFilter,
    pub start_sp: u64,
    pub start_method: Option<MethodRef>,
    /// Stack depth when the step (re)started
    pub nframes: usize,
    last_method: Option<MethodRef>,
    last_line: Option<u32>,
    /// Logical task being stepped, for code resumed from a continuation
    async_id: Option<u64>,
    transient: Vec<BreakpointId>,
    global: bool,
}

impl SingleStepReq {
    #[cfg(test)]
    pub(crate) fn is_global(&self) -> bool {
        self.global
    }

    #[cfg(test)]
    pub(crate) fn transient_breakpoints(&self) -> &[BreakpointId] {
        &self.transient
    }
}

#[derive(Debug, Default)]
pub struct StepTable {
    reqs: HashMap<RequestId, SingleStepReq>,
    /// Step filter attributes per compiled body
    attrs: HashMap<CodeRef, MethodAttrs>,
}

impl StepTable {
    pub fn get(&self, request: RequestId) -> Option<&SingleStepReq> {
        self.reqs.get(&request)
    }

    pub fn len(&self) -> usize {
        self.reqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn start_method(&self, request: RequestId) -> Option<MethodRef> {
        self.reqs.get(&request).and_then(|r| r.start_method)
    }

    pub fn method_attrs(&mut self, host: &dyn Host, code: CodeRef, method: MethodRef) -> MethodAttrs {
        *self.attrs.entry(code).or_insert_with(|| {
            trace!("Resolving step filter attributes of {:?}", method);
            host.method_info(method).map(|m| m.attrs).unwrap_or_default()
        })
    }
}

/// Source line of a frame's position, if it has one
fn line_at(host: &dyn Host, method: MethodRef, il_offset: i64) -> Option<u32> {
    host.method_info(method)?.seq_point_at(il_offset)?.line
}

impl Registry {
    pub(crate) fn start_single_stepping(&mut self, host: &dyn Host) {
        self.single_stepping += 1;
        if self.single_stepping == 1 {
            debug!("Single stepping on");
            host.set_single_stepping(true);
        }
    }

    pub(crate) fn stop_single_stepping(&mut self, host: &dyn Host) {
        if self.single_stepping == 0 {
            error!("Single stepping turned off more often than on");
            panic!("single stepping count underflow");
        }
        self.single_stepping -= 1;
        if self.single_stepping == 0 {
            debug!("Single stepping off");
            host.set_single_stepping(false);
        }
    }

    /// Arm a step from the given stack, innermost frame first
    fn ss_start(&mut self, host: &dyn Host, req: &mut SingleStepReq, frames: &[FrameInfo]) {
        self.ss_stop(host, req);

        if req.mode != StepDepth::Into {
            let skip = if req.mode == StepDepth::Out { 1 } else { 0 };
            for frame in frames.iter().skip(skip) {
                let Some(info) = host.method_info(frame.method) else {
                    continue;
                };
                let Some(sp) = info.seq_point_at(frame.il_offset) else {
                    continue;
                };
                for next in &sp.next {
                    match self
                        .breakpoints
                        .set(host, Some(frame.method), *next, req.request, EventKind::Step)
                    {
                        Ok(id) => req.transient.push(id),
                        Err(e) => trace!("No step target at {:?}+{:#x}: {}", frame.method, next, e),
                    }
                }
            }
        }

        if req.transient.is_empty() {
            self.start_single_stepping(host);
            req.global = true;
        }

        debug!(
            "Step {} armed on {:?}: {:?}, {} transient breakpoints, global={}",
            req.request,
            req.thread,
            req.mode,
            req.transient.len(),
            req.global
        );
    }

    fn ss_stop(&mut self, host: &dyn Host, req: &mut SingleStepReq) {
        for id in req.transient.drain(..) {
            self.breakpoints.clear(host, id);
        }
        if req.global {
            self.stop_single_stepping(host);
            req.global = false;
        }
    }

    pub(crate) fn ss_destroy(&mut self, host: &dyn Host, request: RequestId) {
        if let Some(mut req) = self.steps.reqs.remove(&request) {
            self.ss_stop(host, &mut req);
            debug!("Step {} destroyed", request);
        }
    }

    /// Decide whether a hit completes the step. Filtered hits rearm the step
    /// where needed and return false.
    fn ss_update(
        &mut self,
        host: &dyn Host,
        request: RequestId,
        thread: ThreadRef,
        ctx: &ThreadContext,
        frames: &[FrameInfo],
    ) -> bool {
        let Some(mut req) = self.steps.reqs.remove(&request) else {
            return false;
        };
        let completed = self.ss_check(host, &mut req, thread, ctx, frames);
        self.steps.reqs.insert(request, req);
        completed
    }

    fn ss_check(
        &mut self,
        host: &dyn Host,
        req: &mut SingleStepReq,
        thread: ThreadRef,
        ctx: &ThreadContext,
        frames: &[FrameInfo],
    ) -> bool {
        if req.thread != thread {
            return false;
        }

        let nframes = frames.len();
        match req.async_id {
            Some(async_id) => {
                if frames.first().and_then(|f| f.async_id) != Some(async_id) {
                    trace!("Step {}: hit in another task", req.request);
                    return false;
                }
            }
            None => match req.mode {
                StepDepth::Over if nframes > req.nframes => {
                    trace!("Step {}: hit in a deeper frame", req.request);
                    return false;
                }
                StepDepth::Out if nframes >= req.nframes => {
                    trace!("Step {}: frame has not returned yet", req.request);
                    return false;
                }
                _ => {}
            },
        }

        if req.size == StepSize::Line {
            let line = line_at(host, ctx.method, ctx.il_offset);
            let same_line = Some(ctx.method) == req.last_method && line == req.last_line;
            if line.is_none() || same_line {
                trace!("Step {}: still on line {:?}", req.request, line);
                if req.mode == StepDepth::Out {
                    req.mode = StepDepth::Over;
                }
                if line.is_some() {
                    req.last_method = Some(ctx.method);
                }
                req.nframes = nframes;
                if !req.global {
                    self.ss_start(host, req, frames);
                }
                return false;
            }
            req.last_line = line;
        }

        req.last_method = Some(ctx.method);
        req.nframes = nframes;
        req.start_sp = ctx.sp;
        req.mode = req.depth;
        self.ss_start(host, req, frames);
        true
    }
}

impl Agent {
    pub(crate) fn start_single_stepping(&self, reg: &mut Registry) {
        reg.start_single_stepping(&*self.host);
    }

    pub(crate) fn stop_single_stepping(&self, reg: &mut Registry) {
        reg.stop_single_stepping(&*self.host);
    }

    /// Create the step state for a STEP request on a suspended thread
    pub(crate) fn ss_create(
        &self,
        thread: ThreadRef,
        size: StepSize,
        depth: StepDepth,
        filter: StepFilter,
        request: RequestId,
    ) -> Result<(), ErrorCode> {
        if !self.coordinator.is_suspending() {
            return Err(ErrorCode::NotSuspended);
        }
        self.wait_for_suspend();
        if !self.coordinator.thread_stopped(thread) {
            return Err(ErrorCode::NotSuspended);
        }

        let frames: Vec<FrameInfo> = self
            .compute_frames(thread)?
            .into_iter()
            .map(|f| f.info)
            .collect();

        let mut reg = self.registry.lock();
        if reg.steps.reqs.values().any(|r| r.thread == thread) {
            // One step per thread
            return Err(ErrorCode::NotImplemented);
        }

        let top = frames.first();
        let mut req = SingleStepReq {
            request,
            thread,
            depth,
            mode: depth,
            size,
            filter,
            start_sp: top.map(|f| f.sp).unwrap_or(0),
            start_method: top.map(|f| f.method),
            nframes: frames.len(),
            last_method: top.map(|f| f.method),
            last_line: top.and_then(|f| line_at(&*self.host, f.method, f.il_offset)),
            async_id: if depth == StepDepth::Into {
                None
            } else {
                top.and_then(|f| f.async_id)
            },
            transient: Vec::new(),
            global: false,
        };

        debug!(
            "Step {} on {:?}: {:?}/{:?} from {} frames",
            request,
            thread,
            depth,
            size,
            frames.len()
        );
        reg.ss_start(&*self.host, &mut req, &frames);
        reg.steps.reqs.insert(request, req);
        Ok(())
    }

    /// Step, breakpoint and method entry/exit events for a thread at a
    /// safepoint. Decided here, before the thread may park.
    pub(crate) fn collect_safepoint_events(&self, thread: ThreadRef, ctx: &ThreadContext) -> Vec<PendingEvent> {
        let version = self.protocol_version();
        let host = &*self.host;
        let mut reg = self.registry.lock();

        match reg.threads.get(&thread) {
            Some(tls) if !tls.disable_breakpoints => {}
            _ => return Vec::new(),
        }

        let hits = reg.breakpoints.hits(ctx.code, ctx.il_offset);
        let info = EventInfo {
            thread: Some(thread),
            method: Some(ctx.method),
            code: Some(ctx.code),
            ..Default::default()
        };
        let by_kind = |kind: EventKind| -> Vec<RequestId> {
            let mut ids: Vec<RequestId> = hits
                .iter()
                .filter(|h: &&BreakpointHit| h.kind == kind)
                .map(|h| h.request)
                .collect();
            ids.dedup();
            ids
        };

        let mut candidates: Vec<RequestId> = reg
            .steps
            .reqs
            .values()
            .filter(|r| r.global && r.thread == thread)
            .map(|r| r.request)
            .collect();
        for id in by_kind(EventKind::Step) {
            if !candidates.contains(&id) {
                candidates.push(id);
            }
        }

        let mut completed = Vec::new();
        if !candidates.is_empty() {
            let frames = host.stack_walk(thread, ctx);
            for id in candidates {
                if reg.ss_update(host, id, thread, ctx, &frames) {
                    completed.push(id);
                }
            }
        }

        let mut events = Vec::new();
        if !completed.is_empty() {
            let matched = reg.create_event_list(host, EventKind::Step, Some(&completed), &info, version);
            if !matched.requests.is_empty() {
                events.push(PendingEvent {
                    payload: EventPayload::Step {
                        method: ctx.method,
                        il_offset: ctx.il_offset,
                    },
                    requests: matched.requests,
                    policy: matched.policy,
                });
                return events;
            }
        }

        let breakpoints = by_kind(EventKind::Breakpoint);
        if !breakpoints.is_empty() {
            let matched = reg.create_event_list(host, EventKind::Breakpoint, Some(&breakpoints), &info, version);
            if !matched.requests.is_empty() {
                events.push(PendingEvent {
                    payload: EventPayload::Breakpoint {
                        method: ctx.method,
                        il_offset: ctx.il_offset,
                    },
                    requests: matched.requests,
                    policy: matched.policy,
                });
                return events;
            }
        }

        for (kind, payload) in [
            (EventKind::MethodEntry, EventPayload::MethodEntry(ctx.method)),
            (EventKind::MethodExit, EventPayload::MethodExit(ctx.method)),
        ] {
            let ids = by_kind(kind);
            if ids.is_empty() {
                continue;
            }
            let matched = reg.create_event_list(host, kind, Some(&ids), &info, version);
            if !matched.requests.is_empty() {
                events.push(PendingEvent {
                    payload,
                    requests: matched.requests,
                    policy: matched.policy,
                });
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::tests::FakeHost;
    use crate::host::CompiledCode;

    // FakeHost methods have seq points at 0x00..0x30 on lines 10..13,
    // each continuing at the next one

    fn frame(method: u64, il_offset: i64, depth: u64) -> FrameInfo {
        FrameInfo {
            method: MethodRef(method),
            code: CodeRef(method * 10),
            il_offset,
            sp: 0x10000 - depth * 0x100,
            async_id: None,
            native_transition: false,
        }
    }

    fn ctx(f: &FrameInfo) -> ThreadContext {
        ThreadContext {
            method: f.method,
            code: f.code,
            il_offset: f.il_offset,
            sp: f.sp,
        }
    }

    fn host() -> FakeHost {
        let host = FakeHost::default();
        for m in 1..=3 {
            host.compiled.lock().push(CompiledCode {
                code: CodeRef(m * 10),
                method: MethodRef(m),
                generic_definition: None,
            });
        }
        host
    }

    fn step(reg: &mut Registry, host: &FakeHost, depth: StepDepth, size: StepSize, frames: &[FrameInfo]) -> RequestId {
        let id = reg.next_request_id();
        let top = &frames[0];
        let mut req = SingleStepReq {
            request: id,
            thread: ThreadRef(1),
            depth,
            mode: depth,
            size,
            filter: StepFilter::default(),
            start_sp: top.sp,
            start_method: Some(top.method),
            nframes: frames.len(),
            last_method: Some(top.method),
            last_line: line_at(host, top.method, top.il_offset),
            async_id: None,
            transient: Vec::new(),
            global: false,
        };
        reg.ss_start(host, &mut req, frames);
        reg.steps.reqs.insert(id, req);
        id
    }

    #[test]
    fn test_into_uses_global_stepping() {
        let host = host();
        let mut reg = Registry::default();
        let frames = [frame(1, 0, 1)];
        let id = step(&mut reg, &host, StepDepth::Into, StepSize::Min, &frames);

        assert!(reg.steps.get(id).unwrap().is_global());
        assert!(*host.single_stepping.lock());

        reg.ss_destroy(&host, id);
        assert!(!*host.single_stepping.lock());
        assert_eq!(reg.single_stepping, 0);
    }

    #[test]
    fn test_over_ignores_deeper_frames() {
        let host = host();
        let mut reg = Registry::default();

        // Stopped in method 2 at depth 3, called from method 1
        let frames = [frame(2, 0x10, 3), frame(1, 0x10, 2), frame(1, 0x00, 1)];
        let id = step(&mut reg, &host, StepDepth::Over, StepSize::Min, &frames);
        let req = reg.steps.get(id).unwrap();
        assert!(!req.is_global());
        assert_eq!(req.transient_breakpoints().len(), 3);
        assert!(host.installed.lock().contains(&(CodeRef(20), 0x20)));
        assert!(host.installed.lock().contains(&(CodeRef(10), 0x20)));
        assert!(host.installed.lock().contains(&(CodeRef(10), 0x10)));

        // Recursion into method 2 hits the transient breakpoint one level deeper
        let deeper = [frame(2, 0x20, 4), frame(2, 0x10, 3), frame(1, 0x10, 2), frame(1, 0x00, 1)];
        assert!(!reg.ss_update(&host, id, ThreadRef(1), &ctx(&deeper[0]), &deeper));

        // Another thread never completes the step
        let same = [frame(2, 0x20, 3), frame(1, 0x10, 2), frame(1, 0x00, 1)];
        assert!(!reg.ss_update(&host, id, ThreadRef(2), &ctx(&same[0]), &same));

        assert!(reg.ss_update(&host, id, ThreadRef(1), &ctx(&same[0]), &same));
        // Rearmed from the new position
        assert!(host.installed.lock().contains(&(CodeRef(20), 0x30)));
    }

    #[test]
    fn test_out_waits_for_return() {
        let host = host();
        let mut reg = Registry::default();
        let frames = [frame(2, 0x10, 2), frame(1, 0x00, 1)];
        let id = step(&mut reg, &host, StepDepth::Out, StepSize::Min, &frames);
        assert_eq!(reg.steps.get(id).unwrap().transient_breakpoints().len(), 1);

        let still_inside = [frame(2, 0x20, 2), frame(1, 0x00, 1)];
        assert!(!reg.ss_update(&host, id, ThreadRef(1), &ctx(&still_inside[0]), &still_inside));

        let returned = [frame(1, 0x10, 1)];
        assert!(reg.ss_update(&host, id, ThreadRef(1), &ctx(&returned[0]), &returned));
    }

    #[test]
    fn test_line_step_skips_same_line() {
        let host = host();
        let mut reg = Registry::default();
        let frames = [frame(1, 0x00, 1)];
        let id = step(&mut reg, &host, StepDepth::Into, StepSize::Line, &frames);

        // Method 1 again at offset 0: same method, same line
        assert!(!reg.ss_update(&host, id, ThreadRef(1), &ctx(&frames[0]), &frames));

        let next_line = [frame(1, 0x10, 1)];
        assert!(reg.ss_update(&host, id, ThreadRef(1), &ctx(&next_line[0]), &next_line));
    }

    #[test]
    fn test_attrs_are_cached_per_code() {
        let host = host();
        let mut table = StepTable::default();
        let attrs = table.method_attrs(&host, CodeRef(10), MethodRef(1));
        assert_eq!(attrs, MethodAttrs::default());
        // Cached: the method is no longer consulted
        assert_eq!(table.method_attrs(&host, CodeRef(10), MethodRef(99)), attrs);
    }

    #[test]
    #[should_panic(expected = "single stepping count underflow")]
    fn test_unbalanced_stop_panics() {
        let host = host();
        let mut reg = Registry::default();
        reg.stop_single_stepping(&host);
    }
}
