// Breakpoints
//
// A breakpoint is a (method or wildcard, il offset) pair realized as one
// instance per compiled body of the method. Physical locations are reference
// counted so overlapping breakpoints install and remove code patches once.

use crate::commands::{METHOD_ENTRY_IL_OFFSET, METHOD_EXIT_IL_OFFSET};
use crate::events::EventKind;
use crate::host::{CompiledCode, Host};
use crate::protocol::ErrorCode;
use crate::types::*;
use std::collections::HashMap;
use tracing::{debug, trace};

pub type BreakpointId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInstance {
    pub code: CodeRef,
    pub method: MethodRef,
    pub domain: DomainRef,
    pub assembly: AssemblyRef,
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub id: BreakpointId,
    /// None matches every method with entry/exit hooks
    pub method: Option<MethodRef>,
    pub il_offset: i64,
    /// Request this breakpoint reports to
    pub request: RequestId,
    /// BREAKPOINT, STEP (transient), METHOD_ENTRY or METHOD_EXIT
    pub kind: EventKind,
    pub instances: Vec<BreakpointInstance>,
}

impl Breakpoint {
    /// Not yet realized in any compiled code
    pub fn is_pending(&self) -> bool {
        self.instances.is_empty()
    }

    fn wants(&self, code: &CompiledCode) -> bool {
        match self.method {
            Some(method) => code.implements(method),
            None => true,
        }
    }
}

/// A breakpoint that fired at a location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakpointHit {
    pub id: BreakpointId,
    pub request: RequestId,
    pub kind: EventKind,
}

#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: Vec<Breakpoint>,
    /// Install count per physical location
    locations: HashMap<(CodeRef, i64), u32>,
    next_id: BreakpointId,
}

impl BreakpointTable {
    /// Create a breakpoint and realize it in every compiled body that exists
    pub fn set(
        &mut self,
        host: &dyn Host,
        method: Option<MethodRef>,
        il_offset: i64,
        request: RequestId,
        kind: EventKind,
    ) -> Result<BreakpointId, ErrorCode> {
        if let Some(method) = method {
            let info = host.method_info(method).ok_or(ErrorCode::InvalidObject)?;
            if info.seq_point_at(il_offset).is_none() {
                return Err(ErrorCode::NoSeqPointAtIlOffset);
            }
        }

        self.next_id += 1;
        let mut bp = Breakpoint {
            id: self.next_id,
            method,
            il_offset,
            request,
            kind,
            instances: Vec::new(),
        };

        for code in host.compiled_code() {
            if bp.wants(&code) {
                self.insert_instance(host, &mut bp, code);
            }
        }

        if bp.is_pending() {
            debug!(
                "Breakpoint {} at {:?}+{:#x} is pending",
                bp.id, bp.method, il_offset
            );
        } else {
            debug!(
                "Breakpoint {} at {:?}+{:#x} has {} instances",
                bp.id,
                bp.method,
                il_offset,
                bp.instances.len()
            );
        }

        let id = bp.id;
        self.breakpoints.push(bp);
        Ok(id)
    }

    fn insert_instance(&mut self, host: &dyn Host, bp: &mut Breakpoint, code: CompiledCode) {
        if bp.instances.iter().any(|i| i.code == code.code) {
            return;
        }
        let Some(info) = host.method_info(code.method) else {
            return;
        };
        if bp.method.is_none() && !info.has_entry_exit_hooks {
            return;
        }

        let count = self.locations.entry((code.code, bp.il_offset)).or_insert(0);
        *count += 1;
        if *count == 1 {
            trace!("Installing breakpoint at {:?}+{:#x}", code.code, bp.il_offset);
            host.install_breakpoint(code.code, bp.il_offset);
        }

        bp.instances.push(BreakpointInstance {
            code: code.code,
            method: code.method,
            domain: info.domain,
            assembly: info.assembly,
        });
    }

    fn remove_instance(&mut self, host: &dyn Host, instance: &BreakpointInstance, il_offset: i64) {
        let key = (instance.code, il_offset);
        if let Some(count) = self.locations.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.locations.remove(&key);
                trace!("Removing breakpoint at {:?}+{:#x}", instance.code, il_offset);
                host.remove_breakpoint(instance.code, il_offset);
            }
        }
    }

    pub fn clear(&mut self, host: &dyn Host, id: BreakpointId) -> Option<Breakpoint> {
        let index = self.breakpoints.iter().position(|bp| bp.id == id)?;
        let bp = self.breakpoints.remove(index);
        for instance in &bp.instances {
            self.remove_instance(host, instance, bp.il_offset);
        }
        debug!("Cleared breakpoint {}", id);
        Some(bp)
    }

    /// Realize pending and wildcard breakpoints in newly compiled code
    pub fn method_compiled(&mut self, host: &dyn Host, code: CompiledCode) {
        let mut breakpoints = std::mem::take(&mut self.breakpoints);
        for bp in breakpoints.iter_mut() {
            if bp.wants(&code) {
                let was_pending = bp.is_pending();
                self.insert_instance(host, bp, code);
                if was_pending && !bp.is_pending() {
                    debug!("Resolved pending breakpoint {} in {:?}", bp.id, code.code);
                }
            }
        }
        self.breakpoints = breakpoints;
    }

    /// Drop instances living in an unloaded domain
    pub fn domain_unloaded(&mut self, host: &dyn Host, domain: DomainRef) {
        self.retain_instances(host, |i| i.domain != domain);
    }

    /// Drop instances of methods from an unloaded assembly
    pub fn assembly_unloaded(&mut self, host: &dyn Host, assembly: AssemblyRef) {
        self.retain_instances(host, |i| i.assembly != assembly);
    }

    fn retain_instances(&mut self, host: &dyn Host, keep: impl Fn(&BreakpointInstance) -> bool) {
        let mut breakpoints = std::mem::take(&mut self.breakpoints);
        for bp in breakpoints.iter_mut() {
            let (kept, dropped): (Vec<_>, Vec<_>) = bp.instances.drain(..).partition(|i| keep(i));
            for instance in &dropped {
                self.remove_instance(host, instance, bp.il_offset);
            }
            bp.instances = kept;
        }
        self.breakpoints = breakpoints;
    }

    /// Breakpoints realized at a physical location
    pub fn hits(&self, code: CodeRef, il_offset: i64) -> Vec<BreakpointHit> {
        if !self.locations.contains_key(&(code, il_offset)) {
            return Vec::new();
        }
        self.breakpoints
            .iter()
            .filter(|bp| bp.il_offset == il_offset && bp.instances.iter().any(|i| i.code == code))
            .map(|bp| BreakpointHit {
                id: bp.id,
                request: bp.request,
                kind: bp.kind,
            })
            .collect()
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.id == id)
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn installed_locations(&self) -> usize {
        self.locations.len()
    }
}

/// Il offset a method entry/exit request hooks
pub fn hook_offset(kind: EventKind) -> Option<i64> {
    match kind {
        EventKind::MethodEntry => Some(METHOD_ENTRY_IL_OFFSET),
        EventKind::MethodExit => Some(METHOD_EXIT_IL_OFFSET),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::host::*;
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Host with two methods; method 2 is generic with one specialization
    #[derive(Default)]
    pub(crate) struct FakeHost {
        pub compiled: Mutex<Vec<CompiledCode>>,
        pub installed: Mutex<HashSet<(CodeRef, i64)>>,
        pub installs: Mutex<u32>,
        pub single_stepping: Mutex<bool>,
    }

    impl FakeHost {
        pub fn method(id: u64) -> MethodInfo {
            MethodInfo {
                name: format!("M{}", id),
                declaring_type: TypeRef(1),
                assembly: AssemblyRef(1),
                domain: DomainRef(1),
                generic_definition: None,
                seq_points: (0..4)
                    .map(|i| SeqPoint {
                        il_offset: i * 0x10,
                        line: Some(10 + i as u32),
                        next: if i < 3 { vec![(i + 1) * 0x10] } else { vec![] },
                    })
                    .collect(),
                attrs: MethodAttrs::default(),
                has_entry_exit_hooks: id == 1,
            }
        }
    }

    impl Host for FakeHost {
        fn async_suspend(&self, _thread: ThreadRef) -> AsyncSuspend {
            AsyncSuspend::Cooperative
        }
        fn stack_walk(&self, _thread: ThreadRef, _ctx: &ThreadContext) -> Vec<FrameInfo> {
            Vec::new()
        }
        fn thread_info(&self, _thread: ThreadRef) -> ThreadInfo {
            ThreadInfo::default()
        }
        fn method_info(&self, method: MethodRef) -> Option<MethodInfo> {
            (1..=3).contains(&method.0).then(|| Self::method(method.0))
        }
        fn type_info(&self, _ty: TypeRef) -> Option<TypeInfo> {
            None
        }
        fn is_assignable(&self, base: TypeRef, derived: TypeRef) -> bool {
            base == derived
        }
        fn compiled_code(&self) -> Vec<CompiledCode> {
            self.compiled.lock().clone()
        }
        fn install_breakpoint(&self, code: CodeRef, il_offset: i64) {
            self.installed.lock().insert((code, il_offset));
            *self.installs.lock() += 1;
        }
        fn remove_breakpoint(&self, code: CodeRef, il_offset: i64) {
            self.installed.lock().remove(&(code, il_offset));
        }
        fn set_single_stepping(&self, enabled: bool) {
            *self.single_stepping.lock() = enabled;
        }
        fn invoke_method(
            &self,
            _thread: ThreadRef,
            _ctx: &InvokeContext<'_>,
            _body: &mut &[u8],
            _reply: &mut BytesMut,
        ) -> Result<(), ErrorCode> {
            Err(ErrorCode::NotImplemented)
        }
        fn exit(&self, _code: i32) {}
    }

    fn code(code: u64, method: u64, generic: Option<u64>) -> CompiledCode {
        CompiledCode {
            code: CodeRef(code),
            method: MethodRef(method),
            generic_definition: generic.map(MethodRef),
        }
    }

    #[test]
    fn test_set_validates_location() {
        let host = FakeHost::default();
        let mut table = BreakpointTable::default();

        assert_eq!(
            table.set(&host, Some(MethodRef(9)), 0, 1, EventKind::Breakpoint),
            Err(ErrorCode::InvalidObject)
        );
        assert_eq!(
            table.set(&host, Some(MethodRef(1)), 0x11, 1, EventKind::Breakpoint),
            Err(ErrorCode::NoSeqPointAtIlOffset)
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_pending_breakpoint_resolves_per_specialization() {
        let host = FakeHost::default();
        let mut table = BreakpointTable::default();

        let id = table
            .set(&host, Some(MethodRef(2)), 0x10, 1, EventKind::Breakpoint)
            .unwrap();
        assert!(table.get(id).unwrap().is_pending());

        // Specialization of method 2 plus an unrelated method
        table.method_compiled(&host, code(20, 3, Some(2)));
        table.method_compiled(&host, code(10, 1, None));
        assert_eq!(table.get(id).unwrap().instances.len(), 1);
        assert!(host.installed.lock().contains(&(CodeRef(20), 0x10)));

        table.method_compiled(&host, code(21, 2, None));
        assert_eq!(table.get(id).unwrap().instances.len(), 2);

        // Same code reported twice is not a new instance
        table.method_compiled(&host, code(21, 2, None));
        assert_eq!(table.get(id).unwrap().instances.len(), 2);

        assert_eq!(table.hits(CodeRef(20), 0x10).len(), 1);
        assert!(table.hits(CodeRef(20), 0x20).is_empty());
        assert!(table.hits(CodeRef(10), 0x10).is_empty());
    }

    #[test]
    fn test_shared_location_is_refcounted() {
        let host = FakeHost::default();
        host.compiled.lock().push(code(10, 1, None));
        let mut table = BreakpointTable::default();

        let a = table
            .set(&host, Some(MethodRef(1)), 0x20, 1, EventKind::Breakpoint)
            .unwrap();
        let b = table
            .set(&host, Some(MethodRef(1)), 0x20, 2, EventKind::Step)
            .unwrap();
        assert_eq!(*host.installs.lock(), 1);
        assert_eq!(table.hits(CodeRef(10), 0x20).len(), 2);

        table.clear(&host, a);
        assert!(host.installed.lock().contains(&(CodeRef(10), 0x20)));
        table.clear(&host, b);
        assert!(host.installed.lock().is_empty());
        assert_eq!(table.installed_locations(), 0);
    }

    #[test]
    fn test_wildcard_only_hooks_methods_with_hooks() {
        let host = FakeHost::default();
        host.compiled.lock().push(code(10, 1, None));
        host.compiled.lock().push(code(21, 2, None));
        let mut table = BreakpointTable::default();

        let offset = hook_offset(EventKind::MethodEntry).unwrap();
        let id = table.set(&host, None, offset, 5, EventKind::MethodEntry).unwrap();
        let bp = table.get(id).unwrap();
        assert_eq!(bp.instances.len(), 1);
        assert_eq!(bp.instances[0].method, MethodRef(1));
        assert_eq!(
            table.hits(CodeRef(10), METHOD_ENTRY_IL_OFFSET),
            vec![BreakpointHit { id, request: 5, kind: EventKind::MethodEntry }]
        );
    }

    #[test]
    fn test_domain_unload_drops_instances() {
        let host = FakeHost::default();
        host.compiled.lock().push(code(10, 1, None));
        let mut table = BreakpointTable::default();

        let id = table
            .set(&host, Some(MethodRef(1)), 0, 1, EventKind::Breakpoint)
            .unwrap();
        table.domain_unloaded(&host, DomainRef(1));
        assert!(table.get(id).unwrap().is_pending());
        assert!(host.installed.lock().is_empty());
    }
}
