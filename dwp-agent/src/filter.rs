// Event matching
//
// Runs an occurrence against the registered requests of its kind. Each
// request's modifiers are evaluated in order and the first one that rejects
// the occurrence stops the evaluation.

use crate::agent::Registry;
use crate::eventrequest::{EventRequest, ExceptionFilter, Modifier, SuspendPolicy};
use crate::events::EventKind;
use crate::host::{ExceptionInfo, Host};
use crate::protocol::ProtocolVersion;
use crate::step::{StepFilter, StepTable};
use crate::types::*;
use tracing::{debug, trace};

/// What the host knows about an occurrence
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EventInfo<'a> {
    pub thread: Option<ThreadRef>,
    pub method: Option<MethodRef>,
    pub code: Option<CodeRef>,
    pub exception: Option<&'a ExceptionInfo>,
    /// The loaded type, for TYPE_LOAD
    pub class: Option<TypeRef>,
}

/// Requests an occurrence matched and the policy they add up to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Matched {
    pub requests: Vec<RequestId>,
    pub policy: SuspendPolicy,
}

/// Requests using the explicit-fallback exception scheme compete for a
/// single slot; class specific matches beat the everything-else bucket.
#[derive(Debug, Default)]
struct ExceptionSelection {
    class_matched: bool,
    specific: Option<(RequestId, SuspendPolicy)>,
    fallback: Option<(RequestId, SuspendPolicy)>,
}

impl ExceptionSelection {
    fn offer(&mut self, host: &dyn Host, req: &EventRequest, filter: &ExceptionFilter, caught: bool, exception: &ExceptionInfo) {
        let wanted = if caught { filter.caught } else { filter.uncaught };

        match filter.class {
            Some(class) => {
                let matches = if filter.subclasses {
                    host.is_assignable(class, exception.class)
                } else {
                    class == exception.class
                };
                if matches {
                    self.class_matched = true;
                    if wanted && self.specific.is_none() {
                        self.specific = Some((req.id, req.policy));
                    }
                }
            }
            None if filter.everything_else => {
                if wanted && self.fallback.is_none() {
                    self.fallback = Some((req.id, req.policy));
                }
            }
            None => {
                if wanted && self.specific.is_none() {
                    self.specific = Some((req.id, req.policy));
                }
            }
        }
    }

    fn chosen(&self) -> Option<(RequestId, SuspendPolicy)> {
        match self.specific {
            Some(choice) => Some(choice),
            None if !self.class_matched => self.fallback,
            None => None,
        }
    }
}

/// Caught-ness as the request sees it: an exception caught outside the
/// assemblies a request is limited to counts as uncaught
fn effective_caught(host: &dyn Host, req: &EventRequest, exception: &ExceptionInfo) -> bool {
    if !exception.caught {
        return false;
    }
    let assemblies = req.modifiers.iter().find_map(|m| match m {
        Modifier::AssemblyOnly(assemblies) => Some(assemblies),
        _ => None,
    });
    match (assemblies, exception.catch_method) {
        (Some(assemblies), Some(catcher)) => host
            .method_info(catcher)
            .map(|info| assemblies.contains(&info.assembly))
            .unwrap_or(false),
        _ => true,
    }
}

fn legacy_exception_matches(host: &dyn Host, filter: &ExceptionFilter, caught: bool, exception: &ExceptionInfo) -> bool {
    if let Some(class) = filter.class {
        let matches = if filter.subclasses {
            host.is_assignable(class, exception.class)
        } else {
            class == exception.class
        };
        if !matches {
            return false;
        }
    }
    if caught {
        filter.caught
    } else {
        filter.uncaught
    }
}

fn source_file_matches(host: &dyn Host, files: &[String], ignore_case: bool, ty: TypeRef, version: ProtocolVersion) -> bool {
    let Some(info) = host.type_info(ty) else {
        return false;
    };
    let fold = ignore_case || !version.at_least(2, 58);

    info.source_files.iter().any(|path| {
        let basename = path.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(path.as_str());
        let (path, basename) = if fold {
            (path.to_lowercase(), basename.to_lowercase())
        } else {
            (path.clone(), basename.to_string())
        };
        files.iter().any(|f| {
            let f = if fold { f.to_lowercase() } else { f.clone() };
            f == path || f == basename
        })
    })
}

fn step_filtered(host: &dyn Host, steps: &mut StepTable, req: &EventRequest, filter: StepFilter, info: &EventInfo<'_>) -> bool {
    let (Some(method), Some(code)) = (info.method, info.code) else {
        return false;
    };
    let attrs = steps.method_attrs(host, code, method);

    if filter.contains(StepFilter::STATIC_CTOR)
        && attrs.static_ctor
        && steps.start_method(req.id) != Some(method)
    {
        return true;
    }
    (filter.contains(StepFilter::HIDDEN) && attrs.hidden)
        || (filter.contains(StepFilter::STEP_THROUGH) && attrs.step_through)
        || (filter.contains(StepFilter::NON_USER_CODE) && attrs.non_user_code)
}

impl Registry {
    /// Match an occurrence of `kind` against the requests (or only those in
    /// `only`). Requests whose count ran out are removed.
    pub(crate) fn create_event_list(
        &mut self,
        host: &dyn Host,
        kind: EventKind,
        only: Option<&[RequestId]>,
        info: &EventInfo<'_>,
        version: ProtocolVersion,
    ) -> Matched {
        let mut requests = Vec::new();
        let mut policy = SuspendPolicy::None;
        let mut selection = ExceptionSelection::default();
        let mut exhausted = Vec::new();

        let Registry {
            requests: registered,
            steps,
            ..
        } = &mut *self;

        for req in registered.iter_mut() {
            if req.kind != kind {
                continue;
            }
            if let Some(only) = only {
                if !only.contains(&req.id) {
                    continue;
                }
            }

            let caught = info
                .exception
                .map(|e| effective_caught(host, req, e))
                .unwrap_or(false);

            let mut filtered = false;
            let mut new_scheme: Option<ExceptionFilter> = None;
            let mut count_done = false;

            // Split borrow: the modifiers are mutated, the rest of the request is read
            let snapshot = EventRequest {
                modifiers: Vec::new(),
                ..req.clone()
            };

            for modifier in req.modifiers.iter_mut() {
                let pass = match modifier {
                    Modifier::Count(n) => {
                        if *n == 0 {
                            false
                        } else {
                            *n -= 1;
                            if *n == 0 {
                                count_done = true;
                                true
                            } else {
                                false
                            }
                        }
                    }
                    Modifier::ThreadOnly(thread) => info.thread == Some(*thread),
                    // Location is the breakpoint table's business
                    Modifier::LocationOnly { .. } => true,
                    Modifier::ExceptionOnly(filter) => match info.exception {
                        None => true,
                        Some(_) if filter.not_filtered_feature => {
                            new_scheme = Some(filter.clone());
                            true
                        }
                        Some(e) => legacy_exception_matches(host, filter, caught, e),
                    },
                    Modifier::Step { filter, .. } => !step_filtered(host, steps, &snapshot, *filter, info),
                    Modifier::AssemblyOnly(assemblies) => match info.method {
                        Some(method) => host
                            .method_info(method)
                            .map(|m| assemblies.contains(&m.assembly))
                            .unwrap_or(false),
                        None => true,
                    },
                    Modifier::SourceFileOnly { files, ignore_case } => match info.class {
                        Some(ty) => source_file_matches(host, files, *ignore_case, ty, version),
                        None => true,
                    },
                    Modifier::TypeNameOnly(names) => match info.class {
                        Some(ty) => host
                            .type_info(ty)
                            .map(|t| names.contains(&t.full_name))
                            .unwrap_or(false),
                        None => true,
                    },
                };

                if !pass {
                    filtered = true;
                    break;
                }
            }

            if count_done && !filtered {
                exhausted.push(req.id);
            }
            if filtered {
                trace!("Request {} filtered out {:?}", req.id, kind);
                continue;
            }

            match (new_scheme, info.exception) {
                (Some(filter), Some(e)) => selection.offer(host, &snapshot, &filter, caught, e),
                _ => {
                    policy = policy.max(req.policy);
                    requests.push(req.id);
                }
            }
        }

        if let Some((id, p)) = selection.chosen() {
            policy = policy.max(p);
            requests.push(id);
        }

        // Lifecycle events always reach the client
        if only.is_none() && matches!(kind, EventKind::VmStart | EventKind::VmDeath) {
            requests.push(0);
        }

        for id in exhausted {
            debug!("Request {} exhausted its count", id);
            self.remove_request(host, id);
        }

        Matched { requests, policy }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breakpoint::tests::FakeHost;
    use crate::host::{RuntimeObject, TypeInfo};
    use std::sync::Arc;

    #[derive(Debug)]
    struct Exc;

    impl RuntimeObject for Exc {
        fn address(&self) -> u64 {
            0x100
        }
        fn domain(&self) -> DomainRef {
            DomainRef(1)
        }
        fn class(&self) -> TypeRef {
            TypeRef(10)
        }
    }

    /// Types 10 and 11 derive from 1; type 5 lives in /src/App/Program.cs
    struct Types(FakeHost);

    impl Host for Types {
        fn async_suspend(&self, thread: ThreadRef) -> crate::host::AsyncSuspend {
            self.0.async_suspend(thread)
        }
        fn stack_walk(&self, thread: ThreadRef, ctx: &ThreadContext) -> Vec<crate::host::FrameInfo> {
            self.0.stack_walk(thread, ctx)
        }
        fn thread_info(&self, thread: ThreadRef) -> crate::host::ThreadInfo {
            self.0.thread_info(thread)
        }
        fn method_info(&self, method: MethodRef) -> Option<crate::host::MethodInfo> {
            let mut info = FakeHost::method(method.0);
            if method.0 == 3 {
                info.assembly = AssemblyRef(2);
                info.attrs.hidden = true;
            }
            Some(info)
        }
        fn type_info(&self, ty: TypeRef) -> Option<TypeInfo> {
            Some(TypeInfo {
                full_name: format!("App.T{}", ty.0),
                assembly: AssemblyRef(1),
                source_files: if ty.0 == 5 {
                    vec!["/src/App/Program.cs".to_string()]
                } else {
                    vec![]
                },
            })
        }
        fn is_assignable(&self, base: TypeRef, derived: TypeRef) -> bool {
            base == derived || (base == TypeRef(1) && derived.0 >= 10)
        }
        fn compiled_code(&self) -> Vec<crate::host::CompiledCode> {
            Vec::new()
        }
        fn install_breakpoint(&self, _code: CodeRef, _il_offset: i64) {}
        fn remove_breakpoint(&self, _code: CodeRef, _il_offset: i64) {}
        fn set_single_stepping(&self, _enabled: bool) {}
        fn invoke_method(
            &self,
            thread: ThreadRef,
            ctx: &crate::host::InvokeContext<'_>,
            body: &mut &[u8],
            reply: &mut bytes::BytesMut,
        ) -> Result<(), crate::protocol::ErrorCode> {
            self.0.invoke_method(thread, ctx, body, reply)
        }
        fn exit(&self, _code: i32) {}
    }

    fn host() -> Types {
        Types(FakeHost::default())
    }

    fn add(reg: &mut Registry, kind: EventKind, policy: SuspendPolicy, modifiers: Vec<Modifier>) -> RequestId {
        let id = reg.next_request_id();
        reg.requests.push(EventRequest {
            id,
            kind,
            policy,
            modifiers,
            breakpoint: None,
        });
        id
    }

    fn exception(class: u64, caught: bool) -> ExceptionInfo {
        ExceptionInfo {
            object: Arc::new(Exc),
            class: TypeRef(class),
            caught,
            catch_method: caught.then_some(MethodRef(1)),
        }
    }

    fn filter(class: Option<u64>, caught: bool, uncaught: bool) -> ExceptionFilter {
        ExceptionFilter {
            class: class.map(TypeRef),
            caught,
            uncaught,
            subclasses: true,
            not_filtered_feature: false,
            everything_else: false,
        }
    }

    fn matched(reg: &mut Registry, host: &Types, kind: EventKind, info: &EventInfo<'_>) -> Matched {
        reg.create_event_list(host, kind, None, info, ProtocolVersion::CURRENT)
    }

    #[test]
    fn test_count_fires_once_on_nth_occurrence() {
        let host = host();
        let mut reg = Registry::default();
        let id = add(&mut reg, EventKind::ThreadStart, SuspendPolicy::None, vec![Modifier::Count(3)]);
        let info = EventInfo::default();

        let hits: Vec<bool> = (0..6)
            .map(|_| !matched(&mut reg, &host, EventKind::ThreadStart, &info).requests.is_empty())
            .collect();
        assert_eq!(hits, vec![false, false, true, false, false, false]);
        assert!(reg.requests.iter().all(|r| r.id != id));
    }

    #[test]
    fn test_count_after_a_rejecting_modifier_is_not_charged() {
        let host = host();
        let mut reg = Registry::default();
        let id = add(
            &mut reg,
            EventKind::ThreadStart,
            SuspendPolicy::None,
            vec![Modifier::ThreadOnly(ThreadRef(2)), Modifier::Count(2)],
        );
        let other = EventInfo { thread: Some(ThreadRef(1)), ..Default::default() };
        let this = EventInfo { thread: Some(ThreadRef(2)), ..Default::default() };

        // Evaluation stops at the thread filter, the count stays at 2
        for _ in 0..3 {
            assert!(matched(&mut reg, &host, EventKind::ThreadStart, &other).requests.is_empty());
        }
        assert!(matched(&mut reg, &host, EventKind::ThreadStart, &this).requests.is_empty());
        assert_eq!(matched(&mut reg, &host, EventKind::ThreadStart, &this).requests, vec![id]);
        assert!(reg.requests.is_empty());
    }

    #[test]
    fn test_count_before_a_rejecting_modifier_is_charged() {
        let host = host();
        let mut reg = Registry::default();
        add(
            &mut reg,
            EventKind::ThreadStart,
            SuspendPolicy::None,
            vec![Modifier::Count(2), Modifier::ThreadOnly(ThreadRef(2))],
        );
        let other = EventInfo { thread: Some(ThreadRef(1)), ..Default::default() };
        let this = EventInfo { thread: Some(ThreadRef(2)), ..Default::default() };

        // The second occurrence reaches the count but the thread filter
        // rejects it, so the request never fires
        assert!(matched(&mut reg, &host, EventKind::ThreadStart, &other).requests.is_empty());
        assert!(matched(&mut reg, &host, EventKind::ThreadStart, &other).requests.is_empty());
        for _ in 0..3 {
            assert!(matched(&mut reg, &host, EventKind::ThreadStart, &this).requests.is_empty());
        }
    }

    #[test]
    fn test_policy_is_the_maximum() {
        let host = host();
        let mut reg = Registry::default();
        let a = add(&mut reg, EventKind::UserBreak, SuspendPolicy::None, vec![]);
        let b = add(&mut reg, EventKind::UserBreak, SuspendPolicy::All, vec![]);
        add(&mut reg, EventKind::UserLog, SuspendPolicy::All, vec![]);

        let m = matched(&mut reg, &host, EventKind::UserBreak, &EventInfo::default());
        assert_eq!(m.requests, vec![a, b]);
        assert_eq!(m.policy, SuspendPolicy::All);
    }

    #[test]
    fn test_lifecycle_events_always_match() {
        let host = host();
        let mut reg = Registry::default();

        let m = matched(&mut reg, &host, EventKind::VmStart, &EventInfo::default());
        assert_eq!(m.requests, vec![0]);
        assert_eq!(m.policy, SuspendPolicy::None);

        let id = add(&mut reg, EventKind::VmDeath, SuspendPolicy::None, vec![]);
        let m = matched(&mut reg, &host, EventKind::VmDeath, &EventInfo::default());
        assert_eq!(m.requests, vec![id, 0]);

        let m = matched(&mut reg, &host, EventKind::ThreadStart, &EventInfo::default());
        assert!(m.requests.is_empty());
    }

    #[test]
    fn test_thread_only() {
        let host = host();
        let mut reg = Registry::default();
        let id = add(
            &mut reg,
            EventKind::ThreadDeath,
            SuspendPolicy::None,
            vec![Modifier::ThreadOnly(ThreadRef(2))],
        );

        let other = EventInfo { thread: Some(ThreadRef(1)), ..Default::default() };
        assert!(matched(&mut reg, &host, EventKind::ThreadDeath, &other).requests.is_empty());
        let this = EventInfo { thread: Some(ThreadRef(2)), ..Default::default() };
        assert_eq!(matched(&mut reg, &host, EventKind::ThreadDeath, &this).requests, vec![id]);
    }

    #[test]
    fn test_legacy_exception_filter() {
        let host = host();
        let mut reg = Registry::default();
        let base = add(
            &mut reg,
            EventKind::Exception,
            SuspendPolicy::All,
            vec![Modifier::ExceptionOnly(filter(Some(1), true, true))],
        );
        let mut exact = filter(Some(1), true, true);
        exact.subclasses = false;
        add(&mut reg, EventKind::Exception, SuspendPolicy::All, vec![Modifier::ExceptionOnly(exact)]);
        let uncaught_only = add(
            &mut reg,
            EventKind::Exception,
            SuspendPolicy::None,
            vec![Modifier::ExceptionOnly(filter(None, false, true))],
        );

        let e = exception(10, true);
        let info = EventInfo { exception: Some(&e), ..Default::default() };
        assert_eq!(matched(&mut reg, &host, EventKind::Exception, &info).requests, vec![base]);

        let e = exception(11, false);
        let info = EventInfo { exception: Some(&e), ..Default::default() };
        assert_eq!(
            matched(&mut reg, &host, EventKind::Exception, &info).requests,
            vec![base, uncaught_only]
        );
    }

    #[test]
    fn test_fallback_scheme_prefers_class_match() {
        let host = host();
        let mut reg = Registry::default();

        let mut everything_else = filter(None, true, true);
        everything_else.not_filtered_feature = true;
        everything_else.everything_else = true;
        let fallback = add(
            &mut reg,
            EventKind::Exception,
            SuspendPolicy::None,
            vec![Modifier::ExceptionOnly(everything_else)],
        );

        let mut specific = filter(Some(10), true, false);
        specific.not_filtered_feature = true;
        let class = add(
            &mut reg,
            EventKind::Exception,
            SuspendPolicy::All,
            vec![Modifier::ExceptionOnly(specific)],
        );

        // Class 10 caught: the class specific request wins
        let e = exception(10, true);
        let info = EventInfo { exception: Some(&e), ..Default::default() };
        let m = matched(&mut reg, &host, EventKind::Exception, &info);
        assert_eq!(m.requests, vec![class]);
        assert_eq!(m.policy, SuspendPolicy::All);

        // Class 10 uncaught: the class matched but does not want it, and the
        // fallback does not apply either
        let e = exception(10, false);
        let info = EventInfo { exception: Some(&e), ..Default::default() };
        assert!(matched(&mut reg, &host, EventKind::Exception, &info).requests.is_empty());

        // Anything else lands in the fallback bucket
        let e = exception(11, false);
        let info = EventInfo { exception: Some(&e), ..Default::default() };
        assert_eq!(matched(&mut reg, &host, EventKind::Exception, &info).requests, vec![fallback]);
    }

    #[test]
    fn test_assembly_only_turns_foreign_catch_into_uncaught() {
        let host = host();
        let mut reg = Registry::default();
        // Method 1 lives in assembly 1
        let id = add(
            &mut reg,
            EventKind::Exception,
            SuspendPolicy::All,
            vec![
                Modifier::ExceptionOnly(filter(None, false, true)),
                Modifier::AssemblyOnly(vec![AssemblyRef(2)]),
            ],
        );

        let e = exception(10, true);
        let info = EventInfo {
            method: Some(MethodRef(3)),
            exception: Some(&e),
            ..Default::default()
        };
        assert_eq!(matched(&mut reg, &host, EventKind::Exception, &info).requests, vec![id]);
    }

    #[test]
    fn test_source_file_and_type_name() {
        let host = host();
        let mut reg = Registry::default();
        let by_file = add(
            &mut reg,
            EventKind::TypeLoad,
            SuspendPolicy::None,
            vec![Modifier::SourceFileOnly { files: vec!["program.cs".to_string()], ignore_case: true }],
        );
        let by_case = add(
            &mut reg,
            EventKind::TypeLoad,
            SuspendPolicy::None,
            vec![Modifier::SourceFileOnly { files: vec!["program.cs".to_string()], ignore_case: false }],
        );
        let by_name = add(
            &mut reg,
            EventKind::TypeLoad,
            SuspendPolicy::None,
            vec![Modifier::TypeNameOnly(vec!["App.T5".to_string()])],
        );

        let info = EventInfo { class: Some(TypeRef(5)), ..Default::default() };
        assert_eq!(
            matched(&mut reg, &host, EventKind::TypeLoad, &info).requests,
            vec![by_file, by_name]
        );

        // Older clients always match without regard to case
        let m = reg.create_event_list(&host, EventKind::TypeLoad, None, &info, ProtocolVersion::new(2, 50));
        assert_eq!(m.requests, vec![by_file, by_case, by_name]);

        let info = EventInfo { class: Some(TypeRef(6)), ..Default::default() };
        assert!(matched(&mut reg, &host, EventKind::TypeLoad, &info).requests.is_empty());
    }

    #[test]
    fn test_only_restricts_candidates() {
        let host = host();
        let mut reg = Registry::default();
        add(&mut reg, EventKind::ThreadStart, SuspendPolicy::None, vec![]);
        let b = add(&mut reg, EventKind::ThreadStart, SuspendPolicy::None, vec![]);

        let m = reg.create_event_list(&host, EventKind::ThreadStart, Some(&[b]), &EventInfo::default(), ProtocolVersion::CURRENT);
        assert_eq!(m.requests, vec![b]);
    }
}
