// VM command implementations
//
// Version negotiation, whole-VM suspend/resume, session teardown and the
// entry points for invokes. Type queries are answered by the host.

use crate::agent::Agent;
use crate::commands::{Command, VmCommand};
use crate::dispatch::{HandlerResult, Reply, Request};
use crate::ids::Entities;
use crate::invoke;
use crate::protocol::{ErrorCode, ProtocolVersion, MAJOR_VERSION, MINOR_VERSION};
use crate::reader::read_i32;
use crate::types::ThreadRef;
use crate::writer::write_string;
use bytes::BufMut;
use std::time::Duration;
use tracing::{debug, info};

/// Name reported by VM.VERSION
pub const AGENT_NAME: &str = concat!("dwp-agent ", env!("CARGO_PKG_VERSION"));

impl Agent {
    /// Live threads, in a stable order
    fn live_threads(&self) -> Vec<ThreadRef> {
        let reg = self.registry.lock();
        let mut threads: Vec<ThreadRef> = reg
            .threads
            .values()
            .filter(|tls| !tls.terminated)
            .map(|tls| tls.thread)
            .collect();
        threads.sort();
        threads
    }
}

pub(crate) fn handle(agent: &Agent, command: VmCommand, req: &mut Request<'_>) -> HandlerResult {
    match command {
        VmCommand::Version => {
            write_string(&mut req.reply, AGENT_NAME);
            req.reply.put_i32(MAJOR_VERSION as i32);
            req.reply.put_i32(MINOR_VERSION as i32);
        }
        VmCommand::AllThreads => {
            let threads = agent.live_threads();
            let pin = agent.coordinator.is_suspending();
            let mut reg = agent.registry.lock();
            let objects: Vec<_> = threads
                .iter()
                .filter_map(|t| reg.threads.get(t).map(|tls| tls.object.clone()))
                .collect();

            req.reply.put_i32(objects.len() as i32);
            for object in &objects {
                let id = reg.ids.object_id(object, pin);
                req.reply.put_i32(id);
            }
        }
        VmCommand::Suspend => {
            agent.suspend_vm(None);
            agent.wait_for_suspend();
        }
        VmCommand::Resume => {
            if agent.coordinator.suspend_count() == 0 {
                return Err(ErrorCode::NotSuspended);
            }
            agent.resume_vm();
        }
        VmCommand::Exit => {
            let code = read_i32(&mut req.body)?;
            return Ok(Reply::Exit(code));
        }
        VmCommand::Dispose => {
            return Ok(Reply::Dispose);
        }
        VmCommand::InvokeMethod => return invoke::request_invoke(agent, req, false),
        VmCommand::InvokeMethods => return invoke::request_invoke(agent, req, true),
        VmCommand::AbortInvoke => return invoke::abort_invoke(agent, req),
        VmCommand::SetProtocolVersion => {
            let major = read_i32(&mut req.body)?;
            let minor = read_i32(&mut req.body)?;
            if major < 0 || minor < 0 {
                return Err(ErrorCode::InvalidArgument);
            }
            agent.set_protocol_version(ProtocolVersion::new(major as u32, minor as u32));
        }
        VmCommand::SetKeepalive => {
            let ms = read_i32(&mut req.body)?;
            let interval = (ms > 0).then(|| Duration::from_millis(ms as u64));
            info!("Keepalive interval set to {:?}", interval);
            agent.keepalive.send_replace(interval);
        }
        VmCommand::GetTypes | VmCommand::GetTypesForSourceFile => {
            let entities = Entities::new(agent);
            agent.host.handle_command(
                Command::Vm(command),
                &mut req.body,
                &mut req.reply,
                &entities,
            )?;
        }
        VmCommand::StartBuffering | VmCommand::StopBuffering => {
            // The dispatcher owns the reply buffer
            debug!("{:?}", command);
        }
    }

    Ok(Reply::Send)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_name_carries_version() {
        assert!(AGENT_NAME.starts_with("dwp-agent "));
        assert!(AGENT_NAME.ends_with(env!("CARGO_PKG_VERSION")));
    }
}
