// StackFrame command implementations
//
// Frames are looked up in the thread's cached stack walk, so ids handed out
// by THREAD.GET_FRAME_INFO stay valid until the thread runs again. Only
// GET_DOMAIN is answered here; variable access belongs to the host.

use crate::agent::Agent;
use crate::commands::StackFrameCommand;
use crate::dispatch::{HandlerResult, Reply, Request};
use crate::ids::{Entities, IdKind};
use crate::protocol::ErrorCode;
use crate::reader::read_i32;
use crate::thread::StackFrame;
use crate::types::{DomainRef, FrameId, ThreadRef};
use bytes::BufMut;

impl Agent {
    /// A frame of a stopped thread by id
    fn find_frame(&self, thread: ThreadRef, id: FrameId) -> Result<StackFrame, ErrorCode> {
        self.ensure_thread_stopped(thread)?;
        self.compute_frames(thread)?
            .into_iter()
            .find(|f| f.id == id)
            .ok_or(ErrorCode::InvalidFrameId)
    }
}

pub(crate) fn handle(agent: &Agent, command: StackFrameCommand, req: &mut Request<'_>) -> HandlerResult {
    let thread = agent.decode_thread(&mut req.body)?;
    let id = read_i32(&mut req.body)?;
    let frame = agent.find_frame(thread, id)?;

    match command {
        StackFrameCommand::GetDomain => {
            let domain = agent
                .host
                .method_info(frame.info.method)
                .map(|m| m.domain)
                .unwrap_or(DomainRef(0));
            let id = agent
                .registry
                .lock()
                .ids
                .get_id(IdKind::Domain, domain, domain.0);
            req.reply.put_i32(id);
        }
        _ => {
            let entities = Entities::new(agent);
            agent.host.frame_command(
                command,
                thread,
                &frame.info,
                &mut req.body,
                &mut req.reply,
                &entities,
            )?;
        }
    }

    Ok(Reply::Send)
}
