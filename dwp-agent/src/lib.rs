// Debuggee-side soft debugger agent
//
// Runs inside a managed runtime and speaks the DWP wire protocol to a remote
// debugger:
// - Transport and handshake (listen or connect)
// - Whole-VM and per-thread suspension
// - Event requests, breakpoints and single stepping
// - Method invocation on suspended threads
//
// The runtime itself is abstracted behind the `Host` trait; `sim` provides a
// scripted host for driving the agent without a real runtime.

pub mod agent;
pub mod breakpoint;
pub mod client;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod eventrequest;
pub mod events;
pub mod filter;
pub mod host;
pub mod ids;
pub mod invoke;
pub mod protocol;
pub mod reader;
pub mod sim;
pub mod stackframe;
pub mod step;
pub mod suspend;
pub mod thread;
pub mod transport;
pub mod types;
pub mod vm;
pub mod writer;

pub use agent::Agent;
pub use client::DebuggerClient;
pub use config::AgentConfig;
pub use eventrequest::SuspendPolicy;
pub use host::Host;
pub use protocol::{AgentError, AgentResult};
