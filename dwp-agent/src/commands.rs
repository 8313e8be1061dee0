// DWP command tables
//
// Command Sets:
// 1 = VM
// 9 = ObjectRef, 10 = StringRef, 13 = ArrayRef, 65 = Pointer
// 11 = Thread
// 15 = EventRequest
// 16 = StackFrame
// 20..25 = AppDomain, Assembly, Method, Type, Module, Field
// 64 = Event (agent to client only)

// Command set IDs
pub mod command_sets {
    pub const VM: u8 = 1;
    pub const OBJECT_REF: u8 = 9;
    pub const STRING_REF: u8 = 10;
    pub const THREAD: u8 = 11;
    pub const ARRAY_REF: u8 = 13;
    pub const EVENT_REQUEST: u8 = 15;
    pub const STACK_FRAME: u8 = 16;
    pub const APPDOMAIN: u8 = 20;
    pub const ASSEMBLY: u8 = 21;
    pub const METHOD: u8 = 22;
    pub const TYPE: u8 = 23;
    pub const MODULE: u8 = 24;
    pub const FIELD: u8 = 25;
    pub const EVENT: u8 = 64;
    pub const POINTER: u8 = 65;
}

// VM commands (set 1)
pub mod vm_commands {
    pub const VERSION: u8 = 1;
    pub const ALL_THREADS: u8 = 2;
    pub const SUSPEND: u8 = 3;
    pub const RESUME: u8 = 4;
    pub const EXIT: u8 = 5;
    pub const DISPOSE: u8 = 6;
    pub const INVOKE_METHOD: u8 = 7;
    pub const SET_PROTOCOL_VERSION: u8 = 8;
    pub const ABORT_INVOKE: u8 = 9;
    pub const SET_KEEPALIVE: u8 = 10;
    pub const GET_TYPES_FOR_SOURCE_FILE: u8 = 11;
    pub const GET_TYPES: u8 = 12;
    pub const INVOKE_METHODS: u8 = 13;
    pub const START_BUFFERING: u8 = 14;
    pub const STOP_BUFFERING: u8 = 15;
}

// Thread commands (set 11)
pub mod thread_commands {
    pub const GET_FRAME_INFO: u8 = 1;
    pub const GET_NAME: u8 = 2;
    pub const GET_STATE: u8 = 3;
    pub const GET_INFO: u8 = 4;
    pub const GET_ID: u8 = 5;
    pub const GET_TID: u8 = 6;
    pub const SET_IP: u8 = 7;
    pub const ELAPSED_TIME: u8 = 8;
}

// EventRequest commands (set 15)
pub mod event_request_commands {
    pub const SET: u8 = 1;
    pub const CLEAR: u8 = 2;
    pub const CLEAR_ALL_BREAKPOINTS: u8 = 3;
}

// StackFrame commands (set 16)
pub mod stack_frame_commands {
    pub const GET_VALUES: u8 = 1;
    pub const GET_THIS: u8 = 2;
    pub const SET_VALUES: u8 = 3;
    pub const GET_DOMAIN: u8 = 4;
    pub const SET_THIS: u8 = 5;
}

// Event commands (set 64)
pub mod event_commands {
    pub const COMPOSITE: u8 = 100;
}

// Event kinds
pub mod event_kinds {
    pub const VM_START: u8 = 0;
    pub const VM_DEATH: u8 = 1;
    pub const THREAD_START: u8 = 2;
    pub const THREAD_DEATH: u8 = 3;
    pub const APPDOMAIN_CREATE: u8 = 4;
    pub const APPDOMAIN_UNLOAD: u8 = 5;
    pub const METHOD_ENTRY: u8 = 6;
    pub const METHOD_EXIT: u8 = 7;
    pub const ASSEMBLY_LOAD: u8 = 8;
    pub const ASSEMBLY_UNLOAD: u8 = 9;
    pub const BREAKPOINT: u8 = 10;
    pub const STEP: u8 = 11;
    pub const TYPE_LOAD: u8 = 12;
    pub const EXCEPTION: u8 = 13;
    pub const KEEPALIVE: u8 = 14;
    pub const USER_BREAK: u8 = 15;
    pub const USER_LOG: u8 = 16;
}

// EventRequest modifier kinds
pub mod modifier_kinds {
    pub const COUNT: u8 = 1;
    pub const THREAD_ONLY: u8 = 3;
    pub const LOCATION_ONLY: u8 = 7;
    pub const EXCEPTION_ONLY: u8 = 8;
    pub const STEP: u8 = 10;
    pub const ASSEMBLY_ONLY: u8 = 11;
    pub const SOURCE_FILE_ONLY: u8 = 12;
    pub const TYPE_NAME_ONLY: u8 = 13;
}

// Invoke flags
pub mod invoke_flags {
    pub const DISABLE_BREAKPOINTS: u32 = 1;
    pub const SINGLE_THREADED: u32 = 2;
    pub const RETURN_OUT_THIS: u32 = 4;
    pub const RETURN_OUT_ARGS: u32 = 8;
    pub const VIRTUAL: u32 = 16;
}

// Frame flags reported by Thread.GetFrameInfo
pub mod frame_flags {
    pub const DEBUGGER_INVOKE: u8 = 1;
    pub const NATIVE_TRANSITION: u8 = 2;
}

/// Request id used for exception events nobody asked for (JIT attach)
pub const UNSOLICITED_EXCEPTION_REQUEST_ID: i32 = 0xffffff;

/// Il offsets of the method entry and exit hooks
pub const METHOD_ENTRY_IL_OFFSET: i64 = -1;
pub const METHOD_EXIT_IL_OFFSET: i64 = 0xffffff;

macro_rules! command_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:path),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn from_u8(command: u8) -> Option<Self> {
                match command {
                    $(c if c == $value => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_u8(&self) -> u8 {
                match self {
                    $($name::$variant => $value),+
                }
            }
        }
    };
}

command_enum!(
    /// Commands of the VM set
    VmCommand {
        Version = vm_commands::VERSION,
        AllThreads = vm_commands::ALL_THREADS,
        Suspend = vm_commands::SUSPEND,
        Resume = vm_commands::RESUME,
        Exit = vm_commands::EXIT,
        Dispose = vm_commands::DISPOSE,
        InvokeMethod = vm_commands::INVOKE_METHOD,
        SetProtocolVersion = vm_commands::SET_PROTOCOL_VERSION,
        AbortInvoke = vm_commands::ABORT_INVOKE,
        SetKeepalive = vm_commands::SET_KEEPALIVE,
        GetTypesForSourceFile = vm_commands::GET_TYPES_FOR_SOURCE_FILE,
        GetTypes = vm_commands::GET_TYPES,
        InvokeMethods = vm_commands::INVOKE_METHODS,
        StartBuffering = vm_commands::START_BUFFERING,
        StopBuffering = vm_commands::STOP_BUFFERING,
    }
);

command_enum!(
    ThreadCommand {
        GetFrameInfo = thread_commands::GET_FRAME_INFO,
        GetName = thread_commands::GET_NAME,
        GetState = thread_commands::GET_STATE,
        GetInfo = thread_commands::GET_INFO,
        GetId = thread_commands::GET_ID,
        GetTid = thread_commands::GET_TID,
        SetIp = thread_commands::SET_IP,
        ElapsedTime = thread_commands::ELAPSED_TIME,
    }
);

command_enum!(
    EventRequestCommand {
        Set = event_request_commands::SET,
        Clear = event_request_commands::CLEAR,
        ClearAllBreakpoints = event_request_commands::CLEAR_ALL_BREAKPOINTS,
    }
);

command_enum!(
    StackFrameCommand {
        GetValues = stack_frame_commands::GET_VALUES,
        GetThis = stack_frame_commands::GET_THIS,
        SetValues = stack_frame_commands::SET_VALUES,
        GetDomain = stack_frame_commands::GET_DOMAIN,
        SetThis = stack_frame_commands::SET_THIS,
    }
);

/// Every (command set, command) pair the agent routes.
///
/// The core owns the VM, Thread, EventRequest and StackFrame sets. The rest
/// carry the raw command byte and are answered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Vm(VmCommand),
    Thread(ThreadCommand),
    EventRequest(EventRequestCommand),
    StackFrame(StackFrameCommand),
    AppDomain(u8),
    Assembly(u8),
    Module(u8),
    Field(u8),
    Method(u8),
    Type(u8),
    ArrayRef(u8),
    StringRef(u8),
    Pointer(u8),
    ObjectRef(u8),
}

impl Command {
    pub fn decode(command_set: u8, command: u8) -> Option<Self> {
        use command_sets::*;

        Some(match command_set {
            VM => Command::Vm(VmCommand::from_u8(command)?),
            THREAD => Command::Thread(ThreadCommand::from_u8(command)?),
            EVENT_REQUEST => Command::EventRequest(EventRequestCommand::from_u8(command)?),
            STACK_FRAME => Command::StackFrame(StackFrameCommand::from_u8(command)?),
            APPDOMAIN => Command::AppDomain(command),
            ASSEMBLY => Command::Assembly(command),
            MODULE => Command::Module(command),
            FIELD => Command::Field(command),
            METHOD => Command::Method(command),
            TYPE => Command::Type(command),
            ARRAY_REF => Command::ArrayRef(command),
            STRING_REF => Command::StringRef(command),
            POINTER => Command::Pointer(command),
            OBJECT_REF => Command::ObjectRef(command),
            _ => return None,
        })
    }

    pub fn command_set(&self) -> u8 {
        use command_sets::*;

        match self {
            Command::Vm(_) => VM,
            Command::Thread(_) => THREAD,
            Command::EventRequest(_) => EVENT_REQUEST,
            Command::StackFrame(_) => STACK_FRAME,
            Command::AppDomain(_) => APPDOMAIN,
            Command::Assembly(_) => ASSEMBLY,
            Command::Module(_) => MODULE,
            Command::Field(_) => FIELD,
            Command::Method(_) => METHOD,
            Command::Type(_) => TYPE,
            Command::ArrayRef(_) => ARRAY_REF,
            Command::StringRef(_) => STRING_REF,
            Command::Pointer(_) => POINTER,
            Command::ObjectRef(_) => OBJECT_REF,
        }
    }

    pub fn command(&self) -> u8 {
        match self {
            Command::Vm(c) => c.as_u8(),
            Command::Thread(c) => c.as_u8(),
            Command::EventRequest(c) => c.as_u8(),
            Command::StackFrame(c) => c.as_u8(),
            Command::AppDomain(c)
            | Command::Assembly(c)
            | Command::Module(c)
            | Command::Field(c)
            | Command::Method(c)
            | Command::Type(c)
            | Command::ArrayRef(c)
            | Command::StringRef(c)
            | Command::Pointer(c)
            | Command::ObjectRef(c) => *c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_core_commands() {
        assert_eq!(
            Command::decode(command_sets::VM, vm_commands::RESUME),
            Some(Command::Vm(VmCommand::Resume))
        );
        assert_eq!(
            Command::decode(command_sets::EVENT_REQUEST, event_request_commands::CLEAR),
            Some(Command::EventRequest(EventRequestCommand::Clear))
        );
        assert_eq!(Command::decode(command_sets::VM, 99), None);
        assert_eq!(Command::decode(42, 1), None);
    }

    #[test]
    fn test_collaborator_sets_keep_raw_command() {
        let cmd = Command::decode(command_sets::TYPE, 17).unwrap();
        assert_eq!(cmd, Command::Type(17));
        assert_eq!(cmd.command_set(), command_sets::TYPE);
        assert_eq!(cmd.command(), 17);
    }
}
