//! Loader wire protocol: SLIP framing, command encoding and the
//! request/response channel.

pub mod channel;
pub mod command;
pub mod security;
pub mod slip;
pub mod trace;

// Re-export common types
pub use channel::{CloseHandle, CommandChannel, Loader, Reply};
pub use command::{Opcode, Request, Response, RetryPolicy};
pub use security::SecurityInfo;
pub use trace::{FrameTracer, TraceDirection};
