//! Lunette virtual machine: dispatch loop, calling convention, upvalue
//! machinery, coroutine scheduler, and the stack-based embedding API.

pub mod api;
pub mod arith;
pub mod auxlib;
pub mod coerce;
pub mod compare;
pub mod coroutine;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heap;
pub mod metamethod;
pub mod state;

pub use api::CompareOp;
pub use arith::ArithOp;
pub use coroutine::Resume;
pub use error::{Control, HostResult, VmError};
pub use heap::HostFn;
pub use state::{upvalue_index, State, LUAI_MAXSTACK, REGISTRY_INDEX};
