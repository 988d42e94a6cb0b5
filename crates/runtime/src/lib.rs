//! Host runtime for C++ libraries compiled to sandboxed WebAssembly guests.
//!
//! A [`Runtime`] compiles a guest module once and links the host functions
//! the guest imports. Each call to [`Runtime::instantiate`] produces a
//! [`Controller`] owning one guest instance whose linear memory is supplied
//! by an [`Allocator`]. The controller dispatches calls into the guest,
//! turns exceptions thrown by the guest into [`Error`] values, and scopes
//! the host readers and writers the guest streams through.

#[macro_use]
extern crate tracing;

#[macro_use]
mod mac;

pub mod alloc;
pub mod cnf;
pub mod controller;
pub mod err;
pub mod except;
pub mod handle;
mod host;
mod runtime;

pub use alloc::{Allocator, MovableAllocator, VirtualAllocator};
pub use controller::{Controller, Returns};
pub use err::{Error, Result};
pub use except::{Exception, StdException};
pub use handle::{Handle, HandleTable, HostObject};
pub use runtime::Runtime;
