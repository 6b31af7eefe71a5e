#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Copy-on-write fork
//!
//! User-space `fork` for Polaris processes. The kernel only offers a handful of primitives:
//! create an empty child, allocate and map pages in a process, point a process at a page
//! fault entry point, and mark it runnable. This crate builds a full fork on top of them:
//!
//! - [`Process::fork`] shares every user page of the parent with the child, demoting writable
//!   pages to copy-on-write in both processes instead of copying them.
//! - [`Process::resolve_copy_on_write`] is the page fault handler that gives a process its own
//!   copy of a copy-on-write page on the first write.
//! - [`Process::set_fault_handler`] arms fault delivery for a process.
//!
//! The kernel is reached through the [`Kernel`] and [`AddressSpace`] traits. With the
//! `software-emulation` feature (and always under test) the [`emulated`] module provides a
//! software kernel with real frames, reference counts and fault delivery.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod duplicate;
mod error;
mod fault;
mod fork;
mod kernel;
pub mod layout;
mod numbers;
mod permissions;
mod process;

#[cfg(any(test, feature = "software-emulation"))]
pub mod emulated;

pub use address::VirtualAddress;
pub use address_space::{AddressSpace, SelfMappedSpace};
pub use error::{Error, ErrorKind, Step};
pub use fault::{FaultContext, FaultErrorCode};
pub use kernel::{ForkRole, Kernel, KernelError, ProcessId};
pub use numbers::{FrameNumber, PageNumber};
pub use permissions::{PermissionSet, Sharing};
pub use process::{FaultHandler, Process};
