//! The kernel capability set a forking process relies on.
//!
//! Every operation names its target process explicitly. The kernel only accepts the calling
//! process itself or one of its direct children as a target.

use core::fmt;
use core::num::NonZeroU32;

use crate::{PermissionSet, VirtualAddress};

/// Identifies a process. Never zero: zero is how fork tells the child which side it is on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ProcessId(NonZeroU32);

impl ProcessId {
    /// Creates a process id, returning `None` for zero.
    pub const fn new(raw: u32) -> Option<Self> {
        match NonZeroU32::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the raw identifier.
    pub const fn as_u32(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({:08x})", self.0.get())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0.get())
    }
}

/// Which side of a fork the current continuation is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    /// Running in the original process; carries the new child's id.
    Parent(ProcessId),
    /// Running in the newly created child.
    Child,
}

impl ForkRole {
    /// Returns the conventional integer result: the child's id in the parent, zero in the child.
    pub const fn as_raw(self) -> u32 {
        match self {
            ForkRole::Parent(child) => child.as_u32(),
            ForkRole::Child => 0,
        }
    }

    /// Returns true when running in the child.
    pub const fn is_child(self) -> bool {
        matches!(self, ForkRole::Child)
    }
}

/// Errors reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The target process does not exist or the caller may not act on it.
    BadProcess,
    /// An argument was rejected (unaligned or kernel address, bad permissions, unmapped source).
    Invalid,
    /// No physical memory left.
    NoMemory,
    /// The process table is full.
    NoFreeProcess,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            KernelError::BadProcess => "bad process",
            KernelError::Invalid => "invalid parameter",
            KernelError::NoMemory => "out of memory",
            KernelError::NoFreeProcess => "out of processes",
        })
    }
}

/// Kernel calls used by fork and by copy-on-write fault resolution.
pub trait Kernel {
    /// Returns the id of the calling process.
    fn current_id(&self) -> ProcessId;

    /// Creates a child with an empty address space that is not yet runnable.
    ///
    /// The call returns twice: [`ForkRole::Parent`] right away, and [`ForkRole::Child`] in the
    /// child once it is first scheduled.
    fn create_child(&self) -> Result<ForkRole, KernelError>;

    /// Backs `address` in `target` with a fresh zeroed page, replacing any existing mapping.
    fn allocate_page(
        &self,
        target: ProcessId,
        address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError>;

    /// Maps the frame behind `source_address` in `source` at `target_address` in `target`.
    ///
    /// Fails if the source page is not mapped, or if `permissions` asks for write access the
    /// source mapping does not have.
    fn map_page(
        &self,
        source: ProcessId,
        source_address: VirtualAddress,
        target: ProcessId,
        target_address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError>;

    /// Removes one mapping. Other mappings of the same frame are unaffected. Unmapping an
    /// unmapped page succeeds.
    fn unmap_page(&self, target: ProcessId, address: VirtualAddress) -> Result<(), KernelError>;

    /// Registers the address the kernel jumps to when delivering a page fault to `target`.
    fn set_fault_entry_point(
        &self,
        target: ProcessId,
        entry_point: VirtualAddress,
    ) -> Result<(), KernelError>;

    /// Hands `target` to the scheduler.
    fn set_runnable(&self, target: ProcessId) -> Result<(), KernelError>;
}
