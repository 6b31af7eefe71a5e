//! Software emulation of the kernel primitives fork relies on.
//!
//! A [`Machine`] owns a pool of page-sized frames with reference counts and a table of
//! processes, each with its own page mappings. An [`EmulatedProcess`] is one process's handle
//! onto the machine and implements both [`Kernel`](crate::Kernel) and
//! [`AddressSpace`](crate::AddressSpace), enforcing the same rules the real kernel does:
//!
//! - a process may only operate on itself or its direct children,
//! - user addresses must be page aligned and below [`USER_TOP`](crate::layout::USER_TOP),
//! - permissions must be user-mapped and only use bits a process may set,
//! - a mapping may not grant write access the source mapping lacks.
//!
//! User-mode memory accesses go through [`Process::store`](crate::Process::store) and
//! [`Process::load`](crate::Process::load), which fault exactly where hardware would and
//! deliver the fault to the process's registered handler.
//!
//! Every kernel call is recorded so tests can check the order in which fork issued them, and
//! any one of them can be made to fail through [`Machine::fail_next`].

mod machine;
mod process;

pub use machine::Machine;
pub use process::EmulatedProcess;

use crate::{PermissionSet, ProcessId, VirtualAddress};

/// Sizing of an emulated machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of frames that can be in use at once.
    pub frames: usize,
    /// Number of processes that can exist at once.
    pub processes: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            frames: 1024,
            processes: 64,
        }
    }
}

/// Scheduling state of an emulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Created but not yet handed to the scheduler.
    NotRunnable,
    /// Eligible to run.
    Runnable,
}

/// One recorded kernel call. The calling process is recorded alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    CreateChild,
    AllocatePage {
        target: ProcessId,
        address: VirtualAddress,
        permissions: PermissionSet,
    },
    MapPage {
        source: ProcessId,
        source_address: VirtualAddress,
        target: ProcessId,
        target_address: VirtualAddress,
        permissions: PermissionSet,
    },
    UnmapPage {
        target: ProcessId,
        address: VirtualAddress,
    },
    SetFaultEntryPoint {
        target: ProcessId,
        entry_point: VirtualAddress,
    },
    SetRunnable {
        target: ProcessId,
    },
}

/// The kind of a [`Syscall`], without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallKind {
    CreateChild,
    AllocatePage,
    MapPage,
    UnmapPage,
    SetFaultEntryPoint,
    SetRunnable,
}

impl Syscall {
    pub fn kind(&self) -> SyscallKind {
        match self {
            Syscall::CreateChild => SyscallKind::CreateChild,
            Syscall::AllocatePage { .. } => SyscallKind::AllocatePage,
            Syscall::MapPage { .. } => SyscallKind::MapPage,
            Syscall::UnmapPage { .. } => SyscallKind::UnmapPage,
            Syscall::SetFaultEntryPoint { .. } => SyscallKind::SetFaultEntryPoint,
            Syscall::SetRunnable { .. } => SyscallKind::SetRunnable,
        }
    }

    /// Returns whether this call maps a page at `address` in `target`.
    pub fn is_map_into(&self, target: ProcessId, address: VirtualAddress) -> bool {
        matches!(
            self,
            Syscall::MapPage { target: t, target_address, .. }
                if *t == target && *target_address == address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_map_into_matches_target_only() {
        let parent = ProcessId::new(0x1001).unwrap();
        let child = ProcessId::new(0x1002).unwrap();
        let address = VirtualAddress::new(0x0080_0000);
        let call = Syscall::MapPage {
            source: parent,
            source_address: address,
            target: child,
            target_address: address,
            permissions: PermissionSet::USER_COPY_ON_WRITE,
        };

        assert!(call.is_map_into(child, address));
        assert!(!call.is_map_into(parent, address));
        assert!(!call.is_map_into(child, address + 0x1000));
        assert!(!Syscall::SetRunnable { target: child }.is_map_into(child, address));
    }
}
