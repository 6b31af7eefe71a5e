//! Copy-on-write page fault resolution.
//!
//! A write to a page that fork shared with another process faults, because the shared mapping
//! is never writable. The handler here gives the faulting process its own copy of the page:
//!
//! 1. allocate a fresh page at [`layout::SCRATCH`],
//! 2. copy the faulting page into it,
//! 3. map the new frame over the faulting page, writable and no longer copy-on-write,
//! 4. drop the scratch mapping.
//!
//! The old frame is not touched and stays mapped in whichever processes still share it.
//! All of this runs on the process's private exception stack, which is never copy-on-write,
//! so it cannot fault recursively.

use core::fmt;

use crate::{
    AddressSpace, Error, Kernel, PermissionSet, ProcessId, Step, VirtualAddress, layout,
};

/// Error flags the kernel reports with a page fault.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultErrorCode(u32);

impl FaultErrorCode {
    /// The page was present; the fault is a protection violation (bit 0).
    const PROTECTION_VIOLATION: u32 = 1 << 0;

    /// The faulting access was a write (bit 1).
    const WRITE: u32 = 1 << 1;

    /// The fault happened in user mode (bit 2).
    const USER_MODE: u32 = 1 << 2;

    /// Creates an error code from the raw kernel value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds the error code for a user-mode access.
    pub const fn user_access(write: bool, page_present: bool) -> Self {
        let mut raw = Self::USER_MODE;
        if write {
            raw |= Self::WRITE;
        }
        if page_present {
            raw |= Self::PROTECTION_VIOLATION;
        }
        Self(raw)
    }

    /// Returns the raw kernel value.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Returns whether the faulting access was a write.
    pub const fn is_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Returns whether the page was present when the fault happened.
    pub const fn is_protection_violation(self) -> bool {
        self.0 & Self::PROTECTION_VIOLATION != 0
    }

    /// Returns whether the fault happened in user mode.
    pub const fn is_user_mode(self) -> bool {
        self.0 & Self::USER_MODE != 0
    }
}

impl fmt::Debug for FaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultErrorCode({:#x})", self.0)
    }
}

impl fmt::Display for FaultErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// One delivered page fault, as handed to the process by the fault trampoline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultContext {
    address: VirtualAddress,
    code: FaultErrorCode,
}

impl FaultContext {
    pub const fn new(address: VirtualAddress, code: FaultErrorCode) -> Self {
        Self { address, code }
    }

    /// Returns the exact faulting address.
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Returns the kernel's error flags.
    pub const fn code(&self) -> FaultErrorCode {
        self.code
    }
}

/// Replaces the copy-on-write page containing the faulting address with a private copy.
pub(crate) fn resolve_copy_on_write<K>(
    kernel: &K,
    me: ProcessId,
    fault: &FaultContext,
) -> Result<(), Error>
where
    K: Kernel + AddressSpace,
{
    let address = fault.address();
    let page = address.page_number();
    let permissions = kernel.permissions(page);

    if !fault.code().is_write() || !permissions.is_copy_on_write() {
        return Err(Error::BadFault {
            address,
            code: fault.code(),
            permissions,
        });
    }

    kernel
        .allocate_page(me, layout::SCRATCH, PermissionSet::USER_WRITABLE)
        .map_err(Error::during(Step::AllocateScratch))?;

    // SAFETY: the faulting page is mapped (it is copy-on-write, hence present), the scratch
    // page was just allocated writable, and the scratch page is never copy-on-write.
    unsafe { kernel.copy_page(page, layout::SCRATCH.page_number()) };

    kernel
        .map_page(
            me,
            layout::SCRATCH,
            me,
            page.start(),
            PermissionSet::USER_WRITABLE,
        )
        .map_err(Error::during(Step::RemapFaultingPage))?;

    kernel
        .unmap_page(me, layout::SCRATCH)
        .map_err(Error::during(Step::UnmapScratch))?;

    log::debug!("[{}] copied page {} on write", me, page.start());
    Ok(())
}
