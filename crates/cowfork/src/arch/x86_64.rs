//! x86_64 page table flags and page fault error codes.

use ::x86_64::structures::idt::PageFaultErrorCode;
use ::x86_64::structures::paging::PageTableFlags;

use crate::{FaultErrorCode, PermissionSet};

impl From<PermissionSet> for PageTableFlags {
    fn from(permissions: PermissionSet) -> Self {
        PageTableFlags::from_bits_truncate(permissions.to_raw() as u64)
    }
}

impl From<PageTableFlags> for PermissionSet {
    fn from(flags: PageTableFlags) -> Self {
        PermissionSet::from_raw(flags.bits() as usize)
    }
}

impl From<PageFaultErrorCode> for FaultErrorCode {
    fn from(code: PageFaultErrorCode) -> Self {
        FaultErrorCode::from_raw(code.bits() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_on_write_is_bit_11() {
        let flags = PageTableFlags::from(PermissionSet::USER_COPY_ON_WRITE);
        assert_eq!(
            flags,
            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::BIT_11
        );
    }

    #[test]
    fn flags_convert_back() {
        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::NO_EXECUTE;
        // Bits above the low twelve are not permissions.
        assert_eq!(PermissionSet::from(flags), PermissionSet::USER_WRITABLE);
    }

    #[test]
    fn page_fault_error_code() {
        let code = FaultErrorCode::from(
            PageFaultErrorCode::CAUSED_BY_WRITE
                | PageFaultErrorCode::USER_MODE
                | PageFaultErrorCode::PROTECTION_VIOLATION,
        );
        assert_eq!(code, FaultErrorCode::user_access(true, true));
    }
}
