//! Per-page access rights and the rule for sharing a page between processes.
//!
//! The raw encoding matches the hardware page table entry, so a [`PermissionSet`] can be
//! handed to the kernel as-is. The copy-on-write marker lives in one of the bits the hardware
//! leaves to software; the kernel stores it but never interprets it.

use core::fmt;
use core::ops::BitOr;

/// Access rights of one mapped page.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionSet(usize);

impl PermissionSet {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// Copy-on-write marker (bit 11).
    const COPY_ON_WRITE: usize = 1 << 11;

    /// Bits the hardware ignores and leaves to software.
    pub const SOFTWARE_BITS: usize = 0xE00;

    /// Bits a process is allowed to pass to the kernel when mapping a page.
    pub const SYSCALL_BITS: usize = Self::PRESENT | Self::WRITABLE | Self::USER | Self::SOFTWARE_BITS;

    /// Present and user-accessible, read-only.
    pub const USER_READ_ONLY: Self = Self(Self::PRESENT | Self::USER);

    /// Present, user-accessible and writable.
    pub const USER_WRITABLE: Self = Self(Self::PRESENT | Self::USER | Self::WRITABLE);

    /// Present, user-accessible and marked copy-on-write. Never writable.
    pub const USER_COPY_ON_WRITE: Self = Self(Self::PRESENT | Self::USER | Self::COPY_ON_WRITE);

    /// Creates an empty permission set (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a permission set from a raw page table entry value.
    ///
    /// Address bits are discarded.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & 0xFFF)
    }

    /// Returns the raw value of these permissions.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Returns whether the present bit is set.
    pub const fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Sets or clears the present bit.
    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    /// Returns whether the writable bit is set.
    pub const fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    /// Returns whether the user-accessible bit is set.
    pub const fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    /// Returns whether the copy-on-write marker is set.
    pub const fn is_copy_on_write(self) -> bool {
        (self.0 & Self::COPY_ON_WRITE) != 0
    }

    /// Sets or clears the copy-on-write marker.
    pub fn set_copy_on_write(&mut self, copy_on_write: bool) {
        self.set(Self::COPY_ON_WRITE, copy_on_write);
    }

    /// Returns whether the page is present and reachable from user mode.
    pub const fn is_user_mapped(self) -> bool {
        self.is_present() && self.is_user()
    }

    /// Returns whether a user-mode write would succeed without faulting.
    ///
    /// Only present, user and writable count; the copy-on-write marker does not grant or deny
    /// anything on its own.
    pub const fn allows_user_write(self) -> bool {
        self.is_user_mapped() && self.is_writable()
    }

    /// Returns whether these permissions only use bits a process may pass to the kernel.
    pub const fn is_valid_for_syscall(self) -> bool {
        self.is_user_mapped() && (self.0 & !Self::SYSCALL_BITS) == 0
    }

    /// Decides how a page with these permissions is shared with a new process.
    ///
    /// Pages that are writable, or already copy-on-write, become copy-on-write on both sides.
    /// Anything else is shared with its permissions unchanged, minus any bits the hardware
    /// maintains itself (accessed, dirty) that the kernel would refuse.
    pub const fn sharing(self) -> Sharing {
        if self.is_writable() || self.is_copy_on_write() {
            Sharing::CopyOnWrite
        } else {
            Sharing::Direct(Self(self.0 & Self::SYSCALL_BITS))
        }
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::empty()
    }
}

impl BitOr for PermissionSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PermissionSet({})", self)
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("-");
        }

        let names = [
            (Self::PRESENT, "P"),
            (Self::USER, "U"),
            (Self::WRITABLE, "W"),
            (Self::COPY_ON_WRITE, "COW"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }

        let unknown = self.0 & !(Self::PRESENT | Self::USER | Self::WRITABLE | Self::COPY_ON_WRITE);
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#x}", unknown)?;
        }
        Ok(())
    }
}

/// How a page is installed in a new process when its address space is duplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Both processes hold the page as [`PermissionSet::USER_COPY_ON_WRITE`]. The source
    /// mapping must be re-installed with those permissions too, even if it already had them.
    CopyOnWrite,
    /// The page is installed in the new process with these permissions; the source mapping
    /// is left alone.
    Direct(PermissionSet),
}

impl Sharing {
    /// Returns the permissions the new process receives.
    pub const fn target_permissions(self) -> PermissionSet {
        match self {
            Sharing::CopyOnWrite => PermissionSet::USER_COPY_ON_WRITE,
            Sharing::Direct(permissions) => permissions,
        }
    }

    /// Returns the permissions the source mapping must be re-installed with, if any.
    pub const fn source_permissions(self) -> Option<PermissionSet> {
        match self {
            Sharing::CopyOnWrite => Some(PermissionSet::USER_COPY_ON_WRITE),
            Sharing::Direct(_) => None,
        }
    }
}
