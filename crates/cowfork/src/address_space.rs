//! Read-only introspection of the calling process's own address space.
//!
//! Fork needs to know how each of its pages is currently mapped before it can decide how to
//! share it, and the fault handler needs to know whether a faulting page is copy-on-write.
//! The kernel exposes this as a read-only self map of the page tables; [`SelfMappedSpace`] is
//! the view over that map, and the emulated kernel provides its own implementation.

use crate::{PageNumber, PermissionSet, VirtualAddress, layout};

/// The calling process's view of its own address space.
pub trait AddressSpace {
    /// Returns the current permissions of `page`. Unmapped pages report an empty set.
    fn permissions(&self, page: PageNumber) -> PermissionSet;

    /// Returns whether the page table with the given index exists.
    ///
    /// When this returns false, every page in that table is unmapped, so a walk may skip it.
    fn table_present(&self, table: usize) -> bool {
        let _ = table;
        true
    }

    /// Copies the full contents of page `from` to page `to`.
    ///
    /// # Safety
    ///
    /// Both pages must be mapped in the calling process, `to` must be writable, and the two
    /// pages must be different.
    unsafe fn copy_page(&self, from: PageNumber, to: PageNumber);
}

/// View over the kernel's read-only self map of the page directory and page tables.
///
/// Models the 32-bit two-level layout: one directory of [`layout::PAGES_PER_TABLE`]
/// word-sized entries, each covering a table of as many word-sized page entries, with the
/// page tables laid out contiguously so the entry for page `n` is word `n` of the table view.
/// Only [`SelfMappedSpace::current`] depends on the real self map being present, and it only
/// exists on 32-bit x86. Elsewhere the view is built over caller-provided arrays with
/// [`SelfMappedSpace::new`].
pub struct SelfMappedSpace {
    /// One entry per page table.
    directory: *const usize,
    /// One entry per page, indexed by page number.
    tables: *const usize,
}

impl SelfMappedSpace {
    /// Creates a view over the given page directory and page table arrays.
    ///
    /// # Safety
    ///
    /// `directory` must point to [`layout::USER_TABLES`] readable entries. For every entry
    /// marked present, the [`layout::PAGES_PER_TABLE`] entries of that table starting at
    /// `tables` must be readable.
    pub const unsafe fn new(directory: VirtualAddress, tables: VirtualAddress) -> Self {
        Self {
            directory: directory.as_ptr(),
            tables: tables.as_ptr(),
        }
    }

    /// Creates a view over the self map at its fixed location.
    ///
    /// # Safety
    ///
    /// Must only be used inside a process where the kernel has installed the self map.
    #[cfg(target_arch = "x86")]
    pub const unsafe fn current() -> Self {
        // SAFETY: the kernel maps the directory and tables at these fixed addresses.
        unsafe { Self::new(layout::SELF_MAP_DIRECTORY, layout::SELF_MAP_TABLES) }
    }
}

impl AddressSpace for SelfMappedSpace {
    fn table_present(&self, table: usize) -> bool {
        if table >= layout::USER_TABLES {
            return false;
        }

        // SAFETY: the constructor guarantees USER_TABLES readable directory entries.
        let entry = unsafe { self.directory.add(table).read_volatile() };
        PermissionSet::from_raw(entry).is_present()
    }

    fn permissions(&self, page: PageNumber) -> PermissionSet {
        if !self.table_present(page.table()) {
            return PermissionSet::empty();
        }

        // SAFETY: the table holding this page is present, so its entries are readable.
        let entry = unsafe { self.tables.add(page.as_usize()).read_volatile() };
        PermissionSet::from_raw(entry)
    }

    unsafe fn copy_page(&self, from: PageNumber, to: PageNumber) {
        // SAFETY: the caller guarantees both pages are mapped, distinct, and `to` is writable.
        unsafe {
            core::ptr::copy_nonoverlapping(
                from.start().as_ptr::<u8>(),
                to.start().as_mut_ptr::<u8>(),
                layout::PAGE_SIZE,
            );
        }
    }
}
