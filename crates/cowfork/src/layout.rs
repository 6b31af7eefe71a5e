//! Fixed user-space memory layout.
//!
//! ```text
//!  USER_TOP, EXCEPTION_STACK_TOP  0xeec0_0000  +------------------------+
//!                                              | exception stack (1 pg) |
//!                                 0xeebf_f000  +------------------------+
//!                                              | unmapped guard page    |
//!  USER_STACK_TOP                 0xeebf_e000  +------------------------+
//!                                              | normal user stack      |
//!                                              ~~~~~~~~~~~~~~~~~~~~~~~~~~
//!                                              | program data & heap    |
//!  PROGRAM_START                  0x0080_0000  +------------------------+
//!  SCRATCH                        0x007f_f000  | fault scratch (1 pg)   |
//!                                              +------------------------+
//! ```
//!
//! Above `USER_TOP` the kernel keeps its read-only self map of the page tables.

use crate::{PageNumber, VirtualAddress};

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table entries in one page table.
pub const PAGES_PER_TABLE: usize = 1024;

/// Bytes of virtual memory mapped by one page table (4 MiB).
pub const TABLE_SIZE: usize = PAGE_SIZE * PAGES_PER_TABLE;

/// First address that is not part of user space. Fork duplicates nothing at or above it.
pub const USER_TOP: VirtualAddress = VirtualAddress::new(0xeec0_0000);

/// One past the last byte of the exception stack.
pub const EXCEPTION_STACK_TOP: VirtualAddress = USER_TOP;

/// The single page used as the exception stack.
pub const EXCEPTION_STACK: PageNumber =
    PageNumber::new((EXCEPTION_STACK_TOP.as_usize() - PAGE_SIZE) / PAGE_SIZE);

/// Top of the normal user stack, one guard page below the exception stack.
pub const USER_STACK_TOP: VirtualAddress = VirtualAddress::new(USER_TOP.as_usize() - 2 * PAGE_SIZE);

/// Where program images are loaded.
pub const PROGRAM_START: VirtualAddress = VirtualAddress::new(2 * TABLE_SIZE);

/// Reserved scratch page used while resolving a copy-on-write fault.
pub const SCRATCH: VirtualAddress = VirtualAddress::new(2 * TABLE_SIZE - PAGE_SIZE);

/// Read-only view of every page table entry, mapped by the kernel.
pub const SELF_MAP_TABLES: VirtualAddress = VirtualAddress::new(0xef40_0000);

/// Read-only view of the page directory inside [`SELF_MAP_TABLES`].
pub const SELF_MAP_DIRECTORY: VirtualAddress = VirtualAddress::new(
    SELF_MAP_TABLES.as_usize() + (SELF_MAP_TABLES.as_usize() / TABLE_SIZE) * PAGE_SIZE,
);

/// Number of page tables that cover user space.
pub const USER_TABLES: usize = USER_TOP.as_usize().div_ceil(TABLE_SIZE);
