//! Errors raised while forking or resolving a copy-on-write fault.
//!
//! None of these are recoverable. Internal functions return them so they compose and can be
//! tested; the entry points in [`crate::Process`] turn every one of them into a panic, which
//! terminates the process.

use core::fmt;

use crate::{FaultErrorCode, KernelError, PageNumber, PermissionSet, VirtualAddress};

/// The operation that was in progress when a kernel call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Allocating the calling process's own exception stack on first handler registration.
    InstallHandlerStack,
    /// Registering the calling process's own fault entry point.
    InstallHandlerEntry,
    /// Creating the child process.
    CreateChild,
    /// Sharing one page with the child.
    DuplicatePage(PageNumber),
    /// Allocating the child's exception stack.
    ChildExceptionStack,
    /// Registering the child's fault entry point.
    ChildEntryPoint,
    /// Marking the child runnable.
    ActivateChild,
    /// Allocating the scratch page during fault resolution.
    AllocateScratch,
    /// Mapping the private copy over the faulting page.
    RemapFaultingPage,
    /// Releasing the scratch mapping.
    UnmapScratch,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::InstallHandlerStack => f.write_str("allocating exception stack"),
            Step::InstallHandlerEntry => f.write_str("setting fault entry point"),
            Step::CreateChild => f.write_str("creating child"),
            Step::DuplicatePage(page) => write!(f, "duplicating page {}", page.start()),
            Step::ChildExceptionStack => f.write_str("allocating child exception stack"),
            Step::ChildEntryPoint => f.write_str("setting child fault entry point"),
            Step::ActivateChild => f.write_str("marking child runnable"),
            Step::AllocateScratch => f.write_str("allocating scratch page"),
            Step::RemapFaultingPage => f.write_str("mapping private copy"),
            Step::UnmapScratch => f.write_str("unmapping scratch page"),
        }
    }
}

/// Broad classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A delivered fault was not a write to a copy-on-write page.
    FaultProtocolViolation,
    /// A page allocation ran out of memory.
    ResourceExhaustion,
    /// A map, unmap or non-memory allocation failure.
    MappingFailure,
    /// Creating, configuring or activating the child failed.
    SetupFailure,
    /// The requested operation does not exist.
    Unimplemented,
}

/// A fatal failure in fork or in fault resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The fault handler was asked to resolve something other than a copy-on-write write.
    BadFault {
        address: VirtualAddress,
        code: FaultErrorCode,
        permissions: PermissionSet,
    },
    /// A kernel call failed.
    Kernel { step: Step, source: KernelError },
    /// The operation is a stub.
    Unimplemented(&'static str),
}

impl Error {
    /// Returns a closure that wraps a [`KernelError`] as having happened during `step`.
    pub(crate) fn during(step: Step) -> impl FnOnce(KernelError) -> Self {
        move |source| Error::Kernel { step, source }
    }

    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadFault { .. } => ErrorKind::FaultProtocolViolation,
            Error::Unimplemented(_) => ErrorKind::Unimplemented,
            Error::Kernel { step, source } => match step {
                Step::InstallHandlerStack | Step::ChildExceptionStack | Step::AllocateScratch => {
                    if *source == KernelError::NoMemory {
                        ErrorKind::ResourceExhaustion
                    } else {
                        ErrorKind::MappingFailure
                    }
                }
                Step::DuplicatePage(_) | Step::RemapFaultingPage | Step::UnmapScratch => {
                    ErrorKind::MappingFailure
                }
                Step::InstallHandlerEntry
                | Step::CreateChild
                | Step::ChildEntryPoint
                | Step::ActivateChild => ErrorKind::SetupFailure,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadFault {
                address,
                code,
                permissions,
            } => write!(
                f,
                "bad page fault at {} err {} (page is {})",
                address, code, permissions
            ),
            Error::Kernel { step, source } => write!(f, "{} failed: {}", step, source),
            Error::Unimplemented(what) => write!(f, "{} not implemented", what),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_out_of_memory_is_exhaustion() {
        let error = Error::during(Step::AllocateScratch)(KernelError::NoMemory);
        assert_eq!(error.kind(), ErrorKind::ResourceExhaustion);

        let error = Error::during(Step::ChildExceptionStack)(KernelError::BadProcess);
        assert_eq!(error.kind(), ErrorKind::MappingFailure);
    }

    #[test]
    fn classification_follows_step() {
        let page = PageNumber::new(0x800);
        assert_eq!(
            Error::during(Step::DuplicatePage(page))(KernelError::NoMemory).kind(),
            ErrorKind::MappingFailure
        );
        assert_eq!(
            Error::during(Step::ActivateChild)(KernelError::BadProcess).kind(),
            ErrorKind::SetupFailure
        );
        assert_eq!(
            Error::Unimplemented("sfork").kind(),
            ErrorKind::Unimplemented
        );
    }

    #[test]
    fn display_names_the_step() {
        let error = Error::during(Step::DuplicatePage(PageNumber::new(0x800)))(KernelError::Invalid);
        assert_eq!(
            error.to_string(),
            "duplicating page 0x00800000 failed: invalid parameter"
        );
    }

    #[test]
    fn display_bad_fault() {
        let error = Error::BadFault {
            address: VirtualAddress::new(0xdead_beef),
            code: FaultErrorCode::from_raw(0x6),
            permissions: PermissionSet::USER_READ_ONLY,
        };
        assert_eq!(
            error.to_string(),
            "bad page fault at 0xdeadbeef err 0x00000006 (page is P|U)"
        );
    }
}
