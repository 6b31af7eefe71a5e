//! Copy-on-write fork.
//!
//! Fork never copies memory up front. It arms the copy-on-write fault handler, creates an
//! empty child, and maps every user page of the parent into the child: read-only pages as
//! they are, everything writable as copy-on-write on both sides. The child then gets its own
//! freshly allocated exception stack (the one page that is never shared), learns where the
//! fault trampoline is, and only then is handed to the scheduler. Whoever writes a shared page
//! first takes a private copy in [`crate::fault`].

use crate::{
    AddressSpace, Error, ForkRole, Kernel, PageNumber, PermissionSet, Process, ProcessId, Step,
    layout,
};

impl<K> Process<K>
where
    K: Kernel + AddressSpace,
{
    /// Forks this process, terminating it if anything goes wrong.
    ///
    /// Returns [`ForkRole::Parent`] with the child's id in the parent and [`ForkRole::Child`]
    /// in the child.
    pub fn fork(&mut self) -> ForkRole {
        match self.try_fork() {
            Ok(role) => role,
            Err(error) => self.terminate("fork", error),
        }
    }

    /// Forks this process.
    ///
    /// A failure leaves any half-built child behind, not runnable.
    pub fn try_fork(&mut self) -> Result<ForkRole, Error> {
        self.try_set_fault_handler(Self::resolve_copy_on_write)?;

        let child = match self
            .kernel
            .create_child()
            .map_err(Error::during(Step::CreateChild))?
        {
            ForkRole::Child => {
                self.id = self.kernel.current_id();
                log::debug!("[{}] running as fork child", self.id);
                return Ok(ForkRole::Child);
            }
            ForkRole::Parent(child) => child,
        };

        let shared = self.duplicate_address_space(child)?;

        self.kernel
            .allocate_page(
                child,
                layout::EXCEPTION_STACK.start(),
                PermissionSet::USER_WRITABLE,
            )
            .map_err(Error::during(Step::ChildExceptionStack))?;
        self.kernel
            .set_fault_entry_point(child, self.entry_point)
            .map_err(Error::during(Step::ChildEntryPoint))?;
        self.kernel
            .set_runnable(child)
            .map_err(Error::during(Step::ActivateChild))?;

        log::debug!("[{}] forked {} sharing {} pages", self.id, child, shared);
        Ok(ForkRole::Parent(child))
    }

    /// Fork variant that shares writable memory instead of copying it. Not implemented;
    /// always terminates the process.
    pub fn sfork(&mut self) -> ForkRole {
        match self.try_sfork() {
            Ok(role) => role,
            Err(error) => self.terminate("sfork", error),
        }
    }

    /// Fork variant that shares writable memory instead of copying it. Not implemented.
    pub fn try_sfork(&mut self) -> Result<ForkRole, Error> {
        Err(Error::Unimplemented("sfork"))
    }

    /// Shares every user page below [`layout::USER_TOP`] with `child`, except the exception
    /// stack. Pages are visited in ascending order; tables that are absent are skipped whole.
    ///
    /// Returns the number of pages shared.
    fn duplicate_address_space(&self, child: ProcessId) -> Result<usize, Error> {
        let mut shared = 0;

        for table in 0..layout::USER_TABLES {
            if !self.kernel.table_present(table) {
                continue;
            }

            let first = PageNumber::first_in_table(table);
            for page in (0..layout::PAGES_PER_TABLE).map(|offset| first + offset) {
                if page.start() >= layout::USER_TOP {
                    break;
                }
                if page == layout::EXCEPTION_STACK {
                    continue;
                }
                if !self.kernel.permissions(page).is_user_mapped() {
                    continue;
                }

                self.duplicate_page(child, page)?;
                shared += 1;
            }
        }

        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::{
        EmulatedProcess, Machine, MachineConfig, ProcessStatus, Syscall, SyscallKind,
    };
    use crate::{ErrorKind, KernelError, VirtualAddress};
    use alloc::sync::Arc;

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0080_0020);
    const TEXT: VirtualAddress = layout::PROGRAM_START;
    const DATA: VirtualAddress = VirtualAddress::new(0x0080_3000);
    const STACK: VirtualAddress = VirtualAddress::new(layout::USER_STACK_TOP.as_usize() - 0x1000);

    /// Boots a process with a read-only text page, a writable data page and a stack page.
    fn setup(config: MachineConfig) -> (Arc<Machine>, Process<EmulatedProcess>) {
        let machine = Machine::new(config);
        let process = Process::new(machine.boot(), ENTRY);
        let id = process.id();
        machine.load(id, TEXT.page_number(), PermissionSet::USER_READ_ONLY, b"text");
        machine.load(id, DATA.page_number(), PermissionSet::USER_WRITABLE, b"AAAA");
        machine.load(id, STACK.page_number(), PermissionSet::USER_WRITABLE, b"stack");
        (machine, process)
    }

    fn fork_parent(process: &mut Process<EmulatedProcess>) -> ProcessId {
        match process.fork() {
            ForkRole::Parent(child) => child,
            ForkRole::Child => panic!("parent continuation observed the child role"),
        }
    }

    mod parent {
        use super::*;

        #[test]
        fn returns_a_non_zero_child_id() {
            let (machine, mut parent) = setup(MachineConfig::default());

            let role = parent.fork();

            let ForkRole::Parent(child) = role else {
                panic!("expected parent role");
            };
            assert_ne!(role.as_raw(), 0);
            assert_ne!(child, parent.id());
            assert_eq!(machine.status(child), Some(ProcessStatus::Runnable));
            assert_eq!(machine.entry_point(child), Some(ENTRY));
        }

        #[test]
        fn shares_user_pages() {
            let (machine, mut parent) = setup(MachineConfig::default());

            let child = fork_parent(&mut parent);

            for page in [DATA.page_number(), STACK.page_number()] {
                assert_eq!(machine.frame(child, page), machine.frame(parent.id(), page));
                assert_eq!(
                    machine.permissions(child, page),
                    Some(PermissionSet::USER_COPY_ON_WRITE)
                );
                assert_eq!(
                    machine.permissions(parent.id(), page),
                    Some(PermissionSet::USER_COPY_ON_WRITE)
                );
            }
            assert_eq!(
                machine.permissions(child, TEXT.page_number()),
                Some(PermissionSet::USER_READ_ONLY)
            );
            assert_eq!(
                machine.permissions(parent.id(), TEXT.page_number()),
                Some(PermissionSet::USER_READ_ONLY)
            );
        }

        #[test]
        fn pages_are_shared_in_ascending_order() {
            let (machine, mut parent) = setup(MachineConfig::default());
            machine.clear_syscalls();

            let child = fork_parent(&mut parent);

            let targets: Vec<_> = machine
                .syscalls()
                .iter()
                .filter_map(|(_, call)| match call {
                    Syscall::MapPage {
                        target,
                        target_address,
                        ..
                    } if *target == child => Some(*target_address),
                    _ => None,
                })
                .collect();
            assert_eq!(targets, vec![TEXT, DATA, STACK]);
        }

        #[test]
        fn never_duplicates_the_exception_stack() {
            let (machine, mut parent) = setup(MachineConfig::default());
            parent.set_fault_handler(Process::resolve_copy_on_write);
            machine.clear_syscalls();

            let child = fork_parent(&mut parent);

            let stack = layout::EXCEPTION_STACK.start();
            assert!(!machine.syscalls().iter().any(|(_, call)| matches!(
                call,
                Syscall::MapPage { source_address, .. } if *source_address == stack
            )));
            assert_ne!(
                machine.frame(child, layout::EXCEPTION_STACK),
                machine.frame(parent.id(), layout::EXCEPTION_STACK)
            );
        }

        #[test]
        fn child_exception_stack_is_private_even_if_parent_stack_is_copy_on_write() {
            let (machine, mut parent) = setup(MachineConfig::default());
            parent.set_fault_handler(Process::resolve_copy_on_write);
            // Corrupt the parent's own stack marking; the child must not inherit it.
            machine.load(
                parent.id(),
                layout::EXCEPTION_STACK,
                PermissionSet::USER_COPY_ON_WRITE,
                &[],
            );

            let child = fork_parent(&mut parent);

            let permissions = machine.permissions(child, layout::EXCEPTION_STACK).unwrap();
            assert!(!permissions.is_copy_on_write());
            assert_eq!(permissions, PermissionSet::USER_WRITABLE);
            let frame = machine.frame(child, layout::EXCEPTION_STACK).unwrap();
            assert_eq!(machine.references(frame), 1);
        }

        #[test]
        fn child_becomes_runnable_last() {
            let (machine, mut parent) = setup(MachineConfig::default());
            machine.clear_syscalls();

            let child = fork_parent(&mut parent);

            let calls = machine.syscalls();
            let (_, last) = calls.last().unwrap();
            assert_eq!(*last, Syscall::SetRunnable { target: child });
            let activations = calls
                .iter()
                .filter(|(_, call)| matches!(call, Syscall::SetRunnable { .. }))
                .count();
            assert_eq!(activations, 1);
        }

        #[test]
        fn skips_absent_tables() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let far = PageNumber::first_in_table(500) + 7;
            machine.load(parent.id(), far, PermissionSet::USER_WRITABLE, b"far");
            let before = machine.page_lookups();

            let child = fork_parent(&mut parent);

            assert_eq!(
                machine.permissions(child, far),
                Some(PermissionSet::USER_COPY_ON_WRITE)
            );
            // Only the three populated tables are walked.
            assert!(machine.page_lookups() - before < 4 * layout::PAGES_PER_TABLE);
        }

        #[test]
        fn kernel_only_pages_are_not_shared() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let private = VirtualAddress::new(0x0090_0000).page_number();
            machine.load(parent.id(), private, PermissionSet::from_raw(0x3), b"kernel");

            let child = fork_parent(&mut parent);

            assert_eq!(machine.permissions(child, private), None);
        }
    }

    mod child {
        use super::*;

        #[test]
        fn child_continuation_returns_zero_and_refreshes_its_id() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let child = fork_parent(&mut parent);

            let mut continuation = machine.resume_child(&parent, child).unwrap();
            assert_eq!(continuation.id(), parent.id());

            let role = continuation.fork();

            assert_eq!(role, ForkRole::Child);
            assert_eq!(role.as_raw(), 0);
            assert_eq!(continuation.id(), child);
        }

        #[test]
        fn child_cannot_resume_before_it_is_runnable() {
            let (machine, parent) = setup(MachineConfig::default());
            let ForkRole::Parent(child) = parent.kernel().create_child().unwrap() else {
                panic!("expected parent role");
            };

            assert_eq!(
                machine.resume_child(&parent, child).err(),
                Some(KernelError::BadProcess)
            );
        }

        #[test]
        fn isolation_after_child_write() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let child = fork_parent(&mut parent);
            let mut continuation = machine.resume_child(&parent, child).unwrap();
            assert_eq!(continuation.fork(), ForkRole::Child);

            continuation.store(DATA, b"BBBB");

            assert_eq!(parent.load(DATA, 4), b"AAAA");
            assert_eq!(continuation.load(DATA, 4), b"BBBB");
            assert_ne!(
                machine.frame(parent.id(), DATA.page_number()),
                machine.frame(child, DATA.page_number())
            );
        }

        #[test]
        fn isolation_after_parent_write() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let child = fork_parent(&mut parent);

            parent.store(DATA, b"CCCC");

            let continuation = machine.resume_child(&parent, child).unwrap();
            assert_eq!(continuation.load(DATA, 4), b"AAAA");
            assert_eq!(parent.load(DATA, 4), b"CCCC");
        }

        #[test]
        fn grandchild_keeps_isolation() {
            let (machine, mut parent) = setup(MachineConfig::default());
            let child = fork_parent(&mut parent);
            let mut child_process = machine.resume_child(&parent, child).unwrap();
            assert_eq!(child_process.fork(), ForkRole::Child);

            let grandchild = fork_parent(&mut child_process);
            let mut grandchild_process = machine.resume_child(&child_process, grandchild).unwrap();
            assert_eq!(grandchild_process.fork(), ForkRole::Child);

            // The page the child re-shared is copy-on-write in all three processes.
            for id in [parent.id(), child, grandchild] {
                assert_eq!(
                    machine.permissions(id, DATA.page_number()),
                    Some(PermissionSet::USER_COPY_ON_WRITE)
                );
            }

            child_process.store(DATA, b"BBBB");
            grandchild_process.store(DATA, b"GGGG");

            assert_eq!(parent.load(DATA, 4), b"AAAA");
            assert_eq!(child_process.load(DATA, 4), b"BBBB");
            assert_eq!(grandchild_process.load(DATA, 4), b"GGGG");
        }
    }

    mod failures {
        use super::*;

        #[test]
        #[should_panic(expected = "fork: creating child failed: out of processes")]
        fn no_free_process() {
            let (_machine, mut parent) = setup(MachineConfig {
                processes: 1,
                ..MachineConfig::default()
            });

            parent.fork();
        }

        #[test]
        fn duplication_failure_is_reported_with_the_page() {
            let (machine, mut parent) = setup(MachineConfig::default());
            machine.fail_next_map(DATA, KernelError::Invalid);

            let error = parent.try_fork().unwrap_err();

            assert_eq!(
                error,
                Error::Kernel {
                    step: Step::DuplicatePage(DATA.page_number()),
                    source: KernelError::Invalid,
                }
            );
            assert_eq!(error.kind(), ErrorKind::MappingFailure);
        }

        #[test]
        fn failed_fork_leaves_child_not_runnable() {
            // Three loaded pages plus the parent's exception stack use every frame.
            let (machine, mut parent) = setup(MachineConfig {
                frames: 4,
                ..MachineConfig::default()
            });

            let error = parent.try_fork().unwrap_err();

            assert_eq!(
                error,
                Error::Kernel {
                    step: Step::ChildExceptionStack,
                    source: KernelError::NoMemory,
                }
            );
            assert_eq!(error.kind(), ErrorKind::ResourceExhaustion);
            let child = machine.children(parent.id())[0];
            assert_eq!(machine.status(child), Some(ProcessStatus::NotRunnable));
        }

        #[test]
        #[should_panic(expected = "fork: allocating child exception stack failed: out of memory")]
        fn out_of_memory_terminates_the_parent() {
            let (_machine, mut parent) = setup(MachineConfig {
                frames: 4,
                ..MachineConfig::default()
            });

            parent.fork();
        }

        /// Arms fault handling up front so the next entry point and activation calls are the
        /// ones fork issues for the child.
        fn armed_parent() -> (Arc<Machine>, Process<EmulatedProcess>) {
            let (machine, mut parent) = setup(MachineConfig::default());
            parent.set_fault_handler(Process::resolve_copy_on_write);
            (machine, parent)
        }

        #[test]
        fn child_entry_point_failure_leaves_child_not_runnable() {
            let (machine, mut parent) = armed_parent();
            machine.fail_next(SyscallKind::SetFaultEntryPoint, KernelError::BadProcess);

            let error = parent.try_fork().unwrap_err();

            assert_eq!(
                error,
                Error::Kernel {
                    step: Step::ChildEntryPoint,
                    source: KernelError::BadProcess,
                }
            );
            assert_eq!(error.kind(), ErrorKind::SetupFailure);
            let child = machine.children(parent.id())[0];
            assert_eq!(machine.status(child), Some(ProcessStatus::NotRunnable));
            assert_eq!(machine.entry_point(child), None);
        }

        #[test]
        #[should_panic(expected = "fork: setting child fault entry point failed: bad process")]
        fn child_entry_point_failure_terminates_the_parent() {
            let (machine, mut parent) = armed_parent();
            machine.fail_next(SyscallKind::SetFaultEntryPoint, KernelError::BadProcess);

            parent.fork();
        }

        #[test]
        fn activation_failure_leaves_child_not_runnable() {
            let (machine, mut parent) = armed_parent();
            machine.fail_next(SyscallKind::SetRunnable, KernelError::BadProcess);

            let error = parent.try_fork().unwrap_err();

            assert_eq!(
                error,
                Error::Kernel {
                    step: Step::ActivateChild,
                    source: KernelError::BadProcess,
                }
            );
            assert_eq!(error.kind(), ErrorKind::SetupFailure);
            let child = machine.children(parent.id())[0];
            assert_eq!(machine.status(child), Some(ProcessStatus::NotRunnable));
            assert_eq!(machine.entry_point(child), Some(ENTRY));
        }

        #[test]
        #[should_panic(expected = "fork: marking child runnable failed: bad process")]
        fn activation_failure_terminates_the_parent() {
            let (machine, mut parent) = armed_parent();
            machine.fail_next(SyscallKind::SetRunnable, KernelError::BadProcess);

            parent.fork();
        }

        #[test]
        fn handler_entry_failure_stops_before_creating_a_child() {
            let (machine, mut parent) = setup(MachineConfig::default());
            machine.fail_next(SyscallKind::SetFaultEntryPoint, KernelError::BadProcess);

            let error = parent.try_fork().unwrap_err();

            assert_eq!(
                error,
                Error::Kernel {
                    step: Step::InstallHandlerEntry,
                    source: KernelError::BadProcess,
                }
            );
            assert!(machine.children(parent.id()).is_empty());
        }

        #[test]
        #[should_panic(expected = "sfork: sfork not implemented")]
        fn sfork_is_unimplemented() {
            let (_machine, mut parent) = setup(MachineConfig::default());

            parent.sfork();
        }

        #[test]
        fn try_sfork_reports_unimplemented_without_side_effects() {
            let (machine, mut parent) = setup(MachineConfig::default());
            machine.clear_syscalls();

            let error = parent.try_sfork().unwrap_err();

            assert_eq!(error.kind(), ErrorKind::Unimplemented);
            assert!(machine.syscalls().is_empty());
        }
    }
}
