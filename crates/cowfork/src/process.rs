//! The forking process and its fault handling state.

use crate::{
    AddressSpace, Error, FaultContext, Kernel, PageNumber, PermissionSet, ProcessId, Step,
    VirtualAddress, duplicate, fault, layout,
};

/// A page fault handler. It either resolves the fault or reports why it could not.
pub type FaultHandler<K> = fn(&Process<K>, &FaultContext) -> Result<(), Error>;

/// A user process, as seen from inside itself.
///
/// Holds the handle through which the process talks to the kernel, its own id, the address of
/// the fault trampoline the kernel should enter on a page fault, and the handler that
/// trampoline dispatches to.
pub struct Process<K> {
    pub(crate) kernel: K,
    pub(crate) id: ProcessId,
    pub(crate) entry_point: VirtualAddress,
    pub(crate) handler: Option<FaultHandler<K>>,
}

impl<K> Process<K>
where
    K: Kernel + AddressSpace,
{
    /// Creates the process state for the caller of `kernel`.
    ///
    /// `entry_point` is the address of the fault trampoline. No handler is registered yet.
    pub fn new(kernel: K, entry_point: VirtualAddress) -> Self {
        let id = kernel.current_id();
        Self {
            kernel,
            id,
            entry_point,
            handler: None,
        }
    }

    /// Returns this process's id.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Returns the kernel handle.
    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Returns the fault trampoline address.
    pub fn entry_point(&self) -> VirtualAddress {
        self.entry_point
    }

    /// Returns whether a fault handler is registered.
    pub fn has_fault_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Registers `handler` for page faults, terminating the process if that fails.
    pub fn set_fault_handler(&mut self, handler: FaultHandler<K>) {
        if let Err(error) = self.try_set_fault_handler(handler) {
            self.terminate("set_fault_handler", error);
        }
    }

    /// Registers `handler` for page faults.
    ///
    /// The first registration allocates the exception stack and tells the kernel where the
    /// trampoline is. Later registrations only swap the handler.
    pub fn try_set_fault_handler(&mut self, handler: FaultHandler<K>) -> Result<(), Error> {
        if self.handler.is_none() {
            self.kernel
                .allocate_page(
                    self.id,
                    layout::EXCEPTION_STACK.start(),
                    PermissionSet::USER_WRITABLE,
                )
                .map_err(Error::during(Step::InstallHandlerStack))?;
            self.kernel
                .set_fault_entry_point(self.id, self.entry_point)
                .map_err(Error::during(Step::InstallHandlerEntry))?;
            log::debug!("[{}] fault handling armed at {}", self.id, self.entry_point);
        }

        self.handler = Some(handler);
        Ok(())
    }

    /// Entry point for the fault trampoline.
    ///
    /// Runs the registered handler. A fault that the handler cannot resolve, or a fault with no
    /// handler registered, terminates the process.
    pub fn dispatch_fault(&self, fault: &FaultContext) {
        let Some(handler) = self.handler else {
            log::error!("[{}] page fault at {} with no handler", self.id, fault.address());
            panic!(
                "[{}] page fault at {} err {} with no handler registered",
                self.id,
                fault.address(),
                fault.code()
            );
        };

        if let Err(error) = handler(self, fault) {
            self.terminate("pgfault", error);
        }
    }

    /// The copy-on-write fault handler installed by fork.
    pub fn resolve_copy_on_write(&self, fault: &FaultContext) -> Result<(), Error> {
        fault::resolve_copy_on_write(&self.kernel, self.id, fault)
    }

    /// Shares one of this process's pages with `target`, copy-on-write if it is writable.
    pub fn duplicate_page(&self, target: ProcessId, page: PageNumber) -> Result<(), Error> {
        duplicate::duplicate_page(&self.kernel, self.id, target, page)
            .map_err(Error::during(Step::DuplicatePage(page)))
    }

    /// Logs `error` and terminates the process.
    pub(crate) fn terminate(&self, operation: &str, error: Error) -> ! {
        log::error!("[{}] {}: {}", self.id, operation, error);
        panic!("[{}] {}: {}", self.id, operation, error)
    }
}
