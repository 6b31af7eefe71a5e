//! A process's handle onto the emulated machine.

use alloc::{sync::Arc, vec::Vec};
use core::cell::Cell;

use super::Machine;
use crate::{
    AddressSpace, FaultContext, ForkRole, Kernel, KernelError, PageNumber, PermissionSet, Process,
    ProcessId, VirtualAddress,
};

/// One process running on a [`Machine`].
pub struct EmulatedProcess {
    machine: Arc<Machine>,
    id: ProcessId,
    /// Set for a freshly scheduled fork child until its pending fork call returns.
    resumed: Cell<bool>,
}

impl EmulatedProcess {
    pub(super) fn new(machine: Arc<Machine>, id: ProcessId, resumed: bool) -> Self {
        Self {
            machine,
            id,
            resumed: Cell::new(resumed),
        }
    }

    /// Returns the id of the process this handle runs as.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }
}

impl Kernel for EmulatedProcess {
    fn current_id(&self) -> ProcessId {
        self.id
    }

    fn create_child(&self) -> Result<ForkRole, KernelError> {
        if self.resumed.replace(false) {
            return Ok(ForkRole::Child);
        }
        self.machine.create_child(self.id).map(ForkRole::Parent)
    }

    fn allocate_page(
        &self,
        target: ProcessId,
        address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError> {
        self.machine
            .allocate_page(self.id, target, address, permissions)
    }

    fn map_page(
        &self,
        source: ProcessId,
        source_address: VirtualAddress,
        target: ProcessId,
        target_address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError> {
        self.machine.map_page(
            self.id,
            source,
            source_address,
            target,
            target_address,
            permissions,
        )
    }

    fn unmap_page(&self, target: ProcessId, address: VirtualAddress) -> Result<(), KernelError> {
        self.machine.unmap_page(self.id, target, address)
    }

    fn set_fault_entry_point(
        &self,
        target: ProcessId,
        entry_point: VirtualAddress,
    ) -> Result<(), KernelError> {
        self.machine
            .set_fault_entry_point(self.id, target, entry_point)
    }

    fn set_runnable(&self, target: ProcessId) -> Result<(), KernelError> {
        self.machine.set_runnable(self.id, target)
    }
}

impl AddressSpace for EmulatedProcess {
    fn permissions(&self, page: PageNumber) -> PermissionSet {
        self.machine.lookup(self.id, page)
    }

    fn table_present(&self, table: usize) -> bool {
        self.machine.table_present(self.id, table)
    }

    unsafe fn copy_page(&self, from: PageNumber, to: PageNumber) {
        self.machine.copy_page(self.id, from, to);
    }
}

impl Process<EmulatedProcess> {
    /// Stores `bytes` at `address` from user mode, taking page faults as they come.
    ///
    /// # Panics
    ///
    /// Panics if a fault cannot be delivered, or if the handler returns without making the
    /// access succeed.
    pub fn store(&self, address: VirtualAddress, bytes: &[u8]) {
        let mut last_fault = None;
        while let Err(fault) = self.kernel.machine.write(self.kernel.id, address, bytes) {
            self.deliver(fault, &mut last_fault);
        }
    }

    /// Loads `len` bytes at `address` from user mode, taking page faults as they come.
    ///
    /// # Panics
    ///
    /// Same as [`Process::store`].
    pub fn load(&self, address: VirtualAddress, len: usize) -> Vec<u8> {
        let mut last_fault = None;
        loop {
            match self.kernel.machine.read(self.kernel.id, address, len) {
                Ok(bytes) => return bytes,
                Err(fault) => self.deliver(fault, &mut last_fault),
            }
        }
    }

    /// Enters the fault handler the way the kernel's fault upcall would.
    fn deliver(&self, fault: FaultContext, last_fault: &mut Option<FaultContext>) {
        let id = self.kernel.id;
        if *last_fault == Some(fault) {
            panic!(
                "[{}] page fault at {} err {} not resolved by handler",
                id,
                fault.address(),
                fault.code()
            );
        }
        if !self.kernel.machine.can_deliver_fault(id) {
            panic!(
                "[{}] unhandled page fault at {} err {}",
                id,
                fault.address(),
                fault.code()
            );
        }

        log::trace!("[{}] page fault at {} err {}", id, fault.address(), fault.code());
        *last_fault = Some(fault);
        self.dispatch_fault(&fault);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::MachineConfig;
    use crate::{Error, layout};

    const ENTRY: VirtualAddress = VirtualAddress::new(0x0080_0020);
    const DATA: VirtualAddress = VirtualAddress::new(0x0080_3000);

    fn setup() -> (Arc<Machine>, Process<EmulatedProcess>) {
        let machine = Machine::new(MachineConfig::default());
        let process = Process::new(machine.boot(), ENTRY);
        (machine, process)
    }

    fn ignore(_: &Process<EmulatedProcess>, _: &FaultContext) -> Result<(), Error> {
        Ok(())
    }

    #[test]
    fn child_role_is_returned_once() {
        let (machine, _process) = setup();
        let child = machine.boot();
        let handle = EmulatedProcess::new(Arc::clone(&machine), child.id(), true);

        assert_eq!(handle.create_child(), Ok(ForkRole::Child));
        assert!(matches!(handle.create_child(), Ok(ForkRole::Parent(_))));
    }

    #[test]
    fn store_and_load_without_faults() {
        let (machine, process) = setup();
        machine.load(process.id(), DATA.page_number(), PermissionSet::USER_WRITABLE, &[]);

        process.store(DATA + 4, b"hello");

        assert_eq!(process.load(DATA + 4, 5), b"hello");
    }

    #[test]
    fn store_to_copy_on_write_page_takes_a_private_copy() {
        let (machine, mut process) = setup();
        process.set_fault_handler(Process::resolve_copy_on_write);
        machine.load(
            process.id(),
            DATA.page_number(),
            PermissionSet::USER_COPY_ON_WRITE,
            b"AAAA",
        );

        process.store(DATA + 1, b"B");

        assert_eq!(process.load(DATA, 4), b"ABAA");
        assert_eq!(
            machine.permissions(process.id(), DATA.page_number()),
            Some(PermissionSet::USER_WRITABLE)
        );
    }

    #[test]
    #[should_panic(expected = "unhandled page fault at 0x00803000")]
    fn fault_without_entry_point_is_fatal() {
        let (_machine, process) = setup();

        process.load(DATA, 1);
    }

    #[test]
    #[should_panic(expected = "not resolved by handler")]
    fn handler_that_does_nothing_is_caught() {
        let (_machine, mut process) = setup();
        process.set_fault_handler(ignore);

        process.store(DATA, b"x");
    }

    #[test]
    #[should_panic(expected = "pgfault: bad page fault at 0x00803000")]
    fn write_to_unmapped_page_terminates_under_copy_on_write_handler() {
        let (_machine, mut process) = setup();
        process.set_fault_handler(Process::resolve_copy_on_write);

        process.store(DATA, b"x");
    }

    #[test]
    fn exception_stack_is_needed_for_delivery() {
        let (machine, mut process) = setup();
        process.set_fault_handler(ignore);
        assert!(machine.can_deliver_fault(process.id()));

        process
            .kernel()
            .unmap_page(process.id(), layout::EXCEPTION_STACK.start())
            .unwrap();

        assert!(!machine.can_deliver_fault(process.id()));
    }
}
