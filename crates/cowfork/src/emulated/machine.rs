//! The emulated machine: frames, processes and the kernel calls that operate on them.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::cmp;
use core::fmt;

use spin::Mutex;

use super::{EmulatedProcess, MachineConfig, ProcessStatus, Syscall, SyscallKind};
use crate::{
    FaultContext, FaultErrorCode, FrameNumber, KernelError, PageNumber, PermissionSet, Process,
    ProcessId, VirtualAddress, layout,
};

/// Id handed to the first process booted on a machine.
const FIRST_PROCESS_ID: u32 = 0x1001;

struct Frame {
    data: Box<[u8]>,
    references: usize,
}

#[derive(Clone, Copy)]
struct Mapping {
    frame: FrameNumber,
    permissions: PermissionSet,
}

/// Which kernel call an injected failure applies to.
#[derive(Clone, Copy)]
enum Injection {
    Kind(SyscallKind),
    MapInto(VirtualAddress),
}

impl Injection {
    fn matches(self, call: &Syscall) -> bool {
        match self {
            Injection::Kind(kind) => call.kind() == kind,
            Injection::MapInto(address) => matches!(
                call,
                Syscall::MapPage { target_address, .. } if *target_address == address
            ),
        }
    }
}

struct ProcessEntry {
    parent: Option<ProcessId>,
    status: ProcessStatus,
    entry_point: Option<VirtualAddress>,
    pages: BTreeMap<PageNumber, Mapping>,
}

struct State {
    frames: BTreeMap<FrameNumber, Frame>,
    next_frame: usize,
    frames_allocated: usize,
    processes: BTreeMap<ProcessId, ProcessEntry>,
    next_process: u32,
    syscalls: Vec<(ProcessId, Syscall)>,
    page_lookups: usize,
    injected_failures: Vec<(Injection, KernelError)>,
}

impl State {
    fn process(&self, id: ProcessId) -> Result<&ProcessEntry, KernelError> {
        self.processes.get(&id).ok_or(KernelError::BadProcess)
    }

    fn process_mut(&mut self, id: ProcessId) -> Result<&mut ProcessEntry, KernelError> {
        self.processes.get_mut(&id).ok_or(KernelError::BadProcess)
    }

    fn mapping(&self, id: ProcessId, page: PageNumber) -> Option<Mapping> {
        self.processes.get(&id)?.pages.get(&page).copied()
    }

    /// A caller may act on itself and on its direct children only.
    fn check_target(&self, caller: ProcessId, target: ProcessId) -> Result<(), KernelError> {
        let entry = self.process(target)?;
        if target == caller || entry.parent == Some(caller) {
            Ok(())
        } else {
            Err(KernelError::BadProcess)
        }
    }

    fn create_process(
        &mut self,
        parent: Option<ProcessId>,
        status: ProcessStatus,
        limit: usize,
    ) -> Result<ProcessId, KernelError> {
        if self.processes.len() >= limit {
            return Err(KernelError::NoFreeProcess);
        }

        let id = ProcessId::new(self.next_process).ok_or(KernelError::NoFreeProcess)?;
        self.next_process += 1;
        self.processes.insert(
            id,
            ProcessEntry {
                parent,
                status,
                entry_point: None,
                pages: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    /// Allocates a zeroed frame with no references.
    fn allocate_frame(&mut self, limit: usize) -> Result<FrameNumber, KernelError> {
        if self.frames.len() >= limit {
            return Err(KernelError::NoMemory);
        }

        let frame = FrameNumber::new(self.next_frame);
        self.next_frame += 1;
        self.frames_allocated += 1;
        self.frames.insert(
            frame,
            Frame {
                data: vec![0; layout::PAGE_SIZE].into_boxed_slice(),
                references: 0,
            },
        );
        Ok(frame)
    }

    /// Installs `mapping` at `page` in `id`, replacing whatever was there.
    fn install(
        &mut self,
        id: ProcessId,
        page: PageNumber,
        mapping: Mapping,
    ) -> Result<(), KernelError> {
        self.process(id)?;
        if let Some(frame) = self.frames.get_mut(&mapping.frame) {
            frame.references += 1;
        }

        let previous = self.process_mut(id)?.pages.insert(page, mapping);
        if let Some(previous) = previous {
            self.release(previous.frame);
        }
        Ok(())
    }

    fn remove(&mut self, id: ProcessId, page: PageNumber) -> Result<(), KernelError> {
        if let Some(previous) = self.process_mut(id)?.pages.remove(&page) {
            self.release(previous.frame);
        }
        Ok(())
    }

    fn release(&mut self, frame: FrameNumber) {
        let Some(entry) = self.frames.get_mut(&frame) else {
            return;
        };

        entry.references -= 1;
        if entry.references == 0 {
            self.frames.remove(&frame);
        }
    }
}

fn check_address(address: VirtualAddress) -> Result<(), KernelError> {
    if address >= layout::USER_TOP || !address.is_aligned(layout::PAGE_SIZE) {
        return Err(KernelError::Invalid);
    }
    Ok(())
}

fn check_permissions(permissions: PermissionSet) -> Result<(), KernelError> {
    if !permissions.is_valid_for_syscall() {
        return Err(KernelError::Invalid);
    }
    Ok(())
}

/// A software kernel holding a fixed pool of frames and a bounded process table.
///
/// Process ids are handed out in increasing order starting at `0x1001`. Frames are numbered in
/// allocation order and freed when their last mapping goes away.
pub struct Machine {
    config: MachineConfig,
    state: Mutex<State>,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(State {
                frames: BTreeMap::new(),
                next_frame: 1,
                frames_allocated: 0,
                processes: BTreeMap::new(),
                next_process: FIRST_PROCESS_ID,
                syscalls: Vec::new(),
                page_lookups: 0,
                injected_failures: Vec::new(),
            }),
        })
    }

    /// Creates a runnable process with no parent and an empty address space.
    ///
    /// # Panics
    ///
    /// Panics if the process table is full.
    pub fn boot(self: &Arc<Self>) -> EmulatedProcess {
        let created = self.state.lock().create_process(
            None,
            ProcessStatus::Runnable,
            self.config.processes,
        );
        match created {
            Ok(id) => {
                log::debug!("[{}] booted", id);
                EmulatedProcess::new(Arc::clone(self), id, false)
            }
            Err(error) => panic!("cannot boot a process: {}", error),
        }
    }

    /// Backs `page` in `id` with a fresh frame holding `contents`, with any permissions at all.
    ///
    /// This is the loader's view of memory; none of the user-mode rules apply.
    ///
    /// # Panics
    ///
    /// Panics if `contents` does not fit in a page, if no frame is free, or if `id` does not
    /// exist.
    pub fn load(&self, id: ProcessId, page: PageNumber, permissions: PermissionSet, contents: &[u8]) {
        assert!(
            contents.len() <= layout::PAGE_SIZE,
            "{} bytes do not fit in a page",
            contents.len()
        );

        let mut state = self.state.lock();
        let loaded = state.allocate_frame(self.config.frames).and_then(|frame| {
            if let Some(entry) = state.frames.get_mut(&frame) {
                entry.data[..contents.len()].copy_from_slice(contents);
            }
            state.install(id, page, Mapping { frame, permissions })
        });
        if let Err(error) = loaded {
            panic!("[{}] cannot load page {}: {}", id, page.start(), error);
        }
    }

    /// Maps the frame behind `page` in `source` at the same page in `target`, bypassing every
    /// kernel check.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not mapped in `source` or if `target` does not exist.
    pub fn share(
        &self,
        source: ProcessId,
        page: PageNumber,
        target: ProcessId,
        permissions: PermissionSet,
    ) {
        let mut state = self.state.lock();
        let Some(mapping) = state.mapping(source, page) else {
            panic!("[{}] page {} is not mapped", source, page.start());
        };
        let shared = Mapping {
            frame: mapping.frame,
            permissions,
        };
        if let Err(error) = state.install(target, page, shared) {
            panic!("[{}] cannot share page {}: {}", target, page.start(), error);
        }
    }

    /// Removes a process and drops all of its mappings.
    pub fn destroy(&self, id: ProcessId) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let entry = state.processes.remove(&id).ok_or(KernelError::BadProcess)?;
        for mapping in entry.pages.values() {
            state.release(mapping.frame);
        }
        log::debug!("[{}] destroyed, {} frames in use", id, state.frames.len());
        Ok(())
    }

    /// Returns the frame mapped at `page` in `id`.
    pub fn frame(&self, id: ProcessId, page: PageNumber) -> Option<FrameNumber> {
        self.state.lock().mapping(id, page).map(|mapping| mapping.frame)
    }

    /// Returns the permissions of `page` in `id`, or `None` if it is unmapped.
    pub fn permissions(&self, id: ProcessId, page: PageNumber) -> Option<PermissionSet> {
        self.state
            .lock()
            .mapping(id, page)
            .map(|mapping| mapping.permissions)
    }

    /// Returns the number of mappings referring to `frame`. Zero once it is freed.
    pub fn references(&self, frame: FrameNumber) -> usize {
        self.state
            .lock()
            .frames
            .get(&frame)
            .map_or(0, |frame| frame.references)
    }

    /// Returns how many frames have been allocated over the machine's lifetime.
    pub fn frames_allocated(&self) -> usize {
        self.state.lock().frames_allocated
    }

    /// Returns how many frames are currently in use.
    pub fn frames_in_use(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Returns the scheduling state of `id`.
    pub fn status(&self, id: ProcessId) -> Option<ProcessStatus> {
        self.state.lock().processes.get(&id).map(|entry| entry.status)
    }

    /// Returns the fault entry point registered for `id`.
    pub fn entry_point(&self, id: ProcessId) -> Option<VirtualAddress> {
        self.state
            .lock()
            .processes
            .get(&id)
            .and_then(|entry| entry.entry_point)
    }

    /// Returns the direct children of `id`, oldest first.
    pub fn children(&self, id: ProcessId) -> Vec<ProcessId> {
        self.state
            .lock()
            .processes
            .iter()
            .filter(|(_, entry)| entry.parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Returns every kernel call made since the last [`Machine::clear_syscalls`].
    pub fn syscalls(&self) -> Vec<(ProcessId, Syscall)> {
        self.state.lock().syscalls.clone()
    }

    pub fn clear_syscalls(&self) {
        self.state.lock().syscalls.clear();
    }

    /// Returns how many times a process has looked up the permissions of one of its pages.
    pub fn page_lookups(&self) -> usize {
        self.state.lock().page_lookups
    }

    /// Makes the next kernel call of `kind` fail with `error`, before it has any effect.
    pub fn fail_next(&self, kind: SyscallKind, error: KernelError) {
        self.state
            .lock()
            .injected_failures
            .push((Injection::Kind(kind), error));
    }

    /// Makes the next map call targeting `address` fail with `error`.
    pub fn fail_next_map(&self, address: VirtualAddress, error: KernelError) {
        self.state
            .lock()
            .injected_failures
            .push((Injection::MapInto(address), error));
    }

    /// Reads `len` bytes at `address` the way user-mode code in `id` would.
    ///
    /// Returns the fault the access raises instead if any byte is not readable.
    pub fn read(
        &self,
        id: ProcessId,
        address: VirtualAddress,
        len: usize,
    ) -> Result<Vec<u8>, FaultContext> {
        let state = self.state.lock();
        let end = address + len;
        let mut bytes = Vec::with_capacity(len);
        let mut cursor = address;

        while cursor < end {
            let mapping = state.mapping(id, cursor.page_number());
            let Some(mapping) = mapping.filter(|m| m.permissions.is_user_mapped()) else {
                let present = mapping.is_some_and(|m| m.permissions.is_present());
                return Err(FaultContext::new(
                    cursor,
                    FaultErrorCode::user_access(false, present),
                ));
            };

            let offset = cursor.page_offset();
            let chunk = cmp::min(layout::PAGE_SIZE - offset, end - cursor);
            if let Some(frame) = state.frames.get(&mapping.frame) {
                bytes.extend_from_slice(&frame.data[offset..offset + chunk]);
            }
            cursor = cursor + chunk;
        }

        Ok(bytes)
    }

    /// Writes `bytes` at `address` the way user-mode code in `id` would.
    ///
    /// Nothing is written if any byte is not writable; the fault the access raises is
    /// returned instead.
    pub fn write(
        &self,
        id: ProcessId,
        address: VirtualAddress,
        bytes: &[u8],
    ) -> Result<(), FaultContext> {
        let mut state = self.state.lock();
        let end = address + bytes.len();

        let mut targets = Vec::new();
        let mut cursor = address;
        while cursor < end {
            let mapping = state.mapping(id, cursor.page_number());
            let Some(mapping) = mapping.filter(|m| m.permissions.allows_user_write()) else {
                let present = mapping.is_some_and(|m| m.permissions.is_present());
                return Err(FaultContext::new(
                    cursor,
                    FaultErrorCode::user_access(true, present),
                ));
            };

            let offset = cursor.page_offset();
            let chunk = cmp::min(layout::PAGE_SIZE - offset, end - cursor);
            targets.push((mapping.frame, offset, chunk));
            cursor = cursor + chunk;
        }

        let mut written = 0;
        for (frame, offset, chunk) in targets {
            if let Some(frame) = state.frames.get_mut(&frame) {
                frame.data[offset..offset + chunk].copy_from_slice(&bytes[written..written + chunk]);
            }
            written += chunk;
        }
        Ok(())
    }

    /// Returns whether the kernel can deliver a page fault to `id`: it needs an entry point and
    /// a writable exception stack.
    pub fn can_deliver_fault(&self, id: ProcessId) -> bool {
        let state = self.state.lock();
        let has_entry = state
            .processes
            .get(&id)
            .is_some_and(|entry| entry.entry_point.is_some());
        let has_stack = state
            .mapping(id, layout::EXCEPTION_STACK)
            .is_some_and(|m| m.permissions.allows_user_write());
        has_entry && has_stack
    }

    /// Returns the continuation of `child` after fork: a copy of `parent`'s process state,
    /// now running as `child`.
    ///
    /// The child has to be runnable, and its first call to fork returns [`ForkRole::Child`].
    ///
    /// [`ForkRole::Child`]: crate::ForkRole::Child
    pub fn resume_child(
        self: &Arc<Self>,
        parent: &Process<EmulatedProcess>,
        child: ProcessId,
    ) -> Result<Process<EmulatedProcess>, KernelError> {
        {
            let state = self.state.lock();
            let entry = state.process(child)?;
            if entry.parent != Some(parent.kernel().id())
                || entry.status != ProcessStatus::Runnable
            {
                return Err(KernelError::BadProcess);
            }
        }

        log::debug!("[{}] scheduled", child);
        Ok(Process {
            kernel: EmulatedProcess::new(Arc::clone(self), child, true),
            id: parent.id,
            entry_point: parent.entry_point,
            handler: parent.handler,
        })
    }

    fn syscall<T, F>(&self, caller: ProcessId, call: Syscall, body: F) -> Result<T, KernelError>
    where
        T: fmt::Debug,
        F: FnOnce(&mut State) -> Result<T, KernelError>,
    {
        let mut state = self.state.lock();
        state.syscalls.push((caller, call));
        let injected = state
            .injected_failures
            .iter()
            .position(|(injection, _)| injection.matches(&call));
        let result = match injected {
            Some(index) => Err(state.injected_failures.remove(index).1),
            None => body(&mut state),
        };
        log::trace!("[{}] {:?} -> {:?}", caller, call, result);
        result
    }

    pub(super) fn create_child(&self, caller: ProcessId) -> Result<ProcessId, KernelError> {
        let limit = self.config.processes;
        self.syscall(caller, Syscall::CreateChild, |state| {
            state.process(caller)?;
            state.create_process(Some(caller), ProcessStatus::NotRunnable, limit)
        })
    }

    pub(super) fn allocate_page(
        &self,
        caller: ProcessId,
        target: ProcessId,
        address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError> {
        let limit = self.config.frames;
        let call = Syscall::AllocatePage {
            target,
            address,
            permissions,
        };
        self.syscall(caller, call, |state| {
            state.check_target(caller, target)?;
            check_address(address)?;
            check_permissions(permissions)?;

            let frame = state.allocate_frame(limit)?;
            state.install(target, address.page_number(), Mapping { frame, permissions })
        })
    }

    pub(super) fn map_page(
        &self,
        caller: ProcessId,
        source: ProcessId,
        source_address: VirtualAddress,
        target: ProcessId,
        target_address: VirtualAddress,
        permissions: PermissionSet,
    ) -> Result<(), KernelError> {
        let call = Syscall::MapPage {
            source,
            source_address,
            target,
            target_address,
            permissions,
        };
        self.syscall(caller, call, |state| {
            state.check_target(caller, source)?;
            state.check_target(caller, target)?;
            check_address(source_address)?;
            check_address(target_address)?;
            check_permissions(permissions)?;

            let mapping = state
                .mapping(source, source_address.page_number())
                .ok_or(KernelError::Invalid)?;
            if permissions.is_writable() && !mapping.permissions.is_writable() {
                return Err(KernelError::Invalid);
            }

            let shared = Mapping {
                frame: mapping.frame,
                permissions,
            };
            state.install(target, target_address.page_number(), shared)
        })
    }

    pub(super) fn unmap_page(
        &self,
        caller: ProcessId,
        target: ProcessId,
        address: VirtualAddress,
    ) -> Result<(), KernelError> {
        self.syscall(caller, Syscall::UnmapPage { target, address }, |state| {
            state.check_target(caller, target)?;
            check_address(address)?;
            state.remove(target, address.page_number())
        })
    }

    pub(super) fn set_fault_entry_point(
        &self,
        caller: ProcessId,
        target: ProcessId,
        entry_point: VirtualAddress,
    ) -> Result<(), KernelError> {
        let call = Syscall::SetFaultEntryPoint {
            target,
            entry_point,
        };
        self.syscall(caller, call, |state| {
            state.check_target(caller, target)?;
            state.process_mut(target)?.entry_point = Some(entry_point);
            Ok(())
        })
    }

    pub(super) fn set_runnable(
        &self,
        caller: ProcessId,
        target: ProcessId,
    ) -> Result<(), KernelError> {
        self.syscall(caller, Syscall::SetRunnable { target }, |state| {
            state.check_target(caller, target)?;
            state.process_mut(target)?.status = ProcessStatus::Runnable;
            Ok(())
        })
    }

    pub(super) fn lookup(&self, caller: ProcessId, page: PageNumber) -> PermissionSet {
        let mut state = self.state.lock();
        state.page_lookups += 1;
        state
            .mapping(caller, page)
            .map_or(PermissionSet::empty(), |mapping| mapping.permissions)
    }

    pub(super) fn table_present(&self, caller: ProcessId, table: usize) -> bool {
        let first = PageNumber::first_in_table(table);
        let last = PageNumber::first_in_table(table + 1);
        self.state
            .lock()
            .processes
            .get(&caller)
            .is_some_and(|entry| entry.pages.range(first..last).next().is_some())
    }

    /// # Panics
    ///
    /// Panics if either page is unmapped in `caller`.
    pub(super) fn copy_page(&self, caller: ProcessId, from: PageNumber, to: PageNumber) {
        let mut state = self.state.lock();
        let (Some(source), Some(target)) = (state.mapping(caller, from), state.mapping(caller, to))
        else {
            panic!(
                "[{}] copy from {} to {} touches an unmapped page",
                caller,
                from.start(),
                to.start()
            );
        };

        let data = state.frames.get(&source.frame).map(|frame| frame.data.clone());
        if let (Some(data), Some(frame)) = (data, state.frames.get_mut(&target.frame)) {
            frame.data.copy_from_slice(&data);
        }
    }
}
