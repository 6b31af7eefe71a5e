//! Fork scenarios run against the emulated machine.

use std::fmt;
use std::sync::Arc;

use cowfork::emulated::{EmulatedProcess, Machine, MachineConfig};
use cowfork::{
    ForkRole, KernelError, PageNumber, PermissionSet, Process, ProcessId, VirtualAddress, layout,
};

/// Where the simulated program expects its fault trampoline.
const TRAMPOLINE: VirtualAddress = VirtualAddress::new(0x0080_0020);

/// Address of the data page every scenario writes to.
const DATA: VirtualAddress = VirtualAddress::new(0x0080_3000);

/// A scenario observed something fork should have prevented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioError {
    /// A process read back something other than what it should see.
    Mismatch {
        process: ProcessId,
        expected: Vec<u8>,
        found: Vec<u8>,
    },
    /// Fork reported the wrong role to one side.
    WrongRole(ProcessId),
    /// The machine refused to schedule a child.
    Kernel(KernelError),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Mismatch {
                process,
                expected,
                found,
            } => write!(
                f,
                "[{}] expected {:?}, read {:?}",
                process,
                String::from_utf8_lossy(expected),
                String::from_utf8_lossy(found)
            ),
            ScenarioError::WrongRole(process) => {
                write!(f, "[{}] fork returned the wrong role", process)
            }
            ScenarioError::Kernel(error) => write!(f, "kernel refused: {}", error),
        }
    }
}

impl std::error::Error for ScenarioError {}

impl From<KernelError> for ScenarioError {
    fn from(error: KernelError) -> Self {
        ScenarioError::Kernel(error)
    }
}

/// Boots a process with a read-only text page and one writable data page holding `contents`.
fn boot(config: MachineConfig, contents: &[u8]) -> (Arc<Machine>, Process<EmulatedProcess>) {
    let machine = Machine::new(config);
    let process = Process::new(machine.boot(), TRAMPOLINE);
    let id = process.id();
    machine.load(id, layout::PROGRAM_START.page_number(), PermissionSet::USER_READ_ONLY, b"text");
    machine.load(id, DATA.page_number(), PermissionSet::USER_WRITABLE, contents);
    (machine, process)
}

/// Forks `process` and returns the child's continuation, already past its fork call.
fn fork_and_resume(
    machine: &Arc<Machine>,
    process: &mut Process<EmulatedProcess>,
) -> Result<Process<EmulatedProcess>, ScenarioError> {
    let ForkRole::Parent(child) = process.fork() else {
        return Err(ScenarioError::WrongRole(process.id()));
    };

    let mut continuation = machine.resume_child(process, child)?;
    if continuation.fork() != ForkRole::Child {
        return Err(ScenarioError::WrongRole(child));
    }
    Ok(continuation)
}

fn check_data(process: &Process<EmulatedProcess>, expected: &[u8]) -> Result<(), ScenarioError> {
    let found = process.load(DATA, expected.len());
    if found != expected {
        return Err(ScenarioError::Mismatch {
            process: process.id(),
            expected: expected.to_vec(),
            found,
        });
    }
    println!("[{}] reads {:?}", process.id(), String::from_utf8_lossy(&found));
    Ok(())
}

/// Parent holds "AAAA", the child writes "BBBB"; each must keep seeing its own value.
pub fn isolation(config: MachineConfig) -> Result<(), ScenarioError> {
    let (machine, mut parent) = boot(config, b"AAAA");
    let child = fork_and_resume(&machine, &mut parent)?;

    child.store(DATA, b"BBBB");

    check_data(&parent, b"AAAA")?;
    check_data(&child, b"BBBB")?;
    Ok(())
}

/// Every generation forks the next one and then writes its own tag.
pub fn chain(config: MachineConfig, generations: usize) -> Result<(), ScenarioError> {
    let (machine, root) = boot(config, b"gen-000");
    let mut processes = vec![root];

    for _ in 0..generations {
        let Some(latest) = processes.last_mut() else {
            break;
        };
        let child = fork_and_resume(&machine, latest)?;
        processes.push(child);
    }

    for (generation, process) in processes.iter().enumerate().skip(1) {
        process.store(DATA, format!("gen-{:03}", generation).as_bytes());
    }

    for (generation, process) in processes.iter().enumerate() {
        check_data(process, format!("gen-{:03}", generation).as_bytes())?;
    }
    Ok(())
}

/// Counts frames as a parent with `pages` writable pages forks and the child dirties half.
pub fn census(config: MachineConfig, pages: usize) -> Result<(), ScenarioError> {
    let (machine, mut parent) = boot(config, b"page");
    let first = DATA.page_number();
    for index in 1..pages {
        machine.load(parent.id(), first + index, PermissionSet::USER_WRITABLE, b"page");
    }
    let report = |stage: &str| {
        println!("{:<24} {:>6} frames in use", stage, machine.frames_in_use());
    };
    report("before fork");

    let child = fork_and_resume(&machine, &mut parent)?;
    report("after fork");

    for index in (0..pages).step_by(2) {
        let page: PageNumber = first + index;
        child.store(page.start(), b"PAGE");
    }
    report("after child writes");

    machine.destroy(child.id())?;
    report("after child exits");

    check_data(&parent, b"page")?;
    Ok(())
}
