//! The debug engine: a thin, synchronous command surface over a task's
//! `Vm` and the shared `MemoryMap`, plus an event channel the shell (or any
//! other frontend) drains for async notifications. Grounded on this
//! codebase's command/response channel pattern between a control surface
//! and the thing it inspects, adapted here to a single-process in-process
//! call rather than a cross-thread mpsc, since the scheduler already owns
//! the `Vm` on the same thread that dispatches it.

use crate::memory::{MemoryError, MemoryMap};
use crate::vm::{Vm, VmFault, VmState};
use std::sync::mpsc::{Receiver, Sender, channel};

#[derive(Debug, Clone)]
pub enum DebugCommand {
    Pause,
    Resume,
    Step,
    Reset { entry_pc: u32 },
    SetBreakpoint { pc: u32 },
    RemoveBreakpoint { pc: u32 },
    ClearBreakpoints,
    Peek { address: u32, len: usize },
    Poke { address: u32, bytes: Vec<u8> },
}

#[derive(Debug, Clone)]
pub enum DebugEvent {
    StateChanged(VmState),
    BreakpointHit { pc: u32 },
    StepComplete { pc: u32 },
    Error { fault: VmFault, pc: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub state: VmState,
    pub pc: u32,
    pub sp: usize,
    pub cycles: u64,
    pub top_of_stack: Option<i32>,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum DebugError {
    #[error("memory access rejected: {0}")]
    Memory(#[from] MemoryError),
    #[error("vm rejected the request: {0}")]
    Vm(#[from] VmFault),
    #[error("poke rejected: vm must be paused or idle, not {0:?}")]
    NotHalted(VmState),
}

/// Owns the event sender so callers (the orchestrator's cycle loop) can
/// push notifications; the shell or any other frontend holds the receiver.
pub struct DebugEngine {
    events: Sender<DebugEvent>,
}

impl DebugEngine {
    pub fn new() -> (Self, Receiver<DebugEvent>) {
        let (tx, rx) = channel();
        (Self { events: tx }, rx)
    }

    fn notify(&self, event: DebugEvent) {
        let _ = self.events.send(event);
    }

    pub fn apply(&self, command: DebugCommand, vm: &mut Vm, memory: &mut MemoryMap) -> Result<(), DebugError> {
        match command {
            DebugCommand::Pause => {
                vm.pause();
                self.notify(DebugEvent::StateChanged(vm.state()));
            }
            DebugCommand::Resume => {
                vm.resume();
                self.notify(DebugEvent::StateChanged(vm.state()));
            }
            DebugCommand::Step => {
                vm.step(memory);
                self.notify(DebugEvent::StepComplete { pc: vm.pc() });
                if let Some((fault, pc)) = vm.error() {
                    self.notify(DebugEvent::Error { fault, pc });
                }
            }
            DebugCommand::Reset { entry_pc } => {
                vm.reset(entry_pc);
                self.notify(DebugEvent::StateChanged(vm.state()));
            }
            DebugCommand::SetBreakpoint { pc } => {
                vm.set_breakpoint(pc)?;
            }
            DebugCommand::RemoveBreakpoint { pc } => {
                vm.remove_breakpoint(pc);
            }
            DebugCommand::ClearBreakpoints => {
                vm.clear_breakpoints();
            }
            DebugCommand::Peek { .. } | DebugCommand::Poke { .. } => {
                unreachable!("memory commands go through peek/poke, not apply")
            }
        }
        Ok(())
    }

    pub fn peek(&self, memory: &MemoryMap, address: u32, len: usize) -> Result<Vec<u8>, DebugError> {
        Ok(memory.peek(address, len)?)
    }

    /// Only allowed while the VM is paused or idle — poking memory under a
    /// running task would race the scan cycle's own reads and writes.
    pub fn poke(&self, vm: &Vm, memory: &mut MemoryMap, address: u32, bytes: &[u8]) -> Result<(), DebugError> {
        if !matches!(vm.state(), VmState::Paused | VmState::Idle { .. }) {
            return Err(DebugError::NotHalted(vm.state()));
        }
        memory.poke(address, bytes)?;
        Ok(())
    }

    pub fn status(&self, vm: &Vm) -> StatusSnapshot {
        StatusSnapshot { state: vm.state(), pc: vm.pc(), sp: vm.sp(), cycles: vm.cycles(), top_of_stack: vm.top_of_stack() }
    }

    pub fn report_breakpoint_hit(&self, pc: u32) {
        self.notify(DebugEvent::BreakpointHit { pc });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CODE_MIN_SIZE, MemoryMap};

    #[test]
    fn pause_resume_round_trips_through_events() {
        let (engine, rx) = DebugEngine::new();
        let mut vm = Vm::new(0);
        let mut memory = MemoryMap::new(CODE_MIN_SIZE as usize);
        memory.load_code(&[0x01]); // HALT
        vm.start();
        engine.apply(DebugCommand::Pause, &mut vm, &mut memory).unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        engine.apply(DebugCommand::Resume, &mut vm, &mut memory).unwrap();
        assert_eq!(vm.state(), VmState::Running);
        assert_eq!(rx.try_iter().count(), 2);
    }

    #[test]
    fn step_executes_exactly_one_instruction() {
        let (engine, _rx) = DebugEngine::new();
        let mut vm = Vm::new(0);
        let mut memory = MemoryMap::new(CODE_MIN_SIZE as usize);
        memory.load_code(&[0x10, 0x10, 0x01]); // DUP DUP HALT
        vm.start();
        engine.apply(DebugCommand::Step, &mut vm, &mut memory).unwrap();
        assert_eq!(vm.pc(), 1);
    }

    #[test]
    fn peek_and_poke_round_trip() {
        let (engine, _rx) = DebugEngine::new();
        let vm = Vm::new(0); // fresh Vm starts Idle, which poke permits
        let mut memory = MemoryMap::new(CODE_MIN_SIZE as usize);
        engine.poke(&vm, &mut memory, crate::memory::WORK_BASE, &[1, 2, 3, 4]).unwrap();
        assert_eq!(engine.peek(&memory, crate::memory::WORK_BASE, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn poke_rejected_while_vm_running() {
        let (engine, _rx) = DebugEngine::new();
        let mut vm = Vm::new(0);
        let mut memory = MemoryMap::new(CODE_MIN_SIZE as usize);
        memory.load_code(&[0x01]); // HALT
        vm.start();
        let err = engine.poke(&vm, &mut memory, crate::memory::WORK_BASE, &[1]).unwrap_err();
        assert!(matches!(err, DebugError::NotHalted(VmState::Running)));
    }
}
