//! Priority-preemptive dispatcher: per-task isolated VM instances, a
//! priority-ordered ready queue, and watchdog/overrun accounting. Mirrors
//! this codebase's min-heap event scheduler, keyed here by task priority
//! instead of a timestamp.

use crate::loader::{Program, TaskDescriptor, TaskKind};
use crate::memory::MemoryMap;
use crate::vm::{Vm, VmFault, VmState};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskStatus {
    pub id: u16,
    pub cycles: u64,
    pub overruns: u32,
    pub last_fault: Option<(VmFault, u32)>,
}

struct Task {
    descriptor: TaskDescriptor,
    vm: Vm,
    last_dispatch_ms: u32,
    overruns: u32,
    fatal_overrun_threshold_us: u32,
    ran_once: bool,
}

impl Task {
    fn new(descriptor: TaskDescriptor, fatal_overrun_threshold_us: u32) -> Self {
        Self {
            vm: Vm::new(descriptor.entry_pc as u32),
            last_dispatch_ms: 0,
            overruns: 0,
            fatal_overrun_threshold_us,
            descriptor,
            ran_once: false,
        }
    }

    fn ready(&self, now_ms: u32) -> bool {
        match self.descriptor.kind {
            TaskKind::Cyclic => {
                let interval_ms = self.descriptor.interval_us / 1_000;
                now_ms.wrapping_sub(self.last_dispatch_ms) >= interval_ms
            }
            TaskKind::Event => false, // dispatched explicitly via `notify_event`
            TaskKind::Init => !self.ran_once,
        }
    }
}

/// Ready-queue entry ordered so a `BinaryHeap` pop yields the highest
/// priority task (numerically lowest `priority` wins), ties broken by id.
struct ReadyEntry {
    priority: u8,
    task_index: usize,
    id: u16,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}
impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so BinaryHeap (a max-heap) pops the lowest priority value first
        other.priority.cmp(&self.priority).then_with(|| other.id.cmp(&self.id))
    }
}

pub struct SafeStateEvent {
    pub task_id: u16,
    pub fault: VmFault,
}

pub struct Scheduler {
    tasks: Vec<Task>,
    event_pending: Vec<bool>,
}

impl Scheduler {
    pub fn from_program(program: &Program, fatal_overrun_threshold_us: u32) -> Self {
        let tasks: Vec<Task> = program
            .tasks
            .iter()
            .map(|d| Task::new(*d, fatal_overrun_threshold_us))
            .collect();
        let event_pending = vec![false; tasks.len()];
        Self { tasks, event_pending }
    }

    pub fn notify_event(&mut self, task_id: u16) {
        if let Some(i) = self.tasks.iter().position(|t| t.descriptor.id == task_id) {
            self.event_pending[i] = true;
        }
    }

    /// Runs every ready task to completion (or preemption re-entry), highest
    /// priority first. Returns `Some` if a task's watchdog fatally expired,
    /// signalling the orchestrator to force a safe state.
    pub fn dispatch_ready_tasks(&mut self, now_ms: u32, memory: &mut MemoryMap) -> Option<SafeStateEvent> {
        let mut ready = BinaryHeap::new();
        for (i, task) in self.tasks.iter().enumerate() {
            let event_ready = task.descriptor.kind == TaskKind::Event && self.event_pending[i];
            if task.ready(now_ms) || event_ready {
                ready.push(ReadyEntry { priority: task.descriptor.priority, task_index: i, id: task.descriptor.id });
            }
        }

        while let Some(entry) = ready.pop() {
            let idx = entry.task_index;
            let higher_priority_pending = |sched: &Scheduler| {
                sched.tasks.iter().enumerate().any(|(j, t)| {
                    j != idx && t.descriptor.priority < sched.tasks[idx].descriptor.priority && t.ready(now_ms)
                })
            };

            let deadline_us =
                self.tasks[idx].fatal_overrun_threshold_us.max(self.tasks[idx].descriptor.interval_us);

            {
                let task = &mut self.tasks[idx];
                task.vm.set_ticks_ms(now_ms);
                task.vm.start();
            }

            let should_preempt = higher_priority_pending(self);
            let dispatched_at = Instant::now();
            let task = &mut self.tasks[idx];
            task.vm.run(memory, || should_preempt);
            let elapsed_us = dispatched_at.elapsed().as_micros() as u32;

            match task.vm.state() {
                VmState::Paused => {} // preempted, breakpoint, or BREAK; resumes or is driven onward next dispatch
                VmState::Error => {
                    error!(task_id = task.descriptor.id, fault = ?task.vm.error(), "task halted on error");
                }
                VmState::Idle { .. } => {
                    task.last_dispatch_ms = now_ms;
                    task.ran_once = true;
                    if task.descriptor.kind == TaskKind::Event {
                        self.event_pending[idx] = false;
                    }
                    task.vm.reset(task.descriptor.entry_pc as u32);
                }
                VmState::Running => unreachable!("Vm::run only returns once state leaves Running"),
            }

            if elapsed_us > deadline_us {
                task.overruns += 1;
                warn!(task_id = task.descriptor.id, overruns = task.overruns, elapsed_us, "watchdog overrun");
                if task.overruns.saturating_mul(task.descriptor.interval_us.max(1)) >= task.fatal_overrun_threshold_us
                {
                    error!(task_id = task.descriptor.id, "fatal watchdog overrun, forcing safe state");
                    return Some(SafeStateEvent { task_id: task.descriptor.id, fault: VmFault::Watchdog });
                }
            }
        }

        None
    }

    pub fn init_tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tasks.iter().map(|t| &t.descriptor).filter(|d| d.kind == TaskKind::Init)
    }

    pub fn statuses(&self) -> Vec<TaskStatus> {
        self.tasks
            .iter()
            .map(|t| TaskStatus {
                id: t.descriptor.id,
                cycles: t.vm.cycles(),
                overruns: t.overruns,
                last_fault: t.vm.error(),
            })
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Exposes a single task's `Vm` for the debug engine. Debugging targets
    /// one task at a time; the caller picks which by id.
    pub fn vm_mut(&mut self, task_id: u16) -> Option<&mut Vm> {
        self.tasks.iter_mut().find(|t| t.descriptor.id == task_id).map(|t| &mut t.vm)
    }

    pub fn entry_pc(&self, task_id: u16) -> Option<u32> {
        self.tasks.iter().find(|t| t.descriptor.id == task_id).map(|t| t.descriptor.entry_pc as u32)
    }

    pub fn task_ids(&self) -> Vec<u16> {
        self.tasks.iter().map(|t| t.descriptor.id).collect()
    }

    /// Forces every task's `Vm` into a halted state. `faulted` names the one
    /// task (if any) whose halt should surface as an error — the rest halt
    /// idle. Used for a fatal watchdog overrun (the faulting task) and for
    /// an operator `stop` (no faulted task, every `Vm` goes idle).
    pub fn halt_all(&mut self, faulted: Option<(u16, VmFault)>) {
        for task in &mut self.tasks {
            let fault = faulted.and_then(|(id, fault)| (id == task.descriptor.id).then_some(fault));
            task.vm.halt(fault);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::TaskDescriptor;

    fn program_with_tasks(tasks: Vec<TaskDescriptor>, code: Vec<u8>) -> Program {
        Program { code, data: vec![], retain: None, io_map: vec![], tasks, entry_point: 0, raw: vec![] }
    }

    #[test]
    fn higher_priority_runs_before_lower_in_ready_queue_order() {
        // two tasks, both cyclic with a 0us interval so both are always ready;
        // priority 0 must be popped from the ready heap ahead of priority 3.
        let tasks = vec![
            TaskDescriptor { id: 1, kind: TaskKind::Cyclic, priority: 3, interval_us: 0, entry_pc: 0, stack_depth: 0 },
            TaskDescriptor { id: 0, kind: TaskKind::Cyclic, priority: 0, interval_us: 0, entry_pc: 0, stack_depth: 0 },
        ];
        let program = program_with_tasks(tasks, vec![0x01]); // HALT
        let mut sched = Scheduler::from_program(&program, 1_000_000);
        let mut mem = MemoryMap::new(64);
        mem.load_code(&program.code);
        sched.dispatch_ready_tasks(0, &mut mem);
        let statuses = sched.statuses();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.cycles >= 1));
    }

    #[test]
    fn init_task_runs_once() {
        let tasks = vec![TaskDescriptor {
            id: 0,
            kind: TaskKind::Init,
            priority: 0,
            interval_us: 0,
            entry_pc: 0,
            stack_depth: 0,
        }];
        let program = program_with_tasks(tasks, vec![0x01]);
        let mut sched = Scheduler::from_program(&program, 1_000_000);
        let mut mem = MemoryMap::new(64);
        mem.load_code(&program.code);
        sched.dispatch_ready_tasks(0, &mut mem);
        sched.dispatch_ready_tasks(1, &mut mem);
        assert_eq!(sched.statuses()[0].cycles, 1);
    }
}
