//! The scan-cycle outer loop: input latch, task execution, output flush,
//! housekeeping, pacing — in that fixed order, every cycle.

use crate::debugger::{DebugCommand, DebugEngine};
use crate::hal::Hal;
use crate::loader::{IoDirection, IoMapEntry, Program};
use crate::memory::MemoryMap;
use crate::persistence::Persistence;
use crate::scheduler::Scheduler;
use crate::vm::VmFault;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Running,
    SafeState,
    Stopped,
}

pub struct CycleStats {
    pub cycle_count: u64,
    pub overrun_count: u64,
    pub last_cycle_us: u32,
}

/// Bit 0 of an I/O map entry's flags field marks it as an edge source for an
/// EVENT task: a change in the latched value fires `Scheduler::notify_event`
/// for the task whose id equals the entry's `channel` field.
const IO_FLAG_EVENT_SOURCE: u16 = 0x0001;

pub struct Orchestrator<H: Hal> {
    hal: H,
    memory: MemoryMap,
    scheduler: Scheduler,
    io_map: Vec<IoMapEntry>,
    persistence: Persistence,
    state: RuntimeState,
    cycle_count: u64,
    overrun_count: u64,
    last_cycle_us: u32,
    cyclic_interval_us: u32,
    edge_cache: std::collections::HashMap<u16, u16>,
    program_size: usize,
    started_ms: Option<u32>,
}

impl<H: Hal> Orchestrator<H> {
    pub fn new(mut hal: H, program: &Program, fatal_overrun_threshold_us: u32) -> Self {
        hal.init().unwrap_or_else(|e| error!(error = %e, "HAL init failed"));

        let mut memory = MemoryMap::new(program.code.len().max(crate::memory::CODE_MIN_SIZE as usize));
        memory.load_code(&program.code);

        let mut persistence = Persistence::new();
        if let Some(restored) = persistence.restore_retain(&mut hal) {
            memory.load_retain(&restored);
        }
        memory.clear_retain_dirty();
        persistence.save_program(&mut hal, &program.raw);

        let scheduler = Scheduler::from_program(program, fatal_overrun_threshold_us);
        let cyclic_interval_us =
            program.tasks.iter().map(|t| t.interval_us).min().unwrap_or(crate::loader::DEFAULT_CYCLIC_INTERVAL_US);

        Self {
            hal,
            memory,
            scheduler,
            io_map: program.io_map.clone(),
            persistence,
            state: RuntimeState::Stopped,
            cycle_count: 0,
            overrun_count: 0,
            last_cycle_us: 0,
            cyclic_interval_us,
            edge_cache: std::collections::HashMap::new(),
            program_size: program.raw.len(),
            started_ms: None,
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    pub fn stats(&self) -> CycleStats {
        CycleStats { cycle_count: self.cycle_count, overrun_count: self.overrun_count, last_cycle_us: self.last_cycle_us }
    }

    pub fn program_size(&self) -> usize {
        self.program_size
    }

    /// Milliseconds since the last `start()` call, or 0 if never started.
    pub fn uptime_ms(&self) -> u32 {
        match self.started_ms {
            Some(start) => self.hal.tick_ms().wrapping_sub(start),
            None => 0,
        }
    }

    pub fn memory(&self) -> &MemoryMap {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryMap {
        &mut self.memory
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Applies a debug command to one task's `Vm`, holding the scheduler and
    /// memory borrows together so the debug engine never needs both a
    /// `&mut Scheduler` and a `&mut MemoryMap` fetched through separate calls.
    pub fn debug_apply(&mut self, task_id: u16, command: DebugCommand, engine: &DebugEngine) -> Result<(), String> {
        let vm = self.scheduler.vm_mut(task_id).ok_or_else(|| "no such task".to_string())?;
        engine.apply(command, vm, &mut self.memory).map_err(|e| e.to_string())
    }

    pub fn debug_status(&mut self, task_id: u16, engine: &DebugEngine) -> Option<crate::debugger::StatusSnapshot> {
        self.scheduler.vm_mut(task_id).map(|vm| engine.status(vm))
    }

    /// Same disjoint-borrow pattern as `debug_apply`: the engine needs the
    /// task's `Vm` (to check it's halted) and the memory map together.
    pub fn debug_poke(&mut self, task_id: u16, engine: &DebugEngine, address: u32, bytes: &[u8]) -> Result<(), String> {
        let vm = self.scheduler.vm_mut(task_id).ok_or_else(|| "no such task".to_string())?;
        engine.poke(vm, &mut self.memory, address, bytes).map_err(|e| e.to_string())
    }

    pub fn start(&mut self) {
        for init_task in self.scheduler.init_tasks() {
            info!(task_id = init_task.id, "running INIT task");
        }
        self.started_ms = Some(self.hal.tick_ms());
        self.state = RuntimeState::Running;
        info!("runtime entering RUNNING state");
    }

    pub fn stop(&mut self) {
        self.memory.clear_opi();
        self.scheduler.halt_all(None);
        self.state = RuntimeState::Stopped;
        info!("runtime stopped");
    }

    fn enter_safe_state(&mut self, task_id: u16, fault: VmFault) {
        error!(task_id, %fault, "entering safe state");
        self.memory.clear_opi();
        self.scheduler.halt_all(Some((task_id, fault)));
        self.state = RuntimeState::SafeState;
    }

    /// Runs exactly one scan cycle in its five fixed phases, returning the
    /// wall-clock microseconds the cycle consumed (before pacing).
    pub fn run_one_cycle(&mut self) -> u32 {
        if self.state != RuntimeState::Running {
            return 0;
        }

        let cycle_start = std::time::Instant::now();
        let now_ms = self.hal.tick_ms();

        // 1. INPUT LATCH: copy HAL digital/analog inputs into IPI.
        for entry in &self.io_map {
            if entry.direction != IoDirection::In {
                continue;
            }
            let value: u16 = match entry.type_id {
                0 => self.hal.gpio_read(entry.channel).map(|b| b as u16).unwrap_or(0),
                _ => self.hal.adc_read(entry.channel).unwrap_or(0),
            };
            let ipi = self.memory.ipi_mut();
            let offset = entry.var_addr as usize;
            if offset + 2 <= ipi.len() {
                ipi[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            }

            if entry.flags & IO_FLAG_EVENT_SOURCE != 0 {
                let changed = self.edge_cache.insert(entry.var_addr, value) != Some(value);
                if changed {
                    self.scheduler.notify_event(entry.channel);
                }
            }
        }

        // 2. TASK EXECUTION: dispatch every ready task, highest priority first.
        if let Some(safe_state) = self.scheduler.dispatch_ready_tasks(now_ms, &mut self.memory) {
            self.enter_safe_state(safe_state.task_id, safe_state.fault);
            return cycle_start.elapsed().as_micros() as u32;
        }

        // 3. OUTPUT FLUSH: copy OPI back out to the HAL.
        for entry in &self.io_map {
            if entry.direction != IoDirection::Out {
                continue;
            }
            let offset = entry.var_addr.wrapping_sub(crate::memory::OPI_BASE as u16) as usize;
            let opi = self.memory.opi_bytes();
            if offset + 2 > opi.len() {
                continue;
            }
            let value = u16::from_le_bytes([opi[offset], opi[offset + 1]]);
            let result = match entry.type_id {
                0 => self.hal.gpio_write(entry.channel, value != 0),
                _ => self.hal.dac_write(entry.channel, value),
            };
            if let Err(e) = result {
                warn!(channel = entry.channel, error = %e, "output flush failed");
            }
        }

        // 4. HOUSEKEEPING: persist RETAIN if dirty, roll counters.
        if self.memory.retain_dirty() {
            self.persistence.flush_retain(&mut self.hal, self.memory.retain_bytes());
            self.memory.clear_retain_dirty();
        }
        self.cycle_count += 1;

        let elapsed_us = cycle_start.elapsed().as_micros() as u32;
        self.last_cycle_us = elapsed_us;
        if elapsed_us > self.cyclic_interval_us {
            self.overrun_count += 1;
        }

        // 5. PACING: sleep off whatever budget remains in this cycle's slot.
        if elapsed_us < self.cyclic_interval_us {
            self.hal.sleep((self.cyclic_interval_us - elapsed_us) / 1_000);
        }

        elapsed_us
    }

    pub fn run_forever(&mut self) {
        while self.state == RuntimeState::Running {
            self.run_one_cycle();
        }
    }
}
