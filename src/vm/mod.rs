//! Stack-machine core: per-task evaluation/call stacks, the fetch-decode-execute
//! loop, the opcode dispatch table, and the VM state machine.

use crate::decoder::{self, DecodeError, Decoded, Opcode, Operand};
use crate::memory::{MemoryError, MemoryMap};
use thiserror::Error;
use tracing::trace;

pub const EVAL_STACK_CAPACITY: usize = 256;
pub const CALL_STACK_CAPACITY: usize = 32;
pub const BREAKPOINT_CAPACITY: usize = 16;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum VmFault {
    #[error("evaluation stack overflow")]
    StackOverflow,
    #[error("evaluation stack underflow")]
    StackUnderflow,
    #[error("division by zero")]
    DivByZero,
    #[error("invalid opcode")]
    InvalidOpcode,
    #[error("memory access out of bounds")]
    OutOfBounds,
    #[error("call stack overflow")]
    CallOverflow,
    #[error("jump target is not a valid instruction boundary")]
    InvalidJump,
    #[error("task exceeded its watchdog budget")]
    Watchdog,
}

impl VmFault {
    /// The numeric wire code from the error taxonomy.
    pub const fn code(self) -> u8 {
        match self {
            VmFault::StackOverflow => 0x01,
            VmFault::StackUnderflow => 0x02,
            VmFault::DivByZero => 0x03,
            VmFault::InvalidOpcode => 0x04,
            VmFault::OutOfBounds => 0x05,
            VmFault::CallOverflow => 0x06,
            VmFault::InvalidJump => 0x07,
            VmFault::Watchdog => 0x08,
        }
    }
}

impl From<MemoryError> for VmFault {
    fn from(_: MemoryError) -> Self {
        VmFault::OutOfBounds
    }
}

impl From<DecodeError> for VmFault {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::InvalidOpcode(_) => VmFault::InvalidOpcode,
            DecodeError::Truncated => VmFault::InvalidJump,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Idle { halted: bool },
    Running,
    Paused,
    Error,
}

impl Default for VmState {
    fn default() -> Self {
        VmState::Idle { halted: false }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    return_pc: u32,
    base_pointer: u32,
}

/// What the fetch/execute loop should do after a single instruction retired.
enum StepOutcome {
    Continue,
    CycleComplete,
}

type OpFn = fn(&mut Vm, &mut MemoryMap, Operand) -> Result<StepOutcome, VmFault>;

/// One task's private VM instance: stacks, PC, state, breakpoints. Tasks never
/// share these; only the `MemoryMap` passed into `run` is shared.
pub struct Vm {
    eval_stack: Vec<i32>,
    call_stack: Vec<CallFrame>,
    pc: u32,
    base_pointer: u32,
    state: VmState,
    error: Option<(VmFault, u32)>,
    cycles: u64,
    breakpoints: Vec<u32>,
    ticks_ms: u32,
    op_functions: [OpFn; 256],
}

impl Vm {
    pub fn new(entry_pc: u32) -> Self {
        let mut vm = Vm {
            eval_stack: Vec::with_capacity(EVAL_STACK_CAPACITY),
            call_stack: Vec::with_capacity(CALL_STACK_CAPACITY),
            pc: entry_pc,
            base_pointer: 0,
            state: VmState::default(),
            error: None,
            cycles: 0,
            breakpoints: Vec::with_capacity(BREAKPOINT_CAPACITY),
            ticks_ms: 0,
            op_functions: [Vm::op_unimplemented; 256],
        };
        vm.init_op_functions();
        vm
    }

    fn init_op_functions(&mut self) {
        let f = &mut self.op_functions;
        f[Opcode::Nop as usize] = Vm::op_nop;
        f[Opcode::Halt as usize] = Vm::op_halt;
        f[Opcode::Break as usize] = Vm::op_break;
        f[Opcode::GetTicks as usize] = Vm::op_get_ticks;

        f[Opcode::Dup as usize] = Vm::op_dup;
        f[Opcode::Drop as usize] = Vm::op_drop;
        f[Opcode::Swap as usize] = Vm::op_swap;
        f[Opcode::Over as usize] = Vm::op_over;
        f[Opcode::Rot as usize] = Vm::op_rot;
        f[Opcode::Pick as usize] = Vm::op_pick;

        f[Opcode::LoadI8 as usize] = Vm::op_loadi::<1>;
        f[Opcode::LoadI16 as usize] = Vm::op_loadi::<2>;
        f[Opcode::LoadI32 as usize] = Vm::op_loadi::<4>;
        f[Opcode::StoreI8 as usize] = Vm::op_storei::<1>;
        f[Opcode::StoreI16 as usize] = Vm::op_storei::<2>;
        f[Opcode::StoreI32 as usize] = Vm::op_storei::<4>;

        f[Opcode::StrLen as usize] = Vm::op_strlen;
        f[Opcode::StrCpy as usize] = Vm::op_strcpy;
        f[Opcode::StrCat as usize] = Vm::op_strcat;
        f[Opcode::StrCmp as usize] = Vm::op_strcmp;
        f[Opcode::StrClr as usize] = Vm::op_strclr;

        f[Opcode::Load8 as usize] = Vm::op_load::<1>;
        f[Opcode::Load16 as usize] = Vm::op_load::<2>;
        f[Opcode::Load32 as usize] = Vm::op_load::<4>;
        f[Opcode::Load64 as usize] = Vm::op_load64;
        f[Opcode::Store8 as usize] = Vm::op_store::<1>;
        f[Opcode::Store16 as usize] = Vm::op_store::<2>;
        f[Opcode::Store32 as usize] = Vm::op_store::<4>;
        f[Opcode::Store64 as usize] = Vm::op_store64;

        f[Opcode::Add as usize] = Vm::op_add;
        f[Opcode::Sub as usize] = Vm::op_sub;
        f[Opcode::Mul as usize] = Vm::op_mul;
        f[Opcode::Div as usize] = Vm::op_div;
        f[Opcode::Mod as usize] = Vm::op_mod;
        f[Opcode::Neg as usize] = Vm::op_neg;
        f[Opcode::Abs as usize] = Vm::op_abs;

        f[Opcode::AddF as usize] = Vm::op_addf;
        f[Opcode::SubF as usize] = Vm::op_subf;
        f[Opcode::MulF as usize] = Vm::op_mulf;
        f[Opcode::DivF as usize] = Vm::op_divf;
        f[Opcode::NegF as usize] = Vm::op_negf;
        f[Opcode::AbsF as usize] = Vm::op_absf;

        f[Opcode::And as usize] = Vm::op_and;
        f[Opcode::Or as usize] = Vm::op_or;
        f[Opcode::Xor as usize] = Vm::op_xor;
        f[Opcode::Not as usize] = Vm::op_not;
        f[Opcode::Shl as usize] = Vm::op_shl;
        f[Opcode::Shr as usize] = Vm::op_shr;
        f[Opcode::Sar as usize] = Vm::op_sar;

        f[Opcode::Eq as usize] = Vm::op_eq;
        f[Opcode::Ne as usize] = Vm::op_ne;
        f[Opcode::Lt as usize] = Vm::op_lt;
        f[Opcode::Le as usize] = Vm::op_le;
        f[Opcode::Gt as usize] = Vm::op_gt;
        f[Opcode::Ge as usize] = Vm::op_ge;
        f[Opcode::Ltu as usize] = Vm::op_ltu;
        f[Opcode::Gtu as usize] = Vm::op_gtu;

        f[Opcode::Push8 as usize] = Vm::op_push8;
        f[Opcode::Push16 as usize] = Vm::op_push16;
        f[Opcode::Push32 as usize] = Vm::op_push32;

        f[Opcode::Jr as usize] = Vm::op_jr;
        f[Opcode::Jrz as usize] = Vm::op_jrz;
        f[Opcode::Jrnz as usize] = Vm::op_jrnz;
        f[Opcode::Jmp as usize] = Vm::op_jmp;
        f[Opcode::Jz as usize] = Vm::op_jz;
        f[Opcode::Jnz as usize] = Vm::op_jnz;
        f[Opcode::Call as usize] = Vm::op_call;
        f[Opcode::Ret as usize] = Vm::op_ret;

        f[Opcode::I2F as usize] = Vm::op_i2f;
        f[Opcode::F2I as usize] = Vm::op_f2i;
        f[Opcode::I2B as usize] = Vm::op_i2b;
        f[Opcode::Ext8 as usize] = Vm::op_ext::<8>;
        f[Opcode::Ext16 as usize] = Vm::op_ext::<16>;
        f[Opcode::Zext8 as usize] = Vm::op_zext::<8>;
        f[Opcode::Zext16 as usize] = Vm::op_zext::<16>;
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    pub fn sp(&self) -> usize {
        self.eval_stack.len()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn error(&self) -> Option<(VmFault, u32)> {
        self.error
    }

    pub fn top_of_stack(&self) -> Option<i32> {
        self.eval_stack.last().copied()
    }

    pub fn set_ticks_ms(&mut self, ticks_ms: u32) {
        self.ticks_ms = ticks_ms;
    }

    pub fn start(&mut self) {
        if matches!(self.state, VmState::Idle { .. }) {
            self.state = VmState::Running;
        }
    }

    pub fn reset(&mut self, entry_pc: u32) {
        self.eval_stack.clear();
        self.call_stack.clear();
        self.pc = entry_pc;
        self.base_pointer = 0;
        self.error = None;
        self.state = VmState::default();
    }

    pub fn pause(&mut self) {
        if self.state == VmState::Running {
            self.state = VmState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == VmState::Paused {
            self.state = VmState::Running;
        }
    }

    /// Forces the VM out of whatever it's doing into a halted state,
    /// unconditionally — unlike `pause`, which only takes effect while
    /// `Running`. With `fault` set, the halt surfaces as an error at the
    /// current `pc`; with `None`, it's a plain idle halt (e.g. an operator
    /// `stop`).
    pub fn halt(&mut self, fault: Option<VmFault>) {
        match fault {
            Some(f) => {
                self.error = Some((f, self.pc));
                self.state = VmState::Error;
            }
            None => {
                self.state = VmState::Idle { halted: true };
            }
        }
    }

    pub fn set_breakpoint(&mut self, pc: u32) -> Result<(), VmFault> {
        if self.breakpoints.contains(&pc) {
            return Ok(());
        }
        if self.breakpoints.len() >= BREAKPOINT_CAPACITY {
            return Err(VmFault::OutOfBounds);
        }
        self.breakpoints.push(pc);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, pc: u32) {
        self.breakpoints.retain(|&bp| bp != pc);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> &[u32] {
        &self.breakpoints
    }

    /// Executes exactly one instruction, leaving the VM paused.
    pub fn step(&mut self, memory: &mut MemoryMap) {
        let was_running = self.state == VmState::Running;
        if !was_running {
            self.state = VmState::Running;
        }
        self.execute_one(memory);
        if self.state == VmState::Running {
            self.state = VmState::Paused;
        }
    }

    /// Runs until HALT, a top-level RET, an error, a breakpoint hit, or
    /// `should_preempt` reports true at an instruction boundary.
    pub fn run(&mut self, memory: &mut MemoryMap, mut should_preempt: impl FnMut() -> bool) {
        loop {
            if self.state != VmState::Running {
                return;
            }
            if self.breakpoints.contains(&self.pc) {
                trace!(pc = self.pc, "breakpoint hit");
                self.state = VmState::Paused;
                return;
            }
            self.execute_one(memory);
            match self.state {
                VmState::Running => {}
                _ => return,
            }
            if should_preempt() {
                self.state = VmState::Paused;
                return;
            }
        }
    }

    fn execute_one(&mut self, memory: &mut MemoryMap) {
        let decoded = match decoder::decode(memory.code_slice(), self.pc) {
            Ok(d) => d,
            Err(e) => {
                self.fail(e.into());
                return;
            }
        };
        let Decoded { opcode, operand, next_pc } = decoded;
        self.pc = next_pc;
        let op_fn = self.op_functions[opcode as usize];
        match op_fn(self, memory, operand) {
            Ok(StepOutcome::Continue) => {
                self.cycles += 1;
            }
            Ok(StepOutcome::CycleComplete) => {
                self.cycles += 1;
                self.state = VmState::Idle { halted: true };
            }
            Err(fault) => {
                self.fail(fault);
            }
        }
    }

    fn fail(&mut self, fault: VmFault) {
        self.error = Some((fault, self.pc));
        self.state = VmState::Error;
    }

    // -- stack helpers --------------------------------------------------

    fn push(&mut self, value: i32) -> Result<(), VmFault> {
        if self.eval_stack.len() >= EVAL_STACK_CAPACITY {
            return Err(VmFault::StackOverflow);
        }
        self.eval_stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<i32, VmFault> {
        self.eval_stack.pop().ok_or(VmFault::StackUnderflow)
    }

    fn peek_top(&self) -> Result<i32, VmFault> {
        self.eval_stack.last().copied().ok_or(VmFault::StackUnderflow)
    }

    fn jump_to(&mut self, target: u32, memory: &MemoryMap) -> Result<(), VmFault> {
        if target as usize >= memory.code_slice().len() {
            return Err(VmFault::InvalidJump);
        }
        // A target is valid if it is itself a decodable instruction start.
        decoder::decode(memory.code_slice(), target).map_err(|_| VmFault::InvalidJump)?;
        self.pc = target;
        Ok(())
    }

    // -- opcode implementations ------------------------------------------

    fn op_unimplemented(_vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Err(VmFault::InvalidOpcode)
    }

    fn op_nop(_vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Ok(StepOutcome::Continue)
    }

    fn op_halt(_vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Ok(StepOutcome::CycleComplete)
    }

    fn op_break(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        vm.state = VmState::Paused;
        Ok(StepOutcome::Continue)
    }

    fn op_get_ticks(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        vm.push(vm.ticks_ms as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_dup(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.peek_top()?;
        vm.push(v)?;
        Ok(StepOutcome::Continue)
    }

    fn op_drop(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        vm.pop()?;
        Ok(StepOutcome::Continue)
    }

    fn op_swap(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(b)?;
        vm.push(a)?;
        Ok(StepOutcome::Continue)
    }

    fn op_over(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let len = vm.eval_stack.len();
        let v = *vm.eval_stack.get(len.wrapping_sub(2)).ok_or(VmFault::StackUnderflow)?;
        vm.push(v)
            .map(|_| StepOutcome::Continue)
    }

    fn op_rot(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let c = vm.pop()?;
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(b)?;
        vm.push(c)?;
        vm.push(a)?;
        Ok(StepOutcome::Continue)
    }

    fn op_pick(vm: &mut Vm, _mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let n = expect_u8(op) as usize;
        let len = vm.eval_stack.len();
        let idx = len.checked_sub(1 + n).ok_or(VmFault::StackUnderflow)?;
        let v = vm.eval_stack[idx];
        vm.push(v)?;
        Ok(StepOutcome::Continue)
    }

    /// Forth-style fetch: `( addr -- value )`.
    fn op_loadi<const SIZE: usize>(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = vm.pop()? as u16 as u32;
        let v = mem.read::<SIZE>(addr)?;
        vm.push(v as i32)?;
        Ok(StepOutcome::Continue)
    }

    /// Forth-style store: `( value addr -- )`.
    fn op_storei<const SIZE: usize>(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = vm.pop()? as u16 as u32;
        let value = vm.pop()?;
        mem.write::<SIZE>(addr, value as u32 as u64)?;
        Ok(StepOutcome::Continue)
    }

    fn op_load<const SIZE: usize>(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = expect_u16(op) as u32;
        let v = mem.read::<SIZE>(addr)?;
        vm.push(v as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_store<const SIZE: usize>(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = expect_u16(op) as u32;
        let value = vm.pop()?;
        mem.write::<SIZE>(addr, value as u32 as u64)?;
        Ok(StepOutcome::Continue)
    }

    fn op_load64(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = expect_u16(op) as u32;
        let v = mem.read::<8>(addr)?;
        vm.push((v & 0xFFFF_FFFF) as i32)?;
        vm.push((v >> 32) as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_store64(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = expect_u16(op) as u32;
        let hi = vm.pop()? as u32;
        let lo = vm.pop()? as u32;
        let value = (lo as u64) | ((hi as u64) << 32);
        mem.write::<8>(addr, value)?;
        Ok(StepOutcome::Continue)
    }

    fn binop_i32(vm: &mut Vm, f: fn(i32, i32) -> i32) -> Result<StepOutcome, VmFault> {
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(f(a, b))?;
        Ok(StepOutcome::Continue)
    }

    fn unop_i32(vm: &mut Vm, f: fn(i32) -> i32) -> Result<StepOutcome, VmFault> {
        let a = vm.pop()?;
        vm.push(f(a))?;
        Ok(StepOutcome::Continue)
    }

    fn binop_f32(vm: &mut Vm, f: fn(f32, f32) -> f32) -> Result<StepOutcome, VmFault> {
        let b = f32::from_bits(vm.pop()? as u32);
        let a = f32::from_bits(vm.pop()? as u32);
        vm.push(f(a, b).to_bits() as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn unop_f32(vm: &mut Vm, f: fn(f32) -> f32) -> Result<StepOutcome, VmFault> {
        let a = f32::from_bits(vm.pop()? as u32);
        vm.push(f(a).to_bits() as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn compare_i32(vm: &mut Vm, f: fn(i32, i32) -> bool) -> Result<StepOutcome, VmFault> {
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(if f(a, b) { 1 } else { 0 })?;
        Ok(StepOutcome::Continue)
    }

    fn compare_u32(vm: &mut Vm, f: fn(u32, u32) -> bool) -> Result<StepOutcome, VmFault> {
        let b = vm.pop()? as u32;
        let a = vm.pop()? as u32;
        vm.push(if f(a, b) { 1 } else { 0 })?;
        Ok(StepOutcome::Continue)
    }

    fn op_add(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, i32::wrapping_add)
    }

    fn op_sub(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, i32::wrapping_sub)
    }

    fn op_mul(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, i32::wrapping_mul)
    }

    fn op_neg(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::unop_i32(vm, i32::wrapping_neg)
    }

    fn op_abs(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::unop_i32(vm, i32::wrapping_abs)
    }

    fn op_addf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_f32(vm, |a, b| a + b)
    }

    fn op_subf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_f32(vm, |a, b| a - b)
    }

    fn op_mulf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_f32(vm, |a, b| a * b)
    }

    fn op_divf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        // IEEE-754 division: x/0.0 yields +/-inf, 0.0/0.0 yields NaN; never an error.
        Vm::binop_f32(vm, |a, b| a / b)
    }

    fn op_negf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::unop_f32(vm, |a| -a)
    }

    fn op_absf(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::unop_f32(vm, f32::abs)
    }

    fn op_and(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| a & b)
    }

    fn op_or(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| a | b)
    }

    fn op_xor(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| a ^ b)
    }

    fn op_not(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::unop_i32(vm, |a| !a)
    }

    fn op_shl(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| a.wrapping_shl(b as u32 & 31))
    }

    fn op_shr(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| ((a as u32).wrapping_shr(b as u32 & 31)) as i32)
    }

    fn op_sar(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::binop_i32(vm, |a, b| a.wrapping_shr(b as u32 & 31))
    }

    fn op_eq(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a == b)
    }

    fn op_ne(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a != b)
    }

    fn op_lt(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a < b)
    }

    fn op_le(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a <= b)
    }

    fn op_gt(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a > b)
    }

    fn op_ge(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_i32(vm, |a, b| a >= b)
    }

    fn op_ltu(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_u32(vm, |a, b| a < b)
    }

    fn op_gtu(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        Vm::compare_u32(vm, |a, b| a > b)
    }

    fn op_div(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let b = vm.peek_top()?;
        if b == 0 {
            return Err(VmFault::DivByZero);
        }
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(a.wrapping_div(b))?;
        Ok(StepOutcome::Continue)
    }

    fn op_mod(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let b = vm.peek_top()?;
        if b == 0 {
            return Err(VmFault::DivByZero);
        }
        let b = vm.pop()?;
        let a = vm.pop()?;
        vm.push(a.wrapping_rem(b))?;
        Ok(StepOutcome::Continue)
    }

    fn op_push8(vm: &mut Vm, _mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        vm.push(expect_u8(op) as i8 as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_push16(vm: &mut Vm, _mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        vm.push(expect_u16(op) as i16 as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_push32(vm: &mut Vm, _mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        vm.push(expect_u32(op) as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_jr(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let offset = expect_u8(op) as i8 as i32;
        let target = (vm.pc as i32 + offset) as u32;
        vm.jump_to(target, mem)?;
        Ok(StepOutcome::Continue)
    }

    fn op_jrz(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let offset = expect_u8(op) as i8 as i32;
        let v = vm.pop()?;
        if v == 0 {
            let target = (vm.pc as i32 + offset) as u32;
            vm.jump_to(target, mem)?;
        }
        Ok(StepOutcome::Continue)
    }

    fn op_jrnz(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let offset = expect_u8(op) as i8 as i32;
        let v = vm.pop()?;
        if v != 0 {
            let target = (vm.pc as i32 + offset) as u32;
            vm.jump_to(target, mem)?;
        }
        Ok(StepOutcome::Continue)
    }

    fn op_jmp(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        vm.jump_to(expect_u16(op) as u32, mem)?;
        Ok(StepOutcome::Continue)
    }

    fn op_jz(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        if v == 0 {
            vm.jump_to(expect_u16(op) as u32, mem)?;
        }
        Ok(StepOutcome::Continue)
    }

    fn op_jnz(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        if v != 0 {
            vm.jump_to(expect_u16(op) as u32, mem)?;
        }
        Ok(StepOutcome::Continue)
    }

    fn op_call(vm: &mut Vm, mem: &mut MemoryMap, op: Operand) -> Result<StepOutcome, VmFault> {
        if vm.call_stack.len() >= CALL_STACK_CAPACITY {
            return Err(VmFault::CallOverflow);
        }
        vm.call_stack.push(CallFrame { return_pc: vm.pc, base_pointer: vm.base_pointer });
        vm.base_pointer = vm.eval_stack.len() as u32;
        vm.jump_to(expect_u16(op) as u32, mem)?;
        Ok(StepOutcome::Continue)
    }

    fn op_ret(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        match vm.call_stack.pop() {
            Some(frame) => {
                vm.pc = frame.return_pc;
                vm.base_pointer = frame.base_pointer;
                Ok(StepOutcome::Continue)
            }
            None => Ok(StepOutcome::CycleComplete),
        }
    }

    fn op_i2f(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        vm.push((v as f32).to_bits() as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_f2i(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        let f = f32::from_bits(v as u32);
        vm.push(f as i32)?;
        Ok(StepOutcome::Continue)
    }

    fn op_i2b(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        vm.push(if v == 0 { 0 } else { 1 })?;
        Ok(StepOutcome::Continue)
    }

    fn op_ext<const BITS: u32>(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()?;
        let shift = 32 - BITS;
        vm.push((v << shift) >> shift)?;
        Ok(StepOutcome::Continue)
    }

    fn op_zext<const BITS: u32>(vm: &mut Vm, _mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let v = vm.pop()? as u32;
        let mask = (1u32 << BITS) - 1;
        vm.push((v & mask) as i32)?;
        Ok(StepOutcome::Continue)
    }

    // -- string opcodes ---------------------------------------------------
    // STRING layout: u16 current_len; u16 max_capacity; u8 data[max_capacity+1].

    fn string_len_and_cap(mem: &MemoryMap, addr: u32) -> Result<(u16, u16), VmFault> {
        let len = mem.read::<2>(addr)? as u16;
        let cap = mem.read::<2>(addr + 2)? as u16;
        Ok((len, cap))
    }

    fn read_string(mem: &MemoryMap, addr: u32) -> Result<Vec<u8>, VmFault> {
        let (len, _cap) = Self::string_len_and_cap(mem, addr)?;
        Ok(mem.peek(addr + 4, len as usize)?)
    }

    fn write_string(mem: &mut MemoryMap, addr: u32, bytes: &[u8]) -> Result<(), VmFault> {
        let (_len, cap) = Self::string_len_and_cap(mem, addr)?;
        let written = bytes.len().min(cap as usize);
        mem.write::<2>(addr, written as u64)?;
        mem.poke(addr + 4, &bytes[..written])?;
        mem.poke(addr + 4 + written as u32, &[0])?;
        Ok(())
    }

    fn op_strlen(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = vm.pop()? as u16 as u32;
        let (len, _) = Vm::string_len_and_cap(mem, addr)?;
        vm.push(len as i32)?;
        Ok(StepOutcome::Continue)
    }

    /// `( dst_addr src_addr -- )`.
    fn op_strcpy(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let src = vm.pop()? as u16 as u32;
        let dst = vm.pop()? as u16 as u32;
        let data = Vm::read_string(mem, src)?;
        Vm::write_string(mem, dst, &data)?;
        Ok(StepOutcome::Continue)
    }

    /// `( dst_addr src_addr -- )`, appended and truncated to `dst`'s capacity.
    fn op_strcat(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let src = vm.pop()? as u16 as u32;
        let dst = vm.pop()? as u16 as u32;
        let mut data = Vm::read_string(mem, dst)?;
        data.extend(Vm::read_string(mem, src)?);
        Vm::write_string(mem, dst, &data)?;
        Ok(StepOutcome::Continue)
    }

    /// `( addr_a addr_b -- result )`, result in {-1,0,1}.
    fn op_strcmp(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let b = vm.pop()? as u16 as u32;
        let a = vm.pop()? as u16 as u32;
        let sa = Vm::read_string(mem, a)?;
        let sb = Vm::read_string(mem, b)?;
        let result = match sa.cmp(&sb) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        };
        vm.push(result)?;
        Ok(StepOutcome::Continue)
    }

    fn op_strclr(vm: &mut Vm, mem: &mut MemoryMap, _op: Operand) -> Result<StepOutcome, VmFault> {
        let addr = vm.pop()? as u16 as u32;
        Vm::write_string(mem, addr, &[])?;
        Ok(StepOutcome::Continue)
    }
}

fn expect_u8(op: Operand) -> u8 {
    match op {
        Operand::U8(v) => v,
        _ => 0,
    }
}

fn expect_u16(op: Operand) -> u16 {
    match op {
        Operand::U16(v) => v,
        _ => 0,
    }
}

fn expect_u32(op: Operand) -> u32 {
    match op {
        Operand::U32(v) => v,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CODE_MIN_SIZE, IPI_BASE, OPI_BASE};

    fn new_mem(code: &[u8]) -> MemoryMap {
        let mut mem = MemoryMap::new(CODE_MIN_SIZE as usize);
        mem.load_code(code);
        mem
    }

    fn run_to_completion(vm: &mut Vm, mem: &mut MemoryMap) {
        vm.start();
        vm.run(mem, || false);
    }

    #[test]
    fn addition_reads_two_inputs_and_writes_the_sum_to_opi() {
        // LOAD16 0x0000; LOAD16 0x0002; ADD; STORE16 0x1000; HALT
        let code = [0x81, 0x00, 0x00, 0x81, 0x02, 0x00, 0x20, 0x85, 0x00, 0x10, 0x01];
        let mut mem = new_mem(&code);
        mem.ipi_mut()[0..2].copy_from_slice(&7i16.to_le_bytes());
        mem.ipi_mut()[2..4].copy_from_slice(&35i16.to_le_bytes());
        let mut vm = Vm::new(0);
        run_to_completion(&mut vm, &mut mem);
        assert_eq!(vm.state(), VmState::Idle { halted: true });
        let sum = mem.peek(OPI_BASE, 2).unwrap();
        assert_eq!(i16::from_le_bytes([sum[0], sum[1]]), 42);
    }

    #[test]
    fn conditional_jump_skips_the_false_branch() {
        // PUSH8 0 ; JZ skip(10) ; PUSH8 99 ; STORE8 WORK ; skip: NOP ; HALT
        let store_addr = crate::memory::WORK_BASE;
        let mut code = vec![Opcode::Push8 as u8, 0x00, Opcode::Jz as u8, 10, 0, Opcode::Push8 as u8, 0x63, Opcode::Store8 as u8];
        code.extend_from_slice(&(store_addr as u16).to_le_bytes());
        code.push(Opcode::Nop as u8); // offset 10 — the jump target
        code.push(Opcode::Halt as u8);
        let mut mem = new_mem(&code);
        let mut vm = Vm::new(0);
        run_to_completion(&mut vm, &mut mem);
        assert_eq!(vm.state(), VmState::Idle { halted: true });
        assert_eq!(mem.peek(store_addr, 1).unwrap(), vec![0]);
    }

    #[test]
    fn division_by_zero_faults_without_disturbing_the_stack() {
        // PUSH8 10 ; PUSH8 0 ; DIV
        let code = [0x40, 0x0A, 0x40, 0x00, Opcode::Div as u8];
        let mut mem = new_mem(&code);
        let mut vm = Vm::new(0);
        run_to_completion(&mut vm, &mut mem);
        assert_eq!(vm.state(), VmState::Error);
        assert_eq!(vm.error().map(|(f, _)| f), Some(VmFault::DivByZero));
        assert_eq!(vm.sp(), 2); // both operands remain, untouched
    }

    #[test]
    fn breakpoint_halts_execution_before_the_marked_instruction() {
        let code = [0x00, 0x00, 0x00, 0x01]; // NOP NOP NOP HALT
        let mut mem = new_mem(&code);
        let mut vm = Vm::new(0);
        vm.set_breakpoint(2).unwrap();
        run_to_completion(&mut vm, &mut mem);
        assert_eq!(vm.state(), VmState::Paused);
        assert_eq!(vm.pc(), 2);
        vm.remove_breakpoint(2); // a real debug client steps off or clears before resuming
        vm.resume();
        vm.run(&mut mem, || false);
        assert_eq!(vm.state(), VmState::Idle { halted: true });
    }

    #[test]
    fn should_preempt_suspends_mid_run_and_resume_continues_from_there() {
        let code = [0x00, 0x00, 0x00, 0x00, 0x01]; // four NOPs then HALT
        let mut mem = new_mem(&code);
        let mut vm = Vm::new(0);
        vm.start();
        let mut calls = 0;
        vm.run(&mut mem, || {
            calls += 1;
            calls == 2 // preempt after the second instruction retires
        });
        assert_eq!(vm.state(), VmState::Paused);
        assert_eq!(vm.pc(), 2);
        vm.resume();
        vm.run(&mut mem, || false);
        assert_eq!(vm.state(), VmState::Idle { halted: true });
    }

    #[test]
    fn ipi_base_is_zero_and_writes_there_are_rejected() {
        let mut mem = new_mem(&[0x01]);
        assert_eq!(mem.write::<2>(IPI_BASE, 1), Err(MemoryError::NotWritable));
    }
}
